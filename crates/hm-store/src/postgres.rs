//! PostgreSQL store gateway.
//!
//! Holds one exclusive connection and a private current-thread runtime, so
//! every call blocks until the server answers. Batch writes bind whole
//! columns as arrays and expand them with `UNNEST`; datapoints stream through
//! `COPY ... FROM STDIN` in text format.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgCopyIn};
use sqlx::query::QueryScalar;
use sqlx::{ConnectOptions, Connection, Postgres};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use hm_common::{DataRow, InstrumentId, InstrumentIdentity, InstrumentRef};
use hm_config::StoreConfig;

use crate::error::StoreError;
use crate::gateway::{
    CopyWriter, CountScope, EnumSequence, EnumValueRow, ParameterRow, PurgeReport,
    SequentialEnumRow, StoreGateway,
};

const COPY_DATA_SQL: &str = "COPY public.data (time, instrument_id, param_id, value_num, value_text) \
     FROM STDIN WITH (FORMAT text)";

const UPSERT_INSTRUMENT_SQL: &str = r#"
    INSERT INTO public.instruments (instrument, serial, model, name, template, server)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (instrument) DO UPDATE SET
        serial = EXCLUDED.serial,
        model = EXCLUDED.model,
        name = EXCLUDED.name,
        template = EXCLUDED.template,
        server = EXCLUDED.server
    RETURNING id, name
"#;

const INSERT_PARAMETERS_SQL: &str = r#"
    INSERT INTO public.parameters (
        instrument_id, param_id, subsystem, component, param_name, display_name,
        display_unit, storage_unit, display_scale, enum_id, value_type
    )
    SELECT $1, * FROM UNNEST(
        $2::int4[], $3::text[], $4::text[], $5::text[], $6::text[],
        $7::text[], $8::text[], $9::text[], $10::int4[], $11::text[]
    )
    ON CONFLICT (instrument_id, param_id) DO NOTHING
"#;

const INSERT_ROWS_SQL: &str = r#"
    INSERT INTO public.data (time, instrument_id, param_id, value_num, value_text)
    SELECT t, i, p, n::double precision, x
    FROM UNNEST($1::timestamptz[], $2::int4[], $3::int4[], $4::text[], $5::text[])
        AS u(t, i, p, n, x)
    ON CONFLICT DO NOTHING
"#;

/// Gateway over a single PostgreSQL connection.
pub struct PostgresStore {
    runtime: Runtime,
    conn: PgConnection,
    in_transaction: bool,
}

impl PostgresStore {
    /// Connect to `database` with the given settings. The password must be set.
    pub fn connect(config: &StoreConfig, database: &str) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(StoreError::Runtime)?;

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(config.password()?)
            .database(database)
            .application_name(&config.application_name);

        let conn = runtime
            .block_on(options.connect())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(
            host = %config.host,
            port = config.port,
            database,
            "connected to store"
        );
        Ok(Self {
            runtime,
            conn,
            in_transaction: false,
        })
    }

    /// Close the connection, letting the server roll back anything open.
    pub fn close(self) -> Result<(), StoreError> {
        let Self { runtime, conn, .. } = self;
        runtime.block_on(conn.close())?;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<u64, StoreError> {
        let done = self
            .runtime
            .block_on(sqlx::raw_sql(sql).execute(&mut self.conn))?;
        Ok(done.rows_affected())
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, StoreError> {
        let exists: bool = self.runtime.block_on(
            sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(format!("public.{table}"))
                .fetch_one(&mut self.conn),
        )?;
        Ok(exists)
    }
}

impl StoreGateway for PostgresStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        if self.in_transaction {
            return Err(StoreError::TransactionActive);
        }
        self.execute("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        self.in_transaction = false;
        self.execute("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        self.in_transaction = false;
        self.execute("ROLLBACK")?;
        debug!("transaction rolled back");
        Ok(())
    }

    fn upsert_instrument(&mut self, identity: &InstrumentIdentity) -> Result<InstrumentRef, StoreError> {
        let (id, name): (i32, String) = self.runtime.block_on(
            sqlx::query_as(UPSERT_INSTRUMENT_SQL)
                .bind(&identity.instrument)
                .bind(identity.serial)
                .bind(&identity.model)
                .bind(&identity.name)
                .bind(&identity.template)
                .bind(&identity.server)
                .fetch_one(&mut self.conn),
        )?;
        Ok(InstrumentRef {
            id: InstrumentId(id),
            name,
        })
    }

    fn enum_sequence(&mut self, instrument_id: InstrumentId) -> Result<EnumSequence, StoreError> {
        let rows: Vec<(String, i32)> = self.runtime.block_on(
            sqlx::query_as(
                "SELECT enum, MIN(enum_id) FROM public.enumerations \
                 WHERE instrument_id = $1 GROUP BY enum",
            )
            .bind(instrument_id.0)
            .fetch_all(&mut self.conn),
        )?;
        Ok(EnumSequence::from_assigned(rows.into_iter().collect()))
    }

    fn insert_sequential_enums(
        &mut self,
        instrument_id: InstrumentId,
        rows: &[SequentialEnumRow],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let enum_ids: Vec<i32> = rows.iter().map(|r| r.enum_id).collect();
        let enums: Vec<&str> = rows.iter().map(|r| r.enum_name.as_str()).collect();
        let names: Vec<&str> = rows.iter().map(|r| r.member_name.as_str()).collect();
        let values: Vec<i32> = rows.iter().map(|r| r.value).collect();

        let done = self.runtime.block_on(
            sqlx::query(
                "INSERT INTO public.enumerations (instrument_id, enum_id, enum, name, value) \
                 SELECT $1, * FROM UNNEST($2::int4[], $3::text[], $4::text[], $5::int4[]) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(instrument_id.0)
            .bind(&enum_ids)
            .bind(&enums)
            .bind(&names)
            .bind(&values)
            .execute(&mut self.conn),
        )?;
        Ok(done.rows_affected())
    }

    fn upsert_enum_types(
        &mut self,
        instrument_id: InstrumentId,
        names: &[&str],
    ) -> Result<HashMap<String, i32>, StoreError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        self.runtime.block_on(
            sqlx::query(
                "INSERT INTO public.enum_types (instrument_id, name) \
                 SELECT $1, UNNEST($2::text[]) \
                 ON CONFLICT (instrument_id, name) DO NOTHING",
            )
            .bind(instrument_id.0)
            .bind(names)
            .execute(&mut self.conn),
        )?;

        let rows: Vec<(String, i32)> = self.runtime.block_on(
            sqlx::query_as(
                "SELECT name, id FROM public.enum_types \
                 WHERE instrument_id = $1 AND name = ANY($2)",
            )
            .bind(instrument_id.0)
            .bind(names)
            .fetch_all(&mut self.conn),
        )?;
        Ok(rows.into_iter().collect())
    }

    fn insert_enum_values(&mut self, rows: &[EnumValueRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let enum_ids: Vec<i32> = rows.iter().map(|r| r.enum_id).collect();
        let names: Vec<&str> = rows.iter().map(|r| r.member_name.as_str()).collect();
        let values: Vec<i32> = rows.iter().map(|r| r.value).collect();

        let done = self.runtime.block_on(
            sqlx::query(
                "INSERT INTO public.enum_values (enum_id, member_name, value) \
                 SELECT * FROM UNNEST($1::int4[], $2::text[], $3::int4[]) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(&enum_ids)
            .bind(&names)
            .bind(&values)
            .execute(&mut self.conn),
        )?;
        Ok(done.rows_affected())
    }

    fn insert_parameters(
        &mut self,
        instrument_id: InstrumentId,
        rows: &[ParameterRow<'_>],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let param_ids: Vec<i32> = rows.iter().map(|r| r.record.param_id.0).collect();
        let subsystems: Vec<Option<&str>> =
            rows.iter().map(|r| r.record.subsystem.as_deref()).collect();
        let components: Vec<Option<&str>> =
            rows.iter().map(|r| r.record.component.as_deref()).collect();
        let names: Vec<&str> = rows.iter().map(|r| r.record.name.as_str()).collect();
        let display_names: Vec<Option<&str>> =
            rows.iter().map(|r| r.record.display_name.as_deref()).collect();
        let display_units: Vec<Option<&str>> =
            rows.iter().map(|r| r.record.display_unit.as_deref()).collect();
        let storage_units: Vec<Option<&str>> =
            rows.iter().map(|r| r.record.storage_unit.as_deref()).collect();
        let display_scales: Vec<Option<&str>> =
            rows.iter().map(|r| r.record.display_scale.as_deref()).collect();
        let enum_ids: Vec<Option<i32>> = rows.iter().map(|r| r.enum_ref.map(|e| e.0)).collect();
        let value_types: Vec<&str> = rows.iter().map(|r| r.record.value_type.as_str()).collect();

        let done = self.runtime.block_on(
            sqlx::query(INSERT_PARAMETERS_SQL)
                .bind(instrument_id.0)
                .bind(&param_ids)
                .bind(&subsystems)
                .bind(&components)
                .bind(&names)
                .bind(&display_names)
                .bind(&display_units)
                .bind(&storage_units)
                .bind(&display_scales)
                .bind(&enum_ids)
                .bind(&value_types)
                .execute(&mut self.conn),
        )?;
        Ok(done.rows_affected())
    }

    fn copy_in(&mut self) -> Result<Box<dyn CopyWriter + '_>, StoreError> {
        let copy = self.runtime.block_on(self.conn.copy_in_raw(COPY_DATA_SQL))?;
        Ok(Box::new(PgCopy {
            runtime: &self.runtime,
            copy,
        }))
    }

    fn insert_rows(&mut self, rows: &[DataRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let times: Vec<DateTime<Utc>> = rows.iter().map(|r| r.time).collect();
        let instruments: Vec<i32> = rows.iter().map(|r| r.instrument_id.0).collect();
        let params: Vec<i32> = rows.iter().map(|r| r.param_id.0).collect();
        let numeric: Vec<Option<&str>> = rows.iter().map(|r| r.value.numeric()).collect();
        let text: Vec<Option<&str>> = rows.iter().map(|r| r.value.text()).collect();

        let done = self.runtime.block_on(
            sqlx::query(INSERT_ROWS_SQL)
                .bind(&times)
                .bind(&instruments)
                .bind(&params)
                .bind(&numeric)
                .bind(&text)
                .execute(&mut self.conn),
        )?;
        Ok(done.rows_affected())
    }

    fn count_rows(&mut self, scope: &CountScope) -> Result<u64, StoreError> {
        let query: QueryScalar<'_, Postgres, i64, PgArguments> = match *scope {
            CountScope::Instruments => sqlx::query_scalar("SELECT COUNT(*) FROM public.instruments"),
            CountScope::EnumTypes(id) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM public.enum_types WHERE instrument_id = $1")
                    .bind(id.0)
            }
            CountScope::EnumValues(id) => sqlx::query_scalar(
                "SELECT COUNT(*) FROM public.enum_values v \
                 JOIN public.enum_types t ON t.id = v.enum_id WHERE t.instrument_id = $1",
            )
            .bind(id.0),
            CountScope::SequentialEnums(id) => sqlx::query_scalar(
                "SELECT COUNT(DISTINCT enum_id) FROM public.enumerations WHERE instrument_id = $1",
            )
            .bind(id.0),
            CountScope::SequentialMembers(id) => sqlx::query_scalar(
                "SELECT COUNT(*) FROM public.enumerations WHERE instrument_id = $1",
            )
            .bind(id.0),
            CountScope::Parameters(id) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM public.parameters WHERE instrument_id = $1")
                    .bind(id.0)
            }
            CountScope::Data {
                instrument_id,
                after,
            } => sqlx::query_scalar(
                "SELECT COUNT(*) FROM public.data \
                 WHERE ($1::int4 IS NULL OR instrument_id = $1) \
                 AND ($2::timestamptz IS NULL OR time > $2)",
            )
            .bind(instrument_id.map(|id| id.0))
            .bind(after),
        };
        let count: i64 = self.runtime.block_on(query.fetch_one(&mut self.conn))?;
        Ok(count.max(0) as u64)
    }

    fn purge_instrument(
        &mut self,
        serial: i64,
        before: Option<DateTime<Utc>>,
    ) -> Result<PurgeReport, StoreError> {
        let id: Option<i32> = self.runtime.block_on(
            sqlx::query_scalar("SELECT id FROM public.instruments WHERE serial = $1")
                .bind(serial)
                .fetch_optional(&mut self.conn),
        )?;
        let id = id.ok_or(StoreError::UnknownSerial(serial))?;
        let mut report = PurgeReport {
            serial,
            instrument_id: Some(InstrumentId(id)),
            ..PurgeReport::default()
        };

        let delete = |sql: &'static str| sqlx::query::<Postgres>(sql).bind(id);

        if let Some(cutoff) = before {
            let done = self.runtime.block_on(
                sqlx::query("DELETE FROM public.data WHERE instrument_id = $1 AND time < $2")
                    .bind(id)
                    .bind(cutoff)
                    .execute(&mut self.conn),
            )?;
            report.data_rows = done.rows_affected();
            info!(serial, %cutoff, rows = report.data_rows, "deleted datapoints older than cutoff");
            return Ok(report);
        }

        report.data_rows = self
            .runtime
            .block_on(delete("DELETE FROM public.data WHERE instrument_id = $1").execute(&mut self.conn))?
            .rows_affected();
        report.parameters = self
            .runtime
            .block_on(
                delete("DELETE FROM public.parameters WHERE instrument_id = $1")
                    .execute(&mut self.conn),
            )?
            .rows_affected();

        if self.table_exists("enum_types")? {
            report.enum_rows += self
                .runtime
                .block_on(
                    delete(
                        "DELETE FROM public.enum_values WHERE enum_id IN \
                         (SELECT id FROM public.enum_types WHERE instrument_id = $1)",
                    )
                    .execute(&mut self.conn),
                )?
                .rows_affected();
            report.enum_rows += self
                .runtime
                .block_on(
                    delete("DELETE FROM public.enum_types WHERE instrument_id = $1")
                        .execute(&mut self.conn),
                )?
                .rows_affected();
        }
        if self.table_exists("enumerations")? {
            report.enum_rows += self
                .runtime
                .block_on(
                    delete("DELETE FROM public.enumerations WHERE instrument_id = $1")
                        .execute(&mut self.conn),
                )?
                .rows_affected();
        }

        self.runtime.block_on(
            delete("DELETE FROM public.instruments WHERE id = $1").execute(&mut self.conn),
        )?;
        report.instrument_removed = true;
        info!(serial, instrument_id = id, "deleted instrument");
        Ok(report)
    }
}

/// Open `COPY ... FROM STDIN` on the gateway's connection.
struct PgCopy<'c> {
    runtime: &'c Runtime,
    copy: PgCopyIn<&'c mut PgConnection>,
}

impl CopyWriter for PgCopy<'_> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.runtime.block_on(self.copy.send(chunk))?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<u64, StoreError> {
        let PgCopy { runtime, copy } = *self;
        Ok(runtime.block_on(copy.finish())?)
    }

    fn abort(self: Box<Self>, reason: &str) -> Result<(), StoreError> {
        let PgCopy { runtime, copy } = *self;
        runtime.block_on(copy.abort(reason))?;
        Ok(())
    }
}
