//! In-memory store gateway.
//!
//! Enforces the same uniqueness keys and copy-channel semantics as the
//! PostgreSQL gateway: conflict-ignore inserts drop duplicates, a duplicate
//! inside a bulk copy fails the whole copy. Transactions snapshot the tables
//! on `begin` and restore them on `rollback`. Every flushed copy chunk is
//! recorded for inspection.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use hm_common::{
    DataRow, EncodedValue, EnumRef, InstrumentId, InstrumentIdentity, InstrumentRef, ParamId,
    ParameterRecord,
};

use crate::error::StoreError;
use crate::gateway::{
    CopyWriter, CountScope, EnumSequence, EnumValueRow, ParameterRow, PurgeReport,
    SequentialEnumRow, StoreGateway,
};
use crate::wire;

/// Operation that should fail on its next call (test hook).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    InsertParameters,
    CopyWrite,
}

/// A parameter as stored, with its enumeration link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredParameter {
    pub record: ParameterRecord,
    pub enum_ref: Option<EnumRef>,
}

type DataKey = (DateTime<Utc>, InstrumentId, ParamId);

#[derive(Debug, Clone, Default)]
struct Tables {
    instruments: BTreeMap<InstrumentId, InstrumentIdentity>,
    next_instrument: i32,
    /// (instrument, enum number, member) → (enumeration name, value)
    enumerations: BTreeMap<(InstrumentId, i32, String), (String, i32)>,
    enum_types: BTreeMap<(InstrumentId, String), i32>,
    next_enum_type: i32,
    enum_values: BTreeMap<(i32, String), i32>,
    parameters: BTreeMap<(InstrumentId, ParamId), StoredParameter>,
    data: BTreeMap<DataKey, EncodedValue>,
}

impl Tables {
    fn require_instrument(&self, id: InstrumentId) -> Result<(), StoreError> {
        if self.instruments.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::Constraint(format!(
                "instrument_id {id} is not present in instruments"
            )))
        }
    }
}

/// Store gateway backed by in-process maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Tables,
    snapshot: Option<Tables>,
    chunks: Vec<Vec<u8>>,
    fail_point: Option<FailPoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `point` fail with a constraint error.
    pub fn fail_on(&mut self, point: FailPoint) {
        self.fail_point = Some(point);
    }

    fn trip(&mut self, point: FailPoint) -> Result<(), StoreError> {
        if self.fail_point == Some(point) {
            self.fail_point = None;
            return Err(StoreError::Constraint(format!("injected failure: {point:?}")));
        }
        Ok(())
    }

    /// Every buffer received on the copy channel, in order.
    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn instrument(&self, id: InstrumentId) -> Option<&InstrumentIdentity> {
        self.tables.instruments.get(&id)
    }

    pub fn parameter(&self, instrument_id: InstrumentId, param_id: ParamId) -> Option<&StoredParameter> {
        self.tables.parameters.get(&(instrument_id, param_id))
    }

    pub fn enum_type_id(&self, instrument_id: InstrumentId, name: &str) -> Option<i32> {
        self.tables
            .enum_types
            .get(&(instrument_id, name.to_string()))
            .copied()
    }

    pub fn enum_value(&self, enum_id: i32, member: &str) -> Option<i32> {
        self.tables
            .enum_values
            .get(&(enum_id, member.to_string()))
            .copied()
    }

    /// Stored datapoints in key order.
    pub fn data(&self) -> impl Iterator<Item = DataRow> + '_ {
        self.tables
            .data
            .iter()
            .map(|(&(time, instrument_id, param_id), value)| DataRow {
                time,
                instrument_id,
                param_id,
                value: value.clone(),
            })
    }
}

impl StoreGateway for MemoryStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        if self.snapshot.is_some() {
            return Err(StoreError::TransactionActive);
        }
        self.snapshot = Some(self.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.snapshot.take().map(|_| ()).ok_or(StoreError::NoTransaction)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let snapshot = self.snapshot.take().ok_or(StoreError::NoTransaction)?;
        self.tables = snapshot;
        debug!("memory store rolled back");
        Ok(())
    }

    fn upsert_instrument(&mut self, identity: &InstrumentIdentity) -> Result<InstrumentRef, StoreError> {
        let existing = self
            .tables
            .instruments
            .iter()
            .find(|(_, i)| i.instrument == identity.instrument)
            .map(|(&id, _)| id);
        let id = match existing {
            Some(id) => id,
            None => {
                self.tables.next_instrument += 1;
                InstrumentId(self.tables.next_instrument)
            }
        };
        self.tables.instruments.insert(id, identity.clone());
        Ok(InstrumentRef {
            id,
            name: identity.name.clone(),
        })
    }

    fn enum_sequence(&mut self, instrument_id: InstrumentId) -> Result<EnumSequence, StoreError> {
        let assigned = self
            .tables
            .enumerations
            .iter()
            .filter(|((inst, _, _), _)| *inst == instrument_id)
            .map(|((_, enum_id, _), (name, _))| (name.clone(), *enum_id))
            .collect::<HashMap<_, _>>();
        Ok(EnumSequence::from_assigned(assigned))
    }

    fn insert_sequential_enums(
        &mut self,
        instrument_id: InstrumentId,
        rows: &[SequentialEnumRow],
    ) -> Result<u64, StoreError> {
        self.tables.require_instrument(instrument_id)?;
        let mut inserted = 0;
        for row in rows {
            let key = (instrument_id, row.enum_id, row.member_name.clone());
            if !self.tables.enumerations.contains_key(&key) {
                self.tables
                    .enumerations
                    .insert(key, (row.enum_name.clone(), row.value));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn upsert_enum_types(
        &mut self,
        instrument_id: InstrumentId,
        names: &[&str],
    ) -> Result<HashMap<String, i32>, StoreError> {
        self.tables.require_instrument(instrument_id)?;
        let mut ids = HashMap::with_capacity(names.len());
        for &name in names {
            let key = (instrument_id, name.to_string());
            let id = match self.tables.enum_types.get(&key) {
                Some(&id) => id,
                None => {
                    self.tables.next_enum_type += 1;
                    let id = self.tables.next_enum_type;
                    self.tables.enum_types.insert(key, id);
                    id
                }
            };
            ids.insert(name.to_string(), id);
        }
        Ok(ids)
    }

    fn insert_enum_values(&mut self, rows: &[EnumValueRow]) -> Result<u64, StoreError> {
        let known: HashSet<i32> = self.tables.enum_types.values().copied().collect();
        let mut inserted = 0;
        for row in rows {
            if !known.contains(&row.enum_id) {
                return Err(StoreError::Constraint(format!(
                    "enum_id {} is not present in enum_types",
                    row.enum_id
                )));
            }
            let key = (row.enum_id, row.member_name.clone());
            if !self.tables.enum_values.contains_key(&key) {
                self.tables.enum_values.insert(key, row.value);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn insert_parameters(
        &mut self,
        instrument_id: InstrumentId,
        rows: &[ParameterRow<'_>],
    ) -> Result<u64, StoreError> {
        self.trip(FailPoint::InsertParameters)?;
        self.tables.require_instrument(instrument_id)?;
        let mut inserted = 0;
        for row in rows {
            let key = (instrument_id, row.record.param_id);
            if !self.tables.parameters.contains_key(&key) {
                self.tables.parameters.insert(
                    key,
                    StoredParameter {
                        record: row.record.clone(),
                        enum_ref: row.enum_ref,
                    },
                );
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn copy_in(&mut self) -> Result<Box<dyn CopyWriter + '_>, StoreError> {
        Ok(Box::new(MemoryCopy {
            store: self,
            pending: Vec::new(),
            rows: Vec::new(),
        }))
    }

    fn insert_rows(&mut self, rows: &[DataRow]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for row in rows {
            self.tables.require_instrument(row.instrument_id)?;
            if let std::collections::btree_map::Entry::Vacant(slot) =
                self.tables.data.entry(row.key())
            {
                slot.insert(row.value.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn count_rows(&mut self, scope: &CountScope) -> Result<u64, StoreError> {
        let t = &self.tables;
        let n = match *scope {
            CountScope::Instruments => t.instruments.len(),
            CountScope::EnumTypes(id) => t.enum_types.keys().filter(|(i, _)| *i == id).count(),
            CountScope::EnumValues(id) => {
                let owned: HashSet<i32> = t
                    .enum_types
                    .iter()
                    .filter(|((i, _), _)| *i == id)
                    .map(|(_, &e)| e)
                    .collect();
                t.enum_values.keys().filter(|(e, _)| owned.contains(e)).count()
            }
            CountScope::SequentialEnums(id) => t
                .enumerations
                .keys()
                .filter(|(i, _, _)| *i == id)
                .map(|(_, e, _)| *e)
                .collect::<HashSet<_>>()
                .len(),
            CountScope::SequentialMembers(id) => {
                t.enumerations.keys().filter(|(i, _, _)| *i == id).count()
            }
            CountScope::Parameters(id) => t.parameters.keys().filter(|(i, _)| *i == id).count(),
            CountScope::Data {
                instrument_id,
                after,
            } => t
                .data
                .keys()
                .filter(|(time, inst, _)| {
                    instrument_id.map_or(true, |id| *inst == id)
                        && after.map_or(true, |cutoff| *time > cutoff)
                })
                .count(),
        };
        Ok(n as u64)
    }

    fn purge_instrument(
        &mut self,
        serial: i64,
        before: Option<DateTime<Utc>>,
    ) -> Result<PurgeReport, StoreError> {
        let id = self
            .tables
            .instruments
            .iter()
            .find(|(_, i)| i.serial == serial)
            .map(|(&id, _)| id)
            .ok_or(StoreError::UnknownSerial(serial))?;

        let t = &mut self.tables;
        let mut report = PurgeReport {
            serial,
            instrument_id: Some(id),
            ..PurgeReport::default()
        };
        let data_before = t.data.len();
        t.data.retain(|(time, inst, _), _| {
            *inst != id || before.is_some_and(|cutoff| *time >= cutoff)
        });
        report.data_rows = (data_before - t.data.len()) as u64;

        if before.is_none() {
            let params_before = t.parameters.len();
            t.parameters.retain(|(inst, _), _| *inst != id);
            report.parameters = (params_before - t.parameters.len()) as u64;

            let owned: HashSet<i32> = t
                .enum_types
                .iter()
                .filter(|((i, _), _)| *i == id)
                .map(|(_, &e)| e)
                .collect();
            let enum_before = t.enumerations.len() + t.enum_values.len() + t.enum_types.len();
            t.enumerations.retain(|(inst, _, _), _| *inst != id);
            t.enum_values.retain(|(e, _), _| !owned.contains(e));
            t.enum_types.retain(|(inst, _), _| *inst != id);
            report.enum_rows = (enum_before
                - (t.enumerations.len() + t.enum_values.len() + t.enum_types.len()))
                as u64;

            t.instruments.remove(&id);
            report.instrument_removed = true;
        }
        Ok(report)
    }
}

/// Copy channel into a `MemoryStore`. Rows become visible only on `finish`.
struct MemoryCopy<'a> {
    store: &'a mut MemoryStore,
    pending: Vec<u8>,
    rows: Vec<DataRow>,
}

impl MemoryCopy<'_> {
    fn drain_lines(&mut self) -> Result<(), StoreError> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = std::str::from_utf8(&line)
                .map_err(|e| StoreError::CopyFormat(format!("invalid UTF-8: {e}")))?;
            self.rows.push(wire::decode_line(text)?);
        }
        Ok(())
    }
}

impl CopyWriter for MemoryCopy<'_> {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.store.trip(FailPoint::CopyWrite)?;
        self.store.chunks.push(chunk.to_vec());
        self.pending.extend_from_slice(chunk);
        self.drain_lines()
    }

    fn finish(mut self: Box<Self>) -> Result<u64, StoreError> {
        if !self.pending.is_empty() {
            return Err(StoreError::CopyFormat("unterminated final row".to_string()));
        }
        let rows = std::mem::take(&mut self.rows);
        let tables = &mut self.store.tables;

        let mut seen = HashSet::with_capacity(rows.len());
        for row in &rows {
            tables.require_instrument(row.instrument_id)?;
            let key = row.key();
            if tables.data.contains_key(&key) || !seen.insert(key) {
                return Err(StoreError::UniqueViolation(format!(
                    "duplicate key (time, instrument_id, param_id)=({}, {}, {})",
                    hm_common::render_timestamp(&row.time),
                    row.instrument_id,
                    row.param_id
                )));
            }
        }
        let count = rows.len() as u64;
        for row in rows {
            tables.data.insert(row.key(), row.value);
        }
        Ok(count)
    }

    fn abort(self: Box<Self>, reason: &str) -> Result<(), StoreError> {
        debug!(reason, discarded = self.rows.len(), "memory copy aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_common::{DatabaseKind, ValueType};

    fn identity(instrument: &str, serial: i64) -> InstrumentIdentity {
        InstrumentIdentity {
            instrument: instrument.into(),
            serial,
            model: "Krios G4".into(),
            name: "Krios".into(),
            database: DatabaseKind::Tem,
            template: "krios".into(),
            server: "10.0.0.1".into(),
        }
    }

    fn param(id: i32) -> ParameterRecord {
        ParameterRecord {
            param_id: ParamId(id),
            subsystem: Some("Vacuum".into()),
            component: Some("Column".into()),
            name: format!("P{id}"),
            display_name: None,
            display_unit: None,
            storage_unit: None,
            display_scale: None,
            value_type: ValueType::Float,
            enum_name: None,
        }
    }

    #[test]
    fn test_upsert_instrument_is_stable() {
        let mut store = MemoryStore::new();
        let a = store.upsert_instrument(&identity("1, A", 1)).unwrap();
        let mut renamed = identity("1, A", 1);
        renamed.name = "Renamed".into();
        let b = store.upsert_instrument(&renamed).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.name, "Renamed");
        assert_eq!(store.count_rows(&CountScope::Instruments).unwrap(), 1);
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let mut store = MemoryStore::new();
        store.begin().unwrap();
        store.upsert_instrument(&identity("1, A", 1)).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.count_rows(&CountScope::Instruments).unwrap(), 0);
        assert!(matches!(store.commit(), Err(StoreError::NoTransaction)));
    }

    #[test]
    fn test_nested_begin_rejected() {
        let mut store = MemoryStore::new();
        store.begin().unwrap();
        assert!(matches!(store.begin(), Err(StoreError::TransactionActive)));
    }

    #[test]
    fn test_parameters_conflict_ignore() {
        let mut store = MemoryStore::new();
        let id = store.upsert_instrument(&identity("1, A", 1)).unwrap().id;
        let records = [param(1), param(2)];
        let rows: Vec<_> = records
            .iter()
            .map(|record| ParameterRow {
                record,
                enum_ref: None,
            })
            .collect();
        assert_eq!(store.insert_parameters(id, &rows).unwrap(), 2);
        assert_eq!(store.insert_parameters(id, &rows).unwrap(), 0);
        assert_eq!(store.count_rows(&CountScope::Parameters(id)).unwrap(), 2);
    }

    #[test]
    fn test_parameters_need_instrument() {
        let mut store = MemoryStore::new();
        let record = param(1);
        let err = store
            .insert_parameters(
                InstrumentId(7),
                &[ParameterRow {
                    record: &record,
                    enum_ref: None,
                }],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[test]
    fn test_enum_types_reuse_ids() {
        let mut store = MemoryStore::new();
        let id = store.upsert_instrument(&identity("1, A", 1)).unwrap().id;
        let first = store.upsert_enum_types(id, &["A_enum", "B_enum"]).unwrap();
        let second = store.upsert_enum_types(id, &["B_enum", "C_enum"]).unwrap();
        assert_eq!(first["B_enum"], second["B_enum"]);
        assert_eq!(store.count_rows(&CountScope::EnumTypes(id)).unwrap(), 3);
    }

    #[test]
    fn test_enum_values_need_type() {
        let mut store = MemoryStore::new();
        let row = EnumValueRow {
            enum_id: 99,
            member_name: "On".into(),
            value: 1,
        };
        assert!(store.insert_enum_values(&[row]).is_err());
    }

    #[test]
    fn test_sequence_reports_assigned_numbers() {
        let mut store = MemoryStore::new();
        let id = store.upsert_instrument(&identity("1, A", 1)).unwrap().id;
        let rows = vec![
            SequentialEnumRow {
                enum_id: 1,
                enum_name: "A_enum".into(),
                member_name: "x".into(),
                value: 0,
            },
            SequentialEnumRow {
                enum_id: 2,
                enum_name: "B_enum".into(),
                member_name: "y".into(),
                value: 1,
            },
        ];
        store.insert_sequential_enums(id, &rows).unwrap();
        let seq = store.enum_sequence(id).unwrap();
        assert_eq!(seq.max, 2);
        assert_eq!(seq.assigned["A_enum"], 1);
        assert_eq!(store.count_rows(&CountScope::SequentialEnums(id)).unwrap(), 2);
    }

    #[test]
    fn test_copy_rejects_partial_line() {
        let mut store = MemoryStore::new();
        store.upsert_instrument(&identity("1, A", 1)).unwrap();
        let mut copy = store.copy_in().unwrap();
        copy.write_chunk(b"2025-01-01 00:00:00.000+0000\t1\t").unwrap();
        assert!(matches!(copy.finish(), Err(StoreError::CopyFormat(_))));
    }

    #[test]
    fn test_copy_lines_may_span_chunks() {
        let mut store = MemoryStore::new();
        store.upsert_instrument(&identity("1, A", 1)).unwrap();
        let mut copy = store.copy_in().unwrap();
        copy.write_chunk(b"2025-01-01 00:00:00.000+0000\t1\t5\t").unwrap();
        copy.write_chunk(b"3.5\t\\N\n").unwrap();
        assert_eq!(copy.finish().unwrap(), 1);
        let row = store.data().next().unwrap();
        assert_eq!(row.value, EncodedValue::Numeric("3.5".into()));
    }

    #[test]
    fn test_purge_with_cutoff_keeps_metadata() {
        let mut store = MemoryStore::new();
        let id = store.upsert_instrument(&identity("1, A", 1)).unwrap().id;
        let cutoff = Utc::now();
        let rows = vec![
            DataRow {
                time: cutoff - chrono::Duration::hours(1),
                instrument_id: id,
                param_id: ParamId(1),
                value: EncodedValue::Numeric("1".into()),
            },
            DataRow {
                time: cutoff + chrono::Duration::hours(1),
                instrument_id: id,
                param_id: ParamId(1),
                value: EncodedValue::Numeric("2".into()),
            },
        ];
        store.insert_rows(&rows).unwrap();
        let report = store.purge_instrument(1, Some(cutoff)).unwrap();
        assert_eq!(report.data_rows, 1);
        assert!(!report.instrument_removed);
        assert_eq!(store.count_rows(&CountScope::all_data()).unwrap(), 1);
        assert_eq!(store.count_rows(&CountScope::Instruments).unwrap(), 1);
    }

    #[test]
    fn test_purge_everything() {
        let mut store = MemoryStore::new();
        let id = store.upsert_instrument(&identity("1, A", 1)).unwrap().id;
        let enum_ids = store.upsert_enum_types(id, &["A_enum"]).unwrap();
        store
            .insert_enum_values(&[EnumValueRow {
                enum_id: enum_ids["A_enum"],
                member_name: "On".into(),
                value: 1,
            }])
            .unwrap();
        let report = store.purge_instrument(1, None).unwrap();
        assert!(report.instrument_removed);
        assert_eq!(report.enum_rows, 2);
        assert_eq!(store.count_rows(&CountScope::Instruments).unwrap(), 0);
        assert!(matches!(
            store.purge_instrument(1, None),
            Err(StoreError::UnknownSerial(1))
        ));
    }
}
