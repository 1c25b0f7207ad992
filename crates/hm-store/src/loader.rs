//! Bulk loader: moves a finite row iterator into the store.
//!
//! Streaming mode serializes rows to wire lines and flushes them to the
//! bulk-copy channel whenever the buffer reaches the byte threshold. Fallback
//! mode sends statement batches with conflict-ignore semantics. Either way the
//! reported row count comes from the store after the load.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use hm_common::DataRow;
use hm_config::import::{DEFAULT_COPY_CHUNK_BYTES, DEFAULT_FALLBACK_BATCH_ROWS};
use hm_config::{ImportConfig, LoadMode};

use crate::error::LoadError;
use crate::gateway::{CopyWriter, CountScope, StoreGateway};
use crate::wire;

/// Outcome of one load call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub mode: LoadMode,
    /// Rows taken from the iterator.
    pub rows_sent: u64,
    /// Rows the store reported as written by this load.
    pub rows_written: u64,
    /// Duplicates silently discarded (fallback mode only).
    pub duplicates_ignored: u64,
    /// Flushes (streaming) or statements (fallback) issued.
    pub chunks: usize,
    /// Wire bytes sent (streaming mode only).
    pub bytes: u64,
    /// Row count queried from the store after the load.
    pub stored_rows: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Writes datapoint rows to a [`StoreGateway`].
#[derive(Debug, Clone)]
pub struct BulkLoader {
    mode: LoadMode,
    chunk_bytes: usize,
    batch_rows: usize,
    count_scope: CountScope,
}

impl Default for BulkLoader {
    fn default() -> Self {
        Self::new(LoadMode::default())
    }
}

impl BulkLoader {
    pub fn new(mode: LoadMode) -> Self {
        Self {
            mode,
            chunk_bytes: DEFAULT_COPY_CHUNK_BYTES,
            batch_rows: DEFAULT_FALLBACK_BATCH_ROWS,
            count_scope: CountScope::all_data(),
        }
    }

    pub fn from_config(config: &ImportConfig) -> Self {
        Self::new(config.mode)
            .with_chunk_bytes(config.copy_chunk_bytes)
            .with_batch_rows(config.fallback_batch_rows)
    }

    /// Byte threshold that triggers a flush in streaming mode.
    pub fn with_chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes.max(1);
        self
    }

    pub fn with_batch_rows(mut self, rows: usize) -> Self {
        self.batch_rows = rows.max(1);
        self
    }

    /// Rows counted for the authoritative post-load figure.
    pub fn with_count_scope(mut self, scope: CountScope) -> Self {
        self.count_scope = scope;
        self
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    /// Load infallible rows.
    pub fn load<G, I>(&self, gateway: &mut G, rows: I) -> Result<LoadReport, LoadError>
    where
        G: StoreGateway + ?Sized,
        I: IntoIterator<Item = DataRow>,
    {
        self.try_load(gateway, rows.into_iter().map(Ok::<_, Infallible>))
    }

    /// Load rows from a fallible source. The first source error aborts the
    /// load; in streaming mode nothing from this call is kept.
    pub fn try_load<G, I, E>(&self, gateway: &mut G, rows: I) -> Result<LoadReport, LoadError>
    where
        G: StoreGateway + ?Sized,
        I: IntoIterator<Item = Result<DataRow, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let started = Instant::now();
        let mut report = match self.mode {
            LoadMode::Streaming => self.stream(gateway, rows)?,
            LoadMode::Fallback => self.batched(gateway, rows)?,
        };
        report.stored_rows = gateway.count_rows(&self.count_scope)?;
        report.elapsed = started.elapsed();

        info!(
            mode = %report.mode,
            rows_sent = report.rows_sent,
            rows_written = report.rows_written,
            chunks = report.chunks,
            table = self.count_scope.table(),
            total = report.stored_rows,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "bulk load finished"
        );
        Ok(report)
    }

    fn stream<G, I, E>(&self, gateway: &mut G, rows: I) -> Result<LoadReport, LoadError>
    where
        G: StoreGateway + ?Sized,
        I: IntoIterator<Item = Result<DataRow, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let mut writer = gateway.copy_in()?;
        let mut report = self.empty_report();

        match self.copy_rows(writer.as_mut(), rows, &mut report) {
            Ok(()) => {
                report.rows_written = writer.finish().map_err(LoadError::from_copy)?;
                Ok(report)
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort(&e.to_string()) {
                    warn!(error = %abort_err, "failed to abort bulk copy");
                }
                Err(e)
            }
        }
    }

    fn copy_rows<I, E>(
        &self,
        writer: &mut dyn CopyWriter,
        rows: I,
        report: &mut LoadReport,
    ) -> Result<(), LoadError>
    where
        I: IntoIterator<Item = Result<DataRow, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let mut buf = Vec::with_capacity(self.chunk_bytes.saturating_add(256));
        let mut buffered_rows = 0u64;

        for row in rows {
            let row = row.map_err(|e| LoadError::Source(e.into()))?;
            wire::encode_row(&row, &mut buf);
            buffered_rows += 1;
            report.rows_sent += 1;

            if buf.len() >= self.chunk_bytes {
                self.flush(writer, &mut buf, buffered_rows, report)?;
                buffered_rows = 0;
            }
        }
        if !buf.is_empty() {
            self.flush(writer, &mut buf, buffered_rows, report)?;
        }
        Ok(())
    }

    fn flush(
        &self,
        writer: &mut dyn CopyWriter,
        buf: &mut Vec<u8>,
        rows: u64,
        report: &mut LoadReport,
    ) -> Result<(), LoadError> {
        writer.write_chunk(buf).map_err(LoadError::from_copy)?;
        report.chunks += 1;
        report.bytes += buf.len() as u64;
        debug!(chunk = report.chunks, bytes = buf.len(), rows, "flushed copy buffer");
        buf.clear();
        Ok(())
    }

    fn batched<G, I, E>(&self, gateway: &mut G, rows: I) -> Result<LoadReport, LoadError>
    where
        G: StoreGateway + ?Sized,
        I: IntoIterator<Item = Result<DataRow, E>>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let mut report = self.empty_report();
        let mut batch = Vec::with_capacity(self.batch_rows.min(DEFAULT_FALLBACK_BATCH_ROWS));

        for row in rows {
            batch.push(row.map_err(|e| LoadError::Source(e.into()))?);
            if batch.len() >= self.batch_rows {
                Self::insert_batch(gateway, &mut batch, &mut report)?;
            }
        }
        if !batch.is_empty() {
            Self::insert_batch(gateway, &mut batch, &mut report)?;
        }
        report.duplicates_ignored = report.rows_sent - report.rows_written;
        Ok(report)
    }

    fn insert_batch<G>(
        gateway: &mut G,
        batch: &mut Vec<DataRow>,
        report: &mut LoadReport,
    ) -> Result<(), LoadError>
    where
        G: StoreGateway + ?Sized,
    {
        let inserted = gateway.insert_rows(batch)?;
        report.chunks += 1;
        report.rows_sent += batch.len() as u64;
        report.rows_written += inserted;
        debug!(
            batch = report.chunks,
            rows = batch.len(),
            inserted,
            "inserted row batch"
        );
        batch.clear();
        Ok(())
    }

    fn empty_report(&self) -> LoadReport {
        LoadReport {
            mode: self.mode,
            rows_sent: 0,
            rows_written: 0,
            duplicates_ignored: 0,
            chunks: 0,
            bytes: 0,
            stored_rows: 0,
            elapsed: Duration::ZERO,
        }
    }
}
