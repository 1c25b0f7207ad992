//! Bulk loader behaviour against the in-memory gateway.

use chrono::{Duration, TimeZone, Utc};
use hm_common::{DataRow, DatabaseKind, EncodedValue, InstrumentId, InstrumentIdentity, ParamId};
use hm_config::LoadMode;
use hm_store::wire::encode_line;
use hm_store::{BulkLoader, CountScope, FailPoint, LoadError, MemoryStore, StoreGateway};

const MIB: usize = 1024 * 1024;

fn store() -> (MemoryStore, InstrumentId) {
    let mut store = MemoryStore::new();
    let id = store
        .upsert_instrument(&InstrumentIdentity {
            instrument: "9999, Test Instrument".into(),
            serial: 9999,
            model: "Test instrument".into(),
            name: "Test".into(),
            database: DatabaseKind::Tem,
            template: "krios".into(),
            server: "127.0.0.1".into(),
        })
        .unwrap()
        .id;
    (store, id)
}

/// Rows alternating between numeric and long text values.
fn synthetic_rows(instrument_id: InstrumentId, n: usize) -> Vec<DataRow> {
    let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| DataRow {
            time: start + Duration::milliseconds(i as i64 * 250),
            instrument_id,
            param_id: ParamId((i % 97) as i32 + 1),
            value: if i % 2 == 0 {
                EncodedValue::Numeric(format!("{}.{}", i, i % 7))
            } else {
                EncodedValue::Text(format!("state\t{i}\n{}", "x".repeat(400 + i % 50)))
            },
        })
        .collect()
}

#[test]
fn chunked_stream_reproduces_rows_in_order() {
    let (mut store, id) = store();
    let rows = synthetic_rows(id, 10_000);
    let expected: Vec<String> = rows.iter().map(encode_line).collect();

    let report = BulkLoader::new(LoadMode::Streaming)
        .with_chunk_bytes(MIB)
        .load(&mut store, rows)
        .unwrap();

    assert!(report.chunks > 1, "expected several flushes, got {}", report.chunks);
    assert_eq!(store.chunks().len(), report.chunks);
    for chunk in &store.chunks()[..report.chunks - 1] {
        assert!(chunk.len() >= MIB);
        assert_eq!(chunk.last(), Some(&b'\n'));
    }

    let joined: Vec<u8> = store.chunks().concat();
    let text = String::from_utf8(joined).unwrap();
    let lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();
    assert_eq!(lines.len(), 10_000);
    assert_eq!(lines, expected);
    assert_eq!(report.bytes as usize, text.len());
    assert_eq!(report.stored_rows, 10_000);
}

#[test]
fn fallback_keeps_one_row_per_key() {
    let (mut store, id) = store();
    let row = synthetic_rows(id, 1).remove(0);
    let loader = BulkLoader::new(LoadMode::Fallback);

    loader.load(&mut store, vec![row.clone()]).unwrap();
    let report = loader.load(&mut store, vec![row.clone(), row]).unwrap();

    assert_eq!(report.rows_written, 0);
    assert_eq!(report.duplicates_ignored, 2);
    assert_eq!(store.count_rows(&CountScope::all_data()).unwrap(), 1);
}

#[test]
fn streaming_rejects_rows_already_stored() {
    let (mut store, id) = store();
    let rows = synthetic_rows(id, 50);
    let loader = BulkLoader::new(LoadMode::Streaming);
    loader.load(&mut store, rows.clone()).unwrap();

    let err = loader.load(&mut store, rows).unwrap_err();
    assert!(matches!(err, LoadError::DuplicateKey(_)));
    assert_eq!(store.count_rows(&CountScope::all_data()).unwrap(), 50);
}

#[test]
fn write_failure_aborts_copy() {
    let (mut store, id) = store();
    store.fail_on(FailPoint::CopyWrite);
    let err = BulkLoader::new(LoadMode::Streaming)
        .load(&mut store, synthetic_rows(id, 5))
        .unwrap_err();
    assert!(matches!(err, LoadError::Store(_)));
    assert_eq!(store.count_rows(&CountScope::all_data()).unwrap(), 0);
}

#[test]
fn count_scope_limits_reported_total() {
    let (mut store, id) = store();
    let rows = synthetic_rows(id, 20);
    let cutoff = rows[9].time;
    let report = BulkLoader::new(LoadMode::Fallback)
        .with_count_scope(CountScope::Data {
            instrument_id: Some(id),
            after: Some(cutoff),
        })
        .load(&mut store, rows)
        .unwrap();
    assert_eq!(report.rows_written, 20);
    assert_eq!(report.stored_rows, 10);
}
