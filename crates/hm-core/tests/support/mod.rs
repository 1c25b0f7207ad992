//! Synthetic export documents for integration tests.
//!
//! The default document declares `FegState_enum` with 8 literals and 391
//! parameters over 3 subsystems. It carries 1 889 datapoints: datapoint `k`
//! is stamped `BASE + k` seconds and belongs to parameter `k % 391`, with the
//! timestamp written in one of four layouts. 1 333 datapoints fall after
//! `cutoff()`.

#![allow(dead_code)]

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;

pub const INSTRUMENT: &str = "9999, Test Instrument";
pub const SERIAL: i64 = 9999;
pub const PARAMETERS: usize = 391;
pub const DATAPOINTS: usize = 1889;
pub const CUTOFF_SECS: i64 = 555;
pub const AFTER_CUTOFF: u64 = 1333;
pub const FIRST_PARAM_ID: i32 = 1000;

const SUBSYSTEMS: [&str; 3] = ["Source", "Vacuum", "Stage"];
const COMPONENTS: [&str; 4] = ["A", "B", "C", "D"];
const FEG_LITERALS: [&str; 8] = [
    "Off", "Startup", "Standby", "Conditioning", "Operate", "Ramping", "Fault", "Unknown",
];

pub fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).unwrap()
}

pub fn cutoff() -> DateTime<Utc> {
    base() + Duration::seconds(CUTOFF_SECS)
}

/// Settings JSON listing the test instrument.
pub fn settings_json() -> String {
    format!(
        r#"[{{"instrument":"{INSTRUMENT}","serial":{SERIAL},"model":"Test","name":"TEST","type":"tem","template":"tem","server":"localhost"}}]"#
    )
}

/// Builder for the synthetic document.
#[derive(Debug, Clone, Default)]
pub struct ExportBuilder {
    unknown_block: bool,
    bad_values: usize,
    repeated_entry: bool,
    datapoints: Option<usize>,
}

impl ExportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value block for a parameter the document does not declare.
    pub fn with_unknown_block(mut self) -> Self {
        self.unknown_block = true;
        self
    }

    /// Add `n` entries with non-numeric text to the first `Int` parameter.
    pub fn with_bad_values(mut self, n: usize) -> Self {
        self.bad_values = n;
        self
    }

    /// Repeat the first datapoint inside its own block.
    pub fn with_repeated_entry(mut self) -> Self {
        self.repeated_entry = true;
        self
    }

    pub fn with_datapoints(mut self, n: usize) -> Self {
        self.datapoints = Some(n);
        self
    }

    pub fn build(&self) -> String {
        let mut doc = String::with_capacity(256 * 1024);
        doc.push_str(r#"<?xml version="1.0" encoding="utf-8"?>"#);
        doc.push('\n');
        doc.push_str(r#"<HealthMonitorExport xmlns="HealthMonitorExport http://schemas.fei.com/HealthMonitor/Export/2009/07">"#);
        doc.push_str("\n  <Enumerations>\n    <Enumeration Name=\"FegState_enum\">\n");
        for (value, name) in FEG_LITERALS.iter().enumerate() {
            let _ = writeln!(doc, "      <Literal Name=\"{name}\">{value}</Literal>");
        }
        doc.push_str("    </Enumeration>\n  </Enumerations>\n");

        let _ = writeln!(doc, "  <Instruments>\n    <Instrument Name=\"{INSTRUMENT}\">");
        let per_subsystem = PARAMETERS.div_ceil(SUBSYSTEMS.len());
        let per_component = per_subsystem.div_ceil(COMPONENTS.len());
        for (s, subsystem) in SUBSYSTEMS.iter().enumerate() {
            let _ = writeln!(doc, "      <Component Name=\"{subsystem}\">");
            for (c, component) in COMPONENTS.iter().enumerate() {
                let first = s * per_subsystem + c * per_component;
                let last = (first + per_component).min((s + 1) * per_subsystem).min(PARAMETERS);
                let _ = writeln!(doc, "        <Component Name=\"{component}\">");
                for i in first..last {
                    doc.push_str("          ");
                    doc.push_str(&parameter_xml(i));
                    doc.push('\n');
                }
                doc.push_str("        </Component>\n");
            }
            doc.push_str("      </Component>\n");
        }
        doc.push_str("    </Instrument>\n  </Instruments>\n");

        let total = self.datapoints.unwrap_or(DATAPOINTS);
        let end = base() + Duration::seconds(total as i64);
        let _ = writeln!(
            doc,
            "  <Values Start=\"{}\" End=\"{}\">",
            base().format("%Y-%m-%dT%H:%M:%SZ"),
            end.format("%Y-%m-%dT%H:%M:%SZ")
        );
        if self.unknown_block {
            doc.push_str(&value_block(99_999, &[(0, "1".into()), (1, "2".into())]));
        }
        for i in 0..PARAMETERS {
            let mut entries: Vec<(usize, String)> = (i..total)
                .step_by(PARAMETERS)
                .map(|k| (k, value_text(i, k)))
                .collect();
            if i == 0 {
                if self.repeated_entry {
                    entries.insert(1, (0, value_text(0, 0)));
                }
                for n in 0..self.bad_values {
                    entries.push((total + n, "not-a-number".into()));
                }
            }
            if !entries.is_empty() {
                doc.push_str(&value_block(param_id(i), &entries));
            }
        }
        doc.push_str("  </Values>\n</HealthMonitorExport>\n");
        doc
    }

    pub fn write(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.build()).unwrap();
        path
    }

    pub fn write_gz(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.build().as_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();
        path
    }
}

pub fn param_id(i: usize) -> i32 {
    FIRST_PARAM_ID + i as i32
}

/// Parameter 0 is the enumeration-backed FEG state; the rest cycle through
/// Int, Float and String.
fn parameter_xml(i: usize) -> String {
    let id = param_id(i);
    if i == 0 {
        return format!(
            r#"<Parameter ID="{id}" Name="FegState" DisplayName="FEG State" Type="Int" EnumerationName="FegState_enum" StorageUnit="" DisplayUnit="" DisplayScale="Linear" />"#
        );
    }
    match i % 3 {
        0 => format!(r#"<Parameter ID="{id}" Name="Counter{i}" Type="Int" />"#),
        1 => format!(
            r#"<Parameter ID="{id}" Name="Reading{i}" DisplayName="Reading {i}" Type="Float" StorageUnit="Pa" DisplayUnit="mPa" DisplayScale="Log" />"#
        ),
        _ => format!(r#"<Parameter ID="{id}" Name="Mode{i}" Type="String" />"#),
    }
}

fn value_text(i: usize, k: usize) -> String {
    if i == 0 {
        return (k % FEG_LITERALS.len()).to_string();
    }
    match i % 3 {
        0 => k.to_string(),
        1 => format!("{k}.25E-3"),
        _ => format!("mode &amp; state {k}"),
    }
}

/// Timestamp of datapoint `k` in one of the four accepted layouts.
pub fn timestamp_text(k: usize) -> String {
    let t = base() + Duration::seconds(k as i64);
    match k % 4 {
        0 => t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        1 => t.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        2 => {
            let local = t.with_timezone(&FixedOffset::east_opt(3600).unwrap());
            local.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
        }
        _ => {
            let local = t.with_timezone(&FixedOffset::west_opt(5 * 3600).unwrap());
            local.format("%Y-%m-%dT%H:%M:%S%z").to_string()
        }
    }
}

fn value_block(id: i32, entries: &[(usize, String)]) -> String {
    let mut block = format!("    <ValueData ParameterID=\"{id}\">\n      <ParameterValues>\n");
    for (k, value) in entries {
        let _ = writeln!(
            block,
            "        <ParameterValue Timestamp=\"{}\"><Value>{value}</Value></ParameterValue>",
            timestamp_text(*k)
        );
    }
    block.push_str("      </ParameterValues>\n    </ValueData>\n");
    block
}
