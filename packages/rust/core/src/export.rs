//! CSV and JSON export of stored records.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use tracing::info;

use leadharvest_shared::{ContactField, HarvestError, Record, Result};

/// Output format for `export`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(HarvestError::validation(format!(
                "unknown export format '{other}' (expected csv or json)"
            ))),
        }
    }
}

/// One flattened CSV row.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    external_id: &'a str,
    name: &'a str,
    first_name: &'a str,
    middle_name: &'a str,
    last_name: &'a str,
    aka: &'a str,
    organization: &'a str,
    city: &'a str,
    sector: &'a str,
    status: &'a str,
    email: &'a str,
    email_provenance: &'a str,
    email_confidence: Option<f64>,
    email_method: &'a str,
    phone: &'a str,
    quality_score: u32,
    stale: bool,
    first_seen_at: String,
    last_seen_at: String,
}

impl<'a> CsvRow<'a> {
    fn from_record(r: &'a Record) -> Self {
        let email = r.email.as_ref();
        Self {
            external_id: &r.external_id,
            name: &r.display_name,
            first_name: &r.first_name,
            middle_name: &r.middle_name,
            last_name: &r.last_name,
            aka: r.aka.as_deref().unwrap_or_default(),
            organization: &r.organization,
            city: &r.city,
            sector: r.sector.as_deref().unwrap_or_default(),
            status: r.status.as_str(),
            email: value_of(email),
            email_provenance: email.map(|e| e.provenance.as_str()).unwrap_or_default(),
            email_confidence: email.filter(|e| e.is_resolved()).map(|e| e.confidence),
            email_method: email.and_then(|e| e.method.as_deref()).unwrap_or_default(),
            phone: value_of(r.phone.as_ref()),
            quality_score: r.quality_score,
            stale: r.stale,
            first_seen_at: r.first_seen_at.to_rfc3339(),
            last_seen_at: r.last_seen_at.to_rfc3339(),
        }
    }
}

fn value_of(field: Option<&ContactField>) -> &str {
    field.and_then(|f| f.value.as_deref()).unwrap_or_default()
}

/// Serialize `records` to `writer`.
pub fn write_records<W: Write>(
    records: &[Record],
    format: ExportFormat,
    mut writer: W,
) -> std::io::Result<()> {
    match format {
        ExportFormat::Csv => {
            let mut csv = csv::Writer::from_writer(writer);
            for record in records {
                csv.serialize(CsvRow::from_record(record))?;
            }
            csv.flush()
        }
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, records)?;
            writer.write_all(b"\n")?;
            writer.flush()
        }
    }
}

/// Write `records` to `path`, creating parent directories. Returns the
/// number of records written.
pub fn export_to_path(records: &[Record], format: ExportFormat, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| HarvestError::io(path, e))?;
    write_records(records, format, BufWriter::new(file)).map_err(|e| HarvestError::io(path, e))?;

    info!(
        path = %path.display(),
        format = format.as_str(),
        records = records.len(),
        "export written"
    );
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use leadharvest_shared::{Provenance, RawRecord, RecordStatus};
    use uuid::Uuid;

    use super::*;

    fn sample() -> Vec<Record> {
        let now = Utc::now();
        let mut jane = Record::from_raw(
            RawRecord {
                external_id: "X1001".into(),
                first_name: "Jane".into(),
                middle_name: "Q".into(),
                last_name: "Smith".into(),
                aka: None,
                organization: "RE/MAX River City".into(),
                city: "Calgary".into(),
                sector: Some("Residential".into()),
                status: RecordStatus::Licensed,
            },
            now,
        );
        jane.email = Some(ContactField::resolved(
            "jane.smith@remax.ca",
            Provenance::Direct,
            Some("directory_detail"),
            0.8,
            now,
        ));
        jane.quality_score = 70;

        let mut john = Record::from_raw(
            RawRecord {
                external_id: "X1002".into(),
                first_name: "John".into(),
                middle_name: String::new(),
                last_name: "Smithers".into(),
                aka: Some("Jack".into()),
                organization: "Century 21 Bamber Realty Ltd.".into(),
                city: "Red Deer".into(),
                sector: None,
                status: RecordStatus::Cancelled,
            },
            now,
        );
        john.email = Some(ContactField::not_found(now));
        vec![jane, john]
    }

    #[test]
    fn format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn csv_has_header_and_flattened_contacts() {
        let mut out = Vec::new();
        write_records(&sample(), ExportFormat::Csv, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("external_id,name,first_name"));
        assert!(lines[1].contains("jane.smith@remax.ca,direct,0.8,directory_detail"));
        assert!(lines[1].contains("RE/MAX River City"));
        assert!(lines[2].contains(",not_found,,"));
        assert!(lines[2].contains("Jack"));
    }

    #[test]
    fn json_round_trips_records() {
        let records = sample();
        let mut out = Vec::new();
        write_records(&records, ExportFormat::Json, &mut out).unwrap();
        let parsed: Vec<Record> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn export_to_nested_path() {
        let dir = std::env::temp_dir().join(format!("lh-export-{}", Uuid::now_v7()));
        let path = dir.join("out").join("leads.csv");
        let written = export_to_path(&sample(), ExportFormat::Csv, &path).unwrap();
        assert_eq!(written, 2);
        assert!(std::fs::read_to_string(&path).unwrap().contains("X1002"));
        std::fs::remove_dir_all(dir).ok();
    }
}
