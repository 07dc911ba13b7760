use std::fs::{File, OpenOptions};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::query::GeocodeResult;

const DELIMITER: u8 = b';';
const INPUT_HEADER: [&str; 5] = ["code", "name", "street", "city", "postalcode"];
const OUTPUT_HEADER: [&str; 7] = ["code", "name", "street", "city", "postalcode", "lat", "lng"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardizedRecord {
    pub code: String,
    pub name: String,
    pub street: String,
    pub city: String,
    pub postalcode: String,
}

impl StandardizedRecord {
    pub fn has_address(&self) -> bool {
        [&self.street, &self.city, &self.postalcode]
            .iter()
            .any(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLocation {
    pub header_index: usize,
    pub data_start: usize,
    pub column_count: usize,
}

// Column positions are relative to the detected header row.
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    pub header_keywords: Vec<String>,
    pub code: usize,
    pub name: usize,
    pub street: usize,
    pub city: usize,
    pub postalcode: usize,
}

#[derive(Debug, Clone)]
pub struct RecordFormat {
    pub country_code: String,
    pub code_suffix: String,
    pub postal_code_width: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct StandardizeOutcome {
    pub records: Vec<StandardizedRecord>,
    pub dropped: usize,
}

pub fn detect_header(rows: &[Vec<String>], keywords: &[String]) -> AppResult<HeaderLocation> {
    let wanted: Vec<String> = keywords
        .iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty())
        .collect();
    if wanted.is_empty() {
        return Err(AppError::Validation(
            "header detection needs at least one keyword".into(),
        ));
    }

    rows.iter()
        .position(|row| {
            wanted.iter().all(|keyword| {
                row.iter()
                    .any(|cell| cell.to_lowercase().contains(keyword.as_str()))
            })
        })
        .map(|header_index| HeaderLocation {
            header_index,
            data_start: header_index + 1,
            column_count: rows[header_index].len(),
        })
        .ok_or_else(|| {
            AppError::Validation(format!(
                "no header row contains all of {}",
                wanted.join(", ")
            ))
        })
}

// None for anything that is not purely digits; callers drop the row.
pub fn zero_fill_postal_code(value: &str, width: usize) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some(String::new());
    }
    if !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{trimmed:0>width$}"))
}

pub fn format_approval_code(country_code: &str, raw: &str, suffix: &str) -> String {
    let raw = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    [country_code.trim(), raw.as_str(), suffix.trim()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn standardize_rows(
    rows: &[Vec<String>],
    layout: &ColumnLayout,
    format: &RecordFormat,
) -> AppResult<StandardizeOutcome> {
    let header = detect_header(rows, &layout.header_keywords)?;
    let widest = [
        layout.code,
        layout.name,
        layout.street,
        layout.city,
        layout.postalcode,
    ]
    .into_iter()
    .max()
    .unwrap_or_default();
    if widest >= header.column_count {
        return Err(AppError::Validation(format!(
            "column layout needs {} columns but header has {}",
            widest + 1,
            header.column_count
        )));
    }

    let mut records = Vec::new();
    let mut dropped = 0;
    for (offset, row) in rows[header.data_start..].iter().enumerate() {
        let line = header.data_start + offset;
        let cell = |index: usize| row.get(index).map(|v| v.trim()).unwrap_or_default();

        let raw_code = cell(layout.code);
        if raw_code.is_empty() {
            if row.iter().any(|value| !value.trim().is_empty()) {
                warn!(line, "dropping row without approval code");
                dropped += 1;
            }
            continue;
        }

        let postalcode = match format.postal_code_width {
            Some(width) => match zero_fill_postal_code(cell(layout.postalcode), width) {
                Some(value) => value,
                None => {
                    warn!(
                        line,
                        code = raw_code,
                        postalcode = cell(layout.postalcode),
                        "dropping row with non-numeric postal code"
                    );
                    dropped += 1;
                    continue;
                }
            },
            None => cell(layout.postalcode).to_string(),
        };

        records.push(StandardizedRecord {
            code: format_approval_code(&format.country_code, raw_code, &format.code_suffix),
            name: cell(layout.name).to_string(),
            street: cell(layout.street).to_string(),
            city: cell(layout.city).to_string(),
            postalcode,
        });
    }

    Ok(StandardizeOutcome { records, dropped })
}

pub fn read_records(path: &Path) -> AppResult<Vec<StandardizedRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let missing: Vec<&str> = INPUT_HEADER
        .iter()
        .copied()
        .filter(|column| !headers.iter().any(|h| h == *column))
        .collect();
    if !missing.is_empty() {
        return Err(AppError::Validation(format!(
            "{} is missing columns: {}",
            path.display(),
            missing.join(", ")
        )));
    }

    let mut records = Vec::new();
    for (index, row) in reader.deserialize::<StandardizedRecord>().enumerate() {
        let record = row?;
        if record.code.is_empty() {
            return Err(AppError::Validation(format!(
                "{} row {} has an empty code",
                path.display(),
                index + 1
            )));
        }
        records.push(record);
    }
    Ok(records)
}

/// Flushes after every row so a checkpoint never points past unwritten data.
pub struct RecordWriter {
    inner: csv::Writer<File>,
}

impl RecordWriter {
    pub fn create(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut writer = Self::wrap(file);
        writer.inner.write_record(OUTPUT_HEADER)?;
        writer.inner.flush()?;
        Ok(writer)
    }

    pub fn append(path: &Path) -> AppResult<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self::wrap(file))
    }

    fn wrap(file: File) -> Self {
        let inner = csv::WriterBuilder::new()
            .delimiter(DELIMITER)
            .has_headers(false)
            .from_writer(file);
        Self { inner }
    }

    pub fn write(&mut self, record: &StandardizedRecord, result: &GeocodeResult) -> AppResult<()> {
        self.inner.write_record([
            record.code.as_str(),
            record.name.as_str(),
            record.street.as_str(),
            record.city.as_str(),
            record.postalcode.as_str(),
            result.lat.as_str(),
            result.lng.as_str(),
        ])?;
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn sheet() -> Vec<Vec<String>> {
        let mut rows = vec![
            row(&["Food establishment register"]),
            row(&["Published 2024", "", ""]),
            row(&["Approval Code", "Name", "Street", "City", "Postal code"]),
        ];
        rows.extend((0..7).map(|i| {
            let code = format!("{i}00");
            let name = format!("Plant {i}");
            row(&[code.as_str(), name.as_str(), "Teollisuuskatu 1", "Helsinki", "100"])
        }));
        rows
    }

    fn layout() -> ColumnLayout {
        ColumnLayout {
            header_keywords: vec!["code".into(), "name".into()],
            code: 0,
            name: 1,
            street: 2,
            city: 3,
            postalcode: 4,
        }
    }

    #[test]
    fn detects_header_where_all_keywords_meet() {
        let rows = sheet();
        assert_eq!(rows.len(), 10);
        let header = detect_header(&rows, &layout().header_keywords).unwrap();
        assert_eq!(header.header_index, 2);
        assert_eq!(header.data_start, 3);
        assert_eq!(header.column_count, rows[2].len());
    }

    #[test]
    fn missing_header_is_a_validation_error() {
        let rows = vec![row(&["code only"]), row(&["name only"])];
        let err = detect_header(&rows, &layout().header_keywords).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn zero_fills_numeric_postal_codes_only() {
        assert_eq!(zero_fill_postal_code("100", 5).as_deref(), Some("00100"));
        assert_eq!(zero_fill_postal_code(" 00100 ", 5).as_deref(), Some("00100"));
        assert_eq!(zero_fill_postal_code("", 5).as_deref(), Some(""));
        assert_eq!(zero_fill_postal_code("12A45", 5), None);
    }

    #[test]
    fn formats_codes_with_prefix_and_suffix() {
        assert_eq!(format_approval_code("HR", " 123 ", "EU"), "HR 123 EU");
        assert_eq!(format_approval_code("FI", "A  12", "EC"), "FI A 12 EC");
    }

    #[test]
    fn standardizes_and_drops_bad_postal_codes() {
        let mut rows = sheet();
        rows.push(row(&["999", "Odd", "Katu 2", "Espoo", "12A45"]));
        let format = RecordFormat {
            country_code: "FI".into(),
            code_suffix: "EC".into(),
            postal_code_width: Some(5),
        };
        let outcome = standardize_rows(&rows, &layout(), &format).unwrap();
        assert_eq!(outcome.records.len(), 7);
        assert_eq!(outcome.dropped, 1);
        let first = &outcome.records[0];
        assert_eq!(first.code, "FI 000 EC");
        assert_eq!(first.postalcode, "00100");
        assert!(outcome.records.iter().all(|r| r.code != "FI 999 EC"));
    }

    #[test]
    fn reads_input_and_writes_enriched_rows() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("FI.csv");
        std::fs::write(
            &input,
            "code;name;street;city;postalcode\nFI 1 EC;Dairy;Katu 1;Helsinki;00100\nFI 2 EC;Bakery;;Espoo;02100\n",
        )
        .unwrap();
        let records = read_records(&input).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].street, "");

        let output = dir.path().join("out").join("FI.csv");
        let mut writer = RecordWriter::create(&output).unwrap();
        writer
            .write(
                &records[0],
                &GeocodeResult {
                    lat: "60.17".into(),
                    lng: "24.94".into(),
                },
            )
            .unwrap();
        drop(writer);

        let written = std::fs::read_to_string(&output).unwrap();
        assert_eq!(
            written,
            "code;name;street;city;postalcode;lat;lng\nFI 1 EC;Dairy;Katu 1;Helsinki;00100;60.17;24.94\n"
        );
    }

    #[test]
    fn rejects_input_without_required_columns() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("bad.csv");
        std::fs::write(&input, "code;name\nFI 1 EC;Dairy\n").unwrap();
        let err = read_records(&input).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
