// CSV Normalizer - turns a delimited export plus a column mapping into
// canonical transaction candidates.

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::ledger::Candidate;

// ============================================================================
// DATE FORMATS
// ============================================================================

/// The fixed set of date conventions accepted from bank exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateFormat {
    /// 31/12/2023
    #[serde(rename = "dmy")]
    DayMonthYear,
    /// 12/31/2023
    #[serde(rename = "mdy")]
    MonthDayYear,
    /// 2023-12-31
    #[serde(rename = "iso")]
    Iso,
    /// 31-12-2023
    #[serde(rename = "dmy_dashed")]
    DayMonthYearDashed,
}

impl DateFormat {
    pub fn pattern(&self) -> &'static str {
        match self {
            DateFormat::DayMonthYear => "%d/%m/%Y",
            DateFormat::MonthDayYear => "%m/%d/%Y",
            DateFormat::Iso => "%Y-%m-%d",
            DateFormat::DayMonthYearDashed => "%d-%m-%Y",
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            DateFormat::DayMonthYear => "dmy",
            DateFormat::MonthDayYear => "mdy",
            DateFormat::Iso => "iso",
            DateFormat::DayMonthYearDashed => "dmy_dashed",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "dmy" => Some(DateFormat::DayMonthYear),
            "mdy" => Some(DateFormat::MonthDayYear),
            "iso" => Some(DateFormat::Iso),
            "dmy_dashed" => Some(DateFormat::DayMonthYearDashed),
            _ => None,
        }
    }

    /// Parse a date cell, reporting the failing row on error.
    pub fn parse_field(&self, raw: &str, row: usize) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(raw.trim(), self.pattern()).map_err(|_| {
            BridgeError::FieldParse {
                row,
                message: format!("unparsable date {:?} (expected {})", raw.trim(), self.pattern()),
            }
        })
    }
}

// ============================================================================
// MAPPING CONFIGURATION
// ============================================================================

/// Which CSV columns hold which transaction fields. Date and amount are
/// required; payee and memo fall back to empty strings when unmapped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnMappings {
    pub date: String,
    pub amount: String,
    #[serde(default)]
    pub payee: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    pub columns: ColumnMappings,
    pub date_format: DateFormat,
    #[serde(default)]
    pub skip_rows: usize,
    #[serde(default)]
    pub amount_inverted: bool,
}

// ============================================================================
// DETECTION & PREVIEW
// ============================================================================

/// Header names plus a small sample of data rows, for the mapping UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvPreview {
    pub columns: Vec<String>,
    pub preview_rows: Vec<Vec<String>>,
}

const PREVIEW_ROWS: usize = 5;

/// Reads the file content, skips `skip_rows` leading records, treats the next
/// record as the header and returns it with up to five sample rows.
pub fn detect_columns(content: &str, skip_rows: usize) -> Result<CsvPreview> {
    let mut records = read_records(content)?.into_iter().skip(skip_rows);

    let header = records
        .next()
        .ok_or_else(|| BridgeError::Format("file has no header row".to_string()))?;
    let columns: Vec<String> = header.iter().map(|c| c.trim().to_string()).collect();
    if columns.iter().all(|c| c.is_empty()) {
        return Err(BridgeError::Format("header row is empty".to_string()));
    }

    let preview_rows = records
        .take(PREVIEW_ROWS)
        .map(|r| r.iter().map(|c| c.trim().to_string()).collect())
        .collect();

    Ok(CsvPreview {
        columns,
        preview_rows,
    })
}

// ============================================================================
// PARSING
// ============================================================================

/// A data row that failed date or amount parsing. Non-fatal: the row is
/// skipped and counted, the rest of the file still parses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub candidates: Vec<Candidate>,
    pub row_errors: Vec<RowError>,
}

/// Parses the full file into transaction candidates using `mapping`.
///
/// Rejects before any row work when the mapping lacks a date or amount
/// column, or when a mapped required column is missing from the header.
pub fn parse(content: &str, mapping: &MappingConfig) -> Result<ParseOutcome> {
    if mapping.columns.date.trim().is_empty() {
        return Err(BridgeError::Configuration("no date column mapped".to_string()));
    }
    if mapping.columns.amount.trim().is_empty() {
        return Err(BridgeError::Configuration("no amount column mapped".to_string()));
    }

    let mut records = read_records(content)?.into_iter().skip(mapping.skip_rows);
    let header = records
        .next()
        .ok_or_else(|| BridgeError::Format("file has no header row".to_string()))?;

    let idx_date = required_column(&header, &mapping.columns.date)?;
    let idx_amount = required_column(&header, &mapping.columns.amount)?;
    let idx_payee = optional_column(&header, mapping.columns.payee.as_deref());
    let idx_memo = optional_column(&header, mapping.columns.memo.as_deref());

    let mut candidates = Vec::new();
    let mut row_errors = Vec::new();

    for (offset, record) in records.enumerate() {
        let row = offset + 1;
        if record.iter().all(|c| c.trim().is_empty()) {
            continue;
        }

        let date = match mapping
            .date_format
            .parse_field(record.get(idx_date).unwrap_or(""), row)
        {
            Ok(d) => d,
            Err(BridgeError::FieldParse { message, .. }) => {
                row_errors.push(RowError { row, message });
                continue;
            }
            Err(e) => return Err(e),
        };

        let raw_amount = record.get(idx_amount).unwrap_or("");
        let Some(mut amount_milliunits) = parse_amount_milliunits(raw_amount) else {
            row_errors.push(RowError {
                row,
                message: format!("unparsable amount {:?}", raw_amount.trim()),
            });
            continue;
        };
        if mapping.amount_inverted {
            amount_milliunits = -amount_milliunits;
        }

        let payee = idx_payee
            .and_then(|i| record.get(i))
            .unwrap_or("")
            .trim()
            .to_string();
        let memo = idx_memo
            .and_then(|i| record.get(i))
            .unwrap_or("")
            .trim()
            .to_string();

        candidates.push(Candidate {
            date,
            amount_milliunits,
            payee,
            memo,
            source_id: None,
        });
    }

    Ok(ParseOutcome {
        candidates,
        row_errors,
    })
}

/// Parses a decimal amount cell into milliunits. Tolerates currency symbols,
/// thousands separators, stray quotes and parenthesized negatives.
pub fn parse_amount_milliunits(raw: &str) -> Option<i64> {
    let cleaned = raw.replace(['$', ',', '"', ' '], "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }

    let (body, negate) = match cleaned
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
    {
        Some(inner) => (inner, true),
        None => (cleaned, false),
    };

    let value: f64 = body.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let milliunits = (value * 1000.0).round() as i64;
    Some(if negate { -milliunits } else { milliunits })
}

fn read_records(content: &str) -> Result<Vec<StringRecord>> {
    if content.trim().is_empty() {
        return Err(BridgeError::Format("file is empty".to_string()));
    }
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());
    let mut records = Vec::new();
    for result in rdr.records() {
        records.push(result?);
    }
    if records.is_empty() {
        return Err(BridgeError::Format("file has no rows".to_string()));
    }
    Ok(records)
}

fn required_column(header: &StringRecord, name: &str) -> Result<usize> {
    header
        .iter()
        .position(|c| c.trim() == name.trim())
        .ok_or_else(|| BridgeError::Format(format!("column {:?} not found in header", name)))
}

fn optional_column(header: &StringRecord, name: Option<&str>) -> Option<usize> {
    let name = name?.trim();
    if name.is_empty() {
        return None;
    }
    header.iter().position(|c| c.trim() == name)
}

// ============================================================================
// COLUMN AUTO-DETECTION
// ============================================================================

const DATE_KEYWORDS: &[&str] = &["date", "datum"];
const AMOUNT_KEYWORDS: &[&str] = &["amount", "value", "sum"];
const PAYEE_KEYWORDS: &[&str] = &["payee", "description", "merchant", "other party"];
const MEMO_KEYWORDS: &[&str] = &["memo", "reference", "particulars"];

/// Guesses a column mapping from header names: case-insensitive substring
/// match against a fixed keyword list per field, first match wins. Unmatched
/// fields stay empty for the user to fill in.
pub fn auto_detect_mapping(columns: &[String]) -> ColumnMappings {
    let find = |keywords: &[&str]| -> Option<String> {
        columns
            .iter()
            .find(|col| {
                let lower = col.to_lowercase();
                keywords.iter().any(|kw| lower.contains(kw))
            })
            .cloned()
    };

    ColumnMappings {
        date: find(DATE_KEYWORDS).unwrap_or_default(),
        amount: find(AMOUNT_KEYWORDS).unwrap_or_default(),
        payee: find(PAYEE_KEYWORDS),
        memo: find(MEMO_KEYWORDS),
    }
}

// ============================================================================
// TESTS
// ============================================================================
