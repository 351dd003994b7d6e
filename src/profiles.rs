// Bank Profile Registry - static presets that pre-fill a CSV mapping
// configuration for common NZ bank exports.

use serde::Serialize;

use crate::csv_import::{ColumnMappings, DateFormat, MappingConfig};

/// A named preset: column names, date convention, header-skip count and sign
/// convention for one bank's CSV export. Plain data, no dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct BankProfile {
    pub key: &'static str,
    pub name: &'static str,
    pub date_column: &'static str,
    pub amount_column: &'static str,
    pub payee_column: &'static str,
    pub memo_column: &'static str,
    pub date_format: DateFormat,
    pub skip_rows: usize,
    pub amount_inverted: bool,
}

impl BankProfile {
    /// Copies the preset into an active mapping configuration. The registry
    /// itself is never mutated.
    pub fn mapping(&self) -> MappingConfig {
        MappingConfig {
            columns: ColumnMappings {
                date: self.date_column.to_string(),
                amount: self.amount_column.to_string(),
                payee: Some(self.payee_column.to_string()),
                memo: Some(self.memo_column.to_string()),
            },
            date_format: self.date_format,
            skip_rows: self.skip_rows,
            amount_inverted: self.amount_inverted,
        }
    }
}

pub const BANK_PROFILES: &[BankProfile] = &[
    BankProfile {
        key: "asb",
        name: "ASB Bank",
        date_column: "Date",
        amount_column: "Amount",
        payee_column: "Payee",
        memo_column: "Memo",
        date_format: DateFormat::DayMonthYear,
        skip_rows: 0,
        amount_inverted: false,
    },
    BankProfile {
        key: "anz",
        name: "ANZ Bank",
        date_column: "Date",
        amount_column: "Amount",
        payee_column: "Description",
        memo_column: "Reference",
        date_format: DateFormat::DayMonthYear,
        skip_rows: 0,
        amount_inverted: false,
    },
    BankProfile {
        key: "westpac",
        name: "Westpac",
        date_column: "Date",
        amount_column: "Amount",
        payee_column: "Other Party",
        memo_column: "Particulars",
        date_format: DateFormat::DayMonthYear,
        skip_rows: 0,
        amount_inverted: false,
    },
    BankProfile {
        key: "bnz",
        name: "BNZ",
        date_column: "Date",
        amount_column: "Amount",
        payee_column: "Payee",
        memo_column: "Particulars",
        date_format: DateFormat::DayMonthYear,
        skip_rows: 0,
        amount_inverted: false,
    },
    BankProfile {
        key: "kiwibank",
        name: "Kiwibank",
        date_column: "Date",
        amount_column: "Amount",
        payee_column: "Description",
        memo_column: "Reference",
        date_format: DateFormat::DayMonthYear,
        skip_rows: 0,
        amount_inverted: false,
    },
];

pub fn profile(key: &str) -> Option<&'static BankProfile> {
    BANK_PROFILES.iter().find(|p| p.key == key)
}

pub fn all_profiles() -> &'static [BankProfile] {
    BANK_PROFILES
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv_import::parse;

    #[test]
    fn registry_covers_the_big_five() {
        for key in ["asb", "anz", "westpac", "bnz", "kiwibank"] {
            assert!(profile(key).is_some(), "missing profile {key}");
        }
        assert!(profile("unknown").is_none());
    }

    #[test]
    fn applying_a_profile_copies_fields() {
        let mapping = profile("westpac").unwrap().mapping();
        assert_eq!(mapping.columns.date, "Date");
        assert_eq!(mapping.columns.payee.as_deref(), Some("Other Party"));
        assert_eq!(mapping.columns.memo.as_deref(), Some("Particulars"));
        assert_eq!(mapping.date_format, DateFormat::DayMonthYear);
        assert!(!mapping.amount_inverted);
    }

    #[test]
    fn asb_profile_round_trips_a_sample_export() {
        let content = "\
Date,Payee,Memo,Amount
31/12/2023,New World,groceries,-82.15
02/01/2024,Interest,,1.23
";
        let outcome = parse(content, &profile("asb").unwrap().mapping()).unwrap();
        assert!(outcome.row_errors.is_empty());
        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.candidates[0].amount_milliunits, -82_150);
        assert_eq!(outcome.candidates[0].payee, "New World");
        assert_eq!(outcome.candidates[1].amount_milliunits, 1_230);
    }

    #[test]
    fn inverted_mapping_flips_export_sign() {
        let content = "Date,Payee,Memo,Amount\n31/12/2023,Card Payment,,82.15\n";
        let mut mapping = profile("asb").unwrap().mapping();
        mapping.amount_inverted = true;
        let outcome = parse(content, &mapping).unwrap();
        assert_eq!(outcome.candidates[0].amount_milliunits, -82_150);
    }
}
