//! Incident record model, table merge, and ticket lookup for INSERA.

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime};

pub mod query;

pub use query::{format_reply, normalize_term, search, MatchedBy, SearchResult, MAX_RESULTS};

pub const CRATE_NAME: &str = "insera-core";

/// Workbook column names, in export order.
pub const COLUMNS: [&str; 10] = [
    "Incident",
    "Customer_Segment",
    "Workzone",
    "Ket_Gaul",
    "Compliance",
    "Service_No",
    "Reported_Date",
    "TTR_Customer",
    "Jenis_Ggn",
    "Summary",
];

/// One incident ticket row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub incident: String,
    pub customer_segment: String,
    pub workzone: String,
    pub ket_gaul: String,
    pub compliance: String,
    pub service_no: String,
    pub reported_date: Option<NaiveDateTime>,
    pub ttr_customer: Option<f64>,
    pub jenis_ggn: String,
    pub summary: String,
}

/// Uniqueness key of a record. Two missing dates compare equal.
pub type RecordKey<'a> = (&'a str, Option<NaiveDateTime>);

impl Record {
    pub fn key(&self) -> RecordKey<'_> {
        (self.incident.as_str(), self.reported_date)
    }
}

/// Inclusive span of reported dates across a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub earliest: NaiveDate,
    pub latest: NaiveDate,
}

/// Ordered incident rows, in ingestion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    records: Vec<Record>,
}

impl Table {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Earliest and latest reported date over the whole table, `None` when no
    /// record carries a date.
    pub fn date_range(&self) -> Option<DateRange> {
        let mut dates = self.records.iter().filter_map(|r| r.reported_date);
        let first = dates.next()?;
        let (min, max) = dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Some(DateRange {
            earliest: min.date(),
            latest: max.date(),
        })
    }
}

impl FromIterator<Record> for Table {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub table: Table,
    pub added: usize,
    pub skipped: usize,
}

/// Appends `incoming` after `current` and keeps only the first record for each
/// (incident, reported date) key. Neither input is modified.
pub fn merge(current: &Table, incoming: &Table) -> MergeOutcome {
    let mut seen: HashSet<RecordKey<'_>> = HashSet::with_capacity(current.len() + incoming.len());
    let mut records = Vec::with_capacity(current.len() + incoming.len());

    for record in current.records() {
        if seen.insert(record.key()) {
            records.push(record.clone());
        }
    }

    let base = records.len();
    let mut skipped = 0usize;
    for record in incoming.records() {
        if seen.insert(record.key()) {
            records.push(record.clone());
        } else {
            skipped += 1;
        }
    }

    MergeOutcome {
        added: records.len() - base,
        skipped,
        table: Table::new(records),
    }
}
