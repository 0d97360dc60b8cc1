//! Ticket lookup and chat reply rendering.

use std::fmt::Write as _;

use crate::{DateRange, Record, Table};

/// Upper bound on records rendered per lookup.
pub const MAX_RESULTS: usize = 4;

pub const NOT_FOUND: &str = "Data tidak ditemukan nih..";

/// Replies stay under Telegram's 4096-character message limit.
pub const MAX_REPLY_CHARS: usize = 4000;

const ELLIPSIS: &str = "...";

const BANNER_HEAD: &str = "Data tiket dari tgl:";
const RANGE_UNAVAILABLE: &str = "tidak tersedia";
const MISSING: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    Incident,
    ServiceNo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchResult<'a> {
    /// Blank term; the table was not scanned.
    EmptyTerm,
    NotFound,
    Found {
        matched_by: MatchedBy,
        records: Vec<&'a Record>,
    },
}

impl<'a> SearchResult<'a> {
    pub fn records(&self) -> &[&'a Record] {
        match self {
            SearchResult::Found { records, .. } => records,
            _ => &[],
        }
    }

    pub fn matched_by(&self) -> Option<MatchedBy> {
        match self {
            SearchResult::Found { matched_by, .. } => Some(*matched_by),
            _ => None,
        }
    }
}

/// Trims the term and collapses inner whitespace runs to one space.
pub fn normalize_term(raw: &str) -> Option<String> {
    let term = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if term.is_empty() {
        None
    } else {
        Some(term)
    }
}

/// Case-insensitive substring lookup on incident, falling back to service
/// number when no incident matches.
pub fn search<'a>(table: &'a Table, raw_term: &str) -> SearchResult<'a> {
    let Some(term) = normalize_term(raw_term) else {
        return SearchResult::EmptyTerm;
    };
    let needle = term.to_lowercase();

    let records = matching(table, &needle, |r| r.incident.as_str());
    if !records.is_empty() {
        return SearchResult::Found {
            matched_by: MatchedBy::Incident,
            records,
        };
    }

    let records = matching(table, &needle, |r| r.service_no.as_str());
    if !records.is_empty() {
        return SearchResult::Found {
            matched_by: MatchedBy::ServiceNo,
            records,
        };
    }

    SearchResult::NotFound
}

fn matching<'a>(table: &'a Table, needle: &str, field: impl Fn(&Record) -> &str) -> Vec<&'a Record> {
    table
        .records()
        .iter()
        .filter(|r| field(r).to_lowercase().contains(needle))
        .take(MAX_RESULTS)
        .collect()
}

pub fn date_range_banner(range: Option<DateRange>) -> String {
    match range {
        Some(range) => format!(
            "{BANNER_HEAD}\n{} s/d {}\n\n",
            range.earliest.format("%Y-%m-%d"),
            range.latest.format("%Y-%m-%d")
        ),
        None => format!("{BANNER_HEAD}\n{RANGE_UNAVAILABLE}\n\n"),
    }
}

/// Renders the lookup reply: date range banner, one block per match, then
/// the summary of the first match.
pub fn format_reply(matches: &[&Record], range: Option<DateRange>) -> String {
    let mut out = date_range_banner(range);

    let Some(first) = matches.first() else {
        out.push_str(NOT_FOUND);
        return out;
    };

    for r in matches {
        let reported = r
            .reported_date
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| MISSING.to_string());
        let ttr = r
            .ttr_customer
            .map(|v| v.to_string())
            .unwrap_or_else(|| MISSING.to_string());
        let _ = write!(
            out,
            "{} {}\n{} {}\n{} {}\n{}\nTTR: {} Jam {}\n\n",
            r.incident,
            r.workzone,
            r.ket_gaul,
            r.compliance,
            r.service_no,
            r.customer_segment,
            reported,
            ttr,
            r.jenis_ggn
        );
    }
    let room = MAX_REPLY_CHARS.saturating_sub(out.chars().count());
    push_clipped(&mut out, &first.summary, room);
    out
}

/// Appends at most `room` characters of `text`, marking a cut with an ellipsis.
fn push_clipped(out: &mut String, text: &str, room: usize) {
    if text.chars().count() <= room {
        out.push_str(text);
        return;
    }
    let keep = room.saturating_sub(ELLIPSIS.len());
    out.extend(text.chars().take(keep));
    out.push_str(ELLIPSIS);
}
