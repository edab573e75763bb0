//! Results export for the teacher: one row per claimed box, sorted by symbol,
//! UTF-8 with a byte-order mark so spreadsheet tools pick the right encoding
//! for non-ASCII names.

use crate::model::Snapshot;

/// UTF-8 byte-order mark.
pub const BOM: char = '\u{FEFF}';

/// Column labels. Localized labels are fine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub symbol_header: String,
    pub claimant_header: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            symbol_header: "symbol".to_string(),
            claimant_header: "claimant".to_string(),
        }
    }
}

/// Quote a field if it would break the row.
fn escape_field(field: &str) -> String {
    if field.contains(|c| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render the results CSV, BOM included.
///
/// Only entries present in the snapshot's catalog are written.
pub fn export_csv(snapshot: &Snapshot, options: &ExportOptions) -> String {
    let mut rows: Vec<(&str, &str)> = snapshot
        .catalog
        .iter()
        .filter_map(|entry| {
            snapshot
                .assignee_of(&entry.id)
                .map(|claimant| (entry.symbol(), claimant))
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = String::new();
    out.push(BOM);
    out.push_str(&escape_field(&options.symbol_header));
    out.push(',');
    out.push_str(&escape_field(&options.claimant_header));

    for (symbol, claimant) in rows {
        out.push('\n');
        out.push_str(&escape_field(symbol));
        out.push(',');
        out.push_str(&escape_field(claimant));
    }

    out
}

/// File name for an export taken on `date` (already formatted, e.g. `2026-03-01`).
pub fn export_file_name(date: &str) -> String {
    format!("results_{date}.csv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CatalogEntry;

    fn finished() -> Snapshot {
        let mut snap = Snapshot::started(
            vec![
                CatalogEntry::new("TSLA", "Tesla", "Auto", ""),
                CatalogEntry::new("AAPL", "Apple", "Tech", ""),
                CatalogEntry::new("GOOG", "Alphabet", "Tech", ""),
            ],
            1,
        );
        let assignments = &mut snap.session.assignments;
        assignments.insert("TSLA".to_string(), "王小明".to_string());
        assignments.insert("AAPL".to_string(), "Alice".to_string());
        snap.ended(2)
    }

    #[test]
    fn test_export_starts_with_bom() {
        let csv = export_csv(&finished(), &ExportOptions::default());
        assert!(csv.starts_with('\u{FEFF}'));
        assert!(csv.as_bytes().starts_with(&[0xEF, 0xBB, 0xBF]));
    }

    #[test]
    fn test_export_rows_sorted_and_unclaimed_skipped() {
        let csv = export_csv(&finished(), &ExportOptions::default());
        let body = csv.trim_start_matches(BOM);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines, vec!["symbol,claimant", "AAPL,Alice", "TSLA,王小明"]);
    }

    #[test]
    fn test_export_localized_headers() {
        let options = ExportOptions {
            symbol_header: "股票代碼".to_string(),
            claimant_header: "分析師".to_string(),
        };
        let csv = export_csv(&finished(), &options);
        assert!(csv.trim_start_matches(BOM).starts_with("股票代碼,分析師\n"));
    }

    #[test]
    fn test_export_quotes_awkward_names() {
        let mut snap = finished();
        snap.session
            .assignments
            .insert("GOOG".to_string(), "Doe, \"JD\"".to_string());
        let csv = export_csv(&snap, &ExportOptions::default());
        assert!(csv.contains("GOOG,\"Doe, \"\"JD\"\"\""));
    }

    #[test]
    fn test_export_empty_session_is_header_only() {
        let snap = Snapshot::idle(Vec::new(), 0);
        let csv = export_csv(&snap, &ExportOptions::default());
        assert_eq!(csv, "\u{FEFF}symbol,claimant");
    }

    #[test]
    fn test_export_file_name() {
        assert_eq!(export_file_name("2026-03-01"), "results_2026-03-01.csv");
    }
}
