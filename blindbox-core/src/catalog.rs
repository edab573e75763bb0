//! Catalog CSV parsing and shuffling.
//!
//! Expected layout, one box per line after a header row:
//! ```text
//! symbol,name,category,hint
//! AAPL,Apple Inc.,Technology,Makes phones
//! ```
//! Short rows and blank lines are skipped. Ids must be unique, so a repeated
//! symbol keeps its first row.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

use crate::model::CatalogEntry;

/// Minimum number of columns for a usable row.
const MIN_COLUMNS: usize = 4;

/// Parse catalog CSV text. Never fails; unusable rows are dropped.
pub fn parse_catalog_csv(text: &str) -> Vec<CatalogEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for (line_no, raw) in text.lines().enumerate().skip(1) {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let columns: Vec<&str> = line.split(',').map(str::trim).collect();
        if columns.len() < MIN_COLUMNS {
            log::debug!("Catalog line {} has {} columns, skipping", line_no + 1, columns.len());
            continue;
        }

        let id = columns[0];
        if id.is_empty() || !seen.insert(id.to_string()) {
            log::warn!("Catalog line {}: empty or duplicate symbol '{id}'", line_no + 1);
            continue;
        }

        entries.push(CatalogEntry::new(id, columns[1], columns[2], columns[3]));
    }

    entries
}

/// Shuffle with the thread-local RNG.
pub fn shuffled(entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
    shuffled_with(entries, &mut rand::thread_rng())
}

/// Shuffle with a caller-supplied RNG.
pub fn shuffled_with<R: Rng + ?Sized>(
    mut entries: Vec<CatalogEntry>,
    rng: &mut R,
) -> Vec<CatalogEntry> {
    entries.shuffle(rng);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const SAMPLE: &str = "symbol,name,industry,hint\r\n\
        AAPL, Apple ,Tech,Phones\r\n\
        \r\n\
        GOOG,Alphabet,Tech,Search,extra\n\
        BAD,row\n\
        TSLA,Tesla,Auto,Cars\n";

    #[test]
    fn test_parse_skips_header_blank_and_short_rows() {
        let entries = parse_catalog_csv(SAMPLE);
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["AAPL", "GOOG", "TSLA"]);
    }

    #[test]
    fn test_parse_trims_columns() {
        let entries = parse_catalog_csv(SAMPLE);
        assert_eq!(entries[0].name, "Apple");
        assert_eq!(entries[0].category, "Tech");
        assert_eq!(entries[0].hint, "Phones");
    }

    #[test]
    fn test_parse_drops_duplicate_ids() {
        let text = "h,h,h,h\nAAPL,Apple,Tech,a\nAAPL,Other,Tech,b\n";
        let entries = parse_catalog_csv(text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Apple");
    }

    #[test]
    fn test_parse_empty_text() {
        assert!(parse_catalog_csv("").is_empty());
        assert!(parse_catalog_csv("symbol,name,industry,hint\n").is_empty());
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let entries = parse_catalog_csv(SAMPLE);
        let mut rng = StdRng::seed_from_u64(7);
        let mixed = shuffled_with(entries.clone(), &mut rng);

        assert_eq!(mixed.len(), entries.len());
        for entry in &entries {
            assert!(mixed.contains(entry));
        }
    }

    #[test]
    fn test_shuffle_deterministic_with_seed() {
        let entries = parse_catalog_csv(SAMPLE);
        let a = shuffled_with(entries.clone(), &mut StdRng::seed_from_u64(42));
        let b = shuffled_with(entries, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}
