//! Plain-text views of a session for the terminal.

use std::fmt::Write;

use blindbox_core::{CatalogEntry, SessionPhase, Snapshot};

/// Shown instead of progress and boxes while the catalog is empty.
pub const EMPTY_CATALOG: &str =
    "No boxes yet: the catalog is empty. Run `blindbox teacher init` to load one.";

/// Find a box by its 1-based position or by entry id.
pub fn resolve_box<'a>(snapshot: &'a Snapshot, token: &str) -> Option<&'a CatalogEntry> {
    if let Ok(position) = token.parse::<usize>() {
        if let Some(entry) = position.checked_sub(1).and_then(|i| snapshot.catalog.get(i)) {
            return Some(entry);
        }
    }
    snapshot.entry(token)
}

fn percent(claimed: usize, total: usize) -> usize {
    if total == 0 {
        0
    } else {
        claimed * 100 / total
    }
}

/// Phase, progress and the claim table.
pub fn status_report(snapshot: &Snapshot) -> String {
    let (claimed, total) = snapshot.progress();
    let mut out = String::new();
    let _ = writeln!(out, "phase:   {}", snapshot.phase());
    if total == 0 {
        let _ = writeln!(out, "{EMPTY_CATALOG}");
        return out;
    }
    let _ = writeln!(
        out,
        "opened:  {claimed} / {total} ({}%)",
        percent(claimed, total)
    );
    for entry in &snapshot.catalog {
        if let Some(owner) = snapshot.assignee_of(&entry.id) {
            let _ = writeln!(out, "  {:<8} {:<24} {owner}", entry.symbol(), entry.name);
        }
    }
    out
}

/// Box grid as a student sees it: closed boxes stay anonymous.
pub fn box_grid(snapshot: &Snapshot, me: &str) -> String {
    let mut out = String::new();
    if snapshot.catalog.is_empty() {
        let _ = writeln!(out, "{EMPTY_CATALOG}");
        return out;
    }
    for (i, entry) in snapshot.catalog.iter().enumerate() {
        let cell = match snapshot.assignee_of(&entry.id) {
            Some(owner) if owner == me => format!("{} (yours)", entry.symbol()),
            Some(owner) => format!("{} ({owner})", entry.symbol()),
            None if snapshot.phase() == SessionPhase::Running => "closed".to_string(),
            None => "locked".to_string(),
        };
        let _ = writeln!(out, "#{:<3} {cell}", i + 1);
    }
    out
}

/// The card shown once a box is opened.
pub fn revealed_card(entry: &CatalogEntry, claimant: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "┌──────────────────────────────");
    let _ = writeln!(out, "│ {}  {}", entry.symbol(), entry.name);
    if !entry.category.is_empty() {
        let _ = writeln!(out, "│ {}", entry.category);
    }
    if !entry.hint.is_empty() {
        let _ = writeln!(out, "│ \"{}\"", entry.hint);
    }
    let _ = writeln!(out, "│ analyst: {claimant}");
    let _ = writeln!(out, "└──────────────────────────────");
    out
}

/// One line per change, for `watch`.
pub fn change_line(snapshot: &Snapshot) -> String {
    let (claimed, total) = snapshot.progress();
    format!(
        "{} {claimed}/{total} opened (updated {})",
        snapshot.phase(),
        snapshot.updated_at
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Snapshot {
        let mut snap = Snapshot::started(
            vec![
                CatalogEntry::new("AAPL", "Apple", "Tech", "Phones"),
                CatalogEntry::new("GOOG", "Alphabet", "Tech", ""),
                CatalogEntry::new("TSLA", "Tesla", "Auto", ""),
            ],
            1,
        );
        snap.session
            .assignments
            .insert("GOOG".to_string(), "Bob".to_string());
        snap
    }

    #[test]
    fn test_resolve_by_position_or_id() {
        let snap = snapshot();
        assert_eq!(resolve_box(&snap, "1").map(|e| e.id.as_str()), Some("AAPL"));
        assert_eq!(resolve_box(&snap, "TSLA").map(|e| e.id.as_str()), Some("TSLA"));
        assert!(resolve_box(&snap, "0").is_none());
        assert!(resolve_box(&snap, "4").is_none());
        assert!(resolve_box(&snap, "NFLX").is_none());
    }

    #[test]
    fn test_status_report() {
        let report = status_report(&snapshot());
        assert!(report.contains("phase:   Running"));
        assert!(report.contains("opened:  1 / 3 (33%)"));
        assert!(report.contains("GOOG"));
        assert!(!report.contains("AAPL"));
    }

    #[test]
    fn test_box_grid_hides_closed_boxes() {
        let grid = box_grid(&snapshot(), "Bob");
        let lines: Vec<&str> = grid.lines().collect();
        assert_eq!(lines, vec!["#1   closed", "#2   GOOG (yours)", "#3   closed"]);

        let ended = snapshot().ended(2);
        assert!(box_grid(&ended, "Alice").contains("#1   locked"));
        assert!(box_grid(&ended, "Alice").contains("GOOG (Bob)"));
    }

    #[test]
    fn test_revealed_card() {
        let entry = CatalogEntry::new("AAPL", "Apple", "Tech", "Phones");
        let card = revealed_card(&entry, "王小明");
        assert!(card.contains("AAPL  Apple"));
        assert!(card.contains("\"Phones\""));
        assert!(card.contains("analyst: 王小明"));
    }

    #[test]
    fn test_empty_catalog_says_so() {
        let snap = Snapshot::idle(Vec::new(), 0);
        let report = status_report(&snap);
        assert_eq!(report, format!("phase:   Idle\n{EMPTY_CATALOG}\n"));
        assert!(!report.contains("opened:"));
        assert_eq!(box_grid(&snap, "Alice"), format!("{EMPTY_CATALOG}\n"));
        assert!(EMPTY_CATALOG.contains("teacher init"));
        assert_eq!(change_line(&snap), "Idle 0/0 opened (updated 0)");
    }
}
