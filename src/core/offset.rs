//! Offset Tracker: per-sheet row bookkeeping across inserts and deletes
//!
//! A reference row found at the start of a batch is numbered in the *original* layout of
//! its sheet. Every physical mutation is logged per sheet, in order, at the physical row it
//! hit; resolving replays that sheet's log, so the answer is the same as re-reading the
//! document after each step. Other sheets' logs are never consulted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A row removed at physical position `row`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionMark {
    pub sheet: String,
    pub row: u32,
}

/// A row inserted so that it became physical row `position`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionMark {
    pub sheet: String,
    pub position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Insert,
    Delete,
}

/// One physical mutation, in the order it hit the workbook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub sheet: String,
    pub op: MutationOp,
    pub row: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Delete(u32),
    Insert(u32),
}

#[derive(Debug, Clone, Default)]
struct SheetOffsets {
    marks: Vec<Mark>,
    /// Current physical positions of rows inserted so far, oldest first
    inserted: Vec<u32>,
}

impl SheetOffsets {
    fn apply(&mut self, mark: Mark) {
        match mark {
            Mark::Delete(row) => {
                self.inserted.retain(|&p| p != row);
                for p in self.inserted.iter_mut().filter(|p| **p > row) {
                    *p -= 1;
                }
            }
            Mark::Insert(pos) => {
                for p in self.inserted.iter_mut().filter(|p| **p >= pos) {
                    *p += 1;
                }
                self.inserted.push(pos);
            }
        }
        self.marks.push(mark);
    }
}

/// Batch-scoped offset state, keyed by sheet name
#[derive(Debug, Clone, Default)]
pub struct OffsetTracker {
    sheets: HashMap<String, SheetOffsets>,
    log: Vec<Mutation>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from previously recorded mutations
    pub fn replay<'m>(mutations: impl IntoIterator<Item = &'m Mutation>) -> Self {
        let mut tracker = Self::new();
        for m in mutations {
            match m.op {
                MutationOp::Insert => {
                    tracker.register_insert(&m.sheet, m.row);
                }
                MutationOp::Delete => {
                    tracker.register_delete(&m.sheet, m.row);
                }
            }
        }
        tracker
    }

    /// Every registered mutation across all sheets, in order
    pub fn mutations(&self) -> &[Mutation] {
        &self.log
    }

    /// Record a physical delete. Call exactly once per mutation, in mutation order.
    pub fn register_delete(&mut self, sheet: &str, row: u32) -> DeletionMark {
        self.sheet_mut(sheet).apply(Mark::Delete(row));
        self.log.push(Mutation {
            sheet: sheet.to_string(),
            op: MutationOp::Delete,
            row,
        });
        DeletionMark {
            sheet: sheet.to_string(),
            row,
        }
    }

    /// Record a physical insert. Call exactly once per mutation, in mutation order.
    pub fn register_insert(&mut self, sheet: &str, position: u32) -> InsertionMark {
        self.sheet_mut(sheet).apply(Mark::Insert(position));
        self.log.push(Mutation {
            sheet: sheet.to_string(),
            op: MutationOp::Insert,
            row: position,
        });
        InsertionMark {
            sheet: sheet.to_string(),
            position,
        }
    }

    /// Current physical row of a row known as `reference_row` before any tracked mutation.
    ///
    /// `None` when that row itself has been deleted.
    pub fn resolve(&self, sheet: &str, reference_row: u32) -> Option<u32> {
        let Some(state) = self.sheets.get(sheet) else {
            return Some(reference_row);
        };
        let mut row = reference_row;
        for mark in &state.marks {
            match *mark {
                Mark::Delete(d) if d < row => row -= 1,
                Mark::Delete(d) if d == row => return None,
                Mark::Delete(_) => {}
                Mark::Insert(i) if i <= row => row += 1,
                Mark::Insert(_) => {}
            }
        }
        Some(row)
    }

    /// Position at which a row deleted from physical row `deleted_row` goes back, given the
    /// mutations registered after its deletion (starting at mark index `since`).
    ///
    /// The slot follows the row that came after the deleted one, so the restored row lands
    /// back between its original neighbours wherever they have moved.
    pub fn restore_slot(&self, sheet: &str, since: usize, deleted_row: u32) -> u32 {
        let Some(state) = self.sheets.get(sheet) else {
            return deleted_row;
        };
        let mut slot = deleted_row;
        for mark in state.marks.iter().skip(since) {
            match *mark {
                Mark::Delete(d) if d < slot => slot -= 1,
                Mark::Insert(i) if i <= slot => slot += 1,
                _ => {}
            }
        }
        slot
    }

    /// Physical position of the most recent surviving insert in `sheet`
    pub fn last_insert_pos(&self, sheet: &str) -> Option<u32> {
        self.sheets.get(sheet).and_then(|s| s.inserted.last().copied())
    }

    /// Current positions of all surviving inserts in `sheet`, oldest first
    pub fn inserted_positions(&self, sheet: &str) -> &[u32] {
        self.sheets
            .get(sheet)
            .map(|s| s.inserted.as_slice())
            .unwrap_or(&[])
    }

    /// Number of marks registered for `sheet` so far
    pub fn mark_count(&self, sheet: &str) -> usize {
        self.sheets.get(sheet).map(|s| s.marks.len()).unwrap_or(0)
    }

    fn sheet_mut(&mut self, sheet: &str) -> &mut SheetOffsets {
        self.sheets.entry(sheet.to_string()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_shifts_later_rows_up() {
        let mut t = OffsetTracker::new();
        t.register_delete("S", 3);
        assert_eq!(t.resolve("S", 2), Some(2));
        assert_eq!(t.resolve("S", 3), None);
        assert_eq!(t.resolve("S", 7), Some(6));
    }

    #[test]
    fn test_insert_at_or_above_shifts_down() {
        let mut t = OffsetTracker::new();
        t.register_insert("S", 5);
        assert_eq!(t.resolve("S", 4), Some(4));
        assert_eq!(t.resolve("S", 5), Some(6));
    }

    #[test]
    fn test_last_insert_pos_tracks_shifts() {
        let mut t = OffsetTracker::new();
        assert_eq!(t.last_insert_pos("S"), None);
        t.register_insert("S", 8);
        t.register_insert("S", 3);
        assert_eq!(t.inserted_positions("S"), &[9, 3]);
        assert_eq!(t.last_insert_pos("S"), Some(3));

        // removing the latest insert falls back to the previous survivor
        t.register_delete("S", 3);
        assert_eq!(t.last_insert_pos("S"), Some(8));
    }

    #[test]
    fn test_restore_slot_follows_neighbours() {
        let mut t = OffsetTracker::new();
        t.register_delete("S", 5);
        let since = t.mark_count("S");
        t.register_insert("S", 2);
        assert_eq!(t.restore_slot("S", since, 5), 6);

        t.register_delete("S", 6); // the old follower goes too
        assert_eq!(t.restore_slot("S", since, 5), 6);

        t.register_insert("S", 10);
        assert_eq!(t.restore_slot("S", since, 5), 6);
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let mut t = OffsetTracker::new();
        t.register_insert("A", 4);
        t.register_delete("B", 2);
        t.register_delete("A", 9);
        let copy = OffsetTracker::replay(t.mutations());
        assert_eq!(copy.mutations(), t.mutations());
        assert_eq!(copy.resolve("A", 10), t.resolve("A", 10));
        assert_eq!(copy.resolve("B", 5), Some(4));
    }

    #[test]
    fn test_unknown_sheet_is_identity() {
        let t = OffsetTracker::new();
        assert_eq!(t.resolve("Other", 12), Some(12));
        assert_eq!(t.restore_slot("Other", 0, 12), 12);
        assert_eq!(t.mark_count("Other"), 0);
    }
}
