//! Reference Matcher: tiered identifier search across a workbook
//!
//! Matching runs against a [`WorkbookIndex`] taken at the start of a call, so every match
//! is expressed in the original row numbering of its sheet. The caller turns that into a
//! current physical row with the Offset Tracker.
//!
//! Tiers, strongest first:
//! 1. exact SKU-SPEC (`92105-S001`)
//! 2. base SKU (`92105`); a bare `92105` row beats variant rows such as `92105-S004`
//! 3. prefix in either direction (`9548` ↔ `9548G4`), bounded by `prefix_max_len_diff`

use tracing::debug;

use crate::config::{EngineConfig, TieBreak};
use crate::error::{ScheduleError, ScheduleResult};
use crate::identifier;
use crate::port::{DocumentPort, SessionId};
use crate::types::{MatchTier, OrderRecord};

/// Identifier-bearing content of one data row
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRow {
    pub row: u32,
    /// Non-empty identifier cells, in configured scan order
    pub identifiers: Vec<(u16, String)>,
    /// Row carries a product name
    pub named: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetIndex {
    pub name: String,
    pub rows: Vec<IndexedRow>,
    /// Last row below the header with any content
    pub last_data_row: Option<u32>,
}

/// Snapshot of every searchable sheet, in document order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkbookIndex {
    pub sheets: Vec<SheetIndex>,
}

impl WorkbookIndex {
    /// Read all searchable sheets through an open session.
    ///
    /// Sheets named with a skip keyword, and the cancellation archive, are left out
    /// entirely.
    pub fn build(
        port: &dyn DocumentPort,
        session: SessionId,
        config: &EngineConfig,
    ) -> ScheduleResult<Self> {
        let id_cols = config.identifier_indexes();
        let name_col = config.name_index();
        let mut sheets = Vec::new();

        for name in port.sheet_names(session)? {
            if is_skipped(&name, &config.skip_sheet_keywords) || config.cancel.is_archive(&name) {
                debug!(sheet = %name, "sheet skipped by keyword");
                continue;
            }
            let count = port.row_count(session, &name)?;
            let mut sheet = SheetIndex {
                name: name.clone(),
                rows: Vec::new(),
                last_data_row: None,
            };
            for row in (config.header_rows + 1)..=count {
                let snapshot = port.read_row(session, &name, row)?;
                if snapshot.is_blank() {
                    continue;
                }
                sheet.last_data_row = Some(row);
                let identifiers: Vec<(u16, String)> = id_cols
                    .iter()
                    .filter_map(|&col| {
                        let text = snapshot.value(col).as_text();
                        let text = text.trim();
                        (!text.is_empty()).then(|| (col, text.to_string()))
                    })
                    .collect();
                if identifiers.is_empty() {
                    continue;
                }
                let named = name_col
                    .map(|col| !snapshot.value(col).is_empty())
                    .unwrap_or(false);
                sheet.rows.push(IndexedRow {
                    row,
                    identifiers,
                    named,
                });
            }
            sheets.push(sheet);
        }
        Ok(Self { sheets })
    }

    pub fn sheet(&self, name: &str) -> Option<&SheetIndex> {
        self.sheets.iter().find(|s| s.name == name)
    }

    /// Sheets a record may be matched in: all of them, or those selected by `target`
    /// (exact name, then containment either way, then the target's leading digits).
    pub fn candidate_sheets(&self, target: Option<&str>) -> Vec<&SheetIndex> {
        let Some(target) = target.map(str::trim).filter(|t| !t.is_empty()) else {
            return self.sheets.iter().collect();
        };
        let exact: Vec<_> = self.sheets.iter().filter(|s| s.name == target).collect();
        if !exact.is_empty() {
            return exact;
        }
        let contained: Vec<_> = self
            .sheets
            .iter()
            .filter(|s| s.name.contains(target) || target.contains(s.name.as_str()))
            .collect();
        if !contained.is_empty() {
            return contained;
        }
        let digits: String = target.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Vec::new();
        }
        self.sheets
            .iter()
            .filter(|s| s.name.contains(&digits))
            .collect()
    }
}

fn is_skipped(sheet: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|k| !k.is_empty() && sheet.contains(k.as_str()))
}

/// Selected template row, in the original numbering of its sheet
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceMatch {
    pub sheet: String,
    pub row: u32,
    pub tier: MatchTier,
    /// Identifier text found in the row, as written in the sheet
    pub identifier: Option<String>,
    /// Column the identifier was found in
    pub column: Option<u16>,
}

#[derive(Debug, Clone)]
struct Candidate<'a> {
    sheet: &'a str,
    row: &'a IndexedRow,
    tier: MatchTier,
    /// Tier 2 only: identifier without a spec suffix
    bare: bool,
    column: u16,
    identifier: &'a str,
}

#[derive(Debug, Clone)]
pub struct ReferenceMatcher {
    tie_break: TieBreak,
    prefix_max_len_diff: usize,
    fallback_to_last_row: bool,
}

impl ReferenceMatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            tie_break: config.tie_break,
            prefix_max_len_diff: config.prefix_max_len_diff,
            fallback_to_last_row: config.fallback_to_last_row,
        }
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Find the template row for `record`
    pub fn find(&self, index: &WorkbookIndex, record: &OrderRecord) -> ScheduleResult<ReferenceMatch> {
        let no_match = || ScheduleError::NoMatchFound {
            record: record.id.to_string(),
            sku_spec: record.sku_spec.clone(),
        };

        let item = identifier::item_code(&record.sku);
        let spec = identifier::sku_spec(&record.sku_spec);
        if item.is_empty() && spec.is_empty() {
            return Err(no_match());
        }

        let sheets = index.candidate_sheets(record.target_sheet.as_deref());
        if sheets.is_empty() {
            debug!(record = %record.id, target = ?record.target_sheet, "target sheet not found");
            return Err(no_match());
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for sheet in &sheets {
            for row in &sheet.rows {
                if let Some(c) = self.classify(sheet, row, &item, &spec) {
                    candidates.push(c);
                }
            }
        }

        let Some(best_tier) = candidates.iter().map(|c| c.tier).min() else {
            return self.fallback(&sheets, record).ok_or_else(no_match);
        };
        candidates.retain(|c| c.tier == best_tier);
        if best_tier == MatchTier::BaseSku && candidates.iter().any(|c| c.bare) {
            candidates.retain(|c| c.bare);
        }

        let chosen = self.break_tie(&candidates, record)?;
        debug!(
            record = %record.id,
            sheet = chosen.sheet,
            row = chosen.row.row,
            tier = %chosen.tier,
            candidates = candidates.len(),
            "reference row selected"
        );
        Ok(ReferenceMatch {
            sheet: chosen.sheet.to_string(),
            row: chosen.row.row,
            tier: chosen.tier,
            identifier: Some(chosen.identifier.to_string()),
            column: Some(chosen.column),
        })
    }

    /// Find the row that already holds `record`'s SKU-SPEC, for edits of an existing order.
    ///
    /// Only exact matches count. More than one is an `AmbiguousMatch` whatever the
    /// tie-break setting.
    pub fn find_existing(
        &self,
        index: &WorkbookIndex,
        record: &OrderRecord,
    ) -> ScheduleResult<ReferenceMatch> {
        let spec = identifier::sku_spec(&record.sku_spec);
        if spec.is_empty() {
            return Err(ScheduleError::NoMatchFound {
                record: record.id.to_string(),
                sku_spec: record.sku_spec.clone(),
            });
        }

        let mut found = Vec::new();
        for sheet in index.candidate_sheets(record.target_sheet.as_deref()) {
            for row in &sheet.rows {
                let hit = row
                    .identifiers
                    .iter()
                    .find(|(_, raw)| identifier::sku_spec(raw) == spec);
                if let Some((col, raw)) = hit {
                    found.push(ReferenceMatch {
                        sheet: sheet.name.clone(),
                        row: row.row,
                        tier: MatchTier::ExactSkuSpec,
                        identifier: Some(raw.clone()),
                        column: Some(*col),
                    });
                }
            }
        }

        match found.len() {
            0 => Err(ScheduleError::NoMatchFound {
                record: record.id.to_string(),
                sku_spec: record.sku_spec.clone(),
            }),
            1 => Ok(found.remove(0)),
            n => Err(ScheduleError::AmbiguousMatch {
                record: record.id.to_string(),
                sku_spec: record.sku_spec.clone(),
                sheet: found[0].sheet.clone(),
                candidates: n,
            }),
        }
    }

    /// Best tier this row reaches across its identifier columns
    fn classify<'a>(
        &self,
        sheet: &'a SheetIndex,
        row: &'a IndexedRow,
        item: &str,
        spec: &str,
    ) -> Option<Candidate<'a>> {
        let mut best: Option<Candidate> = None;
        for (col, raw) in &row.identifiers {
            let cv_item = identifier::item_code(raw);
            if cv_item.is_empty() {
                continue;
            }
            let cv_spec = identifier::sku_spec(raw);
            let tier = if !spec.is_empty() && cv_spec == spec {
                MatchTier::ExactSkuSpec
            } else if !item.is_empty() && cv_item == item {
                MatchTier::BaseSku
            } else if self.prefix_match(&cv_item, item) {
                MatchTier::Prefix
            } else {
                continue;
            };
            if best.as_ref().map(|b| tier < b.tier).unwrap_or(true) {
                best = Some(Candidate {
                    sheet: &sheet.name,
                    row,
                    tier,
                    bare: cv_spec == cv_item,
                    column: *col,
                    identifier: raw,
                });
            }
        }
        best
    }

    fn prefix_match(&self, cv_item: &str, item: &str) -> bool {
        if item.is_empty() {
            return false;
        }
        cv_item.len().abs_diff(item.len()) <= self.prefix_max_len_diff
            && (cv_item.starts_with(item) || item.starts_with(cv_item))
    }

    fn break_tie<'c, 'a>(
        &self,
        candidates: &'c [Candidate<'a>],
        record: &OrderRecord,
    ) -> ScheduleResult<&'c Candidate<'a>> {
        let no_match = || ScheduleError::NoMatchFound {
            record: record.id.to_string(),
            sku_spec: record.sku_spec.clone(),
        };
        let chosen = match self.tie_break {
            TieBreak::First => candidates.first(),
            TieBreak::Last => candidates.last(),
            TieBreak::PreferNamed => candidates
                .iter()
                .rev()
                .find(|c| c.row.named)
                .or_else(|| candidates.last()),
            TieBreak::Strict => {
                if candidates.len() > 1 {
                    return Err(ScheduleError::AmbiguousMatch {
                        record: record.id.to_string(),
                        sku_spec: record.sku_spec.clone(),
                        sheet: candidates[0].sheet.to_string(),
                        candidates: candidates.len(),
                    });
                }
                candidates.first()
            }
        };
        chosen.ok_or_else(no_match)
    }

    fn fallback(&self, sheets: &[&SheetIndex], record: &OrderRecord) -> Option<ReferenceMatch> {
        if !self.fallback_to_last_row || record.target_sheet.is_none() {
            return None;
        }
        let sheet = sheets.iter().find(|s| s.last_data_row.is_some())?;
        let row = sheet.last_data_row?;
        debug!(record = %record.id, sheet = %sheet.name, row, "falling back to last data row");
        Some(ReferenceMatch {
            sheet: sheet.name.clone(),
            row,
            tier: MatchTier::LastDataRow,
            identifier: None,
            column: None,
        })
    }
}
