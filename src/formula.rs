//! Relative row shifting for A1 formulas copied between rows
//!
//! A formula copied from reference row 12 to new row 15 must keep pointing at
//! "its own row": `=I12*J12` becomes `=I15*J15`, while `$`-anchored rows stay put.

use regex::{Captures, Regex};
use std::sync::OnceLock;

fn cell_ref_pattern() -> &'static Regex {
    // Optional sheet prefix is left untouched; whole-column refs (A:A) have no row part.
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<col>\$?[A-Za-z]{1,3})(?P<anchor>\$?)(?P<row>\d+)\b").expect("static regex")
    })
}

/// Shift every relative row reference in `formula` by `delta` rows.
///
/// Text inside double-quoted string literals is not rewritten. References that would move
/// above row 1 are clamped to row 1.
pub fn shift_rows(formula: &str, delta: i64) -> String {
    if delta == 0 {
        return formula.to_string();
    }
    rewrite_rows(formula, |reference| {
        (!reference.anchored).then(|| (reference.row + delta).max(1))
    })
}

/// Re-address `formula` after rows were inserted into or removed from its own sheet:
/// every reference at or below `from_row` moves by `delta`, anchored or not.
///
/// Sheet-qualified references (`Other!B7`) are left alone.
pub fn shift_structural(formula: &str, from_row: u32, delta: i64) -> String {
    if delta == 0 {
        return formula.to_string();
    }
    rewrite_rows(formula, |reference| {
        (!reference.qualified && reference.row >= from_row as i64)
            .then(|| (reference.row + delta).max(1))
    })
}

struct RowRef {
    row: i64,
    anchored: bool,
    qualified: bool,
}

/// Replace row numbers of A1 references for which `remap` returns a new row
fn rewrite_rows(formula: &str, remap: impl Fn(&RowRef) -> Option<i64>) -> String {
    let mut out = String::with_capacity(formula.len());
    // Even segments are outside string literals, odd ones inside.
    for (i, segment) in formula.split('"').enumerate() {
        if i > 0 {
            out.push('"');
        }
        if i % 2 == 1 {
            out.push_str(segment);
            continue;
        }
        let shifted = cell_ref_pattern().replace_all(segment, |caps: &Captures| {
            let whole = caps.get(0).map(|m| (m.start(), m.end()));
            if is_name_fragment(segment, whole) {
                return caps[0].to_string();
            }
            let reference = RowRef {
                row: caps["row"].parse().unwrap_or(1),
                anchored: !caps["anchor"].is_empty(),
                qualified: whole
                    .map(|(start, _)| segment[..start].ends_with('!'))
                    .unwrap_or(false),
            };
            match remap(&reference) {
                Some(row) => format!("{}{}{}", &caps["col"], &caps["anchor"], row),
                None => caps[0].to_string(),
            }
        });
        out.push_str(&shifted);
    }
    out
}

/// True when the match is part of a name rather than a cell reference: glued to preceding
/// letters (`ATAN2`, `Sheet1`) or directly followed by a call (`LOG10(`).
fn is_name_fragment(segment: &str, span: Option<(usize, usize)>) -> bool {
    let Some((start, end)) = span else {
        return false;
    };
    let glued_before = segment[..start]
        .chars()
        .next_back()
        .map(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        .unwrap_or(false);
    let called = segment[end..].starts_with('(');
    glued_before || called
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_simple_refs() {
        assert_eq!(shift_rows("=I12*J12", 3), "=I15*J15");
        assert_eq!(shift_rows("=SUM(A2:A9)", 1), "=SUM(A3:A10)");
    }

    #[test]
    fn test_anchored_rows_stay() {
        assert_eq!(shift_rows("=I12*$B$1", 2), "=I14*$B$1");
        assert_eq!(shift_rows("=$I12+K$3", 2), "=$I14+K$3");
    }

    #[test]
    fn test_string_literals_untouched() {
        assert_eq!(shift_rows(r#"=IF(A2="B2","x",C2)"#, 1), r#"=IF(A3="B2","x",C3)"#);
    }

    #[test]
    fn test_function_names_untouched() {
        assert_eq!(shift_rows("=LOG10(A2)", 1), "=LOG10(A3)");
    }

    #[test]
    fn test_structural_shift_moves_rows_below() {
        assert_eq!(shift_structural("=SUM(B2:B9)*$C$4", 4, 1), "=SUM(B2:B10)*$C$5");
        assert_eq!(shift_structural("=B3+Other!B7", 3, -1), "=B2+Other!B7");
        assert_eq!(shift_structural("=B2", 3, 1), "=B2");
    }

    #[test]
    fn test_negative_shift_clamps() {
        assert_eq!(shift_rows("=A2+B5", -3), "=A1+B2");
        assert_eq!(shift_rows("=A2", 0), "=A2");
    }
}
