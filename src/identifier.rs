//! SKU identifier normalization and column letter helpers
//!
//! Schedule files spell the same product in many ways (`92105-S001`, `92105-s001 `,
//! `92105-S001 (new)`), so every comparison goes through these normalizers.

use regex::Regex;
use std::sync::OnceLock;

fn base_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+[A-Za-z]*\d*)").expect("static regex"))
}

fn spec_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(\d+[A-Z]*\d*(?:-S\d+)?)").expect("static regex"))
}

fn compact(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Base product code: the portion before the spec suffix, uppercased.
///
/// - `125160H-S001` → `125160H`
/// - `15760UQ1` → `15760UQ1`
/// - `ABC-S001` → `ABC` (non-numeric codes fall back to the part before `-`)
pub fn item_code(raw: &str) -> String {
    let cleaned = compact(raw);
    let base = cleaned.split('-').next().unwrap_or("");
    match base_pattern().captures(base) {
        Some(caps) => caps[1].to_uppercase(),
        None => base.to_uppercase(),
    }
}

/// Combined SKU-SPEC code, uppercased (`92105-s001 ` → `92105-S001`).
///
/// Falls back to [`item_code`] for numeric codes without a spec suffix, and to the whole
/// compacted value for identifiers that do not start with digits.
pub fn sku_spec(raw: &str) -> String {
    let cleaned = compact(raw);
    match spec_pattern().captures(&cleaned) {
        Some(caps) => caps[1].to_uppercase(),
        None => cleaned.to_uppercase(),
    }
}

/// Combine a base SKU and optional spec suffix into the `SKU-SPEC` form.
pub fn combine(sku: &str, spec: Option<&str>) -> String {
    let sku = sku.trim();
    match spec.map(str::trim).filter(|s| !s.is_empty()) {
        Some(spec) => format!("{}-{}", sku, spec),
        None => sku.to_string(),
    }
}

/// Convert a 0-based column index to an Excel column letter (0→A, 25→Z, 26→AA)
pub fn column_index_to_letter(index: u16) -> String {
    let mut result = String::new();
    let mut idx = index as u32;

    loop {
        let remainder = idx % 26;
        result.insert(0, (b'A' + remainder as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }

    result
}

/// Convert an Excel column letter to a 0-based index (A→0, Z→25, AA→26).
///
/// Returns `None` for anything that is not 1-3 ASCII letters within the XFD limit.
pub fn column_letter_to_index(letter: &str) -> Option<u16> {
    let letter = letter.trim();
    if letter.is_empty() || letter.len() > 3 || !letter.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let mut n: u32 = 0;
    for c in letter.to_ascii_uppercase().bytes() {
        n = n * 26 + (c - b'A' + 1) as u32;
    }
    // XFD = 16384 columns
    if n > 16_384 {
        return None;
    }
    Some((n - 1) as u16)
}
