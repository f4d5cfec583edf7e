//! Engine configuration (YAML)
//!
//! Business-column mapping is deployment-specific, so every column the engine
//! touches comes from here rather than being hard-coded.

use crate::error::{ScheduleError, ScheduleResult};
use crate::identifier::column_letter_to_index;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SCHEDULE_FORGE_CONFIG";

/// How to choose between several rows matching in the same tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// First occurrence in document order (sheet order, then row order)
    #[default]
    First,
    /// Last occurrence in document order
    Last,
    /// Last row carrying a product name in `name_column`, else last row
    PreferNamed,
    /// Several candidates in the winning tier is an `AmbiguousMatch` error
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub tick_interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            tick_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub max_deletions: usize,
    pub max_writes: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_deletions: 30,
            max_writes: 500,
        }
    }
}

/// Where cancelled order rows go before they are deleted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelConfig {
    /// Archive sheet; an existing sheet whose name contains this is reused, otherwise a
    /// sheet with this name is added at the end
    pub sheet: String,
    /// Copy the row to the archive sheet before deleting it. Off for summary workbooks,
    /// which only drop the row.
    pub archive: bool,
    /// RGB hex font colour of archived rows
    pub font_color: String,
    /// RGB hex fill of archived rows
    pub fill: String,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            sheet: "Cancelled".to_string(),
            archive: true,
            font_color: "FF0000".to_string(),
            fill: "00B0F0".to_string(),
        }
    }
}

impl CancelConfig {
    pub fn font_rgb(&self) -> u32 {
        parse_rgb(&self.font_color).unwrap_or(0xFF0000)
    }

    pub fn fill_rgb(&self) -> u32 {
        parse_rgb(&self.fill).unwrap_or(0x00B0F0)
    }

    /// Sheet names that count as the archive
    pub fn is_archive(&self, sheet: &str) -> bool {
        let wanted = self.sheet.trim().to_lowercase();
        !wanted.is_empty() && sheet.to_lowercase().contains(&wanted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows at the top of every sheet that are never reference candidates
    pub header_rows: u32,
    /// Columns scanned in order for the SKU identifier
    pub identifier_columns: Vec<String>,
    /// Product-name column (used by `prefer_named`)
    pub name_column: Option<String>,
    /// Business field name → column letter
    pub columns: BTreeMap<String, String>,
    /// Columns blanked on new rows instead of inheriting reference values
    pub clear_columns: Vec<String>,
    pub tie_break: TieBreak,
    pub prefix_max_len_diff: usize,
    /// Sheets whose name contains any of these are never searched
    pub skip_sheet_keywords: Vec<String>,
    /// Use the last data row of a matched target sheet when no row matches
    pub fallback_to_last_row: bool,
    /// RGB hex fill for newly written rows (e.g. "DDEBF7")
    pub highlight_new_rows: Option<String>,
    pub lock_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub retry: RetryConfig,
    pub ledger: LedgerConfig,
    pub cancel: CancelConfig,
    /// Directory holding the persisted ledger and retry queue
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            header_rows: 1,
            identifier_columns: vec!["G".to_string(), "F".to_string(), "H".to_string()],
            name_column: None,
            columns: BTreeMap::new(),
            clear_columns: Vec::new(),
            tie_break: TieBreak::First,
            prefix_max_len_diff: 3,
            skip_sheet_keywords: Vec::new(),
            fallback_to_last_row: false,
            highlight_new_rows: None,
            lock_timeout_secs: 30,
            operation_timeout_secs: 120,
            retry: RetryConfig::default(),
            ledger: LedgerConfig::default(),
            cancel: CancelConfig::default(),
            data_dir: PathBuf::from(".schedule-forge"),
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file and validate
    pub fn load(path: &Path) -> ScheduleResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else from `$SCHEDULE_FORGE_CONFIG`, else defaults
    pub fn load_or_default(path: Option<&Path>) -> ScheduleResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(p) if Path::new(&p).exists() => Self::load(Path::new(&p)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> ScheduleResult<()> {
        if self.identifier_columns.is_empty() {
            return Err(ScheduleError::Config(
                "identifier_columns must name at least one column".to_string(),
            ));
        }
        let letters = self
            .identifier_columns
            .iter()
            .chain(self.clear_columns.iter())
            .chain(self.columns.values())
            .chain(self.name_column.iter());
        for letter in letters {
            if column_letter_to_index(letter).is_none() {
                return Err(ScheduleError::Config(format!(
                    "'{}' is not a column letter",
                    letter
                )));
            }
        }
        if self.lock_timeout_secs == 0 || self.operation_timeout_secs == 0 {
            return Err(ScheduleError::Config("timeouts must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ScheduleError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(hex) = &self.highlight_new_rows {
            parse_rgb(hex)?;
        }
        parse_rgb(&self.cancel.font_color)?;
        parse_rgb(&self.cancel.fill)?;
        if self.cancel.archive && self.cancel.sheet.trim().is_empty() {
            return Err(ScheduleError::Config(
                "cancel.sheet must be set when cancel.archive is on".to_string(),
            ));
        }
        Ok(())
    }

    /// Identifier columns as 0-based indexes, in scan order
    pub fn identifier_indexes(&self) -> Vec<u16> {
        self.identifier_columns
            .iter()
            .filter_map(|c| column_letter_to_index(c))
            .collect()
    }

    /// Primary identifier column (receives the record's SKU-SPEC)
    pub fn primary_identifier(&self) -> u16 {
        self.identifier_indexes().first().copied().unwrap_or(0)
    }

    pub fn name_index(&self) -> Option<u16> {
        self.name_column.as_deref().and_then(column_letter_to_index)
    }

    pub fn clear_indexes(&self) -> Vec<u16> {
        self.clear_columns
            .iter()
            .filter_map(|c| column_letter_to_index(c))
            .collect()
    }

    /// Column index for a record field: configured mapping first, then the key
    /// itself when it is an uppercase column letter (`"D"`, not `"qty"`).
    pub fn column_for_field(&self, field: &str) -> Option<u16> {
        match self.columns.get(field) {
            Some(letter) => column_letter_to_index(letter),
            None if field.chars().all(|c| c.is_ascii_uppercase()) => column_letter_to_index(field),
            None => None,
        }
    }

    pub fn highlight_rgb(&self) -> Option<u32> {
        self.highlight_new_rows
            .as_deref()
            .and_then(|hex| parse_rgb(hex).ok())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.json")
    }

    pub fn retries_path(&self) -> PathBuf {
        self.data_dir.join("retries.json")
    }
}

/// Parse "RRGGBB" or "#RRGGBB" into 0xRRGGBB
pub fn parse_rgb(hex: &str) -> ScheduleResult<u32> {
    let digits = hex.trim().trim_start_matches('#');
    if digits.len() != 6 {
        return Err(ScheduleError::Config(format!("'{}' is not an RGB hex colour", hex)));
    }
    u32::from_str_radix(digits, 16)
        .map_err(|_| ScheduleError::Config(format!("'{}' is not an RGB hex colour", hex)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.identifier_indexes(), vec![6, 5, 7]);
        assert_eq!(config.primary_identifier(), 6);
        assert_eq!(config.tie_break, TieBreak::First);
    }

    #[test]
    fn test_load_yaml() {
        let yaml = r##"
header_rows: 3
identifier_columns: [G]
columns:
  qty: I
  ship_date: M
tie_break: prefer_named
name_column: H
highlight_new_rows: "#DDEBF7"
retry:
  max_attempts: 5
cancel:
  sheet: Cancelled orders
  archive: false
"##;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.header_rows, 3);
        assert_eq!(config.column_for_field("qty"), Some(8));
        assert_eq!(config.column_for_field("D"), Some(3));
        assert_eq!(config.column_for_field("po number"), None);
        assert_eq!(config.column_for_field("price"), None);
        assert_eq!(config.tie_break, TieBreak::PreferNamed);
        assert_eq!(config.highlight_rgb(), Some(0xDDEBF7));
        assert_eq!(config.retry.max_attempts, 5);
        // untouched sections keep defaults
        assert_eq!(config.retry.tick_interval_secs, 60);
        assert_eq!(config.ledger.max_deletions, 30);
        assert!(!config.cancel.archive);
        assert!(config.cancel.is_archive("Cancelled Orders"));
        assert_eq!(config.cancel.fill_rgb(), 0x00B0F0);
    }

    #[test]
    fn test_validate_rejects_bad_letters() {
        let mut config = EngineConfig::default();
        config.columns.insert("qty".into(), "9".into());
        assert!(matches!(config.validate(), Err(ScheduleError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = EngineConfig {
            lock_timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_rgb() {
        assert_eq!(parse_rgb("FFFF00").unwrap(), 0xFFFF00);
        assert!(parse_rgb("yellow").is_err());
    }
}
