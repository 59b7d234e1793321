//! Template lock: the trusted write policy for one physical template.
//!
//! A lock is produced out-of-band (usually promoted from a discovery report by
//! a human) and never edited by this tool. Loading validates its internal
//! invariants so every consumer can rely on them.
use crate::address::column_index;
use crate::discovery::DiscoveryReport;
use crate::error::GuardError;
use crate::util::write_json;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Rows at or above this line count as the header block unless the lock says
/// otherwise.
pub const DEFAULT_HEADER_ROW_MAX: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSpan {
    pub first: u32,
    pub last: u32,
}

impl RowSpan {
    pub fn contains(&self, row: u32) -> bool {
        (self.first..=self.last).contains(&row)
    }
}

/// On-disk shape of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub template: TemplateSection,
    pub governing: GoverningSection,
    pub write_policy: WritePolicySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSection {
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoverningSection {
    pub sheet: String,
    pub code_rows: CodeRowsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRowsSection {
    pub span: RowSpan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritePolicySection {
    #[serde(default)]
    pub allowed_columns: Vec<String>,
    #[serde(default)]
    pub denied_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_row_max: Option<u32>,
}

/// Validated lock contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateLock {
    pub template_sha256: String,
    pub governing_sheet: String,
    pub code_row_span: RowSpan,
    pub allowed_columns: BTreeSet<String>,
    pub denied_columns: BTreeSet<String>,
    pub header_row_max: u32,
}

impl TemplateLock {
    /// Load and validate a lock file.
    pub fn load(path: &Path) -> Result<TemplateLock> {
        let bytes = fs::read(path).with_context(|| format!("read lock {}", path.display()))?;
        let file: LockFile = serde_json::from_slice(&bytes)
            .map_err(|err| GuardError::malformed("lock", err.to_string()))
            .with_context(|| format!("parse lock {}", path.display()))?;
        let lock = TemplateLock::from_file(file)
            .with_context(|| format!("load lock {}", path.display()))?;
        Ok(lock)
    }

    pub fn from_file(file: LockFile) -> std::result::Result<TemplateLock, GuardError> {
        let template_sha256 = file.template.sha256.trim().to_ascii_lowercase();
        if template_sha256.is_empty() {
            return Err(GuardError::malformed("lock", "template.sha256 is empty"));
        }
        let governing_sheet = file.governing.sheet;
        if governing_sheet.is_empty() {
            return Err(GuardError::malformed("lock", "governing.sheet is empty"));
        }
        let span = file.governing.code_rows.span;
        if span.first == 0 || span.first > span.last {
            return Err(GuardError::malformed(
                "lock",
                format!("invalid code row span {}..{}", span.first, span.last),
            ));
        }
        let allowed_columns = normalize_columns(&file.write_policy.allowed_columns)?;
        let denied_columns = normalize_columns(&file.write_policy.denied_columns)?;
        let overlap: Vec<&String> = allowed_columns.intersection(&denied_columns).collect();
        if !overlap.is_empty() {
            return Err(GuardError::malformed(
                "lock",
                format!("columns both allowed and denied: {overlap:?}"),
            ));
        }
        Ok(TemplateLock {
            template_sha256,
            governing_sheet,
            code_row_span: span,
            allowed_columns,
            denied_columns,
            header_row_max: file
                .write_policy
                .header_row_max
                .unwrap_or(DEFAULT_HEADER_ROW_MAX),
        })
    }

    pub fn to_file(&self) -> LockFile {
        LockFile {
            template: TemplateSection {
                sha256: self.template_sha256.clone(),
            },
            governing: GoverningSection {
                sheet: self.governing_sheet.clone(),
                code_rows: CodeRowsSection {
                    span: self.code_row_span,
                },
            },
            write_policy: WritePolicySection {
                allowed_columns: self.allowed_columns.iter().cloned().collect(),
                denied_columns: self.denied_columns.iter().cloned().collect(),
                header_row_max: Some(self.header_row_max),
            },
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, &self.to_file())
    }

    /// Build a draft lock from discovery evidence. Drafts need human review.
    pub fn draft_from_discovery(report: &DiscoveryReport) -> TemplateLock {
        TemplateLock {
            template_sha256: report.template_sha256.clone(),
            governing_sheet: report.sheet.clone(),
            code_row_span: report.row_span,
            allowed_columns: report.safe_columns.iter().cloned().collect(),
            denied_columns: report.locked_columns.iter().cloned().collect(),
            header_row_max: DEFAULT_HEADER_ROW_MAX,
        }
    }

    /// Code rows plus the header block.
    pub fn permits_row(&self, row: u32) -> bool {
        self.code_row_span.contains(row) || row <= self.header_row_max
    }

    pub fn is_denied(&self, column: &str) -> bool {
        self.denied_columns.contains(column)
    }

    pub fn is_allowed(&self, column: &str) -> bool {
        self.allowed_columns.contains(column)
    }
}

fn normalize_columns(raw: &[String]) -> std::result::Result<BTreeSet<String>, GuardError> {
    let mut columns = BTreeSet::new();
    for entry in raw {
        let column = entry.trim().to_ascii_uppercase();
        if column_index(&column).is_none() {
            return Err(GuardError::malformed(
                "lock",
                format!("invalid column letter {entry:?}"),
            ));
        }
        columns.insert(column);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lock_json() -> serde_json::Value {
        json!({
            "template": {"sha256": "ABC123"},
            "governing": {"sheet": "ESTIMATE (INPUT)", "code_rows": {"span": {"first": 13, "last": 220}}},
            "write_policy": {"allowed_columns": ["i", "J"], "denied_columns": ["T"]},
            "notes": "promoted from discovery"
        })
    }

    fn parse(value: serde_json::Value) -> std::result::Result<TemplateLock, GuardError> {
        TemplateLock::from_file(serde_json::from_value(value).expect("lock shape"))
    }

    #[test]
    fn loads_policy_with_defaults() {
        let lock = parse(lock_json()).expect("valid lock");
        assert_eq!(lock.template_sha256, "abc123");
        assert_eq!(lock.header_row_max, DEFAULT_HEADER_ROW_MAX);
        assert!(lock.is_allowed("I"));
        assert!(lock.is_denied("T"));
        assert!(lock.permits_row(13) && lock.permits_row(220) && lock.permits_row(3));
        assert!(!lock.permits_row(221));
    }

    #[test]
    fn overlapping_columns_are_rejected() {
        let mut value = lock_json();
        value["write_policy"]["denied_columns"] = json!(["T", "I"]);
        let err = parse(value).expect_err("overlap");
        assert!(err.to_string().contains("both allowed and denied"), "{err}");
    }

    #[test]
    fn inverted_span_is_rejected() {
        let mut value = lock_json();
        value["governing"]["code_rows"]["span"] = json!({"first": 50, "last": 13});
        assert!(matches!(
            parse(value),
            Err(GuardError::StructuralMalformation { .. })
        ));
    }

    #[test]
    fn header_row_max_override_is_honored() {
        let mut value = lock_json();
        value["write_policy"]["header_row_max"] = json!(4);
        let lock = parse(value).expect("valid lock");
        assert!(lock.permits_row(4));
        assert!(!lock.permits_row(5));
    }

    #[test]
    fn write_and_load_preserve_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("locks").join("template.lock.json");
        let lock = parse(lock_json()).expect("valid lock");
        lock.write(&path).expect("write lock");
        assert_eq!(TemplateLock::load(&path).expect("reload"), lock);
    }
}
