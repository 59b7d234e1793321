//! Locked writer: the only code path that mutates a document.
//!
//! Every write is re-checked against the lock and against the live cell state
//! before it lands, and every accepted write is followed by exactly one
//! flushed audit line. Nothing reaches the output path until `save_as`.
use crate::address::CellRef;
use crate::error::GuardError;
use crate::lock::TemplateLock;
use crate::plan::{Scalar, SourceRef, WriteMeta};
use crate::util::now_epoch_ms;
use crate::workbook::{CellInspector, Document};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One line of the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: u128,
    pub sheet: String,
    pub cell: String,
    pub old_value: Value,
    pub new_value: Value,
    pub source: SourceRef,
    pub meta: WriteMeta,
    pub plan_hash: String,
}

/// Append-only JSONL audit log, truncated when opened.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: File,
    records: usize,
}

impl AuditLog {
    pub fn create(path: &Path) -> Result<AuditLog> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("create audit log {}", path.display()))?;
        Ok(AuditLog {
            path: path.to_path_buf(),
            file,
            records: 0,
        })
    }

    /// Append one record and flush it to disk before returning.
    pub fn append(&mut self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize audit record")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("write {}", self.path.display()))?;
        self.file
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("sync {}", self.path.display()))?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Applies writes to a document it exclusively owns.
#[derive(Debug)]
pub struct LockedWriter<'a> {
    lock: &'a TemplateLock,
    document: Document,
    audit: AuditLog,
    plan_hash: String,
}

impl<'a> LockedWriter<'a> {
    pub fn new(
        document: Document,
        lock: &'a TemplateLock,
        audit: AuditLog,
        plan_hash: impl Into<String>,
    ) -> Self {
        LockedWriter {
            lock,
            document,
            audit,
            plan_hash: plan_hash.into(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn audit_records(&self) -> usize {
        self.audit.records()
    }

    /// Set one cell, failing closed on any policy or cell-state problem.
    pub fn write_cell(
        &mut self,
        sheet: &str,
        cell: &str,
        value: &Scalar,
        source: &SourceRef,
        meta: &WriteMeta,
    ) -> Result<()> {
        let at = self.check_target(sheet, cell)?;
        if value.is_formula() {
            return Err(self.refuse(cell, "value is a formula string"));
        }

        let old = self.document.set_value(at, value);
        let record = AuditRecord {
            timestamp: now_epoch_ms()?,
            sheet: sheet.to_string(),
            cell: cell.to_string(),
            old_value: old.to_json(),
            new_value: value.to_json(),
            source: source.clone(),
            meta: meta.clone(),
            plan_hash: self.plan_hash.clone(),
        };
        self.audit
            .append(&record)
            .with_context(|| format!("audit {sheet}!{cell}"))?;
        tracing::info!(sheet, cell, "applied write");
        Ok(())
    }

    fn check_target(&self, sheet: &str, cell: &str) -> Result<CellRef> {
        if sheet != self.lock.governing_sheet {
            return Err(self.refuse(cell, format!("sheet {sheet:?} is not the governing sheet")));
        }
        let at = CellRef::parse(cell).ok_or_else(|| self.refuse(cell, "invalid A1 address"))?;
        let column = at.column_letters();
        if self.lock.is_denied(&column) {
            return Err(self.refuse(cell, format!("column {column} is denied")));
        }
        if !self.lock.is_allowed(&column) {
            return Err(self.refuse(cell, format!("column {column} is not allowed")));
        }
        let grid = self.document.sheet();
        if grid.is_merged(at) {
            return Err(self.refuse(cell, "target is part of a merged region"));
        }
        if grid.is_formula(at) {
            return Err(self.refuse(cell, "target holds a formula"));
        }
        Ok(at)
    }

    fn refuse(&self, cell: &str, reason: impl Into<String>) -> anyhow::Error {
        let reason = reason.into();
        tracing::error!(cell, reason = %reason, "write refused");
        GuardError::CellSafetyViolation {
            sheet: self.lock.governing_sheet.clone(),
            cell: cell.to_string(),
            reason,
        }
        .into()
    }

    /// Serialize once and move the result into place atomically.
    pub fn save_as(self, path: &Path) -> Result<()> {
        let bytes = self.document.to_bytes().context("serialize workbook")?;
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("create temp file in {}", parent.display()))?;
        tmp.write_all(&bytes)
            .with_context(|| format!("write {}", tmp.path().display()))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("sync {}", tmp.path().display()))?;
        tmp.persist(path)
            .map_err(|err| err.error)
            .with_context(|| format!("publish {}", path.display()))?;
        tracing::info!(path = %path.display(), edits = self.document.edit_count(), "saved workbook");
        Ok(())
    }
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
