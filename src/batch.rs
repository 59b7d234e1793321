//! Batch plan repair.
//!
//! Screens a directory of candidate plans with the lock-independent structural
//! rules, counts every rejection by reason, and backfills a missing
//! `plan_hash` into a copy under the ready directory. Originals are never
//! touched, and a present-but-wrong hash is rejected rather than corrected.
use crate::address::CellRef;
use crate::lock::TemplateLock;
use crate::plan::{compute_plan_hash, PlannedWrite};
use crate::util::write_json;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Directory (under the plans directory) that receives repaired copies.
pub const READY_DIR_NAME: &str = "_batch_ready";
/// Known formula columns that are refused even without a lock.
pub const DEFAULT_DENIED_COLUMNS: [&str; 1] = ["T"];

const SIGNATURES_COMPONENT: &str = "signatures";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rejection {
    Signatures,
    BadJson,
    NotObject,
    NoWrites,
    MissingTemplateSha,
    ShaMismatch,
    BadWriteObj,
    MissingCellOrSheet,
    InvalidCell,
    FormulaColTarget,
    DupCellInPlan,
    MissingSource,
    IncompleteSource,
    MissingMeta,
    BadValue,
    FormulaValue,
    PlanHashMismatch,
}

impl Rejection {
    pub fn code(self) -> &'static str {
        match self {
            Rejection::Signatures => "signatures",
            Rejection::BadJson => "bad_json",
            Rejection::NotObject => "not_object",
            Rejection::NoWrites => "no_writes",
            Rejection::MissingTemplateSha => "missing_template_sha",
            Rejection::ShaMismatch => "sha_mismatch",
            Rejection::BadWriteObj => "bad_write_obj",
            Rejection::MissingCellOrSheet => "missing_cell_or_sheet",
            Rejection::InvalidCell => "invalid_cell",
            Rejection::FormulaColTarget => "formula_col_target",
            Rejection::DupCellInPlan => "dup_cell_in_plan",
            Rejection::MissingSource => "missing_source",
            Rejection::IncompleteSource => "incomplete_source",
            Rejection::MissingMeta => "missing_meta",
            Rejection::BadValue => "bad_value",
            Rejection::FormulaValue => "formula_value",
            Rejection::PlanHashMismatch => "plan_hash_mismatch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub plans_dir: PathBuf,
    pub lock: Option<TemplateLock>,
    pub denied_columns: BTreeSet<String>,
    pub out_list: PathBuf,
}

impl BatchOptions {
    /// Options with the default denied columns plus `extra_denied`.
    pub fn new(
        plans_dir: PathBuf,
        lock: Option<TemplateLock>,
        extra_denied: &[String],
        out_list: PathBuf,
    ) -> Self {
        let mut denied_columns: BTreeSet<String> =
            DEFAULT_DENIED_COLUMNS.iter().map(|c| c.to_string()).collect();
        denied_columns.extend(extra_denied.iter().map(|c| c.trim().to_ascii_uppercase()));
        BatchOptions {
            plans_dir,
            lock,
            denied_columns,
            out_list,
        }
    }

    fn ready_dir(&self) -> PathBuf {
        self.plans_dir.join(READY_DIR_NAME)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub lock_sha256: Option<String>,
    pub candidates: usize,
    pub ready: Vec<PathBuf>,
    pub fixed_plan_hash: usize,
    pub skipped: BTreeMap<&'static str, usize>,
    pub out_list: PathBuf,
}

enum Outcome {
    Ready,
    NeedsHash(Map<String, Value>),
    Rejected(Rejection),
}

/// Screen every candidate plan and write the ready list.
pub fn repair_batch(options: &BatchOptions) -> Result<BatchSummary> {
    let ready_dir = options.ready_dir();
    let candidates = collect_plan_files(&options.plans_dir, &ready_dir)?;
    let mut summary = BatchSummary {
        lock_sha256: options.lock.as_ref().map(|l| l.template_sha256.clone()),
        candidates: candidates.len(),
        ready: Vec::new(),
        fixed_plan_hash: 0,
        skipped: BTreeMap::new(),
        out_list: options.out_list.clone(),
    };

    for path in candidates {
        let relative = path.strip_prefix(&options.plans_dir).unwrap_or(&path);
        let outcome = if is_under_signatures(relative) {
            Outcome::Rejected(Rejection::Signatures)
        } else {
            let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            classify(&bytes, options)
        };
        match outcome {
            Outcome::Ready => summary.ready.push(path),
            Outcome::NeedsHash(plan) => {
                let dest = ready_dir.join(relative);
                write_json(&dest, &Value::Object(plan))
                    .with_context(|| format!("write repaired plan for {}", path.display()))?;
                tracing::info!(plan = %path.display(), repaired = %dest.display(), "backfilled plan_hash");
                summary.fixed_plan_hash += 1;
                summary.ready.push(dest);
            }
            Outcome::Rejected(reason) => {
                tracing::debug!(plan = %path.display(), reason = reason.code(), "plan rejected");
                *summary.skipped.entry(reason.code()).or_default() += 1;
            }
        }
    }

    write_ready_list(&options.out_list, &summary.ready)?;
    tracing::info!(
        candidates = summary.candidates,
        ready = summary.ready.len(),
        fixed = summary.fixed_plan_hash,
        "batch screened"
    );
    Ok(summary)
}

fn classify(bytes: &[u8], options: &BatchOptions) -> Outcome {
    let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
        return Outcome::Rejected(Rejection::BadJson);
    };
    let Value::Object(plan) = value else {
        return Outcome::Rejected(Rejection::NotObject);
    };
    let writes = match plan.get("writes") {
        Some(Value::Array(writes)) if !writes.is_empty() => writes,
        _ => return Outcome::Rejected(Rejection::NoWrites),
    };
    let template_sha = ["template_sha256", "template_sha"]
        .iter()
        .find_map(|key| plan.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()));
    let Some(template_sha) = template_sha else {
        return Outcome::Rejected(Rejection::MissingTemplateSha);
    };
    if let Some(lock) = &options.lock {
        if !template_sha.eq_ignore_ascii_case(&lock.template_sha256) {
            return Outcome::Rejected(Rejection::ShaMismatch);
        }
    }

    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    for raw in writes {
        if let Err(reason) = screen_write(raw, &options.denied_columns, &mut seen) {
            return Outcome::Rejected(reason);
        }
    }

    // Only an absent, null or empty hash is backfilled.
    let computed = compute_plan_hash(writes);
    match plan.get("plan_hash") {
        None | Some(Value::Null) => {}
        Some(Value::String(existing)) if existing.is_empty() => {}
        Some(Value::String(existing)) if existing.eq_ignore_ascii_case(&computed) => {
            return Outcome::Ready;
        }
        Some(_) => return Outcome::Rejected(Rejection::PlanHashMismatch),
    }
    let mut repaired = plan.clone();
    repaired.insert("plan_hash".to_string(), Value::String(computed));
    Outcome::NeedsHash(repaired)
}

fn screen_write(
    raw: &Value,
    denied_columns: &BTreeSet<String>,
    seen: &mut BTreeSet<(String, String)>,
) -> std::result::Result<(), Rejection> {
    if !raw.is_object() {
        return Err(Rejection::BadWriteObj);
    }
    let write: PlannedWrite =
        serde_json::from_value(raw.clone()).map_err(|_| Rejection::BadWriteObj)?;
    if write.sheet.is_empty() || write.cell.is_empty() {
        return Err(Rejection::MissingCellOrSheet);
    }
    let at = CellRef::parse(&write.cell).ok_or(Rejection::InvalidCell)?;
    if denied_columns.contains(&at.column_letters()) {
        return Err(Rejection::FormulaColTarget);
    }
    if !seen.insert((write.sheet.clone(), write.cell.clone())) {
        return Err(Rejection::DupCellInPlan);
    }
    let value = write.scalar().ok_or(Rejection::BadValue)?;
    if value.is_formula() {
        return Err(Rejection::FormulaValue);
    }
    let source = write.source.as_ref().ok_or(Rejection::MissingSource)?;
    if !source.missing_fields().is_empty() {
        return Err(Rejection::IncompleteSource);
    }
    match &write.meta {
        Some(meta) if meta.missing_fields().is_empty() => Ok(()),
        _ => Err(Rejection::MissingMeta),
    }
}

fn is_under_signatures(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| matches!(c, Component::Normal(name) if name == SIGNATURES_COMPONENT))
}

/// Every `*.json` below `root`, sorted, skipping the ready directory.
/// Symlinked directories are not followed.
fn collect_plan_files(root: &Path, ready_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("stat {}", path.display()))?;
            if file_type.is_dir() {
                if path != ready_dir {
                    pending.push(path);
                }
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn write_ready_list(path: &Path, ready: &[PathBuf]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut text = String::new();
    for plan in ready {
        text.push_str(&plan.display().to_string());
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;
