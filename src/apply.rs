//! Apply driver: the one path allowed to produce a filled workbook.
//!
//! The run is a strict linear sequence of stages. Any failing stage halts the
//! run immediately; nothing is retried. No output file exists until the APPLY
//! stage opens the audit log, and the workbook only appears after every write
//! in the plan has succeeded.
use crate::error::GuardError;
use crate::lock::TemplateLock;
use crate::plan::WritePlan;
use crate::util::sha256_hex;
use crate::validate::{ensure_go, preflight, validate};
use crate::workbook::Workbook;
use crate::writer::{AuditLog, LockedWriter};
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Manual override that separates dry tooling from the mutating path.
pub const ENV_GATE_VAR: &str = "SOV_HARDENED_APPLY";

/// True when the process environment opens the apply gate.
pub fn env_gate_open() -> bool {
    std::env::var(ENV_GATE_VAR).is_ok_and(|value| value == "1")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    EnvGate,
    Load,
    ShaBinding,
    PlanHash,
    Preflight,
    Validate,
    Apply,
    Save,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::EnvGate => "env-gate",
            Stage::Load => "load",
            Stage::ShaBinding => "sha-binding",
            Stage::PlanHash => "plan-hash",
            Stage::Preflight => "preflight",
            Stage::Validate => "validate",
            Stage::Apply => "apply",
            Stage::Save => "save",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub plan: PathBuf,
    pub template: PathBuf,
    pub lock: PathBuf,
    pub out_xlsm: PathBuf,
    pub audit_jsonl: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ApplySummary {
    pub writes: usize,
    pub plan_hash: String,
    pub template_sha256: String,
    pub out_xlsm: PathBuf,
    pub audit_jsonl: PathBuf,
}

fn enter(stage: Stage) {
    tracing::info!(stage = %stage, "apply stage");
}

/// Run the full pipeline. `gate_open` is normally [`env_gate_open`].
pub fn run_apply(request: &ApplyRequest, gate_open: bool) -> Result<ApplySummary> {
    enter(Stage::Init);

    enter(Stage::EnvGate);
    if !gate_open {
        return Err(GuardError::EnvGate { var: ENV_GATE_VAR }.into());
    }

    enter(Stage::Load);
    let plan = WritePlan::load(&request.plan)?;
    let lock = TemplateLock::load(&request.lock)?;
    let template_bytes = read_template(&request.template)?;

    enter(Stage::ShaBinding);
    let template_sha256 = sha256_hex(&template_bytes);
    check_sha_binding(&plan, &lock, &template_sha256)?;

    enter(Stage::PlanHash);
    let plan_hash = check_plan_hash(&plan)?;

    enter(Stage::Preflight);
    ensure_go("preflight", preflight(&plan, &lock))?;
    tracing::info!(writes = plan.writes.len(), "preflight ok");

    enter(Stage::Validate);
    ensure_go("validate", validate(&plan, &lock))?;

    enter(Stage::Apply);
    let document = Workbook::from_bytes(template_bytes)
        .with_context(|| format!("load template {}", request.template.display()))?
        .into_document(&lock.governing_sheet)?;
    let audit = AuditLog::create(&request.audit_jsonl)?;
    let mut writer = LockedWriter::new(document, &lock, audit, plan_hash.clone());
    for (index, write) in plan.writes.iter().enumerate() {
        let value = write.scalar().ok_or_else(|| {
            GuardError::malformed("plan", format!("writes[{index}] has no scalar value"))
        })?;
        let source = write.source.as_ref().ok_or_else(|| {
            GuardError::malformed("plan", format!("writes[{index}] has no source"))
        })?;
        let meta = write.meta.as_ref().ok_or_else(|| {
            GuardError::malformed("plan", format!("writes[{index}] has no meta"))
        })?;
        writer
            .write_cell(&write.sheet, &write.cell, &value, source, meta)
            .with_context(|| format!("apply writes[{index}]"))?;
    }

    enter(Stage::Save);
    let writes = writer.audit_records();
    writer.save_as(&request.out_xlsm)?;

    enter(Stage::Done);
    Ok(ApplySummary {
        writes,
        plan_hash,
        template_sha256,
        out_xlsm: request.out_xlsm.clone(),
        audit_jsonl: request.audit_jsonl.clone(),
    })
}

fn read_template(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("read template {}", path.display()))
}

/// Plan, lock and the physical template must all name the same bytes.
fn check_sha_binding(plan: &WritePlan, lock: &TemplateLock, template_sha256: &str) -> Result<()> {
    let plan_sha = plan
        .template_sha256
        .as_deref()
        .ok_or_else(|| GuardError::config_mismatch("plan has no template_sha256"))?;
    if !plan_sha.eq_ignore_ascii_case(&lock.template_sha256) {
        return Err(GuardError::config_mismatch(format!(
            "template sha mismatch: plan={plan_sha} lock={}",
            lock.template_sha256
        ))
        .into());
    }
    if template_sha256 != lock.template_sha256 {
        return Err(GuardError::config_mismatch(format!(
            "template file sha {template_sha256} does not match lock {}",
            lock.template_sha256
        ))
        .into());
    }
    Ok(())
}

fn check_plan_hash(plan: &WritePlan) -> Result<String> {
    let expected = plan
        .plan_hash
        .as_deref()
        .ok_or_else(|| GuardError::config_mismatch("plan_hash missing from plan"))?;
    let actual = plan.computed_hash();
    if !expected.eq_ignore_ascii_case(&actual) {
        return Err(GuardError::config_mismatch(format!(
            "plan tamper detected: expected={expected} actual={actual}"
        ))
        .into());
    }
    Ok(actual)
}

#[cfg(test)]
#[path = "apply_tests.rs"]
mod tests;
