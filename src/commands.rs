//! Subcommand implementations.
//!
//! Each `run_*` turns parsed CLI arguments into library calls and prints the
//! human verdict on stdout. Failures propagate as `anyhow` errors; `main`
//! maps them to exit codes.
use crate::apply::{env_gate_open, ApplyRequest};
use crate::batch::{repair_batch, BatchOptions};
use crate::cli::{ApplyArgs, BatchArgs, CensusArgs, CheckArgs, DiscoverArgs};
use crate::discovery::{census, discover, CensusOptions, DiscoveryOptions, Verdict};
use crate::error::{GuardError, EXIT_NO_GO};
use crate::lock::TemplateLock;
use crate::plan::WritePlan;
use crate::util::write_json;
use crate::validate::{inspect_targets, validate, Violation};
use crate::workbook::Workbook;
use anyhow::{Context, Result};
use serde::Serialize;
use std::process::ExitCode;

pub fn run_apply(args: ApplyArgs) -> Result<ExitCode> {
    let request = ApplyRequest {
        plan: args.plan,
        template: args.template,
        lock: args.lock,
        out_xlsm: args.out_xlsm,
        audit_jsonl: args.audit_jsonl,
    };
    let summary = crate::apply::run_apply(&request, env_gate_open())?;
    println!(
        "DONE: {} write(s) applied (plan_hash {})",
        summary.writes, summary.plan_hash
    );
    println!("workbook: {}", summary.out_xlsm.display());
    println!("audit: {}", summary.audit_jsonl.display());
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct CheckReport<'a> {
    status: Verdict,
    plan: String,
    lock: String,
    writes: usize,
    violations: &'a [Violation],
}

/// Dry validation; exits 2 on NO-GO.
pub fn run_check(args: CheckArgs) -> Result<ExitCode> {
    let plan = WritePlan::load(&args.plan)?;
    let lock = TemplateLock::load(&args.lock)?;
    let mut violations = validate(&plan, &lock);

    if let Some(template) = args.template.as_deref() {
        let workbook = Workbook::open(template)?;
        if !workbook.sha256().eq_ignore_ascii_case(&lock.template_sha256) {
            return Err(GuardError::config_mismatch(format!(
                "template file sha {} does not match lock {}",
                workbook.sha256(),
                lock.template_sha256
            ))
            .into());
        }
        let sheet = workbook.sheet(&lock.governing_sheet)?;
        violations.extend(inspect_targets(&plan, &lock.governing_sheet, &sheet));
    }

    let status = if violations.is_empty() {
        Verdict::Go
    } else {
        Verdict::NoGo
    };
    if args.json {
        let report = CheckReport {
            status,
            plan: args.plan.display().to_string(),
            lock: args.lock.display().to_string(),
            writes: plan.writes.len(),
            violations: &violations,
        };
        let text = serde_json::to_string_pretty(&report).context("serialize check report")?;
        println!("{text}");
    } else {
        match status {
            Verdict::Go => println!("GO: {} write(s) pass validation", plan.writes.len()),
            Verdict::NoGo => {
                println!("NO-GO: {} violation(s)", violations.len());
                for violation in &violations {
                    println!("  {violation}");
                }
            }
        }
    }
    Ok(match status {
        Verdict::Go => ExitCode::SUCCESS,
        Verdict::NoGo => ExitCode::from(EXIT_NO_GO),
    })
}

pub fn run_discover(args: DiscoverArgs) -> Result<ExitCode> {
    let workbook = Workbook::open(&args.template)?;
    let options = DiscoveryOptions {
        sheet: args.sheet,
        scan_cols: args.scan_cols,
        scan_max_rows: args.scan_max_rows,
    };
    let report = discover(&workbook, &options)?;
    write_json(&args.out, &report).context("write discovery report")?;
    println!(
        "discovered {} code row(s) in {} (rows {}..={})",
        report.code_rows_count, report.sheet, report.row_span.first, report.row_span.last
    );
    println!("safe: {}", report.safe_columns.join(","));
    println!("locked: {}", report.locked_columns.join(","));
    println!("report: {}", args.out.display());

    if let Some(draft) = args.draft_lock.as_deref() {
        TemplateLock::draft_from_discovery(&report)
            .write(draft)
            .context("write draft lock")?;
        println!("draft lock (review before use): {}", draft.display());
    }
    Ok(ExitCode::SUCCESS)
}

pub fn run_census(args: CensusArgs) -> Result<ExitCode> {
    let workbook = Workbook::open(&args.template)?;
    let options = CensusOptions {
        code_register: args.code_register,
        template_lock: args.template_lock,
    };
    let report = census(&workbook, &options)?;
    write_json(&args.out, &report).context("write census report")?;
    for sheet in &report.per_sheet {
        if sheet.codes_found > 0 {
            println!(
                "{}: {} code(s), {} duplicate(s)",
                sheet.sheet,
                sheet.codes_found,
                sheet.duplicate_codes.len()
            );
        }
    }
    if let Some(path) = report.code_register_path.as_deref() {
        println!(
            "register: {path} ({} code(s), {} template code(s) missing)",
            report.code_register_codes,
            report.codes_missing_in_register.len()
        );
        for code in &report.codes_missing_in_register {
            println!("  missing: {code}");
        }
    }
    if let Some(path) = report.template_lock_path.as_deref() {
        println!("template lock: {path} (loaded: {})", report.template_lock_loaded);
    }
    for note in &report.notes {
        println!("note: {note}");
    }
    println!("report: {}", args.out.display());
    match report.status {
        Verdict::Go => {
            println!(
                "GO: {} code(s) found, {} unique",
                report.total_codes_found, report.unique_codes_found
            );
            Ok(ExitCode::SUCCESS)
        }
        Verdict::NoGo => {
            println!("NO-GO: {} note(s)", report.notes.len());
            Ok(ExitCode::from(EXIT_NO_GO))
        }
    }
}

pub fn run_batch(args: BatchArgs) -> Result<ExitCode> {
    let lock = args
        .lock
        .as_deref()
        .map(TemplateLock::load)
        .transpose()?;
    let options = BatchOptions::new(args.plans_dir, lock, &args.deny_columns, args.out_list);
    let summary = repair_batch(&options)?;
    let text = serde_json::to_string_pretty(&summary).context("serialize batch summary")?;
    println!("{text}");
    Ok(ExitCode::SUCCESS)
}
