//! CLI argument parsing for the guarded write workflow.
//!
//! The CLI only wires paths and options into the library; every policy
//! decision lives in the lock and the plan.
use crate::discovery::{DEFAULT_SCAN_COLS, DEFAULT_SCAN_MAX_ROWS, DEFAULT_SHEET};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "sov-guard",
    version,
    about = "Lock-bound, audited writes into Schedule of Values workbooks",
    after_help = "Commands:\n  discover --template <xlsm> --out <json>      Classify write-safe columns (read-only)\n  census --template <xlsm> --out <json>        Survey CODE columns in every sheet (read-only;
                                               --code-register <csv> cross-checks codes)\n  check --plan <json> --lock <json>            Dry-run plan validation (GO / NO-GO)\n  apply --plan ... --out-xlsm ... --audit-jsonl ...  Apply a plan (requires SOV_HARDENED_APPLY=1)\n  batch --plans-dir <dir> --out-list <txt>     Screen plans and backfill missing plan_hash\n\nExamples:\n  sov-guard discover --template SOV.xlsm --out reports/safe_map.json --draft-lock locks/draft.json\n  sov-guard check --plan plans/hvac.json --lock locks/sov.lock.json --template SOV.xlsm\n  SOV_HARDENED_APPLY=1 sov-guard apply --plan plans/hvac.json --template SOV.xlsm \\\n      --lock locks/sov.lock.json --out-xlsm out/SOV_filled.xlsm --audit-jsonl out/audit.jsonl",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Discover(DiscoverArgs),
    Census(CensusArgs),
    Check(CheckArgs),
    Apply(ApplyArgs),
    Batch(BatchArgs),
}

/// Discovery inputs for one template.
#[derive(Parser, Debug)]
#[command(about = "Classify the governing sheet's columns as SAFE or LOCKED")]
pub struct DiscoverArgs {
    /// Pristine template workbook (.xlsx/.xlsm)
    #[arg(long, value_name = "PATH")]
    pub template: PathBuf,

    /// Governing sheet name
    #[arg(long, value_name = "NAME", default_value = DEFAULT_SHEET)]
    pub sheet: String,

    /// Column span to classify
    #[arg(long, value_name = "SPAN", default_value = DEFAULT_SCAN_COLS)]
    pub scan_cols: String,

    /// Maximum rows to walk below the CODE header
    #[arg(long, value_name = "N", default_value_t = DEFAULT_SCAN_MAX_ROWS)]
    pub scan_max_rows: u32,

    /// Output path for the discovery report JSON
    #[arg(long, value_name = "PATH")]
    pub out: PathBuf,

    /// Also write a draft lock for human review
    #[arg(long, value_name = "PATH")]
    pub draft_lock: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Survey CODE columns across every sheet (exit 2 on NO-GO)")]
pub struct CensusArgs {
    /// Template workbook to survey
    #[arg(long, value_name = "PATH")]
    pub template: PathBuf,

    /// Output path for the census report JSON
    #[arg(long, value_name = "PATH")]
    pub out: PathBuf,

    /// Code register CSV; template codes it does not list make the census NO-GO
    #[arg(long, value_name = "CSV")]
    pub code_register: Option<PathBuf>,

    /// Template lock JSON, recorded in the report for provenance
    #[arg(long, value_name = "PATH")]
    pub template_lock: Option<PathBuf>,
}

/// Dry validation inputs; never writes a workbook.
#[derive(Parser, Debug)]
#[command(about = "Validate a plan against a lock without writing anything")]
pub struct CheckArgs {
    /// Write plan JSON
    #[arg(long, value_name = "PATH")]
    pub plan: PathBuf,

    /// Template lock JSON
    #[arg(long, value_name = "PATH")]
    pub lock: PathBuf,

    /// Template workbook; enables sha and merged/formula target checks
    #[arg(long, value_name = "PATH")]
    pub template: Option<PathBuf>,

    /// Emit the verdict and violations as JSON
    #[arg(long)]
    pub json: bool,
}

/// Apply inputs; gated by SOV_HARDENED_APPLY=1.
#[derive(Parser, Debug)]
#[command(about = "Apply a validated plan to a copy of the template")]
pub struct ApplyArgs {
    /// Write plan JSON (must carry plan_hash)
    #[arg(long, value_name = "PATH")]
    pub plan: PathBuf,

    /// Pristine template workbook
    #[arg(long, value_name = "PATH")]
    pub template: PathBuf,

    /// Template lock JSON
    #[arg(long, value_name = "PATH")]
    pub lock: PathBuf,

    /// Output workbook path
    #[arg(long, value_name = "PATH")]
    pub out_xlsm: PathBuf,

    /// Audit log path (truncated when the apply stage starts)
    #[arg(long, value_name = "PATH")]
    pub audit_jsonl: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "Screen a directory of plans and backfill missing plan_hash")]
pub struct BatchArgs {
    /// Directory searched recursively for *.json plans
    #[arg(long, value_name = "DIR")]
    pub plans_dir: PathBuf,

    /// Template lock; when given, plan template sha must match it
    #[arg(long, value_name = "PATH")]
    pub lock: Option<PathBuf>,

    /// Output text file listing ready plan paths, one per line
    #[arg(long, value_name = "PATH")]
    pub out_list: PathBuf,

    /// Additional column to refuse (repeatable; T is always refused)
    #[arg(long = "deny-column", value_name = "COL")]
    pub deny_columns: Vec<String>,
}
