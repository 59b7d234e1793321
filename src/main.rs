use clap::Parser;
use sov_guard::cli::{Command, RootArgs};
use sov_guard::commands;
use sov_guard::error::{exit_code_for, GuardError};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = RootArgs::parse();
    let result = match cli.command {
        Command::Apply(args) => commands::run_apply(args),
        Command::Check(args) => commands::run_check(args),
        Command::Discover(args) => commands::run_discover(args),
        Command::Census(args) => commands::run_census(args),
        Command::Batch(args) => commands::run_batch(args),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(GuardError::PolicyViolation { violations, .. }) = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<GuardError>())
            {
                for violation in violations {
                    eprintln!("  {violation}");
                }
            }
            exit_code_for(&err)
        }
    }
}
