//! Failure taxonomy for the guarded write path.
//!
//! Every failure here reflects a data-integrity or policy problem that needs a
//! human decision, so nothing is retried and exit codes are derived from the
//! variant rather than from the message.
use crate::validate::Violation;
use std::process::ExitCode;
use thiserror::Error;

/// Exit status for validation, preflight, env-gate and malformed-input failures.
pub const EXIT_NO_GO: u8 = 2;
/// Exit status for fatal I/O, integrity and cell-safety failures.
pub const EXIT_FATAL: u8 = 1;

#[derive(Error, Debug)]
pub enum GuardError {
    /// Hash binding between template, lock and plan does not hold.
    #[error("config mismatch: {detail}")]
    ConfigMismatch { detail: String },

    /// Policy rules broke; carries the complete list.
    #[error("{stage} failed with {} violation(s)", violations.len())]
    PolicyViolation {
        stage: &'static str,
        violations: Vec<Violation>,
    },

    /// A live cell guard refused a write.
    #[error("cell safety violation at {sheet}!{cell}: {reason}")]
    CellSafetyViolation {
        sheet: String,
        cell: String,
        reason: String,
    },

    /// Input could not be parsed into the expected shape.
    #[error("malformed {what}: {detail}")]
    StructuralMalformation { what: String, detail: String },

    #[error("direct apply disabled; run with {var}=1")]
    EnvGate { var: &'static str },
}

impl GuardError {
    pub fn config_mismatch(detail: impl Into<String>) -> Self {
        GuardError::ConfigMismatch {
            detail: detail.into(),
        }
    }

    pub fn malformed(what: impl Into<String>, detail: impl Into<String>) -> Self {
        GuardError::StructuralMalformation {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn exit_status(&self) -> u8 {
        match self {
            GuardError::PolicyViolation { .. }
            | GuardError::StructuralMalformation { .. }
            | GuardError::EnvGate { .. } => EXIT_NO_GO,
            GuardError::ConfigMismatch { .. } | GuardError::CellSafetyViolation { .. } => {
                EXIT_FATAL
            }
        }
    }
}

/// Map any command failure to a process exit code.
///
/// Failures that are not part of the taxonomy (plain I/O) are fatal.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    let status = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<GuardError>())
        .map(GuardError::exit_status)
        .unwrap_or(EXIT_FATAL);
    ExitCode::from(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn policy_and_malformed_errors_exit_with_no_go() {
        let err = GuardError::PolicyViolation {
            stage: "validate",
            violations: Vec::new(),
        };
        assert_eq!(err.exit_status(), EXIT_NO_GO);
        assert_eq!(GuardError::malformed("plan", "not an object").exit_status(), EXIT_NO_GO);
        assert_eq!(GuardError::EnvGate { var: "X" }.exit_status(), EXIT_NO_GO);
    }

    #[test]
    fn integrity_errors_are_fatal() {
        assert_eq!(GuardError::config_mismatch("sha").exit_status(), EXIT_FATAL);
    }

    #[test]
    fn exit_code_looks_through_context() {
        let err: anyhow::Result<()> = Err(GuardError::malformed("plan", "x").into());
        let err = err.context("load plan").unwrap_err();
        assert_eq!(exit_code_for(&err), ExitCode::from(EXIT_NO_GO));

        let io = anyhow::anyhow!("disk on fire");
        assert_eq!(exit_code_for(&io), ExitCode::from(EXIT_FATAL));
    }
}
