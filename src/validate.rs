//! Plan validation against a template lock.
//!
//! Both passes are pure and accumulate every problem they find: an operator
//! fixing a rejected plan sees the whole list at once, and any non-empty
//! result means NO-GO for the entire plan.
//!
//! - [`preflight`] is the cheap structural pass the apply driver runs first:
//!   duplicate targets, cell syntax, denied columns and provenance presence.
//! - [`validate`] is the full policy check: template binding, sheet, row span,
//!   column policy, provenance completeness and value shape.
//! - [`inspect_targets`] looks at the template itself and is only used for dry
//!   checks; the writer re-checks cell state live regardless.
use crate::address::CellRef;
use crate::error::GuardError;
use crate::lock::TemplateLock;
use crate::plan::{PlannedWrite, Scalar, WritePlan};
use crate::workbook::CellInspector;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Stable violation codes, serialized in SCREAMING_SNAKE_CASE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    TemplateShaMismatch,
    NoWrites,
    WrongSheet,
    InvalidCell,
    RowOutOfSpan,
    DeniedColumn,
    ColumnNotAllowed,
    MissingSource,
    IncompleteSource,
    MissingMeta,
    IncompleteMeta,
    MissingValue,
    NonScalarValue,
    FormulaValue,
    DuplicateCell,
    MergedTarget,
    FormulaTarget,
}

impl ViolationKind {
    pub fn code(self) -> &'static str {
        match self {
            ViolationKind::TemplateShaMismatch => "TEMPLATE_SHA_MISMATCH",
            ViolationKind::NoWrites => "NO_WRITES",
            ViolationKind::WrongSheet => "WRONG_SHEET",
            ViolationKind::InvalidCell => "INVALID_CELL",
            ViolationKind::RowOutOfSpan => "ROW_OUT_OF_SPAN",
            ViolationKind::DeniedColumn => "DENIED_COLUMN",
            ViolationKind::ColumnNotAllowed => "COLUMN_NOT_ALLOWED",
            ViolationKind::MissingSource => "MISSING_SOURCE",
            ViolationKind::IncompleteSource => "INCOMPLETE_SOURCE",
            ViolationKind::MissingMeta => "MISSING_META",
            ViolationKind::IncompleteMeta => "INCOMPLETE_META",
            ViolationKind::MissingValue => "MISSING_VALUE",
            ViolationKind::NonScalarValue => "NON_SCALAR_VALUE",
            ViolationKind::FormulaValue => "FORMULA_VALUE",
            ViolationKind::DuplicateCell => "DUPLICATE_CELL",
            ViolationKind::MergedTarget => "MERGED_TARGET",
            ViolationKind::FormulaTarget => "FORMULA_TARGET",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell: Option<String>,
    pub message: String,
}

impl Violation {
    fn plan(kind: ViolationKind, message: impl Into<String>) -> Self {
        Violation {
            kind,
            index: None,
            cell: None,
            message: message.into(),
        }
    }

    fn write(
        kind: ViolationKind,
        index: usize,
        write: &PlannedWrite,
        message: impl Into<String>,
    ) -> Self {
        Violation {
            kind,
            index: Some(index),
            cell: Some(write.cell.clone()),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(index) = self.index {
            write!(f, " writes[{index}]")?;
        }
        if let Some(cell) = &self.cell {
            write!(f, " {cell}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Turn a non-empty violation list into a policy error for `stage`.
pub fn ensure_go(stage: &'static str, violations: Vec<Violation>) -> Result<(), GuardError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(GuardError::PolicyViolation { stage, violations })
    }
}

/// Full policy check of a plan against a lock.
pub fn validate(plan: &WritePlan, lock: &TemplateLock) -> Vec<Violation> {
    let mut violations = Vec::new();

    match plan.template_sha256.as_deref() {
        Some(sha) if sha.eq_ignore_ascii_case(&lock.template_sha256) => {}
        Some(sha) => violations.push(Violation::plan(
            ViolationKind::TemplateShaMismatch,
            format!("plan template_sha256 {sha} != lock {}", lock.template_sha256),
        )),
        None => violations.push(Violation::plan(
            ViolationKind::TemplateShaMismatch,
            "plan has no template_sha256",
        )),
    }

    if plan.writes.is_empty() {
        violations.push(Violation::plan(ViolationKind::NoWrites, "plan has no writes"));
    }

    for (index, write) in plan.writes.iter().enumerate() {
        check_write(index, write, lock, &mut violations);
    }
    violations
}

fn check_write(index: usize, write: &PlannedWrite, lock: &TemplateLock, out: &mut Vec<Violation>) {
    if write.sheet != lock.governing_sheet {
        out.push(Violation::write(
            ViolationKind::WrongSheet,
            index,
            write,
            format!(
                "sheet {:?} is not the governing sheet {:?}",
                write.sheet, lock.governing_sheet
            ),
        ));
    }

    match CellRef::parse(&write.cell) {
        None => out.push(invalid_cell(index, write)),
        Some(at) => {
            if !lock.permits_row(at.row) {
                out.push(Violation::write(
                    ViolationKind::RowOutOfSpan,
                    index,
                    write,
                    format!(
                        "row {} is outside code rows {}..={} and header block 1..={}",
                        at.row,
                        lock.code_row_span.first,
                        lock.code_row_span.last,
                        lock.header_row_max
                    ),
                ));
            }
            let column = at.column_letters();
            if lock.is_denied(&column) {
                out.push(Violation::write(
                    ViolationKind::DeniedColumn,
                    index,
                    write,
                    format!("column {column} is denied"),
                ));
            } else if !lock.is_allowed(&column) {
                out.push(Violation::write(
                    ViolationKind::ColumnNotAllowed,
                    index,
                    write,
                    format!("column {column} is not in allowed_columns"),
                ));
            }
        }
    }

    match &write.source {
        None => out.push(Violation::write(
            ViolationKind::MissingSource,
            index,
            write,
            "write has no source",
        )),
        Some(source) => {
            if !source.source_type.is_empty() && !source.is_known_type() {
                tracing::warn!(
                    index,
                    cell = %write.cell,
                    source_type = %source.source_type,
                    "unrecognized source_type"
                );
            }
            let missing = source.missing_fields();
            if !missing.is_empty() {
                out.push(Violation::write(
                    ViolationKind::IncompleteSource,
                    index,
                    write,
                    format!("source is missing {}", missing.join(", ")),
                ));
            }
        }
    }

    match &write.meta {
        None => out.push(Violation::write(
            ViolationKind::MissingMeta,
            index,
            write,
            "write has no meta",
        )),
        Some(meta) => {
            let missing = meta.missing_fields();
            if !missing.is_empty() {
                out.push(Violation::write(
                    ViolationKind::IncompleteMeta,
                    index,
                    write,
                    format!("meta is missing {}", missing.join(", ")),
                ));
            }
        }
    }

    match write.raw_value() {
        None => out.push(Violation::write(
            ViolationKind::MissingValue,
            index,
            write,
            "write has no value",
        )),
        Some(raw) => match Scalar::from_json(raw) {
            None => out.push(Violation::write(
                ViolationKind::NonScalarValue,
                index,
                write,
                "value must be a number, string or boolean",
            )),
            Some(value) if value.is_formula() => out.push(Violation::write(
                ViolationKind::FormulaValue,
                index,
                write,
                "value is a formula string",
            )),
            Some(_) => {}
        },
    }
}

/// Structural pass run before full validation.
pub fn preflight(plan: &WritePlan, lock: &TemplateLock) -> Vec<Violation> {
    let mut violations = Vec::new();

    let mut seen: BTreeMap<(&str, &str), Vec<usize>> = BTreeMap::new();
    for (index, write) in plan.writes.iter().enumerate() {
        seen.entry((write.sheet.as_str(), write.cell.as_str()))
            .or_default()
            .push(index);
    }
    for ((sheet, cell), indexes) in &seen {
        if indexes.len() > 1 {
            violations.push(Violation {
                kind: ViolationKind::DuplicateCell,
                index: indexes.first().copied(),
                cell: Some((*cell).to_string()),
                message: format!("{sheet}!{cell} is targeted {} times", indexes.len()),
            });
        }
    }

    for (index, write) in plan.writes.iter().enumerate() {
        match CellRef::parse(&write.cell) {
            None => violations.push(invalid_cell(index, write)),
            Some(at) => {
                let column = at.column_letters();
                if lock.is_denied(&column) {
                    violations.push(Violation::write(
                        ViolationKind::DeniedColumn,
                        index,
                        write,
                        format!("column {column} is denied"),
                    ));
                }
            }
        }
        if write.source.is_none() {
            violations.push(Violation::write(
                ViolationKind::MissingSource,
                index,
                write,
                "write has no source",
            ));
        }
        if write.meta.is_none() {
            violations.push(Violation::write(
                ViolationKind::MissingMeta,
                index,
                write,
                "write has no meta",
            ));
        }
    }
    violations
}

/// Report plan targets on the governing sheet that are merged or formula
/// cells in the template.
pub fn inspect_targets(
    plan: &WritePlan,
    governing_sheet: &str,
    cells: &dyn CellInspector,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (index, write) in plan.writes.iter().enumerate() {
        if write.sheet != governing_sheet {
            continue;
        }
        let Some(at) = CellRef::parse(&write.cell) else {
            continue;
        };
        if cells.is_merged(at) {
            violations.push(Violation::write(
                ViolationKind::MergedTarget,
                index,
                write,
                "target is part of a merged region",
            ));
        }
        if cells.is_formula(at) {
            violations.push(Violation::write(
                ViolationKind::FormulaTarget,
                index,
                write,
                "target holds a formula",
            ));
        }
    }
    violations
}

fn invalid_cell(index: usize, write: &PlannedWrite) -> Violation {
    Violation::write(
        ViolationKind::InvalidCell,
        index,
        write,
        format!("{:?} is not an A1 address", write.cell),
    )
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
