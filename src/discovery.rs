//! Read-only template surveys.
//!
//! [`discover`] classifies the columns of the governing sheet as write-safe or
//! locked based on what the numeric code rows actually contain. [`census`]
//! counts the CODE columns of every sheet and, given a code register CSV,
//! reports template codes the register does not know. Neither ever writes a
//! workbook; the discovery report is evidence a human promotes into a lock.
use crate::address::{column_letters, parse_column_span, CellRef};
use crate::error::GuardError;
use crate::lock::RowSpan;
use crate::util::now_epoch_ms;
use crate::workbook::{CellInspector, CellValue, Sheet, Workbook};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SHEET: &str = "ESTIMATE (INPUT)";
pub const DEFAULT_SCAN_COLS: &str = "A:AZ";
pub const DEFAULT_SCAN_MAX_ROWS: u32 = 2500;
pub const CENSUS_SCAN_MAX_ROWS: u32 = 3000;

const DISCOVERY_HEADER_WINDOW: (u32, u32) = (150, 80);
const CENSUS_HEADER_WINDOW: (u32, u32) = (100, 80);
const BLANK_RUN_LIMIT: u32 = 25;
const NON_CODE_RUN_LIMIT: u32 = 5;
/// Register header names (lowercased) that mark the code column.
const REGISTER_CODE_HEADERS: [&str; 6] =
    ["code", "cost code", "cost_code", "csi", "sov code", "sov_code"];

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub sheet: String,
    pub scan_cols: String,
    pub scan_max_rows: u32,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            sheet: DEFAULT_SHEET.to_string(),
            scan_cols: DEFAULT_SCAN_COLS.to_string(),
            scan_max_rows: DEFAULT_SCAN_MAX_ROWS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnStats {
    pub column: String,
    pub formula: u32,
    pub merged: u32,
    pub blank: u32,
    pub value: u32,
    pub colored: u32,
}

impl ColumnStats {
    fn new(column: String) -> Self {
        ColumnStats {
            column,
            formula: 0,
            merged: 0,
            blank: 0,
            value: 0,
            colored: 0,
        }
    }

    pub fn is_safe(&self) -> bool {
        self.formula == 0 && self.merged == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub generated_at_epoch_ms: u128,
    pub template_sha256: String,
    pub sheet: String,
    pub header_position: CodeHeader,
    pub code_rows_count: usize,
    pub row_span: RowSpan,
    pub scan_cols: String,
    pub safe_columns: Vec<String>,
    pub locked_columns: Vec<String>,
    pub per_column_stats: Vec<ColumnStats>,
}

/// Position of a CODE header cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeHeader {
    pub row: u32,
    pub col: u32,
    pub col_letter: String,
}

impl From<CellRef> for CodeHeader {
    fn from(at: CellRef) -> Self {
        CodeHeader {
            row: at.row,
            col: at.col,
            col_letter: column_letters(at.col),
        }
    }
}

/// Classify the columns of the governing sheet.
pub fn discover(workbook: &Workbook, options: &DiscoveryOptions) -> Result<DiscoveryReport> {
    let (first_col, last_col) = parse_column_span(&options.scan_cols).ok_or_else(|| {
        GuardError::malformed(
            "scan columns",
            format!("expected a span like A:AZ, got {:?}", options.scan_cols),
        )
    })?;
    let sheet = workbook.sheet(&options.sheet)?;

    let headers = find_code_headers(&sheet, DISCOVERY_HEADER_WINDOW);
    // Leftmost wins; topmost breaks ties.
    let header = headers
        .iter()
        .min_by_key(|at| (at.col, at.row))
        .copied()
        .ok_or_else(|| {
            GuardError::malformed(
                "template",
                format!("no CODE header in sheet {:?}", options.sheet),
            )
        })?;
    let code_rows: Vec<u32> = walk_code_rows(&sheet, header, options.scan_max_rows)
        .into_iter()
        .map(|(row, _)| row)
        .collect();
    let (Some(&first), Some(&last)) = (code_rows.first(), code_rows.last()) else {
        return Err(GuardError::malformed(
            "template",
            format!("CODE header at {header} has no numeric code rows below it"),
        )
        .into());
    };
    tracing::info!(
        sheet = %options.sheet,
        header = %header,
        code_rows = code_rows.len(),
        first,
        last,
        "located code rows"
    );

    let mut per_column_stats = Vec::new();
    for col in first_col..=last_col {
        let mut stats = ColumnStats::new(column_letters(col));
        for &row in &code_rows {
            let at = CellRef::new(col, row);
            if sheet.is_colored(at) {
                stats.colored += 1;
            }
            if sheet.is_merged(at) {
                stats.merged += 1;
            } else if sheet.is_formula(at) {
                stats.formula += 1;
            } else if sheet.value(at).is_blank() {
                stats.blank += 1;
            } else {
                stats.value += 1;
            }
        }
        per_column_stats.push(stats);
    }
    let (safe, locked): (Vec<&ColumnStats>, Vec<&ColumnStats>) =
        per_column_stats.iter().partition(|stats| stats.is_safe());

    Ok(DiscoveryReport {
        generated_at_epoch_ms: now_epoch_ms()?,
        template_sha256: workbook.sha256().to_string(),
        sheet: options.sheet.clone(),
        header_position: header.into(),
        code_rows_count: code_rows.len(),
        row_span: RowSpan { first, last },
        scan_cols: options.scan_cols.clone(),
        safe_columns: safe.iter().map(|s| s.column.clone()).collect(),
        locked_columns: locked.iter().map(|s| s.column.clone()).collect(),
        per_column_stats,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    #[serde(rename = "GO")]
    Go,
    #[serde(rename = "NO-GO")]
    NoGo,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetCensus {
    pub sheet: String,
    pub code_headers: Vec<CodeHeader>,
    pub codes_found: usize,
    pub duplicate_codes: Vec<String>,
}

/// Optional cross-references for a census. Neither input is required; one
/// that cannot be read becomes a `WARNING:` note instead of an error.
#[derive(Debug, Clone, Default)]
pub struct CensusOptions {
    pub code_register: Option<PathBuf>,
    /// Recorded for provenance only.
    pub template_lock: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CensusReport {
    pub status: Verdict,
    pub generated_at_epoch_ms: u128,
    pub template_sha256: String,
    pub sheets: Vec<String>,
    pub total_codes_found: usize,
    pub unique_codes_found: usize,
    pub duplicates_total: usize,
    pub code_register_path: Option<String>,
    pub code_register_codes: usize,
    pub codes_missing_in_register: Vec<String>,
    pub template_lock_path: Option<String>,
    pub template_lock_loaded: bool,
    pub notes: Vec<String>,
    pub per_sheet: Vec<SheetCensus>,
}

/// Codes listed in a register CSV.
///
/// The code column is the first header named like `code`, `cost code`, `csi`
/// or `sov code` (any case), else the first column. Blank cells and formulas
/// are skipped.
pub fn load_code_register(path: &Path) -> Result<BTreeSet<String>> {
    let bytes = fs::read(path).with_context(|| format!("read code register {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes.as_slice());
    let mut records = reader.byte_records();
    let Some(header) = records.next() else {
        return Ok(BTreeSet::new());
    };
    let header = header.with_context(|| format!("parse code register {}", path.display()))?;
    let code_index = header
        .iter()
        .map(|field| {
            let name = String::from_utf8_lossy(field);
            name.trim_start_matches('\u{feff}').trim().to_lowercase()
        })
        .position(|name| REGISTER_CODE_HEADERS.contains(&name.as_str()))
        .unwrap_or(0);

    let mut codes = BTreeSet::new();
    for record in records {
        let record = record.with_context(|| format!("parse code register {}", path.display()))?;
        let Some(field) = record.get(code_index) else {
            continue;
        };
        let code = String::from_utf8_lossy(field);
        let code = code.trim();
        if !code.is_empty() && !code.starts_with('=') {
            codes.insert(code.to_string());
        }
    }
    Ok(codes)
}

/// Survey every CODE column in every sheet.
pub fn census(workbook: &Workbook, options: &CensusOptions) -> Result<CensusReport> {
    let mut notes = Vec::new();
    let register = match options.code_register.as_deref().map(load_code_register) {
        Some(Ok(codes)) => Some(codes),
        Some(Err(err)) => {
            notes.push(format!("WARNING: failed to load code register: {err:#}"));
            None
        }
        None => None,
    };
    let template_lock_loaded = match options.template_lock.as_deref().map(read_lock_json) {
        Some(Ok(())) => true,
        Some(Err(err)) => {
            notes.push(format!("WARNING: failed to load template lock: {err:#}"));
            false
        }
        None => false,
    };

    let mut per_sheet = Vec::new();
    let mut all_codes: Vec<String> = Vec::new();
    for name in workbook.sheet_names() {
        let sheet = workbook
            .sheet(name)
            .with_context(|| format!("census sheet {name}"))?;
        let headers = find_code_headers(&sheet, CENSUS_HEADER_WINDOW);
        let mut codes: Vec<String> = Vec::new();
        for header in &headers {
            codes.extend(
                walk_code_rows(&sheet, *header, CENSUS_SCAN_MAX_ROWS)
                    .into_iter()
                    .map(|(_, code)| code),
            );
        }
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for code in &codes {
            *counts.entry(code.as_str()).or_default() += 1;
        }
        let duplicate_codes = counts
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(code, _)| (*code).to_string())
            .collect();
        tracing::debug!(sheet = name, headers = headers.len(), codes = codes.len(), "census sheet");
        per_sheet.push(SheetCensus {
            sheet: name.to_string(),
            code_headers: headers.into_iter().map(CodeHeader::from).collect(),
            codes_found: codes.len(),
            duplicate_codes,
        });
        all_codes.extend(codes);
    }

    let unique: BTreeSet<&str> = all_codes.iter().map(String::as_str).collect();
    let codes_missing_in_register: Vec<String> = match &register {
        Some(known) if !known.is_empty() => unique
            .iter()
            .filter(|code| !known.contains(**code))
            .map(|code| (*code).to_string())
            .collect(),
        Some(_) => {
            notes.push("WARNING: code register lists no codes; comparison skipped".to_string());
            Vec::new()
        }
        None => Vec::new(),
    };

    let mut status = Verdict::Go;
    if unique.is_empty() {
        notes.push("no codes found under any CODE header".to_string());
        status = Verdict::NoGo;
    }
    if !codes_missing_in_register.is_empty() {
        notes.push(format!(
            "{} template code(s) missing from the code register",
            codes_missing_in_register.len()
        ));
        status = Verdict::NoGo;
    }
    Ok(CensusReport {
        status,
        generated_at_epoch_ms: now_epoch_ms()?,
        template_sha256: workbook.sha256().to_string(),
        sheets: workbook
            .sheet_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        total_codes_found: all_codes.len(),
        unique_codes_found: unique.len(),
        duplicates_total: all_codes.len() - unique.len(),
        code_register_path: options.code_register.as_deref().map(display_path),
        code_register_codes: register.as_ref().map_or(0, BTreeSet::len),
        codes_missing_in_register,
        template_lock_path: options.template_lock.as_deref().map(display_path),
        template_lock_loaded,
        notes,
        per_sheet,
    })
}

fn read_lock_json(path: &Path) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice::<serde_json::Value>(&bytes)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

/// Every cell equal to `CODE` (trimmed, any case) inside the window, in row
/// order.
fn find_code_headers(sheet: &Sheet, (max_row, max_col): (u32, u32)) -> Vec<CellRef> {
    let mut headers = Vec::new();
    for row in 1..=sheet.max_row().min(max_row) {
        for col in 1..=sheet.max_col().min(max_col) {
            let at = CellRef::new(col, row);
            if let CellValue::Text(text) = sheet.value(at) {
                if text.trim().eq_ignore_ascii_case("code") {
                    headers.push(at);
                }
            }
        }
    }
    headers
}

enum CodeCell {
    Blank,
    Code(String),
    Other,
}

fn classify_code_cell(sheet: &Sheet, at: CellRef) -> CodeCell {
    if sheet.is_formula(at) {
        return CodeCell::Other;
    }
    match sheet.value(at) {
        value if value.is_blank() => CodeCell::Blank,
        CellValue::Text(text) => {
            let text = text.trim();
            if text.chars().all(|ch| ch.is_ascii_digit()) {
                CodeCell::Code(text.to_string())
            } else {
                CodeCell::Other
            }
        }
        CellValue::Number(number) if number.fract() == 0.0 && number >= 0.0 => {
            CodeCell::Code(format!("{number:.0}"))
        }
        _ => CodeCell::Other,
    }
}

/// Walk down from a CODE header collecting `(row, code)` pairs until a run of
/// blanks or non-code cells ends the section.
fn walk_code_rows(sheet: &Sheet, header: CellRef, max_rows: u32) -> Vec<(u32, String)> {
    let mut rows = Vec::new();
    let mut blank_run = 0;
    let mut non_code_run = 0;
    let last = sheet.max_row().min(header.row.saturating_add(max_rows));
    for row in header.row + 1..=last {
        match classify_code_cell(sheet, CellRef::new(header.col, row)) {
            CodeCell::Blank => {
                blank_run += 1;
                if blank_run >= BLANK_RUN_LIMIT {
                    break;
                }
            }
            CodeCell::Code(code) => {
                blank_run = 0;
                non_code_run = 0;
                rows.push((row, code));
            }
            CodeCell::Other => {
                blank_run = 0;
                non_code_run += 1;
                if non_code_run >= NON_CODE_RUN_LIMIT {
                    break;
                }
            }
        }
    }
    rows
}

#[cfg(test)]
#[path = "discovery_tests.rs"]
mod tests;
