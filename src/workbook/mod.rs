//! In-memory spreadsheet document backed by an OOXML package.
//!
//! A [`Workbook`] is loaded once from template bytes and can hand out parsed
//! [`Sheet`] grids for read-only inspection, or be converted into a
//! [`Document`] that owns the governing sheet for one guarded write run.
mod package;
mod sheet_xml;

use crate::address::{CellRange, CellRef};
use crate::error::GuardError;
use crate::plan::Scalar;
use crate::util::sha256_hex;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use package::SheetEntry;

/// Cell-state predicates shared by discovery, validation and the writer.
///
/// Every guard in the crate asks these three questions through this trait so
/// there is exactly one definition of "merged", "formula" and "colored".
pub trait CellInspector {
    /// True when the cell lies inside any merged region, top-left included.
    fn is_merged(&self, cell: CellRef) -> bool;
    /// True when the cell holds a formula, or text that starts with `=`.
    fn is_formula(&self, cell: CellRef) -> bool;
    /// True when the cell's fill is patterned or carries a non-default color.
    fn is_colored(&self, cell: CellRef) -> bool;
}

/// Stored (cached) content of a cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    Error(String),
}

impl CellValue {
    /// Empty, or text that is only whitespace.
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Empty => Value::Null,
            CellValue::Number(number) => serde_json::Number::from_f64(*number)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(text) | CellValue::Error(text) => Value::String(text.clone()),
            CellValue::Bool(flag) => Value::Bool(*flag),
        }
    }
}

impl From<&Scalar> for CellValue {
    fn from(value: &Scalar) -> Self {
        match value {
            Scalar::Number(number) => number
                .as_f64()
                .map(CellValue::Number)
                .unwrap_or(CellValue::Empty),
            Scalar::Text(text) => CellValue::Text(text.clone()),
            Scalar::Bool(flag) => CellValue::Bool(*flag),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cell {
    pub value: CellValue,
    pub formula: Option<String>,
    pub style: Option<u32>,
}

impl Cell {
    pub fn has_formula(&self) -> bool {
        if self.formula.is_some() {
            return true;
        }
        matches!(&self.value, CellValue::Text(text) if text.trim_start().starts_with('='))
    }
}

/// A parsed worksheet grid.
#[derive(Debug, Clone)]
pub struct Sheet {
    name: String,
    cells: BTreeMap<CellRef, Cell>,
    merged: Vec<CellRange>,
    colored_styles: BTreeSet<u32>,
}

impl Sheet {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cell(&self, at: CellRef) -> Option<&Cell> {
        self.cells.get(&at)
    }

    /// Cached value at `at`, `Empty` when the cell is absent.
    pub fn value(&self, at: CellRef) -> CellValue {
        self.cells
            .get(&at)
            .map(|cell| cell.value.clone())
            .unwrap_or_default()
    }

    pub fn max_row(&self) -> u32 {
        let from_cells = self.cells.keys().map(|at| at.row).max().unwrap_or(0);
        let from_merges = self.merged.iter().map(|r| r.last.row).max().unwrap_or(0);
        from_cells.max(from_merges)
    }

    pub fn max_col(&self) -> u32 {
        let from_cells = self.cells.keys().map(|at| at.col).max().unwrap_or(0);
        let from_merges = self.merged.iter().map(|r| r.last.col).max().unwrap_or(0);
        from_cells.max(from_merges)
    }

    fn set_value(&mut self, at: CellRef, value: CellValue) {
        let cell = self.cells.entry(at).or_default();
        cell.value = value;
        cell.formula = None;
    }
}

impl CellInspector for Sheet {
    fn is_merged(&self, cell: CellRef) -> bool {
        self.merged.iter().any(|range| range.contains(cell))
    }

    fn is_formula(&self, cell: CellRef) -> bool {
        self.cells.get(&cell).is_some_and(Cell::has_formula)
    }

    fn is_colored(&self, cell: CellRef) -> bool {
        self.cells
            .get(&cell)
            .and_then(|cell| cell.style)
            .is_some_and(|style| self.colored_styles.contains(&style))
    }
}

/// A loaded OOXML package.
#[derive(Debug, Clone)]
pub struct Workbook {
    bytes: Vec<u8>,
    sha256: String,
    sheets: Vec<SheetEntry>,
    shared_strings: Vec<String>,
    colored_styles: BTreeSet<u32>,
}

impl Workbook {
    /// Read and parse a workbook file.
    pub fn open(path: &Path) -> Result<Workbook> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_bytes(bytes).with_context(|| format!("load workbook {}", path.display()))
    }

    /// Parse a workbook from raw package bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Workbook> {
        let sha256 = sha256_hex(&bytes);
        let (sheets, shared_strings, colored_styles) = {
            let mut archive = package::open_archive(&bytes).map_err(malformed)?;
            let sheets = package::resolve_sheets(&mut archive).map_err(malformed)?;
            let shared = package::load_shared_strings(&mut archive).map_err(malformed)?;
            let colored = package::load_colored_styles(&mut archive).map_err(malformed)?;
            (sheets, shared, colored)
        };
        Ok(Workbook {
            bytes,
            sha256,
            sheets,
            shared_strings,
            colored_styles,
        })
    }

    /// SHA-256 of the exact bytes this workbook was loaded from.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|entry| entry.name.as_str()).collect()
    }

    /// Parse one worksheet into a grid.
    pub fn sheet(&self, name: &str) -> Result<Sheet> {
        let (_, sheet) = self.load_sheet(name)?;
        Ok(sheet)
    }

    /// Take ownership of the workbook for editing `sheet_name`.
    pub fn into_document(self, sheet_name: &str) -> Result<Document> {
        let (entry, sheet) = self.load_sheet(sheet_name)?;
        let xml = self.read_sheet_xml(&entry)?;
        Ok(Document {
            workbook: self,
            part: entry.part,
            sheet_xml: xml,
            sheet,
            edits: BTreeMap::new(),
        })
    }

    fn entry(&self, name: &str) -> Result<SheetEntry> {
        self.sheets
            .iter()
            .find(|entry| entry.name == name)
            .cloned()
            .ok_or_else(|| {
                GuardError::malformed(
                    "workbook",
                    format!("sheet not found: {name} (have: {:?})", self.sheet_names()),
                )
                .into()
            })
    }

    fn read_sheet_xml(&self, entry: &SheetEntry) -> Result<String> {
        let mut archive = package::open_archive(&self.bytes).map_err(malformed)?;
        package::require_part(&mut archive, &entry.part).map_err(malformed)
    }

    fn load_sheet(&self, name: &str) -> Result<(SheetEntry, Sheet)> {
        let entry = self.entry(name)?;
        let xml = self.read_sheet_xml(&entry)?;
        let parsed = sheet_xml::parse_sheet(&xml, &self.shared_strings)
            .with_context(|| format!("sheet {name}"))
            .map_err(malformed)?;
        let sheet = Sheet {
            name: name.to_string(),
            cells: parsed.cells,
            merged: parsed.merged,
            colored_styles: self.colored_styles.clone(),
        };
        Ok((entry, sheet))
    }
}

fn malformed(err: anyhow::Error) -> anyhow::Error {
    GuardError::malformed("workbook", format!("{err:#}")).into()
}

/// A workbook with one sheet open for editing.
///
/// Edits are held in memory; nothing reaches disk until the serialized bytes
/// are persisted by the caller.
#[derive(Debug)]
pub struct Document {
    workbook: Workbook,
    part: String,
    sheet_xml: String,
    sheet: Sheet,
    edits: BTreeMap<CellRef, Scalar>,
}

impl Document {
    pub fn sheet(&self) -> &Sheet {
        &self.sheet
    }

    pub fn edit_count(&self) -> usize {
        self.edits.len()
    }

    /// Set a scalar value, returning the previous cached value.
    pub fn set_value(&mut self, at: CellRef, value: &Scalar) -> CellValue {
        let old = self.sheet.value(at);
        self.sheet.set_value(at, CellValue::from(value));
        self.edits.insert(at, value.clone());
        old
    }

    /// Serialize the package with every edit applied.
    ///
    /// Parts other than the edited sheet are copied without recompression.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let patched = sheet_xml::patch_sheet(&self.sheet_xml, &self.edits)
            .with_context(|| format!("patch {}", self.part))?;
        let mut archive = package::open_archive(&self.workbook.bytes)?;
        let mut out = ZipWriter::new(Cursor::new(Vec::new()));
        for index in 0..archive.len() {
            let raw = archive
                .by_index_raw(index)
                .with_context(|| format!("read zip entry {index}"))?;
            if raw.name() != self.part {
                out.raw_copy_file(raw)
                    .with_context(|| format!("copy zip entry {index}"))?;
                continue;
            }
            let name = raw.name().to_string();
            let mut options = SimpleFileOptions::default().compression_method(raw.compression());
            if let Some(modified) = raw.last_modified() {
                options = options.last_modified_time(modified);
            }
            drop(raw);
            out.start_file(name.as_str(), options)
                .with_context(|| format!("start zip entry {name}"))?;
            out.write_all(&patched)
                .with_context(|| format!("write zip entry {name}"))?;
        }
        let cursor = out.finish().context("finalize workbook zip")?;
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
#[path = "workbook_tests.rs"]
mod tests;
