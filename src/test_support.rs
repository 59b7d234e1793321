//! In-memory template fixtures for unit tests.
use crate::address::CellRef;
use crate::lock::{RowSpan, TemplateLock};
use crate::plan::compute_plan_hash;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const SOV_SHEET: &str = "ESTIMATE (INPUT)";

/// Style index whose fill is solid yellow.
pub const COLORED_STYLE: u32 = 1;

enum FixtureCell {
    Number(f64),
    Text(String),
    Formula(String),
}

pub struct SheetFixture {
    name: String,
    cells: BTreeMap<CellRef, (FixtureCell, Option<u32>)>,
    merges: Vec<String>,
}

impl SheetFixture {
    pub fn new(name: &str) -> Self {
        SheetFixture {
            name: name.to_string(),
            cells: BTreeMap::new(),
            merges: Vec::new(),
        }
    }

    fn put(mut self, cell: &str, value: FixtureCell, style: Option<u32>) -> Self {
        let at = CellRef::parse(cell).expect("fixture address");
        self.cells.insert(at, (value, style));
        self
    }

    pub fn number(self, cell: &str, value: f64) -> Self {
        self.put(cell, FixtureCell::Number(value), None)
    }

    pub fn colored(self, cell: &str, value: f64) -> Self {
        self.put(cell, FixtureCell::Number(value), Some(COLORED_STYLE))
    }

    pub fn text(self, cell: &str, value: &str) -> Self {
        self.put(cell, FixtureCell::Text(value.to_string()), None)
    }

    pub fn formula(self, cell: &str, formula: &str) -> Self {
        self.put(cell, FixtureCell::Formula(formula.to_string()), None)
    }

    pub fn merge(mut self, range: &str) -> Self {
        self.merges.push(range.to_string());
        self
    }

    fn to_xml(&self, shared: &mut Vec<String>) -> String {
        let mut rows: BTreeMap<u32, String> = BTreeMap::new();
        for (at, (value, style)) in &self.cells {
            let row = rows.entry(at.row).or_default();
            let style = style.map(|s| format!(r#" s="{s}""#)).unwrap_or_default();
            match value {
                FixtureCell::Number(number) => {
                    row.push_str(&format!(r#"<c r="{at}"{style}><v>{number}</v></c>"#))
                }
                FixtureCell::Text(text) => {
                    let index = shared.len();
                    shared.push(text.clone());
                    row.push_str(&format!(r#"<c r="{at}"{style} t="s"><v>{index}</v></c>"#));
                }
                FixtureCell::Formula(formula) => {
                    row.push_str(&format!(r#"<c r="{at}"{style}><f>{formula}</f><v>0</v></c>"#))
                }
            }
        }
        let mut xml = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
        );
        for (row, cells) in rows {
            xml.push_str(&format!(r#"<row r="{row}">{cells}</row>"#));
        }
        xml.push_str("</sheetData>");
        if !self.merges.is_empty() {
            xml.push_str(&format!(r#"<mergeCells count="{}">"#, self.merges.len()));
            for range in &self.merges {
                xml.push_str(&format!(r#"<mergeCell ref="{range}"/>"#));
            }
            xml.push_str("</mergeCells>");
        }
        xml.push_str("</worksheet>");
        xml
    }
}

const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fills count="3"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill><fill><patternFill patternType="solid"><fgColor rgb="FFFFFF00"/></patternFill></fill></fills><cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/><xf numFmtId="0" fontId="0" fillId="2" borderId="0" applyFill="1"/></cellXfs></styleSheet>"#;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Assemble a minimal OOXML package holding `sheets`.
pub fn build_workbook(sheets: &[SheetFixture]) -> Vec<u8> {
    let mut shared = Vec::new();
    let sheet_xml: Vec<String> = sheets.iter().map(|s| s.to_xml(&mut shared)).collect();

    let mut workbook = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#,
    );
    let mut rels = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for (index, sheet) in sheets.iter().enumerate() {
        let n = index + 1;
        workbook.push_str(&format!(
            r#"<sheet name="{}" sheetId="{n}" r:id="rId{n}"/>"#,
            escape(&sheet.name)
        ));
        rels.push_str(&format!(
            r#"<Relationship Id="rId{n}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{n}.xml"/>"#
        ));
    }
    workbook.push_str("</sheets></workbook>");
    rels.push_str("</Relationships>");

    let mut strings = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="{0}" uniqueCount="{0}">"#,
        shared.len()
    );
    for text in &shared {
        strings.push_str(&format!("<si><t>{}</t></si>", escape(text)));
    }
    strings.push_str("</sst>");

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    let mut add = |name: &str, body: &str| {
        zip.start_file(name, options).expect("start entry");
        zip.write_all(body.as_bytes()).expect("write entry");
    };
    add(
        "[Content_Types].xml",
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/></Types>"#,
    );
    add("xl/workbook.xml", &workbook);
    add("xl/_rels/workbook.xml.rels", &rels);
    add("xl/sharedStrings.xml", &strings);
    add("xl/styles.xml", STYLES);
    for (index, xml) in sheet_xml.iter().enumerate() {
        add(&format!("xl/worksheets/sheet{}.xml", index + 1), xml);
    }
    zip.finish().expect("finish zip").into_inner()
}

/// The governing sheet: CODE header at A12, numeric codes in rows 13..=60,
/// a formula total in T, a colored K column and a merged I55:J55.
pub fn sov_sheet() -> SheetFixture {
    let mut sheet = SheetFixture::new(SOV_SHEET)
        .text("A1", "PROJECT")
        .text("C3", "Sample Project")
        .text("A12", "CODE")
        .text("B12", "DESCRIPTION")
        .text("I12", "AMOUNT")
        .text("T12", "TOTAL")
        .merge("I55:J55");
    for row in 13..=60u32 {
        sheet = sheet
            .number(&format!("A{row}"), f64::from(1000 + (row - 13) * 100))
            .text(&format!("B{row}"), &format!("Line {row}"))
            .colored(&format!("K{row}"), 0.0)
            .formula(&format!("T{row}"), &format!("SUM(I{row}:S{row})"));
    }
    sheet.number("I20", 500.0)
}

pub fn sov_template() -> Vec<u8> {
    build_workbook(&[sov_sheet(), SheetFixture::new("SUMMARY").text("A1", "Totals")])
}

pub fn sov_lock(template_sha256: &str) -> TemplateLock {
    TemplateLock {
        template_sha256: template_sha256.to_string(),
        governing_sheet: SOV_SHEET.to_string(),
        code_row_span: RowSpan {
            first: 13,
            last: 220,
        },
        allowed_columns: BTreeSet::from(["C".to_string(), "I".to_string()]),
        denied_columns: BTreeSet::from(["T".to_string()]),
        header_row_max: 12,
    }
}

/// A fully provenanced write to the governing sheet.
pub fn sample_write(cell: &str, value: Value) -> Value {
    json!({
        "sheet": SOV_SHEET,
        "cell": cell,
        "value": value,
        "source": {"source_type": "bid_pdf", "source_path": "bids/acme.pdf", "locator": "page 2"},
        "meta": {"project": "Sample", "option": "1", "trade": "HVAC", "bucket_code": "16000", "line_id": cell}
    })
}

/// A plan document with a correct `plan_hash`.
pub fn plan_json(template_sha256: &str, writes: Vec<Value>) -> Value {
    let plan_hash = compute_plan_hash(&writes);
    json!({"template_sha256": template_sha256, "plan_hash": plan_hash, "writes": writes})
}
