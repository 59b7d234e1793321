//! Shared test infrastructure for integration tests.
//!
//! Builds a small SOV template on disk, plus a matching lock and plan, and
//! runs the `sov-guard` binary against them.
#![allow(dead_code)]

use serde_json::{json, Value};
use sov_guard::plan::compute_plan_hash;
use sov_guard::util::sha256_hex;
use std::ffi::OsStr;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const SOV_SHEET: &str = "ESTIMATE (INPUT)";

const NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";

fn inline(cell: &str, text: &str) -> String {
    format!(r#"<c r="{cell}" t="inlineStr"><is><t>{text}</t></is></c>"#)
}

/// CODE header at A12, codes in rows 13..=40, a formula total in T and a
/// merged I30:J30.
fn sov_sheet_xml() -> String {
    let mut xml = format!(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="{NS}"><sheetData>"#);
    xml.push_str(&format!(r#"<row r="1">{}</row>"#, inline("A1", "PROJECT")));
    xml.push_str(&format!(
        r#"<row r="12">{}{}{}</row>"#,
        inline("A12", "CODE"),
        inline("I12", "AMOUNT"),
        inline("T12", "TOTAL")
    ));
    for row in 13..=40u32 {
        let code = 1000 + (row - 13) * 100;
        xml.push_str(&format!(
            r#"<row r="{row}"><c r="A{row}"><v>{code}</v></c>{}<c r="T{row}"><f>SUM(I{row}:S{row})</f><v>0</v></c></row>"#,
            inline(&format!("B{row}"), &format!("Line {row}"))
        ));
    }
    xml.push_str(r#"</sheetData><mergeCells count="1"><mergeCell ref="I30:J30"/></mergeCells></worksheet>"#);
    xml
}

fn empty_sheet_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="{NS}"><sheetData><row r="1">{}</row></sheetData></worksheet>"#,
        inline("A1", "Notes")
    )
}

/// Assemble an OOXML package with one worksheet per `(name, xml)` pair.
pub fn build_workbook(sheets: &[(&str, String)]) -> Vec<u8> {
    let mut workbook = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="{NS}" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#
    );
    let mut rels = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for (index, (name, _)) in sheets.iter().enumerate() {
        let n = index + 1;
        workbook.push_str(&format!(r#"<sheet name="{name}" sheetId="{n}" r:id="rId{n}"/>"#));
        rels.push_str(&format!(
            r#"<Relationship Id="rId{n}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{n}.xml"/>"#
        ));
    }
    workbook.push_str("</sheets></workbook>");
    rels.push_str("</Relationships>");

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
    for (index, (_, xml)) in sheets.iter().enumerate() {
        add(&format!("xl/worksheets/sheet{}.xml", index + 1), xml);
    }
    zip.finish().expect("finish zip").into_inner()
}

pub fn sov_template() -> Vec<u8> {
    build_workbook(&[(SOV_SHEET, sov_sheet_xml()), ("SUMMARY", empty_sheet_xml())])
}

/// A template with no CODE column anywhere.
pub fn codeless_template() -> Vec<u8> {
    build_workbook(&[("SUMMARY", empty_sheet_xml())])
}

pub fn sample_write(cell: &str, value: Value) -> Value {
    json!({
        "sheet": SOV_SHEET,
        "cell": cell,
        "value": value,
        "source": {"source_type": "bid_pdf", "source_path": "bids/acme.pdf", "locator": "page 2"},
        "meta": {"project": "Sample", "option": "1", "trade": "HVAC", "bucket_code": "16000", "line_id": cell}
    })
}

pub fn plan_json(template_sha256: &str, writes: Vec<Value>) -> Value {
    let plan_hash = compute_plan_hash(&writes);
    json!({"template_sha256": template_sha256, "plan_hash": plan_hash, "writes": writes})
}

/// A temp workspace holding `template.xlsm` and `template.lock.json`.
pub struct Workspace {
    pub dir: TempDir,
    pub sha: String,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = sov_template();
        let sha = sha256_hex(&template);
        fs::write(dir.path().join("template.xlsm"), template).expect("write template");
        let lock = json!({
            "template": {"sha256": sha},
            "governing": {"sheet": SOV_SHEET, "code_rows": {"span": {"first": 13, "last": 220}}},
            "write_policy": {"allowed_columns": ["I"], "denied_columns": ["T"]}
        });
        write_json(&dir.path().join("template.lock.json"), &lock);
        Workspace { dir, sha }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn template(&self) -> PathBuf {
        self.path("template.xlsm")
    }

    pub fn lock(&self) -> PathBuf {
        self.path("template.lock.json")
    }

    pub fn write_plan(&self, name: &str, plan: &Value) -> PathBuf {
        let path = self.path(name);
        write_json(&path, plan);
        path
    }
}

pub fn write_json(path: &Path, value: &Value) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, serde_json::to_vec_pretty(value).expect("json")).expect("write json");
}

/// Run the binary with `args`; `gate` controls the apply env gate.
pub fn run<I, S>(args: I, gate: bool) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_sov-guard"));
    cmd.args(args).env("RUST_LOG", "warn");
    if gate {
        cmd.env("SOV_HARDENED_APPLY", "1");
    } else {
        cmd.env_remove("SOV_HARDENED_APPLY");
    }
    cmd.output().expect("run sov-guard")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

pub fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}
