//! OOXML package plumbing: part lookup, sheet resolution, shared strings and
//! fill styles.
use super::sheet_xml::decode_xstring;
use anyhow::{anyhow, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read};
use zip::ZipArchive;

pub(super) type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const STYLES_PART: &str = "xl/styles.xml";

/// A worksheet listed in `xl/workbook.xml`, resolved to its package part.
#[derive(Debug, Clone)]
pub(super) struct SheetEntry {
    pub name: String,
    pub part: String,
}

pub(super) fn open_archive(bytes: &[u8]) -> Result<Archive<'_>> {
    ZipArchive::new(Cursor::new(bytes)).context("read workbook zip container")
}

/// Read a package part as UTF-8, returning `None` when the part is absent.
pub(super) fn read_part(archive: &mut Archive<'_>, name: &str) -> Result<Option<String>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("open part {name}")),
    };
    let mut text = String::new();
    file.read_to_string(&mut text)
        .with_context(|| format!("read part {name}"))?;
    Ok(Some(text))
}

pub(super) fn require_part(archive: &mut Archive<'_>, name: &str) -> Result<String> {
    read_part(archive, name)?.ok_or_else(|| anyhow!("missing package part {name}"))
}

/// Resolve worksheet names to part paths via the workbook relationships.
pub(super) fn resolve_sheets(archive: &mut Archive<'_>) -> Result<Vec<SheetEntry>> {
    let workbook_xml = require_part(archive, WORKBOOK_PART)?;
    let rels_xml = require_part(archive, WORKBOOK_RELS_PART)?;
    let sheet_rids = parse_workbook_sheet_rids(&workbook_xml)?;
    let targets = parse_relationship_targets(&rels_xml)?;
    let mut sheets = Vec::with_capacity(sheet_rids.len());
    for (name, rid) in sheet_rids {
        let target = targets
            .get(&rid)
            .ok_or_else(|| anyhow!("sheet {name:?} references unknown relationship {rid}"))?;
        sheets.push(SheetEntry {
            name,
            part: join_and_normalize("xl/", target),
        });
    }
    Ok(sheets)
}

pub(super) fn load_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>> {
    match read_part(archive, SHARED_STRINGS_PART)? {
        Some(xml) => parse_shared_strings(&xml),
        None => Ok(Vec::new()),
    }
}

pub(super) fn load_colored_styles(archive: &mut Archive<'_>) -> Result<BTreeSet<u32>> {
    match read_part(archive, STYLES_PART)? {
        Some(xml) => parse_colored_styles(&xml),
        None => Ok(BTreeSet::new()),
    }
}

pub(super) fn attr_value(elem: &BytesStart<'_>, local: &[u8]) -> Result<Option<String>> {
    for attr in elem.attributes() {
        let attr = attr.context("parse XML attribute")?;
        if attr.key.local_name().as_ref() == local {
            let value = attr.unescape_value().context("unescape XML attribute")?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn parse_workbook_sheet_rids(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut sheets = Vec::new();
    loop {
        match reader.read_event().context("parse xl/workbook.xml")? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let name = attr_value(&e, b"name")?
                    .ok_or_else(|| anyhow!("workbook sheet without a name"))?;
                let rid = attr_value(&e, b"id")?
                    .ok_or_else(|| anyhow!("workbook sheet {name:?} without r:id"))?;
                sheets.push((name, rid));
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(sheets)
}

fn parse_relationship_targets(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut targets = HashMap::new();
    loop {
        match reader.read_event().context("parse workbook relationships")? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) =
                    (attr_value(&e, b"Id")?, attr_value(&e, b"Target")?)
                {
                    targets.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(targets)
}

/// Join a relationship target onto its base directory, resolving `..` and
/// package-absolute targets.
pub(super) fn join_and_normalize(base: &str, target: &str) -> String {
    let joined = match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("{base}{target}"),
    };
    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut phonetic_depth = 0usize;
    loop {
        match reader.read_event().context("parse shared strings")? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => phonetic_depth += 1,
                b"t" if phonetic_depth == 0 => in_text = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => {
                    let text = current.take().unwrap_or_default();
                    strings.push(decode_xstring(&text).into_owned());
                }
                b"rPh" => phonetic_depth = phonetic_depth.saturating_sub(1),
                b"t" => in_text = false,
                _ => {}
            },
            Event::Text(t) if in_text => {
                if let Some(current) = current.as_mut() {
                    current.push_str(&t.unescape().context("unescape shared string")?);
                }
            }
            Event::CData(t) if in_text => {
                if let Some(current) = current.as_mut() {
                    current.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(strings)
}

#[derive(Default)]
struct FillState {
    pattern_type: Option<String>,
    fg_rgb: Option<String>,
}

impl FillState {
    fn is_colored(&self) -> bool {
        if self
            .pattern_type
            .as_deref()
            .is_some_and(|pattern| pattern != "none")
        {
            return true;
        }
        self.fg_rgb
            .as_deref()
            .is_some_and(|rgb| rgb != "00000000" && rgb != "FFFFFFFF")
    }
}

/// Return the `cellXfs` indexes whose fill counts as colored.
fn parse_colored_styles(xml: &str) -> Result<BTreeSet<u32>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut fills: Vec<bool> = Vec::new();
    let mut xf_fills: Vec<usize> = Vec::new();
    let mut in_fills = false;
    let mut in_cell_xfs = false;
    let mut fill: Option<FillState> = None;

    loop {
        let event = reader.read_event().context("parse xl/styles.xml")?;
        let (elem, is_empty) = match &event {
            Event::Start(e) => (Some(e), false),
            Event::Empty(e) => (Some(e), true),
            _ => (None, false),
        };
        if let Some(e) = elem {
            match e.local_name().as_ref() {
                b"fills" if !is_empty => in_fills = true,
                b"cellXfs" if !is_empty => in_cell_xfs = true,
                b"fill" if in_fills => {
                    if is_empty {
                        fills.push(false);
                    } else {
                        fill = Some(FillState::default());
                    }
                }
                b"patternFill" => {
                    if let Some(state) = fill.as_mut() {
                        state.pattern_type = attr_value(e, b"patternType")?;
                    }
                }
                b"fgColor" => {
                    if let Some(state) = fill.as_mut() {
                        state.fg_rgb = attr_value(e, b"rgb")?;
                    }
                }
                b"xf" if in_cell_xfs => {
                    let fill_id = attr_value(e, b"fillId")?
                        .and_then(|raw| raw.parse::<usize>().ok())
                        .unwrap_or(0);
                    xf_fills.push(fill_id);
                }
                _ => {}
            }
            continue;
        }
        match event {
            Event::End(e) => match e.local_name().as_ref() {
                b"fills" => in_fills = false,
                b"cellXfs" => in_cell_xfs = false,
                b"fill" => {
                    if let Some(state) = fill.take() {
                        fills.push(state.is_colored());
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    let mut colored = BTreeSet::new();
    for (index, fill_id) in xf_fills.iter().enumerate() {
        if fills.get(*fill_id).copied().unwrap_or(false) {
            colored.insert(index as u32);
        }
    }
    Ok(colored)
}
