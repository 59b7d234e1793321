//! Worksheet XML: grid extraction and in-place cell patching.
//!
//! Patching streams the original part and only rewrites the `<c>` elements
//! being edited, so formulas, styles, merges and everything else in the sheet
//! survive byte-for-byte at the XML event level.
use super::package::attr_value;
use super::{Cell, CellValue};
use crate::address::{CellRange, CellRef};
use crate::plan::Scalar;
use anyhow::{anyhow, Context, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::borrow::Cow;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub(super) struct ParsedSheet {
    pub cells: BTreeMap<CellRef, Cell>,
    pub merged: Vec<CellRange>,
}

#[derive(Default)]
struct PendingCell {
    at: Option<CellRef>,
    kind: Option<String>,
    style: Option<u32>,
    raw_value: Option<String>,
    inline_text: Option<String>,
    formula: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TextTarget {
    None,
    Value,
    Formula,
    Inline,
}

pub(super) fn parse_sheet(xml: &str, shared_strings: &[String]) -> Result<ParsedSheet> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    let mut sheet = ParsedSheet::default();
    let mut row_num: u32 = 0;
    let mut next_col: u32 = 1;
    let mut pending: Option<PendingCell> = None;
    let mut target = TextTarget::None;
    let mut phonetic_depth = 0usize;

    loop {
        let event = reader.read_event().context("parse worksheet XML")?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.local_name().as_ref() {
                    b"row" => {
                        row_num = match attr_value(e, b"r")? {
                            Some(raw) => raw
                                .parse()
                                .map_err(|_| anyhow!("invalid row number {raw:?}"))?,
                            None => row_num + 1,
                        };
                        next_col = 1;
                    }
                    b"c" => {
                        let at = match attr_value(e, b"r")? {
                            Some(raw) => CellRef::parse_lenient(&raw)
                                .ok_or_else(|| anyhow!("invalid cell reference {raw:?}"))?,
                            None => CellRef::new(next_col, row_num.max(1)),
                        };
                        next_col = at.col + 1;
                        let cell = PendingCell {
                            at: Some(at),
                            kind: attr_value(e, b"t")?,
                            style: attr_value(e, b"s")?.and_then(|raw| raw.parse().ok()),
                            ..PendingCell::default()
                        };
                        if is_empty {
                            finish_cell(&mut sheet, cell, shared_strings)?;
                        } else {
                            pending = Some(cell);
                        }
                    }
                    b"v" if !is_empty => target = TextTarget::Value,
                    b"f" => {
                        if let Some(cell) = pending.as_mut() {
                            cell.formula = Some(String::new());
                        }
                        if !is_empty {
                            target = TextTarget::Formula;
                        }
                    }
                    b"is" => {
                        if let Some(cell) = pending.as_mut() {
                            cell.inline_text = Some(String::new());
                        }
                    }
                    b"rPh" if !is_empty => phonetic_depth += 1,
                    b"t" if !is_empty && phonetic_depth == 0 => target = TextTarget::Inline,
                    b"mergeCell" => {
                        if let Some(raw) = attr_value(e, b"ref")? {
                            let range = CellRange::parse(&raw)
                                .ok_or_else(|| anyhow!("invalid merge range {raw:?}"))?;
                            sheet.merged.push(range);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"c" => {
                    if let Some(cell) = pending.take() {
                        finish_cell(&mut sheet, cell, shared_strings)?;
                    }
                    target = TextTarget::None;
                }
                b"v" | b"f" | b"t" => target = TextTarget::None,
                b"rPh" => phonetic_depth = phonetic_depth.saturating_sub(1),
                _ => {}
            },
            Event::Text(ref t) => {
                if target != TextTarget::None {
                    let text = t.unescape().context("unescape cell text")?;
                    push_text(pending.as_mut(), target, &text);
                }
            }
            Event::CData(ref t) => {
                if target != TextTarget::None {
                    push_text(pending.as_mut(), target, &String::from_utf8_lossy(t));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(sheet)
}

fn push_text(cell: Option<&mut PendingCell>, target: TextTarget, text: &str) {
    let Some(cell) = cell else {
        return;
    };
    let slot = match target {
        TextTarget::Value => cell.raw_value.get_or_insert_with(String::new),
        TextTarget::Formula => cell.formula.get_or_insert_with(String::new),
        TextTarget::Inline => cell.inline_text.get_or_insert_with(String::new),
        TextTarget::None => return,
    };
    slot.push_str(text);
}

fn finish_cell(sheet: &mut ParsedSheet, cell: PendingCell, shared: &[String]) -> Result<()> {
    let Some(at) = cell.at else {
        return Ok(());
    };
    let raw = cell.raw_value.as_deref();
    let value = match cell.kind.as_deref() {
        Some("s") => match raw {
            Some(raw) => {
                let index: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("invalid shared string index {raw:?} at {at}"))?;
                let text = shared
                    .get(index)
                    .ok_or_else(|| anyhow!("shared string index {index} out of range at {at}"))?;
                CellValue::Text(text.clone())
            }
            None => CellValue::Empty,
        },
        Some("inlineStr") => match cell.inline_text {
            Some(text) => CellValue::Text(decode_xstring(&text).into_owned()),
            None => CellValue::Empty,
        },
        Some("b") => match raw {
            Some(raw) => CellValue::Bool(raw.trim() == "1"),
            None => CellValue::Empty,
        },
        Some("e") => CellValue::Error(raw.unwrap_or_default().to_string()),
        Some("str") | Some("d") => match raw {
            Some(raw) => CellValue::Text(raw.to_string()),
            None => CellValue::Empty,
        },
        _ => match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => CellValue::Number(
                raw.parse()
                    .map_err(|_| anyhow!("invalid numeric value {raw:?} at {at}"))?,
            ),
            None => CellValue::Empty,
        },
    };
    sheet.cells.insert(
        at,
        Cell {
            value,
            formula: cell.formula,
            style: cell.style,
        },
    );
    Ok(())
}

/// Rewrite a worksheet part with `edits` applied.
///
/// Existing cells keep their style attribute; missing cells and rows are
/// inserted in address order.
pub(super) fn patch_sheet(xml: &str, edits: &BTreeMap<CellRef, Scalar>) -> Result<Vec<u8>> {
    let mut pending: BTreeMap<u32, BTreeMap<u32, &Scalar>> = BTreeMap::new();
    for (at, value) in edits {
        pending.entry(at.row).or_default().insert(at.col, value);
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::new());
    let mut prefix = String::new();
    let mut in_sheet_data = false;
    let mut saw_sheet_data = false;
    let mut row_num: u32 = 0;
    let mut next_col: u32 = 1;
    let mut row_edits: Option<BTreeMap<u32, &Scalar>> = None;
    let mut skip_depth = 0usize;

    loop {
        let event = reader.read_event().context("parse worksheet XML")?;
        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                Event::Eof => return Err(anyhow!("worksheet XML ended inside a cell")),
                _ => {}
            }
            continue;
        }
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let local = e.local_name();
                match local.as_ref() {
                    b"sheetData" => {
                        saw_sheet_data = true;
                        prefix = element_prefix(e.name().as_ref());
                        if is_empty {
                            let start = BytesStart::new(format!("{prefix}sheetData"));
                            write(&mut writer, Event::Start(start))?;
                            let rows = std::mem::take(&mut pending);
                            for (row, cells) in rows {
                                write_new_row(&mut writer, &prefix, row, &cells)?;
                            }
                            let end = BytesEnd::new(format!("{prefix}sheetData"));
                            write(&mut writer, Event::End(end))?;
                        } else {
                            in_sheet_data = true;
                            write(&mut writer, event.clone())?;
                        }
                    }
                    b"row" if in_sheet_data => {
                        row_num = match attr_value(e, b"r")? {
                            Some(raw) => raw
                                .parse()
                                .map_err(|_| anyhow!("invalid row number {raw:?}"))?,
                            None => row_num + 1,
                        };
                        next_col = 1;
                        flush_rows_before(&mut writer, &prefix, &mut pending, row_num)?;
                        match pending.remove(&row_num) {
                            Some(cells) => {
                                let start = row_start_without_spans(e)?;
                                write(&mut writer, Event::Start(start))?;
                                if is_empty {
                                    for (col, value) in &cells {
                                        write_cell(
                                            &mut writer,
                                            &prefix,
                                            CellRef::new(*col, row_num),
                                            value,
                                            None,
                                        )?;
                                    }
                                    let end = BytesEnd::new(format!("{prefix}row"));
                                    write(&mut writer, Event::End(end))?;
                                } else {
                                    row_edits = Some(cells);
                                }
                            }
                            None => write(&mut writer, event.clone())?,
                        }
                    }
                    b"c" if in_sheet_data => {
                        let at = match attr_value(e, b"r")? {
                            Some(raw) => CellRef::parse_lenient(&raw)
                                .ok_or_else(|| anyhow!("invalid cell reference {raw:?}"))?,
                            None => CellRef::new(next_col, row_num.max(1)),
                        };
                        next_col = at.col + 1;
                        let mut replacement = None;
                        if let Some(cells) = row_edits.as_mut() {
                            flush_cells_before(&mut writer, &prefix, cells, at)?;
                            replacement = cells.remove(&at.col);
                        }
                        match replacement {
                            Some(value) => {
                                let style = attr_value(e, b"s")?;
                                write_cell(&mut writer, &prefix, at, value, style.as_deref())?;
                                if !is_empty {
                                    skip_depth = 1;
                                }
                            }
                            None => write(&mut writer, event.clone())?,
                        }
                    }
                    _ => write(&mut writer, event.clone())?,
                }
            }
            Event::End(ref e) => {
                match e.local_name().as_ref() {
                    b"row" if in_sheet_data => {
                        if let Some(cells) = row_edits.take() {
                            for (col, value) in &cells {
                                write_cell(
                                    &mut writer,
                                    &prefix,
                                    CellRef::new(*col, row_num),
                                    value,
                                    None,
                                )?;
                            }
                        }
                    }
                    b"sheetData" => {
                        let rows = std::mem::take(&mut pending);
                        for (row, cells) in rows {
                            write_new_row(&mut writer, &prefix, row, &cells)?;
                        }
                        in_sheet_data = false;
                    }
                    _ => {}
                }
                write(&mut writer, event.clone())?;
            }
            Event::Eof => break,
            other => write(&mut writer, other)?,
        }
    }

    if !saw_sheet_data {
        return Err(anyhow!("worksheet XML has no sheetData element"));
    }
    if !pending.is_empty() {
        return Err(anyhow!("worksheet XML left {} row edit(s) unplaced", pending.len()));
    }
    Ok(writer.into_inner())
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|err| anyhow!("write worksheet XML: {err}"))
}

fn element_prefix(qualified: &[u8]) -> String {
    let name = String::from_utf8_lossy(qualified);
    match name.rsplit_once(':') {
        Some((prefix, _)) => format!("{prefix}:"),
        None => String::new(),
    }
}

fn row_start_without_spans(original: &BytesStart<'_>) -> Result<BytesStart<'static>> {
    let name = String::from_utf8_lossy(original.name().as_ref()).into_owned();
    let mut start = BytesStart::new(name);
    for attr in original.attributes() {
        let attr = attr.context("parse row attribute")?;
        if attr.key.local_name().as_ref() == b"spans" {
            continue;
        }
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().context("unescape row attribute")?;
        start.push_attribute((key.as_str(), value.as_ref()));
    }
    Ok(start)
}

fn flush_rows_before(
    writer: &mut Writer<Vec<u8>>,
    prefix: &str,
    pending: &mut BTreeMap<u32, BTreeMap<u32, &Scalar>>,
    row: u32,
) -> Result<()> {
    let earlier: Vec<u32> = pending.range(..row).map(|(row, _)| *row).collect();
    for row in earlier {
        if let Some(cells) = pending.remove(&row) {
            write_new_row(writer, prefix, row, &cells)?;
        }
    }
    Ok(())
}

fn flush_cells_before(
    writer: &mut Writer<Vec<u8>>,
    prefix: &str,
    cells: &mut BTreeMap<u32, &Scalar>,
    at: CellRef,
) -> Result<()> {
    let earlier: Vec<u32> = cells.range(..at.col).map(|(col, _)| *col).collect();
    for col in earlier {
        if let Some(value) = cells.remove(&col) {
            write_cell(writer, prefix, CellRef::new(col, at.row), value, None)?;
        }
    }
    Ok(())
}

fn write_new_row(
    writer: &mut Writer<Vec<u8>>,
    prefix: &str,
    row: u32,
    cells: &BTreeMap<u32, &Scalar>,
) -> Result<()> {
    let mut start = BytesStart::new(format!("{prefix}row"));
    let row_text = row.to_string();
    start.push_attribute(("r", row_text.as_str()));
    write(writer, Event::Start(start))?;
    for (col, value) in cells {
        write_cell(writer, prefix, CellRef::new(*col, row), value, None)?;
    }
    write(writer, Event::End(BytesEnd::new(format!("{prefix}row"))))
}

fn write_cell(
    writer: &mut Writer<Vec<u8>>,
    prefix: &str,
    at: CellRef,
    value: &Scalar,
    style: Option<&str>,
) -> Result<()> {
    let mut start = BytesStart::new(format!("{prefix}c"));
    let address = at.to_string();
    start.push_attribute(("r", address.as_str()));
    if let Some(style) = style {
        start.push_attribute(("s", style));
    }
    match value {
        Scalar::Number(number) => {
            write(writer, Event::Start(start))?;
            write_text_element(writer, &format!("{prefix}v"), &number.to_string(), false)?;
        }
        Scalar::Bool(flag) => {
            start.push_attribute(("t", "b"));
            write(writer, Event::Start(start))?;
            write_text_element(writer, &format!("{prefix}v"), if *flag { "1" } else { "0" }, false)?;
        }
        Scalar::Text(text) => {
            start.push_attribute(("t", "inlineStr"));
            write(writer, Event::Start(start))?;
            write(writer, Event::Start(BytesStart::new(format!("{prefix}is"))))?;
            write_text_element(writer, &format!("{prefix}t"), &encode_xstring(text), true)?;
            write(writer, Event::End(BytesEnd::new(format!("{prefix}is"))))?;
        }
    }
    write(writer, Event::End(BytesEnd::new(format!("{prefix}c"))))
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
    preserve_space: bool,
) -> Result<()> {
    let mut start = BytesStart::new(name.to_string());
    if preserve_space {
        start.push_attribute(("xml:space", "preserve"));
    }
    write(writer, Event::Start(start))?;
    write(writer, Event::Text(BytesText::new(text)))?;
    write(writer, Event::End(BytesEnd::new(name.to_string())))
}

/// Characters XML 1.0 cannot carry, even as character references.
fn is_xml_illegal(ch: char) -> bool {
    matches!(
        ch,
        '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}'
    )
}

/// Code unit named by a `_xHHHH_` escape at the start of `text`.
fn xstring_escape_at(text: &str) -> Option<u32> {
    let body = text.strip_prefix("_x")?;
    let (hex, rest) = (body.get(..4)?, &body[4..]);
    if !rest.starts_with('_') || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Encode text for an `ST_Xstring` element: XML-illegal characters become
/// `_xHHHH_`, and a literal escape-shaped run gets its underscore escaped.
pub(super) fn encode_xstring(text: &str) -> Cow<'_, str> {
    let escaped = |i: usize, ch: char| {
        is_xml_illegal(ch) || (ch == '_' && xstring_escape_at(&text[i..]).is_some())
    };
    if !text.char_indices().any(|(i, ch)| escaped(i, ch)) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for (i, ch) in text.char_indices() {
        if escaped(i, ch) {
            out.push_str(&format!("_x{:04X}_", ch as u32));
        } else {
            out.push(ch);
        }
    }
    Cow::Owned(out)
}

/// Reverse of [`encode_xstring`]. Escapes that name no valid character are
/// kept literally.
pub(super) fn decode_xstring(text: &str) -> Cow<'_, str> {
    if !text.contains("_x") {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("_x") {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match xstring_escape_at(rest).and_then(char::from_u32) {
            Some(ch) => {
                out.push(ch);
                rest = &rest[7..];
            }
            None => {
                out.push_str("_x");
                rest = &rest[2..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

#[cfg(test)]
#[path = "sheet_xml_tests.rs"]
mod tests;
