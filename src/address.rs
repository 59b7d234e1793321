//! A1 cell addressing.
//!
//! Plans, locks and the sheet grid all speak column letters plus 1-based rows;
//! this module is the single place that converts between the text form and
//! numeric coordinates.
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Strict plan grammar: no `$`, no lowercase, no row zero, no leading zeros.
pub const A1_PATTERN: &str = r"^[A-Z]{1,3}[1-9][0-9]*$";

fn a1_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(A1_PATTERN).expect("A1 pattern is valid"))
}

/// Return true when `text` satisfies the plan address grammar.
pub fn is_valid_a1(text: &str) -> bool {
    a1_regex().is_match(text)
}

/// A resolved cell coordinate (1-based column and row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(col: u32, row: u32) -> Self {
        Self { row, col }
    }

    /// Parse a plan address under the strict grammar.
    pub fn parse(text: &str) -> Option<CellRef> {
        if !is_valid_a1(text) {
            return None;
        }
        Self::parse_lenient(text)
    }

    /// Parse an address as found inside workbook XML (`$` anchors and
    /// lowercase tolerated, up to the 3-letter column limit).
    pub fn parse_lenient(text: &str) -> Option<CellRef> {
        let cleaned: String = text.chars().filter(|ch| *ch != '$').collect();
        let split = cleaned.find(|ch: char| ch.is_ascii_digit())?;
        let (letters, digits) = cleaned.split_at(split);
        let col = column_index(letters)?;
        let row: u32 = digits.parse().ok()?;
        if row == 0 {
            return None;
        }
        Some(CellRef { row, col })
    }

    pub fn column_letters(&self) -> String {
        column_letters(self.col)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_letters(self.col), self.row)
    }
}

/// Convert column letters (`A`, `AZ`, `XFD`) to a 1-based index.
pub fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut col: u32 = 0;
    for ch in letters.chars() {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        let uc = ch.to_ascii_uppercase() as u8;
        col = col * 26 + u32::from(uc - b'A' + 1);
    }
    Some(col)
}

/// Convert a 1-based column index back to letters.
pub fn column_letters(mut col: u32) -> String {
    let mut out = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        out.push(b'A' + rem as u8);
        col = (col - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// A rectangular region such as `A1:C3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub first: CellRef,
    pub last: CellRef,
}

impl CellRange {
    pub fn parse(text: &str) -> Option<CellRange> {
        let (a, b) = match text.split_once(':') {
            Some((a, b)) => (a, b),
            None => (text, text),
        };
        let a = CellRef::parse_lenient(a)?;
        let b = CellRef::parse_lenient(b)?;
        Some(CellRange {
            first: CellRef::new(a.col.min(b.col), a.row.min(b.row)),
            last: CellRef::new(a.col.max(b.col), a.row.max(b.row)),
        })
    }

    pub fn contains(&self, cell: CellRef) -> bool {
        (self.first.row..=self.last.row).contains(&cell.row)
            && (self.first.col..=self.last.col).contains(&cell.col)
    }
}

/// Parse a column span such as `A:AZ` into inclusive indices.
pub fn parse_column_span(text: &str) -> Option<(u32, u32)> {
    let (start, end) = text.split_once(':')?;
    let start = column_index(start.trim())?;
    let end = column_index(end.trim())?;
    if start > end {
        return None;
    }
    Some((start, end))
}
