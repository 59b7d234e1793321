//! Write plan schema, loading and the self-hash.
//!
//! A plan is produced by upstream tooling and consumed exactly once. The
//! `plan_hash` binds the plan to its own `writes` array so any edit made after
//! hashing is detected before a single cell is touched.
use crate::error::GuardError;
use crate::util::sha256_hex;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Provenance categories upstream tooling is expected to emit.
pub const KNOWN_SOURCE_TYPES: [&str; 4] = ["bid_pdf", "email_quote", "allowance", "unknown"];

/// A plain cell value. Formulas are never scalars for the purposes of a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(Number),
    Text(String),
    Bool(bool),
}

impl Scalar {
    /// Convert a JSON value, rejecting `null`, arrays and objects.
    pub fn from_json(value: &Value) -> Option<Scalar> {
        match value {
            Value::Number(number) => Some(Scalar::Number(number.clone())),
            Value::String(text) => Some(Scalar::Text(text.clone())),
            Value::Bool(flag) => Some(Scalar::Bool(*flag)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn is_formula(&self) -> bool {
        matches!(self, Scalar::Text(text) if text.trim_start().starts_with('='))
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Number(number) => Value::Number(number.clone()),
            Scalar::Text(text) => Value::String(text.clone()),
            Scalar::Bool(flag) => Value::Bool(*flag),
        }
    }
}

/// Accept strings, numbers and booleans as text; `null` becomes empty.
fn lenient_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(String::new()),
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(serde::de::Error::custom(format!("expected a scalar, found {other}"))),
    }
}

/// Where a planned value came from. Required on every write.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SourceRef {
    #[serde(default, alias = "type", deserialize_with = "lenient_text")]
    pub source_type: String,
    #[serde(default, alias = "path", deserialize_with = "lenient_text")]
    pub source_path: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub locator: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub notes: String,
}

impl SourceRef {
    /// Names of required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("source_type", &self.source_type),
            ("source_path", &self.source_path),
            ("locator", &self.locator),
        ] {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        missing
    }

    pub fn is_known_type(&self) -> bool {
        KNOWN_SOURCE_TYPES.contains(&self.source_type.as_str())
    }
}

/// Classification metadata carried by every write.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct WriteMeta {
    #[serde(default, deserialize_with = "lenient_text")]
    pub project: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub option: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub trade: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub bucket_code: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub line_id: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub note: String,
    /// Additional upstream keys, preserved into the audit log.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl WriteMeta {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("project", &self.project),
            ("option", &self.option),
            ("trade", &self.trade),
            ("bucket_code", &self.bucket_code),
            ("line_id", &self.line_id),
        ] {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        missing
    }
}

/// Legacy shape: `{"write": {"value": ...}}`.
#[derive(Debug, Clone, Default, Deserialize)]
struct LegacyWrite {
    #[serde(default)]
    value: Option<Value>,
}

/// One planned cell write as it appears in a plan file.
///
/// Fields are parsed leniently so the validator can report every missing or
/// empty field instead of failing on the first.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedWrite {
    #[serde(default, deserialize_with = "lenient_text")]
    pub sheet: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub cell: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    write: Option<LegacyWrite>,
    #[serde(default)]
    pub source: Option<SourceRef>,
    #[serde(default)]
    pub meta: Option<WriteMeta>,
}

impl PlannedWrite {
    /// Top-level `value` wins; the legacy nested `write.value` is the fallback.
    pub fn raw_value(&self) -> Option<&Value> {
        if let Some(value) = self.value.as_ref().filter(|v| !v.is_null()) {
            return Some(value);
        }
        self.write
            .as_ref()
            .and_then(|legacy| legacy.value.as_ref())
            .filter(|v| !v.is_null())
    }

    pub fn scalar(&self) -> Option<Scalar> {
        self.raw_value().and_then(Scalar::from_json)
    }
}

/// A parsed plan plus the raw `writes` array its hash is computed over.
#[derive(Debug, Clone)]
pub struct WritePlan {
    pub template_sha256: Option<String>,
    pub plan_hash: Option<String>,
    pub writes: Vec<PlannedWrite>,
    raw_writes: Vec<Value>,
}

impl WritePlan {
    /// Read and parse a plan file.
    pub fn load(path: &Path) -> Result<WritePlan> {
        let bytes = fs::read(path).with_context(|| format!("read plan {}", path.display()))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|err| GuardError::malformed("plan", format!("bad JSON: {err}")))
            .with_context(|| format!("parse plan {}", path.display()))?;
        let plan = Self::from_value(&value)
            .with_context(|| format!("parse plan {}", path.display()))?;
        Ok(plan)
    }

    pub fn from_value(value: &Value) -> std::result::Result<WritePlan, GuardError> {
        let object = value
            .as_object()
            .ok_or_else(|| GuardError::malformed("plan", "top-level JSON is not an object"))?;
        let raw_writes = match object.get("writes") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err(GuardError::malformed("plan", "writes is not an array")),
        };
        let mut writes = Vec::with_capacity(raw_writes.len());
        for (index, raw) in raw_writes.iter().enumerate() {
            if !raw.is_object() {
                return Err(GuardError::malformed(
                    "plan",
                    format!("writes[{index}] is not an object"),
                ));
            }
            let write: PlannedWrite = serde_json::from_value(raw.clone()).map_err(|err| {
                GuardError::malformed("plan", format!("writes[{index}]: {err}"))
            })?;
            writes.push(write);
        }
        Ok(WritePlan {
            template_sha256: non_empty_str(object, "template_sha256")
                .or_else(|| non_empty_str(object, "template_sha")),
            plan_hash: non_empty_str(object, "plan_hash"),
            writes,
            raw_writes,
        })
    }

    /// Hash of the plan's `writes` as they currently stand.
    pub fn computed_hash(&self) -> String {
        compute_plan_hash(&self.raw_writes)
    }
}

fn non_empty_str(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// SHA-256 over the canonical form of a `writes` array.
pub fn compute_plan_hash(writes: &[Value]) -> String {
    let mut out = String::from("[");
    for (index, write) in writes.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_canonical(write, &mut out);
    }
    out.push(']');
    sha256_hex(out.as_bytes())
}

/// Canonical JSON: sorted keys, compact separators, ASCII-only output.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => write_canonical_number(number, out),
        Value::String(text) => write_canonical_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical_string(key, out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// Integers print as-is. Floats use the shortest round-trip digits, written
/// in positional form for decimal exponents -4..16 and as `d.ddde+XX`
/// otherwise, matching the hashes upstream tooling has already produced.
fn write_canonical_number(number: &Number, out: &mut String) {
    let Some(float) = number.as_f64().filter(|_| number.is_f64()) else {
        out.push_str(&number.to_string());
        return;
    };
    let scientific = format!("{float:e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    out.push_str(sign);
    if (-4..16).contains(&exponent) {
        if exponent < 0 {
            out.push_str("0.");
            out.push_str(&"0".repeat((-exponent - 1) as usize));
            out.push_str(&digits);
        } else {
            let point = exponent as usize + 1;
            if digits.len() <= point {
                out.push_str(&digits);
                out.push_str(&"0".repeat(point - digits.len()));
                out.push_str(".0");
            } else {
                out.push_str(&digits[..point]);
                out.push('.');
                out.push_str(&digits[point..]);
            }
        }
    } else {
        out.push_str(&digits[..1]);
        if digits.len() > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        let _ = write!(out, "e{exp_sign}{:02}", exponent.unsigned_abs());
    }
}

fn write_canonical_string(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ch if (ch as u32) < 0x20 || !ch.is_ascii() => {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_value() -> Value {
        json!({
            "sheet": "ESTIMATE (INPUT)",
            "cell": "I50",
            "value": 12345.0,
            "source": {"source_type": "bid_pdf", "source_path": "bids/acme.pdf", "locator": "p1"},
            "meta": {"project": "P", "option": "1", "trade": "HVAC", "bucket_code": "16000", "line_id": "L1"}
        })
    }

    #[test]
    fn canonical_form_sorts_keys_and_escapes_non_ascii() {
        let value = json!({"b": 1, "a": [true, null, 2.5], "c": "caf\u{e9} \u{1F600}\n"});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[true,null,2.5],"b":1,"c":"caf\u00e9 \ud83d\ude00\n"}"#
        );
    }

    #[test]
    fn plan_hash_uses_sorted_compact_form() {
        let writes = vec![json!({"value": 12345.0, "cell": "I50"})];
        assert_eq!(
            compute_plan_hash(&writes),
            sha256_hex(br#"[{"cell":"I50","value":12345.0}]"#)
        );
    }

    #[test]
    fn floats_use_positional_form_inside_the_exponent_window() {
        let value = json!([1e-7, 1e16, 1.5e20, -2.5e-5, 1e15, 0.0001, 0.1, -0.0, 123.456, 7, -3]);
        assert_eq!(
            canonical_json(&value),
            "[1e-07,1e+16,1.5e+20,-2.5e-05,1000000000000000.0,0.0001,0.1,-0.0,123.456,7,-3]"
        );
    }

    #[test]
    fn hash_changes_when_a_value_is_mutated() {
        let mut writes = vec![write_value()];
        let before = compute_plan_hash(&writes);
        writes[0]["value"] = json!(12346.0);
        assert_ne!(before, compute_plan_hash(&writes));
    }

    #[test]
    fn legacy_nested_value_is_accepted() {
        let plan = WritePlan::from_value(&json!({
            "template_sha256": "abc",
            "writes": [{"sheet": "S", "cell": "I50", "write": {"column": "AMOUNT", "value": 99.5}}]
        }))
        .expect("parse");
        assert_eq!(
            plan.writes[0].scalar(),
            Some(Scalar::Number(Number::from_f64(99.5).expect("finite")))
        );
        assert_eq!(plan.plan_hash, None);
    }

    #[test]
    fn legacy_source_keys_and_numeric_meta_are_accepted() {
        let write: PlannedWrite = serde_json::from_value(json!({
            "sheet": "S",
            "cell": "I50",
            "value": "x",
            "source": {"type": "email_quote", "path": "mail/1.eml", "locator": "body"},
            "meta": {"project": "P", "option": 2, "trade": "T", "bucket_code": 16000, "line_id": "L", "vendor": "Acme"}
        }))
        .expect("parse");
        let source = write.source.expect("source");
        assert_eq!(source.source_type, "email_quote");
        assert!(source.missing_fields().is_empty());
        let meta = write.meta.expect("meta");
        assert_eq!(meta.option, "2");
        assert_eq!(meta.bucket_code, "16000");
        assert_eq!(meta.extra.get("vendor"), Some(&json!("Acme")));
    }

    #[test]
    fn structured_text_fields_are_rejected() {
        let err = serde_json::from_value::<PlannedWrite>(json!({"sheet": "S", "cell": ["I50"]}))
            .expect_err("array cell");
        assert!(err.to_string().contains("expected a scalar"), "{err}");
    }

    #[test]
    fn non_object_plans_and_writes_are_malformed() {
        assert!(matches!(
            WritePlan::from_value(&json!([1, 2])),
            Err(GuardError::StructuralMalformation { .. })
        ));
        assert!(matches!(
            WritePlan::from_value(&json!({"writes": [1]})),
            Err(GuardError::StructuralMalformation { .. })
        ));
        assert!(matches!(
            WritePlan::from_value(&json!({"writes": {"a": 1}})),
            Err(GuardError::StructuralMalformation { .. })
        ));
    }

    #[test]
    fn formula_strings_are_detected() {
        assert!(Scalar::Text("=SUM(A1:A2)".to_string()).is_formula());
        assert!(!Scalar::Text("SUM".to_string()).is_formula());
        assert_eq!(Scalar::from_json(&Value::Null), None);
        assert_eq!(Scalar::from_json(&json!([1])), None);
    }
}
