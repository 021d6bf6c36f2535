//! Versioned output records and the mapping from raw engine JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::EngineError;

/// Version stamped into every record written by this crate.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Character span inside the source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

/// One analysis record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Schema version.
    pub version: u32,
    /// Record kind as reported by the engine (e.g. "sentence", "entity").
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Remaining scalar fields, stringified.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Record {
    /// A plain text record of kind `"text"`.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            version: RECORD_SCHEMA_VERSION,
            kind: "text".to_string(),
            text: Some(text.into()),
            label: None,
            span: None,
            score: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// All records produced for one work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSet {
    pub unit_id: String,
    pub records: Vec<Record>,
}

impl RecordSet {
    pub fn new(unit_id: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            unit_id: unit_id.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

const KNOWN_FIELDS: &[&str] = &[
    "kind",
    "type",
    "text",
    "label",
    "span",
    "start",
    "end",
    "score",
    "confidence",
];

/// Map one raw engine record into a [`Record`].
///
/// The kind is taken from `kind` or `type`; the span from a `span` object or
/// top-level `start`/`end`; the score from `score` or `confidence`. Other
/// scalar fields land in `attributes`; nested values are dropped.
pub fn map_record(value: &Value) -> Result<Record, EngineError> {
    let obj = value
        .as_object()
        .ok_or_else(|| EngineError::protocol(format!("record is not an object: {}", value)))?;

    let kind = obj
        .get("kind")
        .or_else(|| obj.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::protocol("record has no kind"))?
        .to_string();

    let span = match obj.get("span") {
        Some(span) => span_from(span.get("start"), span.get("end")),
        None => span_from(obj.get("start"), obj.get("end")),
    };

    let attributes = obj
        .iter()
        .filter(|(key, _)| !KNOWN_FIELDS.contains(&key.as_str()))
        .filter_map(|(key, v)| scalar_to_string(v).map(|s| (key.clone(), s)))
        .collect();

    Ok(Record {
        version: RECORD_SCHEMA_VERSION,
        kind,
        text: obj.get("text").and_then(Value::as_str).map(String::from),
        label: obj.get("label").and_then(Value::as_str).map(String::from),
        span,
        score: obj
            .get("score")
            .or_else(|| obj.get("confidence"))
            .and_then(Value::as_f64),
        attributes,
    })
}

/// Map the raw records of one unit.
pub fn map_record_set(unit_id: &str, values: &[Value]) -> Result<RecordSet, EngineError> {
    let records = values
        .iter()
        .map(map_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordSet::new(unit_id, records))
}

fn span_from(start: Option<&Value>, end: Option<&Value>) -> Option<Span> {
    let start = start?.as_u64()?;
    let end = end?.as_u64()?;
    (end >= start).then_some(Span { start, end })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
