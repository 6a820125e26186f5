//! Treatment and glucose records as they flow between the cloud feed, the
//! local formatting tool and the persisted artifacts.

use std::fmt;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Timestamp half of a [`TreatmentKey`]. Numbers and text are kept apart so a
/// numeric `1000` and a textual `"1000"` never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyStamp {
    Number(String),
    Text(String),
}

impl KeyStamp {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => Some(KeyStamp::Number(canonical_number(number))),
            Value::String(text) => Some(KeyStamp::Text(text.clone())),
            _ => None,
        }
    }
}

/// Integral floats render like integers so `1000` and `1000.0` key alike.
fn canonical_number(number: &Number) -> String {
    if number.is_i64() || number.is_u64() {
        return number.to_string();
    }
    match number.as_f64() {
        Some(float) if float.fract() == 0.0 && float.abs() < i64::MAX as f64 => {
            (float as i64).to_string()
        }
        _ => number.to_string(),
    }
}

/// Identity of a treatment across the cloud and local sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreatmentKey {
    pub event_type: String,
    pub stamp: Option<KeyStamp>,
}

impl TreatmentKey {
    pub fn new(event_type: impl Into<String>, stamp: Option<KeyStamp>) -> Self {
        Self {
            event_type: event_type.into(),
            stamp,
        }
    }
}

impl fmt::Display for TreatmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stamp {
            Some(KeyStamp::Number(n)) => write!(f, "({:?}, {})", self.event_type, n),
            Some(KeyStamp::Text(t)) => write!(f, "({:?}, {:?})", self.event_type, t),
            None => write!(f, "({:?}, None)", self.event_type),
        }
    }
}

/// A clinical event record. The schema is open; only the fields the bridge
/// reasons about have accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Treatment(Map<String, Value>);

impl Treatment {
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// `None` unless `value` is a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Parses the formatting tool's stdout (a JSON array of objects) and
    /// coerces numeric-looking strings.
    pub fn from_tool_output(stdout: &[u8]) -> Result<Vec<Treatment>> {
        let values: Vec<Value> =
            serde_json::from_slice(stdout).context("formatted treatments are not a JSON array")?;
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let mut treatment = Treatment::from_value(value)
                    .ok_or_else(|| anyhow!("formatted treatment #{index} is not an object"))?;
                treatment.coerce_numeric_strings();
                Ok(treatment)
            })
            .collect()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.0.get("eventType").and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&Value> {
        self.0.get("_id").filter(|id| !id.is_null())
    }

    pub fn is_remove(&self) -> bool {
        self.0.get("action").and_then(Value::as_str) == Some("remove")
    }

    /// `timestamp`, falling back to `created_at`.
    fn stamp_value(&self) -> Option<&Value> {
        self.0
            .get("timestamp")
            .or_else(|| self.0.get("created_at"))
    }

    /// `None` when `eventType` is missing: such records are malformed.
    pub fn key(&self) -> Option<TreatmentKey> {
        let event_type = self.event_type()?;
        Some(TreatmentKey::new(
            event_type,
            self.stamp_value().and_then(KeyStamp::from_value),
        ))
    }

    /// Epoch millis of the event: `mills` when the cloud supplied it, else a
    /// numeric or RFC 3339 `timestamp`/`created_at`.
    pub fn mills(&self) -> Option<i64> {
        if let Some(mills) = self.0.get("mills").and_then(number_as_millis) {
            return Some(mills);
        }
        let stamp = self.stamp_value()?;
        match stamp {
            Value::Number(_) => number_as_millis(stamp),
            Value::String(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|parsed| parsed.timestamp_millis()),
            _ => None,
        }
    }

    pub fn carries_carbs_or_insulin(&self) -> bool {
        self.0.get("carbs").map(is_truthy).unwrap_or(false)
            || self.0.get("insulin").map(is_truthy).unwrap_or(false)
    }

    /// Digit-only strings become integers, other float-parsable strings
    /// become floats, and `duration` is truncated to an integer.
    pub fn coerce_numeric_strings(&mut self) {
        for value in self.0.values_mut() {
            let Value::String(text) = value else {
                continue;
            };
            if let Some(number) = coerce_str(text) {
                *value = Value::Number(number);
            }
        }

        if let Some(duration) = self.0.get_mut("duration") {
            match duration.as_f64() {
                Some(minutes) if !duration.is_i64() && !duration.is_u64() => {
                    *duration = Value::from(minutes.trunc() as i64);
                }
                Some(_) => {}
                None if duration.is_null() => {}
                None => log::warn!("treatment duration {} is not numeric, left as is", duration),
            }
        }
    }
}

fn coerce_str(text: &str) -> Option<Number> {
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(int) = text.parse::<u64>() {
            return Some(Number::from(int));
        }
    }
    text.parse::<f64>().ok().and_then(Number::from_f64)
}

fn number_as_millis(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|float| float as i64))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// A normalized sensor reading as written to `monitor/glucose.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseEntry {
    pub direction: Option<String>,
    /// Epoch millis.
    pub date: i64,
    pub date_string: String,
    pub sgv: Option<Value>,
    pub device: Option<String>,
    pub rssi: Option<Value>,
    pub filtered: Option<Value>,
    pub unfiltered: Option<Value>,
    pub noise: Option<Value>,
    #[serde(rename = "type")]
    pub kind: String,
    pub glucose: Option<Value>,
}

impl GlucoseEntry {
    /// Builds an entry from a raw cloud `sgv` record. `None` when the record
    /// has no usable `mills`.
    pub fn from_sgv<Tz>(raw: &Value, tz: &Tz) -> Option<Self>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let date = raw.get("mills").and_then(number_as_millis)?;
        let local = tz.timestamp_millis_opt(date).single()?;
        let field = |name: &str| raw.get(name).filter(|value| !value.is_null()).cloned();
        let text = |name: &str| raw.get(name).and_then(Value::as_str).map(str::to_owned);

        Some(Self {
            direction: text("direction"),
            date,
            date_string: local.format("%Y-%m-%dT%H:%M:%S%z").to_string(),
            sgv: field("mgdl"),
            device: text("device"),
            rssi: field("rssi"),
            filtered: field("filtered"),
            unfiltered: field("unfiltered"),
            noise: field("noise"),
            kind: "sgv".to_string(),
            glucose: field("mgdl"),
        })
    }
}
