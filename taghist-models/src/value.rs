use serde::{Deserialize, Serialize};

/// A strongly-typed runtime value for tag samples.
///
/// The untagged serde representation yields the wire shape consumed by
/// subscribers: `null | bool | number | string`.
///
/// `Null` is a valid state meaning "not yet read" and compares equal only to
/// itself, which gives the scheduler its null-safe change detection for free.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum THValue {
    #[default]
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Float64(f64),
    Text(String),
}

impl THValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, THValue::Null)
    }

    /// Numeric view of the value, when one exists.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            THValue::Int16(v) => Some(*v as f64),
            THValue::Int32(v) => Some(*v as f64),
            THValue::Float64(v) => Some(*v),
            THValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Textual form written into the history store's `value` column.
    ///
    /// `Null` has no storable form; such samples are dropped by the write
    /// path rather than persisted as empty rows.
    pub fn storage_text(&self) -> Option<String> {
        match self {
            THValue::Null => None,
            THValue::Bool(v) => Some(v.to_string()),
            THValue::Int16(v) => Some(v.to_string()),
            THValue::Int32(v) => Some(v.to_string()),
            THValue::Float64(v) => Some(v.to_string()),
            THValue::Text(v) => Some(v.clone()),
        }
    }

    /// Coerce a stored textual value back into a typed value.
    ///
    /// Ordered fallback: float, then 16-bit integer, then boolean; anything
    /// else stays `Null`. The order matches what the store historically
    /// wrote, so plain integers come back as `Float64`.
    pub fn coerce_from_storage(text: Option<&str>) -> THValue {
        let Some(raw) = text else {
            return THValue::Null;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return THValue::Null;
        }
        if let Ok(f) = raw.parse::<f64>() {
            return THValue::Float64(f);
        }
        if let Ok(i) = raw.parse::<i16>() {
            return THValue::Int16(i);
        }
        if let Ok(b) = raw.parse::<bool>() {
            return THValue::Bool(b);
        }
        THValue::Null
    }
}

impl From<bool> for THValue {
    fn from(v: bool) -> Self {
        THValue::Bool(v)
    }
}

impl From<i16> for THValue {
    fn from(v: i16) -> Self {
        THValue::Int16(v)
    }
}

impl From<i32> for THValue {
    fn from(v: i32) -> Self {
        THValue::Int32(v)
    }
}

impl From<f64> for THValue {
    fn from(v: f64) -> Self {
        THValue::Float64(v)
    }
}

impl From<&str> for THValue {
    fn from(v: &str) -> Self {
        THValue::Text(v.to_string())
    }
}
