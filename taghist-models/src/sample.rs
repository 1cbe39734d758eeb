use crate::value::THValue;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// One observation of a tag: name, typed value and the instant it was taken.
///
/// Serializes to the wire shape pushed to subscribers:
/// `{"name": string, "value": null|bool|number|string, "time": timestamp}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagSample {
    pub name: String,
    pub value: THValue,
    pub time: DateTime<Local>,
}

impl TagSample {
    pub fn new(name: impl Into<String>, value: THValue, time: DateTime<Local>) -> Self {
        Self {
            name: name.into(),
            value,
            time,
        }
    }

    /// A sample in the "not yet read" state.
    pub fn unread(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: THValue::Null,
            time: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let sample = TagSample::new("A01_DB10.DBW2", THValue::Int16(10), Local::now());
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["name"], "A01_DB10.DBW2");
        assert_eq!(json["value"], 10);
        assert!(json["time"].is_string());
    }

    #[test]
    fn unread_sample_is_null() {
        assert!(TagSample::unread("T").value.is_null());
    }
}
