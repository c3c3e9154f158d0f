//! Typed values stored in capture annotations
//!
//! Annotation values are plain strings; every captured field goes through
//! one [`Capture`] implementation so parsing only happens here.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// A value that can be written to and read back from an annotation
pub trait Capture: Sized {
    fn encode(&self) -> String;

    /// Parse an annotation value, returning a reason on failure
    fn decode(raw: &str) -> Result<Self, String>;
}

/// Replica counts
impl Capture for i32 {
    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Result<Self, String> {
        raw.trim().parse::<i32>().map_err(|e| e.to_string())
    }
}

/// Suspend flags
impl Capture for bool {
    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Result<Self, String> {
        raw.trim().parse::<bool>().map_err(|e| e.to_string())
    }
}

/// Fields restored without a stored value
impl Capture for () {
    fn encode(&self) -> String {
        String::new()
    }

    fn decode(_raw: &str) -> Result<Self, String> {
        Ok(())
    }
}

/// Previous rolling-update `maxUnavailable`; `None` when it was unset
#[derive(Debug, Clone, PartialEq)]
pub struct MaxUnavailable(pub Option<IntOrString>);

impl Capture for MaxUnavailable {
    fn encode(&self) -> String {
        match &self.0 {
            None => String::new(),
            Some(IntOrString::Int(value)) => value.to_string(),
            Some(IntOrString::String(value)) => value.clone(),
        }
    }

    fn decode(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Ok(MaxUnavailable(None));
        }
        match raw.parse::<i32>() {
            Ok(value) => Ok(MaxUnavailable(Some(IntOrString::Int(value)))),
            Err(_) => Ok(MaxUnavailable(Some(IntOrString::String(raw.to_string())))),
        }
    }
}

/// Previous value of the pod template safe-to-evict marker.
///
/// The empty annotation value stands for [`PriorMarker::Absent`]. A marker
/// that was itself empty, or that starts with a quote, is stored JSON-quoted
/// so every value reads back exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorMarker {
    /// The pod template had no marker
    Absent,
    Value(String),
}

impl Capture for PriorMarker {
    fn encode(&self) -> String {
        match self {
            PriorMarker::Absent => String::new(),
            PriorMarker::Value(value) if value.is_empty() || value.starts_with('"') => {
                serde_json::Value::String(value.clone()).to_string()
            }
            PriorMarker::Value(value) => value.clone(),
        }
    }

    fn decode(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            Ok(PriorMarker::Absent)
        } else if raw.starts_with('"') {
            serde_json::from_str::<String>(raw)
                .map(PriorMarker::Value)
                .map_err(|e| e.to_string())
        } else {
            Ok(PriorMarker::Value(raw.to_string()))
        }
    }
}
