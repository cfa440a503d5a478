use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

/// current state of the bin, the only record the hub keeps
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// fixed key of the singleton record
    pub id: String,
    /// fill events / trigger count reported by the sensor
    pub count: i64,
    /// measured distance, a proxy for fill level
    pub distance: f64,
    pub lid_open: bool,
    pub last_updated: DateTime<Utc>,
}

impl Reading {
    /// zero-valued record served before anything was written. never persisted.
    pub fn placeholder(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            count: 0,
            distance: 0.0,
            lid_open: false,
            last_updated: now,
        }
    }
}

/// body of POST /sensor-data once presence and types are checked
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorDataRequest {
    pub count: i64,
    pub distance: f64,
}

/// body of POST /estado-tapa once presence and types are checked
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LidStateRequest {
    pub lid_open: bool,
}

/// older firmware sends the lid flag under its original name
const LEGACY_LID_FIELD: &str = "tapaAbierta";

impl SensorDataRequest {
    pub fn from_payload(payload: &Value) -> Result<Self, ApiError> {
        let (Some(count), Some(distance)) = (field(payload, "count"), field(payload, "distance")) else {
            return Err(ApiError::MissingFields {
                message: "incomplete sensor data: count and distance are required",
                received: payload.clone(),
            });
        };

        let count = coerce_integer(count).ok_or_else(|| invalid("count", payload))?;
        let distance = coerce_number(distance).ok_or_else(|| invalid("distance", payload))?;

        Ok(Self { count, distance })
    }
}

impl LidStateRequest {
    pub fn from_payload(payload: &Value) -> Result<Self, ApiError> {
        let Some(lid_open) = field(payload, "lidOpen").or_else(|| field(payload, LEGACY_LID_FIELD)) else {
            return Err(ApiError::MissingFields {
                message: "lid state not specified: lidOpen is required",
                received: payload.clone(),
            });
        };

        let lid_open = coerce_bool(lid_open).ok_or_else(|| invalid("lidOpen", payload))?;
        Ok(Self { lid_open })
    }
}

/// any value present under the key counts, null included; coercion decides if it is usable
fn field<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
    payload.get(name)
}

fn invalid(field: &'static str, payload: &Value) -> ApiError {
    ApiError::InvalidField { field, received: payload.clone() }
}

fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn coerce_integer(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let n = coerce_number(value)?;
    // integral floats only; the range check keeps the cast lossless
    (n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64).then(|| n as i64)
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}
