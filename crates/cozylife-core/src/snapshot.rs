use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{
    Attributes, ATTR_CURRENT_MA, ATTR_POWER_W, ATTR_SWITCH, ATTR_VOLTAGE_V,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("attribute {0} missing from query reply")]
    Missing(u32),
    #[error("attribute {id} is not numeric: {value}")]
    NotNumeric { id: u32, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub ts: DateTime<Utc>,
    pub on: bool,
    pub current: f64,
    pub power: f64,
    pub voltage: f64,
    pub raw: Attributes,
}

impl DeviceSnapshot {
    // Metering attributes default to zero when absent.
    pub fn from_attributes(raw: Attributes) -> Result<Self, SnapshotError> {
        let switch = numeric(&raw, ATTR_SWITCH)?.ok_or(SnapshotError::Missing(ATTR_SWITCH))?;
        let current_ma = numeric(&raw, ATTR_CURRENT_MA)?.unwrap_or_default();
        let power = numeric(&raw, ATTR_POWER_W)?.unwrap_or_default();
        let voltage = numeric(&raw, ATTR_VOLTAGE_V)?.unwrap_or_default();

        Ok(Self {
            ts: Utc::now(),
            on: switch > 0.0,
            current: current_ma / 1000.0,
            power,
            voltage,
            raw,
        })
    }
}

fn numeric(raw: &Attributes, id: u32) -> Result<Option<f64>, SnapshotError> {
    let Some(value) = raw.get(&id.to_string()) else {
        return Ok(None);
    };
    match value {
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| SnapshotError::NotNumeric {
            id,
            value: value.to_string(),
        }),
        other => Err(SnapshotError::NotNumeric {
            id,
            value: other.to_string(),
        }),
    }
}
