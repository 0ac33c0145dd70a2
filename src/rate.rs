//! Rate descriptors: how many units per period a key is allowed.
//!
//! Rates arrive from the control plane in several JSON shapes:
//!
//! * long form: `{"units": 10, "period": "minute", "unitType": "KB"}`
//! * shorthand string: `"1 req/second"`
//! * shorthand dict: `{"KB": 8, "period": "hour"}` / `{"MB": 8, "period": "hour"}`

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{GantryError, GantryResult};

pub const MIN_PERIOD: Duration = Duration::from_secs(1);
pub const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitType {
    #[default]
    Requests,
    Kilobytes,
    Megabytes,
}

impl UnitType {
    /// Units consumed by one request of `request_bytes` bytes.
    pub fn units_for(&self, request_bytes: i64) -> i64 {
        match self {
            UnitType::Requests => 1,
            UnitType::Kilobytes => request_bytes / 1024,
            UnitType::Megabytes => request_bytes / (1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub units: i64,
    pub period: Duration,
    pub unit_type: UnitType,
    /// Overrides the per-request amount posted to counter backends; by
    /// default the amount is derived from the unit type
    pub increment: Option<i64>,
}

impl Rate {
    pub fn new(units: i64, period: Duration, unit_type: UnitType) -> GantryResult<Self> {
        if units <= 0 {
            return Err(GantryError::bad_control_reply(format!(
                "Rate units should be > 0, got {}",
                units
            )));
        }
        if period < MIN_PERIOD || period > MAX_PERIOD {
            return Err(GantryError::bad_control_reply(format!(
                "Rate period should be within [1 second, 24 hours], got {:?}",
                period
            )));
        }
        Ok(Self {
            units,
            period,
            unit_type,
            increment: None,
        })
    }

    /// Requests per period, the common case.
    pub fn per_period(units: i64, period: Duration) -> GantryResult<Self> {
        Self::new(units, period, UnitType::Requests)
    }

    pub fn with_increment(mut self, increment: i64) -> Self {
        self.increment = Some(increment);
        self
    }

    /// Amount this request adds to backend counters: the explicit increment
    /// when set, otherwise derived from the unit type and the body size.
    pub fn amount_for(&self, request_bytes: i64) -> i64 {
        self.increment
            .unwrap_or_else(|| self.unit_type.units_for(request_bytes))
    }

    pub fn period_secs(&self) -> i64 {
        self.period.as_secs() as i64
    }

    /// Start of the accounting bucket containing `t`.
    pub fn current_bucket(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = t.timestamp().div_euclid(self.period_secs()) * self.period_secs();
        Utc.timestamp_opt(secs, 0).single().unwrap_or(t)
    }

    /// Start of the bucket after the one containing `t`.
    pub fn next_bucket(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.current_bucket(t + chrono::Duration::seconds(self.period_secs()))
    }

    /// Seconds the client should wait until the next bucket opens.
    pub fn retry_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.next_bucket(now) - now).num_seconds()
    }

    /// Parses any of the supported JSON shapes.
    pub fn from_json(value: &Value) -> GantryResult<Self> {
        match value {
            Value::String(s) => Self::from_shorthand(s),
            Value::Object(obj) => {
                // Shorthand dicts carry the unit as the key
                for (key, unit_type) in [
                    ("KB", UnitType::Kilobytes),
                    ("MB", UnitType::Megabytes),
                    ("requests", UnitType::Requests),
                ] {
                    if let Some(units) = obj.get(key) {
                        let units = int_field(units, key)?;
                        let period = period_field(obj.get("period"))?;
                        return Self::new(units, period, unit_type);
                    }
                }
                if let Some(units) = obj.get("units") {
                    let units = int_field(units, "units")?;
                    let period = period_field(obj.get("period"))?;
                    let unit_type = match obj.get("unitType") {
                        None => UnitType::Requests,
                        Some(Value::String(s)) => unit_type_from_str(s)?,
                        Some(other) => {
                            return Err(GantryError::bad_control_reply(format!(
                                "unitType should be a string, got {}",
                                other
                            )))
                        }
                    };
                    let mut rate = Self::new(units, period, unit_type)?;
                    if let Some(increment) = obj.get("increment") {
                        rate = rate.with_increment(int_field(increment, "increment")?);
                    }
                    return Ok(rate);
                }
                Err(GantryError::bad_control_reply(format!(
                    "Unsupported rate object: {}",
                    value
                )))
            }
            other => Err(GantryError::bad_control_reply(format!(
                "Rate should be a string or an object, got {}",
                other
            ))),
        }
    }

    /// Parses `"<n> <unit>/<period>"`, e.g. `"1 req/second"` or `"8 MB/hour"`.
    fn from_shorthand(input: &str) -> GantryResult<Self> {
        let mut fields = input.split_whitespace();
        let (units, unit_period) = match (fields.next(), fields.next(), fields.next()) {
            (Some(units), Some(unit_period), None) => (units, unit_period),
            _ => {
                return Err(GantryError::bad_control_reply(format!(
                    "Failed to parse rate '{}'",
                    input
                )))
            }
        };
        let units: i64 = units.parse().map_err(|_| {
            GantryError::bad_control_reply(format!("Rate units should be an integer: '{}'", input))
        })?;
        let (unit, period) = unit_period.split_once('/').ok_or_else(|| {
            GantryError::bad_control_reply(format!("Expected '<unit>/<period>' in '{}'", input))
        })?;
        let unit_type = match unit {
            "req" | "reqs" | "requests" => UnitType::Requests,
            other => unit_type_from_str(other)?,
        };
        Self::new(units, period_from_str(period)?, unit_type)
    }
}

impl std::fmt::Display for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unit = match self.unit_type {
            UnitType::Requests => "req",
            UnitType::Kilobytes => "KB",
            UnitType::Megabytes => "MB",
        };
        write!(f, "Rate({} {}/{:?})", self.units, unit, self.period)
    }
}

/// Parses `key -> [rate, ...]` tables from Forward commands.
pub fn rates_from_json(value: &Value) -> GantryResult<HashMap<String, Vec<Rate>>> {
    let obj = value.as_object().ok_or_else(|| {
        GantryError::bad_control_reply(format!("Rates should be a dictionary, got {}", value))
    })?;
    let mut out = HashMap::new();
    for (key, list) in obj {
        let list = list.as_array().ok_or_else(|| {
            GantryError::bad_control_reply(format!("Rates for '{}' should be a list", key))
        })?;
        let mut rates = Vec::with_capacity(list.len());
        for item in list {
            rates.push(Rate::from_json(item)?);
        }
        out.insert(key.clone(), rates);
    }
    Ok(out)
}

fn int_field(value: &Value, name: &str) -> GantryResult<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .filter(|_| n.is_i64() || n.is_u64())
            .ok_or_else(|| {
                GantryError::bad_control_reply(format!("'{}' should be an integer", name))
            }),
        other => Err(GantryError::bad_control_reply(format!(
            "'{}' should be an integer, got {}",
            name, other
        ))),
    }
}

fn period_field(value: Option<&Value>) -> GantryResult<Duration> {
    match value {
        Some(Value::String(s)) => period_from_str(s),
        Some(other) => Err(GantryError::bad_control_reply(format!(
            "Period should be a string, got {}",
            other
        ))),
        None => Err(GantryError::bad_control_reply("Expected period")),
    }
}

fn period_from_str(period: &str) -> GantryResult<Duration> {
    match period {
        "second" => Ok(Duration::from_secs(1)),
        "minute" => Ok(Duration::from_secs(60)),
        "hour" => Ok(Duration::from_secs(3600)),
        "day" => Ok(Duration::from_secs(24 * 3600)),
        other => Err(GantryError::bad_control_reply(format!(
            "Unsupported period: {}",
            other
        ))),
    }
}

fn unit_type_from_str(unit: &str) -> GantryResult<UnitType> {
    match unit {
        "requests" => Ok(UnitType::Requests),
        "KB" => Ok(UnitType::Kilobytes),
        "MB" => Ok(UnitType::Megabytes),
        other => Err(GantryError::bad_control_reply(format!(
            "Unsupported rate unit: {}",
            other
        ))),
    }
}
