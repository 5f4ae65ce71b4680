//! Conversions between raw register words and engineering units.

use crate::identity;
use crate::timestamp::{self, AlarmRecord};

/// Temperatures are stored as signed tenths of a degree Celsius.
const TEMPERATURE_SCALE: f64 = 10.0;

pub fn decode_temperature(raw: u16) -> f64 {
    f64::from(raw as i16) / TEMPERATURE_SCALE
}

pub fn encode_temperature(celsius: f64) -> u16 {
    // Wraps negative values into two's complement the same way the controller stores them.
    (celsius * TEMPERATURE_SCALE).round() as i64 as u16
}

pub fn decode_percentage(raw: u16) -> u16 {
    raw
}

pub fn encode_percentage(percent: u16) -> u16 {
    percent
}

pub fn decode_minutes(raw: u16) -> u16 {
    raw
}

pub fn encode_minutes(minutes: u16) -> u16 {
    minutes
}

/// Regulator tuning coefficients (proportional band, integration time and so on).
pub fn decode_coefficient(raw: u16) -> u16 {
    raw
}

pub fn encode_coefficient(coefficient: u16) -> u16 {
    coefficient
}

pub fn decode_rpm(raw: u16) -> u16 {
    raw
}

pub fn decode_count(raw: u16) -> u16 {
    raw
}

/// How a catalog entry turns its register words into a [`Value`] and back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Codec {
    Temperature,
    Percentage,
    Minutes,
    Coefficient,
    Rpm,
    Count,
    /// Automation and heating type code, published by name.
    AutomationType,
    /// Two words: major and minor.
    SoftwareVersion,
    /// Seven words: type, state, year, month, day, hour, minute.
    Alarm,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    Temperature(f64),
    Percentage(u16),
    Minutes(u16),
    Coefficient(u16),
    Rpm(u16),
    Count(u16),
    Flag(bool),
    Text(String),
    Alarm(AlarmRecord),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Temperature(v) => f.write_fmt(format_args!("{v:.1}")),
            Value::Percentage(v)
            | Value::Minutes(v)
            | Value::Coefficient(v)
            | Value::Rpm(v)
            | Value::Count(v) => f.write_fmt(format_args!("{v}")),
            Value::Flag(v) => f.write_str(if *v { "ON" } else { "OFF" }),
            Value::Text(v) => f.write_str(v),
            Value::Alarm(v) => std::fmt::Display::fmt(v, f),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("register words {words:?} are outside of the range modelled by the {codec} codec")]
pub struct DecodeRangeError {
    pub codec: Codec,
    pub words: Vec<u16>,
    #[source]
    pub cause: Option<timestamp::Error>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("`{0}` is not a number")]
    NotANumber(String),
    #[error("`{0}` does not fit into a register")]
    OutOfRegisterRange(String),
    #[error("values of the {0} codec cannot be written")]
    ReadOnly(Codec),
}

fn parse_word(payload: &str) -> Result<u16, ParseError> {
    let payload = payload.trim();
    if let Ok(v) = payload.parse::<u16>() {
        return Ok(v);
    }
    // Home automation number entities like to send integral values as `55.0`.
    let v = payload.parse::<f64>().map_err(|_| ParseError::NotANumber(payload.to_string()))?;
    if v.fract() != 0.0 || v < 0.0 || v > f64::from(u16::MAX) {
        return Err(ParseError::OutOfRegisterRange(payload.to_string()));
    }
    Ok(v as u16)
}

impl Codec {
    /// Number of consecutive registers this codec consumes.
    pub const fn width(&self) -> u16 {
        match self {
            Codec::SoftwareVersion => 2,
            Codec::Alarm => 7,
            _ => 1,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Codec::Temperature | Codec::Percentage | Codec::Minutes | Codec::Coefficient)
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self {
            Codec::Temperature => Some("°C"),
            Codec::Percentage => Some("%"),
            Codec::Minutes => Some("min"),
            Codec::Rpm => Some("rpm"),
            _ => None,
        }
    }

    pub fn device_class(&self) -> Option<&'static str> {
        match self {
            Codec::Temperature => Some("temperature"),
            Codec::Minutes => Some("duration"),
            _ => None,
        }
    }

    pub fn decode(&self, words: &[u16]) -> Result<Value, DecodeRangeError> {
        let out_of_range = |cause| DecodeRangeError { codec: *self, words: words.to_vec(), cause };
        if words.len() != usize::from(self.width()) {
            return Err(out_of_range(None));
        }
        Ok(match (self, words) {
            (Codec::Temperature, &[raw]) => Value::Temperature(decode_temperature(raw)),
            (Codec::Percentage, &[raw]) => Value::Percentage(decode_percentage(raw)),
            (Codec::Minutes, &[raw]) => Value::Minutes(decode_minutes(raw)),
            (Codec::Coefficient, &[raw]) => Value::Coefficient(decode_coefficient(raw)),
            (Codec::Rpm, &[raw]) => Value::Rpm(decode_rpm(raw)),
            (Codec::Count, &[raw]) => Value::Count(decode_count(raw)),
            (Codec::AutomationType, &[raw]) => {
                Value::Text(identity::automation_and_heating_type_name(raw).to_string())
            }
            (Codec::SoftwareVersion, &[major, minor]) => Value::Text(format!("{major}.{minor}")),
            (Codec::Alarm, &[t, s, y, mo, d, h, mi]) => {
                let record = timestamp::decode_alarm_timestamp([t, s, y, mo, d, h, mi])
                    .map_err(|e| out_of_range(Some(e)))?;
                Value::Alarm(record)
            }
            _ => return Err(out_of_range(None)),
        })
    }

    /// Parse a textual write request into a value of this codec.
    pub fn parse(&self, payload: &str) -> Result<Value, ParseError> {
        Ok(match self {
            Codec::Temperature => {
                let trimmed = payload.trim();
                let v = trimmed
                    .parse::<f64>()
                    .map_err(|_| ParseError::NotANumber(trimmed.to_string()))?;
                if !v.is_finite() {
                    return Err(ParseError::OutOfRegisterRange(trimmed.to_string()));
                }
                Value::Temperature(v)
            }
            Codec::Percentage => Value::Percentage(parse_word(payload)?),
            Codec::Minutes => Value::Minutes(parse_word(payload)?),
            Codec::Coefficient => Value::Coefficient(parse_word(payload)?),
            _ => return Err(ParseError::ReadOnly(*self)),
        })
    }

    /// The register word to write for `value`, if this codec is writable and `value` is its kind.
    pub fn encode(&self, value: &Value) -> Option<u16> {
        match (self, value) {
            (Codec::Temperature, Value::Temperature(v)) => Some(encode_temperature(*v)),
            (Codec::Percentage, Value::Percentage(v)) => Some(encode_percentage(*v)),
            (Codec::Minutes, Value::Minutes(v)) => Some(encode_minutes(*v)),
            (Codec::Coefficient, Value::Coefficient(v)) => Some(encode_coefficient(*v)),
            _ => None,
        }
    }
}
