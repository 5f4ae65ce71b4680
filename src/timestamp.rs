//! Alarm log entries.
//!
//! The controller stores when an alarm was raised as separate year/month/day/hour/minute words in
//! its own wall clock. There is no time zone information to go with them, so they decode into a
//! civil date-time and are never shifted.

use jiff::civil::DateTime;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("calendar field value {0} is out of range")]
    FieldOverflow(u16),
    #[error("alarm fields do not form a valid date and time")]
    Calendar(#[source] jiff::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct AlarmRecord {
    #[serde(rename = "type")]
    pub alarm_type: u16,
    pub state: u16,
    pub timestamp: DateTime,
}

impl std::fmt::Display for AlarmRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::json!({
            "type": self.alarm_type,
            "state": self.state,
            "timestamp": self.timestamp.to_string(),
        });
        f.write_fmt(format_args!("{json}"))
    }
}

fn calendar_field(value: u16) -> Result<i8, Error> {
    i8::try_from(value).map_err(|_| Error::FieldOverflow(value))
}

/// Decode `[type, state, year, month, day, hour, minute]` as read from the alarm registers.
///
/// `year` counts from 2000.
pub fn decode_alarm_timestamp(fields: [u16; 7]) -> Result<AlarmRecord, Error> {
    let [alarm_type, state, year, month, day, hour, minute] = fields;
    let year = i16::try_from(2000 + u32::from(year)).map_err(|_| Error::FieldOverflow(year))?;
    let timestamp = DateTime::new(
        year,
        calendar_field(month)?,
        calendar_field(day)?,
        calendar_field(hour)?,
        calendar_field(minute)?,
        0,
        0,
    )
    .map_err(Error::Calendar)?;
    Ok(AlarmRecord { alarm_type, state, timestamp })
}
