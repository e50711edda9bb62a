//! Text-to-value casting rules, one per declared column type

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime};

use super::Value;
use crate::db::schema::ColumnType;
use crate::error::CastError;

/// Date-time formats tried in order after RFC 3339
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
    "%d/%m/%Y %H:%M:%S%.f",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S%.f",
    "%d-%m-%Y %H:%M",
    "%d.%m.%Y %H:%M:%S%.f",
    "%d.%m.%Y %H:%M",
    "%d %b %Y %H:%M:%S%.f",
    "%d %b %Y %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d %b %Y",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

const BOOLEAN_TOKENS: &[(&str, bool)] = &[
    ("true", true),
    ("yes", true),
    ("y", true),
    ("present", true),
    ("false", false),
    ("no", false),
    ("n", false),
    ("absent", false),
    ("0", false),
];

/// What a general date-time parse recognized in the text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporal {
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl Temporal {
    fn to_datetime(self) -> NaiveDateTime {
        match self {
            Temporal::DateTime(dt) => dt,
            Temporal::Date(date) => date.and_time(NaiveTime::MIN),
            Temporal::Time(time) => Local::now().date_naive().and_time(time),
        }
    }
}

/// Cast one non-empty cell to the value of `column_type`
pub fn cast_value(column_type: ColumnType, raw: &str) -> Result<Value, CastError> {
    let value = match column_type {
        ColumnType::String => Value::Text(raw.to_string()),
        ColumnType::Int => Value::Int(
            raw.trim()
                .parse::<i32>()
                .map_err(|e| CastError(format!("not an int: {}", e)))?,
        ),
        ColumnType::BigInt => Value::BigInt(
            raw.trim()
                .parse::<i64>()
                .map_err(|e| CastError(format!("not a bigint: {}", e)))?,
        ),
        ColumnType::Float => Value::Float(parse_float(raw)?),
        ColumnType::Bool => Value::Bool(parse_bool(raw)?),
        ColumnType::LatLon => Value::Float(parse_lat_lon(raw)?),
        ColumnType::Date => Value::Date(parse_temporal(raw)?.to_datetime().date()),
        ColumnType::Time => Value::Time(match parse_temporal(raw)? {
            Temporal::Time(time) => time,
            other => other.to_datetime().time(),
        }),
        ColumnType::DateTime => Value::DateTime(parse_temporal(raw)?.to_datetime()),
    };
    Ok(value)
}

/// Parse a float written with either `.` or `,` as the decimal point
///
/// The last separator is the decimal point; earlier ones are grouping marks.
pub fn parse_float(raw: &str) -> Result<f64, CastError> {
    let trimmed = raw.trim();
    let normalized = match trimmed.rfind(|c: char| c == '.' || c == ',') {
        Some(pos) => {
            let whole: String = trimmed[..pos]
                .chars()
                .filter(|c| *c != '.' && *c != ',')
                .collect();
            format!("{}.{}", whole, &trimmed[pos + 1..])
        }
        None => trimmed.to_string(),
    };

    normalized
        .parse::<f64>()
        .map_err(|_| CastError(format!("not a float: '{}'", raw)))
}

pub fn parse_bool(raw: &str) -> Result<bool, CastError> {
    let lowered = raw.trim().to_lowercase();
    if let Some((_, value)) = BOOLEAN_TOKENS.iter().find(|(token, _)| *token == lowered) {
        return Ok(*value);
    }

    lowered
        .parse::<i64>()
        .map(|n| n != 0)
        .map_err(|_| CastError(format!("not a bool: '{}'", raw)))
}

/// Parse degrees-minutes-seconds with a trailing hemisphere into signed degrees
///
/// Accepts `20-55-70.010N` and `20°55'70.010"N` alike.
pub fn parse_lat_lon(raw: &str) -> Result<f64, CastError> {
    let trimmed = raw.trim();
    let hemisphere = trimmed
        .chars()
        .last()
        .ok_or_else(|| CastError("empty coordinate".to_string()))?;
    let sign = match hemisphere.to_ascii_uppercase() {
        'N' | 'E' => 1.0,
        'S' | 'W' => -1.0,
        other => return Err(CastError(format!("unknown hemisphere '{}'", other))),
    };

    let body = &trimmed[..trimmed.len() - hemisphere.len_utf8()];
    let parts: Vec<&str> = body
        .split(|c: char| matches!(c, '-' | '°' | '\'' | '"' | '′' | '″'))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    let [degrees, minutes, seconds] = parts.as_slice() else {
        return Err(CastError(format!(
            "expected degrees, minutes and seconds in '{}'",
            raw
        )));
    };

    let number = |part: &str| {
        part.parse::<f64>()
            .map_err(|_| CastError(format!("not a number: '{}' in '{}'", part, raw)))
    };
    Ok(sign * (number(*degrees)? + number(*minutes)? / 60.0 + number(*seconds)? / 3600.0))
}

/// General date-time parse over the supported formats
pub fn parse_temporal(raw: &str) -> Result<Temporal, CastError> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Temporal::DateTime(dt.naive_local()));
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
    {
        return Ok(Temporal::DateTime(dt));
    }
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
    {
        return Ok(Temporal::Date(date));
    }
    if let Some(time) = TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(trimmed, fmt).ok())
    {
        return Ok(Temporal::Time(time));
    }

    Err(CastError(format!("unrecognized date/time: '{}'", raw)))
}
