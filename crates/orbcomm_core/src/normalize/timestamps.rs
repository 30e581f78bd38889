use lazy_static::lazy_static;
use regex::Regex;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

lazy_static! {
    // "2025-10-22 15:05 GMT", seconds and zone optional. Anything after the zone is ignored.
    static ref INCIDENT_TS_RE: Regex = Regex::new(
        r"^(\d{4})-(\d{1,2})-(\d{1,2})[ T]+(\d{1,2}):(\d{2})(?::(\d{2}))?(?:\s*([A-Za-z]{1,5})\b)?"
    )
    .expect("incident timestamp regex must parse");
}

/// Email metadata timestamp split the way records store it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFields {
    /// Canonical RFC3339 UTC, whole seconds.
    pub received_at: String,
    /// `YYYY-MM-DD` in UTC.
    pub date_received: String,
    /// `HH:MM` in UTC.
    pub time_received: String,
}

/// Canonical RFC3339 UTC string, truncated to whole seconds.
///
/// Fractional seconds are dropped so that stored values sort lexically in time order.
pub fn canonicalize_rfc3339_utc(dt: OffsetDateTime) -> Option<String> {
    let utc = dt.to_offset(UtcOffset::UTC).replace_nanosecond(0).ok()?;
    utc.format(&Rfc3339).ok()
}

pub fn received_fields(dt: OffsetDateTime) -> Option<ReceivedFields> {
    let utc = dt.to_offset(UtcOffset::UTC);
    Some(ReceivedFields {
        received_at: canonicalize_rfc3339_utc(utc)?,
        date_received: utc.format(format_description!("[year]-[month]-[day]")).ok()?,
        time_received: utc.format(format_description!("[hour]:[minute]")).ok()?,
    })
}

/// Parse an email's received timestamp: RFC3339, or RFC2822 as found in `Date:` headers.
pub fn parse_received_at(raw: &str) -> Option<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    OffsetDateTime::parse(trimmed, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(trimmed, &Rfc2822))
        .ok()
}

/// Whole minutes from `from` to `to`, floored. Negative when `to` precedes `from`.
pub fn minutes_between(from: OffsetDateTime, to: OffsetDateTime) -> i64 {
    (to - from).whole_seconds().div_euclid(60)
}

/// Fixed offsets for zone abbreviations seen in vendor notifications.
fn zone_offset(abbrev: &str) -> Option<UtcOffset> {
    let hours: i8 = match abbrev.to_ascii_uppercase().as_str() {
        "GMT" | "UTC" | "UT" | "Z" | "WET" => 0,
        "BST" | "CET" | "WEST" => 1,
        "CEST" | "EET" => 2,
        "EEST" => 3,
        "EST" | "CDT" => -5,
        "EDT" => -4,
        "CST" => -6,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        _ => return None,
    };
    UtcOffset::from_hms(hours, 0, 0).ok()
}

/// A vendor-stated wall-clock timestamp and the zone it was stated in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZonedWallClock {
    pub naive: PrimitiveDateTime,
    /// Zone abbreviation as written, upper-cased. `None` when the value carried no zone.
    pub zone: Option<String>,
    /// Offset for `zone`, when the abbreviation is known.
    pub offset: Option<UtcOffset>,
}

impl ZonedWallClock {
    /// `YYYY-MM-DD HH:MM:SS`, zone not included.
    pub fn naive_string(&self) -> Option<String> {
        self.naive
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .ok()
    }
}

/// Parse `YYYY-MM-DD HH:MM[:SS] <TZ>` as written in incident bodies.
///
/// Returns a human-readable reason on failure; callers surface it as a warning.
pub fn parse_zoned_wall_clock(raw: &str) -> Result<ZonedWallClock, String> {
    let cleaned = raw.replace('\u{a0}', " ");
    let trimmed = cleaned.trim();
    let caps = INCIDENT_TS_RE
        .captures(trimmed)
        .ok_or_else(|| format!("value={trimmed:?} does not match YYYY-MM-DD HH:MM TZ"))?;

    let num = |idx: usize| -> Result<u32, String> {
        caps.get(idx)
            .map(|m| m.as_str())
            .unwrap_or("0")
            .parse::<u32>()
            .map_err(|e| format!("value={trimmed:?}; err={e}"))
    };

    let year = i32::try_from(num(1)?).map_err(|e| format!("value={trimmed:?}; err={e}"))?;
    let month = u8::try_from(num(2)?)
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .ok_or_else(|| format!("value={trimmed:?}; month out of range"))?;
    let day = u8::try_from(num(3)?).map_err(|e| format!("value={trimmed:?}; err={e}"))?;
    let date = Date::from_calendar_date(year, month, day)
        .map_err(|e| format!("value={trimmed:?}; err={e}"))?;

    let hour = u8::try_from(num(4)?).map_err(|e| format!("value={trimmed:?}; err={e}"))?;
    let minute = u8::try_from(num(5)?).map_err(|e| format!("value={trimmed:?}; err={e}"))?;
    let second = u8::try_from(num(6)?).map_err(|e| format!("value={trimmed:?}; err={e}"))?;
    let time =
        Time::from_hms(hour, minute, second).map_err(|e| format!("value={trimmed:?}; err={e}"))?;

    let zone = caps.get(7).map(|m| m.as_str().to_ascii_uppercase());
    let offset = zone.as_deref().and_then(zone_offset);

    Ok(ZonedWallClock {
        naive: PrimitiveDateTime::new(date, time),
        zone,
        offset,
    })
}

/// Whole minutes from `start` to `end`.
///
/// Same-zone values are compared as wall clocks; values in different zones need known
/// offsets for both, otherwise the difference is undefined and `None` is returned.
pub fn wall_clock_minutes(start: &ZonedWallClock, end: &ZonedWallClock) -> Option<i64> {
    if start.zone == end.zone {
        return Some((end.naive - start.naive).whole_seconds().div_euclid(60));
    }
    let (Some(so), Some(eo)) = (start.offset, end.offset) else {
        return None;
    };
    Some(minutes_between(
        start.naive.assume_offset(so),
        end.naive.assume_offset(eo),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn received_fields_are_utc_and_truncated() {
        let dt = datetime!(2025-10-22 17:05:42.750 +02:00);
        let f = received_fields(dt).expect("fields");
        assert_eq!(f.received_at, "2025-10-22T15:05:42Z");
        assert_eq!(f.date_received, "2025-10-22");
        assert_eq!(f.time_received, "15:05");
    }

    #[test]
    fn parses_rfc2822_header_dates() {
        let dt = parse_received_at("Tue, 29 Oct 2024 10:30:45 -0700").expect("rfc2822");
        assert_eq!(
            canonicalize_rfc3339_utc(dt).as_deref(),
            Some("2024-10-29T17:30:45Z")
        );
        assert!(parse_received_at("yesterday").is_none());
    }

    #[test]
    fn wall_clock_parsing_accepts_vendor_format() {
        let ts = parse_zoned_wall_clock("2025-10-22 15:05 GMT").expect("parse");
        assert_eq!(ts.naive_string().as_deref(), Some("2025-10-22 15:05:00"));
        assert_eq!(ts.zone.as_deref(), Some("GMT"));
        assert_eq!(ts.offset, Some(UtcOffset::UTC));

        assert!(parse_zoned_wall_clock("INVALID FORMAT").is_err());
        assert!(parse_zoned_wall_clock("2025-13-01 10:00 GMT").is_err());
        assert!(parse_zoned_wall_clock("2025-10-20 25:00 GMT").is_err());
    }

    #[test]
    fn minutes_across_zones_use_offsets() {
        let start = parse_zoned_wall_clock("2025-10-20 10:00 EST").unwrap();
        let end = parse_zoned_wall_clock("2025-10-20 16:30 GMT").unwrap();
        assert_eq!(wall_clock_minutes(&start, &end), Some(90));

        let odd = parse_zoned_wall_clock("2025-10-20 16:30 XYZ").unwrap();
        assert_eq!(wall_clock_minutes(&start, &odd), None);
    }

    #[test]
    fn minutes_between_floors() {
        let a = datetime!(2025-01-01 00:00:00 UTC);
        let b = datetime!(2025-01-01 00:01:59 UTC);
        assert_eq!(minutes_between(a, b), 1);
        assert_eq!(minutes_between(b, a), -2);
    }
}
