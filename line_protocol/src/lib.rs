//! Minimal line-protocol handling for the proxy: split a write payload into
//! per-line points tagged with their destination database and measurement.
//!
//! The proxy does not validate field syntax; the remote datastore remains the
//! authority on full line-protocol correctness. All this crate needs to do is
//! locate the measurement token (the routing input) and bring timestamps to
//! nanosecond precision.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::{ResultExt, Snafu};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no measurement found in line: {line}"))]
    MalformedLine { line: String },

    #[snafu(display("measurement is not valid utf-8"))]
    InvalidUtf8 { source: std::string::FromUtf8Error },

    #[snafu(display("invalid precision: {precision}"))]
    InvalidPrecision { precision: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single line-protocol record, tagged with the database it is destined
/// for. `line` holds the record without a trailing newline; the write buffer
/// guarantees one on append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePoint {
    pub db: String,
    pub measurement: String,
    pub line: Vec<u8>,
}

/// Timestamp precision of an inbound write request, per the InfluxDB 1.x
/// `precision` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    /// Multiplier converting a timestamp at this precision to nanoseconds.
    fn ns_multiplier(&self) -> i64 {
        match self {
            Self::Nanoseconds => 1,
            Self::Microseconds => 1_000,
            Self::Milliseconds => 1_000_000,
            Self::Seconds => 1_000_000_000,
            Self::Minutes => 60 * 1_000_000_000,
            Self::Hours => 3_600 * 1_000_000_000,
        }
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "n" | "ns" => Ok(Self::Nanoseconds),
            "u" | "us" | "µ" => Ok(Self::Microseconds),
            "ms" => Ok(Self::Milliseconds),
            "s" => Ok(Self::Seconds),
            "m" => Ok(Self::Minutes),
            "h" => Ok(Self::Hours),
            other => InvalidPrecisionSnafu { precision: other }.fail(),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Nanoseconds => "ns",
            Self::Microseconds => "us",
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
            Self::Minutes => "m",
            Self::Hours => "h",
        };
        f.write_str(s)
    }
}

/// Split a write payload into per-line points.
///
/// Blank lines and `#` comment lines are skipped. The whole payload is
/// rejected on the first line with no measurement token, so a client gets a
/// 400 rather than a silent partial write.
pub fn split_lines(payload: &[u8], db: &str, precision: Precision) -> Result<Vec<LinePoint>> {
    let mut points = Vec::new();
    for raw in payload.split(|&b| b == b'\n') {
        let line = trim_ascii(raw);
        if line.is_empty() || line[0] == b'#' {
            continue;
        }
        let measurement = measurement_token(line)?;
        let line = normalize_timestamp(line, precision);
        points.push(LinePoint {
            db: db.to_string(),
            measurement,
            line,
        });
    }
    Ok(points)
}

fn trim_ascii(mut line: &[u8]) -> &[u8] {
    while let [b' ' | b'\t' | b'\r', rest @ ..] = line {
        line = rest;
    }
    while let [rest @ .., b' ' | b'\t' | b'\r'] = line {
        line = rest;
    }
    line
}

/// Extract the measurement: the token before the first unescaped `,` or
/// space. `\,` and `\ ` unescape to the literal character; any other
/// backslash is kept verbatim, matching the line-protocol scanner rules.
fn measurement_token(line: &[u8]) -> Result<String> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b'\\' if matches!(line.get(i + 1), Some(b',' | b' ')) => {
                out.push(line[i + 1]);
                i += 2;
            }
            b',' | b' ' => break,
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    if out.is_empty() {
        return MalformedLineSnafu {
            line: String::from_utf8_lossy(line),
        }
        .fail();
    }
    String::from_utf8(out).context(InvalidUtf8Snafu)
}

/// Rescale a trailing integer timestamp to nanoseconds. Lines without a
/// timestamp, or whose final token is not an integer, pass through unchanged;
/// the remote re-validates. An out-of-range product also passes through.
fn normalize_timestamp(line: &[u8], precision: Precision) -> Vec<u8> {
    if precision == Precision::Nanoseconds {
        return line.to_vec();
    }
    let Some(pos) = line.iter().rposition(|&b| b == b' ') else {
        return line.to_vec();
    };
    let token = &line[pos + 1..];
    let Ok(ts) = std::str::from_utf8(token)
        .map_err(|_| ())
        .and_then(|s| s.parse::<i64>().map_err(|_| ()))
    else {
        return line.to_vec();
    };
    match ts.checked_mul(precision.ns_multiplier()) {
        Some(ns) => {
            let mut out = line[..=pos].to_vec();
            out.extend_from_slice(ns.to_string().as_bytes());
            out
        }
        None => line.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn split_tags_each_line() {
        let payload = b"cpu,host=a value=1 1\nmem value=2 2\n";
        let points = split_lines(payload, "db0", Precision::Nanoseconds).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].measurement, "cpu");
        assert_eq!(points[0].db, "db0");
        assert_eq!(points[0].line, b"cpu,host=a value=1 1");
        assert_eq!(points[1].measurement, "mem");
    }

    #[test]
    fn split_skips_blank_and_comment_lines() {
        let payload = b"\n# a comment\n\r\ncpu value=1\n\n";
        let points = split_lines(payload, "db0", Precision::Nanoseconds).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "cpu");
    }

    #[test]
    fn measurement_honors_escapes() {
        let points =
            split_lines(br"cpu\ load\,total,host=a value=1", "db0", Precision::Nanoseconds)
                .unwrap();
        assert_eq!(points[0].measurement, "cpu load,total");

        // A backslash not followed by `,` or space stays verbatim.
        let points = split_lines(br"disk\io value=1", "db0", Precision::Nanoseconds).unwrap();
        assert_eq!(points[0].measurement, r"disk\io");
    }

    #[test]
    fn missing_measurement_rejects_payload() {
        let err = split_lines(b"cpu value=1\n,host=a value=2", "db0", Precision::Nanoseconds)
            .unwrap_err();
        assert_matches!(err, Error::MalformedLine { line } if line == ",host=a value=2");
    }

    #[test]
    fn timestamp_rescaled_to_nanoseconds() {
        let points = split_lines(b"cpu value=1 1465839830", "db0", Precision::Seconds).unwrap();
        assert_eq!(points[0].line, b"cpu value=1 1465839830000000000");

        let points = split_lines(b"cpu value=1 1465839830100", "db0", Precision::Milliseconds)
            .unwrap();
        assert_eq!(points[0].line, b"cpu value=1 1465839830100000000");
    }

    #[test]
    fn line_without_timestamp_passes_through() {
        let points = split_lines(b"cpu value=1", "db0", Precision::Seconds).unwrap();
        assert_eq!(points[0].line, b"cpu value=1");

        // Final token is a quoted string, not a timestamp.
        let points = split_lines(b"cpu note=\"a b\"", "db0", Precision::Seconds).unwrap();
        assert_eq!(points[0].line, b"cpu note=\"a b\"");
    }

    #[test]
    fn precision_parses_influx_aliases() {
        assert_eq!("ns".parse::<Precision>().unwrap(), Precision::Nanoseconds);
        assert_eq!("".parse::<Precision>().unwrap(), Precision::Nanoseconds);
        assert_eq!("u".parse::<Precision>().unwrap(), Precision::Microseconds);
        assert_eq!("h".parse::<Precision>().unwrap(), Precision::Hours);
        assert_matches!("d".parse::<Precision>(), Err(Error::InvalidPrecision { .. }));
    }
}
