// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Timeout header codecs. gRPC encodes `grpc-timeout` as up to eight digits
//! plus a unit letter; Connect/Triple use a plain millisecond count of up to
//! ten digits.

use std::time::Duration;

use crate::status::Status;

const MAX_GRPC_TIMEOUT_DIGITS: usize = 8;
const MAX_CONNECT_TIMEOUT_DIGITS: usize = 10;

/// Parses a `grpc-timeout` header value.
pub fn parse_grpc_timeout(value: &str) -> Result<Duration, Status> {
    if value.is_empty() || value.len() > MAX_GRPC_TIMEOUT_DIGITS + 1 {
        return Err(Status::invalid_argument(format!(
            "protocol error: invalid grpc-timeout value \"{}\"",
            value
        )));
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().map_err(|_| {
        Status::invalid_argument(format!(
            "protocol error: invalid grpc-timeout value \"{}\"",
            value
        ))
    })?;

    let duration = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => {
            return Err(Status::invalid_argument(format!(
                "protocol error: invalid grpc-timeout unit \"{}\"",
                unit
            )));
        }
    };
    Ok(duration)
}

/// Formats a duration as a `grpc-timeout` header value, preferring
/// millisecond precision and widening the unit when eight digits are not
/// enough.
pub fn format_grpc_timeout(timeout: Duration) -> String {
    const LIMIT: u128 = 99_999_999;

    let millis = timeout.as_millis();
    if millis <= LIMIT {
        return format!("{}m", millis);
    }
    let secs = timeout.as_secs() as u128;
    if secs <= LIMIT {
        return format!("{}S", secs);
    }
    let minutes = secs / 60;
    if minutes <= LIMIT {
        return format!("{}M", minutes);
    }
    format!("{}H", (minutes / 60).min(LIMIT))
}

/// Parses a `connect-timeout-ms` / `tri-timeout-ms` header value.
pub fn parse_connect_timeout(value: &str) -> Result<Duration, Status> {
    if value.is_empty()
        || value.len() > MAX_CONNECT_TIMEOUT_DIGITS
        || !value.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(Status::invalid_argument(format!(
            "protocol error: invalid connect timeout value \"{}\"",
            value
        )));
    }
    let millis: u64 = value.parse().map_err(|_| {
        Status::invalid_argument(format!(
            "protocol error: invalid connect timeout value \"{}\"",
            value
        ))
    })?;
    Ok(Duration::from_millis(millis))
}

pub fn format_connect_timeout(timeout: Duration) -> String {
    timeout.as_millis().to_string()
}

/// Rejects timeouts above the configured server-side ceiling.
pub fn enforce_max_timeout(timeout: Duration, max: Duration) -> Result<(), Status> {
    if timeout > max {
        return Err(Status::invalid_argument(format!(
            "timeout of {}ms exceeds the maximum of {}ms",
            timeout.as_millis(),
            max.as_millis()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_parse_grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_grpc_timeout("2M").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_grpc_timeout("3S").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_grpc_timeout("250m").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_grpc_timeout("7u").unwrap(), Duration::from_micros(7));
        assert_eq!(parse_grpc_timeout("9n").unwrap(), Duration::from_nanos(9));
    }

    #[test]
    fn test_parse_grpc_timeout_rejects_garbage() {
        for bad in ["", "m", "12", "123456789m", "-5m", "5x"] {
            let err = parse_grpc_timeout(bad).unwrap_err();
            assert_eq!(err.code, Code::InvalidArgument, "value {bad:?}");
        }
    }

    #[test]
    fn test_format_grpc_timeout_widens_units() {
        assert_eq!(format_grpc_timeout(Duration::from_millis(250)), "250m");
        let huge = Duration::from_secs(200_000_000);
        let formatted = format_grpc_timeout(huge);
        assert!(formatted.ends_with('S') || formatted.ends_with('M'));
        assert!(formatted.len() <= 9);
    }

    #[test]
    fn test_grpc_timeout_roundtrip() {
        for timeout in [
            Duration::from_millis(1),
            Duration::from_millis(5000),
            Duration::from_secs(90),
        ] {
            let parsed = parse_grpc_timeout(&format_grpc_timeout(timeout)).unwrap();
            assert_eq!(parsed, timeout);
        }
    }

    #[test]
    fn test_parse_connect_timeout() {
        assert_eq!(
            parse_connect_timeout("10000").unwrap(),
            Duration::from_secs(10)
        );
        for bad in ["", "abc", "10s", "12345678901"] {
            let err = parse_connect_timeout(bad).unwrap_err();
            assert_eq!(err.code, Code::InvalidArgument, "value {bad:?}");
        }
    }

    #[test]
    fn test_enforce_max_timeout() {
        assert!(enforce_max_timeout(Duration::from_secs(5), Duration::from_secs(10)).is_ok());
        let err =
            enforce_max_timeout(Duration::from_secs(11), Duration::from_secs(10)).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert!(err.message.contains("exceeds the maximum"));
    }
}
