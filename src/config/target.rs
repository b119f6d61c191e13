//! Target syntax parsing: `host:port` or bare `host`.
//!
//! Port parsing is strict: digits only, no sign, no whitespace, leading
//! zeroes allowed, value must fit in `u16`.

use crate::error::TargetParseError;

/// Parses a port string strictly: every character must be an ASCII digit,
/// the numeric value must fit in `u16`, and leading zeroes are fine but
/// nothing else (no sign, no whitespace, no trailing garbage) is tolerated.
pub fn parse_port(s: &str) -> Result<u16, TargetParseError> {
    if s.is_empty() {
        return Err(TargetParseError::EmptyPort);
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TargetParseError::NonDigitPort);
    }
    s.parse::<u16>().map_err(|_| TargetParseError::PortOverflow)
}

/// Parses a target of the form `host:port` or bare `host` (port defaults to
/// `0`, meaning "use the listener port"). The *final* colon separates host
/// from port, so a bare IPv6 literal without brackets isn't supported.
/// This is a narrow host:port splitter, not a general URI authority parser.
pub fn parse_target(target: &str) -> Result<(String, u16), TargetParseError> {
    match target.rfind(':') {
        None => {
            if target.is_empty() {
                return Err(TargetParseError::EmptyHost);
            }
            Ok((target.to_string(), 0))
        }
        Some(idx) => {
            let (host, rest) = target.split_at(idx);
            let port_str = &rest[1..];
            if host.is_empty() {
                return Err(TargetParseError::EmptyHost);
            }
            let port = parse_port(port_str)?;
            Ok((host.to_string(), port))
        }
    }
}
