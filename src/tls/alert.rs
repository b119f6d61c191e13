//! TLS fatal alert record synthesis.
//!
//! The gateway never performs a TLS handshake, so it cannot send a real
//! alert inside an established session; instead it writes a single bare
//! alert record as the entire response, then closes the socket. Clients
//! that sent a ClientHello and get this back treat it as a fatal alert on
//! the connection they were trying to open.

use crate::config::AlertSubtype;

/// Renders a 7-byte TLS alert record:
/// `content_type(1) record_version(2) length(2)=0x0002 level(1)=fatal description(1)`.
///
/// `record_version` should be the version echoed from the client's record
/// header when available; callers that never got far enough to
/// see one (e.g. `NotTls`) pass `(3, 3)`, the version used for a from-thin-air
/// alert per the same section.
pub fn render_alert(record_version: (u8, u8), subtype: AlertSubtype) -> [u8; 7] {
    const CONTENT_TYPE_ALERT: u8 = 0x15;
    const LEVEL_FATAL: u8 = 2;

    [
        CONTENT_TYPE_ALERT,
        record_version.0,
        record_version.1,
        0x00,
        0x02,
        LEVEL_FATAL,
        subtype.wire_value(),
    ]
}
