//! Incremental TLS ClientHello parser.
//!
//! This is a pull parser: the caller `feed()`s whatever bytes it has just
//! read from the client socket, and gets back one of four outcomes. Once a
//! terminal outcome (anything but [`ParseOutcome::NeedMore`]) is produced,
//! the same outcome is returned on any further `feed()` call; this parser
//! is restartable only by constructing a new instance, so we don't
//! re-derive anything once we've committed to an answer.
//!
//! The field walk below mirrors the classic ClientHello layout (RFC 8446
//! §4.1.2: client version, random, session id, cipher suites, compression
//! methods, extensions), restated as a buffer-at-a-time scan rather than an
//! `async` read-ahead, since this parser only supports a ClientHello
//! contained in a single TLS record: we
//! simply wait (`NeedMore`) until the whole record has arrived, then walk
//! it synchronously. Any inconsistency found once the full record is in
//! hand is internal to already-received bytes, so it is always reported as
//! `Malformed`; see [`ClientHelloError::Truncated`] for the one case that
//! can be detected from the header alone, before the rest of the record
//! arrives.

/// Result of feeding another chunk of bytes to the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// More bytes are required before a decision can be made.
    NeedMore,
    /// The ClientHello has been fully parsed. `sni` is the lowercased
    /// `host_name` entry of the SNI extension, if present.
    Done(Option<String>),
    /// The byte prefix cannot be the start of a TLS record.
    NotTls { looks_like_http: bool },
    /// The prefix looks like TLS but is not a valid ClientHello.
    Error(ClientHelloError),
}

/// `kind` of [`ParseOutcome::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientHelloError {
    /// Declared record length exceeds `16384 + 2048` bytes.
    RecordTooLarge,
    /// Reserved for cross-record handshake reassembly, which this parser
    /// does not implement: a later TLS record
    /// within the same reassembled handshake with an unexpected content
    /// type would be reported here. Unreachable in the current
    /// single-record-only implementation.
    BadRecordType,
    /// Record version's major/minor byte isn't an accepted TLS version.
    BadVersion,
    /// The record is shorter than any ClientHello could validly be; no
    /// amount of additional bytes would make it valid.
    Truncated,
    /// A length field is internally inconsistent given bytes already in
    /// hand (oversized sub-field, handshake not fitting its record, an
    /// SNI hostname with non-DNS characters, and so on).
    Malformed,
}

/// Minimum length of a syntactically possible ClientHello handshake
/// message: 2 (client version) + 32 (random) + 1 (empty session id length)
/// + 2 (empty cipher suites length) + 1 (empty compression methods length)
/// + 2 (empty extensions length), preceded by the 4-byte handshake header
/// (type + 3-byte length).
const MIN_CLIENTHELLO_RECORD_LEN: usize = 4 + 2 + 32 + 1 + 2 + 1 + 2;

/// `16384 + 2048`, the largest accepted record length.
const MAX_RECORD_LEN: usize = 16384 + 2048;

const HTTP_METHOD_PREFIXES: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"HEAD ",
    b"PUT ",
    b"DELETE ",
    b"CONNECT ",
    b"OPTIONS ",
    b"TRACE ",
    b"PATCH ",
];

pub struct ClientHelloParser {
    buf: Vec<u8>,
    result: Option<ParseOutcome>,
}

impl ClientHelloParser {
    pub fn new() -> Self {
        ClientHelloParser {
            buf: Vec::with_capacity(4096),
            result: None,
        }
    }

    /// Feeds `data` to the parser and returns the outcome. Once a terminal
    /// outcome has been produced, returns it again without touching `data`.
    pub fn feed(&mut self, data: &[u8]) -> ParseOutcome {
        if let Some(result) = &self.result {
            return result.clone();
        }
        self.buf.extend_from_slice(data);
        let outcome = self.try_parse();
        if outcome != ParseOutcome::NeedMore {
            self.result = Some(outcome.clone());
        }
        outcome
    }

    /// Total bytes fed so far. Used by the connection state machine to
    /// enforce the 18 KiB hello-read bound independently of
    /// this parser's own `RecordTooLarge` check.
    pub fn bytes_fed(&self) -> usize {
        self.buf.len()
    }

    /// The record layer version byte pair, once at least 3 bytes of a
    /// TLS-looking prefix have arrived. `None` before then, and `None`
    /// forever once the prefix has been classified as [`ParseOutcome::NotTls`]
    /// (there is no record version to echo). Used to build the alert
    /// record's version field.
    pub fn record_version(&self) -> Option<(u8, u8)> {
        if self.buf.first() == Some(&0x16) && self.buf.len() >= 3 {
            Some((self.buf[1], self.buf[2]))
        } else {
            None
        }
    }

    fn try_parse(&self) -> ParseOutcome {
        let buf = &self.buf[..];

        if buf.is_empty() {
            return ParseOutcome::NeedMore;
        }

        if buf[0] != 0x16 {
            return match classify_http_prefix(buf) {
                None => ParseOutcome::NeedMore,
                Some(looks_like_http) => ParseOutcome::NotTls { looks_like_http },
            };
        }

        if buf.len() < 3 {
            return ParseOutcome::NeedMore;
        }
        if buf[1] != 3 || !(1..=4).contains(&buf[2]) {
            return ParseOutcome::Error(ClientHelloError::BadVersion);
        }

        if buf.len() < 5 {
            return ParseOutcome::NeedMore;
        }
        let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
        if record_len > MAX_RECORD_LEN {
            return ParseOutcome::Error(ClientHelloError::RecordTooLarge);
        }
        if record_len < MIN_CLIENTHELLO_RECORD_LEN {
            return ParseOutcome::Error(ClientHelloError::Truncated);
        }

        let total_needed = 5 + record_len;
        if buf.len() < total_needed {
            return ParseOutcome::NeedMore;
        }

        let handshake_type = buf[5];
        if handshake_type != 0x01 {
            return ParseOutcome::Error(ClientHelloError::Malformed);
        }
        let handshake_len =
            ((buf[6] as usize) << 16) | ((buf[7] as usize) << 8) | (buf[8] as usize);
        if 4 + handshake_len > record_len {
            return ParseOutcome::Error(ClientHelloError::Malformed);
        }

        let body = &buf[9..9 + handshake_len];
        parse_client_hello_body(body)
    }
}

impl Default for ClientHelloParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Classifies a non-TLS prefix as HTTP-looking or not. Returns
/// `None` if `buf` is a strict prefix of some candidate method and more
/// bytes are needed to tell; `Some(true)` once `buf` matches a full
/// `METHOD ` token; `Some(false)` once `buf` cannot possibly match any
/// candidate.
fn classify_http_prefix(buf: &[u8]) -> Option<bool> {
    let mut ambiguous = false;
    for method in HTTP_METHOD_PREFIXES {
        if buf.len() >= method.len() {
            if &buf[..method.len()] == *method {
                return Some(true);
            }
        } else if method.starts_with(buf) {
            ambiguous = true;
        }
    }
    if ambiguous {
        None
    } else {
        Some(false)
    }
}

fn read_u16(buf: &[u8], pos: usize) -> usize {
    ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize)
}

/// Walks a fully-buffered ClientHello body. Every byte named
/// here is already present, so any inconsistency is `Malformed`.
fn parse_client_hello_body(body: &[u8]) -> ParseOutcome {
    // client_version (2) + random (32)
    if body.len() < 34 {
        return ParseOutcome::Error(ClientHelloError::Malformed);
    }
    let mut pos = 34;

    let Some(pos2) = advance_length_prefixed(body, pos, 1) else {
        return ParseOutcome::Error(ClientHelloError::Malformed);
    };
    pos = pos2;

    let Some(pos2) = advance_length_prefixed(body, pos, 2) else {
        return ParseOutcome::Error(ClientHelloError::Malformed);
    };
    pos = pos2;

    let Some(pos2) = advance_length_prefixed(body, pos, 1) else {
        return ParseOutcome::Error(ClientHelloError::Malformed);
    };
    pos = pos2;

    // No extensions block at all: legacy ClientHello, no SNI.
    if pos == body.len() {
        return ParseOutcome::Done(None);
    }
    if pos + 2 > body.len() {
        return ParseOutcome::Error(ClientHelloError::Malformed);
    }
    let extensions_len = read_u16(body, pos);
    pos += 2;
    if pos + extensions_len != body.len() {
        return ParseOutcome::Error(ClientHelloError::Malformed);
    }
    let extensions_end = pos + extensions_len;

    let mut sni: Option<String> = None;
    while pos < extensions_end {
        if pos + 4 > extensions_end {
            return ParseOutcome::Error(ClientHelloError::Malformed);
        }
        let ext_type = read_u16(body, pos);
        let ext_len = read_u16(body, pos + 2);
        pos += 4;
        if pos + ext_len > extensions_end {
            return ParseOutcome::Error(ClientHelloError::Malformed);
        }

        if ext_type == 0x0000 && sni.is_none() {
            match parse_server_name_extension(&body[pos..pos + ext_len]) {
                Ok(name) => sni = name,
                Err(()) => return ParseOutcome::Error(ClientHelloError::Malformed),
            }
        }

        pos += ext_len;
    }

    ParseOutcome::Done(sni)
}

/// Skips a `length_prefix_bytes`-byte length field followed by that many
/// bytes (session id, cipher suites, compression methods); returns the new
/// position, or `None` if it would read past `body`.
fn advance_length_prefixed(body: &[u8], pos: usize, length_prefix_bytes: usize) -> Option<usize> {
    if pos + length_prefix_bytes > body.len() {
        return None;
    }
    let len = match length_prefix_bytes {
        1 => body[pos] as usize,
        2 => read_u16(body, pos),
        _ => unreachable!(),
    };
    let pos = pos + length_prefix_bytes;
    if pos + len > body.len() {
        return None;
    }
    Some(pos + len)
}

/// Parses the SNI extension body: 2-byte list length, then
/// `name_type` (1) + `name_length` (2) + name entries. Returns the first
/// `host_name` (`name_type == 0x00`) entry, lowercased, or `Err(())` on any
/// inconsistency or non-DNS character.
fn parse_server_name_extension(data: &[u8]) -> Result<Option<String>, ()> {
    if data.len() < 2 {
        return Err(());
    }
    let list_len = read_u16(data, 0);
    if 2 + list_len != data.len() {
        return Err(());
    }
    let mut pos = 2;
    let end = data.len();

    while pos < end {
        if pos + 3 > end {
            return Err(());
        }
        let name_type = data[pos];
        let name_len = read_u16(data, pos + 1);
        pos += 3;
        if pos + name_len > end {
            return Err(());
        }
        let name_bytes = &data[pos..pos + name_len];
        pos += name_len;

        if name_type == 0x00 {
            let name = validate_and_lowercase_hostname(name_bytes)?;
            return Ok(Some(name));
        }
    }

    Ok(None)
}

fn validate_and_lowercase_hostname(bytes: &[u8]) -> Result<String, ()> {
    if !bytes
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
    {
        return Err(());
    }
    let s = std::str::from_utf8(bytes).map_err(|_| ())?;
    Ok(s.to_ascii_lowercase())
}
