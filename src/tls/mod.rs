//! TLS ClientHello parsing and fatal-alert rendering.
//!
//! Neither module performs any cryptography; both work purely on the
//! unencrypted record/handshake framing that precedes the actual TLS key
//! exchange. The proxy never decrypts anything.

pub mod alert;
pub mod parser;

pub use alert::render_alert;
pub use parser::{ClientHelloError, ClientHelloParser, ParseOutcome};
