//! Standalone utility: validates hostnames and SNI patterns against the
//! same ASCII-DNS-character rule the ClientHello parser applies to SNI
//! `host_name` entries and the same wildcard-pattern shape the
//! route matcher accepts, before an operator commits them to a
//! config file. Not part of the running proxy; a small companion binary
//! shipped alongside it for operators.

use std::process::ExitCode;

use sni_gateway::config::SniPattern;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: sni-gateway-hostnamecheck <hostname-or-pattern>...");
        return ExitCode::from(2);
    }

    let mut all_valid = true;
    for arg in &args {
        match check(arg) {
            Ok(normalized) => println!("{arg}: ok ({normalized})"),
            Err(reason) => {
                println!("{arg}: invalid ({reason})");
                all_valid = false;
            }
        }
    }

    if all_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Validates and normalizes one hostname or SNI pattern. Wildcard patterns
/// (`*.suffix`) are checked the way [`SniPattern::parse`] would accept
/// them; everything else is checked as a plain hostname via `idna`'s IDNA
/// normalization, then re-checked against the same ASCII-DNS-character rule
/// the ClientHello parser applies to SNI entries themselves.
fn check(input: &str) -> Result<String, String> {
    let to_normalize = input.strip_prefix("*.").unwrap_or(input);
    if input.starts_with("*.") && to_normalize.is_empty() {
        return Err("wildcard pattern has no suffix".to_string());
    }

    let normalized = idna::domain_to_ascii(to_normalize).map_err(|err| format!("{err}"))?;

    if !normalized
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
    {
        return Err("contains characters outside the SNI host_name charset (letters, digits, '-', '.')".to_string());
    }

    if SniPattern::parse(input).is_none() {
        return Err("not a valid route pattern (a '*' may only appear as a whole leading label)".to_string());
    }

    if input.starts_with("*.") {
        Ok(format!("*.{normalized}"))
    } else {
        Ok(normalized)
    }
}
