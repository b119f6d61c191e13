//! Route matcher: given a listener's route table, the slot
//! routes, and a candidate SNI, return the `Route` that applies.

use super::model::{Action, ConfigData, ListenerConfig, Route, SniPattern};

/// Outcome of matching an SNI (or its absence) against a listener's routes.
/// Carries a possibly-substituted `Route` (backreference tokens resolved)
/// so the caller never needs to re-touch the pattern.
pub struct Matched {
    pub route: Route,
}

/// Matches a candidate SNI (`Some(name)`, already lowercased by the parser,
/// or `None` for "no SNI extension") against `listener`'s route table,
/// falling back through the slot routes when nothing matches.
pub fn match_route(config: &ConfigData, listener: &ListenerConfig, sni: Option<&str>) -> Matched {
    let Some(name) = sni else {
        let route = config.resolve_slot(listener, |s| &s.no_sni_route);
        return Matched { route };
    };

    for candidate in &listener.routes {
        if let Some(pattern) = &candidate.sni_pattern {
            if let Some(capture) = pattern_matches(pattern, name) {
                return Matched {
                    route: substitute_backreference(candidate, name, capture),
                };
            }
        }
    }

    let route = config.resolve_slot(listener, |s| &s.default_route);
    Matched { route }
}

/// Returns `Some(capture)` if `pattern` matches `candidate`; `capture` is
/// the empty string for an exact match, or the leftmost portion preceding
/// `.suffix` for a wildcard match.
fn pattern_matches<'a>(pattern: &SniPattern, candidate: &'a str) -> Option<&'a str> {
    match pattern {
        SniPattern::Exact(exact) => {
            if exact.eq_ignore_ascii_case(candidate) {
                Some("")
            } else {
                None
            }
        }
        SniPattern::Wildcard { suffix } => {
            let dotted_suffix_len = suffix.len() + 1; // ".suffix"
            if candidate.len() <= dotted_suffix_len {
                return None;
            }
            let boundary = candidate.len() - dotted_suffix_len;
            let (capture, rest) = candidate.split_at(boundary);
            // rest is ".suffix"; rest[1..] must equal suffix case-insensitively.
            if rest.as_bytes()[0] == b'.' && rest[1..].eq_ignore_ascii_case(suffix) && !capture.is_empty() {
                Some(capture)
            } else {
                None
            }
        }
    }
}

/// Substitutes `{1}` / `\1` backreference tokens in a matched `Proxy`
/// route's `dest_hostname` with the wildcard capture (or, for a
/// non-wildcard match, the full candidate SNI).
fn substitute_backreference(route: &Route, full_sni: &str, capture: &str) -> Route {
    let Action::Proxy {
        dest_hostname,
        dest_port,
    } = &route.action
    else {
        return route.clone();
    };

    if !(dest_hostname.contains("{1}") || dest_hostname.contains("\\1")) {
        return route.clone();
    }

    let replacement = if capture.is_empty() { full_sni } else { capture };
    let substituted = dest_hostname.replace("{1}", replacement).replace("\\1", replacement);

    Route {
        action: Action::Proxy {
            dest_hostname: substituted,
            dest_port: *dest_port,
        },
        sni_pattern: route.sni_pattern.clone(),
    }
}
