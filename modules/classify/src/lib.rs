use owl_core::Classification;
use regex::Regex;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::OnceLock;

// Scheme list keeps the legacy ftps/tcp forms the service still accepts.
const URL_PATTERN: &str = concat!(
    r"^(?i)(?:htt|ft|tc)ps?://[a-z0-9-]{1,63}(?:\.[a-z0-9-]{1,63})+",
    r"(?:/[a-z0-9-]{1,63})*(?:\.\w+)?"
);
const DOMAIN_PATTERN: &str = r"^(?i)\.?[a-z0-9-]{1,63}(?:\.[a-z0-9-]{1,63})+$";
// md5, sha1, sha256
const HASH_PATTERN: &str = r"^(?i)(?:[a-f0-9]{32}|[a-f0-9]{40}|[a-f0-9]{64})$";

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(URL_PATTERN).expect("url pattern compiles"))
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DOMAIN_PATTERN).expect("domain pattern compiles"))
}

fn hash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(HASH_PATTERN).expect("hash pattern compiles"))
}

/// Plain IPv4/IPv6 literals, plus IPv6 with a zone index (`fe80::1%eth0`).
fn is_ip_literal(value: &str) -> bool {
    if value.parse::<IpAddr>().is_ok() {
        return true;
    }
    match value.split_once('%') {
        Some((addr, zone)) => {
            !zone.is_empty() && !zone.contains('%') && addr.parse::<Ipv6Addr>().is_ok()
        }
        None => false,
    }
}

/// Classifies an observable value. Checks run in a fixed order (ip, url,
/// domain, hash) and anything unmatched is `Generic`, which the service
/// accepts as a target in its own right.
pub fn classify(value: &str) -> Classification {
    if is_ip_literal(value) {
        return Classification::Ip;
    }
    if url_re().is_match(value) {
        return Classification::Url;
    }
    if domain_re().is_match(value) {
        return Classification::Domain;
    }
    if hash_re().is_match(value) {
        return Classification::Hash;
    }
    tracing::warn!(
        observable = value,
        "couldn't detect observable classification, setting as 'generic'"
    );
    Classification::Generic
}

/// Uses the caller's classification when given, otherwise detects one.
/// An override that is not a known classification is rejected.
pub fn resolve(value: &str, requested: Option<&str>) -> owl_core::Result<Classification> {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(c) => c.parse(),
        None => Ok(classify(value)),
    }
}
