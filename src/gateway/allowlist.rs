// ABOUTME: Static destination allow-list for the egress gateway
// Entries come from deployment configuration and never change at runtime

use crate::gateway::GatewayError;
use regex::Regex;

/// One configured destination: `host`, `host:port`, `*.domain` or
/// `*.domain:port`. Without a port the entry covers every port. Hostnames
/// and IPv4 literals only; IPv6 bracket literals are not supported.
#[derive(Debug)]
struct Entry {
    matcher: HostMatcher,
    port: Option<u16>,
}

#[derive(Debug)]
enum HostMatcher {
    Exact(String),
    /// `*.example.com` — any subdomain, not the apex itself.
    Suffix(Regex),
}

impl Entry {
    fn matches(&self, host: &str, port: u16) -> bool {
        if let Some(p) = self.port {
            if p != port {
                return false;
            }
        }
        match &self.matcher {
            HostMatcher::Exact(h) => h == host,
            HostMatcher::Suffix(re) => re.is_match(host),
        }
    }
}

/// The platform's approved destinations. Empty means deny everything.
#[derive(Debug, Default)]
pub struct Allowlist {
    entries: Vec<Entry>,
}

impl Allowlist {
    pub fn parse(raw_entries: &[String]) -> Result<Self, GatewayError> {
        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            entries.push(parse_entry(raw)?);
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Case-insensitive host match; a trailing dot on the host is ignored.
    pub fn permits(&self, host: &str, port: u16) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.entries.iter().any(|e| e.matches(&host, port))
    }
}

fn parse_entry(raw: &str) -> Result<Entry, GatewayError> {
    let invalid = |reason: &str| GatewayError::InvalidAllowlistEntry {
        entry: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty entry"));
    }

    // IPv6 literals cannot be expressed as entries, and a bracketed CONNECT
    // target matches no entry either, so v6 egress is always denied.
    if trimmed.contains('[') || trimmed.contains(']') {
        return Err(invalid("IPv6 literals are not supported"));
    }

    // Split an optional trailing port.
    let (host_part, port) = match trimmed.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| invalid("port is not a number"))?;
            (host, Some(port))
        }
        _ => (trimmed, None),
    };

    let host = host_part.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err(invalid("empty host"));
    }

    if let Some(domain) = host.strip_prefix("*.") {
        if domain.is_empty() || domain.contains('*') {
            return Err(invalid("wildcard must be of the form *.domain"));
        }
        validate_host_chars(domain).map_err(invalid)?;
        let pattern = format!(r"^([a-z0-9-]+\.)+{}$", regex::escape(domain));
        let re = Regex::new(&pattern).map_err(|_| invalid("unbuildable wildcard"))?;
        return Ok(Entry {
            matcher: HostMatcher::Suffix(re),
            port,
        });
    }

    if host.contains('*') {
        return Err(invalid("wildcard only allowed as a *. prefix"));
    }
    validate_host_chars(&host).map_err(invalid)?;

    Ok(Entry {
        matcher: HostMatcher::Exact(host),
        port,
    })
}

fn validate_host_chars(host: &str) -> Result<(), &'static str> {
    let ok = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if ok {
        Ok(())
    } else {
        Err("host contains invalid characters")
    }
}
