//! Rule-based outbound selection
//!
//! Rules are `kind,value,tag` or `final,tag`, evaluated in order:
//!
//! - `domain,example.com,proxy`: exact host match
//! - `domain-suffix,example.com,proxy`: the host or any subdomain
//! - `domain-keyword,google,proxy`: substring of the host
//! - `ip-cidr,10.0.0.0/8,direct`: IP destinations inside the network
//! - `final,proxy`: everything else (must be last)
//!
//! Unmatched destinations go to [`DIRECT`].

use crate::error::TunnelError;
use crate::protocol::Address;
use std::net::IpAddr;
use std::sync::Arc;

/// Built-in outbound that connects straight to the destination
pub const DIRECT: &str = "direct";

/// Built-in outbound that refuses the connection
pub const REJECT: &str = "reject";

/// Maps a destination to an outbound tag
pub type Dispatch = Arc<dyn Fn(&Address) -> String + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
enum Matcher {
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    IpCidr(IpAddr, u8),
    Final,
}

impl Matcher {
    fn matches(&self, addr: &Address) -> bool {
        match (self, addr) {
            (Matcher::Final, _) => true,
            (Matcher::Domain(d), Address::Domain(host, _)) => host.eq_ignore_ascii_case(d),
            (Matcher::DomainSuffix(suffix), Address::Domain(host, _)) => {
                let host = host.to_ascii_lowercase();
                host == *suffix || host.ends_with(&format!(".{}", suffix))
            }
            (Matcher::DomainKeyword(keyword), Address::Domain(host, _)) => {
                host.to_ascii_lowercase().contains(keyword.as_str())
            }
            (Matcher::IpCidr(net, prefix), Address::Ip(addr)) => cidr_contains(*net, *prefix, addr.ip()),
            _ => false,
        }
    }
}

fn cidr_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Rule {
    matcher: Matcher,
    tag: String,
}

fn parse_rule(s: &str) -> Result<Rule, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let (kind, value, tag) = match parts.as_slice() {
        [kind, tag] => (kind.to_ascii_lowercase(), "", *tag),
        [kind, value, tag] => (kind.to_ascii_lowercase(), *value, *tag),
        _ => return Err(format!("bad rule: {}", s)),
    };
    if tag.is_empty() {
        return Err(format!("missing outbound in rule: {}", s));
    }
    if kind != "final" && value.is_empty() {
        return Err(format!("empty rule value: {}", s));
    }

    let matcher = match kind.as_str() {
        "domain" => Matcher::Domain(value.to_ascii_lowercase()),
        "domain-suffix" => Matcher::DomainSuffix(value.trim_start_matches('.').to_ascii_lowercase()),
        "domain-keyword" => Matcher::DomainKeyword(value.to_ascii_lowercase()),
        "ip-cidr" => {
            let (net, prefix) = value
                .split_once('/')
                .ok_or_else(|| format!("bad CIDR in rule: {}", s))?;
            let net: IpAddr = net.parse().map_err(|_| format!("bad CIDR in rule: {}", s))?;
            let prefix: u8 = prefix.parse().map_err(|_| format!("bad CIDR in rule: {}", s))?;
            let max = if net.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(format!("bad CIDR prefix in rule: {}", s));
            }
            Matcher::IpCidr(net, prefix)
        }
        "final" if parts.len() == 2 => Matcher::Final,
        _ => return Err(format!("unsupported rule: {}", s)),
    };

    Ok(Rule {
        matcher,
        tag: tag.to_ascii_lowercase(),
    })
}

/// Ordered rule list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Router {
    rules: Vec<Rule>,
}

impl Router {
    /// Parse rules; a `final` rule anywhere but last is an error
    pub fn new<S: AsRef<str>>(rules: &[S]) -> Result<Self, TunnelError> {
        let mut parsed = Vec::with_capacity(rules.len());
        for (i, raw) in rules.iter().enumerate() {
            let rule = parse_rule(raw.as_ref()).map_err(TunnelError::Config)?;
            if rule.matcher == Matcher::Final && i != rules.len() - 1 {
                return Err(TunnelError::Config(
                    "final rule must be placed last".to_string(),
                ));
            }
            parsed.push(rule);
        }
        Ok(Router { rules: parsed })
    }

    /// Outbound tag for `addr`
    pub fn dispatch(&self, addr: &Address) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(addr))
            .map(|rule| rule.tag.as_str())
            .unwrap_or(DIRECT)
    }

    /// Every outbound tag the rules refer to
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.tag.as_str())
    }

    /// Wrap into a shareable [`Dispatch`] function
    pub fn into_dispatch(self) -> Dispatch {
        Arc::new(move |addr: &Address| self.dispatch(addr).to_string())
    }
}
