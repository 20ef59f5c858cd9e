use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use reqwest::Url;

use super::{GuardrailEvaluator, GuardrailPolicy, ProposedAction, Violation};

/// Hostnames that always point at the local machine or a cloud metadata service.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
    "metadata",
    "metadata.google.internal",
    "metadata.azure.internal",
    "instance-data",
    "instance-data.ec2.internal",
];

/// Guardrail for API workers.
///
/// Only the literal request target is checked here. Callers that follow
/// redirects or resolve DNS must run [`HttpGuardrail::check_request`] on every
/// hop and [`is_blocked_ip`] on every resolved address.
#[derive(Debug, Clone, Default)]
pub struct HttpGuardrail;

impl HttpGuardrail {
    pub fn new() -> Self {
        Self
    }

    pub fn check_request(
        &self,
        url: &str,
        method: &str,
        policy: &GuardrailPolicy,
    ) -> Option<Violation> {
        let parsed = match Url::parse(url.trim()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Some(
                    Violation::new("http.url", format!("invalid URL: {}", e), url)
                        .with_suggestion("use an absolute http:// or https:// URL"),
                )
            }
        };
        self.check_url(&parsed, method, policy)
    }

    /// Check an already-parsed URL. Used for redirect hops.
    pub fn check_url(&self, url: &Url, method: &str, policy: &GuardrailPolicy) -> Option<Violation> {
        if !matches!(url.scheme(), "http" | "https") {
            return Some(
                Violation::new(
                    "http.scheme",
                    format!("scheme {} is not allowed", url.scheme()),
                    url.as_str(),
                )
                .with_suggestion("use http or https"),
            );
        }

        let Some(raw_host) = url.host_str() else {
            return Some(Violation::new("http.url", "URL has no host", url.as_str()));
        };
        let host = normalize_host(raw_host);

        if let Some(ref domains) = policy.allowed_domains {
            let allowed = domains.iter().any(|d| normalize_host(d) == host);
            if !domains.is_empty() && !allowed {
                return Some(
                    Violation::new(
                        "http.domain",
                        format!("domain {} is not in the allowlist", host),
                        host.clone(),
                    )
                    .with_suggestion(format!("call one of: {}", domains.join(", "))),
                );
            }
        }

        if let Some(ref methods) = policy.allowed_methods {
            let method = method.trim().to_ascii_uppercase();
            let allowed = methods.iter().any(|m| m.trim().eq_ignore_ascii_case(&method));
            if !methods.is_empty() && !allowed {
                return Some(
                    Violation::new(
                        "http.method",
                        format!("method {} is not allowed", method),
                        method.clone(),
                    )
                    .with_suggestion(format!("use one of: {}", methods.join(", "))),
                );
            }
        }

        if policy.block_private_ips.unwrap_or(false) {
            if let Some(v) = check_private_host(&host) {
                return Some(v);
            }
        }

        None
    }
}

impl GuardrailEvaluator for HttpGuardrail {
    fn name(&self) -> &str {
        "http"
    }

    fn evaluate(&self, action: &ProposedAction, policy: &GuardrailPolicy) -> Option<Violation> {
        match action {
            ProposedAction::Http { url, method } => self.check_request(url, method, policy),
            other => Some(Violation::new(
                "guardrail.action",
                "HTTP guardrail cannot evaluate a non-HTTP action",
                other.summary(),
            )),
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn check_private_host(host: &str) -> Option<Violation> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Some(private_address_violation(host, ip));
        }
        return None;
    }
    if is_blocked_hostname(host) {
        return Some(
            Violation::new(
                "http.private_ip",
                format!("host {} resolves to a private or metadata address", host),
                host,
            )
            .with_suggestion("call a public host"),
        );
    }
    None
}

/// Violation for a blocked address. `target` is the host as written, which
/// differs from `ip` when the address came from DNS resolution.
pub fn private_address_violation(target: &str, ip: IpAddr) -> Violation {
    let what = if is_metadata_ip(ip) {
        "cloud metadata"
    } else {
        "private"
    };
    let reason = if target == ip.to_string() {
        format!("{} is a {} address", ip, what)
    } else {
        format!("{} resolves to {} address {}", target, what, ip)
    };
    Violation::new("http.private_ip", reason, ip.to_string()).with_suggestion("call a public host")
}

/// True for well-known local or metadata hostnames, including `*.localhost`.
pub fn is_blocked_hostname(host: &str) -> bool {
    let host = normalize_host(host);
    host.ends_with(".localhost") || BLOCKED_HOSTNAMES.iter().any(|h| *h == host)
}

fn is_metadata_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::new(169, 254, 169, 254),
        IpAddr::V6(v6) => embedded_v4(v6).is_some_and(|v4| is_metadata_ip(IpAddr::V4(v4))),
    }
}

/// True for loopback, RFC1918, link-local (including cloud metadata), CGNAT,
/// unspecified, broadcast and the IPv6 equivalents.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 0.0.0.0/8
        || a == 0
        // 100.64.0.0/10
        || (a == 100 && (b & 0xc0) == 64)
}

/// IPv4 address carried inside an IPv6 one: mapped `::ffff:a.b.c.d`,
/// compatible `::a.b.c.d`, NAT64 `64:ff9b::/96` and 6to4 `2002::/16`.
fn embedded_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let s = ip.segments();
    let low = Ipv4Addr::new((s[6] >> 8) as u8, s[6] as u8, (s[7] >> 8) as u8, s[7] as u8);
    match s {
        [0, 0, 0, 0, 0, 0, ..] => Some(low),
        [0x64, 0xff9b, 0, 0, 0, 0, ..] => Some(low),
        [0x2002, hi, lo, ..] => Some(Ipv4Addr::new(
            (hi >> 8) as u8,
            hi as u8,
            (lo >> 8) as u8,
            lo as u8,
        )),
        _ => None,
    }
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = embedded_v4(ip) {
        return is_blocked_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}
