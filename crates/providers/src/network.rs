//! Outbound hostname allow-list.
//!
//! Every HTTP client built for an LLM vendor or tool server goes through
//! [`guarded_client`]. Requests are checked twice: the URL host before the
//! request is built ([`AllowedHosts::check_url`], which also covers IP
//! literals that never reach DNS) and every DNS lookup through
//! [`GuardedResolver`].

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tm_domain::error::{Error, Result};

/// Resolver error raised for a host outside the allow-list.
#[derive(Debug, thiserror::Error)]
#[error("upstream host {0} is not on allowed list")]
pub struct HostBlocked(pub String);

/// Find a [`HostBlocked`] anywhere in an error's source chain.
pub(crate) fn blocked_host_in(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(blocked) = e.downcast_ref::<HostBlocked>() {
            return Some(blocked.0.clone());
        }
        cur = e.source();
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Allow-list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Patterns are exact hostnames, `*.suffix`, or `*`.
#[derive(Debug, Clone, Default)]
pub struct AllowedHosts {
    patterns: Vec<String>,
}

impl AllowedHosts {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn allow_all() -> Self {
        Self::new(["*"])
    }

    pub fn permits(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.patterns.iter().any(|p| {
            if p == "*" || *p == host {
                return true;
            }
            match p.strip_prefix("*.") {
                // A zone id (`fe80::1%eth0`) never matches a wildcard.
                Some(suffix) => {
                    !host.contains('%')
                        && host.len() > suffix.len() + 1
                        && host.ends_with(suffix)
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                }
                None => false,
            }
        })
    }

    /// Parse `url` and refuse it unless it is http(s) to a permitted host.
    pub fn check_url(&self, url: &str) -> Result<reqwest::Url> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid upstream URL {url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "upstream URL {url:?} must be http or https"
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Config(format!("upstream URL {url:?} has no host")))?;
        if !self.permits(host) {
            tracing::warn!(host = %host, "blocked request to host outside allow-list");
            return Err(Error::HostNotAllowed {
                host: normalize_host(host),
            });
        }
        Ok(parsed)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DNS guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Refuses to resolve names outside the allow-list.
pub struct GuardedResolver {
    allow: Arc<AllowedHosts>,
}

impl GuardedResolver {
    pub fn new(allow: Arc<AllowedHosts>) -> Self {
        Self { allow }
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let allow = self.allow.clone();
        let hostname = name.as_str().to_string();

        Box::pin(async move {
            if !allow.permits(&hostname) {
                tracing::warn!(host = %hostname, "blocked DNS lookup outside allow-list");
                let err: Box<dyn std::error::Error + Send + Sync> =
                    Box::new(HostBlocked(hostname));
                return Err(err);
            }
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host(format!("{hostname}:0"))
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?
                .collect();
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}

/// HTTP client whose name resolution is restricted to `allow`.
///
/// No overall request timeout is set: streamed bodies may legitimately run
/// for minutes. Inactivity is policed by the stream pump instead.
pub fn guarded_client(allow: Arc<AllowedHosts>) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .dns_resolver(Arc::new(GuardedResolver::new(allow)))
        .build()
        .map_err(|e| Error::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let allow = AllowedHosts::new(["api.openai.com"]);
        assert!(allow.permits("api.openai.com"));
        assert!(allow.permits("API.OpenAI.com"));
        assert!(!allow.permits("evil.example"));
        assert!(!allow.permits("openai.com"));
    }

    #[test]
    fn suffix_wildcard() {
        let allow = AllowedHosts::new(["*.anthropic.com"]);
        assert!(allow.permits("api.anthropic.com"));
        assert!(allow.permits("a.b.anthropic.com"));
        assert!(!allow.permits("anthropic.com"));
        assert!(!allow.permits("evilanthropic.com"));
    }

    #[test]
    fn zone_ids_never_match_wildcards() {
        let allow = AllowedHosts::new(["*.local"]);
        assert!(!allow.permits("fe80::1%eth0.local"));
    }

    #[test]
    fn global_wildcard() {
        let allow = AllowedHosts::allow_all();
        assert!(allow.permits("anything.example"));
        assert!(allow.permits("fe80::1%eth0"));
    }

    #[test]
    fn empty_list_blocks_everything() {
        assert!(!AllowedHosts::default().permits("api.openai.com"));
    }

    #[test]
    fn check_url_rejects_blocked_host() {
        let allow = AllowedHosts::new(["api.openai.com"]);
        let err = allow.check_url("https://evil.example/v1").unwrap_err();
        assert!(err.to_string().contains("not on allowed list"));
        assert!(allow.check_url("https://api.openai.com/v1").is_ok());
    }

    #[test]
    fn check_url_covers_ip_literals() {
        let allow = AllowedHosts::new(["api.openai.com"]);
        assert!(allow.check_url("http://169.254.169.254/latest").is_err());
        let allow = AllowedHosts::new(["::1"]);
        assert!(allow.check_url("http://[::1]:8080/").is_ok());
    }

    #[test]
    fn check_url_rejects_other_schemes() {
        let allow = AllowedHosts::allow_all();
        assert!(matches!(
            allow.check_url("file:///etc/passwd"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn blocked_host_found_in_chain() {
        let err = HostBlocked("evil.example".into());
        assert_eq!(blocked_host_in(&err).as_deref(), Some("evil.example"));
    }
}
