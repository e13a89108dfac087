use crate::config::{Config, ProxyRule};
use anyhow::{Context, Result};
use hyper::header::{HeaderValue, InvalidHeaderValue};
use hyper::Uri;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Https,
}

impl UpstreamScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            UpstreamScheme::Http => 80,
            UpstreamScheme::Https => 443,
        }
    }
}

/// A parsed `scheme://host[:port]` proxy target.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    scheme: UpstreamScheme,
    authority: String,
    host: String,
    port: u16,
}

impl UpstreamTarget {
    pub fn parse(target: &str) -> Result<Self> {
        let uri: Uri = target
            .parse()
            .with_context(|| format!("Invalid proxy target: {}", target))?;

        let scheme = match uri.scheme_str() {
            Some("http") => UpstreamScheme::Http,
            Some("https") => UpstreamScheme::Https,
            _ => return Err(anyhow::anyhow!("Proxy target '{}' must use http or https", target)),
        };

        let authority = uri
            .authority()
            .ok_or_else(|| anyhow::anyhow!("Proxy target '{}' has no host", target))?;

        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            scheme,
            authority: authority.as_str().to_string(),
            port: authority.port_u16().unwrap_or_else(|| scheme.default_port()),
            host,
        })
    }

    pub fn scheme(&self) -> UpstreamScheme {
        self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value of the `Host` header when the origin is rewritten.
    pub fn host_header(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&self.authority)
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub target: UpstreamTarget,
    pub change_origin: bool,
    pub secure: bool,
    pub rewrite: Option<String>,
    pub xfwd: bool,
    pub timeout: Duration,
}

impl Route {
    pub fn from_rule(rule: &ProxyRule, default_timeout: Duration) -> Result<Self> {
        rule.validate()?;

        Ok(Self {
            prefix: rule.path_prefix.clone(),
            target: UpstreamTarget::parse(&rule.target)?,
            change_origin: rule.change_origin,
            secure: rule.secure,
            rewrite: rule.rewrite.clone(),
            xfwd: rule.xfwd,
            timeout: rule
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(self.prefix.as_str())
    }

    /// Origin-form target for the upstream request, with the prefix rewritten
    /// when configured. The query string is always kept.
    pub fn upstream_path_and_query(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

        let Some(replacement) = &self.rewrite else {
            return path_and_query.to_string();
        };

        let rest = path_and_query
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(path_and_query);
        let rewritten = format!("{}{}", replacement, rest);

        if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{}", rewritten)
        }
    }
}

/// Proxy rules compiled once at startup, kept in configured order.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_config(config: &Config) -> Result<Self> {
        let routes = config
            .proxy
            .iter()
            .map(|rule| Route::from_rule(rule, config.proxy_timeout()))
            .collect::<Result<Vec<_>>>()?;

        for route in &routes {
            info!(
                prefix = %route.prefix,
                target = %route.target.authority(),
                scheme = route.target.scheme().as_str(),
                change_origin = route.change_origin,
                "Proxy rule registered"
            );

            if !route.secure {
                warn!(
                    prefix = %route.prefix,
                    target = %route.target.authority(),
                    "Upstream TLS certificate verification is disabled for this rule (secure = false); any certificate will be accepted"
                );
            }
        }

        Ok(Self { routes })
    }

    /// First match wins, in configured order.
    pub fn find(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rules: Vec<ProxyRule>) -> RouteTable {
        let mut config = Config::default();
        config.proxy = rules;
        RouteTable::from_config(&config).unwrap()
    }

    #[test]
    fn test_parse_target() {
        let target = UpstreamTarget::parse("http://localhost:8000").unwrap();
        assert_eq!(target.scheme(), UpstreamScheme::Http);
        assert_eq!(target.authority(), "localhost:8000");
        assert_eq!(target.host(), "localhost");
        assert_eq!(target.port(), 8000);
        assert_eq!(target.host_header().unwrap(), "localhost:8000");
    }

    #[test]
    fn test_parse_target_default_ports() {
        let http = UpstreamTarget::parse("http://backend").unwrap();
        assert_eq!(http.port(), 80);
        assert_eq!(http.host_header().unwrap(), "backend");

        let https = UpstreamTarget::parse("https://backend").unwrap();
        assert_eq!(https.scheme(), UpstreamScheme::Https);
        assert_eq!(https.port(), 443);
    }

    #[test]
    fn test_parse_target_ipv6() {
        let target = UpstreamTarget::parse("http://[::1]:8000").unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.authority(), "[::1]:8000");
    }

    #[test]
    fn test_parse_target_rejects_other_schemes() {
        assert!(UpstreamTarget::parse("ws://localhost:8000").is_err());
        assert!(UpstreamTarget::parse("/relative").is_err());
    }

    #[test]
    fn test_first_match_wins() {
        let table = table(vec![
            ProxyRule::new("/api/admin", "http://localhost:9000"),
            ProxyRule::new("/api", "http://localhost:8000"),
        ]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.find("/api/admin/users").unwrap().target.port(), 9000);
        assert_eq!(table.find("/api/users").unwrap().target.port(), 8000);
        assert!(table.find("/favicon.ico").is_none());
        assert!(table.find("/").is_none());
    }

    #[test]
    fn test_configured_order_beats_specificity() {
        let table = table(vec![
            ProxyRule::new("/api", "http://localhost:8000"),
            ProxyRule::new("/api/admin", "http://localhost:9000"),
        ]);

        assert_eq!(table.find("/api/admin/users").unwrap().target.port(), 8000);
    }

    #[test]
    fn test_prefix_is_plain_string_prefix() {
        let table = table(vec![ProxyRule::new("/api", "http://localhost:8000")]);
        assert!(table.find("/api").is_some());
        assert!(table.find("/apiary").is_some());
        assert!(table.find("/v1/api").is_none());
    }

    #[test]
    fn test_empty_table() {
        let table = table(vec![]);
        assert!(table.is_empty());
        assert!(table.find("/api/users").is_none());
    }

    #[test]
    fn test_path_kept_without_rewrite() {
        let route = Route::from_rule(
            &ProxyRule::new("/api", "http://localhost:8000"),
            Duration::from_secs(30),
        )
        .unwrap();

        let uri: Uri = "/api/users?page=2".parse().unwrap();
        assert_eq!(route.upstream_path_and_query(&uri), "/api/users?page=2");
    }

    #[test]
    fn test_path_rewrite() {
        let mut rule = ProxyRule::new("/api", "http://localhost:8000");
        rule.rewrite = Some(String::new());
        let route = Route::from_rule(&rule, Duration::from_secs(30)).unwrap();

        let uri: Uri = "/api/users?page=2".parse().unwrap();
        assert_eq!(route.upstream_path_and_query(&uri), "/users?page=2");

        let uri: Uri = "/api".parse().unwrap();
        assert_eq!(route.upstream_path_and_query(&uri), "/");

        let uri: Uri = "/api?x=1".parse().unwrap();
        assert_eq!(route.upstream_path_and_query(&uri), "/?x=1");

        rule.rewrite = Some("/v2".to_string());
        let route = Route::from_rule(&rule, Duration::from_secs(30)).unwrap();
        let uri: Uri = "/api/users".parse().unwrap();
        assert_eq!(route.upstream_path_and_query(&uri), "/v2/users");
    }

    #[test]
    fn test_route_timeout() {
        let mut rule = ProxyRule::new("/api", "http://localhost:8000");
        let route = Route::from_rule(&rule, Duration::from_secs(30)).unwrap();
        assert_eq!(route.timeout, Duration::from_secs(30));

        rule.timeout = Some(2);
        let route = Route::from_rule(&rule, Duration::from_secs(30)).unwrap();
        assert_eq!(route.timeout, Duration::from_secs(2));
    }
}
