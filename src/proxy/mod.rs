pub mod connector;
pub mod headers;
pub mod route;

pub use connector::UpstreamConnector;
pub use route::{Route, RouteTable, UpstreamScheme, UpstreamTarget};

use crate::config::Config;
use crate::error::{BoxError, ProxyError};
use crate::server::response::{ErrorResponse, RequestBody, ResponseBody};
use anyhow::Result;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header;
use hyper::{Request, Response, Uri, Version};
use std::net::SocketAddr;
use tokio::time::timeout;

pub struct ProxyHandler {
    routes: RouteTable,
    connector: UpstreamConnector,
}

impl ProxyHandler {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            routes: RouteTable::from_config(config)?,
            connector: UpstreamConnector::new(config.connect_timeout(), config.server.tcp_nodelay),
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn find_route(&self, path: &str) -> Option<&Route> {
        self.routes.find(path)
    }

    /// Forwards `req` to the route's upstream. Upstream failures become
    /// gateway error responses.
    pub async fn proxy_request(
        &self,
        route: &Route,
        req: Request<RequestBody>,
        client_addr: SocketAddr,
    ) -> Response<ResponseBody> {
        match self.forward_request(route, req, client_addr).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    prefix = %route.prefix,
                    upstream = %route.target.authority(),
                    error = %e,
                    cause = ?std::error::Error::source(&e).map(|s| s.to_string()),
                    "Proxy request failed"
                );
                ErrorResponse::for_status(e.status()).build()
            }
        }
    }

    async fn forward_request(
        &self,
        route: &Route,
        req: Request<RequestBody>,
        client_addr: SocketAddr,
    ) -> Result<Response<ResponseBody>, ProxyError> {
        let upstream_req = build_upstream_request(route, req, client_addr)?;

        tracing::debug!(
            method = %upstream_req.method(),
            upstream = %format!("{}://{}{}", route.target.scheme().as_str(), route.target.authority(), upstream_req.uri()),
            "Forwarding request"
        );

        let response = timeout(route.timeout, self.connector.send(route, upstream_req))
            .await
            .map_err(|_| ProxyError::Timeout {
                authority: route.target.authority().to_string(),
                timeout: route.timeout,
            })??;

        Ok(build_downstream_response(response))
    }
}

pub fn build_upstream_request(
    route: &Route,
    req: Request<RequestBody>,
    client_addr: SocketAddr,
) -> Result<Request<RequestBody>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = route.upstream_path_and_query(&parts.uri);
    parts.uri = path_and_query.parse::<Uri>().map_err(http::Error::from)?;
    parts.version = Version::HTTP_11;

    let original_host = parts.headers.get(header::HOST).cloned();

    headers::strip_hop_by_hop(&mut parts.headers);

    if route.xfwd {
        headers::add_forwarded_headers(
            &mut parts.headers,
            &client_addr.ip().to_string(),
            original_host.as_ref(),
        );
    }

    if route.change_origin || original_host.is_none() {
        let host = route.target.host_header().map_err(http::Error::from)?;
        parts.headers.insert(header::HOST, host);
    }

    Ok(Request::from_parts(parts, body))
}

pub fn build_downstream_response(upstream: Response<Incoming>) -> Response<ResponseBody> {
    let (mut parts, body) = upstream.into_parts();
    headers::strip_hop_by_hop(&mut parts.headers);

    Response::from_parts(parts, body.map_err(BoxError::from).boxed_unsync())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyRule;
    use crate::server::response::empty_body;
    use std::time::Duration;

    fn route(rule: ProxyRule) -> Route {
        Route::from_rule(&rule, Duration::from_secs(30)).unwrap()
    }

    fn client() -> SocketAddr {
        "192.168.1.20:53211".parse().unwrap()
    }

    fn incoming(uri: &str) -> Request<RequestBody> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("host", "localhost:3000")
            .header("connection", "keep-alive")
            .header("content-type", "application/json")
            .body(empty_body())
            .unwrap()
    }

    #[test]
    fn test_change_origin_rewrites_host() {
        let mut rule = ProxyRule::new("/api", "http://localhost:8000");
        rule.change_origin = true;

        let req = build_upstream_request(&route(rule), incoming("/api/users"), client()).unwrap();

        assert_eq!(req.method(), "POST");
        assert_eq!(req.uri(), "/api/users");
        assert_eq!(req.headers().get("host").unwrap(), "localhost:8000");
        assert_eq!(req.headers().get("content-type").unwrap(), "application/json");
        assert!(!req.headers().contains_key("connection"));
        assert!(!req.headers().contains_key("x-forwarded-for"));
    }

    #[test]
    fn test_host_kept_without_change_origin() {
        let rule = ProxyRule::new("/api", "http://localhost:8000");
        let req = build_upstream_request(&route(rule), incoming("/api/users"), client()).unwrap();

        assert_eq!(req.headers().get("host").unwrap(), "localhost:3000");
    }

    #[test]
    fn test_missing_host_filled_from_target() {
        let rule = ProxyRule::new("/api", "http://localhost:8000");
        let req = Request::builder()
            .uri("/api/users")
            .version(Version::HTTP_10)
            .body(empty_body())
            .unwrap();

        let req = build_upstream_request(&route(rule), req, client()).unwrap();
        assert_eq!(req.headers().get("host").unwrap(), "localhost:8000");
        assert_eq!(req.version(), Version::HTTP_11);
    }

    #[test]
    fn test_absolute_form_becomes_origin_form() {
        let rule = ProxyRule::new("/api", "http://localhost:8000");
        let req = build_upstream_request(
            &route(rule),
            incoming("http://localhost:3000/api/users?page=1"),
            client(),
        )
        .unwrap();

        assert_eq!(req.uri(), "/api/users?page=1");
    }

    #[test]
    fn test_connection_listing_host_keeps_client_host() {
        let rule = ProxyRule::new("/api", "http://localhost:8000");
        let req = Request::builder()
            .uri("/api/x")
            .header("host", "client.example")
            .header("connection", "host")
            .body(empty_body())
            .unwrap();

        let req = build_upstream_request(&route(rule), req, client()).unwrap();

        assert_eq!(req.headers().get("host").unwrap(), "client.example");
        assert!(!req.headers().contains_key("connection"));
    }

    #[test]
    fn test_xfwd_headers() {
        let mut rule = ProxyRule::new("/api", "http://localhost:8000");
        rule.xfwd = true;
        rule.change_origin = true;

        let req = build_upstream_request(&route(rule), incoming("/api/users"), client()).unwrap();

        assert_eq!(req.headers().get("x-forwarded-for").unwrap(), "192.168.1.20");
        assert_eq!(req.headers().get("x-forwarded-host").unwrap(), "localhost:3000");
        assert_eq!(req.headers().get("host").unwrap(), "localhost:8000");
    }

    #[test]
    fn test_rewrite_applied() {
        let mut rule = ProxyRule::new("/api", "http://localhost:8000");
        rule.rewrite = Some(String::new());

        let req = build_upstream_request(&route(rule), incoming("/api/users?q=a"), client()).unwrap();
        assert_eq!(req.uri(), "/users?q=a");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = Config::default();
        config.proxy = vec![ProxyRule::new("/api", &format!("http://127.0.0.1:{}", port))];
        let handler = ProxyHandler::new(&config).unwrap();

        let route = handler.find_route("/api/users").unwrap().clone();
        let response = handler
            .proxy_request(&route, incoming("/api/users"), client())
            .await;

        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);
    }
}
