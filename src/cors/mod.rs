use crate::config::Config;
use crate::server::response::{ResponseBody, ResponseBuilder};
use anyhow::{Context, Result};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};


/// Permissive cross-origin policy applied to every response when enabled.
pub struct CorsHandler {
    enabled: bool,
    allow_origin: HeaderValue,
    allow_methods: HeaderValue,
    expose_headers: Option<HeaderValue>,
    max_age: Option<HeaderValue>,
}

impl CorsHandler {
    pub fn new(config: &Config) -> Result<Self> {
        let cors = &config.cors;

        let allow_origin = HeaderValue::from_str(&cors.allow_origin)
            .with_context(|| format!("Invalid CORS allow_origin: {}", cors.allow_origin))?;
        let allow_methods = HeaderValue::from_str(&cors.allow_methods.join(","))
            .context("Invalid CORS allow_methods")?;
        let expose_headers = cors
            .expose_headers
            .as_ref()
            .filter(|headers| !headers.is_empty())
            .map(|headers| HeaderValue::from_str(&headers.join(",")))
            .transpose()
            .context("Invalid CORS expose_headers")?;
        let max_age = cors.max_age.map(HeaderValue::from);

        if config.server.cors {
            tracing::info!(origin = %cors.allow_origin, "CORS enabled");
        } else {
            tracing::info!("CORS disabled");
        }

        Ok(Self {
            enabled: config.server.cors,
            allow_origin,
            allow_methods,
            expose_headers,
            max_age,
        })
    }

    pub fn is_preflight<B>(&self, req: &Request<B>) -> bool {
        self.enabled
            && req.method() == Method::OPTIONS
            && req.headers().contains_key(header::ORIGIN)
            && req
                .headers()
                .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
    }

    /// Answers a preflight locally; the request is never forwarded.
    pub fn preflight_response(&self, request_headers: &HeaderMap) -> Response<ResponseBody> {
        let mut response = ResponseBuilder::new(StatusCode::NO_CONTENT)
            .header("content-length", "0")
            .build();

        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            self.allow_methods.clone(),
        );

        if let Some(requested) = request_headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
            append_vary(headers, "Access-Control-Request-Headers");
        }

        if let Some(max_age) = &self.max_age {
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, max_age.clone());
        }

        if !self.is_wildcard() {
            append_vary(headers, "Origin");
        }

        response
    }

    /// Adds the policy headers unless the upstream already set its own.
    pub fn add_cors_headers(&self, mut response: Response<ResponseBody>) -> Response<ResponseBody> {
        if !self.enabled {
            return response;
        }

        let headers = response.headers_mut();

        if !headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
            if !self.is_wildcard() {
                append_vary(headers, "Origin");
            }
        }

        if let Some(expose) = &self.expose_headers {
            if !headers.contains_key(header::ACCESS_CONTROL_EXPOSE_HEADERS) {
                headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, expose.clone());
            }
        }

        response
    }

    fn is_wildcard(&self) -> bool {
        self.allow_origin.as_bytes() == b"*"
    }
}

fn append_vary(headers: &mut HeaderMap, value: &'static str) {
    let already_listed = headers.get_all(header::VARY).iter().any(|existing| {
        existing
            .to_str()
            .map(|v| {
                v.split(',')
                    .any(|item| item.trim().eq_ignore_ascii_case(value) || item.trim() == "*")
            })
            .unwrap_or(false)
    });

    if !already_listed {
        headers.append(header::VARY, HeaderValue::from_static(value));
    }
}
