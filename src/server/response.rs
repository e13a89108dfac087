use crate::error::BoxError;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Response, StatusCode};
use std::convert::Infallible;

/// Body type shared by proxied, local and generated responses.
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// Request body after it has been erased at the server edge.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes)
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed_unsync()
}

pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed_unsync()
}

pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header_string(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_string(), value));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Response<ResponseBody> {
        let mut response = Response::new(full_body(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            match (
                name.parse::<hyper::header::HeaderName>(),
                value.parse::<hyper::header::HeaderValue>(),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "Dropping invalid response header"),
            }
        }

        response
    }
}

pub struct ErrorResponse;

impl ErrorResponse {
    fn page(status: StatusCode) -> ResponseBuilder {
        let reason = status.canonical_reason().unwrap_or("Error");
        let html = format!(
            "<html><head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1><hr><p>devproxy</p></body></html>\n",
            code = status.as_u16(),
        );

        ResponseBuilder::new(status)
            .header("content-type", "text/html; charset=utf-8")
            .header_string("content-length", html.len().to_string())
            .body(Bytes::from(html))
    }

    pub fn forbidden() -> ResponseBuilder {
        Self::page(StatusCode::FORBIDDEN)
    }

    pub fn not_found() -> ResponseBuilder {
        Self::page(StatusCode::NOT_FOUND)
    }

    pub fn method_not_allowed() -> ResponseBuilder {
        Self::page(StatusCode::METHOD_NOT_ALLOWED).header("allow", "GET, HEAD")
    }

    pub fn internal_server_error() -> ResponseBuilder {
        Self::page(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn bad_gateway() -> ResponseBuilder {
        Self::page(StatusCode::BAD_GATEWAY)
    }

    pub fn gateway_timeout() -> ResponseBuilder {
        Self::page(StatusCode::GATEWAY_TIMEOUT)
    }

    pub fn for_status(status: StatusCode) -> ResponseBuilder {
        match status {
            StatusCode::BAD_GATEWAY => Self::bad_gateway(),
            StatusCode::GATEWAY_TIMEOUT => Self::gateway_timeout(),
            StatusCode::INTERNAL_SERVER_ERROR => Self::internal_server_error(),
            other => Self::page(other),
        }
    }
}
