use crate::config::Config;
use crate::cors::CorsHandler;
use crate::error::BoxError;
use crate::logging::{AccessLogger, LogEntry};
use crate::proxy::ProxyHandler;
use crate::server::response::{ErrorResponse, RequestBody, ResponseBody};
use crate::server::static_files::{LocalContent, StaticFileHandler};
use anyhow::Result;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

pub struct RequestHandler {
    proxy_handler: ProxyHandler,
    cors_handler: CorsHandler,
    local_content: Arc<dyn LocalContent>,
    access_logger: Option<AccessLogger>,
}

impl RequestHandler {
    pub fn new(config: &Config) -> Result<Self> {
        let static_handler = StaticFileHandler::new(&config.static_files);
        Self::with_local_content(config, Arc::new(static_handler))
    }

    pub fn with_local_content(config: &Config, local_content: Arc<dyn LocalContent>) -> Result<Self> {
        Ok(Self {
            proxy_handler: ProxyHandler::new(config)?,
            cors_handler: CorsHandler::new(config)?,
            access_logger: AccessLogger::from_config(&config.logging)?,
            local_content,
        })
    }

    pub fn proxy_handler(&self) -> &ProxyHandler {
        &self.proxy_handler
    }

    pub async fn handle_request<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<ResponseBody>, Infallible>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let request_id = Uuid::new_v4();
        let start_time = std::time::Instant::now();

        let req: Request<RequestBody> = req.map(|body| body.map_err(Into::into).boxed_unsync());

        let method = req.method().clone();
        let uri = req.uri().clone();

        let user_agent = req
            .headers()
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        let referer = req
            .headers()
            .get("referer")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());

        let (response, route) = self.dispatch(req, client_addr).await;
        let response = self.cors_handler.add_cors_headers(response);

        let duration = start_time.elapsed();

        info!(
            request_id = %request_id,
            method = %method,
            path = %uri.path(),
            route = route.as_deref().unwrap_or("-"),
            status = %response.status(),
            duration_ms = duration.as_millis(),
            "Request completed"
        );

        if let Some(ref access_logger) = self.access_logger {
            let response_size = response
                .headers()
                .get("content-length")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse().ok());

            let log_entry = LogEntry {
                request_id,
                remote_addr: client_addr.ip().to_string(),
                method: method.to_string(),
                uri: uri.to_string(),
                status: response.status().as_u16(),
                response_size,
                duration_ms: duration.as_secs_f64() * 1000.0,
                user_agent,
                referer,
                route,
                timestamp: chrono::Utc::now(),
            };

            access_logger.log(log_entry).await;
        }

        Ok(response)
    }

    /// Returns the response and the prefix of the proxy rule that produced it.
    async fn dispatch(
        &self,
        req: Request<RequestBody>,
        client_addr: SocketAddr,
    ) -> (Response<ResponseBody>, Option<String>) {
        if self.cors_handler.is_preflight(&req) {
            debug!(path = %req.uri().path(), "Answering CORS preflight");
            return (self.cors_handler.preflight_response(req.headers()), None);
        }

        if let Some(route) = self.proxy_handler.find_route(req.uri().path()) {
            let prefix = route.prefix.clone();
            let response = self
                .proxy_handler
                .proxy_request(route, req, client_addr)
                .await;
            return (response, Some(prefix));
        }

        let response = match self.local_content.serve(req).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Local content handler failed");
                ErrorResponse::internal_server_error().build()
            }
        };

        (response, None)
    }
}
