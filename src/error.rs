use hyper::StatusCode;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Startup failures of the listening side.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("port {} is already in use on {} and strict_port is set", .addr.port(), .addr.ip())]
    PortInUse { addr: SocketAddr },

    #[error("no free port available on {host} starting from {start}")]
    NoFreePort { host: String, start: u16 },

    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] anyhow::Error),
}

/// Per-request upstream failures. Never fatal to the server.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to connect to upstream {authority}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with upstream {authority} failed")]
    Tls {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TLS server name '{0}'")]
    ServerName(String),

    #[error("upstream {authority} did not respond within {timeout:?}")]
    Timeout { authority: String, timeout: Duration },

    #[error("upstream protocol error")]
    Upstream(#[from] hyper::Error),

    #[error("failed to build upstream request")]
    Request(#[from] http::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_status() {
        let timeout = ProxyError::Timeout {
            authority: "localhost:8000".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let refused = ProxyError::Connect {
            authority: "localhost:8000".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(refused.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::ServerName("bad name".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_port_in_use_message() {
        let err = ServerError::PortInUse {
            addr: "0.0.0.0:3000".parse().unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "port 3000 is already in use on 0.0.0.0 and strict_port is set"
        );
    }
}
