use crate::error::ProxyError;
use crate::proxy::route::{Route, UpstreamScheme};
use crate::server::response::RequestBody;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Opens one upstream connection per forwarded request.
#[derive(Clone)]
pub struct UpstreamConnector {
    verified: TlsConnector,
    unverified: TlsConnector,
    connect_timeout: Duration,
    tcp_nodelay: bool,
}

impl UpstreamConnector {
    pub fn new(connect_timeout: Duration, tcp_nodelay: bool) -> Self {
        Self {
            verified: TlsConnector::from(Arc::new(verified_client_config())),
            unverified: TlsConnector::from(Arc::new(unverified_client_config())),
            connect_timeout,
            tcp_nodelay,
        }
    }

    pub async fn send(
        &self,
        route: &Route,
        req: Request<RequestBody>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let target = &route.target;
        let authority = target.authority().to_string();

        let tcp = timeout(
            self.connect_timeout,
            TcpStream::connect((target.host(), target.port())),
        )
        .await
        .map_err(|_| ProxyError::Timeout {
            authority: authority.clone(),
            timeout: self.connect_timeout,
        })?
        .map_err(|source| ProxyError::Connect {
            authority: authority.clone(),
            source,
        })?;

        if let Err(e) = tcp.set_nodelay(self.tcp_nodelay) {
            debug!(upstream = %authority, error = %e, "Failed to set TCP_NODELAY");
        }

        match target.scheme() {
            UpstreamScheme::Http => send_over(tcp, req).await,
            UpstreamScheme::Https => {
                let server_name = ServerName::try_from(target.host().to_string())
                    .map_err(|_| ProxyError::ServerName(target.host().to_string()))?;

                let connector = if route.secure {
                    &self.verified
                } else {
                    &self.unverified
                };

                let tls = timeout(self.connect_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| ProxyError::Timeout {
                        authority: authority.clone(),
                        timeout: self.connect_timeout,
                    })?
                    .map_err(|source| ProxyError::Tls {
                        authority: authority.clone(),
                        source,
                    })?;

                send_over(tls, req).await
            }
        }
    }
}

async fn send_over<IO>(
    io: IO,
    req: Request<RequestBody>,
) -> Result<Response<Incoming>, ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(io)).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Upstream connection closed with error");
        }
    });

    Ok(sender.send_request(req).await?)
}

fn verified_client_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn unverified_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth()
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: CryptoProvider,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyRule;
    use crate::server::response::empty_body;

    fn route(target: &str) -> Route {
        Route::from_rule(&ProxyRule::new("/api", target), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_client_configs_build() {
        let connector = UpstreamConnector::new(Duration::from_secs(1), true);
        assert_eq!(connector.connect_timeout, Duration::from_secs(1));

        let verifier = AcceptAnyServerCert::new();
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = UpstreamConnector::new(Duration::from_secs(1), true);
        let req = Request::builder()
            .uri("/api/users")
            .body(empty_body())
            .unwrap();

        let err = connector
            .send(&route(&format!("http://127.0.0.1:{}", port)), req)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }));
    }
}
