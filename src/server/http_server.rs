use crate::config::Config;
use crate::error::ServerError;
use crate::server::request_handler::RequestHandler;
use crate::server::static_files::LocalContent;
use anyhow::Result;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// The dispatcher: a bound listener plus the per-request handler.
pub struct HttpServer {
    config: Arc<Config>,
    handler: Arc<RequestHandler>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl HttpServer {
    /// Binds the listening socket. With `strict_port` an occupied port is an
    /// error; otherwise the next free port is used.
    pub async fn start(config: Arc<Config>) -> Result<Self, ServerError> {
        let handler = RequestHandler::new(&config)?;
        Self::start_with_handler(config, handler).await
    }

    pub async fn start_with_content(
        config: Arc<Config>,
        local_content: Arc<dyn LocalContent>,
    ) -> Result<Self, ServerError> {
        let handler = RequestHandler::with_local_content(&config, local_content)?;
        Self::start_with_handler(config, handler).await
    }

    async fn start_with_handler(
        config: Arc<Config>,
        handler: RequestHandler,
    ) -> Result<Self, ServerError> {
        let requested = config.listen_address()?;
        let listener = bind_listener(&config).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                addr: requested,
                source,
            })?;

        info!(
            addr = %local_addr,
            routes = handler.proxy_handler().routes().len(),
            cors = config.server.cors,
            "Listening on http://{}",
            local_addr
        );

        Ok(Self {
            config,
            handler: Arc::new(handler),
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until SIGTERM, SIGINT or SIGQUIT.
    pub async fn run(self) -> Result<()> {
        self.serve_until(wait_for_signal()).await
    }

    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let handler = self.handler.clone();
                    let tcp_nodelay = self.config.server.tcp_nodelay;

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, handler, tcp_nodelay).await {
                            debug!("Connection error from {}: {}", addr, e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal, stopping server");
                    break;
                }
            }
        }

        info!("Server stopped");
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<RequestHandler>,
        tcp_nodelay: bool,
    ) -> Result<()> {
        stream.set_nodelay(tcp_nodelay)?;

        let io = TokioIo::new(stream);
        let service = hyper::service::service_fn(move |req| {
            let handler = handler.clone();
            async move { handler.handle_request(req, addr).await }
        });

        http1::Builder::new()
            .keep_alive(true)
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("HTTP connection error: {}", e))?;

        Ok(())
    }
}

async fn bind_listener(config: &Config) -> Result<TcpListener, ServerError> {
    let addr = config.listen_address()?;
    let mut port = addr.port();

    loop {
        let candidate = SocketAddr::new(addr.ip(), port);

        match TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                if config.server.strict_port {
                    return Err(ServerError::PortInUse { addr: candidate });
                }
                if port == u16::MAX {
                    return Err(ServerError::NoFreePort {
                        host: config.server.host.clone(),
                        start: addr.port(),
                    });
                }
                warn!("Port {} is in use, trying another one", port);
                port += 1;
            }
            Err(source) => {
                return Err(ServerError::Bind {
                    addr: candidate,
                    source,
                })
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use futures::stream::StreamExt;
        use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
        use signal_hook_tokio::Signals;

        match Signals::new([SIGTERM, SIGINT, SIGQUIT]) {
            Ok(mut signals) => {
                if let Some(signal) = signals.next().await {
                    info!("Received signal {}, initiating graceful shutdown", signal);
                }
                return;
            }
            Err(e) => {
                error!("Failed to register signal handlers: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C, initiating graceful shutdown");
}
