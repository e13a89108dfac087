pub mod config;
pub mod cors;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;

// Re-export commonly used types for easier testing
pub use config::{Config, ProxyRule};
pub use error::{ProxyError, ServerError};
pub use server::http_server::HttpServer;
pub use server::request_handler::RequestHandler;
pub use server::static_files::LocalContent;
