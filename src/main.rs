use anyhow::Result;
use clap::Parser;
use devproxy::config::{Config, DEFAULT_CONFIG_PATH};
use devproxy::HttpServer;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devproxy")]
#[command(about = "A development HTTP server with CORS and path-prefix reverse proxying")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "DEVPROXY_CONFIG")]
    config: String,

    /// Overrides `server.host`.
    #[arg(long)]
    host: Option<String>,

    /// Overrides `server.port`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Fail when the port is taken instead of trying the next one.
    /// `--strict-port=false` lets the server move to a free port.
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    strict_port: Option<bool>,

    /// Overrides `static_files.root`.
    #[arg(short, long)]
    root: Option<String>,

    #[arg(short = 't', long)]
    test_config: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose)?;

    let mut config = load_config(&args.config)?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    if args.test_config {
        info!("Configuration {} is valid", args.config);
        println!("Configuration test successful");
        return Ok(());
    }

    let server = HttpServer::start(Arc::new(config)).await?;
    server.run().await?;

    Ok(())
}

fn load_config(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        let config = Config::load(path)?;
        info!("Loaded configuration from {}", path);
        Ok(config)
    } else {
        info!("Configuration file {} not found, using defaults", path);
        Ok(Config::default())
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(strict_port) = args.strict_port {
        config.server.strict_port = strict_port;
    }
    if let Some(root) = &args.root {
        config.static_files.root = Some(root.clone());
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "devproxy=debug"
    } else {
        "devproxy=info"
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("devproxy").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_strict_port_flag() {
        assert_eq!(parse(&[]).strict_port, None);
        assert_eq!(parse(&["--strict-port"]).strict_port, Some(true));
        assert_eq!(parse(&["--strict-port=false"]).strict_port, Some(false));
        assert!(Args::try_parse_from(["devproxy", "--strict-port=maybe"]).is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let args = parse(&["--host", "127.0.0.1", "-p", "5173", "--strict-port=false", "-r", "dist"]);
        let mut config = Config::default();

        apply_overrides(&mut config, &args);

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5173);
        assert!(!config.server.strict_port);
        assert_eq!(config.static_files.root.as_deref(), Some("dist"));
    }
}
