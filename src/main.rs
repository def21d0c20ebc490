use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use revproxy::{DEFAULT_CONFIG_TEMPLATE, KeyValue, Server, ServerOptions, context};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long in-flight requests get after a stop signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "revproxy", version, about = "Template-configured reverse proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy server
    Server(ServerArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Bind host
    #[arg(long, env = "REVPROXY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(long, env = "REVPROXY_PORT", default_value_t = 8080)]
    port: u16,

    /// Router template: a file path, or the template text itself
    #[arg(short, long, env = "REVPROXY_TEMPLATE", default_value = "")]
    template: String,

    /// Inbound header forwarded to backends (repeatable)
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Template variable, KEY=VALUE (repeatable, e.g. -v IP=10.16.0.2)
    #[arg(short = 'v', long = "value")]
    values: Vec<String>,

    /// Request body read timeout, seconds
    #[arg(long, default_value_t = 10)]
    http_read_timeout: u64,

    /// Response write timeout, seconds
    #[arg(long, default_value_t = 10)]
    http_write_timeout: u64,

    /// Keep-alive idle timeout, seconds
    #[arg(long, default_value_t = 30)]
    http_idle_timeout: u64,

    /// Request header read timeout, seconds
    #[arg(long, default_value_t = 15)]
    http_read_header_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "revproxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Server(args) => serve(args).await,
    }
}

async fn serve(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let template = load_template(&args.template).inspect_err(|e| {
        tracing::error!(template = %args.template, "failed to load template: {e}");
    })?;

    let mut kv = KeyValue::new();
    for pair in &args.values {
        match context::parse_pair(pair) {
            Some((key, value)) => {
                kv.insert(key, value);
            }
            None => warn!(value = %pair, "ignoring malformed KEY=VALUE"),
        }
    }
    if kv.is_empty() {
        info!("empty kv parameter");
    }

    let opts = ServerOptions::new()
        .listen_addr(join_host_port(&args.host, args.port))
        .allow_headers(args.headers)
        .read_timeout(Duration::from_secs(args.http_read_timeout))
        .write_timeout(Duration::from_secs(args.http_write_timeout))
        .idle_timeout(Duration::from_secs(args.http_idle_timeout))
        .read_header_timeout(Duration::from_secs(args.http_read_header_timeout));

    let server = Arc::new(Server::new(opts));
    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("server stopping...");
        stopper.stop(DRAIN_DEADLINE).await;
    });

    info!("server starting...");
    server.start(&template, kv).await?;
    info!("server stop");
    Ok(())
}

/// An empty value selects the built-in template; a path that exists is read;
/// anything else is taken as the template text.
fn load_template(value: &str) -> std::io::Result<String> {
    if value.is_empty() {
        return Ok(DEFAULT_CONFIG_TEMPLATE.to_owned());
    }
    if !Path::new(value).exists() {
        return Ok(value.to_owned());
    }
    Ok(std::fs::read_to_string(value)?.trim().to_owned())
}

fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Resolves on the first stop signal the process receives.
///
/// On Unix that is SIGINT, SIGTERM, SIGHUP or SIGQUIT. On Windows only
/// Ctrl-C is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let other = async {
        use tokio::signal::unix::{SignalKind, signal};

        let (Ok(mut term), Ok(mut hup), Ok(mut quit)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
            signal(SignalKind::quit()),
        ) else {
            warn!("failed to install signal handlers");
            return std::future::pending::<()>().await;
        };
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
            _ = quit.recv() => "SIGQUIT",
        };
        info!(signal = name, "signal trap");
    };

    #[cfg(not(unix))]
    let other = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!(signal = "SIGINT", "signal trap"),
        () = other => {}
    }
}
