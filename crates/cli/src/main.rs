use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand, ValueEnum},
    gatelink_config::GatelinkConfig,
    secrecy::Secret,
    tracing_subscriber::EnvFilter,
};

mod commands;

/// Talk to a gateway over its WebSocket protocol.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Config file (default: discovered `gatelink.{toml,yaml,json}`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Gateway WebSocket URL.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Shared gateway token.
    #[arg(long, global = true, env = "GATELINK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address.
    #[cfg(feature = "prometheus")]
    #[arg(long, global = true)]
    metrics_addr: Option<std::net::SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request and print its payload.
    Call {
        method: String,
        /// Request params as a JSON document.
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Extra attempts on retryable failures.
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Print events and connection changes as JSON lines.
    Watch {
        /// Only these events (repeatable). Default: everything.
        #[arg(long = "event")]
        events: Vec<String>,
    },
    /// Follow live cost, state and checkpoint metrics of one thread.
    Metrics { thread_id: String },
    /// Probe the gateway's health endpoint.
    Health {
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> Result<GatelinkConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = gatelink_config::load_from_path(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            gatelink_config::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
            config
        },
        None => gatelink_config::discover_and_load(),
    };
    if let Some(url) = &cli.url {
        config.gateway.url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.auth.token = Some(Secret::new(token.clone()));
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_format);
    let config = load_config(&cli)?;

    #[cfg(feature = "prometheus")]
    if let Some(addr) = cli.metrics_addr {
        gatelink_metrics::install_prometheus(addr)?;
    }

    match cli.command {
        Command::Call {
            method,
            params,
            timeout_ms,
            retries,
        } => commands::call(&config, &method, params.as_deref(), timeout_ms, retries).await,
        Command::Watch { events } => commands::watch(&config, &events).await,
        Command::Metrics { thread_id } => commands::metrics(&config, &thread_id).await,
        Command::Health { timeout_ms } => commands::health(&config, timeout_ms).await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, clap::CommandFactory, std::io::Write};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_call_with_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "gatelink",
            "call",
            "agents.list",
            "--params",
            "{}",
            "--retries",
            "2",
            "--url",
            "ws://gw:1",
        ])
        .unwrap();
        assert_eq!(cli.url.as_deref(), Some("ws://gw:1"));
        match cli.command {
            Command::Call {
                method, retries, ..
            } => {
                assert_eq!(method, "agents.list");
                assert_eq!(retries, 2);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn watch_accepts_repeated_events() {
        let cli =
            Cli::try_parse_from(["gatelink", "watch", "--event", "presence", "--event", "tick"])
                .unwrap();
        match cli.command {
            Command::Watch { events } => assert_eq!(events, vec!["presence", "tick"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[gateway]\nurl = \"ws://from-file:1\"").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let cli = Cli::try_parse_from(["gatelink", "--config", &path, "health"]).unwrap();
        assert_eq!(load_config(&cli).unwrap().gateway.url, "ws://from-file:1");

        let cli = Cli::try_parse_from([
            "gatelink",
            "--config",
            &path,
            "--url",
            "ws://flag:2",
            "health",
        ])
        .unwrap();
        assert_eq!(load_config(&cli).unwrap().gateway.url, "ws://flag:2");
    }
}
