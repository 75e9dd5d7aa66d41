use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_link::config::{AppConfig, ConfigStore};
use session_link::session::{create_session_controller, SessionController};
use session_link::webrtc::LoggingSink;
use session_link::ConnectionState;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// session-link command line arguments
#[derive(Parser, Debug)]
#[command(name = "session-link")]
#[command(version, about = "Connect to a remotely rendered browser session", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Rendering server base URL (overrides config)
    #[arg(short = 's', long, value_name = "URL")]
    server: Option<String>,

    /// Session to join (overrides config)
    #[arg(long, value_name = "ID")]
    session: Option<String>,

    /// Reconnect attempts before giving up (overrides config)
    #[arg(long, value_name = "N")]
    max_attempts: Option<u32>,

    /// Base reconnect delay in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    base_delay_ms: Option<u64>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl CliArgs {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(server) = &self.server {
            config.session.server_url = server.clone();
        }
        if let Some(session) = &self.session {
            config.session.session_id = session.clone();
        }
        if let Some(max_attempts) = self.max_attempts {
            config.reconnect.max_attempts = max_attempts;
        }
        if let Some(base_delay_ms) = self.base_delay_ms {
            config.reconnect.base_delay_ms = base_delay_ms;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    // Install default crypto provider (required by rustls 0.23+)
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!("Starting session-link v{}", env!("CARGO_PKG_VERSION"));

    let store = match &args.config {
        Some(path) => ConfigStore::load_with(path, |config| args.apply_overrides(config)).await?,
        None => {
            let mut config = AppConfig::default();
            args.apply_overrides(&mut config);
            config.validate()?;
            ConfigStore::from_config(config)
        }
    };
    let sink = Arc::new(LoggingSink::new());
    let mut controller = start_controller((*store.get()).clone(), &sink)?;

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown_signal => {}
        _ = run_commands(&mut controller, &sink, &store, &args, spawn_stdin_reader()) => {}
    }

    controller.disconnect();
    // Give the controller a moment to close the peer and signaling channel
    let mut watch = controller.watch();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        watch.wait_for(|s| s.state == ConnectionState::Disconnected),
    )
    .await;

    tracing::info!("session-link stopped");
    Ok(())
}

/// Create a controller that prints its notifications, and start connecting
fn start_controller(
    config: AppConfig,
    sink: &Arc<LoggingSink>,
) -> session_link::Result<SessionController> {
    let controller = create_session_controller(config)?;
    controller.on_status(|state, message| {
        println!("[{}] {}", state, message);
    });
    controller.on_error(|context, detail| {
        eprintln!("error: {}: {}", context, detail);
    });
    controller.connect(sink.clone());
    Ok(controller)
}

/// Interactive command
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Click(f64, f64),
    Scroll(f64),
    Text(String),
    KeepAlive,
    Connect,
    Disconnect,
    Reload,
    Status,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (name, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        let number = |value: &str| {
            value
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number", value))
        };

        match name {
            "click" => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(x), Some(y), None) => Ok(Command::Click(number(x)?, number(y)?)),
                    _ => Err("usage: click <x> <y>".into()),
                }
            }
            "scroll" if !rest.is_empty() => Ok(Command::Scroll(number(rest)?)),
            "scroll" => Err("usage: scroll <delta>".into()),
            "text" => Ok(Command::Text(rest.to_string())),
            "keepalive" => Ok(Command::KeepAlive),
            "connect" => Ok(Command::Connect),
            "disconnect" => Ok(Command::Disconnect),
            "reload" => Ok(Command::Reload),
            "status" => Ok(Command::Status),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command '{}' (try 'help')", other)),
        }
    }
}

const HELP: &str = "\
commands:
  click <x> <y>     click at page coordinates
  scroll <delta>    scroll vertically
  text <string>     type text
  keepalive         start signaling keepalive
  connect           (re)connect the session
  disconnect        close the session
  reload            re-read the config file and start a new session
  status            show connection state
  quit              disconnect and exit";

/// Forward stdin lines from a plain thread
///
/// A blocking stdin read cannot be cancelled, so it stays off the runtime and
/// never holds up shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Run commands until `quit` or end of input
async fn run_commands(
    controller: &mut SessionController,
    sink: &Arc<LoggingSink>,
    store: &ConfigStore,
    args: &CliArgs,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        match command {
            Command::Click(x, y) => controller.send_click(x, y),
            Command::Scroll(delta) => controller.send_scroll(delta),
            Command::Text(text) => controller.send_text(text),
            Command::KeepAlive => controller.start_keep_alive(),
            Command::Connect => controller.connect(sink.clone()),
            Command::Disconnect => controller.disconnect(),
            Command::Reload => reload(controller, sink, store, args).await,
            Command::Status => {
                let reconnect = controller.reconnect_state();
                println!(
                    "session '{}': {} (attempt {}, next delay {} ms, {} RTP packets)",
                    controller.session_id(),
                    controller.state(),
                    reconnect.attempt,
                    reconnect.next_delay_ms,
                    sink.packets()
                );
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => break,
        }
    }
}

/// Swap in a controller built from the re-read configuration
///
/// The running session is kept when the file is missing or invalid.
async fn reload(
    controller: &mut SessionController,
    sink: &Arc<LoggingSink>,
    store: &ConfigStore,
    args: &CliArgs,
) {
    let config = match store.reload_with(|config| args.apply_overrides(config)).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("reload failed: {}", e);
            return;
        }
    };

    match start_controller((*config).clone(), sink) {
        Ok(next) => {
            controller.disconnect();
            *controller = next;
            tracing::info!("Session restarted with reloaded configuration");
        }
        Err(e) => eprintln!("reload failed: {}", e),
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "session_link=error,webrtc=error",
        LogLevel::Warn => "session_link=warn,webrtc=warn",
        LogLevel::Info => "session_link=info,webrtc=warn",
        LogLevel::Verbose => "session_link=debug,webrtc=warn",
        LogLevel::Debug => "session_link=debug,webrtc=info",
        LogLevel::Trace => "session_link=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
