use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ssrelay::crypto::Method;
use ssrelay::eventloop::StopHandle;
use ssrelay::relay::Mode;
use ssrelay::{Config, Proxy, Stats};

#[derive(Parser)]
#[command(name = "ssrelay")]
#[command(about = "Encrypting SOCKS5 TCP/UDP relay", long_about = None)]
struct Args {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run as the SOCKS5 side (local) or the relay server (server)
    #[arg(short, long)]
    mode: Option<Mode>,

    /// Relay server host
    #[arg(short, long)]
    server: Option<String>,

    /// Relay server port
    #[arg(short = 'p', long)]
    server_port: Option<u16>,

    /// Local SOCKS5 bind address
    #[arg(short = 'b', long)]
    local_address: Option<String>,

    /// Local SOCKS5 port
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    /// Shared password
    #[arg(short = 'k', long)]
    password: Option<String>,

    /// Cipher method (none, chacha20-ietf-poly1305)
    #[arg(short = 'e', long)]
    method: Option<Method>,

    /// Idle session timeout in seconds
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Poller backend (auto, epoll, kqueue, ...)
    #[arg(long)]
    poller: Option<String>,

    /// Disable the UDP relay
    #[arg(long)]
    no_udp: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Shorthand for --log-level warn
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn into_config(self) -> ssrelay::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(server) = self.server {
            config.server = Some(server);
        }
        if let Some(port) = self.server_port {
            config.server_port = port;
        }
        if let Some(address) = self.local_address {
            config.local_address = address;
        }
        if let Some(port) = self.local_port {
            config.local_port = port;
        }
        if let Some(password) = self.password {
            config.password = password;
        }
        if let Some(method) = self.method {
            config.method = method;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = std::time::Duration::try_from_secs_f64(timeout)
                .map_err(|e| ssrelay::Error::config(format!("timeout: {e}")))?;
        }
        if let Some(poller) = self.poller {
            config.poller = poller;
        }
        if self.no_udp {
            config.udp = false;
        }
        Ok(config)
    }
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        args.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

/// First signal drains gracefully, a second one stops at once.
fn spawn_signal_thread(handle: StopHandle) -> std::io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            rt.block_on(async move {
                if let Err(e) = wait_for_signal().await {
                    warn!(error = %e, "signal handling unavailable");
                    return;
                }
                info!("shutting down, signal again to force");
                handle.shutdown();
                if wait_for_signal().await.is_ok() {
                    warn!("forced stop");
                    handle.stop();
                }
            })
        })?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let proxy = match Proxy::bind(&config, Arc::new(Stats::new())) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = spawn_signal_thread(proxy.stop_handle()) {
        warn!(error = %e, "cannot install signal handlers");
    }

    match proxy.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "relay failed");
            ExitCode::FAILURE
        }
    }
}
