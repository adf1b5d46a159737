use clap::Parser;
use smu_ctl::command::CommandInterpreter;
use smu_ctl::config::{ConfigLoader, LogFormat, LoggingConfig};
use smu_ctl::console::{self, Console};
use smu_ctl::controller::ConnectionController;
use smu_ctl::error::AppError;
use smu_ctl::instrument::InstrumentLink;
use smu_ctl::port::{self, PortScanner, SerialConnector, SystemEnumerator};
use smu_ctl::recorder::{CsvRecorder, ReadoutSink};
use smu_ctl::signal::StopSignal;
use smu_ctl::state::StateStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "smu-ctl",
    version,
    about = "Control and monitor a serial-attached Source Measure Unit.",
    long_about = "Discovers the instrument on a serial port, polls voltage and current, \
                  reconnects after cable loss and accepts limit/output commands from the console."
)]
struct Args {
    /// Serial port (or configured alias) to connect to at startup.
    #[arg(short, long)]
    port: Option<String>,

    /// Configuration file to use instead of the standard search path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `smu_ctl=trace`. Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("smu-ctl: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    let config = ConfigLoader::load(args.config.as_deref())?.into_config();
    init_tracing(&config.logging, args.log_level.as_deref())?;

    if !port::transport_available() {
        return Err(AppError::NoTransport);
    }

    let store = StateStore::new();
    let stop = StopSignal::new();
    let link = Arc::new(InstrumentLink::new(config.serial.timeout()));
    let scanner = PortScanner::new(Box::new(SystemEnumerator), config.discovery.filter()?);
    let connector = SerialConnector::new(config.serial.port_configuration());
    let recorder: Arc<dyn ReadoutSink> = Arc::new(CsvRecorder::new(&config.logging.data_dir));

    let controller = Arc::new(ConnectionController::new(
        store.clone(),
        Arc::clone(&link),
        scanner,
        Box::new(connector),
        Some(Arc::clone(&recorder)),
        config.controller_config(),
        stop.clone(),
    ));
    controller.start()?;

    let initial_port = args
        .port
        .or_else(|| config.serial.port.clone())
        .map(|name| config.serial.resolve_port(&name));
    if let Some(path) = initial_port {
        if let Err(e) = controller.select(&path) {
            warn!(port = %path, error = %e, "initial connection failed");
            eprintln!("Could not connect to {path}: {e}");
        }
    }

    let (display_tx, display_rx) = mpsc::channel();
    let interpreter = CommandInterpreter::new(
        store.clone(),
        link,
        Some(recorder),
        config.limits.command_limits(),
        stop.clone(),
    )
    .with_display(display_tx);

    // The console thread is detached: a blocked stdin read must not hold up exit.
    {
        let controller = Arc::clone(&controller);
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("smu-console".into())
            .spawn(move || {
                let mut console = Console::new(
                    controller,
                    interpreter,
                    display_rx,
                    std::io::stdin().lock(),
                    std::io::stdout(),
                    stop.clone(),
                );
                if let Err(e) = console.run() {
                    error!(error = %e, "console failed");
                }
                stop.trigger();
            })?;
    }
    let watcher = console::spawn_watcher(store, stop.clone())?;

    shutdown_signal(stop.clone()).await;
    stop.trigger();

    let shutdown = tokio::task::spawn_blocking(move || {
        controller.shutdown();
        if watcher.join().is_err() {
            warn!("watcher thread panicked");
        }
    });
    if let Err(e) = shutdown.await {
        error!(error = %e, "shutdown task failed");
    }
    Ok(())
}

/// Resolves on Ctrl+C, SIGTERM, or when something else triggers `stop`.
async fn shutdown_signal(stop: StopSignal) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let stopped = tokio::task::spawn_blocking(move || {
        while !stop.wait_timeout(Duration::from_millis(250)) {}
    });

    tokio::select! {
        _ = ctrl_c => info!("interrupt received, shutting down"),
        _ = terminate => info!("terminate received, shutting down"),
        _ = stopped => {},
    }
}

/// Install the global subscriber. `--log-level` wins over `RUST_LOG`, which
/// wins over the configured level.
fn init_tracing(logging: &LoggingConfig, cli_level: Option<&str>) -> Result<(), AppError> {
    let filter = match cli_level {
        Some(level) => EnvFilter::try_new(level),
        None => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level)),
    }
    .map_err(|e| smu_ctl::ConfigError::validation("logging.level", e.to_string()))?;

    let file = match &logging.file {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| AppError::LogFile {
                    path: path.clone(),
                    source,
                })?,
        ),
        None => None,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match (logging.format, file) {
        (LogFormat::Pretty, Some(file)) => builder
            .pretty()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        (LogFormat::Pretty, None) => builder.pretty().with_writer(std::io::stderr).init(),
        (LogFormat::Compact, Some(file)) => builder
            .compact()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        (LogFormat::Compact, None) => builder.compact().with_writer(std::io::stderr).init(),
    }
    Ok(())
}
