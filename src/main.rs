//! Storefront: serving shell for the storefront web application.
//!
//! This is the application entry point. `serve` loads the configuration from a
//! TOML file and runs the supervisor, which re-executes this binary once per
//! worker in the hidden `worker` mode. `dev` runs the single-process
//! development server and `check` validates a configuration file.

use std::error::Error;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use storefront::app::Website;
use storefront::config::{
    LoggingConfig, ServerConfig, DEFAULT_CONFIG_PATH, DEV_HOST, DEV_LOG_FILTER, DEV_PORT,
    LOG_TO_STD_STREAM, WORKER_CONFIG_ENV,
};
use storefront::supervisor::{process, Supervisor};
use storefront::worker::{Worker, EXIT_BOOT_ERROR};
use storefront::{dev, logging};

/// Storefront: pre-fork serving shell for the storefront application
#[derive(Parser, Debug)]
#[command(name = "storefront", version, about)]
struct Args {
    /// Log level filter (e.g., "storefront=debug,tower_http=info")
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor and its worker processes
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override server.bind (host:port)
        #[arg(short, long)]
        bind: Option<String>,

        /// Override server.workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Validate a configuration file and exit
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Run the single-process development server (not for production)
    Dev {
        #[arg(long, default_value = DEV_HOST)]
        host: String,

        #[arg(long, default_value_t = DEV_PORT)]
        port: u16,
    },

    /// Run one worker process; spawned by `serve`
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        worker_id: usize,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Command::Serve {
            config,
            bind,
            workers,
        } => report(serve(config, bind, workers, args.log_level)),
        Command::Check { config } => report(check(config)),
        Command::Dev { host, port } => report(run_dev(&host, port, args.log_level)),
        Command::Worker { worker_id } => run_worker(worker_id, args.log_level),
    }
}

fn report(result: Result<(), Box<dyn Error>>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(
    config_path: PathBuf,
    bind: Option<String>,
    workers: Option<usize>,
    log_level: Option<String>,
) -> Result<(), Box<dyn Error>> {
    // Load configuration
    let config = ServerConfig::load(&config_path)?.with_overrides(bind, workers)?;
    let executable = std::env::current_exe()?;

    // Detach before any runtime thread exists
    process::daemonize(&config.process)?;

    // Initialize tracing with priority: CLI > env > config
    let log_filter = logging::resolve_filter(log_level.clone(), &config.logging);
    logging::init(&config.logging, &log_filter)?;
    tracing::info!(path = %config_path.display(), "Loaded configuration");

    process::apply_umask(&config.process);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(Supervisor::new(config, executable, log_level).run())?;

    Ok(())
}

fn check(config_path: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = ServerConfig::load(&config_path)?;
    println!(
        "{}: OK (bind {}, {} {} workers)",
        config_path.display(),
        config.server.bind,
        config.server.worker_count(),
        config.server.worker_class
    );
    Ok(())
}

fn run_dev(host: &str, port: u16, log_level: Option<String>) -> Result<(), Box<dyn Error>> {
    let logging_config = LoggingConfig {
        accesslog: Some(LOG_TO_STD_STREAM.to_string()),
        ..LoggingConfig::default()
    };
    let log_filter = log_level.unwrap_or_else(|| DEV_LOG_FILTER.to_string());
    logging::init(&logging_config, &log_filter)?;

    let addr: SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or("development server address resolved to nothing")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dev::run(addr, &Website))?;

    Ok(())
}

fn run_worker(worker_id: usize, log_level: Option<String>) -> ExitCode {
    let boot_failure = ExitCode::from(EXIT_BOOT_ERROR as u8);

    let config = match std::env::var(WORKER_CONFIG_ENV) {
        Ok(raw) => match ServerConfig::from_toml_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Worker {worker_id}: {e}");
                return boot_failure;
            }
        },
        Err(e) => {
            eprintln!("Worker {worker_id}: {WORKER_CONFIG_ENV} not usable: {e}");
            return boot_failure;
        }
    };

    let log_filter = logging::resolve_filter(log_level, &config.logging);
    if let Err(e) = logging::init(&config.logging, &log_filter) {
        eprintln!("Worker {worker_id}: {e}");
        return boot_failure;
    }

    match Worker::new(worker_id, config, Website).run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(worker = worker_id, error = %e, "Worker failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
