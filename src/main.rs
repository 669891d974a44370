use std::{path::Path, process};

use clap::Parser;
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kraken_std::{
    cli::Cli,
    error::Result,
    execution::{RunOptions, TaskRunner},
    task::{list_tasks, load_project},
    util::parse_timeout,
};

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_logging(args.verbose);

    match run_kraken(args).await {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// The first signal asks the runner to stop and tear down; a second one exits immediately.
fn listen_for_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Interrupted, cleaning up (interrupt again to exit immediately)");
        let _ = tx.send(true);
        shutdown_signal().await;
        process::exit(130);
    });
    rx
}

/// The process exit code.
async fn run_kraken(args: Cli) -> Result<i32> {
    let loaded = load_project(Path::new(&args.file)).await?;
    let project = loaded.project;

    if args.list {
        for line in list_tasks(&project) {
            println!("{}", line);
        }
        return Ok(0);
    }

    let options = RunOptions {
        output: args.output.unwrap_or_default(),
        timeout: parse_timeout(args.timeout.as_deref(), loaded.default_timeout.as_deref()),
        dry_run: args.dry_run,
        verbose: args.verbose,
    };
    let summary = TaskRunner::new(&project, options)
        .with_shutdown(listen_for_shutdown())
        .run(&args.targets)
        .await?;

    if summary.interrupted {
        eprintln!("Build interrupted");
        return Ok(130);
    }
    if !summary.is_success() {
        eprintln!("Failed tasks: {}", summary.failed().join(", "));
        return Ok(1);
    }
    Ok(0)
}
