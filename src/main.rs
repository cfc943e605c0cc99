use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use ipsecmtu::cli::Args;
use ipsecmtu::config::Config;
use ipsecmtu::export::{export_json, generate_report};
use ipsecmtu::Error;
use ipsecmtu::probe::check_permissions;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let config = Config::from_args(&args)?;
    configure_logging(config.debug);

    // Probes go out through a raw socket even when replaying a capture
    if let Err(e) = check_permissions() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    // Set up cancellation
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let report = match ipsecmtu::analyze(&config, cancel).await {
        Ok(report) => report,
        Err(Error::Interrupted) => std::process::exit(130),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("MTU analysis of {} failed", config.destination_ip));
        }
    };

    if args.json {
        export_json(&report, std::io::stdout())?;
    } else {
        generate_report(&report, std::io::stdout())?;
    }

    Ok(())
}

/// Log to stderr. `RUST_LOG` overrides the level chosen by `--debug`.
fn configure_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
