use renderferry::backend::HttpBackend;
use renderferry::config::Config;
use renderferry::humanize::human_duration;
use renderferry::orchestrator::Orchestrator;
use renderferry::transfer::{FetchConfig, HttpFetcher};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::cli::{ConfigArgs, DownloadArgs};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Exit code after a second interrupt, as a shell reports SIGINT
const KILLED_EXIT_CODE: u8 = 130;

pub async fn run(args: DownloadArgs) -> Result<ExitCode, AnyError> {
    let started = Instant::now();

    let mut config = Config::load(args.config.clone())?;
    args.apply(&mut config);
    config.validate()?;

    let backend = Arc::new(HttpBackend::from_config(&config.backend)?);
    let fetcher = Arc::new(HttpFetcher::new(FetchConfig {
        connect_timeout: config.backend.connect_timeout(),
        read_timeout: config.backend.request_timeout(),
        ..FetchConfig::default()
    })?);

    let mut handle = Orchestrator::new(config, backend, fetcher)
        .start(args.mode())
        .await?;
    info!(run_id = %handle.run_id(), "Press Ctrl+C to stop");

    let interrupted = tokio::select! {
        _ = shutdown_signal() => true,
        _ = handle.wait() => false,
    };
    if interrupted {
        info!("Finishing in-flight items, interrupt again to exit immediately");
    }

    let kill_switch = handle.kill_switch();
    tokio::select! {
        _ = handle.shutdown() => Ok(ExitCode::SUCCESS),
        _ = shutdown_signal() => {
            kill_switch.kill();
            warn!(uptime = %human_duration(started.elapsed()), "Exiting without draining");
            Ok(ExitCode::from(KILLED_EXIT_CODE))
        }
    }
}

/// Secrets are never printed: the API key is not serialized and a static
/// token is masked
pub fn show_config(args: ConfigArgs) -> Result<ExitCode, AnyError> {
    let mut config = Config::load(args.config)?;
    if config.backend.token.is_some() {
        config.backend.token = Some("<redacted>".to_string());
    }
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
    info!("Shutdown signal received");
}
