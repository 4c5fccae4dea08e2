// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use pbs_gestor::{
    log_source::accounting_dir_from_pbs_conf, CheckpointedSink, GestorConfig, GestorError,
    Orchestrator, SqliteStore, SystemClock,
};

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> ExitCode {
    let config = GestorConfig::from_env();
    let log_level = config
        .as_ref()
        .map_or("info", |config| config.log_level.as_str());
    let env_filter = format!("pbs_gestor={log_level},pbs_gestor_daemon={log_level},warn");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    match run(config, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(GestorError::Cancelled) => {
            info!("Interrupted, exiting PBS Gestor");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("PBS Gestor stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: GestorConfig, cancel: &CancellationToken) -> Result<(), GestorError> {
    info!(
        "Starting the PBS Gestor, reporting database {}",
        config.database.display()
    );

    let accounting_dir = match &config.accounting_dir {
        Some(dir) => dir.clone(),
        None => accounting_dir_from_pbs_conf(&config.pbs_conf_file)?,
    };
    info!("Reading accounting logs from {}", accounting_dir.display());

    let mut store = SqliteStore::open(&config.database, config.tables.clone())?;
    store.provision()?;
    info!("Connection to reporting database seems to be successful");

    let sink = CheckpointedSink::new(store, config.retry_strategy());
    let mut orchestrator = Orchestrator::new(
        accounting_dir,
        config.from_date,
        config.till_date,
        sink,
        Arc::new(SystemClock),
        config.source_settings(),
    );
    orchestrator.run(cancel).await
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown requested");
    cancel.cancel();
}
