// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use node_collector::{
    config::Config,
    errors::PipelineError,
    http_intake::{self, HttpIntake},
    pipeline::Pipeline,
    stream_intake::{self, StreamIntake},
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("COLLECTOR_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

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

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on node collector startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Node collector stopped: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), PipelineError> {
    let pipeline = Pipeline::start(&config)?;
    let cancel = pipeline.intake_cancellation();

    let http_listener = http_intake::bind(&config.host, config.http_port).await?;
    let stream_listener = stream_intake::bind(&config.host, config.stream_port).await?;

    let http_server: JoinHandle<Result<(), PipelineError>> = tokio::spawn(http_intake::serve(
        http_listener,
        HttpIntake::new(&config, pipeline.intake(), pipeline.health()),
        cancel.clone(),
    ));
    let stream_server: JoinHandle<Result<(), PipelineError>> = tokio::spawn(stream_intake::serve(
        stream_listener,
        StreamIntake::new(&config, pipeline.intake()),
        cancel.clone(),
    ));

    info!(
        "Node collector {} accepting on {}:{} (http) and {}:{} (stream)",
        config.service_name, config.host, config.http_port, config.host, config.stream_port
    );

    wait_for_termination().await;

    let report = pipeline.shutdown(config.shutdown_deadline).await;
    for (name, server) in [("HTTP", http_server), ("stream", stream_server)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{name} intake failed: {e}"),
            Err(e) => error!("{name} intake task failed: {e}"),
        }
    }

    if report.timed_out {
        error!(
            "Shutdown deadline expired with {} records lost",
            report.lost_records
        );
    }
    Ok(())
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => error!("Unable to listen for SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }
    info!("Received interrupt");
}
