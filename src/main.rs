use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use texrender::{
    application::{
        compile::{ChildProcessRunner, CompilationPipeline, PipelineConfig, ProcessRunner},
        error::AppError,
    },
    config,
    infra::{
        error::InfraError,
        http::{self, AppState},
        telemetry,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let runner: Arc<dyn ProcessRunner> = Arc::new(ChildProcessRunner);
    let pipeline = CompilationPipeline::new(PipelineConfig::from(&settings), runner)?;

    let max_body_bytes = usize::try_from(settings.server.max_body_bytes.get())
        .map_err(|_| InfraError::configuration("server.max_body_bytes exceeds usize"))?;
    let pipeline = Arc::new(pipeline);
    let state = AppState::new(
        Arc::clone(&pipeline),
        settings.auth.api_key.as_str(),
        max_body_bytes,
    );

    serve_http(&settings, state, pipeline).await
}

async fn serve_http(
    settings: &config::Settings,
    state: AppState,
    pipeline: Arc<CompilationPipeline>,
) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        target = "texrender::serve",
        addr = %settings.server.addr,
        scratch_dir = %settings.compile.scratch_dir.display(),
        latexml = %settings.compile.latexml_path.display(),
        pdflatex = %settings.compile.pdflatex_path.display(),
        "Listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target = "texrender::serve", "Received shutdown signal");
            pipeline.close_admission();
            let _ = shutdown_tx.send(true);
        }
    });

    let mut server_rx = shutdown_rx.clone();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            if server_rx.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let result = tokio::select! {
        served = server => {
            served.map_err(|err| AppError::unexpected(format!("server error: {err}")))
        }
        _ = grace_expired(shutdown_rx, grace) => {
            Err(AppError::unexpected("graceful shutdown timed out"))
        }
    };

    signal_task.abort();
    let _ = signal_task.await;

    info!(target = "texrender::serve", "Server shutdown complete");
    result
}

/// Resolves once `grace` has passed since shutdown was requested.
async fn grace_expired(mut shutdown: watch::Receiver<bool>, grace: Duration) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(grace).await;
}
