use anyhow::{anyhow, Error};
use clap::Parser;

use std::env;
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use filejobs::config::{Command, ConfigContext, EnqueueCommand, RunArgs};
use filejobs::db::DbHandle;
use filejobs::email::WelcomeEmailProcessor;
use filejobs::gateway::DataGateway;
use filejobs::mail::{LogMailer, Mailer, OutboxMailer};
use filejobs::processor::Registry;
use filejobs::queue::JobStore;
use filejobs::server;
use filejobs::thumbnail::{ImageThumbnailer, ThumbnailProcessor};
use filejobs::{telemetry, JobRequest, EMAIL_QUEUE, THUMBNAIL_QUEUE};

/// Wires the queue, gateway and mailer into the processors and serves until cancelled.
#[instrument(skip_all)]
async fn run(
    cancel_token: CancellationToken,
    connect_url: String,
    args: RunArgs,
) -> Result<(), Error> {
    let server_config = args.server_config();
    debug!("Connecting to db:{}", connect_url);
    let handle = DbHandle::new(&connect_url, server_config.retry.max_attempts).await?;

    let gateway: Arc<dyn DataGateway> = Arc::new(handle.clone());
    let mailer: Arc<dyn Mailer> = match &args.mail_outbox {
        Some(dir) => Arc::new(OutboxMailer::new(&args.mail_from, dir)),
        None => Arc::new(LogMailer::new(&args.mail_from)),
    };

    let mut registry = Registry::new();
    registry.register_processor(
        THUMBNAIL_QUEUE,
        Arc::new(ThumbnailProcessor::new(
            gateway.clone(),
            Arc::new(ImageThumbnailer),
        )),
    )?;
    registry.register_processor(
        EMAIL_QUEUE,
        Arc::new(WelcomeEmailProcessor::new(gateway, mailer)),
    )?;

    // Producers live in the API service; nothing is submitted in-process
    let (_send_to_server, recv_from_client) = mpsc::unbounded_channel();
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let store: Arc<dyn JobStore> = Arc::new(handle.clone());
    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                let result = server::serve(
                    cancel_token.clone(),
                    store,
                    registry,
                    server_config,
                    recv_from_client,
                    send_to_client,
                )
                .await;
                if let Err(err) = &result {
                    error!("Error running server: {}", err);
                    cancel_token.cancel();
                }
                result
            }
            .instrument(info_span!("server")),
        )
    };

    while let Some(msg) = recv_from_server.recv().await {
        info!(event = "Message", msg = ?msg);
    }

    info!("Waiting for server to shutdown...");
    let result = server_spawn.await?;
    handle.close().await;
    result
}

async fn enqueue(connect_url: &str, command: EnqueueCommand) -> Result<(), Error> {
    let handle = DbHandle::new(connect_url, 1).await?;
    let request = match command {
        EnqueueCommand::Thumbnail { file_id, user_id } => JobRequest::thumbnail(&file_id, &user_id),
        EnqueueCommand::WelcomeEmail { user_id } => JobRequest::welcome_email(&user_id),
    };
    let id = handle.submit_job_request(&request).await?;
    println!("{id}");
    handle.close().await;
    Ok(())
}

async fn list_failed(connect_url: &str, limit: i64) -> Result<(), Error> {
    let handle = DbHandle::new(connect_url, 1).await?;
    for job in handle.failed_jobs(limit).await? {
        println!(
            "{}\t{}\t{} attempts\t{}\t{}",
            job.id,
            job.queue,
            job.attempts,
            serde_json::Value::Object(job.payload),
            job.last_error.unwrap_or_default()
        );
    }
    handle.close().await;
    Ok(())
}

async fn requeue(connect_url: &str, job_id: uuid::Uuid) -> Result<(), Error> {
    let handle = DbHandle::new(connect_url, 1).await?;
    let requeued = handle.requeue_job(job_id).await?;
    handle.close().await;
    if !requeued {
        return Err(anyhow!("job {job_id} is not in the failed state"));
    }
    println!("requeued {job_id}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "filejobs=debug");
    }

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let result = match config.command {
        Command::Run(args) => {
            let token = CancellationToken::new();
            let app = tokio::spawn(run(token.clone(), config.connect_url, args));

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
                    _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
                }
            });
            app.await?
        }
        Command::Enqueue(command) => enqueue(&config.connect_url, command).await,
        Command::Failed { limit } => list_failed(&config.connect_url, limit).await,
        Command::Requeue { job_id } => requeue(&config.connect_url, job_id).await,
    };

    info!("Shutting down.");
    telemetry::shutdown();

    result.map_err(Into::into)
}
