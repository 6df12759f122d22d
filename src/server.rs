use crate::processor::Registry;
use crate::queue::{FailureAction, JobStore, RetryPolicy};
use crate::worker::{self, JobFailure, WorkMessage};
use crate::{Job, JobRequest};
use anyhow::Error;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum WorkResponseMessage {
    JobQueued(Uuid),
    JobCompleted(Uuid),
    JobRetrying(Uuid, String, DateTime<Utc>),
    /// The job reached the dead-letter state.
    JobFailed(Uuid, String),
    DatabaseQueueError(Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub workers: u16,
    pub poll_interval: Duration,
    /// Visibility timeout: jobs processing for longer are redelivered.
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            poll_interval: Duration::from_millis(500),
            job_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

fn notify(send_to_client: &mpsc::UnboundedSender<WorkResponseMessage>, msg: WorkResponseMessage) {
    if let Err(err) = send_to_client.send(msg) {
        trace!(message = "No client listening for responses", response = ?err.0);
    }
}

pub async fn serve(
    cancel_token: CancellationToken,
    store: Arc<dyn JobStore>,
    registry: Registry,
    config: ServerConfig,
    mut recv_from_client: mpsc::UnboundedReceiver<JobRequest>,
    send_to_client: mpsc::UnboundedSender<WorkResponseMessage>,
) -> Result<(), Error> {
    let queues = registry.queues();
    let registry = Arc::new(registry);
    let workers_count = config.workers.max(1);
    info!(message = "Serving queues", queues = ?queues, workers = workers_count);

    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) = async_channel::bounded::<Job>(workers_count as usize);

    let mut workers = vec![];
    for _ in 0..workers_count {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let registry = registry.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, registry, recv_from_queue, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }
    drop(send_to_server);

    let mut free_workers = workers_count as i64;
    let mut client_open = true;
    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if free_workers > 0 && !queues.is_empty() {
            match store.claim_jobs(&queues, free_workers).await {
                Ok(jobs_to_process) => {
                    for job in jobs_to_process {
                        debug!(message = "Claimed job", job_id = %job.id, queue = %job.queue, attempt = job.attempts);
                        send_to_queue.send(job).await?;
                        free_workers -= 1;
                    }
                }
                Err(err) => notify(&send_to_client, WorkResponseMessage::DatabaseQueueError(err)),
            }
        }

        // Wait for the next event
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            // Poll for delayed retries and jobs submitted by other processes
            _ = ticker.tick() => {
                match store.reclaim_stale_jobs(config.job_timeout).await {
                    Ok(0) => {},
                    Ok(reclaimed) => warn!(message = "Reclaimed stale jobs", count = reclaimed),
                    Err(err) => notify(&send_to_client, WorkResponseMessage::DatabaseQueueError(err)),
                }
            },
            // Handle responses from workers
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::JobCompleted(job)) => {
                        debug!(message = "Completed job", job_id = %job.id);
                        free_workers += 1;
                        match store.complete_job(job.id, job.attempts).await {
                            Ok(()) => notify(&send_to_client, WorkResponseMessage::JobCompleted(job.id)),
                            Err(err) => notify(&send_to_client, WorkResponseMessage::DatabaseQueueError(err)),
                        }
                    },
                    Some(WorkMessage::JobFailed(job, failure)) => {
                        free_workers += 1;
                        let response = record_failure(store.as_ref(), &config.retry, &job, failure).await;
                        notify(&send_to_client, response);
                    },
                }
            },
            // Handle requests from clients
            chan_msg = recv_from_client.recv(), if client_open => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed, no longer accepting in-process requests");
                        client_open = false;
                    },
                    Some(job_request) => {
                        debug!(message = "Requested job", job_request = ?job_request);
                        match store.submit_job_request(&job_request).await {
                            Ok(id) => notify(&send_to_client, WorkResponseMessage::JobQueued(id)),
                            Err(err) => notify(&send_to_client, WorkResponseMessage::DatabaseQueueError(err)),
                        }
                    }
                }
            }
        }
    }

    // Idle workers are parked on the queue channel; closing it releases them
    send_to_queue.close();

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    // Claimed but never started; hand them back instead of waiting for the stale sweep
    while let Ok(job) = recv_from_queue.try_recv() {
        debug!(message = "Releasing undelivered job", job_id = %job.id);
        if let Err(err) = store.release_job(job.id, job.attempts).await {
            notify(&send_to_client, WorkResponseMessage::DatabaseQueueError(err));
        }
    }

    // Outcomes of jobs that were in flight when cancellation arrived
    while let Ok(message) = recv_from_worker.try_recv() {
        match message {
            WorkMessage::JobCompleted(job) => match store.complete_job(job.id, job.attempts).await {
                Ok(()) => notify(&send_to_client, WorkResponseMessage::JobCompleted(job.id)),
                Err(err) => notify(&send_to_client, WorkResponseMessage::DatabaseQueueError(err)),
            },
            WorkMessage::JobFailed(job, failure) => {
                let response = record_failure(store.as_ref(), &config.retry, &job, failure).await;
                notify(&send_to_client, response);
            }
        }
    }

    info!("Server stopped.");

    Ok(())
}

async fn record_failure(
    store: &dyn JobStore,
    policy: &RetryPolicy,
    job: &Job,
    failure: JobFailure,
) -> WorkResponseMessage {
    match policy.decide(job, failure.retryable, Utc::now()) {
        FailureAction::Retry(run_at) => {
            info!(message = "Retrying job", job_id = %job.id, attempt = job.attempts, run_at = %run_at, error = %failure.message);
            if let Err(err) = store
                .retry_job(job.id, job.attempts, &failure.message, run_at)
                .await
            {
                return WorkResponseMessage::DatabaseQueueError(err);
            }
            WorkResponseMessage::JobRetrying(job.id, failure.message, run_at)
        }
        FailureAction::DeadLetter => {
            error!(message = "Job failed permanently", job_id = %job.id, attempts = job.attempts, error = %failure.message);
            if let Err(err) = store.fail_job(job.id, job.attempts, &failure.message).await {
                return WorkResponseMessage::DatabaseQueueError(err);
            }
            WorkResponseMessage::JobFailed(job.id, failure.message)
        }
    }
}
