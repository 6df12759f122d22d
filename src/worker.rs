use crate::processor::Registry;
use crate::{Job, JobError};
use async_channel::Receiver;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

/// Terminal signal for one delivery: exactly one is sent per received job.
#[derive(Debug)]
pub enum WorkMessage {
    JobCompleted(Job),
    JobFailed(Job, JobFailure),
}

pub async fn start(
    cancel_token: CancellationToken,
    registry: Arc<Registry>,
    recv_from_queue: Receiver<Job>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                match job {
                    Err(err) => {
                        debug!(message = "Queue channel closed, worker exiting", error = ?err);
                        break;
                    },
                    Ok(job) => {
                        let message = match process(&registry, &job).await {
                            Ok(()) => WorkMessage::JobCompleted(job),
                            Err(failure) => WorkMessage::JobFailed(job, failure),
                        };
                        // The stale-job sweep redelivers the job if nobody records this signal
                        if let Err(err) = send_to_server.send(message) {
                            error!(message = "Server gone, dropping job outcome", outcome = ?err.0);
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(
    skip(registry, job),
    fields(job_id = %job.id, queue = %job.queue, attempt = job.attempts)
)]
async fn process(registry: &Registry, job: &Job) -> Result<(), JobFailure> {
    let Some(processor) = registry.get(&job.queue) else {
        warn!("No processor registered for queue");
        return Err(JobFailure {
            message: format!("no processor registered for queue {:?}", job.queue),
            retryable: false,
        });
    };

    let outcome = AssertUnwindSafe(processor.process(job)).catch_unwind().await;
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            warn!(message = "Job failed", kind = err.kind(), error = %err.report());
            Err(failure(&err))
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(message = "Processor panicked", panic = %detail);
            Err(JobFailure {
                message: format!("processor panicked: {detail}"),
                retryable: true,
            })
        }
    }
}

fn failure(err: &JobError) -> JobFailure {
    JobFailure {
        message: err.report(),
        retryable: err.is_retryable(),
    }
}
