use crate::{Job, JobError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Consumes one delivered job. Returning `Ok` acknowledges it; any error
/// hands the retry decision to the queue. Implementations may be invoked
/// concurrently and more than once for the same job.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<(), JobError>;
}

#[derive(Debug, Error)]
#[error("a processor is already registered for queue {0:?}")]
pub struct DuplicateProcessor(pub String);

/// Maps queue names to the single processor consuming each queue.
#[derive(Clone, Default)]
pub struct Registry {
    processors: HashMap<String, Arc<dyn JobProcessor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_processor(
        &mut self,
        queue: impl Into<String>,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<(), DuplicateProcessor> {
        let queue = queue.into();
        if self.processors.contains_key(&queue) {
            return Err(DuplicateProcessor(queue));
        }
        self.processors.insert(queue, processor);
        Ok(())
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(queue).cloned()
    }

    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.processors.keys().cloned().collect();
        queues.sort();
        queues
    }
}
