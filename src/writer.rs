use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::Operation;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl From<&Config> for WriterOptions {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl Tally {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    fn add(&mut self, ops: &[Operation]) {
        for op in ops {
            match op {
                Operation::Create { .. } => self.created += 1,
                Operation::Update { .. } => self.updated += 1,
                Operation::Delete { .. } => self.deleted += 1,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReport {
    pub index: usize,
    pub size: usize,
    pub attempts: u32,
    pub committed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSummary {
    pub chunks: Vec<ChunkReport>,
    pub tally: Tally,
    pub planned_chunks: usize,
}

impl WriteSummary {
    pub fn failed_chunk(&self) -> Option<&ChunkReport> {
        self.chunks.iter().find(|c| !c.committed)
    }

    pub fn committed_chunks(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.committed)
            .map(|c| c.index)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed_chunk().is_none()
    }

    pub fn into_result(self) -> Result<Self> {
        match self.failed_chunk() {
            Some(chunk) => Err(Error::ChunkFailed {
                index: chunk.index,
                attempts: chunk.attempts,
                message: chunk.error.clone().unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}

pub fn partition(ops: &[Operation], chunk_size: usize) -> Vec<&[Operation]> {
    ops.chunks(chunk_size.max(1)).collect()
}

pub async fn write_operations(
    store: &dyn DocumentStore,
    ops: &[Operation],
    options: WriterOptions,
) -> WriteSummary {
    let chunks = partition(ops, options.chunk_size);
    let mut summary = WriteSummary {
        planned_chunks: chunks.len(),
        ..Default::default()
    };

    for (index, chunk) in chunks.into_iter().enumerate() {
        let mut attempts = 0u32;
        let mut delay = options.backoff;
        let outcome = loop {
            attempts += 1;
            match store.apply_chunk(chunk).await {
                Ok(()) => break Ok(()),
                Err(e) if attempts <= options.max_retries => {
                    warn!(chunk = index, attempt = attempts, error = %e, "chunk commit failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(()) => {
                summary.tally.add(chunk);
                info!(chunk = index, size = chunk.len(), attempts, "chunk committed");
                summary.chunks.push(ChunkReport {
                    index,
                    size: chunk.len(),
                    attempts,
                    committed: true,
                    error: None,
                });
            }
            Err(e) => {
                error!(
                    chunk = index,
                    attempts,
                    committed = ?summary.committed_chunks(),
                    error = %e,
                    "chunk failed after retries, stopping run"
                );
                summary.chunks.push(ChunkReport {
                    index,
                    size: chunk.len(),
                    attempts,
                    committed: false,
                    error: Some(e.to_string()),
                });
                break;
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Collection;
    use crate::store::MemoryStore;
    use serde_json::Map;

    fn ops(n: usize) -> Vec<Operation> {
        (0..n)
            .map(|i| Operation::Create {
                collection: Collection::Grades,
                id: format!("g{i}"),
                document: Map::new(),
            })
            .collect()
    }

    fn options(chunk_size: usize) -> WriterOptions {
        WriterOptions {
            chunk_size,
            max_retries: 2,
            backoff: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn thousand_ops_in_chunks_of_four_hundred() {
        let store = MemoryStore::new();
        let summary = write_operations(&store, &ops(1000), options(400)).await;
        assert!(summary.is_success());
        assert_eq!(store.applied_chunks(), vec![400, 400, 200]);
        assert_eq!(summary.tally.total(), 1000);
        assert_eq!(summary.tally.created, 1000);
        assert_eq!(summary.committed_chunks(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn transient_failure_retries_only_that_chunk() {
        let store = MemoryStore::new();
        store.fail_next_chunks(2);
        let summary = write_operations(&store, &ops(10), options(5)).await;
        assert!(summary.is_success());
        assert_eq!(summary.chunks[0].attempts, 3);
        assert_eq!(summary.chunks[1].attempts, 1);
        assert_eq!(store.grade_ids().len(), 10);
    }

    #[tokio::test]
    async fn persistent_failure_stops_the_run() {
        let store = MemoryStore::new();
        let all = ops(10);
        write_operations(&store, &all[..5], options(5)).await;
        store.fail_next_chunks(10);
        let summary = write_operations(&store, &all, options(5)).await;
        assert!(!summary.is_success());
        assert_eq!(summary.chunks.len(), 1);
        assert_eq!(summary.chunks[0].attempts, 3);
        assert_eq!(summary.planned_chunks, 2);
        let err = summary.into_result().unwrap_err();
        assert!(matches!(err, Error::ChunkFailed { index: 0, attempts: 3, .. }));
    }

    #[tokio::test]
    async fn rerun_after_partial_failure_converges() {
        let store = MemoryStore::new();
        let all = ops(12);
        store.fail_next_chunks(0);
        let first = write_operations(&store, &all[..8], options(4)).await;
        assert!(first.is_success());
        let second = write_operations(&store, &all, options(4)).await;
        assert!(second.is_success());
        assert_eq!(store.grade_ids().len(), 12);
    }
}
