//! Ingestion worker pool: a flume broker queue feeding a fixed number of
//! workers that each drive one ingest through the stage machine to
//! completion before picking up the next message.
//!
//! Mirrors the event bus's sink-worker shape (a spawned task looping on an
//! async channel receiver) but for doing the ingestion work itself rather
//! than broadcasting telemetry about it.

use std::sync::Arc;

use uuid::Uuid;

use crate::ingestion::{IngestionCoordinator, NextAction, Stage};

/// One queued unit of work: "run the stage machine for this ingest,
/// starting at this stage". Acks are implicit and late — a message is only
/// considered handled once the worker has driven the chain to `Done` or
/// `Fail`, matching `task_acks_late` semantics; a crash mid-chain simply
/// loses that message rather than corrupting ledger state, since every
/// stage re-checks the ledger before doing work.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub ingest_id: Uuid,
    pub stage: Stage,
}

pub struct Broker {
    sender: flume::Sender<WorkItem>,
    receiver: flume::Receiver<WorkItem>,
}

impl Default for Broker {
    fn default() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self { sender, receiver }
    }
}

impl Broker {
    pub fn enqueue(&self, ingest_id: Uuid, stage: Stage) {
        let _ = self.sender.send(WorkItem { ingest_id, stage });
    }

    pub fn sender(&self) -> flume::Sender<WorkItem> {
        self.sender.clone()
    }
}

/// Spawns `concurrency` workers pulling from `broker`. Each worker recycles
/// (logs and restarts its receive loop) after `recycle_after` processed
/// items, bounding the lifetime of any per-task state that might otherwise
/// accumulate.
pub fn spawn_workers(
    coordinator: Arc<IngestionCoordinator>,
    broker: Arc<Broker>,
    concurrency: usize,
    recycle_after: u64,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|worker_id| {
            let coordinator = coordinator.clone();
            let receiver = broker.receiver.clone();
            tokio::spawn(async move {
                loop {
                    let mut processed = 0u64;
                    while let Ok(item) = receiver.recv_async().await {
                        run_chain(&coordinator, item).await;
                        processed += 1;
                        if recycle_after > 0 && processed >= recycle_after {
                            tracing::debug!(worker_id, processed, "recycling ingestion worker");
                            break;
                        }
                    }
                    if receiver.is_disconnected() {
                        break;
                    }
                }
            })
        })
        .collect()
}

/// Drives one ingest from `item.stage` through to `Done` or `Fail`,
/// threading the canonical payload between `run_stage` calls.
async fn run_chain(coordinator: &IngestionCoordinator, item: WorkItem) {
    let mut stage = item.stage;
    let mut canonical = None;
    loop {
        let run = match coordinator.run_stage(item.ingest_id, stage, canonical).await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(ingest_id = %item.ingest_id, stage = stage_name(stage), error = %err, "stage invocation failed");
                return;
            }
        };
        match run.action {
            NextAction::Enqueue(next) => {
                stage = next;
                canonical = run.canonical;
            }
            NextAction::Done => {
                tracing::info!(ingest_id = %item.ingest_id, "ingest completed");
                return;
            }
            NextAction::Fail(reason) => {
                tracing::warn!(ingest_id = %item.ingest_id, reason, "ingest failed");
                return;
            }
        }
    }
}

fn stage_name(stage: Stage) -> &'static str {
    stage.name()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_enqueue_is_received_in_order() {
        let broker = Broker::default();
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        broker.enqueue(id_a, Stage::ParseNormalize);
        broker.enqueue(id_b, Stage::PiiDq);
        let first = broker.receiver.try_recv().unwrap();
        let second = broker.receiver.try_recv().unwrap();
        assert_eq!(first.ingest_id, id_a);
        assert_eq!(second.ingest_id, id_b);
    }
}
