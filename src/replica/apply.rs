use crate::actor::ActorClient;
use crate::commitlog::{EntryKind, LogEntry, LogIndex};
use crate::replica::replica_api::{ReplicateError, SharedStatus};
use crate::replica::state_machine::StateMachine;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;

/// Fulfilled with the state machine's output when the entry applies, or
/// with an error if it never will.
pub type CommitPromise = oneshot::Sender<Result<Bytes, ReplicateError>>;

#[derive(Debug)]
pub struct ApplyItem {
    pub index: LogIndex,
    pub entry: LogEntry,
    pub promise: Option<CommitPromise>,
}

#[derive(Debug, Clone)]
struct ApplyControl {
    paused: bool,
    /// Distinguishes pause generations so a stale auto-resume cannot undo a
    /// newer pause.
    pause_generation: u64,
    shutdown: bool,
}

/// Handle side of the apply pipeline, owned by the coordination task.
/// Entries are submitted strictly in ascending index order; the task applies
/// them in that order with no gaps.
pub struct ApplyPipeline {
    work_tx: mpsc::UnboundedSender<ApplyItem>,
    control_tx: Arc<watch::Sender<ApplyControl>>,
}

impl ApplyPipeline {
    pub fn spawn(
        logger: slog::Logger,
        state_machine: Arc<Mutex<dyn StateMachine>>,
        status: Arc<SharedStatus>,
        actor_client: ActorClient,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = watch::channel(ApplyControl {
            paused: false,
            pause_generation: 0,
            shutdown: false,
        });

        let task = ApplyTask {
            logger,
            work_rx,
            control_rx,
            state_machine,
            status,
            actor_client,
        };
        tokio::task::spawn(task.run());

        ApplyPipeline {
            work_tx,
            control_tx: Arc::new(control_tx),
        }
    }

    pub fn submit(&self, item: ApplyItem) {
        // Receiver only drops at shutdown; a lost item is fine then.
        let _ = self.work_tx.send(item);
    }

    pub fn is_paused(&self) -> bool {
        self.control_tx.borrow().paused
    }

    /// Stop feeding the state machine. Replication and commit continue
    /// elsewhere; only application stops. With `auto_resume` set, the
    /// pipeline resumes by itself after that long.
    pub fn pause(&self, auto_resume: Option<Duration>) {
        let mut generation = 0;
        self.control_tx.send_modify(|control| {
            control.paused = true;
            control.pause_generation += 1;
            generation = control.pause_generation;
        });

        if let Some(timeout) = auto_resume {
            let control_tx = Arc::clone(&self.control_tx);
            tokio::task::spawn(async move {
                tokio::time::sleep(timeout).await;
                control_tx.send_modify(|control| {
                    if control.paused && control.pause_generation == generation {
                        control.paused = false;
                    }
                });
            });
        }
    }

    pub fn resume(&self) {
        self.control_tx.send_modify(|control| control.paused = false);
    }

    /// Ends the task after the currently-applying entry, even while paused.
    pub fn shutdown(&self) {
        self.control_tx.send_modify(|control| control.shutdown = true);
    }
}

struct ApplyTask {
    logger: slog::Logger,
    work_rx: mpsc::UnboundedReceiver<ApplyItem>,
    control_rx: watch::Receiver<ApplyControl>,
    state_machine: Arc<Mutex<dyn StateMachine>>,
    status: Arc<SharedStatus>,
    actor_client: ActorClient,
}

impl ApplyTask {
    async fn run(mut self) {
        loop {
            // Honor pause/shutdown between entries, never mid-entry.
            loop {
                let control = self.control_rx.borrow().clone();
                if control.shutdown {
                    slog::info!(self.logger, "Apply pipeline shutting down");
                    return;
                }
                if !control.paused {
                    break;
                }
                if self.control_rx.changed().await.is_err() {
                    return;
                }
            }

            tokio::select! {
                changed = self.control_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Re-check pause/shutdown at the top of the loop.
                }
                item = self.work_rx.recv() => {
                    match item {
                        None => return,
                        Some(item) => self.apply(item).await,
                    }
                }
            }
        }
    }

    async fn apply(&mut self, item: ApplyItem) {
        let index = item.index;
        match item.entry.kind {
            EntryKind::Application => {
                let output = {
                    let mut sm = self.state_machine.lock().expect("state machine lock");
                    sm.commit(index, &item.entry.payload)
                };
                if let Some(promise) = item.promise {
                    let _ = promise.send(Ok(output));
                }
            }
            EntryKind::Configuration => {
                // Membership bookkeeping belongs to the coordination task.
                self.actor_client.config_committed(index).await;
                if let Some(promise) = item.promise {
                    let _ = promise.send(Ok(Bytes::new()));
                }
            }
            EntryKind::SnapshotMarker | EntryKind::Custom => {
                if let Some(promise) = item.promise {
                    let _ = promise.send(Ok(Bytes::new()));
                }
            }
        }

        self.status.set_last_applied_index(index);
        self.actor_client.entry_applied(index).await;
    }
}
