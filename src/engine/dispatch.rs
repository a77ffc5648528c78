// Job dispatch to agents - bounded queue and worker pool

//! # Job Dispatch
//!
//! After a transition the engine recomputes the jobs of the activity's role
//! and pushes them to every subscribed agent. Delivery is fire-and-forget
//! with respect to the workflow: it never fails the transition that
//! triggered it.
//!
//! Notifications go through a bounded `tokio::sync::mpsc` queue drained by a
//! fixed number of worker tasks, so a slow or failing notifier shows up as
//! counted drops and failures instead of an unbounded pile of background
//! tasks.
//!
//! ## Rust Learning Notes:
//!
//! ### Sharing one receiver between workers
//! An `mpsc::Receiver` has a single owner. Wrapping it in
//! `Arc<tokio::sync::Mutex<_>>` lets several workers take turns receiving;
//! the async mutex is held only while waiting for the next message.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::models::{AgentRef, ItemId};
use crate::Result;

/// Delivers serialized job lists to agent processes
#[async_trait::async_trait]
pub trait AgentNotifier: Send + Sync {
    async fn notify(&self, agent: &AgentRef, item: ItemId, activity_path: &str, jobs: &str) -> Result<()>;
}

/// One queued job list for one agent
#[derive(Debug, Clone, PartialEq)]
pub struct JobNotification {
    pub agent: AgentRef,
    pub item: ItemId,
    pub activity_path: String,
    pub jobs: String,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time dispatch counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchStats {
    pub queued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

pub struct JobDispatcher {
    sender: Mutex<Option<mpsc::Sender<JobNotification>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<DispatchCounters>,
}

impl JobDispatcher {
    /// Spawn the worker pool; must be called inside a tokio runtime
    pub fn start(notifier: Arc<dyn AgentNotifier>, config: &DispatchConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(DispatchCounters::default());

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let notifier = notifier.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(notification) = next else {
                            debug!(worker, "dispatch queue closed");
                            break;
                        };
                        deliver(worker, notifier.as_ref(), &counters, notification).await;
                    }
                })
            })
            .collect();

        info!(
            workers = config.workers.max(1),
            capacity = config.queue_capacity.max(1),
            "job dispatcher started"
        );

        JobDispatcher {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
        }
    }

    /// Queue a notification without waiting
    ///
    /// Returns false when the queue is full or shut down; the notification is
    /// dropped and counted.
    pub fn dispatch(&self, notification: JobNotification) -> bool {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(agent = %notification.agent, "dispatcher shut down, dropping job list");
            return false;
        };
        match sender.try_send(notification) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("dropping job list: {}", e);
                false
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Close the queue and wait for queued notifications to drain
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("dispatch worker ended abnormally: {}", e);
            }
        }
        let stats = self.stats();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            "job dispatcher stopped"
        );
    }
}

async fn deliver(worker: usize, notifier: &dyn AgentNotifier, counters: &DispatchCounters, notification: JobNotification) {
    let JobNotification {
        agent,
        item,
        activity_path,
        jobs,
    } = notification;
    match notifier.notify(&agent, item, &activity_path, &jobs).await {
        Ok(()) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(worker, agent = %agent, item = %item, "job list delivered");
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(worker, agent = %agent, item = %item, "job list delivery failed: {}", e);
        }
    }
}

/// Notifier that keeps every delivered job list, for tests and demos
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<JobNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<JobNotification> {
        self.delivered.lock().clone()
    }
}

#[async_trait::async_trait]
impl AgentNotifier for RecordingNotifier {
    async fn notify(&self, agent: &AgentRef, item: ItemId, activity_path: &str, jobs: &str) -> Result<()> {
        self.delivered.lock().push(JobNotification {
            agent: agent.clone(),
            item,
            activity_path: activity_path.to_string(),
            jobs: jobs.to_string(),
        });
        Ok(())
    }
}
