// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Fan-out of [`Notification`]s to independently registered sinks.
//!
//! ```text
//! notify(n)
//!     ├──► [queue 1] ──► worker 1 ──► sink1.notify()
//!     ├──► [queue 2] ──► worker 2 ──► sink2.notify()
//!     └──► [queue N] ──► worker N ──► sinkN.notify()
//! ```
//!
//! Every sink owns an unbounded FIFO queue drained by its own worker, so a
//! slow or blocking sink only delays itself. Nothing is dropped while a sink
//! is registered. Unregistering closes the queue; the worker drains what was
//! already queued and exits. A panicking sink is logged and keeps receiving.
//!
//! Sinks are synchronous (terminal and file writers), so workers run on the
//! runtime's blocking pool and `register` must be called within a tokio
//! runtime.

use crate::errors::BusError;
use crate::notification::Notification;
use log::{debug, error, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Consumer of supervisor events. Implementations handle their own errors.
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    fn notify(&self, notification: &Notification);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

struct SinkSlot {
    id: SinkId,
    name: String,
    sender: mpsc::UnboundedSender<Arc<Notification>>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct BusInner {
    slots: Mutex<Vec<SinkSlot>>,
    next_id: AtomicU64,
}

/// Cheap to clone; all clones share the same sink registry.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<SinkSlot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a sink. It receives every notification emitted after this
    /// call returns.
    pub fn register(&self, sink: Arc<dyn NotificationSink>) -> Result<SinkId, BusError> {
        let runtime = Handle::try_current()?;
        let id = SinkId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let name = sink.name().to_string();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<Notification>>();

        let worker = runtime.spawn_blocking(move || {
            while let Some(notification) = receiver.blocking_recv() {
                let delivered =
                    catch_unwind(AssertUnwindSafe(|| sink.notify(notification.as_ref())));
                if delivered.is_err() {
                    error!(
                        "sink {} panicked handling {} notification",
                        sink.name(),
                        notification.kind
                    );
                }
            }
        });

        debug!("registered notification sink {name}");
        self.slots().push(SinkSlot {
            id,
            name,
            sender,
            worker,
        });
        Ok(id)
    }

    /// Remove a sink. Notifications already queued for it are still
    /// delivered. Returns false if the id is unknown.
    pub fn unregister(&self, id: SinkId) -> bool {
        let removed = {
            let mut slots = self.slots();
            slots
                .iter()
                .position(|s| s.id == id)
                .map(|pos| slots.remove(pos))
        };
        match removed {
            Some(slot) => {
                debug!("unregistered notification sink {}", slot.name);
                // Dropping the sender ends the worker once its queue is empty.
                drop(slot.sender);
                true
            }
            None => false,
        }
    }

    pub fn sink_count(&self) -> usize {
        self.slots().len()
    }

    /// Queue `notification` for every registered sink. Never blocks.
    pub fn notify(&self, notification: Notification) {
        let notification = Arc::new(notification);
        for slot in self.slots().iter() {
            if slot.sender.send(Arc::clone(&notification)).is_err() {
                warn!("sink {} is gone, dropping notification", slot.name);
            }
        }
    }

    /// Unregister every sink and wait for their queues to drain.
    pub async fn close(&self) {
        let slots = std::mem::take(&mut *self.slots());
        let workers: Vec<_> = slots
            .into_iter()
            .map(|slot| {
                drop(slot.sender);
                (slot.name, slot.worker)
            })
            .collect();
        for (name, worker) in workers {
            if let Err(e) = worker.await {
                warn!("sink {name} worker terminated abnormally: {e}");
            }
        }
    }
}
