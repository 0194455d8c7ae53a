//! Asynchronous listener dispatch.
//!
//! Application listeners run user code. Notifications are queued and
//! delivered from a dedicated worker task so no registry or store lock is
//! ever held across a callback.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use busguard_core::{Error, OnlineApplication};

/// Which reconciliation step a sync error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Reset,
    Policy,
    Membership,
    Identity,
    Storage,
}

/// A failed attempt to push pending configuration to a remote application.
#[derive(Debug, Clone)]
pub struct SyncError {
    pub app: OnlineApplication,
    pub kind: SyncErrorKind,
    pub error: Error,
}

/// Observes application state transitions and reconciliation failures.
pub trait ApplicationListener: Send + Sync {
    fn on_application_state_change(
        &self,
        old: Option<&OnlineApplication>,
        new: Option<&OnlineApplication>,
    );

    fn on_sync_error(&self, error: &SyncError);
}

enum ListenerEvent {
    StateChange {
        old: Option<OnlineApplication>,
        new: Option<OnlineApplication>,
    },
    SyncFailure(SyncError),
}

/// Queues listener notifications and delivers them from one worker task.
pub struct ListenerHub {
    tx: Mutex<Option<mpsc::UnboundedSender<ListenerEvent>>>,
    listeners: Mutex<Vec<Arc<dyn ApplicationListener>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerHub {
    pub fn start() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = Arc::new(ListenerHub {
            tx: Mutex::new(Some(tx)),
            listeners: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
        });
        let worker_hub = Arc::clone(&hub);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                worker_hub.dispatch(&event);
            }
        });
        *hub.worker.lock() = Some(handle);
        hub
    }

    pub fn register(&self, listener: Arc<dyn ApplicationListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn unregister(&self, listener: &Arc<dyn ApplicationListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn notify_state_change(
        &self,
        old: Option<OnlineApplication>,
        new: Option<OnlineApplication>,
    ) {
        self.send(ListenerEvent::StateChange { old, new });
    }

    pub fn notify_sync_error(&self, error: SyncError) {
        self.send(ListenerEvent::SyncFailure(error));
    }

    fn send(&self, event: ListenerEvent) {
        // Events after shutdown are dropped.
        if let Some(tx) = &*self.tx.lock() {
            let _ = tx.send(event);
        }
    }

    fn dispatch(&self, event: &ListenerEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            match event {
                ListenerEvent::StateChange { old, new } => {
                    listener.on_application_state_change(old.as_ref(), new.as_ref());
                }
                ListenerEvent::SyncFailure(error) => listener.on_sync_error(error),
            }
        }
    }

    /// Refuse new notifications, drain the queue, and wait for the worker.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
