//! Background heartbeat task.
//!
//! Keeps liveness signals flowing while the owner's tick is delayed. The task
//! holds only a weak reference to the endpoint and goes through the same
//! locked send path the tick uses.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::transport::local::EndpointInner;

/// Handle to a running keep-alive task. Dropping it stops the task.
#[derive(Debug)]
pub struct KeepAliveHandle {
    shutdown_tx: Option<mpsc::UnboundedSender<()>>,
    running: Arc<AtomicBool>,
}

impl KeepAliveHandle {
    pub(crate) fn new(shutdown_tx: mpsc::UnboundedSender<()>, running: Arc<AtomicBool>) -> Self {
        Self {
            shutdown_tx: Some(shutdown_tx),
            running,
        }
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Stop the task. The tick sends keep-alives again from now on.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears the running flag when the task ends on its own, including when
/// the runtime drops it.
struct RunningGuard {
    running: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.armed {
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

pub(crate) fn keep_alive_task(
    endpoint: Weak<EndpointInner>,
    interval: Duration,
    running: Arc<AtomicBool>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) -> impl Future<Output = ()> {
    // Built before the first poll so a task dropped unpolled still clears the flag.
    let mut guard = RunningGuard { running, armed: true };
    async move {
        loop {
            // A closed channel means the handle is gone; treat it as shutdown.
            // The handle already cleared the flag, and a newer task may own it.
            if tokio::time::timeout(interval, shutdown_rx.recv()).await.is_ok() {
                tracing::debug!("keep-alive task: shutdown");
                guard.armed = false;
                return;
            }

            let Some(inner) = endpoint.upgrade() else {
                tracing::debug!("keep-alive task: endpoint dropped");
                return;
            };
            if inner.is_closed() {
                tracing::debug!("keep-alive task: endpoint closed");
                return;
            }
            let now = inner.now();
            inner.send_keep_alives(now);
        }
    }
}
