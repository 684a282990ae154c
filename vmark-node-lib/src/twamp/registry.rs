//! In-memory session registry.
//!
//! Three maps under one mutex: live responders, live senders, and the last
//! completed result per sender key. Critical sections never hold I/O; task
//! joins happen after the entry is removed from the map.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::reflector::{Reflector, ReflectorConfig};
use super::sender::{run_sender, SenderConfig};
use super::stats::SenderResult;
use super::IpVersion;
use crate::error::{NodeError, Result};
use crate::state::epoch_now;

/// How long `stop` waits for a cancelled task to wind down.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub type ResponderKey = (IpVersion, u16);
pub type SenderKey = (IpVersion, IpAddr, u16);

struct SessionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A completed sender record, held until read once via status.
#[derive(Debug, Clone)]
pub struct CompletedSender {
    pub finished_at: f64,
    pub result: SenderResult,
}

#[derive(Debug)]
pub enum SenderStatus {
    Running,
    Completed(CompletedSender),
    Unknown,
}

#[derive(Default)]
struct Inner {
    responders: HashMap<ResponderKey, SessionTask>,
    senders: HashMap<SenderKey, SessionTask>,
    results: HashMap<SenderKey, CompletedSender>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind and launch a reflector task. Refuses to replace a live task on
    /// the same `(ip_version, port)` key.
    pub fn start_responder(self: &Arc<Self>, cfg: ReflectorConfig) -> Result<String> {
        let key: ResponderKey = (cfg.ip_version, cfg.port);
        {
            let inner = self.inner.lock().expect("registry mutex poisoned");
            if let Some(task) = inner.responders.get(&key) {
                if !task.handle.is_finished() {
                    return Err(NodeError::Conflict(format!(
                        "A {} responder is already active on port {}.",
                        key.0, key.1
                    )));
                }
            }
        }

        // Bind outside the lock so bind errors surface to the caller.
        let reflector = Reflector::bind(cfg.clone())?;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { reflector.run(task_cancel).await });

        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(task) = inner.responders.get(&key) {
            // lost a race with a concurrent start on the same key
            if !task.handle.is_finished() {
                cancel.cancel();
                return Err(NodeError::Conflict(format!(
                    "A {} responder is already active on port {}.",
                    key.0, key.1
                )));
            }
        }
        inner.responders.insert(key, SessionTask { cancel, handle });
        info!(version = %key.0, port = key.1, "responder session registered");
        Ok(format!("TWAMP {} responder started on port {}.", key.0, key.1))
    }

    /// Launch a sender task. On completion the task posts its result record
    /// back into the registry, where it waits for one status read.
    pub fn start_sender(self: &Arc<Self>, cfg: SenderConfig) -> Result<String> {
        let key: SenderKey = (cfg.ip_version, cfg.destination.ip(), cfg.destination.port());
        {
            let inner = self.inner.lock().expect("registry mutex poisoned");
            if let Some(task) = inner.senders.get(&key) {
                if !task.handle.is_finished() {
                    return Err(NodeError::Conflict(format!(
                        "A {} sender to {}:{} is already active.",
                        key.0, key.1, key.2
                    )));
                }
            }
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = run_sender(cfg, task_cancel).await;
            registry.record_sender_result(key, result);
        });

        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(task) = inner.senders.get(&key) {
            if !task.handle.is_finished() {
                cancel.cancel();
                return Err(NodeError::Conflict(format!(
                    "A {} sender to {}:{} is already active.",
                    key.0, key.1, key.2
                )));
            }
        }
        inner.senders.insert(key, SessionTask { cancel, handle });
        info!(version = %key.0, dest = %key.1, port = key.2, "sender session registered");
        Ok(format!(
            "TWAMP {} sender to {}:{} started.",
            key.0, key.1, key.2
        ))
    }

    fn record_sender_result(&self, key: SenderKey, result: SenderResult) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .results
            .insert(key, CompletedSender { finished_at: epoch_now(), result });
    }

    pub async fn stop_responder(&self, key: ResponderKey) -> Result<String> {
        let task = {
            let mut inner = self.inner.lock().expect("registry mutex poisoned");
            inner.responders.remove(&key)
        }
        .ok_or_else(|| {
            NodeError::NotFound(format!("No {} responder on port {}.", key.0, key.1))
        })?;

        let exited = stop_task(task).await;
        info!(version = %key.0, port = key.1, exited, "responder session stopped");
        if exited {
            Ok(format!("TWAMP {} responder on port {} stopped.", key.0, key.1))
        } else {
            Ok(format!(
                "TWAMP {} responder on port {} signalled to stop but did not confirm exit.",
                key.0, key.1
            ))
        }
    }

    pub async fn stop_sender(&self, key: SenderKey) -> Result<String> {
        let task = {
            let mut inner = self.inner.lock().expect("registry mutex poisoned");
            inner.senders.remove(&key)
        }
        .ok_or_else(|| {
            NodeError::NotFound(format!("No sender to {}:{} ({}).", key.1, key.2, key.0))
        })?;

        let exited = stop_task(task).await;
        info!(version = %key.0, dest = %key.1, port = key.2, exited, "sender session stopped");
        if exited {
            Ok(format!("TWAMP sender to {}:{} stopped.", key.1, key.2))
        } else {
            Ok(format!(
                "TWAMP sender to {}:{} signalled to stop but did not confirm exit.",
                key.1, key.2
            ))
        }
    }

    /// Status of a sender session. A completed record is removed by this
    /// read; only the most recent result per key is ever retained.
    pub fn sender_status(&self, key: SenderKey) -> SenderStatus {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(task) = inner.senders.get(&key) {
            if !task.handle.is_finished() {
                return SenderStatus::Running;
            }
            inner.senders.remove(&key);
        }
        match inner.results.remove(&key) {
            Some(completed) => SenderStatus::Completed(completed),
            None => SenderStatus::Unknown,
        }
    }

    /// Cancel every live session. Used on shutdown.
    pub fn stop_all(&self) {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        for task in inner.responders.values().chain(inner.senders.values()) {
            task.cancel.cancel();
        }
    }
}

/// Cancel a task and join it with a bound. Safe to call on an already
/// finished task.
async fn stop_task(task: SessionTask) -> bool {
    task.cancel.cancel();
    match tokio::time::timeout(JOIN_TIMEOUT, task.handle).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(%err, "session task panicked");
            true
        }
        Err(_) => {
            warn!("session task did not exit within the join timeout");
            false
        }
    }
}
