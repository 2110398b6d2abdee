//! Reactor backend.
//!
//! Transfers are local tasks of a [`LocalSet`]. A tick runs the event loop
//! until the first event arrives or the budget runs out, then returns
//! everything queued so far.

use super::event::{self, EventQueue, EventSink, TransferEvent};
use super::{build_runtime, Backend, BackendKind, HandleId, LocalTransfer, ABANDONED_DRAIN_TIMEOUT};
use crate::base::neterror::NetError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, LocalSet};

/// Backend B: transfers as tasks on a single-threaded event loop.
pub struct ReactorBackend {
    runtime: Option<Runtime>,
    local: LocalSet,
    tasks: HashMap<HandleId, JoinHandle<()>>,
    tx: mpsc::UnboundedSender<(HandleId, TransferEvent)>,
    rx: EventQueue,
}

impl ReactorBackend {
    pub fn new() -> Result<Self, NetError> {
        let runtime = build_runtime(BackendKind::Reactor)?;
        let (tx, rx) = event::channel();
        Ok(Self {
            runtime: Some(runtime),
            local: LocalSet::new(),
            tasks: HashMap::new(),
            tx,
            rx,
        })
    }

    fn reap(&mut self) {
        self.tasks.retain(|_, task| !task.is_finished());
    }
}

impl Backend for ReactorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Reactor
    }

    fn sink(&self, id: HandleId) -> EventSink {
        EventSink::new(id, self.tx.clone())
    }

    fn start(&mut self, id: HandleId, transfer: LocalTransfer) {
        let task = self.local.spawn_local(transfer);
        self.tasks.insert(id, task);
    }

    fn tick(&mut self, timeout: Duration) -> Vec<(HandleId, TransferEvent)> {
        let mut out = Vec::new();
        let Some(runtime) = self.runtime.as_ref() else {
            return out;
        };
        let rx = &mut self.rx;

        if !self.tasks.is_empty() {
            self.local.block_on(runtime, async {
                tokio::select! {
                    first = rx.recv() => out.extend(first),
                    _ = tokio::time::sleep(timeout) => {}
                }
            });
        }

        event::drain(rx, &mut out);
        self.reap();
        out
    }

    fn cancel(&mut self, id: HandleId) -> bool {
        let Some(task) = self.tasks.remove(&id) else {
            return false;
        };
        let finished = task.is_finished();
        task.abort();
        // Aborted local tasks are dropped the next time the set runs.
        if let Some(runtime) = self.runtime.as_ref() {
            self.local.block_on(runtime, tokio::task::yield_now());
        }
        !finished
    }

    fn active_count(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }
}

impl Drop for ReactorBackend {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        {
            let _guard = runtime.enter();
            for (_, task) in self.tasks.drain() {
                task.abort();
            }
            drop(std::mem::take(&mut self.local));
        }
        runtime.shutdown_timeout(ABANDONED_DRAIN_TIMEOUT);
    }
}
