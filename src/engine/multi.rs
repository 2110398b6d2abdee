//! Native multiplexing backend.
//!
//! Every transfer gets its own waker that records the transfer's id in a
//! ready queue. One perform step polls exactly the transfers found in that
//! queue, so a tick costs in proportion to the transfers that made progress,
//! not to the number registered.

use super::event::{self, EventQueue, EventSink, TransferEvent};
use super::{build_runtime, Backend, BackendKind, HandleId, LocalTransfer, ABANDONED_DRAIN_TIMEOUT};
use crate::base::neterror::NetError;
use futures::task::{waker, ArcWake, AtomicWaker};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

/// Perform steps in one poll before yielding back to the runtime's IO driver.
const MAX_PERFORM_ROUNDS: usize = 32;

#[derive(Default)]
struct ReadyQueue {
    ids: Mutex<VecDeque<HandleId>>,
    driver: AtomicWaker,
}

impl ReadyQueue {
    fn push(&self, id: HandleId) {
        if let Ok(mut ids) = self.ids.lock() {
            if !ids.contains(&id) {
                ids.push_back(id);
            }
        }
        self.driver.wake();
    }

    fn take(&self) -> VecDeque<HandleId> {
        self.ids
            .lock()
            .map(|mut ids| std::mem::take(&mut *ids))
            .unwrap_or_default()
    }

    fn is_empty(&self) -> bool {
        self.ids.lock().map(|ids| ids.is_empty()).unwrap_or(true)
    }
}

struct TransferWaker {
    id: HandleId,
    ready: Arc<ReadyQueue>,
}

impl ArcWake for TransferWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.push(arc_self.id);
    }
}

struct Slot {
    future: LocalTransfer,
    waker: Waker,
}

/// Everything but the runtime, so a tick can borrow both at once.
struct MultiState {
    transfers: HashMap<HandleId, Slot>,
    ready: Arc<ReadyQueue>,
    tx: mpsc::UnboundedSender<(HandleId, TransferEvent)>,
    rx: EventQueue,
}

impl MultiState {
    /// Polls every woken transfer once. Returns how many finished.
    fn perform(&mut self) -> usize {
        let mut finished = 0;
        for id in self.ready.take() {
            let Some(slot) = self.transfers.get_mut(&id) else {
                continue;
            };
            let mut cx = Context::from_waker(&slot.waker);
            if slot.future.as_mut().poll(&mut cx).is_ready() {
                self.transfers.remove(&id);
                finished += 1;
            }
        }
        finished
    }
}

/// Backend A: one shared perform step over woken transfers.
pub struct MultiBackend {
    runtime: Option<Runtime>,
    state: MultiState,
}

impl MultiBackend {
    pub fn new() -> Result<Self, NetError> {
        let runtime = build_runtime(BackendKind::Multi)?;
        let (tx, rx) = event::channel();
        Ok(Self {
            runtime: Some(runtime),
            state: MultiState {
                transfers: HashMap::new(),
                ready: Arc::new(ReadyQueue::default()),
                tx,
                rx,
            },
        })
    }
}

impl Backend for MultiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Multi
    }

    fn sink(&self, id: HandleId) -> EventSink {
        EventSink::new(id, self.state.tx.clone())
    }

    fn start(&mut self, id: HandleId, transfer: LocalTransfer) {
        let waker = waker(Arc::new(TransferWaker {
            id,
            ready: self.state.ready.clone(),
        }));
        self.state.transfers.insert(
            id,
            Slot {
                future: transfer,
                waker,
            },
        );
        self.state.ready.push(id);
    }

    fn tick(&mut self, timeout: Duration) -> Vec<(HandleId, TransferEvent)> {
        let mut out = Vec::new();
        let Some(runtime) = self.runtime.as_ref() else {
            return out;
        };
        let state = &mut self.state;

        runtime.block_on(async {
            let sleep = tokio::time::sleep(timeout);
            tokio::pin!(sleep);

            std::future::poll_fn(|cx| {
                for _ in 0..MAX_PERFORM_ROUNDS {
                    state.ready.driver.register(cx.waker());
                    state.perform();
                    event::drain(&mut state.rx, &mut out);
                    if !out.is_empty() || state.transfers.is_empty() {
                        return Poll::Ready(());
                    }
                    if state.ready.is_empty() {
                        return sleep.as_mut().poll(cx);
                    }
                }
                // Transfers keep waking each other; let the IO driver run.
                cx.waker().wake_by_ref();
                Poll::Pending
            })
            .await
        });

        out
    }

    fn cancel(&mut self, id: HandleId) -> bool {
        let Some(slot) = self.state.transfers.remove(&id) else {
            return false;
        };
        match self.runtime.as_ref() {
            Some(runtime) => {
                let _guard = runtime.enter();
                drop(slot);
            }
            None => drop(slot),
        }
        true
    }

    fn active_count(&self) -> usize {
        self.state.transfers.len()
    }
}

impl Drop for MultiBackend {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        {
            let _guard = runtime.enter();
            self.state.transfers.clear();
        }
        runtime.shutdown_timeout(ABANDONED_DRAIN_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_tick_collects_events_in_order() {
        let mut backend = MultiBackend::new().unwrap();
        let id = HandleId::from_raw(1);
        let sink = backend.sink(id);
        backend.start(
            id,
            Box::pin(async move {
                sink.emit(TransferEvent::Resolving);
                tokio::time::sleep(Duration::from_millis(10)).await;
                sink.emit(TransferEvent::Failed(NetError::ConnectionRefused));
            }),
        );

        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while backend.active_count() > 0 && Instant::now() < deadline {
            events.extend(backend.tick(Duration::from_millis(100)));
        }
        events.extend(backend.tick(Duration::from_millis(1)));

        assert!(matches!(events[0], (i, TransferEvent::Resolving) if i == id));
        assert!(matches!(events.last(), Some((_, TransferEvent::Failed(_)))));
    }

    #[test]
    fn test_tick_respects_timeout() {
        let mut backend = MultiBackend::new().unwrap();
        let id = HandleId::from_raw(1);
        backend.start(id, Box::pin(std::future::pending()));

        let started = Instant::now();
        let events = backend.tick(Duration::from_millis(50));
        assert!(events.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(backend.active_count(), 1);
    }

    #[test]
    fn test_cancel_drops_future() {
        struct Flag(Arc<Mutex<bool>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                *self.0.lock().unwrap() = true;
            }
        }

        let mut backend = MultiBackend::new().unwrap();
        let dropped = Arc::new(Mutex::new(false));
        let flag = Flag(dropped.clone());
        let id = HandleId::from_raw(3);
        backend.start(
            id,
            Box::pin(async move {
                let _flag = flag;
                std::future::pending::<()>().await;
            }),
        );
        backend.tick(Duration::from_millis(1));

        assert!(backend.cancel(id));
        assert!(*dropped.lock().unwrap());
        assert!(!backend.cancel(id));
        assert_eq!(backend.active_count(), 0);
    }
}
