//! Worker event fan-out and listener dispatch.
//!
//! Every port gets its own unbounded queue, so no event is ever dropped for a
//! slow consumer. A publisher that needs to know when an event has been fully
//! handled (the sync loop, before it polls again) uses
//! [`EventHub::emit_and_wait`].

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::envelope::{SyncEvent, SyncEventType};

/// Boxed future returned by event listeners.
pub type ListenerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type Listener = Arc<dyn Fn(SyncEvent) -> ListenerFuture + Send + Sync>;
type ListenerMap = HashMap<SyncEventType, Listener>;

/// One event queued for a port.
///
/// When the publisher waits on it, dropping the delivery is the signal that
/// the port is done with it.
#[derive(Debug)]
pub struct EventDelivery {
    pub event: SyncEvent,
    handled: Option<oneshot::Sender<()>>,
}

impl EventDelivery {
    /// Unwrap the event, releasing the publisher immediately.
    pub fn into_event(self) -> SyncEvent {
        self.event
    }
}

/// Event stream of one port onto a worker.
pub type EventStream = mpsc::UnboundedReceiver<EventDelivery>;

/// Publisher side: fans each event out to every attached port, in order.
///
/// Ports whose stream was dropped are pruned on the next emit. A stream that
/// is held but never drained stalls [`EventHub::emit_and_wait`].
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<EventDelivery>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new port.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Queue `event` for every port without waiting.
    pub fn emit(&self, event: SyncEvent) {
        self.publish(event, false);
    }

    /// Queue `event` for every port and resolve once each of them has handled
    /// it or gone away.
    pub async fn emit_and_wait(&self, event: SyncEvent) {
        let pending = self.publish(event, true);
        for handled in pending {
            let _ = handled.await;
        }
    }

    fn publish(&self, event: SyncEvent, track: bool) -> Vec<oneshot::Receiver<()>> {
        let mut pending = Vec::new();
        self.lock().retain(|tx| {
            let handled = track.then(|| {
                let (handled, done) = oneshot::channel();
                pending.push(done);
                handled
            });
            let delivery = EventDelivery {
                event: event.clone(),
                handled,
            };
            // A failed send hands the delivery back and drops it, which also
            // releases its waiter.
            tx.send(delivery).is_ok()
        });
        pending
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<EventDelivery>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dispatches worker events to at most one listener per event type.
///
/// Events are handled in emission order and each listener future is awaited
/// before the next event is taken, so handlers never overlap. An event is
/// reported handled only after its listener finished.
pub struct EventBus {
    listeners: Arc<Mutex<ListenerMap>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Start dispatching events from `events`.
    pub fn attach(events: EventStream) -> Self {
        let listeners = Arc::new(Mutex::new(ListenerMap::new()));
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(events, Arc::clone(&listeners), stop.clone()));

        Self {
            listeners,
            stop,
            task,
        }
    }

    /// Register `handler` for `event_type`, replacing any earlier one.
    pub fn set_listener<F, Fut>(&self, event_type: SyncEventType, handler: F)
    where
        F: Fn(SyncEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: Listener =
            Arc::new(move |event| -> ListenerFuture { Box::pin(handler(event)) });
        if lock(&self.listeners).insert(event_type, listener).is_some() {
            debug!(?event_type, "replaced event listener");
        }
    }

    pub fn remove_listener(&self, event_type: SyncEventType) {
        lock(&self.listeners).remove(&event_type);
    }

    /// Stop dispatching. A handler that is already running completes; queued
    /// events are released unhandled.
    pub fn close(&self) {
        self.stop.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn lock(listeners: &Mutex<ListenerMap>) -> MutexGuard<'_, ListenerMap> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run(
    mut events: EventStream,
    listeners: Arc<Mutex<ListenerMap>>,
    stop: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            delivery = events.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    debug!("worker event stream closed");
                    break;
                }
            },
        };

        let EventDelivery { event, handled } = delivery;
        let kind = event.kind();
        let listener = lock(&listeners).get(&kind).cloned();
        match listener {
            Some(listener) => listener(event).await,
            None => trace!(event_type = ?kind, "no listener; event discarded"),
        }
        drop(handled);
    }
}
