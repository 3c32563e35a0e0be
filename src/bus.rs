//! Typed publish/subscribe event bus
//!
//! Every subscriber owns exactly one inbound queue drained by exactly one
//! worker, so a subscriber sees events in strict publish order. Across
//! subscribers there is no ordering guarantee: two subscribers of the same
//! kind process their copies concurrently.
//!
//! Publishing an event kind nobody registered for is a wiring bug, not a
//! runtime condition, and panics the daemon.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::event::{Event, EventKind};

/// A component that handles its declared event kinds synchronously on its
/// own worker. Components that need async handling (the console front-end)
/// consume a [`Subscription`] directly instead.
pub trait Subscriber: Send + 'static {
    /// Name used in logs and queue registration.
    fn name(&self) -> &'static str;

    /// Event kinds routed to this subscriber's queue.
    fn kinds(&self) -> &'static [EventKind];

    /// Handle one event. Called in publish order for this subscriber.
    fn handle(&mut self, event: Event, bus: &Bus);
}

struct Registry {
    /// kind -> queues of every subscriber registered for that kind
    routes: HashMap<EventKind, Vec<mpsc::UnboundedSender<Event>>>,
    /// every subscriber queue, for the stop sentinel
    queues: Vec<(&'static str, mpsc::UnboundedSender<Event>)>,
}

/// Cheaply cloneable bus handle. Handlers publish follow-up events through
/// the same handle they were wired with.
#[derive(Clone)]
pub struct Bus {
    registry: Arc<Mutex<Registry>>,
}

/// One subscriber's private inbound queue.
pub struct Subscription {
    pub name: &'static str,
    pub rx: mpsc::UnboundedReceiver<Event>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                routes: HashMap::new(),
                queues: Vec::new(),
            })),
        }
    }

    /// Register a new subscriber queue for the given event kinds.
    pub fn subscribe(&self, name: &'static str, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock().expect("bus registry poisoned");
        for kind in kinds {
            registry.routes.entry(*kind).or_default().push(tx.clone());
        }
        registry.queues.push((name, tx));
        debug!("subscribed {} to {:?}", name, kinds);
        Subscription { name, rx }
    }

    /// Fan the event out to every queue registered for its kind. Never
    /// blocks beyond enqueuing.
    ///
    /// # Panics
    ///
    /// Panics if no subscriber ever registered for the event's kind: the
    /// subscription graph is wired once at startup, so a kindless publish
    /// means the daemon is misassembled.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let registry = self.registry.lock().expect("bus registry poisoned");
        let queues = registry
            .routes
            .get(&kind)
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| panic!("no subscriber registered for event kind {:?}", kind));
        for queue in queues {
            // A closed queue means its worker already stopped; during
            // shutdown that is expected, so drop the copy silently.
            let _ = queue.send(event.clone());
        }
    }

    /// Push the stop sentinel onto every subscriber's own queue. Each
    /// worker finishes its current item first; stopping one subscriber
    /// never affects another.
    pub fn shutdown(&self) {
        let registry = self.registry.lock().expect("bus registry poisoned");
        for (name, queue) in &registry.queues {
            debug!("stopping subscriber {}", name);
            let _ = queue.send(Event::Stop);
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire a [`Subscriber`] onto the bus and spawn its worker task. The
/// worker drains the queue in order and exits on the stop sentinel.
pub fn spawn_worker<S: Subscriber>(bus: &Bus, mut subscriber: S) -> JoinHandle<()> {
    let mut sub = bus.subscribe(subscriber.name(), subscriber.kinds());
    let bus = bus.clone();
    tokio::spawn(async move {
        while let Some(event) = sub.rx.recv().await {
            if matches!(event, Event::Stop) {
                break;
            }
            subscriber.handle(event, &bus);
        }
        debug!("worker {} stopped", sub.name);
    })
}

/// Report a kind this component never declared. Reaching this is a wiring
/// bug in the subscription table and must be loud.
pub fn unexpected_event(name: &str, event: &Event) -> ! {
    error!("{} received event it never registered for: {:?}", name, event);
    panic!("{} received unregistered event kind {:?}", name, event.kind());
}
