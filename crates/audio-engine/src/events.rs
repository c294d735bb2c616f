//! Telemetry bus between the engine and UI collaborators.
//!
//! Every subscriber owns one ordered queue. Publishing appends to each queue under a short
//! per-subscriber lock and never waits for the consumer. High-frequency events
//! ([`EngineEvent::is_lossy`]) are capped per subscriber and the oldest of them is dropped
//! first; state, track, underrun, queue and error events are always kept.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use audio_engine_types::{EngineEvent, EventKind};

struct SlotQueue {
    events: VecDeque<EngineEvent>,
    lossy: usize,
    dropped: u64,
    closed: bool,
}

struct SubscriberSlot {
    queue: Mutex<SlotQueue>,
    ready: Condvar,
    filter: Option<Vec<EventKind>>,
    lossy_capacity: usize,
}

impl SubscriberSlot {
    fn lock(&self) -> MutexGuard<'_, SlotQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepts(&self, kind: EventKind) -> bool {
        self.filter.as_ref().is_none_or(|kinds| kinds.contains(&kind))
    }

    fn push(&self, event: EngineEvent) {
        let mut q = self.lock();
        if q.closed {
            return;
        }
        if event.is_lossy() {
            q.lossy += 1;
            while q.lossy > self.lossy_capacity {
                match q.events.iter().position(EngineEvent::is_lossy) {
                    Some(idx) => {
                        q.events.remove(idx);
                        q.lossy -= 1;
                        q.dropped += 1;
                    }
                    None => break,
                }
            }
        }
        q.events.push_back(event);
        drop(q);
        self.ready.notify_one();
    }
}

struct BusInner {
    subscribers: Mutex<Vec<Weak<SubscriberSlot>>>,
    lossy_capacity: usize,
}

/// Cloneable publish handle.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// `lossy_capacity` bounds buffered position/analysis events per subscriber.
    pub fn new(lossy_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                lossy_capacity: lossy_capacity.max(1),
            }),
        }
    }

    /// Subscribe to every event kind.
    pub fn subscribe(&self) -> Subscription {
        self.register(None)
    }

    /// Subscribe to the listed event kinds only.
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> Subscription {
        self.register(Some(kinds.to_vec()))
    }

    fn register(&self, filter: Option<Vec<EventKind>>) -> Subscription {
        let slot = Arc::new(SubscriberSlot {
            queue: Mutex::new(SlotQueue {
                events: VecDeque::new(),
                lossy: 0,
                dropped: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            filter,
            lossy_capacity: self.inner.lossy_capacity,
        });
        self.subscribers().push(Arc::downgrade(&slot));
        Subscription { slot }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Weak<SubscriberSlot>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `event` to every live subscriber that wants it.
    pub fn publish(&self, event: EngineEvent) {
        let kind = event.kind();
        let live: Vec<Arc<SubscriberSlot>> = {
            let mut subs = self.subscribers();
            subs.retain(|w| w.strong_count() > 0);
            subs.iter().filter_map(Weak::upgrade).collect()
        };
        for slot in live.iter().filter(|s| s.accepts(kind)) {
            slot.push(event.clone());
        }
    }

    /// Wake every subscriber and stop delivering; used at engine shutdown.
    pub fn close(&self) {
        let live: Vec<Arc<SubscriberSlot>> = self
            .subscribers()
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        for slot in live {
            slot.lock().closed = true;
            slot.ready.notify_all();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers();
        subs.retain(|w| w.strong_count() > 0);
        subs.len()
    }
}

/// Receiving end held by one consumer. Dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<SubscriberSlot>,
}

impl Subscription {
    /// Next event, waiting up to `timeout`. `None` on timeout or after the bus closed.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        let deadline = Instant::now() + timeout;
        let mut q = self.slot.lock();
        loop {
            if let Some(event) = pop(&mut q) {
                return Some(event);
            }
            if q.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            q = self
                .slot
                .ready
                .wait_timeout(q, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn try_recv(&self) -> Option<EngineEvent> {
        pop(&mut self.slot.lock())
    }

    /// Everything queued right now, oldest first.
    pub fn drain(&self) -> Vec<EngineEvent> {
        let mut q = self.slot.lock();
        q.lossy = 0;
        q.events.drain(..).collect()
    }

    /// High-frequency events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.slot.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}

fn pop(q: &mut SlotQueue) -> Option<EngineEvent> {
    let event = q.events.pop_front()?;
    if event.is_lossy() {
        q.lossy -= 1;
    }
    Some(event)
}
