//! Upcoming-track queue and bounded playback history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use audio_engine_types::{EngineEvent, QueueSnapshot, Track};

use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;

/// Most recent tracks kept for `previous()`.
pub const HISTORY_CAPACITY: usize = 15;

#[derive(Default)]
struct QueueState {
    items: VecDeque<Track>,
    /// Oldest first.
    history: VecDeque<Track>,
}

/// Shared queue/history store. Clones refer to the same queue.
///
/// Every mutation publishes [`EngineEvent::QueueChanged`].
#[derive(Clone)]
pub struct QueueCoordinator {
    state: Arc<Mutex<QueueState>>,
    bus: EventBus,
}

impl QueueCoordinator {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self) {
        self.bus.publish(EngineEvent::QueueChanged);
    }

    /// Append to the end of the queue.
    pub fn enqueue(&self, track: Track) {
        self.lock().items.push_back(track);
        self.changed();
    }

    /// Insert at `index` (`index == len` appends).
    pub fn insert(&self, index: usize, track: Track) -> EngineResult<()> {
        {
            let mut st = self.lock();
            let len = st.items.len();
            if index > len {
                return Err(EngineError::InvalidIndex { index, len });
            }
            st.items.insert(index, track);
        }
        self.changed();
        Ok(())
    }

    /// Put a track back at the head, ahead of everything queued.
    pub fn push_front(&self, track: Track) {
        self.lock().items.push_front(track);
        self.changed();
    }

    /// Take the head of the queue.
    pub fn dequeue_next(&self) -> EngineResult<Track> {
        let track = self.lock().items.pop_front().ok_or(EngineError::EmptyQueue)?;
        self.changed();
        Ok(track)
    }

    /// Move the entry at `from` so it ends up at index `to`.
    pub fn reorder(&self, from: usize, to: usize) -> EngineResult<()> {
        {
            let mut st = self.lock();
            let len = st.items.len();
            if from >= len {
                return Err(EngineError::InvalidIndex { index: from, len });
            }
            if to >= len {
                return Err(EngineError::InvalidIndex { index: to, len });
            }
            if from == to {
                return Ok(());
            }
            if let Some(track) = st.items.remove(from) {
                st.items.insert(to, track);
            }
        }
        self.changed();
        Ok(())
    }

    /// Remove and return the entry at `index`.
    ///
    /// The active track is not in the queue, so removing entries never interrupts playback.
    pub fn remove(&self, index: usize) -> EngineResult<Track> {
        let track = {
            let mut st = self.lock();
            let len = st.items.len();
            st.items
                .remove(index)
                .ok_or(EngineError::InvalidIndex { index, len })?
        };
        self.changed();
        Ok(track)
    }

    pub fn clear(&self) {
        self.lock().items.clear();
        self.changed();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Upcoming tracks, head first.
    pub fn items(&self) -> Vec<Track> {
        self.lock().items.iter().cloned().collect()
    }

    /// Record a finished track, evicting the oldest beyond [`HISTORY_CAPACITY`].
    pub fn push_history(&self, track: Track) {
        {
            let mut st = self.lock();
            st.history.push_back(track);
            while st.history.len() > HISTORY_CAPACITY {
                st.history.pop_front();
            }
        }
        self.changed();
    }

    /// Take the most recently finished track.
    pub fn previous(&self) -> EngineResult<Track> {
        let track = self
            .lock()
            .history
            .pop_back()
            .ok_or(EngineError::EmptyHistory)?;
        self.changed();
        Ok(track)
    }

    pub fn has_previous(&self) -> bool {
        !self.lock().history.is_empty()
    }

    /// History, oldest first.
    pub fn history(&self) -> Vec<Track> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let st = self.lock();
        QueueSnapshot {
            upcoming: st.items.iter().cloned().collect(),
            history: st.history.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(name: &str) -> Track {
        Track::from_path(format!("/music/{name}.flac"))
    }

    fn names(tracks: &[Track]) -> Vec<String> {
        tracks
            .iter()
            .map(|t| t.path.file_stem().unwrap().to_string_lossy().to_string())
            .collect()
    }

    fn queue_with(items: &[&str]) -> QueueCoordinator {
        let q = QueueCoordinator::new(EventBus::new(8));
        for n in items {
            q.enqueue(track(n));
        }
        q
    }

    #[test]
    fn dequeue_follows_insertion_order() {
        let q = queue_with(&["a", "b", "c"]);
        assert_eq!(q.dequeue_next().unwrap(), track("a"));
        assert_eq!(q.dequeue_next().unwrap(), track("b"));
        assert_eq!(q.dequeue_next().unwrap(), track("c"));
        assert!(matches!(q.dequeue_next(), Err(EngineError::EmptyQueue)));
    }

    #[test]
    fn reorder_moves_entry() {
        let q = queue_with(&["a", "b", "c", "d"]);
        q.reorder(0, 2).unwrap();
        assert_eq!(names(&q.items()), ["b", "c", "a", "d"]);
        q.reorder(3, 0).unwrap();
        assert_eq!(names(&q.items()), ["d", "b", "c", "a"]);
        assert!(matches!(
            q.reorder(4, 0),
            Err(EngineError::InvalidIndex { index: 4, len: 4 })
        ));
    }

    #[test]
    fn remove_and_insert_validate_indices() {
        let q = queue_with(&["a", "b"]);
        assert_eq!(q.remove(1).unwrap(), track("b"));
        assert!(matches!(q.remove(1), Err(EngineError::InvalidIndex { .. })));
        q.insert(0, track("z")).unwrap();
        q.insert(2, track("y")).unwrap();
        assert_eq!(names(&q.items()), ["z", "a", "y"]);
        assert!(q.insert(9, track("x")).is_err());
    }

    #[test]
    fn history_is_capped_and_evicts_oldest() {
        let q = queue_with(&[]);
        for i in 0..HISTORY_CAPACITY {
            q.push_history(track(&format!("t{i}")));
        }
        assert_eq!(q.history().len(), HISTORY_CAPACITY);
        q.push_history(track("t15"));
        let history = q.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0], track("t1"));
        assert_eq!(history[HISTORY_CAPACITY - 1], track("t15"));
    }

    #[test]
    fn previous_pops_newest() {
        let q = queue_with(&[]);
        assert!(matches!(q.previous(), Err(EngineError::EmptyHistory)));
        q.push_history(track("a"));
        q.push_history(track("b"));
        assert!(q.has_previous());
        assert_eq!(q.previous().unwrap(), track("b"));
        assert_eq!(q.previous().unwrap(), track("a"));
        assert!(!q.has_previous());
    }

    #[test]
    fn mutations_publish_queue_changed() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe();
        let q = QueueCoordinator::new(bus);
        q.enqueue(track("a"));
        q.push_front(track("b"));
        q.clear();
        assert_eq!(sub.drain(), vec![EngineEvent::QueueChanged; 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn snapshot_serializes_both_lists() {
        let q = queue_with(&["a"]);
        q.push_history(track("h"));
        let snap = q.snapshot();
        assert_eq!(names(&snap.upcoming), ["a"]);
        assert_eq!(names(&snap.history), ["h"]);
    }
}
