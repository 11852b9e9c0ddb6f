//! Playback queue with shuffle, repeat and change notifications.
//!
//! The queue itself is a plain data structure; the owning source wraps it
//! in its own lock, acts on the returned outcomes (start playback, stop
//! when emptied) and publishes the returned [`QueueChange`]s on the bus,
//! so change events always follow the mutation in causal order.

use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::{Error, Result};

/// One queue entry, as exposed to the control surface.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration: Option<Duration>,
    pub album_art_url: Option<String>,
    /// Zero-based position at snapshot time
    pub index: usize,
    /// True for exactly one item while the queue is non-empty
    pub is_current: bool,
}

/// Track data used when enqueueing (index/current assigned by the queue).
#[derive(Debug, Clone, Default)]
pub struct TrackEntry {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration: Option<Duration>,
    pub album_art_url: Option<String>,
}

/// Kinds of queue mutation, carried on `QueueChanged` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum QueueChangeType {
    Added,
    Removed,
    Moved,
    Cleared,
    CurrentChanged,
}

/// A single queue mutation notification.
#[derive(Debug, Clone)]
pub struct QueueChange {
    pub change_type: QueueChangeType,
    pub affected_index: Option<usize>,
    pub affected_item: Option<QueueItem>,
}

impl QueueChange {
    fn new(change_type: QueueChangeType, index: Option<usize>, item: Option<QueueItem>) -> Self {
        Self {
            change_type,
            affected_index: index,
            affected_item: item,
        }
    }
}

/// Repeat mode for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    /// Repeat current track
    One,
    /// Repeat entire queue
    All,
}

impl RepeatMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "one" => Ok(Self::One),
            "all" => Ok(Self::All),
            other => Err(Error::invalid_argument(format!("unknown repeat mode: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::One => "one",
            Self::All => "all",
        }
    }
}

/// What the caller should do after a navigation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Load and play the item now at this index
    Item(usize),
    /// Re-seek the current item to 0 and keep playing
    RestartCurrent,
    /// End of queue: stop playback
    EndOfQueue,
}

/// Outcome of removing an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// The removed item was not current
    Unaffected,
    /// The current item was removed; this index is the new current
    CurrentMoved(usize),
    /// The queue is now empty; playback should stop
    BecameEmpty,
}

/// The play queue with current position, shuffle and repeat.
#[derive(Debug, Default)]
pub struct PlayQueue {
    items: Vec<TrackEntry>,
    /// Current position (-1 = empty / not started)
    current: i32,
    /// Insertion-order ids, kept for deterministic un-shuffle
    insertion_order: Vec<String>,
    shuffled: bool,
    repeat: RepeatMode,
}

impl PlayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn current_index(&self) -> Option<usize> {
        (self.current >= 0).then_some(self.current as usize)
    }

    pub fn current_entry(&self) -> Option<&TrackEntry> {
        self.current_index().and_then(|i| self.items.get(i))
    }

    pub fn shuffled(&self) -> bool {
        self.shuffled
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, mode: RepeatMode) {
        self.repeat = mode;
    }

    /// Snapshot all items with index and is_current filled in.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.items
            .iter()
            .enumerate()
            .map(|(index, e)| self.view(e, index))
            .collect()
    }

    fn view(&self, entry: &TrackEntry, index: usize) -> QueueItem {
        QueueItem {
            id: entry.id.clone(),
            title: entry.title.clone(),
            artist: entry.artist.clone(),
            album: entry.album.clone(),
            duration: entry.duration,
            album_art_url: entry.album_art_url.clone(),
            index,
            is_current: self.current == index as i32,
        }
    }

    /// Append, or insert at `position` shifting later items.
    pub fn add(&mut self, entry: TrackEntry, position: Option<usize>) -> Result<QueueChange> {
        let index = match position {
            Some(p) => {
                if p > self.items.len() {
                    return Err(index_out_of_range(p, self.items.len()));
                }
                p
            }
            None => self.items.len(),
        };

        self.insertion_order.push(entry.id.clone());
        self.items.insert(index, entry);
        if self.current >= index as i32 {
            self.current += 1;
        }
        // First item added to an empty queue becomes current
        if self.current < 0 {
            self.current = 0;
        }

        let item = self.view(&self.items[index], index);
        Ok(QueueChange::new(QueueChangeType::Added, Some(index), Some(item)))
    }

    /// Remove by index. See [`RemovalOutcome`] for what the caller does next.
    pub fn remove(&mut self, index: usize) -> Result<(QueueChange, RemovalOutcome)> {
        if index >= self.items.len() {
            return Err(index_out_of_range(index, self.items.len()));
        }

        let removed = self.items.remove(index);
        self.insertion_order.retain(|id| id != &removed.id);
        let was_current = self.current == index as i32;

        let outcome = if self.items.is_empty() {
            self.current = -1;
            RemovalOutcome::BecameEmpty
        } else if was_current {
            // The item after the removed one slides into its index; wrap
            // according to repeat mode at the tail.
            let next = if (index as i32) < self.items.len() as i32 {
                index
            } else if self.repeat == RepeatMode::All {
                0
            } else {
                self.items.len() - 1
            };
            self.current = next as i32;
            RemovalOutcome::CurrentMoved(next)
        } else {
            if self.current > index as i32 {
                self.current -= 1;
            }
            RemovalOutcome::Unaffected
        };

        let item = QueueItem {
            id: removed.id,
            title: removed.title,
            artist: removed.artist,
            album: removed.album,
            duration: removed.duration,
            album_art_url: removed.album_art_url,
            index,
            is_current: was_current,
        };
        Ok((
            QueueChange::new(QueueChangeType::Removed, Some(index), Some(item)),
            outcome,
        ))
    }

    /// Clear everything; playback should stop.
    pub fn clear(&mut self) -> QueueChange {
        self.items.clear();
        self.insertion_order.clear();
        self.current = -1;
        QueueChange::new(QueueChangeType::Cleared, None, None)
    }

    /// Move an item; the current pointer follows the item it points at.
    pub fn move_item(&mut self, from: usize, to: usize) -> Result<QueueChange> {
        let len = self.items.len();
        if from >= len {
            return Err(index_out_of_range(from, len));
        }
        if to >= len {
            return Err(index_out_of_range(to, len));
        }
        if from != to {
            let entry = self.items.remove(from);
            self.items.insert(to, entry);

            let pos = self.current;
            if pos == from as i32 {
                self.current = to as i32;
            } else if (from as i32) < pos && to as i32 >= pos {
                self.current -= 1;
            } else if from as i32 > pos && to as i32 <= pos {
                self.current += 1;
            }
        }
        let item = self.view(&self.items[to], to);
        Ok(QueueChange::new(QueueChangeType::Moved, Some(to), Some(item)))
    }

    /// Jump to an index; the caller starts playback of the returned item.
    pub fn jump_to(&mut self, index: usize) -> Result<QueueChange> {
        if index >= self.items.len() {
            return Err(index_out_of_range(index, self.items.len()));
        }
        self.current = index as i32;
        let item = self.view(&self.items[index], index);
        Ok(QueueChange::new(
            QueueChangeType::CurrentChanged,
            Some(index),
            Some(item),
        ))
    }

    /// Advance for `next()`.
    pub fn advance_next(&mut self) -> Advance {
        if self.items.is_empty() {
            return Advance::EndOfQueue;
        }
        match self.repeat {
            RepeatMode::One => Advance::RestartCurrent,
            RepeatMode::All => {
                self.current = (self.current + 1).rem_euclid(self.items.len() as i32);
                Advance::Item(self.current as usize)
            }
            RepeatMode::Off => {
                if self.current + 1 >= self.items.len() as i32 {
                    Advance::EndOfQueue
                } else {
                    self.current += 1;
                    Advance::Item(self.current as usize)
                }
            }
        }
    }

    /// Advance for `previous()` once the caller has applied the 3-second
    /// restart rule.
    pub fn advance_previous(&mut self) -> Advance {
        if self.items.is_empty() {
            return Advance::EndOfQueue;
        }
        match self.repeat {
            RepeatMode::One => Advance::RestartCurrent,
            RepeatMode::All => {
                self.current = (self.current - 1).rem_euclid(self.items.len() as i32);
                Advance::Item(self.current as usize)
            }
            RepeatMode::Off => {
                if self.current <= 0 {
                    self.current = 0.max(self.current);
                    Advance::RestartCurrent
                } else {
                    self.current -= 1;
                    Advance::Item(self.current as usize)
                }
            }
        }
    }

    /// Enable shuffle: items after the current one are reshuffled
    /// uniformly (the whole list when nothing is current). The same seed
    /// always produces the same permutation.
    pub fn set_shuffle(&mut self, enabled: bool, seed: Option<u64>) -> Option<QueueChange> {
        if enabled == self.shuffled {
            return None;
        }
        self.shuffled = enabled;

        if enabled {
            let mut rng = match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_os_rng(),
            };
            let start = self.current_index().map_or(0, |i| i + 1);
            self.items[start..].shuffle(&mut rng);
        } else {
            // Restore insertion order, keeping the same current item
            let current_id = self.current_entry().map(|e| e.id.clone());
            let order = self.insertion_order.clone();
            self.items.sort_by_key(|e| {
                order.iter().position(|id| id == &e.id).unwrap_or(usize::MAX)
            });
            if let Some(id) = current_id {
                if let Some(pos) = self.items.iter().position(|e| e.id == id) {
                    self.current = pos as i32;
                }
            }
        }

        let item = self
            .current_index()
            .map(|i| self.view(&self.items[i], i));
        Some(QueueChange::new(
            QueueChangeType::CurrentChanged,
            self.current_index(),
            item,
        ))
    }
}

fn index_out_of_range(index: usize, len: usize) -> Error {
    Error::invalid_argument(format!("index {index} out of range (queue length {len})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(id: &str) -> TrackEntry {
        TrackEntry {
            id: id.to_string(),
            title: id.to_string(),
            ..Default::default()
        }
    }

    fn filled(n: usize) -> PlayQueue {
        let mut q = PlayQueue::new();
        for i in 0..n {
            q.add(entry(&format!("t{i}")), None).unwrap();
        }
        q
    }

    #[test]
    fn test_add_remove_round_trip() {
        let mut q = filled(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.current_index(), Some(0));

        let (change, outcome) = q.remove(1).unwrap();
        assert_eq!(change.change_type, QueueChangeType::Removed);
        assert_eq!(outcome, RemovalOutcome::Unaffected);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_insert_at_position_shifts() {
        let mut q = filled(2);
        q.jump_to(1).unwrap();
        q.add(entry("mid"), Some(1)).unwrap();
        assert_eq!(q.snapshot()[1].id, "mid");
        // Current pointer still on the same track
        assert_eq!(q.current_entry().unwrap().id, "t1");
    }

    #[test]
    fn test_remove_current_continues_with_next() {
        let mut q = filled(3);
        q.jump_to(1).unwrap();
        let (_, outcome) = q.remove(1).unwrap();
        assert_eq!(outcome, RemovalOutcome::CurrentMoved(1));
        assert_eq!(q.current_entry().unwrap().id, "t2");
    }

    #[test]
    fn test_remove_last_current_wraps_under_repeat_all() {
        let mut q = filled(3);
        q.set_repeat(RepeatMode::All);
        q.jump_to(2).unwrap();
        let (_, outcome) = q.remove(2).unwrap();
        assert_eq!(outcome, RemovalOutcome::CurrentMoved(0));
    }

    #[test]
    fn test_remove_to_empty() {
        let mut q = filled(1);
        let (_, outcome) = q.remove(0).unwrap();
        assert_eq!(outcome, RemovalOutcome::BecameEmpty);
        assert_eq!(q.current_index(), None);
    }

    #[test]
    fn test_clear_resets_current() {
        let mut q = filled(3);
        let change = q.clear();
        assert_eq!(change.change_type, QueueChangeType::Cleared);
        assert!(q.is_empty());
        assert_eq!(q.current_index(), None);
    }

    #[test]
    fn test_move_preserves_current_item() {
        let mut q = filled(4);
        q.jump_to(2).unwrap();
        q.move_item(0, 3).unwrap();
        assert_eq!(q.current_entry().unwrap().id, "t2");
        q.move_item(q.current_index().unwrap(), 0).unwrap();
        assert_eq!(q.current_entry().unwrap().id, "t2");
        assert_eq!(q.current_index(), Some(0));
    }

    #[test]
    fn test_next_repeat_off_ends() {
        let mut q = filled(2);
        assert_eq!(q.advance_next(), Advance::Item(1));
        assert_eq!(q.advance_next(), Advance::EndOfQueue);
    }

    #[test]
    fn test_next_repeat_all_wraps() {
        let mut q = filled(2);
        q.set_repeat(RepeatMode::All);
        q.advance_next();
        assert_eq!(q.advance_next(), Advance::Item(0));
    }

    #[test]
    fn test_next_repeat_one_restarts() {
        let mut q = filled(2);
        q.set_repeat(RepeatMode::One);
        assert_eq!(q.advance_next(), Advance::RestartCurrent);
        assert_eq!(q.current_index(), Some(0));
    }

    #[test]
    fn test_previous_at_start_restarts() {
        let mut q = filled(2);
        assert_eq!(q.advance_previous(), Advance::RestartCurrent);
    }

    #[test]
    fn test_previous_wraps_under_repeat_all() {
        let mut q = filled(3);
        q.set_repeat(RepeatMode::All);
        assert_eq!(q.advance_previous(), Advance::Item(2));
    }

    #[test]
    fn test_shuffle_deterministic_and_restores() {
        let mut q = filled(5);
        let original: Vec<String> = q.snapshot().iter().map(|i| i.id.clone()).collect();

        q.set_shuffle(true, Some(42));
        let first: Vec<String> = q.snapshot().iter().map(|i| i.id.clone()).collect();

        q.set_shuffle(false, None);
        let restored: Vec<String> = q.snapshot().iter().map(|i| i.id.clone()).collect();
        assert_eq!(restored, original);

        q.set_shuffle(true, Some(42));
        let second: Vec<String> = q.snapshot().iter().map(|i| i.id.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_out_of_range_errors() {
        let mut q = filled(2);
        assert!(q.remove(2).is_err());
        assert!(q.jump_to(5).is_err());
        assert!(q.move_item(0, 2).is_err());
        assert!(q.add(entry("x"), Some(9)).is_err());
    }

    proptest! {
        /// After any mutation sequence: current stays in [-1, len-1] and
        /// at most one snapshot item is current.
        #[test]
        fn prop_queue_invariants(ops in proptest::collection::vec(0u8..6, 0..60)) {
            let mut q = PlayQueue::new();
            let mut counter = 0usize;
            for op in ops {
                match op {
                    0 => {
                        counter += 1;
                        let _ = q.add(entry(&format!("x{counter}")), None);
                    }
                    1 => { if !q.is_empty() { let _ = q.remove(counter % q.len()); } }
                    2 => { let _ = q.clear(); }
                    3 => { if !q.is_empty() { let _ = q.jump_to(counter % q.len()); } }
                    4 => { let _ = q.advance_next(); }
                    _ => { let _ = q.advance_previous(); }
                }
                let len = q.len() as i32;
                prop_assert!(q.current >= -1 && q.current < len.max(1));
                let snapshot = q.snapshot();
                let current_count = snapshot.iter().filter(|i| i.is_current).count();
                prop_assert!(current_count <= 1);
                if !snapshot.is_empty() && q.current >= 0 {
                    prop_assert_eq!(current_count, 1);
                }
            }
        }
    }
}
