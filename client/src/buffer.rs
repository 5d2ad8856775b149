//! Time-windowed history of authoritative snapshots

use shared::{BulletState, PlayerState};
use std::collections::VecDeque;

/// How long snapshots are kept, in milliseconds
pub const BUFFER_WINDOW_MS: u64 = 500;
/// Hard cap on buffered snapshots
pub const BUFFER_CAPACITY: usize = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Local receipt time in milliseconds
    pub received_at: u64,
    pub tick: u32,
    pub players: Vec<PlayerState>,
    pub bullets: Vec<BulletState>,
}

impl Snapshot {
    pub fn player(&self, id: u32) -> Option<&PlayerState> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn bullet(&self, id: u32) -> Option<&BulletState> {
        self.bullets.iter().find(|b| b.id == id)
    }
}

/// Result of looking up a render time in the buffer
#[derive(Debug, PartialEq)]
pub enum Bracket<'a> {
    Empty,
    /// No pair surrounds the render time; the newest snapshot is the best guess
    Latest(&'a Snapshot),
    Between {
        from: &'a Snapshot,
        to: &'a Snapshot,
        alpha: f32,
    },
}

#[derive(Debug, Clone)]
pub struct SnapshotBuffer {
    snapshots: VecDeque<Snapshot>,
    window_ms: u64,
    capacity: usize,
}

impl Default for SnapshotBuffer {
    fn default() -> Self {
        Self::new(BUFFER_WINDOW_MS, BUFFER_CAPACITY)
    }
}

impl SnapshotBuffer {
    pub fn new(window_ms: u64, capacity: usize) -> Self {
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            window_ms,
            capacity: capacity.max(1),
        }
    }

    /// Appends a snapshot and drops everything outside the window
    ///
    /// Snapshots stamped earlier than the newest one already held are ignored
    /// so the buffer stays ordered by receipt time.
    pub fn push(&mut self, snapshot: Snapshot) {
        if let Some(last) = self.snapshots.back() {
            if snapshot.received_at < last.received_at {
                return;
            }
        }
        let newest = snapshot.received_at;
        self.snapshots.push_back(snapshot);

        while let Some(front) = self.snapshots.front() {
            let expired = newest - front.received_at >= self.window_ms;
            if expired || self.snapshots.len() > self.capacity {
                self.snapshots.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    /// Finds the two snapshots surrounding `render_time`
    pub fn bracket(&self, render_time: u64) -> Bracket<'_> {
        let Some(latest) = self.snapshots.back() else {
            return Bracket::Empty;
        };

        let pair = self
            .snapshots
            .iter()
            .zip(self.snapshots.iter().skip(1))
            .find(|(from, to)| from.received_at <= render_time && to.received_at >= render_time);

        match pair {
            Some((from, to)) => {
                let span = to.received_at - from.received_at;
                let alpha = if span > 0 {
                    (render_time - from.received_at) as f32 / span as f32
                } else {
                    0.0
                };
                Bracket::Between { from, to, alpha }
            }
            None => Bracket::Latest(latest),
        }
    }
}
