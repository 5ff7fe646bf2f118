// Copyright 2025 Buildwatch Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

const RING_SIZE: usize = 50;

/// A status string at a specific time.
#[derive(Clone, Debug)]
pub struct StatusEntry {
    pub status: String,
    pub at: DateTime<Utc>,
}

/// Ring buffer of timestamped status messages.
///
/// Written by the owning watcher, read by HTTP handler tasks; all access
/// goes through the internal mutex.
pub struct StatusRing {
    inner: Mutex<Ring>,
}

struct Ring {
    // next position to fill
    head: usize,
    // None means unpopulated
    entries: Vec<Option<StatusEntry>>,
}

impl StatusRing {
    pub fn new() -> Self {
        StatusRing {
            inner: Mutex::new(Ring {
                head: 0,
                entries: vec![None; RING_SIZE],
            }),
        }
    }

    pub fn add(&self, status: impl Into<String>) {
        let mut ring = self.inner.lock();
        let head = ring.head;
        ring.entries[head] = Some(StatusEntry {
            status: status.into(),
            at: Utc::now(),
        });
        ring.head = (head + 1) % RING_SIZE;
    }

    /// Visit entries newest-first, stopping at the first unpopulated slot.
    pub fn for_each_desc(&self, mut f: impl FnMut(&StatusEntry)) {
        let ring = self.inner.lock();
        let mut i = ring.head;
        loop {
            i = if i == 0 { RING_SIZE - 1 } else { i - 1 };
            if i == ring.head {
                return;
            }
            match &ring.entries[i] {
                Some(e) => f(e),
                None => return,
            }
        }
    }

    /// Clone the populated entries, newest first.
    pub fn snapshot_desc(&self) -> Vec<StatusEntry> {
        let mut out = Vec::new();
        self.for_each_desc(|e| out.push(e.clone()));
        out
    }
}

impl Default for StatusRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_first() {
        let ring = StatusRing::new();
        ring.add("a");
        ring.add("b");
        ring.add("c");
        let got: Vec<String> = ring.snapshot_desc().into_iter().map(|e| e.status).collect();
        assert_eq!(got, vec!["c", "b", "a"]);
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let ring = StatusRing::new();
        assert!(ring.snapshot_desc().is_empty());
    }

    #[test]
    fn wraps_and_overwrites_oldest() {
        let ring = StatusRing::new();
        for i in 0..60 {
            ring.add(format!("s{}", i));
        }
        let got = ring.snapshot_desc();
        // the ring holds RING_SIZE slots; iteration stops when it reaches
        // the head slot again, so at most RING_SIZE - 1 entries come back
        assert_eq!(got.len(), RING_SIZE - 1);
        assert_eq!(got[0].status, "s59");
        assert_eq!(got.last().map(|e| e.status.clone()), Some("s11".to_string()));
    }

    #[test]
    fn timestamps_descend() {
        let ring = StatusRing::new();
        for i in 0..5 {
            ring.add(format!("s{}", i));
        }
        let got = ring.snapshot_desc();
        for pair in got.windows(2) {
            assert!(pair[0].at >= pair[1].at);
        }
    }
}
