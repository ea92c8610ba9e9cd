// Handle aggregation: pooled event-loop workers multiplexing many pollable handles.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Manages per-handle deadlines of a worker event loop.
///
/// Each key has at most one deadline; setting a new one replaces the previous.
#[derive(Debug)]
pub struct Deadlines<K: Copy + Ord> {
    by_time: BTreeSet<(Instant, K)>,
    by_key: BTreeMap<K, Instant>,
}

impl<K: Copy + Ord> Default for Deadlines<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Copy + Ord> Deadlines<K> {
    pub fn new() -> Self {
        Self {
            by_time: empty!(),
            by_key: empty!(),
        }
    }

    /// Return the number of deadlines being tracked.
    pub fn len(&self) -> usize { self.by_key.len() }

    /// Check whether there are deadlines being tracked.
    pub fn is_empty(&self) -> bool { self.by_key.is_empty() }

    /// Sets deadline for `key` to `span` after `now`.
    pub fn set(&mut self, key: K, span: Duration, now: Instant) {
        self.clear(key);
        let time = now + span;
        self.by_time.insert((time, key));
        self.by_key.insert(key, time);
    }

    /// Forgets the deadline of `key`, returning whether there was one.
    pub fn clear(&mut self, key: K) -> bool {
        match self.by_key.remove(&key) {
            Some(time) => self.by_time.remove(&(time, key)),
            None => false,
        }
    }

    /// Get the minimum time duration we should wait for at least one deadline to be reached.
    /// Returns `None` if there are no deadlines.
    ///
    /// ```
    /// # use std::time::{Duration, Instant};
    /// use aggregator::timeouts::Deadlines;
    ///
    /// let mut deadlines = Deadlines::new();
    ///
    /// let now = Instant::now();
    /// deadlines.set(1, Duration::from_secs(16), now);
    /// deadlines.set(2, Duration::from_secs(8), now);
    /// deadlines.set(3, Duration::from_secs(64), now);
    ///
    /// // We need to wait 8 secs to trigger the next deadline (2).
    /// assert_eq!(deadlines.next(now), Some(Duration::from_secs(8)));
    ///
    /// // ... sleep for a sec ...
    /// let later = now + Duration::from_secs(1);
    ///
    /// // Now we don't need to wait as long!
    /// assert_eq!(deadlines.next(later), Some(Duration::from_secs(7)));
    /// ```
    pub fn next(&self, now: Instant) -> Option<Duration> {
        self.by_time.iter().next().map(|(time, _)| time.saturating_duration_since(now))
    }

    /// Removes deadlines reached by `now`, returning their keys in deadline order.
    pub fn expire(&mut self, now: Instant) -> Vec<K> {
        let mut fired = Vec::new();
        while let Some(&(time, key)) = self.by_time.iter().next() {
            if time > now {
                break;
            }
            self.by_time.remove(&(time, key));
            self.by_key.remove(&key);
            fired.push(key);
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expire_exact() {
        let mut tm = Deadlines::new();

        let now = Instant::now();
        tm.set(1, Duration::from_secs(8), now);
        tm.set(2, Duration::from_secs(9), now);
        tm.set(3, Duration::from_secs(10), now);

        assert_eq!(tm.expire(now + Duration::from_secs(9)), vec![1, 2]);
        assert_eq!(tm.len(), 1);
    }

    #[test]
    fn test_expire() {
        let mut tm = Deadlines::new();

        let now = Instant::now();
        tm.set(1, Duration::from_secs(8), now);
        tm.set(2, Duration::from_secs(16), now);
        tm.set(3, Duration::from_secs(64), now);
        tm.set(4, Duration::from_secs(72), now);

        assert!(tm.expire(now).is_empty());
        assert_eq!(tm.len(), 4);

        assert_eq!(tm.expire(now + Duration::from_secs(9)), vec![1]);
        assert_eq!(tm.len(), 3, "one deadline has expired");

        assert_eq!(tm.expire(now + Duration::from_secs(66)), vec![2, 3]);
        assert_eq!(tm.len(), 1, "another two deadlines have expired");

        assert_eq!(tm.expire(now + Duration::from_secs(96)), vec![4]);
        assert!(tm.is_empty(), "all deadlines have expired");
    }

    #[test]
    fn test_rearm() {
        let mut tm = Deadlines::new();

        let now = Instant::now();
        tm.set(1, Duration::from_secs(8), now);
        tm.set(1, Duration::from_secs(20), now);
        assert_eq!(tm.len(), 1);
        assert_eq!(tm.next(now), Some(Duration::from_secs(20)));
        assert!(tm.expire(now + Duration::from_secs(10)).is_empty());

        assert!(tm.clear(1));
        assert!(!tm.clear(1));
        assert_eq!(tm.next(now), None);
    }

    #[test]
    fn test_overdue() {
        let mut tm = Deadlines::new();

        let now = Instant::now();
        tm.set(1, Duration::from_millis(5), now);
        assert_eq!(tm.next(now + Duration::from_secs(1)), Some(Duration::ZERO));
    }
}
