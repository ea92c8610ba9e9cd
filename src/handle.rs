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

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::poller::FdSet;

/// Identifier of a handle registered with a [`crate::HandleAggregator`].
///
/// Issued by the aggregator on registration and never reused during its lifetime.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("#{0}")]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn new(id: u64) -> Self { HandleId(id) }

    pub fn to_u64(self) -> u64 { self.0 }
}

/// A pollable unit of work serviced by an aggregator worker.
///
/// Once a handle is added to an aggregator it is moved into exactly one worker thread, and all of
/// its methods are called from that thread only, never concurrently. The calls follow a fixed
/// lifecycle:
///
/// 1. [`Self::init`], once, when the worker takes the handle;
/// 2. [`Self::pre_read`], once, on the first readiness of the handle descriptor;
/// 3. [`Self::on_read`], on every readiness (including the first one, right after `pre_read`);
/// 4. [`Self::on_timeout`], whenever [`Self::timeout`] elapses without readiness;
/// 5. [`Self::deinit`], exactly once, when the handle leaves the worker for whatever reason.
///
/// Returning `false` from any of `init`, `pre_read`, `on_read` or `on_timeout` removes the handle
/// from the worker (followed by `deinit`).
///
/// All callbacks run on the worker event loop and delay every other handle of the same worker
/// while they execute; work which may block for unbounded time must not be done inside them.
pub trait AggregatedHandle: Send {
    /// Primary descriptor of the handle.
    fn fd(&self) -> RawFd;

    /// Contributes descriptors to the readiness set a worker waits on.
    fn add_fd(&self, set: &mut FdSet) { set.insert(self.fd()); }

    /// Checks whether any of the handle descriptors is among the ready ones.
    fn is_fd_set(&self, ready: &FdSet) -> bool { ready.contains(self.fd()) }

    /// Time after which the worker calls [`Self::on_timeout`] if no readiness happened in between.
    /// `None` means the handle is woken by I/O only.
    fn timeout(&self) -> Option<Duration> { None }

    fn init(&mut self) -> bool { true }

    /// Handshake-style setup performed once before the first read.
    fn pre_read(&mut self) -> bool { true }

    /// Reads from the ready descriptor. `false` means the handle is done (closed or failed).
    fn on_read(&mut self) -> bool;

    fn on_timeout(&mut self) -> bool { true }

    /// Releases the handle resources. Called exactly once.
    fn deinit(&mut self) {}

    /// Whether the aggregator drops the handle after [`Self::deinit`]. Handles returning `false`
    /// are handed back through [`crate::HandleAggregator::handovers`] instead.
    fn auto_delete(&self) -> bool { true }
}

impl<H: AggregatedHandle + ?Sized> AggregatedHandle for Box<H> {
    fn fd(&self) -> RawFd { (**self).fd() }
    fn add_fd(&self, set: &mut FdSet) { (**self).add_fd(set) }
    fn is_fd_set(&self, ready: &FdSet) -> bool { (**self).is_fd_set(ready) }
    fn timeout(&self) -> Option<Duration> { (**self).timeout() }
    fn init(&mut self) -> bool { (**self).init() }
    fn pre_read(&mut self) -> bool { (**self).pre_read() }
    fn on_read(&mut self) -> bool { (**self).on_read() }
    fn on_timeout(&mut self) -> bool { (**self).on_timeout() }
    fn deinit(&mut self) { (**self).deinit() }
    fn auto_delete(&self) -> bool { (**self).auto_delete() }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Pair(RawFd, RawFd, usize);

    impl AggregatedHandle for Pair {
        fn fd(&self) -> RawFd { self.0 }
        fn add_fd(&self, set: &mut FdSet) {
            set.insert(self.0);
            set.insert(self.1);
        }
        fn is_fd_set(&self, ready: &FdSet) -> bool { ready.contains(self.0) || ready.contains(self.1) }
        fn on_read(&mut self) -> bool {
            self.2 += 1;
            true
        }
    }

    #[test]
    fn boxed_forwarding() {
        let mut handle: Box<dyn AggregatedHandle> = Box::new(Pair(10, 11, 0));
        let mut set = FdSet::new();
        handle.add_fd(&mut set);
        assert_eq!(set.max_fd(), Some(11));
        assert!(handle.is_fd_set(&FdSet::from_iter([11])));
        assert!(!handle.is_fd_set(&FdSet::from_iter([12])));
        assert!(handle.init() && handle.pre_read() && handle.on_read());
        assert!(handle.auto_delete());
        assert_eq!(handle.timeout(), None);
    }
}
