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

//! Worker event loop.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use std::{mem, thread};

use crossbeam_channel as chan;

use crate::poller::{FdSet, Poll, Waker, WakerRecv};
use crate::pool::{PoolLink, Retirement, WorkerId};
use crate::timeouts::Deadlines;
use crate::worker::controller::Ctl;
use crate::worker::Worker;
use crate::{AggregatedHandle, HandleId};

/// Pause after a failed readiness wait, so a persistent poll failure does not spin the thread.
const WAIT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Reason for a handle to leave a worker.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[display(doc_comments)]
pub enum Removal {
    /// removed by the aggregator
    Requested,
    /// initialization failed
    InitFailed,
    /// pre-read setup failed
    PreReadFailed,
    /// closed or failed on read
    Closed,
    /// timed out
    TimedOut,
    /// worker shutdown
    Shutdown,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Stage {
    /// `init` has succeeded, `pre_read` is still due.
    Initialized,
    /// `pre_read` has succeeded.
    Reading,
}

struct Slot<H> {
    handle: H,
    stage: Stage,
    /// Whether the handle descriptors are part of the readiness set the worker waits on.
    armed: bool,
}

/// Event loop of a single worker, run in its dedicated thread.
///
/// The runtime exclusively owns its handles: all handle callbacks are invoked from this loop only.
/// Changes of the handle list arrive as commands through the worker [`super::Controller`].
pub struct Runtime<H: AggregatedHandle + 'static, P: Poll + 'static> {
    id: WorkerId,
    poller: P,
    handles: BTreeMap<HandleId, Slot<H>>,
    list_changed: bool,
    interest: FdSet,
    ready: FdSet,
    deadlines: Deadlines<HandleId>,
    ctl_recv: chan::Receiver<Ctl<H>>,
    waker: <P::Waker as Waker>::Recv,
    link: PoolLink<Worker<H, P>>,
    retirement: Retirement,
    handover: chan::Sender<(HandleId, H)>,
}

impl<H: AggregatedHandle + 'static, P: Poll + 'static> Runtime<H, P> {
    pub(crate) fn new(
        id: WorkerId,
        ctl_recv: chan::Receiver<Ctl<H>>,
        waker: <P::Waker as Waker>::Recv,
        link: PoolLink<Worker<H, P>>,
        retirement: Retirement,
        handover: chan::Sender<(HandleId, H)>,
    ) -> Self {
        Runtime {
            id,
            poller: P::default(),
            handles: empty!(),
            list_changed: true,
            interest: FdSet::new(),
            ready: FdSet::new(),
            deadlines: Deadlines::new(),
            ctl_recv,
            waker,
            link,
            retirement,
            handover,
        }
    }

    pub fn id(&self) -> WorkerId { self.id }

    /// Executes worker event loop until shutdown or retirement.
    pub fn run(mut self) {
        #[cfg(feature = "log")]
        log::info!(target: "worker", "Entering event loop of {}", self.id);

        loop {
            if self.list_changed {
                self.rebuild();
            }

            let idle = self.handles.is_empty();
            if idle && self.retirement == Retirement::Immediate && self.try_retire() {
                return;
            }

            let timeout = if idle {
                match self.retirement {
                    Retirement::Idle(grace) => Some(grace),
                    Retirement::Never | Retirement::Immediate => None,
                }
            } else {
                self.deadlines.next(Instant::now())
            };

            // Blocking
            #[cfg(feature = "log")]
            log::trace!(target: "worker", "{} waits on {} handle(s) with timeout {timeout:?}", self.id, self.handles.len());

            let res = self.poller.wait(&mut self.ready, timeout);
            let now = Instant::now();

            let fired = match res {
                Ok(fired) => fired,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "worker", "Error during readiness wait of {}: {err}", self.id);
                    thread::sleep(WAIT_ERROR_BACKOFF);
                    0
                }
            };

            let mut orphaned = false;
            if self.ready.contains(self.waker.fd()) {
                #[cfg(feature = "log")]
                log::trace!(target: "worker", "{} awoken by the controller", self.id);

                orphaned = !self.waker.reset();
            }

            if !self.handle_commands() {
                return;
            }
            if orphaned {
                #[cfg(feature = "log")]
                log::warn!(target: "worker", "Controller of {} is gone", self.id);
                return self.shutdown();
            }

            if fired > 0 {
                self.dispatch(now);
            }
            self.expire(now);

            if idle &&
                fired == 0 &&
                self.handles.is_empty() &&
                matches!(self.retirement, Retirement::Idle(_)) &&
                self.try_retire()
            {
                return;
            }
        }
    }

    /// Rebuilds the readiness set from the current handle list plus the wake-up handle.
    fn rebuild(&mut self) {
        self.interest.clear();
        self.interest.insert(self.waker.fd());
        for slot in self.handles.values_mut() {
            slot.handle.add_fd(&mut self.interest);
            slot.armed = true;
        }
        self.poller.rebuild(&self.interest);
        self.list_changed = false;

        #[cfg(feature = "log")]
        log::trace!(target: "worker", "{} rebuilt its readiness set ({} descriptor(s))", self.id, self.interest.len());
    }

    /// Applies pending commands from the controller.
    ///
    /// # Returns
    ///
    /// Whether the worker must proceed operating (`true`) or has terminated (`false`).
    fn handle_commands(&mut self) -> bool {
        loop {
            match self.ctl_recv.try_recv() {
                Err(chan::TryRecvError::Empty) => return true,
                Err(chan::TryRecvError::Disconnected) => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "worker", "Control channel of {} is broken", self.id);
                    self.shutdown();
                    return false;
                }
                Ok(Ctl::Add(id, handle)) => self.insert(id, handle),
                Ok(Ctl::Remove(id)) => self.remove(id, Removal::Requested),
                Ok(Ctl::Shutdown) => {
                    self.shutdown();
                    return false;
                }
            }
        }
    }

    fn insert(&mut self, id: HandleId, mut handle: H) {
        debug_assert!(!self.handles.contains_key(&id), "handle {id} is registered twice");

        #[cfg(feature = "log")]
        log::debug!(target: "worker", "Registering handle {id} (fd={}) with {}", handle.fd(), self.id);

        if !handle.init() {
            self.finalize(id, handle, Removal::InitFailed);
            self.link.release(&id);
            return;
        }
        if let Some(timeout) = handle.timeout() {
            self.deadlines.set(id, timeout, Instant::now());
        }
        self.handles.insert(id, Slot {
            handle,
            stage: Stage::Initialized,
            armed: false,
        });
        self.list_changed = true;
    }

    /// Calls read callbacks of the ready handles.
    ///
    /// Handles which are done are collected during the pass and removed after it.
    fn dispatch(&mut self, now: Instant) {
        let mut removals = Vec::new();

        for (id, slot) in self.handles.iter_mut() {
            if !slot.armed || !slot.handle.is_fd_set(&self.ready) {
                continue;
            }

            if slot.stage == Stage::Initialized {
                if !slot.handle.pre_read() {
                    removals.push((*id, Removal::PreReadFailed));
                    continue;
                }
                slot.stage = Stage::Reading;
            }

            #[cfg(feature = "log")]
            log::trace!(target: "worker", "Handle {id} is ready for reading");

            if !slot.handle.on_read() {
                removals.push((*id, Removal::Closed));
                continue;
            }
            if let Some(timeout) = slot.handle.timeout() {
                self.deadlines.set(*id, timeout, now);
            }
        }

        for (id, reason) in removals {
            self.drop_handle(id, reason);
        }
    }

    /// Calls timeout callbacks of handles whose deadline has passed.
    fn expire(&mut self, now: Instant) {
        let mut removals = Vec::new();

        for id in self.deadlines.expire(now) {
            let Some(slot) = self.handles.get_mut(&id) else {
                continue;
            };

            #[cfg(feature = "log")]
            log::trace!(target: "worker", "Handle {id} timed out");

            if !slot.handle.on_timeout() {
                removals.push(id);
            } else if let Some(timeout) = slot.handle.timeout() {
                self.deadlines.set(id, timeout, now);
            }
        }

        for id in removals {
            self.drop_handle(id, Removal::TimedOut);
        }
    }

    /// Removes a handle which is done on its own and tells the pool about it.
    fn drop_handle(&mut self, id: HandleId, reason: Removal) {
        self.remove(id, reason);
        self.link.release(&id);
    }

    fn remove(&mut self, id: HandleId, reason: Removal) {
        let Some(slot) = self.handles.remove(&id) else {
            #[cfg(feature = "log")]
            log::trace!(target: "worker", "Handle {id} is already gone from {}", self.id);
            return;
        };
        self.deadlines.clear(id);
        self.list_changed = true;
        self.finalize(id, slot.handle, reason);
    }

    fn finalize(&self, id: HandleId, mut handle: H, reason: Removal) {
        #[cfg(feature = "log")]
        log::debug!(target: "worker", "Removing handle {id} from {}: {reason}", self.id);

        handle.deinit();
        if !handle.auto_delete() && self.handover.send((id, handle)).is_err() {
            #[cfg(feature = "log")]
            log::debug!(target: "worker", "Nobody takes handle {id} back; dropping it");
        }
    }

    fn try_retire(&mut self) -> bool {
        if !self.link.retire() {
            return false;
        }

        #[cfg(feature = "log")]
        log::info!(target: "worker", "{} retired", self.id);

        // No new handles are assigned to a retired worker; only removals of handles which are
        // already gone may still be queued.
        let pending = self.ctl_recv.try_iter().collect::<Vec<_>>();
        for ctl in pending {
            if let Ctl::Add(id, handle) = ctl {
                self.insert(id, handle);
            }
        }
        self.shutdown();
        true
    }

    fn shutdown(&mut self) {
        #[cfg(feature = "log")]
        log::info!(target: "worker", "Shutting down {} with {} handle(s)", self.id, self.handles.len());

        for (id, slot) in mem::take(&mut self.handles) {
            self.deadlines.clear(id);
            self.finalize(id, slot.handle, Removal::Shutdown);
        }
    }
}
