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

//! Aggregator workers: threads each running an event loop over a subset of handles.

#![allow(unused_variables)] // because we need them for feature-gated logger

mod controller;
mod runtime;

use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;

pub use self::controller::Controller;
pub use self::runtime::{Removal, Runtime};
use crate::poller::{Poll, Waker};
use crate::pool::{PoolWorker, WorkerContext, WorkerId};
use crate::{AggregatedHandle, HandleId};

/// Worker thread of a [`crate::HandleAggregator`] wrapping the worker [`Runtime`].
///
/// The worker owns the thread running the event loop and a [`Controller`] to send it handle list
/// changes.
pub struct Worker<H: AggregatedHandle + 'static, P: Poll + 'static> {
    id: WorkerId,
    thread: JoinHandle<()>,
    controller: Controller<H, <P::Waker as Waker>::Send>,
    load: usize,
}

impl<H: AggregatedHandle + 'static, P: Poll + 'static> Worker<H, P> {
    fn is_current_thread(&self) -> bool { self.thread.thread().id() == thread::current().id() }
}

impl<H: AggregatedHandle + 'static, P: Poll + 'static> PoolWorker for Worker<H, P> {
    type Key = HandleId;
    type Work = H;
    type Context = chan::Sender<(HandleId, H)>;

    /// Spawns the worker thread.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to create the wake-up signal or to spawn
    /// a thread.
    fn spawn(ctx: WorkerContext<Self>) -> io::Result<Self> {
        let WorkerContext {
            id,
            link,
            retirement,
            thread_name,
            context: handover,
        } = ctx;

        let (ctl_send, ctl_recv) = chan::unbounded();
        let (waker_writer, waker_reader) = <P::Waker as Waker>::pair()?;
        let controller = Controller::new(ctl_send, waker_writer);

        #[cfg(feature = "log")]
        log::debug!(target: "worker", "Initializing thread {thread_name} for {id}...");

        let thread = thread::Builder::new().name(thread_name).spawn(move || {
            let runtime = Runtime::<H, P>::new(id, ctl_recv, waker_reader, link, retirement, handover);
            runtime.run();
        })?;

        Ok(Worker {
            id,
            thread,
            controller,
            load: 0,
        })
    }

    fn id(&self) -> WorkerId { self.id }

    fn work_size(&self) -> usize { self.load }

    fn on_add_work(&mut self, key: HandleId, work: H) -> Result<(), H> {
        self.controller.add(key, work)?;
        self.load += 1;
        Ok(())
    }

    fn on_remove_work(&mut self, key: &HandleId) {
        self.load = self.load.saturating_sub(1);
        if let Err(err) = self.controller.remove(*key) {
            #[cfg(feature = "log")]
            log::error!(target: "worker", "Unable to ask {} to remove handle {key}: {err}", self.id);
        }
    }

    fn on_work_released(&mut self, _key: &HandleId) { self.load = self.load.saturating_sub(1); }

    fn stop(&self) {
        // Fails if the thread has already terminated, which is fine.
        let _ = self.controller.shutdown();
    }

    /// Shuts the worker down and joins its thread.
    ///
    /// When called from the worker thread itself (for instance, by a handle callback dropping the
    /// last reference to the aggregator) the worker is only signalled to stop.
    fn shutdown(self) {
        self.stop();

        if self.is_current_thread() {
            return;
        }
        if self.thread.join().is_err() {
            #[cfg(feature = "log")]
            log::error!(target: "worker", "Thread of {} has panicked", self.id);
        }
    }

    fn is_finished(&self) -> bool { self.thread.is_finished() }
}
