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

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::io;

use crossbeam_channel as chan;

use crate::poller::WakerSend;
use crate::HandleId;

pub(crate) enum Ctl<H> {
    Add(HandleId, H),
    Remove(HandleId),
    Shutdown,
}

/// Control API to a worker event loop.
///
/// Every change of the worker handle list is sent as a command to the worker thread, followed by
/// a wake-up, so a worker blocked in its readiness wait picks the change up immediately.
pub struct Controller<H, W: WakerSend> {
    ctl_send: chan::Sender<Ctl<H>>,
    waker: W,
}

impl<H, W: WakerSend> Clone for Controller<H, W> {
    fn clone(&self) -> Self {
        Controller {
            ctl_send: self.ctl_send.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<H, W: WakerSend> Controller<H, W> {
    pub(crate) fn new(ctl_send: chan::Sender<Ctl<H>>, waker: W) -> Self { Self { ctl_send, waker } }

    /// Hands a new handle over to the worker.
    ///
    /// # Error
    ///
    /// Returns the handle back if the worker thread has terminated.
    pub fn add(&self, id: HandleId, handle: H) -> Result<(), H> {
        #[cfg(feature = "log")]
        log::trace!(target: "worker-controller", "Sending handle {id} to the worker");

        if let Err(chan::SendError(ctl)) = self.ctl_send.send(Ctl::Add(id, handle)) {
            return match ctl {
                Ctl::Add(_, handle) => Err(handle),
                _ => unreachable!("returned command differs from the sent one"),
            };
        }
        self.wake_logged();
        Ok(())
    }

    /// Asks the worker to remove the handle.
    pub fn remove(&self, id: HandleId) -> Result<(), io::Error> {
        #[cfg(feature = "log")]
        log::trace!(target: "worker-controller", "Asking the worker to remove handle {id}");

        self.ctl_send.send(Ctl::Remove(id)).map_err(|_| io::ErrorKind::BrokenPipe)?;
        self.wake()
    }

    /// Asks the worker to finalize all of its handles and terminate.
    pub fn shutdown(&self) -> Result<(), io::Error> {
        #[cfg(feature = "log")]
        log::debug!(target: "worker-controller", "Initiating worker shutdown...");

        let res1 = self.ctl_send.send(Ctl::Shutdown).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe));
        let res2 = self.wake();
        res1.and(res2)
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::trace!(target: "worker-controller", "Wakening the worker");
        self.waker.wake()
    }

    fn wake_logged(&self) {
        if let Err(err) = self.wake() {
            #[cfg(feature = "log")]
            log::error!(target: "worker-controller", "Unable to wake the worker: {err}");
        }
    }
}
