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

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::poller::{FdSet, Poll, SocketWaker};

/// Readiness wait over `poll(2)` by using [`popol`] library.
pub struct Poller {
    sources: popol::Sources<RawFd>,
    events: Vec<popol::Event<RawFd>>,
}

impl Default for Poller {
    fn default() -> Self { Self::new() }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            sources: popol::Sources::new(),
            events: empty!(),
        }
    }
}

impl Poll for Poller {
    type Waker = SocketWaker;

    fn rebuild(&mut self, interest: &FdSet) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Rebuilding poll set with {} descriptor(s)", interest.len());

        self.sources = popol::Sources::with_capacity(interest.len());
        for fd in interest.iter() {
            self.sources.register(fd, &fd, popol::interest::READ);
        }
    }

    fn len(&self) -> usize { self.sources.len() }

    fn wait(&mut self, ready: &mut FdSet, timeout: Option<Duration>) -> io::Result<usize> {
        ready.clear();
        self.events.clear();

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Polling {} descriptor(s) with timeout {timeout:?}", self.sources.len());

        let timeout = match timeout {
            Some(duration) => popol::Timeout::After(duration),
            None => popol::Timeout::Never,
        };

        // Blocking call
        match self.sources.poll(&mut self.events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                #[cfg(feature = "log")]
                log::trace!(target: "popol", "Poll timed out with zero events generated");
                return Ok(0);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        // Only read interest is registered, so any fired event (readable, hang-up, error or an
        // invalid descriptor) means the owner has to look at the descriptor.
        for event in self.events.drain(..) {
            #[cfg(feature = "log")]
            {
                if event.is_hangup() || event.is_error() {
                    log::trace!(target: "popol", "Got hang-up or error for {}", event.key);
                }
            }
            ready.insert(event.key);
        }

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Poll resulted in {} ready descriptor(s)", ready.len());

        Ok(ready.len())
    }
}
