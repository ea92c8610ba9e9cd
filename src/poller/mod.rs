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

//! Readiness sets and the blocking wait primitives used by worker event loops.
//!
//! A worker describes what it waits for with an [`FdSet`], hands it to a [`Poll`] backend on
//! every change of its handle list, and then repeatedly blocks in [`Poll::wait`]. Which backend
//! is used is decided at compile time, see [`DefaultPoller`].

#[cfg(feature = "popol")]
pub mod popol;
pub mod select;
mod waker;

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub use waker::{SocketWaker, WakerReader, WakerWriter};

/// Readiness backend selected by the crate features: [`popol::Poller`] when `popol` is enabled,
/// [`select::Poller`] otherwise.
#[cfg(feature = "popol")]
pub type DefaultPoller = popol::Poller;
#[cfg(not(feature = "popol"))]
pub type DefaultPoller = select::Poller;

/// Set of file descriptors; the portable counterpart of the POSIX `fd_set`.
///
/// Used both to describe descriptors a worker waits on and to report the ones which became ready.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct FdSet(BTreeSet<RawFd>);

impl FdSet {
    pub fn new() -> Self { FdSet(empty!()) }

    /// Adds descriptor to the set, returning whether it was not present before.
    pub fn insert(&mut self, fd: RawFd) -> bool { self.0.insert(fd) }

    pub fn remove(&mut self, fd: RawFd) -> bool { self.0.remove(&fd) }

    pub fn contains(&self, fd: RawFd) -> bool { self.0.contains(&fd) }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn clear(&mut self) { self.0.clear() }

    /// Highest descriptor in the set, as needed for the `nfds` argument of `select(2)`.
    pub fn max_fd(&self) -> Option<RawFd> { self.0.iter().next_back().copied() }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ { self.0.iter().copied() }
}

impl FromIterator<RawFd> for FdSet {
    fn from_iter<T: IntoIterator<Item = RawFd>>(iter: T) -> Self { FdSet(iter.into_iter().collect()) }
}

impl Extend<RawFd> for FdSet {
    fn extend<T: IntoIterator<Item = RawFd>>(&mut self, iter: T) { self.0.extend(iter) }
}

impl IntoIterator for FdSet {
    type Item = RawFd;
    type IntoIter = btree_set::IntoIter<RawFd>;

    fn into_iter(self) -> Self::IntoIter { self.0.into_iter() }
}

/// Sending side of a wake-up signal. May be cloned and used from any thread.
pub trait WakerSend: Send + Sync + Clone {
    /// Makes the paired [`WakerRecv`] readable, interrupting a wait it takes part in.
    fn wake(&self) -> io::Result<()>;
}

/// Receiving side of a wake-up signal, polled together with the worker handles.
pub trait WakerRecv: Send {
    /// Descriptor which becomes readable when woken.
    fn fd(&self) -> RawFd;

    /// Consumes all pending wake-ups.
    ///
    /// # Returns
    ///
    /// `false` if all sending sides are gone and no wake-up can arrive anymore.
    fn reset(&self) -> bool;
}

/// Factory for connected wake-up signal pairs.
pub trait Waker {
    type Send: WakerSend;
    type Recv: WakerRecv;

    fn pair() -> io::Result<(Self::Send, Self::Recv)>;
}

/// Blocking readiness wait over a set of descriptors.
///
/// All descriptors are watched for readability only; hang-ups and errors are reported as
/// readiness, so that the owner of the descriptor learns about them from its next read.
pub trait Poll: Send + Default {
    /// Wake-up signal working with this backend.
    type Waker: Waker;

    /// Replaces the set of watched descriptors.
    fn rebuild(&mut self, interest: &FdSet);

    /// Number of watched descriptors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool { self.len() == 0 }

    /// Blocks until at least one watched descriptor is ready or the timeout elapses (`None` waits
    /// forever). The ready descriptors replace the content of `ready`.
    ///
    /// # Returns
    ///
    /// Number of ready descriptors; zero on timeout or when interrupted by a signal.
    fn wait(&mut self, ready: &mut FdSet, timeout: Option<Duration>) -> io::Result<usize>;
}
