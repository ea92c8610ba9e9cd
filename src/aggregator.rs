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

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel as chan;

use crate::poller::{DefaultPoller, Poll};
use crate::pool::{AddError, PoolConfig, ThreadPool, WorkerId};
use crate::worker::Worker;
use crate::{AggregatedHandle, HandleId};

/// Multiplexes many handles over a bounded pool of worker threads.
///
/// Each added handle is assigned to one worker, which waits for readiness of the handle together
/// with all its other handles and calls the handle callbacks (see [`AggregatedHandle`]). Workers
/// are spawned on demand up to [`PoolConfig::max_workers`] and are retired according to
/// [`PoolConfig::retirement`].
///
/// The aggregator may be shared between threads (e.g. inside an [`std::sync::Arc`]); adding and
/// removing handles from handle callbacks is supported as well.
pub struct HandleAggregator<H: AggregatedHandle + 'static, P: Poll + 'static = DefaultPoller> {
    pool: ThreadPool<Worker<H, P>>,
    next_id: AtomicU64,
    handovers: chan::Receiver<(HandleId, H)>,
}

impl<H: AggregatedHandle + 'static, P: Poll + 'static> HandleAggregator<H, P> {
    pub fn new(config: PoolConfig) -> Self {
        let (handover_send, handovers) = chan::unbounded();
        HandleAggregator {
            pool: ThreadPool::new(config, handover_send),
            next_id: AtomicU64::new(1),
            handovers,
        }
    }

    /// Aggregator with at most `max_workers` threads, each servicing at most
    /// `max_handles_per_worker` handles (zero for no per-worker limit).
    pub fn with_limits(max_workers: usize, max_handles_per_worker: usize) -> Self {
        Self::new(PoolConfig::with_limits(max_workers, max_handles_per_worker))
    }

    pub fn config(&self) -> &PoolConfig { self.pool.config() }

    /// Registers a handle with one of the workers.
    ///
    /// # Error
    ///
    /// Returns the handle back if the pool is at capacity, a worker can't be spawned or the
    /// aggregator is shut down.
    pub fn add_handle(&self, handle: H) -> Result<HandleId, AddError<H>> {
        let id = HandleId::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        #[cfg(feature = "log")]
        log::debug!(target: "aggregator", "Adding handle {id} (fd={})", handle.fd());

        self.pool.add_work(id, handle).map(|_| id)
    }

    /// Removes the handle from its worker. The worker finalizes the handle on its next wake-up.
    ///
    /// # Returns
    ///
    /// `false` if the handle is not registered, including handles which have already been removed
    /// by their worker.
    pub fn remove_handle(&self, id: HandleId) -> bool {
        #[cfg(feature = "log")]
        log::debug!(target: "aggregator", "Removing handle {id}");

        self.pool.remove_work(&id)
    }

    /// Handles which are not auto-deleted (see [`AggregatedHandle::auto_delete`]) are sent to this
    /// channel after being finalized.
    pub fn handovers(&self) -> &chan::Receiver<(HandleId, H)> { &self.handovers }

    /// Worker servicing the handle.
    pub fn owner(&self, id: HandleId) -> Option<WorkerId> { self.pool.owner(&id) }

    pub fn worker_count(&self) -> usize { self.pool.worker_count() }

    pub fn handle_count(&self) -> usize { self.pool.work_count() }

    /// Number of handles of each running worker.
    pub fn loads(&self) -> Vec<(WorkerId, usize)> { self.pool.loads() }

    /// Stops all workers, finalizing every registered handle, and waits for the worker threads.
    pub fn shutdown(&self) { self.pool.shutdown() }
}
