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

//! Bounded pool of worker threads with load-balanced assignment of work units.
//!
//! [`ThreadPool`] does not know what its workers do. It decides which worker gets a new unit of
//! work, spawns workers lazily up to the configured ceiling, tracks which worker owns which unit,
//! and retires idle workers. The workers themselves are supplied by the pool user through the
//! [`PoolWorker`] trait; [`crate::HandleAggregator`] is one such instantiation.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use std::{io, mem};

/// Default grace period of [`Retirement::Idle`].
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(5);

/// Identifier of a worker inside a pool; never reused during the pool lifetime.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("worker#{0}")]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn to_usize(self) -> usize { self.0 }
}

/// How many work units a single worker may service.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Capacity {
    /// At most this many units per worker; the pool holds at most `max_workers` times as many.
    PerWorker(usize),
    /// No per-worker ceiling; units are spread evenly over at most `max_workers` workers.
    Unbounded,
}

impl Capacity {
    /// Whether a worker servicing `load` units may take one more.
    pub fn admits(self, load: usize) -> bool {
        match self {
            Capacity::PerWorker(max) => load < max,
            Capacity::Unbounded => true,
        }
    }
}

/// Choice between spreading work over workers and packing it into as few workers as possible.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum Placement {
    /// Prefer an empty worker, then a new one, then the least loaded one with spare capacity.
    #[default]
    Spread,
    /// Prefer the least loaded worker with spare capacity; spawn only when all are full.
    Pack,
}

/// What happens to a worker which has no work left.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Retirement {
    /// Workers live until the pool shuts down.
    Never,
    /// A worker is retired as soon as its last unit is removed.
    Immediate,
    /// A worker asks for retirement after staying empty for the given time.
    Idle(Duration),
}

impl Default for Retirement {
    fn default() -> Self { Retirement::Idle(DEFAULT_IDLE_GRACE) }
}

/// Pool configuration.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PoolConfig {
    max_workers: usize,
    capacity: Capacity,
    placement: Placement,
    retirement: Retirement,
    thread_name: String,
}

impl PoolConfig {
    /// # Panics
    ///
    /// If `max_workers` is zero or the capacity is `PerWorker(0)`.
    pub fn new(max_workers: usize, capacity: Capacity) -> Self {
        assert!(max_workers > 0, "pool must allow at least one worker");
        assert!(capacity != Capacity::PerWorker(0), "per-worker capacity must be positive");
        PoolConfig {
            max_workers,
            capacity,
            placement: Placement::default(),
            retirement: Retirement::default(),
            thread_name: s!("aggregator"),
        }
    }

    /// Configuration from a worker ceiling and a per-worker unit ceiling, where zero units means
    /// [`Capacity::Unbounded`].
    pub fn with_limits(max_workers: usize, max_units_per_worker: usize) -> Self {
        let capacity = match max_units_per_worker {
            0 => Capacity::Unbounded,
            max => Capacity::PerWorker(max),
        };
        PoolConfig::new(max_workers, capacity)
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn retirement(mut self, retirement: Retirement) -> Self {
        self.retirement = retirement;
        self
    }

    /// Prefix for worker thread names; threads are named `{prefix}-{worker number}`.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    pub fn max_workers(&self) -> usize { self.max_workers }

    pub fn capacity(&self) -> Capacity { self.capacity }

    /// Total number of units the pool can hold, if limited.
    pub fn max_units(&self) -> Option<usize> {
        match self.capacity {
            Capacity::PerWorker(max) => Some(max * self.max_workers),
            Capacity::Unbounded => None,
        }
    }

    pub fn get_placement(&self) -> Placement { self.placement }

    pub fn get_retirement(&self) -> Retirement { self.retirement }
}

/// Errors adding a unit of work to a pool. Each variant returns the rejected unit.
#[derive(Display, Error)]
#[display(doc_comments)]
pub enum AddError<T> {
    /// all workers are at capacity and no more workers may be spawned.
    Exhausted(T),

    /// unable to spawn a worker thread. Details: {0}
    Spawn(io::Error, T),

    /// worker thread refused the work unit since it has terminated.
    Rejected(T),

    /// pool is shut down.
    ShutDown(T),
}

impl<T> Debug for AddError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { Display::fmt(self, f) }
}

impl<T> AddError<T> {
    /// Returns the rejected work unit back.
    pub fn into_inner(self) -> T {
        match self {
            AddError::Exhausted(unit)
            | AddError::Spawn(_, unit)
            | AddError::Rejected(unit)
            | AddError::ShutDown(unit) => unit,
        }
    }

    pub fn is_exhausted(&self) -> bool { matches!(self, AddError::Exhausted(_)) }
}

/// Everything a worker gets when it is spawned by a pool.
pub struct WorkerContext<W: PoolWorker> {
    pub id: WorkerId,
    pub link: PoolLink<W>,
    pub retirement: Retirement,
    pub thread_name: String,
    pub context: W::Context,
}

/// A worker thread managed by a [`ThreadPool`].
///
/// All methods except [`Self::shutdown`] are called by the pool while holding the pool lock, so
/// they must not block. Unit bookkeeping must be reflected by [`Self::work_size`] immediately:
/// the pool compares these sizes to balance the load and to enforce its capacity.
pub trait PoolWorker: Sized + Send + 'static {
    /// Identity of a work unit.
    type Key: Clone + Eq + Hash + Debug + Send + 'static;

    /// The work unit itself, handed over to the worker.
    type Work: Send + 'static;

    /// Data shared by all workers of a pool, cloned into each of them on spawn.
    type Context: Clone + Send + 'static;

    /// Starts a worker thread running its own loop.
    fn spawn(ctx: WorkerContext<Self>) -> io::Result<Self>;

    fn id(&self) -> WorkerId;

    /// Number of units the worker currently services.
    fn work_size(&self) -> usize;

    /// Gives a new unit to the worker. On failure the unit is returned back.
    fn on_add_work(&mut self, key: Self::Key, work: Self::Work) -> Result<(), Self::Work>;

    /// Takes a unit away from the worker.
    fn on_remove_work(&mut self, key: &Self::Key);

    /// Acknowledges that the worker has dropped the unit on its own (see [`PoolLink::release`]).
    fn on_work_released(&mut self, key: &Self::Key);

    /// Signals the worker thread to terminate without waiting for it.
    fn stop(&self);

    /// Stops the worker thread and waits for it to terminate.
    fn shutdown(self);

    /// Whether the worker thread has terminated.
    fn is_finished(&self) -> bool;
}

/// Result of the placement policy for a new unit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Target {
    Existing(usize),
    Spawn,
    Exhausted,
}

/// Picks the worker for a new unit given the loads of the existing workers (in worker order).
fn place(loads: &[usize], config: &PoolConfig) -> Target {
    let can_spawn = loads.len() < config.max_workers;
    let least_loaded = loads
        .iter()
        .enumerate()
        .filter(|(_, load)| config.capacity.admits(**load))
        .min_by_key(|(index, load)| (**load, *index))
        .map(|(index, _)| index);

    let placement = match config.capacity {
        Capacity::Unbounded => Placement::Spread,
        Capacity::PerWorker(_) => config.placement,
    };
    match placement {
        Placement::Spread => {
            if let Some(index) = loads.iter().position(|load| *load == 0) {
                Target::Existing(index)
            } else if can_spawn {
                Target::Spawn
            } else {
                least_loaded.map(Target::Existing).unwrap_or(Target::Exhausted)
            }
        }
        Placement::Pack => match least_loaded {
            Some(index) => Target::Existing(index),
            None if can_spawn => Target::Spawn,
            None => Target::Exhausted,
        },
    }
}

struct State<W: PoolWorker> {
    workers: Vec<W>,
    owners: HashMap<W::Key, WorkerId>,
    retired: Vec<W>,
    next_worker: usize,
    shut_down: bool,
}

impl<W: PoolWorker> State<W> {
    fn new() -> Self {
        State {
            workers: empty!(),
            owners: empty!(),
            retired: empty!(),
            next_worker: 0,
            shut_down: false,
        }
    }

    fn position(&self, id: WorkerId) -> Option<usize> { self.workers.iter().position(|w| w.id() == id) }

    /// Takes retired workers whose threads have already terminated.
    fn reap(&mut self) -> Vec<W> {
        let (finished, running) =
            mem::take(&mut self.retired).into_iter().partition(|worker| worker.is_finished());
        self.retired = running;
        finished
    }

    /// Takes workers whose threads have terminated without being retired (i.e. panicked),
    /// forgetting the units they owned.
    fn prune_dead(&mut self) -> Vec<W> {
        let (dead, alive): (Vec<W>, Vec<W>) =
            mem::take(&mut self.workers).into_iter().partition(|worker| worker.is_finished());
        self.workers = alive;
        for worker in &dead {
            let id = worker.id();
            #[cfg(feature = "log")]
            log::error!(target: "aggregator", "Thread of {id} has terminated unexpectedly; dropping its {} unit(s)", worker.work_size());
            self.owners.retain(|_, owner| *owner != id);
        }
        dead
    }
}

type Shared<W> = Mutex<State<W>>;

fn lock<W: PoolWorker>(shared: &Shared<W>) -> MutexGuard<'_, State<W>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection from a worker thread back to its pool.
///
/// Holds no strong reference to the pool, so a worker outliving its pool does not keep it alive.
pub struct PoolLink<W: PoolWorker> {
    shared: Weak<Shared<W>>,
    worker: WorkerId,
}

impl<W: PoolWorker> Clone for PoolLink<W> {
    fn clone(&self) -> Self {
        PoolLink {
            shared: self.shared.clone(),
            worker: self.worker,
        }
    }
}

impl<W: PoolWorker> PoolLink<W> {
    pub fn worker_id(&self) -> WorkerId { self.worker }

    /// Tells the pool the worker has dropped a unit on its own, so the pool forgets the unit.
    ///
    /// Must not be called while the worker is being asked by the pool to do something, i.e.
    /// from inside [`PoolWorker`] methods.
    ///
    /// # Returns
    ///
    /// Whether the pool still considered the unit to be owned by this worker.
    pub fn release(&self, key: &W::Key) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = lock(&shared);
        if state.owners.get(key) != Some(&self.worker) {
            return false;
        }
        state.owners.remove(key);
        if let Some(index) = state.position(self.worker) {
            state.workers[index].on_work_released(key);
        }
        true
    }

    /// Asks the pool to retire this worker because it has no work.
    ///
    /// The pool grants retirement only if the worker has no units assigned, including units added
    /// but not yet seen by the worker thread. A worker which was granted retirement, or which is no
    /// longer known to the pool, must terminate its thread.
    pub fn retire(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return true;
        };
        let mut state = lock(&shared);
        let Some(index) = state.position(self.worker) else {
            return true;
        };
        if state.workers[index].work_size() > 0 {
            return false;
        }

        #[cfg(feature = "log")]
        log::debug!(target: "aggregator", "Retiring idle {}", self.worker);

        let worker = state.workers.remove(index);
        state.retired.push(worker);
        true
    }
}

/// Pool of lazily spawned workers servicing work units.
///
/// Adding and removing units is safe from any thread. Two lock domains are involved: the pool
/// lock, serializing changes to the set of workers and unit ownership, and whatever each worker
/// uses internally; the pool lock is always taken first.
pub struct ThreadPool<W: PoolWorker> {
    config: PoolConfig,
    context: W::Context,
    shared: Arc<Shared<W>>,
}

impl<W: PoolWorker> ThreadPool<W> {
    pub fn new(config: PoolConfig, context: W::Context) -> Self {
        #[cfg(feature = "log")]
        log::debug!(target: "aggregator", "Creating pool: {config:?}");

        ThreadPool {
            config,
            context,
            shared: Arc::new(Mutex::new(State::new())),
        }
    }

    pub fn config(&self) -> &PoolConfig { &self.config }

    /// Assigns a unit of work to a worker, spawning a new worker if the placement policy asks
    /// for it.
    ///
    /// # Panics
    ///
    /// If a unit with the same key is already in the pool.
    pub fn add_work(&self, key: W::Key, work: W::Work) -> Result<WorkerId, AddError<W::Work>> {
        let mut state = lock(&self.shared);
        let mut reaped = state.reap();
        reaped.extend(state.prune_dead());

        let res = self.add_locked(&mut state, key, work);
        drop(state);

        for worker in reaped {
            worker.shutdown();
        }
        res
    }

    fn add_locked(
        &self,
        state: &mut State<W>,
        key: W::Key,
        work: W::Work,
    ) -> Result<WorkerId, AddError<W::Work>> {
        if state.shut_down {
            return Err(AddError::ShutDown(work));
        }
        assert!(
            !state.owners.contains_key(&key),
            "work unit {key:?} is already registered in the pool"
        );

        let loads = state.workers.iter().map(W::work_size).collect::<Vec<_>>();
        let index = match place(&loads, &self.config) {
            Target::Existing(index) => index,
            Target::Spawn => {
                let id = WorkerId(state.next_worker);
                state.next_worker += 1;
                let ctx = WorkerContext {
                    id,
                    link: PoolLink {
                        shared: Arc::downgrade(&self.shared),
                        worker: id,
                    },
                    retirement: self.config.retirement,
                    thread_name: format!("{}-{}", self.config.thread_name, id.0),
                    context: self.context.clone(),
                };
                match W::spawn(ctx) {
                    Ok(worker) => {
                        #[cfg(feature = "log")]
                        log::info!(target: "aggregator", "Spawned {id} ({} of at most {})", state.workers.len() + 1, self.config.max_workers);
                        state.workers.push(worker);
                        state.workers.len() - 1
                    }
                    Err(err) => {
                        #[cfg(feature = "log")]
                        log::error!(target: "aggregator", "Unable to spawn {id}: {err}");
                        return Err(AddError::Spawn(err, work));
                    }
                }
            }
            Target::Exhausted => {
                #[cfg(feature = "log")]
                log::debug!(target: "aggregator", "Rejecting {key:?}: all {} worker(s) are at capacity", loads.len());
                return Err(AddError::Exhausted(work));
            }
        };

        let worker = &mut state.workers[index];
        let id = worker.id();
        worker.on_add_work(key.clone(), work).map_err(AddError::Rejected)?;

        #[cfg(feature = "log")]
        log::trace!(target: "aggregator", "Assigned {key:?} to {id}");

        state.owners.insert(key, id);
        Ok(id)
    }

    /// Takes a unit of work away from its worker.
    ///
    /// # Returns
    ///
    /// `false` if the unit is not in the pool.
    pub fn remove_work(&self, key: &W::Key) -> bool {
        let mut state = lock(&self.shared);
        let Some(id) = state.owners.remove(key) else {
            return false;
        };
        let Some(index) = state.position(id) else {
            #[cfg(feature = "log")]
            log::warn!(target: "aggregator", "Owner {id} of {key:?} is no longer running");
            return true;
        };
        state.workers[index].on_remove_work(key);

        #[cfg(feature = "log")]
        log::trace!(target: "aggregator", "Removed {key:?} from {id}");

        // Joined by a later `add_work` or at shutdown, never here.
        if self.config.retirement == Retirement::Immediate && state.workers[index].work_size() == 0 {
            #[cfg(feature = "log")]
            log::debug!(target: "aggregator", "Retiring empty {id}");
            let worker = state.workers.remove(index);
            worker.stop();
            state.retired.push(worker);
        }
        true
    }

    /// Worker owning the unit.
    pub fn owner(&self, key: &W::Key) -> Option<WorkerId> { lock(&self.shared).owners.get(key).copied() }

    /// Number of running (not retired) workers.
    pub fn worker_count(&self) -> usize { lock(&self.shared).workers.len() }

    /// Number of units in the pool.
    pub fn work_count(&self) -> usize { lock(&self.shared).owners.len() }

    /// Load of each running worker, in the order workers were spawned.
    pub fn loads(&self) -> Vec<(WorkerId, usize)> {
        lock(&self.shared).workers.iter().map(|worker| (worker.id(), worker.work_size())).collect()
    }

    /// Shuts down all workers and waits for their threads. Units still in the pool are finalized
    /// by their workers. Adding work afterwards fails with [`AddError::ShutDown`].
    pub fn shutdown(&self) {
        let mut state = lock(&self.shared);
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.owners.clear();
        let workers = mem::take(&mut state.workers);
        let retired = mem::take(&mut state.retired);
        drop(state);

        #[cfg(feature = "log")]
        log::info!(target: "aggregator", "Shutting down {} worker(s)", workers.len());

        for worker in workers.into_iter().chain(retired) {
            worker.shutdown();
        }
    }
}

impl<W: PoolWorker> Drop for ThreadPool<W> {
    fn drop(&mut self) { self.shutdown() }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::{self, JoinHandle};

    use crossbeam_channel as chan;

    use super::*;

    /// Unit which makes [`SetWorker`] thread panic.
    const POISON: u32 = u32::MAX;

    enum Job {
        Add(u32),
        Remove(u32),
        Stop,
    }

    /// Worker collecting unit numbers into a set; reports every finalized unit to the test.
    struct SetWorker {
        id: WorkerId,
        size: usize,
        jobs: chan::Sender<Job>,
        thread: JoinHandle<()>,
    }

    #[derive(Clone)]
    struct Probe {
        finalized: chan::Sender<u32>,
        spawned: Arc<AtomicUsize>,
    }

    impl PoolWorker for SetWorker {
        type Key = u32;
        type Work = u32;
        type Context = Probe;

        fn spawn(ctx: WorkerContext<Self>) -> io::Result<Self> {
            let (jobs, recv) = chan::unbounded::<Job>();
            let probe = ctx.context;
            probe.spawned.fetch_add(1, Ordering::SeqCst);
            let thread = thread::Builder::new().name(ctx.thread_name).spawn(move || {
                let mut units = HashSet::new();
                for job in recv {
                    match job {
                        Job::Add(POISON) => panic!("worker got a poisoned unit"),
                        Job::Add(unit) => {
                            units.insert(unit);
                        }
                        Job::Remove(unit) => {
                            if units.remove(&unit) {
                                let _ = probe.finalized.send(unit);
                            }
                        }
                        Job::Stop => break,
                    }
                }
                for unit in units {
                    let _ = probe.finalized.send(unit);
                }
            })?;
            Ok(SetWorker {
                id: ctx.id,
                size: 0,
                jobs,
                thread,
            })
        }

        fn id(&self) -> WorkerId { self.id }
        fn work_size(&self) -> usize { self.size }
        fn on_add_work(&mut self, _key: u32, work: u32) -> Result<(), u32> {
            self.jobs.send(Job::Add(work)).map_err(|_| work)?;
            self.size += 1;
            Ok(())
        }
        fn on_remove_work(&mut self, key: &u32) {
            self.size -= 1;
            let _ = self.jobs.send(Job::Remove(*key));
        }
        fn on_work_released(&mut self, _key: &u32) { self.size -= 1; }
        fn stop(&self) { let _ = self.jobs.send(Job::Stop); }
        fn shutdown(self) {
            self.stop();
            let _ = self.thread.join();
        }
        fn is_finished(&self) -> bool { self.thread.is_finished() }
    }

    fn pool(config: PoolConfig) -> (ThreadPool<SetWorker>, chan::Receiver<u32>, Arc<AtomicUsize>) {
        let (finalized, recv) = chan::unbounded();
        let spawned = Arc::new(AtomicUsize::new(0));
        let probe = Probe {
            finalized,
            spawned: spawned.clone(),
        };
        (ThreadPool::new(config, probe), recv, spawned)
    }

    fn config(max_workers: usize, per_worker: usize) -> PoolConfig {
        PoolConfig::with_limits(max_workers, per_worker).retirement(Retirement::Never)
    }

    #[test]
    fn placement_spread() {
        let config = config(3, 2);
        assert_eq!(place(&[], &config), Target::Spawn);
        assert_eq!(place(&[1], &config), Target::Spawn);
        assert_eq!(place(&[1, 0], &config), Target::Existing(1));
        assert_eq!(place(&[1, 1, 1], &config), Target::Existing(0));
        assert_eq!(place(&[2, 1, 2], &config), Target::Existing(1));
        assert_eq!(place(&[2, 2, 2], &config), Target::Exhausted);
    }

    #[test]
    fn placement_pack() {
        let config = config(2, 2).placement(Placement::Pack);
        assert_eq!(place(&[], &config), Target::Spawn);
        assert_eq!(place(&[1], &config), Target::Existing(0));
        assert_eq!(place(&[2], &config), Target::Spawn);
        assert_eq!(place(&[2, 1], &config), Target::Existing(1));
        assert_eq!(place(&[2, 2], &config), Target::Exhausted);

        let unbounded = PoolConfig::with_limits(2, 0).placement(Placement::Pack);
        assert_eq!(place(&[5], &unbounded), Target::Spawn);
        assert_eq!(place(&[5, 3], &unbounded), Target::Existing(1));
    }

    #[test]
    fn capacity_limit() {
        let (pool, _finalized, spawned) = pool(config(2, 3));
        for unit in 0..6 {
            assert!(pool.add_work(unit, unit).is_ok());
        }
        let err = pool.add_work(6, 6).unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.into_inner(), 6);
        assert_eq!(pool.work_count(), 6);
        assert_eq!(spawned.load(Ordering::SeqCst), 2);

        assert!(pool.remove_work(&0));
        assert!(!pool.remove_work(&0));
        assert!(pool.add_work(6, 6).is_ok());
    }

    #[test]
    fn load_balance() {
        let (pool, _finalized, _) = pool(config(4, 5));
        for unit in 0..18 {
            pool.add_work(unit, unit).unwrap();
            let loads = pool.loads().into_iter().map(|(_, load)| load).collect::<Vec<_>>();
            let min = loads.iter().min().unwrap();
            let max = loads.iter().max().unwrap();
            assert!(max - min <= 1, "unbalanced loads {loads:?}");
        }
        assert_eq!(pool.worker_count(), 4);
    }

    #[test]
    fn unbounded_spreads_over_max_workers() {
        let (pool, _finalized, spawned) = pool(config(3, 0));
        for unit in 0..100 {
            pool.add_work(unit, unit).unwrap();
        }
        assert_eq!(spawned.load(Ordering::SeqCst), 3);
        let loads = pool.loads();
        assert!(loads.iter().all(|(_, load)| *load == 33 || *load == 34));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_registration() {
        let (pool, _finalized, _) = pool(config(1, 2));
        pool.add_work(1, 1).unwrap();
        let _ = pool.add_work(1, 1);
    }

    #[test]
    fn concurrent_adds() {
        let (pool, finalized, _) = pool(config(8, 50));
        let pool = Arc::new(pool);
        let threads = (0..8u32)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for unit in (t * 50)..(t * 50 + 50) {
                        pool.add_work(unit, unit).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(pool.work_count(), 400);
        assert_eq!(pool.loads().iter().map(|(_, load)| load).sum::<usize>(), 400);
        for unit in 0..400 {
            assert!(pool.owner(&unit).is_some());
        }

        pool.shutdown();
        let mut all = finalized.try_iter().collect::<Vec<_>>();
        all.sort_unstable();
        assert_eq!(all, (0..400).collect::<Vec<_>>(), "every unit finalized exactly once");
    }

    #[test]
    fn immediate_retirement() {
        let (pool, finalized, spawned) = pool(config(2, 1).retirement(Retirement::Immediate));
        let first = pool.add_work(1, 1).unwrap();
        let second = pool.add_work(2, 2).unwrap();
        assert_ne!(first, second);

        assert!(pool.remove_work(&1));
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(finalized.recv_timeout(Duration::from_secs(1)), Ok(1));

        let third = pool.add_work(3, 3).unwrap();
        assert_ne!(third, first, "worker ids are not reused");
        assert_eq!(spawned.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn release_and_retire_through_link() {
        let (pool, _finalized, _) = pool(config(1, 2));
        let id = pool.add_work(7, 7).unwrap();
        let link = PoolLink::<SetWorker> {
            shared: Arc::downgrade(&pool.shared),
            worker: id,
        };

        assert!(!link.retire(), "worker with work is not retired");
        assert!(link.release(&7));
        assert!(!link.release(&7));
        assert_eq!(pool.owner(&7), None);
        assert_eq!(pool.loads(), vec![(id, 0)]);

        assert!(link.retire());
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.owner(&7), None);

        // A retired worker is never picked again.
        let next = pool.add_work(8, 8).unwrap();
        assert_ne!(next, id);
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn immediate_retirement_does_not_wait() {
        let (pool, finalized, _) = pool(config(2, 2).retirement(Retirement::Immediate));
        pool.add_work(1, 1).unwrap();
        assert!(pool.remove_work(&1));
        assert_eq!(pool.worker_count(), 0);
        {
            let state = lock(&pool.shared);
            assert_eq!(state.retired.len(), 1, "retired worker is joined later");
        }
        assert_eq!(finalized.recv_timeout(Duration::from_secs(1)), Ok(1));

        pool.add_work(2, 2).unwrap();
        pool.shutdown();
        assert!(lock(&pool.shared).retired.is_empty());
    }

    #[test]
    fn dead_worker_is_replaced() {
        let (pool, _finalized, spawned) = pool(config(1, 4));
        let dead = pool.add_work(POISON, POISON).unwrap();

        let started = std::time::Instant::now();
        while !lock(&pool.shared).workers[0].is_finished() {
            assert!(started.elapsed() < Duration::from_secs(2), "worker thread did not terminate");
            thread::sleep(Duration::from_millis(5));
        }

        let id = pool.add_work(1, 1).unwrap();
        assert_ne!(id, dead);
        assert_eq!(spawned.load(Ordering::SeqCst), 2);
        assert_eq!(pool.owner(&POISON), None);
        assert_eq!(pool.loads(), vec![(id, 1)]);
    }

    #[test]
    fn shutdown_rejects() {
        let (pool, finalized, _) = pool(config(2, 2));
        pool.add_work(1, 1).unwrap();
        pool.shutdown();
        assert_eq!(finalized.try_iter().collect::<Vec<_>>(), vec![1]);
        assert!(matches!(pool.add_work(2, 2), Err(AddError::ShutDown(2))));
        assert_eq!(pool.worker_count(), 0);
    }
}
