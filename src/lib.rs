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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Handle aggregator ([`HandleAggregator`]) multiplexes many pollable handles (sockets, pipes or
//! anything else representable as a file descriptor) over a small, bounded pool of worker threads.
//!
//! Each worker runs an event loop blocked on the readiness of all the handles assigned to it (plus
//! a waker, plus handle timeouts) and calls the handle callbacks ([`AggregatedHandle`]) once a
//! handle becomes readable. Handles are exclusively owned by their worker: a worker adds and
//! removes them from its list only inside its own event loop, after being notified through its
//! controller.
//!
//! Workers are spawned on demand and retired once idle; assignment of handles to workers follows
//! the policy of the underlying generic [`ThreadPool`].
//!
//! The crate also provides a drift-free periodic scheduling primitive, [`PacingTimer`], used by
//! callers which must emit events at a steady rate (for instance, media packetization).

#[macro_use]
extern crate amplify;

mod aggregator;
mod handle;
pub mod nonblock;
pub mod pacing;
pub mod poller;
pub mod pool;
pub mod sockets;
pub mod timeouts;
pub mod worker;

pub use aggregator::HandleAggregator;
pub use handle::{AggregatedHandle, HandleId};
pub use pacing::{Pace, PacingTimer};
pub use pool::{AddError, Capacity, Placement, PoolConfig, Retirement, ThreadPool, WorkerId};
pub use sockets::{ListenerHandle, StreamHandle};
