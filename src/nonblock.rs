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

use std::io::{Error, ErrorKind, Read, Result};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

pub enum IoStatus {
    Success(usize),
    WouldBlock,
    Shutdown,
    Err(Error),
}

pub trait ReadNonblocking: Read {
    fn set_read_nonblocking(&mut self, timeout: Option<Duration>) -> Result<()>;

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> IoStatus {
        loop {
            match self.read(buf) {
                // A readable stream returning no data has been closed by the peer.
                Ok(0) if !buf.is_empty() => return IoStatus::Shutdown,
                Ok(len) => return IoStatus::Success(len),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return IoStatus::WouldBlock,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return IoStatus::Err(err),
            }
        }
    }
}

impl ReadNonblocking for TcpStream {
    fn set_read_nonblocking(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.set_nonblocking(true)?;
        self.set_read_timeout(timeout)
    }
}

impl ReadNonblocking for UnixStream {
    fn set_read_nonblocking(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.set_nonblocking(true)?;
        self.set_read_timeout(timeout)
    }
}
