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

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use crate::poller::{Waker, WakerRecv, WakerSend};

/// Self-pipe wake-up signal made of a connected pair of UNIX sockets.
pub struct SocketWaker;

/// Writing end of a [`SocketWaker`].
#[derive(Clone, Debug)]
pub struct WakerWriter(Arc<UnixStream>);

/// Reading end of a [`SocketWaker`].
#[derive(Debug)]
pub struct WakerReader(UnixStream);

impl Waker for SocketWaker {
    type Send = WakerWriter;
    type Recv = WakerReader;

    fn pair() -> io::Result<(WakerWriter, WakerReader)> {
        let (writer, reader) = UnixStream::pair()?;
        writer.set_nonblocking(true)?;
        reader.set_nonblocking(true)?;
        Ok((WakerWriter(Arc::new(writer)), WakerReader(reader)))
    }
}

impl WakerSend for WakerWriter {
    fn wake(&self) -> io::Result<()> {
        loop {
            match (&*self.0).write(&[0x1]) {
                Ok(_) => return Ok(()),
                // The socket buffer is full of unconsumed wake-ups, so the reader is already
                // signalled.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

impl WakerRecv for WakerReader {
    fn fd(&self) -> RawFd { self.0.as_raw_fd() }

    fn reset(&self) -> bool {
        let mut buf = [0u8; 256];
        loop {
            match (&self.0).read(&mut buf) {
                Ok(0) => return false,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}

impl AsRawFd for WakerReader {
    fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::poller::{DefaultPoller, FdSet, Poll};

    #[test]
    fn wake_and_reset() {
        let (writer, reader) = SocketWaker::pair().unwrap();
        let mut poller = DefaultPoller::default();
        poller.rebuild(&FdSet::from_iter([reader.fd()]));

        let mut ready = FdSet::new();
        assert_eq!(poller.wait(&mut ready, Some(Duration::from_millis(10))).unwrap(), 0);

        writer.wake().unwrap();
        writer.clone().wake().unwrap();
        assert_eq!(poller.wait(&mut ready, Some(Duration::from_secs(1))).unwrap(), 1);
        assert!(ready.contains(reader.fd()));

        assert!(reader.reset());
        assert_eq!(poller.wait(&mut ready, Some(Duration::from_millis(10))).unwrap(), 0);
        assert!(ready.is_empty());
    }

    #[test]
    fn reset_detects_dropped_writer() {
        let (writer, reader) = SocketWaker::pair().unwrap();
        writer.wake().unwrap();
        drop(writer);
        assert!(!reader.reset());
    }

    #[test]
    fn wake_on_full_buffer() {
        let (writer, reader) = SocketWaker::pair().unwrap();
        for _ in 0..100_000 {
            writer.wake().unwrap();
        }
        assert!(reader.reset());
    }
}
