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

//! Aggregated handles over standard sockets.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::nonblock::{IoStatus, ReadNonblocking};
use crate::AggregatedHandle;

/// Size of the read buffer of a [`StreamHandle`] unless configured otherwise.
pub const DEFAULT_READ_BUFFER: usize = 8192;

/// Maximum number of connections a [`ListenerHandle`] accepts per readiness.
const MAX_ACCEPTS_PER_READ: usize = 64;

/// Connected stream which passes everything it reads to a closure.
///
/// One non-blocking read is performed per readiness. The handle is done when the peer closes the
/// stream, on a read error, when the closure returns `false`, or when no data arrived within the
/// idle timeout (if one is set).
pub struct StreamHandle<S, F>
where
    S: ReadNonblocking + AsRawFd + Send,
    F: FnMut(&mut S, &[u8]) -> bool + Send,
{
    stream: S,
    on_data: F,
    buf: Vec<u8>,
    idle_timeout: Option<Duration>,
    auto_delete: bool,
}

impl<S, F> StreamHandle<S, F>
where
    S: ReadNonblocking + AsRawFd + Send,
    F: FnMut(&mut S, &[u8]) -> bool + Send,
{
    pub fn new(stream: S, on_data: F) -> Self {
        StreamHandle {
            stream,
            on_data,
            buf: vec![0u8; DEFAULT_READ_BUFFER],
            idle_timeout: None,
            auto_delete: true,
        }
    }

    /// # Panics
    ///
    /// If `size` is zero.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        assert!(size > 0, "stream read buffer must not be empty");
        self.buf = vec![0u8; size];
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Makes the aggregator hand the handle back after removal instead of dropping it, so the
    /// stream stays open.
    pub fn handed_back(mut self) -> Self {
        self.auto_delete = false;
        self
    }

    pub fn stream(&self) -> &S { &self.stream }

    pub fn into_stream(self) -> S { self.stream }
}

impl<S, F> AggregatedHandle for StreamHandle<S, F>
where
    S: ReadNonblocking + AsRawFd + Send,
    F: FnMut(&mut S, &[u8]) -> bool + Send,
{
    fn fd(&self) -> RawFd { self.stream.as_raw_fd() }

    fn timeout(&self) -> Option<Duration> { self.idle_timeout }

    fn init(&mut self) -> bool {
        match self.stream.set_read_nonblocking(None) {
            Ok(()) => true,
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "worker", "Unable to make stream {} non-blocking: {err}", self.fd());
                false
            }
        }
    }

    fn on_read(&mut self) -> bool {
        match self.stream.read_nonblocking(&mut self.buf) {
            IoStatus::Success(len) => (self.on_data)(&mut self.stream, &self.buf[..len]),
            IoStatus::WouldBlock => true,
            IoStatus::Shutdown => {
                #[cfg(feature = "log")]
                log::debug!(target: "worker", "Stream {} closed by the peer", self.fd());
                false
            }
            IoStatus::Err(err) => {
                #[cfg(feature = "log")]
                log::debug!(target: "worker", "Stream {} failed: {err}", self.fd());
                false
            }
        }
    }

    fn on_timeout(&mut self) -> bool {
        #[cfg(feature = "log")]
        log::debug!(target: "worker", "Stream {} idle for {:?}", self.fd(), self.idle_timeout);
        false
    }

    fn auto_delete(&self) -> bool { self.auto_delete }
}

/// Listening socket passing every accepted connection to a closure.
///
/// A closure returning `false` stops the listener.
pub struct ListenerHandle<F>
where F: FnMut(TcpStream, SocketAddr) -> bool + Send
{
    listener: TcpListener,
    on_accept: F,
}

impl<F> ListenerHandle<F>
where F: FnMut(TcpStream, SocketAddr) -> bool + Send
{
    pub fn new(listener: TcpListener, on_accept: F) -> Self { ListenerHandle { listener, on_accept } }

    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.listener.local_addr() }
}

impl<F> AggregatedHandle for ListenerHandle<F>
where F: FnMut(TcpStream, SocketAddr) -> bool + Send
{
    fn fd(&self) -> RawFd { self.listener.as_raw_fd() }

    fn init(&mut self) -> bool { self.listener.set_nonblocking(true).is_ok() }

    fn on_read(&mut self) -> bool {
        for _ in 0..MAX_ACCEPTS_PER_READ {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "worker", "Accepted connection from {addr}");
                    if !(self.on_accept)(stream, addr) {
                        return false;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // Failures of a single pending connection (aborted, out of descriptors) must not
                // stop the listener.
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "worker", "Accepting connection failed: {err}");
                    return true;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn stream_reads_until_closed() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut received = Vec::new();
        {
            let mut handle = StreamHandle::new(b, |_: &mut UnixStream, data: &[u8]| {
                received.extend_from_slice(data);
                true
            })
            .with_buffer_size(4);
            assert!(handle.init());
            assert!(handle.on_read(), "nothing to read is not a failure");

            a.write_all(b"hello").unwrap();
            assert!(handle.on_read());
            assert!(handle.on_read());

            drop(a);
            assert!(!handle.on_read());
            assert!(!handle.on_timeout());
            assert!(handle.auto_delete());
        }
        assert_eq!(received, b"hello");
    }

    #[test]
    fn stream_closure_ends_handle() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut handle =
            StreamHandle::new(b, |_: &mut UnixStream, data: &[u8]| data != b"quit").handed_back();
        assert!(handle.init());
        a.write_all(b"quit").unwrap();
        assert!(!handle.on_read());
        assert!(!handle.auto_delete());
    }

    #[test]
    fn listener_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut accepted = 0;
        {
            let mut handle = ListenerHandle::new(listener, |_, _| {
                accepted += 1;
                accepted < 2
            });
            assert!(handle.init());
            assert!(handle.on_read());

            let _c1 = TcpStream::connect(addr).unwrap();
            let _c2 = TcpStream::connect(addr).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            assert!(!handle.on_read());
        }
        assert_eq!(accepted, 2);
    }
}
