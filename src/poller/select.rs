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

use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, mem, ptr, thread};

use crate::poller::{FdSet, Poll, SocketWaker};

/// Readiness wait over the classic `select(2)` call.
///
/// Limited to descriptors below `FD_SETSIZE`; larger descriptors make [`Poll::wait`] fail with
/// [`io::ErrorKind::InvalidInput`].
#[derive(Debug, Default)]
pub struct Poller {
    interest: FdSet,
}

impl Poller {
    pub fn new() -> Self { Self::default() }
}

impl Poll for Poller {
    type Waker = SocketWaker;

    fn rebuild(&mut self, interest: &FdSet) {
        #[cfg(feature = "log")]
        log::trace!(target: "select", "Rebuilding fd set with {} descriptor(s)", interest.len());

        self.interest = interest.clone();
    }

    fn len(&self) -> usize { self.interest.len() }

    fn wait(&mut self, ready: &mut FdSet, timeout: Option<Duration>) -> io::Result<usize> {
        ready.clear();

        let Some(max_fd) = self.interest.max_fd() else {
            if let Some(timeout) = timeout {
                thread::sleep(timeout);
            }
            return Ok(0);
        };
        if max_fd >= libc::FD_SETSIZE as RawFd {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {max_fd} does not fit into select fd_set"),
            ));
        }

        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            for fd in self.interest.iter() {
                libc::FD_SET(fd, &mut read_set);
            }
        }

        let mut tv;
        let tv_ptr = match timeout {
            Some(timeout) => {
                tv = libc::timeval {
                    tv_sec: timeout.as_secs() as libc::time_t,
                    tv_usec: timeout.subsec_micros() as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
            None => ptr::null_mut(),
        };

        #[cfg(feature = "log")]
        log::trace!(target: "select", "Selecting over {} descriptor(s) with timeout {timeout:?}", self.interest.len());

        // Blocking call
        let res = unsafe {
            libc::select(max_fd + 1, &mut read_set, ptr::null_mut(), ptr::null_mut(), tv_ptr)
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if res == 0 {
            #[cfg(feature = "log")]
            log::trace!(target: "select", "Select timed out");
            return Ok(0);
        }

        for fd in self.interest.iter() {
            if unsafe { libc::FD_ISSET(fd, &read_set) } {
                ready.insert(fd);
            }
        }
        Ok(ready.len())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn readiness() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let (_c, d) = UnixStream::pair().unwrap();

        let mut poller = Poller::new();
        poller.rebuild(&FdSet::from_iter([b.as_raw_fd(), d.as_raw_fd()]));
        assert_eq!(poller.len(), 2);

        let mut ready = FdSet::new();
        assert_eq!(poller.wait(&mut ready, Some(Duration::from_millis(10))).unwrap(), 0);

        a.write_all(b"ping").unwrap();
        assert_eq!(poller.wait(&mut ready, Some(Duration::from_secs(1))).unwrap(), 1);
        assert!(ready.contains(b.as_raw_fd()));
        assert!(!ready.contains(d.as_raw_fd()));
    }

    #[test]
    fn hangup_is_readiness() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new();
        poller.rebuild(&FdSet::from_iter([b.as_raw_fd()]));
        drop(a);

        let mut ready = FdSet::new();
        assert_eq!(poller.wait(&mut ready, Some(Duration::from_secs(1))).unwrap(), 1);
    }
}
