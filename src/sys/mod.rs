// Library for readiness multiplexing and asynchronous I/O completion ports.
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

//! Platform event-notification facilities (`poll(2)`, `epoll`, `kqueue`) behind a uniform
//! readiness-polling abstraction.
//!
//! Each backend wraps exactly five native operations: create a polling context, register/modify/
//! delete interest for a single descriptor, block waiting for events, and close the context (the
//! latter via `Drop`). Everything above this module is platform-independent.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub mod kqueue;
pub mod poll;

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, ops};

/// Facility used by [`crate::Selector`] when no explicit backend is chosen.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub type DefaultFacility = epoll::EpollFacility;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub type DefaultFacility = kqueue::KqueueFacility;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
pub type DefaultFacility = poll::PollSet;

/// Upper bound on the number of event records a single native wait call may fill.
///
/// Caps per-call syscall cost and native memory regardless of the process descriptor limit.
pub const MAX_EVENTS: usize = 8192;

/// Returns the event-array capacity to use for a freshly created facility: the soft limit on open
/// descriptors, capped by [`MAX_EVENTS`].
pub fn fd_limit() -> usize {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let res = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) };
    if res != 0 {
        return MAX_EVENTS;
    }
    (rl.rlim_cur as usize).clamp(1, MAX_EVENTS)
}

pub(crate) fn millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

/// A single I/O operation (direction).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Io {
    Read,
    Write,
}

/// Information about I/O readiness which has happened for a descriptor.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Specifies whether I/O source has data to read.
    pub read: bool,
    /// Specifies whether I/O source is ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
    pub fn is_read_only(self) -> bool { self.read && !self.write }
    pub fn is_write_only(self) -> bool { !self.read && self.write }
    pub fn is_read_write(self) -> bool { self.read && self.write }
}

impl ops::Not for IoType {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self {
            read: !self.read,
            write: !self.write,
        }
    }
}

impl ops::BitOr for IoType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            read: self.read | rhs.read,
            write: self.write | rhs.write,
        }
    }
}

impl Iterator for IoType {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        if self.write {
            self.write = false;
            Some(Io::Write)
        } else if self.read {
            self.read = false;
            Some(Io::Read)
        } else {
            None
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else if self.is_read_write() {
            f.write_str("read-write")
        } else if self.read {
            f.write_str("read")
        } else {
            f.write_str("write")
        }
    }
}

/// Failure reported by the native facility for a single descriptor.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent (native event bits {0:#b})
    Connectivity(i32),
    /// OS-level error (native event bits {0:#b})
    Os(i32),
}

/// Registration opcode applied to the native facility when the pending log is flushed.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Opcode {
    #[display("add")]
    Add,
    #[display("mod")]
    Modify,
    #[display("del")]
    Delete,
}

/// One translated native readiness event.
#[derive(Copy, Clone, Debug)]
pub struct SysEvent {
    pub fd: RawFd,
    pub res: Result<IoType, IoFail>,
}

/// A native polling facility owned exclusively by a single [`crate::Multiplexer`].
///
/// Implementations must not retry `EINTR` themselves: the interrupted-syscall case is handled by
/// the owner, which knows whether the component is still open.
pub trait Facility: Send {
    /// Creates the native polling context together with its event array.
    ///
    /// The effective event-array capacity is `min(capacity, fd_limit())`. Allocation failures are
    /// fatal and propagate as the OS error.
    fn create(capacity: usize) -> io::Result<Self>
    where Self: Sized;

    /// Applies a single registration change to the facility.
    ///
    /// `Delete` for an unknown descriptor is a no-op; `Add` for a descriptor which is already
    /// present behaves as `Modify`.
    fn arm(&mut self, fd: RawFd, op: Opcode, interest: IoType) -> io::Result<()>;

    /// Blocks until at least one event is available or the timeout expires.
    ///
    /// `None` blocks indefinitely; a zero duration polls without blocking. Returns the number of
    /// populated event slots.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Reads back the event at `index`, which must be less than the count returned by the last
    /// [`Facility::wait`] call.
    fn event(&self, index: usize) -> SysEvent;

    /// Capacity of the underlying event array.
    fn capacity(&self) -> usize;
}

/// A polling facility supporting multiple concurrent waiter threads over one shared kernel object.
///
/// This is the surface the completion port runs on: registration methods take `&self` and may be
/// called from any thread, while each worker owns its private [`SharedPoll::Events`] buffer.
/// `poll(2)` has no such semantics, which is why the completion port exists only on epoll and
/// kqueue platforms.
pub trait SharedPoll: Send + Sync + Sized {
    /// Per-thread buffer of native event records.
    type Events: Send;

    fn create(capacity: usize) -> io::Result<Self>;

    /// Allocates a fresh event buffer for one waiter thread.
    fn events(&self) -> Self::Events;

    /// Arms interest for a descriptor, adding it to the facility if it is not yet known.
    ///
    /// With `oneshot` the registration is disarmed by the kernel after the first firing and must
    /// be renewed with another `watch` call.
    fn watch(&self, fd: RawFd, interest: IoType, oneshot: bool) -> io::Result<()>;

    /// Removes a descriptor from the facility. Unknown descriptors are ignored.
    fn unwatch(&self, fd: RawFd) -> io::Result<()>;

    /// Blocks the calling thread until events are available, filling the caller's buffer.
    fn wait(&self, events: &mut Self::Events, timeout: Option<Duration>) -> io::Result<usize>;

    /// Reads back the translated event at `index` of a buffer filled by [`SharedPoll::wait`].
    fn event(events: &Self::Events, index: usize) -> SysEvent;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_type_iteration() {
        let collected = IoType::read_write().collect::<Vec<_>>();
        assert_eq!(collected, vec![Io::Write, Io::Read]);
        assert_eq!(IoType::none().next(), None);
    }

    #[test]
    fn io_type_ops() {
        assert_eq!(!IoType::read_only(), IoType::write_only());
        assert_eq!(IoType::read_only() | IoType::write_only(), IoType::read_write());
        assert!(IoType::none().is_none());
    }

    #[test]
    fn capacity_is_bounded() {
        let cap = fd_limit();
        assert!(cap >= 1);
        assert!(cap <= MAX_EVENTS);
    }
}
