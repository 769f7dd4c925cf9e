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

//! Readiness multiplexer: one descriptor set, one native polling facility, a pending-registration
//! log and a wakeup channel.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use crate::sys::{fd_limit, Facility, IoType, Opcode, SysEvent};
use crate::waker::{WakeupChannel, WakeupReader, WakeupSender};

/// A single queued registration change.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Update {
    /// Set the interest mask for a descriptor; a zero mask parks it in the idle set.
    Arm(RawFd, IoType),
    /// Remove a descriptor and forget its bookkeeping.
    Release(RawFd),
}

impl Update {
    fn fd(&self) -> RawFd {
        match *self {
            Update::Arm(fd, _) | Update::Release(fd) => fd,
        }
    }
}

/// Thread-safe queue of pending registration changes, coalesced per descriptor.
///
/// Changes queued here are applied to the native facility in FIFO order at the start of the next
/// poll cycle. A later interest change for the same descriptor supersedes the queued one in
/// place, so only the last mask ever reaches the facility; a queued release followed by a new
/// interest registration (descriptor number reuse) keeps both entries, in order.
#[derive(Debug, Default)]
pub struct UpdateLog {
    queue: VecDeque<Update>,
}

impl UpdateLog {
    pub fn new() -> Self { Self { queue: empty!() } }

    pub fn len(&self) -> usize { self.queue.len() }
    pub fn is_empty(&self) -> bool { self.queue.is_empty() }

    /// Queues an interest change for a descriptor, updating an already queued interest entry in
    /// place. A queued [`Update::Release`] for the same descriptor number is left untouched: the
    /// kernel may have reused the number for a new file, so the removal must still reach the
    /// facility before the new registration.
    pub fn set_interest(&mut self, fd: RawFd, interest: IoType) {
        for entry in self.queue.iter_mut() {
            if let Update::Arm(queued, _) = *entry {
                if queued == fd {
                    *entry = Update::Arm(fd, interest);
                    return;
                }
            }
        }
        self.queue.push_back(Update::Arm(fd, interest));
    }

    /// Queues removal of a descriptor, purging every not-yet-applied entry for it first.
    ///
    /// The purge guarantees that no syscall is ever issued for a descriptor which was queued but
    /// released before the next flush (it is typically about to be closed).
    pub fn release(&mut self, fd: RawFd) {
        self.queue.retain(|entry| entry.fd() != fd);
        self.queue.push_back(Update::Release(fd));
    }

    /// Interest mask currently queued for a descriptor, if any.
    pub fn queued(&self, fd: RawFd) -> Option<IoType> {
        self.queue.iter().find_map(|entry| match *entry {
            Update::Arm(qfd, interest) if qfd == fd => Some(interest),
            _ => None,
        })
    }

    fn drain(&mut self) -> VecDeque<Update> { std::mem::take(&mut self.queue) }
}

/// Orchestrates a native facility, the pending-registration log and the wakeup channel.
///
/// A descriptor known to the multiplexer is either armed in the native facility or parked in the
/// idle set, never both. Zero-interest descriptors are deregistered from the facility rather than
/// registered with an empty mask, so the kernel never delivers `POLLHUP`/`POLLERR` callbacks for
/// sockets the caller has expressed no interest in.
pub struct Multiplexer<F: Facility> {
    facility: F,
    log: Mutex<UpdateLog>,
    waker_tx: WakeupSender,
    waker_rx: WakeupReader,
    armed: HashSet<RawFd>,
    idle: HashSet<RawFd>,
    interrupted: bool,
    open: bool,
}

impl<F: Facility> Multiplexer<F> {
    /// Creates the facility and permanently arms the wakeup pipe in it.
    pub fn new() -> io::Result<Self> {
        let mut facility = F::create(fd_limit())?;
        let (waker_tx, waker_rx) = WakeupChannel::pair()?;
        facility.arm(waker_rx.as_raw_fd(), Opcode::Add, IoType::read_only())?;
        Ok(Self {
            facility,
            log: Mutex::new(UpdateLog::new()),
            waker_tx,
            waker_rx,
            armed: empty!(),
            idle: empty!(),
            interrupted: false,
            open: true,
        })
    }

    /// Cloneable sending half of the wakeup channel.
    pub fn waker(&self) -> WakeupSender { self.waker_tx.clone() }

    pub fn is_open(&self) -> bool { self.open }

    /// Registers a descriptor with zero interest; it enters the idle set at the next flush.
    pub fn add(&self, fd: RawFd) { self.set_interest(fd, IoType::none()) }

    /// Queues an interest change; applied at the start of the next [`Multiplexer::poll`].
    pub fn set_interest(&self, fd: RawFd, interest: IoType) {
        #[cfg(feature = "log")]
        log::trace!(target: "mux", "Queueing interest `{interest}` for {fd}");
        self.log.lock().expect("update log poisoned").set_interest(fd, interest);
    }

    /// Queues removal of a descriptor, purging its not-yet-applied changes.
    pub fn release(&self, fd: RawFd) {
        #[cfg(feature = "log")]
        log::trace!(target: "mux", "Releasing {fd}");
        self.log.lock().expect("update log poisoned").release(fd);
    }

    /// Runs one poll cycle: flushes the pending log, blocks in the native wait call and scans the
    /// results for the wakeup pipe.
    ///
    /// Returns the number of populated event slots, including a slot taken by the wakeup signal
    /// (exposed via [`Multiplexer::interrupted`] instead of [`Multiplexer::event`] iteration).
    /// The interrupted-syscall case is retried transparently while the multiplexer is open; any
    /// other native failure is fatal to the cycle and propagates.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::Other, "multiplexer is closed"));
        }
        self.flush()?;

        let count = loop {
            #[cfg(feature = "log")]
            log::trace!(target: "mux",
                "Polling {} armed descriptors with timeout {timeout:?}", self.armed.len() + 1);

            match self.facility.wait(timeout) {
                Ok(count) => break count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted && self.open => continue,
                Err(e) => return Err(e),
            }
        };

        let waker_fd = self.waker_rx.as_raw_fd();
        for index in 0..count {
            if self.facility.event(index).fd == waker_fd {
                #[cfg(feature = "log")]
                log::trace!(target: "mux", "Poll was interrupted by the wakeup channel");
                self.interrupted = true;
            }
        }
        Ok(count)
    }

    /// Whether the last poll cycle detected the wakeup signal.
    pub fn interrupted(&self) -> bool { self.interrupted }

    /// Drains the wakeup pipe and resets the interrupted flag.
    pub fn drain_wakeup(&mut self) -> io::Result<()> {
        self.waker_rx.drain()?;
        self.interrupted = false;
        Ok(())
    }

    /// Event at `index` of the last poll cycle. The caller must skip slots for which
    /// [`Multiplexer::is_waker`] reports true.
    pub fn event(&self, index: usize) -> SysEvent { self.facility.event(index) }

    pub fn is_waker(&self, fd: RawFd) -> bool { fd == self.waker_rx.as_raw_fd() }

    /// Whether a descriptor is currently parked in the idle set.
    pub fn is_idle(&self, fd: RawFd) -> bool { self.idle.contains(&fd) }

    /// Whether a descriptor is currently armed in the native facility.
    pub fn is_armed(&self, fd: RawFd) -> bool { self.armed.contains(&fd) }

    /// Marks the multiplexer closed. Native resources are freed when it drops.
    pub fn close(&mut self) { self.open = false; }

    /// Applies every queued change to the native facility via its opcode.
    fn flush(&mut self) -> io::Result<()> {
        let updates = self.log.lock().expect("update log poisoned").drain();
        for update in updates {
            match update {
                Update::Arm(fd, interest) if interest.is_none() => {
                    // Park: deregister instead of keeping an empty mask so the kernel stops
                    // reporting hangup/error conditions for this descriptor.
                    if self.armed.remove(&fd) {
                        self.facility.arm(fd, Opcode::Delete, IoType::none())?;
                    }
                    self.idle.insert(fd);
                }
                Update::Arm(fd, interest) => {
                    self.idle.remove(&fd);
                    if self.armed.contains(&fd) {
                        self.facility.arm(fd, Opcode::Modify, interest)?;
                    } else {
                        self.facility.arm(fd, Opcode::Add, interest)?;
                        self.armed.insert(fd);
                    }
                }
                Update::Release(fd) => {
                    self.idle.remove(&fd);
                    if self.armed.remove(&fd) {
                        self.facility.arm(fd, Opcode::Delete, IoType::none())?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::sys::DefaultFacility;

    #[test]
    fn log_coalesces_interest() {
        let mut log = UpdateLog::new();
        log.set_interest(3, IoType::read_only());
        log.set_interest(4, IoType::write_only());
        log.set_interest(3, IoType::read_write());
        log.set_interest(3, IoType::write_only());

        assert_eq!(log.len(), 2);
        assert_eq!(log.queued(3), Some(IoType::write_only()));
        assert_eq!(log.queued(4), Some(IoType::write_only()));
    }

    #[test]
    fn release_purges_queued_add() {
        let mut log = UpdateLog::new();
        log.set_interest(5, IoType::read_only());
        log.release(5);

        // The queued add must never reach the facility.
        assert_eq!(log.queued(5), None);
        assert_eq!(log.len(), 1);
        assert!(matches!(log.queue[0], Update::Release(5)));
    }

    #[test]
    fn reused_fd_keeps_queued_release() {
        let mut log = UpdateLog::new();
        log.set_interest(7, IoType::read_only());
        log.release(7);
        // The kernel may hand the released number to a fresh file before the next flush; the
        // delete must still precede the new registration.
        log.set_interest(7, IoType::write_only());

        assert_eq!(log.len(), 2);
        assert!(matches!(log.queue[0], Update::Release(7)));
        assert!(matches!(log.queue[1], Update::Arm(7, interest) if interest == IoType::write_only()));
        assert_eq!(log.queued(7), Some(IoType::write_only()));
    }

    #[test]
    fn zero_interest_parks_in_idle_set() -> io::Result<()> {
        let (mut writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        let fd = reader.as_raw_fd();

        let mut mux = Multiplexer::<DefaultFacility>::new()?;
        mux.set_interest(fd, IoType::read_only());
        writer.write_all(&[0x1])?;
        assert_eq!(mux.poll(Some(Duration::from_millis(100)))?, 1);
        assert!(mux.is_armed(fd));

        mux.set_interest(fd, IoType::none());
        assert_eq!(mux.poll(Some(Duration::from_millis(10)))?, 0);
        assert!(mux.is_idle(fd));
        assert!(!mux.is_armed(fd));

        // Regaining interest re-adds the descriptor to the facility.
        mux.set_interest(fd, IoType::read_only());
        assert_eq!(mux.poll(Some(Duration::from_millis(100)))?, 1);
        assert!(mux.is_armed(fd));
        assert!(!mux.is_idle(fd));
        Ok(())
    }

    #[test]
    fn wakeup_is_flagged_not_surfaced() -> io::Result<()> {
        let mut mux = Multiplexer::<DefaultFacility>::new()?;
        let waker = mux.waker();

        waker.interrupt()?;
        waker.interrupt()?;
        let count = mux.poll(Some(Duration::from_secs(5)))?;
        assert_eq!(count, 1);
        assert!(mux.interrupted());
        assert!(mux.is_waker(mux.event(0).fd));

        mux.drain_wakeup()?;
        assert!(!mux.interrupted());
        assert_eq!(mux.poll(Some(Duration::from_millis(10)))?, 0);
        Ok(())
    }

    #[test]
    fn poll_fails_after_close() -> io::Result<()> {
        let mut mux = Multiplexer::<DefaultFacility>::new()?;
        mux.close();
        assert!(mux.poll(Some(Duration::from_millis(1))).is_err());
        Ok(())
    }
}
