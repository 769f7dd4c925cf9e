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

//! Readiness selector: maps descriptors to interest keys and runs select cycles over a
//! [`Multiplexer`].

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::{BTreeSet, HashMap};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::sys::{DefaultFacility, Facility, IoFail, IoType};
use crate::waker::WakeupSender;
use crate::{Error, Multiplexer};

/// Kind of channel behind a registered descriptor; drives translation of native readiness into
/// portable ready operations.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum ChannelKind {
    /// Accepting socket: read readiness means a connection can be accepted.
    #[display("listener")]
    Listener,
    /// Connected (or connecting) socket: write readiness during connection establishment means
    /// the connect has finished.
    #[display("stream")]
    Stream,
}

/// Portable ready-operations bitmask.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Ready {
    pub accept: bool,
    pub connect: bool,
    pub read: bool,
    pub write: bool,
}

impl Ready {
    pub fn none() -> Self { Self::default() }

    pub fn is_none(self) -> bool { !self.accept && !self.connect && !self.read && !self.write }

    /// ORs in readiness bits; returns whether any new bit was added.
    fn or_assign(&mut self, other: Ready) -> bool {
        let before = *self;
        self.accept |= other.accept;
        self.connect |= other.connect;
        self.read |= other.read;
        self.write |= other.write;
        *self != before
    }
}

/// Association between a registered descriptor and its interest set, with an accumulator of ready
/// operations. Exactly one key exists per (selector, descriptor) pair.
#[derive(Debug)]
pub struct InterestKey {
    fd: RawFd,
    kind: ChannelKind,
    interest: IoType,
    ready: Ready,
    connect_pending: bool,
}

impl InterestKey {
    pub fn fd(&self) -> RawFd { self.fd }
    pub fn kind(&self) -> ChannelKind { self.kind }
    pub fn interest(&self) -> IoType { self.interest }
    pub fn ready(&self) -> Ready { self.ready }

    /// Translates native readiness into the portable bitmask per channel-type rules.
    ///
    /// A native-level failure turns on every interested operation instead: the caller discovers
    /// the concrete error from its next syscall on the channel.
    fn translate(&self, res: Result<IoType, IoFail>) -> Ready {
        let io = match res {
            Ok(io) => io,
            Err(_) => self.interest,
        };
        let mut ready = Ready::none();
        match self.kind {
            ChannelKind::Listener => ready.accept = io.read,
            ChannelKind::Stream => {
                ready.read = io.read;
                if self.connect_pending {
                    ready.connect = io.write;
                } else {
                    ready.write = io.write;
                }
            }
        }
        ready
    }
}

/// Single-threaded readiness selector tolerating concurrent [`Selector::wakeup`],
/// [`Selector::cancel`] and [`Selector::close`] calls from any other thread.
pub struct Selector<F: Facility = DefaultFacility> {
    mux: Multiplexer<F>,
    keys: HashMap<RawFd, InterestKey>,
    selected: BTreeSet<RawFd>,
    cancelled: Mutex<Vec<RawFd>>,
    closed: AtomicBool,
    waker: WakeupSender,
}

impl Selector<DefaultFacility> {
    /// Opens a selector over the platform default facility.
    pub fn open() -> Result<Self, Error> { Self::with_facility() }
}

impl<F: Facility> Selector<F> {
    /// Opens a selector over an explicitly chosen facility backend.
    pub fn with_facility() -> Result<Self, Error> {
        let mux = Multiplexer::new()?;
        let waker = mux.waker();
        Ok(Self {
            mux,
            keys: empty!(),
            selected: empty!(),
            cancelled: Mutex::new(empty!()),
            closed: AtomicBool::new(false),
            waker,
        })
    }

    pub fn is_open(&self) -> bool { !self.closed.load(Ordering::Acquire) }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Registers a channel, creating its interest key. The descriptor doubles as the key handle.
    pub fn register(
        &mut self,
        channel: &impl AsRawFd,
        kind: ChannelKind,
        interest: IoType,
    ) -> Result<RawFd, Error> {
        self.ensure_open()?;
        let fd = channel.as_raw_fd();
        if self.keys.contains_key(&fd) {
            return Err(Error::AlreadyRegistered);
        }

        #[cfg(feature = "log")]
        log::debug!(target: "mux-selector", "Registering {kind} {fd} with interest `{interest}`");

        self.mux.set_interest(fd, interest);
        self.keys.insert(fd, InterestKey {
            fd,
            kind,
            interest,
            ready: Ready::none(),
            connect_pending: false,
        });
        Ok(fd)
    }

    /// Changes the interest set of a registered key; applied at the next select cycle.
    pub fn set_interest(&mut self, fd: RawFd, interest: IoType) -> Result<(), Error> {
        self.ensure_open()?;
        let key = self.keys.get_mut(&fd).ok_or(Error::NotRegistered)?;
        key.interest = interest;
        self.mux.set_interest(fd, interest);
        Ok(())
    }

    /// Marks a stream key as having a connect in flight, so write readiness is reported as
    /// connect readiness until cleared.
    pub fn mark_connecting(&mut self, fd: RawFd, pending: bool) -> Result<(), Error> {
        self.ensure_open()?;
        let key = self.keys.get_mut(&fd).ok_or(Error::NotRegistered)?;
        key.connect_pending = pending;
        Ok(())
    }

    /// Queues deregistration of a key; processed during the next select cycle. Safe to call from
    /// any thread; unknown descriptors are ignored.
    pub fn cancel(&self, fd: RawFd) {
        self.cancelled.lock().expect("cancel queue poisoned").push(fd);
    }

    /// Key registered for a descriptor.
    pub fn key(&self, fd: RawFd) -> Option<&InterestKey> { self.keys.get(&fd) }

    /// Keys whose ready operations are non-empty since the last [`Selector::clear_selected`].
    pub fn selected(&self) -> impl Iterator<Item = &InterestKey> {
        self.selected.iter().filter_map(|fd| self.keys.get(fd))
    }

    /// Resets the selected-key set and every key's ready accumulator.
    pub fn clear_selected(&mut self) {
        for fd in std::mem::take(&mut self.selected) {
            if let Some(key) = self.keys.get_mut(&fd) {
                key.ready = Ready::none();
            }
        }
    }

    /// Runs one select cycle.
    ///
    /// Flushes queued cancellations, polls the multiplexer, translates native events into ready
    /// operations and publishes them through [`Selector::selected`]. Returns the number of keys
    /// whose ready operations gained new bits.
    pub fn select(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        self.ensure_open()?;
        self.flush_cancelled();

        // Cancellable blocking region: a concurrent close() sets the flag and interrupts the
        // poll through the wakeup channel.
        let count = self.mux.poll(timeout)?;
        if !self.is_open() {
            return Err(Error::Closed);
        }

        self.flush_cancelled();

        let mut updated = 0;
        for index in 0..count {
            let event = self.mux.event(index);
            if self.mux.is_waker(event.fd) {
                continue;
            }
            // Keys cancelled while the poll was blocked no longer exist; their events are
            // dropped on the floor.
            let Some(key) = self.keys.get_mut(&event.fd) else {
                continue;
            };

            let fired = key.translate(event.res);
            if fired.is_none() {
                continue;
            }
            if key.ready.or_assign(fired) {
                updated += 1;
            }
            self.selected.insert(event.fd);

            #[cfg(feature = "log")]
            log::trace!(target: "mux-selector", "Key {} is ready: {:?}", event.fd, key.ready);
        }

        if self.mux.interrupted() {
            self.mux.drain_wakeup()?;
        }
        Ok(updated)
    }

    /// Interrupts a select cycle blocked in the native wait call, or makes the next one return
    /// immediately. Never lost, and repeated calls collapse into a single interrupt.
    pub fn wakeup(&self) -> Result<(), Error> {
        self.waker.interrupt()?;
        Ok(())
    }

    /// Closes the selector. Idempotent; every subsequent operation fails with [`Error::Closed`].
    /// A select cycle blocked on another thread is interrupted. Native resources are released
    /// when the selector drops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            #[cfg(feature = "log")]
            log::debug!(target: "mux-selector", "Closing selector");
            let _ = self.waker.interrupt();
        }
    }

    fn flush_cancelled(&mut self) {
        let cancelled =
            std::mem::take(&mut *self.cancelled.lock().expect("cancel queue poisoned"));
        for fd in cancelled {
            if self.keys.remove(&fd).is_some() {
                #[cfg(feature = "log")]
                log::debug!(target: "mux-selector", "Deregistering {fd}");
                self.selected.remove(&fd);
                self.mux.release(fd);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Instant;

    use super::*;

    fn pair() -> (UnixStream, UnixStream) {
        let (local, remote) = UnixStream::pair().expect("socket pair");
        local.set_nonblocking(true).expect("nonblocking");
        (local, remote)
    }

    #[test]
    fn read_readiness_without_duplicates() -> Result<(), Error> {
        let (local, mut remote) = pair();
        let mut selector = Selector::open()?;
        let fd = selector.register(&local, ChannelKind::Stream, IoType::read_only())?;

        remote.write_all(&[0xAA]).unwrap();
        assert_eq!(selector.select(Some(Duration::from_millis(100)))?, 1);
        let key = selector.selected().next().expect("key selected");
        assert_eq!(key.fd(), fd);
        assert_eq!(key.ready(), Ready {
            read: true,
            ..Ready::none()
        });

        // The data is still buffered, so a level-triggered facility fires again; the ready
        // bits cannot grow though, and the cycle reports zero updated keys.
        assert_eq!(selector.select(Some(Duration::from_millis(10)))?, 0);
        assert_eq!(selector.selected().count(), 1);
        Ok(())
    }

    #[test]
    fn listener_translation_reports_accept() -> Result<(), Error> {
        let (local, mut remote) = pair();
        let mut selector = Selector::open()?;
        selector.register(&local, ChannelKind::Listener, IoType::read_only())?;

        remote.write_all(&[0x1]).unwrap();
        selector.select(Some(Duration::from_millis(100)))?;
        let key = selector.selected().next().expect("key selected");
        assert!(key.ready().accept);
        assert!(!key.ready().read);
        Ok(())
    }

    #[test]
    fn connect_pending_translation() -> Result<(), Error> {
        let (local, _remote) = pair();
        let mut selector = Selector::open()?;
        let fd = selector.register(&local, ChannelKind::Stream, IoType::write_only())?;
        selector.mark_connecting(fd, true)?;

        selector.select(Some(Duration::from_millis(100)))?;
        let key = selector.key(fd).unwrap();
        assert!(key.ready().connect);
        assert!(!key.ready().write);
        Ok(())
    }

    #[test]
    fn wakeup_interrupts_blocked_select() -> Result<(), Error> {
        let mut selector = Selector::open()?;
        let waker = selector.waker.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.interrupt().unwrap();
        });

        let started = Instant::now();
        // Blocks until the other thread interrupts; 5s timeout guards the test.
        let updated = selector.select(Some(Duration::from_secs(5)))?;
        assert_eq!(updated, 0);
        assert!(started.elapsed() < Duration::from_secs(2));

        // The interrupt was drained: the next cycle blocks until its own timeout.
        let started = Instant::now();
        assert_eq!(selector.select(Some(Duration::from_millis(50)))?, 0);
        assert!(started.elapsed() >= Duration::from_millis(40));

        handle.join().unwrap();
        Ok(())
    }

    #[test]
    fn wakeup_before_select_is_not_lost() -> Result<(), Error> {
        let selector = Selector::open()?;
        selector.wakeup()?;
        let mut selector = selector;

        let started = Instant::now();
        assert_eq!(selector.select(None)?, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn cancel_purges_pending_registration() -> Result<(), Error> {
        let (local, mut remote) = pair();
        let mut selector = Selector::open()?;
        let fd = selector.register(&local, ChannelKind::Stream, IoType::read_only())?;

        // Cancelled before any select cycle: the queued add must never reach the facility.
        selector.cancel(fd);
        remote.write_all(&[0x1]).unwrap();
        assert_eq!(selector.select(Some(Duration::from_millis(20)))?, 0);
        assert!(selector.key(fd).is_none());
        assert_eq!(selector.selected().count(), 0);
        Ok(())
    }

    #[test]
    fn close_is_idempotent_and_fails_fast() -> Result<(), Error> {
        let (local, _remote) = pair();
        let mut selector = Selector::open()?;
        selector.register(&local, ChannelKind::Stream, IoType::read_only())?;

        selector.close();
        selector.close();
        assert!(!selector.is_open());
        assert!(matches!(selector.select(None), Err(Error::Closed)));
        assert!(matches!(
            selector.set_interest(local.as_raw_fd(), IoType::none()),
            Err(Error::Closed)
        ));
        Ok(())
    }

    #[test]
    fn error_translation_forces_interest_ready() -> Result<(), Error> {
        let (local, remote) = pair();
        let mut selector = Selector::open()?;
        let fd = selector.register(&local, ChannelKind::Stream, IoType::read_only())?;

        // Peer hangup arrives as a native failure; the key must turn ready on its interest so
        // the caller discovers the condition via its next syscall.
        drop(remote);
        selector.select(Some(Duration::from_millis(100)))?;
        let key = selector.key(fd).unwrap();
        assert!(key.ready().read);

        let mut buf = [0u8; 8];
        assert_eq!((&local).read(&mut buf).unwrap(), 0);
        Ok(())
    }
}
