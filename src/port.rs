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

//! Completion port: a worker pool multiplexing readiness events and handler tasks over a shared
//! one-shot polling facility.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::cell::Cell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;

use crate::sys::{IoType, SharedPoll};
use crate::timeouts::{TimerHandle, TimerWheel};
use crate::Error;

#[cfg(any(target_os = "linux", target_os = "android"))]
type SysPoller = crate::sys::epoll::Epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
type SysPoller = crate::sys::kqueue::Kqueue;

/// Handler nesting level above which [`Port::invoke`] defers to the task queue instead of running
/// on the caller stack.
const MAX_INVOKE_DEPTH: usize = 16;

/// Number of channels force-closed per lock acquisition during [`Port::shutdown_now`].
const CLOSE_BATCH: usize = 32;

thread_local! {
    static INVOKE_DEPTH: Cell<usize> = Cell::new(0);
}

/// A channel servable by a [`Port`]: it exposes its descriptor and reacts to readiness and to a
/// forced close during port shutdown.
pub trait PortChannel: AsRawFd + Send + Sync {
    /// Called from a worker thread when the descriptor fires. The one-shot registration has
    /// already been consumed; the channel re-arms itself via [`Port::start_poll`] if it still has
    /// pending work.
    fn on_event(self: Arc<Self>, ready: IoType);

    /// Called during [`Port::shutdown_now`]; must fail the channel's pending operations.
    fn close_channel(self: Arc<Self>);
}

/// Queued work unit for the worker pool.
enum Task {
    Run(Box<dyn FnOnce() + Send>),
    /// Terminates exactly one worker.
    Poison,
}

/// Byte-per-task signalling pipe waking workers blocked in the poller.
///
/// Unlike the collapsing wakeup channel of the readiness selector, every queued task writes its
/// own byte: `n` queued tasks must wake `n` workers. The watched reading half is level-triggered,
/// so every worker inside the wait call wakes up; whoever wins the nonblocking one-byte read
/// services the task and the rest go back to waiting.
struct TokenPipe {
    // Blocking: a full pipe applies backpressure to task submission.
    writer: UnixStream,
    // Nonblocking: losing the race for a token must not block a worker.
    reader: UnixStream,
}

impl TokenPipe {
    fn new() -> io::Result<Self> {
        let (writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        Ok(Self { writer, reader })
    }

    fn reader_fd(&self) -> RawFd { self.reader.as_raw_fd() }

    fn send_token(&self) -> io::Result<()> {
        loop {
            match (&self.writer).write(&[0x1]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Attempts to claim one token; false means another worker got there first.
    fn take_token(&self) -> bool {
        let mut buf = [0u8; 1];
        loop {
            return match (&self.reader).read(&mut buf) {
                Ok(len) => len == 1,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => false,
            };
        }
    }
}

/// Completion port configuration.
#[derive(Clone, Debug)]
pub struct PortConfig {
    /// Worker pool size; clamped to at least one.
    pub workers: usize,
    /// Whether asynchronous operations may attempt their first I/O on the submitting thread
    /// before parking, trading fairness for latency when the channel is already ready.
    pub inline_io: bool,
    /// Event buffer capacity per worker.
    pub capacity: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map(usize::from).unwrap_or(2),
            inline_io: true,
            capacity: 512,
        }
    }
}

struct PortInner {
    poller: SysPoller,
    channels: RwLock<HashMap<RawFd, Arc<dyn PortChannel>>>,
    task_tx: chan::Sender<Task>,
    task_rx: chan::Receiver<Task>,
    tokens: TokenPipe,
    timer: TimerWheel,
    workers: usize,
    inline_io: bool,
    shutdown: AtomicBool,
    poisoned: AtomicBool,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Shared handle to a completion port. Cloning is cheap and every clone drives the same worker
/// pool.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    /// Opens a port and spawns its worker pool.
    pub fn open(config: PortConfig) -> Result<Self, Error> {
        let workers = config.workers.max(1);
        let poller = SysPoller::create(config.capacity)?;
        let tokens = TokenPipe::new()?;
        poller.watch(tokens.reader_fd(), IoType::read_only(), false)?;

        let (task_tx, task_rx) = chan::unbounded();
        let inner = Arc::new(PortInner {
            poller,
            channels: RwLock::new(empty!()),
            task_tx,
            task_rx,
            tokens,
            timer: TimerWheel::new()?,
            workers,
            inline_io: config.inline_io,
            shutdown: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            handles: Mutex::new(empty!()),
        });

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let runner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("mux-port-{index}"))
                .spawn(move || Self::worker(runner))
                .map_err(Error::Io)?;
            handles.push(handle);
        }
        *inner.handles.lock().expect("worker handle list poisoned") = handles;

        #[cfg(feature = "log")]
        log::debug!(target: "mux-port", "Opened completion port with {workers} workers");

        Ok(Self { inner })
    }

    pub fn is_shutdown(&self) -> bool { self.inner.shutdown.load(Ordering::Acquire) }

    /// Whether channels may attempt their first I/O on the submitting thread.
    pub fn inline_io(&self) -> bool { self.inner.inline_io }

    /// Associates a channel with the port. Exactly one channel may own a descriptor at a time.
    pub fn register(&self, channel: Arc<dyn PortChannel>) -> Result<(), Error> {
        if self.is_shutdown() {
            return Err(Error::Closed);
        }
        let fd = channel.as_raw_fd();
        let mut channels = self.inner.channels.write().expect("channel map poisoned");
        if channels.contains_key(&fd) {
            return Err(Error::AlreadyRegistered);
        }
        #[cfg(feature = "log")]
        log::debug!(target: "mux-port", "Registering channel {fd}");
        channels.insert(fd, channel);
        Ok(())
    }

    /// Dissociates a channel; pending one-shot registrations for it are removed from the poller.
    /// After a graceful [`Port::shutdown`], dissociating the last channel releases the workers.
    pub fn unregister(&self, fd: RawFd) {
        let removed =
            self.inner.channels.write().expect("channel map poisoned").remove(&fd).is_some();
        if !removed {
            return;
        }
        #[cfg(feature = "log")]
        log::debug!(target: "mux-port", "Unregistering channel {fd}");
        let _ = self.inner.poller.unwatch(fd);
        if self.is_shutdown()
            && self.inner.channels.read().expect("channel map poisoned").is_empty()
        {
            self.release_workers();
        }
    }

    /// Arms a one-shot readiness registration for a channel descriptor. The registration is
    /// consumed by a single event delivery; the channel re-arms as long as it has pending
    /// operations.
    pub fn start_poll(&self, fd: RawFd, interest: IoType) -> Result<(), Error> {
        self.inner.poller.watch(fd, interest, true)?;
        Ok(())
    }

    /// Removes any one-shot registration for a descriptor.
    pub fn stop_poll(&self, fd: RawFd) -> Result<(), Error> {
        self.inner.poller.unwatch(fd)?;
        Ok(())
    }

    /// Queues a task for the worker pool and wakes one worker to service it.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        if self.is_shutdown() {
            return Err(Error::Closed);
        }
        self.inner
            .task_tx
            .send(Task::Run(Box::new(task)))
            .map_err(|_| Error::Closed)?;
        self.inner.tokens.send_token()?;
        Ok(())
    }

    /// Runs a completion handler, on the caller stack when the thread-local nesting level
    /// permits, otherwise via [`Port::execute`]. Bounding the nesting level prevents unbounded
    /// stack growth when handlers synchronously start further operations which complete
    /// immediately.
    pub fn invoke(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        let depth = INVOKE_DEPTH.with(Cell::get);
        if depth >= MAX_INVOKE_DEPTH {
            return self.execute(task);
        }
        INVOKE_DEPTH.with(|d| d.set(depth + 1));
        task();
        INVOKE_DEPTH.with(|d| d.set(depth));
        Ok(())
    }

    /// Schedules a deadline task on the port's timer service.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.inner.timer.schedule(delay, task)
    }

    /// Initiates graceful shutdown: no new channels or tasks are accepted, and the workers
    /// terminate once the last channel dissociates.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        #[cfg(feature = "log")]
        log::debug!(target: "mux-port", "Port shutdown initiated");
        if self.inner.channels.read().expect("channel map poisoned").is_empty() {
            self.release_workers();
        }
    }

    /// Shuts down immediately, force-closing every associated channel.
    pub fn shutdown_now(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.close_all_channels();
        self.release_workers();
    }

    /// Waits for every worker to terminate. Must be preceded by a shutdown call; joining from
    /// a worker thread skips that worker.
    pub fn join(&self) {
        let handles =
            std::mem::take(&mut *self.inner.handles.lock().expect("worker handle list poisoned"));
        for handle in handles {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Force-closes channels in small batches so the map lock is never held across a channel's
    /// close path (which re-enters [`Port::unregister`]).
    fn close_all_channels(&self) {
        loop {
            let batch: Vec<Arc<dyn PortChannel>> = {
                let channels = self.inner.channels.read().expect("channel map poisoned");
                channels.values().take(CLOSE_BATCH).cloned().collect()
            };
            if batch.is_empty() {
                break;
            }
            for channel in batch {
                let fd = channel.as_raw_fd();
                channel.close_channel();
                // A well-behaved channel unregisters itself; drop stragglers regardless so
                // the loop terminates.
                self.unregister(fd);
            }
        }
    }

    /// Sends one poison pill and one wakeup token per worker. Idempotent.
    fn release_workers(&self) {
        if self.inner.poisoned.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.inner.workers {
            let _ = self.inner.task_tx.send(Task::Poison);
            let _ = self.inner.tokens.send_token();
        }
        self.inner.timer.shutdown();
    }

    fn worker(inner: Arc<PortInner>) {
        let mut events = inner.poller.events();
        loop {
            let count = match inner.poller.wait(&mut events, None) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "mux-port", "Poller failed, terminating worker: {e}");
                    return;
                }
            };

            for index in 0..count {
                let event = SysPoller::event(&events, index);

                if event.fd == inner.tokens.reader_fd() {
                    if !inner.tokens.take_token() {
                        continue;
                    }
                    match inner.task_rx.try_recv() {
                        Ok(Task::Run(task)) => {
                            INVOKE_DEPTH.with(|d| d.set(1));
                            task();
                            INVOKE_DEPTH.with(|d| d.set(0));
                        }
                        Ok(Task::Poison) => return,
                        // Token without a task: the queue was drained by a sibling.
                        Err(_) => {}
                    }
                    continue;
                }

                let channel = inner
                    .channels
                    .read()
                    .expect("channel map poisoned")
                    .get(&event.fd)
                    .cloned();
                let Some(channel) = channel else {
                    // Dissociated while the event was in flight.
                    continue;
                };

                // A native-level failure dispatches as full readiness: the channel discovers
                // the concrete error from its own syscall.
                let ready = match event.res {
                    Ok(io) => io,
                    Err(_) => IoType::read_write(),
                };
                #[cfg(feature = "log")]
                log::trace!(target: "mux-port", "Dispatching `{ready}` readiness for {}", event.fd);
                channel.on_event(ready);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct TestChannel {
        socket: UnixStream,
        fired: chan::Sender<IoType>,
        closed: AtomicBool,
    }

    impl AsRawFd for TestChannel {
        fn as_raw_fd(&self) -> RawFd { self.socket.as_raw_fd() }
    }

    impl PortChannel for TestChannel {
        fn on_event(self: Arc<Self>, ready: IoType) { self.fired.send(ready).unwrap(); }
        fn close_channel(self: Arc<Self>) { self.closed.store(true, Ordering::Release); }
    }

    fn port(workers: usize) -> Port {
        Port::open(PortConfig {
            workers,
            inline_io: false,
            capacity: 64,
        })
        .unwrap()
    }

    #[test]
    fn executes_queued_tasks() {
        let port = port(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = chan::unbounded();

        for _ in 0..8 {
            let counter = counter.clone();
            let tx = tx.clone();
            port.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
        }
        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);

        port.shutdown();
        port.join();
    }

    #[test]
    fn dispatches_oneshot_readiness() {
        let port = port(2);
        let (local, mut remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let (tx, rx) = chan::unbounded();

        let channel = Arc::new(TestChannel {
            socket: local,
            fired: tx,
            closed: AtomicBool::new(false),
        });
        let fd = channel.as_raw_fd();
        port.register(channel).unwrap();
        port.start_poll(fd, IoType::read_only()).unwrap();

        remote.write_all(&[0x1]).unwrap();
        let ready = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ready.read);

        // The one-shot registration is consumed: more data fires nothing until re-armed.
        remote.write_all(&[0x2]).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        port.start_poll(fd, IoType::read_only()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap().read);

        port.unregister(fd);
        port.shutdown();
        port.join();
    }

    #[test]
    fn invoke_runs_inline_below_depth_limit() {
        let port = port(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        port.invoke(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        // Ran synchronously on this thread.
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        port.shutdown();
        port.join();
    }

    fn nest(
        port: Port,
        remaining: usize,
        main: thread::ThreadId,
        off_stack: Arc<AtomicUsize>,
        done: chan::Sender<()>,
    ) {
        if thread::current().id() != main {
            off_stack.fetch_add(1, Ordering::SeqCst);
        }
        if remaining == 0 {
            done.send(()).unwrap();
            return;
        }
        let chained = port.clone();
        port.invoke(move || nest(chained, remaining - 1, main, off_stack, done)).unwrap();
    }

    #[test]
    fn invoke_hands_off_above_depth_limit() {
        let port = port(1);
        let main = thread::current().id();
        let off_stack = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = chan::unbounded();

        // Chain far past the nesting bound; the overflow legs must migrate to a worker
        // instead of deepening the caller stack.
        nest(port.clone(), 64, main, off_stack.clone(), tx);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(off_stack.load(Ordering::SeqCst) > 0);

        port.shutdown();
        port.join();
    }

    #[test]
    fn register_guards() {
        let port = port(1);
        let (local, _remote) = UnixStream::pair().unwrap();
        let (tx, _rx) = chan::unbounded();

        let channel = Arc::new(TestChannel {
            socket: local,
            fired: tx.clone(),
            closed: AtomicBool::new(false),
        });
        port.register(channel.clone()).unwrap();
        assert!(matches!(port.register(channel.clone()), Err(Error::AlreadyRegistered)));

        port.unregister(channel.as_raw_fd());
        port.shutdown();
        assert!(matches!(port.register(channel), Err(Error::Closed)));
        assert!(matches!(port.execute(|| {}), Err(Error::Closed)));
        port.join();
    }

    #[test]
    fn shutdown_now_closes_channels() {
        let port = port(2);
        let (local, _remote) = UnixStream::pair().unwrap();
        let (tx, _rx) = chan::unbounded();

        let channel = Arc::new(TestChannel {
            socket: local,
            fired: tx,
            closed: AtomicBool::new(false),
        });
        port.register(channel.clone()).unwrap();

        port.shutdown_now();
        port.join();
        assert!(channel.closed.load(Ordering::Acquire));
        assert!(port.is_shutdown());
    }

    #[test]
    fn graceful_shutdown_waits_for_last_channel() {
        let port = port(2);
        let (local, _remote) = UnixStream::pair().unwrap();
        let (tx, _rx) = chan::unbounded();

        let channel = Arc::new(TestChannel {
            socket: local,
            fired: tx,
            closed: AtomicBool::new(false),
        });
        let fd = channel.as_raw_fd();
        port.register(channel).unwrap();

        port.shutdown();
        assert!(port.is_shutdown());
        // Workers are still alive servicing the remaining channel; dropping it releases them.
        port.unregister(fd);
        port.join();
    }
}
