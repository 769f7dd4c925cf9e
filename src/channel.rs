//! Asynchronous TCP channels driven by a completion [`Port`].
//!
//! Every operation returns a [`Completion`] handle immediately; the result is produced exactly
//! once, by whichever of the three racing parties gets there first: a genuine I/O completion on a
//! worker thread, a deadline task from the port's timer service, or a cancellation. The pending
//! slot per direction is handed over by grab-and-clear under the channel state lock, so the
//! losers of the race find the slot empty and back off.

use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::nonblock::{finish_connect, IoStatus, ReadNonblocking, WriteNonblocking};
use crate::port::{Port, PortChannel};
use crate::sys::IoType;
use crate::timeouts::TimerHandle;
use crate::Error;

struct CompletionState<T> {
    result: Option<Result<T, Error>>,
    completed: bool,
}

struct CompletionShared<T> {
    state: Mutex<CompletionState<T>>,
    cvar: Condvar,
}

/// Exactly-once result cell for an asynchronous operation.
///
/// The first call to [`Completion::complete`] (or [`Completion::cancel`]) wins; all later
/// attempts report failure and their result is discarded. The result itself can be claimed once,
/// by [`Completion::wait`] or [`Completion::try_take`].
pub struct Completion<T> {
    shared: Arc<CompletionShared<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            shared: Arc::new(CompletionShared {
                state: Mutex::new(CompletionState {
                    result: None,
                    completed: false,
                }),
                cvar: Condvar::new(),
            }),
        }
    }

    fn completed(result: Result<T, Error>) -> Self {
        let completion = Self::new();
        completion.complete(result);
        completion
    }

    /// Publishes the result; returns false if the operation has already completed, in which case
    /// `result` is discarded.
    pub fn complete(&self, result: Result<T, Error>) -> bool {
        let mut state = self.shared.state.lock().expect("completion lock poisoned");
        if state.completed {
            return false;
        }
        state.completed = true;
        state.result = Some(result);
        drop(state);
        self.shared.cvar.notify_all();
        true
    }

    /// Completes the operation with [`Error::Cancelled`]; returns false when too late.
    pub fn cancel(&self) -> bool { self.complete(Err(Error::Cancelled)) }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().expect("completion lock poisoned").completed
    }

    /// Claims the result without blocking, if the operation has completed.
    pub fn try_take(&self) -> Option<Result<T, Error>> {
        self.shared.state.lock().expect("completion lock poisoned").result.take()
    }

    /// Blocks until the operation completes and claims the result. If the result was already
    /// claimed through another handle, reports cancellation.
    pub fn wait(self) -> Result<T, Error> {
        let mut state = self.shared.state.lock().expect("completion lock poisoned");
        while !state.completed {
            state = self.shared.cvar.wait(state).expect("completion lock poisoned");
        }
        state.result.take().unwrap_or(Err(Error::Cancelled))
    }

    /// Blocks up to `timeout` and claims the result if the operation completed in time. `None`
    /// means the operation is still pending; its deadline, if any, remains in force and the
    /// caller decides whether to keep waiting or [`Completion::cancel`].
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().expect("completion lock poisoned");
        while !state.completed {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .cvar
                .wait_timeout(state, deadline - now)
                .expect("completion lock poisoned")
                .0;
        }
        state.result.take()
    }
}

fn sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Initiates a nonblocking connect; the boolean reports whether establishment is still in flight
/// (`EINPROGRESS`) and must be finished on write readiness.
fn nonblocking_connect(addr: SocketAddr) -> io::Result<(TcpStream, bool)> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // The descriptor is owned from here on; errors below close it on drop.
    let socket = unsafe { TcpStream::from_raw_fd(fd) };
    socket.set_nonblocking(true)?;

    let (storage, len) = sockaddr(addr);
    let res =
        unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if res == 0 {
        return Ok((socket, false));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => Ok((socket, true)),
        Some(libc::EINTR) => Ok((socket, true)),
        _ => Err(err),
    }
}

struct PendingConnect {
    completion: Completion<()>,
    timer: Option<TimerHandle>,
}

struct PendingRead {
    buf: Vec<u8>,
    completion: Completion<(Vec<u8>, usize)>,
    timer: Option<TimerHandle>,
}

struct PendingWrite {
    buf: Vec<u8>,
    completion: Completion<usize>,
    timer: Option<TimerHandle>,
}

#[derive(Default)]
struct StreamState {
    connect: Option<PendingConnect>,
    read: Option<PendingRead>,
    write: Option<PendingWrite>,
    // A timed-out direction stays disabled; its stream position is indeterminate.
    read_killed: bool,
    write_killed: bool,
}

struct StreamInner {
    socket: TcpStream,
    port: Port,
    state: Mutex<StreamState>,
    closed: AtomicBool,
}

impl StreamInner {
    fn op_error(&self, e: io::Error) -> Error {
        if self.closed.load(Ordering::Acquire) {
            Error::AsyncClosed
        } else {
            Error::Io(e)
        }
    }

    fn interest(state: &StreamState) -> IoType {
        IoType {
            read: state.read.is_some(),
            write: state.write.is_some() || state.connect.is_some(),
        }
    }

    /// Re-arms the one-shot registration for whatever is still pending. A registration that
    /// cannot be renewed will never produce another event, so the failure is delivered straight
    /// through the parked completions.
    fn rearm(&self, state: &mut StreamState) {
        let interest = Self::interest(state);
        if interest.is_none() {
            return;
        }
        if let Err(err) = self.port.start_poll(self.socket.as_raw_fd(), interest) {
            if let Some(mut pending) = state.connect.take() {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Err(self.rearm_failure(&err)));
            }
            if let Some(mut pending) = state.read.take() {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Err(self.rearm_failure(&err)));
            }
            if let Some(mut pending) = state.write.take() {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Err(self.rearm_failure(&err)));
            }
        }
    }

    // One error per parked operation; `io::Error` is not clonable.
    fn rearm_failure(&self, err: &Error) -> Error {
        if self.closed.load(Ordering::Acquire) {
            return Error::AsyncClosed;
        }
        match err {
            Error::Io(e) => match e.raw_os_error() {
                Some(code) => Error::Io(io::Error::from_raw_os_error(code)),
                None => Error::Io(io::Error::new(e.kind(), "polling registration lost")),
            },
            _ => Error::AsyncClosed,
        }
    }

    fn finish_connect_ready(&self) {
        let state = &mut *self.state.lock().expect("stream state poisoned");
        let Some(mut pending) = state.connect.take() else {
            // The slot lost a completion race; the event still consumed the one-shot
            // registration, which sibling directions depend on.
            self.rearm(state);
            return;
        };
        if let Some(timer) = pending.timer.take() {
            timer.cancel();
        }
        if !pending.completion.is_done() {
            let result = finish_connect(&self.socket).map_err(|e| self.op_error(e));
            pending.completion.complete(result);
        }
        self.rearm(state);
    }

    fn finish_read(&self) {
        let state = &mut *self.state.lock().expect("stream state poisoned");
        let Some(mut pending) = state.read.take() else {
            // A timed-out or cancelled read already emptied the slot, but the event consumed
            // the one-shot registration; a still-parked write must get it back.
            self.rearm(state);
            return;
        };
        if pending.completion.is_done() {
            self.rearm(state);
            return;
        }
        match (&self.socket).read_nonblocking(&mut pending.buf) {
            IoStatus::WouldBlock => state.read = Some(pending),
            IoStatus::Success(len) => {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Ok((pending.buf, len)));
            }
            IoStatus::Shutdown => {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Ok((pending.buf, 0)));
            }
            IoStatus::Err(e) => {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Err(self.op_error(e)));
            }
        }
        self.rearm(state);
    }

    fn finish_write(&self) {
        let state = &mut *self.state.lock().expect("stream state poisoned");
        let Some(mut pending) = state.write.take() else {
            // Same as the read side: the registration was consumed on behalf of a dead slot
            // and must be renewed for whatever is still pending.
            self.rearm(state);
            return;
        };
        if pending.completion.is_done() {
            self.rearm(state);
            return;
        }
        match (&self.socket).write_nonblocking(&pending.buf) {
            IoStatus::WouldBlock => state.write = Some(pending),
            IoStatus::Success(len) => {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Ok(len));
            }
            IoStatus::Shutdown => {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Err(Error::AsyncClosed));
            }
            IoStatus::Err(e) => {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Err(self.op_error(e)));
            }
        }
        self.rearm(state);
    }

    fn timeout_connect(&self) {
        let mut state = self.state.lock().expect("stream state poisoned");
        if let Some(pending) = state.connect.take() {
            pending.completion.complete(Err(Error::TimedOut));
        }
    }

    fn timeout_read(&self) {
        let mut state = self.state.lock().expect("stream state poisoned");
        if let Some(pending) = state.read.take() {
            state.read_killed = true;
            pending.completion.complete(Err(Error::TimedOut));
        }
    }

    fn timeout_write(&self) {
        let mut state = self.state.lock().expect("stream state poisoned");
        if let Some(pending) = state.write.take() {
            state.write_killed = true;
            pending.completion.complete(Err(Error::TimedOut));
        }
    }

    fn close_inner(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let fd = self.socket.as_raw_fd();
        #[cfg(feature = "log")]
        log::debug!(target: "mux-channel", "Closing stream channel {fd}");
        let _ = self.port.stop_poll(fd);
        self.port.unregister(fd);

        let mut state = self.state.lock().expect("stream state poisoned");
        let pendings = (state.connect.take(), state.read.take(), state.write.take());
        drop(state);
        if let Some(mut pending) = pendings.0 {
            if let Some(timer) = pending.timer.take() {
                timer.cancel();
            }
            pending.completion.complete(Err(Error::AsyncClosed));
        }
        if let Some(mut pending) = pendings.1 {
            if let Some(timer) = pending.timer.take() {
                timer.cancel();
            }
            pending.completion.complete(Err(Error::AsyncClosed));
        }
        if let Some(mut pending) = pendings.2 {
            if let Some(timer) = pending.timer.take() {
                timer.cancel();
            }
            pending.completion.complete(Err(Error::AsyncClosed));
        }
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

impl AsRawFd for StreamInner {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd { self.socket.as_raw_fd() }
}

impl PortChannel for StreamInner {
    fn on_event(self: Arc<Self>, ready: IoType) {
        if ready.write {
            let connecting =
                self.state.lock().expect("stream state poisoned").connect.is_some();
            if connecting {
                self.finish_connect_ready();
            } else {
                // Writes are dispatched through the task queue rather than finished on the
                // polling stack, keeping event scanning responsive under write pressure.
                let inner = self.clone();
                if self.port.execute(move || inner.finish_write()).is_err() {
                    self.finish_write();
                }
            }
        }
        if ready.read {
            // Reads are finished on the dispatching stack through the depth-bounded invoker,
            // which spills to the task queue if completions start chaining too deep.
            let inner = self.clone();
            if self.port.invoke(move || inner.finish_read()).is_err() {
                self.finish_read();
            }
        }
    }

    fn close_channel(self: Arc<Self>) { self.close_inner(); }
}

/// Asynchronous TCP stream associated with a completion port.
pub struct AsyncStream {
    inner: Arc<StreamInner>,
}

impl AsyncStream {
    /// Initiates an asynchronous connect. The stream handle is usable for reads and writes once
    /// the returned completion resolves successfully.
    pub fn connect(
        port: &Port,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<(Self, Completion<()>), Error> {
        let (socket, in_progress) = nonblocking_connect(addr)?;
        #[cfg(feature = "log")]
        log::debug!(target: "mux-channel", "Connecting to {addr}, in flight: {in_progress}");
        let inner = Arc::new(StreamInner {
            socket,
            port: port.clone(),
            state: Mutex::new(StreamState::default()),
            closed: AtomicBool::new(false),
        });
        port.register(inner.clone())?;

        let completion = Completion::new();
        if in_progress {
            let state = &mut *inner.state.lock().expect("stream state poisoned");
            let timer = timeout.map(|delay| {
                let target = inner.clone();
                port.schedule(delay, move || target.timeout_connect())
            });
            state.connect = Some(PendingConnect {
                completion: completion.clone(),
                timer,
            });
            inner.rearm(state);
        } else {
            completion.complete(Ok(()));
        }
        Ok((Self { inner }, completion))
    }

    /// Wraps an already connected socket, e.g. one produced by [`AsyncListener::accept`].
    pub fn from_stream(port: &Port, socket: TcpStream) -> Result<Self, Error> {
        socket.set_nonblocking(true)?;
        let inner = Arc::new(StreamInner {
            socket,
            port: port.clone(),
            state: Mutex::new(StreamState::default()),
            closed: AtomicBool::new(false),
        });
        port.register(inner.clone())?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.inner.socket.local_addr() }
    pub fn peer_addr(&self) -> io::Result<SocketAddr> { self.inner.socket.peer_addr() }

    /// Starts an asynchronous read into `buf`. Resolves to the buffer and the number of bytes
    /// read; zero with a non-empty buffer means end-of-stream. At most one read may be pending.
    pub fn read(
        &self,
        mut buf: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Completion<(Vec<u8>, usize)>, Error> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::AsyncClosed);
        }
        let state = &mut *inner.state.lock().expect("stream state poisoned");
        if state.connect.is_some() {
            return Err(Error::Conflict);
        }
        if state.read_killed {
            return Err(Error::Disabled);
        }
        if state.read.is_some() {
            return Err(Error::Conflict);
        }

        if inner.port.inline_io() {
            match (&inner.socket).read_nonblocking(&mut buf) {
                IoStatus::Success(len) => return Ok(Completion::completed(Ok((buf, len)))),
                IoStatus::Shutdown => return Ok(Completion::completed(Ok((buf, 0)))),
                IoStatus::WouldBlock => {}
                IoStatus::Err(e) => return Err(inner.op_error(e)),
            }
        }

        let completion = Completion::new();
        let timer = timeout.map(|delay| {
            let target = inner.clone();
            inner.port.schedule(delay, move || target.timeout_read())
        });
        state.read = Some(PendingRead {
            buf,
            completion: completion.clone(),
            timer,
        });
        inner.rearm(state);
        Ok(completion)
    }

    /// Starts an asynchronous write of `buf`. Resolves to the number of bytes accepted by a
    /// single underlying write, which may be less than the buffer length. At most one write may
    /// be pending.
    pub fn write(
        &self,
        buf: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Completion<usize>, Error> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::AsyncClosed);
        }
        let state = &mut *inner.state.lock().expect("stream state poisoned");
        if state.connect.is_some() {
            return Err(Error::Conflict);
        }
        if state.write_killed {
            return Err(Error::Disabled);
        }
        if state.write.is_some() {
            return Err(Error::Conflict);
        }

        if inner.port.inline_io() {
            match (&inner.socket).write_nonblocking(&buf) {
                IoStatus::Success(len) => return Ok(Completion::completed(Ok(len))),
                IoStatus::Shutdown => return Err(Error::AsyncClosed),
                IoStatus::WouldBlock => {}
                IoStatus::Err(e) => return Err(inner.op_error(e)),
            }
        }

        let completion = Completion::new();
        let timer = timeout.map(|delay| {
            let target = inner.clone();
            inner.port.schedule(delay, move || target.timeout_write())
        });
        state.write = Some(PendingWrite {
            buf,
            completion: completion.clone(),
            timer,
        });
        inner.rearm(state);
        Ok(completion)
    }

    /// Closes the channel: dissociates it from the port, fails every pending operation with
    /// [`Error::AsyncClosed`] and shuts the socket down. Idempotent.
    pub fn close(&self) { self.inner.close_inner() }
}

impl Drop for AsyncStream {
    fn drop(&mut self) { self.inner.close_inner() }
}

struct PendingAccept {
    completion: Completion<(TcpStream, SocketAddr)>,
    timer: Option<TimerHandle>,
}

#[derive(Default)]
struct ListenerState {
    accept: Option<PendingAccept>,
}

struct ListenerInner {
    socket: TcpListener,
    port: Port,
    state: Mutex<ListenerState>,
    closed: AtomicBool,
}

impl ListenerInner {
    fn op_error(&self, e: io::Error) -> Error {
        if self.closed.load(Ordering::Acquire) {
            Error::AsyncClosed
        } else {
            Error::Io(e)
        }
    }

    fn try_accept(&self) -> IoStatusAccept {
        loop {
            return match self.socket.accept() {
                Ok(pair) => IoStatusAccept::Accepted(pair),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoStatusAccept::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => IoStatusAccept::Err(e),
            };
        }
    }

    fn finish_accept(&self) {
        let state = &mut *self.state.lock().expect("listener state poisoned");
        let Some(mut pending) = state.accept.take() else {
            return;
        };
        if pending.completion.is_done() {
            return;
        }
        match self.try_accept() {
            IoStatusAccept::WouldBlock => {
                let _ = self.port.start_poll(self.socket.as_raw_fd(), IoType::read_only());
                state.accept = Some(pending);
            }
            IoStatusAccept::Accepted(pair) => {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Ok(pair));
            }
            IoStatusAccept::Err(e) => {
                if let Some(timer) = pending.timer.take() {
                    timer.cancel();
                }
                pending.completion.complete(Err(self.op_error(e)));
            }
        }
    }

    fn timeout_accept(&self) {
        let mut state = self.state.lock().expect("listener state poisoned");
        if let Some(pending) = state.accept.take() {
            pending.completion.complete(Err(Error::TimedOut));
        }
    }

    fn close_inner(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let fd = self.socket.as_raw_fd();
        #[cfg(feature = "log")]
        log::debug!(target: "mux-channel", "Closing listener channel {fd}");
        let _ = self.port.stop_poll(fd);
        self.port.unregister(fd);
        let pending = self.state.lock().expect("listener state poisoned").accept.take();
        if let Some(mut pending) = pending {
            if let Some(timer) = pending.timer.take() {
                timer.cancel();
            }
            pending.completion.complete(Err(Error::AsyncClosed));
        }
    }
}

enum IoStatusAccept {
    Accepted((TcpStream, SocketAddr)),
    WouldBlock,
    Err(io::Error),
}

impl AsRawFd for ListenerInner {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd { self.socket.as_raw_fd() }
}

impl PortChannel for ListenerInner {
    fn on_event(self: Arc<Self>, ready: IoType) {
        if ready.read {
            self.finish_accept();
        }
    }

    fn close_channel(self: Arc<Self>) { self.close_inner(); }
}

/// Asynchronous TCP listener associated with a completion port.
pub struct AsyncListener {
    inner: Arc<ListenerInner>,
}

impl AsyncListener {
    pub fn bind(port: &Port, addr: SocketAddr) -> Result<Self, Error> {
        let socket = TcpListener::bind(addr)?;
        socket.set_nonblocking(true)?;
        let inner = Arc::new(ListenerInner {
            socket,
            port: port.clone(),
            state: Mutex::new(ListenerState::default()),
            closed: AtomicBool::new(false),
        });
        port.register(inner.clone())?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.inner.socket.local_addr() }

    /// Starts an asynchronous accept. The accepted socket is returned in blocking mode; wrap it
    /// with [`AsyncStream::from_stream`] for further asynchronous use. At most one accept may be
    /// pending; a timed-out accept does not disable the listener.
    pub fn accept(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Completion<(TcpStream, SocketAddr)>, Error> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::AsyncClosed);
        }
        let state = &mut *inner.state.lock().expect("listener state poisoned");
        if state.accept.is_some() {
            return Err(Error::Conflict);
        }

        if inner.port.inline_io() {
            match inner.try_accept() {
                IoStatusAccept::Accepted(pair) => return Ok(Completion::completed(Ok(pair))),
                IoStatusAccept::WouldBlock => {}
                IoStatusAccept::Err(e) => return Err(inner.op_error(e)),
            }
        }

        let completion = Completion::new();
        let timer = timeout.map(|delay| {
            let target = inner.clone();
            inner.port.schedule(delay, move || target.timeout_accept())
        });
        state.accept = Some(PendingAccept {
            completion: completion.clone(),
            timer,
        });
        inner.port.start_poll(inner.socket.as_raw_fd(), IoType::read_only())?;
        Ok(completion)
    }

    /// Closes the listener, failing a pending accept with [`Error::AsyncClosed`]. Idempotent.
    pub fn close(&self) { self.inner.close_inner() }
}

impl Drop for AsyncListener {
    fn drop(&mut self) { self.inner.close_inner() }
}
