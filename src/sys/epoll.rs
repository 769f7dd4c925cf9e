//! Linux `epoll` backend.
//!
//! [`Epoll`] wraps the raw kernel object with `&self` registration and wait calls, since the
//! kernel supports concurrent waiters on a single epoll descriptor; this is what the completion
//! port builds on. [`EpollFacility`] pairs one [`Epoll`] with a private [`EventArray`] for the
//! exclusive-owner [`Facility`] contract used by the multiplexer.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::sys::{fd_limit, millis, Facility, IoFail, IoType, Opcode, SharedPoll, SysEvent};

fn interest_bits(interest: IoType, oneshot: bool) -> u32 {
    let mut bits = 0;
    if interest.read {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.write {
        bits |= libc::EPOLLOUT as u32;
    }
    if oneshot {
        bits |= libc::EPOLLONESHOT as u32;
    }
    bits
}

fn translate(fd: RawFd, bits: u32) -> SysEvent {
    let res = if bits & libc::EPOLLHUP as u32 != 0 {
        Err(IoFail::Connectivity(bits as i32))
    } else if bits & libc::EPOLLERR as u32 != 0 {
        Err(IoFail::Os(bits as i32))
    } else {
        Ok(IoType {
            read: bits & libc::EPOLLIN as u32 != 0,
            write: bits & libc::EPOLLOUT as u32 != 0,
        })
    };
    SysEvent { fd, res }
}

/// Fixed-capacity array of `epoll_event` records filled by the kernel on each wait call.
///
/// The descriptor travels through the event payload (`u64` field), so a record round-trips the
/// `(fd, event mask)` pair written into it. Freed exactly once when the owner drops.
pub struct EventArray {
    buf: Box<[libc::epoll_event]>,
}

impl EventArray {
    pub fn new(capacity: usize) -> Self {
        let zero = libc::epoll_event { events: 0, u64: 0 };
        Self {
            buf: vec![zero; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize { self.buf.len() }

    /// Writes an event record at `index`.
    pub fn put(&mut self, index: usize, fd: RawFd, events: u32) {
        self.buf[index] = libc::epoll_event {
            events,
            u64: fd as u64,
        };
    }

    /// Reads back the `(fd, event mask)` pair at `index`.
    pub fn get(&self, index: usize) -> (RawFd, u32) {
        let ev = self.buf[index];
        (ev.u64 as RawFd, ev.events)
    }

    fn as_mut_ptr(&mut self) -> *mut libc::epoll_event { self.buf.as_mut_ptr() }
}

/// Raw epoll kernel object.
///
/// Closed exactly once when the last owner drops.
pub struct Epoll {
    fd: OwnedFd,
    capacity: usize,
}

impl Epoll {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            capacity: capacity.clamp(1, fd_limit()),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let res = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait_into(&self, events: &mut EventArray, timeout: Option<Duration>) -> io::Result<usize> {
        let count = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.capacity() as libc::c_int,
                millis(timeout),
            )
        };
        if count < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(count as usize)
    }
}

impl SharedPoll for Epoll {
    type Events = EventArray;

    fn create(capacity: usize) -> io::Result<Self> { Epoll::new(capacity) }

    fn events(&self) -> EventArray { EventArray::new(self.capacity) }

    fn watch(&self, fd: RawFd, interest: IoType, oneshot: bool) -> io::Result<()> {
        let bits = interest_bits(interest, oneshot);
        // Renewing a one-shot registration is the common case, so try MOD first and fall back to
        // ADD for descriptors the kernel does not know yet.
        match self.ctl(libc::EPOLL_CTL_MOD, fd, bits) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, bits)
            }
            other => other,
        }
    }

    fn unwatch(&self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    fn wait(&self, events: &mut EventArray, timeout: Option<Duration>) -> io::Result<usize> {
        self.wait_into(events, timeout)
    }

    fn event(events: &EventArray, index: usize) -> SysEvent {
        let (fd, bits) = events.get(index);
        translate(fd, bits)
    }
}

/// Single-owner readiness facility over epoll.
pub struct EpollFacility {
    epoll: Epoll,
    events: EventArray,
}

impl Facility for EpollFacility {
    fn create(capacity: usize) -> io::Result<Self> {
        let epoll = Epoll::new(capacity)?;
        let events = epoll.events();
        Ok(Self { epoll, events })
    }

    fn arm(&mut self, fd: RawFd, op: Opcode, interest: IoType) -> io::Result<()> {
        let bits = interest_bits(interest, false);
        let res = match op {
            Opcode::Add => match self.epoll.ctl(libc::EPOLL_CTL_ADD, fd, bits) {
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    self.epoll.ctl(libc::EPOLL_CTL_MOD, fd, bits)
                }
                other => other,
            },
            Opcode::Modify => self.epoll.ctl(libc::EPOLL_CTL_MOD, fd, bits),
            Opcode::Delete => match self.epoll.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
                other => other,
            },
        };
        res
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.epoll.wait_into(&mut self.events, timeout)
    }

    fn event(&self, index: usize) -> SysEvent {
        let (fd, bits) = self.events.get(index);
        translate(fd, bits)
    }

    fn capacity(&self) -> usize { self.events.capacity() }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn array_round_trip() {
        let mut array = EventArray::new(4);
        array.put(0, 5, libc::EPOLLIN as u32);
        array.put(3, 11, libc::EPOLLOUT as u32 | libc::EPOLLONESHOT as u32);
        assert_eq!(array.get(0), (5, libc::EPOLLIN as u32));
        assert_eq!(array.get(3), (11, libc::EPOLLOUT as u32 | libc::EPOLLONESHOT as u32));
    }

    #[test]
    fn facility_readiness() -> io::Result<()> {
        let (mut writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;

        let mut facility = EpollFacility::create(8)?;
        facility.arm(reader.as_raw_fd(), Opcode::Add, IoType::read_only())?;

        assert_eq!(facility.wait(Some(Duration::from_millis(1)))?, 0);

        writer.write_all(&[0x1])?;
        assert_eq!(facility.wait(Some(Duration::from_millis(100)))?, 1);
        let ev = facility.event(0);
        assert_eq!(ev.fd, reader.as_raw_fd());
        assert_eq!(ev.res.unwrap(), IoType::read_only());
        Ok(())
    }

    #[test]
    fn oneshot_requires_rearm() -> io::Result<()> {
        let (mut writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;

        let epoll = Epoll::new(8)?;
        let mut events = epoll.events();
        epoll.watch(reader.as_raw_fd(), IoType::read_only(), true)?;

        writer.write_all(&[0x1])?;
        assert_eq!(epoll.wait_into(&mut events, Some(Duration::from_millis(100)))?, 1);

        // Without renewal the kernel stays silent even though data is still buffered.
        writer.write_all(&[0x2])?;
        assert_eq!(epoll.wait_into(&mut events, Some(Duration::from_millis(10)))?, 0);

        epoll.watch(reader.as_raw_fd(), IoType::read_only(), true)?;
        assert_eq!(epoll.wait_into(&mut events, Some(Duration::from_millis(100)))?, 1);
        Ok(())
    }
}
