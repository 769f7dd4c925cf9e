//! macOS/BSD `kqueue` backend.
//!
//! Mirrors the epoll backend: [`Kqueue`] is the shared kernel object with `&self` calls (kqueue
//! supports concurrent waiters), [`KqueueFacility`] the exclusive-owner variant. Read and write
//! interest are separate kevent filters, so arming translates one [`IoType`] into up to two
//! changelist entries.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::sys::{fd_limit, Facility, IoFail, IoType, Opcode, SharedPoll, SysEvent};

fn zeroed_kevent() -> libc::kevent {
    libc::kevent {
        ident: 0,
        filter: 0,
        flags: 0,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}

fn translate(record: libc::kevent) -> SysEvent {
    let fd = record.ident as RawFd;
    let res = if record.flags & libc::EV_ERROR != 0 {
        Err(IoFail::Os(record.data as i32))
    } else if record.flags & libc::EV_EOF != 0 && record.data == 0 {
        Err(IoFail::Connectivity(record.filter as i32))
    } else {
        Ok(IoType {
            read: record.filter == libc::EVFILT_READ,
            write: record.filter == libc::EVFILT_WRITE,
        })
    };
    SysEvent { fd, res }
}

/// Fixed-capacity array of `kevent` records filled by the kernel on each wait call.
pub struct EventList {
    buf: Box<[libc::kevent]>,
    populated: usize,
}

// The kernel-facing udata pointer is never set or dereferenced by this crate.
unsafe impl Send for EventList {}

impl EventList {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![zeroed_kevent(); capacity].into_boxed_slice(),
            populated: 0,
        }
    }

    pub fn capacity(&self) -> usize { self.buf.len() }

    /// Writes a record at `index`.
    pub fn put(&mut self, index: usize, fd: RawFd, filter: libc::c_short) {
        let mut record = zeroed_kevent();
        record.ident = fd as libc::uintptr_t;
        record.filter = filter;
        self.buf[index] = record;
    }

    /// Reads back the `(fd, filter)` pair at `index`.
    pub fn get(&self, index: usize) -> (RawFd, libc::c_short) {
        let record = self.buf[index];
        (record.ident as RawFd, record.filter)
    }

    fn as_mut_ptr(&mut self) -> *mut libc::kevent { self.buf.as_mut_ptr() }
}

/// Raw kqueue kernel object.
pub struct Kqueue {
    fd: OwnedFd,
    capacity: usize,
}

impl Kqueue {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            capacity: capacity.clamp(1, fd_limit()),
        })
    }

    fn change(&self, fd: RawFd, filter: libc::c_short, flags: libc::c_ushort) -> io::Result<()> {
        let mut record = zeroed_kevent();
        record.ident = fd as libc::uintptr_t;
        record.filter = filter;
        record.flags = flags;
        let res = unsafe {
            libc::kevent(self.fd.as_raw_fd(), &record, 1, ptr::null_mut(), 0, ptr::null())
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn delete(&self, fd: RawFd, filter: libc::c_short) -> io::Result<()> {
        match self.change(fd, filter, libc::EV_DELETE) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    fn arm_interest(&self, fd: RawFd, interest: IoType, oneshot: bool) -> io::Result<()> {
        let mut flags = libc::EV_ADD;
        if oneshot {
            flags |= libc::EV_ONESHOT;
        }
        // EV_ADD upserts, so no modify/add distinction exists; the un-interested filter must be
        // deleted explicitly.
        if interest.read {
            self.change(fd, libc::EVFILT_READ, flags)?;
        } else {
            self.delete(fd, libc::EVFILT_READ)?;
        }
        if interest.write {
            self.change(fd, libc::EVFILT_WRITE, flags)?;
        } else {
            self.delete(fd, libc::EVFILT_WRITE)?;
        }
        Ok(())
    }

    fn wait_into(&self, events: &mut EventList, timeout: Option<Duration>) -> io::Result<usize> {
        let ts;
        let ts_ptr = match timeout {
            None => ptr::null(),
            Some(t) => {
                ts = libc::timespec {
                    tv_sec: t.as_secs() as libc::time_t,
                    tv_nsec: t.subsec_nanos() as libc::c_long,
                };
                &ts as *const libc::timespec
            }
        };
        let count = unsafe {
            libc::kevent(
                self.fd.as_raw_fd(),
                ptr::null(),
                0,
                events.as_mut_ptr(),
                events.capacity() as libc::c_int,
                ts_ptr,
            )
        };
        if count < 0 {
            return Err(io::Error::last_os_error());
        }
        events.populated = count as usize;
        Ok(events.populated)
    }
}

impl SharedPoll for Kqueue {
    type Events = EventList;

    fn create(capacity: usize) -> io::Result<Self> { Kqueue::new(capacity) }

    fn events(&self) -> EventList { EventList::new(self.capacity) }

    fn watch(&self, fd: RawFd, interest: IoType, oneshot: bool) -> io::Result<()> {
        self.arm_interest(fd, interest, oneshot)
    }

    fn unwatch(&self, fd: RawFd) -> io::Result<()> {
        self.delete(fd, libc::EVFILT_READ)?;
        self.delete(fd, libc::EVFILT_WRITE)
    }

    fn wait(&self, events: &mut EventList, timeout: Option<Duration>) -> io::Result<usize> {
        self.wait_into(events, timeout)
    }

    fn event(events: &EventList, index: usize) -> SysEvent {
        debug_assert!(index < events.populated);
        translate(events.buf[index])
    }
}

/// Single-owner readiness facility over kqueue.
pub struct KqueueFacility {
    kqueue: Kqueue,
    events: EventList,
}

impl Facility for KqueueFacility {
    fn create(capacity: usize) -> io::Result<Self> {
        let kqueue = Kqueue::new(capacity)?;
        let events = kqueue.events();
        Ok(Self { kqueue, events })
    }

    fn arm(&mut self, fd: RawFd, op: Opcode, interest: IoType) -> io::Result<()> {
        match op {
            Opcode::Add | Opcode::Modify => self.kqueue.arm_interest(fd, interest, false),
            Opcode::Delete => {
                self.kqueue.delete(fd, libc::EVFILT_READ)?;
                self.kqueue.delete(fd, libc::EVFILT_WRITE)
            }
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.kqueue.wait_into(&mut self.events, timeout)
    }

    fn event(&self, index: usize) -> SysEvent {
        debug_assert!(index < self.events.populated);
        translate(self.events.buf[index])
    }

    fn capacity(&self) -> usize { self.events.capacity() }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn list_round_trip() {
        let mut list = EventList::new(4);
        list.put(0, 5, libc::EVFILT_READ);
        list.put(2, 9, libc::EVFILT_WRITE);
        assert_eq!(list.get(0), (5, libc::EVFILT_READ));
        assert_eq!(list.get(2), (9, libc::EVFILT_WRITE));
    }

    #[test]
    fn facility_readiness() -> io::Result<()> {
        let (mut writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;

        let mut facility = KqueueFacility::create(8)?;
        facility.arm(reader.as_raw_fd(), Opcode::Add, IoType::read_only())?;

        assert_eq!(facility.wait(Some(Duration::from_millis(1)))?, 0);

        writer.write_all(&[0x1])?;
        assert_eq!(facility.wait(Some(Duration::from_millis(100)))?, 1);
        let ev = facility.event(0);
        assert_eq!(ev.fd, reader.as_raw_fd());
        assert_eq!(ev.res.unwrap(), IoType::read_only());
        Ok(())
    }
}
