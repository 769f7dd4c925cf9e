//! Portable `poll(2)` backend.
//!
//! The descriptor table is a flat array of `pollfd` records handed directly to the syscall, the
//! same layout `popol` uses. This backend supports a single waiter thread only.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::sys::{fd_limit, millis, Facility, IoFail, IoType, Opcode, SysEvent};

#[allow(non_camel_case_types)]
#[cfg(any(target_os = "linux", target_os = "android"))]
type nfds_t = libc::c_ulong;

#[allow(non_camel_case_types)]
#[cfg(not(any(target_os = "linux", target_os = "android")))]
type nfds_t = libc::c_uint;

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLPRI;
const WRITE_EVENTS: libc::c_short = libc::POLLOUT;
const FAIL_EVENTS: libc::c_short = libc::POLLERR | libc::POLLNVAL;

fn interest_bits(interest: IoType) -> libc::c_short {
    let mut bits = 0;
    if interest.read {
        bits |= READ_EVENTS;
    }
    if interest.write {
        bits |= WRITE_EVENTS;
    }
    bits
}

fn translate(fd: RawFd, revents: libc::c_short) -> SysEvent {
    let res = if revents & libc::POLLHUP != 0 {
        Err(IoFail::Connectivity(revents as i32))
    } else if revents & FAIL_EVENTS != 0 {
        Err(IoFail::Os(revents as i32))
    } else {
        Ok(IoType {
            read: revents & READ_EVENTS != 0,
            write: revents & WRITE_EVENTS != 0,
        })
    };
    SysEvent { fd, res }
}

/// Fixed-capacity table of `pollfd` records.
///
/// This is the native event array for the `poll(2)` facility: interest masks are written into it
/// with [`PollTable::put`] and readiness comes back in the same records' `revents` field. The
/// backing storage is allocated once and freed when the table drops.
pub struct PollTable {
    records: Vec<libc::pollfd>,
    capacity: usize,
}

impl PollTable {
    /// Allocates a table capable of holding `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    /// Writes a record at `index`, which must not exceed the current length; writing at the
    /// current length appends.
    ///
    /// # Panics
    ///
    /// Panics if `index` is beyond the current length or the table is at capacity.
    pub fn put(&mut self, index: usize, fd: RawFd, events: libc::c_short) {
        let record = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        if index == self.records.len() {
            assert!(index < self.capacity, "poll table exhausted");
            self.records.push(record);
        } else {
            self.records[index] = record;
        }
    }

    /// Reads back `(fd, events, revents)` for the record at `index`.
    pub fn get(&self, index: usize) -> (RawFd, libc::c_short, libc::c_short) {
        let record = self.records[index];
        (record.fd, record.events, record.revents)
    }

    pub fn position(&self, fd: RawFd) -> Option<usize> {
        self.records.iter().position(|r| r.fd == fd)
    }

    fn swap_remove(&mut self, index: usize) { self.records.swap_remove(index); }

    fn as_mut_ptr(&mut self) -> *mut libc::pollfd { self.records.as_mut_ptr() }
}

/// Single-waiter readiness facility over `poll(2)`.
pub struct PollSet {
    table: PollTable,
    fired: Vec<SysEvent>,
}

impl Facility for PollSet {
    fn create(capacity: usize) -> io::Result<Self> {
        let capacity = capacity.min(fd_limit());
        Ok(Self {
            table: PollTable::new(capacity),
            fired: Vec::with_capacity(capacity),
        })
    }

    fn arm(&mut self, fd: RawFd, op: Opcode, interest: IoType) -> io::Result<()> {
        match (op, self.table.position(fd)) {
            (Opcode::Add | Opcode::Modify, Some(ix)) => {
                self.table.put(ix, fd, interest_bits(interest))
            }
            (Opcode::Add, None) => {
                if self.table.len() == self.table.capacity() {
                    return Err(io::Error::new(
                        io::ErrorKind::OutOfMemory,
                        "poll table exhausted",
                    ));
                }
                let end = self.table.len();
                self.table.put(end, fd, interest_bits(interest));
            }
            (Opcode::Modify, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "descriptor is not registered with poll table",
                ))
            }
            (Opcode::Delete, Some(ix)) => self.table.swap_remove(ix),
            (Opcode::Delete, None) => {}
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.fired.clear();

        let count = unsafe {
            libc::poll(self.table.as_mut_ptr(), self.table.len() as nfds_t, millis(timeout))
        };
        if count < 0 {
            return Err(io::Error::last_os_error());
        }

        // Fired records are scattered across the table; compact them so that callers can index
        // events densely.
        for ix in 0..self.table.len() {
            let (fd, _, revents) = self.table.get(ix);
            if revents != 0 {
                self.fired.push(translate(fd, revents));
            }
        }
        Ok(self.fired.len())
    }

    fn event(&self, index: usize) -> SysEvent { self.fired[index] }

    fn capacity(&self) -> usize { self.table.capacity() }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn table_round_trip() {
        let mut table = PollTable::new(4);
        table.put(0, 7, READ_EVENTS);
        table.put(1, 9, WRITE_EVENTS);
        assert_eq!(table.get(0), (7, READ_EVENTS, 0));
        assert_eq!(table.get(1), (9, WRITE_EVENTS, 0));

        table.put(0, 7, READ_EVENTS | WRITE_EVENTS);
        assert_eq!(table.get(0), (7, READ_EVENTS | WRITE_EVENTS, 0));
        assert_eq!(table.len(), 2);
    }

    #[test]
    #[should_panic(expected = "poll table exhausted")]
    fn table_capacity_is_hard() {
        let mut table = PollTable::new(1);
        table.put(0, 1, READ_EVENTS);
        table.put(1, 2, READ_EVENTS);
    }

    #[test]
    fn readiness() -> io::Result<()> {
        let (mut writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;

        let mut poll = PollSet::create(8)?;
        poll.arm(reader.as_raw_fd(), Opcode::Add, IoType::read_only())?;

        assert_eq!(poll.wait(Some(Duration::from_millis(1)))?, 0);

        writer.write_all(&[0x1])?;
        assert_eq!(poll.wait(Some(Duration::from_millis(100)))?, 1);
        let ev = poll.event(0);
        assert_eq!(ev.fd, reader.as_raw_fd());
        assert_eq!(ev.res.unwrap(), IoType::read_only());

        // Zero interest must silence the descriptor even with data still buffered.
        poll.arm(reader.as_raw_fd(), Opcode::Delete, IoType::none())?;
        assert_eq!(poll.wait(Some(Duration::from_millis(1)))?, 0);
        Ok(())
    }
}
