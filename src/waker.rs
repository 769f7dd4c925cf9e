use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

/// A self-pipe used to interrupt a blocked native wait call from another thread.
///
/// [`WakeupChannel::pair`] splits the pipe into a cloneable sending half and a receiving half
/// which the multiplexer registers permanently with its facility. A single lock-guarded flag
/// collapses repeated interrupts into one pipe write and makes draining mutually exclusive with a
/// concurrent interrupt, so a wakeup racing a blocked poll is either delivered to that call or
/// observed as pending by the next one, never lost.
pub struct WakeupChannel;

struct Shared {
    writer: UnixStream,
    // Guards both the flag and the pipe itself.
    triggered: Mutex<bool>,
}

/// Sending half of a [`WakeupChannel`]; usable from any thread.
#[derive(Clone)]
pub struct WakeupSender {
    shared: Arc<Shared>,
}

/// Receiving half of a [`WakeupChannel`], owned by the multiplexer and watched by its facility.
pub struct WakeupReader {
    reader: UnixStream,
    shared: Arc<Shared>,
}

impl WakeupChannel {
    /// Creates a connected nonblocking pipe pair.
    pub fn pair() -> io::Result<(WakeupSender, WakeupReader)> {
        let (writer, reader) = UnixStream::pair()?;
        writer.set_nonblocking(true)?;
        reader.set_nonblocking(true)?;

        let shared = Arc::new(Shared {
            writer,
            triggered: Mutex::new(false),
        });
        let sender = WakeupSender {
            shared: shared.clone(),
        };
        let receiver = WakeupReader { reader, shared };
        Ok((sender, receiver))
    }
}

impl WakeupSender {
    /// Makes a blocked wait call watching the reading half return promptly.
    ///
    /// Writes to the pipe only when no wakeup is currently pending, so calling this any number of
    /// times before the pipe is drained costs at most one syscall and delivers one interrupt.
    pub fn interrupt(&self) -> io::Result<()> {
        let mut triggered = self.shared.triggered.lock().expect("waker lock poisoned");
        if *triggered {
            return Ok(());
        }
        loop {
            match (&self.shared.writer).write(&[0x1]) {
                Ok(_) => break,
                // A full pipe already guarantees readiness of the reading half.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        *triggered = true;
        Ok(())
    }
}

impl WakeupReader {
    /// Empties the pipe and clears the pending flag.
    ///
    /// Must be called after every delivered interrupt; otherwise the facility keeps reporting the
    /// pipe as readable and the poll loop spins.
    pub fn drain(&self) -> io::Result<()> {
        let mut triggered = self.shared.triggered.lock().expect("waker lock poisoned");
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        *triggered = false;
        Ok(())
    }
}

impl AsRawFd for WakeupReader {
    fn as_raw_fd(&self) -> RawFd { self.reader.as_raw_fd() }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::sys::{Facility, IoType, Opcode};

    #[test]
    fn repeated_interrupts_collapse() -> io::Result<()> {
        let (sender, receiver) = WakeupChannel::pair()?;

        sender.interrupt()?;
        sender.interrupt()?;
        sender.interrupt()?;

        // A single byte must be in the pipe.
        let mut buf = [0u8; 16];
        assert_eq!((&receiver.reader).read(&mut buf)?, 1);
        assert!(matches!(
            (&receiver.reader).read(&mut buf),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock
        ));
        Ok(())
    }

    #[test]
    fn drain_resets_pending() -> io::Result<()> {
        let (sender, receiver) = WakeupChannel::pair()?;

        sender.interrupt()?;
        receiver.drain()?;

        // After a drain the next interrupt writes again.
        sender.interrupt()?;
        let mut buf = [0u8; 16];
        assert_eq!((&receiver.reader).read(&mut buf)?, 1);
        Ok(())
    }

    #[test]
    fn wakes_a_blocked_wait() -> io::Result<()> {
        let (sender, receiver) = WakeupChannel::pair()?;
        let mut facility = crate::sys::DefaultFacility::create(8)?;
        facility.arm(receiver.as_raw_fd(), Opcode::Add, IoType::read_only())?;

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.interrupt().expect("interrupt");
        });

        let fired = facility.wait(Some(Duration::from_secs(5)))?;
        assert_eq!(fired, 1);
        assert_eq!(facility.event(0).fd, receiver.as_raw_fd());

        receiver.drain()?;
        assert_eq!(facility.wait(Some(Duration::from_millis(10)))?, 0);
        handle.join().unwrap();
        Ok(())
    }
}
