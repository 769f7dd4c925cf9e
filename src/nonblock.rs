use std::io::{Error, ErrorKind, Read, Result, Write};
use std::net::TcpStream;

/// Outcome of a single nonblocking I/O attempt.
pub enum IoStatus {
    Success(usize),
    WouldBlock,
    Shutdown,
    Err(Error),
}

pub trait ReadNonblocking: Read {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Success(0);
        }
        loop {
            return match self.read(buf) {
                // Zero bytes from a non-empty buffer means the peer has shut down the stream.
                Ok(0) => IoStatus::Shutdown,
                Ok(len) => IoStatus::Success(len),
                Err(err) if err.kind() == ErrorKind::WouldBlock => IoStatus::WouldBlock,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => IoStatus::Err(err),
            };
        }
    }
}

impl ReadNonblocking for TcpStream {}
impl ReadNonblocking for &TcpStream {}

pub trait WriteNonblocking: Write {
    fn write_nonblocking(&mut self, buf: &[u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Success(0);
        }
        loop {
            return match self.write(buf) {
                Ok(0) => IoStatus::WouldBlock,
                Ok(len) => IoStatus::Success(len),
                Err(err) if err.kind() == ErrorKind::WriteZero => IoStatus::WouldBlock,
                Err(err) if err.kind() == ErrorKind::WouldBlock => IoStatus::WouldBlock,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => IoStatus::Err(err),
            };
        }
    }
}

impl WriteNonblocking for TcpStream {}
impl WriteNonblocking for &TcpStream {}

/// Resolves a nonblocking connect after the socket has reported write readiness.
///
/// A failed asynchronous connect surfaces through `SO_ERROR` rather than from the `connect`
/// syscall itself.
pub fn finish_connect(socket: &TcpStream) -> Result<()> {
    match socket.take_error()? {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;

    use super::*;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (remote, _) = listener.accept().unwrap();
        local.set_nonblocking(true).unwrap();
        (local, remote)
    }

    #[test]
    fn read_reports_would_block_then_data() {
        let (local, mut remote) = connected_pair();

        let mut buf = [0u8; 8];
        assert!(matches!((&local).read_nonblocking(&mut buf), IoStatus::WouldBlock));

        remote.write_all(b"ping").unwrap();
        // Nonblocking socket: give the loopback a moment to deliver.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(matches!((&local).read_nonblocking(&mut buf), IoStatus::Success(4)));
    }

    #[test]
    fn read_reports_shutdown_at_eof() {
        let (local, remote) = connected_pair();
        drop(remote);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut buf = [0u8; 8];
        assert!(matches!((&local).read_nonblocking(&mut buf), IoStatus::Shutdown));
    }

    #[test]
    fn empty_buffers_short_circuit() {
        let (local, _remote) = connected_pair();
        let mut buf = [0u8; 0];
        assert!(matches!((&local).read_nonblocking(&mut buf), IoStatus::Success(0)));
        assert!(matches!((&local).write_nonblocking(&[]), IoStatus::Success(0)));
    }
}
