//! One-shot handshakes between a setup process and its helpers.
//!
//! - [`ReadySignal`]: an eventfd the waiting side blocks on until the other
//!   side says "go".
//! - [`ResultSender`] / [`ResultReceiver`]: a pipe carrying at most one
//!   [`HelperError`]. Closing the write end without sending means success.
//!
//! Both are blocking with no timeout.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};

use sdexec_proto::HelperError;

use crate::sys;

/// One-shot "go ahead" signal.
#[derive(Debug)]
pub struct ReadySignal {
    /// The eventfd, shared across `fork`.
    fd: OwnedFd,
}

impl ReadySignal {
    /// Creates an unsignalled eventfd.
    pub fn new() -> io::Result<Self> {
        Ok(Self { fd: sys::eventfd()? })
    }

    /// Wakes the waiter.
    pub fn notify(&self) -> io::Result<()> {
        let mut f = File::from(self.fd.try_clone()?);
        f.write_all(&1u64.to_ne_bytes())
    }

    /// Blocks until [`notify`](Self::notify) has been called.
    pub fn wait(&self) -> io::Result<()> {
        let mut f = File::from(self.fd.try_clone()?);
        let mut buf = [0u8; 8];
        f.read_exact(&mut buf)
    }
}

/// Creates a connected result channel.
pub fn result_channel() -> io::Result<(ResultSender, ResultReceiver)> {
    let (r, w) = sys::pipe()?;
    Ok((ResultSender { fd: w }, ResultReceiver { fd: r }))
}

/// Write end of a result channel. Owned by the helper.
#[derive(Debug)]
pub struct ResultSender {
    /// Pipe write end.
    fd: OwnedFd,
}

impl ResultSender {
    /// Reports a failure and closes the channel.
    pub fn send(self, err: &HelperError) -> io::Result<()> {
        let mut f = File::from(self.fd);
        sdexec_proto::encode(&mut f, err)
    }
}

/// Read end of a result channel. Owned by the waiting side.
#[derive(Debug)]
pub struct ResultReceiver {
    /// Pipe read end.
    fd: OwnedFd,
}

impl ResultReceiver {
    /// Blocks until the helper reports or closes its end.
    ///
    /// Returns `Ok(None)` when the helper closed the channel without sending.
    /// The caller must have dropped its own copy of the sender first.
    pub fn recv(self) -> io::Result<Option<HelperError>> {
        let mut f = File::from(self.fd);
        match sdexec_proto::decode(&mut f) {
            Ok(err) => Ok(Some(err)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for ResultReceiver {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn ready_signal_wakes_waiter() {
        let sig = ReadySignal::new().unwrap();
        let fd = sig.fd.try_clone().unwrap();
        let waiter = thread::spawn(move || ReadySignal { fd }.wait());
        sig.notify().unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn closed_sender_means_success() {
        let (tx, rx) = result_channel().unwrap();
        drop(tx);
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn sent_error_is_received() {
        let (tx, rx) = result_channel().unwrap();
        tx.send(&HelperError::new("write gid_map", libc::EPERM))
            .unwrap();
        let err = rx.recv().unwrap().unwrap();
        assert_eq!(err.op, "write gid_map");
        assert_eq!(err.errno, libc::EPERM);
    }
}
