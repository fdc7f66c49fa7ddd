//! Datagram link between the filesystem and the smoothing worker.
//!
//! A `SOCK_SEQPACKET` pair keeps message boundaries, so each target arrives
//! whole, and closing either end shows up as end-of-stream on the other.

use crate::error::{BacklightError, Result};
use crate::util::retry_eintr;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{
    AddressFamily, MsgFlags, Shutdown, SockFlag, SockType, recv, send, shutdown, socketpair,
};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;

const TARGET_LEN: usize = std::mem::size_of::<i32>();
const READY: [u8; 1] = [0];

/// Creates a connected pair of channel ends.
pub fn pair() -> Result<(TargetSender, WorkerEnd)> {
    let (front, back) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(BacklightError::Channel)?;
    Ok((TargetSender { sock: front }, WorkerEnd { sock: back }))
}

/// Filesystem side: fire-and-forget target updates.
#[derive(Debug)]
pub struct TargetSender {
    sock: OwnedFd,
}

impl TargetSender {
    /// Blocks until the worker reports it holds the device.
    pub fn wait_ready(&self) -> Result<()> {
        let mut buf = [0u8; 1];
        let len = retry_eintr(|| recv(self.sock.as_raw_fd(), &mut buf, MsgFlags::empty()))
            .map_err(BacklightError::Channel)?;
        if len == 0 {
            return Err(BacklightError::WorkerNotReady);
        }
        Ok(())
    }

    /// Queues a new target without waiting. A full queue or a vanished
    /// worker is an error.
    pub fn send(&self, target: i32) -> Result<()> {
        let bytes = target.to_ne_bytes();
        let sent = send(
            self.sock.as_raw_fd(),
            &bytes,
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
        )
        .map_err(BacklightError::Channel)?;
        if sent != bytes.len() {
            return Err(BacklightError::Channel(nix::Error::EMSGSIZE));
        }
        Ok(())
    }

    /// Signals end-of-stream to the worker while keeping the descriptor.
    pub fn close(&self) {
        let _ = shutdown(self.sock.as_raw_fd(), Shutdown::Both);
    }
}

/// What one wait on the worker end produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Timed out, or a message that was not a target.
    Nothing,
    Target(i32),
    Closed,
}

/// Worker side of the channel.
#[derive(Debug)]
pub struct WorkerEnd {
    sock: OwnedFd,
}

impl WorkerEnd {
    pub fn signal_ready(&self) -> nix::Result<()> {
        retry_eintr(|| send(self.sock.as_raw_fd(), &READY, MsgFlags::MSG_NOSIGNAL)).map(|_| ())
    }

    /// Waits up to `timeout` (forever when `None`) for one message.
    /// Interrupted waits surface as `EINTR` for the caller to count.
    pub fn wait(&self, timeout: Option<Duration>) -> nix::Result<Received> {
        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(t) => u16::try_from(t.as_millis())
                .map(PollTimeout::from)
                .unwrap_or(PollTimeout::MAX),
        };

        let mut fds = [PollFd::new(self.sock.as_fd(), PollFlags::POLLIN)];
        if poll(&mut fds, timeout)? == 0 {
            return Ok(Received::Nothing);
        }

        let mut buf = [0u8; TARGET_LEN * 2];
        match recv(self.sock.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => Ok(Received::Closed),
            Ok(TARGET_LEN) => {
                let mut raw = [0u8; TARGET_LEN];
                raw.copy_from_slice(&buf[..TARGET_LEN]);
                Ok(Received::Target(i32::from_ne_bytes(raw)))
            }
            Ok(_) | Err(nix::Error::EAGAIN) => Ok(Received::Nothing),
            Err(err) => Err(err),
        }
    }
}
