//! Duplicate a connection's file descriptor and hand it to a module via `SCM_RIGHTS`.
//!
//! Unix only: there's no portable equivalent, which is why [`crate::ConnectionForwarder`]
//! falls back to `tcp_relay` wherever fd-passing isn't available.

use std::io::IoSlice;
use std::os::fd::RawFd;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use nix::unistd::{close, dup};

use crate::ForwarderError;

/// Duplicate `data_fd` and send the duplicate over `control_fd` as ancillary data, along
/// with a single placeholder byte (some `recvmsg` implementations ignore an all-ancillary
/// message; the handshake frame written just before this carries the real payload).
pub(crate) fn send_fd(control_fd: RawFd, data_fd: RawFd) -> Result<(), ForwarderError> {
    let duped = dup(data_fd).map_err(|errno| ForwarderError::Fd(errno.to_string()))?;
    let fds = [duped];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&[0u8])];

    let result = sendmsg::<UnixAddr>(control_fd, &iov, &cmsg, MsgFlags::empty(), None);

    // The kernel adds its own reference to the fd once the message is queued; our copy
    // can be closed immediately either way.
    let _ = close(duped);

    result.map(|_| ()).map_err(|errno| ForwarderError::Fd(errno.to_string()))
}
