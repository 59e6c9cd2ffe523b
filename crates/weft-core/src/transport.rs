//! Unix-socket transport with file-descriptor passing.
//!
//! One [`WireSocket`] wraps a nonblocking `UnixStream` plus the outbound and
//! inbound byte buffers. Descriptors ride SCM_RIGHTS ancillary payloads;
//! outbound fds are duplicated at queue time so callers keep ownership of
//! theirs, and received fds are owned by the socket until a message claims
//! them.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::ConnectionError;

/// Most fds attached to a single sendmsg batch.
const MAX_FDS_PER_BATCH: usize = 28;

/// Ancillary buffer large enough for `MAX_FDS_PER_BATCH` descriptors.
const CMSG_BUF_LEN: usize = 256;

fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC returns a fresh descriptor we own.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

pub(crate) struct WireSocket {
    stream: UnixStream,
    out: BytesMut,
    out_fds: VecDeque<OwnedFd>,
    pub(crate) inbound: BytesMut,
    pub(crate) in_fds: VecDeque<OwnedFd>,
}

impl WireSocket {
    pub(crate) fn new(stream: UnixStream) -> io::Result<WireSocket> {
        stream.set_nonblocking(true)?;
        Ok(WireSocket {
            stream,
            out: BytesMut::new(),
            out_fds: VecDeque::new(),
            inbound: BytesMut::new(),
            in_fds: VecDeque::new(),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Queue an encoded frame and its fds. The fds are duplicated; the
    /// caller's descriptors stay open and owned by the caller.
    pub(crate) fn queue(&mut self, frame: &[u8], fds: &[RawFd]) -> Result<(), ConnectionError> {
        let mut dups = Vec::with_capacity(fds.len());
        for &fd in fds {
            dups.push(dup_cloexec(fd)?);
        }
        self.out.extend_from_slice(frame);
        self.out_fds.extend(dups);
        Ok(())
    }

    pub(crate) fn has_queued_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Push queued bytes and fds to the socket without blocking.
    ///
    /// `Err(Again)` means the kernel buffer is full; retry after the
    /// descriptor polls writable. Queued fds are closed only once the
    /// batch carrying them was accepted by the kernel.
    pub(crate) fn flush(&mut self) -> Result<(), ConnectionError> {
        while !self.out.is_empty() {
            let fd_count = self.out_fds.len().min(MAX_FDS_PER_BATCH);

            let mut iov = libc::iovec {
                iov_base: self.out.as_ptr() as *mut libc::c_void,
                iov_len: self.out.len(),
            };
            // SAFETY: zeroed msghdr is a valid initial state.
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;

            let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
            if fd_count > 0 {
                msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
                // SAFETY: CMSG_SPACE is a pure size computation.
                msg.msg_controllen =
                    unsafe { libc::CMSG_SPACE((fd_count * mem::size_of::<RawFd>()) as u32) } as _;
                // SAFETY: msg_control points at cmsg_buf, which is large
                // enough for MAX_FDS_PER_BATCH descriptors.
                unsafe {
                    let cmsg = libc::CMSG_FIRSTHDR(&msg);
                    (*cmsg).cmsg_level = libc::SOL_SOCKET;
                    (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                    (*cmsg).cmsg_len =
                        libc::CMSG_LEN((fd_count * mem::size_of::<RawFd>()) as u32) as _;
                    let data = libc::CMSG_DATA(cmsg) as *mut RawFd;
                    for (i, fd) in self.out_fds.iter().take(fd_count).enumerate() {
                        data.add(i).write_unaligned(fd.as_raw_fd());
                    }
                }
            }

            // SAFETY: msg references live buffers for the duration of the call.
            let n = unsafe {
                libc::sendmsg(
                    self.stream.as_raw_fd(),
                    &msg,
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error().into());
            }
            // Dropping the duplicates closes them; the kernel now holds its
            // own references.
            for _ in 0..fd_count {
                self.out_fds.pop_front();
            }
            self.out.advance(n as usize);
            trace!(sent = n, fds = fd_count, remaining = self.out.len(), "flush batch");
        }
        Ok(())
    }

    /// Pull available bytes and fds from the socket without blocking.
    ///
    /// Returns the number of bytes read; zero bytes with a clean return
    /// never happens (peer hangup maps to `Closed`).
    pub(crate) fn fill(&mut self) -> Result<usize, ConnectionError> {
        let mut buf = [0u8; 4096];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
        // SAFETY: zeroed msghdr is a valid initial state.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        // SAFETY: msg references live buffers for the duration of the call.
        let n = unsafe {
            libc::recvmsg(
                self.stream.as_raw_fd(),
                &mut msg,
                libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if n == 0 {
            return Err(ConnectionError::Closed);
        }

        // SAFETY: the kernel filled msg_control with well-formed cmsg
        // records; CMSG_* walk them within cmsg_buf.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    let count = payload / mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                    for i in 0..count {
                        let fd = data.add(i).read_unaligned();
                        self.in_fds.push_back(OwnedFd::from_raw_fd(fd));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        self.inbound.extend_from_slice(&buf[..n as usize]);
        trace!(read = n, fds_held = self.in_fds.len(), "fill");
        Ok(n as usize)
    }

    /// Block until the socket is readable or the timeout passes. Returns
    /// false on timeout.
    pub(crate) fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        poll_readable(self.stream.as_raw_fd(), timeout)
    }
}

/// Block on `poll(2)` until `fd` is readable or the timeout passes. Returns
/// false on timeout. Takes a raw fd so callers can wait without holding any
/// connection lock.
pub(crate) fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let ms = match timeout {
        Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
        None => -1,
    };
    loop {
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let r = unsafe { libc::poll(&mut pfd, 1, ms) };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(r > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::IntoRawFd;

    #[test]
    fn queue_and_flush_moves_bytes() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sock = WireSocket::new(a).unwrap();
        sock.queue(b"abcdefgh", &[]).unwrap();
        assert!(sock.has_queued_output());
        sock.flush().unwrap();
        assert!(!sock.has_queued_output());

        let mut peer = b;
        peer.set_nonblocking(false).unwrap();
        let mut got = [0u8; 8];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"abcdefgh");
    }

    #[test]
    fn fill_collects_bytes() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sock = WireSocket::new(a).unwrap();
        let mut peer = b;
        peer.write_all(b"12345678").unwrap();
        assert!(sock.wait_readable(Some(Duration::from_secs(1))).unwrap());
        let n = sock.fill().unwrap();
        assert_eq!(n, 8);
        assert_eq!(&sock.inbound[..], b"12345678");
    }

    #[test]
    fn fill_without_data_is_again() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut sock = WireSocket::new(a).unwrap();
        assert_eq!(sock.fill().unwrap_err(), ConnectionError::Again);
    }

    #[test]
    fn peer_hangup_is_closed() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sock = WireSocket::new(a).unwrap();
        drop(b);
        assert_eq!(sock.fill().unwrap_err(), ConnectionError::Closed);
    }

    #[test]
    fn fds_travel_with_bytes() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = WireSocket::new(a).unwrap();
        let mut rx = WireSocket::new(b).unwrap();

        let (carrier, _keep) = UnixStream::pair().unwrap();
        let fd = carrier.into_raw_fd();
        tx.queue(b"payload!", &[fd]).unwrap();
        tx.flush().unwrap();
        // our copy stays open because queue() duplicated it
        drop(unsafe { OwnedFd::from_raw_fd(fd) });

        assert!(rx.wait_readable(Some(Duration::from_secs(1))).unwrap());
        rx.fill().unwrap();
        assert_eq!(&rx.inbound[..], b"payload!");
        assert_eq!(rx.in_fds.len(), 1);
    }
}
