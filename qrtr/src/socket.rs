// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Non-blocking `AF_QIPCRTR` datagram sockets driven by the tokio reactor.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Not every libc build knows the QIPCRTR address family yet.
const AF_QIPCRTR: libc::c_int = 42;

/// A `(node, port)` endpoint on the IPC router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QrtrAddr {
    pub node: u32,
    pub port: u32,
}

impl std::fmt::Display for QrtrAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrQrtr {
    sq_family: libc::sa_family_t,
    sq_node: u32,
    sq_port: u32,
}

impl From<QrtrAddr> for SockaddrQrtr {
    fn from(addr: QrtrAddr) -> Self {
        SockaddrQrtr { sq_family: AF_QIPCRTR as libc::sa_family_t, sq_node: addr.node, sq_port: addr.port }
    }
}

/// One router datagram socket, registered with the reactor for
/// edge-triggered readiness.
#[derive(Debug)]
pub struct QrtrSocket {
    fd: AsyncFd<OwnedFd>,
}

impl QrtrSocket {
    pub fn new() -> io::Result<QrtrSocket> {
        // SAFETY: plain socket(2); ownership of the fd is taken immediately.
        let fd = unsafe {
            libc::socket(
                AF_QIPCRTR,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(QrtrSocket { fd: AsyncFd::with_interest(owned, Interest::READABLE | Interest::WRITABLE)? })
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }

    /// The local `(node, port)` the kernel assigned on creation.
    pub fn local_addr(&self) -> io::Result<QrtrAddr> {
        let mut addr: SockaddrQrtr = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<SockaddrQrtr>() as libc::socklen_t;
        // SAFETY: addr is a properly sized out-parameter.
        let rc = unsafe {
            libc::getsockname(self.raw_fd(), &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(QrtrAddr { node: addr.sq_node, port: addr.sq_port })
    }

    /// Sends one datagram to `addr`, waiting for the socket to become
    /// writable if the kernel queue is full.
    pub async fn send_to(&self, data: &[u8], addr: QrtrAddr) -> io::Result<usize> {
        let dest = SockaddrQrtr::from(addr);
        loop {
            let mut guard = self.fd.writable().await?;
            // SAFETY: data and dest outlive the call; the fd is valid.
            let result = guard.try_io(|fd| {
                let rc = unsafe {
                    libc::sendto(
                        fd.get_ref().as_raw_fd(),
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                        0,
                        &dest as *const _ as *const libc::sockaddr,
                        mem::size_of::<SockaddrQrtr>() as libc::socklen_t,
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            });
            match result {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }

    /// Receives one datagram and its source address.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, QrtrAddr)> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|fd| {
                let mut addr: SockaddrQrtr = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<SockaddrQrtr>() as libc::socklen_t;
                // SAFETY: buf and addr are properly sized out-parameters.
                let rc = unsafe {
                    libc::recvfrom(
                        fd.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                        &mut addr as *mut _ as *mut libc::sockaddr,
                        &mut len,
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok((rc as usize, QrtrAddr { node: addr.sq_node, port: addr.sq_port }))
                }
            });
            match result {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }
}
