// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The character-device transport for cdc-wdm control endpoints. Frames on
//! the wire are complete QMUX messages.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, warn};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use qmi_protocol::Message;

use crate::{Error, MessageSink};

const READ_CHUNK: usize = 4096;
const INBOUND_QUEUE: usize = 32;

/// The write half of an open control device.
pub struct DeviceSink {
    fd: Arc<AsyncFd<OwnedFd>>,
    reader: JoinHandle<()>,
}

/// Opens the control device read-write and non-blocking, returning the
/// write half and the stream of parsed inbound messages. Buffers that do
/// not parse as QMI are logged and dropped without disturbing the stream.
pub fn open(path: &Path) -> Result<(DeviceSink, mpsc::Receiver<Message>), Error> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Transport(io::Error::new(io::ErrorKind::InvalidInput, "NUL in path")))?;
    // SAFETY: plain open(2); ownership of the fd is taken immediately.
    let raw = unsafe {
        libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC)
    };
    if raw < 0 {
        return Err(Error::Transport(io::Error::last_os_error()));
    }
    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
    let fd = Arc::new(AsyncFd::with_interest(owned, Interest::READABLE | Interest::WRITABLE)?);

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let reader = tokio::spawn(read_task(Arc::clone(&fd), tx));
    Ok((DeviceSink { fd, reader }, rx))
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl MessageSink for DeviceSink {
    async fn send(&mut self, message: &Message) -> Result<(), Error> {
        let mut data = message.raw();
        while !data.is_empty() {
            let mut guard = self.fd.writable().await.map_err(Error::Transport)?;
            let result = guard.try_io(|fd| {
                // SAFETY: data outlives the call; the fd is valid.
                let rc = unsafe {
                    libc::write(
                        fd.get_ref().as_raw_fd(),
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            });
            match result {
                Ok(Ok(written)) => data = &data[written..],
                Ok(Err(e)) => return Err(Error::Transport(e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

async fn read_task(fd: Arc<AsyncFd<OwnedFd>>, tx: mpsc::Sender<Message>) {
    let mut pending = BytesMut::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let len = loop {
            let mut guard = match fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("control device poll failed: {}", e);
                    return;
                }
            };
            let result = guard.try_io(|fd| {
                // SAFETY: chunk is a properly sized out-buffer.
                let rc = unsafe {
                    libc::read(
                        fd.get_ref().as_raw_fd(),
                        chunk.as_mut_ptr() as *mut libc::c_void,
                        chunk.len(),
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            });
            match result {
                Ok(Ok(len)) => break len,
                Ok(Err(e)) => {
                    warn!("control device read failed: {}", e);
                    return;
                }
                Err(_would_block) => continue,
            }
        };
        if len == 0 {
            debug!("control device closed");
            return;
        }
        pending.extend_from_slice(&chunk[..len]);

        loop {
            match Message::from_raw(&mut pending) {
                Ok(Some(message)) => {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // One bad buffer must not wedge the device; drop what
                    // we have accumulated and resynchronise on new data.
                    debug!("dropping malformed buffer from device: {}", e);
                    pending.clear();
                    break;
                }
            }
        }
    }
}
