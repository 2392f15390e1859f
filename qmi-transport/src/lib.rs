// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Request/response plumbing between QMI messages and a control endpoint.
//!
//! The [`Multiplexer`] owns a device's transaction-id space: it stamps
//! outgoing requests, parks each caller until the matching response
//! arrives, and fans unsolicited indications out to subscribers. It is
//! transport-agnostic; [`device::DeviceTransport`] speaks QMUX frames to a
//! cdc-wdm character device and [`qrtr_transport`] adapts a `qrtr` client
//! socket, which carries headerless QMI payloads.

pub mod ctl;
pub mod device;
pub mod mux;
pub mod qrtr_transport;

use async_trait::async_trait;
use thiserror::Error;

use qmi_protocol::{Message, ProtocolError};

pub use mux::Multiplexer;

#[derive(Debug, Error)]
pub enum Error {
    /// Encoding or framing failure from the message layer.
    #[error("message error: {0}")]
    Message(#[from] qmi_protocol::Error),

    /// No response arrived before the request deadline.
    #[error("request timed out")]
    TimedOut,

    /// The caller cancelled the request before completion.
    #[error("request cancelled")]
    Cancelled,

    /// The transport is gone; no further requests will complete.
    #[error("transport closed")]
    Closed,

    /// I/O failure on the underlying endpoint.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The device answered with a non-success result TLV.
    #[error("device reported protocol error {0:?}")]
    Protocol(ProtocolError),
}

impl From<qrtr::Error> for Error {
    fn from(e: qrtr::Error) -> Error {
        match e {
            qrtr::Error::Transport(io) => Error::Transport(io),
            qrtr::Error::TimedOut => Error::TimedOut,
            qrtr::Error::Closed => Error::Closed,
        }
    }
}

/// The write half of a control endpoint. One sink instance has one owner
/// (the multiplexer's writer task), which is what keeps emission FIFO.
#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn send(&mut self, message: &Message) -> Result<(), Error>;
}
