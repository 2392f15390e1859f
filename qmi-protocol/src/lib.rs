// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire-level encoding and decoding for the QMI control protocol.
//!
//! This crate owns the parts of the stack that must be bit-exact with modem
//! firmware: the QMUX-framed [`Message`] with its TLV builder and reader,
//! the primitive [`codec`], and the MBIMEx v3 [`mbim::MbimTlv`]. Transports
//! and request routing live in the `qrtr` and `qmi-transport` crates.

pub mod codec;
pub mod errors;
pub mod mbim;
pub mod message;
mod service;

pub use codec::{Endian, Reader, TextEncoding};
pub use errors::{Error, ProtocolError};
pub use message::Message;
pub use service::Service;

/// Control-service message ids the stack itself speaks.
pub mod ctl {
    /// Allocate a client id; TLV 0x01 holds the service id, the response's
    /// TLV 0x01 holds `{service: u8, client_id: u8}`.
    pub const MESSAGE_ALLOCATE_CID: u16 = 0x0022;
    /// Release a client id; TLV 0x01 holds `{service: u8, client_id: u8}`.
    pub const MESSAGE_RELEASE_CID: u16 = 0x0023;
    /// Unsolicited sync indication, broadcast to every client.
    pub const MESSAGE_SYNC: u16 = 0x0027;
    /// Internal proxy handshake: TLV 0x01 names the device to share.
    pub const MESSAGE_INTERNAL_PROXY_OPEN: u16 = 0xff00;

    /// TLV type used by all of the messages above.
    pub const TLV_VALUE: u8 = 0x01;
}

/// Logging verbosity carried explicitly through constructors instead of a
/// process-wide flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceOptions {
    /// Emit full message traces at debug level.
    pub enabled: bool,
    /// Include payloads that may carry personally identifying values
    /// (IMSI, phone numbers) in traces.
    pub personal_info: bool,
}
