// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

/// Errors produced by the codec and message layers. These are always
/// returned to the caller; nothing in this crate logs and swallows them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Framing or header fields are inconsistent.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A reader looked up a TLV type that is not present in the message.
    #[error("TLV 0x{0:02x} not found")]
    TlvNotFound(u8),

    /// A read or write would exceed a length field's capacity.
    #[error("TLV read or write would overflow")]
    TlvTooLong,

    /// API misuse, e.g. a wrong TLV type or an out-of-range size prefix.
    #[error("invalid arguments: {0}")]
    InvalidArgs(&'static str),

    /// Structurally valid but semantically unparseable payload.
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

/// Error codes reported by the device in a result TLV.
///
/// Only the codes the core itself produces or inspects are named; everything
/// else round-trips through `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    None,
    MalformedMessage,
    NoMemory,
    Internal,
    Aborted,
    ClientIdsExhausted,
    InvalidClientId,
    Other(u16),
}

impl ProtocolError {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => ProtocolError::None,
            1 => ProtocolError::MalformedMessage,
            2 => ProtocolError::NoMemory,
            3 => ProtocolError::Internal,
            4 => ProtocolError::Aborted,
            5 => ProtocolError::ClientIdsExhausted,
            22 => ProtocolError::InvalidClientId,
            other => ProtocolError::Other(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            ProtocolError::None => 0,
            ProtocolError::MalformedMessage => 1,
            ProtocolError::NoMemory => 2,
            ProtocolError::Internal => 3,
            ProtocolError::Aborted => 4,
            ProtocolError::ClientIdsExhausted => 5,
            ProtocolError::InvalidClientId => 22,
            ProtocolError::Other(code) => *code,
        }
    }
}
