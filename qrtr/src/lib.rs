// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client-side access to the Qualcomm IPC Router (`AF_QIPCRTR`).
//!
//! The [`QrtrBus`] owns the control socket and watches the kernel's
//! service directory; it materialises one [`QrtrNode`] per remote node and
//! keeps its `{service -> port}` records current. A [`QrtrClient`] is a
//! plain datagram socket aimed at one `(node, port)` pair.

pub mod bus;
pub mod client;
pub mod control;
pub mod node;
pub mod socket;

use thiserror::Error;

pub use bus::{BusEvent, QrtrBus};
pub use client::QrtrClient;
pub use node::{QrtrNode, ServiceInfo};
pub use socket::QrtrAddr;

#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An async wait elapsed before its condition held.
    #[error("operation timed out")]
    TimedOut,

    /// The peer node or the owning bus went away.
    #[error("node or bus is gone")]
    Closed,
}

const URI_PREFIX: &str = "qrtr://";

/// Renders the `qrtr://<node>` URI for a node id.
pub fn uri_for_node(node_id: u32) -> String {
    format!("{}{}", URI_PREFIX, node_id)
}

/// Parses a `qrtr://<node>` URI.
pub fn node_for_uri(uri: &str) -> Option<u32> {
    uri.strip_prefix(URI_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_uri_round_trip() {
        assert_eq!(uri_for_node(5), "qrtr://5");
        assert_eq!(node_for_uri("qrtr://5"), Some(5));
        assert_eq!(node_for_uri("qrtr://"), None);
        assert_eq!(node_for_uri("ipc://5"), None);
        assert_eq!(node_for_uri("qrtr://five"), None);
    }
}
