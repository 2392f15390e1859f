// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A datagram client bound to one `(node, port)` service endpoint.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::node::QrtrNode;
use crate::socket::{QrtrAddr, QrtrSocket};
use crate::Error;

/// Largest datagram the router will hand us.
const MAX_DATAGRAM: usize = 65536;

/// How many inbound datagrams may queue before the socket task waits for
/// the consumer.
const INBOUND_QUEUE: usize = 32;

/// A client socket for one service port on one node.
///
/// Inbound datagrams whose source is not exactly the peer `(node, port)`
/// are silently dropped. Messages are delivered through the single
/// receiver returned by [`QrtrClient::new`]; the buffers are owned by the
/// consumer, which is therefore free to mutate them, so there is
/// deliberately no fan-out at this layer.
pub struct QrtrClient {
    node: Arc<QrtrNode>,
    port: u32,
    socket: Arc<QrtrSocket>,
    task: JoinHandle<()>,
}

impl QrtrClient {
    pub fn new(node: Arc<QrtrNode>, port: u32) -> Result<(QrtrClient, mpsc::Receiver<Vec<u8>>), Error> {
        let socket = Arc::new(QrtrSocket::new()?);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let peer = QrtrAddr { node: node.id(), port };
        let task = tokio::spawn(recv_task(Arc::clone(&socket), peer, tx));
        Ok((QrtrClient { node, port, socket, task }, rx))
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn node(&self) -> &Arc<QrtrNode> {
        &self.node
    }

    /// Sends one datagram to the peer. Fails `Closed` once the node has
    /// been withdrawn from the bus; other failures carry the OS error.
    pub async fn send(&self, data: &[u8]) -> Result<(), Error> {
        if self.node.is_removed() {
            debug!("[qrtr client {}:{}] node removed from bus", self.node.id(), self.port);
            return Err(Error::Closed);
        }
        self.socket.send_to(data, QrtrAddr { node: self.node.id(), port: self.port }).await?;
        Ok(())
    }
}

impl Drop for QrtrClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn from_peer(source: QrtrAddr, peer: QrtrAddr) -> bool {
    source == peer
}

async fn recv_task(socket: Arc<QrtrSocket>, peer: QrtrAddr, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("[qrtr client {}] socket i/o failure: {}", peer, e);
                return;
            }
        };
        if !from_peer(source, peer) {
            continue;
        }
        if tx.send(buf[..len].to_vec()).await.is_err() {
            // Consumer went away; nothing left to deliver to.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_filter() {
        let peer = QrtrAddr { node: 5, port: 7 };
        assert!(from_peer(QrtrAddr { node: 5, port: 7 }, peer));
        assert!(!from_peer(QrtrAddr { node: 5, port: 8 }, peer));
        assert!(!from_peer(QrtrAddr { node: 6, port: 7 }, peer));
    }
}
