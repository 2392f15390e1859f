// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Adapter putting a `qrtr` client socket under the multiplexer.
//!
//! QRTR datagrams carry headerless QMI payloads: the port already
//! identifies the service, so there is no QMUX envelope on the wire. On
//! send the envelope is stripped; on receive it is synthesised back with
//! the `(service, client id)` this endpoint was opened for.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use qmi_protocol::{ctl as ctl_ids, Message, ProtocolError, Service};
use qrtr::{QrtrClient, QrtrNode};

use crate::{Error, MessageSink};

const INBOUND_QUEUE: usize = 32;

/// The write half of a QRTR-backed control endpoint.
pub struct QrtrSink {
    client: QrtrClient,
    adapter: JoinHandle<()>,
}

/// Wraps an open QRTR client into a multiplexer transport. `service` and
/// `client_id` are stamped onto the synthesised QMUX envelope of every
/// inbound payload; they must match what the port serves.
pub fn wrap(
    client: QrtrClient,
    datagrams: mpsc::Receiver<Vec<u8>>,
    service: u8,
    client_id: u8,
) -> (QrtrSink, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let adapter = tokio::spawn(adapt_task(datagrams, tx, service, client_id));
    (QrtrSink { client, adapter }, rx)
}

impl Drop for QrtrSink {
    fn drop(&mut self) {
        self.adapter.abort();
    }
}

#[async_trait]
impl MessageSink for QrtrSink {
    async fn send(&mut self, message: &Message) -> Result<(), Error> {
        Ok(self.client.send(message.data()).await?)
    }
}

async fn adapt_task(
    mut datagrams: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Message>,
    service: u8,
    client_id: u8,
) {
    while let Some(datagram) = datagrams.recv().await {
        let mut payload = BytesMut::from(&datagram[..]);
        match Message::from_data(service, client_id, &mut payload) {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Err(e) => debug!("dropping malformed QRTR payload: {}", e),
        }
    }
}

/// A whole-node transport: multiplexes every QMI service a router node
/// offers behind one message stream, so a [`crate::Multiplexer`] can treat
/// the node like a classic control device.
///
/// The router has no control service. Client-id allocation is therefore
/// emulated locally: allocate and release requests are answered from a
/// per-service counter without touching the wire, and each issued
/// `(service, client id)` pair gets its own datagram socket, which is what
/// routes responses back to the right local client.
pub struct NodeSink {
    node: Arc<QrtrNode>,
    inbound: mpsc::Sender<Message>,
    clients: HashMap<(u8, u8), QrtrClient>,
    next_cid: HashMap<u8, u8>,
}

/// Opens a node-level transport, returning the write half and the merged
/// stream of inbound messages from every per-client socket.
pub fn open_node(node: Arc<QrtrNode>) -> (NodeSink, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    (
        NodeSink { node, inbound: tx, clients: HashMap::new(), next_cid: HashMap::new() },
        rx,
    )
}

impl NodeSink {
    async fn answer_locally(&self, response: Message) -> Result<(), Error> {
        self.inbound.send(response).await.map_err(|_| Error::Closed)
    }

    /// Emulates the control service the router does not have.
    async fn handle_ctl(&mut self, message: &Message) -> Result<(), Error> {
        match message.message_id() {
            ctl_ids::MESSAGE_ALLOCATE_CID => {
                let (mut reader, _) = message.tlv_read_init(ctl_ids::TLV_VALUE)?;
                let service = reader.read_u8()?;
                let cid = {
                    let next = self.next_cid.entry(service).or_insert(1);
                    let cid = *next;
                    *next = next.wrapping_add(1).max(1);
                    cid
                };
                debug!("[qrtr node@{}] issued local client id {}:{}", self.node.id(), service, cid);
                let mut response = Message::response(message, ProtocolError::None);
                response.add_raw_tlv(ctl_ids::TLV_VALUE, &[service, cid])?;
                self.answer_locally(response).await
            }
            ctl_ids::MESSAGE_RELEASE_CID => {
                let (mut reader, _) = message.tlv_read_init(ctl_ids::TLV_VALUE)?;
                let service = reader.read_u8()?;
                let cid = reader.read_u8()?;
                self.clients.remove(&(service, cid));
                let mut response = Message::response(message, ProtocolError::None);
                response.add_raw_tlv(ctl_ids::TLV_VALUE, &[service, cid])?;
                self.answer_locally(response).await
            }
            _ => {
                self.answer_locally(Message::response(message, ProtocolError::None)).await
            }
        }
    }

    fn client_for(&mut self, service: u8, client_id: u8) -> Result<&QrtrClient, Error> {
        match self.clients.entry((service, client_id)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let port = self
                    .node
                    .port_for_service(u32::from(service))
                    .ok_or(Error::Closed)?;
                let (client, datagrams) = QrtrClient::new(Arc::clone(&self.node), port)?;
                tokio::spawn(adapt_task(datagrams, self.inbound.clone(), service, client_id));
                Ok(entry.insert(client))
            }
        }
    }
}

#[async_trait]
impl MessageSink for NodeSink {
    async fn send(&mut self, message: &Message) -> Result<(), Error> {
        if message.service_id() == u8::from(Service::Ctl) {
            return self.handle_ctl(message).await;
        }

        let service = message.service_id();
        let client_id = message.client_id();
        if self.node.port_for_service(u32::from(service)).is_none() {
            // The node does not offer the service; answer in-band instead
            // of wedging the whole endpoint.
            debug!("[qrtr node@{}] no port for service {}", self.node.id(), service);
            return self
                .answer_locally(Message::response(message, ProtocolError::Internal))
                .await;
        }
        let data = message.data().to_vec();
        let client = self.client_for(service, client_id)?;
        Ok(client.send(&data).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use qmi_protocol::Service;

    #[tokio::test]
    async fn test_adapter_synthesises_envelope() {
        let (datagram_tx, datagram_rx) = mpsc::channel(4);
        let (message_tx, mut message_rx) = mpsc::channel(4);
        let adapter =
            tokio::spawn(adapt_task(datagram_rx, message_tx, Service::Wds as u8, 3));

        let mut original = Message::new(Service::Wds as u8, 3, 7, 0x0022).unwrap();
        original.add_raw_tlv(0x01, &[0xaa]).unwrap();
        datagram_tx.send(original.data().to_vec()).await.unwrap();

        let rebuilt = message_rx.recv().await.unwrap();
        assert_eq!(rebuilt, original);

        // Garbage payloads are dropped without ending the stream.
        datagram_tx.send(vec![0xff; 3]).await.unwrap();
        datagram_tx.send(original.data().to_vec()).await.unwrap();
        let after = message_rx.recv().await.unwrap();
        assert_eq!(after, original);

        drop(datagram_tx);
        adapter.await.unwrap();
    }
}
