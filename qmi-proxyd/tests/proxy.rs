// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end proxy behavior against a scripted modem.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::BytesMut;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use qmi_protocol::{ctl as ctl_ids, Message, ProtocolError, Service, TraceOptions};
use qmi_proxyd::proxy::{Proxy, ProxyConfig, UpstreamFactory};
use qmi_transport::{Error, MessageSink, Multiplexer};

const CTL: u8 = Service::Ctl as u8;
const WDS: u8 = Service::Wds as u8;
const DMS: u8 = Service::Dms as u8;

/// Everything a test wants to observe or poke on the fake modem.
#[derive(Clone, Default)]
struct ModemHandle {
    /// Messages the proxy sent upstream.
    wire: Arc<Mutex<Vec<Message>>>,
    /// Injection points into each opened upstream's inbound stream.
    inject: Arc<Mutex<Vec<mpsc::Sender<Message>>>>,
}

impl ModemHandle {
    fn sent(&self) -> Vec<Message> {
        self.wire.lock().unwrap().clone()
    }

    async fn wait_for_sent(&self, predicate: impl Fn(&Message) -> bool) -> Message {
        for _ in 0..200 {
            if let Some(found) = self.sent().into_iter().find(|m| predicate(m)) {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected message never reached the modem");
    }

    async fn inject_indication(&self, message: Message) {
        let senders = self.inject.lock().unwrap().clone();
        for sender in senders {
            sender.send(message.clone()).await.unwrap();
        }
    }
}

struct ModemSink {
    handle: ModemHandle,
    reply: mpsc::Sender<Message>,
    next_cid: u8,
}

#[async_trait]
impl MessageSink for ModemSink {
    async fn send(&mut self, message: &Message) -> Result<(), Error> {
        self.handle.wire.lock().unwrap().push(message.clone());

        let reply = if message.service_id() == CTL
            && message.message_id() == ctl_ids::MESSAGE_ALLOCATE_CID
        {
            let (mut reader, _) = message.tlv_read_init(ctl_ids::TLV_VALUE).unwrap();
            let service = reader.read_u8().unwrap();
            let cid = self.next_cid;
            self.next_cid += 1;
            let mut reply = Message::response(message, ProtocolError::None);
            reply.add_raw_tlv(ctl_ids::TLV_VALUE, &[service, cid]).unwrap();
            reply
        } else if message.service_id() == CTL
            && message.message_id() == ctl_ids::MESSAGE_RELEASE_CID
        {
            let (mut reader, _) = message.tlv_read_init(ctl_ids::TLV_VALUE).unwrap();
            let service = reader.read_u8().unwrap();
            let cid = reader.read_u8().unwrap();
            let mut reply = Message::response(message, ProtocolError::None);
            reply.add_raw_tlv(ctl_ids::TLV_VALUE, &[service, cid]).unwrap();
            reply
        } else {
            Message::response(message, ProtocolError::None)
        };
        let _ = self.reply.send(reply).await;
        Ok(())
    }
}

fn mock_factory(handle: ModemHandle) -> UpstreamFactory {
    Box::new(move |_path, trace| {
        let handle = handle.clone();
        Box::pin(async move {
            let (inbound_tx, inbound_rx) = mpsc::channel(16);
            handle.inject.lock().unwrap().push(inbound_tx.clone());
            let sink = ModemSink { handle, reply: inbound_tx, next_cid: 7 };
            Ok(Multiplexer::new(sink, inbound_rx, trace))
        })
    })
}

struct TestProxy {
    dir: tempfile::TempDir,
    modem: ModemHandle,
}

fn start_proxy(empty_timeout: Option<Duration>) -> TestProxy {
    let dir = tempfile::tempdir().unwrap();
    let modem = ModemHandle::default();
    let proxy = Proxy::bind_path_with_factory(
        &dir.path().join("socket"),
        ProxyConfig { empty_timeout, trace: TraceOptions::default() },
        mock_factory(modem.clone()),
    )
    .unwrap();
    tokio::spawn(async move { proxy.run().await });
    TestProxy { dir, modem }
}

async fn connect(proxy: &TestProxy) -> (UnixStream, BytesMut) {
    let stream = UnixStream::connect(proxy.dir.path().join("socket")).await.unwrap();
    (stream, BytesMut::new())
}

async fn send(stream: &mut UnixStream, message: &Message) {
    stream.write_all(message.raw()).await.unwrap();
}

async fn read_message(stream: &mut UnixStream, pending: &mut BytesMut) -> Message {
    loop {
        if let Some(message) = Message::from_raw(pending).unwrap() {
            return message;
        }
        let received = tokio::time::timeout(Duration::from_secs(5), stream.read_buf(pending))
            .await
            .expect("timed out waiting for a proxy frame")
            .unwrap();
        assert_ne!(received, 0, "proxy closed the connection");
    }
}

async fn open_device(stream: &mut UnixStream, pending: &mut BytesMut, path: &str) {
    let mut open = qmi_transport::ctl::proxy_open_request(path).unwrap();
    open.set_transaction_id(1);
    send(stream, &open).await;
    let reply = read_message(stream, pending).await;
    assert_eq!(reply.message_id(), ctl_ids::MESSAGE_INTERNAL_PROXY_OPEN);
    assert_eq!(reply.result_code().unwrap(), ProtocolError::None);
}

fn indication(service: u8, client: u8, message_id: u16) -> Message {
    let mut request = Message::new(service, client, 0, message_id).unwrap();
    request.add_raw_tlv(0x01, &[0x00]).unwrap();
    let mut raw = request.raw().to_vec();
    // Header flags live right after the QMUX header.
    raw[6] = if service == CTL { 0x02 } else { 0x04 };
    let mut buf = BytesMut::from(&raw[..]);
    let message = Message::from_raw(&mut buf).unwrap().unwrap();
    assert!(message.is_indication());
    message
}

#[tokio::test]
async fn test_open_then_transparent_allocation() {
    let proxy = start_proxy(None);
    let (mut stream, mut pending) = connect(&proxy).await;
    open_device(&mut stream, &mut pending, "/dev/cdc-wdm0").await;

    // A WDS request with no allocated id: the proxy allocates on our
    // behalf, rewrites the client id, and maps the response back onto our
    // transaction id.
    let mut request = Message::new(WDS, 0, 5, 0x004d).unwrap();
    request.add_raw_tlv(0x01, &[0x01]).unwrap();
    send(&mut stream, &request).await;

    let response = read_message(&mut stream, &mut pending).await;
    assert_eq!(response.transaction_id(), 5);
    assert_eq!(response.message_id(), 0x004d);
    assert_eq!(response.client_id(), 7);
    assert_eq!(response.result_code().unwrap(), ProtocolError::None);

    let allocate = proxy
        .modem
        .wait_for_sent(|m| m.message_id() == ctl_ids::MESSAGE_ALLOCATE_CID)
        .await;
    assert_eq!(allocate.service_id(), CTL);
    let forwarded = proxy.modem.wait_for_sent(|m| m.service_id() == WDS).await;
    assert_eq!(forwarded.client_id(), 7);
    assert_eq!(forwarded.message_id(), 0x004d);
}

#[tokio::test]
async fn test_explicit_allocation_is_idempotent() {
    let proxy = start_proxy(None);
    let (mut stream, mut pending) = connect(&proxy).await;
    open_device(&mut stream, &mut pending, "/dev/cdc-wdm0").await;

    let mut allocate = qmi_transport::ctl::allocate_cid_request(WDS).unwrap();
    allocate.set_transaction_id(2);
    send(&mut stream, &allocate).await;
    let first = read_message(&mut stream, &mut pending).await;
    assert_eq!(first.transaction_id(), 2);
    assert_eq!(first.raw_tlv(ctl_ids::TLV_VALUE).unwrap(), &[WDS, 7]);

    // Asking again does not burn another device id.
    let mut again = qmi_transport::ctl::allocate_cid_request(WDS).unwrap();
    again.set_transaction_id(3);
    send(&mut stream, &again).await;
    let second = read_message(&mut stream, &mut pending).await;
    assert_eq!(second.raw_tlv(ctl_ids::TLV_VALUE).unwrap(), &[WDS, 7]);

    let allocations = proxy
        .modem
        .sent()
        .into_iter()
        .filter(|m| m.message_id() == ctl_ids::MESSAGE_ALLOCATE_CID)
        .count();
    assert_eq!(allocations, 1);
}

#[tokio::test]
async fn test_disconnect_releases_client_ids() {
    let proxy = start_proxy(None);
    let (mut stream, mut pending) = connect(&proxy).await;
    open_device(&mut stream, &mut pending, "/dev/cdc-wdm0").await;

    let mut allocate = qmi_transport::ctl::allocate_cid_request(WDS).unwrap();
    allocate.set_transaction_id(2);
    send(&mut stream, &allocate).await;
    let _ = read_message(&mut stream, &mut pending).await;

    drop(stream);

    let release = proxy
        .modem
        .wait_for_sent(|m| m.message_id() == ctl_ids::MESSAGE_RELEASE_CID)
        .await;
    assert_eq!(release.raw_tlv(ctl_ids::TLV_VALUE).unwrap(), &[WDS, 7]);
}

#[tokio::test]
async fn test_indications_go_to_service_owners_only() {
    let proxy = start_proxy(None);

    let (mut wds_client, mut wds_pending) = connect(&proxy).await;
    open_device(&mut wds_client, &mut wds_pending, "/dev/cdc-wdm0").await;
    let mut allocate = qmi_transport::ctl::allocate_cid_request(WDS).unwrap();
    allocate.set_transaction_id(2);
    send(&mut wds_client, &allocate).await;
    let _ = read_message(&mut wds_client, &mut wds_pending).await;

    let (mut dms_client, mut dms_pending) = connect(&proxy).await;
    open_device(&mut dms_client, &mut dms_pending, "/dev/cdc-wdm0").await;
    let mut allocate = qmi_transport::ctl::allocate_cid_request(DMS).unwrap();
    allocate.set_transaction_id(2);
    send(&mut dms_client, &allocate).await;
    let _ = read_message(&mut dms_client, &mut dms_pending).await;

    // A WDS indication lands on the WDS owner only.
    proxy.modem.inject_indication(indication(WDS, 7, 0x0022)).await;
    let delivered = read_message(&mut wds_client, &mut wds_pending).await;
    assert!(delivered.is_indication());
    assert_eq!(delivered.service_id(), WDS);

    // A control indication is broadcast; both clients see it.
    proxy.modem.inject_indication(indication(CTL, 0, ctl_ids::MESSAGE_SYNC)).await;
    let wds_sync = read_message(&mut wds_client, &mut wds_pending).await;
    assert_eq!(wds_sync.service_id(), CTL);
    let dms_sync = read_message(&mut dms_client, &mut dms_pending).await;
    assert_eq!(dms_sync.service_id(), CTL);

    // The DMS client never saw the WDS indication.
    assert!(dms_pending.is_empty());
}

#[tokio::test]
async fn test_malformed_frame_answered_and_connection_survives() {
    let proxy = start_proxy(None);
    let (mut stream, mut pending) = connect(&proxy).await;
    open_device(&mut stream, &mut pending, "/dev/cdc-wdm0").await;

    // A structurally broken frame: marker and header survive, but the
    // declared TLV length overruns the buffer.
    let mut request = Message::new(WDS, 0, 9, 0x0020).unwrap();
    request.add_raw_tlv(0x01, &[0xaa, 0xbb]).unwrap();
    let mut raw = request.raw().to_vec();
    let tlv_len_pos = raw.len() - 4;
    raw[tlv_len_pos] = 0xff;
    stream.write_all(&raw).await.unwrap();

    let reply = read_message(&mut stream, &mut pending).await;
    assert_eq!(reply.transaction_id(), 9);
    assert_matches!(reply.result_code().unwrap(), ProtocolError::MalformedMessage);

    // Same connection still works.
    let mut request = Message::new(WDS, 0, 10, 0x004d).unwrap();
    request.add_raw_tlv(0x01, &[0x01]).unwrap();
    send(&mut stream, &request).await;
    let response = read_message(&mut stream, &mut pending).await;
    assert_eq!(response.transaction_id(), 10);
    assert_eq!(response.result_code().unwrap(), ProtocolError::None);
}

#[tokio::test]
async fn test_speaking_before_open_is_rejected() {
    let proxy = start_proxy(None);
    let (mut stream, mut pending) = connect(&proxy).await;

    let request = Message::new(WDS, 0, 4, 0x004d).unwrap();
    send(&mut stream, &request).await;
    let reply = read_message(&mut stream, &mut pending).await;
    assert_eq!(reply.transaction_id(), 4);
    assert_matches!(reply.result_code().unwrap(), ProtocolError::Internal);
    assert!(proxy.modem.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_exit_fires_with_no_clients() {
    let dir = tempfile::tempdir().unwrap();
    let modem = ModemHandle::default();
    let proxy = Proxy::bind_path_with_factory(
        &dir.path().join("socket"),
        ProxyConfig {
            empty_timeout: Some(Duration::from_secs(300)),
            trace: TraceOptions::default(),
        },
        mock_factory(modem),
    )
    .unwrap();

    let served = tokio::time::timeout(Duration::from_secs(301), proxy.run()).await;
    assert_matches!(served, Ok(Ok(())));
}
