// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-device transaction multiplexer.
//!
//! One multiplexer owns one endpoint's transaction-id space. Requests get
//! the next free id for their `(service, client)` pair and park on a
//! oneshot until the matching response, their deadline, or cancellation.
//! Indications never touch the transaction table; they are fanned out to
//! whoever subscribed to their `(service, message id)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use qmi_protocol::{Message, Service, TraceOptions};

use crate::ctl;
use crate::Error;
use crate::MessageSink;

type TxKey = (u8, u8, u16);

struct Pending {
    respond: oneshot::Sender<Result<Message, Error>>,
    abortable: bool,
}

struct IndicationSubscriber {
    /// `None` subscribes across every service.
    service: Option<u8>,
    /// `None` subscribes to every indication of the service.
    message_id: Option<u16>,
    sender: mpsc::UnboundedSender<Arc<Message>>,
}

#[derive(Default)]
struct MuxState {
    /// Next candidate transaction id per (service, client id).
    next_ids: HashMap<(u8, u8), u16>,
    in_flight: HashMap<TxKey, Pending>,
    subscribers: Vec<IndicationSubscriber>,
}

impl MuxState {
    /// Hands out the next free transaction id for the pair: strictly
    /// advancing, wrapping past the maximum back to 1, skipping zero and
    /// anything still in flight. Control transactions are 8-bit.
    fn allocate(&mut self, service: u8, client: u8) -> u16 {
        let max = if service == u8::from(Service::Ctl) { u16::from(u8::MAX) } else { u16::MAX };
        let mut id = *self.next_ids.get(&(service, client)).unwrap_or(&1);
        loop {
            if id == 0 || id > max {
                id = 1;
            }
            if !self.in_flight.contains_key(&(service, client, id)) {
                break;
            }
            id += 1;
        }
        self.next_ids.insert((service, client), if id >= max { 1 } else { id + 1 });
        id
    }
}

struct MuxInner {
    state: Mutex<MuxState>,
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    trace: TraceOptions,
}

impl MuxInner {
    fn remove(&self, key: &TxKey) -> Option<Pending> {
        self.state.lock().unwrap().in_flight.remove(key)
    }

    /// Completes every in-flight transaction with a transport failure and
    /// refuses new sends from here on.
    fn fail_all(&self, context: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<Pending> = {
            let mut state = self.state.lock().unwrap();
            state.in_flight.drain().map(|(_, p)| p).collect()
        };
        for p in pending {
            let error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, context.to_string());
            let _ = p.respond.send(Err(Error::Transport(error)));
        }
    }
}

/// Removes the transaction record if the caller's future is dropped before
/// the request completes; abortable requests additionally get an abort
/// message emitted towards the device.
struct CancelGuard<'a> {
    inner: &'a MuxInner,
    key: TxKey,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (service, client, tx_id) = self.key;
        let Some(pending) = self.inner.remove(&self.key) else { return };
        drop(pending.respond);
        if !pending.abortable {
            // The eventual response is dropped when it arrives.
            return;
        }
        let abort_id = self.inner.state.lock().unwrap().allocate(service, client);
        match ctl::abort_request(service, client, abort_id, tx_id) {
            Ok(abort) => {
                debug!("aborting transaction {} on {}:{}", tx_id, service, client);
                let _ = self.inner.outbound.send(abort);
            }
            Err(e) => warn!("could not build abort for transaction {}: {}", tx_id, e),
        }
    }
}

/// Transaction multiplexer for one control endpoint.
///
/// Responses for distinct transaction ids may complete in any order;
/// responses matching a single id complete exactly once. Outbound
/// messages are emitted in submission order by a single writer task.
pub struct Multiplexer {
    inner: Arc<MuxInner>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Multiplexer {
    /// Builds a multiplexer over a transport's write half and its stream
    /// of parsed inbound messages.
    pub fn new<S: MessageSink>(
        sink: S,
        inbound: mpsc::Receiver<Message>,
        trace: TraceOptions,
    ) -> Multiplexer {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MuxInner {
            state: Mutex::new(MuxState::default()),
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            trace,
        });
        let writer = tokio::spawn(writer_task(sink, outbound_rx, Arc::clone(&inner)));
        let reader = tokio::spawn(reader_task(inbound, Arc::clone(&inner)));
        Multiplexer { inner, reader, writer }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stamps a transaction id on `message`, sends it, and waits for the
    /// matching response. A zero `timeout` waits indefinitely.
    ///
    /// Dropping the returned future cancels the transaction: the record is
    /// removed, and if the request is abortable an abort is sent to the
    /// device; otherwise its eventual response is silently dropped.
    pub async fn send_request(&self, mut message: Message, timeout: Duration) -> Result<Message, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let service = message.service_id();
        let client = message.client_id();
        let abortable = message.is_abortable();
        let (respond, response) = oneshot::channel();

        let tx_id = {
            let mut state = self.inner.state.lock().unwrap();
            let tx_id = state.allocate(service, client);
            state.in_flight.insert((service, client, tx_id), Pending { respond, abortable });
            tx_id
        };
        message.set_transaction_id(tx_id);

        if self.inner.trace.enabled {
            debug!("sent message...\n{}", message.printable("<<<<<< ", &self.inner.trace));
        }

        let key = (service, client, tx_id);
        if self.inner.outbound.send(message).is_err() {
            self.inner.remove(&key);
            return Err(Error::Closed);
        }

        let mut guard = CancelGuard { inner: &self.inner, key, armed: true };
        let completed = if timeout.is_zero() {
            response.await
        } else {
            match tokio::time::timeout(timeout, response).await {
                Ok(completed) => completed,
                Err(_elapsed) => {
                    // A deadline just removes the record; only an explicit
                    // cancellation aborts.
                    guard.armed = false;
                    self.inner.remove(&key);
                    return Err(Error::TimedOut);
                }
            }
        };
        guard.armed = false;
        // A dropped sender means the multiplexer shut down under us.
        completed.unwrap_or(Err(Error::Closed))
    }

    /// Subscribes to indications of `service`, optionally narrowed to one
    /// message id. Every subscriber gets a shared handle to each matching
    /// indication.
    pub fn subscribe_indications(
        &self,
        service: u8,
        message_id: Option<u16>,
    ) -> mpsc::UnboundedReceiver<Arc<Message>> {
        self.subscribe(Some(service), message_id)
    }

    /// Subscribes to every indication the endpoint emits, whatever the
    /// service. The proxy uses this for its fan-out.
    pub fn subscribe_all_indications(&self) -> mpsc::UnboundedReceiver<Arc<Message>> {
        self.subscribe(None, None)
    }

    fn subscribe(
        &self,
        service: Option<u8>,
        message_id: Option<u16>,
    ) -> mpsc::UnboundedReceiver<Arc<Message>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.state.lock().unwrap().subscribers.push(IndicationSubscriber {
            service,
            message_id,
            sender,
        });
        receiver
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.inner.state.lock().unwrap().in_flight.len()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn writer_task<S: MessageSink>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    inner: Arc<MuxInner>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(&message).await {
            warn!("transport write failed: {}", e);
            inner.fail_all("upstream write failed");
            return;
        }
    }
}

async fn reader_task(mut inbound: mpsc::Receiver<Message>, inner: Arc<MuxInner>) {
    while let Some(message) = inbound.recv().await {
        handle_inbound(&inner, message);
    }
    // Transport stream ended; nothing in flight can complete anymore.
    inner.fail_all("transport stream ended");
}

fn handle_inbound(inner: &MuxInner, message: Message) {
    if inner.trace.enabled {
        debug!("received message...\n{}", message.printable(">>>>>> ", &inner.trace));
    }

    if message.is_indication() {
        let message = Arc::new(message);
        let mut state = inner.state.lock().unwrap();
        state.subscribers.retain(|s| {
            let matches = s.service.map_or(true, |service| service == message.service_id())
                && s.message_id.map_or(true, |id| id == message.message_id());
            if matches {
                s.sender.send(Arc::clone(&message)).is_ok()
            } else {
                !s.sender.is_closed()
            }
        });
        return;
    }

    if message.is_response() {
        let key = (message.service_id(), message.client_id(), message.transaction_id());
        match inner.remove(&key) {
            Some(pending) => {
                let _ = pending.respond.send(Ok(message));
            }
            None => debug!(
                "dropping response with no matching transaction ({}:{} tx {})",
                key.0, key.1, key.2
            ),
        }
        return;
    }

    debug!("dropping unexpected request from the device");
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use qmi_protocol::message::MESSAGE_ABORT;
    use qmi_protocol::{ctl as ctl_ids, Endian, ProtocolError};

    const WDS: u8 = Service::Wds as u8;

    struct MockSink {
        sent: mpsc::UnboundedSender<Message>,
        fail: bool,
    }

    #[async_trait]
    impl MessageSink for MockSink {
        async fn send(&mut self, message: &Message) -> Result<(), Error> {
            if self.fail {
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock failure",
                )));
            }
            self.sent.send(message.clone()).unwrap();
            Ok(())
        }
    }

    struct Harness {
        mux: Multiplexer,
        sent: mpsc::UnboundedReceiver<Message>,
        inbound: mpsc::Sender<Message>,
    }

    fn harness_with(fail: bool) -> Harness {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let mux = Multiplexer::new(
            MockSink { sent: sent_tx, fail },
            inbound_rx,
            TraceOptions::default(),
        );
        Harness { mux, sent: sent_rx, inbound: inbound_tx }
    }

    fn harness() -> Harness {
        harness_with(false)
    }

    fn request(client: u8, message_id: u16) -> Message {
        Message::new(WDS, client, 0, message_id).unwrap()
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let h = harness();
        let mux = &h.mux;
        let mut sent = h.sent;
        let inbound = h.inbound.clone();

        let responder = tokio::spawn(async move {
            let on_wire = sent.recv().await.unwrap();
            assert_eq!(on_wire.transaction_id(), 1);
            inbound.send(Message::response(&on_wire, ProtocolError::None)).await.unwrap();
        });

        let response =
            mux.send_request(request(3, 0x0022), Duration::from_secs(5)).await.unwrap();
        assert!(response.is_response());
        assert_eq!(response.transaction_id(), 1);
        assert_eq!(response.result_code().unwrap(), ProtocolError::None);
        assert_eq!(mux.in_flight_len(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_ids_advance_per_pair() {
        let h = harness();
        let mut sent = h.sent;
        for expected in 1..=3u16 {
            let inbound = h.inbound.clone();
            let responder = tokio::spawn(async move {
                let on_wire = sent.recv().await.unwrap();
                assert_eq!(on_wire.transaction_id(), expected);
                inbound.send(Message::response(&on_wire, ProtocolError::None)).await.unwrap();
                sent
            });
            h.mux.send_request(request(3, 0x0022), Duration::from_secs(5)).await.unwrap();
            sent = responder.await.unwrap();
        }
    }

    #[test]
    fn test_allocator_skips_zero_and_in_flight() {
        let mut state = MuxState::default();
        let (tx, _rx) = oneshot::channel();
        state.in_flight.insert((WDS, 3, 2), Pending { respond: tx, abortable: false });

        assert_eq!(state.allocate(WDS, 3), 1);
        // 2 is in flight, so the allocator steps over it.
        assert_eq!(state.allocate(WDS, 3), 3);
        assert_eq!(state.allocate(WDS, 3), 4);
        // Another pair has its own sequence.
        assert_eq!(state.allocate(WDS, 4), 1);
    }

    #[test]
    fn test_allocator_wraps_to_one() {
        let mut state = MuxState::default();
        state.next_ids.insert((WDS, 3), u16::MAX);
        assert_eq!(state.allocate(WDS, 3), u16::MAX);
        assert_eq!(state.allocate(WDS, 3), 1);

        let ctl = u8::from(Service::Ctl);
        state.next_ids.insert((ctl, 0), 0x00ff);
        assert_eq!(state.allocate(ctl, 0), 0x00ff);
        assert_eq!(state.allocate(ctl, 0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_record() {
        let h = harness();
        let result = h.mux.send_request(request(3, 0x0022), Duration::from_secs(1)).await;
        assert_matches!(result, Err(Error::TimedOut));
        assert_eq!(h.mux.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let h = harness();
        let stray = {
            let mut tagged = request(3, 0x0022);
            tagged.set_transaction_id(99);
            Message::response(&tagged, ProtocolError::None)
        };
        h.inbound.send(stray).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(h.mux.in_flight_len(), 0);
        assert!(!h.mux.is_closed());
    }

    #[tokio::test]
    async fn test_indication_fan_out() {
        let h = harness();
        let mut narrow = h.mux.subscribe_indications(WDS, Some(0x0022));
        let mut wide = h.mux.subscribe_indications(WDS, None);
        let mut other = h.mux.subscribe_indications(WDS, Some(0x0099));

        let indication = {
            let mut qmi_data = bytes::BytesMut::new();
            let mut msg = Message::new(WDS, 3, 7, 0x0022).unwrap();
            msg.add_raw_tlv(0x01, &[0xaa]).unwrap();
            // Flip the header flags to indication by round-tripping the
            // payload with the indication bit set.
            let mut raw = msg.raw().to_vec();
            raw[6] = 0x04;
            qmi_data.extend_from_slice(&raw);
            Message::from_raw(&mut qmi_data).unwrap().unwrap()
        };
        assert!(indication.is_indication());
        h.inbound.send(indication).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(narrow.recv().await.unwrap().message_id(), 0x0022);
        assert_eq!(wide.recv().await.unwrap().message_id(), 0x0022);
        assert_matches!(other.try_recv(), Err(mpsc::error::TryRecvError::Empty));
        assert_eq!(h.mux.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_non_abortable_detaches_quietly() {
        let h = harness();
        let mut sent = h.sent;

        let mux = Arc::new(h.mux);
        let request_task = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move {
                let _ = mux.send_request(request(3, 0x0022), Duration::from_secs(60)).await;
            })
        };
        // Wait for the request to hit the wire, then cancel the caller.
        let on_wire = sent.recv().await.unwrap();
        assert_eq!(on_wire.transaction_id(), 1);
        request_task.abort();
        let _ = request_task.await;

        assert_eq!(mux.in_flight_len(), 0);
        // No abort goes out for a non-abortable request.
        tokio::task::yield_now().await;
        assert_matches!(sent.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_cancel_abortable_emits_abort() {
        let h = harness();
        let mut sent = h.sent;

        let mux = Arc::new(h.mux);
        let request_task = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move {
                // WDS Start Network is in the abortable table.
                let _ = mux.send_request(request(3, 0x0020), Duration::from_secs(60)).await;
            })
        };
        let on_wire = sent.recv().await.unwrap();
        assert_eq!(on_wire.message_id(), 0x0020);
        request_task.abort();
        let _ = request_task.await;

        let abort = sent.recv().await.unwrap();
        assert_eq!(abort.message_id(), MESSAGE_ABORT);
        assert_eq!(abort.service_id(), WDS);
        assert_eq!(abort.client_id(), 3);
        let (mut reader, _) = abort.tlv_read_init(ctl_ids::TLV_VALUE).unwrap();
        assert_eq!(reader.read_u16(Endian::Little).unwrap(), on_wire.transaction_id());
        assert_eq!(mux.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_write_error_fails_in_flight_and_closes() {
        let h = harness_with(true);
        let result = h.mux.send_request(request(3, 0x0022), Duration::from_secs(5)).await;
        assert_matches!(result, Err(Error::Transport(_)));
        assert!(h.mux.is_closed());
        let again = h.mux.send_request(request(3, 0x0022), Duration::from_secs(5)).await;
        assert_matches!(again, Err(Error::Closed));
    }

    #[tokio::test]
    async fn test_inbound_close_fails_in_flight() {
        let h = harness();
        let mut sent = h.sent;
        let inbound = h.inbound;

        let mux = Arc::new(h.mux);
        let request_task = {
            let mux = Arc::clone(&mux);
            tokio::spawn(
                async move { mux.send_request(request(3, 0x0022), Duration::from_secs(60)).await },
            )
        };
        let _on_wire = sent.recv().await.unwrap();
        drop(inbound);

        let result = request_task.await.unwrap();
        assert_matches!(result, Err(Error::Transport(_)));
        assert!(mux.is_closed());
    }
}
