// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The control-plane observer: watches the router's name service and keeps
//! the node map current.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::control::{ControlPacket, ServerRecord, CTRL_PACKET_SIZE, QRTR_PORT_CTRL};
use crate::node::{QrtrNode, ServiceInfo};
use crate::socket::{QrtrAddr, QrtrSocket};
use crate::Error;

/// Bus events, broadcast to every subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    NodeAdded(u32),
    NodeRemoved(u32),
    ServiceAdded { node: u32, service: u32 },
    ServiceRemoved { node: u32, service: u32 },
}

pub(crate) struct BusShared {
    /// Node id to node. Mutated only by the bus task; everyone else takes
    /// shared snapshots.
    nodes: Mutex<HashMap<u32, Arc<QrtrNode>>>,
    events: broadcast::Sender<BusEvent>,
}

impl BusShared {
    fn new() -> Arc<BusShared> {
        Arc::new(BusShared { nodes: Mutex::new(HashMap::new()), events: broadcast::channel(64).0 })
    }

    fn emit(&self, event: BusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Observer of the `AF_QIPCRTR` control plane.
///
/// Owns the control socket exclusively; a background task parses server
/// add/remove packets into the node map and the event channel. Dropping
/// the bus stops the task, after which node waits fail `Closed`.
pub struct QrtrBus {
    shared: Arc<BusShared>,
    task: JoinHandle<()>,
}

impl QrtrBus {
    /// Opens the control socket, subscribes to the name service and waits
    /// for the initial directory lookup to finish. A zero `lookup_timeout`
    /// skips the wait entirely; otherwise the constructor fails `TimedOut`
    /// when the lookup-done sentinel does not arrive in time.
    pub async fn new(lookup_timeout: Duration) -> Result<QrtrBus, Error> {
        let socket = QrtrSocket::new()?;
        let local = socket.local_addr()?;
        debug!("[qrtr] socket lookup from {}", local);
        socket
            .send_to(&ControlPacket::new_lookup(), QrtrAddr { node: local.node, port: QRTR_PORT_CTRL })
            .await?;

        let shared = BusShared::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(bus_task(socket, Arc::clone(&shared), ready_tx));
        let bus = QrtrBus { shared, task };

        if !lookup_timeout.is_zero() {
            match tokio::time::timeout(lookup_timeout, ready_rx).await {
                Ok(Ok(())) => {}
                // The bus task died before the sentinel arrived.
                Ok(Err(_)) => return Err(Error::Closed),
                Err(_) => return Err(Error::TimedOut),
            }
        }
        Ok(bus)
    }

    /// Subscribes to node and service events.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.shared.events.subscribe()
    }

    /// Looks up a node by id, sharing ownership with the bus.
    pub fn get_node(&self, node_id: u32) -> Option<Arc<QrtrNode>> {
        self.shared.nodes.lock().unwrap().get(&node_id).cloned()
    }

    /// Ids of every node currently on the bus.
    pub fn node_ids(&self) -> Vec<u32> {
        self.shared.nodes.lock().unwrap().keys().copied().collect()
    }

    /// Waits for `node_id` to appear on the bus. Completes immediately if
    /// it is already there; a zero timeout waits indefinitely.
    pub async fn wait_for_node(
        &self,
        node_id: u32,
        timeout: Duration,
    ) -> Result<Arc<QrtrNode>, Error> {
        // Subscribe before checking the map so an addition between the
        // check and the wait cannot be missed.
        let events = self.events();
        if let Some(node) = self.get_node(node_id) {
            return Ok(node);
        }

        let wait = self.wait_for_node_inner(node_id, events);
        if timeout.is_zero() {
            wait.await
        } else {
            tokio::time::timeout(timeout, wait).await.map_err(|_| Error::TimedOut)?
        }
    }

    async fn wait_for_node_inner(
        &self,
        node_id: u32,
        mut events: broadcast::Receiver<BusEvent>,
    ) -> Result<Arc<QrtrNode>, Error> {
        loop {
            match events.recv().await {
                Ok(BusEvent::NodeAdded(id)) if id == node_id => {
                    if let Some(node) = self.get_node(node_id) {
                        return Ok(node);
                    }
                }
                Ok(_) => {}
                // Missed events; re-check the map before waiting again.
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(node) = self.get_node(node_id) {
                        return Ok(node);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Closed),
            }
        }
    }
}

impl Drop for QrtrBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn bus_task(socket: QrtrSocket, shared: Arc<BusShared>, ready: oneshot::Sender<()>) {
    let mut ready = Some(ready);
    let mut buf = [0u8; CTRL_PACKET_SIZE * 2];
    loop {
        let (len, _source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("[qrtr] socket i/o failure: {}", e);
                return;
            }
        };
        match ControlPacket::parse(&buf[..len]) {
            None => debug!("[qrtr] short packet received: ignoring"),
            Some(packet) => process_packet(&shared, packet, &mut ready),
        }
    }
}

/// Applies one control packet to the node map, emitting events. Split from
/// the socket loop so the state machine is testable without a router.
pub(crate) fn process_packet(
    shared: &Arc<BusShared>,
    packet: ControlPacket,
    ready: &mut Option<oneshot::Sender<()>>,
) {
    match packet {
        ControlPacket::NewServer(record) if record.is_lookup_done() => {
            debug!("[qrtr] initial lookup finished");
            if let Some(ready) = ready.take() {
                let _ = ready.send(());
            }
        }
        ControlPacket::NewServer(record) => {
            debug!(
                "[qrtr] added server on {}:{} -> service {}, version {}, instance {}",
                record.node, record.port, record.service, record.version, record.instance
            );
            add_server(shared, &record);
        }
        ControlPacket::DelServer(record) => {
            debug!(
                "[qrtr] removed server on {}:{} -> service {}, version {}, instance {}",
                record.node, record.port, record.service, record.version, record.instance
            );
            remove_server(shared, &record);
        }
        ControlPacket::Other(cmd) => {
            debug!("[qrtr] unknown packet type received: 0x{:x}", cmd);
        }
    }
}

fn add_server(shared: &Arc<BusShared>, record: &ServerRecord) {
    let mut nodes = shared.nodes.lock().unwrap();
    let node = match nodes.get(&record.node) {
        Some(node) => Arc::clone(node),
        None => {
            let node = Arc::new(QrtrNode::new(record.node, Arc::downgrade(shared)));
            nodes.insert(record.node, Arc::clone(&node));
            debug!("[qrtr] created new node {}", record.node);
            shared.emit(BusEvent::NodeAdded(record.node));
            node
        }
    };
    drop(nodes);

    node.add_service_info(ServiceInfo {
        service: record.service,
        port: record.port,
        version: record.version,
        instance: record.instance,
    });
    shared.emit(BusEvent::ServiceAdded { node: record.node, service: record.service });
}

fn remove_server(shared: &Arc<BusShared>, record: &ServerRecord) {
    let mut nodes = shared.nodes.lock().unwrap();
    let Some(node) = nodes.get(&record.node).cloned() else {
        warn!("[qrtr] cannot remove service info: nonexistent node {}", record.node);
        return;
    };

    node.remove_service_info(record.service, record.port);
    shared.emit(BusEvent::ServiceRemoved { node: record.node, service: record.service });

    if !node.has_services() {
        debug!("[qrtr] removing node {}", record.node);
        node.mark_removed();
        shared.emit(BusEvent::NodeRemoved(record.node));
        nodes.remove(&record.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{QRTR_TYPE_DEL_SERVER, QRTR_TYPE_NEW_SERVER};
    use pretty_assertions::assert_eq;

    fn packet(cmd: u32, node: u32, service: u32, port: u32, version: u32) -> ControlPacket {
        let record = ServerRecord { service, version, instance: 0, node, port };
        ControlPacket::parse(&ControlPacket::encode(cmd, &record)).unwrap()
    }

    fn drain(events: &mut broadcast::Receiver<BusEvent>) -> Vec<BusEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_add_remove_round_trip() {
        let shared = BusShared::new();
        let mut events = shared.events.subscribe();
        let mut ready = None;

        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 5, 34, 7, 1), &mut ready);
        process_packet(&shared, packet(QRTR_TYPE_DEL_SERVER, 5, 34, 7, 1), &mut ready);

        assert_eq!(
            drain(&mut events),
            vec![
                BusEvent::NodeAdded(5),
                BusEvent::ServiceAdded { node: 5, service: 34 },
                BusEvent::ServiceRemoved { node: 5, service: 34 },
                BusEvent::NodeRemoved(5),
            ]
        );
        assert!(shared.nodes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_node_survives_while_it_has_records() {
        let shared = BusShared::new();
        let mut ready = None;
        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 5, 34, 7, 1), &mut ready);
        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 5, 12, 8, 1), &mut ready);
        process_packet(&shared, packet(QRTR_TYPE_DEL_SERVER, 5, 34, 7, 1), &mut ready);

        let nodes = shared.nodes.lock().unwrap();
        let node = nodes.get(&5).unwrap();
        assert!(node.has_services());
        assert_eq!(node.port_for_service(12), Some(8));
        assert!(!node.is_removed());
    }

    #[test]
    fn test_registry_tracks_running_multiset() {
        let shared = BusShared::new();
        let mut ready = None;
        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 1, 10, 100, 1), &mut ready);
        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 1, 10, 101, 2), &mut ready);
        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 2, 11, 100, 1), &mut ready);
        process_packet(&shared, packet(QRTR_TYPE_DEL_SERVER, 1, 10, 100, 1), &mut ready);

        let nodes = shared.nodes.lock().unwrap();
        let mut triples: Vec<(u32, u32, u32)> = nodes
            .values()
            .flat_map(|n| n.services().into_iter().map(move |s| (n.id(), s.service, s.port)))
            .collect();
        triples.sort_unstable();
        assert_eq!(triples, vec![(1, 10, 101), (2, 11, 100)]);
    }

    #[test]
    fn test_lookup_sentinel_signals_ready_once() {
        let shared = BusShared::new();
        let (tx, mut rx) = oneshot::channel();
        let mut ready = Some(tx);
        let zero = ServerRecord { service: 0, version: 0, instance: 0, node: 0, port: 0 };
        process_packet(
            &shared,
            ControlPacket::parse(&ControlPacket::encode(QRTR_TYPE_NEW_SERVER, &zero)).unwrap(),
            &mut ready,
        );
        assert!(ready.is_none());
        assert!(rx.try_recv().is_ok());
        assert!(shared.nodes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_from_unknown_node_is_harmless() {
        let shared = BusShared::new();
        let mut ready = None;
        process_packet(&shared, packet(QRTR_TYPE_DEL_SERVER, 9, 34, 7, 1), &mut ready);
        assert!(shared.nodes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_node_wait_for_services_dispatches_on_add() {
        let shared = BusShared::new();
        let mut ready = None;
        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 5, 34, 7, 1), &mut ready);
        let node = shared.nodes.lock().unwrap().get(&5).cloned().unwrap();

        let waiter = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.wait_for_services(&[34, 12], Duration::ZERO).await })
        };
        tokio::task::yield_now().await;

        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 5, 12, 8, 1), &mut ready);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_node_wait_for_services_closed_on_removal() {
        let shared = BusShared::new();
        let mut ready = None;
        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 5, 34, 7, 1), &mut ready);
        let node = shared.nodes.lock().unwrap().get(&5).cloned().unwrap();

        let waiter = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.wait_for_services(&[12], Duration::ZERO).await })
        };
        tokio::task::yield_now().await;

        process_packet(&shared, packet(QRTR_TYPE_DEL_SERVER, 5, 34, 7, 1), &mut ready);
        assert!(matches!(waiter.await.unwrap(), Err(Error::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_wait_for_services_times_out() {
        let shared = BusShared::new();
        let mut ready = None;
        process_packet(&shared, packet(QRTR_TYPE_NEW_SERVER, 5, 34, 7, 1), &mut ready);
        let node = shared.nodes.lock().unwrap().get(&5).cloned().unwrap();

        let result = node.wait_for_services(&[12], Duration::from_secs(3)).await;
        assert!(matches!(result, Err(Error::TimedOut)));
    }
}
