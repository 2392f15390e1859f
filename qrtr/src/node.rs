// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One remote node on the IPC router and its service records.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use log::info;
use tokio::sync::watch;

use crate::bus::BusShared;
use crate::Error;

/// One service registration on a node. A node may carry several records
/// for the same service id (different versions or instances); each port is
/// unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service: u32,
    pub port: u32,
    pub version: u32,
    pub instance: u32,
}

#[derive(Debug, Default)]
struct NodeInner {
    /// Records in registration order.
    services: Vec<ServiceInfo>,
    /// Port to record; ports are unique per node.
    port_index: HashMap<u32, ServiceInfo>,
}

/// A node on the bus. Created by the bus when the first server record for
/// an unknown node id arrives and dropped from the bus map when the last
/// record is withdrawn.
#[derive(Debug)]
pub struct QrtrNode {
    id: u32,
    /// Non-owning reference back to the bus; waits fail `Closed` once the
    /// bus is gone.
    bus: Weak<BusShared>,
    inner: Mutex<NodeInner>,
    /// Flips to true exactly once, when the last record is withdrawn.
    removed: watch::Sender<bool>,
    /// Bumped on every service addition so waiters can re-check.
    generation: watch::Sender<u64>,
}

impl QrtrNode {
    pub(crate) fn new(id: u32, bus: Weak<BusShared>) -> QrtrNode {
        QrtrNode {
            id,
            bus,
            inner: Mutex::new(NodeInner::default()),
            removed: watch::channel(false).0,
            generation: watch::channel(0).0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn add_service_info(&self, record: ServiceInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.services.push(record);
        inner.port_index.insert(record.port, record);
        drop(inner);
        self.generation.send_modify(|g| *g += 1);
    }

    pub(crate) fn remove_service_info(&self, service: u32, port: u32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.port_index.remove(&port) else {
            info!("[qrtr node@{}] tried to remove unknown service {}, port {}", self.id, service, port);
            return;
        };
        inner.services.retain(|s| *s != record);
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.send_replace(true);
    }

    /// Whether the node has already been withdrawn from the bus.
    pub fn is_removed(&self) -> bool {
        *self.removed.borrow()
    }

    /// One-shot removed event: the receiver observes `false -> true` at
    /// most once.
    pub fn removed_watch(&self) -> watch::Receiver<bool> {
        self.removed.subscribe()
    }

    pub fn has_services(&self) -> bool {
        !self.inner.lock().unwrap().services.is_empty()
    }

    /// Snapshot of the node's records in registration order.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.inner.lock().unwrap().services.clone()
    }

    /// The port serving `service`, preferring the highest version when the
    /// node registers several instances.
    pub fn port_for_service(&self, service: u32) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .services
            .iter()
            .filter(|s| s.service == service)
            .max_by_key(|s| s.version)
            .map(|s| s.port)
    }

    /// The service registered on `port`, if any.
    pub fn service_for_port(&self, port: u32) -> Option<u32> {
        self.inner.lock().unwrap().port_index.get(&port).map(|s| s.service)
    }

    fn services_present(&self, services: &[u32]) -> bool {
        let inner = self.inner.lock().unwrap();
        services.iter().all(|wanted| inner.services.iter().any(|s| s.service == *wanted))
    }

    /// Waits until every service in `services` has a record on this node.
    /// Completes immediately when they are all already present; fails
    /// `Closed` if the node is withdrawn or the bus is dropped, `TimedOut`
    /// when `timeout` is nonzero and elapses first.
    pub async fn wait_for_services(&self, services: &[u32], timeout: Duration) -> Result<(), Error> {
        if self.bus.upgrade().is_none() {
            return Err(Error::Closed);
        }

        let wait = self.wait_for_services_inner(services);
        if timeout.is_zero() {
            wait.await
        } else {
            tokio::time::timeout(timeout, wait).await.map_err(|_| Error::TimedOut)?
        }
    }

    async fn wait_for_services_inner(&self, services: &[u32]) -> Result<(), Error> {
        let mut generation = self.generation.subscribe();
        let mut removed = self.removed.subscribe();
        loop {
            if self.is_removed() {
                return Err(Error::Closed);
            }
            if self.services_present(services) {
                return Ok(());
            }
            tokio::select! {
                changed = generation.changed() => {
                    if changed.is_err() {
                        return Err(Error::Closed);
                    }
                }
                _ = removed.changed() => {}
            }
        }
    }
}
