// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The proxy: one daemon sharing physical QMI control endpoints between
//! unrelated local processes.
//!
//! Each downstream connection names the endpoint it wants with an open
//! handshake, then exchanges plain QMUX frames. The proxy owns the real
//! device's client-id space: it allocates ids on behalf of clients
//! (transparently if they never ask), rewrites their traffic onto the
//! issued ids, fans indications out to the owners of each service, and
//! releases everything a client held when its connection drops.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex};

use qmi_protocol::{ctl as ctl_ids, Message, ProtocolError, Service, TraceOptions};
use qmi_transport::{ctl, device, qrtr_transport, Error, Multiplexer};

/// Abstract-namespace name of the daemon's listening socket.
pub const SOCKET_NAME: &str = "qmi-proxyd";

/// Deadline for requests the proxy forwards upstream.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the best-effort releases issued when a client drops.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the QRTR bus lookup and node when a client opens
/// a `qrtr://` endpoint.
const QRTR_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

const CTL: u8 = Service::Ctl as u8;

pub struct ProxyConfig {
    /// Exit after this long with zero clients; `None` never exits.
    pub empty_timeout: Option<Duration>,
    pub trace: TraceOptions,
}

type UpstreamFuture = Pin<Box<dyn Future<Output = Result<Multiplexer, Error>> + Send>>;

/// Opens an upstream endpoint by path. Swappable so tests can stand in a
/// loopback device.
pub type UpstreamFactory = Box<dyn Fn(&str, TraceOptions) -> UpstreamFuture + Send + Sync>;

struct ProxyShared {
    config: ProxyConfig,
    factory: UpstreamFactory,
    /// Device path to its multiplexer; one upstream per physical endpoint.
    upstreams: Mutex<HashMap<String, Arc<Multiplexer>>>,
    qrtr_bus: Mutex<Option<Arc<qrtr::QrtrBus>>>,
    n_clients: watch::Sender<usize>,
}

/// The daemon. Listens on a local socket and serves until told to stop or
/// until the idle timer fires.
pub struct Proxy {
    listener: UnixListener,
    shared: Arc<ProxyShared>,
}

impl Proxy {
    /// Binds the well-known abstract socket.
    pub fn new(config: ProxyConfig) -> Result<Proxy, Error> {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(SOCKET_NAME.as_bytes())?;
        let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
        Self::from_std(listener, config, default_factory())
    }

    /// Binds a filesystem socket path instead of the abstract name.
    pub fn bind_path(path: &Path, config: ProxyConfig) -> Result<Proxy, Error> {
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        Self::from_std(listener, config, default_factory())
    }

    /// Like [`Proxy::bind_path`] with a caller-supplied upstream opener.
    pub fn bind_path_with_factory(
        path: &Path,
        config: ProxyConfig,
        factory: UpstreamFactory,
    ) -> Result<Proxy, Error> {
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        Self::from_std(listener, config, factory)
    }

    fn from_std(
        listener: std::os::unix::net::UnixListener,
        config: ProxyConfig,
        factory: UpstreamFactory,
    ) -> Result<Proxy, Error> {
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;
        let shared = Arc::new(ProxyShared {
            config,
            factory,
            upstreams: Mutex::new(HashMap::new()),
            qrtr_bus: Mutex::new(None),
            n_clients: watch::channel(0).0,
        });
        Ok(Proxy { listener, shared })
    }

    pub fn n_clients(&self) -> usize {
        *self.shared.n_clients.borrow()
    }

    /// Serves until the idle timer fires. Runs forever when the timer is
    /// disabled; the caller races this against its signal handlers.
    pub async fn run(&self) -> Result<(), Error> {
        match self.shared.config.empty_timeout {
            Some(timeout) => info!("proxy will exit after {}s if unused", timeout.as_secs()),
            None => info!("proxy will remain running if unused"),
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let shared = Arc::clone(&self.shared);
                    shared.n_clients.send_modify(|n| *n += 1);
                    debug!("client connected ({} total)", self.n_clients());
                    tokio::spawn(client_task(shared, stream));
                }
                _ = idle_exit(&self.shared) => {
                    info!("no clients for a while, exiting");
                    return Ok(());
                }
            }
        }
    }
}

/// Resolves when the proxy has been idle for the configured timeout. A
/// client arriving cancels any pending countdown.
async fn idle_exit(shared: &Arc<ProxyShared>) {
    let Some(timeout) = shared.config.empty_timeout else {
        return std::future::pending().await;
    };
    let mut clients = shared.n_clients.subscribe();
    loop {
        while *clients.borrow() != 0 {
            if clients.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if *clients.borrow() == 0 {
                    return;
                }
            }
            changed = clients.changed() => {
                if changed.is_err() {
                    return std::future::pending().await;
                }
            }
        }
    }
}

fn default_factory() -> UpstreamFactory {
    Box::new(|path, trace| {
        let path = path.to_string();
        Box::pin(async move {
            let (sink, inbound) = device::open(Path::new(&path))?;
            Ok(Multiplexer::new(sink, inbound, trace))
        })
    })
}

/// Opens a `qrtr://<node>` endpoint, bringing the daemon-wide bus up on
/// first use. The bus lives in the proxy state so node maps stay current
/// for as long as any upstream needs them.
async fn open_qrtr_endpoint(
    shared: &Arc<ProxyShared>,
    node_id: u32,
) -> Result<Multiplexer, Error> {
    let bus = {
        let mut slot = shared.qrtr_bus.lock().await;
        match slot.as_ref() {
            Some(bus) => Arc::clone(bus),
            None => {
                let bus = Arc::new(qrtr::QrtrBus::new(QRTR_LOOKUP_TIMEOUT).await?);
                *slot = Some(Arc::clone(&bus));
                bus
            }
        }
    };
    let node = bus.wait_for_node(node_id, QRTR_LOOKUP_TIMEOUT).await?;
    let (sink, inbound) = qrtr_transport::open_node(node);
    Ok(Multiplexer::new(sink, inbound, shared.config.trace))
}

/// Decrements the client count when a connection task ends, whatever way
/// it ends.
struct ClientCountGuard(Arc<ProxyShared>);

impl Drop for ClientCountGuard {
    fn drop(&mut self) {
        self.0.n_clients.send_modify(|n| *n -= 1);
        debug!("client disconnected ({} left)", *self.0.n_clients.borrow());
    }
}

struct ClientConn {
    write: OwnedWriteHalf,
    upstream: Option<Arc<Multiplexer>>,
    /// Client ids the device issued for this connection, per service.
    allocated: HashMap<u8, u8>,
    indications: Option<mpsc::UnboundedReceiver<Arc<Message>>>,
    trace: TraceOptions,
}

async fn client_task(shared: Arc<ProxyShared>, stream: UnixStream) {
    let _guard = ClientCountGuard(Arc::clone(&shared));
    let (mut read, write) = stream.into_split();
    let mut conn = ClientConn {
        write,
        upstream: None,
        allocated: HashMap::new(),
        indications: None,
        trace: shared.config.trace,
    };

    if let Err(e) = serve_client(&shared, &mut conn, &mut read).await {
        debug!("client connection ended: {}", e);
    }
    release_client_ids(&mut conn).await;
}

async fn serve_client(
    shared: &Arc<ProxyShared>,
    conn: &mut ClientConn,
    read: &mut OwnedReadHalf,
) -> Result<(), Error> {
    let mut pending = BytesMut::with_capacity(4096);
    loop {
        tokio::select! {
            received = read.read_buf(&mut pending) => {
                if received? == 0 {
                    return Ok(());
                }
                process_pending(shared, conn, &mut pending).await?;
            }
            indication = next_indication(&mut conn.indications) => {
                deliver_indication(conn, indication).await?;
            }
        }
    }
}

/// Yields the next upstream indication, or parks forever when this client
/// has no upstream (yet) or its subscription ended.
async fn next_indication(
    indications: &mut Option<mpsc::UnboundedReceiver<Arc<Message>>>,
) -> Arc<Message> {
    match indications {
        Some(receiver) => match receiver.recv().await {
            Some(message) => message,
            None => {
                *indications = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

async fn deliver_indication(conn: &mut ClientConn, indication: Arc<Message>) -> Result<(), Error> {
    // Control indications (e.g. sync) are broadcast; everything else goes
    // only to owners of a client id on the indication's service.
    let service = indication.service_id();
    if service != CTL && !conn.allocated.contains_key(&service) {
        return Ok(());
    }
    if conn.trace.enabled {
        debug!("forwarding indication...\n{}", indication.printable(">>>>>> ", &conn.trace));
    }
    conn.write.write_all(indication.raw()).await?;
    Ok(())
}

async fn process_pending(
    shared: &Arc<ProxyShared>,
    conn: &mut ClientConn,
    pending: &mut BytesMut,
) -> Result<(), Error> {
    loop {
        match Message::from_raw(pending) {
            Ok(Some(message)) => {
                let reply = handle_message(shared, conn, message).await?;
                for frame in reply {
                    conn.write.write_all(frame.raw()).await?;
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                // The connection stays up; the client just gets told its
                // frame was bad.
                warn!("malformed message from client: {}", e);
                let reply = malformed_reply(pending);
                pending.clear();
                if let Some(frame) = reply {
                    conn.write.write_all(frame.raw()).await?;
                }
                return Ok(());
            }
        }
    }
}

/// Best-effort response for an unparseable frame: if enough of the header
/// survived, answer it; pure garbage is silently dropped.
fn malformed_reply(pending: &[u8]) -> Option<Message> {
    if pending.len() < 12 || pending[0] != 0x01 {
        return None;
    }
    let service = pending[4];
    let client = pending[5];
    let (transaction, message_id) = if service == CTL {
        (u16::from(pending[7]), u16::from_le_bytes([pending[8], pending[9]]))
    } else {
        (u16::from_le_bytes([pending[7], pending[8]]), u16::from_le_bytes([pending[9], pending[10]]))
    };
    let request = Message::new(service, client, transaction, message_id).ok()?;
    Some(Message::response(&request, ProtocolError::MalformedMessage))
}

async fn handle_message(
    shared: &Arc<ProxyShared>,
    conn: &mut ClientConn,
    message: Message,
) -> Result<Vec<Message>, Error> {
    if conn.trace.enabled {
        debug!("message from client...\n{}", message.printable("<<<<<< ", &conn.trace));
    }

    let Some(upstream) = conn.upstream.clone() else {
        return handle_open(shared, conn, message).await;
    };

    if message.service_id() == CTL {
        return handle_ctl(conn, &upstream, message).await;
    }
    handle_service_request(conn, &upstream, message).await
}

async fn handle_open(
    shared: &Arc<ProxyShared>,
    conn: &mut ClientConn,
    message: Message,
) -> Result<Vec<Message>, Error> {
    if message.service_id() != CTL || message.message_id() != ctl_ids::MESSAGE_INTERNAL_PROXY_OPEN {
        debug!("client spoke before the open handshake");
        return Ok(vec![Message::response(&message, ProtocolError::Internal)]);
    }

    let path = match ctl::parse_proxy_open_request(&message) {
        Ok(path) => path,
        Err(e) => {
            warn!("bad proxy open request: {}", e);
            return Ok(vec![Message::response(&message, ProtocolError::MalformedMessage)]);
        }
    };

    match upstream_for_path(shared, &path).await {
        Ok(upstream) => {
            info!("client attached to {}", path);
            conn.indications = Some(upstream.subscribe_all_indications());
            conn.upstream = Some(upstream);
            Ok(vec![Message::response(&message, ProtocolError::None)])
        }
        Err(e) => {
            warn!("could not open {}: {}", path, e);
            Ok(vec![Message::response(&message, ProtocolError::Internal)])
        }
    }
}

async fn upstream_for_path(
    shared: &Arc<ProxyShared>,
    path: &str,
) -> Result<Arc<Multiplexer>, Error> {
    let mut upstreams = shared.upstreams.lock().await;
    if let Some(existing) = upstreams.get(path) {
        if !existing.is_closed() {
            return Ok(Arc::clone(existing));
        }
        upstreams.remove(path);
    }
    let mux = match qrtr::node_for_uri(path) {
        Some(node_id) => open_qrtr_endpoint(shared, node_id).await?,
        None => (shared.factory)(path, shared.config.trace).await?,
    };
    let mux = Arc::new(mux);
    upstreams.insert(path.to_string(), Arc::clone(&mux));
    Ok(mux)
}

async fn handle_ctl(
    conn: &mut ClientConn,
    upstream: &Arc<Multiplexer>,
    message: Message,
) -> Result<Vec<Message>, Error> {
    match message.message_id() {
        ctl_ids::MESSAGE_ALLOCATE_CID => {
            let service = match read_cid_tlv(&message) {
                Ok((service, _)) => service,
                Err(_) => {
                    return Ok(vec![Message::response(&message, ProtocolError::MalformedMessage)])
                }
            };
            // A second allocate for a service this connection already owns
            // is answered from the books; device ids are scarce.
            if let Some(existing) = conn.allocated.get(&service) {
                let mut reply = Message::response(&message, ProtocolError::None);
                reply.add_raw_tlv(ctl_ids::TLV_VALUE, &[service, *existing])?;
                return Ok(vec![reply]);
            }
            match allocate_upstream(conn, upstream, service).await {
                Ok(client_id) => {
                    let mut reply = Message::response(&message, ProtocolError::None);
                    reply.add_raw_tlv(ctl_ids::TLV_VALUE, &[service, client_id])?;
                    Ok(vec![reply])
                }
                Err(e) => Ok(vec![Message::response(&message, protocol_error_for(&e))]),
            }
        }
        ctl_ids::MESSAGE_RELEASE_CID => {
            let (service, client_id) = match read_cid_tlv(&message) {
                Ok(pair) => pair,
                Err(_) => {
                    return Ok(vec![Message::response(&message, ProtocolError::MalformedMessage)])
                }
            };
            conn.allocated.remove(&service);
            let result = upstream
                .send_request(ctl::release_cid_request(service, client_id)?, UPSTREAM_TIMEOUT)
                .await;
            match result {
                Ok(_) => {
                    let mut reply = Message::response(&message, ProtocolError::None);
                    reply.add_raw_tlv(ctl_ids::TLV_VALUE, &[service, client_id])?;
                    Ok(vec![reply])
                }
                Err(e) => Ok(vec![Message::response(&message, protocol_error_for(&e))]),
            }
        }
        _ => {
            // Any other control request is proxied as-is with the
            // transaction id mapped back onto the client's.
            let client_tx = message.transaction_id();
            match upstream.send_request(message.clone(), UPSTREAM_TIMEOUT).await {
                Ok(mut response) => {
                    response.set_transaction_id(client_tx);
                    Ok(vec![response])
                }
                Err(e) => Ok(vec![Message::response(&message, protocol_error_for(&e))]),
            }
        }
    }
}

async fn handle_service_request(
    conn: &mut ClientConn,
    upstream: &Arc<Multiplexer>,
    message: Message,
) -> Result<Vec<Message>, Error> {
    let service = message.service_id();
    let client_id = match conn.allocated.get(&service) {
        Some(client_id) => *client_id,
        // First touch of a service without an explicit allocate: do it on
        // the client's behalf and remember the id as theirs.
        None => match allocate_upstream(conn, upstream, service).await {
            Ok(client_id) => client_id,
            Err(e) => return Ok(vec![Message::response(&message, protocol_error_for(&e))]),
        },
    };

    let client_tx = message.transaction_id();
    let mut forwarded = message.clone();
    forwarded.set_client_id(client_id);
    match upstream.send_request(forwarded, UPSTREAM_TIMEOUT).await {
        Ok(mut response) => {
            response.set_transaction_id(client_tx);
            Ok(vec![response])
        }
        Err(e) => {
            debug!("upstream request failed: {}", e);
            Ok(vec![Message::response(&message, protocol_error_for(&e))])
        }
    }
}

async fn allocate_upstream(
    conn: &mut ClientConn,
    upstream: &Arc<Multiplexer>,
    service: u8,
) -> Result<u8, Error> {
    let response =
        upstream.send_request(ctl::allocate_cid_request(service)?, UPSTREAM_TIMEOUT).await?;
    let (issued_service, client_id) = ctl::parse_cid_response(&response)?;
    if issued_service != service {
        return Err(Error::Message(qmi_protocol::Error::InvalidData(
            "allocation answered for a different service",
        )));
    }
    debug!("allocated client id {}:{}", service, client_id);
    conn.allocated.insert(service, client_id);
    Ok(client_id)
}

/// Maps an upstream failure onto the device error faithfully: protocol
/// errors pass through, local failures become an internal error. No fake
/// successes.
fn protocol_error_for(error: &Error) -> ProtocolError {
    match error {
        Error::Protocol(code) => *code,
        Error::Message(_) => ProtocolError::MalformedMessage,
        _ => ProtocolError::Internal,
    }
}

fn read_cid_tlv(message: &Message) -> Result<(u8, u8), Error> {
    let (mut reader, len) = message.tlv_read_init(ctl_ids::TLV_VALUE)?;
    let service = reader.read_u8()?;
    let client_id = if len >= 2 { reader.read_u8()? } else { 0 };
    Ok((service, client_id))
}

async fn release_client_ids(conn: &mut ClientConn) {
    let Some(upstream) = conn.upstream.take() else { return };
    for (service, client_id) in conn.allocated.drain() {
        debug!("releasing client id {}:{} for departed client", service, client_id);
        let request = match ctl::release_cid_request(service, client_id) {
            Ok(request) => request,
            Err(e) => {
                warn!("could not build release for {}:{}: {}", service, client_id, e);
                continue;
            }
        };
        if let Err(e) = upstream.send_request(request, RELEASE_TIMEOUT).await {
            debug!("release of {}:{} failed: {}", service, client_id, e);
        }
    }
}
