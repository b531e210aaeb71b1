//! Channel Manager
//!
//! The multiplexer at the center of the transport core. It is the sole
//! owner of the server listening socket and of the channel / socket /
//! listener registries, and the only component that talks to the
//! transport.
//!
//! # Event loops
//!
//! Two dedicated loops, each a spawned task draining its own queues:
//!
//! - the **I/O loop** executes sends and socket bookkeeping. It drains a
//!   high-priority queue (messages, socket state updates) ahead of the
//!   low-priority queue (bytes, stream, file sends).
//! - the **callback loop** delivers listener callbacks, so slow
//!   application code never stalls socket processing.
//!
//! `init` blocks until both loops signal readiness. Tasks re-validate
//! their target ids at execution time: teardown is cooperative, and a
//! task enqueued against a channel that has since been deleted fails
//! gracefully instead of corrupting state.
//!
//! # Socket naming
//!
//! Client sockets open with the composite name
//! `<prefix><owner>_<type letter>_<channel name>`; the accepting side
//! parses the composite back to route the socket to its channel. This
//! string convention is the multiplexing key over a transport that only
//! understands socket names.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer::DataBuffer;
use crate::channel::{
    ChannelDataType, ChannelInfo, ChannelListener, ChannelPeerInfo, ChannelStatus,
    DataSenderReceiver, FileInfo,
};
use crate::config::CollabConfig;
use crate::errors::{CollabError, Result};
use crate::protocol::{StreamData, StreamDataExt};
use crate::transport::{
    PeerSocketInfo, QosProfiles, ShutdownReason, SocketEvents, SocketInfo, SocketTransport,
    TransDataType,
};

/// Fixed prefix of every socket name owned by this service.
pub const SOCKET_NAME_PREFIX: &str = "ohos.dtbcollab.dms";

const COLLAB_PKG_NAME: &str = "dms";
const SPLIT_FLAG: char = '_';
const MAX_CHANNEL_NAME_LENGTH: usize = 64;
/// Composite names embed the owner name first; the channel part starts
/// at the first separator at or after this offset.
const CHANNEL_NAME_PREFIX_LENGTH: usize = 64;
const CHANNEL_ID_GAP: i32 = 1000;
const MIN_VALID_CHANNEL_ID: i32 = CHANNEL_ID_GAP;
const MAX_VALID_CHANNEL_ID: i32 = CHANNEL_ID_GAP * 5;

fn trans_data_type(data_type: ChannelDataType) -> TransDataType {
    match data_type {
        ChannelDataType::Message => TransDataType::Message,
        ChannelDataType::Bytes => TransDataType::Bytes,
        ChannelDataType::VideoStream => TransDataType::VideoStream,
        ChannelDataType::File => TransDataType::File,
    }
}

/// Work executed on the I/O loop.
enum IoTask {
    SendMessage {
        channel_id: i32,
        data: Arc<DataBuffer>,
    },
    SendBytes {
        channel_id: i32,
        data: Arc<DataBuffer>,
    },
    SendStream {
        channel_id: i32,
        data: Arc<StreamData>,
    },
    SendFile {
        channel_id: i32,
        sources: Vec<String>,
        destinations: Vec<String>,
    },
    /// Attach an accepted socket to its channel and mark it connected.
    UpdateChannel {
        socket_id: i32,
        channel_id: i32,
    },
    /// Handle a socket shutdown reported by the transport.
    SocketClosed {
        socket_id: i32,
        reason: ShutdownReason,
    },
}

/// One listener callback, resolved and delivered on the callback loop.
struct CallbackTask {
    channel_id: i32,
    listener: Weak<dyn ChannelListener>,
    event: ChannelEvent,
}

#[derive(Clone)]
enum ChannelEvent {
    Connect,
    Disconnect,
    Message(Arc<DataBuffer>),
    Bytes(Arc<DataBuffer>),
    Stream(Arc<StreamData>),
    Error(CollabError),
    SendFile(FileInfo),
    RecvFile(FileInfo),
}

#[derive(Default)]
struct ChannelTable {
    ids_by_name: HashMap<String, Vec<i32>>,
    info_by_id: HashMap<i32, ChannelInfo>,
}

#[derive(Default)]
struct SocketTable {
    channel_by_socket: HashMap<i32, i32>,
    status_by_socket: HashMap<i32, ChannelStatus>,
}

struct RuntimeState {
    owner_name: String,
    server_socket_id: i32,
    io_high_tx: Option<mpsc::UnboundedSender<IoTask>>,
    io_low_tx: Option<mpsc::UnboundedSender<IoTask>>,
    callback_tx: Option<mpsc::UnboundedSender<CallbackTask>>,
    loops: Vec<JoinHandle<()>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            owner_name: String::new(),
            server_socket_id: -1,
            io_high_tx: None,
            io_low_tx: None,
            callback_tx: None,
            loops: Vec::new(),
        }
    }
}

struct ManagerInner {
    transport: Arc<dyn SocketTransport>,
    qos: QosProfiles,
    max_message_size: usize,

    /// Lifecycle state; a tokio mutex because init/deinit hold it across
    /// transport calls.
    runtime: tokio::sync::Mutex<RuntimeState>,
    /// Copies of the queue senders for lock-free enqueue on hot paths.
    queues: Mutex<QueueHandles>,

    channels: RwLock<ChannelTable>,
    sockets: RwLock<SocketTable>,
    listeners: RwLock<HashMap<i32, Vec<Weak<dyn ChannelListener>>>>,
    next_ids: Mutex<[i32; 4]>,
}

#[derive(Default, Clone)]
struct QueueHandles {
    io_high: Option<mpsc::UnboundedSender<IoTask>>,
    io_low: Option<mpsc::UnboundedSender<IoTask>>,
    callback: Option<mpsc::UnboundedSender<CallbackTask>>,
}

/// The channel multiplexer service.
///
/// Explicitly constructed (no process-wide singleton); `init`/`deinit`
/// bracket its lifecycle so tests can run independent instances.
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

/// Adapter handed to the transport; forwards socket events into the
/// manager without extending its lifetime.
struct TransportEvents {
    inner: Weak<ManagerInner>,
}

impl ChannelManager {
    /// Create a manager over `transport` with `config` tunables.
    #[must_use]
    pub fn new(transport: Arc<dyn SocketTransport>, config: &CollabConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(ManagerInner {
                transport,
                qos: QosProfiles::from_config(&config.qos),
                max_message_size: config.max_message_size,
                runtime: tokio::sync::Mutex::new(RuntimeState::default()),
                queues: Mutex::new(QueueHandles::default()),
                channels: RwLock::new(ChannelTable::default()),
                sockets: RwLock::new(SocketTable::default()),
                listeners: RwLock::new(HashMap::new()),
                next_ids: Mutex::new(Self::initial_ids()),
            }),
        })
    }

    fn initial_ids() -> [i32; 4] {
        [
            ChannelDataType::Message.band_start(),
            ChannelDataType::Bytes.band_start(),
            ChannelDataType::VideoStream.band_start(),
            ChannelDataType::File.band_start(),
        ]
    }

    /// Start the event loops and open the server listening socket.
    ///
    /// Idempotent: a second call against a running manager succeeds
    /// without side effects. Blocks until both loops are ready.
    pub async fn init(&self, owner_name: &str) -> Result<()> {
        tracing::info!(owner_name, "channel manager init");
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.callback_tx.is_none() {
            runtime.owner_name = owner_name.to_string();
            self.start_loops(&mut runtime).await;
        }

        if runtime.server_socket_id > 0 {
            tracing::warn!("server socket already initialized");
            return Ok(());
        }
        let server_name = format!("{SOCKET_NAME_PREFIX}{owner_name}");
        let info = SocketInfo {
            name: server_name.clone(),
            peer_name: String::new(),
            peer_network_id: String::new(),
            pkg_name: COLLAB_PKG_NAME.to_string(),
            data_type: TransDataType::Bytes,
        };
        let socket_id = self
            .inner
            .transport
            .create_socket(&info)
            .await
            .map_err(|e| CollabError::CreateSocketFailed(e.to_string()))?;
        if socket_id <= 0 {
            tracing::error!(socket_id, "server socket creation failed");
            return Err(CollabError::CreateSocketFailed(format!(
                "transport returned socket id {socket_id}"
            )));
        }

        let events: Arc<dyn SocketEvents> = Arc::new(TransportEvents {
            inner: Arc::downgrade(&self.inner),
        });
        self.inner
            .transport
            .listen(socket_id, self.inner.qos.low(), events)
            .await
            .map_err(|e| CollabError::ListenSocketFailed(e.to_string()))?;
        runtime.server_socket_id = socket_id;
        tracing::info!(socket_id, name = %server_name, "server socket listening");
        Ok(())
    }

    async fn start_loops(&self, runtime: &mut RuntimeState) {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        let (cb_tx, cb_rx) = mpsc::unbounded_channel();
        let (io_ready_tx, io_ready_rx) = oneshot::channel();
        let (cb_ready_tx, cb_ready_rx) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        runtime
            .loops
            .push(tokio::spawn(io_loop(inner, high_rx, low_rx, io_ready_tx)));
        runtime
            .loops
            .push(tokio::spawn(callback_loop(cb_rx, cb_ready_tx)));

        // Rendezvous: do not report ready before the loops are live.
        let _ = io_ready_rx.await;
        let _ = cb_ready_rx.await;

        runtime.io_high_tx = Some(high_tx.clone());
        runtime.io_low_tx = Some(low_tx.clone());
        runtime.callback_tx = Some(cb_tx.clone());
        *self.inner.queues.lock() = QueueHandles {
            io_high: Some(high_tx),
            io_low: Some(low_tx),
            callback: Some(cb_tx),
        };
    }

    /// Stop the loops, delete every channel, and shut the server socket.
    ///
    /// Idempotent; the manager can be `init`ed again afterwards.
    pub async fn deinit(&self) {
        tracing::info!("channel manager deinit");
        let (server_socket, loops) = {
            let mut runtime = self.inner.runtime.lock().await;
            runtime.io_high_tx = None;
            runtime.io_low_tx = None;
            runtime.callback_tx = None;
            *self.inner.queues.lock() = QueueHandles::default();
            let server_socket = runtime.server_socket_id;
            runtime.server_socket_id = -1;
            runtime.owner_name.clear();
            (server_socket, std::mem::take(&mut runtime.loops))
        };
        for handle in loops {
            let _ = handle.await;
        }

        let channel_ids: HashSet<i32> = self
            .inner
            .channels
            .read()
            .info_by_id
            .keys()
            .copied()
            .collect();
        for channel_id in channel_ids {
            let _ = self.delete_channel(channel_id).await;
        }
        if server_socket > 0 {
            self.inner.transport.shutdown(server_socket).await;
        }
        *self.inner.next_ids.lock() = Self::initial_ids();
        self.inner.channels.write().ids_by_name.clear();
        self.inner.sockets.write().channel_by_socket.clear();
        self.inner.sockets.write().status_by_socket.clear();
        self.inner.listeners.write().clear();
    }

    // ============================================
    // Channel lifecycle
    // ============================================

    /// Register a channel that waits for the peer to bind in.
    pub async fn create_server_channel(
        &self,
        channel_name: &str,
        data_type: ChannelDataType,
        peer_info: ChannelPeerInfo,
    ) -> Result<i32> {
        tracing::info!(channel_name, ?data_type, "create server channel");
        let info = self
            .create_base_channel(channel_name, data_type, peer_info)
            .map_err(|e| CollabError::CreateServerChannelFailed(Box::new(e)))?;
        let channel_id = info.channel_id;
        self.install_channel(info);
        Ok(channel_id)
    }

    /// Register a channel and open its outbound socket immediately.
    pub async fn create_client_channel(
        &self,
        channel_name: &str,
        data_type: ChannelDataType,
        peer_info: ChannelPeerInfo,
    ) -> Result<i32> {
        tracing::info!(channel_name, ?data_type, "create client channel");
        let wrap = |e: CollabError| CollabError::CreateClientChannelFailed(Box::new(e));

        let mut info = self
            .create_base_channel(channel_name, data_type, peer_info)
            .map_err(wrap)?;
        let socket_id = self
            .create_client_socket(&info)
            .await
            .map_err(wrap)?;
        info.client_sockets.push(socket_id);
        info.sender_receivers.insert(
            socket_id,
            Arc::new(DataSenderReceiver::new(
                socket_id,
                Arc::clone(&self.inner.transport),
                self.inner.max_message_size,
            )),
        );
        let channel_id = info.channel_id;
        {
            let mut sockets = self.inner.sockets.write();
            sockets.channel_by_socket.insert(socket_id, channel_id);
            sockets
                .status_by_socket
                .insert(socket_id, ChannelStatus::Unconnected);
        }
        self.install_channel(info);
        Ok(channel_id)
    }

    fn create_base_channel(
        &self,
        channel_name: &str,
        data_type: ChannelDataType,
        peer_info: ChannelPeerInfo,
    ) -> Result<ChannelInfo> {
        if channel_name.is_empty() || channel_name.len() > MAX_CHANNEL_NAME_LENGTH {
            return Err(CollabError::InvalidChannelName(channel_name.to_string()));
        }
        let channel_id = self.generate_next_id(data_type)?;
        Ok(ChannelInfo {
            channel_id,
            status: ChannelStatus::Unconnected,
            data_type,
            channel_name: channel_name.to_string(),
            peer_info,
            client_sockets: Vec::new(),
            sender_receivers: HashMap::new(),
        })
    }

    fn install_channel(&self, info: ChannelInfo) {
        let mut channels = self.inner.channels.write();
        channels
            .ids_by_name
            .entry(info.channel_name.clone())
            .or_default()
            .push(info.channel_id);
        channels.info_by_id.insert(info.channel_id, info);
    }

    fn generate_next_id(&self, data_type: ChannelDataType) -> Result<i32> {
        let mut next_ids = self.inner.next_ids.lock();
        let slot = &mut next_ids[data_type as usize];
        let channel_id = *slot;
        if channel_id - data_type.band_start() >= CHANNEL_ID_GAP {
            tracing::error!(?data_type, "channel id band exhausted");
            return Err(CollabError::ChannelNumExceedLimit);
        }
        *slot += 1;
        Ok(channel_id)
    }

    async fn create_client_socket(&self, info: &ChannelInfo) -> Result<i32> {
        let owner_name = self.inner.runtime.lock().await.owner_name.clone();
        let name = format!(
            "{SOCKET_NAME_PREFIX}{owner_name}{SPLIT_FLAG}{}{SPLIT_FLAG}{}",
            info.data_type.prefix_letter(),
            info.channel_name
        );
        let peer_socket_name = format!("{SOCKET_NAME_PREFIX}{}", info.peer_info.peer_name);
        tracing::debug!(name = %name, peer = %peer_socket_name, "open client socket");
        let socket_info = SocketInfo {
            name,
            peer_name: peer_socket_name,
            peer_network_id: info.peer_info.network_id.clone(),
            pkg_name: COLLAB_PKG_NAME.to_string(),
            data_type: trans_data_type(info.data_type),
        };
        let socket_id = self
            .inner
            .transport
            .create_socket(&socket_info)
            .await
            .map_err(|e| CollabError::CreateSocketFailed(e.to_string()))?;
        if socket_id <= 0 {
            return Err(CollabError::CreateSocketFailed(format!(
                "transport returned socket id {socket_id}"
            )));
        }
        Ok(socket_id)
    }

    fn is_valid_channel_id(channel_id: i32) -> bool {
        channel_id > MIN_VALID_CHANNEL_ID && channel_id <= MAX_VALID_CHANNEL_ID
    }

    /// Tear a channel down: listeners, registry entries, every socket.
    ///
    /// Best-effort: missing state is tolerated. Only an out-of-band id
    /// fails.
    pub async fn delete_channel(&self, channel_id: i32) -> Result<()> {
        if !Self::is_valid_channel_id(channel_id) {
            return Err(CollabError::InvalidChannelId(channel_id));
        }
        tracing::info!(channel_id, "delete channel");
        self.inner.delete_channel_inner(channel_id).await;
        Ok(())
    }

    /// Register a listener for a channel's events.
    ///
    /// Stores a non-owning handle; registration is idempotent and prunes
    /// expired handles opportunistically.
    pub fn register_channel_listener(
        &self,
        channel_id: i32,
        listener: &Arc<dyn ChannelListener>,
    ) -> Result<()> {
        if !Self::is_valid_channel_id(channel_id) {
            return Err(CollabError::InvalidChannelId(channel_id));
        }
        let mut listeners = self.inner.listeners.write();
        let entries = listeners.entry(channel_id).or_default();
        entries.retain(|weak| weak.strong_count() > 0);
        let already = entries
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|live| Arc::ptr_eq(&live, listener)));
        if already {
            tracing::debug!(channel_id, "listener already registered");
            return Ok(());
        }
        entries.push(Arc::downgrade(listener));
        Ok(())
    }

    /// Bind every unconnected client socket of the channel concurrently.
    ///
    /// Succeeds as soon as any one bind succeeds; fails with
    /// [`CollabError::ConnectChannelFailed`] only when all binds fail.
    /// A fully-connected channel is a cheap success no-op.
    pub async fn connect_channel(&self, channel_id: i32) -> Result<()> {
        let (socket_ids, data_type) = {
            let channels = self.inner.channels.read();
            let info = channels
                .info_by_id
                .get(&channel_id)
                .filter(|info| !info.client_sockets.is_empty())
                .ok_or(CollabError::InvalidChannelId(channel_id))?;
            (info.client_sockets.clone(), info.data_type)
        };
        let to_bind: Vec<i32> = socket_ids
            .into_iter()
            .filter(|socket| self.socket_status(*socket) == ChannelStatus::Unconnected)
            .collect();
        if to_bind.is_empty() {
            return Ok(());
        }
        tracing::info!(channel_id, sockets = to_bind.len(), "connecting channel");

        let events: Arc<dyn SocketEvents> = Arc::new(TransportEvents {
            inner: Arc::downgrade(&self.inner),
        });
        let qos = self.inner.qos.for_data_type(data_type).to_vec();
        let binds = to_bind.iter().map(|socket_id| {
            let events = Arc::clone(&events);
            let qos = qos.clone();
            let transport = Arc::clone(&self.inner.transport);
            let socket_id = *socket_id;
            async move {
                let result = transport.bind(socket_id, &qos, events).await;
                (socket_id, result)
            }
        });
        let results = futures::future::join_all(binds).await;

        let mut any_ok = false;
        for (socket_id, result) in results {
            match result {
                Ok(()) => {
                    any_ok = true;
                    let _ = self.set_socket_status(socket_id, ChannelStatus::Connected);
                }
                Err(e) => {
                    tracing::warn!(socket_id, error = %e, "bind failed");
                }
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(CollabError::ConnectChannelFailed(channel_id))
        }
    }

    // ============================================
    // Sends (validate synchronously, run on the I/O loop)
    // ============================================

    /// Queue a message send. Messages outrank bytes/stream sends.
    pub fn send_message(&self, channel_id: i32, data: Arc<DataBuffer>) -> Result<()> {
        self.validate_send(channel_id, &data)?;
        self.post_high(IoTask::SendMessage { channel_id, data })
    }

    /// Queue a bytes send.
    pub fn send_bytes(&self, channel_id: i32, data: Arc<DataBuffer>) -> Result<()> {
        self.validate_send(channel_id, &data)?;
        self.post_low(IoTask::SendBytes { channel_id, data })
    }

    /// Queue a stream frame send.
    pub fn send_stream(&self, channel_id: i32, data: Arc<StreamData>) -> Result<()> {
        if !Self::is_valid_channel_id(channel_id) {
            return Err(CollabError::InvalidChannelId(channel_id));
        }
        if data.stream_data().data().is_none() {
            return Err(CollabError::NullPointer);
        }
        self.post_low(IoTask::SendStream { channel_id, data })
    }

    /// Queue a file transfer.
    pub fn send_file(
        &self,
        channel_id: i32,
        sources: Vec<String>,
        destinations: Vec<String>,
    ) -> Result<()> {
        if !Self::is_valid_channel_id(channel_id) {
            return Err(CollabError::InvalidChannelId(channel_id));
        }
        if sources.is_empty() || sources.len() != destinations.len() {
            return Err(CollabError::InvalidParameters(
                "file lists empty or mismatched".into(),
            ));
        }
        self.post_low(IoTask::SendFile {
            channel_id,
            sources,
            destinations,
        })
    }

    fn validate_send(&self, channel_id: i32, data: &DataBuffer) -> Result<()> {
        if !Self::is_valid_channel_id(channel_id) {
            tracing::error!(channel_id, "send on invalid channel id");
            return Err(CollabError::InvalidChannelId(channel_id));
        }
        if data.data().is_none() {
            return Err(CollabError::NullPointer);
        }
        Ok(())
    }

    fn post_high(&self, task: IoTask) -> Result<()> {
        let queues = self.inner.queues.lock();
        queues
            .io_high
            .as_ref()
            .ok_or(CollabError::EventLoopNotRunning)?
            .send(task)
            .map_err(|_| CollabError::PostTaskFailed)
    }

    fn post_low(&self, task: IoTask) -> Result<()> {
        let queues = self.inner.queues.lock();
        queues
            .io_low
            .as_ref()
            .ok_or(CollabError::EventLoopNotRunning)?
            .send(task)
            .map_err(|_| CollabError::PostTaskFailed)
    }

    /// Ask the channel's listeners where inbound files should land.
    #[must_use]
    pub fn get_recv_path(&self, channel_id: i32) -> Option<PathBuf> {
        self.inner.recv_path_for_channel(channel_id)
    }

    fn socket_status(&self, socket_id: i32) -> ChannelStatus {
        self.inner.socket_status(socket_id)
    }

    fn set_socket_status(&self, socket_id: i32, status: ChannelStatus) -> Result<i32> {
        self.inner.set_socket_status(socket_id, status)
    }
}

// ============================================
// Event loops
// ============================================

async fn io_loop(
    inner: Arc<ManagerInner>,
    mut high_rx: mpsc::UnboundedReceiver<IoTask>,
    mut low_rx: mpsc::UnboundedReceiver<IoTask>,
    ready: oneshot::Sender<()>,
) {
    tracing::debug!("i/o loop started");
    let _ = ready.send(());
    loop {
        let task = tokio::select! {
            biased;
            task = high_rx.recv() => task,
            task = low_rx.recv() => task,
        };
        let Some(task) = task else { break };
        inner.run_io_task(task).await;
    }
    tracing::debug!("i/o loop stopped");
}

async fn callback_loop(
    mut rx: mpsc::UnboundedReceiver<CallbackTask>,
    ready: oneshot::Sender<()>,
) {
    tracing::debug!("callback loop started");
    let _ = ready.send(());
    while let Some(task) = rx.recv().await {
        // Liveness is re-checked at delivery time, not enqueue time.
        let Some(listener) = task.listener.upgrade() else {
            continue;
        };
        match task.event {
            ChannelEvent::Connect => listener.on_connect(task.channel_id),
            ChannelEvent::Disconnect => listener.on_dis_connect(task.channel_id),
            ChannelEvent::Message(data) => listener.on_message(task.channel_id, &data),
            ChannelEvent::Bytes(data) => listener.on_bytes(task.channel_id, &data),
            ChannelEvent::Stream(data) => listener.on_stream(task.channel_id, &data),
            ChannelEvent::Error(error) => listener.on_error(task.channel_id, &error),
            ChannelEvent::SendFile(info) => listener.on_send_file(task.channel_id, &info),
            ChannelEvent::RecvFile(info) => listener.on_recv_file(task.channel_id, &info),
        }
    }
    tracing::debug!("callback loop stopped");
}

impl ManagerInner {
    async fn run_io_task(self: &Arc<Self>, task: IoTask) {
        match task {
            IoTask::SendMessage { channel_id, data } => {
                self.do_send(channel_id, SendOp::Message(data)).await;
            }
            IoTask::SendBytes { channel_id, data } => {
                self.do_send(channel_id, SendOp::Bytes(data)).await;
            }
            IoTask::SendStream { channel_id, data } => {
                self.do_send(channel_id, SendOp::Stream(data)).await;
            }
            IoTask::SendFile {
                channel_id,
                sources,
                destinations,
            } => {
                self.do_send(channel_id, SendOp::File(sources, destinations))
                    .await;
            }
            IoTask::UpdateChannel {
                socket_id,
                channel_id,
            } => {
                self.update_channel(socket_id, channel_id);
            }
            IoTask::SocketClosed { socket_id, reason } => {
                self.handle_socket_closed(socket_id, reason).await;
            }
        }
    }

    /// Resolve the channel's sender/receiver and run one send operation,
    /// reporting failures through the error callback.
    async fn do_send(self: &Arc<Self>, channel_id: i32, op: SendOp) {
        let Some(socket_id) = self.get_valid_socket(channel_id) else {
            tracing::error!(channel_id, "no connected socket for send");
            self.do_error_callback(channel_id, CollabError::NoConnectedSocket(channel_id));
            return;
        };
        let sender_receiver = {
            let channels = self.channels.read();
            let Some(info) = channels.info_by_id.get(&channel_id) else {
                self.do_error_callback(channel_id, CollabError::InvalidChannelId(channel_id));
                return;
            };
            let Some(sr) = info.sender_receivers.get(&socket_id) else {
                self.do_error_callback(channel_id, CollabError::InvalidSocketId(socket_id));
                return;
            };
            (Arc::clone(sr), info.data_type)
        };
        let (sr, data_type) = sender_receiver;
        let result = match op {
            SendOp::Message(data) => sr.send_message_data(&data).await,
            SendOp::Bytes(data) => sr.send_bytes_data(&data, data_type as i32).await,
            SendOp::Stream(data) => sr.send_stream_data(&data).await,
            SendOp::File(sources, destinations) => {
                sr.send_file_data(&sources, &destinations).await
            }
        };
        if let Err(e) = result {
            tracing::error!(channel_id, error = %e, "send failed");
            self.do_error_callback(channel_id, e);
        }
    }

    fn get_valid_socket(&self, channel_id: i32) -> Option<i32> {
        let socket_ids = {
            let channels = self.channels.read();
            let info = channels.info_by_id.get(&channel_id)?;
            if info.status == ChannelStatus::Unconnected {
                return None;
            }
            info.client_sockets.clone()
        };
        socket_ids
            .into_iter()
            .find(|socket| self.socket_status(*socket) == ChannelStatus::Connected)
    }

    /// Attach an accepted server-side socket to its channel.
    fn update_channel(self: &Arc<Self>, socket_id: i32, channel_id: i32) {
        if let Err(e) = self.register_socket(socket_id, channel_id) {
            tracing::error!(socket_id, channel_id, error = %e, "socket registration failed");
            self.do_error_callback(channel_id, e);
            return;
        }
        if let Err(e) = self.set_socket_status(socket_id, ChannelStatus::Connected) {
            tracing::error!(socket_id, channel_id, error = %e, "status update failed");
            self.do_error_callback(channel_id, e);
            return;
        }
        self.do_connect_callback(channel_id);
    }

    fn register_socket(&self, socket_id: i32, channel_id: i32) -> Result<()> {
        {
            let mut channels = self.channels.write();
            let info = channels
                .info_by_id
                .get_mut(&channel_id)
                .ok_or(CollabError::InvalidChannelId(channel_id))?;
            info.client_sockets.push(socket_id);
            info.sender_receivers.insert(
                socket_id,
                Arc::new(DataSenderReceiver::new(
                    socket_id,
                    Arc::clone(&self.transport),
                    self.max_message_size,
                )),
            );
        }
        let mut sockets = self.sockets.write();
        sockets.channel_by_socket.insert(socket_id, channel_id);
        sockets
            .status_by_socket
            .insert(socket_id, ChannelStatus::Connected);
        Ok(())
    }

    async fn handle_socket_closed(self: &Arc<Self>, socket_id: i32, reason: ShutdownReason) {
        let Some(channel_id) = self.channel_for_socket(socket_id) else {
            return;
        };
        tracing::info!(socket_id, channel_id, ?reason, "socket closed");
        if let Err(e) = self.set_socket_status(socket_id, ChannelStatus::Unconnected) {
            self.do_error_callback(channel_id, e);
            return;
        }
        // Tear the channel down once its last socket is gone.
        if self.channel_status(channel_id) == ChannelStatus::Unconnected {
            self.notify_listeners(channel_id, ChannelEvent::Disconnect);
            self.delete_channel_inner(channel_id).await;
        }
    }

    /// Registry part of channel deletion, shared with the public call.
    async fn delete_channel_inner(&self, channel_id: i32) {
        self.listeners.write().remove(&channel_id);
        {
            let mut channels = self.channels.write();
            if let Some(info) = channels.info_by_id.remove(&channel_id) {
                if let Some(ids) = channels.ids_by_name.get_mut(&info.channel_name) {
                    ids.retain(|id| *id != channel_id);
                    if ids.is_empty() {
                        channels.ids_by_name.remove(&info.channel_name);
                    }
                }
            }
        }
        let socket_ids: Vec<i32> = {
            let mut sockets = self.sockets.write();
            let ids: Vec<i32> = sockets
                .channel_by_socket
                .iter()
                .filter(|(_, ch)| **ch == channel_id)
                .map(|(socket, _)| *socket)
                .collect();
            for socket_id in &ids {
                sockets.channel_by_socket.remove(socket_id);
                sockets.status_by_socket.remove(socket_id);
            }
            ids
        };
        for socket_id in socket_ids {
            self.transport.shutdown(socket_id).await;
        }
    }

    // ============================================
    // Status bookkeeping
    // ============================================

    fn socket_status(&self, socket_id: i32) -> ChannelStatus {
        self.sockets
            .read()
            .status_by_socket
            .get(&socket_id)
            .copied()
            .unwrap_or(ChannelStatus::Connected)
    }

    fn channel_for_socket(&self, socket_id: i32) -> Option<i32> {
        self.sockets
            .read()
            .channel_by_socket
            .get(&socket_id)
            .copied()
    }

    fn channel_status(&self, channel_id: i32) -> ChannelStatus {
        self.channels
            .read()
            .info_by_id
            .get(&channel_id)
            .map_or(ChannelStatus::Unconnected, |info| info.status)
    }

    fn set_socket_status(&self, socket_id: i32, status: ChannelStatus) -> Result<i32> {
        let channel_id = {
            let mut sockets = self.sockets.write();
            let entry = sockets
                .status_by_socket
                .get_mut(&socket_id)
                .ok_or(CollabError::InvalidSocketId(socket_id))?;
            *entry = status;
            *sockets
                .channel_by_socket
                .get(&socket_id)
                .ok_or(CollabError::InvalidSocketId(socket_id))?
        };
        self.update_channel_status(channel_id)?;
        Ok(channel_id)
    }

    /// Recompute a channel's status from its sockets (any-connected).
    fn update_channel_status(&self, channel_id: i32) -> Result<()> {
        let (socket_ids, current) = {
            let channels = self.channels.read();
            let info = channels
                .info_by_id
                .get(&channel_id)
                .ok_or(CollabError::InvalidChannelId(channel_id))?;
            (info.client_sockets.clone(), info.status)
        };
        let new_status = if socket_ids
            .iter()
            .any(|socket| self.socket_status(*socket) == ChannelStatus::Connected)
        {
            ChannelStatus::Connected
        } else {
            ChannelStatus::Unconnected
        };
        if new_status != current {
            let mut channels = self.channels.write();
            let info = channels
                .info_by_id
                .get_mut(&channel_id)
                .ok_or(CollabError::InvalidChannelId(channel_id))?;
            info.status = new_status;
        }
        Ok(())
    }

    // ============================================
    // Inbound socket events
    // ============================================

    fn on_socket_connected(self: &Arc<Self>, socket_id: i32, peer: &PeerSocketInfo) {
        if socket_id <= 0 {
            return;
        }
        tracing::info!(socket_id, peer_name = %peer.name, "socket bound");
        let Some(channel_part) = channel_part_of_socket_name(&peer.name) else {
            tracing::error!(name = %peer.name, "unparseable peer socket name");
            return;
        };
        let Some(data_type) = ChannelDataType::from_prefix_letter(&channel_part[..1]) else {
            tracing::error!(name = %channel_part, "unknown channel type letter");
            return;
        };
        let channel_name = &channel_part[2..];
        let Some(channel_id) = self.channel_id_by_name(channel_name, data_type) else {
            tracing::error!(channel_name, "no channel registered for inbound socket");
            return;
        };
        let _ = self.post_high(IoTask::UpdateChannel {
            socket_id,
            channel_id,
        });
    }

    fn channel_id_by_name(&self, channel_name: &str, data_type: ChannelDataType) -> Option<i32> {
        let channels = self.channels.read();
        let ids = channels.ids_by_name.get(channel_name)?;
        ids.iter()
            .find(|id| {
                channels
                    .info_by_id
                    .get(id)
                    .is_some_and(|info| info.data_type == data_type)
            })
            .copied()
    }

    fn on_socket_closed(&self, socket_id: i32, reason: ShutdownReason) {
        if socket_id <= 0 {
            return;
        }
        let _ = self.post_high(IoTask::SocketClosed { socket_id, reason });
    }

    fn on_bytes_received(self: &Arc<Self>, socket_id: i32, data: &[u8]) {
        let Some(channel_id) = self.channel_for_socket(socket_id) else {
            return;
        };
        if data.is_empty() {
            self.do_error_callback(channel_id, CollabError::RecvDataEmpty);
            return;
        }
        let sender_receiver = {
            let channels = self.channels.read();
            channels
                .info_by_id
                .get(&channel_id)
                .and_then(|info| info.sender_receivers.get(&socket_id))
                .cloned()
        };
        let Some(sr) = sender_receiver else {
            self.do_error_callback(channel_id, CollabError::InvalidSocketId(socket_id));
            return;
        };
        if let Err(e) = sr.pack_recv_packet_data(data) {
            tracing::error!(socket_id, error = %e, "packet reassembly failed");
            self.do_error_callback(channel_id, e);
            return;
        }
        if let Some(frame) = sr.packeted_data() {
            self.notify_listeners(channel_id, ChannelEvent::Bytes(frame));
        }
    }

    fn on_message_received(self: &Arc<Self>, socket_id: i32, data: &[u8]) {
        let Some(channel_id) = self.channel_for_socket(socket_id) else {
            return;
        };
        if data.is_empty() {
            self.do_error_callback(channel_id, CollabError::RecvDataEmpty);
            return;
        }
        let buffer = DataBuffer::from_slice(data);
        if buffer.data().is_none() {
            self.do_error_callback(channel_id, CollabError::CopyDataToBufferFailed);
            return;
        }
        self.notify_listeners(channel_id, ChannelEvent::Message(Arc::new(buffer)));
    }

    fn on_stream_received(self: &Arc<Self>, socket_id: i32, frame: &[u8], ext_json: &str) {
        let Some(channel_id) = self.channel_for_socket(socket_id) else {
            return;
        };
        if frame.is_empty() {
            self.do_error_callback(channel_id, CollabError::RecvDataEmpty);
            return;
        }
        let buffer = DataBuffer::from_slice(frame);
        if buffer.data().is_none() {
            self.do_error_callback(channel_id, CollabError::CopyDataToBufferFailed);
            return;
        }
        let ext = match StreamDataExt::from_json(ext_json) {
            Ok(ext) => ext,
            Err(e) => {
                tracing::error!(socket_id, error = %e, "stream extension parse failed");
                self.do_error_callback(channel_id, e);
                return;
            }
        };
        let stream = StreamData::new(Arc::new(buffer), ext);
        self.notify_listeners(channel_id, ChannelEvent::Stream(Arc::new(stream)));
    }

    fn on_socket_error(self: &Arc<Self>, socket_id: i32, code: i32) {
        if socket_id <= 0 {
            return;
        }
        let Some(channel_id) = self.channel_for_socket(socket_id) else {
            return;
        };
        self.do_error_callback(channel_id, CollabError::Transport(code));
    }

    fn on_file_event(self: &Arc<Self>, socket_id: i32, info: &FileInfo) {
        let Some(channel_id) = self.channel_for_socket(socket_id) else {
            return;
        };
        let event = if info.common_info.event_type.is_recv() {
            ChannelEvent::RecvFile(info.clone())
        } else {
            ChannelEvent::SendFile(info.clone())
        };
        self.notify_listeners(channel_id, event);
    }

    fn recv_path_for_channel(&self, channel_id: i32) -> Option<PathBuf> {
        let listeners = self.listeners.read();
        listeners
            .get(&channel_id)?
            .iter()
            .filter_map(Weak::upgrade)
            .find_map(|listener| listener.recv_path(channel_id))
    }

    // ============================================
    // Listener fan-out
    // ============================================

    fn notify_listeners(&self, channel_id: i32, event: ChannelEvent) {
        let targets: Vec<Weak<dyn ChannelListener>> = {
            let listeners = self.listeners.read();
            match listeners.get(&channel_id) {
                Some(entries) if !entries.is_empty() => entries.clone(),
                _ => {
                    tracing::debug!(channel_id, "no listeners registered");
                    return;
                }
            }
        };
        let queues = self.queues.lock();
        let Some(tx) = queues.callback.as_ref() else {
            return;
        };
        for listener in targets {
            if listener.strong_count() == 0 {
                continue;
            }
            let _ = tx.send(CallbackTask {
                channel_id,
                listener,
                event: event.clone(),
            });
        }
    }

    fn do_error_callback(&self, channel_id: i32, error: CollabError) {
        self.notify_listeners(channel_id, ChannelEvent::Error(error));
    }

    fn do_connect_callback(&self, channel_id: i32) {
        self.notify_listeners(channel_id, ChannelEvent::Connect);
    }

    fn post_high(&self, task: IoTask) -> Result<()> {
        let queues = self.queues.lock();
        queues
            .io_high
            .as_ref()
            .ok_or(CollabError::EventLoopNotRunning)?
            .send(task)
            .map_err(|_| CollabError::PostTaskFailed)
    }
}

enum SendOp {
    Message(Arc<DataBuffer>),
    Bytes(Arc<DataBuffer>),
    Stream(Arc<StreamData>),
    File(Vec<String>, Vec<String>),
}

/// Extract `<letter>_<channel name>` from a composite client socket
/// name: everything after the first separator at or beyond the owner
/// prefix region.
fn channel_part_of_socket_name(socket_name: &str) -> Option<&str> {
    let search_from = CHANNEL_NAME_PREFIX_LENGTH.min(socket_name.len());
    let split = socket_name[search_from..]
        .find(SPLIT_FLAG)
        .map(|pos| pos + search_from)?;
    let part = &socket_name[split + 1..];
    if part.len() < 3 {
        return None;
    }
    Some(part)
}

impl SocketEvents for TransportEvents {
    fn on_bind(&self, socket_id: i32, peer: PeerSocketInfo) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_socket_connected(socket_id, &peer);
        }
    }

    fn on_shutdown(&self, socket_id: i32, reason: ShutdownReason) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_socket_closed(socket_id, reason);
        }
    }

    fn on_bytes(&self, socket_id: i32, data: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_bytes_received(socket_id, data);
        }
    }

    fn on_message(&self, socket_id: i32, data: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_message_received(socket_id, data);
        }
    }

    fn on_stream(&self, socket_id: i32, frame: &[u8], ext_json: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_stream_received(socket_id, frame, ext_json);
        }
    }

    fn on_error(&self, socket_id: i32, code: i32) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_socket_error(socket_id, code);
        }
    }

    fn on_file_event(&self, socket_id: i32, info: &FileInfo) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_file_event(socket_id, info);
        }
    }

    fn recv_path(&self, socket_id: i32) -> Option<PathBuf> {
        let inner = self.inner.upgrade()?;
        let channel_id = inner.channel_for_socket(socket_id)?;
        inner.recv_path_for_channel(channel_id)
    }
}
