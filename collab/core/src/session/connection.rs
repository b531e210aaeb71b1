//! Connection Session State Machine
//!
//! One [`ConnectionSession`] drives one collaboration: it negotiates
//! which logical channels are needed from the connect options, creates
//! and connects them through the channel manager, and demultiplexes
//! inbound channel events back into session-level semantics (connect /
//! disconnect / message / data / stream / file events).
//!
//! # State machine
//!
//! `Unconnected -> Connecting -> Connected`, with release returning to
//! `Unconnected` after tearing every owned channel down. The source
//! role enters `Connecting` in `connect`, the sink in `accept_connect`.
//! `Connected` is reached through channel-connect fan-in: the session
//! counts its required channels (the lazily-connected stream channel is
//! excluded) and transitions exactly once when the last one binds.
//!
//! When file transfer is negotiated, the source defers the connected
//! notification behind a control-message handshake on the message
//! channel (`ConnectFileChannel` / `FileChannelConnectSuccess`).
//!
//! # Event loop
//!
//! Each session runs its own queue-draining task used to serialize
//! timeout handling and application callback delivery; creation blocks
//! until the task signals readiness.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer::DataBuffer;
use crate::channel::{ChannelDataType, ChannelListener, ChannelManager, ChannelPeerInfo, FileInfo};
use crate::errors::{CollabError, Result};
use crate::protocol::{
    decode_stream_frame, encode_stream_frame, MessageDataHeader, StreamData,
};
use crate::session::{
    CollabDirection, ConnectCallback, ConnectOption, ConnectResult, DisconnectReason,
    EventCallbackInfo, MessageType, PeerInfo, SchedulerClient, SessionEvent,
    SessionEventCallback, SessionKey, SessionStatus, StreamParams, StreamRole,
    TransChannelInfo, TransChannelType,
};

const CHANNEL_NAME_LENGTH: usize = 48;

struct EventLoopHandle {
    tx: Option<mpsc::UnboundedSender<BoxFuture<'static, ()>>>,
    task: Option<JoinHandle<()>>,
}

/// Per-collaboration session state machine.
pub struct ConnectionSession {
    session_id: i32,
    local_socket_name: String,
    key: SessionKey,
    connect_option: ConnectOption,
    channel_manager: Arc<ChannelManager>,
    scheduler: Arc<dyn SchedulerClient>,
    connect_timeout: Duration,
    rpc_timeout: Duration,

    status: RwLock<SessionStatus>,
    direction: RwLock<CollabDirection>,
    token: Mutex<String>,
    peer_socket_name: Mutex<String>,
    peer_version: AtomicI32,
    /// Source side: connected notification is held back until the peer
    /// acknowledges the file channels.
    awaiting_file_ack: AtomicBool,

    trans_channels: RwLock<HashMap<TransChannelType, TransChannelInfo>>,
    listeners: RwLock<HashMap<SessionEvent, SessionEventCallback>>,
    connect_callback: Mutex<Option<ConnectCallback>>,
    /// Keeps the (weakly registered) channel listener alive.
    channel_listener: Mutex<Option<Arc<dyn ChannelListener>>>,
    stream_role: Mutex<Option<StreamRole>>,
    recv_dir: Mutex<Option<PathBuf>>,

    event_loop: Mutex<EventLoopHandle>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSession {
    /// Build a session; call [`Self::init`] before use.
    #[must_use]
    pub fn new(
        session_id: i32,
        local_socket_name: String,
        key: SessionKey,
        connect_option: ConnectOption,
        channel_manager: Arc<ChannelManager>,
        scheduler: Arc<dyn SchedulerClient>,
        connect_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            local_socket_name,
            key,
            connect_option,
            channel_manager,
            scheduler,
            connect_timeout,
            rpc_timeout,
            status: RwLock::new(SessionStatus::Unconnected),
            direction: RwLock::new(CollabDirection::Unknown),
            token: Mutex::new(String::new()),
            peer_socket_name: Mutex::new(String::new()),
            peer_version: AtomicI32::new(0),
            awaiting_file_ack: AtomicBool::new(false),
            trans_channels: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            connect_callback: Mutex::new(None),
            channel_listener: Mutex::new(None),
            stream_role: Mutex::new(None),
            recv_dir: Mutex::new(None),
            event_loop: Mutex::new(EventLoopHandle {
                tx: None,
                task: None,
            }),
            timeout_task: Mutex::new(None),
        })
    }

    /// Start the session's event loop; blocks until it is ready.
    pub async fn init(&self) {
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut event_loop = self.event_loop.lock();
            if event_loop.tx.is_some() {
                tracing::debug!(session_id = self.session_id, "session already initialized");
                return;
            }
            let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
            let session_id = self.session_id;
            event_loop.task = Some(tokio::spawn(async move {
                tracing::debug!(session_id, "session loop started");
                let _ = ready_tx.send(());
                while let Some(task) = rx.recv().await {
                    task.await;
                }
                tracing::debug!(session_id, "session loop stopped");
            }));
            event_loop.tx = Some(tx);
        }
        let _ = ready_rx.await;
    }

    /// Stop the event loop. Safe to call repeatedly.
    pub async fn uninit(&self) {
        self.remove_timeout();
        let task = {
            let mut event_loop = self.event_loop.lock();
            event_loop.tx = None;
            event_loop.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn post(&self, task: BoxFuture<'static, ()>) {
        let event_loop = self.event_loop.lock();
        if let Some(tx) = event_loop.tx.as_ref() {
            let _ = tx.send(task);
        } else {
            tracing::warn!(session_id = self.session_id, "session loop not running");
        }
    }

    // ============================================
    // Accessors
    // ============================================

    /// This session's id.
    #[must_use]
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    /// The race key identifying this peer pair.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// The remote endpoint.
    #[must_use]
    pub fn peer_info(&self) -> &PeerInfo {
        &self.key.peer_info
    }

    /// The local endpoint.
    #[must_use]
    pub fn local_info(&self) -> &PeerInfo {
        &self.key.local_info
    }

    /// The scheduler token this session runs under.
    #[must_use]
    pub fn token(&self) -> String {
        self.token.lock().clone()
    }

    /// Peer protocol version learned during connect (0 when unknown).
    #[must_use]
    pub fn peer_version(&self) -> i32 {
        self.peer_version.load(Ordering::Relaxed)
    }

    /// Current connect state.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    /// Mint (or return the existing) scheduler token for this session.
    pub fn prepare_token(&self) -> String {
        let mut token = self.token.lock();
        if token.is_empty() {
            *token = uuid::Uuid::new_v4().to_string();
        }
        token.clone()
    }

    /// Directory inbound files are stored under.
    pub fn set_recv_path(&self, path: PathBuf) {
        *self.recv_dir.lock() = Some(path);
    }

    /// Bound every scheduler call: a dead scheduler fails, never hangs.
    async fn rpc<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CollabError::SchedulerRpcFailed("rpc timed out".into())),
        }
    }

    fn is_connecting(&self) -> bool {
        *self.status.read() == SessionStatus::Connecting
    }

    fn is_connected(&self) -> bool {
        *self.status.read() == SessionStatus::Connected
    }

    // ============================================
    // Connect state machine
    // ============================================

    /// Start connecting as the source role.
    ///
    /// Asks the remote scheduler to prepare the peer; the outcome of the
    /// whole attempt is reported through `callback` (and the session
    /// events), not this call's return value alone.
    pub async fn connect(self: &Arc<Self>, callback: ConnectCallback) -> Result<()> {
        {
            let mut status = self.status.write();
            if *status != SessionStatus::Unconnected {
                tracing::error!(
                    session_id = self.session_id,
                    status = ?*status,
                    "connect on busy session"
                );
                return Err(CollabError::InvalidParameters(
                    "session is already connecting".into(),
                ));
            }
            *status = SessionStatus::Connecting;
        }
        *self.connect_callback.lock() = Some(callback);
        *self.direction.write() = CollabDirection::Source;
        let token = self.prepare_token();
        self.set_timeout();

        if let Ok(version) = self
            .rpc(self.scheduler.get_peer_version(
                self.session_id,
                &self.key.peer_info.device_id,
                &token,
            ))
            .await
        {
            self.peer_version.store(version, Ordering::Relaxed);
        }

        let result = self
            .rpc(self.scheduler.collab_mission(
                self.session_id,
                &self.local_socket_name,
                &self.key,
                &self.connect_option,
                &token,
            ))
            .await;
        if let Err(e) = result {
            tracing::error!(session_id = self.session_id, error = %e, "collab mission failed");
            self.execute_connect_callback(ConnectResult::failure(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    /// Accept an inbound collaboration as the sink role.
    pub async fn accept_connect(self: &Arc<Self>, token: &str) -> Result<()> {
        {
            let mut status = self.status.write();
            if *status != SessionStatus::Unconnected {
                return Err(CollabError::InvalidParameters(
                    "session is already connecting".into(),
                ));
            }
            *status = SessionStatus::Connecting;
        }
        *self.token.lock() = token.to_string();
        *self.direction.write() = CollabDirection::Sink;
        self.set_timeout();

        if let Err(e) = self.init_channels().await {
            tracing::error!(session_id = self.session_id, error = %e, "sink channel init failed");
            let _ = self
                .rpc(self.scheduler.notify_prepare_result(
                    token,
                    false,
                    self.session_id,
                    &self.local_socket_name,
                ))
                .await;
            self.release().await;
            return Err(e);
        }
        self.rpc(self.scheduler.notify_prepare_result(
            token,
            true,
            self.session_id,
            &self.local_socket_name,
        ))
        .await?;
        Ok(())
    }

    /// Digest the scheduler's collaboration outcome (source role).
    pub async fn handle_collab_result(
        self: &Arc<Self>,
        success: bool,
        peer_socket_name: &str,
        token: &str,
        reason: &str,
    ) -> Result<()> {
        if !success {
            tracing::error!(session_id = self.session_id, reason, "collaboration rejected");
            self.execute_connect_callback(ConnectResult::failure(if reason.is_empty() {
                "peer rejected the collaboration".to_string()
            } else {
                reason.to_string()
            }));
            return Err(CollabError::InvalidParameters("collab result failed".into()));
        }
        if !token.is_empty() {
            *self.token.lock() = token.to_string();
        }
        *self.peer_socket_name.lock() = peer_socket_name.to_string();

        if let Err(e) = self.init_channels().await {
            self.abort_connect(&e.to_string()).await;
            return Err(e);
        }
        if let Err(e) = self.connect_channels().await {
            self.abort_connect(&e.to_string()).await;
            return Err(e);
        }

        if self.connect_option.needs_file() {
            // Hold the connected notification until the peer acks the
            // file channels.
            self.awaiting_file_ack.store(true, Ordering::SeqCst);
            self.send_message(self.local_socket_name.as_str(), MessageType::ConnectFileChannel)?;
        }
        self.handle_session_connect();
        Ok(())
    }

    async fn abort_connect(self: &Arc<Self>, reason: &str) {
        let token = self.token();
        if !token.is_empty() {
            let _ = self
                .rpc(self.scheduler.notify_close_collab_session(&token))
                .await;
        }
        self.execute_connect_callback(ConnectResult::failure(reason.to_string()));
    }

    /// Peer-initiated disconnect arriving through the scheduler.
    pub async fn handle_disconnect(self: &Arc<Self>) -> Result<()> {
        if *self.status.read() == SessionStatus::Unconnected {
            return Ok(());
        }
        self.deliver_event(
            SessionEvent::Disconnect,
            EventCallbackInfo {
                session_id: self.session_id,
                reason: DisconnectReason::PeerAppExit,
                ..EventCallbackInfo::default()
            },
        );
        self.release().await;
        Ok(())
    }

    /// Locally initiated disconnect.
    ///
    /// Local teardown always succeeds; the scheduler notification is
    /// best-effort and never blocks it.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        self.release().await;
        let token = self.token();
        if !token.is_empty() {
            if let Err(e) = self
                .rpc(self.scheduler.notify_close_collab_session(&token))
                .await
            {
                tracing::warn!(session_id = self.session_id, error = %e, "close notify failed");
            }
        }
        Ok(())
    }

    /// Tear down every owned channel and return to `Unconnected`.
    ///
    /// Idempotent: a second call is a no-op.
    pub async fn release(&self) {
        {
            let mut status = self.status.write();
            if *status == SessionStatus::Unconnected {
                tracing::debug!(session_id = self.session_id, "session already released");
                return;
            }
            *status = SessionStatus::Unconnected;
        }
        self.remove_timeout();
        self.awaiting_file_ack.store(false, Ordering::SeqCst);
        let channels: Vec<TransChannelInfo> =
            self.trans_channels.write().drain().map(|(_, info)| info).collect();
        for info in channels {
            let _ = self.channel_manager.delete_channel(info.channel_id).await;
        }
        *self.channel_listener.lock() = None;
        tracing::info!(session_id = self.session_id, "session released");
    }

    // ============================================
    // Channel setup
    // ============================================

    async fn init_channels(self: &Arc<Self>) -> Result<()> {
        let direction = *self.direction.read();
        let channel_name = self.derive_channel_name(direction);
        let listener: Arc<dyn ChannelListener> = Arc::new(SessionChannelListener {
            session: Arc::downgrade(self),
        });
        *self.channel_listener.lock() = Some(Arc::clone(&listener));

        let is_client = direction == CollabDirection::Source;
        self.create_channel(
            &channel_name,
            ChannelDataType::Message,
            TransChannelType::Message,
            is_client,
        )
        .await?;

        if self.connect_option.need_send_big_data {
            self.create_channel(
                &channel_name,
                ChannelDataType::Bytes,
                TransChannelType::Data,
                is_client,
            )
            .await?;
        }

        if self.connect_option.needs_stream() {
            let stream_name = format!("{channel_name}stream");
            self.create_channel(
                &stream_name,
                ChannelDataType::Bytes,
                TransChannelType::StreamBytes,
                is_client,
            )
            .await?;
            self.create_channel(
                &stream_name,
                ChannelDataType::VideoStream,
                TransChannelType::Stream,
                is_client,
            )
            .await?;
        }

        // File channels are role-fixed: the file-sending side always
        // binds, whatever the session direction. The names encode the
        // flow direction so both peers derive the same pair.
        let (send_file_name, recv_file_name) = match direction {
            CollabDirection::Sink => (
                format!("{channel_name}fileR"),
                format!("{channel_name}fileS"),
            ),
            _ => (
                format!("{channel_name}fileS"),
                format!("{channel_name}fileR"),
            ),
        };
        if self.connect_option.need_send_file {
            self.create_channel(
                &send_file_name,
                ChannelDataType::File,
                TransChannelType::SendFile,
                true,
            )
            .await?;
        }
        if self.connect_option.need_receive_file {
            self.create_channel(
                &recv_file_name,
                ChannelDataType::File,
                TransChannelType::ReceiveFile,
                false,
            )
            .await?;
        }
        Ok(())
    }

    async fn create_channel(
        &self,
        channel_name: &str,
        data_type: ChannelDataType,
        trans_type: TransChannelType,
        is_client: bool,
    ) -> Result<()> {
        let peer_info = ChannelPeerInfo {
            peer_name: self.peer_socket_name.lock().clone(),
            network_id: self.key.peer_info.device_id.clone(),
        };
        let channel_id = if is_client {
            self.channel_manager
                .create_client_channel(channel_name, data_type, peer_info)
                .await?
        } else {
            self.channel_manager
                .create_server_channel(channel_name, data_type, peer_info)
                .await?
        };

        let listener = self.channel_listener.lock().clone();
        if let Some(listener) = listener {
            self.channel_manager
                .register_channel_listener(channel_id, &listener)?;
        }

        self.trans_channels.write().insert(
            trans_type,
            TransChannelInfo {
                channel_id,
                channel_type: data_type,
                trans_type,
                connected: false,
            },
        );
        tracing::debug!(
            session_id = self.session_id,
            channel_id,
            ?trans_type,
            "session channel created"
        );
        Ok(())
    }

    /// Deterministic channel name both peers derive independently:
    /// a truncated hash over the source and sink ability coordinates.
    fn derive_channel_name(&self, direction: CollabDirection) -> String {
        let (source, sink) = match direction {
            CollabDirection::Sink => (&self.key.peer_info, &self.key.local_info),
            _ => (&self.key.local_info, &self.key.peer_info),
        };
        let input = format!(
            "{}{}{}{}",
            source.module_name, source.ability_name, sink.module_name, sink.ability_name
        );
        let digest = Sha256::digest(input.as_bytes());
        let mut name = hex::encode(digest);
        name.truncate(CHANNEL_NAME_LENGTH);
        name
    }

    /// Connect the eagerly-bound channels (message, data, stream-bytes).
    async fn connect_channels(&self) -> Result<()> {
        for trans_type in [
            TransChannelType::Message,
            TransChannelType::Data,
            TransChannelType::StreamBytes,
        ] {
            let Some(info) = self.trans_channel(trans_type) else {
                continue;
            };
            self.channel_manager.connect_channel(info.channel_id).await?;
            self.update_trans_channel_status(info.channel_id, true);
            tracing::debug!(
                session_id = self.session_id,
                ?trans_type,
                "session channel bound"
            );
        }
        Ok(())
    }

    async fn connect_trans_channel(&self, trans_type: TransChannelType) -> Result<()> {
        let Some(info) = self.trans_channel(trans_type) else {
            return Err(CollabError::InvalidParameters(format!(
                "no {trans_type:?} channel on this session"
            )));
        };
        if info.connected {
            return Ok(());
        }
        self.channel_manager.connect_channel(info.channel_id).await?;
        self.update_trans_channel_status(info.channel_id, true);
        Ok(())
    }

    /// Bring the lazily-connected stream channel up and tell the peer.
    pub async fn connect_stream_channel(self: &Arc<Self>) -> Result<()> {
        if self.trans_channel(TransChannelType::Stream).is_none() {
            return Err(CollabError::InvalidParameters(
                "no stream channel on this session".into(),
            ));
        }
        self.connect_trans_channel(TransChannelType::Stream).await?;
        self.send_message("", MessageType::UpdateRecvEngineChannel)
    }

    fn trans_channel(&self, trans_type: TransChannelType) -> Option<TransChannelInfo> {
        self.trans_channels.read().get(&trans_type).copied()
    }

    fn update_trans_channel_status(&self, channel_id: i32, connected: bool) {
        let mut channels = self.trans_channels.write();
        for info in channels.values_mut() {
            if info.channel_id == channel_id {
                info.connected = connected;
            }
        }
    }

    fn is_valid_channel(&self, channel_id: i32) -> bool {
        self.trans_channels
            .read()
            .values()
            .any(|info| info.channel_id == channel_id)
    }

    fn is_stream_bytes_channel(&self, channel_id: i32) -> bool {
        self.trans_channel(TransChannelType::StreamBytes)
            .is_some_and(|info| info.channel_id == channel_id)
    }

    /// All channels the connect fan-in requires (stream is lazy).
    fn all_required_channels_connected(&self) -> bool {
        self.trans_channels
            .read()
            .values()
            .all(|info| info.connected || info.trans_type == TransChannelType::Stream)
    }

    // ============================================
    // Sends
    // ============================================

    /// Send a control message: a TLV header followed by the UTF-8 body.
    pub fn send_message(&self, msg: &str, message_type: MessageType) -> Result<()> {
        let total_len = MessageDataHeader::HEADER_LEN + msg.len();
        let header = MessageDataHeader::new(
            MessageDataHeader::PROTOCOL_VERSION,
            message_type as u32,
            total_len as u32,
        );
        let mut buffer = DataBuffer::new(total_len);
        let out = buffer.data_mut().ok_or(CollabError::NullPointer)?;
        let header_bytes = header.serialize();
        out[..MessageDataHeader::HEADER_LEN]
            .copy_from_slice(header_bytes.data().ok_or(CollabError::NullPointer)?);
        out[MessageDataHeader::HEADER_LEN..].copy_from_slice(msg.as_bytes());

        let info = self
            .trans_channel(TransChannelType::Message)
            .ok_or(CollabError::InvalidParameters("no message channel".into()))?;
        self.channel_manager
            .send_message(info.channel_id, Arc::new(buffer))
    }

    /// Send a bulk payload on the data channel.
    pub fn send_data(&self, buffer: Arc<DataBuffer>) -> Result<()> {
        let info = self
            .trans_channel(TransChannelType::Data)
            .ok_or(CollabError::InvalidParameters("no data channel".into()))?;
        self.channel_manager.send_bytes(info.channel_id, buffer)
    }

    /// Send a stream frame, preferring the native stream channel and
    /// falling back to the stream-bytes channel.
    pub fn send_stream(&self, stream: StreamData) -> Result<()> {
        let stream_info = self
            .trans_channel(TransChannelType::Stream)
            .filter(|info| info.connected);
        if let Some(info) = stream_info {
            return self
                .channel_manager
                .send_stream(info.channel_id, Arc::new(stream));
        }
        let bytes_info = self
            .trans_channel(TransChannelType::StreamBytes)
            .filter(|info| info.connected)
            .ok_or(CollabError::InvalidParameters(
                "no connected stream channel".into(),
            ))?;
        let frame = encode_stream_frame(&stream)?;
        self.channel_manager
            .send_bytes(bytes_info.channel_id, Arc::new(frame))
    }

    /// Transfer files on the send-file channel.
    pub fn send_file(&self, sources: Vec<String>, destinations: Vec<String>) -> Result<()> {
        let info = self
            .trans_channel(TransChannelType::SendFile)
            .ok_or(CollabError::InvalidParameters("no send-file channel".into()))?;
        self.channel_manager
            .send_file(info.channel_id, sources, destinations)
    }

    // ============================================
    // Stream registration (media pipeline lives outside this crate)
    // ============================================

    /// Register this end of a stream; validates against the options.
    pub fn create_stream(&self, params: &StreamParams) -> Result<()> {
        match params.role {
            StreamRole::Source if !self.connect_option.need_send_stream => {
                Err(CollabError::InvalidParameters(
                    "stream sending was not negotiated".into(),
                ))
            }
            StreamRole::Sink if !self.connect_option.need_receive_stream => {
                Err(CollabError::InvalidParameters(
                    "stream receiving was not negotiated".into(),
                ))
            }
            role => {
                let mut stream_role = self.stream_role.lock();
                if stream_role.is_some() {
                    return Err(CollabError::InvalidParameters(
                        "stream already registered".into(),
                    ));
                }
                *stream_role = Some(role);
                tracing::info!(session_id = self.session_id, name = %params.name, ?role, "stream registered");
                Ok(())
            }
        }
    }

    /// Drop the stream registration.
    pub fn destroy_stream(&self) -> Result<()> {
        *self.stream_role.lock() = None;
        Ok(())
    }

    /// Start streaming: the producing side brings the stream channel up.
    pub async fn start_stream(self: &Arc<Self>) -> Result<()> {
        match *self.stream_role.lock() {
            Some(StreamRole::Source) => {}
            Some(StreamRole::Sink) => return Ok(()),
            None => {
                return Err(CollabError::InvalidParameters(
                    "no stream registered".into(),
                ))
            }
        }
        if let Err(e) = self.connect_stream_channel().await {
            tracing::warn!(session_id = self.session_id, error = %e, "stream channel unavailable, frames stay on the bytes path");
        }
        Ok(())
    }

    /// Stop streaming.
    pub fn stop_stream(&self) -> Result<()> {
        if self.stream_role.lock().is_none() {
            return Err(CollabError::InvalidParameters("no stream registered".into()));
        }
        Ok(())
    }

    // ============================================
    // Application listeners
    // ============================================

    /// Subscribe to a session event; replaces any previous callback.
    pub fn register_event_callback(&self, event: SessionEvent, callback: SessionEventCallback) {
        self.listeners.write().insert(event, callback);
    }

    /// Drop the subscription for one event.
    pub fn unregister_event_callback(&self, event: SessionEvent) {
        self.listeners.write().remove(&event);
    }

    /// Deliver an event on the session loop.
    fn deliver_event(self: &Arc<Self>, event: SessionEvent, info: EventCallbackInfo) {
        let session = Arc::clone(self);
        self.post(Box::pin(async move {
            let callback = session.listeners.read().get(&event).cloned();
            match callback {
                Some(callback) => callback(info),
                None => {
                    tracing::debug!(
                        session_id = session.session_id,
                        ?event,
                        "no callback registered"
                    );
                }
            }
        }));
    }

    /// Run the connect callback on the session loop; failures release.
    fn execute_connect_callback(self: &Arc<Self>, result: ConnectResult) {
        let session = Arc::clone(self);
        self.post(Box::pin(async move {
            let callback = session.connect_callback.lock().clone();
            if let Some(callback) = callback {
                callback(result.clone());
            }
            if !result.is_connected {
                session.release().await;
            }
        }));
    }

    // ============================================
    // Timeout
    // ============================================

    fn set_timeout(self: &Arc<Self>) {
        self.remove_timeout();
        let session = Arc::downgrade(self);
        let timeout = self.connect_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.is_connecting() {
                tracing::error!(session_id = session.session_id, "connect timed out");
                session.execute_connect_callback(ConnectResult::failure("connect timeout"));
            }
        });
        *self.timeout_task.lock() = Some(task);
    }

    fn remove_timeout(&self) {
        if let Some(task) = self.timeout_task.lock().take() {
            task.abort();
        }
    }

    // ============================================
    // Channel event fan-in
    // ============================================

    fn on_channel_connect(self: &Arc<Self>, channel_id: i32) {
        self.update_trans_channel_status(channel_id, true);
        self.handle_session_connect();
    }

    /// Transition to `Connected` once every required channel is bound.
    /// Idempotent against duplicate channel-connect events.
    fn handle_session_connect(self: &Arc<Self>) {
        if !self.all_required_channels_connected() {
            return;
        }
        if self.awaiting_file_ack.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut status = self.status.write();
            match *status {
                SessionStatus::Connecting => *status = SessionStatus::Connected,
                _ => return,
            }
        }
        tracing::info!(session_id = self.session_id, "session connected");
        self.remove_timeout();
        self.deliver_event(
            SessionEvent::Connect,
            EventCallbackInfo {
                session_id: self.session_id,
                ..EventCallbackInfo::default()
            },
        );
        self.execute_connect_callback(ConnectResult::success());
    }

    fn on_channel_closed(self: &Arc<Self>, channel_id: i32) {
        if !self.is_valid_channel(channel_id) {
            return;
        }
        if self.is_connected() {
            tracing::info!(
                session_id = self.session_id,
                channel_id,
                "peer channel closed, releasing session"
            );
            self.deliver_event(
                SessionEvent::Disconnect,
                EventCallbackInfo {
                    session_id: self.session_id,
                    reason: DisconnectReason::PeerAppExit,
                    ..EventCallbackInfo::default()
                },
            );
            let session = Arc::clone(self);
            self.post(Box::pin(async move {
                session.release().await;
            }));
        }
    }

    fn on_message_received(self: &Arc<Self>, channel_id: i32, buffer: &Arc<DataBuffer>) {
        if !self.is_valid_channel(channel_id) {
            return;
        }
        let Some(data) = buffer.data() else {
            return;
        };
        let header = match MessageDataHeader::deserialize(data) {
            Ok(header) => header,
            Err(e) => {
                tracing::error!(session_id = self.session_id, error = %e, "bad message header");
                return;
            }
        };
        let body = &data[MessageDataHeader::HEADER_LEN.min(data.len())..];
        let message_type = match MessageType::try_from(header.data_type) {
            Ok(message_type) => message_type,
            Err(_) => {
                tracing::warn!(
                    session_id = self.session_id,
                    data_type = header.data_type,
                    "unhandled message type"
                );
                return;
            }
        };
        match message_type {
            MessageType::Normal => {
                self.deliver_event(
                    SessionEvent::Message,
                    EventCallbackInfo {
                        session_id: self.session_id,
                        msg: Some(String::from_utf8_lossy(body).into_owned()),
                        ..EventCallbackInfo::default()
                    },
                );
            }
            MessageType::WifiOpen => {
                let session = Arc::clone(self);
                self.post(Box::pin(async move {
                    if let Err(e) = session.connect_stream_channel().await {
                        tracing::warn!(error = %e, "lazy stream connect failed");
                    }
                }));
            }
            MessageType::UpdateRecvEngineChannel | MessageType::UpdateSenderEngineChannel => {
                // The peer switched to the native stream channel; our
                // side of it was marked connected when the bind landed.
                tracing::debug!(session_id = self.session_id, ?message_type, "engine channel update");
            }
            MessageType::ReceiveStreamStart | MessageType::StreamEncoding => {
                tracing::debug!(session_id = self.session_id, ?message_type, "stream control message");
            }
            MessageType::ConnectFileChannel => {
                let session = Arc::clone(self);
                self.post(Box::pin(async move {
                    session.handle_connect_file_channel().await;
                }));
            }
            MessageType::FileChannelConnectSuccess => {
                self.awaiting_file_ack.store(false, Ordering::SeqCst);
                let session = Arc::clone(self);
                self.post(Box::pin(async move {
                    if session.trans_channel(TransChannelType::SendFile).is_some() {
                        if let Err(e) =
                            session.connect_trans_channel(TransChannelType::SendFile).await
                        {
                            tracing::error!(error = %e, "send-file channel bind failed");
                            session.execute_connect_callback(ConnectResult::failure(
                                e.to_string(),
                            ));
                            return;
                        }
                    }
                    session.handle_session_connect();
                }));
            }
            MessageType::FileChannelConnectFailed => {
                tracing::error!(session_id = self.session_id, "peer failed to open file channels");
                self.execute_connect_callback(ConnectResult::failure(
                    "file channel connect failed",
                ));
            }
        }
    }

    /// Sink side of the file-channel handshake: bind our sending file
    /// channel (if any) and report the outcome.
    async fn handle_connect_file_channel(self: &Arc<Self>) {
        let result = if self.trans_channel(TransChannelType::SendFile).is_some() {
            self.connect_trans_channel(TransChannelType::SendFile).await
        } else {
            Ok(())
        };
        let reply = match result {
            Ok(()) => MessageType::FileChannelConnectSuccess,
            Err(ref e) => {
                tracing::error!(session_id = self.session_id, error = %e, "file channel bind failed");
                MessageType::FileChannelConnectFailed
            }
        };
        if let Err(e) = self.send_message("", reply) {
            tracing::error!(session_id = self.session_id, error = %e, "file channel ack failed");
        }
    }

    fn on_bytes_received(self: &Arc<Self>, channel_id: i32, buffer: &Arc<DataBuffer>) {
        if !self.is_valid_channel(channel_id) {
            return;
        }
        if self.is_stream_bytes_channel(channel_id) {
            let Some(data) = buffer.data() else { return };
            match decode_stream_frame(data) {
                Ok(stream) => self.deliver_event(
                    SessionEvent::Stream,
                    EventCallbackInfo {
                        session_id: self.session_id,
                        stream: Some(Arc::new(stream)),
                        ..EventCallbackInfo::default()
                    },
                ),
                Err(e) => {
                    tracing::error!(session_id = self.session_id, error = %e, "stream frame decode failed");
                }
            }
            return;
        }
        self.deliver_event(
            SessionEvent::Data,
            EventCallbackInfo {
                session_id: self.session_id,
                data: Some(Arc::clone(buffer)),
                ..EventCallbackInfo::default()
            },
        );
    }

    fn on_stream_received(self: &Arc<Self>, channel_id: i32, stream: &Arc<StreamData>) {
        if !self.is_valid_channel(channel_id) {
            return;
        }
        self.deliver_event(
            SessionEvent::Stream,
            EventCallbackInfo {
                session_id: self.session_id,
                stream: Some(Arc::clone(stream)),
                ..EventCallbackInfo::default()
            },
        );
    }

    fn on_file_event(self: &Arc<Self>, channel_id: i32, info: &FileInfo, recv: bool) {
        if !self.is_valid_channel(channel_id) {
            return;
        }
        self.deliver_event(
            if recv {
                SessionEvent::RecvFile
            } else {
                SessionEvent::SendFile
            },
            EventCallbackInfo {
                session_id: self.session_id,
                file: Some(info.clone()),
                ..EventCallbackInfo::default()
            },
        );
    }
}

/// Adapter registered with the channel manager; holds the session
/// weakly so a released session cannot be kept alive by its channels.
struct SessionChannelListener {
    session: Weak<ConnectionSession>,
}

impl ChannelListener for SessionChannelListener {
    fn on_connect(&self, channel_id: i32) {
        if let Some(session) = self.session.upgrade() {
            session.on_channel_connect(channel_id);
        }
    }

    fn on_dis_connect(&self, channel_id: i32) {
        if let Some(session) = self.session.upgrade() {
            session.on_channel_closed(channel_id);
        }
    }

    fn on_stream(&self, channel_id: i32, data: &Arc<StreamData>) {
        if let Some(session) = self.session.upgrade() {
            session.on_stream_received(channel_id, data);
        }
    }

    fn on_bytes(&self, channel_id: i32, data: &Arc<DataBuffer>) {
        if let Some(session) = self.session.upgrade() {
            session.on_bytes_received(channel_id, data);
        }
    }

    fn on_message(&self, channel_id: i32, data: &Arc<DataBuffer>) {
        if let Some(session) = self.session.upgrade() {
            session.on_message_received(channel_id, data);
        }
    }

    fn on_error(&self, channel_id: i32, error: &CollabError) {
        tracing::warn!(channel_id, error = %error, "channel error");
    }

    fn on_send_file(&self, channel_id: i32, info: &FileInfo) {
        if let Some(session) = self.session.upgrade() {
            session.on_file_event(channel_id, info, false);
        }
    }

    fn on_recv_file(&self, channel_id: i32, info: &FileInfo) {
        if let Some(session) = self.session.upgrade() {
            session.on_file_event(channel_id, info, true);
        }
    }

    fn recv_path(&self, _channel_id: i32) -> Option<PathBuf> {
        self.session.upgrade()?.recv_dir.lock().clone()
    }
}
