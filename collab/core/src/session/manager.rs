//! Connection Manager
//!
//! Top-level registry of collaboration sessions and active streams.
//! Owns the channel manager and scheduler handles, derives the
//! deterministic server socket name, and arbitrates the symmetric race
//! where both peers simultaneously initiate the same collaboration.
//!
//! # Race arbitration
//!
//! Two maps key registrations by [`SessionKey`]: sessions initiating as
//! the client side and sessions accepting as the server side. When a
//! registration finds the opposite role already present for the same
//! key, the scheduler tokens decide deterministically: the side holding
//! the lexicographically larger token yields with
//! [`CollabError::SameSessionIsConnecting`]; the smaller token wins and
//! evicts the loser. At most one session per peer pair survives, with
//! no extra coordination round-trip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use crate::channel::ChannelManager;
use crate::config::CollabConfig;
use crate::errors::{CollabError, Result};
use crate::session::{
    ConnectCallback, ConnectOption, ConnectionSession, PeerInfo, SchedulerClient, SessionEvent,
    SessionEventCallback, SessionKey, StreamParams,
};

const SERVER_SOCKET_NAME_LENGTH: usize = 64;
const FIRST_SESSION_ID: i32 = 100;
const FIRST_STREAM_ID: i32 = 1000;

/// Identity of the local ability creating sessions.
#[derive(Clone, Debug)]
pub struct LocalAbility {
    /// Process id, part of the server socket name derivation.
    pub pid: i32,
    /// User id, part of the server socket name derivation.
    pub uid: i32,
    /// Application bundle name.
    pub bundle_name: String,
    /// Module within the bundle.
    pub module_name: String,
    /// Ability within the module.
    pub ability_name: String,
}

#[derive(Clone)]
struct RaceEntry {
    session_id: i32,
    token: String,
}

#[derive(Default)]
struct RaceMaps {
    client_sessions: HashMap<SessionKey, RaceEntry>,
    server_sessions: HashMap<SessionKey, RaceEntry>,
}

/// Registry of sessions and streams.
pub struct ConnectionManager {
    channel_manager: Arc<ChannelManager>,
    scheduler: Arc<dyn SchedulerClient>,
    config: CollabConfig,

    sessions: RwLock<HashMap<i32, Arc<ConnectionSession>>>,
    next_session_id: AtomicI32,
    streams: RwLock<HashMap<i32, i32>>,
    next_stream_id: AtomicI32,
    race: Mutex<RaceMaps>,
}

impl ConnectionManager {
    /// Build a manager over an (uninitialized) channel manager and a
    /// scheduler client.
    #[must_use]
    pub fn new(
        channel_manager: Arc<ChannelManager>,
        scheduler: Arc<dyn SchedulerClient>,
        config: CollabConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel_manager,
            scheduler,
            config,
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicI32::new(FIRST_SESSION_ID),
            streams: RwLock::new(HashMap::new()),
            next_stream_id: AtomicI32::new(FIRST_STREAM_ID),
            race: Mutex::new(RaceMaps::default()),
        })
    }

    // ============================================
    // Session lifecycle
    // ============================================

    /// Create (or reuse) a session toward `peer_info`.
    ///
    /// Initializes the channel manager with the deterministically
    /// derived server socket name on first use. Returns the session id.
    pub async fn create_session(
        &self,
        ability: &LocalAbility,
        peer_info: &PeerInfo,
        options: &ConnectOption,
    ) -> Result<i32> {
        if !peer_info.is_complete() {
            tracing::error!("peer info incomplete");
            return Err(CollabError::InvalidParameters("incomplete peer info".into()));
        }
        if options.need_send_stream && options.need_receive_stream {
            tracing::error!("both stream directions requested on one end");
            return Err(CollabError::InvalidParameters(
                "streams cannot be sent and received by the same end".into(),
            ));
        }

        let local_info = PeerInfo {
            device_id: String::new(),
            bundle_name: ability.bundle_name.clone(),
            module_name: ability.module_name.clone(),
            ability_name: ability.ability_name.clone(),
            server_id: peer_info.server_id.clone(),
        };
        if let Some(existing) = self.find_existing_session(&local_info, peer_info) {
            tracing::info!(session_id = existing, "session with same endpoints already exists");
            return Ok(existing);
        }

        let server_socket_name =
            derive_server_socket_name(ability.pid, ability.uid, &ability.bundle_name);
        self.channel_manager.init(&server_socket_name).await?;

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let key = SessionKey {
            server_id: peer_info.server_id.clone(),
            local_info,
            peer_info: peer_info.clone(),
        };
        let session = ConnectionSession::new(
            session_id,
            server_socket_name,
            key,
            options.clone(),
            Arc::clone(&self.channel_manager),
            Arc::clone(&self.scheduler),
            Duration::from_millis(self.config.connect_timeout_ms),
            Duration::from_millis(self.config.scheduler_rpc_timeout_ms),
        );
        session.init().await;
        self.sessions.write().insert(session_id, session);
        tracing::info!(session_id, "session created");
        Ok(session_id)
    }

    fn find_existing_session(&self, local_info: &PeerInfo, peer_info: &PeerInfo) -> Option<i32> {
        self.sessions
            .read()
            .iter()
            .find(|(_, session)| {
                session.local_info() == local_info && session.peer_info() == peer_info
            })
            .map(|(id, _)| *id)
    }

    /// Disconnect, stop, and drop a session.
    pub async fn destroy_session(&self, session_id: i32) -> Result<()> {
        let session = self.get_session(session_id)?;
        session.disconnect().await?;
        session.uninit().await;
        self.sessions.write().remove(&session_id);
        self.streams.write().retain(|_, sid| *sid != session_id);
        let mut race = self.race.lock();
        race.client_sessions
            .retain(|_, entry| entry.session_id != session_id);
        race.server_sessions
            .retain(|_, entry| entry.session_id != session_id);
        Ok(())
    }

    /// The peer endpoint of a session.
    pub fn peer_info(&self, session_id: i32) -> Result<PeerInfo> {
        Ok(self.get_session(session_id)?.peer_info().clone())
    }

    fn get_session(&self, session_id: i32) -> Result<Arc<ConnectionSession>> {
        if session_id <= 0 {
            return Err(CollabError::InvalidSessionId(session_id));
        }
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(CollabError::InvalidSessionId(session_id))
    }

    fn get_session_by_stream(&self, stream_id: i32) -> Result<Arc<ConnectionSession>> {
        let session_id = *self
            .streams
            .read()
            .get(&stream_id)
            .ok_or(CollabError::InvalidParameters(format!(
                "unknown stream id {stream_id}"
            )))?;
        self.get_session(session_id)
    }

    // ============================================
    // Connect / accept / scheduler callbacks
    // ============================================

    /// Start connecting a session as the source side.
    pub async fn connect_session(
        &self,
        session_id: i32,
        callback: ConnectCallback,
    ) -> Result<()> {
        let session = self.get_session(session_id)?;
        let token = session.prepare_token();
        self.update_client_session(session.key(), session_id, &token)?;
        session.connect(callback).await
    }

    /// Disconnect a session locally.
    pub async fn disconnect_session(&self, session_id: i32) -> Result<()> {
        self.get_session(session_id)?.disconnect().await
    }

    /// Accept an inbound collaboration on a session (sink side).
    pub async fn accept_connect(&self, session_id: i32, token: &str) -> Result<()> {
        let session = self.get_session(session_id)?;
        self.update_server_session(session.key(), session_id, token)?;
        session.accept_connect(token).await
    }

    /// Reject an inbound collaboration before any session exists.
    pub async fn reject(&self, token: &str, reason: &str) -> Result<()> {
        self.scheduler.notify_reject_reason(token, reason).await
    }

    /// Deliver the scheduler's collaboration outcome to a session.
    pub async fn notify_collab_result(
        &self,
        session_id: i32,
        success: bool,
        peer_socket_name: &str,
        token: &str,
        reason: &str,
    ) -> Result<()> {
        self.get_session(session_id)?
            .handle_collab_result(success, peer_socket_name, token, reason)
            .await
    }

    /// Deliver a peer-side disconnect to a session.
    pub async fn notify_disconnect(&self, session_id: i32) -> Result<()> {
        self.get_session(session_id)?.handle_disconnect().await
    }

    // ============================================
    // Race arbitration
    // ============================================

    /// Register `session_id` as the client (initiating) side for `key`.
    ///
    /// See the module docs for the token tie-break.
    pub fn update_client_session(
        &self,
        key: &SessionKey,
        session_id: i32,
        token: &str,
    ) -> Result<()> {
        let loser = {
            let mut race = self.race.lock();
            if let Some(entry) = race.server_sessions.get(key) {
                if entry.session_id != session_id {
                    if token > entry.token.as_str() {
                        tracing::warn!(
                            session_id,
                            other = entry.session_id,
                            "yielding to concurrent server-side session"
                        );
                        return Err(CollabError::SameSessionIsConnecting);
                    }
                    let evicted = race.server_sessions.remove(key).map(|e| e.session_id);
                    race.client_sessions.insert(
                        key.clone(),
                        RaceEntry {
                            session_id,
                            token: token.to_string(),
                        },
                    );
                    evicted
                } else {
                    None
                }
            } else {
                race.client_sessions.insert(
                    key.clone(),
                    RaceEntry {
                        session_id,
                        token: token.to_string(),
                    },
                );
                None
            }
        };
        self.release_race_loser(loser);
        Ok(())
    }

    /// Register `session_id` as the server (accepting) side for `key`.
    pub fn update_server_session(
        &self,
        key: &SessionKey,
        session_id: i32,
        token: &str,
    ) -> Result<()> {
        let loser = {
            let mut race = self.race.lock();
            if let Some(entry) = race.client_sessions.get(key) {
                if entry.session_id != session_id {
                    if token > entry.token.as_str() {
                        tracing::warn!(
                            session_id,
                            other = entry.session_id,
                            "yielding to concurrent client-side session"
                        );
                        return Err(CollabError::SameSessionIsConnecting);
                    }
                    let evicted = race.client_sessions.remove(key).map(|e| e.session_id);
                    race.server_sessions.insert(
                        key.clone(),
                        RaceEntry {
                            session_id,
                            token: token.to_string(),
                        },
                    );
                    evicted
                } else {
                    None
                }
            } else {
                race.server_sessions.insert(
                    key.clone(),
                    RaceEntry {
                        session_id,
                        token: token.to_string(),
                    },
                );
                None
            }
        };
        self.release_race_loser(loser);
        Ok(())
    }

    /// The evicted side of a settled race is released asynchronously.
    fn release_race_loser(&self, loser: Option<i32>) {
        let Some(loser_id) = loser else { return };
        tracing::info!(session_id = loser_id, "releasing race-losing session");
        if let Ok(session) = self.get_session(loser_id) {
            tokio::spawn(async move {
                session.release().await;
            });
        }
    }

    // ============================================
    // Data plane passthroughs
    // ============================================

    /// Send an application message on a session.
    pub fn send_message(&self, session_id: i32, msg: &str) -> Result<()> {
        self.get_session(session_id)?
            .send_message(msg, crate::session::MessageType::Normal)
    }

    /// Send a bulk payload on a session.
    pub fn send_data(
        &self,
        session_id: i32,
        buffer: Arc<crate::buffer::DataBuffer>,
    ) -> Result<()> {
        self.get_session(session_id)?.send_data(buffer)
    }

    /// Send a stream frame on a session.
    pub fn send_stream(&self, session_id: i32, stream: crate::protocol::StreamData) -> Result<()> {
        self.get_session(session_id)?.send_stream(stream)
    }

    /// Transfer files on a session.
    pub fn send_file(
        &self,
        session_id: i32,
        sources: Vec<String>,
        destinations: Vec<String>,
    ) -> Result<()> {
        self.get_session(session_id)?.send_file(sources, destinations)
    }

    /// Subscribe to a session's events.
    pub fn register_event_callback(
        &self,
        session_id: i32,
        event: SessionEvent,
        callback: SessionEventCallback,
    ) -> Result<()> {
        self.get_session(session_id)?
            .register_event_callback(event, callback);
        Ok(())
    }

    /// Drop a session-event subscription.
    pub fn unregister_event_callback(&self, session_id: i32, event: SessionEvent) -> Result<()> {
        self.get_session(session_id)?.unregister_event_callback(event);
        Ok(())
    }

    // ============================================
    // Stream registry
    // ============================================

    /// Register a stream on a session; returns the stream id.
    pub fn create_stream(&self, session_id: i32, params: &StreamParams) -> Result<i32> {
        let session = self.get_session(session_id)?;
        session.create_stream(params)?;
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        self.streams.write().insert(stream_id, session_id);
        tracing::info!(session_id, stream_id, "stream registered");
        Ok(stream_id)
    }

    /// Unregister a stream.
    pub fn destroy_stream(&self, stream_id: i32) -> Result<()> {
        let session = self.get_session_by_stream(stream_id)?;
        session.destroy_stream()?;
        self.streams.write().remove(&stream_id);
        Ok(())
    }

    /// Start a registered stream.
    pub async fn start_stream(&self, stream_id: i32) -> Result<()> {
        self.get_session_by_stream(stream_id)?.start_stream().await
    }

    /// Stop a registered stream.
    pub fn stop_stream(&self, stream_id: i32) -> Result<()> {
        self.get_session_by_stream(stream_id)?.stop_stream()
    }

    /// Access a session (integration glue, e.g. recv-path setup).
    pub fn session(&self, session_id: i32) -> Result<Arc<ConnectionSession>> {
        self.get_session(session_id)
    }
}

/// Collision-resistant server socket name both peers can rediscover:
/// hex SHA-256 of `pid|uid|bundle`, truncated to a fixed length.
#[must_use]
pub fn derive_server_socket_name(pid: i32, uid: i32, bundle_name: &str) -> String {
    let input = format!("{pid}{uid}{bundle_name}");
    let digest = Sha256::digest(input.as_bytes());
    let mut name = hex::encode(digest);
    name.truncate(SERVER_SOCKET_NAME_LENGTH);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectOption;
    use crate::transport::LoopbackTransport;
    use async_trait::async_trait;

    struct NullScheduler;

    #[async_trait]
    impl SchedulerClient for NullScheduler {
        async fn collab_mission(
            &self,
            _session_id: i32,
            _server_socket_name: &str,
            _key: &SessionKey,
            _options: &ConnectOption,
            _token: &str,
        ) -> Result<()> {
            Ok(())
        }
        async fn notify_prepare_result(
            &self,
            _token: &str,
            _success: bool,
            _session_id: i32,
            _server_socket_name: &str,
        ) -> Result<()> {
            Ok(())
        }
        async fn notify_close_collab_session(&self, _token: &str) -> Result<()> {
            Ok(())
        }
        async fn notify_reject_reason(&self, _token: &str, _reason: &str) -> Result<()> {
            Ok(())
        }
        async fn get_peer_version(
            &self,
            _session_id: i32,
            _peer_device_id: &str,
            _token: &str,
        ) -> Result<i32> {
            Ok(1)
        }
    }

    fn manager() -> Arc<ConnectionManager> {
        let transport = Arc::new(LoopbackTransport::new());
        ConnectionManager::new(
            ChannelManager::new(transport, &CollabConfig::default()),
            Arc::new(NullScheduler),
            CollabConfig::default(),
        )
    }

    fn key() -> SessionKey {
        let peer = PeerInfo {
            device_id: "remote".into(),
            bundle_name: "bundle".into(),
            module_name: "module".into(),
            ability_name: "ability".into(),
            server_id: "server-1".into(),
        };
        SessionKey {
            server_id: "server-1".into(),
            local_info: PeerInfo {
                device_id: String::new(),
                ..peer.clone()
            },
            peer_info: peer,
        }
    }

    #[test]
    fn test_server_socket_name_is_deterministic() {
        let a = derive_server_socket_name(10, 20, "com.example.app");
        let b = derive_server_socket_name(10, 20, "com.example.app");
        assert_eq!(a, b);
        assert_eq!(a.len(), SERVER_SOCKET_NAME_LENGTH);
        assert_ne!(a, derive_server_socket_name(11, 20, "com.example.app"));
    }

    #[tokio::test]
    async fn test_race_larger_token_yields() {
        let mgr = manager();
        mgr.update_client_session(&key(), 101, "aaa").unwrap();
        let result = mgr.update_server_session(&key(), 102, "bbb");
        assert_eq!(result, Err(CollabError::SameSessionIsConnecting));
        // Exactly one registration survives.
        let race = mgr.race.lock();
        assert!(race.client_sessions.contains_key(&key()));
        assert!(!race.server_sessions.contains_key(&key()));
    }

    #[tokio::test]
    async fn test_race_swapped_tokens_swap_the_winner() {
        let mgr = manager();
        mgr.update_client_session(&key(), 101, "bbb").unwrap();
        // The later registrant holds the smaller token and wins; the
        // earlier client-side registration is evicted.
        mgr.update_server_session(&key(), 102, "aaa").unwrap();
        let race = mgr.race.lock();
        assert!(!race.client_sessions.contains_key(&key()));
        assert_eq!(race.server_sessions.get(&key()).unwrap().session_id, 102);
    }

    #[tokio::test]
    async fn test_race_is_symmetric_for_client_registration() {
        let mgr = manager();
        mgr.update_server_session(&key(), 201, "aaa").unwrap();
        assert_eq!(
            mgr.update_client_session(&key(), 202, "bbb"),
            Err(CollabError::SameSessionIsConnecting)
        );
        mgr.update_client_session(&key(), 203, "a").unwrap();
        let race = mgr.race.lock();
        assert_eq!(race.client_sessions.get(&key()).unwrap().session_id, 203);
        assert!(!race.server_sessions.contains_key(&key()));
    }

    #[tokio::test]
    async fn test_unknown_session_ids_are_rejected() {
        let mgr = manager();
        assert!(matches!(
            mgr.peer_info(999),
            Err(CollabError::InvalidSessionId(999))
        ));
        assert!(matches!(
            mgr.send_message(0, "x"),
            Err(CollabError::InvalidSessionId(0))
        ));
        assert!(mgr.destroy_stream(55).is_err());
    }

    #[tokio::test]
    async fn test_create_session_validates_inputs() {
        let mgr = manager();
        let ability = LocalAbility {
            pid: 1,
            uid: 2,
            bundle_name: "bundle".into(),
            module_name: "module".into(),
            ability_name: "ability".into(),
        };
        let incomplete = PeerInfo::default();
        assert!(mgr
            .create_session(&ability, &incomplete, &ConnectOption::default())
            .await
            .is_err());

        let peer = key().peer_info;
        let both_streams = ConnectOption {
            need_send_stream: true,
            need_receive_stream: true,
            ..ConnectOption::default()
        };
        assert!(mgr.create_session(&ability, &peer, &both_streams).await.is_err());
    }

    #[tokio::test]
    async fn test_create_session_reuses_existing_endpoints() {
        let mgr = manager();
        let ability = LocalAbility {
            pid: 1,
            uid: 2,
            bundle_name: "bundle".into(),
            module_name: "module".into(),
            ability_name: "ability".into(),
        };
        let peer = key().peer_info;
        let first = mgr
            .create_session(&ability, &peer, &ConnectOption::default())
            .await
            .unwrap();
        let second = mgr
            .create_session(&ability, &peer, &ConnectOption::default())
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
