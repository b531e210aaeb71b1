//! In-Process Loopback Transport
//!
//! A [`SocketTransport`] that pairs sockets inside one process: a bind
//! resolves its peer name against the registered listening sockets and,
//! on match, synthesizes an accepted socket on the listening side. Sends
//! deliver synchronously into the peer's [`SocketEvents`] sink.
//!
//! Used by tests and demos so two channel managers can talk without any
//! real network. Failure injection (`set_fail_binds`) and a configurable
//! `max_send_size` cover the fragmentation and bind-failure paths.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::channel::{
    ChannelFileEvent, FileCommonInfo, FileInfo, FileRecvInfo, FileSendInfo,
};
use crate::errors::{CollabError, Result};
use crate::transport::{
    PeerSocketInfo, QosTv, ShutdownReason, SocketEvents, SocketInfo, SocketTransport,
};

#[derive(Clone)]
struct SocketRec {
    name: String,
    peer_name: String,
}

#[derive(Default)]
struct LoopbackState {
    next_socket_id: i32,
    sockets: HashMap<i32, SocketRec>,
    /// Listening server sockets keyed by their name.
    listeners: HashMap<String, i32>,
    /// Bound socket -> its remote counterpart.
    peers: HashMap<i32, i32>,
    /// Event sink per socket (listen registers the server socket's sink,
    /// bind registers the client's; accepted sockets inherit the
    /// listener's sink).
    sinks: HashMap<i32, Arc<dyn SocketEvents>>,
    max_send_size: usize,
    fail_binds: bool,
}

/// In-process implementation of the socket transport.
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Default per-call send limit.
    pub const DEFAULT_MAX_SEND_SIZE: usize = 1024 * 1024;

    /// Create a transport with the default send limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                next_socket_id: 0,
                max_send_size: Self::DEFAULT_MAX_SEND_SIZE,
                ..LoopbackState::default()
            }),
        }
    }

    /// Override the per-call send limit (drives fragmentation in tests).
    pub fn set_max_send_size(&self, size: usize) {
        self.state.lock().max_send_size = size;
    }

    /// Make every subsequent bind fail.
    pub fn set_fail_binds(&self, fail: bool) {
        self.state.lock().fail_binds = fail;
    }

    fn peer_sink(&self, socket_id: i32) -> Result<(i32, Arc<dyn SocketEvents>)> {
        let state = self.state.lock();
        let peer = *state
            .peers
            .get(&socket_id)
            .ok_or(CollabError::InvalidSocketId(socket_id))?;
        let sink = state
            .sinks
            .get(&peer)
            .cloned()
            .ok_or(CollabError::InvalidSocketId(peer))?;
        Ok((peer, sink))
    }
}

#[async_trait]
impl SocketTransport for LoopbackTransport {
    async fn create_socket(&self, info: &SocketInfo) -> Result<i32> {
        let mut state = self.state.lock();
        state.next_socket_id += 1;
        let socket_id = state.next_socket_id;
        state.sockets.insert(
            socket_id,
            SocketRec {
                name: info.name.clone(),
                peer_name: info.peer_name.clone(),
            },
        );
        tracing::debug!(socket_id, name = %info.name, "loopback socket created");
        Ok(socket_id)
    }

    async fn listen(
        &self,
        socket_id: i32,
        _qos: &[QosTv],
        events: Arc<dyn SocketEvents>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let name = state
            .sockets
            .get(&socket_id)
            .map(|rec| rec.name.clone())
            .ok_or(CollabError::InvalidSocketId(socket_id))?;
        state.listeners.insert(name.clone(), socket_id);
        state.sinks.insert(socket_id, events);
        tracing::debug!(socket_id, name = %name, "loopback listening");
        Ok(())
    }

    async fn bind(
        &self,
        socket_id: i32,
        _qos: &[QosTv],
        events: Arc<dyn SocketEvents>,
    ) -> Result<()> {
        let (accepted_id, server_sink, peer_info) = {
            let mut state = self.state.lock();
            if state.fail_binds {
                return Err(CollabError::BindSocketFailed("injected failure".into()));
            }
            let rec = state
                .sockets
                .get(&socket_id)
                .cloned()
                .ok_or(CollabError::InvalidSocketId(socket_id))?;
            let server_id = *state.listeners.get(&rec.peer_name).ok_or_else(|| {
                CollabError::BindSocketFailed(format!("no listener named {}", rec.peer_name))
            })?;
            let server_sink = state
                .sinks
                .get(&server_id)
                .cloned()
                .ok_or(CollabError::InvalidSocketId(server_id))?;

            // Synthesize the accepted socket on the listening side.
            state.next_socket_id += 1;
            let accepted_id = state.next_socket_id;
            state.sockets.insert(
                accepted_id,
                SocketRec {
                    name: rec.peer_name.clone(),
                    peer_name: rec.name.clone(),
                },
            );
            state.sinks.insert(accepted_id, server_sink.clone());
            state.sinks.insert(socket_id, events);
            state.peers.insert(socket_id, accepted_id);
            state.peers.insert(accepted_id, socket_id);

            let peer_info = PeerSocketInfo {
                name: rec.name,
                network_id: "loopback".into(),
            };
            (accepted_id, server_sink, peer_info)
        };

        tracing::debug!(socket_id, accepted_id, "loopback bound");
        server_sink.on_bind(accepted_id, peer_info);
        Ok(())
    }

    async fn shutdown(&self, socket_id: i32) {
        let notify = {
            let mut state = self.state.lock();
            let Some(rec) = state.sockets.remove(&socket_id) else {
                return;
            };
            state.listeners.retain(|_, id| *id != socket_id);
            state.sinks.remove(&socket_id);
            if let Some(peer) = state.peers.remove(&socket_id) {
                state.peers.remove(&peer);
                state.sinks.get(&peer).cloned().map(|sink| (peer, sink))
            } else {
                tracing::debug!(socket_id, name = %rec.name, "loopback socket closed");
                None
            }
        };
        if let Some((peer, sink)) = notify {
            sink.on_shutdown(peer, ShutdownReason::PeerClosed);
        }
    }

    async fn send_bytes(&self, socket_id: i32, data: &[u8]) -> Result<()> {
        let max = self.state.lock().max_send_size;
        if data.len() > max {
            return Err(CollabError::SendFailed(format!(
                "payload {} exceeds max send size {max}",
                data.len()
            )));
        }
        let (peer, sink) = self.peer_sink(socket_id)?;
        sink.on_bytes(peer, data);
        Ok(())
    }

    async fn send_message(&self, socket_id: i32, data: &[u8]) -> Result<()> {
        let (peer, sink) = self.peer_sink(socket_id)?;
        sink.on_message(peer, data);
        Ok(())
    }

    async fn send_stream(&self, socket_id: i32, frame: &[u8], ext_json: &str) -> Result<()> {
        let (peer, sink) = self.peer_sink(socket_id)?;
        sink.on_stream(peer, frame, ext_json);
        Ok(())
    }

    async fn send_file(
        &self,
        socket_id: i32,
        sources: &[String],
        destinations: &[String],
    ) -> Result<()> {
        let (peer, peer_sink) = self.peer_sink(socket_id)?;
        let local_sink = self
            .state
            .lock()
            .sinks
            .get(&socket_id)
            .cloned()
            .ok_or(CollabError::InvalidSocketId(socket_id))?;

        // Resolve destinations under the receiver's configured path.
        let recv_root = peer_sink.recv_path(peer);
        let resolved: Vec<String> = destinations
            .iter()
            .map(|dst| match &recv_root {
                Some(root) => root.join(dst).to_string_lossy().into_owned(),
                None => dst.clone(),
            })
            .collect();

        peer_sink.on_file_event(
            peer,
            &FileInfo {
                common_info: FileCommonInfo {
                    event_type: ChannelFileEvent::RecvStart,
                    file_list: resolved.clone(),
                    file_cnt: resolved.len() as u32,
                },
                send_info: None,
                recv_info: Some(FileRecvInfo::default()),
                error_info: None,
            },
        );
        peer_sink.on_file_event(
            peer,
            &FileInfo {
                common_info: FileCommonInfo {
                    event_type: ChannelFileEvent::RecvFinish,
                    file_list: resolved,
                    file_cnt: destinations.len() as u32,
                },
                send_info: None,
                recv_info: Some(FileRecvInfo::default()),
                error_info: None,
            },
        );
        local_sink.on_file_event(
            socket_id,
            &FileInfo {
                common_info: FileCommonInfo {
                    event_type: ChannelFileEvent::SendFinish,
                    file_list: sources.to_vec(),
                    file_cnt: sources.len() as u32,
                },
                send_info: Some(FileSendInfo::default()),
                recv_info: None,
                error_info: None,
            },
        );
        Ok(())
    }

    async fn max_send_size(&self, _socket_id: i32) -> Result<usize> {
        Ok(self.state.lock().max_send_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransDataType;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        binds: AtomicI32,
        bytes: Mutex<Vec<Vec<u8>>>,
        shutdowns: AtomicI32,
    }

    impl SocketEvents for RecordingSink {
        fn on_bind(&self, _socket_id: i32, _peer: PeerSocketInfo) {
            self.binds.fetch_add(1, Ordering::SeqCst);
        }
        fn on_shutdown(&self, _socket_id: i32, _reason: ShutdownReason) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        fn on_bytes(&self, _socket_id: i32, data: &[u8]) {
            self.bytes.lock().push(data.to_vec());
        }
        fn on_message(&self, _socket_id: i32, _data: &[u8]) {}
        fn on_stream(&self, _socket_id: i32, _frame: &[u8], _ext: &str) {}
        fn on_error(&self, _socket_id: i32, _code: i32) {}
        fn on_file_event(&self, _socket_id: i32, _info: &FileInfo) {}
        fn recv_path(&self, _socket_id: i32) -> Option<PathBuf> {
            None
        }
    }

    fn socket_info(name: &str, peer_name: &str) -> SocketInfo {
        SocketInfo {
            name: name.into(),
            peer_name: peer_name.into(),
            peer_network_id: "net".into(),
            pkg_name: "pkg".into(),
            data_type: TransDataType::Bytes,
        }
    }

    #[tokio::test]
    async fn test_bind_pairs_sockets_and_delivers_bytes() {
        let transport = LoopbackTransport::new();
        let server_sink = Arc::new(RecordingSink::default());
        let client_sink = Arc::new(RecordingSink::default());

        let server = transport
            .create_socket(&socket_info("srv", ""))
            .await
            .unwrap();
        transport
            .listen(server, &[], server_sink.clone())
            .await
            .unwrap();

        let client = transport
            .create_socket(&socket_info("cli", "srv"))
            .await
            .unwrap();
        transport.bind(client, &[], client_sink).await.unwrap();
        assert_eq!(server_sink.binds.load(Ordering::SeqCst), 1);

        transport.send_bytes(client, b"ping").await.unwrap();
        assert_eq!(server_sink.bytes.lock().as_slice(), &[b"ping".to_vec()]);
    }

    #[tokio::test]
    async fn test_bind_fails_without_listener() {
        let transport = LoopbackTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let client = transport
            .create_socket(&socket_info("cli", "nobody"))
            .await
            .unwrap();
        assert!(matches!(
            transport.bind(client, &[], sink).await,
            Err(CollabError::BindSocketFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_bind_failure() {
        let transport = LoopbackTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let server = transport
            .create_socket(&socket_info("srv", ""))
            .await
            .unwrap();
        transport.listen(server, &[], sink.clone()).await.unwrap();

        transport.set_fail_binds(true);
        let client = transport
            .create_socket(&socket_info("cli", "srv"))
            .await
            .unwrap();
        assert!(transport.bind(client, &[], sink).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_notifies_peer() {
        let transport = LoopbackTransport::new();
        let server_sink = Arc::new(RecordingSink::default());
        let client_sink = Arc::new(RecordingSink::default());

        let server = transport
            .create_socket(&socket_info("srv", ""))
            .await
            .unwrap();
        transport
            .listen(server, &[], server_sink.clone())
            .await
            .unwrap();
        let client = transport
            .create_socket(&socket_info("cli", "srv"))
            .await
            .unwrap();
        transport.bind(client, &[], client_sink).await.unwrap();

        transport.shutdown(client).await;
        assert_eq!(server_sink.shutdowns.load(Ordering::SeqCst), 1);
    }
}
