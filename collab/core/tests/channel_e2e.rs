//! End-to-end channel scenarios over the loopback transport: two
//! channel managers, one acting as server and one as client, exchanging
//! messages, reassembled bytes frames, and stream frames.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use collab_core::{
    ChannelDataType, ChannelFileEvent, ChannelListener, ChannelManager, ChannelPeerInfo,
    CollabConfig, CollabError, DataBuffer, FileInfo, LoopbackTransport, MessageDataHeader,
    StreamData, StreamDataExt,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

/// Owner names mimic production: 64 hex-ish characters, no separators.
fn owner(tag: char) -> String {
    std::iter::repeat(tag).take(64).collect()
}

fn peer(owner_name: &str) -> ChannelPeerInfo {
    ChannelPeerInfo {
        peer_name: owner_name.to_string(),
        network_id: "net-loopback".into(),
    }
}

/// Listener that forwards every event into an inspectable queue.
enum Event {
    Connect(i32),
    Disconnect(i32),
    Message(i32, Vec<u8>),
    Bytes(i32, Vec<u8>),
    Stream(i32, Vec<u8>, StreamDataExt),
    Error(i32, CollabError),
    SendFile(i32, FileInfo),
    RecvFile(i32, FileInfo),
}

struct QueueListener {
    tx: mpsc::UnboundedSender<Event>,
    recv_dir: Option<PathBuf>,
}

impl QueueListener {
    fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx, recv_dir: None }
    }
}

impl ChannelListener for QueueListener {
    fn on_connect(&self, channel_id: i32) {
        let _ = self.tx.send(Event::Connect(channel_id));
    }
    fn on_dis_connect(&self, channel_id: i32) {
        let _ = self.tx.send(Event::Disconnect(channel_id));
    }
    fn on_message(&self, channel_id: i32, data: &Arc<DataBuffer>) {
        let _ = self
            .tx
            .send(Event::Message(channel_id, data.data().unwrap().to_vec()));
    }
    fn on_bytes(&self, channel_id: i32, data: &Arc<DataBuffer>) {
        let _ = self
            .tx
            .send(Event::Bytes(channel_id, data.data().unwrap().to_vec()));
    }
    fn on_stream(&self, channel_id: i32, data: &Arc<StreamData>) {
        let _ = self.tx.send(Event::Stream(
            channel_id,
            data.stream_data().data().unwrap().to_vec(),
            *data.ext(),
        ));
    }
    fn on_error(&self, channel_id: i32, error: &CollabError) {
        let _ = self.tx.send(Event::Error(channel_id, error.clone()));
    }
    fn on_send_file(&self, channel_id: i32, info: &FileInfo) {
        let _ = self.tx.send(Event::SendFile(channel_id, info.clone()));
    }
    fn on_recv_file(&self, channel_id: i32, info: &FileInfo) {
        let _ = self.tx.send(Event::RecvFile(channel_id, info.clone()));
    }
    fn recv_path(&self, _channel_id: i32) -> Option<PathBuf> {
        self.recv_dir.clone()
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

struct Pair {
    transport: Arc<LoopbackTransport>,
    server: Arc<ChannelManager>,
    client: Arc<ChannelManager>,
}

async fn connected_pair(data_type: ChannelDataType, channel_name: &str) -> (Pair, i32, i32) {
    let transport = Arc::new(LoopbackTransport::new());
    let config = CollabConfig::default();
    let server = ChannelManager::new(transport.clone(), &config);
    let client = ChannelManager::new(transport.clone(), &config);
    let server_owner = owner('a');
    let client_owner = owner('b');
    server.init(&server_owner).await.unwrap();
    client.init(&client_owner).await.unwrap();

    let server_channel = server
        .create_server_channel(channel_name, data_type, peer(&client_owner))
        .await
        .unwrap();
    let client_channel = client
        .create_client_channel(channel_name, data_type, peer(&server_owner))
        .await
        .unwrap();
    (
        Pair {
            transport,
            server,
            client,
        },
        server_channel,
        client_channel,
    )
}

#[tokio::test]
async fn message_payload_arrives_unchanged() {
    let (pair, server_channel, client_channel) =
        connected_pair(ChannelDataType::Message, "chan1").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn ChannelListener> = Arc::new(QueueListener::new(tx));
    pair.server
        .register_channel_listener(server_channel, &listener)
        .unwrap();

    pair.client.connect_channel(client_channel).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, Event::Connect(id) if id == server_channel));

    // Payload shaped like a session-level control message: TLV header
    // declaring a NORMAL message, then the body.
    let body = b"hello collaboration";
    let total_len = MessageDataHeader::HEADER_LEN + body.len();
    let header = MessageDataHeader::new(1, 0, total_len as u32);
    let mut payload = header.serialize().data().unwrap().to_vec();
    payload.extend_from_slice(body);

    pair.client
        .send_message(client_channel, Arc::new(DataBuffer::from_slice(&payload)))
        .unwrap();

    match next_event(&mut rx).await {
        Event::Message(id, received) => {
            assert_eq!(id, server_channel);
            assert_eq!(received, payload);
            let parsed = MessageDataHeader::deserialize(&received).unwrap();
            assert_eq!(parsed.data_type, 0);
            assert_eq!(parsed.total_len, total_len as u32);
        }
        _ => panic!("expected a message event"),
    }

    pair.client.deinit().await;
    pair.server.deinit().await;
}

#[tokio::test]
async fn fragmented_bytes_frame_reassembles() {
    let (pair, server_channel, client_channel) =
        connected_pair(ChannelDataType::Bytes, "bulk").await;
    // Force multi-packet frames.
    pair.transport.set_max_send_size(200);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn ChannelListener> = Arc::new(QueueListener::new(tx));
    pair.server
        .register_channel_listener(server_channel, &listener)
        .unwrap();

    pair.client.connect_channel(client_channel).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, Event::Connect(_)));

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 239) as u8).collect();
    pair.client
        .send_bytes(client_channel, Arc::new(DataBuffer::from_slice(&payload)))
        .unwrap();

    match next_event(&mut rx).await {
        Event::Bytes(id, received) => {
            assert_eq!(id, server_channel);
            assert_eq!(received, payload);
        }
        _ => panic!("expected a bytes event"),
    }

    pair.client.deinit().await;
    pair.server.deinit().await;
}

#[tokio::test]
async fn stream_frame_carries_its_extension() {
    let (pair, server_channel, client_channel) =
        connected_pair(ChannelDataType::VideoStream, "video").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn ChannelListener> = Arc::new(QueueListener::new(tx));
    pair.server
        .register_channel_listener(server_channel, &listener)
        .unwrap();

    pair.client.connect_channel(client_channel).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, Event::Connect(_)));

    let ext = StreamDataExt {
        index: 42,
        pts: 1_000_000,
        ..StreamDataExt::default()
    };
    let frame = StreamData::new(Arc::new(DataBuffer::from_slice(b"frame-0")), ext);
    pair.client
        .send_stream(client_channel, Arc::new(frame))
        .unwrap();

    match next_event(&mut rx).await {
        Event::Stream(id, payload, received_ext) => {
            assert_eq!(id, server_channel);
            assert_eq!(payload, b"frame-0");
            assert_eq!(received_ext.index, 42);
            assert_eq!(received_ext.pts, 1_000_000);
        }
        _ => panic!("expected a stream event"),
    }

    pair.client.deinit().await;
    pair.server.deinit().await;
}

#[tokio::test]
async fn connect_channel_fails_when_every_bind_fails() {
    let (pair, _server_channel, client_channel) =
        connected_pair(ChannelDataType::Message, "nobind").await;
    pair.transport.set_fail_binds(true);

    let err = pair.client.connect_channel(client_channel).await.unwrap_err();
    assert!(matches!(err, CollabError::ConnectChannelFailed(id) if id == client_channel));

    // After clearing the failure the same channel connects, and a
    // repeat call on the connected channel is a cheap success.
    pair.transport.set_fail_binds(false);
    pair.client.connect_channel(client_channel).await.unwrap();
    pair.client.connect_channel(client_channel).await.unwrap();

    pair.client.deinit().await;
    pair.server.deinit().await;
}

#[tokio::test]
async fn duplicate_listener_registration_delivers_once() {
    let (pair, server_channel, client_channel) =
        connected_pair(ChannelDataType::Message, "dup").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn ChannelListener> = Arc::new(QueueListener::new(tx));
    pair.server
        .register_channel_listener(server_channel, &listener)
        .unwrap();
    // Second registration of the same listener object is a no-op.
    pair.server
        .register_channel_listener(server_channel, &listener)
        .unwrap();

    pair.client.connect_channel(client_channel).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, Event::Connect(_)));

    let payload = DataBuffer::from_slice(b"once");
    pair.client
        .send_message(client_channel, Arc::new(payload))
        .unwrap();
    assert!(matches!(next_event(&mut rx).await, Event::Message(_, _)));

    // No duplicate delivery pending.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    pair.client.deinit().await;
    pair.server.deinit().await;
}

#[tokio::test]
async fn peer_shutdown_disconnects_and_deletes_channel() {
    let (pair, server_channel, client_channel) =
        connected_pair(ChannelDataType::Message, "bye").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn ChannelListener> = Arc::new(QueueListener::new(tx));
    pair.server
        .register_channel_listener(server_channel, &listener)
        .unwrap();

    pair.client.connect_channel(client_channel).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, Event::Connect(_)));

    // Client tears its channel down; the server side observes the
    // socket shutdown and reports a disconnect.
    pair.client.delete_channel(client_channel).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, Event::Disconnect(id) if id == server_channel));

    pair.client.deinit().await;
    pair.server.deinit().await;
}

#[tokio::test]
async fn file_transfer_reports_progress_and_recv_path() {
    let (pair, server_channel, client_channel) =
        connected_pair(ChannelDataType::File, "files").await;

    let recv_dir = tempfile::tempdir().unwrap();
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let server_listener: Arc<dyn ChannelListener> = Arc::new(QueueListener {
        tx: server_tx,
        recv_dir: Some(recv_dir.path().to_path_buf()),
    });
    pair.server
        .register_channel_listener(server_channel, &server_listener)
        .unwrap();

    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client_listener: Arc<dyn ChannelListener> = Arc::new(QueueListener::new(client_tx));
    pair.client
        .register_channel_listener(client_channel, &client_listener)
        .unwrap();

    pair.client.connect_channel(client_channel).await.unwrap();
    assert!(matches!(next_event(&mut server_rx).await, Event::Connect(_)));

    pair.client
        .send_file(
            client_channel,
            vec!["photo.jpg".into()],
            vec!["photo.jpg".into()],
        )
        .unwrap();

    // Receiver sees the transfer land under its configured path.
    match next_event(&mut server_rx).await {
        Event::RecvFile(id, info) => {
            assert_eq!(id, server_channel);
            assert_eq!(info.common_info.event_type, ChannelFileEvent::RecvStart);
            assert!(info.common_info.file_list[0].starts_with(recv_dir.path().to_str().unwrap()));
        }
        _ => panic!("expected a recv-file event"),
    }
    match next_event(&mut server_rx).await {
        Event::RecvFile(_, info) => {
            assert_eq!(info.common_info.event_type, ChannelFileEvent::RecvFinish);
        }
        _ => panic!("expected a recv-file event"),
    }

    // Sender sees its side finish.
    match next_event(&mut client_rx).await {
        Event::SendFile(id, info) => {
            assert_eq!(id, client_channel);
            assert_eq!(info.common_info.event_type, ChannelFileEvent::SendFinish);
            assert_eq!(info.common_info.file_list, vec!["photo.jpg".to_string()]);
        }
        _ => panic!("expected a send-file event"),
    }

    pair.client.deinit().await;
    pair.server.deinit().await;
}

#[tokio::test]
async fn invalid_send_is_rejected_synchronously() {
    let transport = Arc::new(LoopbackTransport::new());
    let manager = ChannelManager::new(transport, &CollabConfig::default());
    manager.init(&owner('c')).await.unwrap();

    let err = manager
        .send_message(1, Arc::new(DataBuffer::from_slice(b"x")))
        .unwrap_err();
    assert!(matches!(err, CollabError::InvalidChannelId(1)));

    let empty = Arc::new(DataBuffer::new(0));
    let err = manager.send_message(1500, empty).unwrap_err();
    assert!(matches!(err, CollabError::NullPointer));

    manager.deinit().await;
}

#[tokio::test]
async fn deinit_resets_id_counters() {
    let transport = Arc::new(LoopbackTransport::new());
    let manager = ChannelManager::new(transport, &CollabConfig::default());
    manager.init(&owner('d')).await.unwrap();

    let first = manager
        .create_server_channel("reset", ChannelDataType::Message, peer("peer"))
        .await
        .unwrap();
    manager.deinit().await;

    manager.init(&owner('d')).await.unwrap();
    let after_reset = manager
        .create_server_channel("reset", ChannelDataType::Message, peer("peer"))
        .await
        .unwrap();
    assert_eq!(first, after_reset);
    manager.deinit().await;
}
