//! WebSocket sync client.
//!
//! Holds one local replica per joined document. Incoming `Sync`, `Update`
//! and `Diff` frames are merged into the replica before the matching
//! [`SyncEvent`] is emitted, so the replica is current when the event is seen.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use quire_core::{Block, Document, DocumentId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::server::USER_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Full state from a join was merged into the replica
    Synced { document_id: DocumentId },
    /// Another peer's delta was merged into the replica
    RemoteUpdate { document_id: DocumentId, seq: u64 },
    /// The server accepted one of our deltas
    Acked { document_id: DocumentId, seq: u64 },
    /// Reply to `request_diff` was merged into the replica
    Diff { document_id: DocumentId },
    Error {
        document_id: DocumentId,
        code: u16,
        message: String,
    },
    Pong,
}

type Replicas = Arc<RwLock<HashMap<DocumentId, Arc<Document>>>>;

pub struct SyncClient {
    user: UserId,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    replicas: Replicas,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(user: UserId, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replicas: Arc::new(RwLock::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self.server_url.as_str().into_client_request()?;
        let user = HeaderValue::from_str(self.user.as_str())
            .map_err(|e| ProtocolError::Serialization(format!("invalid user id header: {e}")))?;
        request.headers_mut().insert(USER_HEADER, user);

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        info!("Connected to {} as {}", self.server_url, self.user);

        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        let replicas = Arc::clone(&self.replicas);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => {
                                if let Some(event) = handle_incoming(&replicas, sync_msg).await {
                                    let _ = event_tx.send(event).await;
                                }
                            }
                            Err(e) => warn!("Undecodable frame from server: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Pending outgoing frames are flushed first.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Local replica of a joined document.
    pub async fn document(&self, document_id: &DocumentId) -> Option<Arc<Document>> {
        self.replicas.read().await.get(document_id).cloned()
    }

    async fn replica(&self, document_id: &DocumentId) -> Arc<Document> {
        let mut replicas = self.replicas.write().await;
        Arc::clone(replicas.entry(document_id.clone()).or_default())
    }

    /// Subscribe to a document; the server answers with its full state.
    pub async fn join(&self, document_id: &DocumentId) -> Result<(), ProtocolError> {
        self.replica(document_id).await;
        self.send(SyncMessage::join(document_id)).await
    }

    pub async fn leave(&self, document_id: &DocumentId) -> Result<(), ProtocolError> {
        self.send(SyncMessage::leave(document_id)).await
    }

    /// Send a delta produced against the local replica.
    pub async fn push(&self, document_id: &DocumentId, delta: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::push(document_id, delta)).await
    }

    /// Insert a block locally and push the resulting delta.
    pub async fn insert_block(
        &self,
        document_id: &DocumentId,
        index: u32,
        block: &Block,
    ) -> Result<(), ProtocolError> {
        let delta = self.replica(document_id).await.insert_block(index, block);
        self.push(document_id, delta).await
    }

    /// Ask for everything the local replica is missing.
    pub async fn request_diff(&self, document_id: &DocumentId) -> Result<(), ProtocolError> {
        let state_vector = self.replica(document_id).await.state_vector();
        self.send(SyncMessage::request_diff(document_id, state_vector)).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(SyncMessage::ping()).await
    }
}

async fn handle_incoming(replicas: &Replicas, msg: SyncMessage) -> Option<SyncEvent> {
    let document_id = msg.document();
    let merge = |replica: Option<Arc<Document>>| match replica {
        Some(replica) => replica.apply_update(&msg.payload).map_err(|e| e.to_string()),
        None => Err("not joined".to_string()),
    };

    match msg.msg_type {
        MessageType::Sync | MessageType::Update | MessageType::Diff => {
            let replica = replicas.read().await.get(&document_id).cloned();
            if let Err(e) = merge(replica) {
                warn!("Dropping {:?} for {}: {}", msg.msg_type, document_id, e);
                return None;
            }
            Some(match msg.msg_type {
                MessageType::Sync => SyncEvent::Synced { document_id },
                MessageType::Update => SyncEvent::RemoteUpdate {
                    document_id,
                    seq: msg.seq,
                },
                _ => SyncEvent::Diff { document_id },
            })
        }
        MessageType::Ack => Some(SyncEvent::Acked {
            document_id,
            seq: msg.seq,
        }),
        MessageType::Error => Some(SyncEvent::Error {
            code: u16::try_from(msg.seq).unwrap_or(500),
            message: String::from_utf8_lossy(&msg.payload).into_owned(),
            document_id,
        }),
        MessageType::Pong => Some(SyncEvent::Pong),
        other => {
            debug!("Ignoring {:?} from server", other);
            None
        }
    }
}
