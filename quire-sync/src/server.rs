//! WebSocket realtime port.
//!
//! ```text
//! Client A ──┐                      ┌── SyncEngine ── DocumentRegistry ── stores
//!            ├── connection task ───┤
//! Client B ──┘        ▲             └── RoomManager ── BroadcastGroup (per document)
//!                     │                                     │
//!                     └──────── forwarder task ◄────────────┘
//!                               (one per joined document)
//! ```
//!
//! One task per connection reads frames and answers requests directly. Each
//! joined document gets a forwarder task that relays room events into the
//! connection's outbound queue, skipping the connection's own events.
//! Nothing about a connection is durable: disconnecting leaves every room.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use quire_core::{DocumentId, UserId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{PeerInfo, RoomEvent, RoomManager};
use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::protocol::{MessageType, ProtocolError, SyncMessage};

/// Handshake header carrying the authenticated user id.
pub const USER_HEADER: &str = "x-user-id";

/// Frames buffered per connection between forwarders and the socket.
const OUTBOUND_BUFFER: usize = 256;

pub struct RealtimeServer {
    engine: Arc<SyncEngine>,
    rooms: Arc<RoomManager>,
}

impl RealtimeServer {
    pub fn new(engine: Arc<SyncEngine>, rooms: Arc<RoomManager>) -> Self {
        Self { engine, rooms }
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProtocolError> {
        info!("Realtime server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");

            let engine = Arc::clone(&self.engine);
            let rooms = Arc::clone(&self.rooms);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, engine, rooms).await {
                    error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<SyncEngine>,
    rooms: Arc<RoomManager>,
) -> Result<(), ProtocolError> {
    let mut user = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            user = req
                .headers()
                .get(USER_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(UserId::new);
            Ok(resp)
        },
    )
    .await?;
    let user = user.unwrap_or_else(UserId::anonymous);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let mut session = Session {
        connection_id: Uuid::new_v4(),
        user,
        engine,
        rooms,
        outbound: outbound_tx,
        joined: HashMap::new(),
    };
    info!(
        "WebSocket connection {} established from {addr} for {}",
        session.connection_id, session.user
    );

    let result = pump(ws_stream, outbound_rx, &mut session).await;

    session.leave_all().await;
    info!("Connection {} from {addr} closed", session.connection_id);
    result
}

/// Read loop: requests from the socket, relayed frames from forwarders.
async fn pump(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut outbound_rx: mpsc::Receiver<Arc<Vec<u8>>>,
    session: &mut Session,
) -> Result<(), ProtocolError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let reply = match SyncMessage::decode(&bytes) {
                            Ok(request) => session.handle(request).await,
                            Err(e) => {
                                warn!("Undecodable frame on {}: {e}", session.connection_id);
                                Some(SyncMessage::error(&DocumentId::new(""), 400, &e.to_string()))
                            }
                        };
                        if let Some(reply) = reply {
                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {e}", session.connection_id);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }
            Some(frame) = outbound_rx.recv() => {
                ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
            }
        }
    }
}

/// Per-connection state. Lives only as long as the socket.
struct Session {
    connection_id: Uuid,
    user: UserId,
    engine: Arc<SyncEngine>,
    rooms: Arc<RoomManager>,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
    joined: HashMap<DocumentId, JoinHandle<()>>,
}

impl Session {
    async fn handle(&mut self, request: SyncMessage) -> Option<SyncMessage> {
        let document_id = request.document();
        let result = match request.msg_type {
            MessageType::Join => self.join(&document_id).await.map(Some),
            MessageType::Leave => {
                self.leave(&document_id).await;
                Ok(None)
            }
            MessageType::Push => self.push(&document_id, request.payload).await.map(Some),
            MessageType::RequestDiff => self
                .engine
                .authorized_diff(&self.user, &document_id, Some(&request.payload))
                .await
                .map(|delta| Some(SyncMessage::diff(&document_id, delta))),
            MessageType::Ping => Ok(Some(SyncMessage::pong())),
            other => {
                debug!("Ignoring {:?} from client {}", other, self.connection_id);
                return Some(SyncMessage::error(
                    &document_id,
                    400,
                    &format!("unexpected message type {other:?}"),
                ));
            }
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!("{:?} on {} from {} failed: {}", request.msg_type, document_id, self.user, e);
                Some(SyncMessage::error(&document_id, e.code(), &e.to_string()))
            }
        }
    }

    /// Subscribe first, then send the full state, so no delta applied in
    /// between is missed. Deltas already contained in the state arrive twice
    /// and merge idempotently.
    async fn join(&mut self, document_id: &DocumentId) -> SyncResult<SyncMessage> {
        self.engine.authorize_read(&self.user, document_id).await?;
        if !self.joined.contains_key(document_id) {
            let info = PeerInfo {
                connection_id: self.connection_id,
                user_id: self.user.clone(),
            };
            let rx = self.rooms.subscribe(document_id, info).await;
            let forwarder = spawn_forwarder(self.connection_id, rx, self.outbound.clone());
            self.joined.insert(document_id.clone(), forwarder);
        }

        match self.engine.diff(document_id, None).await {
            Ok(state) => {
                info!("{} ({}) joined {}", self.user, self.connection_id, document_id);
                Ok(SyncMessage::sync(document_id, state))
            }
            Err(e) => {
                self.leave(document_id).await;
                Err(e)
            }
        }
    }

    async fn push(&self, document_id: &DocumentId, delta: Vec<u8>) -> SyncResult<SyncMessage> {
        let applied = self
            .engine
            .authorized_apply(&self.user, document_id, &delta)
            .await?;
        if let Err(e) = self
            .rooms
            .relay_update(self.connection_id, document_id, applied.seq, delta)
            .await
        {
            warn!("Could not relay update {} of {}: {}", applied.seq, document_id, e);
        }
        Ok(SyncMessage::ack(document_id, applied.seq))
    }

    async fn leave(&mut self, document_id: &DocumentId) {
        let Some(forwarder) = self.joined.remove(document_id) else {
            return;
        };
        forwarder.abort();
        if self.rooms.unsubscribe(document_id, &self.connection_id).await {
            debug!("Room {} removed (empty)", document_id);
        }
        info!("{} ({}) left {}", self.user, self.connection_id, document_id);
    }

    async fn leave_all(&mut self) {
        let documents: Vec<DocumentId> = self.joined.keys().cloned().collect();
        for document_id in &documents {
            self.leave(document_id).await;
        }
    }
}

fn spawn_forwarder(
    connection_id: Uuid,
    mut rx: broadcast::Receiver<RoomEvent>,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.origin == connection_id {
                        continue;
                    }
                    if outbound.send(event.frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Connection {connection_id} lagged by {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
