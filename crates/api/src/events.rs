use crate::server::ApiState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, RawQuery, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use courier_fabric::ConnectionPool;
use courier_primitives::consts::fabric::{PING_INTERVAL, READ_DEADLINE};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Subscribe to a `contract/topic` channel. The connection joins the
/// topic's pool carrying its original query string as the delivery
/// predicate.
pub async fn handle_connection(
    ws: WebSocketUpgrade,
    Path((contract, topic)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    State(state): State<Arc<ApiState>>,
) -> Response {
    if contract.is_empty() || topic.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    match state.store.events.event_exists(&contract).await {
        Ok(true) => {}
        Ok(false) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!(error = %err, "error checking event registry");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let pool = state.fabric.connect(&format!("{contract}/{topic}"));
    let query = query.unwrap_or_default();

    ws.on_upgrade(move |socket| client_session(socket, pool, query))
}

/// Per-client loops: a writer pumping the pool's frames plus heartbeats,
/// and a reader enforcing the deadline and answering application pings.
async fn client_session(socket: WebSocket, pool: Arc<ConnectionPool>, query: String) {
    let Some(mut client) = pool.register(&query).await else {
        // The pool closed between connect and register; the client will
        // reconnect into a fresh one.
        return;
    };
    let client_id = client.id;

    let (mut sink, mut stream) = socket.split();
    let (control_tx, mut control_rx) = mpsc::channel::<Message>(8);

    let writer = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(PING_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                frame = client.frames.recv() => match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        // Evicted or pool shut down
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                },
                reply = control_rx.recv() => match reply {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    // Reader: any inbound frame (pongs included) refreshes the deadline.
    loop {
        let frame = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                debug!(client = client_id, "read deadline expired");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) if text == "ping" => {
                if control_tx.send(Message::Text("pong".to_string())).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    pool.unregister(client_id).await;
    writer.abort();
}
