//! The thin WebSocket front door: accepts TCP connections, upgrades them,
//! extracts `/ws/{session_id}?user_id=` from the handshake request, and
//! wires each connection's receive/send halves to the [`Coordinator`].
//!
//! Grounded on the teacher's `websocket.rs: start()`/`handle_connection()`,
//! with the TLS wrapping dropped (it depended on a workspace-internal
//! `rust_ai_ide_security::tls_config` unavailable standalone, and §1 calls
//! the front door "thin...otherwise uninteresting").

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::coordinator::Coordinator;
use crate::messages::ServerMessage;

/// Parses the path and query string of a `/ws/{session_id}?user_id=...`
/// handshake request. Returns `None` if the path doesn't start with `/ws/`.
fn parse_connection_target(uri_path_and_query: &str) -> Option<(String, Option<String>)> {
    let rest = uri_path_and_query.strip_prefix("/ws/")?;
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    let session_id = path_part.trim_end_matches('/').to_string();
    if session_id.is_empty() {
        return None;
    }

    let user_id = query_part.and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "user_id" && !value.is_empty()).then(|| value.to_string())
        })
    });

    Some((session_id, user_id))
}

/// Binds `bind_address:port` and accepts connections until the process is
/// asked to shut down. Each accepted connection is handled on its own task
/// so one slow or misbehaving peer never blocks another.
pub async fn run(coordinator: Arc<Coordinator>, bind_address: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{bind_address}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    log::info!("collaboration server listening on {addr}");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, coordinator).await {
                log::warn!("connection from {peer_addr} ended with error: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    coordinator: Arc<Coordinator>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut target: Option<(String, Option<String>)> = None;
    let callback = |req: &Request, response: Response| {
        target = parse_connection_target(req.uri().path_and_query().map(|p| p.as_str()).unwrap_or(""));
        Ok(response)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some((session_id, user_id)) = target else {
        return Err("connection did not target /ws/{session_id}".into());
    };

    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let (connection_id, _user_id) = coordinator.connect(&session_id, user_id, tx).await?;

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(Message::Text(message.to_json())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                coordinator.handle(&session_id, connection_id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("websocket error on {session_id}/{connection_id}: {e}");
                coordinator.record_connection_error();
                break;
            }
        }
    }

    send_task.abort();
    coordinator.disconnect(&session_id, connection_id).await;
    Ok(())
}
