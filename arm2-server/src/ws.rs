//! WebSocket event streaming: one upgrade handler per client, with independent read and write
//! pumps so a slow client write never stalls the read side (and vice versa).

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use log::{debug, warn};
use serde::Deserialize;
use tokio::time::interval;

use arm2_session::{Event, EventKind};

use crate::state::AppState;

const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);
const WRITE_WAIT: Duration = Duration::from_secs(10);
const MAX_INBOUND_MESSAGE: usize = 8 * 1024;

#[derive(Deserialize)]
struct SubscribeMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "sessionId")]
    session_id: String,
    #[serde(default)]
    events: Vec<String>,
}

fn parse_event_kind(name: &str) -> Option<EventKind> {
    match name {
        "state" => Some(EventKind::State),
        "output" => Some(EventKind::Output),
        "event" => Some(EventKind::Event),
        _ => None,
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_INBOUND_MESSAGE).on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut current_sub_id: Option<u64> = None;
    let mut events_rx: Option<tokio::sync::mpsc::Receiver<Event>> = None;
    let mut ping_interval = interval(PING_PERIOD);
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(msg) = serde_json::from_str::<SubscribeMessage>(&text) {
                            if msg.kind == "subscribe" {
                                if let Some(id) = current_sub_id.take() {
                                    state.broadcaster.unsubscribe(id).await;
                                }
                                let type_filter: Vec<EventKind> =
                                    msg.events.iter().filter_map(|s| parse_event_kind(s)).collect();
                                let sub = state.broadcaster.subscribe(msg.session_id, type_filter).await;
                                current_sub_id = Some(sub.id);
                                events_rx = Some(sub.receiver);
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("websocket client closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("websocket read error: {e}");
                        break;
                    }
                    None => break,
                }
            }

            Some(event) = async {
                match events_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if tokio::time::timeout(WRITE_WAIT, socket.send(Message::Text(json))).await.is_err() {
                    warn!("websocket write deadline exceeded, dropping client");
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if last_pong.elapsed() > PONG_WAIT {
                    debug!("websocket client missed its pong window, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(id) = current_sub_id {
        state.broadcaster.unsubscribe(id).await;
    }
}
