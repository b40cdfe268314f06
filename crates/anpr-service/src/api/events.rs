//! WebSocket feed of service notifications (saved plates).

use crate::notifier::Notification;
use crate::state::AnprState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AnprState>) -> Response {
    // subscribed before the upgrade completes
    let events = state.events().subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, events))
}

async fn forward_events(socket: WebSocket, mut events: broadcast::Receiver<Notification>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(notification) => {
                    let Ok(text) = serde_json::to_string(&notification) else {
                        continue;
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagging, notifications dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("event subscriber disconnected");
}
