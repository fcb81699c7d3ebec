use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::AppState;

/// Upgrade and relay every supervisor event to the dashboard client as one
/// JSON text frame. One-way: inbound frames are ignored.
/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_events(socket, state))
}

async fn relay_events(socket: WebSocket, state: AppState) {
    let mut events = state.vps_manager.subscribe();
    let (mut sink, mut stream) = socket.split();
    debug!("Dashboard client connected to event stream");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Delivery is best-effort; slow clients miss events.
                        warn!("Event relay lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    debug!("Dashboard client disconnected from event stream");
}
