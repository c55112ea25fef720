use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::info;

use super::AppState;
use crate::fanout::ObserverHub;

pub async fn poll_stats_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| observe(socket, hub))
}

async fn observe(socket: WebSocket, hub: Arc<ObserverHub>) {
    let (mut sender, mut receiver) = socket.split();
    let mut observer = hub.register();
    let id = observer.id;
    info!("Observer {} connected", id);

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = observer.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Observers only listen; drain their frames so pings and closes are seen
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unregister(id);
    info!("Observer {} disconnected", id);
}
