use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use murmur_types::events::ServerEvent;
use murmur_types::models::{Tenant, User};

use crate::Gateway;
use crate::session::Session;

/// Drive an upgraded, already authenticated WebSocket until either side
/// goes away.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, tenant: Tenant, user: User) {
    let (mut sender, mut receiver) = socket.split();

    let (mut session, mut subscription) = match Session::open(gateway, tenant, user).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Could not open session: {}", e);
            let _ = send_event(&mut sender, &ServerEvent::error(e.client_message())).await;
            return;
        }
    };

    // Direct replies produced by the receive loop.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Forward channel publishes and direct replies -> client
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                published = subscription.recv() => {
                    let Some(payload) = published else { break };
                    if sender.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(event) = reply else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read client frames until close, error, or the send side failing
    loop {
        tokio::select! {
            _ = &mut send_task => break,
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    for reply in session.dispatch(text.as_str()).await {
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Ignoring binary frame from {}", session.user().external_id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("WebSocket error from {}: {}", session.user().external_id, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    send_task.abort();
    session.close().await;
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Could not encode {} event: {}", event.name(), e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
