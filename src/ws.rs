//! Per-connection WebSocket plumbing: one read loop feeding the dispatcher
//! and one write loop draining the hub's bounded outbound queue.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warp::ws::{Message, WebSocket};

use crate::errors::SfuError;
use crate::hub::{ClientHandle, HubFrame};
use crate::id_types::UserId;
use crate::messages::ErrorMessage;
use crate::metrics::SFU_CONNECTIONS_TOTAL;
use crate::orchestrator::{validate_id, Sfu};

/// `/ws?userId=<id>&name=<display>`
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub name: Option<String>,
}

pub async fn client_connected(sfu: Arc<Sfu>, socket: WebSocket, query: WsQuery) {
    SFU_CONNECTIONS_TOTAL.inc();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let user_id = query.user_id.unwrap_or_default();
    if let Err(err) = validate_id(&user_id, sfu.config.max_user_id_length, "userId") {
        let _ = ws_tx
            .send(Message::text(ErrorMessage::from_error(&err).to_text()))
            .await;
        let _ = ws_tx.send(Message::close()).await;
        return;
    }
    let display_name = query.name.unwrap_or_else(|| user_id.clone());

    let (client, outbound_rx) = ClientHandle::new(
        UserId::from(user_id.as_str()),
        display_name,
        sfu.config.rate_limit_per_sec,
        sfu.config.rate_limit_burst,
    );
    sfu.hub.register(client.clone());
    info!(client = %client.id, user = %user_id, "WebSocket client connected");

    let write_task = tokio::spawn(write_loop(
        ws_tx,
        outbound_rx,
        sfu.config.ws_ping_interval,
        sfu.config.ws_write_timeout,
    ));

    // Read loop. The pong deadline is refreshed by pongs; the hub's pings
    // keep a healthy client answering well inside it.
    let mut pong_deadline = Instant::now() + sfu.config.ws_pong_timeout;
    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(msg)) => {
                        if msg.is_pong() {
                            pong_deadline = Instant::now() + sfu.config.ws_pong_timeout;
                            continue;
                        }
                        if msg.is_ping() {
                            continue; // transport answers these itself
                        }
                        if msg.is_close() {
                            debug!(client = %client.id, "Client sent close");
                            break;
                        }
                        match msg.to_str() {
                            Ok(text) => {
                                if !sfu.dispatch(&client, text).await {
                                    break;
                                }
                            }
                            Err(()) => {
                                let err = SfuError::Validation("binary frames not supported".into());
                                sfu.hub.send_to_client(&client.id, &ErrorMessage::from_error(&err));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!(client = %client.id, error = %e, "WebSocket read error");
                        break;
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(pong_deadline) => {
                warn!(client = %client.id, "Pong deadline missed, dropping client");
                break;
            }
            _ = client.closed.notified() => {
                debug!(client = %client.id, "Client force-disconnected");
                break;
            }
        }
    }

    sfu.client_disconnected(&client).await;
    // The Close frame queued by unregister lets the write loop finish; if
    // the queue was wedged, the abort below reclaims it.
    let _ = tokio::time::timeout(sfu.config.ws_write_timeout, write_task).await;
    info!(client = %client.id, "WebSocket client disconnected");
}

/// Drains the outbound queue into the socket, emitting keepalive pings.
/// Each frame write is bounded by the configured deadline.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<HubFrame>,
    ping_interval: std::time::Duration,
    write_timeout: std::time::Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ping.tick().await;

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(HubFrame::Text(text)) => {
                        let send = ws_tx.send(Message::text(text));
                        match tokio::time::timeout(write_timeout, send).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(error = %e, "WebSocket write failed");
                                break;
                            }
                            Err(_) => {
                                warn!("WebSocket write deadline exceeded");
                                break;
                            }
                        }
                    }
                    Some(HubFrame::Close) => {
                        let _ = ws_tx.send(Message::close()).await;
                        break;
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                let send = ws_tx.send(Message::ping(Vec::new()));
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    _ => {
                        warn!("WebSocket ping failed");
                        break;
                    }
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}
