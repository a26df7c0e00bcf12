use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tracing::{info, trace, warn};

use crate::router::MessageRouter;

/// Server pings every 15 seconds by default.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a closing connection waits for the frame it is handling.
const RECV_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping cadence and how many unanswered pings drop a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub max_missed_pongs: u8,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: HEARTBEAT_INTERVAL,
            max_missed_pongs: 2,
        }
    }
}

/// Drive one authenticated WebSocket until either side goes away.
///
/// The user is registered before the first frame is read, so anything sent
/// to them from that point on is queued for this socket.
pub async fn handle_connection(socket: WebSocket, router: MessageRouter, user_id: String, heartbeat: Heartbeat) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut frames) = router.connection_opened(&user_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Outbound: queued frames plus heartbeat pings
    let send_user = user_id.clone();
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat.interval);
        ticker.tick().await;
        let mut missed_pongs: u8 = 0;

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    // Channel closed: replaced by a newer connection, or shutdown
                    let Some(frame) = frame else {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };

                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(user_id = %send_user, kind = frame.kind(), error = %e, "Failed to encode frame");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_pongs = 0;
                    } else {
                        missed_pongs += 1;
                        if missed_pongs >= heartbeat.max_missed_pongs {
                            warn!(user_id = %send_user, missed_pongs, "Heartbeat timeout, dropping connection");
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Inbound: client frames go to the router one at a time, in order. A stop
    // request is only honoured between frames.
    let stop_recv = Arc::new(Notify::new());
    let recv_stop = stop_recv.clone();
    let recv_router = router.clone();
    let recv_user = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = recv_stop.notified() => break,
                next = receiver.next() => next,
            };
            let Some(Ok(msg)) = next else {
                break;
            };

            match msg {
                Message::Text(text) => recv_router.handle_text(&recv_user, text.as_str()).await,
                Message::Binary(data) => {
                    trace!(user_id = %recv_user, len = data.len(), "Ignoring binary frame");
                }
                Message::Pong(_) => pong_flag_recv.store(true, Ordering::Release),
                Message::Close(_) => break,
                // axum answers pings itself
                Message::Ping(_) => {}
            }
        }
    });

    let writer_ended = tokio::select! {
        _ = &mut send_task => true,
        _ = &mut recv_task => false,
    };

    if writer_ended {
        stop_recv.notify_one();
        if tokio::time::timeout(RECV_DRAIN_TIMEOUT, &mut recv_task).await.is_err() {
            warn!(user_id = %user_id, %conn_id, "Inbound frame still running at close, aborting");
            recv_task.abort();
        }
    } else {
        send_task.abort();
    }

    router.connection_closed(&user_id, conn_id);
    info!(user_id = %user_id, %conn_id, "Connection closed");
}
