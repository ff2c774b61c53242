pub mod connection;

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::context::AppContext;
use crate::gateway;
use crate::message::{Frame, ServerEvent};
use crate::metrics;
use connection::ClientConnection;

pub type WebSocketStreamType = WebSocketStream<TcpStream>;

/// Drive one client connection: inbound frames are handled strictly in
/// arrival order; outbound events drain through the connection's channel.
pub async fn handle_websocket(ws_stream: WebSocketStreamType, addr: SocketAddr, ctx: AppContext) {
    metrics::CONNECTIONS_TOTAL.inc();
    let span = tracing::info_span!("websocket_connection", addr = %addr);
    let _enter = span.enter();

    tracing::info!("New connection from: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = ClientConnection::new(tx);

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => {
                                if !gateway::handle_frame(&mut conn, &ctx, frame).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Failed to parse frame from {}: {}", addr, e);
                                conn.send_error("INVALID_FORMAT", "invalid frame format");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_sender.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        tracing::info!("Connection closed by client: {}", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(ServerEvent::Close { code, reason }) => {
                        tracing::info!(code = %code, reason = %reason, "Closing connection");
                        let close_code = if code == "POLICY_VIOLATION" {
                            CloseCode::Policy
                        } else {
                            CloseCode::Normal
                        };
                        let _ = ws_sender
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: close_code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    Some(event) => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if ws_sender.send(WsMessage::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to serialize server event");
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // connection close cancels this session's pending work
    ctx.registry.remove(conn.session_id()).await;
    tracing::info!("Connection closed: {}", addr);
}
