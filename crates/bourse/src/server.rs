//! Per-client connection servicing: the read loop and request dispatch.
//!
//! One task runs here per connected client. The task owns the read half of
//! the stream; the write half is shared through the session's send lock so
//! that replies, notifications and broadcasts from other tasks interleave
//! safely. A client must log in before anything else; every request is
//! answered with an ACK carrying a status snapshot, or a NACK.

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::app_cx::AppCx;
use crate::protocol::{self, PacketType, Request, Timestamp};
use crate::trader::{PeerConn, Trader};

/// Answer on a connection that has no session yet (failed or missing login).
async fn send_nack_raw(conn: &PeerConn) {
    let mut writer = conn.lock().await;
    if let Err(err) =
        protocol::send_packet(&mut *writer, PacketType::Nack, Timestamp::now(), &[]).await
    {
        tracing::debug!(?err, "failed to send nack");
    }
}

/// Service one client connection until end-of-stream, a transport error, or
/// server shutdown. Consumes the stream; logs the session out on the way
/// out.
pub(crate) async fn client_service(cx: AppCx, stream: TcpStream) {
    let peer_addr = stream.peer_addr().ok();
    let mut handle = match cx.clients.register() {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(?peer_addr, %err, "dropping connection");
            return;
        }
    };
    tracing::info!(?peer_addr, id = handle.id, "client connected");

    let (mut reader, writer) = stream.into_split();
    let conn: PeerConn = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
    let mut session: Option<Arc<Trader>> = None;

    loop {
        let packet = tokio::select! {
            res = protocol::recv_packet(&mut reader) => res,
            _ = handle.shutdown.changed() => {
                tracing::debug!(id = handle.id, "connection told to shut down");
                break;
            }
        };
        let (header, payload) = match packet {
            Ok(packet) => packet,
            Err(err @ protocol::ProtocolError::UnknownType(_)) => {
                // the frame was consumed, the stream is still in sync
                tracing::debug!(id = handle.id, ?err, "unrecognized packet");
                match &session {
                    Some(trader) => {
                        let _ = trader.send_nack().await;
                    }
                    None => send_nack_raw(&conn).await,
                }
                continue;
            }
            Err(err) => {
                tracing::debug!(id = handle.id, ?err, "client read ended");
                break;
            }
        };
        match Request::decode(header.packet_type, &payload) {
            Ok(request) => handle_request(&cx, &conn, &mut session, request).await,
            Err(err) => {
                tracing::debug!(id = handle.id, ?err, "malformed request");
                match &session {
                    Some(trader) => {
                        let _ = trader.send_nack().await;
                    }
                    None => send_nack_raw(&conn).await,
                }
            }
        }
    }

    if let Some(trader) = session.take() {
        cx.traders.logout(&trader);
    }
    cx.clients.unregister(handle);
    tracing::info!(?peer_addr, "client disconnected");
}

async fn handle_request(
    cx: &AppCx,
    conn: &PeerConn,
    session: &mut Option<Arc<Trader>>,
    request: Request,
) {
    let Some(trader) = session else {
        // the only thing a connection without a session may do is log in
        match request {
            Request::Login(name) => match cx.traders.login(Arc::clone(conn), &name) {
                Ok(trader) => {
                    let _ = trader.send_ack(None).await;
                    *session = Some(trader);
                }
                Err(err) => {
                    tracing::debug!(%err, "login refused");
                    send_nack_raw(conn).await;
                }
            },
            _ => send_nack_raw(conn).await,
        }
        return;
    };

    match request {
        // logging in twice on one connection is refused without disturbing
        // the existing session
        Request::Login(_) => {
            let _ = trader.send_nack().await;
        }
        Request::Status => {
            let info = cx.exchange.status(Some(trader.account()));
            let _ = trader.send_ack(Some(&info)).await;
        }
        Request::Deposit(amount) => {
            trader.account().increase_balance(amount);
            let info = cx.exchange.status(Some(trader.account()));
            let _ = trader.send_ack(Some(&info)).await;
        }
        Request::Withdraw(amount) => match trader.account().decrease_balance(amount) {
            Ok(()) => {
                let info = cx.exchange.status(Some(trader.account()));
                let _ = trader.send_ack(Some(&info)).await;
            }
            Err(err) => {
                tracing::debug!(name = trader.name(), %err, "withdraw refused");
                let _ = trader.send_nack().await;
            }
        },
        Request::Escrow(quantity) => {
            trader.account().increase_inventory(quantity);
            let info = cx.exchange.status(Some(trader.account()));
            let _ = trader.send_ack(Some(&info)).await;
        }
        Request::Release(quantity) => match trader.account().decrease_inventory(quantity) {
            Ok(()) => {
                let info = cx.exchange.status(Some(trader.account()));
                let _ = trader.send_ack(Some(&info)).await;
            }
            Err(err) => {
                tracing::debug!(name = trader.name(), %err, "release refused");
                let _ = trader.send_nack().await;
            }
        },
        Request::Buy { quantity, price } => {
            match cx.exchange.post_buy(trader, quantity, price).await {
                Ok(id) => {
                    let mut info = cx.exchange.status(Some(trader.account()));
                    info.order_id = id.to_u32();
                    let _ = trader.send_ack(Some(&info)).await;
                }
                Err(err) => {
                    tracing::debug!(name = trader.name(), %err, "buy refused");
                    let _ = trader.send_nack().await;
                }
            }
        }
        Request::Sell { quantity, price } => {
            match cx.exchange.post_sell(trader, quantity, price).await {
                Ok(id) => {
                    let mut info = cx.exchange.status(Some(trader.account()));
                    info.order_id = id.to_u32();
                    let _ = trader.send_ack(Some(&info)).await;
                }
                Err(err) => {
                    tracing::debug!(name = trader.name(), %err, "sell refused");
                    let _ = trader.send_nack().await;
                }
            }
        }
        Request::Cancel(order_id) => match cx.exchange.cancel(trader, order_id).await {
            Ok(quantity) => {
                let mut info = cx.exchange.status(Some(trader.account()));
                info.order_id = order_id;
                info.quantity = quantity;
                let _ = trader.send_ack(Some(&info)).await;
            }
            Err(err) => {
                tracing::debug!(name = trader.name(), %err, "cancel refused");
                let _ = trader.send_nack().await;
            }
        },
    }
}
