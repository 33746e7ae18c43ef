#![deny(unused_must_use)]

//! "Bourse": a multi-client exchange server brokering trades in a single
//! fungible commodity.
//!
//! Clients connect over TCP, log in with a user name, and may then deposit
//! and withdraw funds, escrow and release inventory, post and cancel limit
//! orders, and query their status. A continuous double-auction matching
//! engine pairs crossing orders in the background and notifies everyone of
//! posts, trades and cancellations.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub mod app_cx;
pub use app_cx::AppCx;

pub mod client_registry;

pub mod config;
pub use config::Config;

pub mod ledger;
pub mod protocol;

mod server;

pub mod signal;
pub mod trader;
pub mod trading;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listen socket")]
    Bind(#[source] std::io::Error),
}

/// A bound exchange server, ready to serve.
pub struct Server {
    listener: TcpListener,
    cx: AppCx,
    matchmaker: JoinHandle<()>,
}

impl Server {
    /// Bind the listen socket and bring up the exchange state, including
    /// the matching worker.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen_address())
            .await
            .map_err(ServerError::Bind)?;
        let cx = AppCx::new();
        let matchmaker = trading::spawn_matchmaker(Arc::clone(&cx.exchange));
        Ok(Self {
            listener,
            cx,
            matchmaker,
        })
    }

    /// The address the listen socket actually bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and service clients until a shutdown is requested, then shut
    /// down gracefully: stop accepting, tell every connection to stop
    /// reading, wait for the servicing tasks to drain, and stop the
    /// matching worker.
    pub async fn serve(self, signals: signal::Signals) -> Result<(), ServerError> {
        let Server {
            listener,
            cx,
            matchmaker,
        } = self;

        tracing::info!(addr = ?listener.local_addr().ok(), "accepting connections");

        let hangup = signals.hangup();
        tokio::pin!(hangup);

        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, _)) => {
                        tokio::spawn(server::client_service(cx.clone(), stream));
                    }
                    Err(err) => {
                        tracing::warn!(?err, "failed to accept connection");
                    }
                },
                _ = &mut hangup => {
                    tracing::info!("shutdown requested");
                    break;
                }
            }
        }

        // attempt to shutdown gracefully
        drop(listener);
        cx.clients.shutdown_all();
        cx.clients.wait_for_empty().await;
        matchmaker.abort();

        tracing::info!(
            accounts = cx.ledger.len(),
            sessions = cx.traders.len(),
            "server terminated"
        );
        Ok(())
    }
}

/// Starts the exchange server: bind, then serve until shutdown.
pub fn start_server(
    config: Config,
    signals: signal::Signals,
) -> impl Future<Output = Result<(), ServerError>> {
    async move { Server::bind(&config).await?.serve(signals).await }
}
