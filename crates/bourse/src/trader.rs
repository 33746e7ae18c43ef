//! Logged-in trader sessions and packet delivery.
//!
//! A [`Trader`] ties a user name to its account and to the write side of the
//! client connection. Sessions are shared: the servicing task holds one
//! reference, every resting order holds one, and broadcast snapshots take
//! their own short-lived ones. A session is destroyed when the last
//! reference drops.
//!
//! Broadcast is two-phase: the live-session set is snapshotted under the
//! registry lock, then the lock is released before any packet is written.
//! The snapshot references keep sessions alive through concurrent logouts,
//! and a slow peer can only stall its own delivery, never login or logout.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::ledger::{Account, Ledger, LedgerError};
use crate::protocol::{self, PacketType, ProtocolError, StatusInfo, Timestamp};

/// The maximum number of concurrently logged-in traders.
pub const MAX_TRADERS: usize = 64;

/// Shared handle to the write side of a client connection.
///
/// The connection is created before login (failed logins are answered on it
/// directly) and the session created by login shares the same handle, so
/// every write to one peer is serialized by the same lock.
pub type PeerConn = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("user {0:?} is already logged in")]
    NameInUse(String),
    #[error("trader table is full")]
    Full,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A logged-in trader session.
pub struct Trader {
    name: String,
    account: Arc<Account>,
    conn: PeerConn,
}

impl Trader {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }

    /// Send one packet to this trader's client, stamped with the given
    /// timestamp. Writers are serialized by the session's send lock; a
    /// failed write is reported, not retried.
    pub async fn send_at(
        &self,
        packet_type: PacketType,
        timestamp: Timestamp,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut conn = self.conn.lock().await;
        protocol::send_packet(&mut *conn, packet_type, timestamp, payload).await
    }

    /// Send one packet stamped with the current time.
    pub async fn send(&self, packet_type: PacketType, payload: &[u8]) -> Result<(), ProtocolError> {
        self.send_at(packet_type, Timestamp::now(), payload).await
    }

    /// Send an ACK, optionally carrying a status payload.
    pub async fn send_ack(&self, info: Option<&StatusInfo>) -> Result<(), ProtocolError> {
        match info {
            Some(info) => self.send(PacketType::Ack, &info.to_bytes()).await,
            None => self.send(PacketType::Ack, &[]).await,
        }
    }

    /// Send a NACK.
    pub async fn send_nack(&self) -> Result<(), ProtocolError> {
        self.send(PacketType::Nack, &[]).await
    }
}

impl std::fmt::Debug for Trader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trader").field("name", &self.name).finish()
    }
}

/// The bounded registry of live trader sessions.
#[derive(Debug)]
pub struct TraderRegistry {
    ledger: Arc<Ledger>,
    traders: Mutex<AHashMap<String, Arc<Trader>>>,
}

impl TraderRegistry {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            traders: Mutex::new(AHashMap::new()),
        }
    }

    /// Log a trader in over the given connection. Fails if the name is
    /// already logged in, the table is full, or the account table is full.
    /// The returned reference is owned by the servicing task and released
    /// by [`TraderRegistry::logout`] plus the task's own drop.
    pub fn login(&self, conn: PeerConn, name: &str) -> Result<Arc<Trader>, LoginError> {
        let mut traders = self.traders.lock();
        if traders.contains_key(name) {
            return Err(LoginError::NameInUse(name.to_owned()));
        }
        if traders.len() >= MAX_TRADERS {
            return Err(LoginError::Full);
        }
        let account = self.ledger.lookup(name)?;
        let trader = Arc::new(Trader {
            name: name.to_owned(),
            account,
            conn,
        });
        traders.insert(name.to_owned(), Arc::clone(&trader));
        tracing::info!(name, "trader logged in");
        Ok(trader)
    }

    /// Log a trader out, dropping the registry's reference if the slot still
    /// holds this session. The caller's own reference drops when its task
    /// ends.
    pub fn logout(&self, trader: &Arc<Trader>) {
        let mut traders = self.traders.lock();
        if let Some(live) = traders.get(trader.name()) {
            if Arc::ptr_eq(live, trader) {
                traders.remove(trader.name());
                tracing::info!(name = trader.name(), "trader logged out");
            }
        }
    }

    /// Broadcast one packet to every logged-in trader. Every session is
    /// attempted; the error from a failed send is reported after the rest
    /// have been delivered.
    pub async fn broadcast(
        &self,
        packet_type: PacketType,
        timestamp: Timestamp,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let snapshot: Vec<Arc<Trader>> = {
            let traders = self.traders.lock();
            traders.values().cloned().collect()
        };

        let mut result = Ok(());
        for trader in snapshot {
            if let Err(err) = trader.send_at(packet_type, timestamp, payload).await {
                tracing::debug!(?err, name = trader.name(), "broadcast send failed");
                result = Err(err);
            }
        }
        result
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.traders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A connection whose peer discards everything.
    pub(crate) fn sink_conn() -> PeerConn {
        Arc::new(tokio::sync::Mutex::new(Box::new(tokio::io::sink())))
    }

    #[tokio::test]
    async fn login_logout_lifecycle() {
        let registry = TraderRegistry::new(Arc::new(Ledger::new()));
        let trader = registry.login(sink_conn(), "alice").unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(trader.name(), "alice");

        registry.logout(&trader);
        assert!(registry.is_empty());

        // the name is free again
        let again = registry.login(sink_conn(), "alice").unwrap();
        // and resolves to the same account as before
        assert!(Arc::ptr_eq(again.account(), trader.account()));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = TraderRegistry::new(Arc::new(Ledger::new()));
        let _alice = registry.login(sink_conn(), "alice").unwrap();
        assert!(matches!(
            registry.login(sink_conn(), "alice"),
            Err(LoginError::NameInUse(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn table_capacity_is_enforced() {
        let registry = TraderRegistry::new(Arc::new(Ledger::new()));
        let mut held = Vec::new();
        for i in 0..MAX_TRADERS {
            held.push(registry.login(sink_conn(), &format!("user{i}")).unwrap());
        }
        assert!(matches!(
            registry.login(sink_conn(), "one-too-many"),
            Err(LoginError::Full)
        ));

        // logging one out frees a slot
        registry.logout(&held[0]);
        registry.login(sink_conn(), "one-too-many").unwrap();
    }

    #[tokio::test]
    async fn session_outlives_logout_while_referenced() {
        let registry = TraderRegistry::new(Arc::new(Ledger::new()));
        let trader = registry.login(sink_conn(), "alice").unwrap();
        let extra = Arc::clone(&trader);
        registry.logout(&trader);
        drop(trader);
        // the extra reference still works
        extra.send_nack().await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session() {
        let registry = TraderRegistry::new(Arc::new(Ledger::new()));

        let (client_a, server_a) = tokio::io::duplex(256);
        let (client_b, server_b) = tokio::io::duplex(256);
        let conn_a: PeerConn = Arc::new(tokio::sync::Mutex::new(Box::new(server_a)));
        let conn_b: PeerConn = Arc::new(tokio::sync::Mutex::new(Box::new(server_b)));
        let _a = registry.login(conn_a, "alice").unwrap();
        let _b = registry.login(conn_b, "bob").unwrap();

        let timestamp = Timestamp { sec: 1, nsec: 2 };
        registry
            .broadcast(PacketType::Traded, timestamp, &[1, 2, 3, 4])
            .await
            .unwrap();

        for mut peer in [client_a, client_b] {
            let (header, payload) = protocol::recv_packet(&mut peer).await.unwrap();
            assert_eq!(header.packet_type, PacketType::Traded);
            assert_eq!(header.timestamp, timestamp);
            assert_eq!(payload, vec![1, 2, 3, 4]);
        }
    }
}
