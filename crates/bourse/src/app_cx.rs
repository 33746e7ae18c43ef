//! The application context: one value holding references to every shared
//! subsystem, threaded through the servicing code instead of module-level
//! globals. Cloning is cheap; every clone refers to the same state.

use std::sync::Arc;

use crate::client_registry::ClientRegistry;
use crate::ledger::Ledger;
use crate::trader::TraderRegistry;
use crate::trading::Exchange;

#[derive(Debug, Clone)]
pub struct AppCx {
    pub ledger: Arc<Ledger>,
    pub traders: Arc<TraderRegistry>,
    pub exchange: Arc<Exchange>,
    pub clients: Arc<ClientRegistry>,
}

impl AppCx {
    pub fn new() -> Self {
        let ledger = Arc::new(Ledger::new());
        let traders = Arc::new(TraderRegistry::new(Arc::clone(&ledger)));
        let exchange = Arc::new(Exchange::new(Arc::clone(&traders)));
        Self {
            ledger,
            traders,
            exchange,
            clients: Arc::new(ClientRegistry::new()),
        }
    }
}

impl Default for AppCx {
    fn default() -> Self {
        Self::new()
    }
}
