use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::ledger::Account;
use crate::protocol::{NotifyInfo, PacketType, StatusInfo, Timestamp};
use crate::trader::{Trader, TraderRegistry};

use super::book::OrderBook;
use super::order::{Order, OrderId, OrderIdAllocator, OrderSide};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    #[error("order quantity must be nonzero")]
    ZeroQuantity,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("insufficient inventory")]
    InsufficientInventory,
    #[error("order book is full")]
    BookFull,
    #[error("order value overflows the funds type")]
    ValueOverflow,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    #[error("no such order")]
    NotFound,
    #[error("order posted by another trader")]
    NotOwner,
}

/// Everything the engine guards with its one lock: both books, the order-id
/// allocator and the last trade price.
#[derive(Debug)]
struct Books {
    bids: OrderBook,
    asks: OrderBook,
    ids: OrderIdAllocator,
    last_trade: Option<u32>,
}

impl Books {
    fn new() -> Self {
        Self {
            bids: OrderBook::new(),
            asks: OrderBook::new(),
            ids: OrderIdAllocator::new(),
            last_trade: None,
        }
    }

    fn book_mut(&mut self, side: OrderSide) -> &mut OrderBook {
        match side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        }
    }
}

/// The matching engine.
///
/// Posting and canceling mutate the books under the engine lock and return
/// quickly; the actual matching runs on the worker spawned by
/// [`spawn_matchmaker`], woken through the work signal. Notifications are
/// always sent after the lock has been released, so a slow peer cannot
/// stall posts, stats or other matches.
pub struct Exchange {
    traders: Arc<TraderRegistry>,
    books: Mutex<Books>,
    work: Notify,
}

/// Determine the price a crossed pair trades at.
///
/// The first trade in the market executes at the seller's price. Afterwards:
/// a last trade price inside the crossing interval is reused, one outside it
/// moves the trade to the nearer interval endpoint.
fn clearing_price(last_trade: Option<u32>, ask: u32, bid: u32) -> u32 {
    match last_trade {
        None => ask,
        Some(last) if ask <= last && last <= bid => last,
        Some(last) if last < ask => ask,
        Some(_) => bid,
    }
}

/// One executed match, captured under the engine lock and delivered after
/// it is released. Holds its own references to both sessions so neither can
/// be destroyed before its notification is written; `completed` keeps fully
/// filled orders (and the session references they own) alive until delivery
/// is done.
struct MatchStep {
    timestamp: Timestamp,
    buyer: Arc<Trader>,
    seller: Arc<Trader>,
    bought: NotifyInfo,
    sold: NotifyInfo,
    traded: NotifyInfo,
    completed: Vec<Order>,
}

impl MatchStep {
    async fn deliver(self, traders: &TraderRegistry) {
        if let Err(err) = self
            .buyer
            .send_at(PacketType::Bought, self.timestamp, &self.bought.to_bytes())
            .await
        {
            tracing::debug!(?err, buyer = self.buyer.name(), "failed to notify buyer");
        }
        if let Err(err) = self
            .seller
            .send_at(PacketType::Sold, self.timestamp, &self.sold.to_bytes())
            .await
        {
            tracing::debug!(?err, seller = self.seller.name(), "failed to notify seller");
        }
        let _ = traders
            .broadcast(PacketType::Traded, self.timestamp, &self.traded.to_bytes())
            .await;
        // completed orders, and the session references they hold, drop here
        drop(self.completed);
    }
}

impl Exchange {
    pub fn new(traders: Arc<TraderRegistry>) -> Self {
        Self {
            traders,
            books: Mutex::new(Books::new()),
            work: Notify::new(),
        }
    }

    /// Post a buy order: encumber `quantity * price` funds and rest the
    /// order on the bid book. Broadcasts POSTED on success.
    pub async fn post_buy(
        &self,
        trader: &Arc<Trader>,
        quantity: u32,
        price: u32,
    ) -> Result<OrderId, PostError> {
        let (id, info) = self.place(trader, OrderSide::Buy, quantity, price)?;
        self.work.notify_one();
        let _ = self
            .traders
            .broadcast(PacketType::Posted, Timestamp::now(), &info.to_bytes())
            .await;
        Ok(id)
    }

    /// Post a sell order: escrow `quantity` units of inventory and rest the
    /// order on the ask book. Broadcasts POSTED on success.
    pub async fn post_sell(
        &self,
        trader: &Arc<Trader>,
        quantity: u32,
        price: u32,
    ) -> Result<OrderId, PostError> {
        let (id, info) = self.place(trader, OrderSide::Sell, quantity, price)?;
        self.work.notify_one();
        let _ = self
            .traders
            .broadcast(PacketType::Posted, Timestamp::now(), &info.to_bytes())
            .await;
        Ok(id)
    }

    fn place(
        &self,
        trader: &Arc<Trader>,
        side: OrderSide,
        quantity: u32,
        price: u32,
    ) -> Result<(OrderId, NotifyInfo), PostError> {
        if quantity == 0 {
            return Err(PostError::ZeroQuantity);
        }

        let mut books = self.books.lock();
        let account = trader.account();
        match side {
            OrderSide::Buy => {
                let cost = quantity.checked_mul(price).ok_or(PostError::ValueOverflow)?;
                account
                    .decrease_balance(cost)
                    .map_err(|_| PostError::InsufficientFunds)?;
                if books.bids.is_full() {
                    account.increase_balance(cost);
                    return Err(PostError::BookFull);
                }
            }
            OrderSide::Sell => {
                account
                    .decrease_inventory(quantity)
                    .map_err(|_| PostError::InsufficientInventory)?;
                if books.asks.is_full() {
                    account.increase_inventory(quantity);
                    return Err(PostError::BookFull);
                }
            }
        }

        let id = books.ids.alloc();
        books.book_mut(side).push(Order {
            id,
            trader: Arc::clone(trader),
            price,
            remaining: quantity,
        });
        tracing::debug!(%id, ?side, quantity, price, name = trader.name(), "order posted");

        let info = match side {
            OrderSide::Buy => NotifyInfo {
                buyer: id.to_u32(),
                seller: 0,
                quantity,
                price,
            },
            OrderSide::Sell => NotifyInfo {
                buyer: 0,
                seller: id.to_u32(),
                quantity,
                price,
            },
        };
        Ok((id, info))
    }

    /// Cancel a resting order posted by `trader`. The remaining encumbrance
    /// is restored and the unfilled quantity returned. Broadcasts CANCELED
    /// on success.
    pub async fn cancel(&self, trader: &Arc<Trader>, raw_id: u32) -> Result<u32, CancelError> {
        let (canceled, info) = {
            let mut books = self.books.lock();
            let (side, index) = if let Some(index) = books.bids.position(raw_id) {
                (OrderSide::Buy, index)
            } else if let Some(index) = books.asks.position(raw_id) {
                (OrderSide::Sell, index)
            } else {
                return Err(CancelError::NotFound);
            };

            let book = books.book_mut(side);
            if !Arc::ptr_eq(&book.get(index).trader, trader) {
                return Err(CancelError::NotOwner);
            }
            let order = book.remove(index);
            let account = order.trader.account();
            let info = match side {
                OrderSide::Buy => {
                    account.increase_balance(order.price.saturating_mul(order.remaining));
                    NotifyInfo {
                        buyer: order.id.to_u32(),
                        seller: 0,
                        quantity: order.remaining,
                        price: order.price,
                    }
                }
                OrderSide::Sell => {
                    account.increase_inventory(order.remaining);
                    NotifyInfo {
                        buyer: 0,
                        seller: order.id.to_u32(),
                        quantity: order.remaining,
                        price: order.price,
                    }
                }
            };
            tracing::debug!(id = %order.id, ?side, name = trader.name(), "order canceled");
            (order.remaining, info)
            // the order, and the session reference it holds, drop here
        };

        let _ = self
            .traders
            .broadcast(PacketType::Canceled, Timestamp::now(), &info.to_bytes())
            .await;
        Ok(canceled)
    }

    /// Market and account snapshot, consistent with respect to matching: the
    /// account is read while the engine lock is held, so the reported
    /// bid/ask/last agree with the balance and inventory.
    pub fn status(&self, account: Option<&Account>) -> StatusInfo {
        let books = self.books.lock();
        let snapshot = account.map(Account::status).unwrap_or_default();
        StatusInfo {
            order_id: 0,
            quantity: 0,
            balance: snapshot.balance,
            inventory: snapshot.inventory,
            last: books.last_trade.unwrap_or(0),
            bid: books.bids.best_price(u32::max).unwrap_or(0),
            ask: books.asks.best_price(u32::min).unwrap_or(0),
        }
    }

    /// Execute matches until no crossing pair remains.
    pub(crate) async fn drain_matches(&self) {
        while let Some(step) = self.match_step() {
            step.deliver(&self.traders).await;
        }
    }

    /// Execute at most one match under the engine lock. The scan takes the
    /// first crossing pair in slot order; cascades are handled by the
    /// caller looping until this returns `None`.
    fn match_step(&self) -> Option<MatchStep> {
        let mut books = self.books.lock();
        let Books {
            bids,
            asks,
            last_trade,
            ..
        } = &mut *books;

        let mut crossing = None;
        'scan: for (ask_index, ask) in asks.iter().enumerate() {
            for (bid_index, bid) in bids.iter().enumerate() {
                if bid.price >= ask.price {
                    crossing = Some((ask_index, bid_index));
                    break 'scan;
                }
            }
        }
        let (ask_index, bid_index) = crossing?;

        let ask = asks.get_mut(ask_index);
        let bid = bids.get_mut(bid_index);
        let price = clearing_price(*last_trade, ask.price, bid.price);
        let quantity = ask.remaining.min(bid.remaining);

        let buyer_account = bid.trader.account();
        buyer_account.increase_inventory(quantity);
        ask.trader
            .account()
            .increase_balance(price.saturating_mul(quantity));
        if bid.price > price {
            // the buyer encumbered more than the trade cost
            buyer_account.increase_balance((bid.price - price).saturating_mul(quantity));
        }
        *last_trade = Some(price);

        bid.remaining -= quantity;
        ask.remaining -= quantity;

        let timestamp = Timestamp::now();
        let buy_id = bid.id.to_u32();
        let sell_id = ask.id.to_u32();
        let buyer = Arc::clone(&bid.trader);
        let seller = Arc::clone(&ask.trader);
        let bid_done = bid.remaining == 0;
        let ask_done = ask.remaining == 0;

        let mut completed = Vec::new();
        if bid_done {
            completed.push(bids.remove(bid_index));
        }
        if ask_done {
            completed.push(asks.remove(ask_index));
        }

        tracing::info!(
            buy = buy_id,
            sell = sell_id,
            price,
            quantity,
            "orders matched"
        );

        Some(MatchStep {
            timestamp,
            buyer,
            seller,
            bought: NotifyInfo {
                buyer: buy_id,
                seller: 0,
                quantity,
                price,
            },
            sold: NotifyInfo {
                buyer: 0,
                seller: sell_id,
                quantity,
                price,
            },
            traded: NotifyInfo {
                buyer: buy_id,
                seller: sell_id,
                quantity,
                price,
            },
            completed,
        })
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange").finish_non_exhaustive()
    }
}

/// Spawn the matching worker: a single long-lived task that waits on the
/// work signal and drains the books. Runs until aborted at shutdown; orders
/// still resting then are freed when the engine itself is dropped.
pub fn spawn_matchmaker(exchange: Arc<Exchange>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!("matchmaker running");
        loop {
            exchange.work.notified().await;
            exchange.drain_matches().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::trader::tests::sink_conn;
    use crate::trading::book::MAX_ORDERS;

    struct Fixture {
        traders: Arc<TraderRegistry>,
        exchange: Exchange,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(Ledger::new());
        let traders = Arc::new(TraderRegistry::new(ledger));
        let exchange = Exchange::new(Arc::clone(&traders));
        Fixture { traders, exchange }
    }

    impl Fixture {
        fn login(&self, name: &str) -> Arc<Trader> {
            self.traders.login(sink_conn(), name).unwrap()
        }
    }

    #[test]
    fn clearing_price_rule() {
        // first trade in the market executes at the ask
        assert_eq!(clearing_price(None, 95, 100), 95);
        // last inside the interval anchors the price
        assert_eq!(clearing_price(Some(95), 94, 98), 95);
        // last below the interval: ask endpoint
        assert_eq!(clearing_price(Some(90), 95, 100), 95);
        // last above the interval: bid endpoint
        assert_eq!(clearing_price(Some(120), 95, 100), 100);
        // endpoints are inside the interval
        assert_eq!(clearing_price(Some(95), 95, 100), 95);
        assert_eq!(clearing_price(Some(100), 95, 100), 100);
    }

    #[tokio::test]
    async fn exact_match_first_trade() {
        let fx = fixture();
        let alice = fx.login("alice");
        let bob = fx.login("bob");
        alice.account().increase_inventory(10);
        bob.account().increase_balance(1000);

        fx.exchange.post_sell(&alice, 10, 95).await.unwrap();
        fx.exchange.post_buy(&bob, 10, 100).await.unwrap();
        assert_eq!(bob.account().status().balance, 0);

        fx.exchange.drain_matches().await;

        assert_eq!(alice.account().status().balance, 950);
        assert_eq!(alice.account().status().inventory, 0);
        // refund of 10 * (100 - 95)
        assert_eq!(bob.account().status().balance, 50);
        assert_eq!(bob.account().status().inventory, 10);

        let status = fx.exchange.status(None);
        assert_eq!(status.last, 95);
        assert_eq!(status.bid, 0);
        assert_eq!(status.ask, 0);
    }

    #[tokio::test]
    async fn last_price_anchors_within_interval() {
        let fx = fixture();
        let alice = fx.login("alice");
        let bob = fx.login("bob");
        alice.account().increase_inventory(10);
        bob.account().increase_balance(1000);
        fx.exchange.post_sell(&alice, 10, 95).await.unwrap();
        fx.exchange.post_buy(&bob, 10, 100).await.unwrap();
        fx.exchange.drain_matches().await;
        assert_eq!(fx.exchange.status(None).last, 95);

        alice.account().increase_inventory(10);
        bob.account().increase_balance(1000);
        fx.exchange.post_sell(&alice, 10, 94).await.unwrap();
        fx.exchange.post_buy(&bob, 10, 98).await.unwrap();
        fx.exchange.drain_matches().await;

        // 95 lies in [94, 98], so the trade executes at 95 again
        assert_eq!(fx.exchange.status(None).last, 95);
        assert_eq!(alice.account().status().balance, 950 + 950);
        // encumbered 980, refunded 10 * (98 - 95)
        assert_eq!(bob.account().status().balance, 50 + 20 + 30);
        assert_eq!(bob.account().status().inventory, 20);
    }

    #[tokio::test]
    async fn last_price_above_interval_trades_at_bid() {
        let fx = fixture();
        let carol = fx.login("carol");
        let dave = fx.login("dave");
        carol.account().increase_inventory(5);
        dave.account().increase_balance(600);
        fx.exchange.post_sell(&carol, 5, 120).await.unwrap();
        fx.exchange.post_buy(&dave, 5, 120).await.unwrap();
        fx.exchange.drain_matches().await;
        assert_eq!(fx.exchange.status(None).last, 120);

        let alice = fx.login("alice");
        let bob = fx.login("bob");
        alice.account().increase_inventory(10);
        bob.account().increase_balance(1000);
        fx.exchange.post_sell(&alice, 10, 95).await.unwrap();
        fx.exchange.post_buy(&bob, 10, 100).await.unwrap();
        fx.exchange.drain_matches().await;

        // 120 > 100, so the trade executes at the bid endpoint
        assert_eq!(fx.exchange.status(None).last, 100);
        assert_eq!(alice.account().status().balance, 1000);
        // no refund for the buyer
        assert_eq!(bob.account().status().balance, 0);
        assert_eq!(bob.account().status().inventory, 10);
    }

    #[tokio::test]
    async fn partial_fill_leaves_residual_resting() {
        let fx = fixture();
        let alice = fx.login("alice");
        let bob = fx.login("bob");
        alice.account().increase_inventory(5);
        bob.account().increase_balance(1000);

        fx.exchange.post_sell(&alice, 5, 100).await.unwrap();
        fx.exchange.post_buy(&bob, 10, 100).await.unwrap();
        fx.exchange.drain_matches().await;

        assert_eq!(bob.account().status().inventory, 5);
        assert_eq!(alice.account().status().balance, 500);
        // the residual 5 @ 100 buy order still rests
        let status = fx.exchange.status(Some(bob.account()));
        assert_eq!(status.bid, 100);
        assert_eq!(status.ask, 0);
        assert_eq!(status.balance, 0);

        // nothing more to match
        fx.exchange.drain_matches().await;
        assert_eq!(fx.exchange.status(None).bid, 100);
    }

    #[tokio::test]
    async fn cancel_restores_encumbrance() {
        let fx = fixture();
        let bob = fx.login("bob");
        bob.account().increase_balance(5000);

        let id = fx.exchange.post_buy(&bob, 10, 100).await.unwrap();
        assert_eq!(bob.account().status().balance, 4000);

        let canceled = fx.exchange.cancel(&bob, id.to_u32()).await.unwrap();
        assert_eq!(canceled, 10);
        assert_eq!(bob.account().status().balance, 5000);
        assert_eq!(fx.exchange.status(None).bid, 0);

        // the order is gone
        assert_eq!(
            fx.exchange.cancel(&bob, id.to_u32()).await,
            Err(CancelError::NotFound)
        );
    }

    #[tokio::test]
    async fn cancel_by_non_owner_fails() {
        let fx = fixture();
        let trader1 = fx.login("trader1");
        let trader2 = fx.login("trader2");
        trader1.account().increase_balance(1000);

        let id = fx.exchange.post_buy(&trader1, 10, 100).await.unwrap();
        assert_eq!(
            fx.exchange.cancel(&trader2, id.to_u32()).await,
            Err(CancelError::NotOwner)
        );
        // still encumbered and still visible
        assert_eq!(trader1.account().status().balance, 0);
        assert_eq!(fx.exchange.status(None).bid, 100);
    }

    #[tokio::test]
    async fn cancel_sell_restores_inventory() {
        let fx = fixture();
        let alice = fx.login("alice");
        alice.account().increase_inventory(7);

        let id = fx.exchange.post_sell(&alice, 7, 50).await.unwrap();
        assert_eq!(alice.account().status().inventory, 0);

        let canceled = fx.exchange.cancel(&alice, id.to_u32()).await.unwrap();
        assert_eq!(canceled, 7);
        assert_eq!(alice.account().status().inventory, 7);
    }

    #[tokio::test]
    async fn zero_quantity_post_is_rejected() {
        let fx = fixture();
        let bob = fx.login("bob");
        bob.account().increase_balance(1000);
        assert_eq!(
            fx.exchange.post_buy(&bob, 0, 100).await,
            Err(PostError::ZeroQuantity)
        );
        assert_eq!(bob.account().status().balance, 1000);
    }

    #[tokio::test]
    async fn insufficient_funds_post_leaves_no_trace() {
        let fx = fixture();
        let bob = fx.login("bob");
        bob.account().increase_balance(999);
        assert_eq!(
            fx.exchange.post_buy(&bob, 10, 100).await,
            Err(PostError::InsufficientFunds)
        );
        assert_eq!(bob.account().status().balance, 999);
        assert_eq!(fx.exchange.status(None).bid, 0);

        assert_eq!(
            fx.exchange.post_sell(&bob, 1, 100).await,
            Err(PostError::InsufficientInventory)
        );
    }

    #[tokio::test]
    async fn full_book_post_is_refused_and_refunded() {
        let fx = fixture();
        let bob = fx.login("bob");
        bob.account().increase_balance(MAX_ORDERS as u32 + 1);
        for _ in 0..MAX_ORDERS {
            fx.exchange.post_buy(&bob, 1, 1).await.unwrap();
        }
        assert_eq!(bob.account().status().balance, 1);

        assert_eq!(
            fx.exchange.post_buy(&bob, 1, 1).await,
            Err(PostError::BookFull)
        );
        // the encumbrance was refunded
        assert_eq!(bob.account().status().balance, 1);

        // the ask book has its own capacity; price chosen so nothing crosses
        let alice = fx.login("alice");
        alice.account().increase_inventory(MAX_ORDERS as u32 + 1);
        for _ in 0..MAX_ORDERS {
            fx.exchange.post_sell(&alice, 1, u32::MAX).await.unwrap();
        }
        assert_eq!(
            fx.exchange.post_sell(&alice, 1, u32::MAX).await,
            Err(PostError::BookFull)
        );
        assert_eq!(alice.account().status().inventory, 1);
    }

    #[tokio::test]
    async fn order_value_overflow_is_rejected() {
        let fx = fixture();
        let bob = fx.login("bob");
        bob.account().increase_balance(u32::MAX);
        assert_eq!(
            fx.exchange.post_buy(&bob, u32::MAX, 2).await,
            Err(PostError::ValueOverflow)
        );
        assert_eq!(bob.account().status().balance, u32::MAX);
    }

    #[tokio::test]
    async fn order_ids_are_unique_and_increasing_across_books() {
        let fx = fixture();
        let alice = fx.login("alice");
        alice.account().increase_inventory(10);
        alice.account().increase_balance(1000);

        let sell = fx.exchange.post_sell(&alice, 10, 200).await.unwrap();
        let buy = fx.exchange.post_buy(&alice, 10, 100).await.unwrap();
        assert_eq!(sell.to_u32(), 1);
        assert_eq!(buy.to_u32(), 2);
    }

    #[tokio::test]
    async fn resting_order_survives_poster_logout() {
        let fx = fixture();
        let alice = fx.login("alice");
        let bob = fx.login("bob");
        alice.account().increase_inventory(10);
        bob.account().increase_balance(1000);

        fx.exchange.post_sell(&alice, 10, 95).await.unwrap();
        let alice_account = Arc::clone(alice.account());
        fx.traders.logout(&alice);
        drop(alice);

        // the order still rests and still matches; the credit lands on the
        // (permanent) account
        fx.exchange.post_buy(&bob, 10, 100).await.unwrap();
        fx.exchange.drain_matches().await;
        assert_eq!(alice_account.status().balance, 950);
        assert_eq!(bob.account().status().inventory, 10);
    }
}
