//! Bounded order book storage.
//!
//! A book is a bounded sequence of resting orders scanned in slot order.
//! No price ordering is maintained; the engine scans linearly.

use super::order::Order;

/// The maximum number of resting orders per book.
pub const MAX_ORDERS: usize = 4096;

#[derive(Debug, Default)]
pub struct OrderBook {
    orders: Vec<Order>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.orders.len() >= MAX_ORDERS
    }

    /// Append an order to the first free slot. Capacity is the caller's
    /// concern; it is checked before any resource is encumbered.
    pub fn push(&mut self, order: Order) {
        debug_assert!(self.orders.len() < MAX_ORDERS);
        self.orders.push(order);
    }

    /// Remove and return the order in the given slot, preserving the slot
    /// order of the rest.
    pub fn remove(&mut self, index: usize) -> Order {
        self.orders.remove(index)
    }

    pub fn get(&self, index: usize) -> &Order {
        &self.orders[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Order {
        &mut self.orders[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> + '_ {
        self.orders.iter()
    }

    /// Slot of the order with the given wire id, if it rests here.
    pub fn position(&self, raw_id: u32) -> Option<usize> {
        self.orders.iter().position(|order| order.id.to_u32() == raw_id)
    }

    /// Best price in this book under `better`, e.g. `max` for bids and
    /// `min` for asks. `None` when the book is empty.
    pub fn best_price<F>(&self, better: F) -> Option<u32>
    where
        F: Fn(u32, u32) -> u32,
    {
        self.orders
            .iter()
            .map(|order| order.price)
            .reduce(|best, price| better(best, price))
    }
}
