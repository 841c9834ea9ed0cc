//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the per-node matching engine: a price-time priority order
// book over two sorted collections of resting orders plus an append-only match
// history. The same structure doubles as the synchronization payload, so snapshots
// are always deep copies and both sides are kept in canonical order.
//
// | Component       | Description                                                        |
// |-----------------|--------------------------------------------------------------------|
// | OrderBook       | Owns active buy/sell orders and the match history                  |
// | AddOrderResult  | Outcome of one submission: matches produced + remainder            |
// | OrderBookState  | Deep-copy snapshot, also used as the sync wire payload             |
//
//--------------------------------------------------------------------------------------------------
// FUNCTIONS
//--------------------------------------------------------------------------------------------------
// | Name                  | Description                                | Return Type              |
// |-----------------------|--------------------------------------------|--------------------------|
// | add_order             | Match an incoming order, book remainder    | Result<AddOrderResult>   |
// | cancel_order          | Remove and cancel by id (no-op if unknown) | Result<Option<Order>>    |
// | state / set_state     | Snapshot and wholesale replacement         | OrderBookState / ()      |
// | find_order            | Linear id lookup across both sides         | Option<&Order>           |
// | record_match          | Append an externally announced match       | ()                       |
// | best_buy / best_sell  | Top of book per side                       | Option<&Order>           |
//--------------------------------------------------------------------------------------------------

use rust_decimal::Decimal;
use std::cmp::Ordering;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::types::{Order, OrderError, OrderMatch, OrderStatus, Side};

/// Errors raised by book operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderBookError {
    /// The submitted order is not in an active status.
    #[error("order {0} has status {1:?} and cannot be added to the book")]
    InactiveOrder(Uuid, OrderStatus),
    /// An order with the same id already rests in the book.
    #[error("order {0} already exists in the book")]
    DuplicateOrderId(Uuid),
    /// A cancel raced with a fill: the order reached a terminal status first.
    #[error("cancel rejected for order {id}: {source}")]
    CancelRejected {
        id: Uuid,
        #[source]
        source: OrderError,
    },
}

/// Outcome of a single submission to [`OrderBook::add_order`].
#[derive(Debug, Clone)]
pub struct AddOrderResult {
    /// The incoming order with its post-match amount and status.
    pub order: Order,
    /// Matches produced by this submission, in execution order (possibly empty).
    pub matches: Vec<OrderMatch>,
    /// Copy of the remainder now resting in the book; `None` if fully filled.
    pub resting: Option<Order>,
}

/// A deep-copy snapshot of the book: both resting collections in canonical order
/// plus the full match history. Never aliases the book's live collections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBookState {
    pub buy_orders: Vec<Order>,
    pub sell_orders: Vec<Order>,
    pub matches: Vec<OrderMatch>,
}

/// The matching engine for one node.
///
/// Buy orders are kept sorted by descending price, sell orders by ascending price,
/// both tie-broken by ascending timestamp and then by id. That ordering is both the
/// matching priority and the canonical snapshot order.
#[derive(Debug, Default)]
pub struct OrderBook {
    buy_orders: Vec<Order>,
    sell_orders: Vec<Order>,
    matches: Vec<OrderMatch>,
}

/// Priority for resting buy orders: highest price first, then oldest, then id.
fn buy_priority(a: &Order, b: &Order) -> Ordering {
    b.price()
        .cmp(&a.price())
        .then_with(|| a.timestamp().cmp(&b.timestamp()))
        .then_with(|| a.id().cmp(&b.id()))
}

/// Priority for resting sell orders: lowest price first, then oldest, then id.
fn sell_priority(a: &Order, b: &Order) -> Ordering {
    a.price()
        .cmp(&b.price())
        .then_with(|| a.timestamp().cmp(&b.timestamp()))
        .then_with(|| a.id().cmp(&b.id()))
}

impl OrderBook {
    /// Creates an empty order book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits an order: matches it against the opposite side in price-time
    /// priority and books any active remainder.
    ///
    /// # Arguments
    /// * `order` - The incoming order; must be active and carry an id unknown to the book
    ///
    /// # Returns
    /// An [`AddOrderResult`] with the post-match order, the matches produced and the
    /// booked remainder (`None` when the order filled completely).
    ///
    /// # Errors
    /// * `InactiveOrder` if the order is filled or cancelled
    /// * `DuplicateOrderId` if either side already holds the id
    pub fn add_order(&mut self, order: Order) -> Result<AddOrderResult, OrderBookError> {
        if !order.is_active() {
            return Err(OrderBookError::InactiveOrder(order.id(), order.status()));
        }
        if self.find_order(order.id()).is_some() {
            return Err(OrderBookError::DuplicateOrderId(order.id()));
        }

        let mut incoming = order;
        let mut matches = Vec::new();

        // Working copies of every resting order the incoming one could trade with.
        let mut candidates: Vec<Order> = self
            .side(incoming.side().opposite())
            .iter()
            .filter(|resting| resting.can_match_with(&incoming))
            .map(Order::snapshot)
            .collect();

        // Best price first; among equal prices the oldest resting order wins, and
        // equal timestamps fall back to the id so the outcome is reproducible.
        let incoming_side = incoming.side();
        candidates.sort_by(|a, b| {
            let by_price = match incoming_side {
                Side::Buy => a.price().cmp(&b.price()),
                Side::Sell => b.price().cmp(&a.price()),
            };
            by_price
                .then_with(|| a.timestamp().cmp(&b.timestamp()))
                .then_with(|| a.id().cmp(&b.id()))
        });

        for candidate in candidates {
            if !incoming.is_active() {
                break;
            }
            // Copies cannot normally go inactive mid-loop; tolerate it anyway
            // rather than failing the whole submission.
            if !candidate.is_active() {
                continue;
            }

            let matched_amount = incoming.amount().min(candidate.amount());
            // Price-taker convention: the resting order sets the execution price.
            let match_price = candidate.price();

            let (buy_copy, sell_copy) = match incoming.side() {
                Side::Buy => (incoming.snapshot(), candidate.snapshot()),
                Side::Sell => (candidate.snapshot(), incoming.snapshot()),
            };
            let record = match OrderMatch::new(buy_copy, sell_copy, matched_amount, match_price) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        incoming = %incoming.id(),
                        resting = %candidate.id(),
                        "skipping match that failed validation: {err}"
                    );
                    continue;
                }
            };

            self.matches.push(record.clone());
            matches.push(record);
            self.fill_resting(candidate.id(), candidate.side(), matched_amount);
            if let Err(err) = incoming.apply_fill(matched_amount) {
                warn!(order = %incoming.id(), "failed to fill incoming order: {err}");
                break;
            }
        }

        let resting = if incoming.is_active() {
            let remainder = incoming.snapshot();
            match incoming.side() {
                Side::Buy => self.buy_orders.push(remainder.clone()),
                Side::Sell => self.sell_orders.push(remainder.clone()),
            }
            Some(remainder)
        } else {
            None
        };

        self.resort();
        Ok(AddOrderResult {
            order: incoming,
            matches,
            resting,
        })
    }

    /// Applies a fill to the live resting order identified by `id`, removing it
    /// from its collection once fully filled.
    fn fill_resting(&mut self, id: Uuid, side: Side, amount: Decimal) {
        let orders = self.side_mut(side);
        let Some(pos) = orders.iter().position(|o| o.id() == id) else {
            warn!(order = %id, "resting order vanished before its fill was applied");
            return;
        };
        if let Err(err) = orders[pos].apply_fill(amount) {
            warn!(order = %id, "failed to fill resting order: {err}");
            return;
        }
        if orders[pos].status() == OrderStatus::Filled {
            orders.remove(pos);
        }
    }

    /// Cancels the order with the given id if it rests in the book.
    ///
    /// An unknown id is a silent no-op (`Ok(None)`), which keeps cancellation
    /// retries idempotent across nodes that may never have seen the order.
    ///
    /// # Errors
    /// * `CancelRejected` if the order had already reached a terminal fill
    pub fn cancel_order(&mut self, order_id: Uuid) -> Result<Option<Order>, OrderBookError> {
        for side in [Side::Buy, Side::Sell] {
            let orders = self.side_mut(side);
            if let Some(pos) = orders.iter().position(|o| o.id() == order_id) {
                let mut order = orders.remove(pos);
                order
                    .cancel()
                    .map_err(|source| OrderBookError::CancelRejected {
                        id: order_id,
                        source,
                    })?;
                return Ok(Some(order));
            }
        }
        Ok(None)
    }

    /// Returns a deep-copy snapshot of the whole book.
    pub fn state(&self) -> OrderBookState {
        OrderBookState {
            buy_orders: self.buy_orders.clone(),
            sell_orders: self.sell_orders.clone(),
            matches: self.matches.clone(),
        }
    }

    /// Wholesale replaces the book with `state` and restores canonical ordering.
    ///
    /// This is snapshot replacement, not a merge: any local order or match absent
    /// from `state` is discarded.
    pub fn set_state(&mut self, state: OrderBookState) {
        self.buy_orders = state.buy_orders;
        self.sell_orders = state.sell_orders;
        self.matches = state.matches;
        self.resort();
    }

    /// Linear search for a live order across both sides.
    pub fn find_order(&self, id: Uuid) -> Option<&Order> {
        self.buy_orders
            .iter()
            .chain(self.sell_orders.iter())
            .find(|o| o.id() == id)
    }

    /// Appends an externally announced match to the history. Duplicate announcements
    /// (same match id) are ignored.
    pub fn record_match(&mut self, record: OrderMatch) {
        if self.matches.iter().any(|m| m.id() == record.id()) {
            return;
        }
        self.matches.push(record);
    }

    /// The best (highest-priced) resting buy order.
    pub fn best_buy(&self) -> Option<&Order> {
        self.buy_orders.first()
    }

    /// The best (lowest-priced) resting sell order.
    pub fn best_sell(&self) -> Option<&Order> {
        self.sell_orders.first()
    }

    /// Difference between the best sell and best buy price.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_sell(), self.best_buy()) {
            (Some(sell), Some(buy)) => Some(sell.price() - buy.price()),
            _ => None,
        }
    }

    /// Number of resting orders on the given side.
    pub fn open_orders(&self, side: Side) -> usize {
        self.side(side).len()
    }

    /// Number of matches recorded so far.
    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    fn side(&self, side: Side) -> &Vec<Order> {
        match side {
            Side::Buy => &self.buy_orders,
            Side::Sell => &self.sell_orders,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut Vec<Order> {
        match side {
            Side::Buy => &mut self.buy_orders,
            Side::Sell => &mut self.sell_orders,
        }
    }

    fn resort(&mut self) {
        self.buy_orders.sort_by(buy_priority);
        self.sell_orders.sort_by(sell_priority);
    }
}

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------
// | Name                                   | Description                                       |
// |----------------------------------------|---------------------------------------------------|
// | test_submit_into_empty_book            | No matches; order rests on its side.              |
// | test_partial_fill_of_resting_order     | Incoming fills completely against a larger rest.  |
// | test_incoming_remainder_is_booked      | Resting fills completely; remainder rests.        |
// | test_price_time_priority               | Best price first, then oldest, then id.           |
// | test_match_uses_resting_price          | Price-taker convention.                           |
// | test_duplicate_and_inactive_rejected   | Submission preconditions.                         |
// | test_cancel_unknown_is_noop            | Silent no-op for unknown ids.                     |
// | test_state_snapshot_is_deep            | Snapshots never alias book internals.             |
// | test_set_state_replaces_wholesale      | Snapshot replacement discards prior state.        |
//--------------------------------------------------------------------------------------------------
