//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module defines the core data types shared by every node in the peer-to-peer
// exchange: orders, match records, and their status/side enums.
//
// | Section            | Description                                                      |
// |--------------------|------------------------------------------------------------------|
// | ENUMS              | Discrete sets of values (Side, OrderStatus).                     |
// | STRUCTS            | Order and OrderMatch entities with their lifecycle operations.   |
// | ERRORS             | Validation and lifecycle errors for orders and matches.          |
// | TESTS              | Unit tests for the defined types.                                |
//--------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
//  ENUMS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                 |
// |---------------|---------------------------------------------|
// | Side          | Direction of an order (Buy/Sell).           |
// | OrderStatus   | Lifecycle status of an order.               |
//--------------------------------------------------------------------------------------------------

/// Represents the side of an order (Buy or Sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// A buy order.
    Buy,
    /// A sell order.
    Sell,
}

impl Side {
    /// Returns the opposite side.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Wire representation of the side.
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl FromStr for Side {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(OrderError::InvalidSide(other.to_string())),
        }
    }
}

/// Lifecycle status of an order within a node's book.
///
/// Apart from `Cancelled`, which is an explicit terminal transition, the status is
/// always derived from the remaining amount relative to the original amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    /// The order has been accepted but nothing has been filled yet.
    Open,
    /// The order has been partially filled and still rests on the book.
    PartiallyFilled,
    /// The order has been completely filled.
    Filled,
    /// The order was cancelled before being fully filled.
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(OrderError::InvalidStatus(other.to_string())),
        }
    }
}

//--------------------------------------------------------------------------------------------------
//  ERRORS
//--------------------------------------------------------------------------------------------------

/// Errors raised by order construction and lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// The limit price is not strictly positive.
    #[error("invalid order price: {0}")]
    InvalidPrice(Decimal),
    /// The amount is negative, or zero for a non-filled order, or exceeds the original amount.
    #[error("invalid order amount: {0}")]
    InvalidAmount(Decimal),
    /// The client id is empty or whitespace-only.
    #[error("invalid client id: must be a non-empty string")]
    InvalidClientId,
    /// An unrecognized side string.
    #[error("invalid order side: {0}")]
    InvalidSide(String),
    /// An unrecognized status string.
    #[error("invalid order status: {0}")]
    InvalidStatus(String),
    /// A fill was requested with a non-positive amount.
    #[error("invalid filled amount: {0}")]
    InvalidFilledAmount(Decimal),
    /// A fill was requested for more than the order has remaining.
    #[error("filled amount {requested} exceeds available amount {available}")]
    FillExceedsRemaining {
        requested: Decimal,
        available: Decimal,
    },
    /// The order is already fully filled and cannot be cancelled.
    #[error("order is already fully filled")]
    AlreadyFilled,
}

/// Errors raised when constructing a match record that violates its invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// The buy participant is not a buy order or the sell participant is not a sell order.
    #[error("match participants have mismatched sides")]
    SideMismatch,
    /// The sell price is above the buy price.
    #[error("sell price {sell} exceeds buy price {buy}")]
    PriceIncompatible { buy: Decimal, sell: Decimal },
    /// The matched amount is non-positive or exceeds a participant's remaining amount.
    #[error("matched amount {0} is out of range for its participants")]
    InvalidAmount(Decimal),
    /// The match price is not strictly positive.
    #[error("invalid match price: {0}")]
    InvalidPrice(Decimal),
}

//--------------------------------------------------------------------------------------------------
//  STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                              |
// |---------------|----------------------------------------------------------|
// | Order         | A buy/sell order owned by a client on some node.         |
// | OrderMatch    | Immutable record of one matching event.                  |
//--------------------------------------------------------------------------------------------------

/// A trading order in the peer-to-peer exchange.
///
/// Identity, side, price, client and creation time are immutable; the remaining
/// `amount` and the `status` change only through [`Order::apply_fill`] and
/// [`Order::cancel`], which maintain the invariants `0 <= amount <= original_amount`
/// and `amount == 0` exactly when the order is `Filled`.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    id: Uuid,
    side: Side,
    price: Decimal,
    /// Remaining (unfilled) amount.
    amount: Decimal,
    client_id: String,
    original_amount: Decimal,
    timestamp: DateTime<Utc>,
    status: OrderStatus,
    /// Bumped on every mutation; carried on the wire so peers can spot stale copies.
    version: u64,
}

impl Order {
    /// Creates a new open order with a fresh id and the current timestamp.
    ///
    /// # Errors
    /// * `InvalidPrice` if `price <= 0`
    /// * `InvalidAmount` if `amount <= 0`
    /// * `InvalidClientId` if `client_id` is empty or whitespace
    pub fn new(
        side: Side,
        price: Decimal,
        amount: Decimal,
        client_id: impl Into<String>,
    ) -> Result<Order, OrderError> {
        Order::restore(
            Uuid::new_v4(),
            side,
            price,
            amount,
            client_id,
            amount,
            Utc::now(),
            OrderStatus::Open,
            1,
        )
    }

    /// Reconstructs an order with every field supplied, e.g. from wire data.
    ///
    /// Stricter than [`Order::new`]: a zero remaining amount is only accepted for an
    /// already-`Filled` order, and then only with a positive original amount.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid,
        side: Side,
        price: Decimal,
        amount: Decimal,
        client_id: impl Into<String>,
        original_amount: Decimal,
        timestamp: DateTime<Utc>,
        status: OrderStatus,
        version: u64,
    ) -> Result<Order, OrderError> {
        let client_id = client_id.into();
        if price <= Decimal::ZERO {
            return Err(OrderError::InvalidPrice(price));
        }
        if client_id.trim().is_empty() {
            return Err(OrderError::InvalidClientId);
        }
        if original_amount <= Decimal::ZERO {
            return Err(OrderError::InvalidAmount(original_amount));
        }
        if amount < Decimal::ZERO || amount > original_amount {
            return Err(OrderError::InvalidAmount(amount));
        }
        if amount.is_zero() && status != OrderStatus::Filled {
            return Err(OrderError::InvalidAmount(amount));
        }
        Ok(Order {
            id,
            side,
            price,
            amount,
            client_id,
            original_amount,
            timestamp,
            status,
            version,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    /// Remaining (unfilled) amount.
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn original_amount(&self) -> Decimal {
        self.original_amount
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// True while the order can still participate in matching.
    pub fn is_active(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    /// True iff this order and `other` could trade against each other: opposite
    /// sides, both active, and the buy price covers the sell price.
    pub fn can_match_with(&self, other: &Order) -> bool {
        if self.side == other.side || !self.is_active() || !other.is_active() {
            return false;
        }
        let (buy, sell) = match self.side {
            Side::Buy => (self, other),
            Side::Sell => (other, self),
        };
        buy.price >= sell.price
    }

    /// Applies a fill, reducing the remaining amount and recomputing the status.
    ///
    /// # Errors
    /// * `InvalidFilledAmount` if `filled <= 0`
    /// * `FillExceedsRemaining` if `filled` is more than the remaining amount
    pub fn apply_fill(&mut self, filled: Decimal) -> Result<(), OrderError> {
        if filled <= Decimal::ZERO {
            return Err(OrderError::InvalidFilledAmount(filled));
        }
        if filled > self.amount {
            return Err(OrderError::FillExceedsRemaining {
                requested: filled,
                available: self.amount,
            });
        }
        self.amount -= filled;
        self.status = if self.amount.is_zero() {
            OrderStatus::Filled
        } else if self.amount < self.original_amount {
            OrderStatus::PartiallyFilled
        } else {
            self.status
        };
        self.version += 1;
        Ok(())
    }

    /// Cancels the order. Re-cancelling an already-cancelled order is a no-op.
    ///
    /// # Errors
    /// * `AlreadyFilled` if the order has already been fully filled
    pub fn cancel(&mut self) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Filled => Err(OrderError::AlreadyFilled),
            OrderStatus::Cancelled => Ok(()),
            _ => {
                self.status = OrderStatus::Cancelled;
                self.version += 1;
                Ok(())
            }
        }
    }

    /// Returns an independent copy of the order.
    pub fn snapshot(&self) -> Order {
        self.clone()
    }
}

/// Immutable record of one matching event between a buy and a sell order.
///
/// Holds copies of both participants taken at the moment of the match, never live
/// references into a book.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderMatch {
    id: Uuid,
    buy_order: Order,
    sell_order: Order,
    amount: Decimal,
    price: Decimal,
    timestamp: DateTime<Utc>,
}

impl OrderMatch {
    /// Creates a match record, validating the matching invariants.
    ///
    /// `price` follows the price-taker convention: it is the resting order's price,
    /// which the caller (the matching engine) selects.
    pub fn new(
        buy_order: Order,
        sell_order: Order,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderMatch, MatchError> {
        OrderMatch::restore(Uuid::new_v4(), buy_order, sell_order, amount, price, Utc::now())
    }

    /// Reconstructs a match record with every field supplied, e.g. from wire data.
    pub fn restore(
        id: Uuid,
        buy_order: Order,
        sell_order: Order,
        amount: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<OrderMatch, MatchError> {
        if buy_order.side() != Side::Buy || sell_order.side() != Side::Sell {
            return Err(MatchError::SideMismatch);
        }
        if sell_order.price() > buy_order.price() {
            return Err(MatchError::PriceIncompatible {
                buy: buy_order.price(),
                sell: sell_order.price(),
            });
        }
        if price <= Decimal::ZERO {
            return Err(MatchError::InvalidPrice(price));
        }
        if amount <= Decimal::ZERO || amount > buy_order.amount() || amount > sell_order.amount() {
            return Err(MatchError::InvalidAmount(amount));
        }
        Ok(OrderMatch {
            id,
            buy_order,
            sell_order,
            amount,
            price,
            timestamp,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn buy_order(&self) -> &Order {
        &self.buy_order
    }

    pub fn sell_order(&self) -> &Order {
        &self.sell_order
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------
// | Name                               | Description                                      |
// |------------------------------------|--------------------------------------------------|
// | test_order_creation                | Verify defaults of a freshly created order.      |
// | test_order_rejects_bad_fields      | Construction validation.                         |
// | test_apply_fill_lifecycle          | Partial and complete fills, status derivation.   |
// | test_cancel_idempotent             | Cancel semantics including re-cancel.            |
// | test_can_match_with                | Price/side/activity compatibility.               |
// | test_snapshot_round_trip           | Snapshot preserves every field.                  |
// | test_match_invariants              | OrderMatch validation rules.                     |
//--------------------------------------------------------------------------------------------------
