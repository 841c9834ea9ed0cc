//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Wire format of the synchronization protocol and its validation layer.
//
// Everything arriving from a peer is untrusted: reconstruction goes through pure
// parse functions that enforce a static schema plus per-field rules and return a
// typed result, never a panic. Outgoing payloads are produced by the matching
// *_to_wire functions so both directions share one schema.
//
// | Section   | Description                                                           |
// |-----------|-----------------------------------------------------------------------|
// | ENVELOPE  | {clientId, action, data} request wrapper and the action set.          |
// | WIRE DTOS | serde schemas for orders, matches and book snapshots.                 |
// | PARSING   | parse_envelope / parse_order / parse_match / parse_state.             |
// | ENCODING  | order_to_wire / match_to_wire / state_to_wire.                        |
//--------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use num_traits::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::orderbook::OrderBookState;
use crate::types::{Order, OrderMatch, OrderStatus, Side};

/// Errors raised while validating untrusted wire data.
///
/// Every message intentionally starts with "invalid": peers classify replies that
/// carry these messages as non-retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An order payload failed schema or field validation.
    #[error("invalid order data: {0}")]
    InvalidOrderData(String),
    /// A match payload failed schema or field validation.
    #[error("invalid match data: {0}")]
    InvalidMatchData(String),
    /// A book snapshot payload has the wrong shape.
    #[error("invalid orderbook state: {0}")]
    InvalidState(String),
    /// A request envelope is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

//--------------------------------------------------------------------------------------------------
//  ENVELOPE
//--------------------------------------------------------------------------------------------------

/// The five operations a node can ask of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncAction {
    /// Apply a newly submitted order to the receiver's book.
    #[serde(rename = "SUBMIT_ORDER")]
    SubmitOrder,
    /// Push a full book snapshot to the receiver.
    #[serde(rename = "SYNC_ORDERBOOK")]
    SyncOrderbook,
    /// Ask the receiver for its full book snapshot.
    #[serde(rename = "GET_ORDERBOOK")]
    GetOrderbook,
    /// Inform the receiver of a match executed elsewhere.
    #[serde(rename = "ANNOUNCE_MATCH")]
    AnnounceMatch,
    /// Apply a cancellation to the receiver's book.
    #[serde(rename = "CANCEL_ORDER")]
    CancelOrder,
}

/// Request wrapper carried by every peer-to-peer call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Identity of the originating node; used for self-delivery filtering.
    pub client_id: String,
    pub action: SyncAction,
    pub data: Value,
}

impl Envelope {
    pub fn new(client_id: impl Into<String>, action: SyncAction, data: Value) -> Self {
        Self {
            client_id: client_id.into(),
            action,
            data,
        }
    }

    /// Serializes the envelope into a transport payload.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "clientId": self.client_id,
            "action": self.action,
            "data": self.data,
        })
    }
}

/// Validates an inbound request envelope: `clientId` must be a non-empty string,
/// `action` one of the recognized values, and `data` present.
pub fn parse_envelope(payload: &Value) -> Result<Envelope, ProtocolError> {
    let object = payload
        .as_object()
        .ok_or_else(|| ProtocolError::InvalidRequest("payload is not an object".to_string()))?;

    let client_id = object
        .get("clientId")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidRequest("missing clientId".to_string()))?;
    if client_id.trim().is_empty() {
        return Err(ProtocolError::InvalidRequest("empty clientId".to_string()));
    }

    let action_value = object
        .get("action")
        .ok_or_else(|| ProtocolError::InvalidRequest("missing action".to_string()))?;
    let action: SyncAction = serde_json::from_value(action_value.clone())
        .map_err(|_| ProtocolError::InvalidRequest(format!("unrecognized action {action_value}")))?;

    let data = object
        .get("data")
        .ok_or_else(|| ProtocolError::InvalidRequest("missing data".to_string()))?;

    Ok(Envelope::new(client_id, action, data.clone()))
}

//--------------------------------------------------------------------------------------------------
//  WIRE DTOS
//--------------------------------------------------------------------------------------------------

/// Wire schema of an order. Optional fields are defaulted on the trusted local
/// construction path only; the parse path below decides what may be absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Wire schema of a match record. All fields are required; the embedded orders are
/// kept as raw values so they run through the full order validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchWire {
    pub id: String,
    pub buy_order: Value,
    pub sell_order: Value,
    pub matched_amount: f64,
    pub price: f64,
    pub timestamp: i64,
}

/// Wire schema of a book snapshot. Entries stay raw values: the top-level shape is
/// validated here, individual entries are parsed (and possibly discarded) by the
/// synchronization layer.
#[derive(Debug, Clone, Default)]
pub struct StateWire {
    pub buy_orders: Vec<Value>,
    pub sell_orders: Vec<Value>,
    pub matches: Vec<Value>,
}

//--------------------------------------------------------------------------------------------------
//  PARSING
//--------------------------------------------------------------------------------------------------

fn decimal_field(name: &str, value: f64) -> Result<Decimal, ProtocolError> {
    if !value.is_finite() {
        return Err(ProtocolError::InvalidOrderData(format!(
            "{name} is not a finite number"
        )));
    }
    Decimal::from_f64(value)
        .ok_or_else(|| ProtocolError::InvalidOrderData(format!("{name} is not representable")))
}

/// Strictly reconstructs an [`Order`] from an untrusted value.
///
/// Required fields: `type`, `clientId`, `amount`, `price`. A `filled` status
/// additionally requires a positive `originalAmount` (the remaining amount may then
/// be zero); any other status requires `amount > 0`. Every violation maps to
/// [`ProtocolError::InvalidOrderData`] and nothing else.
pub fn parse_order(payload: &Value) -> Result<Order, ProtocolError> {
    if !payload.is_object() {
        return Err(ProtocolError::InvalidOrderData(
            "order payload is not an object".to_string(),
        ));
    }
    let wire: OrderWire = serde_json::from_value(payload.clone())
        .map_err(|err| ProtocolError::InvalidOrderData(err.to_string()))?;

    let side: Side = wire
        .side
        .parse()
        .map_err(|_| ProtocolError::InvalidOrderData(format!("unknown side {:?}", wire.side)))?;

    let price = decimal_field("price", wire.price)?;
    if price <= Decimal::ZERO {
        return Err(ProtocolError::InvalidOrderData(format!(
            "price must be positive, got {price}"
        )));
    }

    let status = match &wire.status {
        Some(raw) => Some(raw.parse::<OrderStatus>().map_err(|_| {
            ProtocolError::InvalidOrderData(format!("unknown status {:?}", raw))
        })?),
        None => None,
    };

    let amount = decimal_field("amount", wire.amount)?;
    let original_amount = match wire.original_amount {
        Some(raw) => Some(decimal_field("originalAmount", raw)?),
        None => None,
    };

    // Terminal filled orders may carry a zero remaining amount, but only together
    // with the original amount that was filled. Everything else needs amount > 0.
    let (amount, original_amount, status) = match status {
        Some(OrderStatus::Filled) => {
            if amount < Decimal::ZERO {
                return Err(ProtocolError::InvalidOrderData(format!(
                    "amount must not be negative, got {amount}"
                )));
            }
            let original = original_amount.ok_or_else(|| {
                ProtocolError::InvalidOrderData(
                    "filled order is missing originalAmount".to_string(),
                )
            })?;
            if original <= Decimal::ZERO {
                return Err(ProtocolError::InvalidOrderData(format!(
                    "originalAmount must be positive, got {original}"
                )));
            }
            (amount, original, OrderStatus::Filled)
        }
        other => {
            if amount <= Decimal::ZERO {
                return Err(ProtocolError::InvalidOrderData(format!(
                    "amount must be positive, got {amount}"
                )));
            }
            (
                amount,
                original_amount.unwrap_or(amount),
                other.unwrap_or(OrderStatus::Open),
            )
        }
    };

    let id = match &wire.id {
        Some(raw) => Uuid::parse_str(raw)
            .map_err(|_| ProtocolError::InvalidOrderData(format!("malformed order id {raw:?}")))?,
        None => Uuid::new_v4(),
    };

    let timestamp = match wire.timestamp {
        Some(millis) => DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            ProtocolError::InvalidOrderData(format!("timestamp {millis} is out of range"))
        })?,
        None => Utc::now(),
    };

    Order::restore(
        id,
        side,
        price,
        amount,
        wire.client_id,
        original_amount,
        timestamp,
        status,
        wire.version.unwrap_or(1),
    )
    .map_err(|err| ProtocolError::InvalidOrderData(err.to_string()))
}

/// Strictly reconstructs an [`OrderMatch`] from an untrusted value, re-validating
/// both embedded orders and the match invariants.
pub fn parse_match(payload: &Value) -> Result<OrderMatch, ProtocolError> {
    if !payload.is_object() {
        return Err(ProtocolError::InvalidMatchData(
            "match payload is not an object".to_string(),
        ));
    }
    let wire: MatchWire = serde_json::from_value(payload.clone())
        .map_err(|err| ProtocolError::InvalidMatchData(err.to_string()))?;

    let id = Uuid::parse_str(&wire.id)
        .map_err(|_| ProtocolError::InvalidMatchData(format!("malformed match id {:?}", wire.id)))?;

    let buy_order = parse_order(&wire.buy_order)
        .map_err(|err| ProtocolError::InvalidMatchData(format!("buyOrder: {err}")))?;
    let sell_order = parse_order(&wire.sell_order)
        .map_err(|err| ProtocolError::InvalidMatchData(format!("sellOrder: {err}")))?;

    if !wire.matched_amount.is_finite() || !wire.price.is_finite() {
        return Err(ProtocolError::InvalidMatchData(
            "matchedAmount/price must be finite numbers".to_string(),
        ));
    }
    let amount = Decimal::from_f64(wire.matched_amount).ok_or_else(|| {
        ProtocolError::InvalidMatchData("matchedAmount is not representable".to_string())
    })?;
    let price = Decimal::from_f64(wire.price)
        .ok_or_else(|| ProtocolError::InvalidMatchData("price is not representable".to_string()))?;

    let timestamp = DateTime::<Utc>::from_timestamp_millis(wire.timestamp).ok_or_else(|| {
        ProtocolError::InvalidMatchData(format!("timestamp {} is out of range", wire.timestamp))
    })?;

    OrderMatch::restore(id, buy_order, sell_order, amount, price, timestamp)
        .map_err(|err| ProtocolError::InvalidMatchData(err.to_string()))
}

/// Validates the top-level shape of a book snapshot: an object holding the three
/// array fields, each element an object. A violation rejects the whole snapshot;
/// per-entry parsing is deliberately left to the caller so that individually
/// malformed entries can be discarded without failing the sync.
pub fn parse_state(payload: &Value) -> Result<StateWire, ProtocolError> {
    let object = payload
        .as_object()
        .ok_or_else(|| ProtocolError::InvalidState("state is not an object".to_string()))?;

    let mut wire = StateWire::default();
    for (field, target) in [
        ("buyOrders", &mut wire.buy_orders),
        ("sellOrders", &mut wire.sell_orders),
        ("matches", &mut wire.matches),
    ] {
        let entries = object
            .get(field)
            .and_then(Value::as_array)
            .ok_or_else(|| ProtocolError::InvalidState(format!("{field} is not an array")))?;
        for entry in entries {
            if !entry.is_object() {
                return Err(ProtocolError::InvalidState(format!(
                    "{field} contains a non-object entry"
                )));
            }
            target.push(entry.clone());
        }
    }
    Ok(wire)
}

//--------------------------------------------------------------------------------------------------
//  ENCODING
//--------------------------------------------------------------------------------------------------

/// Encodes an order for the wire.
pub fn order_to_wire(order: &Order) -> Value {
    serde_json::json!({
        "id": order.id().to_string(),
        "type": order.side().as_str(),
        "price": order.price().to_f64().unwrap_or_default(),
        "amount": order.amount().to_f64().unwrap_or_default(),
        "clientId": order.client_id(),
        "originalAmount": order.original_amount().to_f64().unwrap_or_default(),
        "timestamp": order.timestamp().timestamp_millis(),
        "status": order.status().as_str(),
        "version": order.version(),
    })
}

/// Encodes a match record for the wire.
pub fn match_to_wire(record: &OrderMatch) -> Value {
    serde_json::json!({
        "id": record.id().to_string(),
        "buyOrder": order_to_wire(record.buy_order()),
        "sellOrder": order_to_wire(record.sell_order()),
        "matchedAmount": record.amount().to_f64().unwrap_or_default(),
        "price": record.price().to_f64().unwrap_or_default(),
        "timestamp": record.timestamp().timestamp_millis(),
    })
}

/// Encodes a full book snapshot for the wire.
pub fn state_to_wire(state: &OrderBookState) -> Value {
    serde_json::json!({
        "buyOrders": state.buy_orders.iter().map(order_to_wire).collect::<Vec<_>>(),
        "sellOrders": state.sell_orders.iter().map(order_to_wire).collect::<Vec<_>>(),
        "matches": state.matches.iter().map(match_to_wire).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn valid_order_value() -> Value {
        json!({
            "type": "buy",
            "price": 100.5,
            "amount": 10.0,
            "clientId": "node-1",
        })
    }

    #[test]
    fn test_parse_order_minimal() {
        let order = match parse_order(&valid_order_value()) {
            Ok(order) => order,
            Err(e) => panic!("expected a valid order: {:?}", e),
        };
        assert_eq!(order.side(), Side::Buy);
        assert_eq!(order.price(), dec!(100.5));
        assert_eq!(order.amount(), dec!(10.0));
        assert_eq!(order.original_amount(), dec!(10.0));
        assert_eq!(order.status(), OrderStatus::Open);
        assert_eq!(order.client_id(), "node-1");
    }

    #[test]
    fn test_parse_order_rejects_missing_and_malformed_fields() {
        for broken in [
            json!("not an object"),
            json!({"price": 100.0, "amount": 1.0, "clientId": "c"}),
            json!({"type": "buy", "amount": 1.0, "clientId": "c"}),
            json!({"type": "buy", "price": 100.0, "clientId": "c"}),
            json!({"type": "buy", "price": 100.0, "amount": 1.0}),
            json!({"type": "hold", "price": 100.0, "amount": 1.0, "clientId": "c"}),
            json!({"type": "buy", "price": 0.0, "amount": 1.0, "clientId": "c"}),
            json!({"type": "buy", "price": -1.0, "amount": 1.0, "clientId": "c"}),
            json!({"type": "buy", "price": 100.0, "amount": 0.0, "clientId": "c"}),
            json!({"type": "buy", "price": 100.0, "amount": 1.0, "clientId": "c", "status": "weird"}),
            json!({"type": "buy", "price": 100.0, "amount": 1.0, "clientId": "c", "id": "not-a-uuid"}),
            json!({"type": "buy", "price": "100", "amount": 1.0, "clientId": "c"}),
        ] {
            match parse_order(&broken) {
                Err(ProtocolError::InvalidOrderData(_)) => {}
                other => panic!("expected InvalidOrderData for {broken}, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_parse_order_filled_requires_original_amount() {
        let missing = json!({
            "type": "sell",
            "price": 100.0,
            "amount": 0.0,
            "clientId": "c",
            "status": "filled",
        });
        match parse_order(&missing) {
            Err(ProtocolError::InvalidOrderData(_)) => {}
            other => panic!("expected rejection, got {:?}", other),
        }

        let complete = json!({
            "type": "sell",
            "price": 100.0,
            "amount": 0.0,
            "clientId": "c",
            "status": "filled",
            "originalAmount": 4.0,
        });
        let order = match parse_order(&complete) {
            Ok(order) => order,
            Err(e) => panic!("expected a valid filled order: {:?}", e),
        };
        assert_eq!(order.status(), OrderStatus::Filled);
        assert_eq!(order.amount(), dec!(0));
        assert_eq!(order.original_amount(), dec!(4));
    }

    #[test]
    fn test_order_wire_round_trip() {
        let original = match Order::new(Side::Sell, dec!(42.5), dec!(3.25), "node-2") {
            Ok(order) => order,
            Err(e) => panic!("order creation failed: {:?}", e),
        };
        let parsed = match parse_order(&order_to_wire(&original)) {
            Ok(parsed) => parsed,
            Err(e) => panic!("round trip failed: {:?}", e),
        };
        assert_eq!(parsed.id(), original.id());
        assert_eq!(parsed.side(), original.side());
        assert_eq!(parsed.price(), original.price());
        assert_eq!(parsed.amount(), original.amount());
        assert_eq!(parsed.client_id(), original.client_id());
        assert_eq!(parsed.status(), original.status());
        assert_eq!(
            parsed.timestamp().timestamp_millis(),
            original.timestamp().timestamp_millis()
        );
    }

    #[test]
    fn test_match_wire_round_trip() {
        let buy = match Order::new(Side::Buy, dec!(100), dec!(5), "buyer") {
            Ok(o) => o,
            Err(e) => panic!("order creation failed: {:?}", e),
        };
        let sell = match Order::new(Side::Sell, dec!(99), dec!(5), "seller") {
            Ok(o) => o,
            Err(e) => panic!("order creation failed: {:?}", e),
        };
        let record = match OrderMatch::new(buy, sell, dec!(5), dec!(99)) {
            Ok(record) => record,
            Err(e) => panic!("match creation failed: {:?}", e),
        };

        let parsed = match parse_match(&match_to_wire(&record)) {
            Ok(parsed) => parsed,
            Err(e) => panic!("round trip failed: {:?}", e),
        };
        assert_eq!(parsed.id(), record.id());
        assert_eq!(parsed.amount(), record.amount());
        assert_eq!(parsed.price(), record.price());
        assert_eq!(parsed.buy_order().id(), record.buy_order().id());
    }

    #[test]
    fn test_parse_match_rejects_bad_participants() {
        let buy = valid_order_value();
        let bad = json!({
            "id": Uuid::new_v4().to_string(),
            "buyOrder": buy,
            "sellOrder": {"type": "sell", "price": 0.0, "amount": 1.0, "clientId": "c"},
            "matchedAmount": 1.0,
            "price": 100.0,
            "timestamp": 1_700_000_000_000i64,
        });
        match parse_match(&bad) {
            Err(ProtocolError::InvalidMatchData(message)) => {
                assert!(message.contains("sellOrder"), "unexpected message {message}")
            }
            other => panic!("expected InvalidMatchData, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_state_shape_validation() {
        // `matches` is not an array: the whole snapshot is rejected.
        let bad = json!({"buyOrders": [], "sellOrders": [], "matches": "nope"});
        match parse_state(&bad) {
            Err(ProtocolError::InvalidState(_)) => {}
            other => panic!("expected InvalidState, got {:?}", other),
        }

        // A primitive entry inside an array is also a shape violation.
        let primitive = json!({"buyOrders": [42], "sellOrders": [], "matches": []});
        match parse_state(&primitive) {
            Err(ProtocolError::InvalidState(_)) => {}
            other => panic!("expected InvalidState, got {:?}", other),
        }

        let good = json!({
            "buyOrders": [valid_order_value()],
            "sellOrders": [],
            "matches": [],
        });
        let wire = match parse_state(&good) {
            Ok(wire) => wire,
            Err(e) => panic!("expected a valid state: {:?}", e),
        };
        assert_eq!(wire.buy_orders.len(), 1);
        assert!(wire.sell_orders.is_empty());
    }

    #[test]
    fn test_parse_envelope() {
        let valid = json!({
            "clientId": "node-1",
            "action": "SUBMIT_ORDER",
            "data": valid_order_value(),
        });
        let envelope = match parse_envelope(&valid) {
            Ok(envelope) => envelope,
            Err(e) => panic!("expected a valid envelope: {:?}", e),
        };
        assert_eq!(envelope.client_id, "node-1");
        assert_eq!(envelope.action, SyncAction::SubmitOrder);

        for broken in [
            json!(17),
            json!({"action": "SUBMIT_ORDER", "data": {}}),
            json!({"clientId": "  ", "action": "SUBMIT_ORDER", "data": {}}),
            json!({"clientId": "node-1", "action": "REBOOT", "data": {}}),
            json!({"clientId": "node-1", "action": "SUBMIT_ORDER"}),
        ] {
            match parse_envelope(&broken) {
                Err(ProtocolError::InvalidRequest(_)) => {}
                other => panic!("expected InvalidRequest for {broken}, got {:?}", other),
            }
        }
    }
}
