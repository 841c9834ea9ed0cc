//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The synchronization service: wraps a node's order book with the network behavior
// that keeps the swarm eventually consistent.
//
// | Concern                | Mechanism                                                      |
// |------------------------|----------------------------------------------------------------|
// | Submission             | exclusive section -> local match -> best-effort broadcast      |
// | Cancellation           | local cancel -> broadcast; failures surface to the caller      |
// | Pull sync              | periodic GET_ORDERBOOK -> snapshot replacement                 |
// | Inbound requests       | envelope validation, self-filtering, per-action dispatch       |
// | Retry/backoff          | one primitive for every outbound call (timeout + exponential)  |
//
// Only the submission path is serialized. Cancels and background syncs can
// interleave with an in-flight submission; the book keeps each of its own
// operations atomic, which is the consistency level this design provides.
//--------------------------------------------------------------------------------------------------

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, NodeRole};
use crate::orderbook::{AddOrderResult, OrderBook, OrderBookError, OrderBookState};
use crate::protocol::{self, Envelope, ProtocolError, SyncAction};
use crate::transport::{InboundHandler, PeerTransport, TransportError};
use crate::types::Order;

/// How often a serving node re-announces its presence.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
/// How often a client node pulls a fresh snapshot from the swarm.
const SYNC_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period before the first sync so the discovery layer can settle.
const STARTUP_SETTLE: Duration = Duration::from_secs(1);
/// Per-call deadline for one RPC attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Additional attempts after the first failed request.
const MAX_RETRIES: u32 = 5;
const RETRY_BASE_DELAY_MS: u64 = 1_000;
const INITIAL_SYNC_BASE_DELAY_MS: u64 = 2_000;
const INITIAL_SYNC_ATTEMPTS: u32 = 5;
const BACKOFF_FACTOR: f64 = 1.5;

/// Delay before retry number `attempt` (1-based): `base * 1.5^(attempt-1)`.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
    Duration::from_millis((base_ms as f64 * factor).round() as u64)
}

/// Errors surfaced by the synchronization layer.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No reply arrived within the request window.
    #[error("request timed out")]
    RequestTimeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The peer answered with an error reply.
    #[error("peer rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Book(#[from] OrderBookError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The peer replied but not with the shape this call expects.
    #[error("malformed peer reply: {0}")]
    MalformedReply(String),
    /// The local cancellation succeeded but the swarm could not be informed.
    #[error("cancellation broadcast failed: {0}")]
    CancelBroadcastFailed(String),
}

/// Failures caused by the request itself (rather than the network) are not
/// transient; retrying them would only repeat the rejection.
fn is_validation_error(err: &SyncError) -> bool {
    err.to_string().to_lowercase().contains("invalid")
}

/// A node of the peer-to-peer exchange: local matching engine plus the
/// synchronization protocol that keeps it aligned with the swarm.
pub struct SyncService {
    inner: Arc<NodeInner>,
    /// Handles of the periodic announce/sync tasks, aborted on [`SyncService::stop`].
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct NodeInner {
    client_id: String,
    service_name: String,
    port: u16,
    role: NodeRole,
    book: RwLock<OrderBook>,
    transport: Arc<dyn PeerTransport>,
    /// Serializes submissions: at most one local match-and-broadcast at a time.
    submit_lock: tokio::sync::Mutex<()>,
}

impl SyncService {
    pub fn new(config: Config, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                client_id: config.client_id,
                service_name: config.service_name,
                port: config.port,
                role: config.role,
                book: RwLock::new(OrderBook::new()),
                transport,
                submit_lock: tokio::sync::Mutex::new(()),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn role(&self) -> NodeRole {
        self.inner.role
    }

    /// Deep-copy snapshot of the local book.
    pub fn book_state(&self) -> OrderBookState {
        self.inner.book.read().state()
    }

    /// Brings the node up.
    ///
    /// Servers start serving inbound requests and re-announce themselves every
    /// second. Clients sync in the background: after a settling delay they attempt
    /// an initial pull (bounded retries, total failure tolerated - the node starts
    /// with whatever book it has) and then re-sync every five seconds.
    pub async fn start(&self) -> Result<(), SyncError> {
        let inner = Arc::clone(&self.inner);
        inner.transport.start_link().await?;

        match inner.role {
            NodeRole::Server => {
                let handler: Arc<dyn InboundHandler> = inner.clone();
                inner.transport.listen(inner.port, handler).await?;
                info!(
                    service = %inner.service_name,
                    port = inner.port,
                    "node serving inbound requests"
                );

                let announcer = Arc::clone(&inner);
                let handle = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
                    loop {
                        ticker.tick().await;
                        if let Err(err) = announcer
                            .transport
                            .announce(&announcer.service_name, announcer.port)
                            .await
                        {
                            warn!("failed to announce service: {err}");
                        }
                    }
                });
                self.tasks.lock().push(handle);
            }
            NodeRole::Client => {
                let syncer = Arc::clone(&inner);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(STARTUP_SETTLE).await;
                    syncer.initial_sync().await;
                    loop {
                        tokio::time::sleep(SYNC_INTERVAL).await;
                        if let Err(err) = syncer.sync_orderbook().await {
                            warn!("periodic orderbook sync failed: {err}");
                        }
                    }
                });
                self.tasks.lock().push(handle);
            }
        }
        Ok(())
    }

    /// Shuts the node down: cancels the periodic tasks and releases the transport
    /// link, so nothing keeps running past this call.
    pub async fn stop(&self) -> Result<(), SyncError> {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.inner.transport.stop_link().await?;
        info!(client_id = %self.inner.client_id, "node stopped");
        Ok(())
    }

    /// Submits an order: matches it locally, then broadcasts the submission.
    ///
    /// The local result is authoritative and returned regardless of the broadcast
    /// outcome; propagation failures are logged and swallowed because the book has
    /// already committed. Submissions are serialized per node, so two concurrent
    /// calls never interleave their matches against the same book state.
    pub async fn submit_order(&self, order: Order) -> Result<AddOrderResult, SyncError> {
        let inner = &self.inner;
        let _section = inner.submit_lock.lock().await;

        let submitted = order.snapshot();
        let result = inner.book.write().add_order(order)?;
        info!(
            order = %submitted.id(),
            matches = result.matches.len(),
            "order applied to the local book"
        );

        let envelope = Envelope::new(
            &inner.client_id,
            SyncAction::SubmitOrder,
            protocol::order_to_wire(&submitted),
        );
        if let Err(err) = inner.request_with_retry(envelope.to_value()).await {
            warn!(order = %submitted.id(), "failed to broadcast submission: {err}");
        }
        for record in &result.matches {
            let announce = Envelope::new(
                &inner.client_id,
                SyncAction::AnnounceMatch,
                protocol::match_to_wire(record),
            );
            if let Err(err) = inner.request_with_retry(announce.to_value()).await {
                warn!(record = %record.id(), "failed to announce match: {err}");
            }
        }

        Ok(result)
    }

    /// Cancels an order locally and, for client nodes, broadcasts the cancellation.
    ///
    /// The local cancellation is applied unconditionally and first. When the
    /// broadcast fails this returns [`SyncError::CancelBroadcastFailed`] even
    /// though the local book has already changed - callers must treat that error
    /// as "cancelled here, possibly not everywhere". An unknown id is a silent
    /// no-op (`Ok(None)`).
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Option<Order>, SyncError> {
        let inner = &self.inner;
        let cancelled = inner.book.write().cancel_order(order_id)?;

        if let Some(order) = &cancelled {
            info!(order = %order.id(), "order cancelled on the local book");
            if inner.role == NodeRole::Client {
                let envelope = Envelope::new(
                    &inner.client_id,
                    SyncAction::CancelOrder,
                    json!({"orderId": order.id().to_string()}),
                );
                if let Err(err) = inner.request_with_retry(envelope.to_value()).await {
                    return Err(SyncError::CancelBroadcastFailed(err.to_string()));
                }
            }
        }

        Ok(cancelled)
    }

    /// Pulls a snapshot from a peer immediately, outside the periodic schedule.
    pub async fn sync_orderbook(&self) -> Result<(), SyncError> {
        self.inner.sync_orderbook().await
    }
}

impl NodeInner {
    /// Initial pull after startup: a handful of attempts with their own, slower
    /// backoff. Giving up entirely is fine - the node would rather start with a
    /// stale book than refuse to start.
    async fn initial_sync(&self) {
        let mut attempt = 1;
        loop {
            match self.sync_orderbook().await {
                Ok(()) => {
                    info!("initial orderbook sync complete");
                    return;
                }
                Err(err) if attempt < INITIAL_SYNC_ATTEMPTS => {
                    let delay = backoff_delay(INITIAL_SYNC_BASE_DELAY_MS, attempt);
                    warn!(attempt, "initial sync failed, retrying in {delay:?}: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!("initial sync failed after {attempt} attempts, starting with the local book: {err}");
                    return;
                }
            }
        }
    }

    /// One pull-sync cycle: fetch a peer's snapshot and replace the local book.
    ///
    /// A malformed top-level reply aborts the cycle without touching local state;
    /// individually malformed entries inside a well-formed snapshot are discarded.
    async fn sync_orderbook(&self) -> Result<(), SyncError> {
        let envelope = Envelope::new(&self.client_id, SyncAction::GetOrderbook, json!({}));
        let reply = self.request_with_retry(envelope.to_value()).await?;

        let status = reply.get("status").and_then(Value::as_str);
        if status != Some("ok") {
            return Err(SyncError::MalformedReply(format!(
                "unexpected reply status {status:?}"
            )));
        }
        let state = reply
            .get("state")
            .ok_or_else(|| SyncError::MalformedReply("reply is missing state".to_string()))?;
        self.apply_state_value(state)
    }

    /// Validates a snapshot payload, parses its entries, and replaces the book
    /// with whatever survived. Shared by pull replies and pushed snapshots.
    fn apply_state_value(&self, payload: &Value) -> Result<(), SyncError> {
        let wire = protocol::parse_state(payload)?;

        let mut state = OrderBookState::default();
        for entry in &wire.buy_orders {
            match protocol::parse_order(entry) {
                Ok(order) => state.buy_orders.push(order),
                Err(err) => debug!("discarding buy order from snapshot: {err}"),
            }
        }
        for entry in &wire.sell_orders {
            match protocol::parse_order(entry) {
                Ok(order) => state.sell_orders.push(order),
                Err(err) => debug!("discarding sell order from snapshot: {err}"),
            }
        }
        for entry in &wire.matches {
            match protocol::parse_match(entry) {
                Ok(record) => state.matches.push(record),
                Err(err) => debug!("discarding match from snapshot: {err}"),
            }
        }

        let (buys, sells, matches) = (
            state.buy_orders.len(),
            state.sell_orders.len(),
            state.matches.len(),
        );
        self.book.write().set_state(state);
        info!(buys, sells, matches, "orderbook replaced from peer snapshot");
        Ok(())
    }

    /// The single outbound primitive: one timed attempt, then exponential backoff,
    /// except for validation-class failures which abort immediately.
    async fn request_with_retry(&self, payload: Value) -> Result<Value, SyncError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.request_once(payload.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(err) if is_validation_error(&err) => return Err(err),
                Err(err) if attempt > MAX_RETRIES => return Err(err),
                Err(err) => {
                    let delay = backoff_delay(RETRY_BASE_DELAY_MS, attempt);
                    warn!(attempt, "request failed, retrying in {delay:?}: {err}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn request_once(&self, payload: Value) -> Result<Value, SyncError> {
        let request = self
            .transport
            .request(&self.service_name, payload, REQUEST_TIMEOUT);
        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, request).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err(SyncError::Transport(err)),
            Err(_) => return Err(SyncError::RequestTimeout),
        };

        if reply.get("status").and_then(Value::as_str) == Some("error") {
            let message = reply
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified peer error");
            return Err(SyncError::Rejected(message.to_string()));
        }
        Ok(reply)
    }

    /// Validates and dispatches one inbound request, always producing a structured
    /// reply. Requests carrying this node's own client id are skipped without side
    /// effects: in a broadcast/discovery topology a node routinely receives its own
    /// messages back.
    fn dispatch(&self, payload: &Value) -> Value {
        let envelope = match protocol::parse_envelope(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("rejecting malformed request: {err}");
                return error_reply(&err.to_string());
            }
        };

        if envelope.client_id == self.client_id {
            debug!(action = ?envelope.action, "skipping self-originated request");
            return json!({"status": "skipped", "reason": "own request"});
        }

        match envelope.action {
            SyncAction::SubmitOrder => self.handle_submit(&envelope),
            SyncAction::CancelOrder => self.handle_cancel(&envelope),
            SyncAction::GetOrderbook => json!({
                "status": "ok",
                "state": protocol::state_to_wire(&self.book.read().state()),
            }),
            SyncAction::SyncOrderbook => self.handle_push_state(&envelope),
            SyncAction::AnnounceMatch => self.handle_announce(&envelope),
        }
    }

    fn handle_submit(&self, envelope: &Envelope) -> Value {
        let order = match protocol::parse_order(&envelope.data) {
            Ok(order) => order,
            Err(err) => {
                warn!(peer = %envelope.client_id, "rejecting submitted order: {err}");
                return error_reply(&err.to_string());
            }
        };
        let order_id = order.id();
        match self.book.write().add_order(order) {
            Ok(result) => {
                info!(
                    peer = %envelope.client_id,
                    order = %order_id,
                    matches = result.matches.len(),
                    "applied peer submission"
                );
                json!({
                    "status": "ok",
                    "matches": result.matches.len(),
                    "rested": result.resting.is_some(),
                })
            }
            Err(err) => {
                warn!(order = %order_id, "peer submission rejected by the book: {err}");
                error_reply(&err.to_string())
            }
        }
    }

    fn handle_cancel(&self, envelope: &Envelope) -> Value {
        let raw = envelope
            .data
            .get("orderId")
            .and_then(Value::as_str)
            .unwrap_or("");
        if raw.trim().is_empty() {
            return error_reply("invalid cancel request: missing orderId");
        }
        let order_id = match Uuid::parse_str(raw) {
            Ok(id) => id,
            Err(_) => {
                return error_reply(&format!("invalid cancel request: malformed orderId {raw:?}"));
            }
        };
        match self.book.write().cancel_order(order_id) {
            Ok(Some(order)) => {
                info!(peer = %envelope.client_id, order = %order.id(), "applied peer cancellation");
                json!({"status": "ok", "cancelled": true})
            }
            Ok(None) => json!({"status": "ok", "cancelled": false}),
            Err(err) => error_reply(&err.to_string()),
        }
    }

    fn handle_push_state(&self, envelope: &Envelope) -> Value {
        match self.apply_state_value(&envelope.data) {
            Ok(()) => {
                info!(peer = %envelope.client_id, "applied pushed orderbook snapshot");
                json!({"status": "ok"})
            }
            Err(err) => error_reply(&err.to_string()),
        }
    }

    fn handle_announce(&self, envelope: &Envelope) -> Value {
        match protocol::parse_match(&envelope.data) {
            Ok(record) => {
                self.book.write().record_match(record);
                json!({"status": "ok"})
            }
            Err(err) => error_reply(&err.to_string()),
        }
    }
}

#[async_trait]
impl InboundHandler for NodeInner {
    async fn handle(&self, payload: Value) -> Result<Value, TransportError> {
        Ok(self.dispatch(&payload))
    }
}

fn error_reply(message: &str) -> Value {
    json!({"status": "error", "message": message})
}

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockPeerTransport;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn test_config(role: NodeRole) -> Config {
        Config {
            role,
            discovery_url: "mem://hub".to_string(),
            service_name: "book_service".to_string(),
            port: 1337,
            client_id: "node-under-test".to_string(),
        }
    }

    fn buy_order(price: rust_decimal::Decimal, amount: rust_decimal::Decimal) -> Order {
        match Order::new(Side::Buy, price, amount, "local-client") {
            Ok(order) => order,
            Err(e) => panic!("order creation failed: {:?}", e),
        }
    }

    fn peer_submit_payload(client_id: &str, order: &Order) -> Value {
        Envelope::new(client_id, SyncAction::SubmitOrder, protocol::order_to_wire(order))
            .to_value()
    }

    #[test]
    fn test_backoff_delay_schedule() {
        assert_eq!(backoff_delay(1_000, 1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1_000, 2), Duration::from_millis(1_500));
        assert_eq!(backoff_delay(1_000, 3), Duration::from_millis(2_250));
        assert_eq!(backoff_delay(2_000, 2), Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_returns_local_result_when_broadcast_fails() {
        let mut transport = MockPeerTransport::new();
        // One initial attempt plus five retries, all failing.
        transport
            .expect_request()
            .times(6)
            .returning(|_, _, _| Err(TransportError::Other("connection refused".to_string())));

        let service = SyncService::new(test_config(NodeRole::Client), Arc::new(transport));
        let result = match service.submit_order(buy_order(dec!(100), dec!(10))).await {
            Ok(result) => result,
            Err(e) => panic!("submission must not surface broadcast failures: {:?}", e),
        };
        assert!(result.matches.is_empty());
        assert!(result.resting.is_some());

        // The local book committed regardless of the dead network.
        assert_eq!(service.book_state().buy_orders.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_aborts_on_validation_error() {
        let mut transport = MockPeerTransport::new();
        // A validation-class rejection must not be retried.
        transport
            .expect_request()
            .times(1)
            .returning(|_, _, _| {
                Ok(json!({"status": "error", "message": "invalid order data: bad amount"}))
            });

        let service = SyncService::new(test_config(NodeRole::Client), Arc::new(transport));
        let result = service.submit_order(buy_order(dec!(100), dec!(10))).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_broadcasts_once_on_success() {
        let mut transport = MockPeerTransport::new();
        transport
            .expect_request()
            .times(1)
            .returning(|_, _, _| Ok(json!({"status": "ok"})));

        let service = SyncService::new(test_config(NodeRole::Client), Arc::new(transport));
        match service.submit_order(buy_order(dec!(100), dec!(10))).await {
            Ok(_) => {}
            Err(e) => panic!("submission failed: {:?}", e),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_broadcast_failure_is_surfaced() {
        let mut transport = MockPeerTransport::new();
        transport.expect_request().returning(|_, payload, _| {
            match payload.get("action").and_then(Value::as_str) {
                Some("SUBMIT_ORDER") => Ok(json!({"status": "ok"})),
                _ => Err(TransportError::Other("connection refused".to_string())),
            }
        });

        let service = SyncService::new(test_config(NodeRole::Client), Arc::new(transport));
        let result = match service.submit_order(buy_order(dec!(100), dec!(10))).await {
            Ok(result) => result,
            Err(e) => panic!("submission failed: {:?}", e),
        };
        let order_id = result.order.id();

        match service.cancel_order(order_id).await {
            Err(SyncError::CancelBroadcastFailed(_)) => {}
            other => panic!("expected CancelBroadcastFailed, got {:?}", other.map(|_| ())),
        }
        // The local cancellation stuck even though the error surfaced.
        assert!(service.book_state().buy_orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unknown_id_is_noop_without_broadcast() {
        // No request expectations: any broadcast attempt would fail the test.
        let transport = MockPeerTransport::new();

        let service = SyncService::new(test_config(NodeRole::Client), Arc::new(transport));
        match service.cancel_order(Uuid::new_v4()).await {
            Ok(None) => {}
            other => panic!("expected a silent no-op, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_role_does_not_broadcast_cancellations() {
        let mut transport = MockPeerTransport::new();
        // Only the submission broadcast is expected; a cancel broadcast would
        // exceed the expectation and fail the test.
        transport
            .expect_request()
            .times(1)
            .returning(|_, _, _| Ok(json!({"status": "ok"})));

        let service = SyncService::new(test_config(NodeRole::Server), Arc::new(transport));
        let result = match service.submit_order(buy_order(dec!(100), dec!(10))).await {
            Ok(result) => result,
            Err(e) => panic!("submission failed: {:?}", e),
        };

        match service.cancel_order(result.order.id()).await {
            Ok(Some(order)) => assert_eq!(order.id(), result.order.id()),
            other => panic!("expected a local cancellation, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_dispatch_skips_own_requests() {
        let service = SyncService::new(
            test_config(NodeRole::Server),
            Arc::new(MockPeerTransport::new()),
        );
        let order = buy_order(dec!(100), dec!(5));
        let reply = service
            .inner
            .dispatch(&peer_submit_payload("node-under-test", &order));

        assert_eq!(reply["status"], "skipped");
        assert_eq!(reply["reason"], "own request");
        assert!(service.book_state().buy_orders.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_applies_peer_submission() {
        let service = SyncService::new(
            test_config(NodeRole::Server),
            Arc::new(MockPeerTransport::new()),
        );
        let order = buy_order(dec!(100), dec!(5));
        let reply = service.inner.dispatch(&peer_submit_payload("peer-node", &order));

        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["rested"], true);
        assert_eq!(service.book_state().buy_orders.len(), 1);

        // Re-delivery of the same order id is rejected by the book.
        let reply = service.inner.dispatch(&peer_submit_payload("peer-node", &order));
        assert_eq!(reply["status"], "error");
    }

    #[tokio::test]
    async fn test_dispatch_rejects_malformed_envelopes() {
        let service = SyncService::new(
            test_config(NodeRole::Server),
            Arc::new(MockPeerTransport::new()),
        );
        for payload in [
            json!("nonsense"),
            json!({"action": "SUBMIT_ORDER", "data": {}}),
            json!({"clientId": "peer", "action": "REBOOT", "data": {}}),
        ] {
            let reply = service.inner.dispatch(&payload);
            assert_eq!(reply["status"], "error", "payload {payload} must be rejected");
        }
    }

    #[tokio::test]
    async fn test_dispatch_get_orderbook_returns_snapshot() {
        let service = SyncService::new(
            test_config(NodeRole::Server),
            Arc::new(MockPeerTransport::new()),
        );
        let order = buy_order(dec!(100), dec!(5));
        service.inner.dispatch(&peer_submit_payload("peer-node", &order));

        let reply = service.inner.dispatch(
            &Envelope::new("peer-node", SyncAction::GetOrderbook, json!({})).to_value(),
        );
        assert_eq!(reply["status"], "ok");
        let buys = match reply["state"]["buyOrders"].as_array() {
            Some(buys) => buys,
            None => panic!("snapshot reply is missing buyOrders"),
        };
        assert_eq!(buys.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_cancel_requires_order_id() {
        let service = SyncService::new(
            test_config(NodeRole::Server),
            Arc::new(MockPeerTransport::new()),
        );
        let reply = service.inner.dispatch(
            &Envelope::new("peer-node", SyncAction::CancelOrder, json!({})).to_value(),
        );
        assert_eq!(reply["status"], "error");

        let reply = service.inner.dispatch(
            &Envelope::new(
                "peer-node",
                SyncAction::CancelOrder,
                json!({"orderId": Uuid::new_v4().to_string()}),
            )
            .to_value(),
        );
        // Unknown id: a no-op, not an error.
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["cancelled"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_orderbook_replaces_book_and_discards_bad_entries() {
        let good_buy = protocol::order_to_wire(&buy_order(dec!(100), dec!(5)));
        let good_sell = protocol::order_to_wire(&match Order::new(
            Side::Sell,
            dec!(120),
            dec!(2),
            "peer-client",
        ) {
            Ok(order) => order,
            Err(e) => panic!("order creation failed: {:?}", e),
        });
        let broken = json!({"type": "buy", "price": -3.0, "amount": 1.0, "clientId": "x"});

        let mut transport = MockPeerTransport::new();
        transport.expect_request().times(1).returning(move |_, _, _| {
            Ok(json!({
                "status": "ok",
                "state": {
                    "buyOrders": [good_buy.clone(), broken.clone()],
                    "sellOrders": [good_sell.clone()],
                    "matches": [],
                },
            }))
        });

        let service = SyncService::new(test_config(NodeRole::Client), Arc::new(transport));
        match service.sync_orderbook().await {
            Ok(()) => {}
            Err(e) => panic!("sync failed: {:?}", e),
        }

        let state = service.book_state();
        assert_eq!(state.buy_orders.len(), 1);
        assert_eq!(state.sell_orders.len(), 1);
        assert!(state.matches.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_orderbook_malformed_reply_leaves_book_untouched() {
        let mut transport = MockPeerTransport::new();
        transport
            .expect_request()
            .times(2)
            .returning(|_, _, _| {
                Ok(json!({"status": "ok", "state": {"buyOrders": 42, "sellOrders": [], "matches": []}}))
            });

        let service = SyncService::new(test_config(NodeRole::Client), Arc::new(transport));
        let order = buy_order(dec!(100), dec!(5));
        service.inner.dispatch(&peer_submit_payload("peer-node", &order));
        assert_eq!(service.book_state().buy_orders.len(), 1);

        match service.sync_orderbook().await {
            Err(SyncError::Protocol(ProtocolError::InvalidState(_))) => {}
            other => panic!("expected InvalidState, got {:?}", other.map(|_| ())),
        }
        // The failed cycle did not wipe the existing book.
        assert_eq!(service.book_state().buy_orders.len(), 1);

        // A repeated malformed snapshot keeps failing without clearing the book.
        match service.sync_orderbook().await {
            Err(_) => {}
            Ok(()) => panic!("expected the second sync to fail"),
        }
        assert_eq!(service.book_state().buy_orders.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_start_announces_until_stopped() {
        let mut transport = MockPeerTransport::new();
        transport.expect_start_link().times(1).returning(|| Ok(()));
        transport.expect_listen().times(1).returning(|_, _| Ok(()));
        transport
            .expect_announce()
            .times(1..)
            .returning(|_, _| Ok(()));
        transport.expect_stop_link().times(1).returning(|| Ok(()));

        let service = SyncService::new(test_config(NodeRole::Server), Arc::new(transport));
        match service.start().await {
            Ok(()) => {}
            Err(e) => panic!("start failed: {:?}", e),
        }

        // Let the announce timer fire a few times.
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        match service.stop().await {
            Ok(()) => {}
            Err(e) => panic!("stop failed: {:?}", e),
        }
    }
}
