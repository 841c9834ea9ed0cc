// Expose the modules
pub mod config;
pub mod orderbook;
pub mod protocol;
pub mod sync;
pub mod transport;
pub mod types;

// Re-export key types for easier usage
pub use config::{Config, NodeRole};
pub use orderbook::{AddOrderResult, OrderBook, OrderBookError, OrderBookState};
pub use protocol::{Envelope, ProtocolError, SyncAction};
pub use sync::{SyncError, SyncService};
pub use transport::{InboundHandler, MemoryHub, MemoryTransport, PeerTransport, TransportError};
pub use types::{MatchError, Order, OrderError, OrderMatch, OrderStatus, Side};
