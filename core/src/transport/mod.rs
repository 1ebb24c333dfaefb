/// Realtime transport: wire events and the persistent connection
pub mod connection;
pub mod protocol;

pub use connection::{Backoff, EventSink, Transport, TransportHandle};
pub use protocol::{ClientEvent, ConnectionState, ServerEvent, TransportEvent};
