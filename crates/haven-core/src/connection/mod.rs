//! The resilient chat socket: state machine, transport and driver task.

mod manager;
mod state;
mod tracker;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{ConnectionEvent, ConnectionManager};
pub use state::{
    ABNORMAL_CLOSURE, CloseDisposition, ConnectionState, ConnectionStatus, HEARTBEAT_TIMEOUT,
    HeartbeatMonitor, NORMAL_CLOSURE, ReconnectPolicy,
};
pub use tracker::{ConnectionTracker, Registration};
pub use transport::{Connector, InboundFrame, OutboundFrame, Socket, WsConnector};
