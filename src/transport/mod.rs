//! Connection to the interview orchestration server

pub mod channel;
pub mod protocol;
pub mod websocket;

pub use channel::{
    ChannelStatus, ConnectionState, Connector, Link, Outbound, SubscriptionId, TransportChannel,
    TransportConfig,
};
pub use protocol::{ClientMessage, EventKind, Frame, ServerEvent};
pub use websocket::WebSocketConnector;
