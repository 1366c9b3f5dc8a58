pub mod auth;
pub mod channel;
pub mod connection;
pub mod ctcp;
pub mod error;
pub mod format;
pub mod irc_parser;
pub mod netsplit;
pub mod nick;
pub mod outbound;
pub mod reconnect;
pub mod rejoin;
pub mod splitter;
pub mod transport;
pub mod types;
pub mod users;

pub use connection::ConnectionManager;
pub use outbound::Outbound;
pub use reconnect::{PingMonitor, ReconnectionManager};
pub use types::{ConnectionStatus, LoggingHandler, MessageHandler, PrivateMessage};
