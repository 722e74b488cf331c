// Change notification fan-out to subscribers

pub mod dispatcher;
pub mod transport;

pub use dispatcher::NotificationDispatcher;
pub use transport::{LogTransport, MessageTransport};
