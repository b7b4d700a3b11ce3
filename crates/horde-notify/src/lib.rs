//! Notification delivery for the Horde build scheduler.
//!
//! The scheduler raises notifications synchronously through
//! [`horde_core::ports::NotificationSink`]. Sinks here fan those calls out,
//! log them, or queue them for asynchronous delivery to subscribers.

pub mod dispatch;
pub mod hub;
pub mod logging;

pub use dispatch::{
    Dispatcher, JsonLogSubscriber, NotificationSubscriber, NotifyError, QueuedSink, queued,
};
pub use hub::NotificationHub;
pub use logging::LoggingSink;
