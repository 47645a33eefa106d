//! Endpoint drivers: the two roles a proxy side can play on the swtpm control and data channels.
//!
//! An [`ActiveEndpoint`] dials out to a running simulator, while a [`PassiveEndpoint`] listens for
//! one and launches a bridging helper that connects to it. Both are consumed through the
//! [`EndpointDriver`] trait, which delivers inbound bytes as [`DriverEvent`]s once resumed.

use std::io;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

mod active;
mod channel;
mod passive;
mod shared;

pub use active::ActiveEndpoint;
pub use channel::Channel;
pub use passive::{
    CommandLauncher, HelperArgs, HelperLauncher, HelperProcess, PassiveConfig, PassiveEndpoint, DEFAULT_HELPER_PROGRAM,
};

/// Something that happened on an endpoint driver's connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A chunk of bytes arrived on the control channel.
    Control(Bytes),
    /// A chunk of bytes arrived on the data channel.
    Data(Bytes),
    /// The driver reached its terminal state. Sent at most once.
    Closed,
}

pub type DriverEvents = mpsc::UnboundedReceiver<DriverEvent>;

/// The lifecycle of an endpoint driver.
///
/// `Idle -> Establishing -> Ready -> Closed`, with `Establishing -> Failed` when either connection
/// can't be made. Any state may move to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Establishing { control_ready: bool, data_ready: bool },
    Ready,
    Failed,
    Closed,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Transport error: {0}")]
    Io(#[from] io::Error),
    #[error("Could not launch the bridging helper: {0}")]
    Helper(#[source] io::Error),
    #[error("Connection establishment was already attempted (state is {0:?})")]
    AlreadyStarted(ConnectionState),
    #[error("The endpoint is not connected")]
    NotConnected,
    #[error("The endpoint's events were already taken")]
    EventsTaken,
    #[error("The endpoint was closed")]
    Closed,
}

/// The operations a proxy needs from either side of the connection.
///
/// Drivers start paused: no [`DriverEvent::Control`] or [`DriverEvent::Data`] is produced until
/// [`EndpointDriver::resume`] is called, and bytes received before that are not lost.
#[allow(async_fn_in_trait)]
pub trait EndpointDriver {
    /// Writes bytes to the control channel, completing once they were flushed.
    async fn write_control(&self, data: &[u8]) -> io::Result<()>;

    /// Writes bytes to the data channel, completing once they were flushed.
    async fn write_data(&self, data: &[u8]) -> io::Result<()>;

    /// Takes the receiving end of this driver's events. Returns `None` if already taken.
    fn take_events(&self) -> Option<DriverEvents>;

    /// Starts reading from both connections and delivering their bytes as events.
    fn resume(&self) -> Result<(), DriverError>;

    /// Releases every resource held by the driver. Calling this more than once has no further effect.
    async fn close(&self);

    fn state(&self) -> ConnectionState;
}
