use std::io;

use tokio::try_join;
use tracing::{debug, info};

use crate::address::SocketEndpoint;

use super::{
    channel::{self, Channel, SplitStream},
    shared::DriverCore,
    ConnectionState, DriverError, DriverEvents, EndpointDriver,
};

/// An endpoint driver that connects out to an already-running simulator.
pub struct ActiveEndpoint {
    core: DriverCore,
}

impl ActiveEndpoint {
    pub fn new() -> Self {
        Self { core: DriverCore::new() }
    }

    /// Creates a driver and connects it to the given control and data endpoints.
    pub async fn connect_to(control: &SocketEndpoint, data: &SocketEndpoint) -> Result<Self, DriverError> {
        let endpoint = Self::new();
        endpoint.connect(control, data).await?;
        Ok(endpoint)
    }

    /// Opens both connections concurrently. If either fails the driver moves to
    /// [`ConnectionState::Failed`] and any connection that did complete is closed.
    ///
    /// There is no built-in timeout. Calling [`EndpointDriver::close`] while this is pending aborts
    /// the attempt.
    pub async fn connect(&self, control: &SocketEndpoint, data: &SocketEndpoint) -> Result<(), DriverError> {
        self.core.begin_establishing()?;
        info!("Connecting to control channel {control} and data channel {data}");

        let result = tokio::select! {
            biased;
            _ = self.core.closed() => return Err(DriverError::Closed),
            result = async { try_join!(self.connect_channel(Channel::Control, control), self.connect_channel(Channel::Data, data)) } => result,
        };

        match result {
            Ok((control, data)) => self.core.install(control, data).await,
            Err(error) => {
                self.core.fail();
                Err(DriverError::Io(error))
            }
        }
    }

    async fn connect_channel(&self, channel: Channel, endpoint: &SocketEndpoint) -> io::Result<SplitStream> {
        let stream = channel::connect_stream(endpoint).await?;
        debug!("Connected the {channel} channel to {endpoint}");
        self.core.mark_ready(channel);
        Ok(stream)
    }
}

impl Default for ActiveEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointDriver for ActiveEndpoint {
    async fn write_control(&self, data: &[u8]) -> io::Result<()> {
        self.core.write(Channel::Control, data).await
    }

    async fn write_data(&self, data: &[u8]) -> io::Result<()> {
        self.core.write(Channel::Data, data).await
    }

    fn take_events(&self) -> Option<DriverEvents> {
        self.core.take_events()
    }

    fn resume(&self) -> Result<(), DriverError> {
        self.core.resume()
    }

    async fn close(&self) {
        if !self.core.begin_close() {
            return;
        }

        self.core.release_channels().await;
        self.core.notify_closed();
        debug!("Active endpoint closed");
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }
}
