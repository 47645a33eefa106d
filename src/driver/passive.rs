use std::{
    ffi::OsString,
    io,
    process::Stdio,
    sync::Mutex,
};

use tokio::{io::AsyncWriteExt, process::Command, sync::Mutex as AsyncMutex, try_join};
use tracing::{debug, info, warn};

use crate::{address::SocketEndpoint, utils::lock};

use super::{
    channel::{Channel, Listener, SplitStream},
    shared::DriverCore,
    ConnectionState, DriverError, DriverEvents, EndpointDriver,
};

pub const DEFAULT_HELPER_PROGRAM: &str = "swtpm_proxy";

/// Where a [`PassiveEndpoint`] listens, and what the bridging helper should expose to the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassiveConfig {
    pub backend_control: SocketEndpoint,
    pub backend_data: SocketEndpoint,
    /// Passed to the helper as-is, for example `unix:path=/run/tpm/ctrl.sock,mode=777`.
    pub frontend_control: String,
}

impl PassiveConfig {
    /// A configuration with both backend listeners on ephemeral localhost TCP ports.
    pub fn new(frontend_control: impl Into<String>) -> Self {
        Self {
            backend_control: SocketEndpoint::default(),
            backend_data: SocketEndpoint::default(),
            frontend_control: frontend_control.into(),
        }
    }
}

/// The addresses handed to a bridging helper once both backend listeners are bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperArgs {
    pub backend_control: SocketEndpoint,
    pub backend_data: SocketEndpoint,
    pub frontend_control: String,
}

impl HelperArgs {
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--backend-control".to_string(),
            self.backend_control.to_string(),
            "--backend-data".to_string(),
            self.backend_data.to_string(),
            "--frontend-control".to_string(),
            self.frontend_control.clone(),
        ]
    }
}

/// A running bridging helper.
pub trait HelperProcess: Send {
    /// Asks the helper to stop. Must not fail if it has already exited.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Starts the bridging helper that connects a simulator to a [`PassiveEndpoint`]'s listeners.
pub trait HelperLauncher {
    fn launch(&self, args: &HelperArgs) -> io::Result<Box<dyn HelperProcess>>;
}

impl HelperProcess for tokio::process::Child {
    fn terminate(&mut self) -> io::Result<()> {
        match self.try_wait()? {
            Some(status) => {
                debug!("Bridging helper already exited with {status}");
                Ok(())
            }
            None => self.start_kill(),
        }
    }
}

/// Launches the bridging helper as a child process, with stdio inherited from this process.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: OsString,
    leading_args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Adds arguments placed before the backend and frontend addresses.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_HELPER_PROGRAM)
    }
}

impl HelperLauncher for CommandLauncher {
    fn launch(&self, args: &HelperArgs) -> io::Result<Box<dyn HelperProcess>> {
        let child = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args.to_args())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        info!("Launched bridging helper {:?} with pid {:?}", self.program, child.id());
        Ok(Box::new(child))
    }
}

/// An endpoint driver that listens on backend sockets and has a bridging helper connect the
/// simulator to them.
pub struct PassiveEndpoint {
    core: DriverCore,
    launcher: Box<dyn HelperLauncher + Send + Sync>,
    listeners: Mutex<Option<(Listener, Listener)>>,
    helper: Mutex<Option<Box<dyn HelperProcess>>>,
    /// Held by [`PassiveEndpoint::listen_and_wait`] for as long as it owns listeners or accepted
    /// streams, so closing can wait for those to be released before stopping the helper.
    establishing: AsyncMutex<()>,
}

impl PassiveEndpoint {
    pub fn new<L: HelperLauncher + Send + Sync + 'static>(launcher: L) -> Self {
        Self {
            core: DriverCore::new(),
            launcher: Box::new(launcher),
            listeners: Mutex::new(None),
            helper: Mutex::new(None),
            establishing: AsyncMutex::new(()),
        }
    }

    /// Binds both backend listeners, launches the helper with their resolved addresses, and waits
    /// until exactly one connection was accepted on each.
    ///
    /// Fails without launching the helper if either listener can't be bound. There is no built-in
    /// timeout. Calling [`EndpointDriver::close`] while this is pending aborts the wait.
    pub async fn listen_and_wait(&self, config: &PassiveConfig) -> Result<(), DriverError> {
        let _establishing = self.establishing.lock().await;
        self.core.begin_establishing()?;

        let listeners = match try_join!(Listener::bind(&config.backend_control), Listener::bind(&config.backend_data)) {
            Ok(listeners) => listeners,
            Err(error) => {
                self.core.fail();
                return Err(DriverError::Io(error));
            }
        };

        let resolved = listeners.0.local_endpoint().and_then(|control| Ok((control, listeners.1.local_endpoint()?)));
        let args = match resolved {
            Ok((backend_control, backend_data)) => HelperArgs {
                backend_control,
                backend_data,
                frontend_control: config.frontend_control.clone(),
            },
            Err(error) => {
                self.core.fail();
                return Err(DriverError::Io(error));
            }
        };
        info!("Listening for control on {} and data on {}", args.backend_control, args.backend_data);

        match self.launcher.launch(&args) {
            Ok(helper) => *lock(&self.helper) = Some(helper),
            Err(error) => {
                self.core.fail();
                return Err(DriverError::Helper(error));
            }
        }

        let (mut control, mut data) = (None, None);
        let result = loop {
            tokio::select! {
                biased;
                _ = self.core.closed() => break Err(DriverError::Closed),
                result = self.accept_channel(Channel::Control, &listeners.0), if control.is_none() => match result {
                    Ok(stream) => control = Some(stream),
                    Err(error) => break Err(DriverError::Io(error)),
                },
                result = self.accept_channel(Channel::Data, &listeners.1), if data.is_none() => match result {
                    Ok(stream) => data = Some(stream),
                    Err(error) => break Err(DriverError::Io(error)),
                },
            }

            if control.is_some() && data.is_some() {
                break Ok(());
            }
        };

        match (result, control, data) {
            (Ok(()), Some(control), Some(data)) => {
                *lock(&self.listeners) = Some(listeners);
                self.core.install(control, data).await?;
                info!("Both backend channels connected");
                Ok(())
            }
            (result, control, data) => {
                self.core.fail();
                drop(listeners);
                for mut stream in [control, data].into_iter().flatten() {
                    if let Err(error) = stream.writer.shutdown().await {
                        debug!("Shutting down a half-established channel failed: {error}");
                    }
                }

                Err(result.err().unwrap_or(DriverError::Closed))
            }
        }
    }

    async fn accept_channel(&self, channel: Channel, listener: &Listener) -> io::Result<SplitStream> {
        let (stream, from) = listener.accept().await?;
        debug!("Accepted the {channel} channel from {from}");
        self.core.mark_ready(channel);
        Ok(stream)
    }
}

impl EndpointDriver for PassiveEndpoint {
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

    /// Stops both listeners, ends the accepted connections, and then terminates the helper.
    async fn close(&self) {
        if !self.core.begin_close() {
            return;
        }

        // An establishment in progress drops its own listeners and streams once it sees the close.
        drop(self.establishing.lock().await);
        drop(lock(&self.listeners).take());
        self.core.release_channels().await;

        let helper = lock(&self.helper).take();
        if let Some(mut helper) = helper {
            if let Err(error) = helper.terminate() {
                warn!("Could not terminate the bridging helper: {error}");
            }
        }

        self.core.notify_closed();
        debug!("Passive endpoint closed");
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }
}
