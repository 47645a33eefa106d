use std::{
    io::{self, Error, ErrorKind},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::AbortHandle,
};
use tracing::{debug, warn};

use crate::utils::lock;

use super::{
    channel::{Channel, ChannelReader, ChannelWriter, SplitStream},
    ConnectionState, DriverError, DriverEvent, DriverEvents,
};

const READ_BUFFER_SIZE: usize = 0x4000;

/// Sends the terminal [`DriverEvent::Closed`] notification, at most once across all its clones.
#[derive(Clone)]
struct CloseNotifier {
    fired: Arc<AtomicBool>,
    open_readers: Arc<AtomicUsize>,
    state: Arc<Mutex<ConnectionState>>,
    sender: mpsc::UnboundedSender<DriverEvent>,
}

impl CloseNotifier {
    fn notify(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(DriverEvent::Closed);
        }
    }

    /// Called by a reader task once its channel hit EOF or an error. The peer counts as gone once
    /// both channels are, and only then is `Closed` queued, after every chunk either reader sent.
    fn reader_finished(&self) {
        if self.open_readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            *lock(&self.state) = ConnectionState::Closed;
            self.notify();
        }
    }
}

/// The state and channel plumbing shared by both endpoint roles.
///
/// Reading is paused until [`DriverCore::resume`] spawns the reader tasks, so bytes a peer sends
/// right after connecting stay in the socket until the consumer is ready for them.
pub(crate) struct DriverCore {
    state: Arc<Mutex<ConnectionState>>,
    control_writer: AsyncMutex<Option<ChannelWriter>>,
    data_writer: AsyncMutex<Option<ChannelWriter>>,
    paused_readers: Mutex<Option<(ChannelReader, ChannelReader)>>,
    reader_tasks: Mutex<Vec<AbortHandle>>,
    events: Mutex<Option<DriverEvents>>,
    sender: mpsc::UnboundedSender<DriverEvent>,
    notifier: CloseNotifier,
    closing: watch::Sender<bool>,
}

impl DriverCore {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);
        let state = Arc::new(Mutex::new(ConnectionState::Idle));
        let notifier = CloseNotifier {
            fired: Arc::new(AtomicBool::new(false)),
            open_readers: Arc::new(AtomicUsize::new(0)),
            state: Arc::clone(&state),
            sender: sender.clone(),
        };

        Self {
            state,
            control_writer: AsyncMutex::new(None),
            data_writer: AsyncMutex::new(None),
            paused_readers: Mutex::new(None),
            reader_tasks: Mutex::new(Vec::new()),
            events: Mutex::new(Some(receiver)),
            sender,
            notifier,
            closing,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn take_events(&self) -> Option<DriverEvents> {
        lock(&self.events).take()
    }

    /// Moves from `Idle` into `Establishing`. Establishment can only be attempted once.
    pub fn begin_establishing(&self) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        match *state {
            ConnectionState::Idle => {
                *state = ConnectionState::Establishing {
                    control_ready: false,
                    data_ready: false,
                };
                Ok(())
            }
            ConnectionState::Closed => Err(DriverError::Closed),
            other => Err(DriverError::AlreadyStarted(other)),
        }
    }

    /// Records that one channel's connection completed. The state only becomes `Ready` once the
    /// streams are installed.
    pub fn mark_ready(&self, channel: Channel) {
        if let ConnectionState::Establishing {
            control_ready,
            data_ready,
        } = &mut *lock(&self.state)
        {
            match channel {
                Channel::Control => *control_ready = true,
                Channel::Data => *data_ready = true,
            }
        }
    }

    /// Moves an in-progress establishment into the terminal `Failed` state.
    pub fn fail(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, ConnectionState::Establishing { .. }) {
            *state = ConnectionState::Failed;
        }
    }

    /// Stores both established connections and transitions to `Ready`. If the driver was closed in
    /// the meantime the streams are dropped, which closes them.
    pub async fn install(&self, control: SplitStream, data: SplitStream) -> Result<(), DriverError> {
        if self.is_closing() {
            return Err(DriverError::Closed);
        }

        *self.control_writer.lock().await = Some(control.writer);
        *self.data_writer.lock().await = Some(data.writer);
        *lock(&self.paused_readers) = Some((control.reader, data.reader));

        let mut state = lock(&self.state);
        match *state {
            ConnectionState::Establishing {
                control_ready: true,
                data_ready: true,
            } => {
                *state = ConnectionState::Ready;
                Ok(())
            }
            ConnectionState::Closed => Err(DriverError::Closed),
            other => Err(DriverError::AlreadyStarted(other)),
        }
    }

    /// Starts delivering inbound bytes as events. Calling this again after the readers started
    /// does nothing.
    pub fn resume(&self) -> Result<(), DriverError> {
        match self.state() {
            ConnectionState::Ready => {}
            ConnectionState::Closed => return Err(DriverError::Closed),
            _ => return Err(DriverError::NotConnected),
        }

        let Some((control, data)) = lock(&self.paused_readers).take() else {
            return Ok(());
        };

        let mut tasks = lock(&self.reader_tasks);
        self.notifier.open_readers.store(2, Ordering::Release);
        for (channel, reader) in [(Channel::Control, control), (Channel::Data, data)] {
            let sender = self.sender.clone();
            let notifier = self.notifier.clone();
            let task = tokio::spawn(read_channel(reader, channel, sender, notifier));
            tasks.push(task.abort_handle());
        }

        Ok(())
    }

    /// Writes and flushes all of `data`. A write still blocked when the driver starts closing is
    /// abandoned with [`ErrorKind::ConnectionAborted`], so closing never waits on a stalled peer.
    pub async fn write(&self, channel: Channel, data: &[u8]) -> io::Result<()> {
        let writer = match channel {
            Channel::Control => &self.control_writer,
            Channel::Data => &self.data_writer,
        };

        let write = async {
            let mut guard = writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::NotConnected, format!("The {channel} channel is not connected")))?;
            writer.write_all(data).await?;
            writer.flush().await
        };

        tokio::select! {
            biased;
            _ = self.closed() => Err(Error::new(ErrorKind::ConnectionAborted, format!("The {channel} channel was closed"))),
            result = write => result,
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolves once [`DriverCore::begin_close`] has been called.
    pub async fn closed(&self) {
        let mut receiver = self.closing.subscribe();
        let _ = receiver.wait_for(|closing| *closing).await;
    }

    /// Marks the driver as `Closed` and wakes anything waiting on [`DriverCore::closed`]. Returns
    /// false if this was already called. The state may already read `Closed` if the peer went away
    /// first, in which case the channels still need releasing.
    pub fn begin_close(&self) -> bool {
        if self.closing.send_replace(true) {
            return false;
        }

        *lock(&self.state) = ConnectionState::Closed;
        true
    }

    /// Stops the reader tasks and gracefully shuts down both connections.
    pub async fn release_channels(&self) {
        for task in lock(&self.reader_tasks).drain(..) {
            task.abort();
        }

        drop(lock(&self.paused_readers).take());

        for (channel, writer) in [(Channel::Control, &self.control_writer), (Channel::Data, &self.data_writer)] {
            if let Some(mut writer) = writer.lock().await.take() {
                if let Err(error) = writer.shutdown().await {
                    debug!("Shutting down the {channel} channel failed: {error}");
                }
            }
        }
    }

    pub fn notify_closed(&self) {
        self.notifier.notify();
    }
}

async fn read_channel(
    mut reader: ChannelReader,
    channel: Channel,
    sender: mpsc::UnboundedSender<DriverEvent>,
    notifier: CloseNotifier,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("The peer closed the {channel} channel");
                break;
            }
            Ok(len) => {
                if sender.send(channel.event(Bytes::copy_from_slice(&buf[..len]))).is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!("Reading from the {channel} channel failed: {error}");
                break;
            }
        }
    }

    notifier.reader_finished();
}
