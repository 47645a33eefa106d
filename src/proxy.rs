//! The proxy orchestrator: relays both channels between an upstream and a downstream endpoint,
//! reframing the data channel into whole TPM2 packets for the packet handlers.

use std::{fmt, future::Future, io, ops::ControlFlow, pin::Pin, sync::Arc};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncWrite, BufWriter},
};
use tpm2_tcti_proto::{FrameError, Framer, Tpm2Packet};
use tracing::{debug, info, trace, warn};

use crate::{
    driver::{Channel, DriverError, DriverEvent, EndpointDriver},
    pcap::{CaptureWriter, CapturedPacket, Direction},
    utils::{await_if_some, hexdump},
};

/// Which of the proxy's two endpoints something came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Upstream,
    Downstream,
}

impl Side {
    fn closed_exit(self) -> ProxyExit {
        match self {
            Self::Upstream => ProxyExit::UpstreamClosed,
            Self::Downstream => ProxyExit::DownstreamClosed,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => f.write_str("upstream"),
            Self::Downstream => f.write_str("downstream"),
        }
    }
}

/// Why a proxy session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyExit {
    UpstreamClosed,
    DownstreamClosed,
    /// The shutdown future given to [`Proxy::run_until`] completed.
    Shutdown,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid framing on the {side} data channel: {source}")]
    Framing { side: Side, source: FrameError },
    #[error("The handler for {side} packets failed: {source}")]
    Handler { side: Side, source: io::Error },
    #[error("Could not forward {side} control bytes: {source}")]
    Forward { side: Side, source: io::Error },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Lets packet handlers send packets to either endpoint while the proxy is running.
pub struct ProxyHandle<U, D> {
    upstream: Arc<U>,
    downstream: Arc<D>,
}

impl<U, D> Clone for ProxyHandle<U, D> {
    fn clone(&self) -> Self {
        Self {
            upstream: Arc::clone(&self.upstream),
            downstream: Arc::clone(&self.downstream),
        }
    }
}

impl<U: EndpointDriver, D: EndpointDriver> ProxyHandle<U, D> {
    /// Serializes a packet and writes it to the upstream data channel.
    pub async fn send_to_upstream(&self, packet: &Tpm2Packet) -> io::Result<()> {
        self.upstream.write_data(&Framer::serialize(packet)).await
    }

    /// Serializes a packet and writes it to the downstream data channel.
    pub async fn send_to_downstream(&self, packet: &Tpm2Packet) -> io::Result<()> {
        self.downstream.write_data(&Framer::serialize(packet)).await
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn downstream(&self) -> &D {
        &self.downstream
    }
}

/// Relays traffic between two connected endpoint drivers, optionally capturing it.
pub struct Proxy<U, D, W = BufWriter<File>> {
    upstream: Arc<U>,
    downstream: Arc<D>,
    capture: Option<CaptureWriter<W>>,
}

impl<U: EndpointDriver, D: EndpointDriver> Proxy<U, D> {
    pub fn new(upstream: U, downstream: D) -> Self {
        Self {
            upstream: Arc::new(upstream),
            downstream: Arc::new(downstream),
            capture: None,
        }
    }
}

impl<U: EndpointDriver, D: EndpointDriver, W: AsyncWrite + Unpin> Proxy<U, D, W> {
    /// Records every chunk read from either endpoint into `capture`.
    pub fn capture<C: AsyncWrite + Unpin>(self, capture: CaptureWriter<C>) -> Proxy<U, D, C> {
        Proxy {
            upstream: self.upstream,
            downstream: self.downstream,
            capture: Some(capture),
        }
    }

    pub fn handle(&self) -> ProxyHandle<U, D> {
        ProxyHandle {
            upstream: Arc::clone(&self.upstream),
            downstream: Arc::clone(&self.downstream),
        }
    }

    /// Runs the session until either endpoint closes. See [`Proxy::run_until`].
    pub async fn run<FU, UF, FD, DF>(self, on_upstream: FU, on_downstream: FD) -> Result<ProxyExit, ProxyError>
    where
        FU: Fn(ProxyHandle<U, D>, Tpm2Packet) -> UF,
        UF: Future<Output = io::Result<()>>,
        FD: Fn(ProxyHandle<U, D>, Tpm2Packet) -> DF,
        DF: Future<Output = io::Result<()>>,
    {
        self.run_until(on_upstream, on_downstream, std::future::pending()).await
    }

    /// Resumes both endpoints and relays their traffic until one of them closes, an error occurs,
    /// or `shutdown` completes. Both endpoints are closed before this returns.
    ///
    /// Control bytes are forwarded to the other endpoint as they arrive. Data bytes are reframed,
    /// and each packet read from upstream is passed to `on_upstream` (and likewise for downstream).
    /// The handlers are responsible for sending packets onwards through the [`ProxyHandle`]. The
    /// next packet from a side is only handed out once the previous handler call for that side
    /// completed.
    pub async fn run_until<FU, UF, FD, DF, S>(self, on_upstream: FU, on_downstream: FD, shutdown: S) -> Result<ProxyExit, ProxyError>
    where
        FU: Fn(ProxyHandle<U, D>, Tpm2Packet) -> UF,
        UF: Future<Output = io::Result<()>>,
        FD: Fn(ProxyHandle<U, D>, Tpm2Packet) -> DF,
        DF: Future<Output = io::Result<()>>,
        S: Future<Output = ()>,
    {
        let handle = self.handle();
        let Self {
            upstream,
            downstream,
            mut capture,
        } = self;

        let result = relay(&handle, &mut capture, on_upstream, on_downstream, shutdown).await;

        upstream.close().await;
        downstream.close().await;

        if let Some(capture) = capture {
            let records = capture.records();
            match capture.finish().await {
                Ok(_) => debug!("Packet capture finished with {records} records"),
                Err(error) => warn!("Could not flush the packet capture: {error}"),
            }
        }

        match &result {
            Ok(exit) => info!("Proxy session ended: {exit:?}"),
            Err(error) => warn!("Proxy session failed: {error}"),
        }

        result
    }
}

/// One side's framer plus the handler call, if any, still in flight for it.
struct Relay<F> {
    side: Side,
    framer: Framer,
    pending: Option<Pin<Box<F>>>,
}

impl<F: Future<Output = io::Result<()>>> Relay<F> {
    fn new(side: Side) -> Self {
        Self {
            side,
            framer: Framer::new(),
            pending: None,
        }
    }

    /// Starts a handler call for the next complete packet, unless one is already in flight.
    fn dispatch(&mut self, handler: impl FnOnce(Tpm2Packet) -> F) -> Result<(), ProxyError> {
        if self.pending.is_some() {
            return Ok(());
        }

        let side = self.side;
        let packet = self.framer.try_extract_packet().map_err(|source| ProxyError::Framing { side, source })?;
        if let Some(packet) = packet {
            trace!("Dispatching {side} packet {packet:?}");
            self.pending = Some(Box::pin(handler(packet)));
        }

        Ok(())
    }

    fn complete(&mut self, result: io::Result<()>) -> Result<(), ProxyError> {
        self.pending = None;
        result.map_err(|source| ProxyError::Handler { side: self.side, source })
    }

    /// Finishes the handler call in flight and then hands out every complete packet still
    /// buffered, one at a time.
    async fn drain(&mut self, handler: impl Fn(Tpm2Packet) -> F) -> Result<(), ProxyError> {
        loop {
            if let Some(pending) = self.pending.as_mut() {
                let result = pending.await;
                self.complete(result)?;
            }

            self.dispatch(&handler)?;
            if self.pending.is_none() {
                if self.framer.buffered() != 0 {
                    debug!("Discarding {} bytes of an incomplete {} packet", self.framer.buffered(), self.side);
                }
                return Ok(());
            }
        }
    }
}

async fn relay<U, D, W, FU, UF, FD, DF, S>(
    handle: &ProxyHandle<U, D>,
    capture: &mut Option<CaptureWriter<W>>,
    on_upstream: FU,
    on_downstream: FD,
    shutdown: S,
) -> Result<ProxyExit, ProxyError>
where
    U: EndpointDriver,
    D: EndpointDriver,
    W: AsyncWrite + Unpin,
    FU: Fn(ProxyHandle<U, D>, Tpm2Packet) -> UF,
    UF: Future<Output = io::Result<()>>,
    FD: Fn(ProxyHandle<U, D>, Tpm2Packet) -> DF,
    DF: Future<Output = io::Result<()>>,
    S: Future<Output = ()>,
{
    let mut upstream_events = handle.upstream.take_events().ok_or(DriverError::EventsTaken)?;
    let mut downstream_events = handle.downstream.take_events().ok_or(DriverError::EventsTaken)?;
    handle.upstream.resume()?;
    handle.downstream.resume()?;
    info!("Relaying traffic between upstream and downstream");

    let mut upstream_relay = Relay::new(Side::Upstream);
    let mut downstream_relay = Relay::new(Side::Downstream);
    tokio::pin!(shutdown);

    loop {
        upstream_relay.dispatch(|packet| on_upstream(handle.clone(), packet))?;
        downstream_relay.dispatch(|packet| on_downstream(handle.clone(), packet))?;

        let step = tokio::select! {
            event = upstream_events.recv() => {
                relay_event(Side::Upstream, event, &mut upstream_relay.framer, &*handle.downstream, capture).await?
            }
            event = downstream_events.recv() => {
                relay_event(Side::Downstream, event, &mut downstream_relay.framer, &*handle.upstream, capture).await?
            }
            result = await_if_some(&mut upstream_relay.pending) => {
                upstream_relay.complete(result)?;
                ControlFlow::Continue(())
            }
            result = await_if_some(&mut downstream_relay.pending) => {
                downstream_relay.complete(result)?;
                ControlFlow::Continue(())
            }
            _ = &mut shutdown => ControlFlow::Break(ProxyExit::Shutdown),
        };

        let exit = match step {
            ControlFlow::Continue(()) => continue,
            ControlFlow::Break(ProxyExit::Shutdown) => return Ok(ProxyExit::Shutdown),
            ControlFlow::Break(exit) => exit,
        };

        // Packets already received are still delivered, but nothing more is read from either side.
        let drained = async {
            upstream_relay.drain(|packet| on_upstream(handle.clone(), packet)).await?;
            downstream_relay.drain(|packet| on_downstream(handle.clone(), packet)).await
        };

        return tokio::select! {
            result = drained => result.map(|()| exit),
            _ = &mut shutdown => Ok(ProxyExit::Shutdown),
        };
    }
}

/// Captures a chunk read from `side` and passes it on: control bytes straight to the `opposite`
/// endpoint, data bytes into that side's framer.
async fn relay_event<O: EndpointDriver, W: AsyncWrite + Unpin>(
    side: Side,
    event: Option<DriverEvent>,
    framer: &mut Framer,
    opposite: &O,
    capture: &mut Option<CaptureWriter<W>>,
) -> Result<ControlFlow<ProxyExit>, ProxyError> {
    let (channel, chunk) = match event {
        Some(DriverEvent::Control(chunk)) => (Channel::Control, chunk),
        Some(DriverEvent::Data(chunk)) => (Channel::Data, chunk),
        Some(DriverEvent::Closed) | None => {
            info!("The {side} endpoint closed");
            return Ok(ControlFlow::Break(side.closed_exit()));
        }
    };

    let direction = Direction::new(side, channel);
    trace!("Read {} bytes of {direction}:\n{}", chunk.len(), hexdump(&chunk));
    record(capture, direction, &chunk).await;

    match channel {
        Channel::Control => opposite.write_control(&chunk).await.map_err(|source| ProxyError::Forward { side, source })?,
        Channel::Data => framer.ingest(&chunk),
    }

    Ok(ControlFlow::Continue(()))
}

/// Writes a chunk to the capture, if any. A failed write stops capturing for the rest of the session.
async fn record<W: AsyncWrite + Unpin>(capture: &mut Option<CaptureWriter<W>>, direction: Direction, chunk: &Bytes) {
    let Some(writer) = capture else {
        return;
    };

    if let Err(error) = writer.write_packet(&CapturedPacket::now(direction, chunk.clone())).await {
        warn!("Packet capture failed, disabling it: {error}");
        *capture = None;
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io, rc::Rc, sync::Mutex, time::Duration};

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tpm2_tcti_proto::{FrameError, Framer, Tpm2Packet};

    use crate::{
        driver::{ConnectionState, DriverError, DriverEvent, DriverEvents, EndpointDriver},
        pcap::CaptureWriter,
    };

    use super::{Proxy, ProxyError, ProxyExit, Side};

    /// An in-memory driver: events are injected through a sender, writes are recorded.
    struct FakeDriver {
        events: Mutex<Option<DriverEvents>>,
        control: Mutex<Vec<u8>>,
        data: Mutex<Vec<u8>>,
        state: Mutex<ConnectionState>,
        closes: Mutex<u32>,
    }

    impl FakeDriver {
        fn new() -> (Self, mpsc::UnboundedSender<DriverEvent>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            let driver = Self {
                events: Mutex::new(Some(receiver)),
                control: Mutex::new(Vec::new()),
                data: Mutex::new(Vec::new()),
                state: Mutex::new(ConnectionState::Ready),
                closes: Mutex::new(0),
            };

            (driver, sender)
        }
    }

    impl EndpointDriver for FakeDriver {
        async fn write_control(&self, data: &[u8]) -> io::Result<()> {
            self.control.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn write_data(&self, data: &[u8]) -> io::Result<()> {
            self.data.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn take_events(&self) -> Option<DriverEvents> {
            self.events.lock().unwrap().take()
        }

        fn resume(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn close(&self) {
            *self.state.lock().unwrap() = ConnectionState::Closed;
            *self.closes.lock().unwrap() += 1;
        }

        fn state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }
    }

    fn data(packet: &Tpm2Packet) -> DriverEvent {
        DriverEvent::Data(Framer::serialize(packet).freeze())
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_relay_and_close() {
        let (upstream, upstream_events) = FakeDriver::new();
        let (downstream, downstream_events) = FakeDriver::new();
        let proxy = Proxy::new(upstream, downstream);
        let handle = proxy.handle();

        let command = Tpm2Packet::new(0x8001, 0x144, vec![0x00, 0x00]);
        let response = Tpm2Packet::new(0x8001, 0, Bytes::new());

        let (exit, ()) = tokio::join!(
            proxy.run(
                |handle, packet| async move { handle.send_to_downstream(&packet).await },
                |handle, packet| async move { handle.send_to_upstream(&packet).await },
            ),
            async {
                upstream_events.send(DriverEvent::Control(Bytes::from_static(&[0, 0, 0, 0x0B]))).unwrap();
                upstream_events.send(data(&command)).unwrap();
                downstream_events.send(data(&response)).unwrap();
                wait_until(|| !handle.downstream().data.lock().unwrap().is_empty() && !handle.upstream().data.lock().unwrap().is_empty()).await;
                downstream_events.send(DriverEvent::Closed).unwrap();
            }
        );

        assert_eq!(exit.unwrap(), ProxyExit::DownstreamClosed);
        assert_eq!(*handle.downstream().control.lock().unwrap(), [0, 0, 0, 0x0B]);
        assert_eq!(*handle.downstream().data.lock().unwrap(), Framer::serialize(&command)[..]);
        assert_eq!(*handle.upstream().data.lock().unwrap(), Framer::serialize(&response)[..]);
        assert_eq!(handle.upstream().state(), ConnectionState::Closed);
        assert_eq!(*handle.downstream().closes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handlers_run_one_at_a_time() {
        let (upstream, upstream_events) = FakeDriver::new();
        let (downstream, _downstream_events) = FakeDriver::new();
        let proxy = Proxy::new(upstream, downstream);

        let first = Tpm2Packet::new(0x8001, 1, vec![0xAA]);
        let second = Tpm2Packet::new(0x8001, 2, vec![0xBB]);
        let mut burst = Framer::serialize(&first);
        burst.extend_from_slice(&Framer::serialize(&second));
        upstream_events.send(DriverEvent::Data(burst.freeze())).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let handler_log = Rc::clone(&log);
        let exit = proxy
            .run_until(
                move |_, packet| {
                    let log = Rc::clone(&handler_log);
                    async move {
                        log.borrow_mut().push(format!("start {}", packet.code));
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        log.borrow_mut().push(format!("end {}", packet.code));
                        Ok(())
                    }
                },
                |_, _| async { Ok(()) },
                tokio::time::sleep(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        assert_eq!(exit, ProxyExit::Shutdown);
        assert_eq!(*log.borrow(), ["start 1", "end 1", "start 2", "end 2"]);
    }

    #[tokio::test]
    async fn test_fragmented_data_is_reassembled() {
        let (upstream, upstream_events) = FakeDriver::new();
        let (downstream, _downstream_events) = FakeDriver::new();
        let proxy = Proxy::new(upstream, downstream);
        let handle = proxy.handle();

        let packet = Tpm2Packet::new(0x8002, 0x17E, vec![1, 2, 3, 4, 5, 6]);
        let bytes = Framer::serialize(&packet).freeze();
        for chunk in [bytes.slice(..1), bytes.slice(1..4), bytes.slice(4..11), bytes.slice(11..)] {
            upstream_events.send(DriverEvent::Data(chunk)).unwrap();
        }

        let (exit, ()) = tokio::join!(
            proxy.run(
                |handle, packet| async move { handle.send_to_downstream(&packet).await },
                |_, _| async { Ok(()) },
            ),
            async {
                wait_until(|| !handle.downstream().data.lock().unwrap().is_empty()).await;
                upstream_events.send(DriverEvent::Closed).unwrap();
            }
        );

        assert_eq!(exit.unwrap(), ProxyExit::UpstreamClosed);
        assert_eq!(*handle.downstream().data.lock().unwrap(), bytes[..]);
    }

    #[tokio::test]
    async fn test_close_delivers_buffered_packets() {
        let (upstream, upstream_events) = FakeDriver::new();
        let (downstream, _downstream_events) = FakeDriver::new();
        let proxy = Proxy::new(upstream, downstream);
        let handle = proxy.handle();

        let first = Tpm2Packet::new(0x8001, 0, vec![1, 2, 3]);
        let second = Tpm2Packet::new(0x8001, 0x101, vec![4]);
        let mut burst = Framer::serialize(&first);
        burst.extend_from_slice(&Framer::serialize(&second));
        burst.extend_from_slice(&[0x80, 0x01]);
        upstream_events.send(DriverEvent::Data(burst.freeze())).unwrap();
        upstream_events.send(DriverEvent::Closed).unwrap();

        let exit = proxy
            .run(
                |handle, packet| async move {
                    tokio::task::yield_now().await;
                    handle.send_to_downstream(&packet).await
                },
                |_, _| async { Ok(()) },
            )
            .await;

        assert_eq!(exit.unwrap(), ProxyExit::UpstreamClosed);
        let mut expected = Framer::serialize(&first);
        expected.extend_from_slice(&Framer::serialize(&second));
        assert_eq!(*handle.downstream().data.lock().unwrap(), expected[..]);
        assert_eq!(handle.downstream().state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_draining() {
        let (upstream, upstream_events) = FakeDriver::new();
        let (downstream, _downstream_events) = FakeDriver::new();
        let proxy = Proxy::new(upstream, downstream);

        upstream_events.send(data(&Tpm2Packet::new(0x8001, 1, Bytes::new()))).unwrap();
        upstream_events.send(DriverEvent::Closed).unwrap();

        let exit = proxy
            .run_until(
                |_, _| std::future::pending(),
                |_, _| async { Ok(()) },
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await;

        assert_eq!(exit.unwrap(), ProxyExit::Shutdown);
    }

    #[tokio::test]
    async fn test_invalid_size_is_fatal() {
        let (upstream, _upstream_events) = FakeDriver::new();
        let (downstream, downstream_events) = FakeDriver::new();
        let proxy = Proxy::new(upstream, downstream);
        let handle = proxy.handle();

        downstream_events.send(DriverEvent::Data(Bytes::from_static(&[0x80, 0x01, 0, 0, 0, 4, 0, 0, 0, 0]))).unwrap();

        let result = proxy.run(|_, _| async { Ok(()) }, |_, _| async { Ok(()) }).await;
        assert!(matches!(
            result,
            Err(ProxyError::Framing {
                side: Side::Downstream,
                source: FrameError::InvalidSize { size: 4 }
            })
        ));
        assert_eq!(handle.upstream().state(), ConnectionState::Closed);
        assert_eq!(handle.downstream().state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_handler_error_ends_session() {
        let (upstream, upstream_events) = FakeDriver::new();
        let (downstream, _downstream_events) = FakeDriver::new();
        let proxy = Proxy::new(upstream, downstream);

        upstream_events.send(data(&Tpm2Packet::new(0x8001, 1, Bytes::new()))).unwrap();

        let result = proxy
            .run(
                |_, _| async { Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")) },
                |_, _| async { Ok(()) },
            )
            .await;
        assert!(matches!(result, Err(ProxyError::Handler { side: Side::Upstream, .. })));
    }

    #[tokio::test]
    async fn test_capture_records_raw_chunks() {
        let (upstream, upstream_events) = FakeDriver::new();
        let (downstream, _downstream_events) = FakeDriver::new();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.pcap");
        let proxy = Proxy::new(upstream, downstream).capture(CaptureWriter::create(&path).await.unwrap());

        upstream_events.send(DriverEvent::Control(Bytes::from_static(&[1, 2]))).unwrap();
        upstream_events.send(DriverEvent::Data(Bytes::from_static(&[0x80, 0x01, 0x00]))).unwrap();
        upstream_events.send(DriverEvent::Closed).unwrap();

        proxy.run(|_, _| async { Ok(()) }, |_, _| async { Ok(()) }).await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 24 + (16 + 28 + 2) + (16 + 28 + 3));
    }
}
