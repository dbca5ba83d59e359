//! Tunnel session: couples the peer byte stream with the virtual
//! interface and owns the forwarding lifecycle.
//!
//! Two tasks run per session: ingress appends stream bytes to the
//! demultiplexer, writes each extracted datagram to the interface, and
//! publishes parsed records to the fanout hub; egress polls the interface
//! every 5 ms and writes non-empty reads to the stream. `stop()` is
//! idempotent and collapses concurrent callers onto one cleanup.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ipnet::Ipv6Net;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::constants::{
    EGRESS_POLL_INTERVAL, EGRESS_READ_BUDGET, INGRESS_BUFFER_SIZE, SHUTDOWN_GRACE_PERIOD,
};
use crate::demux::{Ipv6Demux, parse_record};
use crate::error::{Error, Result};
use crate::fanout::{PacketConsumer, PacketHub, PacketStream, SubscriptionId};
use crate::netconfig;
use crate::protocol::TunnelParameters;
use crate::registry;

use super::{TunDevice, open_tun};

/// Lifecycle of a tunnel session. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session exists but the interface has not been configured here.
    Created,
    /// Interface open and configured; forwarding not yet started.
    Configured,
    /// Both data paths running.
    Forwarding,
    /// Cleanup in progress.
    Stopping,
    /// Cleanup finished; the session is not reusable.
    Stopped,
}

/// Forwarding counters, readable while the session runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Datagrams written to the interface (peer -> interface).
    pub packets_in: u64,
    /// Packets written to the stream (interface -> peer).
    pub packets_out: u64,
    /// Bytes written to the interface.
    pub bytes_in: u64,
    /// Bytes written to the stream.
    pub bytes_out: u64,
    /// Packets dropped on per-packet errors.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn record_ingress(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_egress(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TunnelStats {
        TunnelStats {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Monotonic cancellation flag with a waker for sleeping loops.
#[derive(Debug, Default)]
struct CancelFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering, so a cancel between the two
            // loads cannot be missed.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One tunnel: owns the interface handle, the fanout hub, and both
/// forwarding tasks.
pub struct TunnelSession {
    /// Self-reference so `&self` methods can hand task clones out.
    weak: Weak<TunnelSession>,
    device: Arc<dyn TunDevice>,
    params: TunnelParameters,
    hub: PacketHub,
    demux: StdMutex<Ipv6Demux>,
    counters: Counters,
    cancel: CancelFlag,
    state: StdMutex<SessionState>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    stop_gate: AsyncMutex<bool>,
    registry_token: StdMutex<Option<u64>>,
}

impl TunnelSession {
    /// Open the host TUN device, assign the negotiated address and MTU,
    /// and install a host route for the server address.
    ///
    /// Any failure tears down partial state and surfaces as
    /// [`Error::Setup`]. The session is registered for process-wide
    /// shutdown handling.
    pub fn setup_interface(
        params: TunnelParameters,
        name_hint: Option<&str>,
    ) -> Result<Arc<Self>> {
        let device = open_tun(name_hint).map_err(|err| Error::Setup {
            message: err.to_string(),
        })?;
        let name = device.name();

        let host_route = Ipv6Net::new(params.server_address, 128).map_err(|err| {
            device.close();
            Error::Setup {
                message: err.to_string(),
            }
        })?;
        let configured = netconfig::configure(
            &name,
            &params.client_address.to_string(),
            u32::from(params.mtu),
        )
        .and_then(|_| netconfig::add_route(&name, &host_route.to_string()));

        if let Err(err) = configured {
            device.close();
            return Err(Error::Setup {
                message: err.to_string(),
            });
        }

        info!(
            interface = %name,
            address = %params.client_address,
            mtu = params.mtu,
            server = %params.server_address,
            "tunnel interface ready"
        );

        let session = Self::build(device, params, SessionState::Configured);
        let token = registry::register(&session);
        *session.registry_token.lock().expect("registry token lock") = Some(token);
        Ok(session)
    }

    /// Wrap an already-prepared device without touching the OS.
    ///
    /// The caller is responsible for interface configuration; the session
    /// starts in [`SessionState::Created`] and is not registered for
    /// process-wide shutdown.
    pub fn from_device(device: Arc<dyn TunDevice>, params: TunnelParameters) -> Arc<Self> {
        Self::build(device, params, SessionState::Created)
    }

    fn build(
        device: Arc<dyn TunDevice>,
        params: TunnelParameters,
        state: SessionState,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            device,
            params,
            hub: PacketHub::new(),
            demux: StdMutex::new(Ipv6Demux::new()),
            counters: Counters::default(),
            cancel: CancelFlag::default(),
            state: StdMutex::new(state),
            tasks: StdMutex::new(Vec::new()),
            stop_gate: AsyncMutex::new(false),
            registry_token: StdMutex::new(None),
        })
    }

    /// Begin forwarding over the peer byte stream.
    ///
    /// Spawns the ingress and egress tasks; returns immediately.
    pub fn start_forwarding<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        {
            let mut state = self.state.lock().expect("state lock");
            match *state {
                SessionState::Created | SessionState::Configured => {
                    *state = SessionState::Forwarding;
                }
                SessionState::Forwarding => {
                    return Err(Error::invalid_argument("forwarding already started"));
                }
                SessionState::Stopping | SessionState::Stopped => {
                    return Err(Error::AlreadyClosed);
                }
            }
        }

        let me = self.weak.upgrade().ok_or(Error::AlreadyClosed)?;
        let (rd, wr) = tokio::io::split(stream);
        let ingress = tokio::spawn(ingress_loop(Arc::clone(&me), rd));
        let egress = tokio::spawn(egress_loop(me, wr));
        self.tasks.lock().expect("task lock").extend([ingress, egress]);
        debug!(interface = %self.device.name(), "forwarding started");
        Ok(())
    }

    /// Stop the tunnel: cancel both data paths, clear the demultiplexer,
    /// drop all subscribers, and close the interface.
    ///
    /// Idempotent; concurrent callers share the single in-flight cleanup.
    /// The stream is torn down abruptly (this is the path taken when the
    /// stream or interface has already failed); use
    /// [`close`](Self::close) for a graceful stream end.
    pub async fn stop(&self) {
        self.shutdown(false).await;
    }

    /// Close the session: stop it, letting the egress task shut the
    /// stream down gracefully so the peer observes a clean end instead
    /// of a dropped socket.
    ///
    /// Waits up to the shutdown grace period for the data paths to wind
    /// down on their own before falling back to aborting them.
    pub async fn close(&self) {
        self.shutdown(true).await;
    }

    async fn shutdown(&self, graceful: bool) {
        // Set cancellation before taking the gate so loops stop winding
        // even while an earlier stop() holds it.
        self.cancel.cancel();

        let mut done = self.stop_gate.lock().await;
        if *done {
            return;
        }

        *self.state.lock().expect("state lock") = SessionState::Stopping;

        let handles: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("task lock").drain(..).collect();
        for mut handle in handles {
            // Cancellation is already visible, so a healthy task exits on
            // its own; on the graceful path that lets the egress loop run
            // its stream shutdown before teardown.
            if graceful
                && tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut handle)
                    .await
                    .is_ok()
            {
                continue;
            }
            // A task blocked on stream backpressure cannot observe the
            // flag; aborting drops its stream half, destroying the socket.
            handle.abort();
            let _ = handle.await;
        }

        self.demux.lock().expect("demux lock").clear();
        self.hub.close();
        self.device.close();

        if let Some(token) = self.registry_token.lock().expect("registry token lock").take() {
            registry::unregister(token);
        }

        *self.state.lock().expect("state lock") = SessionState::Stopped;
        *done = true;
        info!(interface = %self.device.name(), "tunnel stopped");
    }

    /// Register a push consumer for parsed packet records.
    pub fn subscribe(&self, consumer: Arc<dyn PacketConsumer>) -> Result<SubscriptionId> {
        if self.is_stopped() {
            return Err(Error::AlreadyClosed);
        }
        Ok(self.hub.subscribe(consumer))
    }

    /// Remove a push consumer.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Create a pull-style stream of packet records.
    pub fn packet_stream(&self) -> Result<PacketStream> {
        if self.is_stopped() {
            return Err(Error::AlreadyClosed);
        }
        Ok(self.hub.packet_stream())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    /// Forwarding counters snapshot.
    pub fn stats(&self) -> TunnelStats {
        self.counters.snapshot()
    }

    /// Negotiated tunnel parameters.
    pub fn params(&self) -> &TunnelParameters {
        &self.params
    }

    /// Name of the owned interface.
    pub fn interface_name(&self) -> String {
        self.device.name()
    }

    fn is_stopped(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Stopping | SessionState::Stopped
        )
    }
}

/// Full client lifecycle: perform the handshake on the stream, bring up
/// the interface for the negotiated parameters, then start forwarding on
/// the same stream.
pub async fn connect<S>(mut stream: S, name_hint: Option<&str>) -> Result<Arc<TunnelSession>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let params = crate::handshake::perform_handshake(&mut stream).await?;
    let session = TunnelSession::setup_interface(params, name_hint)?;
    session.start_forwarding(stream)?;
    Ok(session)
}

fn spawn_stop(session: &Arc<TunnelSession>) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        session.stop().await;
    });
}

/// Peer -> interface: demultiplex stream bytes, write datagrams to the
/// device, publish parsed records.
async fn ingress_loop<R>(session: Arc<TunnelSession>, mut rd: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; INGRESS_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = session.cancel.cancelled() => break,
            res = rd.read(&mut buf) => match res {
                Ok(0) => {
                    debug!("peer closed the stream");
                    spawn_stop(&session);
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    warn!(%err, "stream read failed");
                    spawn_stop(&session);
                    break;
                }
            },
        };

        let datagrams = session.demux.lock().expect("demux lock").push(&buf[..n]);
        let mut interface_closed = false;
        for datagram in datagrams {
            match session.device.write_packet(&datagram) {
                Ok(_) => session.counters.record_ingress(datagram.len()),
                Err(Error::AlreadyClosed) => {
                    interface_closed = true;
                    break;
                }
                Err(err) => {
                    // One bad packet does not tear down the tunnel.
                    warn!(%err, "interface write failed, dropping packet");
                    session.counters.record_dropped();
                }
            }

            if let Some(record) = parse_record(&datagram) {
                session.hub.publish(&record);
            }
        }

        if interface_closed {
            debug!("interface closed, stopping tunnel");
            spawn_stop(&session);
            break;
        }
    }
}

/// Interface -> peer: poll the device on a fixed tick and forward
/// non-empty reads to the stream.
async fn egress_loop<W>(session: Arc<TunnelSession>, mut wr: W)
where
    W: AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval(EGRESS_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if session.cancel.is_cancelled() {
            break;
        }

        match session.device.read_packet(EGRESS_READ_BUDGET) {
            Ok(packet) if packet.is_empty() => {}
            Ok(packet) => {
                if let Err(err) = wr.write_all(&packet).await {
                    warn!(%err, "stream write failed");
                    spawn_stop(&session);
                    break;
                }
                session.counters.record_egress(packet.len());
            }
            Err(Error::AlreadyClosed) => {
                debug!("interface closed, stopping egress");
                spawn_stop(&session);
                break;
            }
            Err(err) => {
                warn!(%err, "interface read failed");
                session.counters.record_dropped();
            }
        }
    }

    let _ = wr.shutdown().await;
}

// =============================================================================
// Tests
// =============================================================================
