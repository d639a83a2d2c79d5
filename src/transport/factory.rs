//! # Stream Factory
//!
//! Owns one UDP socket and demultiplexes its datagrams into per-endpoint
//! sessions.
//!
//! ## Execution
//! - **Reader task**: receives datagrams, classifies unseen endpoints, routes
//!   the rest to their session. One task, so each endpoint's datagrams are
//!   processed in arrival order.
//! - **Writer task**: flushes sessions with pending output, runs the decay
//!   timer for current-protocol sessions and the timeout reaper. With no
//!   sessions it sleeps until the reader signals a new one.
//!
//! ## Lifetime
//! Tables hold `Arc<dyn Session>`. Anyone using a session holds a clone, taken
//! under the table lock. The reaper removes a session only when it is closed
//! and the table's handle is the last one, so a session is never dropped while
//! the reader, the writer or a consumer is using it. Discovery queues hold
//! `Weak` handles and never keep a session alive.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{FactoryConfig, NetworkConfig, StreamConfig};
use crate::core::opcodes::OpcodeManager;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::legacy_stream::LegacyStream;
use crate::transport::session::{Session, SessionBuilder, SessionState, StreamFamily};
use crate::transport::stream::CurrentStream;
use crate::utils::metrics::{FactoryMetrics, Timer};

/// Builds the built-in [`CurrentStream`] and [`LegacyStream`] sessions.
pub struct DefaultSessionBuilder {
    config: StreamConfig,
    opcodes: Arc<dyn OpcodeManager>,
}

impl DefaultSessionBuilder {
    pub fn new(config: StreamConfig, opcodes: Arc<dyn OpcodeManager>) -> Self {
        Self { config, opcodes }
    }
}

impl SessionBuilder for DefaultSessionBuilder {
    fn build(
        &self,
        family: StreamFamily,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Arc<dyn Session> {
        match family {
            StreamFamily::Current => Arc::new(CurrentStream::new(
                peer,
                local,
                self.config.clone(),
                Arc::clone(&self.opcodes),
            )),
            StreamFamily::Legacy => Arc::new(LegacyStream::new(
                peer,
                local,
                &self.config,
                Arc::clone(&self.opcodes),
            )),
        }
    }
}

/// Endpoint to session maps, one per family. An endpoint is in at most one.
#[derive(Default)]
struct SessionTables {
    current: HashMap<SocketAddr, Arc<dyn Session>>,
    legacy: HashMap<SocketAddr, Arc<dyn Session>>,
}

impl SessionTables {
    fn get(&self, peer: &SocketAddr) -> Option<&Arc<dyn Session>> {
        self.current.get(peer).or_else(|| self.legacy.get(peer))
    }

    fn insert(&mut self, peer: SocketAddr, session: Arc<dyn Session>) {
        match session.family() {
            StreamFamily::Current => self.current.insert(peer, session),
            StreamFamily::Legacy => self.legacy.insert(peer, session),
        };
    }

    fn len(&self) -> usize {
        self.current.len() + self.legacy.len()
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<dyn Session>> {
        self.current.values().chain(self.legacy.values())
    }
}

/// Newly created sessions not yet claimed by a consumer.
#[derive(Default)]
struct DiscoveryQueues {
    current: VecDeque<Weak<dyn Session>>,
    legacy: VecDeque<Weak<dyn Session>>,
}

impl DiscoveryQueues {
    fn queue(&mut self, family: StreamFamily) -> &mut VecDeque<Weak<dyn Session>> {
        match family {
            StreamFamily::Current => &mut self.current,
            StreamFamily::Legacy => &mut self.legacy,
        }
    }
}

/// State shared between the factory handle and its tasks.
struct Shared {
    config: FactoryConfig,
    builder: Arc<dyn SessionBuilder>,
    tables: Mutex<SessionTables>,
    queues: Mutex<DiscoveryQueues>,
    wake: Notify,
    metrics: Arc<FactoryMetrics>,
}

impl Shared {
    /// Classifies or routes one datagram.
    fn dispatch(&self, datagram: &[u8], peer: SocketAddr, local: SocketAddr) {
        self.metrics.datagram_received(datagram.len());
        if datagram.len() < 2 {
            trace!(peer = %peer, len = datagram.len(), "{}", constants::ERR_SHORT_DATAGRAM);
            self.metrics.datagram_dropped();
            return;
        }

        let (session, created) = {
            let mut tables = self.tables.lock();
            match tables.get(&peer) {
                Some(existing) if existing.state() == SessionState::Closed => {
                    trace!(peer = %peer, "{}", constants::ERR_CLOSED_SESSION);
                    self.metrics.datagram_dropped();
                    return;
                }
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    if tables.len() >= self.config.max_sessions {
                        warn!(
                            peer = %peer,
                            limit = self.config.max_sessions,
                            "{}",
                            constants::ERR_SESSION_LIMIT
                        );
                        self.metrics.datagram_dropped();
                        return;
                    }
                    let family = StreamFamily::classify(datagram);
                    let session = self.builder.build(family, peer, local);
                    tables.insert(peer, Arc::clone(&session));
                    (session, true)
                }
            }
        };

        if created {
            let family = session.family();
            debug!(peer = %peer, %family, "New session");
            self.queues
                .lock()
                .queue(family)
                .push_back(Arc::downgrade(&session));
            self.metrics.session_created(family);
            self.wake.notify_one();
        }

        if let Err(e) = session.process(datagram) {
            debug!(peer = %peer, error = %e, len = datagram.len(), "Session rejected datagram");
            self.metrics.session_error();
        }
        session.touch(Instant::now());
    }

    fn pop(&self, family: StreamFamily) -> Option<Arc<dyn Session>> {
        let mut queues = self.queues.lock();
        let queue = queues.queue(family);
        while let Some(weak) = queue.pop_front() {
            match weak.upgrade() {
                Some(session) if !session.is_closed() => return Some(session),
                _ => continue,
            }
        }
        None
    }

    fn session_count(&self) -> usize {
        self.tables.lock().len()
    }

    /// Writes every session with pending output.
    async fn flush(&self, socket: &UdpSocket) {
        let pinned: Vec<Arc<dyn Session>> = {
            let tables = self.tables.lock();
            tables
                .iter()
                .filter(|session| session.has_pending_output())
                .cloned()
                .collect()
        };

        for session in pinned {
            let peer = session.peer();
            for datagram in session.drain_outbound() {
                match socket.send_to(&datagram, peer).await {
                    Ok(sent) => self.metrics.datagram_sent(sent),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Send failed");
                        self.metrics.send_error();
                    }
                }
            }
        }
    }

    fn decay(&self) {
        let tables = self.tables.lock();
        for session in tables.current.values() {
            session.decay();
        }
    }

    fn check_timeouts(&self, now: Instant) -> usize {
        let _timer = Timer::start("reap");
        let idle = self.config.idle_timeout;
        let mut reaped: Vec<Arc<dyn Session>> = Vec::new();
        {
            let mut guard = self.tables.lock();
            let tables = &mut *guard;
            for table in [&mut tables.current, &mut tables.legacy] {
                let doomed: Vec<SocketAddr> = table
                    .iter()
                    .filter_map(|(peer, session)| {
                        session.check_timeout(now, idle);
                        (session.is_closed() && Arc::strong_count(session) == 1).then_some(*peer)
                    })
                    .collect();
                for peer in doomed {
                    if let Some(session) = table.remove(&peer) {
                        reaped.push(session);
                    }
                }
            }
        }

        for session in &reaped {
            debug!(peer = %session.peer(), family = %session.family(), "Session reaped");
            self.metrics.session_reaped();
        }
        reaped.len()
    }
}

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// UDP session demultiplexer.
///
/// ```no_run
/// use std::sync::Arc;
/// use eqstream::config::NetworkConfig;
/// use eqstream::core::opcodes::OpcodeTable;
/// use eqstream::transport::{Session, StreamFactory};
///
/// # async fn run() -> eqstream::error::Result<()> {
/// let factory = StreamFactory::new(NetworkConfig::default(), Arc::new(OpcodeTable::new()));
/// factory.open().await?;
/// while let Some(session) = factory.pop_current() {
///     println!("new client from {}", session.peer());
/// }
/// factory.close().await;
/// # Ok(())
/// # }
/// ```
pub struct StreamFactory {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
    open: AtomicBool,
}

impl StreamFactory {
    /// Factory creating the built-in sessions.
    pub fn new(config: NetworkConfig, opcodes: Arc<dyn OpcodeManager>) -> Self {
        let builder = Arc::new(DefaultSessionBuilder::new(config.stream.clone(), opcodes));
        Self::with_builder(config, builder)
    }

    /// Factory creating sessions through `builder`.
    pub fn with_builder(config: NetworkConfig, builder: Arc<dyn SessionBuilder>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: config.factory,
                builder,
                tables: Mutex::new(SessionTables::default()),
                queues: Mutex::new(DiscoveryQueues::default()),
                wake: Notify::new(),
                metrics: Arc::new(FactoryMetrics::new()),
            }),
            running: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    /// Binds the socket and starts the reader and writer tasks.
    ///
    /// # Errors
    /// `ConfigError` when the factory settings fail validation; nothing is
    /// bound and the factory stays closed.
    pub async fn open(&self) -> Result<SocketAddr> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::AlreadyOpen);
        }
        let errors = self.shared.config.validate();
        if !errors.is_empty() {
            self.open.store(false, Ordering::Release);
            warn!(?errors, "Refusing to open with invalid factory config");
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }
        let socket = match UdpSocket::bind(&self.shared.config.address).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.open.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.open.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(run_reader(
            Arc::clone(&socket),
            local_addr,
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        let writer = tokio::spawn(run_writer(socket, Arc::clone(&self.shared), cancel.clone()));

        *self.running.lock() = Some(Running {
            local_addr,
            cancel,
            reader,
            writer,
        });
        info!(address = %local_addr, "Stream factory listening");
        Ok(local_addr)
    }

    /// Stops both tasks, closes every session and empties the tables.
    pub async fn close(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.reader.await {
            warn!(error = %e, "Reader task ended abnormally");
        }
        if let Err(e) = running.writer.await {
            warn!(error = %e, "Writer task ended abnormally");
        }

        let drained: Vec<Arc<dyn Session>> = {
            let mut tables = self.shared.tables.lock();
            let tables = std::mem::take(&mut *tables);
            tables.current.into_values().chain(tables.legacy.into_values()).collect()
        };
        for session in &drained {
            session.close();
        }
        *self.shared.queues.lock() = DiscoveryQueues::default();
        self.open.store(false, Ordering::Release);
        info!(address = %running.local_addr, sessions = drained.len(), "Stream factory closed");
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Bound address while open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    /// Claims the oldest unclaimed current-protocol session.
    pub fn pop_current(&self) -> Option<Arc<dyn Session>> {
        self.shared.pop(StreamFamily::Current)
    }

    /// Claims the oldest unclaimed legacy session.
    pub fn pop_legacy(&self) -> Option<Arc<dyn Session>> {
        self.shared.pop(StreamFamily::Legacy)
    }

    /// Sessions currently in either table.
    pub fn session_count(&self) -> usize {
        self.shared.session_count()
    }

    /// Runs one reaper pass; returns how many sessions were removed.
    ///
    /// The writer runs this on its own timer; calling it directly is for
    /// callers that want a pass at a specific instant.
    pub fn check_timeouts(&self, now: Instant) -> usize {
        self.shared.check_timeouts(now)
    }

    pub fn metrics(&self) -> Arc<FactoryMetrics> {
        Arc::clone(&self.shared.metrics)
    }
}

impl Drop for StreamFactory {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

#[instrument(skip(socket, shared, cancel), fields(local = %local_addr))]
async fn run_reader(
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; shared.config.recv_buffer_size];
    let poll_timeout = shared.config.poll_timeout;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reader cancelled");
                break;
            }
            res = tokio::time::timeout(poll_timeout, socket.recv_from(&mut buf)) => {
                match res {
                    Ok(Ok((len, peer))) => shared.dispatch(&buf[..len], peer, local_addr),
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                    Ok(Err(e)) => {
                        warn!(error = %e, "UDP receive error");
                        continue;
                    }
                    Err(_) => trace!("Poll timeout"),
                }
            }
        }
    }
}

#[instrument(skip_all)]
async fn run_writer(socket: Arc<UdpSocket>, shared: Arc<Shared>, cancel: CancellationToken) {
    let config = &shared.config;
    let mut write_tick = interval(config.write_interval);
    write_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let start = tokio::time::Instant::now();
    let mut decay_tick = interval_at(start + config.decay_interval, config.decay_interval);
    decay_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reap_tick = interval_at(start + config.reap_interval, config.reap_interval);
    reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let idle = shared.session_count() == 0;
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Writer cancelled");
                break;
            }
            _ = shared.wake.notified() => shared.flush(&socket).await,
            _ = write_tick.tick(), if !idle => shared.flush(&socket).await,
            _ = decay_tick.tick(), if !idle => shared.decay(),
            _ = reap_tick.tick() => {
                let reaped = shared.check_timeouts(Instant::now());
                if reaped > 0 {
                    shared.metrics.log_metrics();
                }
            }
        }
    }
}
