//! Session: one client connection, one upstream connection, two pipelines
//!
//! Every session runs as a single tokio task draining one mailbox, so no
//! two handlers of the same session ever run concurrently. Socket reads
//! and writes live in small per-half tasks (see [`crate::socket`]) that
//! report completions into the mailbox; timers post commands through a
//! weak handle. The task owns the buffers, delay queues, sequence
//! counters and channel state outright — no locks on the data path.
//!
//! Pipeline per direction: Read → Decide → (drop | half-close | stall |
//! corrupt) → Delay/Throttle via the delay queue, or straight into the
//! destination buffer → Write.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::anomaly::{apply_corruption, AnomalyAction, AnomalyEngine};
use crate::buffer::Buffer;
use crate::config::ConfigManager;
use crate::delay_queue::DelayQueue;
use crate::manager::SessionManager;
use crate::metrics::global_metrics;
use crate::scheduler::{Scheduler, TimerId};
use crate::socket::{self, ReadEvent, WriteJob};
use crate::types::{AnomalyProfile, ChannelState, Direction, UpstreamState};

// ── Mailbox ──────────────────────────────────────────────────────────────────

/// Everything a session reacts to, commands and I/O completions alike
#[derive(Debug)]
pub enum SessionMsg {
    /// Begin: snapshot profile, dial upstream
    Start(SocketAddr),
    /// Graceful teardown: stop reading, drain, FIN
    Shutdown,
    /// Abrupt teardown: RST both transports
    ForceClose,
    ConnectDone(io::Result<TcpStream>),
    ConnectTimeout,
    IdleCheck,
    StallTimeout,
    DelayFlush,
    LingerExpired,
    Read(Direction, ReadEvent),
    WriteDone(Direction, io::Result<usize>),
}

/// Shared face of a session: mailbox sender plus idle bookkeeping
///
/// The manager owns these; timer callbacks hold them weakly.
pub struct SessionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<SessionMsg>,
    started: Instant,
    last_activity_ms: AtomicU64,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Post a message onto the session's mailbox; false once it is gone
    pub fn post(&self, msg: SessionMsg) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Time since the last successful I/O completion
    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn record_activity(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }
}

// ── Per-direction pipeline state ─────────────────────────────────────────────

struct Flow {
    buf: Buffer,
    delay: DelayQueue,
    /// Short-write remainder, retried after the buffer drains
    overflow: VecDeque<u8>,
    packet_seq: u64,
    read_paused: bool,
    stalled: bool,
    write_in_progress: bool,
    permits: Option<mpsc::UnboundedSender<()>>,
    writer: Option<mpsc::UnboundedSender<WriteJob>>,
    /// Pacing cursor for throttled packets
    throttle_cursor: Option<Instant>,
}

impl Flow {
    fn new() -> Self {
        Self {
            buf: Buffer::default(),
            delay: DelayQueue::new(),
            overflow: VecDeque::new(),
            packet_seq: 0,
            read_paused: false,
            stalled: false,
            write_in_progress: false,
            permits: None,
            writer: None,
            throttle_cursor: None,
        }
    }

    fn pending_bytes(&self) -> usize {
        self.buf.readable() + self.overflow.len() + self.delay.total_bytes()
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// The per-connection state machine; owned entirely by its task
pub struct Session {
    id: u64,
    engine: AnomalyEngine,
    config: Arc<ConfigManager>,
    scheduler: Scheduler,
    manager: Weak<SessionManager>,
    handle: Arc<SessionHandle>,
    tx: mpsc::UnboundedSender<SessionMsg>,

    /// Client transport, held whole until the upstream dial completes
    client: Option<TcpStream>,
    channels: ChannelState,
    upstream_state: UpstreamState,
    profile: AnomalyProfile,
    profile_version: u32,

    c2s: Flow,
    s2c: Flow,

    reads_cancel: watch::Sender<bool>,
    reset_signal: watch::Sender<bool>,

    connect_timer: Option<TimerId>,
    idle_timer: Option<TimerId>,
    stall_timer: Option<TimerId>,
    delay_timer: Option<TimerId>,
    linger_timer: Option<TimerId>,

    started: Instant,
    shutting_down: bool,
    deregistered: bool,
}

impl Session {
    /// Create the session and its task; does not start I/O
    ///
    /// The caller posts `SessionMsg::Start` once the handle is registered.
    pub fn spawn(
        client: TcpStream,
        manager: Weak<SessionManager>,
        scheduler: Scheduler,
        engine: AnomalyEngine,
        config: Arc<ConfigManager>,
        session_id: u64,
    ) -> Arc<SessionHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle {
            id: session_id,
            tx: tx.clone(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        });

        let (reads_cancel, _) = watch::channel(false);
        let (reset_signal, _) = watch::channel(false);

        let session = Session {
            id: session_id,
            engine,
            config,
            scheduler,
            manager,
            handle: Arc::clone(&handle),
            tx,
            client: Some(client),
            channels: ChannelState::default(),
            upstream_state: UpstreamState::Connecting,
            profile: AnomalyProfile::default(),
            profile_version: 0,
            c2s: Flow::new(),
            s2c: Flow::new(),
            reads_cancel,
            reset_signal,
            connect_timer: None,
            idle_timer: None,
            stall_timer: None,
            delay_timer: None,
            linger_timer: None,
            started: Instant::now(),
            shutting_down: false,
            deregistered: false,
        };

        global_metrics().active_sessions.fetch_add(1, Ordering::Relaxed);
        info!(sid = session_id, "session_created");

        tokio::spawn(session.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMsg>) {
        while let Some(msg) = rx.recv().await {
            self.handle_msg(msg);
            if self.channels.fully_closed() {
                break;
            }
        }
        self.finish();
    }

    fn handle_msg(&mut self, msg: SessionMsg) {
        match msg {
            SessionMsg::Start(upstream) => self.on_start(upstream),
            SessionMsg::Shutdown => self.initiate_shutdown(),
            SessionMsg::ForceClose => self.force_close(),
            SessionMsg::ConnectDone(res) => self.on_connect_done(res),
            SessionMsg::ConnectTimeout => self.on_connect_timeout(),
            SessionMsg::IdleCheck => self.on_idle_check(),
            SessionMsg::StallTimeout => self.on_stall_timeout(),
            SessionMsg::DelayFlush => self.on_delay_flush(),
            SessionMsg::LingerExpired => self.on_linger_expired(),
            SessionMsg::Read(dir, ev) => match ev {
                ReadEvent::Data(data) => self.on_read_data(dir, data),
                ReadEvent::Eof => self.on_read_eof(dir),
                ReadEvent::Error(e) => self.on_read_error(dir, e),
            },
            SessionMsg::WriteDone(dir, res) => self.on_write_done(dir, res),
        }
    }

    fn finish(&mut self) {
        for timer in [
            self.connect_timer.take(),
            self.idle_timer.take(),
            self.stall_timer.take(),
            self.delay_timer.take(),
            self.linger_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.scheduler.cancel(timer);
        }

        self.deregister();

        let lifetime = self.started.elapsed().as_secs();
        global_metrics().active_sessions.fetch_sub(1, Ordering::Relaxed);
        global_metrics().session_lifetime_seconds.observe(lifetime);
        info!(sid = self.id, lifetime_s = lifetime, "session_closed");
    }

    // ── Startup ──────────────────────────────────────────────────────────────

    fn on_start(&mut self, upstream: SocketAddr) {
        self.profile = self.config.get_profile("default");
        self.profile_version = self.profile.version;

        if let Some(client) = &self.client {
            let _ = client.set_nodelay(true);
        }

        let timeout = self.config.server_config().connect_timeout;
        self.connect_timer = Some(self.scheduler.schedule_guarded(timeout, &self.handle, |h| {
            h.post(SessionMsg::ConnectTimeout);
        }));

        debug!(sid = self.id, %upstream, "connecting_upstream");
        let tx = self.tx.clone();
        let mut cancel = self.reset_signal.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                res = TcpStream::connect(upstream) => {
                    let _ = tx.send(SessionMsg::ConnectDone(res));
                }
                _ = cancel.wait_for(|c| *c) => {}
            }
        });
    }

    fn on_connect_done(&mut self, res: io::Result<TcpStream>) {
        if let Some(timer) = self.connect_timer.take() {
            self.scheduler.cancel(timer);
        }
        if self.channels.fully_closed() {
            return;
        }

        let server = match res {
            Ok(server) => server,
            Err(e) => {
                warn!(sid = self.id, error = %e, "connect_failed");
                global_metrics().connect_failures_total.fetch_add(1, Ordering::Relaxed);
                self.upstream_state = UpstreamState::Failed;
                self.force_close();
                return;
            }
        };

        let Some(client) = self.client.take() else {
            return;
        };
        let _ = server.set_nodelay(true);
        self.upstream_state = UpstreamState::Connected;
        info!(sid = self.id, "upstream_connected");

        let (client_rd, client_wr) = client.into_split();
        let (server_rd, server_wr) = server.into_split();

        // c2s reads the client and writes the server; s2c the reverse
        self.c2s.permits = Some(self.spawn_reader(client_rd, Direction::ClientToServer));
        self.s2c.permits = Some(self.spawn_reader(server_rd, Direction::ServerToClient));
        self.c2s.writer = Some(self.spawn_writer(server_wr, Direction::ClientToServer));
        self.s2c.writer = Some(self.spawn_writer(client_wr, Direction::ServerToClient));

        self.handle.record_activity();
        self.arm_idle_timer();
        self.grant_read(Direction::ClientToServer);
        self.grant_read(Direction::ServerToClient);
    }

    fn spawn_reader(&self, rd: OwnedReadHalf, dir: Direction) -> mpsc::UnboundedSender<()> {
        let (permit_tx, permit_rx) = mpsc::unbounded_channel();
        let tx = self.tx.clone();
        let cancel = self.reads_cancel.subscribe();
        tokio::spawn(socket::read_loop(rd, permit_rx, cancel, move |ev| {
            let _ = tx.send(SessionMsg::Read(dir, ev));
        }));
        permit_tx
    }

    fn spawn_writer(&self, wr: OwnedWriteHalf, dir: Direction) -> mpsc::UnboundedSender<WriteJob> {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let tx = self.tx.clone();
        let reset = self.reset_signal.subscribe();
        tokio::spawn(socket::write_loop(wr, job_rx, reset, move |res| {
            let _ = tx.send(SessionMsg::WriteDone(dir, res));
        }));
        job_tx
    }

    // ── Read path ────────────────────────────────────────────────────────────

    fn flow(&mut self, dir: Direction) -> &mut Flow {
        match dir {
            Direction::ClientToServer => &mut self.c2s,
            Direction::ServerToClient => &mut self.s2c,
        }
    }

    fn grant_read(&mut self, dir: Direction) {
        if !self.channels.read_open(dir) {
            return;
        }
        let flow = self.flow(dir);
        if flow.read_paused || flow.stalled {
            return;
        }
        if let Some(permits) = &flow.permits {
            let _ = permits.send(());
        }
    }

    fn on_read_data(&mut self, dir: Direction, data: Vec<u8>) {
        if !self.channels.read_open(dir) {
            return;
        }
        self.record_activity();
        self.flow(dir).packet_seq += 1;

        self.process_data(dir, data);

        let flow = self.flow(dir);
        if !flow.overflow.is_empty() || flow.buf.should_pause_reading() {
            flow.read_paused = true;
        } else {
            self.grant_read(dir);
        }
    }

    fn on_read_eof(&mut self, dir: Direction) {
        if !self.channels.read_open(dir) {
            return;
        }
        debug!(sid = self.id, dir = dir.label(), "peer_eof");
        self.close_read(dir);
    }

    fn on_read_error(&mut self, dir: Direction, e: io::Error) {
        // a reset peer ends the read side like an EOF would
        if e.kind() == io::ErrorKind::ConnectionReset {
            self.on_read_eof(dir);
            return;
        }
        if !self.channels.read_open(dir) {
            return;
        }
        warn!(sid = self.id, dir = dir.label(), error = %e, "read_error");
        self.force_close();
    }

    fn process_data(&mut self, dir: Direction, mut data: Vec<u8>) {
        let seq = self.flow(dir).packet_seq;
        let decision = self.engine.decide(&data, dir, self.id, seq, &self.profile);

        match decision.action {
            AnomalyAction::Drop => {
                info!(sid = self.id, pkt = seq, dir = dir.label(), bytes = data.len(), "drop");
                global_metrics().packets_dropped_total.fetch_add(1, Ordering::Relaxed);
                return;
            }
            AnomalyAction::HalfClose => {
                info!(sid = self.id, pkt = seq, dir = dir.label(), "half_close");
                global_metrics().half_close_events_total.fetch_add(1, Ordering::Relaxed);
                self.close_write(dir);
                return;
            }
            AnomalyAction::Stall => {
                info!(sid = self.id, pkt = seq, dir = dir.label(), "stall");
                global_metrics().stall_events_total.fetch_add(1, Ordering::Relaxed);
                self.flow(dir).stalled = true;
                self.arm_stall_timer();
                return;
            }
            AnomalyAction::Corrupt => {
                apply_corruption(&mut data, decision.corrupt_offset, decision.corrupt_mask);
                debug!(
                    sid = self.id,
                    pkt = seq,
                    dir = dir.label(),
                    offset = decision.corrupt_offset,
                    "corrupt"
                );
            }
            _ => {}
        }

        if decision.delay_ms > 0 {
            debug!(sid = self.id, pkt = seq, dir = dir.label(), ms = decision.delay_ms, "delay");
            global_metrics().packets_delayed_total.fetch_add(1, Ordering::Relaxed);
            global_metrics()
                .latency_injected_ms
                .observe(u64::from(decision.delay_ms));
            let release = Instant::now() + Duration::from_millis(u64::from(decision.delay_ms));
            self.enqueue_at(dir, data, release, seq);
            return;
        }

        if decision.action == AnomalyAction::Throttle && decision.throttle_bytes_per_sec > 0 {
            // deterministic pacing: each packet releases when the cursor allows
            let pace = Duration::from_millis(
                data.len() as u64 * 1000 / u64::from(decision.throttle_bytes_per_sec),
            );
            let now = Instant::now();
            let flow = self.flow(dir);
            let release = flow.throttle_cursor.map_or(now, |cursor| cursor.max(now));
            flow.throttle_cursor = Some(release + pace);
            self.enqueue_at(dir, data, release, seq);
            return;
        }

        self.deliver(dir, data);
    }

    fn enqueue_at(&mut self, dir: Direction, data: Vec<u8>, release: Instant, seq: u64) {
        let version = self.profile_version;
        let len = data.len();
        if !self.flow(dir).delay.push(data, release, seq, version, dir) {
            warn!(sid = self.id, pkt = seq, bytes = len, "delay_queue_rejected_packet");
            global_metrics().packets_dropped_total.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.delay_timer.is_none() {
            self.schedule_delay_flush();
        }
    }

    fn deliver(&mut self, dir: Direction, data: Vec<u8>) {
        self.append_with_overflow(dir, &data);
        global_metrics().add_bytes(dir, data.len());
        self.start_write(dir);
    }

    fn append_with_overflow(&mut self, dir: Direction, data: &[u8]) {
        let flow = self.flow(dir);
        if flow.overflow.is_empty() {
            let accepted = flow.buf.append(data);
            if accepted < data.len() {
                flow.overflow.extend(&data[accepted..]);
                flow.read_paused = true;
            }
        } else {
            flow.overflow.extend(data);
            flow.read_paused = true;
        }
    }

    fn drain_overflow(&mut self, dir: Direction) {
        let flow = self.flow(dir);
        while !flow.overflow.is_empty() && flow.buf.writable() > 0 {
            let (front, _) = flow.overflow.as_slices();
            let take = front.len().min(flow.buf.writable());
            let accepted = flow.buf.append(&front[..take]);
            if accepted == 0 {
                break;
            }
            flow.overflow.drain(..accepted);
        }
    }

    // ── Delay queue flushing ─────────────────────────────────────────────────

    fn schedule_delay_flush(&mut self) {
        let next = match (
            self.c2s.delay.next_release_time(),
            self.s2c.delay.next_release_time(),
        ) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return,
        };
        let delay = next.saturating_duration_since(Instant::now());
        self.delay_timer = Some(self.scheduler.schedule_guarded(delay, &self.handle, |h| {
            h.post(SessionMsg::DelayFlush);
        }));
    }

    fn on_delay_flush(&mut self) {
        self.delay_timer = None;
        self.flush_delay_queues();
        self.schedule_delay_flush();
    }

    fn flush_delay_queues(&mut self) {
        let now = Instant::now();
        for dir in [Direction::ClientToServer, Direction::ServerToClient] {
            let mut flushed = false;
            while let Some(pkt) = self.flow(dir).delay.pop_ready(now) {
                self.append_with_overflow(dir, &pkt.payload);
                global_metrics().add_bytes(dir, pkt.payload.len());
                flushed = true;
            }
            if flushed {
                self.start_write(dir);
                self.maybe_propagate_fin(dir);
            }
        }
    }

    // ── Write path ───────────────────────────────────────────────────────────

    fn start_write(&mut self, dir: Direction) {
        if !self.channels.write_open(dir) {
            return;
        }
        let flow = self.flow(dir);
        if flow.write_in_progress || flow.buf.is_empty() {
            return;
        }
        let chunk = flow.buf.peek().to_vec();
        flow.write_in_progress = true;
        if let Some(writer) = &flow.writer {
            let _ = writer.send(WriteJob::Data(chunk));
        }
    }

    fn on_write_done(&mut self, dir: Direction, res: io::Result<usize>) {
        self.flow(dir).write_in_progress = false;

        let written = match res {
            Ok(n) => n,
            Err(e) => {
                warn!(sid = self.id, dir = dir.label(), error = %e, "write_error");
                self.close_write(dir);
                return;
            }
        };

        self.record_activity();
        let flow = self.flow(dir);
        flow.buf.consume(written);
        global_metrics()
            .buffer_occupancy_bytes
            .observe(flow.buf.readable() as u64);

        self.drain_overflow(dir);
        self.maybe_resume_reading(dir);

        if !self.flow(dir).buf.is_empty() {
            self.start_write(dir);
        } else {
            self.maybe_propagate_fin(dir);
        }
    }

    fn maybe_resume_reading(&mut self, dir: Direction) {
        if self.shutting_down || !self.channels.read_open(dir) {
            return;
        }
        let flow = self.flow(dir);
        if flow.read_paused
            && !flow.stalled
            && flow.overflow.is_empty()
            && flow.buf.should_resume_reading()
        {
            flow.read_paused = false;
            self.grant_read(dir);
        }
    }

    /// FIN follows the data: once a closed read side has nothing left to
    /// drain, close the opposite write side.
    fn maybe_propagate_fin(&mut self, dir: Direction) {
        if self.channels.read_open(dir) || !self.channels.write_open(dir) {
            return;
        }
        let flow = self.flow(dir);
        if flow.pending_bytes() == 0 && !flow.write_in_progress {
            self.close_write(dir);
        }
    }

    // ── Channel transitions (each side closes at most once) ──────────────────

    fn close_read(&mut self, dir: Direction) {
        let open = match dir {
            Direction::ClientToServer => &mut self.channels.client_read_open,
            Direction::ServerToClient => &mut self.channels.server_read_open,
        };
        if !*open {
            return;
        }
        *open = false;
        self.flow(dir).permits = None;
        self.maybe_propagate_fin(dir);
        self.check_fully_closed();
    }

    fn close_write(&mut self, dir: Direction) {
        let open = match dir {
            Direction::ClientToServer => &mut self.channels.server_write_open,
            Direction::ServerToClient => &mut self.channels.client_write_open,
        };
        if !*open {
            return;
        }
        *open = false;
        if let Some(writer) = self.flow(dir).writer.take() {
            let _ = writer.send(WriteJob::Shutdown);
        }
        self.check_fully_closed();
    }

    fn check_fully_closed(&mut self) {
        if self.channels.fully_closed() {
            debug!(sid = self.id, "fully_closed");
            self.deregister();
        }
    }

    fn deregister(&mut self) {
        if self.deregistered {
            return;
        }
        self.deregistered = true;
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_session(self.id);
        }
    }

    // ── Lifecycle commands ───────────────────────────────────────────────────

    fn initiate_shutdown(&mut self) {
        if self.shutting_down || self.channels.fully_closed() {
            return;
        }
        self.shutting_down = true;
        info!(sid = self.id, "shutdown_initiated");

        self.channels.client_read_open = false;
        self.channels.server_read_open = false;
        self.c2s.permits = None;
        self.s2c.permits = None;
        self.reads_cancel.send_replace(true);

        // whatever is already drained closes now; the rest drains under
        // the linger backstop
        self.maybe_propagate_fin(Direction::ClientToServer);
        self.maybe_propagate_fin(Direction::ServerToClient);

        if !self.channels.fully_closed() {
            let linger = self.config.server_config().max_linger;
            self.linger_timer = Some(self.scheduler.schedule_guarded(linger, &self.handle, |h| {
                h.post(SessionMsg::LingerExpired);
            }));
        }
    }

    fn on_linger_expired(&mut self) {
        self.linger_timer = None;
        if !self.channels.fully_closed() {
            warn!(sid = self.id, "linger_expired");
            self.force_close();
        }
    }

    fn force_close(&mut self) {
        if self.channels.fully_closed() {
            return;
        }
        info!(sid = self.id, "force_close");

        self.channels.client_read_open = false;
        self.channels.client_write_open = false;
        self.channels.server_read_open = false;
        self.channels.server_write_open = false;

        self.c2s.permits = None;
        self.s2c.permits = None;
        self.reads_cancel.send_replace(true);
        self.reset_signal.send_replace(true);

        // pre-connect: the client socket is still whole
        if let Some(client) = self.client.take() {
            socket::force_reset(&client);
        }

        self.deregister();
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    fn record_activity(&mut self) {
        self.handle.record_activity();
    }

    fn arm_idle_timer(&mut self) {
        let timeout = self.config.server_config().idle_timeout;
        self.idle_timer = Some(self.scheduler.schedule_guarded(timeout, &self.handle, |h| {
            h.post(SessionMsg::IdleCheck);
        }));
    }

    fn on_idle_check(&mut self) {
        self.idle_timer = None;
        if self.shutting_down || self.channels.fully_closed() {
            return;
        }
        let timeout = self.config.server_config().idle_timeout;
        let idle = self.handle.idle_time();
        if idle >= timeout {
            info!(sid = self.id, "idle_timeout");
            self.initiate_shutdown();
        } else {
            let remaining = timeout - idle;
            self.idle_timer = Some(self.scheduler.schedule_guarded(remaining, &self.handle, |h| {
                h.post(SessionMsg::IdleCheck);
            }));
        }
    }

    fn arm_stall_timer(&mut self) {
        if self.stall_timer.is_some() {
            return;
        }
        let timeout = self.config.server_config().stall_timeout;
        self.stall_timer = Some(self.scheduler.schedule_guarded(timeout, &self.handle, |h| {
            h.post(SessionMsg::StallTimeout);
        }));
    }

    fn on_stall_timeout(&mut self) {
        self.stall_timer = None;
        if self.channels.fully_closed() {
            return;
        }
        warn!(sid = self.id, "stall_timeout");
        self.force_close();
    }

    fn on_connect_timeout(&mut self) {
        self.connect_timer = None;
        if self.upstream_state != UpstreamState::Connecting {
            return;
        }
        warn!(sid = self.id, "connect_timeout");
        global_metrics().connect_failures_total.fetch_add(1, Ordering::Relaxed);
        self.upstream_state = UpstreamState::Failed;
        self.force_close();
    }
}
