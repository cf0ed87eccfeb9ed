// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! per-endpoint sessions.
//!
//! A session owns one TCP connection and multiplexes every tag that
//! resolved to the same endpoint identity over it. Each session runs as a
//! task on the background I/O thread: it drains a command channel, keeps
//! at most one request group on the wire, correlates replies by sender
//! context or connected sequence number, expires deadlines and drives
//! auto-sync. Packing folds several eligible requests into one Multiple
//! Service Packet.

use crate::attr::{PlcKind, Protocol};
use crate::modbus::RegisterType;
use crate::slice::{hex_dump, Slice};
use crate::tag::{self, TagCore, TagId};
use crate::{cip, eip, modbus, pccc};
use crate::{ErrorKind, Status};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// default per-operation timeout when the caller passes zero
pub(crate) const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(5000);

/// reconnect backoff bounds
const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CEILING: Duration = Duration::from_secs(5);

/// Forward Open retry bound for the duplicate-connection dance
const FO_MAX_TRIES: u32 = 5;

/// bound on the whole connect dance, socket open through Forward Open
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SECS_PER_TICK: u8 = 10;
const TIMEOUT_TICKS: u8 = 5;
const TIMEOUT_MULTIPLIER: u8 = 1;
const RPI_US: u32 = 1_000_000;
/// our CIP originator identity, echoed by the remote
pub(crate) const VENDOR_ID: u16 = 0xF33D;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0x0002_0000);
static NEXT_CONN_SERIAL: AtomicU64 = AtomicU64::new(1);
static NEXT_ORIG_SERIAL: AtomicU64 = AtomicU64::new(0x0001_0000);

/// what an operation is, for events and state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    /// type-discovery read that a first write needs; synthesizes the
    /// write on completion
    PreRead,
    Write,
}

/// completion cell a user thread can block on
#[derive(Debug)]
pub(crate) struct OpShared {
    state: Mutex<Status>,
    cond: Condvar,
}

impl OpShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Status::Pending),
            cond: Condvar::new(),
        })
    }

    pub fn complete(&self, status: Status) {
        let mut state = self.state.lock();
        if state.is_pending() {
            *state = status;
        }
        self.cond.notify_all();
    }

    /// block until resolved or the deadline passes
    pub fn wait(&self, deadline: std::time::Instant) -> Status {
        let mut state = self.state.lock();
        while state.is_pending() {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return *state;
            }
        }
        *state
    }
}

/// the protocol work a request performs
#[derive(Debug)]
pub(crate) enum TagOp {
    CipRead {
        path: Vec<u8>,
        elem_count: u16,
        /// known buffer capacity; None until type discovery fills it in
        capacity: Option<usize>,
        allow_frag: bool,
    },
    CipWrite {
        path: Vec<u8>,
        type_code: u16,
        struct_handle: Option<u16>,
        elem_count: u16,
        data: Vec<u8>,
        allow_frag: bool,
    },
    PcccRead {
        addr: pccc::Address,
        elements: u16,
        total_bytes: usize,
    },
    PcccWrite {
        addr: pccc::Address,
        elements: u16,
        data: Vec<u8>,
    },
    ModbusRead {
        register: RegisterType,
        start: u16,
        count: u16,
    },
    ModbusWrite {
        register: RegisterType,
        start: u16,
        count: u16,
        data: Vec<u8>,
    },
    /// walk the controller tag directory (`@tags`)
    ListTags { start_instance: u16 },
}

/// a unit of scheduler work
pub(crate) struct Request {
    pub id: u64,
    pub tag: Arc<TagCore>,
    pub kind: OpKind,
    pub op: TagOp,
    pub allow_packing: bool,
    pub connected: bool,
    pub deadline: Instant,
    pub shared: Arc<OpShared>,
    pub aborted: bool,
    started_fired: bool,
    /// bytes already transferred by earlier fragments
    frag_offset: usize,
    /// response data accumulated across fragments
    acc: Vec<u8>,
    /// type info from the first read reply
    discovered: Option<(u16, Option<u16>)>,
}

impl Request {
    pub fn new(
        tag: Arc<TagCore>,
        kind: OpKind,
        op: TagOp,
        allow_packing: bool,
        connected: bool,
        deadline: Instant,
    ) -> Box<Self> {
        Self::with_shared(
            tag,
            kind,
            op,
            allow_packing,
            connected,
            deadline,
            OpShared::new(),
        )
    }

    /// continuation request resolving an earlier operation's waiters
    pub fn with_shared(
        tag: Arc<TagCore>,
        kind: OpKind,
        op: TagOp,
        allow_packing: bool,
        connected: bool,
        deadline: Instant,
        shared: Arc<OpShared>,
    ) -> Box<Self> {
        Box::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            tag,
            kind,
            op,
            allow_packing,
            connected,
            deadline,
            shared,
            aborted: false,
            started_fired: false,
            frag_offset: 0,
            acc: Vec::new(),
            discovered: None,
        })
    }

    fn packable(&self) -> bool {
        self.allow_packing
            && matches!(self.op, TagOp::CipRead { .. } | TagOp::CipWrite { .. })
    }
}

/// commands user threads (and the tag layer) send to a session task
pub(crate) enum SessionCmd {
    Submit(Box<Request>),
    Abort { tag: TagId },
    Attach { tag: Arc<TagCore> },
    Detach { tag: TagId },
}

/// cloneable handle used to talk to a session task
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub key: Arc<str>,
    pub tx: mpsc::UnboundedSender<SessionCmd>,
}

impl SessionHandle {
    pub fn send(&self, cmd: SessionCmd) {
        // a dead session task means the process is shutting down; the
        // pending op will resolve through its own deadline
        let _ = self.tx.send(cmd);
    }
}

/// endpoint configuration shared by every tag on the session
#[derive(Debug, Clone)]
pub(crate) struct EndpointConfig {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub route: Vec<u8>,
    pub plc: Option<PlcKind>,
    pub use_connected: bool,
    pub unit_id: u8,
}

#[derive(Debug)]
struct CipConnection {
    params: cip::ForwardOpen,
    server_conn_id: u32,
    client_conn_id: u32,
    sequence: u16,
}

struct InFlight {
    requests: Vec<Box<Request>>,
    /// sender context for unconnected traffic
    context: u64,
    /// CIP transport sequence for connected traffic
    sequence: u16,
    connected: bool,
    packed: bool,
    /// Modbus transaction id
    transaction_id: u16,
}

pub(crate) struct Session {
    key: Arc<str>,
    config: EndpointConfig,
    rx: mpsc::UnboundedReceiver<SessionCmd>,
    stream: Option<TcpStream>,
    rx_buf: Vec<u8>,
    queue: VecDeque<Box<Request>>,
    in_flight: Option<InFlight>,
    tags: HashMap<TagId, Arc<TagCore>>,
    /// lifetime flag: once every tag detaches the task winds down
    had_tags: bool,
    failed: bool,

    // EIP state
    session_handle: u32,
    context_counter: u64,
    connection: Option<CipConnection>,
    max_packet: u16,
    orig_serial: u32,
    pccc_tns: u16,

    // Modbus state
    transaction_id: u16,
}

impl Session {
    pub fn new(
        key: Arc<str>,
        config: EndpointConfig,
        rx: mpsc::UnboundedReceiver<SessionCmd>,
    ) -> Self {
        let orig_serial = NEXT_ORIG_SERIAL.fetch_add(1, Ordering::Relaxed) as u32;
        Self {
            key,
            config,
            rx,
            stream: None,
            rx_buf: Vec::with_capacity(4096),
            queue: VecDeque::new(),
            in_flight: None,
            tags: HashMap::new(),
            had_tags: false,
            failed: false,
            session_handle: 0,
            context_counter: 1,
            connection: None,
            max_packet: cip::MAX_PACKET_LEGACY,
            orig_serial,
            pccc_tns: 1,
            transaction_id: 0,
        }
    }

    /// session task entry point: connect with backoff, serve until the
    /// socket dies or the last tag detaches, repeat
    pub async fn run(mut self) {
        let mut backoff = BACKOFF_START;
        loop {
            let connected = tokio::time::timeout(CONNECT_TIMEOUT, self.connect())
                .await
                .unwrap_or_else(|_| Err(Status::from(ErrorKind::Timeout)));
            match connected {
                Ok(()) => {
                    info!("session {} connected", self.key);
                    self.failed = false;
                    backoff = BACKOFF_START;
                }
                Err(status) => {
                    debug!("session {} connect failed: {status}", self.key);
                    self.failed = true;
                    self.fail_all(ErrorKind::BadConnection);
                    if !self.idle_wait(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(BACKOFF_CEILING);
                    continue;
                }
            }

            match self.serve().await {
                ServeExit::Shutdown => break,
                ServeExit::SocketError(kind) => {
                    warn!("session {} I/O failed: {}", self.key, kind.decode());
                    self.failed = true;
                    self.teardown_socket(false).await;
                    self.fail_all(ErrorKind::BadConnection);
                }
            }
        }

        self.teardown_socket(true).await;
        self.fail_all(ErrorKind::Abort);
        crate::scheduler::remove_session(&self.key);
        info!("session {} closed", self.key);
    }

    /* ---------------- connect ---------------- */

    async fn connect(&mut self) -> crate::Result<()> {
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            debug!("tcp connect to {}:{} failed: {e}", self.config.host, self.config.port);
            Status::from(ErrorKind::Open)
        })?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);
        self.rx_buf.clear();
        self.in_flight = None;

        if self.config.protocol == Protocol::Eip {
            self.register_session().await?;
            if self.config.use_connected {
                self.forward_open().await?;
            }
        }
        Ok(())
    }

    async fn register_session(&mut self) -> crate::Result<()> {
        let frame = eip::encode_register_session();
        self.write_frame(&frame).await?;
        let frame = self.read_one_frame().await?;
        let input = Slice::new(&frame);
        let header = eip::Header::decode(&input)?;
        let body = input.from(eip::HEADER_LEN);
        self.session_handle = eip::decode_register_session_reply(&header, &body)?;
        debug!(
            "session {} registered, handle {:#010x}",
            self.key, self.session_handle
        );
        Ok(())
    }

    fn forward_open_params(&mut self, extended: bool) -> cip::ForwardOpen {
        cip::ForwardOpen {
            extended,
            secs_per_tick: SECS_PER_TICK,
            timeout_ticks: TIMEOUT_TICKS,
            client_conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed) as u32,
            conn_serial: NEXT_CONN_SERIAL.fetch_add(1, Ordering::Relaxed) as u16,
            vendor_id: VENDOR_ID,
            orig_serial: self.orig_serial,
            timeout_multiplier: TIMEOUT_MULTIPLIER,
            rpi_us: RPI_US,
            max_packet: if extended {
                cip::MAX_PACKET_EX
            } else {
                cip::MAX_PACKET_LEGACY
            },
            conn_path: cip::connection_path(&self.config.route),
        }
    }

    /// Forward Open with the retry ladder: duplicate connections get a
    /// Forward Close against the stale id first, size rejections drop
    /// from the extended to the legacy variant
    async fn forward_open(&mut self) -> crate::Result<()> {
        let mut extended = self.config.plc != Some(PlcKind::MicroLogix800);
        for attempt in 0..FO_MAX_TRIES {
            let params = self.forward_open_params(extended);
            let reply = self.exchange_unconnected(&params.encode()).await?;
            let input = Slice::new(&reply);
            let parsed = cip::decode_reply(&input)?;
            match parsed.status {
                cip::STATUS_OK => {
                    let fo = cip::decode_forward_open_reply(&parsed.payload)?;
                    self.max_packet = params.max_packet;
                    debug!(
                        "session {} forward open ok, conn {:#010x}/{:#010x}, max packet {}",
                        self.key, fo.server_conn_id, fo.client_conn_id, self.max_packet
                    );
                    self.connection = Some(CipConnection {
                        server_conn_id: fo.server_conn_id,
                        client_conn_id: fo.client_conn_id,
                        sequence: 0,
                        params,
                    });
                    return Ok(());
                }
                cip::STATUS_CONN_FAILURE if parsed.extended == Some(cip::EX_DUPLICATE_CONN) => {
                    info!(
                        "session {} duplicate connection, closing stale id (attempt {})",
                        self.key,
                        attempt + 1
                    );
                    let close = params.encode_close();
                    let reply = self.exchange_unconnected(&close).await?;
                    // failure to close just means the stale id timed out
                    if let Ok(parsed) = cip::decode_reply(&Slice::new(&reply)) {
                        let _ = parsed.check();
                    }
                }
                cip::STATUS_CONN_FAILURE if parsed.extended == Some(cip::EX_INVALID_CONN_SIZE) => {
                    if !extended {
                        warn!("session {} rejected even the legacy connection size", self.key);
                        return Err(ErrorKind::BadStatus.into());
                    }
                    info!("session {} renegotiating at the legacy packet size", self.key);
                    extended = false;
                }
                other => {
                    warn!(
                        "session {} forward open failed: {:#04x} ({}) extended {:?}",
                        self.key,
                        other,
                        cip::decode_general_status(other),
                        parsed.extended
                    );
                    return Err(ErrorKind::BadStatus.into());
                }
            }
        }
        Err(ErrorKind::BadStatus.into())
    }

    /// one blocking unconnected exchange, used only during connect
    async fn exchange_unconnected(&mut self, cip_bytes: &[u8]) -> crate::Result<Vec<u8>> {
        let context = self.next_context();
        let wire = if self.config.route.is_empty() {
            eip::encode_send_rr_data(self.session_handle, context, cip_bytes)
        } else {
            let wrapped = cip::encode_unconnected_send(cip_bytes, &self.config.route);
            eip::encode_send_rr_data(self.session_handle, context, &wrapped)
        };
        self.write_frame(&wire).await?;
        loop {
            let frame = self.read_one_frame().await?;
            let input = Slice::new(&frame);
            let header = eip::Header::decode(&input)?;
            if header.sender_context != context {
                debug!(
                    "session {} dropping reply with unmatched context {:#018x}",
                    self.key, header.sender_context
                );
                continue;
            }
            let payload = eip::decode_cpf(&input.sub(eip::HEADER_LEN, header.length as usize))?;
            return Ok(payload.data.bytes().to_vec());
        }
    }

    /* ---------------- serve loop ---------------- */

    async fn serve(&mut self) -> ServeExit {
        loop {
            if self.had_tags && self.tags.is_empty() {
                return ServeExit::Shutdown;
            }

            if self.in_flight.is_none() {
                if let Err(kind) = self.issue_next().await {
                    return ServeExit::SocketError(kind);
                }
            }

            let deadline = self.next_deadline();
            let reading = self.in_flight.is_some();
            tokio::select! {
                biased;

                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        self.handle_cmd(cmd);
                        // drain the burst so packing sees the whole batch
                        while let Ok(cmd) = self.rx.try_recv() {
                            self.handle_cmd(cmd);
                        }
                    }
                    // every handle dropped: tear the session down
                    None => return ServeExit::Shutdown,
                },

                result = Self::read_into(self.stream.as_mut(), &mut self.rx_buf), if reading => {
                    match result {
                        Ok(0) => return ServeExit::SocketError(ErrorKind::Close),
                        Ok(_) => {
                            if let Err(kind) = self.drain_frames() {
                                return ServeExit::SocketError(kind);
                            }
                        }
                        Err(e) => {
                            debug!("session {} read error: {e}", self.key);
                            return ServeExit::SocketError(ErrorKind::Read);
                        }
                    }
                },

                _ = tokio::time::sleep_until(deadline) => {
                    self.expire(Instant::now());
                    self.auto_sync(Instant::now());
                }
            }
        }
    }

    async fn read_into(
        stream: Option<&mut TcpStream>,
        buf: &mut Vec<u8>,
    ) -> std::io::Result<usize> {
        match stream {
            Some(stream) => stream.read_buf(buf).await,
            None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        }
    }

    fn handle_cmd(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::Submit(request) => {
                if self.failed {
                    // fail fast while disconnected; reconnect runs in the
                    // background and auto-sync resumes on its own
                    self.complete_request(request, Status::Err(ErrorKind::BadConnection));
                } else {
                    self.queue.push_back(request);
                }
            }
            SessionCmd::Abort { tag } => {
                let mut aborted = Vec::new();
                self.queue.retain_mut(|request| {
                    if request.tag.id() == tag {
                        aborted.push((
                            Arc::clone(&request.tag),
                            request.kind,
                            Arc::clone(&request.shared),
                        ));
                        false
                    } else {
                        true
                    }
                });
                for (tag, kind, shared) in aborted {
                    shared.complete(Status::Err(ErrorKind::Abort));
                    tag::complete_aborted(&tag, kind);
                }
                // on the wire already: discard its eventual reply
                if let Some(ref mut in_flight) = self.in_flight {
                    for request in in_flight.requests.iter_mut() {
                        if request.tag.id() == tag && !request.aborted {
                            request.aborted = true;
                            request.shared.complete(Status::Err(ErrorKind::Abort));
                            tag::complete_aborted(&request.tag, request.kind);
                        }
                    }
                }
            }
            SessionCmd::Attach { tag } => {
                self.had_tags = true;
                self.tags.insert(tag.id(), tag);
            }
            SessionCmd::Detach { tag } => {
                self.tags.remove(&tag);
            }
        }
    }

    /// wait while disconnected; drains commands so aborts and detaches
    /// still work. Returns false when the session should exit.
    async fn idle_wait(&mut self, backoff: Duration) -> bool {
        let deadline = Instant::now() + backoff;
        loop {
            if self.had_tags && self.tags.is_empty() {
                return false;
            }
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => return false,
                },
                _ = tokio::time::sleep_until(deadline) => return true,
            }
        }
    }

    /* ---------------- deadlines, auto-sync ---------------- */

    fn next_deadline(&self) -> Instant {
        let mut deadline = Instant::now() + Duration::from_secs(60);
        for request in self.queue.iter() {
            deadline = deadline.min(request.deadline);
        }
        if let Some(ref in_flight) = self.in_flight {
            for request in in_flight.requests.iter() {
                if !request.aborted {
                    deadline = deadline.min(request.deadline);
                }
            }
        }
        for tag in self.tags.values() {
            if let Some(at) = tag::auto_sync_deadline(tag) {
                deadline = deadline.min(at);
            }
        }
        deadline
    }

    fn expire(&mut self, now: Instant) {
        // completions may enqueue follow-ups, so split first
        let (expired, keep): (Vec<_>, Vec<_>) = self
            .queue
            .drain(..)
            .partition(|request| request.deadline <= now);
        self.queue = keep.into();
        for request in expired {
            debug!("request {} timed out in queue", request.id);
            self.complete_request(request, Status::Err(ErrorKind::Timeout));
        }

        // in-flight timeouts: resolve the waiters now, discard the reply
        // when (if ever) it shows up
        let mut all_done = false;
        if let Some(ref mut in_flight) = self.in_flight {
            for request in in_flight.requests.iter_mut() {
                if !request.aborted && request.deadline <= now {
                    debug!("request {} timed out on the wire", request.id);
                    request.aborted = true;
                    request.shared.complete(Status::Err(ErrorKind::Timeout));
                    tag::complete_timeout(&request.tag, request.kind);
                }
            }
            all_done = in_flight.requests.iter().all(|r| r.aborted);
        }
        if all_done {
            // the reply, if it comes, will fail correlation and be dropped
            self.in_flight = None;
        }
    }

    fn auto_sync(&mut self, now: Instant) {
        let tags: Vec<_> = self.tags.values().cloned().collect();
        for tag in tags {
            if let Some(request) = tag::auto_sync_tick(&tag, now) {
                self.queue.push_back(request);
            }
        }
    }

    /* ---------------- transmit ---------------- */

    fn next_context(&mut self) -> u64 {
        let context = self.context_counter;
        self.context_counter = self.context_counter.wrapping_add(1).max(1);
        context
    }

    async fn write_frame(&mut self, frame: &[u8]) -> crate::Result<()> {
        trace!("session {} tx:\n{}", self.key, hex_dump(frame));
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(frame).await.map_err(|e| {
                debug!("session {} write error: {e}", self.key);
                Status::from(ErrorKind::Write)
            }),
            None => Err(ErrorKind::BadConnection.into()),
        }
    }

    /// read frames one at a time; only used during the connect dance
    async fn read_one_frame(&mut self) -> crate::Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(Status::from(ErrorKind::BadConnection))?;
        loop {
            if let Some(total) = eip::frame_len(&self.rx_buf) {
                if self.rx_buf.len() >= total {
                    let frame: Vec<u8> = self.rx_buf.drain(..total).collect();
                    trace!("session {} rx:\n{}", self.key, hex_dump(&frame));
                    return Ok(frame);
                }
            }
            let n = stream.read_buf(&mut self.rx_buf).await.map_err(|e| {
                debug!("session {} read error: {e}", self.key);
                Status::from(ErrorKind::Read)
            })?;
            if n == 0 {
                return Err(ErrorKind::Close.into());
            }
        }
    }

    /// keep issuing until a group is on the wire or the queue is empty;
    /// some requests resolve synchronously and must not strand the rest
    async fn issue_next(&mut self) -> Result<(), ErrorKind> {
        while self.in_flight.is_none() {
            let Some(mut head) = self.queue.pop_front() else {
                return Ok(());
            };

            let mut group = Vec::new();
            if head.packable() && self.config.protocol == Protocol::Eip {
                // gather more requests of the same addressing mode while
                // the encoded whole stays under the negotiated packet size
                let mut encoded = vec![self.encode_cip(&mut head)];
                let connected = head.connected;
                group.push(head);
                let mut total: usize = encoded.iter().map(|e| e.len()).sum();
                while let Some(next) = self.queue.front() {
                    if !next.packable() || next.connected != connected {
                        break;
                    }
                    let overhead = cip::multi_overhead(group.len() + 1);
                    let mut next = self.queue.pop_front().expect("checked front");
                    let bytes = self.encode_cip(&mut next);
                    if total + bytes.len() + overhead > self.max_packet as usize {
                        self.queue.push_front(next);
                        break;
                    }
                    total += bytes.len();
                    encoded.push(bytes);
                    group.push(next);
                }
                let packed = encoded.len() > 1;
                let cip_bytes = if packed {
                    debug!("session {} packing {} requests", self.key, group.len());
                    cip::encode_multi(&encoded)
                } else {
                    encoded.pop().expect("one request")
                };
                self.send_group(group, cip_bytes, packed).await?;
            } else {
                match self.config.protocol {
                    Protocol::Eip => {
                        let cip_bytes = self.encode_cip(&mut head);
                        group.push(head);
                        self.send_group(group, cip_bytes, false).await?;
                    }
                    Protocol::Modbus => self.send_modbus(head).await?,
                }
            }
        }
        Ok(())
    }

    async fn send_group(
        &mut self,
        mut group: Vec<Box<Request>>,
        cip_bytes: Vec<u8>,
        packed: bool,
    ) -> Result<(), ErrorKind> {
        for request in group.iter_mut() {
            if !request.started_fired {
                request.started_fired = true;
                tag::operation_started(&request.tag, request.kind);
            }
        }

        let connected = group[0].connected;
        let in_flight = if connected {
            let Some(ref mut connection) = self.connection else {
                let status = Status::Err(ErrorKind::BadConnection);
                for request in group {
                    self.complete_request(request, status);
                }
                return Ok(());
            };
            connection.sequence = connection.sequence.wrapping_add(1);
            let sequence = connection.sequence;
            let wire = eip::encode_send_unit_data(
                self.session_handle,
                connection.server_conn_id,
                sequence,
                &cip_bytes,
            );
            if let Err(status) = self.write_frame(&wire).await {
                let kind = match status {
                    Status::Err(kind) => kind,
                    _ => ErrorKind::Write,
                };
                self.queue_front_all(group);
                return Err(kind);
            }
            InFlight {
                requests: group,
                context: 0,
                sequence,
                connected: true,
                packed,
                transaction_id: 0,
            }
        } else {
            let context = self.next_context();
            let wire = if self.config.route.is_empty() {
                eip::encode_send_rr_data(self.session_handle, context, &cip_bytes)
            } else {
                let wrapped = cip::encode_unconnected_send(&cip_bytes, &self.config.route);
                eip::encode_send_rr_data(self.session_handle, context, &wrapped)
            };
            if let Err(status) = self.write_frame(&wire).await {
                let kind = match status {
                    Status::Err(kind) => kind,
                    _ => ErrorKind::Write,
                };
                self.queue_front_all(group);
                return Err(kind);
            }
            InFlight {
                requests: group,
                context,
                sequence: 0,
                connected: false,
                packed,
                transaction_id: 0,
            }
        };
        self.in_flight = Some(in_flight);
        Ok(())
    }

    fn queue_front_all(&mut self, group: Vec<Box<Request>>) {
        for request in group.into_iter().rev() {
            self.queue.push_front(request);
        }
    }

    async fn send_modbus(&mut self, mut request: Box<Request>) -> Result<(), ErrorKind> {
        if !request.started_fired {
            request.started_fired = true;
            tag::operation_started(&request.tag, request.kind);
        }
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        let unit = self.config.unit_id;
        let wire = match request.op {
            TagOp::ModbusRead { register, start, count } => {
                let (chunk_start, chunk_count) =
                    modbus_chunk(start, count, request.frag_offset, register, true);
                modbus::encode_read(tid, unit, register.read_function(), chunk_start, chunk_count)
            }
            TagOp::ModbusWrite { register, start, count, ref data } => {
                match register {
                    RegisterType::Coil => {
                        if count == 1 {
                            let on = data.first().map(|b| b & 1 != 0).unwrap_or(false);
                            modbus::encode_write_single_coil(tid, unit, start, on)
                        } else {
                            let (chunk_start, chunk_count) =
                                modbus_chunk(start, count, request.frag_offset, register, false);
                            let first_byte = (chunk_start - start) as usize / 8;
                            let byte_count = (chunk_count as usize + 7) / 8;
                            modbus::encode_write_coils(
                                tid,
                                unit,
                                chunk_start,
                                chunk_count,
                                &data[first_byte..first_byte + byte_count],
                            )
                        }
                    }
                    RegisterType::Holding => {
                        if count == 1 {
                            let value = u16::from_le_bytes([
                                data.first().copied().unwrap_or(0),
                                data.get(1).copied().unwrap_or(0),
                            ]);
                            modbus::encode_write_single_register(tid, unit, start, value)
                        } else {
                            let (chunk_start, chunk_count) =
                                modbus_chunk(start, count, request.frag_offset, register, false);
                            let first_byte = (chunk_start - start) as usize * 2;
                            let byte_count = chunk_count as usize * 2;
                            modbus::encode_write_registers(
                                tid,
                                unit,
                                chunk_start,
                                &data[first_byte..first_byte + byte_count],
                            )
                        }
                    }
                    _ => {
                        self.complete_request(request, Status::Err(ErrorKind::NotAllowed));
                        return Ok(());
                    }
                }
            }
            _ => {
                self.complete_request(request, Status::Err(ErrorKind::Unsupported));
                return Ok(());
            }
        };
        if let Err(status) = self.write_frame(&wire).await {
            let kind = match status {
                Status::Err(kind) => kind,
                _ => ErrorKind::Write,
            };
            self.queue.push_front(request);
            return Err(kind);
        }
        self.in_flight = Some(InFlight {
            requests: vec![request],
            context: 0,
            sequence: 0,
            connected: false,
            packed: false,
            transaction_id: tid,
        });
        Ok(())
    }

    /// encode the next wire attempt for a CIP-family request
    fn encode_cip(&mut self, request: &mut Request) -> Vec<u8> {
        match request.op {
            TagOp::CipRead {
                ref path,
                elem_count,
                allow_frag,
                ..
            } => {
                if request.frag_offset == 0 || !allow_frag {
                    cip::encode_read(path, elem_count)
                } else {
                    cip::encode_read_frag(path, elem_count, request.frag_offset as u32)
                }
            }
            TagOp::CipWrite {
                ref path,
                type_code,
                struct_handle,
                elem_count,
                ref data,
                allow_frag,
            } => {
                let budget = self.write_budget(path.len());
                let remaining = data.len() - request.frag_offset;
                if request.frag_offset == 0 && (remaining <= budget || !allow_frag) {
                    cip::encode_write(path, type_code, struct_handle, elem_count, data)
                } else {
                    let chunk = remaining.min(budget);
                    let chunk = align_chunk(chunk, &request.tag);
                    cip::encode_write_frag(
                        path,
                        type_code,
                        struct_handle,
                        elem_count,
                        request.frag_offset as u32,
                        &data[request.frag_offset..request.frag_offset + chunk],
                    )
                }
            }
            TagOp::PcccRead { ref addr, elements, total_bytes } => {
                let tns = self.next_tns();
                let plc5 = self.config.plc != Some(PlcKind::Slc500)
                    && self.config.plc != Some(PlcKind::MicroLogix);
                let pccc_bytes = if plc5 {
                    pccc::plc5_read(tns, addr, 0, elements)
                } else {
                    match pccc::slc_read(tns, addr, total_bytes.min(225) as u8) {
                        Ok(bytes) => bytes,
                        Err(_) => return Vec::new(),
                    }
                };
                pccc::encode_execute(VENDOR_ID, self.orig_serial, &pccc_bytes)
            }
            TagOp::PcccWrite { ref addr, elements, ref data } => {
                let tns = self.next_tns();
                let plc5 = self.config.plc != Some(PlcKind::Slc500)
                    && self.config.plc != Some(PlcKind::MicroLogix);
                let pccc_bytes = if plc5 {
                    pccc::plc5_write(tns, addr, 0, elements, data)
                } else {
                    match pccc::slc_write(tns, addr, data) {
                        Ok(bytes) => bytes,
                        Err(_) => return Vec::new(),
                    }
                };
                pccc::encode_execute(VENDOR_ID, self.orig_serial, &pccc_bytes)
            }
            TagOp::ModbusRead { .. } | TagOp::ModbusWrite { .. } => Vec::new(),
            TagOp::ListTags { start_instance } => cip::encode_list_tags(start_instance),
        }
    }

    fn next_tns(&mut self) -> u16 {
        self.pccc_tns = self.pccc_tns.wrapping_add(1).max(1);
        self.pccc_tns
    }

    /// CIP payload budget for one write fragment
    fn write_budget(&self, path_len: usize) -> usize {
        let overhead = 2 + path_len + 8 + 16;
        (self.max_packet as usize).saturating_sub(overhead).max(1)
    }

    /* ---------------- receive ---------------- */

    fn drain_frames(&mut self) -> Result<(), ErrorKind> {
        loop {
            let total = match eip_or_mbap_len(self.config.protocol, &self.rx_buf) {
                Some(total) if self.rx_buf.len() >= total => total,
                _ => return Ok(()),
            };
            let frame: Vec<u8> = self.rx_buf.drain(..total).collect();
            trace!("session {} rx:\n{}", self.key, hex_dump(&frame));
            match self.config.protocol {
                Protocol::Eip => self.handle_eip_frame(&frame)?,
                Protocol::Modbus => self.handle_modbus_frame(&frame)?,
            }
        }
    }

    fn handle_eip_frame(&mut self, frame: &[u8]) -> Result<(), ErrorKind> {
        let input = Slice::new(frame);
        let header = match eip::Header::decode(&input) {
            Ok(header) => header,
            Err(_) => return Err(ErrorKind::BadReply),
        };
        if header.status != 0 {
            debug!(
                "session {} encapsulation status {:#010x}",
                self.key, header.status
            );
        }
        let body = input.sub(eip::HEADER_LEN, header.length as usize);
        let payload = match eip::decode_cpf(&body) {
            Ok(payload) => payload,
            Err(_) => {
                debug!("session {} dropping undecodable frame", self.key);
                return Ok(());
            }
        };

        let matches_in_flight = match self.in_flight {
            Some(ref in_flight) => {
                if in_flight.connected {
                    // connected replies address our end of the connection
                    let id_ok = match (&self.connection, payload.connection_id) {
                        (Some(connection), Some(id)) => id == connection.client_conn_id,
                        _ => false,
                    };
                    id_ok && payload.sequence == Some(in_flight.sequence)
                } else {
                    header.sender_context == in_flight.context
                }
            }
            None => false,
        };
        if !matches_in_flight {
            debug!(
                "session {} reply with no matching request (context {:#x}, seq {:?})",
                self.key, header.sender_context, payload.sequence
            );
            return Ok(());
        }

        let in_flight = self.in_flight.take().expect("matched in-flight");
        self.dispatch_replies(in_flight, &payload.data)
    }

    fn dispatch_replies(
        &mut self,
        in_flight: InFlight,
        data: &Slice<'_>,
    ) -> Result<(), ErrorKind> {
        if in_flight.packed {
            let outer = match cip::decode_reply(data) {
                Ok(outer) => outer,
                Err(_) => {
                    for request in in_flight.requests {
                        self.complete_request(request, Status::Err(ErrorKind::BadReply));
                    }
                    return Ok(());
                }
            };
            match cip::decode_multi_reply(&outer.payload) {
                Ok(parts) if parts.len() == in_flight.requests.len() => {
                    for (request, part) in in_flight.requests.into_iter().zip(parts) {
                        self.resolve(request, &part);
                    }
                }
                _ => {
                    warn!("session {} packed reply shape mismatch", self.key);
                    for request in in_flight.requests {
                        self.complete_request(request, Status::Err(ErrorKind::BadReply));
                    }
                }
            }
        } else {
            for request in in_flight.requests {
                self.resolve(request, data);
            }
        }
        Ok(())
    }

    /// resolve one request against its CIP reply; may re-queue a
    /// fragmented continuation
    fn resolve(&mut self, mut request: Box<Request>, data: &Slice<'_>) {
        if request.aborted {
            debug!("request {} reply discarded after abort", request.id);
            return;
        }

        let reply = match cip::decode_reply(data) {
            Ok(reply) => reply,
            Err(_) => {
                self.complete_request(request, Status::Err(ErrorKind::BadReply));
                return;
            }
        };

        match request.op {
            TagOp::CipRead { capacity, allow_frag, .. } => {
                let status = reply.check();
                if status.is_err() {
                    self.complete_request(request, status);
                    return;
                }
                let payload = match cip::decode_read_payload(&reply.payload) {
                    Ok(payload) => payload,
                    Err(_) => {
                        self.complete_request(request, Status::Err(ErrorKind::BadReply));
                        return;
                    }
                };
                request.discovered = Some((payload.type_code, payload.struct_handle));
                request.acc.extend_from_slice(payload.data.bytes());
                let capacity = capacity.or_else(|| {
                    cip::atomic_type_size(payload.type_code)
                        .map(|s| s * request.tag.elem_count_hint())
                });
                if let Some(capacity) = capacity {
                    if request.acc.len() > capacity {
                        // never copy a partial overflow into the tag
                        self.complete_request(request, Status::Err(ErrorKind::TooLarge));
                        return;
                    }
                }
                if reply.is_partial() {
                    if !allow_frag {
                        self.complete_request(request, Status::Err(ErrorKind::TooLarge));
                        return;
                    }
                    request.frag_offset = request.acc.len();
                    self.queue.push_front(request);
                    return;
                }
                self.complete_request(request, Status::Ok);
            }
            TagOp::CipWrite { ref data, allow_frag, .. } => {
                let status = reply.check();
                if status.is_err() {
                    self.complete_request(request, status);
                    return;
                }
                let budget = match request.op {
                    TagOp::CipWrite { ref path, .. } => self.write_budget(path.len()),
                    _ => unreachable!(),
                };
                let total = data.len();
                let sent_all = if request.frag_offset == 0 {
                    total <= budget || !allow_frag
                } else {
                    false
                };
                if sent_all {
                    self.complete_request(request, Status::Ok);
                    return;
                }
                let chunk = align_chunk((total - request.frag_offset).min(budget), &request.tag);
                request.frag_offset += chunk;
                if request.frag_offset >= total {
                    self.complete_request(request, Status::Ok);
                } else {
                    self.queue.push_front(request);
                }
            }
            TagOp::PcccRead { .. } => {
                let status = reply.check();
                if status.is_err() {
                    self.complete_request(request, status);
                    return;
                }
                let pccc_reply = match pccc::decode_execute_reply(&reply.payload) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        self.complete_request(request, Status::Err(ErrorKind::BadReply));
                        return;
                    }
                };
                let status = pccc_reply.check();
                if status.is_err() {
                    self.complete_request(request, status);
                    return;
                }
                let raw = pccc_reply.data.bytes();
                let plc5 = self.config.plc != Some(PlcKind::Slc500)
                    && self.config.plc != Some(PlcKind::MicroLogix);
                let data_bytes = if plc5 {
                    // typed read replies prefix the data with a DT byte
                    match pccc::decode_dt_byte(raw) {
                        Some((_, _, consumed)) => &raw[consumed..],
                        None => raw,
                    }
                } else {
                    raw
                };
                request.acc.extend_from_slice(data_bytes);
                self.complete_request(request, Status::Ok);
            }
            TagOp::PcccWrite { .. } => {
                let status = reply.check();
                if status.is_err() {
                    self.complete_request(request, status);
                    return;
                }
                let status = match pccc::decode_execute_reply(&reply.payload) {
                    Ok(parsed) => parsed.check(),
                    Err(_) => Status::Err(ErrorKind::BadReply),
                };
                self.complete_request(request, status);
            }
            TagOp::ListTags { .. } => {
                let status = reply.check();
                if status.is_err() {
                    self.complete_request(request, status);
                    return;
                }
                request.acc.extend_from_slice(reply.payload.bytes());
                if reply.is_partial() {
                    match crate::udt::last_instance_id(reply.payload.bytes()) {
                        Some(last) => {
                            if let TagOp::ListTags { ref mut start_instance } = request.op {
                                *start_instance = (last + 1) as u16;
                            }
                            self.queue.push_front(request);
                        }
                        None => {
                            self.complete_request(request, Status::Err(ErrorKind::BadReply));
                        }
                    }
                    return;
                }
                self.complete_request(request, Status::Ok);
            }
            TagOp::ModbusRead { .. } | TagOp::ModbusWrite { .. } => {
                self.complete_request(request, Status::Err(ErrorKind::BadReply));
            }
        }
    }

    fn handle_modbus_frame(&mut self, frame: &[u8]) -> Result<(), ErrorKind> {
        let input = Slice::new(frame);
        let header = match modbus::MbapHeader::decode(&input) {
            Ok(header) => header,
            Err(_) => return Err(ErrorKind::BadReply),
        };

        let matches_in_flight = self
            .in_flight
            .as_ref()
            .map(|in_flight| in_flight.transaction_id == header.transaction_id)
            .unwrap_or(false);
        if !matches_in_flight {
            debug!(
                "session {} modbus reply with unmatched transaction {}",
                self.key, header.transaction_id
            );
            return Ok(());
        }

        let mut in_flight = self.in_flight.take().expect("matched in-flight");
        let mut request = in_flight.requests.pop().expect("one modbus request");
        if request.aborted {
            return Ok(());
        }

        let pdu = input.sub(modbus::MBAP_LEN, header.length as usize - 1);
        let response = match modbus::decode_response(&pdu) {
            Ok(response) => response,
            Err(status) => {
                self.complete_request(request, status);
                return Ok(());
            }
        };

        match request.op {
            TagOp::ModbusRead { register, start, count } => {
                let (chunk_start, chunk_count) =
                    modbus_chunk(start, count, request.frag_offset, register, true);
                let byte_count = response.data.u8(0) as usize;
                let data = response.data.sub(1, byte_count);
                if data.has_error() {
                    self.complete_request(request, Status::Err(ErrorKind::BadReply));
                    return Ok(());
                }
                match register {
                    RegisterType::Coil | RegisterType::Discrete => {
                        let expected = (chunk_count as usize + 7) / 8;
                        if byte_count < expected {
                            self.complete_request(request, Status::Err(ErrorKind::BadReply));
                            return Ok(());
                        }
                        request.acc.extend_from_slice(&data.bytes()[..expected]);
                    }
                    RegisterType::Holding | RegisterType::Input => {
                        if byte_count != chunk_count as usize * 2 {
                            self.complete_request(request, Status::Err(ErrorKind::BadReply));
                            return Ok(());
                        }
                        let mut acc = std::mem::take(&mut request.acc);
                        modbus::wire_to_regs(data.bytes(), &mut acc);
                        request.acc = acc;
                    }
                }
                request.frag_offset = (chunk_start - start) as usize + chunk_count as usize;
                if (request.frag_offset as u16) < count {
                    self.queue.push_front(request);
                } else {
                    self.complete_request(request, Status::Ok);
                }
            }
            TagOp::ModbusWrite { register, start, count, .. } => {
                let single = count == 1;
                if single {
                    self.complete_request(request, Status::Ok);
                    return Ok(());
                }
                let (chunk_start, chunk_count) =
                    modbus_chunk(start, count, request.frag_offset, register, false);
                let echo_start = response.data.u16_be(0);
                let echo_count = response.data.u16_be(2);
                if response.data.has_error()
                    || echo_start != chunk_start
                    || echo_count != chunk_count
                {
                    self.complete_request(request, Status::Err(ErrorKind::BadReply));
                    return Ok(());
                }
                request.frag_offset = (chunk_start - start) as usize + chunk_count as usize;
                if (request.frag_offset as u16) < count {
                    self.queue.push_front(request);
                } else {
                    self.complete_request(request, Status::Ok);
                }
            }
            _ => {
                self.complete_request(request, Status::Err(ErrorKind::BadReply));
            }
        }
        Ok(())
    }

    /* ---------------- completion ---------------- */

    fn complete_request(&mut self, request: Box<Request>, status: Status) {
        let Request {
            tag,
            kind,
            shared,
            acc,
            discovered,
            ..
        } = *request;
        // the tag layer resolves the waiters: a pre-write read chains
        // into its write and keeps the shared cell pending
        if let Some(follow_up) = tag::complete_operation(&tag, kind, status, acc, discovered, shared)
        {
            self.queue.push_back(follow_up);
        }
    }

    fn fail_all(&mut self, kind: ErrorKind) {
        let queued: Vec<_> = self.queue.drain(..).collect();
        for request in queued {
            self.complete_request(request, Status::Err(kind));
        }
        if let Some(in_flight) = self.in_flight.take() {
            for request in in_flight.requests {
                if !request.aborted {
                    self.complete_request(request, Status::Err(kind));
                }
            }
        }
    }

    /// close the transport; polite teardown sends Forward Close and
    /// UnRegisterSession first
    async fn teardown_socket(&mut self, polite: bool) {
        if polite && self.stream.is_some() && self.config.protocol == Protocol::Eip {
            if let Some(connection) = self.connection.take() {
                let close = connection.params.encode_close();
                if self.exchange_unconnected(&close).await.is_ok() {
                    debug!("session {} forward close sent", self.key);
                }
            }
            if self.session_handle != 0 {
                let frame = eip::encode_unregister_session(self.session_handle);
                let _ = self.write_frame(&frame).await;
            }
        }
        self.connection = None;
        self.session_handle = 0;
        self.stream = None;
        self.rx_buf.clear();
    }
}

enum ServeExit {
    Shutdown,
    SocketError(ErrorKind),
}

fn eip_or_mbap_len(protocol: Protocol, buf: &[u8]) -> Option<usize> {
    match protocol {
        Protocol::Eip => eip::frame_len(buf),
        Protocol::Modbus => modbus::frame_len(buf),
    }
}

/// the chunk of a Modbus transfer starting at `frag_offset` elements in
fn modbus_chunk(
    start: u16,
    count: u16,
    frag_offset: usize,
    register: RegisterType,
    read: bool,
) -> (u16, u16) {
    let limit = match (register, read) {
        (RegisterType::Coil | RegisterType::Discrete, true) => modbus::MAX_READ_BITS,
        (RegisterType::Coil | RegisterType::Discrete, false) => modbus::MAX_WRITE_BITS,
        (_, true) => modbus::MAX_READ_REGS,
        (_, false) => modbus::MAX_WRITE_REGS,
    };
    let done = frag_offset as u16;
    let remaining = count - done;
    (start + done, remaining.min(limit))
}

/// keep write fragments aligned to whole elements
fn align_chunk(chunk: usize, tag: &Arc<TagCore>) -> usize {
    let elem = tag.elem_size_hint().max(1);
    if chunk >= elem {
        (chunk / elem) * elem
    } else {
        chunk
    }
}

/* ---------------- registry glue ---------------- */

pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<Arc<str>, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// find or create the session for an endpoint; the spawner runs the
    /// new task on the I/O runtime
    pub fn get_or_spawn<F>(&self, key: &str, config: EndpointConfig, spawn: F) -> SessionHandle
    where
        F: FnOnce(Session),
    {
        let mut sessions = self.sessions.lock();
        match sessions.entry(Arc::from(key)) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let key: Arc<str> = Arc::clone(entry.key());
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = SessionHandle {
                    key: Arc::clone(&key),
                    tx,
                };
                let session = Session::new(key, config, rx);
                entry.insert(handle.clone());
                spawn(session);
                handle
            }
        }
    }

    pub fn remove(&self, key: &str) {
        self.sessions.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_shared_complete_and_wait() {
        let shared = OpShared::new();
        assert!(shared.wait(std::time::Instant::now()).is_pending());
        shared.complete(Status::Ok);
        // later completions do not overwrite the first
        shared.complete(Status::Err(ErrorKind::Timeout));

        let deadline = std::time::Instant::now() + Duration::from_millis(5);
        assert!(shared.wait(deadline).is_ok());
    }

    #[test]
    fn test_op_shared_wait_times_out_pending() {
        let shared = OpShared::new();
        let deadline = std::time::Instant::now() + Duration::from_millis(10);
        let status = shared.wait(deadline);
        assert!(status.is_pending());
    }

    #[test]
    fn test_modbus_chunking() {
        // a 300-register read splits at the 125 limit
        assert_eq!(
            modbus_chunk(10, 300, 0, RegisterType::Holding, true),
            (10, 125)
        );
        assert_eq!(
            modbus_chunk(10, 300, 125, RegisterType::Holding, true),
            (135, 125)
        );
        assert_eq!(
            modbus_chunk(10, 300, 250, RegisterType::Holding, true),
            (260, 50)
        );
        // bits use the bit limits
        assert_eq!(
            modbus_chunk(0, 4000, 0, RegisterType::Coil, true),
            (0, 2000)
        );
        assert_eq!(
            modbus_chunk(0, 4000, 2000, RegisterType::Coil, false),
            (2000, 1968)
        );
    }
}
