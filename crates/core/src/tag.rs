// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

use crate::attr::{PlcKind, Protocol, TagOptions};
use crate::event::{self, Event, Handler};
use crate::modbus::RegisterType;
use crate::order::{self, ByteOrder};
use crate::session::{OpKind, OpShared, Request, SessionCmd, SessionHandle, TagOp};
use crate::session::DEFAULT_OP_TIMEOUT;
use crate::{cip, pccc, ErrorKind, Result, Status};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// library version reported through the attribute accessors
pub const VERSION: (u32, u32, u32) = (0, 1, 0);

/// Tag Identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagId(pub(crate) u32);

/// tag lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagState {
    Initializing,
    Idle,
    Reading,
    Writing,
    /// implicit read before the first write of a tag whose type is
    /// still unknown
    PreWriteReading,
}

/// what the tag addresses, resolved once at creation
#[derive(Debug, Clone)]
enum Addressing {
    /// ControlLogix/Omron symbolic path
    Symbolic { path: Vec<u8> },
    /// the controller tag directory (`@tags`)
    Directory,
    /// a UDT template definition (`@udt/<id>`)
    Template { id: u16 },
    /// PLC-5/SLC/MicroLogix data-table file
    Pccc { addr: pccc::Address },
    /// Modbus register span
    Register { register: RegisterType, start: u16 },
}

struct PendingOp {
    kind: OpKind,
    deadline: Instant,
}

struct TagInner {
    state: TagState,
    status: Status,
    buf: Vec<u8>,
    elem_size: usize,
    elem_count: usize,
    type_code: Option<u16>,
    struct_handle: Option<u16>,
    first_read_done: bool,
    created_fired: bool,
    pending: Option<PendingOp>,
    last_read_done: Option<Instant>,
    last_write_done: Option<Instant>,
    auto_sync_read_ms: u32,
    auto_sync_write_ms: u32,
    read_cache_ms: u32,
}

/// the shared tag object: owned by the registry and the user handle,
/// and held by the scheduler while a request is outstanding so that
/// destroy-during-IO stays safe
pub(crate) struct TagCore {
    id: TagId,
    opts: TagOptions,
    addressing: Addressing,
    order: ByteOrder,
    session: SessionHandle,
    inner: Mutex<TagInner>,
}

impl TagCore {
    #[inline]
    pub fn id(&self) -> TagId {
        self.id
    }

    /// element count without holding the lock across codec work
    pub fn elem_count_hint(&self) -> usize {
        self.inner.lock().elem_count
    }

    pub fn elem_size_hint(&self) -> usize {
        self.inner.lock().elem_size
    }
}

/* ---------------- registry ---------------- */

struct Registry {
    map: HashMap<u32, Arc<TagCore>>,
    free: Vec<u32>,
    next: u32,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    RwLock::new(Registry {
        map: HashMap::new(),
        free: Vec::new(),
        next: 1,
    })
});

fn register(make: impl FnOnce(TagId) -> Arc<TagCore>) -> Arc<TagCore> {
    let mut registry = REGISTRY.write();
    let id = registry.free.pop().unwrap_or_else(|| {
        let id = registry.next;
        registry.next += 1;
        id
    });
    let core = make(TagId(id));
    registry.map.insert(id, Arc::clone(&core));
    core
}

fn unregister(id: TagId) {
    let mut registry = REGISTRY.write();
    if registry.map.remove(&id.0).is_some() {
        registry.free.push(id.0);
    }
}

/* ---------------- name parsing ---------------- */

/// encode a symbolic tag name (`Program:Main.Counts[3].ACC`-style) into
/// an EPATH. At most three numeric indexes are accepted; more is an
/// out-of-bounds path by construction.
fn encode_tag_path(name: &str) -> Result<Vec<u8>> {
    if name.is_empty() {
        return Err(ErrorKind::BadParam.into());
    }
    let mut path = cip::Epath::new();
    let mut index_count = 0usize;
    for part in name.split('.') {
        let (base, indexes) = match part.split_once('[') {
            Some((base, rest)) => {
                let rest = rest.strip_suffix(']').ok_or_else(|| {
                    warn!("unterminated index in tag name {name:?}");
                    Status::from(ErrorKind::BadParam)
                })?;
                (base, Some(rest))
            }
            None => (part, None),
        };
        if base.is_empty() || base.len() > u8::MAX as usize {
            warn!("bad component {part:?} in tag name {name:?}");
            return Err(ErrorKind::BadParam.into());
        }
        path = path.symbolic(base);
        if let Some(indexes) = indexes {
            for index in indexes.split(',') {
                let value: u32 = index.trim().parse().map_err(|_| {
                    warn!("bad array index {index:?} in tag name {name:?}");
                    Status::from(ErrorKind::BadParam)
                })?;
                index_count += 1;
                if index_count > 3 {
                    warn!("too many array indexes in tag name {name:?}");
                    return Err(ErrorKind::OutOfBounds.into());
                }
                path = path.index(value);
            }
        }
    }
    Ok(path.into_bytes())
}

fn resolve_addressing(opts: &TagOptions) -> Result<Addressing> {
    match opts.protocol {
        Protocol::Eip => {
            let plc = opts.plc.ok_or_else(|| Status::from(ErrorKind::BadConfig))?;
            if plc.is_pccc() {
                let addr = pccc::Address::parse(&opts.name)?;
                if matches!(plc, PlcKind::Slc500 | PlcKind::MicroLogix) {
                    // fail unencodable file types before any I/O starts
                    addr.encode_slc()?;
                }
                Ok(Addressing::Pccc { addr })
            } else if opts.name == "@tags" {
                Ok(Addressing::Directory)
            } else if let Some(id) = opts.name.strip_prefix("@udt/") {
                let id: u16 = id.parse().map_err(|_| {
                    warn!("bad template id in {:?}", opts.name);
                    Status::from(ErrorKind::BadParam)
                })?;
                Ok(Addressing::Template { id })
            } else {
                Ok(Addressing::Symbolic {
                    path: encode_tag_path(&opts.name)?,
                })
            }
        }
        Protocol::Modbus => {
            let (register, start) = crate::modbus::parse_register(&opts.name)?;
            Ok(Addressing::Register { register, start })
        }
    }
}

fn family_order(opts: &TagOptions) -> ByteOrder {
    match opts.plc {
        Some(PlcKind::Plc5) | Some(PlcKind::LogixPccc) => order::PLC5,
        Some(PlcKind::Slc500) | Some(PlcKind::MicroLogix) => order::SLC,
        Some(PlcKind::OmronNjnx) => order::OMRON,
        _ => order::LOGIX,
    }
}

/* ---------------- request construction ---------------- */

fn allow_frag(opts: &TagOptions) -> bool {
    opts.plc != Some(PlcKind::OmronNjnx)
}

fn make_read_op(core: &TagCore, inner: &TagInner) -> Result<TagOp> {
    match core.addressing {
        Addressing::Symbolic { ref path } => {
            let capacity = if inner.elem_size > 0 {
                Some(inner.elem_size * inner.elem_count)
            } else {
                None
            };
            Ok(TagOp::CipRead {
                path: path.clone(),
                elem_count: inner.elem_count as u16,
                capacity,
                allow_frag: allow_frag(&core.opts),
            })
        }
        Addressing::Directory => Ok(TagOp::ListTags { start_instance: 0 }),
        Addressing::Template { id } => Ok(TagOp::CipRead {
            path: cip::Epath::new().class_instance16(0x6C, id).into_bytes(),
            elem_count: 1,
            capacity: None,
            allow_frag: allow_frag(&core.opts),
        }),
        Addressing::Pccc { ref addr } => Ok(TagOp::PcccRead {
            addr: addr.clone(),
            elements: inner.elem_count as u16,
            total_bytes: inner.elem_size * inner.elem_count,
        }),
        Addressing::Register { register, start } => Ok(TagOp::ModbusRead {
            register,
            start,
            count: inner.elem_count as u16,
        }),
    }
}

fn make_write_op(core: &TagCore, inner: &TagInner) -> Result<TagOp> {
    match core.addressing {
        Addressing::Symbolic { ref path } => {
            let type_code = inner
                .type_code
                .or(core.opts.elem_type)
                .ok_or_else(|| Status::from(ErrorKind::BadData))?;
            Ok(TagOp::CipWrite {
                path: path.clone(),
                type_code,
                struct_handle: inner.struct_handle,
                elem_count: inner.elem_count as u16,
                data: inner.buf.clone(),
                allow_frag: allow_frag(&core.opts),
            })
        }
        Addressing::Directory | Addressing::Template { .. } => {
            Err(ErrorKind::NotAllowed.into())
        }
        Addressing::Pccc { ref addr } => Ok(TagOp::PcccWrite {
            addr: addr.clone(),
            elements: inner.elem_count as u16,
            data: inner.buf.clone(),
        }),
        Addressing::Register { register, start } => {
            if !register.writable() {
                return Err(ErrorKind::NotAllowed.into());
            }
            Ok(TagOp::ModbusWrite {
                register,
                start,
                count: inner.elem_count as u16,
                data: inner.buf.clone(),
            })
        }
    }
}

fn submit_locked(
    core: &Arc<TagCore>,
    inner: &mut TagInner,
    kind: OpKind,
    op: TagOp,
    deadline: Instant,
) -> Arc<OpShared> {
    let request = Request::new(
        Arc::clone(core),
        kind,
        op,
        core.opts.allow_packing,
        core.opts.connected(),
        deadline,
    );
    let shared = Arc::clone(&request.shared);
    inner.pending = Some(PendingOp { kind, deadline });
    inner.state = match kind {
        OpKind::Read => TagState::Reading,
        OpKind::PreRead => TagState::PreWriteReading,
        OpKind::Write => TagState::Writing,
    };
    core.session.send(SessionCmd::Submit(request));
    shared
}

fn op_deadline(timeout_ms: u32) -> Instant {
    let timeout = if timeout_ms == 0 {
        DEFAULT_OP_TIMEOUT
    } else {
        Duration::from_millis(timeout_ms as u64)
    };
    Instant::now() + timeout
}

/* ---------------- scheduler-side hooks ---------------- */

/// fire the started event as the request goes to the wire
pub(crate) fn operation_started(core: &Arc<TagCore>, kind: OpKind) {
    let event = match kind {
        OpKind::Read | OpKind::PreRead => Event::ReadStarted,
        OpKind::Write => Event::WriteStarted,
    };
    event::emit(core.id, event, Status::Pending);
}

/// resolve a finished operation. Runs on the scheduler task. Returns the
/// follow-up request when a pre-write read chains into the actual write.
pub(crate) fn complete_operation(
    core: &Arc<TagCore>,
    kind: OpKind,
    status: Status,
    acc: Vec<u8>,
    discovered: Option<(u16, Option<u16>)>,
    shared: Arc<OpShared>,
) -> Option<Box<Request>> {
    let mut inner = core.inner.lock();
    let now = Instant::now();

    if status.is_ok() {
        match kind {
            OpKind::Read | OpKind::PreRead => {
                if let Some((type_code, struct_handle)) = discovered {
                    inner.type_code = Some(type_code);
                    inner.struct_handle = struct_handle;
                    if inner.elem_size == 0 {
                        if let Some(size) = cip::atomic_type_size(type_code) {
                            inner.elem_size = size;
                        } else if inner.elem_count > 0 && acc.len() % inner.elem_count == 0 {
                            inner.elem_size = acc.len() / inner.elem_count;
                        }
                    }
                }
                // a pre-write read is for type discovery only; copying
                // the data would clobber what the user staged to write
                if kind == OpKind::Read {
                    let growable = matches!(
                        core.addressing,
                        Addressing::Directory | Addressing::Template { .. }
                    ) || inner.buf.is_empty();
                    if growable {
                        inner.buf = acc;
                    } else {
                        let len = acc.len().min(inner.buf.len());
                        inner.buf[..len].copy_from_slice(&acc[..len]);
                    }
                    inner.last_read_done = Some(now);

                    if let (Addressing::Template { id }, true) =
                        (&core.addressing, !inner.buf.is_empty())
                    {
                        match crate::udt::parse_template(*id, &inner.buf) {
                            Ok(def) => {
                                crate::udt::insert(def);
                            }
                            Err(_) => debug!("template {id} payload did not parse"),
                        }
                    }
                }
                inner.first_read_done = true;
            }
            OpKind::Write => {
                inner.last_write_done = Some(now);
            }
        }
    }

    // a successful pre-write read chains straight into the write, the
    // user's wait resolves with the write's status
    if kind == OpKind::PreRead && status.is_ok() {
        let deadline = inner
            .pending
            .as_ref()
            .map(|p| p.deadline)
            .unwrap_or_else(|| op_deadline(0));
        match make_write_op(core, &inner) {
            Ok(op) => {
                let request = Request::with_shared(
                    Arc::clone(core),
                    OpKind::Write,
                    op,
                    core.opts.allow_packing,
                    core.opts.connected(),
                    deadline,
                    Arc::clone(&shared),
                );
                inner.pending = Some(PendingOp {
                    kind: OpKind::Write,
                    deadline,
                });
                inner.state = TagState::Writing;
                drop(inner);
                event::emit(core.id, Event::ReadCompleted, Status::Ok);
                return Some(request);
            }
            Err(err) => {
                inner.state = TagState::Idle;
                inner.status = err;
                inner.pending = None;
                drop(inner);
                shared.complete(err);
                event::emit(core.id, Event::ReadCompleted, err);
                return None;
            }
        }
    }

    inner.status = status;
    inner.state = TagState::Idle;
    inner.pending = None;
    let fire_created = status.is_ok() && !inner.created_fired;
    if fire_created {
        inner.created_fired = true;
    }
    drop(inner);

    shared.complete(status);
    let completed = match kind {
        OpKind::Read | OpKind::PreRead => Event::ReadCompleted,
        OpKind::Write => Event::WriteCompleted,
    };
    event::emit(core.id, completed, status);
    if fire_created {
        event::emit(core.id, Event::Created, Status::Ok);
    }
    None
}

/// resolve an aborted operation: the eventual reply is discarded and the
/// completion events carry `ERR_ABORT`
pub(crate) fn complete_aborted(core: &Arc<TagCore>, kind: OpKind) {
    let status = Status::Err(ErrorKind::Abort);
    {
        let mut inner = core.inner.lock();
        inner.status = status;
        inner.state = TagState::Idle;
        inner.pending = None;
    }
    event::emit(core.id, Event::Aborted, status);
    let completed = match kind {
        OpKind::Read | OpKind::PreRead => Event::ReadCompleted,
        OpKind::Write => Event::WriteCompleted,
    };
    event::emit(core.id, completed, status);
}

/// resolve an operation whose deadline fired
pub(crate) fn complete_timeout(core: &Arc<TagCore>, kind: OpKind) {
    let status = Status::Err(ErrorKind::Timeout);
    {
        let mut inner = core.inner.lock();
        inner.status = status;
        inner.state = TagState::Idle;
        inner.pending = None;
    }
    let completed = match kind {
        OpKind::Read | OpKind::PreRead => Event::ReadCompleted,
        OpKind::Write => Event::WriteCompleted,
    };
    event::emit(core.id, completed, status);
}

/// next point in time an auto-sync operation becomes due
pub(crate) fn auto_sync_deadline(core: &Arc<TagCore>) -> Option<Instant> {
    let inner = core.inner.lock();
    if let Some(ref pending) = inner.pending {
        // an unfinished operation of either kind defers the cycle; the
        // next one schedules from its completion time
        trace!("tag {:?} busy with {:?}, auto-sync deferred", core.id, pending.kind);
        return None;
    }
    let read_at = match (inner.auto_sync_read_ms, inner.last_read_done) {
        (ms, Some(done)) if ms > 0 => Some(done + Duration::from_millis(ms as u64)),
        _ => None,
    };
    let write_at = match (inner.auto_sync_write_ms, inner.last_write_done) {
        (ms, Some(done)) if ms > 0 && inner.first_read_done => {
            Some(done + Duration::from_millis(ms as u64))
        }
        _ => None,
    };
    match (read_at, write_at) {
        (Some(r), Some(w)) => Some(r.min(w)),
        (Some(r), None) => Some(r),
        (None, Some(w)) => Some(w),
        (None, None) => None,
    }
}

/// enqueue a due auto-sync operation; a pending one of the same kind
/// suppresses the new one instead of queueing behind it
pub(crate) fn auto_sync_tick(core: &Arc<TagCore>, now: Instant) -> Option<Box<Request>> {
    let mut inner = core.inner.lock();
    if inner.pending.is_some() || !inner.first_read_done {
        return None;
    }

    let read_due = inner.auto_sync_read_ms > 0
        && inner
            .last_read_done
            .map(|done| done + Duration::from_millis(inner.auto_sync_read_ms as u64) <= now)
            .unwrap_or(false);
    let write_due = inner.auto_sync_write_ms > 0
        && inner
            .last_write_done
            .map(|done| done + Duration::from_millis(inner.auto_sync_write_ms as u64) <= now)
            .unwrap_or(false);

    let (kind, op) = if read_due {
        (OpKind::Read, make_read_op(core, &inner).ok()?)
    } else if write_due {
        (OpKind::Write, make_write_op(core, &inner).ok()?)
    } else {
        return None;
    };

    let deadline = now + DEFAULT_OP_TIMEOUT;
    let request = Request::new(
        Arc::clone(core),
        kind,
        op,
        core.opts.allow_packing,
        core.opts.connected(),
        deadline,
    );
    inner.pending = Some(PendingOp { kind, deadline });
    inner.state = if kind == OpKind::Read {
        TagState::Reading
    } else {
        TagState::Writing
    };
    Some(request)
}

/* ---------------- public handle ---------------- */

/// a handle to a cached PLC data item.
///
/// Dropping the handle aborts any in-flight operation and releases the
/// tag; when the last tag of a session goes, the session tears down.
#[derive(Debug)]
pub struct RawTag {
    core: Arc<TagCore>,
}

impl std::fmt::Debug for TagCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagCore")
            .field("id", &self.id)
            .field("name", &self.opts.name)
            .finish()
    }
}

impl RawTag {
    /// create a tag from an attribute string.
    ///
    /// A `timeout_ms` of zero returns immediately with the initial read
    /// still pending; otherwise the call blocks until the tag is usable
    /// or errors out.
    ///
    /// # Examples
    /// ```rust,ignore
    /// use tagbus_core::RawTag;
    ///
    /// let attrs = "protocol=ab-eip&plc=controllogix&path=1,0&gateway=192.168.1.120&name=MyTag1&elem_count=1";
    /// let tag = RawTag::new(attrs, 100)?;
    /// ```
    pub fn new(attrs: impl AsRef<str>, timeout_ms: u32) -> Result<Self> {
        let opts = TagOptions::parse(attrs.as_ref())?;
        if let Some(level) = opts.debug {
            crate::debug::set_debug_level(level);
        }
        let addressing = resolve_addressing(&opts)?;
        let order = family_order(&opts);

        let elem_count = opts.elem_count;
        let (elem_size, buf_len) = match addressing {
            Addressing::Symbolic { .. } => {
                let size = opts
                    .elem_size
                    .or_else(|| opts.elem_type.and_then(cip::atomic_type_size))
                    .unwrap_or(0);
                (size, size * elem_count)
            }
            Addressing::Directory | Addressing::Template { .. } => (0, 0),
            Addressing::Pccc { ref addr } => {
                let size = opts.elem_size.unwrap_or(addr.element_size);
                (size, size * elem_count)
            }
            Addressing::Register { register, .. } => match register {
                RegisterType::Coil | RegisterType::Discrete => (1, (elem_count + 7) / 8),
                RegisterType::Holding | RegisterType::Input => (2, 2 * elem_count),
            },
        };

        let session = crate::scheduler::session_for(&opts)?;
        let auto_write = opts.auto_sync_write_ms;
        let core = register(|id| {
            Arc::new(TagCore {
                id,
                order,
                addressing,
                session: session.clone(),
                inner: Mutex::new(TagInner {
                    state: TagState::Initializing,
                    status: Status::Pending,
                    buf: vec![0; buf_len],
                    elem_size,
                    elem_count,
                    type_code: opts.elem_type,
                    struct_handle: None,
                    first_read_done: false,
                    created_fired: false,
                    pending: None,
                    last_read_done: None,
                    last_write_done: if auto_write > 0 {
                        Some(Instant::now())
                    } else {
                        None
                    },
                    auto_sync_read_ms: opts.auto_sync_read_ms,
                    auto_sync_write_ms: opts.auto_sync_write_ms,
                    read_cache_ms: opts.read_cache_ms,
                }),
                opts,
            })
        });
        core.session.send(SessionCmd::Attach {
            tag: Arc::clone(&core),
        });

        // discovery read: learns the type for symbolic tags and primes
        // the cache for everything else
        let deadline = op_deadline(timeout_ms);
        let shared = {
            let mut inner = core.inner.lock();
            let op = match make_read_op(&core, &inner) {
                Ok(op) => op,
                Err(err) => {
                    drop(inner);
                    release(&core);
                    return Err(err);
                }
            };
            submit_locked(&core, &mut inner, OpKind::Read, op, deadline)
        };

        let tag = Self { core };
        if timeout_ms > 0 {
            let status = shared.wait(deadline.into_std());
            if status.is_err() {
                return Err(status);
            }
            if status.is_pending() {
                return Err(ErrorKind::Timeout.into());
            }
        }
        Ok(tag)
    }

    /// tag id
    #[inline(always)]
    pub fn id(&self) -> TagId {
        self.core.id
    }

    /// poll tag status
    #[inline]
    pub fn status(&self) -> Status {
        let inner = self.core.inner.lock();
        match inner.state {
            TagState::Idle => inner.status,
            _ => Status::Pending,
        }
    }

    /// perform a read operation.
    /// - blocking read if timeout > 0
    /// - non-blocking read if timeout = 0
    pub fn read(&self, timeout_ms: u32) -> Status {
        let deadline = op_deadline(timeout_ms);
        let shared = {
            let mut inner = self.core.inner.lock();
            if inner.pending.is_some() {
                return Status::Err(ErrorKind::Busy);
            }
            if inner.read_cache_ms > 0 {
                if let Some(done) = inner.last_read_done {
                    if done + Duration::from_millis(inner.read_cache_ms as u64) > Instant::now() {
                        return Status::Ok;
                    }
                }
            }
            let op = match make_read_op(&self.core, &inner) {
                Ok(op) => op,
                Err(err) => return err,
            };
            submit_locked(&self.core, &mut inner, OpKind::Read, op, deadline)
        };
        if timeout_ms == 0 {
            return Status::Pending;
        }
        let status = shared.wait(deadline.into_std());
        if status.is_pending() {
            Status::Err(ErrorKind::Timeout)
        } else {
            status
        }
    }

    /// perform a write operation.
    /// - blocking write if timeout > 0
    /// - non-blocking write if timeout = 0
    pub fn write(&self, timeout_ms: u32) -> Status {
        let deadline = op_deadline(timeout_ms);
        let shared = {
            let mut inner = self.core.inner.lock();
            if inner.pending.is_some() {
                return Status::Err(ErrorKind::Busy);
            }
            if !inner.first_read_done {
                // learn the remote type first, then chain the write
                let op = match make_read_op(&self.core, &inner) {
                    Ok(op) => op,
                    Err(err) => return err,
                };
                submit_locked(&self.core, &mut inner, OpKind::PreRead, op, deadline)
            } else {
                let op = match make_write_op(&self.core, &inner) {
                    Ok(op) => op,
                    Err(err) => return err,
                };
                submit_locked(&self.core, &mut inner, OpKind::Write, op, deadline)
            }
        };
        if timeout_ms == 0 {
            return Status::Pending;
        }
        let status = shared.wait(deadline.into_std());
        if status.is_pending() {
            Status::Err(ErrorKind::Timeout)
        } else {
            status
        }
    }

    /// abort the pending operation, if any.
    ///
    /// A queued request is dropped; one already on the wire has its
    /// eventual reply discarded.
    #[inline]
    pub fn abort(&self) -> Result<()> {
        self.core.session.send(SessionCmd::Abort { tag: self.core.id });
        Ok(())
    }

    /// wait until not pending, blocking
    /// # Note
    /// only for simple use cases
    pub fn wait(&self, timeout: Option<Duration>) -> Status {
        let start = std::time::Instant::now();
        loop {
            if let Some(limit) = timeout {
                if start.elapsed() > limit {
                    return Status::Err(ErrorKind::Timeout);
                }
            }
            let status = self.status();
            if !status.is_pending() {
                return status;
            }
            std::thread::yield_now();
        }
    }

    /// listen for events
    ///
    /// # Examples
    /// ```rust,ignore
    /// let listener = tag.listen(|id, event, status| {
    ///     println!("tag event: {event:?}, status: {status}");
    /// });
    /// // remove listener later
    /// drop(listener);
    /// ```
    #[inline]
    pub fn listen<F>(&self, f: F) -> Handler
    where
        F: FnMut(TagId, Event, Status) + Send + 'static,
    {
        event::listen(self.core.id, f)
    }

    /// tag size in bytes
    #[inline]
    pub fn size(&self) -> Result<u32> {
        Ok(self.core.inner.lock().buf.len() as u32)
    }

    /// element size
    #[inline]
    pub fn elem_size(&self) -> Result<i32> {
        Ok(self.core.inner.lock().elem_size as i32)
    }

    /// element count
    #[inline]
    pub fn elem_count(&self) -> Result<i32> {
        Ok(self.core.inner.lock().elem_count as i32)
    }

    /// get tag attribute
    pub fn get_attr(&self, attr: impl AsRef<str>, default_value: i32) -> Result<i32> {
        let inner = self.core.inner.lock();
        let value = match attr.as_ref() {
            "version_major" => VERSION.0 as i32,
            "version_minor" => VERSION.1 as i32,
            "version_patch" => VERSION.2 as i32,
            "elem_size" => inner.elem_size as i32,
            "elem_count" => inner.elem_count as i32,
            "connection_group_id" => self.core.opts.connection_group_id as i32,
            "auto_sync_read_ms" => inner.auto_sync_read_ms as i32,
            "auto_sync_write_ms" => inner.auto_sync_write_ms as i32,
            "read_cache_ms" => inner.read_cache_ms as i32,
            "debug" => crate::debug::get_debug_level() as i32,
            _ => default_value,
        };
        Ok(value)
    }

    /// set tag attribute
    pub fn set_attr(&self, attr: impl AsRef<str>, value: i32) -> Result<()> {
        if value < 0 {
            return Err(ErrorKind::BadParam.into());
        }
        let mut inner = self.core.inner.lock();
        match attr.as_ref() {
            "auto_sync_read_ms" => inner.auto_sync_read_ms = value as u32,
            "auto_sync_write_ms" => {
                inner.auto_sync_write_ms = value as u32;
                if value > 0 && inner.last_write_done.is_none() {
                    inner.last_write_done = Some(Instant::now());
                }
            }
            "read_cache_ms" => inner.read_cache_ms = value as u32,
            "debug" => crate::debug::set_debug_level((value as u8).into()),
            _ => return Err(ErrorKind::Unsupported.into()),
        }
        Ok(())
    }

    fn with_buf<T>(&self, f: impl FnOnce(&TagInner) -> Result<T>) -> Result<T> {
        let inner = self.core.inner.lock();
        f(&inner)
    }

    fn with_buf_mut<T>(&self, f: impl FnOnce(&mut TagInner) -> Result<T>) -> Result<T> {
        let mut inner = self.core.inner.lock();
        f(&mut inner)
    }

    fn check_range(inner: &TagInner, offset: u32, len: usize) -> Result<usize> {
        let offset = offset as usize;
        match offset.checked_add(len) {
            Some(end) if end <= inner.buf.len() => Ok(offset),
            _ => Err(ErrorKind::OutOfBounds.into()),
        }
    }

    /// get bit value; the offset indexes bits across the whole buffer
    pub fn get_bit(&self, bit_offset: u32) -> Result<bool> {
        self.with_buf(|inner| {
            let byte = Self::check_range(inner, bit_offset / 8, 1)?;
            Ok(inner.buf[byte] & (1 << (bit_offset % 8)) != 0)
        })
    }

    /// set bit value
    pub fn set_bit(&self, bit_offset: u32, value: bool) -> Result<()> {
        self.with_buf_mut(|inner| {
            let byte = Self::check_range(inner, bit_offset / 8, 1)?;
            if value {
                inner.buf[byte] |= 1 << (bit_offset % 8);
            } else {
                inner.buf[byte] &= !(1 << (bit_offset % 8));
            }
            Ok(())
        })
    }

    /// get bool value
    #[inline]
    pub fn get_bool(&self, byte_offset: u32) -> Result<bool> {
        Ok(self.get_u8(byte_offset)? != 0)
    }

    /// set bool value
    #[inline]
    pub fn set_bool(&self, byte_offset: u32, value: bool) -> Result<()> {
        self.set_u8(byte_offset, if value { 255 } else { 0 })
    }

    /// get raw bytes
    pub fn get_bytes(&self, byte_offset: u32, buf: &mut [u8]) -> Result<usize> {
        self.with_buf(|inner| {
            if buf.is_empty() {
                return Ok(0);
            }
            let offset = byte_offset as usize;
            if offset >= inner.buf.len() {
                return Ok(0);
            }
            let n = buf.len().min(inner.buf.len() - offset);
            buf[..n].copy_from_slice(&inner.buf[offset..offset + n]);
            Ok(n)
        })
    }

    /// set raw bytes
    pub fn set_bytes(&self, byte_offset: u32, buf: &[u8]) -> Result<usize> {
        self.with_buf_mut(|inner| {
            if buf.is_empty() {
                return Ok(0);
            }
            let offset = byte_offset as usize;
            if offset >= inner.buf.len() {
                return Ok(0);
            }
            let n = buf.len().min(inner.buf.len() - offset);
            inner.buf[offset..offset + n].copy_from_slice(&buf[..n]);
            Ok(n)
        })
    }

    /* string access per the family's string layout */

    /// the character count of the string at `byte_offset`
    pub fn get_string_length(&self, byte_offset: u32) -> Result<u32> {
        let layout = self.core.order.string;
        self.with_buf(|inner| {
            if layout.is_counted {
                let offset = Self::check_range(inner, byte_offset, layout.count_word_bytes as usize)?;
                let mut len = 0u32;
                for i in 0..layout.count_word_bytes as usize {
                    len |= (inner.buf[offset + i] as u32) << (8 * i);
                }
                Ok(len.min(layout.max_capacity as u32))
            } else {
                let offset = Self::check_range(inner, byte_offset, 1)?;
                let len = inner.buf[offset..].iter().take_while(|&&b| b != 0).count();
                Ok(len as u32)
            }
        })
    }

    /// the maximum character capacity of the string at `byte_offset`
    pub fn get_string_capacity(&self, _byte_offset: u32) -> Result<u32> {
        Ok(self.core.order.string.max_capacity as u32)
    }

    /// the total space the string occupies in the buffer
    pub fn get_string_total_length(&self, byte_offset: u32) -> Result<u32> {
        let layout = self.core.order.string;
        if layout.total_length > 0 {
            return Ok(layout.total_length as u32);
        }
        let len = self.get_string_length(byte_offset)?;
        let mut total = layout.count_word_bytes as u32 + len;
        if layout.pad_to_multiple_bytes > 1 {
            let pad = layout.pad_to_multiple_bytes as u32;
            total = (total + pad - 1) / pad * pad;
        }
        Ok(total)
    }

    /// read the string at `byte_offset` into `buf`
    pub fn get_string(&self, byte_offset: u32, buf: &mut [u8]) -> Result<()> {
        let layout = self.core.order.string;
        let len = self.get_string_length(byte_offset)? as usize;
        self.with_buf(|inner| {
            let data_start =
                Self::check_range(inner, byte_offset + layout.count_word_bytes as u32, len)?;
            let n = len.min(buf.len());
            for (i, out) in buf[..n].iter_mut().enumerate() {
                let index = if layout.is_byte_swapped { i ^ 1 } else { i };
                *out = inner.buf[data_start + index];
            }
            Ok(())
        })
    }

    /// write a string at `byte_offset`, padding the remaining capacity
    pub fn set_string(&self, byte_offset: u32, value: impl AsRef<str>) -> Result<()> {
        let layout = self.core.order.string;
        let bytes = value.as_ref().as_bytes();
        if bytes.len() > layout.max_capacity as usize {
            return Err(ErrorKind::TooLarge.into());
        }
        self.with_buf_mut(|inner| {
            let count_bytes = layout.count_word_bytes as usize;
            let offset = Self::check_range(inner, byte_offset, count_bytes)?;
            // a swapped final odd byte still needs its partner in range
            let span = if layout.is_byte_swapped {
                (bytes.len() + 1) & !1
            } else {
                bytes.len()
            };
            let data_start =
                Self::check_range(inner, byte_offset + count_bytes as u32, span)?;
            for i in 0..count_bytes {
                inner.buf[offset + i] = (bytes.len() >> (8 * i)) as u8;
            }
            if layout.is_byte_swapped {
                for i in 0..span {
                    inner.buf[data_start + (i ^ 1)] = bytes.get(i).copied().unwrap_or(0);
                }
            } else {
                inner.buf[data_start..data_start + bytes.len()].copy_from_slice(bytes);
            }
            // zero the rest of a fixed-capacity string
            if layout.is_fixed_length {
                let end = (data_start + layout.max_capacity as usize).min(inner.buf.len());
                for b in inner.buf[data_start + span..end].iter_mut() {
                    *b = 0;
                }
            }
            Ok(())
        })
    }
}

macro_rules! accessor_impl {
    ($get:ident, $set:ident, $ty:ty, $uty:ty, $order_get:ident, $order_set:ident, $n:literal) => {
        impl RawTag {
            /// get value at the byte offset
            pub fn $get(&self, byte_offset: u32) -> Result<$ty> {
                self.with_buf(|inner| {
                    let offset = Self::check_range(inner, byte_offset, $n)?;
                    let raw = self.core.order.$order_get(&inner.buf[offset..offset + $n]);
                    Ok(raw as $ty)
                })
            }

            /// set value at the byte offset
            pub fn $set(&self, byte_offset: u32, value: $ty) -> Result<()> {
                self.with_buf_mut(|inner| {
                    let offset = Self::check_range(inner, byte_offset, $n)?;
                    let order = self.core.order;
                    order.$order_set(&mut inner.buf[offset..offset + $n], value as $uty);
                    Ok(())
                })
            }
        }
    };
}

accessor_impl!(get_u16, set_u16, u16, u16, get_u16, set_u16, 2);
accessor_impl!(get_i16, set_i16, i16, u16, get_u16, set_u16, 2);
accessor_impl!(get_u32, set_u32, u32, u32, get_u32, set_u32, 4);
accessor_impl!(get_i32, set_i32, i32, u32, get_u32, set_u32, 4);
accessor_impl!(get_u64, set_u64, u64, u64, get_u64, set_u64, 8);
accessor_impl!(get_i64, set_i64, i64, u64, get_u64, set_u64, 8);

impl RawTag {
    /// get u8 value
    pub fn get_u8(&self, byte_offset: u32) -> Result<u8> {
        self.with_buf(|inner| {
            let offset = Self::check_range(inner, byte_offset, 1)?;
            Ok(inner.buf[offset])
        })
    }

    /// set u8 value
    pub fn set_u8(&self, byte_offset: u32, value: u8) -> Result<()> {
        self.with_buf_mut(|inner| {
            let offset = Self::check_range(inner, byte_offset, 1)?;
            inner.buf[offset] = value;
            Ok(())
        })
    }

    /// get i8 value
    #[inline]
    pub fn get_i8(&self, byte_offset: u32) -> Result<i8> {
        Ok(self.get_u8(byte_offset)? as i8)
    }

    /// set i8 value
    #[inline]
    pub fn set_i8(&self, byte_offset: u32, value: i8) -> Result<()> {
        self.set_u8(byte_offset, value as u8)
    }

    /// get f32 value
    pub fn get_f32(&self, byte_offset: u32) -> Result<f32> {
        self.with_buf(|inner| {
            let offset = Self::check_range(inner, byte_offset, 4)?;
            Ok(self.core.order.get_f32(&inner.buf[offset..offset + 4]))
        })
    }

    /// set f32 value
    pub fn set_f32(&self, byte_offset: u32, value: f32) -> Result<()> {
        self.with_buf_mut(|inner| {
            let offset = Self::check_range(inner, byte_offset, 4)?;
            let order = self.core.order;
            order.set_f32(&mut inner.buf[offset..offset + 4], value);
            Ok(())
        })
    }

    /// get f64 value
    pub fn get_f64(&self, byte_offset: u32) -> Result<f64> {
        self.with_buf(|inner| {
            let offset = Self::check_range(inner, byte_offset, 8)?;
            Ok(self.core.order.get_f64(&inner.buf[offset..offset + 8]))
        })
    }

    /// set f64 value
    pub fn set_f64(&self, byte_offset: u32, value: f64) -> Result<()> {
        self.with_buf_mut(|inner| {
            let offset = Self::check_range(inner, byte_offset, 8)?;
            let order = self.core.order;
            order.set_f64(&mut inner.buf[offset..offset + 8], value);
            Ok(())
        })
    }

    /// get tag value of `T` that implements [`crate::Decode`]
    #[inline]
    pub fn get_value<T: crate::Decode>(&self, byte_offset: u32) -> Result<T> {
        T::decode(self, byte_offset)
    }

    /// set tag value that implements [`crate::Encode`]
    #[inline]
    pub fn set_value<T: crate::Encode>(&self, byte_offset: u32, value: T) -> Result<()> {
        value.encode(self, byte_offset)
    }
}

fn release(core: &Arc<TagCore>) {
    core.session.send(SessionCmd::Abort { tag: core.id });
    core.session.send(SessionCmd::Detach { tag: core.id });
    unregister(core.id);
}

impl Drop for RawTag {
    fn drop(&mut self) {
        event::emit(self.core.id, Event::Destroyed, Status::Ok);
        event::clear(self.core.id);
        release(&self.core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_tag_path_simple() {
        let path = encode_tag_path("MyTag").unwrap();
        assert_eq!(path, cip::Epath::new().symbolic("MyTag").into_bytes());
    }

    #[test]
    fn test_encode_tag_path_nested_with_indexes() {
        let path = encode_tag_path("Counts[3].ACC").unwrap();
        let expected = cip::Epath::new()
            .symbolic("Counts")
            .index(3)
            .symbolic("ACC")
            .into_bytes();
        assert_eq!(path, expected);

        let multi = encode_tag_path("Grid[1,2,3]").unwrap();
        let expected = cip::Epath::new()
            .symbolic("Grid")
            .index(1)
            .index(2)
            .index(3)
            .into_bytes();
        assert_eq!(multi, expected);
    }

    #[test]
    fn test_encode_tag_path_rejects_bad_names() {
        assert!(encode_tag_path("").is_err());
        assert!(encode_tag_path("Tag[1").is_err());
        assert!(encode_tag_path("Tag[x]").is_err());
        assert_eq!(
            encode_tag_path("Tag[1,2,3,4]").unwrap_err(),
            Status::Err(ErrorKind::OutOfBounds)
        );
    }

    #[test]
    fn test_family_order_selection() {
        let opts = TagOptions::parse(
            "protocol=ab-eip&gateway=h&plc=plc5&name=N7:0",
        )
        .unwrap();
        assert_eq!(family_order(&opts), order::PLC5);
        let opts = TagOptions::parse(
            "protocol=ab-eip&gateway=h&path=1,0&plc=controllogix&name=T",
        )
        .unwrap();
        assert_eq!(family_order(&opts), order::LOGIX);
    }

    #[test]
    fn test_resolve_addressing_special_names() {
        let opts = TagOptions::parse(
            "protocol=ab-eip&gateway=h&path=1,0&plc=controllogix&name=@tags",
        )
        .unwrap();
        assert!(matches!(
            resolve_addressing(&opts).unwrap(),
            Addressing::Directory
        ));

        let opts = TagOptions::parse(
            "protocol=ab-eip&gateway=h&path=1,0&plc=controllogix&name=@udt/291",
        )
        .unwrap();
        assert!(matches!(
            resolve_addressing(&opts).unwrap(),
            Addressing::Template { id: 291 }
        ));
    }
}
