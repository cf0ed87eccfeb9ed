// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! Allen-Bradley EIP/CIP test server.
//!
//! Implements enough of the protocol to round-trip-test the client:
//! RegisterSession always succeeds, Forward Open is validated against the
//! configured path and can reject the first N attempts as duplicate
//! connections to exercise the retry path, named tags serve read/write
//! (plus fragmented and Multiple Service Packet forms), the tag directory
//! and template classes answer `@tags`/`@udt` reads, and the PCCC object
//! executes PLC-5 and SLC typed transfers against data-table files.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tagbus_core::cip;
use tagbus_core::eip;
use tagbus_core::pccc;
use tagbus_core::slice::Slice;
use tagbus_core::udt::{TagDirEntry, UdtDef};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// per-connection receive buffer upper bound
const RX_BUF_MAX: usize = 65536;

/// unconnected response data budget before Forward Open negotiates one
const UNCONNECTED_BUDGET: usize = 504;

/// which PLC personality the server presents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPlcKind {
    /// symbolic tags, fragmented services allowed
    ControlLogix,
    /// symbolic tags, fragmented services rejected
    Omron,
    /// PCCC data-table files, PLC-5 level addressing
    Plc5,
    /// PCCC data-table files, SLC logical addressing
    Slc,
}

/// a served tag definition, parsed from `Name:TYPE[d1,d2,d3]`
#[derive(Debug)]
pub struct ServerTag {
    pub name: String,
    pub type_code: u16,
    pub elem_size: usize,
    pub dims: [u32; 3],
    data: Mutex<Vec<u8>>,
}

impl ServerTag {
    /// parse a tag definition string like `TestBigArray:DINT[10]`
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let (name, rest) = spec
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("tag spec {spec:?} needs Name:TYPE"))?;
        let (type_name, dims_text) = match rest.split_once('[') {
            Some((t, d)) => (
                t,
                Some(
                    d.strip_suffix(']')
                        .ok_or_else(|| anyhow::anyhow!("unterminated dims in {spec:?}"))?,
                ),
            ),
            None => (rest, None),
        };
        let type_code = match type_name.to_ascii_uppercase().as_str() {
            "BOOL" => cip::TYPE_BOOL,
            "SINT" => cip::TYPE_SINT,
            "INT" => cip::TYPE_INT,
            "DINT" => cip::TYPE_DINT,
            "LINT" => cip::TYPE_LINT,
            "REAL" => cip::TYPE_REAL,
            "LREAL" => cip::TYPE_LREAL,
            other => anyhow::bail!("unsupported tag type {other:?} in {spec:?}"),
        };
        let elem_size = cip::atomic_type_size(type_code).expect("atomic type");
        let mut dims = [0u32; 3];
        if let Some(dims_text) = dims_text {
            for (i, d) in dims_text.split(',').enumerate() {
                if i >= 3 {
                    anyhow::bail!("too many dimensions in {spec:?}");
                }
                dims[i] = d.trim().parse()?;
            }
        }
        let total: usize = dims.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
        let total = total.max(1);

        // deterministic synthetic content: element i holds i
        let mut data = vec![0u8; total * elem_size];
        for i in 0..total {
            let v = (i as u64).to_le_bytes();
            data[i * elem_size..(i + 1) * elem_size].copy_from_slice(&v[..elem_size]);
        }

        Ok(Self {
            name: name.to_owned(),
            type_code,
            elem_size,
            dims,
            data: Mutex::new(data),
        })
    }

    fn total_elements(&self) -> usize {
        self.dims
            .iter()
            .filter(|&&d| d > 0)
            .map(|&d| d as usize)
            .product::<usize>()
            .max(1)
    }

    fn num_dimensions(&self) -> usize {
        self.dims.iter().filter(|&&d| d > 0).count()
    }

    /// lock and read a span of the tag data
    pub fn peek(&self, start: usize, out: &mut [u8]) {
        let data = self.data.lock();
        let end = (start + out.len()).min(data.len());
        if start < end {
            out[..end - start].copy_from_slice(&data[start..end]);
        }
    }
}

/// a PCCC data-table file, parsed from a logical address like `N7:100`
/// (file 7, 100 integer elements)
#[derive(Debug)]
pub struct ServerFile {
    pub file: u16,
    pub file_type: pccc::FileType,
    pub elem_size: usize,
    data: Mutex<Vec<u8>>,
}

impl ServerFile {
    /// parse a file definition; the element number is the file length
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let addr = pccc::Address::parse(spec)
            .map_err(|status| anyhow::anyhow!("bad file spec {spec:?}: {status}"))?;
        let elements = addr.element.max(1) as usize;
        let elem_size = addr.file_type.element_size();
        let mut data = vec![0u8; elements * elem_size];
        for i in 0..elements {
            let v = (i as u64).to_le_bytes();
            data[i * elem_size..(i + 1) * elem_size].copy_from_slice(&v[..elem_size]);
        }
        Ok(Self {
            file: addr.file,
            file_type: addr.file_type,
            elem_size,
            data: Mutex::new(data),
        })
    }

    /// lock and read a span of the file data
    pub fn peek(&self, start: usize, out: &mut [u8]) {
        let data = self.data.lock();
        let end = (start + out.len()).min(data.len());
        if start < end {
            out[..end - start].copy_from_slice(&data[start..end]);
        }
    }
}

/// server configuration
pub struct AbServerConfig {
    pub bind: SocketAddr,
    pub kind: ServerPlcKind,
    /// backplane route the Forward Open path must match, e.g. `[1, 0]`
    pub route: Vec<u8>,
    /// bounce this many Forward Opens with a duplicate-connection error
    pub reject_fo: u32,
    /// hold every reply this long; exercises abort and timeout paths
    pub response_delay_ms: u64,
    pub tags: Vec<ServerTag>,
    pub files: Vec<ServerFile>,
    pub udts: Vec<UdtDef>,
}

impl Default for AbServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".parse().expect("literal addr"),
            kind: ServerPlcKind::ControlLogix,
            route: vec![1, 0],
            reject_fo: 0,
            response_delay_ms: 0,
            tags: Vec::new(),
            files: Vec::new(),
            udts: Vec::new(),
        }
    }
}

/// shared server state
pub struct PlcState {
    kind: ServerPlcKind,
    conn_path: Vec<u8>,
    reject_fo: AtomicU32,
    response_delay_ms: u64,
    pub tags: Vec<ServerTag>,
    files: HashMap<(pccc::FileType, u16), ServerFile>,
    udts: HashMap<u16, UdtDef>,
}

impl PlcState {
    fn new(config: AbServerConfig) -> (SocketAddr, Self) {
        let conn_path = cip::connection_path(&config.route);
        let files = config
            .files
            .into_iter()
            .map(|f| ((f.file_type, f.file), f))
            .collect();
        let udts = config.udts.into_iter().map(|u| (u.id, u)).collect();
        (
            config.bind,
            Self {
                kind: config.kind,
                conn_path,
                reject_fo: AtomicU32::new(config.reject_fo),
                response_delay_ms: config.response_delay_ms,
                tags: config.tags,
                files,
                udts,
            },
        )
    }

    /// look up a served tag by name
    pub fn tag(&self, name: &str) -> Option<&ServerTag> {
        self.tags.iter().find(|t| t.name == name)
    }

    /// look up a served data-table file
    pub fn file(&self, file_type: pccc::FileType, file: u16) -> Option<&ServerFile> {
        self.files.get(&(file_type, file))
    }
}

/// the connected-messaging state negotiated by Forward Open
struct ConnState {
    server_conn_id: u32,
    client_conn_id: u32,
    conn_serial: u16,
    vendor_id: u16,
    orig_serial: u32,
    max_packet: usize,
}

/// an AB test server bound to its socket
pub struct AbServer {
    pub addr: SocketAddr,
    pub state: Arc<PlcState>,
    shutdown: watch::Sender<bool>,
}

impl AbServer {
    /// bind and start serving on the current tokio runtime
    pub async fn spawn(config: AbServerConfig) -> anyhow::Result<Self> {
        let (bind, state) = PlcState::new(config);
        let state = Arc::new(state);
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown_rx));
        info!("ab server listening on {addr}");
        Ok(Self {
            addr,
            state,
            shutdown,
        })
    }

    /// stop accepting and wind down connection tasks
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for AbServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<PlcState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("ab server accepted {peer}");
                    stream.set_nodelay(true).ok();
                    tokio::spawn(connection_loop(
                        stream,
                        Arc::clone(&state),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("ab server accept failed: {e}");
                    return;
                }
            }
        }
    }
}

async fn connection_loop(
    mut stream: TcpStream,
    state: Arc<PlcState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut session_handle: u32 = 0;
    let mut conn: Option<ConnState> = None;

    loop {
        let frame = loop {
            if let Some(total) = eip::frame_len(&buf) {
                if total > RX_BUF_MAX {
                    warn!("ab server dropping oversized frame ({total} bytes)");
                    return;
                }
                if buf.len() >= total {
                    break buf.drain(..total).collect::<Vec<u8>>();
                }
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                read = stream.read_buf(&mut buf) => match read {
                    Ok(0) => return,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("ab server read error: {e}");
                        return;
                    }
                }
            }
        };

        let input = Slice::new(&frame);
        let Ok(header) = eip::Header::decode(&input) else {
            debug!("ab server dropping malformed header");
            return;
        };
        let body = input.sub(eip::HEADER_LEN, header.length as usize);

        let reply = match header.command {
            eip::CMD_REGISTER_SESSION => {
                session_handle = rand::thread_rng().gen_range(1..=u32::MAX);
                let mut out = eip::encode_register_session();
                // echo the request shape with our handle filled in
                out[4..8].copy_from_slice(&session_handle.to_le_bytes());
                out[12..20].copy_from_slice(&header.sender_context.to_le_bytes());
                Some(out)
            }
            eip::CMD_UNREGISTER_SESSION => return,
            eip::CMD_LIST_SERVICES => Some(list_services_reply(&header)),
            eip::CMD_LIST_IDENTITY => Some(list_identity_reply(&header)),
            eip::CMD_SEND_RR_DATA => {
                if header.session_handle != session_handle {
                    debug!("ab server rejecting unknown session handle");
                    None
                } else {
                    handle_rr_data(&state, &header, &body, &mut conn)
                }
            }
            eip::CMD_SEND_UNIT_DATA => {
                if header.session_handle != session_handle {
                    None
                } else {
                    handle_unit_data(&state, &header, &body, &mut conn)
                }
            }
            other => {
                debug!("ab server ignoring encapsulation command {other:#06x}");
                None
            }
        };

        if let Some(reply) = reply {
            if state.response_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(state.response_delay_ms)).await;
            }
            if let Err(e) = stream.write_all(&reply).await {
                debug!("ab server write error: {e}");
                return;
            }
        }
    }
}

fn encap_reply(command: u16, session_handle: u32, sender_context: u64, body: &[u8]) -> Vec<u8> {
    let header = eip::Header {
        command,
        length: body.len() as u16,
        session_handle,
        status: 0,
        sender_context,
        options: 0,
    };
    let mut out = Vec::with_capacity(eip::HEADER_LEN + body.len());
    header.encode_to(&mut out);
    out.extend_from_slice(body);
    out
}

fn list_services_reply(header: &eip::Header) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&0x0100u16.to_le_bytes()); // communications service
    body.extend_from_slice(&20u16.to_le_bytes());
    body.extend_from_slice(&1u16.to_le_bytes()); // protocol version
    body.extend_from_slice(&0x0120u16.to_le_bytes()); // capability flags
    body.extend_from_slice(b"Communications\0\0");
    encap_reply(eip::CMD_LIST_SERVICES, header.session_handle, header.sender_context, &body)
}

fn list_identity_reply(header: &eip::Header) -> Vec<u8> {
    let name = b"tagbus ab server";
    let mut item = Vec::new();
    item.extend_from_slice(&1u16.to_le_bytes()); // encap protocol version
    item.extend_from_slice(&[0u8; 16]); // socket address, unused here
    item.extend_from_slice(&0x0001u16.to_le_bytes()); // vendor
    item.extend_from_slice(&0x000Cu16.to_le_bytes()); // device type
    item.extend_from_slice(&0x0042u16.to_le_bytes()); // product code
    item.extend_from_slice(&[1, 0]); // revision
    item.extend_from_slice(&0u16.to_le_bytes()); // status
    item.extend_from_slice(&0xDEADBEEFu32.to_le_bytes()); // serial
    item.push(name.len() as u8);
    item.extend_from_slice(name);
    item.push(3); // state: operational

    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&0x000Cu16.to_le_bytes()); // identity item
    body.extend_from_slice(&(item.len() as u16).to_le_bytes());
    body.extend_from_slice(&item);
    encap_reply(eip::CMD_LIST_IDENTITY, header.session_handle, header.sender_context, &body)
}

fn handle_rr_data(
    state: &PlcState,
    header: &eip::Header,
    body: &Slice<'_>,
    conn: &mut Option<ConnState>,
) -> Option<Vec<u8>> {
    let payload = eip::decode_cpf(body).ok()?;
    let budget = conn
        .as_ref()
        .map(|c| c.max_packet)
        .unwrap_or(UNCONNECTED_BUDGET);
    let cip_reply = dispatch_cip(state, &payload.data, budget, conn);

    let mut reply_body = Vec::with_capacity(10 + 4 + cip_reply.len());
    reply_body.extend_from_slice(&0u32.to_le_bytes());
    reply_body.extend_from_slice(&0u16.to_le_bytes());
    reply_body.extend_from_slice(&2u16.to_le_bytes());
    reply_body.extend_from_slice(&eip::CPF_ITEM_NULL_ADDR.to_le_bytes());
    reply_body.extend_from_slice(&0u16.to_le_bytes());
    reply_body.extend_from_slice(&eip::CPF_ITEM_UNCONNECTED_DATA.to_le_bytes());
    reply_body.extend_from_slice(&(cip_reply.len() as u16).to_le_bytes());
    reply_body.extend_from_slice(&cip_reply);
    Some(encap_reply(
        eip::CMD_SEND_RR_DATA,
        header.session_handle,
        header.sender_context,
        &reply_body,
    ))
}

fn handle_unit_data(
    state: &PlcState,
    header: &eip::Header,
    body: &Slice<'_>,
    conn: &mut Option<ConnState>,
) -> Option<Vec<u8>> {
    let payload = eip::decode_cpf(body).ok()?;
    let (client_conn_id, budget) = {
        let conn = conn.as_ref()?;
        if payload.connection_id != Some(conn.server_conn_id) {
            debug!(
                "ab server dropping unit data for unknown connection {:?}",
                payload.connection_id
            );
            return None;
        }
        (conn.client_conn_id, conn.max_packet)
    };
    let sequence = payload.sequence?;
    let cip_reply = dispatch_cip(state, &payload.data, budget, conn);

    let mut reply_body = Vec::with_capacity(10 + 12 + cip_reply.len());
    reply_body.extend_from_slice(&0u32.to_le_bytes());
    reply_body.extend_from_slice(&0u16.to_le_bytes());
    reply_body.extend_from_slice(&2u16.to_le_bytes());
    reply_body.extend_from_slice(&eip::CPF_ITEM_CONNECTED_ADDR.to_le_bytes());
    reply_body.extend_from_slice(&4u16.to_le_bytes());
    reply_body.extend_from_slice(&client_conn_id.to_le_bytes());
    reply_body.extend_from_slice(&eip::CPF_ITEM_CONNECTED_DATA.to_le_bytes());
    reply_body.extend_from_slice(&((cip_reply.len() + 2) as u16).to_le_bytes());
    reply_body.extend_from_slice(&sequence.to_le_bytes());
    reply_body.extend_from_slice(&cip_reply);
    Some(encap_reply(
        eip::CMD_SEND_UNIT_DATA,
        header.session_handle,
        0,
        &reply_body,
    ))
}

fn make_cip_error(service: u8, status: u8, extended: Option<u16>) -> Vec<u8> {
    let mut out = vec![service | cip::REPLY_BIT, 0, status, 0];
    if let Some(extended) = extended {
        out[3] = 1;
        out.extend_from_slice(&extended.to_le_bytes());
    }
    out
}

/// split a CIP request into service, path, payload
fn parse_cip_request<'a>(input: &Slice<'a>) -> Option<(u8, Slice<'a>, Slice<'a>)> {
    let service = input.u8(0);
    let path_words = input.u8(1) as usize;
    let path = input.sub(2, path_words * 2);
    let payload = input.from(2 + path_words * 2);
    if input.has_error() || path.has_error() || payload.has_error() {
        return None;
    }
    Some((service, path, payload))
}

fn dispatch_cip(
    state: &PlcState,
    input: &Slice<'_>,
    budget: usize,
    conn: &mut Option<ConnState>,
) -> Vec<u8> {
    let Some((service, path, payload)) = parse_cip_request(input) else {
        return make_cip_error(0, cip::STATUS_INVALID_PARAM, None);
    };

    match service {
        cip::SRV_FORWARD_OPEN | cip::SRV_FORWARD_OPEN_EX => {
            handle_forward_open(state, service, &path, &payload, conn)
        }
        cip::SRV_FORWARD_CLOSE => handle_forward_close(state, service, &path, &payload, conn),
        // 0x52 doubles as Unconnected Send when aimed at the Connection
        // Manager; unwrap and dispatch the embedded request
        cip::SRV_UNCONNECTED_SEND if path.match_exact(&cip::CONNECTION_MANAGER_PATH) => {
            let embedded_len = payload.u16_le(2) as usize;
            let embedded = payload.sub(4, embedded_len);
            if payload.has_error() || embedded.has_error() {
                return make_cip_error(service, cip::STATUS_INSUFFICIENT_DATA, None);
            }
            dispatch_cip(state, &embedded, budget, conn)
        }
        cip::SRV_READ_TAG | cip::SRV_READ_TAG_FRAG => {
            handle_read(state, service, &path, &payload, budget)
        }
        cip::SRV_WRITE_TAG | cip::SRV_WRITE_TAG_FRAG => {
            handle_write(state, service, &path, &payload)
        }
        cip::SRV_MULTI if path.match_exact(&cip::MESSAGE_ROUTER_PATH) => {
            handle_multi(state, &payload, budget, conn)
        }
        cip::SRV_GET_INSTANCE_ATTRIB_LIST => handle_list_tags(state, service, &path, budget),
        cip::SRV_PCCC_EXECUTE if path.match_exact(&cip::PCCC_OBJECT_PATH) => {
            handle_pccc(state, service, &payload)
        }
        other => {
            debug!("ab server unsupported CIP service {other:#04x}");
            make_cip_error(other, cip::STATUS_UNSUPPORTED, None)
        }
    }
}

fn handle_forward_open(
    state: &PlcState,
    service: u8,
    path: &Slice<'_>,
    payload: &Slice<'_>,
    conn: &mut Option<ConnState>,
) -> Vec<u8> {
    if !path.match_exact(&cip::CONNECTION_MANAGER_PATH) {
        return make_cip_error(service, cip::STATUS_UNSUPPORTED, None);
    }
    let extended = service == cip::SRV_FORWARD_OPEN_EX;

    let mut offset = 0usize;
    let _secs_per_tick = payload.u8(offset);
    let _timeout_ticks = payload.u8(offset + 1);
    offset += 2;
    let _server_conn_id = payload.u32_le(offset);
    offset += 4;
    let client_conn_id = payload.u32_le(offset);
    offset += 4;
    let conn_serial = payload.u16_le(offset);
    offset += 2;
    let vendor_id = payload.u16_le(offset);
    offset += 2;
    let orig_serial = payload.u32_le(offset);
    offset += 4;
    offset += 4; // timeout multiplier + reserved
    let o2t_rpi = payload.u32_le(offset);
    offset += 4;
    let o2t_params = if extended {
        let v = payload.u32_le(offset);
        offset += 4;
        v
    } else {
        let v = payload.u16_le(offset) as u32;
        offset += 2;
        v
    };
    let t2o_rpi = payload.u32_le(offset);
    offset += 4;
    if extended {
        offset += 4;
    } else {
        offset += 2;
    }
    let _transport_class = payload.u8(offset);
    offset += 1;
    let path_words = payload.u8(offset) as usize;
    offset += 1;
    let conn_path = payload.sub(offset, path_words * 2);
    if payload.has_error() || conn_path.has_error() {
        return make_cip_error(service, cip::STATUS_INSUFFICIENT_DATA, None);
    }

    if !conn_path.match_exact(&state.conn_path) {
        debug!("ab server forward open path mismatch");
        return make_cip_error(service, cip::STATUS_PATH_DEST_UNKNOWN, None);
    }

    // bounce the first N attempts to exercise the client's retry path
    let remaining = state.reject_fo.load(Ordering::Relaxed);
    if remaining > 0 {
        state.reject_fo.store(remaining - 1, Ordering::Relaxed);
        info!("ab server bouncing forward open, {} to go", remaining - 1);
        return make_cip_error(
            service,
            cip::STATUS_CONN_FAILURE,
            Some(cip::EX_DUPLICATE_CONN),
        );
    }

    let mask = if extended { 0x0FFF } else { 0x01FF };
    let max_packet = (o2t_params & mask) as usize;
    let mut rng = rand::thread_rng();
    let server_conn_id: u32 = rng.gen_range(1..=u32::MAX);
    *conn = Some(ConnState {
        server_conn_id,
        client_conn_id,
        conn_serial,
        vendor_id,
        orig_serial,
        max_packet,
    });
    debug!(
        "ab server forward open ok, conn {server_conn_id:#010x}/{client_conn_id:#010x}, max packet {max_packet}"
    );

    let mut out = vec![service | cip::REPLY_BIT, 0, 0, 0];
    out.extend_from_slice(&server_conn_id.to_le_bytes());
    out.extend_from_slice(&client_conn_id.to_le_bytes());
    out.extend_from_slice(&conn_serial.to_le_bytes());
    out.extend_from_slice(&vendor_id.to_le_bytes());
    out.extend_from_slice(&orig_serial.to_le_bytes());
    out.extend_from_slice(&o2t_rpi.to_le_bytes());
    out.extend_from_slice(&t2o_rpi.to_le_bytes());
    out.extend_from_slice(&[0, 0]); // application reply size, reserved
    out
}

fn handle_forward_close(
    state: &PlcState,
    service: u8,
    path: &Slice<'_>,
    payload: &Slice<'_>,
    conn: &mut Option<ConnState>,
) -> Vec<u8> {
    if !path.match_exact(&cip::CONNECTION_MANAGER_PATH) {
        return make_cip_error(service, cip::STATUS_UNSUPPORTED, None);
    }
    let conn_serial = payload.u16_le(2);
    let vendor_id = payload.u16_le(4);
    let orig_serial = payload.u32_le(6);
    let path_words = payload.u8(10) as usize;
    // the path length is followed by a pad byte here, unlike Forward Open
    let conn_path = payload.sub(12, path_words * 2);
    if payload.has_error() || conn_path.has_error() {
        return make_cip_error(service, cip::STATUS_INSUFFICIENT_DATA, None);
    }
    if !conn_path.match_exact(&state.conn_path) {
        return make_cip_error(service, cip::STATUS_PATH_DEST_UNKNOWN, None);
    }

    match conn.take() {
        Some(open)
            if open.conn_serial == conn_serial
                && open.vendor_id == vendor_id
                && open.orig_serial == orig_serial =>
        {
            debug!("ab server forward close ok");
        }
        Some(open) => {
            // identity mismatch: keep the connection, report the error
            *conn = Some(open);
            return make_cip_error(service, cip::STATUS_INVALID_PARAM, None);
        }
        None => {
            // closing a connection that timed out on our side is fine
            debug!("ab server forward close without open connection");
        }
    }

    let mut out = vec![service | cip::REPLY_BIT, 0, 0, 0];
    out.extend_from_slice(&conn_serial.to_le_bytes());
    out.extend_from_slice(&vendor_id.to_le_bytes());
    out.extend_from_slice(&orig_serial.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    out
}

/// parse a symbolic tag path with up to three numeric indexes
fn parse_tag_path<'a>(
    state: &'a PlcState,
    path: &Slice<'_>,
) -> Option<(&'a ServerTag, Vec<u32>)> {
    let marker = path.u8(0);
    if marker != 0x91 {
        return None;
    }
    let name_len = path.u8(1) as usize;
    let name_slice = path.sub(2, name_len);
    if path.has_error() || name_slice.has_error() {
        return None;
    }
    let name = std::str::from_utf8(name_slice.bytes()).ok()?;
    let tag = state.tag(name)?;

    let mut offset = 2 + name_len;
    if offset % 2 != 0 {
        offset += 1;
    }
    let mut indexes = Vec::new();
    while offset < path.len() {
        match path.u8(offset) {
            0x28 => {
                indexes.push(path.u8(offset + 1) as u32);
                offset += 2;
            }
            0x29 => {
                indexes.push(path.u16_le(offset + 2) as u32);
                offset += 4;
            }
            0x2A => {
                indexes.push(path.u32_le(offset + 2));
                offset += 6;
            }
            _ => return None,
        }
        if indexes.len() > 3 {
            return None;
        }
    }
    if path.has_error() {
        return None;
    }
    if !indexes.is_empty() && indexes.len() != tag.num_dimensions() {
        return None;
    }
    Some((tag, indexes))
}

/// linear element offset plus request bounds, shared by read and write
fn request_span(
    tag: &ServerTag,
    indexes: &[u32],
    elem_count: usize,
) -> Option<(usize, usize)> {
    for (i, &index) in indexes.iter().enumerate() {
        if index >= tag.dims[i] {
            return None;
        }
    }
    let element_offset = match indexes.len() {
        0 => 0,
        1 => indexes[0] as usize,
        2 => indexes[0] as usize * tag.dims[1] as usize + indexes[1] as usize,
        3 => {
            indexes[0] as usize * tag.dims[1] as usize * tag.dims[2] as usize
                + indexes[1] as usize * tag.dims[2] as usize
                + indexes[2] as usize
        }
        _ => return None,
    };
    if element_offset >= tag.total_elements() {
        return None;
    }
    let start = element_offset * tag.elem_size;
    let end = start + elem_count * tag.elem_size;
    if end > tag.total_elements() * tag.elem_size {
        return None;
    }
    Some((start, end))
}

fn handle_read(
    state: &PlcState,
    service: u8,
    path: &Slice<'_>,
    payload: &Slice<'_>,
    budget: usize,
) -> Vec<u8> {
    let fragmented = service == cip::SRV_READ_TAG_FRAG;
    if state.kind == ServerPlcKind::Omron && fragmented {
        return make_cip_error(service, cip::STATUS_UNSUPPORTED, None);
    }

    // template reads share the service code but address class 0x6C
    if path.u8(0) == 0x21 {
        return handle_template_read(state, service, path);
    }

    let Some((tag, indexes)) = parse_tag_path(state, path) else {
        return make_cip_error(service, cip::STATUS_INVALID_PARAM, None);
    };
    let elem_count = payload.u16_le(0) as usize;
    let frag_offset = if fragmented {
        payload.u32_le(2) as usize
    } else {
        0
    };
    if payload.has_error() || elem_count == 0 {
        return make_cip_error(service, cip::STATUS_INSUFFICIENT_DATA, None);
    }

    let Some((start, end)) = request_span(tag, &indexes, elem_count) else {
        return make_cip_error(service, cip::STATUS_INVALID_PARAM, None);
    };
    let start = start + frag_offset;
    if start > end {
        return make_cip_error(service, cip::STATUS_INVALID_PARAM, None);
    }

    // whole elements only, and leave room for the reply header + type
    let room = budget.saturating_sub(6);
    let mut copy = (end - start).min(room / tag.elem_size * tag.elem_size);
    if copy == 0 && end > start {
        return make_cip_error(service, cip::STATUS_EXTENDED, Some(cip::EX_TOO_LONG));
    }
    copy = copy.min(end - start);
    let partial = start + copy < end;

    let mut out = vec![
        service | cip::REPLY_BIT,
        0,
        if partial { cip::STATUS_PARTIAL } else { cip::STATUS_OK },
        0,
    ];
    out.extend_from_slice(&tag.type_code.to_le_bytes());
    let data = tag.data.lock();
    out.extend_from_slice(&data[start..start + copy]);
    out
}

fn handle_template_read(state: &PlcState, service: u8, path: &Slice<'_>) -> Vec<u8> {
    // 16-bit class + instance segments
    let class = path.u16_le(2);
    let instance = path.u16_le(6);
    if path.has_error() || class != 0x6C {
        return make_cip_error(service, cip::STATUS_PATH_DEST_UNKNOWN, None);
    }
    let Some(def) = state.udts.get(&instance) else {
        return make_cip_error(service, cip::STATUS_PATH_DEST_UNKNOWN, None);
    };
    let mut out = vec![service | cip::REPLY_BIT, 0, cip::STATUS_OK, 0];
    out.extend_from_slice(&cip::TYPE_STRUCT.to_le_bytes());
    out.extend_from_slice(&def.handle.to_le_bytes());
    out.extend_from_slice(&def.encode());
    out
}

fn handle_write(
    state: &PlcState,
    service: u8,
    path: &Slice<'_>,
    payload: &Slice<'_>,
) -> Vec<u8> {
    let fragmented = service == cip::SRV_WRITE_TAG_FRAG;
    if state.kind == ServerPlcKind::Omron && fragmented {
        return make_cip_error(service, cip::STATUS_UNSUPPORTED, None);
    }
    let Some((tag, indexes)) = parse_tag_path(state, path) else {
        return make_cip_error(service, cip::STATUS_INVALID_PARAM, None);
    };

    let type_code = payload.u16_le(0);
    if type_code != tag.type_code {
        debug!(
            "ab server write type {type_code:#06x} does not match tag type {:#06x}",
            tag.type_code
        );
        return make_cip_error(service, cip::STATUS_INVALID_PARAM, None);
    }
    let elem_count = payload.u16_le(2) as usize;
    let mut data_offset = 4;
    let frag_offset = if fragmented {
        data_offset += 4;
        payload.u32_le(4) as usize
    } else {
        0
    };
    let data = payload.from(data_offset);
    if payload.has_error() || data.has_error() || elem_count == 0 {
        return make_cip_error(service, cip::STATUS_INSUFFICIENT_DATA, None);
    }

    let Some((start, end)) = request_span(tag, &indexes, elem_count) else {
        return make_cip_error(service, cip::STATUS_INVALID_PARAM, None);
    };
    let start = start + frag_offset;
    if start + data.len() > end {
        debug!("ab server write overruns the request span");
        return make_cip_error(service, cip::STATUS_TOO_MUCH_DATA, None);
    }

    {
        let mut stored = tag.data.lock();
        stored[start..start + data.len()].copy_from_slice(data.bytes());
    }
    vec![service | cip::REPLY_BIT, 0, cip::STATUS_OK, 0]
}

fn handle_multi(
    state: &PlcState,
    payload: &Slice<'_>,
    budget: usize,
    conn: &mut Option<ConnState>,
) -> Vec<u8> {
    let count = payload.u16_le(0) as usize;
    if payload.has_error() || count == 0 {
        return make_cip_error(cip::SRV_MULTI, cip::STATUS_INSUFFICIENT_DATA, None);
    }
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        offsets.push(payload.u16_le(2 + 2 * i) as usize);
    }
    if payload.has_error() {
        return make_cip_error(cip::SRV_MULTI, cip::STATUS_INSUFFICIENT_DATA, None);
    }

    let mut replies = Vec::with_capacity(count);
    for i in 0..count {
        let start = offsets[i];
        let end = if i + 1 < count {
            offsets[i + 1]
        } else {
            payload.len()
        };
        if end < start {
            return make_cip_error(cip::SRV_MULTI, cip::STATUS_INVALID_PARAM, None);
        }
        let sub = payload.sub(start, end - start);
        if sub.has_error() {
            return make_cip_error(cip::SRV_MULTI, cip::STATUS_INVALID_PARAM, None);
        }
        replies.push(dispatch_cip(state, &sub, budget, conn));
    }

    let mut out = vec![cip::SRV_MULTI | cip::REPLY_BIT, 0, cip::STATUS_OK, 0];
    out.extend_from_slice(&(count as u16).to_le_bytes());
    let mut offset = 2 + 2 * count;
    for reply in &replies {
        out.extend_from_slice(&(offset as u16).to_le_bytes());
        offset += reply.len();
    }
    for reply in &replies {
        out.extend_from_slice(reply);
    }
    out
}

fn handle_list_tags(
    state: &PlcState,
    service: u8,
    path: &Slice<'_>,
    budget: usize,
) -> Vec<u8> {
    // 16-bit class + instance path against the symbol class
    let class = path.u16_le(2);
    let start_instance = path.u16_le(6) as u32;
    if path.has_error() || class != cip::SYMBOL_CLASS {
        return make_cip_error(service, cip::STATUS_PATH_DEST_UNKNOWN, None);
    }

    let mut records = Vec::new();
    let mut truncated = false;
    for (i, tag) in state.tags.iter().enumerate() {
        let instance_id = (i + 1) as u32;
        if instance_id < start_instance.max(1) {
            continue;
        }
        let entry = TagDirEntry {
            instance_id,
            name: tag.name.clone(),
            symbol_type: tag.type_code,
            elem_size: tag.elem_size as u16,
            dims: tag.dims,
        };
        let mut encoded = Vec::new();
        entry.encode_to(&mut encoded);
        if records.len() + encoded.len() + 8 > budget {
            truncated = true;
            break;
        }
        records.extend_from_slice(&encoded);
    }

    let status = if truncated {
        cip::STATUS_PARTIAL
    } else {
        cip::STATUS_OK
    };
    let mut out = vec![service | cip::REPLY_BIT, 0, status, 0];
    out.extend_from_slice(&records);
    out
}

fn handle_pccc(state: &PlcState, service: u8, payload: &Slice<'_>) -> Vec<u8> {
    let id_size = payload.u8(0) as usize;
    let vendor_id = payload.u16_le(1);
    let vendor_serial = payload.u32_le(3);
    let base = id_size.max(1);
    let cmd = payload.u8(base);
    let _sts = payload.u8(base + 1);
    let tns = payload.u16_le(base + 2);
    let fnc = payload.u8(base + 4);
    let body = payload.from(base + 5);
    if payload.has_error() || body.has_error() || cmd != pccc::CMD_TYPED {
        return make_cip_error(service, cip::STATUS_INVALID_PARAM, None);
    }

    let (sts, data) = match fnc {
        pccc::FNC_PLC5_TYPED_READ => pccc_plc5_read(state, &body),
        pccc::FNC_PLC5_TYPED_WRITE => pccc_plc5_write(state, &body),
        pccc::FNC_SLC_READ => pccc_slc_read(state, &body),
        pccc::FNC_SLC_WRITE => pccc_slc_write(state, &body),
        _ => (0x10, Vec::new()), // illegal command or format
    };

    let mut out = vec![service | cip::REPLY_BIT, 0, cip::STATUS_OK, 0];
    out.push(0x07);
    out.extend_from_slice(&vendor_id.to_le_bytes());
    out.extend_from_slice(&vendor_serial.to_le_bytes());
    out.push(cmd | pccc::CMD_REPLY_BIT);
    out.push(sts);
    out.extend_from_slice(&tns.to_le_bytes());
    out.extend_from_slice(&data);
    out
}

/// decode a variable-width PCCC value (0xFF marker + LE16 for >254)
fn decode_pccc_value(body: &Slice<'_>, offset: &mut usize) -> u16 {
    let first = body.u8(*offset);
    *offset += 1;
    if first != 0xFF {
        first as u16
    } else {
        let v = body.u16_le(*offset);
        *offset += 2;
        v
    }
}

/// PLC-5 level-encoded address: level byte then file, element, [sub]
fn decode_plc5_addr(body: &Slice<'_>, offset: &mut usize) -> Option<(u16, u16, Option<u16>)> {
    let level = body.u8(*offset);
    *offset += 1;
    if level & 0x06 != 0x06 {
        return None;
    }
    let file = decode_pccc_value(body, offset);
    let element = decode_pccc_value(body, offset);
    let sub = if level & 0x08 != 0 {
        Some(decode_pccc_value(body, offset))
    } else {
        None
    };
    if body.has_error() {
        return None;
    }
    Some((file, element, sub))
}

fn find_file_by_number(state: &PlcState, file: u16) -> Option<&ServerFile> {
    state.files.values().find(|f| f.file == file)
}

fn pccc_plc5_read(state: &PlcState, body: &Slice<'_>) -> (u8, Vec<u8>) {
    let mut offset = 0usize;
    let word_offset = body.u16_le(offset) as usize;
    offset += 2;
    let elements = body.u16_le(offset) as usize;
    offset += 2;
    let Some((file, element, sub)) = decode_plc5_addr(body, &mut offset) else {
        return (0x10, Vec::new());
    };
    let Some(served) = find_file_by_number(state, file) else {
        return (0x06, Vec::new()); // address doesn't point to something usable
    };
    let start = (element as usize + sub.unwrap_or(0) as usize) * served.elem_size
        + word_offset * 2;
    let end = start + elements * served.elem_size;
    let data = served.data.lock();
    if end > data.len() {
        return (0x0A, Vec::new()); // transaction size too large
    }
    // typed read replies carry a DT byte before the data
    let mut out = pccc::encode_dt_byte(served.file_type.slc_type_code().unwrap_or(0x04) as u32,
        served.elem_size as u32);
    out.extend_from_slice(&data[start..end]);
    (0, out)
}

fn pccc_plc5_write(state: &PlcState, body: &Slice<'_>) -> (u8, Vec<u8>) {
    let mut offset = 0usize;
    let word_offset = body.u16_le(offset) as usize;
    offset += 2;
    let elements = body.u16_le(offset) as usize;
    offset += 2;
    let Some((file, element, sub)) = decode_plc5_addr(body, &mut offset) else {
        return (0x10, Vec::new());
    };
    let payload = body.from(offset);
    if payload.has_error() {
        return (0x10, Vec::new());
    }
    let Some(served) = find_file_by_number(state, file) else {
        return (0x06, Vec::new());
    };
    let start = (element as usize + sub.unwrap_or(0) as usize) * served.elem_size
        + word_offset * 2;
    let expected = elements * served.elem_size;
    if payload.len() != expected {
        return (0x10, Vec::new());
    }
    let mut data = served.data.lock();
    if start + expected > data.len() {
        return (0x0A, Vec::new());
    }
    data[start..start + expected].copy_from_slice(payload.bytes());
    (0, Vec::new())
}

/// SLC address quad: file, type code, element, sub-element
fn decode_slc_addr(body: &Slice<'_>, offset: &mut usize) -> Option<(u16, u16, u16)> {
    let file = decode_pccc_value(body, offset);
    let _type_code = decode_pccc_value(body, offset);
    let element = decode_pccc_value(body, offset);
    let sub = decode_pccc_value(body, offset);
    if body.has_error() {
        return None;
    }
    Some((file, element, sub))
}

fn pccc_slc_read(state: &PlcState, body: &Slice<'_>) -> (u8, Vec<u8>) {
    let mut offset = 0usize;
    let byte_count = body.u8(offset) as usize;
    offset += 1;
    let Some((file, element, sub)) = decode_slc_addr(body, &mut offset) else {
        return (0x10, Vec::new());
    };
    let Some(served) = find_file_by_number(state, file) else {
        return (0x06, Vec::new());
    };
    let start = (element as usize + sub as usize) * served.elem_size;
    let data = served.data.lock();
    if start + byte_count > data.len() {
        return (0x0A, Vec::new());
    }
    (0, data[start..start + byte_count].to_vec())
}

fn pccc_slc_write(state: &PlcState, body: &Slice<'_>) -> (u8, Vec<u8>) {
    let mut offset = 0usize;
    let byte_count = body.u8(offset) as usize;
    offset += 1;
    let Some((file, element, sub)) = decode_slc_addr(body, &mut offset) else {
        return (0x10, Vec::new());
    };
    let payload = body.from(offset);
    if payload.has_error() || payload.len() != byte_count {
        return (0x10, Vec::new());
    }
    let Some(served) = find_file_by_number(state, file) else {
        return (0x06, Vec::new());
    };
    let start = (element as usize + sub as usize) * served.elem_size;
    let mut data = served.data.lock();
    if start + byte_count > data.len() {
        return (0x0A, Vec::new());
    }
    data[start..start + byte_count].copy_from_slice(payload.bytes());
    (0, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(tags: Vec<&str>) -> PlcState {
        let config = AbServerConfig {
            tags: tags.into_iter().map(|t| ServerTag::parse(t).unwrap()).collect(),
            files: vec![ServerFile::parse("N7:100").unwrap()],
            ..Default::default()
        };
        PlcState::new(config).1
    }

    #[test]
    fn test_tag_spec_parse() {
        let tag = ServerTag::parse("TestBigArray:DINT[10]").unwrap();
        assert_eq!(tag.name, "TestBigArray");
        assert_eq!(tag.type_code, cip::TYPE_DINT);
        assert_eq!(tag.elem_size, 4);
        assert_eq!(tag.dims, [10, 0, 0]);
        assert_eq!(tag.total_elements(), 10);
        // synthetic pattern: element i == i
        let data = tag.data.lock();
        assert_eq!(&data[4..8], &[1, 0, 0, 0]);

        assert!(ServerTag::parse("NoType").is_err());
        assert!(ServerTag::parse("X:WIDGET").is_err());
    }

    #[test]
    fn test_read_roundtrip_through_dispatch() {
        let state = test_state(vec!["Counts:INT[4]"]);
        let path = cip::Epath::new().symbolic("Counts").into_bytes();
        let request = cip::encode_read(&path, 4);
        let reply = dispatch_cip(&state, &Slice::new(&request), UNCONNECTED_BUDGET, &mut None);
        let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
        assert_eq!(parsed.status, cip::STATUS_OK);
        let payload = cip::decode_read_payload(&parsed.payload).unwrap();
        assert_eq!(payload.type_code, cip::TYPE_INT);
        assert_eq!(payload.data.bytes(), &[0, 0, 1, 0, 2, 0, 3, 0]);
    }

    #[test]
    fn test_write_type_mismatch_is_invalid_param() {
        let state = test_state(vec!["Counts:INT[4]"]);
        let path = cip::Epath::new().symbolic("Counts").into_bytes();
        let request = cip::encode_write(&path, cip::TYPE_DINT, None, 1, &[1, 2, 3, 4]);
        let reply = dispatch_cip(&state, &Slice::new(&request), UNCONNECTED_BUDGET, &mut None);
        let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
        assert_eq!(parsed.status, cip::STATUS_INVALID_PARAM);
    }

    #[test]
    fn test_large_read_goes_partial() {
        let state = test_state(vec!["Big:DINT[500]"]);
        let path = cip::Epath::new().symbolic("Big").into_bytes();
        let request = cip::encode_read(&path, 500);
        let reply = dispatch_cip(&state, &Slice::new(&request), UNCONNECTED_BUDGET, &mut None);
        let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
        assert_eq!(parsed.status, cip::STATUS_PARTIAL);
        let payload = cip::decode_read_payload(&parsed.payload).unwrap();
        assert!(payload.data.len() < 2000);
        assert_eq!(payload.data.len() % 4, 0);
    }

    #[test]
    fn test_out_of_bounds_index_rejected() {
        let state = test_state(vec!["Counts:INT[4]"]);
        let path = cip::Epath::new().symbolic("Counts").index(9).into_bytes();
        let request = cip::encode_read(&path, 1);
        let reply = dispatch_cip(&state, &Slice::new(&request), UNCONNECTED_BUDGET, &mut None);
        let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
        assert_eq!(parsed.status, cip::STATUS_INVALID_PARAM);
    }

    #[test]
    fn test_pccc_plc5_write_then_read() {
        let state = test_state(vec![]);
        let addr = pccc::Address::parse("N7:10").unwrap();
        // the S6 shape: write 42 to N7:10
        let write = pccc::plc5_write(0x0001, &addr, 0, 1, &[0x2A, 0x00]);
        let request = pccc::encode_execute(0xF33D, 1, &write);
        let reply = dispatch_cip(&state, &Slice::new(&request), UNCONNECTED_BUDGET, &mut None);
        let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
        let pccc_reply = pccc::decode_execute_reply(&parsed.payload).unwrap();
        assert!(pccc_reply.check().is_ok());

        let read = pccc::plc5_read(0x0002, &addr, 0, 1);
        let request = pccc::encode_execute(0xF33D, 1, &read);
        let reply = dispatch_cip(&state, &Slice::new(&request), UNCONNECTED_BUDGET, &mut None);
        let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
        let pccc_reply = pccc::decode_execute_reply(&parsed.payload).unwrap();
        assert!(pccc_reply.check().is_ok());
        let raw = pccc_reply.data.bytes();
        let (_, _, consumed) = pccc::decode_dt_byte(raw).unwrap();
        assert_eq!(&raw[consumed..], &[0x2A, 0x00]);
    }

    #[test]
    fn test_forward_open_reject_counter() {
        let config = AbServerConfig {
            reject_fo: 2,
            ..Default::default()
        };
        let (_, state) = PlcState::new(config);
        let fo = cip::ForwardOpen {
            extended: false,
            secs_per_tick: 10,
            timeout_ticks: 5,
            client_conn_id: 0x100,
            conn_serial: 0x42,
            vendor_id: 0xF33D,
            orig_serial: 7,
            timeout_multiplier: 1,
            rpi_us: 1_000_000,
            max_packet: cip::MAX_PACKET_LEGACY,
            conn_path: cip::connection_path(&[1, 0]),
        };
        let request = fo.encode();
        let mut conn = None;
        for _ in 0..2 {
            let reply = dispatch_cip(&state, &Slice::new(&request), UNCONNECTED_BUDGET, &mut conn);
            let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
            assert_eq!(parsed.status, cip::STATUS_CONN_FAILURE);
            assert_eq!(parsed.extended, Some(cip::EX_DUPLICATE_CONN));
        }
        let reply = dispatch_cip(&state, &Slice::new(&request), UNCONNECTED_BUDGET, &mut conn);
        let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
        assert_eq!(parsed.status, cip::STATUS_OK);
        assert!(conn.is_some());
    }

    #[test]
    fn test_multi_service_packet_dispatch() {
        let state = test_state(vec!["A:INT[2]", "B:INT[2]"]);
        let a = cip::encode_read(&cip::Epath::new().symbolic("A").into_bytes(), 2);
        let b = cip::encode_read(&cip::Epath::new().symbolic("B").into_bytes(), 2);
        let packed = cip::encode_multi(&[a, b]);
        let reply = dispatch_cip(&state, &Slice::new(&packed), UNCONNECTED_BUDGET, &mut None);
        let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
        assert_eq!(parsed.status, cip::STATUS_OK);
        let parts = cip::decode_multi_reply(&parsed.payload).unwrap();
        assert_eq!(parts.len(), 2);
        for part in parts {
            let sub = cip::decode_reply(&part).unwrap();
            assert_eq!(sub.status, cip::STATUS_OK);
        }
    }

    #[test]
    fn test_tag_directory_listing() {
        let state = test_state(vec!["A:INT[2]", "B:DINT[3]"]);
        let request = cip::encode_list_tags(0);
        let reply = dispatch_cip(&state, &Slice::new(&request), UNCONNECTED_BUDGET, &mut None);
        let parsed = cip::decode_reply(&Slice::new(&reply)).unwrap();
        assert_eq!(parsed.status, cip::STATUS_OK);
        let entries = tagbus_core::udt::parse_tag_directory(parsed.payload.bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "A");
        assert_eq!(entries[1].instance_id, 2);
        assert_eq!(entries[1].symbol_type, cip::TYPE_DINT);
    }
}
