// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! Modbus TCP test server.
//!
//! Serves function codes 0x01-0x06, 0x0F and 0x10 against a synthetic
//! register file: coils and discrete inputs as bit vectors, holding and
//! input registers as 16-bit word arrays. Bit addressing is address/8
//! with bit 1<<(address%8), little-endian within a byte.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tagbus_core::modbus::{self, ExceptionCode, FunctionCode, MbapHeader};
use tagbus_core::slice::Slice;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const RX_BUF_MAX: usize = 65536;

/// register file sizes
#[derive(Debug, Clone, Copy)]
pub struct ModbusServerConfig {
    pub bind: SocketAddr,
    pub unit_id: u8,
    pub coils: usize,
    pub discretes: usize,
    pub holding: usize,
    pub inputs: usize,
}

impl Default for ModbusServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".parse().expect("literal addr"),
            unit_id: 1,
            coils: 65536,
            discretes: 65536,
            holding: 65536,
            inputs: 65536,
        }
    }
}

/// the four register spaces behind one mutex each
pub struct RegisterFile {
    unit_id: u8,
    coils: Mutex<Vec<u8>>,
    coil_count: usize,
    discretes: Mutex<Vec<u8>>,
    discrete_count: usize,
    holding: Mutex<Vec<u16>>,
    inputs: Mutex<Vec<u16>>,
}

impl RegisterFile {
    fn new(config: &ModbusServerConfig) -> Self {
        // synthetic content: register i holds i, every third discrete
        // input set, coils clear
        let mut discretes = vec![0u8; (config.discretes + 7) / 8];
        for i in (0..config.discretes).step_by(3) {
            discretes[i / 8] |= 1 << (i % 8);
        }
        let holding: Vec<u16> = (0..config.holding).map(|i| i as u16).collect();
        let inputs: Vec<u16> = (0..config.inputs).map(|i| 1000u16.wrapping_add(i as u16)).collect();
        Self {
            unit_id: config.unit_id,
            coils: Mutex::new(vec![0u8; (config.coils + 7) / 8]),
            coil_count: config.coils,
            discretes: Mutex::new(discretes),
            discrete_count: config.discretes,
            holding: Mutex::new(holding),
            inputs: Mutex::new(inputs),
        }
    }

    /// read a holding register, for test assertions
    pub fn holding(&self, address: usize) -> u16 {
        self.holding.lock()[address]
    }

    /// overwrite a holding register
    pub fn set_holding(&self, address: usize, value: u16) {
        self.holding.lock()[address] = value;
    }

    /// read a coil bit, for test assertions
    pub fn coil(&self, address: usize) -> bool {
        self.coils.lock()[address / 8] & (1 << (address % 8)) != 0
    }
}

/// a Modbus test server bound to its socket
pub struct ModbusServer {
    pub addr: SocketAddr,
    pub registers: Arc<RegisterFile>,
    shutdown: watch::Sender<bool>,
}

impl ModbusServer {
    /// bind and start serving on the current tokio runtime
    pub async fn spawn(config: ModbusServerConfig) -> anyhow::Result<Self> {
        let registers = Arc::new(RegisterFile::new(&config));
        let listener = TcpListener::bind(config.bind).await?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, Arc::clone(&registers), shutdown_rx));
        info!("modbus server listening on {addr}");
        Ok(Self {
            addr,
            registers,
            shutdown,
        })
    }

    /// stop accepting and wind down connection tasks
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for ModbusServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    registers: Arc<RegisterFile>,
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
                    debug!("modbus server accepted {peer}");
                    stream.set_nodelay(true).ok();
                    tokio::spawn(connection_loop(
                        stream,
                        Arc::clone(&registers),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("modbus server accept failed: {e}");
                    return;
                }
            }
        }
    }
}

async fn connection_loop(
    mut stream: TcpStream,
    registers: Arc<RegisterFile>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    loop {
        let frame = loop {
            if let Some(total) = modbus::frame_len(&buf) {
                if total > RX_BUF_MAX {
                    warn!("modbus server dropping oversized frame");
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
                        debug!("modbus server read error: {e}");
                        return;
                    }
                }
            }
        };

        let Some(reply) = handle_frame(&registers, &frame) else {
            continue;
        };
        if let Err(e) = stream.write_all(&reply).await {
            debug!("modbus server write error: {e}");
            return;
        }
    }
}

fn reply_frame(header: &MbapHeader, pdu: &[u8]) -> Vec<u8> {
    let reply_header = MbapHeader::new(header.transaction_id, pdu.len() as u16, header.unit_id);
    let mut out = Vec::with_capacity(modbus::MBAP_LEN + pdu.len());
    out.extend_from_slice(&reply_header.to_bytes());
    out.extend_from_slice(pdu);
    out
}

fn exception(header: &MbapHeader, function: u8, code: ExceptionCode) -> Vec<u8> {
    reply_frame(header, &[function | 0x80, code as u8])
}

fn handle_frame(registers: &RegisterFile, frame: &[u8]) -> Option<Vec<u8>> {
    let input = Slice::new(frame);
    let header = MbapHeader::decode(&input).ok()?;
    if header.unit_id != registers.unit_id && header.unit_id != 0 {
        debug!("modbus server ignoring unit {}", header.unit_id);
        return None;
    }
    let pdu = input.sub(modbus::MBAP_LEN, header.length as usize - 1);
    let function_byte = pdu.u8(0);
    if pdu.has_error() {
        return None;
    }
    let Some(function) = FunctionCode::from_byte(function_byte) else {
        return Some(exception(&header, function_byte, ExceptionCode::IllegalFunction));
    };

    let reply = match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            read_bits(registers, &header, function, &pdu)
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            read_registers(registers, &header, function, &pdu)
        }
        FunctionCode::WriteSingleCoil => write_single_coil(registers, &header, &pdu),
        FunctionCode::WriteSingleRegister => write_single_register(registers, &header, &pdu),
        FunctionCode::WriteMultipleCoils => write_coils(registers, &header, &pdu),
        FunctionCode::WriteMultipleRegisters => write_registers(registers, &header, &pdu),
    };
    Some(reply)
}

fn read_bits(
    registers: &RegisterFile,
    header: &MbapHeader,
    function: FunctionCode,
    pdu: &Slice<'_>,
) -> Vec<u8> {
    let start = pdu.u16_be(1) as usize;
    let count = pdu.u16_be(3) as usize;
    if pdu.has_error() || count == 0 || count > modbus::MAX_READ_BITS as usize {
        return exception(header, function as u8, ExceptionCode::IllegalDataValue);
    }
    let (bits, total) = match function {
        FunctionCode::ReadCoils => (&registers.coils, registers.coil_count),
        _ => (&registers.discretes, registers.discrete_count),
    };
    if start + count > total {
        return exception(header, function as u8, ExceptionCode::IllegalDataAddress);
    }

    let bits = bits.lock();
    let byte_count = (count + 7) / 8;
    let mut pdu_out = Vec::with_capacity(2 + byte_count);
    pdu_out.push(function as u8);
    pdu_out.push(byte_count as u8);
    for byte_index in 0..byte_count {
        let mut b = 0u8;
        for bit_index in 0..8 {
            let address = start + byte_index * 8 + bit_index;
            if address < start + count && bits[address / 8] & (1 << (address % 8)) != 0 {
                b |= 1 << bit_index;
            }
        }
        pdu_out.push(b);
    }
    reply_frame(header, &pdu_out)
}

fn read_registers(
    registers: &RegisterFile,
    header: &MbapHeader,
    function: FunctionCode,
    pdu: &Slice<'_>,
) -> Vec<u8> {
    let start = pdu.u16_be(1) as usize;
    let count = pdu.u16_be(3) as usize;
    if pdu.has_error() || count == 0 || count > modbus::MAX_READ_REGS as usize {
        return exception(header, function as u8, ExceptionCode::IllegalDataValue);
    }
    let words = match function {
        FunctionCode::ReadHoldingRegisters => registers.holding.lock(),
        _ => registers.inputs.lock(),
    };
    if start + count > words.len() {
        return exception(header, function as u8, ExceptionCode::IllegalDataAddress);
    }

    let mut pdu_out = Vec::with_capacity(2 + 2 * count);
    pdu_out.push(function as u8);
    pdu_out.push((2 * count) as u8);
    for &word in &words[start..start + count] {
        pdu_out.extend_from_slice(&word.to_be_bytes());
    }
    reply_frame(header, &pdu_out)
}

fn write_single_coil(registers: &RegisterFile, header: &MbapHeader, pdu: &Slice<'_>) -> Vec<u8> {
    let function = FunctionCode::WriteSingleCoil as u8;
    let address = pdu.u16_be(1) as usize;
    let value = pdu.u16_be(3);
    if pdu.has_error() || (value != 0 && value != 0xFF00) {
        return exception(header, function, ExceptionCode::IllegalDataValue);
    }
    if address >= registers.coil_count {
        return exception(header, function, ExceptionCode::IllegalDataAddress);
    }

    {
        let mut coils = registers.coils.lock();
        if value == 0xFF00 {
            coils[address / 8] |= 1 << (address % 8);
        } else {
            coils[address / 8] &= !(1 << (address % 8));
        }
    }
    // the response echoes the request
    reply_frame(header, &pdu.bytes()[..5])
}

fn write_single_register(
    registers: &RegisterFile,
    header: &MbapHeader,
    pdu: &Slice<'_>,
) -> Vec<u8> {
    let function = FunctionCode::WriteSingleRegister as u8;
    let address = pdu.u16_be(1) as usize;
    let value = pdu.u16_be(3);
    if pdu.has_error() {
        return exception(header, function, ExceptionCode::IllegalDataValue);
    }
    {
        let mut holding = registers.holding.lock();
        if address >= holding.len() {
            return exception(header, function, ExceptionCode::IllegalDataAddress);
        }
        holding[address] = value;
    }
    reply_frame(header, &pdu.bytes()[..5])
}

fn write_coils(registers: &RegisterFile, header: &MbapHeader, pdu: &Slice<'_>) -> Vec<u8> {
    let function = FunctionCode::WriteMultipleCoils as u8;
    let start = pdu.u16_be(1) as usize;
    let count = pdu.u16_be(3) as usize;
    let byte_count = pdu.u8(5) as usize;
    let data = pdu.sub(6, byte_count);
    if pdu.has_error()
        || data.has_error()
        || count == 0
        || count > modbus::MAX_WRITE_BITS as usize
        || byte_count != (count + 7) / 8
    {
        return exception(header, function, ExceptionCode::IllegalDataValue);
    }
    if start + count > registers.coil_count {
        return exception(header, function, ExceptionCode::IllegalDataAddress);
    }

    {
        let mut coils = registers.coils.lock();
        for i in 0..count {
            let address = start + i;
            let on = data.bytes()[i / 8] & (1 << (i % 8)) != 0;
            if on {
                coils[address / 8] |= 1 << (address % 8);
            } else {
                coils[address / 8] &= !(1 << (address % 8));
            }
        }
    }

    let mut pdu_out = Vec::with_capacity(5);
    pdu_out.push(function);
    pdu_out.extend_from_slice(&(start as u16).to_be_bytes());
    pdu_out.extend_from_slice(&(count as u16).to_be_bytes());
    reply_frame(header, &pdu_out)
}

fn write_registers(registers: &RegisterFile, header: &MbapHeader, pdu: &Slice<'_>) -> Vec<u8> {
    let function = FunctionCode::WriteMultipleRegisters as u8;
    let start = pdu.u16_be(1) as usize;
    let count = pdu.u16_be(3) as usize;
    let byte_count = pdu.u8(5) as usize;
    let data = pdu.sub(6, byte_count);
    if pdu.has_error()
        || data.has_error()
        || count == 0
        || count > modbus::MAX_WRITE_REGS as usize
        || byte_count != 2 * count
    {
        return exception(header, function, ExceptionCode::IllegalDataValue);
    }
    {
        let mut holding = registers.holding.lock();
        if start + count > holding.len() {
            return exception(header, function, ExceptionCode::IllegalDataAddress);
        }
        for i in 0..count {
            holding[start + i] = data.u16_be(2 * i);
        }
    }

    let mut pdu_out = Vec::with_capacity(5);
    pdu_out.push(function);
    pdu_out.extend_from_slice(&(start as u16).to_be_bytes());
    pdu_out.extend_from_slice(&(count as u16).to_be_bytes());
    reply_frame(header, &pdu_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_registers() -> RegisterFile {
        RegisterFile::new(&ModbusServerConfig {
            coils: 100,
            discretes: 100,
            holding: 100,
            inputs: 100,
            ..Default::default()
        })
    }

    #[test]
    fn test_s3_read_holding_registers() {
        let registers = small_registers();
        // MBAP(0x0001, 0, 6, 1) PDU(0x03, start 0, count 10)
        let request = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A,
        ];
        let reply = handle_frame(&registers, &request).unwrap();
        // MBAP(0x0001, 0, 0x17, 1) PDU(0x03, 0x14, 10 registers)
        assert_eq!(&reply[..7], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x17, 0x01]);
        assert_eq!(reply[7], 0x03);
        assert_eq!(reply[8], 0x14);
        // register i holds i, big-endian on the wire
        assert_eq!(&reply[9..13], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(reply.len(), 7 + 2 + 20);
    }

    #[test]
    fn test_write_single_coil_echo() {
        let registers = small_registers();
        let request = [
            0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0x2A, 0xFF, 0x00,
        ];
        let reply = handle_frame(&registers, &request).unwrap();
        assert_eq!(&reply[7..], &request[7..]);
        assert!(registers.coil(42));

        // invalid coil value
        let request = [
            0x00, 0x03, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0x2A, 0x12, 0x34,
        ];
        let reply = handle_frame(&registers, &request).unwrap();
        assert_eq!(reply[7], 0x85);
        assert_eq!(reply[8], ExceptionCode::IllegalDataValue as u8);
    }

    #[test]
    fn test_out_of_range_is_illegal_address() {
        let registers = small_registers();
        let request = [
            0x00, 0x04, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x60, 0x00, 0x10,
        ];
        let reply = handle_frame(&registers, &request).unwrap();
        assert_eq!(reply[7], 0x83);
        assert_eq!(reply[8], ExceptionCode::IllegalDataAddress as u8);
    }

    #[test]
    fn test_count_bounds_are_illegal_value() {
        let registers = small_registers();
        // count 126 > 125 for registers
        let request = [
            0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0x00, 0x00, 0x00, 0x7E,
        ];
        let reply = handle_frame(&registers, &request).unwrap();
        assert_eq!(reply[7], 0x84);
        assert_eq!(reply[8], ExceptionCode::IllegalDataValue as u8);
    }

    #[test]
    fn test_write_multiple_registers() {
        let registers = small_registers();
        let request = [
            0x00, 0x06, 0x00, 0x00, 0x00, 0x0B, 0x01, 0x10, 0x00, 0x05, 0x00, 0x02, 0x04,
            0x11, 0x22, 0x33, 0x44,
        ];
        let reply = handle_frame(&registers, &request).unwrap();
        assert_eq!(&reply[7..], &[0x10, 0x00, 0x05, 0x00, 0x02]);
        assert_eq!(registers.holding(5), 0x1122);
        assert_eq!(registers.holding(6), 0x3344);
    }

    #[test]
    fn test_byte_count_mismatch() {
        let registers = small_registers();
        let request = [
            0x00, 0x07, 0x00, 0x00, 0x00, 0x09, 0x01, 0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01,
            0xFF, 0x03,
        ];
        let reply = handle_frame(&registers, &request).unwrap();
        assert_eq!(reply[7], 0x8F);
        assert_eq!(reply[8], ExceptionCode::IllegalDataValue as u8);
    }

    #[test]
    fn test_read_discrete_pattern() {
        let registers = small_registers();
        let request = [
            0x00, 0x08, 0x00, 0x00, 0x00, 0x06, 0x01, 0x02, 0x00, 0x00, 0x00, 0x08,
        ];
        let reply = handle_frame(&registers, &request).unwrap();
        assert_eq!(reply[7], 0x02);
        assert_eq!(reply[8], 1);
        // every third input set: bits 0, 3, 6
        assert_eq!(reply[9], 0b0100_1001);
    }

    #[test]
    fn test_unknown_function_is_illegal_function() {
        let registers = small_registers();
        let request = [
            0x00, 0x09, 0x00, 0x00, 0x00, 0x02, 0x01, 0x2B,
        ];
        let reply = handle_frame(&registers, &request).unwrap();
        assert_eq!(reply[7], 0xAB);
        assert_eq!(reply[8], ExceptionCode::IllegalFunction as u8);
    }
}
