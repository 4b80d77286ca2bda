use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, info};
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::crc::{crc16_modbus, frame_crc_ok};
use crate::config::settings::ParityConfig;
use crate::utils::error::ModbusError;

const READ_HOLDING_REGISTERS: u8 = 0x03;
const WRITE_SINGLE_REGISTER: u8 = 0x06;
const WRITE_FRAME_LEN: usize = 8;
const EXCEPTION_FLAG: u8 = 0x80;
const MAX_REGISTERS_PER_READ: u16 = 125;

/// The transport seam: each call is one request/response round trip that
/// either succeeds or fails. Framing, CRC and the serial timeout live
/// behind it; callers never retry through it.
#[async_trait]
pub trait ModbusClientTrait: Send + Sync {
    async fn read_holding_registers(
        &self,
        slave_id: u8,
        start_addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;

    /// FC 0x06. Succeeds only when the slave echoes the request back.
    async fn write_single_register(&self, slave_id: u8, address: u16, value: u16) -> Result<(), ModbusError>;
}

pub struct ModbusClient {
    port_name: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl ModbusClient {
    pub fn new(
        port_name: &str,
        baud_rate: u32,
        parity: &ParityConfig,
        timeout_ms: u64,
    ) -> Result<Self, ModbusError> {
        info!("🔌 Connecting to Modbus RTU port: {}", port_name);
        info!("⚙️  Configuration: {} baud, 8 data bits, {:?} parity, 1 stop bit", baud_rate, parity);

        let serial_parity = match parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(timeout_ms))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serial_parity)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", port_name, e);
                ModbusError::ConnectionError(format!("Failed to open port {}: {}", port_name, e))
            })?;

        info!("✅ Modbus RTU connection established successfully");
        Ok(Self {
            port_name: port_name.to_string(),
            port: Arc::new(Mutex::new(port)),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

pub fn build_read_request(slave_id: u8, start_addr: u16, count: u16) -> Bytes {
    let mut request = BytesMut::with_capacity(8);
    request.put_u8(slave_id);
    request.put_u8(READ_HOLDING_REGISTERS);
    request.put_u16(start_addr);
    request.put_u16(count);

    let crc = crc16_modbus(&request);
    request.put_u16_le(crc);
    request.freeze()
}

pub fn build_write_single_request(slave_id: u8, address: u16, value: u16) -> Bytes {
    let mut request = BytesMut::with_capacity(WRITE_FRAME_LEN);
    request.put_u8(slave_id);
    request.put_u8(WRITE_SINGLE_REGISTER);
    request.put_u16(address);
    request.put_u16(value);

    let crc = crc16_modbus(&request);
    request.put_u16_le(crc);
    request.freeze()
}

fn check_header(slave_id: u8, function: u8, frame: &[u8], min_len: usize) -> Result<(), ModbusError> {
    if frame.len() < min_len {
        return Err(ModbusError::InvalidResponse(format!("frame too short: {} bytes", frame.len())));
    }
    if !frame_crc_ok(frame) {
        return Err(ModbusError::CrcError);
    }
    if frame[0] != slave_id {
        return Err(ModbusError::InvalidResponse(format!(
            "slave id mismatch: expected {}, got {}",
            slave_id, frame[0]
        )));
    }
    if frame[1] == function | EXCEPTION_FLAG {
        return Err(ModbusError::Exception(frame[2]));
    }
    if frame[1] != function {
        return Err(ModbusError::InvalidResponse(format!("unexpected function code 0x{:02x}", frame[1])));
    }
    Ok(())
}

/// A write-single-register reply must be a byte-for-byte echo of the request.
pub fn parse_write_response(request: &[u8], frame: &[u8]) -> Result<(), ModbusError> {
    let slave_id = request.first().copied().unwrap_or_default();
    check_header(slave_id, WRITE_SINGLE_REGISTER, frame, 5)?;
    if frame != request {
        return Err(ModbusError::InvalidResponse(format!(
            "write echo mismatch: sent {}, got {}",
            hex::encode(request),
            hex::encode(frame)
        )));
    }
    Ok(())
}

/// Validates a complete response frame and unpacks its big-endian words.
pub fn parse_read_response(slave_id: u8, count: u16, frame: &[u8]) -> Result<Vec<u16>, ModbusError> {
    check_header(slave_id, READ_HOLDING_REGISTERS, frame, 5)?;

    let byte_count = frame[2] as usize;
    if byte_count != count as usize * 2 || frame.len() != byte_count + 5 {
        return Err(ModbusError::InvalidResponse(format!(
            "byte count {} does not match {} requested registers",
            byte_count, count
        )));
    }

    Ok(frame[3..3 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Sends one request and reads back one complete frame. The frame length
/// comes from the function code in the reply header.
fn exchange(port: &mut dyn SerialPort, request: &[u8], slave_id: u8) -> Result<Vec<u8>, ModbusError> {
    // drop stale bytes from an earlier timed-out exchange
    port.clear(ClearBuffer::Input)
        .map_err(|e| ModbusError::CommunicationError(format!("Clear failed: {}", e)))?;

    port.write_all(request)
        .map_err(|e| ModbusError::CommunicationError(format!("Write failed: {}", e)))?;
    port.flush()
        .map_err(|e| ModbusError::CommunicationError(format!("Flush failed: {}", e)))?;

    let mut header = [0u8; 3];
    port.read_exact(&mut header)?;

    let remaining = if header[1] & EXCEPTION_FLAG != 0 {
        2
    } else if header[1] == WRITE_SINGLE_REGISTER {
        WRITE_FRAME_LEN - header.len()
    } else {
        header[2] as usize + 2
    };

    let mut frame = Vec::with_capacity(3 + remaining);
    frame.extend_from_slice(&header);
    frame.resize(3 + remaining, 0);
    port.read_exact(&mut frame[3..])?;

    debug!("📥 Response from slave {}: {}", slave_id, hex::encode(&frame));
    Ok(frame)
}

fn check_slave(slave_id: u8) -> Result<(), ModbusError> {
    if (1..=247).contains(&slave_id) {
        Ok(())
    } else {
        Err(ModbusError::InvalidDevice(slave_id))
    }
}

impl ModbusClient {
    async fn transact(&self, request: Bytes, slave_id: u8) -> Result<Vec<u8>, ModbusError> {
        let port = Arc::clone(&self.port);
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().map_err(|_| ModbusError::LockError)?;
            exchange(&mut **guard, &request, slave_id)
        })
        .await
        .map_err(|e| ModbusError::CommunicationError(format!("Transport task failed: {}", e)))?
    }
}

#[async_trait]
impl ModbusClientTrait for ModbusClient {
    async fn read_holding_registers(
        &self,
        slave_id: u8,
        start_addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        check_slave(slave_id)?;
        if count == 0 || count > MAX_REGISTERS_PER_READ {
            return Err(ModbusError::CommunicationError(format!(
                "register count {} outside 1-{}",
                count, MAX_REGISTERS_PER_READ
            )));
        }

        let request = build_read_request(slave_id, start_addr, count);
        debug!("📤 Reading {} registers from slave {} at {}: {}", count, slave_id, start_addr, hex::encode(&request));

        let frame = self.transact(request, slave_id).await?;
        parse_read_response(slave_id, count, &frame)
    }

    async fn write_single_register(&self, slave_id: u8, address: u16, value: u16) -> Result<(), ModbusError> {
        check_slave(slave_id)?;

        let request = build_write_single_request(slave_id, address, value);
        debug!(
            "📤 Writing 0x{:04X} to register 0x{:04X} on slave {}: {}",
            value, address, slave_id, hex::encode(&request)
        );

        let frame = self.transact(request.clone(), slave_id).await?;
        parse_write_response(&request, &frame)
    }
}
