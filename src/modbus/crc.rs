/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF). Appended little-endian.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    let poly: u16 = 0xA001;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Checks the trailing two CRC bytes of a complete RTU frame.
pub fn frame_crc_ok(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    received == crc16_modbus(&frame[..data_len])
}
