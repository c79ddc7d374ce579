use std::time::{SystemTime, UNIX_EPOCH};

use crc::Crc;

pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as i64
}

/// CRC-32C (Castagnoli), the checksum of the v2 record batch format.
pub fn to_crc(data: &[u8]) -> u32 {
    Crc::<u32>::new(&crc::CRC_32_ISCSI).checksum(data)
}
