//! CRC32 numbering helpers.

/// Standard CRC-32 (ISO 3309 / ITU-T V.42), the checksum TL ids are built on.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Id of a definition from its canonical numbering string
/// (`name a:int b:Vector long = Type`).
pub(crate) fn tl_id(numbering: &str) -> u32 {
    crc32(numbering.as_bytes())
}
