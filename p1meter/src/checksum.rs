//! CRC-16 used by DSMR 4/5 telegrams.
//!
//! The checksum is CRC-16/ARC: reflected polynomial `0xA001`, initial value
//! zero, no final XOR. It covers every byte from the `/` start marker up to
//! and including the `!` end marker, and is sent as four uppercase hex
//! digits directly after the `!`.

/// Reflected form of the CRC-16 polynomial `x^16 + x^15 + x^2 + 1`.
const POLY: u16 = 0xA001;

/// Computes the CRC-16/ARC of `bytes`.
///
/// # Examples
///
/// ```rust
/// use p1meter::checksum::crc16;
///
/// assert_eq!(crc16(b"123456789"), 0xBB3D);
/// ```
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ POLY } else { crc >> 1 };
        }
        crc
    })
}

/// Parses the four hex digits that follow the `!` marker.
pub fn parse_hex(digits: &[u8]) -> Option<u16> {
    if digits.len() != 4 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    u16::from_str_radix(text, 16).ok()
}
