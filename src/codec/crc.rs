//! Checksum kit: CRC-32, CRC-16/CCITT and the vendor sums.
//!
//! Four distinct algorithms live here because each chipset family pins its
//! own:
//!
//! - CRC-32 (Ethernet polynomial, reflected) for general integrity checks
//! - CRC-16/CCITT for Qualcomm Diag HDLC frames
//! - the Spreadtrum 16-bit one's-complement sum for FDL/Diag packets
//! - the MTK 16-bit byte sum acknowledging DA uploads

/// Reflected Ethernet polynomial.
const CRC32_POLY: u32 = 0xEDB88320;

/// CCITT polynomial, MSB-first.
const CRC16_CCITT_POLY: u16 = 0x1021;

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { CRC32_POLY ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

const fn build_ccitt_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = (i as u16) << 8;
        let mut k = 0;
        while k < 8 {
            c = if c & 0x8000 != 0 {
                (c << 1) ^ CRC16_CCITT_POLY
            } else {
                c << 1
            };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_crc32_table();
static CCITT_TABLE: [u16; 256] = build_ccitt_table();

/// CRC-32, seed `0xFFFFFFFF`, final XOR `0xFFFFFFFF`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(0, data)
}

/// Streaming CRC-32 update.
///
/// `crc` is the value returned by a previous [`crc32`]/[`crc32_update`]
/// call, so `crc32_update(crc32(a), b) == crc32(a ++ b)`.
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    let mut c = crc ^ 0xFFFF_FFFF;
    for &b in data {
        c = CRC32_TABLE[((c ^ u32::from(b)) & 0xFF) as usize] ^ (c >> 8);
    }
    c ^ 0xFFFF_FFFF
}

/// CRC-16/CCITT, seed `0xFFFF`, no final XOR.
///
/// Used by the Qualcomm Diag HDLC framing.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    crc16_ccitt_update(0xFFFF, data)
}

/// Streaming CRC-16/CCITT update.
pub fn crc16_ccitt_update(crc: u16, data: &[u8]) -> u16 {
    let mut c = crc;
    for &b in data {
        c = (c << 8) ^ CCITT_TABLE[(((c >> 8) ^ u16::from(b)) & 0xFF) as usize];
    }
    c
}

/// Spreadtrum 16-bit sum checksum.
///
/// Bytes pair up into little-endian 16-bit words accumulated in 32 bits,
/// a trailing odd byte is added on its own, carries fold back into the low
/// 16 bits and the result is inverted.
pub fn sprd_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut pairs = data.chunks_exact(2);
    for pair in &mut pairs {
        sum += u32::from(u16::from_le_bytes([pair[0], pair[1]]));
    }
    if let [last] = pairs.remainder() {
        sum += u32::from(*last);
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// MTK checksum: 16-bit sum of all bytes modulo 2^16.
///
/// The BROM computes this over a DA payload and sends it back after the
/// upload; the host compares against its own value.
pub fn mtk_checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(CHECK), 0xCBF43926);
    }

    #[test]
    fn test_crc32_streaming_matches_oneshot() {
        let partial = crc32(&CHECK[..4]);
        assert_eq!(crc32_update(partial, &CHECK[4..]), crc32(CHECK));
    }

    #[test]
    fn test_crc16_ccitt_check_value() {
        assert_eq!(crc16_ccitt(CHECK), 0x29B1);
    }

    #[test]
    fn test_crc16_ccitt_empty_is_seed() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn test_sprd_checksum_pinned_values() {
        assert_eq!(sprd_checksum(&[]), 0xFFFF);
        assert_eq!(sprd_checksum(&[0x01]), 0xFFFE);
        assert_eq!(sprd_checksum(&[0x01, 0x02]), !0x0201u16);
        // Carry folding: 0xFFFF + 0xFFFF = 0x1FFFE -> 0xFFFF -> inverted 0
        assert_eq!(sprd_checksum(&[0xFF, 0xFF, 0xFF, 0xFF]), 0x0000);
    }

    #[test]
    fn test_mtk_checksum_wraps() {
        assert_eq!(mtk_checksum(&[0x01, 0x02, 0x03]), 6);
        assert_eq!(mtk_checksum(&[0xFF; 257]), (257u32 * 255 % 65536) as u16);
    }
}
