//! JPEG quality estimation and the cache quality-adjustment heuristic.

use bytes::Bytes;
use img_parts::jpeg::Jpeg;

use pictor_core::constants::MIN_CACHE_QUALITY;

const DQT_MARKER: u8 = 0xDB;

/// IJG reference luminance table (natural order; only the sum matters here).
const STD_LUMINANCE_TABLE: [u16; 64] = [
    16, 11, 10, 16, 24, 40, 51, 61, 12, 12, 14, 19, 26, 58, 60, 55, 14, 13, 16, 24, 40, 57, 69,
    56, 14, 17, 22, 29, 51, 87, 80, 62, 18, 22, 37, 56, 68, 109, 103, 77, 24, 35, 55, 64, 81, 104,
    113, 92, 49, 64, 78, 87, 103, 121, 120, 101, 72, 92, 95, 98, 112, 100, 103, 99,
];

/// Estimate the IJG quality setting a JPEG was encoded with.
///
/// Compares the sum of the luminance quantization table against the reference
/// table and inverts the IJG scaling. Returns `None` for anything that is not
/// a JPEG with a luminance table.
pub fn estimate_jpeg_quality(data: &[u8]) -> Option<u8> {
    let jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(data)).ok()?;
    let table_sum = jpeg
        .segments()
        .iter()
        .filter(|segment| segment.marker() == DQT_MARKER)
        .find_map(|segment| luminance_table_sum(segment.contents()))?;

    let reference_sum: u64 = STD_LUMINANCE_TABLE.iter().map(|&v| u64::from(v)).sum();
    let scale = (table_sum * 100 + reference_sum / 2) / reference_sum;
    let quality = if scale <= 100 {
        (200u64.saturating_sub(scale) + 1) / 2
    } else {
        (5000 + scale / 2) / scale
    };

    u8::try_from(quality.clamp(1, 100)).ok()
}

/// Sum of table 0 in a DQT payload. A payload may carry several tables, each
/// prefixed by a precision/id byte.
fn luminance_table_sum(contents: &[u8]) -> Option<u64> {
    let mut rest = contents;
    while let Some((&header, body)) = rest.split_first() {
        let precision = header >> 4;
        let table_id = header & 0x0F;
        let len = if precision == 0 { 64 } else { 128 };
        if body.len() < len {
            return None;
        }
        let (table, tail) = body.split_at(len);
        if table_id == 0 {
            let sum = if precision == 0 {
                table.iter().map(|&v| u64::from(v)).sum()
            } else {
                table
                    .chunks_exact(2)
                    .map(|pair| u64::from(u16::from_be_bytes([pair[0], pair[1]])))
                    .sum()
            };
            return Some(sum);
        }
        rest = tail;
    }
    None
}

/// Target quality for a cache artifact.
///
/// When the source is already at or below the requested quality, scale the
/// target down proportionally (`source * requested / 100`), bounded below by
/// [`MIN_CACHE_QUALITY`] and above by `requested`. Otherwise, or when the
/// source quality is unknown, keep `requested`.
pub fn adjust_cache_quality(source_quality: Option<u8>, requested: u8) -> u8 {
    match source_quality {
        Some(source) if source <= requested => {
            let scaled = (u32::from(source) * u32::from(requested) + 50) / 100;
            let floor = MIN_CACHE_QUALITY.min(requested);
            u8::try_from(scaled).unwrap_or(requested).clamp(floor, requested)
        }
        _ => requested,
    }
}
