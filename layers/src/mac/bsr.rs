//! Buffer Status Report Codec
//!
//! Short and long BSR MAC CE bodies (TS 38.321 6.1.3.1) and the buffer size
//! level tables (Tables 6.1.3.1-1 and 6.1.3.1-2).

use crate::LayerError;
use interfaces::message_types::BsrFormat;

/// Number of logical channel groups
pub const MAX_LCG: u8 = 8;

/// Short BSR overflow index (buffer at or beyond the top level)
pub const SHORT_BSR_OVERFLOW: u8 = 31;

/// Long BSR overflow index
pub const LONG_BSR_OVERFLOW: u8 = 254;

/// Long BSR reserved index
pub const LONG_BSR_RESERVED: u8 = 255;

/// Upper bound in bytes of each short BSR index below the overflow index
pub const SHORT_BSR_TABLE: [u32; 31] = [
    0, 10, 14, 20, 28, 38, 53, 74, 102, 142, 198, 276, 384, 535, 745, 1038, 1446, 2014, 2806,
    3909, 5446, 7587, 10570, 14726, 20516, 28581, 39818, 55474, 77284, 107669, 150000,
];

/// Upper bound in bytes of each long BSR index below the overflow index
pub const LONG_BSR_TABLE: [u32; 254] = [
    0, 10, 11, 12, 13, 14, 15, 16, 17, 18,
    19, 20, 22, 23, 25, 26, 28, 30, 32, 34,
    36, 38, 40, 43, 46, 49, 52, 55, 59, 62,
    66, 71, 75, 80, 85, 91, 97, 103, 110, 117,
    124, 132, 141, 150, 160, 170, 181, 193, 205, 218,
    233, 248, 264, 281, 299, 318, 339, 361, 384, 409,
    436, 464, 494, 526, 560, 597, 635, 677, 720, 767,
    817, 870, 926, 987, 1051, 1119, 1191, 1269, 1351, 1439,
    1532, 1631, 1737, 1850, 1970, 2098, 2234, 2379, 2533, 2698,
    2873, 3059, 3258, 3469, 3694, 3934, 4189, 4461, 4751, 5059,
    5387, 5737, 6109, 6506, 6928, 7378, 7857, 8367, 8910, 9488,
    10104, 10760, 11458, 12202, 12994, 13838, 14736, 15692, 16711, 17795,
    18951, 20181, 21491, 22885, 24371, 25953, 27638, 29431, 31342, 33376,
    35543, 37850, 40307, 42923, 45709, 48676, 51836, 55200, 58784, 62599,
    66663, 70990, 75598, 80505, 85730, 91295, 97221, 103532, 110252, 117409,
    125030, 133146, 141789, 150992, 160793, 171231, 182345, 194182, 206786, 220209,
    234503, 249725, 265935, 283197, 301579, 321155, 342002, 364202, 387842, 413018,
    439827, 468377, 498780, 531156, 565634, 602350, 641449, 683087, 727427, 774645,
    824928, 878475, 935498, 996222, 1060888, 1129752, 1203085, 1281179, 1364342, 1452903,
    1547213, 1647644, 1754595, 1868488, 1989774, 2118933, 2256475, 2402946, 2558924, 2725027,
    2901912, 3090279, 3290873, 3504487, 3731968, 3974215, 4232186, 4506902, 4799451, 5110989,
    5442750, 5796046, 6172275, 6572925, 6999582, 7453933, 7937777, 8453028, 9001725, 9586039,
    10208280, 10870913, 11576557, 12328006, 13128233, 13980403, 14887889, 15854280, 16883401, 17979324,
    19146385, 20389201, 21712690, 23122088, 24622972, 26221280, 27923336, 29735875, 31666069, 33721553,
    35910462, 38241455, 40723756, 43367187, 46182206, 49179951, 52372284, 55771835, 59392055, 63247269,
    67352729, 71724679, 76380419, 81338368,
];

/// Smallest index whose level covers `bytes`, or `overflow` past the top
/// level. Sizes equal to the top level already report overflow.
fn level_index(table: &[u32], bytes: u32, overflow: u8) -> u8 {
    let top = table[table.len() - 1];
    if bytes >= top {
        return overflow;
    }
    table.partition_point(|&level| level < bytes) as u8
}

/// Short BSR buffer size index for `bytes`
pub fn short_bsr_index(bytes: u32) -> u8 {
    level_index(&SHORT_BSR_TABLE, bytes, SHORT_BSR_OVERFLOW)
}

/// Long BSR buffer size index for `bytes`
pub fn long_bsr_index(bytes: u32) -> u8 {
    if bytes > LONG_BSR_TABLE[LONG_BSR_TABLE.len() - 1] {
        return LONG_BSR_OVERFLOW;
    }
    LONG_BSR_TABLE.partition_point(|&level| level < bytes) as u8
}

/// Buffer size a short BSR index stands for; the overflow index reports
/// the top level
pub fn short_bsr_bytes(index: u8) -> Result<u32, LayerError> {
    match index {
        SHORT_BSR_OVERFLOW => Ok(SHORT_BSR_TABLE[SHORT_BSR_TABLE.len() - 1]),
        i if (i as usize) < SHORT_BSR_TABLE.len() => Ok(SHORT_BSR_TABLE[i as usize]),
        i => Err(LayerError::InvalidBsr(format!("Short BSR index {} out of range", i))),
    }
}

/// Buffer size a long BSR index stands for
pub fn long_bsr_bytes(index: u8) -> Result<u32, LayerError> {
    match index {
        LONG_BSR_RESERVED => Err(LayerError::InvalidBsr("Reserved long BSR index 255".to_string())),
        LONG_BSR_OVERFLOW => Ok(LONG_BSR_TABLE[LONG_BSR_TABLE.len() - 1]),
        i => Ok(LONG_BSR_TABLE[i as usize]),
    }
}

/// Reported buffer of one logical channel group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LcgBuffer {
    pub lcg: u8,
    pub bytes: u32,
}

/// Short (or short truncated) BSR body: LCG ID in the top 3 bits
pub fn encode_short(lcg: u8, bytes: u32) -> Vec<u8> {
    vec![((lcg & 0x07) << 5) | short_bsr_index(bytes)]
}

/// Long BSR body: LCG bitmap followed by one index per reported group in
/// ascending LCG order
pub fn encode_long(buffers: &[LcgBuffer]) -> Vec<u8> {
    let mut sorted: Vec<LcgBuffer> = buffers
        .iter()
        .copied()
        .filter(|b| b.lcg < MAX_LCG)
        .collect();
    sorted.sort_by_key(|b| b.lcg);
    sorted.dedup_by_key(|b| b.lcg);

    let bitmap = sorted.iter().fold(0u8, |acc, b| acc | (1 << b.lcg));
    let mut body = Vec::with_capacity(1 + sorted.len());
    body.push(bitmap);
    body.extend(sorted.iter().map(|b| long_bsr_index(b.bytes)));
    body
}

/// Decode a BSR body into per-group buffer sizes
pub fn decode(format: BsrFormat, payload: &[u8]) -> Result<Vec<LcgBuffer>, LayerError> {
    match format {
        BsrFormat::Short | BsrFormat::ShortTruncated => {
            let &[byte] = payload else {
                return Err(LayerError::InvalidBsr(format!(
                    "Short BSR must be 1 byte, got {}",
                    payload.len()
                )));
            };
            Ok(vec![LcgBuffer {
                lcg: byte >> 5,
                bytes: short_bsr_bytes(byte & 0x1F)?,
            }])
        }
        BsrFormat::Long | BsrFormat::LongTruncated => {
            let (&bitmap, indices) = payload
                .split_first()
                .ok_or_else(|| LayerError::InvalidBsr("Empty long BSR".to_string()))?;
            let groups: Vec<u8> = (0..MAX_LCG).filter(|lcg| bitmap & (1 << lcg) != 0).collect();

            let complete = indices.len() == groups.len();
            let truncated_ok = format == BsrFormat::LongTruncated && indices.len() <= groups.len();
            if !complete && !truncated_ok {
                return Err(LayerError::InvalidBsr(format!(
                    "Long BSR reports {} groups but carries {} sizes",
                    groups.len(),
                    indices.len()
                )));
            }

            groups
                .into_iter()
                .zip(indices.iter())
                .map(|(lcg, &index)| {
                    Ok(LcgBuffer {
                        lcg,
                        bytes: long_bsr_bytes(index)?,
                    })
                })
                .collect()
        }
    }
}

/// Total buffered bytes across the reported groups
pub fn total_bytes(buffers: &[LcgBuffer]) -> u32 {
    buffers.iter().fold(0u32, |acc, b| acc.saturating_add(b.bytes))
}
