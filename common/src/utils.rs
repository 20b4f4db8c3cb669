//! Common Utilities
//!
//! Provides utility functions used across the scheduler workspace

use bytes::{Bytes, BytesMut, BufMut};
use tracing::trace;

use crate::types::{SubcarrierSpacing, SYMBOLS_PER_SLOT};

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pack bits into bytes (MSB first)
pub fn pack_bits(bits: &[bool]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);

    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }

    bytes.freeze()
}

/// Unpack bytes into bits (MSB first)
pub fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);

    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte & (1 << (7 - i))) != 0);
        }
    }

    bits
}

/// Time utilities for slot/frame calculations
pub mod time {
    use super::*;

    /// Slot duration in microseconds
    pub fn slot_duration_us(scs: SubcarrierSpacing) -> u32 {
        match scs {
            SubcarrierSpacing::Scs15 => 1000,
            SubcarrierSpacing::Scs30 => 500,
            SubcarrierSpacing::Scs60 => 250,
            SubcarrierSpacing::Scs120 => 125,
            SubcarrierSpacing::Scs240 => 62, // 62.5 us
        }
    }

    /// Duration of a `num_symbols` long transmission in milliseconds
    pub fn tti_duration_ms(scs: SubcarrierSpacing, num_symbols: u8) -> f64 {
        scs.slot_duration_ms() * num_symbols as f64 / SYMBOLS_PER_SLOT as f64
    }

    /// Whole slots needed to cover `duration_us`, never less than `min_slots`
    pub fn slots_covering(scs: SubcarrierSpacing, duration_us: u32, min_slots: u16) -> u16 {
        let slot_us = slot_duration_us(scs).max(1);
        let slots = ((duration_us + slot_us - 1) / slot_us) as u16;
        trace!("{}us covers {} slots at {} kHz", duration_us, slots, scs.khz());
        slots.max(min_slots)
    }
}
