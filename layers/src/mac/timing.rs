//! Slot and Symbol Timing
//!
//! Ripple counter over symbol -> slot -> frame, plus the DL/UL symbol layout
//! of the configured duplex mode (TS 38.211 4.3, TS 38.213 11.1).

use common::types::{
    DuplexMode, LinkDirection, SubcarrierSpacing, SymbolType, SFN_MODULUS, SYMBOLS_PER_SLOT,
};
use serde::{Deserialize, Serialize};

/// Frame/slot pair identifying a slot on air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPosition {
    /// System frame number (0-1023)
    pub frame: u16,
    /// Slot within the frame
    pub slot: u16,
}

/// Cell timing state
#[derive(Debug, Clone)]
pub struct TimingEngine {
    scs: SubcarrierSpacing,
    duplex: DuplexMode,
    slots_per_frame: u16,
    symbol: u8,
    slot: u16,
    frame: u16,
    /// Slots elapsed since start, never wraps
    absolute_slot: u64,
}

impl TimingEngine {
    pub fn new(scs: SubcarrierSpacing, duplex: DuplexMode) -> Self {
        Self {
            scs,
            duplex,
            slots_per_frame: scs.slots_per_frame(),
            symbol: 0,
            slot: 0,
            frame: 0,
            absolute_slot: 0,
        }
    }

    /// Advance by `num_symbols` (1 for symbol ticks, 14 for slot ticks)
    pub fn advance(&mut self, num_symbols: u32) {
        for _ in 0..num_symbols {
            self.symbol += 1;
            if self.symbol >= SYMBOLS_PER_SLOT {
                self.symbol = 0;
                self.slot += 1;
                self.absolute_slot += 1;
                if self.slot >= self.slots_per_frame {
                    self.slot = 0;
                    self.frame = (self.frame + 1) % SFN_MODULUS;
                }
            }
        }
    }

    pub fn symbol(&self) -> u8 {
        self.symbol
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn frame(&self) -> u16 {
        self.frame
    }

    pub fn absolute_slot(&self) -> u64 {
        self.absolute_slot
    }

    pub fn scs(&self) -> SubcarrierSpacing {
        self.scs
    }

    pub fn slots_per_frame(&self) -> u16 {
        self.slots_per_frame
    }

    /// Number of symbols in one 10 ms frame
    pub fn symbols_per_frame(&self) -> usize {
        self.slots_per_frame as usize * SYMBOLS_PER_SLOT as usize
    }

    /// Current symbol counted from the start of the frame
    pub fn symbol_in_frame(&self) -> usize {
        self.slot as usize * SYMBOLS_PER_SLOT as usize + self.symbol as usize
    }

    pub fn is_slot_boundary(&self) -> bool {
        self.symbol == 0
    }

    /// Symbol type of the current symbol
    pub fn symbol_type(&self) -> SymbolType {
        self.duplex.symbol_type(self.slot, self.symbol)
    }

    pub fn symbol_type_at(&self, slot: u16, symbol: u8) -> SymbolType {
        self.duplex.symbol_type(slot, symbol)
    }

    /// Frame/slot of an absolute slot count
    pub fn position_of(&self, absolute_slot: u64) -> SlotPosition {
        let spf = self.slots_per_frame as u64;
        SlotPosition {
            frame: ((absolute_slot / spf) % SFN_MODULUS as u64) as u16,
            slot: (absolute_slot % spf) as u16,
        }
    }

    /// Symbol-in-frame index of `symbol` within an absolute slot
    pub fn symbol_index(&self, absolute_slot: u64, symbol: u8) -> usize {
        let slot = (absolute_slot % self.slots_per_frame as u64) as usize;
        slot * SYMBOLS_PER_SLOT as usize + symbol as usize
    }

    /// First contiguous run of symbols usable by `direction` in a frame slot,
    /// as (start symbol, length)
    pub fn direction_symbols(&self, slot: u16, direction: LinkDirection) -> Option<(u8, u8)> {
        let start = (0..SYMBOLS_PER_SLOT)
            .find(|&s| self.symbol_type_at(slot, s).allows(direction))?;
        let len = (start..SYMBOLS_PER_SLOT)
            .take_while(|&s| self.symbol_type_at(slot, s).allows(direction))
            .count() as u8;
        Some((start, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::TddPattern;

    fn tdd_engine() -> TimingEngine {
        TimingEngine::new(
            SubcarrierSpacing::Scs30,
            DuplexMode::Tdd(TddPattern {
                periodicity_slots: 5,
                num_dl_slots: 3,
                num_dl_symbols: 10,
                num_ul_symbols: 2,
                num_ul_slots: 1,
            }),
        )
    }

    #[test]
    fn test_ripple_rollover() {
        let mut timing = TimingEngine::new(SubcarrierSpacing::Scs15, DuplexMode::Fdd);
        timing.advance(13);
        assert_eq!((timing.frame(), timing.slot(), timing.symbol()), (0, 0, 13));
        assert!(!timing.is_slot_boundary());

        timing.advance(1);
        assert_eq!((timing.frame(), timing.slot(), timing.symbol()), (0, 1, 0));
        assert!(timing.is_slot_boundary());

        timing.advance(14 * 9);
        assert_eq!((timing.frame(), timing.slot(), timing.symbol()), (1, 0, 0));
        assert_eq!(timing.absolute_slot(), 10);
    }

    #[test]
    fn test_sfn_wraps() {
        let mut timing = TimingEngine::new(SubcarrierSpacing::Scs15, DuplexMode::Fdd);
        timing.advance(14 * 10 * 1024);
        assert_eq!(timing.frame(), 0);
        assert_eq!(timing.absolute_slot(), 10 * 1024);

        let pos = timing.position_of(10 * 1025 + 3);
        assert_eq!(pos, SlotPosition { frame: 1, slot: 3 });
    }

    #[test]
    fn test_symbol_in_frame() {
        let mut timing = TimingEngine::new(SubcarrierSpacing::Scs30, DuplexMode::Fdd);
        timing.advance(14 * 3 + 5);
        assert_eq!(timing.symbol_in_frame(), 47);
        assert_eq!(timing.symbols_per_frame(), 280);
        assert_eq!(timing.symbol_index(23, 2), 3 * 14 + 2);
    }

    #[test]
    fn test_fdd_every_symbol_both_directions() {
        let timing = TimingEngine::new(SubcarrierSpacing::Scs15, DuplexMode::Fdd);
        assert_eq!(timing.symbol_type(), SymbolType::Flexible);
        assert_eq!(timing.direction_symbols(4, LinkDirection::Uplink), Some((0, 14)));
        assert_eq!(timing.direction_symbols(4, LinkDirection::Downlink), Some((0, 14)));
    }

    #[test]
    fn test_tdd_direction_ranges() {
        let timing = tdd_engine();
        assert_eq!(timing.direction_symbols(0, LinkDirection::Downlink), Some((0, 14)));
        assert_eq!(timing.direction_symbols(0, LinkDirection::Uplink), None);
        assert_eq!(timing.direction_symbols(3, LinkDirection::Downlink), Some((0, 10)));
        assert_eq!(timing.direction_symbols(3, LinkDirection::Uplink), Some((12, 2)));
        assert_eq!(timing.direction_symbols(4, LinkDirection::Uplink), Some((0, 14)));
        assert_eq!(timing.direction_symbols(9, LinkDirection::Downlink), None);
    }

    #[test]
    fn test_tdd_symbol_type_follows_clock() {
        let mut timing = tdd_engine();
        timing.advance(14 * 3 + 11);
        assert_eq!(timing.symbol_type(), SymbolType::Guard);
        timing.advance(1);
        assert_eq!(timing.symbol_type(), SymbolType::Uplink);
    }
}
