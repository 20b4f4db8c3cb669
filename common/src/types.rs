//! Common Types for the 5G MAC Scheduler
//!
//! Defines fundamental types used throughout the protocol stack

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};

/// OFDM symbols per slot (normal cyclic prefix)
pub const SYMBOLS_PER_SLOT: u8 = 14;

/// Subcarriers per resource block
pub const SUBCARRIERS_PER_RB: u32 = 12;

/// System frame number wraps at this value
pub const SFN_MODULUS: u16 = 1024;

/// Maximum number of resource blocks in a carrier (FR1)
pub const MAX_RESOURCE_BLOCKS: u16 = 275;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Largest value usable as a C-RNTI (0xFFF0..=0xFFFF are reserved)
    pub const MAX_C_RNTI: u16 = 0xFFEF;

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Whether this value lies in the C-RNTI range (1..=0xFFEF)
    pub fn is_c_rnti(&self) -> bool {
        self.0 >= 1 && self.0 <= Self::MAX_C_RNTI
    }

    /// RNTIs are assigned sequentially from 1, so the UE index is `rnti - 1`.
    /// `None` outside the C-RNTI range.
    pub fn ue_index(&self) -> Option<usize> {
        if self.is_c_rnti() {
            Some(self.0 as usize - 1)
        } else {
            None
        }
    }

    /// RNTI assigned to the UE at `index`
    pub fn from_ue_index(index: usize) -> Self {
        Self(index as u16 + 1)
    }
}

impl std::fmt::Display for Rnti {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

impl CellId {
    /// Maximum valid cell identity (0-1007, same range as the PCI)
    pub const MAX: u16 = 1007;

    /// Create a new cell identity with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Spacing in kHz
    pub fn khz(&self) -> u32 {
        *self as u32
    }

    /// Number of slots per 1 ms subframe
    pub fn slots_per_subframe(&self) -> u16 {
        match self {
            SubcarrierSpacing::Scs15 => 1,
            SubcarrierSpacing::Scs30 => 2,
            SubcarrierSpacing::Scs60 => 4,
            SubcarrierSpacing::Scs120 => 8,
            SubcarrierSpacing::Scs240 => 16,
        }
    }

    /// Number of slots per 10 ms frame
    pub fn slots_per_frame(&self) -> u16 {
        self.slots_per_subframe() * 10
    }

    /// Number of symbols per 10 ms frame
    pub fn symbols_per_frame(&self) -> usize {
        self.slots_per_frame() as usize * SYMBOLS_PER_SLOT as usize
    }

    /// Slot duration in milliseconds
    pub fn slot_duration_ms(&self) -> f64 {
        1.0 / self.slots_per_subframe() as f64
    }
}

/// Link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkDirection {
    /// UE to gNB
    Uplink,
    /// gNB to UE
    Downlink,
}

impl LinkDirection {
    /// Both directions, in scheduling order (uplink is always scheduled first)
    pub const ALL: [LinkDirection; 2] = [LinkDirection::Uplink, LinkDirection::Downlink];

    /// Array index for per-direction tables
    pub fn index(&self) -> usize {
        match self {
            LinkDirection::Uplink => 0,
            LinkDirection::Downlink => 1,
        }
    }
}

impl std::fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkDirection::Uplink => write!(f, "UL"),
            LinkDirection::Downlink => write!(f, "DL"),
        }
    }
}

/// Symbol type in a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolType {
    /// Downlink symbol
    Downlink,
    /// Uplink symbol
    Uplink,
    /// Usable in both directions (FDD: paired spectrum)
    Flexible,
    /// Guard period
    Guard,
}

impl SymbolType {
    /// Whether a transmission in `direction` may use this symbol
    pub fn allows(&self, direction: LinkDirection) -> bool {
        match (self, direction) {
            (SymbolType::Flexible, _) => true,
            (SymbolType::Downlink, LinkDirection::Downlink) => true,
            (SymbolType::Uplink, LinkDirection::Uplink) => true,
            _ => false,
        }
    }
}

/// TDD DL/UL pattern, repeated every `periodicity_slots`
///
/// Layout within one period: `num_dl_slots` full DL slots, one special slot
/// (`num_dl_symbols` DL, guard, `num_ul_symbols` UL), guard-only slots, and
/// `num_ul_slots` full UL slots at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TddPattern {
    pub periodicity_slots: u16,
    pub num_dl_slots: u16,
    pub num_dl_symbols: u8,
    pub num_ul_symbols: u8,
    pub num_ul_slots: u16,
}

impl TddPattern {
    /// Check the pattern fits into its period and the period tiles a frame
    pub fn is_valid(&self, slots_per_frame: u16) -> bool {
        self.periodicity_slots > 0
            && slots_per_frame % self.periodicity_slots == 0
            && self.num_dl_slots + self.num_ul_slots < self.periodicity_slots
            && self.num_dl_symbols as u16 + self.num_ul_symbols as u16 <= SYMBOLS_PER_SLOT as u16
    }

    /// Symbol type at `symbol` of frame slot `slot`
    pub fn symbol_type(&self, slot: u16, symbol: u8) -> SymbolType {
        let slot_in_period = slot % self.periodicity_slots;
        let first_ul_slot = self.periodicity_slots - self.num_ul_slots;

        if slot_in_period < self.num_dl_slots {
            SymbolType::Downlink
        } else if slot_in_period >= first_ul_slot {
            SymbolType::Uplink
        } else if slot_in_period == self.num_dl_slots {
            if symbol < self.num_dl_symbols {
                SymbolType::Downlink
            } else if symbol >= SYMBOLS_PER_SLOT - self.num_ul_symbols {
                SymbolType::Uplink
            } else {
                SymbolType::Guard
            }
        } else {
            SymbolType::Guard
        }
    }
}

/// Duplex mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplexMode {
    /// Frequency Division Duplex
    Fdd,
    /// Time Division Duplex
    Tdd(TddPattern),
}

impl DuplexMode {
    /// Symbol type at `symbol` of frame slot `slot`
    pub fn symbol_type(&self, slot: u16, symbol: u8) -> SymbolType {
        match self {
            DuplexMode::Fdd => SymbolType::Flexible,
            DuplexMode::Tdd(pattern) => pattern.symbol_type(slot, symbol),
        }
    }
}
