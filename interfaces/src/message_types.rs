//! Message Types for gNB-UE Control Signaling
//!
//! Control signaling is modeled out-of-band: grants, buffer status reports,
//! CQI reports and PDSCH HARQ feedback are delivered without radio resource cost.

use bytes::Bytes;
use common::types::{LinkDirection, Rnti};
use common::utils::{pack_bits, unpack_bits};
use serde::{Deserialize, Serialize};

use crate::InterfaceError;

/// Resource block group allocation, one bit per RBG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbgBitmap {
    bits: Vec<bool>,
}

impl RbgBitmap {
    /// Empty bitmap covering `num_rbgs` groups
    pub fn new(num_rbgs: usize) -> Self {
        Self { bits: vec![false; num_rbgs] }
    }

    /// Bitmap with the given RBG indices set
    pub fn from_indices(num_rbgs: usize, indices: &[usize]) -> Self {
        let mut bitmap = Self::new(num_rbgs);
        for &index in indices {
            bitmap.set(index);
        }
        bitmap
    }

    /// Number of RBGs the bitmap spans
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Mark an RBG as allocated; out-of-range indices are ignored
    pub fn set(&mut self, index: usize) {
        if let Some(bit) = self.bits.get_mut(index) {
            *bit = true;
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Number of allocated RBGs
    pub fn count_ones(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Indices of allocated RBGs, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| if b { Some(i) } else { None })
    }

    /// True when no RBG is allocated in both bitmaps
    pub fn is_disjoint(&self, other: &RbgBitmap) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .all(|(&a, &b)| !(a && b))
    }

    /// MSB-first packed form as carried in a DCI frequency-domain field
    pub fn to_bytes(&self) -> Bytes {
        pack_bits(&self.bits)
    }

    /// Unpack a `num_rbgs` wide bitmap from its packed form
    pub fn from_bytes(num_rbgs: usize, data: &[u8]) -> Result<Self, InterfaceError> {
        if data.len() * 8 < num_rbgs {
            return Err(InterfaceError::InvalidMessage);
        }
        let mut bits = unpack_bits(data);
        bits.truncate(num_rbgs);
        Ok(Self { bits })
    }
}

/// Resource assignment for one UE in one direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Target UE
    pub rnti: Rnti,
    /// Link direction
    pub direction: LinkDirection,
    /// Frequency-domain allocation
    pub rbg_allocation: RbgBitmap,
    /// First symbol of the transmission within the slot
    pub start_symbol: u8,
    /// Number of symbols
    pub num_symbols: u8,
    /// Slots from the scheduling slot to the transmission slot
    pub slot_offset: u16,
    /// MCS index
    pub mcs: u8,
    /// New data indicator
    pub ndi: bool,
    /// Redundancy version
    pub rv: u8,
    /// HARQ process ID
    pub harq_id: u8,
    /// Slots from the PDSCH slot to its HARQ feedback (downlink only)
    pub feedback_slot_offset: Option<u8>,
}

/// Buffer status report variants (TS 38.321 6.1.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BsrFormat {
    Short,
    ShortTruncated,
    Long,
    LongTruncated,
}

/// Buffer status report as sent by a UE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStatusReport {
    pub rnti: Rnti,
    pub format: BsrFormat,
    /// Encoded MAC CE body
    pub payload: Vec<u8>,
}

/// Channel quality report, one CQI per resource block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqiReport {
    pub rnti: Rnti,
    pub direction: LinkDirection,
    pub cqi: Vec<u8>,
}

/// PDSCH HARQ feedback, indexed by HARQ process ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdschFeedback {
    pub rnti: Rnti,
    /// `Some(true)` = ACK, `Some(false)` = NACK, `None` = not reported
    acks: Vec<Option<bool>>,
}

impl PdschFeedback {
    pub fn new(rnti: Rnti, num_harq_processes: usize) -> Self {
        Self {
            rnti,
            acks: vec![None; num_harq_processes],
        }
    }

    /// Record an ACK/NACK for `harq_id`; ignored if out of range
    pub fn set(&mut self, harq_id: u8, ack: bool) {
        if let Some(slot) = self.acks.get_mut(harq_id as usize) {
            *slot = Some(ack);
        }
    }

    pub fn get(&self, harq_id: u8) -> Option<bool> {
        self.acks.get(harq_id as usize).copied().flatten()
    }

    /// Reported (harq_id, ack) pairs
    pub fn iter(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        self.acks
            .iter()
            .enumerate()
            .filter_map(|(id, ack)| ack.map(|a| (id as u8, a)))
    }

    pub fn is_empty(&self) -> bool {
        self.acks.iter().all(Option::is_none)
    }
}

/// Out-of-band control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    BufferStatus(BufferStatusReport),
    Cqi(CqiReport),
    PdschFeedback(PdschFeedback),
    UplinkGrant(Grant),
    DownlinkGrant(Grant),
}

impl ControlMessage {
    /// Wrap a grant in the message variant matching its direction
    pub fn from_grant(grant: Grant) -> Self {
        match grant.direction {
            LinkDirection::Uplink => ControlMessage::UplinkGrant(grant),
            LinkDirection::Downlink => ControlMessage::DownlinkGrant(grant),
        }
    }

    /// UE the message concerns
    pub fn rnti(&self) -> Rnti {
        match self {
            ControlMessage::BufferStatus(m) => m.rnti,
            ControlMessage::Cqi(m) => m.rnti,
            ControlMessage::PdschFeedback(m) => m.rnti,
            ControlMessage::UplinkGrant(g) | ControlMessage::DownlinkGrant(g) => g.rnti,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, InterfaceError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, InterfaceError> {
        Ok(bincode::deserialize(data)?)
    }
}
