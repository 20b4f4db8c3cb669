//! Physical Layer (PHY) Interface
//!
//! The scheduler hands each transmission and reception to the PHY at the
//! first symbol of its grant. Waveform processing stays behind this trait.

use bytes::Bytes;
use common::types::Rnti;

use crate::LayerError;

/// Parameters shared by PDSCH and PUSCH requests
#[derive(Debug, Clone, PartialEq)]
pub struct SharedChannelParams {
    pub rnti: Rnti,
    pub harq_id: u8,
    pub rv: u8,
    pub ndi: bool,
    pub mcs: u8,
    /// "QPSK", "16QAM" or "64QAM"
    pub modulation: &'static str,
    /// Target code rate (fraction of 1)
    pub code_rate: f64,
    /// Transport block size in bytes
    pub tbs: u32,
    pub resource_blocks: Vec<u16>,
    pub frame: u16,
    pub slot: u16,
    pub start_symbol: u8,
    pub num_symbols: u8,
    pub num_layers: u8,
}

/// Downlink shared channel transmission
#[derive(Debug, Clone, PartialEq)]
pub struct PdschRequest {
    pub params: SharedChannelParams,
    /// MAC PDU, exactly `tbs` bytes
    pub payload: Bytes,
}

/// Uplink shared channel reception
#[derive(Debug, Clone, PartialEq)]
pub struct PuschRequest {
    pub params: SharedChannelParams,
}

/// Decoding result of a PUSCH reception
#[derive(Debug, Clone, PartialEq)]
pub struct PuschIndication {
    pub rnti: Rnti,
    pub harq_id: u8,
    pub crc_ok: bool,
    /// Decoded MAC PDU when the CRC passed
    pub payload: Option<Bytes>,
}

/// PHY as seen from the MAC
pub trait PhyInterface {
    /// Transmit a PDSCH now
    fn transmit(&mut self, request: PdschRequest) -> Result<(), LayerError>;

    /// Receive a PUSCH now; the outcome comes back as a [`PuschIndication`]
    fn request_reception(&mut self, request: PuschRequest) -> Result<(), LayerError>;
}
