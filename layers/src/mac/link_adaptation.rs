//! Link Adaptation
//!
//! Per-UE, per-resource-block channel quality and the CQI -> MCS -> TBS chain
//! of TS 38.214 (Tables 5.2.2.1-2, 5.1.3.1-1 and clause 5.1.3.2).

use crate::LayerError;
use common::types::{LinkDirection, Rnti, SUBCARRIERS_PER_RB};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Highest CQI index
pub const MAX_CQI: u8 = 15;

/// Highest MCS index of the 64QAM table
pub const MAX_MCS: u8 = 28;

/// REs per PRB available for data are capped at this value
const MAX_RE_PER_PRB: u32 = 156;

/// Largest TBS (bits) quantised through Table 5.1.3.2-1
const TBS_TABLE_LIMIT: f64 = 3824.0;

/// Modulation scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modulation {
    Qpsk,
    Qam16,
    Qam64,
}

impl Modulation {
    /// Modulation order Qm
    pub fn bits_per_symbol(&self) -> u8 {
        match self {
            Modulation::Qpsk => 2,
            Modulation::Qam16 => 4,
            Modulation::Qam64 => 6,
        }
    }

    /// Name handed to the PHY
    pub fn as_str(&self) -> &'static str {
        match self {
            Modulation::Qpsk => "QPSK",
            Modulation::Qam16 => "16QAM",
            Modulation::Qam64 => "64QAM",
        }
    }
}

/// One row of the MCS table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct McsInfo {
    pub index: u8,
    pub modulation: Modulation,
    /// Target code rate R (x/1024 in the table)
    pub code_rate: f64,
    /// Spectral efficiency, bits per RE
    pub efficiency: f64,
}

/// TS 38.214 Table 5.2.2.1-2: (modulation, code rate x 1024, efficiency); CQI 0 is out of range
const CQI_TABLE: [(Modulation, u16, f64); 16] = [
    (Modulation::Qpsk, 0, 0.0),
    (Modulation::Qpsk, 78, 0.1523),
    (Modulation::Qpsk, 120, 0.2344),
    (Modulation::Qpsk, 193, 0.3770),
    (Modulation::Qpsk, 308, 0.6016),
    (Modulation::Qpsk, 449, 0.8770),
    (Modulation::Qpsk, 602, 1.1758),
    (Modulation::Qam16, 378, 1.4766),
    (Modulation::Qam16, 490, 1.9141),
    (Modulation::Qam16, 616, 2.4063),
    (Modulation::Qam64, 466, 2.7305),
    (Modulation::Qam64, 567, 3.3223),
    (Modulation::Qam64, 666, 3.9023),
    (Modulation::Qam64, 772, 4.5234),
    (Modulation::Qam64, 873, 5.1152),
    (Modulation::Qam64, 948, 5.5547),
];

/// TS 38.214 Table 5.1.3.1-1: (modulation, code rate x 1024, efficiency)
const MCS_TABLE: [(Modulation, u16, f64); 29] = [
    (Modulation::Qpsk, 120, 0.2344),
    (Modulation::Qpsk, 157, 0.3066),
    (Modulation::Qpsk, 193, 0.3770),
    (Modulation::Qpsk, 251, 0.4902),
    (Modulation::Qpsk, 308, 0.6016),
    (Modulation::Qpsk, 379, 0.7402),
    (Modulation::Qpsk, 449, 0.8770),
    (Modulation::Qpsk, 526, 1.0273),
    (Modulation::Qpsk, 602, 1.1758),
    (Modulation::Qpsk, 679, 1.3262),
    (Modulation::Qam16, 340, 1.3281),
    (Modulation::Qam16, 378, 1.4766),
    (Modulation::Qam16, 434, 1.6953),
    (Modulation::Qam16, 490, 1.9141),
    (Modulation::Qam16, 553, 2.1602),
    (Modulation::Qam16, 616, 2.4063),
    (Modulation::Qam16, 658, 2.5703),
    (Modulation::Qam64, 438, 2.5664),
    (Modulation::Qam64, 466, 2.7305),
    (Modulation::Qam64, 517, 3.0293),
    (Modulation::Qam64, 567, 3.3223),
    (Modulation::Qam64, 616, 3.6094),
    (Modulation::Qam64, 666, 3.9023),
    (Modulation::Qam64, 719, 4.2129),
    (Modulation::Qam64, 772, 4.5234),
    (Modulation::Qam64, 822, 4.8164),
    (Modulation::Qam64, 873, 5.1152),
    (Modulation::Qam64, 910, 5.3320),
    (Modulation::Qam64, 948, 5.5547),
];

/// TS 38.214 Table 5.1.3.2-1: TBS for N_info <= 3824
const TBS_TABLE: [u32; 93] = [
    24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 136, 144, 152, 160, 168, 176,
    184, 192, 208, 224, 240, 256, 272, 288, 304, 320, 336, 352, 368, 384, 408, 432, 456, 480,
    504, 528, 552, 576, 608, 640, 672, 704, 736, 768, 808, 848, 888, 928, 984, 1032, 1064, 1128,
    1160, 1192, 1224, 1256, 1288, 1320, 1352, 1416, 1480, 1544, 1608, 1672, 1736, 1800, 1864,
    1928, 2024, 2088, 2152, 2216, 2280, 2408, 2472, 2536, 2600, 2664, 2728, 2792, 2856, 2976,
    3104, 3240, 3368, 3496, 3624, 3752, 3824,
];

fn mcs_row(index: usize) -> McsInfo {
    let (modulation, rate, efficiency) = MCS_TABLE[index];
    McsInfo {
        index: index as u8,
        modulation,
        code_rate: rate as f64 / 1024.0,
        efficiency,
    }
}

/// Row `index` of the MCS table
pub fn mcs_info(index: u8) -> Option<McsInfo> {
    if index <= MAX_MCS {
        Some(mcs_row(index as usize))
    } else {
        None
    }
}

/// Highest MCS whose spectral efficiency does not exceed that of `cqi`
pub fn mcs_for_cqi(cqi: u8) -> McsInfo {
    let target = CQI_TABLE[cqi.min(MAX_CQI) as usize].2;
    let index = MCS_TABLE
        .iter()
        .rposition(|&(_, _, eff)| eff <= target)
        .unwrap_or(0);
    mcs_row(index)
}

/// Floor of the mean of `values`; 0 for an empty slice
pub fn average_cqi(values: &[u8]) -> u8 {
    if values.is_empty() {
        return 0;
    }
    let sum: u32 = values.iter().map(|&v| v as u32).sum();
    (sum / values.len() as u32) as u8
}

/// MCS for a set of per-RB CQI values (floored average)
pub fn mcs_for(cqi_values: &[u8]) -> McsInfo {
    mcs_for_cqi(average_cqi(cqi_values))
}

/// Transport block size in bits, TS 38.214 clause 5.1.3.2
pub fn transport_block_size_bits(
    mcs: u8,
    num_rbs: u32,
    num_symbols: u8,
    num_dmrs_symbols: u8,
    num_layers: u8,
) -> u32 {
    let Some(info) = mcs_info(mcs) else {
        return 0;
    };

    let data_symbols = num_symbols.saturating_sub(num_dmrs_symbols) as u32;
    let re_per_prb = (SUBCARRIERS_PER_RB * data_symbols).min(MAX_RE_PER_PRB);
    let n_re = re_per_prb * num_rbs;

    let n_info = n_re as f64
        * info.code_rate
        * info.modulation.bits_per_symbol() as f64
        * num_layers as f64;
    if n_info <= 0.0 {
        return 0;
    }

    if n_info <= TBS_TABLE_LIMIT {
        let n = (n_info.log2().floor() as i32 - 6).max(3);
        let step = 2f64.powi(n);
        let n_info_q = (step * (n_info / step).floor()).max(24.0) as u32;
        return TBS_TABLE
            .iter()
            .copied()
            .find(|&tbs| tbs >= n_info_q)
            .unwrap_or(TBS_TABLE[TBS_TABLE.len() - 1]);
    }

    let n = (n_info - 24.0).log2().floor() as i32 - 5;
    let step = 2f64.powi(n);
    let n_info_q = (step * ((n_info - 24.0) / step).round()).max(3840.0);

    let with_crc = n_info_q + 24.0;
    if info.code_rate <= 0.25 {
        let c = (with_crc / 3816.0).ceil();
        (8.0 * c * (with_crc / (8.0 * c)).ceil() - 24.0) as u32
    } else if n_info_q > 8424.0 {
        let c = (with_crc / 8424.0).ceil();
        (8.0 * c * (with_crc / (8.0 * c)).ceil() - 24.0) as u32
    } else {
        (8.0 * (with_crc / 8.0).ceil() - 24.0) as u32
    }
}

/// Per-UE channel quality, one CQI per resource block and direction
#[derive(Debug, Clone)]
pub struct LinkAdaptationTable {
    /// [ue, rb]
    uplink: Array2<u8>,
    /// [ue, rb]
    downlink: Array2<u8>,
    num_dmrs_symbols: u8,
}

impl LinkAdaptationTable {
    pub fn new(num_ues: usize, num_rbs: usize, initial_cqi: u8, num_dmrs_symbols: u8) -> Self {
        let initial_cqi = initial_cqi.min(MAX_CQI);
        Self {
            uplink: Array2::from_elem((num_ues, num_rbs), initial_cqi),
            downlink: Array2::from_elem((num_ues, num_rbs), initial_cqi),
            num_dmrs_symbols,
        }
    }

    pub fn num_rbs(&self) -> usize {
        self.downlink.ncols()
    }

    fn table(&self, direction: LinkDirection) -> &Array2<u8> {
        match direction {
            LinkDirection::Uplink => &self.uplink,
            LinkDirection::Downlink => &self.downlink,
        }
    }

    /// Overwrite the CQI vector of one UE and direction
    pub fn update_quality(
        &mut self,
        rnti: Rnti,
        direction: LinkDirection,
        values: &[u8],
    ) -> Result<(), LayerError> {
        let num_rbs = self.num_rbs();
        if values.len() != num_rbs {
            return Err(LayerError::InvalidCqiReport(format!(
                "rnti={} reported {} values for {} RBs",
                rnti, values.len(), num_rbs
            )));
        }
        if let Some(bad) = values.iter().find(|&&v| v > MAX_CQI) {
            return Err(LayerError::InvalidCqiReport(format!(
                "rnti={} CQI {} out of range", rnti, bad
            )));
        }

        let table = match direction {
            LinkDirection::Uplink => &mut self.uplink,
            LinkDirection::Downlink => &mut self.downlink,
        };
        let ue = match rnti.ue_index() {
            Some(ue) if ue < table.nrows() => ue,
            _ => return Err(LayerError::UnknownUe(rnti)),
        };

        for (cell, &value) in table.row_mut(ue).iter_mut().zip(values) {
            *cell = value;
        }
        trace!("{} CQI updated for rnti={}: avg={}", direction, rnti, average_cqi(values));
        Ok(())
    }

    /// Full CQI vector of one UE
    pub fn cqi(&self, rnti: Rnti, direction: LinkDirection) -> Option<ArrayView1<'_, u8>> {
        let ue = rnti.ue_index()?;
        let table = self.table(direction);
        (ue < table.nrows()).then(|| table.row(ue))
    }

    /// Floored average CQI over RBs `[first_rb, first_rb + num_rbs)`
    pub fn average_cqi(&self, rnti: Rnti, direction: LinkDirection, first_rb: usize, num_rbs: usize) -> u8 {
        let values: Vec<u8> = self
            .cqi(rnti, direction)
            .map(|row| row.iter().skip(first_rb).take(num_rbs).copied().collect())
            .unwrap_or_default();
        average_cqi(&values)
    }

    /// Transport block size in whole bytes for this cell's DM-RS configuration
    pub fn transport_block_size(&self, mcs: u8, num_rbs: u32, num_symbols: u8, num_layers: u8) -> u32 {
        transport_block_size_bits(mcs, num_rbs, num_symbols, self.num_dmrs_symbols, num_layers) / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mcs_for_cqi() {
        assert_eq!(mcs_for_cqi(15).index, 28);
        assert_eq!(mcs_for_cqi(7).index, 11);
        assert_eq!(mcs_for_cqi(5).index, 6);
        // Below the lowest MCS efficiency
        assert_eq!(mcs_for_cqi(1).index, 0);
        assert_eq!(mcs_for_cqi(0).index, 0);

        let info = mcs_for_cqi(10);
        assert_eq!(info.modulation, Modulation::Qam64);
        assert_eq!(info.modulation.as_str(), "64QAM");
    }

    #[test]
    fn test_mcs_from_averaged_cqi() {
        // mean 7.5 floors to 7
        assert_eq!(mcs_for(&[7, 8]).index, mcs_for_cqi(7).index);
        assert_eq!(average_cqi(&[]), 0);
    }

    #[test]
    fn test_transport_block_size() {
        assert_eq!(transport_block_size_bits(0, 1, 14, 1, 1), 32);
        assert_eq!(transport_block_size_bits(10, 4, 14, 1, 1), 848);
        assert_eq!(transport_block_size_bits(6, 4, 14, 1, 1), 552);
        assert_eq!(transport_block_size_bits(5, 25, 14, 1, 1), 2976);
        assert_eq!(transport_block_size_bits(17, 8, 10, 1, 1), 2216);
        assert_eq!(transport_block_size_bits(28, 100, 14, 1, 1), 86040);
        assert_eq!(transport_block_size_bits(28, 273, 14, 1, 1), 237776);
    }

    #[test]
    fn test_transport_block_size_edge_cases() {
        // Only DM-RS symbols left
        assert_eq!(transport_block_size_bits(0, 1, 1, 1, 1), 0);
        assert_eq!(transport_block_size_bits(28, 0, 14, 1, 1), 0);
        assert_eq!(transport_block_size_bits(29, 10, 14, 1, 1), 0);
    }

    #[test]
    fn test_tbs_bytes_irregular_rbg() {
        let table = LinkAdaptationTable::new(1, 106, 7, 1);
        // 2 RBs in the last RBG of 106 RBs with RBG size 8
        let full = table.transport_block_size(10, 8, 14, 1);
        let tail = table.transport_block_size(10, 2, 14, 1);
        assert!(tail < full);
        assert_eq!(table.transport_block_size(10, 4, 14, 1), 106);
    }

    #[test]
    fn test_update_quality() {
        let mut table = LinkAdaptationTable::new(2, 4, 7, 1);
        table.update_quality(Rnti(2), LinkDirection::Downlink, &[15, 15, 3, 3]).unwrap();

        assert_eq!(table.cqi(Rnti(2), LinkDirection::Downlink).unwrap().to_vec(), vec![15, 15, 3, 3]);
        assert_eq!(table.cqi(Rnti(2), LinkDirection::Uplink).unwrap().to_vec(), vec![7; 4]);
        assert!(table.cqi(Rnti(0), LinkDirection::Uplink).is_none());
        assert!(table.cqi(Rnti(3), LinkDirection::Uplink).is_none());
        assert_eq!(table.average_cqi(Rnti(2), LinkDirection::Downlink, 0, 2), 15);
        assert_eq!(table.average_cqi(Rnti(2), LinkDirection::Downlink, 1, 2), 9);
        // Range clipped at the carrier edge
        assert_eq!(table.average_cqi(Rnti(2), LinkDirection::Downlink, 2, 8), 3);

        assert!(table.update_quality(Rnti(1), LinkDirection::Uplink, &[1, 2]).is_err());
        assert!(table.update_quality(Rnti(1), LinkDirection::Uplink, &[1, 2, 3, 16]).is_err());
        assert!(matches!(
            table.update_quality(Rnti(3), LinkDirection::Uplink, &[1, 2, 3, 4]),
            Err(LayerError::UnknownUe(_))
        ));
    }
}
