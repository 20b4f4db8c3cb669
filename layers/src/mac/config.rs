//! MAC Configuration
//!
//! Cell-level scheduler parameters, validated once at setup.

use crate::LayerError;
use common::types::{CellId, DuplexMode, LinkDirection, Rnti, SubcarrierSpacing, MAX_RESOURCE_BLOCKS, SYMBOLS_PER_SLOT};
use tracing::info;

use super::harq::MAX_HARQ_PROCESSES;
use super::link_adaptation::MAX_CQI;
use super::strategy::AllocationStrategy;

/// Largest PDSCH-to-feedback distance searched, in slots
pub const MAX_K1: u8 = 15;

/// RBG size selection (TS 38.214 Table 5.1.2.2.1-1 or explicit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RbgSizeConfig {
    Config1,
    Config2,
    /// Fixed RBG size in resource blocks
    Explicit(u16),
}

impl RbgSizeConfig {
    /// Nominal RBG size for a bandwidth part of `num_rbs`
    pub fn rbg_size(&self, num_rbs: u16) -> Result<u16, LayerError> {
        let size = match (self, num_rbs) {
            (RbgSizeConfig::Explicit(size), _) => *size,
            (_, 0) => 0,
            (RbgSizeConfig::Config1, 1..=36) => 2,
            (RbgSizeConfig::Config1, 37..=72) => 4,
            (RbgSizeConfig::Config1, 73..=144) => 8,
            (RbgSizeConfig::Config1, _) => 16,
            (RbgSizeConfig::Config2, 1..=36) => 4,
            (RbgSizeConfig::Config2, 37..=72) => 8,
            (RbgSizeConfig::Config2, _) => 16,
        };
        let size = match self {
            RbgSizeConfig::Explicit(_) => size,
            _ => size.min(num_rbs),
        };
        if size == 0 || size > num_rbs {
            return Err(LayerError::InvalidConfiguration(format!(
                "RBG size {} invalid for {} RBs",
                size, num_rbs
            )));
        }
        Ok(size)
    }
}

/// How far the clock moves per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickGranularity {
    Symbol,
    Slot,
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct MacConfig {
    pub cell_id: u16,
    pub num_ues: u16,
    pub num_rbs: u16,
    pub scs: SubcarrierSpacing,
    pub duplex: DuplexMode,
    pub num_harq_processes: u8,
    pub strategy: AllocationStrategy,
    /// Served-rate moving average weight
    pub served_rate_alpha: f64,
    /// Slots between scheduling runs; each run covers that many slots
    pub scheduling_periodicity: u16,
    /// Per-UE RB cap for new transmissions in one slot, UL
    pub ul_rb_limit: u16,
    /// Per-UE RB cap for new transmissions in one slot, DL
    pub dl_rb_limit: u16,
    pub rbg_size: RbgSizeConfig,
    /// Slots with fewer usable symbols carry no grants
    pub min_tti_symbols: u8,
    pub num_dmrs_symbols: u8,
    pub num_layers: u8,
    /// PUSCH preparation time in microseconds
    pub pusch_preparation_us: u32,
    /// Smallest PDSCH-to-feedback distance in slots
    pub min_feedback_slots: u8,
    pub initial_cqi: u8,
    /// Slots between scheduling and a DL transmission
    pub dl_lead_slots: u16,
    pub tick: TickGranularity,
    /// `None` retransmits until success
    pub max_harq_retransmissions: Option<u8>,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            cell_id: 1,
            num_ues: 4,
            num_rbs: 100,
            scs: SubcarrierSpacing::Scs15,
            duplex: DuplexMode::Fdd,
            num_harq_processes: MAX_HARQ_PROCESSES,
            strategy: AllocationStrategy::RoundRobin,
            served_rate_alpha: 0.5,
            scheduling_periodicity: 1,
            ul_rb_limit: 100,
            dl_rb_limit: 100,
            rbg_size: RbgSizeConfig::Config1,
            min_tti_symbols: 2,
            num_dmrs_symbols: 1,
            num_layers: 1,
            pusch_preparation_us: 200,
            min_feedback_slots: 1,
            initial_cqi: 7,
            dl_lead_slots: 0,
            tick: TickGranularity::Slot,
            max_harq_retransmissions: None,
        }
    }
}

impl MacConfig {
    /// Per-UE RB cap for `direction`
    pub fn rb_limit(&self, direction: LinkDirection) -> u16 {
        match direction {
            LinkDirection::Uplink => self.ul_rb_limit,
            LinkDirection::Downlink => self.dl_rb_limit,
        }
    }

    /// Check every parameter; the scheduler refuses to start otherwise
    pub fn validate(&self) -> Result<(), LayerError> {
        let invalid = |msg: String| Err(LayerError::InvalidConfiguration(msg));

        if CellId::new(self.cell_id).is_none() {
            return invalid(format!("Cell ID {} exceeds {}", self.cell_id, CellId::MAX));
        }
        if self.num_ues == 0 {
            return invalid("At least one UE is required".to_string());
        }
        if !Rnti(self.num_ues).is_c_rnti() {
            return invalid(format!("{} UEs exceed the C-RNTI range", self.num_ues));
        }
        if self.num_rbs == 0 || self.num_rbs > MAX_RESOURCE_BLOCKS {
            return invalid(format!("RB count {} outside 1..={}", self.num_rbs, MAX_RESOURCE_BLOCKS));
        }
        if self.num_harq_processes == 0 || self.num_harq_processes > MAX_HARQ_PROCESSES {
            return invalid(format!(
                "HARQ process count {} outside 1..={}",
                self.num_harq_processes, MAX_HARQ_PROCESSES
            ));
        }
        if !(0.0..=1.0).contains(&self.served_rate_alpha) {
            return invalid(format!("Moving average weight {} outside [0, 1]", self.served_rate_alpha));
        }
        if self.scheduling_periodicity == 0 {
            return invalid("Scheduling periodicity must be at least one slot".to_string());
        }
        for direction in LinkDirection::ALL {
            let limit = self.rb_limit(direction);
            if limit == 0 || limit > self.num_rbs {
                return invalid(format!("{} RB limit {} outside 1..={}", direction, limit, self.num_rbs));
            }
        }
        self.rbg_size.rbg_size(self.num_rbs)?;
        if let DuplexMode::Tdd(pattern) = self.duplex {
            if !pattern.is_valid(self.scs.slots_per_frame()) {
                return invalid(format!("TDD pattern {:?} does not tile the frame", pattern));
            }
            if pattern.num_ul_slots == 0 && pattern.num_ul_symbols == 0 {
                return invalid("TDD pattern has no uplink symbols for HARQ feedback".to_string());
            }
        }
        if self.min_tti_symbols == 0 || self.min_tti_symbols > SYMBOLS_PER_SLOT {
            return invalid(format!("Minimum TTI {} symbols outside 1..=14", self.min_tti_symbols));
        }
        if self.num_dmrs_symbols >= SYMBOLS_PER_SLOT {
            return invalid(format!("{} DM-RS symbols leave no data symbols", self.num_dmrs_symbols));
        }
        if self.min_tti_symbols <= self.num_dmrs_symbols {
            return invalid(format!(
                "Minimum TTI of {} symbols leaves no data symbols after {} DM-RS symbols",
                self.min_tti_symbols, self.num_dmrs_symbols
            ));
        }
        if self.num_layers == 0 || self.num_layers > 4 {
            return invalid(format!("Layer count {} outside 1..=4", self.num_layers));
        }
        if self.min_feedback_slots > MAX_K1 {
            return invalid(format!("Minimum K1 {} exceeds {}", self.min_feedback_slots, MAX_K1));
        }
        if self.initial_cqi > MAX_CQI {
            return invalid(format!("Initial CQI {} exceeds {}", self.initial_cqi, MAX_CQI));
        }

        info!(
            "MAC config valid: {} UEs, {} RBs, {} kHz, {:?}, strategy={}",
            self.num_ues,
            self.num_rbs,
            self.scs.khz(),
            self.duplex,
            self.strategy
        );
        Ok(())
    }
}
