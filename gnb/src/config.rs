//! Simulation Configuration
//!
//! TOML or YAML file describing the cell, the scheduler and the simulated
//! UEs. Every field has a default so a partial file is enough.

use std::path::Path;

use anyhow::{anyhow, bail, Context};
use common::types::{DuplexMode, SubcarrierSpacing, TddPattern};
use layers::mac::{AllocationStrategy, MacConfig, RbgSizeConfig, TickGranularity};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimConfig {
    #[serde(default)]
    pub cell: CellConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// TDD pattern; FDD when absent
    #[serde(default)]
    pub tdd: Option<TddConfig>,
    /// One entry per UE; four default UEs when empty
    #[serde(default)]
    pub ues: Vec<UeProfile>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellConfig {
    #[serde(default = "default_cell_id")]
    pub cell_id: u16,
    /// Subcarrier spacing in kHz
    #[serde(default = "default_scs_khz")]
    pub scs_khz: u32,
    #[serde(default = "default_num_rbs")]
    pub num_rbs: u16,
    /// "config1", "config2" or "explicit"
    #[serde(default = "default_rbg_config")]
    pub rbg_config: String,
    /// RBG size for the "explicit" configuration
    #[serde(default)]
    pub rbg_size: Option<u16>,
    #[serde(default = "default_num_dmrs_symbols")]
    pub num_dmrs_symbols: u8,
    #[serde(default = "default_num_layers")]
    pub num_layers: u8,
    #[serde(default = "default_min_tti_symbols")]
    pub min_tti_symbols: u8,
}

fn default_cell_id() -> u16 {
    1
}

fn default_scs_khz() -> u32 {
    15
}

fn default_num_rbs() -> u16 {
    52 // 10 MHz at 15 kHz
}

fn default_rbg_config() -> String {
    "config1".to_string()
}

fn default_num_dmrs_symbols() -> u8 {
    1
}

fn default_num_layers() -> u8 {
    1
}

fn default_min_tti_symbols() -> u8 {
    2
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            cell_id: default_cell_id(),
            scs_khz: default_scs_khz(),
            num_rbs: default_num_rbs(),
            rbg_config: default_rbg_config(),
            rbg_size: None,
            num_dmrs_symbols: default_num_dmrs_symbols(),
            num_layers: default_num_layers(),
            min_tti_symbols: default_min_tti_symbols(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// "round_robin", "proportional_fair" or "best_cqi"
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_served_rate_alpha")]
    pub served_rate_alpha: f64,
    #[serde(default = "default_periodicity_slots")]
    pub periodicity_slots: u16,
    /// Per-UE RB cap; the whole carrier when absent
    #[serde(default)]
    pub ul_rb_limit: Option<u16>,
    #[serde(default)]
    pub dl_rb_limit: Option<u16>,
    #[serde(default = "default_num_harq_processes")]
    pub num_harq_processes: u8,
    #[serde(default)]
    pub max_harq_retransmissions: Option<u8>,
    #[serde(default = "default_pusch_preparation_us")]
    pub pusch_preparation_us: u32,
    #[serde(default = "default_min_feedback_slots")]
    pub min_feedback_slots: u8,
    #[serde(default)]
    pub dl_lead_slots: u16,
    #[serde(default = "default_initial_cqi")]
    pub initial_cqi: u8,
    /// "slot" or "symbol"
    #[serde(default = "default_tick")]
    pub tick: String,
}

fn default_strategy() -> String {
    "round_robin".to_string()
}

fn default_served_rate_alpha() -> f64 {
    0.5
}

fn default_periodicity_slots() -> u16 {
    1
}

fn default_num_harq_processes() -> u8 {
    16
}

fn default_pusch_preparation_us() -> u32 {
    200
}

fn default_min_feedback_slots() -> u8 {
    1
}

fn default_initial_cqi() -> u8 {
    7
}

fn default_tick() -> String {
    "slot".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            served_rate_alpha: default_served_rate_alpha(),
            periodicity_slots: default_periodicity_slots(),
            ul_rb_limit: None,
            dl_rb_limit: None,
            num_harq_processes: default_num_harq_processes(),
            max_harq_retransmissions: None,
            pusch_preparation_us: default_pusch_preparation_us(),
            min_feedback_slots: default_min_feedback_slots(),
            dl_lead_slots: 0,
            initial_cqi: default_initial_cqi(),
            tick: default_tick(),
        }
    }
}

/// TDD pattern, one period: DL slots, a special slot, UL slots
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TddConfig {
    pub periodicity_slots: u16,
    pub num_dl_slots: u16,
    #[serde(default)]
    pub num_dl_symbols: u8,
    #[serde(default)]
    pub num_ul_symbols: u8,
    pub num_ul_slots: u16,
}

/// Radio and traffic model of one simulated UE
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UeProfile {
    /// Mean DL CQI reported on every RB
    #[serde(default = "default_dl_cqi")]
    pub dl_cqi: u8,
    #[serde(default = "default_ul_cqi")]
    pub ul_cqi: u8,
    /// Offered DL traffic in kbit/s
    #[serde(default = "default_dl_rate_kbps")]
    pub dl_rate_kbps: u32,
    #[serde(default = "default_ul_rate_kbps")]
    pub ul_rate_kbps: u32,
    /// Probability that a transport block fails to decode
    #[serde(default = "default_bler")]
    pub bler: f64,
}

fn default_dl_cqi() -> u8 {
    12
}

fn default_ul_cqi() -> u8 {
    10
}

fn default_dl_rate_kbps() -> u32 {
    5_000
}

fn default_ul_rate_kbps() -> u32 {
    1_000
}

fn default_bler() -> f64 {
    0.1
}

impl Default for UeProfile {
    fn default() -> Self {
        Self {
            dl_cqi: default_dl_cqi(),
            ul_cqi: default_ul_cqi(),
            dl_rate_kbps: default_dl_rate_kbps(),
            ul_rate_kbps: default_ul_rate_kbps(),
            bler: default_bler(),
        }
    }
}

/// Run control
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default = "default_slots")]
    pub slots: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Slots between CQI reports of a UE
    #[serde(default = "default_cqi_period_slots")]
    pub cqi_period_slots: u64,
    /// Slots between periodic BSRs of a UE with data
    #[serde(default = "default_bsr_period_slots")]
    pub bsr_period_slots: u64,
    /// Size of generated DL SDUs in bytes
    #[serde(default = "default_sdu_size")]
    pub sdu_size: usize,
}

fn default_slots() -> u64 {
    1000
}

fn default_seed() -> u64 {
    1
}

fn default_cqi_period_slots() -> u64 {
    20
}

fn default_bsr_period_slots() -> u64 {
    10
}

fn default_sdu_size() -> usize {
    1500
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            seed: default_seed(),
            cqi_period_slots: default_cqi_period_slots(),
            bsr_period_slots: default_bsr_period_slots(),
            sdu_size: default_sdu_size(),
        }
    }
}

impl SimConfig {
    /// Load from a `.toml`, `.yaml` or `.yml` file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

        let config = match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            other => bail!("Unsupported configuration format '{}'", other),
        };
        Ok(config)
    }

    /// UE profiles, defaults filled in
    pub fn ue_profiles(&self) -> Vec<UeProfile> {
        if self.ues.is_empty() {
            vec![UeProfile::default(); 4]
        } else {
            self.ues.clone()
        }
    }

    /// Scheduler configuration; `MacScheduler::new` validates it
    pub fn to_mac_config(&self) -> anyhow::Result<MacConfig> {
        let cell = &self.cell;
        let sched = &self.scheduler;

        let scs = SubcarrierSpacing::from_u32(cell.scs_khz)
            .ok_or_else(|| anyhow!("Invalid subcarrier spacing: {} kHz", cell.scs_khz))?;

        let rbg_size = match cell.rbg_config.to_ascii_lowercase().as_str() {
            "config1" => RbgSizeConfig::Config1,
            "config2" => RbgSizeConfig::Config2,
            "explicit" => RbgSizeConfig::Explicit(
                cell.rbg_size
                    .ok_or_else(|| anyhow!("Explicit RBG configuration needs rbg_size"))?,
            ),
            other => bail!("Unknown RBG configuration '{}'", other),
        };

        let tick = match sched.tick.to_ascii_lowercase().as_str() {
            "slot" => TickGranularity::Slot,
            "symbol" => TickGranularity::Symbol,
            other => bail!("Unknown tick granularity '{}'", other),
        };

        let duplex = match self.tdd {
            Some(tdd) => DuplexMode::Tdd(TddPattern {
                periodicity_slots: tdd.periodicity_slots,
                num_dl_slots: tdd.num_dl_slots,
                num_dl_symbols: tdd.num_dl_symbols,
                num_ul_symbols: tdd.num_ul_symbols,
                num_ul_slots: tdd.num_ul_slots,
            }),
            None => DuplexMode::Fdd,
        };

        let num_ues = u16::try_from(self.ue_profiles().len())
            .context("Too many UEs")?;

        Ok(MacConfig {
            cell_id: cell.cell_id,
            num_ues,
            num_rbs: cell.num_rbs,
            scs,
            duplex,
            num_harq_processes: sched.num_harq_processes,
            strategy: sched.strategy.parse::<AllocationStrategy>().map_err(|e| anyhow!(e))?,
            served_rate_alpha: sched.served_rate_alpha,
            scheduling_periodicity: sched.periodicity_slots,
            ul_rb_limit: sched.ul_rb_limit.unwrap_or(cell.num_rbs),
            dl_rb_limit: sched.dl_rb_limit.unwrap_or(cell.num_rbs),
            rbg_size,
            min_tti_symbols: cell.min_tti_symbols,
            num_dmrs_symbols: cell.num_dmrs_symbols,
            num_layers: cell.num_layers,
            pusch_preparation_us: sched.pusch_preparation_us,
            min_feedback_slots: sched.min_feedback_slots,
            initial_cqi: sched.initial_cqi,
            dl_lead_slots: sched.dl_lead_slots,
            tick,
            max_harq_retransmissions: sched.max_harq_retransmissions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SimConfig = toml::from_str(
            r#"
            [cell]
            num_rbs = 106

            [scheduler]
            strategy = "pf"
            dl_rb_limit = 24

            [[ues]]
            dl_cqi = 15

            [[ues]]
            bler = 0.0
            "#,
        )
        .unwrap();

        let mac = config.to_mac_config().unwrap();
        assert_eq!(mac.num_rbs, 106);
        assert_eq!(mac.num_ues, 2);
        assert_eq!(mac.strategy, AllocationStrategy::ProportionalFair);
        assert_eq!(mac.dl_rb_limit, 24);
        assert_eq!(mac.ul_rb_limit, 106);
        assert_eq!(mac.duplex, DuplexMode::Fdd);
        assert_eq!(config.ues[0].ul_cqi, 10);
        assert!(mac.validate().is_ok());
    }

    #[test]
    fn test_yaml_tdd_config() {
        let config: SimConfig = serde_yaml::from_str(
            r#"
cell:
  scs_khz: 30
  num_rbs: 51
  rbg_config: explicit
  rbg_size: 4
tdd:
  periodicity_slots: 5
  num_dl_slots: 3
  num_dl_symbols: 10
  num_ul_symbols: 2
  num_ul_slots: 1
scheduler:
  tick: symbol
"#,
        )
        .unwrap();

        let mac = config.to_mac_config().unwrap();
        assert_eq!(mac.scs, SubcarrierSpacing::Scs30);
        assert_eq!(mac.rbg_size, RbgSizeConfig::Explicit(4));
        assert_eq!(mac.tick, TickGranularity::Symbol);
        assert!(matches!(mac.duplex, DuplexMode::Tdd(p) if p.num_dl_slots == 3));
        assert_eq!(mac.num_ues, 4);
        assert!(mac.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_values() {
        let mut config = SimConfig::default();
        config.cell.scs_khz = 45;
        assert!(config.to_mac_config().is_err());

        let mut config = SimConfig::default();
        config.scheduler.strategy = "fastest".to_string();
        assert!(config.to_mac_config().is_err());

        let mut config = SimConfig::default();
        config.cell.rbg_config = "explicit".to_string();
        assert!(config.to_mac_config().is_err());
    }
}
