//! MAC Statistics
//!
//! Per-UE, per-direction counters of grants and HARQ outcomes.

use serde::Serialize;

use super::harq::{HarqOutcome, TransmissionKind};
use common::types::{LinkDirection, Rnti};

/// Counters for one UE in one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DirectionStats {
    pub new_transmissions: u64,
    pub retransmissions: u64,
    pub acks: u64,
    pub nacks: u64,
    /// Transport blocks abandoned at the retransmission limit
    pub dropped: u64,
    pub soft_buffer_flushes: u64,
    /// Transport block bytes granted for new data
    pub scheduled_bytes: u64,
    /// Transport block bytes acknowledged
    pub delivered_bytes: u64,
    pub rbgs: u64,
}

impl DirectionStats {
    /// Fraction of attempts that failed
    pub fn bler(&self) -> f64 {
        let attempts = self.acks + self.nacks;
        if attempts == 0 {
            0.0
        } else {
            self.nacks as f64 / attempts as f64
        }
    }

    fn accumulate(&mut self, other: &DirectionStats) {
        self.new_transmissions += other.new_transmissions;
        self.retransmissions += other.retransmissions;
        self.acks += other.acks;
        self.nacks += other.nacks;
        self.dropped += other.dropped;
        self.soft_buffer_flushes += other.soft_buffer_flushes;
        self.scheduled_bytes += other.scheduled_bytes;
        self.delivered_bytes += other.delivered_bytes;
        self.rbgs += other.rbgs;
    }
}

/// Counters for one UE
#[derive(Debug, Clone, Serialize)]
pub struct UeStats {
    pub rnti: Rnti,
    pub uplink: DirectionStats,
    pub downlink: DirectionStats,
    /// Served rate moving averages in bits per second
    pub served_rate_ul: f64,
    pub served_rate_dl: f64,
}

impl UeStats {
    pub fn direction(&self, direction: LinkDirection) -> &DirectionStats {
        match direction {
            LinkDirection::Uplink => &self.uplink,
            LinkDirection::Downlink => &self.downlink,
        }
    }

    fn direction_mut(&mut self, direction: LinkDirection) -> &mut DirectionStats {
        match direction {
            LinkDirection::Uplink => &mut self.uplink,
            LinkDirection::Downlink => &mut self.downlink,
        }
    }
}

/// Cell-wide MAC statistics
#[derive(Debug, Clone, Serialize)]
pub struct MacStats {
    pub scheduling_runs: u64,
    pub ues: Vec<UeStats>,
}

impl MacStats {
    pub fn new(num_ues: usize) -> Self {
        Self {
            scheduling_runs: 0,
            ues: (0..num_ues)
                .map(|i| UeStats {
                    rnti: Rnti::from_ue_index(i),
                    uplink: DirectionStats::default(),
                    downlink: DirectionStats::default(),
                    served_rate_ul: 0.0,
                    served_rate_dl: 0.0,
                })
                .collect(),
        }
    }

    pub fn ue(&self, rnti: Rnti) -> Option<&UeStats> {
        rnti.ue_index().and_then(|ue| self.ues.get(ue))
    }

    fn direction_mut(&mut self, rnti: Rnti, direction: LinkDirection) -> Option<&mut DirectionStats> {
        rnti.ue_index()
            .and_then(|ue| self.ues.get_mut(ue))
            .map(|ue| ue.direction_mut(direction))
    }

    pub fn record_grant(
        &mut self,
        rnti: Rnti,
        direction: LinkDirection,
        kind: TransmissionKind,
        tbs: u32,
        num_rbgs: usize,
    ) {
        if let Some(stats) = self.direction_mut(rnti, direction) {
            match kind {
                TransmissionKind::New => {
                    stats.new_transmissions += 1;
                    stats.scheduled_bytes += tbs as u64;
                }
                TransmissionKind::Retransmission => stats.retransmissions += 1,
            }
            stats.rbgs += num_rbgs as u64;
        }
    }

    pub fn record_outcome(&mut self, rnti: Rnti, direction: LinkDirection, outcome: HarqOutcome, tbs: u32) {
        if let Some(stats) = self.direction_mut(rnti, direction) {
            match outcome {
                HarqOutcome::Success => {
                    stats.acks += 1;
                    stats.delivered_bytes += tbs as u64;
                }
                HarqOutcome::RetransmissionPending { soft_buffer_flushed, .. } => {
                    stats.nacks += 1;
                    if soft_buffer_flushed {
                        stats.soft_buffer_flushes += 1;
                    }
                }
                HarqOutcome::Dropped => {
                    stats.nacks += 1;
                    stats.dropped += 1;
                }
            }
        }
    }

    pub fn set_served_rate(&mut self, rnti: Rnti, direction: LinkDirection, rate: f64) {
        if let Some(ue) = rnti.ue_index().and_then(|ue| self.ues.get_mut(ue)) {
            match direction {
                LinkDirection::Uplink => ue.served_rate_ul = rate,
                LinkDirection::Downlink => ue.served_rate_dl = rate,
            }
        }
    }

    /// Sum over all UEs
    pub fn totals(&self, direction: LinkDirection) -> DirectionStats {
        self.ues.iter().fold(DirectionStats::default(), |mut acc, ue| {
            acc.accumulate(ue.direction(direction));
            acc
        })
    }
}
