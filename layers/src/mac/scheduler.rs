//! MAC Scheduler Implementation
//!
//! Lock-step scheduling and HARQ engine of one cell. On every scheduling
//! boundary it allocates RBGs in UL then DL (retransmissions first), records
//! the issued grants as timed contexts, and on every symbol it hands due
//! transmissions and receptions to the PHY. Feedback and PUSCH results are
//! routed back into the HARQ processes.

use std::ops::Range;

use bytes::Bytes;
use ndarray::Array2;
use tracing::{debug, error, info, trace, warn};

use super::bsr;
use super::config::{MacConfig, TickGranularity, MAX_K1};
use super::grant_context::{GrantContext, GrantContextStore};
use super::harq::{HarqOutcome, HarqProcessBank, TransmissionKind};
use super::link_adaptation::{self, LinkAdaptationTable};
use super::pdu::{self, MacPduBuilder, MacSubPdu, LCID_DRB};
use super::stats::MacStats;
use super::strategy::{self, RbgCandidate, MIN_SERVED_RATE};
use super::timing::TimingEngine;
use crate::phy::{PdschRequest, PhyInterface, PuschIndication, PuschRequest, SharedChannelParams};
use crate::rlc::RlcInterface;
use crate::LayerError;
use common::types::{LinkDirection, Rnti, SUBCARRIERS_PER_RB, SYMBOLS_PER_SLOT};
use common::utils::bytes_to_hex;
use common::utils::time::{slots_covering, tti_duration_ms};
use interfaces::message_types::{BsrFormat, ControlMessage, CqiReport, Grant, PdschFeedback, RbgBitmap};

/// Scheduler view of one UE
#[derive(Debug, Clone)]
struct UeState {
    rnti: Rnti,
    /// Buffered bytes not yet covered by a grant, per direction
    buffer: [u32; 2],
    /// Served rate moving average in bits per second, per direction
    served_rate: [f64; 2],
}

/// Target slot being scheduled
#[derive(Debug, Clone, Copy)]
struct SlotPlan {
    direction: LinkDirection,
    target_slot: u64,
    slot_offset: u16,
    start_symbol: u8,
    num_symbols: u8,
    feedback_slots: Option<u8>,
}

/// Record `rnti` as the owner of `rbg`; an owned RBG is never reassigned
fn claim(owners: &mut [Option<Rnti>], rbg: usize, rnti: Rnti) -> Result<(), LayerError> {
    match owners[rbg] {
        Some(holder) => {
            error!("RBG {} claimed by rnti={} is already held by rnti={}", rbg, rnti, holder);
            Err(LayerError::RbgDoubleAssignment {
                rbg,
                holder,
                claimant: rnti,
            })
        }
        None => {
            owners[rbg] = Some(rnti);
            Ok(())
        }
    }
}

/// MAC scheduler for one cell
pub struct MacScheduler {
    config: MacConfig,
    timing: TimingEngine,
    link: LinkAdaptationTable,
    harq: HarqProcessBank,
    contexts: GrantContextStore,
    ues: Vec<UeState>,
    /// Previous RBG winner per direction
    last_winner: [Option<Rnti>; 2],
    rbg_size: u16,
    num_rbgs: usize,
    ul_lead_slots: u16,
    /// K1 per frame slot; `None` where a PDSCH could not be acknowledged
    feedback_offsets: Vec<Option<u8>>,
    /// UL processes whose PUSCH went to the PHY, `[ue, harq_id]`
    receptions: Array2<bool>,
    /// DL bytes granted but not yet pulled from the RLC, `[ue, harq_id]`
    pending_dl: Array2<u32>,
    stats: MacStats,
}

impl MacScheduler {
    /// Create a new MAC scheduler
    pub fn new(config: MacConfig) -> Result<Self, LayerError> {
        config.validate()?;

        let timing = TimingEngine::new(config.scs, config.duplex);
        let num_ues = config.num_ues as usize;
        let rbg_size = config.rbg_size.rbg_size(config.num_rbs)?;
        let num_rbgs = ((config.num_rbs + rbg_size - 1) / rbg_size) as usize;
        let ul_lead_slots = slots_covering(config.scs, config.pusch_preparation_us, 1);

        let slots_per_frame = timing.slots_per_frame();
        let feedback_offsets: Vec<Option<u8>> = (0..slots_per_frame)
            .map(|slot| {
                (config.min_feedback_slots..=MAX_K1).find(|&k1| {
                    let feedback_slot = (slot + k1 as u16) % slots_per_frame;
                    timing
                        .direction_symbols(feedback_slot, LinkDirection::Uplink)
                        .is_some()
                })
            })
            .collect();

        // Every context must be consumed before its table entry comes round again
        let max_k1 = feedback_offsets.iter().flatten().copied().max().unwrap_or(0) as u16;
        let horizon = ul_lead_slots.max(config.dl_lead_slots + max_k1) + config.scheduling_periodicity;
        if horizon > slots_per_frame {
            return Err(LayerError::InvalidConfiguration(format!(
                "Scheduling horizon of {} slots exceeds the {}-slot frame",
                horizon, slots_per_frame
            )));
        }

        info!(
            "MAC scheduler: {} RBGs of {} RBs, UL lead {} slots, strategy={}",
            num_rbgs, rbg_size, ul_lead_slots, config.strategy
        );

        Ok(Self {
            link: LinkAdaptationTable::new(
                num_ues,
                config.num_rbs as usize,
                config.initial_cqi,
                config.num_dmrs_symbols,
            ),
            harq: HarqProcessBank::new(
                num_ues,
                config.num_harq_processes,
                config.max_harq_retransmissions,
            ),
            contexts: GrantContextStore::new(
                num_ues,
                timing.symbols_per_frame(),
                config.num_harq_processes as usize,
            ),
            ues: (0..num_ues)
                .map(|i| UeState {
                    rnti: Rnti::from_ue_index(i),
                    buffer: [0; 2],
                    served_rate: [MIN_SERVED_RATE; 2],
                })
                .collect(),
            last_winner: [None; 2],
            rbg_size,
            num_rbgs,
            ul_lead_slots,
            feedback_offsets,
            receptions: Array2::from_elem((num_ues, config.num_harq_processes as usize), false),
            pending_dl: Array2::zeros((num_ues, config.num_harq_processes as usize)),
            stats: MacStats::new(num_ues),
            timing,
            config,
        })
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn timing(&self) -> &TimingEngine {
        &self.timing
    }

    pub fn harq(&self) -> &HarqProcessBank {
        &self.harq
    }

    pub fn link_adaptation(&self) -> &LinkAdaptationTable {
        &self.link
    }

    pub fn contexts(&self) -> &GrantContextStore {
        &self.contexts
    }

    pub fn stats(&self) -> &MacStats {
        &self.stats
    }

    pub fn num_rbgs(&self) -> usize {
        self.num_rbgs
    }

    pub fn rbg_size(&self) -> u16 {
        self.rbg_size
    }

    /// Slots between an UL grant and its PUSCH
    pub fn ul_lead_slots(&self) -> u16 {
        self.ul_lead_slots
    }

    /// K1 used for a PDSCH in frame slot `slot`
    pub fn feedback_offset(&self, slot: u16) -> Option<u8> {
        self.feedback_offsets.get(slot as usize).copied().flatten()
    }

    /// Buffered bytes the scheduler has not yet granted
    pub fn buffer(&self, rnti: Rnti, direction: LinkDirection) -> Option<u32> {
        self.ue_index(rnti)
            .ok()
            .map(|ue| self.ues[ue].buffer[direction.index()])
    }

    pub fn served_rate(&self, rnti: Rnti, direction: LinkDirection) -> Option<f64> {
        self.ue_index(rnti)
            .ok()
            .map(|ue| self.ues[ue].served_rate[direction.index()])
    }

    /// Resource blocks of RBG `rbg`; the last RBG holds the remainder
    pub fn rbg_resource_blocks(&self, rbg: usize) -> Range<u16> {
        let start = (rbg as u16 * self.rbg_size).min(self.config.num_rbs);
        let end = (start + self.rbg_size).min(self.config.num_rbs);
        start..end
    }

    fn ue_index(&self, rnti: Rnti) -> Result<usize, LayerError> {
        rnti.ue_index()
            .filter(|&ue| ue < self.ues.len())
            .ok_or(LayerError::UnknownUe(rnti))
    }

    fn lead_slots(&self, direction: LinkDirection) -> u16 {
        match direction {
            LinkDirection::Uplink => self.ul_lead_slots,
            LinkDirection::Downlink => self.config.dl_lead_slots,
        }
    }

    /// Advance one tick: schedule on a scheduling boundary, then start every
    /// transmission and reception due within the tick. Returns the grants
    /// issued in this tick.
    pub fn tick(
        &mut self,
        phy: &mut dyn PhyInterface,
        rlc: &mut dyn RlcInterface,
    ) -> Result<Vec<Grant>, LayerError> {
        let periodicity = self.config.scheduling_periodicity as u64;
        let grants = if self.timing.is_slot_boundary() && self.timing.absolute_slot() % periodicity == 0 {
            self.schedule(rlc)?
        } else {
            Vec::new()
        };

        let first = self.timing.symbol();
        let window = match self.config.tick {
            TickGranularity::Symbol => 1,
            TickGranularity::Slot => SYMBOLS_PER_SLOT - first,
        };
        let absolute_slot = self.timing.absolute_slot();
        for symbol in first..first + window {
            let index = self.timing.symbol_index(absolute_slot, symbol);
            self.start_receptions(phy, index, absolute_slot)?;
            self.start_transmissions(phy, rlc, index, absolute_slot)?;
        }

        self.timing.advance(window as u32);
        Ok(grants)
    }

    /// One scheduling run at the current slot: UL then DL, each covering
    /// `scheduling_periodicity` target slots after its lead time
    pub fn schedule(&mut self, rlc: &dyn RlcInterface) -> Result<Vec<Grant>, LayerError> {
        for (ue, state) in self.ues.iter_mut().enumerate() {
            let granted: u32 = self.pending_dl.row(ue).sum();
            state.buffer[LinkDirection::Downlink.index()] =
                rlc.report_buffer_status(state.rnti).saturating_sub(granted);
        }

        let now = self.timing.absolute_slot();
        let mut grants = Vec::new();
        for direction in LinkDirection::ALL {
            let lead = self.lead_slots(direction);
            for k in 0..self.config.scheduling_periodicity {
                let slot_offset = lead + k;
                grants.extend(self.schedule_slot(direction, now + slot_offset as u64, slot_offset)?);
            }
        }
        self.stats.scheduling_runs += 1;
        Ok(grants)
    }

    fn schedule_slot(
        &mut self,
        direction: LinkDirection,
        target_slot: u64,
        slot_offset: u16,
    ) -> Result<Vec<Grant>, LayerError> {
        let frame_slot = self.timing.position_of(target_slot).slot;
        let Some((start_symbol, num_symbols)) = self.timing.direction_symbols(frame_slot, direction) else {
            self.decay_served_rates(direction);
            return Ok(Vec::new());
        };
        if num_symbols < self.config.min_tti_symbols {
            trace!(
                "{} slot {} has {} symbols, below the minimum TTI",
                direction, target_slot, num_symbols
            );
            self.decay_served_rates(direction);
            return Ok(Vec::new());
        }
        let feedback_slots = match direction {
            LinkDirection::Uplink => None,
            LinkDirection::Downlink => match self.feedback_offset(frame_slot) {
                Some(k1) => Some(k1),
                None => {
                    trace!("DL slot {} has no feedback opportunity", target_slot);
                    self.decay_served_rates(direction);
                    return Ok(Vec::new());
                }
            },
        };

        let plan = SlotPlan {
            direction,
            target_slot,
            slot_offset,
            start_symbol,
            num_symbols,
            feedback_slots,
        };
        let num_ues = self.ues.len();
        let mut owners: Vec<Option<Rnti>> = vec![None; self.num_rbgs];
        let mut scheduled = vec![false; num_ues];
        let mut achieved_bits = vec![0f64; num_ues];
        let mut grants = Vec::new();

        // Retransmissions keep their RBG count, MCS and TBS
        for ue in 0..num_ues {
            let rnti = self.ues[ue].rnti;
            let Some(harq_id) = self.harq.pending_retransmission(rnti, direction) else {
                continue;
            };
            let Some(process) = self.harq.process(rnti, direction, harq_id) else {
                continue;
            };
            let (needed, num_rbs) = (process.num_rbgs(), process.num_rbs());
            let (tbs, mcs, ndi) = (process.tbs(), process.mcs(), process.ndi());

            let Some(rbgs) = self.retransmission_rbgs(&owners, needed, num_rbs) else {
                debug!(
                    "{} retransmission rnti={} harq_id={} waits for {} RBGs covering {} RBs",
                    direction, rnti, harq_id, needed, num_rbs
                );
                continue;
            };
            for &rbg in &rbgs {
                claim(&mut owners, rbg, rnti)?;
            }

            let kind = self
                .harq
                .record_grant(rnti, direction, harq_id, ndi, tbs, mcs, needed, num_rbs)?;
            let rv = self
                .harq
                .process(rnti, direction, harq_id)
                .map(|p| p.rv())
                .unwrap_or(0);
            grants.push(self.issue_grant(&plan, rnti, &rbgs, mcs, ndi, rv, harq_id, tbs, kind)?);
            scheduled[ue] = true;
            achieved_bits[ue] += tbs as f64 * 8.0;
        }

        // New transmissions, RBG by RBG
        let d = direction.index();
        let rb_limit = self.config.rb_limit(direction) as usize;
        let tti_ms = tti_duration_ms(self.config.scs, num_symbols);
        let eligible: Vec<bool> = (0..num_ues)
            .map(|ue| {
                !scheduled[ue]
                    && self.ues[ue].buffer[d] > 0
                    && self.harq.select_process(self.ues[ue].rnti, direction).is_some()
            })
            .collect();
        let mut tentative: Vec<Vec<usize>> = vec![Vec::new(); num_ues];
        let mut allocated_rbs = vec![0usize; num_ues];
        let mut covered = vec![0u32; num_ues];

        for rbg in 0..self.num_rbgs {
            if owners[rbg].is_some() {
                continue;
            }
            let rbs = self.rbg_resource_blocks(rbg);
            let rbg_len = rbs.len();
            let candidates: Vec<RbgCandidate> = (0..num_ues)
                .filter(|&ue| {
                    eligible[ue]
                        && covered[ue] < self.ues[ue].buffer[d]
                        && allocated_rbs[ue] + rbg_len <= rb_limit
                })
                .map(|ue| self.candidate(ue, direction, &rbs, num_symbols, tti_ms))
                .collect();

            let Some(winner) = self.config.strategy.decide(&candidates, self.last_winner[d]) else {
                continue;
            };
            claim(&mut owners, rbg, winner)?;
            self.last_winner[d] = Some(winner);
            trace!("{} RBG {} -> rnti={} among {} candidates", direction, rbg, winner, candidates.len());

            let ue = self.ue_index(winner)?;
            tentative[ue].push(rbg);
            allocated_rbs[ue] += rbg_len;
            covered[ue] = self.allocation_tbs(winner, direction, &tentative[ue], num_symbols).1;
        }

        for ue in 0..num_ues {
            if tentative[ue].is_empty() {
                continue;
            }
            let rnti = self.ues[ue].rnti;
            let (mcs, tbs) = self.allocation_tbs(rnti, direction, &tentative[ue], num_symbols);
            let harq_id = self
                .harq
                .select_process(rnti, direction)
                .ok_or(LayerError::HarqStateMismatch {
                    rnti,
                    direction,
                    harq_id: 0,
                    expected: "available for new data",
                })?;
            let ndi = !self
                .harq
                .process(rnti, direction, harq_id)
                .map(|p| p.ndi())
                .unwrap_or(false);

            let kind = self.harq.record_grant(
                rnti,
                direction,
                harq_id,
                ndi,
                tbs,
                mcs,
                tentative[ue].len(),
                allocated_rbs[ue] as u16,
            )?;
            grants.push(self.issue_grant(&plan, rnti, &tentative[ue], mcs, ndi, 0, harq_id, tbs, kind)?);
            if direction == LinkDirection::Downlink {
                self.pending_dl[(ue, harq_id as usize)] = tbs.min(self.ues[ue].buffer[d]);
            }
            self.ues[ue].buffer[d] = self.ues[ue].buffer[d].saturating_sub(tbs);
            achieved_bits[ue] += tbs as f64 * 8.0;
        }

        let achieved: Vec<f64> = achieved_bits.iter().map(|bits| bits * 1000.0 / tti_ms).collect();
        self.update_served_rates(direction, &achieved);

        Ok(grants)
    }

    /// Moving-average update of every UE's served rate, `achieved` in bit/s per UE
    fn update_served_rates(&mut self, direction: LinkDirection, achieved: &[f64]) {
        let d = direction.index();
        let alpha = self.config.served_rate_alpha;
        for (state, &rate) in self.ues.iter_mut().zip(achieved) {
            state.served_rate[d] = strategy::update_served_rate(state.served_rate[d], rate, alpha);
            self.stats.set_served_rate(state.rnti, direction, state.served_rate[d]);
        }
    }

    /// Served-rate update for a slot where `direction` carries nothing
    fn decay_served_rates(&mut self, direction: LinkDirection) {
        let idle = vec![0.0; self.ues.len()];
        self.update_served_rates(direction, &idle);
    }

    /// RBGs for a retransmission of `needed` RBGs spanning `num_rbs` RBs.
    /// The short last RBG is only reused when the first transmission had it.
    fn retransmission_rbgs(&self, owners: &[Option<Rnti>], needed: usize, num_rbs: u16) -> Option<Vec<usize>> {
        let size = self.rbg_size as usize;
        let (full, short): (Vec<usize>, Vec<usize>) = (0..self.num_rbgs)
            .filter(|&rbg| owners[rbg].is_none())
            .partition(|&rbg| self.rbg_resource_blocks(rbg).len() == size);

        let had_short = (num_rbs as usize) < needed * size;
        let mut rbgs: Vec<usize> = match short.first() {
            Some(&last) if had_short && needed > 0 => std::iter::once(last)
                .chain(full.iter().copied().take(needed - 1))
                .collect(),
            _ => full.iter().copied().take(needed).collect(),
        };
        if rbgs.len() < needed {
            return None;
        }
        rbgs.sort_unstable();
        let granted: usize = rbgs.iter().map(|&rbg| self.rbg_resource_blocks(rbg).len()).sum();
        (granted >= num_rbs as usize).then_some(rbgs)
    }

    /// Strategy input for UE `ue` on the RBG spanning `rbs`
    fn candidate(
        &self,
        ue: usize,
        direction: LinkDirection,
        rbs: &Range<u16>,
        num_symbols: u8,
        tti_ms: f64,
    ) -> RbgCandidate {
        let state = &self.ues[ue];
        let values: Vec<u8> = self
            .link
            .cqi(state.rnti, direction)
            .map(|cqi| cqi.iter().skip(rbs.start as usize).take(rbs.len()).copied().collect())
            .unwrap_or_default();
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
        };
        let efficiency = link_adaptation::mcs_for(&values).efficiency;
        let resource_elements = rbs.len() as u32 * SUBCARRIERS_PER_RB * num_symbols as u32;

        RbgCandidate {
            rnti: state.rnti,
            average_cqi: mean,
            achievable_rate: strategy::achievable_rate(resource_elements, efficiency, tti_ms),
            served_rate: state.served_rate[direction.index()],
        }
    }

    /// MCS (floored mean of per-RBG MCS) and TBS in bytes of an allocation
    fn allocation_tbs(&self, rnti: Rnti, direction: LinkDirection, rbgs: &[usize], num_symbols: u8) -> (u8, u32) {
        if rbgs.is_empty() {
            return (0, 0);
        }
        let mut mcs_sum = 0u32;
        let mut num_rbs = 0u32;
        for &rbg in rbgs {
            let rbs = self.rbg_resource_blocks(rbg);
            let cqi = self
                .link
                .average_cqi(rnti, direction, rbs.start as usize, rbs.len());
            mcs_sum += link_adaptation::mcs_for_cqi(cqi).index as u32;
            num_rbs += rbs.len() as u32;
        }
        let mcs = (mcs_sum / rbgs.len() as u32) as u8;
        let tbs = self
            .link
            .transport_block_size(mcs, num_rbs, num_symbols, self.config.num_layers);
        (mcs, tbs)
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_grant(
        &mut self,
        plan: &SlotPlan,
        rnti: Rnti,
        rbgs: &[usize],
        mcs: u8,
        ndi: bool,
        rv: u8,
        harq_id: u8,
        tbs: u32,
        kind: TransmissionKind,
    ) -> Result<Grant, LayerError> {
        let grant = Grant {
            rnti,
            direction: plan.direction,
            rbg_allocation: RbgBitmap::from_indices(self.num_rbgs, rbgs),
            start_symbol: plan.start_symbol,
            num_symbols: plan.num_symbols,
            slot_offset: plan.slot_offset,
            mcs,
            ndi,
            rv,
            harq_id,
            feedback_slot_offset: plan.feedback_slots,
        };
        let context = GrantContext {
            absolute_slot: plan.target_slot,
            grant: grant.clone(),
            tbs,
            resource_blocks: rbgs
                .iter()
                .flat_map(|&rbg| self.rbg_resource_blocks(rbg))
                .collect(),
        };
        let symbol = self.timing.symbol_index(plan.target_slot, plan.start_symbol);

        match plan.direction {
            LinkDirection::Uplink => self.contexts.insert_rx(symbol, context)?,
            LinkDirection::Downlink => {
                self.contexts.insert_tx(symbol, context)?;
                if let Some(k1) = plan.feedback_slots {
                    let feedback_slot = plan.target_slot + k1 as u64;
                    let frame_slot = self.timing.position_of(feedback_slot).slot;
                    let Some((ul_symbol, _)) = self
                        .timing
                        .direction_symbols(frame_slot, LinkDirection::Uplink)
                    else {
                        return Err(LayerError::InvalidConfiguration(format!(
                            "Feedback slot {} has no uplink symbol",
                            feedback_slot
                        )));
                    };
                    let feedback_symbol = self.timing.symbol_index(feedback_slot, ul_symbol);
                    self.contexts
                        .insert_feedback(rnti, feedback_symbol, harq_id, feedback_slot)?;
                }
            }
        }

        self.stats.record_grant(rnti, plan.direction, kind, tbs, rbgs.len());
        debug!(
            "{} {:?} grant rnti={} harq_id={} rbgs={} mcs={} tbs={} ndi={} rv={} slot_offset={}",
            plan.direction,
            kind,
            rnti,
            harq_id,
            rbgs.len(),
            mcs,
            tbs,
            ndi,
            rv,
            plan.slot_offset
        );
        Ok(grant)
    }

    fn channel_params(&self, context: GrantContext) -> Result<SharedChannelParams, LayerError> {
        let grant = context.grant;
        let info = link_adaptation::mcs_info(grant.mcs)
            .ok_or_else(|| LayerError::Phy(format!("MCS {} outside the MCS table", grant.mcs)))?;
        let position = self.timing.position_of(context.absolute_slot);

        Ok(SharedChannelParams {
            rnti: grant.rnti,
            harq_id: grant.harq_id,
            rv: grant.rv,
            ndi: grant.ndi,
            mcs: grant.mcs,
            modulation: info.modulation.as_str(),
            code_rate: info.code_rate,
            tbs: context.tbs,
            resource_blocks: context.resource_blocks,
            frame: position.frame,
            slot: position.slot,
            start_symbol: grant.start_symbol,
            num_symbols: grant.num_symbols,
            num_layers: self.config.num_layers,
        })
    }

    fn start_receptions(
        &mut self,
        phy: &mut dyn PhyInterface,
        symbol: usize,
        absolute_slot: u64,
    ) -> Result<(), LayerError> {
        for ue in 0..self.ues.len() {
            let rnti = self.ues[ue].rnti;
            let Some(context) = self.contexts.take_rx(rnti, symbol, absolute_slot) else {
                continue;
            };
            let harq_id = context.grant.harq_id;
            let params = self.channel_params(context)?;
            self.receptions[(ue, harq_id as usize)] = true;
            trace!("PUSCH rx rnti={} harq_id={} frame={} slot={}", rnti, harq_id, params.frame, params.slot);
            phy.request_reception(PuschRequest { params })?;
        }
        Ok(())
    }

    fn start_transmissions(
        &mut self,
        phy: &mut dyn PhyInterface,
        rlc: &mut dyn RlcInterface,
        symbol: usize,
        absolute_slot: u64,
    ) -> Result<(), LayerError> {
        for ue in 0..self.ues.len() {
            let rnti = self.ues[ue].rnti;
            let Some(context) = self.contexts.take_tx(rnti, symbol, absolute_slot) else {
                continue;
            };
            let harq_id = context.grant.harq_id;
            let stored = self
                .harq
                .process(rnti, LinkDirection::Downlink, harq_id)
                .and_then(|p| p.payload().cloned());
            let payload = match stored {
                Some(payload) => payload,
                None => {
                    self.pending_dl[(ue, harq_id as usize)] = 0;
                    let payload = Self::build_pdu(rlc, rnti, context.tbs as usize);
                    self.harq
                        .store_payload(rnti, LinkDirection::Downlink, harq_id, payload.clone())?;
                    payload
                }
            };
            let params = self.channel_params(context)?;
            trace!("PDSCH tx rnti={} harq_id={} frame={} slot={}", rnti, harq_id, params.frame, params.slot);
            phy.transmit(PdschRequest { params, payload })?;
        }
        Ok(())
    }

    /// Fill a DL MAC PDU from the RLC and pad it to the TBS
    fn build_pdu(rlc: &mut dyn RlcInterface, rnti: Rnti, tbs: usize) -> Bytes {
        let mut builder = MacPduBuilder::new(tbs);
        loop {
            let budget = builder.max_sdu_len();
            if budget == 0 {
                break;
            }
            let sdus = rlc.fetch_sdus(rnti, budget);
            if sdus.is_empty() {
                break;
            }
            let mut full = false;
            for sdu in sdus {
                if !builder.add_sdu(LCID_DRB, &sdu) {
                    warn!("DL SDU of {} bytes for rnti={} does not fit, dropped", sdu.len(), rnti);
                    full = true;
                }
            }
            if full {
                break;
            }
        }
        builder.finish()
    }

    /// Route an out-of-band message from a UE
    pub fn handle_control(&mut self, message: ControlMessage) -> Result<(), LayerError> {
        match message {
            ControlMessage::BufferStatus(report) => self.handle_bsr(report.rnti, report.format, &report.payload),
            ControlMessage::Cqi(report) => self.handle_cqi(&report),
            ControlMessage::PdschFeedback(feedback) => self.handle_dl_feedback(&feedback),
            ControlMessage::UplinkGrant(grant) | ControlMessage::DownlinkGrant(grant) => {
                warn!("Ignoring grant for rnti={} received from a UE", grant.rnti);
                Err(LayerError::InvalidPdu("Grant sent towards the gNB".to_string()))
            }
        }
    }

    /// Replace the UL buffer estimate with a buffer status report
    pub fn handle_bsr(&mut self, rnti: Rnti, format: BsrFormat, payload: &[u8]) -> Result<(), LayerError> {
        let ue = self.ue_index(rnti)?;
        let buffers = bsr::decode(format, payload)?;
        let total = bsr::total_bytes(&buffers);
        self.ues[ue].buffer[LinkDirection::Uplink.index()] = total;
        debug!("{:?} BSR rnti={}: {} bytes", format, rnti, total);
        Ok(())
    }

    /// Overwrite the per-RB CQI of one UE and direction
    pub fn handle_cqi(&mut self, report: &CqiReport) -> Result<(), LayerError> {
        self.ue_index(report.rnti)?;
        self.link.update_quality(report.rnti, report.direction, &report.cqi)
    }

    /// Apply PDSCH ACK/NACKs expected in the current slot. Entries without a
    /// matching feedback context are skipped and reported after the rest.
    pub fn handle_dl_feedback(&mut self, feedback: &PdschFeedback) -> Result<(), LayerError> {
        let rnti = feedback.rnti;
        self.ue_index(rnti)?;
        let now = self.timing.absolute_slot();
        let first = self.timing.symbol_index(now, 0);
        let symbols = first..first + SYMBOLS_PER_SLOT as usize;

        let mut unexpected = None;
        for (harq_id, ack) in feedback.iter() {
            if self
                .contexts
                .take_feedback(rnti, harq_id, symbols.clone(), now)
                .is_none()
            {
                warn!("Unexpected DL feedback rnti={} harq_id={} in slot {}", rnti, harq_id, now);
                if unexpected.is_none() {
                    unexpected = Some(LayerError::UnexpectedFeedback { rnti, harq_id });
                }
                continue;
            }

            let tbs = self
                .harq
                .process(rnti, LinkDirection::Downlink, harq_id)
                .map(|p| p.tbs())
                .unwrap_or(0);
            let outcome = self
                .harq
                .handle_result(rnti, LinkDirection::Downlink, harq_id, ack)?;
            self.stats.record_outcome(rnti, LinkDirection::Downlink, outcome, tbs);
            if !ack {
                debug!("DL NACK rnti={} harq_id={}: {:?}", rnti, harq_id, outcome);
            }
        }

        match unexpected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Apply a PUSCH decoding result and demultiplex the PDU on success
    pub fn handle_rx_indication(
        &mut self,
        indication: PuschIndication,
        rlc: &mut dyn RlcInterface,
    ) -> Result<HarqOutcome, LayerError> {
        let rnti = indication.rnti;
        let harq_id = indication.harq_id;
        let ue = self.ue_index(rnti)?;
        let pending = self
            .receptions
            .get_mut((ue, harq_id as usize))
            .filter(|pending| **pending);
        match pending {
            Some(pending) => *pending = false,
            None => {
                warn!("PUSCH result rnti={} harq_id={} without a reception", rnti, harq_id);
                return Err(LayerError::UnmatchedReception { rnti, harq_id });
            }
        }

        let tbs = self
            .harq
            .process(rnti, LinkDirection::Uplink, harq_id)
            .map(|p| p.tbs())
            .unwrap_or(0);
        let outcome = self
            .harq
            .handle_result(rnti, LinkDirection::Uplink, harq_id, indication.crc_ok)?;
        self.stats.record_outcome(rnti, LinkDirection::Uplink, outcome, tbs);

        if !indication.crc_ok {
            debug!("UL CRC failure rnti={} harq_id={}: {:?}", rnti, harq_id, outcome);
        } else if let Some(payload) = indication.payload {
            self.demultiplex(rnti, &payload, rlc)?;
        }
        Ok(outcome)
    }

    fn demultiplex(&mut self, rnti: Rnti, payload: &[u8], rlc: &mut dyn RlcInterface) -> Result<(), LayerError> {
        let subpdus = pdu::parse_pdu(payload).map_err(|e| {
            warn!(
                "Malformed UL PDU rnti={}: {}",
                rnti,
                bytes_to_hex(&payload[..payload.len().min(16)])
            );
            e
        })?;
        for subpdu in subpdus {
            match subpdu {
                MacSubPdu::Sdu { lcid, data } => rlc.deliver_sdu(rnti, lcid, data),
                MacSubPdu::Bsr { format, body } => self.handle_bsr(rnti, format, &body)?,
                MacSubPdu::Padding(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::config::RbgSizeConfig;
    use crate::mac::harq::HarqState;
    use crate::mac::strategy::AllocationStrategy;
    use crate::rlc::RlcQueues;
    use common::types::{DuplexMode, SubcarrierSpacing, TddPattern};
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingPhy {
        pdsch: Vec<PdschRequest>,
        pusch: Vec<PuschRequest>,
    }

    impl PhyInterface for RecordingPhy {
        fn transmit(&mut self, request: PdschRequest) -> Result<(), LayerError> {
            self.pdsch.push(request);
            Ok(())
        }

        fn request_reception(&mut self, request: PuschRequest) -> Result<(), LayerError> {
            self.pusch.push(request);
            Ok(())
        }
    }

    /// Endless DL backlog
    struct BacklogRlc;

    impl RlcInterface for BacklogRlc {
        fn deliver_sdu(&mut self, _rnti: Rnti, _lcid: u8, _sdu: Bytes) {}

        fn report_buffer_status(&self, _rnti: Rnti) -> u32 {
            1_000_000
        }

        fn fetch_sdus(&mut self, rnti: Rnti, max_bytes: usize) -> Vec<Bytes> {
            vec![Bytes::from(vec![rnti.value() as u8; max_bytes])]
        }
    }

    /// Drives the scheduler slot by slot and loops results straight back
    struct Harness {
        mac: MacScheduler,
        phy: RecordingPhy,
        rlc: BacklogRlc,
        dl_ack: bool,
        ul_crc_ok: bool,
        /// (feedback slot, rnti, harq_id)
        feedback_due: Vec<(u64, Rnti, u8)>,
        pdsch_log: Vec<PdschRequest>,
        pusch_log: Vec<PuschRequest>,
    }

    impl Harness {
        fn new(config: MacConfig) -> Self {
            Self {
                mac: MacScheduler::new(config).unwrap(),
                phy: RecordingPhy::default(),
                rlc: BacklogRlc,
                dl_ack: true,
                ul_crc_ok: true,
                feedback_due: Vec::new(),
                pdsch_log: Vec::new(),
                pusch_log: Vec::new(),
            }
        }

        fn step(&mut self) -> Vec<Grant> {
            let now = self.mac.timing().absolute_slot();
            let mut feedback: HashMap<Rnti, PdschFeedback> = HashMap::new();
            let num_harq = self.mac.config().num_harq_processes as usize;
            for &(_, rnti, harq_id) in self.feedback_due.iter().filter(|(slot, _, _)| *slot == now) {
                feedback
                    .entry(rnti)
                    .or_insert_with(|| PdschFeedback::new(rnti, num_harq))
                    .set(harq_id, self.dl_ack);
            }
            self.feedback_due.retain(|(slot, _, _)| *slot != now);
            for report in feedback.values() {
                self.mac.handle_dl_feedback(report).unwrap();
            }

            let grants = self.mac.tick(&mut self.phy, &mut self.rlc).unwrap();
            for grant in grants.iter().filter(|g| g.direction == LinkDirection::Downlink) {
                let k1 = grant.feedback_slot_offset.unwrap() as u64;
                self.feedback_due
                    .push((now + grant.slot_offset as u64 + k1, grant.rnti, grant.harq_id));
            }

            self.pdsch_log.append(&mut self.phy.pdsch);
            for request in std::mem::take(&mut self.phy.pusch) {
                let indication = PuschIndication {
                    rnti: request.params.rnti,
                    harq_id: request.params.harq_id,
                    crc_ok: self.ul_crc_ok,
                    payload: None,
                };
                self.mac.handle_rx_indication(indication, &mut self.rlc).unwrap();
                self.pusch_log.push(request);
            }
            grants
        }
    }

    fn fdd_config(num_ues: u16, strategy: AllocationStrategy) -> MacConfig {
        MacConfig {
            num_ues,
            num_rbs: 100,
            rbg_size: RbgSizeConfig::Explicit(4),
            strategy,
            ..MacConfig::default()
        }
    }

    fn dl(grants: &[Grant]) -> Vec<&Grant> {
        grants.iter().filter(|g| g.direction == LinkDirection::Downlink).collect()
    }

    fn assert_disjoint(grants: &[&Grant]) {
        for (i, a) in grants.iter().enumerate() {
            for b in &grants[i + 1..] {
                assert!(a.rbg_allocation.is_disjoint(&b.rbg_allocation), "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_round_robin_equal_rbg_share() {
        let mut config = fdd_config(4, AllocationStrategy::RoundRobin);
        config.dl_rb_limit = 4;
        let mut harness = Harness::new(config);
        assert_eq!(harness.mac.num_rbgs(), 25);

        let mut rbgs = [0usize; 4];
        for _ in 0..25 {
            for grant in dl(&harness.step()) {
                rbgs[grant.rnti.ue_index().unwrap()] += grant.rbg_allocation.count_ones();
            }
        }
        assert_eq!(rbgs, [25; 4]);
    }

    #[test]
    fn test_rbgs_disjoint_in_every_slot() {
        for strategy in [
            AllocationStrategy::RoundRobin,
            AllocationStrategy::ProportionalFair,
            AllocationStrategy::BestCqi,
        ] {
            let mut config = fdd_config(6, strategy);
            config.dl_rb_limit = 24;
            config.ul_rb_limit = 16;
            let mut harness = Harness::new(config);
            for ue in 1..=6u16 {
                let cqi: Vec<u8> = (0..100).map(|rb| ((rb + ue * 3) % 16) as u8).collect();
                harness
                    .mac
                    .handle_cqi(&CqiReport { rnti: Rnti(ue), direction: LinkDirection::Downlink, cqi })
                    .unwrap();
                harness
                    .mac
                    .handle_bsr(Rnti(ue), BsrFormat::Short, &bsr::encode_short(0, 50_000))
                    .unwrap();
            }
            for _ in 0..20 {
                let grants = harness.step();
                assert_disjoint(&dl(&grants));
                let ul: Vec<&Grant> = grants.iter().filter(|g| g.direction == LinkDirection::Uplink).collect();
                assert_disjoint(&ul);
            }
        }
    }

    #[test]
    fn test_rb_limit_caps_new_transmissions() {
        let mut config = fdd_config(2, AllocationStrategy::BestCqi);
        config.dl_rb_limit = 10;
        let mut harness = Harness::new(config);
        let grants = harness.step();
        for grant in dl(&grants) {
            // 10 RBs allow two RBGs of 4
            assert_eq!(grant.rbg_allocation.count_ones(), 2);
        }
    }

    #[test]
    fn test_pf_prefers_better_channel_then_shares() {
        let mut harness = Harness::new(fdd_config(2, AllocationStrategy::ProportionalFair));
        for (ue, cqi) in [(1u16, 15u8), (2, 5)] {
            harness
                .mac
                .handle_cqi(&CqiReport {
                    rnti: Rnti(ue),
                    direction: LinkDirection::Downlink,
                    cqi: vec![cqi; 100],
                })
                .unwrap();
        }

        let first = harness.step();
        let first_dl = dl(&first);
        assert_eq!(first_dl.len(), 1);
        assert_eq!(first_dl[0].rnti, Rnti(1));

        let mut low_cqi_served = false;
        for _ in 0..10 {
            if dl(&harness.step()).iter().any(|g| g.rnti == Rnti(2)) {
                low_cqi_served = true;
                break;
            }
        }
        assert!(low_cqi_served);
        assert!(harness.mac.served_rate(Rnti(1), LinkDirection::Downlink).unwrap() > MIN_SERVED_RATE);
    }

    #[test]
    fn test_dl_retransmission_keeps_ndi_and_cycles_rv() {
        let mut harness = Harness::new(fdd_config(1, AllocationStrategy::RoundRobin));
        harness.dl_ack = false;

        let mut attempts = Vec::new();
        for _ in 0..5 {
            for grant in dl(&harness.step()) {
                if grant.harq_id == 0 {
                    attempts.push((grant.ndi, grant.rv, grant.mcs, grant.rbg_allocation.count_ones()));
                }
            }
        }
        assert_eq!(attempts.len(), 5);
        let rvs: Vec<u8> = attempts.iter().map(|a| a.1).collect();
        assert_eq!(rvs, vec![0, 2, 3, 1, 0]);
        assert!(attempts.iter().all(|a| a.0 == attempts[0].0));
        assert!(attempts.iter().all(|a| (a.2, a.3) == (attempts[0].2, attempts[0].3)));

        // Every attempt carries the same MAC PDU
        let payloads: Vec<&Bytes> = harness
            .pdsch_log
            .iter()
            .filter(|r| r.params.harq_id == 0)
            .map(|r| &r.payload)
            .collect();
        assert!(payloads.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(payloads[0].len() as u32, harness.pdsch_log[0].params.tbs);

        let dl_stats = harness.mac.stats().ue(Rnti(1)).unwrap().downlink;
        assert_eq!(dl_stats.soft_buffer_flushes, 1);
        assert_eq!(dl_stats.retransmissions, 4);
    }

    #[test]
    fn test_ack_releases_process_and_toggles_ndi() {
        let mut config = fdd_config(1, AllocationStrategy::RoundRobin);
        config.num_harq_processes = 1;
        let mut harness = Harness::new(config);

        let first = dl(&harness.step())[0].clone();
        // Process busy until the ACK arrives at K1 = 1
        let second = dl(&harness.step())[0].clone();
        assert_eq!(first.harq_id, second.harq_id);
        assert_ne!(first.ndi, second.ndi);
        assert_eq!(second.rv, 0);
        assert_eq!(first.feedback_slot_offset, Some(1));
    }

    #[test]
    fn test_harq_exhaustion_blocks_new_data() {
        let mut config = fdd_config(1, AllocationStrategy::RoundRobin);
        config.num_harq_processes = 2;
        config.min_feedback_slots = 4;
        let mut harness = Harness::new(config);

        let counts: Vec<usize> = (0..4).map(|_| dl(&harness.step()).len()).collect();
        assert_eq!(counts, vec![1, 1, 0, 0]);
        assert_eq!(
            harness.mac.harq().process(Rnti(1), LinkDirection::Downlink, 0).unwrap().state(),
            HarqState::AwaitingResult
        );
    }

    #[test]
    fn test_uplink_grant_lead_and_retransmission() {
        let mut harness = Harness::new(fdd_config(1, AllocationStrategy::RoundRobin));
        harness.ul_crc_ok = false;
        harness
            .mac
            .handle_bsr(Rnti(1), BsrFormat::Short, &bsr::encode_short(0, 1000))
            .unwrap();

        let grants = harness.step();
        let ul: Vec<&Grant> = grants.iter().filter(|g| g.direction == LinkDirection::Uplink).collect();
        assert_eq!(ul.len(), 1);
        assert_eq!(ul[0].slot_offset, harness.mac.ul_lead_slots());
        assert_eq!(ul[0].feedback_slot_offset, None);
        assert!(harness.pusch_log.is_empty());
        let first = ul[0].clone();

        // PUSCH at slot 1 fails after the slot 1 run; the retransmission
        // keeps the NDI and is granted in slot 2
        let grants = harness.step();
        assert_eq!(harness.pusch_log.len(), 1);
        assert_eq!(harness.pusch_log[0].params.slot, 1);
        assert!(grants.iter().all(|g| g.direction == LinkDirection::Downlink));
        assert_eq!(harness.mac.stats().ue(Rnti(1)).unwrap().uplink.nacks, 1);

        let grants = harness.step();
        let retx: Vec<&Grant> = grants.iter().filter(|g| g.direction == LinkDirection::Uplink).collect();
        assert_eq!(retx.len(), 1);
        assert_eq!(retx[0].harq_id, first.harq_id);
        assert_eq!(retx[0].ndi, first.ndi);
        assert_eq!(retx[0].rv, 2);
        assert_eq!(retx[0].rbg_allocation, first.rbg_allocation);
    }

    #[test]
    fn test_no_uplink_grant_without_buffer() {
        let mut harness = Harness::new(fdd_config(2, AllocationStrategy::RoundRobin));
        let grants = harness.step();
        assert!(grants.iter().all(|g| g.direction == LinkDirection::Downlink));
    }

    #[test]
    fn test_new_grant_consumes_buffer_estimate() {
        let mut harness = Harness::new(fdd_config(1, AllocationStrategy::RoundRobin));
        harness
            .mac
            .handle_bsr(Rnti(1), BsrFormat::Short, &bsr::encode_short(0, 20))
            .unwrap();
        let grants = harness.step();
        let ul: Vec<&Grant> = grants.iter().filter(|g| g.direction == LinkDirection::Uplink).collect();
        // A single RBG covers 20 bytes
        assert_eq!(ul[0].rbg_allocation.count_ones(), 1);
        assert_eq!(harness.mac.buffer(Rnti(1), LinkDirection::Uplink), Some(0));
    }

    #[test]
    fn test_tdd_directions_and_feedback_offsets() {
        let config = MacConfig {
            num_ues: 1,
            num_rbs: 51,
            ul_rb_limit: 51,
            dl_rb_limit: 51,
            scs: SubcarrierSpacing::Scs30,
            duplex: DuplexMode::Tdd(TddPattern {
                periodicity_slots: 5,
                num_dl_slots: 3,
                num_dl_symbols: 10,
                num_ul_symbols: 2,
                num_ul_slots: 1,
            }),
            ..MacConfig::default()
        };
        let mut harness = Harness::new(config);
        assert_eq!(harness.mac.feedback_offset(0), Some(3));
        assert_eq!(harness.mac.feedback_offset(3), Some(1));
        assert_eq!(harness.mac.feedback_offset(4), Some(4));
        harness
            .mac
            .handle_bsr(Rnti(1), BsrFormat::Short, &bsr::encode_short(0, 100_000))
            .unwrap();

        let mut by_slot = Vec::new();
        for _ in 0..5 {
            by_slot.push(harness.step());
        }
        // Slot 4 is uplink only
        assert!(dl(&by_slot[4]).is_empty());
        let special = dl(&by_slot[3]);
        assert_eq!((special[0].start_symbol, special[0].num_symbols), (0, 10));

        // UL lead is one slot: issued in slot 2 for the special slot's UL symbols
        let ul_special: Vec<&Grant> = by_slot[2]
            .iter()
            .filter(|g| g.direction == LinkDirection::Uplink)
            .collect();
        assert_eq!((ul_special[0].start_symbol, ul_special[0].num_symbols), (12, 2));
        assert!(by_slot[0].iter().all(|g| g.direction == LinkDirection::Downlink));
    }

    #[test]
    fn test_symbol_ticks_match_slot_ticks() {
        let mut config = fdd_config(2, AllocationStrategy::RoundRobin);
        config.tick = TickGranularity::Symbol;
        let mut mac = MacScheduler::new(config).unwrap();
        let mut phy = RecordingPhy::default();
        let mut rlc = BacklogRlc;

        let mut grants = Vec::new();
        for _ in 0..SYMBOLS_PER_SLOT {
            grants.extend(mac.tick(&mut phy, &mut rlc).unwrap());
        }
        assert_eq!(mac.timing().absolute_slot(), 1);
        assert_eq!(dl(&grants).len(), 2);
        assert_eq!(phy.pdsch.len(), 2);
    }

    #[test]
    fn test_unexpected_feedback_is_not_internal() {
        let mut harness = Harness::new(fdd_config(1, AllocationStrategy::RoundRobin));
        let mut feedback = PdschFeedback::new(Rnti(1), 16);
        feedback.set(5, true);
        let err = harness.mac.handle_dl_feedback(&feedback).unwrap_err();
        assert!(matches!(err, LayerError::UnexpectedFeedback { harq_id: 5, .. }));
        assert!(!err.is_internal());

        let err = harness
            .mac
            .handle_rx_indication(
                PuschIndication { rnti: Rnti(1), harq_id: 0, crc_ok: true, payload: None },
                &mut BacklogRlc,
            )
            .unwrap_err();
        assert!(matches!(err, LayerError::UnmatchedReception { .. }));

        assert!(matches!(
            harness.mac.handle_bsr(Rnti(7), BsrFormat::Short, &[0]),
            Err(LayerError::UnknownUe(_))
        ));
    }

    #[test]
    fn test_rejects_horizon_beyond_frame() {
        let config = MacConfig {
            scheduling_periodicity: 10,
            ..MacConfig::default()
        };
        assert!(matches!(
            MacScheduler::new(config),
            Err(LayerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_irregular_last_rbg() {
        let config = MacConfig {
            num_ues: 1,
            num_rbs: 50,
            ul_rb_limit: 50,
            dl_rb_limit: 50,
            rbg_size: RbgSizeConfig::Explicit(8),
            ..MacConfig::default()
        };
        let mut harness = Harness::new(config);
        assert_eq!(harness.mac.num_rbgs(), 7);
        assert_eq!(harness.mac.rbg_resource_blocks(6), 48..50);
        assert_eq!(harness.mac.rbg_resource_blocks(0), 0..8);

        // The backlog takes every RBG; size follows the 50 RBs actually granted
        let grant = dl(&harness.step())[0].clone();
        assert_eq!(grant.rbg_allocation.count_ones(), 7);
        let pdsch = &harness.pdsch_log[0];
        assert_eq!(pdsch.params.resource_blocks, (0..50).collect::<Vec<u16>>());
        let link = harness.mac.link_adaptation();
        assert_eq!(pdsch.params.tbs, link.transport_block_size(grant.mcs, 50, 14, 1));
        assert!(pdsch.params.tbs < link.transport_block_size(grant.mcs, 56, 14, 1));
        assert_eq!(pdsch.payload.len() as u32, pdsch.params.tbs);
    }

    #[test]
    fn test_retransmission_keeps_resource_block_count() {
        let config = MacConfig {
            num_ues: 2,
            num_rbs: 50,
            ul_rb_limit: 50,
            dl_rb_limit: 50,
            rbg_size: RbgSizeConfig::Explicit(8),
            ..MacConfig::default()
        };
        let mut harness = Harness::new(config);
        harness.dl_ack = false;

        let rbs_of = |mac: &MacScheduler, grant: &Grant| -> usize {
            grant
                .rbg_allocation
                .iter_set()
                .map(|rbg| mac.rbg_resource_blocks(rbg).len())
                .sum()
        };
        let first: HashMap<(Rnti, u8), usize> = dl(&harness.step())
            .into_iter()
            .map(|g| ((g.rnti, g.harq_id), rbs_of(&harness.mac, g)))
            .collect();
        assert_eq!(first.len(), 2);
        assert_eq!(first.values().sum::<usize>(), 50);

        for _ in 0..3 {
            let grants = harness.step();
            let retx = dl(&grants);
            assert_eq!(retx.len(), 2);
            for grant in retx {
                assert_ne!(grant.rv, 0);
                assert_eq!(rbs_of(&harness.mac, grant), first[&(grant.rnti, grant.harq_id)]);
            }
        }
    }

    #[test]
    fn test_dl_lead_does_not_regrant_queued_bytes() {
        let mut config = fdd_config(1, AllocationStrategy::RoundRobin);
        config.dl_lead_slots = 2;
        let mut mac = MacScheduler::new(config).unwrap();
        let mut phy = RecordingPhy::default();
        let mut rlc = RlcQueues::new(1);
        rlc.enqueue(Rnti(1), Bytes::from(vec![3u8; 100]));

        let mut grants = Vec::new();
        for _ in 0..6 {
            grants.extend(mac.tick(&mut phy, &mut rlc).unwrap());
        }
        let dl_grants = dl(&grants);
        assert_eq!(dl_grants.len(), 1);
        assert_eq!(dl_grants[0].slot_offset, 2);
        assert_eq!(phy.pdsch.len(), 1);
        assert_eq!(phy.pdsch[0].params.slot, 2);

        let sdu_bytes: usize = pdu::parse_pdu(&phy.pdsch[0].payload)
            .unwrap()
            .into_iter()
            .map(|subpdu| match subpdu {
                MacSubPdu::Sdu { data, .. } => data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(sdu_bytes, 100);
        assert_eq!(rlc.report_buffer_status(Rnti(1)), 0);
        assert_eq!(mac.buffer(Rnti(1), LinkDirection::Downlink), Some(0));
    }

    #[test]
    fn test_short_tdd_ul_part_skipped_below_minimum_tti() {
        let config = MacConfig {
            num_ues: 1,
            num_rbs: 51,
            ul_rb_limit: 51,
            dl_rb_limit: 51,
            scs: SubcarrierSpacing::Scs30,
            num_dmrs_symbols: 2,
            min_tti_symbols: 3,
            duplex: DuplexMode::Tdd(TddPattern {
                periodicity_slots: 5,
                num_dl_slots: 3,
                num_dl_symbols: 10,
                num_ul_symbols: 2,
                num_ul_slots: 1,
            }),
            ..MacConfig::default()
        };
        let mut harness = Harness::new(config);
        harness
            .mac
            .handle_bsr(Rnti(1), BsrFormat::Short, &bsr::encode_short(0, 1000))
            .unwrap();

        let mut ul = Vec::new();
        for _ in 0..10 {
            ul.extend(
                harness
                    .step()
                    .into_iter()
                    .filter(|g| g.direction == LinkDirection::Uplink),
            );
        }
        assert!(!ul.is_empty());
        assert!(ul.iter().all(|g| g.num_symbols == 14));
        assert!(harness.pusch_log.iter().all(|r| r.params.slot % 5 == 4 && r.params.tbs > 0));
    }

    #[test]
    fn test_served_rate_decays_without_direction_symbols() {
        let config = MacConfig {
            num_ues: 1,
            num_rbs: 51,
            ul_rb_limit: 51,
            dl_rb_limit: 51,
            scs: SubcarrierSpacing::Scs30,
            strategy: AllocationStrategy::ProportionalFair,
            served_rate_alpha: 0.5,
            duplex: DuplexMode::Tdd(TddPattern {
                periodicity_slots: 5,
                num_dl_slots: 3,
                num_dl_symbols: 10,
                num_ul_symbols: 2,
                num_ul_slots: 1,
            }),
            ..MacConfig::default()
        };
        let mut harness = Harness::new(config);

        // Slots 0..=3 carry DL; slot 4 is uplink only
        for _ in 0..4 {
            assert_eq!(dl(&harness.step()).len(), 1);
        }
        let served = harness.mac.served_rate(Rnti(1), LinkDirection::Downlink).unwrap();
        assert!(served > 1000.0);

        assert!(dl(&harness.step()).is_empty());
        let decayed = harness.mac.served_rate(Rnti(1), LinkDirection::Downlink).unwrap();
        assert!((decayed - served * 0.5).abs() < 1e-6);
    }
}
