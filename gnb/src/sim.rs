//! Lock-step Cell Simulation
//!
//! Drives one `MacScheduler` against synthetic collaborators: a loopback PHY
//! whose CRC outcomes follow each UE's BLER, transparent RLC queues, and UE
//! models that generate traffic, report CQI and buffer status over the
//! control channel and return HARQ feedback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use common::types::{LinkDirection, Rnti};
use interfaces::control_channel::{ChannelStats, ControlChannel};
use interfaces::message_types::{BsrFormat, BufferStatusReport, ControlMessage, CqiReport, PdschFeedback};
use layers::mac::bsr::{self, LcgBuffer, SHORT_BSR_OVERFLOW};
use layers::mac::link_adaptation::MAX_CQI;
use layers::mac::pdu::{parse_pdu, MacPduBuilder, MacSubPdu, LCID_DRB};
use layers::mac::{HarqOutcome, MacScheduler, MacStats};
use layers::phy::{PdschRequest, PhyInterface, PuschIndication, PuschRequest};
use layers::rlc::RlcQueues;
use layers::LayerError;

use crate::config::{SimConfig, UeProfile};

/// Holds PHY requests until the simulation resolves them after each tick
#[derive(Debug, Default)]
struct LoopbackPhy {
    pdsch: Vec<PdschRequest>,
    pusch: Vec<PuschRequest>,
}

impl PhyInterface for LoopbackPhy {
    fn transmit(&mut self, request: PdschRequest) -> Result<(), LayerError> {
        self.pdsch.push(request);
        Ok(())
    }

    fn request_reception(&mut self, request: PuschRequest) -> Result<(), LayerError> {
        self.pusch.push(request);
        Ok(())
    }
}

/// UE side of the simulation
#[derive(Debug)]
struct UeModel {
    rnti: Rnti,
    profile: UeProfile,
    /// UL bytes waiting at the UE
    ul_queue: u64,
    ul_carry: f64,
    dl_carry: f64,
    /// Last PUSCH PDU per HARQ process, with its NDI
    ul_harq: Vec<Option<(bool, Bytes)>>,
    /// K1 of announced DL grants by (PDSCH slot, harq_id)
    dl_grants: HashMap<(u64, u8), u8>,
    /// (feedback slot, harq_id, ack)
    pending_feedback: Vec<(u64, u8, bool)>,
    dl_offered_bytes: u64,
    dl_delivered_bytes: u64,
    ul_offered_bytes: u64,
}

impl UeModel {
    fn new(rnti: Rnti, profile: UeProfile, num_harq: usize) -> Self {
        Self {
            rnti,
            profile,
            ul_queue: 0,
            ul_carry: 0.0,
            dl_carry: 0.0,
            ul_harq: vec![None; num_harq],
            dl_grants: HashMap::new(),
            pending_feedback: Vec::new(),
            dl_offered_bytes: 0,
            dl_delivered_bytes: 0,
            ul_offered_bytes: 0,
        }
    }

    /// Build a new UL MAC PDU: one SDU from the UE queue, then a BSR for
    /// what is left
    fn build_ul_pdu(&mut self, tbs: usize) -> Bytes {
        let mut builder = MacPduBuilder::new(tbs);
        let budget = builder.max_sdu_len().saturating_sub(2);
        let sdu_len = self.ul_queue.min(budget as u64) as usize;
        if sdu_len > 0 && builder.add_sdu(LCID_DRB, &vec![self.rnti.value() as u8; sdu_len]) {
            self.ul_queue -= sdu_len as u64;
        }

        let (format, body) = bsr_body(self.ul_queue);
        if !builder.add_bsr(format, &body) {
            trace!("No room for a BSR in a {}-byte PUSCH of rnti={}", tbs, self.rnti);
        }
        builder.finish()
    }
}

/// Short BSR while the table covers the queue, long BSR beyond
fn bsr_body(queued: u64) -> (BsrFormat, Vec<u8>) {
    let bytes = queued.min(u32::MAX as u64) as u32;
    if bsr::short_bsr_index(bytes) < SHORT_BSR_OVERFLOW {
        (BsrFormat::Short, bsr::encode_short(0, bytes))
    } else {
        (BsrFormat::Long, bsr::encode_long(&[LcgBuffer { lcg: 0, bytes }]))
    }
}

/// Per-UE results
#[derive(Debug, Clone, Serialize)]
pub struct UeReport {
    pub rnti: Rnti,
    pub dl_offered_bytes: u64,
    pub dl_delivered_bytes: u64,
    pub dl_throughput_mbps: f64,
    pub dl_bler: f64,
    pub ul_offered_bytes: u64,
    pub ul_delivered_bytes: u64,
    pub ul_throughput_mbps: f64,
    pub ul_bler: f64,
}

/// Results of a run
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub slots: u64,
    pub duration_ms: f64,
    pub strategy: String,
    pub ues: Vec<UeReport>,
    pub mac: MacStats,
    pub control: ChannelStats,
}

/// One cell and its UEs
pub struct Simulation {
    config: SimConfig,
    mac: MacScheduler,
    phy: LoopbackPhy,
    rlc: RlcQueues,
    channel: ControlChannel,
    ues: Vec<UeModel>,
    rng: StdRng,
    slot_ms: f64,
    slots_run: u64,
}

impl Simulation {
    pub fn new(config: SimConfig) -> anyhow::Result<Self> {
        let mac_config = config.to_mac_config()?;
        let slot_ms = mac_config.scs.slot_duration_ms();
        let num_harq = mac_config.num_harq_processes as usize;
        let mac = MacScheduler::new(mac_config).context("Scheduler setup failed")?;

        let ues: Vec<UeModel> = config
            .ue_profiles()
            .into_iter()
            .enumerate()
            .map(|(i, profile)| UeModel::new(Rnti::from_ue_index(i), profile, num_harq))
            .collect();
        info!(
            "Simulation: {} UEs, {} RBGs, seed {}",
            ues.len(),
            mac.num_rbgs(),
            config.simulation.seed
        );

        Ok(Self {
            rlc: RlcQueues::new(ues.len()),
            rng: StdRng::seed_from_u64(config.simulation.seed),
            mac,
            phy: LoopbackPhy::default(),
            channel: ControlChannel::new(),
            ues,
            slot_ms,
            slots_run: 0,
            config,
        })
    }

    /// Run `slots` slots or until `stop` is raised
    pub fn run(&mut self, slots: u64, stop: &AtomicBool) -> anyhow::Result<SimReport> {
        for _ in 0..slots {
            if stop.load(Ordering::Relaxed) {
                warn!("Simulation stopped after {} slots", self.slots_run);
                break;
            }
            self.step()?;
            if self.slots_run % 1000 == 0 {
                let dl = self.mac.stats().totals(LinkDirection::Downlink);
                info!(
                    "Slot {}: DL {} new / {} retx, BLER {:.3}",
                    self.slots_run,
                    dl.new_transmissions,
                    dl.retransmissions,
                    dl.bler()
                );
            }
        }
        Ok(self.report())
    }

    /// Advance one slot
    pub fn step(&mut self) -> anyhow::Result<()> {
        let now = self.mac.timing().absolute_slot();
        self.generate_traffic();
        self.send_ue_reports(now)?;
        self.deliver_control()?;

        // One tick per slot, or one per symbol
        while self.mac.timing().absolute_slot() == now {
            let grants = self.mac.tick(&mut self.phy, &mut self.rlc)?;
            for grant in grants {
                self.channel.send_to_ue(&ControlMessage::from_grant(grant))?;
            }
            self.receive_grants(now)?;
            self.resolve_pdsch(now);
            self.resolve_pusch()?;
        }
        self.slots_run += 1;
        Ok(())
    }

    fn generate_traffic(&mut self) {
        let sdu_size = self.config.simulation.sdu_size.max(1);
        for ue in self.ues.iter_mut() {
            ue.dl_carry += ue.profile.dl_rate_kbps as f64 * self.slot_ms / 8.0;
            let mut dl_bytes = ue.dl_carry.floor() as usize;
            ue.dl_carry -= dl_bytes as f64;
            ue.dl_offered_bytes += dl_bytes as u64;
            while dl_bytes > 0 {
                let len = dl_bytes.min(sdu_size);
                self.rlc.enqueue(ue.rnti, Bytes::from(vec![ue.rnti.value() as u8; len]));
                dl_bytes -= len;
            }

            ue.ul_carry += ue.profile.ul_rate_kbps as f64 * self.slot_ms / 8.0;
            let ul_bytes = ue.ul_carry.floor();
            ue.ul_carry -= ul_bytes;
            ue.ul_queue += ul_bytes as u64;
            ue.ul_offered_bytes += ul_bytes as u64;
        }
    }

    /// HARQ feedback due now, periodic CQI and periodic BSR
    fn send_ue_reports(&mut self, now: u64) -> anyhow::Result<()> {
        let num_harq = self.mac.config().num_harq_processes as usize;
        let num_rbs = self.mac.config().num_rbs as usize;
        let cqi_period = self.config.simulation.cqi_period_slots.max(1);
        let bsr_period = self.config.simulation.bsr_period_slots.max(1);

        for (i, ue) in self.ues.iter_mut().enumerate() {
            let due: Vec<(u8, bool)> = ue
                .pending_feedback
                .iter()
                .filter(|(slot, _, _)| *slot == now)
                .map(|&(_, harq_id, ack)| (harq_id, ack))
                .collect();
            if !due.is_empty() {
                ue.pending_feedback.retain(|(slot, _, _)| *slot != now);
                let mut feedback = PdschFeedback::new(ue.rnti, num_harq);
                for (harq_id, ack) in due {
                    feedback.set(harq_id, ack);
                }
                self.channel.send_to_gnb(&ControlMessage::PdschFeedback(feedback))?;
            }

            // Reports are staggered across UEs
            if now % cqi_period == i as u64 % cqi_period {
                for (direction, mean) in [
                    (LinkDirection::Downlink, ue.profile.dl_cqi),
                    (LinkDirection::Uplink, ue.profile.ul_cqi),
                ] {
                    let cqi: Vec<u8> = (0..num_rbs)
                        .map(|_| {
                            let jitter: i16 = self.rng.gen_range(-1..=1);
                            (mean as i16 + jitter).clamp(0, MAX_CQI as i16) as u8
                        })
                        .collect();
                    self.channel.send_to_gnb(&ControlMessage::Cqi(CqiReport {
                        rnti: ue.rnti,
                        direction,
                        cqi,
                    }))?;
                }
            }

            if ue.ul_queue > 0 && now % bsr_period == i as u64 % bsr_period {
                let (format, payload) = bsr_body(ue.ul_queue);
                self.channel.send_to_gnb(&ControlMessage::BufferStatus(BufferStatusReport {
                    rnti: ue.rnti,
                    format,
                    payload,
                }))?;
            }
        }
        Ok(())
    }

    /// gNB side of the control channel
    fn deliver_control(&mut self) -> anyhow::Result<()> {
        for message in self.channel.receive_at_gnb()? {
            if let Err(e) = self.mac.handle_control(message) {
                if e.is_internal() {
                    error!("Scheduler invariant violated: {}", e);
                    return Err(e.into());
                }
                warn!("Control message rejected: {}", e);
            }
        }
        Ok(())
    }

    /// UE side of the control channel
    fn receive_grants(&mut self, now: u64) -> anyhow::Result<()> {
        for message in self.channel.receive_at_ue()? {
            match message {
                ControlMessage::DownlinkGrant(grant) => {
                    let Some(ue) = grant.rnti.ue_index().and_then(|ue| self.ues.get_mut(ue)) else {
                        warn!("DL grant for unknown rnti={}", grant.rnti);
                        continue;
                    };
                    match grant.feedback_slot_offset {
                        Some(k1) => {
                            ue.dl_grants
                                .insert((now + grant.slot_offset as u64, grant.harq_id), k1);
                        }
                        None => warn!("DL grant for rnti={} without a feedback slot", grant.rnti),
                    }
                }
                ControlMessage::UplinkGrant(grant) => {
                    trace!("UL grant rnti={} harq_id={} ndi={}", grant.rnti, grant.harq_id, grant.ndi);
                }
                other => warn!("Unexpected message towards rnti={}", other.rnti()),
            }
        }
        Ok(())
    }

    fn resolve_pdsch(&mut self, now: u64) {
        for request in std::mem::take(&mut self.phy.pdsch) {
            let params = request.params;
            let Some(ue) = params.rnti.ue_index().and_then(|ue| self.ues.get_mut(ue)) else {
                continue;
            };
            let ack = self.rng.gen::<f64>() >= ue.profile.bler;
            if ack {
                match parse_pdu(&request.payload) {
                    Ok(subpdus) => {
                        for subpdu in subpdus {
                            if let MacSubPdu::Sdu { data, .. } = subpdu {
                                ue.dl_delivered_bytes += data.len() as u64;
                            }
                        }
                    }
                    Err(e) => warn!("rnti={} cannot parse DL PDU: {}", ue.rnti, e),
                }
            }

            match ue.dl_grants.remove(&(now, params.harq_id)) {
                Some(k1) => ue.pending_feedback.push((now + k1 as u64, params.harq_id, ack)),
                None => warn!("PDSCH for rnti={} harq_id={} without a grant", ue.rnti, params.harq_id),
            }
        }
    }

    fn resolve_pusch(&mut self) -> anyhow::Result<()> {
        for request in std::mem::take(&mut self.phy.pusch) {
            let params = request.params;
            let Some(ue) = params.rnti.ue_index().and_then(|ue| self.ues.get_mut(ue)) else {
                continue;
            };
            let harq = params.harq_id as usize;

            let payload = match ue.ul_harq.get(harq).cloned().flatten() {
                Some((ndi, payload)) if ndi == params.ndi => payload,
                _ => {
                    let payload = ue.build_ul_pdu(params.tbs as usize);
                    if let Some(entry) = ue.ul_harq.get_mut(harq) {
                        *entry = Some((params.ndi, payload.clone()));
                    }
                    payload
                }
            };

            let crc_ok = self.rng.gen::<f64>() >= ue.profile.bler;
            let indication = PuschIndication {
                rnti: params.rnti,
                harq_id: params.harq_id,
                crc_ok,
                payload: crc_ok.then_some(payload),
            };
            match self.mac.handle_rx_indication(indication, &mut self.rlc) {
                Ok(HarqOutcome::Dropped) => {
                    debug!("UL TB of rnti={} harq_id={} dropped", params.rnti, params.harq_id)
                }
                Ok(_) => {}
                Err(e) if e.is_internal() => {
                    error!("Scheduler invariant violated: {}", e);
                    return Err(e.into());
                }
                Err(e) => warn!("PUSCH result rejected: {}", e),
            }
        }
        Ok(())
    }

    pub fn report(&self) -> SimReport {
        let duration_ms = self.slots_run as f64 * self.slot_ms;
        let mbps = |bytes: u64| {
            if duration_ms > 0.0 {
                bytes as f64 * 8.0 / (duration_ms * 1000.0)
            } else {
                0.0
            }
        };
        let stats = self.mac.stats();

        let ues = self
            .ues
            .iter()
            .map(|ue| {
                let (_, ul_delivered_bytes) = self.rlc.delivered(ue.rnti);
                let mac = stats.ue(ue.rnti);
                UeReport {
                    rnti: ue.rnti,
                    dl_offered_bytes: ue.dl_offered_bytes,
                    dl_delivered_bytes: ue.dl_delivered_bytes,
                    dl_throughput_mbps: mbps(ue.dl_delivered_bytes),
                    dl_bler: mac.map(|s| s.downlink.bler()).unwrap_or(0.0),
                    ul_offered_bytes: ue.ul_offered_bytes,
                    ul_delivered_bytes,
                    ul_throughput_mbps: mbps(ul_delivered_bytes),
                    ul_bler: mac.map(|s| s.uplink.bler()).unwrap_or(0.0),
                }
            })
            .collect();

        SimReport {
            slots: self.slots_run,
            duration_ms,
            strategy: self.mac.config().strategy.to_string(),
            ues,
            mac: stats.clone(),
            control: self.channel.stats(),
        }
    }
}

/// Run a simulation on the blocking pool
pub fn spawn(config: SimConfig, slots: u64, stop: Arc<AtomicBool>) -> JoinHandle<anyhow::Result<SimReport>> {
    tokio::task::spawn_blocking(move || {
        let mut simulation = Simulation::new(config)?;
        simulation.run(slots, &stop)
    })
}
