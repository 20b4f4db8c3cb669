//! HARQ Process Bank
//!
//! Per-UE, per-direction HARQ processes (TS 38.321 5.3.2 / 5.4.2). Each
//! process carries the last NDI, the transport block size, the redundancy
//! version position and whether it waits for a result or a retransmission.

use crate::LayerError;
use bytes::Bytes;
use common::types::{LinkDirection, Rnti};
use serde::Serialize;
use tracing::{debug, warn};

/// Maximum configurable HARQ processes per UE and direction
pub const MAX_HARQ_PROCESSES: u8 = 16;

/// Redundancy version order for successive (re)transmissions
pub const RV_SEQUENCE: [u8; 4] = [0, 2, 3, 1];

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HarqState {
    /// Free for a new transmission
    Idle,
    /// Transmission granted, result not yet known
    AwaitingResult,
    /// Last attempt failed, waiting for retransmission resources
    PendingRetransmission,
}

/// Whether a recorded grant carries new data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionKind {
    New,
    Retransmission,
}

/// Result of feeding an ACK/NACK or CRC outcome into a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqOutcome {
    /// Process released
    Success,
    /// Process parked for retransmission at `rv`
    RetransmissionPending { rv: u8, soft_buffer_flushed: bool },
    /// Retransmission limit reached, transport block abandoned
    Dropped,
}

/// One HARQ process
#[derive(Debug, Clone)]
pub struct HarqProcess {
    ndi: bool,
    tbs: u32,
    mcs: u8,
    num_rbgs: usize,
    num_rbs: u16,
    rv_index: usize,
    state: HarqState,
    retransmissions: u8,
    combining_allowed: bool,
    payload: Option<Bytes>,
}

impl HarqProcess {
    fn new() -> Self {
        Self {
            ndi: false,
            tbs: 0,
            mcs: 0,
            num_rbgs: 0,
            num_rbs: 0,
            rv_index: 0,
            state: HarqState::Idle,
            retransmissions: 0,
            combining_allowed: true,
            payload: None,
        }
    }

    /// Last NDI recorded for this process
    pub fn ndi(&self) -> bool {
        self.ndi
    }

    /// Transport block size in bytes of the current transport block
    pub fn tbs(&self) -> u32 {
        self.tbs
    }

    pub fn mcs(&self) -> u8 {
        self.mcs
    }

    /// RBGs used by the first transmission of the current transport block
    pub fn num_rbgs(&self) -> usize {
        self.num_rbgs
    }

    /// Resource blocks used by the first transmission of the current transport block
    pub fn num_rbs(&self) -> u16 {
        self.num_rbs
    }

    /// Redundancy version for the next (re)transmission
    pub fn rv(&self) -> u8 {
        RV_SEQUENCE[self.rv_index]
    }

    pub fn state(&self) -> HarqState {
        self.state
    }

    pub fn retransmissions(&self) -> u8 {
        self.retransmissions
    }

    /// False once the soft buffer was flushed after a failure at the last RV
    pub fn combining_allowed(&self) -> bool {
        self.combining_allowed
    }

    /// MAC PDU kept for retransmission
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }
}

#[derive(Debug, Clone)]
struct HarqEntity {
    processes: Vec<HarqProcess>,
    last_used: Option<u8>,
}

impl HarqEntity {
    fn new(num_processes: u8) -> Self {
        Self {
            processes: (0..num_processes).map(|_| HarqProcess::new()).collect(),
            last_used: None,
        }
    }
}

/// HARQ processes of every UE, `[ue][direction][process]`
#[derive(Debug, Clone)]
pub struct HarqProcessBank {
    entities: Vec<[HarqEntity; 2]>,
    num_processes: u8,
    max_retransmissions: Option<u8>,
}

impl HarqProcessBank {
    pub fn new(num_ues: usize, num_processes: u8, max_retransmissions: Option<u8>) -> Self {
        Self {
            entities: (0..num_ues)
                .map(|_| [HarqEntity::new(num_processes), HarqEntity::new(num_processes)])
                .collect(),
            num_processes,
            max_retransmissions,
        }
    }

    pub fn num_processes(&self) -> u8 {
        self.num_processes
    }

    fn entity(&self, rnti: Rnti, direction: LinkDirection) -> Result<&HarqEntity, LayerError> {
        rnti.ue_index()
            .and_then(|ue| self.entities.get(ue))
            .map(|e| &e[direction.index()])
            .ok_or(LayerError::UnknownUe(rnti))
    }

    fn entity_mut(&mut self, rnti: Rnti, direction: LinkDirection) -> Result<&mut HarqEntity, LayerError> {
        rnti.ue_index()
            .and_then(|ue| self.entities.get_mut(ue))
            .map(|e| &mut e[direction.index()])
            .ok_or(LayerError::UnknownUe(rnti))
    }

    fn process_mut(
        &mut self,
        rnti: Rnti,
        direction: LinkDirection,
        harq_id: u8,
    ) -> Result<&mut HarqProcess, LayerError> {
        self.entity_mut(rnti, direction)?
            .processes
            .get_mut(harq_id as usize)
            .ok_or(LayerError::HarqStateMismatch {
                rnti,
                direction,
                harq_id,
                expected: "configured",
            })
    }

    /// Process state, if the UE and id exist
    pub fn process(&self, rnti: Rnti, direction: LinkDirection, harq_id: u8) -> Option<&HarqProcess> {
        self.entity(rnti, direction)
            .ok()
            .and_then(|e| e.processes.get(harq_id as usize))
    }

    /// Pick an idle process for a new transmission, cycling from the one
    /// after the most recently used. `None` when every process is busy.
    pub fn select_process(&self, rnti: Rnti, direction: LinkDirection) -> Option<u8> {
        let entity = self.entity(rnti, direction).ok()?;
        let n = self.num_processes as usize;
        let start = entity.last_used.map(|id| id as usize + 1).unwrap_or(0);

        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&id| entity.processes[id].state == HarqState::Idle)
            .map(|id| id as u8)
    }

    /// Lowest process id waiting for a retransmission
    pub fn pending_retransmission(&self, rnti: Rnti, direction: LinkDirection) -> Option<u8> {
        let entity = self.entity(rnti, direction).ok()?;
        entity
            .processes
            .iter()
            .position(|p| p.state == HarqState::PendingRetransmission)
            .map(|id| id as u8)
    }

    /// Mark a process as carrying a granted transmission. A differing NDI
    /// starts a new transport block and abandons any previous outcome; an
    /// unchanged NDI is a retransmission of the stored one.
    #[allow(clippy::too_many_arguments)]
    pub fn record_grant(
        &mut self,
        rnti: Rnti,
        direction: LinkDirection,
        harq_id: u8,
        ndi: bool,
        tbs: u32,
        mcs: u8,
        num_rbgs: usize,
        num_rbs: u16,
    ) -> Result<TransmissionKind, LayerError> {
        let process = self.process_mut(rnti, direction, harq_id)?;

        if process.state == HarqState::AwaitingResult {
            return Err(LayerError::HarqStateMismatch {
                rnti,
                direction,
                harq_id,
                expected: "free of outstanding transmissions",
            });
        }

        let kind = if ndi != process.ndi {
            if process.state == HarqState::PendingRetransmission {
                warn!(
                    "{} HARQ rnti={} id={} abandoned pending retransmission for new data",
                    direction, rnti, harq_id
                );
            }
            process.ndi = ndi;
            process.tbs = tbs;
            process.mcs = mcs;
            process.num_rbgs = num_rbgs;
            process.num_rbs = num_rbs;
            process.rv_index = 0;
            process.retransmissions = 0;
            process.combining_allowed = true;
            process.payload = None;
            TransmissionKind::New
        } else {
            if process.state != HarqState::PendingRetransmission {
                return Err(LayerError::HarqStateMismatch {
                    rnti,
                    direction,
                    harq_id,
                    expected: "pending retransmission",
                });
            }
            process.retransmissions = process.retransmissions.saturating_add(1);
            TransmissionKind::Retransmission
        };

        process.state = HarqState::AwaitingResult;
        self.entity_mut(rnti, direction)?.last_used = Some(harq_id);
        Ok(kind)
    }

    /// Keep the MAC PDU of the current transport block for retransmissions
    pub fn store_payload(
        &mut self,
        rnti: Rnti,
        direction: LinkDirection,
        harq_id: u8,
        payload: Bytes,
    ) -> Result<(), LayerError> {
        self.process_mut(rnti, direction, harq_id)?.payload = Some(payload);
        Ok(())
    }

    /// Apply an ACK/NACK (downlink) or CRC result (uplink)
    pub fn handle_result(
        &mut self,
        rnti: Rnti,
        direction: LinkDirection,
        harq_id: u8,
        success: bool,
    ) -> Result<HarqOutcome, LayerError> {
        let max_retransmissions = self.max_retransmissions;
        let process = self.process_mut(rnti, direction, harq_id)?;

        if process.state != HarqState::AwaitingResult {
            return Err(LayerError::HarqStateMismatch {
                rnti,
                direction,
                harq_id,
                expected: "awaiting a result",
            });
        }

        if success {
            process.state = HarqState::Idle;
            process.rv_index = 0;
            process.combining_allowed = true;
            process.payload = None;
            return Ok(HarqOutcome::Success);
        }

        if let Some(limit) = max_retransmissions {
            if process.retransmissions >= limit {
                debug!(
                    "{} HARQ rnti={} id={} dropped after {} retransmissions",
                    direction, rnti, harq_id, process.retransmissions
                );
                process.state = HarqState::Idle;
                process.rv_index = 0;
                process.combining_allowed = true;
                process.payload = None;
                return Ok(HarqOutcome::Dropped);
            }
        }

        let failed_index = process.rv_index;
        process.rv_index = (failed_index + 1) % RV_SEQUENCE.len();
        let soft_buffer_flushed = failed_index == RV_SEQUENCE.len() - 1;
        process.combining_allowed = !soft_buffer_flushed;
        process.state = HarqState::PendingRetransmission;

        Ok(HarqOutcome::RetransmissionPending {
            rv: RV_SEQUENCE[process.rv_index],
            soft_buffer_flushed,
        })
    }
}
