//! Radio Link Control (RLC) Interface
//!
//! The MAC delivers decoded uplink SDUs to the RLC, reads downlink buffer
//! occupancy from it and pulls downlink SDUs when building a MAC PDU.

use std::collections::VecDeque;

use bytes::Bytes;
use common::types::Rnti;
use tracing::{debug, trace};

/// RLC as seen from the MAC
pub trait RlcInterface {
    /// Hand over an SDU received on `lcid`
    fn deliver_sdu(&mut self, rnti: Rnti, lcid: u8, sdu: Bytes);

    /// Downlink bytes waiting for transmission
    fn report_buffer_status(&self, rnti: Rnti) -> u32;

    /// Take downlink SDUs whose total length does not exceed `max_bytes`.
    /// The MAC calls again while space is left.
    fn fetch_sdus(&mut self, rnti: Rnti, max_bytes: usize) -> Vec<Bytes>;
}

#[derive(Debug, Default, Clone)]
struct UeQueue {
    downlink: VecDeque<Bytes>,
    queued_bytes: u64,
    delivered_sdus: u64,
    delivered_bytes: u64,
}

/// Transparent-mode RLC with one downlink queue per UE. Each fetch returns
/// at most one SDU; one larger than the MAC budget is split and the
/// remainder stays at the head.
#[derive(Debug, Clone)]
pub struct RlcQueues {
    ues: Vec<UeQueue>,
}

impl RlcQueues {
    pub fn new(num_ues: usize) -> Self {
        Self {
            ues: vec![UeQueue::default(); num_ues],
        }
    }

    /// Queue a downlink SDU
    pub fn enqueue(&mut self, rnti: Rnti, sdu: Bytes) {
        if let Some(ue) = rnti.ue_index().and_then(|ue| self.ues.get_mut(ue)) {
            ue.queued_bytes += sdu.len() as u64;
            ue.downlink.push_back(sdu);
        }
    }

    /// Uplink SDUs and bytes delivered for `rnti`
    pub fn delivered(&self, rnti: Rnti) -> (u64, u64) {
        rnti.ue_index()
            .and_then(|ue| self.ues.get(ue))
            .map(|ue| (ue.delivered_sdus, ue.delivered_bytes))
            .unwrap_or((0, 0))
    }
}

impl RlcInterface for RlcQueues {
    fn deliver_sdu(&mut self, rnti: Rnti, lcid: u8, sdu: Bytes) {
        trace!("RLC rx rnti={} lcid={} {} bytes", rnti, lcid, sdu.len());
        if let Some(ue) = rnti.ue_index().and_then(|ue| self.ues.get_mut(ue)) {
            ue.delivered_sdus += 1;
            ue.delivered_bytes += sdu.len() as u64;
        }
    }

    fn report_buffer_status(&self, rnti: Rnti) -> u32 {
        rnti.ue_index()
            .and_then(|ue| self.ues.get(ue))
            .map(|ue| ue.queued_bytes.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    fn fetch_sdus(&mut self, rnti: Rnti, max_bytes: usize) -> Vec<Bytes> {
        let Some(ue) = rnti.ue_index().and_then(|ue| self.ues.get_mut(ue)) else {
            return Vec::new();
        };

        if max_bytes == 0 {
            return Vec::new();
        }
        let Some(mut head) = ue.downlink.pop_front() else {
            return Vec::new();
        };
        if head.len() > max_bytes {
            let rest = head.split_off(max_bytes);
            ue.downlink.push_front(rest);
        }
        ue.queued_bytes -= head.len() as u64;
        debug!(
            "RLC tx rnti={} {} bytes, {} bytes left queued",
            rnti,
            head.len(),
            ue.queued_bytes
        );
        vec![head]
    }
}
