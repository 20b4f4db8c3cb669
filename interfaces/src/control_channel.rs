//! Out-of-band Control Channel
//!
//! Zero-delay, lossless FIFO carrying encoded [`ControlMessage`]s between the
//! gNB and its UEs. Messages cross the channel in their byte form so both
//! ends exercise the same codec a real transport would.

use std::collections::VecDeque;

use crate::{message_types::ControlMessage, InterfaceError};
use serde::Serialize;
use tracing::trace;

/// Channel counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChannelStats {
    pub to_ue_messages: u64,
    pub to_gnb_messages: u64,
    pub bytes: u64,
}

/// Bidirectional control channel
#[derive(Debug, Default)]
pub struct ControlChannel {
    to_ue: VecDeque<Vec<u8>>,
    to_gnb: VecDeque<Vec<u8>>,
    stats: ChannelStats,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message from the gNB towards a UE
    pub fn send_to_ue(&mut self, message: &ControlMessage) -> Result<(), InterfaceError> {
        let encoded = message.encode()?;
        trace!("Control gNB->UE rnti={} ({} bytes)", message.rnti(), encoded.len());
        self.stats.to_ue_messages += 1;
        self.stats.bytes += encoded.len() as u64;
        self.to_ue.push_back(encoded);
        Ok(())
    }

    /// Queue a message from a UE towards the gNB
    pub fn send_to_gnb(&mut self, message: &ControlMessage) -> Result<(), InterfaceError> {
        let encoded = message.encode()?;
        trace!("Control UE->gNB rnti={} ({} bytes)", message.rnti(), encoded.len());
        self.stats.to_gnb_messages += 1;
        self.stats.bytes += encoded.len() as u64;
        self.to_gnb.push_back(encoded);
        Ok(())
    }

    /// Take every pending gNB->UE message in send order
    pub fn receive_at_ue(&mut self) -> Result<Vec<ControlMessage>, InterfaceError> {
        Self::drain(&mut self.to_ue)
    }

    /// Take every pending UE->gNB message in send order
    pub fn receive_at_gnb(&mut self) -> Result<Vec<ControlMessage>, InterfaceError> {
        Self::drain(&mut self.to_gnb)
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    fn drain(queue: &mut VecDeque<Vec<u8>>) -> Result<Vec<ControlMessage>, InterfaceError> {
        queue
            .drain(..)
            .map(|bytes| ControlMessage::decode(&bytes))
            .collect()
    }
}
