//! Protocol Stack Layers Library
//!
//! This crate implements the gNB MAC scheduling and HARQ engine together with
//! the narrow PHY and RLC collaborator interfaces it drives.

pub mod mac;
pub mod phy;
pub mod rlc;

use common::types::{LinkDirection, Rnti};
use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid protocol data unit: {0}")]
    InvalidPdu(String),

    #[error("Invalid buffer status report: {0}")]
    InvalidBsr(String),

    #[error("Invalid CQI report: {0}")]
    InvalidCqiReport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown UE rnti={0}")]
    UnknownUe(Rnti),

    #[error("Unexpected HARQ feedback rnti={rnti} harq_id={harq_id}")]
    UnexpectedFeedback { rnti: Rnti, harq_id: u8 },

    #[error("Reception result does not match a parked process rnti={rnti} harq_id={harq_id}")]
    UnmatchedReception { rnti: Rnti, harq_id: u8 },

    #[error("RBG {rbg} double-assigned: held by rnti={holder}, claimed by rnti={claimant}")]
    RbgDoubleAssignment { rbg: usize, holder: Rnti, claimant: Rnti },

    #[error("HARQ process {direction} rnti={rnti} harq_id={harq_id} is not {expected}")]
    HarqStateMismatch {
        rnti: Rnti,
        direction: LinkDirection,
        harq_id: u8,
        expected: &'static str,
    },

    #[error("{kind} context collision rnti={rnti} symbol={symbol}")]
    GrantContextCollision {
        kind: &'static str,
        rnti: Rnti,
        symbol: usize,
    },

    #[error("PHY error: {0}")]
    Phy(String),
}

impl LayerError {
    /// Invariant violations that must abort the run
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            LayerError::RbgDoubleAssignment { .. }
                | LayerError::HarqStateMismatch { .. }
                | LayerError::GrantContextCollision { .. }
        )
    }
}
