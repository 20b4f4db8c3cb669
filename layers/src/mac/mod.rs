//! Medium Access Control (MAC) Layer Implementation
//!
//! gNB-side scheduling and HARQ for the shared channels, following
//! 3GPP TS 38.321 (MAC) and TS 38.214 (resource allocation, MCS/TBS)

pub mod bsr;
pub mod config;
pub mod grant_context;
pub mod harq;
pub mod link_adaptation;
pub mod pdu;
pub mod scheduler;
pub mod stats;
pub mod strategy;
pub mod timing;

pub use config::{MacConfig, RbgSizeConfig, TickGranularity};
pub use harq::{HarqOutcome, HarqState, TransmissionKind};
pub use scheduler::MacScheduler;
pub use stats::{DirectionStats, MacStats, UeStats};
pub use strategy::AllocationStrategy;
pub use timing::{SlotPosition, TimingEngine};
