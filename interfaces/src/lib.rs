//! Control-Plane Interfaces Library
//!
//! This crate provides the out-of-band control messages exchanged between the
//! gNB MAC and its UEs (grants, buffer status, CQI and HARQ feedback).

pub mod message_types;
pub mod control_channel;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Invalid message format")]
    InvalidMessage,
}
