//! Vigil: an inter-node lease protocol for bounded-latency failure
//! detection.
//!
//! Each node runs one lease agent. Local leasing applications register with
//! the agent and establish bidirectional lease relationships with remote
//! applications: the subject side keeps renewing its lease before expiry,
//! the monitor side watches the peer's renewals. A missed renewal walks a
//! one-way state machine (Active, Expired, Failed) through a suspend window,
//! a pre-arbitration ping, and an application-level arbitration, so that
//! exactly one side of a mutually-suspected pair survives a partition.

#[macro_use]
pub mod utils;

pub mod config;
pub mod engine;
pub mod protocol;

mod agent;
mod transport;

pub use crate::agent::LeaseAgent;
pub use crate::config::{DurationType, LeaseConfig, LeaseDurations};
pub use crate::engine::{
    AgentState, AppEvent, AppEventReceiver, AppHandle, LeaseEvent, LeaseHandle,
    OneWayState, MAX_ID_LEN,
};
pub use crate::protocol::{AgentInstance, LeaseInstance, TTL_MAX};
pub use crate::utils::{logger_init, VigilError, ME};
