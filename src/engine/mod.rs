//! Lease agent engine: relationship state machines, per-remote aggregates,
//! application registry, arbitration, and the single logic task tying them
//! together.

mod agent;
mod apps;
mod arbitration;
mod maintenance;
mod relationship;
mod remote;

pub use agent::{AgentState, LeaseHandle};
pub use apps::{
    AppEvent, AppEventReceiver, AppHandle, DrainGuard, LeaseEvent, MAX_ID_LEN,
};
pub use relationship::OneWayState;

pub(crate) use agent::{EngineAction, EngineNotice, LeaseAgentLogicTask};
pub(crate) use apps::AppStatusView;
