use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Link-level traffic between neighbours.
pub const DOMAIN_LINK: u32 = 0;
/// Application state shared between instances.
pub const DOMAIN_CORE: u32 = 1;

pub mod tag {
    // DOMAIN_LINK
    pub const ALIVE: u32 = 1;

    // DOMAIN_CORE
    pub const ACTIVITY_STATE: u32 = 1;
    pub const BREAK_EVENT: u32 = 2;
    pub const OPERATION_MODE: u32 = 3;
    pub const USAGE_MODE: u32 = 4;
    pub const TIMERS: u32 = 5;
    pub const CONFIGURATION: u32 = 6;
}

/// Delivery target set of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Direct,
    Multicast,
    Cloud,
}

impl Scope {
    pub fn includes_direct(&self) -> bool {
        matches!(self, Scope::Direct | Scope::Cloud)
    }

    pub fn includes_multicast(&self) -> bool {
        matches!(self, Scope::Multicast | Scope::Cloud)
    }
}

/// Presence announcement. Sent over multicast for discovery and to every new
/// direct neighbour so it learns who is on the other end.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Alive {
    pub hostname: String,
    pub listen_port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActivityState {
    pub active: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BreakEvent {
    pub break_id: u32,
    pub break_event: u32,
    pub break_hint: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OperationModeUpdate {
    pub mode: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UsageModeUpdate {
    pub mode: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TimerState {
    pub break_id: u32,
    pub elapsed_secs: u64,
    pub idle_secs: u64,
    pub limit_secs: u64,
    pub taking: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Timers {
    pub timers: Vec<TimerState>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigReason {
    // Full snapshot sent when joining
    Initial,
    // Single key changed by the user
    User,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub reason: ConfigReason,
    pub changes: Vec<Setting>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Alive(Alive),
    ActivityState(ActivityState),
    BreakEvent(BreakEvent),
    OperationMode(OperationModeUpdate),
    UsageMode(UsageModeUpdate),
    Timers(Timers),
    Configuration(Configuration),
}

impl Payload {
    pub fn domain(&self) -> u32 {
        match self {
            Payload::Alive(_) => DOMAIN_LINK,
            _ => DOMAIN_CORE,
        }
    }

    pub fn payload_tag(&self) -> u32 {
        match self {
            Payload::Alive(_) => tag::ALIVE,
            Payload::ActivityState(_) => tag::ACTIVITY_STATE,
            Payload::BreakEvent(_) => tag::BREAK_EVENT,
            Payload::OperationMode(_) => tag::OPERATION_MODE,
            Payload::UsageMode(_) => tag::USAGE_MODE,
            Payload::Timers(_) => tag::TIMERS,
            Payload::Configuration(_) => tag::CONFIGURATION,
        }
    }
}

/// An outbound message. `source` is filled in by the router when sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: Option<PeerId>,
    pub scope: Scope,
    pub authenticated: bool,
    pub payload: Payload,
}

impl Envelope {
    /// Wraps `payload` for delivery over both transports.
    pub fn new(payload: Payload) -> Self {
        Self {
            source: None,
            scope: Scope::Cloud,
            authenticated: false,
            payload,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn domain(&self) -> u32 {
        self.payload.domain()
    }

    pub fn payload_tag(&self) -> u32 {
        self.payload.payload_tag()
    }
}
