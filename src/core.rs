//! Narrow interfaces to the rest of the application (configuration store,
//! break controller, local activity hook) plus small in-process
//! implementations used by the binary and the tests.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::peer::PeerId;

const EVENT_CAPACITY: usize = 64;

/// Where a mutation came from. Listeners only re-publish `Local` changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote(PeerId),
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BreakId {
    MicroBreak,
    RestBreak,
    DailyLimit,
}

impl BreakId {
    pub const ALL: [BreakId; 3] = [BreakId::MicroBreak, BreakId::RestBreak, BreakId::DailyLimit];

    /// Name used in configuration keys.
    pub fn config_name(&self) -> &'static str {
        match self {
            BreakId::MicroBreak => "micro_pause",
            BreakId::RestBreak => "rest_break",
            BreakId::DailyLimit => "daily_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakHint {
    Normal,
    UserInitiated,
    NaturalBreak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Normal,
    Suspended,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageMode {
    Normal,
    Reading,
}

/// Timer view of one break as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakSnapshot {
    pub id: BreakId,
    pub elapsed_secs: u64,
    pub idle_secs: u64,
    pub limit_secs: u64,
    pub taking: bool,
}

impl BreakSnapshot {
    pub fn idle(id: BreakId) -> Self {
        Self {
            id,
            elapsed_secs: 0,
            idle_secs: 0,
            limit_secs: 0,
            taking: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub key: String,
    pub origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEvent {
    BreakPostponed { id: BreakId, origin: Origin },
    BreakSkipped { id: BreakId, origin: Origin },
    BreakForced { id: BreakId, hint: BreakHint, origin: Origin },
    OperationModeChanged { mode: OperationMode, origin: Origin },
    UsageModeChanged { mode: UsageMode, origin: Origin },
}

impl CoreEvent {
    pub fn origin(&self) -> Origin {
        match *self {
            CoreEvent::BreakPostponed { origin, .. }
            | CoreEvent::BreakSkipped { origin, .. }
            | CoreEvent::BreakForced { origin, .. }
            | CoreEvent::OperationModeChanged { origin, .. }
            | CoreEvent::UsageModeChanged { origin, .. } => origin,
        }
    }
}

pub trait Configurator: Send + Sync {
    fn get_typed_value(&self, key: &str) -> Option<String>;
    fn set_typed_value(&self, key: &str, value: &str, origin: Origin);
    /// Receives a `ConfigChange` for every key whose value actually changed.
    fn subscribe(&self) -> broadcast::Receiver<ConfigChange>;
}

pub trait BreakController: Send + Sync {
    fn get_break(&self, id: BreakId) -> Option<BreakSnapshot>;
    fn postpone_break(&self, id: BreakId, origin: Origin);
    fn skip_break(&self, id: BreakId, origin: Origin);
    fn force_break(&self, id: BreakId, hint: BreakHint, origin: Origin);
    fn set_operation_mode(&self, mode: OperationMode, origin: Origin);
    fn get_operation_mode(&self) -> OperationMode;
    fn set_usage_mode(&self, mode: UsageMode, origin: Origin);
    fn get_usage_mode(&self) -> UsageMode;
    fn subscribe(&self) -> broadcast::Receiver<CoreEvent>;
}

pub trait ActivityHook: Send + Sync {
    fn is_active(&self) -> bool;
    /// Changes whenever local activity flips.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Configuration store kept in memory.
pub struct MemoryConfigurator {
    values: Mutex<BTreeMap<String, String>>,
    changes: broadcast::Sender<ConfigChange>,
}

impl MemoryConfigurator {
    pub fn new() -> Self {
        Self::with_values(std::iter::empty::<(String, String)>())
    }

    pub fn with_values<K, V>(values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let (changes, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            values: Mutex::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            changes,
        }
    }

    pub fn set_value(&self, key: &str, value: &str) {
        self.set_typed_value(key, value, Origin::Local);
    }
}

impl Default for MemoryConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

impl Configurator for MemoryConfigurator {
    fn get_typed_value(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set_typed_value(&self, key: &str, value: &str, origin: Origin) {
        {
            let mut values = self.values.lock();
            if values.get(key).map(String::as_str) == Some(value) {
                return;
            }
            values.insert(key.to_string(), value.to_string());
        }
        // No receivers is fine
        let _ = self.changes.send(ConfigChange {
            key: key.to_string(),
            origin,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }
}

struct CoreState {
    operation_mode: OperationMode,
    usage_mode: UsageMode,
    breaks: HashMap<BreakId, BreakSnapshot>,
}

/// Break controller holding modes and timer snapshots in memory. The timer
/// engine feeds it through `update_timer`.
pub struct LocalCore {
    state: Mutex<CoreState>,
    events: broadcast::Sender<CoreEvent>,
}

impl LocalCore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(CoreState {
                operation_mode: OperationMode::Normal,
                usage_mode: UsageMode::Normal,
                breaks: BreakId::ALL
                    .iter()
                    .map(|id| (*id, BreakSnapshot::idle(*id)))
                    .collect(),
            }),
            events,
        }
    }

    pub fn update_timer(&self, snapshot: BreakSnapshot) {
        self.state.lock().breaks.insert(snapshot.id, snapshot);
    }

    fn emit(&self, event: CoreEvent) {
        tracing::debug!(?event, "core event");
        let _ = self.events.send(event);
    }
}

impl Default for LocalCore {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakController for LocalCore {
    fn get_break(&self, id: BreakId) -> Option<BreakSnapshot> {
        self.state.lock().breaks.get(&id).copied()
    }

    fn postpone_break(&self, id: BreakId, origin: Origin) {
        if let Some(b) = self.state.lock().breaks.get_mut(&id) {
            b.taking = false;
        }
        self.emit(CoreEvent::BreakPostponed { id, origin });
    }

    fn skip_break(&self, id: BreakId, origin: Origin) {
        if let Some(b) = self.state.lock().breaks.get_mut(&id) {
            b.taking = false;
            b.elapsed_secs = 0;
        }
        self.emit(CoreEvent::BreakSkipped { id, origin });
    }

    fn force_break(&self, id: BreakId, hint: BreakHint, origin: Origin) {
        if let Some(b) = self.state.lock().breaks.get_mut(&id) {
            b.taking = true;
        }
        self.emit(CoreEvent::BreakForced { id, hint, origin });
    }

    fn set_operation_mode(&self, mode: OperationMode, origin: Origin) {
        {
            let mut state = self.state.lock();
            if state.operation_mode == mode {
                return;
            }
            state.operation_mode = mode;
        }
        self.emit(CoreEvent::OperationModeChanged { mode, origin });
    }

    fn get_operation_mode(&self) -> OperationMode {
        self.state.lock().operation_mode
    }

    fn set_usage_mode(&self, mode: UsageMode, origin: Origin) {
        {
            let mut state = self.state.lock();
            if state.usage_mode == mode {
                return;
            }
            state.usage_mode = mode;
        }
        self.emit(CoreEvent::UsageModeChanged { mode, origin });
    }

    fn get_usage_mode(&self) -> UsageMode {
        self.state.lock().usage_mode
    }

    fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }
}

/// Activity hook driven by hand.
pub struct ManualActivity {
    active: watch::Sender<bool>,
}

impl ManualActivity {
    pub fn new(active: bool) -> Self {
        let (tx, _) = watch::channel(active);
        Self { active: tx }
    }

    pub fn set_active(&self, active: bool) {
        self.active.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        });
    }
}

impl ActivityHook for ManualActivity {
    fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configurator_notifies_only_on_change() {
        let config = MemoryConfigurator::with_values([("timers/micro_pause/limit", "180")]);
        let mut changes = config.subscribe();

        config.set_value("timers/micro_pause/limit", "180");
        assert!(changes.try_recv().is_err());

        let peer = PeerId::random();
        config.set_typed_value("timers/micro_pause/limit", "240", Origin::Remote(peer));
        let change = changes.try_recv().expect("change");
        assert_eq!(change.key, "timers/micro_pause/limit");
        assert_eq!(change.origin, Origin::Remote(peer));
        assert_eq!(config.get_typed_value("timers/micro_pause/limit").as_deref(), Some("240"));
    }

    #[test]
    fn mode_change_is_reported_once() {
        let core = LocalCore::new();
        let mut events = core.subscribe();

        core.set_operation_mode(OperationMode::Suspended, Origin::Local);
        core.set_operation_mode(OperationMode::Suspended, Origin::Local);

        assert_eq!(
            events.try_recv().unwrap(),
            CoreEvent::OperationModeChanged {
                mode: OperationMode::Suspended,
                origin: Origin::Local
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(core.get_operation_mode(), OperationMode::Suspended);
    }

    #[test]
    fn manual_activity_signals_flips() {
        let hook = ManualActivity::new(false);
        let mut rx = hook.subscribe();
        hook.set_active(false);
        assert!(!rx.has_changed().unwrap());
        hook.set_active(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(hook.is_active());
    }
}
