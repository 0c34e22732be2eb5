//! Merges local activity with what neighbours report.
//!
//! Remote records are never expired by a timer; they are swept whenever
//! somebody asks whether the user is active.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::ActivityHook;
use crate::network::{NetworkError, NetworkHandle};
use crate::peer::PeerId;
use crate::protocol::{tag, ActivityState, Envelope, Payload, Scope, DOMAIN_CORE};

/// A remote record older than this no longer counts.
pub const STALE_AFTER: Duration = Duration::from_secs(30);
/// Local state is re-sent this often while the user is active.
pub const REBROADCAST_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteActivityRecord {
    pub peer: PeerId,
    pub is_active: bool,
    pub last_update: Instant,
    pub active_since: Instant,
}

#[derive(Debug, Default)]
pub struct RemoteActivityTable {
    records: HashMap<PeerId, RemoteActivityRecord>,
}

impl RemoteActivityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, peer: PeerId, active: bool, now: Instant) {
        match self.records.get_mut(&peer) {
            Some(record) => {
                record.last_update = now;
                if record.is_active != active {
                    record.active_since = now;
                    record.is_active = active;
                }
            }
            None => {
                self.records.insert(
                    peer,
                    RemoteActivityRecord {
                        peer,
                        is_active: active,
                        last_update: now,
                        active_since: now,
                    },
                );
            }
        }
    }

    /// Drops every record not refreshed within [`STALE_AFTER`].
    pub fn sweep(&mut self, now: Instant) {
        self.records.retain(|peer, record| {
            let fresh = now.saturating_duration_since(record.last_update) <= STALE_AFTER;
            if !fresh {
                tracing::debug!(peer = %peer, "activity record went stale");
            }
            fresh
        });
    }

    pub fn any_active(&mut self, now: Instant) -> bool {
        self.sweep(now);
        self.records.values().any(|r| r.is_active)
    }

    /// When `peer` became active, if it currently is.
    pub fn active_since(&mut self, peer: PeerId, now: Instant) -> Option<Instant> {
        self.sweep(now);
        self.records
            .get(&peer)
            .filter(|r| r.is_active)
            .map(|r| r.active_since)
    }

    pub fn records(&mut self, now: Instant) -> Vec<RemoteActivityRecord> {
        self.sweep(now);
        self.records.values().copied().collect()
    }
}

struct LocalActivity {
    active: bool,
    active_since: Instant,
}

/// Cheap to clone; all clones share the same tables.
#[derive(Clone)]
pub struct ActivityMonitor {
    hook: Arc<dyn ActivityHook>,
    remote: Arc<Mutex<RemoteActivityTable>>,
    local: Arc<Mutex<LocalActivity>>,
}

impl ActivityMonitor {
    pub fn new(hook: Arc<dyn ActivityHook>) -> Self {
        let active = hook.is_active();
        Self {
            hook,
            remote: Arc::new(Mutex::new(RemoteActivityTable::new())),
            local: Arc::new(Mutex::new(LocalActivity {
                active,
                active_since: Instant::now(),
            })),
        }
    }

    /// True when the user is active here or on any neighbour heard from
    /// recently.
    pub fn is_active(&self) -> bool {
        self.hook.is_active() || self.remote.lock().any_active(Instant::now())
    }

    pub fn is_remote_active(&self, peer: PeerId) -> Option<Instant> {
        self.remote.lock().active_since(peer, Instant::now())
    }

    pub fn remote_peers(&self) -> Vec<RemoteActivityRecord> {
        self.remote.lock().records(Instant::now())
    }

    /// When local activity last flipped.
    pub fn local_active_since(&self) -> Instant {
        self.local.lock().active_since
    }

    fn on_remote(&self, source: PeerId, state: &ActivityState) {
        tracing::trace!(peer = %source, active = state.active, "remote activity");
        self.remote.lock().record(source, state.active, Instant::now());
    }

    fn on_local_changed(&self, active: bool) {
        let mut local = self.local.lock();
        if local.active != active {
            local.active = active;
            local.active_since = Instant::now();
        }
    }

    fn broadcast(&self, network: &NetworkHandle, active: bool) -> Result<(), NetworkError> {
        network.send(
            Envelope::new(Payload::ActivityState(ActivityState { active })).with_scope(Scope::Cloud),
        )
    }

    /// Subscribes to remote activity and spawns the task that publishes
    /// local activity.
    pub async fn start(
        self,
        network: NetworkHandle,
    ) -> Result<JoinHandle<()>, NetworkError> {
        let mut inbound = network
            .signal_message(DOMAIN_CORE, tag::ACTIVITY_STATE)
            .await?;
        let mut local_rx = self.hook.subscribe();
        let monitor = self;

        Ok(tokio::spawn(async move {
            let mut tick = tokio::time::interval(REBROADCAST_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut hook_open = true;

            loop {
                let sent = tokio::select! {
                    delivery = inbound.recv() => match delivery {
                        Some(delivery) => {
                            if let Payload::ActivityState(state) = &delivery.payload {
                                monitor.on_remote(delivery.context.source, state);
                            }
                            Ok(())
                        }
                        None => break,
                    },
                    changed = local_rx.changed(), if hook_open => match changed {
                        Ok(()) => {
                            let active = *local_rx.borrow_and_update();
                            monitor.on_local_changed(active);
                            tracing::debug!(active, "local activity changed");
                            monitor.broadcast(&network, active)
                        }
                        Err(_) => {
                            hook_open = false;
                            Ok(())
                        }
                    },
                    _ = tick.tick() => {
                        if monitor.hook.is_active() {
                            monitor.broadcast(&network, true)
                        } else {
                            Ok(())
                        }
                    }
                };
                if sent.is_err() {
                    break;
                }
            }
            tracing::debug!("activity monitor stopped");
        }))
    }
}
