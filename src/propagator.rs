//! Mirrors break actions and mode changes between instances.
//!
//! Local events go out; inbound ones are applied with a remote origin so the
//! controller's resulting event is recognised and not sent again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::{
    BreakController, BreakHint, BreakId, BreakSnapshot, CoreEvent, OperationMode, Origin,
    UsageMode,
};
use crate::network::{NetworkError, NetworkHandle};
use crate::peer::PeerId;
use crate::protocol::{
    tag, BreakEvent, Envelope, OperationModeUpdate, Payload, TimerState, Timers, UsageModeUpdate,
    DOMAIN_CORE,
};
use crate::router::Delivery;

pub const TIMERS_INTERVAL: Duration = Duration::from_secs(10);

pub mod wire {
    use super::*;

    pub const BREAK_POSTPONED: u32 = 1;
    pub const BREAK_SKIPPED: u32 = 2;
    pub const BREAK_FORCED: u32 = 3;

    pub fn from_break_id(id: BreakId) -> u32 {
        match id {
            BreakId::MicroBreak => 0,
            BreakId::RestBreak => 1,
            BreakId::DailyLimit => 2,
        }
    }

    pub fn to_break_id(value: u32) -> Option<BreakId> {
        match value {
            0 => Some(BreakId::MicroBreak),
            1 => Some(BreakId::RestBreak),
            2 => Some(BreakId::DailyLimit),
            _ => None,
        }
    }

    pub fn from_hint(hint: BreakHint) -> u32 {
        match hint {
            BreakHint::Normal => 0,
            BreakHint::UserInitiated => 1,
            BreakHint::NaturalBreak => 2,
        }
    }

    pub fn to_hint(value: u32) -> Option<BreakHint> {
        match value {
            0 => Some(BreakHint::Normal),
            1 => Some(BreakHint::UserInitiated),
            2 => Some(BreakHint::NaturalBreak),
            _ => None,
        }
    }

    pub fn from_operation_mode(mode: OperationMode) -> u32 {
        match mode {
            OperationMode::Normal => 0,
            OperationMode::Suspended => 1,
            OperationMode::Quiet => 2,
        }
    }

    pub fn to_operation_mode(value: u32) -> Option<OperationMode> {
        match value {
            0 => Some(OperationMode::Normal),
            1 => Some(OperationMode::Suspended),
            2 => Some(OperationMode::Quiet),
            _ => None,
        }
    }

    pub fn from_usage_mode(mode: UsageMode) -> u32 {
        match mode {
            UsageMode::Normal => 0,
            UsageMode::Reading => 1,
        }
    }

    pub fn to_usage_mode(value: u32) -> Option<UsageMode> {
        match value {
            0 => Some(UsageMode::Normal),
            1 => Some(UsageMode::Reading),
            _ => None,
        }
    }
}

/// Message for a local core event. Events caused by a neighbour map to
/// nothing.
pub fn outbound(event: &CoreEvent) -> Option<Payload> {
    if !event.origin().is_local() {
        return None;
    }
    let payload = match *event {
        CoreEvent::BreakPostponed { id, .. } => Payload::BreakEvent(BreakEvent {
            break_id: wire::from_break_id(id),
            break_event: wire::BREAK_POSTPONED,
            break_hint: wire::from_hint(BreakHint::Normal),
        }),
        CoreEvent::BreakSkipped { id, .. } => Payload::BreakEvent(BreakEvent {
            break_id: wire::from_break_id(id),
            break_event: wire::BREAK_SKIPPED,
            break_hint: wire::from_hint(BreakHint::Normal),
        }),
        CoreEvent::BreakForced { id, hint, .. } => Payload::BreakEvent(BreakEvent {
            break_id: wire::from_break_id(id),
            break_event: wire::BREAK_FORCED,
            break_hint: wire::from_hint(hint),
        }),
        CoreEvent::OperationModeChanged { mode, .. } => Payload::OperationMode(OperationModeUpdate {
            mode: wire::from_operation_mode(mode),
        }),
        CoreEvent::UsageModeChanged { mode, .. } => Payload::UsageMode(UsageModeUpdate {
            mode: wire::from_usage_mode(mode),
        }),
    };
    Some(payload)
}

#[derive(Clone)]
pub struct Propagator {
    core: Arc<dyn BreakController>,
    remote_timers: Arc<Mutex<HashMap<PeerId, Vec<BreakSnapshot>>>>,
}

impl Propagator {
    pub fn new(core: Arc<dyn BreakController>) -> Self {
        Self {
            core,
            remote_timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Applies an inbound message on behalf of `source`.
    pub fn apply(&self, payload: &Payload, source: PeerId) {
        let origin = Origin::Remote(source);
        match payload {
            Payload::BreakEvent(event) => self.apply_break_event(event, origin),
            Payload::OperationMode(update) => match wire::to_operation_mode(update.mode) {
                Some(mode) => {
                    tracing::info!(peer = %source, ?mode, "remote operation mode");
                    self.core.set_operation_mode(mode, origin);
                }
                None => tracing::warn!(peer = %source, "unknown operation mode {}", update.mode),
            },
            Payload::UsageMode(update) => match wire::to_usage_mode(update.mode) {
                Some(mode) => {
                    tracing::info!(peer = %source, ?mode, "remote usage mode");
                    self.core.set_usage_mode(mode, origin);
                }
                None => tracing::warn!(peer = %source, "unknown usage mode {}", update.mode),
            },
            Payload::Timers(timers) => {
                let snapshots = timers
                    .timers
                    .iter()
                    .filter_map(|t| {
                        Some(BreakSnapshot {
                            id: wire::to_break_id(t.break_id)?,
                            elapsed_secs: t.elapsed_secs,
                            idle_secs: t.idle_secs,
                            limit_secs: t.limit_secs,
                            taking: t.taking,
                        })
                    })
                    .collect();
                self.remote_timers.lock().insert(source, snapshots);
            }
            _ => {}
        }
    }

    fn apply_break_event(&self, event: &BreakEvent, origin: Origin) {
        let Some(id) = wire::to_break_id(event.break_id) else {
            tracing::warn!("unknown break id {}", event.break_id);
            return;
        };
        match event.break_event {
            wire::BREAK_POSTPONED => self.core.postpone_break(id, origin),
            wire::BREAK_SKIPPED => self.core.skip_break(id, origin),
            wire::BREAK_FORCED => {
                let hint = wire::to_hint(event.break_hint).unwrap_or(BreakHint::Normal);
                self.core.force_break(id, hint, origin);
            }
            other => tracing::warn!(?id, "unknown break event {}", other),
        }
    }

    pub fn timers_snapshot(&self) -> Timers {
        Timers {
            timers: BreakId::ALL
                .iter()
                .filter_map(|id| self.core.get_break(*id))
                .map(|b| TimerState {
                    break_id: wire::from_break_id(b.id),
                    elapsed_secs: b.elapsed_secs,
                    idle_secs: b.idle_secs,
                    limit_secs: b.limit_secs,
                    taking: b.taking,
                })
                .collect(),
        }
    }

    /// Last timer snapshot heard from each neighbour.
    pub fn remote_timers(&self) -> HashMap<PeerId, Vec<BreakSnapshot>> {
        self.remote_timers.lock().clone()
    }

    fn on_delivery(&self, delivery: Option<Delivery>) -> bool {
        match delivery {
            Some(delivery) => {
                self.apply(&delivery.payload, delivery.context.source);
                true
            }
            None => false,
        }
    }

    pub async fn start(self, network: NetworkHandle) -> Result<JoinHandle<()>, NetworkError> {
        let mut breaks = network.signal_message(DOMAIN_CORE, tag::BREAK_EVENT).await?;
        let mut operation = network.signal_message(DOMAIN_CORE, tag::OPERATION_MODE).await?;
        let mut usage = network.signal_message(DOMAIN_CORE, tag::USAGE_MODE).await?;
        let mut timers = network.signal_message(DOMAIN_CORE, tag::TIMERS).await?;
        let mut events = self.core.subscribe();
        let propagator = self;

        Ok(tokio::spawn(async move {
            let mut tick = tokio::time::interval(TIMERS_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut events_open = true;

            loop {
                let sent = tokio::select! {
                    d = breaks.recv() => if propagator.on_delivery(d) { Ok(()) } else { break },
                    d = operation.recv() => if propagator.on_delivery(d) { Ok(()) } else { break },
                    d = usage.recv() => if propagator.on_delivery(d) { Ok(()) } else { break },
                    d = timers.recv() => if propagator.on_delivery(d) { Ok(()) } else { break },
                    event = events.recv(), if events_open => match event {
                        Ok(event) => match outbound(&event) {
                            Some(payload) => {
                                tracing::debug!(?event, "publishing core event");
                                network.send(Envelope::new(payload))
                            }
                            None => Ok(()),
                        },
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("missed {} core events", n);
                            Ok(())
                        }
                        Err(RecvError::Closed) => {
                            events_open = false;
                            Ok(())
                        }
                    },
                    _ = tick.tick() => {
                        network.send(Envelope::new(Payload::Timers(propagator.timers_snapshot())))
                    }
                };
                if sent.is_err() {
                    break;
                }
            }
            tracing::debug!("break propagator stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LocalCore;

    #[test]
    fn wire_values_map_both_ways() {
        for id in BreakId::ALL {
            assert_eq!(wire::to_break_id(wire::from_break_id(id)), Some(id));
        }
        for mode in [OperationMode::Normal, OperationMode::Suspended, OperationMode::Quiet] {
            assert_eq!(wire::to_operation_mode(wire::from_operation_mode(mode)), Some(mode));
        }
        assert_eq!(wire::to_operation_mode(9), None);
        assert_eq!(wire::to_usage_mode(2), None);
        assert_eq!(wire::to_hint(7), None);
    }

    #[test]
    fn remote_events_are_not_published() {
        let peer = PeerId::random();
        let remote = CoreEvent::OperationModeChanged {
            mode: OperationMode::Quiet,
            origin: Origin::Remote(peer),
        };
        assert!(outbound(&remote).is_none());

        let local = CoreEvent::BreakForced {
            id: BreakId::RestBreak,
            hint: BreakHint::UserInitiated,
            origin: Origin::Local,
        };
        assert_eq!(
            outbound(&local),
            Some(Payload::BreakEvent(BreakEvent {
                break_id: 1,
                break_event: wire::BREAK_FORCED,
                break_hint: 1,
            }))
        );
    }

    #[test]
    fn inbound_changes_carry_the_sender_as_origin() {
        let core = Arc::new(LocalCore::new());
        let propagator = Propagator::new(core.clone());
        let mut events = core.subscribe();
        let peer = PeerId::random();

        propagator.apply(&Payload::OperationMode(OperationModeUpdate { mode: 1 }), peer);
        assert_eq!(core.get_operation_mode(), OperationMode::Suspended);
        let event = events.try_recv().unwrap();
        assert_eq!(event.origin(), Origin::Remote(peer));
        assert!(outbound(&event).is_none());

        propagator.apply(
            &Payload::BreakEvent(BreakEvent {
                break_id: 0,
                break_event: wire::BREAK_SKIPPED,
                break_hint: 0,
            }),
            peer,
        );
        assert_eq!(
            events.try_recv().unwrap(),
            CoreEvent::BreakSkipped {
                id: BreakId::MicroBreak,
                origin: Origin::Remote(peer)
            }
        );
    }

    #[test]
    fn unknown_values_change_nothing() {
        let core = Arc::new(LocalCore::new());
        let propagator = Propagator::new(core.clone());
        let mut events = core.subscribe();
        let peer = PeerId::random();

        propagator.apply(&Payload::UsageMode(UsageModeUpdate { mode: 42 }), peer);
        propagator.apply(
            &Payload::BreakEvent(BreakEvent {
                break_id: 0,
                break_event: 99,
                break_hint: 0,
            }),
            peer,
        );
        assert!(events.try_recv().is_err());
        assert_eq!(core.get_usage_mode(), UsageMode::Normal);
    }

    #[test]
    fn timer_snapshots_are_kept_per_peer() {
        let core = Arc::new(LocalCore::new());
        core.update_timer(BreakSnapshot {
            id: BreakId::MicroBreak,
            elapsed_secs: 120,
            idle_secs: 4,
            limit_secs: 180,
            taking: false,
        });
        let propagator = Propagator::new(core);
        let snapshot = propagator.timers_snapshot();
        assert_eq!(snapshot.timers.len(), 3);
        assert_eq!(snapshot.timers[0].elapsed_secs, 120);

        let peer = PeerId::random();
        propagator.apply(&Payload::Timers(snapshot), peer);
        let remote = propagator.remote_timers();
        assert_eq!(remote[&peer].len(), 3);
        assert_eq!(remote[&peer][0].limit_secs, 180);
    }
}
