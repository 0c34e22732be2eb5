//! Propagates a fixed allow-list of configuration keys between instances.
//!
//! A change the user makes to a watched key goes out as a single-key `User`
//! delta and is applied last-write-wins on receipt. A newly connected
//! neighbour is sent an `Initial` snapshot; differences found in a snapshot
//! are only recorded, never applied.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::core::{BreakId, ConfigChange, Configurator, Origin};
use crate::network::{NetworkError, NetworkHandle};
use crate::peer::PeerId;
use crate::protocol::{tag, ConfigReason, Configuration, Envelope, Payload, Setting, DOMAIN_CORE};
use crate::transport::{LinkId, LinkState};

const TIMER_SETTINGS: [&str; 5] = ["activity_sensitive", "auto_reset", "limit", "reset_pred", "snooze"];

/// Keys shared between instances unless the caller enrols others.
pub fn default_watch_list() -> Vec<String> {
    let mut keys = vec![
        "internal/dontchange".to_string(),
        "internal/self-destruct".to_string(),
    ];
    for id in BreakId::ALL {
        let name = id.config_name();
        for setting in TIMER_SETTINGS {
            keys.push(format!("timers/{}/{}", name, setting));
        }
        keys.push(format!("breaks/{}/max_preludes", name));
    }
    keys
}

/// Ordered set of keys enrolled for propagation.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    keys: Vec<String>,
}

impl WatchSet {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        let mut set = Self::default();
        for key in keys {
            set.insert(key);
        }
        set
    }

    pub fn insert(&mut self, key: String) {
        if !self.contains(&key) {
            self.keys.push(key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// A `User` delta for `key`, or `None` if the key is not watched or has
    /// no value.
    pub fn delta(&self, key: &str, config: &dyn Configurator) -> Option<Configuration> {
        if !self.contains(key) {
            return None;
        }
        let value = config.get_typed_value(key)?;
        Some(Configuration {
            reason: ConfigReason::User,
            changes: vec![Setting {
                key: key.to_string(),
                value,
            }],
        })
    }

    /// Every watched key that currently has a value.
    pub fn snapshot(&self, config: &dyn Configurator) -> Configuration {
        Configuration {
            reason: ConfigReason::Initial,
            changes: self
                .keys
                .iter()
                .filter_map(|key| {
                    config.get_typed_value(key).map(|value| Setting {
                        key: key.clone(),
                        value,
                    })
                })
                .collect(),
        }
    }
}

/// A value from a neighbour's snapshot that differs from ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConflict {
    pub key: String,
    pub local: Option<String>,
    pub remote: String,
    pub source: PeerId,
}

struct Inner {
    config: Arc<dyn Configurator>,
    watched: Mutex<WatchSet>,
    conflicts: Mutex<Vec<PendingConflict>>,
}

#[derive(Clone)]
pub struct ConfigSync {
    inner: Arc<Inner>,
}

impl ConfigSync {
    /// Watches [`default_watch_list`].
    pub fn new(config: Arc<dyn Configurator>) -> Self {
        Self::with_watch_list(config, default_watch_list())
    }

    pub fn with_watch_list(config: Arc<dyn Configurator>, keys: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                watched: Mutex::new(WatchSet::new(keys)),
                conflicts: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn monitor_config(&self, key: &str) {
        self.inner.watched.lock().insert(key.to_string());
    }

    pub fn is_watched(&self, key: &str) -> bool {
        self.inner.watched.lock().contains(key)
    }

    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.inner.conflicts.lock().clone()
    }

    /// Settles a conflict by writing `value` locally. The local change is
    /// then published like any other user edit.
    pub fn resolve_config(&self, key: &str, value: &str) {
        self.inner.conflicts.lock().retain(|c| c.key != key);
        self.inner.config.set_typed_value(key, value, Origin::Local);
    }

    /// The `Initial` snapshot, to one link or to every neighbour.
    pub fn send_initial(
        &self,
        network: &NetworkHandle,
        link: Option<LinkId>,
    ) -> Result<(), NetworkError> {
        let snapshot = self.inner.watched.lock().snapshot(self.inner.config.as_ref());
        let envelope = Envelope::new(Payload::Configuration(snapshot));
        match link {
            Some(link) => network.send_to(envelope, link),
            None => network.send(envelope),
        }
    }

    /// Called for every local configuration change. Only local edits of
    /// watched keys go out.
    pub fn config_changed_notify(
        &self,
        network: &NetworkHandle,
        change: &ConfigChange,
    ) -> Result<(), NetworkError> {
        if !change.origin.is_local() {
            return Ok(());
        }
        let delta = self
            .inner
            .watched
            .lock()
            .delta(&change.key, self.inner.config.as_ref());
        match delta {
            Some(delta) => {
                tracing::debug!(key = %change.key, "publishing configuration change");
                network.send(Envelope::new(Payload::Configuration(delta)))
            }
            None => Ok(()),
        }
    }

    /// Applies a configuration message from `source`.
    pub fn apply(&self, message: &Configuration, source: PeerId) {
        let watched = self.inner.watched.lock().clone();
        for setting in &message.changes {
            if !watched.contains(&setting.key) {
                tracing::debug!(peer = %source, key = %setting.key, "ignoring unwatched key");
                continue;
            }
            match message.reason {
                ConfigReason::User => {
                    tracing::info!(peer = %source, key = %setting.key, "applying remote setting");
                    self.inner
                        .config
                        .set_typed_value(&setting.key, &setting.value, Origin::Remote(source));
                }
                ConfigReason::Initial => self.record_conflict(setting, source),
            }
        }
    }

    fn record_conflict(&self, setting: &Setting, source: PeerId) {
        let local = self.inner.config.get_typed_value(&setting.key);
        let mut conflicts = self.inner.conflicts.lock();
        conflicts.retain(|c| !(c.key == setting.key && c.source == source));
        if local.as_deref() == Some(setting.value.as_str()) {
            return;
        }
        tracing::info!(peer = %source, key = %setting.key, "configuration differs from neighbour");
        conflicts.push(PendingConflict {
            key: setting.key.clone(),
            local,
            remote: setting.value.clone(),
            source,
        });
    }

    /// Subscribes to inbound configuration, local changes and new links,
    /// and spawns the task serving them.
    pub async fn start(self, network: NetworkHandle) -> Result<JoinHandle<()>, NetworkError> {
        let mut inbound = network
            .signal_message(DOMAIN_CORE, tag::CONFIGURATION)
            .await?;
        let mut changes = self.inner.config.subscribe();
        let mut links = network.link_changes();
        let sync = self;

        Ok(tokio::spawn(async move {
            let mut changes_open = true;
            let mut links_open = true;

            loop {
                let sent = tokio::select! {
                    delivery = inbound.recv() => match delivery {
                        Some(delivery) => {
                            if let Payload::Configuration(message) = &delivery.payload {
                                sync.apply(message, delivery.context.source);
                            }
                            Ok(())
                        }
                        None => break,
                    },
                    change = changes.recv(), if changes_open => match change {
                        Ok(change) => sync.config_changed_notify(&network, &change),
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("missed {} configuration changes", n);
                            Ok(())
                        }
                        Err(RecvError::Closed) => {
                            changes_open = false;
                            Ok(())
                        }
                    },
                    change = links.recv(), if links_open => match change {
                        Ok(change) if change.state == LinkState::Connected => {
                            sync.send_initial(&network, Some(change.id))
                        }
                        Ok(_) => Ok(()),
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("missed {} link changes", n);
                            Ok(())
                        }
                        Err(RecvError::Closed) => {
                            links_open = false;
                            Ok(())
                        }
                    },
                };
                if sent.is_err() {
                    break;
                }
            }
            tracing::debug!("configuration sync stopped");
        }))
    }
}
