use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::activity::ActivityMonitor;
use crate::config_sync::ConfigSync;
use crate::core::{ActivityHook, BreakController, Configurator};
use crate::network::{Network, NetworkConfig, NetworkError, NetworkHandle};
use crate::peer::PeerId;
use crate::propagator::Propagator;
use crate::settings::Settings;

/// The parts of the application the sync core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub config: Arc<dyn Configurator>,
    pub core: Arc<dyn BreakController>,
    pub activity: Arc<dyn ActivityHook>,
}

/// A running instance: the network loop plus every component attached to
/// it. Clones share the same instance.
#[derive(Clone)]
pub struct AppState {
    pub network: NetworkHandle,
    pub activity: ActivityMonitor,
    pub config_sync: ConfigSync,
    pub propagator: Propagator,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    pub async fn start(
        settings: &Settings,
        local_id: PeerId,
        collaborators: Collaborators,
    ) -> Result<Self, NetworkError> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let (network, network_task) =
            Network::start(NetworkConfig::from_settings(settings, local_id, hostname)).await?;

        let activity = ActivityMonitor::new(collaborators.activity);
        let config_sync = ConfigSync::new(collaborators.config);
        let propagator = Propagator::new(collaborators.core);

        // Subscribe everything before the first link can come up
        let tasks = vec![
            network_task,
            activity.clone().start(network.clone()).await?,
            config_sync.clone().start(network.clone()).await?,
            propagator.clone().start(network.clone()).await?,
        ];

        for (host, port) in settings.peer_targets() {
            network.connect_supervised(&host, port).await?;
        }

        Ok(Self {
            network,
            activity,
            config_sync,
            propagator,
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.network.local_id()
    }

    /// Local or remote activity.
    pub fn is_active(&self) -> bool {
        self.activity.is_active()
    }

    /// Stops the network loop and waits for every component to wind down.
    pub async fn shutdown(&self) {
        self.network.shutdown();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("task ended abnormally: {}", e);
            }
        }
    }
}
