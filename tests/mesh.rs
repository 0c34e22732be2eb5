use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use breaksync::core::{
    BreakController, Configurator, CoreEvent, LocalCore, ManualActivity, MemoryConfigurator,
    OperationMode, Origin,
};
use breaksync::protocol::{tag, Payload, DOMAIN_CORE};
use breaksync::{AppState, Collaborators, PeerId, Settings};

const LIMIT: &str = "timers/micro_pause/limit";

struct Instance {
    app: AppState,
    config: Arc<MemoryConfigurator>,
    core: Arc<LocalCore>,
    hook: Arc<ManualActivity>,
}

impl Instance {
    async fn start() -> Self {
        let settings = Settings {
            port: 0,
            multicast: false,
            ..Settings::default()
        };
        let config = Arc::new(MemoryConfigurator::with_values([(LIMIT, "180")]));
        let core = Arc::new(LocalCore::new());
        let hook = Arc::new(ManualActivity::new(false));
        let app = AppState::start(
            &settings,
            PeerId::random(),
            Collaborators {
                config: config.clone(),
                core: core.clone(),
                activity: hook.clone(),
            },
        )
        .await
        .expect("start instance");
        Self {
            app,
            config,
            core,
            hook,
        }
    }

    fn id(&self) -> PeerId {
        self.app.local_id()
    }

    async fn knows(&self, peer: PeerId) -> bool {
        self.app
            .network
            .links()
            .await
            .map(|links| links.iter().any(|l| l.remote_id == Some(peer)))
            .unwrap_or(false)
    }
}

async fn eventually<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Dials `to` from `from` and waits until both ends know each other.
async fn link(from: &Instance, to: &Instance) {
    from.app
        .network
        .connect("127.0.0.1", to.app.network.listen_addr().port())
        .await
        .expect("connect");
    eventually("link identities", Duration::from_secs(5), || async move {
        from.knows(to.id()).await && to.knows(from.id()).await
    })
    .await;
}

async fn line(n: usize) -> Vec<Instance> {
    let mut instances = Vec::new();
    for _ in 0..n {
        instances.push(Instance::start().await);
    }
    for pair in instances.windows(2) {
        link(&pair[0], &pair[1]).await;
    }
    instances
}

async fn shutdown(instances: Vec<Instance>) {
    for instance in instances {
        instance.app.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operation_mode_reaches_every_instance_once() {
    let nodes = line(4).await;
    let mut a_events = nodes[0].core.subscribe();
    let others = &nodes[1..];

    for mode in [OperationMode::Suspended, OperationMode::Normal] {
        nodes[0].core.set_operation_mode(mode, Origin::Local);
        eventually("mode propagation", Duration::from_secs(2), || async move {
            others.iter().all(|n| n.core.get_operation_mode() == mode)
        })
        .await;
    }

    // Give any echo time to come back before counting
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut seen = Vec::new();
    while let Ok(event) = a_events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            CoreEvent::OperationModeChanged {
                mode: OperationMode::Suspended,
                origin: Origin::Local
            },
            CoreEvent::OperationModeChanged {
                mode: OperationMode::Normal,
                origin: Origin::Local
            },
        ]
    );

    shutdown(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watched_keys_propagate_and_others_stay_local() {
    let nodes = line(2).await;
    let mut wire = nodes[1]
        .app
        .network
        .signal_message(DOMAIN_CORE, tag::CONFIGURATION)
        .await
        .unwrap();

    nodes[0].config.set_value("gui/theme", "dark");
    nodes[0].config.set_value(LIMIT, "300");

    let b = &nodes[1];
    eventually("config propagation", Duration::from_secs(2), || async move {
        b.config.get_typed_value(LIMIT).as_deref() == Some("300")
    })
    .await;

    assert_eq!(nodes[1].config.get_typed_value("gui/theme"), None);
    while let Ok(delivery) = wire.try_recv() {
        if let Payload::Configuration(message) = delivery.payload {
            assert!(message.changes.iter().all(|s| s.key != "gui/theme"));
        }
    }

    // B applied it as a remote change and did not send it back
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(nodes[0].config.get_typed_value(LIMIT).as_deref(), Some("300"));

    shutdown(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn differing_settings_show_up_as_conflicts_on_connect() {
    let a = Instance::start().await;
    let b = Instance::start().await;
    b.config.set_value(LIMIT, "240");

    link(&a, &b).await;

    let sync = &a.app.config_sync;
    eventually("initial snapshot", Duration::from_secs(2), || async move {
        !sync.pending_conflicts().is_empty()
    })
    .await;
    let conflicts = a.app.config_sync.pending_conflicts();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.key, LIMIT);
    assert_eq!(conflict.local.as_deref(), Some("180"));
    assert_eq!(conflict.remote, "240");
    assert_eq!(conflict.source, b.id());
    // Nothing was applied
    assert_eq!(a.config.get_typed_value(LIMIT).as_deref(), Some("180"));

    a.app.config_sync.resolve_config(LIMIT, "240");
    assert!(a.app.config_sync.pending_conflicts().is_empty());

    shutdown(vec![a, b]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn activity_is_relayed_along_a_line() {
    let nodes = line(3).await;
    assert!(!nodes[2].app.is_active());

    nodes[0].hook.set_active(true);
    let c = &nodes[2];
    eventually("remote activity", Duration::from_secs(2), || async move {
        c.app.is_active()
    })
    .await;

    let a_id = nodes[0].id();
    assert!(nodes[2].app.activity.is_remote_active(a_id).is_some());
    assert!(nodes[0]
        .app
        .activity
        .remote_peers()
        .iter()
        .all(|r| r.peer != a_id));

    shutdown(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn triangle_delivers_each_change_once() {
    let nodes = line(3).await;
    link(&nodes[2], &nodes[0]).await;

    let mut wire = nodes[2]
        .app
        .network
        .signal_message(DOMAIN_CORE, tag::OPERATION_MODE)
        .await
        .unwrap();

    nodes[0]
        .core
        .set_operation_mode(OperationMode::Quiet, Origin::Local);
    let c = &nodes[2];
    eventually("mode propagation", Duration::from_secs(2), || async move {
        c.core.get_operation_mode() == OperationMode::Quiet
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut deliveries = 0;
    while wire.try_recv().is_ok() {
        deliveries += 1;
    }
    assert_eq!(deliveries, 1);

    shutdown(nodes).await;
}
