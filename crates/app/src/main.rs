use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use warden_config::{ConfigurationRegistry, ControllerConfiguration, ControllerIdentity};
use warden_core::{uid_string, Action, ResourceSnapshot, Settings};
use warden_kubehub::KubeTransport;
use warden_source::{Dispatcher, EventSource, SourceHandle, Supervisor};

fn init_tracing() {
    let env = std::env::var("WARDEN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn logging_dispatcher() -> Arc<dyn Dispatcher> {
    Arc::new(|action: Action, snap: &Arc<ResourceSnapshot>, source: &SourceHandle| {
        info!(
            controller = %source.controller,
            %action,
            ns = %snap.identity.namespace.as_deref().unwrap_or("-"),
            name = %snap.identity.name,
            uid = %uid_string(snap.uid()),
            generation = snap.generation,
            deleting = snap.is_marked_for_deletion(),
            "dispatch"
        );
    })
}

async fn run() -> Result<i32> {
    let settings = Settings::from_env();
    let gvk = settings.gvk.clone().context("WARDEN_GVK is required, e.g. example.com/v1/Widget")?;
    let transport = Arc::new(KubeTransport::connect(&gvk, &settings).await?);
    let crd_name = settings.crd_name.clone().unwrap_or_else(|| transport.crd_name());

    let registry = ConfigurationRegistry::new();
    let identity = ControllerIdentity::new("warden_app::LoggingController").with_name(settings.controller.clone());
    let config = ControllerConfiguration::builder(identity.clone(), crd_name, gvk.clone())
        .generation_aware(settings.generation_aware)
        .scope(settings.scope.clone())
        .build()?;
    registry.register(config)?;

    let (faults, mut supervisor) = Supervisor::channel();
    let mut source = EventSource::for_controller(&registry, &identity, transport, logging_dispatcher(), faults)?;
    source.start().await.context("starting event source")?;
    info!(gvk = %gvk, controllers = ?registry.get_known_controller_names(), "wardend running");

    let code = tokio::select! {
        fatal = supervisor.wait() => {
            match fatal {
                Some(f) => error!(fault = %f, "fatal watch fault; exiting so state is rebuilt from a fresh baseline"),
                None => error!("fault channel closed unexpectedly"),
            }
            1
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            0
        }
    };
    let failed = source.close().await;
    if failed > 0 {
        error!(failed, "some watches failed to close");
    }
    Ok(code)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    match run().await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "wardend failed");
            std::process::exit(1);
        }
    }
}
