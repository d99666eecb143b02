//! Crosspoint Node
//!
//! Hosts equipment crosspoints on the system's TCP port, announces them
//! over UDP, and routes local control crosspoints to equipment found on
//! the network.

use anyhow::{Context, Result};
use clap::Parser;
use crosspoint_core::{ConnectionStatus, CrosspointId, HostInfo};
use crosspoint_discovery::{
    AnnouncementListener, Announcer, BroadcastConfig, DiscoveryEvent, RemoteCrosspointTracker,
    TrackerConfig,
};
use crosspoint_router::{
    ControlRegistry, ControlRegistryConfig, Crosspoint, EquipmentRegistry, ListenerPool,
    SystemConfig,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crosspoint-node")]
#[command(about = "Crosspoint routing node")]
#[command(version)]
struct Cli {
    /// Config file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured system id
    #[arg(short, long)]
    system_id: Option<u16>,

    /// Do not announce hosted equipment
    #[arg(long)]
    no_announce: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// An equipment crosspoint hosted by this node
#[derive(Debug, Deserialize)]
struct EquipmentEntry {
    id: CrosspointId,
    name: String,
}

/// A control crosspoint, optionally routed at startup
#[derive(Debug, Deserialize)]
struct ControlEntry {
    id: CrosspointId,
    name: String,
    /// Equipment to connect to once it is discovered
    equipment: Option<CrosspointId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeConfig {
    system: SystemConfig,
    control_registry: ControlRegistryConfig,
    tracker: TrackerConfig,
    broadcast: BroadcastConfig,
    /// Address put into announcements; receivers use the datagram source
    /// address when unset
    advertise_address: Option<String>,
    equipment: Vec<EquipmentEntry>,
    control: Vec<ControlEntry>,
}

fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<NodeConfig>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => NodeConfig::default(),
    };
    if let Some(system_id) = cli.system_id {
        config.system.system_id = system_id;
    }
    Ok(config)
}

/// `(control, equipment)` pairs to (re)connect: the control is not
/// connected and its equipment is currently tracked
fn pending_routes(
    controls: &ControlRegistry,
    wanted: &HashMap<CrosspointId, Vec<CrosspointId>>,
) -> Vec<(CrosspointId, CrosspointId)> {
    let mut pending: Vec<(CrosspointId, CrosspointId)> = wanted
        .iter()
        .filter(|(target, _)| controls.tracker().contains(**target))
        .flat_map(|(target, ids)| ids.iter().map(move |id| (*id, *target)))
        .filter(|(id, _)| {
            controls
                .try_get(*id)
                .map(|c| c.status() != ConnectionStatus::Connected)
                .unwrap_or(false)
        })
        .collect();
    pending.sort_unstable();
    pending
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&cli)?;
    let system_id = config.system.system_id;
    let listen = config.system.host_info()?;
    tracing::info!("Starting crosspoint node for system {}", system_id);

    let tracker = Arc::new(RemoteCrosspointTracker::new(config.tracker.clone())?);
    tracker.start_expiry();

    // Equipment side
    let listeners = ListenerPool::new();
    let equipment = Arc::new(EquipmentRegistry::new());
    for entry in &config.equipment {
        let hosted = equipment.create(entry.id, &entry.name)?;
        hosted.on_output(|envelope| {
            tracing::debug!(
                "Equipment {} received {:?} from {:?}",
                envelope.equipment_id,
                envelope.message_type,
                envelope.control_ids
            );
        });
    }

    let mut tasks = Vec::new();
    if !equipment.is_empty() {
        equipment.listen_tcp(&listeners, &config.system).await?;

        if !cli.no_announce {
            let advertised = HostInfo::new(
                config
                    .advertise_address
                    .clone()
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                listen.port,
            );
            let source = equipment.clone();
            let announcer = Announcer::bind(config.broadcast.clone(), system_id, move || {
                source.crosspoint_infos(&advertised)
            })
            .await?;
            tasks.push(announcer.start());
        }
    }

    match AnnouncementListener::bind(config.broadcast.port, system_id, tracker.clone()).await {
        Ok(listener) => tasks.push(listener.start()),
        Err(e) => tracing::warn!("Not listening for announcements: {}", e),
    }

    // Control side
    let controls = Arc::new(ControlRegistry::tcp(
        config.control_registry.clone(),
        tracker.clone(),
    ));
    let mut wanted: HashMap<CrosspointId, Vec<CrosspointId>> = HashMap::new();
    for entry in &config.control {
        let control = controls.create(entry.id, &entry.name)?;
        control.on_status_changed(Arc::new(|id, status| {
            tracing::info!("Control {} is {}", id, status);
        }));
        if let Some(target) = entry.equipment {
            wanted.entry(target).or_default().push(entry.id);
        }
    }

    if !wanted.is_empty() {
        let mut events = tracker.subscribe();
        let controls = controls.clone();
        let mut retry = tokio::time::interval(config.tracker.broadcast_interval());
        tasks.push(tokio::spawn(async move {
            // The first tick fires at once and covers equipment already known
            loop {
                tokio::select! {
                    _ = retry.tick() => {}
                    event = events.recv() => match event {
                        Ok(DiscoveryEvent::Found(_)) => {}
                        Ok(DiscoveryEvent::Lost(_)) => continue,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!("Missed {} discovery events", missed);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
                for (control, target) in pending_routes(&controls, &wanted) {
                    controls.connect(control, target).await;
                }
            }
        }));
    }

    tracing::info!(
        "Node ready: {} equipment on {}, {} controls",
        equipment.len(),
        listen,
        controls.len()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    for task in tasks {
        task.abort();
    }
    controls.shutdown().await;
    equipment.stop_listening();
    tracker.stop_expiry();

    Ok(())
}
