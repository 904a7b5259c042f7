//! Gateway: observes the whole fabric through a browser and can drive a
//! discovered lamp over the unicast control transport.

use clap::Parser;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use washroom::{
    ActuatorAction, CommandRequest, CommandResponse, Discovery, DiscoveryConfig, LightAction,
    ServiceBrowser, ServiceInfo, ServiceListener, send_request, wire,
};

const DEVICE_TYPES: [&str; 4] = [
    "_lightlamp._tcp.local.",
    "_sink._tcp.local.",
    "_toilet._tcp.local.",
    "_fartdetector._tcp.local.",
];

#[derive(Parser)]
#[command(name = "gateway", version, about = "Washroom fabric gateway")]
struct Args {
    /// Service types to browse; defaults to every known device type
    #[arg(short = 't', long = "type")]
    types: Vec<String>,

    /// Send a turn-on command to this lamp instance once it is discovered
    #[arg(long)]
    toggle_light: Option<String>,

    /// Seconds between status lines
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
}

#[derive(Debug, Clone)]
struct ConnectedDevice {
    domain: String,
    kind: &'static str,
    port: u16,
    addresses: Vec<String>,
}

struct GatewayListener {
    devices: Arc<Mutex<BTreeMap<String, ConnectedDevice>>>,
    toggle_light: Option<String>,
}

impl ServiceListener for GatewayListener {
    fn add_service(&self, info: &ServiceInfo) {
        let device = ConnectedDevice {
            domain: info.domain_name(),
            kind: info.kind.wire_name(),
            port: info.port,
            addresses: info.addresses.clone(),
        };
        info!(
            id = %device.domain,
            kind = device.kind,
            port = device.port,
            ips = ?device.addresses,
            "discovered new device"
        );
        self.devices
            .lock()
            .unwrap()
            .insert(device.domain.clone(), device);

        if self.toggle_light.as_deref() == Some(info.instance_name.as_str()) {
            tokio::spawn(toggle_lamp(info.clone()));
        }
    }

    fn update_service(&self, info: &ServiceInfo) {
        info!(
            id = %info.domain_name(),
            properties = ?info.properties,
            "device updated"
        );
        let device = ConnectedDevice {
            domain: info.domain_name(),
            kind: info.kind.wire_name(),
            port: info.port,
            addresses: info.addresses.clone(),
        };
        self.devices
            .lock()
            .unwrap()
            .insert(device.domain.clone(), device);
    }

    fn remove_service(&self, info: &ServiceInfo) {
        info!(id = %info.domain_name(), "device left the fabric");
        self.devices.lock().unwrap().remove(&info.domain_name());
    }
}

async fn toggle_lamp(info: ServiceInfo) {
    let request = CommandRequest::SendActuatorCommand {
        device_id: info.domain_name(),
        action: ActuatorAction::Light(LightAction {
            turn_on: Some(true),
            brightness: Some(100),
            color: None,
        }),
    };
    match send_request(&info.addresses, info.port, &request).await {
        Ok(payload) => match wire::decode::<CommandResponse>(&payload) {
            Ok(CommandResponse::ActuatorAck { message }) => {
                info!(lamp = %info.instance_name, %message, "lamp acknowledged")
            }
            Ok(other) => warn!(lamp = %info.instance_name, ?other, "unexpected lamp reply"),
            Err(e) => warn!(lamp = %info.instance_name, error = %e, "undecodable lamp reply"),
        },
        Err(e) => warn!(lamp = %info.instance_name, error = %e, "lamp command failed"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("washroom=info".parse().unwrap())
                .add_directive("gateway=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let types: Vec<String> = if args.types.is_empty() {
        DEVICE_TYPES.iter().map(|t| t.to_string()).collect()
    } else {
        args.types.clone()
    };
    info!(?types, "browsing fabric");

    let devices = Arc::new(Mutex::new(BTreeMap::new()));
    let listener = Arc::new(GatewayListener {
        devices: devices.clone(),
        toggle_light: args.toggle_light.clone(),
    });

    let discovery = Discovery::new(DiscoveryConfig::default());
    let browser = ServiceBrowser::new(discovery.clone(), types, listener);
    if let Err(e) = browser.start().await {
        error!("failed to start browser: {e}");
        return;
    }

    let status = {
        let devices = devices.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
            loop {
                interval.tick().await;
                let devices = devices.lock().unwrap();
                info!(connected = devices.len(), "fabric status");
                for device in devices.values() {
                    info!(
                        id = %device.domain,
                        kind = device.kind,
                        port = device.port,
                        "  device"
                    );
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    status.abort();
    discovery.close().await;
}
