//! Smart sink: an actuator that toggles on command and meters water while
//! running, re-announcing its consumption as it grows.

use clap::Parser;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};
use washroom::{
    ActuatorAction, CommandRequest, CommandResponse, DeviceCategory, DeviceKind, Discovery,
    DiscoveryConfig, ErrorDetails, ServiceInfo, TransportProtocol, bind_ephemeral, serve,
};

const SERVICE_TYPE: &str = "_sink._tcp.local.";

/// Litres added per metering tick while the sink runs.
const LITRES_PER_TICK: u64 = 5;
const METER_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "sink", version, about = "Smart sink device")]
struct Args {
    /// Instance name announced on the fabric
    #[arg(short, long, default_value = "Sink")]
    name: String,
}

fn is_on(info: &ServiceInfo) -> bool {
    info.properties.get("is_on").map(String::as_str) == Some("true")
}

async fn execute(
    discovery: Discovery,
    state: Arc<Mutex<ServiceInfo>>,
    request: CommandRequest,
) -> CommandResponse {
    let CommandRequest::SendActuatorCommand { action, .. } = request;
    let ActuatorAction::Sink(sink) = action else {
        return CommandResponse::Error(ErrorDetails::invalid_command(
            "only sink actions are supported",
        ));
    };

    let (message, snapshot) = {
        let mut state = state.lock().await;
        let was_on = is_on(&state);
        let message = match (sink.turn_on, was_on) {
            (true, false) => {
                state.properties.insert("is_on".into(), "true".into());
                "Sink turned ON."
            }
            (true, true) => "Sink already ON.",
            (false, true) => {
                state.properties.insert("is_on".into(), "false".into());
                "Sink turned OFF."
            }
            (false, false) => "No change.",
        };
        (message, state.clone())
    };

    discovery.update_service(&snapshot).await;
    CommandResponse::ActuatorAck {
        message: message.to_string(),
    }
}

/// Accumulates water consumption while the sink is on.
async fn meter_water(discovery: Discovery, state: Arc<Mutex<ServiceInfo>>) {
    loop {
        let snapshot = {
            let mut state = state.lock().await;
            if is_on(&state) {
                let consumed: u64 = state
                    .properties
                    .get("water_consumed_in_litters")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0)
                    + LITRES_PER_TICK;
                state
                    .properties
                    .insert("water_consumed_in_litters".into(), consumed.to_string());
                info!(litres = consumed, "water consumed");
                Some(state.clone())
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            discovery.update_service(&snapshot).await;
        }
        tokio::time::sleep(METER_INTERVAL).await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("washroom=info".parse().unwrap())
                .add_directive("sink=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let (listener, port) = match bind_ephemeral().await {
        Ok(bound) => bound,
        Err(e) => {
            error!("failed to bind control port: {e}");
            return;
        }
    };

    let mut info = ServiceInfo::new(
        args.name,
        SERVICE_TYPE,
        port,
        DeviceKind::Actuator,
        DeviceCategory::Sink,
        TransportProtocol::Tcp,
        BTreeMap::from([
            ("is_on".to_string(), "false".to_string()),
            ("water_consumed_in_litters".to_string(), "0".to_string()),
        ]),
    );

    let discovery = Discovery::new(DiscoveryConfig::default());
    if let Err(e) = discovery.start().await {
        error!("failed to start discovery: {e}");
        return;
    }
    if let Err(e) = discovery.register_service(&mut info).await {
        error!("failed to register service: {e}");
        return;
    }
    info!(instance = %info.instance_name, port, "sink on the fabric");

    let state = Arc::new(Mutex::new(info));
    let server = {
        let discovery = discovery.clone();
        let state = state.clone();
        tokio::spawn(serve(listener, move |request| {
            let discovery = discovery.clone();
            let state = state.clone();
            async move { execute(discovery, state, request).await }
        }))
    };
    let meter = tokio::spawn(meter_water(discovery.clone(), state.clone()));

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    meter.abort();
    server.abort();

    let info = state.lock().await.clone();
    discovery.unregister_service(&info).await;
    discovery.close().await;
}
