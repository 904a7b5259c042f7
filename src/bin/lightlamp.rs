//! Smart light lamp: an actuator that answers light commands over the
//! framed control transport and re-announces itself on every change.

use clap::Parser;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use washroom::{
    ActuatorAction, CommandRequest, CommandResponse, DeviceCategory, DeviceKind, Discovery,
    DiscoveryConfig, ErrorDetails, ServiceInfo, TransportProtocol, bind_ephemeral, serve,
};

const SERVICE_TYPE: &str = "_lightlamp._tcp.local.";

#[derive(Parser)]
#[command(name = "lightlamp", version, about = "Smart light lamp device")]
struct Args {
    /// Instance name announced on the fabric
    #[arg(short, long, default_value = "Light Lamp")]
    name: String,
}

async fn execute(
    discovery: Discovery,
    state: Arc<Mutex<ServiceInfo>>,
    request: CommandRequest,
) -> CommandResponse {
    let CommandRequest::SendActuatorCommand { action, .. } = request;
    let ActuatorAction::Light(light) = action else {
        return CommandResponse::Error(ErrorDetails::invalid_command(
            "only light actions are supported",
        ));
    };

    let mut message = String::new();
    let snapshot = {
        let mut state = state.lock().await;
        if let Some(turn_on) = light.turn_on {
            let was_on = state.properties.get("is_on").map(String::as_str) == Some("true");
            if turn_on && !was_on {
                state.properties.insert("is_on".into(), "true".into());
                message.push_str("Light turned ON. ");
            } else if !turn_on && was_on {
                state.properties.insert("is_on".into(), "false".into());
                message.push_str("Light turned OFF. ");
            }
        }
        if let Some(brightness) = light.brightness {
            state
                .properties
                .insert("brightness".into(), brightness.to_string());
            message.push_str(&format!("Brightness set to {brightness}. "));
        }
        if let Some(color) = light.color {
            state
                .properties
                .insert("color".into(), format!("{color:#08X}"));
            message.push_str(&format!("Color set to #{color:06X}. "));
        }
        if message.is_empty() {
            message.push_str("No change. ");
        }
        state.clone()
    };

    discovery.update_service(&snapshot).await;
    CommandResponse::ActuatorAck {
        message: message.trim_end().to_string(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("washroom=info".parse().unwrap())
                .add_directive("lightlamp=info".parse().unwrap()),
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
        DeviceCategory::LightLamp,
        TransportProtocol::Tcp,
        BTreeMap::from([
            ("is_on".to_string(), "false".to_string()),
            ("brightness".to_string(), "0".to_string()),
            ("color".to_string(), "0xFFFFFF".to_string()),
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
    info!(instance = %info.instance_name, port, "light lamp on the fabric");

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

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    server.abort();

    let info = state.lock().await.clone();
    discovery.unregister_service(&info).await;
    discovery.close().await;
}
