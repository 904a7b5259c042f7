//! Fart detector: a sensor that periodically refreshes its readings and has
//! no actuators to drive.

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};
use washroom::{
    CommandRequest, CommandResponse, DeviceCategory, DeviceKind, Discovery, DiscoveryConfig,
    ServiceInfo, TransportProtocol, bind_ephemeral, serve,
};

const SERVICE_TYPE: &str = "_fartdetector._tcp.local.";

const DETECTION_INTERVAL: Duration = Duration::from_secs(10);
const DIETS: [&str; 5] = ["HIGH_FIBER", "HIGH_PROTEIN", "VEGAN", "KETO", "STANDARD"];

#[derive(Parser)]
#[command(name = "fartdetector", version, about = "Fart detector device")]
struct Args {
    /// Instance name announced on the fabric
    #[arg(short, long, default_value = "Shopee Fart Detector")]
    name: String,

    /// Simulation seed
    #[arg(long, default_value_t = 42069)]
    seed: u64,
}

async fn detect(discovery: Discovery, state: Arc<Mutex<ServiceInfo>>, mut rng: ChaCha8Rng) {
    loop {
        tokio::time::sleep(DETECTION_INTERVAL).await;
        let snapshot = {
            let mut state = state.lock().await;
            let severity = rng.gen_range(0..=10u32);
            let diet = DIETS[rng.gen_range(0..DIETS.len())];
            state
                .properties
                .insert("severity".into(), severity.to_string());
            state.properties.insert("diet".into(), diet.to_string());
            info!(severity, diet, "detection updated");
            state.clone()
        };
        discovery.update_service(&snapshot).await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("washroom=info".parse().unwrap())
                .add_directive("fartdetector=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);

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
        DeviceKind::Sensor,
        DeviceCategory::FartDetector,
        TransportProtocol::Tcp,
        BTreeMap::from([
            ("severity".to_string(), rng.gen_range(0..=10u32).to_string()),
            (
                "diet".to_string(),
                DIETS[rng.gen_range(0..DIETS.len())].to_string(),
            ),
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
    info!(instance = %info.instance_name, port, "fart detector on the fabric");

    let state = Arc::new(Mutex::new(info));
    let server = tokio::spawn(serve(listener, |_request: CommandRequest| async {
        CommandResponse::ActuatorAck {
            message: "No actuator commands supported.".to_string(),
        }
    }));
    let detector = tokio::spawn(detect(discovery.clone(), state.clone(), rng));

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    detector.abort();
    server.abort();

    let info = state.lock().await.clone();
    discovery.unregister_service(&info).await;
    discovery.close().await;
}
