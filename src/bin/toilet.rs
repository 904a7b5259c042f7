//! Intelligent toilet: a sensor that simulates usage cycles and publishes
//! its state through property updates. Control commands are acknowledged
//! with an empty reply; there is nothing to actuate.

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

const SERVICE_TYPE: &str = "_toilet._tcp.local.";

const USE_INTERVAL: Duration = Duration::from_secs(5);
/// Chance a flush clears a clog.
const CLOG_FLUSH_PROBABILITY: f64 = 1.0 / 3.0;
/// Solid deposits above this weight clog the bowl.
const CLOG_WEIGHT_GRAMS: u32 = 150;
const LITRES_PER_FLUSH: u64 = 6;

#[derive(Parser)]
#[command(name = "toilet", version, about = "Intelligent toilet device")]
struct Args {
    /// Instance name announced on the fabric
    #[arg(short, long, default_value = "Inteligent Toilet")]
    name: String,

    /// Simulation seed
    #[arg(long, default_value_t = 42069)]
    seed: u64,
}

fn get_f64(info: &ServiceInfo, key: &str, fallback: f64) -> f64 {
    info.properties
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn get_u64(info: &ServiceInfo, key: &str) -> u64 {
    info.properties
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn flush(info: &mut ServiceInfo) {
    let consumed = get_u64(info, "water_consumption_today_liters") + LITRES_PER_FLUSH;
    info.properties
        .insert("water_consumption_today_liters".into(), consumed.to_string());
    info.properties.insert("flushed".into(), "true".into());
    info.properties
        .insert("last_flushed".into(), chrono::Utc::now().to_rfc3339());
}

fn scale_cleaner(info: &mut ServiceInfo, factor: f64) {
    let level = (get_f64(info, "bowl_cleaner_level", 10.0) * factor).clamp(1.0, 10.0);
    info.properties
        .insert("bowl_cleaner_level".into(), format!("{level:.1}"));
}

/// One simulated usage cycle. A clogged bowl only retries its flush; a clear
/// one takes a fresh deposit and may clog again.
fn simulate_cycle(info: &mut ServiceInfo, rng: &mut ChaCha8Rng) {
    if info.properties.get("clogged").map(String::as_str) == Some("true") {
        if rng.gen_bool(CLOG_FLUSH_PROBABILITY) {
            info!("toilet flushed while clogged");
            info.properties.insert("clogged".into(), "false".into());
            flush(info);
        } else {
            info!("toilet flush failed, still clogged");
            info.properties.insert("flushed".into(), "false".into());
        }
        return;
    }

    let solid = rng.gen_bool(0.5);
    info.properties.insert(
        "material_in".into(),
        if solid { "SOLID" } else { "LIQUID" }.to_string(),
    );
    info.properties
        .insert("weight_on".into(), rng.gen_range(50..120u32).to_string());

    if solid {
        let grams = rng.gen_range(100..=200u32);
        info.properties
            .insert("solid_material_weight".into(), grams.to_string());
        if grams > CLOG_WEIGHT_GRAMS {
            info!(grams, "toilet clogged by heavy solid material");
            info.properties.insert("clogged".into(), "true".into());
            scale_cleaner(info, 0.3);
            info.properties.insert("flushed".into(), "false".into());
            return;
        }
    } else {
        info.properties.insert("solid_material_weight".into(), String::new());
        scale_cleaner(info, 1.1);
    }

    if rng.gen_bool(0.5) {
        flush(info);
        scale_cleaner(info, 1.2);
        info!("toilet flushed");
    } else {
        info.properties.insert("flushed".into(), "false".into());
        scale_cleaner(info, 0.8);
    }
}

async fn simulate(discovery: Discovery, state: Arc<Mutex<ServiceInfo>>, mut rng: ChaCha8Rng) {
    loop {
        let snapshot = {
            let mut state = state.lock().await;
            simulate_cycle(&mut state, &mut rng);
            state.clone()
        };
        discovery.update_service(&snapshot).await;
        tokio::time::sleep(USE_INTERVAL).await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("washroom=info".parse().unwrap())
                .add_directive("toilet=info".parse().unwrap()),
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
        DeviceKind::Sensor,
        DeviceCategory::Toilet,
        TransportProtocol::Tcp,
        BTreeMap::from([
            ("clogged".to_string(), "false".to_string()),
            ("weight_on".to_string(), String::new()),
            ("material_in".to_string(), String::new()),
            ("solid_material_weight".to_string(), String::new()),
            ("bowl_cleaner_level".to_string(), "10.0".to_string()),
            ("water_consumption_today_liters".to_string(), "0".to_string()),
            ("flushed".to_string(), "true".to_string()),
            ("last_flushed".to_string(), String::new()),
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
    info!(instance = %info.instance_name, port, "toilet on the fabric");

    let state = Arc::new(Mutex::new(info));
    let server = tokio::spawn(serve(listener, |_request: CommandRequest| async {
        CommandResponse::Empty
    }));
    let simulation = tokio::spawn(simulate(
        discovery.clone(),
        state.clone(),
        ChaCha8Rng::seed_from_u64(args.seed),
    ));

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    simulation.abort();
    server.abort();

    let info = state.lock().await.clone();
    discovery.unregister_service(&info).await;
    discovery.close().await;
}
