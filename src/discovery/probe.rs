//! Short-lived TCP connects that verify a cached service is still there.

use super::info::ServiceInfo;
use crate::types::TransportProtocol;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default connect timeout for one probe attempt.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Address prefixes never probed: loopback and the usual container bridge
/// ranges, which resolve locally and would report false liveness.
pub fn default_excluded_prefixes() -> Vec<String> {
    [
        "127.", "172.17.", "172.18.", "172.19.", "172.20.", "172.21.", "172.22.",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Probes a descriptor's endpoint.
///
/// Endpoints without addresses or with port 0 are dead. Non-TCP endpoints
/// cannot be probed reliably and are assumed alive, leaving TTL expiry as
/// their only removal path. Otherwise the first address accepting a connect
/// within the timeout wins.
pub async fn probe_service(
    info: &ServiceInfo,
    connect_timeout: Duration,
    excluded_prefixes: &[String],
) -> bool {
    if info.addresses.is_empty() || info.port == 0 {
        return false;
    }
    if info.protocol != TransportProtocol::Tcp {
        return true;
    }

    for address in &info.addresses {
        if excluded_prefixes.iter().any(|p| address.starts_with(p)) {
            continue;
        }

        match timeout(
            connect_timeout,
            TcpStream::connect((address.as_str(), info.port)),
        )
        .await
        {
            Ok(Ok(_stream)) => {
                debug!(
                    instance = %info.instance_name,
                    %address,
                    port = info.port,
                    "liveness probe succeeded"
                );
                return true;
            }
            Ok(Err(e)) => {
                debug!(instance = %info.instance_name, %address, error = %e, "liveness probe refused");
            }
            Err(_) => {
                debug!(instance = %info.instance_name, %address, "liveness probe timed out");
            }
        }
    }

    debug!(
        instance = %info.instance_name,
        port = info.port,
        "liveness probe failed on every address"
    );
    false
}
