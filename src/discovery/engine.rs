//! The discovery engine: multicast socket, record cache, and the background
//! tasks that keep both honest.
//!
//! One engine per process. `start` binds the shared multicast socket and
//! spawns the receive loop plus the optional cleanup and renovation loops;
//! `close` says goodbye for every owned service and tears the tasks down.
//! All cache state sits behind a single mutex; listener callbacks are
//! synchronous and always invoked with no lock held.

use super::cache::{CacheUpdate, RecordCache};
use super::info::ServiceInfo;
use super::probe::{DEFAULT_HEALTH_CHECK_TIMEOUT, default_excluded_prefixes, probe_service};
use crate::types::{DEFAULT_TTL, SERVICE_DISCOVERY_TYPE};
use crate::wire::{
    self, Envelope, MULTICAST_ADDR, MULTICAST_PORT, Payload, Question, Record, RecordData,
    RecordKind,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Frames remembered for self-echo suppression. Announcements are small and
/// infrequent, so the window comfortably outlives any kernel loopback delay.
const SENT_PACKET_WINDOW: usize = 50;

/// Owned services are re-announced at this fraction of [`DEFAULT_TTL`].
const RENOVATION_FACTOR: f64 = 0.75;

/// Receive buffer; a datagram larger than this is not ours.
const RECV_BUFFER_BYTES: usize = 64 * 1024;

/// Fixed default seed so jitter and renames replay identically run to run.
pub const DEFAULT_RANDOM_SEED: u64 = 42069;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("instance name '{0}' is already taken on the fabric")]
    NonUniqueName(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Tuning knobs for one engine. The defaults match the deployed fleet.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Pause between tiebreak probes, before drift.
    pub tiebreak_interval_ms: u64,
    /// Consecutive conflict-free probes needed to claim a name.
    pub tiebreak_attempts: u32,
    /// Reserved per-probe wait; probe pacing itself comes from the interval.
    pub query_timeout_ms: u64,
    /// Upper bound of the random drift added to each probe pause.
    pub tiebreak_max_drift_ms: u64,
    pub random_seed: u64,
    pub automatic_cleanup: bool,
    pub cleanup_interval: Duration,
    pub automatic_renovation: bool,
    /// Informational; the running cadence is `RENOVATION_FACTOR × DEFAULT_TTL`.
    pub renovation_interval: Duration,
    pub health_check_timeout: Duration,
    /// Address prefixes the liveness probe skips.
    pub excluded_ip_prefixes: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            tiebreak_interval_ms: 100,
            tiebreak_attempts: 3,
            query_timeout_ms: 200,
            tiebreak_max_drift_ms: 25,
            random_seed: DEFAULT_RANDOM_SEED,
            automatic_cleanup: true,
            cleanup_interval: Duration::from_secs(60),
            automatic_renovation: true,
            renovation_interval: Duration::from_secs(60),
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            excluded_ip_prefixes: default_excluded_prefixes(),
        }
    }
}

/// Observer of fabric changes. Callbacks are synchronous, fire outside the
/// cache lock, and must not re-enter the engine's async API directly.
pub trait ServiceListener: Send + Sync {
    fn add_service(&self, info: &ServiceInfo);
    fn update_service(&self, info: &ServiceInfo);
    fn remove_service(&self, info: &ServiceInfo);
}

/// Cheap-to-clone handle on one engine.
#[derive(Clone)]
pub struct Discovery {
    shared: Arc<Shared>,
}

struct Shared {
    config: DiscoveryConfig,
    cache: Mutex<RecordCache>,
    listeners: StdMutex<Vec<Arc<dyn ServiceListener>>>,
    socket: StdMutex<Option<Arc<UdpSocket>>>,
    sent_packets: StdMutex<VecDeque<Vec<u8>>>,
    rng: StdMutex<ChaCha8Rng>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.random_seed);
        Self {
            shared: Arc::new(Shared {
                config,
                cache: Mutex::new(RecordCache::new()),
                listeners: StdMutex::new(Vec::new()),
                socket: StdMutex::new(None),
                sent_packets: StdMutex::new(VecDeque::with_capacity(SENT_PACKET_WINDOW)),
                rng: StdMutex::new(rng),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Binds the multicast socket and spawns the background loops.
    /// Idempotent: a started engine stays as it is.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        {
            let mut slot = self.shared.socket.lock().expect("socket lock");
            if slot.is_some() {
                return Ok(());
            }
            *slot = Some(Arc::new(bind_multicast_socket()?));
        }

        let mut tasks = self.shared.tasks.lock().expect("tasks lock");
        tasks.push(tokio::spawn(Shared::recv_loop(self.shared.clone())));
        if self.shared.config.automatic_cleanup {
            tasks.push(tokio::spawn(Shared::cleanup_loop(self.shared.clone())));
        }
        if self.shared.config.automatic_renovation {
            tasks.push(tokio::spawn(Shared::renovate_loop(self.shared.clone())));
        }

        info!(
            multicast = %MULTICAST_ADDR,
            port = MULTICAST_PORT,
            "discovery engine listening"
        );
        Ok(())
    }

    /// Says goodbye for every owned service, cancels the loops, and drops the
    /// socket. Safe to call more than once.
    pub async fn close(&self) {
        let registered = { self.shared.cache.lock().await.registered_domains() };
        for (service_type, domain) in registered {
            let goodbye = {
                self.shared
                    .cache
                    .lock()
                    .await
                    .reconstruct(&service_type, &domain)
            };
            if let Some(mut info) = goodbye {
                info.ttl = 0;
                self.shared.broadcast_service(&info).await;
                debug!(%domain, %service_type, "sent goodbye for owned service");
            }
        }

        for task in self.shared.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        *self.shared.socket.lock().expect("socket lock") = None;
    }

    pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.shared
            .listeners
            .lock()
            .expect("listeners lock")
            .push(listener);
    }

    /// Claims a unique instance name, records ownership, caches, and
    /// announces. On a conflict the descriptor's name is rewritten to
    /// `<base>-N` when renaming is allowed, otherwise registration fails.
    pub async fn register_service(&self, info: &mut ServiceInfo) -> Result<(), DiscoveryError> {
        info!(
            instance = %info.instance_name,
            service_type = %info.service_type,
            port = info.port,
            "registering service"
        );

        // Settle delay so simultaneously booting devices don't probe in
        // lockstep.
        let settle = {
            self.shared
                .rng
                .lock()
                .expect("rng lock")
                .gen_range(150..=250u64)
        };
        sleep(Duration::from_millis(settle)).await;

        self.shared.tiebreak(info).await?;

        let domain = info.domain_name();
        {
            let mut cache = self.shared.cache.lock().await;
            cache.register(&info.service_type, domain);
            cache.insert_or_update(info, true);
        }
        self.shared.broadcast_service(info).await;
        Ok(())
    }

    /// Broadcasts a goodbye, releases ownership, clears the cache entries,
    /// and tells the listeners. A service this engine never registered is a
    /// warned no-op.
    pub async fn unregister_service(&self, info: &ServiceInfo) {
        info!(
            instance = %info.instance_name,
            service_type = %info.service_type,
            "unregistering service"
        );

        let domain = info.domain_name();
        let owned = {
            self.shared
                .cache
                .lock()
                .await
                .is_registered(&info.service_type, &domain)
        };
        if !owned {
            warn!(%domain, "attempted to unregister a service this engine does not own");
            return;
        }

        let mut goodbye = info.clone();
        goodbye.ttl = 0;
        self.shared.broadcast_service(&goodbye).await;

        {
            let mut cache = self.shared.cache.lock().await;
            cache.unregister(&info.service_type, &domain);
            cache.remove(&info.service_type, &domain);
        }
        self.shared.notify_listeners(|l| l.remove_service(info));
    }

    /// Re-caches and re-announces an owned service after its properties
    /// changed. Not owned → warned no-op.
    pub async fn update_service(&self, info: &ServiceInfo) {
        info!(
            instance = %info.instance_name,
            service_type = %info.service_type,
            "updating service"
        );

        let domain = info.domain_name();
        let owned = {
            self.shared
                .cache
                .lock()
                .await
                .is_registered(&info.service_type, &domain)
        };
        if !owned {
            warn!(%domain, "cannot update a service this engine does not own");
            return;
        }

        {
            self.shared.cache.lock().await.insert_or_update(info, true);
        }
        self.shared.broadcast_service(info).await;
        self.shared.notify_listeners(|l| l.update_service(info));
    }

    /// Sends one pointer query for a service type.
    pub async fn query_type(&self, service_type: &str) {
        self.shared
            .send_packet(Payload::Query {
                questions: vec![Question {
                    name: service_type.to_string(),
                    kind: RecordKind::Pointer,
                }],
            })
            .await;
    }

    /// Applies a received response body to the cache and listeners, exactly
    /// as the receive loop does for a decoded datagram.
    #[cfg(test)]
    pub(crate) async fn ingest_response(&self, answers: Vec<Record>, additional: Vec<Record>) {
        self.shared.handle_response(answers, additional).await;
    }

    /// Reassembled descriptors for every live cached instance of a type.
    pub async fn cached_services(&self, service_type: &str) -> Vec<ServiceInfo> {
        let cache = self.shared.cache.lock().await;
        cache
            .live_domains_of_type(service_type)
            .into_iter()
            .filter_map(|domain| cache.reconstruct(service_type, &domain))
            .collect()
    }
}

impl Shared {
    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        loop {
            let Some(socket) = self.socket.lock().expect("socket lock").clone() else {
                break;
            };
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    debug!(bytes = n, source = %from, "received packet");
                    self.handle_datagram(&buf[..n]).await;
                }
                Err(e) => {
                    warn!(error = %e, "discovery receive failed");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Filters self-echo, then dispatches by payload. Anything undecodable
    /// is dropped with a log line; the loop never dies on network input.
    async fn handle_datagram(&self, data: &[u8]) {
        {
            let sent = self.sent_packets.lock().expect("sent_packets lock");
            if sent.iter().any(|frame| frame.as_slice() == data) {
                return;
            }
        }

        let envelope: Envelope = match wire::unframe(data).and_then(|payload| wire::decode(payload)) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "dropping undecodable datagram");
                return;
            }
        };

        match envelope.payload {
            Payload::Query { questions } => self.handle_query(&questions).await,
            Payload::Response {
                answers,
                additional,
            } => self.handle_response(answers, additional).await,
        }
    }

    /// Answers questions about locally registered services. The meta-type
    /// enumerates everything owned; a registered type question returns every
    /// cached pointer of the type plus details of the owned instances.
    /// Unmatched questions produce nothing; remote records are not relayed.
    async fn handle_query(&self, questions: &[Question]) {
        let (answers, additional) = {
            let cache = self.cache.lock().await;
            let mut answers: Vec<Record> = Vec::new();
            let mut additional: Vec<Record> = Vec::new();

            for question in questions {
                if question.name == SERVICE_DISCOVERY_TYPE {
                    for (service_type, domain) in cache.registered_domains() {
                        if let Some(pointer) = cache.pointer_record(&service_type, &domain) {
                            answers.push(pointer);
                            additional.extend(cache.detail_records(&domain));
                        }
                    }
                } else if cache.has_registered_type(&question.name) {
                    answers.extend(cache.pointer_records_for_type(&question.name));
                    for domain in cache.registered_domains_of(&question.name) {
                        additional.extend(cache.detail_records(&domain));
                    }
                }
            }
            (answers, additional)
        };

        if answers.is_empty() {
            return;
        }
        self.send_packet(Payload::Response {
            answers,
            additional,
        })
        .await;
    }

    /// Splits a response into live announcements and goodbyes, applies both
    /// to the cache, and notifies listeners in descriptor order.
    async fn handle_response(&self, answers: Vec<Record>, additional: Vec<Record>) {
        let (active, goodbye): (Vec<Record>, Vec<Record>) = answers
            .into_iter()
            .chain(additional)
            .partition(|record| !record.is_goodbye());

        if !active.is_empty() {
            let infos = ServiceInfo::from_records(&active);
            let mut events = Vec::with_capacity(infos.len());
            {
                let mut cache = self.cache.lock().await;
                for info in infos {
                    let outcome = cache.insert_or_update(&info, false);
                    events.push((outcome, info));
                }
            }
            for (outcome, info) in events {
                match outcome {
                    CacheUpdate::Added => self.notify_listeners(|l| l.add_service(&info)),
                    CacheUpdate::Refreshed => self.notify_listeners(|l| l.update_service(&info)),
                }
            }
        }

        // A goodbye usually carries only the pointer, so the full descriptor
        // has to come from the cache before the records are dropped.
        let mut removed = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for record in &goodbye {
                let RecordData::Pointer(pointer) = &record.data else {
                    continue;
                };
                if let Some(existing) = cache.reconstruct(&record.name, &pointer.domain_name) {
                    cache.remove(&record.name, &pointer.domain_name);
                    removed.push(existing);
                }
            }
        }
        for info in removed {
            self.notify_listeners(|l| l.remove_service(&info));
        }
    }

    /// Sleep-probe-rename until the candidate name survives
    /// `tiebreak_attempts` consecutive conflict-free probes.
    async fn tiebreak(&self, info: &mut ServiceInfo) -> Result<(), DiscoveryError> {
        let mut attempt = 0;
        let mut next_suffix = 2u32;

        while attempt < self.config.tiebreak_attempts {
            let conflict = {
                let cache = self.cache.lock().await;
                cache.has_live_pointer(&info.service_type, &info.domain_name())
            };
            if conflict {
                if !info.allow_name_change {
                    return Err(DiscoveryError::NonUniqueName(info.instance_name.clone()));
                }
                let renamed = format!("{}-{next_suffix}", base_name(&info.instance_name));
                debug!(from = %info.instance_name, to = %renamed, "name conflict, renaming");
                info.instance_name = renamed;
                next_suffix += 1;
                attempt = 0;
                continue;
            }

            self.send_packet(Payload::Query {
                questions: vec![Question {
                    name: info.service_type.clone(),
                    kind: RecordKind::Pointer,
                }],
            })
            .await;

            let drift = {
                self.rng
                    .lock()
                    .expect("rng lock")
                    .gen_range(0..=self.config.tiebreak_max_drift_ms)
            };
            sleep(Duration::from_millis(self.config.tiebreak_interval_ms + drift)).await;
            attempt += 1;
        }
        Ok(())
    }

    /// Announcement shape: pointer in answers, everything else additional.
    async fn broadcast_service(&self, info: &ServiceInfo) {
        let mut records = info.to_records();
        if records.is_empty() {
            return;
        }
        let additional = records.split_off(1);
        self.send_packet(Payload::Response {
            answers: records,
            additional,
        })
        .await;
    }

    /// Stamps, frames, remembers, and sends. Failures are logged and
    /// swallowed: the cache is already updated optimistically, and the next
    /// renovation cycle repeats the announcement. No socket means no-op.
    async fn send_packet(&self, payload: Payload) {
        let Some(socket) = self.socket.lock().expect("socket lock").clone() else {
            return;
        };

        let transaction_id = {
            self.rng
                .lock()
                .expect("rng lock")
                .gen_range(1..=u16::MAX)
        };
        let envelope = Envelope {
            transaction_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            payload,
        };

        let frame = match wire::frame(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode discovery packet");
                return;
            }
        };

        {
            let mut sent = self.sent_packets.lock().expect("sent_packets lock");
            if sent.len() == SENT_PACKET_WINDOW {
                sent.pop_front();
            }
            sent.push_back(frame.clone());
        }

        debug!(bytes = frame.len(), transaction_id, "sending packet");
        let target = SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT);
        if let Err(e) = socket.send_to(&frame, target).await {
            warn!(error = %e, "failed to send discovery packet");
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        loop {
            sleep(self.config.cleanup_interval).await;
            self.cleanup_pass().await;
        }
    }

    /// One maintenance sweep: expired remote entries go immediately, live
    /// ones are liveness-probed concurrently and the unresponsive follow.
    async fn cleanup_pass(&self) {
        let (expired, alive) = {
            let cache = self.cache.lock().await;
            let mut expired = Vec::new();
            let mut alive = Vec::new();
            for (service_type, domain, is_expired) in cache.remote_pointers() {
                if is_expired {
                    expired.push((service_type, domain));
                } else if let Some(info) = cache.reconstruct(&service_type, &domain) {
                    alive.push((service_type, domain, info));
                }
            }
            (expired, alive)
        };

        let mut unresponsive = Vec::new();
        if !alive.is_empty() {
            let mut probes = JoinSet::new();
            for (service_type, domain, info) in alive {
                let connect_timeout = self.config.health_check_timeout;
                let excluded = self.config.excluded_ip_prefixes.clone();
                probes.spawn(async move {
                    let alive = probe_service(&info, connect_timeout, &excluded).await;
                    (service_type, domain, alive)
                });
            }
            while let Some(result) = probes.join_next().await {
                match result {
                    Ok((service_type, domain, true)) => {
                        debug!(%service_type, %domain, "liveness check passed");
                    }
                    Ok((service_type, domain, false)) => {
                        unresponsive.push((service_type, domain));
                    }
                    Err(e) => warn!(error = %e, "liveness probe task failed"),
                }
            }
        }

        let mut removed = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for (service_type, domain) in expired.iter().chain(unresponsive.iter()) {
                if let Some(info) = cache.reconstruct(service_type, domain) {
                    removed.push(info);
                }
                cache.remove(service_type, domain);
            }
        }
        let removed_count = removed.len();
        for info in removed {
            debug!(
                instance = %info.instance_name,
                service_type = %info.service_type,
                "removing vanished service from cache"
            );
            self.notify_listeners(|l| l.remove_service(&info));
        }

        if removed_count > 0 {
            debug!(
                expired = expired.len(),
                unresponsive = unresponsive.len(),
                "cleanup cycle completed"
            );
        }
    }

    async fn renovate_loop(self: Arc<Self>) {
        let interval = Duration::from_secs_f64(f64::from(DEFAULT_TTL) * RENOVATION_FACTOR);
        loop {
            sleep(interval).await;
            self.renovate_pass().await;
        }
    }

    /// Re-broadcasts every owned service so remote caches never expire us.
    async fn renovate_pass(&self) {
        let registered = { self.cache.lock().await.registered_domains() };
        let mut renovated = 0usize;
        for (service_type, domain) in registered {
            let info = { self.cache.lock().await.reconstruct(&service_type, &domain) };
            if let Some(info) = info {
                self.broadcast_service(&info).await;
                renovated += 1;
            }
        }
        if renovated > 0 {
            debug!(renovated, "ttl renovation cycle completed");
        }
    }

    /// Runs a callback against every listener, isolating panics so one bad
    /// listener cannot starve the rest.
    fn notify_listeners<F: Fn(&dyn ServiceListener)>(&self, callback: F) {
        let listeners: Vec<Arc<dyn ServiceListener>> =
            self.listeners.lock().expect("listeners lock").clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| callback(listener.as_ref()))).is_err() {
                warn!("listener callback panicked; continuing with remaining listeners");
            }
        }
    }
}

/// Strips one trailing `-N` suffix so repeated renames replace the counter
/// instead of stacking: `Lamp-2` → `Lamp`, `My-Lamp` stays `My-Lamp`.
fn base_name(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((base, suffix))
            if !base.is_empty()
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => name,
    }
}

/// Any-interface UDP socket on the discovery port: SO_REUSEPORT so several
/// engines coexist on one host, joined to the group with loopback enabled.
fn bind_multicast_socket() -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true)?;
    socket.bind(&std::net::SocketAddr::from((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT)).into())?;
    socket.set_multicast_loop_v4(true)?;
    socket.join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)?;

    UdpSocket::from_std(socket.into())
}
