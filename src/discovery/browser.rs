//! Type-filtered view over the engine's listener stream.

use super::engine::{Discovery, DiscoveryError, ServiceListener};
use super::info::ServiceInfo;
use crate::types::SERVICE_DISCOVERY_TYPE;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Subscribes a delegate to a chosen set of service types.
///
/// On start the browser replays whatever the engine has already cached for
/// the subscribed types (a browser attached late must not miss devices that
/// announced earlier), then queries the fabric once per type. Afterwards it
/// forwards engine callbacks whose type is subscribed; subscribing to the
/// meta-type passes everything through.
pub struct ServiceBrowser {
    discovery: Discovery,
    service_types: HashSet<String>,
    delegate: Arc<dyn ServiceListener>,
    started: AtomicBool,
}

impl ServiceBrowser {
    pub fn new(
        discovery: Discovery,
        service_types: impl IntoIterator<Item = String>,
        delegate: Arc<dyn ServiceListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            service_types: service_types.into_iter().collect(),
            delegate,
            started: AtomicBool::new(false),
        })
    }

    /// Starts the engine if needed, attaches, replays, and queries.
    /// Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.discovery.start().await?;
        self.discovery
            .add_listener(self.clone() as Arc<dyn ServiceListener>);

        self.replay_cache().await;

        for service_type in &self.service_types {
            self.discovery.query_type(service_type).await;
        }
        Ok(())
    }

    async fn replay_cache(&self) {
        for service_type in &self.service_types {
            for info in self.discovery.cached_services(service_type).await {
                debug!(
                    instance = %info.instance_name,
                    %service_type,
                    "replaying cached service to delegate"
                );
                self.delegate.add_service(&info);
            }
        }
    }

    fn wants(&self, service_type: &str) -> bool {
        self.service_types.contains(SERVICE_DISCOVERY_TYPE)
            || self.service_types.contains(service_type)
    }
}

impl ServiceListener for ServiceBrowser {
    fn add_service(&self, info: &ServiceInfo) {
        if self.wants(&info.service_type) {
            self.delegate.add_service(info);
        }
    }

    fn update_service(&self, info: &ServiceInfo) {
        if self.wants(&info.service_type) {
            self.delegate.update_service(info);
        }
    }

    fn remove_service(&self, info: &ServiceInfo) {
        if self.wants(&info.service_type) {
            self.delegate.remove_service(info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::engine::DiscoveryConfig;
    use crate::types::{DeviceCategory, DeviceKind, TransportProtocol};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl ServiceListener for Recorder {
        fn add_service(&self, info: &ServiceInfo) {
            self.added.lock().unwrap().push(info.domain_name());
        }
        fn update_service(&self, _info: &ServiceInfo) {}
        fn remove_service(&self, info: &ServiceInfo) {
            self.removed.lock().unwrap().push(info.domain_name());
        }
    }

    fn remote(instance: &str, service_type: &str) -> ServiceInfo {
        ServiceInfo::new(
            instance,
            service_type,
            9000,
            DeviceKind::Actuator,
            DeviceCategory::Sink,
            TransportProtocol::Tcp,
            BTreeMap::new(),
        )
        .with_addresses(vec!["10.0.0.7".into()])
        .with_ttl(60)
    }

    fn quiet_config() -> DiscoveryConfig {
        DiscoveryConfig {
            automatic_cleanup: false,
            automatic_renovation: false,
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn filtering_by_type() {
        let discovery = Discovery::new(quiet_config());
        let recorder = Arc::new(Recorder::default());
        let browser = ServiceBrowser::new(
            discovery,
            ["_sink._tcp.local.".to_string()],
            recorder.clone(),
        );

        browser.add_service(&remote("Kitchen", "_sink._tcp.local."));
        browser.add_service(&remote("Hall", "_lightlamp._tcp.local."));

        assert_eq!(
            *recorder.added.lock().unwrap(),
            vec!["Kitchen._sink._tcp.local.".to_string()]
        );
    }

    #[test]
    fn meta_type_passes_everything() {
        let discovery = Discovery::new(quiet_config());
        let recorder = Arc::new(Recorder::default());
        let browser = ServiceBrowser::new(
            discovery,
            [SERVICE_DISCOVERY_TYPE.to_string()],
            recorder.clone(),
        );

        browser.add_service(&remote("Kitchen", "_sink._tcp.local."));
        browser.remove_service(&remote("Hall", "_lightlamp._tcp.local."));

        assert_eq!(recorder.added.lock().unwrap().len(), 1);
        assert_eq!(recorder.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_delivers_preexisting_cache() {
        let discovery = Discovery::new(quiet_config());
        let recorder = Arc::new(Recorder::default());

        // The engine learned about a sink before the browser existed.
        let announced = remote("Kitchen", "_sink._tcp.local.");
        let mut records = announced.to_records();
        let additional = records.split_off(1);
        discovery.ingest_response(records, additional).await;

        let browser = ServiceBrowser::new(
            discovery,
            ["_sink._tcp.local.".to_string()],
            recorder.clone(),
        );
        browser.replay_cache().await;

        assert_eq!(
            *recorder.added.lock().unwrap(),
            vec!["Kitchen._sink._tcp.local.".to_string()]
        );
    }

    #[tokio::test]
    async fn forwarded_events_respect_subscription_after_attach() {
        let discovery = Discovery::new(quiet_config());
        let recorder = Arc::new(Recorder::default());
        let browser = ServiceBrowser::new(
            discovery.clone(),
            ["_sink._tcp.local.".to_string()],
            recorder.clone(),
        );
        discovery.add_listener(browser);

        let sink = remote("Kitchen", "_sink._tcp.local.");
        let mut records = sink.to_records();
        let additional = records.split_off(1);
        discovery.ingest_response(records, additional).await;

        let lamp = remote("Hall", "_lightlamp._tcp.local.");
        let mut records = lamp.to_records();
        let additional = records.split_off(1);
        discovery.ingest_response(records, additional).await;

        assert_eq!(
            *recorder.added.lock().unwrap(),
            vec!["Kitchen._sink._tcp.local.".to_string()]
        );
    }
}
