//! Multicast service discovery: engine, cache, descriptors, browser.

pub mod browser;
pub mod cache;
pub mod engine;
pub mod info;
pub mod probe;

pub use browser::ServiceBrowser;
pub use cache::{CacheEntry, CacheUpdate, RecordCache};
pub use engine::{
    DEFAULT_RANDOM_SEED, Discovery, DiscoveryConfig, DiscoveryError, ServiceListener,
};
pub use info::ServiceInfo;
pub use probe::{DEFAULT_HEALTH_CHECK_TIMEOUT, default_excluded_prefixes, probe_service};
