//! Fabric-wide constants and device vocabulary.
//!
//! The enums here travel inside text records as their wire names
//! (`DeviceKind::Actuator` ⇄ `"ACTUATOR_KIND"`), so every variant has a
//! stable string form. Parsing an unrecognized name widens to the `Unknown`
//! variant instead of failing, since remote devices may speak a newer
//! vocabulary.

use serde::{Deserialize, Serialize};

/// Default record lifetime in seconds. Owned services are re-announced at
/// 75% of this, so remote caches never see an owned record lapse.
pub const DEFAULT_TTL: u32 = 4500;

/// Meta service type. A query for this name enumerates every locally
/// registered service; a browser subscribed to it receives every event.
pub const SERVICE_DISCOVERY_TYPE: &str = "_services._dns-sd._udp.local";

/// Reserved text-record key carrying the device kind.
pub const PROP_KIND: &str = "kind";

/// Reserved text-record key carrying the device category.
pub const PROP_CATEGORY: &str = "category";

/// Composes the instance domain: `<instance>.<service_type>`.
pub fn domain_name(service_type: &str, instance_name: &str) -> String {
    format!("{instance_name}.{service_type}")
}

/// What role a device plays on the fabric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    #[default]
    Unknown,
    Sensor,
    Actuator,
}

impl DeviceKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            DeviceKind::Unknown => "UNKNOWN_KIND",
            DeviceKind::Sensor => "SENSOR_KIND",
            DeviceKind::Actuator => "ACTUATOR_KIND",
        }
    }

    pub fn from_wire_name(name: &str) -> Self {
        match name {
            "SENSOR_KIND" => DeviceKind::Sensor,
            "ACTUATOR_KIND" => DeviceKind::Actuator,
            _ => DeviceKind::Unknown,
        }
    }
}

/// What appliance the device is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceCategory {
    #[default]
    Unknown,
    LightLamp,
    Sink,
    Toilet,
    FartDetector,
}

impl DeviceCategory {
    pub fn wire_name(&self) -> &'static str {
        match self {
            DeviceCategory::Unknown => "UNKNOWN_CATEGORY",
            DeviceCategory::LightLamp => "LIGHT_LAMP",
            DeviceCategory::Sink => "SINK",
            DeviceCategory::Toilet => "TOILET",
            DeviceCategory::FartDetector => "FART_DETECTOR",
        }
    }

    pub fn from_wire_name(name: &str) -> Self {
        match name {
            "LIGHT_LAMP" => DeviceCategory::LightLamp,
            "SINK" => DeviceCategory::Sink,
            "TOILET" => DeviceCategory::Toilet,
            "FART_DETECTOR" => DeviceCategory::FartDetector,
            _ => DeviceCategory::Unknown,
        }
    }
}

/// Transport a device's control endpoint listens on. Only TCP endpoints are
/// liveness-probed; anything else can only be expired by TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportProtocol {
    #[default]
    Unknown,
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn wire_name(&self) -> &'static str {
        match self {
            TransportProtocol::Unknown => "UNKNOWN_PROTOCOL",
            TransportProtocol::Tcp => "TCP_PROTOCOL",
            TransportProtocol::Udp => "UDP_PROTOCOL",
        }
    }

    pub fn from_wire_name(name: &str) -> Self {
        match name {
            "TCP_PROTOCOL" => TransportProtocol::Tcp,
            "UDP_PROTOCOL" => TransportProtocol::Udp,
            _ => TransportProtocol::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for kind in [DeviceKind::Unknown, DeviceKind::Sensor, DeviceKind::Actuator] {
            assert_eq!(DeviceKind::from_wire_name(kind.wire_name()), kind);
        }
        for cat in [
            DeviceCategory::Unknown,
            DeviceCategory::LightLamp,
            DeviceCategory::Sink,
            DeviceCategory::Toilet,
            DeviceCategory::FartDetector,
        ] {
            assert_eq!(DeviceCategory::from_wire_name(cat.wire_name()), cat);
        }
    }

    #[test]
    fn unknown_names_widen() {
        assert_eq!(DeviceKind::from_wire_name("THERMOSTAT_KIND"), DeviceKind::Unknown);
        assert_eq!(TransportProtocol::from_wire_name("QUIC_PROTOCOL"), TransportProtocol::Unknown);
    }

    #[test]
    fn domain_name_composition() {
        assert_eq!(
            domain_name("_sink._tcp.local.", "Kitchen"),
            "Kitchen._sink._tcp.local."
        );
    }
}
