//! The logical service descriptor and its record (de)composition.

use crate::transport::local_ipv4_addresses;
use crate::types::{
    DEFAULT_TTL, DeviceCategory, DeviceKind, PROP_CATEGORY, PROP_KIND, TransportProtocol,
    domain_name,
};
use crate::wire::{
    AddressData, EndpointData, PointerData, Record, RecordData, TextData,
};
use std::collections::BTreeMap;

/// Everything the fabric knows about one service instance.
///
/// Hosts build one of these per hosted service; the engine hands equivalent
/// values to listeners for remote services, reassembled from cached records.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub instance_name: String,
    pub service_type: String,
    pub port: u16,
    pub kind: DeviceKind,
    pub category: DeviceCategory,
    pub protocol: TransportProtocol,
    pub properties: BTreeMap<String, String>,
    pub addresses: Vec<String>,
    /// Record lifetime in seconds; zero turns any announcement into a goodbye.
    pub ttl: u32,
    /// Whether tiebreaking may append a `-N` suffix instead of failing.
    pub allow_name_change: bool,
}

impl ServiceInfo {
    /// Builds a descriptor with the host's own addresses, the default TTL,
    /// and renaming allowed.
    pub fn new(
        instance_name: impl Into<String>,
        service_type: impl Into<String>,
        port: u16,
        kind: DeviceKind,
        category: DeviceCategory,
        protocol: TransportProtocol,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            service_type: service_type.into(),
            port,
            kind,
            category,
            protocol,
            properties,
            addresses: local_ipv4_addresses(),
            ttl: DEFAULT_TTL,
            allow_name_change: true,
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn deny_name_change(mut self) -> Self {
        self.allow_name_change = false;
        self
    }

    /// `<instance_name>.<service_type>`, unique within the fabric.
    pub fn domain_name(&self) -> String {
        domain_name(&self.service_type, &self.instance_name)
    }

    /// Decomposes into `[pointer, address*, endpoint, text]`.
    ///
    /// The pointer announces under the service type without cache_flush; the
    /// per-instance records flush so stale details are replaced wholesale.
    /// The text record carries the kind and category under reserved keys
    /// alongside the free-form properties.
    pub fn to_records(&self) -> Vec<Record> {
        let domain = self.domain_name();
        let mut records = Vec::with_capacity(3 + self.addresses.len());

        records.push(Record {
            name: self.service_type.clone(),
            ttl: self.ttl,
            cache_flush: false,
            data: RecordData::Pointer(PointerData {
                name: self.service_type.clone(),
                domain_name: domain.clone(),
            }),
        });

        for address in &self.addresses {
            records.push(Record {
                name: domain.clone(),
                ttl: self.ttl,
                cache_flush: true,
                data: RecordData::Address(AddressData {
                    name: domain.clone(),
                    address: address.clone(),
                }),
            });
        }

        // The endpoint label fields are opaque on the wire; only port and
        // target are ever read back.
        let service_label = self
            .service_type
            .split('.')
            .next()
            .unwrap_or("_unknown")
            .to_string();
        records.push(Record {
            name: domain.clone(),
            ttl: self.ttl,
            cache_flush: true,
            data: RecordData::Endpoint(EndpointData {
                name: self.instance_name.clone(),
                protocol: self.protocol.wire_name().to_string(),
                service: service_label,
                instance: self.instance_name.clone(),
                port: self.port,
                target: domain.clone(),
            }),
        });

        let mut entries = BTreeMap::new();
        entries.insert(PROP_KIND.to_string(), self.kind.wire_name().to_string());
        entries.insert(
            PROP_CATEGORY.to_string(),
            self.category.wire_name().to_string(),
        );
        for (key, value) in &self.properties {
            entries.insert(key.clone(), value.clone());
        }
        records.push(Record {
            name: domain.clone(),
            ttl: self.ttl,
            cache_flush: true,
            data: RecordData::Text(TextData {
                name: domain,
                entries,
            }),
        });

        records
    }

    /// Reassembles descriptors from a mixed record set.
    ///
    /// Each pointer seeds one descriptor; address, endpoint, and text records
    /// attach by their `name` matching the pointer's instance domain. Missing
    /// details degrade gracefully: no endpoint means port 0 and an unknown
    /// protocol, no text means empty properties and unknown kind/category.
    pub fn from_records(records: &[Record]) -> Vec<ServiceInfo> {
        let mut pointers: Vec<(&Record, &PointerData)> = Vec::new();
        let mut endpoints: BTreeMap<&str, &EndpointData> = BTreeMap::new();
        let mut texts: BTreeMap<&str, &TextData> = BTreeMap::new();
        let mut addresses: BTreeMap<&str, Vec<&AddressData>> = BTreeMap::new();

        for record in records {
            match &record.data {
                RecordData::Pointer(ptr) => pointers.push((record, ptr)),
                RecordData::Endpoint(srv) => {
                    endpoints.insert(record.name.as_str(), srv);
                }
                RecordData::Text(txt) => {
                    texts.insert(record.name.as_str(), txt);
                }
                RecordData::Address(a) => {
                    addresses.entry(record.name.as_str()).or_default().push(a);
                }
            }
        }

        let mut infos = Vec::with_capacity(pointers.len());
        for (record, ptr) in pointers {
            let domain = ptr.domain_name.as_str();
            let instance_name = domain.split('.').next().unwrap_or(domain).to_string();

            let mut info = ServiceInfo {
                instance_name,
                service_type: ptr.name.clone(),
                port: 0,
                kind: DeviceKind::Unknown,
                category: DeviceCategory::Unknown,
                protocol: TransportProtocol::Unknown,
                properties: BTreeMap::new(),
                addresses: Vec::new(),
                ttl: record.ttl,
                allow_name_change: true,
            };

            if let Some(addrs) = addresses.get(domain) {
                info.addresses = addrs.iter().map(|a| a.address.clone()).collect();
            }
            if let Some(endpoint) = endpoints.get(domain) {
                info.port = endpoint.port;
                info.protocol = TransportProtocol::from_wire_name(&endpoint.protocol);
            }
            if let Some(text) = texts.get(domain) {
                info.properties = text.entries.clone();
                info.kind = DeviceKind::from_wire_name(
                    info.properties
                        .get(PROP_KIND)
                        .map(String::as_str)
                        .unwrap_or(""),
                );
                info.category = DeviceCategory::from_wire_name(
                    info.properties
                        .get(PROP_CATEGORY)
                        .map(String::as_str)
                        .unwrap_or(""),
                );
            }

            infos.push(info);
        }

        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RecordKind;

    fn lamp() -> ServiceInfo {
        ServiceInfo::new(
            "Lamp",
            "_lightlamp._tcp.local.",
            1234,
            DeviceKind::Actuator,
            DeviceCategory::LightLamp,
            TransportProtocol::Tcp,
            BTreeMap::from([("is_on".to_string(), "false".to_string())]),
        )
        .with_addresses(vec!["10.0.0.5".into()])
    }

    #[test]
    fn to_records_shape() {
        let info = lamp().with_addresses(vec!["10.0.0.5".into(), "10.0.0.6".into()]);
        let records = info.to_records();
        let kinds: Vec<RecordKind> = records.iter().map(Record::kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecordKind::Pointer,
                RecordKind::Address,
                RecordKind::Address,
                RecordKind::Endpoint,
                RecordKind::Text,
            ]
        );
        assert!(!records[0].cache_flush);
        assert!(records[1..].iter().all(|r| r.cache_flush));
        assert!(records.iter().all(|r| r.ttl == DEFAULT_TTL));
    }

    #[test]
    fn text_record_injects_reserved_keys() {
        let records = lamp().to_records();
        let RecordData::Text(text) = &records.last().unwrap().data else {
            panic!("last record must be text");
        };
        assert_eq!(text.entries[PROP_KIND], "ACTUATOR_KIND");
        assert_eq!(text.entries[PROP_CATEGORY], "LIGHT_LAMP");
        assert_eq!(text.entries["is_on"], "false");
    }

    #[test]
    fn records_round_trip() {
        let original = lamp();
        let infos = ServiceInfo::from_records(&original.to_records());
        assert_eq!(infos.len(), 1);
        let back = &infos[0];
        assert_eq!(back.instance_name, original.instance_name);
        assert_eq!(back.service_type, original.service_type);
        assert_eq!(back.port, original.port);
        assert_eq!(back.kind, original.kind);
        assert_eq!(back.category, original.category);
        assert_eq!(back.protocol, original.protocol);
        assert_eq!(back.addresses, original.addresses);
        assert_eq!(back.ttl, original.ttl);
        // Reserved keys are injected into the property map on the wire.
        assert_eq!(back.properties["is_on"], "false");
        assert_eq!(back.properties[PROP_KIND], "ACTUATOR_KIND");
    }

    #[test]
    fn pointer_alone_degrades_to_defaults() {
        let records = vec![Record {
            name: "_sink._tcp.local.".into(),
            ttl: 60,
            cache_flush: false,
            data: RecordData::Pointer(PointerData {
                name: "_sink._tcp.local.".into(),
                domain_name: "Kitchen._sink._tcp.local.".into(),
            }),
        }];
        let infos = ServiceInfo::from_records(&records);
        assert_eq!(infos.len(), 1);
        let info = &infos[0];
        assert_eq!(info.instance_name, "Kitchen");
        assert_eq!(info.port, 0);
        assert_eq!(info.protocol, TransportProtocol::Unknown);
        assert_eq!(info.kind, DeviceKind::Unknown);
        assert!(info.properties.is_empty());
        assert!(info.addresses.is_empty());
    }

    #[test]
    fn unknown_enum_strings_widen() {
        let mut info = lamp();
        info.properties
            .insert(PROP_KIND.to_string(), "GIZMO_KIND".to_string());
        let mut records = info.to_records();
        // Overwrite the injected kind with an unrecognized name.
        if let RecordData::Text(text) = &mut records.last_mut().unwrap().data {
            text.entries
                .insert(PROP_KIND.to_string(), "GIZMO_KIND".to_string());
        }
        let infos = ServiceInfo::from_records(&records);
        assert_eq!(infos[0].kind, DeviceKind::Unknown);
        assert_eq!(infos[0].category, DeviceCategory::LightLamp);
    }

    #[test]
    fn empty_input_yields_no_descriptors() {
        assert!(ServiceInfo::from_records(&[]).is_empty());
    }
}
