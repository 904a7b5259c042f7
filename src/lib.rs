pub mod command;
pub mod discovery;
pub mod transport;
pub mod types;
pub mod wire;

pub use command::{
    ActuatorAction, CommandRequest, CommandResponse, ErrorCode, ErrorDetails, LightAction,
    SinkAction,
};
pub use discovery::{
    Discovery, DiscoveryConfig, DiscoveryError, ServiceBrowser, ServiceInfo, ServiceListener,
};
pub use transport::{
    TransportError, bind_ephemeral, local_ipv4_addresses, send_request, serve,
};
pub use types::{
    DEFAULT_TTL, DeviceCategory, DeviceKind, SERVICE_DISCOVERY_TYPE, TransportProtocol,
};
pub use wire::{MULTICAST_ADDR, MULTICAST_PORT};
