pub mod availability;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod protocol;
pub mod snapshot;


pub use availability::Availability;
pub use client::{DriverError, SwitchDriver, TcpDeviceClient};
pub use config::{ConfigError, CoordinatorConfig, Endpoint, DEFAULT_PORT};
pub use coordinator::{CoordinatorStatus, PollQuality, PollState, PollingCoordinator, RefreshError};
pub use protocol::{Attributes, CommandCode, CommandEnvelope, QueryMode, ResponseEnvelope};
pub use snapshot::{DeviceSnapshot, SnapshotError};
