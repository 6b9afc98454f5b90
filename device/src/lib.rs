//protocol-agnostic device contract shared by controller implementations
//and the surfaces that consume them (rest api, assistant tools)

pub mod null;
pub use null::{ NullController, NullEventSubscriber };

use serde::{ Serialize, Deserialize };
use chrono::{ DateTime, Utc };
use crossbeam_channel::Receiver;

#[derive(Debug)]
pub enum Error {
	NotFound,
	Timeout,
	NotConnected,
	Unsupported,
	Validation(String),
	Io(String),
	Protocol(String),
}

impl core::fmt::Display for Error {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		match self {
			Self::NotFound => write!(f, "device not found"),
			Self::Timeout => write!(f, "operation timed out"),
			Self::NotConnected => write!(f, "controller not connected"),
			Self::Unsupported => write!(f, "operation not supported"),
			Self::Validation(s) => write!(f, "validation error: {}", s),
			Self::Io(s) => write!(f, "io error: {}", s),
			Self::Protocol(s) => write!(f, "protocol error: {}", s),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
	Zigbee,
	Zwave,
	Matter,
	Wifi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
	Light,
	Switch,
	Sensor,
	Coordinator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
	pub id: String,
	pub name: String,
	#[serde(rename = "type")]
	pub device_type: DeviceType,
	pub protocol: Protocol,
	pub manufacturer: String,
	pub model: String,
	pub state_schema: serde_json::Value,
}

//current device state as a dynamic attribute map
pub type DeviceState = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	DeviceJoined,
	DeviceLeft,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryEvent {
	#[serde(rename = "type")]
	pub event_type: EventType,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub device: Option<Device>,
	pub timestamp: DateTime<Utc>,
}

pub trait Controller: Send + Sync {
	fn list_devices(&self) -> Result<Vec<Device>, Error>;
	fn get_device(&self, id: &str) -> Result<Device, Error>;
	fn rename_device(&self, id: &str, new_name: &str) -> Result<(), Error>;
	fn remove_device(&self, id: &str, force: bool) -> Result<(), Error>;
	fn get_device_state(&self, id: &str) -> Result<DeviceState, Error>;
	fn set_device_state(&self, id: &str, state: &DeviceState) -> Result<DeviceState, Error>;
	fn permit_join(&self, enable: bool, duration_s: u16) -> Result<(), Error>;
	fn is_connected(&self) -> bool;
	fn close(&self);
}

//a live event subscription; events stop after the owning subscriber unsubscribes
pub struct Subscription {
	pub id: u64,
	pub events: Receiver<DiscoveryEvent>,
}

pub trait EventSubscriber: Send + Sync {
	fn subscribe(&self) -> Subscription;
	fn unsubscribe(&self, sub: Subscription);
}

//schema validation collaborator; implementations live outside this workspace
pub trait StateValidator: Send + Sync {
	fn validate(&self, schema: &serde_json::Value, input: &DeviceState) -> Result<(), Error>;
}
