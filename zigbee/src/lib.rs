//ezsp host controller for silicon labs zigbee coordinators
//
//layering, bottom up: serial (byte transport) -> ash (framed, windowed link)
//-> ezsp (command/response + callbacks) -> zcl (cluster payloads) ->
//controller (device table and the device contract).
//
//lock order, outermost first: transport write lock, ash state, ash sequences,
//ash pending, ezsp responses, controller devices, controller subscribers.

pub mod serial;
pub mod ash;
pub mod ezsp;
pub mod zcl;
pub mod controller;

pub use controller::Controller;

#[derive(Debug)]
pub enum Error {
	Serial(serialport::Error),
	Io(std::io::Error),
	Deku(deku::DekuError),
	Zcl(zcl::Error),
	NotConnected,
	Timeout,
	Stopped,
	Protocol(String),
}

impl core::fmt::Display for Error {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		match self {
			Self::Serial(e) => e.fmt(f),
			Self::Io(e) => e.fmt(f),
			Self::Deku(e) => e.fmt(f),
			Self::Zcl(e) => e.fmt(f),
			Self::NotConnected => write!(f, "ash not connected"),
			Self::Timeout => write!(f, "timed out"),
			Self::Stopped => write!(f, "layer stopped"),
			Self::Protocol(s) => write!(f, "{}", s),
		}
	}
}

impl From<serialport::Error> for Error {
	fn from(e: serialport::Error) -> Self {
		Error::Serial(e)
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Error::Io(e)
	}
}

impl From<deku::DekuError> for Error {
	fn from(e: deku::DekuError) -> Self {
		Error::Deku(e)
	}
}

impl From<zcl::Error> for Error {
	fn from(e: zcl::Error) -> Self {
		Error::Zcl(e)
	}
}

impl From<Error> for device::Error {
	fn from(e: Error) -> Self {
		match e {
			Error::Serial(e) => device::Error::Io(e.to_string()),
			Error::Io(e) => device::Error::Io(e.to_string()),
			Error::Deku(e) => device::Error::Protocol(e.to_string()),
			Error::Zcl(e) => device::Error::Protocol(e.to_string()),
			Error::NotConnected | Error::Stopped => device::Error::NotConnected,
			Error::Timeout => device::Error::Timeout,
			Error::Protocol(s) => device::Error::Protocol(s),
		}
	}
}
