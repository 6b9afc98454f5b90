//no-op controller used when no coordinator hardware is configured,
//so the surfaces can run in limited mode

use crate::{ Controller, Device, DeviceState, Error, EventSubscriber, Subscription };
use crossbeam_channel::bounded;
use log::info;

pub struct NullController;

impl NullController {
	pub fn new() -> Self {
		NullController
	}
}

impl Default for NullController {
	fn default() -> Self {
		Self::new()
	}
}

impl Controller for NullController {
	fn list_devices(&self) -> Result<Vec<Device>, Error> {
		Ok(Vec::new())
	}

	fn get_device(&self, _id: &str) -> Result<Device, Error> {
		Err(Error::NotFound)
	}

	fn rename_device(&self, _id: &str, _new_name: &str) -> Result<(), Error> {
		Err(Error::NotConnected)
	}

	fn remove_device(&self, _id: &str, _force: bool) -> Result<(), Error> {
		Err(Error::NotConnected)
	}

	fn get_device_state(&self, _id: &str) -> Result<DeviceState, Error> {
		Err(Error::NotConnected)
	}

	fn set_device_state(&self, _id: &str, _state: &DeviceState) -> Result<DeviceState, Error> {
		Err(Error::NotConnected)
	}

	fn permit_join(&self, enable: bool, duration_s: u16) -> Result<(), Error> {
		info!("permit join ignored (no adapter): enable={}, duration={}s", enable, duration_s);

		Err(Error::NotConnected)
	}

	fn is_connected(&self) -> bool {
		false
	}

	fn close(&self) {}
}

pub struct NullEventSubscriber;

impl NullEventSubscriber {
	pub fn new() -> Self {
		NullEventSubscriber
	}
}

impl Default for NullEventSubscriber {
	fn default() -> Self {
		Self::new()
	}
}

impl EventSubscriber for NullEventSubscriber {
	fn subscribe(&self) -> Subscription {
		//sender is dropped immediately; the channel never carries events
		let (_tx, rx) = bounded(1);

		Subscription { id: 0, events: rx }
	}

	fn unsubscribe(&self, _sub: Subscription) {}
}
