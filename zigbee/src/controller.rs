//controller session: owns the serial link, the ash and ezsp layers and the
//device table, and maps the device contract onto zcl unicasts

use crate::{ ash::AshLayer, ezsp::{ self, EzspLayer }, serial::{ SerialTransport, Transport }, zcl, Error };
use chrono::Utc;
use crossbeam_channel::{ bounded, Sender };
use device::{
	Controller as _, Device, DeviceState, DeviceType, DiscoveryEvent, EventSubscriber, EventType,
	Protocol, StateValidator, Subscription,
};
use log::{ debug, info, warn };
use rand::Rng;
use serde_json::{ json, Value };
use std::collections::HashMap;
use std::sync::{ Arc, Mutex, RwLock };
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use std::thread;
use std::time::Duration;

//how long get_device_state waits for the attribute report to land
const READ_SETTLE: Duration = Duration::from_millis(200);
//level transition passed with move-to-level, in tenths of a second
const LEVEL_TRANSITION: u16 = 10;

//a zigbee device the trust center has seen join the network
#[derive(Debug, Clone)]
pub struct KnownDevice {
	pub ieee: [u8; 8],
	//short address; a rejoin may hand the same ieee a new one
	pub node_id: u16,
	pub device_type: DeviceType,
	pub endpoint: u8,
	pub state: DeviceState,
}

struct Shared {
	devices: RwLock<HashMap<String, KnownDevice>>,
	subscribers: Mutex<Vec<(u64, Sender<DiscoveryEvent>)>>,
	next_subscriber: AtomicU64,
}

pub struct Controller<T: Transport> {
	transport: Arc<T>,
	ash: Arc<AshLayer<T>>,
	ezsp: Arc<EzspLayer<T>>,
	shared: Arc<Shared>,
	codec: zcl::Codec,
	connected: AtomicBool,
	validator: Option<Box<dyn StateValidator>>,
}

impl Controller<SerialTransport> {
	//opens the serial device and brings the whole stack up
	pub fn open(port_path: &str) -> Result<Self, device::Error> {
		info!("initializing zigbee controller on {}", port_path);

		let transport = Arc::new(SerialTransport::open(port_path).map_err(Error::from)?);

		Self::with_transport(transport, None)
	}
}

impl<T: Transport + 'static> Controller<T> {
	//brings the stack up over an already-open transport. layers come up
	//bottom to top and are torn down in reverse on failure.
	pub fn with_transport(
		transport: Arc<T>,
		validator: Option<Box<dyn StateValidator>>,
	) -> Result<Self, device::Error> {
		let ash = AshLayer::new(Arc::clone(&transport));
		let ezsp = EzspLayer::new(Arc::clone(&ash));
		let shared = Arc::new(Shared {
			devices: RwLock::new(HashMap::new()),
			subscribers: Mutex::new(Vec::new()),
			next_subscriber: AtomicU64::new(1),
		});

		{
			let shared = Arc::clone(&shared);

			ezsp.set_callback_handler(Box::new(move |frame_id, data| {
				shared.handle_callback(frame_id, data);
			}));
		}

		info!("connecting ash layer");

		if let Err(e) = ash.connect() {
			transport.close();

			return Err(e.into());
		}

		ezsp.start();

		let controller = Self {
			transport,
			ash,
			ezsp,
			shared,
			codec: zcl::Codec::new(),
			connected: AtomicBool::new(false),
			validator,
		};

		info!("initializing ezsp stack");

		if let Err(e) = controller.init_stack() {
			controller.close();

			return Err(e.into());
		}

		controller.connected.store(true, Ordering::SeqCst);

		info!("zigbee controller ready");

		Ok(controller)
	}

	fn init_stack(&self) -> Result<(), Error> {
		let version = self.ezsp.negotiate_version()?;

		info!(
			"ezsp protocol {} (stack version {:#06x})",
			version.protocol_version, version.stack_version
		);

		self.ezsp.configure_stack();

		let status = self.ezsp.network_init()?;

		match status {
			ezsp::EmberStatus::Success | ezsp::EmberStatus::NetworkUp => {
				info!("resumed existing zigbee network");
			},
			status => {
				info!("no existing network ({:?}), forming a new one", status);

				self.form_network()?;

				//let the stack status callback settle before first use
				thread::sleep(Duration::from_millis(500));
			}
		}

		match self.ezsp.get_eui64() {
			Ok(eui) => info!("coordinator ieee {}", format_ieee(&eui)),
			Err(e) => warn!("eui64 read failed: {}", e),
		}

		match self.ezsp.get_network_parameters() {
			Ok(p) => info!(
				"network parameters: channel={}, pan_id={:#06x}",
				p.parameters.radio_channel, p.parameters.pan_id
			),
			Err(e) => warn!("network parameters read failed: {}", e),
		}

		Ok(())
	}

	fn form_network(&self) -> Result<(), Error> {
		let mut rng = rand::thread_rng();

		let parameters = ezsp::EmberNetworkParameters {
			extended_pan_id: rng.gen(),
			pan_id: rng.gen_range(1..=0xfffe),
			radio_tx_power: 3,
			radio_channel: 15,
			join_method: ezsp::JOIN_METHOD_MAC_ASSOCIATION,
			nwk_manager_id: 0xffff,
			nwk_update_id: 0,
			channels: 0,
		};

		self.ezsp.form_network(&parameters)
	}

	fn unicast(&self, kd: &KnownDevice, cluster_id: u16, payload: &[u8]) -> Result<(), Error> {
		self.ezsp.send_unicast(kd.node_id, zcl::PROFILE_HA, cluster_id, 1, kd.endpoint, payload)
	}
}

impl Shared {
	fn handle_callback(&self, frame_id: u16, data: &[u8]) {
		match frame_id {
			ezsp::FRAME_TRUST_CENTER_JOIN_HANDLER => self.handle_trust_center_join(data),
			ezsp::FRAME_INCOMING_MESSAGE_HANDLER => self.handle_incoming_message(data),
			ezsp::FRAME_STACK_STATUS_HANDLER => self.handle_stack_status(data),
			_ => debug!("unhandled ezsp callback: frame_id={:#06x}", frame_id),
		}
	}

	fn handle_trust_center_join(&self, data: &[u8]) {
		let join = match ezsp::TrustCenterJoin::try_from(data) {
			Ok(j) => j,
			Err(e) => {
				debug!("trust center join callback too short: {}", e);

				return;
			}
		};

		let id = format_ieee(&join.ieee);

		info!(
			"trust center join: ieee={}, node_id={:#06x}, status={:#04x}",
			id, join.node_id, join.status
		);

		if join.status == ezsp::DEVICE_UPDATE_DEVICE_LEFT {
			let removed = self.devices.write().unwrap().remove(&id);
			let view = removed.map(|kd| device_view(&id, &kd));

			self.publish(EventType::DeviceLeft, view);

			return;
		}

		let view = {
			let mut devices = self.devices.write().unwrap();
			let entry = devices.entry(id.clone()).or_insert_with(|| KnownDevice {
				ieee: join.ieee,
				node_id: join.node_id,
				//most home automation devices; a zdo descriptor query on
				//join would do better
				device_type: DeviceType::Light,
				endpoint: 1,
				state: DeviceState::new(),
			});

			//rejoins must keep the table entry and take the new short
			//address, or later unicasts go to a stale node id
			entry.node_id = join.node_id;

			device_view(&id, entry)
		};

		self.publish(EventType::DeviceJoined, Some(view));
	}

	fn handle_incoming_message(&self, data: &[u8]) {
		let msg = match ezsp::IncomingMessage::try_from(data) {
			Ok(m) => m,
			Err(e) => {
				debug!("incoming message callback truncated: {}", e);

				return;
			}
		};

		debug!(
			"incoming message: cluster={:#06x}, sender={:#06x}, len={}",
			msg.aps_frame.cluster_id, msg.sender, msg.message_contents.len()
		);

		let mut devices = self.devices.write().unwrap();

		if let Some(kd) = devices.values_mut().find(|kd| kd.node_id == msg.sender) {
			update_state_from_zcl(kd, msg.aps_frame.cluster_id, &msg.message_contents);
		}
	}

	fn handle_stack_status(&self, data: &[u8]) {
		if data.is_empty() {
			return;
		}

		match ezsp::EmberStatus::from(data[0]) {
			ezsp::EmberStatus::NetworkUp => info!("stack status: network up"),
			ezsp::EmberStatus::NetworkDown => warn!("stack status: network down"),
			status => info!("stack status: {:?}", status),
		}
	}

	//fans an event out to every subscriber; a full subscriber loses the
	//event rather than blocking the callback path
	fn publish(&self, event_type: EventType, device: Option<Device>) {
		let event = DiscoveryEvent {
			event_type,
			device,
			timestamp: Utc::now(),
		};

		for (_, tx) in self.subscribers.lock().unwrap().iter() {
			let _ = tx.try_send(event.clone());
		}
	}

	//id is the ieee hex string or the surfaced friendly name
	fn lookup(&self, id: &str) -> Option<(String, KnownDevice)> {
		let devices = self.devices.read().unwrap();

		if let Some(kd) = devices.get(id) {
			return Some((id.to_string(), kd.clone()));
		}

		devices
			.iter()
			.find(|(ieee, kd)| device_view(ieee, kd).name == id)
			.map(|(ieee, kd)| (ieee.clone(), kd.clone()))
	}

	fn set_attr(&self, id: &str, key: &str, value: Value) {
		if let Some(kd) = self.devices.write().unwrap().get_mut(id) {
			kd.state.insert(key.to_string(), value);
		}
	}

	fn state_snapshot(&self, id: &str) -> Option<DeviceState> {
		self.devices.read().unwrap().get(id).map(|kd| kd.state.clone())
	}
}

impl<T: Transport + 'static> device::Controller for Controller<T> {
	fn list_devices(&self) -> Result<Vec<Device>, device::Error> {
		let devices = self.shared.devices.read().unwrap();

		Ok(devices.iter().map(|(id, kd)| device_view(id, kd)).collect())
	}

	fn get_device(&self, id: &str) -> Result<Device, device::Error> {
		let (key, kd) = self.shared.lookup(id).ok_or(device::Error::NotFound)?;

		Ok(device_view(&key, &kd))
	}

	fn rename_device(&self, _id: &str, _new_name: &str) -> Result<(), device::Error> {
		//the zigbee wire protocol has no rename; name overlays belong to
		//the storage layer
		Err(device::Error::Unsupported)
	}

	fn remove_device(&self, id: &str, _force: bool) -> Result<(), device::Error> {
		let (key, _) = self.shared.lookup(id).ok_or(device::Error::NotFound)?;

		self.shared.devices.write().unwrap().remove(&key);

		//TODO send a zdo leave request so the device actually drops off the
		//network instead of lingering until its next rejoin
		Ok(())
	}

	fn get_device_state(&self, id: &str) -> Result<DeviceState, device::Error> {
		let (key, kd) = self.shared.lookup(id).ok_or(device::Error::NotFound)?;

		//refresh the on/off attribute; best effort, the cached state is
		//returned either way
		match self.codec.read_attributes(&[zcl::ATTR_ON_OFF]) {
			Ok(payload) => {
				if let Err(e) = self.unicast(&kd, zcl::CLUSTER_ON_OFF, &payload) {
					warn!("state read for {} failed: {}", key, e);
				}
			},
			Err(e) => warn!("state read encode failed: {}", e),
		}

		//the report arrives on the callback path; give it a moment
		thread::sleep(READ_SETTLE);

		self.shared.state_snapshot(&key).ok_or(device::Error::NotFound)
	}

	fn set_device_state(&self, id: &str, state: &DeviceState) -> Result<DeviceState, device::Error> {
		let (key, kd) = self.shared.lookup(id).ok_or(device::Error::NotFound)?;

		if let Some(validator) = &self.validator {
			validator.validate(&light_state_schema(), state)?;
		}

		if let Some(value) = state.get("state") {
			let token = value
				.as_str()
				.ok_or_else(|| device::Error::Validation("state must be a string".to_string()))?
				.to_ascii_uppercase();

			let command = match token.as_str() {
				"ON" => zcl::OnOffCommand::On,
				"OFF" => zcl::OnOffCommand::Off,
				"TOGGLE" => zcl::OnOffCommand::Toggle,
				other => {
					return Err(device::Error::Validation(format!("invalid state value {:?}", other)));
				}
			};

			let payload = self.codec.on_off(command).map_err(Error::from)?;

			self.unicast(&kd, zcl::CLUSTER_ON_OFF, &payload)?;
			self.shared.set_attr(&key, "state", Value::from(token));
		}

		if let Some(value) = state.get("brightness") {
			let level = coerce_level(value)
				.ok_or_else(|| device::Error::Validation("invalid brightness type".to_string()))?;

			let payload = self.codec.move_to_level(level, LEVEL_TRANSITION).map_err(Error::from)?;

			self.unicast(&kd, zcl::CLUSTER_LEVEL_CONTROL, &payload)?;
			self.shared.set_attr(&key, "brightness", Value::from(level));
		}

		self.shared.state_snapshot(&key).ok_or(device::Error::NotFound)
	}

	fn permit_join(&self, enable: bool, duration_s: u16) -> Result<(), device::Error> {
		if !self.is_connected() {
			return Err(device::Error::NotConnected);
		}

		let duration = if enable {
			if duration_s == 0 || duration_s > 254 {
				254
			}
			else {
				duration_s as u8
			}
		}
		else {
			0
		};

		self.ezsp.permit_joining(duration)?;

		Ok(())
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst) && self.ash.is_connected()
	}

	fn close(&self) {
		self.connected.store(false, Ordering::SeqCst);

		self.ezsp.close();
		self.ash.close();
		self.transport.close();

		info!("zigbee controller closed");
	}
}

impl<T: Transport + 'static> EventSubscriber for Controller<T> {
	fn subscribe(&self) -> Subscription {
		let (tx, rx) = bounded(16);
		let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);

		self.shared.subscribers.lock().unwrap().push((id, tx));

		Subscription { id, events: rx }
	}

	fn unsubscribe(&self, sub: Subscription) {
		//dropping the sender closes the subscriber's channel
		self.shared.subscribers.lock().unwrap().retain(|(id, _)| *id != sub.id);
	}
}

//applies a zcl read attributes response to the cached device state
fn update_state_from_zcl(kd: &mut KnownDevice, cluster_id: u16, message: &[u8]) {
	let (header, payload) = match zcl::parse_header(message) {
		Ok(x) => x,
		Err(_) => return,
	};

	if header.control.frame_type != zcl::FRAME_TYPE_GLOBAL
		|| header.command_id != zcl::GLOBAL_READ_ATTRIBUTES_RESPONSE
	{
		return;
	}

	for record in zcl::parse_read_attributes_response(payload) {
		match (cluster_id, record.identifier) {
			(zcl::CLUSTER_ON_OFF, zcl::ATTR_ON_OFF) => {
				if let Some(b) = record.value.low_byte() {
					let state = if b != 0 { "ON" } else { "OFF" };

					kd.state.insert("state".to_string(), Value::from(state));
				}
			},
			(zcl::CLUSTER_LEVEL_CONTROL, zcl::ATTR_CURRENT_LEVEL) => {
				if let Some(b) = record.value.low_byte() {
					kd.state.insert("brightness".to_string(), Value::from(b));
				}
			},
			_ => {}
		}
	}
}

fn device_view(id: &str, kd: &KnownDevice) -> Device {
	Device {
		id: id.to_string(),
		name: id.to_string(),
		device_type: kd.device_type,
		protocol: Protocol::Zigbee,
		manufacturer: "Unknown".to_string(),
		model: "Unknown".to_string(),
		state_schema: light_state_schema(),
	}
}

//json schema advertised for light devices
pub fn light_state_schema() -> Value {
	json!({
		"type": "object",
		"properties": {
			"state": {
				"type": "string",
				"enum": ["ON", "OFF", "TOGGLE"]
			},
			"brightness": {
				"type": "integer",
				"minimum": 0,
				"maximum": 254
			}
		}
	})
}

//ieee address rendered most significant byte first, colon separated
pub fn format_ieee(addr: &[u8; 8]) -> String {
	format!(
		"{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
		addr[7], addr[6], addr[5], addr[4], addr[3], addr[2], addr[1], addr[0]
	)
}

fn coerce_level(value: &Value) -> Option<u8> {
	if let Some(n) = value.as_i64() {
		Some(n as u8)
	}
	else if let Some(f) = value.as_f64() {
		Some(f as u8)
	}
	else {
		None
	}
}
