//ezsp command/response framing over ash, plus the command subset and
//callback payloads the controller uses

use crate::Error;
use crate::ash::AshLayer;
use crate::serial::Transport;
use crossbeam_channel::{ bounded, select, Receiver, Sender };
use deku::{ self, prelude::* };
use log::{ debug, info, warn };
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::{ Arc, Mutex, RwLock, Weak };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread;
use std::time::Duration;

pub const FRAME_VERSION: u16 = 0x0000;
pub const FRAME_NETWORK_INIT: u16 = 0x0017;
pub const FRAME_STACK_STATUS_HANDLER: u16 = 0x0019;
pub const FRAME_FORM_NETWORK: u16 = 0x001e;
pub const FRAME_PERMIT_JOINING: u16 = 0x0022;
pub const FRAME_TRUST_CENTER_JOIN_HANDLER: u16 = 0x0024;
pub const FRAME_GET_EUI64: u16 = 0x0026;
pub const FRAME_GET_NETWORK_PARAMETERS: u16 = 0x0028;
pub const FRAME_SEND_UNICAST: u16 = 0x0034;
pub const FRAME_MESSAGE_SENT_HANDLER: u16 = 0x003f;
pub const FRAME_INCOMING_MESSAGE_HANDLER: u16 = 0x0045;
pub const FRAME_SET_CONFIGURATION_VALUE: u16 = 0x0053;

//the protocol version this host speaks; the ncp may negotiate us down
pub const PROTOCOL_VERSION: u8 = 13;

pub const JOIN_METHOD_MAC_ASSOCIATION: u8 = 0x00;

pub const OUTGOING_DIRECT: u8 = 0x00;
pub const APS_OPTION_RETRY: u16 = 0x0040;
pub const APS_OPTION_ENABLE_ROUTE_DISCOVERY: u16 = 0x0100;

//device update status in a trust center join callback
pub const DEVICE_UPDATE_DEVICE_LEFT: u8 = 0x03;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

//async callbacks are a closed set of frame ids; the frame control bit alone
//is not reliable across ncp firmware versions
pub fn is_callback_frame_id(id: u16) -> bool {
	matches!(
		id,
		FRAME_TRUST_CENTER_JOIN_HANDLER
			| FRAME_INCOMING_MESSAGE_HANDLER
			| FRAME_MESSAGE_SENT_HANDLER
			| FRAME_STACK_STATUS_HANDLER
	)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(id_type = "u8")]
pub enum EmberStatus {
	#[deku(id = "0x00")]
	Success,
	#[deku(id = "0x01")]
	ErrFatal,
	#[deku(id = "0x66")]
	DeliveryFailed,
	#[deku(id = "0x70")]
	InvalidCall,
	#[deku(id = "0x90")]
	NetworkUp,
	#[deku(id = "0x91")]
	NetworkDown,
	#[deku(id = "0x93")]
	NotJoined,
	#[deku(id = "0x9c")]
	NetworkOpened,
	#[deku(id = "0x9d")]
	NetworkClosed,
	#[deku(id_pat = "_")]
	Unknown(u8),
}

impl From<u8> for EmberStatus {
	fn from(b: u8) -> Self {
		match b {
			0x00 => Self::Success,
			0x01 => Self::ErrFatal,
			0x66 => Self::DeliveryFailed,
			0x70 => Self::InvalidCall,
			0x90 => Self::NetworkUp,
			0x91 => Self::NetworkDown,
			0x93 => Self::NotJoined,
			0x9c => Self::NetworkOpened,
			0x9d => Self::NetworkClosed,
			b => Self::Unknown(b),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(id_type = "u8")]
pub enum ConfigId {
	#[deku(id = "0x05")]
	AddressTableSize,
	#[deku(id = "0x0c")]
	StackProfile,
	#[deku(id = "0x0d")]
	SecurityLevel,
	#[deku(id = "0x10")]
	MaxHops,
	#[deku(id = "0x11")]
	MaxEndDeviceChildren,
	#[deku(id = "0x1a")]
	SourceRouteTableSize,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct EmberApsFrame {
	pub profile_id: u16,
	pub cluster_id: u16,
	pub source_endpoint: u8,
	pub destination_endpoint: u8,
	pub options: u16,
	pub group_id: u16,
	pub sequence: u8,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct EmberNetworkParameters {
	pub extended_pan_id: [u8; 8],
	pub pan_id: u16,
	pub radio_tx_power: i8,
	pub radio_channel: u8,
	pub join_method: u8,
	pub nwk_manager_id: u16,
	pub nwk_update_id: u8,
	pub channels: u32,
}

//trust center join callback payload
#[derive(Debug, Clone, DekuRead)]
pub struct TrustCenterJoin {
	pub node_id: u16,
	pub ieee: [u8; 8],
	pub status: u8,
	//policy decision and parent node id on newer stacks
	#[deku(read_all)]
	pub rest: Vec<u8>,
}

//incoming message callback payload
#[derive(Debug, Clone, DekuRead)]
pub struct IncomingMessage {
	pub message_type: u8,
	pub aps_frame: EmberApsFrame,
	pub last_hop_lqi: u8,
	pub last_hop_rssi: i8,
	pub sender: u16,
	pub binding_index: u8,
	pub address_index: u8,
	pub message_length: u8,
	#[deku(count = "message_length")]
	pub message_contents: Vec<u8>,
	//some firmware versions append an extra byte
	#[deku(read_all)]
	pub rest: Vec<u8>,
}

#[derive(Debug, Clone, DekuRead)]
pub struct NetworkParametersResponse {
	pub status: EmberStatus,
	pub node_type: u8,
	pub parameters: EmberNetworkParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
	pub protocol_version: u8,
	pub stack_type: u8,
	pub stack_version: u16,
}

//frame header layouts:
//  legacy    seq(1) frame control(1) frame id(1)
//  extended  seq(1) frame control(2, lo=0x01) frame id(2 le)
pub(crate) fn encode_frame(extended: bool, seq: u8, frame_id: u16, params: &[u8]) -> Vec<u8> {
	let mut frame;

	if extended {
		frame = Vec::with_capacity(5 + params.len());
		frame.push(seq);
		frame.push(0x01);
		frame.push(0x00);
		frame.extend_from_slice(&frame_id.to_le_bytes());
	}
	else {
		frame = Vec::with_capacity(3 + params.len());
		frame.push(seq);
		frame.push(0x00);
		frame.push(frame_id as u8);
	}

	frame.extend_from_slice(params);

	frame
}

pub(crate) struct DecodedFrame<'a> {
	pub frame_id: u16,
	pub params: &'a [u8],
	pub callback: bool,
}

pub(crate) fn decode_frame(extended: bool, data: &[u8]) -> Option<DecodedFrame<'_>> {
	let (frame_id, params, legacy_callback) = if extended {
		if data.len() < 5 {
			return None;
		}

		(u16::from_le_bytes([data[3], data[4]]), &data[5..], false)
	}
	else {
		if data.len() < 3 {
			return None;
		}

		(data[2] as u16, &data[3..], data[1] & 0x04 != 0)
	};

	Some(DecodedFrame {
		frame_id,
		params,
		callback: is_callback_frame_id(frame_id) || legacy_callback,
	})
}

pub type CallbackHandler = Box<dyn Fn(u16, &[u8]) + Send + Sync>;

pub struct EzspLayer<T: Transport> {
	ash: Arc<AshLayer<T>>,
	sequence: Mutex<u8>,
	//wire format mode; moves legacy -> extended exactly once, during
	//version negotiation
	extended: AtomicBool,
	//single-shot response sinks keyed by frame id; the ncp keeps frame ids
	//unique among outstanding commands, so correlation is by id, not sequence
	responses: Mutex<HashMap<u16, Sender<Vec<u8>>>>,
	handler: RwLock<Option<CallbackHandler>>,
	stop_tx: Mutex<Option<Sender<()>>>,
	stop_rx: Receiver<()>,
	started: AtomicBool,
	//handle the reader thread is spawned from
	weak: Weak<Self>,
}

impl<T: Transport + 'static> EzspLayer<T> {
	pub fn new(ash: Arc<AshLayer<T>>) -> Arc<Self> {
		let (stop_tx, stop_rx) = bounded(0);

		Arc::new_cyclic(|weak| Self {
			ash,
			sequence: Mutex::new(0),
			extended: AtomicBool::new(false),
			responses: Mutex::new(HashMap::new()),
			handler: RwLock::new(None),
			stop_tx: Mutex::new(Some(stop_tx)),
			stop_rx,
			started: AtomicBool::new(false),
			weak: weak.clone(),
		})
	}

	pub fn set_callback_handler(&self, handler: CallbackHandler) {
		*self.handler.write().unwrap() = Some(handler);
	}

	//starts the reader that drains ash data frames; callbacks run serially
	//on this thread, so handlers must only do bounded work
	pub fn start(&self) {
		if self.started.swap(true, Ordering::SeqCst) {
			return;
		}

		let me = match self.weak.upgrade() {
			Some(me) => me,
			None => return,
		};
		let incoming = self.ash.incoming();

		thread::spawn(move || {
			loop {
				select! {
					recv(incoming) -> frame => match frame {
						Ok(frame) => me.process_frame(&frame),
						Err(_) => return,
					},
					recv(me.stop_rx) -> _ => return,
				}
			}
		});
	}

	pub fn close(&self) {
		self.stop_tx.lock().unwrap().take();

		//dropping the sinks wakes any caller still waiting on a response
		self.responses.lock().unwrap().clear();
	}

	pub fn is_extended(&self) -> bool {
		self.extended.load(Ordering::SeqCst)
	}

	//sends a command and waits up to five seconds for its response. one
	//outstanding command per frame id; callers issuing the same command
	//concurrently must serialize themselves.
	pub fn send_command(&self, frame_id: u16, params: &[u8]) -> Result<Vec<u8>, Error> {
		let seq = {
			let mut s = self.sequence.lock().unwrap();
			let seq = *s;

			*s = s.wrapping_add(1);

			seq
		};

		let (tx, rx) = bounded(1);

		self.responses.lock().unwrap().insert(frame_id, tx);

		let frame = encode_frame(self.is_extended(), seq, frame_id, params);

		debug!("ezsp tx command: seq={}, frame_id={:#06x}, params_len={}", seq, frame_id, params.len());

		let result = match self.ash.send_data(&frame) {
			Err(e) => Err(e),
			Ok(()) => select! {
				recv(rx) -> r => r.map_err(|_| Error::Stopped),
				recv(self.stop_rx) -> _ => Err(Error::Stopped),
				default(COMMAND_TIMEOUT) => Err(Error::Timeout),
			},
		};

		self.responses.lock().unwrap().remove(&frame_id);

		if matches!(result, Err(Error::Timeout)) {
			warn!("ezsp response timeout: frame_id={:#06x}", frame_id);
		}

		result
	}

	fn process_frame(&self, data: &[u8]) {
		let decoded = match decode_frame(self.is_extended(), data) {
			Some(d) => d,
			None => {
				debug!("ezsp frame too short ({} bytes)", data.len());

				return;
			}
		};

		debug!(
			"ezsp rx frame: frame_id={:#06x}, callback={}, params_len={}",
			decoded.frame_id, decoded.callback, decoded.params.len()
		);

		if decoded.callback {
			if let Some(handler) = self.handler.read().unwrap().as_ref() {
				handler(decoded.frame_id, decoded.params);
			}

			return;
		}

		let tx = self.responses.lock().unwrap().get(&decoded.frame_id).cloned();

		match tx {
			Some(tx) => {
				let _ = tx.try_send(decoded.params.to_vec());
			},
			None => debug!("ezsp response with no waiter: frame_id={:#06x}", decoded.frame_id),
		}
	}

	//negotiates the protocol version. the version command always goes out in
	//legacy format first; a 1-byte reply carries the version the ncp wants,
	//and for v8+ the retry must already use the extended format. no ash
	//reset between the two attempts.
	pub fn negotiate_version(&self) -> Result<VersionInfo, Error> {
		//version is the first command after connect
		*self.sequence.lock().unwrap() = 0;

		let mut resp = self.send_command(FRAME_VERSION, &[PROTOCOL_VERSION])?;

		if resp.len() == 1 {
			let ncp_version = resp[0];

			info!("ezsp version mismatch: requested={}, ncp supports={}", PROTOCOL_VERSION, ncp_version);

			if ncp_version >= 8 {
				self.extended.store(true, Ordering::SeqCst);
			}

			resp = self.send_command(FRAME_VERSION, &[ncp_version])?;
		}

		if resp.len() < 4 {
			return Err(Error::Protocol(format!("version response too short: {} bytes", resp.len())));
		}

		let version = VersionInfo {
			protocol_version: resp[0],
			stack_type: resp[1],
			stack_version: u16::from_le_bytes([resp[2], resp[3]]),
		};

		if version.protocol_version >= 8 {
			self.extended.store(true, Ordering::SeqCst);
		}

		info!(
			"ezsp version negotiated: protocol={}, stack_type={}, stack_version={:#06x}",
			version.protocol_version, version.stack_type, version.stack_version
		);

		Ok(version)
	}

	pub fn set_configuration_value(&self, config_id: ConfigId, value: u16) -> Result<(), Error> {
		let mut params = config_id.to_bytes()?;

		params.extend_from_slice(&value.to_le_bytes());

		let resp = self.send_command(FRAME_SET_CONFIGURATION_VALUE, &params)?;

		match resp.first() {
			Some(0x00) => Ok(()),
			Some(s) => Err(Error::Protocol(format!("setConfigurationValue {:?} failed: status {:#04x}", config_id, s))),
			None => Err(Error::Protocol("setConfigurationValue: empty response".to_string())),
		}
	}

	//coordinator stack configuration; individual failures are logged and
	//tolerated, newer firmware rejects some of these ids
	pub fn configure_stack(&self) {
		let configs = [
			(ConfigId::StackProfile, 2u16),	//zigbee pro
			(ConfigId::SecurityLevel, 5),
			(ConfigId::MaxEndDeviceChildren, 32),
			(ConfigId::AddressTableSize, 16),
			(ConfigId::SourceRouteTableSize, 16),
			(ConfigId::MaxHops, 30),
		];

		for (id, value) in configs {
			if let Err(e) = self.set_configuration_value(id, value) {
				warn!("stack config {:?} failed (non-fatal): {}", id, e);
			}
		}
	}

	//tries to resume the network stored in ncp nvram
	pub fn network_init(&self) -> Result<EmberStatus, Error> {
		//network init struct: bitmask = 0
		let resp = self.send_command(FRAME_NETWORK_INIT, &[0x00, 0x00])?;

		match resp.first() {
			Some(&s) => Ok(EmberStatus::from(s)),
			None => Err(Error::Protocol("networkInit: empty response".to_string())),
		}
	}

	pub fn form_network(&self, parameters: &EmberNetworkParameters) -> Result<(), Error> {
		let params = parameters.to_bytes()?;
		let resp = self.send_command(FRAME_FORM_NETWORK, &params)?;

		match resp.first().copied().map(EmberStatus::from) {
			Some(EmberStatus::Success) => {
				info!("network formed: channel={}, pan_id={:#06x}", parameters.radio_channel, parameters.pan_id);

				Ok(())
			},
			Some(s) => Err(Error::Protocol(format!("formNetwork failed: {:?}", s))),
			None => Err(Error::Protocol("formNetwork: empty response".to_string())),
		}
	}

	pub fn permit_joining(&self, duration: u8) -> Result<(), Error> {
		let resp = self.send_command(FRAME_PERMIT_JOINING, &[duration])?;

		match resp.first().copied().map(EmberStatus::from) {
			Some(EmberStatus::Success) => Ok(()),
			Some(s) => Err(Error::Protocol(format!("permitJoining failed: {:?}", s))),
			None => Err(Error::Protocol("permitJoining: empty response".to_string())),
		}
	}

	pub fn get_eui64(&self) -> Result<[u8; 8], Error> {
		let resp = self.send_command(FRAME_GET_EUI64, &[])?;

		if resp.len() < 8 {
			return Err(Error::Protocol(format!("eui64 response too short: {} bytes", resp.len())));
		}

		let mut eui = [0u8; 8];

		eui.copy_from_slice(&resp[..8]);

		Ok(eui)
	}

	pub fn get_network_parameters(&self) -> Result<NetworkParametersResponse, Error> {
		let resp = self.send_command(FRAME_GET_NETWORK_PARAMETERS, &[])?;

		Ok(NetworkParametersResponse::try_from(resp.as_slice())?)
	}

	pub fn send_unicast(
		&self,
		node_id: u16,
		profile_id: u16,
		cluster_id: u16,
		src_endpoint: u8,
		dst_endpoint: u8,
		payload: &[u8],
	) -> Result<(), Error> {
		let aps = EmberApsFrame {
			profile_id,
			cluster_id,
			source_endpoint: src_endpoint,
			destination_endpoint: dst_endpoint,
			options: APS_OPTION_RETRY | APS_OPTION_ENABLE_ROUTE_DISCOVERY,
			group_id: 0,
			sequence: 0,	//filled in by the stack
		};

		let mut params = Vec::with_capacity(16 + payload.len());

		params.push(OUTGOING_DIRECT);
		params.extend_from_slice(&node_id.to_le_bytes());
		params.extend_from_slice(&aps.to_bytes()?);
		params.push(0x01);	//message tag
		params.push(payload.len() as u8);
		params.extend_from_slice(payload);

		let resp = self.send_command(FRAME_SEND_UNICAST, &params)?;

		match resp.first().copied().map(EmberStatus::from) {
			Some(EmberStatus::Success) => Ok(()),
			Some(s) => Err(Error::Protocol(format!("sendUnicast to {:#06x} failed: {:?}", node_id, s))),
			None => Err(Error::Protocol("sendUnicast: empty response".to_string())),
		}
	}
}
