//zigbee cluster library: frame building for the clusters the controller
//speaks, and read-attributes-response decoding

use deku::{ self, prelude::* };
use std::convert::TryFrom;
use std::sync::atomic::{ AtomicU8, Ordering };

#[derive(Debug)]
pub enum Error {
	Deku(deku::DekuError),
	BufferTooSmall(&'static str),
	Unsupported(&'static str),
}

impl core::fmt::Display for Error {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		match self {
			Self::Deku(e) => e.fmt(f),
			Self::BufferTooSmall(s) => write!(f, "buffer too small: {}", s),
			Self::Unsupported(s) => write!(f, "unsupported: {}", s),
		}
	}
}

impl From<deku::DekuError> for Error {
	fn from(e: deku::DekuError) -> Self {
		Error::Deku(e)
	}
}

pub const PROFILE_HA: u16 = 0x0104;

pub const CLUSTER_ON_OFF: u16 = 0x0006;
pub const CLUSTER_LEVEL_CONTROL: u16 = 0x0008;

pub const ATTR_ON_OFF: u16 = 0x0000;
pub const ATTR_CURRENT_LEVEL: u16 = 0x0000;

//frame type: 00 global for all clusters, 01 cluster specific
pub const FRAME_TYPE_GLOBAL: u8 = 0x00;
pub const FRAME_TYPE_CLUSTER: u8 = 0x01;

pub const GLOBAL_READ_ATTRIBUTES: u8 = 0x00;
pub const GLOBAL_READ_ATTRIBUTES_RESPONSE: u8 = 0x01;

#[derive(Debug, Clone, DekuRead, DekuWrite)]
pub struct ZclFrameControl {
	#[deku(bits = 1, pad_bits_before = "3")]
	pub disable_default_response: bool,
	#[deku(bits = 1)]
	pub direction: u8,
	#[deku(bits = 1)]
	pub manufacturer_specific: u8,
	#[deku(bits = 2)]
	pub frame_type: u8,
}

//cluster 0x0006 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(id_type = "u8")]
pub enum OnOffCommand {
	#[deku(id = "0x00")]
	Off,
	#[deku(id = "0x01")]
	On,
	#[deku(id = "0x02")]
	Toggle,
}

//cluster 0x0008 commands
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(id_type = "u8")]
pub enum LevelCommand {
	#[deku(id = "0x04")]
	MoveToLevelWithOnOff {
		level: u8,
		transition_time: u16,
	},
}

//attribute value as carried in read responses and reports; restricted to the
//types the controller interprets
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(id_type = "u8")]
pub enum AttributeValue {
	#[deku(id = "0x10")]
	Bool {
		val: u8
	},
	#[deku(id = "0x20")]
	Uint8 {
		val: u8
	},
	#[deku(id = "0x21")]
	Uint16 {
		val: u16
	},
	#[deku(id = "0x22")]
	Uint24 {
		#[deku(bits = 24)]
		val: u32
	},
	#[deku(id = "0x23")]
	Uint32 {
		val: u32
	},
	#[deku(id = "0x28")]
	Int8 {
		val: i8
	},
	#[deku(id = "0x29")]
	Int16 {
		val: i16
	},
	#[deku(id = "0x30")]
	Enum8 {
		val: u8
	},
	#[deku(id = "0x31")]
	Enum16 {
		val: u16
	},
	#[deku(id = "0x42")]
	String {
		count: u8,
		#[deku(count = "count")]
		val: Vec<u8>
	},
}

impl AttributeValue {
	//first (least significant) wire byte of the value
	pub fn low_byte(&self) -> Option<u8> {
		match self {
			Self::Bool { val } | Self::Uint8 { val } | Self::Enum8 { val } => Some(*val),
			Self::Uint16 { val } | Self::Enum16 { val } => Some(*val as u8),
			Self::Uint24 { val } | Self::Uint32 { val } => Some(*val as u8),
			Self::Int8 { val } => Some(*val as u8),
			Self::Int16 { val } => Some(*val as u8),
			Self::String { val, .. } => val.first().copied(),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadAttributeRecord {
	pub identifier: u16,
	pub value: AttributeValue,
}

//read attributes response payload: repeated (attr id, status, [type, value])
//records. failed records carry no value and are skipped; the first malformed
//or truncated record ends the walk and what was parsed so far is returned.
pub fn parse_read_attributes_response(buf: &[u8]) -> Vec<ReadAttributeRecord> {
	let mut records = Vec::new();
	let mut rest = buf;

	while rest.len() >= 3 {
		let identifier = u16::from_le_bytes([rest[0], rest[1]]);
		let status = rest[2];

		rest = &rest[3..];

		if status != 0 {
			continue;
		}

		match AttributeValue::from_bytes((rest, 0)) {
			Ok(((tail, _), value)) => {
				records.push(ReadAttributeRecord { identifier, value });
				rest = tail;
			},
			Err(_) => break,
		}
	}

	records
}

#[derive(Debug, Clone)]
pub struct ZclHeader {
	pub control: ZclFrameControl,
	pub sequence: u8,
	pub command_id: u8,
}

//splits a zcl frame into header and command payload
pub fn parse_header(buf: &[u8]) -> Result<(ZclHeader, &[u8]), Error> {
	if buf.len() < 3 {
		return Err(Error::BufferTooSmall("zcl header"));
	}

	let control = ZclFrameControl::try_from(&buf[0..1])?;

	if control.manufacturer_specific != 0 {
		return Err(Error::Unsupported("manufacturer specific frame"));
	}

	Ok((
		ZclHeader {
			control,
			sequence: buf[1],
			command_id: buf[2],
		},
		&buf[3..],
	))
}

//outbound frame builder; owns the rolling transaction sequence number
pub struct Codec {
	sequence: AtomicU8,
}

impl Codec {
	pub fn new() -> Self {
		Self { sequence: AtomicU8::new(0) }
	}

	fn next_sequence(&self) -> u8 {
		self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
	}

	fn frame(&self, frame_type: u8, command: &[u8]) -> Result<Vec<u8>, Error> {
		let control = ZclFrameControl {
			disable_default_response: false,
			direction: 0,	//client to server
			manufacturer_specific: 0,
			frame_type,
		};

		let mut out = control.to_bytes()?;

		out.push(self.next_sequence());
		out.extend_from_slice(command);

		Ok(out)
	}

	pub fn on_off(&self, command: OnOffCommand) -> Result<Vec<u8>, Error> {
		self.frame(FRAME_TYPE_CLUSTER, &command.to_bytes()?)
	}

	pub fn move_to_level(&self, level: u8, transition_time: u16) -> Result<Vec<u8>, Error> {
		let command = LevelCommand::MoveToLevelWithOnOff { level, transition_time };

		self.frame(FRAME_TYPE_CLUSTER, &command.to_bytes()?)
	}

	pub fn read_attributes(&self, identifiers: &[u16]) -> Result<Vec<u8>, Error> {
		let mut command = Vec::with_capacity(1 + identifiers.len() * 2);

		command.push(GLOBAL_READ_ATTRIBUTES);

		for id in identifiers {
			command.extend_from_slice(&id.to_le_bytes());
		}

		self.frame(FRAME_TYPE_GLOBAL, &command)
	}
}

impl Default for Codec {
	fn default() -> Self {
		Self::new()
	}
}
