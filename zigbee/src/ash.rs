//ash link layer: byte-stuffed, crc-protected frames with a three-bit
//send/receive window over the serial transport

use crate::Error;
use crate::serial::Transport;
use crossbeam_channel::{ bounded, select, Receiver, Sender, TryRecvError };
use log::{ debug, error, info, warn };
use std::collections::HashMap;
use std::sync::{ Arc, Mutex, RwLock, Weak };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread;
use std::time::Duration;

pub const FLAG: u8 = 0x7e;
pub const ESCAPE: u8 = 0x7d;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
pub const SUBSTITUTE: u8 = 0x18;
pub const CANCEL: u8 = 0x1a;

const FLIP: u8 = 0x20;

const CONTROL_RST: u8 = 0xc0;
const CONTROL_RSTACK: u8 = 0xc1;
const CONTROL_ERROR: u8 = 0xc2;
const CONTROL_ACK: u8 = 0x80;
const CONTROL_NAK: u8 = 0xa0;
const CONTROL_ACK_MASK: u8 = 0xe0;
const CONTROL_DATA_MASK: u8 = 0x80;
const CONTROL_RETX: u8 = 0x08;

const MAX_FRAME_LEN: usize = 256;
const RECV_QUEUE_LEN: usize = 16;
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AshState {
	Disconnected,
	ResetPending,
	Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AshFrame {
	Data {
		frm_num: u8,
		ack_num: u8,
		retransmit: bool,
		payload: Vec<u8>,
	},
	Ack {
		ack_num: u8,
	},
	Nak {
		ack_num: u8,
	},
	Rst,
	RstAck {
		payload: Vec<u8>,
	},
	Error {
		payload: Vec<u8>,
	},
}

impl AshFrame {
	//decodes an unstuffed, crc-verified frame body (control byte + payload)
	pub fn decode(raw: &[u8]) -> Result<Self, Error> {
		let control = raw[0];

		Ok(match control {
			CONTROL_RST => AshFrame::Rst,
			CONTROL_RSTACK => AshFrame::RstAck { payload: raw[1..].to_vec() },
			CONTROL_ERROR => AshFrame::Error { payload: raw[1..].to_vec() },
			_ => {
				if control & CONTROL_DATA_MASK == 0 {
					AshFrame::Data {
						frm_num: (control >> 4) & 0x07,
						ack_num: control & 0x07,
						retransmit: control & CONTROL_RETX != 0,
						payload: raw[1..].to_vec(),
					}
				}
				else if control & CONTROL_ACK_MASK == CONTROL_ACK {
					AshFrame::Ack { ack_num: control & 0x07 }
				}
				else if control & CONTROL_ACK_MASK == CONTROL_NAK {
					AshFrame::Nak { ack_num: control & 0x07 }
				}
				else {
					return Err(Error::Protocol(format!("bad ash control byte {:#04x}", control)));
				}
			}
		})
	}
}

//replaces reserved bytes with escape + flipped byte
pub fn stuff(data: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(data.len() + 2);

	for &b in data {
		match b {
			FLAG | ESCAPE | XON | XOFF | SUBSTITUTE | CANCEL => {
				out.push(ESCAPE);
				out.push(b ^ FLIP);
			},
			_ => out.push(b),
		}
	}

	out
}

pub fn unstuff(data: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(data.len());
	let mut escaped = false;

	for &b in data {
		if escaped {
			out.push(b ^ FLIP);
			escaped = false;
		}
		else if b == ESCAPE {
			escaped = true;
		}
		else {
			out.push(b);
		}
	}

	out
}

//crc-ccitt, initial 0xffff, polynomial 0x1021, msb first
pub fn crc_ccitt(data: &[u8]) -> u16 {
	let mut crc: u16 = 0xffff;

	for &b in data {
		crc ^= (b as u16) << 8;

		for _ in 0..8 {
			if crc & 0x8000 != 0 {
				crc = (crc << 1) ^ 0x1021;
			}
			else {
				crc <<= 1;
			}
		}
	}

	crc
}

//three-bit modular "a precedes b": the distance from a to b is 1..=4
pub fn seq_lt(a: u8, b: u8) -> bool {
	let diff = (b.wrapping_sub(a)) & 0x07;

	diff > 0 && diff <= 4
}

//complete wire frame: control + payload + crc, stuffed, flag-terminated
fn frame_bytes(control: u8, payload: &[u8]) -> Vec<u8> {
	let mut raw = Vec::with_capacity(payload.len() + 3);

	raw.push(control);
	raw.extend_from_slice(payload);

	let crc = crc_ccitt(&raw);

	raw.push((crc >> 8) as u8);
	raw.push(crc as u8);

	let mut out = stuff(&raw);

	out.push(FLAG);

	out
}

struct Sequences {
	send_seq: u8,
	recv_seq: u8,
}

pub struct AshLayer<T: Transport> {
	transport: Arc<T>,
	state: RwLock<AshState>,
	seq: Mutex<Sequences>,
	//frames sent but not yet acknowledged, keyed by frm_num
	pending: Mutex<HashMap<u8, Vec<u8>>>,
	data_tx: Sender<Vec<u8>>,
	data_rx: Receiver<Vec<u8>>,
	conn_tx: Sender<()>,
	conn_rx: Receiver<()>,
	stop_tx: Mutex<Option<Sender<()>>>,
	stop_rx: Receiver<()>,
	reader_started: AtomicBool,
	//handle the reader thread is spawned from
	weak: Weak<Self>,
}

impl<T: Transport + 'static> AshLayer<T> {
	pub fn new(transport: Arc<T>) -> Arc<Self> {
		let (data_tx, data_rx) = bounded(RECV_QUEUE_LEN);
		let (conn_tx, conn_rx) = bounded(1);
		let (stop_tx, stop_rx) = bounded(0);

		Arc::new_cyclic(|weak| Self {
			transport,
			state: RwLock::new(AshState::Disconnected),
			seq: Mutex::new(Sequences { send_seq: 0, recv_seq: 0 }),
			pending: Mutex::new(HashMap::new()),
			data_tx,
			data_rx,
			conn_tx,
			conn_rx,
			stop_tx: Mutex::new(Some(stop_tx)),
			stop_rx,
			reader_started: AtomicBool::new(false),
			weak: weak.clone(),
		})
	}

	//sends rst, starts the read loop and waits for the ncp's rstack
	pub fn connect(&self) -> Result<(), Error> {
		*self.state.write().unwrap() = AshState::ResetPending;

		self.send_rst()?;

		if !self.reader_started.swap(true, Ordering::SeqCst) {
			if let Some(me) = self.weak.upgrade() {
				thread::spawn(move || me.read_loop());
			}
		}

		let r = self.wait_connected();

		if r.is_ok() {
			info!("ash connection established");
		}

		r
	}

	//re-runs the rst/rstack handshake on a live link; needed before the ncp
	//will take a second version command
	pub fn reset(&self) -> Result<(), Error> {
		*self.state.write().unwrap() = AshState::ResetPending;

		info!("ash reset requested");

		//drop a stale connection signal left over from the previous handshake
		let _ = self.conn_rx.try_recv();

		self.send_rst()?;

		let r = self.wait_connected();

		if r.is_ok() {
			info!("ash connection re-established after reset");
		}

		r
	}

	fn wait_connected(&self) -> Result<(), Error> {
		select! {
			recv(self.conn_rx) -> r => r.map_err(|_| Error::Stopped),
			recv(self.stop_rx) -> _ => Err(Error::Stopped),
			default(RESET_TIMEOUT) => Err(Error::Timeout),
		}
	}

	//wraps an ezsp payload in a data frame, remembers it for retransmission
	//and writes it out
	pub fn send_data(&self, payload: &[u8]) -> Result<(), Error> {
		if *self.state.read().unwrap() != AshState::Connected {
			return Err(Error::NotConnected);
		}

		let (seq, ack) = {
			let mut s = self.seq.lock().unwrap();
			let seq = s.send_seq;

			s.send_seq = (s.send_seq + 1) & 0x07;

			(seq, s.recv_seq)
		};

		let control = (seq << 4) | (ack & 0x07);
		let frame = frame_bytes(control, payload);

		self.pending.lock().unwrap().insert(seq, frame.clone());

		debug!("ash tx data: seq={}, ack={}, len={}", seq, ack, payload.len());

		self.transport.write(&frame)
	}

	//in-order ezsp payloads decoded by the read loop
	pub fn incoming(&self) -> Receiver<Vec<u8>> {
		self.data_rx.clone()
	}

	pub fn is_connected(&self) -> bool {
		*self.state.read().unwrap() == AshState::Connected
	}

	pub fn state(&self) -> AshState {
		*self.state.read().unwrap()
	}

	pub fn close(&self) {
		*self.state.write().unwrap() = AshState::Disconnected;

		//dropping the stop sender wakes every waiter and ends the read loop
		self.stop_tx.lock().unwrap().take();
	}

	fn stopping(&self) -> bool {
		matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
	}

	fn send_rst(&self) -> Result<(), Error> {
		//cancel first so the ncp receiver drops any partial frame
		self.transport.write(&[CANCEL])?;

		debug!("ash tx rst");

		self.transport.write(&frame_bytes(CONTROL_RST, &[]))
	}

	fn send_ack(&self) -> Result<(), Error> {
		let ack = self.seq.lock().unwrap().recv_seq;

		debug!("ash tx ack: {}", ack);

		self.transport.write(&frame_bytes(CONTROL_ACK | (ack & 0x07), &[]))
	}

	fn send_nak(&self) -> Result<(), Error> {
		let ack = self.seq.lock().unwrap().recv_seq;

		debug!("ash tx nak: {}", ack);

		self.transport.write(&frame_bytes(CONTROL_NAK | (ack & 0x07), &[]))
	}

	fn read_loop(&self) {
		let mut buf: Vec<u8> = Vec::with_capacity(MAX_FRAME_LEN);

		loop {
			if self.stopping() {
				return;
			}

			let b = match self.transport.read_byte() {
				Ok(b) => b,
				Err(Error::Stopped) => return,
				Err(e) => {
					if self.stopping() {
						return;
					}

					//transient usb hiccups happen; keep reading
					error!("ash read error: {}", e);

					continue;
				}
			};

			match b {
				CANCEL | SUBSTITUTE => buf.clear(),
				XON | XOFF => {},
				FLAG => {
					if !buf.is_empty() {
						self.process_frame(&buf);
						buf.clear();
					}
				},
				_ => {
					buf.push(b);

					if buf.len() > MAX_FRAME_LEN {
						buf.clear();
					}
				}
			}
		}
	}

	fn process_frame(&self, stuffed: &[u8]) {
		let raw = unstuff(stuffed);

		if raw.len() < 3 {
			debug!("ash frame too short ({} bytes), discarding", raw.len());

			return;
		}

		let (body, crc_bytes) = raw.split_at(raw.len() - 2);
		let received = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
		let computed = crc_ccitt(body);

		if received != computed {
			warn!("ash crc mismatch: received={:#06x}, computed={:#06x}", received, computed);

			return;
		}

		match AshFrame::decode(body) {
			Ok(AshFrame::RstAck { payload }) => self.handle_rstack(&payload),
			Ok(AshFrame::Error { payload }) => error!("ash error frame from ncp: {:02x?}", payload),
			Ok(AshFrame::Data { frm_num, ack_num, retransmit, payload }) => {
				self.handle_data(frm_num, ack_num, retransmit, payload);
			},
			Ok(AshFrame::Ack { ack_num }) => {
				debug!("ash rx ack: {}", ack_num);
				self.drop_acknowledged(ack_num);
			},
			Ok(AshFrame::Nak { ack_num }) => self.handle_nak(ack_num),
			Ok(AshFrame::Rst) => debug!("ash rst from ncp ignored"),
			Err(e) => debug!("ash frame discarded: {}", e),
		}
	}

	fn handle_rstack(&self, payload: &[u8]) {
		info!("ash rstack received: {:02x?}", payload);

		{
			let mut s = self.seq.lock().unwrap();

			s.send_seq = 0;
			s.recv_seq = 0;
		}

		self.pending.lock().unwrap().clear();

		*self.state.write().unwrap() = AshState::Connected;

		let _ = self.conn_tx.try_send(());
	}

	fn handle_data(&self, frm_num: u8, ack_num: u8, retransmit: bool, payload: Vec<u8>) {
		debug!("ash rx data: frm={}, ack={}, retx={}, len={}", frm_num, ack_num, retransmit, payload.len());

		//piggybacked ack
		self.drop_acknowledged(ack_num);

		let expected = {
			let mut s = self.seq.lock().unwrap();
			let expected = s.recv_seq;

			if frm_num == expected {
				s.recv_seq = (expected + 1) & 0x07;
			}

			expected
		};

		if frm_num == expected {
			if let Err(e) = self.send_ack() {
				error!("ash ack send failed: {}", e);
			}

			if self.data_tx.try_send(payload).is_err() {
				warn!("ash receive queue full, dropping frame");
			}
		}
		else {
			warn!("ash out-of-sequence data: expected={}, got={}", expected, frm_num);

			if let Err(e) = self.send_nak() {
				error!("ash nak send failed: {}", e);
			}
		}
	}

	fn handle_nak(&self, ack_num: u8) {
		warn!("ash rx nak: {}, retransmitting", ack_num);

		let frame = self.pending.lock().unwrap().get(&ack_num).cloned();

		if let Some(frame) = frame {
			if let Err(e) = self.transport.write(&frame) {
				error!("ash retransmit failed: {}", e);
			}
		}
	}

	fn drop_acknowledged(&self, ack_num: u8) {
		self.pending.lock().unwrap().retain(|&seq, _| !seq_lt(seq, ack_num));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stuff_escapes_every_reserved_byte() {
		let data = [0x7e, 0x7d, 0x11, 0x13, 0x18, 0x1a];
		let stuffed = stuff(&data);

		assert_eq!(stuffed.len(), 12);
		assert!(!stuffed.iter().any(|&b| b == FLAG));

		for pair in stuffed.chunks(2) {
			assert_eq!(pair[0], ESCAPE);
		}
	}

	#[test]
	fn unstuff_inverts_stuff() {
		let cases: [&[u8]; 4] = [
			b"",
			b"\x00\x01\x02\x03",
			&[0x7e, 0x00, 0x7d, 0xff, 0x11, 0x13, 0x18, 0x1a],
			&[0x5d, 0x5e, 0x31, 0x33, 0x38, 0x3a],	//flipped forms pass through
		];

		for data in cases {
			assert_eq!(unstuff(&stuff(data)), data);
		}
	}

	#[test]
	fn crc_ccitt_known_vectors() {
		assert_eq!(crc_ccitt(&[]), 0xffff);
		assert_eq!(crc_ccitt(&[0x00, 0x00]), 0x1d0f);
		assert_eq!(crc_ccitt(b"123456789"), 0x29b1);
	}

	#[test]
	fn seq_lt_cases() {
		assert!(seq_lt(7, 0));
		assert!(seq_lt(0, 4));
		assert!(!seq_lt(0, 5));
		assert!(!seq_lt(3, 3));
	}

	#[test]
	fn seq_lt_trichotomy() {
		//for any pair exactly one of a<b, b<a, a==b holds
		for a in 0u8..8 {
			for b in 0u8..8 {
				let cases = [seq_lt(a, b), seq_lt(b, a), a == b];

				assert_eq!(cases.iter().filter(|&&c| c).count(), 1, "a={}, b={}", a, b);
			}
		}
	}

	#[test]
	fn decode_control_bytes() {
		assert_eq!(AshFrame::decode(&[0xc0]).unwrap(), AshFrame::Rst);
		assert_eq!(
			AshFrame::decode(&[0xc1, 0x02, 0x02]).unwrap(),
			AshFrame::RstAck { payload: vec![0x02, 0x02] }
		);
		assert_eq!(
			AshFrame::decode(&[0xc2, 0x02, 0x51]).unwrap(),
			AshFrame::Error { payload: vec![0x02, 0x51] }
		);
		assert_eq!(AshFrame::decode(&[0x81]).unwrap(), AshFrame::Ack { ack_num: 1 });
		assert_eq!(AshFrame::decode(&[0xa6]).unwrap(), AshFrame::Nak { ack_num: 6 });
		assert_eq!(
			AshFrame::decode(&[0x53, 0xaa]).unwrap(),
			AshFrame::Data { frm_num: 5, ack_num: 3, retransmit: false, payload: vec![0xaa] }
		);
		assert_eq!(
			AshFrame::decode(&[0x2c]).unwrap(),
			AshFrame::Data { frm_num: 2, ack_num: 4, retransmit: true, payload: vec![] }
		);
		assert!(AshFrame::decode(&[0xe0]).is_err());
	}

	#[test]
	fn frame_bytes_round_trip() {
		let frame = frame_bytes(0x10, &[0x01, 0x7e, 0x02]);

		assert_eq!(*frame.last().unwrap(), FLAG);

		let raw = unstuff(&frame[..frame.len() - 1]);
		let (body, crc_bytes) = raw.split_at(raw.len() - 2);

		assert_eq!(crc_ccitt(body), u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]));
		assert_eq!(body, [0x10, 0x01, 0x7e, 0x02]);
	}
}
