//shared test plumbing: an in-memory serial transport and a scripted ncp
//peer that speaks ash + ezsp on the other end of it

#![allow(dead_code)]

use crossbeam_channel::{ select, unbounded, Receiver, RecvTimeoutError, Sender };
use std::collections::VecDeque;
use std::sync::{ Arc, Mutex };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::thread::{ self, JoinHandle };
use std::time::Duration;
use zigbee::{ ash, ezsp, Error };
use zigbee::serial::Transport;

pub struct TestTransport {
	incoming: Receiver<Vec<u8>>,
	buffer: Mutex<VecDeque<u8>>,
	outgoing: Sender<Vec<u8>>,
	closed: AtomicBool,
}

//the ncp side of the wire
pub struct TransportPeer {
	pub from_host: Receiver<Vec<u8>>,
	pub to_host: Sender<Vec<u8>>,
}

pub fn transport_pair() -> (Arc<TestTransport>, TransportPeer) {
	let (host_tx, host_rx) = unbounded();
	let (ncp_tx, ncp_rx) = unbounded();

	(
		Arc::new(TestTransport {
			incoming: ncp_rx,
			buffer: Mutex::new(VecDeque::new()),
			outgoing: host_tx,
			closed: AtomicBool::new(false),
		}),
		TransportPeer {
			from_host: host_rx,
			to_host: ncp_tx,
		},
	)
}

impl Transport for TestTransport {
	fn write(&self, buf: &[u8]) -> Result<(), Error> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(Error::Stopped);
		}

		self.outgoing.send(buf.to_vec()).map_err(|_| Error::Stopped)
	}

	fn read_byte(&self) -> Result<u8, Error> {
		loop {
			if self.closed.load(Ordering::SeqCst) {
				return Err(Error::Stopped);
			}

			if let Some(b) = self.buffer.lock().unwrap().pop_front() {
				return Ok(b);
			}

			match self.incoming.recv_timeout(Duration::from_millis(20)) {
				Ok(chunk) => self.buffer.lock().unwrap().extend(chunk),
				Err(RecvTimeoutError::Timeout) => continue,
				Err(RecvTimeoutError::Disconnected) => return Err(Error::Stopped),
			}
		}
	}

	fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}
}

//builds a complete ash frame: control + payload + crc, stuffed, flag
pub fn raw_frame(control: u8, payload: &[u8]) -> Vec<u8> {
	let mut raw = vec![control];

	raw.extend_from_slice(payload);

	let crc = ash::crc_ccitt(&raw);

	raw.push((crc >> 8) as u8);
	raw.push(crc as u8);

	let mut out = ash::stuff(&raw);

	out.push(ash::FLAG);

	out
}

pub fn rstack_frame() -> Vec<u8> {
	raw_frame(0xc1, &[0x02, 0x02])
}

pub fn data_frame(frm: u8, ack: u8, payload: &[u8]) -> Vec<u8> {
	raw_frame((frm << 4) | (ack & 0x07), payload)
}

//12-byte aps frame as sendUnicast and incomingMessage carry it
pub fn aps_bytes(profile: u16, cluster: u16, src_endpoint: u8, dst_endpoint: u8) -> Vec<u8> {
	let mut out = Vec::with_capacity(11);

	out.extend_from_slice(&profile.to_le_bytes());
	out.extend_from_slice(&cluster.to_le_bytes());
	out.push(src_endpoint);
	out.push(dst_endpoint);
	out.extend_from_slice(&0u16.to_le_bytes());	//options
	out.extend_from_slice(&0u16.to_le_bytes());	//group id
	out.push(0);	//sequence

	out
}

//splits a raw serial byte stream into unstuffed, crc-checked frame bodies
#[derive(Default)]
pub struct FrameSplitter {
	buf: Vec<u8>,
}

impl FrameSplitter {
	pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
		let mut frames = Vec::new();

		for &b in bytes {
			match b {
				ash::CANCEL | ash::SUBSTITUTE => self.buf.clear(),
				ash::XON | ash::XOFF => {},
				ash::FLAG => {
					if !self.buf.is_empty() {
						let raw = ash::unstuff(&self.buf);

						self.buf.clear();

						if raw.len() >= 3 {
							let (body, crc) = raw.split_at(raw.len() - 2);

							assert_eq!(
								ash::crc_ccitt(body),
								u16::from_be_bytes([crc[0], crc[1]]),
								"host sent a frame with a bad crc"
							);
							frames.push(body.to_vec());
						}
					}
				},
				_ => self.buf.push(b),
			}
		}

		frames
	}
}

//drains everything the host has written so far into frame bodies
pub fn drain_frames(peer: &TransportPeer) -> Vec<Vec<u8>> {
	let mut splitter = FrameSplitter::default();
	let mut frames = Vec::new();

	while let Ok(chunk) = peer.from_host.try_recv() {
		frames.extend(splitter.feed(&chunk));
	}

	frames
}

//a sendUnicast decoded off the wire
#[derive(Debug, Clone)]
pub struct Unicast {
	pub node_id: u16,
	pub profile_id: u16,
	pub cluster_id: u16,
	pub src_endpoint: u8,
	pub dst_endpoint: u8,
	pub message: Vec<u8>,
}

pub struct NcpState {
	//frame format the ncp currently parses and emits; scripts flip this
	//when they answer a version command
	pub extended: bool,
	frm_num: u8,
	recv_seq: u8,
	to_host: Sender<Vec<u8>>,
	pub unicasts: Arc<Mutex<Vec<Unicast>>>,
}

impl NcpState {
	fn send_frame(&self, bytes: Vec<u8>) {
		let _ = self.to_host.send(bytes);
	}

	fn send_data(&mut self, ezsp_frame: &[u8]) {
		let control = (self.frm_num << 4) | (self.recv_seq & 0x07);

		self.frm_num = (self.frm_num + 1) & 0x07;

		self.send_frame(raw_frame(control, ezsp_frame));
	}

	pub fn send_response(&mut self, seq: u8, frame_id: u16, params: &[u8]) {
		let mut f = Vec::with_capacity(5 + params.len());

		if self.extended {
			f.push(seq);
			f.push(0x80);
			f.push(0x01);
			f.extend_from_slice(&frame_id.to_le_bytes());
		}
		else {
			f.push(seq);
			f.push(0x80);
			f.push(frame_id as u8);
		}

		f.extend_from_slice(params);
		self.send_data(&f);
	}

	pub fn send_callback(&mut self, frame_id: u16, params: &[u8]) {
		let mut f = Vec::with_capacity(5 + params.len());

		if self.extended {
			f.push(0x00);
			f.push(0x80);
			f.push(0x01);
			f.extend_from_slice(&frame_id.to_le_bytes());
		}
		else {
			f.push(0x00);
			f.push(0x84);	//legacy callback bit
			f.push(frame_id as u8);
		}

		f.extend_from_slice(params);
		self.send_data(&f);
	}
}

pub enum NcpOp {
	Callback(u16, Vec<u8>),
}

//handles one ezsp command; None means the ncp stays silent
pub type CommandScript = Box<dyn FnMut(&mut NcpState, u16, &[u8]) -> Option<Vec<u8>> + Send>;

pub struct FakeNcp {
	pub ops: Sender<NcpOp>,
	pub unicasts: Arc<Mutex<Vec<Unicast>>>,
	handle: JoinHandle<()>,
}

pub fn spawn_ncp(peer: TransportPeer, mut script: CommandScript) -> FakeNcp {
	let (ops_tx, ops_rx) = unbounded::<NcpOp>();
	let unicasts = Arc::new(Mutex::new(Vec::new()));
	let unicasts_thread = Arc::clone(&unicasts);

	let handle = thread::spawn(move || {
		let mut state = NcpState {
			extended: false,
			frm_num: 0,
			recv_seq: 0,
			to_host: peer.to_host.clone(),
			unicasts: unicasts_thread,
		};
		let mut splitter = FrameSplitter::default();

		loop {
			select! {
				recv(peer.from_host) -> chunk => {
					let chunk = match chunk {
						Ok(c) => c,
						Err(_) => return,
					};

					for body in splitter.feed(&chunk) {
						handle_frame(&mut state, &mut script, &body);
					}
				},
				recv(ops_rx) -> op => match op {
					Ok(NcpOp::Callback(frame_id, params)) => state.send_callback(frame_id, &params),
					Err(_) => return,
				},
			}
		}
	});

	FakeNcp {
		ops: ops_tx,
		unicasts,
		handle,
	}
}

fn handle_frame(state: &mut NcpState, script: &mut CommandScript, body: &[u8]) {
	let control = body[0];

	if control == 0xc0 {
		//rst: drop back to defaults and acknowledge
		state.extended = false;
		state.frm_num = 0;
		state.recv_seq = 0;
		state.send_frame(rstack_frame());

		return;
	}

	if control & 0x80 != 0 {
		//ack or nak from the host
		return;
	}

	//data frame carrying an ezsp command
	let frm = (control >> 4) & 0x07;

	state.recv_seq = (frm + 1) & 0x07;
	state.send_frame(raw_frame(0x80 | state.recv_seq, &[]));

	let frame = &body[1..];
	let was_extended = state.extended;
	let (seq, frame_id, params) = if was_extended {
		(frame[0], u16::from_le_bytes([frame[3], frame[4]]), &frame[5..])
	}
	else {
		(frame[0], frame[2] as u16, &frame[3..])
	};

	if frame_id == ezsp::FRAME_SEND_UNICAST {
		let len = params[15] as usize;

		state.unicasts.lock().unwrap().push(Unicast {
			node_id: u16::from_le_bytes([params[1], params[2]]),
			profile_id: u16::from_le_bytes([params[3], params[4]]),
			cluster_id: u16::from_le_bytes([params[5], params[6]]),
			src_endpoint: params[7],
			dst_endpoint: params[8],
			message: params[16..16 + len].to_vec(),
		});
	}

	if let Some(response) = script(state, frame_id, params) {
		//answer in the format that was current when the command arrived,
		//even if the script just switched modes
		let current = state.extended;

		state.extended = was_extended;
		state.send_response(seq, frame_id, &response);
		state.extended = current;
	}
}

//responds like a v13 ncp with a network already up
pub fn default_script() -> CommandScript {
	Box::new(|state, frame_id, _params| match frame_id {
		ezsp::FRAME_VERSION => {
			//protocol 13: the host flips to extended after this response
			state.extended = true;

			Some(vec![13, 0x02, 0x5a, 0x00])
		},
		ezsp::FRAME_SET_CONFIGURATION_VALUE => Some(vec![0x00]),
		ezsp::FRAME_NETWORK_INIT => Some(vec![0x00]),
		ezsp::FRAME_FORM_NETWORK => Some(vec![0x00]),
		ezsp::FRAME_PERMIT_JOINING => Some(vec![0x00]),
		ezsp::FRAME_GET_EUI64 => Some(vec![0xaa; 8]),
		ezsp::FRAME_GET_NETWORK_PARAMETERS => {
			let mut r = vec![0x00, 0x01];

			r.extend_from_slice(&[0u8; 8]);	//extended pan id
			r.extend_from_slice(&0x1a62u16.to_le_bytes());
			r.push(3);	//tx power
			r.push(15);	//channel
			r.push(0x00);	//join method
			r.extend_from_slice(&0xffffu16.to_le_bytes());
			r.push(0);	//nwk update id
			r.extend_from_slice(&0u32.to_le_bytes());

			Some(r)
		},
		ezsp::FRAME_SEND_UNICAST => Some(vec![0x00, 0x42]),
		_ => Some(vec![0x00]),
	})
}

//trust center join callback parameters
pub fn join_params(node_id: u16, ieee: [u8; 8], status: u8) -> Vec<u8> {
	let mut p = node_id.to_le_bytes().to_vec();

	p.extend_from_slice(&ieee);
	p.push(status);
	p.extend_from_slice(&[0x02, 0x00, 0x00]);	//policy decision, parent node id

	p
}

//incoming message callback parameters wrapping a zcl payload
pub fn incoming_message_params(cluster: u16, sender: u16, message: &[u8]) -> Vec<u8> {
	let mut p = vec![0x00];	//incoming unicast

	p.extend_from_slice(&aps_bytes(0x0104, cluster, 1, 1));
	p.push(0xff);	//lqi
	p.push(0xd8);	//rssi
	p.extend_from_slice(&sender.to_le_bytes());
	p.push(0xff);	//binding index
	p.push(0xff);	//address index
	p.push(message.len() as u8);
	p.extend_from_slice(message);

	p
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
	for _ in 0..250 {
		if cond() {
			return;
		}

		thread::sleep(Duration::from_millis(20));
	}

	panic!("timed out waiting for {}", what);
}
