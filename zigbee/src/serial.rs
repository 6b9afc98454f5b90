//serial transport to the coordinator dongle: 115200 8n1, rts asserted

use crate::Error;
use log::info;
use serialport::{ self, SerialPort, TTYPort };
use std::io::Read;
use std::sync::Mutex;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::Duration;

//short poll so the read loop can notice close() without a pending byte
const READ_TIMEOUT: Duration = Duration::from_millis(100);

//byte stream the link layer runs over; reads belong to a single reader task,
//writes may come from any task and are serialized internally
pub trait Transport: Send + Sync {
	fn write(&self, buf: &[u8]) -> Result<(), Error>;
	fn read_byte(&self) -> Result<u8, Error>;
	fn close(&self);
}

pub struct SerialTransport {
	reader: Mutex<TTYPort>,
	writer: Mutex<TTYPort>,
	closed: AtomicBool,
}

impl SerialTransport {
	pub fn open(path: &str) -> Result<Self, Error> {
		let mut port = serialport::new(path, 115_200)
			.data_bits(serialport::DataBits::Eight)
			.parity(serialport::Parity::None)
			.stop_bits(serialport::StopBits::One)
			.timeout(READ_TIMEOUT)
			.open_native()?;

		//silabs dongles wait for the host flow control lines
		port.write_request_to_send(true)?;

		let writer = port.try_clone_native()?;

		info!("serial port {} open", path);

		Ok(Self {
			reader: Mutex::new(port),
			writer: Mutex::new(writer),
			closed: AtomicBool::new(false),
		})
	}
}

impl Transport for SerialTransport {
	fn write(&self, buf: &[u8]) -> Result<(), Error> {
		use std::io::Write;

		let mut port = self.writer.lock().unwrap();

		Ok(port.write_all(buf)?)
	}

	fn read_byte(&self) -> Result<u8, Error> {
		let mut buf = [0u8; 1];

		loop {
			if self.closed.load(Ordering::SeqCst) {
				return Err(Error::Stopped);
			}

			let mut port = self.reader.lock().unwrap();

			match port.read_exact(&mut buf) {
				Ok(()) => return Ok(buf[0]),
				Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
				Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(Error::Io(e)),
			}
		}
	}

	fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}
}
