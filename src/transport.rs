// Serial transport: device discovery, DTR-handshake reset, and the two
// worker threads that turn a blocking serial port into a pair of queues.
//
// Grounded on sc64_transport.py's __reset_link/__serial_process_input/output,
// reworked into crossbeam-channel worker threads the way the teacher's
// player thread turned blocking hardware I/O into channel traffic.
//
// Raw byte I/O lives here; frame parsing (the CMD/CMP/ERR/PKT header logic)
// lives in `link`, which this module's reader thread calls into.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serialport::SerialPort;

use crate::error::{Result, SC64Error};
use crate::link::{read_frame, Frame};
use crate::protocol::{USB_PID, USB_SERIAL_PREFIX, USB_VID};

const WRITE_CHUNK: usize = 64 * 1024;
const RESET_RETRIES: u32 = 10;
const RESET_POLL: Duration = Duration::from_millis(100);

pub struct Transport {
    disconnect: Arc<AtomicBool>,
    output_tx: Sender<Vec<u8>>,
    response_rx: Receiver<(u8, Vec<u8>, bool)>,
    packet_rx: Receiver<(u8, Vec<u8>)>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Transport {
    /// Scan serial ports for an SC64 device, open it, and perform the DTR
    /// handshake. Failed candidates are closed and the scan continues to the
    /// next port rather than aborting the whole discovery pass.
    pub fn discover() -> Result<Self> {
        let ports = serialport::available_ports()?;
        let mut last_err: Option<SC64Error> = None;

        for info in ports {
            let serialport::SerialPortType::UsbPort(usb) = &info.port_type else {
                continue;
            };
            if usb.vid != USB_VID || usb.pid != USB_PID {
                continue;
            }
            let matches_serial = usb
                .serial_number
                .as_deref()
                .is_some_and(|s| s.starts_with(USB_SERIAL_PREFIX));
            if !matches_serial {
                continue;
            }

            match Self::open(&info.port_name) {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    log::warn!("candidate port {} failed: {e}", info.port_name);
                    last_err = Some(e);
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| SC64Error::connection("no SC64 device was found")))
    }

    pub fn open(path: &str) -> Result<Self> {
        let mut port = serialport::new(path, 115_200)
            .timeout(Duration::from_millis(100))
            .open()?;

        reset_link(port.as_mut())?;

        let disconnect = Arc::new(AtomicBool::new(false));
        let (output_tx, output_rx) = bounded::<Vec<u8>>(16);
        let (response_tx, response_rx) = bounded::<(u8, Vec<u8>, bool)>(4);
        let (packet_tx, packet_rx) = bounded::<(u8, Vec<u8>)>(64);

        let mut writer_port = port.try_clone()?;
        let writer_disconnect = disconnect.clone();
        let writer = thread::Builder::new()
            .name("sc64-writer".into())
            .spawn(move || writer_loop(&mut *writer_port, output_rx, writer_disconnect))
            .expect("failed to spawn writer thread");

        let mut reader_port = port;
        let reader_disconnect = disconnect.clone();
        let reader = thread::Builder::new()
            .name("sc64-reader".into())
            .spawn(move || {
                reader_loop(&mut *reader_port, response_tx, packet_tx, reader_disconnect)
            })
            .expect("failed to spawn reader thread");

        Ok(Transport {
            disconnect,
            output_tx,
            response_rx,
            packet_rx,
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    pub fn output(&self) -> Sender<Vec<u8>> {
        self.output_tx.clone()
    }

    pub fn responses(&self) -> Receiver<(u8, Vec<u8>, bool)> {
        self.response_rx.clone()
    }

    pub fn packets(&self) -> Receiver<(u8, Vec<u8>)> {
        self.packet_rx.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.disconnect.load(Ordering::SeqCst)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect.store(true, Ordering::SeqCst);
        if let Some(h) = self.writer.take() {
            let _ = h.join();
        }
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
    }
}

/// Drive DTR high until DSR follows, then low until DSR follows, draining
/// any in-flight device state between the two edges.
fn reset_link(port: &mut dyn SerialPort) -> Result<()> {
    port.clear(serialport::ClearBuffer::Output)?;

    port.write_data_terminal_ready(true)?;
    wait_for_dsr(port, true)?;

    port.clear(serialport::ClearBuffer::Input)?;

    port.write_data_terminal_ready(false)?;
    wait_for_dsr(port, false)?;

    Ok(())
}

fn wait_for_dsr(port: &mut dyn SerialPort, want: bool) -> Result<()> {
    for _ in 0..RESET_RETRIES {
        if port.read_data_set_ready()? == want {
            return Ok(());
        }
        thread::sleep(RESET_POLL);
    }
    Err(SC64Error::connection("could not reset SC64 device"))
}

fn writer_loop(port: &mut dyn SerialPort, output_rx: Receiver<Vec<u8>>, disconnect: Arc<AtomicBool>) {
    while !disconnect.load(Ordering::SeqCst) {
        let packet = match output_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(p) => p,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };

        for chunk in packet.chunks(WRITE_CHUNK) {
            if let Err(e) = port.write_all(chunk) {
                log::error!("serial write failed: {e}");
                disconnect.store(true, Ordering::SeqCst);
                return;
            }
        }
        if let Err(e) = port.flush() {
            log::error!("serial flush failed: {e}");
            disconnect.store(true, Ordering::SeqCst);
            return;
        }
    }
}

fn reader_loop(
    port: &mut dyn SerialPort,
    response_tx: Sender<(u8, Vec<u8>, bool)>,
    packet_tx: Sender<(u8, Vec<u8>)>,
    disconnect: Arc<AtomicBool>,
) {
    while !disconnect.load(Ordering::SeqCst) {
        match read_frame(port, &disconnect) {
            Ok(Frame::Response {
                letter,
                payload,
                success,
            }) => {
                if response_tx.send((letter, payload, success)).is_err() {
                    return;
                }
            }
            Ok(Frame::Packet { letter, payload }) => {
                if packet_tx.send((letter, payload)).is_err() {
                    return;
                }
            }
            Err(_) => {
                disconnect.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Read exactly `len` bytes, retrying short/timeout reads, bailing out if the
/// disconnect flag flips mid-read (mirrors `__read`'s loop in sc64.py).
pub fn blocking_read(port: &mut dyn SerialPort, len: usize, disconnect: &AtomicBool) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut data = vec![0u8; len];
    let mut have = 0;
    while have < len {
        if disconnect.load(Ordering::SeqCst) {
            return Err(SC64Error::connection("link disconnected"));
        }
        match port.read(&mut data[have..]) {
            Ok(0) => continue,
            Ok(n) => have += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(data)
}
