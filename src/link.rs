// Framed link: parses CMD/CMP/ERR/PKT frames off the wire and provides the
// typed request/response + async-packet API the command engine builds on.
//
// Grounded on sc64_transport.py / sc64.py's SC64Serial: __queue_cmd,
// __pop_response, execute_cmd, get_packet. Only one command may be
// outstanding on the link at a time, and its response must come back
// letter-matched before the next command is submitted.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crossbeam_channel::Receiver;
use serialport::SerialPort;

use crate::error::{Result, SC64Error};
use crate::transport::{blocking_read, Transport};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const MEMORY_TIMEOUT: Duration = Duration::from_secs(20);
pub const UPDATE_STATUS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum Frame {
    Response {
        letter: u8,
        payload: Vec<u8>,
        success: bool,
    },
    Packet {
        letter: u8,
        payload: Vec<u8>,
    },
}

/// Read one frame off the wire: a 4-byte token followed by either a
/// length-prefixed payload (`CMP`/`ERR`/`PKT`). Any other identifier is a
/// fatal framing error.
pub fn read_frame(port: &mut dyn SerialPort, disconnect: &AtomicBool) -> Result<Frame> {
    let token = blocking_read(port, 4, disconnect)?;
    let identifier = &token[0..3];
    let letter = token[3];

    match identifier {
        b"PKT" => {
            let len = read_be_u32(&blocking_read(port, 4, disconnect)?);
            let payload = blocking_read(port, len as usize, disconnect)?;
            Ok(Frame::Packet { letter, payload })
        }
        b"CMP" | b"ERR" => {
            let len = read_be_u32(&blocking_read(port, 4, disconnect)?);
            let payload = blocking_read(port, len as usize, disconnect)?;
            Ok(Frame::Response {
                letter,
                payload,
                success: identifier == b"CMP",
            })
        }
        other => Err(SC64Error::connection(format!(
            "unknown frame identifier {other:?}"
        ))),
    }
}

fn read_be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Typed request/response + async-packet API sitting on top of a `Transport`.
pub struct Link {
    transport: Transport,
    responses: Receiver<(u8, Vec<u8>, bool)>,
    packets: Receiver<(u8, Vec<u8>)>,
}

impl Link {
    pub fn new(transport: Transport) -> Self {
        let responses = transport.responses();
        let packets = transport.packets();
        Link {
            transport,
            responses,
            packets,
        }
    }

    /// Submit a command and, unless `raise_on_err` demotes it, wait for its
    /// response. The dequeued response's letter MUST match the submitted
    /// letter — a mismatch is a fatal connection error, never silently
    /// retried.
    pub fn execute_cmd(
        &self,
        letter: u8,
        args: [u32; 2],
        data: &[u8],
        timeout: Duration,
        raise_on_err: bool,
    ) -> Result<Vec<u8>> {
        if !self.transport.is_alive() {
            return Err(SC64Error::connection("serial link is closed"));
        }

        let mut packet = Vec::with_capacity(3 + 1 + 8 + data.len());
        packet.extend_from_slice(b"CMD");
        packet.push(letter);
        packet.extend_from_slice(&args[0].to_be_bytes());
        packet.extend_from_slice(&args[1].to_be_bytes());
        packet.extend_from_slice(data);

        self.transport
            .output()
            .send(packet)
            .map_err(|_| SC64Error::connection("writer thread is gone"))?;

        let (resp_letter, payload, success) = self
            .responses
            .recv_timeout(timeout)
            .map_err(|_| SC64Error::connection("CMD response timeout"))?;

        if resp_letter != letter {
            return Err(SC64Error::connection(format!(
                "wrong command response (expected {}, got {})",
                letter as char, resp_letter as char
            )));
        }
        if raise_on_err && !success {
            return Err(SC64Error::connection(format!(
                "device returned ERR for command {}",
                letter as char
            )));
        }

        Ok(payload)
    }

    /// Pop one async packet, or `None` on timeout.
    pub fn get_packet(&self, timeout: Duration) -> Option<(u8, Vec<u8>)> {
        self.packets.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_be_u32_matches_big_endian() {
        assert_eq!(read_be_u32(&[0x00, 0x00, 0x01, 0x00]), 256);
        assert_eq!(read_be_u32(&[0xFF, 0xFF, 0xFF, 0xFF]), u32::MAX);
    }
}
