// Debug loop: dispatches device-originated 64DD/ISV/USB-datatype/button
// packets, a stdin-reader thread for TEXT/RAWBINARY commands, and an
// optional GDB TCP tunnel.
//
// Grounded on original_source/sw/pc/sc64.py's SC64.debug_loop and its
// __handle_dd_packet/__handle_isv_packet/__handle_usb_packet helpers for
// the overall shape (single dispatch loop, disk load/eject-on-button,
// EUC-JP ISV decode). The USB-datatype sub-dispatch (TEXT/RAWBINARY/HEADER/
// SCREENSHOT/GDB) and the GDB tunnel have no counterpart in that source and
// are built from the wire layout alone; the 16-byte HEADER field layout
// (pixel_format, width, height, reserved, all big-endian u32) is an
// interpretive choice, chosen for consistency with this crate's big-endian
// wire convention rather than read off any source file.

use std::io::{BufRead, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;

use crossbeam_channel::{unbounded, Receiver, Sender};
use image::{ImageBuffer, Luma, Rgba};

use crate::command::CommandEngine;
use crate::dd_image::DD64Image;
use crate::error::{Result, SC64Error};
use crate::link::DEFAULT_TIMEOUT;
use crate::protocol::*;
use crate::ui;

const GET_PACKET_POLL: Duration = Duration::from_millis(100);

pub struct DebugOptions {
    pub isv_address: u32,
    pub disks: Vec<String>,
    pub gdb_port: Option<u16>,
}

enum Outbound {
    Text(String),
    RawBinary(Vec<u8>),
    Gdb(Vec<u8>),
}

struct DebugState {
    disk: Option<DD64Image>,
    disk_path: Option<String>,
    disks: Vec<String>,
    disk_index: usize,
    isv_buffer: Vec<u8>,
    last_header: Option<[u8; 16]>,
}

/// Run the debug loop to completion. Blocks until Ctrl-C or stdin EOF.
pub fn run(engine: CommandEngine, options: DebugOptions) -> Result<()> {
    if options.isv_address != 0 {
        engine.set_config(CfgId::RomWriteEnable, 1)?;
        engine.set_config(CfgId::IsvAddress, options.isv_address)?;
    }

    let mut drive_type: Option<&'static str> = None;
    for path in &options.disks {
        let image = DD64Image::load(path)?;
        let this_type = image.get_drive_type();
        match drive_type {
            None => drive_type = Some(this_type),
            Some(existing) if existing != this_type => {
                return Err(SC64Error::value(format!(
                    "disk drive type mismatch ({existing} vs {this_type}) for {path}"
                )));
            }
            _ => {}
        }
    }

    if !options.disks.is_empty() {
        let drive = match drive_type {
            Some("development") => DdDriveType::Development,
            _ => DdDriveType::Retail,
        };
        engine.set_config(CfgId::DdMode, DdMode::Full as u32)?;
        engine.set_config(CfgId::DdSdEnable, 0)?;
        engine.set_config(CfgId::DdDriveType, drive as u32)?;
        engine.set_config(CfgId::DdDiskState, DdDiskState::Ejected as u32)?;
        engine.set_config(CfgId::ButtonMode, ButtonMode::UsbPacket as u32)?;
    }

    let disconnect = Arc::new(AtomicBool::new(false));
    {
        let disconnect = disconnect.clone();
        ctrlc::set_handler(move || disconnect.store(true, Ordering::SeqCst))
            .map_err(|e| SC64Error::connection(format!("failed to install Ctrl-C handler: {e}")))?;
    }

    let (outbound_tx, outbound_rx) = unbounded::<Outbound>();

    let stdin_handle = {
        let tx = outbound_tx.clone();
        let disconnect = disconnect.clone();
        std::thread::Builder::new()
            .name("sc64-stdin".into())
            .spawn(move || stdin_thread(tx, disconnect))
            .map_err(|e| SC64Error::connection(e.to_string()))?
    };

    let gdb_socket: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
    let gdb_accept_handle = match options.gdb_port {
        Some(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port))?;
            listener.set_nonblocking(true)?;
            let tx = outbound_tx.clone();
            let gdb_socket = gdb_socket.clone();
            let disconnect = disconnect.clone();
            Some(
                std::thread::Builder::new()
                    .name("sc64-gdb-accept".into())
                    .spawn(move || gdb_accept_thread(listener, tx, gdb_socket, disconnect))
                    .map_err(|e| SC64Error::connection(e.to_string()))?,
            )
        }
        None => None,
    };

    let mut state = DebugState {
        disk: None,
        disk_path: None,
        disks: options.disks,
        disk_index: 0,
        isv_buffer: Vec::new(),
        last_header: None,
    };

    let result = main_loop(&engine, &outbound_rx, &gdb_socket, &disconnect, &mut state);

    disconnect.store(true, Ordering::SeqCst);
    let _ = stdin_handle.join();
    if let Some(handle) = gdb_accept_handle {
        let _ = handle.join();
    }

    if let Some(disk) = state.disk.take() {
        disk.unload();
        let _ = engine.set_config(CfgId::DdDiskState, DdDiskState::Ejected as u32);
    }
    let _ = engine.set_config(CfgId::IsvAddress, 0);

    result
}

fn main_loop(
    engine: &CommandEngine,
    outbound_rx: &Receiver<Outbound>,
    gdb_socket: &Arc<Mutex<Option<TcpStream>>>,
    disconnect: &AtomicBool,
    state: &mut DebugState,
) -> Result<()> {
    loop {
        if disconnect.load(Ordering::Relaxed) {
            return Ok(());
        }

        while let Ok(item) = outbound_rx.try_recv() {
            let (datatype, data) = match item {
                Outbound::Text(text) => (DebugDatatype::Text, text.into_bytes()),
                Outbound::RawBinary(bytes) => (DebugDatatype::RawBinary, bytes),
                Outbound::Gdb(bytes) => (DebugDatatype::Gdb, bytes),
            };
            engine.link().execute_cmd(
                CMD_DEBUG_OUT,
                [datatype as u32, data.len() as u32],
                &data,
                DEFAULT_TIMEOUT,
                true,
            )?;
        }

        if let Some((letter, payload)) = engine.link().get_packet(GET_PACKET_POLL) {
            match letter {
                PKT_DD_REQUEST => handle_dd_packet(engine, state, &payload)?,
                PKT_ISV_TEXT => handle_isv_packet(state, &payload),
                PKT_USB_DATATYPE => handle_usb_packet(state, gdb_socket, &payload)?,
                PKT_BUTTON => handle_button(engine, state)?,
                other => ui::warn(&format!("unexpected async packet '{}', ignoring", other as char)),
            }
        }
    }
}

fn handle_dd_packet(engine: &CommandEngine, state: &mut DebugState, payload: &[u8]) -> Result<()> {
    if payload.len() < 12 {
        return Err(SC64Error::connection("short 64DD request packet"));
    }
    let cmd = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let address = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    let track_head_block = u32::from_be_bytes(payload[8..12].try_into().unwrap());
    let track = ((track_head_block >> 2) & 0xFFF) as usize;
    let head = ((track_head_block >> 1) & 0x1) as usize;
    let block = (track_head_block & 0x1) as usize;

    let outcome = (|| -> Result<()> {
        let disk = state.disk.as_mut().ok_or(SC64Error::BadBlock)?;
        match cmd {
            1 => {
                let data = disk.read_block(track, head, block)?;
                engine.write_memory(address, &data)?;
                Ok(())
            }
            2 => disk.write_block(track, head, block, &payload[12..]),
            _ => Err(SC64Error::value("unknown 64DD request command")),
        }
    })();

    let ack = if outcome.is_ok() { [0u32, 0u32] } else { [1u32, 0u32] };
    engine
        .link()
        .execute_cmd(CMD_DD_BLOCK_ACK, ack, &[], DEFAULT_TIMEOUT, true)?;
    Ok(())
}

fn handle_isv_packet(state: &mut DebugState, payload: &[u8]) {
    state.isv_buffer.extend_from_slice(payload);
    while let Some(pos) = state.isv_buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = state.isv_buffer.drain(..=pos).collect();
        let (text, _, _) = encoding_rs::EUC_JP.decode(&line);
        print!("{text}");
    }
}

fn handle_usb_packet(
    state: &mut DebugState,
    gdb_socket: &Arc<Mutex<Option<TcpStream>>>,
    payload: &[u8],
) -> Result<()> {
    if payload.len() < 4 {
        return Err(SC64Error::connection("short USB datatype packet"));
    }
    let header = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let datatype = (header >> 24) as u8;
    let length = (header & 0x00FF_FFFF) as usize;
    let data = &payload[4..payload.len().min(4 + length)];

    match DebugDatatype::from_u8(datatype) {
        Some(DebugDatatype::Text) => print!("{}", String::from_utf8_lossy(data)),
        Some(DebugDatatype::RawBinary) => {
            let path = format!("binaryout-{}.bin", timestamp());
            std::fs::write(&path, data)?;
            ui::done(&format!("saved {path}"));
        }
        Some(DebugDatatype::Header) => {
            if data.len() < 16 {
                return Err(SC64Error::connection("short screenshot header"));
            }
            let mut header = [0u8; 16];
            header.copy_from_slice(&data[..16]);
            state.last_header = Some(header);
        }
        Some(DebugDatatype::Screenshot) => write_screenshot(state, data)?,
        Some(DebugDatatype::Gdb) => {
            if let Some(stream) = gdb_socket.lock().unwrap().as_mut() {
                let _ = stream.write_all(data);
            }
        }
        None => ui::warn(&format!("unknown USB datatype {datatype:#x}, ignoring")),
    }
    Ok(())
}

fn write_screenshot(state: &mut DebugState, data: &[u8]) -> Result<()> {
    let header = state
        .last_header
        .take()
        .ok_or_else(|| SC64Error::connection("screenshot packet with no preceding header"))?;
    let pixel_format = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let width = u32::from_be_bytes(header[4..8].try_into().unwrap());
    let height = u32::from_be_bytes(header[8..12].try_into().unwrap());

    let path = format!("screenshot-{}.png", timestamp());

    if pixel_format == 4 {
        let expected = (width as usize) * (height as usize) * 4;
        if data.len() < expected {
            return Err(SC64Error::connection("short RGBA screenshot payload"));
        }
        let buffer: ImageBuffer<Rgba<u8>, Vec<u8>> =
            ImageBuffer::from_raw(width, height, data[..expected].to_vec())
                .ok_or_else(|| SC64Error::connection("invalid screenshot dimensions"))?;
        buffer
            .save(&path)
            .map_err(|e| SC64Error::connection(e.to_string()))?;
    } else {
        let expected = (width as usize) * (height as usize) * 2;
        if data.len() < expected {
            return Err(SC64Error::connection("short 16-bit screenshot payload"));
        }
        let samples: Vec<u16> = data[..expected]
            .chunks_exact(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .collect();
        let buffer: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_raw(width, height, samples)
            .ok_or_else(|| SC64Error::connection("invalid screenshot dimensions"))?;
        buffer
            .save(&path)
            .map_err(|e| SC64Error::connection(e.to_string()))?;
    }

    ui::done(&format!("saved {path}"));
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ButtonAction {
    Noop,
    Eject,
    Insert(String),
}

/// Pure decision of what a button press does to the disk-swap state, with no
/// device access: no disks configured is a no-op, a loaded disk gets
/// ejected, otherwise the next disk in `disks` gets inserted.
fn next_button_action(state: &DebugState) -> ButtonAction {
    if state.disks.is_empty() {
        ButtonAction::Noop
    } else if state.disk.is_some() {
        ButtonAction::Eject
    } else {
        ButtonAction::Insert(state.disks[state.disk_index].clone())
    }
}

fn handle_button(engine: &CommandEngine, state: &mut DebugState) -> Result<()> {
    match next_button_action(state) {
        ButtonAction::Noop => Ok(()),
        ButtonAction::Eject => {
            if let Some(disk) = state.disk.take() {
                disk.unload();
            }
            engine.set_config(CfgId::DdDiskState, DdDiskState::Ejected as u32)?;
            ui::done(&format!(
                "64DD disk ejected [{}]",
                state.disk_path.take().unwrap_or_default()
            ));
            Ok(())
        }
        ButtonAction::Insert(path) => {
            state.disk = Some(DD64Image::load(&path)?);
            state.disk_path = Some(path.clone());
            engine.set_config(CfgId::DdDiskState, DdDiskState::Inserted as u32)?;
            ui::done(&format!("64DD disk inserted [{path}]"));
            state.disk_index = (state.disk_index + 1) % state.disks.len();
            Ok(())
        }
    }
}

/// Reads stdin line by line, parsing either a bare line of text (sent as a
/// TEXT packet) or `text@file@suffix` (file contents sent as RAWBINARY when
/// `suffix == "bin"`, otherwise appended to `text` and sent as TEXT).
fn stdin_thread(outbound: Sender<Outbound>, disconnect: Arc<AtomicBool>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        if disconnect.load(Ordering::Relaxed) {
            return;
        }
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        match parse_stdin_command(&line) {
            Ok(item) => {
                if outbound.send(item).is_err() {
                    break;
                }
            }
            Err(e) => ui::warn(&format!("stdin command ignored: {e}")),
        }
    }
    disconnect.store(true, Ordering::SeqCst);
}

fn parse_stdin_command(line: &str) -> Result<Outbound> {
    let parts: Vec<&str> = line.splitn(3, '@').collect();
    match parts.as_slice() {
        [text] => Ok(Outbound::Text(text.to_string())),
        [text, file, suffix] => {
            let bytes = std::fs::read(file)?;
            if *suffix == "bin" {
                Ok(Outbound::RawBinary(bytes))
            } else {
                let mut combined = text.as_bytes().to_vec();
                combined.extend_from_slice(&bytes);
                Ok(Outbound::Text(String::from_utf8_lossy(&combined).into_owned()))
            }
        }
        _ => Err(SC64Error::value(
            "malformed stdin command, expected text or text@file@suffix",
        )),
    }
}

fn gdb_accept_thread(
    listener: TcpListener,
    outbound: Sender<Outbound>,
    gdb_socket: Arc<Mutex<Option<TcpStream>>>,
    disconnect: Arc<AtomicBool>,
) {
    loop {
        if disconnect.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                let _ = stream.set_nodelay(true);
                let read_handle = match stream.try_clone() {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                *gdb_socket.lock().unwrap() = Some(stream);
                log::info!("gdb client connected");

                let tx = outbound.clone();
                let disconnect = disconnect.clone();
                std::thread::spawn(move || gdb_reader_thread(read_handle, tx, disconnect));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

fn gdb_reader_thread(mut stream: TcpStream, outbound: Sender<Outbound>, disconnect: Arc<AtomicBool>) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
    let mut buf = [0u8; 512];
    loop {
        if disconnect.load(Ordering::Relaxed) {
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if outbound.send(Outbound::Gdb(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => return,
        }
    }
}

/// Formats the current local time as `YYMMDDHHMMSS.ffffff`, the naming
/// convention used for every file this crate writes out on its own
/// initiative (screenshots, raw binary dumps).
fn timestamp() -> String {
    Local::now().format("%y%m%d%H%M%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_text_command() {
        match parse_stdin_command("hello world").unwrap() {
            Outbound::Text(s) => assert_eq!(s, "hello world"),
            _ => panic!("expected Text"),
        }
    }

    #[test]
    fn parses_binary_file_command() {
        let mut path = std::env::temp_dir();
        path.push("sc64_debug_test_binary.bin");
        std::fs::write(&path, [1u8, 2, 3, 4]).unwrap();
        let line = format!("ignored@{}@bin", path.display());
        match parse_stdin_command(&line).unwrap() {
            Outbound::RawBinary(bytes) => assert_eq!(bytes, vec![1, 2, 3, 4]),
            _ => panic!("expected RawBinary"),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_malformed_command() {
        assert!(parse_stdin_command("a@b@c@d").is_err());
    }

    #[test]
    fn isv_buffer_flushes_on_newline() {
        let mut state = DebugState {
            disk: None,
            disk_path: None,
            disks: Vec::new(),
            disk_index: 0,
            isv_buffer: Vec::new(),
            last_header: None,
        };
        handle_isv_packet(&mut state, b"hello\nworld");
        assert_eq!(state.isv_buffer, b"world");
    }

    #[test]
    fn button_with_no_disks_is_a_noop() {
        let state = DebugState {
            disk: None,
            disk_path: None,
            disks: Vec::new(),
            disk_index: 0,
            isv_buffer: Vec::new(),
            last_header: None,
        };
        assert_eq!(next_button_action(&state), ButtonAction::Noop);
    }

    #[test]
    fn button_with_disks_and_none_loaded_inserts_next() {
        let state = DebugState {
            disk: None,
            disk_path: None,
            disks: vec!["a.ndd".into(), "b.ndd".into()],
            disk_index: 1,
            isv_buffer: Vec::new(),
            last_header: None,
        };
        assert_eq!(next_button_action(&state), ButtonAction::Insert("b.ndd".into()));
    }
}
