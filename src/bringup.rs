// Board bring-up: flashes a blank board's MCU and FPGA through their own
// ROM bootloaders over the same serial pins the main protocol later uses.
//
// Grounded on original_source/sw/pc/primer.py: STM32Bootloader, LCMXO2Primer,
// and SC64BringUp's driver sequence. Both sub-protocols here write/read a
// shared serial port directly — bring-up happens before any SC64 firmware
// is alive, so it can't go through transport::Transport/link::Link.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use crc32fast::Hasher;
use serialport::SerialPort;

use crate::command::{CommandEngine, Progress};
use crate::error::{Result, SC64Error};
use crate::update::UpdateImage;

const SETTLE_TIME: Duration = Duration::from_millis(500);
const BRING_UP_BAUD: u32 = 115_200;
const BRING_UP_TIMEOUT: Duration = Duration::from_secs(6);

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn raw_write(port: &mut dyn SerialPort, data: &[u8]) -> Result<()> {
    port.write_all(data)?;
    port.flush()?;
    Ok(())
}

fn raw_read(port: &mut dyn SerialPort, len: usize) -> Result<Vec<u8>> {
    let mut data = vec![0u8; len];
    port.read_exact(&mut data)?;
    Ok(data)
}

fn drain(port: &mut dyn SerialPort) {
    let mut scratch = [0u8; 256];
    while let Ok(n) = port.read(&mut scratch) {
        if n == 0 {
            break;
        }
    }
}

// ---- STM32 ROM bootloader sub-protocol --------------------------------------

const STM32_INIT: u8 = 0x7F;
const STM32_ACK: u8 = 0x79;
const STM32_NACK: u8 = 0x1F;

const STM32_MEMORY_RW_MAX_SIZE: usize = 256;
const STM32_FLASH_LOAD_ADDRESS: u32 = 0x0800_0000;
const STM32_FLASH_MAX_LOAD_SIZE: usize = 0x8000;
const STM32_RAM_LOAD_ADDRESS: u32 = 0x2000_1000;
const STM32_RAM_MAX_LOAD_SIZE: usize = 0x1000;

pub const DEV_ID_STM32G030XX: [u8; 2] = [0x04, 0x66];

struct Stm32Bootloader<'a> {
    port: &'a mut dyn SerialPort,
    connected: bool,
}

impl<'a> Stm32Bootloader<'a> {
    fn new(port: &'a mut dyn SerialPort) -> Self {
        Stm32Bootloader {
            port,
            connected: false,
        }
    }

    fn append_xor(data: &[u8]) -> Vec<u8> {
        let mut xor = if data.len() == 1 { 0xFFu8 } else { 0x00u8 };
        for &b in data {
            xor ^= b;
        }
        let mut out = data.to_vec();
        out.push(xor);
        out
    }

    fn check_ack(&mut self) -> Result<()> {
        let response = raw_read(self.port, 1)?[0];
        if response == STM32_NACK {
            return Err(SC64Error::bring_up("NACK byte received"));
        }
        if response != STM32_ACK {
            return Err(SC64Error::bring_up("unknown ACK/NACK byte received"));
        }
        Ok(())
    }

    fn cmd_send(&mut self, cmd: u8) -> Result<()> {
        let framed = Self::append_xor(&[cmd]);
        raw_write(self.port, &framed)?;
        self.check_ack()
    }

    fn data_write(&mut self, data: &[u8]) -> Result<()> {
        let framed = Self::append_xor(data);
        raw_write(self.port, &framed)?;
        self.check_ack()
    }

    fn data_read(&mut self) -> Result<Vec<u8>> {
        let length = raw_read(self.port, 1)?[0] as usize;
        let data = raw_read(self.port, length + 1)?;
        self.check_ack()?;
        Ok(data)
    }

    fn get_id(&mut self) -> Result<Vec<u8>> {
        self.cmd_send(0x02)?;
        self.data_read()
    }

    fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        if length == 0 || length > STM32_MEMORY_RW_MAX_SIZE {
            return Err(SC64Error::value("wrong data size for read memory command"));
        }
        self.cmd_send(0x11)?;
        self.data_write(&address.to_be_bytes())?;
        self.data_write(&[(length - 1) as u8])?;
        raw_read(self.port, length)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let length = data.len();
        if length == 0 || length > STM32_MEMORY_RW_MAX_SIZE {
            return Err(SC64Error::value("wrong data size for write memory command"));
        }
        if length % 4 != 0 {
            return Err(SC64Error::value("write memory command requires 4 byte alignment"));
        }
        self.cmd_send(0x31)?;
        self.data_write(&address.to_be_bytes())?;
        let mut payload = vec![(length - 1) as u8];
        payload.extend_from_slice(data);
        self.data_write(&payload)
    }

    fn go(&mut self, address: u32) -> Result<()> {
        self.cmd_send(0x21)?;
        self.data_write(&address.to_be_bytes())?;
        self.connected = false;
        Ok(())
    }

    fn mass_erase(&mut self) -> Result<()> {
        self.cmd_send(0x44)?;
        self.data_write(&[0xFF, 0xFF])
    }

    fn load_memory(&mut self, address: u32, data: &[u8], description: &str, progress: &mut Progress<'_>) -> Result<()> {
        let length = data.len() as u64;
        progress(length, 0, description);
        for offset in (0..data.len()).step_by(STM32_MEMORY_RW_MAX_SIZE) {
            let end = (offset + STM32_MEMORY_RW_MAX_SIZE).min(data.len());
            let chunk = &data[offset..end];
            self.write_memory(address + offset as u32, chunk)?;
            let verify = self.read_memory(address + offset as u32, chunk.len())?;
            if chunk != verify.as_slice() {
                return Err(SC64Error::bring_up("memory verify failed"));
            }
            progress(length, offset as u64, description);
        }
        progress(length, length, description);
        Ok(())
    }

    fn connect(&mut self, id: &[u8]) -> Result<()> {
        if !self.connected {
            raw_write(self.port, &[STM32_INIT])?;
            self.check_ack()?;
            self.connected = true;
        }
        let dev_id = self.get_id()?;
        if dev_id != id {
            return Err(SC64Error::bring_up("unknown chip detected"));
        }
        Ok(())
    }

    fn load_ram_and_run(&mut self, data: &[u8], description: &str, progress: &mut Progress<'_>) -> Result<()> {
        if data.len() > STM32_RAM_MAX_LOAD_SIZE {
            return Err(SC64Error::bring_up("RAM image too big"));
        }
        self.load_memory(STM32_RAM_LOAD_ADDRESS, data, description, progress)?;
        self.go(STM32_RAM_LOAD_ADDRESS)
    }

    fn load_flash_and_run(&mut self, data: &[u8], description: &str, progress: &mut Progress<'_>) -> Result<()> {
        if data.len() > STM32_FLASH_MAX_LOAD_SIZE {
            return Err(SC64Error::bring_up("flash image too big"));
        }
        self.mass_erase()?;
        let result = self
            .load_memory(STM32_FLASH_LOAD_ADDRESS, data, description, progress)
            .and_then(|_| self.go(STM32_FLASH_LOAD_ADDRESS));
        if let Err(e) = result {
            let _ = self.mass_erase();
            return Err(e);
        }
        Ok(())
    }
}

// ---- LCMXO2 FPGA primer sub-protocol -----------------------------------------

const PRIMER_ID_LCMXO2: &[u8] = b"MXO2";
const FLASH_PAGE_SIZE: usize = 16;
const FLASH_NUM_PAGES: usize = 11260;
const FPGA_PROBE_VALUE: u8 = 0x64;

pub const DEV_ID_LCMXO2_7000HC: [u8; 4] = [0x01, 0x2B, 0xD0, 0x43];

struct Lcmxo2Primer<'a> {
    port: &'a mut dyn SerialPort,
}

impl<'a> Lcmxo2Primer<'a> {
    fn new(port: &'a mut dyn SerialPort) -> Self {
        Lcmxo2Primer { port }
    }

    fn cmd_execute(&mut self, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() >= 256 {
            return Err(SC64Error::value("data size too big"));
        }

        let mut packet = Vec::with_capacity(3 + 1 + 1 + data.len());
        packet.extend_from_slice(b"CMD");
        packet.push(cmd);
        packet.push(data.len() as u8);
        packet.extend_from_slice(data);
        let crc = crc32(&packet);
        packet.extend_from_slice(&crc.to_le_bytes());
        raw_write(self.port, &packet)?;

        let mut response = raw_read(self.port, 5)?;
        let length = response[4] as usize;
        response.extend(raw_read(self.port, length)?);
        let calculated_checksum = crc32(&response);
        let received_checksum = u32::from_le_bytes(raw_read(self.port, 4)?.try_into().unwrap());

        if &response[0..3] != b"RSP" {
            return Err(SC64Error::bring_up("invalid response token"));
        }
        if response[3] != cmd {
            return Err(SC64Error::bring_up("invalid response command"));
        }
        if calculated_checksum != received_checksum {
            return Err(SC64Error::bring_up("invalid response checksum"));
        }

        Ok(response[5..].to_vec())
    }

    fn connect(&mut self, id: &[u8]) -> Result<()> {
        let primer_id = self.cmd_execute(b'?', &[])?;
        if primer_id != PRIMER_ID_LCMXO2 {
            return Err(SC64Error::bring_up("invalid primer ID received"));
        }
        let dev_id = self.cmd_execute(b'I', &[])?;
        if dev_id != id {
            return Err(SC64Error::bring_up("invalid FPGA device id received"));
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        let _ = self.cmd_execute(b'E', &[]);
        let _ = self.cmd_execute(b'X', &[]);
        let _ = self.cmd_execute(b'B', &[]);
        let _ = self.cmd_execute(b'$', &[]);
    }

    fn load_flash_and_run(&mut self, data: &[u8], description: &str, progress: &mut Progress<'_>) -> Result<()> {
        let length = data.len() as u64;
        if data.len() > FLASH_PAGE_SIZE * FLASH_NUM_PAGES {
            return Err(SC64Error::bring_up("FPGA data size too big"));
        }

        let erase_desc = format!("{description} / Erase");
        let program_desc = format!("{description} / Program");
        let verify_desc = format!("{description} / Verify");

        self.cmd_execute(b'E', &[])?;

        progress(length, 0, &erase_desc);
        self.cmd_execute(b'X', &[])?;
        progress(length, length, &erase_desc);

        let result = (|| -> Result<()> {
            self.cmd_execute(b'A', &[])?;
            progress(length, 0, &program_desc);
            for offset in (0..data.len()).step_by(FLASH_PAGE_SIZE) {
                let end = (offset + FLASH_PAGE_SIZE).min(data.len());
                self.cmd_execute(b'W', &data[offset..end])?;
                progress(length, offset as u64, &program_desc);
            }
            progress(length, length, &program_desc);

            self.cmd_execute(b'A', &[])?;
            progress(length, 0, &verify_desc);
            for offset in (0..data.len()).step_by(FLASH_PAGE_SIZE) {
                let end = (offset + FLASH_PAGE_SIZE).min(data.len());
                let page = &data[offset..end];
                let verify = self.cmd_execute(b'R', &[])?;
                progress(length, offset as u64, &verify_desc);
                if page != verify.as_slice() {
                    return Err(SC64Error::bring_up("FPGA verification error"));
                }
            }
            progress(length, length, &verify_desc);

            self.cmd_execute(b'Q', &[])?;
            self.cmd_execute(b'F', &[])?;
            self.cmd_execute(b'B', &[])?;

            let probe = self.cmd_execute(b'#', &[])?;
            if probe != [FPGA_PROBE_VALUE] {
                return Err(SC64Error::bring_up("invalid FPGA ID value received"));
            }
            Ok(())
        })();

        if result.is_err() {
            self.cleanup();
            return result;
        }

        self.cmd_execute(b'$', &[])?;
        Ok(())
    }
}

// ---- Orchestration ------------------------------------------------------------

/// Drives the full STM32-primer / FPGA-configure / STM32-firmware bring-up
/// sequence against an already-loaded `require_all` update image.
pub fn run(
    port_path: &str,
    image: &UpdateImage,
    mut progress: Box<Progress<'_>>,
) -> Result<()> {
    let primer_data = image
        .primer
        .as_ref()
        .ok_or_else(|| SC64Error::bring_up("update image has no primer data"))?;
    let fpga_data = image
        .fpga
        .as_ref()
        .ok_or_else(|| SC64Error::bring_up("update image has no FPGA data"))?;
    let mcu_data = image
        .mcu
        .as_ref()
        .ok_or_else(|| SC64Error::bring_up("update image has no MCU data"))?;
    let bootloader_data = image
        .bootloader
        .as_ref()
        .ok_or_else(|| SC64Error::bring_up("update image has no bootloader data"))?;

    let mut port = serialport::new(port_path, BRING_UP_BAUD)
        .parity(serialport::Parity::Even)
        .timeout(BRING_UP_TIMEOUT)
        .open()?;

    {
        let port = port.as_mut();
        let mut stm32 = Stm32Bootloader::new(port);
        stm32.connect(&DEV_ID_STM32G030XX)?;
        stm32.load_ram_and_run(primer_data, "FPGA primer -> STM32 RAM", &mut progress)?;
    }
    thread::sleep(SETTLE_TIME);
    drain(port.as_mut());

    {
        let port = port.as_mut();
        let mut lcmxo2 = Lcmxo2Primer::new(port);
        lcmxo2.connect(&DEV_ID_LCMXO2_7000HC)?;
        lcmxo2.load_flash_and_run(fpga_data, "FPGA configuration -> LCMXO2 FLASH", &mut progress)?;
    }
    thread::sleep(SETTLE_TIME);
    drain(port.as_mut());

    {
        let port = port.as_mut();
        let mut stm32 = Stm32Bootloader::new(port);
        stm32.connect(&DEV_ID_STM32G030XX)?;
        stm32.load_flash_and_run(mcu_data, "MCU software -> STM32 FLASH", &mut progress)?;
    }
    thread::sleep(SETTLE_TIME);
    drain(port.as_mut());

    drop(port);

    // The firmware is alive now; hand off to the regular command engine's
    // update flow with a bootloader-only image.
    let bootloader_only = UpdateImage::bootloader_only(bootloader_data.clone());
    let engine = CommandEngine::new(crate::link::Link::new(crate::transport::Transport::open(port_path)?))?;
    let payload = bootloader_only.to_bytes();
    let length = payload.len() as u64;
    progress(length, 0, "Bootloader -> SC64 FLASH");
    engine.update_firmware(&payload, Box::new(|_, _, _| {}))?;
    progress(length, length, "Bootloader -> SC64 FLASH");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_xor_single_byte_uses_0xff_base() {
        let framed = Stm32Bootloader::append_xor(&[0x02]);
        assert_eq!(framed, vec![0x02, 0x02 ^ 0xFF]);
    }

    #[test]
    fn append_xor_multi_byte_uses_0x00_base() {
        let framed = Stm32Bootloader::append_xor(&[0x01, 0x02, 0x03]);
        assert_eq!(framed[3], 0x01 ^ 0x02 ^ 0x03);
    }
}
