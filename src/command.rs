// Command engine: typed operations layered on the framed link. Grounded on
// sc64.py's SC64 class (__get_config/__set_config/__write_memory/
// __read_memory/update_firmware/backup_firmware/set_cic_parameters/
// reset_state), extended to the richer register set and flash-program
// semantics this crate exposes.

use std::thread;
use std::time::Duration;

use chrono::{Datelike, Local, Timelike};

use crate::error::{Result, SC64Error};
use crate::ipl3;
use crate::link::{Link, DEFAULT_TIMEOUT, MEMORY_TIMEOUT, UPDATE_STATUS_TIMEOUT};
use crate::protocol::mem::*;
use crate::protocol::*;
use crate::save;

/// `(total, position, description)` progress callback, passed through
/// explicitly as a parameter rather than as a stored back-channel handle.
pub type Progress<'a> = dyn FnMut(u64, u64, &str) + 'a;

fn no_progress(_total: u64, _position: u64, _description: &str) {}

pub struct CommandEngine {
    link: Link,
}

impl CommandEngine {
    /// Wrap an already-connected link and verify the device identifies as
    /// an SC64 running the expected protocol major version.
    pub fn new(link: Link) -> Result<Self> {
        let engine = CommandEngine { link };
        let ident = engine
            .link
            .execute_cmd(CMD_IDENTIFY, [0, 0], &[], DEFAULT_TIMEOUT, true)?;
        if ident != b"SCv2" {
            return Err(SC64Error::connection("unknown SC64 API identification"));
        }
        let version = engine.api_version()?;
        if version.0 != 2 {
            return Err(SC64Error::connection(format!(
                "unsupported API major version {}",
                version.0
            )));
        }
        Ok(engine)
    }

    pub fn api_version(&self) -> Result<(u16, u16)> {
        let data = self
            .link
            .execute_cmd(CMD_API_VERSION, [0, 0], &[], DEFAULT_TIMEOUT, true)?;
        if data.len() < 4 {
            return Err(SC64Error::connection("short API version response"));
        }
        let major = u16::from_be_bytes([data[0], data[1]]);
        let minor = u16::from_be_bytes([data[2], data[3]]);
        Ok((major, minor))
    }

    // ---- config / setting ---------------------------------------------

    pub fn get_config(&self, id: CfgId) -> Result<u32> {
        let data = self
            .link
            .execute_cmd(CMD_CONFIG_GET, [id as u32, 0], &[], DEFAULT_TIMEOUT, true)?;
        Ok(read_u32(&data)?)
    }

    pub fn set_config(&self, id: CfgId, value: u32) -> Result<()> {
        self.link
            .execute_cmd(CMD_CONFIG_SET, [id as u32, value], &[], DEFAULT_TIMEOUT, true)?;
        Ok(())
    }

    pub fn get_setting(&self, id: SettingId) -> Result<u32> {
        let data = self
            .link
            .execute_cmd(CMD_SETTING_GET, [id as u32, 0], &[], DEFAULT_TIMEOUT, true)?;
        Ok(read_u32(&data)?)
    }

    pub fn set_setting(&self, id: SettingId, value: u32) -> Result<()> {
        self.link
            .execute_cmd(CMD_SETTING_SET, [id as u32, value], &[], DEFAULT_TIMEOUT, true)?;
        Ok(())
    }

    // ---- memory ---------------------------------------------------------

    pub fn read_memory(&self, address: u32, length: u32) -> Result<Vec<u8>> {
        self.link
            .execute_cmd(CMD_MEM_READ, [address, length], &[], MEMORY_TIMEOUT, true)
    }

    pub fn write_memory(&self, address: u32, data: &[u8]) -> Result<()> {
        self.link.execute_cmd(
            CMD_MEM_WRITE,
            [address, data.len() as u32],
            data,
            MEMORY_TIMEOUT,
            true,
        )?;
        Ok(())
    }

    // ---- flash ------------------------------------------------------------

    /// `p[true]`: block until the device reports flash is idle.
    pub fn flash_wait_busy(&self) -> Result<()> {
        self.link
            .execute_cmd(CMD_FLASH_STATUS, [1, 0], &[], MEMORY_TIMEOUT, true)?;
        Ok(())
    }

    /// `p[false]`: query the erase-block size.
    pub fn flash_erase_block_size(&self) -> Result<u32> {
        let data = self
            .link
            .execute_cmd(CMD_FLASH_STATUS, [0, 0], &[], DEFAULT_TIMEOUT, true)?;
        read_u32(&data)
    }

    /// Erase one flash block. Rejects unaligned addresses/lengths against
    /// the device's reported erase-block size.
    pub fn erase_flash_region(&self, addr: u32, len: u32) -> Result<()> {
        if addr < FLASH_BASE || addr.checked_add(len).is_none_or(|end| end > FLASH_BASE + FLASH_LEN) {
            return Err(SC64Error::value("erase region outside of flash"));
        }
        let block = self.flash_erase_block_size()?;
        if block == 0 || addr % block != 0 || len % block != 0 {
            return Err(SC64Error::value("erase region is not block-aligned"));
        }
        let mut offset = 0u32;
        while offset < len {
            self.link
                .execute_cmd(CMD_FLASH_ERASE_BLOCK, [addr + offset, 0], &[], MEMORY_TIMEOUT, true)?;
            self.flash_wait_busy()?;
            offset += block;
        }
        Ok(())
    }

    /// Program-and-verify: read back first; on mismatch, erase the full
    /// region and rewrite in <=128 KiB chunks, waiting busy between writes,
    /// then read back once more and fail if still unequal. Used for the
    /// BOOTLOADER and SHADOW regions (flash, unlike SDRAM, can't just be
    /// overwritten).
    pub fn program_and_verify(&self, addr: u32, data: &[u8]) -> Result<()> {
        const CHUNK: usize = 128 * 1024;

        let existing = self.read_memory(addr, data.len() as u32)?;
        if existing == data {
            return Ok(());
        }

        self.erase_flash_region(addr, data.len() as u32)?;
        for (i, chunk) in data.chunks(CHUNK).enumerate() {
            self.write_memory(addr + (i * CHUNK) as u32, chunk)?;
            self.flash_wait_busy()?;
        }

        let verify = self.read_memory(addr, data.len() as u32)?;
        if verify != data {
            return Err(SC64Error::connection("flash verify failed after program"));
        }
        Ok(())
    }

    // ---- RTC --------------------------------------------------------------

    /// Set the cart's RTC from the host's local time.
    pub fn set_rtc_now(&self) -> Result<()> {
        self.set_rtc(Local::now())
    }

    pub fn set_rtc(&self, now: chrono::DateTime<Local>) -> Result<()> {
        // chrono weekday() Mon=0..Sun=6; wire wants Monday=1..Sunday=7.
        let weekday = now.weekday().num_days_from_monday() as u8 + 1;
        let hour = bcd(now.hour() as u8);
        let minute = bcd(now.minute() as u8);
        let second = bcd(now.second() as u8);
        let year = bcd((now.year() % 100) as u8);
        let month = bcd(now.month() as u8);
        let day = bcd(now.day() as u8);

        let arg0 = u32::from_be_bytes([weekday, hour, minute, second]);
        let arg1 = u32::from_be_bytes([0, year, month, day]);

        self.link
            .execute_cmd(CMD_RTC_SET, [arg0, arg1], &[], DEFAULT_TIMEOUT, true)?;
        Ok(())
    }

    // ---- CIC ----------------------------------------------------------

    pub fn set_cic_parameters(&self, disabled: bool, seed: u8, checksum: u64) -> Result<()> {
        let mut arg0 = if disabled { 1u32 << 24 } else { 0 };
        arg0 |= (seed as u32) << 16;
        arg0 |= ((checksum >> 32) & 0xFFFF) as u32;
        let arg1 = (checksum & 0xFFFF_FFFF) as u32;
        self.link
            .execute_cmd(CMD_CIC_PARAMS, [arg0, arg1], &[], DEFAULT_TIMEOUT, true)?;
        Ok(())
    }

    // ---- reset state ------------------------------------------------------

    pub fn reset_state(&self) -> Result<()> {
        self.link
            .execute_cmd(CMD_RESET_STATE, [0, 0], &[], DEFAULT_TIMEOUT, true)?;
        self.set_config(CfgId::BootloaderSwitch, 0)?;
        self.set_config(CfgId::RomWriteEnable, 0)?;
        self.set_config(CfgId::RomShadowEnable, 0)?;
        self.set_config(CfgId::RomExtendedEnable, 0)?;
        self.set_config(CfgId::DdMode, DdMode::None as u32)?;
        self.set_config(CfgId::IsvAddress, 0)?;
        self.set_config(CfgId::BootMode, BootMode::Menu as u32)?;
        self.set_config(CfgId::SaveType, SaveType::None as u32)?;
        self.set_config(CfgId::CicSeed, CicSeed::Auto.wire_value())?;
        self.set_config(CfgId::TvType, TvType::Auto as u32)?;
        self.set_config(CfgId::DdDriveType, DdDriveType::Retail as u32)?;
        self.set_config(CfgId::DdDiskState, DdDiskState::Ejected as u32)?;
        self.set_config(CfgId::ButtonMode, ButtonMode::None as u32)?;
        self.set_cic_parameters(false, CicSeed::Default.wire_value() as u8, 0xA536_C0F1_D859)
    }

    // ---- ROM / save upload --------------------------------------------

    /// Upload a ROM image, honoring the EXTENDED/SHADOW flash split for
    /// images larger than SDRAM.
    pub fn upload_rom(&self, data: &[u8], use_shadow: bool, mut progress: Box<Progress<'_>>) -> Result<()> {
        if data.len() as u32 > ROM_MAX_LEN {
            return Err(SC64Error::value("ROM size too big"));
        }

        let total = data.len() as u64;
        let mut sdram_len = data.len().min(SDRAM_LEN as usize);
        let extended_enabled = data.len() as u32 > SDRAM_LEN;
        let mut shadow_enabled = false;

        if extended_enabled {
            let tail = &data[SDRAM_LEN as usize..];
            self.set_config(CfgId::RomExtendedEnable, 1)?;
            progress(total, 0, "ROM -> EXTENDED flash");
            self.program_and_verify(EXTENDED_BASE, tail)?;
            progress(total, tail.len() as u64, "ROM -> EXTENDED flash");
        } else {
            self.set_config(CfgId::RomExtendedEnable, 0)?;
        }

        if use_shadow && data.len() as u32 > SDRAM_LEN - SHADOW_LEN {
            shadow_enabled = true;
            sdram_len -= SHADOW_LEN as usize;
            let shadow_data = &data[sdram_len..sdram_len + SHADOW_LEN as usize];
            progress(total, 0, "ROM -> SHADOW flash");
            self.program_and_verify(SHADOW_BASE, shadow_data)?;
            progress(total, shadow_data.len() as u64, "ROM -> SHADOW flash");
        }
        self.set_config(CfgId::RomShadowEnable, shadow_enabled as u32)?;

        progress(total, 0, "ROM -> SDRAM");
        self.write_memory(SDRAM_BASE, &data[..sdram_len])?;
        progress(total, sdram_len as u64, "ROM -> SDRAM");

        Ok(())
    }

    pub fn upload_ddipl(&self, data: &[u8]) -> Result<()> {
        if data.len() as u32 > DDIPL_LEN {
            return Err(SC64Error::value("DDIPL size too big"));
        }
        self.write_memory(DDIPL_BASE, data)
    }

    pub fn download_ddipl(&self) -> Result<Vec<u8>> {
        self.read_memory(DDIPL_BASE, DDIPL_LEN)
    }

    pub fn upload_save(&self, data: &[u8]) -> Result<()> {
        let save_type = SaveType::from_u32(self.get_config(CfgId::SaveType)?)
            .ok_or_else(|| SC64Error::connection("unknown save type fetched from device"))?;
        if data.len() != save_type.length() {
            return Err(SC64Error::value("wrong save data length"));
        }
        let address = save::save_address(save_type);
        self.write_memory(address, data)
    }

    pub fn download_save(&self) -> Result<Vec<u8>> {
        let save_type = SaveType::from_u32(self.get_config(CfgId::SaveType)?)
            .ok_or_else(|| SC64Error::connection("unknown save type fetched from device"))?;
        let address = save::save_address(save_type);
        self.read_memory(address, save_type.length() as u32)
    }

    // ---- firmware ----------------------------------------------------

    pub fn update_firmware(&self, data: &[u8], mut progress: Box<Progress<'_>>) -> Result<()> {
        self.write_memory(FIRMWARE_BASE, data)?;
        let response = self.link.execute_cmd(
            CMD_UPDATE,
            [FIRMWARE_BASE, data.len() as u32],
            &[],
            MEMORY_TIMEOUT,
            true,
        )?;
        let error = UpdateError::from_u32(read_u32(&response)?);
        if !matches!(error, UpdateError::Ok) {
            return Err(SC64Error::connection(format!(
                "bad update image [{error:?}]"
            )));
        }

        loop {
            let (letter, payload) = self
                .link
                .get_packet(UPDATE_STATUS_TIMEOUT)
                .ok_or_else(|| SC64Error::connection("update timeout"))?;
            if letter != PKT_UPDATE_STATUS {
                return Err(SC64Error::connection("wrong update status packet"));
            }
            let status = UpdateStatus::from_u32(read_u32(&payload)?)
                .ok_or_else(|| SC64Error::connection("unknown update status"))?;
            progress(0, status as u64, "firmware update");
            match status {
                UpdateStatus::Error => {
                    return Err(SC64Error::connection(
                        "update error, device is most likely bricked",
                    ))
                }
                UpdateStatus::Done => break,
                _ => continue,
            }
        }

        thread::sleep(Duration::from_secs(2));
        Ok(())
    }

    pub fn backup_firmware(&self) -> Result<Vec<u8>> {
        let info = self
            .link
            .execute_cmd(CMD_BACKUP, [FIRMWARE_BASE, 0], &[], UPDATE_STATUS_TIMEOUT, true)?;
        if info.len() < 8 {
            return Err(SC64Error::connection("short firmware backup response"));
        }
        let error = UpdateError::from_u32(read_u32(&info[0..4])?);
        let length = read_u32(&info[4..8])?;
        if !matches!(error, UpdateError::Ok) {
            return Err(SC64Error::connection("error while getting firmware backup"));
        }
        self.read_memory(FIRMWARE_BASE, length)
    }

    pub fn link(&self) -> &Link {
        &self.link
    }
}

fn read_u32(data: &[u8]) -> Result<u32> {
    if data.len() < 4 {
        return Err(SC64Error::connection("short response"));
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

fn bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

pub fn default_progress<'a>() -> Box<Progress<'a>> {
    Box::new(no_progress)
}

pub fn rom_uses_extended(len: usize) -> bool {
    len as u32 > SDRAM_LEN
}

impl CommandEngine {
    /// Compute the IPL3 checksum for whichever region `BOOT_MODE` currently
    /// points at, guessing the seed from the image's CRC32.
    pub fn ipl3_checksum(&self) -> Result<ipl3::Ipl3Result> {
        let boot_mode = BootMode::from_u32(self.get_config(CfgId::BootMode)?)
            .ok_or_else(|| SC64Error::connection("unknown boot mode fetched from device"))?;
        let base = match boot_mode {
            BootMode::Ddipl | BootMode::DirectDdipl => DDIPL_BASE,
            BootMode::Rom | BootMode::DirectRom => SDRAM_BASE,
            BootMode::Menu => BOOTLOADER_BASE,
        };
        let image = self.read_memory(base + 0x40, ipl3::IPL3_LEN as u32)?;
        Ok(ipl3::checksum_auto(&image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_encodes_digits() {
        assert_eq!(bcd(0), 0x00);
        assert_eq!(bcd(9), 0x09);
        assert_eq!(bcd(23), 0x23);
        assert_eq!(bcd(59), 0x59);
    }

    #[test]
    fn rom_extended_threshold() {
        assert!(!rom_uses_extended(SDRAM_LEN as usize));
        assert!(rom_uses_extended(SDRAM_LEN as usize + 1));
    }
}
