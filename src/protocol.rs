// Wire-level constants shared by the framed link and the command engine:
// command letters, config/setting register ids, enumerations, and the cart's
// memory map.

/// FTDI VID/PID the transport scans for.
pub const USB_VID: u16 = 0x0403;
pub const USB_PID: u16 = 0x6014;
pub const USB_SERIAL_PREFIX: &str = "SC64";

// ---- Command letters (host-issued) ----------------------------------------

pub const CMD_IDENTIFY: u8 = b'v';
pub const CMD_API_VERSION: u8 = b'V';
pub const CMD_CONFIG_GET: u8 = b'c';
pub const CMD_CONFIG_SET: u8 = b'C';
pub const CMD_SETTING_GET: u8 = b'a';
pub const CMD_SETTING_SET: u8 = b'A';
pub const CMD_MEM_READ: u8 = b'm';
pub const CMD_MEM_WRITE: u8 = b'M';
pub const CMD_FLASH_STATUS: u8 = b'p';
pub const CMD_FLASH_ERASE_BLOCK: u8 = b'P';
pub const CMD_RESET_STATE: u8 = b'R';
pub const CMD_RTC_SET: u8 = b'T';
pub const CMD_CIC_PARAMS: u8 = b'B';
pub const CMD_DEBUG_OUT: u8 = b'U';
pub const CMD_UPDATE: u8 = b'F';
pub const CMD_BACKUP: u8 = b'f';
pub const CMD_DD_BLOCK_ACK: u8 = b'D';

// ---- Async letters (device-originated PKT) ---------------------------------

pub const PKT_DD_REQUEST: u8 = b'D';
pub const PKT_ISV_TEXT: u8 = b'I';
pub const PKT_USB_DATATYPE: u8 = b'U';
pub const PKT_BUTTON: u8 = b'B';
pub const PKT_UPDATE_STATUS: u8 = b'F';

// ---- Config register ids ---------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CfgId {
    BootloaderSwitch = 0,
    RomWriteEnable = 1,
    RomShadowEnable = 2,
    DdMode = 3,
    IsvAddress = 4,
    BootMode = 5,
    SaveType = 6,
    CicSeed = 7,
    TvType = 8,
    DdSdEnable = 9,
    DdDriveType = 10,
    DdDiskState = 11,
    ButtonState = 12,
    ButtonMode = 13,
    RomExtendedEnable = 14,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SettingId {
    LedEnable = 0,
}

// ---- Enumerations (host-visible) -------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BootMode {
    Menu = 0,
    Rom = 1,
    Ddipl = 2,
    DirectRom = 3,
    DirectDdipl = 4,
}

impl BootMode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => BootMode::Menu,
            1 => BootMode::Rom,
            2 => BootMode::Ddipl,
            3 => BootMode::DirectRom,
            4 => BootMode::DirectDdipl,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaveType {
    None = 0,
    Eeprom4k = 1,
    Eeprom16k = 2,
    Sram = 3,
    Flashram = 4,
    SramBanked = 5,
}

impl SaveType {
    /// Length in bytes of the save region for this type. `NONE` is zero.
    pub fn length(self) -> usize {
        match self {
            SaveType::None => 0,
            SaveType::Eeprom4k => 512,
            SaveType::Eeprom16k => 2048,
            SaveType::Sram => 32 * 1024,
            SaveType::Flashram => 128 * 1024,
            SaveType::SramBanked => 96 * 1024,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => SaveType::None,
            1 => SaveType::Eeprom4k,
            2 => SaveType::Eeprom16k,
            3 => SaveType::Sram,
            4 => SaveType::Flashram,
            5 => SaveType::SramBanked,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CicSeed {
    Default,
    X103,
    X105,
    X106,
    Aleck,
    DdJp,
    DdUs,
    Auto,
    Raw(u8),
}

impl CicSeed {
    pub fn wire_value(self) -> u32 {
        match self {
            CicSeed::Default => 0x3F,
            CicSeed::X103 => 0x78,
            CicSeed::X105 => 0x91,
            CicSeed::X106 => 0x85,
            CicSeed::Aleck => 0xAC,
            CicSeed::DdJp => 0xDD,
            CicSeed::DdUs => 0xDE,
            CicSeed::Auto => 0xFFFF,
            CicSeed::Raw(b) => b as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TvType {
    Pal = 0,
    Ntsc = 1,
    Mpal = 2,
    Auto = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DebugDatatype {
    Text = 1,
    RawBinary = 2,
    Header = 3,
    Screenshot = 4,
    Gdb = 0xDB,
}

impl DebugDatatype {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => DebugDatatype::Text,
            2 => DebugDatatype::RawBinary,
            3 => DebugDatatype::Header,
            4 => DebugDatatype::Screenshot,
            0xDB => DebugDatatype::Gdb,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UpdateError {
    Ok = 0,
    Token = 1,
    Checksum = 2,
    Size = 3,
    UnknownChunk = 4,
    Read = 5,
}

impl UpdateError {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => UpdateError::Ok,
            1 => UpdateError::Token,
            2 => UpdateError::Checksum,
            3 => UpdateError::Size,
            4 => UpdateError::UnknownChunk,
            _ => UpdateError::Read,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UpdateStatus {
    Mcu = 1,
    Fpga = 2,
    Bootloader = 3,
    Done = 0x80,
    Error = 0xFF,
}

impl UpdateStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => UpdateStatus::Mcu,
            2 => UpdateStatus::Fpga,
            3 => UpdateStatus::Bootloader,
            0x80 => UpdateStatus::Done,
            0xFF => UpdateStatus::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdMode {
    None = 0,
    Regs = 1,
    Ddipl = 2,
    Full = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdDriveType {
    Retail = 0,
    Development = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdDiskState {
    Ejected = 0,
    Inserted = 1,
    Changed = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonMode {
    None = 0,
    N64Irq = 1,
    UsbPacket = 2,
    DdDiskSwap = 3,
}

// ---- Memory map -------------------------------------------------------------

pub mod mem {
    pub const SDRAM_BASE: u32 = 0x0000_0000;
    pub const SDRAM_LEN: u32 = 64 * 1024 * 1024;

    pub const FLASH_BASE: u32 = 0x0400_0000;
    pub const FLASH_LEN: u32 = 16 * 1024 * 1024;

    pub const EXTENDED_BASE: u32 = 0x0400_0000;
    pub const EXTENDED_LEN: u32 = 14 * 1024 * 1024;

    pub const BOOTLOADER_BASE: u32 = 0x04E0_0000;
    pub const BOOTLOADER_LEN: u32 = 1920 * 1024;

    pub const SHADOW_BASE: u32 = 0x04FE_0000;
    pub const SHADOW_LEN: u32 = 128 * 1024;

    pub const BUFFER_BASE: u32 = 0x0500_0000;
    pub const BUFFER_LEN: u32 = 8 * 1024;

    pub const EEPROM_BASE: u32 = 0x0500_2000;
    pub const EEPROM_LEN: u32 = 2 * 1024;

    pub const FIRMWARE_BASE: u32 = 0x0200_0000;

    pub const DDIPL_BASE: u32 = 0x03BC_0000;
    pub const DDIPL_LEN: u32 = 4 * 1024 * 1024;

    pub const SAVE_BASE: u32 = 0x03FE_0000;
    pub const SAVE_LEN: u32 = 128 * 1024;

    /// ROM payload may span SDRAM + EXTENDED.
    pub const ROM_MAX_LEN: u32 = SDRAM_LEN + EXTENDED_LEN;
}
