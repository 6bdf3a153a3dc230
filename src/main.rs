// CLI driver: wires clap subcommands to the command engine, one per
// externally-exposed operation. Grounded on SN8Flash's clap-derived
// Cli/Subcommand/ValueEnum convention, and on sc64.py's
// `if __name__ == '__main__'` block for which operations exist and in what
// order they compose (upload then switch boot mode, etc).

mod bringup;
mod command;
mod dd_image;
mod debug;
mod error;
mod ipl3;
mod link;
mod protocol;
mod save;
mod transport;
mod ui;
mod update;

use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use crate::command::{CommandEngine, Progress};
use crate::debug::DebugOptions;
use crate::error::{Result, SC64Error};
use crate::link::Link;
use crate::protocol::*;
use crate::transport::Transport;
use crate::update::UpdateImage;

#[derive(Parser)]
#[command(name = "sc64", about = "Host-side control and debug agent for the SC64 N64 flashcart")]
struct Cli {
    /// Serial port path; auto-detected by VID/PID/serial-prefix when omitted
    #[arg(long, global = true)]
    port: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a ROM image and switch boot mode to ROM
    UploadRom {
        file: String,
        /// Disable the SHADOW flash split for the final 128 KiB
        #[arg(long)]
        no_shadow: bool,
        #[arg(long)]
        save_type: Option<SaveTypeArg>,
        #[arg(long)]
        tv_type: Option<TvTypeArg>,
        /// "auto", "default", "x103", "x105", "x106", "aleck", "ddjp", "ddus", or a raw byte
        #[arg(long)]
        cic_seed: Option<String>,
    },
    UploadSave {
        file: String,
    },
    DownloadSave {
        file: String,
    },
    /// Upload a 64DD IPL image and switch boot mode to DDIPL
    UploadDdipl {
        file: String,
    },
    DownloadDdipl {
        file: String,
    },
    BackupFirmware {
        file: String,
    },
    UpdateFirmware {
        file: String,
    },
    /// Reset all config/setting registers to their documented defaults
    Reset,
    PrintState,
    SetBootMode {
        mode: BootModeArg,
    },
    SetTvType {
        tv_type: TvTypeArg,
    },
    SetSaveType {
        save_type: SaveTypeArg,
    },
    SetCicSeed {
        seed: String,
    },
    /// Run the debug loop: 64DD/ISV/USB-datatype/button packet dispatch
    Debug {
        /// IS-Viewer 64 ROM offset, hex (0x...) or decimal; omit to disable
        #[arg(long)]
        isv: Option<String>,
        #[arg(long = "disk")]
        disks: Vec<String>,
        #[arg(long)]
        gdb_port: Option<u16>,
    },
    /// Read a region of cart memory to a file
    Download {
        region: RegionArg,
        file: String,
        #[arg(long)]
        offset: Option<u32>,
        #[arg(long)]
        length: Option<u32>,
    },
    /// Run board bring-up (STM32 + LCMXO2 + bootloader) from a blank board
    BringUp {
        update_image: String,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BootModeArg {
    Menu,
    Rom,
    Ddipl,
    DirectRom,
    DirectDdipl,
}

impl BootModeArg {
    fn to_protocol(self) -> BootMode {
        match self {
            BootModeArg::Menu => BootMode::Menu,
            BootModeArg::Rom => BootMode::Rom,
            BootModeArg::Ddipl => BootMode::Ddipl,
            BootModeArg::DirectRom => BootMode::DirectRom,
            BootModeArg::DirectDdipl => BootMode::DirectDdipl,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TvTypeArg {
    Pal,
    Ntsc,
    Mpal,
    Auto,
}

impl TvTypeArg {
    fn to_protocol(self) -> TvType {
        match self {
            TvTypeArg::Pal => TvType::Pal,
            TvTypeArg::Ntsc => TvType::Ntsc,
            TvTypeArg::Mpal => TvType::Mpal,
            TvTypeArg::Auto => TvType::Auto,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SaveTypeArg {
    None,
    Eeprom4k,
    Eeprom16k,
    Sram,
    Flashram,
    SramBanked,
}

impl SaveTypeArg {
    fn to_protocol(self) -> SaveType {
        match self {
            SaveTypeArg::None => SaveType::None,
            SaveTypeArg::Eeprom4k => SaveType::Eeprom4k,
            SaveTypeArg::Eeprom16k => SaveType::Eeprom16k,
            SaveTypeArg::Sram => SaveType::Sram,
            SaveTypeArg::Flashram => SaveType::Flashram,
            SaveTypeArg::SramBanked => SaveType::SramBanked,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum RegionArg {
    Sdram,
    Flash,
    Extended,
    Bootloader,
    Shadow,
    Buffer,
    Eeprom,
    Firmware,
    Ddipl,
    Save,
}

impl RegionArg {
    /// `(base, default_length)`; `default_length == 0` means the caller must
    /// supply `--length` (the FIRMWARE region has no fixed size).
    fn base_len(self) -> (u32, u32) {
        use crate::protocol::mem::*;
        match self {
            RegionArg::Sdram => (SDRAM_BASE, SDRAM_LEN),
            RegionArg::Flash => (FLASH_BASE, FLASH_LEN),
            RegionArg::Extended => (EXTENDED_BASE, EXTENDED_LEN),
            RegionArg::Bootloader => (BOOTLOADER_BASE, BOOTLOADER_LEN),
            RegionArg::Shadow => (SHADOW_BASE, SHADOW_LEN),
            RegionArg::Buffer => (BUFFER_BASE, BUFFER_LEN),
            RegionArg::Eeprom => (EEPROM_BASE, EEPROM_LEN),
            RegionArg::Firmware => (FIRMWARE_BASE, 0),
            RegionArg::Ddipl => (DDIPL_BASE, DDIPL_LEN),
            RegionArg::Save => (SAVE_BASE, SAVE_LEN),
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            ui::fail(&e);
            ExitCode::FAILURE
        }
    }
}

fn connect(port: &Option<String>) -> Result<CommandEngine> {
    let transport = match port {
        Some(path) => Transport::open(path)?,
        None => Transport::discover()?,
    };
    CommandEngine::new(Link::new(transport))
}

fn progress() -> Box<Progress<'static>> {
    Box::new(ui::print_progress)
}

fn parse_u32(s: &str) -> Result<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|_| SC64Error::value(format!("invalid hex number: {s}")))
    } else {
        s.parse().map_err(|_| SC64Error::value(format!("invalid number: {s}")))
    }
}

fn parse_cic_seed(s: &str) -> Result<CicSeed> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "auto" => CicSeed::Auto,
        "default" => CicSeed::Default,
        "x103" => CicSeed::X103,
        "x105" => CicSeed::X105,
        "x106" => CicSeed::X106,
        "aleck" => CicSeed::Aleck,
        "ddjp" => CicSeed::DdJp,
        "ddus" => CicSeed::DdUs,
        _ => CicSeed::Raw(parse_u32(s)? as u8),
    })
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::UploadRom {
            file,
            no_shadow,
            save_type,
            tv_type,
            cic_seed,
        } => {
            let engine = connect(&cli.port)?;
            let data = std::fs::read(&file)?;
            if let Some(save_type) = save_type {
                engine.set_config(CfgId::SaveType, save_type.to_protocol() as u32)?;
            }
            if let Some(tv_type) = tv_type {
                engine.set_config(CfgId::TvType, tv_type.to_protocol() as u32)?;
            }
            if let Some(seed) = cic_seed {
                engine.set_config(CfgId::CicSeed, parse_cic_seed(&seed)?.wire_value())?;
            }
            engine.upload_rom(&data, !no_shadow, progress())?;
            engine.set_config(CfgId::BootMode, BootMode::Rom as u32)?;
            ui::done("ROM upload");
            Ok(())
        }

        Command::UploadSave { file } => {
            let engine = connect(&cli.port)?;
            let data = std::fs::read(&file)?;
            engine.upload_save(&data)?;
            ui::done("save upload");
            Ok(())
        }

        Command::DownloadSave { file } => {
            let engine = connect(&cli.port)?;
            let data = engine.download_save()?;
            std::fs::write(&file, data)?;
            ui::done("save download");
            Ok(())
        }

        Command::UploadDdipl { file } => {
            let engine = connect(&cli.port)?;
            let data = std::fs::read(&file)?;
            engine.upload_ddipl(&data)?;
            engine.set_config(CfgId::BootMode, BootMode::Ddipl as u32)?;
            ui::done("DDIPL upload");
            Ok(())
        }

        Command::DownloadDdipl { file } => {
            let engine = connect(&cli.port)?;
            let data = engine.download_ddipl()?;
            std::fs::write(&file, data)?;
            ui::done("DDIPL download");
            Ok(())
        }

        Command::BackupFirmware { file } => {
            let engine = connect(&cli.port)?;
            let data = engine.backup_firmware()?;
            std::fs::write(&file, data)?;
            ui::done("firmware backup");
            Ok(())
        }

        Command::UpdateFirmware { file } => {
            let engine = connect(&cli.port)?;
            let data = std::fs::read(&file)?;
            engine.update_firmware(&data, progress())?;
            ui::done("firmware update");
            Ok(())
        }

        Command::Reset => {
            let engine = connect(&cli.port)?;
            engine.reset_state()?;
            ui::done("reset state");
            Ok(())
        }

        Command::PrintState => {
            let engine = connect(&cli.port)?;
            let (major, minor) = engine.api_version()?;
            println!("api version: {major}.{minor}");
            for (name, id) in [
                ("bootloader_switch", CfgId::BootloaderSwitch),
                ("rom_write_enable", CfgId::RomWriteEnable),
                ("rom_shadow_enable", CfgId::RomShadowEnable),
                ("rom_extended_enable", CfgId::RomExtendedEnable),
                ("dd_mode", CfgId::DdMode),
                ("isv_address", CfgId::IsvAddress),
                ("boot_mode", CfgId::BootMode),
                ("save_type", CfgId::SaveType),
                ("cic_seed", CfgId::CicSeed),
                ("tv_type", CfgId::TvType),
                ("dd_sd_enable", CfgId::DdSdEnable),
                ("dd_drive_type", CfgId::DdDriveType),
                ("dd_disk_state", CfgId::DdDiskState),
                ("button_state", CfgId::ButtonState),
                ("button_mode", CfgId::ButtonMode),
            ] {
                println!("{name}: {:#010x}", engine.get_config(id)?);
            }
            println!("led_enable: {:#010x}", engine.get_setting(SettingId::LedEnable)?);
            match engine.ipl3_checksum() {
                Ok(result) => println!(
                    "ipl3 checksum: seed={:#04x} checksum={:#014x}",
                    result.seed, result.checksum
                ),
                Err(e) => println!("ipl3 checksum: unavailable ({e})"),
            }
            Ok(())
        }

        Command::SetBootMode { mode } => {
            let engine = connect(&cli.port)?;
            engine.set_config(CfgId::BootMode, mode.to_protocol() as u32)?;
            ui::done("set boot mode");
            Ok(())
        }

        Command::SetTvType { tv_type } => {
            let engine = connect(&cli.port)?;
            engine.set_config(CfgId::TvType, tv_type.to_protocol() as u32)?;
            ui::done("set tv type");
            Ok(())
        }

        Command::SetSaveType { save_type } => {
            let engine = connect(&cli.port)?;
            engine.set_config(CfgId::SaveType, save_type.to_protocol() as u32)?;
            ui::done("set save type");
            Ok(())
        }

        Command::SetCicSeed { seed } => {
            let engine = connect(&cli.port)?;
            engine.set_config(CfgId::CicSeed, parse_cic_seed(&seed)?.wire_value())?;
            ui::done("set cic seed");
            Ok(())
        }

        Command::Debug {
            isv,
            disks,
            gdb_port,
        } => {
            let engine = connect(&cli.port)?;
            let isv_address = match isv {
                Some(s) => parse_u32(&s)?,
                None => 0,
            };
            debug::run(
                engine,
                DebugOptions {
                    isv_address,
                    disks,
                    gdb_port,
                },
            )
        }

        Command::Download {
            region,
            file,
            offset,
            length,
        } => {
            let engine = connect(&cli.port)?;
            let (base, default_len) = region.base_len();
            let addr = base + offset.unwrap_or(0);
            let len = length.unwrap_or(default_len);
            if len == 0 {
                return Err(SC64Error::value("--length is required for this region"));
            }
            let data = engine.read_memory(addr, len)?;
            std::fs::write(&file, data)?;
            ui::done(&format!("downloaded {file}"));
            Ok(())
        }

        Command::BringUp { update_image } => {
            let port = cli
                .port
                .ok_or_else(|| SC64Error::value("--port is required for bring-up"))?;
            let bytes = std::fs::read(&update_image)?;
            let image = UpdateImage::from_bytes(&bytes, true)?;
            if !ui::confirm("Board bring-up will reprogram the STM32 and FPGA and cannot be interrupted") {
                return Err(SC64Error::value("bring-up cancelled"));
            }
            // Bring-up can't be safely interrupted once it starts reprogramming the
            // board, so Ctrl-C is caught and ignored rather than left to kill the process.
            let _ = ctrlc::set_handler(|| ui::warn("Ctrl-C is ignored during board bring-up"));
            bringup::run(&port, &image, progress())?;
            ui::done("board bring-up");
            Ok(())
        }
    }
}
