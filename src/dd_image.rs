// 64DD disk image translator: maps (track, head, block) to a byte range in a
// raw `.ndd` image via the disk's own embedded system area.
//
// Grounded directly on original_source/sw/pc/dd64.py's DD64Image: geometry
// constants, zone table, vzone->pzone permutations, drive types, bad-track
// derivation and the block-table build loop are carried over structurally.
// One deviation: the reference reads each zone's bad-track bytes off a
// loop-local `system_data` that, after the drive-type probe loop exits, can
// be left pointing at the last (possibly failed) probe rather than the
// validated system block — read here off the validated block instead, since
// that's plainly the intent.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Result, SC64Error};

const DISK_HEADS: usize = 2;
const DISK_TRACKS: usize = 1175;
const DISK_BLOCKS_PER_TRACK: usize = 2;
const DISK_SECTORS_PER_BLOCK: usize = 85;
const DISK_BAD_TRACKS_PER_ZONE: usize = 12;
const DISK_SYSTEM_SECTOR_SIZE: usize = 232;

/// (head, sector_size, track_count, start_track)
type ZoneEntry = (u8, usize, usize, usize);

const DISK_ZONES: [ZoneEntry; 16] = [
    (0, 232, 158, 0),
    (0, 216, 158, 158),
    (0, 208, 149, 316),
    (0, 192, 149, 465),
    (0, 176, 149, 614),
    (0, 160, 149, 763),
    (0, 144, 149, 912),
    (0, 128, 114, 1061),
    (1, 216, 158, 157),
    (1, 208, 158, 315),
    (1, 192, 149, 464),
    (1, 176, 149, 613),
    (1, 160, 149, 762),
    (1, 144, 149, 911),
    (1, 128, 149, 1060),
    (1, 112, 114, 1174),
];

const DISK_VZONE_TO_PZONE: [[usize; 16]; 7] = [
    [0, 1, 2, 9, 8, 3, 4, 5, 6, 7, 15, 14, 13, 12, 11, 10],
    [0, 1, 2, 3, 10, 9, 8, 4, 5, 6, 7, 15, 14, 13, 12, 11],
    [0, 1, 2, 3, 4, 11, 10, 9, 8, 5, 6, 7, 15, 14, 13, 12],
    [0, 1, 2, 3, 4, 5, 12, 11, 10, 9, 8, 6, 7, 15, 14, 13],
    [0, 1, 2, 3, 4, 5, 6, 13, 12, 11, 10, 9, 8, 7, 15, 14],
    [0, 1, 2, 3, 4, 5, 6, 7, 14, 13, 12, 11, 10, 9, 8, 15],
    [0, 1, 2, 3, 4, 5, 6, 7, 15, 14, 13, 12, 11, 10, 9, 8],
];

struct DriveType {
    name: &'static str,
    system_sector_size: usize,
    system_data_lbas: &'static [usize],
    bad_lbas: &'static [usize],
}

const DRIVE_TYPES: [DriveType; 2] = [
    DriveType {
        name: "development",
        system_sector_size: 192,
        system_data_lbas: &[11, 10, 3, 2],
        bad_lbas: &[0, 1, 8, 9, 16, 17, 18, 19, 20, 21, 22, 23],
    },
    DriveType {
        name: "retail",
        system_sector_size: 232,
        system_data_lbas: &[9, 8, 1, 0],
        bad_lbas: &[2, 3, 10, 11, 12, 16, 17, 18, 19, 20, 21, 22, 23],
    },
];

pub struct DD64Image {
    file: File,
    drive_type: &'static str,
    block_info_table: Vec<Option<(u64, usize)>>,
}

/// Read the `sector_size`-byte system block at `lba`, requiring all 85
/// sectors to be byte-identical. `check_disk_type` additionally requires the
/// disk-type marker bytes at offset 4/5.
fn check_system_block(
    file: &mut File,
    lba: usize,
    sector_size: usize,
    check_disk_type: bool,
) -> Result<Option<Vec<u8>>> {
    file.seek(SeekFrom::Start(
        (lba * DISK_SYSTEM_SECTOR_SIZE * DISK_SECTORS_PER_BLOCK) as u64,
    ))?;
    let mut block = vec![0u8; sector_size * DISK_SECTORS_PER_BLOCK];
    file.read_exact(&mut block)?;

    let system_data = &block[..sector_size];
    for sector in 1..DISK_SECTORS_PER_BLOCK {
        let sector_data = &block[sector * sector_size..][..sector_size];
        if system_data != sector_data {
            return Ok(None);
        }
    }

    if check_disk_type && (system_data[4] != 0x10 || (system_data[5] & 0xF0) != 0x10) {
        return Ok(None);
    }

    Ok(Some(system_data.to_vec()))
}

fn parse_disk(file: &mut File) -> Result<(&'static str, Vec<Option<(u64, usize)>>)> {
    let mut disk_system_data: Option<Vec<u8>> = None;
    let mut drive_type: Option<&'static str> = None;
    let mut disk_bad_lbas: Vec<usize> = Vec::new();

    for dt in DRIVE_TYPES.iter() {
        if disk_system_data.is_some() {
            break;
        }
        disk_bad_lbas.clear();
        disk_bad_lbas.extend_from_slice(dt.bad_lbas);
        for &lba in dt.system_data_lbas {
            match check_system_block(file, lba, dt.system_sector_size, true)? {
                Some(data) => {
                    drive_type = Some(dt.name);
                    disk_system_data = Some(data);
                }
                None => disk_bad_lbas.push(lba),
            }
        }
    }

    let mut disk_id_data = None;
    for &lba in &[15usize, 14usize] {
        match check_system_block(file, lba, DISK_SYSTEM_SECTOR_SIZE, false)? {
            Some(data) => disk_id_data = Some(data),
            None => disk_bad_lbas.push(lba),
        }
    }

    let (disk_system_data, _disk_id_data) = match (disk_system_data, disk_id_data) {
        (Some(s), Some(i)) => (s, i),
        _ => return Err(SC64Error::value("provided 64DD disk file is not valid")),
    };
    let drive_type = drive_type.expect("drive_type set alongside disk_system_data");

    let mut disk_zone_bad_tracks: Vec<Vec<usize>> = Vec::with_capacity(DISK_ZONES.len());
    for (zone, &(_, _, tracks, _)) in DISK_ZONES.iter().enumerate() {
        let start = if zone == 0 {
            0
        } else {
            disk_system_data[0x07 + zone] as usize
        };
        let stop = disk_system_data[0x07 + zone + 1] as usize;
        let mut zone_bad_tracks: Vec<usize> = (start..stop)
            .map(|offset| disk_system_data[0x20 + offset] as usize)
            .collect();
        for ignored_track in 0..(DISK_BAD_TRACKS_PER_ZONE - zone_bad_tracks.len()) {
            zone_bad_tracks.push(tracks - ignored_track - 1);
        }
        disk_zone_bad_tracks.push(zone_bad_tracks);
    }

    let disk_type = (disk_system_data[5] & 0x0F) as usize;
    if disk_type >= DISK_VZONE_TO_PZONE.len() {
        return Err(SC64Error::value("disk type out of range"));
    }

    let table_len = DISK_HEADS * DISK_TRACKS * DISK_BLOCKS_PER_TRACK;
    let mut block_info_table: Vec<Option<(u64, usize)>> = vec![None; table_len];

    let mut current_lba = 0usize;
    let mut starting_block = 0usize;
    let mut disk_file_offset = 0u64;

    for &zone in &DISK_VZONE_TO_PZONE[disk_type] {
        let (head, sector_size, tracks, start_track) = DISK_ZONES[zone];
        let mut track = start_track as i32;
        let head_flag = head != 0;

        for zone_track in 0..tracks {
            let current_zone_track = if head_flag { tracks - 1 - zone_track } else { zone_track };

            if disk_zone_bad_tracks[zone].contains(&current_zone_track) {
                track += if head_flag { -1 } else { 1 };
                continue;
            }

            for block in 0..DISK_BLOCKS_PER_TRACK {
                let index = ((track as usize) << 2) | ((head as usize) << 1) | (starting_block ^ block);
                block_info_table[index] = if !disk_bad_lbas.contains(&current_lba) {
                    Some((disk_file_offset, sector_size * DISK_SECTORS_PER_BLOCK))
                } else {
                    None
                };
                disk_file_offset += (sector_size * DISK_SECTORS_PER_BLOCK) as u64;
                current_lba += 1;
            }

            track += if head_flag { -1 } else { 1 };
            starting_block ^= 1;
        }
    }

    Ok((drive_type, block_info_table))
}

fn check_track_head_block(track: usize, head: usize, block: usize) -> Result<()> {
    if track >= DISK_TRACKS {
        return Err(SC64Error::value("track outside of possible range"));
    }
    if head >= DISK_HEADS {
        return Err(SC64Error::value("head outside of possible range"));
    }
    if block >= DISK_BLOCKS_PER_TRACK {
        return Err(SC64Error::value("block outside of possible range"));
    }
    Ok(())
}

fn table_index(track: usize, head: usize, block: usize) -> usize {
    (track << 2) | (head << 1) | block
}

impl DD64Image {
    pub fn load(path: &str) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let (drive_type, block_info_table) = parse_disk(&mut file)?;
        Ok(DD64Image {
            file,
            drive_type,
            block_info_table,
        })
    }

    pub fn get_drive_type(&self) -> &'static str {
        self.drive_type
    }

    /// Release the underlying file handle, making the eject explicit rather
    /// than relying on the value simply going out of scope.
    pub fn unload(self) {
        drop(self);
    }

    fn block_info(&self, track: usize, head: usize, block: usize) -> Result<Option<(u64, usize)>> {
        check_track_head_block(track, head, block)?;
        Ok(self.block_info_table[table_index(track, head, block)])
    }

    pub fn read_block(&mut self, track: usize, head: usize, block: usize) -> Result<Vec<u8>> {
        let (offset, size) = self.block_info(track, head, block)?.ok_or(SC64Error::BadBlock)?;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; size];
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    pub fn write_block(&mut self, track: usize, head: usize, block: usize, data: &[u8]) -> Result<()> {
        let (offset, size) = self.block_info(track, head, block)?.ok_or(SC64Error::BadBlock)?;
        if data.len() != size {
            return Err(SC64Error::value(format!(
                "provided data block size is different than expected ({} != {size})",
                data.len()
            )));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_track_head_block() {
        assert!(check_track_head_block(DISK_TRACKS, 0, 0).is_err());
        assert!(check_track_head_block(0, DISK_HEADS, 0).is_err());
        assert!(check_track_head_block(0, 0, DISK_BLOCKS_PER_TRACK).is_err());
        assert!(check_track_head_block(0, 0, 0).is_ok());
    }

    #[test]
    fn table_index_packs_track_head_block() {
        assert_eq!(table_index(0, 0, 0), 0);
        assert_eq!(table_index(1, 0, 0), 4);
        assert_eq!(table_index(0, 1, 0), 2);
        assert_eq!(table_index(0, 0, 1), 1);
    }

    #[test]
    fn zone_table_lengths_match_geometry() {
        assert_eq!(DISK_ZONES.len(), 16);
        assert_eq!(DISK_VZONE_TO_PZONE.len(), 7);
        for perm in DISK_VZONE_TO_PZONE.iter() {
            assert_eq!(perm.len(), 16);
        }
    }
}
