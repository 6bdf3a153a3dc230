// Update-image container: token + length-prefixed, CRC32-checked chunks.
// Used both for firmware distribution and (with only the BOOTLOADER chunk
// present) for the tail end of board bring-up.
//
// Writer grounded on original_source/sw/update/update.py's SC64UpdateData;
// reader grounded on original_source/sw/pc/primer.py's SC64UpdateData.load.
// Note the two sources disagree on int endianness in prose vs. code: both
// actually write/read little-endian 32-bit header fields (`to_bytes(...,
// byteorder='little')` / `int.from_bytes(..., byteorder='little')`) despite
// the wire protocol elsewhere being big-endian — the container format is
// host-local, not device-wire, so little-endian is kept here too.

use crc32fast::Hasher;

use crate::error::{Result, SC64Error};

const UPDATE_TOKEN: &[u8; 16] = b"SC64 Update v2.0";

const CHUNK_UPDATE_INFO: u32 = 1;
const CHUNK_MCU: u32 = 2;
const CHUNK_FPGA: u32 = 3;
const CHUNK_BOOTLOADER: u32 = 4;
const CHUNK_PRIMER: u32 = 5;

#[derive(Debug, Default, Clone)]
pub struct UpdateImage {
    pub update_info: Option<String>,
    pub mcu: Option<Vec<u8>>,
    pub fpga: Option<Vec<u8>>,
    pub bootloader: Option<Vec<u8>>,
    pub primer: Option<Vec<u8>>,
}

fn align16(value: usize) -> usize {
    if value % 16 != 0 {
        value + (16 - value % 16)
    } else {
        value
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn append_chunk(out: &mut Vec<u8>, id: u32, data: &[u8]) {
    let chunk_length = 16 + data.len();
    let aligned_length = align16(chunk_length);
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&((aligned_length - 8) as u32).to_le_bytes());
    out.extend_from_slice(&crc32(data).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out.resize(out.len() + (aligned_length - chunk_length), 0);
}

impl UpdateImage {
    /// Serialize to the on-disk container format. Only present fields become
    /// chunks; `require_all`-style callers decide beforehand whether that's
    /// acceptable.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(UPDATE_TOKEN.len());
        out.extend_from_slice(UPDATE_TOKEN);

        if let Some(info) = &self.update_info {
            append_chunk(&mut out, CHUNK_UPDATE_INFO, info.as_bytes());
        }
        if let Some(data) = &self.mcu {
            append_chunk(&mut out, CHUNK_MCU, data);
        }
        if let Some(data) = &self.fpga {
            append_chunk(&mut out, CHUNK_FPGA, data);
        }
        if let Some(data) = &self.bootloader {
            append_chunk(&mut out, CHUNK_BOOTLOADER, data);
        }
        if let Some(data) = &self.primer {
            append_chunk(&mut out, CHUNK_PRIMER, data);
        }

        out
    }

    /// Parse the on-disk container format, verifying the token and each
    /// chunk's CRC32. `require_all` additionally requires all five chunks to
    /// be present.
    pub fn from_bytes(bytes: &[u8], require_all: bool) -> Result<Self> {
        if bytes.len() < UPDATE_TOKEN.len() || &bytes[..UPDATE_TOKEN.len()] != UPDATE_TOKEN {
            return Err(SC64Error::format("invalid update file header"));
        }

        let mut image = UpdateImage::default();
        let mut pos = UPDATE_TOKEN.len();

        while pos < bytes.len() {
            let (id, data, consumed) = read_chunk(&bytes[pos..])?;
            pos += consumed;

            match id {
                CHUNK_UPDATE_INFO => {
                    image.update_info = Some(
                        String::from_utf8(data)
                            .map_err(|_| SC64Error::format("update info is not valid text"))?,
                    )
                }
                CHUNK_MCU => image.mcu = Some(data),
                CHUNK_FPGA => image.fpga = Some(data),
                CHUNK_BOOTLOADER => image.bootloader = Some(data),
                CHUNK_PRIMER => image.primer = Some(data),
                other => {
                    return Err(SC64Error::format(format!(
                        "unknown chunk id {other} inside update file"
                    )))
                }
            }
        }

        if require_all {
            if image.update_info.is_none() {
                return Err(SC64Error::format("no update info inside update file"));
            }
            if image.mcu.is_none() {
                return Err(SC64Error::format("no MCU data inside update file"));
            }
            if image.fpga.is_none() {
                return Err(SC64Error::format("no FPGA data inside update file"));
            }
            if image.bootloader.is_none() {
                return Err(SC64Error::format("no bootloader data inside update file"));
            }
            if image.primer.is_none() {
                return Err(SC64Error::format("no primer data inside update file"));
            }
        }

        Ok(image)
    }

    /// A bring-up-only image containing just the BOOTLOADER chunk, used for
    /// the final step of board bring-up once the device's own firmware
    /// update flow can take over.
    pub fn bootloader_only(bootloader: Vec<u8>) -> Self {
        UpdateImage {
            bootloader: Some(bootloader),
            ..Default::default()
        }
    }
}

fn read_u32_le(bytes: &[u8]) -> Result<u32> {
    if bytes.len() < 4 {
        return Err(SC64Error::format("truncated chunk header"));
    }
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Returns `(id, payload, bytes_consumed)`.
fn read_chunk(bytes: &[u8]) -> Result<(u32, Vec<u8>, usize)> {
    if bytes.len() < 16 {
        return Err(SC64Error::format("truncated chunk header"));
    }
    let id = read_u32_le(&bytes[0..4])?;
    let aligned_length = read_u32_le(&bytes[4..8])? as usize;
    let checksum = read_u32_le(&bytes[8..12])?;
    let data_length = read_u32_le(&bytes[12..16])? as usize;

    let data_start = 16;
    let data_end = data_start
        .checked_add(data_length)
        .filter(|&e| e <= bytes.len())
        .ok_or_else(|| SC64Error::format("chunk payload length exceeds file"))?;
    let data = bytes[data_start..data_end].to_vec();

    if crc32(&data) != checksum {
        return Err(SC64Error::format(format!(
            "invalid checksum for chunk id [{id}] inside update file"
        )));
    }

    if aligned_length.checked_sub(4 + 4 + data_length).is_none() {
        return Err(SC64Error::format("chunk aligned_length too small for its payload"));
    }

    // `aligned_length` is the on-disk field, which stores the chunk's real
    // total size minus 8 (the id and length-field words themselves aren't
    // counted). The real number of bytes this chunk occupies is therefore
    // `aligned_length + 8`, not `aligned_length`.
    Ok((id, data, aligned_length + 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_info_and_bootloader_chunk() {
        let image = UpdateImage {
            update_info: Some("test".to_string()),
            bootloader: Some(vec![0u8; 1024]),
            ..Default::default()
        };
        let bytes = image.to_bytes();
        let parsed = UpdateImage::from_bytes(&bytes, false).unwrap();

        assert_eq!(parsed.update_info.as_deref(), Some("test"));
        assert_eq!(parsed.bootloader.as_ref().unwrap().len(), 1024);
        assert_eq!(crc32(parsed.bootloader.as_ref().unwrap()), crc32(&[0u8; 1024]));
    }

    #[test]
    fn rejects_bad_token() {
        let err = UpdateImage::from_bytes(b"not an update image.....", false).unwrap_err();
        assert!(matches!(err, SC64Error::Format(_)));
    }

    #[test]
    fn require_all_rejects_partial_image() {
        let image = UpdateImage {
            update_info: Some("x".to_string()),
            ..Default::default()
        };
        let bytes = image.to_bytes();
        assert!(UpdateImage::from_bytes(&bytes, true).is_err());
        assert!(UpdateImage::from_bytes(&bytes, false).is_ok());
    }

    #[test]
    fn chunks_are_16_byte_aligned() {
        let image = UpdateImage {
            mcu: Some(vec![1, 2, 3]),
            ..Default::default()
        };
        let bytes = image.to_bytes();
        assert_eq!((bytes.len() - UPDATE_TOKEN.len()) % 16, 0);
    }

    #[test]
    fn detects_corrupted_payload() {
        let image = UpdateImage {
            mcu: Some(vec![1, 2, 3, 4]),
            ..Default::default()
        };
        let mut bytes = image.to_bytes();
        let payload_byte = UPDATE_TOKEN.len() + 16;
        bytes[payload_byte] ^= 0xFF;
        assert!(UpdateImage::from_bytes(&bytes, false).is_err());
    }

    #[test]
    fn bootloader_only_omits_other_chunks() {
        let image = UpdateImage::bootloader_only(vec![0xAB; 16]);
        assert!(image.mcu.is_none());
        assert!(image.fpga.is_none());
        assert!(image.primer.is_none());
        assert_eq!(image.bootloader, Some(vec![0xAB; 16]));
    }
}
