// NTFS on-disk structures for the $I30 directory index
// Bit-exact layouts: index entries, INDEX_ROOT, index blocks, FILE_NAME,
// STANDARD_INFORMATION, and the Interix special-file payloads

use byteorder::{ByteOrder, LittleEndian};
use i30_core::{I30Error, MftRef, Vcn};
use static_assertions::const_assert_eq;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the directory-index attributes ($INDEX_ROOT, $INDEX_ALLOCATION,
/// $BITMAP all carry it).
pub const INDEX_STREAM_NAME: &str = "$I30";

/// Smallest legal index block, and the unit `clusters_per_block` falls back
/// to on volumes whose clusters are larger than an index block.
pub const NTFS_BLOCK_SIZE: u32 = 512;

// Index entry flags
pub const INDEX_ENTRY_NODE: u16 = 0x01; // Entry carries a child block VCN
pub const INDEX_ENTRY_END: u16 = 0x02; // Last entry in its page, no key

// Index header flags
pub const INDEX_NODE: u8 = 0x01; // Page has children / index uses allocation

/// Collation rule for file-name indexes.
pub const COLLATION_FILENAME: u32 = 1;

// FILE_NAME file_attributes bits the engine interprets
pub const FILE_ATTR_SYSTEM: u32 = 0x0000_0004;
pub const FILE_ATTR_REPARSE_POINT: u32 = 0x0000_0400;
pub const FILE_ATTR_I30_INDEX_PRESENT: u32 = 0x1000_0000;

// Fixed header sizes
pub const INDEX_ENTRY_HEADER_SIZE: usize = 16;
pub const INDEX_ROOT_HEADER_SIZE: usize = 16;
pub const INDEX_HEADER_SIZE: usize = 16;
pub const INDEX_BLOCK_HEADER_SIZE: usize = 24;
pub const FILE_NAME_HEADER_SIZE: usize = 66;
pub const STANDARD_INFORMATION_SIZE: usize = 48;

/// Value size of a freshly created directory's INDEX_ROOT.
pub const EMPTY_INDEX_ROOT_SIZE: usize =
    INDEX_ROOT_HEADER_SIZE + INDEX_HEADER_SIZE + INDEX_ENTRY_HEADER_SIZE;

const_assert_eq!(EMPTY_INDEX_ROOT_SIZE, 48);
const_assert_eq!(FILE_NAME_HEADER_SIZE + 2 * 255, 576);

// Interix payload magics (NTFS-3G compatible encoding of special files)
pub const INTX_BLOCK_DEVICE: &[u8; 8] = b"IntxBLK\0";
pub const INTX_CHARACTER_DEVICE: &[u8; 8] = b"IntxCHR\0";
pub const INTX_SYMBOLIC_LINK: &[u8; 8] = b"IntxLNK\x01";

/// Seconds between the FILETIME epoch (1601-01-01) and the Unix epoch.
const FILETIME_EPOCH_DIFF: u64 = 11_644_473_600;
/// FILETIME resolution, ticks per second.
const FILETIME_TICKS_PER_SECOND: u64 = 10_000_000;

/// Converts a point in time to Windows FILETIME (100 ns ticks since 1601).
/// Times before the Unix epoch clamp to the FILETIME epoch.
pub fn unix_to_filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => {
            let seconds = duration.as_secs() + FILETIME_EPOCH_DIFF;
            seconds * FILETIME_TICKS_PER_SECOND + (duration.subsec_nanos() as u64 / 100)
        }
        Err(_) => 0,
    }
}

/// Current time as FILETIME.
pub fn now_filetime() -> u64 {
    unix_to_filetime(SystemTime::now())
}

/// Rounds up to the 8-byte alignment index entries use.
pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Which naming convention a FILE_NAME instance satisfies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileNameNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32AndDos = 3,
}

impl FileNameNamespace {
    pub fn from_u8(raw: u8) -> Result<Self, I30Error> {
        match raw {
            0 => Ok(FileNameNamespace::Posix),
            1 => Ok(FileNameNamespace::Win32),
            2 => Ok(FileNameNamespace::Dos),
            3 => Ok(FileNameNamespace::Win32AndDos),
            other => Err(I30Error::Corrupt(format!(
                "unknown file name namespace {}",
                other
            ))),
        }
    }
}

/// A decoded FILE_NAME attribute value, which doubles as the index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileName {
    pub parent: MftRef,
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub file_attributes: u32,
    pub reparse_tag: u32,
    pub namespace: FileNameNamespace,
    pub name: Vec<u16>,
}

impl FileName {
    pub fn parse(data: &[u8]) -> Result<FileName, I30Error> {
        if data.len() < FILE_NAME_HEADER_SIZE {
            return Err(I30Error::Corrupt(format!(
                "FILE_NAME value truncated: {} bytes",
                data.len()
            )));
        }
        let name_length = data[64] as usize;
        let name_end = FILE_NAME_HEADER_SIZE + 2 * name_length;
        if data.len() < name_end {
            return Err(I30Error::Corrupt(format!(
                "FILE_NAME name runs past value end: {} units in {} bytes",
                name_length,
                data.len()
            )));
        }
        let mut name = Vec::with_capacity(name_length);
        for i in 0..name_length {
            name.push(LittleEndian::read_u16(
                &data[FILE_NAME_HEADER_SIZE + 2 * i..],
            ));
        }
        Ok(FileName {
            parent: MftRef::from_u64(LittleEndian::read_u64(&data[0..])),
            creation_time: LittleEndian::read_u64(&data[8..]),
            modification_time: LittleEndian::read_u64(&data[16..]),
            mft_modification_time: LittleEndian::read_u64(&data[24..]),
            access_time: LittleEndian::read_u64(&data[32..]),
            allocated_size: LittleEndian::read_u64(&data[40..]),
            data_size: LittleEndian::read_u64(&data[48..]),
            file_attributes: LittleEndian::read_u32(&data[56..]),
            reparse_tag: LittleEndian::read_u32(&data[60..]),
            namespace: FileNameNamespace::from_u8(data[65])?,
            name,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        debug_assert!(self.name.len() <= u8::MAX as usize);
        let mut out = vec![0u8; FILE_NAME_HEADER_SIZE + 2 * self.name.len()];
        LittleEndian::write_u64(&mut out[0..], self.parent.as_u64());
        LittleEndian::write_u64(&mut out[8..], self.creation_time);
        LittleEndian::write_u64(&mut out[16..], self.modification_time);
        LittleEndian::write_u64(&mut out[24..], self.mft_modification_time);
        LittleEndian::write_u64(&mut out[32..], self.access_time);
        LittleEndian::write_u64(&mut out[40..], self.allocated_size);
        LittleEndian::write_u64(&mut out[48..], self.data_size);
        LittleEndian::write_u32(&mut out[56..], self.file_attributes);
        LittleEndian::write_u32(&mut out[60..], self.reparse_tag);
        out[64] = self.name.len() as u8;
        out[65] = self.namespace as u8;
        for (i, unit) in self.name.iter().enumerate() {
            LittleEndian::write_u16(&mut out[FILE_NAME_HEADER_SIZE + 2 * i..], *unit);
        }
        out
    }

    pub fn name_string(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }
}

/// Builds a STANDARD_INFORMATION value, v1.2 layout (48 bytes: four
/// timestamps, attribute flags, three zeroed version fields).
pub fn standard_information(now: u64, file_attributes: u32) -> [u8; STANDARD_INFORMATION_SIZE] {
    let mut out = [0u8; STANDARD_INFORMATION_SIZE];
    LittleEndian::write_u64(&mut out[0..], now);
    LittleEndian::write_u64(&mut out[8..], now);
    LittleEndian::write_u64(&mut out[16..], now);
    LittleEndian::write_u64(&mut out[24..], now);
    LittleEndian::write_u32(&mut out[32..], file_attributes);
    out
}

/// Reads the four timestamps out of a STANDARD_INFORMATION value:
/// creation, data change, record change, access.
pub fn standard_information_times(data: &[u8]) -> Result<[u64; 4], I30Error> {
    if data.len() < 32 {
        return Err(I30Error::Corrupt(format!(
            "STANDARD_INFORMATION value too small: {} bytes",
            data.len()
        )));
    }
    Ok([
        LittleEndian::read_u64(&data[0..]),
        LittleEndian::read_u64(&data[8..]),
        LittleEndian::read_u64(&data[16..]),
        LittleEndian::read_u64(&data[24..]),
    ])
}

/// Builds the INDEX_ROOT value of a directory with no entries: root header,
/// index header, and a single terminal entry.
pub fn empty_index_root(index_block_size: u32, clusters_per_block: u8) -> Vec<u8> {
    let mut out = vec![0u8; EMPTY_INDEX_ROOT_SIZE];
    LittleEndian::write_u32(&mut out[0..], 0x30); // indexed type: FILE_NAME
    LittleEndian::write_u32(&mut out[4..], COLLATION_FILENAME);
    LittleEndian::write_u32(&mut out[8..], index_block_size);
    out[12] = clusters_per_block;
    // index header, offsets relative to its own start
    LittleEndian::write_u32(&mut out[16..], INDEX_HEADER_SIZE as u32);
    LittleEndian::write_u32(
        &mut out[20..],
        (INDEX_HEADER_SIZE + INDEX_ENTRY_HEADER_SIZE) as u32,
    );
    LittleEndian::write_u32(
        &mut out[24..],
        (INDEX_HEADER_SIZE + INDEX_ENTRY_HEADER_SIZE) as u32,
    );
    // terminal entry
    LittleEndian::write_u16(&mut out[40..], INDEX_ENTRY_HEADER_SIZE as u16);
    LittleEndian::write_u16(&mut out[44..], INDEX_ENTRY_END);
    out
}

/// Serializes one index entry: header, key, optional trailing child VCN.
pub fn build_entry(key: &[u8], reference: MftRef, child: Option<Vcn>) -> Vec<u8> {
    let mut length = align8(INDEX_ENTRY_HEADER_SIZE + key.len());
    if child.is_some() {
        length += 8;
    }
    let mut out = vec![0u8; length];
    LittleEndian::write_u64(&mut out[0..], reference.as_u64());
    LittleEndian::write_u16(&mut out[8..], length as u16);
    LittleEndian::write_u16(&mut out[10..], key.len() as u16);
    let mut flags = 0u16;
    if child.is_some() {
        flags |= INDEX_ENTRY_NODE;
    }
    LittleEndian::write_u16(&mut out[12..], flags);
    out[INDEX_ENTRY_HEADER_SIZE..INDEX_ENTRY_HEADER_SIZE + key.len()].copy_from_slice(key);
    if let Some(vcn) = child {
        LittleEndian::write_i64(&mut out[length - 8..], vcn);
    }
    out
}

/// Serializes a page's terminal entry (no key, optional child VCN).
pub fn build_end_entry(child: Option<Vcn>) -> Vec<u8> {
    let length = INDEX_ENTRY_HEADER_SIZE + if child.is_some() { 8 } else { 0 };
    let mut out = vec![0u8; length];
    LittleEndian::write_u16(&mut out[8..], length as u16);
    let mut flags = INDEX_ENTRY_END;
    if child.is_some() {
        flags |= INDEX_ENTRY_NODE;
    }
    LittleEndian::write_u16(&mut out[12..], flags);
    if let Some(vcn) = child {
        LittleEndian::write_i64(&mut out[length - 8..], vcn);
    }
    out
}

/// Builds the DATA payload of an Interix device node.
pub fn device_payload(magic: &[u8; 8], major: u32, minor: u32) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[0..8].copy_from_slice(magic);
    LittleEndian::write_u64(&mut out[8..], major as u64);
    LittleEndian::write_u64(&mut out[16..], minor as u64);
    out
}

/// Builds the DATA payload of an Interix symlink.
pub fn symlink_payload(target: &str) -> Vec<u8> {
    let units: Vec<u16> = target.encode_utf16().collect();
    let mut out = vec![0u8; 8 + 2 * units.len()];
    out[0..8].copy_from_slice(INTX_SYMBOLIC_LINK);
    for (i, unit) in units.iter().enumerate() {
        LittleEndian::write_u16(&mut out[8 + 2 * i..], *unit);
    }
    out
}

/// Builds the self-relative security descriptor attached to every new
/// record: Administrators owner and group, one DACL entry granting
/// Everyone full access. 80 bytes.
pub fn security_descriptor_everyone() -> Vec<u8> {
    let mut out = vec![0u8; 80];
    out[0] = 1; // revision
    LittleEndian::write_u16(&mut out[2..], 0x8004); // self-relative, DACL present
    LittleEndian::write_u32(&mut out[4..], 20); // owner SID offset
    LittleEndian::write_u32(&mut out[8..], 36); // group SID offset
    LittleEndian::write_u32(&mut out[16..], 52); // DACL offset

    // owner and group: S-1-5-32-544, the Administrators alias
    for sid_at in [20usize, 36] {
        out[sid_at] = 1; // SID revision
        out[sid_at + 1] = 2; // sub-authority count
        out[sid_at + 7] = 5; // NT authority
        LittleEndian::write_u32(&mut out[sid_at + 8..], 32);
        LittleEndian::write_u32(&mut out[sid_at + 12..], 544);
    }

    // DACL holding a single access-allowed ACE
    out[52] = 2; // ACL revision
    LittleEndian::write_u16(&mut out[54..], 28); // ACL size
    LittleEndian::write_u16(&mut out[56..], 1); // ACE count

    // ACE: Everyone (S-1-1-0) gets file-all-access
    LittleEndian::write_u16(&mut out[62..], 20); // ACE size
    LittleEndian::write_u32(&mut out[64..], 0x001f_01ff);
    out[68] = 1; // SID revision
    out[69] = 1; // sub-authority count
    out[75] = 1; // world authority
    out
}
