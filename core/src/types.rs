// Contract types shared between the index engine and its storage backend

use std::fmt;

/// Maximum length of one name component, in UTF-16 code units.
pub const MAX_NAME_LEN: usize = 255;

/// Well-known MFT record numbers.
pub const FILE_MFT: u64 = 0;
pub const FILE_ROOT: u64 = 5;
pub const FILE_UPCASE: u64 = 10;
pub const FILE_FIRST_USER: u64 = 24;

/// MFT record header flags.
pub const RECORD_IN_USE: u16 = 0x0001;
pub const RECORD_IS_DIRECTORY: u16 = 0x0002;

/// Virtual cluster number addressing non-resident attribute content.
pub type Vcn = i64;

/// A 64-bit MFT reference: 48-bit record number plus 16-bit reuse
/// sequence number. Identifies a file record even after slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MftRef(u64);

const RECORD_NUMBER_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

impl MftRef {
    pub fn new(number: u64, sequence: u16) -> Self {
        MftRef((number & RECORD_NUMBER_MASK) | ((sequence as u64) << 48))
    }

    pub fn from_u64(raw: u64) -> Self {
        MftRef(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn number(self) -> u64 {
        self.0 & RECORD_NUMBER_MASK
    }

    pub fn sequence(self) -> u16 {
        (self.0 >> 48) as u16
    }
}

impl fmt::Display for MftRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number(), self.sequence())
    }
}

/// NTFS attribute type codes used by the index engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AttributeType {
    StandardInformation = 0x10,
    FileName = 0x30,
    SecurityDescriptor = 0x50,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
}

impl AttributeType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// An open file record, as handed out by the storage backend.
///
/// This is plain header data, not an I/O handle; mutations take effect
/// when the record is saved back through the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    pub number: u64,
    pub sequence: u16,
    pub link_count: u16,
    pub flags: u16,
    pub file_attributes: u32,
    pub data_size: u64,
    pub allocated_size: u64,
}

impl FileRecord {
    pub fn reference(&self) -> MftRef {
        MftRef::new(self.number, self.sequence)
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & RECORD_IS_DIRECTORY != 0
    }
}
