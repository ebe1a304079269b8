// Volume context threaded through every index engine call

use crate::collation::UpcaseTable;
use crate::structures::NTFS_BLOCK_SIZE;
use i30_core::{FileRecord, I30Error, VolumeServices};

/// Geometry the engine needs from the mounted volume.
#[derive(Debug, Clone, Copy)]
pub struct VolumeParams {
    pub mft_record_size: u32,
    pub cluster_size: u32,
    pub sector_size: u32,
    /// Block size newly created directories declare in their INDEX_ROOT.
    pub index_block_size: u32,
}

impl VolumeParams {
    pub fn validate(&self) -> Result<(), I30Error> {
        let sizes = [
            ("MFT record size", self.mft_record_size),
            ("cluster size", self.cluster_size),
            ("sector size", self.sector_size),
            ("index block size", self.index_block_size),
        ];
        for (what, size) in sizes {
            if size == 0 || !size.is_power_of_two() {
                return Err(I30Error::InvalidArgument(format!(
                    "{} {} is not a power of two",
                    what, size
                )));
            }
        }
        if self.index_block_size < NTFS_BLOCK_SIZE {
            return Err(I30Error::InvalidArgument(format!(
                "index block size {} below minimum {}",
                self.index_block_size, NTFS_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}

/// One mounted volume as the engine sees it: the storage backend, the
/// geometry, the upcase table, and the case-sensitivity policy.
///
/// Opened at mount, dropped at unmount. Every operation takes `&mut Volume`;
/// that receiver is how the caller-held per-volume lock is encoded, the
/// engine itself never locks.
pub struct Volume {
    services: Box<dyn VolumeServices>,
    params: VolumeParams,
    upcase: UpcaseTable,
    case_sensitive: bool,
}

impl Volume {
    pub fn new(
        services: Box<dyn VolumeServices>,
        params: VolumeParams,
        upcase: UpcaseTable,
        case_sensitive: bool,
    ) -> Result<Volume, I30Error> {
        params.validate()?;
        Ok(Volume {
            services,
            params,
            upcase,
            case_sensitive,
        })
    }

    pub fn params(&self) -> &VolumeParams {
        &self.params
    }

    pub fn upcase(&self) -> &UpcaseTable {
        &self.upcase
    }

    /// Whether lookups match exactly only, with no case-insensitive pass.
    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Open a file record by number (the record-number half of a reference).
    pub fn open_record(&mut self, number: u64) -> Result<FileRecord, I30Error> {
        self.services.open_record(number)
    }

    pub(crate) fn services(&mut self) -> &mut dyn VolumeServices {
        self.services.as_mut()
    }

    /// Byte size of one VCN unit for an index with the given block size:
    /// the cluster when clusters fit inside a block, else the sector.
    pub fn index_vcn_size(&self, index_block_size: u32) -> u32 {
        if self.params.cluster_size <= index_block_size {
            self.params.cluster_size
        } else {
            self.params.sector_size
        }
    }

    /// The clusters-per-block value a new directory's INDEX_ROOT declares.
    pub fn clusters_per_index_block(&self) -> u8 {
        (self.params.index_block_size / self.index_vcn_size(self.params.index_block_size)) as u8
    }
}
