// Free-block bitmap of the index allocation stream
// One bit per index block, read in bounded chunks so very large
// directories never pull the whole attribute into memory

use crate::structures::INDEX_STREAM_NAME;
use crate::volume::Volume;
use i30_core::{AttributeType, I30Error};

/// Bytes of bitmap fetched per read while scanning.
const BITMAP_CHUNK_SIZE: usize = 4096;

/// Chunked view of a directory's $BITMAP attribute.
pub struct IndexBitmap {
    dir: u64,
    size: u64,
    chunk: Vec<u8>,
    chunk_start: u64,
}

impl IndexBitmap {
    /// Opens the bitmap of a directory that has an allocation stream. The
    /// two attributes exist together, so absence here is corruption.
    pub fn open(vol: &mut Volume, dir: u64) -> Result<IndexBitmap, I30Error> {
        let size = match vol
            .services()
            .attribute_size(dir, AttributeType::Bitmap, INDEX_STREAM_NAME)?
        {
            Some(size) => size,
            None => {
                return Err(I30Error::Corrupt(format!(
                    "directory {} has an index allocation but no bitmap",
                    dir
                )))
            }
        };
        Ok(IndexBitmap {
            dir,
            size,
            chunk: Vec::new(),
            chunk_start: 0,
        })
    }

    /// Number of index blocks the bitmap covers.
    pub fn block_capacity(&self) -> u64 {
        self.size * 8
    }

    /// Lowest in-use block number at or after `block`, or `None` once the
    /// bitmap is exhausted.
    pub fn next_in_use(&mut self, vol: &mut Volume, mut block: u64) -> Result<Option<u64>, I30Error> {
        while block < self.block_capacity() {
            let byte = block / 8;
            if !self.covers(byte) {
                self.load_chunk(vol, byte)?;
            }
            let local = (byte - self.chunk_start) as usize;
            if self.chunk[local] & (1 << (block % 8)) != 0 {
                return Ok(Some(block));
            }
            block += 1;
        }
        Ok(None)
    }

    fn covers(&self, byte: u64) -> bool {
        !self.chunk.is_empty()
            && byte >= self.chunk_start
            && byte < self.chunk_start + self.chunk.len() as u64
    }

    fn load_chunk(&mut self, vol: &mut Volume, byte: u64) -> Result<(), I30Error> {
        let start = byte - byte % BITMAP_CHUNK_SIZE as u64;
        let want = BITMAP_CHUNK_SIZE.min((self.size - start) as usize);
        let mut buf = vec![0u8; want];
        let got = vol.services().read_attribute_at(
            self.dir,
            AttributeType::Bitmap,
            INDEX_STREAM_NAME,
            start,
            &mut buf,
        )?;
        if got < want {
            return Err(I30Error::Corrupt(format!(
                "bitmap of directory {} truncated at byte {}",
                self.dir,
                start + got as u64
            )));
        }
        self.chunk = buf;
        self.chunk_start = start;
        Ok(())
    }
}
