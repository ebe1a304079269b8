// Directory enumeration: synthetic dot entries, then the index root,
// then allocation blocks in ascending order as the bitmap marks them
// in use. Positions encode where to resume, so callers can stop and
// come back without missing or repeating entries.

use crate::bitmap::IndexBitmap;
use crate::index::{read_index_block, read_index_root, IndexEntry, IndexNode};
use crate::structures::{
    FileName, FileNameNamespace, FILE_ATTR_I30_INDEX_PRESENT, FILE_ATTR_SYSTEM,
    INDEX_STREAM_NAME,
};
use crate::volume::Volume;
use i30_core::{AttributeType, FileRecord, I30Error, MftRef, FILE_ROOT};
use log::{debug, error, trace};

/// What a directory entry points at, as far as the FILE_NAME key can
/// tell without opening the target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentKind {
    Directory,
    Regular,
    Unknown,
}

/// One enumerated directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub reference: MftRef,
    pub kind: DirentKind,
}

/// Enumerates a directory from `*pos`, handing each entry to `emit`.
///
/// `emit` returns `false` to stop; the declined entry is offered again
/// on the next call because `*pos` still points at it. Positions 0 and
/// 1 are the synthetic "." and ".." entries, positions below the MFT
/// record size address the index root, and everything above addresses
/// the index allocation stream. Entries come out in index page order,
/// not sorted.
pub fn read_dir<F>(
    vol: &mut Volume,
    dir: &FileRecord,
    pos: &mut u64,
    mut emit: F,
) -> Result<(), I30Error>
where
    F: FnMut(&DirEntry) -> bool,
{
    if !dir.is_directory() {
        return Err(I30Error::NotADirectory);
    }
    let record_size = vol.params().mft_record_size as u64;
    let alloc_size = vol
        .services()
        .attribute_size(dir.number, AttributeType::IndexAllocation, INDEX_STREAM_NAME)?
        .unwrap_or(0);
    trace!(
        "read_dir of directory {} at position {:#x}",
        dir.number,
        *pos
    );

    // End of directory already reached; repeated calls stay there.
    if *pos >= alloc_size + record_size {
        return Ok(());
    }

    if *pos == 0 {
        let dot = DirEntry {
            name: ".".to_string(),
            reference: dir.reference(),
            kind: DirentKind::Directory,
        };
        if !emit(&dot) {
            return Ok(());
        }
        *pos += 1;
    }
    if *pos == 1 {
        let dotdot = DirEntry {
            name: "..".to_string(),
            reference: parent_reference(vol, dir)?,
            kind: DirentKind::Directory,
        };
        if !emit(&dotdot) {
            return Ok(());
        }
        *pos += 1;
    }

    let root = read_index_root(vol, dir.number)?;
    let block_size = root.index_block_size();

    if *pos < record_size {
        let resume = *pos;
        let node = IndexNode::Root(root);
        for entry in node.entries() {
            let entry = entry?;
            if entry.is_last() {
                break;
            }
            if (entry.offset() as u64) < resume {
                continue;
            }
            // Position moves to the entry before it is offered, even
            // when a filter ends up swallowing it.
            *pos = entry.offset() as u64;
            if !offer(&entry, &mut emit)? {
                return Ok(());
            }
        }
        if alloc_size == 0 {
            *pos = record_size;
            debug!("end of directory {}, position {:#x}", dir.number, *pos);
            return Ok(());
        }
        *pos = record_size;
    }

    let mut bitmap = IndexBitmap::open(vol, dir.number)?;
    let ia_pos = *pos - record_size;
    let mut block_no = ia_pos / block_size as u64;
    if block_no >= bitmap.block_capacity() {
        error!(
            "enumeration position {:#x} beyond the index bitmap of directory {}",
            *pos, dir.number
        );
        return Err(I30Error::Corrupt(format!(
            "enumeration position beyond the index bitmap of directory {}",
            dir.number
        )));
    }

    while let Some(in_use) = bitmap.next_in_use(vol, block_no)? {
        block_no = in_use;
        let block_start = block_no * block_size as u64;
        debug!(
            "handling index block {} of directory {}",
            block_no, dir.number
        );
        let block = read_index_block(vol, dir.number, block_start, block_size)?;
        let resume = ia_pos.saturating_sub(block_start);
        let node = IndexNode::Block(block);
        for entry in node.entries() {
            let entry = entry?;
            if entry.is_last() {
                break;
            }
            if (entry.offset() as u64) < resume {
                continue;
            }
            *pos = record_size + block_start + entry.offset() as u64;
            if !offer(&entry, &mut emit)? {
                return Ok(());
            }
        }
        block_no += 1;
    }

    *pos = alloc_size + record_size;
    debug!("end of directory {}, position {:#x}", dir.number, *pos);
    Ok(())
}

/// Collects a whole directory in one pass. Handy for callers that do
/// not page through large directories.
pub fn list_dir(vol: &mut Volume, dir: &FileRecord) -> Result<Vec<DirEntry>, I30Error> {
    let mut entries = Vec::new();
    let mut pos = 0;
    read_dir(vol, dir, &mut pos, |entry| {
        entries.push(entry.clone());
        true
    })?;
    Ok(entries)
}

/// Applies the enumeration filters and hands the entry to the caller.
/// Returns whether the scan should keep going.
fn offer<F>(entry: &IndexEntry<'_>, emit: &mut F) -> Result<bool, I30Error>
where
    F: FnMut(&DirEntry) -> bool,
{
    let key = entry.file_name()?;
    // The root directory indexes itself; that entry never shows up in
    // a listing.
    if entry.file_reference().number() == FILE_ROOT {
        return Ok(true);
    }
    // Short names are an alias of a Win32 name in the same directory,
    // not a separate file.
    if key.namespace == FileNameNamespace::Dos {
        return Ok(true);
    }
    let kind = if key.file_attributes & FILE_ATTR_I30_INDEX_PRESENT != 0 {
        DirentKind::Directory
    } else if key.file_attributes & FILE_ATTR_SYSTEM != 0 {
        DirentKind::Unknown
    } else {
        DirentKind::Regular
    };
    let dirent = DirEntry {
        name: key.name_string(),
        reference: entry.file_reference(),
        kind,
    };
    Ok(emit(&dirent))
}

/// The parent reference recorded in the record's first FILE_NAME
/// attribute, which is what the synthetic ".." entry reports. Every
/// linked record has one, so absence is corruption.
pub fn parent_reference(vol: &mut Volume, dir: &FileRecord) -> Result<MftRef, I30Error> {
    let instances = vol.services().file_name_instances(dir.number)?;
    let (_, value) = instances.into_iter().next().ok_or_else(|| {
        error!("no FILE_NAME attribute in record {}", dir.number);
        I30Error::Corrupt(format!("no FILE_NAME attribute in record {}", dir.number))
    })?;
    Ok(FileName::parse(&value)?.parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{mem_volume, MemVolumeOptions};
    use i30_core::{VolumeServices, RECORD_IS_DIRECTORY};

    fn key_with_attrs(name: &str, namespace: FileNameNamespace, attrs: u32) -> Vec<u8> {
        FileName {
            parent: MftRef::new(FILE_ROOT, 5),
            creation_time: 0,
            modification_time: 0,
            mft_modification_time: 0,
            access_time: 0,
            allocated_size: 0,
            data_size: 0,
            file_attributes: attrs,
            reparse_tag: 0,
            namespace,
            name: name.encode_utf16().collect(),
        }
        .to_bytes()
    }

    fn key_for(name: &str) -> Vec<u8> {
        key_with_attrs(name, FileNameNamespace::Posix, 0)
    }

    fn root_dir(vol: &mut Volume) -> FileRecord {
        vol.open_record(FILE_ROOT).expect("root record")
    }

    #[test]
    fn test_empty_directory_lists_dot_entries() {
        let (mut vol, _mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let dir = root_dir(&mut vol);
        let entries = list_dir(&mut vol, &dir).expect("list");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", ".."]);
        assert_eq!(entries[0].reference, dir.reference());
        // the root is its own parent
        assert_eq!(entries[1].reference, dir.reference());
        assert_eq!(entries[0].kind, DirentKind::Directory);
    }

    #[test]
    fn test_listing_reports_entry_kinds() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        mem.index_insert(FILE_ROOT, &key_for("alpha"), MftRef::new(30, 1))
            .unwrap();
        mem.index_insert(
            FILE_ROOT,
            &key_with_attrs(
                "subdir",
                FileNameNamespace::Posix,
                FILE_ATTR_I30_INDEX_PRESENT,
            ),
            MftRef::new(31, 1),
        )
        .unwrap();
        mem.index_insert(
            FILE_ROOT,
            &key_with_attrs("system", FileNameNamespace::Posix, FILE_ATTR_SYSTEM),
            MftRef::new(32, 1),
        )
        .unwrap();
        let dir = root_dir(&mut vol);
        let entries = list_dir(&mut vol, &dir).expect("list");
        let summary: Vec<(&str, DirentKind)> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                (".", DirentKind::Directory),
                ("..", DirentKind::Directory),
                ("alpha", DirentKind::Regular),
                ("subdir", DirentKind::Directory),
                ("system", DirentKind::Unknown),
            ]
        );
    }

    #[test]
    fn test_dos_only_names_are_suppressed() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        mem.index_insert(
            FILE_ROOT,
            &key_with_attrs("LONGNA~1", FileNameNamespace::Dos, 0),
            MftRef::new(30, 1),
        )
        .unwrap();
        mem.index_insert(
            FILE_ROOT,
            &key_with_attrs("long name.txt", FileNameNamespace::Win32, 0),
            MftRef::new(30, 1),
        )
        .unwrap();
        let dir = root_dir(&mut vol);
        let entries = list_dir(&mut vol, &dir).expect("list");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "long name.txt"]);
    }

    #[test]
    fn test_dotdot_of_subdirectory_points_at_parent() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let mut sub = mem.allocate_record().unwrap();
        sub.flags |= RECORD_IS_DIRECTORY;
        mem.save_record(&sub).unwrap();
        mem.add_attribute(
            sub.number,
            AttributeType::FileName,
            "",
            &key_with_attrs("sub", FileNameNamespace::Posix, FILE_ATTR_I30_INDEX_PRESENT),
        )
        .unwrap();
        mem.add_attribute(
            sub.number,
            AttributeType::IndexRoot,
            INDEX_STREAM_NAME,
            &crate::structures::empty_index_root(4096, 1),
        )
        .unwrap();
        let sub = mem.open_record(sub.number).unwrap();

        let entries = list_dir(&mut vol, &sub).expect("list");
        assert_eq!(entries[0].reference, sub.reference());
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[1].reference.number(), FILE_ROOT);
    }

    #[test]
    fn test_resume_one_entry_per_call() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        for i in 0..5 {
            mem.index_insert(
                FILE_ROOT,
                &key_for(&format!("file-{}", i)),
                MftRef::new(30 + i, 1),
            )
            .unwrap();
        }
        let dir = root_dir(&mut vol);
        let all = list_dir(&mut vol, &dir).expect("list");

        let mut collected: Vec<DirEntry> = Vec::new();
        let mut pos = 0;
        loop {
            let mut taken = 0;
            read_dir(&mut vol, &dir, &mut pos, |entry| {
                if taken == 1 {
                    return false;
                }
                collected.push(entry.clone());
                taken += 1;
                true
            })
            .expect("read_dir");
            if taken == 0 {
                break;
            }
        }
        let names: Vec<String> = collected.iter().map(|e| e.name.clone()).collect();
        let expected: Vec<String> = all.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, expected, "stepped enumeration diverged");
    }

    #[test]
    fn test_end_of_directory_is_idempotent() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        mem.index_insert(FILE_ROOT, &key_for("only"), MftRef::new(30, 1))
            .unwrap();
        let dir = root_dir(&mut vol);
        let mut pos = 0;
        read_dir(&mut vol, &dir, &mut pos, |_| true).expect("first pass");
        let end = pos;
        let mut count = 0;
        read_dir(&mut vol, &dir, &mut pos, |_| {
            count += 1;
            true
        })
        .expect("second pass");
        assert_eq!(count, 0);
        assert_eq!(pos, end);
    }

    #[test]
    fn test_listing_covers_allocation_blocks() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        for i in 0..60u64 {
            mem.index_insert(
                FILE_ROOT,
                &key_for(&format!("entry-{:03}", i)),
                MftRef::new(100 + i, 1),
            )
            .unwrap();
        }
        assert!(mem
            .attribute(FILE_ROOT, AttributeType::IndexAllocation, INDEX_STREAM_NAME)
            .is_some());
        let dir = root_dir(&mut vol);
        let entries = list_dir(&mut vol, &dir).expect("list");
        assert_eq!(entries.len(), 62);
        let mut names: Vec<String> = entries
            .iter()
            .skip(2)
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 60, "entries repeated or missing");
    }

    #[test]
    fn test_read_dir_requires_directory() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let plain = mem.allocate_record().unwrap();
        let mut pos = 0;
        assert!(matches!(
            read_dir(&mut vol, &plain, &mut pos, |_| true),
            Err(I30Error::NotADirectory)
        ));
    }

    #[test]
    fn test_allocation_without_bitmap_is_corrupt() {
        let (mut vol, mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        mem.set_attribute(
            FILE_ROOT,
            AttributeType::IndexAllocation,
            INDEX_STREAM_NAME,
            vec![0u8; 4096],
        );
        mem.remove_attribute_raw(FILE_ROOT, AttributeType::Bitmap, INDEX_STREAM_NAME);
        let dir = root_dir(&mut vol);
        assert!(matches!(
            list_dir(&mut vol, &dir),
            Err(I30Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_missing_index_root_is_corrupt() {
        let (mut vol, mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        mem.remove_attribute_raw(FILE_ROOT, AttributeType::IndexRoot, INDEX_STREAM_NAME);
        let dir = root_dir(&mut vol);
        assert!(matches!(
            list_dir(&mut vol, &dir),
            Err(I30Error::Corrupt(_))
        ));
    }
}
