// File and directory creation: allocate a record, attach its resident
// attributes, index the name, publish. Any failure along the way frees
// the half-built record, and a failure after the name was indexed backs
// the index entry out again, so nothing unreachable stays behind.

use crate::collation::validate_component;
use crate::lookup::lookup_name;
use crate::structures::{
    device_payload, empty_index_root, now_filetime, security_descriptor_everyone,
    standard_information, symlink_payload, FileName, FileNameNamespace, FILE_ATTR_I30_INDEX_PRESENT,
    FILE_ATTR_REPARSE_POINT, FILE_ATTR_SYSTEM, INDEX_STREAM_NAME, INTX_BLOCK_DEVICE,
    INTX_CHARACTER_DEVICE,
};
use crate::volume::Volume;
use i30_core::{AttributeType, FileRecord, I30Error, MftRef, RECORD_IS_DIRECTORY};
use log::{debug, error, trace};

/// What to create. Everything that is neither a regular file nor a
/// directory is stored the Interix way: a system-flagged file whose
/// DATA payload encodes the node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Fifo,
    Socket,
    BlockDevice { major: u32, minor: u32 },
    CharDevice { major: u32, minor: u32 },
    Symlink { target: String },
}

impl FileKind {
    fn is_directory(&self) -> bool {
        matches!(self, FileKind::Directory)
    }

    /// Special nodes carry the system attribute on both the record and
    /// its indexed name.
    fn is_special(&self) -> bool {
        !matches!(self, FileKind::Regular | FileKind::Directory)
    }
}

/// Creates `name` in the directory and returns the new file's
/// reference. The new record gets a POSIX-namespace name, one hard
/// link, and the attribute set its kind calls for.
pub fn create(
    vol: &mut Volume,
    dir: &FileRecord,
    name: &str,
    kind: FileKind,
) -> Result<MftRef, I30Error> {
    let units = validate_component(name)?;
    if !dir.is_directory() {
        return Err(I30Error::NotADirectory);
    }
    if dir.file_attributes & FILE_ATTR_REPARSE_POINT != 0 {
        return Err(I30Error::NotSupported(
            "creating inside a reparse point directory".to_string(),
        ));
    }
    if let FileKind::Symlink { target } = &kind {
        if target.is_empty() {
            return Err(I30Error::InvalidArgument(
                "empty symlink target".to_string(),
            ));
        }
    }
    trace!("create '{}' in directory {}", name, dir.number);

    // resolve first, so a taken name collides before anything is
    // allocated; on a case-preserving volume other casings count
    match lookup_name(vol, dir, &units) {
        Ok(_) => return Err(I30Error::AlreadyExists(name.to_string())),
        Err(I30Error::NotFound) => {}
        Err(err) => return Err(err),
    }

    let mut record = vol.services().allocate_record()?;
    match build_record(vol, dir, &mut record, &units, &kind) {
        Ok(reference) => {
            debug!(
                "created '{}' as {} in directory {}",
                name, reference, dir.number
            );
            Ok(reference)
        }
        Err(err) => {
            // scrap the half-built record, then surface the first error
            if let Err(free_err) = vol.services().free_record(record.number) {
                error!(
                    "failed to free record {} while backing out a create: {}",
                    record.number, free_err
                );
            }
            Err(err)
        }
    }
}

fn build_record(
    vol: &mut Volume,
    dir: &FileRecord,
    record: &mut FileRecord,
    name: &[u16],
    kind: &FileKind,
) -> Result<MftRef, I30Error> {
    let now = now_filetime();
    let si_attributes = if kind.is_special() {
        record.file_attributes |= FILE_ATTR_SYSTEM;
        FILE_ATTR_SYSTEM
    } else {
        0
    };
    let si = standard_information(now, si_attributes);
    vol.services()
        .add_attribute(record.number, AttributeType::StandardInformation, "", &si)?;
    vol.services().add_attribute(
        record.number,
        AttributeType::SecurityDescriptor,
        "",
        &security_descriptor_everyone(),
    )?;

    match kind {
        FileKind::Directory => {
            let value = empty_index_root(
                vol.params().index_block_size,
                vol.clusters_per_index_block(),
            );
            vol.services().add_attribute(
                record.number,
                AttributeType::IndexRoot,
                INDEX_STREAM_NAME,
                &value,
            )?;
        }
        FileKind::Regular | FileKind::Fifo => {
            vol.services()
                .add_attribute(record.number, AttributeType::Data, "", &[])?;
        }
        FileKind::Socket => {
            vol.services()
                .add_attribute(record.number, AttributeType::Data, "", &[0u8])?;
        }
        FileKind::BlockDevice { major, minor } => {
            let value = device_payload(INTX_BLOCK_DEVICE, *major, *minor);
            vol.services()
                .add_attribute(record.number, AttributeType::Data, "", &value)?;
        }
        FileKind::CharDevice { major, minor } => {
            let value = device_payload(INTX_CHARACTER_DEVICE, *major, *minor);
            vol.services()
                .add_attribute(record.number, AttributeType::Data, "", &value)?;
        }
        FileKind::Symlink { target } => {
            let value = symlink_payload(target);
            vol.services()
                .add_attribute(record.number, AttributeType::Data, "", &value)?;
        }
    }

    let name_attributes = if kind.is_directory() {
        FILE_ATTR_I30_INDEX_PRESENT
    } else if kind.is_special() {
        FILE_ATTR_SYSTEM
    } else {
        0
    };
    let file_name = FileName {
        parent: dir.reference(),
        creation_time: now,
        modification_time: now,
        mft_modification_time: now,
        access_time: now,
        allocated_size: 0,
        data_size: 0,
        file_attributes: name_attributes,
        reparse_tag: 0,
        namespace: FileNameNamespace::Posix,
        name: name.to_vec(),
    };
    let key = file_name.to_bytes();
    vol.services()
        .add_attribute(record.number, AttributeType::FileName, "", &key)?;

    let reference = MftRef::new(record.number, record.sequence);
    vol.services().index_insert(dir.number, &key, reference)?;

    record.link_count = 1;
    if kind.is_directory() {
        record.flags |= RECORD_IS_DIRECTORY;
    }
    if let Err(err) = vol.services().save_record(record) {
        error!(
            "failed to publish record {} in directory {}: {}",
            record.number, dir.number, err
        );
        if let Err(remove_err) = vol.services().index_remove(dir.number, &key) {
            error!(
                "could not back the new name out of directory {}: {}",
                dir.number, remove_err
            );
            return Err(I30Error::Inconsistent(format!(
                "directory {} indexes a name whose record {} was never published",
                dir.number, record.number
            )));
        }
        return Err(err);
    }
    Ok(reference)
}
