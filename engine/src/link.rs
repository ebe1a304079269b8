// Hard links: index the new name first, attach it to the record, then
// save the bumped link count. A failure at any step unwinds the earlier
// ones in reverse; when the unwind itself fails the two structures
// disagree and the caller is told so.

use crate::collation::validate_component;
use crate::structures::{
    standard_information_times, FileName, FileNameNamespace, FILE_ATTR_I30_INDEX_PRESENT,
    FILE_ATTR_REPARSE_POINT,
};
use crate::volume::Volume;
use i30_core::{AttributeType, FileRecord, I30Error};
use log::{debug, error, trace};

/// Gives the file a second name in `dir`. Directories cannot be hard
/// linked; rename moves them through [`link_for_rename`] instead.
pub fn link(
    vol: &mut Volume,
    file: &mut FileRecord,
    dir: &FileRecord,
    name: &str,
) -> Result<(), I30Error> {
    if file.is_directory() {
        return Err(I30Error::IsADirectory);
    }
    link_impl(vol, file, dir, name)
}

/// Like [`link`] but also accepts directories. Rename gives a
/// directory its new name before dropping the old one, so the
/// directory briefly carries two links. Nothing else should.
pub fn link_for_rename(
    vol: &mut Volume,
    file: &mut FileRecord,
    dir: &FileRecord,
    name: &str,
) -> Result<(), I30Error> {
    link_impl(vol, file, dir, name)
}

fn link_impl(
    vol: &mut Volume,
    file: &mut FileRecord,
    dir: &FileRecord,
    name: &str,
) -> Result<(), I30Error> {
    let units = validate_component(name)?;
    if file.number == dir.number {
        return Err(I30Error::InvalidArgument(
            "cannot link a record to a name inside itself".to_string(),
        ));
    }
    if !dir.is_directory() {
        return Err(I30Error::NotADirectory);
    }
    if file.file_attributes & FILE_ATTR_REPARSE_POINT != 0 {
        return Err(I30Error::NotSupported(
            "linking a reparse point".to_string(),
        ));
    }
    trace!(
        "link record {} as '{}' in directory {}",
        file.number,
        name,
        dir.number
    );

    // The new name repeats the record's own times and sizes.
    let si = match vol
        .services()
        .read_attribute(file.number, AttributeType::StandardInformation, "")
    {
        Ok(value) => value,
        Err(I30Error::NotFound) => {
            return Err(I30Error::Corrupt(format!(
                "record {} has no STANDARD_INFORMATION attribute",
                file.number
            )))
        }
        Err(err) => return Err(err),
    };
    let [creation, data_change, record_change, access] = standard_information_times(&si)?;

    let mut attributes = file.file_attributes;
    if file.is_directory() {
        attributes |= FILE_ATTR_I30_INDEX_PRESENT;
    }
    let file_name = FileName {
        parent: dir.reference(),
        creation_time: creation,
        modification_time: data_change,
        mft_modification_time: record_change,
        access_time: access,
        allocated_size: file.allocated_size,
        data_size: file.data_size,
        file_attributes: attributes,
        reparse_tag: 0,
        namespace: FileNameNamespace::Posix,
        name: units,
    };
    let key = file_name.to_bytes();

    vol.services()
        .index_insert(dir.number, &key, file.reference())?;
    if let Err(err) = vol
        .services()
        .add_attribute(file.number, AttributeType::FileName, "", &key)
    {
        error!(
            "failed to attach name '{}' to record {}: {}",
            name, file.number, err
        );
        if let Err(remove_err) = vol.services().index_remove(dir.number, &key) {
            error!(
                "could not back the new name out of directory {}: {}",
                dir.number, remove_err
            );
            return Err(I30Error::Inconsistent(format!(
                "directory {} indexes a name record {} does not carry",
                dir.number, file.number
            )));
        }
        return Err(err);
    }

    file.link_count += 1;
    if let Err(err) = vol.services().save_record(file) {
        file.link_count -= 1;
        error!(
            "failed to save record {} with its new link count: {}",
            file.number, err
        );
        if let Err(rollback_err) = unlink_new_name(vol, file.number, dir.number, &key) {
            error!(
                "could not back the new name '{}' out again: {}",
                name, rollback_err
            );
            return Err(I30Error::Inconsistent(format!(
                "record {} carries a name in directory {} its link count ignores",
                file.number, dir.number
            )));
        }
        return Err(err);
    }
    debug!(
        "linked record {} as '{}' in directory {}, {} links",
        file.number, name, dir.number, file.link_count
    );
    Ok(())
}

/// Backs a freshly attached name out of the record and the directory,
/// in the reverse of the order `link_impl` put it in.
fn unlink_new_name(vol: &mut Volume, file: u64, dir: u64, key: &[u8]) -> Result<(), I30Error> {
    let instances = vol.services().file_name_instances(file)?;
    let instance = instances
        .into_iter()
        .find(|(_, value)| value.as_slice() == key)
        .map(|(instance, _)| instance)
        .ok_or_else(|| {
            I30Error::Corrupt(format!("record {} lost the name it just gained", file))
        })?;
    vol.services().remove_file_name_instance(file, instance)?;
    vol.services().index_remove(dir, key)
}
