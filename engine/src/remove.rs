// Unlinking: find the FILE_NAME instance the caller means, drop it
// from the index and the record, and keep going while DOS/Win32 name
// pairs tie further instances to the same link. A record whose last
// link goes away is torn down entirely.

use crate::collation::{names_equal, validate_component};
use crate::structures::{
    FileName, FileNameNamespace, EMPTY_INDEX_ROOT_SIZE, INDEX_STREAM_NAME,
};
use crate::volume::Volume;
use i30_core::{AttributeType, FileRecord, I30Error, TimeUpdate};
use log::{debug, error, trace, warn};

/// One FILE_NAME instance pulled off a record, with the raw value kept
/// around because it doubles as the index key.
struct NameInstance {
    instance: u16,
    value: Vec<u8>,
    file_name: FileName,
}

/// Removes the name from the directory and the record behind it. The
/// record is consumed; if links remain the caller can reopen it.
///
/// Deleting either half of a DOS/Win32 name pair deletes both halves.
/// A directory must be empty unless other real links keep it alive.
///
/// Failures before the first index removal leave the name fully in
/// place; anything that fails after it is logged and comes back as
/// [`I30Error::Inconsistent`], never as the raw error.
pub fn delete(
    vol: &mut Volume,
    file: FileRecord,
    dir: &FileRecord,
    name: &str,
) -> Result<(), I30Error> {
    let units = validate_component(name)?;
    if !dir.is_directory() {
        return Err(I30Error::NotADirectory);
    }
    trace!(
        "delete '{}' of record {} in directory {}",
        name,
        file.number,
        dir.number
    );
    let mut file = file;

    // Exact casing first; one forgiving retry for non-POSIX names on
    // case-preserving volumes.
    let mut matched = find_named(vol, file.number, dir.number, &units, true)?;
    if matched.is_none() && !vol.is_case_sensitive() {
        matched = find_named(vol, file.number, dir.number, &units, false)?;
    }
    let named = matched.ok_or(I30Error::NotFound)?;

    // The paired short or long form of the same link goes with it, and
    // the emptiness rule has to know that before either half comes out.
    let partner = match named.file_name.namespace {
        FileNameNamespace::Win32 => {
            find_in_namespace(vol, file.number, dir.number, FileNameNamespace::Dos)?
        }
        FileNameNamespace::Dos => {
            find_in_namespace(vol, file.number, dir.number, FileNameNamespace::Win32)?
        }
        _ => None,
    };
    check_unlinkable(vol, &file, partner.is_some())?;

    // Past the first index removal nothing backs out anymore: a later
    // failure stops the teardown where it is and the caller gets
    // `Inconsistent` instead of the raw error.
    let mut removed = false;
    let mut damage: Option<String> = None;
    for named in [Some(named), partner].into_iter().flatten() {
        match vol.services().index_remove(dir.number, &named.value) {
            Ok(()) => {}
            Err(err) if !removed => return Err(err),
            Err(err) => {
                error!(
                    "failed to remove the paired name '{}' from directory {}: {}",
                    named.file_name.name_string(),
                    dir.number,
                    err
                );
                damage = Some(format!(
                    "directory {} keeps half of a name pair of record {}",
                    dir.number, file.number
                ));
                break;
            }
        }
        removed = true;
        if let Err(err) = vol
            .services()
            .remove_file_name_instance(file.number, named.instance)
        {
            error!(
                "failed to drop name instance {} of record {}: {}",
                named.instance, file.number, err
            );
            damage = Some(format!(
                "record {} still carries a name directory {} no longer indexes",
                file.number, dir.number
            ));
            break;
        }
        if file.link_count == 0 {
            warn!("record {} had no links left to drop", file.number);
        }
        file.link_count = file.link_count.saturating_sub(1);
        if let Err(err) = vol.services().save_record(&file) {
            error!(
                "failed to save record {} after dropping a name: {}",
                file.number, err
            );
            damage = Some(format!(
                "record {} still counts a link directory {} no longer indexes",
                file.number, dir.number
            ));
            break;
        }
        debug!(
            "removed name '{}' from record {}, {} links left",
            named.file_name.name_string(),
            file.number,
            file.link_count
        );
    }

    if damage.is_none() {
        if file.link_count > 0 {
            if let Err(err) = vol
                .services()
                .update_times(file.number, TimeUpdate::ChangeTime)
            {
                warn!("failed to stamp times of record {}: {}", file.number, err);
            }
        } else {
            // last link gone: release the record and everything it holds
            if let Err(err) = vol.services().free_attribute_storage(file.number) {
                error!(
                    "failed to free attribute storage of record {}: {}",
                    file.number, err
                );
                damage = Some(format!(
                    "record {} keeps its storage despite having no links",
                    file.number
                ));
            }
            if let Err(err) = vol.services().free_record(file.number) {
                error!("failed to free record {}: {}", file.number, err);
                damage = Some(format!(
                    "record {} stays allocated despite having no links",
                    file.number
                ));
            }
        }
    }
    if let Err(err) = vol
        .services()
        .update_times(dir.number, TimeUpdate::ModificationAndChangeTime)
    {
        warn!("failed to stamp times of directory {}: {}", dir.number, err);
    }

    match damage {
        Some(message) => Err(I30Error::Inconsistent(message)),
        None => Ok(()),
    }
}

/// Finds the record's FILE_NAME instance carrying `name` under `dir`.
/// POSIX names always match exactly; other namespaces match exactly
/// only when `exact` asks for it.
fn find_named(
    vol: &mut Volume,
    file: u64,
    dir: u64,
    name: &[u16],
    exact: bool,
) -> Result<Option<NameInstance>, I30Error> {
    let instances = vol.services().file_name_instances(file)?;
    for (instance, value) in instances {
        let file_name = FileName::parse(&value)?;
        // same name in another directory is another hard link
        if file_name.parent.number() != dir {
            continue;
        }
        let case_sensitive = file_name.namespace == FileNameNamespace::Posix || exact;
        if names_equal(name, &file_name.name, !case_sensitive, vol.upcase()) {
            return Ok(Some(NameInstance {
                instance,
                value,
                file_name,
            }));
        }
    }
    Ok(None)
}

fn find_in_namespace(
    vol: &mut Volume,
    file: u64,
    dir: u64,
    namespace: FileNameNamespace,
) -> Result<Option<NameInstance>, I30Error> {
    let instances = vol.services().file_name_instances(file)?;
    for (instance, value) in instances {
        let file_name = FileName::parse(&value)?;
        if file_name.parent.number() == dir && file_name.namespace == namespace {
            return Ok(Some(NameInstance {
                instance,
                value,
                file_name,
            }));
        }
    }
    Ok(None)
}

/// A directory can lose a name only while empty, or while other real
/// links keep it reachable. A DOS name and its Win32 partner count as
/// one link, not two, so removing a paired name takes two instances
/// off the record at once.
fn check_unlinkable(
    vol: &mut Volume,
    file: &FileRecord,
    has_pair_partner: bool,
) -> Result<(), I30Error> {
    if !file.is_directory() {
        return Ok(());
    }
    let size = vol
        .services()
        .attribute_size(file.number, AttributeType::IndexRoot, INDEX_STREAM_NAME)?
        .ok_or_else(|| {
            I30Error::Corrupt(format!(
                "directory {} has no INDEX_ROOT attribute",
                file.number
            ))
        })?;
    if size == EMPTY_INDEX_ROOT_SIZE as u64 {
        return Ok(());
    }
    let removing: u16 = if has_pair_partner { 2 } else { 1 };
    if file.link_count <= removing {
        return Err(I30Error::NotEmpty);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::{create, FileKind};
    use crate::lookup::lookup;
    use crate::memory::{mem_volume, FailPoint, MemVolumeOptions};
    use crate::readdir::list_dir;
    use i30_core::{MftRef, VolumeServices, FILE_ROOT};

    fn root_dir(vol: &mut Volume) -> FileRecord {
        vol.open_record(FILE_ROOT).expect("root record")
    }

    fn open(vol: &mut Volume, reference: MftRef) -> FileRecord {
        vol.open_record(reference.number()).expect("open record")
    }

    #[test]
    fn test_delete_regular_file() {
        let (mut vol, mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let keep = create(&mut vol, &root, "keep", FileKind::Regular).unwrap();
        let gone = create(&mut vol, &root, "gone", FileKind::Regular).unwrap();
        let records_before = mem.record_count();

        let file = open(&mut vol, gone);
        delete(&mut vol, file, &root, "gone").expect("delete");

        assert!(matches!(
            lookup(&mut vol, &root, "gone"),
            Err(I30Error::NotFound)
        ));
        assert_eq!(lookup(&mut vol, &root, "keep").unwrap(), keep);
        assert!(matches!(
            vol.open_record(gone.number()),
            Err(I30Error::NotFound)
        ));
        assert_eq!(mem.record_count(), records_before - 1);
        assert_eq!(mem.time_updates(FILE_ROOT), 1, "directory times stamped");
    }

    #[test]
    fn test_delete_keeps_record_while_links_remain() {
        let (mut vol, mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let reference = create(&mut vol, &root, "first", FileKind::Regular).unwrap();
        let mut file = open(&mut vol, reference);
        crate::link::link(&mut vol, &mut file, &root, "second").unwrap();

        delete(&mut vol, file, &root, "first").expect("delete first name");
        let file = open(&mut vol, reference);
        assert_eq!(file.link_count, 1);
        assert_eq!(lookup(&mut vol, &root, "second").unwrap(), reference);
        assert_eq!(
            mem.time_updates(reference.number()),
            1,
            "surviving record gets a change stamp"
        );

        delete(&mut vol, file, &root, "second").expect("delete last name");
        assert!(matches!(
            vol.open_record(reference.number()),
            Err(I30Error::NotFound)
        ));
    }

    #[test]
    fn test_delete_directory_must_be_empty() {
        let (mut vol, _mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let sub_ref = create(&mut vol, &root, "sub", FileKind::Directory).unwrap();
        let sub = open(&mut vol, sub_ref);
        let child = create(&mut vol, &sub, "child", FileKind::Regular).unwrap();

        let sub = open(&mut vol, sub_ref);
        assert!(matches!(
            delete(&mut vol, sub, &root, "sub"),
            Err(I30Error::NotEmpty)
        ));
        assert_eq!(lookup(&mut vol, &root, "sub").unwrap(), sub_ref);

        let sub = open(&mut vol, sub_ref);
        let child_record = open(&mut vol, child);
        delete(&mut vol, child_record, &sub, "child").expect("empty it out");
        let sub = open(&mut vol, sub_ref);
        delete(&mut vol, sub, &root, "sub").expect("delete empty directory");
        assert!(matches!(
            lookup(&mut vol, &root, "sub"),
            Err(I30Error::NotFound)
        ));
    }

    #[test]
    fn test_delete_wrong_name_is_not_found() {
        let (mut vol, _mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let reference = create(&mut vol, &root, "real", FileKind::Regular).unwrap();
        let file = open(&mut vol, reference);
        assert!(matches!(
            delete(&mut vol, file, &root, "other"),
            Err(I30Error::NotFound)
        ));
        assert_eq!(lookup(&mut vol, &root, "real").unwrap(), reference);
    }

    #[test]
    fn test_delete_posix_names_match_exactly() {
        let (mut vol, _mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let reference = create(&mut vol, &root, "File", FileKind::Regular).unwrap();
        let file = open(&mut vol, reference);
        // POSIX instances never take the case-insensitive retry
        assert!(matches!(
            delete(&mut vol, file, &root, "FILE"),
            Err(I30Error::NotFound)
        ));
        let file = open(&mut vol, reference);
        delete(&mut vol, file, &root, "File").expect("exact casing");
    }

    fn add_name(
        vol: &mut Volume,
        mem: &mut crate::memory::MemServices,
        file: MftRef,
        name: &str,
        namespace: FileNameNamespace,
    ) {
        let file_name = FileName {
            parent: MftRef::new(FILE_ROOT, 5),
            creation_time: 0,
            modification_time: 0,
            mft_modification_time: 0,
            access_time: 0,
            allocated_size: 0,
            data_size: 0,
            file_attributes: 0,
            reparse_tag: 0,
            namespace,
            name: name.encode_utf16().collect(),
        };
        let key = file_name.to_bytes();
        mem.index_insert(FILE_ROOT, &key, file).unwrap();
        mem.add_attribute(file.number(), AttributeType::FileName, "", &key)
            .unwrap();
        let mut record = vol.open_record(file.number()).unwrap();
        record.link_count += 1;
        mem.save_record(&record).unwrap();
    }

    /// A record carrying a DOS/Win32 name pair under the root, the way
    /// a short-name-generating driver would have written it.
    fn paired_file(vol: &mut Volume, mem: &mut crate::memory::MemServices) -> MftRef {
        let record = mem.allocate_record().unwrap();
        let reference = record.reference();
        add_name(vol, mem, reference, "LONGNA~1", FileNameNamespace::Dos);
        add_name(vol, mem, reference, "long name.txt", FileNameNamespace::Win32);
        reference
    }

    #[test]
    fn test_delete_win32_name_removes_dos_partner() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let reference = paired_file(&mut vol, &mut mem);
        let root = root_dir(&mut vol);
        assert_eq!(open(&mut vol, reference).link_count, 2);

        let file = open(&mut vol, reference);
        delete(&mut vol, file, &root, "long name.txt").expect("delete pair");

        assert!(matches!(
            lookup(&mut vol, &root, "long name.txt"),
            Err(I30Error::NotFound)
        ));
        assert!(matches!(
            lookup(&mut vol, &root, "LONGNA~1"),
            Err(I30Error::NotFound)
        ));
        assert!(matches!(
            vol.open_record(reference.number()),
            Err(I30Error::NotFound)
        ));
    }

    #[test]
    fn test_delete_dos_name_removes_win32_partner() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let reference = paired_file(&mut vol, &mut mem);
        let root = root_dir(&mut vol);

        let file = open(&mut vol, reference);
        delete(&mut vol, file, &root, "LONGNA~1").expect("delete pair");
        assert!(matches!(
            lookup(&mut vol, &root, "long name.txt"),
            Err(I30Error::NotFound)
        ));
        assert!(matches!(
            vol.open_record(reference.number()),
            Err(I30Error::NotFound)
        ));
    }

    #[test]
    fn test_delete_win32_name_by_other_case() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let reference = paired_file(&mut vol, &mut mem);
        let root = root_dir(&mut vol);

        let file = open(&mut vol, reference);
        delete(&mut vol, file, &root, "LONG NAME.TXT").expect("case-insensitive retry");
        assert!(matches!(
            vol.open_record(reference.number()),
            Err(I30Error::NotFound)
        ));
    }

    #[test]
    fn test_delete_index_failure_leaves_name_alone() {
        let (mut vol, mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let reference = create(&mut vol, &root, "file", FileKind::Regular).unwrap();

        mem.inject_failure(FailPoint::IndexRemove);
        let file = open(&mut vol, reference);
        assert!(matches!(
            delete(&mut vol, file, &root, "file"),
            Err(I30Error::IoError(_))
        ));
        // nothing was touched yet, the name survives
        assert_eq!(lookup(&mut vol, &root, "file").unwrap(), reference);
        assert_eq!(open(&mut vol, reference).link_count, 1);
    }

    #[test]
    fn test_delete_instance_failure_reports_inconsistency() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let reference = create(&mut vol, &root, "file", FileKind::Regular).unwrap();

        mem.inject_failure(FailPoint::RemoveFileNameInstance);
        let file = open(&mut vol, reference);
        assert!(matches!(
            delete(&mut vol, file, &root, "file"),
            Err(I30Error::Inconsistent(_))
        ));
        // the index entry is gone while the record still carries the name
        assert!(matches!(
            lookup(&mut vol, &root, "file"),
            Err(I30Error::NotFound)
        ));
        let file = open(&mut vol, reference);
        assert_eq!(file.link_count, 1);
        assert_eq!(mem.file_name_instances(reference.number()).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_save_failure_reports_inconsistency() {
        let (mut vol, mut mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let reference = create(&mut vol, &root, "first", FileKind::Regular).unwrap();
        let mut file = open(&mut vol, reference);
        crate::link::link(&mut vol, &mut file, &root, "second").unwrap();

        mem.inject_failure(FailPoint::SaveRecord);
        let file = open(&mut vol, reference);
        assert!(matches!(
            delete(&mut vol, file, &root, "first"),
            Err(I30Error::Inconsistent(_))
        ));
        assert!(matches!(
            lookup(&mut vol, &root, "first"),
            Err(I30Error::NotFound)
        ));
        assert_eq!(lookup(&mut vol, &root, "second").unwrap(), reference);
        // the stale link count is exactly the inconsistency reported
        let file = open(&mut vol, reference);
        assert_eq!(file.link_count, 2);
        assert_eq!(mem.file_name_instances(reference.number()).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_teardown_failure_reports_inconsistency() {
        let (mut vol, mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let reference = create(&mut vol, &root, "file", FileKind::Regular).unwrap();

        mem.inject_failure(FailPoint::FreeRecord);
        let file = open(&mut vol, reference);
        assert!(matches!(
            delete(&mut vol, file, &root, "file"),
            Err(I30Error::Inconsistent(_))
        ));
        // the name is gone even though the record could not be freed
        assert!(matches!(
            lookup(&mut vol, &root, "file"),
            Err(I30Error::NotFound)
        ));
        let names: Vec<String> = list_dir(&mut vol, &root)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(!names.contains(&"file".to_string()));
    }
}
