// Slash-separated path resolution: one index lookup per component

use crate::collation::encode_name;
use crate::lookup::lookup_name;
use crate::volume::Volume;
use i30_core::{FileRecord, I30Error, MftRef, FILE_ROOT};
use log::trace;

/// Resolves a slash-separated path to the reference of its final
/// component, starting from `start` or from the root directory when
/// `start` is `None`.
///
/// Repeated and trailing separators are harmless, and an empty path
/// resolves to the starting directory itself. Each component is length
/// checked before any index is touched.
pub fn resolve_path(
    vol: &mut Volume,
    start: Option<&FileRecord>,
    path: &str,
) -> Result<MftRef, I30Error> {
    trace!("resolving path '{}'", path);
    let mut current = match start {
        Some(dir) => *dir,
        None => vol.open_record(FILE_ROOT)?,
    };
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let units = encode_name(segment)?;
        let reference = lookup_name(vol, &current, &units)?;
        current = vol.open_record(reference.number())?;
    }
    Ok(current.reference())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::{create, FileKind};
    use crate::memory::{mem_volume, MemVolumeOptions};

    fn root_dir(vol: &mut Volume) -> FileRecord {
        vol.open_record(FILE_ROOT).expect("root record")
    }

    #[test]
    fn test_empty_path_resolves_to_start() {
        let (mut vol, _mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        assert_eq!(resolve_path(&mut vol, None, "").unwrap(), root.reference());
        assert_eq!(resolve_path(&mut vol, None, "/").unwrap(), root.reference());
        assert_eq!(
            resolve_path(&mut vol, Some(&root), "").unwrap(),
            root.reference()
        );
    }

    #[test]
    fn test_resolve_nested_components() {
        let (mut vol, _mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        let sub_ref = create(&mut vol, &root, "sub", FileKind::Directory).expect("mkdir");
        let sub = vol.open_record(sub_ref.number()).unwrap();
        let leaf_ref = create(&mut vol, &sub, "leaf.txt", FileKind::Regular).expect("create");

        assert_eq!(resolve_path(&mut vol, None, "sub").unwrap(), sub_ref);
        assert_eq!(
            resolve_path(&mut vol, None, "sub/leaf.txt").unwrap(),
            leaf_ref
        );
        // separators collapse
        assert_eq!(
            resolve_path(&mut vol, None, "//sub///leaf.txt/").unwrap(),
            leaf_ref
        );
        // relative to an explicit starting directory
        assert_eq!(
            resolve_path(&mut vol, Some(&sub), "leaf.txt").unwrap(),
            leaf_ref
        );
    }

    #[test]
    fn test_resolve_missing_component() {
        let (mut vol, _mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        create(&mut vol, &root, "sub", FileKind::Directory).expect("mkdir");
        assert!(matches!(
            resolve_path(&mut vol, None, "sub/absent"),
            Err(I30Error::NotFound)
        ));
        assert!(matches!(
            resolve_path(&mut vol, None, "absent/leaf"),
            Err(I30Error::NotFound)
        ));
    }

    #[test]
    fn test_resolve_through_regular_file_fails() {
        let (mut vol, _mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        create(&mut vol, &root, "plain", FileKind::Regular).expect("create");
        assert!(matches!(
            resolve_path(&mut vol, None, "plain/below"),
            Err(I30Error::NotADirectory)
        ));
    }

    #[test]
    fn test_resolve_rejects_oversized_component() {
        let (mut vol, _mem) = mem_volume(MemVolumeOptions::default()).unwrap();
        let root = root_dir(&mut vol);
        create(&mut vol, &root, "sub", FileKind::Directory).expect("mkdir");
        let long = "x".repeat(300);
        assert!(matches!(
            resolve_path(&mut vol, None, &format!("sub/{}", long)),
            Err(I30Error::NameTooLong(300, 255))
        ));
    }
}
