// Exercises the directory index engine end to end on the in-memory
// backend: create, lookup, paged enumeration, growth past the resident
// root, rename, and teardown back to an empty directory.

use i30_core::{AttributeType, FILE_ROOT};
use i30_engine::structures::INDEX_STREAM_NAME;
use i30_engine::{
    create, delete, link_for_rename, list_dir, lookup, mem_volume, read_dir, resolve_path,
    FileKind, MemVolumeOptions,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Directory Index Engine Test Program");
    println!("===================================");

    let (mut vol, mem) = mem_volume(MemVolumeOptions::default())?;
    println!("\n1. Created in-memory volume");
    println!("   MFT record size: {} bytes", vol.params().mft_record_size);
    println!(
        "   Index block size: {} bytes",
        vol.params().index_block_size
    );
    println!("   ✓ Volume ready");

    println!("\n2. Building a small tree...");
    let root = vol.open_record(FILE_ROOT)?;
    let docs = create(&mut vol, &root, "docs", FileKind::Directory)?;
    let docs_rec = vol.open_record(docs.number())?;
    create(&mut vol, &docs_rec, "guide.md", FileKind::Regular)?;
    create(&mut vol, &root, "notes.txt", FileKind::Regular)?;
    create(
        &mut vol,
        &root,
        "shortcut",
        FileKind::Symlink {
            target: "docs/guide.md".to_string(),
        },
    )?;
    let found = resolve_path(&mut vol, None, "docs/guide.md")?;
    println!("   docs/guide.md -> record {}", found.number());
    println!("   ✓ Lookup and path resolution agree");

    println!("\n3. Enumerating the root in pages of 2...");
    let mut pos = 0u64;
    loop {
        let mut page: Vec<String> = Vec::new();
        read_dir(&mut vol, &root, &mut pos, |entry| {
            if page.len() == 2 {
                return false;
            }
            page.push(entry.name.clone());
            true
        })?;
        if page.is_empty() {
            break;
        }
        println!("   page: {}", page.join(", "));
    }
    println!("   ✓ Paged enumeration reached the end");

    println!("\n4. Growing docs past the resident root...");
    for i in 0..150 {
        create(
            &mut vol,
            &docs_rec,
            &format!("file-{:03}", i),
            FileKind::Regular,
        )?;
    }
    let alloc = mem
        .attribute(docs.number(), AttributeType::IndexAllocation, INDEX_STREAM_NAME)
        .ok_or("docs has no INDEX_ALLOCATION")?;
    let bitmap = mem
        .attribute(docs.number(), AttributeType::Bitmap, INDEX_STREAM_NAME)
        .ok_or("docs has no index bitmap")?;
    let block_size = vol.params().index_block_size as usize;
    println!(
        "   allocation: {} bytes ({} blocks), bitmap: {} bytes",
        alloc.len(),
        alloc.len() / block_size,
        bitmap.len()
    );
    let deep = resolve_path(&mut vol, None, "docs/file-123")?;
    println!("   docs/file-123 -> record {}", deep.number());
    let listed = list_dir(&mut vol, &docs_rec)?;
    println!("   docs now lists {} entries", listed.len());
    println!("   ✓ Index spilled into allocation blocks");

    println!("\n5. Renaming notes.txt to journal.txt...");
    let notes = lookup(&mut vol, &root, "notes.txt")?;
    let mut notes_rec = vol.open_record(notes.number())?;
    link_for_rename(&mut vol, &mut notes_rec, &root, "journal.txt")?;
    delete(&mut vol, notes_rec, &root, "notes.txt")?;
    let renamed = resolve_path(&mut vol, None, "journal.txt")?;
    println!("   journal.txt -> record {}", renamed.number());
    println!("   ✓ Rename left a single live name");

    println!("\n6. Emptying docs again...");
    for i in 0..150 {
        let name = format!("file-{:03}", i);
        let reference = lookup(&mut vol, &docs_rec, &name)?;
        let record = vol.open_record(reference.number())?;
        delete(&mut vol, record, &docs_rec, &name)?;
    }
    let guide = lookup(&mut vol, &docs_rec, "guide.md")?;
    let record = vol.open_record(guide.number())?;
    delete(&mut vol, record, &docs_rec, "guide.md")?;
    if mem
        .attribute(docs.number(), AttributeType::IndexAllocation, INDEX_STREAM_NAME)
        .is_none()
    {
        println!("   ✓ Directory shrank back to a resident index");
    } else {
        println!("   ✗ Allocation stream still present");
    }

    println!("\n7. Tearing the tree down...");
    for name in ["docs", "journal.txt", "shortcut"] {
        let reference = lookup(&mut vol, &root, name)?;
        let record = vol.open_record(reference.number())?;
        delete(&mut vol, record, &root, name)?;
    }
    println!("   records still allocated: {}", mem.record_count());
    if mem.record_count() == 1 {
        println!("   ✓ Only the root record remains");
    } else {
        println!("   ✗ Records leaked");
    }

    println!("\nAll index engine checks passed!");
    Ok(())
}
