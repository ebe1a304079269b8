// Name lookup: collated descent through a directory's index
// Case-insensitive scan with case-sensitive tie-break, descending into
// child blocks until an exact match, a candidate, or nothing remains

use crate::collation::{collate_names, encode_name};
use crate::index::{read_index_block, read_index_root, IndexEntry, IndexNode};
use crate::volume::Volume;
use i30_core::{FileRecord, I30Error, MftRef, Vcn};
use log::{debug, error, trace};
use std::cmp::Ordering;

/// Valid trees are a few levels deep; a descent chain longer than this is
/// a corrupt or cyclic child-pointer graph.
const MAX_DESCENT_DEPTH: usize = 16;

enum ScanOutcome {
    Found(MftRef),
    Descend(Vcn),
    Done,
}

/// Looks up `name` in the directory and returns the matching file
/// reference. The name is one component, not a path.
pub fn lookup(vol: &mut Volume, dir: &FileRecord, name: &str) -> Result<MftRef, I30Error> {
    let units = encode_name(name)?;
    lookup_name(vol, dir, &units)
}

/// Looks up an already-encoded name. Callers that keep UTF-16 around
/// (the resolver, the mutation engine) come through here.
pub fn lookup_name(vol: &mut Volume, dir: &FileRecord, name: &[u16]) -> Result<MftRef, I30Error> {
    if name.is_empty() {
        return Err(I30Error::InvalidArgument("empty name".to_string()));
    }
    if !dir.is_directory() {
        return Err(I30Error::NotADirectory);
    }
    trace!(
        "lookup of {} units in directory {}",
        name.len(),
        dir.number
    );

    let root = read_index_root(vol, dir.number)?;
    let block_size = root.index_block_size();
    let mut candidate: Option<MftRef> = None;
    let mut node = IndexNode::Root(root);

    for _ in 0..MAX_DESCENT_DEPTH {
        match scan_node(vol, &node, name, &mut candidate)? {
            ScanOutcome::Found(reference) => return Ok(reference),
            ScanOutcome::Done => {
                return match candidate {
                    Some(reference) => {
                        debug!(
                            "case-insensitive hit {} in directory {}",
                            reference, dir.number
                        );
                        Ok(reference)
                    }
                    None => Err(I30Error::NotFound),
                }
            }
            ScanOutcome::Descend(vcn) => {
                if vcn < 0 {
                    error!(
                        "negative child VCN {:#x} in directory {}",
                        vcn, dir.number
                    );
                    return Err(I30Error::Corrupt(format!(
                        "negative child VCN in directory {}",
                        dir.number
                    )));
                }
                let byte_offset = vcn as u64 * vol.index_vcn_size(block_size) as u64;
                node = IndexNode::Block(read_index_block(
                    vol,
                    dir.number,
                    byte_offset,
                    block_size,
                )?);
            }
        }
    }
    error!(
        "index of directory {} nests deeper than {} levels",
        dir.number, MAX_DESCENT_DEPTH
    );
    Err(I30Error::Corrupt(format!(
        "index of directory {} nests deeper than {} levels",
        dir.number, MAX_DESCENT_DEPTH
    )))
}

fn scan_node(
    vol: &Volume,
    node: &IndexNode,
    name: &[u16],
    candidate: &mut Option<MftRef>,
) -> Result<ScanOutcome, I30Error> {
    let exact_only = vol.is_case_sensitive();
    for entry in node.entries() {
        let entry = entry?;
        if entry.is_last() {
            return stop_at(node, &entry);
        }
        let key = entry.file_name()?;
        match collate_names(name, &key.name, !exact_only, vol.upcase()) {
            Ordering::Less => return stop_at(node, &entry),
            Ordering::Greater => continue,
            Ordering::Equal => {
                if exact_only
                    || collate_names(name, &key.name, false, vol.upcase()) == Ordering::Equal
                {
                    return Ok(ScanOutcome::Found(entry.file_reference()));
                }
                // a later entry may still match exactly; last hit wins
                *candidate = Some(entry.file_reference());
            }
        }
    }
    Err(I30Error::Corrupt(
        "page scan ended without a terminal entry".to_string(),
    ))
}

/// Decides what happens at the entry where scanning stopped: descend into
/// its child block, or end the search at this page.
fn stop_at(node: &IndexNode, entry: &IndexEntry<'_>) -> Result<ScanOutcome, I30Error> {
    match entry.subnode_vcn() {
        Some(_) if !node.has_children() => {
            error!(
                "child pointer in a leaf page at offset {}",
                entry.offset()
            );
            Err(I30Error::Corrupt(format!(
                "child pointer in a leaf page at offset {}",
                entry.offset()
            )))
        }
        Some(vcn) => Ok(ScanOutcome::Descend(vcn)),
        None => Ok(ScanOutcome::Done),
    }
}
