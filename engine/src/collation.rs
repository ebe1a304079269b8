// File-name collation for $I30 indexes
// COLLATION_FILENAME: UTF-16 code-unit comparison, optionally folded
// through the volume upcase table; ties broken by length

use i30_core::{I30Error, MAX_NAME_LEN};
use std::cmp::Ordering;

/// The volume's case-folding table, one folded unit per UTF-16 code unit.
/// Real volumes supply their $UpCase contents; `default_table` is a
/// fallback covering ASCII and the Latin-1 letters.
#[derive(Clone)]
pub struct UpcaseTable {
    map: Vec<u16>,
}

impl UpcaseTable {
    pub fn new(map: Vec<u16>) -> Self {
        UpcaseTable { map }
    }

    pub fn default_table() -> Self {
        let mut map: Vec<u16> = (0..=u16::MAX).collect();
        for c in b'a'..=b'z' {
            map[c as usize] = (c - 0x20) as u16;
        }
        // Latin-1 letters; 0xF7 is the division sign, not a letter
        for c in 0xE0usize..=0xFE {
            if c != 0xF7 {
                map[c] = (c - 0x20) as u16;
            }
        }
        UpcaseTable { map }
    }

    pub fn fold(&self, unit: u16) -> u16 {
        self.map.get(unit as usize).copied().unwrap_or(unit)
    }
}

/// Compares two names under the file-name collation rule.
pub fn collate_names(a: &[u16], b: &[u16], ignore_case: bool, upcase: &UpcaseTable) -> Ordering {
    let common = a.len().min(b.len());
    for i in 0..common {
        let (mut c1, mut c2) = (a[i], b[i]);
        if ignore_case {
            c1 = upcase.fold(c1);
            c2 = upcase.fold(c2);
        }
        match c1.cmp(&c2) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

pub fn names_equal(a: &[u16], b: &[u16], ignore_case: bool, upcase: &UpcaseTable) -> bool {
    a.len() == b.len() && collate_names(a, b, ignore_case, upcase) == Ordering::Equal
}

/// Encodes a caller-supplied name component, enforcing the component
/// length limit before any I/O happens.
pub fn encode_name(name: &str) -> Result<Vec<u16>, I30Error> {
    if name.is_empty() {
        return Err(I30Error::InvalidArgument("empty name".to_string()));
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > MAX_NAME_LEN {
        return Err(I30Error::NameTooLong(units.len(), MAX_NAME_LEN));
    }
    Ok(units)
}

/// Encodes a name that is about to become or stop being an index key.
/// The dot names belong to enumeration, never to the index, and a
/// separator inside a component means the caller skipped path
/// resolution.
pub fn validate_component(name: &str) -> Result<Vec<u16>, I30Error> {
    if name == "." || name == ".." {
        return Err(I30Error::InvalidArgument(format!(
            "'{}' cannot be created or removed",
            name
        )));
    }
    if name.contains('/') {
        return Err(I30Error::InvalidArgument(format!(
            "name '{}' contains a path separator",
            name
        )));
    }
    encode_name(name)
}
