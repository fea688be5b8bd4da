//! KVDB: the process-wide typed key/value store shared by VMs and catbus.
//!
//! Grounded on `original_source/src/sapphireos/kvdb.h`: a flat table
//! scanned linearly by 32-bit hash, an 8-bit tag mask for grouped delete
//! (one VM's published variables share a tag), and an optional notifier
//! invoked after a successful `set`.

pub mod types;

use log::{debug, trace};

use crate::error::KvdbStatus;
pub use types::{type_convert, CatbusType, CATBUS_MAX_DATA};

/// Maximum number of live entries. The original firmware sizes this per
/// board; a fixed compile-time cap keeps the table allocation-free.
pub const MAX_ENTRIES: usize = 64;

#[cfg(feature = "kvdb-names")]
pub const MAX_NAME_LEN: usize = 32;

/// Per-entry notifier, expressed as a small tagged enum instead of a bare
/// function pointer living inside the entry struct (spec.md §9 design note).
#[derive(Clone, Copy)]
pub enum Notifier {
    None,
    /// Emit a debug log line with the hash and type on every successful set.
    Log,
    /// Host-supplied callback.
    Callback(fn(hash: u32, ty: CatbusType, data: &[u8])),
}

#[derive(Clone, Copy)]
struct Entry {
    hash: u32,
    ty: CatbusType,
    count: u16,
    tag_mask: u8,
    notifier: Notifier,
    data: [u8; CATBUS_MAX_DATA],
    #[cfg(feature = "kvdb-names")]
    name: [u8; MAX_NAME_LEN],
}

impl Entry {
    fn elem_size(&self) -> usize {
        self.ty.size().unwrap_or(0)
    }
}

pub struct Kvdb {
    entries: [Option<Entry>; MAX_ENTRIES],
    len: usize,
}

impl Kvdb {
    pub fn new() -> Self {
        const NONE: Option<Entry> = Option::None;
        Kvdb { entries: [NONE; MAX_ENTRIES], len: 0 }
    }

    pub fn count(&self) -> usize {
        self.len
    }

    fn find(&self, hash: u32) -> Option<usize> {
        self.entries.iter().position(|e| matches!(e, Some(e) if e.hash == hash))
    }

    /// Add a new entry (fails with `HashConflict` if the hash is already
    /// present; the original `kvdb_i8_add` is the "define a new key" path
    /// distinct from `set`, which only mutates an existing one).
    pub fn add(
        &mut self,
        hash: u32,
        ty: CatbusType,
        count: u16,
        default: &[u8],
        tag_mask: u8,
    ) -> Result<(), KvdbStatus> {
        if self.find(hash).is_some() {
            return Err(KvdbStatus::HashConflict);
        }
        let elem_size = ty.size().ok_or(KvdbStatus::InvalidHash)?;
        let total = elem_size * count as usize;
        if total > CATBUS_MAX_DATA {
            return Err(KvdbStatus::DataTooLarge);
        }
        let slot = self.entries.iter().position(|e| e.is_none()).ok_or(KvdbStatus::NotEnoughSpace)?;

        let mut data = [0u8; CATBUS_MAX_DATA];
        let n = default.len().min(total);
        data[..n].copy_from_slice(&default[..n]);

        self.entries[slot] = Some(Entry {
            hash,
            ty,
            count,
            tag_mask,
            notifier: Notifier::None,
            data,
            #[cfg(feature = "kvdb-names")]
            name: [0u8; MAX_NAME_LEN],
        });
        self.len += 1;
        debug!("kvdb add hash={:#x} type={:?} count={}", hash, ty, count);
        Ok(())
    }

    /// Overwrite an existing entry's whole value; `type` must match so a
    /// mismatched writer can't silently reinterpret bytes (the caller is
    /// expected to route cross-type sets through `type_convert`).
    pub fn set(&mut self, hash: u32, ty: CatbusType, data: &[u8]) -> Result<(), KvdbStatus> {
        let idx = self.find(hash).ok_or(KvdbStatus::NotFound)?;
        let entry = self.entries[idx].as_mut().unwrap();
        if entry.ty != ty {
            return Err(KvdbStatus::LengthMismatch);
        }
        let total = entry.elem_size() * entry.count as usize;
        if data.len() > total {
            return Err(KvdbStatus::LengthMismatch);
        }
        entry.data[..data.len()].copy_from_slice(data);
        let notifier = entry.notifier;
        let data_copy_len = total;
        self.notify(idx, notifier, data_copy_len);
        Ok(())
    }

    fn notify(&self, idx: usize, notifier: Notifier, len: usize) {
        let entry = self.entries[idx].as_ref().unwrap();
        match notifier {
            Notifier::None => {}
            Notifier::Log => trace!("kvdb notify hash={:#x} type={:?}", entry.hash, entry.ty),
            Notifier::Callback(f) => f(entry.hash, entry.ty, &entry.data[..len]),
        }
    }

    pub fn get(&self, hash: u32, out: &mut [u8]) -> Result<usize, KvdbStatus> {
        let idx = self.find(hash).ok_or(KvdbStatus::NotFound)?;
        let entry = self.entries[idx].as_ref().unwrap();
        let total = entry.elem_size() * entry.count as usize;
        if out.len() < total {
            return Err(KvdbStatus::LengthMismatch);
        }
        out[..total].copy_from_slice(&entry.data[..total]);
        Ok(total)
    }

    pub fn array_get(&self, hash: u32, index: u16, out: &mut [u8]) -> Result<usize, KvdbStatus> {
        let idx = self.find(hash).ok_or(KvdbStatus::NotFound)?;
        let entry = self.entries[idx].as_ref().unwrap();
        let elem = entry.elem_size();
        if index >= entry.count {
            return Err(KvdbStatus::LengthMismatch);
        }
        let start = elem * index as usize;
        out[..elem].copy_from_slice(&entry.data[start..start + elem]);
        Ok(elem)
    }

    pub fn array_set(&mut self, hash: u32, index: u16, data: &[u8]) -> Result<(), KvdbStatus> {
        let idx = self.find(hash).ok_or(KvdbStatus::NotFound)?;
        let (elem, notifier) = {
            let entry = self.entries[idx].as_ref().unwrap();
            (entry.elem_size(), entry.notifier)
        };
        {
            let entry = self.entries[idx].as_mut().unwrap();
            if index >= entry.count {
                return Err(KvdbStatus::LengthMismatch);
            }
            let start = elem * index as usize;
            entry.data[start..start + elem].copy_from_slice(&data[..elem]);
        }
        self.notify(idx, notifier, elem);
        Ok(())
    }

    pub fn set_notifier(&mut self, hash: u32, notifier: Notifier) -> Result<(), KvdbStatus> {
        let idx = self.find(hash).ok_or(KvdbStatus::NotFound)?;
        self.entries[idx].as_mut().unwrap().notifier = notifier;
        Ok(())
    }

    pub fn set_tag(&mut self, hash: u32, tag: u8) -> Result<(), KvdbStatus> {
        let idx = self.find(hash).ok_or(KvdbStatus::NotFound)?;
        self.entries[idx].as_mut().unwrap().tag_mask |= 1 << tag;
        Ok(())
    }

    pub fn delete(&mut self, hash: u32) {
        if let Some(idx) = self.find(hash) {
            self.entries[idx] = None;
            self.len -= 1;
        }
    }

    /// Delete every entry whose tag mask includes `tag` — used when a VM
    /// unloads and its published variables must be released together.
    pub fn clear_tag(&mut self, tag: u8) {
        let bit = 1u8 << tag;
        let mut removed = 0usize;
        for e in self.entries.iter_mut() {
            if let Some(entry) = e {
                if entry.tag_mask & bit != 0 {
                    *e = None;
                    removed += 1;
                }
            }
        }
        self.len -= removed;
        debug!("kvdb clear_tag({}) removed {} entries", tag, removed);
    }

    pub fn meta(&self, hash: u32) -> Option<(CatbusType, u16)> {
        self.find(hash).map(|i| {
            let e = self.entries[i].as_ref().unwrap();
            (e.ty, e.count)
        })
    }

    /// Record `name` against an existing entry for debug/introspection
    /// tooling. Compiled out entirely when `kvdb-names` is disabled, since
    /// the original firmware only carries names in debug builds.
    #[cfg(feature = "kvdb-names")]
    pub fn set_name(&mut self, hash: u32, name: &str) -> Result<(), KvdbStatus> {
        let idx = self.find(hash).ok_or(KvdbStatus::NotFound)?;
        let entry = self.entries[idx].as_mut().unwrap();
        let bytes = name.as_bytes();
        let n = bytes.len().min(MAX_NAME_LEN);
        entry.name = [0u8; MAX_NAME_LEN];
        entry.name[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    #[cfg(feature = "kvdb-names")]
    pub fn name_of(&self, hash: u32) -> Option<&str> {
        let idx = self.find(hash)?;
        let entry = self.entries[idx].as_ref().unwrap();
        let end = entry.name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        core::str::from_utf8(&entry.name[..end]).ok()
    }
}

impl Default for Kvdb {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1a 32-bit hash, used the same way the original firmware hashes
/// variable/key names into `catbus_hash_t32`.
pub fn hash_name(name: &str) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for b in name.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_set_get_round_trip() {
        let mut db = Kvdb::new();
        let hash = hash_name("x");
        db.add(hash, CatbusType::Int32, 1, &0i32.to_le_bytes(), 0).unwrap();
        db.set(hash, CatbusType::Int32, &7i32.to_le_bytes()).unwrap();
        let mut out = [0u8; 4];
        db.get(hash, &mut out).unwrap();
        assert_eq!(i32::from_le_bytes(out), 7);
    }

    #[test]
    fn duplicate_add_is_a_conflict() {
        let mut db = Kvdb::new();
        let hash = hash_name("dup");
        db.add(hash, CatbusType::Bool, 1, &[0], 0).unwrap();
        assert_eq!(db.add(hash, CatbusType::Bool, 1, &[0], 0), Err(KvdbStatus::HashConflict));
    }

    #[test]
    fn clear_tag_removes_only_matching_entries() {
        let mut db = Kvdb::new();
        let a = hash_name("a");
        let b = hash_name("b");
        db.add(a, CatbusType::Bool, 1, &[0], 0).unwrap();
        db.add(b, CatbusType::Bool, 1, &[0], 0).unwrap();
        db.set_tag(a, 3).unwrap();
        db.clear_tag(3);
        assert_eq!(db.count(), 1);
        let mut out = [0u8; 1];
        assert!(db.get(a, &mut out).is_err());
        assert!(db.get(b, &mut out).is_ok());
    }

    #[test]
    #[cfg(feature = "kvdb-names")]
    fn set_name_and_look_it_up() {
        let mut db = Kvdb::new();
        let hash = hash_name("brightness");
        db.add(hash, CatbusType::Uint8, 1, &[0], 0).unwrap();
        db.set_name(hash, "brightness").unwrap();
        assert_eq!(db.name_of(hash), Some("brightness"));
    }

    #[test]
    fn notifier_callback_fires_on_set() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static LAST: AtomicU32 = AtomicU32::new(0);
        fn cb(hash: u32, _ty: CatbusType, data: &[u8]) {
            LAST.store(hash ^ data[0] as u32, Ordering::SeqCst);
        }
        let mut db = Kvdb::new();
        let hash = hash_name("notify-me");
        db.add(hash, CatbusType::Uint8, 1, &[0], 0).unwrap();
        db.set_notifier(hash, Notifier::Callback(cb)).unwrap();
        db.set(hash, CatbusType::Uint8, &[42]).unwrap();
        assert_eq!(LAST.load(Ordering::SeqCst), hash ^ 42);
    }
}
