//! ID/CPU allocator (C1): hands out disjoint sub-UID/GID ranges and a CPU index to each
//! sandbox, first-fit over a dense slot space.
//!
//! Grounded on the original `sandbox/allocator/allocator.go` and
//! `sandbox/allocator/utils.go`: a mex-style cursor picks the smallest index never yet
//! used, falling back to a set of holes returned by `free` so indices are reused before
//! the cursor advances further.

use getset::CopyGetters;
use std::{
    collections::{BTreeSet, HashSet},
    fs,
    sync::Mutex,
};
use thiserror::Error;

/// Size of the sub-UID/GID block handed to each sandbox.
pub const SLOT_SIZE: u32 = 65536;

/// Fallback starting UID/GID when `/etc/subuid`/`/etc/subgid` cannot be read (development
/// or test environments without sub-id delegation configured).
pub const DEFAULT_START: u32 = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("no free sandbox capacity remaining")]
    NoCapacity,

    #[error("index {0} is not currently allocated")]
    NotAllocated(usize),
}

/// A contiguous UID/GID range delegated to one sandbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
pub struct Range {
    #[getset(get_copy = "pub")]
    uid_start: u32,
    #[getset(get_copy = "pub")]
    uid_size: u32,
    #[getset(get_copy = "pub")]
    gid_start: u32,
    #[getset(get_copy = "pub")]
    gid_size: u32,
}

impl Range {
    /// Returns true if `self` and `other` share any UID or GID.
    pub fn overlaps(&self, other: &Range) -> bool {
        let uid_overlap = self.uid_start < other.uid_start + other.uid_size
            && other.uid_start < self.uid_start + self.uid_size;
        let gid_overlap = self.gid_start < other.gid_start + other.gid_size
            && other.gid_start < self.gid_start + self.gid_size;
        uid_overlap || gid_overlap
    }
}

/// Result of a successful allocation: a dense `index`, the `cpu` a sandbox should pin to,
/// and the `Range` of host UIDs/GIDs it owns exclusively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
pub struct AllocResult {
    #[getset(get_copy = "pub")]
    index: usize,
    #[getset(get_copy = "pub")]
    cpu: usize,
    id: Range,
}

impl AllocResult {
    pub fn id(&self) -> Range {
        self.id
    }
}

struct Inner {
    used: HashSet<usize>,
    /// Holes below `mex` that have been freed and are available for reuse.
    freed: BTreeSet<usize>,
    /// Smallest index never yet used.
    mex: usize,
}

/// Allocator hands out disjoint `AllocResult`s under a single mutex.
pub struct Allocator {
    inner: Mutex<Inner>,
    uid_start_base: u32,
    gid_start_base: u32,
    ncpu: usize,
    max_containers: Option<usize>,
}

impl Allocator {
    /// Build a new allocator, reading sub-UID/GID delegation from `/etc/subuid` and
    /// `/etc/subgid` on a best-effort basis. Absence of delegation is not a hard failure:
    /// it falls back to `DEFAULT_START` with unbounded growth, matching development/test
    /// environments that have no sub-id ranges configured.
    pub fn new(ncpu: usize) -> Self {
        let uid_range = read_sub_id_range("/etc/subuid");
        let gid_range = read_sub_id_range("/etc/subgid");

        let (uid_start_base, uid_size) = uid_range.unwrap_or((DEFAULT_START, None));
        let (gid_start_base, gid_size) = gid_range.unwrap_or((DEFAULT_START, None));

        let max_containers = match (uid_size, gid_size) {
            (Some(u), Some(g)) => Some((u.min(g) / SLOT_SIZE) as usize),
            _ => None,
        };

        Self {
            inner: Mutex::new(Inner {
                used: HashSet::new(),
                freed: BTreeSet::new(),
                mex: 0,
            }),
            uid_start_base,
            gid_start_base,
            ncpu: ncpu.max(1),
            max_containers,
        }
    }

    /// Allocate the smallest free index, returning its `Range` and CPU pin. Thread-safe;
    /// serialized under one mutex, so the index sequence is deterministic for a given
    /// interleaving of `allocate`/`free` calls.
    pub fn allocate(&self) -> Result<AllocResult, AllocatorError> {
        let mut inner = self.inner.lock().expect("allocator mutex");

        if let Some(max) = self.max_containers {
            if inner.freed.is_empty() && inner.mex >= max {
                return Err(AllocatorError::NoCapacity);
            }
        }

        let index = if let Some(&i) = inner.freed.iter().next() {
            inner.freed.remove(&i);
            i
        } else {
            let i = inner.mex;
            inner.mex += 1;
            i
        };
        inner.used.insert(index);

        Ok(AllocResult {
            index,
            cpu: index % self.ncpu,
            id: Range {
                uid_start: self.uid_start_base + (index as u32) * SLOT_SIZE,
                uid_size: SLOT_SIZE,
                gid_start: self.gid_start_base + (index as u32) * SLOT_SIZE,
                gid_size: SLOT_SIZE,
            },
        })
    }

    /// Free a previously allocated index, making it available for reuse. Errors if `index`
    /// is not currently allocated.
    pub fn free(&self, index: usize) -> Result<(), AllocatorError> {
        let mut inner = self.inner.lock().expect("allocator mutex");
        if !inner.used.remove(&index) {
            return Err(AllocatorError::NotAllocated(index));
        }

        if index + 1 == inner.mex {
            inner.mex -= 1;
            while inner.mex > 0 && inner.freed.remove(&(inner.mex - 1)) {
                inner.mex -= 1;
            }
        } else {
            inner.freed.insert(index);
        }

        Ok(())
    }
}

/// Parse `user:start:count` lines from a sub-uid/sub-gid file, returning the start and
/// size delegated to the current user, if any.
fn read_sub_id_range(path: &str) -> Option<(u32, Option<u32>)> {
    let username = current_username()?;
    let contents = fs::read_to_string(path).ok()?;

    for line in contents.lines() {
        let mut parts = line.splitn(3, ':');
        let user = parts.next()?;
        let start: u32 = parts.next()?.parse().ok()?;
        let count: u32 = parts.next()?.parse().ok()?;
        if user == username {
            return Some((start, Some(count)));
        }
    }
    None
}

fn current_username() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
}
