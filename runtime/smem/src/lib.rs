//! Allocate-only shared-memory heap shared with SoC co-processors.
//!
//! # Purpose
//! During early boot, every processor on the SoC exchanges metadata through
//! one physically shared memory area formatted by the primary boot loader.
//! This crate takes over such an area: it validates the heap structures the
//! boot loader left behind, allocates new items into them and resolves
//! existing ones, without an OS allocator and without taking a
//! cross-processor lock (the boot window has a single active writer).
//!
//! # Heap structure
//! The primary region starts with a header carrying one version slot per
//! subsystem and a fixed 512-entry directory, the legacy global heap.
//! Version-12 boot loaders instead format private partitions, listed in a
//! partition table located 4 KiB before the end of the primary region. Each
//! partition belongs to a pair of processors and holds two runs of
//! allocation records: uncached items grow from the front (record before
//! data), cached items grow from the back (record after data), and the free
//! gap lies between the two cursors. A designated global partition, owned
//! by the reserved pair [`GLOBAL_HOST`]:[`GLOBAL_HOST`], stands in for the
//! legacy directory on such heaps.
//!
//! # Trust model
//! The backing bytes are written by firmware outside this codebase's
//! control. Every traversal re-validates record canaries and containment
//! as it goes; a violation surfaces as [`SmemError::Corrupt`] on that call
//! rather than a wild pointer or a silent skip. Mutations write the full
//! record first, publish it with a release fence, and only then advance the
//! free cursor, so a co-processor that observes the cursor also observes
//! the record.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod config;
mod global;
pub mod layout;
mod partition;
mod ptable;
mod region;

pub use config::{RegionConfig, SmemConfig};
pub use region::PhysAddr;

use layout::header;
use partition::Partition;
use ptable::PartitionTable;
use region::Region;
use static_assertions::const_assert;
use thiserror::Error;

/// Processor identifier of the application processor (the local host).
pub const HOST_APPS: u16 = 0;

/// Reserved identifier owning the global partition.
pub const GLOBAL_HOST: u16 = 0xfffe;

/// Pseudo-identifier for "no particular processor".
pub const HOST_ANY: u16 = u16::MAX;

/// Max number of processors a heap can name.
pub const HOST_COUNT: usize = 20;

/// Items below this id are placed by the boot loader while formatting the
/// heap; later callers may read but never allocate them.
pub const FIXED_ITEM_COUNT: u16 = 8;

/// Item capacity when no info block raises it.
pub const DEFAULT_ITEM_COUNT: u32 = 512;

/// Version slot written by the primary boot loader; its high half selects
/// the heap layout.
pub const SBL_VERSION_INDEX: usize = 7;

/// Heap layout with the fixed global directory only.
pub const VERSION_GLOBAL_HEAP: u32 = 11;

/// Heap layout with a partition table and a global partition.
pub const VERSION_GLOBAL_PART: u32 = 12;

/// Auxiliary regions supported beyond the primary one.
pub const MAX_AUX_REGIONS: usize = 3;

const_assert!((HOST_APPS as usize) < HOST_COUNT);

/// Errors reported by the shared-memory heap.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SmemError {
    /// The backing configuration, or the requested item, does not exist.
    #[error("not found")]
    NotFound,
    /// The boot loader has not (yet) initialized the heap header.
    #[error("shared memory is not initialized")]
    NotInitialized,
    /// The heap reports a layout this crate does not understand.
    #[error("unsupported shared memory version {0:#x}")]
    UnsupportedVersion(u32),
    /// The item's owner has not populated it yet; retry later in boot.
    #[error("item is not ready")]
    NotReady,
    /// Item id out of range, or reserved for the boot loader.
    #[error("invalid argument")]
    InvalidArgument,
    /// The item was already allocated; allocation is write-once.
    #[error("item already exists")]
    AlreadyExists,
    /// The partition's free gap cannot hold the item.
    #[error("out of partition space")]
    OutOfSpace,
    /// The legacy heap cannot hold the item.
    #[error("out of memory")]
    OutOfMemory,
    /// A canary, header or table invariant does not hold.
    #[error("shared memory is corrupt")]
    Corrupt,
}

pub type Result<T> = core::result::Result<T, SmemError>;

/// A resolved item: a borrowed view of its bytes in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item<'a> {
    bytes: &'a [u8],
}

impl<'a> Item<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The item's bytes.
    ///
    /// Co-processors may update an item in place after publication, so
    /// repeated reads of the same offset are not guaranteed to agree.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// How items without a private partition are stored.
enum GlobalHeap {
    /// Version 12: the global partition.
    Partitioned(Partition),
    /// Version 11: the fixed directory, spanning `heap_size` bytes of the
    /// primary region.
    Legacy { heap_size: usize },
}

/// The shared-memory heap.
///
/// Constructed at most once by [`Smem::init`] and passed by reference
/// afterwards; there is no global handle, so reinitialization is ruled out
/// by ownership rather than by a runtime flag.
pub struct Smem {
    item_count: u32,
    primary: Region,
    aux: [Option<Region>; MAX_AUX_REGIONS],
    global: GlobalHeap,
    partitions: [Option<Partition>; HOST_COUNT],
}

impl Smem {
    /// Validate an already formatted heap and take it over.
    ///
    /// Reads the heap header, detects the layout version, locates the
    /// global partition (version 12) and enumerates every partition
    /// addressed to [`HOST_APPS`]. Validation failures here are fatal to
    /// the whole subsystem: nothing below a broken header can be trusted.
    ///
    /// # Safety
    /// Every region in `config` must describe memory that is mapped,
    /// readable and writable for the lifetime of the process.
    pub unsafe fn init(config: &SmemConfig) -> Result<Smem> {
        let Some(first) = config.regions.first() else {
            return Err(SmemError::NotFound);
        };
        if config.regions.len() > 1 + MAX_AUX_REGIONS {
            return Err(SmemError::InvalidArgument);
        }

        let primary = unsafe { Region::new(first.aux_base, first.base, first.size) };
        let mut aux: [Option<Region>; MAX_AUX_REGIONS] = [None; MAX_AUX_REGIONS];
        for (slot, rc) in aux.iter_mut().zip(&config.regions[1..]) {
            *slot = Some(unsafe { Region::new(rc.aux_base, rc.base, rc.size) });
        }

        if primary.read_u32(header::INITIALIZED)? != 1
            || primary.read_u32(header::RESERVED)? != 0
        {
            log::error!("shared memory is not initialized by the boot loader");
            return Err(SmemError::NotInitialized);
        }

        let free_offset = primary.read_u32(header::FREE_OFFSET)?;
        let available = primary.read_u32(header::AVAILABLE)?;
        let version = primary.read_u32(header::version_slot(SBL_VERSION_INDEX))?;

        let (global, item_count) = match version >> 16 {
            VERSION_GLOBAL_PART => {
                let Some(table) = PartitionTable::locate(&primary)? else {
                    log::error!("partitioned heap without a partition table");
                    return Err(SmemError::Corrupt);
                };
                let partition = find_global_partition(&primary, &table)?;
                (GlobalHeap::Partitioned(partition), table.item_count())
            }
            VERSION_GLOBAL_HEAP => {
                let heap_size =
                    usize::try_from(u64::from(free_offset) + u64::from(available))
                        .map_err(|_| SmemError::Corrupt)?;
                (GlobalHeap::Legacy { heap_size }, DEFAULT_ITEM_COUNT)
            }
            _ => {
                log::error!("unsupported shared memory version {:#x}", version);
                return Err(SmemError::UnsupportedVersion(version));
            }
        };

        let partitions = enumerate_partitions(&primary, HOST_APPS)?;

        Ok(Smem {
            item_count,
            primary,
            aux,
            global,
            partitions,
        })
    }

    /// Highest accepted item id plus one.
    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    /// Allocate `size` bytes for `(host, item)`.
    ///
    /// Items are write-once: a second allocation for the same pair reports
    /// [`SmemError::AlreadyExists`] and mutates nothing.
    pub fn alloc(&mut self, host: u16, item: u16, size: usize) -> Result<()> {
        if item < FIXED_ITEM_COUNT {
            log::error!("rejecting allocation of static item {}", item);
            return Err(SmemError::InvalidArgument);
        }
        if u32::from(item) >= self.item_count {
            return Err(SmemError::InvalidArgument);
        }

        let idx = usize::from(host);
        if idx < HOST_COUNT {
            if let Some(partition) = self.partitions[idx].as_mut() {
                return partition.alloc(item, size);
            }
        }
        match &mut self.global {
            GlobalHeap::Partitioned(partition) => partition.alloc(item, size),
            GlobalHeap::Legacy { .. } => global::alloc(&self.primary, item, size),
        }
    }

    /// Resolve `(host, item)` to its bytes.
    pub fn get(&self, host: u16, item: u16) -> Result<Item<'_>> {
        if u32::from(item) >= self.item_count {
            return Err(SmemError::InvalidArgument);
        }

        let idx = usize::from(host);
        if idx < HOST_COUNT {
            if let Some(partition) = self.partitions[idx].as_ref() {
                return partition.get(item);
            }
        }
        match &self.global {
            GlobalHeap::Partitioned(partition) => partition.get(item),
            GlobalHeap::Legacy { heap_size } => {
                global::get(&self.primary, &self.aux, *heap_size, item)
            }
        }
    }

    /// Unallocated bytes left for `host`.
    ///
    /// A cheap way for clients to notice that new allocations appeared; the
    /// value is stale the moment it is read and guarantees nothing against
    /// concurrent writers.
    pub fn free_space(&self, host: u16) -> Result<usize> {
        let idx = usize::from(host);
        if idx < HOST_COUNT {
            if let Some(partition) = self.partitions[idx].as_ref() {
                return partition.free_space();
            }
        }
        match &self.global {
            GlobalHeap::Partitioned(partition) => partition.free_space(),
            GlobalHeap::Legacy { heap_size } => global::free_space(&self.primary, *heap_size),
        }
    }

    /// Physical address behind a pointer previously handed out by [`get`],
    /// or `None` for a pointer foreign to every tracked region.
    ///
    /// [`get`]: Smem::get
    pub fn physical_address_of(&self, ptr: *const u8) -> Option<PhysAddr> {
        for partition in self.partitions.iter().flatten() {
            if let Some(addr) = partition.phys_of(ptr) {
                return Some(addr);
            }
        }
        if let GlobalHeap::Partitioned(partition) = &self.global {
            if let Some(addr) = partition.phys_of(ptr) {
                return Some(addr);
            }
        }
        core::iter::once(&self.primary)
            .chain(self.aux.iter().flatten())
            .find_map(|region| region.phys_of(ptr))
    }
}

/// Find and validate the global partition in a version-12 heap.
fn find_global_partition(primary: &Region, table: &PartitionTable) -> Result<Partition> {
    for index in 0..table.num_entries() {
        let entry = table.entry(index)?;
        if entry.offset == 0 || entry.size == 0 {
            continue;
        }
        if entry.host0 == GLOBAL_HOST && entry.host1 == GLOBAL_HOST {
            return Partition::from_table_entry(primary, &entry, GLOBAL_HOST, GLOBAL_HOST);
        }
    }
    log::error!("missing entry for global partition");
    Err(SmemError::Corrupt)
}

/// Collect every partition addressed to `local`, keyed by the remote host.
fn enumerate_partitions(
    primary: &Region,
    local: u16,
) -> Result<[Option<Partition>; HOST_COUNT]> {
    let mut partitions = [None; HOST_COUNT];
    let Some(table) = PartitionTable::locate(primary)? else {
        return Ok(partitions);
    };

    for index in 0..table.num_entries() {
        let entry = table.entry(index)?;
        if entry.offset == 0 || entry.size == 0 {
            continue;
        }
        let remote = if entry.host0 == local {
            entry.host1
        } else if entry.host1 == local {
            entry.host0
        } else {
            continue;
        };
        if usize::from(remote) >= HOST_COUNT {
            log::error!("bad host {}", remote);
            return Err(SmemError::Corrupt);
        }
        if partitions[usize::from(remote)].is_some() {
            log::error!("duplicate host {}", remote);
            return Err(SmemError::Corrupt);
        }
        partitions[usize::from(remote)] =
            Some(Partition::from_table_entry(primary, &entry, entry.host0, entry.host1)?);
    }

    Ok(partitions)
}
