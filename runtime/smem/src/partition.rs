//! Private partitions and their two bump allocators.
//!
//! A partition is a slice of the primary region reserved for one pair of
//! processors. Uncached items grow from the front (record before data),
//! cached items grow from the back (record after data, stepping toward
//! lower addresses with a cacheline-aligned stride). The free gap lies
//! between the two cursors kept in the partition header.
//!
//! Both processors append records without taking a shared lock, so every
//! traversal distrusts the memory: each step validates the record canary
//! and containment before going further, and any violation surfaces as a
//! corruption error instead of walking out of bounds.

use crate::layout::{
    align_up, PartitionHeader, PrivateEntry, PtableEntry, PART_MAGIC, PRIVATE_CANARY,
};
use crate::region::{publish, PhysAddr, Region};
use crate::{Item, Result, SmemError};

/// Byte offset of the uncached free cursor inside the partition header.
const FREE_UNCACHED_FIELD: usize = 12;

/// A validated handle onto one private partition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Partition {
    mem: Region,
    cacheline: usize,
}

impl Partition {
    /// Validate the partition a table entry points at and wrap it.
    ///
    /// `host0`/`host1` are the processor pair the caller expects; the
    /// stored header must match it exactly. Any mismatch between the table
    /// entry and the header is corruption, a corrupt entry must never look
    /// like a missing partition.
    pub(crate) fn from_table_entry(
        region: &Region,
        entry: &PtableEntry,
        host0: u16,
        host1: u16,
    ) -> Result<Self> {
        let mem = region.subregion(entry.offset as usize, entry.size as usize)?;
        let header = PartitionHeader::decode(mem.bytes(0, PartitionHeader::SIZE)?);

        if header.magic != PART_MAGIC {
            log::error!("bad partition magic {:02x?}", header.magic);
            return Err(SmemError::Corrupt);
        }
        if header.host0 != host0 {
            log::error!("bad host0 ({} != {})", host0, header.host0);
            return Err(SmemError::Corrupt);
        }
        if header.host1 != host1 {
            log::error!("bad host1 ({} != {})", host1, header.host1);
            return Err(SmemError::Corrupt);
        }
        if header.size != entry.size {
            log::error!("bad partition size ({} != {})", header.size, entry.size);
            return Err(SmemError::Corrupt);
        }
        if header.offset_free_uncached > header.size {
            log::error!(
                "bad partition free uncached ({} > {})",
                header.offset_free_uncached,
                header.size
            );
            return Err(SmemError::Corrupt);
        }

        Ok(Self {
            mem,
            cacheline: entry.cacheline as usize,
        })
    }

    fn header(&self) -> Result<PartitionHeader> {
        Ok(PartitionHeader::decode(
            self.mem.bytes(0, PartitionHeader::SIZE)?,
        ))
    }

    fn entry_at(&self, offset: usize) -> Result<PrivateEntry> {
        Ok(PrivateEntry::decode(
            self.mem.bytes(offset, PrivateEntry::SIZE)?,
        ))
    }

    fn bad_canary(&self) -> SmemError {
        if let Ok(header) = self.header() {
            log::error!(
                "found invalid canary in hosts {}:{} partition",
                header.host0,
                header.host1
            );
        }
        SmemError::Corrupt
    }

    /// Offset of the record following an uncached record at `offset`.
    fn next_uncached(&self, offset: usize, entry: &PrivateEntry) -> Result<usize> {
        offset
            .checked_add(PrivateEntry::SIZE)
            .and_then(|o| o.checked_add(entry.padding_hdr as usize))
            .and_then(|o| o.checked_add(entry.size as usize))
            .ok_or(SmemError::Corrupt)
    }

    /// Record-to-record stride of the cached run.
    fn cached_stride(&self) -> usize {
        align_up(PrivateEntry::SIZE, self.cacheline.max(1))
    }

    /// Both free cursors, sanity-checked against the partition size.
    fn free_cursors(&self) -> Result<(usize, usize)> {
        let header = self.header()?;
        let uncached = header.offset_free_uncached as usize;
        let cached = header.offset_free_cached as usize;
        if uncached > self.mem.size() || cached > self.mem.size() {
            return Err(SmemError::Corrupt);
        }
        Ok((uncached, cached))
    }

    /// Append an uncached item.
    ///
    /// The record is fully written and published before the free cursor
    /// advances, so a co-processor that sees the new cursor also sees the
    /// record.
    pub(crate) fn alloc(&mut self, item: u16, size: usize) -> Result<()> {
        let (free_uncached, free_cached) = self.free_cursors()?;

        let mut cursor = PartitionHeader::SIZE;
        while cursor < free_uncached {
            let entry = self.entry_at(cursor)?;
            if entry.canary != PRIVATE_CANARY {
                return Err(self.bad_canary());
            }
            if entry.item == item {
                return Err(SmemError::AlreadyExists);
            }
            cursor = self.next_uncached(cursor, &entry)?;
        }
        if cursor > self.mem.size() {
            return Err(SmemError::Corrupt);
        }

        let body = align_up(size, 8);
        let needed = body
            .checked_add(PrivateEntry::SIZE)
            .ok_or(SmemError::OutOfSpace)?;
        let end = cursor.checked_add(needed).ok_or(SmemError::OutOfSpace)?;
        if end > free_cached {
            log::error!("out of memory");
            return Err(SmemError::OutOfSpace);
        }
        let new_free = free_uncached
            .checked_add(needed)
            .ok_or(SmemError::OutOfSpace)?;

        let record = PrivateEntry {
            canary: PRIVATE_CANARY,
            item,
            size: body as u32,
            padding_data: (body - size) as u16,
            padding_hdr: 0,
        };
        let mut bytes = [0u8; PrivateEntry::SIZE];
        record.encode(&mut bytes);
        self.mem.write(cursor, &bytes)?;

        publish();
        self.mem.write_u32(FREE_UNCACHED_FIELD, new_free as u32)?;
        Ok(())
    }

    /// Look up an item in the uncached run, then the cached run.
    ///
    /// If an item id was ever placed in both runs the uncached match wins;
    /// the cached run is not consulted for reconciliation.
    pub(crate) fn get(&self, item: u16) -> Result<Item<'_>> {
        let (free_uncached, free_cached) = self.free_cursors()?;

        let mut cursor = PartitionHeader::SIZE;
        while cursor < free_uncached {
            let entry = self.entry_at(cursor)?;
            if entry.canary != PRIVATE_CANARY {
                return Err(self.bad_canary());
            }
            if entry.item == item {
                let data = cursor
                    .checked_add(PrivateEntry::SIZE + entry.padding_hdr as usize)
                    .ok_or(SmemError::Corrupt)?;
                return self.item_bytes(&entry, data);
            }
            cursor = self.next_uncached(cursor, &entry)?;
        }
        if cursor > self.mem.size() {
            return Err(SmemError::Corrupt);
        }

        let stride = self.cached_stride();
        let mut cursor = self
            .mem
            .size()
            .checked_sub(stride)
            .ok_or(SmemError::Corrupt)?;
        while cursor > free_cached {
            let entry = self.entry_at(cursor)?;
            if entry.canary != PRIVATE_CANARY {
                return Err(self.bad_canary());
            }
            if entry.item == item {
                let data = cursor
                    .checked_sub(entry.size as usize)
                    .ok_or(SmemError::Corrupt)?;
                return self.item_bytes(&entry, data);
            }
            cursor = cursor
                .checked_sub(entry.size as usize)
                .and_then(|c| c.checked_sub(stride))
                .ok_or(SmemError::Corrupt)?;
        }

        Err(SmemError::NotFound)
    }

    /// Borrow a record's data after validating its size fields.
    fn item_bytes(&self, entry: &PrivateEntry, data: usize) -> Result<Item<'_>> {
        let body = entry.size as usize;
        let padding = entry.padding_data as usize;
        if body > self.mem.size() || padding > body {
            return Err(SmemError::Corrupt);
        }
        Ok(Item::new(self.mem.bytes(data, body - padding)?))
    }

    /// Width of the free gap between the two cursors.
    ///
    /// Callers use this as a cheap has-anything-changed probe; it is not a
    /// reservation.
    pub(crate) fn free_space(&self) -> Result<usize> {
        let header = self.header()?;
        let gap = header
            .offset_free_cached
            .checked_sub(header.offset_free_uncached)
            .ok_or(SmemError::Corrupt)? as usize;
        if gap > self.mem.size() {
            return Err(SmemError::Corrupt);
        }
        Ok(gap)
    }

    pub(crate) fn phys_of(&self, ptr: *const u8) -> Option<PhysAddr> {
        self.mem.phys_of(ptr)
    }
}
