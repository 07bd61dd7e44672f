//! Partition table parsing and validation.
//!
//! The table sits in the last 4 KiB of the primary region and is the
//! directory of every private partition the boot loader formatted. A table
//! whose magic is absent simply means no partitions exist; a table whose
//! magic is present but whose contents fail validation is corruption and is
//! reported as such, never treated as absent.

use crate::layout::{InfoBlock, PtableEntry, PtableHeader, INFO_MAGIC, PTABLE_MAGIC, PTABLE_WINDOW};
use crate::region::Region;
use crate::{Result, SmemError, DEFAULT_ITEM_COUNT};

/// Only one table layout has ever been deployed.
const PTABLE_VERSION: u32 = 1;

/// A validated view of the partition table.
pub(crate) struct PartitionTable<'r> {
    region: &'r Region,
    base: usize,
    num_entries: u32,
}

impl<'r> PartitionTable<'r> {
    /// Locate the table in `region`.
    ///
    /// Returns `Ok(None)` when no table magic is present.
    pub(crate) fn locate(region: &'r Region) -> Result<Option<Self>> {
        let base = region
            .size()
            .checked_sub(PTABLE_WINDOW)
            .ok_or(SmemError::Corrupt)?;
        let hdr = PtableHeader::decode(region.bytes(base, PtableHeader::SIZE)?);

        if hdr.magic != PTABLE_MAGIC {
            return Ok(None);
        }
        if hdr.version != PTABLE_VERSION {
            log::error!("unsupported partition table version {}", hdr.version);
            return Err(SmemError::Corrupt);
        }

        Ok(Some(Self {
            region,
            base,
            num_entries: hdr.num_entries,
        }))
    }

    pub(crate) fn num_entries(&self) -> u32 {
        self.num_entries
    }

    fn entry_offset(&self, index: u32) -> Result<usize> {
        (index as usize)
            .checked_mul(PtableEntry::SIZE)
            .and_then(|off| off.checked_add(self.base + PtableHeader::SIZE))
            .ok_or(SmemError::Corrupt)
    }

    pub(crate) fn entry(&self, index: u32) -> Result<PtableEntry> {
        let off = self.entry_offset(index)?;
        Ok(PtableEntry::decode(self.region.bytes(off, PtableEntry::SIZE)?))
    }

    /// Item capacity advertised by the info block after the last entry,
    /// falling back to the fixed directory capacity when the block is
    /// missing or unreadable.
    pub(crate) fn item_count(&self) -> u32 {
        let Ok(off) = self.entry_offset(self.num_entries) else {
            return DEFAULT_ITEM_COUNT;
        };
        let Ok(bytes) = self.region.bytes(off, InfoBlock::SIZE) else {
            return DEFAULT_ITEM_COUNT;
        };
        let info = InfoBlock::decode(bytes);
        if info.magic == INFO_MAGIC {
            u32::from(info.num_items)
        } else {
            DEFAULT_ITEM_COUNT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::PhysAddr;

    fn region_over(buf: &mut [u8]) -> Region {
        unsafe { Region::new(PhysAddr::new(0x8000_0000), buf.as_mut_ptr(), buf.len()) }
    }

    fn write_table(buf: &mut [u8], version: u32, entries: &[PtableEntry]) {
        let base = buf.len() - PTABLE_WINDOW;
        PtableHeader {
            magic: PTABLE_MAGIC,
            version,
            num_entries: entries.len() as u32,
        }
        .encode(&mut buf[base..base + PtableHeader::SIZE]);
        for (i, e) in entries.iter().enumerate() {
            let off = base + PtableHeader::SIZE + i * PtableEntry::SIZE;
            e.encode(&mut buf[off..off + PtableEntry::SIZE]);
        }
    }

    #[test]
    fn test_missing_magic_is_absent() {
        let mut buf = vec![0u8; 2 * PTABLE_WINDOW];
        let region = region_over(&mut buf);
        assert!(PartitionTable::locate(&region).unwrap().is_none());
    }

    #[test]
    fn test_bad_version_is_corrupt_not_absent() {
        let mut buf = vec![0u8; 2 * PTABLE_WINDOW];
        write_table(&mut buf, 2, &[]);
        let region = region_over(&mut buf);
        assert_eq!(
            PartitionTable::locate(&region).map(|_| ()),
            Err(SmemError::Corrupt)
        );
    }

    #[test]
    fn test_entries_round_trip() {
        let mut buf = vec![0u8; 2 * PTABLE_WINDOW];
        let entry = PtableEntry {
            offset: 0x1000,
            size: 0x4000,
            flags: 0,
            host0: 0,
            host1: 1,
            cacheline: 64,
        };
        write_table(&mut buf, 1, &[entry]);
        let region = region_over(&mut buf);

        let table = PartitionTable::locate(&region).unwrap().unwrap();
        assert_eq!(table.num_entries(), 1);
        assert_eq!(table.entry(0).unwrap(), entry);
        // Reads past the table window run into the region bound.
        assert!(table.entry(1_000_000).is_err());
    }

    #[test]
    fn test_item_count_from_info_block() {
        let mut buf = vec![0u8; 2 * PTABLE_WINDOW];
        write_table(&mut buf, 1, &[]);
        let info_off = buf.len() - PTABLE_WINDOW + PtableHeader::SIZE;
        InfoBlock {
            magic: INFO_MAGIC,
            size: 0x0020_0000,
            base_addr: 0x8000_0000,
            num_items: 768,
        }
        .encode(&mut buf[info_off..info_off + InfoBlock::SIZE]);

        let region = region_over(&mut buf);
        let table = PartitionTable::locate(&region).unwrap().unwrap();
        assert_eq!(table.item_count(), 768);
    }

    #[test]
    fn test_item_count_defaults_without_info_block() {
        let mut buf = vec![0u8; 2 * PTABLE_WINDOW];
        write_table(&mut buf, 1, &[]);
        let region = region_over(&mut buf);
        let table = PartitionTable::locate(&region).unwrap().unwrap();
        assert_eq!(table.item_count(), DEFAULT_ITEM_COUNT);
    }
}
