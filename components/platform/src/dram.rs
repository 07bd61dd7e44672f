//! DRAM layout discovery from the usable-RAM partition table item.
//!
//! The previous boot stage publishes the memory map it configured as a
//! fixed-size table of named partitions. Only SDRAM partitions of system
//! memory type describe RAM this processor may use; everything else in the
//! table (IMEM carve-outs and the like) is skipped. When the item is
//! missing or unpopulated the caller's firmware-provided bank list is used
//! instead.

use core::cmp::Ordering;

use smem::{Smem, HOST_ANY};

use crate::{PlatformError, Result};

/// Well-known item id of the usable-RAM partition table.
pub const ITEM_USABLE_RAM_TABLE: u16 = 402;

/// Most banks any supported board exposes.
pub const MAX_BANKS: usize = 8;

const TABLE_ENTRIES: usize = 32;
/// Table header: two magic words, version, reserved, length, plus one
/// alignment word before the first entry.
const TABLE_HEADER_SIZE: usize = 24;
/// One entry: 16-byte name, start, size and five attribute words, grown by
/// two reserved words at some point.
const ENTRY_SIZE: usize = 72;

const CATEGORY_SDRAM: u32 = 0x0e;
const TYPE_SYSMEM: u32 = 0x01;

const ENTRY_START: usize = 16;
const ENTRY_SIZE_FIELD: usize = 24;
const ENTRY_CATEGORY: usize = 36;
const ENTRY_TYPE: usize = 44;

/// One contiguous DRAM bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DramBank {
    pub start: u64,
    pub size: u64,
}

impl DramBank {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// The discovered memory map: banks sorted by base address.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    banks: [DramBank; MAX_BANKS],
    count: usize,
}

impl MemoryLayout {
    pub fn banks(&self) -> &[DramBank] {
        &self.banks[..self.count]
    }

    /// Base of the lowest bank.
    pub fn base(&self) -> u64 {
        self.banks().first().map_or(0, |b| b.start)
    }

    /// Bytes between the lowest base and the highest bank end.
    pub fn span(&self) -> u64 {
        let end = self.banks().iter().map(DramBank::end).max().unwrap_or(0);
        end - self.base()
    }
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn le64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(raw)
}

/// Collect the system-RAM banks out of a raw partition table item.
fn parse_ram_table(bytes: &[u8], banks: &mut [DramBank; MAX_BANKS]) -> usize {
    let mut count = 0;
    for index in 0..TABLE_ENTRIES {
        let off = TABLE_HEADER_SIZE + index * ENTRY_SIZE;
        if off + ENTRY_SIZE > bytes.len() {
            break;
        }
        let entry = &bytes[off..off + ENTRY_SIZE];

        let start = le64(entry, ENTRY_START);
        let size = le64(entry, ENTRY_SIZE_FIELD);
        if start == 0 && size == 0 {
            break;
        }
        if le32(entry, ENTRY_CATEGORY) != CATEGORY_SDRAM || le32(entry, ENTRY_TYPE) != TYPE_SYSMEM
        {
            continue;
        }
        if count == MAX_BANKS {
            log::error!("more than {} memory banks in the RAM table", MAX_BANKS);
            break;
        }
        banks[count] = DramBank { start, size };
        count += 1;
    }
    count
}

fn bank_order(a: &DramBank, b: &DramBank) -> Ordering {
    // Empty banks sort last; populated ones by their 16 MiB-granule base.
    match (a.size == 0, b.size == 0) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => Ordering::Equal,
        (false, false) => (a.start >> 24).cmp(&(b.start >> 24)),
    }
}

fn sort_banks(banks: &mut [DramBank]) {
    // A handful of entries at most; insertion sort avoids any allocation.
    for i in 1..banks.len() {
        let mut j = i;
        while j > 0 && bank_order(&banks[j - 1], &banks[j]) == Ordering::Greater {
            banks.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Resolve the memory map, preferring the shared-heap item.
///
/// `fallback` is the bank list the firmware handed over (usually from the
/// device tree); it is used whenever the heap item is missing, unpopulated
/// or empty. Failing both sources is the only fatal outcome.
pub fn memory_layout(smem: &Smem, fallback: &[DramBank]) -> Result<MemoryLayout> {
    let mut banks = [DramBank::default(); MAX_BANKS];
    let mut count = match smem.get(HOST_ANY, ITEM_USABLE_RAM_TABLE) {
        Ok(item) => parse_ram_table(item.as_bytes(), &mut banks),
        Err(err) => {
            log::debug!("no RAM table in shared memory: {}", err);
            0
        }
    };

    if count == 0 {
        log::debug!("using firmware-provided memory map");
        for bank in fallback {
            if bank.size == 0 {
                continue;
            }
            if count == MAX_BANKS {
                log::error!("more than {} firmware memory banks", MAX_BANKS);
                break;
            }
            banks[count] = *bank;
            count += 1;
        }
    }
    if count == 0 {
        return Err(PlatformError::NoMemoryMap);
    }

    sort_banks(&mut banks[..count]);
    Ok(MemoryLayout { banks, count })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_places_empty_banks_last() {
        let mut banks = [
            DramBank { start: 0x1_8000_0000, size: 0x4000_0000 },
            DramBank { start: 0, size: 0 },
            DramBank { start: 0x8000_0000, size: 0x4000_0000 },
        ];
        sort_banks(&mut banks);
        assert_eq!(banks[0].start, 0x8000_0000);
        assert_eq!(banks[1].start, 0x1_8000_0000);
        assert_eq!(banks[2].size, 0);
    }

    #[test]
    fn test_parse_filters_non_sdram() {
        let mut bytes = vec![0u8; TABLE_HEADER_SIZE + 3 * ENTRY_SIZE];
        let mut write_entry = |i: usize, start: u64, size: u64, category: u32, kind: u32| {
            let off = TABLE_HEADER_SIZE + i * ENTRY_SIZE;
            bytes[off + ENTRY_START..off + ENTRY_START + 8].copy_from_slice(&start.to_le_bytes());
            bytes[off + ENTRY_SIZE_FIELD..off + ENTRY_SIZE_FIELD + 8]
                .copy_from_slice(&size.to_le_bytes());
            bytes[off + ENTRY_CATEGORY..off + ENTRY_CATEGORY + 4]
                .copy_from_slice(&category.to_le_bytes());
            bytes[off + ENTRY_TYPE..off + ENTRY_TYPE + 4].copy_from_slice(&kind.to_le_bytes());
        };
        write_entry(0, 0x8000_0000, 0x4000_0000, CATEGORY_SDRAM, TYPE_SYSMEM);
        write_entry(1, 0x1460_0000, 0x20_0000, 0x04, TYPE_SYSMEM); // IMEM carve-out
        write_entry(2, 0xc000_0000, 0x4000_0000, CATEGORY_SDRAM, TYPE_SYSMEM);

        let mut banks = [DramBank::default(); MAX_BANKS];
        let count = parse_ram_table(&bytes, &mut banks);
        assert_eq!(count, 2);
        assert_eq!(banks[0].start, 0x8000_0000);
        assert_eq!(banks[1].start, 0xc000_0000);
    }

    #[test]
    fn test_parse_stops_at_empty_entry() {
        let mut bytes = vec![0u8; TABLE_HEADER_SIZE + 3 * ENTRY_SIZE];
        let off = TABLE_HEADER_SIZE;
        bytes[off + ENTRY_START..off + ENTRY_START + 8]
            .copy_from_slice(&0x8000_0000u64.to_le_bytes());
        bytes[off + ENTRY_SIZE_FIELD..off + ENTRY_SIZE_FIELD + 8]
            .copy_from_slice(&0x1000_0000u64.to_le_bytes());
        bytes[off + ENTRY_CATEGORY..off + ENTRY_CATEGORY + 4]
            .copy_from_slice(&CATEGORY_SDRAM.to_le_bytes());
        bytes[off + ENTRY_TYPE..off + ENTRY_TYPE + 4].copy_from_slice(&TYPE_SYSMEM.to_le_bytes());
        // Entry 1 is all zeroes; entry 2 would match but must never be seen.
        let off2 = TABLE_HEADER_SIZE + 2 * ENTRY_SIZE;
        bytes[off2 + ENTRY_START..off2 + ENTRY_START + 8]
            .copy_from_slice(&0xc000_0000u64.to_le_bytes());

        let mut banks = [DramBank::default(); MAX_BANKS];
        assert_eq!(parse_ram_table(&bytes, &mut banks), 1);
    }
}
