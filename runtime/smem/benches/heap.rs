//! Throughput of the hot lookup paths over a populated heap.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use smem::layout::{
    header, PartitionHeader, PtableEntry, PtableHeader, PART_MAGIC, PTABLE_MAGIC, PTABLE_WINDOW,
};
use smem::{
    PhysAddr, RegionConfig, Smem, SmemConfig, GLOBAL_HOST, HOST_APPS, SBL_VERSION_INDEX,
    VERSION_GLOBAL_PART,
};

const REGION_SIZE: usize = 1 << 20;
const PART_OFFSET: u32 = 0x8_0000;
const PART_SIZE: u32 = 0x4_0000;

fn word(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn build_image() -> Vec<u8> {
    let mut buf = vec![0u8; REGION_SIZE];
    word(&mut buf, header::INITIALIZED, 1);
    word(
        &mut buf,
        header::version_slot(SBL_VERSION_INDEX),
        VERSION_GLOBAL_PART << 16,
    );

    let entry = PtableEntry {
        offset: PART_OFFSET,
        size: PART_SIZE,
        flags: 0,
        host0: GLOBAL_HOST,
        host1: GLOBAL_HOST,
        cacheline: 64,
    };
    let base = REGION_SIZE - PTABLE_WINDOW;
    PtableHeader {
        magic: PTABLE_MAGIC,
        version: 1,
        num_entries: 1,
    }
    .encode(&mut buf[base..base + PtableHeader::SIZE]);
    entry.encode(&mut buf[base + PtableHeader::SIZE..base + PtableHeader::SIZE + PtableEntry::SIZE]);

    let off = PART_OFFSET as usize;
    PartitionHeader {
        magic: PART_MAGIC,
        host0: GLOBAL_HOST,
        host1: GLOBAL_HOST,
        size: PART_SIZE,
        offset_free_uncached: PartitionHeader::SIZE as u32,
        offset_free_cached: PART_SIZE,
    }
    .encode(&mut buf[off..off + PartitionHeader::SIZE]);
    buf
}

fn bench_heap(c: &mut Criterion) {
    let mut buf = build_image();
    let regions = [RegionConfig {
        aux_base: PhysAddr::new(0x8060_0000),
        base: buf.as_mut_ptr(),
        size: buf.len(),
    }];
    let mut smem = unsafe { Smem::init(&SmemConfig::new(&regions)) }.expect("valid image");

    for item in 100..200 {
        smem.alloc(HOST_APPS, item, 64).expect("partition is large enough");
    }

    c.bench_function("get_last_of_100", |b| {
        b.iter(|| smem.get(HOST_APPS, black_box(199)).unwrap().len())
    });
    c.bench_function("get_first_of_100", |b| {
        b.iter(|| smem.get(HOST_APPS, black_box(100)).unwrap().len())
    });
    c.bench_function("free_space", |b| {
        b.iter(|| smem.free_space(HOST_APPS).unwrap())
    });
}

criterion_group!(benches, bench_heap);
criterion_main!(benches);
