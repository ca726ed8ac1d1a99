#![no_main]
use libfuzzer_sys::fuzz_target;

use codelayout::{
    MemoryAttributes, MemoryRange, MemoryUsage, PlacementRequirements, SortedLinkerHeap,
};
use minilayout::fuzzing::HeapScript;

fn usage_of(data: bool) -> MemoryUsage {
    if data {
        MemoryUsage::DATA
    } else {
        MemoryUsage::CODE
    }
}

fuzz_target!(|script: HeapScript| {
    // Even ranges hold code, odd ones data.
    let memory: Vec<MemoryRange> = script
        .ranges
        .iter()
        .enumerate()
        .filter(|(_, (_, len))| *len > 0)
        .map(|(n, (start, len))| {
            let start = *start as u32 * 16;
            let end = start + *len as u32 * 16;
            let data = n % 2 == 1;
            let attributes = if data {
                MemoryAttributes::RAM | MemoryAttributes::READ | MemoryAttributes::WRITE
            } else {
                MemoryAttributes::FLASH | MemoryAttributes::READ | MemoryAttributes::EXECUTE
            };
            MemoryRange::new(start, end, attributes, usage_of(data))
        })
        .collect();

    let mut heap = SortedLinkerHeap::new(&memory);
    if let Err(msg) = heap.check() {
        panic!("fuzz_linker_heap.rs: bad import: {}", msg);
    }
    let total = heap.free_bytes();

    let mut taken: Vec<(u32, u32)> = Vec::new();
    for req in script.requests.iter() {
        let size = req.size as u32;
        let offset = (req.offset as u32).min(size);
        let alignment = 1 << (req.align_log2 % 8);
        let usage = usage_of(req.data);
        let mut pr = PlacementRequirements::new(alignment, usage);
        pr.allocate_from_high_address = req.from_high_address;

        let address = match heap.allocate(size, offset, &pr) {
            Some(address) => address,
            None => continue,
        };
        let end = address + size;
        assert!(size > 0);
        assert_eq!((address + offset) % alignment, 0, "misaligned allocation");
        let covered = |a: u32| memory.iter().any(|m| m.contains(a) && m.usage.intersects(usage));
        assert!(covered(address) && covered(end - 1), "allocation outside memory");
        for (s, e) in taken.iter() {
            assert!(end <= *s || *e <= address, "allocations overlap");
        }
        taken.push((address, end));

        if let Err(msg) = heap.check() {
            panic!("fuzz_linker_heap.rs: {}", msg);
        }
    }

    let used: u64 = taken.iter().map(|(s, e)| (e - s) as u64).sum();
    assert_eq!(heap.free_bytes() + used, total);
});
