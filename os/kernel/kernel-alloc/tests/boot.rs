use kernel_alloc::{BootError, DirectMapper, FrameAllocError, KernelMemory};
use kernel_info::boot::{BootMemoryInfo, MemoryRegion, MemoryRegionKind, PhysicalRange};
use kernel_info::memory::{FRAME_SIZE, MemoryLayout};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PageEntry;
use kernel_vmem::mmu::SoftMmu;

#[repr(C, align(4096))]
#[derive(Clone)]
struct Frame([u8; 4096]);

/// Host pages standing in for RAM or for the heap's virtual window.
fn frames(count: usize) -> Vec<Frame> {
    vec![Frame([0; 4096]); count]
}

fn base_of(memory: &mut [Frame]) -> u64 {
    memory.as_mut_ptr() as u64
}

fn layout(window: &mut [Frame]) -> MemoryLayout {
    MemoryLayout::DEFAULT
        .with_identity_map_bytes(32 * FRAME_SIZE)
        .with_alloc_window(base_of(window), window.len() as u64 * FRAME_SIZE)
        .with_heap_bytes(16 * FRAME_SIZE)
}

#[test]
fn boots_from_a_memory_map() {
    let mut ram = frames(256);
    let mut window = frames(64);
    let mapper = unsafe { DirectMapper::new(base_of(&mut ram)) };
    let layout = layout(&mut window);

    let regions = [
        MemoryRegion::reserved(0, 16 * FRAME_SIZE),
        MemoryRegion::usable(16 * FRAME_SIZE, 200 * FRAME_SIZE),
        MemoryRegion::new(216 * FRAME_SIZE, 40 * FRAME_SIZE, MemoryRegionKind::AcpiReclaimable),
    ];
    let info = BootMemoryInfo {
        regions: &regions,
        kernel_image: PhysicalRange::from_len(16 * FRAME_SIZE, 8 * FRAME_SIZE),
    };

    let mut mm = unsafe { KernelMemory::boot(&info, &mapper, SoftMmu::new(), &layout) }.unwrap();

    let bitmap = mm.pmm().placement().unwrap();
    assert!(bitmap.start.as_u64() >= 24 * FRAME_SIZE);
    assert!(!mm.pmm().is_frame_free(bitmap.start));
    assert_eq!(
        mm.get_physical_address(VirtualAddress::new(bitmap.start.as_u64())),
        Some(bitmap.start)
    );
    assert_eq!(mm.pmm_total_frames(), 256);
    assert_eq!(
        mm.pmm_used_frames() + mm.pmm_free_frames(),
        mm.pmm_total_frames()
    );
    assert!(mm.vmm().mmu().paging);

    // Frames outside usable memory are never handed out.
    while let Some(frame) = mm.pmm_alloc_frame() {
        let n = frame.as_u64() / FRAME_SIZE;
        assert!((24..216).contains(&n), "frame {n} handed out");
    }
    assert_eq!(mm.pmm_free_frames(), 0);
}

#[test]
fn heap_and_paging_share_the_frame_pool() {
    let mut ram = frames(128);
    let mut window = frames(64);
    let mapper = unsafe { DirectMapper::new(base_of(&mut ram)) };
    let layout = layout(&mut window);
    let regions = [MemoryRegion::usable(0, 128 * FRAME_SIZE)];
    let info = BootMemoryInfo {
        regions: &regions,
        kernel_image: PhysicalRange::from_len(0, 4 * FRAME_SIZE),
    };

    let mut mm = unsafe { KernelMemory::boot(&info, &mapper, SoftMmu::new(), &layout) }.unwrap();
    let baseline = mm.pmm_free_frames();

    let frame = mm.pmm_alloc_frame().unwrap();
    let va = VirtualAddress::new(0x4000_0000);
    mm.map_page(va, frame, PageEntry::kernel_data()).unwrap();
    assert_eq!(mm.get_physical_address(va + 0x123), Some(frame + 0x123));
    assert!(mm.map_page(va, frame, PageEntry::kernel_data()).is_err());
    assert_eq!(mm.unmap_page(va), Ok(frame));
    assert!(mm.get_physical_address(va).is_none());
    mm.pmm_free_frame(frame).unwrap();
    assert_eq!(
        mm.pmm_free_frame(frame),
        Err(FrameAllocError::DoubleFree(frame))
    );
    assert_eq!(mm.pmm_free_frames(), baseline);

    let a = mm.kcalloc(16, 16).unwrap();
    let b = mm.kmalloc_aligned(64, 256).unwrap();
    assert_eq!(b.as_ptr() as usize % 256, 0);
    let c = unsafe { mm.krealloc(Some(a), 1000) }.unwrap().unwrap();
    unsafe {
        mm.kfree(b).unwrap();
        mm.kfree(c).unwrap();
    }
    let stats = mm.heap_stats();
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.total_bytes, 16 * 4096);
    mm.heap_validate().unwrap();

    // Heap traffic never touches the frame pool.
    assert_eq!(mm.pmm_free_frames(), baseline);
}

#[test]
fn empty_memory_map_fails_to_boot() {
    let mut window = frames(64);
    let mapper = unsafe { DirectMapper::identity() };
    let layout = layout(&mut window);
    let info = BootMemoryInfo {
        regions: &[],
        kernel_image: PhysicalRange::new(PhysicalAddress::new(0), PhysicalAddress::new(0)),
    };

    let result = unsafe { KernelMemory::boot(&info, &mapper, SoftMmu::new(), &layout) };
    assert!(matches!(
        result,
        Err(BootError::FrameAllocator(FrameAllocError::NoUsableMemory))
    ));
}
