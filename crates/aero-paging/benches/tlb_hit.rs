#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use aero_paging::{
    ExceptionSink, ExecutionLoop, FaultFrame, GuestIp, PagingError, PagingUnit, PhysPageHandler,
    PhysicalMemory, Privilege, PAGE_SHIFT,
};
#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("AERO_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
struct BenchMemory {
    data: Vec<u8>,
}

#[cfg(not(target_arch = "wasm32"))]
impl BenchMemory {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    fn write_u32_raw(&mut self, paddr: u32, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl PhysicalMemory for BenchMemory {
    #[inline]
    fn read_u8(&mut self, paddr: u32) -> u8 {
        self.data[paddr as usize]
    }

    #[inline]
    fn write_u8(&mut self, paddr: u32, value: u8) {
        self.data[paddr as usize] = value;
    }

    #[inline]
    fn read_u32(&mut self, paddr: u32) -> u32 {
        let off = paddr as usize;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[off..off + 4]);
        u32::from_le_bytes(buf)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u32, value: u32) {
        self.write_u32_raw(paddr, value);
    }

    fn page_handler(&self, phys_page: u32) -> PhysPageHandler {
        PhysPageHandler::ram(phys_page << PAGE_SHIFT)
    }

    fn arena(&self) -> &[u8] {
        &self.data
    }

    fn arena_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl ExceptionSink for BenchMemory {
    fn raise_exception(&mut self, _vector: u8, _error_code: u32) {}
}

#[cfg(not(target_arch = "wasm32"))]
impl ExecutionLoop for BenchMemory {
    fn segment_ip(&self) -> GuestIp {
        GuestIp::default()
    }

    fn run_until_fault_resolved(
        &mut self,
        _paging: &mut PagingUnit,
        frame: &FaultFrame,
    ) -> Result<(), PagingError> {
        // Every benchmarked page is mapped up front.
        Err(PagingError::MachineStopped {
            linear: frame.linear,
        })
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_tlb_hit(c: &mut Criterion) {
    // 386 paging-structure bits (repeated here so benches don't rely on crate constants).
    const PTE_P: u32 = 1 << 0;
    const PTE_RW: u32 = 1 << 1;
    const PTE_US: u32 = 1 << 2;
    const PTE_D: u32 = 1 << 6;

    let mut mem = BenchMemory::new(0x40_0000);

    // PD[0] -> PT -> 64 user pages starting at physical 0x100000, plus one kernel page.
    let pd_base = 0x1000u32;
    let pt_base = 0x2000u32;
    let page_base = 0x10_0000u32;
    let kernel_page = 0x3f_0000u32;
    mem.write_u32_raw(pd_base, pt_base | PTE_P | PTE_RW | PTE_US);
    for i in 0..64u32 {
        mem.write_u32_raw(
            pt_base + i * 4,
            (page_base + (i << 12)) | PTE_P | PTE_RW | PTE_US | PTE_D,
        );
    }
    mem.write_u32_raw(pt_base + 64 * 4, kernel_page | PTE_P | PTE_RW);

    let mut paging = PagingUnit::default();
    paging.set_dir_base(pd_base);
    paging.enable(true);

    // Populate the TLB once via page walks.
    for i in 0..=64u32 {
        paging.force_resolve(&mut mem, i << 12).unwrap();
    }
    let vaddr = 0x234u32;

    let mut group = c.benchmark_group("tlb_hit");
    group.throughput(Throughput::Elements(1));
    group.bench_function("read_u32", |b| {
        b.iter(|| {
            let value = paging.read_u32(&mut mem, black_box(vaddr)).unwrap();
            black_box(value)
        })
    });
    group.bench_function("write_u32", |b| {
        b.iter(|| {
            paging
                .write_u32(&mut mem, black_box(vaddr), black_box(0xdead_beef))
                .unwrap();
        })
    });
    group.bench_function("read_u32_page_crossing", |b| {
        b.iter(|| {
            let value = paging.read_u32(&mut mem, black_box(0xffe)).unwrap();
            black_box(value)
        })
    });
    group.finish();

    let mut group = c.benchmark_group("privilege_switch");
    group.throughput(Throughput::Elements(2));
    group.bench_function("user_round_trip", |b| {
        b.iter(|| {
            paging.switch_privilege(&mem, Privilege::User).unwrap();
            paging
                .switch_privilege(&mem, black_box(Privilege::Supervisor))
                .unwrap();
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_tlb_hit
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
