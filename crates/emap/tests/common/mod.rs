#![allow(dead_code)]

use core::alloc::Layout;
use core::ptr::NonNull;
use emap_addresses::{VirtualAddress, VirtualPage};
use emap_alloc::BumpAlloc;
use emap_extent::{Extent, SizeClass};
use emap_rtree::NodeAlloc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const PAGE: u64 = emap_addresses::PAGE_SIZE;

pub fn va(addr: u64) -> VirtualAddress {
    VirtualAddress::new(addr)
}

pub fn page(addr: u64) -> VirtualPage {
    VirtualPage::new_aligned(va(addr))
}

/// A descriptor that lives for the rest of the test process.
pub fn leak_extent(arena: u16, base: u64, size: u64, szind: u8, slab: bool) -> NonNull<Extent> {
    let extent = Extent::new(arena, page(base), size, SizeClass::new(szind), slab);
    NonNull::from(Box::leak(Box::new(extent)))
}

/// Raw descriptor pointer that may cross threads.
///
/// The map's contracts, not the type system, serialize access in these
/// tests.
#[derive(Copy, Clone)]
pub struct SendPtr(pub NonNull<Extent>);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Fails every node allocation once the budget is spent.
pub struct BudgetAlloc<'a> {
    inner: &'a BumpAlloc,
    budget: AtomicUsize,
}

impl<'a> BudgetAlloc<'a> {
    pub fn new(inner: &'a BumpAlloc, budget: usize) -> Self {
        Self {
            inner,
            budget: AtomicUsize::new(budget),
        }
    }

    pub fn refill(&self, budget: usize) {
        self.budget.store(budget, Ordering::Relaxed);
    }
}

impl NodeAlloc for BudgetAlloc<'_> {
    fn alloc_node(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                left.checked_sub(1)
            })
            .ok()?;
        self.inner.alloc_node(layout)
    }
}
