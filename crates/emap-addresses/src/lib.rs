//! # Address and Page Types for Extent Bookkeeping
//!
//! Strongly typed wrappers for the raw machine addresses and page bases that
//! the extent map works with.
//!
//! ## Overview
//!
//! The extent map tracks ranges of virtual memory at page granularity. This
//! crate defines the two value types everything else is built from, plus the
//! page geometry constants:
//!
//! | Type | Description |
//! |-------|-------------|
//! | [`VirtualAddress`] | A raw 64-bit virtual address, not necessarily aligned. |
//! | [`VirtualPage`] | A page-aligned base address (low [`LG_PAGE`] bits zero). |
//!
//! Both are `#[repr(transparent)]` wrappers around `u64` and implement `Copy`,
//! `Eq`, `Ord`, and `Hash`, making them suitable as map keys or for FFI use.
//! All alignment and offset calculations are `const fn` and zero-cost in
//! release builds.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use emap_addresses::*;
//! let addr = VirtualAddress::new(0x1000_0000_1234);
//!
//! // Derive the containing page and the in-page offset.
//! let page = addr.page();
//! assert_eq!(page.base().as_u64(), 0x1000_0000_1000);
//! assert_eq!(addr.offset_in_page(), 0x234);
//!
//! // Pages can be stepped at page granularity.
//! assert_eq!(page.add_pages(2).base().as_u64(), 0x1000_0000_3000);
//! ```
//!
//! The page size is fixed at 4 KiB; extents and the radix tree only ever deal
//! in multiples of it.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page;
mod virtual_address;
mod virtual_page;

pub use page::*;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;
