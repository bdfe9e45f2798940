//! A `no_std`, no-alloc dynamic feature allocator backed by external NOR flash.
//!
//! This crate manages the lifecycle of *features* (independently loadable
//! application units) inside a reserved region of an external flash device:
//! it allocates contiguous flash slots for feature code and data, pairs each
//! slot with a window in a fixed RAM pool, persists slot metadata across
//! reboots, and streams payload bytes into flash page-by-page under the
//! device's erase/program constraints.
//!
//! # Features
//!
//! - **Zero heap allocation** - All scratch storage statically sized
//! - **Persistent slot table** - Slot headers live on flash and survive reboot
//! - **Constant-cost uninstall** - Removal rewrites one header subsector;
//!   payload subsectors are reclaimed lazily on reinstall
//! - **Streaming installs** - Arbitrary-sized payload chunks are coalesced
//!   into whole-page programs with an explicit flush
//! - **RAM stability** - Reinstalling into a removed slot reuses its RAM
//!   window, keeping runtime addresses stable
//!
//! # Flash layout
//!
//! The reserved region `[kf_start, kf_end)` is divided into equal slots of
//! whole subsectors. Each slot starts with a 32-byte header; the payload
//! begins at offset 32 and unused tail bytes stay erased (`0xFF`):
//!
//! ```text
//! kf_start                                                        kf_end
//! ├────────────── slot 0 ──────────────┬───── slot 1 ─────┬─ ... ─┤
//! │ header (32 B) │ payload    │ 0xFF  │ header │ payload │       │
//! │ status        │            │       │        │         │       │
//! │ nb_subsectors │            │       │        │         │       │
//! │ rom/ram addr  │            │       │        │         │       │
//! │ feature_index │            │       │        │         │       │
//! └───────────────┴────────────┴───────┴────────┴─────────┴───────┘
//! ```
//!
//! A slot is `Used` or `Removed` when its status word matches the configured
//! magic; any other bit pattern (including the erased word) reads as `Free`.
//!
//! # Example
//!
//! ```rust,ignore
//! use flash_features::prelude::*;
//!
//! // Device geometry: 256-byte pages, 4 KiB subsectors.
//! let device = MyQspiFlash::new();
//! let config = StoreConfig::new(4, 0x2400_0000);
//! let mut store: FeatureStore<_, 256, 4096> = FeatureStore::new(device, config)?;
//!
//! // Install a feature: reserve a slot, then stream the payload.
//! let handle = store.allocate(payload.len() as u32, 4096)?;
//! let mut dest = store.feature_address_rom(handle).unwrap();
//! for chunk in payload.chunks(512) {
//!     store.copy_to_rom(dest, chunk)?;
//!     dest += chunk.len() as u32;
//! }
//! store.flush_copy_to_rom()?;
//!
//! // Enumerate what is installed.
//! for index in 0..store.allocated_count() {
//!     let handle = store.feature_handle(index).unwrap();
//!     let rom = store.feature_address_rom(handle).unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![no_std]

#[macro_use]
mod fmt;

pub mod features;

pub mod prelude {
    pub use crate::features::prelude::*;
}
