//! Public façade over the persistent slot table.

use crate::features::config::StoreConfig;
use crate::features::copier::RomCopier;
use crate::features::device::{restore_memory_mapped, FlashDevice};
use crate::features::error::{Error, InitError};
use crate::features::geometry::SlotGeometry;
use crate::features::header::{SlotHeader, SlotStatus, HEADER_LEN};
use crate::features::ram::{RamPool, RamWindow};
use crate::features::table::{self, ScanCache};

/// Flash-backed dynamic feature allocator.
///
/// `PAGE` and `SUBSECTOR` size the internal scratch buffers and must equal
/// the device's page and subsector sizes; construction verifies the match.
/// The authoritative state is the on-flash slot table — the store only
/// caches the installed count and the last installed slot, refreshing both
/// through [`allocated_count`](FeatureStore::allocated_count).
///
/// Handles are the absolute flash addresses of slot headers and stay valid
/// across reboots. All operations leave the device in memory-mapped mode,
/// error paths included.
pub struct FeatureStore<D: FlashDevice, const PAGE: usize, const SUBSECTOR: usize> {
    device: D,
    config: StoreConfig,
    geom: SlotGeometry,
    ram: RamPool,
    cache: ScanCache,
    copier: RomCopier<PAGE>,
    scratch: [u8; SUBSECTOR],
}

impl<D: FlashDevice, const PAGE: usize, const SUBSECTOR: usize> FeatureStore<D, PAGE, SUBSECTOR> {
    /// Starts the device and builds a store over its reserved region.
    ///
    /// # Errors
    ///
    /// [`Error::GeometryMismatch`] when the const buffer capacities disagree
    /// with the device geometry or the region bounds are inverted;
    /// [`Error::BadAlignment`] when the configured RAM alignment is not a
    /// power of two; [`Error::Device`] when the device fails to start.
    pub fn new(mut device: D, config: StoreConfig) -> Result<Self, Error> {
        if !config.ram_align.is_power_of_two() {
            error!("store: ram alignment {} is not a power of two", config.ram_align);
            return Err(Error::BadAlignment);
        }
        device.startup()?;
        if device.page_size() as usize != PAGE
            || device.subsector_size() as usize != SUBSECTOR
            || PAGE < HEADER_LEN
            || device.kf_start() >= device.kf_end()
        {
            error!(
                "store: device geometry (page {}, subsector {}) does not fit the store",
                device.page_size(),
                device.subsector_size()
            );
            return Err(Error::GeometryMismatch);
        }
        let geom = SlotGeometry::new(
            device.kf_start(),
            device.kf_end(),
            device.page_size(),
            device.subsector_size(),
            config.max_features,
        );
        let ram = RamPool::new(config.ram_base, config.ram_size, config.ram_align);
        Ok(Self {
            device,
            config,
            geom,
            ram,
            cache: ScanCache::default(),
            copier: RomCopier::new(),
            scratch: [0; SUBSECTOR],
        })
    }

    /// The underlying flash device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Mutable access to the underlying flash device.
    ///
    /// Callers must leave the device in memory-mapped mode.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// The slot division of the reserved region.
    pub fn geometry(&self) -> &SlotGeometry {
        &self.geom
    }

    /// Counts installed features, repairing stale indices on the way.
    ///
    /// Refreshes the derived caches. After this returns `n`, the installed
    /// features carry the dense indices `0..n` in slot order. A flash
    /// failure during repair ends the walk early and the partial count is
    /// returned.
    pub fn allocated_count(&mut self) -> u32 {
        debug!("allocated_count");
        self.cache = table::scan_and_repair(
            &mut self.device,
            &self.geom,
            self.config.magics,
            &mut self.scratch,
        );
        self.cache.count
    }

    /// Handle of the installed feature with the dense index `index`.
    pub fn feature_handle(&self, index: u32) -> Option<u32> {
        debug!("feature_handle({})", index);
        table::handle_by_index(&self.device, &self.geom, self.config.magics, index)
    }

    /// RAM window address of an installed feature.
    pub fn feature_address_ram(&self, handle: u32) -> Option<u32> {
        debug!("feature_address_ram({:#x})", handle);
        Some(self.used_header(handle)?.ram_address)
    }

    /// Payload address of an installed feature.
    pub fn feature_address_rom(&self, handle: u32) -> Option<u32> {
        debug!("feature_address_rom({:#x})", handle);
        Some(self.used_header(handle)?.rom_address)
    }

    /// Reserves a slot and a RAM window for a feature of the given sizes.
    ///
    /// Erases every subsector the payload will cover and programs the slot
    /// header; payload bytes are streamed in afterwards with
    /// [`copy_to_rom`](FeatureStore::copy_to_rom). Returns the slot handle.
    ///
    /// # Errors
    ///
    /// [`Error::NoFeatureSlots`], [`Error::RomTooLarge`] and
    /// [`Error::RamTooLarge`] reject the request up front;
    /// [`Error::NoFreeSlot`], [`Error::RamExhausted`] and [`Error::Device`]
    /// report allocation failures.
    pub fn allocate(&mut self, size_rom: u32, size_ram: u32) -> Result<u32, Error> {
        debug!("allocate({}, {})", size_rom, size_ram);
        if self.config.max_features == 0 {
            error!("allocate: maximum feature count is configured to zero");
            return Err(Error::NoFeatureSlots);
        }
        let slot_size = self.geom.slot_size();
        if size_rom
            .checked_add(HEADER_LEN as u32)
            .map_or(true, |needed| needed > slot_size)
        {
            error!("allocate: rom size {} exceeds the slot payload capacity", size_rom);
            return Err(Error::RomTooLarge);
        }
        if size_ram > self.ram.size() {
            error!("allocate: ram size {} exceeds the window pool", size_ram);
            return Err(Error::RamTooLarge);
        }

        // Refresh the installed count and the last installed slot.
        self.allocated_count();

        let Some(base) = table::find_vacant(&self.device, &self.geom, self.config.magics) else {
            error!("allocate: every slot in the reserved region is taken");
            return Err(Error::NoFreeSlot);
        };

        let ram_address = self
            .ram
            .place(self.last_window(), self.removed_window(base), size_ram)
            .map_err(|e| {
                error!("allocate: no ram window available for {} bytes", size_ram);
                e
            })?;

        // Erase every subsector the header and payload will cover.
        let rom_address = base + HEADER_LEN as u32;
        let limit = rom_address + size_rom;
        if self.device.disable_memory_mapped().is_err() {
            warn!("allocate: could not leave memory mapped mode");
        }
        let mut nb_subsectors = 0u32;
        let mut addr = base;
        let mut erase_failed = false;
        while addr < limit {
            nb_subsectors += 1;
            if self.device.erase_subsector(addr).is_err() {
                error!("allocate: flash erase {:#x} failed", addr);
                erase_failed = true;
                break;
            }
            addr += self.geom.subsector_size();
        }
        restore_memory_mapped(&mut self.device);
        if erase_failed {
            return Err(Error::Device);
        }

        // One page carries the header; the rest of it stays erased.
        let header = SlotHeader {
            status: self.config.magics.used,
            nb_subsectors,
            rom_address,
            rom_size: size_rom,
            ram_address,
            ram_size: size_ram,
            feature_index: self.cache.count,
        };
        let mut page = [0xFFu8; PAGE];
        header.encode(&mut page[..HEADER_LEN]);

        if self.device.disable_memory_mapped().is_err() {
            warn!("allocate: could not leave memory mapped mode");
        }
        let programmed = self.device.page_write(base, &page);
        restore_memory_mapped(&mut self.device);

        match programmed {
            Ok(()) => {
                self.cache.last_used = Some(base);
                self.cache.count += 1;
                Ok(base)
            }
            Err(_) => {
                error!("allocate: flash write {:#x} failed", base);
                Err(Error::Device)
            }
        }
    }

    /// Uninstalls the feature at `handle`; a no-op for anything else.
    ///
    /// Only the header subsector is erased and reprogrammed with a removed
    /// header, so uninstallation costs the same regardless of the feature
    /// size. Payload subsectors stay dirty until the next allocation picks
    /// this slot and erases what it needs.
    pub fn free(&mut self, handle: u32) {
        debug!("free({:#x})", handle);
        let Some(header) = self.used_header(handle) else {
            return;
        };

        let removed = SlotHeader {
            status: self.config.magics.removed,
            nb_subsectors: 1,
            ..header
        };
        let mut page = [0xFFu8; PAGE];
        removed.encode(&mut page[..HEADER_LEN]);

        if self.device.disable_memory_mapped().is_err() {
            warn!("free: could not leave memory mapped mode");
        }
        let result = self
            .device
            .erase_subsector(handle)
            .and_then(|_| self.device.page_write(handle, &page));
        restore_memory_mapped(&mut self.device);
        if result.is_err() {
            error!("free: flash update of slot {:#x} failed", handle);
        }

        self.cache.count = self.cache.count.saturating_sub(1);
    }

    /// Appends payload bytes to flash at `dest`, buffering partial pages.
    ///
    /// Calls may be contiguous or skip forward within the pending page; a
    /// destination anywhere else commits the pending page first. A single
    /// call must stay inside one feature slot. The stream is only fully
    /// durable after [`flush_copy_to_rom`](FeatureStore::flush_copy_to_rom).
    pub fn copy_to_rom(&mut self, dest: u32, src: &[u8]) -> Result<(), Error> {
        debug!("copy_to_rom({:#x}, {} bytes)", dest, src.len());
        self.copier.append(&mut self.device, &self.geom, dest, src)
    }

    /// Commits a partially-filled pending page, if any.
    pub fn flush_copy_to_rom(&mut self) -> Result<(), Error> {
        debug!("flush_copy_to_rom");
        self.copier.flush(&mut self.device)
    }

    /// Reacts to a feature initialization failure reported by the host.
    ///
    /// Codes meaning the persisted content can never become usable trigger
    /// an automatic [`free`](FeatureStore::free) to reclaim the slot; every
    /// other code only leaves a log trail.
    pub fn on_initialization_error(&mut self, handle: u32, code: InitError) {
        error!(
            "feature {:#x} failed to initialize: {}",
            handle,
            code.as_str()
        );
        if code.uninstalls() {
            error!("uninstalling feature {:#x} to reclaim its slot", handle);
            self.free(handle);
        }
    }

    /// Header of the slot at `handle`, provided it holds an installed
    /// feature.
    fn used_header(&self, handle: u32) -> Option<SlotHeader> {
        if !self.geom.is_slot_base(handle) {
            return None;
        }
        let header = table::read_header(&self.device, handle);
        (header.classify(self.config.magics) == SlotStatus::Used).then_some(header)
    }

    /// RAM window of the last installed feature, if any.
    fn last_window(&self) -> Option<RamWindow> {
        let header = table::read_header(&self.device, self.cache.last_used?);
        Some(RamWindow {
            address: header.ram_address,
            size: header.ram_size,
        })
    }

    /// Recorded RAM window of a candidate slot that held a feature before.
    fn removed_window(&self, base: u32) -> Option<RamWindow> {
        let header = table::read_header(&self.device, base);
        (header.classify(self.config.magics) == SlotStatus::Removed).then_some(RamWindow {
            address: header.ram_address,
            size: header.ram_size,
        })
    }
}
