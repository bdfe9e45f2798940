//! Test support utilities - only compiled in test builds.

use crate::features::config::{StatusMagics, StoreConfig};
use crate::features::device::FlashDevice;
use crate::features::error::DeviceError;
use crate::features::geometry::SlotGeometry;
use crate::features::store::FeatureStore;

/// Standard test geometry: 64 KiB region, 256-byte pages, 4 KiB subsectors,
/// at most 4 features, so each slot spans 4 subsectors.
pub(crate) const TEST_PAGE: usize = 256;
pub(crate) const TEST_SUBSECTOR: usize = 4096;
pub(crate) const TEST_KF_SIZE: usize = 16 * TEST_SUBSECTOR;
pub(crate) const TEST_KF_START: u32 = 0x9000_0000;
pub(crate) const TEST_KF_END: u32 = TEST_KF_START + TEST_KF_SIZE as u32;
pub(crate) const TEST_SLOT_SIZE: usize = 4 * TEST_SUBSECTOR;
pub(crate) const TEST_MAX_FEATURES: u32 = 4;
pub(crate) const TEST_RAM_BASE: u32 = 0x2000_0000;
pub(crate) const TEST_RAM_SIZE: u32 = 4096;

/// In-memory NOR flash model.
///
/// Programming can only clear bits (bytes are AND-merged) and erasing sets a
/// whole subsector back to `0xFF`, like the real device. Mode discipline and
/// page alignment are enforced with panics so a test fails loudly when an
/// operation runs in the wrong mode. Mutations can be made to fail after a
/// countdown to exercise error paths.
pub(crate) struct MockFlash {
    mem: [u8; TEST_KF_SIZE],
    mapped: bool,
    erase_count: u32,
    program_count: u32,
    fail_after: Option<u32>,
}

pub(crate) type TestFlash = MockFlash;
pub(crate) type TestStore = FeatureStore<TestFlash, TEST_PAGE, TEST_SUBSECTOR>;

impl MockFlash {
    /// A fully erased device, up in memory-mapped mode.
    pub(crate) fn new() -> Self {
        Self {
            mem: [0xFF; TEST_KF_SIZE],
            mapped: true,
            erase_count: 0,
            program_count: 0,
            fail_after: None,
        }
    }

    /// Makes the next mutation after `ok_count` successful ones fail, and
    /// every mutation after that.
    pub(crate) fn fail_after(&mut self, ok_count: u32) {
        self.fail_after = Some(ok_count);
    }

    pub(crate) fn erase_count(&self) -> u32 {
        self.erase_count
    }

    pub(crate) fn program_count(&self) -> u32 {
        self.program_count
    }

    pub(crate) fn is_memory_mapped(&self) -> bool {
        self.mapped
    }

    /// Plants raw bytes in the backing memory, bypassing mode and NOR
    /// semantics. Test setup only.
    pub(crate) fn preload(&mut self, addr: u32, bytes: &[u8]) {
        let offset = self.offset(addr, bytes.len());
        self.mem[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Raw view of the backing memory for assertions.
    pub(crate) fn slice(&self, addr: u32, len: usize) -> &[u8] {
        let offset = self.offset(addr, len);
        &self.mem[offset..offset + len]
    }

    fn offset(&self, addr: u32, len: usize) -> usize {
        assert!(
            addr >= TEST_KF_START && addr as usize + len <= TEST_KF_END as usize,
            "access outside the reserved region"
        );
        (addr - TEST_KF_START) as usize
    }

    fn take_fault(&mut self) -> bool {
        match self.fail_after {
            Some(0) => true,
            Some(remaining) => {
                self.fail_after = Some(remaining - 1);
                false
            }
            None => false,
        }
    }
}

impl FlashDevice for MockFlash {
    fn page_size(&self) -> u32 {
        TEST_PAGE as u32
    }

    fn subsector_size(&self) -> u32 {
        TEST_SUBSECTOR as u32
    }

    fn kf_start(&self) -> u32 {
        TEST_KF_START
    }

    fn kf_end(&self) -> u32 {
        TEST_KF_END
    }

    fn startup(&mut self) -> Result<(), DeviceError> {
        self.mapped = true;
        Ok(())
    }

    fn erase_subsector(&mut self, addr: u32) -> Result<(), DeviceError> {
        assert!(!self.mapped, "erase requires programming mode");
        if self.take_fault() {
            return Err(DeviceError);
        }
        let base = self.offset(self.subsector_base(addr), TEST_SUBSECTOR);
        self.mem[base..base + TEST_SUBSECTOR].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn page_write(&mut self, addr: u32, data: &[u8]) -> Result<(), DeviceError> {
        assert!(!self.mapped, "page_write requires programming mode");
        assert_eq!(addr % TEST_PAGE as u32, 0, "page_write address must be page-aligned");
        assert!(data.len() <= TEST_PAGE, "page_write must not exceed one page");
        if self.take_fault() {
            return Err(DeviceError);
        }
        let offset = self.offset(addr, data.len());
        // NOR programming can only clear bits.
        for (cell, byte) in self.mem[offset..offset + data.len()].iter_mut().zip(data) {
            *cell &= byte;
        }
        self.program_count += 1;
        Ok(())
    }

    fn enable_memory_mapped(&mut self) -> Result<(), DeviceError> {
        self.mapped = true;
        Ok(())
    }

    fn disable_memory_mapped(&mut self) -> Result<(), DeviceError> {
        self.mapped = false;
        Ok(())
    }

    fn read(&self, addr: u32, out: &mut [u8]) {
        assert!(self.mapped, "read requires memory mapped mode");
        out.copy_from_slice(self.slice(addr, out.len()));
    }
}

pub(crate) fn test_magics() -> StatusMagics {
    StatusMagics::default()
}

pub(crate) fn test_geometry() -> SlotGeometry {
    SlotGeometry::new(
        TEST_KF_START,
        TEST_KF_END,
        TEST_PAGE as u32,
        TEST_SUBSECTOR as u32,
        TEST_MAX_FEATURES,
    )
}

pub(crate) fn test_flash() -> TestFlash {
    MockFlash::new()
}

pub(crate) fn test_config() -> StoreConfig {
    StoreConfig::new(TEST_MAX_FEATURES, TEST_RAM_BASE).with_ram_window(TEST_RAM_SIZE, 256)
}

pub(crate) fn test_store() -> TestStore {
    FeatureStore::new(test_flash(), test_config()).unwrap()
}
