use crate::features::error::DeviceError;

/// Contract of the external NOR-flash-like device holding the feature region.
///
/// The device is always in one of two modes. In *memory-mapped* mode the
/// reserved region is readable through [`read`](FlashDevice::read); erase and
/// program operations are only legal in *programming* mode, entered with
/// [`disable_memory_mapped`](FlashDevice::disable_memory_mapped). The store
/// brackets every mutation with the mode toggles and restores memory-mapped
/// mode before returning, error paths included.
pub trait FlashDevice {
    /// Largest programmable unit in bytes.
    fn page_size(&self) -> u32;

    /// Smallest erasable unit in bytes.
    fn subsector_size(&self) -> u32;

    /// Start address of the reserved feature region.
    fn kf_start(&self) -> u32;

    /// End address (exclusive) of the reserved feature region.
    fn kf_end(&self) -> u32;

    /// Start address of the page containing `addr`.
    fn page_base(&self, addr: u32) -> u32 {
        addr - (addr % self.page_size())
    }

    /// Start address of the subsector containing `addr`.
    fn subsector_base(&self, addr: u32) -> u32 {
        addr - (addr % self.subsector_size())
    }

    /// Initializes the device interface and enables memory-mapped mode.
    fn startup(&mut self) -> Result<(), DeviceError>;

    /// Erases the subsector containing `addr`. Programming mode only.
    fn erase_subsector(&mut self, addr: u32) -> Result<(), DeviceError>;

    /// Programs `data` starting at the page-aligned address `addr`.
    ///
    /// `data.len()` must not exceed [`page_size`](FlashDevice::page_size).
    /// Programming mode only.
    fn page_write(&mut self, addr: u32, data: &[u8]) -> Result<(), DeviceError>;

    /// Enters memory-mapped mode.
    fn enable_memory_mapped(&mut self) -> Result<(), DeviceError>;

    /// Leaves memory-mapped mode, allowing erase and program operations.
    fn disable_memory_mapped(&mut self) -> Result<(), DeviceError>;

    /// Plain load from the reserved region. Memory-mapped mode only.
    fn read(&self, addr: u32, out: &mut [u8]);
}

/// Programs a region larger than one page by issuing page-sized
/// [`page_write`](FlashDevice::page_write) calls.
///
/// `addr` must be page-aligned.
pub(crate) fn program_chunked<D: FlashDevice>(
    device: &mut D,
    mut addr: u32,
    mut data: &[u8],
) -> Result<(), DeviceError> {
    let page = device.page_size() as usize;
    while !data.is_empty() {
        let chunk = data.len().min(page);
        device.page_write(addr, &data[..chunk])?;
        addr += chunk as u32;
        data = &data[chunk..];
    }
    Ok(())
}

/// Best-effort return to memory-mapped mode at the end of an operation.
///
/// A failure here is logged and swallowed; the caller's own result already
/// reflects the interesting outcome.
pub(crate) fn restore_memory_mapped<D: FlashDevice>(device: &mut D) {
    if device.enable_memory_mapped().is_err() {
        warn!("flash: could not re-enable memory mapped mode");
    }
}
