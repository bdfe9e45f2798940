//! Streaming page-buffered writer for feature payloads.
//!
//! External NOR devices program whole pages, but payloads arrive from the
//! installer in arbitrary-sized slices. The copier accumulates bytes in a
//! single page buffer, programs a page as soon as it is complete, and keeps
//! a trailing partial page *pending* until the caller either continues the
//! stream or commits it with an explicit flush.

use crate::features::device::{restore_memory_mapped, FlashDevice};
use crate::features::error::Error;
use crate::features::geometry::SlotGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingPage {
    page_addr: u32,
    /// Count of valid bytes from the page start; always in `(0, PAGE)`.
    len: usize,
}

/// Page-buffered flash writer. `PAGE` is the device page size in bytes.
pub(crate) struct RomCopier<const PAGE: usize> {
    buf: [u8; PAGE],
    pending: Option<PendingPage>,
}

impl<const PAGE: usize> RomCopier<PAGE> {
    pub(crate) fn new() -> Self {
        Self {
            buf: [0xFF; PAGE],
            pending: None,
        }
    }

    /// Appends `src` to flash starting at the absolute address `dest`.
    ///
    /// A single call must stay inside one feature slot. Contiguous calls
    /// coalesce into the pending page; a non-contiguous destination first
    /// commits the pending page, except that skipping forward *within* the
    /// pending page only advances the valid length (the gap keeps the
    /// buffer's current content, erased or previously read back).
    pub(crate) fn append<D: FlashDevice>(
        &mut self,
        device: &mut D,
        geom: &SlotGeometry,
        dest: u32,
        src: &[u8],
    ) -> Result<(), Error> {
        let size = src.len() as u32;
        if !geom.contains(dest) {
            error!("copy_to_rom: destination {:#x} outside the reserved region", dest);
            return Err(Error::OutsideRegion);
        }
        let end = match dest.checked_add(size) {
            Some(end) if end <= geom.kf_end() => end,
            _ => {
                error!("copy_to_rom: {} bytes from {:#x} extend past the region", size, dest);
                return Err(Error::OutsideRegion);
            }
        };
        if size > geom.slot_size() {
            error!("copy_to_rom: {} bytes exceed the slot size", size);
            return Err(Error::RomTooLarge);
        }
        if geom.slot_size() != 0 && geom.slot_index(dest) != geom.slot_index(end) {
            error!(
                "copy_to_rom: copy {:#x}..{:#x} overlaps another feature slot",
                dest, end
            );
            return Err(Error::CrossesSlotBoundary);
        }
        if src.is_empty() {
            return Ok(());
        }

        // Resolve the pending page against the new destination.
        if let Some(p) = self.pending {
            if dest >= p.page_addr && ((dest - p.page_addr) as usize) < PAGE {
                let offset = (dest - p.page_addr) as usize;
                if offset > p.len {
                    self.pending = Some(PendingPage {
                        page_addr: p.page_addr,
                        len: offset,
                    });
                } else if offset < p.len {
                    self.flush(device)?;
                }
            } else {
                self.flush(device)?;
            }
        }

        if device.disable_memory_mapped().is_err() {
            warn!("copy_to_rom: could not leave memory mapped mode");
        }
        let mut dest = dest;
        let mut src = src;
        while !src.is_empty() {
            let page_addr = geom.page_base(dest);
            let page_off = (dest - page_addr) as usize;
            let chunk = (PAGE - page_off).min(src.len());

            if self.pending.is_none() {
                if page_off != 0 {
                    // Bytes earlier in this page are already on flash; fetch
                    // them so the eventual program keeps them intact.
                    if device.enable_memory_mapped().is_err() {
                        warn!("copy_to_rom: could not enter memory mapped mode");
                    }
                    device.read(page_addr, &mut self.buf);
                    if device.disable_memory_mapped().is_err() {
                        warn!("copy_to_rom: could not leave memory mapped mode");
                    }
                } else if chunk < PAGE {
                    self.buf.fill(0xFF);
                }
            }

            self.buf[page_off..page_off + chunk].copy_from_slice(&src[..chunk]);

            if page_off + chunk == PAGE {
                self.pending = None;
                if device.page_write(page_addr, &self.buf).is_err() {
                    error!("copy_to_rom: flash write {:#x} failed", page_addr);
                    restore_memory_mapped(device);
                    return Err(Error::Device);
                }
            } else {
                self.pending = Some(PendingPage {
                    page_addr,
                    len: page_off + chunk,
                });
            }

            dest += chunk as u32;
            src = &src[chunk..];
        }
        restore_memory_mapped(device);
        Ok(())
    }

    /// Commits the pending partial page, if any.
    pub(crate) fn flush<D: FlashDevice>(&mut self, device: &mut D) -> Result<(), Error> {
        let Some(p) = self.pending.take() else {
            return Ok(());
        };
        if device.disable_memory_mapped().is_err() {
            warn!("flush_copy_to_rom: could not leave memory mapped mode");
        }
        let result = device.page_write(p.page_addr, &self.buf[..p.len]);
        restore_memory_mapped(device);
        result.map_err(|_| {
            error!("flush_copy_to_rom: flash write {:#x} failed", p.page_addr);
            Error::Device
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::test_support::{
        test_geometry, TestFlash, TEST_KF_END, TEST_KF_START, TEST_PAGE, TEST_SLOT_SIZE,
    };

    fn pattern(len: usize) -> [u8; 512] {
        let mut bytes = [0u8; 512];
        for (i, b) in bytes.iter_mut().enumerate().take(len) {
            *b = (i % 251) as u8;
        }
        bytes
    }

    fn copier() -> RomCopier<TEST_PAGE> {
        RomCopier::new()
    }

    #[test]
    fn stream_crossing_a_page_boundary() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();
        let src = pattern(300);
        let dest = TEST_KF_START + 32;

        copier.append(&mut flash, &geom, dest, &src[..300]).unwrap();
        // The first page filled up and was programmed immediately.
        assert_eq!(flash.program_count(), 1);
        copier.flush(&mut flash).unwrap();
        assert_eq!(flash.program_count(), 2);

        assert_eq!(flash.slice(dest, 300), &src[..300]);
        // Tail of the second page is untouched erased flash.
        assert_eq!(
            flash.slice(TEST_KF_START + 256 + 76, 256 - 76),
            &[0xFFu8; 180][..]
        );
        assert!(flash.is_memory_mapped());
    }

    #[test]
    fn contiguous_appends_coalesce_without_intermediate_programs() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();
        let src = pattern(200);
        let dest = TEST_KF_START + 32;

        copier.append(&mut flash, &geom, dest, &src[..100]).unwrap();
        copier
            .append(&mut flash, &geom, dest + 100, &src[100..200])
            .unwrap();
        // 32 + 200 < 256: nothing programmed until the flush.
        assert_eq!(flash.program_count(), 0);

        copier.flush(&mut flash).unwrap();
        assert_eq!(flash.program_count(), 1);
        assert_eq!(flash.slice(dest, 200), &src[..200]);
    }

    #[test]
    fn non_contiguous_append_commits_the_pending_page() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();
        let src = pattern(64);

        copier
            .append(&mut flash, &geom, TEST_KF_START, &src[..64])
            .unwrap();
        // Jump to another page: the pending 64 bytes are committed first.
        copier
            .append(&mut flash, &geom, TEST_KF_START + 512, &src[..64])
            .unwrap();
        assert_eq!(flash.program_count(), 1);
        assert_eq!(flash.slice(TEST_KF_START, 64), &src[..64]);

        copier.flush(&mut flash).unwrap();
        assert_eq!(flash.slice(TEST_KF_START + 512, 64), &src[..64]);
    }

    #[test]
    fn rewind_into_the_pending_page_commits_it_first() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();
        let src = pattern(64);

        copier
            .append(&mut flash, &geom, TEST_KF_START + 32, &src[..64])
            .unwrap();
        assert_eq!(flash.program_count(), 0);
        // Writing below the pending offset cannot extend the buffer.
        copier
            .append(&mut flash, &geom, TEST_KF_START, &src[..16])
            .unwrap();
        assert_eq!(flash.program_count(), 1);
    }

    #[test]
    fn skip_forward_leaves_the_gap_erased() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();
        let src = pattern(32);

        copier
            .append(&mut flash, &geom, TEST_KF_START, &src[..16])
            .unwrap();
        copier
            .append(&mut flash, &geom, TEST_KF_START + 48, &src[..16])
            .unwrap();
        // The skip stayed within the pending page: still nothing programmed.
        assert_eq!(flash.program_count(), 0);
        copier.flush(&mut flash).unwrap();

        assert_eq!(flash.slice(TEST_KF_START, 16), &src[..16]);
        assert_eq!(flash.slice(TEST_KF_START + 16, 32), &[0xFFu8; 32][..]);
        assert_eq!(flash.slice(TEST_KF_START + 48, 16), &src[..16]);
    }

    #[test]
    fn partial_page_append_preserves_flashed_neighbours() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();
        let src = pattern(160);

        copier
            .append(&mut flash, &geom, TEST_KF_START, &src[..100])
            .unwrap();
        copier.flush(&mut flash).unwrap();

        // A fresh stream into the middle of the same page reads the page
        // back, so the first 100 bytes survive the reprogram.
        copier
            .append(&mut flash, &geom, TEST_KF_START + 100, &src[100..160])
            .unwrap();
        copier.flush(&mut flash).unwrap();

        assert_eq!(flash.slice(TEST_KF_START, 160), &src[..160]);
        assert_eq!(flash.slice(TEST_KF_START + 160, 96), &[0xFFu8; 96][..]);
    }

    #[test]
    fn destination_outside_the_region_is_rejected() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();
        let src = pattern(16);

        assert_eq!(
            copier.append(&mut flash, &geom, TEST_KF_START - 4, &src[..16]),
            Err(Error::OutsideRegion)
        );
        assert_eq!(
            copier.append(&mut flash, &geom, TEST_KF_END, &src[..16]),
            Err(Error::OutsideRegion)
        );
        assert_eq!(
            copier.append(&mut flash, &geom, TEST_KF_END - 8, &src[..16]),
            Err(Error::OutsideRegion)
        );
        assert_eq!(flash.program_count(), 0);
    }

    #[test]
    fn copy_crossing_a_slot_boundary_is_rejected() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();
        let src = pattern(16);

        let near_boundary = TEST_KF_START + TEST_SLOT_SIZE as u32 - 6;
        assert_eq!(
            copier.append(&mut flash, &geom, near_boundary, &src[..16]),
            Err(Error::CrossesSlotBoundary)
        );
        // Flash is untouched by a rejected call.
        assert_eq!(flash.program_count(), 0);
        assert_eq!(flash.erase_count(), 0);
    }

    #[test]
    fn empty_append_is_a_no_op() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();

        copier.append(&mut flash, &geom, TEST_KF_START, &[]).unwrap();
        copier.flush(&mut flash).unwrap();
        assert_eq!(flash.program_count(), 0);
    }

    #[test]
    fn flush_without_pending_page_succeeds() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        copier.flush(&mut flash).unwrap();
        assert_eq!(flash.program_count(), 0);
    }

    #[test]
    fn program_failure_keeps_earlier_pages_durable() {
        let mut flash = TestFlash::new();
        let mut copier = copier();
        let geom = test_geometry();
        let src = pattern(512);
        let dest = TEST_KF_START + 256;

        // Second page program fails.
        flash.fail_after(1);
        assert_eq!(
            copier.append(&mut flash, &geom, dest, &src[..512]),
            Err(Error::Device)
        );
        assert_eq!(flash.slice(dest, 256), &src[..256]);
        assert_eq!(flash.slice(dest + 256, 256), &[0xFFu8; 256][..]);
        assert!(flash.is_memory_mapped());
    }
}
