//! Walks over the persisted slot table: counting, index repair, vacancy
//! search and handle lookup.

use crate::features::config::StatusMagics;
use crate::features::device::{program_chunked, restore_memory_mapped, FlashDevice};
use crate::features::geometry::SlotGeometry;
use crate::features::header::{SlotHeader, SlotStatus, HEADER_LEN};

/// Derived slot-table state rebuilt by [`scan_and_repair`].
///
/// `count` is the number of installed features; `last_used` the base address
/// of the highest-indexed one, used to continue RAM bump allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ScanCache {
    pub count: u32,
    pub last_used: Option<u32>,
}

/// Reads and decodes the header of the slot at `slot_addr`.
pub(crate) fn read_header<D: FlashDevice>(device: &D, slot_addr: u32) -> SlotHeader {
    let mut bytes = [0u8; HEADER_LEN];
    device.read(slot_addr, &mut bytes);
    SlotHeader::decode(&bytes)
}

/// Base addresses of all whole slots, in table order.
pub(crate) fn slot_bases(geom: &SlotGeometry) -> impl Iterator<Item = u32> + '_ {
    (0..geom.slot_count()).map(move |k| geom.slot_base(k))
}

/// Counts installed features and makes their indices dense in scan order.
///
/// Walks slots from the start of the region, stopping at the first free
/// slot. A used slot whose persisted index does not equal its rank among
/// used slots is repaired in place: the slot's first subsector is copied
/// into `scratch`, the index word patched, and the subsector erased and
/// reprogrammed. A flash failure during repair ends the walk; the returned
/// cache reflects the slots accepted up to that point.
pub(crate) fn scan_and_repair<D: FlashDevice>(
    device: &mut D,
    geom: &SlotGeometry,
    magics: StatusMagics,
    scratch: &mut [u8],
) -> ScanCache {
    let mut cache = ScanCache::default();
    for base in slot_bases(geom) {
        let header = read_header(device, base);
        match header.classify(magics) {
            SlotStatus::Used => {
                if header.feature_index != cache.count
                    && repair_index(device, geom, base, cache.count, scratch).is_err()
                {
                    error!("count: index repair failed for slot {:#x}", base);
                    break;
                }
                cache.last_used = Some(base);
                cache.count += 1;
            }
            SlotStatus::Removed => {}
            SlotStatus::Free => break,
        }
    }
    cache
}

/// Rewrites the slot's first subsector with its feature index set to
/// `index`, preserving every other byte.
fn repair_index<D: FlashDevice>(
    device: &mut D,
    geom: &SlotGeometry,
    base: u32,
    index: u32,
    scratch: &mut [u8],
) -> Result<(), crate::features::error::DeviceError> {
    let scratch = &mut scratch[..geom.subsector_size() as usize];
    device.read(base, scratch);
    SlotHeader::patch_index(scratch, index);

    if device.disable_memory_mapped().is_err() {
        warn!("count: could not leave memory mapped mode");
    }
    let result = device
        .erase_subsector(base)
        .and_then(|_| program_chunked(device, base, scratch));
    restore_memory_mapped(device);
    result
}

/// First slot not holding an installed feature (removed or free), if any.
pub(crate) fn find_vacant<D: FlashDevice>(
    device: &D,
    geom: &SlotGeometry,
    magics: StatusMagics,
) -> Option<u32> {
    slot_bases(geom).find(|&base| read_header(device, base).classify(magics) != SlotStatus::Used)
}

/// Base address of the installed feature with the given dense index.
///
/// Linear scan in table order, ending at the first free slot.
pub(crate) fn handle_by_index<D: FlashDevice>(
    device: &D,
    geom: &SlotGeometry,
    magics: StatusMagics,
    index: u32,
) -> Option<u32> {
    for base in slot_bases(geom) {
        let header = read_header(device, base);
        match header.classify(magics) {
            SlotStatus::Used => {
                if header.feature_index == index {
                    return Some(base);
                }
            }
            SlotStatus::Removed => {}
            SlotStatus::Free => break,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::test_support::{
        test_geometry, test_magics, TestFlash, TEST_KF_START, TEST_SLOT_SIZE, TEST_SUBSECTOR,
    };

    fn used_header(index: u32) -> SlotHeader {
        let base = TEST_KF_START + index * TEST_SLOT_SIZE as u32;
        SlotHeader {
            status: test_magics().used,
            nb_subsectors: 1,
            rom_address: base + HEADER_LEN as u32,
            rom_size: 100,
            ram_address: 0x2000_0000 + index * 0x100,
            ram_size: 0x100,
            feature_index: index,
        }
    }

    fn plant(flash: &mut TestFlash, slot: u32, header: SlotHeader) {
        let mut bytes = [0xFFu8; HEADER_LEN];
        header.encode(&mut bytes);
        flash.preload(TEST_KF_START + slot * TEST_SLOT_SIZE as u32, &bytes);
    }

    #[test]
    fn empty_table_counts_zero() {
        let mut flash = TestFlash::new();
        let mut scratch = [0u8; TEST_SUBSECTOR];
        let cache = scan_and_repair(&mut flash, &test_geometry(), test_magics(), &mut scratch);
        assert_eq!(cache, ScanCache::default());
    }

    #[test]
    fn scan_stops_at_the_first_free_slot() {
        let mut flash = TestFlash::new();
        plant(&mut flash, 0, used_header(0));
        // Slot 1 left erased; the feature in slot 2 is unreachable behind
        // the free slot.
        plant(&mut flash, 2, used_header(2));

        let mut scratch = [0u8; TEST_SUBSECTOR];
        let cache = scan_and_repair(&mut flash, &test_geometry(), test_magics(), &mut scratch);
        assert_eq!(cache.count, 1);
        assert_eq!(cache.last_used, Some(TEST_KF_START));
    }

    #[test]
    fn removed_slots_are_skipped_but_not_counted() {
        let mut flash = TestFlash::new();
        let mut removed = used_header(0);
        removed.status = test_magics().removed;
        plant(&mut flash, 0, removed);
        let mut survivor = used_header(1);
        survivor.feature_index = 0;
        plant(&mut flash, 1, survivor);

        let mut scratch = [0u8; TEST_SUBSECTOR];
        let cache = scan_and_repair(&mut flash, &test_geometry(), test_magics(), &mut scratch);
        assert_eq!(cache.count, 1);
        assert_eq!(cache.last_used, Some(TEST_KF_START + TEST_SLOT_SIZE as u32));
    }

    #[test]
    fn sparse_indices_are_repaired_on_flash() {
        let mut flash = TestFlash::new();
        let mut removed = used_header(0);
        removed.status = test_magics().removed;
        plant(&mut flash, 0, removed);
        // Survivor still carries index 1 after its predecessor was removed.
        plant(&mut flash, 1, used_header(1));

        let mut scratch = [0u8; TEST_SUBSECTOR];
        let cache = scan_and_repair(&mut flash, &test_geometry(), test_magics(), &mut scratch);
        assert_eq!(cache.count, 1);

        let header = read_header(&flash, TEST_KF_START + TEST_SLOT_SIZE as u32);
        assert_eq!(header.feature_index, 0);
        assert_eq!(header.rom_size, 100);
        assert_eq!(header.classify(test_magics()), SlotStatus::Used);
    }

    #[test]
    fn repair_preserves_payload_bytes_in_the_first_subsector() {
        let mut flash = TestFlash::new();
        let mut removed = used_header(0);
        removed.status = test_magics().removed;
        plant(&mut flash, 0, removed);
        plant(&mut flash, 1, used_header(1));
        let payload_addr = TEST_KF_START + TEST_SLOT_SIZE as u32 + HEADER_LEN as u32;
        flash.preload(payload_addr, &[0xAB; 64]);

        let mut scratch = [0u8; TEST_SUBSECTOR];
        scan_and_repair(&mut flash, &test_geometry(), test_magics(), &mut scratch);

        assert_eq!(flash.slice(payload_addr, 64), &[0xAB; 64]);
    }

    #[test]
    fn repair_failure_yields_the_partial_count() {
        let mut flash = TestFlash::new();
        plant(&mut flash, 0, used_header(0));
        let mut stale = used_header(1);
        stale.feature_index = 5;
        plant(&mut flash, 1, stale);

        // First mutation (the repair erase) fails.
        flash.fail_after(0);
        let mut scratch = [0u8; TEST_SUBSECTOR];
        let cache = scan_and_repair(&mut flash, &test_geometry(), test_magics(), &mut scratch);
        assert_eq!(cache.count, 1);
        assert_eq!(cache.last_used, Some(TEST_KF_START));
        assert!(flash.is_memory_mapped());
    }

    #[test]
    fn find_vacant_prefers_the_first_non_used_slot() {
        let mut flash = TestFlash::new();
        plant(&mut flash, 0, used_header(0));
        let mut removed = used_header(1);
        removed.status = test_magics().removed;
        plant(&mut flash, 1, removed);

        let geom = test_geometry();
        assert_eq!(
            find_vacant(&flash, &geom, test_magics()),
            Some(TEST_KF_START + TEST_SLOT_SIZE as u32)
        );
    }

    #[test]
    fn find_vacant_fails_when_every_slot_is_used() {
        let mut flash = TestFlash::new();
        for k in 0..4 {
            plant(&mut flash, k, used_header(k));
        }
        assert_eq!(find_vacant(&flash, &test_geometry(), test_magics()), None);
    }

    #[test]
    fn handle_lookup_matches_the_dense_index() {
        let mut flash = TestFlash::new();
        let mut removed = used_header(0);
        removed.status = test_magics().removed;
        plant(&mut flash, 0, removed);
        let mut first = used_header(1);
        first.feature_index = 0;
        plant(&mut flash, 1, first);
        let mut second = used_header(2);
        second.feature_index = 1;
        plant(&mut flash, 2, second);

        let geom = test_geometry();
        assert_eq!(
            handle_by_index(&flash, &geom, test_magics(), 0),
            Some(TEST_KF_START + TEST_SLOT_SIZE as u32)
        );
        assert_eq!(
            handle_by_index(&flash, &geom, test_magics(), 1),
            Some(TEST_KF_START + 2 * TEST_SLOT_SIZE as u32)
        );
        assert_eq!(handle_by_index(&flash, &geom, test_magics(), 2), None);
    }

    #[test]
    fn handle_lookup_stops_at_the_first_free_slot() {
        let mut flash = TestFlash::new();
        // A feature stranded behind a free slot is invisible.
        plant(&mut flash, 1, used_header(1));
        assert_eq!(handle_by_index(&flash, &test_geometry(), test_magics(), 1), None);
    }
}
