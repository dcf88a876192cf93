//! Resource table: small integer ids standing in for device memory.
//!
//! Commands never carry raw addresses. They name a resource id, and firmware
//! looks the id up in its copy of the table. That copy is a mirror in DRAM
//! the host rewrites on [`ResourceTable::update`]; until then firmware keeps
//! seeing the previous state, so ids added since the last update must not be
//! referenced by submitted commands.
//!
//! The table does no locking of its own. Callers wrap it in a mutex (the
//! device does, and shared-buffer processing reuses that same lock).

use crate::dma::{Access, DeviceMemory, DmaHandle, DmaRegion};
use crate::error::{PvaError, Result};
use crate::submit::Submitter;
use pva_chip::cmd::Command;
use pva_chip::layout::{
    ResourceEntry, CONTEXT_RESOURCE_ID_BASE, DEVICE_RESOURCE_IDS, DEVICE_TABLE_ID,
    RESOURCE_ENTRY_BYTES, RESOURCE_READ_ONLY, RESOURCE_VALID,
};

/// Who frees the memory behind a resource.
#[derive(Debug)]
pub enum Ownership {
    /// The table owns the region and frees it when the id is dropped.
    Owned(DmaRegion),
    /// Someone else owns the region; dropping the id leaves it alone.
    Borrowed(DmaHandle),
}

impl Ownership {
    fn handle(&self) -> &DmaHandle {
        match self {
            Self::Owned(region) => region,
            Self::Borrowed(handle) => handle,
        }
    }
}

/// A live resource table entry.
#[derive(Debug)]
pub struct Resource {
    ownership: Ownership,
    read_only: bool,
}

impl Resource {
    /// Device address.
    pub fn iova(&self) -> u64 {
        self.ownership.handle().iova()
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.ownership.handle().len()
    }

    /// Whether firmware may only read the resource.
    pub const fn read_only(&self) -> bool {
        self.read_only
    }

    /// Access the backing region was mapped with.
    pub fn access(&self) -> Access {
        self.ownership.handle().access()
    }

    /// Whether the table frees the region on drop.
    pub const fn is_owned(&self) -> bool {
        matches!(self.ownership, Ownership::Owned(_))
    }

    /// Non-owning view of the memory.
    pub fn handle(&self) -> DmaHandle {
        self.ownership.handle().clone()
    }

    fn entry(&self) -> ResourceEntry {
        let mut flags = RESOURCE_VALID;
        if self.read_only {
            flags |= RESOURCE_READ_ONLY;
        }
        ResourceEntry {
            iova: self.iova(),
            // Sizes are checked against u32::MAX on insert.
            size: u32::try_from(self.size()).unwrap_or(u32::MAX),
            flags,
        }
    }
}

/// Bounded id → region table with a firmware-visible mirror.
#[derive(Debug)]
pub struct ResourceTable {
    table_id: u32,
    id_base: u32,
    slots: Vec<Option<Resource>>,
    mirror: DmaRegion,
    dirty: bool,
}

impl ResourceTable {
    /// Device-owned table: table id 0, resource ids from 0.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `capacity` is zero or exceeds the device
    /// id range, or an allocation error for the mirror.
    pub fn new(memory: &dyn DeviceMemory, capacity: usize, asid: u32) -> Result<Self> {
        if capacity > DEVICE_RESOURCE_IDS as usize {
            return Err(PvaError::invalid_argument(format!(
                "device resource table capacity {capacity} exceeds {DEVICE_RESOURCE_IDS}"
            )));
        }
        Self::with_id_base(memory, DEVICE_TABLE_ID, 0, capacity, asid)
    }

    /// Per-context table: ids start at [`CONTEXT_RESOURCE_ID_BASE`].
    ///
    /// # Errors
    ///
    /// Same as [`ResourceTable::new`].
    pub fn for_context(
        memory: &dyn DeviceMemory,
        table_id: u32,
        capacity: usize,
        asid: u32,
    ) -> Result<Self> {
        Self::with_id_base(memory, table_id, CONTEXT_RESOURCE_ID_BASE, capacity, asid)
    }

    fn with_id_base(
        memory: &dyn DeviceMemory,
        table_id: u32,
        id_base: u32,
        capacity: usize,
        asid: u32,
    ) -> Result<Self> {
        let fits = u32::try_from(capacity)
            .ok()
            .and_then(|cap| id_base.checked_add(cap))
            .is_some();
        if capacity == 0 || !fits {
            return Err(PvaError::invalid_argument(format!(
                "resource table capacity {capacity}"
            )));
        }

        let mirror = memory.alloc_map(capacity * RESOURCE_ENTRY_BYTES, Access::ReadOnly, asid)?;
        tracing::debug!(
            "Resource table {table_id}: {capacity} entries, mirror at {:#x}",
            mirror.iova()
        );

        Ok(Self {
            table_id,
            id_base,
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            mirror,
            dirty: true,
        })
    }

    /// Register an owned region, returning its id.
    ///
    /// # Errors
    ///
    /// Returns `OutOfResources` if the table is full and `InvalidArgument`
    /// for an empty region, a region larger than 4 GiB, or a writable
    /// resource over a read-only mapping. The region is freed on error.
    pub fn add(&mut self, region: DmaRegion, read_only: bool) -> Result<u32> {
        self.insert(Ownership::Owned(region), read_only)
    }

    /// Register memory owned elsewhere, returning its id.
    ///
    /// # Errors
    ///
    /// Same as [`ResourceTable::add`].
    pub fn add_borrowed(&mut self, handle: DmaHandle, read_only: bool) -> Result<u32> {
        self.insert(Ownership::Borrowed(handle), read_only)
    }

    fn insert(&mut self, ownership: Ownership, read_only: bool) -> Result<u32> {
        let handle = ownership.handle();
        if handle.is_empty() {
            return Err(PvaError::invalid_argument("empty resource region"));
        }
        if u32::try_from(handle.len()).is_err() {
            return Err(PvaError::invalid_argument(format!(
                "resource of {} bytes does not fit the table",
                handle.len()
            )));
        }
        if handle.access() == Access::ReadOnly && !read_only {
            return Err(PvaError::invalid_argument(
                "writable resource over a read-only mapping",
            ));
        }

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| {
                PvaError::out_of_resources(format!("resource table {}", self.table_id))
            })?;
        let id = self.id_for(index);
        tracing::debug!(
            "Resource {id} -> {:#x} ({} bytes, {})",
            handle.iova(),
            handle.len(),
            if read_only { "ro" } else { "rw" }
        );
        self.slots[index] = Some(Resource {
            ownership,
            read_only,
        });
        self.dirty = true;
        Ok(id)
    }

    #[allow(clippy::cast_possible_truncation)] // capacity fits u32 (checked in new)
    fn id_for(&self, index: usize) -> u32 {
        self.id_base + index as u32
    }

    fn index_of(&self, id: u32) -> Option<usize> {
        let index = usize::try_from(id.checked_sub(self.id_base)?).ok()?;
        (index < self.slots.len()).then_some(index)
    }

    /// Look up a live resource.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is not live in this table.
    pub fn get(&self, id: u32) -> Result<&Resource> {
        self.index_of(id)
            .and_then(|index| self.slots[index].as_ref())
            .ok_or_else(|| self.not_found(id))
    }

    /// Whether `id` is live in this table.
    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_ok()
    }

    /// Remove `id`, freeing the region if the table owned it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is not live in this table.
    pub fn remove(&mut self, id: u32) -> Result<()> {
        let resource = self
            .index_of(id)
            .and_then(|index| self.slots[index].take())
            .ok_or_else(|| self.not_found(id))?;
        self.dirty = true;
        match resource.ownership {
            Ownership::Owned(region) => {
                tracing::debug!("Resource {id} dropped, freeing {:#x}", region.iova());
            }
            Ownership::Borrowed(handle) => {
                tracing::debug!("Resource {id} dropped (borrowed {:#x})", handle.iova());
            }
        }
        Ok(())
    }

    fn not_found(&self, id: u32) -> PvaError {
        PvaError::not_found(format!("resource {id} in table {}", self.table_id))
    }

    /// Rewrite the firmware mirror from the host entries.
    ///
    /// Firmware only re-reads it on `UpdateResourceTable` (or at bootstrap).
    pub fn sync_mirror(&mut self) {
        for (index, slot) in self.slots.iter().enumerate() {
            let entry = slot.as_ref().map(Resource::entry).unwrap_or_default();
            self.mirror
                .write_bytes(index * RESOURCE_ENTRY_BYTES, &entry.encode());
        }
        self.dirty = false;
    }

    /// Push the current mapping to firmware and wait until it has been read.
    ///
    /// # Errors
    ///
    /// Propagates submission errors; the table stays marked dirty.
    pub fn update(&mut self, submitter: &Submitter) -> Result<()> {
        let command = self.prepare_update();
        if let Err(e) = submitter.submit(&command) {
            self.mark_dirty();
            return Err(e);
        }
        tracing::debug!("Resource table {} synchronised", self.table_id);
        Ok(())
    }

    /// Write the mirror and encode the `UpdateResourceTable` command for it.
    ///
    /// Lets a caller drop its lock on the table before submitting, so event
    /// processing is not blocked while firmware reads the mirror.
    pub fn prepare_update(&mut self) -> Vec<u8> {
        self.sync_mirror();
        Command::UpdateResourceTable {
            table_id: self.table_id,
        }
        .encode()
    }

    /// Flag the mirror as stale, e.g. after a failed update submission.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether host entries changed since the mirror was last written.
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Table id firmware knows this table by.
    pub const fn table_id(&self) -> u32 {
        self.table_id
    }

    /// First resource id of this table.
    pub const fn id_base(&self) -> u32 {
        self.id_base
    }

    /// Maximum number of live entries.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| self.id_for(index))
    }

    /// Device address of the mirror.
    pub fn mirror_iova(&self) -> u64 {
        self.mirror.iova()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDmaAllocator;

    fn region(mem: &HostDmaAllocator, size: usize) -> DmaRegion {
        mem.alloc_map(size, Access::ReadWrite, 0).unwrap()
    }

    #[test]
    fn test_capacity_four_scenario() {
        let mem = HostDmaAllocator::new();
        let mut table = ResourceTable::new(&mem, 4, 0).unwrap();

        let ids: Vec<u32> = (0..3)
            .map(|_| table.add(region(&mem, 4096), false).unwrap())
            .collect();
        assert_eq!(ids, [0, 1, 2]);
        assert_eq!(table.add(region(&mem, 4096), false).unwrap(), 3);

        let err = table.add(region(&mem, 4096), false).unwrap_err();
        assert!(matches!(err, PvaError::OutOfResources { .. }));

        table.remove(1).unwrap();
        assert_eq!(table.add(region(&mem, 4096), false).unwrap(), 1);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_get_round_trip() {
        let mem = HostDmaAllocator::new();
        let mut table = ResourceTable::new(&mem, 2, 0).unwrap();
        let r = mem.alloc_map(8192, Access::ReadOnly, 0).unwrap();
        let iova = r.iova();

        let id = table.add(r, true).unwrap();
        let got = table.get(id).unwrap();
        assert_eq!(got.iova(), iova);
        assert_eq!(got.size(), 8192);
        assert!(got.read_only());
        assert_eq!(got.access(), Access::ReadOnly);
        assert!(got.is_owned());
    }

    #[test]
    fn test_drop_unknown_is_not_found() {
        let mem = HostDmaAllocator::new();
        let mut table = ResourceTable::new(&mem, 2, 0).unwrap();
        assert!(matches!(table.remove(0), Err(PvaError::NotFound { .. })));
        assert!(matches!(table.remove(999), Err(PvaError::NotFound { .. })));
        assert!(matches!(table.get(1), Err(PvaError::NotFound { .. })));
    }

    #[test]
    fn test_drop_frees_only_owned() {
        let mem = HostDmaAllocator::new();
        let mut table = ResourceTable::new(&mem, 4, 0).unwrap();
        let baseline = mem.live_regions();

        let owned = table.add(region(&mem, 64), false).unwrap();
        let kept = region(&mem, 64);
        let borrowed = table.add_borrowed(kept.handle(), false).unwrap();
        assert_eq!(mem.live_regions(), baseline + 2);

        table.remove(owned).unwrap();
        assert_eq!(mem.live_regions(), baseline + 1);
        table.remove(borrowed).unwrap();
        assert_eq!(mem.live_regions(), baseline + 1);
        drop(kept);
        assert_eq!(mem.live_regions(), baseline);
    }

    #[test]
    fn test_rejects_empty_and_writable_read_only() {
        let mem = HostDmaAllocator::new();
        let mut table = ResourceTable::new(&mem, 4, 0).unwrap();
        let r = region(&mem, 64);

        let empty = r.slice(0, 0).unwrap();
        let err = table.add_borrowed(empty, false).unwrap_err();
        assert!(matches!(err, PvaError::InvalidArgument { .. }));

        let ro = mem.alloc_map(64, Access::ReadOnly, 0).unwrap();
        let err = table.add(ro, false).unwrap_err();
        assert!(matches!(err, PvaError::InvalidArgument { .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_context_ids_start_after_device_range() {
        let mem = HostDmaAllocator::new();
        let mut table = ResourceTable::for_context(&mem, 3, 8, 0).unwrap();
        let id = table.add(region(&mem, 64), false).unwrap();
        assert_eq!(id, CONTEXT_RESOURCE_ID_BASE);
        assert!(matches!(table.remove(0), Err(PvaError::NotFound { .. })));
    }

    #[test]
    fn test_device_capacity_bounded() {
        let mem = HostDmaAllocator::new();
        assert!(ResourceTable::new(&mem, 0, 0).is_err());
        assert!(ResourceTable::new(&mem, DEVICE_RESOURCE_IDS as usize + 1, 0).is_err());
    }

    #[test]
    fn test_mirror_tracks_entries() {
        let mem = HostDmaAllocator::new();
        let mut table = ResourceTable::new(&mem, 2, 0).unwrap();
        let r = region(&mem, 128);
        let iova = r.iova();
        let id = table.add(r, false).unwrap();
        assert!(table.is_dirty());

        table.sync_mirror();
        assert!(!table.is_dirty());
        let mirror = mem.resolve(table.mirror_iova(), 2 * RESOURCE_ENTRY_BYTES).unwrap();
        let mut raw = [0u8; RESOURCE_ENTRY_BYTES];
        mirror.read_bytes(0, &mut raw);
        let entry = ResourceEntry::decode(&raw);
        assert!(entry.is_valid() && !entry.is_read_only());
        assert_eq!((entry.iova, entry.size), (iova, 128));

        table.remove(id).unwrap();
        table.sync_mirror();
        mirror.read_bytes(0, &mut raw);
        assert!(!ResourceEntry::decode(&raw).is_valid());
    }

    #[test]
    fn test_ids_stay_unique_under_churn() {
        let mem = HostDmaAllocator::new();
        let mut table = ResourceTable::new(&mem, 6, 0).unwrap();
        let mut live: Vec<u32> = Vec::new();
        let mut seed = 0x2545_F491_u32;

        for _ in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 && !live.is_empty() {
                let id = live.swap_remove(seed as usize % live.len());
                table.remove(id).unwrap();
            } else {
                match table.add(region(&mem, 64), false) {
                    Ok(id) => {
                        assert!(!live.contains(&id), "id {id} handed out twice");
                        live.push(id);
                    }
                    Err(PvaError::OutOfResources { .. }) => assert_eq!(live.len(), 6),
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            assert!(table.len() <= table.capacity());
            assert_eq!(table.len(), live.len());
        }
    }
}
