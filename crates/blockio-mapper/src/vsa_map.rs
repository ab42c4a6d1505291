//! Per-volume VSA map
//!
//! Maps a volume-relative block address to the virtual stripe address
//! it was last written to. Persisted as a header followed by a dense
//! entry table; flushes rewrite the header plus only the logical pages
//! dirtied since the last flush.
//!
//! File image:
//!
//! ```text
//! header (64 B): sig(4) version(8) entry_count(8)
//! entries:       12 B per block: stripe(4) offset(8)
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blockio_common::{ArrayId, BlkAddr, MediaType, VirtualBlkAddr, VirtualBlks, VolumeId, UNMAP_VSA};
use blockio_metafs::{MetaFile, MetaIoManager};
use bytes::{Buf, BufMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{MapperError, MapperResult};

/// Magic for a VSA map file ("VSMP")
const VSAMAP_SIGNATURE: u32 = 0x5653_4D50;
const HEADER_SIZE: u64 = 64;
const ENTRY_SIZE: u64 = 12;

/// One volume's block-to-VSA table.
pub struct VsaMap {
    volume_id: VolumeId,
    file: Arc<MetaFile>,
    io: Arc<MetaIoManager>,
    entries: RwLock<Vec<VirtualBlkAddr>>,
    dirty_pages: Mutex<BTreeSet<u64>>,
    version: AtomicU64,
}

impl VsaMap {
    /// File name within the array directory.
    #[must_use]
    pub fn file_name(volume_id: VolumeId) -> String {
        format!("vsamap.{volume_id}.map")
    }

    #[must_use]
    pub fn path(dir: &Path, volume_id: VolumeId) -> PathBuf {
        dir.join(Self::file_name(volume_id))
    }

    fn file_bytes(block_count: u64) -> u64 {
        HEADER_SIZE + ENTRY_SIZE * block_count
    }

    /// Create the backing file and persist an all-unmapped table.
    pub async fn create(
        dir: &Path,
        volume_id: VolumeId,
        array_id: ArrayId,
        block_count: u64,
        io: Arc<MetaIoManager>,
    ) -> MapperResult<Arc<Self>> {
        let bytes = Self::file_bytes(block_count);
        let pages = io.pages_needed(bytes).max(1);
        let file = Arc::new(MetaFile::create(
            Self::path(dir, volume_id),
            volume_id,
            array_id,
            MediaType::Ssd,
            io.page_size(),
            pages,
        )?);

        let map = Arc::new(Self {
            volume_id,
            file,
            io,
            entries: RwLock::new(vec![UNMAP_VSA; block_count as usize]),
            dirty_pages: Mutex::new(BTreeSet::new()),
            version: AtomicU64::new(0),
        });
        map.flush_full().await?;
        info!(volume_id, block_count, "vsa map created");
        Ok(map)
    }

    /// Open and read an existing map.
    pub async fn load(
        dir: &Path,
        volume_id: VolumeId,
        array_id: ArrayId,
        io: Arc<MetaIoManager>,
    ) -> MapperResult<Arc<Self>> {
        let file = Arc::new(MetaFile::open(
            Self::path(dir, volume_id),
            volume_id,
            array_id,
            MediaType::Ssd,
            io.page_size(),
        )?);

        let mut header = vec![0u8; HEADER_SIZE as usize];
        io.read(&file, 0, &mut header).await?;
        let mut cursor = &header[..];
        let sig = cursor.get_u32_le();
        if sig != VSAMAP_SIGNATURE {
            return Err(MapperError::CorruptMap {
                volume_id,
                detail: format!("signature {sig:#010x}"),
            });
        }
        let version = cursor.get_u64_le();
        let entry_count = cursor.get_u64_le();

        let mut table = vec![0u8; (ENTRY_SIZE * entry_count) as usize];
        io.read(&file, HEADER_SIZE, &mut table).await?;
        let mut cursor = &table[..];
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let stripe_id = cursor.get_u32_le();
            let offset = cursor.get_u64_le();
            entries.push(VirtualBlkAddr { stripe_id, offset });
        }

        debug!(volume_id, version, entry_count, "vsa map loaded");
        Ok(Arc::new(Self {
            volume_id,
            file,
            io,
            entries: RwLock::new(entries),
            dirty_pages: Mutex::new(BTreeSet::new()),
            version: AtomicU64::new(version),
        }))
    }

    #[must_use]
    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.entries.read().len() as u64
    }

    #[must_use]
    pub fn stored_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn check_run(&self, start_rba: BlkAddr, count: u64) -> MapperResult<()> {
        let len = self.entries.read().len() as u64;
        if start_rba + count > len {
            return Err(MapperError::InvalidAddress(format!(
                "volume {}: blocks [{}, {}) beyond size {}",
                self.volume_id,
                start_rba,
                start_rba + count,
                len
            )));
        }
        Ok(())
    }

    pub fn get_vsa(&self, rba: BlkAddr) -> MapperResult<VirtualBlkAddr> {
        self.check_run(rba, 1)?;
        Ok(self.entries.read()[rba as usize])
    }

    fn mark_dirty(&self, rba: BlkAddr) {
        let chunk = self.io.data_chunk_size() as u64;
        let start = HEADER_SIZE + rba * ENTRY_SIZE;
        let mut dirty = self.dirty_pages.lock();
        dirty.insert(start / chunk);
        dirty.insert((start + ENTRY_SIZE - 1) / chunk);
    }

    /// Record a run of blocks written to consecutive offsets of one
    /// stripe.
    pub fn set_vsas(&self, start_rba: BlkAddr, blks: VirtualBlks) -> MapperResult<()> {
        self.check_run(start_rba, u64::from(blks.num_blks))?;
        let mut entries = self.entries.write();
        for i in 0..u64::from(blks.num_blks) {
            entries[(start_rba + i) as usize] = VirtualBlkAddr {
                stripe_id: blks.start_vsa.stripe_id,
                offset: blks.start_vsa.offset + i,
            };
        }
        drop(entries);
        for i in 0..u64::from(blks.num_blks) {
            self.mark_dirty(start_rba + i);
        }
        Ok(())
    }

    /// Unmap every block; used on volume delete.
    pub fn invalidate_all_blocks(&self) {
        let mut entries = self.entries.write();
        let count = entries.len() as u64;
        for entry in entries.iter_mut() {
            *entry = UNMAP_VSA;
        }
        drop(entries);
        let chunk = self.io.data_chunk_size() as u64;
        let last_page = (Self::file_bytes(count) - 1) / chunk;
        let mut dirty = self.dirty_pages.lock();
        for page in 0..=last_page {
            dirty.insert(page);
        }
        info!(volume_id = self.volume_id, "vsa map invalidated");
    }

    fn serialize(&self, version: u64) -> Vec<u8> {
        let entries = self.entries.read();
        let mut image = vec![0u8; Self::file_bytes(entries.len() as u64) as usize];
        let mut header = &mut image[..HEADER_SIZE as usize];
        header.put_u32_le(VSAMAP_SIGNATURE);
        header.put_u64_le(version);
        header.put_u64_le(entries.len() as u64);
        let mut body = &mut image[HEADER_SIZE as usize..];
        for entry in entries.iter() {
            body.put_u32_le(entry.stripe_id);
            body.put_u64_le(entry.offset);
        }
        image
    }

    async fn flush_full(&self) -> MapperResult<()> {
        let version = self.version.load(Ordering::Acquire);
        let image = self.serialize(version);
        self.io.write(&self.file, 0, &image).await?;
        self.dirty_pages.lock().clear();
        Ok(())
    }

    /// Write the header and every dirtied logical page. A failed write
    /// puts the drained pages back, so the next flush covers them.
    pub async fn flush(&self) -> MapperResult<()> {
        let dirty: Vec<u64> = {
            let mut guard = self.dirty_pages.lock();
            let pages = guard.iter().copied().collect();
            guard.clear();
            pages
        };
        let version = self.version.load(Ordering::Acquire) + 1;
        let image = self.serialize(version);

        if let Err(err) = self.write_image(&image, &dirty).await {
            self.dirty_pages.lock().extend(dirty.iter().copied());
            return Err(err);
        }
        self.version.store(version, Ordering::Release);
        debug!(volume_id = self.volume_id, version, "vsa map flushed");
        Ok(())
    }

    async fn write_image(&self, image: &[u8], dirty: &[u64]) -> MapperResult<()> {
        self.io.write(&self.file, 0, &image[..HEADER_SIZE as usize]).await?;
        let chunk = self.io.data_chunk_size() as u64;
        for &page in dirty {
            let start = page * chunk;
            let end = ((page + 1) * chunk).min(image.len() as u64);
            if start >= end {
                continue;
            }
            self.io
                .write(&self.file, start, &image[start as usize..end as usize])
                .await?;
        }
        Ok(())
    }

    /// Quiesce the backing file ahead of deletion.
    pub fn set_stop_state(&self) {
        self.file.set_stop_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_common::MetricsCollector;
    use tempfile::tempdir;

    fn io_manager() -> Arc<MetaIoManager> {
        Arc::new(MetaIoManager::new(
            8,
            4096,
            Arc::new(MetricsCollector::new()),
        ))
    }

    #[tokio::test]
    async fn test_create_then_reload() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        let map = VsaMap::create(dir.path(), 3, 0, 1000, io.clone()).await.unwrap();
        map.set_vsas(
            10,
            VirtualBlks {
                start_vsa: VirtualBlkAddr::new(5, 0),
                num_blks: 4,
            },
        )
        .unwrap();
        map.flush().await.unwrap();

        let reloaded = VsaMap::load(dir.path(), 3, 0, io).await.unwrap();
        assert_eq!(reloaded.block_count(), 1000);
        assert_eq!(reloaded.get_vsa(10).unwrap(), VirtualBlkAddr::new(5, 0));
        assert_eq!(reloaded.get_vsa(13).unwrap(), VirtualBlkAddr::new(5, 3));
        assert!(reloaded.get_vsa(9).unwrap().is_unmapped());
        assert_eq!(reloaded.stored_version(), 1);
    }

    #[tokio::test]
    async fn test_unflushed_writes_do_not_persist() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        let map = VsaMap::create(dir.path(), 1, 0, 100, io.clone()).await.unwrap();
        map.set_vsas(
            0,
            VirtualBlks {
                start_vsa: VirtualBlkAddr::new(1, 0),
                num_blks: 1,
            },
        )
        .unwrap();

        let reloaded = VsaMap::load(dir.path(), 1, 0, io).await.unwrap();
        assert!(reloaded.get_vsa(0).unwrap().is_unmapped());
    }

    #[tokio::test]
    async fn test_out_of_range_run_rejected() {
        let dir = tempdir().unwrap();
        let map = VsaMap::create(dir.path(), 1, 0, 10, io_manager()).await.unwrap();
        let err = map
            .set_vsas(
                8,
                VirtualBlks {
                    start_vsa: VirtualBlkAddr::new(0, 0),
                    num_blks: 3,
                },
            )
            .unwrap_err();
        assert!(matches!(err, MapperError::InvalidAddress(_)));
        assert!(map.get_vsa(10).is_err());
    }

    #[tokio::test]
    async fn test_invalidate_all_persists() {
        let dir = tempdir().unwrap();
        let io = io_manager();
        let map = VsaMap::create(dir.path(), 2, 0, 50, io.clone()).await.unwrap();
        map.set_vsas(
            0,
            VirtualBlks {
                start_vsa: VirtualBlkAddr::new(9, 0),
                num_blks: 50,
            },
        )
        .unwrap();
        map.flush().await.unwrap();

        map.invalidate_all_blocks();
        map.flush().await.unwrap();

        let reloaded = VsaMap::load(dir.path(), 2, 0, io).await.unwrap();
        for rba in 0..50 {
            assert!(reloaded.get_vsa(rba).unwrap().is_unmapped());
        }
    }

    #[tokio::test]
    async fn test_load_rejects_bad_signature() {
        let dir = tempdir().unwrap();
        let io = io_manager();
        // a file that was never initialized as a map
        let file = MetaFile::create(
            VsaMap::path(dir.path(), 7),
            7,
            0,
            MediaType::Ssd,
            io.page_size(),
            2,
        )
        .unwrap();
        drop(file);

        let err = VsaMap::load(dir.path(), 7, 0, io).await.err().unwrap();
        assert!(matches!(err, MapperError::CorruptMap { volume_id: 7, .. }));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_pages_dirty() {
        let dir = tempdir().unwrap();
        let map = VsaMap::create(dir.path(), 4, 0, 100, io_manager()).await.unwrap();
        map.set_vsas(
            0,
            VirtualBlks {
                start_vsa: VirtualBlkAddr::new(2, 0),
                num_blks: 1,
            },
        )
        .unwrap();

        map.set_stop_state();
        assert!(map.flush().await.is_err());
        // the failed pages stay queued and the version did not move
        assert!(!map.dirty_pages.lock().is_empty());
        assert_eq!(map.stored_version(), 0);
    }
}
