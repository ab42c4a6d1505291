//! Stripe map
//!
//! Maps a virtual stripe id to its physical location: still in the
//! NVRAM write buffer, or destaged to an SSD user-area stripe. One per
//! array, persisted whole (it is small next to the VSA maps).
//!
//! File image:
//!
//! ```text
//! header (64 B): sig(4) version(8) entry_count(8)
//! entries:       8 B per stripe: stripe(4) loc(1) pad(3)
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blockio_common::{
    ArrayId, MediaType, StripeAddr, StripeId, StripeLoc, UNMAP_STRIPE_ADDR,
};
use blockio_metafs::{MetaFile, MetaIoManager};
use bytes::{Buf, BufMut};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{MapperError, MapperResult};

/// Magic for the stripe map file ("STMP")
const STRIPEMAP_SIGNATURE: u32 = 0x5354_4D50;
const HEADER_SIZE: u64 = 64;
const ENTRY_SIZE: u64 = 8;

const STRIPEMAP_FILE_NAME: &str = "stripemap.map";

/// Special file id for the array's single stripe map.
const STRIPEMAP_FILE_ID: u32 = 0xFFFF_0001;

/// Virtual-stripe-id to physical-location table.
pub struct StripeMap {
    file: Arc<MetaFile>,
    io: Arc<MetaIoManager>,
    entries: RwLock<Vec<StripeAddr>>,
    version: AtomicU64,
}

impl StripeMap {
    #[must_use]
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(STRIPEMAP_FILE_NAME)
    }

    fn file_bytes(stripe_count: u64) -> u64 {
        HEADER_SIZE + ENTRY_SIZE * stripe_count
    }

    /// Open the existing map, or create an all-unmapped one.
    pub async fn open_or_create(
        dir: &Path,
        array_id: ArrayId,
        stripe_count: u32,
        io: Arc<MetaIoManager>,
    ) -> MapperResult<Arc<Self>> {
        let path = Self::path(dir);
        if MetaFile::exists(&path) {
            Self::load(&path, array_id, stripe_count, io).await
        } else {
            let bytes = Self::file_bytes(u64::from(stripe_count));
            let file = Arc::new(MetaFile::create(
                &path,
                STRIPEMAP_FILE_ID,
                array_id,
                MediaType::Ssd,
                io.page_size(),
                io.pages_needed(bytes).max(1),
            )?);
            let map = Arc::new(Self {
                file,
                io,
                entries: RwLock::new(vec![UNMAP_STRIPE_ADDR; stripe_count as usize]),
                version: AtomicU64::new(0),
            });
            map.flush().await?;
            info!(stripe_count, "stripe map created");
            Ok(map)
        }
    }

    async fn load(
        path: &Path,
        array_id: ArrayId,
        stripe_count: u32,
        io: Arc<MetaIoManager>,
    ) -> MapperResult<Arc<Self>> {
        let file = Arc::new(MetaFile::open(
            path,
            STRIPEMAP_FILE_ID,
            array_id,
            MediaType::Ssd,
            io.page_size(),
        )?);

        let mut header = vec![0u8; HEADER_SIZE as usize];
        io.read(&file, 0, &mut header).await?;
        let mut cursor = &header[..];
        let sig = cursor.get_u32_le();
        if sig != STRIPEMAP_SIGNATURE {
            return Err(MapperError::CorruptMap {
                volume_id: STRIPEMAP_FILE_ID,
                detail: format!("stripe map signature {sig:#010x}"),
            });
        }
        let version = cursor.get_u64_le();
        let entry_count = cursor.get_u64_le();
        if entry_count != u64::from(stripe_count) {
            return Err(MapperError::CorruptMap {
                volume_id: STRIPEMAP_FILE_ID,
                detail: format!(
                    "stripe map has {} entries, array has {} stripes",
                    entry_count, stripe_count
                ),
            });
        }

        let mut table = vec![0u8; (ENTRY_SIZE * entry_count) as usize];
        io.read(&file, HEADER_SIZE, &mut table).await?;
        let mut cursor = &table[..];
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let stripe_id = cursor.get_u32_le();
            let loc_raw = cursor.get_u8();
            cursor.advance(3);
            let loc = StripeLoc::try_from(loc_raw).map_err(|bad| MapperError::CorruptMap {
                volume_id: STRIPEMAP_FILE_ID,
                detail: format!("unknown stripe location {bad}"),
            })?;
            entries.push(StripeAddr { loc, stripe_id });
        }

        debug!(version, entry_count, "stripe map loaded");
        Ok(Arc::new(Self {
            file,
            io,
            entries: RwLock::new(entries),
            version: AtomicU64::new(version),
        }))
    }

    #[must_use]
    pub fn stripe_count(&self) -> u64 {
        self.entries.read().len() as u64
    }

    #[must_use]
    pub fn stored_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn check_vsid(&self, vsid: StripeId) -> MapperResult<usize> {
        let len = self.entries.read().len();
        if (vsid as usize) >= len {
            return Err(MapperError::InvalidAddress(format!(
                "vsid {} beyond stripe count {}",
                vsid, len
            )));
        }
        Ok(vsid as usize)
    }

    /// Physical location of a virtual stripe.
    pub fn get_lsa(&self, vsid: StripeId) -> MapperResult<StripeAddr> {
        let idx = self.check_vsid(vsid)?;
        Ok(self.entries.read()[idx])
    }

    /// Point a virtual stripe at a new physical stripe.
    pub fn set_lsa(&self, vsid: StripeId, lsid: StripeId, loc: StripeLoc) -> MapperResult<()> {
        let idx = self.check_vsid(vsid)?;
        self.entries.write()[idx] = StripeAddr {
            loc,
            stripe_id: lsid,
        };
        Ok(())
    }

    /// Persist the whole table with a bumped version.
    pub async fn flush(&self) -> MapperResult<()> {
        let image = {
            let entries = self.entries.read();
            let version = self.version.load(Ordering::Acquire) + 1;
            let mut image = vec![0u8; Self::file_bytes(entries.len() as u64) as usize];
            let mut header = &mut image[..HEADER_SIZE as usize];
            header.put_u32_le(STRIPEMAP_SIGNATURE);
            header.put_u64_le(version);
            header.put_u64_le(entries.len() as u64);
            let mut body = &mut image[HEADER_SIZE as usize..];
            for entry in entries.iter() {
                body.put_u32_le(entry.stripe_id);
                body.put_u8(entry.loc as u8);
                body.put_bytes(0, 3);
            }
            image
        };
        self.io.write(&self.file, 0, &image).await?;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(version, "stripe map flushed");
        Ok(())
    }

    /// Quiesce the backing file ahead of shutdown.
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
    async fn test_create_then_reopen() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        let map = StripeMap::open_or_create(dir.path(), 0, 64, io.clone())
            .await
            .unwrap();
        map.set_lsa(3, 17, StripeLoc::UserArea).unwrap();
        map.set_lsa(4, 2, StripeLoc::WriteBuffer).unwrap();
        map.flush().await.unwrap();

        let reopened = StripeMap::open_or_create(dir.path(), 0, 64, io)
            .await
            .unwrap();
        assert_eq!(
            reopened.get_lsa(3).unwrap(),
            StripeAddr::new(StripeLoc::UserArea, 17)
        );
        assert_eq!(
            reopened.get_lsa(4).unwrap(),
            StripeAddr::new(StripeLoc::WriteBuffer, 2)
        );
        assert!(reopened.get_lsa(5).unwrap().is_unmapped());
    }

    #[tokio::test]
    async fn test_stripe_count_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let io = io_manager();
        StripeMap::open_or_create(dir.path(), 0, 64, io.clone())
            .await
            .unwrap();

        let err = StripeMap::open_or_create(dir.path(), 0, 32, io)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MapperError::CorruptMap { .. }));
    }

    #[tokio::test]
    async fn test_vsid_bounds() {
        let dir = tempdir().unwrap();
        let map = StripeMap::open_or_create(dir.path(), 0, 8, io_manager())
            .await
            .unwrap();
        assert!(map.get_lsa(8).is_err());
        assert!(map.set_lsa(8, 0, StripeLoc::UserArea).is_err());
    }
}
