//! Mapper facade
//!
//! Front door for address translation and volume lifecycle. Internal
//! callers (GC, journal replay) go through `enable_internal_access`,
//! which loads an unloaded volume's map on first touch and answers
//! `NeedRetry` until the load lands; `*_with_sync_open` variants park
//! on the slot instead of bouncing the retry back to the caller.
//! Lifecycle events validate the slot's state and leave it unchanged on
//! an invalid transition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use blockio_common::{
    ArrayConfig, ArrayId, BlkAddr, MetricsCollector, StripeAddr, StripeId, StripeLoc,
    VirtualBlkAddr, VirtualBlks, VolumeId,
};
use blockio_metafs::MetaIoManager;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::{MapperError, MapperResult, VolumeEventResult};
use crate::stripe_map::StripeMap;
use crate::volume_state::{VolState, VolumeSlots};
use crate::vsa_map::VsaMap;

/// Address translation and volume mount lifecycle for one array.
pub struct Mapper {
    dir: PathBuf,
    array_id: ArrayId,
    io: Arc<MetaIoManager>,
    metrics: Arc<MetricsCollector>,
    slots: VolumeSlots,
    vsa_maps: RwLock<HashMap<VolumeId, Arc<VsaMap>>>,
    stripe_map: RwLock<Option<Arc<StripeMap>>>,
    stripe_count: u32,
    write_buffer_stripes: u32,
}

impl Mapper {
    #[must_use]
    pub fn new(
        config: &ArrayConfig,
        dir: PathBuf,
        array_id: ArrayId,
        io: Arc<MetaIoManager>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            dir,
            array_id,
            io,
            metrics,
            slots: VolumeSlots::new(config.volume_slot_count),
            vsa_maps: RwLock::new(HashMap::new()),
            stripe_map: RwLock::new(None),
            stripe_count: config.user_area_stripe_count(),
            write_buffer_stripes: config.write_buffer_stripe_count,
        }
    }

    /// Open or create the stripe map. Must run before any translation.
    pub async fn init(&self) -> MapperResult<()> {
        let map = StripeMap::open_or_create(
            &self.dir,
            self.array_id,
            self.stripe_count,
            self.io.clone(),
        )
        .await?;
        *self.stripe_map.write() = Some(map);
        info!(array_id = self.array_id, "mapper initialized");
        Ok(())
    }

    fn stripe_map(&self) -> MapperResult<Arc<StripeMap>> {
        self.stripe_map
            .read()
            .clone()
            .ok_or_else(|| MapperError::Internal("mapper not initialized".into()))
    }

    fn vsa_map(&self, volume_id: VolumeId) -> MapperResult<Arc<VsaMap>> {
        self.vsa_maps.read().get(&volume_id).cloned().ok_or_else(|| {
            MapperError::Internal(format!("volume {volume_id} map not in memory"))
        })
    }

    /// Admit an internal caller to a volume's map. `Ok` when the map is
    /// loaded; `NeedRetry` when a load was just issued or is still in
    /// flight; not-accessible for absent or deleting volumes. The caller
    /// whose access flips the slot to loading issues the load, exactly
    /// once, because the transition happens under the slot lock.
    pub fn enable_internal_access(self: &Arc<Self>, volume_id: VolumeId) -> MapperResult<()> {
        enum Admission {
            Granted,
            Loading,
            IssueLoad(u64),
            Gone,
        }

        let admission = self.slots.with_slot(volume_id, |slot| match slot.state {
            VolState::BackgroundMounted | VolState::ForegroundMounted => Admission::Granted,
            VolState::VolumeLoading => Admission::Loading,
            VolState::ExistUnloaded => {
                slot.state = VolState::VolumeLoading;
                Admission::IssueLoad(slot.size_blocks)
            }
            VolState::NotExist | VolState::VolumeDeleting => Admission::Gone,
        })?;

        match admission {
            Admission::Granted => Ok(()),
            Admission::Loading => Err(MapperError::NeedRetry),
            Admission::IssueLoad(size_blocks) => {
                self.spawn_load(volume_id, size_blocks);
                Err(MapperError::NeedRetry)
            }
            Admission::Gone => Err(MapperError::VolumeNotAccessible(volume_id)),
        }
    }

    fn spawn_load(self: &Arc<Self>, volume_id: VolumeId, size_blocks: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.load_volume_map(volume_id, size_blocks).await;
            match &result {
                Ok(()) => {
                    let _ = this.slots.with_slot(volume_id, |slot| {
                        slot.state = VolState::BackgroundMounted;
                    });
                    this.metrics.volume_loaded();
                    info!(volume_id, "volume map loaded in background");
                }
                // a failed load leaves the slot in loading; waiters are
                // still woken so they observe the state and keep retrying
                Err(err) => error!(volume_id, %err, "volume map load failed"),
            }
            this.slots.notify_load_done(volume_id);
        });
    }

    async fn load_volume_map(&self, volume_id: VolumeId, size_blocks: u64) -> MapperResult<()> {
        let map = if VsaMap::path(&self.dir, volume_id).exists() {
            VsaMap::load(&self.dir, volume_id, self.array_id, self.io.clone()).await?
        } else {
            VsaMap::create(
                &self.dir,
                volume_id,
                self.array_id,
                size_blocks,
                self.io.clone(),
            )
            .await?
        };
        self.vsa_maps.write().insert(volume_id, map);
        Ok(())
    }

    /// Translate one block for an internal caller; `NeedRetry` until
    /// the map is loaded.
    pub fn get_vsa_internal(
        self: &Arc<Self>,
        volume_id: VolumeId,
        rba: BlkAddr,
    ) -> MapperResult<VirtualBlkAddr> {
        self.enable_internal_access(volume_id)?;
        self.vsa_map(volume_id)?.get_vsa(rba)
    }

    /// Record a run for an internal caller. Unlike the read side, a
    /// `NeedRetry` here is not recovered: writers are expected to have
    /// opened the volume before producing mappings.
    pub fn set_vsas_internal(
        self: &Arc<Self>,
        volume_id: VolumeId,
        start_rba: BlkAddr,
        blks: VirtualBlks,
    ) -> MapperResult<()> {
        self.enable_internal_access(volume_id)?;
        self.vsa_map(volume_id)?.set_vsas(start_rba, blks)
    }

    /// Like `get_vsa_internal`, but parks on the slot until the load
    /// settles instead of returning `NeedRetry`.
    pub async fn get_vsa_with_sync_open(
        self: &Arc<Self>,
        volume_id: VolumeId,
        rba: BlkAddr,
    ) -> MapperResult<VirtualBlkAddr> {
        self.internal_access_sync(volume_id).await?;
        self.vsa_map(volume_id)?.get_vsa(rba)
    }

    /// Like `set_vsas_internal`, but awaits the in-flight load.
    pub async fn set_vsas_with_sync_open(
        self: &Arc<Self>,
        volume_id: VolumeId,
        start_rba: BlkAddr,
        blks: VirtualBlks,
    ) -> MapperResult<()> {
        self.internal_access_sync(volume_id).await?;
        self.vsa_map(volume_id)?.set_vsas(start_rba, blks)
    }

    async fn internal_access_sync(self: &Arc<Self>, volume_id: VolumeId) -> MapperResult<()> {
        loop {
            match self.enable_internal_access(volume_id) {
                Ok(()) => return Ok(()),
                Err(MapperError::NeedRetry) => {
                    self.slots.wait_load_done(volume_id).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn require_accessible(&self, volume_id: VolumeId) -> MapperResult<()> {
        let state = self.slots.state(volume_id)?;
        if !state.is_accessible() {
            return Err(MapperError::VolumeNotAccessible(volume_id));
        }
        Ok(())
    }

    /// Foreground-path read of a run of mappings.
    pub fn get_vsas(
        &self,
        volume_id: VolumeId,
        start_rba: BlkAddr,
        num_blks: u32,
    ) -> MapperResult<Vec<VirtualBlkAddr>> {
        self.require_accessible(volume_id)?;
        let map = self.vsa_map(volume_id)?;
        (0..u64::from(num_blks))
            .map(|i| map.get_vsa(start_rba + i))
            .collect()
    }

    /// Foreground-path update of a run of mappings.
    pub fn set_vsas(
        &self,
        volume_id: VolumeId,
        start_rba: BlkAddr,
        blks: VirtualBlks,
    ) -> MapperResult<()> {
        self.require_accessible(volume_id)?;
        self.vsa_map(volume_id)?.set_vsas(start_rba, blks)
    }

    /// Physical location of a virtual stripe.
    pub fn get_lsa(&self, vsid: StripeId) -> MapperResult<StripeAddr> {
        self.stripe_map()?.get_lsa(vsid)
    }

    /// Point a virtual stripe at its new physical home. Write-buffer
    /// targets must fit the array's NVRAM buffer.
    pub fn update_stripe_map(
        &self,
        vsid: StripeId,
        lsid: StripeId,
        loc: StripeLoc,
    ) -> MapperResult<()> {
        if loc == StripeLoc::WriteBuffer && lsid >= self.write_buffer_stripes {
            return Err(MapperError::InvalidAddress(format!(
                "write buffer stripe {} beyond buffer size {}",
                lsid, self.write_buffer_stripes
            )));
        }
        self.stripe_map()?.set_lsa(vsid, lsid, loc)
    }

    fn event_fail(&self, volume_id: VolumeId, event: &str, state: VolState) -> VolumeEventResult {
        warn!(
            volume_id,
            event,
            state = state.as_str(),
            "volume event rejected in current state"
        );
        VolumeEventResult::Fail
    }

    /// A new volume was created: build its map file.
    pub async fn volume_created(
        self: &Arc<Self>,
        volume_id: VolumeId,
        size_blocks: u64,
    ) -> VolumeEventResult {
        let state = match self.slots.state(volume_id) {
            Ok(state) => state,
            Err(_) => return VolumeEventResult::Fail,
        };
        if state != VolState::NotExist {
            return self.event_fail(volume_id, "created", state);
        }
        match VsaMap::create(
            &self.dir,
            volume_id,
            self.array_id,
            size_blocks,
            self.io.clone(),
        )
        .await
        {
            Ok(map) => {
                self.vsa_maps.write().insert(volume_id, map);
                // the freshly built map is resident, so the volume comes
                // up background mounted
                let _ = self.slots.with_slot(volume_id, |slot| {
                    slot.state = VolState::BackgroundMounted;
                    slot.size_blocks = size_blocks;
                });
                self.metrics.volume_loaded();
                info!(volume_id, size_blocks, "volume created");
                VolumeEventResult::Ok
            }
            Err(err) => {
                error!(volume_id, %err, "volume map creation failed");
                VolumeEventResult::Fail
            }
        }
    }

    /// A volume was discovered at array boot; its map file already
    /// exists on disk.
    pub fn volume_loaded(&self, volume_id: VolumeId, size_blocks: u64) -> VolumeEventResult {
        let state = match self.slots.state(volume_id) {
            Ok(state) => state,
            Err(_) => return VolumeEventResult::Fail,
        };
        if state != VolState::NotExist {
            return self.event_fail(volume_id, "loaded", state);
        }
        let _ = self.slots.with_slot(volume_id, |slot| {
            slot.state = VolState::ExistUnloaded;
            slot.size_blocks = size_blocks;
        });
        info!(volume_id, size_blocks, "volume discovered");
        VolumeEventResult::Ok
    }

    /// Foreground mount: loads the map if it is not in memory yet, and
    /// rides out a background load already in flight.
    pub async fn volume_mounted(self: &Arc<Self>, volume_id: VolumeId) -> VolumeEventResult {
        loop {
            let state = match self.slots.state(volume_id) {
                Ok(state) => state,
                Err(_) => return VolumeEventResult::Fail,
            };
            match state {
                VolState::BackgroundMounted => break,
                VolState::VolumeLoading => {
                    if self.slots.wait_load_done(volume_id).await.is_err() {
                        return VolumeEventResult::Fail;
                    }
                    // a failed load leaves the slot in loading
                    if self.slots.state(volume_id).ok() == Some(VolState::VolumeLoading) {
                        return self.event_fail(volume_id, "mounted", VolState::VolumeLoading);
                    }
                }
                VolState::ExistUnloaded => {
                    let size = self
                        .slots
                        .with_slot(volume_id, |slot| slot.size_blocks)
                        .unwrap_or(0);
                    if !self.vsa_maps.read().contains_key(&volume_id) {
                        if let Err(err) = self.load_volume_map(volume_id, size).await {
                            error!(volume_id, %err, "mount-time map load failed");
                            return VolumeEventResult::Fail;
                        }
                        self.metrics.volume_loaded();
                    }
                    break;
                }
                other => return self.event_fail(volume_id, "mounted", other),
            }
        }
        let _ = self.slots.with_slot(volume_id, |slot| {
            slot.state = VolState::ForegroundMounted;
        });
        self.metrics.volume_mounted();
        info!(volume_id, "volume mounted");
        VolumeEventResult::Ok
    }

    /// Foreground unmount; the map stays loaded for internal callers.
    pub fn volume_unmounted(&self, volume_id: VolumeId) -> VolumeEventResult {
        let state = match self.slots.state(volume_id) {
            Ok(state) => state,
            Err(_) => return VolumeEventResult::Fail,
        };
        if state != VolState::ForegroundMounted {
            return self.event_fail(volume_id, "unmounted", state);
        }
        let _ = self.slots.with_slot(volume_id, |slot| {
            slot.state = VolState::BackgroundMounted;
        });
        self.metrics.volume_unmounted();
        info!(volume_id, "volume unmounted");
        VolumeEventResult::Ok
    }

    /// First half of delete: unmap every block and persist the empty
    /// table, then hold the slot in `VolumeDeleting`.
    pub async fn prepare_volume_delete(self: &Arc<Self>, volume_id: VolumeId) -> VolumeEventResult {
        let state = match self.slots.state(volume_id) {
            Ok(state) => state,
            Err(_) => return VolumeEventResult::Fail,
        };
        match state {
            VolState::ExistUnloaded => {
                let size = self
                    .slots
                    .with_slot(volume_id, |slot| slot.size_blocks)
                    .unwrap_or(0);
                if !self.vsa_maps.read().contains_key(&volume_id) {
                    if let Err(err) = self.load_volume_map(volume_id, size).await {
                        error!(volume_id, %err, "delete-time map load failed");
                        return VolumeEventResult::Fail;
                    }
                }
            }
            VolState::BackgroundMounted | VolState::ForegroundMounted => {}
            other => return self.event_fail(volume_id, "prepare_delete", other),
        }

        let map = match self.vsa_map(volume_id) {
            Ok(map) => map,
            Err(_) => return VolumeEventResult::Fail,
        };
        map.invalidate_all_blocks();
        if let Err(err) = map.flush().await {
            error!(volume_id, %err, "invalidated map flush failed");
            return VolumeEventResult::Fail;
        }
        let _ = self.slots.with_slot(volume_id, |slot| {
            slot.state = VolState::VolumeDeleting;
        });
        info!(volume_id, "volume delete prepared");
        VolumeEventResult::Ok
    }

    /// Second half of delete: drop the map and its backing file.
    pub fn delete_volume_map(&self, volume_id: VolumeId) -> VolumeEventResult {
        let state = match self.slots.state(volume_id) {
            Ok(state) => state,
            Err(_) => return VolumeEventResult::Fail,
        };
        if state != VolState::VolumeDeleting {
            return self.event_fail(volume_id, "delete", state);
        }
        if let Some(map) = self.vsa_maps.write().remove(&volume_id) {
            map.set_stop_state();
            self.metrics.volume_unloaded();
        }
        if let Err(err) = std::fs::remove_file(VsaMap::path(&self.dir, volume_id)) {
            error!(volume_id, %err, "map file removal failed");
            return VolumeEventResult::Fail;
        }
        let _ = self.slots.with_slot(volume_id, |slot| {
            slot.state = VolState::NotExist;
            slot.size_blocks = 0;
        });
        info!(volume_id, "volume map deleted");
        VolumeEventResult::Ok
    }

    /// Array detach: demote every foreground-mounted volume.
    pub fn volume_detached(&self, volume_ids: &[VolumeId]) -> VolumeEventResult {
        for &volume_id in volume_ids {
            let state = match self.slots.state(volume_id) {
                Ok(state) => state,
                Err(_) => return VolumeEventResult::Fail,
            };
            if state == VolState::ForegroundMounted {
                let _ = self.slots.with_slot(volume_id, |slot| {
                    slot.state = VolState::BackgroundMounted;
                });
                self.metrics.volume_unmounted();
                info!(volume_id, "volume detached");
            }
        }
        VolumeEventResult::Ok
    }

    /// Shutdown flush: stripe map first, then every loaded VSA map.
    pub async fn store_all(&self) -> MapperResult<()> {
        self.stripe_map()?.flush().await?;
        let maps: Vec<Arc<VsaMap>> = self.vsa_maps.read().values().cloned().collect();
        for map in maps {
            map.flush().await?;
        }
        info!("all maps stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BLOCKS: u64 = 200;

    fn config() -> ArrayConfig {
        ArrayConfig {
            segment_count: 4,
            stripes_per_segment: 4,
            volume_slot_count: 16,
            ..Default::default()
        }
    }

    fn io_manager() -> Arc<MetaIoManager> {
        Arc::new(MetaIoManager::with_config(
            16,
            &config(),
            Arc::new(MetricsCollector::new()),
        ))
    }

    async fn mapper(dir: &std::path::Path, io: Arc<MetaIoManager>) -> Arc<Mapper> {
        let m = Arc::new(Mapper::new(
            &config(),
            dir.to_path_buf(),
            0,
            io,
            Arc::new(MetricsCollector::new()),
        ));
        m.init().await.unwrap();
        m
    }

    fn run(start: u32, offset: u64, n: u32) -> VirtualBlks {
        VirtualBlks {
            start_vsa: VirtualBlkAddr::new(start, offset),
            num_blks: n,
        }
    }

    #[tokio::test]
    async fn test_mount_translate_unmount() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path(), io_manager()).await;

        assert!(m.volume_created(1, BLOCKS).await.is_ok());
        assert!(m.volume_mounted(1).await.is_ok());

        m.set_vsas(1, 10, run(3, 0, 4)).unwrap();
        let vsas = m.get_vsas(1, 10, 4).unwrap();
        assert_eq!(vsas[3], VirtualBlkAddr::new(3, 3));

        assert!(m.volume_unmounted(1).is_ok());
        // background-mounted volumes stay accessible to internal callers
        assert_eq!(m.get_vsa_internal(1, 10).unwrap(), VirtualBlkAddr::new(3, 0));
        // but the foreground path still works against accessibility
        m.set_vsas(1, 0, run(1, 0, 1)).unwrap();
    }

    #[tokio::test]
    async fn test_internal_access_loads_once_and_retries() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        {
            let m = mapper(dir.path(), io.clone()).await;
            assert!(m.volume_created(2, BLOCKS).await.is_ok());
            assert!(m.volume_mounted(2).await.is_ok());
            m.set_vsas(2, 5, run(7, 0, 1)).unwrap();
            m.store_all().await.unwrap();
        }

        // fresh process: slot discovered, map not in memory
        let m = mapper(dir.path(), io).await;
        assert!(m.volume_loaded(2, BLOCKS).is_ok());

        // first touch issues the load and answers NeedRetry
        let first = m.get_vsa_internal(2, 5);
        assert!(matches!(first, Err(MapperError::NeedRetry)));

        // retry until the background load lands
        let vsa = loop {
            match m.get_vsa_internal(2, 5) {
                Ok(vsa) => break vsa,
                Err(MapperError::NeedRetry) => tokio::task::yield_now().await,
                Err(err) => panic!("unexpected error: {err}"),
            }
        };
        assert_eq!(vsa, VirtualBlkAddr::new(7, 0));
        assert_eq!(m.slots.state(2).unwrap(), VolState::BackgroundMounted);
    }

    #[tokio::test]
    async fn test_sync_open_waits_for_load() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        {
            let m = mapper(dir.path(), io.clone()).await;
            assert!(m.volume_created(3, BLOCKS).await.is_ok());
            assert!(m.volume_mounted(3).await.is_ok());
            m.set_vsas(3, 0, run(9, 2, 1)).unwrap();
            m.store_all().await.unwrap();
        }

        let m = mapper(dir.path(), io).await;
        assert!(m.volume_loaded(3, BLOCKS).is_ok());
        let vsa = m.get_vsa_with_sync_open(3, 0).await.unwrap();
        assert_eq!(vsa, VirtualBlkAddr::new(9, 2));

        m.set_vsas_with_sync_open(3, 1, run(2, 0, 1)).await.unwrap();
        assert_eq!(m.get_vsa_internal(3, 1).unwrap(), VirtualBlkAddr::new(2, 0));
    }

    #[tokio::test]
    async fn test_concurrent_internal_access_single_load() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        {
            let m = mapper(dir.path(), io.clone()).await;
            assert!(m.volume_created(4, BLOCKS).await.is_ok());
            m.store_all().await.unwrap();
        }

        let m = mapper(dir.path(), io).await;
        assert!(m.volume_loaded(4, BLOCKS).is_ok());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            tasks.push(tokio::spawn(async move {
                m.get_vsa_with_sync_open(4, 0).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_unmapped());
        }
        assert_eq!(m.metrics.snapshot().loaded_volumes, 1);
    }

    #[tokio::test]
    async fn test_invalid_transitions_leave_state() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path(), io_manager()).await;

        // mount before create
        assert!(!m.volume_mounted(5).await.is_ok());
        assert_eq!(m.slots.state(5).unwrap(), VolState::NotExist);

        assert!(m.volume_created(5, BLOCKS).await.is_ok());
        assert_eq!(m.slots.state(5).unwrap(), VolState::BackgroundMounted);
        // double create
        assert!(!m.volume_created(5, BLOCKS).await.is_ok());
        // unmount while not foreground mounted
        assert!(!m.volume_unmounted(5).is_ok());
        assert_eq!(m.slots.state(5).unwrap(), VolState::BackgroundMounted);
        // delete without prepare
        assert!(!m.delete_volume_map(5).is_ok());
    }

    #[tokio::test]
    async fn test_created_volume_accessible_before_mount() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path(), io_manager()).await;

        assert!(m.volume_created(8, BLOCKS).await.is_ok());
        // the fresh map is resident, so both paths work unmounted
        m.set_vsas(8, 3, run(5, 1, 2)).unwrap();
        assert_eq!(m.get_vsas(8, 3, 1).unwrap()[0], VirtualBlkAddr::new(5, 1));
        assert_eq!(m.get_vsa_internal(8, 4).unwrap(), VirtualBlkAddr::new(5, 2));
        assert_eq!(m.metrics.snapshot().loaded_volumes, 1);
    }

    #[tokio::test]
    async fn test_mount_waits_for_inflight_load() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        {
            let m = mapper(dir.path(), io.clone()).await;
            assert!(m.volume_created(9, BLOCKS).await.is_ok());
            m.set_vsas(9, 2, run(6, 0, 1)).unwrap();
            m.store_all().await.unwrap();
        }

        let m = mapper(dir.path(), io).await;
        assert!(m.volume_loaded(9, BLOCKS).is_ok());

        // first touch flips the slot to loading
        assert!(matches!(
            m.get_vsa_internal(9, 2),
            Err(MapperError::NeedRetry)
        ));
        // mount rides the load out instead of failing
        assert!(m.volume_mounted(9).await.is_ok());
        assert_eq!(m.slots.state(9).unwrap(), VolState::ForegroundMounted);
        assert_eq!(m.get_vsas(9, 2, 1).unwrap()[0], VirtualBlkAddr::new(6, 0));
    }

    #[tokio::test]
    async fn test_delete_lifecycle() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path(), io_manager()).await;

        assert!(m.volume_created(6, BLOCKS).await.is_ok());
        assert!(m.volume_mounted(6).await.is_ok());
        m.set_vsas(6, 0, run(1, 0, 8)).unwrap();

        assert!(m.prepare_volume_delete(6).await.is_ok());
        // no access while deleting
        assert!(matches!(
            m.get_vsa_internal(6, 0),
            Err(MapperError::VolumeNotAccessible(6))
        ));
        assert!(m.delete_volume_map(6).is_ok());
        assert_eq!(m.slots.state(6).unwrap(), VolState::NotExist);
        assert!(!VsaMap::path(dir.path(), 6).exists());
    }

    #[tokio::test]
    async fn test_stripe_map_roundtrip_through_facade() {
        let dir = tempdir().unwrap();
        let io = io_manager();
        {
            let m = mapper(dir.path(), io.clone()).await;
            m.update_stripe_map(2, 11, StripeLoc::UserArea).unwrap();
            m.store_all().await.unwrap();
        }
        let m = mapper(dir.path(), io).await;
        assert_eq!(
            m.get_lsa(2).unwrap(),
            StripeAddr::new(StripeLoc::UserArea, 11)
        );
        assert!(m.get_lsa(3).unwrap().is_unmapped());
    }

    #[tokio::test]
    async fn test_write_buffer_target_bounds() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path(), io_manager()).await;

        let limit = config().write_buffer_stripe_count;
        m.update_stripe_map(0, limit - 1, StripeLoc::WriteBuffer).unwrap();
        assert!(matches!(
            m.update_stripe_map(0, limit, StripeLoc::WriteBuffer),
            Err(MapperError::InvalidAddress(_))
        ));
        // the buffer bound does not apply to user-area targets
        m.update_stripe_map(1, limit, StripeLoc::UserArea).unwrap();
    }

    #[tokio::test]
    async fn test_detach_demotes_foreground() {
        let dir = tempdir().unwrap();
        let m = mapper(dir.path(), io_manager()).await;
        assert!(m.volume_created(7, BLOCKS).await.is_ok());
        assert!(m.volume_mounted(7).await.is_ok());

        assert!(m.volume_detached(&[7]).is_ok());
        assert_eq!(m.slots.state(7).unwrap(), VolState::BackgroundMounted);
    }
}
