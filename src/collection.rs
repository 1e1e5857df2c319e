//! Ownership and lifecycle of a collection of sub-maps
//!
//! The collection hands out stable ids, tracks which sub-map is active,
//! seals sub-maps when their time window closes and answers the overlap
//! queries the pose graph needs to discover registration candidates.

use crate::error::{Error, Result};
use crate::submap::{Submap, SubmapConfig, SubmapId, SubmapState};
use crate::timeline::SubmapTimeline;
use crate::transform::Pose;
use log::{debug, info};
use rustc_hash::FxHashMap;

/// Default time-window length: 20 seconds, in nanoseconds
pub const DEFAULT_CREATION_INTERVAL_NS: u64 = 20_000_000_000;

/// Owns sub-maps by id and drives their active → finished lifecycle
#[derive(Debug, Clone)]
pub struct SubmapCollection {
    config: SubmapConfig,
    submaps: FxHashMap<SubmapId, Submap>,
    active_id: Option<SubmapId>,
    next_id: SubmapId,
    timeline: SubmapTimeline,
    /// New-window threshold in nanoseconds
    submap_creation_interval: u64,
}

impl SubmapCollection {
    /// Create an empty collection; `submap_creation_interval` is in
    /// nanoseconds
    pub fn new(config: SubmapConfig, submap_creation_interval: u64) -> Self {
        Self {
            config,
            submaps: FxHashMap::default(),
            active_id: None,
            next_id: 0,
            timeline: SubmapTimeline::new(),
            submap_creation_interval,
        }
    }

    pub fn config(&self) -> &SubmapConfig {
        &self.config
    }

    pub fn is_empty(&self) -> bool {
        self.submaps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.submaps.len()
    }

    /// All ids in ascending order
    pub fn ids(&self) -> Vec<SubmapId> {
        let mut ids: Vec<SubmapId> = self.submaps.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn timeline(&self) -> &SubmapTimeline {
        &self.timeline
    }

    /// Lookup by id
    pub fn submap(&self, id: SubmapId) -> Result<&Submap> {
        self.submaps.get(&id).ok_or(Error::UnknownSubmap(id))
    }

    /// Mutable lookup by id
    pub fn submap_mut(&mut self, id: SubmapId) -> Result<&mut Submap> {
        self.submaps.get_mut(&id).ok_or(Error::UnknownSubmap(id))
    }

    /// Id of the active sub-map
    pub fn active_submap_id(&self) -> Result<SubmapId> {
        self.active_id.ok_or(Error::NoActiveSubmap)
    }

    /// The active sub-map
    pub fn active_submap(&self) -> Result<&Submap> {
        self.submap(self.active_submap_id()?)
    }

    /// Mutable access to the active sub-map (observation integration)
    pub fn active_submap_mut(&mut self) -> Result<&mut Submap> {
        let id = self.active_submap_id()?;
        self.submap_mut(id)
    }

    /// True when the active window has expired, or no sub-map exists yet
    pub fn should_create_new_submap(&self, timestamp: u64) -> bool {
        match self.active_id.and_then(|id| self.submaps.get(&id)) {
            Some(active) => {
                timestamp.saturating_sub(active.creation_timestamp())
                    >= self.submap_creation_interval
            }
            None => true,
        }
    }

    /// Seal the previous active sub-map and start a fresh one at
    /// `t_world_robot`; returns the new sub-map's id
    pub fn create_new_submap(&mut self, t_world_robot: Pose, timestamp: u64) -> SubmapId {
        if let Some(active_id) = self.active_id {
            if let Some(active) = self.submaps.get_mut(&active_id) {
                debug!("sealing sub-map {active_id}");
                active.seal();
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut submap = Submap::new(id, t_world_robot, timestamp, self.config.clone());
        // The first sub-map anchors the world frame
        if id == 0 {
            submap.set_constant(true);
        }
        self.submaps.insert(id, submap);
        self.active_id = Some(id);
        self.timeline.add_next_submap(timestamp, id);
        info!("created sub-map {id} at t={timestamp}");
        id
    }

    /// Ids of all finished sub-maps, ascending
    pub fn finished_ids(&self) -> Vec<SubmapId> {
        let mut ids: Vec<SubmapId> = self
            .submaps
            .values()
            .filter(|s| s.state() == SubmapState::Finished)
            .map(|s| s.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Generate the ESDF of a (sealed) sub-map
    pub fn generate_esdf_by_id(&mut self, id: SubmapId) -> Result<()> {
        self.submap_mut(id)?.generate_esdf();
        Ok(())
    }

    /// Overwrite a sub-map's world pose, refreshing its cached bounds
    pub fn set_submap_pose(&mut self, id: SubmapId, pose: Pose) -> Result<()> {
        self.submap_mut(id)?.set_pose(pose);
        Ok(())
    }

    /// Read a sub-map's world pose
    pub fn get_submap_pose(&self, id: SubmapId) -> Result<Pose> {
        Ok(*self.submap(id)?.pose())
    }

    /// Deep-copy sub-map `src` under id `dst`
    ///
    /// The copy shares no state with the source and is independently
    /// mutable in pose. Used by the registration harness when reference
    /// and reading ids coincide.
    pub fn duplicate_submap(&mut self, src: SubmapId, dst: SubmapId) -> Result<()> {
        if self.submaps.contains_key(&dst) {
            return Err(Error::InvalidInput(format!(
                "destination id {dst} is already taken"
            )));
        }
        let copy = self.submap(src)?.duplicate(dst);
        self.submaps.insert(dst, copy);
        self.next_id = self.next_id.max(dst + 1);
        Ok(())
    }

    /// An id guaranteed to be free
    pub fn unused_id(&self) -> SubmapId {
        self.next_id
    }

    /// Insert an externally constructed (deserialized) sub-map
    pub fn insert_submap(&mut self, submap: Submap) {
        self.next_id = self.next_id.max(submap.id() + 1);
        self.submaps.insert(submap.id(), submap);
    }

    /// All unordered pairs of finished sub-maps whose bounds overlap
    pub fn overlapping_pairs(&self) -> Vec<(SubmapId, SubmapId)> {
        let ids = self.finished_ids();
        let mut pairs = Vec::new();
        for (i, &first) in ids.iter().enumerate() {
            for &second in &ids[i + 1..] {
                let a = &self.submaps[&first];
                let b = &self.submaps[&second];
                if a.overlaps_with(b) {
                    pairs.push((first, second));
                }
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::{GlobalIndex, TsdfVoxel};
    use nalgebra::Isometry3;

    fn test_config() -> SubmapConfig {
        SubmapConfig {
            voxel_size: 0.1,
            voxels_per_side: 8,
            generate_esdf_on_seal: false,
            ..SubmapConfig::default()
        }
    }

    const SECOND: u64 = 1_000_000_000;

    #[test]
    fn test_window_rotation() {
        let mut collection = SubmapCollection::new(test_config(), 20 * SECOND);
        assert!(collection.should_create_new_submap(0));

        let first = collection.create_new_submap(Isometry3::identity(), 0);
        assert_eq!(first, 0);
        assert!(!collection.should_create_new_submap(19 * SECOND));
        assert!(collection.should_create_new_submap(20 * SECOND));

        let second = collection.create_new_submap(Isometry3::translation(1.0, 0.0, 0.0), 20 * SECOND);
        assert_eq!(second, 1);
        assert_eq!(collection.active_submap_id().unwrap(), 1);

        // Sealing happened on rotation
        assert_eq!(
            collection.submap(0).unwrap().state(),
            SubmapState::Finished
        );
        assert_eq!(collection.submap(1).unwrap().state(), SubmapState::Active);
        assert_eq!(collection.finished_ids(), vec![0]);
    }

    #[test]
    fn test_first_submap_is_constant() {
        let mut collection = SubmapCollection::new(test_config(), SECOND);
        collection.create_new_submap(Isometry3::identity(), 0);
        collection.create_new_submap(Isometry3::identity(), SECOND);
        assert!(collection.submap(0).unwrap().is_constant());
        assert!(!collection.submap(1).unwrap().is_constant());
    }

    #[test]
    fn test_timeline_follows_creation() {
        let mut collection = SubmapCollection::new(test_config(), SECOND);
        collection.create_new_submap(Isometry3::identity(), 0);
        collection.create_new_submap(Isometry3::identity(), SECOND);
        assert_eq!(collection.timeline().active_submap_at(0), Some(0));
        assert_eq!(collection.timeline().active_submap_at(SECOND + 1), Some(1));
    }

    #[test]
    fn test_unknown_id_errors() {
        let mut collection = SubmapCollection::new(test_config(), SECOND);
        assert!(matches!(
            collection.get_submap_pose(3),
            Err(Error::UnknownSubmap(3))
        ));
        assert!(matches!(
            collection.set_submap_pose(3, Isometry3::identity()),
            Err(Error::UnknownSubmap(3))
        ));
        assert!(matches!(
            collection.active_submap_id(),
            Err(Error::NoActiveSubmap)
        ));
    }

    #[test]
    fn test_duplicate_submap() {
        let mut collection = SubmapCollection::new(test_config(), SECOND);
        let id = collection.create_new_submap(Isometry3::identity(), 0);
        *collection
            .active_submap_mut()
            .unwrap()
            .tsdf_grid_mut()
            .voxel_mut_at(GlobalIndex::new(0, 0, 0)) = TsdfVoxel {
            distance: 0.1,
            weight: 1.0,
        };

        let dst = collection.unused_id();
        collection.duplicate_submap(id, dst).unwrap();
        assert_eq!(collection.len(), 2);
        assert!(collection.duplicate_submap(id, dst).is_err());

        // Ids are never reused after a duplicate claimed one
        let fresh = collection.create_new_submap(Isometry3::identity(), SECOND);
        assert!(fresh > dst);
    }
}
