//! Multi-atlas label fusion driver
//!
//! Owns the target, the atlases and the optional mask and exclusion maps,
//! validates the configuration, selects the voxels to fuse and runs the
//! per-voxel pipeline (patch -> local search -> weights -> vote) over them in
//! parallel.
//!
//! Each voxel reads only shared, immutable inputs and produces its own result,
//! so rows of the fusion region are processed independently on a rayon pool
//! and scattered into the outputs in a fixed order. Outputs do not depend on
//! the number of threads.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::FusionConfig;
use crate::error::{FusionError, Result};
use crate::grid::{Grid, Region};
use crate::patch::{patch_len, PatchSampler};
use crate::search::{best_match, SearchWindow};
use crate::vote::{aggregate, Vote};
use crate::weights::WeightMethod;

/// Map from label to the voxels where that label is forbidden (non-zero)
pub type ExclusionMaps = BTreeMap<i32, Grid<u8>>;

/// Map from label to its posterior probability map
pub type PosteriorTable = BTreeMap<i32, Grid<f64>>;

/// One reference image, pre-registered to the target
#[derive(Clone, Debug)]
pub struct AtlasEntry {
    pub intensity: Grid<f64>,
    pub label: Option<Grid<i32>>,
}

/// Results of a completed run
#[derive(Clone, Debug)]
pub struct FusionOutput {
    /// Fused segmentation, 0 outside the fusion region
    pub labels: Grid<i32>,
    /// Posterior per label (when retained)
    pub posteriors: Option<PosteriorTable>,
    /// Weight map per atlas, 1/K outside the fusion region (when generated)
    pub weight_maps: Option<Vec<Grid<f64>>>,
    /// Voxels that were considered for fusion
    pub region: Region,
}

/// Label fusion engine in its configured state
pub struct LabelFusion {
    target: Grid<f64>,
    atlases: Vec<AtlasEntry>,
    mask: Option<Grid<u8>>,
    exclusions: ExclusionMaps,
    config: FusionConfig,
}

impl LabelFusion {
    pub fn new(target: Grid<f64>, config: FusionConfig) -> Self {
        Self {
            target,
            atlases: Vec::new(),
            mask: None,
            exclusions: BTreeMap::new(),
            config,
        }
    }

    pub fn add_atlas(&mut self, intensity: Grid<f64>, label: Option<Grid<i32>>) -> &mut Self {
        self.atlases.push(AtlasEntry { intensity, label });
        self
    }

    /// Restrict fusion to voxels where `mask` is non-zero
    pub fn set_mask(&mut self, mask: Grid<u8>) -> &mut Self {
        self.mask = Some(mask);
        self
    }

    /// Forbid `label` wherever `map` is non-zero
    pub fn add_exclusion_map(&mut self, label: i32, map: Grid<u8>) -> &mut Self {
        self.exclusions.insert(label, map);
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    fn num_labeled(&self) -> usize {
        self.atlases.iter().filter(|a| a.label.is_some()).count()
    }

    /// Check everything that can be checked before touching a voxel
    pub fn validate(&self) -> Result<()> {
        let n = self.atlases.len();
        let labeled = self.num_labeled();

        if labeled > 0 && labeled != n {
            return Err(FusionError::AtlasLabelCountMismatch { atlases: n, labels: labeled });
        }
        if n < 2 {
            return Err(FusionError::TooFewAtlases(n));
        }
        if labeled == 0 && !self.config.generate_weight_maps {
            return Err(FusionError::NothingToCompute);
        }

        self.config.validate(self.target.ndim())?;

        for (i, atlas) in self.atlases.iter().enumerate() {
            self.target.check_same_dims(&atlas.intensity, &format!("atlas {}", i))?;
            if let Some(label) = &atlas.label {
                self.target.check_same_dims(label, &format!("segmentation {}", i))?;
            }
        }
        if let Some(mask) = &self.mask {
            self.target.check_same_dims(mask, "mask")?;
        }
        for (label, map) in &self.exclusions {
            self.target.check_same_dims(map, &format!("exclusion map for label {}", label))?;
        }
        Ok(())
    }

    /// Voxels to fuse
    ///
    /// The bounding box of the mask and of all non-zero atlas labels (the
    /// whole image when neither exists), cropped so that every patch and
    /// search window stays inside the image.
    pub fn fusion_region(&self) -> Region {
        let (patch, search) = self.config.effective_radii(self.target.ndim());
        let margin = [patch[0] + search[0], patch[1] + search[1], patch[2] + search[2]];
        let inner = self.target.region().shrink(margin);

        let mut extent: Option<Region> = self.mask.as_ref().and_then(|m| m.nonzero_bounds());
        for label in self.atlases.iter().filter_map(|a| a.label.as_ref()) {
            if let Some(b) = label.nonzero_bounds() {
                extent = Some(match extent {
                    Some(e) => e.union(&b),
                    None => b,
                });
            }
        }

        extent.unwrap_or_else(|| self.target.region()).crop(&inner)
    }

    /// Run fusion over the whole fusion region
    pub fn run(&self) -> Result<FusionOutput> {
        self.run_with_progress(|_, _| {})
    }

    /// Run fusion, calling `progress(plane, total_planes)` after each z-plane
    pub fn run_with_progress<F>(&self, mut progress: F) -> Result<FusionOutput>
    where
        F: FnMut(usize, usize),
    {
        self.validate()?;

        let region = self.fusion_region();
        self.log_parameters(&region);

        let pool = build_pool(self.config.threads)?;
        let engine = VoxelEngine::new(self);
        let k = self.atlases.len();

        let mut labels = self.target.like(0i32);
        let mut posteriors = if self.config.retain_posteriors {
            Some(self.initial_posterior_table())
        } else {
            None
        };
        let mut weight_maps = if self.config.generate_weight_maps {
            Some(vec![self.target.like(1.0 / k as f64); k])
        } else {
            None
        };

        if region.is_empty() {
            log::warn!("Fusion region is empty; the output is all background");
            return Ok(FusionOutput { labels, posteriors, weight_maps, region });
        }

        let planes = region.size[2];
        for (plane, z) in (region.index[2]..region.end(2)).enumerate() {
            let rows: Vec<RowResult> = in_pool(pool.as_ref(), || {
                (region.index[1]..region.end(1))
                    .into_par_iter()
                    .map(|y| engine.fuse_row(&region, y, z))
                    .collect()
            });

            for (y, row) in (region.index[1]..region.end(1)).zip(rows) {
                let row_start = self.target.offset([region.index[0], y, z]);
                for (dx, vote) in row.votes.into_iter().enumerate() {
                    let Some(vote) = vote else { continue };
                    let offset = row_start + dx;

                    labels.data_mut()[offset] = vote.label;

                    if let Some(table) = posteriors.as_mut() {
                        for &(label, p) in &vote.posteriors {
                            table
                                .entry(label)
                                .or_insert_with(|| self.target.like(0.0))
                                .data_mut()[offset] = p;
                        }
                    }

                    if let Some(maps) = weight_maps.as_mut() {
                        let w = &row.weights[dx * k..(dx + 1) * k];
                        for (map, &wi) in maps.iter_mut().zip(w.iter()) {
                            map.data_mut()[offset] = wi;
                        }
                    }
                }
            }

            log::debug!("Fused plane {}/{} (z = {})", plane + 1, planes, z);
            progress(plane + 1, planes);
        }

        log::info!("Label fusion complete: {} voxels", region.num_voxels());
        Ok(FusionOutput { labels, posteriors, weight_maps, region })
    }

    /// One zero-filled posterior map per label present in any atlas
    fn initial_posterior_table(&self) -> PosteriorTable {
        let mut found = BTreeSet::new();
        for label in self.atlases.iter().filter_map(|a| a.label.as_ref()) {
            found.extend(label.data().iter().copied());
        }
        found.into_iter().map(|l| (l, self.target.like(0.0))).collect()
    }

    fn log_parameters(&self, region: &Region) {
        let (patch, search) = self.config.effective_radii(self.target.ndim());
        log::info!("LABEL FUSION PARAMETERS:");
        log::info!("Target image: {:?} ({}D)", self.target.dims(), self.target.ndim());
        log::info!(
            "Atlas images: {} ({})",
            self.atlases.len(),
            if self.num_labeled() > 0 { "with segmentations" } else { "intensity only" }
        );
        log::info!("Method: {}", self.config.method);
        log::info!("Patch radius: {:?}, search radius: {:?}", patch, search);
        log::info!(
            "Mask: {}, exclusion maps: {:?}",
            self.mask.is_some(),
            self.exclusions.keys().collect::<Vec<_>>()
        );
        log::info!(
            "Posterior maps: {}, weight maps: {}",
            self.config.retain_posteriors,
            self.config.generate_weight_maps
        );
        log::info!(
            "Output requested region: {:?}, {:?} ({} voxels)",
            region.index,
            region.size,
            region.num_voxels()
        );
    }
}

fn build_pool(threads: usize) -> Result<Option<ThreadPool>> {
    if threads == 0 {
        log::info!("Executing with the default number of threads: {}", rayon::current_num_threads());
        return Ok(None);
    }
    log::info!("Limiting the number of threads to {}", threads);
    Ok(Some(ThreadPoolBuilder::new().num_threads(threads).build()?))
}

fn in_pool<R, F>(pool: Option<&ThreadPool>, op: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match pool {
        Some(p) => p.install(op),
        None => op(),
    }
}

/// Per-row results, in x order
struct RowResult {
    /// None where the mask excludes the voxel
    votes: Vec<Option<Vote>>,
    /// K weights per voxel when weight maps are generated
    weights: Vec<f64>,
}

/// Scratch buffers reused across the voxels of one row
struct Workspace {
    target_patch: Vec<f64>,
    atlas_patches: Vec<f64>,
    scores: Vec<f64>,
    labels: Vec<i32>,
    weights: Vec<f64>,
}

/// Read-only view of a configured run, shared by all workers
struct VoxelEngine<'a> {
    target: &'a Grid<f64>,
    atlases: &'a [AtlasEntry],
    mask: Option<&'a Grid<u8>>,
    exclusions: &'a ExclusionMaps,
    method: WeightMethod,
    sampler: PatchSampler,
    window: SearchWindow,
    labeled: bool,
    keep_weights: bool,
}

impl<'a> VoxelEngine<'a> {
    fn new(fusion: &'a LabelFusion) -> Self {
        let (patch, search) = fusion.config.effective_radii(fusion.target.ndim());
        Self {
            target: &fusion.target,
            atlases: &fusion.atlases,
            mask: fusion.mask.as_ref(),
            exclusions: &fusion.exclusions,
            method: fusion.config.method,
            sampler: PatchSampler::new(&fusion.target, patch),
            window: SearchWindow::new(&fusion.target, search),
            labeled: fusion.num_labeled() > 0,
            keep_weights: fusion.config.generate_weight_maps,
        }
    }

    fn workspace(&self) -> Workspace {
        let n = self.sampler.len();
        let k = self.atlases.len();
        Workspace {
            target_patch: vec![0.0; n],
            atlas_patches: vec![0.0; n * k],
            scores: vec![0.0; k],
            labels: vec![0; k],
            weights: vec![0.0; k],
        }
    }

    fn fuse_row(&self, region: &Region, y: usize, z: usize) -> RowResult {
        let k = self.atlases.len();
        let mut ws = self.workspace();
        let mut votes = Vec::with_capacity(region.size[0]);
        let mut weights = if self.keep_weights {
            Vec::with_capacity(region.size[0] * k)
        } else {
            Vec::new()
        };

        let row_start = self.target.offset([region.index[0], y, z]);
        for center in row_start..row_start + region.size[0] {
            let vote = self.fuse_voxel(center, &mut ws);
            if self.keep_weights {
                if vote.is_some() {
                    weights.extend_from_slice(&ws.weights);
                } else {
                    weights.extend(std::iter::repeat(1.0 / k as f64).take(k));
                }
            }
            votes.push(vote);
        }

        RowResult { votes, weights }
    }

    #[inline]
    fn is_excluded(&self, label: i32, center: usize) -> bool {
        self.exclusions.get(&label).map_or(false, |map| map.at(center) != 0)
    }

    /// Label shared by every atlas over its whole search window, if any
    fn consensus(&self, center: usize) -> Option<i32> {
        let mut agreed: Option<i32> = None;
        for atlas in self.atlases {
            let label = atlas.label.as_ref()?;
            for &flat in self.window.flat() {
                let l = label.at((center as isize + flat) as usize);
                match agreed {
                    Some(a) if a != l => return None,
                    Some(_) => {}
                    None => agreed = Some(l),
                }
            }
        }
        agreed
    }

    fn fuse_voxel(&self, center: usize, ws: &mut Workspace) -> Option<Vote> {
        if let Some(mask) = self.mask {
            if mask.at(center) == 0 {
                return None;
            }
        }

        // Unanimous atlases decide the voxel without patch comparison. Weight
        // maps need the actual weights, so the shortcut is skipped for them.
        if self.labeled && !self.keep_weights {
            if let Some(label) = self.consensus(center) {
                return Some(if self.is_excluded(label, center) {
                    Vote::background()
                } else {
                    Vote::unanimous(label)
                });
            }
        }

        self.sampler.sample_into(self.target, center, &mut ws.target_patch);

        let n = self.sampler.len();
        let needs_patches = matches!(self.method, WeightMethod::Joint { .. });
        for (i, atlas) in self.atlases.iter().enumerate() {
            let m = best_match(&ws.target_patch, &atlas.intensity, center, &self.window, &self.sampler);
            ws.scores[i] = m.score;
            if needs_patches {
                self.sampler
                    .sample_into(&atlas.intensity, m.center, &mut ws.atlas_patches[i * n..(i + 1) * n]);
            }
            if let Some(label) = &atlas.label {
                ws.labels[i] = label.at(m.center);
            }
        }

        self.method
            .estimate(&ws.target_patch, &ws.atlas_patches, &ws.scores, &mut ws.weights);

        if self.labeled {
            Some(aggregate(&ws.weights, &ws.labels, |l| self.is_excluded(l, center)))
        } else {
            Some(Vote::background())
        }
    }
}

/// Number of voxels in a patch for `config` on an image of dimensionality `ndim`
pub fn patch_size(config: &FusionConfig, ndim: usize) -> usize {
    patch_len(config.effective_radii(ndim).0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Smooth 3D test image with a bright blob at `peak`
    fn blob(dims: [usize; 3], peak: [f64; 3], scale: f64) -> Grid<f64> {
        let mut g = Grid::filled(dims, 0.0);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let d2 = (i as f64 - peak[0]).powi(2)
                        + (j as f64 - peak[1]).powi(2)
                        + (k as f64 - peak[2]).powi(2);
                    g.set([i, j, k], scale * (-d2 / 8.0).exp());
                }
            }
        }
        g
    }

    /// Label 1 inside a sphere of `radius` around `peak`
    fn sphere_labels(dims: [usize; 3], peak: [f64; 3], radius: f64) -> Grid<i32> {
        let mut g = Grid::filled(dims, 0);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let d2 = (i as f64 - peak[0]).powi(2)
                        + (j as f64 - peak[1]).powi(2)
                        + (k as f64 - peak[2]).powi(2);
                    if d2 <= radius * radius {
                        g.set([i, j, k], 1);
                    }
                }
            }
        }
        g
    }

    fn small_config() -> FusionConfig {
        FusionConfig::default()
            .with_patch_radius([1, 1, 1])
            .with_search_radius([1, 1, 1])
    }

    fn three_atlas_fusion(config: FusionConfig) -> LabelFusion {
        let dims = [12, 12, 12];
        let peak = [6.0, 6.0, 6.0];
        let mut lf = LabelFusion::new(blob(dims, peak, 100.0), config);
        lf.add_atlas(blob(dims, [6.0, 6.0, 6.0], 100.0), Some(sphere_labels(dims, peak, 2.5)));
        lf.add_atlas(blob(dims, [7.0, 6.0, 6.0], 100.0), Some(sphere_labels(dims, [7.0, 6.0, 6.0], 2.5)));
        lf.add_atlas(blob(dims, [6.0, 5.0, 6.0], 90.0), Some(sphere_labels(dims, [6.0, 5.0, 6.0], 2.5)));
        lf
    }

    #[test]
    fn test_too_few_atlases() {
        let mut lf = LabelFusion::new(Grid::filled([5, 5, 5], 0.0), small_config());
        lf.add_atlas(Grid::filled([5, 5, 5], 0.0), Some(Grid::filled([5, 5, 5], 0)));
        assert!(matches!(lf.run(), Err(FusionError::TooFewAtlases(1))));
    }

    #[test]
    fn test_partial_labels_rejected() {
        let mut lf = LabelFusion::new(Grid::filled([5, 5, 5], 0.0), small_config());
        lf.add_atlas(Grid::filled([5, 5, 5], 0.0), Some(Grid::filled([5, 5, 5], 0)));
        lf.add_atlas(Grid::filled([5, 5, 5], 0.0), None);
        assert!(matches!(
            lf.validate(),
            Err(FusionError::AtlasLabelCountMismatch { atlases: 2, labels: 1 })
        ));
    }

    #[test]
    fn test_weight_maps_with_search_rejected() {
        let lf = three_atlas_fusion(small_config().with_weight_maps(true));
        assert!(matches!(lf.run(), Err(FusionError::WeightMapsRequireZeroSearch)));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut lf = three_atlas_fusion(small_config());
        lf.set_mask(Grid::filled([5, 5, 5], 1));
        assert!(matches!(lf.validate(), Err(FusionError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_intensity_only_needs_weight_maps() {
        let mut lf = LabelFusion::new(Grid::filled([5, 5, 5], 0.0), small_config());
        lf.add_atlas(Grid::filled([5, 5, 5], 0.0), None);
        lf.add_atlas(Grid::filled([5, 5, 5], 0.0), None);
        assert!(matches!(lf.validate(), Err(FusionError::NothingToCompute)));
    }

    #[test]
    fn test_fusion_region_shrinks_and_follows_labels() {
        let lf = three_atlas_fusion(small_config());
        let r = lf.fusion_region();
        // Label bounding box is [4..=9] x [3..=8] x [4..=8], inner region [2..10)
        assert_eq!(r.index, [4, 3, 4]);
        assert_eq!(r.size, [6, 6, 5]);
        for d in 0..3 {
            assert!(r.index[d] >= 2 && r.end(d) <= 10);
        }
    }

    #[test]
    fn test_fusion_recovers_sphere() {
        let lf = three_atlas_fusion(small_config().with_method(WeightMethod::joint(0.1, 2.0)));
        let out = lf.run().unwrap();
        assert_eq!(out.labels.get([6, 6, 6]), 1);
        assert_eq!(out.labels.get([8, 6, 6]), 1);
        assert_eq!(out.labels.get([6, 6, 9]), 0);
        // Outside the region nothing is written
        assert_eq!(out.labels.get([0, 0, 0]), 0);
    }

    #[test]
    fn test_posteriors_sum_to_one() {
        let lf = three_atlas_fusion(small_config().with_posteriors(true));
        let out = lf.run().unwrap();
        let table = out.posteriors.as_ref().unwrap();
        assert_eq!(table.keys().copied().collect::<Vec<_>>(), vec![0, 1]);

        let r = out.region;
        for k in r.index[2]..r.end(2) {
            for j in r.index[1]..r.end(1) {
                for i in r.index[0]..r.end(0) {
                    let sum: f64 = table.values().map(|g| g.get([i, j, k])).sum();
                    assert_relative_eq!(sum, 1.0, epsilon = 1e-9);
                    let label = out.labels.get([i, j, k]);
                    let best = table[&label].get([i, j, k]);
                    assert!(table.values().all(|g| g.get([i, j, k]) <= best));
                }
            }
        }
    }

    #[test]
    fn test_deterministic_across_thread_counts() {
        let cfg = small_config()
            .with_method(WeightMethod::gaussian(0.5))
            .with_posteriors(true);
        let a = three_atlas_fusion(cfg.clone().with_threads(1)).run().unwrap();
        let b = three_atlas_fusion(cfg.with_threads(3)).run().unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.posteriors, b.posteriors);
    }

    #[test]
    fn test_weight_maps_default_outside_region() {
        let cfg = small_config().with_search_radius([0, 0, 0]).with_weight_maps(true);
        let out = three_atlas_fusion(cfg).run().unwrap();
        let maps = out.weight_maps.unwrap();
        assert_eq!(maps.len(), 3);
        for m in &maps {
            assert_relative_eq!(m.get([0, 0, 0]), 1.0 / 3.0);
        }
        let c = [6, 6, 6];
        let sum: f64 = maps.iter().map(|m| m.get(c)).sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
        // The atlas identical to the target dominates
        assert!(maps[0].get(c) > maps[1].get(c));
    }

    #[test]
    fn test_mask_limits_fusion() {
        let dims = [12, 12, 12];
        let mut lf = three_atlas_fusion(small_config());
        let mut mask = Grid::filled(dims, 0u8);
        mask.set([6, 6, 6], 1);
        lf.set_mask(mask);
        let out = lf.run().unwrap();
        assert_eq!(out.labels.get([6, 6, 6]), 1);
        assert_eq!(out.labels.get([7, 6, 6]), 0);
    }

    #[test]
    fn test_exclusion_forces_other_label() {
        let dims = [12, 12, 12];
        let mut lf = three_atlas_fusion(small_config().with_posteriors(true));
        let mut ex = Grid::filled(dims, 0u8);
        ex.set([6, 6, 6], 1);
        lf.add_exclusion_map(1, ex);
        let out = lf.run().unwrap();
        assert_eq!(out.labels.get([6, 6, 6]), 0);
        assert_eq!(out.posteriors.as_ref().unwrap()[&1].get([6, 6, 6]), 0.0);
        assert_eq!(out.labels.get([7, 6, 6]), 1);
    }

    #[test]
    fn test_fusion_2d() {
        let dims = [10, 10, 1];
        let mut target = Grid::filled(dims, 0.0);
        let mut label = Grid::filled(dims, 0);
        for j in 3..7 {
            for i in 3..7 {
                target.set([i, j, 0], 50.0);
                label.set([i, j, 0], 2);
            }
        }
        let cfg = FusionConfig::default()
            .with_patch_radius([1, 1, 1])
            .with_search_radius([1, 1, 1])
            .with_method(WeightMethod::gaussian(0.5));
        let mut lf = LabelFusion::new(target.clone(), cfg);
        lf.add_atlas(target.clone(), Some(label.clone()));
        lf.add_atlas(target, Some(label));
        let out = lf.run().unwrap();
        assert_eq!(out.region.size[2], 1);
        assert_eq!(out.labels.get([4, 4, 0]), 2);
        assert_eq!(out.labels.get([2, 2, 0]), 0);
        assert_eq!(patch_size(lf.config(), 2), 9);
    }

    #[test]
    fn test_consensus_matches_full_computation() {
        // Weight maps disable the consensus shortcut; labels must agree
        let base = small_config().with_search_radius([0, 0, 0]).with_posteriors(true);
        let fast = three_atlas_fusion(base.clone()).run().unwrap();
        let full = three_atlas_fusion(base.with_weight_maps(true)).run().unwrap();
        assert_eq!(fast.labels, full.labels);
        let (pf, pw) = (fast.posteriors.unwrap(), full.posteriors.unwrap());
        for (label, grid) in &pf {
            for (a, b) in grid.data().iter().zip(pw[label].data().iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_progress_reports_every_plane() {
        let lf = three_atlas_fusion(small_config());
        let mut calls = Vec::new();
        let out = lf.run_with_progress(|p, t| calls.push((p, t))).unwrap();
        let planes = out.region.size[2];
        assert_eq!(calls.len(), planes);
        assert_eq!(calls.last(), Some(&(planes, planes)));
    }
}
