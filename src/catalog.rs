//! Per-tile point estimates and the full-image catalog stitched from them.
//!
//! A [`TileEstimate`] holds, for every tile, a count and the parameters of
//! the first `count` slots (the rest are zero). [`stitch_catalog`] turns the
//! on slots into a single list of sources with absolute pixel positions,
//! walking tiles in the tile grid's row-major order.

use ndarray::{Array1, Array2, Array3};
use tracing::warn;

use crate::error::{BlissError, Result};
use crate::tile::TileGrid;
use crate::Vector2;

/// Point estimate (MAP or sampled) for every tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileEstimate {
    /// Number of sources per tile, `[n_tiles]`.
    pub n_sources: Array1<usize>,
    /// Tile-relative (row, col) in [0, 1), `[n_tiles, max, 2]`.
    pub locs: Array3<f64>,
    /// `[n_tiles, max, n_bands]`
    pub log_fluxes: Array3<f64>,
    /// `[n_tiles, max, n_galaxy_params]`
    pub galaxy_params: Array3<f64>,
    /// `[n_tiles, max]`, false for off slots.
    pub galaxy_bool: Array2<bool>,
    /// `[n_tiles, max]`, zero for off slots.
    pub prob_galaxy: Array2<f64>,
}

impl TileEstimate {
    pub fn n_tiles(&self) -> usize {
        self.n_sources.len()
    }

    pub fn max_detections(&self) -> usize {
        self.locs.dim().1
    }

    /// Slots holding an existing star: on and not a galaxy.
    pub fn star_bool(&self) -> Array2<bool> {
        star_bool(&self.n_sources, &self.galaxy_bool)
    }

    /// Linear fluxes of the stars, zero for galaxies and off slots.
    pub fn star_fluxes(&self) -> Array3<f64> {
        let stars = self.star_bool();
        let mut fluxes = self.log_fluxes.mapv(f64::exp);
        for ((t, s, _), f) in fluxes.indexed_iter_mut() {
            if !stars[[t, s]] {
                *f = 0.0;
            }
        }
        fluxes
    }
}

/// On and not galaxy, per slot.
pub fn star_bool(n_sources: &Array1<usize>, galaxy_bool: &Array2<bool>) -> Array2<bool> {
    let is_on = crate::loss::is_on_from_n_sources(n_sources.view(), galaxy_bool.ncols());
    ndarray::Zip::from(&is_on)
        .and(galaxy_bool)
        .map_collect(|&on, &gal| on && !gal)
}

// ── Catalog ─────────────────────────────────────────────────────────────────

/// One detected source in full-image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSource {
    /// Absolute pixel position (row, col).
    pub position: Vector2,
    /// Tile the source was detected in.
    pub tile_index: usize,
    pub log_fluxes: Vec<f64>,
    pub galaxy_params: Vec<f64>,
    pub is_galaxy: bool,
    pub prob_galaxy: f64,
}

impl CatalogSource {
    /// Linear per-band fluxes. Galaxies carry their flux in the shape
    /// parameters, so this is zero for them.
    pub fn fluxes(&self) -> Vec<f64> {
        if self.is_galaxy {
            vec![0.0; self.log_fluxes.len()]
        } else {
            self.log_fluxes.iter().map(|lf| lf.exp()).collect()
        }
    }
}

/// Sources of a whole image, in tile-enumeration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    pub image_height: usize,
    pub image_width: usize,
    pub sources: Vec<CatalogSource>,
    /// Set when sources were dropped to honour a maximum size.
    pub truncated: bool,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn galaxies(&self) -> impl Iterator<Item = &CatalogSource> {
        self.sources.iter().filter(|s| s.is_galaxy)
    }

    pub fn stars(&self) -> impl Iterator<Item = &CatalogSource> {
        self.sources.iter().filter(|s| !s.is_galaxy)
    }

    /// Positions divided by the image size, so both axes lie in [0, 1).
    pub fn normalized_locations(&self) -> Vec<Vector2> {
        let scale = Vector2::new(self.image_height as f64, self.image_width as f64);
        self.sources
            .iter()
            .map(|s| s.position.component_div(&scale))
            .collect()
    }
}

/// Stitch per-tile estimates into one catalog.
///
/// Each on slot's location becomes `tile_origin + loc * tile_slen`. When
/// `max_sources` is given and exceeded, the catalog is truncated with a
/// warning rather than failing.
pub fn stitch_catalog(
    estimate: &TileEstimate,
    grid: &TileGrid,
    max_sources: Option<usize>,
) -> Result<Catalog> {
    if estimate.n_tiles() != grid.n_tiles() {
        return Err(BlissError::shape(
            "tile estimate",
            grid.n_tiles(),
            estimate.n_tiles(),
        ));
    }
    let max = estimate.max_detections();
    if let Some(&bad) = estimate.n_sources.iter().find(|&&n| n > max) {
        return Err(BlissError::shape("tile source count", format!("<= {max}"), bad));
    }

    let slen = grid.tile_slen() as f64;
    let total: usize = estimate.n_sources.iter().sum();
    let mut sources = Vec::with_capacity(total.min(max_sources.unwrap_or(total)));

    for (t, (row0, col0)) in grid.origins().enumerate() {
        for slot in 0..estimate.n_sources[t] {
            let local = Vector2::new(estimate.locs[[t, slot, 0]], estimate.locs[[t, slot, 1]]);
            sources.push(CatalogSource {
                position: Vector2::new(row0 as f64, col0 as f64) + local * slen,
                tile_index: t,
                log_fluxes: (0..estimate.log_fluxes.dim().2)
                    .map(|b| estimate.log_fluxes[[t, slot, b]])
                    .collect(),
                galaxy_params: (0..estimate.galaxy_params.dim().2)
                    .map(|g| estimate.galaxy_params[[t, slot, g]])
                    .collect(),
                is_galaxy: estimate.galaxy_bool[[t, slot]],
                prob_galaxy: estimate.prob_galaxy[[t, slot]],
            });
        }
    }

    let mut truncated = false;
    if let Some(limit) = max_sources {
        if sources.len() > limit {
            warn!(
                "Catalog holds {} sources, truncating to {}",
                sources.len(),
                limit
            );
            sources.truncate(limit);
            truncated = true;
        }
    }

    Ok(Catalog {
        image_height: grid.image_height(),
        image_width: grid.image_width(),
        sources,
        truncated,
    })
}
