//! Split a full image into padded tiles, and put per-tile estimates back.
//!
//! Tiles are enumerated row-major: tile `k` sits at tile-row `k / n_tiles_w`
//! and tile-column `k % n_tiles_w`. Every consumer of per-tile arrays (the
//! posterior head, the loss engine, the catalog stitcher) relies on this
//! ordering.
//!
//! Images are laid out `[H, W, bands]`; tiles are laid out
//! `[n_tiles, bands, ptile_slen, ptile_slen]` where
//! `ptile_slen = tile_slen + 2 * pad`. Padding that falls outside the image is
//! filled with zeros.

use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4};
use tracing::debug;

use crate::error::{BlissError, Result};

/// Geometry of a tiled image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    image_height: usize,
    image_width: usize,
    tile_slen: usize,
    pad: usize,
}

impl TileGrid {
    /// Build the tile grid for an `image_height × image_width` image.
    ///
    /// Both dimensions must be exact multiples of `tile_slen`.
    pub fn new(image_height: usize, image_width: usize, tile_slen: usize, pad: usize) -> Result<Self> {
        if tile_slen == 0
            || image_height == 0
            || image_width == 0
            || image_height % tile_slen != 0
            || image_width % tile_slen != 0
        {
            return Err(BlissError::shape(
                "tile grid (image dims must be positive multiples of tile_slen)",
                format!("multiples of {tile_slen}"),
                (image_height, image_width),
            ));
        }
        Ok(Self {
            image_height,
            image_width,
            tile_slen,
            pad,
        })
    }

    pub fn image_height(&self) -> usize {
        self.image_height
    }

    pub fn image_width(&self) -> usize {
        self.image_width
    }

    pub fn tile_slen(&self) -> usize {
        self.tile_slen
    }

    pub fn pad(&self) -> usize {
        self.pad
    }

    /// Side length of a padded tile.
    pub fn ptile_slen(&self) -> usize {
        self.tile_slen + 2 * self.pad
    }

    /// Number of tile rows.
    pub fn n_tiles_h(&self) -> usize {
        self.image_height / self.tile_slen
    }

    /// Number of tile columns.
    pub fn n_tiles_w(&self) -> usize {
        self.image_width / self.tile_slen
    }

    pub fn n_tiles(&self) -> usize {
        self.n_tiles_h() * self.n_tiles_w()
    }

    /// Row-major index of the tile at (`tile_row`, `tile_col`).
    pub fn tile_index(&self, tile_row: usize, tile_col: usize) -> usize {
        tile_row * self.n_tiles_w() + tile_col
    }

    /// Pixel (row, col) of the top-left corner of the unpadded tile `index`.
    pub fn tile_origin(&self, index: usize) -> (usize, usize) {
        let w = self.n_tiles_w();
        ((index / w) * self.tile_slen, (index % w) * self.tile_slen)
    }

    /// Iterate over all tile origins in enumeration order.
    pub fn origins(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.n_tiles()).map(move |k| self.tile_origin(k))
    }

    /// Cut `image[H, W, bands]` into padded tiles
    /// `[n_tiles, bands, ptile_slen, ptile_slen]`.
    pub fn partition(&self, image: ArrayView3<f32>) -> Result<Array4<f32>> {
        let (h, w, n_bands) = image.dim();
        if (h, w) != (self.image_height, self.image_width) {
            return Err(BlissError::shape(
                "partition image",
                (self.image_height, self.image_width),
                (h, w),
            ));
        }

        let p = self.ptile_slen();
        let pad = self.pad as isize;
        let mut tiles = Array4::<f32>::zeros((self.n_tiles(), n_bands, p, p));

        for (k, (row0, col0)) in self.origins().enumerate() {
            for i in 0..p {
                let r = row0 as isize + i as isize - pad;
                if r < 0 || r >= h as isize {
                    continue;
                }
                for j in 0..p {
                    let c = col0 as isize + j as isize - pad;
                    if c < 0 || c >= w as isize {
                        continue;
                    }
                    for b in 0..n_bands {
                        tiles[[k, b, i, j]] = image[[r as usize, c as usize, b]];
                    }
                }
            }
        }

        debug!(
            "Partitioned {}x{}x{} image into {} tiles of side {}",
            h,
            w,
            n_bands,
            self.n_tiles(),
            p
        );
        Ok(tiles)
    }

    /// Inverse of [`partition`](Self::partition) for unpadded per-tile maps:
    /// `per_tile[n_tiles, bands, tile_slen, tile_slen]` → `image[H, W, bands]`.
    ///
    /// Tile `k` lands at `tile_origin(k)`.
    pub fn stitch(&self, per_tile: ArrayView4<f32>) -> Result<Array3<f32>> {
        let (n, n_bands, th, tw) = per_tile.dim();
        if n != self.n_tiles() || th != self.tile_slen || tw != self.tile_slen {
            return Err(BlissError::shape(
                "stitch tiles",
                (self.n_tiles(), n_bands, self.tile_slen, self.tile_slen),
                (n, n_bands, th, tw),
            ));
        }

        let t = self.tile_slen;
        let mut image = Array3::<f32>::zeros((self.image_height, self.image_width, n_bands));
        for (k, (row0, col0)) in self.origins().enumerate() {
            for b in 0..n_bands {
                image
                    .slice_mut(s![row0..row0 + t, col0..col0 + t, b])
                    .assign(&per_tile.slice(s![k, b, .., ..]));
            }
        }
        Ok(image)
    }

    /// Drop the padding of partitioned tiles, leaving
    /// `[n_tiles, bands, tile_slen, tile_slen]`.
    pub fn trim_padding(&self, tiles: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (n, _, ph, pw) = tiles.dim();
        let p = self.ptile_slen();
        if n != self.n_tiles() || ph != p || pw != p {
            return Err(BlissError::shape(
                "trim tiles",
                (self.n_tiles(), p, p),
                (n, ph, pw),
            ));
        }
        let lo = self.pad;
        let hi = self.pad + self.tile_slen;
        Ok(tiles.slice(s![.., .., lo..hi, lo..hi]).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp_image(h: usize, w: usize, bands: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, bands), |(r, c, b)| {
            (r * 1000 + c * 10 + b) as f32
        })
    }

    #[test]
    fn test_indivisible_image_rejected() {
        let err = TileGrid::new(21, 20, 5, 0).unwrap_err();
        assert!(matches!(err, BlissError::ShapeMismatch { .. }));
        assert!(TileGrid::new(20, 20, 0, 0).is_err());
    }

    #[test]
    fn test_twenty_by_twenty_origins() {
        let grid = TileGrid::new(20, 20, 5, 0).unwrap();
        assert_eq!(grid.n_tiles(), 16);
        let origins: Vec<_> = grid.origins().collect();
        assert_eq!(origins[0], (0, 0));
        assert_eq!(origins[1], (0, 5));
        assert_eq!(origins[4], (5, 0));
        assert_eq!(origins[15], (15, 15));
        assert_eq!(grid.tile_origin(grid.tile_index(1, 2)), (5, 10));
    }

    #[test]
    fn test_partition_shape_and_content() {
        let grid = TileGrid::new(8, 12, 4, 1).unwrap();
        let image = ramp_image(8, 12, 2);
        let tiles = grid.partition(image.view()).unwrap();
        assert_eq!(tiles.dim(), (6, 2, 6, 6));

        // Tile (1, 2): origin (4, 8). Padded pixel (1, 1) is image (4, 8).
        let k = grid.tile_index(1, 2);
        assert_eq!(tiles[[k, 1, 1, 1]], image[[4, 8, 1]]);
        // Padded pixel (0, 0) is image (3, 7).
        assert_eq!(tiles[[k, 0, 0, 0]], image[[3, 7, 0]]);
        // Padding beyond the right edge is zero.
        assert_eq!(tiles[[k, 0, 2, 5]], 0.0);
        // Padding above the first row is zero.
        assert_eq!(tiles[[0, 0, 0, 3]], 0.0);
    }

    #[test]
    fn test_partition_wrong_image_size() {
        let grid = TileGrid::new(8, 8, 4, 0).unwrap();
        let image = ramp_image(8, 12, 1);
        assert!(grid.partition(image.view()).is_err());
    }

    #[test]
    fn test_partition_stitch_round_trip() {
        let grid = TileGrid::new(20, 20, 5, 2).unwrap();
        let image = ramp_image(20, 20, 3);
        let tiles = grid.partition(image.view()).unwrap();
        let core = grid.trim_padding(tiles.view()).unwrap();
        let back = grid.stitch(core.view()).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn test_stitch_rejects_wrong_tile_count() {
        let grid = TileGrid::new(10, 10, 5, 0).unwrap();
        let per_tile = Array4::<f32>::zeros((3, 1, 5, 5));
        assert!(grid.stitch(per_tile.view()).is_err());
    }
}
