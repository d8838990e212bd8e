//! Slippy-map tile math.
//!
//! Converts a geographic viewport into the Web Mercator tiles that cover it,
//! and tiles back into their geographic bounds. All functions here are pure
//! and never fail on out-of-range input: zoom levels are clamped, latitudes
//! are clamped to the Mercator limits and tile indices to `[0, 2^z - 1]`.
//!
//! A viewport whose west edge lies east of its east edge crosses the
//! antimeridian and is covered as two longitude ranges.

use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TesseraError;

/// Web Mercator valid latitude range.
pub const MIN_LAT: f64 = -85.05112878;
pub const MAX_LAT: f64 = 85.05112878;

/// Default maximum zoom level.
pub const DEFAULT_MAX_ZOOM: u8 = 18;

/// Highest zoom whose tile indices fit in a `u32`.
pub const MAX_SUPPORTED_ZOOM: u8 = 31;

/// A tile in the Web Mercator / slippy map grid.
///
/// Ordered by zoom, then column, then row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub zoom: u8,
    /// Column, 0 at the antimeridian going east.
    pub x: u32,
    /// Row, 0 at the north edge.
    pub y: u32,
}

impl TileCoord {
    pub fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }

    /// Tiles per side at `zoom`.
    pub fn grid_size(zoom: u8) -> u64 {
        1u64 << zoom.min(MAX_SUPPORTED_ZOOM)
    }

    /// The tile containing the given point at `zoom`.
    pub fn containing(lon: f64, lat: f64, zoom: u8) -> Self {
        let zoom = zoom.min(MAX_SUPPORTED_ZOOM);
        Self {
            zoom,
            x: lon_to_x(wrap_lon(lon), zoom),
            y: lat_to_y(lat, zoom),
        }
    }

    /// Geographic bounds of this tile.
    pub fn bounds(&self) -> BoundingBox {
        tile_bounds(self)
    }

    /// Canonical cache key, `"{z}/{x}/{y}"`.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Manhattan distance in tile units. Columns wrap at the antimeridian.
    pub fn manhattan_distance(&self, other: &TileCoord) -> u64 {
        let dx = u64::from(self.x.abs_diff(other.x));
        let dx = dx.min(Self::grid_size(self.zoom).saturating_sub(dx));
        dx + u64::from(self.y.abs_diff(other.y))
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

impl FromStr for TileCoord {
    type Err = TesseraError;

    /// Parse a `"{z}/{x}/{y}"` key, rejecting indices outside the grid.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TesseraError::InvalidTileKey(s.to_owned());

        let mut parts = s.split('/');
        let (Some(z), Some(x), Some(y), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let zoom: u8 = z.parse().map_err(|_| invalid())?;
        let x: u32 = x.parse().map_err(|_| invalid())?;
        let y: u32 = y.parse().map_err(|_| invalid())?;

        if zoom > MAX_SUPPORTED_ZOOM {
            return Err(invalid());
        }
        let size = TileCoord::grid_size(zoom);
        if u64::from(x) >= size || u64::from(y) >= size {
            return Err(invalid());
        }

        Ok(TileCoord { zoom, x, y })
    }
}

/// Geographic bounds in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Build from a `[west, south, east, north]` array.
    pub fn from_wsen(wsen: [f64; 4]) -> Self {
        Self::new(wsen[0], wsen[1], wsen[2], wsen[3])
    }

    pub fn to_wsen(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }

    /// Whether the box wraps across the 180° meridian.
    pub fn crosses_antimeridian(&self) -> bool {
        wrap_lon(self.west) > wrap_lon(self.east)
    }

    /// Center point as `(lon, lat)`.
    pub fn center(&self) -> (f64, f64) {
        let west = wrap_lon(self.west);
        let mut east = wrap_lon(self.east);
        if west > east {
            east += 360.0;
        }
        let lat = (self.south + self.north) / 2.0;
        (wrap_lon((west + east) / 2.0), lat)
    }
}

/// A visible map region at a (possibly fractional) zoom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub bounds: BoundingBox,
    pub zoom: f64,
}

impl Viewport {
    pub fn new(bounds: BoundingBox, zoom: f64) -> Self {
        Self { bounds, zoom }
    }

    /// Integer tile zoom: floored, clamped to `[0, max_zoom]`.
    pub fn tile_zoom(&self, max_zoom: u8) -> u8 {
        let max_zoom = max_zoom.min(MAX_SUPPORTED_ZOOM);
        if !self.zoom.is_finite() || self.zoom <= 0.0 {
            return 0;
        }
        let floored = self.zoom.floor();
        if floored >= f64::from(max_zoom) {
            max_zoom
        } else {
            floored as u8
        }
    }

    /// The tile under the viewport center at [`tile_zoom`](Self::tile_zoom).
    pub fn center_tile(&self, max_zoom: u8) -> TileCoord {
        let (lon, lat) = self.bounds.center();
        TileCoord::containing(lon, lat, self.tile_zoom(max_zoom))
    }
}

/// Tiles covering `viewport` at its integer zoom.
///
/// The result is sorted and free of duplicates.
pub fn required_tiles(viewport: &Viewport, max_zoom: u8) -> Vec<TileCoord> {
    tiles_in_bounds(&viewport.bounds, viewport.tile_zoom(max_zoom))
}

/// Tiles covering `bounds` at `zoom`.
pub fn tiles_in_bounds(bounds: &BoundingBox, zoom: u8) -> Vec<TileCoord> {
    let zoom = zoom.min(MAX_SUPPORTED_ZOOM);
    let size = TileCoord::grid_size(zoom);

    let west = wrap_lon(bounds.west);
    let east = wrap_lon(bounds.east);
    let x_ranges = if bounds.east - bounds.west >= 360.0 {
        vec![(0, (size - 1) as u32)]
    } else if west > east {
        vec![
            (lon_to_x(west, zoom), (size - 1) as u32),
            (0, lon_to_x(east, zoom)),
        ]
    } else {
        vec![(lon_to_x(west, zoom), lon_to_x(east, zoom))]
    };

    let north = bounds.north.max(bounds.south);
    let south = bounds.north.min(bounds.south);
    let (min_y, max_y) = (lat_to_y(north, zoom), lat_to_y(south, zoom));

    let mut tiles = BTreeSet::new();
    for (min_x, max_x) in x_ranges {
        for x in min_x..=max_x {
            for y in min_y..=max_y {
                tiles.insert(TileCoord { zoom, x, y });
            }
        }
    }
    tiles.into_iter().collect()
}

/// Geographic bounds of `coord`, corner by corner.
pub fn tile_bounds(coord: &TileCoord) -> BoundingBox {
    let n = TileCoord::grid_size(coord.zoom) as f64;
    let x = f64::from(coord.x);
    let y = f64::from(coord.y);
    BoundingBox {
        west: x / n * 360.0 - 180.0,
        south: y_to_lat(y + 1.0, n),
        east: (x + 1.0) / n * 360.0 - 180.0,
        north: y_to_lat(y, n),
    }
}

/// Canonical cache key for `coord`.
pub fn tile_key(coord: &TileCoord) -> String {
    coord.key()
}

fn wrap_lon(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        lon
    } else {
        (lon + 180.0).rem_euclid(360.0) - 180.0
    }
}

fn clamp_index(value: f64, zoom: u8) -> u32 {
    let max = (TileCoord::grid_size(zoom) - 1) as f64;
    // NaN falls through both comparisons and lands on 0.
    if value >= max {
        max as u32
    } else if value > 0.0 {
        value as u32
    } else {
        0
    }
}

fn lon_to_x(lon: f64, zoom: u8) -> u32 {
    let n = TileCoord::grid_size(zoom) as f64;
    clamp_index(((lon + 180.0) / 360.0 * n).floor(), zoom)
}

fn lat_to_y(lat: f64, zoom: u8) -> u32 {
    let n = TileCoord::grid_size(zoom) as f64;
    let lat_rad = lat.clamp(MIN_LAT, MAX_LAT).to_radians();
    let y = (1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n;
    clamp_index(y.floor(), zoom)
}

fn y_to_lat(y: f64, n: f64) -> f64 {
    (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_york_at_zoom_16() {
        let tile = TileCoord::containing(-74.0060, 40.7128, 16);
        assert_eq!(tile, TileCoord::new(16, 19295, 24640));
    }

    #[test]
    fn zoom_zero_is_one_tile() {
        let viewport = Viewport::new(BoundingBox::new(-180.0, -85.0, 180.0, 85.0), 0.0);
        assert_eq!(required_tiles(&viewport, 18), vec![TileCoord::new(0, 0, 0)]);
    }

    #[test]
    fn negative_and_nan_zoom_clamp_to_zero() {
        let bounds = BoundingBox::new(-10.0, -10.0, 10.0, 10.0);
        assert_eq!(Viewport::new(bounds, -3.0).tile_zoom(18), 0);
        assert_eq!(Viewport::new(bounds, f64::NAN).tile_zoom(18), 0);
        assert_eq!(Viewport::new(bounds, 40.0).tile_zoom(18), 18);
        assert_eq!(Viewport::new(bounds, 4.7).tile_zoom(18), 4);
    }

    #[test]
    fn antimeridian_is_split_into_two_ranges() {
        let viewport = Viewport::new(BoundingBox::new(170.0, -10.0, -170.0, 10.0), 3.0);
        let tiles = required_tiles(&viewport, 18);
        let columns: BTreeSet<u32> = tiles.iter().map(|t| t.x).collect();
        assert_eq!(columns, BTreeSet::from([0, 7]));
    }

    #[test]
    fn polar_latitudes_are_clamped() {
        let viewport = Viewport::new(BoundingBox::new(-1.0, -90.0, 1.0, 90.0), 2.0);
        let tiles = required_tiles(&viewport, 18);
        assert!(tiles.iter().all(|t| t.y <= 3));
        assert!(tiles.iter().any(|t| t.y == 0));
        assert!(tiles.iter().any(|t| t.y == 3));
    }

    #[test]
    fn unwrapped_longitudes_are_normalised() {
        let viewport = Viewport::new(BoundingBox::new(170.0, -10.0, 190.0, 10.0), 3.0);
        let columns: BTreeSet<u32> = required_tiles(&viewport, 18).iter().map(|t| t.x).collect();
        assert_eq!(columns, BTreeSet::from([0, 7]));
    }

    #[test]
    fn bounds_of_origin_tile() {
        let b = tile_bounds(&TileCoord::new(1, 0, 0));
        assert_eq!(b.west, -180.0);
        assert_eq!(b.east, 0.0);
        assert!((b.north - MAX_LAT).abs() < 1e-6);
        assert!(b.south.abs() < 1e-9);
    }

    #[test]
    fn key_parses_back() {
        let coord = TileCoord::new(12, 2048, 1361);
        assert_eq!(tile_key(&coord), "12/2048/1361");
        assert_eq!(tile_key(&coord).parse::<TileCoord>().unwrap(), coord);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for key in ["", "1/2", "1/2/3/4", "a/0/0", "1/2/0", "32/0/0", "-1/0/0"] {
            assert!(
                matches!(key.parse::<TileCoord>(), Err(TesseraError::InvalidTileKey(_))),
                "{key} should be rejected"
            );
        }
    }

    #[test]
    fn center_of_antimeridian_box() {
        let (lon, _) = BoundingBox::new(170.0, 0.0, -170.0, 0.0).center();
        assert!((lon.abs() - 180.0).abs() < 1e-9);
    }
}
