//! Tile addressing
//!
//! Converts between geographic degrees, region grid indices, board pixels
//! and the TerraSync naming scheme (`w012n45` tiles grouped in `w020n40`
//! hecto folders).
//!
//! All conversions go through a [`RegionContext`], fixed when a region is
//! activated and passed explicitly to every call.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Side of the default square region, in degrees
pub const DEFAULT_REGION_DIM: usize = 46;

/// Horizontal bounds a region may extend to
pub const REGION_LON_LIMIT: i32 = 190;

/// Vertical bounds a region may extend to
pub const REGION_LAT_LIMIT: i32 = 90;

/// One 1°x1° tile of the active region, by grid indices.
///
/// `i` runs west to east, `j` south to north.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCell {
    pub i: usize,
    pub j: usize,
}

impl GridCell {
    pub fn new(i: usize, j: usize) -> Self {
        Self { i, j }
    }
}

impl std::fmt::Display for GridCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.i, self.j)
    }
}

/// Geographic bounds of a region, in whole degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionBox {
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
    pub top: i32,
}

impl RegionBox {
    pub fn new(left: i32, bottom: i32, right: i32, top: i32) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    /// Square region of side `dim` anchored at its south-west corner
    pub fn square(left: i32, bottom: i32, dim: usize) -> Self {
        let side = dim as i32;
        Self::new(left, bottom, left + side, bottom + side)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.top - self.bottom
    }
}

/// Immutable transform context of one activated region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionContext {
    left_lon: i32,
    bottom_lat: i32,
    dim: usize,
    one_degree_px: f64,
}

impl RegionContext {
    /// Build the context for `region`, rendered on a board where one degree
    /// spans `one_degree_px` pixels.
    ///
    /// The region must be a `dim` x `dim` square inside the extended world
    /// box (longitudes -190..=190, latitudes -90..=90).
    pub fn new(region: RegionBox, dim: usize, one_degree_px: f64) -> Result<Self> {
        if dim == 0 {
            return Err(SyncError::Region("region dimension is zero".to_string()));
        }
        if region.width() != dim as i32 || region.height() != dim as i32 {
            return Err(SyncError::Region(format!(
                "region {}x{} is not a {}x{} square",
                region.width(),
                region.height(),
                dim,
                dim
            )));
        }
        if region.left < -REGION_LON_LIMIT
            || region.right > REGION_LON_LIMIT
            || region.bottom < -REGION_LAT_LIMIT
            || region.top > REGION_LAT_LIMIT
        {
            return Err(SyncError::Region(format!(
                "region bounds {:?} exceed the world box",
                region
            )));
        }
        if !(one_degree_px.is_finite() && one_degree_px > 0.0) {
            return Err(SyncError::Region(format!(
                "invalid board scale {}",
                one_degree_px
            )));
        }

        Ok(Self {
            left_lon: region.left,
            bottom_lat: region.bottom,
            dim,
            one_degree_px,
        })
    }

    /// Context for a region drawn on a square board of `board_px` pixels
    pub fn for_board(region: RegionBox, dim: usize, board_px: u32) -> Result<Self> {
        Self::new(region, dim, board_px as f64 / dim.max(1) as f64)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn left_lon(&self) -> i32 {
        self.left_lon
    }

    pub fn bottom_lat(&self) -> i32 {
        self.bottom_lat
    }

    pub fn one_degree_px(&self) -> f64 {
        self.one_degree_px
    }

    pub fn region(&self) -> RegionBox {
        RegionBox::square(self.left_lon, self.bottom_lat, self.dim)
    }

    pub fn contains(&self, cell: GridCell) -> bool {
        cell.i < self.dim && cell.j < self.dim
    }

    /// Every cell of the region in row-major order (i, then j)
    pub fn cells(&self) -> impl Iterator<Item = GridCell> {
        let dim = self.dim;
        (0..dim).flat_map(move |i| (0..dim).map(move |j| GridCell::new(i, j)))
    }

    /// South-west corner of a cell, in degrees
    pub fn lon_lat(&self, cell: GridCell) -> (i32, i32) {
        (
            self.left_lon + cell.i as i32,
            self.bottom_lat + cell.j as i32,
        )
    }

    /// Cell whose south-west corner is (`lon`, `lat`)
    pub fn cell_at(&self, lon: i32, lat: i32) -> Result<GridCell> {
        let i = lon - self.left_lon;
        let j = lat - self.bottom_lat;
        if i < 0 || j < 0 || i >= self.dim as i32 || j >= self.dim as i32 {
            return Err(SyncError::addressing(format!(
                "({}, {}) is outside the active region",
                lon, lat
            )));
        }
        Ok(GridCell::new(i as usize, j as usize))
    }

    /// Cell under board pixel (`u`, `v`); `v` grows downwards
    pub fn cell_at_screen(&self, u: f64, v: f64) -> Result<GridCell> {
        let i = (u / self.one_degree_px).floor();
        let j = self.dim as f64 - 1.0 - (v / self.one_degree_px).floor();
        if !(i.is_finite() && j.is_finite())
            || i < 0.0
            || j < 0.0
            || i >= self.dim as f64
            || j >= self.dim as f64
        {
            return Err(SyncError::addressing(format!(
                "pixel ({}, {}) is off the board",
                u, v
            )));
        }
        Ok(GridCell::new(i as usize, j as usize))
    }

    /// Top-left pixel of a cell on the board
    pub fn screen_origin(&self, cell: GridCell) -> (f64, f64) {
        let left_u = cell.i as f64 * self.one_degree_px;
        let top_v = (self.dim as f64 - 1.0 - cell.j as f64) * self.one_degree_px;
        (left_u, top_v)
    }

    /// Centre pixel of a cell on the board
    pub fn screen_center(&self, cell: GridCell) -> (f64, f64) {
        let (u, v) = self.screen_origin(cell);
        let half = self.one_degree_px / 2.0;
        (u + half, v + half)
    }

    pub fn tile_name(&self, cell: GridCell) -> Result<String> {
        let (lon, lat) = self.checked_lon_lat(cell)?;
        tile_name(lon, lat)
    }

    pub fn hecto_name(&self, cell: GridCell) -> Result<String> {
        let (lon, lat) = self.checked_lon_lat(cell)?;
        hecto_name(lon, lat)
    }

    pub fn url_subpath(&self, cell: GridCell) -> Result<String> {
        let (lon, lat) = self.checked_lon_lat(cell)?;
        url_subpath(lon, lat)
    }

    /// Inverse of [`RegionContext::tile_name`]
    pub fn parse_cell(&self, name: &str) -> Result<GridCell> {
        let (lon, lat) = parse_tile_name(name)?;
        self.cell_at(lon, lat)
    }

    fn checked_lon_lat(&self, cell: GridCell) -> Result<(i32, i32)> {
        if !self.contains(cell) {
            return Err(SyncError::addressing(format!(
                "cell {} is outside a {}x{} region",
                cell, self.dim, self.dim
            )));
        }
        Ok(self.lon_lat(cell))
    }
}

/// Whether (`lon`, `lat`) names an existing tile
pub fn is_valid_tile(lon: i32, lat: i32) -> bool {
    (-180..180).contains(&lon) && (-90..90).contains(&lat)
}

fn check_tile(lon: i32, lat: i32) -> Result<()> {
    if is_valid_tile(lon, lat) {
        Ok(())
    } else {
        Err(SyncError::addressing(format!(
            "no tile at lon {}, lat {}",
            lon, lat
        )))
    }
}

fn format_name(lon: i32, lat: i32) -> String {
    format!(
        "{}{:03}{}{:02}",
        if lon < 0 { 'w' } else { 'e' },
        lon.unsigned_abs(),
        if lat < 0 { 's' } else { 'n' },
        lat.unsigned_abs()
    )
}

/// Seven-character tile code, `w012n45` for the tile at (-12, 45)
pub fn tile_name(lon: i32, lat: i32) -> Result<String> {
    check_tile(lon, lat)?;
    Ok(format_name(lon, lat))
}

/// Code of the enclosing 10°x10° folder, `w020n40` for the tile at (-12, 45)
pub fn hecto_name(lon: i32, lat: i32) -> Result<String> {
    check_tile(lon, lat)?;
    Ok(format_name(lon.div_euclid(10) * 10, lat.div_euclid(10) * 10))
}

/// URL-style path of a tile below a category root, `/w020n40/w012n45`
pub fn url_subpath(lon: i32, lat: i32) -> Result<String> {
    Ok(format!("/{}/{}", hecto_name(lon, lat)?, tile_name(lon, lat)?))
}

/// Turn a URL-style subpath into a local one using `separator`
pub fn subpath_to_local(subpath: &str, separator: char) -> String {
    subpath.replace('/', &separator.to_string())
}

fn parse_code(prefix: char, digits: &str, positive: char, negative: char) -> Option<i32> {
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i32 = digits.parse().ok()?;
    if prefix == positive {
        Some(value)
    } else if prefix == negative && value != 0 {
        Some(-value)
    } else {
        None
    }
}

/// Inverse of [`tile_name`]: `w012n45` gives (-12, 45)
pub fn parse_tile_name(name: &str) -> Result<(i32, i32)> {
    let invalid = || SyncError::addressing(format!("'{}' is not a tile name", name));

    if name.len() != 7 || !name.is_ascii() {
        return Err(invalid());
    }
    let mut chars = name.chars();
    let lon_prefix = chars.next().ok_or_else(invalid)?;
    let lat_prefix = name[4..].chars().next().ok_or_else(invalid)?;

    let lon = parse_code(lon_prefix, &name[1..4], 'e', 'w').ok_or_else(invalid)?;
    let lat = parse_code(lat_prefix, &name[5..7], 'n', 's').ok_or_else(invalid)?;
    check_tile(lon, lat).map_err(|_| invalid())?;
    Ok((lon, lat))
}

/// `[ew]\d{3}[ns]\d{2}` naming a real tile
pub fn is_tile_name(name: &str) -> bool {
    parse_tile_name(name).is_ok()
}

/// `[ew][0-1]\d0[ns]\d0` naming a real hecto folder
pub fn is_hecto_name(name: &str) -> bool {
    match parse_tile_name(name) {
        Ok((lon, lat)) => lon % 10 == 0 && lat % 10 == 0,
        Err(_) => false,
    }
}
