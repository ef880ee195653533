/// Physical extents, cell-size ratios, and cell counts of a rectangular
/// region. Describes both the whole mesh and individual blocks.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegionSize {
    pub x1min: f64,
    pub x1max: f64,
    pub x2min: f64,
    pub x2max: f64,
    pub x3min: f64,
    pub x3max: f64,
    /// Geometric ratio of adjacent cell sizes per axis; 1.0 is uniform.
    pub x1rat: f64,
    pub x2rat: f64,
    pub x3rat: f64,
    pub nx1: usize,
    pub nx2: usize,
    pub nx3: usize,
}

impl RegionSize {
    /// Spatial dimensionality implied by the cell counts.
    pub fn dim(&self) -> usize {
        if self.nx3 > 1 {
            3
        } else if self.nx2 > 1 {
            2
        } else {
            1
        }
    }

    /// Number of cells in the region.
    pub fn cell_count(&self) -> usize {
        self.nx1 * self.nx2 * self.nx3
    }

    /// Maps a logical fraction `r` in `[0, 1]` along x1 to a physical
    /// coordinate, honoring the geometric cell-size ratio.
    pub fn position_x1(&self, r: f64) -> f64 {
        weighted_position(r, self.x1min, self.x1max, self.x1rat, self.nx1)
    }

    pub fn position_x2(&self, r: f64) -> f64 {
        weighted_position(r, self.x2min, self.x2max, self.x2rat, self.nx2)
    }

    pub fn position_x3(&self, r: f64) -> f64 {
        weighted_position(r, self.x3min, self.x3max, self.x3rat, self.nx3)
    }

    /// Uniform-grid cell volume. Ratioed grids weight per cell; the mesh
    /// uses this only where the ratio is 1.
    pub fn cell_volume(&self) -> f64 {
        let dx1 = (self.x1max - self.x1min) / self.nx1 as f64;
        let dx2 = (self.x2max - self.x2min) / self.nx2 as f64;
        let dx3 = (self.x3max - self.x3min) / self.nx3 as f64;
        dx1 * dx2 * dx3
    }
}

fn weighted_position(r: f64, min: f64, max: f64, rat: f64, n: usize) -> f64 {
    let (lw, rw) = if rat == 1.0 {
        (1.0 - r, r)
    } else {
        let ratn = rat.powi(n as i32);
        let rnx = rat.powf(r * n as f64);
        let lw = (rnx - ratn) / (1.0 - ratn);
        (lw, 1.0 - lw)
    };
    min * lw + max * rw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_region(nx1: usize) -> RegionSize {
        RegionSize {
            x1min: 0.0,
            x1max: 1.0,
            x2min: 0.0,
            x2max: 1.0,
            x3min: 0.0,
            x3max: 1.0,
            x1rat: 1.0,
            x2rat: 1.0,
            x3rat: 1.0,
            nx1,
            nx2: 1,
            nx3: 1,
        }
    }

    #[test]
    fn uniform_positions() {
        let region = unit_region(8);
        assert_eq!(region.position_x1(0.0), 0.0);
        assert_eq!(region.position_x1(1.0), 1.0);
        assert_eq!(region.position_x1(0.5), 0.5);
        assert_eq!(region.dim(), 1);
    }

    #[test]
    fn ratioed_positions_are_monotone() {
        let mut region = unit_region(8);
        region.x1rat = 1.05;

        let mut previous = region.position_x1(0.0);
        for step in 1..=8 {
            let next = region.position_x1(step as f64 / 8.0);
            assert!(next > previous);
            previous = next;
        }
        assert!((region.position_x1(1.0) - 1.0).abs() < 1e-12);
    }
}
