//! Sparse sampling grid used to spot changed rows without reading every pixel

use rand::Rng;

/// Pixel grid slip for a frame height. Taller frames get a coarser grid.
pub fn slip_for_height(height: u32) -> u32 {
    match height {
        0..=539 => 2,
        540..=719 => 3,
        720..=1079 => 4,
        1080..=1439 => 5,
        _ => 6,
    }
}

/// Sampling parameters for one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPlan {
    /// Rows of margin added around the dirty band
    pub slip: u32,
    /// Horizontal distance between two samples of a row
    pub step: u32,
    /// Phase offset shared by every row of this poll
    pub shift: u32,
}

impl SamplingPlan {
    /// Plan for `height` with an explicit phase; `shift` wraps into `[0, step)`
    pub fn with_shift(height: u32, shift: u32) -> Self {
        let slip = slip_for_height(height);
        let step = slip * slip - 1;
        Self {
            slip,
            step,
            shift: shift % step,
        }
    }

    /// Plan for `height` with a fresh uniformly random phase
    pub fn random<R: Rng + ?Sized>(height: u32, rng: &mut R) -> Self {
        let plan = Self::with_shift(height, 0);
        Self {
            shift: rng.gen_range(0..plan.step),
            ..plan
        }
    }

    /// First sampled column of row `y`
    pub fn first_column(&self, y: u32) -> u32 {
        ((u64::from(y) * u64::from(self.slip) + u64::from(self.shift)) % u64::from(self.step)) as u32
    }

    /// Columns sampled in row `y` of a `width` pixel wide frame
    pub fn columns(&self, y: u32, width: u32) -> impl Iterator<Item = u32> {
        (self.first_column(y)..width).step_by(self.step as usize)
    }
}
