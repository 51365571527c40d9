// Screen diff detection and snapshot maintenance

pub mod sampling;

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::capture::{CaptureError, FormatDescriptor, FrameHandle};
pub use sampling::{slip_for_height, SamplingPlan};

/// Inclusive pixel bounds of a changed region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DirtyRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl DirtyRect {
    /// Full-width band covering rows `min_y..=max_y`
    pub fn rows(width: u32, min_y: u32, max_y: u32) -> Self {
        Self {
            min_x: 0,
            min_y,
            max_x: width.saturating_sub(1),
            max_y,
        }
    }

    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }
}

/// Outcome of one diff pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeResult {
    /// Nothing sampled differed; the snapshot was not touched
    Idle,
    /// These rows were refreshed in the snapshot and should be forwarded
    Changed(DirtyRect),
}

impl ChangeResult {
    pub fn is_idle(&self) -> bool {
        matches!(self, ChangeResult::Idle)
    }

    pub fn rect(&self) -> Option<DirtyRect> {
        match self {
            ChangeResult::Idle => None,
            ChangeResult::Changed(rect) => Some(*rect),
        }
    }
}

/// Keeps the last forwarded frame and finds the rows that changed since.
///
/// Each pass samples a sparse, phase-shifted grid of pixels per row. A single differing
/// sample marks the row dirty; the first and last dirty rows, widened by the grid slip,
/// become a full-width rectangle whose rows are copied into the snapshot.
pub struct ChangeDetector {
    width: u32,
    height: u32,
    /// Canonical 32-bit pixels, `width` per row
    snapshot: Vec<u32>,
    rng: StdRng,
}

impl ChangeDetector {
    /// Detector sized for `format`, with an entropy-seeded phase generator
    pub fn new(format: &FormatDescriptor) -> Self {
        Self::with_rng(format, StdRng::from_entropy())
    }

    /// Detector with a deterministic phase sequence
    pub fn with_seed(format: &FormatDescriptor, seed: u64) -> Self {
        Self::with_rng(format, StdRng::seed_from_u64(seed))
    }

    fn with_rng(format: &FormatDescriptor, rng: StdRng) -> Self {
        Self {
            width: format.width,
            height: format.height,
            snapshot: vec![0; format.pixel_count()],
            rng,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Last forwarded frame, `width` pixels per row
    pub fn snapshot(&self) -> &[u32] {
        &self.snapshot
    }

    /// Reallocate the snapshot for a new geometry. Contents are cleared.
    pub fn resize(&mut self, format: &FormatDescriptor) {
        debug!(
            "Resizing snapshot from {}x{} to {}x{}",
            self.width, self.height, format.width, format.height
        );
        self.width = format.width;
        self.height = format.height;
        self.snapshot = vec![0; format.pixel_count()];
    }

    /// Copy the whole frame into the snapshot
    pub fn prime(&mut self, frame: &FrameHandle<'_>) -> Result<DirtyRect, CaptureError> {
        self.check_geometry(frame)?;
        self.copy_rows(frame, 0, self.height - 1);
        Ok(DirtyRect::rows(self.width, 0, self.height - 1))
    }

    /// Diff `frame` against the snapshot with a fresh random phase
    pub fn detect_and_apply(&mut self, frame: &FrameHandle<'_>) -> Result<ChangeResult, CaptureError> {
        self.check_geometry(frame)?;
        let plan = SamplingPlan::random(self.height, &mut self.rng);
        Ok(self.apply(frame, plan))
    }

    /// Diff `frame` against the snapshot sampling with phase `shift`
    pub fn detect_with_shift(
        &mut self,
        frame: &FrameHandle<'_>,
        shift: u32,
    ) -> Result<ChangeResult, CaptureError> {
        self.check_geometry(frame)?;
        Ok(self.apply(frame, SamplingPlan::with_shift(self.height, shift)))
    }

    fn check_geometry(&self, frame: &FrameHandle<'_>) -> Result<(), CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::InvalidFrame(format!(
                "snapshot has no pixels ({}x{})",
                self.width, self.height
            )));
        }
        if frame.width() != self.width || frame.height() != self.height {
            return Err(CaptureError::GeometryMismatch {
                expected_width: self.width,
                expected_height: self.height,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }
        Ok(())
    }

    /// First and last dirty row under `plan`, if any
    fn dirty_rows(&self, frame: &FrameHandle<'_>, plan: SamplingPlan) -> Option<(u32, u32)> {
        let width = self.width as usize;
        let mut first = None;
        let mut last = 0;

        for y in 0..self.height {
            let current = frame.row(y);
            let start = y as usize * width;
            let previous = &self.snapshot[start..start + width];

            // One differing sample is enough for the whole row
            if plan.columns(y, self.width).any(|x| current[x as usize] != previous[x as usize]) {
                first.get_or_insert(y);
                last = y;
            }
        }

        first.map(|first| (first, last))
    }

    fn apply(&mut self, frame: &FrameHandle<'_>, plan: SamplingPlan) -> ChangeResult {
        let Some((first, last)) = self.dirty_rows(frame, plan) else {
            trace!("No change (slip {}, shift {})", plan.slip, plan.shift);
            return ChangeResult::Idle;
        };

        let min_y = first.saturating_sub(plan.slip);
        let max_y = (last + plan.slip).min(self.height - 1);
        self.copy_rows(frame, min_y, max_y);

        debug!(
            "Dirty rows {}..={} (sampled {}..={}, slip {}, shift {})",
            min_y, max_y, first, last, plan.slip, plan.shift
        );
        ChangeResult::Changed(DirtyRect::rows(self.width, min_y, max_y))
    }

    fn copy_rows(&mut self, frame: &FrameHandle<'_>, min_y: u32, max_y: u32) {
        let width = self.width as usize;
        for y in min_y..=max_y {
            let start = y as usize * width;
            self.snapshot[start..start + width].copy_from_slice(frame.row(y));
        }
    }
}
