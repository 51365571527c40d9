//! In-memory backend driven by a script of frames, resizes and failures

use std::collections::VecDeque;

use super::format::{ChannelLayout, FormatDescriptor, ScreenGeometry};
use super::{BackendKind, CaptureBackend, CaptureError, FormatTracker, FrameHandle};

/// Extra pixels of stride per row, so tests never confuse stride and width
const ROW_PADDING: u32 = 8;

pub(crate) enum Step {
    /// Replace visible pixels with `f(x, y)`
    Paint(Box<dyn Fn(u32, u32) -> u32>),
    /// Switch to a new resolution, filled with one color
    Resize { width: u32, height: u32, color: u32 },
    /// Fail the poll
    Fail(CaptureError),
}

pub(crate) struct ScriptedBackend {
    kind: BackendKind,
    geometry: ScreenGeometry,
    pixels: Vec<u32>,
    format: FormatTracker,
    script: VecDeque<Step>,
    released: bool,
}

impl ScriptedBackend {
    pub(crate) fn solid(kind: BackendKind, width: u32, height: u32, color: u32) -> Self {
        let (geometry, pixels) = Self::layout(width, height, color);
        Self {
            kind,
            geometry,
            pixels,
            format: FormatTracker::new(FormatDescriptor::new(width, height, ChannelLayout::RGB)),
            script: VecDeque::new(),
            released: false,
        }
    }

    fn layout(width: u32, height: u32, color: u32) -> (ScreenGeometry, Vec<u32>) {
        let stride_px = width + ROW_PADDING;
        let geometry = ScreenGeometry { width, height, stride: stride_px * 4 };
        (geometry, vec![color; (stride_px * height) as usize])
    }

    /// Queue a step consumed by the next poll that has nothing queued before it
    pub(crate) fn then(mut self, step: Step) -> Self {
        self.script.push_back(step);
        self
    }

    pub(crate) fn paint<F: Fn(u32, u32) -> u32 + 'static>(self, f: F) -> Self {
        self.then(Step::Paint(Box::new(f)))
    }
}

impl CaptureBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn format(&self) -> &FormatDescriptor {
        self.format.current()
    }

    fn geometry(&self) -> ScreenGeometry {
        self.geometry
    }

    fn poll(&mut self) -> Result<(), CaptureError> {
        if self.released {
            return Err(CaptureError::Released);
        }

        match self.script.pop_front() {
            None => Ok(()),
            Some(Step::Paint(f)) => {
                let stride_px = (self.geometry.stride / 4) as usize;
                for y in 0..self.geometry.height {
                    for x in 0..self.geometry.width {
                        self.pixels[y as usize * stride_px + x as usize] = f(x, y);
                    }
                }
                Ok(())
            }
            Some(Step::Resize { width, height, color }) => {
                let (geometry, pixels) = Self::layout(width, height, color);
                self.geometry = geometry;
                self.pixels = pixels;
                self.format.stage(FormatDescriptor::new(width, height, ChannelLayout::RGB));
                Ok(())
            }
            Some(Step::Fail(e)) => Err(e),
        }
    }

    fn check_resolution_changed(&mut self) -> bool {
        self.format.commit()
    }

    fn frame(&self) -> Result<FrameHandle<'_>, CaptureError> {
        if self.released {
            return Err(CaptureError::Released);
        }
        FrameHandle::new(&self.pixels, self.geometry.stride, self.geometry.width, self.geometry.height)
    }

    fn release(&mut self) {
        self.released = true;
    }
}
