use crate::classes;
use crate::device::{GpuContext, ReadbackStatus, ReadbackTicket};
use crate::error::ReadbackError;
use crate::mask::ClassMask;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Result of a class lookup under the pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassHit {
    pub class: u32,
    pub label: &'static str,
    /// Screen position at the time of the request.
    pub screen: (f32, f32),
    pub texel: (u32, u32),
}

/// Maps a screen position onto a `mask_width x mask_height` grid, clamping to
/// the last row and column.
pub fn screen_to_texel(
    x: f32,
    y: f32,
    viewport: Viewport,
    mask_width: u32,
    mask_height: u32,
) -> (u32, u32) {
    let axis = |pos: f32, extent: f32, cells: u32| -> u32 {
        if cells == 0 || extent.is_nan() || extent <= 0.0 || !pos.is_finite() {
            return 0;
        }
        let cell = (pos * cells as f32 / extent).floor();
        cell.clamp(0.0, (cells - 1) as f32) as u32
    };
    (
        axis(x, viewport.width, mask_width),
        axis(y, viewport.height, mask_height),
    )
}

struct Outstanding {
    ticket: ReadbackTicket,
    screen: (f32, f32),
    texel: (u32, u32),
    mask_width: u32,
}

/// Reads the class under the pointer back from the published mask. Only one
/// readback is outstanding at a time.
#[derive(Default)]
pub struct ClassLookup {
    outstanding: Option<Outstanding>,
}

impl ClassLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_readback_in_progress(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Starts a readback for the screen position `(x, y)`. Returns `false`
    /// without doing anything while a previous readback is outstanding or
    /// when there is no mask.
    pub fn request(
        &mut self,
        gpu: &mut GpuContext,
        mask: Option<&ClassMask>,
        x: f32,
        y: f32,
        viewport: Viewport,
    ) -> bool {
        if self.outstanding.is_some() {
            trace!("hover readback already in progress");
            return false;
        }
        let Some(mask) = mask else {
            return false;
        };
        let texel = screen_to_texel(x, y, viewport, mask.width(), mask.height());
        match gpu.device.begin_readback(mask.resource()) {
            Ok(ticket) => {
                self.outstanding = Some(Outstanding {
                    ticket,
                    screen: (x, y),
                    texel,
                    mask_width: mask.width(),
                });
                true
            }
            Err(e) => {
                warn!("failed to start hover readback: {e}");
                false
            }
        }
    }

    /// `None` while nothing is outstanding or the readback is still pending.
    pub fn poll(&mut self, gpu: &mut GpuContext) -> Option<Result<ClassHit, ReadbackError>> {
        let outstanding = self.outstanding.take()?;
        match gpu.device.poll_readback(&outstanding.ticket) {
            ReadbackStatus::Pending => {
                self.outstanding = Some(outstanding);
                None
            }
            ReadbackStatus::Failed(e) => {
                warn!("hover readback failed: {e}");
                Some(Err(e))
            }
            ReadbackStatus::Ready(values) => {
                let (tx, ty) = outstanding.texel;
                let index = ty as usize * outstanding.mask_width as usize + tx as usize;
                let Some(&value) = values.get(index) else {
                    return Some(Err(ReadbackError::Failed(format!(
                        "readback of {} values has no texel {index}",
                        values.len()
                    ))));
                };
                let class = value.round().max(0.0) as u32;
                let hit = ClassHit {
                    class,
                    label: classes::label(class),
                    screen: outstanding.screen,
                    texel: outstanding.texel,
                };
                debug!(class, label = hit.label, screen = ?hit.screen, "hover class");
                Some(Ok(hit))
            }
        }
    }

    pub fn cancel(&mut self, gpu: &mut GpuContext) {
        if let Some(outstanding) = self.outstanding.take() {
            gpu.device.cancel_readback(outstanding.ticket);
        }
    }
}
