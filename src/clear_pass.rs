// Clear pass - demo draw content
//
// Clears the color and depth targets with dynamic rendering. The clear color
// pulses slowly so dropped or repeated frames are visible.

use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use ash::vk;

use crate::backend::VulkanDevice;
use crate::error::RenderResult;
use crate::frame_loop::{FrameContext, RenderContent};

/// Seconds for one full pulse.
const PULSE_PERIOD: f32 = 4.0;

pub struct ClearPass {
    base_color: [f32; 4],
    started: Instant,
}

impl ClearPass {
    pub fn new(base_color: [f32; 4]) -> Self {
        Self {
            base_color,
            started: Instant::now(),
        }
    }

    /// RGB scaled between 50% and 100% of the base color; alpha untouched.
    pub fn color_at(&self, elapsed: Duration) -> [f32; 4] {
        let phase = elapsed.as_secs_f32() / PULSE_PERIOD * TAU;
        let scale = 0.75 + 0.25 * phase.sin();
        let [r, g, b, a] = self.base_color;
        [r * scale, g * scale, b * scale, a]
    }
}

impl RenderContent<VulkanDevice> for ClearPass {
    fn draw(&mut self, frame: &mut FrameContext<'_, VulkanDevice>) -> RenderResult<()> {
        let color = self.color_at(self.started.elapsed());

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(frame.color.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            });

        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(frame.depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });

        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: frame.color.extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment))
            .depth_attachment(&depth_attachment);

        let device = &frame.gpu.device;
        unsafe {
            device.cmd_begin_rendering(frame.cmd, &rendering_info);
            device.cmd_end_rendering(frame.cmd);
        }
        Ok(())
    }
}
