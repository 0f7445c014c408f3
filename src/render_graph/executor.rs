//! Per-frame execution of a built render graph

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderGraphError, RenderGraphResult};
use crate::render_graph::graph::{BuildState, PassId, RenderGraph};
use crate::render_graph::pass::*;
use std::any::Any;

impl RenderGraph {
    /// Record one frame into `command_buffer` using the resources of `frame_index`.
    ///
    /// The caller must have waited for the previous submission that used the
    /// same frame slot. Every call counts as one frame for the resource hold.
    pub fn execute<D: RenderDevice + 'static>(
        &mut self,
        device: &mut D,
        command_buffer: CommandBufferHandle,
        frame_index: usize,
    ) -> RenderGraphResult<()> {
        self.expect_state(BuildState::Built, "execute")?;
        let frames = self.config.max_frames_in_flight;
        if frame_index >= frames {
            return Err(RenderGraphError::FrameIndexOutOfRange {
                index: frame_index,
                frames,
            });
        }

        if !self.primed_frames[frame_index] {
            let barrier = self.priming_barrier(frame_index);
            if !barrier.is_empty() {
                device.pipeline_barrier(command_buffer, &barrier);
            }
            self.primed_frames[frame_index] = true;
        }

        for &pass_id in &self.execution_order {
            let index = pass_id.index();
            let barrier = self.input_barrier(pass_id, frame_index);
            if !barrier.is_empty() {
                device.pipeline_barrier(command_buffer, &barrier);
            }

            let render_pass = self.render_passes[index];
            let resources = &self.resources[index][frame_index];
            let pass = &mut self.passes[index];

            log::trace!("{}: executing pass `{}`", self.config.debug_name, pass.name());
            device.begin_render_pass(
                command_buffer,
                render_pass,
                resources.framebuffer,
                &self.clear_values[index],
            );

            if let Some(callback) = pass.callback_mut() {
                let mut ctx = PassExecutionContext {
                    device: &mut *device as &mut dyn Any,
                    pass: pass_id,
                    render_pass,
                    framebuffer: resources.framebuffer,
                    command_buffer,
                    read_descriptor_set: resources.read_descriptor_set,
                    frame_index,
                    extent: self.extent,
                };
                callback(&mut ctx);
            }

            device.end_render_pass(command_buffer);
        }

        let barrier = self.reset_barrier(frame_index);
        if !barrier.is_empty() {
            device.pipeline_barrier(command_buffer, &barrier);
        }

        self.hold.tick(device);
        Ok(())
    }

    /// Move freshly created textures from `Undefined` into their declared initial
    /// layout, and the output target from its bound layout into the layout the
    /// output render pass starts with
    fn priming_barrier(&self, frame_index: usize) -> PipelineBarrier {
        let mut barrier =
            PipelineBarrier::new(PipelineStageFlags::TOP_OF_PIPE, PipelineStageFlags::ALL_COMMANDS);

        for pass_id in &self.execution_order {
            let pass = &self.passes[pass_id.index()];
            let resources = &self.resources[pass_id.index()][frame_index];
            for (attachment, texture) in resources.owned_textures() {
                let Some(local) = pass.attachment(attachment) else {
                    continue;
                };
                let initial = local.description.initial_layout;
                if initial != ImageLayout::Undefined {
                    barrier.image_barriers.push(ImageBarrier::transition(
                        texture,
                        local.description.format.aspect(),
                        ImageLayout::Undefined,
                        initial,
                    ));
                }
            }
        }

        if let Some(output) = &self.output {
            let target = output.targets.textures().get(frame_index).copied();
            let current = output.target_layouts.get(frame_index).copied();
            let attachment = self
                .passes
                .get(output.pass.index())
                .and_then(|pass| pass.attachment(output.attachment));
            if let (Some(texture), Some(current), Some(attachment)) = (target, current, attachment) {
                let initial = attachment.description.initial_layout;
                if initial != ImageLayout::Undefined && initial != current {
                    barrier.image_barriers.push(ImageBarrier::transition(
                        texture,
                        attachment.description.format.aspect(),
                        current,
                        initial,
                    ));
                }
            }
        }

        if !barrier.is_empty() {
            log::trace!(
                "{}: priming {} textures of frame {}",
                self.config.debug_name,
                barrier.image_barriers.len(),
                frame_index
            );
        }
        barrier
    }

    /// Move attachments this pass samples into the layout it reads them in
    fn input_barrier(&self, pass_id: PassId, frame_index: usize) -> PipelineBarrier {
        let mut barrier = PipelineBarrier::new(
            PipelineStageFlags::ALL_GRAPHICS,
            PipelineStageFlags::ALL_GRAPHICS,
        );
        for transition in &self.transitions[pass_id.index()] {
            let Some(texture) = self.resources[transition.producer.index()][frame_index]
                .texture(transition.attachment)
            else {
                continue;
            };
            let aspect = self.passes[transition.producer.index()]
                .attachment(transition.attachment)
                .map_or(ImageAspect::Color, |local| local.description.format.aspect());
            barrier.image_barriers.push(ImageBarrier::transition(
                texture,
                aspect,
                transition.old_layout,
                transition.new_layout,
            ));
        }
        barrier
    }

    /// Return every attachment used this frame to its initial layout for the next frame
    fn reset_barrier(&self, frame_index: usize) -> PipelineBarrier {
        let mut barrier =
            PipelineBarrier::new(PipelineStageFlags::ALL_COMMANDS, PipelineStageFlags::ALL_COMMANDS);
        let output = self.output.as_ref().map(|o| (o.pass, o.attachment));

        for &pass_id in &self.execution_order {
            let pass = &self.passes[pass_id.index()];
            let resources = &self.resources[pass_id.index()][frame_index];
            for (i, local) in pass.attachments().iter().enumerate() {
                let attachment = AttachmentIndex(i);
                if output == Some((pass_id, attachment)) {
                    continue;
                }
                let description = &local.description;
                let end_layout = self.end_layouts[pass_id.index()]
                    .get(i)
                    .copied()
                    .unwrap_or(description.final_layout);
                if description.initial_layout == ImageLayout::Undefined
                    || description.initial_layout == end_layout
                {
                    continue;
                }
                let Some(texture) = resources.texture(attachment) else {
                    continue;
                };
                barrier.image_barriers.push(ImageBarrier::transition(
                    texture,
                    description.format.aspect(),
                    end_layout,
                    description.initial_layout,
                ));
            }
        }
        barrier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DeviceCommand, DummyDevice};
    use crate::RenderGraphConfig;
    use std::sync::{Arc, Mutex};

    fn build_chain(device: &mut DummyDevice, initial: ImageLayout) -> (RenderGraph, PassId, PassId) {
        let mut graph = RenderGraph::new();
        graph.begin_building(RenderGraphConfig::default()).unwrap();

        let mut scene = RenderGraphPass::new("scene");
        scene.add_color_attachment(
            AttachmentDescription::color(TextureFormat::Rgba16Float)
                .with_layouts(initial, ImageLayout::ColorAttachment),
            "hdr",
            ImageLayout::ColorAttachment,
        );
        let p0 = graph.add_pass(scene).unwrap();

        let mut tonemap = RenderGraphPass::new("tonemap");
        tonemap.add_color_attachment(
            AttachmentDescription::color(TextureFormat::Rgba8Unorm),
            "ldr",
            ImageLayout::ColorAttachment,
        );
        tonemap.add_read_input(p0, "hdr", ImageLayout::ShaderReadOnly);
        let p1 = graph.add_pass(tonemap).unwrap();

        let targets = (0..2)
            .map(|_| device.import_texture(16, 16, TextureFormat::Bgra8Unorm, ImageLayout::Undefined))
            .collect();
        graph
            .set_swapchain_output_attachment(p1, "ldr", targets)
            .unwrap();
        graph.end_building(device).unwrap();
        (graph, p0, p1)
    }

    #[test]
    fn test_execute_records_passes_in_order() {
        let mut device = DummyDevice::new();
        let (mut graph, p0, p1) = build_chain(&mut device, ImageLayout::Undefined);
        let cmd = CommandBufferHandle::from_raw(7);

        graph.execute(&mut device, cmd, 0).unwrap();

        let begun: Vec<RenderPassHandle> = device
            .commands()
            .iter()
            .filter_map(|c| match c {
                DeviceCommand::BeginRenderPass { render_pass, .. } => Some(*render_pass),
                _ => None,
            })
            .collect();
        assert_eq!(
            begun,
            vec![graph.render_pass(p0).unwrap(), graph.render_pass(p1).unwrap()]
        );
        // Undefined initial layouts need neither priming nor reset
        assert!(!device
            .commands()
            .iter()
            .any(|c| matches!(c, DeviceCommand::PipelineBarrier { .. })));

        graph.destroy(&mut device);
    }

    #[test]
    fn test_layouts_stay_consistent_across_frames() {
        let mut device = DummyDevice::new();
        let (mut graph, p0, _) = build_chain(&mut device, ImageLayout::ColorAttachment);
        let cmd = CommandBufferHandle::from_raw(1);

        for frame in 0..6 {
            graph.execute(&mut device, cmd, frame % 2).unwrap();
        }
        assert!(device.layout_violations().is_empty());

        let hdr = graph.pass_resources(p0).unwrap()[0].attachment_textures[0];
        assert_eq!(
            device.texture_info(hdr).unwrap().layout,
            ImageLayout::ColorAttachment
        );

        let barriers = device
            .commands()
            .iter()
            .filter(|c| matches!(c, DeviceCommand::PipelineBarrier { .. }))
            .count();
        // Two priming barriers plus one reset barrier per frame
        assert_eq!(barriers, 2 + 6);

        graph.destroy(&mut device);
    }

    #[test]
    fn test_callback_receives_context() {
        let mut device = DummyDevice::new();
        let mut graph = RenderGraph::new();
        graph.begin_building(RenderGraphConfig::default()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_pass = Arc::clone(&seen);
        let mut pass = RenderGraphPass::new("main").with_callback(move |ctx| {
            let name = ctx.device::<DummyDevice>().map(|d| d.name());
            seen_in_pass
                .lock()
                .unwrap()
                .push((ctx.frame_index, ctx.extent, ctx.read_descriptor_set, name));
        });
        pass.add_color_attachment(
            AttachmentDescription::color(TextureFormat::Rgba8Unorm),
            "color",
            ImageLayout::ColorAttachment,
        );
        let p0 = graph.add_pass(pass).unwrap();
        let targets = (0..2)
            .map(|_| device.import_texture(8, 4, TextureFormat::Rgba8Unorm, ImageLayout::Undefined))
            .collect();
        graph.set_output_attachment(p0, "color", targets).unwrap();
        graph.end_building(&mut device).unwrap();

        graph
            .execute(&mut device, CommandBufferHandle::from_raw(1), 1)
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, Extent2D::new(8, 4), None, Some("Dummy Device"))]
        );
        graph.destroy(&mut device);
    }

    #[test]
    fn test_execute_validates_frame_and_state() {
        let mut device = DummyDevice::new();
        let mut graph = RenderGraph::new();
        let cmd = CommandBufferHandle::from_raw(1);
        assert!(matches!(
            graph.execute(&mut device, cmd, 0),
            Err(RenderGraphError::InvalidState { .. })
        ));

        let (mut graph, _, _) = build_chain(&mut device, ImageLayout::Undefined);
        assert_eq!(
            graph.execute(&mut device, cmd, 2),
            Err(RenderGraphError::FrameIndexOutOfRange { index: 2, frames: 2 })
        );
        graph.destroy(&mut device);
    }
}
