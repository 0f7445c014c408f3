//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations. It keeps track of every
//! live object, records every command and simulates image layouts so tests
//! can check that the render graph leaves each texture in the layout the next
//! render pass or barrier expects.

use std::collections::HashMap;

use crate::backend::traits::*;
use crate::backend::types::*;

/// A command recorded by the dummy backend
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    BeginRenderPass {
        command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass {
        command_buffer: CommandBufferHandle,
    },
    PipelineBarrier {
        command_buffer: CommandBufferHandle,
        barrier: PipelineBarrier,
    },
}

/// A texture used in a layout other than the one the GPU would find it in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutViolation {
    pub texture: TextureHandle,
    pub expected: ImageLayout,
    pub actual: ImageLayout,
}

#[derive(Debug)]
struct DummyTexture {
    info: TextureInfo,
    imported: bool,
}

/// Dummy GPU device.
#[derive(Debug, Default)]
pub struct DummyDevice {
    next_id: u64,
    textures: HashMap<u64, DummyTexture>,
    render_passes: HashMap<u64, RenderPassDescriptor>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,
    descriptor_sets: HashMap<u64, DescriptorSetDescriptor>,
    active_pass: Option<(RenderPassHandle, FramebufferHandle)>,
    commands: Vec<DeviceCommand>,
    layout_violations: Vec<LayoutViolation>,
    /// Remaining successful creations before allocation starts failing
    creation_budget: Option<usize>,
}

impl DummyDevice {
    /// Create a new dummy device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        "Dummy Device"
    }

    /// Register an externally owned texture, e.g. a swapchain image.
    pub fn import_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        layout: ImageLayout,
    ) -> TextureHandle {
        let id = self.allocate_id();
        log::trace!(
            "DummyDevice: importing texture {} ({}x{}, {:?}, {:?})",
            id,
            width,
            height,
            format,
            layout
        );
        self.textures.insert(
            id,
            DummyTexture {
                info: TextureInfo {
                    width,
                    height,
                    format,
                    layout,
                    aspect: format.aspect(),
                },
                imported: true,
            },
        );
        TextureHandle(id)
    }

    /// Forget an imported texture.
    pub fn release_imported_texture(&mut self, texture: TextureHandle) {
        if matches!(self.textures.get(&texture.0), Some(t) if t.imported) {
            self.textures.remove(&texture.0);
        }
    }

    /// Overwrite the simulated layout of a texture, e.g. after presentation.
    pub fn set_texture_layout(&mut self, texture: TextureHandle, layout: ImageLayout) {
        if let Some(tex) = self.textures.get_mut(&texture.0) {
            tex.info.layout = layout;
        }
    }

    /// Let `count` more objects be created, then fail with [`BackendError::OutOfMemory`].
    pub fn fail_after(&mut self, count: usize) {
        self.creation_budget = Some(count);
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn layout_violations(&self) -> &[LayoutViolation] {
        &self.layout_violations
    }

    /// Number of live textures created by this device (imports excluded)
    pub fn live_texture_count(&self) -> usize {
        self.textures.values().filter(|t| !t.imported).count()
    }

    pub fn live_render_pass_count(&self) -> usize {
        self.render_passes.len()
    }

    pub fn live_framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_descriptor_set_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    pub fn is_texture_alive(&self, texture: TextureHandle) -> bool {
        self.textures.contains_key(&texture.0)
    }

    pub fn render_pass_descriptor(&self, render_pass: RenderPassHandle) -> Option<&RenderPassDescriptor> {
        self.render_passes.get(&render_pass.0)
    }

    pub fn framebuffer_descriptor(&self, framebuffer: FramebufferHandle) -> Option<&FramebufferDescriptor> {
        self.framebuffers.get(&framebuffer.0)
    }

    pub fn descriptor_set_descriptor(
        &self,
        descriptor_set: DescriptorSetHandle,
    ) -> Option<&DescriptorSetDescriptor> {
        self.descriptor_sets.get(&descriptor_set.0)
    }

    /// Bind a descriptor set the way a draw would, checking that every sampled
    /// image is in the layout the set declares for it.
    pub fn bind_descriptor_set(&mut self, descriptor_set: DescriptorSetHandle) {
        let expectations: Vec<(TextureHandle, ImageLayout)> = self
            .descriptor_sets
            .get(&descriptor_set.0)
            .map(|set| set.images.iter().map(|image| (image.texture, image.layout)).collect())
            .unwrap_or_default();
        for (texture, layout) in expectations {
            self.expect_layout(texture, layout);
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn charge_creation(&mut self) -> BackendResult<()> {
        match self.creation_budget.as_mut() {
            Some(0) => Err(BackendError::OutOfMemory),
            Some(budget) => {
                *budget -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn expect_layout(&mut self, texture: TextureHandle, expected: ImageLayout) {
        if expected == ImageLayout::Undefined {
            return;
        }
        if let Some(tex) = self.textures.get(&texture.0) {
            if tex.info.layout != expected {
                self.layout_violations.push(LayoutViolation {
                    texture,
                    expected,
                    actual: tex.info.layout,
                });
            }
        }
    }
}

impl RenderDevice for DummyDevice {
    fn create_render_pass(
        &mut self,
        desc: &RenderPassDescriptor,
    ) -> BackendResult<RenderPassHandle> {
        self.charge_creation()?;
        let id = self.allocate_id();
        log::trace!(
            "DummyDevice: creating render pass {:?} ({} attachments)",
            desc.label,
            desc.attachments().len()
        );
        self.render_passes.insert(id, desc.clone());
        Ok(RenderPassHandle(id))
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        self.charge_creation()?;
        let id = self.allocate_id();
        log::trace!(
            "DummyDevice: creating texture {:?} ({}x{}, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        self.textures.insert(
            id,
            DummyTexture {
                info: TextureInfo {
                    width: desc.width,
                    height: desc.height,
                    format: desc.format,
                    layout: ImageLayout::Undefined,
                    aspect: desc.format.aspect(),
                },
                imported: false,
            },
        );
        Ok(TextureHandle(id))
    }

    fn texture_info(&self, texture: TextureHandle) -> Option<TextureInfo> {
        self.textures.get(&texture.0).map(|t| t.info)
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let render_pass = self
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or(BackendError::InvalidHandle("render pass"))?;
        if render_pass.attachments().len() != desc.attachments.len() {
            return Err(BackendError::ResourceCreationFailed(format!(
                "framebuffer has {} attachments, render pass expects {}",
                desc.attachments.len(),
                render_pass.attachments().len()
            )));
        }
        if desc
            .attachments
            .iter()
            .any(|t| !self.textures.contains_key(&t.0))
        {
            return Err(BackendError::InvalidHandle("texture"));
        }

        self.charge_creation()?;
        let id = self.allocate_id();
        log::trace!(
            "DummyDevice: creating framebuffer {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        self.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn framebuffer_extent(&self, framebuffer: FramebufferHandle) -> Option<Extent2D> {
        self.framebuffers
            .get(&framebuffer.0)
            .map(|fb| Extent2D::new(fb.width, fb.height))
    }

    fn create_descriptor_set(
        &mut self,
        desc: &DescriptorSetDescriptor,
    ) -> BackendResult<DescriptorSetHandle> {
        if desc
            .images
            .iter()
            .any(|image| !self.textures.contains_key(&image.texture.0))
        {
            return Err(BackendError::InvalidHandle("texture"));
        }

        self.charge_creation()?;
        let id = self.allocate_id();
        log::trace!(
            "DummyDevice: creating descriptor set {:?} ({} images)",
            desc.label,
            desc.images.len()
        );
        self.descriptor_sets.insert(id, desc.clone());
        Ok(DescriptorSetHandle(id))
    }

    fn begin_render_pass(
        &mut self,
        command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) {
        log::trace!("DummyDevice: begin render pass {:?}", render_pass);
        let expectations: Vec<(TextureHandle, ImageLayout)> =
            match (self.render_passes.get(&render_pass.0), self.framebuffers.get(&framebuffer.0)) {
                (Some(pass), Some(fb)) => fb
                    .attachments
                    .iter()
                    .zip(pass.attachments())
                    .map(|(&texture, attachment)| (texture, attachment.initial_layout))
                    .collect(),
                _ => Vec::new(),
            };
        for (texture, layout) in expectations {
            self.expect_layout(texture, layout);
        }

        self.active_pass = Some((render_pass, framebuffer));
        self.commands.push(DeviceCommand::BeginRenderPass {
            command_buffer,
            render_pass,
            framebuffer,
            clear_values: clear_values.to_vec(),
        });
    }

    fn end_render_pass(&mut self, command_buffer: CommandBufferHandle) {
        if let Some((render_pass, framebuffer)) = self.active_pass.take() {
            log::trace!("DummyDevice: end render pass {:?}", render_pass);
            let transitions: Vec<(TextureHandle, ImageLayout)> = match (
                self.render_passes.get(&render_pass.0),
                self.framebuffers.get(&framebuffer.0),
            ) {
                (Some(pass), Some(fb)) => fb
                    .attachments
                    .iter()
                    .zip(pass.attachments())
                    .map(|(&texture, attachment)| (texture, attachment.final_layout))
                    .collect(),
                _ => Vec::new(),
            };
            for (texture, layout) in transitions {
                self.set_texture_layout(texture, layout);
            }
        }
        self.commands
            .push(DeviceCommand::EndRenderPass { command_buffer });
    }

    fn pipeline_barrier(&mut self, command_buffer: CommandBufferHandle, barrier: &PipelineBarrier) {
        log::trace!(
            "DummyDevice: pipeline barrier ({} image barriers)",
            barrier.image_barriers.len()
        );
        for image in &barrier.image_barriers {
            self.expect_layout(image.texture, image.old_layout);
            self.set_texture_layout(image.texture, image.new_layout);
        }
        self.commands.push(DeviceCommand::PipelineBarrier {
            command_buffer,
            barrier: barrier.clone(),
        });
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        log::trace!("DummyDevice: destroying render pass {:?}", render_pass);
        self.render_passes.remove(&render_pass.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        log::trace!("DummyDevice: destroying texture {:?}", texture);
        if matches!(self.textures.get(&texture.0), Some(t) if !t.imported) {
            self.textures.remove(&texture.0);
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        log::trace!("DummyDevice: destroying framebuffer {:?}", framebuffer);
        self.framebuffers.remove(&framebuffer.0);
    }

    fn destroy_descriptor_set(&mut self, descriptor_set: DescriptorSetHandle) {
        log::trace!("DummyDevice: destroying descriptor set {:?}", descriptor_set);
        self.descriptor_sets.remove(&descriptor_set.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_pass(device: &mut DummyDevice, final_layout: ImageLayout) -> RenderPassHandle {
        let mut desc = RenderPassDescriptor::new(None);
        let color = desc.define_attachment(
            AttachmentDescription::color(TextureFormat::Rgba8Unorm)
                .with_layouts(ImageLayout::Undefined, final_layout),
        );
        desc.begin_subpass();
        desc.add_color_attachment(color, ImageLayout::ColorAttachment)
            .unwrap();
        device.create_render_pass(&desc).unwrap()
    }

    #[test]
    fn test_render_pass_applies_final_layout() {
        let mut device = DummyDevice::new();
        let pass = color_pass(&mut device, ImageLayout::ShaderReadOnly);
        let texture = device
            .create_texture(&TextureDescriptor {
                width: 4,
                height: 4,
                ..Default::default()
            })
            .unwrap();
        let framebuffer = device
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                render_pass: pass,
                width: 4,
                height: 4,
                attachments: vec![texture],
            })
            .unwrap();

        let cmd = CommandBufferHandle::from_raw(1);
        device.begin_render_pass(cmd, pass, framebuffer, &[ClearValue::BLACK]);
        device.end_render_pass(cmd);

        assert_eq!(
            device.texture_info(texture).unwrap().layout,
            ImageLayout::ShaderReadOnly
        );
        assert_eq!(device.commands().len(), 2);
        assert!(device.layout_violations().is_empty());
    }

    #[test]
    fn test_barrier_with_wrong_old_layout_is_reported() {
        let mut device = DummyDevice::new();
        let texture = device.import_texture(8, 8, TextureFormat::Rgba8Unorm, ImageLayout::General);

        let mut barrier =
            PipelineBarrier::new(PipelineStageFlags::ALL_COMMANDS, PipelineStageFlags::ALL_COMMANDS);
        barrier.image_barriers.push(ImageBarrier::transition(
            texture,
            ImageAspect::Color,
            ImageLayout::ColorAttachment,
            ImageLayout::ShaderReadOnly,
        ));
        device.pipeline_barrier(CommandBufferHandle::from_raw(1), &barrier);

        assert_eq!(
            device.layout_violations(),
            &[LayoutViolation {
                texture,
                expected: ImageLayout::ColorAttachment,
                actual: ImageLayout::General,
            }]
        );
    }

    #[test]
    fn test_sampling_in_wrong_layout_is_reported() {
        let mut device = DummyDevice::new();
        let texture =
            device.import_texture(8, 8, TextureFormat::Rgba8Unorm, ImageLayout::ColorAttachment);
        let mut desc = DescriptorSetDescriptor::new(None);
        desc.add_image_sampler(texture, ImageLayout::ShaderReadOnly, ShaderStageFlags::FRAGMENT);
        let set = device.create_descriptor_set(&desc).unwrap();

        device.bind_descriptor_set(set);
        assert_eq!(
            device.layout_violations(),
            &[LayoutViolation {
                texture,
                expected: ImageLayout::ShaderReadOnly,
                actual: ImageLayout::ColorAttachment,
            }]
        );

        device.set_texture_layout(texture, ImageLayout::ShaderReadOnly);
        device.bind_descriptor_set(set);
        assert_eq!(device.layout_violations().len(), 1);
    }

    #[test]
    fn test_framebuffer_attachment_count_must_match() {
        let mut device = DummyDevice::new();
        let pass = color_pass(&mut device, ImageLayout::ColorAttachment);
        let result = device.create_framebuffer(&FramebufferDescriptor {
            label: None,
            render_pass: pass,
            width: 4,
            height: 4,
            attachments: Vec::new(),
        });
        assert!(matches!(result, Err(BackendError::ResourceCreationFailed(_))));
    }

    #[test]
    fn test_creation_budget() {
        let mut device = DummyDevice::new();
        device.fail_after(1);
        assert!(device.create_texture(&TextureDescriptor::default()).is_ok());
        assert_eq!(
            device.create_texture(&TextureDescriptor::default()),
            Err(BackendError::OutOfMemory)
        );
    }

    #[test]
    fn test_imported_textures_are_not_destroyed() {
        let mut device = DummyDevice::new();
        let texture = device.import_texture(8, 8, TextureFormat::Bgra8Unorm, ImageLayout::Undefined);
        device.destroy_texture(texture);
        assert!(device.is_texture_alive(texture));
        assert_eq!(device.live_texture_count(), 0);
    }
}
