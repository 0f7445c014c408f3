//! Vulkan backend implementation using ash
//!
//! [`VulkanDevice`] implements [`RenderDevice`] on top of a logical device the
//! application already created. It owns the objects it creates (images and
//! their memory, render passes, framebuffers, descriptor sets) plus a
//! descriptor pool and the sampler used for read attachments. Swapchain images
//! are registered with [`VulkanDevice::import_texture`] and never destroyed
//! by this device.

mod conversion;

use crate::backend::traits::*;
use crate::backend::types::*;
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Descriptor sets the pool can hold; one per pass with read attachments per frame in flight
const MAX_DESCRIPTOR_SETS: u32 = 1024;
const MAX_SAMPLED_IMAGES: u32 = 4096;

struct VkTexture {
    image: vk::Image,
    view: vk::ImageView,
    /// `None` for imported images
    allocation: Option<Allocation>,
    info: TextureInfo,
}

struct VkDescriptorSet {
    set: vk::DescriptorSet,
    layout: vk::DescriptorSetLayout,
}

struct VkFramebuffer {
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

/// Vulkan implementation of [`RenderDevice`]
pub struct VulkanDevice {
    device: ash::Device,
    allocator: Option<Arc<Mutex<Allocator>>>,
    descriptor_pool: vk::DescriptorPool,
    attachment_sampler: vk::Sampler,

    textures: HashMap<u64, VkTexture>,
    render_passes: HashMap<u64, vk::RenderPass>,
    framebuffers: HashMap<u64, VkFramebuffer>,
    descriptor_sets: HashMap<u64, VkDescriptorSet>,
    next_id: u64,
}

fn map_vk_error(result: vk::Result) -> BackendError {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            BackendError::OutOfMemory
        }
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        other => BackendError::ResourceCreationFailed(other.to_string()),
    }
}

impl VulkanDevice {
    /// Wrap an existing logical device and allocator.
    ///
    /// The caller keeps ownership of `device` and must destroy it only after
    /// this `VulkanDevice` has been dropped.
    pub fn new(device: ash::Device, allocator: Arc<Mutex<Allocator>>) -> BackendResult<Self> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: MAX_SAMPLED_IMAGES,
        }];

        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(MAX_DESCRIPTOR_SETS)
            .pool_sizes(&pool_sizes);

        let descriptor_pool = unsafe {
            device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(map_vk_error)?
        };

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let attachment_sampler = match unsafe { device.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(descriptor_pool, None) };
                return Err(map_vk_error(e));
            }
        };

        log::info!("VulkanDevice: initialized");

        Ok(Self {
            device,
            allocator: Some(allocator),
            descriptor_pool,
            attachment_sampler,
            textures: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            descriptor_sets: HashMap::new(),
            next_id: 1,
        })
    }

    /// Get the wrapped logical device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Wrap a recording command buffer for [`RenderDevice`] calls
    pub fn command_buffer_handle(command_buffer: vk::CommandBuffer) -> CommandBufferHandle {
        CommandBufferHandle::from_raw(command_buffer.as_raw())
    }

    /// Register an image owned elsewhere (e.g. a swapchain image) as a texture
    pub fn import_texture(
        &mut self,
        image: vk::Image,
        view: vk::ImageView,
        format: TextureFormat,
        extent: Extent2D,
        layout: ImageLayout,
    ) -> TextureHandle {
        let id = self.allocate_id();
        self.textures.insert(
            id,
            VkTexture {
                image,
                view,
                allocation: None,
                info: TextureInfo {
                    width: extent.width,
                    height: extent.height,
                    format,
                    layout,
                    aspect: format.aspect(),
                },
            },
        );
        TextureHandle(id)
    }

    /// Forget an imported texture without destroying the underlying image
    pub fn release_imported_texture(&mut self, texture: TextureHandle) {
        if matches!(self.textures.get(&texture.0), Some(t) if t.allocation.is_none()) {
            self.textures.remove(&texture.0);
        }
    }

    /// Get the raw image view of a texture
    pub fn texture_view(&self, texture: TextureHandle) -> Option<vk::ImageView> {
        self.textures.get(&texture.0).map(|t| t.view)
    }

    /// Get the raw render pass, e.g. for pipeline creation
    pub fn raw_render_pass(&self, render_pass: RenderPassHandle) -> Option<vk::RenderPass> {
        self.render_passes.get(&render_pass.0).copied()
    }

    /// Get the raw descriptor set and its layout, e.g. for binding in a pass callback
    pub fn raw_descriptor_set(
        &self,
        descriptor_set: DescriptorSetHandle,
    ) -> Option<(vk::DescriptorSet, vk::DescriptorSetLayout)> {
        self.descriptor_sets
            .get(&descriptor_set.0)
            .map(|s| (s.set, s.layout))
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn raw_command_buffer(command_buffer: CommandBufferHandle) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(command_buffer.as_raw())
    }

    fn image_view(&self, texture: TextureHandle) -> BackendResult<vk::ImageView> {
        self.texture_view(texture)
            .ok_or(BackendError::InvalidHandle("texture"))
    }

    fn free_texture(&self, texture: VkTexture) {
        let Some(allocation) = texture.allocation else {
            return;
        };
        unsafe {
            self.device.destroy_image_view(texture.view, None);
            self.device.destroy_image(texture.image, None);
        }
        if let Some(ref allocator) = self.allocator {
            let _ = allocator.lock().free(allocation);
        }
    }

    fn subpass_dependencies() -> [vk::SubpassDependency; 2] {
        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let attachment_writes =
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        let attachment_access = attachment_writes
            | vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;

        [
            // Earlier passes' attachment writes are visible to sampling and attachment access
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(attachment_stages)
                .dst_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
                .src_access_mask(attachment_writes)
                .dst_access_mask(attachment_access | vk::AccessFlags::SHADER_READ),
            // Later passes see this pass's writes
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(attachment_stages)
                .dst_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
                .src_access_mask(attachment_writes)
                .dst_access_mask(attachment_access | vk::AccessFlags::SHADER_READ),
        ]
    }
}

impl RenderDevice for VulkanDevice {
    fn create_render_pass(
        &mut self,
        desc: &RenderPassDescriptor,
    ) -> BackendResult<RenderPassHandle> {
        let attachments: Vec<vk::AttachmentDescription> = desc
            .attachments()
            .iter()
            .map(|a| {
                vk::AttachmentDescription::default()
                    .format(conversion::format(a.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(conversion::load_op(a.load_op))
                    .store_op(conversion::store_op(a.store_op))
                    .stencil_load_op(conversion::load_op(a.stencil_load_op))
                    .stencil_store_op(conversion::store_op(a.stencil_store_op))
                    .initial_layout(conversion::image_layout(a.initial_layout))
                    .final_layout(conversion::image_layout(a.final_layout))
            })
            .collect();

        let to_vk = |r: &AttachmentReference| vk::AttachmentReference {
            attachment: r.index,
            layout: conversion::image_layout(r.layout),
        };

        // References must outlive the subpass descriptions pointing at them
        struct SubpassRefs {
            color: Vec<vk::AttachmentReference>,
            resolve: Vec<vk::AttachmentReference>,
            depth: Option<vk::AttachmentReference>,
        }

        let refs: Vec<SubpassRefs> = desc
            .subpasses()
            .iter()
            .map(|subpass| {
                let color: Vec<_> = subpass.color_attachments.iter().map(to_vk).collect();
                let mut resolve: Vec<_> = subpass.resolve_attachments.iter().map(to_vk).collect();
                if !resolve.is_empty() {
                    // Resolve references pair with color references one to one
                    resolve.resize(
                        color.len(),
                        vk::AttachmentReference {
                            attachment: vk::ATTACHMENT_UNUSED,
                            layout: vk::ImageLayout::UNDEFINED,
                        },
                    );
                }
                SubpassRefs {
                    color,
                    resolve,
                    depth: subpass.depth_stencil_attachment.as_ref().map(to_vk),
                }
            })
            .collect();

        let subpasses: Vec<vk::SubpassDescription> = refs
            .iter()
            .map(|r| {
                let mut subpass = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&r.color);
                if !r.resolve.is_empty() {
                    subpass = subpass.resolve_attachments(&r.resolve);
                }
                if let Some(depth) = r.depth.as_ref() {
                    subpass = subpass.depth_stencil_attachment(depth);
                }
                subpass
            })
            .collect();

        let dependencies = Self::subpass_dependencies();
        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            self.device
                .create_render_pass(&render_pass_info, None)
                .map_err(map_vk_error)?
        };

        let id = self.allocate_id();
        log::trace!("VulkanDevice: created render pass {:?} ({})", desc.label, id);
        self.render_passes.insert(id, render_pass);
        Ok(RenderPassHandle(id))
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let format = conversion::format(desc.format);
        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        };

        let image_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            extent,
            mip_levels: desc.mip_levels,
            array_layers: 1,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            initial_layout: vk::ImageLayout::UNDEFINED,
            usage: conversion::texture_usage(desc.usage),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };

        unsafe {
            let image = self
                .device
                .create_image(&image_info, None)
                .map_err(map_vk_error)?;

            let requirements = self.device.get_image_memory_requirements(image);

            let Some(allocator) = self.allocator.as_ref() else {
                self.device.destroy_image(image, None);
                return Err(BackendError::ResourceCreationFailed(
                    "Allocator not available".into(),
                ));
            };

            let allocation = match allocator.lock().allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("render graph attachment"),
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(BackendError::ResourceCreationFailed(e.to_string()));
                }
            };

            if let Err(e) =
                self.device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())
            {
                self.device.destroy_image(image, None);
                let _ = allocator.lock().free(allocation);
                return Err(map_vk_error(e));
            }

            let aspect = desc.format.aspect();
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: conversion::aspect(aspect),
                    base_mip_level: 0,
                    level_count: desc.mip_levels,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = match self.device.create_image_view(&view_info, None) {
                Ok(view) => view,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    let _ = allocator.lock().free(allocation);
                    return Err(map_vk_error(e));
                }
            };

            let id = self.allocate_id();
            log::trace!(
                "VulkanDevice: created texture {:?} ({}x{}, {:?})",
                desc.label,
                desc.width,
                desc.height,
                desc.format
            );
            self.textures.insert(
                id,
                VkTexture {
                    image,
                    view,
                    allocation: Some(allocation),
                    info: TextureInfo {
                        width: desc.width,
                        height: desc.height,
                        format: desc.format,
                        layout: ImageLayout::Undefined,
                        aspect,
                    },
                },
            );

            Ok(TextureHandle(id))
        }
    }

    fn texture_info(&self, texture: TextureHandle) -> Option<TextureInfo> {
        self.textures.get(&texture.0).map(|t| t.info)
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let render_pass = self
            .raw_render_pass(desc.render_pass)
            .ok_or(BackendError::InvalidHandle("render pass"))?;
        let views = desc
            .attachments
            .iter()
            .map(|&texture| self.image_view(texture))
            .collect::<BackendResult<Vec<_>>>()?;

        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(desc.width)
            .height(desc.height)
            .layers(1);

        let framebuffer = unsafe {
            self.device
                .create_framebuffer(&framebuffer_info, None)
                .map_err(map_vk_error)?
        };

        let id = self.allocate_id();
        log::trace!("VulkanDevice: created framebuffer {:?} ({})", desc.label, id);
        self.framebuffers.insert(
            id,
            VkFramebuffer {
                framebuffer,
                extent: vk::Extent2D {
                    width: desc.width,
                    height: desc.height,
                },
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn framebuffer_extent(&self, framebuffer: FramebufferHandle) -> Option<Extent2D> {
        self.framebuffers
            .get(&framebuffer.0)
            .map(|fb| Extent2D::new(fb.extent.width, fb.extent.height))
    }

    fn create_descriptor_set(
        &mut self,
        desc: &DescriptorSetDescriptor,
    ) -> BackendResult<DescriptorSetHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .images
            .iter()
            .map(|image| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(image.binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(conversion::shader_stages(image.stage))
            })
            .collect();

        let image_infos = desc
            .images
            .iter()
            .map(|image| {
                Ok(vk::DescriptorImageInfo::default()
                    .sampler(self.attachment_sampler)
                    .image_view(self.image_view(image.texture)?)
                    .image_layout(conversion::image_layout(image.layout)))
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(map_vk_error)?
        };

        let set_layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);

        let set = match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
                return Err(map_vk_error(e));
            }
        };

        let writes: Vec<vk::WriteDescriptorSet> = desc
            .images
            .iter()
            .zip(&image_infos)
            .map(|(image, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(image.binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info))
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        let id = self.allocate_id();
        log::trace!(
            "VulkanDevice: created descriptor set {:?} ({} images)",
            desc.label,
            desc.images.len()
        );
        self.descriptor_sets.insert(id, VkDescriptorSet { set, layout });
        Ok(DescriptorSetHandle(id))
    }

    fn begin_render_pass(
        &mut self,
        command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) {
        let (Some(render_pass), Some(framebuffer)) = (
            self.raw_render_pass(render_pass),
            self.framebuffers.get(&framebuffer.0),
        ) else {
            log::error!("VulkanDevice: begin_render_pass with unknown render pass or framebuffer");
            return;
        };

        let clear_values: Vec<vk::ClearValue> =
            clear_values.iter().copied().map(conversion::clear_value).collect();

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: framebuffer.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(
                Self::raw_command_buffer(command_buffer),
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
    }

    fn end_render_pass(&mut self, command_buffer: CommandBufferHandle) {
        unsafe {
            self.device
                .cmd_end_render_pass(Self::raw_command_buffer(command_buffer));
        }
    }

    fn pipeline_barrier(&mut self, command_buffer: CommandBufferHandle, barrier: &PipelineBarrier) {
        let memory_barriers: Vec<vk::MemoryBarrier> = barrier
            .memory_barriers
            .iter()
            .map(|b| {
                vk::MemoryBarrier::default()
                    .src_access_mask(conversion::access(b.src_access))
                    .dst_access_mask(conversion::access(b.dst_access))
            })
            .collect();

        let mut image_barriers = Vec::with_capacity(barrier.image_barriers.len());
        for b in &barrier.image_barriers {
            let Some(texture) = self.textures.get_mut(&b.texture.0) else {
                log::warn!("VulkanDevice: barrier on unknown texture {:?}", b.texture);
                continue;
            };
            texture.info.layout = b.new_layout;
            image_barriers.push(
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(conversion::access(b.src_access))
                    .dst_access_mask(conversion::access(b.dst_access))
                    .old_layout(conversion::image_layout(b.old_layout))
                    .new_layout(conversion::image_layout(b.new_layout))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(texture.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: conversion::aspect(b.aspect),
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    }),
            );
        }

        unsafe {
            self.device.cmd_pipeline_barrier(
                Self::raw_command_buffer(command_buffer),
                conversion::pipeline_stages(barrier.src_stage),
                conversion::pipeline_stages(barrier.dst_stage),
                conversion::dependency_flags(barrier.dependency_flags),
                &memory_barriers,
                &[],
                &image_barriers,
            );
        }
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        if let Some(raw) = self.render_passes.remove(&render_pass.0) {
            unsafe { self.device.destroy_render_pass(raw, None) };
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if !matches!(self.textures.get(&texture.0), Some(t) if t.allocation.is_some()) {
            return;
        }
        if let Some(vk_texture) = self.textures.remove(&texture.0) {
            self.free_texture(vk_texture);
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(fb) = self.framebuffers.remove(&framebuffer.0) {
            unsafe { self.device.destroy_framebuffer(fb.framebuffer, None) };
        }
    }

    fn destroy_descriptor_set(&mut self, descriptor_set: DescriptorSetHandle) {
        if let Some(set) = self.descriptor_sets.remove(&descriptor_set.0) {
            unsafe {
                let _ = self
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &[set.set]);
                self.device.destroy_descriptor_set_layout(set.layout, None);
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, set) in self.descriptor_sets.drain() {
                self.device.destroy_descriptor_set_layout(set.layout, None);
            }
            for (_, fb) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(fb.framebuffer, None);
            }
            for (_, render_pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(render_pass, None);
            }
        }

        let textures: Vec<VkTexture> = self.textures.drain().map(|(_, t)| t).collect();
        for texture in textures {
            self.free_texture(texture);
        }

        // Drop the allocator before the caller destroys the device
        drop(self.allocator.take());

        unsafe {
            self.device.destroy_sampler(self.attachment_sampler, None);
            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}
