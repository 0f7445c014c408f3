//! Common utilities for render graph integration tests.
//!
//! Every test runs against [`DummyDevice`], which tracks live objects and
//! simulates image layouts.

use render_graph_engine::backend::*;
use render_graph_engine::{PassId, RenderGraph, RenderGraphConfig, RenderGraphPass};

pub const TARGET_WIDTH: u32 = 320;
pub const TARGET_HEIGHT: u32 = 180;

/// Install a test logger once per test binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config(frames: usize) -> RenderGraphConfig {
    RenderGraphConfig::default()
        .with_max_frames_in_flight(frames)
        .with_debug_name("Test")
}

/// Import `frames` swapchain-like images.
pub fn swapchain_targets(device: &mut DummyDevice, frames: usize) -> Vec<TextureHandle> {
    sized_targets(device, frames, TARGET_WIDTH, TARGET_HEIGHT)
}

pub fn sized_targets(
    device: &mut DummyDevice,
    frames: usize,
    width: u32,
    height: u32,
) -> Vec<TextureHandle> {
    (0..frames)
        .map(|_| device.import_texture(width, height, TextureFormat::Bgra8UnormSrgb, ImageLayout::Undefined))
        .collect()
}

/// A pass with a single color attachment named `color`.
pub fn color_pass(name: &str) -> RenderGraphPass {
    let mut pass = RenderGraphPass::new(name);
    pass.add_color_attachment(
        AttachmentDescription::color(TextureFormat::Rgba16Float),
        "color",
        ImageLayout::ColorAttachment,
    );
    pass
}

/// A pass with a color attachment reading the `color` attachment of each producer.
pub fn reader_pass(name: &str, producers: &[PassId]) -> RenderGraphPass {
    let mut pass = color_pass(name);
    for &producer in producers {
        pass.add_read_input(producer, "color", ImageLayout::ShaderReadOnly);
    }
    sampling(pass)
}

/// Bind the pass's read descriptor set when it executes, so the dummy device
/// checks every sampled attachment is in the layout the pass reads it in.
pub fn sampling(pass: RenderGraphPass) -> RenderGraphPass {
    pass.with_callback(|ctx| {
        if let Some(set) = ctx.read_descriptor_set {
            if let Some(device) = ctx.device::<DummyDevice>() {
                device.bind_descriptor_set(set);
            }
        }
    })
}

/// Execute `count` frames, cycling through the frame slots.
pub fn run_frames(graph: &mut RenderGraph, device: &mut DummyDevice, start: usize, count: usize) {
    let frames = graph.frames_in_flight();
    for frame in start..start + count {
        graph
            .execute(device, CommandBufferHandle::from_raw(frame as u64), frame % frames)
            .unwrap();
    }
}

/// Declare a graph from passes and bind the output to the last pass's `color` attachment.
pub fn declare(
    device: &mut DummyDevice,
    frames: usize,
    passes: Vec<RenderGraphPass>,
) -> (RenderGraph, Vec<PassId>) {
    let mut graph = RenderGraph::new();
    graph.begin_building(config(frames)).unwrap();
    let ids: Vec<PassId> = passes
        .into_iter()
        .map(|pass| graph.add_pass(pass).unwrap())
        .collect();
    let targets = swapchain_targets(device, frames);
    let output = *ids.last().unwrap();
    graph
        .set_swapchain_output_attachment(output, "color", targets)
        .unwrap();
    (graph, ids)
}

/// Declare and build a graph, see [`declare`].
pub fn build(
    device: &mut DummyDevice,
    frames: usize,
    passes: Vec<RenderGraphPass>,
) -> (RenderGraph, Vec<PassId>) {
    let (mut graph, ids) = declare(device, frames, passes);
    graph.end_building(device).unwrap();
    (graph, ids)
}
