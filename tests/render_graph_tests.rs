//! Render graph integration tests.
//!
//! These tests build complete graphs against the dummy device and verify
//! execution order, compiled layouts, per-frame resources, resizing and the
//! deferred destruction of retired resources.
//!
//! # Test Categories
//!
//! - **Scheduling Tests**: execution order, cycles and pruning
//! - **Barrier Tests**: store ops and layouts between producers and consumers
//! - **Resource Tests**: per-frame resources, resize and the resource hold
//! - **Failure Tests**: device failures release everything created so far
//!
//! ```bash
//! cargo test --test render_graph_tests
//! ```

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use render_graph_engine::backend::dummy::DeviceCommand;
use render_graph_engine::backend::*;
use render_graph_engine::{
    BuildState, PassId, RenderGraph, RenderGraphError, RenderGraphPass,
};
use rstest::rstest;

// ============================================================================
// Scheduling Tests
// ============================================================================

/// A single pass rendering straight into the output.
#[rstest]
#[case::single_buffered(1)]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
fn test_single_pass_output(#[case] frames: usize) {
    init_logging();
    let mut device = DummyDevice::new();
    let (mut graph, ids) = build(&mut device, frames, vec![color_pass("main")]);

    assert_eq!(graph.state(), BuildState::Built);
    assert_eq!(graph.execution_order(), &[ids[0]]);
    assert_eq!(graph.dependency_graph().edge_count(), 0);
    assert_eq!(graph.pass_resources(ids[0]).unwrap().len(), frames);
    assert_eq!(device.live_framebuffer_count(), frames);
    // The output attachment borrows the targets
    assert_eq!(device.live_texture_count(), 0);

    let output = &graph.pass(ids[0]).unwrap().attachments()[0].description;
    assert_eq!(output.format, TextureFormat::Bgra8UnormSrgb);
    assert_eq!(output.final_layout, ImageLayout::PresentSrc);

    run_frames(&mut graph, &mut device, 0, frames * 2);
    assert!(device.layout_violations().is_empty());

    graph.destroy(&mut device);
    assert_eq!(device.live_render_pass_count(), 0);
    assert_eq!(device.live_framebuffer_count(), 0);
}

/// P1 samples P0's color attachment.
#[rstest]
#[case::single_buffered(1)]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
fn test_read_dependency(#[case] frames: usize) {
    init_logging();
    let mut device = DummyDevice::new();
    let p0 = PassId::from_index(0);
    let (mut graph, ids) = build(
        &mut device,
        frames,
        vec![color_pass("scene"), reader_pass("post", &[p0])],
    );
    let p1 = ids[1];

    assert_eq!(graph.execution_order(), &[p0, p1]);
    let produced = &graph.pass(p0).unwrap().attachments()[0].description;
    assert_eq!(produced.final_layout, ImageLayout::ShaderReadOnly);
    assert_eq!(produced.store_op, StoreOp::Store);

    for frame in 0..frames {
        let consumer = &graph.pass_resources(p1).unwrap()[frame];
        let set = device
            .descriptor_set_descriptor(consumer.read_descriptor_set.unwrap())
            .unwrap();
        assert_eq!(set.images.len(), 1);
        assert_eq!(
            set.images[0].texture,
            graph.pass_resources(p0).unwrap()[frame].attachment_textures[0]
        );
        assert_eq!(set.images[0].layout, ImageLayout::ShaderReadOnly);
    }
    assert!(graph.pass_resources(p0).unwrap()[0].read_descriptor_set.is_none());
    assert_eq!(device.live_texture_count(), frames);

    run_frames(&mut graph, &mut device, 0, frames * 3);
    assert!(device.layout_violations().is_empty());
    graph.destroy(&mut device);
    assert_eq!(device.live_texture_count(), 0);
    assert_eq!(device.live_descriptor_set_count(), 0);
}

/// Producers always precede their consumers for arbitrary acyclic graphs.
#[test]
fn test_random_acyclic_graphs_are_ordered() {
    init_logging();
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    for _ in 0..32 {
        let pass_count = 2 + (next() % 10) as usize;
        let mut passes = Vec::with_capacity(pass_count);
        for i in 0..pass_count {
            let producers: Vec<PassId> = (0..i)
                .filter(|_| next() % 3 == 0)
                .map(PassId::from_index)
                .collect();
            passes.push(reader_pass(&format!("pass_{i}"), &producers));
        }

        let mut device = DummyDevice::new();
        let (mut graph, ids) = build(&mut device, 2, passes);
        let order = graph.execution_order().to_vec();
        let position = |id: PassId| order.iter().position(|&p| p == id);

        assert!(order.len() <= pass_count);
        assert_eq!(order.last(), ids.last());
        for &consumer in &order {
            for input in graph.pass(consumer).unwrap().read_inputs() {
                assert!(position(input.pass).unwrap() < position(consumer).unwrap());
            }
        }
        graph.destroy(&mut device);
    }
}

#[test]
fn test_mutual_dependency_is_a_cycle() {
    init_logging();
    let mut device = DummyDevice::new();
    let (mut graph, _) = declare(
        &mut device,
        2,
        vec![
            reader_pass("a", &[PassId::from_index(1)]),
            reader_pass("b", &[PassId::from_index(0)]),
        ],
    );

    let err = graph.end_building(&mut device).unwrap_err();
    assert!(matches!(err, RenderGraphError::CycleDetected(_)));
    assert_eq!(graph.state(), BuildState::Empty);
    assert_eq!(device.live_render_pass_count(), 0);
    assert_eq!(device.live_texture_count(), 0);
}

#[test]
fn test_indirect_cycle_behind_output_is_detected() {
    init_logging();
    let mut device = DummyDevice::new();
    let (mut graph, _) = declare(
        &mut device,
        2,
        vec![
            reader_pass("a", &[PassId::from_index(2)]),
            reader_pass("b", &[PassId::from_index(0)]),
            reader_pass("c", &[PassId::from_index(1)]),
            reader_pass("present", &[PassId::from_index(0)]),
        ],
    );
    assert!(matches!(
        graph.end_building(&mut device),
        Err(RenderGraphError::CycleDetected(_))
    ));
}

#[test]
fn test_self_read_is_a_cycle() {
    init_logging();
    let mut device = DummyDevice::new();
    let (mut graph, _) = declare(
        &mut device,
        2,
        vec![reader_pass("feedback", &[PassId::from_index(0)])],
    );
    assert_eq!(
        graph.end_building(&mut device),
        Err(RenderGraphError::CycleDetected("feedback".into()))
    );
}

/// A cycle that the output never depends on is pruned, not reported.
#[test]
fn test_unreachable_cycle_is_pruned() {
    init_logging();
    let mut device = DummyDevice::new();
    let (mut graph, ids) = build(
        &mut device,
        2,
        vec![
            reader_pass("a", &[PassId::from_index(1)]),
            reader_pass("b", &[PassId::from_index(0)]),
            color_pass("present"),
        ],
    );
    assert_eq!(graph.execution_order(), &[ids[2]]);
    graph.destroy(&mut device);
}

/// Passes without a path to the output are not executed but still provisioned.
#[test]
fn test_dead_pass_is_pruned() {
    init_logging();
    let mut device = DummyDevice::new();
    let executed = Arc::new(Mutex::new(Vec::new()));

    let p0 = PassId::from_index(0);
    let passes: Vec<RenderGraphPass> = [
        color_pass("scene"),
        reader_pass("debug_overlay", &[p0]),
        reader_pass("post", &[p0]),
    ]
    .into_iter()
    .map(|pass| {
        let executed = Arc::clone(&executed);
        let name = pass.name().to_string();
        pass.with_callback(move |_| executed.lock().unwrap().push(name.clone()))
    })
    .collect();

    let (mut graph, ids) = build(&mut device, 2, passes);
    assert_eq!(graph.execution_order(), &[ids[0], ids[2]]);
    assert_eq!(graph.pass_resources(ids[1]).unwrap().len(), 2);
    assert!(graph.render_pass(ids[1]).is_some());

    run_frames(&mut graph, &mut device, 0, 1);
    assert_eq!(*executed.lock().unwrap(), vec!["scene", "post"]);
    graph.destroy(&mut device);
}

// ============================================================================
// Barrier Tests
// ============================================================================

/// Reading the same attachment twice adds one edge, one binding and one reset barrier.
#[test]
fn test_duplicate_reads_are_idempotent() {
    init_logging();
    let mut device = DummyDevice::new();

    let mut scene = RenderGraphPass::new("scene");
    scene.add_color_attachment(
        AttachmentDescription::color(TextureFormat::Rgba16Float)
            .with_layouts(ImageLayout::ColorAttachment, ImageLayout::ColorAttachment),
        "color",
        ImageLayout::ColorAttachment,
    );
    let p0 = PassId::from_index(0);
    let (mut graph, ids) = build(&mut device, 2, vec![scene, reader_pass("post", &[p0, p0])]);

    assert_eq!(graph.dependency_graph().edge_count(), 1);
    let set = graph.pass_resources(ids[1]).unwrap()[0].read_descriptor_set.unwrap();
    assert_eq!(device.descriptor_set_descriptor(set).unwrap().images.len(), 1);

    run_frames(&mut graph, &mut device, 0, 2);
    device.clear_commands();
    run_frames(&mut graph, &mut device, 2, 1);

    let barriers: Vec<&PipelineBarrier> = device
        .commands()
        .iter()
        .filter_map(|c| match c {
            DeviceCommand::PipelineBarrier { barrier, .. } => Some(barrier),
            _ => None,
        })
        .collect();
    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].image_barriers.len(), 1);
    assert_eq!(barriers[0].image_barriers[0].old_layout, ImageLayout::ShaderReadOnly);
    assert_eq!(barriers[0].image_barriers[0].new_layout, ImageLayout::ColorAttachment);
    assert!(device.layout_violations().is_empty());
    graph.destroy(&mut device);
}

/// A write input loads the producer's attachment into the writer's render pass.
#[rstest]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
fn test_write_input_accumulates(#[case] frames: usize) {
    init_logging();
    let mut device = DummyDevice::new();

    let p0 = PassId::from_index(0);
    let mut overlay = color_pass("overlay");
    overlay.add_write_input(p0, "color", ImageLayout::ColorAttachment);
    let (mut graph, ids) = build(&mut device, frames, vec![color_pass("scene"), overlay]);
    let p1 = ids[1];

    assert_eq!(graph.execution_order(), &[p0, p1]);
    let rp = device.render_pass_descriptor(graph.render_pass(p1).unwrap()).unwrap();
    assert_eq!(rp.attachments().len(), 2);
    assert_eq!(rp.attachments()[1].load_op, LoadOp::Load);
    assert_eq!(rp.attachments()[1].store_op, StoreOp::Store);
    assert_eq!(rp.attachments()[1].initial_layout, ImageLayout::ColorAttachment);
    assert_eq!(rp.subpasses()[0].color_attachments.len(), 2);

    for frame in 0..frames {
        let fb = graph.pass_resources(p1).unwrap()[frame].framebuffer;
        let attachments = &device.framebuffer_descriptor(fb).unwrap().attachments;
        assert_eq!(
            attachments[1],
            graph.pass_resources(p0).unwrap()[frame].attachment_textures[0]
        );
    }

    run_frames(&mut graph, &mut device, 0, frames * 2);
    assert!(device.layout_violations().is_empty());
    graph.destroy(&mut device);
}

/// Declaring the same write input twice loads the producer's attachment once.
#[test]
fn test_duplicate_write_inputs_are_idempotent() {
    init_logging();
    let mut device = DummyDevice::new();

    let p0 = PassId::from_index(0);
    let mut overlay = color_pass("overlay");
    overlay.add_write_input(p0, "color", ImageLayout::ColorAttachment);
    overlay.add_write_input(p0, "color", ImageLayout::ColorAttachment);
    let (mut graph, ids) = build(&mut device, 2, vec![color_pass("scene"), overlay]);

    assert_eq!(graph.dependency_graph().edge_count(), 1);
    let rp = device.render_pass_descriptor(graph.render_pass(ids[1]).unwrap()).unwrap();
    assert_eq!(rp.attachments().len(), 2);
    assert_eq!(rp.subpasses()[0].color_attachments.len(), 2);
    let fb = graph.pass_resources(ids[1]).unwrap()[0].framebuffer;
    assert_eq!(device.framebuffer_descriptor(fb).unwrap().attachments.len(), 2);

    run_frames(&mut graph, &mut device, 0, 4);
    assert!(device.layout_violations().is_empty());
    graph.destroy(&mut device);
}

/// An attachment written by one pass and sampled by a later one leaves the
/// writer's render pass in the layout the reader samples it in.
#[rstest]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
fn test_write_input_then_read(#[case] frames: usize) {
    init_logging();
    let mut device = DummyDevice::new();

    let mut scene = RenderGraphPass::new("scene");
    scene.add_color_attachment(
        AttachmentDescription::color(TextureFormat::Rgba16Float)
            .with_layouts(ImageLayout::ColorAttachment, ImageLayout::ColorAttachment),
        "color",
        ImageLayout::ColorAttachment,
    );
    let p0 = PassId::from_index(0);
    let p1 = PassId::from_index(1);
    let mut overlay = color_pass("overlay");
    overlay.add_write_input(p0, "color", ImageLayout::ColorAttachment);
    let (mut graph, ids) = build(
        &mut device,
        frames,
        vec![scene, overlay, reader_pass("post", &[p0, p1])],
    );

    assert_eq!(graph.execution_order(), &[p0, p1, ids[2]]);
    let produced = &graph.pass(p0).unwrap().attachments()[0].description;
    assert_eq!(produced.final_layout, ImageLayout::ColorAttachment);

    let rp = device.render_pass_descriptor(graph.render_pass(p1).unwrap()).unwrap();
    assert_eq!(rp.attachments()[1].initial_layout, ImageLayout::ColorAttachment);
    assert_eq!(rp.attachments()[1].final_layout, ImageLayout::ShaderReadOnly);
    assert_eq!(rp.subpasses()[0].color_attachments[1].layout, ImageLayout::ColorAttachment);

    run_frames(&mut graph, &mut device, 0, frames * 3);
    assert!(device.layout_violations().is_empty());
    graph.destroy(&mut device);
}

/// An attachment sampled first and written afterwards enters the writer's
/// render pass in the layout the reader left it in.
#[test]
fn test_read_then_write_input() {
    init_logging();
    let mut device = DummyDevice::new();

    let mut scene = RenderGraphPass::new("scene");
    scene.add_color_attachment(
        AttachmentDescription::color(TextureFormat::Rgba16Float)
            .with_layouts(ImageLayout::ColorAttachment, ImageLayout::ColorAttachment),
        "color",
        ImageLayout::ColorAttachment,
    );
    let p0 = PassId::from_index(0);
    let p1 = PassId::from_index(1);
    let mut composite = reader_pass("composite", &[p1]);
    composite.add_write_input(p0, "color", ImageLayout::ColorAttachment);
    let (mut graph, ids) = build(
        &mut device,
        2,
        vec![scene, reader_pass("blur", &[p0]), composite],
    );

    assert_eq!(graph.execution_order(), &[p0, p1, ids[2]]);
    let produced = &graph.pass(p0).unwrap().attachments()[0].description;
    assert_eq!(produced.final_layout, ImageLayout::ShaderReadOnly);
    let rp = device.render_pass_descriptor(graph.render_pass(ids[2]).unwrap()).unwrap();
    assert_eq!(rp.attachments()[1].initial_layout, ImageLayout::ShaderReadOnly);
    assert_eq!(rp.attachments()[1].final_layout, ImageLayout::ColorAttachment);

    run_frames(&mut graph, &mut device, 0, 6);
    assert!(device.layout_violations().is_empty());
    graph.destroy(&mut device);
}

/// Two readers sampling the same attachment in different layouts get a
/// transition recorded between them.
#[test]
fn test_readers_in_different_layouts() {
    init_logging();
    let mut device = DummyDevice::new();

    let p0 = PassId::from_index(0);
    let p1 = PassId::from_index(1);
    let mut composite = color_pass("composite");
    composite.add_read_input(p0, "color", ImageLayout::General);
    composite.add_read_input(p1, "color", ImageLayout::ShaderReadOnly);
    let (mut graph, ids) = build(
        &mut device,
        2,
        vec![color_pass("scene"), reader_pass("blur", &[p0]), sampling(composite)],
    );
    assert_eq!(graph.execution_order(), &[p0, p1, ids[2]]);

    run_frames(&mut graph, &mut device, 0, 1);
    let scene_color = graph.pass_resources(p0).unwrap()[0].attachment_textures[0];
    let transitions: Vec<&ImageBarrier> = device
        .commands()
        .iter()
        .filter_map(|c| match c {
            DeviceCommand::PipelineBarrier { barrier, .. } => Some(barrier),
            _ => None,
        })
        .flat_map(|barrier| barrier.image_barriers.iter())
        .filter(|image| image.texture == scene_color)
        .collect();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].old_layout, ImageLayout::ShaderReadOnly);
    assert_eq!(transitions[0].new_layout, ImageLayout::General);

    run_frames(&mut graph, &mut device, 1, 4);
    assert!(device.layout_violations().is_empty());
    graph.destroy(&mut device);
}

/// A depth write input becomes the writer's depth-stencil attachment.
#[test]
fn test_depth_write_input() {
    init_logging();
    let mut device = DummyDevice::new();

    let mut prepass = RenderGraphPass::new("depth_prepass");
    prepass.add_depth_stencil_attachment(
        AttachmentDescription::depth_stencil(TextureFormat::Depth24PlusStencil8),
        "depth",
        ImageLayout::DepthStencilAttachment,
    );
    let mut main = color_pass("main");
    main.add_write_input(
        PassId::from_index(0),
        "depth",
        ImageLayout::DepthStencilAttachment,
    );
    let (mut graph, ids) = build(&mut device, 2, vec![prepass, main]);

    let produced = &graph.pass(ids[0]).unwrap().attachments()[0].description;
    assert_eq!(produced.store_op, StoreOp::Store);
    assert_eq!(produced.stencil_store_op, StoreOp::Store);

    let rp = device.render_pass_descriptor(graph.render_pass(ids[1]).unwrap()).unwrap();
    let subpass = &rp.subpasses()[0];
    assert_eq!(subpass.color_attachments.len(), 1);
    assert_eq!(subpass.depth_stencil_attachment.unwrap().index, 1);
    assert_eq!(rp.attachments()[1].stencil_load_op, LoadOp::Load);

    let texture = graph.pass_resources(ids[0]).unwrap()[0].attachment_textures[0];
    assert_eq!(device.texture_info(texture).unwrap().aspect, ImageAspect::DepthStencil);

    run_frames(&mut graph, &mut device, 0, 4);
    assert!(device.layout_violations().is_empty());
    graph.destroy(&mut device);
}

/// Offscreen targets keep their own layout across frames.
#[test]
fn test_offscreen_output_keeps_target_layout() {
    init_logging();
    let mut device = DummyDevice::new();
    let mut graph = RenderGraph::new();
    graph.begin_building(config(2)).unwrap();
    let p0 = graph.add_pass(color_pass("thumbnail")).unwrap();
    let targets: Vec<TextureHandle> = (0..2)
        .map(|_| device.import_texture(64, 64, TextureFormat::Rgba8Unorm, ImageLayout::ShaderReadOnly))
        .collect();
    graph.set_output_attachment(p0, "color", targets.clone()).unwrap();
    graph.end_building(&mut device).unwrap();

    let output = &graph.pass(p0).unwrap().attachments()[0].description;
    assert_eq!(output.initial_layout, ImageLayout::ShaderReadOnly);
    assert_eq!(output.final_layout, ImageLayout::ShaderReadOnly);

    run_frames(&mut graph, &mut device, 0, 4);
    assert!(device.layout_violations().is_empty());
    for target in targets {
        assert_eq!(
            device.texture_info(target).unwrap().layout,
            ImageLayout::ShaderReadOnly
        );
    }
    graph.destroy(&mut device);
}

// ============================================================================
// Resource Tests
// ============================================================================

/// Resizing rebuilds per-frame resources only.
#[rstest]
#[case::single_buffered(1)]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
fn test_resize_keeps_order_and_render_passes(#[case] frames: usize) {
    init_logging();
    let mut device = DummyDevice::new();
    let p0 = PassId::from_index(0);
    let (mut graph, ids) = build(
        &mut device,
        frames,
        vec![color_pass("scene"), reader_pass("post", &[p0])],
    );
    run_frames(&mut graph, &mut device, 0, frames);

    let order = graph.execution_order().to_vec();
    let render_passes: Vec<_> = ids.iter().map(|&id| graph.render_pass(id)).collect();
    let old_texture = graph.pass_resources(p0).unwrap()[0].attachment_textures[0];

    let targets = sized_targets(&mut device, frames, 640, 360);
    graph.resize_swapchain_resources(&mut device, targets).unwrap();

    assert_eq!(graph.execution_order(), order.as_slice());
    let resized: Vec<_> = ids.iter().map(|&id| graph.render_pass(id)).collect();
    assert_eq!(resized, render_passes);
    assert_eq!(graph.extent(), Extent2D::new(640, 360));
    assert_eq!(graph.pass_resources(p0).unwrap().len(), frames);

    let new_texture = graph.pass_resources(p0).unwrap()[0].attachment_textures[0];
    assert_ne!(new_texture, old_texture);
    assert_eq!(device.texture_info(new_texture).unwrap().extent(), Extent2D::new(640, 360));

    // Old resources survive until every frame slot has been reused
    assert_eq!(graph.held_generations(), 1);
    assert!(device.is_texture_alive(old_texture));
    run_frames(&mut graph, &mut device, frames, frames);
    assert_eq!(graph.held_generations(), 0);
    assert!(!device.is_texture_alive(old_texture));
    assert_eq!(device.live_texture_count(), frames);
    assert!(device.layout_violations().is_empty());

    graph.destroy(&mut device);
}

/// New targets in another layout than the build saw are moved into the
/// layout the output render pass starts with.
#[test]
fn test_resize_to_targets_in_another_layout() {
    init_logging();
    let mut device = DummyDevice::new();
    let mut graph = RenderGraph::new();
    graph.begin_building(config(2)).unwrap();
    let p0 = graph.add_pass(color_pass("thumbnail")).unwrap();
    let targets: Vec<TextureHandle> = (0..2)
        .map(|_| device.import_texture(64, 64, TextureFormat::Rgba8Unorm, ImageLayout::ShaderReadOnly))
        .collect();
    graph.set_output_attachment(p0, "color", targets).unwrap();
    graph.end_building(&mut device).unwrap();
    run_frames(&mut graph, &mut device, 0, 2);

    let resized: Vec<TextureHandle> = (0..2)
        .map(|_| device.import_texture(128, 128, TextureFormat::Rgba8Unorm, ImageLayout::Undefined))
        .collect();
    graph.resize_resources(&mut device, resized.clone()).unwrap();
    run_frames(&mut graph, &mut device, 2, 4);

    assert!(device.layout_violations().is_empty());
    for target in resized {
        assert_eq!(
            device.texture_info(target).unwrap().layout,
            ImageLayout::ShaderReadOnly
        );
    }
    graph.destroy(&mut device);
}

/// Every target is checked, not only the one of frame 0.
#[test]
fn test_resize_rejects_mismatched_later_targets() {
    init_logging();
    let mut device = DummyDevice::new();
    let (mut graph, _) = build(&mut device, 2, vec![color_pass("main")]);

    let mixed_format = vec![
        device.import_texture(640, 360, TextureFormat::Bgra8UnormSrgb, ImageLayout::Undefined),
        device.import_texture(640, 360, TextureFormat::Rgba16Float, ImageLayout::Undefined),
    ];
    assert!(matches!(
        graph.resize_swapchain_resources(&mut device, mixed_format),
        Err(RenderGraphError::OutputFormatChanged { .. })
    ));

    let mixed_size = vec![
        device.import_texture(640, 360, TextureFormat::Bgra8UnormSrgb, ImageLayout::Undefined),
        device.import_texture(320, 180, TextureFormat::Bgra8UnormSrgb, ImageLayout::Undefined),
    ];
    assert_eq!(
        graph.resize_swapchain_resources(&mut device, mixed_size),
        Err(RenderGraphError::OutputExtentMismatch {
            frame: 1,
            expected: Extent2D::new(640, 360),
            actual: Extent2D::new(320, 180),
        })
    );

    let missing = sized_targets(&mut device, 2, 640, 360);
    device.release_imported_texture(missing[1]);
    assert!(matches!(
        graph.resize_swapchain_resources(&mut device, missing),
        Err(RenderGraphError::Backend(BackendError::InvalidHandle(_)))
    ));

    assert_eq!(graph.state(), BuildState::Built);
    assert_eq!(graph.extent(), Extent2D::new(TARGET_WIDTH, TARGET_HEIGHT));
    assert_eq!(graph.held_generations(), 0);
    graph.destroy(&mut device);
}

#[test]
fn test_resize_rejects_incompatible_targets() {
    init_logging();
    let mut device = DummyDevice::new();
    let (mut graph, _) = build(&mut device, 2, vec![color_pass("main")]);

    let too_few = sized_targets(&mut device, 1, 640, 360);
    assert_eq!(
        graph.resize_swapchain_resources(&mut device, too_few),
        Err(RenderGraphError::FrameCountMismatch {
            expected: 2,
            actual: 1
        })
    );

    let offscreen = sized_targets(&mut device, 2, 640, 360);
    assert!(matches!(
        graph.resize_resources(&mut device, offscreen),
        Err(RenderGraphError::OutputFormatChanged { .. })
    ));

    let hdr: Vec<TextureHandle> = (0..2)
        .map(|_| device.import_texture(640, 360, TextureFormat::Rgba16Float, ImageLayout::Undefined))
        .collect();
    assert!(matches!(
        graph.resize_swapchain_resources(&mut device, hdr),
        Err(RenderGraphError::OutputFormatChanged { .. })
    ));

    // Rejected resizes leave the graph untouched
    assert_eq!(graph.state(), BuildState::Built);
    assert_eq!(graph.extent(), Extent2D::new(TARGET_WIDTH, TARGET_HEIGHT));
    assert_eq!(graph.held_generations(), 0);
    graph.destroy(&mut device);
}

/// Rebuilding holds the previous build for the larger of both frame counts.
#[rstest]
#[case::same_frames(2, 2)]
#[case::fewer_frames(3, 1)]
#[case::more_frames(1, 3)]
fn test_rebuild_holds_previous_generation(#[case] old_frames: usize, #[case] new_frames: usize) {
    init_logging();
    let mut device = DummyDevice::new();
    let p0 = PassId::from_index(0);
    let (mut graph, _) = build(
        &mut device,
        old_frames,
        vec![color_pass("scene"), reader_pass("post", &[p0])],
    );
    run_frames(&mut graph, &mut device, 0, 1);

    graph.begin_building(config(new_frames)).unwrap();
    assert_eq!(graph.held_generations(), 1);
    let scene = graph.add_pass(color_pass("scene")).unwrap();
    let post = graph.add_pass(reader_pass("post", &[scene])).unwrap();
    let targets = swapchain_targets(&mut device, new_frames);
    graph
        .set_swapchain_output_attachment(post, "color", targets)
        .unwrap();
    graph.end_building(&mut device).unwrap();
    assert_eq!(device.live_render_pass_count(), 4);
    assert_eq!(device.live_texture_count(), old_frames + new_frames);

    let hold_frames = old_frames.max(new_frames);
    run_frames(&mut graph, &mut device, 0, hold_frames - 1);
    assert_eq!(graph.held_generations(), 1);
    run_frames(&mut graph, &mut device, hold_frames - 1, 1);
    assert_eq!(graph.held_generations(), 0);
    assert_eq!(device.live_render_pass_count(), 2);
    assert_eq!(device.live_texture_count(), new_frames);

    graph.destroy(&mut device);
}

#[test]
fn test_clear_resource_hold() {
    init_logging();
    let mut device = DummyDevice::new();
    let (mut graph, _) = build(&mut device, 3, vec![color_pass("main")]);
    let targets = swapchain_targets(&mut device, 3);
    graph.resize_swapchain_resources(&mut device, targets).unwrap();
    assert_eq!(device.live_framebuffer_count(), 6);

    graph.clear_resource_hold(&mut device);
    assert_eq!(graph.held_generations(), 0);
    assert_eq!(device.live_framebuffer_count(), 3);
    graph.destroy(&mut device);
}

#[test]
fn test_clear_values_follow_attachments() {
    init_logging();
    let mut device = DummyDevice::new();
    let mut main = color_pass("main");
    main.add_depth_stencil_attachment(
        AttachmentDescription::depth_stencil(TextureFormat::Depth32Float),
        "depth",
        ImageLayout::DepthStencilAttachment,
    );
    let (mut graph, _) = build(&mut device, 2, vec![main]);
    run_frames(&mut graph, &mut device, 0, 1);

    let clear_values = device.commands().iter().find_map(|c| match c {
        DeviceCommand::BeginRenderPass { clear_values, .. } => Some(clear_values.clone()),
        _ => None,
    });
    assert_eq!(
        clear_values,
        Some(vec![ClearValue::BLACK, ClearValue::DEPTH_ONE])
    );
    graph.destroy(&mut device);
}

// ============================================================================
// Failure Tests
// ============================================================================

/// Every device failure during a build releases everything created so far.
#[rstest]
#[case::single_buffered(1)]
#[case::double_buffered(2)]
fn test_failed_build_releases_resources(#[case] frames: usize) {
    init_logging();
    // 2 render passes, `frames` textures, 2 framebuffers and 1 descriptor set per frame
    let creations = 2 + 4 * frames;

    for budget in 0..creations {
        let mut device = DummyDevice::new();
        let p0 = PassId::from_index(0);
        let (mut graph, _) = declare(
            &mut device,
            frames,
            vec![color_pass("scene"), reader_pass("post", &[p0])],
        );
        device.fail_after(budget);

        assert_eq!(
            graph.end_building(&mut device),
            Err(RenderGraphError::Backend(BackendError::OutOfMemory))
        );
        assert_eq!(graph.state(), BuildState::Empty);
        assert_eq!(device.live_render_pass_count(), 0);
        assert_eq!(device.live_texture_count(), 0);
        assert_eq!(device.live_framebuffer_count(), 0);
        assert_eq!(device.live_descriptor_set_count(), 0);
    }
}

/// A failed resize retires the whole build into the hold.
#[test]
fn test_failed_resize_retires_build() {
    init_logging();
    let mut device = DummyDevice::new();
    let p0 = PassId::from_index(0);
    let (mut graph, _) = build(
        &mut device,
        2,
        vec![color_pass("scene"), reader_pass("post", &[p0])],
    );

    device.fail_after(1);
    let targets = swapchain_targets(&mut device, 2);
    assert!(graph.resize_swapchain_resources(&mut device, targets).is_err());
    assert_eq!(graph.state(), BuildState::Empty);
    assert_eq!(device.live_render_pass_count(), 2);

    graph.clear_resource_hold(&mut device);
    assert_eq!(device.live_render_pass_count(), 0);
    assert_eq!(device.live_texture_count(), 0);
    assert_eq!(device.live_framebuffer_count(), 0);
    assert_eq!(device.live_descriptor_set_count(), 0);
}
