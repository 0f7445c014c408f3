//! Render graph declaration, compilation and resource provisioning

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderGraphError, RenderGraphResult};
use crate::render_graph::directed_graph::{DirectedGraph, VertexIndex};
use crate::render_graph::pass::*;
use crate::render_graph::resources::*;
use crate::RenderGraphConfig;
use std::collections::HashSet;

/// Index of a pass in the render graph it was added to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub(crate) usize);

impl PassId {
    /// Id of the pass added `index`-th, e.g. to reference a pass declared later
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Lifecycle of a render graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Nothing declared; also the state after a failed build
    Empty,
    /// Between `begin_building` and `end_building`
    Declaring,
    /// Compiled and backed by device resources
    Built,
}

/// The pass attachment rendered into the caller's output targets
#[derive(Debug, Clone)]
pub(crate) struct OutputBinding {
    pub pass: PassId,
    pub attachment: AttachmentIndex,
    pub targets: OutputTargets,
    /// Format of target 0 when the graph was built
    pub target_format: TextureFormat,
    /// Layout of every target when it was bound, before the graph touched it
    pub target_layouts: Vec<ImageLayout>,
}

/// An external attachment with its producer attachment looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedInput {
    pub producer: PassId,
    pub attachment: AttachmentIndex,
    pub optimal_layout: ImageLayout,
    /// Layouts a write input enters and leaves the writer's render pass in
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ResolvedInputs {
    pub reads: Vec<ResolvedInput>,
    pub writes: Vec<ResolvedInput>,
}

/// Layout change of a produced attachment recorded right before a reading pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LayoutTransition {
    pub producer: PassId,
    pub attachment: AttachmentIndex,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

/// One pass using a produced attachment, in execution order
#[derive(Debug, Clone, Copy)]
struct AttachmentUse {
    consumer: PassId,
    layout: ImageLayout,
    /// Index into the consumer's resolved write inputs
    write: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    Discovered,
    Finished,
}

/// Declarative render graph
///
/// Passes are declared between [`RenderGraph::begin_building`] and
/// [`RenderGraph::end_building`]. Building orders the passes reachable from
/// the output attachment, fixes up store ops and final layouts so every
/// attachment ends in the layout its consumer expects, and creates the render
/// passes and per-frame resources. [`RenderGraph::execute`] then records one
/// frame.
pub struct RenderGraph {
    pub(super) state: BuildState,
    pub(super) config: RenderGraphConfig,
    pub(super) passes: Vec<RenderGraphPass>,
    pub(super) output: Option<OutputBinding>,
    pub(super) inputs: Vec<ResolvedInputs>,
    pub(super) dependency_graph: DirectedGraph<PassId, PassId>,
    pub(super) execution_order: Vec<PassId>,
    /// `[pass]`, recorded before the pass begins
    pub(super) transitions: Vec<Vec<LayoutTransition>>,
    /// `[pass][attachment]`, layout each local attachment is left in at the end of a frame
    pub(super) end_layouts: Vec<Vec<ImageLayout>>,
    pub(super) render_passes: Vec<RenderPassHandle>,
    pub(super) clear_values: Vec<Vec<ClearValue>>,
    /// `[pass][frame]`
    pub(super) resources: Vec<Vec<RenderPassResources>>,
    pub(super) extent: Extent2D,
    /// Frame slots whose textures were moved into their initial layouts
    pub(super) primed_frames: Vec<bool>,
    pub(super) hold: ResourceHold,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self {
            state: BuildState::Empty,
            config: RenderGraphConfig::default(),
            passes: Vec::new(),
            output: None,
            inputs: Vec::new(),
            dependency_graph: DirectedGraph::new(),
            execution_order: Vec::new(),
            transitions: Vec::new(),
            end_layouts: Vec::new(),
            render_passes: Vec::new(),
            clear_values: Vec::new(),
            resources: Vec::new(),
            extent: Extent2D::default(),
            primed_frames: Vec::new(),
            hold: ResourceHold::new(),
        }
    }

    /// Start declaring a new graph.
    ///
    /// The resources of a built graph move into the resource hold, where they
    /// stay until every frame that may still use them has executed. An
    /// unfinished declaration is discarded.
    pub fn begin_building(&mut self, config: RenderGraphConfig) -> RenderGraphResult<()> {
        if config.max_frames_in_flight == 0 {
            return Err(RenderGraphError::InvalidFramesInFlight);
        }

        let hold_frames = self.config.max_frames_in_flight.max(config.max_frames_in_flight);
        let retired = self.take_build(hold_frames);
        self.hold.push(retired);

        self.reset();
        self.config = config;
        self.state = BuildState::Declaring;

        log::debug!(
            "{}: declaring render graph ({} frames in flight)",
            self.config.debug_name,
            self.config.max_frames_in_flight
        );
        Ok(())
    }

    /// Add a pass to the graph being declared
    pub fn add_pass(&mut self, pass: RenderGraphPass) -> RenderGraphResult<PassId> {
        self.expect_state(BuildState::Declaring, "add_pass")?;
        let id = PassId(self.passes.len());
        log::trace!("{}: added pass {} `{}`", self.config.debug_name, id.0, pass.name());
        self.passes.push(pass);
        Ok(id)
    }

    /// Find the id of a declared pass by structural equality
    pub fn find_pass(&self, pass: &RenderGraphPass) -> Option<PassId> {
        self.passes
            .iter()
            .position(|p| p == pass)
            .map(PassId)
    }

    /// Render `attachment` of `pass` into offscreen textures, one per frame in flight
    pub fn set_output_attachment(
        &mut self,
        pass: PassId,
        attachment: &str,
        targets: Vec<TextureHandle>,
    ) -> RenderGraphResult<()> {
        self.bind_output(pass, attachment, OutputTargets::Offscreen(targets))
    }

    /// Render `attachment` of `pass` into swapchain images, one per frame in flight
    pub fn set_swapchain_output_attachment(
        &mut self,
        pass: PassId,
        attachment: &str,
        targets: Vec<TextureHandle>,
    ) -> RenderGraphResult<()> {
        self.bind_output(pass, attachment, OutputTargets::Swapchain(targets))
    }

    /// Compile the declared graph and create its device resources.
    ///
    /// On failure the declaration is discarded, everything created so far is
    /// released and the graph is left [`BuildState::Empty`].
    pub fn end_building<D: RenderDevice>(&mut self, device: &mut D) -> RenderGraphResult<()> {
        self.expect_state(BuildState::Declaring, "end_building")?;

        match self.compile(device) {
            Ok(()) => {
                self.state = BuildState::Built;
                log::info!(
                    "{}: built render graph with {} passes ({} executed), {}x{}, {} frames in flight",
                    self.config.debug_name,
                    self.passes.len(),
                    self.execution_order.len(),
                    self.extent.width,
                    self.extent.height,
                    self.config.max_frames_in_flight
                );
                Ok(())
            }
            Err(err) => {
                log::error!("{}: failed to build render graph: {}", self.config.debug_name, err);
                // Nothing was submitted with these objects yet
                self.take_build(0).destroy(device);
                self.reset();
                Err(err)
            }
        }
    }

    /// Recreate per-frame resources for new offscreen targets
    pub fn resize_resources<D: RenderDevice>(
        &mut self,
        device: &mut D,
        targets: Vec<TextureHandle>,
    ) -> RenderGraphResult<()> {
        self.resize(device, OutputTargets::Offscreen(targets))
    }

    /// Recreate per-frame resources for a recreated swapchain
    pub fn resize_swapchain_resources<D: RenderDevice>(
        &mut self,
        device: &mut D,
        targets: Vec<TextureHandle>,
    ) -> RenderGraphResult<()> {
        self.resize(device, OutputTargets::Swapchain(targets))
    }

    /// Destroy every held generation now; the device must be idle
    pub fn clear_resource_hold<D: RenderDevice>(&mut self, device: &mut D) {
        self.hold.clear(device);
    }

    /// Destroy all device resources, held or current; the device must be idle
    pub fn destroy<D: RenderDevice>(&mut self, device: &mut D) {
        self.hold.clear(device);
        self.take_build(0).destroy(device);
        self.reset();
        log::debug!("{}: destroyed render graph", self.config.debug_name);
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn config(&self) -> &RenderGraphConfig {
        &self.config
    }

    pub fn frames_in_flight(&self) -> usize {
        self.config.max_frames_in_flight
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn pass(&self, id: PassId) -> Option<&RenderGraphPass> {
        self.passes.get(id.index())
    }

    /// Passes in the order they are recorded, ending with the output pass
    pub fn execution_order(&self) -> &[PassId] {
        &self.execution_order
    }

    /// Edges point from a consumer to the producer it waits for
    pub fn dependency_graph(&self) -> &DirectedGraph<PassId, PassId> {
        &self.dependency_graph
    }

    pub fn render_pass(&self, id: PassId) -> Option<RenderPassHandle> {
        self.render_passes.get(id.index()).copied()
    }

    /// Resources of a pass, one entry per frame in flight
    pub fn pass_resources(&self, id: PassId) -> Option<&[RenderPassResources]> {
        self.resources.get(id.index()).map(Vec::as_slice)
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn output_targets(&self) -> Option<&OutputTargets> {
        self.output.as_ref().map(|output| &output.targets)
    }

    /// Number of retired generations still waiting for in-flight frames
    pub fn held_generations(&self) -> usize {
        self.hold.len()
    }

    pub(super) fn expect_state(
        &self,
        expected: BuildState,
        operation: &'static str,
    ) -> RenderGraphResult<()> {
        if self.state != expected {
            return Err(RenderGraphError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn bind_output(
        &mut self,
        pass: PassId,
        attachment: &str,
        targets: OutputTargets,
    ) -> RenderGraphResult<()> {
        self.expect_state(BuildState::Declaring, "set_output_attachment")?;

        let declared = self
            .passes
            .get(pass.index())
            .ok_or(RenderGraphError::PassNotFound(pass.index()))?;
        let attachment_index = declared.get_local_attachment(attachment).ok_or_else(|| {
            RenderGraphError::AttachmentNotFound {
                pass: declared.name().to_string(),
                attachment: attachment.to_string(),
            }
        })?;
        if targets.len() != self.config.max_frames_in_flight {
            return Err(RenderGraphError::FrameCountMismatch {
                expected: self.config.max_frames_in_flight,
                actual: targets.len(),
            });
        }

        log::debug!(
            "{}: output is `{}`/`{}` ({} targets)",
            self.config.debug_name,
            declared.name(),
            attachment,
            targets.kind()
        );
        self.output = Some(OutputBinding {
            pass,
            attachment: attachment_index,
            targets,
            target_format: declared.attachments()[attachment_index.index()]
                .description
                .format,
            target_layouts: Vec::new(),
        });
        Ok(())
    }

    fn compile<D: RenderDevice>(&mut self, device: &mut D) -> RenderGraphResult<()> {
        self.bind_output_target(device)?;
        self.build_render_graph()?;
        self.solve_execution_order()?;
        self.compile_barriers();
        self.build_render_pass_objects(device)?;
        self.build_render_pass_resources(device)
    }

    /// Read the output target properties and override the output attachment with them
    fn bind_output_target<D: RenderDevice>(&mut self, device: &D) -> RenderGraphResult<()> {
        let output = self
            .output
            .as_ref()
            .ok_or(RenderGraphError::NoOutputAttachment)?;
        let (first, target_layouts) = self.inspect_targets(device, &output.targets)?;
        let (pass, attachment) = (output.pass, output.attachment);
        let is_swapchain = output.targets.is_swapchain();

        let local = self
            .passes
            .get_mut(pass.index())
            .and_then(|p| p.attachment_mut(attachment))
            .ok_or(RenderGraphError::PassNotFound(pass.index()))?;
        local.description.format = first.format;
        local.description.store_op = StoreOp::Store;
        local.description.initial_layout = first.layout;
        local.description.final_layout = if is_swapchain {
            ImageLayout::PresentSrc
        } else if first.layout != ImageLayout::Undefined {
            first.layout
        } else {
            local.optimal_layout
        };

        if let Some(output) = self.output.as_mut() {
            output.target_format = first.format;
            output.target_layouts = target_layouts;
        }
        self.extent = first.extent();
        Ok(())
    }

    /// Check that there is one live target per frame slot and that all of them
    /// match target 0 in format and extent.
    ///
    /// Returns the properties of target 0 and the current layout of every target.
    fn inspect_targets<D: RenderDevice>(
        &self,
        device: &D,
        targets: &OutputTargets,
    ) -> RenderGraphResult<(TextureInfo, Vec<ImageLayout>)> {
        let frames = self.config.max_frames_in_flight;
        if targets.len() != frames {
            return Err(RenderGraphError::FrameCountMismatch {
                expected: frames,
                actual: targets.len(),
            });
        }

        let infos = targets
            .textures()
            .iter()
            .map(|&texture| {
                device
                    .texture_info(texture)
                    .ok_or(RenderGraphError::Backend(BackendError::InvalidHandle(
                        "output target",
                    )))
            })
            .collect::<RenderGraphResult<Vec<_>>>()?;
        let Some(&first) = infos.first() else {
            return Err(RenderGraphError::FrameCountMismatch {
                expected: frames,
                actual: 0,
            });
        };

        for (frame, info) in infos.iter().enumerate().skip(1) {
            if info.format != first.format {
                return Err(RenderGraphError::OutputFormatChanged {
                    expected: format!("{:?}", first.format),
                    actual: format!("{:?} (frame {})", info.format, frame),
                });
            }
            if info.extent() != first.extent() {
                return Err(RenderGraphError::OutputExtentMismatch {
                    frame,
                    expected: first.extent(),
                    actual: info.extent(),
                });
            }
        }
        Ok((first, infos.iter().map(|info| info.layout).collect()))
    }

    /// Resolve every external attachment and add a consumer -> producer edge for it
    fn build_render_graph(&mut self) -> RenderGraphResult<()> {
        self.inputs = self
            .passes
            .iter()
            .map(|pass| {
                Ok(ResolvedInputs {
                    reads: self.resolve_inputs(pass.read_inputs())?,
                    writes: self.resolve_inputs(pass.write_inputs())?,
                })
            })
            .collect::<RenderGraphResult<Vec<_>>>()?;

        let mut graph = DirectedGraph::with_capacity(self.passes.len());
        for i in 0..self.passes.len() {
            graph.add_vertex(PassId(i));
        }
        for (consumer, inputs) in self.inputs.iter().enumerate() {
            for input in inputs.reads.iter().chain(&inputs.writes) {
                graph.add_edge(
                    VertexIndex(consumer),
                    VertexIndex(input.producer.index()),
                    input.producer,
                );
            }
        }

        log::debug!(
            "{}: dependency graph has {} passes and {} edges",
            self.config.debug_name,
            graph.vertex_count(),
            graph.edge_count()
        );
        self.dependency_graph = graph;
        Ok(())
    }

    /// Resolve external attachments by name; repeated references to the same
    /// attachment collapse into the first one
    fn resolve_inputs(
        &self,
        inputs: &[ExternalAttachment],
    ) -> RenderGraphResult<Vec<ResolvedInput>> {
        let mut resolved: Vec<ResolvedInput> = Vec::with_capacity(inputs.len());
        for input in inputs {
            let producer = self
                .passes
                .get(input.pass.index())
                .ok_or(RenderGraphError::PassNotFound(input.pass.index()))?;
            let attachment = producer.get_local_attachment(&input.name).ok_or_else(|| {
                RenderGraphError::AttachmentNotFound {
                    pass: producer.name().to_string(),
                    attachment: input.name.clone(),
                }
            })?;

            if resolved
                .iter()
                .any(|r| r.producer == input.pass && r.attachment == attachment)
            {
                log::debug!(
                    "{}: ignoring repeated input `{}`/`{}`",
                    self.config.debug_name,
                    producer.name(),
                    input.name
                );
                continue;
            }
            resolved.push(ResolvedInput {
                producer: input.pass,
                attachment,
                optimal_layout: input.optimal_layout,
                initial_layout: input.optimal_layout,
                final_layout: input.optimal_layout,
            });
        }
        Ok(resolved)
    }

    /// Post-order depth-first search from the output pass with an explicit stack
    fn solve_execution_order(&mut self) -> RenderGraphResult<()> {
        let root = self
            .output
            .as_ref()
            .map(|output| VertexIndex(output.pass.index()))
            .ok_or(RenderGraphError::NoOutputAttachment)?;

        let mut visit = vec![VisitState::Unvisited; self.dependency_graph.vertex_count()];
        let mut stack = vec![root];
        let mut order = Vec::with_capacity(self.passes.len());

        while let Some(vertex) = stack.pop() {
            match visit[vertex.index()] {
                VisitState::Finished => {}
                // Popped again after all of its dependencies
                VisitState::Discovered => {
                    visit[vertex.index()] = VisitState::Finished;
                    order.push(PassId(vertex.index()));
                }
                VisitState::Unvisited => {
                    visit[vertex.index()] = VisitState::Discovered;
                    stack.push(vertex);
                    // Reversed so dependencies run in declaration order
                    for edge in self.dependency_graph.edges(vertex).iter().rev() {
                        match visit[edge.target.index()] {
                            VisitState::Unvisited => stack.push(edge.target),
                            VisitState::Discovered => {
                                return Err(RenderGraphError::CycleDetected(
                                    self.passes[edge.target.index()].name().to_string(),
                                ));
                            }
                            VisitState::Finished => {}
                        }
                    }
                }
            }
        }

        for (i, state) in visit.iter().enumerate() {
            if *state != VisitState::Finished {
                log::warn!(
                    "{}: pass `{}` does not contribute to the output and is skipped",
                    self.config.debug_name,
                    self.passes[i].name()
                );
            }
        }

        log::debug!(
            "{}: execution order {:?}",
            self.config.debug_name,
            order.iter().map(|p| self.passes[p.index()].name()).collect::<Vec<_>>()
        );
        self.execution_order = order;
        Ok(())
    }

    /// Chain every produced attachment through its users in execution order.
    ///
    /// Each user leaves the attachment in the layout the next user expects. The
    /// producer and write inputs do so through their render pass final layouts.
    /// A read that needs another layout than the previous user left gets a
    /// transition recorded right before the reading pass.
    fn compile_barriers(&mut self) {
        let mut uses: Vec<Vec<Vec<AttachmentUse>>> = self
            .passes
            .iter()
            .map(|pass| vec![Vec::new(); pass.attachments().len()])
            .collect();
        for &consumer in &self.execution_order {
            let inputs = &self.inputs[consumer.index()];
            for (write, input) in inputs.writes.iter().enumerate() {
                uses[input.producer.index()][input.attachment.index()].push(AttachmentUse {
                    consumer,
                    layout: input.optimal_layout,
                    write: Some(write),
                });
            }
            for input in &inputs.reads {
                let chain = &mut uses[input.producer.index()][input.attachment.index()];
                // The pass also writes it and its render pass owns the layout
                if chain.last().is_some_and(|last| last.consumer == consumer) {
                    continue;
                }
                chain.push(AttachmentUse {
                    consumer,
                    layout: input.optimal_layout,
                    write: None,
                });
            }
        }

        self.transitions = vec![Vec::new(); self.passes.len()];
        self.end_layouts = Vec::with_capacity(self.passes.len());
        for (producer, attachments) in uses.iter().enumerate() {
            let mut end_layouts = Vec::with_capacity(attachments.len());
            for (index, chain) in attachments.iter().enumerate() {
                let attachment = AttachmentIndex(index);
                let Some(local) = self.passes[producer].attachment_mut(attachment) else {
                    end_layouts.push(ImageLayout::Undefined);
                    continue;
                };
                let Some(first) = chain.first() else {
                    end_layouts.push(local.description.final_layout);
                    continue;
                };

                let description = &mut local.description;
                description.store_op = StoreOp::Store;
                if description.format.has_stencil() {
                    description.stencil_store_op = StoreOp::Store;
                }
                if description.final_layout != first.layout {
                    log::debug!(
                        "{}: `{}` final layout {:?} -> {:?}",
                        self.config.debug_name,
                        local.name,
                        description.final_layout,
                        first.layout
                    );
                }
                description.final_layout = first.layout;

                let mut current = first.layout;
                for (i, user) in chain.iter().enumerate() {
                    match user.write {
                        Some(write) => {
                            let next = chain.get(i + 1).map_or(user.layout, |next| next.layout);
                            let input = &mut self.inputs[user.consumer.index()].writes[write];
                            input.initial_layout = current;
                            input.final_layout = next;
                            current = next;
                        }
                        None if current != user.layout => {
                            log::debug!(
                                "{}: `{}`/`{}` {:?} -> {:?} before `{}`",
                                self.config.debug_name,
                                self.passes[producer].name(),
                                self.passes[producer].attachments()[index].name,
                                current,
                                user.layout,
                                self.passes[user.consumer.index()].name()
                            );
                            self.transitions[user.consumer.index()].push(LayoutTransition {
                                producer: PassId(producer),
                                attachment,
                                old_layout: current,
                                new_layout: user.layout,
                            });
                            current = user.layout;
                        }
                        None => {}
                    }
                }
                end_layouts.push(current);
            }
            self.end_layouts.push(end_layouts);
        }

        // Skipped writers never run; their render passes just need valid layouts
        let mut executed = vec![false; self.passes.len()];
        for id in &self.execution_order {
            executed[id.index()] = true;
        }
        for (consumer, inputs) in self.inputs.iter_mut().enumerate() {
            if executed[consumer] {
                continue;
            }
            for input in &mut inputs.writes {
                let producer = &self.passes[input.producer.index()];
                if let Some(produced) = producer.attachment(input.attachment) {
                    input.initial_layout = produced.description.final_layout;
                }
                input.final_layout = input.optimal_layout;
            }
        }
    }

    fn build_render_pass_objects<D: RenderDevice>(&mut self, device: &mut D) -> RenderGraphResult<()> {
        self.render_passes.clear();
        self.clear_values.clear();

        for (index, pass) in self.passes.iter().enumerate() {
            let writes = &self.inputs[index].writes;
            let mut desc = RenderPassDescriptor::new(Some(format!(
                "{}/{}",
                self.config.debug_name,
                pass.name()
            )));
            let mut clear_values = Vec::with_capacity(pass.attachments().len() + writes.len());

            // Every attachment must be defined before subpass roles can reference it
            for attachment in pass.attachments() {
                desc.define_attachment(attachment.description.clone());
                clear_values.push(attachment.description.clear_value);
            }
            let mut write_indices = Vec::with_capacity(writes.len());
            for write in writes {
                let produced = &self.passes[write.producer.index()].attachments()
                    [write.attachment.index()]
                .description;
                let stencil_load_op = if produced.format.has_stencil() {
                    LoadOp::Load
                } else {
                    LoadOp::DontCare
                };
                write_indices.push(desc.define_attachment(AttachmentDescription {
                    load_op: LoadOp::Load,
                    store_op: StoreOp::Store,
                    stencil_load_op,
                    stencil_store_op: produced.stencil_store_op,
                    initial_layout: write.initial_layout,
                    final_layout: write.final_layout,
                    ..produced.clone()
                }));
                clear_values.push(produced.clear_value);
            }

            let multiple_depth =
                || RenderGraphError::MultipleDepthStencilAttachments(pass.name().to_string());
            let mut has_depth = false;

            desc.begin_subpass();
            for &color in pass.color_attachments() {
                desc.add_color_attachment(
                    color.index() as u32,
                    pass.attachments()[color.index()].optimal_layout,
                )?;
            }
            for &depth in pass.depth_stencil_attachments() {
                if has_depth {
                    return Err(multiple_depth());
                }
                has_depth = true;
                desc.set_depth_stencil_attachment(
                    depth.index() as u32,
                    pass.attachments()[depth.index()].optimal_layout,
                )?;
            }
            for &resolve in pass.resolve_attachments() {
                desc.add_resolve_attachment(
                    resolve.index() as u32,
                    pass.attachments()[resolve.index()].optimal_layout,
                )?;
            }
            for (write, &index) in writes.iter().zip(&write_indices) {
                let format = self.passes[write.producer.index()].attachments()
                    [write.attachment.index()]
                .description
                .format;
                if format.is_depth() {
                    if has_depth {
                        return Err(multiple_depth());
                    }
                    has_depth = true;
                    desc.set_depth_stencil_attachment(index, write.optimal_layout)?;
                } else {
                    desc.add_color_attachment(index, write.optimal_layout)?;
                }
            }

            let render_pass = device.create_render_pass(&desc)?;
            log::trace!(
                "{}: created render pass for `{}` with {} attachments",
                self.config.debug_name,
                pass.name(),
                desc.attachments().len()
            );
            self.render_passes.push(render_pass);
            self.clear_values.push(clear_values);
        }
        Ok(())
    }

    /// Create textures, framebuffers and read descriptor sets for every pass and frame slot
    pub(super) fn build_render_pass_resources<D: RenderDevice>(
        &mut self,
        device: &mut D,
    ) -> RenderGraphResult<()> {
        let mut pending = PendingResources::default();
        match self.create_render_pass_resources(device, &mut pending) {
            Ok(resources) => {
                self.resources = resources;
                self.primed_frames = vec![false; self.config.max_frames_in_flight];
                Ok(())
            }
            Err(err) => {
                pending.destroy(device);
                Err(err)
            }
        }
    }

    fn create_render_pass_resources<D: RenderDevice>(
        &self,
        device: &mut D,
        pending: &mut PendingResources,
    ) -> RenderGraphResult<Vec<Vec<RenderPassResources>>> {
        let frames = self.config.max_frames_in_flight;
        let output = self
            .output
            .as_ref()
            .ok_or(RenderGraphError::NoOutputAttachment)?;

        let sampled: HashSet<(PassId, AttachmentIndex)> = self
            .inputs
            .iter()
            .flat_map(|inputs| inputs.reads.iter())
            .map(|input| (input.producer, input.attachment))
            .collect();

        // Textures of all passes first, write inputs reference other passes' textures
        let mut textures: Vec<Vec<Vec<TextureHandle>>> = Vec::with_capacity(self.passes.len());
        for (index, pass) in self.passes.iter().enumerate() {
            let pass_id = PassId(index);
            let mut per_frame = Vec::with_capacity(frames);
            for frame in 0..frames {
                let mut frame_textures = Vec::with_capacity(pass.attachments().len());
                for (i, attachment) in pass.attachments().iter().enumerate() {
                    let attachment_index = AttachmentIndex(i);
                    if output.pass == pass_id && output.attachment == attachment_index {
                        frame_textures.push(output.targets.textures()[frame]);
                        continue;
                    }

                    let description = &attachment.description;
                    let mut usage = description.usage;
                    usage |= if description.format.is_depth() {
                        TextureUsage::DEPTH_STENCIL_ATTACHMENT
                    } else {
                        TextureUsage::COLOR_ATTACHMENT
                    };
                    if sampled.contains(&(pass_id, attachment_index)) {
                        usage |= TextureUsage::SAMPLED;
                    }

                    let texture = device.create_texture(&TextureDescriptor {
                        label: Some(self.label(pass, &attachment.name, frame)),
                        width: self.extent.width,
                        height: self.extent.height,
                        mip_levels: 1,
                        format: description.format,
                        usage,
                    })?;
                    pending.textures.push(texture);
                    frame_textures.push(texture);
                }
                per_frame.push(frame_textures);
            }
            textures.push(per_frame);
        }

        let mut resources = Vec::with_capacity(self.passes.len());
        for (index, pass) in self.passes.iter().enumerate() {
            let inputs = &self.inputs[index];
            let mut per_frame = Vec::with_capacity(frames);
            for frame in 0..frames {
                let local = &textures[index][frame];
                let producer_texture = |input: &ResolvedInput| {
                    textures[input.producer.index()][frame][input.attachment.index()]
                };

                let mut attachments = local.clone();
                attachments.extend(inputs.writes.iter().map(producer_texture));

                let framebuffer = device.create_framebuffer(&FramebufferDescriptor {
                    label: Some(self.label(pass, "framebuffer", frame)),
                    render_pass: self.render_passes[index],
                    width: self.extent.width,
                    height: self.extent.height,
                    attachments,
                })?;
                pending.framebuffers.push(framebuffer);

                let read_descriptor_set = if inputs.reads.is_empty() {
                    None
                } else {
                    let mut desc =
                        DescriptorSetDescriptor::new(Some(self.label(pass, "reads", frame)));
                    for input in &inputs.reads {
                        desc.add_image_sampler(
                            producer_texture(input),
                            input.optimal_layout,
                            self.config.read_attachment_stage,
                        );
                    }
                    let descriptor_set = device.create_descriptor_set(&desc)?;
                    pending.descriptor_sets.push(descriptor_set);
                    Some(descriptor_set)
                };

                let borrowed_attachment =
                    (output.pass.index() == index).then_some(output.attachment);
                per_frame.push(RenderPassResources {
                    attachment_textures: local.clone(),
                    framebuffer,
                    read_descriptor_set,
                    borrowed_attachment,
                });
            }
            resources.push(per_frame);
        }

        log::debug!(
            "{}: created {} textures, {} framebuffers and {} descriptor sets",
            self.config.debug_name,
            pending.textures.len(),
            pending.framebuffers.len(),
            pending.descriptor_sets.len()
        );
        Ok(resources)
    }

    fn resize<D: RenderDevice>(
        &mut self,
        device: &mut D,
        targets: OutputTargets,
    ) -> RenderGraphResult<()> {
        self.expect_state(BuildState::Built, "resize_resources")?;

        let output = self
            .output
            .as_ref()
            .ok_or(RenderGraphError::NoOutputAttachment)?;
        let (info, target_layouts) = self.inspect_targets(device, &targets)?;
        if info.format != output.target_format
            || targets.is_swapchain() != output.targets.is_swapchain()
        {
            return Err(RenderGraphError::OutputFormatChanged {
                expected: format!("{} {:?}", output.targets.kind(), output.target_format),
                actual: format!("{} {:?}", targets.kind(), info.format),
            });
        }

        let frames = self.config.max_frames_in_flight;
        let retired = std::mem::take(&mut self.resources);
        self.hold.push(ResourceGeneration {
            render_passes: Vec::new(),
            resources: retired,
            frames_remaining: frames,
        });

        // The priming barrier moves each new target into the layout the render pass expects
        if let Some(output) = self.output.as_mut() {
            output.targets = targets;
            output.target_layouts = target_layouts;
        }
        self.extent = info.extent();

        if let Err(err) = self.build_render_pass_resources(device) {
            log::error!("{}: failed to resize render graph: {}", self.config.debug_name, err);
            // Render passes may still be referenced by in-flight frames
            let retired = self.take_build(frames);
            self.hold.push(retired);
            self.reset();
            return Err(err);
        }

        log::info!(
            "{}: resized render graph to {}x{}",
            self.config.debug_name,
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    fn label(&self, pass: &RenderGraphPass, name: &str, frame: usize) -> String {
        format!("{}/{}/{}#{}", self.config.debug_name, pass.name(), name, frame)
    }

    /// Move the device objects of the current build out of the graph
    fn take_build(&mut self, frames_remaining: usize) -> ResourceGeneration {
        self.primed_frames.clear();
        ResourceGeneration {
            render_passes: std::mem::take(&mut self.render_passes),
            resources: std::mem::take(&mut self.resources),
            frames_remaining,
        }
    }

    fn reset(&mut self) {
        self.state = BuildState::Empty;
        self.passes.clear();
        self.output = None;
        self.inputs.clear();
        self.dependency_graph.clear();
        self.execution_order.clear();
        self.transitions.clear();
        self.end_layouts.clear();
        self.render_passes.clear();
        self.clear_values.clear();
        self.resources.clear();
        self.primed_frames.clear();
        self.extent = Extent2D::default();
    }
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        if !self.render_passes.is_empty() || !self.resources.is_empty() || !self.hold.is_empty() {
            log::warn!(
                "{}: dropped with live device resources; call destroy() first",
                self.config.debug_name
            );
        }
    }
}
