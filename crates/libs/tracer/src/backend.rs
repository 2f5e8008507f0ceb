//! Device seam of the pipeline.
//!
//! Creation calls return immediately usable objects. `cmd_*` calls record
//! into the single open command batch, which only executes on [`Backend::flush`].

use crate::{Error, Result};

/// Tracked usage state of a buffer or image.
///
/// Every transition is explicit: a `cmd_*_barrier` names the state the
/// resource is in and the state it moves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Contents are undefined. Images start here.
    Undefined,
    /// Buffers start here.
    Common,
    CopySource,
    CopyDest,
    /// Read only access from shaders and acceleration structure builds.
    ShaderResource,
    UnorderedAccess,
    Uniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Host visible, source of copies.
    Staging,
    /// Device local storage.
    Device { unordered_access: bool },
    /// Host visible uniform data.
    Constants,
    /// Device local uniform data, written in-stream.
    DeviceConstants,
    /// Host visible acceleration structure build input.
    Instances,
    /// Device local acceleration structure build scratch.
    Scratch,
    /// Host visible, destination of copies.
    Readback,
}

impl BufferKind {
    pub fn is_host_visible(self) -> bool {
        matches!(
            self,
            BufferKind::Staging | BufferKind::Constants | BufferKind::Instances | BufferKind::Readback
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub kind: BufferKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Rgba32Float,
    Rgba8Unorm,
}

impl ImageFormat {
    pub fn bytes_per_texel(self) -> u64 {
        match self {
            ImageFormat::Rgba32Float => 16,
            ImageFormat::Rgba8Unorm => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidScene(format!(
                "render extent {width}x{height} is empty"
            )));
        }

        Ok(Self { width, height })
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub extent: Extent,
    pub format: ImageFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationLevel {
    Bottom,
    Top,
}

/// One indexed triangle list read by a bottom level build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: u64,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub index_address: u64,
    pub index_count: u32,
}

impl TriangleGeometry {
    pub fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildInputs<'a> {
    Triangles(&'a [TriangleGeometry]),
    Instances { address: u64, count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildDesc<'a> {
    pub inputs: BuildInputs<'a>,
    pub allow_update: bool,
}

impl<'a> BuildDesc<'a> {
    pub fn level(&self) -> AccelerationLevel {
        match self.inputs {
            BuildInputs::Triangles(_) => AccelerationLevel::Bottom,
            BuildInputs::Instances { .. } => AccelerationLevel::Top,
        }
    }

    /// Triangles for a bottom level build, instances for a top level one.
    pub fn primitive_count(&self) -> u64 {
        match self.inputs {
            BuildInputs::Triangles(geometries) => geometries
                .iter()
                .map(|g| g.primitive_count() as u64)
                .sum(),
            BuildInputs::Instances { count, .. } => count as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub result: u64,
    pub scratch: u64,
    pub update_scratch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Build,
    /// In-place refit of a structure built with `allow_update`.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    StorageImage,
    StorageBuffer,
    UniformBuffer,
    AccelerationStructure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub name: &'static str,
    pub kind: SlotKind,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    RayTracing,
    Compute,
}

/// Slot layout of a binding table.
///
/// Slots are numbered consecutively across ranges, in range order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub visibility: PipelineKind,
    pub ranges: Vec<SlotRange>,
}

impl TableLayout {
    pub fn slot_count(&self) -> u32 {
        self.ranges.iter().map(|r| r.count).sum()
    }

    /// Range index and element within the range of a flat slot number.
    pub fn locate(&self, slot: u32) -> Option<(u32, u32)> {
        let mut first = 0;
        for (index, range) in self.ranges.iter().enumerate() {
            if slot < first + range.count {
                return Some((index as u32, slot - first));
            }
            first += range.count;
        }
        None
    }

    pub fn slot_kind(&self, slot: u32) -> Option<SlotKind> {
        self.locate(slot)
            .map(|(range, _)| self.ranges[range as usize].kind)
    }

    /// Checks that `kind` may be written at `slot`.
    pub fn check(&self, slot: u32, kind: SlotKind) -> Result<(u32, u32)> {
        let (range, element) = self.locate(slot).ok_or_else(|| {
            Error::State(format!(
                "slot {slot} is outside a table of {} slots",
                self.slot_count()
            ))
        })?;

        let expected = self.ranges[range as usize].kind;
        if expected != kind {
            return Err(Error::State(format!(
                "slot {slot} ({}) holds {expected:?}, not {kind:?}",
                self.ranges[range as usize].name
            )));
        }

        Ok((range, element))
    }
}

/// A resource view written into a binding table slot.
pub enum BindingView<'a, B: Backend + ?Sized> {
    StorageImage(&'a B::Image),
    StorageBuffer(&'a B::Buffer),
    UniformBuffer(&'a B::Buffer),
    AccelerationStructure(&'a B::AccelerationStructure),
}

impl<'a, B: Backend + ?Sized> BindingView<'a, B> {
    pub fn kind(&self) -> SlotKind {
        match self {
            BindingView::StorageImage(_) => SlotKind::StorageImage,
            BindingView::StorageBuffer(_) => SlotKind::StorageBuffer,
            BindingView::UniformBuffer(_) => SlotKind::UniformBuffer,
            BindingView::AccelerationStructure(_) => SlotKind::AccelerationStructure,
        }
    }
}

/// SPIR-V bytecode of the four shader programs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderSet {
    pub raygen: Vec<u8>,
    pub miss: Vec<u8>,
    pub closest_hit: Vec<u8>,
    pub post_process: Vec<u8>,
}

pub trait Backend {
    type Buffer;
    type Image;
    type AccelerationStructure;
    type BindingTable;
    type Pipeline;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<Self::Buffer>;

    /// Writes host visible memory. Visible to every batch flushed afterwards.
    fn write_buffer(&mut self, buffer: &mut Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Reads host visible memory.
    fn read_buffer(&self, buffer: &Self::Buffer) -> Result<Vec<u8>>;

    fn buffer_address(&self, buffer: &Self::Buffer) -> u64;

    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;

    fn create_image(&mut self, desc: &ImageDesc) -> Result<Self::Image>;

    fn acceleration_structure_sizes(&self, desc: &BuildDesc) -> Result<BuildSizes>;

    fn create_acceleration_structure(
        &mut self,
        level: AccelerationLevel,
        size: u64,
    ) -> Result<Self::AccelerationStructure>;

    fn acceleration_structure_address(&self, structure: &Self::AccelerationStructure) -> u64;

    fn create_binding_table(&mut self, layout: &TableLayout) -> Result<Self::BindingTable>;

    fn write_binding(
        &mut self,
        table: &mut Self::BindingTable,
        slot: u32,
        view: BindingView<'_, Self>,
    ) -> Result<()>;

    fn create_pipeline(
        &mut self,
        kind: PipelineKind,
        shaders: &ShaderSet,
        table: &Self::BindingTable,
    ) -> Result<Self::Pipeline>;

    fn cmd_buffer_barrier(
        &mut self,
        buffer: &Self::Buffer,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()>;

    fn cmd_image_barrier(
        &mut self,
        image: &Self::Image,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()>;

    fn cmd_copy_buffer(&mut self, src: &Self::Buffer, dst: &Self::Buffer, size: u64)
        -> Result<()>;

    /// In-stream write, ordered with the surrounding commands.
    fn cmd_update_buffer(&mut self, dst: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// The image must be in [`ResourceState::CopyDest`].
    fn cmd_clear_image(&mut self, image: &Self::Image, color: [f32; 4]) -> Result<()>;

    /// The image must be in [`ResourceState::CopySource`].
    fn cmd_copy_image_to_buffer(&mut self, image: &Self::Image, dst: &Self::Buffer) -> Result<()>;

    fn cmd_build_acceleration_structure(
        &mut self,
        desc: &BuildDesc,
        dst: &Self::AccelerationStructure,
        scratch: &Self::Buffer,
        mode: BuildMode,
    ) -> Result<()>;

    fn cmd_bind_pipeline(
        &mut self,
        pipeline: &Self::Pipeline,
        table: &Self::BindingTable,
    ) -> Result<()>;

    fn cmd_trace_rays(&mut self, pipeline: &Self::Pipeline, width: u32, height: u32)
        -> Result<()>;

    fn cmd_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()>;

    /// Submits the open batch, blocks until it completes and opens a new one.
    /// Returns the fence value the batch signalled.
    fn flush(&mut self) -> Result<u64>;

    fn completed_fence_value(&self) -> Result<u64>;

    /// Fence value the open batch will signal.
    fn pending_fence_value(&self) -> u64;

    /// Drops everything recorded since the last flush.
    fn discard_commands(&mut self) -> Result<()>;
}
