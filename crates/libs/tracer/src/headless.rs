//! Software device.
//!
//! Commands are recorded and executed in order on [`Backend::flush`], with
//! every resource state transition validated against the tracked state.
//! The two shader programs are replaced by small CPU stand-ins so a
//! headless render still produces a recognisable image.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use bytemuck::pod_read_unaligned;
use glam::{Mat4, Vec3, Vec4};

use crate::{
    backend::{
        AccelerationLevel, Backend, BindingView, BufferDesc, BufferKind, BuildDesc, BuildMode,
        BuildSizes, Extent, ImageDesc, ImageFormat, PipelineKind, ResourceState, ShaderSet,
        SlotKind, TableLayout,
    },
    post::WORKGROUP_SIZE,
    uniforms::{CameraUniform, ToneMappingParams, STAGE_REDUCE_LUMINANCE, STAGE_TONE_MAP},
    Error, Result,
};

const ADDRESS_ALIGNMENT: u64 = 256;
const MAX_UPDATE_BYTES: usize = 65536;
const LUMINANCE: Vec3 = Vec3::new(0.2126, 0.7152, 0.0722);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub submissions: u64,
    pub buffers_created: u64,
    pub blas_builds: u64,
    pub tlas_builds: u64,
    pub tlas_updates: u64,
    pub trace_dispatches: u64,
    pub compute_dispatches: u64,
    pub image_clears: u64,
    pub binding_tables: u64,
    pub pipelines: u64,
}

struct BufferData {
    name: String,
    kind: BufferKind,
    state: ResourceState,
    address: u64,
    bytes: Vec<u8>,
}

struct ImageData {
    name: String,
    format: ImageFormat,
    extent: Extent,
    state: ResourceState,
    texels: Vec<Vec4>,
    /// Trace dispatches written since the last clear.
    samples: u32,
}

struct StructureData {
    level: AccelerationLevel,
    size: u64,
    address: u64,
    built: Option<BuiltState>,
}

#[derive(Clone, Copy)]
struct BuiltState {
    primitive_count: u64,
    allow_update: bool,
}

pub struct HeadlessBuffer(Rc<RefCell<BufferData>>);
pub struct HeadlessImage(Rc<RefCell<ImageData>>);
pub struct HeadlessStructure(Rc<RefCell<StructureData>>);

#[derive(Clone)]
enum Slot {
    Buffer(Weak<RefCell<BufferData>>),
    Image(Weak<RefCell<ImageData>>),
    Structure(Weak<RefCell<StructureData>>),
}

pub struct HeadlessTable {
    layout: TableLayout,
    slots: Vec<Option<Slot>>,
}

pub struct HeadlessPipeline {
    kind: PipelineKind,
    layout: TableLayout,
}

enum Command {
    BufferBarrier {
        buffer: Weak<RefCell<BufferData>>,
        before: ResourceState,
        after: ResourceState,
    },
    ImageBarrier {
        image: Weak<RefCell<ImageData>>,
        before: ResourceState,
        after: ResourceState,
    },
    CopyBuffer {
        src: Weak<RefCell<BufferData>>,
        dst: Weak<RefCell<BufferData>>,
        size: u64,
    },
    UpdateBuffer {
        dst: Weak<RefCell<BufferData>>,
        offset: u64,
        data: Vec<u8>,
    },
    ClearImage {
        image: Weak<RefCell<ImageData>>,
        color: [f32; 4],
    },
    CopyImageToBuffer {
        image: Weak<RefCell<ImageData>>,
        dst: Weak<RefCell<BufferData>>,
    },
    Build {
        level: AccelerationLevel,
        primitive_count: u64,
        allow_update: bool,
        required: BuildSizes,
        dst: Weak<RefCell<StructureData>>,
        scratch: Weak<RefCell<BufferData>>,
        mode: BuildMode,
    },
    Bind {
        kind: PipelineKind,
        slots: Vec<Option<Slot>>,
    },
    TraceRays {
        width: u32,
        height: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

#[derive(Default)]
pub struct Headless {
    recorded: Vec<Command>,
    fence: u64,
    next_address: u64,
    buffers: Vec<(BufferKind, Weak<RefCell<BufferData>>)>,
    stats: HeadlessStats,
    /// Flushes left to succeed before one fails.
    failing_flush: Option<u32>,
    fail_next_allocation: bool,
}

impl Headless {
    pub fn new() -> Self {
        Self {
            next_address: 0x1000,
            ..Default::default()
        }
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    /// Commands recorded since the last flush.
    pub fn recorded_commands(&self) -> usize {
        self.recorded.len()
    }

    pub fn live_buffers(&self, kind: BufferKind) -> usize {
        self.buffers
            .iter()
            .filter(|(k, b)| *k == kind && b.strong_count() > 0)
            .count()
    }

    /// Makes the next flush fail as a lost device would.
    pub fn fail_next_flush(&mut self) {
        self.fail_flush_after(0);
    }

    /// Lets `successes` flushes through, then fails the one after.
    pub fn fail_flush_after(&mut self, successes: u32) {
        self.failing_flush = Some(successes);
    }

    /// Makes the next buffer, image or structure creation fail.
    pub fn fail_next_allocation(&mut self) {
        self.fail_next_allocation = true;
    }

    pub fn buffer_state(&self, buffer: &HeadlessBuffer) -> ResourceState {
        buffer.0.borrow().state
    }

    pub fn image_state(&self, image: &HeadlessImage) -> ResourceState {
        image.0.borrow().state
    }

    /// Trace dispatches accumulated into the image since its last clear.
    pub fn image_samples(&self, image: &HeadlessImage) -> u32 {
        image.0.borrow().samples
    }

    fn allocate(&mut self, what: &str, size: u64) -> Result<u64> {
        if std::mem::take(&mut self.fail_next_allocation) {
            return Err(Error::device(
                format!("allocating {what}"),
                anyhow::anyhow!("out of device memory"),
            ));
        }

        let address = self.next_address;
        let span = size.max(1).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        self.next_address += span;

        Ok(address)
    }

    fn execute(&mut self, commands: Vec<Command>) -> Result<()> {
        let mut bound: Option<(PipelineKind, Vec<Option<Slot>>)> = None;

        for command in commands {
            match command {
                Command::BufferBarrier {
                    buffer,
                    before,
                    after,
                } => {
                    let buffer = upgrade(&buffer, "buffer barrier")?;
                    let mut buffer = buffer.borrow_mut();
                    expect_state(&buffer.name, buffer.state, &[before])?;
                    if after == ResourceState::UnorderedAccess
                        && buffer.kind != (BufferKind::Device {
                            unordered_access: true,
                        })
                    {
                        return Err(Error::State(format!(
                            "{} was not created for unordered access",
                            buffer.name
                        )));
                    }
                    buffer.state = after;
                }
                Command::ImageBarrier {
                    image,
                    before,
                    after,
                } => {
                    let image = upgrade(&image, "image barrier")?;
                    let mut image = image.borrow_mut();
                    // Leaving the undefined state is legal from anywhere
                    if before != ResourceState::Undefined {
                        expect_state(&image.name, image.state, &[before])?;
                    }
                    image.state = after;
                }
                Command::CopyBuffer { src, dst, size } => {
                    let src = upgrade(&src, "buffer copy")?;
                    let dst = upgrade(&dst, "buffer copy")?;
                    if Rc::ptr_eq(&src, &dst) {
                        return Err(Error::State("buffer copied onto itself".to_owned()));
                    }
                    let src = src.borrow();
                    let mut dst = dst.borrow_mut();
                    expect_copy_state(&src, ResourceState::CopySource)?;
                    expect_copy_state(&dst, ResourceState::CopyDest)?;

                    let size = size as usize;
                    if size > src.bytes.len() || size > dst.bytes.len() {
                        return Err(Error::State(format!(
                            "copy of {size} bytes from {} into {} is out of bounds",
                            src.name, dst.name
                        )));
                    }
                    dst.bytes[..size].copy_from_slice(&src.bytes[..size]);
                }
                Command::UpdateBuffer { dst, offset, data } => {
                    let dst = upgrade(&dst, "buffer update")?;
                    let mut dst = dst.borrow_mut();
                    expect_state(&dst.name, dst.state, &[ResourceState::CopyDest])?;

                    let start = offset as usize;
                    let end = start + data.len();
                    if data.len() > MAX_UPDATE_BYTES || data.len() % 4 != 0 || end > dst.bytes.len()
                    {
                        return Err(Error::State(format!(
                            "in-stream update of {} bytes at {} into {} is malformed",
                            data.len(),
                            offset,
                            dst.name
                        )));
                    }
                    dst.bytes[start..end].copy_from_slice(&data);
                }
                Command::ClearImage { image, color } => {
                    let image = upgrade(&image, "image clear")?;
                    let mut image = image.borrow_mut();
                    expect_state(&image.name, image.state, &[ResourceState::CopyDest])?;
                    image.texels.fill(Vec4::from(color));
                    image.samples = 0;
                    self.stats.image_clears += 1;
                }
                Command::CopyImageToBuffer { image, dst } => {
                    let image = upgrade(&image, "image readback")?;
                    let dst = upgrade(&dst, "image readback")?;
                    let image = image.borrow();
                    let mut dst = dst.borrow_mut();
                    expect_state(&image.name, image.state, &[ResourceState::CopySource])?;
                    expect_copy_state(&dst, ResourceState::CopyDest)?;

                    let bytes = encode_texels(&image);
                    if bytes.len() > dst.bytes.len() {
                        return Err(Error::State(format!(
                            "{} is too small to hold {}",
                            dst.name, image.name
                        )));
                    }
                    dst.bytes[..bytes.len()].copy_from_slice(&bytes);
                }
                Command::Build {
                    level,
                    primitive_count,
                    allow_update,
                    required,
                    dst,
                    scratch,
                    mode,
                } => {
                    let dst = upgrade(&dst, "acceleration structure build")?;
                    let scratch = upgrade(&scratch, "acceleration structure build")?;
                    let mut dst = dst.borrow_mut();
                    let scratch = scratch.borrow();

                    let needed = match mode {
                        BuildMode::Build => required.scratch,
                        BuildMode::Update => required.update_scratch,
                    };
                    if scratch.kind != BufferKind::Scratch || (scratch.bytes.len() as u64) < needed
                    {
                        return Err(Error::State(format!(
                            "{} cannot serve as {needed} bytes of build scratch",
                            scratch.name
                        )));
                    }
                    if dst.level != level || dst.size < required.result {
                        return Err(Error::State(format!(
                            "structure of {} bytes cannot hold a {level:?} build of {} bytes",
                            dst.size, required.result
                        )));
                    }
                    if mode == BuildMode::Update {
                        match dst.built {
                            Some(built)
                                if built.allow_update && built.primitive_count == primitive_count => {}
                            _ => {
                                return Err(Error::State(
                                    "refit of a structure that was not built for update".to_owned(),
                                ))
                            }
                        }
                    }

                    dst.built = Some(BuiltState {
                        primitive_count,
                        allow_update,
                    });
                    match (level, mode) {
                        (AccelerationLevel::Bottom, _) => self.stats.blas_builds += 1,
                        (AccelerationLevel::Top, BuildMode::Build) => self.stats.tlas_builds += 1,
                        (AccelerationLevel::Top, BuildMode::Update) => self.stats.tlas_updates += 1,
                    }
                }
                Command::Bind { kind, slots } => bound = Some((kind, slots)),
                Command::TraceRays { width, height } => {
                    let slots = bound_slots(&bound, PipelineKind::RayTracing)?;
                    trace_stand_in(slots, width, height)?;
                    self.stats.trace_dispatches += 1;
                }
                Command::Dispatch { x, y, z } => {
                    let slots = bound_slots(&bound, PipelineKind::Compute)?;
                    post_process_stand_in(slots, x, y, z)?;
                    self.stats.compute_dispatches += 1;
                }
            }
        }

        Ok(())
    }
}

fn upgrade<T>(resource: &Weak<T>, command: &str) -> Result<Rc<T>> {
    resource
        .upgrade()
        .ok_or_else(|| Error::State(format!("{command} recorded against a released resource")))
}

fn expect_state(name: &str, actual: ResourceState, allowed: &[ResourceState]) -> Result<()> {
    if allowed.contains(&actual) {
        Ok(())
    } else {
        Err(Error::State(format!(
            "{name} is {actual:?}, expected one of {allowed:?}"
        )))
    }
}

/// Host visible buffers are always addressable by copies.
fn expect_copy_state(buffer: &BufferData, state: ResourceState) -> Result<()> {
    if buffer.kind.is_host_visible() {
        Ok(())
    } else {
        expect_state(&buffer.name, buffer.state, &[state])
    }
}

fn encode_texels(image: &ImageData) -> Vec<u8> {
    match image.format {
        ImageFormat::Rgba32Float => bytemuck::cast_slice(&image.texels).to_vec(),
        ImageFormat::Rgba8Unorm => image
            .texels
            .iter()
            .flat_map(|t| t.to_array().map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect(),
    }
}

fn bound_slots(
    bound: &Option<(PipelineKind, Vec<Option<Slot>>)>,
    kind: PipelineKind,
) -> Result<&[Option<Slot>]> {
    match bound {
        Some((bound_kind, slots)) if *bound_kind == kind => Ok(slots),
        _ => Err(Error::State(format!("no {kind:?} pipeline bound"))),
    }
}

/// Live resources behind a bound table, grouped by kind in slot order.
#[derive(Default)]
struct BoundResources {
    images: Vec<Rc<RefCell<ImageData>>>,
    buffers: Vec<Rc<RefCell<BufferData>>>,
    uniforms: Vec<Rc<RefCell<BufferData>>>,
}

fn gather(slots: &[Option<Slot>]) -> Result<BoundResources> {
    let mut resources = BoundResources::default();

    for (index, slot) in slots.iter().enumerate() {
        match slot {
            None => return Err(Error::State(format!("slot {index} was never written"))),
            Some(Slot::Image(image)) => {
                let image = upgrade(image, "dispatch")?;
                if matches!(
                    image.borrow().state,
                    ResourceState::Undefined | ResourceState::CopySource | ResourceState::CopyDest
                ) {
                    return Err(Error::State(format!(
                        "{} is bound while {:?}",
                        image.borrow().name,
                        image.borrow().state
                    )));
                }
                resources.images.push(image);
            }
            Some(Slot::Buffer(buffer)) => {
                let buffer = upgrade(buffer, "dispatch")?;
                let (kind, state) = (buffer.borrow().kind, buffer.borrow().state);
                if !kind.is_host_visible() && state == ResourceState::CopyDest {
                    return Err(Error::State(format!(
                        "{} is read before leaving the copy destination state",
                        buffer.borrow().name
                    )));
                }
                if matches!(kind, BufferKind::Constants | BufferKind::DeviceConstants) {
                    resources.uniforms.push(buffer);
                } else {
                    resources.buffers.push(buffer);
                }
            }
            Some(Slot::Structure(structure)) => {
                let structure = upgrade(structure, "dispatch")?;
                if structure.borrow().built.is_none() {
                    return Err(Error::State(
                        "acceleration structure is bound before being built".to_owned(),
                    ));
                }
            }
        }
    }

    Ok(resources)
}

/// Adds one sky gradient sample per pixel along the camera ray.
fn trace_stand_in(slots: &[Option<Slot>], width: u32, height: u32) -> Result<()> {
    let resources = gather(slots)?;
    let (Some(target), Some(camera)) = (resources.images.first(), resources.uniforms.first())
    else {
        return Err(Error::State(
            "ray tracing table lacks an image or camera uniform".to_owned(),
        ));
    };

    let camera: CameraUniform = read_uniform(&camera.borrow())?;
    let inverse = Mat4::from_cols_array_2d(&camera.inverse_view_projection);
    let brightness = if camera.sky != 0 {
        camera.sky_brightness
    } else {
        0.25
    };

    let mut target = target.borrow_mut();
    expect_state(&target.name, target.state, &[ResourceState::UnorderedAccess])?;
    if width > target.extent.width || height > target.extent.height {
        return Err(Error::State(format!(
            "trace of {width}x{height} overruns {}",
            target.name
        )));
    }

    let row = target.extent.width as usize;
    for y in 0..height {
        for x in 0..width {
            let ndc_x = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
            let ndc_y = (y as f32 + 0.5) / height as f32 * 2.0 - 1.0;
            let near = inverse.project_point3(Vec3::new(ndc_x, ndc_y, 0.0));
            let far = inverse.project_point3(Vec3::new(ndc_x, ndc_y, 1.0));
            let direction = (far - near).normalize_or_zero();

            let t = 0.5 * (direction.y + 1.0);
            let sky = Vec3::ONE.lerp(Vec3::new(0.5, 0.7, 1.0), t) * brightness;
            target.texels[x as usize + y as usize * row] += sky.extend(1.0);
        }
    }
    target.samples += 1;

    Ok(())
}

/// Stage 0 reduces the maximum luminance, stage 1 tone maps into the target.
fn post_process_stand_in(slots: &[Option<Slot>], x: u32, y: u32, z: u32) -> Result<()> {
    let resources = gather(slots)?;
    let (Some(source), Some(target), Some(luminance), Some(params)) = (
        resources.images.first(),
        resources.images.get(1),
        resources.buffers.first(),
        resources.uniforms.first(),
    ) else {
        return Err(Error::State(
            "post-process table is missing a resource".to_owned(),
        ));
    };
    if Rc::ptr_eq(source, target) {
        return Err(Error::State(
            "post-process reads and writes the same image".to_owned(),
        ));
    }

    let params: ToneMappingParams = read_uniform(&params.borrow())?;
    let source = source.borrow();
    let extent = source.extent;
    if z != 1 || x * WORKGROUP_SIZE < extent.width || y * WORKGROUP_SIZE < extent.height {
        return Err(Error::State(format!(
            "dispatch of {x}x{y}x{z} groups does not cover {}x{}",
            extent.width, extent.height
        )));
    }

    let samples = params.sample_count.max(1) as f32;
    let mut luminance = luminance.borrow_mut();
    expect_state(
        &luminance.name,
        luminance.state,
        &[ResourceState::UnorderedAccess],
    )?;
    let stored = f32::from_bits(pod_read_unaligned::<u32>(&luminance.bytes[..4]));

    match params.stage {
        STAGE_REDUCE_LUMINANCE => {
            let brightest = source
                .texels
                .iter()
                .map(|t| (t.truncate() / samples).dot(LUMINANCE))
                .fold(stored, f32::max);
            luminance.bytes[..4].copy_from_slice(&brightest.to_bits().to_ne_bytes());
        }
        STAGE_TONE_MAP => {
            let mut target = target.borrow_mut();
            expect_state(&target.name, target.state, &[ResourceState::UnorderedAccess])?;
            if target.extent != extent {
                return Err(Error::State(format!(
                    "{} and {} differ in size",
                    source.name, target.name
                )));
            }

            let white = (stored * params.exposure).max(f32::MIN_POSITIVE);
            for (out, texel) in target.texels.iter_mut().zip(&source.texels) {
                let color = texel.truncate() / samples * params.exposure;
                let l = color.dot(LUMINANCE);
                let mapped = l * (1.0 + l / (white * white)) / (1.0 + l);
                let scale = if l > 0.0 { mapped / l } else { 0.0 };
                *out = (color * scale).clamp(Vec3::ZERO, Vec3::ONE).extend(1.0);
            }
        }
        stage => return Err(Error::State(format!("unknown post-process stage {stage}"))),
    }

    Ok(())
}

fn read_uniform<T: bytemuck::Pod>(buffer: &BufferData) -> Result<T> {
    let size = std::mem::size_of::<T>();
    if buffer.bytes.len() < size {
        return Err(Error::State(format!(
            "{} is smaller than its uniform block",
            buffer.name
        )));
    }

    Ok(pod_read_unaligned(&buffer.bytes[..size]))
}

impl Backend for Headless {
    type Buffer = HeadlessBuffer;
    type Image = HeadlessImage;
    type AccelerationStructure = HeadlessStructure;
    type BindingTable = HeadlessTable;
    type Pipeline = HeadlessPipeline;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<Self::Buffer> {
        if desc.size == 0 {
            return Err(Error::device(
                format!("creating buffer {}", desc.name),
                anyhow::anyhow!("zero sized buffer"),
            ));
        }
        let address = self.allocate(desc.name, desc.size)?;

        let data = Rc::new(RefCell::new(BufferData {
            name: desc.name.to_owned(),
            kind: desc.kind,
            state: ResourceState::Common,
            address,
            bytes: vec![0; desc.size as usize],
        }));
        self.buffers.retain(|(_, b)| b.strong_count() > 0);
        self.buffers.push((desc.kind, Rc::downgrade(&data)));
        self.stats.buffers_created += 1;

        Ok(HeadlessBuffer(data))
    }

    fn write_buffer(&mut self, buffer: &mut Self::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut buffer = buffer.0.borrow_mut();
        if !buffer.kind.is_host_visible() {
            return Err(Error::State(format!("{} is not host visible", buffer.name)));
        }

        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.bytes.len() {
            return Err(Error::State(format!(
                "write of {} bytes at {offset} overflows {}",
                data.len(),
                buffer.name
            )));
        }
        buffer.bytes[start..end].copy_from_slice(data);

        Ok(())
    }

    fn read_buffer(&self, buffer: &Self::Buffer) -> Result<Vec<u8>> {
        let buffer = buffer.0.borrow();
        if !buffer.kind.is_host_visible() {
            return Err(Error::State(format!("{} is not host visible", buffer.name)));
        }

        Ok(buffer.bytes.clone())
    }

    fn buffer_address(&self, buffer: &Self::Buffer) -> u64 {
        buffer.0.borrow().address
    }

    fn buffer_size(&self, buffer: &Self::Buffer) -> u64 {
        buffer.0.borrow().bytes.len() as u64
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<Self::Image> {
        let size = desc.extent.pixel_count() * desc.format.bytes_per_texel();
        self.allocate(desc.name, size)?;

        Ok(HeadlessImage(Rc::new(RefCell::new(ImageData {
            name: desc.name.to_owned(),
            format: desc.format,
            extent: desc.extent,
            state: ResourceState::Undefined,
            texels: vec![Vec4::ZERO; desc.extent.pixel_count() as usize],
            samples: 0,
        }))))
    }

    fn acceleration_structure_sizes(&self, desc: &BuildDesc) -> Result<BuildSizes> {
        let count = desc.primitive_count();
        if count == 0 {
            return Ok(BuildSizes::default());
        }

        Ok(BuildSizes {
            result: 256 + 64 * count,
            scratch: 128 + 32 * count,
            update_scratch: if desc.allow_update { 64 + 16 * count } else { 0 },
        })
    }

    fn create_acceleration_structure(
        &mut self,
        level: AccelerationLevel,
        size: u64,
    ) -> Result<Self::AccelerationStructure> {
        let address = self.allocate("acceleration structure", size)?;

        Ok(HeadlessStructure(Rc::new(RefCell::new(StructureData {
            level,
            size,
            address,
            built: None,
        }))))
    }

    fn acceleration_structure_address(&self, structure: &Self::AccelerationStructure) -> u64 {
        structure.0.borrow().address
    }

    fn create_binding_table(&mut self, layout: &TableLayout) -> Result<Self::BindingTable> {
        self.stats.binding_tables += 1;

        Ok(HeadlessTable {
            layout: layout.clone(),
            slots: vec![None; layout.slot_count() as usize],
        })
    }

    fn write_binding(
        &mut self,
        table: &mut Self::BindingTable,
        slot: u32,
        view: BindingView<'_, Self>,
    ) -> Result<()> {
        table.layout.check(slot, view.kind())?;

        let entry = match view {
            BindingView::StorageImage(image) => Slot::Image(Rc::downgrade(&image.0)),
            BindingView::StorageBuffer(buffer) | BindingView::UniformBuffer(buffer) => {
                Slot::Buffer(Rc::downgrade(&buffer.0))
            }
            BindingView::AccelerationStructure(structure) => {
                Slot::Structure(Rc::downgrade(&structure.0))
            }
        };
        table.slots[slot as usize] = Some(entry);

        Ok(())
    }

    fn create_pipeline(
        &mut self,
        kind: PipelineKind,
        _shaders: &ShaderSet,
        table: &Self::BindingTable,
    ) -> Result<Self::Pipeline> {
        if table.layout.visibility != kind {
            return Err(Error::State(format!(
                "{kind:?} pipeline created against a {:?} table",
                table.layout.visibility
            )));
        }
        self.stats.pipelines += 1;

        Ok(HeadlessPipeline {
            kind,
            layout: table.layout.clone(),
        })
    }

    fn cmd_buffer_barrier(
        &mut self,
        buffer: &Self::Buffer,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        self.recorded.push(Command::BufferBarrier {
            buffer: Rc::downgrade(&buffer.0),
            before,
            after,
        });
        Ok(())
    }

    fn cmd_image_barrier(
        &mut self,
        image: &Self::Image,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        self.recorded.push(Command::ImageBarrier {
            image: Rc::downgrade(&image.0),
            before,
            after,
        });
        Ok(())
    }

    fn cmd_copy_buffer(
        &mut self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        size: u64,
    ) -> Result<()> {
        self.recorded.push(Command::CopyBuffer {
            src: Rc::downgrade(&src.0),
            dst: Rc::downgrade(&dst.0),
            size,
        });
        Ok(())
    }

    fn cmd_update_buffer(&mut self, dst: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.recorded.push(Command::UpdateBuffer {
            dst: Rc::downgrade(&dst.0),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn cmd_clear_image(&mut self, image: &Self::Image, color: [f32; 4]) -> Result<()> {
        self.recorded.push(Command::ClearImage {
            image: Rc::downgrade(&image.0),
            color,
        });
        Ok(())
    }

    fn cmd_copy_image_to_buffer(&mut self, image: &Self::Image, dst: &Self::Buffer) -> Result<()> {
        self.recorded.push(Command::CopyImageToBuffer {
            image: Rc::downgrade(&image.0),
            dst: Rc::downgrade(&dst.0),
        });
        Ok(())
    }

    fn cmd_build_acceleration_structure(
        &mut self,
        desc: &BuildDesc,
        dst: &Self::AccelerationStructure,
        scratch: &Self::Buffer,
        mode: BuildMode,
    ) -> Result<()> {
        let required = self.acceleration_structure_sizes(desc)?;

        self.recorded.push(Command::Build {
            level: desc.level(),
            primitive_count: desc.primitive_count(),
            allow_update: desc.allow_update,
            required,
            dst: Rc::downgrade(&dst.0),
            scratch: Rc::downgrade(&scratch.0),
            mode,
        });
        Ok(())
    }

    fn cmd_bind_pipeline(
        &mut self,
        pipeline: &Self::Pipeline,
        table: &Self::BindingTable,
    ) -> Result<()> {
        if pipeline.layout != table.layout {
            return Err(Error::State(
                "pipeline bound with a table of a different layout".to_owned(),
            ));
        }

        self.recorded.push(Command::Bind {
            kind: pipeline.kind,
            slots: table.slots.clone(),
        });
        Ok(())
    }

    fn cmd_trace_rays(
        &mut self,
        pipeline: &Self::Pipeline,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if pipeline.kind != PipelineKind::RayTracing {
            return Err(Error::State("rays traced with a compute pipeline".to_owned()));
        }

        self.recorded.push(Command::TraceRays { width, height });
        Ok(())
    }

    fn cmd_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.recorded.push(Command::Dispatch { x, y, z });
        Ok(())
    }

    fn flush(&mut self) -> Result<u64> {
        let commands = std::mem::take(&mut self.recorded);

        match self.failing_flush {
            Some(0) => {
                self.failing_flush = None;
                return Err(Error::device(
                    "submitting command batch",
                    anyhow::anyhow!("device lost"),
                ));
            }
            Some(remaining) => self.failing_flush = Some(remaining - 1),
            None => {}
        }

        self.execute(commands)?;
        self.fence += 1;
        self.stats.submissions += 1;

        Ok(self.fence)
    }

    fn completed_fence_value(&self) -> Result<u64> {
        Ok(self.fence)
    }

    fn pending_fence_value(&self) -> u64 {
        self.fence + 1
    }

    fn discard_commands(&mut self) -> Result<()> {
        self.recorded.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(backend: &mut Headless, kind: BufferKind, size: u64) -> HeadlessBuffer {
        backend
            .create_buffer(&BufferDesc {
                name: "test",
                size,
                kind,
            })
            .unwrap()
    }

    #[test]
    fn commands_run_only_on_flush() {
        let mut backend = Headless::new();
        let mut staging = buffer(&mut backend, BufferKind::Staging, 4);
        let readback = buffer(&mut backend, BufferKind::Readback, 4);

        backend.write_buffer(&mut staging, 0, &[1, 2, 3, 4]).unwrap();
        backend.cmd_copy_buffer(&staging, &readback, 4).unwrap();

        assert_eq!(backend.read_buffer(&readback).unwrap(), vec![0; 4]);
        assert_eq!(backend.flush().unwrap(), 1);
        assert_eq!(backend.read_buffer(&readback).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.stats().submissions, 1);
    }

    #[test]
    fn barrier_must_name_the_tracked_state() {
        let mut backend = Headless::new();
        let device = buffer(
            &mut backend,
            BufferKind::Device {
                unordered_access: false,
            },
            16,
        );

        backend
            .cmd_buffer_barrier(&device, ResourceState::Uniform, ResourceState::CopyDest)
            .unwrap();

        assert!(matches!(backend.flush(), Err(Error::State(_))));
        assert_eq!(backend.buffer_state(&device), ResourceState::Common);
    }

    #[test]
    fn unordered_access_needs_the_creation_flag() {
        let mut backend = Headless::new();
        let device = buffer(
            &mut backend,
            BufferKind::Device {
                unordered_access: false,
            },
            16,
        );

        backend
            .cmd_buffer_barrier(
                &device,
                ResourceState::Common,
                ResourceState::UnorderedAccess,
            )
            .unwrap();

        assert!(matches!(backend.flush(), Err(Error::State(_))));
    }

    #[test]
    fn released_resources_are_detected() {
        let mut backend = Headless::new();
        let staging = buffer(&mut backend, BufferKind::Staging, 4);
        let readback = buffer(&mut backend, BufferKind::Readback, 4);

        backend.cmd_copy_buffer(&staging, &readback, 4).unwrap();
        drop(staging);

        assert!(matches!(backend.flush(), Err(Error::State(_))));
        assert_eq!(backend.live_buffers(BufferKind::Staging), 0);
    }

    #[test]
    fn device_memory_is_not_mapped() {
        let mut backend = Headless::new();
        let mut device = buffer(
            &mut backend,
            BufferKind::Device {
                unordered_access: true,
            },
            4,
        );

        assert!(backend.write_buffer(&mut device, 0, &[0; 4]).is_err());
        assert!(backend.read_buffer(&device).is_err());
    }

    #[test]
    fn injected_failures_surface_as_device_errors() {
        let mut backend = Headless::new();

        backend.fail_next_allocation();
        assert!(matches!(
            backend.create_buffer(&BufferDesc {
                name: "doomed",
                size: 4,
                kind: BufferKind::Staging,
            }),
            Err(Error::Device { .. })
        ));

        backend.fail_next_flush();
        assert!(matches!(backend.flush(), Err(Error::Device { .. })));
        assert_eq!(backend.stats().submissions, 0);
        assert_eq!(backend.flush().unwrap(), 1);
    }

    #[test]
    fn delayed_flush_failure_skips_earlier_batches() {
        let mut backend = Headless::new();

        backend.fail_flush_after(2);
        assert_eq!(backend.flush().unwrap(), 1);
        assert_eq!(backend.flush().unwrap(), 2);
        assert!(matches!(backend.flush(), Err(Error::Device { .. })));
        assert_eq!(backend.flush().unwrap(), 3);
    }

    #[test]
    fn clear_requires_copy_destination() {
        let mut backend = Headless::new();
        let image = backend
            .create_image(&ImageDesc {
                name: "accumulation",
                extent: Extent {
                    width: 2,
                    height: 2,
                },
                format: ImageFormat::Rgba32Float,
            })
            .unwrap();

        backend
            .cmd_image_barrier(&image, ResourceState::Undefined, ResourceState::UnorderedAccess)
            .unwrap();
        backend.cmd_clear_image(&image, [0.0; 4]).unwrap();
        assert!(matches!(backend.flush(), Err(Error::State(_))));

        backend
            .cmd_image_barrier(&image, ResourceState::UnorderedAccess, ResourceState::CopyDest)
            .unwrap();
        backend.cmd_clear_image(&image, [0.0; 4]).unwrap();
        backend.flush().unwrap();

        assert_eq!(backend.image_state(&image), ResourceState::CopyDest);
        assert_eq!(backend.stats().image_clears, 1);
    }
}
