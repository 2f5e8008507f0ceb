use crate::{
    binding::{PostProcessResources, PostProcessTable},
    uniforms::{ToneMappingParams, STAGE_REDUCE_LUMINANCE, STAGE_TONE_MAP},
    upload::Uploader,
    Backend, BufferDesc, BufferKind, Extent, PipelineKind, RenderSettings, ResourceState, Result,
    ShaderSet,
};

/// Edge of the square compute workgroup.
pub const WORKGROUP_SIZE: u32 = 16;
const LUMINANCE_SEED: u32 = 1;

/// Luminance reduction followed by tone mapping into the render target.
pub struct PostProcessStage<B: Backend> {
    table: PostProcessTable<B>,
    pipeline: B::Pipeline,
    luminance: B::Buffer,
    tone_mapping: B::Buffer,
}

impl<B: Backend> PostProcessStage<B> {
    /// Records the initial uploads into the open batch.
    pub fn new(
        backend: &mut B,
        uploader: &mut Uploader<B>,
        shaders: &ShaderSet,
        accumulation: &B::Image,
        target: &B::Image,
    ) -> Result<Self> {
        let luminance = uploader.upload(
            backend,
            "luminance",
            &LUMINANCE_SEED.to_ne_bytes(),
            ResourceState::UnorderedAccess,
            true,
        )?;
        let tone_mapping = backend.create_buffer(&BufferDesc {
            name: "tone mapping",
            size: std::mem::size_of::<ToneMappingParams>() as u64,
            kind: BufferKind::DeviceConstants,
        })?;
        backend.cmd_buffer_barrier(&tone_mapping, ResourceState::Common, ResourceState::Uniform)?;

        let table = PostProcessTable::build(
            backend,
            &PostProcessResources {
                accumulation,
                target,
                luminance: &luminance,
                tone_mapping: &tone_mapping,
            },
        )?;
        let pipeline = backend.create_pipeline(PipelineKind::Compute, shaders, &table.table)?;

        Ok(Self {
            table,
            pipeline,
            luminance,
            tone_mapping,
        })
    }

    /// Points the table at new images after a resize.
    pub fn rebind(&mut self, backend: &mut B, accumulation: &B::Image, target: &B::Image) -> Result<()> {
        self.table.populate(
            backend,
            &PostProcessResources {
                accumulation,
                target,
                luminance: &self.luminance,
                tone_mapping: &self.tone_mapping,
            },
        )
    }

    #[cfg(test)]
    pub fn luminance(&self) -> &B::Buffer {
        &self.luminance
    }

    /// Records both dispatches into the open batch.
    ///
    /// Expects the accumulation image shader readable and returns it to
    /// unordered access. The render target stays in unordered access.
    pub fn record(
        &self,
        backend: &mut B,
        accumulation: &B::Image,
        extent: Extent,
        settings: &RenderSettings,
        sample_count: u32,
        reset_luminance: bool,
    ) -> Result<()> {
        if reset_luminance {
            backend.cmd_buffer_barrier(
                &self.luminance,
                ResourceState::UnorderedAccess,
                ResourceState::CopyDest,
            )?;
            backend.cmd_update_buffer(&self.luminance, 0, &LUMINANCE_SEED.to_ne_bytes())?;
            backend.cmd_buffer_barrier(
                &self.luminance,
                ResourceState::CopyDest,
                ResourceState::UnorderedAccess,
            )?;
        }

        backend.cmd_bind_pipeline(&self.pipeline, &self.table.table)?;

        let groups_x = extent.width.div_ceil(WORKGROUP_SIZE);
        let groups_y = extent.height.div_ceil(WORKGROUP_SIZE);
        for stage in [STAGE_REDUCE_LUMINANCE, STAGE_TONE_MAP] {
            let params = ToneMappingParams::new(stage, settings, sample_count);

            backend.cmd_buffer_barrier(
                &self.tone_mapping,
                ResourceState::Uniform,
                ResourceState::CopyDest,
            )?;
            backend.cmd_update_buffer(&self.tone_mapping, 0, bytemuck::bytes_of(&params))?;
            backend.cmd_buffer_barrier(
                &self.tone_mapping,
                ResourceState::CopyDest,
                ResourceState::Uniform,
            )?;
            backend.cmd_dispatch(groups_x, groups_y, 1)?;

            if stage == STAGE_REDUCE_LUMINANCE {
                backend.cmd_buffer_barrier(
                    &self.luminance,
                    ResourceState::UnorderedAccess,
                    ResourceState::UnorderedAccess,
                )?;
            }
        }

        backend.cmd_image_barrier(
            accumulation,
            ResourceState::ShaderResource,
            ResourceState::UnorderedAccess,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{headless::Headless, testing::Fixture, trace::RayTraceStage};
    use scene::Model;

    fn luminance(backend: &mut Headless, stage: &PostProcessStage<Headless>) -> f32 {
        let readback =
            crate::upload::copy_to_readback(backend, stage.luminance(), ResourceState::UnorderedAccess)
                .unwrap();
        backend.flush().unwrap();
        let bytes = backend.read_buffer(&readback).unwrap();
        f32::from_bits(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    #[test]
    fn two_dispatches_per_frame_cover_the_target() {
        let mut fixture = Fixture::new(&[Model::cube("cube")]);
        let table = fixture.raytrace_table().unwrap();
        let shaders = ShaderSet::default();
        let mut trace = RayTraceStage::new(&mut fixture.backend, &shaders, &table).unwrap();
        let post = PostProcessStage::new(
            &mut fixture.backend,
            &mut fixture.uploader,
            &shaders,
            &fixture.accumulation,
            &fixture.target,
        )
        .unwrap();
        let settings = RenderSettings {
            sky: true,
            ..Default::default()
        };

        let samples = trace
            .record(
                &mut fixture.backend,
                &table,
                &fixture.accumulation,
                fixture.extent,
                &settings,
                true,
            )
            .unwrap();
        post.record(
            &mut fixture.backend,
            &fixture.accumulation,
            fixture.extent,
            &settings,
            samples,
            true,
        )
        .unwrap();
        fixture.backend.flush().unwrap();

        assert_eq!(fixture.backend.stats().compute_dispatches, 2);
        assert_eq!(
            fixture.backend.image_state(&fixture.accumulation),
            ResourceState::UnorderedAccess
        );
        assert!(luminance(&mut fixture.backend, &post) > 0.5);
    }

    #[test]
    fn accumulation_must_arrive_shader_readable() {
        let mut fixture = Fixture::new(&[Model::cube("cube")]);
        let shaders = ShaderSet::default();
        let post = PostProcessStage::new(
            &mut fixture.backend,
            &mut fixture.uploader,
            &shaders,
            &fixture.accumulation,
            &fixture.target,
        )
        .unwrap();
        fixture.backend.flush().unwrap();

        post.record(
            &mut fixture.backend,
            &fixture.accumulation,
            fixture.extent,
            &RenderSettings::default(),
            1,
            false,
        )
        .unwrap();

        assert!(fixture.backend.flush().is_err());
    }
}
