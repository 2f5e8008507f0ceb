use crate::{
    binding::RayTraceTable, Backend, Error, Extent, PipelineKind, RenderSettings, ResourceState,
    Result, ShaderSet,
};

/// Progress of the ray tracing stage through one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Idle,
    Bound,
    /// Accumulation restarted this frame.
    Cleared,
    /// Accumulation continues from the previous frame.
    Accumulating,
    Dispatched,
    /// Accumulation image handed to the post-process stage.
    AwaitingNextFrame,
}

pub struct RayTraceStage<B: Backend> {
    pipeline: B::Pipeline,
    state: StageState,
    sample_count: u32,
}

impl<B: Backend> RayTraceStage<B> {
    pub fn new(backend: &mut B, shaders: &ShaderSet, table: &RayTraceTable<B>) -> Result<Self> {
        let pipeline = backend.create_pipeline(PipelineKind::RayTracing, shaders, &table.table)?;

        Ok(Self {
            pipeline,
            state: StageState::Idle,
            sample_count: 0,
        })
    }

    /// Recreates the pipeline against a newly allocated table.
    pub fn rebuild_pipeline(
        &mut self,
        backend: &mut B,
        shaders: &ShaderSet,
        table: &RayTraceTable<B>,
    ) -> Result<()> {
        self.pipeline = backend.create_pipeline(PipelineKind::RayTracing, shaders, &table.table)?;
        Ok(())
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Samples accumulated once a frame recorded with these inputs completes.
    pub fn next_sample_count(&self, settings: &RenderSettings, reset: bool) -> u32 {
        if reset {
            settings.rays_per_pixel
        } else {
            self.sample_count.saturating_add(settings.rays_per_pixel)
        }
    }

    /// Records one frame of ray generation into the open batch.
    ///
    /// The accumulation image must be in the unordered access state and is
    /// left shader readable. Returns the accumulated sample count.
    pub fn record(
        &mut self,
        backend: &mut B,
        table: &RayTraceTable<B>,
        accumulation: &B::Image,
        extent: Extent,
        settings: &RenderSettings,
        reset: bool,
    ) -> Result<u32> {
        if !matches!(self.state, StageState::Idle | StageState::AwaitingNextFrame) {
            return Err(Error::State(format!(
                "ray tracing stage entered a frame while {:?}",
                self.state
            )));
        }
        settings.validate()?;

        backend.cmd_bind_pipeline(&self.pipeline, &table.table)?;
        self.state = StageState::Bound;

        let samples = self.next_sample_count(settings, reset);
        if reset {
            backend.cmd_image_barrier(
                accumulation,
                ResourceState::UnorderedAccess,
                ResourceState::CopyDest,
            )?;
            backend.cmd_clear_image(accumulation, [0.0; 4])?;
            backend.cmd_image_barrier(
                accumulation,
                ResourceState::CopyDest,
                ResourceState::UnorderedAccess,
            )?;
            self.state = StageState::Cleared;
        } else {
            self.state = StageState::Accumulating;
        }

        for pass in 0..settings.rays_per_pixel {
            if pass > 0 {
                backend.cmd_image_barrier(
                    accumulation,
                    ResourceState::UnorderedAccess,
                    ResourceState::UnorderedAccess,
                )?;
            }
            backend.cmd_trace_rays(&self.pipeline, extent.width, extent.height)?;
        }
        self.state = StageState::Dispatched;

        backend.cmd_image_barrier(
            accumulation,
            ResourceState::UnorderedAccess,
            ResourceState::ShaderResource,
        )?;
        self.state = StageState::AwaitingNextFrame;
        self.sample_count = samples;

        log::trace!(
            "Recorded {} ray passes, {samples} samples accumulated",
            settings.rays_per_pixel
        );
        Ok(samples)
    }

    /// Returns to idle after a frame was abandoned mid-recording.
    pub fn abort(&mut self) {
        self.state = StageState::Idle;
        self.sample_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use scene::Model;

    fn frame(
        fixture: &mut Fixture,
        stage: &mut RayTraceStage<crate::headless::Headless>,
        table: &RayTraceTable<crate::headless::Headless>,
        settings: &RenderSettings,
        reset: bool,
    ) -> u32 {
        let samples = stage
            .record(
                &mut fixture.backend,
                table,
                &fixture.accumulation,
                fixture.extent,
                settings,
                reset,
            )
            .unwrap();
        fixture
            .backend
            .cmd_image_barrier(
                &fixture.accumulation,
                ResourceState::ShaderResource,
                ResourceState::UnorderedAccess,
            )
            .unwrap();
        fixture.backend.flush().unwrap();
        samples
    }

    #[test]
    fn samples_grow_until_reset() {
        let mut fixture = Fixture::new(&[Model::cube("cube")]);
        let table = fixture.raytrace_table().unwrap();
        let mut stage = RayTraceStage::new(&mut fixture.backend, &ShaderSet::default(), &table).unwrap();
        let settings = RenderSettings {
            rays_per_pixel: 3,
            ..Default::default()
        };

        assert_eq!(frame(&mut fixture, &mut stage, &table, &settings, true), 3);
        for expected in [6, 9, 12, 15] {
            assert_eq!(frame(&mut fixture, &mut stage, &table, &settings, false), expected);
            assert_eq!(fixture.backend.image_samples(&fixture.accumulation), expected);
        }

        assert_eq!(frame(&mut fixture, &mut stage, &table, &settings, true), 3);
        assert_eq!(fixture.backend.image_samples(&fixture.accumulation), 3);
        assert_eq!(fixture.backend.stats().image_clears, 2);
        assert_eq!(fixture.backend.stats().trace_dispatches, 18);
    }

    #[test]
    fn frame_ends_awaiting_post_process() {
        let mut fixture = Fixture::new(&[Model::cube("cube")]);
        let table = fixture.raytrace_table().unwrap();
        let mut stage = RayTraceStage::new(&mut fixture.backend, &ShaderSet::default(), &table).unwrap();
        assert_eq!(stage.state(), StageState::Idle);

        stage
            .record(
                &mut fixture.backend,
                &table,
                &fixture.accumulation,
                fixture.extent,
                &RenderSettings::default(),
                true,
            )
            .unwrap();
        fixture.backend.flush().unwrap();

        assert_eq!(stage.state(), StageState::AwaitingNextFrame);
        assert_eq!(
            fixture.backend.image_state(&fixture.accumulation),
            ResourceState::ShaderResource
        );
    }

    #[test]
    fn invalid_settings_record_nothing() {
        let mut fixture = Fixture::new(&[Model::cube("cube")]);
        let table = fixture.raytrace_table().unwrap();
        let mut stage = RayTraceStage::new(&mut fixture.backend, &ShaderSet::default(), &table).unwrap();
        let settings = RenderSettings {
            rays_per_pixel: 0,
            ..Default::default()
        };

        let result = stage.record(
            &mut fixture.backend,
            &table,
            &fixture.accumulation,
            fixture.extent,
            &settings,
            true,
        );

        assert!(matches!(result, Err(Error::InvalidSettings(_))));
        assert_eq!(fixture.backend.recorded_commands(), 0);
        assert_eq!(stage.state(), StageState::Idle);
    }

    #[test]
    fn aborted_frame_returns_to_idle() {
        let mut fixture = Fixture::new(&[Model::cube("cube")]);
        let table = fixture.raytrace_table().unwrap();
        let mut stage = RayTraceStage::new(&mut fixture.backend, &ShaderSet::default(), &table).unwrap();
        let settings = RenderSettings::default();

        frame(&mut fixture, &mut stage, &table, &settings, true);
        stage.abort();

        assert_eq!(stage.state(), StageState::Idle);
        assert_eq!(stage.next_sample_count(&settings, false), 1);
    }
}
