use crate::{Backend, BufferDesc, BufferKind, Error, ResourceState, Result};

/// A filled staging buffer and the device buffer it will be copied into.
pub struct BufferPair<B: Backend> {
    pub staging: B::Buffer,
    pub device: B::Buffer,
    pub size: u64,
    /// State the device buffer is left in by [`push_to_device`].
    pub final_state: ResourceState,
}

/// Allocates a staging buffer holding `bytes` and an empty device buffer of
/// the same size. No command is recorded.
pub fn stage_and_upload<B: Backend>(
    backend: &mut B,
    name: &str,
    bytes: &[u8],
    final_state: ResourceState,
    unordered_access: bool,
) -> Result<BufferPair<B>> {
    if bytes.is_empty() {
        log::error!("Refusing to upload empty buffer {name}");
        return Err(Error::InvalidScene(format!("buffer {name} has no content")));
    }
    let size = bytes.len() as u64;

    let mut staging = backend.create_buffer(&BufferDesc {
        name: &format!("{name} staging"),
        size,
        kind: BufferKind::Staging,
    })?;
    backend.write_buffer(&mut staging, 0, bytes)?;

    let device = backend.create_buffer(&BufferDesc {
        name,
        size,
        kind: BufferKind::Device { unordered_access },
    })?;

    Ok(BufferPair {
        staging,
        device,
        size,
        final_state,
    })
}

/// Records the staging to device copy framed by the two transitions.
/// The device buffer is only ready once the batch is flushed.
pub fn push_to_device<B: Backend>(
    backend: &mut B,
    pair: &BufferPair<B>,
    before: ResourceState,
    after: ResourceState,
) -> Result<()> {
    backend.cmd_buffer_barrier(&pair.device, before, ResourceState::CopyDest)?;
    backend.cmd_copy_buffer(&pair.staging, &pair.device, pair.size)?;
    backend.cmd_buffer_barrier(&pair.device, ResourceState::CopyDest, after)
}

/// Records a copy of a device buffer into a new host visible buffer.
/// The buffer is returned to `state` afterwards.
pub fn copy_to_readback<B: Backend>(
    backend: &mut B,
    buffer: &B::Buffer,
    state: ResourceState,
) -> Result<B::Buffer> {
    let size = backend.buffer_size(buffer);
    let readback = backend.create_buffer(&BufferDesc {
        name: "readback",
        size,
        kind: BufferKind::Readback,
    })?;

    backend.cmd_buffer_barrier(buffer, state, ResourceState::CopySource)?;
    backend.cmd_copy_buffer(buffer, &readback, size)?;
    backend.cmd_buffer_barrier(buffer, ResourceState::CopySource, state)?;

    Ok(readback)
}

/// Uploads device buffers and keeps their staging buffers alive until the
/// batch that reads them has completed.
pub struct Uploader<B: Backend> {
    in_flight: Vec<(u64, B::Buffer)>,
}

impl<B: Backend> Default for Uploader<B> {
    fn default() -> Self {
        Self {
            in_flight: Vec::new(),
        }
    }
}

impl<B: Backend> Uploader<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `bytes` and records the copy into a fresh device buffer, which is
    /// left in `final_state` once the open batch is flushed.
    pub fn upload(
        &mut self,
        backend: &mut B,
        name: &str,
        bytes: &[u8],
        final_state: ResourceState,
        unordered_access: bool,
    ) -> Result<B::Buffer> {
        let pair = stage_and_upload(backend, name, bytes, final_state, unordered_access)?;
        push_to_device(backend, &pair, ResourceState::Common, pair.final_state)?;

        let BufferPair {
            staging, device, ..
        } = pair;
        self.defer(backend.pending_fence_value(), staging);

        Ok(device)
    }

    /// Holds `buffer` until `fence` has been signalled.
    pub fn defer(&mut self, fence: u64, buffer: B::Buffer) {
        self.in_flight.push((fence, buffer));
    }

    /// Releases every buffer whose batch has completed. Returns how many.
    pub fn retire(&mut self, completed: u64) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|(fence, _)| *fence > completed);
        let released = before - self.in_flight.len();

        if released > 0 {
            log::debug!("Released {released} staging buffers up to fence {completed}");
        }
        released
    }

    pub fn pending_staging(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::Headless;

    #[test]
    fn uploaded_bytes_read_back_identically() {
        let mut backend = Headless::new();
        let bytes = (0..=255u8).cycle().take(1000).collect::<Vec<_>>();

        let pair = stage_and_upload(
            &mut backend,
            "payload",
            &bytes,
            ResourceState::ShaderResource,
            false,
        )
        .unwrap();
        push_to_device(
            &mut backend,
            &pair,
            ResourceState::Common,
            ResourceState::ShaderResource,
        )
        .unwrap();
        let readback =
            copy_to_readback(&mut backend, &pair.device, ResourceState::ShaderResource).unwrap();
        backend.flush().unwrap();

        assert_eq!(backend.read_buffer(&readback).unwrap(), bytes);
        assert_eq!(
            backend.buffer_state(&pair.device),
            ResourceState::ShaderResource
        );
    }

    #[test]
    fn empty_upload_is_an_invalid_scene() {
        let mut backend = Headless::new();

        let result = stage_and_upload(&mut backend, "empty", &[], ResourceState::Common, false);

        assert!(matches!(result, Err(Error::InvalidScene(_))));
        assert_eq!(backend.stats().buffers_created, 0);
    }

    #[test]
    fn wrong_prior_state_fails_at_flush() {
        let mut backend = Headless::new();
        let pair = stage_and_upload(
            &mut backend,
            "payload",
            &[1, 2, 3, 4],
            ResourceState::ShaderResource,
            false,
        )
        .unwrap();

        push_to_device(
            &mut backend,
            &pair,
            ResourceState::ShaderResource,
            ResourceState::ShaderResource,
        )
        .unwrap();

        assert!(matches!(backend.flush(), Err(Error::State(_))));
    }

    #[test]
    fn staging_is_released_after_its_fence() {
        let mut backend = Headless::new();
        let mut uploader = Uploader::new();

        let first = uploader
            .upload(&mut backend, "first", &[7; 16], ResourceState::ShaderResource, false)
            .unwrap();
        let second = uploader
            .upload(&mut backend, "second", &[9; 16], ResourceState::ShaderResource, true)
            .unwrap();
        assert_eq!(uploader.pending_staging(), 2);
        assert_eq!(uploader.retire(backend.completed_fence_value().unwrap()), 0);

        let fence = backend.flush().unwrap();
        assert_eq!(uploader.retire(fence), 2);
        assert_eq!(uploader.pending_staging(), 0);
        assert_eq!(backend.live_buffers(BufferKind::Staging), 0);

        assert_eq!(backend.buffer_state(&first), ResourceState::ShaderResource);
        assert_eq!(backend.buffer_state(&second), ResourceState::ShaderResource);
    }
}
