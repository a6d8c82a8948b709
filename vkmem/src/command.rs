use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::device::DeviceContext;
use crate::pipeline::ComputePipeline;
use crate::query::TimestampQueryPool;
use crate::sync::{Fence, MarkSubmittedError};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum RecordCommandBufferError {
    #[error("Vulkan error resetting command buffer: {0}")]
    Reset(vk::Result),
    #[error("Vulkan error beginning command buffer: {0}")]
    Begin(vk::Result),
    #[error("Vulkan error ending command buffer: {0}")]
    End(vk::Result),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Command buffer is {0:?}, only an executable buffer can be submitted")]
    NotExecutable(CommandBufferState),
    #[error("Fence cannot be submitted: {0}")]
    Fence(#[from] MarkSubmittedError),
    #[error("Vulkan error submitting to the compute queue: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

/// A primary command buffer allocated from the context's compute pool.
///
/// Recording commands are `unsafe`: the buffer records raw handles, and
/// the caller must keep every referenced object alive until GPU execution
/// of the buffer has finished.
pub struct CommandBuffer {
    parent: Arc<DeviceContext>,
    handle: vk::CommandBuffer,
    state: CommandBufferState,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    /// `name` is an optional debug label. Naming failures are logged as
    /// warnings and do not cause the call to fail.
    pub fn new(
        device: &Arc<DeviceContext>,
        name: Option<&str>,
    ) -> Result<Self, AllocateCommandBufferError> {
        // SAFETY: DeviceContext is !Sync, so every handle to the pool lives
        // on this thread and nothing else touches it during this call.
        let handle = unsafe { device.allocate_raw_command_buffer() }
            .map_err(AllocateCommandBufferError::Vulkan)?;

        // SAFETY: handle is a valid command buffer created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name command buffer {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            state: CommandBufferState::Initial,
        })
    }

    /// Reset this buffer to the initial state.
    ///
    /// # Safety
    /// The buffer must not be pending execution on the GPU.
    pub unsafe fn reset(&mut self) -> Result<(), RecordCommandBufferError> {
        // SAFETY: Caller guarantees the buffer is not pending.
        unsafe { self.parent.reset_raw_command_buffer(self.handle) }
            .map_err(RecordCommandBufferError::Reset)?;
        self.state = CommandBufferState::Initial;
        Ok(())
    }

    /// Begin recording.
    ///
    /// # Safety
    /// The buffer must not be pending execution on the GPU.
    pub unsafe fn begin(&mut self) -> Result<(), RecordCommandBufferError> {
        if self.state != CommandBufferState::Initial {
            // SAFETY: Forwarded to the caller.
            unsafe { self.reset() }?;
        }
        let begin_info = vk::CommandBufferBeginInfo::default();
        // SAFETY: The buffer is in the initial state.
        unsafe {
            self.parent
                .begin_raw_command_buffer(self.handle, &begin_info)
        }
        .map_err(RecordCommandBufferError::Begin)?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// End recording.
    ///
    /// # Panics
    /// If the buffer is not recording.
    pub fn end(&mut self) -> Result<(), RecordCommandBufferError> {
        assert_eq!(self.state, CommandBufferState::Recording);
        // SAFETY: The buffer is in the recording state.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }
            .map_err(RecordCommandBufferError::End)?;
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Record a global memory barrier using the synchronization2 API.
    ///
    /// # Safety
    /// The buffer must be recording.
    pub unsafe fn memory_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        debug_assert_eq!(self.state, CommandBufferState::Recording);
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access);
        let dependency_info = vk::DependencyInfo::default()
            .memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: Caller guarantees recording state; dependency_info only
        // borrows the barrier above.
        unsafe {
            self.parent
                .cmd_pipeline_barrier2(self.handle, &dependency_info)
        }
    }

    /// # Safety
    /// The buffer must be recording and the pool must outlive GPU
    /// execution.
    pub unsafe fn reset_query_pool(
        &mut self,
        query_pool: &TimestampQueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        debug_assert_eq!(self.state, CommandBufferState::Recording);
        debug_assert!(first_query + query_count <= query_pool.count());
        // SAFETY: Caller guarantees recording state; range checked above.
        unsafe {
            self.parent.cmd_reset_query_pool(
                self.handle,
                query_pool.raw_query_pool(),
                first_query,
                query_count,
            )
        }
    }

    /// Write a timestamp once all earlier commands reach `stage`.
    ///
    /// # Safety
    /// The buffer must be recording, `query` must be reset before this
    /// executes and the pool must outlive GPU execution.
    pub unsafe fn write_timestamp(
        &mut self,
        stage: vk::PipelineStageFlags2,
        query_pool: &TimestampQueryPool,
        query: u32,
    ) {
        debug_assert_eq!(self.state, CommandBufferState::Recording);
        debug_assert!(query < query_pool.count());
        // SAFETY: Caller guarantees recording state and query validity.
        unsafe {
            self.parent.cmd_write_timestamp2(
                self.handle,
                stage,
                query_pool.raw_query_pool(),
                query,
            )
        }
    }

    /// Copy `size` bytes from offset 0 of `src` to offset 0 of `dst` as a
    /// single region.
    ///
    /// # Safety
    /// The buffer must be recording. `src` must carry `TRANSFER_SRC` usage,
    /// `dst` must carry `TRANSFER_DST`, both must be bound, at least `size`
    /// bytes long and alive until GPU execution finishes.
    pub unsafe fn copy_buffer<S, D>(
        &mut self,
        src: &S,
        dst: &D,
        size: vk::DeviceSize,
    ) where
        S: BufferHandle + ?Sized,
        D: BufferHandle + ?Sized,
    {
        debug_assert_eq!(self.state, CommandBufferState::Recording);
        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(0)
            .size(size);
        // SAFETY: Caller guarantees recording state, usage and bounds.
        unsafe {
            self.parent.cmd_copy_buffer(
                self.handle,
                src.raw_buffer(),
                dst.raw_buffer(),
                std::slice::from_ref(&region),
            )
        }
    }

    /// # Safety
    /// The buffer must be recording and `pipeline` must outlive GPU
    /// execution.
    pub unsafe fn bind_compute_pipeline(&mut self, pipeline: &ComputePipeline) {
        debug_assert_eq!(self.state, CommandBufferState::Recording);
        // SAFETY: Caller guarantees recording state and pipeline lifetime.
        unsafe {
            self.parent
                .cmd_bind_compute_pipeline(self.handle, pipeline.raw_pipeline())
        }
    }

    /// Push `constants` at `offset` for the compute stage of `pipeline`'s
    /// layout.
    ///
    /// # Safety
    /// The buffer must be recording and the range must be declared in the
    /// layout.
    pub unsafe fn push_constants<T: bytemuck::NoUninit>(
        &mut self,
        pipeline: &ComputePipeline,
        offset: u32,
        constants: &T,
    ) {
        debug_assert_eq!(self.state, CommandBufferState::Recording);
        // SAFETY: Caller guarantees recording state and range validity.
        unsafe {
            self.parent.cmd_push_constants(
                self.handle,
                pipeline.layout().raw_pipeline_layout(),
                vk::ShaderStageFlags::COMPUTE,
                offset,
                bytemuck::bytes_of(constants),
            )
        }
    }

    /// # Safety
    /// The buffer must be recording with a compute pipeline bound and all
    /// of its push constants set.
    pub unsafe fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        debug_assert_eq!(self.state, CommandBufferState::Recording);
        // SAFETY: Caller guarantees recording and pipeline state.
        unsafe { self.parent.cmd_dispatch(self.handle, x, y, z) }
    }

    /// Submit to the compute queue, signaling `fence` on completion.
    ///
    /// # Safety
    /// Every object the recorded commands reference must stay alive until
    /// `fence` has been waited on. The buffer must not still be pending
    /// from an earlier submission.
    pub unsafe fn submit(&self, fence: &mut Fence) -> Result<(), SubmitError> {
        if self.state != CommandBufferState::Executable {
            return Err(SubmitError::NotExecutable(self.state));
        }
        if !fence.is_ready() {
            return Err(MarkSubmittedError::AlreadySubmitted.into());
        }

        let command_buffer_info =
            vk::CommandBufferSubmitInfo::default().command_buffer(self.handle);
        let submit_info = vk::SubmitInfo2::default().command_buffer_infos(
            std::slice::from_ref(&command_buffer_info),
        );

        // SAFETY: The buffer is executable, fence is unsignaled and both came
        // from parent. Caller guarantees resource lifetimes.
        unsafe {
            self.parent.compute_queue_submit2(
                std::slice::from_ref(&submit_info),
                fence.raw_fence(),
            )
        }
        .map_err(SubmitError::Vulkan)?;

        // SAFETY: The fence was just handed to a successful submission.
        unsafe { fence.mark_submitted() }?;
        Ok(())
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn parent(&self) -> &Arc<DeviceContext> {
        &self.parent
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping command buffer {:?}", self.handle);
        // SAFETY: handle was allocated from parent's pool. Callers must not
        // drop a buffer while its GPU work is still executing.
        unsafe { self.parent.free_raw_command_buffer(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_executable_error_names_state() {
        let err = SubmitError::NotExecutable(CommandBufferState::Recording);
        assert!(err.to_string().contains("Recording"));
    }

    #[test]
    fn fence_errors_convert_into_submit_errors() {
        let err: SubmitError = MarkSubmittedError::AlreadySubmitted.into();
        assert!(matches!(err, SubmitError::Fence(_)));
    }
}
