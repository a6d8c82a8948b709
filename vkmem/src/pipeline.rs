use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::DeviceContext;
use crate::shader::EntryPoint;

// ---------------------------------------------------------------------------
// PipelineLayout
// ---------------------------------------------------------------------------

/// An owned wrapper around a `VkPipelineLayout` with compute push
/// constants and no descriptor sets.
///
/// Multiple pipelines that share the same push-constant signature can hold
/// the layout behind an `Arc<PipelineLayout>`.
pub struct PipelineLayout {
    parent: Arc<DeviceContext>,
    handle: vk::PipelineLayout,
    push_constant_size: u32,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .field("push_constant_size", &self.push_constant_size)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// Create a layout with one compute push-constant range of
    /// `push_constant_size` bytes at offset 0. A size of 0 declares no
    /// range.
    pub fn with_push_constants(
        device: &Arc<DeviceContext>,
        push_constant_size: u32,
    ) -> Result<Self, vk::Result> {
        let range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_size);
        let ranges: &[vk::PushConstantRange] = if push_constant_size == 0 {
            &[]
        } else {
            std::slice::from_ref(&range)
        };
        let create_info =
            vk::PipelineLayoutCreateInfo::default().push_constant_ranges(ranges);

        // SAFETY: create_info and the range it borrows outlive the call.
        let handle =
            unsafe { device.create_raw_pipeline_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
            push_constant_size,
        })
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    pub fn raw_pipeline_layout(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed during
        // teardown. All pipelines using this layout must be dropped first.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateComputePipelineError {
    #[error("Vulkan error creating compute pipeline: {0}")]
    PipelineCreation(vk::Result),
}

// ---------------------------------------------------------------------------
// ComputePipeline
// ---------------------------------------------------------------------------

/// A compute pipeline and the layout it was built with.
pub struct ComputePipeline {
    parent: Arc<DeviceContext>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl ComputePipeline {
    /// `name` is an optional debug label. Naming failures are logged as
    /// warnings and do not cause the call to fail.
    pub fn new(
        device: &Arc<DeviceContext>,
        entry_point: &EntryPoint<'_>,
        layout: Arc<PipelineLayout>,
        name: Option<&str>,
    ) -> Result<Self, CreateComputePipelineError> {
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(entry_point.as_pipeline_stage_create_info())
            .layout(layout.raw_pipeline_layout());

        // SAFETY: create_info references a live shader module and layout
        // derived from device, valid for the duration of this call.
        let handle =
            unsafe { device.create_raw_compute_pipeline(&create_info) }
                .map_err(CreateComputePipelineError::PipelineCreation)?;

        // SAFETY: handle is a valid pipeline created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name pipeline {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout,
        })
    }

    pub fn raw_pipeline(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed during
        // teardown. All in-flight GPU work referencing this pipeline must be
        // completed before drop.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}
