//! The device context ([`DeviceContext`]).
//!
//! `DeviceContext` owns everything a single-queue compute benchmark
//! needs: the [`Instance`], the only physical device on the system, a
//! logical device, the compute queue and a command pool bound to that
//! queue's family. Buffers, fences, query pools and command buffers
//! hold an `Arc<DeviceContext>`, so the context cannot be destroyed
//! while any of them is alive.
//!
//! Selection policy is strict and has no fallback:
//!
//! - exactly one physical device must be enumerated;
//! - the queue family flags must *equal* `COMPUTE | TRANSFER`;
//! - memory types are matched by *equal* property flags
//!   ([`find_memory_type_index`]).
//!
//! The pure selection helpers are free functions so they can be unit
//! tested without a driver.
//!
//! All raw Vulkan operations on the device handle are surfaced as
//! `unsafe fn` methods using the `raw_` naming convention. Wrappers in
//! sibling modules call these rather than touching `ash::Device`.

use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::{Buffer, CreateBufferError};
use crate::instance::{FetchPhysicalDeviceError, Instance, InstanceCreationError};
use crate::log::VulkanLogLevel;
use crate::sync::{CreateFenceError, Fence};

/// Queue capability set a family must advertise, with nothing extra.
pub const COMPUTE_QUEUE_FLAGS: vk::QueueFlags =
    vk::QueueFlags::from_raw(vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw());

#[derive(Debug, Error)]
pub enum CreateContextError {
    #[error("Failed to create Vulkan instance: {0}")]
    Instance(#[from] InstanceCreationError),

    #[error("Host memory exhaustion while enumerating physical devices")]
    MemoryExhaustion,

    #[error("Unknown Vulkan error while enumerating physical devices: {0}")]
    UnknownVulkan(vk::Result),

    #[error("Expected exactly one physical device, found {count}")]
    DeviceSelection { count: usize },

    #[error("No queue family advertises exactly COMPUTE | TRANSFER")]
    NoComputeQueue,

    #[error("Failed to create logical device: {0}")]
    DeviceCreation(vk::Result),

    #[error("Failed to create compute command pool: {0}")]
    CommandPoolCreation(vk::Result),
}

impl From<FetchPhysicalDeviceError> for CreateContextError {
    fn from(value: FetchPhysicalDeviceError) -> Self {
        match value {
            FetchPhysicalDeviceError::MemoryExhaustion => {
                Self::MemoryExhaustion
            }
            FetchPhysicalDeviceError::UnknownVulkan(e) => {
                Self::UnknownVulkan(e)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

/// Require exactly one enumerated physical device.
pub fn select_physical_device(
    physical_devices: &[vk::PhysicalDevice],
) -> Result<vk::PhysicalDevice, CreateContextError> {
    match physical_devices {
        [only] => Ok(*only),
        _ => Err(CreateContextError::DeviceSelection {
            count: physical_devices.len(),
        }),
    }
}

/// Index of the first queue family whose flags are exactly
/// [`COMPUTE_QUEUE_FLAGS`]. A `GRAPHICS | COMPUTE | TRANSFER` family does
/// not match.
pub fn find_compute_queue_family(
    queue_families: &[vk::QueueFamilyProperties],
) -> Option<u32> {
    queue_families
        .iter()
        .position(|qf| qf.queue_flags == COMPUTE_QUEUE_FLAGS)
        .map(|idx| idx as u32)
}

/// Index of the first memory type whose property flags equal
/// `required`.
///
/// This is equality, not containment: asking for
/// `HOST_VISIBLE | HOST_COHERENT` will not select a type that is also
/// `HOST_CACHED`.
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_properties.memory_types
        [..memory_properties.memory_type_count as usize]
        .iter()
        .position(|ty| ty.property_flags == required)
        .map(|idx| idx as u32)
}

/// A logical Vulkan device with one compute queue and its command pool.
///
/// The queue and the command pool are accessed without locking, so the
/// context is `Send` but `!Sync`. An `Arc<DeviceContext>`, and every
/// wrapper holding one, stays on the thread that created it.
///
/// ```compile_fail
/// fn require_sync<T: Sync>() {}
/// require_sync::<vkmem::device::DeviceContext>();
/// ```
///
/// ```compile_fail
/// fn share(ctx: std::sync::Arc<vkmem::device::DeviceContext>) {
///     let other = std::sync::Arc::clone(&ctx);
///     std::thread::spawn(move || {
///         let _ = vkmem::command::CommandBuffer::new(&other, None);
///     });
/// }
/// ```
pub struct DeviceContext {
    instance: Instance,
    handle: ash::Device,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    compute_queue: vk::Queue,
    compute_queue_family: u32,
    timestamp_valid_bits: u32,
    command_pool: vk::CommandPool,
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

// The whole context may move to another thread before any wrapper holds
// it. `!Sync` is checked by the `compile_fail` examples above.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for DeviceContext {}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("handle", &self.handle.handle())
            .field("compute_queue_family", &self.compute_queue_family)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.command_pool);
        // SAFETY: Every Buffer, Fence and CommandBuffer holds an Arc to this
        // context, so none of them can still be alive here. Destroying the
        // pool frees any command buffers still allocated from it.
        unsafe { self.handle.destroy_command_pool(self.command_pool, None) };

        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // SAFETY: The command pool above was the last child object.
        unsafe { self.handle.destroy_device(None) };
        // `instance` is dropped after this returns.
    }
}

impl DeviceContext {
    /// Connect to the driver and build the compute context.
    ///
    /// `validation` of `Some(level)` enables `VK_LAYER_KHRONOS_validation`
    /// and forwards its messages at `level` and above to `tracing`.
    ///
    /// Every failure is final. Anything created before the failing step
    /// is destroyed before this returns.
    ///
    /// # Safety
    /// Loads the system Vulkan library, see [`Instance::new`].
    pub unsafe fn new(
        validation: Option<VulkanLogLevel>,
    ) -> Result<Self, CreateContextError> {
        // SAFETY: Forwarded to the caller.
        let instance = unsafe { Instance::new("vkmembench", validation) }?;

        let physical_devices = instance.fetch_raw_physical_devices()?;
        let physical_device = select_physical_device(&physical_devices)?;

        // SAFETY: physical_device was derived from instance.
        let properties = unsafe {
            instance.get_raw_physical_device_properties(physical_device)
        };
        // SAFETY: physical_device was derived from instance.
        let queue_families = unsafe {
            instance.get_raw_physical_device_queue_family_properties(
                physical_device,
            )
        };
        // SAFETY: physical_device was derived from instance.
        let memory_properties = unsafe {
            instance.get_raw_physical_device_memory_properties(physical_device)
        };

        let compute_queue_family = find_compute_queue_family(&queue_families)
            .ok_or(CreateContextError::NoComputeQueue)?;
        let timestamp_valid_bits =
            queue_families[compute_queue_family as usize].timestamp_valid_bits;

        tracing::info!(
            "Selected physical device: {:?} (type: {:?}, api: {}, \
             timestamp period: {} ns)",
            properties.device_name_as_c_str().unwrap_or(c"unknown"),
            properties.device_type,
            crate::instance::VkVersion::from_raw(properties.api_version),
            properties.limits.timestamp_period,
        );
        tracing::info!(
            "Compute queue family: {} (timestamp valid bits: {})",
            compute_queue_family,
            timestamp_valid_bits
        );

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_queue_family)
            .queue_priorities(&queue_priorities);

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
            .host_query_reset(true)
            .buffer_device_address(true);
        let mut vulkan13_features =
            vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .push_next(&mut vulkan12_features)
            .push_next(&mut vulkan13_features);

        // SAFETY: physical_device was derived from instance;
        // device_create_info and its feature chain live until the call
        // returns.
        let device = unsafe {
            instance.create_ash_device(physical_device, &device_create_info)
        }
        .map_err(CreateContextError::DeviceCreation)?;

        // SAFETY: device was created with one queue in this family.
        let compute_queue =
            unsafe { device.get_device_queue(compute_queue_family, 0) };

        let command_pool_create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(compute_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: create_info uses the queue family the device was created
        // with.
        let command_pool = match unsafe {
            device.create_command_pool(&command_pool_create_info, None)
        } {
            Ok(pool) => pool,
            Err(e) => {
                // SAFETY: Nothing has been created from device yet.
                unsafe { device.destroy_device(None) };
                return Err(CreateContextError::CommandPoolCreation(e));
            }
        };

        let debug_utils_device =
            instance.create_debug_utils_device_loader(&device);

        Ok(Self {
            instance,
            handle: device,
            debug_utils_device,
            physical_device,
            properties,
            memory_properties,
            compute_queue,
            compute_queue_family,
            timestamp_valid_bits,
            command_pool,
            _not_sync: PhantomData,
        })
    }

    /// Create an unallocated buffer of exactly `size` bytes.
    pub fn create_buffer(
        self: &Arc<Self>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Buffer, CreateBufferError> {
        Buffer::new(self, size, usage, None)
    }

    /// Create an unsignaled fence.
    pub fn create_fence(self: &Arc<Self>) -> Result<Fence, CreateFenceError> {
        Fence::new(self, None)
    }

    /// See [`find_memory_type_index`].
    pub fn find_memory_type(
        &self,
        required: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        find_memory_type_index(&self.memory_properties, required)
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Nanoseconds per timestamp tick.
    pub fn timestamp_period(&self) -> f32 {
        self.properties.limits.timestamp_period
    }

    /// Meaningful low bits of timestamps written on the compute queue.
    /// Zero means the queue cannot write timestamps.
    pub fn timestamp_valid_bits(&self) -> u32 {
        self.timestamp_valid_bits
    }

    pub fn compute_queue_family(&self) -> u32 {
        self.compute_queue_family
    }

    pub fn raw_compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    /// Wait until all submitted work on this device has completed.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: `self.handle` is a valid logical device for the lifetime of
        // `self`, and this call has no additional pointer preconditions.
        unsafe { self.handle.device_wait_idle() }
    }
}

// Debug naming functionality
impl DeviceContext {
    /// Set a Vulkan debug name for an object owned by this device.
    ///
    /// A no-op when validation is off or `name` is `None`.
    ///
    /// # Safety
    /// `object` must be a valid Vulkan handle created from this device and
    /// must remain valid for the duration of the call.
    pub unsafe fn set_object_name<H>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let Some(debug_utils) = self.debug_utils_device.as_ref() else {
            return Ok(());
        };

        let Some(name) = name else {
            return Ok(());
        };

        let object_name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);

        // SAFETY: Caller guarantees object provenance and validity.
        unsafe { debug_utils.set_debug_utils_object_name(&object_name_info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// Convenience helper to set a name from UTF-8 text.
    ///
    /// # Safety
    /// Same contract as [`set_object_name`](Self::set_object_name).
    pub unsafe fn set_object_name_str<H>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        if self.debug_utils_device.is_none() {
            return Ok(());
        }
        let name = match name {
            Some(name) => {
                Some(CString::new(name).map_err(NameObjectError::InvalidName)?)
            }
            None => None,
        };

        // SAFETY: This method shares the same safety contract as
        // set_object_name.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }
}

// Buffer and memory functionality
impl DeviceContext {
    /// # Safety
    /// `create_info` must be valid. All referenced pointers must remain
    /// valid for the duration of the call.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference `buffer`.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Caller guarantees buffer provenance and drop ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` must be bound to memory and have been created with
    /// `SHADER_DEVICE_ADDRESS` usage.
    pub unsafe fn get_raw_buffer_device_address(
        &self,
        buffer: vk::Buffer,
    ) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        // SAFETY: Caller guarantees the buffer is bound and address-capable;
        // bufferDeviceAddress was enabled at device creation.
        unsafe { self.handle.get_buffer_device_address(&info) }
    }

    /// # Safety
    /// `allocate_info` must be valid and describe a memory type index
    /// supported by this device.
    pub unsafe fn allocate_raw_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        // SAFETY: Caller guarantees allocation info validity.
        unsafe { self.handle.allocate_memory(allocate_info, None) }
    }

    /// # Safety
    /// `memory` must be a valid handle created from this device and not yet
    /// freed. No in-flight GPU work may still use it.
    pub unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory provenance and drop ordering.
        unsafe { self.handle.free_memory(memory, None) };
    }

    /// # Safety
    /// `buffer` and `memory` must both be valid handles created from this
    /// device, and `buffer` must not already be bound.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `memory` must be a valid, host-visible, currently unmapped allocation
    /// from this device, and (`offset`, `size`) must lie within it.
    pub unsafe fn map_raw_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut std::ffi::c_void, vk::Result> {
        // SAFETY: Caller guarantees mapping preconditions.
        unsafe {
            self.handle.map_memory(
                memory,
                offset,
                size,
                vk::MemoryMapFlags::empty(),
            )
        }
    }

    /// # Safety
    /// `memory` must currently be mapped on this device.
    pub unsafe fn unmap_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory is currently mapped.
        unsafe { self.handle.unmap_memory(memory) };
    }
}

// Command buffer functionality
impl DeviceContext {
    /// Allocate one primary command buffer from the compute pool.
    ///
    /// # Safety
    /// Must not be called concurrently with any other use of the pool.
    pub unsafe fn allocate_raw_command_buffer(
        &self,
    ) -> Result<vk::CommandBuffer, vk::Result> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: allocate_info references the pool owned by self.
        let mut buffers =
            unsafe { self.handle.allocate_command_buffers(&allocate_info) }?;
        debug_assert_eq!(buffers.len(), 1);
        Ok(buffers.remove(0))
    }

    /// # Safety
    /// `command_buffer` must come from the compute pool and must not be
    /// pending execution.
    pub unsafe fn free_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) {
        // SAFETY: Caller guarantees provenance and idleness.
        unsafe {
            self.handle.free_command_buffers(
                self.command_pool,
                std::slice::from_ref(&command_buffer),
            )
        };
    }

    /// # Safety
    /// `command_buffer` must come from the compute pool and must not be
    /// pending execution.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees provenance and idleness; the pool was
        // created with RESET_COMMAND_BUFFER.
        unsafe {
            self.handle.reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )
        }
    }

    /// # Safety
    /// The buffer must be in the initial state.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees buffer state.
        unsafe {
            self.handle
                .begin_command_buffer(command_buffer, begin_info)
        }
    }

    /// # Safety
    /// The buffer must be in the recording state.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees buffer state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// Submit to the compute queue using the synchronization2 API.
    ///
    /// # Safety
    /// All handles in `submits` must be valid and derived from this device.
    /// Command buffers must be executable. `fence`, when not null, must be an
    /// unsignaled fence created from this device. No other thread may use
    /// the compute queue during the call.
    pub unsafe fn compute_queue_submit2(
        &self,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees all handle validity and
        // synchronization state.
        unsafe {
            self.handle
                .queue_submit2(self.compute_queue, submits, fence)
        }
    }
}

// Recording commands
impl DeviceContext {
    /// # Safety
    /// `command_buffer` must be in the recording state. `src_buffer` and
    /// `dst_buffer` must be valid, bound, and carry TRANSFER_SRC /
    /// TRANSFER_DST usage. Regions must be in bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees command buffer state and copy region
        // validity.
        unsafe {
            self.handle.cmd_copy_buffer(
                command_buffer,
                src_buffer,
                dst_buffer,
                regions,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state and `query_pool`
    /// must hold at least `first_query + query_count` queries.
    pub unsafe fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        // SAFETY: Caller guarantees recording state and range validity.
        unsafe {
            self.handle.cmd_reset_query_pool(
                command_buffer,
                query_pool,
                first_query,
                query_count,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state and all handles in
    /// `dependency_info` must be valid.
    pub unsafe fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        // SAFETY: Caller guarantees recording state and dependency_info
        // validity.
        unsafe {
            self.handle
                .cmd_pipeline_barrier2(command_buffer, dependency_info)
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state, `query_pool` must be
    /// a timestamp pool and `query` must be reset before this executes.
    pub unsafe fn cmd_write_timestamp2(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags2,
        query_pool: vk::QueryPool,
        query: u32,
    ) {
        // SAFETY: Caller guarantees recording state and query validity.
        unsafe {
            self.handle.cmd_write_timestamp2(
                command_buffer,
                stage,
                query_pool,
                query,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state and `pipeline` must
    /// be a valid compute pipeline from this device.
    pub unsafe fn cmd_bind_compute_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: Caller guarantees recording state and pipeline validity.
        unsafe {
            self.handle.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state and the range must
    /// be declared in `layout`.
    pub unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    ) {
        // SAFETY: Caller guarantees recording state and range validity.
        unsafe {
            self.handle.cmd_push_constants(
                command_buffer,
                layout,
                stage_flags,
                offset,
                constants,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state with a compute
    /// pipeline bound and all its push constants set.
    pub unsafe fn cmd_dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    ) {
        // SAFETY: Caller guarantees recording and pipeline state.
        unsafe {
            self.handle.cmd_dispatch(
                command_buffer,
                group_count_x,
                group_count_y,
                group_count_z,
            )
        }
    }
}

// Fence functionality
impl DeviceContext {
    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must be a valid handle created from this device and not
    /// pending on any submission.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees fence provenance and drop ordering.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// All handles in `fences` must be valid fences created from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence handle validity.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// All handles in `fences` must be valid fences created from this device
    /// and must not be currently pending on any queue submission.
    pub unsafe fn reset_raw_fences(
        &self,
        fences: &[vk::Fence],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence handle validity and
        // non-pending state.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// # Safety
    /// `fence` must be a valid handle created from this device.
    pub unsafe fn get_raw_fence_status(
        &self,
        fence: vk::Fence,
    ) -> Result<bool, vk::Result> {
        // SAFETY: Caller guarantees fence provenance and validity.
        unsafe { self.handle.get_fence_status(fence) }
    }
}

// Query pool functionality
impl DeviceContext {
    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_query_pool(
        &self,
        create_info: &vk::QueryPoolCreateInfo<'_>,
    ) -> Result<vk::QueryPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_query_pool(create_info, None) }
    }

    /// # Safety
    /// `query_pool` must be valid and unused by pending GPU work.
    pub unsafe fn destroy_raw_query_pool(&self, query_pool: vk::QueryPool) {
        // SAFETY: Caller guarantees provenance and idleness.
        unsafe { self.handle.destroy_query_pool(query_pool, None) };
    }

    /// Read `data.len()` consecutive 64-bit results starting at
    /// `first_query`.
    ///
    /// # Safety
    /// `query_pool` must be valid and the range must be in bounds. With
    /// `WAIT` in `flags` every query in the range must eventually become
    /// available or this blocks forever.
    pub unsafe fn get_raw_query_pool_results(
        &self,
        query_pool: vk::QueryPool,
        first_query: u32,
        data: &mut [u64],
        flags: vk::QueryResultFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees pool validity and range.
        unsafe {
            self.handle.get_query_pool_results(
                query_pool,
                first_query,
                data,
                flags | vk::QueryResultFlags::TYPE_64,
            )
        }
    }
}

// Shader and pipeline functionality
impl DeviceContext {
    /// # Safety
    /// `create_info` must contain valid SPIR-V code.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `shader_module` must be a valid handle created from this device.
    pub unsafe fn destroy_raw_shader_module(
        &self,
        shader_module: vk::ShaderModule,
    ) {
        // SAFETY: Caller guarantees shader_module provenance.
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be valid and no pipeline still using it may be in use.
    pub unsafe fn destroy_raw_pipeline_layout(
        &self,
        layout: vk::PipelineLayout,
    ) {
        // SAFETY: Caller guarantees layout provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Create a single compute pipeline.
    ///
    /// # Safety
    /// `create_info` must reference a valid shader module and layout from
    /// this device.
    pub unsafe fn create_raw_compute_pipeline(
        &self,
        create_info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        let result = unsafe {
            self.handle.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        match result {
            Ok(mut pipelines) => Ok(pipelines.remove(0)),
            Err((pipelines, e)) => {
                for pipeline in pipelines {
                    if pipeline != vk::Pipeline::null() {
                        // SAFETY: pipeline was just created and is unused.
                        unsafe { self.handle.destroy_pipeline(pipeline, None) };
                    }
                }
                Err(e)
            }
        }
    }

    /// # Safety
    /// `pipeline` must be valid and not referenced by pending GPU work.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: Caller guarantees pipeline provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            timestamp_valid_bits: 64,
            ..Default::default()
        }
    }

    fn memory_properties(
        types: &[vk::MemoryPropertyFlags],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn compute_queue_flags_are_compute_and_transfer() {
        assert_eq!(
            COMPUTE_QUEUE_FLAGS,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER
        );
    }

    #[test]
    fn single_physical_device_is_selected() {
        let dev = vk::PhysicalDevice::from_raw(0x1234);
        assert_eq!(select_physical_device(&[dev]).unwrap(), dev);
    }

    #[test]
    fn zero_physical_devices_is_a_selection_error() {
        let err = select_physical_device(&[]).unwrap_err();
        assert!(matches!(
            err,
            CreateContextError::DeviceSelection { count: 0 }
        ));
    }

    #[test]
    fn two_physical_devices_is_a_selection_error() {
        let devs = [
            vk::PhysicalDevice::from_raw(1),
            vk::PhysicalDevice::from_raw(2),
        ];
        let err = select_physical_device(&devs).unwrap_err();
        assert!(matches!(
            err,
            CreateContextError::DeviceSelection { count: 2 }
        ));
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn exact_compute_transfer_family_is_found() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(find_compute_queue_family(&families), Some(1));
    }

    #[test]
    fn first_exact_family_wins() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(find_compute_queue_family(&families), Some(1));
    }

    #[test]
    fn superset_family_is_not_a_compute_queue() {
        let families = [family(
            vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER,
        )];
        assert_eq!(find_compute_queue_family(&families), None);

        let with_sparse = [family(
            vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER
                | vk::QueueFlags::SPARSE_BINDING,
        )];
        assert_eq!(find_compute_queue_family(&with_sparse), None);
    }

    #[test]
    fn compute_only_family_is_not_a_compute_queue() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert_eq!(find_compute_queue_family(&families), None);
    }

    #[test]
    fn memory_type_requires_equal_flags() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
            F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);
        assert_eq!(find_memory_type_index(&props, F::DEVICE_LOCAL), Some(0));
        assert_eq!(
            find_memory_type_index(&props, F::HOST_VISIBLE | F::HOST_COHERENT),
            Some(2)
        );
    }

    #[test]
    fn superset_memory_type_is_not_selected() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
        ]);
        assert_eq!(find_memory_type_index(&props, F::DEVICE_LOCAL), None);
        assert_eq!(
            find_memory_type_index(&props, F::HOST_VISIBLE | F::HOST_COHERENT),
            None
        );
    }

    #[test]
    fn memory_types_past_count_are_ignored() {
        use vk::MemoryPropertyFlags as F;
        let mut props = memory_properties(&[F::HOST_VISIBLE]);
        props.memory_types[1].property_flags = F::DEVICE_LOCAL;
        assert_eq!(find_memory_type_index(&props, F::DEVICE_LOCAL), None);
    }

    #[test]
    fn lowest_matching_memory_type_wins() {
        use vk::MemoryPropertyFlags as F;
        let props =
            memory_properties(&[F::HOST_VISIBLE, F::DEVICE_LOCAL, F::DEVICE_LOCAL]);
        assert_eq!(find_memory_type_index(&props, F::DEVICE_LOCAL), Some(1));
    }
}
