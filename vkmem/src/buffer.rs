//! GPU buffers with one dedicated memory allocation each.
//!
//! A [`Buffer`] is created unallocated by
//! [`DeviceContext::create_buffer`]. [`allocate`](Buffer::allocate) picks
//! a memory type whose property flags equal the request, allocates exactly
//! `size` bytes with device-address capability and binds it at offset 0.
//! Host-visible buffers can then be [`mmap`](Buffer::mmap)ed and
//! [`munmap`](Buffer::munmap)ed.
//!
//! Allocating twice, mapping an unallocated or mapped buffer, and
//! unmapping a buffer that is not mapped are programming errors and
//! panic.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::DeviceContext;

/// Trait for types that expose a raw `VkBuffer` handle.
pub trait BufferHandle {
    fn raw_buffer(&self) -> vk::Buffer;
}

impl<T> BufferHandle for &T
where
    T: BufferHandle + ?Sized,
{
    fn raw_buffer(&self) -> vk::Buffer {
        (*self).raw_buffer()
    }
}

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Vulkan error creating buffer: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateBufferError {
    #[error("No memory type has property flags exactly {0:?}")]
    NoSuitableMemory(vk::MemoryPropertyFlags),

    #[error("Vulkan error allocating buffer memory: {0}")]
    Allocate(vk::Result),

    #[error("Vulkan error binding buffer memory: {0}")]
    Bind(vk::Result),
}

#[derive(Debug, Error)]
pub enum MapBufferError {
    #[error("Vulkan error mapping buffer memory: {0}")]
    Vulkan(vk::Result),

    #[error("Vulkan mapped buffer memory to a null pointer")]
    NullPointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryState {
    Unallocated,
    Bound(vk::DeviceMemory),
    Mapped(vk::DeviceMemory, NonNull<u8>),
}

impl MemoryState {
    fn memory(&self) -> Option<vk::DeviceMemory> {
        match *self {
            MemoryState::Unallocated => None,
            MemoryState::Bound(memory) | MemoryState::Mapped(memory, _) => {
                Some(memory)
            }
        }
    }

    fn assert_unallocated(&self) {
        assert!(
            matches!(self, MemoryState::Unallocated),
            "buffer memory is already allocated"
        );
    }

    fn assert_mappable(&self) -> vk::DeviceMemory {
        match *self {
            MemoryState::Unallocated => {
                panic!("cannot map a buffer with no memory allocated")
            }
            MemoryState::Mapped(..) => panic!("buffer is already mapped"),
            MemoryState::Bound(memory) => memory,
        }
    }

    fn assert_mapped(&self) -> (vk::DeviceMemory, NonNull<u8>) {
        match *self {
            MemoryState::Mapped(memory, ptr) => (memory, ptr),
            _ => panic!("buffer is not mapped"),
        }
    }
}

/// A buffer and the one memory allocation that backs it.
pub struct Buffer {
    parent: Arc<DeviceContext>,
    handle: vk::Buffer,
    size: vk::DeviceSize,
    state: MemoryState,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    /// Create an unallocated buffer of exactly `size` bytes with exclusive
    /// sharing.
    ///
    /// `name` is an optional debug label. Naming failures are logged as
    /// warnings and do not cause the call to fail.
    pub fn new(
        device: &Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::Vulkan)?;

        // SAFETY: handle is a valid buffer created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name buffer {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            size,
            state: MemoryState::Unallocated,
        })
    }

    /// Allocate and bind dedicated memory whose property flags equal
    /// `properties`.
    ///
    /// On failure the buffer stays unallocated.
    ///
    /// # Panics
    /// If the buffer already has memory.
    pub fn allocate(
        &mut self,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<(), AllocateBufferError> {
        self.state.assert_unallocated();

        let memory_type_index = self
            .parent
            .find_memory_type(properties)
            .ok_or(AllocateBufferError::NoSuitableMemory(properties))?;

        // SAFETY: handle is a valid buffer created from parent.
        let reqs =
            unsafe { self.parent.get_raw_buffer_memory_requirements(self.handle) };
        if reqs.size != self.size {
            tracing::warn!(
                "Buffer {:?} reports {} bytes of required memory, \
                 allocating exactly {}",
                self.handle,
                reqs.size,
                self.size
            );
        }
        if reqs.memory_type_bits & (1 << memory_type_index) == 0 {
            tracing::warn!(
                "Memory type {} is not in buffer {:?} memory type bits {:#x}",
                memory_type_index,
                self.handle,
                reqs.memory_type_bits
            );
        }

        let mut flags_info = vk::MemoryAllocateFlagsInfo::default()
            .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(self.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut flags_info);

        // SAFETY: memory_type_index came from this device's memory
        // properties and flags_info outlives the call.
        let memory = unsafe { self.parent.allocate_raw_memory(&allocate_info) }
            .map_err(AllocateBufferError::Allocate)?;

        // SAFETY: handle and memory are valid, from this device, and the
        // buffer has never been bound.
        let bind_result =
            unsafe { self.parent.bind_raw_buffer_memory(self.handle, memory, 0) };
        if let Err(e) = bind_result {
            // SAFETY: memory was just allocated and nothing uses it.
            unsafe { self.parent.free_raw_memory(memory) };
            return Err(AllocateBufferError::Bind(e));
        }

        tracing::debug!(
            "Allocated {} bytes of memory type {} for buffer {:?}",
            self.size,
            memory_type_index,
            self.handle
        );
        self.state = MemoryState::Bound(memory);
        Ok(())
    }

    /// Map the whole allocation into host memory.
    ///
    /// The memory must have been allocated host-visible. With
    /// `HOST_COHERENT` memory writes through the returned slice need no
    /// flush.
    ///
    /// # Panics
    /// If the buffer has no memory or is already mapped.
    pub fn mmap(&mut self) -> Result<&mut [u8], MapBufferError> {
        let memory = self.state.assert_mappable();

        // SAFETY: memory is bound to this buffer, currently unmapped and the
        // range [0, size) lies inside the allocation.
        let ptr = unsafe { self.parent.map_raw_memory(memory, 0, self.size) }
            .map_err(MapBufferError::Vulkan)?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            // SAFETY: the map call above succeeded.
            unsafe { self.parent.unmap_raw_memory(memory) };
            MapBufferError::NullPointer
        })?;

        self.state = MemoryState::Mapped(memory, ptr);
        // SAFETY: ptr was just mapped for self.size bytes and stays valid
        // until munmap or drop, both of which need &mut self.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize)
        })
    }

    /// Release the host view.
    ///
    /// # Panics
    /// If the buffer is not mapped.
    pub fn munmap(&mut self) {
        let (memory, _) = self.state.assert_mapped();
        // SAFETY: memory is currently mapped.
        unsafe { self.parent.unmap_raw_memory(memory) };
        self.state = MemoryState::Bound(memory);
    }

    /// The mapped bytes, or `None` if the buffer is not mapped.
    pub fn mapped(&self) -> Option<&[u8]> {
        match self.state {
            // SAFETY: see mmap.
            MemoryState::Mapped(_, ptr) => Some(unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), self.size as usize)
            }),
            _ => None,
        }
    }

    pub fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        match self.state {
            // SAFETY: see mmap.
            MemoryState::Mapped(_, ptr) => Some(unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize)
            }),
            _ => None,
        }
    }

    /// The buffer's GPU address.
    ///
    /// # Panics
    /// If the buffer has no memory.
    ///
    /// # Safety
    /// The buffer must have been created with `SHADER_DEVICE_ADDRESS`
    /// usage.
    pub unsafe fn device_address(&self) -> vk::DeviceAddress {
        assert!(
            self.state.memory().is_some(),
            "buffer has no memory allocated"
        );
        // SAFETY: memory is bound; caller guarantees the usage flag.
        unsafe { self.parent.get_raw_buffer_device_address(self.handle) }
    }

    pub fn is_allocated(&self) -> bool {
        self.state.memory().is_some()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.state, MemoryState::Mapped(..))
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.handle
    }

    pub fn parent(&self) -> &Arc<DeviceContext> {
        &self.parent
    }
}

impl BufferHandle for Buffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.handle
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        if let Some(memory) = self.state.memory() {
            // SAFETY: memory is owned by this buffer alone; freeing mapped
            // memory implicitly unmaps it. No GPU work may still use it.
            unsafe { self.parent.free_raw_memory(memory) };
        }
        // SAFETY: handle was created from parent and is owned by this wrapper.
        unsafe { self.parent.destroy_raw_buffer(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn memory() -> vk::DeviceMemory {
        vk::DeviceMemory::from_raw(0xabcd)
    }

    #[test]
    fn unallocated_has_no_memory() {
        assert_eq!(MemoryState::Unallocated.memory(), None);
        MemoryState::Unallocated.assert_unallocated();
    }

    #[test]
    fn bound_and_mapped_report_memory() {
        let mut byte = 0u8;
        let ptr = NonNull::from(&mut byte);
        assert_eq!(MemoryState::Bound(memory()).memory(), Some(memory()));
        assert_eq!(
            MemoryState::Mapped(memory(), ptr).memory(),
            Some(memory())
        );
    }

    #[test]
    fn bound_memory_is_mappable() {
        assert_eq!(MemoryState::Bound(memory()).assert_mappable(), memory());
    }

    #[test]
    #[should_panic(expected = "already allocated")]
    fn allocating_twice_panics() {
        MemoryState::Bound(memory()).assert_unallocated();
    }

    #[test]
    #[should_panic(expected = "no memory allocated")]
    fn mapping_unallocated_panics() {
        MemoryState::Unallocated.assert_mappable();
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn mapping_twice_panics() {
        let mut byte = 0u8;
        MemoryState::Mapped(memory(), NonNull::from(&mut byte))
            .assert_mappable();
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn unmapping_bound_panics() {
        MemoryState::Bound(memory()).assert_mapped();
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn unmapping_unallocated_panics() {
        MemoryState::Unallocated.assert_mapped();
    }

    #[test]
    fn no_suitable_memory_names_the_flags() {
        let err = AllocateBufferError::NoSuitableMemory(
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        let msg = err.to_string();
        assert!(msg.contains("HOST_VISIBLE"), "{msg}");
        assert!(msg.contains("HOST_COHERENT"), "{msg}");
    }
}
