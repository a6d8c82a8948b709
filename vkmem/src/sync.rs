use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::DeviceContext;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("vkCreateFence failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("vkWaitForFences failed: {0}")]
    Vulkan(vk::Result),
    #[error("Fence has no submission to wait for")]
    NotSubmitted,
    #[error(transparent)]
    Reset(#[from] ResetFenceError),
}

#[derive(Debug, Error)]
pub enum ResetFenceError {
    #[error("vkResetFences failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum MarkSubmittedError {
    #[error("Fence is still in use by an earlier submission")]
    AlreadySubmitted,
}

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceStatus {
    /// Unsignaled and free to hand to a submission.
    Ready,
    /// Handed to a submission whose completion has not been observed.
    Submitted,
    /// Completion observed by a successful wait.
    Signaled,
}

impl FenceStatus {
    fn mark_submitted(self) -> Result<Self, MarkSubmittedError> {
        match self {
            FenceStatus::Ready => Ok(FenceStatus::Submitted),
            _ => Err(MarkSubmittedError::AlreadySubmitted),
        }
    }

    fn assert_resettable(self) {
        assert!(
            self != FenceStatus::Submitted,
            "fence reset while its submission may still be pending"
        );
    }
}

/// An owned binary fence used for CPU-GPU synchronisation.
///
/// Starts unsignaled. After a submission, [`wait`](Self::wait) blocks with
/// no timeout until the GPU signals it, then [`reset`](Self::reset)
/// returns it to the unsignaled state for the next submission.
pub struct Fence {
    parent: Arc<DeviceContext>,
    handle: vk::Fence,
    status: FenceStatus,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create an unsignaled fence.
    ///
    /// `name` is an optional debug label. Naming failures are logged as
    /// warnings and do not cause the call to fail.
    pub fn new(
        device: &Arc<DeviceContext>,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let create_info = vk::FenceCreateInfo::default();

        // SAFETY: Default create info, unsignaled, no p_next chain.
        let handle = unsafe { device.create_raw_fence(&create_info) }
            .map_err(CreateFenceError::Vulkan)?;

        // SAFETY: handle was just created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Could not name fence {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            status: FenceStatus::Ready,
        })
    }

    /// Block until the fence is signaled. There is no timeout.
    ///
    /// Returns immediately if a previous wait already observed the signal.
    pub fn wait(&mut self) -> Result<(), WaitFenceError> {
        match self.status {
            FenceStatus::Ready => Err(WaitFenceError::NotSubmitted),
            FenceStatus::Signaled => Ok(()),
            FenceStatus::Submitted => {
                // SAFETY: handle belongs to parent and a submission will
                // signal it.
                unsafe {
                    self.parent.wait_for_raw_fences(
                        &[self.handle],
                        true,
                        u64::MAX,
                    )
                }
                .map_err(WaitFenceError::Vulkan)?;
                self.status = FenceStatus::Signaled;
                Ok(())
            }
        }
    }

    /// Return the fence to the unsignaled state.
    ///
    /// # Panics
    /// If the fence was submitted and no wait has observed its signal yet.
    pub fn reset(&mut self) -> Result<(), ResetFenceError> {
        self.status.assert_resettable();
        // SAFETY: the status check above means no submission can still be
        // pending on this fence.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }
            .map_err(ResetFenceError::Vulkan)?;
        self.status = FenceStatus::Ready;
        Ok(())
    }

    /// Wait for the fence and then immediately reset it.
    pub fn wait_and_reset(&mut self) -> Result<(), WaitFenceError> {
        self.wait()?;
        self.reset()?;
        Ok(())
    }

    /// Record that a queue submission will signal this fence.
    ///
    /// # Safety
    /// The fence must really have been handed to a successful submission,
    /// otherwise [`wait`](Self::wait) blocks forever.
    pub unsafe fn mark_submitted(&mut self) -> Result<(), MarkSubmittedError> {
        self.status = self.status.mark_submitted()?;
        Ok(())
    }

    /// Poll the driver for the fence state without blocking.
    pub fn is_signaled(&self) -> Result<bool, vk::Result> {
        // SAFETY: Status queries are valid in any fence state.
        unsafe { self.parent.get_raw_fence_status(self.handle) }
    }

    /// Is the fence in an unsignaled state where it can be submitted.
    pub fn is_ready(&self) -> bool {
        self.status == FenceStatus::Ready
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }

    pub fn parent(&self) -> &Arc<DeviceContext> {
        &self.parent
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        if self.status == FenceStatus::Submitted {
            tracing::warn!(
                "Fence {:?} dropped while its submission may be pending",
                self.handle
            );
        }
        // SAFETY: handle belongs to parent. A still-pending fence was
        // warned about above.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_fence_can_be_submitted() {
        assert_eq!(
            FenceStatus::Ready.mark_submitted().unwrap(),
            FenceStatus::Submitted
        );
    }

    #[test]
    fn submitted_fence_cannot_be_submitted_again() {
        assert!(matches!(
            FenceStatus::Submitted.mark_submitted(),
            Err(MarkSubmittedError::AlreadySubmitted)
        ));
    }

    #[test]
    fn signaled_fence_must_be_reset_before_resubmission() {
        assert!(FenceStatus::Signaled.mark_submitted().is_err());
    }

    #[test]
    fn signaled_and_ready_fences_are_resettable() {
        FenceStatus::Signaled.assert_resettable();
        FenceStatus::Ready.assert_resettable();
    }

    #[test]
    #[should_panic(expected = "may still be pending")]
    fn resetting_pending_fence_panics() {
        FenceStatus::Submitted.assert_resettable();
    }
}
