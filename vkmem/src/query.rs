//! Device timestamp queries.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::DeviceContext;

#[derive(Debug, Error)]
pub enum CreateQueryPoolError {
    #[error("Vulkan error creating query pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum QueryResultsError {
    #[error(
        "Query range {first}..{end} is outside a pool of {count} queries",
        end = .first + .len
    )]
    OutOfRange { first: u32, len: u32, count: u32 },

    #[error("Vulkan error reading query results: {0}")]
    Vulkan(vk::Result),
}

/// Check that `len` queries starting at `first` fit in a pool of `count`.
pub(crate) fn check_query_range(
    first: u32,
    len: usize,
    count: u32,
) -> Result<(), QueryResultsError> {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    match first.checked_add(len) {
        Some(end) if end <= count => Ok(()),
        _ => Err(QueryResultsError::OutOfRange {
            first,
            len: len.min(u32::MAX - first),
            count,
        }),
    }
}

/// A pool of `TIMESTAMP` queries.
pub struct TimestampQueryPool {
    parent: Arc<DeviceContext>,
    handle: vk::QueryPool,
    count: u32,
}

impl std::fmt::Debug for TimestampQueryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampQueryPool")
            .field("handle", &self.handle)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl TimestampQueryPool {
    pub fn new(
        device: &Arc<DeviceContext>,
        count: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateQueryPoolError> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);

        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle = unsafe { device.create_raw_query_pool(&create_info) }
            .map_err(CreateQueryPoolError::Vulkan)?;

        // SAFETY: handle is a valid query pool created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name query pool {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            count,
        })
    }

    /// Fill `out` with 64-bit timestamps starting at query `first`,
    /// blocking until every one of them is available.
    ///
    /// Every query in the range must have been written by work that is
    /// submitted (or already complete), or this never returns.
    pub fn results(
        &self,
        first: u32,
        out: &mut [u64],
    ) -> Result<(), QueryResultsError> {
        check_query_range(first, out.len(), self.count)?;
        // SAFETY: handle is valid and the range was checked above.
        unsafe {
            self.parent.get_raw_query_pool_results(
                self.handle,
                first,
                out,
                vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(QueryResultsError::Vulkan)
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn raw_query_pool(&self) -> vk::QueryPool {
        self.handle
    }

    pub fn parent(&self) -> &Arc<DeviceContext> {
        &self.parent
    }
}

impl Drop for TimestampQueryPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping query pool {:?}", self.handle);
        // SAFETY: handle was created from parent and no GPU work may still
        // write to it.
        unsafe { self.parent.destroy_raw_query_pool(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_pool_is_in_range() {
        assert!(check_query_range(0, 2, 2).is_ok());
    }

    #[test]
    fn empty_range_at_end_is_in_range() {
        assert!(check_query_range(2, 0, 2).is_ok());
    }

    #[test]
    fn range_past_end_is_rejected() {
        let err = check_query_range(1, 2, 2).unwrap_err();
        assert!(matches!(
            err,
            QueryResultsError::OutOfRange {
                first: 1,
                len: 2,
                count: 2
            }
        ));
        assert_eq!(
            err.to_string(),
            "Query range 1..3 is outside a pool of 2 queries"
        );
    }

    #[test]
    fn overflowing_range_is_rejected() {
        assert!(check_query_range(u32::MAX, 1, 4).is_err());
    }
}
