/// Minimum severity of validation-layer messages forwarded to `tracing`.
///
/// Passing `Some(level)` to [`DeviceContext::new`](crate::device::DeviceContext::new)
/// also turns the validation layer on. Variants are ordered
/// least-to-most severe.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl VulkanLogLevel {
    pub(crate) fn message_severity(
        self,
    ) -> ash::vk::DebugUtilsMessageSeverityFlagsEXT {
        use ash::vk::DebugUtilsMessageSeverityFlagsEXT as S;
        match self {
            VulkanLogLevel::Verbose => {
                S::VERBOSE | S::INFO | S::WARNING | S::ERROR
            }
            VulkanLogLevel::Info => S::INFO | S::WARNING | S::ERROR,
            VulkanLogLevel::Warning => S::WARNING | S::ERROR,
            VulkanLogLevel::Error => S::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::DebugUtilsMessageSeverityFlagsEXT as S;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(VulkanLogLevel::Verbose < VulkanLogLevel::Info);
        assert!(VulkanLogLevel::Info < VulkanLogLevel::Warning);
        assert!(VulkanLogLevel::Warning < VulkanLogLevel::Error);
    }

    #[test]
    fn severity_mask_includes_everything_above_level() {
        let warning = VulkanLogLevel::Warning.message_severity();
        assert!(warning.contains(S::WARNING | S::ERROR));
        assert!(!warning.contains(S::INFO));

        assert_eq!(VulkanLogLevel::Error.message_severity(), S::ERROR);
        assert!(VulkanLogLevel::Verbose.message_severity().contains(S::VERBOSE));
    }
}
