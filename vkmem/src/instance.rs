//! Loader and instance setup.
//!
//! [`Instance`] keeps the `ash::Entry` alive for as long as the
//! `VkInstance` exists and, when validation was requested and is
//! available, owns a debug messenger that routes layer output into
//! `tracing`. [`DeviceContext`](crate::device::DeviceContext) owns the
//! instance and destroys its logical device first.

use std::ffi::{CStr, CString, c_char};

use ash::vk;
use thiserror::Error;

use crate::log::VulkanLogLevel;

/// Oldest loader API the crate accepts. Device creation chains
/// `VkPhysicalDeviceVulkan13Features`.
pub const REQUIRED_API_VERSION: u32 = vk::API_VERSION_1_3;

pub const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Target every validation-layer message is logged under.
pub const DEBUG_MESSENGER_TARGET: &str = "vkmem-debug-messenger";

/// Packed `major.minor.patch` API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn major(self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(self) -> u32 {
        vk::api_version_patch(self.0)
    }

    /// Patch level is ignored.
    pub fn at_least(self, other: VkVersion) -> bool {
        (self.major(), self.minor()) >= (other.major(), other.minor())
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),
    #[error("Vulkan {found} is installed but {required} is required")]
    UnsupportedVersion { found: VkVersion, required: VkVersion },
    #[error("Application name contains a NUL byte")]
    InvalidAppName,
    #[error("Failed to enumerate instance extensions: {0}")]
    Extensions(vk::Result),
    #[error("vkCreateInstance failed: {0}")]
    Creation(vk::Result),
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Out of memory enumerating physical devices")]
    MemoryExhaustion,
    #[error("Vulkan error enumerating physical devices: {0}")]
    UnknownVulkan(vk::Result),
}

/// What the loader offers toward a validation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValidationPlan {
    Disabled,
    Enabled(VulkanLogLevel),
    /// Requested, but the layer or `VK_EXT_debug_utils` is missing.
    Unavailable { layer: bool, debug_utils: bool },
}

pub(crate) fn plan_validation(
    requested: Option<VulkanLogLevel>,
    layer: bool,
    debug_utils: bool,
) -> ValidationPlan {
    match requested {
        None => ValidationPlan::Disabled,
        Some(level) if layer && debug_utils => ValidationPlan::Enabled(level),
        Some(_) => ValidationPlan::Unavailable { layer, debug_utils },
    }
}

fn message_kind(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    use vk::DebugUtilsMessageTypeFlagsEXT as T;
    if message_type.contains(T::VALIDATION) {
        "validation"
    } else if message_type.contains(T::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

unsafe extern "system" fn debug_messenger_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;

    // SAFETY: The loader passes callback data that is valid for the
    // duration of the call. Either pointer may still be null.
    let message = unsafe {
        p_callback_data
            .as_ref()
            .filter(|data| !data.p_message.is_null())
            .map(|data| CStr::from_ptr(data.p_message).to_string_lossy())
    }
    .unwrap_or_default();
    let kind = message_kind(message_type);

    if severity.contains(S::ERROR) {
        tracing::error!(target: DEBUG_MESSENGER_TARGET, kind, "{message}");
    } else if severity.contains(S::WARNING) {
        tracing::warn!(target: DEBUG_MESSENGER_TARGET, kind, "{message}");
    } else if severity.contains(S::INFO) {
        tracing::info!(target: DEBUG_MESSENGER_TARGET, kind, "{message}");
    } else {
        tracing::trace!(target: DEBUG_MESSENGER_TARGET, kind, "{message}");
    }

    vk::FALSE
}

fn messenger_create_info(
    level: VulkanLogLevel,
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(level.message_severity())
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_messenger_callback))
}

/// A `VkInstance` plus the loader it came from.
pub struct Instance {
    // Must outlive `handle`.
    _entry: ash::Entry,
    handle: ash::Instance,
    messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    loader_version: VkVersion,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("loader_version", &self.loader_version)
            .field("validation", &self.messenger.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some((loader, messenger)) = self.messenger.take() {
            tracing::debug!("Dropping debug messenger {:?}", messenger);
            // SAFETY: The messenger was created from this instance and
            // nothing else holds it.
            unsafe { loader.destroy_debug_utils_messenger(messenger, None) };
        }
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        // SAFETY: The owning DeviceContext has already destroyed the logical
        // device, so the instance has no children left.
        unsafe { self.handle.destroy_instance(None) };
    }
}

impl Instance {
    /// Load the system Vulkan library and create an instance.
    ///
    /// With `validation` set, the Khronos validation layer and a debug
    /// messenger at that severity are requested. If either is missing the
    /// instance is still created, without them, and a warning is logged.
    ///
    /// # Safety
    /// Loading Vulkan runs arbitrary code from the system loader and any
    /// implicit layers inside this process.
    pub unsafe fn new(
        app_name: &str,
        validation: Option<VulkanLogLevel>,
    ) -> Result<Self, InstanceCreationError> {
        let app_name =
            CString::new(app_name).map_err(|_| InstanceCreationError::InvalidAppName)?;

        // SAFETY: Forwarded to the caller.
        let entry = unsafe { ash::Entry::load() }?;

        // SAFETY: entry holds a loaded library; the query has no other
        // preconditions.
        let loader_version = match unsafe { entry.try_enumerate_instance_version() } {
            Ok(Some(version)) => VkVersion::from_raw(version),
            // A 1.0 loader does not export the query at all.
            Ok(None) | Err(_) => VkVersion::from_raw(vk::API_VERSION_1_0),
        };
        let required = VkVersion::from_raw(REQUIRED_API_VERSION);
        if !loader_version.at_least(required) {
            return Err(InstanceCreationError::UnsupportedVersion {
                found: loader_version,
                required,
            });
        }

        let plan = if validation.is_some() {
            // SAFETY: entry holds a loaded library.
            let extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
                .map_err(InstanceCreationError::Extensions)?;
            // SAFETY: entry holds a loaded library. A failure here only means
            // the layer cannot be found.
            let layers = unsafe { entry.enumerate_instance_layer_properties() }
                .unwrap_or_default();

            let debug_utils = extensions.iter().any(|ext| {
                ext.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME)
            });
            let layer = layers
                .iter()
                .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER_NAME));
            plan_validation(validation, layer, debug_utils)
        } else {
            ValidationPlan::Disabled
        };

        let mut extension_names: Vec<*const c_char> = Vec::new();
        let mut layer_names: Vec<*const c_char> = Vec::new();
        let mut messenger_info = match plan {
            ValidationPlan::Enabled(level) => {
                extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
                layer_names.push(VALIDATION_LAYER_NAME.as_ptr());
                Some(messenger_create_info(level))
            }
            ValidationPlan::Unavailable { layer, debug_utils } => {
                tracing::warn!(
                    layer,
                    debug_utils,
                    "Validation was requested but is not installed, continuing without it"
                );
                None
            }
            ValidationPlan::Disabled => None,
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vkmem")
            .api_version(REQUIRED_API_VERSION);

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);
        // Chaining the messenger info also reports problems inside
        // vkCreateInstance itself.
        if let Some(info) = messenger_info.as_mut() {
            create_info = create_info.push_next(info);
        }

        // SAFETY: create_info and everything it points to live until the call
        // returns.
        let handle = unsafe { entry.create_instance(&create_info, None) }
            .map_err(InstanceCreationError::Creation)?;

        let messenger = messenger_info.and_then(|info| {
            let info = messenger_create_info_from(info);
            let loader = ash::ext::debug_utils::Instance::new(&entry, &handle);
            // SAFETY: debug_utils is enabled on handle; info has an empty
            // p_next chain.
            match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    tracing::warn!("Failed to create debug messenger: {e}");
                    None
                }
            }
        });

        tracing::debug!(
            "Created instance {:?} (loader {}, validation {})",
            handle.handle(),
            loader_version,
            messenger.is_some()
        );

        Ok(Self {
            _entry: entry,
            handle,
            messenger,
            loader_version,
        })
    }

    /// Physical devices visible through this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: handle is a live instance.
        unsafe { self.handle.enumerate_physical_devices() }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                FetchPhysicalDeviceError::MemoryExhaustion
            }
            e => FetchPhysicalDeviceError::UnknownVulkan(e),
        })
    }

    /// # Safety
    /// `physical_device` must come from [`fetch_raw_physical_devices`](Self::fetch_raw_physical_devices).
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must come from [`fetch_raw_physical_devices`](Self::fetch_raw_physical_devices).
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.handle.get_physical_device_queue_family_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must come from [`fetch_raw_physical_devices`](Self::fetch_raw_physical_devices).
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.handle.get_physical_device_memory_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must come from this instance and the `p_next`
    /// chain of `create_info` must stay valid for the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: Caller guarantees provenance and create_info validity.
        unsafe { self.handle.create_device(physical_device, create_info, None) }
    }

    /// Object-naming entry points for `device`. `None` unless the debug
    /// messenger, and with it `VK_EXT_debug_utils`, is active.
    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.messenger
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&self.handle, device))
    }

    pub fn has_validation(&self) -> bool {
        self.messenger.is_some()
    }

    pub fn loader_version(&self) -> VkVersion {
        self.loader_version
    }

    pub fn raw_instance(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }
}

/// Copy of a messenger create info that was chained into instance creation,
/// detached from that chain.
fn messenger_create_info_from(
    info: vk::DebugUtilsMessengerCreateInfoEXT<'_>,
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(info.message_severity)
        .message_type(info.message_type)
        .pfn_user_callback(info.pfn_user_callback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_fields_unpack() {
        let version = VkVersion::from_raw(vk::make_api_version(0, 1, 3, 275));
        assert_eq!((version.major(), version.minor(), version.patch()), (1, 3, 275));
        assert_eq!(version.to_string(), "1.3.275");
    }

    #[test]
    fn at_least_ignores_patch() {
        let required = VkVersion::from_raw(REQUIRED_API_VERSION);
        assert!(VkVersion::from_raw(vk::make_api_version(0, 1, 3, 0)).at_least(required));
        assert!(VkVersion::from_raw(vk::make_api_version(0, 1, 4, 0)).at_least(required));
        assert!(!VkVersion::from_raw(vk::make_api_version(0, 1, 2, 999)).at_least(required));
    }

    #[test]
    fn validation_off_unless_requested() {
        assert_eq!(plan_validation(None, true, true), ValidationPlan::Disabled);
    }

    #[test]
    fn validation_needs_layer_and_debug_utils() {
        assert_eq!(
            plan_validation(Some(VulkanLogLevel::Warning), true, true),
            ValidationPlan::Enabled(VulkanLogLevel::Warning)
        );
        assert_eq!(
            plan_validation(Some(VulkanLogLevel::Error), false, true),
            ValidationPlan::Unavailable {
                layer: false,
                debug_utils: true
            }
        );
        assert_eq!(
            plan_validation(Some(VulkanLogLevel::Error), true, false),
            ValidationPlan::Unavailable {
                layer: true,
                debug_utils: false
            }
        );
    }

    #[test]
    fn message_kind_prefers_validation() {
        use vk::DebugUtilsMessageTypeFlagsEXT as T;
        assert_eq!(message_kind(T::VALIDATION | T::PERFORMANCE), "validation");
        assert_eq!(message_kind(T::PERFORMANCE), "performance");
        assert_eq!(message_kind(T::GENERAL), "general");
    }

    #[test]
    fn detached_messenger_info_has_no_chain() {
        let mut chained = messenger_create_info(VulkanLogLevel::Info);
        let mut next = vk::ValidationFeaturesEXT::default();
        chained.p_next = std::ptr::from_mut(&mut next).cast::<std::ffi::c_void>();
        let detached = messenger_create_info_from(chained);
        assert!(detached.p_next.is_null());
        assert_eq!(detached.message_severity, chained.message_severity);
        assert!(detached.pfn_user_callback.is_some());
    }
}
