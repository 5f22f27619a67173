// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Window surface creation
// - Physical device selection (first suitable, no ranking)
// - Logical device + graphics/present queue creation
//
// Destruction is registered on the caller's teardown stack as each handle is
// created, so nothing here implements Drop.

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use winit::window::Window;

use super::selection::{self, DeviceCandidate, QueueFamilySupport, ResolvedQueueFamilies};
use super::surface;
use super::teardown::{SetupStage, TeardownStack};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Validation errors reported through the debug messenger since startup
static VALIDATION_ERRORS: AtomicUsize = AtomicUsize::new(0);

pub fn validation_error_count() -> usize {
    VALIDATION_ERRORS.load(Ordering::Relaxed)
}

/// Device extensions every candidate GPU must support
pub fn required_device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

/// Instance, surface and device handles, immutable for the process lifetime
pub struct VulkanDevice {
    pub instance: ash::Instance,
    pub surface_loader: khr::Surface,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    pub queue_families: ResolvedQueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

impl VulkanDevice {
    /// Create instance, surface and logical device, in that order.
    ///
    /// # Arguments
    /// * `window` - OS window the surface is bound to; must outlive the device
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Request Vulkan validation layers
    pub fn new(
        window: &Window,
        app_name: &str,
        enable_validation: bool,
        teardown: &mut TeardownStack,
    ) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, window, app_name, enable_validation)
            .with_context(|| format!("Failed to create {}", SetupStage::Instance))?;
        {
            // The loader library must stay mapped until the instance is gone.
            let entry = entry.clone();
            let instance = instance.clone();
            teardown.push(SetupStage::Instance, move || {
                unsafe { instance.destroy_instance(None) };
                drop(entry);
            });
        }

        // Step 3: Route validation output into the log
        if enable_validation {
            Self::setup_debug_messenger(&entry, &instance, teardown)
                .with_context(|| format!("Failed to create {}", SetupStage::DebugMessenger))?;
        }

        // Step 4: Create surface
        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = unsafe { surface::create_surface(&entry, &instance, window) }
            .with_context(|| format!("Failed to create {}", SetupStage::Surface))?;
        {
            let surface_loader = surface_loader.clone();
            teardown.push(SetupStage::Surface, move || unsafe {
                surface_loader.destroy_surface(surface, None)
            });
        }

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!("Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy());
        log::info!("API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version));

        // Step 6: Create logical device
        let device = Self::create_logical_device(&instance, physical_device, queue_families)
            .with_context(|| format!("Failed to create {}", SetupStage::LogicalDevice))?;
        {
            let device = device.clone();
            teardown.push(SetupStage::LogicalDevice, move || unsafe {
                device.destroy_device(None)
            });
        }

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        log::info!(
            "Queues: graphics family {}, present family {}{}",
            queue_families.graphics,
            queue_families.present,
            if queue_families.is_shared() { " (shared)" } else { "" }
        );

        Ok(Self {
            instance,
            surface_loader,
            surface,
            physical_device,
            device,
            queue_families,
            graphics_queue,
            present_queue,
        })
    }

    fn create_instance(
        entry: &Entry,
        window: &Window,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        // Platform surface extensions, plus debug utils when validating
        let mut extensions: Vec<*const std::os::raw::c_char> = surface::required_extensions(window)?
            .into_iter()
            .map(CStr::as_ptr)
            .collect();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            Self::check_validation_layer_support(entry)?;
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        Ok(instance)
    }

    /// Requested layers that are unavailable are a fatal setup error.
    fn check_validation_layer_support(entry: &Entry) -> Result<()> {
        let available = entry.enumerate_instance_layer_properties()?;

        let found = available.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        });

        if !found {
            anyhow::bail!(
                "Validation layers requested, but {} is not available",
                VALIDATION_LAYER.to_string_lossy()
            );
        }

        Ok(())
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        teardown: &mut TeardownStack,
    ) -> Result<()> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
        }?;

        teardown.push(SetupStage::DebugMessenger, move || unsafe {
            debug_utils.destroy_debug_utils_messenger(messenger, None)
        });

        Ok(())
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, ResolvedQueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("Failed to find GPUs with Vulkan support");
        }

        let candidates = selection::usable_candidates(
            devices
                .into_iter()
                .map(|device| Self::describe(instance, surface_loader, surface, device)),
        );

        let required = required_device_extensions();
        let (index, families) = selection::pick_first_suitable(&candidates, &required)
            .context("Failed to find a suitable GPU")?;

        Ok((candidates[index].handle, families))
    }

    /// Query everything the selection predicate looks at for one device.
    fn describe(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<DeviceCandidate<vk::PhysicalDevice>> {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let family_props = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let queue_families = family_props
            .iter()
            .enumerate()
            .map(|(i, family)| {
                let present = unsafe {
                    surface_loader.get_physical_device_surface_support(device, i as u32, surface)
                }
                .with_context(|| format!("Failed to query present support on GPU '{}'", name))?;
                Ok(QueueFamilySupport {
                    graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                    present,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .with_context(|| format!("Failed to enumerate extensions of GPU '{}'", name))?
            .iter()
            .map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        let surface_format_count = unsafe {
            surface_loader.get_physical_device_surface_formats(device, surface)
        }
        .with_context(|| format!("Failed to query surface formats of GPU '{}'", name))?
        .len();
        let present_mode_count = unsafe {
            surface_loader.get_physical_device_surface_present_modes(device, surface)
        }
        .with_context(|| format!("Failed to query present modes of GPU '{}'", name))?
        .len();

        Ok(DeviceCandidate {
            handle: device,
            name,
            queue_families,
            extensions,
            surface_format_count,
            present_mode_count,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: ResolvedQueueFamilies,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = required_device_extensions().map(CStr::as_ptr);
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe {
            instance.create_device(physical_device, &create_info, None)
        }?;

        Ok(device)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        unsafe { self.device.device_wait_idle() }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            VALIDATION_ERRORS.fetch_add(1, Ordering::Relaxed);
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::trace!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
