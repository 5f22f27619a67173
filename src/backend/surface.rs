// Window surface - platform-specific window connection
//
// Maps raw-window-handle handles onto the matching VK_KHR_*_surface
// extension. Supported: Win32, Xlib, Xcb, Wayland.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use winit::window::Window;

/// Instance extensions needed to create a surface for this display.
pub fn required_extensions(window: &Window) -> Result<Vec<&'static CStr>> {
    let display = window
        .display_handle()
        .context("Failed to get display handle")?
        .as_raw();

    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => anyhow::bail!("Unsupported display handle: {:?}", other),
    };

    Ok(vec![khr::Surface::name(), platform])
}

/// Create a presentable surface bound to the OS window.
///
/// # Safety
/// The window must outlive the returned surface.
pub unsafe fn create_surface(
    entry: &ash::Entry,
    instance: &ash::Instance,
    window: &Window,
) -> Result<vk::SurfaceKHR> {
    let window_handle = window
        .window_handle()
        .context("Failed to get window handle")?
        .as_raw();
    let display_handle = window
        .display_handle()
        .context("Failed to get display handle")?
        .as_raw();

    let surface = match (display_handle, window_handle) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .context("Xlib display handle has no display pointer")?
                .as_ptr();
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.cast())
                .window(handle.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)?
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display
                .connection
                .context("Xcb display handle has no connection")?
                .as_ptr();
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.cast())
                .window(handle.window.get());
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)?
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr().cast())
                .surface(handle.surface.as_ptr().cast());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)?
        }
        (display, window) => {
            anyhow::bail!("Unsupported window handle pair: {:?} / {:?}", display, window)
        }
    };

    Ok(surface)
}
