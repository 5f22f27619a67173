// =============================================================================
// VULKAN MINECRAFT - Triangle renderer
// =============================================================================
//
// One window, one Vulkan context, one hardcoded triangle per frame.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (quit, redraw)                                │
// │    └── FrameLoop (wait -> acquire -> record/submit -> present)  │
// │          └── VulkanRenderer (device, swapchain, pipeline)       │
// │                └── TeardownStack (reverse-order destruction)    │
// └─────────────────────────────────────────────────────────────────┘
//
// LIFECYCLE:
// 1. Load config, init logging
// 2. Create window, build the Vulkan context (any failure is fatal)
// 3. Draw one frame per redraw until the window closes
// 4. Wait for device idle, tear down in reverse creation order
//
// =============================================================================

mod backend;
mod config;
mod frame;

use anyhow::{Context, Result};
use backend::VulkanRenderer;
use config::Config;
use frame::FrameLoop;
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, config_error) = Config::load();

    init_logging(&config)?;
    report_config(config_error.as_ref());
    log::info!("Starting Vulkan renderer");
    log::info!("Window: {}x{}", config.window.width, config.window.height);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Reported by anyhow on stderr with a non-zero exit status
    app.finish()
}

/// Initialize logging, optionally redirected into a file
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    // RUST_LOG overrides the default level
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file: {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

/// Log how the configuration was obtained. Returns whether defaults replaced
/// a broken config file.
fn report_config(error: Option<&anyhow::Error>) -> bool {
    match error {
        Some(e) => {
            log::warn!("Failed to load {}: {:#}. Using defaults.", config::CONFIG_PATH, e);
            true
        }
        None if std::path::Path::new(config::CONFIG_PATH).exists() => {
            log::info!("Loaded configuration from {}", config::CONFIG_PATH);
            false
        }
        None => {
            log::info!("{} not found, using defaults", config::CONFIG_PATH);
            false
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus the rendering context bound to it.
///
/// IMPORTANT: `frames` is declared before `window` so the renderer (and its
/// surface) is dropped before the window it was created from.
pub struct App {
    config: Config,

    frames: Option<FrameLoop<VulkanRenderer>>,
    window: Option<Arc<Window>>,

    /// First fatal error; ends the event loop
    fatal: Option<anyhow::Error>,
    resize_warned: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            frames: None,
            window: None,
            fatal: None,
            resize_warned: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    /// Wait for the GPU, then destroy the renderer before the window.
    fn shutdown(&mut self) {
        let Some(frames) = self.frames.take() else {
            return;
        };

        let result = frames
            .shutdown()
            .context("Failed to wait for device idle before teardown")
            .and_then(VulkanRenderer::destroy);

        if let Err(e) = result {
            log::error!("{:#}", e);
            self.fatal.get_or_insert(e);
        }

        let errors = backend::device::validation_error_count();
        if errors > 0 {
            log::warn!("{} validation error(s) reported during this run", errors);
        }
    }

    fn finish(mut self) -> Result<()> {
        self.shutdown();
        match self.fatal.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn draw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(frames) = self.frames.as_mut() else {
            return;
        };

        match frames.draw_frame() {
            Ok(_) => self.update_fps(),
            Err(e) => self.fail(event_loop, anyhow::Error::new(e).context("Frame rendering failed")),
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match VulkanRenderer::new(&window, &self.config) {
            Ok(renderer) => {
                let extent = renderer.extent();
                log::info!("Rendering at {}x{}", extent.width, extent.height);
                self.frames = Some(FrameLoop::new(renderer));
            }
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
            }
        }

        self.window = Some(window);
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            // The swapchain keeps its creation-time extent
            WindowEvent::Resized(size) => {
                if !self.resize_warned && self.frames.is_some() {
                    log::warn!(
                        "Window resized to {}x{}; swapchain recreation is not supported",
                        size.width,
                        size.height
                    );
                    self.resize_warned = true;
                }
            }

            WindowEvent::RedrawRequested => {
                if self.fatal.is_none() {
                    self.draw(event_loop);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws; the fence wait paces the loop.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn broken_config_is_reported_after_logging_starts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[debug\nshow_fps = ").unwrap();

        let (config, error) = Config::load_or_default(file.path());
        assert!(report_config(error.as_ref()));
        assert_eq!(config.window.title, "Vulkan Minecraft");
    }

    #[test]
    fn healthy_config_is_not_reported_as_broken() {
        assert!(!report_config(None));
    }
}
