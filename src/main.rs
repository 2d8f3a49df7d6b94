// =============================================================================
// FRAME PACER - Demo application
// =============================================================================
//
// Opens a window and drives the frame loop with a clear pass.
//
// CONTROLS:
//   Escape  quit
//   F11     toggle borderless fullscreen
//
// The event loop polls continuously while rendering and wakes every 10ms
// while the window is minimized.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_pacer::clear_pass::ClearPass;
use frame_pacer::config::Config;
use frame_pacer::frame_loop::WindowEvents;
use frame_pacer::{FrameLoop, LoopState, VulkanDevice, WindowSource};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

const CONFIG_PATH: &str = "config.toml";

/// How often a minimized window checks whether it was restored.
const MINIMIZED_POLL: Duration = Duration::from_millis(10);

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml; errors are reported once logging is up
    let (config, load_error) = Config::load_or_default(CONFIG_PATH);

    init_logging(&config);
    log::info!("Starting frame pacer");
    match load_error {
        Some(e) => log::warn!("Failed to load {}: {:#}. Using defaults.", CONFIG_PATH, e),
        None => log::debug!("Config: {:?}", config),
    }
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging, piping to the configured file if enabled
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Frame Pacer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// WINDOW ADAPTER
// =============================================================================

/// Collects winit events between frame loop ticks.
struct WinitWindow {
    window: Arc<Window>,
    pending: WindowEvents,
}

impl WindowSource for WinitWindow {
    fn poll_events(&mut self) -> WindowEvents {
        std::mem::take(&mut self.pending)
    }

    fn drawable_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn is_minimized(&self) -> bool {
        self.window.is_minimized().unwrap_or(false)
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the frame loop (and with it the device and
/// surface) must go before the window.
struct App {
    config: Config,
    renderer: Option<FrameLoop<VulkanDevice>>,
    window: Option<WinitWindow>,
    content: ClearPass,
    is_fullscreen: bool,
    /// First fatal error; reported from `main` after the event loop exits.
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let content = ClearPass::new(config.graphics.clear_color);
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            window: None,
            content,
            is_fullscreen,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&self, window: &Arc<Window>) -> Result<FrameLoop<VulkanDevice>> {
        let device = VulkanDevice::new(&self.config, window.as_ref())?;
        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };

        FrameLoop::new(device, extent, self.config.frame_settings())
            .context("Failed to create frame loop")
    }

    /// Run one frame loop tick and pick the next control flow.
    fn step(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_mut()) else {
            return;
        };

        let frames_before = renderer.frame_number();
        match renderer.tick(window, &mut self.content) {
            Ok(LoopState::Stopped) => event_loop.exit(),
            Ok(LoopState::Minimized) => {
                event_loop.set_control_flow(ControlFlow::WaitUntil(Instant::now() + MINIMIZED_POLL));
            }
            Ok(_) => {
                event_loop.set_control_flow(ControlFlow::Poll);
                if renderer.frame_number() > frames_before {
                    self.update_fps();
                }
            }
            Err(e) => {
                log::error!("Fatal render error: {}", e);
                if let Err(e) = renderer.shutdown() {
                    log::error!("Teardown after fatal error failed: {}", e);
                }
                self.fatal = Some(anyhow::Error::new(e).context("Frame loop failed"));
                event_loop.exit();
            }
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window
                    .window
                    .set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn request_quit(&mut self) {
        if let Some(ref mut window) = self.window {
            window.pending.quit = true;
        }
    }

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
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// WINIT EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.fatal = Some(e.into());
                event_loop.exit();
                return;
            }
        };

        match self.init_renderer(&window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                log::error!("Failed to initialize renderer: {:?}", e);
                self.fatal = Some(e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(WinitWindow {
            window,
            pending: WindowEvents::default(),
        });
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested");
                self.request_quit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut window) = self.window {
                    window.pending.resized = true;
                }
            }

            WindowEvent::KeyboardInput { event, .. } if event.state.is_pressed() => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    match key {
                        KeyCode::Escape => {
                            log::info!("ESC pressed, exiting...");
                            self.request_quit();
                        }
                        KeyCode::F11 => self.toggle_fullscreen(),
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    /// Ticks run here rather than on redraw requests so a minimized window,
    /// which gets no redraws on some platforms, still sees quit and restore.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        self.step(event_loop);
    }
}
