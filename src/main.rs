// =============================================================================
// FRAME CORE DEMO - Window on the main thread, frames on a render thread
// =============================================================================
//
// The main thread owns the winit event loop and forwards resize / close to
// the render thread through a mutex + condvar. The render thread owns the
// GpuContext and is the only thread that touches GPU state.
//
// FRAME FLOW (render thread):
// 1. acquire_next_image  (waits on the slot fence, rebuilds if resized)
// 2. write this slot's uniform buffer, build this slot's descriptor set
// 3. record: clear the image, transition it for present
// 4. submit_and_reset_fence
// 5. present             (rebuilds if the surface went stale)
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_core::backend::buffer::GpuBuffer;
use frame_core::{
    Config, DeviceRequirements, FrameSettings, GpuContext, SurfaceWindow, Submission, Swapchain,
    VulkanDevice,
};
use parking_lot::{Condvar, Mutex};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop, EventLoopProxy},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config);

    log::info!("Starting frame core demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, {} frames in flight",
        config.graphics.present_mode,
        config.graphics.frames_in_flight
    );

    let event_loop = EventLoop::<UserEvent>::with_user_event().build()?;
    event_loop.set_control_flow(ControlFlow::Wait);
    let mut app = App::new(config, event_loop.create_proxy());
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Level from config; RUST_LOG still wins when set
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.debug.level_filter())
        .parse_default_env()
        .init();
}

// =============================================================================
// MAIN THREAD <-> RENDER THREAD
// =============================================================================

/// Sent from the render thread to the event loop
#[derive(Debug)]
enum UserEvent {
    Fps { fps: f32, frame_ms: f32 },
    RenderExited,
}

struct WindowState {
    extent: vk::Extent2D,
    closing: bool,
    /// Bumped on every change so waiters can tell a real update from a spurious wakeup
    generation: u64,
}

struct Shared {
    state: Mutex<WindowState>,
    changed: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(WindowState {
                extent: vk::Extent2D::default(),
                closing: false,
                generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut WindowState)) {
        let mut state = self.state.lock();
        f(&mut state);
        state.generation += 1;
        self.changed.notify_all();
    }

    fn is_closing(&self) -> bool {
        self.state.lock().closing
    }
}

/// The window as the render thread sees it
struct WinitSurface {
    shared: Arc<Shared>,
}

impl SurfaceWindow for WinitSurface {
    fn extent(&self) -> vk::Extent2D {
        self.shared.state.lock().extent
    }

    fn wait_events(&self) {
        let mut state = self.shared.state.lock();
        let seen = state.generation;
        while state.generation == seen && !state.closing {
            self.shared.changed.wait(&mut state);
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closing()
    }
}

// =============================================================================
// RENDER THREAD
// =============================================================================

struct RenderOptions {
    settings: FrameSettings,
    clear_color: [f32; 4],
    show_fps: bool,
}

/// Per-slot uniform data; only bound, no shader reads it yet
#[repr(C)]
#[derive(Clone, Copy)]
struct FrameUniforms {
    clear_color: [f32; 4],
    time: f32,
    frame: u32,
    _pad: [u32; 2],
}

struct FpsCounter {
    frame_count: u32,
    last_update: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frame_count: 0,
            last_update: now,
            last_frame: now,
        }
    }

    /// `(fps, frame_ms)` once per second
    fn tick(&mut self) -> Option<(f32, f32)> {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_update).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }
        let fps = self.frame_count as f32 / elapsed;
        self.frame_count = 0;
        self.last_update = now;
        Some((fps, frame_time * 1000.0))
    }
}

fn render_thread(
    device: Arc<VulkanDevice>,
    shared: Arc<Shared>,
    options: RenderOptions,
    proxy: EventLoopProxy<UserEvent>,
) {
    if let Err(e) = run_renderer(device, &shared, &options, &proxy) {
        if shared.is_closing() {
            log::info!("Renderer stopped during shutdown: {:#}", e);
        } else {
            log::error!("Renderer failed: {:#}", e);
        }
    }
    if proxy.send_event(UserEvent::RenderExited).is_err() {
        log::debug!("Event loop already gone");
    }
}

fn run_renderer(
    device: Arc<VulkanDevice>,
    shared: &Arc<Shared>,
    options: &RenderOptions,
    proxy: &EventLoopProxy<UserEvent>,
) -> Result<()> {
    let mut ctx = GpuContext::new(
        device.clone(),
        Box::new(WinitSurface {
            shared: shared.clone(),
        }),
        options.settings,
    )?;

    ctx.register_after_rebuild(
        "demo",
        Box::new(|swapchain: &Swapchain| {
            log::info!(
                "Rendering at {}x{}",
                swapchain.extent.width,
                swapchain.extent.height
            );
        }),
    );

    // One uniform buffer per slot: a slot's buffer is only rewritten after
    // its fence has signaled in acquire_next_image
    let mut uniforms = (0..ctx.frames_in_flight())
        .map(|slot| {
            GpuBuffer::uniform(
                device.clone(),
                &format!("frame uniforms {}", slot),
                std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let set_layout = ctx
        .persistent_descriptor_factory()
        .bind_buffer(
            0,
            uniforms[0].descriptor_info(),
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::FRAGMENT,
        )
        .build_layout()?;
    let set_layouts = [set_layout];
    let pipeline_layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    let pipeline_layout = unsafe {
        device
            .device
            .create_pipeline_layout(&pipeline_layout_info, None)
            .context("Failed to create pipeline layout")?
    };
    let layout_device = device.clone();
    ctx.push_deletion(move || unsafe {
        layout_device
            .device
            .destroy_pipeline_layout(pipeline_layout, None)
    });

    let result = render_loop(
        &mut ctx,
        &device,
        &mut uniforms,
        pipeline_layout,
        shared,
        options,
        proxy,
    );

    let stats = ctx.stats();
    log::info!(
        "Rendered {} frames, {} rebuilds, {} layouts ({} cache hits), {} descriptor pools, {} fences",
        stats.frames_presented,
        stats.rebuilds,
        stats.layouts,
        stats.layout_cache_hits,
        stats.descriptor_pools,
        stats.fences_created
    );

    // Freed after the context has waited for the device
    ctx.push_deletion(move || drop(uniforms));
    drop(ctx);
    result
}

fn render_loop(
    ctx: &mut GpuContext,
    device: &VulkanDevice,
    uniforms: &mut [GpuBuffer],
    pipeline_layout: vk::PipelineLayout,
    shared: &Shared,
    options: &RenderOptions,
    proxy: &EventLoopProxy<UserEvent>,
) -> Result<()> {
    let started = Instant::now();
    let mut fps = FpsCounter::new();
    let mut frame: u32 = 0;

    while !shared.is_closing() {
        let image_index = ctx.acquire_next_image()?;
        let slot = ctx.frame_index();

        uniforms[slot].write(&[FrameUniforms {
            clear_color: options.clear_color,
            time: started.elapsed().as_secs_f32(),
            frame,
            _pad: [0; 2],
        }])?;
        let buffer_info = uniforms[slot].descriptor_info();

        // Same bindings as the pipeline layout's set, so the cache returns that handle
        let descriptor_set = ctx
            .descriptor_factory_begin(slot)?
            .bind_buffer(
                0,
                buffer_info,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .build()?
            .map(|(set, _)| set);
        if descriptor_set.is_none() {
            log::warn!("No descriptor set this frame, drawing without it");
        }

        let command_buffer = ctx
            .image_command_buffer(image_index)
            .context("No command buffer for acquired image")?;
        let image = ctx.swapchain().images[image_index as usize];
        record_clear(
            &device.device,
            command_buffer,
            image,
            options.clear_color,
            pipeline_layout,
            descriptor_set,
        )?;

        ctx.submit_and_reset_fence(&Submission::new(&[command_buffer]))?;
        ctx.present()?;
        frame = frame.wrapping_add(1);

        if options.show_fps {
            if let Some((fps, frame_ms)) = fps.tick() {
                if proxy.send_event(UserEvent::Fps { fps, frame_ms }).is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Clear `image` to `color` and leave it ready for present
fn record_clear(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    color: [f32; 4],
    pipeline_layout: vk::PipelineLayout,
    descriptor_set: Option<vk::DescriptorSet>,
) -> Result<()> {
    let clear_color = vk::ClearColorValue { float32: color };
    let subresource_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    unsafe {
        // Pool is resettable, begin resets implicitly
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin command buffer")?;

        if let Some(set) = descriptor_set {
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &[set],
                &[],
            );
        }

        // UNDEFINED -> TRANSFER_DST: old contents are discarded
        let barrier_to_transfer = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range)
            .build();

        // COLOR_ATTACHMENT_OUTPUT matches the submit wait stage, so the
        // layout change happens after the image is actually acquired
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_to_transfer],
        );

        device.cmd_clear_color_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear_color,
            &[subresource_range],
        );

        let barrier_to_present = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range)
            .build();

        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier_to_present],
        );

        device
            .end_command_buffer(cmd)
            .context("Failed to end command buffer")?;
    }

    Ok(())
}

// =============================================================================
// APPLICATION (main thread)
// =============================================================================

struct App {
    config: Config,
    proxy: EventLoopProxy<UserEvent>,
    shared: Arc<Shared>,
    render_thread: Option<JoinHandle<()>>,
    // Dropped after the render thread has been joined (see Drop)
    window: Option<Window>,
    is_fullscreen: bool,
}

impl App {
    fn new(config: Config, proxy: EventLoopProxy<UserEvent>) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            proxy,
            shared: Arc::new(Shared::new()),
            render_thread: None,
            window: None,
            is_fullscreen,
        }
    }

    fn start_renderer(&mut self, window: &Window) -> Result<()> {
        let device = VulkanDevice::new(
            &self.config.window.title,
            self.config.debug.validation_layers,
            // Clearing and one uniform buffer need no optional features
            &DeviceRequirements::default(),
            window.raw_display_handle(),
            window.raw_window_handle(),
        )?;

        let size = window.inner_size();
        self.shared.update(|state| {
            state.extent = vk::Extent2D {
                width: size.width,
                height: size.height,
            };
        });

        let options = RenderOptions {
            settings: self.config.graphics.frame_settings(),
            clear_color: self.config.graphics.clear_color,
            show_fps: self.config.debug.show_fps,
        };
        let shared = self.shared.clone();
        let proxy = self.proxy.clone();
        let handle = std::thread::Builder::new()
            .name("render".to_string())
            .spawn(move || render_thread(device, shared, options, proxy))
            .context("Failed to spawn render thread")?;

        self.render_thread = Some(handle);
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.shared.update(|state| state.closing = true);
        event_loop.exit();
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows triggers the swapchain rebuild
        }
    }

    fn show_fps(&self, fps: f32, frame_ms: f32) {
        if let Some(ref window) = self.window {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}]",
                self.config.window.title, fps, frame_ms, mode
            ));
        }
    }
}

impl ApplicationHandler<UserEvent> for App {
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
            Ok(w) => w,
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.start_renderer(&window) {
            log::error!("Failed to initialize Vulkan: {:#}", e);
            event_loop.exit();
        }
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.shared.update(|state| {
                    state.extent = vk::Extent2D {
                        width: size.width,
                        height: size.height,
                    };
                });
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown(event_loop);
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: UserEvent) {
        match event {
            UserEvent::Fps { fps, frame_ms } => self.show_fps(fps, frame_ms),
            UserEvent::RenderExited => {
                log::info!("Render thread finished");
                self.shutdown(event_loop);
            }
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shared.update(|state| state.closing = true);
        if let Some(handle) = self.render_thread.take() {
            if handle.join().is_err() {
                log::error!("Render thread panicked");
            }
        }
        log::info!("Cleanup complete");
    }
}
