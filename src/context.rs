// GpuContext - Frame orchestration
//
// Responsibilities:
// - N frames in flight, each with its own semaphores, fence and descriptor pools
// - Acquire / submit / present, with image-in-flight tracking
// - Swapchain rebuild on resize or staleness, with before/after notifications
// - Command pools per queue role and one-shot submissions
// - Deferred teardown through the deletion queue
//
// Single render thread only: nothing in here takes a lock.

use crate::backend::{
    is_zero_area, FencePool, FrameSync, GpuDevice, QueueKind, SubmitDesc, SurfaceWindow, Swapchain,
};
use crate::deletion_queue::DeletionQueue;
use crate::descriptor::{DescriptorAllocator, DescriptorFactory, DescriptorLayoutCache};
use crate::rebuild::{RebuildCallback, RebuildCallbacks};
use anyhow::{bail, Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Typed view of the `[graphics]` config table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSettings {
    pub frames_in_flight: usize,
    pub present_mode: vk::PresentModeKHR,
    pub descriptor_sets_per_pool: u32,
    pub fence_timeout: Duration,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            present_mode: vk::PresentModeKHR::FIFO_RELAXED,
            descriptor_sets_per_pool: crate::descriptor::allocator::DEFAULT_SETS_PER_POOL,
            fence_timeout: Duration::from_secs(5),
        }
    }
}

/// Where the current frame is in its acquire / submit / present cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
}

/// Command buffers recorded for the acquired image
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Stage that waits for the acquired image
    pub wait_stage: vk::PipelineStageFlags,
}

impl<'a> Submission<'a> {
    pub fn new(command_buffers: &'a [vk::CommandBuffer]) -> Self {
        Self {
            command_buffers,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub rebuilds: usize,
    pub layouts: usize,
    pub layout_cache_hits: usize,
    pub layout_cache_misses: usize,
    pub descriptor_pools: usize,
    pub fences_created: usize,
    pub free_fences: usize,
}

struct CommandPools {
    graphics: vk::CommandPool,
    compute: vk::CommandPool,
    transfer: vk::CommandPool,
}

impl CommandPools {
    fn get(&self, kind: QueueKind) -> vk::CommandPool {
        match kind {
            QueueKind::Graphics | QueueKind::Present => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Transfer => self.transfer,
        }
    }
}

/// Block until the window has a drawable area
fn wait_for_drawable(window: &dyn SurfaceWindow) -> Result<vk::Extent2D> {
    let mut logged = false;
    loop {
        if window.is_closed() {
            bail!("Window closed while waiting for a drawable surface");
        }
        let extent = window.extent();
        if !is_zero_area(extent) {
            return Ok(extent);
        }
        if !logged {
            log::info!("Surface has zero area, waiting for the window to be restored");
            logged = true;
        }
        window.wait_events();
    }
}

/// Create a swapchain, waiting out minimized or transiently stale surfaces.
/// Returns the window extent the chain was built for.
fn create_swapchain(
    device: &dyn GpuDevice,
    window: &dyn SurfaceWindow,
    present_mode: vk::PresentModeKHR,
) -> Result<(Swapchain, vk::Extent2D)> {
    loop {
        let extent = wait_for_drawable(window)?;
        match device.create_swapchain(extent, present_mode) {
            Ok(swapchain) => return Ok((swapchain, extent)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Surface reported out of date during creation, waiting");
                window.wait_events();
            }
            Err(e) => return Err(e).context("Failed to create swapchain"),
        }
    }
}

fn allocate_image_command_buffers(
    device: &dyn GpuDevice,
    pool: vk::CommandPool,
    swapchain: &Swapchain,
) -> Result<Vec<vk::CommandBuffer>> {
    device
        .allocate_command_buffers(pool, swapchain.image_count() as u32)
        .context("Failed to allocate per-image command buffers")
}

pub struct GpuContext {
    device: Arc<dyn GpuDevice>,
    window: Box<dyn SurfaceWindow + Send>,
    settings: FrameSettings,

    swapchain: Swapchain,
    /// Window extent the current swapchain was built for
    built_extent: vk::Extent2D,
    needs_rebuild: bool,
    rebuild_count: usize,

    frames: Vec<FrameSync>,
    frame_index: usize,
    state: FrameState,
    current_image: Option<u32>,
    /// Fence of the slot that last rendered into each image; null if none
    images_in_flight: Vec<vk::Fence>,
    frames_presented: u64,

    command_pools: CommandPools,
    image_command_buffers: Vec<vk::CommandBuffer>,

    fence_pool: FencePool,
    layout_cache: DescriptorLayoutCache,
    frame_allocators: Vec<DescriptorAllocator>,
    persistent_allocator: DescriptorAllocator,
    rebuild_callbacks: RebuildCallbacks,
    deletion_queue: DeletionQueue,
}

impl GpuContext {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        window: Box<dyn SurfaceWindow + Send>,
        settings: FrameSettings,
    ) -> Result<Self> {
        let settings = FrameSettings {
            frames_in_flight: settings.frames_in_flight.max(1),
            ..settings
        };

        let (swapchain, built_extent) =
            create_swapchain(device.as_ref(), window.as_ref(), settings.present_mode)?;

        let mut deletion_queue = DeletionQueue::new();
        let mut create_pool = |kind: QueueKind| -> Result<vk::CommandPool> {
            let pool = device
                .create_command_pool(kind)
                .with_context(|| format!("Failed to create {:?} command pool", kind))?;
            let device = device.clone();
            deletion_queue.push(move || device.destroy_command_pool(pool));
            Ok(pool)
        };
        let command_pools = CommandPools {
            graphics: create_pool(QueueKind::Graphics)?,
            compute: create_pool(QueueKind::Compute)?,
            transfer: create_pool(QueueKind::Transfer)?,
        };

        let image_command_buffers =
            allocate_image_command_buffers(device.as_ref(), command_pools.graphics, &swapchain)?;

        let mut fence_pool = FencePool::new(device.clone());
        let frames = (0..settings.frames_in_flight)
            .map(|_| FrameSync::new(device.as_ref(), &mut fence_pool))
            .collect::<Result<Vec<_>>>()?;

        let frame_allocators = (0..settings.frames_in_flight)
            .map(|_| DescriptorAllocator::new(device.clone(), settings.descriptor_sets_per_pool))
            .collect();

        log::info!(
            "Frame context ready: {} frames in flight, {} swapchain images",
            settings.frames_in_flight,
            swapchain.image_count()
        );

        Ok(Self {
            images_in_flight: vec![vk::Fence::null(); swapchain.image_count()],
            layout_cache: DescriptorLayoutCache::new(device.clone()),
            persistent_allocator: DescriptorAllocator::new(
                device.clone(),
                settings.descriptor_sets_per_pool,
            ),
            device,
            window,
            settings,
            swapchain,
            built_extent,
            needs_rebuild: false,
            rebuild_count: 0,
            frames,
            frame_index: 0,
            state: FrameState::Idle,
            current_image: None,
            frames_presented: 0,
            command_pools,
            image_command_buffers,
            fence_pool,
            frame_allocators,
            rebuild_callbacks: RebuildCallbacks::new(),
            deletion_queue,
        })
    }

    fn window_resized(&self) -> bool {
        self.window.extent() != self.built_extent
    }

    fn wait_fence(&self, fence: vk::Fence) -> Result<()> {
        let timeout_ns = self.settings.fence_timeout.as_nanos().min(u64::MAX as u128) as u64;
        if !self.fence_pool.wait_for_fence(fence, timeout_ns)? {
            bail!(
                "Fence {:?} not signaled within {:?}; assuming device hang",
                fence,
                self.settings.fence_timeout
            );
        }
        Ok(())
    }

    /// Acquire the next presentable image for the current frame slot.
    ///
    /// Rebuilds the swapchain first if a resize or staleness is pending, then
    /// waits for the slot's previous submission and for whatever frame last
    /// rendered into the acquired image. The slot's descriptor pools are
    /// reset once its fence has signaled.
    pub fn acquire_next_image(&mut self) -> Result<u32> {
        if self.state != FrameState::Idle {
            bail!("acquire_next_image called while frame is {:?}", self.state);
        }

        if self.needs_rebuild || self.window_resized() {
            self.rebuild()?;
        }

        let fence = self.frames[self.frame_index].in_flight_fence;
        self.wait_fence(fence)?;
        self.frame_allocators[self.frame_index].reset_pools()?;

        let image_index = loop {
            let semaphore = self.frames[self.frame_index].image_available;
            match self
                .device
                .acquire_next_image(self.swapchain.handle, u64::MAX, semaphore)
            {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        // Still usable; rebuild after presenting it
                        self.needs_rebuild = true;
                    }
                    break index;
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    log::debug!("Swapchain out of date at acquire");
                    self.rebuild()?;
                }
                Err(e) => return Err(e).context("Failed to acquire swapchain image"),
            }
        };

        let slot = image_index as usize;
        let Some(&previous) = self.images_in_flight.get(slot) else {
            bail!(
                "Acquired image {} but swapchain has {} images",
                image_index,
                self.images_in_flight.len()
            );
        };
        if previous != vk::Fence::null() && previous != fence {
            self.wait_fence(previous)?;
        }
        self.images_in_flight[slot] = fence;

        self.current_image = Some(image_index);
        self.state = FrameState::Recording;
        Ok(image_index)
    }

    /// Reset the slot's fence and submit to the graphics queue.
    ///
    /// The submission waits on the image-acquired semaphore and signals the
    /// render-finished semaphore and the slot's fence.
    pub fn submit_and_reset_fence(&mut self, submission: &Submission<'_>) -> Result<()> {
        if self.state != FrameState::Recording {
            bail!("submit_and_reset_fence called while frame is {:?}", self.state);
        }

        let sync = &self.frames[self.frame_index];
        self.fence_pool.reset_fence(sync.in_flight_fence)?;

        let wait_semaphores = [sync.image_available];
        let wait_stages = [submission.wait_stage];
        let signal_semaphores = [sync.render_finished];
        self.device
            .queue_submit(
                QueueKind::Graphics,
                &SubmitDesc {
                    wait_semaphores: &wait_semaphores,
                    wait_stages: &wait_stages,
                    command_buffers: submission.command_buffers,
                    signal_semaphores: &signal_semaphores,
                },
                sync.in_flight_fence,
            )
            .context("Failed to submit frame")?;

        self.state = FrameState::Submitted;
        Ok(())
    }

    /// Present the acquired image and advance to the next frame slot.
    /// A stale or resized surface triggers a rebuild before returning.
    pub fn present(&mut self) -> Result<()> {
        if self.state != FrameState::Submitted {
            bail!("present called while frame is {:?}", self.state);
        }
        let Some(image_index) = self.current_image.take() else {
            bail!("present called without an acquired image");
        };

        let wait_semaphore = self.frames[self.frame_index].render_finished;
        let result = self
            .device
            .queue_present(self.swapchain.handle, image_index, wait_semaphore);

        self.state = FrameState::Idle;
        self.frame_index = (self.frame_index + 1) % self.frames.len();
        self.frames_presented += 1;

        let stale = match result {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(e).context("Failed to present"),
        };
        if stale || self.needs_rebuild || self.window_resized() {
            self.rebuild()?;
        }
        Ok(())
    }

    /// Rebuild now. Only valid between frames.
    pub fn rebuild_swapchain(&mut self) -> Result<()> {
        if self.state != FrameState::Idle {
            bail!("rebuild_swapchain called while frame is {:?}", self.state);
        }
        self.rebuild()
    }

    /// Rebuild before the next acquire
    pub fn request_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    fn free_image_command_buffers(&mut self) {
        if !self.image_command_buffers.is_empty() {
            self.device
                .free_command_buffers(self.command_pools.graphics, &self.image_command_buffers);
            self.image_command_buffers.clear();
        }
    }

    fn rebuild(&mut self) -> Result<()> {
        let started = Instant::now();

        // Keep the old chain while minimized
        wait_for_drawable(self.window.as_ref())?;
        self.device
            .wait_idle()
            .context("Failed to wait for device idle before swapchain rebuild")?;

        self.rebuild_callbacks.notify_before(&self.swapchain);

        self.free_image_command_buffers();
        self.device.destroy_swapchain(&self.swapchain);
        self.swapchain.handle = vk::SwapchainKHR::null();
        self.swapchain.images.clear();
        self.swapchain.image_views.clear();

        let (swapchain, extent) = create_swapchain(
            self.device.as_ref(),
            self.window.as_ref(),
            self.settings.present_mode,
        )?;
        self.swapchain = swapchain;
        self.built_extent = extent;

        // An abandoned acquire or present may have left these pending
        for frame in &mut self.frames {
            frame.recreate_semaphores(self.device.as_ref())?;
        }
        self.images_in_flight = vec![vk::Fence::null(); self.swapchain.image_count()];
        self.image_command_buffers = allocate_image_command_buffers(
            self.device.as_ref(),
            self.command_pools.graphics,
            &self.swapchain,
        )?;

        self.needs_rebuild = false;
        self.rebuild_count += 1;
        self.rebuild_callbacks.notify_after(&self.swapchain);

        log::info!(
            "Swapchain rebuilt: {}x{}, {} images ({:.1?})",
            self.swapchain.extent.width,
            self.swapchain.extent.height,
            self.swapchain.image_count(),
            started.elapsed()
        );
        Ok(())
    }

    /// Descriptor sets from `slot`'s allocator live until that slot comes
    /// round again.
    pub fn descriptor_factory_begin(&mut self, slot: usize) -> Result<DescriptorFactory<'_>> {
        let slots = self.frame_allocators.len();
        let Some(allocator) = self.frame_allocators.get_mut(slot) else {
            bail!("Frame slot {} out of range ({} frames in flight)", slot, slots);
        };
        Ok(DescriptorFactory::begin(
            self.device.as_ref(),
            &mut self.layout_cache,
            allocator,
        ))
    }

    /// Factory for sets that live until the context is dropped
    pub fn persistent_descriptor_factory(&mut self) -> DescriptorFactory<'_> {
        DescriptorFactory::begin(
            self.device.as_ref(),
            &mut self.layout_cache,
            &mut self.persistent_allocator,
        )
    }

    pub fn register_before_rebuild(&mut self, name: impl Into<String>, callback: RebuildCallback) {
        self.rebuild_callbacks.register_before(name, callback);
    }

    pub fn register_after_rebuild(&mut self, name: impl Into<String>, callback: RebuildCallback) {
        self.rebuild_callbacks.register_after(name, callback);
    }

    pub fn unregister_rebuild_callbacks(&mut self, name: &str) -> bool {
        self.rebuild_callbacks.unregister(name)
    }

    fn create_command_buffer(&self, kind: QueueKind) -> Result<vk::CommandBuffer> {
        let buffers = self
            .device
            .allocate_command_buffers(self.command_pools.get(kind), 1)
            .with_context(|| format!("Failed to allocate {:?} command buffer", kind))?;
        buffers
            .into_iter()
            .next()
            .context("Driver returned no command buffer")
    }

    pub fn create_graphics_command_buffer(&self) -> Result<vk::CommandBuffer> {
        self.create_command_buffer(QueueKind::Graphics)
    }

    pub fn create_compute_command_buffer(&self) -> Result<vk::CommandBuffer> {
        self.create_command_buffer(QueueKind::Compute)
    }

    pub fn create_copy_command_buffer(&self) -> Result<vk::CommandBuffer> {
        self.create_command_buffer(QueueKind::Transfer)
    }

    /// `kind` must be the role the buffer was created for
    pub fn free_command_buffer(&self, kind: QueueKind, command_buffer: vk::CommandBuffer) {
        self.device
            .free_command_buffers(self.command_pools.get(kind), &[command_buffer]);
    }

    /// Submit outside the frame cycle and block until the GPU is done
    pub fn submit_and_wait(&mut self, kind: QueueKind, command_buffer: vk::CommandBuffer) -> Result<()> {
        let fence = self.fence_pool.create_fence(false)?;
        let command_buffers = [command_buffer];
        self.device
            .queue_submit(
                kind,
                &SubmitDesc {
                    command_buffers: &command_buffers,
                    ..Default::default()
                },
                fence,
            )
            .with_context(|| format!("Failed to submit to {:?} queue", kind))?;

        let timeout_ns = self.settings.fence_timeout.as_nanos().min(u64::MAX as u128) as u64;
        if !self.fence_pool.wait_and_release_fence(fence, timeout_ns)? {
            // The fence may only be reset or destroyed once its work is done
            match self.device.wait_idle() {
                Ok(()) => self.fence_pool.release_fence(fence)?,
                Err(e) => {
                    log::error!("Device wait after one-shot timeout failed: {}", e);
                    self.fence_pool.discard_fence(fence);
                }
            }
            bail!(
                "One-shot {:?} submission not finished within {:?}",
                kind,
                self.settings.fence_timeout
            );
        }
        Ok(())
    }

    /// Run `action` when the context is dropped, before anything it owns
    /// is destroyed. Later pushes run first.
    pub fn push_deletion(&mut self, action: impl FnOnce() + Send + 'static) {
        self.deletion_queue.push(action);
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain.format
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn queue(&self, kind: QueueKind) -> vk::Queue {
        self.device.queue(kind)
    }

    /// Primary command buffer owned by swapchain image `image_index`
    pub fn image_command_buffer(&self, image_index: u32) -> Option<vk::CommandBuffer> {
        self.image_command_buffers.get(image_index as usize).copied()
    }

    pub fn layout_cache(&self) -> &DescriptorLayoutCache {
        &self.layout_cache
    }

    pub fn rebuild_count(&self) -> usize {
        self.rebuild_count
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            frames_presented: self.frames_presented,
            rebuilds: self.rebuild_count,
            layouts: self.layout_cache.len(),
            layout_cache_hits: self.layout_cache.hits(),
            layout_cache_misses: self.layout_cache.misses(),
            descriptor_pools: self
                .frame_allocators
                .iter()
                .chain(std::iter::once(&self.persistent_allocator))
                .map(|a| a.pools_created())
                .sum(),
            fences_created: self.fence_pool.created(),
            free_fences: self.fence_pool.free_count(),
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle on shutdown: {}", e);
        }

        self.free_image_command_buffers();
        // Client objects first, then the command pools pushed in `new`
        self.deletion_queue.flush();

        for frame in self.frames.drain(..) {
            if let Err(e) = frame.destroy(self.device.as_ref(), &mut self.fence_pool) {
                log::error!("Failed to release frame fence: {:#}", e);
            }
        }

        if self.swapchain.handle != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(&self.swapchain);
        }

        for allocator in &mut self.frame_allocators {
            allocator.cleanup();
        }
        self.persistent_allocator.cleanup();
        self.layout_cache.cleanup();
        self.fence_pool.cleanup();

        log::info!("Frame context destroyed");
    }
}
