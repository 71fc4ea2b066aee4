// Test doubles for the GPU and the window
//
// `FakeDevice` hands out unique handles and models a single in-order queue.
// A submission completes when something waits on its fence or on the whole
// device, or when more than `latency` submissions are queued behind it.
// Misuse a real driver would punish is recorded as a violation instead of
// crashing: submitting with a signaled fence, resetting an in-flight fence,
// rendering into an image still in flight, or creating a swapchain while the
// old one lives.

use crate::backend::{
    DescriptorWrite, GpuDevice, QueueFamilies, QueueFamily, QueueKind, SubmitDesc, SurfaceWindow,
    Swapchain,
};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WaitIdle,
    CreateSwapchain { images: usize },
    DestroySwapchain,
    Acquire { image: u32 },
    Submit { fence: vk::Fence },
    Present { image: u32 },
    Marker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Unsignaled,
    Pending(u64),
    Signaled,
}

struct FakePool {
    max_sets: u32,
    allocated: u32,
}

struct State {
    next_handle: u64,
    events: Vec<Event>,
    violations: Vec<String>,

    layouts_created: usize,
    layouts_destroyed: usize,
    pools: HashMap<vk::DescriptorPool, FakePool>,
    pools_created: usize,
    pools_destroyed: usize,
    pool_resets: usize,
    sets_per_pool: Option<u32>,
    descriptor_writes: usize,

    fences: HashMap<vk::Fence, FenceState>,
    fences_created: usize,
    semaphores_live: usize,
    semaphores_created: usize,
    command_buffers_live: usize,

    pending: VecDeque<(u64, vk::Fence)>,
    next_submission: u64,
    last_completed: u64,
    latency: usize,
    max_outstanding: usize,

    image_count: u32,
    next_image: u32,
    swapchain: Option<vk::SwapchainKHR>,
    swapchain_extents: Vec<vk::Extent2D>,
    acquired: Option<u32>,
    image_submissions: HashMap<u32, u64>,
    out_of_date_acquires: u32,
    out_of_date_presents: u32,
    suboptimal_presents: u32,
    stalled_waits: u32,
}

impl State {
    fn handle<T: Handle>(&mut self) -> T {
        self.next_handle += 1;
        T::from_raw(self.next_handle)
    }

    fn complete_up_to(&mut self, submission: u64) {
        while let Some(&(id, fence)) = self.pending.front() {
            if id > submission {
                break;
            }
            self.pending.pop_front();
            self.last_completed = id;
            if fence != vk::Fence::null() {
                self.fences.insert(fence, FenceState::Signaled);
            }
        }
    }

    fn complete_all(&mut self) {
        if let Some(&(id, _)) = self.pending.back() {
            self.complete_up_to(id);
        }
    }
}

pub struct FakeDevice {
    state: Mutex<State>,
}

impl FakeDevice {
    pub fn new(image_count: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_handle: 0x1000,
                events: Vec::new(),
                violations: Vec::new(),
                layouts_created: 0,
                layouts_destroyed: 0,
                pools: HashMap::new(),
                pools_created: 0,
                pools_destroyed: 0,
                pool_resets: 0,
                sets_per_pool: None,
                descriptor_writes: 0,
                fences: HashMap::new(),
                fences_created: 0,
                semaphores_live: 0,
                semaphores_created: 0,
                command_buffers_live: 0,
                pending: VecDeque::new(),
                next_submission: 1,
                last_completed: 0,
                latency: usize::MAX,
                max_outstanding: 0,
                image_count,
                next_image: 0,
                swapchain: None,
                swapchain_extents: Vec::new(),
                acquired: None,
                image_submissions: HashMap::new(),
                out_of_date_acquires: 0,
                out_of_date_presents: 0,
                suboptimal_presents: 0,
                stalled_waits: 0,
            }),
        })
    }

    /// Image count used by the next swapchain creation
    pub fn set_image_count(&self, count: u32) {
        self.state.lock().image_count = count;
    }

    /// Submissions queued beyond this many complete on their own
    pub fn set_latency(&self, latency: usize) {
        self.state.lock().latency = latency;
    }

    /// Caps every pool regardless of the requested `max_sets`
    pub fn set_sets_per_pool(&self, sets: u32) {
        self.state.lock().sets_per_pool = Some(sets);
    }

    pub fn fail_next_acquires(&self, count: u32) {
        self.state.lock().out_of_date_acquires = count;
    }

    pub fn fail_next_presents(&self, count: u32) {
        self.state.lock().out_of_date_presents = count;
    }

    pub fn suboptimal_next_presents(&self, count: u32) {
        self.state.lock().suboptimal_presents = count;
    }

    /// The next `count` waits on a pending fence time out; `wait_idle`
    /// still completes everything
    pub fn stall_next_waits(&self, count: u32) {
        self.state.lock().stalled_waits = count;
    }

    pub fn mark(&self, marker: impl Into<String>) {
        self.state.lock().events.push(Event::Marker(marker.into()));
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn layouts_created(&self) -> usize {
        self.state.lock().layouts_created
    }

    pub fn live_layouts(&self) -> usize {
        let state = self.state.lock();
        state.layouts_created - state.layouts_destroyed
    }

    pub fn pools_created(&self) -> usize {
        self.state.lock().pools_created
    }

    pub fn live_pools(&self) -> usize {
        let state = self.state.lock();
        state.pools_created - state.pools_destroyed
    }

    pub fn pool_resets(&self) -> usize {
        self.state.lock().pool_resets
    }

    pub fn descriptor_writes(&self) -> usize {
        self.state.lock().descriptor_writes
    }

    pub fn fences_created(&self) -> usize {
        self.state.lock().fences_created
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn fence_state(&self, fence: vk::Fence) -> Option<FenceState> {
        self.state.lock().fences.get(&fence).copied()
    }

    pub fn semaphores_created(&self) -> usize {
        self.state.lock().semaphores_created
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores_live
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers_live
    }

    /// Submissions that have not completed yet
    pub fn outstanding(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn max_outstanding(&self) -> usize {
        self.state.lock().max_outstanding
    }

    pub fn swapchain_extents(&self) -> Vec<vk::Extent2D> {
        self.state.lock().swapchain_extents.clone()
    }

    pub fn has_live_swapchain(&self) -> bool {
        self.state.lock().swapchain.is_some()
    }
}

impl GpuDevice for FakeDevice {
    fn queue_families(&self) -> QueueFamilies {
        let family = QueueFamily { index: 0, count: 1 };
        QueueFamilies {
            graphics: family,
            compute: family,
            transfer: family,
            present: 0,
        }
    }

    fn queue(&self, kind: QueueKind) -> vk::Queue {
        let raw = match kind {
            QueueKind::Graphics => 1,
            QueueKind::Compute => 2,
            QueueKind::Transfer => 3,
            QueueKind::Present => 4,
        };
        vk::Queue::from_raw(raw)
    }

    fn secondary_queue(&self, _kind: QueueKind) -> Option<vk::Queue> {
        None
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.complete_all();
        state.events.push(Event::WaitIdle);
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        state.layouts_created += 1;
        Ok(state.handle())
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.state.lock().layouts_destroyed += 1;
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let max_sets = state.sets_per_pool.map_or(max_sets, |cap| cap.min(max_sets));
        let pool = state.handle();
        state.pools.insert(pool, FakePool { max_sets, allocated: 0 });
        state.pools_created += 1;
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        let mut state = self.state.lock();
        state.pool_resets += 1;
        match state.pools.get_mut(&pool) {
            Some(entry) => {
                entry.allocated = 0;
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        if state.pools.remove(&pool).is_some() {
            state.pools_destroyed += 1;
        } else {
            state.violations.push(format!("destroyed unknown pool {:?}", pool));
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        let entry = state
            .pools
            .get_mut(&pool)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if entry.allocated >= entry.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        entry.allocated += 1;
        Ok(state.handle())
    }

    fn update_descriptor_set(&self, _set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.state.lock().descriptor_writes += writes.len();
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.handle();
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, initial);
        state.fences_created += 1;
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<bool> {
        let mut state = self.state.lock();
        match state.fences.get(&fence).copied() {
            Some(FenceState::Signaled) => Ok(true),
            Some(FenceState::Pending(_)) if state.stalled_waits > 0 => {
                state.stalled_waits -= 1;
                Ok(false)
            }
            Some(FenceState::Pending(id)) => {
                state.complete_up_to(id);
                Ok(true)
            }
            // Nothing will ever signal it: a real wait would time out
            Some(FenceState::Unsignaled) => Ok(false),
            None => {
                state.violations.push(format!("waited on unknown fence {:?}", fence));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(FenceState::Pending(id)) = state.fences.get(&fence).copied() {
            state
                .violations
                .push(format!("reset fence {:?} while submission {} in flight", fence, id));
        }
        state.fences.insert(fence, FenceState::Unsignaled);
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if let Some(FenceState::Pending(_)) = state.fences.remove(&fence) {
            state
                .violations
                .push(format!("destroyed in-flight fence {:?}", fence));
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        state.semaphores_live += 1;
        state.semaphores_created += 1;
        Ok(state.handle())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        self.state.lock().semaphores_live -= 1;
    }

    fn create_command_pool(&self, _kind: QueueKind) -> VkResult<vk::CommandPool> {
        Ok(self.state.lock().handle())
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        state.command_buffers_live += count as usize;
        Ok((0..count).map(|_| state.handle()).collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        self.state.lock().command_buffers_live -= buffers.len();
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {}

    fn queue_submit(&self, _kind: QueueKind, submit: &SubmitDesc<'_>, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        let id = state.next_submission;
        state.next_submission += 1;

        if fence != vk::Fence::null() {
            match state.fences.get(&fence).copied() {
                Some(FenceState::Unsignaled) => {}
                other => state
                    .violations
                    .push(format!("submitted with fence {:?} in state {:?}", fence, other)),
            }
            state.fences.insert(fence, FenceState::Pending(id));
        }

        // Frame submissions wait on the acquire semaphore of the image they draw
        if !submit.wait_semaphores.is_empty() {
            if let Some(image) = state.acquired.take() {
                let previous = state.image_submissions.get(&image).copied();
                if let Some(previous) = previous {
                    if previous > state.last_completed {
                        state.violations.push(format!(
                            "image {} recorded while submission {} still in flight",
                            image, previous
                        ));
                    }
                }
                state.image_submissions.insert(image, id);
            }
        }

        state.pending.push_back((id, fence));
        state.events.push(Event::Submit { fence });

        while state.pending.len() > state.latency {
            if let Some(&(oldest, _)) = state.pending.front() {
                state.complete_up_to(oldest);
            }
        }
        state.max_outstanding = state.max_outstanding.max(state.pending.len());
        Ok(())
    }

    fn create_swapchain(
        &self,
        extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
    ) -> VkResult<Swapchain> {
        let mut state = self.state.lock();
        if extent.width == 0 || extent.height == 0 {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        if state.swapchain.is_some() {
            state
                .violations
                .push("created a swapchain while the previous one is alive".to_string());
        }

        let handle = state.handle();
        let count = state.image_count as usize;
        let images = (0..count).map(|_| state.handle()).collect();
        let image_views = (0..count).map(|_| state.handle()).collect();

        state.swapchain = Some(handle);
        state.swapchain_extents.push(extent);
        state.next_image = 0;
        state.acquired = None;
        state.image_submissions.clear();
        state.events.push(Event::CreateSwapchain { images: count });

        Ok(Swapchain {
            handle,
            images,
            image_views,
            format: vk::Format::B8G8R8A8_SRGB,
            extent,
            present_mode,
        })
    }

    fn destroy_swapchain(&self, swapchain: &Swapchain) {
        let mut state = self.state.lock();
        if state.swapchain != Some(swapchain.handle) {
            state
                .violations
                .push(format!("destroyed unknown swapchain {:?}", swapchain.handle));
        }
        if !state.pending.is_empty() {
            state
                .violations
                .push("destroyed swapchain with work in flight".to_string());
        }
        state.swapchain = None;
        state.events.push(Event::DestroySwapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        _semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        if state.swapchain != Some(swapchain) {
            state
                .violations
                .push(format!("acquired from dead swapchain {:?}", swapchain));
        }
        if state.out_of_date_acquires > 0 {
            state.out_of_date_acquires -= 1;
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }

        let image = state.next_image % state.image_count;
        state.next_image += 1;
        state.acquired = Some(image);
        state.events.push(Event::Acquire { image });
        Ok((image, false))
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.events.push(Event::Present { image: image_index });
        if state.out_of_date_presents > 0 {
            state.out_of_date_presents -= 1;
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        if state.suboptimal_presents > 0 {
            state.suboptimal_presents -= 1;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Window whose size the test controls.
///
/// `wait_events` applies the next queued size; with nothing queued the
/// window reports itself closed so a broken loop cannot spin forever.
pub struct FakeWindow {
    extent: Mutex<vk::Extent2D>,
    queued: Mutex<VecDeque<vk::Extent2D>>,
    waits: Mutex<usize>,
    closed: Mutex<bool>,
}

impl FakeWindow {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            extent: Mutex::new(vk::Extent2D { width, height }),
            queued: Mutex::new(VecDeque::new()),
            waits: Mutex::new(0),
            closed: Mutex::new(false),
        })
    }

    pub fn resize(&self, width: u32, height: u32) {
        *self.extent.lock() = vk::Extent2D { width, height };
    }

    /// Size the window takes on the next `wait_events`
    pub fn queue_resize(&self, width: u32, height: u32) {
        self.queued.lock().push_back(vk::Extent2D { width, height });
    }

    pub fn waits(&self) -> usize {
        *self.waits.lock()
    }
}

impl SurfaceWindow for FakeWindow {
    fn extent(&self) -> vk::Extent2D {
        *self.extent.lock()
    }

    fn wait_events(&self) {
        *self.waits.lock() += 1;
        match self.queued.lock().pop_front() {
            Some(extent) => *self.extent.lock() = extent,
            None => *self.closed.lock() = true,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}
