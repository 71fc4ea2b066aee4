// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// Fences are recycled through `FencePool` rather than created per use.

use super::GpuDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Recycles fences through a free list.
///
/// A fence must not be released while the submission that signals it may
/// still be running; wait on it first or use `wait_and_release_fence`.
pub struct FencePool {
    device: Arc<dyn GpuDevice>,
    free: Vec<vk::Fence>,
    created: usize,
}

impl FencePool {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            free: Vec::new(),
            created: 0,
        }
    }

    /// Hand out a fence, reusing a released one when possible.
    ///
    /// Released fences are always unsignaled and the host cannot signal a
    /// fence, so `signaled_on_create` requests are served by a new fence.
    pub fn create_fence(&mut self, signaled_on_create: bool) -> Result<vk::Fence> {
        if !signaled_on_create {
            if let Some(fence) = self.free.pop() {
                return Ok(fence);
            }
        }

        let fence = self
            .device
            .create_fence(signaled_on_create)
            .context("Failed to create fence")?;
        self.created += 1;
        Ok(fence)
    }

    /// `Ok(false)` when the timeout elapsed first
    pub fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        self.device
            .wait_for_fence(fence, timeout_ns)
            .context("Failed to wait for fence")
    }

    pub fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.device
            .reset_fence(fence)
            .context("Failed to reset fence")
    }

    /// Reset and return to the free list
    pub fn release_fence(&mut self, fence: vk::Fence) -> Result<()> {
        self.reset_fence(fence)?;
        self.free.push(fence);
        Ok(())
    }

    /// Wait, then release. On timeout the fence is kept out of the pool
    /// (its work is still running) and `Ok(false)` is returned.
    pub fn wait_and_release_fence(&mut self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        if !self.wait_for_fence(fence, timeout_ns)? {
            return Ok(false);
        }
        self.release_fence(fence)?;
        Ok(true)
    }

    /// Destroy a handed-out fence instead of returning it. Its work must
    /// be finished or abandoned.
    pub fn discard_fence(&mut self, fence: vk::Fence) {
        self.device.destroy_fence(fence);
        self.created = self.created.saturating_sub(1);
    }

    pub fn created(&self) -> usize {
        self.created
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Destroy every pooled fence. Fences still handed out are leaked.
    pub fn cleanup(&mut self) {
        let outstanding = self.created - self.free.len();
        if outstanding > 0 {
            log::warn!("{} fences were never returned to the pool", outstanding);
        }
        for fence in self.free.drain(..) {
            self.device.destroy_fence(fence);
        }
        self.created = 0;
    }
}

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &dyn GpuDevice, fences: &mut FencePool) -> Result<Self> {
        let (image_available, render_finished) = Self::create_semaphores(device)?;
        Ok(Self {
            image_available,
            render_finished,
            // Start signaled so the first wait on this slot returns at once
            in_flight_fence: fences.create_fence(true)?,
        })
    }

    fn create_semaphores(device: &dyn GpuDevice) -> Result<(vk::Semaphore, vk::Semaphore)> {
        let image_available = device
            .create_semaphore()
            .context("Failed to create image-available semaphore")?;
        let render_finished = device
            .create_semaphore()
            .context("Failed to create render-finished semaphore")?;
        Ok((image_available, render_finished))
    }

    /// Replace both semaphores. Only valid once the device is idle: an
    /// abandoned acquire or present can leave them with a pending signal.
    pub fn recreate_semaphores(&mut self, device: &dyn GpuDevice) -> Result<()> {
        self.destroy_semaphores(device);
        let (image_available, render_finished) = Self::create_semaphores(device)?;
        self.image_available = image_available;
        self.render_finished = render_finished;
        Ok(())
    }

    fn destroy_semaphores(&self, device: &dyn GpuDevice) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
    }

    pub fn destroy(self, device: &dyn GpuDevice, fences: &mut FencePool) -> Result<()> {
        self.destroy_semaphores(device);
        fences.release_fence(self.in_flight_fence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SubmitDesc;
    use crate::backend::QueueKind;
    use crate::testing::{FakeDevice, FenceState};

    #[test]
    fn released_fences_are_reused() {
        let device = FakeDevice::new(2);
        let mut pool = FencePool::new(device.clone());

        let first = pool.create_fence(false).unwrap();
        pool.release_fence(first).unwrap();
        let second = pool.create_fence(false).unwrap();

        assert_eq!(first, second);
        assert_eq!(pool.created(), 1);
        assert_eq!(device.fences_created(), 1);
    }

    #[test]
    fn release_clears_signaled_state() {
        let device = FakeDevice::new(2);
        let mut pool = FencePool::new(device.clone());

        let fence = pool.create_fence(true).unwrap();
        assert_eq!(device.fence_state(fence), Some(FenceState::Signaled));

        pool.release_fence(fence).unwrap();
        assert_eq!(device.fence_state(fence), Some(FenceState::Unsignaled));

        // Reused fence comes back unsignaled and is safe to submit with
        let reused = pool.create_fence(false).unwrap();
        assert_eq!(reused, fence);
        assert_eq!(device.fence_state(reused), Some(FenceState::Unsignaled));
    }

    #[test]
    fn signaled_request_does_not_take_from_free_list() {
        let device = FakeDevice::new(2);
        let mut pool = FencePool::new(device.clone());

        let fence = pool.create_fence(false).unwrap();
        pool.release_fence(fence).unwrap();

        let signaled = pool.create_fence(true).unwrap();
        assert_ne!(signaled, fence);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(device.fence_state(signaled), Some(FenceState::Signaled));
    }

    #[test]
    fn wait_and_release_keeps_unfinished_fence() {
        let device = FakeDevice::new(2);
        let mut pool = FencePool::new(device.clone());

        // Never submitted: the wait times out
        let idle = pool.create_fence(false).unwrap();
        assert!(!pool.wait_and_release_fence(idle, 1_000).unwrap());
        assert_eq!(pool.free_count(), 0);

        let fence = pool.create_fence(false).unwrap();
        device
            .queue_submit(QueueKind::Transfer, &SubmitDesc::default(), fence)
            .unwrap();
        assert!(pool.wait_and_release_fence(fence, 1_000).unwrap());
        assert_eq!(pool.free_count(), 1);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn cleanup_destroys_pooled_fences() {
        let device = FakeDevice::new(2);
        let mut pool = FencePool::new(device.clone());

        let fences = (0..3)
            .map(|_| pool.create_fence(false).unwrap())
            .collect::<Vec<_>>();
        for fence in fences {
            pool.release_fence(fence).unwrap();
        }
        pool.cleanup();

        assert_eq!(device.live_fences(), 0);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn discarded_fence_is_destroyed_not_pooled() {
        let device = FakeDevice::new(2);
        let mut pool = FencePool::new(device.clone());

        let kept = pool.create_fence(false).unwrap();
        let dropped = pool.create_fence(false).unwrap();
        pool.discard_fence(dropped);
        pool.release_fence(kept).unwrap();

        assert_eq!(pool.created(), 1);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(device.fence_state(dropped), None);
        pool.cleanup();
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn frame_sync_semaphores_are_replaced() {
        let device = FakeDevice::new(2);
        let mut pool = FencePool::new(device.clone());

        let mut sync = FrameSync::new(device.as_ref(), &mut pool).unwrap();
        let old = sync.image_available;
        sync.recreate_semaphores(device.as_ref()).unwrap();

        assert_ne!(sync.image_available, old);
        assert_eq!(device.live_semaphores(), 2);

        sync.destroy(device.as_ref(), &mut pool).unwrap();
        assert_eq!(device.live_semaphores(), 0);
        assert_eq!(pool.free_count(), 1);
    }
}
