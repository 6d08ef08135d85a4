// gpu/stream.rs — asynchronous submission on a wgpu queue.
//
// wgpu has a single queue per device and executes submissions in order, so
// a stream is a bookmark on that queue rather than a separate hardware
// queue: it remembers the last submission it made and waits for exactly
// that one on `synchronize()`.
//
// wgpu keeps every buffer referenced by a submitted command buffer alive
// until the GPU is done with it, so dropping a `DeviceMat` with work in
// flight is safe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::exec::Stream;

pub struct GpuStream {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    last: Mutex<Option<wgpu::SubmissionIndex>>,
    /// Submissions whose completion callback has not fired yet.
    in_flight: Arc<AtomicUsize>,
}

impl GpuStream {
    pub(crate) fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            last: Mutex::new(None),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `true` when this stream was created by the device owning `device`.
    pub(crate) fn belongs_to(&self, device: &Arc<wgpu::Device>) -> bool {
        Arc::ptr_eq(&self.device, device)
    }

    /// Submit without waiting.
    pub(crate) fn submit(&self, commands: wgpu::CommandBuffer) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let index = self.queue.submit(std::iter::once(commands));
        let in_flight = Arc::clone(&self.in_flight);
        self.queue.on_submitted_work_done(move || {
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
        *self.last.lock() = Some(index);
    }
}

impl Stream for GpuStream {
    fn synchronize(&self) -> Result<()> {
        if let Some(index) = self.last.lock().take() {
            self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        // Completion callbacks only run from poll.
        self.device.poll(wgpu::Maintain::Poll);
        self.in_flight.load(Ordering::Acquire) == 0
    }
}
