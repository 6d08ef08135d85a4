// host/mod.rs — host-memory reference device.
//
// `HostDevice` implements the full `Backend` contract on the CPU. It is the
// reference every GPU kernel is validated against, and the backend callers
// use when no accelerator is present.
//
// It mirrors the GPU's execution model rather than short-cutting it:
//
//   Exec::Sync           — the kernel runs before the call returns.
//   Exec::Async(&stream) — the kernel is queued on the stream and runs, in
//                          enqueue order, when the stream is synchronised.
//
// Queued kernels hold their own `Arc` to every buffer they touch, so a
// handle released while work is outstanding cannot pull the memory out from
// under it. This is the same guarantee wgpu gives for submitted commands.
// The bytes stay on the budget until the last of those `Arc`s is gone.

pub mod kernels;

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::backend::{Backend, MemoryBudget};
use crate::depth::Depth;
use crate::error::{Error, Result};
use crate::exec::{Exec, Stream};
use crate::types::{MinMaxLoc, Scalar, Shape};

/// CPU device. Cheap to create; one per budget.
#[derive(Debug, Default)]
pub struct HostDevice {
    budget: Arc<MemoryBudget>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host device that refuses to hold more than `limit` bytes.
    pub fn with_budget(limit: Option<usize>) -> Self {
        Self { budget: Arc::new(MemoryBudget::new(limit)) }
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }
}

/// Host-resident buffer. Clones share storage; only queued kernels clone.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    storage: Arc<HostStorage>,
}

#[derive(Debug)]
struct HostStorage {
    data: RwLock<Vec<u8>>,
    budget: Arc<MemoryBudget>,
}

impl Drop for HostStorage {
    fn drop(&mut self) {
        self.budget.release(self.data.get_mut().len());
    }
}

impl HostBuffer {
    fn data(&self) -> &RwLock<Vec<u8>> {
        &self.storage.data
    }

    pub fn len(&self) -> usize {
        self.data().read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data().read().clone()
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

type Command = Box<dyn FnOnce() -> Result<()> + Send>;

/// Deferred command queue.
#[derive(Default)]
pub struct HostStream {
    pending: Mutex<VecDeque<Command>>,
}

impl HostStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued, not yet executed commands.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn enqueue(&self, command: Command) {
        self.pending.lock().push_back(command);
    }
}

impl Stream for HostStream {
    /// Run queued commands in order. The first failure discards the rest of
    /// the queue and is returned.
    fn synchronize(&self) -> Result<()> {
        loop {
            // The lock is released before the command runs.
            let next = self.pending.lock().pop_front();
            let Some(command) = next else {
                return Ok(());
            };
            if let Err(e) = command() {
                let dropped = {
                    let mut pending = self.pending.lock();
                    let n = pending.len();
                    pending.clear();
                    n
                };
                debug!("host stream faulted, {dropped} queued commands discarded");
                return Err(e);
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Run `op` now, or queue it on the stream.
fn submit(exec: Exec<'_, HostStream>, op: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
    match exec {
        Exec::Sync => op(),
        Exec::Async(stream) => {
            stream.enqueue(Box::new(op));
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

impl Backend for HostDevice {
    type Buffer = HostBuffer;
    type Stream = HostStream;

    fn name(&self) -> String {
        "host".to_string()
    }

    fn create_stream(&self) -> HostStream {
        HostStream::new()
    }

    fn allocate(&self, bytes: usize) -> Result<HostBuffer> {
        self.budget.reserve(bytes)?;
        let mut data = Vec::new();
        if let Err(e) = data.try_reserve_exact(bytes) {
            self.budget.release(bytes);
            return Err(Error::Allocation(format!("{bytes} bytes: {e}")));
        }
        data.resize(bytes, 0);
        debug!("host: allocated {bytes} bytes");
        let storage = HostStorage { data: RwLock::new(data), budget: Arc::clone(&self.budget) };
        Ok(HostBuffer { storage: Arc::new(storage) })
    }

    fn buffer_len(&self, buffer: &HostBuffer) -> usize {
        buffer.len()
    }

    fn owns(&self, buffer: &HostBuffer) -> bool {
        Arc::ptr_eq(&buffer.storage.budget, &self.budget)
    }

    fn write(&self, dst: &HostBuffer, src: &[u8]) -> Result<()> {
        let mut data = dst.data().write();
        if src.len() > data.len() {
            return Err(Error::Transfer(format!(
                "{} bytes do not fit a {} byte buffer",
                src.len(),
                data.len()
            )));
        }
        data[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read(&self, src: &HostBuffer, dst: &mut [u8]) -> Result<()> {
        let data = src.data().read();
        if dst.len() > data.len() {
            return Err(Error::Transfer(format!(
                "{} bytes requested from a {} byte buffer",
                dst.len(),
                data.len()
            )));
        }
        dst.copy_from_slice(&data[..dst.len()]);
        Ok(())
    }

    fn copy(
        &self,
        src: &HostBuffer,
        dst: &HostBuffer,
        bytes: usize,
        exec: Exec<'_, HostStream>,
    ) -> Result<()> {
        let (src, dst) = (src.clone(), dst.clone());
        submit(exec, move || {
            let from = src.data().read_recursive();
            dst.data().write()[..bytes].copy_from_slice(&from[..bytes]);
            Ok(())
        })
    }

    fn split(
        &self,
        src: &HostBuffer,
        shape: Shape,
        dsts: &[&HostBuffer],
        exec: Exec<'_, HostStream>,
    ) -> Result<()> {
        let src = src.clone();
        let dsts: Vec<HostBuffer> = dsts.iter().map(|d| (*d).clone()).collect();
        submit(exec, move || {
            let from = src.data().read_recursive();
            for (c, dst) in dsts.iter().enumerate() {
                kernels::split_plane(&from, shape, c, &mut dst.data().write());
            }
            Ok(())
        })
    }

    fn merge(
        &self,
        srcs: &[&HostBuffer],
        dst: &HostBuffer,
        shape: Shape,
        exec: Exec<'_, HostStream>,
    ) -> Result<()> {
        let srcs: Vec<HostBuffer> = srcs.iter().map(|s| (*s).clone()).collect();
        let dst = dst.clone();
        submit(exec, move || {
            let mut out = dst.data().write();
            for (c, src) in srcs.iter().enumerate() {
                kernels::merge_plane(&src.data().read_recursive(), shape, c, &mut out);
            }
            Ok(())
        })
    }

    fn bitwise_xor(
        &self,
        a: &HostBuffer,
        b: &HostBuffer,
        dst: &HostBuffer,
        bytes: usize,
        exec: Exec<'_, HostStream>,
    ) -> Result<()> {
        let (a, b, dst) = (a.clone(), b.clone(), dst.clone());
        submit(exec, move || {
            // `a` and `b` may be the same buffer; both locks are shared.
            let (x, y) = (a.data().read_recursive(), b.data().read_recursive());
            kernels::xor(&x[..bytes], &y[..bytes], &mut dst.data().write()[..bytes]);
            Ok(())
        })
    }

    fn count_non_zero(&self, src: &HostBuffer, shape: Shape) -> Result<usize> {
        Ok(kernels::count_non_zero(&src.data().read(), shape.depth(), shape.total()))
    }

    fn min_max_loc(&self, src: &HostBuffer, shape: Shape) -> Result<MinMaxLoc> {
        kernels::min_max_loc(&src.data().read(), shape)
            .ok_or_else(|| Error::shape("min/max of an empty buffer"))
    }

    fn convert(
        &self,
        src: &HostBuffer,
        shape: Shape,
        dst: &HostBuffer,
        depth: Depth,
        alpha: f64,
        beta: f64,
        exec: Exec<'_, HostStream>,
    ) -> Result<()> {
        let (src, dst) = (src.clone(), dst.clone());
        let count = shape.total() * shape.channels();
        submit(exec, move || {
            kernels::convert(
                &src.data().read_recursive(),
                shape.depth(),
                &mut dst.data().write(),
                depth,
                count,
                alpha,
                beta,
            );
            Ok(())
        })
    }

    fn fill(
        &self,
        dst: &HostBuffer,
        shape: Shape,
        value: &Scalar,
        mask: Option<&HostBuffer>,
        exec: Exec<'_, HostStream>,
    ) -> Result<()> {
        let pixel = value.encode(shape.depth(), shape.channels());
        let dst = dst.clone();
        let mask = mask.cloned();
        submit(exec, move || {
            let mut out = dst.data().write();
            match mask {
                Some(m) => {
                    let mask = m.data().read_recursive();
                    kernels::fill(&mut out, shape, &pixel, Some(mask.as_slice()))
                }
                None => kernels::fill(&mut out, shape, &pixel, None),
            }
            Ok(())
        })
    }
}
