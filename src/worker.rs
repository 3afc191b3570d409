//! DeviceWorker (C1): owns one device's command queues, kernel-argument
//! cache, and per-compute-id benchmark measurement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use log::debug;
use ocl::{Context, EventList, Kernel, Program, Queue};

use crate::array::BoundArray;
use crate::device::DeviceHandle;
use crate::error::{Error, Result};

/// Compute-id used for the sync-kernel barrier; excluded from benchmark
/// accounting (spec.md §4.3).
pub const SYNC_KERNEL_COMPUTE_ID: i64 = -1;

/// Hard ceiling on auxiliary (non-primary) queues per device.
pub const MAX_AUX_QUEUES: u32 = 16;

/// RAII guard returned by `DeviceWorker::bench_scope`. Records elapsed wall
/// time into the worker's benchmark table on drop, unless the scope was
/// opened for the sync-kernel's reserved compute-id.
pub struct BenchGuard<'w> {
    worker: &'w DeviceWorker,
    compute_id: i64,
    started: Instant,
    armed: bool,
}

impl<'w> Drop for BenchGuard<'w> {
    fn drop(&mut self) {
        if !self.armed || self.compute_id == SYNC_KERNEL_COMPUTE_ID {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        if let Ok(mut table) = self.worker.benchmarks.lock() {
            table.insert(self.compute_id, elapsed_ms);
        }
    }
}

/// Owns one device's queues (index 0 = primary, 1..=16 auxiliary), the
/// per-(kernel, compute-id) argument cache, and per-compute-id benchmark
/// measurement.
pub struct DeviceWorker {
    pub handle: DeviceHandle,
    context: Context,
    program: Program,
    queues: Vec<Queue>,
    arg_cache: Mutex<HashMap<(String, i64), Kernel>>,
    benchmarks: Mutex<HashMap<i64, f64>>,
    rr_cursor: Mutex<usize>,
    markers_issued: AtomicU64,
    markers_completed: Arc<AtomicU64>,
    marker_waiters: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceWorker {
    pub fn new(
        handle: DeviceHandle,
        context: Context,
        program: Program,
        aux_queue_count: u32,
    ) -> Result<Self> {
        let aux_queue_count = aux_queue_count.min(MAX_AUX_QUEUES);
        let mut queues = Vec::with_capacity(1 + aux_queue_count as usize);
        for _ in 0..=aux_queue_count {
            queues.push(Queue::new(&context, handle.ocl_device, None)?);
        }
        debug!(
            "worker for {} holds {} queue(s)",
            handle.name,
            queues.len()
        );
        Ok(Self {
            handle,
            context,
            program,
            queues,
            arg_cache: Mutex::new(HashMap::new()),
            benchmarks: Mutex::new(HashMap::new()),
            rr_cursor: Mutex::new(0),
            markers_issued: AtomicU64::new(0),
            markers_completed: Arc::new(AtomicU64::new(0)),
            marker_waiters: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn primary_queue(&self) -> &Queue {
        &self.queues[0]
    }

    pub fn queue(&self, idx: usize) -> &Queue {
        &self.queues[idx.min(self.queues.len() - 1)]
    }

    /// Round-robin compute-queue selector used by enqueue-mode's async
    /// issue path.
    pub fn next_compute_queue(&self, idx: usize) -> &Queue {
        &self.queues[idx % self.queues.len()]
    }

    /// Binds or re-binds `kernel_name`'s arguments for `compute_id`.
    /// Idempotent: a second call with the same `(kernel_name, compute_id)`
    /// key is a no-op, since the cached `Kernel` already carries the
    /// bound argument handles (P3).
    pub fn kernel_argument(
        &self,
        kernel_name: &str,
        arrays: &[Arc<dyn BoundArray>],
        compute_id: i64,
    ) -> Result<()> {
        let key = (kernel_name.to_string(), compute_id);
        let mut cache = self
            .arg_cache
            .lock()
            .map_err(|_| Error::PoisonedLock("argument cache".into()))?;
        if cache.contains_key(&key) {
            return Ok(());
        }
        let mut builder = Kernel::builder();
        builder
            .program(&self.program)
            .name(kernel_name)
            .queue(self.queues[0].clone());
        for array in arrays {
            array.bind_into_builder(&mut builder);
        }
        let kernel = builder.build()?;
        cache.insert(key, kernel);
        Ok(())
    }

    fn with_cached_kernel<R>(
        &self,
        kernel_name: &str,
        compute_id: i64,
        f: impl FnOnce(&Kernel) -> Result<R>,
    ) -> Result<R> {
        let cache = self
            .arg_cache
            .lock()
            .map_err(|_| Error::PoisonedLock("argument cache".into()))?;
        let kernel = cache
            .get(&(kernel_name.to_string(), compute_id))
            .ok_or_else(|| {
                Error::ContractViolation(format!(
                    "kernel '{kernel_name}' was not bound via kernel_argument before use"
                ))
            })?;
        f(kernel)
    }

    /// Host -> device transfer for workitems `[offset, offset+range)`,
    /// respecting each array's per-call policy.
    pub fn write_to_buffer(
        &self,
        arrays: &[Arc<dyn BoundArray>],
        offset: usize,
        range: usize,
        queue: &Queue,
    ) -> Result<()> {
        for array in arrays {
            use crate::array::RwPolicy::*;
            match array.policy() {
                PartialRead => array.write_partial(queue, offset, range, None, None)?,
                Read => array.write_whole(queue, None, None)?,
                Write | WriteAll => {} // write-only arrays have nothing to upload
            }
        }
        Ok(())
    }

    /// Enqueues kernel execution over `[offset, offset+range)`.
    pub fn compute(
        &self,
        kernel_name: &str,
        offset: usize,
        range: usize,
        local_range: u64,
        compute_id: i64,
        queue: &Queue,
    ) -> Result<()> {
        self.compute_with_events(
            kernel_name,
            offset,
            range,
            local_range,
            compute_id,
            queue,
            None,
            None,
        )
    }

    /// As `compute`, but lets the EVENT-discipline pipeline wire an
    /// explicit wait list and capture the resulting event for the next
    /// segment's dependency.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_with_events(
        &self,
        kernel_name: &str,
        offset: usize,
        range: usize,
        local_range: u64,
        compute_id: i64,
        queue: &Queue,
        ewait: Option<&EventList>,
        enew: Option<&mut ocl::Event>,
    ) -> Result<()> {
        self.with_cached_kernel(kernel_name, compute_id, |kernel| {
            let mut cmd = kernel
                .cmd()
                .queue(queue)
                .global_work_offset(offset)
                .global_work_size(range)
                .local_work_size(local_range as usize);
            if let Some(ewait) = ewait {
                cmd = cmd.ewait(ewait);
            }
            if let Some(enew) = enew {
                cmd = cmd.enew(enew);
            }
            unsafe {
                cmd.enq()?;
            }
            Ok(())
        })
    }

    /// Fused-repeat variant: runs `kernel_name` `n` times without a
    /// round-trip to the dispatcher between iterations.
    pub fn compute_repeated(
        &self,
        kernel_name: &str,
        offset: usize,
        range: usize,
        local_range: u64,
        compute_id: i64,
        n: u32,
        queue: &Queue,
    ) -> Result<()> {
        for _ in 0..n.max(1) {
            self.compute(kernel_name, offset, range, local_range, compute_id, queue)?;
        }
        Ok(())
    }

    /// As `compute_repeated`, inserting a single-workgroup invocation of
    /// `sync_kernel` after each iteration (compute-id `-1`, excluded from
    /// benchmark accounting). Intra-device barrier only: it provides no
    /// synchronization across devices.
    pub fn compute_repeated_with_sync_kernel(
        &self,
        kernel_name: &str,
        offset: usize,
        range: usize,
        local_range: u64,
        compute_id: i64,
        sync_kernel: &str,
        n: u32,
        queue: &Queue,
    ) -> Result<()> {
        for _ in 0..n.max(1) {
            self.compute(kernel_name, offset, range, local_range, compute_id, queue)?;
            self.with_cached_kernel(sync_kernel, SYNC_KERNEL_COMPUTE_ID, |kernel| {
                unsafe {
                    kernel
                        .cmd()
                        .queue(queue)
                        .global_work_offset(0)
                        .global_work_size(local_range as usize)
                        .local_work_size(local_range as usize)
                        .enq()?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Device -> host transfer symmetric to `write_to_buffer`.
    pub fn read_from_buffer(
        &self,
        arrays: &[Arc<dyn BoundArray>],
        offset: usize,
        range: usize,
        queue: &Queue,
    ) -> Result<()> {
        for array in arrays {
            use crate::array::RwPolicy::*;
            match array.policy() {
                Write => array.read_partial(queue, offset, range, None, None)?,
                WriteAll => array.read_whole(queue, None)?,
                PartialRead | Read => {} // read-only arrays have nothing to download
            }
        }
        Ok(())
    }

    /// Opens a benchmark scope for `compute_id`. The measured elapsed time
    /// is recorded into this worker's benchmark table when the guard is
    /// dropped, unless `compute_id` is the sync-kernel sentinel.
    pub fn bench_scope(&self, compute_id: i64) -> BenchGuard<'_> {
        BenchGuard {
            worker: self,
            compute_id,
            started: Instant::now(),
            armed: true,
        }
    }

    pub fn last_benchmark(&self, compute_id: i64) -> Option<f64> {
        self.benchmarks.lock().ok()?.get(&compute_id).copied()
    }

    /// Inserts a zero-work marker on `queue` and increments this worker's
    /// issued-marker counter. Completion is observed on a detached waiter
    /// thread rather than through OpenCL's raw `extern "C"` callback ABI
    /// (`ocl::Event::set_callback`), which needs unsafe function-pointer
    /// plumbing the rest of this crate avoids; blocking on the marker event
    /// off the hot path gives the same (issued, completed) accounting.
    pub fn add_marker_for_counting(&self, queue: &Queue) -> Result<()> {
        let marker = queue.enqueue_marker::<&EventList>(None)?;
        self.markers_issued.fetch_add(1, Ordering::SeqCst);
        let completed = Arc::clone(&self.markers_completed);
        let handle = std::thread::spawn(move || {
            if marker.wait_for().is_ok() {
                completed.fetch_add(1, Ordering::SeqCst);
            }
        });
        if let Ok(mut waiters) = self.marker_waiters.lock() {
            waiters.push(handle);
        }
        Ok(())
    }

    pub fn markers_issued(&self) -> u64 {
        self.markers_issued.load(Ordering::SeqCst)
    }

    pub fn markers_completed(&self) -> u64 {
        self.markers_completed.load(Ordering::SeqCst)
    }

    /// Joins every outstanding marker-waiter thread, guaranteeing
    /// `markers_completed()` reflects every marker issued so far. Called as
    /// part of the enqueue-mode drain barrier so P5/S4's
    /// `countMarkers() == countMarkerCallbacks()` holds the instant the
    /// `true -> false` transition returns, rather than racing a detached
    /// waiter thread.
    pub fn drain_markers(&self) {
        let handles = self
            .marker_waiters
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for h in handles {
            let _ = h.join();
        }
    }

    pub fn flush(&self, queue: &Queue) -> Result<()> {
        queue.flush()?;
        Ok(())
    }

    pub fn finish(&self, queue: &Queue) -> Result<()> {
        queue.finish()?;
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        for q in &self.queues {
            q.flush()?;
        }
        Ok(())
    }

    pub fn finish_all(&self) -> Result<()> {
        for q in &self.queues {
            q.finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::device::try_list_devices;

    #[test]
    fn bench_scope_skips_sync_kernel_id() {
        // Pure logic over the sentinel constant; no device required.
        assert_eq!(super::SYNC_KERNEL_COMPUTE_ID, -1);
    }

    #[test]
    fn worker_queue_count_matches_request() {
        let Some(devices) = try_list_devices() else {
            return;
        };
        let handle = devices.into_iter().next().unwrap();
        let context = ocl::Context::builder()
            .platform(handle.platform)
            .devices(handle.ocl_device)
            .build()
            .expect("context build");
        let program = ocl::Program::builder()
            .devices(handle.ocl_device)
            .src("__kernel void noop(__global int* x) { x[get_global_id(0)] = 0; }")
            .cmplr_opt("-cl-std=CL1.2")
            .build(&context)
            .expect("program build");
        let worker = super::DeviceWorker::new(handle, context, program, 3).unwrap();
        assert_eq!(worker.queue_count(), 4);
    }
}
