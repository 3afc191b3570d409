//! PipelineEngine (C3): per-device segment splitting and overlapped
//! read/compute/write issue under the EVENT and DRIVER disciplines.

use std::sync::Arc;

use log::warn;
use ocl::{Event, EventList};

use crate::array::BoundArray;
use crate::error::{Error, Result};
use crate::worker::DeviceWorker;

/// Scheduling discipline for one device's pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineDiscipline {
    /// Explicit event DAG, two interleaved half-range pipelines over six
    /// logical queues.
    Event,
    /// Implicit ordering via `queues[1 + (k mod 16)]` placement.
    Driver,
}

/// Fixed logical-queue indices used under the EVENT discipline. Index 0 is
/// reserved for the simple (non-pipelined) path; 1..=6 are the three
/// queue-pairs {read, read'}, {compute, compute'}, {write, write'}.
mod event_queues {
    pub const READ: usize = 1;
    pub const READ_PRIME: usize = 2;
    pub const COMPUTE: usize = 3;
    pub const COMPUTE_PRIME: usize = 4;
    pub const WRITE: usize = 5;
    pub const WRITE_PRIME: usize = 6;
}

pub struct PipelineEngine;

impl PipelineEngine {
    /// Feasibility check from spec.md §4.4 step 6: all of alignment,
    /// pipeline-stage count, and "no repeats" must hold for pipelining to
    /// be attempted; otherwise the caller falls back to the simple
    /// R->C->W path.
    pub fn feasible(range: u64, pipeline_stages: u32, local_range: u64, num_repeats: u32) -> bool {
        if num_repeats > 1 {
            return false;
        }
        if pipeline_stages < 4 || pipeline_stages % 4 != 0 {
            return false;
        }
        if local_range == 0 {
            return false;
        }
        range >= pipeline_stages as u64 * local_range
            && (range / pipeline_stages as u64) % local_range == 0
    }

    /// Runs the full split-kernel shape (K=1, K=2, K>2) for one device's
    /// sub-range `[offset, offset+range)`.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        worker: &DeviceWorker,
        kernels: &[&str],
        arrays: &[Arc<dyn BoundArray>],
        offset: u64,
        range: u64,
        local_range: u64,
        pipeline_stages: u32,
        discipline: PipelineDiscipline,
        compute_id: i64,
        num_repeats: u32,
        sync_kernel: Option<&str>,
    ) -> Result<()> {
        if range == 0 {
            return Ok(());
        }
        if pipeline_stages % 4 != 0 {
            // DRIVER-mode contract violation: abort this device's pipeline
            // and release its queues rather than corrupting output.
            if discipline == PipelineDiscipline::Driver {
                warn!(
                    "pipelineStages {pipeline_stages} is not a multiple of 4 in DRIVER mode; \
                     aborting this device's pipeline"
                );
                return Err(Error::ContractViolation(format!(
                    "pipelineStages {pipeline_stages} mod 4 != 0 in DRIVER discipline"
                )));
            }
            return Err(Error::ContractViolation(format!(
                "pipelineStages {pipeline_stages} mod 4 != 0"
            )));
        }

        match kernels.len() {
            0 => Err(Error::ContractViolation("no kernels supplied".into())),
            1 => Self::run_pipelined_pass(
                worker,
                kernels[0],
                arrays,
                offset,
                range,
                local_range,
                pipeline_stages,
                discipline,
                compute_id,
                true,
                true,
            ),
            2 => {
                Self::run_pipelined_pass(
                    worker,
                    kernels[0],
                    arrays,
                    offset,
                    range,
                    local_range,
                    pipeline_stages,
                    discipline,
                    compute_id,
                    true,
                    false,
                )?;
                Self::run_pipelined_pass(
                    worker,
                    kernels[1],
                    arrays,
                    offset,
                    range,
                    local_range,
                    pipeline_stages,
                    discipline,
                    compute_id,
                    false,
                    true,
                )
            }
            _ => {
                Self::run_pipelined_pass(
                    worker,
                    kernels[0],
                    arrays,
                    offset,
                    range,
                    local_range,
                    pipeline_stages,
                    discipline,
                    compute_id,
                    true,
                    false,
                )?;
                // Intermediate kernels run non-pipelined on the primary
                // queue, possibly repeated with a sync-kernel barrier.
                let primary = worker.queue(0);
                for mid in &kernels[1..kernels.len() - 1] {
                    match sync_kernel {
                        Some(sync) if num_repeats > 1 => worker
                            .compute_repeated_with_sync_kernel(
                                mid,
                                offset as usize,
                                range as usize,
                                local_range,
                                compute_id,
                                sync,
                                num_repeats,
                                primary,
                            )?,
                        _ => worker.compute_repeated(
                            mid,
                            offset as usize,
                            range as usize,
                            local_range,
                            compute_id,
                            num_repeats.max(1),
                            primary,
                        )?,
                    }
                }
                let last = kernels[kernels.len() - 1];
                Self::run_pipelined_pass(
                    worker,
                    last,
                    arrays,
                    offset,
                    range,
                    local_range,
                    pipeline_stages,
                    discipline,
                    compute_id,
                    false,
                    true,
                )
            }
        }
    }

    /// One pipelined read/compute/write pass (or a subset of those phases,
    /// for the mid-kernel segments of K=2/K>2 shapes) over `N =
    /// pipeline_stages` equal segments.
    #[allow(clippy::too_many_arguments)]
    fn run_pipelined_pass(
        worker: &DeviceWorker,
        kernel_name: &str,
        arrays: &[Arc<dyn BoundArray>],
        offset: u64,
        range: u64,
        local_range: u64,
        pipeline_stages: u32,
        discipline: PipelineDiscipline,
        compute_id: i64,
        do_read: bool,
        do_write: bool,
    ) -> Result<()> {
        let n = pipeline_stages as u64;
        let seg = range / n;
        match discipline {
            PipelineDiscipline::Event => Self::run_event(
                worker, kernel_name, arrays, offset, n, seg, local_range, compute_id, do_read,
                do_write,
            ),
            PipelineDiscipline::Driver => Self::run_driver(
                worker, kernel_name, arrays, offset, n, seg, local_range, compute_id, do_read,
                do_write,
            ),
        }
    }

    /// EVENT discipline: two interleaved half-range pipelines, each a
    /// classic read -> compute -> write wavefront over `N/2` segments,
    /// with the event-propagation rules from spec.md §4.3.
    #[allow(clippy::too_many_arguments)]
    fn run_event(
        worker: &DeviceWorker,
        kernel_name: &str,
        arrays: &[Arc<dyn BoundArray>],
        offset: u64,
        n: u64,
        seg: u64,
        local_range: u64,
        compute_id: i64,
        do_read: bool,
        do_write: bool,
    ) -> Result<()> {
        let half_segments = n / 2;
        let half_range = seg * half_segments;

        Self::run_event_half(
            worker,
            kernel_name,
            arrays,
            offset,
            half_segments,
            seg,
            local_range,
            compute_id,
            do_read,
            do_write,
            event_queues::READ,
            event_queues::COMPUTE,
            event_queues::WRITE,
        )?;
        Self::run_event_half(
            worker,
            kernel_name,
            arrays,
            offset + half_range,
            n - half_segments,
            seg,
            local_range,
            compute_id,
            do_read,
            do_write,
            event_queues::READ_PRIME,
            event_queues::COMPUTE_PRIME,
            event_queues::WRITE_PRIME,
        )?;

        for idx in [
            event_queues::READ,
            event_queues::READ_PRIME,
            event_queues::COMPUTE,
            event_queues::COMPUTE_PRIME,
            event_queues::WRITE,
            event_queues::WRITE_PRIME,
        ] {
            worker.flush(worker.queue(idx))?;
        }
        let finish_idx = if do_write {
            [event_queues::WRITE, event_queues::WRITE_PRIME]
        } else {
            [event_queues::COMPUTE, event_queues::COMPUTE_PRIME]
        };
        for idx in finish_idx {
            worker.finish(worker.queue(idx))?;
        }
        Ok(())
    }

    /// One half-pipeline: segment `j` reads at step `j`, computes at step
    /// `j+1` guarded by its read event, writes at step `j+2` guarded by its
    /// compute event (and, to prevent write-before-read on reused host
    /// memory, by the next read's guard too).
    #[allow(clippy::too_many_arguments)]
    fn run_event_half(
        worker: &DeviceWorker,
        kernel_name: &str,
        arrays: &[Arc<dyn BoundArray>],
        base_offset: u64,
        segments: u64,
        seg: u64,
        local_range: u64,
        compute_id: i64,
        do_read: bool,
        do_write: bool,
        read_q: usize,
        compute_q: usize,
        write_q: usize,
    ) -> Result<()> {
        if segments == 0 {
            return Ok(());
        }
        let mut read_events: Vec<Event> = vec![Event::empty(); segments as usize];
        let mut compute_events: Vec<Event> = vec![Event::empty(); segments as usize];

        for j in 0..segments {
            let seg_offset = (base_offset + j * seg) as usize;
            if do_read {
                let mut ewait = EventList::new();
                if j > 0 {
                    ewait.push(compute_events[(j - 1) as usize].clone());
                }
                worker.queue(read_q);
                let arrays_for_read = arrays;
                let mut enew = Event::empty();
                for array in arrays_for_read {
                    use crate::array::RwPolicy::*;
                    match array.policy() {
                        PartialRead => array.write_partial(
                            worker.queue(read_q),
                            seg_offset,
                            seg as usize,
                            if ewait.len() == 0 { None } else { Some(&ewait) },
                            Some(&mut enew),
                        )?,
                        Read if j == 0 => array.write_whole(
                            worker.queue(read_q),
                            None,
                            Some(&mut enew),
                        )?,
                        _ => {}
                    }
                }
                read_events[j as usize] = enew;
            }

            if j > 0 {
                // Step j runs compute for segment j-1, guarded by its read
                // event (event-propagation rule 1).
                let prior = j - 1;
                let prior_offset = (base_offset + prior * seg) as usize;
                let mut ewait = EventList::new();
                if do_read {
                    ewait.push(read_events[prior as usize].clone());
                }
                if prior > 0 {
                    ewait.push(compute_events[(prior - 1) as usize].clone());
                }
                let mut enew = Event::empty();
                worker.compute_with_events(
                    kernel_name,
                    prior_offset,
                    seg as usize,
                    local_range,
                    compute_id,
                    worker.queue(compute_q),
                    if ewait.len() == 0 { None } else { Some(&ewait) },
                    Some(&mut enew),
                )?;
                compute_events[prior as usize] = enew;
            }

            if j > 1 && do_write {
                let prior2 = j - 2;
                let prior2_offset = (base_offset + prior2 * seg) as usize;
                let mut ewait = EventList::new();
                ewait.push(compute_events[prior2 as usize].clone());
                for array in arrays {
                    use crate::array::RwPolicy::*;
                    match array.policy() {
                        Write => array.read_partial(
                            worker.queue(write_q),
                            prior2_offset,
                            seg as usize,
                            Some(&ewait),
                            None,
                        )?,
                        WriteAll if prior2 == segments - 1 => {
                            array.read_whole(worker.queue(write_q), Some(&ewait))?
                        }
                        _ => {}
                    }
                }
            }
        }

        // Drain the final segment's compute: the loop above issues segment
        // j-1's compute at step j, so segment `segments - 1` is never
        // reached inside it and must be computed here, guarded by its own
        // read event and the previous segment's compute event.
        {
            let last = segments - 1;
            let last_offset = (base_offset + last * seg) as usize;
            let mut ewait = EventList::new();
            if do_read {
                ewait.push(read_events[last as usize].clone());
            }
            if last > 0 {
                ewait.push(compute_events[(last - 1) as usize].clone());
            }
            let mut enew = Event::empty();
            worker.compute_with_events(
                kernel_name,
                last_offset,
                seg as usize,
                local_range,
                compute_id,
                worker.queue(compute_q),
                if ewait.len() == 0 { None } else { Some(&ewait) },
                Some(&mut enew),
            )?;
            compute_events[last as usize] = enew;
        }

        // Drain the last one or two writes that haven't retired yet (the
        // pipeline above only retires a write two steps behind its
        // compute).
        if do_write {
            for tail in segments.saturating_sub(2)..segments {
                let tail_offset = (base_offset + tail * seg) as usize;
                let mut ewait = EventList::new();
                ewait.push(compute_events[tail as usize].clone());
                for array in arrays {
                    use crate::array::RwPolicy::*;
                    match array.policy() {
                        Write => array.read_partial(
                            worker.queue(write_q),
                            tail_offset,
                            seg as usize,
                            Some(&ewait),
                            None,
                        )?,
                        WriteAll if tail == segments - 1 => {
                            array.read_whole(worker.queue(write_q), Some(&ewait))?
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// DRIVER discipline: segment `k` is placed entirely on
    /// `queues[1 + (k mod 16)]` as the ordered triple (read, compute,
    /// write); the driver's own in-order queue semantics replace the
    /// explicit event DAG.
    #[allow(clippy::too_many_arguments)]
    fn run_driver(
        worker: &DeviceWorker,
        kernel_name: &str,
        arrays: &[Arc<dyn BoundArray>],
        offset: u64,
        n: u64,
        seg: u64,
        local_range: u64,
        compute_id: i64,
        do_read: bool,
        do_write: bool,
    ) -> Result<()> {
        use crate::worker::MAX_AUX_QUEUES;

        let used_queues: std::collections::BTreeSet<usize> = (0..n)
            .map(|k| 1 + (k as u32 % MAX_AUX_QUEUES) as usize)
            .collect();

        for k in 0..n {
            let q = worker.queue(1 + (k as u32 % MAX_AUX_QUEUES) as usize);
            let seg_offset = (offset + k * seg) as usize;
            if do_read {
                worker.write_to_buffer(arrays, seg_offset, seg as usize, q)?;
            }
            worker.compute(
                kernel_name,
                seg_offset,
                seg as usize,
                local_range,
                compute_id,
                q,
            )?;
            if do_write {
                worker.read_from_buffer(arrays, seg_offset, seg as usize, q)?;
            }
        }

        // Flush/finish parallelized across a small host thread pool,
        // pairing queues {q, 17-q} (spec.md §4.3/§5).
        let queues: Vec<usize> = used_queues.into_iter().collect();
        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::new();
            let mut pairs: Vec<(usize, Option<usize>)> = Vec::new();
            let mut seen = std::collections::HashSet::new();
            for &q in &queues {
                if seen.contains(&q) {
                    continue;
                }
                let partner = 17usize.checked_sub(q).filter(|p| queues.contains(p) && *p != q);
                if let Some(p) = partner {
                    seen.insert(p);
                }
                seen.insert(q);
                pairs.push((q, partner));
            }
            for (a, b) in pairs {
                handles.push(scope.spawn(move || -> Result<()> {
                    worker.flush(worker.queue(a))?;
                    worker.finish(worker.queue(a))?;
                    if let Some(b) = b {
                        worker.flush(worker.queue(b))?;
                        worker.finish(worker.queue(b))?;
                    }
                    Ok(())
                }));
            }
            for h in handles {
                h.join().map_err(|_| {
                    Error::ContractViolation("driver flush/finish worker thread panicked".into())
                })??;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feasibility_requires_stage_count_multiple_of_four() {
        assert!(!PipelineEngine::feasible(4096, 6, 64, 0));
        assert!(PipelineEngine::feasible(4096, 8, 64, 0));
    }

    #[test]
    fn feasibility_fails_on_too_many_repeats() {
        assert!(!PipelineEngine::feasible(4096, 8, 64, 2));
    }

    #[test]
    fn feasibility_scenario_s5() {
        // globalRange=100, localRange=64, pipelineStages=4: 100 < 4*64.
        assert!(!PipelineEngine::feasible(100, 4, 64, 0));
    }

    #[test]
    fn feasibility_scenario_s1() {
        assert!(PipelineEngine::feasible(4096, 8, 64, 0));
    }

    /// Builds a single-device worker bound to an identity kernel, with an
    /// input array (`Read` policy) and an output array (`Write` policy), for
    /// the GPU-gated pipeline-discipline tests below.
    fn build_identity_worker() -> Option<(
        DeviceWorker,
        Arc<dyn BoundArray>,
        Arc<dyn BoundArray>,
        std::sync::Arc<std::sync::Mutex<Vec<f32>>>,
        std::sync::Arc<std::sync::Mutex<Vec<f32>>>,
    )> {
        use crate::array::{ElementType, RwPolicy, TypedArray};
        use crate::device::try_list_devices;
        use std::sync::Mutex;

        let _ = env_logger::try_init();
        let devices = try_list_devices()?;
        let handle = devices.into_iter().next()?;
        let src = "__kernel void identity(__global const float* inp, __global float* outp) { \
                    size_t i = get_global_id(0); outp[i] = inp[i]; }";
        let context = ocl::Context::builder()
            .platform(handle.platform)
            .devices(handle.ocl_device)
            .build()
            .ok()?;
        let program = ocl::Program::builder()
            .devices(handle.ocl_device)
            .src(src)
            .cmplr_opt("-cl-std=CL1.2")
            .build(&context)
            .ok()?;
        let worker =
            DeviceWorker::new(handle, context, program, crate::worker::MAX_AUX_QUEUES).ok()?;

        let len = 4096usize;
        let input_host = Arc::new(Mutex::new((0..len).map(|i| i as f32).collect::<Vec<_>>()));
        let output_host = Arc::new(Mutex::new(vec![0.0f32; len]));
        let input_device = ocl::Buffer::builder()
            .queue(worker.primary_queue().clone())
            .len(len)
            .build()
            .ok()?;
        let output_device = ocl::Buffer::<f32>::builder()
            .queue(worker.primary_queue().clone())
            .len(len)
            .build()
            .ok()?;
        let input: Arc<dyn BoundArray> = Arc::new(TypedArray::new(
            RwPolicy::Read,
            ElementType::Float,
            Arc::clone(&input_host),
            input_device,
        ));
        let output: Arc<dyn BoundArray> = Arc::new(TypedArray::new(
            RwPolicy::Write,
            ElementType::Float,
            Arc::clone(&output_host),
            output_device,
        ));
        Some((worker, input, output, input_host, output_host))
    }

    /// S1/P2: a single pipelined EVENT-discipline pass over an identity
    /// kernel reproduces the host input exactly, for every segment.
    #[test]
    fn event_discipline_identity_round_trip() {
        let Some((worker, input, output, _input_host, output_host)) = build_identity_worker()
        else {
            return;
        };
        worker.kernel_argument("identity", &[Arc::clone(&input), Arc::clone(&output)], 1).unwrap();
        let arrays = vec![input, output];
        let result = PipelineEngine::run(
            &worker,
            &["identity"],
            &arrays,
            0,
            4096,
            64,
            8,
            PipelineDiscipline::Event,
            1,
            0,
            None,
        );
        assert!(result.is_ok(), "{result:?}");
        let out = output_host.lock().unwrap();
        for (i, &v) in out.iter().enumerate() {
            assert_eq!(v, i as f32, "segment boundary mismatch at index {i}");
        }
    }

    /// S6: DRIVER discipline with N=16 segments on a single device, each
    /// landing on a distinct queue, reproduces the host input exactly.
    #[test]
    fn driver_discipline_identity_round_trip() {
        let Some((worker, input, output, _input_host, output_host)) = build_identity_worker()
        else {
            return;
        };
        worker.kernel_argument("identity", &[Arc::clone(&input), Arc::clone(&output)], 2).unwrap();
        let arrays = vec![input, output];
        let result = PipelineEngine::run(
            &worker,
            &["identity"],
            &arrays,
            0,
            4096,
            64,
            16,
            PipelineDiscipline::Driver,
            2,
            0,
            None,
        );
        assert!(result.is_ok(), "{result:?}");
        let out = output_host.lock().unwrap();
        for (i, &v) in out.iter().enumerate() {
            assert_eq!(v, i as f32, "segment boundary mismatch at index {i}");
        }
    }

    /// P7: a DRIVER-mode `pipelineStages mod 4 != 0` violation aborts the
    /// pipeline with an error and leaves the host output array untouched,
    /// rather than issuing any partial/corrupt work.
    #[test]
    fn driver_discipline_mod_four_violation_does_not_corrupt_output() {
        let Some((worker, input, output, _input_host, output_host)) = build_identity_worker()
        else {
            return;
        };
        worker.kernel_argument("identity", &[Arc::clone(&input), Arc::clone(&output)], 3).unwrap();
        let arrays = vec![input, output];
        let result = PipelineEngine::run(
            &worker,
            &["identity"],
            &arrays,
            0,
            4096,
            64,
            6,
            PipelineDiscipline::Driver,
            3,
            0,
            None,
        );
        assert!(matches!(result, Err(Error::ContractViolation(_))));
        let out = output_host.lock().unwrap();
        assert!(out.iter().all(|&v| v == 0.0), "output must be untouched after an aborted pipeline");
    }
}
