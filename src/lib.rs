//! Load-balanced, pipelined multi-device OpenCL job dispatcher.
//!
//! A `Cores` instance (`dispatcher::Cores`) owns a fixed set of
//! `DeviceWorker`s (one per selected device), a `LoadBalancer` that
//! reallocates a global workitem range across them call over call based on
//! measured throughput, and a `PipelineEngine` that overlaps host<->device
//! transfers with kernel execution per device. See `dispatcher::Cores` for
//! the public entry point.

pub mod array;
pub mod balancer;
pub mod device;
pub mod dispatcher;
pub mod enqueue;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod report;
pub mod worker;

pub use array::{BoundArray, ElementType, RwPolicy, TypedArray};
pub use balancer::LoadBalancer;
pub use device::{DeviceHandle, DeviceKind, MemoryPolicy};
pub use dispatcher::{ComputeOptions, Cores, CoresBuilder, AFFINITY_REFRESH_PERIOD, DEFAULT_LOCAL_RANGE};
pub use error::{Error, Result};
pub use history::{History, HISTORY_DEPTH};
pub use pipeline::{PipelineDiscipline, PipelineEngine};
pub use worker::{DeviceWorker, MAX_AUX_QUEUES};
