//! Array-binding data model: read/write policy, element typing, and the
//! type-erased handle `DeviceWorker`/`PipelineEngine` transfer through.
//!
//! The buffer abstraction itself (host-pinned vs. streaming memory,
//! allocation) is an external collaborator — the `ocl` crate's
//! `Buffer<T>`. This module only adds the per-call policy metadata and a
//! small object-safe trait so callers can pass a heterogeneous list of
//! typed buffers (`u8`, `u32`, `f32`, ...) through one `&[Arc<dyn
//! BoundArray>]` without the rest of the crate becoming generic over
//! element type.

use std::sync::{Arc, Mutex};

use ocl::{Buffer, Event, EventList, OclPrm, Queue};

use crate::error::{Error, Result};

/// Per-compute-call read/write policy for one array binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RwPolicy {
    /// Each device reads only `[offset, offset+range)`.
    PartialRead,
    /// Each device reads the entire host array.
    Read,
    /// Each device writes back only its own slice.
    Write,
    /// A single device writes the entire array, unchecked. Only valid when
    /// exactly one device carries nonzero range this call.
    WriteAll,
}

/// Element type discriminant, mirroring the set of numeric types the
/// buffer collaborator supports. Carried alongside `TypedArray<T>` purely
/// for `performanceReport()`/diagnostics; `T: OclPrm` is the real type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    Byte,
    Char,
    Int,
    Uint,
    Long,
    Float,
    Double,
}

/// Object-safe view over one array binding, hiding its element type so
/// `DeviceWorker` and `PipelineEngine` can operate on a
/// `&[Arc<dyn BoundArray>]` of mixed element types.
///
/// The host array is held behind `Arc<Mutex<Vec<T>>>` — this is the
/// strong-reference registry from spec.md §3/§4.4 step 2 given concrete
/// shape: registering an array for a call is cloning the `Arc`, which
/// keeps the backing `Vec` alive until every clone (including the
/// dispatcher's registry entry) is dropped.
pub trait BoundArray: Send + Sync {
    fn policy(&self) -> RwPolicy;
    fn element_type(&self) -> ElementType;
    fn len(&self) -> usize;

    /// `partial-read`: transfer only `[offset, offset+range)`.
    fn write_partial(
        &self,
        queue: &Queue,
        offset: usize,
        range: usize,
        ewait: Option<&EventList>,
        enew: Option<&mut Event>,
    ) -> Result<()>;

    /// `read`: transfer the whole host array once.
    fn write_whole(
        &self,
        queue: &Queue,
        ewait: Option<&EventList>,
        enew: Option<&mut Event>,
    ) -> Result<()>;

    /// `write`: device -> host for just this device's slice.
    fn read_partial(
        &self,
        queue: &Queue,
        offset: usize,
        range: usize,
        ewait: Option<&EventList>,
        enew: Option<&mut Event>,
    ) -> Result<()>;

    /// `write-all`: a single device writes back the entire array.
    fn read_whole(&self, queue: &Queue, ewait: Option<&EventList>) -> Result<()>;

    /// Appends this array as the next positional kernel argument while a
    /// `Kernel` is being built. Each element type knows its own `Buffer<T>`
    /// concretely, so binding happens here rather than through a generic
    /// method on `DeviceWorker`.
    fn bind_into_builder<'b>(&'b self, builder: &mut ocl::builders::KernelBuilder<'b>);
}

/// A host array of element type `T`, paired with its device-side buffer.
pub struct TypedArray<T: OclPrm> {
    policy: RwPolicy,
    element_type: ElementType,
    host: Arc<Mutex<Vec<T>>>,
    device: Buffer<T>,
}

impl<T: OclPrm> TypedArray<T> {
    pub fn new(
        policy: RwPolicy,
        element_type: ElementType,
        host: Arc<Mutex<Vec<T>>>,
        device: Buffer<T>,
    ) -> Self {
        Self {
            policy,
            element_type,
            host,
            device,
        }
    }

    pub fn host_handle(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.host)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<T>>> {
        self.host
            .lock()
            .map_err(|_| Error::PoisonedLock("array host lock".into()))
    }
}

impl<T: OclPrm> BoundArray for TypedArray<T> {
    fn policy(&self) -> RwPolicy {
        self.policy
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn len(&self) -> usize {
        self.lock().map(|h| h.len()).unwrap_or(0)
    }

    fn write_partial(
        &self,
        queue: &Queue,
        offset: usize,
        range: usize,
        ewait: Option<&EventList>,
        enew: Option<&mut Event>,
    ) -> Result<()> {
        let host = self.lock()?;
        let mut cmd = self.device.cmd().queue(queue).offset(offset).write(&host[offset..offset + range]);
        if let Some(ewait) = ewait {
            cmd = cmd.ewait(ewait);
        }
        if let Some(enew) = enew {
            cmd = cmd.enew(enew);
        }
        cmd.enq()?;
        Ok(())
    }

    fn write_whole(
        &self,
        queue: &Queue,
        ewait: Option<&EventList>,
        enew: Option<&mut Event>,
    ) -> Result<()> {
        let host = self.lock()?;
        let mut cmd = self.device.cmd().queue(queue).write(&host[..]);
        if let Some(ewait) = ewait {
            cmd = cmd.ewait(ewait);
        }
        if let Some(enew) = enew {
            cmd = cmd.enew(enew);
        }
        cmd.enq()?;
        Ok(())
    }

    fn read_partial(
        &self,
        queue: &Queue,
        offset: usize,
        range: usize,
        ewait: Option<&EventList>,
        enew: Option<&mut Event>,
    ) -> Result<()> {
        let mut host = self.lock()?;
        let mut cmd = self
            .device
            .cmd()
            .queue(queue)
            .offset(offset)
            .read(&mut host[offset..offset + range]);
        if let Some(ewait) = ewait {
            cmd = cmd.ewait(ewait);
        }
        if let Some(enew) = enew {
            cmd = cmd.enew(enew);
        }
        cmd.enq()?;
        Ok(())
    }

    fn read_whole(&self, queue: &Queue, ewait: Option<&EventList>) -> Result<()> {
        let mut host = self.lock()?;
        let mut cmd = self.device.cmd().queue(queue).read(&mut host[..]);
        if let Some(ewait) = ewait {
            cmd = cmd.ewait(ewait);
        }
        cmd.enq()?;
        Ok(())
    }

    fn bind_into_builder<'b>(&'b self, builder: &mut ocl::builders::KernelBuilder<'b>) {
        builder.arg(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_variants_are_distinct() {
        assert_ne!(RwPolicy::Read, RwPolicy::Write);
        assert_ne!(RwPolicy::PartialRead, RwPolicy::WriteAll);
    }
}
