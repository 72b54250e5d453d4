//! Memory residency of primitive inputs.
//!
//! Every primitive call works on inputs that live in one memory space. Host
//! containers report [`Residency::Host`], device buffers report
//! [`Residency::Device`], and unified allocations that both sides can reach
//! report [`Residency::Managed`]. Mixing host and device inputs in one call is
//! rejected before any work is issued.

use crate::error::{BalancedKMeansError, Result};
use ndarray::{ArrayBase, Data, Dimension};

/// Where a buffer can be dereferenced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    /// Reachable from host code only
    Host,
    /// Reachable from device code only
    Device,
    /// Reachable from both host and device code
    Managed,
}

impl Residency {
    /// Whether host code can read and write the buffer.
    pub fn host_accessible(self) -> bool {
        matches!(self, Residency::Host | Residency::Managed)
    }

    /// Whether device kernels can read and write the buffer.
    pub fn device_accessible(self) -> bool {
        matches!(self, Residency::Device | Residency::Managed)
    }
}

/// Anything that can report the memory space it lives in.
pub trait Resident {
    fn residency(&self) -> Residency;
}

impl<S, D> Resident for ArrayBase<S, D>
where
    S: Data,
    D: Dimension,
{
    fn residency(&self) -> Residency {
        Residency::Host
    }
}

impl<T> Resident for [T] {
    fn residency(&self) -> Residency {
        Residency::Host
    }
}

impl<T> Resident for Vec<T> {
    fn residency(&self) -> Residency {
        Residency::Host
    }
}

impl<R: Resident + ?Sized> Resident for &R {
    fn residency(&self) -> Residency {
        (**self).residency()
    }
}

impl<R: Resident + ?Sized> Resident for &mut R {
    fn residency(&self) -> Residency {
        (**self).residency()
    }
}

#[cfg(feature = "cuda")]
impl<T> Resident for cudarc::driver::CudaSlice<T> {
    fn residency(&self) -> Residency {
        Residency::Device
    }
}

/// Classify the common residency of a set of inputs.
///
/// Managed inputs adopt the residency of the others; an all-managed set stays
/// managed. Host and device inputs together are a fatal mismatch.
pub fn classify(residencies: &[Residency]) -> Result<Residency> {
    let mut common = Residency::Managed;
    for &r in residencies {
        common = match (common, r) {
            (Residency::Managed, other) | (other, Residency::Managed) => other,
            (a, b) if a == b => a,
            (found, other) => return Err(BalancedKMeansError::ResidencyMismatch { found, other }),
        };
    }
    Ok(common)
}

/// Classify a list of resident inputs, see [`classify`].
pub fn classify_inputs(inputs: &[&dyn Resident]) -> Result<Residency> {
    let residencies: Vec<Residency> = inputs.iter().map(|r| r.residency()).collect();
    classify(&residencies)
}
