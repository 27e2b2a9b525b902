//! Minimal init (PID 1) for VM images converted from container images.
//!
//! Once a container is promoted to a VM there is no orchestrator to
//! inject configuration, supervise the workload, or handle signals.
//! Preinit fills that role: at boot it fetches a declarative [`VMSpec`]
//! from the instance metadata service, merges it over the defaults
//! baked into the image, applies kernel tunables, starts the enabled
//! auxiliary services, launches the workload as the supervised main
//! process, and drives an orderly shutdown when the workload exits or
//! the hypervisor presses the virtual power button.

pub mod boot;
pub mod constants;
pub mod errors;
pub mod imds;
pub mod service;
pub mod sysctl;
pub mod vmspec;

pub use errors::{MultiError, PreinitError, PreinitResult};
pub use vmspec::VMSpec;
