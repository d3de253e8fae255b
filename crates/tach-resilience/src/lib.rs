//! ---
//! tach_section: "07-resilience-fault-tolerance"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Network fault profiles, injection, and retry policies."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Network degradation layer placed between the harness and the collaborator.

pub mod injector;
pub mod metrics;
pub mod profile;
pub mod retry;

pub use injector::{FaultError, FaultInjector, FaultStats, OperationClass};
pub use metrics::FaultMetrics;
pub use profile::{DelayMode, FaultProfile, FaultProfileCatalog, ProfileError};
pub use retry::RetryPolicy;
