//! ---
//! tach_section: "01-core-functionality"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Runtime helpers supporting the scenario runner."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
//! Accelerated time and task scheduling helpers for the Tachyon runtime.

pub mod abort;
pub mod clock;
pub mod scheduling;

pub use abort::{AbortHandle, AbortSignal};
pub use clock::{ClockError, ClockReport, VirtualClock};
pub use scheduling::{SampleTicker, Tick, WorkerGroup};
