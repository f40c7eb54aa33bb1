//! Preflight checks for PCI/USB passthrough readiness on a KVM host.
//!
//! [`facts::HostFactsCollector`] reads procfs and sysfs,
//! [`checker::RequirementChecker`] turns those facts into pass/warn/fail
//! events and a verdict, and [`hostdev`] lists the host devices a libvirt
//! domain has assigned.

pub mod checker;
pub mod diagnosis;
pub mod error;
pub mod facts;
pub mod hostdev;
pub mod report;

pub use checker::{Readiness, RequirementChecker};
pub use error::{PreflightError, Result};
pub use facts::{HostFacts, HostFactsCollector, KernelCmdline};
pub use report::{CheckEvent, EventKind, ReportSink};
