//! The ordered requirement check.
//!
//! The run is a small state machine:
//!
//! ```text
//! Init -> KernelChecked -> SysfsChecked -> PerSocketLoop -> Done
//!   \__________________\_______________\_______________\___> abort (Fatal)
//! ```
//!
//! Only one socket needs both hardware virtualization and a registered IOMMU
//! for the host to be ready. Sockets are evaluated in collection order, each
//! producing a [`SocketVerdict`]; the loop stops at the first ready socket.
//! Whether the run ends in success or a fatal error is decided once, after
//! the loop, from the verdict of the last socket evaluated.

use crate::diagnosis;
use crate::error::{PreflightError, Result};
use crate::facts::{CpuFacts, HostFacts, HvmFlag, KernelCmdline, KernelVersionInfo};
use crate::report::{CheckEvent, CheckName, ReportSink};
use log::{debug, info};
use serde::Serialize;

/// Oldest kernel with the VFIO features passthrough setups rely on.
pub const MIN_KERNEL: (u32, u32) = (4, 8);

const SYSFS_HINT: &str = "mount -t sysfs sysfs /sys";
const HVM_HINT: &str = "Enable Intel VT-x / AMD-V (SVM) in BIOS/UEFI settings";
const IOMMU_HINT: &str =
    "Enable VT-d / AMD-Vi in BIOS/UEFI settings and the IOMMU kernel parameter, then reboot";

/// Successful outcome: the first socket able to back passthrough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub socket_id: usize,
    pub model_name: String,
    pub hvm_flag: HvmFlag,
}

/// Result of evaluating one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketVerdict {
    /// Neither `vmx` nor `svm` is advertised. IOMMU not evaluated.
    NoHvm,
    /// Virtualization present, IOMMU not registered.
    IommuMissing,
    Ready,
}

#[derive(Debug)]
enum CheckState {
    Init,
    KernelChecked,
    SysfsChecked,
    PerSocketLoop,
    Done(Readiness),
}

/// Kernel version check. Advisory only: an old kernel is a `Warn`.
pub fn check_kernel(version: &KernelVersionInfo) -> CheckEvent {
    let (major, minor) = MIN_KERNEL;
    if version.at_least(major, minor) {
        CheckEvent::pass(
            CheckName::Kernel,
            format!("kernel {} is {major}.{minor} or newer", version.full),
        )
    } else {
        CheckEvent::warn(
            CheckName::Kernel,
            format!("kernel {} is older than {major}.{minor}", version.full),
        )
        .with_hint(format!("Upgrade to a {major}.{minor}+ kernel for VFIO passthrough"))
    }
}

/// Sysfs check: `/sys` mounted as sysfs, readable, with a
/// `/sys/class/iommu` directory. Any failure is `Fatal`.
pub fn check_sysfs(facts: &HostFacts) -> CheckEvent {
    let mounted = facts
        .mounts
        .iter()
        .any(|m| m.mountpoint == "/sys" && m.fstype == "sysfs");

    let failure = if !mounted {
        Some("/sys is not mounted as sysfs")
    } else if !facts.sysfs.sys_readable {
        Some("/sys is not readable")
    } else if !facts.sysfs.iommu_class_is_dir {
        Some("/sys/class/iommu is missing or not a directory")
    } else {
        None
    };

    match failure {
        Some(message) => CheckEvent::fatal(CheckName::Sysfs, message).with_hint(SYSFS_HINT),
        None => CheckEvent::pass(CheckName::Sysfs, "sysfs mounted at /sys with /sys/class/iommu"),
    }
}

/// Runs the ordered checks and reports every outcome to a sink.
pub struct RequirementChecker<'a> {
    sink: &'a mut dyn ReportSink,
}

impl<'a> RequirementChecker<'a> {
    pub fn new(sink: &'a mut dyn ReportSink) -> Self {
        Self { sink }
    }

    /// Executes the full check sequence.
    ///
    /// Returns the first socket with both hardware virtualization and an
    /// active IOMMU. A fatal condition is reported to the sink exactly once
    /// and returned as [`PreflightError::EnvironmentFatal`]. An empty CPU list
    /// is a [`PreflightError::Parse`] collection failure.
    pub fn run(&mut self, facts: &HostFacts, cmdline: &KernelCmdline) -> Result<Readiness> {
        let mut state = CheckState::Init;
        loop {
            debug!("requirement check state: {state:?}");
            state = match state {
                CheckState::Init => {
                    let event = check_kernel(&facts.kernel);
                    self.sink.report(&event);
                    CheckState::KernelChecked
                }
                CheckState::KernelChecked => {
                    let event = check_sysfs(facts);
                    self.sink.report(&event);
                    if event.is_fatal() {
                        return Err(PreflightError::EnvironmentFatal {
                            message: event.message,
                            hint: SYSFS_HINT.into(),
                            socket: None,
                        });
                    }
                    CheckState::SysfsChecked
                }
                CheckState::SysfsChecked => {
                    if facts.cpus.is_empty() {
                        return Err(PreflightError::Parse {
                            path: "/proc/cpuinfo".into(),
                            reason: "no CPU records found".into(),
                        });
                    }
                    CheckState::PerSocketLoop
                }
                CheckState::PerSocketLoop => {
                    CheckState::Done(self.scan_sockets(facts, cmdline)?)
                }
                CheckState::Done(readiness) => {
                    info!(
                        "socket {} ({}) is ready for passthrough",
                        readiness.socket_id, readiness.model_name
                    );
                    self.sink.ready(&readiness);
                    return Ok(readiness);
                }
            };
        }
    }

    /// Evaluates sockets in order until one is ready, then makes the single
    /// terminal decision.
    fn scan_sockets(&mut self, facts: &HostFacts, cmdline: &KernelCmdline) -> Result<Readiness> {
        let mut last = None;
        for cpu in &facts.cpus {
            let verdict = self.evaluate_socket(cpu, facts, cmdline);
            last = Some((cpu, verdict));
            if verdict == SocketVerdict::Ready {
                break;
            }
        }

        // cpus is non-empty, checked before entering the loop
        let Some((cpu, verdict)) = last else {
            return Err(PreflightError::Parse {
                path: "/proc/cpuinfo".into(),
                reason: "no CPU records found".into(),
            });
        };

        let (message, hint) = match verdict {
            SocketVerdict::Ready => {
                return Ok(Readiness {
                    socket_id: cpu.socket_id,
                    model_name: cpu.model_name.clone(),
                    hvm_flag: cpu.hvm_flag,
                });
            }
            SocketVerdict::NoHvm => ("no CPU with VT-x/AMD-V detected", HVM_HINT),
            SocketVerdict::IommuMissing => ("no CPU with enabled IOMMU detected", IOMMU_HINT),
        };
        let check = match verdict {
            SocketVerdict::NoHvm => CheckName::Hvm,
            _ => CheckName::Iommu,
        };
        self.sink.report(
            &CheckEvent::fatal(check, message)
                .on_socket(cpu.socket_id)
                .with_hint(hint),
        );
        Err(PreflightError::EnvironmentFatal {
            message: message.into(),
            hint: hint.into(),
            socket: Some(cpu.socket_id),
        })
    }

    fn evaluate_socket(
        &mut self,
        cpu: &CpuFacts,
        facts: &HostFacts,
        cmdline: &KernelCmdline,
    ) -> SocketVerdict {
        let socket = cpu.socket_id;
        let Some(vendor) = cpu.hvm_flag.vendor() else {
            self.sink.report(
                &CheckEvent::warn(
                    CheckName::Hvm,
                    format!("no VT-x/AMD-V flag on {}", cpu.model_name),
                )
                .on_socket(socket),
            );
            return SocketVerdict::NoHvm;
        };
        self.sink.report(
            &CheckEvent::pass(
                CheckName::Hvm,
                format!("{} supported on {}", cpu.hvm_flag, cpu.model_name),
            )
            .on_socket(socket),
        );

        if facts.iommu.present {
            self.sink.report(
                &CheckEvent::pass(CheckName::Iommu, "IOMMU registered in /sys/class/iommu")
                    .on_socket(socket),
            );
            return SocketVerdict::Ready;
        }

        self.sink.report(
            &CheckEvent::fail(CheckName::Iommu, "/sys/class/iommu has no entries")
                .on_socket(socket),
        );
        let issue = match diagnosis::suggest(vendor, cmdline) {
            Ok(diag) => CheckEvent::issue(
                CheckName::Iommu,
                format!("{}: {}", diag.message, diag.excerpt),
            )
            .with_hint(diag.hint),
            Err(e) => CheckEvent::issue(CheckName::Iommu, e.to_string()),
        };
        self.sink.report(&issue.on_socket(socket));
        SocketVerdict::IommuMissing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{IommuState, MountEntry, SysfsState};
    use crate::report::{EventKind, MemorySink};
    use proptest::prelude::*;

    fn cpu(socket_id: usize, hvm_flag: HvmFlag) -> CpuFacts {
        CpuFacts {
            socket_id,
            model_name: format!("CPU-{socket_id}"),
            hvm_flag,
        }
    }

    fn healthy_facts(cpus: Vec<CpuFacts>, iommu_present: bool) -> HostFacts {
        HostFacts {
            kernel: KernelVersionInfo::parse("6.8.0").unwrap(),
            mounts: vec![MountEntry::parse("sysfs /sys sysfs rw,nosuid 0 0").unwrap()],
            sysfs: SysfsState {
                sys_readable: true,
                iommu_class_is_dir: true,
            },
            cpus,
            iommu: IommuState {
                present: iommu_present,
            },
        }
    }

    fn run(facts: &HostFacts, cmdline: &str) -> (Result<Readiness>, MemorySink) {
        let mut sink = MemorySink::new();
        let result = RequirementChecker::new(&mut sink).run(facts, &KernelCmdline::new(cmdline));
        (result, sink)
    }

    fn hvm_flag() -> impl Strategy<Value = HvmFlag> {
        prop_oneof![Just(HvmFlag::None), Just(HvmFlag::Vmx), Just(HvmFlag::Svm)]
    }

    fn sockets(flags: Vec<HvmFlag>) -> Vec<CpuFacts> {
        flags.into_iter().enumerate().map(|(i, f)| cpu(i, f)).collect()
    }

    #[test]
    fn test_old_kernel_warns_but_continues() {
        let mut facts = healthy_facts(vec![cpu(0, HvmFlag::Vmx)], true);
        facts.kernel = KernelVersionInfo::parse("4.4.0-210-generic").unwrap();

        let (result, sink) = run(&facts, "");
        assert!(result.is_ok());
        assert_eq!(sink.events[0].kind, EventKind::Warn);
        assert_eq!(sink.events[0].check, CheckName::Kernel);
    }

    #[test]
    fn test_sysfs_not_mounted_is_fatal() {
        let mut facts = healthy_facts(vec![cpu(0, HvmFlag::Vmx)], true);
        facts.mounts = vec![MountEntry::parse("proc /proc proc rw 0 0").unwrap()];

        let event = check_sysfs(&facts);
        assert_eq!(event.kind, EventKind::Fatal);
        assert_eq!(event.hint.as_deref(), Some(SYSFS_HINT));

        let (result, sink) = run(&facts, "");
        assert!(result.unwrap_err().is_environment_fatal());
        assert_eq!(sink.count(EventKind::Fatal), 1);
        assert!(sink.events.iter().all(|e| e.check != CheckName::Hvm));
    }

    #[test]
    fn test_sysfs_unreadable_or_missing_iommu_class_is_fatal() {
        let mut facts = healthy_facts(vec![cpu(0, HvmFlag::Vmx)], true);
        facts.sysfs.sys_readable = false;
        assert_eq!(check_sysfs(&facts).kind, EventKind::Fatal);

        facts.sysfs.sys_readable = true;
        facts.sysfs.iommu_class_is_dir = false;
        assert_eq!(check_sysfs(&facts).kind, EventKind::Fatal);
    }

    #[test]
    fn test_sysfs_pass() {
        let facts = healthy_facts(vec![cpu(0, HvmFlag::Vmx)], true);
        assert_eq!(check_sysfs(&facts).kind, EventKind::Pass);
    }

    #[test]
    fn test_empty_cpu_list_is_collection_error() {
        let facts = healthy_facts(Vec::new(), true);
        let (result, sink) = run(&facts, "");
        assert!(matches!(result, Err(PreflightError::Parse { .. })));
        assert_eq!(sink.count(EventKind::Pass), 2);
    }

    #[test]
    fn test_falls_back_to_next_socket() {
        let facts = healthy_facts(
            vec![cpu(0, HvmFlag::None), cpu(1, HvmFlag::Vmx), cpu(2, HvmFlag::None)],
            true,
        );
        let (result, sink) = run(&facts, "");

        assert_eq!(result.unwrap().socket_id, 1);
        assert_eq!(sink.readiness.as_ref().map(|r| r.socket_id), Some(1));
        assert_eq!(sink.for_socket(0).count(), 1);
        assert_eq!(sink.for_socket(2).count(), 0);
        assert_eq!(sink.count(EventKind::Fatal), 0);
    }

    #[test]
    fn test_intel_iommu_issue_quotes_cmdline() {
        let facts = healthy_facts(vec![cpu(0, HvmFlag::Vmx)], false);
        let (result, sink) = run(&facts, "BOOT_IMAGE=/vmlinuz ro quiet");

        assert!(result.is_err());
        let issue = sink
            .events
            .iter()
            .find(|e| e.kind == EventKind::Issue)
            .unwrap();
        assert!(issue.message.contains("intel_iommu"));
        assert!(issue.message.contains(">>>intel_iommu=on<<<"));
    }

    #[test]
    fn test_amd_enabled_reports_unsupported_issue() {
        let facts = healthy_facts(vec![cpu(0, HvmFlag::Svm), cpu(1, HvmFlag::Svm)], false);
        let (result, sink) = run(&facts, "ro amd_iommu=on");

        assert!(result.is_err());
        let issues: Vec<_> = sink
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Issue)
            .collect();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|e| e.message.contains("not yet diagnosable")));
    }

    #[test]
    fn test_last_socket_decides_fatal_message() {
        let facts = healthy_facts(vec![cpu(0, HvmFlag::Vmx), cpu(1, HvmFlag::None)], false);
        let (result, sink) = run(&facts, "");

        match result {
            Err(PreflightError::EnvironmentFatal { message, socket, .. }) => {
                assert_eq!(message, "no CPU with VT-x/AMD-V detected");
                assert_eq!(socket, Some(1));
            }
            other => panic!("expected fatal, got {other:?}"),
        }
        assert_eq!(sink.count(EventKind::Fail), 1);
        assert!(sink.readiness.is_none());
    }

    proptest! {
        #[test]
        fn prop_kernel_warns_iff_older_than_4_8(major in 0u32..10, minor in 0u32..30) {
            let version = KernelVersionInfo::parse(&format!("{major}.{minor}.0")).unwrap();
            let kind = check_kernel(&version).kind;
            let old = (major, minor) < (4, 8);
            prop_assert_eq!(kind == EventKind::Warn, old);
            prop_assert_eq!(kind == EventKind::Pass, !old);
        }

        #[test]
        fn prop_first_capable_socket_wins(flags in proptest::collection::vec(hvm_flag(), 1..8)) {
            prop_assume!(flags.iter().any(|f| *f != HvmFlag::None));
            let first = flags.iter().position(|f| *f != HvmFlag::None).unwrap();
            let facts = healthy_facts(sockets(flags.clone()), true);
            let (result, sink) = run(&facts, "");

            prop_assert_eq!(result.unwrap().socket_id, first);
            prop_assert!(sink.events.iter().all(|e| e.socket.map_or(true, |s| s <= first)));
            prop_assert_eq!(sink.count(EventKind::Fatal), 0);
        }

        #[test]
        fn prop_no_hvm_anywhere_is_one_fatal_on_last(n in 1usize..8) {
            let facts = healthy_facts(sockets(vec![HvmFlag::None; n]), true);
            let (result, sink) = run(&facts, "");

            prop_assert!(result.is_err());
            prop_assert_eq!(sink.count(EventKind::Fatal), 1);
            let fatal = sink.events.iter().find(|e| e.is_fatal()).unwrap();
            prop_assert_eq!(fatal.socket, Some(n - 1));
            prop_assert_eq!(fatal.check, CheckName::Hvm);
            prop_assert_eq!(sink.count(EventKind::Warn), n);
        }

        #[test]
        fn prop_no_iommu_anywhere_fails_each_socket(
            flags in proptest::collection::vec(prop_oneof![Just(HvmFlag::Vmx), Just(HvmFlag::Svm)], 1..8)
        ) {
            let n = flags.len();
            let facts = healthy_facts(sockets(flags), false);
            let (result, sink) = run(&facts, "");

            prop_assert!(result.is_err());
            prop_assert_eq!(sink.count(EventKind::Fail), n);
            prop_assert_eq!(sink.count(EventKind::Fatal), 1);
            let fatal = sink.events.last().unwrap();
            prop_assert!(fatal.is_fatal());
            prop_assert_eq!(fatal.socket, Some(n - 1));
            prop_assert_eq!(&fatal.message, "no CPU with enabled IOMMU detected");
        }
    }
}
