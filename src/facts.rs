//! Raw host facts read from procfs and sysfs.
//!
//! Nothing in this module passes judgment on what it reads. The collector
//! re-reads the pseudo-files on every call so that two collectors pointed at
//! the same tree always observe its current state.

use crate::error::{PreflightError, Result};
use log::debug;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const OSRELEASE: &str = "proc/sys/kernel/osrelease";
const MOUNTS: &str = "proc/mounts";
const CPUINFO: &str = "proc/cpuinfo";
const CMDLINE: &str = "proc/cmdline";
const SYS: &str = "sys";
const IOMMU_CLASS: &str = "sys/class/iommu";

/// Running kernel release, e.g. `6.8.0-45-generic` → 6.8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelVersionInfo {
    pub major: u32,
    pub minor: u32,
    pub full: String,
}

impl KernelVersionInfo {
    /// Parses a kernel release string. Only the leading `major.minor`
    /// digits are significant; any suffix (`-rc1`, `-generic`) is kept in
    /// `full` only.
    pub fn parse(release: &str) -> Option<Self> {
        let full = release.trim();
        let mut parts = full.splitn(3, '.');
        let major = leading_number(parts.next()?)?;
        let minor = leading_number(parts.next()?)?;
        Some(Self {
            major,
            minor,
            full: full.to_string(),
        })
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// One line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub options: String,
}

impl MountEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        Some(Self {
            device: fields.next()?.to_string(),
            mountpoint: fields.next()?.to_string(),
            fstype: fields.next()?.to_string(),
            options: fields.next()?.to_string(),
        })
    }
}

/// Hardware virtualization extension advertised by a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HvmFlag {
    None,
    /// Intel VT-x
    Vmx,
    /// AMD-V
    Svm,
}

impl HvmFlag {
    /// Picks the flag out of a cpuinfo `flags` field. Tokens are matched
    /// exactly, so `vmx_ept` style sub-features never count.
    pub fn from_flags(flags: &str) -> Self {
        let mut flag = HvmFlag::None;
        for token in flags.split_whitespace() {
            match token {
                "vmx" => return HvmFlag::Vmx,
                "svm" => flag = HvmFlag::Svm,
                _ => {}
            }
        }
        flag
    }

    pub fn vendor(self) -> Option<CpuVendor> {
        match self {
            HvmFlag::Vmx => Some(CpuVendor::Intel),
            HvmFlag::Svm => Some(CpuVendor::Amd),
            HvmFlag::None => None,
        }
    }
}

impl fmt::Display for HvmFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HvmFlag::None => write!(f, "none"),
            HvmFlag::Vmx => write!(f, "Intel VT-x (vmx)"),
            HvmFlag::Svm => write!(f, "AMD-V (svm)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CpuVendor {
    Intel,
    Amd,
}

/// Capabilities of one physical CPU socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuFacts {
    pub socket_id: usize,
    pub model_name: String,
    pub hvm_flag: HvmFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IommuState {
    pub present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SysfsState {
    pub sys_readable: bool,
    pub iommu_class_is_dir: bool,
}

/// Kernel boot parameters as read from `/proc/cmdline`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct KernelCmdline(String);

impl KernelCmdline {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split_whitespace()
    }

    /// Value of the last `key=value` token for `key`. The kernel honours the
    /// last occurrence when a parameter repeats.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.tokens()
            .filter_map(|t| t.split_once('='))
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .last()
    }

    /// True if `token` appears verbatim, e.g. `amd_iommu=on`.
    pub fn contains_token(&self, token: &str) -> bool {
        self.tokens().any(|t| t == token)
    }
}

impl fmt::Display for KernelCmdline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One consistent reading of everything the requirement check needs.
#[derive(Debug, Clone, Serialize)]
pub struct HostFacts {
    pub kernel: KernelVersionInfo,
    pub mounts: Vec<MountEntry>,
    pub sysfs: SysfsState,
    pub cpus: Vec<CpuFacts>,
    pub iommu: IommuState,
}

/// Reads host facts below a filesystem root (`/` on a live host).
#[derive(Debug, Clone)]
pub struct HostFactsCollector {
    root: PathBuf,
}

impl Default for HostFactsCollector {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HostFactsCollector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn read(&self, rel: &str) -> Result<String> {
        let path = self.path(rel);
        debug!("reading {}", path.display());
        fs::read_to_string(&path).map_err(|source| PreflightError::Collection { path, source })
    }

    /// Reads the running kernel release from `/proc/sys/kernel/osrelease`.
    ///
    /// # Errors
    ///
    /// - [`PreflightError::Collection`] if the file cannot be read
    /// - [`PreflightError::Parse`] if it does not start with `major.minor`
    pub fn collect_kernel_version(&self) -> Result<KernelVersionInfo> {
        let release = self.read(OSRELEASE)?;
        KernelVersionInfo::parse(&release).ok_or_else(|| PreflightError::Parse {
            path: self.path(OSRELEASE),
            reason: format!("unrecognised kernel release {:?}", release.trim()),
        })
    }

    /// Reads `/proc/mounts`, one [`MountEntry`] per line in file order.
    ///
    /// Lines with fewer than four fields are skipped and logged at debug
    /// level; they never fail the collection.
    ///
    /// # Errors
    ///
    /// - [`PreflightError::Collection`] if `/proc/mounts` cannot be read
    pub fn collect_mounts(&self) -> Result<Vec<MountEntry>> {
        let content = self.read(MOUNTS)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let entry = MountEntry::parse(line);
                if entry.is_none() {
                    debug!("skipping malformed mount line {line:?}");
                }
                entry
            })
            .collect())
    }

    /// Parses `/proc/cpuinfo` into one entry per physical socket.
    ///
    /// Records are blank-line separated, one per logical processor. Records
    /// sharing a `physical id` belong to the same socket and the first record
    /// seen describes it. A record without `physical id` (some VMs and
    /// non-x86 kernels) is its own socket, keyed on its `processor` index.
    /// Socket ids follow encounter order in the file.
    ///
    /// # Errors
    ///
    /// - [`PreflightError::Collection`] if `/proc/cpuinfo` cannot be read.
    ///   An empty result is not an error here; the checker rejects it.
    pub fn collect_cpu_facts(&self) -> Result<Vec<CpuFacts>> {
        let content = self.read(CPUINFO)?;
        let mut seen: Vec<String> = Vec::new();
        let mut cpus = Vec::new();

        for (index, record) in content.split("\n\n").enumerate() {
            let mut processor = None;
            let mut physical_id = None;
            let mut model_name = None;
            let mut flags = None;
            for line in record.lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                match key.trim() {
                    "processor" => processor = Some(value),
                    "physical id" => physical_id = Some(value),
                    "model name" => model_name = Some(value),
                    "flags" => flags = Some(value),
                    _ => {}
                }
            }
            if processor.is_none() && flags.is_none() {
                continue;
            }

            let key = match physical_id {
                Some(id) => format!("physical:{id}"),
                None => format!("processor:{}", processor.map_or(index.to_string(), str::to_string)),
            };
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);

            let hvm_flag = HvmFlag::from_flags(flags.unwrap_or_default());
            debug!(
                "socket {} ({}) hvm={hvm_flag}",
                cpus.len(),
                model_name.unwrap_or("unknown")
            );
            cpus.push(CpuFacts {
                socket_id: cpus.len(),
                model_name: model_name.unwrap_or("unknown").to_string(),
                hvm_flag,
            });
        }
        Ok(cpus)
    }

    /// True if `/sys/class/iommu` exists and lists at least one IOMMU
    /// (`dmar0`, `ivhd0`, ...). A missing or unreadable directory counts as
    /// empty.
    pub fn iommu_directory_has_entries(&self) -> bool {
        fs::read_dir(self.path(IOMMU_CLASS))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Whether `/sys` can be listed and `/sys/class/iommu` is a directory.
    ///
    /// Never fails: an unreadable path is recorded as `false` and judged by
    /// the sysfs check.
    pub fn collect_sysfs_state(&self) -> SysfsState {
        SysfsState {
            sys_readable: fs::read_dir(self.path(SYS)).is_ok(),
            iommu_class_is_dir: self.path(IOMMU_CLASS).is_dir(),
        }
    }

    /// Reads the kernel boot parameters from `/proc/cmdline`.
    ///
    /// # Errors
    ///
    /// - [`PreflightError::Collection`] if the file cannot be read
    pub fn collect_cmdline(&self) -> Result<KernelCmdline> {
        self.read(CMDLINE).map(KernelCmdline::new)
    }

    /// Collects every fact the requirement check needs in one snapshot.
    ///
    /// # Errors
    ///
    /// Any error from [`collect_kernel_version`](Self::collect_kernel_version),
    /// [`collect_mounts`](Self::collect_mounts) or
    /// [`collect_cpu_facts`](Self::collect_cpu_facts).
    pub fn collect(&self) -> Result<HostFacts> {
        Ok(HostFacts {
            kernel: self.collect_kernel_version()?,
            mounts: self.collect_mounts()?,
            sysfs: self.collect_sysfs_state(),
            cpus: self.collect_cpu_facts()?,
            iommu: IommuState {
                present: self.iommu_directory_has_entries(),
            },
        })
    }
}
