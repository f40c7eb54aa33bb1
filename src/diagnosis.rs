//! Remediation advice for a socket whose IOMMU is not active.

use crate::error::{PreflightError, Result};
use crate::facts::{CpuVendor, KernelCmdline};

/// Tokens shown on each side of the highlighted one.
const EXCERPT_CONTEXT: usize = 3;
const MARK_OPEN: &str = ">>>";
const MARK_CLOSE: &str = "<<<";

/// Operator-facing remediation for a failed IOMMU check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub message: String,
    pub hint: String,
    /// Kernel command line with the offending or missing token delimited.
    pub excerpt: String,
}

/// Proposes a fix for an absent IOMMU given the CPU vendor and the kernel
/// command line the host booted with.
///
/// # Intel (VT-d)
///
/// The kernel needs `intel_iommu=on` on most distributions. A missing token
/// is shown where it would be appended; a token with any other value is
/// highlighted in place:
///
/// ```text
/// ... ro quiet splash >>>intel_iommu=on<<<
/// ... ro >>>intel_iommu=off<<< quiet ...
/// ```
///
/// When `intel_iommu=on` is already set the remaining cause is VT-d being
/// disabled in firmware.
///
/// # AMD (AMD-Vi)
///
/// A missing or wrong `amd_iommu=` value is handled like the Intel case. An
/// explicit `amd_iommu=on` with no IOMMU registered is returned as
/// [`PreflightError::UnsupportedPath`]: the cause cannot be determined from
/// the command line.
pub fn suggest(vendor: CpuVendor, cmdline: &KernelCmdline) -> Result<Diagnosis> {
    match vendor {
        CpuVendor::Intel => Ok(suggest_intel(cmdline)),
        CpuVendor::Amd => suggest_amd(cmdline),
    }
}

fn suggest_intel(cmdline: &KernelCmdline) -> Diagnosis {
    match cmdline.param("intel_iommu") {
        None => missing_param(cmdline, "intel_iommu"),
        Some("on") => Diagnosis {
            message: "intel_iommu=on is set but no IOMMU is registered".into(),
            hint: "Enable VT-d (Intel Virtualization Technology for Directed I/O) in BIOS/UEFI settings".into(),
            excerpt: render_excerpt(cmdline, Focus::Token("intel_iommu=on")),
        },
        Some(value) => wrong_param(cmdline, "intel_iommu", value),
    }
}

fn suggest_amd(cmdline: &KernelCmdline) -> Result<Diagnosis> {
    match cmdline.param("amd_iommu") {
        None => Ok(missing_param(cmdline, "amd_iommu")),
        Some("on") => Err(PreflightError::UnsupportedPath(
            "amd_iommu=on is set but no IOMMU is registered".into(),
        )),
        Some(value) => Ok(wrong_param(cmdline, "amd_iommu", value)),
    }
}

fn missing_param(cmdline: &KernelCmdline, key: &str) -> Diagnosis {
    let wanted = format!("{key}=on");
    Diagnosis {
        message: format!("{key} is missing from the kernel command line"),
        hint: grub_hint(&wanted),
        excerpt: render_excerpt(cmdline, Focus::Missing(&wanted)),
    }
}

fn wrong_param(cmdline: &KernelCmdline, key: &str, value: &str) -> Diagnosis {
    let found = format!("{key}={value}");
    Diagnosis {
        message: format!("kernel command line has {found}, expected {key}=on"),
        hint: grub_hint(&format!("{key}=on")),
        excerpt: render_excerpt(cmdline, Focus::Token(&found)),
    }
}

fn grub_hint(param: &str) -> String {
    format!(
        "Add to /etc/default/grub: GRUB_CMDLINE_LINUX_DEFAULT=\"... {param} iommu=pt\"\n\
         Then run: sudo update-grub && sudo reboot"
    )
}

enum Focus<'a> {
    /// Highlight the last occurrence of this token.
    Token(&'a str),
    /// Show this token appended after the existing ones.
    Missing(&'a str),
}

fn render_excerpt(cmdline: &KernelCmdline, focus: Focus<'_>) -> String {
    let mut tokens: Vec<String> = cmdline.tokens().map(str::to_string).collect();
    let at = match focus {
        Focus::Token(token) => match tokens.iter().rposition(|t| t == token) {
            Some(i) => i,
            None => {
                tokens.push(token.to_string());
                tokens.len() - 1
            }
        },
        Focus::Missing(token) => {
            tokens.push(token.to_string());
            tokens.len() - 1
        }
    };
    tokens[at] = format!("{MARK_OPEN}{}{MARK_CLOSE}", tokens[at]);

    let start = at.saturating_sub(EXCERPT_CONTEXT);
    let end = (at + EXCERPT_CONTEXT + 1).min(tokens.len());
    let mut parts = Vec::with_capacity(end - start + 2);
    if start > 0 {
        parts.push("...".to_string());
    }
    parts.extend_from_slice(&tokens[start..end]);
    if end < tokens.len() {
        parts.push("...".to_string());
    }
    parts.join(" ")
}
