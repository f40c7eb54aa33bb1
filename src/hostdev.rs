//! Host devices assigned to hypervisor domains.
//!
//! The hypervisor is reached through the `virsh` client. A session only
//! remembers the endpoint it was verified against; every query is a separate
//! `virsh -c <uri>` invocation.

use crate::error::{PreflightError, Result};
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::process::{Command, Output};

pub const DEFAULT_URI: &str = "qemu:///system";
pub const VIRSH: &str = "virsh";

/// A domain known to the hypervisor. Inactive domains have no id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainRef {
    pub id: Option<u32>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostDevKind {
    Pci,
    Usb,
}

impl HostDevKind {
    fn from_attr(value: &str) -> Option<Self> {
        match value {
            "pci" => Some(HostDevKind::Pci),
            "usb" => Some(HostDevKind::Usb),
            _ => None,
        }
    }
}

impl fmt::Display for HostDevKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostDevKind::Pci => f.write_str("pci"),
            HostDevKind::Usb => f.write_str("usb"),
        }
    }
}

/// Host-side identity of an assigned device, when the XML carries one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HostDevSource {
    /// `domain:bus:slot.function`, e.g. `0000:01:00.0`
    Pci { address: String },
    Usb {
        vendor: Option<String>,
        product: Option<String>,
    },
}

impl fmt::Display for HostDevSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostDevSource::Pci { address } => f.write_str(address),
            HostDevSource::Usb { vendor, product } => write!(
                f,
                "{}:{}",
                vendor.as_deref().unwrap_or("????"),
                product.as_deref().unwrap_or("????")
            ),
        }
    }
}

/// One `<hostdev>` element of a domain description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostDeviceRef {
    pub kind: HostDevKind,
    /// The element exactly as it appears in the domain XML.
    pub fragment: String,
    pub source: Option<HostDevSource>,
}

/// Read access to a hypervisor's domains.
pub trait Hypervisor {
    fn list_domains(&self) -> Result<Vec<DomainRef>>;

    /// XML description of the named domain. [`PreflightError::NotFound`] if
    /// no such domain exists.
    fn domain_xml(&self, name: &str) -> Result<String>;
}

/// A verified connection to a libvirt endpoint through `virsh`.
#[derive(Debug)]
pub struct VirshSession {
    program: String,
    uri: String,
}

impl VirshSession {
    /// Opens a session to the libvirt endpoint at `uri` using the `virsh`
    /// found on `PATH`.
    ///
    /// The endpoint is probed once with `virsh -c <uri> uri`, so an
    /// unreachable daemon or a refused connection is reported here rather
    /// than on the first query.
    ///
    /// # Errors
    ///
    /// - [`PreflightError::Connection`] if `virsh` cannot be started, or it
    ///   exits non-zero (daemon down, permission denied, bad URI). The
    ///   message carries the first line `virsh` printed on stderr.
    pub fn connect(uri: &str) -> Result<Self> {
        Self::connect_with(VIRSH, uri)
    }

    /// Like [`connect`](Self::connect) with an explicit client binary.
    pub fn connect_with(program: &str, uri: &str) -> Result<Self> {
        let session = Self {
            program: program.to_string(),
            uri: uri.to_string(),
        };
        let output = session.virsh(&["uri"])?;
        if !output.status.success() {
            return Err(PreflightError::Connection(format!(
                "{uri}: {}",
                stderr_line(&output)
            )));
        }
        info!(
            "connected to {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(session)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn virsh(&self, args: &[&str]) -> Result<Output> {
        debug!("{} -c {} {}", self.program, self.uri, args.join(" "));
        Command::new(&self.program)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .env("LC_ALL", "C")
            .output()
            .map_err(|e| PreflightError::Connection(format!("cannot run {}: {e}", self.program)))
    }
}

impl Drop for VirshSession {
    fn drop(&mut self) {
        debug!("releasing hypervisor session {}", self.uri);
    }
}

impl Hypervisor for VirshSession {
    fn list_domains(&self) -> Result<Vec<DomainRef>> {
        let output = self.virsh(&["list", "--all"])?;
        if !output.status.success() {
            return Err(PreflightError::Connection(stderr_line(&output)));
        }
        Ok(parse_domain_list(&String::from_utf8_lossy(&output.stdout)))
    }

    fn domain_xml(&self, name: &str) -> Result<String> {
        let output = self.virsh(&["dumpxml", name])?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("failed to get domain") || stderr.contains("Domain not found") {
            Err(PreflightError::NotFound(name.to_string()))
        } else {
            Err(PreflightError::Connection(stderr_line(&output)))
        }
    }
}

fn stderr_line(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no error output")
        .to_string()
}

/// Opens a session, runs `f` with it and releases it on every exit path.
pub fn with_session<T>(uri: &str, f: impl FnOnce(&VirshSession) -> Result<T>) -> Result<T> {
    with_session_via(VIRSH, uri, f)
}

/// Like [`with_session`] with an explicit client binary.
pub fn with_session_via<T>(
    program: &str,
    uri: &str,
    f: impl FnOnce(&VirshSession) -> Result<T>,
) -> Result<T> {
    let session = VirshSession::connect_with(program, uri)?;
    f(&session)
}

/// Parses the table printed by `virsh list --all`:
///
/// ```text
///  Id   Name         State
/// -----------------------------
///  1    win10        running
///  -    Windows 11   shut off
/// ```
///
/// Domain names may contain spaces, so rows are cut at the character
/// columns where the `Name` and `State` headers start. A table without a
/// recognisable header falls back to whitespace-separated fields.
pub fn parse_domain_list(table: &str) -> Vec<DomainRef> {
    let mut lines = table.lines();
    let mut columns = None;
    for line in lines.by_ref() {
        if line.trim_start().starts_with("---") {
            break;
        }
        if columns.is_none() {
            columns = header_columns(line);
        }
    }

    lines
        .filter_map(|line| {
            let (id, name) = match columns {
                Some((name_col, state_col)) => {
                    let id: String = line.chars().take(name_col).collect();
                    let name: String = line
                        .chars()
                        .skip(name_col)
                        .take(state_col - name_col)
                        .collect();
                    (id.trim().to_string(), name.trim().to_string())
                }
                None => {
                    let mut fields = line.split_whitespace();
                    (fields.next()?.to_string(), fields.next()?.to_string())
                }
            };
            if name.is_empty() {
                return None;
            }
            Some(DomainRef {
                id: id.parse().ok(),
                name,
            })
        })
        .collect()
}

/// Character columns of the `Name` and `State` headers.
fn header_columns(line: &str) -> Option<(usize, usize)> {
    let column = |header: &str| {
        line.find(header)
            .map(|byte| line[..byte].chars().count())
    };
    let name = column("Name")?;
    let state = column("State")?;
    (state > name).then_some((name, state))
}

/// Selects `/domain/devices/hostdev[@type="pci" or @type="usb"]` in
/// document order.
///
/// A description without host devices yields an empty list. The same input
/// always yields the same list; nothing is merged or deduplicated.
pub fn extract_host_devices(xml: &str) -> Result<Vec<HostDeviceRef>> {
    let doc = roxmltree::Document::parse(xml)?;
    let domain = doc.root_element();
    if !domain.has_tag_name("domain") {
        return Ok(Vec::new());
    }

    let devices = domain
        .children()
        .filter(|n| n.has_tag_name("devices"))
        .flat_map(|devices| devices.children())
        .filter(|n| n.has_tag_name("hostdev"))
        .filter_map(|node| {
            let kind = HostDevKind::from_attr(node.attribute("type")?)?;
            Some(HostDeviceRef {
                kind,
                fragment: xml[node.range()].to_string(),
                source: host_dev_source(kind, node),
            })
        })
        .collect();
    Ok(devices)
}

fn host_dev_source(kind: HostDevKind, hostdev: roxmltree::Node<'_, '_>) -> Option<HostDevSource> {
    let source = hostdev.children().find(|n| n.has_tag_name("source"))?;
    let child = |name: &str| source.children().find(|n| n.has_tag_name(name));
    match kind {
        HostDevKind::Pci => {
            let addr = child("address")?;
            let field = |name: &str| addr.attribute(name).and_then(parse_hex);
            Some(HostDevSource::Pci {
                address: format!(
                    "{:04x}:{:02x}:{:02x}.{:x}",
                    field("domain").unwrap_or(0),
                    field("bus")?,
                    field("slot")?,
                    field("function")?
                ),
            })
        }
        HostDevKind::Usb => Some(HostDevSource::Usb {
            vendor: child("vendor").and_then(|n| n.attribute("id")).map(str::to_string),
            product: child("product").and_then(|n| n.attribute("id")).map(str::to_string),
        }),
    }
}

fn parse_hex(value: &str) -> Option<u32> {
    match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Host devices assigned to the named domain.
pub fn domain_host_devices(hv: &dyn Hypervisor, name: &str) -> Result<Vec<HostDeviceRef>> {
    let xml = hv.domain_xml(name)?;
    let devices = extract_host_devices(&xml)?;
    debug!("domain {name}: {} host devices", devices.len());
    Ok(devices)
}
