//! Structured check events and the sinks that render them.

use crate::checker::Readiness;
use serde::Serialize;
use std::fmt;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Pass,
    Warn,
    Fail,
    Fatal,
    Issue,
}

impl EventKind {
    /// Line marker used by the console sink.
    pub fn marker(self) -> &'static str {
        match self {
            EventKind::Pass => "v",
            EventKind::Warn => "!",
            EventKind::Fail => "x",
            EventKind::Fatal => "X",
            EventKind::Issue => "?",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckName {
    Kernel,
    Sysfs,
    Hvm,
    Iommu,
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckName::Kernel => "kernel",
            CheckName::Sysfs => "sysfs",
            CheckName::Hvm => "hvm",
            CheckName::Iommu => "iommu",
        };
        f.write_str(name)
    }
}

/// One outcome emitted by a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckEvent {
    pub kind: EventKind,
    pub check: CheckName,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl CheckEvent {
    pub fn new(kind: EventKind, check: CheckName, message: impl Into<String>) -> Self {
        Self {
            kind,
            check,
            message: message.into(),
            socket: None,
            hint: None,
        }
    }

    pub fn pass(check: CheckName, message: impl Into<String>) -> Self {
        Self::new(EventKind::Pass, check, message)
    }

    pub fn warn(check: CheckName, message: impl Into<String>) -> Self {
        Self::new(EventKind::Warn, check, message)
    }

    pub fn fail(check: CheckName, message: impl Into<String>) -> Self {
        Self::new(EventKind::Fail, check, message)
    }

    pub fn fatal(check: CheckName, message: impl Into<String>) -> Self {
        Self::new(EventKind::Fatal, check, message)
    }

    pub fn issue(check: CheckName, message: impl Into<String>) -> Self {
        Self::new(EventKind::Issue, check, message)
    }

    pub fn on_socket(mut self, socket: usize) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == EventKind::Fatal
    }
}

/// Receives the outcome of a requirement check as it happens.
///
/// The checker calls [`report`](ReportSink::report) once per event, in check
/// order. A run ends either with one `Fatal` event or with a single call to
/// [`ready`](ReportSink::ready) naming the socket that passed, never both.
///
/// Sinks cannot fail the run. Implementations that write to a stream log or
/// drop their own write errors.
pub trait ReportSink {
    fn report(&mut self, event: &CheckEvent);

    /// The host is ready; `readiness` names the first capable socket.
    fn ready(&mut self, _readiness: &Readiness) {}
}

#[derive(Serialize)]
struct ReadyLine<'a> {
    kind: &'static str,
    #[serde(flatten)]
    readiness: &'a Readiness,
}

/// Prints one marker-prefixed line per event, hints indented below.
///
/// ```text
///   v [kernel] kernel 6.8.0-45-generic is 4.8 or newer
///   ! [hvm] socket 0: no VT-x/AMD-V flag on Intel(R) Xeon(R)
///   X [hvm] socket 1: no CPU with VT-x/AMD-V detected
///      Enable Intel VT-x / AMD-V (SVM) in BIOS/UEFI settings
/// ```
pub struct ConsoleSink<W: Write> {
    out: W,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for ConsoleSink<W> {
    fn report(&mut self, event: &CheckEvent) {
        let socket = event
            .socket
            .map(|s| format!("socket {s}: "))
            .unwrap_or_default();
        // Write errors on the report stream are ignored.
        let _ = writeln!(
            self.out,
            "  {} [{}] {socket}{}",
            event.kind.marker(),
            event.check,
            event.message
        );
        if let Some(hint) = &event.hint {
            for line in hint.lines() {
                let _ = writeln!(self.out, "     {line}");
            }
        }
    }

    fn ready(&mut self, readiness: &Readiness) {
        let _ = writeln!(
            self.out,
            "\nv Host is ready for passthrough (socket {}: {}, {})",
            readiness.socket_id, readiness.model_name, readiness.hvm_flag
        );
    }
}

/// Writes each event as one JSON object per line.
pub struct JsonLinesSink<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> ReportSink for JsonLinesSink<W> {
    fn report(&mut self, event: &CheckEvent) {
        match serde_json::to_string(event) {
            Ok(line) => {
                let _ = writeln!(self.out, "{line}");
            }
            Err(e) => log::warn!("cannot serialize event: {e}"),
        }
    }

    fn ready(&mut self, readiness: &Readiness) {
        let line = ReadyLine {
            kind: "ready",
            readiness,
        };
        match serde_json::to_string(&line) {
            Ok(line) => {
                let _ = writeln!(self.out, "{line}");
            }
            Err(e) => log::warn!("cannot serialize readiness: {e}"),
        }
    }
}

/// Keeps every event, and the final readiness if any, in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<CheckEvent>,
    pub readiness: Option<Readiness>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }

    pub fn for_socket(&self, socket: usize) -> impl Iterator<Item = &CheckEvent> {
        self.events.iter().filter(move |e| e.socket == Some(socket))
    }
}

impl ReportSink for MemorySink {
    fn report(&mut self, event: &CheckEvent) {
        self.events.push(event.clone());
    }

    fn ready(&mut self, readiness: &Readiness) {
        self.readiness = Some(readiness.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::HvmFlag;

    #[test]
    fn test_console_sink_formats_socket_and_hint() {
        let mut sink = ConsoleSink::new(Vec::new());
        sink.report(
            &CheckEvent::fatal(CheckName::Sysfs, "/sys is not mounted as sysfs")
                .with_hint("mount -t sysfs sysfs /sys"),
        );
        sink.report(&CheckEvent::warn(CheckName::Hvm, "no VT-x/AMD-V flag").on_socket(2));

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "  X [sysfs] /sys is not mounted as sysfs");
        assert_eq!(lines[1], "     mount -t sysfs sysfs /sys");
        assert_eq!(lines[2], "  ! [hvm] socket 2: no VT-x/AMD-V flag");
    }

    #[test]
    fn test_json_sink_skips_empty_fields() {
        let mut buf = Vec::new();
        JsonLinesSink::new(&mut buf).report(&CheckEvent::pass(CheckName::Kernel, "ok"));

        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["kind"], "pass");
        assert_eq!(value["check"], "kernel");
        assert!(value.get("socket").is_none());
        assert!(value.get("hint").is_none());
    }

    #[test]
    fn test_json_sink_ends_with_ready_line() {
        let mut buf = Vec::new();
        let mut sink = JsonLinesSink::new(&mut buf);
        sink.report(&CheckEvent::pass(CheckName::Kernel, "ok"));
        sink.ready(&Readiness {
            socket_id: 1,
            model_name: "CPU-B".into(),
            hvm_flag: HvmFlag::Vmx,
        });

        let text = String::from_utf8(buf).unwrap();
        let last: serde_json::Value = serde_json::from_str(text.lines().last().unwrap()).unwrap();
        assert_eq!(last["kind"], "ready");
        assert_eq!(last["socket_id"], 1);
        assert_eq!(last["model_name"], "CPU-B");
        assert_eq!(last["hvm_flag"], "vmx");
    }

    #[test]
    fn test_console_sink_ready_line() {
        let mut sink = ConsoleSink::new(Vec::new());
        sink.ready(&Readiness {
            socket_id: 0,
            model_name: "CPU-A".into(),
            hvm_flag: HvmFlag::Svm,
        });
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.contains("v Host is ready for passthrough (socket 0: CPU-A, AMD-V (svm))"));
    }

    #[test]
    fn test_memory_sink_counts() {
        let mut sink = MemorySink::new();
        sink.report(&CheckEvent::fail(CheckName::Iommu, "a").on_socket(0));
        sink.report(&CheckEvent::fail(CheckName::Iommu, "b").on_socket(1));
        sink.report(&CheckEvent::pass(CheckName::Kernel, "c"));
        assert_eq!(sink.count(EventKind::Fail), 2);
        assert_eq!(sink.for_socket(1).count(), 1);
    }
}
