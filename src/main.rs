use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use vfio_preflight::checker::RequirementChecker;
use vfio_preflight::facts::HostFactsCollector;
use vfio_preflight::hostdev::{self, HostDeviceRef, Hypervisor, VirshSession};
use vfio_preflight::report::{ConsoleSink, JsonLinesSink, ReportSink};
use vfio_preflight::{PreflightError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Console,
    Json,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Filesystem root to inspect instead of the running host
    #[arg(long, env = "VFIO_PREFLIGHT_ROOT", default_value = "/")]
    root: PathBuf,

    /// Hypervisor URI (e.g., qemu:///system)
    #[arg(short, long, env = "LIBVIRT_DEFAULT_URI", default_value = hostdev::DEFAULT_URI)]
    connect: String,

    /// List all domains known to the hypervisor
    #[arg(short, long)]
    list_domains: bool,

    /// Show PCI/USB host devices assigned to this domain
    #[arg(short, long)]
    domain: Option<String>,

    /// Do not run the passthrough requirement check
    #[arg(long)]
    skip_checks: bool,

    /// virsh client to run for hypervisor queries
    #[arg(long, env = "VFIO_PREFLIGHT_VIRSH", default_value = hostdev::VIRSH, hide = true)]
    virsh: String,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
    format: OutputFormat,
}

#[derive(Serialize)]
struct DomainDevices<'a> {
    domain: &'a str,
    devices: &'a [HostDeviceRef],
}

fn run_checks(args: &Args) -> Result<()> {
    let mut sink: Box<dyn ReportSink> = match args.format {
        OutputFormat::Console => {
            println!("=== Passthrough Requirement Check ===");
            Box::new(ConsoleSink::stdout())
        }
        OutputFormat::Json => Box::new(JsonLinesSink::new(std::io::stdout())),
    };

    let collector = HostFactsCollector::new(&args.root);
    let facts = collector.collect()?;
    let cmdline = collector.collect_cmdline()?;

    RequirementChecker::new(sink.as_mut()).run(&facts, &cmdline)?;
    Ok(())
}

fn list_domains(session: &VirshSession, format: OutputFormat) -> Result<()> {
    let domains = session.list_domains()?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&domains)?),
        OutputFormat::Console => {
            println!("\n=== Domains on {} ===", session.uri());
            if domains.is_empty() {
                println!("  o No domains defined");
            }
            for domain in &domains {
                let id = domain.id.map_or("-".to_string(), |id| id.to_string());
                println!("  {id:>4}  {}", domain.name);
            }
        }
    }
    Ok(())
}

fn show_domain_devices(session: &VirshSession, name: &str, format: OutputFormat) -> Result<()> {
    let devices = hostdev::domain_host_devices(session, name)?;
    match format {
        OutputFormat::Json => {
            let doc = DomainDevices {
                domain: name,
                devices: &devices,
            };
            println!("{}", serde_json::to_string(&doc)?);
        }
        OutputFormat::Console => {
            println!("\n=== Host devices assigned to {name} ===");
            if devices.is_empty() {
                println!("  o No PCI/USB host devices assigned");
            }
            for device in &devices {
                let source = device
                    .source
                    .as_ref()
                    .map_or("unknown source".to_string(), |s| s.to_string());
                println!("  v {} {source}", device.kind);
                for line in device.fragment.lines() {
                    println!("       {}", line.trim_end());
                }
            }
        }
    }
    Ok(())
}

fn query_domains(args: &Args) -> Result<()> {
    hostdev::with_session_via(&args.virsh, &args.connect, |session| {
        if args.list_domains {
            list_domains(session, args.format)?;
        }
        if let Some(name) = &args.domain {
            show_domain_devices(session, name, args.format)?;
        }
        Ok(())
    })
}

/// Runs the requirement check and any requested domain query. A failed
/// check does not prevent the domain query; every failure is returned.
fn run(args: &Args) -> Vec<PreflightError> {
    let mut errors = Vec::new();
    if !args.skip_checks {
        if let Err(e) = run_checks(args) {
            errors.push(e);
        }
    }
    if args.list_domains || args.domain.is_some() {
        if let Err(e) = query_domains(args) {
            errors.push(e);
        }
    }
    errors
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let errors = run(&args);
    for e in &errors {
        // Environment fatals were already reported by the checker.
        if !e.is_environment_fatal() {
            eprintln!("x {e}");
        }
    }
    if errors.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
