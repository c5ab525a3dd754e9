//! # eBPF Idle Source
//!
//! Loads the `itc-ebpf` object, attaches one idle tracepoint and feeds the
//! resulting [`IdleEvent`]s into the accounting service.
//!
//! ## Hook Resolution
//!
//! 1. `power/cpu_idle` if tracefs exposes it (`cpu_idle_hook`)
//! 2. otherwise the configured fallback; only `sched/sched_switch` is
//!    understood (`sched_switch_idle_hook`)
//! 3. otherwise [`ItcError::NoIdleMechanism`]
//!
//! ## Threading
//!
//! The `Ebpf` object and its ring buffer live on a dedicated drain thread
//! for their whole life. The source talks to it over a command channel:
//!
//! ```text
//!  EbpfIdleSource ──Flush/Stop──▶ drain thread ──on_idle_*_at──▶ service
//!                 ◀───done──────   (RingBuf)
//! ```
//!
//! Between commands the thread drains every `drain_interval`; a `Flush`
//! drains immediately so a snapshot sees every event emitted before it.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::{MapData, PerCpuArray, RingBuf};
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::TracePoint;
use aya::Ebpf;
use aya_log::EbpfLogger;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use itc_common::{IdleEvent, COUNTER_DROPPED, COUNTER_EMITTED};
use log::{debug, info, trace, warn};
use serde::Serialize;

use super::wake::broadcast_wake;
use super::IdleEventSource;
use crate::accounting::IdleAccountingService;
use crate::config::EbpfConfig;
use crate::domain::{CpuId, ItcError, Tracepoint};
use crate::topology::CpuTopology;

/// How long a flush waits for the drain thread
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Event counters of one installed session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    /// Events applied to the accounting service
    pub delivered: u64,
    /// Ring buffer records that did not decode to an idle event
    pub malformed: u64,
    /// Events the kernel side wrote to the ring buffer
    pub emitted: u64,
    /// Events the kernel side lost to a full ring buffer
    pub dropped: u64,
}

/// Tracepoint plus the program in the object that handles it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPoint {
    pub tracepoint: Tracepoint,
    pub program: &'static str,
}

impl HookPoint {
    #[must_use]
    pub fn cpu_idle() -> Self {
        Self { tracepoint: Tracepoint::new("power", "cpu_idle"), program: "cpu_idle_hook" }
    }

    #[must_use]
    pub fn sched_switch() -> Self {
        Self {
            tracepoint: Tracepoint::new("sched", "sched_switch"),
            program: "sched_switch_idle_hook",
        }
    }
}

fn exposed(roots: &[impl AsRef<Path>], tracepoint: &Tracepoint) -> bool {
    roots.iter().any(|root| {
        root.as_ref().join("events").join(&tracepoint.category).join(&tracepoint.name).is_dir()
    })
}

/// Pick the tracepoint to attach
///
/// # Errors
/// - [`ItcError::InvalidArgument`] for a fallback no program handles
/// - [`ItcError::NoIdleMechanism`] if neither hook is available
pub fn resolve_hook(config: &EbpfConfig) -> Result<HookPoint, ItcError> {
    let primary = HookPoint::cpu_idle();
    if exposed(&config.tracefs_roots, &primary.tracepoint) {
        return Ok(primary);
    }

    let Some(fallback) = &config.fallback else {
        return Err(ItcError::NoIdleMechanism(format!(
            "{} is not exposed by tracefs and no fallback tracepoint is configured",
            primary.tracepoint
        )));
    };

    let hook = HookPoint::sched_switch();
    if *fallback != hook.tracepoint {
        return Err(ItcError::InvalidArgument(format!(
            "unsupported fallback tracepoint {fallback} (supported: {})",
            hook.tracepoint
        )));
    }

    if !exposed(&config.tracefs_roots, &hook.tracepoint) {
        return Err(ItcError::NoIdleMechanism(format!(
            "neither {} nor fallback {} is exposed by tracefs",
            primary.tracepoint, hook.tracepoint
        )));
    }

    info!("{} unavailable, using fallback {}", primary.tracepoint, hook.tracepoint);
    Ok(hook)
}

/// Decode one ring buffer record
#[must_use]
pub fn parse_event(bytes: &[u8]) -> Option<IdleEvent> {
    if bytes.len() < IdleEvent::SIZE {
        return None;
    }

    // SAFETY: length checked above; IdleEvent is repr(C) plain data
    #[allow(unsafe_code)]
    let event = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<IdleEvent>()) };
    Some(event)
}

/// Apply one event to `sink`; false if its kind is unknown
pub fn deliver(sink: &IdleAccountingService, event: &IdleEvent) -> bool {
    let cpu = CpuId(event.cpu_id);
    let at = Duration::from_nanos(event.timestamp_ns);

    if event.is_enter() {
        sink.on_idle_enter_at(cpu, at);
    } else if event.is_exit() {
        sink.on_idle_exit_at(cpu, at);
    } else {
        return false;
    }

    trace!("{cpu} {} at {at:?}", if event.is_enter() { "enter" } else { "exit" });
    true
}

enum Command {
    Flush(Sender<()>),
    Stop,
}

struct Worker {
    commands: Sender<Command>,
    handle: JoinHandle<SourceStats>,
}

/// [`IdleEventSource`] backed by kernel tracepoints
pub struct EbpfIdleSource {
    config: EbpfConfig,
    topology: Arc<dyn CpuTopology>,
    worker: Option<Worker>,
    hook: Option<HookPoint>,
}

impl EbpfIdleSource {
    pub fn new(config: EbpfConfig, topology: Arc<dyn CpuTopology>) -> Self {
        Self { config, topology, worker: None, hook: None }
    }

    /// Hook attached by the last successful install
    pub fn hook(&self) -> Option<&HookPoint> {
        self.hook.as_ref()
    }

    pub fn is_installed(&self) -> bool {
        self.worker.is_some()
    }
}

impl IdleEventSource for EbpfIdleSource {
    fn name(&self) -> &'static str {
        "ebpf"
    }

    fn install(&mut self, sink: Arc<IdleAccountingService>) -> Result<(), ItcError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let hook = resolve_hook(&self.config)?;
        let worker = spawn_worker(&self.config, &hook, sink)?;
        self.worker = Some(worker);
        self.hook = Some(hook);
        Ok(())
    }

    fn uninstall(&mut self) -> Result<SourceStats, ItcError> {
        let Some(worker) = self.worker.take() else {
            return Ok(SourceStats::default());
        };

        // A send failure means the thread is already gone; join reports why
        let _ = worker.commands.send(Command::Stop);
        let stats = worker.handle.join().map_err(|_| {
            ItcError::Io(std::io::Error::other("eBPF drain thread panicked"))
        })?;

        info!(
            "✓ Detached eBPF idle hook ({} delivered, {} dropped)",
            stats.delivered, stats.dropped
        );
        Ok(stats)
    }

    fn wake_all_cpus(&self) -> Result<(), ItcError> {
        let cpus = self.topology.present_cpus()?;
        broadcast_wake(&cpus, self.config.wake_timeout)
    }

    fn flush(&self) -> Result<(), ItcError> {
        let Some(worker) = &self.worker else { return Ok(()) };
        let gone = || {
            ItcError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "eBPF drain thread is not running",
            ))
        };

        let (done_tx, done_rx) = bounded(1);
        worker.commands.send(Command::Flush(done_tx)).map_err(|_| gone())?;
        done_rx.recv_timeout(FLUSH_TIMEOUT).map_err(|_| gone())
    }
}

impl Drop for EbpfIdleSource {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.uninstall() {
                warn!("Failed to stop eBPF idle source: {e}");
            }
        }
    }
}

fn spawn_worker(
    config: &EbpfConfig,
    hook: &HookPoint,
    sink: Arc<IdleAccountingService>,
) -> Result<Worker, ItcError> {
    let (commands, command_rx) = unbounded();
    let (ready_tx, ready_rx) = bounded::<Result<(), ItcError>>(1);

    // aya-log forwards records from an async task; borrow the caller's runtime if any
    let runtime = tokio::runtime::Handle::try_current().ok();
    let config = config.clone();
    let hook = hook.clone();

    let handle = thread::Builder::new().name("itc-ebpf-drain".to_string()).spawn(move || {
        let _runtime = runtime.as_ref().map(tokio::runtime::Handle::enter);

        match Attached::open(&config, &hook) {
            Ok(attached) => {
                let _ = ready_tx.send(Ok(()));
                attached.run(&sink, &command_rx, config.drain_interval)
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                SourceStats::default()
            }
        }
    })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Worker { commands, handle }),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(ItcError::EbpfLoadFailed("eBPF drain thread exited during setup".to_string()))
        }
    }
}

/// Loaded object with one attached program; owned by the drain thread
struct Attached {
    bpf: Ebpf,
    ring: RingBuf<MapData>,
    program: &'static str,
    link: Option<TracePointLinkId>,
    stats: SourceStats,
}

impl Attached {
    fn open(config: &EbpfConfig, hook: &HookPoint) -> Result<Self, ItcError> {
        let load_failed = |e: anyhow::Error| ItcError::EbpfLoadFailed(format!("{e:#}"));

        let mut bpf = load_object(&config.object_path).map_err(load_failed)?;
        init_ebpf_logger(&mut bpf);

        let ring = bpf
            .take_map("EVENTS")
            .context("EVENTS map not found")
            .and_then(|map| RingBuf::try_from(map).context("EVENTS is not a ring buffer"))
            .map_err(load_failed)?;

        let link = attach(&mut bpf, hook).map_err(|e| ItcError::AttachFailed {
            program: hook.program.to_string(),
            tracepoint: hook.tracepoint.to_string(),
            error: format!("{e:#}"),
        })?;

        Ok(Self { bpf, ring, program: hook.program, link: Some(link), stats: SourceStats::default() })
    }

    fn run(
        mut self,
        sink: &IdleAccountingService,
        commands: &Receiver<Command>,
        drain_interval: Duration,
    ) -> SourceStats {
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Flush(done)) => {
                        self.drain(sink);
                        let _ = done.send(());
                    }
                    Ok(Command::Stop) | Err(_) => break,
                },
                default(drain_interval) => self.drain(sink),
            }
        }

        self.detach();
        // Whatever was emitted before the detach still counts
        self.drain(sink);
        self.read_counters();
        self.stats
    }

    fn drain(&mut self, sink: &IdleAccountingService) {
        while let Some(item) = self.ring.next() {
            let bytes: &[u8] = &item;
            match parse_event(bytes) {
                Some(event) if deliver(sink, &event) => self.stats.delivered += 1,
                _ => {
                    self.stats.malformed += 1;
                    debug!("Malformed idle event ({} bytes)", bytes.len());
                }
            }
        }
    }

    fn detach(&mut self) {
        let Some(link) = self.link.take() else { return };

        let result = self
            .bpf
            .program_mut(self.program)
            .context("program not found")
            .and_then(|program| <&mut TracePoint>::try_from(program).map_err(anyhow::Error::from))
            .and_then(|program| program.detach(link).map_err(anyhow::Error::from));

        match result {
            Ok(()) => debug!("Detached {}", self.program),
            Err(e) => warn!("Failed to detach {}: {e:#}", self.program),
        }
    }

    fn read_counters(&mut self) {
        let Some(map) = self.bpf.map("IDLE_COUNTERS") else {
            warn!("IDLE_COUNTERS map not found");
            return;
        };

        let counters = match PerCpuArray::<_, u64>::try_from(map) {
            Ok(counters) => counters,
            Err(e) => {
                warn!("Failed to open IDLE_COUNTERS: {e}");
                return;
            }
        };

        let total = |index: u32| {
            counters.get(&index, 0).map(|values| values.iter().sum::<u64>()).unwrap_or(0)
        };

        self.stats.emitted = total(COUNTER_EMITTED);
        self.stats.dropped = total(COUNTER_DROPPED);
    }
}

/// Load the compiled kernel-side object
///
/// Always the release build: debug builds of the eBPF crate pull in
/// formatting code the verifier rejects.
fn load_object(path: &Path) -> Result<Ebpf> {
    let bpf = Ebpf::load_file(path)
        .with_context(|| format!("Failed to load eBPF object {}", path.display()))?;
    debug!("Loaded eBPF object {}", path.display());
    Ok(bpf)
}

/// Initialize eBPF logger
fn init_ebpf_logger(bpf: &mut Ebpf) {
    if tokio::runtime::Handle::try_current().is_err() {
        debug!("No async runtime: kernel-side log records are not forwarded");
        return;
    }
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

fn attach(bpf: &mut Ebpf, hook: &HookPoint) -> Result<TracePointLinkId> {
    let program: &mut TracePoint = bpf
        .program_mut(hook.program)
        .with_context(|| format!("{} program not found", hook.program))?
        .try_into()?;
    program.load()?;
    let link = program.attach(&hook.tracepoint.category, &hook.tracepoint.name)?;
    info!("✓ Attached tracepoint: {}", hook.tracepoint);
    Ok(link)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::accounting::ManualClock;
    use crate::config::ServiceConfig;
    use crate::topology::FixedTopology;
    use itc_common::{IDLE_ENTER, IDLE_EXIT, SOURCE_CPU_IDLE};

    fn tracefs_with(events: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for event in events {
            fs::create_dir_all(dir.path().join("events").join(event)).unwrap();
        }
        dir
    }

    fn config_for(root: &Path, fallback: Option<&str>) -> EbpfConfig {
        EbpfConfig {
            tracefs_roots: vec![root.to_path_buf()],
            fallback: fallback.map(|tp| tp.parse().unwrap()),
            object_path: root.join("missing.o"),
            ..EbpfConfig::default()
        }
    }

    fn event_bytes(timestamp_ns: u64, cpu_id: u32, kind: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(IdleEvent::SIZE);
        bytes.extend_from_slice(&timestamp_ns.to_ne_bytes());
        bytes.extend_from_slice(&cpu_id.to_ne_bytes());
        bytes.extend_from_slice(&kind.to_ne_bytes());
        bytes.push(SOURCE_CPU_IDLE);
        bytes.extend_from_slice(&[0u8; 7]);
        bytes
    }

    #[test]
    fn test_resolve_prefers_cpu_idle() {
        let tracefs = tracefs_with(&["power/cpu_idle", "sched/sched_switch"]);
        let hook = resolve_hook(&config_for(tracefs.path(), Some("sched/sched_switch"))).unwrap();
        assert_eq!(hook, HookPoint::cpu_idle());
    }

    #[test]
    fn test_resolve_uses_fallback() {
        let tracefs = tracefs_with(&["sched/sched_switch"]);
        let hook = resolve_hook(&config_for(tracefs.path(), Some("sched:sched_switch"))).unwrap();
        assert_eq!(hook.program, "sched_switch_idle_hook");
    }

    #[test]
    fn test_resolve_without_mechanism() {
        let tracefs = tracefs_with(&["sched/sched_switch"]);
        let err = resolve_hook(&config_for(tracefs.path(), None)).unwrap_err();
        assert!(matches!(err, ItcError::NoIdleMechanism(_)));

        let empty = tracefs_with(&[]);
        let err = resolve_hook(&config_for(empty.path(), Some("sched/sched_switch"))).unwrap_err();
        assert!(matches!(err, ItcError::NoIdleMechanism(_)));
    }

    #[test]
    fn test_resolve_rejects_unknown_fallback() {
        let tracefs = tracefs_with(&["irq/irq_handler_entry"]);
        let err = resolve_hook(&config_for(tracefs.path(), Some("irq/irq_handler_entry")))
            .unwrap_err();
        assert!(matches!(err, ItcError::InvalidArgument(_)));
    }

    #[test]
    fn test_parse_and_deliver() {
        let clock = Arc::new(ManualClock::new());
        let sink = IdleAccountingService::new(
            &ServiceConfig { max_cpus: 4 },
            clock,
            Arc::new(FixedTopology::with_count(4)),
        );

        let enter = parse_event(&event_bytes(1_000, 2, IDLE_ENTER)).unwrap();
        let exit = parse_event(&event_bytes(251_000, 2, IDLE_EXIT)).unwrap();
        assert!(deliver(&sink, &enter));
        assert!(deliver(&sink, &exit));

        let bogus = parse_event(&event_bytes(300_000, 2, 99)).unwrap();
        assert!(!deliver(&sink, &bogus));

        assert_eq!(sink.cpu_state(CpuId(2)).unwrap().cumulative_sleep, Duration::from_micros(250));
        assert!(parse_event(&[0u8; 8]).is_none());
    }

    #[test]
    fn test_missing_object_fails_install() {
        let tracefs = tracefs_with(&["power/cpu_idle"]);
        let sink = Arc::new(IdleAccountingService::new(
            &ServiceConfig { max_cpus: 1 },
            Arc::new(ManualClock::new()),
            Arc::new(FixedTopology::with_count(1)),
        ));
        let mut source = EbpfIdleSource::new(
            config_for(tracefs.path(), None),
            Arc::new(FixedTopology::with_count(1)),
        );

        let err = source.install(sink).unwrap_err();
        assert!(matches!(err, ItcError::EbpfLoadFailed(_)), "{err}");
        assert!(!source.is_installed());
        assert_eq!(source.uninstall().unwrap(), SourceStats::default());
        source.flush().unwrap();
    }
}
