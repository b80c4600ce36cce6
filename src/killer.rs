use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::EnforcementChannel;
use crate::error::FenceResult;
use crate::models::BlockEntry;

/// Read-only view of one running process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub bundle_id: Option<String>,
}

/// Seam to the host process table. The production implementation uses
/// sysinfo (no user-session APIs, so it works from a root daemon outside
/// any login session); tests drive a fake.
pub trait ProcessTable: Send {
    fn refresh(&mut self);
    fn processes(&self) -> Vec<ProcessInfo>;
    fn terminate(&mut self, pid: u32) -> bool;
    fn kill(&mut self, pid: u32) -> bool;
}

/// The app identifiers a sweep enforces.
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    pub ids: BTreeSet<String>,
    pub is_allowlist: bool,
}

impl TargetSet {
    pub fn from_blocklist(blocklist: &[BlockEntry], is_allowlist: bool) -> Self {
        Self {
            ids: blocklist
                .iter()
                .filter_map(|e| e.app_bundle_id())
                .map(|s| s.to_string())
                .collect(),
            is_allowlist,
        }
    }

    pub fn is_inert(&self) -> bool {
        !self.is_allowlist && self.ids.is_empty()
    }

    /// Should this process be terminated? Blocklist mode matches the
    /// derived bundle identifier, falling back to the identifier's last
    /// component against the process name. Allowlist mode only ever
    /// targets processes with a derivable bundle identifier, so system
    /// processes are never candidates.
    pub fn matches(&self, info: &ProcessInfo) -> bool {
        if self.is_allowlist {
            return match &info.bundle_id {
                Some(id) => !self.ids.contains(id),
                None => false,
            };
        }

        if let Some(id) = &info.bundle_id
            && self.ids.contains(id)
        {
            return true;
        }
        self.ids.iter().any(|id| {
            id.rsplit('.')
                .next()
                .is_some_and(|leaf| leaf.eq_ignore_ascii_case(&info.name))
        })
    }
}

/// One enforcement pass over the process table, with terminate-then-kill
/// escalation tracked across ticks.
pub struct KillSweep {
    grace_ticks: u32,
    own_pid: u32,
    /// pid -> ticks it has survived a terminate signal
    pending: HashMap<u32, u32>,
}

impl KillSweep {
    pub fn new(grace_ticks: u32, own_pid: u32) -> Self {
        Self {
            grace_ticks,
            own_pid,
            pending: HashMap::new(),
        }
    }

    /// Signal every matching process. Returns the pids signalled this
    /// tick. pid 1, kernel tasks (no name), and the daemon itself are
    /// never targeted.
    pub fn tick(&mut self, table: &mut dyn ProcessTable, targets: &TargetSet) -> Vec<u32> {
        table.refresh();
        let processes = table.processes();

        // Forget processes that exited since the last tick
        self.pending
            .retain(|pid, _| processes.iter().any(|p| p.pid == *pid));

        let mut signalled = Vec::new();
        for info in &processes {
            if info.pid <= 1 || info.pid == self.own_pid || info.name.is_empty() {
                continue;
            }
            if !targets.matches(info) {
                continue;
            }

            let survived = self.pending.entry(info.pid).or_insert(0);
            *survived += 1;
            if *survived > self.grace_ticks {
                debug!(pid = info.pid, name = %info.name, "escalating to kill");
                table.kill(info.pid);
            } else {
                table.terminate(info.pid);
            }
            signalled.push(info.pid);
        }
        signalled
    }
}

/// Process-killer channel: while applied, polls the process table and
/// terminates blocked applications. Polling was chosen over kernel event
/// subscriptions because the daemon must run outside a login session; the
/// tradeoff is up to one poll interval of leakage.
pub struct KillerChannel {
    poll_interval: Duration,
    grace_ticks: u32,
    targets: Arc<RwLock<TargetSet>>,
    running: Arc<AtomicBool>,
    task: tokio::sync::Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl KillerChannel {
    pub fn new(poll_interval: Duration, grace_ticks: u32) -> Self {
        Self {
            poll_interval,
            grace_ticks,
            targets: Arc::new(RwLock::new(TargetSet::default())),
            running: Arc::new(AtomicBool::new(false)),
            task: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl EnforcementChannel for KillerChannel {
    fn name(&self) -> &'static str {
        "killer"
    }

    async fn apply(&self, blocklist: &[BlockEntry], is_allowlist: bool) -> FenceResult<()> {
        let targets = TargetSet::from_blocklist(blocklist, is_allowlist);
        let inert = targets.is_inert();
        if let Ok(mut guard) = self.targets.write() {
            *guard = targets;
        }

        let mut task = self.task.lock().await;
        if inert {
            // Nothing to watch for: stop a loop left over from a previous
            // list rather than spinning on an empty set.
            if let Some((cancel, handle)) = task.take() {
                cancel.cancel();
                let _ = handle.await;
            }
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }

        if task.is_none() {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(poll_loop(
                self.poll_interval,
                self.grace_ticks,
                self.targets.clone(),
                cancel.clone(),
            ));
            *task = Some((cancel, handle));
            self.running.store(true, Ordering::SeqCst);
            info!(interval_ms = self.poll_interval.as_millis() as u64, "app killer started");
        }
        Ok(())
    }

    async fn revert(&self) -> FenceResult<()> {
        let mut task = self.task.lock().await;
        if let Some((cancel, handle)) = task.take() {
            cancel.cancel();
            // Cancellation is observed at the next tick boundary
            let _ = handle.await;
            info!("app killer stopped");
        }
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.targets.write() {
            *guard = TargetSet::default();
        }
        Ok(())
    }

    async fn is_applied(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn poll_loop(
    poll_interval: Duration,
    grace_ticks: u32,
    targets: Arc<RwLock<TargetSet>>,
    cancel: CancellationToken,
) {
    let mut table = SysinfoProcessTable::new();
    let mut sweep = KillSweep::new(grace_ticks, std::process::id());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        // Snapshot the target set once per tick; mid-tick updates take
        // effect the next tick.
        let snapshot = match targets.read() {
            Ok(guard) => guard.clone(),
            Err(_) => continue,
        };

        let signalled = sweep.tick(&mut table, &snapshot);
        if !signalled.is_empty() {
            info!(pids = ?signalled, "terminated blocked applications");
        }
    }
}

/// sysinfo-backed process table.
pub struct SysinfoProcessTable {
    system: System,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn refresh(&mut self) {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
    }

    fn processes(&self) -> Vec<ProcessInfo> {
        self.system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                bundle_id: process.exe().and_then(bundle_id_for_executable),
            })
            .collect()
    }

    fn terminate(&mut self, pid: u32) -> bool {
        match self.system.process(Pid::from_u32(pid)) {
            Some(process) => process.kill_with(Signal::Term).unwrap_or(false),
            None => false,
        }
    }

    fn kill(&mut self, pid: u32) -> bool {
        match self.system.process(Pid::from_u32(pid)) {
            Some(process) => process.kill(),
            None => false,
        }
    }
}

/// Derive the bundle identifier for an executable living inside an
/// application bundle (`…/Name.app/Contents/MacOS/Name`): read the
/// bundle's Info.plist and pull CFBundleIdentifier out of it.
fn bundle_id_for_executable(exe: &Path) -> Option<String> {
    let mut bundle_root = None;
    let mut current = exe;
    while let Some(parent) = current.parent() {
        if parent.extension().is_some_and(|ext| ext == "app") {
            bundle_root = Some(parent);
            break;
        }
        current = parent;
    }
    let info_plist = bundle_root?.join("Contents/Info.plist");
    let content = std::fs::read_to_string(&info_plist)
        .map_err(|e| {
            warn!(path = %info_plist.display(), error = %e, "unreadable Info.plist");
            e
        })
        .ok()?;
    bundle_identifier_from_plist(&content)
}

/// Extract CFBundleIdentifier from an XML property list.
pub fn bundle_identifier_from_plist(content: &str) -> Option<String> {
    let key_at = content.find("<key>CFBundleIdentifier</key>")?;
    let rest = &content[key_at..];
    let open = rest.find("<string>")? + "<string>".len();
    let close = rest[open..].find("</string>")?;
    let id = rest[open..open + close].trim();
    if id.is_empty() { None } else { Some(id.to_string()) }
}
