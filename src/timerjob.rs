use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{FenceError, FenceResult};
use crate::materialize::MergedSegment;

/// Reserved label namespace. Reconciliation only ever touches jobs under
/// this prefix.
pub const JOB_LABEL_PREFIX: &str = "org.fence.schedule";

/// One OS timer job: fires once at its calendar trigger and invokes the
/// CLI, which starts the pre-registered block over IPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerJob {
    pub label: String,
    pub program_arguments: Vec<String>,
    /// 0 = Sunday through 6 = Saturday, matching the host timer service.
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
}

/// Deterministic, collision-free job label. Determinism is what makes
/// reconciliation idempotent.
pub fn job_label(segment_id: &str, day_index: usize, start_minutes: u16) -> String {
    format!("{JOB_LABEL_PREFIX}.{segment_id}.{day_index}.{start_minutes}")
}

/// Build the timer job for a merged segment.
pub fn job_for_segment(segment: &MergedSegment, cli_path: &str) -> TimerJob {
    TimerJob {
        label: job_label(&segment.segment_id, segment.day.index(), segment.start_minutes),
        program_arguments: vec![
            cli_path.to_string(),
            "start-scheduled".to_string(),
            segment.segment_id.clone(),
            segment.end.to_rfc3339(),
        ],
        weekday: segment.day.index() as u8,
        hour: (segment.start_minutes / 60) as u8,
        minute: (segment.start_minutes % 60) as u8,
    }
}

/// Diff the installed label set against the desired job set.
/// Returns `(to_install, to_uninstall)`; matching labels are untouched.
pub fn plan(installed: &[String], desired: &[TimerJob]) -> (Vec<TimerJob>, Vec<String>) {
    let to_install: Vec<TimerJob> = desired
        .iter()
        .filter(|job| !installed.contains(&job.label))
        .cloned()
        .collect();
    let to_uninstall: Vec<String> = installed
        .iter()
        .filter(|label| !desired.iter().any(|job| &job.label == *label))
        .cloned()
        .collect();
    (to_install, to_uninstall)
}

/// Seam to the host timer service. The production implementation talks to
/// launchd; tests install into a map.
#[async_trait]
pub trait TimerService: Send + Sync {
    async fn installed_labels(&self) -> FenceResult<Vec<String>>;
    async fn install(&self, job: &TimerJob) -> FenceResult<()>;
    async fn uninstall(&self, label: &str) -> FenceResult<()>;
}

/// launchd-backed timer service: plists in a launch-agents directory,
/// loaded and unloaded with launchctl.
pub struct LaunchdTimerService {
    agents_dir: PathBuf,
}

impl LaunchdTimerService {
    pub fn new(agents_dir: PathBuf) -> Self {
        Self { agents_dir }
    }

    fn plist_path(&self, label: &str) -> PathBuf {
        self.agents_dir.join(format!("{label}.plist"))
    }

    async fn launchctl(&self, subcommand: &str, path: &std::path::Path) -> FenceResult<()> {
        let output = tokio::process::Command::new("launchctl")
            .arg(subcommand)
            .arg(path)
            .output()
            .await
            .map_err(|e| FenceError::Transient(format!("spawning launchctl {subcommand}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FenceError::Transient(format!(
                "launchctl {subcommand} {} failed: {}",
                path.display(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TimerService for LaunchdTimerService {
    async fn installed_labels(&self) -> FenceResult<Vec<String>> {
        let mut labels = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.agents_dir).await {
            Ok(entries) => entries,
            // Directory not created yet means nothing installed
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(labels),
            Err(e) => return Err(FenceError::Transient(format!("listing launch agents: {e}"))),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FenceError::Transient(format!("listing launch agents: {e}")))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(label) = name.strip_suffix(".plist")
                && label.starts_with(JOB_LABEL_PREFIX)
            {
                labels.push(label.to_string());
            }
        }
        Ok(labels)
    }

    async fn install(&self, job: &TimerJob) -> FenceResult<()> {
        std::fs::create_dir_all(&self.agents_dir)
            .map_err(|e| FenceError::Transient(format!("creating launch agents dir: {e}")))?;

        let path = self.plist_path(&job.label);
        let content = launchd_plist(job);

        // Rename-over so launchd never observes a half-written plist
        let mut tmp = tempfile::NamedTempFile::new_in(&self.agents_dir)
            .map_err(|e| FenceError::Transient(format!("creating temp plist: {e}")))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| FenceError::Transient(format!("writing plist: {e}")))?;
        tmp.persist(&path)
            .map_err(|e| FenceError::Transient(format!("persisting plist: {e}")))?;

        self.launchctl("load", &path).await?;
        debug!(label = %job.label, "installed timer job");
        Ok(())
    }

    async fn uninstall(&self, label: &str) -> FenceResult<()> {
        let path = self.plist_path(label);
        if let Err(e) = self.launchctl("unload", &path).await {
            // Unload of an already-unloaded job is not fatal; removing the
            // plist is what guarantees it never fires again.
            warn!(label = %label, error = %e, "launchctl unload failed");
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FenceError::Transient(format!("removing plist: {e}"))),
        }
        debug!(label = %label, "uninstalled timer job");
        Ok(())
    }
}

/// Render the launchd property list for a job. One-shot semantics: the
/// job is disabled after firing and reconciliation re-installs it for the
/// following week if still desired.
pub fn launchd_plist(job: &TimerJob) -> String {
    let args = job
        .program_arguments
        .iter()
        .map(|a| format!("        <string>{}</string>", xml_escape(a)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{args}
    </array>
    <key>StartCalendarInterval</key>
    <dict>
        <key>Weekday</key>
        <integer>{weekday}</integer>
        <key>Hour</key>
        <integer>{hour}</integer>
        <key>Minute</key>
        <integer>{minute}</integer>
    </dict>
    <key>RunAtLoad</key>
    <false/>
    <key>LaunchOnlyOnce</key>
    <true/>
</dict>
</plist>
"#,
        label = xml_escape(&job.label),
        weekday = job.weekday,
        hour = job.hour,
        minute = job.minute,
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Run `op`, retrying transient failures with doubling backoff. Anything
/// other than `Transient` surfaces immediately.
pub async fn with_retries<T, F, Fut>(what: &str, mut op: F) -> FenceResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = FenceResult<T>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut backoff = Duration::from_millis(200);

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(FenceError::Transient(message)) if attempt < MAX_ATTEMPTS => {
                warn!(what, attempt, error = %message, "transient failure, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns on the last attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn job(label: &str) -> TimerJob {
        TimerJob {
            label: label.to_string(),
            program_arguments: vec!["/usr/local/bin/fence".to_string(), "start-scheduled".to_string()],
            weekday: 1,
            hour: 9,
            minute: 0,
        }
    }

    #[test]
    fn labels_are_deterministic() {
        assert_eq!(
            job_label("ab12cd34", 1, 540),
            "org.fence.schedule.ab12cd34.1.540"
        );
        assert_eq!(job_label("ab12cd34", 1, 540), job_label("ab12cd34", 1, 540));
        assert_ne!(job_label("ab12cd34", 1, 540), job_label("ab12cd34", 2, 540));
    }

    #[test]
    fn plan_diffs_installed_against_desired() {
        let installed = vec![
            "org.fence.schedule.old.1.0".to_string(),
            "org.fence.schedule.keep.2.540".to_string(),
        ];
        let desired = vec![job("org.fence.schedule.keep.2.540"), job("org.fence.schedule.new.3.600")];

        let (to_install, to_uninstall) = plan(&installed, &desired);
        assert_eq!(to_install, vec![job("org.fence.schedule.new.3.600")]);
        assert_eq!(to_uninstall, vec!["org.fence.schedule.old.1.0".to_string()]);

        // Once converged, a second plan is empty (idempotence)
        let converged: Vec<String> = desired.iter().map(|j| j.label.clone()).collect();
        let (to_install, to_uninstall) = plan(&converged, &desired);
        assert!(to_install.is_empty());
        assert!(to_uninstall.is_empty());
    }

    #[test]
    fn plist_contains_trigger_and_payload() {
        let job = TimerJob {
            label: "org.fence.schedule.ab12cd34.1.540".to_string(),
            program_arguments: vec![
                "/usr/local/bin/fence".to_string(),
                "start-scheduled".to_string(),
                "ab12cd34".to_string(),
                "2024-12-23T17:00:00+00:00".to_string(),
            ],
            weekday: 1,
            hour: 9,
            minute: 0,
        };
        let plist = launchd_plist(&job);
        assert!(plist.contains("<string>org.fence.schedule.ab12cd34.1.540</string>"));
        assert!(plist.contains("<string>start-scheduled</string>"));
        assert!(plist.contains("<key>Weekday</key>\n        <integer>1</integer>"));
        assert!(plist.contains("<key>Hour</key>\n        <integer>9</integer>"));
        assert!(plist.contains("<key>Minute</key>\n        <integer>0</integer>"));
        assert!(plist.contains("<false/>"), "RunAtLoad must be off");
    }

    #[test]
    fn plist_escapes_xml_characters() {
        let mut j = job("org.fence.schedule.x.1.0");
        j.program_arguments.push("a&b<c>".to_string());
        assert!(launchd_plist(&j).contains("<string>a&amp;b&lt;c&gt;</string>"));
    }

    #[tokio::test]
    async fn retries_only_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result: FenceResult<u32> = with_retries("test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(FenceError::Transient("flaky".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);

        let attempts = AtomicU32::new(0);
        let result: FenceResult<u32> = with_retries("test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(FenceError::AuthorizationDenied) }
        })
        .await;
        assert!(matches!(result, Err(FenceError::AuthorizationDenied)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "non-transient never retries");
    }

    #[tokio::test]
    async fn transient_failure_surfaces_after_max_attempts() {
        let result: FenceResult<()> =
            with_retries("test", || async { Err(FenceError::Transient("always".to_string())) }).await;
        assert!(matches!(result, Err(FenceError::Transient(_))));
    }
}
