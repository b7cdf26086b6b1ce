//! The supervisor control loop.
//!
//! One cooperative thread owns the process table, the configuration snapshot
//! and the report timers. Each tick runs four phases in order: configuration
//! refresh, reap, terminate pending removals, staged launch. The shutdown
//! sentinel file is the sole cancellation token; it is checked at every
//! phase boundary and before every launch step.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{Local, TimeZone, Utc};
use tracing::{debug, error, info, warn};

use crate::config::{self, ConfigSnapshot};
use crate::constants::TICK_INTERVAL;
use crate::error::SupervisorError;
use crate::notify::{Notification, NotificationSink, hostname};
use crate::report::{self, ResourceProbe};
use crate::runtime::{Paths, PidFile};
use crate::sequencer;
use crate::spawn::{self, ChildExit, ReapResult, TerminateOutcome};
use crate::table::{ChildState, ExitClass, ProcessTable};

/// Long-lived supervisor owning a pool of child processes.
pub struct Supervisor {
    config_path: PathBuf,
    paths: Paths,
    snapshot: ConfigSnapshot,
    table: ProcessTable,
    sink: Box<dyn NotificationSink>,
    probe: Option<Box<dyn ResourceProbe>>,
    hostname: String,
    started_at: i64,
    config_mtime: Option<SystemTime>,
    next_sys_report: Option<i64>,
    next_html_report: Option<i64>,
    _pid_file: PidFile,
}

impl Supervisor {
    /// Creates a supervisor from an already parsed first configuration.
    ///
    /// Acquires the singleton pid file, clears any stale shutdown sentinel
    /// and seeds the process table so every declared child is pending launch.
    pub fn new(
        config_path: PathBuf,
        snapshot: ConfigSnapshot,
        paths: Paths,
        sink: Box<dyn NotificationSink>,
        probe: Option<Box<dyn ResourceProbe>>,
    ) -> Result<Self, SupervisorError> {
        fs::create_dir_all(paths.log_dir()).map_err(|source| SupervisorError::LogDir {
            path: paths.log_dir().to_path_buf(),
            source,
        })?;

        let pid_file = PidFile::acquire(&paths)?;
        paths.clear_sentinel();

        let now = Utc::now().timestamp();
        let mut table = ProcessTable::new();
        table.reconcile(&snapshot, true, now);

        let config_mtime = fs::metadata(&config_path).and_then(|m| m.modified()).ok();
        let next_sys_report = snapshot
            .sys_report
            .seconds()
            .map(|period| next_day_aligned(now, period));
        let next_html_report = snapshot.html_report.as_ref().map(|_| now);

        Ok(Self {
            config_path,
            paths,
            snapshot,
            table,
            sink,
            probe,
            hostname: hostname(),
            started_at: now,
            config_mtime,
            next_sys_report,
            next_html_report,
            _pid_file: pid_file,
        })
    }

    /// Runs the control loop until shutdown is requested, then brings all
    /// children down in reverse launch order.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        info!(
            "Supervising {} children from {:?}",
            self.table.len(),
            self.config_path
        );

        loop {
            if self.paths.shutdown_requested() {
                break;
            }
            self.refresh_config();
            if self.paths.shutdown_requested() {
                break;
            }
            self.reap_children();
            if self.paths.shutdown_requested() {
                break;
            }
            self.terminate_pending();
            if self.paths.shutdown_requested() {
                break;
            }
            self.launch_pending();
            self.emit_due_reports();
            thread::sleep(TICK_INTERVAL);
        }

        self.shutdown();
        Ok(())
    }

    /// Phase 1: reparse when the file's modification time changed.
    fn refresh_config(&mut self) {
        let mtime = fs::metadata(&self.config_path).and_then(|m| m.modified()).ok();
        if mtime == self.config_mtime {
            return;
        }
        // Recorded regardless of parse errors, so a broken file is not
        // re-reported every tick.
        self.config_mtime = mtime;
        info!("Configuration changed, reparsing {:?}", self.config_path);

        match config::parse_file(&self.config_path) {
            Ok(outcome) => {
                let clean = outcome.errors.is_empty();
                if !clean {
                    self.report_config_errors(&outcome.errors);
                }
                let now = Utc::now().timestamp();
                self.table.reconcile(&outcome.snapshot, clean, now);
                self.reschedule_reports(&outcome.snapshot, now);
                self.snapshot = outcome.snapshot;
            }
            Err(err) => {
                error!("Failed to reread configuration: {err}");
                self.notify_event("configuration errors", &[err.to_string()]);
            }
        }
    }

    /// Phase 2: non-blocking collection of exited children.
    fn reap_children(&mut self) {
        let now = Utc::now().timestamp();
        for (label, pid) in self.table.live_pids() {
            match spawn::try_reap(pid) {
                ReapResult::StillAlive => {}
                ReapResult::Exited(exit) => self.handle_exit(&label, exit, now),
                ReapResult::Gone => {
                    warn!("Lost track of '{label}' (pid {pid}); clearing pid");
                    self.table.clear_pid(&label);
                }
            }
        }
    }

    fn handle_exit(&mut self, label: &str, exit: ChildExit, now: i64) {
        let was_running = matches!(
            self.table.get(label).map(|c| c.state),
            Some(ChildState::Running)
        );

        if was_running {
            let restart_delay = self.snapshot.restart_delay;
            if let Some(class) = self.table.record_exit(label, now, restart_delay) {
                let summary = exit.describe();
                match class {
                    ExitClass::TooQuick => warn!(
                        "'{label}' {summary}; died too quickly, restart delayed"
                    ),
                    ExitClass::Normal => {
                        info!("'{label}' {summary}; restart scheduled")
                    }
                }
                self.notify_event(&format!("{label} died"), &[summary]);
            }
        } else {
            // Exited while pending launch or removal; keep its schedule.
            info!("'{label}' {}", exit.describe());
            self.table.clear_pid(label);
        }
    }

    /// Phase 3: terminate and forget children whose label left the
    /// configuration.
    fn terminate_pending(&mut self) {
        for label in self.table.pending_removal() {
            if self.paths.shutdown_requested() {
                return;
            }
            self.terminate_child(&label);
            self.table.remove(&label);
            info!("Removed '{label}' from the process table");
        }
    }

    fn terminate_child(&mut self, label: &str) {
        let Some(pid) = self.table.get(label).and_then(|c| c.pid) else {
            return;
        };
        let wait = Duration::from_secs(self.snapshot.term_wait);
        match spawn::terminate(label, pid, wait) {
            TerminateOutcome::Reaped(_) | TerminateOutcome::Gone => {
                self.table.clear_pid(label);
            }
            // Left as a potential zombie; the pid stays recorded so a later
            // reap can still collect it.
            TerminateOutcome::TimedOut => {}
        }
    }

    /// Phase 4: staged launch of every child whose scheduled start arrived.
    fn launch_pending(&mut self) {
        let now = Utc::now().timestamp();
        let cohorts = sequencer::staged_cohorts(&self.snapshot, &self.table, now);
        let start_delay = Duration::from_secs(self.snapshot.start_delay);

        let mut launched_any = false;
        for cohort in cohorts {
            for label in cohort {
                if self.paths.shutdown_requested() {
                    return;
                }
                if launched_any && !start_delay.is_zero() {
                    thread::sleep(start_delay);
                    if self.paths.shutdown_requested() {
                        return;
                    }
                }
                self.launch_one(&label);
                launched_any = true;
            }
        }
    }

    fn launch_one(&mut self, label: &str) {
        // A live pid here means the command changed on reload; the old
        // process goes down before the new one comes up.
        if self.table.get(label).and_then(|c| c.pid).is_some() {
            self.terminate_child(label);
            if self.table.get(label).and_then(|c| c.pid).is_some() {
                warn!("Old process for '{label}' still alive; deferring launch");
                return;
            }
        }

        let Some(child) = self.table.get(label) else {
            return;
        };
        let command = child.command.clone();
        let log_path = self.paths.child_log(label);
        let now = Utc::now().timestamp();

        match spawn::launch(label, &command, &log_path) {
            Ok(pid) => self.table.record_launch(label, pid, now),
            Err(err) => {
                error!("{err}");
                self.table
                    .record_launch_failure(label, now, self.snapshot.restart_delay);
            }
        }
    }

    /// Emits the periodic email report and the HTML report when due.
    fn emit_due_reports(&mut self) {
        let now = Utc::now().timestamp();

        if let Some(due) = self.next_sys_report
            && now >= due
        {
            match self.snapshot.sys_report.seconds() {
                Some(period) => {
                    self.send_system_report();
                    self.next_sys_report = Some(next_day_aligned(now, period));
                }
                None => self.next_sys_report = None,
            }
        }

        if let Some(due) = self.next_html_report
            && now >= due
            && let Some(html) = self.snapshot.html_report.clone()
        {
            let interval = html.interval.max(1) as i64;
            let mut next = due;
            while next <= now {
                next += interval;
            }
            self.next_html_report = Some(next);
            self.write_html_report(&html.path);
        }
    }

    fn send_system_report(&mut self) {
        match self.render_report() {
            Ok(html) => {
                self.emit(Notification {
                    subject: "Metasys: system report".to_string(),
                    body: html,
                    html: true,
                });
            }
            Err(err) => warn!("Failed to render system report: {err}"),
        }
    }

    fn write_html_report(&mut self, path: &Path) {
        match self.render_report() {
            Ok(html) => {
                if let Err(err) = fs::write(path, html) {
                    warn!("Failed to write HTML report to {path:?}: {err}");
                }
            }
            Err(err) => warn!("Failed to render HTML report: {err}"),
        }
    }

    fn render_report(&mut self) -> Result<String, askama::Error> {
        let order = self.snapshot.launch_order();
        report::render(
            &self.snapshot,
            &self.table,
            &order,
            self.probe.as_deref_mut(),
            &self.hostname,
            self.started_at,
            Utc::now().timestamp(),
        )
    }

    /// Brings every child down in reverse launch order and cleans up.
    fn shutdown(&mut self) {
        info!("Shutdown requested, stopping children in reverse launch order");

        let mut order = sequencer::shutdown_order(&self.snapshot);
        // Children already dropped from the configuration but not yet
        // terminated still need stopping; they go down first.
        for (label, _) in self.table.live_pids() {
            if !order.contains(&label) {
                order.insert(0, label);
            }
        }

        for label in order {
            self.terminate_child(&label);
            self.table.remove(&label);
        }

        let uptime = report::format_age(Utc::now().timestamp() - self.started_at);
        self.notify_event("shutting down", &[format!("supervisor exiting after {uptime}")]);
        self.paths.clear_sentinel();
        info!("Shutdown complete");
    }

    fn report_config_errors(&mut self, errors: &[String]) {
        for err in errors {
            error!("config: {err}");
        }
        self.notify_event("configuration errors", errors);
    }

    /// Builds the standard error-style notification: subject
    /// `Metasys: <event>`, body starting `<hostname>:<config-path>`.
    fn notify_event(&mut self, event: &str, lines: &[String]) {
        let subject = format!("Metasys: {event}");
        let mut body = format!("{}:{}\n", self.hostname, self.config_path.display());
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
        self.emit(Notification {
            subject,
            body,
            html: false,
        });
    }

    fn emit(&mut self, note: Notification) {
        if self.snapshot.recipients.is_empty() {
            debug!("Notifications disabled; dropping '{}'", note.subject);
            return;
        }
        if let Err(err) =
            self.sink
                .emit(&self.snapshot.recipients, &self.snapshot.mta_host, &note)
        {
            warn!("Failed to deliver notification '{}': {err}", note.subject);
        }
    }

    fn reschedule_reports(&mut self, new: &ConfigSnapshot, now: i64) {
        if new.sys_report != self.snapshot.sys_report {
            self.next_sys_report = new
                .sys_report
                .seconds()
                .map(|period| next_day_aligned(now, period));
        }
        if new.html_report != self.snapshot.html_report {
            self.next_html_report = new.html_report.as_ref().map(|_| now);
        }
    }
}

/// Next multiple of `period` after `now`, counted from the current local
/// day's midnight.
fn next_day_aligned(now: i64, period: i64) -> i64 {
    let midnight = local_midnight(now);
    let mut next = midnight;
    while next <= now {
        next += period;
    }
    next
}

/// Epoch second of the most recent local midnight.
fn local_midnight(now: i64) -> i64 {
    let Some(dt) = Local.timestamp_opt(now, 0).single() else {
        return now;
    };
    let naive = dt
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_else(|| dt.naive_local());
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|midnight| midnight.timestamp())
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BufferSink;
    use tempfile::{TempDir, tempdir};

    fn build(config: &str) -> (Supervisor, BufferSink, TempDir) {
        let dir = tempdir().expect("tempdir");
        let config_path = dir.path().join("metasys.conf");
        fs::write(&config_path, config).expect("write config");

        let outcome = config::parse_str(config);
        assert!(outcome.errors.is_empty(), "errors: {:?}", outcome.errors);

        let sink = BufferSink::new();
        let paths = Paths::new(dir.path());
        let supervisor = Supervisor::new(
            config_path,
            outcome.snapshot,
            paths,
            Box::new(sink.clone()),
            None,
        )
        .expect("supervisor");
        (supervisor, sink, dir)
    }

    #[test]
    fn notifications_are_suppressed_without_recipients() {
        let (mut supervisor, sink, _dir) = build("Process a /bin/sleep 60\n");
        supervisor.notify_event("test event", &["detail".to_string()]);
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn error_notifications_carry_host_and_config_path() {
        let (mut supervisor, sink, _dir) = build(
            "Email ops@example.com\nProcess a /bin/sleep 60\n",
        );
        supervisor.notify_event("test event", &["detail".to_string()]);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Metasys: test event");
        assert!(sent[0].body.contains("metasys.conf"));
        assert!(sent[0].body.contains("detail"));
        assert!(!sent[0].html);
    }

    #[test]
    fn core_dump_exit_notifies_with_marker_and_exit_value_zero() {
        let (mut supervisor, sink, _dir) = build(
            "Email ops@example.com\nRestartDelay 30\nProcess a /bin/sleep 60\n",
        );
        let now = Utc::now().timestamp();
        supervisor.table.record_launch("a", 999_999, now);

        // Wait status 139: core flag set, exit value zero.
        supervisor.handle_exit("a", ChildExit(139), now + 5);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("exit value 0"));
        assert!(sent[0].body.contains("CORE was dumped"));

        let child = supervisor.table.get("a").expect("child");
        assert_eq!(child.restarts, 1);
        assert_eq!(
            child.state,
            ChildState::PendingLaunch { at: now + 5 + 100 * 30 }
        );
    }

    #[test]
    fn stale_sentinel_is_cleared_at_startup() {
        let dir = tempdir().expect("tempdir");
        let config_path = dir.path().join("metasys.conf");
        fs::write(&config_path, "Process a /bin/sleep 60\n").expect("write config");

        let paths = Paths::new(dir.path());
        paths.request_shutdown().expect("sentinel");

        let outcome = config::parse_str("Process a /bin/sleep 60\n");
        let supervisor = Supervisor::new(
            config_path,
            outcome.snapshot,
            paths,
            Box::new(BufferSink::new()),
            None,
        )
        .expect("supervisor");
        assert!(!supervisor.paths.shutdown_requested());
    }

    #[test]
    fn next_day_aligned_is_a_period_multiple_after_now() {
        let now = Utc::now().timestamp();
        for period in [3_600_i64, 86_400] {
            let next = next_day_aligned(now, period);
            assert!(next > now);
            assert!(next <= now + period);
            assert_eq!((next - local_midnight(now)) % period, 0);
        }
    }

    #[test]
    fn html_report_fires_then_advances_past_now() {
        let (mut supervisor, _sink, dir) = build(
            "HTMLReport status.html:60\nProcess a /bin/sleep 60\n",
        );
        let html_path = dir.path().join("status.html");
        supervisor.snapshot.html_report = Some(crate::config::HtmlReport {
            path: html_path.clone(),
            interval: 60,
        });

        supervisor.emit_due_reports();

        assert!(html_path.exists());
        let next = supervisor.next_html_report.expect("scheduled");
        assert!(next > Utc::now().timestamp());
    }
}
