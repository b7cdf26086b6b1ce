//! Status report rendering and the optional per-pid resource probe.
//!
//! The renderer produces one self-contained HTML document used both for the
//! periodic email report and the on-disk HTML report. Resource columns are
//! present only when a probe is supplied.

use askama::Template;
use chrono::{Local, TimeZone};
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

use crate::config::ConfigSnapshot;
use crate::table::ProcessTable;

/// One sample of a running child's resource usage.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// CPU usage in percent.
    pub cpu_percent: f32,
    /// Resident memory as a share of total memory, in percent.
    pub mem_percent: f32,
    /// Virtual size in bytes.
    pub virtual_bytes: u64,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// Kernel run state, e.g. "Runnable" or "Sleeping".
    pub state: String,
}

/// Source of per-pid resource samples. Optional; reports render without one.
pub trait ResourceProbe {
    /// Samples the given pid, or `None` when it cannot be observed.
    fn sample(&mut self, pid: u32) -> Option<ResourceSample>;
}

/// Probe backed by the `sysinfo` crate.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    /// Creates a probe with an empty snapshot; data is refreshed per sample.
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self, pid: u32) -> Option<ResourceSample> {
        let sys_pid = SysPid::from_u32(pid);
        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let process = self.system.process(sys_pid)?;
        let total = self.system.total_memory();
        let rss = process.memory();
        let mem_percent = if total > 0 {
            (rss as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };

        Some(ResourceSample {
            cpu_percent: process.cpu_usage(),
            mem_percent,
            virtual_bytes: process.virtual_memory(),
            rss_bytes: rss,
            state: process.status().to_string(),
        })
    }
}

/// One rendered table row. All values are preformatted strings so the
/// template stays dumb.
pub struct ReportRow {
    pub label: String,
    pub group: String,
    pub pid: String,
    pub last_started: String,
    pub age: String,
    pub restarts: u64,
    pub command: String,
    pub resources: String,
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate<'a> {
    description: &'a str,
    hostname: &'a str,
    generated: String,
    uptime: String,
    start_delay: u64,
    restart_delay: u64,
    term_wait: u64,
    has_resources: bool,
    rows: Vec<ReportRow>,
}

/// Renders the status report for all children in launch order.
pub fn render(
    snapshot: &ConfigSnapshot,
    table: &ProcessTable,
    order: &[String],
    mut probe: Option<&mut (dyn ResourceProbe + '_)>,
    hostname: &str,
    started_at: i64,
    now: i64,
) -> Result<String, askama::Error> {
    let mut rows = Vec::with_capacity(order.len());
    for label in order {
        let Some(child) = table.get(label) else {
            continue;
        };

        let resources = match (&mut probe, child.pid) {
            (Some(probe), Some(pid)) => probe
                .sample(pid)
                .map(|s| {
                    format!(
                        "cpu {:.1}% mem {:.1}% vsz {} rss {} {}",
                        s.cpu_percent,
                        s.mem_percent,
                        format_bytes(s.virtual_bytes),
                        format_bytes(s.rss_bytes),
                        s.state,
                    )
                })
                .unwrap_or_default(),
            _ => String::new(),
        };

        rows.push(ReportRow {
            label: child.label.clone(),
            group: child.group.clone().unwrap_or_default(),
            pid: child
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            last_started: child.last_started.map(format_time).unwrap_or_else(|| "never".to_string()),
            age: child
                .last_started
                .map(|t| format_age(now - t))
                .unwrap_or_else(|| "-".to_string()),
            restarts: child.restarts,
            command: child.command.clone(),
            resources,
        });
    }

    let template = ReportTemplate {
        description: &snapshot.description,
        hostname,
        generated: format_time(now),
        uptime: format_age(now - started_at),
        start_delay: snapshot.start_delay,
        restart_delay: snapshot.restart_delay,
        term_wait: snapshot.term_wait,
        has_resources: probe.is_some(),
        rows,
    };
    template.render()
}

/// Local wall-clock rendering of an epoch second.
pub fn format_time(epoch: i64) -> String {
    match Local.timestamp_opt(epoch, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

/// Human-readable duration, e.g. "3d 02:11:05".
pub fn format_age(secs: i64) -> String {
    if secs < 0 {
        return "-".to_string();
    }
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (h, m, s) = (rem / 3_600, (rem % 3_600) / 60, rem % 60);
    if days > 0 {
        format!("{days}d {h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_str;

    struct FixedProbe;

    impl ResourceProbe for FixedProbe {
        fn sample(&mut self, _pid: u32) -> Option<ResourceSample> {
            Some(ResourceSample {
                cpu_percent: 12.5,
                mem_percent: 3.0,
                virtual_bytes: 10 * 1024 * 1024,
                rss_bytes: 2 * 1024 * 1024,
                state: "Sleeping".to_string(),
            })
        }
    }

    fn fixture() -> (ConfigSnapshot, ProcessTable) {
        let outcome = parse_str(
            "Description test rig\n\
             Process a /bin/sleep 60\n\
             ProcessWeb b /usr/sbin/httpd -f b.conf\n",
        );
        assert!(outcome.errors.is_empty());
        let mut table = ProcessTable::new();
        table.reconcile(&outcome.snapshot, true, 1_000);
        table.record_launch("a", 4321, 1_000);
        (outcome.snapshot, table)
    }

    #[test]
    fn report_lists_children_in_launch_order() {
        let (snapshot, table) = fixture();
        let order = snapshot.launch_order();
        let html = render(&snapshot, &table, &order, None, "host1", 900, 2_000)
            .expect("render");

        assert!(html.contains("test rig"));
        assert!(html.contains("host1"));
        let a = html.find(">a<").expect("row for a");
        let b = html.find(">b<").expect("row for b");
        assert!(a < b);
        assert!(html.contains("4321"));
        assert!(html.contains("/usr/sbin/httpd -f b.conf"));
    }

    #[test]
    fn resource_columns_appear_only_with_a_probe() {
        let (snapshot, table) = fixture();
        let order = snapshot.launch_order();

        let bare = render(&snapshot, &table, &order, None, "host1", 900, 2_000)
            .expect("render");
        assert!(!bare.contains("Resources"));

        let mut probe = FixedProbe;
        let probed = render(
            &snapshot,
            &table,
            &order,
            Some(&mut probe),
            "host1",
            900,
            2_000,
        )
        .expect("render");
        assert!(probed.contains("Resources"));
        assert!(probed.contains("cpu 12.5%"));
        assert!(probed.contains("2.0MiB"));
    }

    #[test]
    fn age_formatting_covers_days() {
        assert_eq!(format_age(5), "00:00:05");
        assert_eq!(format_age(3_725), "01:02:05");
        assert_eq!(format_age(90_061), "1d 01:01:01");
        assert_eq!(format_age(-1), "-");
    }

    #[test]
    fn bytes_formatting_scales_units() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.0MiB");
    }
}
