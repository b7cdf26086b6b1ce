//! Line-oriented configuration parsing.
//!
//! The grammar is deliberately small: one directive per line, keywords are
//! case-insensitive, `#` starts a comment line, blank lines are ignored and
//! unknown directives are skipped for forward compatibility. Parsing never
//! aborts on a bad line; errors are accumulated so a reload can report all of
//! them at once.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_HTML_INTERVAL, DEFAULT_MTA_HOST, DEFAULT_RESTART_DELAY,
    DEFAULT_START_DELAY, DEFAULT_TERM_WAIT,
};

/// Periodic system report cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportPeriod {
    /// No periodic report.
    #[default]
    None,
    /// One report per hour, aligned to the local day.
    Hourly,
    /// One report per day, aligned to the local day.
    Daily,
}

impl ReportPeriod {
    /// Period length in seconds, or `None` when reporting is off.
    pub fn seconds(self) -> Option<i64> {
        match self {
            ReportPeriod::None => None,
            ReportPeriod::Hourly => Some(crate::constants::HOURLY_PERIOD),
            ReportPeriod::Daily => Some(crate::constants::DAILY_PERIOD),
        }
    }
}

/// HTML status report destination and refresh interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlReport {
    /// File the rendered report is written to.
    pub path: PathBuf,
    /// Refresh interval in seconds.
    pub interval: u64,
}

/// One child declaration, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildDecl {
    /// Unique label identifying the child.
    pub label: String,
    /// Optional group the child launches with.
    pub group: Option<String>,
    /// Raw command line; tokenized at launch time.
    pub command: String,
}

/// Immutable snapshot of one parsed configuration file.
///
/// A reparse replaces the snapshot wholesale; the process table is then
/// reconciled against it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    /// Child declarations in file order.
    pub children: Vec<ChildDecl>,
    /// Notification recipients. Empty disables notifications.
    pub recipients: Vec<String>,
    /// Mail transport host.
    pub mta_host: String,
    /// Seconds between staged launches.
    pub start_delay: u64,
    /// Seconds before a dead child is restarted.
    pub restart_delay: u64,
    /// Seconds between escalating termination signals.
    pub term_wait: u64,
    /// Free text identifying this supervisor instance.
    pub description: String,
    /// Periodic email report cadence.
    pub sys_report: ReportPeriod,
    /// Optional HTML status report.
    pub html_report: Option<HtmlReport>,
    /// Log directory. Honored on the very first parse only.
    pub log_dir: Option<PathBuf>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            children: Vec::new(),
            recipients: Vec::new(),
            mta_host: DEFAULT_MTA_HOST.to_string(),
            start_delay: DEFAULT_START_DELAY,
            restart_delay: DEFAULT_RESTART_DELAY,
            term_wait: DEFAULT_TERM_WAIT,
            description: String::new(),
            sys_report: ReportPeriod::None,
            html_report: None,
            log_dir: None,
        }
    }
}

impl ConfigSnapshot {
    /// Labels declared without a group, in file order.
    pub fn ungrouped_order(&self) -> Vec<&str> {
        self.children
            .iter()
            .filter(|c| c.group.is_none())
            .map(|c| c.label.as_str())
            .collect()
    }

    /// Group name to member labels. Iteration yields groups in name sort
    /// order; members stay in file order.
    pub fn groups(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for child in &self.children {
            if let Some(group) = &child.group {
                groups.entry(group.as_str()).or_default().push(&child.label);
            }
        }
        groups
    }

    /// All labels in launch order: ungrouped first, then each group in name
    /// sort order. Shutdown iterates this in reverse.
    pub fn launch_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self
            .ungrouped_order()
            .into_iter()
            .map(str::to_string)
            .collect();
        for (_, members) in self.groups() {
            order.extend(members.into_iter().map(str::to_string));
        }
        order
    }

    /// Looks up a declaration by label.
    pub fn child(&self, label: &str) -> Option<&ChildDecl> {
        self.children.iter().find(|c| c.label == label)
    }
}

/// One parsed directive. Each configuration line folds into at most one of
/// these; the snapshot is the result of folding a whole file.
#[derive(Debug, Clone, PartialEq)]
enum Directive {
    Process {
        label: String,
        group: Option<String>,
        command: String,
    },
    Email(Vec<String>),
    Mta(String),
    StartDelay(u64),
    RestartDelay(u64),
    TermWait(u64),
    Description(String),
    SysReport(ReportPeriod),
    HtmlReport { path: PathBuf, interval: u64 },
    LogDir(PathBuf),
}

/// Result of one parse: the snapshot plus all accumulated errors.
#[derive(Debug)]
pub struct ParseOutcome {
    /// The configuration that was understood.
    pub snapshot: ConfigSnapshot,
    /// Human-readable errors, one per offending line or address.
    pub errors: Vec<String>,
}

/// Reads and parses a configuration file.
pub fn parse_file(path: &std::path::Path) -> std::io::Result<ParseOutcome> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_str(&content))
}

/// Parses configuration text into a snapshot, accumulating errors.
pub fn parse_str(content: &str) -> ParseOutcome {
    let mut snapshot = ConfigSnapshot::default();
    let mut errors = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let lineno = idx + 1;
        let (directive, mut line_errors) = parse_line(raw);
        for err in line_errors.drain(..) {
            errors.push(format!("line {lineno}: {err}"));
        }

        let Some(directive) = directive else { continue };
        match directive {
            Directive::Process {
                label,
                group,
                command,
            } => {
                if !seen.insert(label.clone()) {
                    errors.push(format!("line {lineno}: duplicate label '{label}'"));
                    continue;
                }
                snapshot.children.push(ChildDecl {
                    label,
                    group,
                    command,
                });
            }
            Directive::Email(addresses) => snapshot.recipients = addresses,
            Directive::Mta(host) => snapshot.mta_host = host,
            Directive::StartDelay(secs) => snapshot.start_delay = secs,
            Directive::RestartDelay(secs) => snapshot.restart_delay = secs,
            Directive::TermWait(secs) => snapshot.term_wait = secs,
            Directive::Description(text) => snapshot.description = text,
            Directive::SysReport(period) => snapshot.sys_report = period,
            Directive::HtmlReport { path, interval } => {
                snapshot.html_report = Some(HtmlReport { path, interval });
            }
            Directive::LogDir(path) => snapshot.log_dir = Some(path),
        }
    }

    ParseOutcome { snapshot, errors }
}

/// Parses a single line. Returns the directive, if any, plus any errors the
/// line produced. Blank lines, comments and unknown directives yield neither.
fn parse_line(raw: &str) -> (Option<Directive>, Vec<String>) {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return (None, Vec::new());
    }

    let (token, value) = match line.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim()),
        None => (line, ""),
    };
    let keyword = token.to_ascii_lowercase();

    match keyword.as_str() {
        "process" => parse_process(value, None),
        "email" => parse_email(value),
        "mta" => {
            if value.is_empty() {
                (None, vec!["MTA requires a host".into()])
            } else {
                (Some(Directive::Mta(value.to_string())), Vec::new())
            }
        }
        "startdelay" => parse_seconds(value, "StartDelay", Directive::StartDelay),
        "restartdelay" => parse_seconds(value, "RestartDelay", Directive::RestartDelay),
        "termwait" => parse_seconds(value, "TermWait", Directive::TermWait),
        "description" => (Some(Directive::Description(value.to_string())), Vec::new()),
        "sysreport" => parse_sys_report(value),
        "htmlreport" => parse_html_report(value),
        "logdir" => {
            if value.is_empty() {
                (None, vec!["LogDir requires a path".into()])
            } else {
                (Some(Directive::LogDir(PathBuf::from(value))), Vec::new())
            }
        }
        // `Process<Group>` concatenates the group name to the keyword.
        _ if keyword.starts_with("process") => {
            let group = token["process".len()..].to_string();
            parse_process(value, Some(group))
        }
        // Unknown directives are ignored for forward compatibility.
        _ => (None, Vec::new()),
    }
}

fn parse_process(value: &str, group: Option<String>) -> (Option<Directive>, Vec<String>) {
    let (label, command) = match value.split_once(char::is_whitespace) {
        Some((label, rest)) => (label, rest.trim()),
        None => (value, ""),
    };

    if label.is_empty() {
        return (None, vec!["Process requires a label".into()]);
    }
    if !is_valid_label(label) {
        return (None, vec![format!("invalid label '{label}'")]);
    }
    if command.is_empty() {
        return (None, vec![format!("missing command for '{label}'")]);
    }

    (
        Some(Directive::Process {
            label: label.to_string(),
            group,
            command: command.to_string(),
        }),
        Vec::new(),
    )
}

fn parse_email(value: &str) -> (Option<Directive>, Vec<String>) {
    // An empty value clears the recipient set.
    if value.is_empty() {
        return (Some(Directive::Email(Vec::new())), Vec::new());
    }

    let mut valid = Vec::new();
    let mut errors = Vec::new();
    for entry in value.split(',') {
        let address = entry.trim();
        if address.is_empty() {
            continue;
        }
        if is_valid_address(address) {
            valid.push(address.to_string());
        } else {
            errors.push(format!("invalid mail address '{address}'"));
        }
    }

    // The recipient set is only replaced when at least one address survived.
    if valid.is_empty() {
        (None, errors)
    } else {
        (Some(Directive::Email(valid)), errors)
    }
}

fn parse_seconds(
    value: &str,
    directive: &str,
    build: fn(u64) -> Directive,
) -> (Option<Directive>, Vec<String>) {
    match value.parse::<i64>() {
        Ok(secs) if secs >= 0 => (Some(build(secs as u64)), Vec::new()),
        Ok(secs) => (
            None,
            vec![format!("{directive} must not be negative, got {secs}")],
        ),
        Err(_) => (
            None,
            vec![format!("{directive} requires a number of seconds, got '{value}'")],
        ),
    }
}

fn parse_sys_report(value: &str) -> (Option<Directive>, Vec<String>) {
    if value.eq_ignore_ascii_case("daily") {
        (Some(Directive::SysReport(ReportPeriod::Daily)), Vec::new())
    } else if value.eq_ignore_ascii_case("hourly") {
        (Some(Directive::SysReport(ReportPeriod::Hourly)), Vec::new())
    } else {
        (
            None,
            vec![format!("SysReport must be Daily or Hourly, got '{value}'")],
        )
    }
}

fn parse_html_report(value: &str) -> (Option<Directive>, Vec<String>) {
    if value.is_empty() {
        return (None, vec!["HTMLReport requires a path".into()]);
    }

    // `<path>[:<interval>]`; a non-numeric suffix belongs to the path.
    let (path, interval) = match value.rsplit_once(':') {
        Some((path, suffix)) => match suffix.parse::<u64>() {
            Ok(interval) if !path.is_empty() => (path, interval),
            _ => (value, DEFAULT_HTML_INTERVAL),
        },
        None => (value, DEFAULT_HTML_INTERVAL),
    };

    (
        Some(Directive::HtmlReport {
            path: PathBuf::from(path),
            interval,
        }),
        Vec::new(),
    )
}

/// Labels are identifier characters and dashes.
fn is_valid_label(label: &str) -> bool {
    label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Classic `local-part@domain` check. Not a full RFC parser on purpose.
fn is_valid_address(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }

    let local_ok = local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    let domain_ok = domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');

    local_ok && domain_ok
}

/// Commented example configuration, printed by `-C`. Parsing it produces no
/// errors.
pub const EXAMPLE_CONFIG: &str = "\
# Example metasys configuration.
#
# One directive per line. Keywords are case-insensitive, '#' starts a
# comment, blank lines and unknown directives are ignored.

Description Example metasys instance

# Directory for the supervisor log, pid file, shutdown sentinel and the
# per-child log files. Honored on first startup only.
LogDir log

# Who receives error notifications and periodic reports.
# Leave the value empty to disable notifications.
Email ops@example.com

# Mail transport host used for delivery.
MTA localhost

# Seconds between staged launches.
StartDelay 10

# Seconds before a dead child is restarted. A child that dies within
# this many seconds of its launch is penalized with a far longer wait.
RestartDelay 30

# Seconds between the polite and the forceful termination signal.
TermWait 30

# Periodic email report: Daily or Hourly.
SysReport Daily

# HTML status report: path[:interval-seconds].
HTMLReport log/status.html:60

# Ungrouped children launch first, in file order.
Process ntp-shim /usr/sbin/ntpd -n
Process relay /usr/bin/relay --listen 127.0.0.1:2525

# Grouped children launch afterwards, one group at a time in group-name
# sort order. The group name follows the word Process directly.
Processdb pgfront /usr/bin/pgfront --port 6432
Processweb httpd-a /usr/sbin/httpd -f conf/a.conf
Processweb httpd-b /usr/sbin/httpd -f conf/b.conf
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses_cleanly() {
        let outcome = parse_str(EXAMPLE_CONFIG);
        assert!(outcome.errors.is_empty(), "errors: {:?}", outcome.errors);

        let snapshot = outcome.snapshot;
        assert_eq!(snapshot.description, "Example metasys instance");
        assert_eq!(snapshot.recipients, vec!["ops@example.com".to_string()]);
        assert_eq!(snapshot.mta_host, "localhost");
        assert_eq!(snapshot.start_delay, 10);
        assert_eq!(snapshot.restart_delay, 30);
        assert_eq!(snapshot.term_wait, 30);
        assert_eq!(snapshot.sys_report, ReportPeriod::Daily);
        assert_eq!(snapshot.log_dir, Some(PathBuf::from("log")));

        let html = snapshot.html_report.as_ref().expect("html report");
        assert_eq!(html.path, PathBuf::from("log/status.html"));
        assert_eq!(html.interval, 60);

        assert_eq!(
            snapshot.launch_order(),
            vec!["ntp-shim", "relay", "pgfront", "httpd-a", "httpd-b"]
        );
    }

    #[test]
    fn defaults_apply_when_directives_absent() {
        let outcome = parse_str("Process a /bin/true\n");
        assert!(outcome.errors.is_empty());

        let snapshot = outcome.snapshot;
        assert_eq!(snapshot.start_delay, 10);
        assert_eq!(snapshot.restart_delay, 30);
        assert_eq!(snapshot.term_wait, 30);
        assert_eq!(snapshot.mta_host, "localhost");
        assert_eq!(snapshot.sys_report, ReportPeriod::None);
        assert!(snapshot.recipients.is_empty());
        assert!(snapshot.html_report.is_none());
        assert!(snapshot.log_dir.is_none());
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let outcome = parse_str("PROCESS a /bin/true\nstartdelay 5\nSySrEpOrT hourly\n");
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.snapshot.start_delay, 5);
        assert_eq!(outcome.snapshot.sys_report, ReportPeriod::Hourly);
        assert_eq!(outcome.snapshot.children.len(), 1);
    }

    #[test]
    fn grouped_declarations_keep_group_name_case() {
        let outcome = parse_str("ProcessWeb a /bin/true\n");
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.snapshot.children[0].group.as_deref(), Some("Web"));
    }

    #[test]
    fn groups_sort_by_name_and_keep_file_order_inside() {
        let outcome = parse_str(
            "Process a /bin/true\n\
             ProcessGrp2 x /bin/true\n\
             ProcessGrp1 y /bin/true\n",
        );
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.snapshot.launch_order(), vec!["a", "y", "x"]);
    }

    #[test]
    fn duplicate_labels_are_reported_and_first_wins() {
        let outcome = parse_str("Process a /bin/true\nProcess a /bin/false\n");
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("duplicate label 'a'"));
        assert_eq!(outcome.snapshot.children.len(), 1);
        assert_eq!(outcome.snapshot.children[0].command, "/bin/true");
    }

    #[test]
    fn missing_command_is_an_error() {
        let outcome = parse_str("Process lonely\n");
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("missing command for 'lonely'"));
        assert!(outcome.snapshot.children.is_empty());
    }

    #[test]
    fn invalid_labels_are_rejected() {
        let outcome = parse_str("Process bad/label /bin/true\n");
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.snapshot.children.is_empty());
    }

    #[test]
    fn negative_and_non_numeric_delays_are_errors() {
        let outcome = parse_str("StartDelay -3\nRestartDelay soon\n");
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.snapshot.start_delay, 10);
        assert_eq!(outcome.snapshot.restart_delay, 30);
    }

    #[test]
    fn email_keeps_valid_subset() {
        let outcome = parse_str("Email good@example.com, bad-address, two@example.org\n");
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("bad-address"));
        assert_eq!(
            outcome.snapshot.recipients,
            vec!["good@example.com".to_string(), "two@example.org".to_string()]
        );
    }

    #[test]
    fn email_with_no_valid_address_leaves_set_unchanged() {
        let outcome = parse_str("Email first@example.com\nEmail nonsense\n");
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            outcome.snapshot.recipients,
            vec!["first@example.com".to_string()]
        );
    }

    #[test]
    fn empty_email_clears_recipients() {
        let outcome = parse_str("Email first@example.com\nEmail\n");
        assert!(outcome.errors.is_empty());
        assert!(outcome.snapshot.recipients.is_empty());
    }

    #[test]
    fn html_report_without_interval_uses_default() {
        let outcome = parse_str("HTMLReport /tmp/status.html\n");
        assert!(outcome.errors.is_empty());
        let html = outcome.snapshot.html_report.expect("html report");
        assert_eq!(html.path, PathBuf::from("/tmp/status.html"));
        assert_eq!(html.interval, 60);
    }

    #[test]
    fn html_report_with_non_numeric_suffix_keeps_whole_path() {
        let outcome = parse_str("HTMLReport /tmp/odd:name.html\n");
        assert!(outcome.errors.is_empty());
        let html = outcome.snapshot.html_report.expect("html report");
        assert_eq!(html.path, PathBuf::from("/tmp/odd:name.html"));
        assert_eq!(html.interval, 60);
    }

    #[test]
    fn unknown_directives_are_silently_ignored() {
        let outcome = parse_str("FutureKnob 42\nProcess a /bin/true\n");
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.snapshot.children.len(), 1);
    }

    #[test]
    fn sys_report_rejects_other_values() {
        let outcome = parse_str("SysReport Weekly\n");
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.snapshot.sys_report, ReportPeriod::None);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let outcome = parse_str("\n# a comment\n   \nProcess a /bin/true\n");
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.snapshot.children.len(), 1);
    }
}
