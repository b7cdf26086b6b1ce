//! Constants and default values for the metasys supervisor.

use std::time::Duration;

/// Supervisor log file inside the log directory.
pub const LOG_FILE_NAME: &str = "metasys.log";

/// Pid file inside the log directory, holding the supervisor's own pid.
pub const PID_FILE_NAME: &str = "metasys.pid";

/// Shutdown sentinel file inside the log directory. Its presence requests
/// shutdown; it is removed on clean exit.
pub const TERM_FILE_NAME: &str = "metasys.term";

/// Log directory used when the configuration carries no `LogDir` directive.
pub const DEFAULT_LOG_DIR: &str = ".";

/// Seconds between staged launches.
pub const DEFAULT_START_DELAY: u64 = 10;

/// Seconds to wait before restarting a dead child.
pub const DEFAULT_RESTART_DELAY: u64 = 30;

/// Seconds between escalating termination signals.
pub const DEFAULT_TERM_WAIT: u64 = 30;

/// Seconds between HTML report refreshes.
pub const DEFAULT_HTML_INTERVAL: u64 = 60;

/// Mail transport host used when the configuration carries no `MTA` directive.
pub const DEFAULT_MTA_HOST: &str = "localhost";

/// Multiplier applied to the restart delay when a child exits no later than
/// `restart_delay` seconds after its last launch.
pub const QUICK_DEATH_PENALTY: i64 = 100;

/// Control loop tick. The sleep is a lower bound; a tick may run later under
/// load.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Poll granularity while waiting for a signalled child to be reaped.
pub const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Period of hourly system reports, in seconds.
pub const HOURLY_PERIOD: i64 = 3_600;

/// Period of daily system reports, in seconds.
pub const DAILY_PERIOD: i64 = 86_400;

/// SMTP port used for notification delivery.
pub const SMTP_PORT: u16 = 25;
