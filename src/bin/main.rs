use std::fs;
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};
use std::process;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;

use metasys::{
    cli::{Cli, parse_args},
    config::{self, EXAMPLE_CONFIG},
    constants::DEFAULT_LOG_DIR,
    notify::{SmtpSink, hostname},
    report::{ResourceProbe, SysinfoProbe},
    runtime::{self, Paths},
    spawn,
    supervisor::Supervisor,
};

fn main() {
    let args = parse_args();

    if args.example_config {
        print!("{EXAMPLE_CONFIG}");
        return;
    }

    let Some(config_path) = args.config.clone() else {
        eprintln!("metasys: a configuration file is required (see --help)");
        process::exit(1);
    };

    if args.wants_shutdown() {
        process::exit(shutdown_running(&config_path));
    }

    // The first parse is fatal on any error; reloads are not.
    let outcome = match config::parse_file(&config_path) {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("metasys: failed to read {}: {err}", config_path.display());
            process::exit(1);
        }
    };
    if !outcome.errors.is_empty() {
        for err in &outcome.errors {
            eprintln!("metasys: {}: {err}", config_path.display());
        }
        process::exit(1);
    }

    let log_dir = outcome
        .snapshot
        .log_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
    let paths = Paths::new(log_dir);
    if let Err(err) = fs::create_dir_all(paths.log_dir()) {
        eprintln!(
            "metasys: failed to create log directory {:?}: {err}",
            paths.log_dir()
        );
        process::exit(1);
    }
    init_logging(&args, &paths);

    if args.daemonize {
        if let Err(err) = daemonize() {
            error!("Failed to daemonize: {err}");
            process::exit(1);
        }
    }

    if let Err(err) = register_signal_handler(&paths) {
        error!("Failed to install signal handler: {err}");
        eprintln!("metasys: failed to install signal handler: {err}");
        process::exit(1);
    }

    spawn::augment_path();

    let sink = Box::new(SmtpSink::new(&hostname()));
    let probe: Option<Box<dyn ResourceProbe>> = Some(Box::new(SysinfoProbe::new()));

    let mut supervisor =
        match Supervisor::new(config_path, outcome.snapshot, paths, sink, probe) {
            Ok(supervisor) => supervisor,
            Err(err) => {
                error!("{err}");
                eprintln!("metasys: {err}");
                process::exit(1);
            }
        };

    if let Err(err) = supervisor.run() {
        error!("Supervisor exited with error: {err}");
        process::exit(1);
    }
}

/// Handles `-s` / `-k`: find the running instance via its pid file, ask it
/// to shut down, and exit. A stale pid file naming a dead process is
/// cleared.
fn shutdown_running(config_path: &Path) -> i32 {
    let log_dir = config::parse_file(config_path)
        .map(|outcome| {
            outcome
                .snapshot
                .log_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
        })
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR));
    let paths = Paths::new(log_dir);

    match runtime::read_pid(&paths) {
        Some(pid) if runtime::process_alive(pid) => {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    println!("metasys: sent shutdown request to pid {pid}");
                    0
                }
                Err(err) => {
                    eprintln!("metasys: failed to signal pid {pid}: {err}");
                    1
                }
            }
        }
        Some(pid) => {
            let _ = fs::remove_file(paths.pid_file());
            println!("metasys: no live instance; cleared stale pid file for {pid}");
            0
        }
        None => {
            println!("metasys: no running instance found");
            0
        }
    }
}

fn init_logging(args: &Cli, paths: &Paths) {
    let filter = if args.verbose > 0 {
        EnvFilter::new(args.log_level().to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let log_path = paths.supervisor_log();
    let file = match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(err) => {
            // Failing to open our own log is fatal at startup.
            eprintln!("metasys: failed to open log file {log_path:?}: {err}");
            process::exit(1);
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || file.try_clone().expect("log file handle"))
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(false)
        .with_level(false)
        .with_ansi(false)
        .try_init();

    info!("metasys starting, logging to {log_path:?}");
}

/// The handler only touches the filesystem; the control loop notices the
/// sentinel at its next phase boundary.
fn register_signal_handler(paths: &Paths) -> Result<(), ctrlc::Error> {
    let paths = paths.clone();
    ctrlc::set_handler(move || {
        let _ = paths.request_shutdown();
    })
}

/// Classic double fork. The working directory is kept so relative log
/// directories and the augmented PATH keep resolving.
fn daemonize() -> std::io::Result<()> {
    if unsafe { libc::fork() } > 0 {
        process::exit(0);
    }

    unsafe {
        libc::setsid();
    }

    if unsafe { libc::fork() } > 0 {
        process::exit(0);
    }

    let devnull = fs::File::open("/dev/null")?;
    let fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }

    Ok(())
}
