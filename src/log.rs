use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::File,
    io::{self, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    default_level: LogLevel,
    /// Possibly a file instead of stderr.
    log_file: Box<dyn Write + Send>,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let f: Box<dyn Write + Send> = match var_os("RDE_LOG_FILE") {
            Some(filename) => Box::new(File::create(&filename).unwrap_or_else(|_| {
                panic!(
                    "Could not create log file `{:?}' from env var RDE_LOG_FILE",
                    filename
                )
            })),
            None => Box::new(io::stderr()),
        };

        let (default_level, level_map) = match env::var("RDE_LOG") {
            Ok(spec) => init_log_levels(&spec),
            Err(_) => (LogError, HashMap::new()),
        };

        Mutex::new(LogGlobals {
            level_map,
            default_level,
            log_file: f,
        })
    };
}

fn log_level_string_to_level(log_level_string: &str) -> LogLevel {
    match log_level_string {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

/// `RDE_LOG` has the form `mod1:level,mod2:level` with `all` naming the
/// default level for modules not listed.
fn init_log_levels(spec: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mut default_level = LogDebug;
    for mod_colon_level in spec.split(',') {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let level = log_level_string_to_level(res[1].trim());
            if mod_name == "all" {
                default_level = level;
            } else {
                hm.insert(mod_name.to_owned(), level);
            }
        }
    }
    (default_level, hm)
}

/// Given a filename what is the corresponding module name?
/// Note: filenames are case sensitive on Linux, so no lowercasing here.
fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

fn log_level_for(filename: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    let name = filename_to_module_name(filename);
    match l.level_map.get(&name) {
        Some(level) => *level,
        None => l.default_level,
    }
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// Accumulates one log line and writes it out, newline terminated, when
/// dropped. Holds the log lock so concurrent lines don't interleave.
pub struct NewLineTerminatingOstream {
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        let lock = LOG_GLOBALS.lock().unwrap();
        let enabled = always_enabled || level <= log_level_for(filename, &lock);
        if !enabled {
            return None;
        }
        let mut stream = NewLineTerminatingOstream {
            message: Vec::new(),
            lock,
        };
        write_prefix(&mut stream, level, filename, line);
        Some(stream)
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        self.message.push(b'\n');
        self.lock.log_file.write_all(&self.message).unwrap_or(());
        self.lock.log_file.flush().unwrap_or(());
    }
}

impl Write for NewLineTerminatingOstream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.message.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap();
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

/// This is almost always not the method you want. Use the log!() macro.
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, always_enabled)
}

/// Write a line to the log (stderr unless RDE_LOG_FILE is set), subject to
/// the per-module level from RDE_LOG. Execution continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = crate::log::log($log_level, file!(), line!(), false);
            match maybe_stream {
                Some(mut stream) => write!(stream, $($args)+).unwrap(),
                None => (),
            }
        }
    };
}

/// Log unconditionally at FATAL, dump a backtrace to stderr and abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(LogFatal, file!(), line!(), true);
                match maybe_stream {
                    Some(mut stream) => write!(stream, $($args)+).unwrap(),
                    None => (),
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
}

/// Assert a condition about tracee state; on failure, log the task's ids
/// for context and abort. The host's model of the tracee is wrong and
/// continuing would be unsafe.
macro_rules! ed_assert {
    ($task:expr, $cond:expr) => {
        ed_assert!($task, $cond, "")
    };
    ($task:expr, $cond:expr, $($args:tt)+) => {
        {
            let t: &crate::task::Task = $task;
            if !$cond {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let maybe_stream = crate::log::log(LogFatal, file!(), line!(), true);
                    match maybe_stream {
                        Some(mut stream) => {
                            write!(stream, "\n (task {} (rec: {}))\n", t.tid, t.rec_tid).unwrap();
                            write!(stream, " -> Assertion `{}' failed to hold. ", stringify!($cond))
                                .unwrap();
                            write!(stream, $($args)+).unwrap();
                        }
                        None => (),
                    }
                }
                crate::log::notifying_abort(backtrace::Backtrace::new());
            }
        }
    };
}

macro_rules! ed_assert_eq {
    ($task:expr, $left:expr, $right:expr) => {
        ed_assert_eq!($task, $left, $right, "")
    };
    ($task:expr, $left:expr, $right:expr, $($args:tt)+) => {
        {
            let t: &crate::task::Task = $task;
            let val1 = $left;
            let val2 = $right;
            if val1 != val2 {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let maybe_stream = crate::log::log(LogFatal, file!(), line!(), true);
                    match maybe_stream {
                        Some(mut stream) => {
                            write!(stream, "\n (task {} (rec: {}))\n", t.tid, t.rec_tid).unwrap();
                            write!(
                                stream,
                                " -> Assertion `{} == {}` failed to hold.\n    Left: `{:?}`, Right: `{:?}`\n",
                                stringify!($left), stringify!($right), val1, val2
                            )
                            .unwrap();
                            write!(stream, $($args)+).unwrap();
                        }
                        None => (),
                    }
                }
                crate::log::notifying_abort(backtrace::Backtrace::new());
            }
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    eprintln!("=== Start rde backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End rde backtrace");
    std::process::abort();
}
