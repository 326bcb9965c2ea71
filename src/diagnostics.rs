use chrono::Local;
use std::backtrace::Backtrace;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const LOG_ROTATE_KEEP: usize = 5;
const CRASH_LOG_KEEP: usize = 5;

pub fn logs_dir() -> Result<PathBuf, String> {
    Ok(crate::settings::data_dir()?.join("logs"))
}

/// Writes every log record to stderr and, when available, the session log.
struct Tee {
    file: Option<File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            // A full disk must not take logging down with it.
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        Ok(())
    }
}

/// Installs the global logger. `RUST_LOG` filters as usual; the default
/// level is `info`. Returns the session log path when one could be opened.
pub fn init_logging() -> Option<PathBuf> {
    let opened = logs_dir().and_then(|dir| open_session_log(&dir));
    let (file, path) = match opened {
        Ok((file, path)) => (Some(file), Some(path)),
        Err(e) => {
            eprintln!("[diagnostics] file logging disabled: {}", e);
            (None, None)
        }
    };

    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(Tee { file })))
        .try_init();
    if let Err(e) = result {
        eprintln!("[diagnostics] logger already installed: {}", e);
    }

    log::info!(
        "session_start version={} ts={}",
        env!("CARGO_PKG_VERSION"),
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    path
}

fn open_session_log(dir: &Path) -> Result<(File, PathBuf), String> {
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create logs dir: {}", e))?;
    rotate_logs(dir)?;
    let active = dir.join("app.log");
    let file = File::options()
        .create(true)
        .append(true)
        .open(&active)
        .map_err(|e| format!("Failed to open app log: {}", e))?;
    Ok((file, active))
}

fn rotate_logs(dir: &Path) -> Result<(), String> {
    for i in (1..LOG_ROTATE_KEEP).rev() {
        let from = dir.join(format!("app.{}.log", i));
        let to = dir.join(format!("app.{}.log", i + 1));
        if from.exists() {
            let _ = fs::remove_file(&to);
            fs::rename(&from, &to).map_err(|e| format!("Failed to rotate log {}: {}", i, e))?;
        }
    }
    let active = dir.join("app.log");
    if active.exists() {
        let to = dir.join("app.1.log");
        let _ = fs::remove_file(&to);
        fs::rename(&active, &to).map_err(|e| format!("Failed to rotate active log: {}", e))?;
    }
    prune_crash_logs(dir, CRASH_LOG_KEEP)?;
    Ok(())
}

fn prune_crash_logs(dir: &Path, keep: usize) -> Result<(), String> {
    let mut crash_files: Vec<(std::time::SystemTime, PathBuf)> = vec![];
    for entry in fs::read_dir(dir).map_err(|e| format!("Failed to read logs dir: {}", e))? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !(name.starts_with("crash-") && name.ends_with(".log")) {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        crash_files.push((modified, path));
    }
    crash_files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in crash_files.into_iter().skip(keep) {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let panic_msg = format!("{}", info);
        let bt = Backtrace::force_capture();
        log::error!("panic: {}\nbacktrace:\n{}", panic_msg, bt);
        match logs_dir().and_then(|dir| write_crash_file(&dir, &panic_msg, &bt.to_string())) {
            Ok(path) => eprintln!("[diagnostics] crash report written to {}", path.display()),
            Err(e) => eprintln!("[diagnostics] could not write crash report: {}", e),
        }
        previous(info);
    }));
}

fn write_crash_file(dir: &Path, message: &str, backtrace: &str) -> Result<PathBuf, String> {
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create logs dir: {}", e))?;
    let name = format!("crash-{}.log", Local::now().format("%Y%m%d-%H%M%S"));
    let path = dir.join(name);
    let body = format!(
        "VoiceChat crash report\nversion: {}\ntime: {}\n\nmessage:\n{}\n\nbacktrace:\n{}\n",
        env!("CARGO_PKG_VERSION"),
        Local::now().to_rfc3339(),
        message,
        backtrace
    );
    fs::write(&path, body).map_err(|e| format!("Failed to write crash log: {}", e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_shifts_logs_and_caps_history() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0..(LOG_ROTATE_KEEP + 2) {
            let (mut file, _) = open_session_log(dir.path()).unwrap();
            writeln!(file, "round {}", round).unwrap();
        }
        let newest = fs::read_to_string(dir.path().join("app.log")).unwrap();
        assert_eq!(newest.trim(), format!("round {}", LOG_ROTATE_KEEP + 1));
        let previous = fs::read_to_string(dir.path().join("app.1.log")).unwrap();
        assert_eq!(previous.trim(), format!("round {}", LOG_ROTATE_KEEP));
        assert!(dir.path().join(format!("app.{}.log", LOG_ROTATE_KEEP)).exists());
        assert!(!dir.path().join(format!("app.{}.log", LOG_ROTATE_KEEP + 1)).exists());
    }

    #[test]
    fn crash_logs_are_pruned_to_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(CRASH_LOG_KEEP + 3) {
            fs::write(dir.path().join(format!("crash-{:02}.log", i)), "x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();
        prune_crash_logs(dir.path(), CRASH_LOG_KEEP).unwrap();

        let crash_count = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("crash-"))
            .count();
        assert_eq!(crash_count, CRASH_LOG_KEEP);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn crash_file_contains_message_and_backtrace() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_crash_file(dir.path(), "boom", "frame 0").unwrap();
        let body = fs::read_to_string(path).unwrap();
        assert!(body.contains("message:\nboom"));
        assert!(body.contains("backtrace:\nframe 0"));
    }
}
