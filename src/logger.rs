use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger as Log4rsLogger, Root};
use log4rs::encode::pattern::PatternEncoder;

/// Longest stem kept from a question when naming its log file.
pub const MAX_STEM_CHARS: usize = 50;

/// Stem used when nothing of the question survives sanitizing.
const EMPTY_STEM: &str = "pergunta";

/// Target for the process-level log that records questions and outcomes.
pub const MAIN_LOG_TARGET: &str = "main_log";

pub fn file_timestamp(now: &DateTime<Local>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

/// Reduce a question to something safe for a file name.
///
/// Characters other than alphanumerics, spaces and underscores become `_`,
/// spaces become `_`, edge underscores are trimmed and the result is capped
/// at [`MAX_STEM_CHARS`] characters.
pub fn sanitize_filename(question: &str) -> String {
    let replaced: String = question
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    replaced.trim_matches('_').chars().take(MAX_STEM_CHARS).collect()
}

/// File name for the log of `question` asked at `now`.
pub fn session_file_name(question: &str, now: &DateTime<Local>) -> String {
    let mut stem = sanitize_filename(question);
    if stem.is_empty() {
        stem = EMPTY_STEM.to_string();
    }
    format!("{stem}_{}.txt", file_timestamp(now))
}

/// Append-only, flush-per-line text log tied to one session.
///
/// Every failure is reported on stderr and swallowed: losing a log line must
/// never cost an answer.
pub struct SessionLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl SessionLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match open_append(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("Erro ao abrir o arquivo de log {}: {e}", path.display());
                None
            }
        };
        SessionLog {
            path,
            file: Mutex::new(file),
        }
    }

    /// Open the log for `question` inside `dir`.
    pub fn open_for(dir: &Path, question: &str) -> Self {
        Self::open(dir.join(session_file_name(question, &Local::now())))
    }

    /// Process-wide log for messages written outside any session.
    pub fn open_default(dir: &Path) -> Self {
        Self::open(dir.join(format!("default_log_{}.txt", file_timestamp(&Local::now()))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().map(|f| f.is_some()).unwrap_or(false)
    }

    /// Append `[timestamp] message`.
    pub fn write(&self, message: &str) {
        if let Err(e) = self.try_write(message) {
            eprintln!("Erro ao salvar no arquivo de log: {e}");
        }
    }

    fn try_write(&self, message: &str) -> std::io::Result<()> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{timestamp}] {message}\n");

        let mut guard = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file lock poisoned"))?;
        let file = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not open", self.path.display()),
            )
        })?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog").field("path", &self.path).finish()
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Route `log` records to files.
///
/// Diagnostics land in `<log_dir>/<timestamp>.log`; records sent to
/// [`MAIN_LOG_TARGET`] land only in `<output_dir>/main_log_<timestamp>.txt`.
pub fn setup_logging(log_dir: &Path, output_dir: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;
    std::fs::create_dir_all(output_dir)?;
    let now = Local::now();
    let diag_path = log_dir.join(format!("{}.log", now.format("%Y-%m-%d-%H_%M")));
    let main_path = output_dir.join(format!("main_log_{}.txt", file_timestamp(&now)));

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}",
        )))
        .build(diag_path)?;

    let main_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("[{d(%Y-%m-%d %H:%M:%S)}] {m}{n}")))
        .build(&main_path)?;

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("main", Box::new(main_appender)))
        .logger(
            Log4rsLogger::builder()
                .appender("main")
                .additive(false)
                .build(MAIN_LOG_TARGET, LevelFilter::Info),
        )
        .build(Root::builder().appender("file").build(LevelFilter::Info))?;

    log4rs::init_config(config)?;

    Ok(main_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn test_sanitize_keeps_allowed_characters() {
        assert_eq!(sanitize_filename("What is 2+2?"), "What_is_2_2");
        assert_eq!(sanitize_filename("Why? (seriously!)"), "Why___seriously");
        assert_eq!(sanitize_filename("  ação _ok_ "), "ação__ok");
    }

    #[test]
    fn test_sanitize_truncates_to_fifty_chars() {
        let long = "a".repeat(80);
        assert_eq!(sanitize_filename(&long).chars().count(), MAX_STEM_CHARS);

        let multibyte = "é".repeat(60);
        assert_eq!(sanitize_filename(&multibyte).chars().count(), MAX_STEM_CHARS);
    }

    #[test]
    fn test_sanitize_only_allowed_classes() {
        let questions = [
            "Why? (seriously!)",
            "../../etc/passwd",
            "tab\tand\nnewline",
            "emoji 🚀 rocket",
            "quote\"s and 'apostrophes' <tags>",
            "",
        ];
        for q in questions {
            let stem = sanitize_filename(q);
            assert!(stem.chars().count() <= MAX_STEM_CHARS);
            assert!(
                stem.chars().all(|c| c.is_alphanumeric() || c == '_'),
                "{q:?} -> {stem:?}"
            );
        }
    }

    #[test]
    fn test_session_file_name() {
        let now = fixed_now();
        assert_eq!(
            session_file_name("What is 2+2?", &now),
            "What_is_2_2_20240309_140507.txt"
        );
        assert_eq!(session_file_name("???", &now), "pergunta_20240309_140507.txt");
    }

    #[test]
    fn test_write_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::open(dir.path().join("nested").join("s.txt"));
        assert!(log.is_open());

        log.write("first");
        log.write("second");

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.txt");
        SessionLog::open(&path).write("one");
        SessionLog::open(&path).write("two");

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_unopenable_log_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        // A regular file cannot act as a parent directory.
        let log = SessionLog::open(blocker.join("s.txt"));
        assert!(!log.is_open());
        log.write("dropped");
    }

    #[test]
    fn test_open_for_uses_question_stem() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::open_for(dir.path(), "Why? (seriously!)");
        let name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Why___seriously_"));
        assert!(name.ends_with(".txt"));
    }
}
