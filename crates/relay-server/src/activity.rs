use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{Days, Local, NaiveDate};
use relay_kernel::{activity_file_name, activity_line, first_mention, ACTIVITY_SERIES};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

enum ActivityCommand {
    Append { category: String, message: String },
    Flush(oneshot::Sender<()>),
}

/// Handle to the per-day activity log.
///
/// Lines are queued to a single writer task, which is the only code that
/// touches the log files. Queued lines that have not been written when the
/// process exits are lost.
#[derive(Clone)]
pub struct ActivityLog {
    tx: mpsc::Sender<ActivityCommand>,
}

impl ActivityLog {
    pub fn spawn(dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(dir, DEFAULT_QUEUE_CAPACITY)
    }

    fn with_capacity(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_writer(dir.into(), rx));
        Self { tx }
    }

    /// Fire and forget; drops the line when the queue is full.
    pub fn record(&self, category: impl Into<String>, message: impl Into<String>) {
        let cmd = ActivityCommand::Append {
            category: category.into(),
            message: message.into(),
        };
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(ActivityCommand::Append { category, .. })) => {
                warn!(%category, "activity queue full, dropping line");
            }
            Err(_) => warn!("activity writer stopped, dropping line"),
        }
    }

    /// Resolves once every line queued before the call has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(ActivityCommand::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

async fn run_writer(dir: PathBuf, mut rx: mpsc::Receiver<ActivityCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            ActivityCommand::Append { category, message } => {
                let today = Local::now().date_naive();
                if let Err(e) = append_line(&dir, today, &category, &message).await {
                    error!(dir = %dir.display(), error = %e, "unable to access activity log");
                }
            }
            ActivityCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

pub async fn append_line(
    dir: &Path,
    date: NaiveDate,
    category: &str,
    message: &str,
) -> std::io::Result<()> {
    let path = dir.join(activity_file_name(category, date));
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(activity_line(category, message).as_bytes())
        .await?;
    file.flush().await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionRow {
    pub date: NaiveDate,
    pub category: String,
    pub message: String,
}

/// Report line: `YYYY-MM-DD <message>`.
impl fmt::Display for MentionRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date.format("%Y-%m-%d"), self.message)
    }
}

/// First line per day whose category starts with `prefix`, scanning the
/// `days` most recent daily files ending at `today`. Oldest day first; days
/// without a file or without a match are skipped.
pub fn mention_report(
    dir: &Path,
    today: NaiveDate,
    days: u64,
    prefix: &str,
) -> Result<Vec<MentionRow>, String> {
    if !dir.is_dir() {
        return Err(format!(
            "{} is not a directory of {ACTIVITY_SERIES} logs",
            dir.display()
        ));
    }
    let mut rows = Vec::new();
    for back in (0..days).rev() {
        let Some(date) = today.checked_sub_days(Days::new(back)) else {
            continue;
        };
        let path = dir.join(activity_file_name("", date));
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        if let Some((category, message)) = first_mention(&text, prefix) {
            rows.push(MentionRow {
                date,
                category: category.to_string(),
                message: message.to_string(),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("phab-relay-{tag}-{nanos}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[tokio::test]
    async fn queued_lines_land_in_todays_files() {
        let dir = temp_dir("activity");
        let log = ActivityLog::spawn(&dir);
        log.record("PHID-TASK-1", "<a href='u'>T1</a>");
        log.record("error", "phid.query failed");
        log.record("PHID-TASK-2", "");
        log.flush().await;

        let today = Local::now().date_naive();
        let main = std::fs::read_to_string(dir.join(activity_file_name("x", today))).unwrap();
        assert_eq!(main, "PHID-TASK-1 -> <a href='u'>T1</a>\nPHID-TASK-2 -> \n");
        let errors =
            std::fs::read_to_string(dir.join(activity_file_name("error", today))).unwrap();
        assert_eq!(errors, "error -> phid.query failed\n");
    }

    #[tokio::test]
    async fn concurrent_writers_never_interleave_lines() {
        let dir = temp_dir("activity-concurrent");
        let log = ActivityLog::spawn(&dir);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.record(format!("PHID-TASK-{i}"), "x".repeat(64));
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        log.flush().await;

        let today = Local::now().date_naive();
        let text = std::fs::read_to_string(dir.join(activity_file_name("x", today))).unwrap();
        assert_eq!(text.lines().count(), 16);
        assert!(text
            .lines()
            .all(|l| l.starts_with("PHID-TASK-") && l.ends_with(&"x".repeat(64))));
    }

    #[tokio::test]
    async fn unwritable_dir_is_not_fatal() {
        let dir = temp_dir("activity-missing").join("does-not-exist");
        let log = ActivityLog::spawn(&dir);
        log.record("PHID-TASK-1", "x");
        log.flush().await;
        log.record("PHID-TASK-2", "y");
        log.flush().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn full_queue_drops_lines_instead_of_blocking() {
        let dir = temp_dir("activity-full");
        let log = ActivityLog::with_capacity(&dir, 1);
        // The writer cannot run until this task yields, so only the first
        // line fits.
        for i in 0..5 {
            log.record(format!("PHID-TASK-{i}"), "x");
        }
        log.flush().await;

        let today = Local::now().date_naive();
        let text = std::fs::read_to_string(dir.join(activity_file_name("x", today))).unwrap();
        assert_eq!(text, "PHID-TASK-0 -> x\n");
    }

    #[test]
    fn report_rows_print_date_and_message() {
        let row = MentionRow {
            date: NaiveDate::from_ymd_opt(2026, 3, 7).unwrap(),
            category: "PHID-USER-a".to_string(),
            message: "<a href='u'>alice</a>".to_string(),
        };
        assert_eq!(row.to_string(), "2026-03-07 <a href='u'>alice</a>");
    }

    #[tokio::test]
    async fn report_lists_first_mention_per_day() {
        let dir = temp_dir("report");
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let yesterday = today.pred_opt().unwrap();
        let old = today.checked_sub_days(Days::new(40)).unwrap();
        append_line(&dir, yesterday, "PHID-USER-a", "<a>alice</a>")
            .await
            .unwrap();
        append_line(&dir, yesterday, "PHID-USER-b", "<a>bob</a>")
            .await
            .unwrap();
        append_line(&dir, today, "PHID-TASK-1", "<a>T1</a>")
            .await
            .unwrap();
        append_line(&dir, today, "PHID-USER-b", "<a>bob</a>")
            .await
            .unwrap();
        append_line(&dir, old, "PHID-USER-c", "<a>carol</a>")
            .await
            .unwrap();

        let rows = mention_report(&dir, today, 30, "PHID-USER-").unwrap();
        assert_eq!(
            rows,
            vec![
                MentionRow {
                    date: yesterday,
                    category: "PHID-USER-a".to_string(),
                    message: "<a>alice</a>".to_string(),
                },
                MentionRow {
                    date: today,
                    category: "PHID-USER-b".to_string(),
                    message: "<a>bob</a>".to_string(),
                },
            ]
        );
    }
}
