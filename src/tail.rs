//! Incremental reader for the append-only `server.log`.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tokio_util::sync::CancellationToken;

/// Upper bound for a single line; longer runs are emitted in pieces.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Identity of the file behind the path, used to notice replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
    #[cfg(not(unix))]
    created: Option<std::time::SystemTime>,
}

impl FileIdentity {
    fn of(meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt as _;
            Self {
                dev: meta.dev(),
                ino: meta.ino(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                created: meta.created().ok(),
            }
        }
    }
}

/// Byte offset of the next unread byte, plus the file it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    pub offset: u64,
    pub identity: FileIdentity,
}

/// Why [`LogTailer::follow`] returned.
#[derive(Debug)]
pub enum TailExit {
    Cancelled,
    /// The idle check reported that a scheduled restart is due.
    RestartDue,
    Failed(io::Error),
}

pub struct LogTailer {
    path: PathBuf,
    file: File,
    cursor: LogCursor,
    buf: Vec<u8>,
}

impl LogTailer {
    /// Open `path` (creating it if needed) with the cursor at its current end.
    pub async fn attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .await?;
        drop(file);
        let file = File::open(path).await?;
        let meta = file.metadata().await?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            cursor: LogCursor {
                offset: meta.len(),
                identity: FileIdentity::of(&meta),
            },
            buf: vec![0; MAX_LINE_BYTES],
        })
    }

    pub fn cursor(&self) -> LogCursor {
        self.cursor
    }

    /// Read the next complete, non-empty line written since the last call.
    ///
    /// `Ok(None)` means no full line is available yet. A replaced file is
    /// reopened from its start; a truncated one is read again from offset 0.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a regular file", self.path.display()),
            ));
        }

        let identity = FileIdentity::of(&meta);
        if identity != self.cursor.identity {
            log::debug!("{:?} was replaced, following the new file", self.path);
            self.file = File::open(&self.path).await?;
            self.cursor = LogCursor {
                offset: 0,
                identity,
            };
        }

        let len = meta.len();
        if len < self.cursor.offset {
            log::debug!("{:?} was truncated, rewinding", self.path);
            self.cursor.offset = 0;
        }

        while self.cursor.offset < len {
            let available = usize::try_from(len - self.cursor.offset)
                .unwrap_or(usize::MAX)
                .min(MAX_LINE_BYTES);
            self.file.seek(SeekFrom::Start(self.cursor.offset)).await?;
            let read = read_up_to(&mut self.file, &mut self.buf[..available]).await?;
            if read == 0 {
                return Ok(None);
            }

            let chunk = &self.buf[..read];
            let (line, consumed) = match chunk.iter().position(|&b| b == b'\n') {
                Some(end) => (&chunk[..end], end + 1),
                None if read == MAX_LINE_BYTES => (chunk, read),
                None => return Ok(None),
            };
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let text = (!line.is_empty()).then(|| String::from_utf8_lossy(line).into_owned());
            self.cursor.offset += consumed as u64;

            if text.is_some() {
                return Ok(text);
            }
        }
        Ok(None)
    }

    /// Emit lines until cancelled, sleeping `poll` whenever the file is idle.
    ///
    /// `restart_due` is evaluated on every idle tick.
    pub async fn follow<L, D>(
        mut self,
        token: &CancellationToken,
        poll: Duration,
        mut on_line: L,
        mut restart_due: D,
    ) -> TailExit
    where
        L: FnMut(String),
        D: FnMut() -> bool,
    {
        loop {
            if token.is_cancelled() {
                return TailExit::Cancelled;
            }
            match self.next_line().await {
                Ok(Some(line)) => on_line(line),
                Ok(None) => {
                    if restart_due() {
                        return TailExit::RestartDue;
                    }
                    tokio::select! {
                        () = token.cancelled() => return TailExit::Cancelled,
                        () = tokio::time::sleep(poll) => {}
                    }
                }
                Err(e) => return TailExit::Failed(e),
            }
        }
    }
}

async fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn drain(tailer: &mut LogTailer) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = tailer.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn history_before_attach_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        append(&path, "old one\nold two\n");

        let mut tailer = LogTailer::attach(&path).await.unwrap();
        assert_eq!(tailer.cursor().offset, 16);
        assert!(drain(&mut tailer).await.is_empty());

        append(&path, "fresh\n");
        assert_eq!(drain(&mut tailer).await, vec!["fresh"]);
    }

    #[tokio::test]
    async fn missing_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");

        let mut tailer = LogTailer::attach(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(tailer.cursor().offset, 0);
        assert!(drain(&mut tailer).await.is_empty());
    }

    #[tokio::test]
    async fn lines_are_emitted_once_and_blank_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let mut tailer = LogTailer::attach(&path).await.unwrap();

        append(&path, "a\n\n\r\nb\r\nparti");
        assert_eq!(drain(&mut tailer).await, vec!["a", "b"]);
        assert!(drain(&mut tailer).await.is_empty());

        append(&path, "al\n");
        assert_eq!(drain(&mut tailer).await, vec!["partial"]);
        assert!(drain(&mut tailer).await.is_empty());
    }

    #[tokio::test]
    async fn log_replaced_by_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let mut tailer = LogTailer::attach(&path).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        let err = tailer.next_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncation_rewinds_to_new_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let mut tailer = LogTailer::attach(&path).await.unwrap();

        append(&path, "first run line one\nfirst run line two\n");
        assert_eq!(drain(&mut tailer).await.len(), 2);

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();
        assert!(drain(&mut tailer).await.is_empty());
        assert_eq!(tailer.cursor().offset, 0);

        append(&path, "second run\n");
        assert_eq!(drain(&mut tailer).await, vec!["second run"]);
    }

    #[tokio::test]
    async fn recreated_file_is_followed_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let mut tailer = LogTailer::attach(&path).await.unwrap();
        append(&path, "before rotation\n");
        assert_eq!(drain(&mut tailer).await, vec!["before rotation"]);

        std::fs::remove_file(&path).unwrap();
        assert!(drain(&mut tailer).await.is_empty());

        append(&path, "new\n");
        assert_eq!(drain(&mut tailer).await, vec!["new"]);
    }

    #[tokio::test]
    async fn follow_stops_on_cancel_and_on_due_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let token = CancellationToken::new();

        let tailer = LogTailer::attach(&path).await.unwrap();
        append(&path, "hello\n");
        let mut seen = Vec::new();
        let exit = tailer
            .follow(&token, Duration::from_millis(10), |l| seen.push(l), || true)
            .await;
        assert!(matches!(exit, TailExit::RestartDue));
        assert_eq!(seen, vec!["hello"]);

        let tailer = LogTailer::attach(&path).await.unwrap();
        token.cancel();
        let exit = tailer
            .follow(&token, Duration::from_millis(10), |_| {}, || false)
            .await;
        assert!(matches!(exit, TailExit::Cancelled));
    }
}
