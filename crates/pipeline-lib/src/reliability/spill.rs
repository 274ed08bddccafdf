//! Disk overflow queue (JSON lines)
//!
//! Items are appended at the tail and read back from a byte cursor at the
//! head. The cursor is kept in `<name>.spill.pos` so a restarted process
//! resumes where the last one stopped reading. Once the cursor reaches the
//! end both files are truncated.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct SpillQueue<T> {
    path: PathBuf,
    cursor_path: PathBuf,
    read_offset: u64,
    len: usize,
    _items: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> SpillQueue<T> {
    /// Open the spill file `<dir>/<name>.spill`, resuming anything a previous
    /// process left unread
    pub fn open(dir: &Path, name: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.spill", name));
        let cursor_path = dir.join(format!("{}.spill.pos", name));
        OpenOptions::new().create(true).append(true).open(&path)?;

        let file_len = fs::metadata(&path)?.len();
        let read_offset = match fs::read_to_string(&cursor_path) {
            Ok(text) => match text.trim().parse::<u64>() {
                Ok(pos) if pos <= file_len => pos,
                _ => {
                    warn!(path = ?cursor_path, "Ignoring invalid spill cursor");
                    0
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let mut queue = Self {
            path,
            cursor_path,
            read_offset,
            len: 0,
            _items: PhantomData,
        };
        queue.len = queue.count_unread()?;
        if queue.len > 0 {
            info!(path = ?queue.path, items = queue.len, "Resuming spilled items");
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, item: &T) -> io::Result<()> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&line)?;
        self.len += 1;
        Ok(())
    }

    /// Remove up to `max` items from the head, oldest first
    pub fn pop_batch(&mut self, max: usize) -> io::Result<Vec<T>> {
        if self.len == 0 || max == 0 {
            return Ok(Vec::new());
        }

        let mut reader = self.reader()?;
        let mut items = Vec::with_capacity(max.min(self.len));
        let mut line = String::new();

        while items.len() < max {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            self.read_offset += read as u64;
            if line.trim().is_empty() {
                continue;
            }
            self.len = self.len.saturating_sub(1);
            match serde_json::from_str(line.trim_end()) {
                Ok(item) => items.push(item),
                Err(e) => warn!(path = ?self.path, error = %e, "Skipping unreadable spill record"),
            }
        }

        if self.len == 0 {
            File::create(&self.path)?;
            self.read_offset = 0;
        }
        fs::write(&self.cursor_path, self.read_offset.to_string())?;
        Ok(items)
    }

    /// Visit every unread item without consuming it
    pub fn scan(&self, mut visit: impl FnMut(T)) -> io::Result<()> {
        let mut reader = self.reader()?;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            if let Ok(item) = serde_json::from_str(line.trim_end()) {
                visit(item);
            }
        }
    }

    fn reader(&self) -> io::Result<BufReader<File>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.read_offset))?;
        Ok(BufReader::new(file))
    }

    fn count_unread(&self) -> io::Result<usize> {
        let mut count = 0;
        for line in self.reader()?.lines() {
            if !line?.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }
}
