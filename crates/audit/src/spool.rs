//! JSON-lines spill file
//!
//! Where events go when the database refuses a write. Replayed into the
//! store on the next successful write.

use crate::event::AuditEvent;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct Spool {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Spool {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and flush it to disk
    pub fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let json = serde_json::to_string(event).map_err(std::io::Error::other)?;
        writeln!(file, "{}", json)?;
        file.sync_data()?;
        Ok(())
    }

    /// Every readable event in the spill, oldest first
    pub fn read_all(&self) -> std::io::Result<Vec<AuditEvent>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_locked()
    }

    /// Hand the spilled events to `import` and remove the spill once it
    /// succeeds. Appends wait until the spill is gone, so nothing written
    /// after the read is removed with it.
    pub fn drain<T, E>(&self, import: impl FnOnce(&[AuditEvent]) -> Result<T, E>) -> Result<T, E>
    where
        E: From<std::io::Error>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let events = self.read_locked()?;
        let imported = import(&events)?;
        self.remove_locked()?;
        Ok(imported)
    }

    fn read_locked(&self) -> std::io::Result<Vec<AuditEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(error = %e, path = %self.path.display(), "unreadable spill line"),
            }
        }
        Ok(events)
    }

    pub fn is_empty(&self) -> bool {
        std::fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true)
    }

    /// Drop the spill once it has been replayed
    pub fn clear(&self) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.remove_locked()
    }

    fn remove_locked(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
