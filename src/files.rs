//! Sandboxed per-effect file handles
//!
//! A small fixed-capacity table of file-like objects scripts address by
//! handle. Slot 0 always holds the serializer used by `@serialize`; it is
//! never removed. The table takes a list-level lock only to locate a slot,
//! then hands out the per-file lock, so one handle's blocking I/O never
//! stalls unrelated lookups.

use crate::parse::dot_atof;
use crate::types::{Real, MAX_FILE_HANDLES};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A file-like object a script can read values from or write values to.
pub trait VirtualFile: Send {
    /// Read the next value; `None` once exhausted.
    fn read_value(&mut self) -> Option<Real>;

    /// Append one value. Ignored by read-only files.
    fn write_value(&mut self, value: Real);

    /// Remaining values to read, or -1 while in write mode.
    fn avail(&self) -> i64;

    /// True when writes are accepted.
    fn in_write_mode(&self) -> bool {
        false
    }
}

/// The `@serialize` endpoint: a byte buffer of f32 little-endian values,
/// reading when the host restores state and writing when it saves.
#[derive(Debug, Default)]
pub struct Serializer {
    writing: bool,
    buf: Vec<u8>,
    pos: usize,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a read pass over previously saved bytes.
    pub fn begin_read(&mut self, data: Vec<u8>) {
        self.writing = false;
        self.buf = data;
        self.pos = 0;
    }

    /// Start a write pass with an empty buffer.
    pub fn begin_write(&mut self) {
        self.writing = true;
        self.buf.clear();
        self.pos = 0;
    }

    /// Finish the pass and hand back the buffer contents.
    pub fn end(&mut self) -> Vec<u8> {
        self.pos = 0;
        std::mem::take(&mut self.buf)
    }
}

impl VirtualFile for Serializer {
    fn read_value(&mut self) -> Option<Real> {
        if self.writing || self.pos + 4 > self.buf.len() {
            return None;
        }
        let bytes = [
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ];
        self.pos += 4;
        Some(f32::from_le_bytes(bytes) as Real)
    }

    fn write_value(&mut self, value: Real) {
        if self.writing {
            self.buf.extend_from_slice(&(value as f32).to_le_bytes());
        }
    }

    fn avail(&self) -> i64 {
        if self.writing {
            -1
        } else {
            ((self.buf.len() - self.pos) / 4) as i64
        }
    }

    fn in_write_mode(&self) -> bool {
        self.writing
    }
}

/// Read-only text data file: one number per line, `#`/`;` comments skipped.
#[derive(Debug)]
pub struct TextFile {
    values: Vec<Real>,
    pos: usize,
}

impl TextFile {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let values = contents
            .lines()
            .map(str::trim)
            .filter(|line| {
                !line.is_empty() && !line.starts_with('#') && !line.starts_with(';')
            })
            .map(dot_atof)
            .collect();
        Ok(Self { values, pos: 0 })
    }
}

impl VirtualFile for TextFile {
    fn read_value(&mut self) -> Option<Real> {
        let value = self.values.get(self.pos).copied()?;
        self.pos += 1;
        Some(value)
    }

    fn write_value(&mut self, _value: Real) {}

    fn avail(&self) -> i64 {
        (self.values.len() - self.pos) as i64
    }
}

/// Read-only raw data file: a stream of f32 little-endian values.
#[derive(Debug)]
pub struct RawFile {
    data: Vec<u8>,
    pos: usize,
}

impl RawFile {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            data: fs::read(path)?,
            pos: 0,
        })
    }
}

impl VirtualFile for RawFile {
    fn read_value(&mut self) -> Option<Real> {
        if self.pos + 4 > self.data.len() {
            return None;
        }
        let bytes = [
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ];
        self.pos += 4;
        Some(f32::from_le_bytes(bytes) as Real)
    }

    fn write_value(&mut self, _value: Real) {}

    fn avail(&self) -> i64 {
        ((self.data.len() - self.pos) / 4) as i64
    }
}

/// Shared handle to one open file.
pub type FileHandle = Arc<Mutex<dyn VirtualFile>>;

/// Fixed-capacity table of open file handles.
pub struct FileTable {
    slots: Mutex<Vec<Option<FileHandle>>>,
}

impl FileTable {
    /// Create a table whose slot 0 is the given serializer.
    pub fn new(serializer: Arc<Mutex<Serializer>>) -> Self {
        let serializer: FileHandle = serializer;
        let mut slots: Vec<Option<FileHandle>> = Vec::with_capacity(16);
        slots.push(Some(serializer));
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Insert a file into the first empty slot, appending when none is
    /// free. Returns `None` once all 64 handles are in use.
    pub fn insert(&self, file: FileHandle) -> Option<u32> {
        let mut slots = self.slots.lock().unwrap();

        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Some(i as u32);
            }
        }

        let pos = slots.len();
        if pos >= MAX_FILE_HANDLES {
            return None;
        }
        slots.push(Some(file));
        Some(pos as u32)
    }

    /// Look up a handle. The list lock is held only long enough to clone
    /// the slot; the caller locks the returned file itself.
    pub fn get(&self, handle: u32) -> Option<FileHandle> {
        let slots = self.slots.lock().unwrap();
        slots.get(handle as usize)?.clone()
    }

    /// Close one handle. Slot 0 is not closable.
    pub fn close(&self, handle: u32) -> bool {
        if handle == 0 {
            return false;
        }
        let taken = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get_mut(handle as usize) {
                Some(slot) => slot.take(),
                None => None,
            }
        };
        match taken {
            Some(file) => {
                // wait out any I/O still holding the per-file lock
                drop(file.lock().unwrap());
                true
            }
            None => false,
        }
    }

    /// Drop every handle except the serializer, draining in-flight
    /// per-file locks first.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        while slots.len() > 1 {
            if let Some(file) = slots.pop().flatten() {
                drop(file.lock().unwrap());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
