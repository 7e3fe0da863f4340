//! Durable storage for the committed cursor floor.
//!
//! File format (UTF-8 JSON): `{"version": 1, "committed_floor": <n>}`.
//! Writes go to a sibling `<name>.tmp` file which is then renamed over the
//! destination, so a crash mid-write leaves the previous value intact.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::Serialize;

const STATE_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateErrorKind {
    LoadIo,
    LoadJson,
    LoadShape,
    LoadFloor,
    SaveFloor,
    SaveIo,
}

impl StateErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoadIo => "state-load-io",
            Self::LoadJson => "state-load-json",
            Self::LoadShape => "state-load-shape",
            Self::LoadFloor => "state-load-floor",
            Self::SaveFloor => "state-save-floor",
            Self::SaveIo => "state-save-io",
        }
    }

    pub fn is_load(self) -> bool {
        matches!(
            self,
            Self::LoadIo | Self::LoadJson | Self::LoadShape | Self::LoadFloor
        )
    }

    pub fn is_io(self) -> bool {
        matches!(self, Self::LoadIo | Self::SaveIo)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{}: {detail}", .kind.as_str())]
pub struct StateError {
    pub kind: StateErrorKind,
    pub detail: String,
}

impl StateError {
    fn new(kind: StateErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub committed_floor: Option<i64>,
}

#[derive(Serialize)]
struct CursorStateFile {
    version: u32,
    committed_floor: i64,
}

/// JSON file store for a single committed floor value.
#[derive(Clone, Debug)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the committed floor. A missing file means "no floor yet".
    pub fn load(&self) -> Result<CursorSnapshot, StateError> {
        if !self.path.exists() {
            return Ok(CursorSnapshot::default());
        }

        let txt = fs::read_to_string(&self.path)
            .map_err(|e| StateError::new(StateErrorKind::LoadIo, e.to_string()))?;
        let payload: serde_json::Value = serde_json::from_str(&txt)
            .map_err(|e| StateError::new(StateErrorKind::LoadJson, e.to_string()))?;

        let Some(obj) = payload.as_object() else {
            return Err(StateError::new(
                StateErrorKind::LoadShape,
                "state root must be an object",
            ));
        };

        let raw = match obj.get("committed_floor") {
            None | Some(serde_json::Value::Null) => return Ok(CursorSnapshot::default()),
            Some(v) => v,
        };

        let floor = coerce_floor(raw).ok_or_else(|| {
            StateError::new(StateErrorKind::LoadFloor, "committed_floor must be an integer")
        })?;
        if floor < 0 {
            return Err(StateError::new(
                StateErrorKind::LoadFloor,
                "committed_floor must be >= 0",
            ));
        }

        Ok(CursorSnapshot {
            committed_floor: Some(floor),
        })
    }

    /// Atomically replace the stored floor.
    pub fn save(&self, committed_floor: i64) -> Result<(), StateError> {
        if committed_floor < 0 {
            return Err(StateError::new(
                StateErrorKind::SaveFloor,
                "committed_floor must be >= 0",
            ));
        }

        let body = serde_json::to_string(&CursorStateFile {
            version: STATE_VERSION,
            committed_floor,
        })
        .map_err(|e| StateError::new(StateErrorKind::SaveIo, e.to_string()))?;

        self.write_atomic(body.as_bytes())
            .map_err(|e| StateError::new(StateErrorKind::SaveIo, e.to_string()))
    }

    fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        let file_name = self.path.file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("state path has no file name: {}", self.path.display()),
            )
        })?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let written = fs::File::create(&tmp_path).and_then(|mut f| {
            f.write_all(bytes)?;
            f.sync_all()?;
            drop(f);
            fs::rename(&tmp_path, &self.path)
        });
        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written
    }
}

fn coerce_floor(raw: &serde_json::Value) -> Option<i64> {
    match raw {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
