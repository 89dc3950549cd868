//! Program blob persistence (§6.1's serialization layer): a compiled
//! program's bytecode is opaque here (the dispatcher body that
//! interprets it is a collaborator, not this crate's job), but the blob
//! itself — raw code bytes plus named entry offsets — is something this
//! substrate does own: it's what a `dispatch::ProgramRef` or a
//! `FunctionData::code_offset` ultimately resolves against, and what
//! gets written to/read from disk between compile and run.

use loom_core::InternId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramBlob {
    pub code: Vec<u8>,
    pub entry_points: HashMap<InternId, usize>,
}

#[derive(Debug)]
pub enum ProgramError {
    Encode(bincode::Error),
    NotFound(u32),
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramError::Encode(e) => write!(f, "program serialization failed: {e}"),
            ProgramError::NotFound(id) => write!(f, "program blob {id} not found"),
        }
    }
}

impl std::error::Error for ProgramError {}

impl From<bincode::Error> for ProgramError {
    fn from(e: bincode::Error) -> Self {
        ProgramError::Encode(e)
    }
}

impl ProgramBlob {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProgramError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Loaded programs, keyed by the same `u32` a `dispatch::ProgramRef` or
/// a call-site opcode carries. Append-only: programs are loaded once at
/// startup (or hot-reloaded by registering a fresh id), never mutated
/// in place, so readers never need more than a shared lock.
#[derive(Default)]
pub struct ProgramTable {
    blobs: RwLock<HashMap<u32, ProgramBlob>>,
    next_id: std::sync::atomic::AtomicU32,
}

impl ProgramTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, blob: ProgramBlob) -> u32 {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.blobs.write().expect("program table lock poisoned").insert(id, blob);
        id
    }

    pub fn get(&self, id: u32) -> Result<ProgramBlob, ProgramError> {
        self.blobs.read().expect("program table lock poisoned").get(&id).cloned().ok_or(ProgramError::NotFound(id))
    }
}
