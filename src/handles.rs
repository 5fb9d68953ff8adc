//! The handle table: numbered stream endpoints with ordered teardown.
//!
//! Every stream the model can touch is a numbered handle. 0, 1 and 2 are the
//! session's stdin/stdout/stderr; ids from [`FIRST_DYNAMIC_FD`] up are
//! allocated by `open` and `spawn` and destroyed by `close`. The table is an
//! arena: handles and command tasks reference each other only by id, so the
//! cyclic handle-to-task relationship never shows up as a cyclic ownership
//! problem — the dispatcher walks ids and joins tasks at close time.
//!
//! # Dependency edges
//!
//! A write handle lists as *dependents* the read handles that consume its
//! bytes (the model-facing output of a spawned pipeline depends on the
//! model-facing input). A write handle must not be torn down before its
//! dependents; [`HandleTable::close_order`] produces the dependent-first
//! sequence the dispatcher follows, which is what keeps teardown free of
//! pipeline deadlocks.

use std::collections::HashMap;

use crate::pipeline::TaskId;
use crate::stream::{ByteReader, ByteWriter};
use crate::{Error, Result};

/// The session's standard input.
pub const FD_STDIN: u32 = 0;
/// The session's standard output.
pub const FD_STDOUT: u32 = 1;
/// The session's standard error.
pub const FD_STDERR: u32 = 2;
/// First id handed out by [`HandleTable::allocate`].
pub const FIRST_DYNAMIC_FD: u32 = 3;

/// What a handle's endpoints are backed by. Carried as metadata for the FD
/// map and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// One of the session's inherited standard streams.
    Stdio,
    /// A gated real file.
    RealFile,
    /// A named in-memory virtual file.
    VirtualFile,
    /// One end of an anonymous pipe.
    PipeEnd,
    /// A stream wired to a spawned pipeline's stdin or stdout.
    CommandStdio,
}

/// One entry of the table.
pub struct Handle {
    /// Numeric id, unique among live handles.
    pub id: u32,
    /// Backing kind.
    pub kind: HandleKind,
    /// Human label used in the FD map and diagnostics.
    pub label: String,
    /// Read endpoint, if this handle is readable.
    reader: Option<ByteReader>,
    /// Write endpoint, if this handle is writable.
    writer: Option<ByteWriter>,
    /// Read handles that consume this handle's bytes; closed first.
    pub dependents: Vec<u32>,
    /// Backing command task; joined when this handle closes.
    pub task: Option<TaskId>,
}

impl Handle {
    /// Whether the handle still owns a read endpoint.
    pub fn is_readable(&self) -> bool {
        self.reader.is_some()
    }

    /// Whether the handle still owns a write endpoint.
    pub fn is_writable(&self) -> bool {
        self.writer.is_some()
    }

    /// The write endpoint, surrendered for teardown.
    pub fn into_parts(self) -> (Option<ByteReader>, Option<ByteWriter>, Option<TaskId>) {
        (self.reader, self.writer, self.task)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("dependents", &self.dependents)
            .field("task", &self.task)
            .finish()
    }
}

/// Arena of live handles.
pub struct HandleTable {
    handles: HashMap<u32, Handle>,
    next_id: u32,
}

impl HandleTable {
    /// Builds the table with the three standard streams installed.
    pub fn new(stdin: ByteReader, stdout: ByteWriter, stderr: ByteWriter) -> Self {
        let mut handles = HashMap::new();
        handles.insert(
            FD_STDIN,
            Handle {
                id: FD_STDIN,
                kind: HandleKind::Stdio,
                label: "stdin".to_string(),
                reader: Some(stdin),
                writer: None,
                dependents: Vec::new(),
                task: None,
            },
        );
        handles.insert(
            FD_STDOUT,
            Handle {
                id: FD_STDOUT,
                kind: HandleKind::Stdio,
                label: "stdout".to_string(),
                reader: None,
                writer: Some(stdout),
                dependents: Vec::new(),
                task: None,
            },
        );
        handles.insert(
            FD_STDERR,
            Handle {
                id: FD_STDERR,
                kind: HandleKind::Stdio,
                label: "stderr".to_string(),
                reader: None,
                writer: Some(stderr),
                dependents: Vec::new(),
                task: None,
            },
        );
        Self {
            handles,
            next_id: FIRST_DYNAMIC_FD,
        }
    }

    /// Allocates a handle with the given endpoints. Ids are monotonically
    /// assigned and never reused within a session.
    pub fn allocate(
        &mut self,
        kind: HandleKind,
        label: impl Into<String>,
        reader: Option<ByteReader>,
        writer: Option<ByteWriter>,
    ) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(
            id,
            Handle {
                id,
                kind,
                label: label.into(),
                reader,
                writer,
                dependents: Vec::new(),
                task: None,
            },
        );
        id
    }

    /// Looks up a live handle.
    pub fn get(&self, id: u32) -> Result<&Handle> {
        self.handles
            .get(&id)
            .ok_or_else(|| Error::tool("invalid file descriptor"))
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut Handle> {
        self.handles
            .get_mut(&id)
            .ok_or_else(|| Error::tool("invalid file descriptor"))
    }

    /// Whether `id` names a live handle.
    pub fn contains(&self, id: u32) -> bool {
        self.handles.contains_key(&id)
    }

    /// All live ids, dynamic handles first (used for session teardown).
    pub fn live_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.handles.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }

    /// The read endpoint of `id`, shared.
    pub fn reader(&self, id: u32) -> Result<ByteReader> {
        let handle = self.get(id)?;
        handle
            .reader
            .clone()
            .ok_or_else(|| Error::tool("not a readable handle"))
    }

    /// The write endpoint of `id`, shared.
    pub fn writer(&self, id: u32) -> Result<ByteWriter> {
        let handle = self.get(id)?;
        handle
            .writer
            .clone()
            .ok_or_else(|| Error::tool("not a writable handle"))
    }

    /// Takes the read endpoint out of `id`, donating it to a pipeline.
    /// Further `read` calls on `id` report "not a readable handle".
    pub fn take_reader(&mut self, id: u32) -> Result<ByteReader> {
        let handle = self.get_mut(id)?;
        handle
            .reader
            .take()
            .ok_or_else(|| Error::tool("not a readable handle"))
    }

    /// Takes the write endpoint out of `id`, donating it to a pipeline.
    pub fn take_writer(&mut self, id: u32) -> Result<ByteWriter> {
        let handle = self.get_mut(id)?;
        handle
            .writer
            .take()
            .ok_or_else(|| Error::tool("not a writable handle"))
    }

    /// Records that `reader_id` consumes bytes produced through `writer_id`.
    pub fn add_dependent(&mut self, writer_id: u32, reader_id: u32) -> Result<()> {
        let handle = self.get_mut(writer_id)?;
        if !handle.dependents.contains(&reader_id) {
            handle.dependents.push(reader_id);
        }
        Ok(())
    }

    /// Links `id` to the command task whose exit code `close` should report.
    pub fn set_task(&mut self, id: u32, task: TaskId) -> Result<()> {
        self.get_mut(id)?.task = Some(task);
        Ok(())
    }

    /// The dependent-first close sequence for `id`, ending with `id` itself.
    ///
    /// Dependents of dependents are walked recursively; ids appearing twice
    /// are closed once. Stale edges to already-closed handles are skipped.
    pub fn close_order(&self, id: u32) -> Result<Vec<u32>> {
        self.get(id)?;
        let mut order = Vec::new();
        self.walk_dependents(id, &mut order);
        Ok(order)
    }

    fn walk_dependents(&self, id: u32, order: &mut Vec<u32>) {
        if order.contains(&id) {
            return;
        }
        if let Some(handle) = self.handles.get(&id) {
            for dep in handle.dependents.clone() {
                self.walk_dependents(dep, order);
            }
            order.push(id);
        }
    }

    /// The live write handles whose dependents include `id`: the handles
    /// feeding bytes toward it. Joining `id`'s task is only safe after
    /// these have seen EOF.
    pub fn feeders_of(&self, id: u32) -> Vec<u32> {
        self.handles
            .values()
            .filter(|h| h.dependents.contains(&id))
            .map(|h| h.id)
            .collect()
    }

    /// Detaches a handle from the table. The caller owns the teardown:
    /// sending EOF on the write side and joining the backing task.
    pub fn remove(&mut self, id: u32) -> Result<Handle> {
        self.handles
            .remove(&id)
            .ok_or_else(|| Error::tool("invalid file descriptor"))
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.handles.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}
