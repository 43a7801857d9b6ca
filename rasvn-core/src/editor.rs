//! Tree-delta editor protocol: the trait, the wire-driving side, and the
//! receiving side that replays a command stream into a local editor.
//!
//! A drive is an ordered walk of a tree: open or add a directory, change
//! things inside it, close it before its parent. Every operation crosses the
//! wire as one command and is acknowledged with a reply. In pipelined mode
//! the driver streams commands without waiting and reconciles the
//! acknowledgements strictly in send order; a blocked-write handler drains
//! whatever acks are already readable whenever a flush would block, which is
//! what keeps two mutually-writing peers out of a buffer deadlock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::conn::{BlockHandler, Connection};
use crate::error::{RemoteErrorChain, Result, WireError};
use crate::item::{
    self, Item, read_command, read_reply, want_list, want_str, write_command, write_failure,
    write_success,
};

/// Error code attached to failure replies generated for a local editor
/// error during a replayed drive.
const EDITOR_ERROR_CODE: u64 = 210004;

/// Copy-from provenance for added nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub path: String,
    pub rev: u64,
}

/// How a drive ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    Aborted,
}

/// Consumer of one tree-delta drive.
///
/// `Baton` is whatever per-node state the implementation needs; drivers
/// treat it as opaque. A baton handed out by `open_root`/`add_directory`/
/// `open_file` etc. is returned to `close_directory`/`close_file` when the
/// node is done, always before its parent closes.
#[async_trait]
pub trait Editor: Send {
    type Baton: Send;

    async fn target_revision(&mut self, rev: u64) -> Result<()>;
    async fn open_root(&mut self, base_rev: Option<u64>) -> Result<Self::Baton>;
    async fn delete_entry(
        &mut self,
        path: &str,
        rev: Option<u64>,
        parent: &Self::Baton,
    ) -> Result<()>;
    async fn add_directory(
        &mut self,
        path: &str,
        parent: &Self::Baton,
        copy: Option<CopySource>,
    ) -> Result<Self::Baton>;
    async fn open_directory(
        &mut self,
        path: &str,
        parent: &Self::Baton,
        base_rev: Option<u64>,
    ) -> Result<Self::Baton>;
    async fn change_dir_prop(
        &mut self,
        dir: &Self::Baton,
        name: &str,
        value: Option<Vec<u8>>,
    ) -> Result<()>;
    async fn close_directory(&mut self, dir: Self::Baton) -> Result<()>;
    async fn absent_directory(&mut self, path: &str, parent: &Self::Baton) -> Result<()>;
    async fn add_file(
        &mut self,
        path: &str,
        parent: &Self::Baton,
        copy: Option<CopySource>,
    ) -> Result<Self::Baton>;
    async fn open_file(
        &mut self,
        path: &str,
        parent: &Self::Baton,
        base_rev: Option<u64>,
    ) -> Result<Self::Baton>;
    async fn apply_textdelta(
        &mut self,
        file: &Self::Baton,
        base_checksum: Option<String>,
    ) -> Result<()>;
    async fn textdelta_chunk(&mut self, file: &Self::Baton, chunk: &[u8]) -> Result<()>;
    async fn textdelta_end(&mut self, file: &Self::Baton) -> Result<()>;
    async fn change_file_prop(
        &mut self,
        file: &Self::Baton,
        name: &str,
        value: Option<Vec<u8>>,
    ) -> Result<()>;
    async fn close_file(&mut self, file: Self::Baton, text_checksum: Option<String>) -> Result<()>;
    async fn absent_file(&mut self, path: &str, parent: &Self::Baton) -> Result<()>;
    async fn close_edit(&mut self) -> Result<()>;
    async fn abort_edit(&mut self) -> Result<()>;
}

/// Ack ledger shared between a pipelined drive and its blocked-write
/// handler. Locked only for bookkeeping, never across stream I/O.
struct DriveState {
    outstanding: usize,
    failure: Option<RemoteErrorChain>,
}

/// Drains acknowledgements that are already readable, without ever
/// blocking for more. Installed on the Connection for pipelined drives.
struct DrainAcks {
    state: Arc<Mutex<DriveState>>,
}

#[async_trait]
impl BlockHandler for DrainAcks {
    async fn on_write_blocked(&mut self, conn: &mut Connection) -> Result<()> {
        loop {
            if self.state.lock().await.outstanding == 0 {
                return Ok(());
            }
            if !conn.input_waiting() {
                return Ok(());
            }
            match read_reply(conn).await {
                Ok(_) => {
                    self.state.lock().await.outstanding -= 1;
                }
                Err(WireError::RemoteOperation(chain)) => {
                    let mut state = self.state.lock().await;
                    state.outstanding -= 1;
                    if state.failure.is_none() {
                        state.failure = Some(chain);
                    }
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }
}

/// Editor that forwards every operation to the remote peer as a wire
/// command, with generated directory/file tokens as batons.
pub struct WireEditor {
    conn: Connection,
    pipelined: bool,
    state: Arc<Mutex<DriveState>>,
    next_token: u64,
    finished: bool,
}

impl WireEditor {
    /// Wraps a connection for one drive. `pipelined` requires that both
    /// peers advertised `edit-pipeline` at connect time; the caller checks.
    pub fn new(conn: Connection, pipelined: bool) -> Self {
        let state = Arc::new(Mutex::new(DriveState {
            outstanding: 0,
            failure: None,
        }));
        let mut editor = Self {
            conn,
            pipelined,
            state: state.clone(),
            next_token: 0,
            finished: false,
        };
        if pipelined {
            editor.conn.set_block_handler(Box::new(DrainAcks { state }));
        }
        editor
    }

    /// Recovers the connection once the drive is over.
    pub fn into_inner(mut self) -> Connection {
        self.conn.clear_block_handler();
        self.conn
    }

    fn dir_token(&mut self) -> String {
        let t = format!("d{}", self.next_token);
        self.next_token += 1;
        t
    }

    fn file_token(&mut self) -> String {
        let t = format!("f{}", self.next_token);
        self.next_token += 1;
        t
    }

    /// Sends one editor command. Pipelined: stage it and account for its
    /// future ack. Non-pipelined: flush and wait for the ack here.
    async fn send(&mut self, name: &str, args: Vec<Item>) -> Result<()> {
        if let Some(chain) = self.take_failure().await {
            return Err(WireError::RemoteOperation(chain));
        }
        trace!(command = name, pipelined = self.pipelined, "editor command");
        write_command(&mut self.conn, name, &args).await?;
        if matches!(name, "close-edit" | "abort-edit") {
            self.finished = true;
        }
        if self.pipelined {
            self.state.lock().await.outstanding += 1;
            Ok(())
        } else {
            self.conn.flush().await?;
            read_reply(&mut self.conn).await?;
            Ok(())
        }
    }

    async fn take_failure(&mut self) -> Option<RemoteErrorChain> {
        self.state.lock().await.failure.take()
    }

    /// Blocks until every outstanding ack has been reconciled.
    async fn drain_all_acks(&mut self) -> Result<()> {
        loop {
            if self.state.lock().await.outstanding == 0 {
                break;
            }
            match read_reply(&mut self.conn).await {
                Ok(_) => {
                    self.state.lock().await.outstanding -= 1;
                }
                Err(WireError::RemoteOperation(chain)) => {
                    let mut state = self.state.lock().await;
                    state.outstanding -= 1;
                    if state.failure.is_none() {
                        state.failure = Some(chain);
                    }
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Ok(())
    }

    /// Flushes, reconciles every remaining ack, and uninstalls the drain
    /// handler. Any failure recorded during the drive surfaces here.
    async fn settle(&mut self) -> Result<()> {
        self.conn.flush().await?;
        if self.pipelined {
            self.drain_all_acks().await?;
            self.conn.clear_block_handler();
        }
        if let Some(chain) = self.take_failure().await {
            return Err(WireError::RemoteOperation(chain));
        }
        Ok(())
    }

    fn copy_arg(copy: Option<CopySource>) -> Item {
        match copy {
            Some(c) => Item::List(vec![Item::str(&c.path), Item::Number(c.rev)]),
            None => Item::List(Vec::new()),
        }
    }
}

#[async_trait]
impl Editor for WireEditor {
    type Baton = String;

    async fn target_revision(&mut self, rev: u64) -> Result<()> {
        self.send("target-rev", vec![Item::Number(rev)]).await
    }

    async fn open_root(&mut self, base_rev: Option<u64>) -> Result<String> {
        let token = self.dir_token();
        self.send(
            "open-root",
            vec![Item::opt(base_rev.map(Item::Number)), Item::str(&token)],
        )
        .await?;
        Ok(token)
    }

    async fn delete_entry(&mut self, path: &str, rev: Option<u64>, parent: &String) -> Result<()> {
        self.send(
            "delete-entry",
            vec![
                Item::str(path),
                Item::opt(rev.map(Item::Number)),
                Item::str(parent),
            ],
        )
        .await
    }

    async fn add_directory(
        &mut self,
        path: &str,
        parent: &String,
        copy: Option<CopySource>,
    ) -> Result<String> {
        let token = self.dir_token();
        self.send(
            "add-dir",
            vec![
                Item::str(path),
                Item::str(parent),
                Item::str(&token),
                Self::copy_arg(copy),
            ],
        )
        .await?;
        Ok(token)
    }

    async fn open_directory(
        &mut self,
        path: &str,
        parent: &String,
        base_rev: Option<u64>,
    ) -> Result<String> {
        let token = self.dir_token();
        self.send(
            "open-dir",
            vec![
                Item::str(path),
                Item::str(parent),
                Item::str(&token),
                Item::opt(base_rev.map(Item::Number)),
            ],
        )
        .await?;
        Ok(token)
    }

    async fn change_dir_prop(
        &mut self,
        dir: &String,
        name: &str,
        value: Option<Vec<u8>>,
    ) -> Result<()> {
        self.send(
            "change-dir-prop",
            vec![
                Item::str(dir),
                Item::str(name),
                Item::opt(value.map(Item::String)),
            ],
        )
        .await
    }

    async fn close_directory(&mut self, dir: String) -> Result<()> {
        self.send("close-dir", vec![Item::str(&dir)]).await
    }

    async fn absent_directory(&mut self, path: &str, parent: &String) -> Result<()> {
        self.send("absent-dir", vec![Item::str(path), Item::str(parent)])
            .await
    }

    async fn add_file(
        &mut self,
        path: &str,
        parent: &String,
        copy: Option<CopySource>,
    ) -> Result<String> {
        let token = self.file_token();
        self.send(
            "add-file",
            vec![
                Item::str(path),
                Item::str(parent),
                Item::str(&token),
                Self::copy_arg(copy),
            ],
        )
        .await?;
        Ok(token)
    }

    async fn open_file(
        &mut self,
        path: &str,
        parent: &String,
        base_rev: Option<u64>,
    ) -> Result<String> {
        let token = self.file_token();
        self.send(
            "open-file",
            vec![
                Item::str(path),
                Item::str(parent),
                Item::str(&token),
                Item::opt(base_rev.map(Item::Number)),
            ],
        )
        .await?;
        Ok(token)
    }

    async fn apply_textdelta(&mut self, file: &String, base_checksum: Option<String>) -> Result<()> {
        self.send(
            "apply-textdelta",
            vec![Item::str(file), Item::opt(base_checksum.map(Item::str))],
        )
        .await
    }

    async fn textdelta_chunk(&mut self, file: &String, chunk: &[u8]) -> Result<()> {
        self.send(
            "textdelta-chunk",
            vec![Item::str(file), Item::String(chunk.to_vec())],
        )
        .await
    }

    async fn textdelta_end(&mut self, file: &String) -> Result<()> {
        self.send("textdelta-end", vec![Item::str(file)]).await
    }

    async fn change_file_prop(
        &mut self,
        file: &String,
        name: &str,
        value: Option<Vec<u8>>,
    ) -> Result<()> {
        self.send(
            "change-file-prop",
            vec![
                Item::str(file),
                Item::str(name),
                Item::opt(value.map(Item::String)),
            ],
        )
        .await
    }

    async fn close_file(&mut self, file: String, text_checksum: Option<String>) -> Result<()> {
        self.send(
            "close-file",
            vec![Item::str(&file), Item::opt(text_checksum.map(Item::str))],
        )
        .await
    }

    async fn absent_file(&mut self, path: &str, parent: &String) -> Result<()> {
        self.send("absent-file", vec![Item::str(path), Item::str(parent)])
            .await
    }

    async fn close_edit(&mut self) -> Result<()> {
        self.send("close-edit", Vec::new()).await?;
        self.settle().await?;
        debug!(
            bytes_written = self.conn.bytes_written(),
            "edit drive completed"
        );
        Ok(())
    }

    async fn abort_edit(&mut self) -> Result<()> {
        // Once a terminator went out there is nothing left to abort.
        if self.finished {
            return Ok(());
        }
        // A clean, whole command: the peer must never see a truncated drive.
        self.send("abort-edit", Vec::new()).await?;
        self.settle().await?;
        debug!("edit drive aborted");
        Ok(())
    }
}

/// Per-drive token bookkeeping on the receiving side.
struct TokenTable<B> {
    dirs: HashMap<String, B>,
    files: HashMap<String, B>,
    parent_of: HashMap<String, String>,
    open_children: HashMap<String, usize>,
    delta_active: HashSet<String>,
}

impl<B> TokenTable<B> {
    fn new() -> Self {
        Self {
            dirs: HashMap::new(),
            files: HashMap::new(),
            parent_of: HashMap::new(),
            open_children: HashMap::new(),
            delta_active: HashSet::new(),
        }
    }

    fn dir(&self, token: &str) -> Result<&B> {
        self.dirs
            .get(token)
            .ok_or_else(|| WireError::malformed(format!("unknown directory token '{token}'")))
    }

    fn file(&self, token: &str) -> Result<&B> {
        self.files
            .get(token)
            .ok_or_else(|| WireError::malformed(format!("unknown file token '{token}'")))
    }

    fn insert_dir(&mut self, token: &str, parent: Option<&str>, baton: B) -> Result<()> {
        if self.dirs.contains_key(token) || self.files.contains_key(token) {
            return Err(WireError::malformed(format!("token '{token}' already open")));
        }
        if let Some(p) = parent {
            self.parent_of.insert(token.to_string(), p.to_string());
            *self.open_children.entry(p.to_string()).or_insert(0) += 1;
        }
        self.dirs.insert(token.to_string(), baton);
        self.open_children.entry(token.to_string()).or_insert(0);
        Ok(())
    }

    fn insert_file(&mut self, token: &str, parent: &str, baton: B) -> Result<()> {
        if self.dirs.contains_key(token) || self.files.contains_key(token) {
            return Err(WireError::malformed(format!("token '{token}' already open")));
        }
        self.parent_of
            .insert(token.to_string(), parent.to_string());
        *self.open_children.entry(parent.to_string()).or_insert(0) += 1;
        self.files.insert(token.to_string(), baton);
        Ok(())
    }

    fn remove_dir(&mut self, token: &str) -> Result<B> {
        if self.open_children.get(token).copied().unwrap_or(0) != 0 {
            return Err(WireError::malformed(format!(
                "directory '{token}' closed with open children"
            )));
        }
        let baton = self
            .dirs
            .remove(token)
            .ok_or_else(|| WireError::malformed(format!("unknown directory token '{token}'")))?;
        self.open_children.remove(token);
        self.close_in_parent(token);
        Ok(baton)
    }

    fn remove_file(&mut self, token: &str) -> Result<B> {
        if self.delta_active.contains(token) {
            return Err(WireError::malformed(format!(
                "file '{token}' closed with an unfinished text delta"
            )));
        }
        let baton = self
            .files
            .remove(token)
            .ok_or_else(|| WireError::malformed(format!("unknown file token '{token}'")))?;
        self.close_in_parent(token);
        Ok(baton)
    }

    fn close_in_parent(&mut self, token: &str) {
        if let Some(parent) = self.parent_of.remove(token) {
            if let Some(count) = self.open_children.get_mut(&parent) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn all_closed(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }
}

fn opt_copy(args: &[Item], idx: usize) -> Result<Option<CopySource>> {
    let inner = want_list(args, idx, "copy source")?;
    match inner {
        [] => Ok(None),
        [path, rev] => {
            let path = path
                .as_str()
                .ok_or_else(|| WireError::malformed("copy path is not a string"))?;
            let rev = rev
                .as_u64()
                .ok_or_else(|| WireError::malformed("copy revision is not a number"))?;
            Ok(Some(CopySource {
                path: path.to_string(),
                rev,
            }))
        }
        _ => Err(WireError::malformed("copy source with bad arity")),
    }
}

fn opt_string(args: &[Item], idx: usize, what: &str) -> Result<Option<String>> {
    Ok(item::opt_bytes(args, idx, what)?
        .map(|b| String::from_utf8_lossy(&b).into_owned()))
}

/// Replays an incoming editor command stream into `editor`, acknowledging
/// each command.
///
/// Structural rules are enforced before dispatch: every referenced token
/// must be open, text deltas bracket their chunks, directories close after
/// their children. A peer that breaks them gets `MalformedProtocol` and the
/// connection is dead.
///
/// With `for_replay` the stream may end in `finish-replay` and the
/// committing `close_edit` call is suppressed, so that historical change
/// streams can be regenerated without committing anything.
///
/// When the editor itself fails, the error is sent to the peer as a
/// well-formed failure reply, the rest of the drive is drained to its
/// terminator, and the editor's `abort_edit` runs before the error is
/// returned.
pub async fn replay_drive<E: Editor>(
    conn: &mut Connection,
    editor: &mut E,
    for_replay: bool,
) -> Result<DriveOutcome> {
    let mut tokens: TokenTable<E::Baton> = TokenTable::new();
    loop {
        // Push out staged acks before a read that may block.
        if !conn.input_waiting() {
            conn.flush().await?;
        }
        let (name, args) = read_command(conn).await?;
        trace!(command = %name, "replaying editor command");
        match name.as_str() {
            "close-edit" => {
                if !tokens.all_closed() {
                    return Err(WireError::malformed("close-edit with open batons"));
                }
                if !for_replay {
                    if let Err(err) = editor.close_edit().await {
                        return fail_drive(conn, editor, err, true).await;
                    }
                }
                write_success(conn, &[]).await?;
                conn.flush().await?;
                debug!(for_replay, "edit drive replay completed");
                return Ok(DriveOutcome::Completed);
            }
            "abort-edit" => {
                editor.abort_edit().await?;
                write_success(conn, &[]).await?;
                conn.flush().await?;
                debug!("edit drive replay aborted by peer");
                return Ok(DriveOutcome::Aborted);
            }
            "finish-replay" => {
                if !for_replay {
                    return Err(WireError::malformed(
                        "finish-replay outside a replay drive",
                    ));
                }
                write_success(conn, &[]).await?;
                conn.flush().await?;
                debug!("replay stream finished");
                return Ok(DriveOutcome::Completed);
            }
            _ => {}
        }
        if let Err(err) = apply_command(editor, &mut tokens, &name, &args).await {
            if err.is_fatal() {
                return Err(err);
            }
            return fail_drive(conn, editor, err, false).await;
        }
        write_success(conn, &[]).await?;
    }
}

/// Validates one command tuple and dispatches it to the editor.
async fn apply_command<E: Editor>(
    editor: &mut E,
    tokens: &mut TokenTable<E::Baton>,
    name: &str,
    args: &[Item],
) -> Result<()> {
    match name {
        "target-rev" => {
            let rev = item::want_u64(args, 0, "target revision")?;
            editor.target_revision(rev).await
        }
        "open-root" => {
            let base_rev = item::opt_u64(args, 0, "root base revision")?;
            let token = want_str(args, 1, "root token")?.to_string();
            let baton = editor.open_root(base_rev).await?;
            tokens.insert_dir(&token, None, baton)
        }
        "delete-entry" => {
            let path = want_str(args, 0, "deleted path")?;
            let rev = item::opt_u64(args, 1, "deleted revision")?;
            let parent = want_str(args, 2, "parent token")?;
            let parent_baton = tokens.dir(parent)?;
            editor.delete_entry(path, rev, parent_baton).await
        }
        "add-dir" => {
            let path = want_str(args, 0, "added directory path")?;
            let parent = want_str(args, 1, "parent token")?.to_string();
            let token = want_str(args, 2, "directory token")?.to_string();
            let copy = opt_copy(args, 3)?;
            let baton = {
                let parent_baton = tokens.dir(&parent)?;
                editor.add_directory(path, parent_baton, copy).await?
            };
            tokens.insert_dir(&token, Some(&parent), baton)
        }
        "open-dir" => {
            let path = want_str(args, 0, "opened directory path")?;
            let parent = want_str(args, 1, "parent token")?.to_string();
            let token = want_str(args, 2, "directory token")?.to_string();
            let base_rev = item::opt_u64(args, 3, "directory base revision")?;
            let baton = {
                let parent_baton = tokens.dir(&parent)?;
                editor.open_directory(path, parent_baton, base_rev).await?
            };
            tokens.insert_dir(&token, Some(&parent), baton)
        }
        "change-dir-prop" => {
            let token = want_str(args, 0, "directory token")?;
            let prop = want_str(args, 1, "property name")?;
            let value = item::opt_bytes(args, 2, "property value")?;
            let baton = tokens.dir(token)?;
            editor.change_dir_prop(baton, prop, value).await
        }
        "close-dir" => {
            let token = want_str(args, 0, "directory token")?;
            let baton = tokens.remove_dir(token)?;
            editor.close_directory(baton).await
        }
        "absent-dir" => {
            let path = want_str(args, 0, "absent directory path")?;
            let parent = want_str(args, 1, "parent token")?;
            let baton = tokens.dir(parent)?;
            editor.absent_directory(path, baton).await
        }
        "add-file" => {
            let path = want_str(args, 0, "added file path")?;
            let parent = want_str(args, 1, "parent token")?.to_string();
            let token = want_str(args, 2, "file token")?.to_string();
            let copy = opt_copy(args, 3)?;
            let baton = {
                let parent_baton = tokens.dir(&parent)?;
                editor.add_file(path, parent_baton, copy).await?
            };
            tokens.insert_file(&token, &parent, baton)
        }
        "open-file" => {
            let path = want_str(args, 0, "opened file path")?;
            let parent = want_str(args, 1, "parent token")?.to_string();
            let token = want_str(args, 2, "file token")?.to_string();
            let base_rev = item::opt_u64(args, 3, "file base revision")?;
            let baton = {
                let parent_baton = tokens.dir(&parent)?;
                editor.open_file(path, parent_baton, base_rev).await?
            };
            tokens.insert_file(&token, &parent, baton)
        }
        "apply-textdelta" => {
            let token = want_str(args, 0, "file token")?;
            let base_checksum = opt_string(args, 1, "base checksum")?;
            if !tokens.delta_active.insert(token.to_string()) {
                return Err(WireError::malformed(format!(
                    "file '{token}' already has an open text delta"
                )));
            }
            let baton = tokens.file(token)?;
            editor.apply_textdelta(baton, base_checksum).await
        }
        "textdelta-chunk" => {
            let token = want_str(args, 0, "file token")?;
            let chunk = item::want_bytes(args, 1, "delta chunk")?;
            if !tokens.delta_active.contains(token) {
                return Err(WireError::malformed(format!(
                    "delta chunk for file '{token}' outside apply-textdelta"
                )));
            }
            let baton = tokens.file(token)?;
            editor.textdelta_chunk(baton, chunk).await
        }
        "textdelta-end" => {
            let token = want_str(args, 0, "file token")?;
            if !tokens.delta_active.remove(token) {
                return Err(WireError::malformed(format!(
                    "textdelta-end for file '{token}' without apply-textdelta"
                )));
            }
            let baton = tokens.file(token)?;
            editor.textdelta_end(baton).await
        }
        "change-file-prop" => {
            let token = want_str(args, 0, "file token")?;
            let prop = want_str(args, 1, "property name")?;
            let value = item::opt_bytes(args, 2, "property value")?;
            let baton = tokens.file(token)?;
            editor.change_file_prop(baton, prop, value).await
        }
        "close-file" => {
            let token = want_str(args, 0, "file token")?;
            let checksum = opt_string(args, 1, "text checksum")?;
            let baton = tokens.remove_file(token)?;
            editor.close_file(baton, checksum).await
        }
        "absent-file" => {
            let path = want_str(args, 0, "absent file path")?;
            let parent = want_str(args, 1, "parent token")?;
            let baton = tokens.dir(parent)?;
            editor.absent_file(path, baton).await
        }
        other => Err(WireError::malformed(format!(
            "unknown editor command '{other}'"
        ))),
    }
}

/// Reports a local editor failure to the peer and winds the drive down.
async fn fail_drive<E: Editor>(
    conn: &mut Connection,
    editor: &mut E,
    err: WireError,
    already_terminated: bool,
) -> Result<DriveOutcome> {
    let chain = match &err {
        WireError::RemoteOperation(chain) => chain.clone(),
        other => RemoteErrorChain::single(EDITOR_ERROR_CODE, other.to_string()),
    };
    write_failure(conn, &chain).await?;
    conn.flush().await?;
    if !already_terminated {
        drain_to_terminator(conn).await?;
        editor.abort_edit().await?;
    }
    debug!("edit drive replay failed");
    Err(err)
}

/// Consumes commands up to the drive terminator without dispatching them.
/// Every drained command is still acknowledged so that a pipelined driver
/// sees exactly one reply per command and can reconcile its ledger.
async fn drain_to_terminator(conn: &mut Connection) -> Result<()> {
    loop {
        if !conn.input_waiting() {
            conn.flush().await?;
        }
        let (name, _args) = read_command(conn).await?;
        write_success(conn, &[]).await?;
        if matches!(name.as_str(), "close-edit" | "abort-edit" | "finish-replay") {
            conn.flush().await?;
            return Ok(());
        }
    }
}
