//! End-to-end protocol tests: full handshakes and editor drives between two
//! real endpoints joined by an in-memory duplex transport.

use async_trait::async_trait;
use rasvn_core::auth::{Anonymous, AuthAcceptor, CramMd5};
use rasvn_core::editor::{CopySource, DriveOutcome, Editor, WireEditor, replay_drive};
use rasvn_core::session::{AcceptOptions, Capability, ConnectOptions, accept, connect};
use rasvn_core::{PipeWireStream, Result, WireError, WireStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn duplex_streams(capacity: usize) -> (Box<dyn WireStream>, Box<dyn WireStream>) {
    let (a, b) = tokio::io::duplex(capacity);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    (
        Box::new(PipeWireStream::new(Box::new(ar), Box::new(aw))),
        Box::new(PipeWireStream::new(Box::new(br), Box::new(bw))),
    )
}

fn accept_options(acceptor: AuthAcceptor) -> AcceptOptions {
    AcceptOptions {
        capabilities: vec![Capability::EditPipeline],
        acceptor,
        uuid: "deadbeef".to_string(),
        repos_root: "svn://host/repo".to_string(),
        compat: false,
    }
}

/// Editor that records one line per call.
#[derive(Default)]
struct RecordingEditor {
    calls: Vec<String>,
    fail_on: Option<String>,
    next_baton: u64,
}

impl RecordingEditor {
    fn record(&mut self, line: String) -> Result<()> {
        if self.fail_on.as_deref().is_some_and(|f| line.starts_with(f)) {
            return Err(WireError::RemoteOperation(
                rasvn_core::RemoteErrorChain::single(160006, format!("refused: {line}")),
            ));
        }
        self.calls.push(line);
        Ok(())
    }

    fn baton(&mut self) -> u64 {
        self.next_baton += 1;
        self.next_baton
    }
}

#[async_trait]
impl Editor for RecordingEditor {
    type Baton = u64;

    async fn target_revision(&mut self, rev: u64) -> Result<()> {
        self.record(format!("target-rev {rev}"))
    }

    async fn open_root(&mut self, base_rev: Option<u64>) -> Result<u64> {
        self.record(format!("open-root {base_rev:?}"))?;
        Ok(self.baton())
    }

    async fn delete_entry(&mut self, path: &str, rev: Option<u64>, _parent: &u64) -> Result<()> {
        self.record(format!("delete-entry {path} {rev:?}"))
    }

    async fn add_directory(
        &mut self,
        path: &str,
        _parent: &u64,
        _copy: Option<CopySource>,
    ) -> Result<u64> {
        self.record(format!("add-dir {path}"))?;
        Ok(self.baton())
    }

    async fn open_directory(
        &mut self,
        path: &str,
        _parent: &u64,
        base_rev: Option<u64>,
    ) -> Result<u64> {
        self.record(format!("open-dir {path} {base_rev:?}"))?;
        Ok(self.baton())
    }

    async fn change_dir_prop(
        &mut self,
        dir: &u64,
        name: &str,
        _value: Option<Vec<u8>>,
    ) -> Result<()> {
        self.record(format!("change-dir-prop {dir} {name}"))
    }

    async fn close_directory(&mut self, dir: u64) -> Result<()> {
        self.record(format!("close-dir {dir}"))
    }

    async fn absent_directory(&mut self, path: &str, _parent: &u64) -> Result<()> {
        self.record(format!("absent-dir {path}"))
    }

    async fn add_file(
        &mut self,
        path: &str,
        _parent: &u64,
        _copy: Option<CopySource>,
    ) -> Result<u64> {
        self.record(format!("add-file {path}"))?;
        Ok(self.baton())
    }

    async fn open_file(&mut self, path: &str, _parent: &u64, base_rev: Option<u64>) -> Result<u64> {
        self.record(format!("open-file {path} {base_rev:?}"))?;
        Ok(self.baton())
    }

    async fn apply_textdelta(&mut self, file: &u64, _base_checksum: Option<String>) -> Result<()> {
        self.record(format!("apply-textdelta {file}"))
    }

    async fn textdelta_chunk(&mut self, file: &u64, chunk: &[u8]) -> Result<()> {
        self.record(format!("textdelta-chunk {file} {}", chunk.len()))
    }

    async fn textdelta_end(&mut self, file: &u64) -> Result<()> {
        self.record(format!("textdelta-end {file}"))
    }

    async fn change_file_prop(
        &mut self,
        file: &u64,
        name: &str,
        _value: Option<Vec<u8>>,
    ) -> Result<()> {
        self.record(format!("change-file-prop {file} {name}"))
    }

    async fn close_file(&mut self, file: u64, _text_checksum: Option<String>) -> Result<()> {
        self.record(format!("close-file {file}"))
    }

    async fn absent_file(&mut self, path: &str, _parent: &u64) -> Result<()> {
        self.record(format!("absent-file {path}"))
    }

    async fn close_edit(&mut self) -> Result<()> {
        self.record("close-edit".to_string())
    }

    async fn abort_edit(&mut self) -> Result<()> {
        self.record("abort-edit".to_string())
    }
}

async fn serve_one_drive(
    stream: Box<dyn WireStream>,
    acceptor: AuthAcceptor,
    editor: &mut RecordingEditor,
) -> Result<DriveOutcome> {
    let (mut conn, _state) = accept(stream, accept_options(acceptor)).await?;
    replay_drive(&mut conn, editor, false).await
}

#[tokio::test]
async fn test_session_and_trivial_drive() {
    let (client_stream, server_stream) = duplex_streams(4096);
    let mut editor = RecordingEditor::default();

    let client = async {
        let options = ConnectOptions::new(vec![Box::new(Anonymous)]);
        let (conn, state) = connect(client_stream, options).await?;
        assert!(state.pipelined());
        let mut wire = WireEditor::new(conn, state.pipelined());
        let root = wire.open_root(None).await?;
        let file = wire.add_file("a.txt", &root, None).await?;
        wire.close_file(file, None).await?;
        wire.close_directory(root).await?;
        wire.close_edit().await?;
        Ok::<_, WireError>(())
    };
    let server = serve_one_drive(
        server_stream,
        AuthAcceptor::new("test").allow_anonymous(),
        &mut editor,
    );

    let (client, server) = tokio::join!(client, server);
    client.unwrap();
    assert_eq!(server.unwrap(), DriveOutcome::Completed);
    assert_eq!(
        editor.calls,
        vec![
            "open-root None",
            "add-file a.txt",
            "close-file 2",
            "close-dir 1",
            "close-edit",
        ]
    );
}

#[tokio::test]
async fn test_wire_bytes_of_greeting_and_anonymous_auth() {
    // One endpoint is a raw duplex half so the exact bytes on the wire can
    // be asserted against the protocol grammar.
    let (raw, server_side) = tokio::io::duplex(4096);
    let (sr, sw) = tokio::io::split(server_side);
    let server_stream: Box<dyn WireStream> =
        Box::new(PipeWireStream::new(Box::new(sr), Box::new(sw)));

    let server = async {
        let acceptor = AuthAcceptor::new("test").allow_anonymous();
        let (conn, state) = accept(server_stream, accept_options(acceptor)).await?;
        Ok::<_, WireError>((conn, state))
    };

    let client = async move {
        let (mut reader, mut writer) = tokio::io::split(raw);
        let mut read_exactly = async |expected: &str| {
            let mut buf = vec![0u8; expected.len()];
            reader.read_exact(&mut buf).await.unwrap();
            assert_eq!(std::str::from_utf8(&buf).unwrap(), expected);
        };

        read_exactly("( success ( 2 ( edit-pipeline ) ) ) ").await;
        writer.write_all(b"( 2 ( edit-pipeline ) ) ").await.unwrap();
        read_exactly("( mechanisms ( ANONYMOUS ) 4:test ) ").await;
        writer.write_all(b"ANONYMOUS ( ( ) ) ").await.unwrap();
        read_exactly("( success ( ) ) ").await;
        read_exactly("( success ( 8:deadbeef 15:svn://host/repo ) ) ").await;
    };

    let (server, ()) = tokio::join!(server, client);
    let (_conn, state) = server.unwrap();
    assert!(state.pipelined());
    assert_eq!(state.user, None);
}

#[tokio::test]
async fn test_abort_mid_drive() {
    let (client_stream, server_stream) = duplex_streams(4096);
    let mut editor = RecordingEditor::default();

    let client = async {
        let options = ConnectOptions::new(vec![Box::new(Anonymous)]);
        let (conn, state) = connect(client_stream, options).await?;
        let mut wire = WireEditor::new(conn, state.pipelined());
        let root = wire.open_root(Some(4)).await?;
        let dir = wire.add_directory("trunk", &root, None).await?;
        wire.close_directory(dir).await?;
        wire.abort_edit().await?;
        Ok::<_, WireError>(())
    };
    let server = serve_one_drive(
        server_stream,
        AuthAcceptor::new("test").allow_anonymous(),
        &mut editor,
    );

    let (client, server) = tokio::join!(client, server);
    client.unwrap();
    assert_eq!(server.unwrap(), DriveOutcome::Aborted);
    assert_eq!(editor.calls.last().map(String::as_str), Some("abort-edit"));
}

#[tokio::test]
async fn test_authenticated_pipelined_drive_under_backpressure() {
    // Tiny transport capacity plus a long drive: completion proves the
    // blocked-write handler interleaves ack draining with flushing.
    let (client_stream, server_stream) = duplex_streams(256);
    let mut editor = RecordingEditor::default();

    let client = async {
        let options = ConnectOptions::new(vec![Box::new(CramMd5::new("tim", "tanstaaftanstaaf"))]);
        let (conn, state) = connect(client_stream, options).await?;
        let mut wire = WireEditor::new(conn, state.pipelined());
        let root = wire.open_root(None).await?;
        let file = wire.add_file("blob.bin", &root, None).await?;
        wire.apply_textdelta(&file, None).await?;
        for _ in 0..40 {
            wire.textdelta_chunk(&file, &[0x5a; 300]).await?;
        }
        wire.textdelta_end(&file).await?;
        wire.close_file(file, None).await?;
        wire.close_directory(root).await?;
        wire.close_edit().await?;
        Ok::<_, WireError>(())
    };
    let server = serve_one_drive(
        server_stream,
        AuthAcceptor::new("test").with_user("tim", "tanstaaftanstaaf"),
        &mut editor,
    );

    let (client, server) = tokio::join!(client, server);
    client.unwrap();
    assert_eq!(server.unwrap(), DriveOutcome::Completed);
    assert_eq!(editor.calls.len(), 47);
}

#[tokio::test]
async fn test_remote_editor_failure_surfaces_with_chain() {
    let (client_stream, server_stream) = duplex_streams(4096);
    let mut editor = RecordingEditor {
        fail_on: Some("add-file".to_string()),
        ..Default::default()
    };

    async fn run(wire: &mut WireEditor) -> Result<()> {
        let root = wire.open_root(None).await?;
        let file = wire.add_file("a.txt", &root, None).await?;
        wire.close_file(file, None).await?;
        wire.close_directory(root).await?;
        wire.close_edit().await
    }

    let client = async {
        let options = ConnectOptions::new(vec![Box::new(Anonymous)]);
        let (conn, state) = connect(client_stream, options).await?;
        let mut wire = WireEditor::new(conn, state.pipelined());
        let result = run(&mut wire).await;
        if result.is_err() {
            wire.abort_edit().await?;
        }
        result
    };
    let server = serve_one_drive(
        server_stream,
        AuthAcceptor::new("test").allow_anonymous(),
        &mut editor,
    );

    let (client, server) = tokio::join!(client, server);
    match client.unwrap_err() {
        WireError::RemoteOperation(chain) => {
            let first = chain.iter().next().unwrap();
            assert_eq!(first.code, 160006);
            assert!(first.message.contains("refused: add-file"));
        }
        other => panic!("expected RemoteOperation, got {other:?}"),
    }
    assert!(server.is_err());
    assert_eq!(editor.calls.last().map(String::as_str), Some("abort-edit"));
}
