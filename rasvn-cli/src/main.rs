//! RaSvn - svn-protocol command line client
//!
//! Connects to an svn-protocol server (directly or through a tunnel
//! command), authenticates, and commits a set of tree changes driven
//! through the remote editor.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use rasvn_core::auth::{Anonymous, CramMd5, Mechanism};
use rasvn_core::editor::{Editor, WireEditor};
use rasvn_core::item::{self, Item, write_command};
use rasvn_core::session::{ConnectOptions, connect};
use rasvn_core::{PipeWireStream, TcpWireStream, WireStream};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Size of one text chunk sent over the wire.
const CHUNK_SIZE: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "rasvn")]
#[command(version = "0.1.0")]
#[command(about = "svn-protocol client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Commit tree changes to a repository
    Commit {
        /// Repository URL (svn://host[:port]/path)
        url: String,

        /// Log message
        #[arg(short, long)]
        message: String,

        /// Username (enables CRAM-MD5)
        #[arg(short, long, requires = "password")]
        username: Option<String>,

        /// Password
        #[arg(short, long, requires = "username")]
        password: Option<String>,

        /// Add or replace a file: REPOS_PATH=LOCAL_FILE
        #[arg(long = "put", value_name = "REPOS_PATH=LOCAL_FILE")]
        puts: Vec<String>,

        /// Create a directory
        #[arg(long = "mkdir", value_name = "REPOS_PATH")]
        mkdirs: Vec<String>,

        /// Delete an entry
        #[arg(long = "delete", value_name = "REPOS_PATH")]
        deletes: Vec<String>,

        /// Tunnel command to reach the server (e.g. "ssh host svnserve -t")
        #[arg(long)]
        tunnel: Option<String>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Commit {
            url,
            message,
            username,
            password,
            puts,
            mkdirs,
            deletes,
            tunnel,
            debug,
        } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::WARN.into())
            };
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let rev = commit(CommitArgs {
                url,
                message,
                username,
                password,
                puts,
                mkdirs,
                deletes,
                tunnel,
            })
            .await?;
            println!("Committed revision {rev}.");
            Ok(())
        }
    }
}

struct CommitArgs {
    url: String,
    message: String,
    username: Option<String>,
    password: Option<String>,
    puts: Vec<String>,
    mkdirs: Vec<String>,
    deletes: Vec<String>,
    tunnel: Option<String>,
}

async fn commit(args: CommitArgs) -> Result<u64> {
    let (host, _path) = parse_url(&args.url)?;

    let is_tunneled = args.tunnel.is_some();
    let stream: Box<dyn WireStream> = match &args.tunnel {
        Some(command) => Box::new(spawn_tunnel(command)?),
        None => Box::new(
            TcpWireStream::connect(&host)
                .await
                .with_context(|| format!("cannot connect to {host}"))?,
        ),
    };

    let mechanisms: Vec<Box<dyn Mechanism>> = match (&args.username, &args.password) {
        (Some(user), Some(pass)) => vec![
            Box::new(CramMd5::new(user.clone(), pass.clone())),
            Box::new(Anonymous),
        ],
        _ => vec![Box::new(Anonymous)],
    };
    let mut options = ConnectOptions::new(mechanisms);
    options.is_tunneled = is_tunneled;

    let (mut conn, state) = connect(stream, options).await?;
    info!(
        root = conn.repos_root().unwrap_or_default(),
        pipelined = state.pipelined(),
        "connected"
    );

    write_command(&mut conn, "commit", &[Item::str(&args.message)]).await?;
    conn.flush().await?;
    item::read_reply(&mut conn).await.context("commit refused")?;

    let mut wire = WireEditor::new(conn, state.pipelined());
    if let Err(err) = drive_commit(&mut wire, &args).await {
        wire.abort_edit().await.ok();
        return Err(err);
    }

    let mut conn = wire.into_inner();
    let reply = item::read_reply(&mut conn).await.context("commit failed")?;
    let rev = item::want_u64(&reply, 0, "committed revision")?;
    Ok(rev)
}

async fn drive_commit(wire: &mut WireEditor, args: &CommitArgs) -> Result<()> {
    let root = wire.open_root(None).await?;

    for path in &args.deletes {
        debug!(path, "delete");
        wire.delete_entry(path, None, &root).await?;
    }
    for path in &args.mkdirs {
        debug!(path, "mkdir");
        let dir = wire.add_directory(path, &root, None).await?;
        wire.close_directory(dir).await?;
    }
    for put in &args.puts {
        let (repos_path, local) = put
            .split_once('=')
            .ok_or_else(|| anyhow!("--put wants REPOS_PATH=LOCAL_FILE, got '{put}'"))?;
        debug!(path = repos_path, local, "put");
        let contents = tokio::fs::read(local)
            .await
            .with_context(|| format!("cannot read {local}"))?;
        let file = wire.add_file(repos_path, &root, None).await?;
        wire.apply_textdelta(&file, None).await?;
        for chunk in contents.chunks(CHUNK_SIZE) {
            wire.textdelta_chunk(&file, chunk).await?;
        }
        wire.textdelta_end(&file).await?;
        wire.close_file(file, None).await?;
    }

    wire.close_directory(root).await?;
    wire.close_edit().await?;
    Ok(())
}

/// Splits `svn://host[:port]/path` into a dialable address and the
/// in-repository path. The default port is 3690.
fn parse_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("svn://")
        .ok_or_else(|| anyhow!("unsupported URL '{url}', expected svn://host[:port]/path"))?;
    let (host, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if host.is_empty() {
        bail!("URL '{url}' has no host");
    }
    let host = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:3690")
    };
    Ok((host, path.to_string()))
}

fn spawn_tunnel(command: &str) -> Result<PipeWireStream> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| anyhow!("empty tunnel command"))?;
    let mut child = tokio::process::Command::new(program)
        .args(parts)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("cannot spawn tunnel '{command}'"))?;
    let stream = PipeWireStream::from_child(&mut child)?;
    // The child lives as long as the process; its pipes closing ends the
    // session.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_forms() {
        assert_eq!(
            parse_url("svn://example.org/repo/trunk").unwrap(),
            ("example.org:3690".to_string(), "/repo/trunk".to_string())
        );
        assert_eq!(
            parse_url("svn://example.org:4000/repo").unwrap(),
            ("example.org:4000".to_string(), "/repo".to_string())
        );
        assert_eq!(
            parse_url("svn://example.org").unwrap(),
            ("example.org:3690".to_string(), "/".to_string())
        );
        assert!(parse_url("http://example.org/").is_err());
        assert!(parse_url("svn:///repo").is_err());
    }
}
