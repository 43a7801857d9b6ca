//! Connection handshake: greeting, version/capability exchange,
//! authentication, and the post-auth repository announcement.
//!
//! The server speaks first. A session is established in four steps:
//! greeting (server advertises version 2 and its capability words), the
//! client's version answer (or its deferral into the first auth message in
//! compat mode), the authentication exchange, and finally the server's
//! `( success ( uuid repos-root ) )` announcement.

use tracing::{debug, info};

use crate::auth::{self, AuthAcceptor, AuthOutcome, CompatHello, Mechanism};
use crate::conn::Connection;
use crate::error::{Result, WireError};
use crate::item::{self, Item, read_item, read_reply, want_list, write_item, write_success};
use crate::stream::WireStream;

/// The one protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u64 = 2;

/// A capability word exchanged during the greeting. Known words get a
/// variant; anything else is preserved as-is so that newer peers' words
/// survive a round trip through us.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    EditPipeline,
    SvnDiff1,
    AbsentEntries,
    CommitRevprops,
    Depth,
    MergeInfo,
    Other(String),
}

impl Capability {
    pub fn as_word(&self) -> &str {
        match self {
            Capability::EditPipeline => "edit-pipeline",
            Capability::SvnDiff1 => "svndiff1",
            Capability::AbsentEntries => "absent-entries",
            Capability::CommitRevprops => "commit-revprops",
            Capability::Depth => "depth",
            Capability::MergeInfo => "mergeinfo",
            Capability::Other(word) => word,
        }
    }

    pub fn from_word(word: &str) -> Capability {
        match word {
            "edit-pipeline" => Capability::EditPipeline,
            "svndiff1" => Capability::SvnDiff1,
            "absent-entries" => Capability::AbsentEntries,
            "commit-revprops" => Capability::CommitRevprops,
            "depth" => Capability::Depth,
            "mergeinfo" => Capability::MergeInfo,
            other => Capability::Other(other.to_string()),
        }
    }
}

/// Immutable record of what the handshake established.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub protocol_version: u64,
    pub is_tunneled: bool,
    pub user: Option<String>,
    pub realm_prefix: String,
    /// Capabilities both sides advertised.
    pub capabilities: Vec<Capability>,
}

impl SessionState {
    /// True when drives over this session may pipeline editor commands.
    pub fn pipelined(&self) -> bool {
        self.capabilities.contains(&Capability::EditPipeline)
    }
}

/// Client-side handshake parameters.
pub struct ConnectOptions {
    pub capabilities: Vec<Capability>,
    pub mechanisms: Vec<Box<dyn Mechanism>>,
    /// Fold the version answer into the first auth message.
    pub compat: bool,
    pub is_tunneled: bool,
}

impl ConnectOptions {
    pub fn new(mechanisms: Vec<Box<dyn Mechanism>>) -> Self {
        Self {
            capabilities: vec![Capability::EditPipeline],
            mechanisms,
            compat: false,
            is_tunneled: false,
        }
    }
}

/// Server-side handshake parameters.
pub struct AcceptOptions {
    pub capabilities: Vec<Capability>,
    pub acceptor: AuthAcceptor,
    pub uuid: String,
    pub repos_root: String,
    pub compat: bool,
}

fn capability_words(caps: &[Capability]) -> Vec<Item> {
    caps.iter().map(|c| Item::word(c.as_word())).collect()
}

fn parse_capability_words(items: &[Item]) -> Result<Vec<Capability>> {
    items
        .iter()
        .map(|item| {
            item.as_word().map(Capability::from_word).ok_or_else(|| {
                WireError::malformed(format!("capability word is a {}", item.kind()))
            })
        })
        .collect()
}

fn negotiated(ours: &[Capability], theirs: &[Capability]) -> Vec<Capability> {
    ours.iter()
        .filter(|cap| theirs.contains(cap))
        .cloned()
        .collect()
}

/// Runs the client half of the handshake over a fresh stream.
pub async fn connect(
    stream: Box<dyn WireStream>,
    options: ConnectOptions,
) -> Result<(Connection, SessionState)> {
    let mut conn = Connection::new(stream);

    let greeting = read_reply(&mut conn).await?;
    let version = item::want_u64(&greeting, 0, "greeting protocol version")?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::malformed(format!(
            "peer speaks protocol version {version}, not {PROTOCOL_VERSION}"
        )));
    }
    let server_caps = parse_capability_words(want_list(&greeting, 1, "greeting capabilities")?)?;
    debug!(?server_caps, "greeting received");

    // The peer's words ride along on the connection even when we do not
    // recognize them.
    conn.add_capabilities(server_caps.iter().map(|c| c.as_word().to_string()));

    let outcome: AuthOutcome = if options.compat {
        let hello = CompatHello {
            version: PROTOCOL_VERSION,
            capabilities: options
                .capabilities
                .iter()
                .map(|c| c.as_word().to_string())
                .collect(),
        };
        auth::negotiate_client(&mut conn, options.mechanisms, Some(&hello)).await?
    } else {
        let answer = Item::List(vec![
            Item::Number(PROTOCOL_VERSION),
            Item::List(capability_words(&options.capabilities)),
        ]);
        write_item(&mut conn, &answer).await?;
        conn.flush().await?;
        auth::negotiate_client(&mut conn, options.mechanisms, None).await?
    };

    let announce = read_reply(&mut conn).await?;
    let uuid = item::want_str(&announce, 0, "repository uuid")?.to_string();
    let repos_root = item::want_str(&announce, 1, "repository root")?.to_string();
    conn.set_uuid(&uuid);
    conn.set_repos_root(&repos_root);

    let state = SessionState {
        protocol_version: PROTOCOL_VERSION,
        is_tunneled: options.is_tunneled,
        user: outcome.user,
        realm_prefix: outcome.realm,
        capabilities: negotiated(&options.capabilities, &server_caps),
    };
    info!(uuid = %uuid, root = %repos_root, pipelined = state.pipelined(), "session established");
    Ok((conn, state))
}

/// Runs the server half of the handshake over a fresh stream.
pub async fn accept(
    stream: Box<dyn WireStream>,
    options: AcceptOptions,
) -> Result<(Connection, SessionState)> {
    let mut conn = Connection::new(stream);

    write_success(
        &mut conn,
        &[
            Item::Number(PROTOCOL_VERSION),
            Item::List(capability_words(&options.capabilities)),
        ],
    )
    .await?;
    conn.flush().await?;

    let client_caps = if options.compat {
        // The version answer arrives folded into the first auth message;
        // the acceptor records the words on the connection.
        None
    } else {
        let answer = read_item(&mut conn).await?;
        let parts = answer
            .as_list()
            .ok_or_else(|| WireError::malformed("version answer is not a tuple"))?;
        let version = item::want_u64(parts, 0, "client protocol version")?;
        if version != PROTOCOL_VERSION {
            return Err(WireError::malformed(format!(
                "client speaks protocol version {version}, not {PROTOCOL_VERSION}"
            )));
        }
        let caps = parse_capability_words(want_list(parts, 1, "client capabilities")?)?;
        conn.add_capabilities(caps.iter().map(|c| c.as_word().to_string()));
        Some(caps)
    };

    let outcome = options.acceptor.accept(&mut conn, options.compat).await?;

    write_success(
        &mut conn,
        &[Item::str(&options.uuid), Item::str(&options.repos_root)],
    )
    .await?;
    conn.flush().await?;
    conn.set_uuid(&options.uuid);
    conn.set_repos_root(&options.repos_root);

    let client_caps = match client_caps {
        Some(caps) => caps,
        None => conn
            .capabilities()
            .map(Capability::from_word)
            .collect::<Vec<_>>(),
    };
    let state = SessionState {
        protocol_version: PROTOCOL_VERSION,
        is_tunneled: false,
        user: outcome.user,
        realm_prefix: outcome.realm,
        capabilities: negotiated(&options.capabilities, &client_caps),
    };
    info!(user = ?state.user, pipelined = state.pipelined(), "session accepted");
    Ok((conn, state))
}
