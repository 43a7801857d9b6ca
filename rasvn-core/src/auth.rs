//! Authentication negotiation for protocol connections.
//!
//! Runs once per connection, before any repository operation. The server
//! announces a mechanism list and realm; the client picks by its own
//! preference order and the chosen mechanism's challenge/response exchange
//! runs to a terminal success or failure. Built-in mechanisms: CRAM-MD5,
//! ANONYMOUS and EXTERNAL. Library-backed (SASL-class) mechanisms plug in
//! through the same [`Mechanism`] trait and may hand back a security layer
//! that wraps the connection's stream for its remaining lifetime.

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use md5::Md5;
use tracing::debug;
use uuid::Uuid;

use crate::conn::Connection;
use crate::error::{Result, WireError};
use crate::item::{
    self, Item, read_command, read_item, want_list, want_str, want_word, write_item,
};
use crate::stream::WireStream;

type HmacMd5 = Hmac<Md5>;

/// Negotiation progress, one run per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationState {
    Start,
    MechanismListReceived,
    ChallengeSent,
    ResponsePending,
    Authenticated,
    Rejected,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    /// Mechanism that won.
    pub mechanism: String,
    /// Authenticated user, when the mechanism establishes one.
    pub user: Option<String>,
    /// Realm the exchange ran under.
    pub realm: String,
}

/// Transport wrapper negotiated by a mechanism (e.g. a SASL security
/// layer). Applied once, stays active for the connection's life.
pub trait SecurityLayer: Send {
    fn wrap(self: Box<Self>, stream: Box<dyn WireStream>) -> Box<dyn WireStream>;
}

/// One named authentication method with its own challenge/response exchange.
#[async_trait]
pub trait Mechanism: Send {
    fn name(&self) -> &str;

    /// Response piggy-backed on the mechanism selection, if the mechanism
    /// has one (saves a round trip).
    fn initial_response(&mut self) -> Option<Vec<u8>>;

    /// Answers one server challenge.
    async fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Identity this mechanism authenticates as, when it claims one. Read
    /// after terminal success to fill the outcome's `user`.
    fn user(&self) -> Option<String> {
        None
    }

    /// Called after terminal success; a library-backed mechanism may return
    /// a transport wrapper here.
    fn security_layer(&mut self) -> Option<Box<dyn SecurityLayer>> {
        None
    }

    /// True for mechanisms delegated to an external library, which require
    /// [`sasl::init`] to have run.
    fn requires_library(&self) -> bool {
        false
    }
}

/// Computes the RFC 2195 response digest: lowercase hex HMAC-MD5 of the
/// challenge keyed by the shared secret.
pub fn cram_md5_digest(secret: &[u8], challenge: &[u8]) -> Result<String> {
    let mut mac = HmacMd5::new_from_slice(secret)
        .map_err(|_| WireError::AuthFailed("CRAM-MD5 secret rejected by HMAC".into()))?;
    mac.update(challenge);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// CRAM-MD5 client half.
pub struct CramMd5 {
    username: String,
    password: String,
}

impl CramMd5 {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl Mechanism for CramMd5 {
    fn name(&self) -> &str {
        "CRAM-MD5"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        None
    }

    async fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let digest = cram_md5_digest(self.password.as_bytes(), challenge)?;
        Ok(format!("{} {}", self.username, digest).into_bytes())
    }

    fn user(&self) -> Option<String> {
        Some(self.username.clone())
    }
}

/// Trivial anonymous exchange.
pub struct Anonymous;

#[async_trait]
impl Mechanism for Anonymous {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        None
    }

    async fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(WireError::malformed("ANONYMOUS mechanism received a challenge"))
    }
}

/// EXTERNAL: identity established out of band (e.g. a tunnel login).
pub struct External {
    authzid: String,
}

impl External {
    pub fn new(authzid: impl Into<String>) -> Self {
        Self {
            authzid: authzid.into(),
        }
    }
}

#[async_trait]
impl Mechanism for External {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        Some(self.authzid.clone().into_bytes())
    }

    async fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(WireError::malformed("EXTERNAL mechanism received a challenge"))
    }

    fn user(&self) -> Option<String> {
        // Empty authzid means the tunnel-established identity, which only
        // the server side knows.
        (!self.authzid.is_empty()).then(|| self.authzid.clone())
    }
}

/// Server's mechanism announcement: `( mechanisms ( name... ) realm )`.
#[derive(Debug, Clone)]
pub struct AuthAnnouncement {
    pub mechanisms: Vec<String>,
    pub realm: String,
}

pub async fn read_announcement(conn: &mut Connection) -> Result<AuthAnnouncement> {
    let item = read_item(conn).await?;
    let parts = item
        .as_list()
        .ok_or_else(|| WireError::malformed("auth announcement is not a tuple"))?;
    let tag = want_word(parts, 0, "auth announcement tag")?;
    if tag != "mechanisms" {
        return Err(WireError::malformed(format!(
            "expected mechanisms announcement, found '{tag}'"
        )));
    }
    let mechanisms = want_list(parts, 1, "mechanism list")?
        .iter()
        .map(|m| {
            m.as_word().map(str::to_string).ok_or_else(|| {
                WireError::malformed(format!("mechanism name is a {}", m.kind()))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let realm = want_str(parts, 2, "auth realm")?.to_string();
    Ok(AuthAnnouncement { mechanisms, realm })
}

pub async fn write_announcement(conn: &mut Connection, announcement: &AuthAnnouncement) -> Result<()> {
    let mechs = announcement
        .mechanisms
        .iter()
        .map(Item::word)
        .collect::<Vec<_>>();
    let item = Item::List(vec![
        Item::word("mechanisms"),
        Item::List(mechs),
        Item::str(&announcement.realm),
    ]);
    write_item(conn, &item).await?;
    conn.flush().await
}

/// Version-handshake material folded into the first auth message in legacy
/// compatibility mode, saving a round trip.
#[derive(Debug, Clone)]
pub struct CompatHello {
    pub version: u64,
    pub capabilities: Vec<String>,
}

/// Runs the client half of the negotiation.
///
/// `mechanisms` is the client's own preference order; the first one the
/// server also offers is used. With `compat`, the protocol version and
/// capability list are prefixed to the first auth message.
pub async fn negotiate_client(
    conn: &mut Connection,
    mechanisms: Vec<Box<dyn Mechanism>>,
    compat: Option<&CompatHello>,
) -> Result<AuthOutcome> {
    if mechanisms.iter().any(|m| m.requires_library()) && !sasl::is_initialized() {
        return Err(WireError::AuthFailed(
            "library-backed mechanism offered before sasl::init".into(),
        ));
    }

    let mut state = NegotiationState::Start;
    debug!(?state, "starting auth negotiation");
    let announcement = read_announcement(conn).await?;
    state = NegotiationState::MechanismListReceived;
    debug!(?state, realm = %announcement.realm, offered = ?announcement.mechanisms, "auth mechanisms received");

    let mut mech = mechanisms
        .into_iter()
        .find(|m| announcement.mechanisms.iter().any(|name| name == m.name()))
        .ok_or_else(|| {
            WireError::AuthFailed(format!(
                "no common mechanism (server offers {})",
                announcement.mechanisms.join(", ")
            ))
        })?;

    let initial = mech
        .initial_response()
        .map(|bytes| Item::String(bytes));
    match compat {
        Some(hello) => {
            let caps = hello.capabilities.iter().map(Item::word).collect();
            let msg = Item::List(vec![
                Item::Number(hello.version),
                Item::List(caps),
                Item::word(mech.name()),
                Item::opt(initial),
            ]);
            write_item(conn, &msg).await?;
        }
        None => {
            item::write_command(conn, mech.name(), &[Item::opt(initial)]).await?;
        }
    }
    conn.flush().await?;
    state = NegotiationState::ResponsePending;
    debug!(?state, mechanism = mech.name(), "mechanism selected");

    loop {
        let msg = read_item(conn).await?;
        let parts = msg
            .as_list()
            .ok_or_else(|| WireError::malformed("auth message is not a tuple"))?;
        match want_word(parts, 0, "auth message tag")? {
            "step" => {
                let args = want_list(parts, 1, "auth step arguments")?;
                let challenge = item::want_bytes(args, 0, "auth challenge")?;
                state = NegotiationState::ChallengeSent;
                debug!(?state, bytes = challenge.len(), "challenge received");
                let response = mech.respond(challenge).await?;
                write_item(conn, &Item::String(response)).await?;
                conn.flush().await?;
                state = NegotiationState::ResponsePending;
                debug!(?state, "response sent");
            }
            "success" => {
                state = NegotiationState::Authenticated;
                debug!(mechanism = mech.name(), ?state, "authenticated");
                if let Some(layer) = mech.security_layer() {
                    conn.wrap_stream(|stream| layer.wrap(stream));
                }
                return Ok(AuthOutcome {
                    mechanism: mech.name().to_string(),
                    user: mech.user(),
                    realm: announcement.realm.clone(),
                });
            }
            "failure" => {
                state = NegotiationState::Rejected;
                let args = want_list(parts, 1, "auth failure arguments")?;
                let message = args
                    .first()
                    .and_then(|m| m.as_str())
                    .unwrap_or("rejected by server");
                debug!(mechanism = mech.name(), ?state, "authentication rejected");
                return Err(WireError::AuthFailed(message.to_string()));
            }
            other => {
                return Err(WireError::malformed(format!(
                    "unexpected auth message '{other}'"
                )));
            }
        }
    }
}

/// First client auth message as seen by the server.
#[derive(Debug)]
pub struct ClientAuthRequest {
    pub mechanism: String,
    pub initial: Option<Vec<u8>>,
    /// Present only in compat mode.
    pub hello: Option<CompatHello>,
}

/// Server half of the negotiation.
///
/// Announces the configured mechanisms and realm, then runs the selected
/// mechanism's exchange against the credential table.
pub struct AuthAcceptor {
    realm: String,
    allow_anonymous: bool,
    tunnel_user: Option<String>,
    users: HashMap<String, String>,
}

impl AuthAcceptor {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            allow_anonymous: false,
            tunnel_user: None,
            users: HashMap::new(),
        }
    }

    pub fn allow_anonymous(mut self) -> Self {
        self.allow_anonymous = true;
        self
    }

    /// Accept EXTERNAL for a user already established by the tunnel.
    pub fn with_tunnel_user(mut self, user: impl Into<String>) -> Self {
        self.tunnel_user = Some(user.into());
        self
    }

    /// Registers a CRAM-MD5 shared secret.
    pub fn with_user(mut self, user: impl Into<String>, secret: impl Into<String>) -> Self {
        self.users.insert(user.into(), secret.into());
        self
    }

    fn mechanisms(&self) -> Vec<String> {
        let mut mechs = Vec::new();
        if !self.users.is_empty() {
            mechs.push("CRAM-MD5".to_string());
        }
        if self.tunnel_user.is_some() {
            mechs.push("EXTERNAL".to_string());
        }
        if self.allow_anonymous {
            mechs.push("ANONYMOUS".to_string());
        }
        mechs
    }

    /// Announces mechanisms and runs one exchange to a terminal outcome.
    ///
    /// With `compat`, the client's first message also carries its protocol
    /// version and capability list; those land in the returned request's
    /// `hello` and the capabilities are recorded on the connection.
    pub async fn accept(&self, conn: &mut Connection, compat: bool) -> Result<AuthOutcome> {
        let announcement = AuthAnnouncement {
            mechanisms: self.mechanisms(),
            realm: self.realm.clone(),
        };
        write_announcement(conn, &announcement).await?;

        let request = self.read_client_request(conn, compat).await?;
        if let Some(hello) = &request.hello {
            conn.add_capabilities(hello.capabilities.iter().cloned());
        }

        match request.mechanism.as_str() {
            "ANONYMOUS" if self.allow_anonymous => {
                self.finish_success(conn).await?;
                Ok(AuthOutcome {
                    mechanism: request.mechanism,
                    user: None,
                    realm: self.realm.clone(),
                })
            }
            "EXTERNAL" if self.tunnel_user.is_some() => {
                let tunnel_user = self.tunnel_user.clone().unwrap_or_default();
                // An empty authzid means "whoever the tunnel says I am".
                let claimed = request
                    .initial
                    .as_deref()
                    .filter(|b| !b.is_empty())
                    .map(|b| String::from_utf8_lossy(b).into_owned());
                if claimed.as_deref().is_some_and(|c| c != tunnel_user) {
                    return self.finish_failure(conn, "mismatched tunnel user").await;
                }
                self.finish_success(conn).await?;
                Ok(AuthOutcome {
                    mechanism: request.mechanism,
                    user: Some(tunnel_user),
                    realm: self.realm.clone(),
                })
            }
            "CRAM-MD5" if !self.users.is_empty() => {
                let user = self.run_cram_md5(conn).await?;
                Ok(AuthOutcome {
                    mechanism: request.mechanism,
                    user: Some(user),
                    realm: self.realm.clone(),
                })
            }
            other => {
                self.finish_failure(conn, &format!("mechanism '{other}' not offered"))
                    .await
            }
        }
    }

    async fn read_client_request(
        &self,
        conn: &mut Connection,
        compat: bool,
    ) -> Result<ClientAuthRequest> {
        if compat {
            let msg = read_item(conn).await?;
            let parts = msg
                .as_list()
                .ok_or_else(|| WireError::malformed("compat auth request is not a tuple"))?;
            let version = item::want_u64(parts, 0, "compat protocol version")?;
            let capabilities = want_list(parts, 1, "compat capability list")?
                .iter()
                .map(|c| {
                    c.as_word().map(str::to_string).ok_or_else(|| {
                        WireError::malformed(format!("capability is a {}", c.kind()))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let mechanism = want_word(parts, 2, "selected mechanism")?.to_string();
            let initial = item::opt_bytes(parts, 3, "initial auth response")?;
            Ok(ClientAuthRequest {
                mechanism,
                initial,
                hello: Some(CompatHello {
                    version,
                    capabilities,
                }),
            })
        } else {
            let (mechanism, args) = read_command(conn).await?;
            let initial = match args.len() {
                0 => None,
                _ => item::opt_bytes(&args, 0, "initial auth response")?,
            };
            Ok(ClientAuthRequest {
                mechanism,
                initial,
                hello: None,
            })
        }
    }

    async fn run_cram_md5(&self, conn: &mut Connection) -> Result<String> {
        let challenge = format!("<{}@{}>", Uuid::new_v4(), self.realm);
        let step = Item::List(vec![
            Item::word("step"),
            Item::List(vec![Item::str(&challenge)]),
        ]);
        write_item(conn, &step).await?;
        conn.flush().await?;

        let response = read_item(conn).await?;
        let text = response
            .as_str()
            .ok_or_else(|| WireError::malformed("CRAM-MD5 response is not a string"))?;
        let Some((user, digest)) = text.rsplit_once(' ') else {
            return Err(WireError::malformed("CRAM-MD5 response missing digest"));
        };

        let Some(secret) = self.users.get(user) else {
            return self.finish_failure(conn, "unknown user").await;
        };
        let expected = cram_md5_digest(secret.as_bytes(), challenge.as_bytes())?;
        if digest != expected {
            return self.finish_failure(conn, "incorrect credentials").await;
        }

        self.finish_success(conn).await?;
        Ok(user.to_string())
    }

    async fn finish_success(&self, conn: &mut Connection) -> Result<()> {
        let msg = Item::List(vec![Item::word("success"), Item::List(Vec::new())]);
        write_item(conn, &msg).await?;
        conn.flush().await
    }

    async fn finish_failure<T>(&self, conn: &mut Connection, reason: &str) -> Result<T> {
        let msg = Item::List(vec![
            Item::word("failure"),
            Item::List(vec![Item::str(reason)]),
        ]);
        write_item(conn, &msg).await?;
        conn.flush().await?;
        Err(WireError::AuthFailed(reason.to_string()))
    }
}

/// Process-wide setup for library-backed (SASL-class) mechanisms.
///
/// The process entry point calls [`init`] once before constructing any
/// negotiator that offers a library-backed mechanism, and [`shutdown`] at
/// exit. There is deliberately no implicit first-use initialization.
pub mod sasl {
    use std::sync::atomic::{AtomicBool, Ordering};

    static INITIALIZED: AtomicBool = AtomicBool::new(false);

    pub fn init() {
        INITIALIZED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown() {
        INITIALIZED.store(false, Ordering::SeqCst);
    }

    pub fn is_initialized() -> bool {
        INITIALIZED.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::test_util::duplex_conn_pair;

    #[test]
    fn test_cram_md5_rfc2195_vector() {
        let digest = cram_md5_digest(
            b"tanstaaftanstaaf",
            b"<1896.697170952@postoffice.reston.mci.net>",
        )
        .unwrap();
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[tokio::test]
    async fn test_cram_md5_response_format() {
        let mut mech = CramMd5::new("tim", "tanstaaftanstaaf");
        let response = mech
            .respond(b"<1896.697170952@postoffice.reston.mci.net>")
            .await
            .unwrap();
        assert_eq!(
            response,
            b"tim b913a602c7eda7a495b4e6e7334d3890".to_vec()
        );
    }

    #[tokio::test]
    async fn test_anonymous_negotiation() {
        let (mut client, mut server) = duplex_conn_pair(4096);
        let acceptor = AuthAcceptor::new("test realm").allow_anonymous();

        let (client_result, server_result) = tokio::join!(
            negotiate_client(&mut client, vec![Box::new(Anonymous)], None),
            acceptor.accept(&mut server, false),
        );
        assert_eq!(client_result.unwrap().mechanism, "ANONYMOUS");
        let accepted = server_result.unwrap();
        assert_eq!(accepted.mechanism, "ANONYMOUS");
        assert_eq!(accepted.user, None);
    }

    #[tokio::test]
    async fn test_cram_md5_negotiation_success() {
        let (mut client, mut server) = duplex_conn_pair(4096);
        let acceptor = AuthAcceptor::new("example.org").with_user("tim", "tanstaaftanstaaf");

        let mechs: Vec<Box<dyn Mechanism>> = vec![
            Box::new(CramMd5::new("tim", "tanstaaftanstaaf")),
            Box::new(Anonymous),
        ];
        let (client_result, server_result) = tokio::join!(
            negotiate_client(&mut client, mechs, None),
            acceptor.accept(&mut server, false),
        );
        let outcome = client_result.unwrap();
        assert_eq!(outcome.mechanism, "CRAM-MD5");
        // Both halves know who authenticated.
        assert_eq!(outcome.user.as_deref(), Some("tim"));
        assert_eq!(server_result.unwrap().user.as_deref(), Some("tim"));
    }

    #[tokio::test]
    async fn test_cram_md5_wrong_secret_rejected() {
        let (mut client, mut server) = duplex_conn_pair(4096);
        let acceptor = AuthAcceptor::new("example.org").with_user("tim", "tanstaaftanstaaf");

        let mechs: Vec<Box<dyn Mechanism>> = vec![Box::new(CramMd5::new("tim", "wrong"))];
        let (client_result, server_result) = tokio::join!(
            negotiate_client(&mut client, mechs, None),
            acceptor.accept(&mut server, false),
        );
        assert!(matches!(client_result, Err(WireError::AuthFailed(_))));
        assert!(matches!(server_result, Err(WireError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_client_prefers_its_own_order() {
        // Server lists ANONYMOUS first, but the client's first preference
        // (CRAM-MD5) is also offered and must win.
        let (mut client, mut server) = duplex_conn_pair(4096);
        let acceptor = AuthAcceptor::new("r")
            .allow_anonymous()
            .with_user("alice", "secret");

        let mechs: Vec<Box<dyn Mechanism>> = vec![
            Box::new(CramMd5::new("alice", "secret")),
            Box::new(Anonymous),
        ];
        let (client_result, _server_result) = tokio::join!(
            negotiate_client(&mut client, mechs, None),
            acceptor.accept(&mut server, false),
        );
        assert_eq!(client_result.unwrap().mechanism, "CRAM-MD5");
    }

    #[tokio::test]
    async fn test_no_common_mechanism() {
        // The client gives up without sending anything, so only the
        // announcement half of the server runs here.
        let (mut client, mut server) = duplex_conn_pair(4096);
        let announcement = AuthAnnouncement {
            mechanisms: vec!["CRAM-MD5".to_string()],
            realm: "r".to_string(),
        };

        let (client_result, server_result) = tokio::join!(
            negotiate_client(&mut client, vec![Box::new(Anonymous)], None),
            write_announcement(&mut server, &announcement),
        );
        server_result.unwrap();
        assert!(matches!(client_result, Err(WireError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_compat_hello_folds_capabilities() {
        let (mut client, mut server) = duplex_conn_pair(4096);
        let acceptor = AuthAcceptor::new("r").allow_anonymous();
        let hello = CompatHello {
            version: 2,
            capabilities: vec!["edit-pipeline".to_string()],
        };

        let (client_result, server_result) = tokio::join!(
            negotiate_client(&mut client, vec![Box::new(Anonymous)], Some(&hello)),
            acceptor.accept(&mut server, true),
        );
        client_result.unwrap();
        server_result.unwrap();
        assert!(server.has_capability("edit-pipeline"));
    }

    /// Transport wrapper that masks every byte with a fixed key. Trivial,
    /// but it exercises the real wrapping path: if either side forgot to
    /// apply the layer, the other would read garbage and fail decoding.
    struct MaskedStream {
        inner: Box<dyn WireStream>,
        key: u8,
    }

    #[async_trait]
    impl WireStream for MaskedStream {
        async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.inner.read(buf).await?;
            for b in &mut buf[..n] {
                *b ^= self.key;
            }
            Ok(n)
        }

        async fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let masked: Vec<u8> = buf.iter().map(|b| b ^ self.key).collect();
            self.inner.write(&masked).await
        }

        fn set_timeout(&mut self, timeout: Option<std::time::Duration>) {
            self.inner.set_timeout(timeout);
        }

        fn has_pending(&mut self) -> bool {
            self.inner.has_pending()
        }
    }

    struct MaskedLayer {
        key: u8,
    }

    impl SecurityLayer for MaskedLayer {
        fn wrap(self: Box<Self>, stream: Box<dyn WireStream>) -> Box<dyn WireStream> {
            Box::new(MaskedStream {
                inner: stream,
                key: self.key,
            })
        }
    }

    struct MaskedMech;

    #[async_trait]
    impl Mechanism for MaskedMech {
        fn name(&self) -> &str {
            "X-MASKED"
        }

        fn initial_response(&mut self) -> Option<Vec<u8>> {
            None
        }

        async fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
            Err(WireError::malformed("X-MASKED mechanism received a challenge"))
        }

        fn security_layer(&mut self) -> Option<Box<dyn SecurityLayer>> {
            Some(Box::new(MaskedLayer { key: 0x5a }))
        }
    }

    #[tokio::test]
    async fn test_security_layer_wraps_post_auth_traffic() {
        let (mut client, mut server) = duplex_conn_pair(4096);

        let server_task = async {
            let announcement = AuthAnnouncement {
                mechanisms: vec!["X-MASKED".to_string()],
                realm: "r".to_string(),
            };
            write_announcement(&mut server, &announcement).await?;
            let (mechanism, _args) = read_command(&mut server).await?;
            assert_eq!(mechanism, "X-MASKED");
            let success = Item::List(vec![Item::word("success"), Item::List(Vec::new())]);
            write_item(&mut server, &success).await?;
            server.flush().await?;

            // Mirror the layer the mechanism negotiated, then echo one item
            // through it in each direction.
            server.wrap_stream(|stream| {
                Box::new(MaskedStream {
                    inner: stream,
                    key: 0x5a,
                })
            });
            let echoed = read_item(&mut server).await?;
            write_item(&mut server, &echoed).await?;
            server.flush().await
        };
        let client_task = async {
            let outcome =
                negotiate_client(&mut client, vec![Box::new(MaskedMech)], None).await?;
            assert_eq!(outcome.mechanism, "X-MASKED");
            write_item(&mut client, &Item::str("under the layer")).await?;
            client.flush().await?;
            read_item(&mut client).await
        };

        let (server_result, client_result) = tokio::join!(server_task, client_task);
        server_result.unwrap();
        assert_eq!(client_result.unwrap(), Item::str("under the layer"));
    }
}
