//! Self-describing wire item codec.
//!
//! Everything on the wire is an item: numbers, binary-safe strings, bare
//! words, and nested lists. Tuples share the list syntax; tuple-ness is a
//! positional interpretation that call sites validate with the accessor
//! helpers below. The codec is a pure transform over the connection's
//! buffers.
//!
//! Wire grammar (every item ends in a single space):
//!
//! ```text
//! number: 1234␣
//! string: 6:foobar␣          (length prefix is authoritative, no escaping)
//! word:   edit-pipeline␣
//! list:   (␣item...␣)␣
//! ```

use crate::conn::Connection;
use crate::error::{RemoteError, RemoteErrorChain, Result, WireError};

/// Deepest list nesting accepted from a peer.
const MAX_NESTING_DEPTH: usize = 64;
/// Largest single string payload accepted from a peer (256 MB).
const MAX_STRING_LEN: u64 = 256 * 1024 * 1024;

/// A tagged protocol value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Number(u64),
    String(Vec<u8>),
    Word(String),
    List(Vec<Item>),
}

impl Item {
    /// String item from UTF-8 text.
    pub fn str(s: impl AsRef<str>) -> Item {
        Item::String(s.as_ref().as_bytes().to_vec())
    }

    pub fn word(w: impl Into<String>) -> Item {
        Item::Word(w.into())
    }

    /// Booleans travel as the words `true` / `false`.
    pub fn from_bool(b: bool) -> Item {
        Item::Word(if b { "true" } else { "false" }.to_string())
    }

    /// Optional values travel as a zero- or one-element list.
    pub fn opt(value: Option<Item>) -> Item {
        Item::List(value.into_iter().collect())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Item::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Item::String(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Item::String(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_word(&self) -> Option<&str> {
        match self {
            Item::Word(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.as_word() {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Item::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Item>> {
        match self {
            Item::List(items) => Some(items),
            _ => None,
        }
    }

    /// Kind name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Item::Number(_) => "number",
            Item::String(_) => "string",
            Item::Word(_) => "word",
            Item::List(_) => "list",
        }
    }
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic()
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

/// Encodes one item into the connection's write buffer (no flush).
///
/// List traversal is iterative; an explicit stack of child iterators stands
/// in for recursion so arbitrarily deep values never grow the call stack.
pub async fn write_item(conn: &mut Connection, item: &Item) -> Result<()> {
    let mut open: Vec<std::slice::Iter<'_, Item>> = Vec::new();
    let mut next = item;
    'item: loop {
        match next {
            Item::Number(n) => {
                conn.write_raw(format!("{} ", n).as_bytes()).await?;
            }
            Item::String(bytes) => {
                conn.write_raw(format!("{}:", bytes.len()).as_bytes()).await?;
                conn.write_raw(bytes).await?;
                conn.write_raw(b" ").await?;
            }
            Item::Word(word) => {
                conn.write_raw(word.as_bytes()).await?;
                conn.write_raw(b" ").await?;
            }
            Item::List(items) => {
                conn.write_raw(b"( ").await?;
                open.push(items.iter());
            }
        }
        loop {
            let Some(children) = open.last_mut() else {
                return Ok(());
            };
            match children.next() {
                Some(child) => {
                    next = child;
                    continue 'item;
                }
                None => {
                    open.pop();
                    conn.write_raw(b") ").await?;
                }
            }
        }
    }
}

/// Decodes one item. Truncated input fails as `MalformedProtocol`; a string's
/// length prefix is authoritative and exactly that many bytes are consumed.
pub async fn read_item(conn: &mut Connection) -> Result<Item> {
    let first = conn.read_byte().await?;
    read_item_with(conn, first).await
}

/// Decodes one item whose first byte has already been consumed. Lists are
/// assembled on an explicit stack of partially built vectors, bounded by
/// `MAX_NESTING_DEPTH`, so peer-controlled nesting cannot exhaust the call
/// stack.
async fn read_item_with(conn: &mut Connection, first: u8) -> Result<Item> {
    let mut open: Vec<Vec<Item>> = Vec::new();
    let mut next = first;
    loop {
        let complete = if next.is_ascii_digit() {
            Some(read_number_or_string(conn, next).await?)
        } else if is_word_start(next) {
            Some(read_word(conn, next).await?)
        } else if next == b'(' {
            if open.len() >= MAX_NESTING_DEPTH {
                return Err(WireError::malformed("item nesting too deep"));
            }
            expect_space(conn).await?;
            open.push(Vec::new());
            None
        } else if next == b')' {
            match open.pop() {
                Some(items) => {
                    expect_space(conn).await?;
                    Some(Item::List(items))
                }
                None => {
                    return Err(WireError::malformed(
                        "unexpected byte 0x29 at item start",
                    ));
                }
            }
        } else {
            return Err(WireError::malformed(format!(
                "unexpected byte 0x{next:02x} at item start"
            )));
        };
        if let Some(item) = complete {
            match open.last_mut() {
                Some(parent) => parent.push(item),
                None => return Ok(item),
            }
        }
        next = conn.read_byte().await?;
    }
}

async fn read_number_or_string(conn: &mut Connection, first: u8) -> Result<Item> {
    let mut value: u64 = (first - b'0') as u64;
    loop {
        let b = conn.read_byte().await?;
        if b.is_ascii_digit() {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as u64))
                .ok_or_else(|| WireError::malformed("number exceeds 64 bits"))?;
        } else if b == b' ' {
            return Ok(Item::Number(value));
        } else if b == b':' {
            if value > MAX_STRING_LEN {
                return Err(WireError::malformed(format!(
                    "string length {value} exceeds limit"
                )));
            }
            let bytes = conn.read_exact(value as usize).await?;
            expect_space(conn).await?;
            return Ok(Item::String(bytes));
        } else {
            return Err(WireError::malformed(format!(
                "unexpected byte 0x{b:02x} after digits"
            )));
        }
    }
}

async fn read_word(conn: &mut Connection, first: u8) -> Result<Item> {
    let mut word = String::new();
    word.push(first as char);
    loop {
        let b = conn.read_byte().await?;
        if is_word_byte(b) {
            word.push(b as char);
        } else if b == b' ' {
            return Ok(Item::Word(word));
        } else {
            return Err(WireError::malformed(format!(
                "unexpected byte 0x{b:02x} in word"
            )));
        }
    }
}

async fn expect_space(conn: &mut Connection) -> Result<()> {
    let b = conn.read_byte().await?;
    if b != b' ' {
        return Err(WireError::malformed(format!(
            "expected item delimiter, found 0x{b:02x}"
        )));
    }
    Ok(())
}

/// Writes `name ( args... ) ` into the buffer. The caller decides when to
/// flush: immediately for request/response traffic, lazily when pipelining.
pub async fn write_command(conn: &mut Connection, name: &str, args: &[Item]) -> Result<()> {
    write_item(conn, &Item::word(name)).await?;
    write_item(conn, &Item::List(args.to_vec())).await?;
    Ok(())
}

/// Reads a `word ( args... )` command pair.
pub async fn read_command(conn: &mut Connection) -> Result<(String, Vec<Item>)> {
    let name = match read_item(conn).await? {
        Item::Word(w) => w,
        other => {
            return Err(WireError::malformed(format!(
                "expected command word, found {}",
                other.kind()
            )));
        }
    };
    let args = match read_item(conn).await? {
        Item::List(items) => items,
        other => {
            return Err(WireError::malformed(format!(
                "expected argument tuple for '{}', found {}",
                name,
                other.kind()
            )));
        }
    };
    Ok((name, args))
}

/// Writes a `( success ( args... ) ) ` reply into the buffer.
pub async fn write_success(conn: &mut Connection, args: &[Item]) -> Result<()> {
    let reply = Item::List(vec![Item::word("success"), Item::List(args.to_vec())]);
    write_item(conn, &reply).await
}

/// Writes a `( failure ( ( code message file line )... ) ) ` reply.
pub async fn write_failure(conn: &mut Connection, chain: &RemoteErrorChain) -> Result<()> {
    let records = chain
        .iter()
        .map(|err| {
            Item::List(vec![
                Item::Number(err.code),
                Item::str(&err.message),
                Item::str(&err.file),
                Item::Number(err.line),
            ])
        })
        .collect();
    let reply = Item::List(vec![Item::word("failure"), Item::List(records)]);
    write_item(conn, &reply).await
}

/// Reads a reply tuple. A `success` reply yields its argument items; a
/// `failure` reply becomes `WireError::RemoteOperation` carrying the peer's
/// error chain in original order. The connection stays usable after a
/// failure reply.
pub async fn read_reply(conn: &mut Connection) -> Result<Vec<Item>> {
    let item = read_item(conn).await?;
    let parts = item
        .as_list()
        .ok_or_else(|| WireError::malformed("reply is not a tuple"))?;
    let status = want_word(parts, 0, "reply status")?;
    let args = want_list(parts, 1, "reply arguments")?;
    match status {
        "success" => Ok(args.to_vec()),
        "failure" => Err(WireError::RemoteOperation(parse_error_chain(args)?)),
        other => Err(WireError::malformed(format!(
            "expected success or failure, found '{other}'"
        ))),
    }
}

fn parse_error_chain(records: &[Item]) -> Result<RemoteErrorChain> {
    if records.is_empty() {
        return Err(WireError::malformed("failure reply with empty error list"));
    }
    let mut chain = Vec::with_capacity(records.len());
    for record in records {
        let fields = record
            .as_list()
            .ok_or_else(|| WireError::malformed("error record is not a tuple"))?;
        if fields.len() != 4 {
            return Err(WireError::malformed(format!(
                "error record has arity {}, expected 4",
                fields.len()
            )));
        }
        chain.push(RemoteError {
            code: want_u64(fields, 0, "error code")?,
            message: want_str(fields, 1, "error message")?.to_string(),
            file: want_str(fields, 2, "error file")?.to_string(),
            line: want_u64(fields, 3, "error line")?,
        });
    }
    Ok(RemoteErrorChain(chain))
}

// --- tuple accessors ---------------------------------------------------
//
// Tuples are lists with positional semantics fixed by the command; these
// validate arity and element kind in one step.

pub fn want<'a>(items: &'a [Item], idx: usize, what: &str) -> Result<&'a Item> {
    items.get(idx).ok_or_else(|| {
        WireError::malformed(format!("missing {what} (tuple arity {})", items.len()))
    })
}

pub fn want_u64(items: &[Item], idx: usize, what: &str) -> Result<u64> {
    let item = want(items, idx, what)?;
    item.as_u64()
        .ok_or_else(|| WireError::malformed(format!("{what}: expected number, found {}", item.kind())))
}

pub fn want_bytes<'a>(items: &'a [Item], idx: usize, what: &str) -> Result<&'a [u8]> {
    let item = want(items, idx, what)?;
    item.as_bytes()
        .ok_or_else(|| WireError::malformed(format!("{what}: expected string, found {}", item.kind())))
}

pub fn want_str<'a>(items: &'a [Item], idx: usize, what: &str) -> Result<&'a str> {
    let item = want(items, idx, what)?;
    item.as_str()
        .ok_or_else(|| WireError::malformed(format!("{what}: expected UTF-8 string, found {}", item.kind())))
}

pub fn want_word<'a>(items: &'a [Item], idx: usize, what: &str) -> Result<&'a str> {
    let item = want(items, idx, what)?;
    item.as_word()
        .ok_or_else(|| WireError::malformed(format!("{what}: expected word, found {}", item.kind())))
}

pub fn want_list<'a>(items: &'a [Item], idx: usize, what: &str) -> Result<&'a [Item]> {
    let item = want(items, idx, what)?;
    item.as_list()
        .ok_or_else(|| WireError::malformed(format!("{what}: expected list, found {}", item.kind())))
}

/// Optional number encoded as `( )` / `( n )`.
pub fn opt_u64(items: &[Item], idx: usize, what: &str) -> Result<Option<u64>> {
    let inner = want_list(items, idx, what)?;
    match inner {
        [] => Ok(None),
        [item] => item.as_u64().map(Some).ok_or_else(|| {
            WireError::malformed(format!("{what}: expected optional number, found {}", item.kind()))
        }),
        _ => Err(WireError::malformed(format!(
            "{what}: optional value with arity {}",
            inner.len()
        ))),
    }
}

/// Optional string encoded as `( )` / `( s )`.
pub fn opt_bytes(items: &[Item], idx: usize, what: &str) -> Result<Option<Vec<u8>>> {
    let inner = want_list(items, idx, what)?;
    match inner {
        [] => Ok(None),
        [item] => item.as_bytes().map(|b| Some(b.to_vec())).ok_or_else(|| {
            WireError::malformed(format!("{what}: expected optional string, found {}", item.kind()))
        }),
        _ => Err(WireError::malformed(format!(
            "{what}: optional value with arity {}",
            inner.len()
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::{loopback_conn, seeded_conn};
    use super::*;
    use proptest::prelude::*;

    async fn roundtrip(item: &Item) -> Item {
        let mut conn = loopback_conn();
        write_item(&mut conn, item).await.unwrap();
        conn.flush().await.unwrap();
        read_item(&mut conn).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_basics() {
        for item in [
            Item::Number(0),
            Item::Number(u64::MAX),
            Item::String(Vec::new()),
            Item::String(b"binary \x00\xff bytes".to_vec()),
            Item::word("edit-pipeline"),
            Item::List(Vec::new()),
            Item::List(vec![
                Item::word("success"),
                Item::List(vec![Item::Number(2), Item::List(vec![Item::word("edit-pipeline")])]),
            ]),
        ] {
            assert_eq!(roundtrip(&item).await, item);
        }
    }

    #[tokio::test]
    async fn test_number_and_word_stay_distinct_from_string() {
        // "5 hello " is a number then a word, never the string "hello".
        let mut conn = seeded_conn(b"5 hello ");
        assert_eq!(read_item(&mut conn).await.unwrap(), Item::Number(5));
        assert_eq!(read_item(&mut conn).await.unwrap(), Item::word("hello"));
    }

    #[tokio::test]
    async fn test_truncated_string_is_malformed_not_blocking() {
        // Length prefix promises 10 bytes, stream ends after 3.
        let mut conn = seeded_conn(b"10:abc");
        let err = read_item(&mut conn).await.unwrap_err();
        assert!(matches!(err, WireError::MalformedProtocol(_)));
    }

    #[tokio::test]
    async fn test_number_overflow_is_malformed() {
        let mut conn = seeded_conn(b"18446744073709551616 ");
        let err = read_item(&mut conn).await.unwrap_err();
        assert!(matches!(err, WireError::MalformedProtocol(_)));
    }

    #[tokio::test]
    async fn test_unterminated_list_is_malformed() {
        let mut conn = seeded_conn(b"( 1 2 ");
        let err = read_item(&mut conn).await.unwrap_err();
        assert!(matches!(err, WireError::MalformedProtocol(_)));
    }

    #[tokio::test]
    async fn test_nesting_depth_is_bounded() {
        let mut wire = Vec::new();
        for _ in 0..80 {
            wire.extend_from_slice(b"( ");
        }
        let mut conn = seeded_conn(&wire);
        let err = read_item(&mut conn).await.unwrap_err();
        assert!(matches!(err, WireError::MalformedProtocol(_)));
    }

    #[tokio::test]
    async fn test_nesting_at_depth_limit_decodes() {
        // Exactly MAX_NESTING_DEPTH nested lists is still legal input.
        let mut wire = Vec::new();
        for _ in 0..64 {
            wire.extend_from_slice(b"( ");
        }
        for _ in 0..64 {
            wire.extend_from_slice(b") ");
        }
        let mut expected = Item::List(Vec::new());
        for _ in 0..63 {
            expected = Item::List(vec![expected]);
        }
        let mut conn = seeded_conn(&wire);
        assert_eq!(read_item(&mut conn).await.unwrap(), expected);
        // And the encoder handles the same depth.
        assert_eq!(roundtrip(&expected).await, expected);
    }

    #[tokio::test]
    async fn test_command_roundtrip() {
        let mut conn = loopback_conn();
        write_command(&mut conn, "open-root", &[Item::opt(Some(Item::Number(7)))])
            .await
            .unwrap();
        conn.flush().await.unwrap();
        let (name, args) = read_command(&mut conn).await.unwrap();
        assert_eq!(name, "open-root");
        assert_eq!(args, vec![Item::List(vec![Item::Number(7)])]);
    }

    #[tokio::test]
    async fn test_failure_reply_preserves_chain_order() {
        let chain = RemoteErrorChain(vec![
            RemoteError {
                code: 1,
                message: "outer".into(),
                file: "a.rs".into(),
                line: 10,
            },
            RemoteError {
                code: 2,
                message: "inner".into(),
                file: "b.rs".into(),
                line: 20,
            },
        ]);
        let mut conn = loopback_conn();
        write_failure(&mut conn, &chain).await.unwrap();
        conn.flush().await.unwrap();
        match read_reply(&mut conn).await.unwrap_err() {
            WireError::RemoteOperation(decoded) => assert_eq!(decoded, chain),
            other => panic!("expected RemoteOperation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_reply_yields_args() {
        let mut conn = loopback_conn();
        write_success(&mut conn, &[Item::Number(42)]).await.unwrap();
        conn.flush().await.unwrap();
        assert_eq!(read_reply(&mut conn).await.unwrap(), vec![Item::Number(42)]);
    }

    fn arb_item() -> impl Strategy<Value = Item> {
        let leaf = prop_oneof![
            any::<u64>().prop_map(Item::Number),
            proptest::collection::vec(any::<u8>(), 0..48).prop_map(Item::String),
            "[a-z][a-z0-9_-]{0,12}".prop_map(Item::Word),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            proptest::collection::vec(inner, 0..6).prop_map(Item::List)
        })
    }

    proptest! {
        #[test]
        fn prop_item_roundtrip(item in arb_item()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let decoded = rt.block_on(roundtrip(&item));
            prop_assert_eq!(decoded, item);
        }
    }
}
