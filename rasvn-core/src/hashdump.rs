//! Text dump format for string-keyed binary maps.
//!
//! ```text
//! K 7
//! svn:log
//! V 12
//! fixed a bug
//! END
//! ```
//!
//! Each `K`/`V` header carries an exact byte length; the payload follows on
//! the next line and may itself contain newlines or arbitrary bytes. Keys
//! are emitted in sorted order so a dump is deterministic.

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum HashDumpError {
    #[error("failed to read hash dump: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed hash dump: {0}")]
    Malformed(String),
}

fn malformed(msg: impl Into<String>) -> HashDumpError {
    HashDumpError::Malformed(msg.into())
}

/// Serializes `map` into the dump format, terminated by `END`.
pub fn dump(map: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in map {
        out.extend_from_slice(format!("K {}\n", key.len()).as_bytes());
        out.extend_from_slice(key.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(format!("V {}\n", value.len()).as_bytes());
        out.extend_from_slice(value);
        out.push(b'\n');
    }
    out.extend_from_slice(b"END\n");
    out
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn line(&mut self) -> Result<&'a [u8], HashDumpError> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| malformed("missing newline"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn exact(&mut self, len: usize) -> Result<&'a [u8], HashDumpError> {
        let rest = &self.data[self.pos..];
        if rest.len() < len {
            return Err(malformed(format!(
                "payload truncated: wanted {len} bytes, have {}",
                rest.len()
            )));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn newline(&mut self) -> Result<(), HashDumpError> {
        match self.data.get(self.pos) {
            Some(b'\n') => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(malformed("payload not followed by newline")),
        }
    }
}

fn header_len(line: &[u8], tag: u8) -> Result<usize, HashDumpError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| malformed("header line is not UTF-8"))?;
    let rest = text
        .strip_prefix(char::from(tag))
        .and_then(|r| r.strip_prefix(' '))
        .ok_or_else(|| malformed(format!("expected '{} <len>' header, found '{text}'", char::from(tag))))?;
    rest.parse::<usize>()
        .map_err(|_| malformed(format!("bad length in header '{text}'")))
}

/// Parses a dump back into a map. Lengths are authoritative: a key or value
/// shorter than its header claims is an error, as is anything after `END`.
pub fn load(data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, HashDumpError> {
    let mut cursor = Cursor { data, pos: 0 };
    let mut map = BTreeMap::new();
    loop {
        let line = cursor.line()?;
        if line == b"END" {
            if cursor.pos != data.len() {
                return Err(malformed("trailing bytes after END"));
            }
            return Ok(map);
        }
        let key_len = header_len(line, b'K')?;
        let key = cursor.exact(key_len)?;
        let key = std::str::from_utf8(key)
            .map_err(|_| malformed("key is not UTF-8"))?
            .to_string();
        cursor.newline()?;

        let value_len = header_len(cursor.line()?, b'V')?;
        let value = cursor.exact(value_len)?.to_vec();
        cursor.newline()?;

        map.insert(key, value);
    }
}
