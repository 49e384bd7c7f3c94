//! The fsmonitor query protocol.
//!
//! A query is `<version> <since>` in ASCII decimal. The daemon answers with
//! the paths changed at or after `since`, newest first, or with the single
//! path `/` when the client must rescan everything.

use thiserror::Error;

/// Protocol version spoken by this daemon.
///
/// Increment this when making breaking changes to the query format.
pub const PROTOCOL_VERSION: u64 = 1;

/// Reply telling the client to rescan the whole worktree.
pub const RESCAN: &str = "/";

/// Control request that shuts the daemon down.
pub const QUIT_COMMAND: &[u8] = b"quit";

/// Error type for malformed queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unhandled protocol version {found} (expected {expected})")]
    UnsupportedVersion { found: u64, expected: u64 },

    #[error("incorrect or early timestamp in {request:?}")]
    BadTimestamp { request: String },

    #[error("unexpected trailing data {rest:?} in {request:?}")]
    TrailingData { request: String, rest: String },
}

/// A parsed `<version> <since>` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    pub version: u64,
    /// Nanoseconds since the Unix epoch; never zero
    pub since: u64,
}

impl Query {
    /// A query for the current protocol version.
    pub fn new(since: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            since,
        }
    }

    /// Parse and validate a query.
    ///
    /// Leading whitespace before the version is accepted; a missing version
    /// reads as 0 and is rejected like any other mismatch. `since` must be
    /// a non-zero integer that fits in 64 bits with nothing after it.
    pub fn parse(request: &[u8]) -> Result<Self, QueryError> {
        let lossy = || String::from_utf8_lossy(request).into_owned();

        let rest = skip_whitespace(request);
        let (digits, rest) = split_digits(rest);
        let version = parse_decimal(digits).unwrap_or(0);
        if version != PROTOCOL_VERSION {
            return Err(QueryError::UnsupportedVersion {
                found: version,
                expected: PROTOCOL_VERSION,
            });
        }

        let rest = skip_whitespace(rest);
        let (digits, rest) = split_digits(rest);
        if !rest.is_empty() {
            return Err(QueryError::TrailingData {
                request: lossy(),
                rest: String::from_utf8_lossy(rest).into_owned(),
            });
        }

        match parse_decimal(digits) {
            Some(since) if since > 0 => Ok(Self { version, since }),
            _ => Err(QueryError::BadTimestamp { request: lossy() }),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}", self.version, self.since).into_bytes()
    }
}

/// A request the daemon understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Query(Query),
    Quit,
}

impl Request {
    pub fn parse(request: &[u8]) -> Result<Self, QueryError> {
        if request == QUIT_COMMAND {
            return Ok(Self::Quit);
        }
        Query::parse(request).map(Self::Query)
    }
}

/// A reply as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReply {
    /// The daemon cannot answer; rescan everything.
    Rescan,
    /// Paths changed since the query time, newest first.
    Changed(Vec<String>),
}

impl QueryReply {
    /// Parse the NUL-separated reply returned by a transport.
    pub fn parse(reply: &[u8]) -> Self {
        let chunks = fsmonitor_ipc::split_reply(reply);
        if let [only] = chunks.as_slice() {
            if *only == RESCAN.as_bytes() {
                return Self::Rescan;
            }
        }
        Self::Changed(
            chunks
                .into_iter()
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect(),
        )
    }
}

fn skip_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn split_digits(bytes: &[u8]) -> (&[u8], &[u8]) {
    let end = bytes
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(bytes.len());
    bytes.split_at(end)
}

/// `None` when there are no digits or the value overflows.
fn parse_decimal(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0u64, |acc, &d| {
        acc.checked_mul(10)?.checked_add(u64::from(d - b'0'))
    })
}
