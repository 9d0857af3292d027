use std::fmt;

use crate::buf::{BufReader, BufWriter, Decode, DecodeError, Encode};

/// Well-known tag localities.
///
/// Non-negative localities address storage servers in a data center; the
/// negative ones are reserved for special consumers.
pub mod locality {
    /// Log routers pulling for a remote region.
    pub const LOG_ROUTER: i8 = -2;
    /// The system-transaction ("txs") consumers.
    pub const TXS: i8 = -7;
    /// Locality of an unset / invalid tag.
    pub const INVALID: i8 = -100;
}

/// Address of one log consumer: a storage server or a log router.
///
/// A tag is opaque to the log server; it only routes and accounts by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub locality: i8,
    pub id: i32,
}

impl Tag {
    pub const fn new(locality: i8, id: i32) -> Self {
        Self { locality, id }
    }

    /// The reserved tag carrying system-transaction state.
    ///
    /// Exempt from accumulative checksumming and always spilled by value.
    pub const TXS: Tag = Tag::new(locality::TXS, 0);

    /// `true` if this tag addresses a log router rather than a storage
    /// server.
    pub fn is_log_router(&self) -> bool {
        self.locality == locality::LOG_ROUTER
    }

    pub fn is_txs(&self) -> bool {
        self.locality == locality::TXS
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.locality, self.id)
    }
}

impl Encode for Tag {
    fn encode<W: BufWriter>(&self, writer: &mut W) {
        writer.put_i8(self.locality);
        writer.put_i32(self.id);
    }
}

impl Decode for Tag {
    fn decode<'a, R: BufReader<'a>>(reader: &mut R) -> Result<Self, DecodeError> {
        let locality = reader.get_i8()?;
        let id = reader.get_i32()?;
        Ok(Self { locality, id })
    }
}
