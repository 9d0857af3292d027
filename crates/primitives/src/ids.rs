use std::fmt;

use crate::buf::{BufReader, BufWriter, Decode, DecodeError, Encode};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0.to_be_bytes()))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl Encode for $name {
            fn encode<W: BufWriter>(&self, writer: &mut W) {
                writer.put_u64(self.0);
            }
        }

        impl Decode for $name {
            fn decode<'a, R: BufReader<'a>>(reader: &mut R) -> Result<Self, DecodeError> {
                reader.get_u64().map(Self)
            }
        }
    };
}

id_type! {
    /// Identifies one log group, the partitioning unit of the write-ahead
    /// log. A process may host several groups.
    GroupId
}

id_type! {
    /// Identifies one generation of a log group: the instantiation created
    /// by one recovery round.
    GenerationId
}

id_type! {
    /// Identifies a storage team: the set of tags which jointly receive a
    /// copy of a mutation. Unit of peek addressing.
    StorageTeamId
}
