use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{NodeId, DEFAULT_MEDIUM};

/// The erasure codec of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ErasureCodec {
    /// A regular, replicated chunk.
    None,
    /// Reed-Solomon with `data` data parts and `parity` parity parts.
    ReedSolomon { data: u8, parity: u8 },
    /// Locally repairable code with `data` data parts, `parity` global parity parts and
    /// `local_parity` local parity parts.
    Lrc { data: u8, parity: u8, local_parity: u8 },
}

impl Default for ErasureCodec {
    fn default() -> Self {
        Self::None
    }
}

impl ErasureCodec {
    /// Check if this is an erasure codec, as opposed to plain replication.
    pub fn is_erasure(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// The total number of parts of a chunk encoded with this codec.
    ///
    /// Regular chunks are treated as having a single part. Saturates for codecs which do not
    /// pass `validate`.
    pub fn total_part_count(&self) -> u8 {
        self.checked_part_count().unwrap_or(u8::MAX)
    }

    fn checked_part_count(&self) -> Option<u8> {
        match self {
            Self::None => Some(1),
            Self::ReedSolomon { data, parity } => data.checked_add(*parity),
            Self::Lrc { data, parity, local_parity } => data.checked_add(*parity)?.checked_add(*local_parity),
        }
    }

    /// Check that all part counts are positive, and that every part index fits into a `u8`.
    pub fn validate(&self) -> Result<(), String> {
        let positive = match self {
            Self::None => true,
            Self::ReedSolomon { data, parity } => *data > 0 && *parity > 0,
            Self::Lrc { data, parity, local_parity } => *data > 0 && *parity > 0 && *local_parity > 0,
        };
        if !positive {
            return Err(format!("invalid erasure codec {}: part counts must be positive", self));
        }
        if self.checked_part_count().is_none() {
            return Err(format!("invalid erasure codec {}: more than {} parts", self, u8::MAX));
        }
        Ok(())
    }

    /// The number of data parts of a chunk encoded with this codec.
    pub fn data_part_count(&self) -> u8 {
        match self {
            Self::None => 1,
            Self::ReedSolomon { data, .. } | Self::Lrc { data, .. } => *data,
        }
    }

    /// Check if the given part index holds data, as opposed to parity.
    pub fn is_data_part(&self, index: u8) -> bool {
        index < self.data_part_count()
    }

    /// The number of arbitrary part erasures which can always be repaired.
    ///
    /// An LRC tolerates any `parity + 1` erasures, as a single failure in a local group is
    /// always repaired from the local parity.
    pub fn guaranteed_repairable_part_count(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::ReedSolomon { parity, .. } => *parity,
            Self::Lrc { parity, local_parity, .. } => parity.saturating_add((*local_parity).min(1)),
        }
    }
}

impl fmt::Display for ErasureCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::ReedSolomon { data, parity } => write!(f, "reed_solomon_{}_{}", data, parity),
            Self::Lrc { data, parity, local_parity } => write!(f, "lrc_{}_{}_{}", data, local_parity, parity),
        }
    }
}

impl FromStr for ErasureCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "none" {
            return Ok(Self::None);
        }
        let parse = |val: &str| val.parse::<u8>().map_err(|err| format!("invalid erasure codec {:?}: {}", s, err));
        if let Some(rest) = s.strip_prefix("reed_solomon_") {
            return match rest.split('_').collect::<Vec<_>>().as_slice() {
                [data, parity] => {
                    let codec = Self::ReedSolomon { data: parse(data)?, parity: parse(parity)? };
                    codec.validate()?;
                    Ok(codec)
                }
                _ => Err(format!("invalid erasure codec {:?}, expected reed_solomon_<data>_<parity>", s)),
            };
        }
        if let Some(rest) = s.strip_prefix("lrc_") {
            return match rest.split('_').collect::<Vec<_>>().as_slice() {
                [data, local_parity, parity] => {
                    let codec = Self::Lrc {
                        data: parse(data)?,
                        parity: parse(parity)?,
                        local_parity: parse(local_parity)?,
                    };
                    codec.validate()?;
                    Ok(codec)
                }
                _ => Err(format!("invalid erasure codec {:?}, expected lrc_<data>_<local>_<parity>", s)),
            };
        }
        Err(format!("unknown erasure codec {:?}", s))
    }
}

/// A single stored replica of a chunk.
///
/// For erasure chunks, `part_index` identifies which part of the chunk is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkReplica {
    pub node: NodeId,
    pub part_index: Option<u8>,
}

impl ChunkReplica {
    pub fn new(node: NodeId, part_index: Option<u8>) -> Self {
        Self { node, part_index }
    }
}

/// Weight statistics of a chunk, reported by its writer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStatistics {
    pub row_count: u64,
    pub compressed_data_size: u64,
    pub uncompressed_data_size: u64,
    pub data_weight: u64,
}

/// The replication policy which an owner requires of a chunk.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    /// The medium on which replicas are to be stored.
    #[serde(default = "default_medium")]
    pub medium: String,
    /// The number of replicas which are to be stored.
    pub replication_factor: u8,
    /// Only store the data parts of erasure chunks.
    #[serde(default)]
    pub data_parts_only: bool,
}

impl ReplicationPolicy {
    /// Create a new policy on the default medium.
    pub fn new(replication_factor: u8) -> Self {
        Self {
            medium: default_medium(),
            replication_factor,
            data_parts_only: false,
        }
    }
}

fn default_medium() -> String {
    DEFAULT_MEDIUM.into()
}
