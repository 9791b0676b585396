//! Fragments: the addressable unit of a journal's durable content.
//!
//! A fragment is a half-open byte interval `[begin, end)` of a journal
//! together with a content digest. Its canonical name is the fragment's
//! address within a backing store.

mod cover_set;
mod stores;
mod walk;

pub use cover_set::CoverSet;
pub use stores::{MemStoreAdapter, StoreAdapter, StoreError, StoreObject, StoreUrl};
pub use walk::{WalkError, walk_all_stores};

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::journal::Journal;

/// Length in bytes of a fragment content digest.
pub const SUM_LENGTH: usize = 20;

/// Compression applied to a fragment's persisted content. The codec is
/// carried by the object name's extension, not by the content name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Zstandard,
    Snappy,
}

impl CompressionCodec {
    pub fn extension(self) -> &'static str {
        match self {
            CompressionCodec::None => ".raw",
            CompressionCodec::Gzip => ".gz",
            CompressionCodec::Zstandard => ".zst",
            CompressionCodec::Snappy => ".sz",
        }
    }

    pub fn from_extension(ext: &str) -> Option<CompressionCodec> {
        match ext {
            ".raw" => Some(CompressionCodec::None),
            ".gz" => Some(CompressionCodec::Gzip),
            ".zst" => Some(CompressionCodec::Zstandard),
            ".sz" => Some(CompressionCodec::Snappy),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("wrong format")]
    WrongFormat,
    #[error("invalid content range")]
    InvalidContentRange,
    #[error("invalid checksum")]
    InvalidChecksum,
}

/// A half-open byte interval of a journal with a content digest.
///
/// `sum` is `None` iff the fragment is empty (`begin == end`).
/// `backing_store` and `mod_time` are attached once the fragment has
/// been persisted; a zero `mod_time` with no backing store marks a live
/// fragment still owned by a broker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub journal: Journal,
    pub begin: i64,
    pub end: i64,
    pub sum: Option<[u8; SUM_LENGTH]>,
    pub codec: CompressionCodec,
    pub backing_store: Option<StoreUrl>,
    /// Modification time in Unix seconds; zero when unset.
    pub mod_time: i64,
}

impl Fragment {
    /// The canonical, fixed-width content name:
    /// `<begin:16-hex>-<end:16-hex>-<sum:40-hex>`, with the sum field
    /// empty for empty fragments.
    pub fn content_name(&self) -> String {
        let mut name = String::with_capacity(16 + 1 + 16 + 1 + 2 * SUM_LENGTH);
        let _ = write!(name, "{:016x}-{:016x}-", self.begin, self.end);
        if let Some(sum) = &self.sum {
            for byte in sum {
                let _ = write!(name, "{byte:02x}");
            }
        }
        name
    }

    /// Bytes of journal content this fragment covers.
    pub fn content_length(&self) -> i64 {
        self.end - self.begin
    }

    /// Inverts `content_name`. The parsed fragment carries no journal,
    /// codec, or persistence metadata.
    pub fn parse(name: &str) -> Result<Fragment, ParseError> {
        let [begin, end, sum]: [&str; 3] = name
            .split('-')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| ParseError::WrongFormat)?;

        let begin = i64::from_str_radix(begin, 16).map_err(|_| ParseError::WrongFormat)?;
        let end = i64::from_str_radix(end, 16).map_err(|_| ParseError::WrongFormat)?;
        if begin > end {
            return Err(ParseError::InvalidContentRange);
        }

        let sum = parse_sum(sum, begin == end)?;
        Ok(Fragment {
            begin,
            end,
            sum,
            ..Fragment::default()
        })
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.journal, self.content_name())
    }
}

fn parse_sum(sum: &str, empty: bool) -> Result<Option<[u8; SUM_LENGTH]>, ParseError> {
    if sum.is_empty() {
        return if empty {
            Ok(None)
        } else {
            Err(ParseError::InvalidChecksum)
        };
    }
    if empty || sum.len() != 2 * SUM_LENGTH {
        return Err(ParseError::InvalidChecksum);
    }
    let mut out = [0u8; SUM_LENGTH];
    for (i, chunk) in sum.as_bytes().chunks(2).enumerate() {
        let chunk = std::str::from_utf8(chunk).map_err(|_| ParseError::InvalidChecksum)?;
        out[i] = u8::from_str_radix(chunk, 16).map_err(|_| ParseError::InvalidChecksum)?;
    }
    Ok(Some(out))
}

#[cfg(test)]
pub(crate) fn frag(begin: i64, end: i64) -> Fragment {
    Fragment {
        begin,
        end,
        sum: (begin != end).then_some([0u8; SUM_LENGTH]),
        ..Fragment::default()
    }
}
