//! 64-bit file authentication tag ("meta-MAC")

use subtle::ConstantTimeEq;

use crate::TAG_SIZE;

/// The condensed fold of every chunk MAC of a file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileTag([u8; TAG_SIZE]);

impl FileTag {
    pub const fn from_bytes(bytes: [u8; TAG_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }

    /// Reinterpret as a little-endian signed integer, the form stored in
    /// transfer records.
    pub fn to_i64(self) -> i64 {
        i64::from_le_bytes(self.0)
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value.to_le_bytes())
    }

    /// Constant-time equality, for comparing a computed tag against an expected one.
    pub fn ct_matches(&self, other: &FileTag) -> bool {
        self.0.ct_eq(&other.0).into()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for FileTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for FileTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileTag({})", self.to_hex())
    }
}
