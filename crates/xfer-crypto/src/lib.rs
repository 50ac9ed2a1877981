//! xfer-crypto: the symmetric capability behind chunked transfer integrity
//!
//! Architecture: AES-128 in counter mode, with a CBC-MAC over each chunk's plaintext
//!
//! ```text
//! Node key (32 bytes, attached to the file's metadata)
//!   ├── AES-128 key        = key[0..16] ^ key[16..32]
//!   ├── Counter IV (64-bit) = key[16..24]
//!   └── File tag (64-bit)   = key[24..32]   (fold of every chunk MAC)
//! ```
//!
//! Counter block for byte offset `p`: `ctr_iv (8 bytes LE) || p / 16 (8 bytes BE)`.
//! Chunk MAC seed: `ctr_iv || ctr_iv`.

pub mod cipher;
pub mod keys;
pub mod tag;

pub use cipher::{xor_block, AesChunkCipher, ChunkCipher, Direction, MacBlock};
pub use keys::FileKeyMaterial;
pub use tag::FileTag;

/// Size of an AES-128 key in bytes
pub const KEY_SIZE: usize = 16;

/// Size of one cipher block (and of a chunk MAC accumulator)
pub const BLOCK_SIZE: usize = 16;

/// Size of the node key carrying key, counter IV and file tag
pub const NODE_KEY_SIZE: usize = 32;

/// Size of the condensed file tag
pub const TAG_SIZE: usize = 8;
