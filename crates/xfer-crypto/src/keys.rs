//! File key material: AES key, counter IV and file tag packed into a node key

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::AesChunkCipher;
use crate::tag::FileTag;
use crate::{KEY_SIZE, NODE_KEY_SIZE, TAG_SIZE};

/// Per-file key material. The AES key is zeroized on drop.
///
/// Node key layout (32 bytes):
/// ```text
/// [0..16)  AES key ^ [16..32)
/// [16..24) counter IV (little-endian)
/// [24..32) file tag
/// ```
#[derive(Clone)]
pub struct FileKeyMaterial {
    aes_key: [u8; KEY_SIZE],
    ctr_iv: u64,
    meta_mac: FileTag,
}

impl FileKeyMaterial {
    pub fn new(aes_key: [u8; KEY_SIZE], ctr_iv: u64, meta_mac: FileTag) -> Self {
        Self {
            aes_key,
            ctr_iv,
            meta_mac,
        }
    }

    /// Fresh random key and counter IV for a new upload. The file tag is
    /// zero until the upload has produced one.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut aes_key = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut aes_key);
        Self::new(aes_key, rng.next_u64(), FileTag::default())
    }

    /// Unpack a 32-byte node key.
    pub fn from_node_key(node_key: &[u8; NODE_KEY_SIZE]) -> Self {
        let (folded, tail) = node_key.split_at(KEY_SIZE);

        let mut aes_key = [0u8; KEY_SIZE];
        for (k, (a, b)) in aes_key.iter_mut().zip(folded.iter().zip(tail)) {
            *k = a ^ b;
        }

        let mut iv = [0u8; 8];
        iv.copy_from_slice(&tail[..8]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&tail[8..]);

        Self::new(aes_key, u64::from_le_bytes(iv), FileTag::from_bytes(tag))
    }

    /// Pack into the 32-byte node key attached to file metadata.
    pub fn to_node_key(&self) -> Zeroizing<[u8; NODE_KEY_SIZE]> {
        let mut node_key = Zeroizing::new([0u8; NODE_KEY_SIZE]);
        node_key[KEY_SIZE..KEY_SIZE + 8].copy_from_slice(&self.ctr_iv.to_le_bytes());
        node_key[KEY_SIZE + 8..].copy_from_slice(self.meta_mac.as_bytes());
        for i in 0..KEY_SIZE {
            node_key[i] = self.aes_key[i] ^ node_key[KEY_SIZE + i];
        }
        node_key
    }

    /// Parse a base64url (unpadded) node key.
    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let mut bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| anyhow::anyhow!("base64 decode: {e}"))?;

        if bytes.len() != NODE_KEY_SIZE {
            let len = bytes.len();
            bytes.zeroize();
            anyhow::bail!("node key has wrong size: {len} bytes (expected {NODE_KEY_SIZE})");
        }

        let mut node_key = Zeroizing::new([0u8; NODE_KEY_SIZE]);
        node_key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self::from_node_key(&node_key))
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_node_key().as_slice())
    }

    /// The same key with `meta_mac` embedded (what an upload attaches on completion).
    pub fn with_meta_mac(mut self, meta_mac: FileTag) -> Self {
        self.meta_mac = meta_mac;
        self
    }

    pub fn aes_key(&self) -> &[u8; KEY_SIZE] {
        &self.aes_key
    }

    pub fn ctr_iv(&self) -> u64 {
        self.ctr_iv
    }

    pub fn meta_mac(&self) -> FileTag {
        self.meta_mac
    }

    /// Build the keyed cipher handed to the integrity engine.
    pub fn cipher(&self) -> AesChunkCipher {
        AesChunkCipher::new(&self.aes_key)
    }
}

impl Drop for FileKeyMaterial {
    fn drop(&mut self) {
        self.aes_key.zeroize();
    }
}

impl std::fmt::Debug for FileKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyMaterial")
            .field("aes_key", &"[REDACTED]")
            .field("ctr_iv", &self.ctr_iv)
            .field("meta_mac", &self.meta_mac)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let k1 = FileKeyMaterial::generate();
        let k2 = FileKeyMaterial::generate();
        assert_ne!(k1.aes_key(), k2.aes_key(), "random keys must differ");
        assert_eq!(k1.meta_mac(), FileTag::default());
    }

    #[test]
    fn test_node_key_roundtrip() {
        let key = FileKeyMaterial::new([0x11; KEY_SIZE], 0x0807_0605_0403_0201, FileTag::from_i64(-5));
        let node_key = key.to_node_key();
        let restored = FileKeyMaterial::from_node_key(&node_key);

        assert_eq!(restored.aes_key(), key.aes_key());
        assert_eq!(restored.ctr_iv(), key.ctr_iv());
        assert_eq!(restored.meta_mac(), key.meta_mac());
    }

    #[test]
    fn test_node_key_layout() {
        let key = FileKeyMaterial::new([0u8; KEY_SIZE], 1, FileTag::from_bytes([2; 8]));
        let node_key = key.to_node_key();

        // iv at [16..24) little-endian, tag at [24..32)
        assert_eq!(node_key[16], 1);
        assert_eq!(&node_key[17..24], &[0u8; 7]);
        assert_eq!(&node_key[24..], &[2u8; 8]);
        // zero AES key: the first half mirrors the second
        assert_eq!(&node_key[..16], &node_key[16..]);
    }

    #[test]
    fn test_meta_mac_changes_node_key_but_not_aes_key() {
        let key = FileKeyMaterial::generate();
        let sealed = key.clone().with_meta_mac(FileTag::from_i64(77));

        assert_ne!(key.to_node_key().as_slice(), sealed.to_node_key().as_slice());
        let reopened = FileKeyMaterial::from_node_key(&sealed.to_node_key());
        assert_eq!(reopened.aes_key(), key.aes_key());
        assert_eq!(reopened.meta_mac(), FileTag::from_i64(77));
    }

    #[test]
    fn test_base64_roundtrip() {
        let key = FileKeyMaterial::generate().with_meta_mac(FileTag::from_i64(123));
        let encoded = key.to_base64();
        assert_eq!(encoded.len(), 43, "32 bytes unpadded base64url");

        let decoded = FileKeyMaterial::from_base64(&encoded).unwrap();
        assert_eq!(decoded.aes_key(), key.aes_key());
        assert_eq!(decoded.ctr_iv(), key.ctr_iv());
        assert_eq!(decoded.meta_mac(), key.meta_mac());
    }

    #[test]
    fn test_base64_wrong_length() {
        let short = URL_SAFE_NO_PAD.encode([0u8; 16]);
        assert!(FileKeyMaterial::from_base64(&short).is_err());
        assert!(FileKeyMaterial::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let dbg = format!("{:?}", FileKeyMaterial::generate());
        assert!(dbg.contains("REDACTED"));
    }
}
