//! Counter-mode transform with an interleaved chunk CBC-MAC
//!
//! The integrity engine never sees key material: it is handed something that
//! implements [`ChunkCipher`]. [`AesChunkCipher`] is the production implementation.
//!
//! For every 16-byte plaintext block `P` of a chunk the MAC accumulator `M`
//! advances as `M = AES(M ^ P)`; a trailing short block is zero-padded. When
//! encrypting the MAC is taken before the keystream is applied, when
//! decrypting after, so both directions produce the same MAC for the same
//! plaintext.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use zeroize::Zeroizing;

use crate::{BLOCK_SIZE, KEY_SIZE};

/// One cipher block, used as a chunk MAC accumulator.
pub type MacBlock = [u8; BLOCK_SIZE];

/// AES-128-CTR with a big-endian 128-bit counter
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Direction of a counter-mode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Capability consumed by the chunk MAC table and the file tag reducer.
pub trait ChunkCipher {
    /// Transform `data` in place with the keystream starting at absolute
    /// `stream_offset` (a multiple of 16), folding the plaintext into `mac`.
    ///
    /// With `seed_mac` the accumulator is first reset to `ctr_iv || ctr_iv`;
    /// otherwise the pass continues from the accumulator's current value.
    fn ctr_crypt(
        &self,
        data: &mut [u8],
        stream_offset: u64,
        ctr_iv: u64,
        mac: &mut MacBlock,
        direction: Direction,
        seed_mac: bool,
    );

    /// Encrypt exactly one block in place (ECB, single block).
    fn encrypt_block(&self, block: &mut MacBlock);
}

/// `dst ^= src`
pub fn xor_block(src: &MacBlock, dst: &mut MacBlock) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Initial chunk MAC value for a counter IV.
pub fn mac_seed(ctr_iv: u64) -> MacBlock {
    let iv = ctr_iv.to_le_bytes();
    let mut seed = [0u8; BLOCK_SIZE];
    seed[..8].copy_from_slice(&iv);
    seed[8..].copy_from_slice(&iv);
    seed
}

/// Keyed AES-128 implementation of [`ChunkCipher`].
pub struct AesChunkCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
    block: Aes128,
}

impl AesChunkCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            key: Zeroizing::new(*key),
            block: Aes128::new(key.into()),
        }
    }

    fn counter_block(stream_offset: u64, ctr_iv: u64) -> [u8; BLOCK_SIZE] {
        let mut counter = [0u8; BLOCK_SIZE];
        counter[..8].copy_from_slice(&ctr_iv.to_le_bytes());
        counter[8..].copy_from_slice(&(stream_offset / BLOCK_SIZE as u64).to_be_bytes());
        counter
    }

    fn cbc_mac(&self, data: &[u8], mac: &mut MacBlock) {
        for block in data.chunks(BLOCK_SIZE) {
            for (m, b) in mac.iter_mut().zip(block) {
                *m ^= b;
            }
            self.encrypt_block(mac);
        }
    }
}

impl ChunkCipher for AesChunkCipher {
    fn ctr_crypt(
        &self,
        data: &mut [u8],
        stream_offset: u64,
        ctr_iv: u64,
        mac: &mut MacBlock,
        direction: Direction,
        seed_mac: bool,
    ) {
        debug_assert_eq!(
            stream_offset % BLOCK_SIZE as u64,
            0,
            "counter-mode passes start on a block boundary"
        );

        if seed_mac {
            *mac = mac_seed(ctr_iv);
        }

        let counter = Self::counter_block(stream_offset, ctr_iv);
        let mut keystream = Aes128Ctr::new((&*self.key).into(), (&counter).into());

        match direction {
            Direction::Encrypt => {
                self.cbc_mac(data, mac);
                keystream.apply_keystream(data);
            }
            Direction::Decrypt => {
                keystream.apply_keystream(data);
                self.cbc_mac(data, mac);
            }
        }
    }

    fn encrypt_block(&self, block: &mut MacBlock) {
        self.block
            .encrypt_block(aes::Block::from_mut_slice(block.as_mut_slice()));
    }
}

impl std::fmt::Debug for AesChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesChunkCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_cipher() -> AesChunkCipher {
        AesChunkCipher::new(&[7u8; KEY_SIZE])
    }

    fn make_data(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i.wrapping_mul(31) ^ (i >> 2)) as u8).collect()
    }

    #[test]
    fn test_encrypt_block_fips197_vector() {
        // FIPS-197 appendix C.1
        let key: [u8; 16] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let mut block: MacBlock = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();

        AesChunkCipher::new(&key).encrypt_block(&mut block);
        assert_eq!(hex::encode(block), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn test_xor_block() {
        let mut dst = [0xF0u8; 16];
        xor_block(&[0x0Fu8; 16], &mut dst);
        assert_eq!(dst, [0xFFu8; 16]);
        xor_block(&[0xFFu8; 16], &mut dst);
        assert_eq!(dst, [0u8; 16]);
    }

    #[test]
    fn test_mac_seed_repeats_iv() {
        let seed = mac_seed(0x0102_0304_0506_0708);
        assert_eq!(&seed[..8], &seed[8..]);
        assert_eq!(seed[0], 0x08, "counter IV is stored little-endian");
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        let plaintext = make_data(1000);
        let mut data = plaintext.clone();

        let mut enc_mac = [0u8; 16];
        cipher.ctr_crypt(&mut data, 0, 42, &mut enc_mac, Direction::Encrypt, true);
        assert_ne!(data, plaintext);

        let mut dec_mac = [0u8; 16];
        cipher.ctr_crypt(&mut data, 0, 42, &mut dec_mac, Direction::Decrypt, true);
        assert_eq!(data, plaintext);
        assert_eq!(enc_mac, dec_mac, "both directions MAC the plaintext");
    }

    #[test]
    fn test_split_pass_matches_single_pass() {
        let cipher = test_cipher();
        let plaintext = make_data(4096 + 7);

        let mut whole = plaintext.clone();
        let mut whole_mac = [0u8; 16];
        cipher.ctr_crypt(&mut whole, 8192, 9, &mut whole_mac, Direction::Encrypt, true);

        let mut split = plaintext.clone();
        let mut split_mac = [0u8; 16];
        let (head, tail) = split.split_at_mut(2048);
        cipher.ctr_crypt(head, 8192, 9, &mut split_mac, Direction::Encrypt, true);
        cipher.ctr_crypt(tail, 8192 + 2048, 9, &mut split_mac, Direction::Encrypt, false);

        assert_eq!(whole, split);
        assert_eq!(whole_mac, split_mac);
    }

    #[test]
    fn test_keystream_depends_on_offset_and_iv() {
        let cipher = test_cipher();
        let mut mac = [0u8; 16];

        let mut a = vec![0u8; 32];
        cipher.ctr_crypt(&mut a, 0, 1, &mut mac, Direction::Encrypt, true);
        let mut b = vec![0u8; 32];
        cipher.ctr_crypt(&mut b, 16, 1, &mut mac, Direction::Encrypt, true);
        let mut c = vec![0u8; 32];
        cipher.ctr_crypt(&mut c, 0, 2, &mut mac, Direction::Encrypt, true);

        assert_eq!(&a[16..], &b[..16], "keystream is positioned by offset");
        assert_ne!(a, c, "different IVs give different keystreams");
    }

    #[test]
    fn test_different_keys_different_macs() {
        let plaintext = make_data(64);
        let mut mac1 = [0u8; 16];
        let mut mac2 = [0u8; 16];

        AesChunkCipher::new(&[1u8; 16]).ctr_crypt(
            &mut plaintext.clone(),
            0,
            0,
            &mut mac1,
            Direction::Encrypt,
            true,
        );
        AesChunkCipher::new(&[2u8; 16]).ctr_crypt(
            &mut plaintext.clone(),
            0,
            0,
            &mut mac2,
            Direction::Encrypt,
            true,
        );
        assert_ne!(mac1, mac2);
    }

    #[test]
    fn test_debug_redacts_key() {
        let dbg = format!("{:?}", test_cipher());
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("7, 7"));
    }

    proptest! {
        #[test]
        fn ctr_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..=2048),
                         block_offset in 0u64..1_000_000,
                         iv in any::<u64>()) {
            let cipher = test_cipher();
            let offset = block_offset * BLOCK_SIZE as u64;
            let mut buf = data.clone();
            let mut mac = [0u8; 16];
            cipher.ctr_crypt(&mut buf, offset, iv, &mut mac, Direction::Encrypt, true);
            cipher.ctr_crypt(&mut buf, offset, iv, &mut mac, Direction::Decrypt, true);
            prop_assert_eq!(buf, data);
        }
    }
}
