//! Key agreement and payload sealing for links between beacons.
//!
//! Two beacons agree on a shared secret with finite-field Diffie-Hellman over
//! the 2048-bit MODP group from RFC 3526. The secret is expanded with HKDF
//! into a cipher key and a MAC key; every sealed payload is encrypted with
//! ChaCha20 and authenticated with HMAC-SHA256 over `nonce || ciphertext`.
//! The MAC is always verified before any decryption happens.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{CohortError, Result};

type HmacSha256 = Hmac<Sha256>;

/// RFC 3526 group 14 prime.
const MODP_2048_HEX: &[u8] = b"\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
83655D23DCA3AD961C62F356208552BB9ED529077096966D\
670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
15728E5A8AACAA68FFFFFFFFFFFFFFFF";

const GENERATOR: u32 = 2;
const PRIVATE_KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const KEY_BYTES: usize = 32;

/// Plaintext both sides seal right after key agreement so the initiator can
/// confirm the secrets match.
pub const GREETING: &[u8] = b"cohort-key-exchange";

fn modp_prime() -> BigUint {
    BigUint::parse_bytes(MODP_2048_HEX, 16).expect("MODP prime constant is valid hex")
}

/// Compare two secrets without leaking where they differ: both sides are
/// HMACed under a throwaway key and the tags are checked in constant time.
pub fn secrets_match(presented: &[u8], expected: &[u8]) -> bool {
    let mut key = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    let keyed = |data: &[u8]| {
        HmacSha256::new_from_slice(&key).map(|mut mac| {
            mac.update(data);
            mac
        })
    };
    match (keyed(presented), keyed(expected)) {
        (Ok(presented), Ok(expected)) => presented
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

fn encode_uint(value: &BigUint) -> String {
    STANDARD.encode(value.to_bytes_be())
}

fn decode_uint(encoded: &str, what: &str) -> Result<BigUint> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CohortError::HandshakeFailed(format!("bad {}: {}", what, e)))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// One side's ephemeral Diffie-Hellman keypair.
pub struct KeyPair {
    prime: BigUint,
    private: BigUint,
    public: BigUint,
}

impl KeyPair {
    /// Generate a keypair over the fixed MODP group (initiator side).
    pub fn generate() -> Self {
        Self::generate_for(modp_prime())
    }

    /// Generate a keypair against a prime received from the initiator.
    ///
    /// Only the fixed MODP group is accepted; any other prime fails the
    /// handshake instead of producing divergent secrets.
    pub fn for_encoded_prime(encoded: &str) -> Result<Self> {
        let prime = decode_uint(encoded, "prime")?;
        if prime != modp_prime() {
            return Err(CohortError::HandshakeFailed(
                "unsupported key exchange prime".to_string(),
            ));
        }
        Ok(Self::generate_for(prime))
    }

    fn generate_for(prime: BigUint) -> Self {
        let mut bytes = [0u8; PRIVATE_KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let private = BigUint::from_bytes_be(&bytes);
        let public = BigUint::from(GENERATOR).modpow(&private, &prime);
        Self {
            prime,
            private,
            public,
        }
    }

    pub fn encoded_prime(&self) -> String {
        encode_uint(&self.prime)
    }

    pub fn encoded_public(&self) -> String {
        encode_uint(&self.public)
    }

    /// Combine the peer's public key with our private key and derive the
    /// session keys.
    pub fn agree(&self, peer_public: &str) -> Result<SessionCipher> {
        let peer = decode_uint(peer_public, "public key")?;
        let one = BigUint::from(1u32);
        if peer <= one || peer >= &self.prime - &one {
            return Err(CohortError::HandshakeFailed(
                "public key out of range".to_string(),
            ));
        }
        let secret = peer.modpow(&self.private, &self.prime);
        SessionCipher::derive(&secret.to_bytes_be())
    }
}

/// An encrypted, authenticated payload as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub nonce: String,
    pub ciphertext: String,
    pub mac: String,
}

/// Symmetric keys shared by both ends of a link after key agreement.
#[derive(Clone)]
pub struct SessionCipher {
    enc_key: [u8; KEY_BYTES],
    mac_key: [u8; KEY_BYTES],
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher { .. }")
    }
}

impl SessionCipher {
    fn derive(secret: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut enc_key = [0u8; KEY_BYTES];
        let mut mac_key = [0u8; KEY_BYTES];
        hk.expand(b"cohort/enc", &mut enc_key)
            .map_err(|e| CohortError::Crypto(e.to_string()))?;
        hk.expand(b"cohort/mac", &mut mac_key)
            .map_err(|e| CohortError::Crypto(e.to_string()))?;
        Ok(Self { enc_key, mac_key })
    }

    fn tag(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|e| CohortError::Crypto(e.to_string()))?;
        mac.update(nonce);
        mac.update(ciphertext);
        Ok(mac)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed> {
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let mut cipher = ChaCha20::new(&self.enc_key.into(), &nonce.into());
        cipher.apply_keystream(&mut buffer);

        let mac = self.tag(&nonce, &buffer)?.finalize().into_bytes();
        Ok(Sealed {
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(&buffer),
            mac: STANDARD.encode(mac),
        })
    }

    /// Verify and decrypt. Any decoding problem or MAC mismatch is reported as
    /// [`CohortError::CorruptedData`] and nothing is decrypted.
    pub fn open(&self, sealed: &Sealed) -> Result<Vec<u8>> {
        let nonce = STANDARD
            .decode(&sealed.nonce)
            .map_err(|_| CohortError::CorruptedData)?;
        let mut buffer = STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|_| CohortError::CorruptedData)?;
        let mac = STANDARD
            .decode(&sealed.mac)
            .map_err(|_| CohortError::CorruptedData)?;

        self.tag(&nonce, &buffer)?
            .verify_slice(&mac)
            .map_err(|_| CohortError::CorruptedData)?;

        let nonce: [u8; NONCE_BYTES] = nonce
            .as_slice()
            .try_into()
            .map_err(|_| CohortError::CorruptedData)?;
        let mut cipher = ChaCha20::new(&self.enc_key.into(), &nonce.into());
        cipher.apply_keystream(&mut buffer);
        Ok(buffer)
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<Sealed> {
        self.seal(&serde_json::to_vec(value)?)
    }

    pub fn open_json<T: DeserializeOwned>(&self, sealed: &Sealed) -> Result<T> {
        let plaintext = self.open(sealed)?;
        serde_json::from_slice(&plaintext).map_err(|_| CohortError::CorruptedData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agreed_pair() -> (SessionCipher, SessionCipher) {
        let initiator = KeyPair::generate();
        let responder = KeyPair::for_encoded_prime(&initiator.encoded_prime()).unwrap();
        let a = initiator.agree(&responder.encoded_public()).unwrap();
        let b = responder.agree(&initiator.encoded_public()).unwrap();
        (a, b)
    }

    #[test]
    fn both_sides_derive_the_same_keys() {
        let (a, b) = agreed_pair();
        let sealed = a.seal(b"hello").unwrap();
        assert_eq!(b.open(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let (a, _) = agreed_pair();
        let sealed = a.seal(b"a password").unwrap();
        let raw = STANDARD.decode(&sealed.ciphertext).unwrap();
        assert_ne!(raw, b"a password");
    }

    #[test]
    fn tampered_mac_is_corrupted_data() {
        let (a, b) = agreed_pair();
        let mut sealed = a.seal(b"secret").unwrap();
        let mut mac = STANDARD.decode(&sealed.mac).unwrap();
        mac[0] ^= 0xff;
        sealed.mac = STANDARD.encode(mac);
        assert!(matches!(b.open(&sealed), Err(CohortError::CorruptedData)));
    }

    #[test]
    fn tampered_ciphertext_is_corrupted_data() {
        let (a, b) = agreed_pair();
        let mut sealed = a.seal(b"secret").unwrap();
        let mut ct = STANDARD.decode(&sealed.ciphertext).unwrap();
        ct[0] ^= 0x01;
        sealed.ciphertext = STANDARD.encode(ct);
        assert!(matches!(b.open(&sealed), Err(CohortError::CorruptedData)));
    }

    #[test]
    fn unrelated_sessions_cannot_open_each_other() {
        let (a, _) = agreed_pair();
        let (_, other) = agreed_pair();
        let sealed = a.seal(b"secret").unwrap();
        assert!(matches!(other.open(&sealed), Err(CohortError::CorruptedData)));
    }

    #[test]
    fn foreign_prime_is_rejected() {
        let prime = STANDARD.encode(BigUint::from(23u32).to_bytes_be());
        assert!(matches!(
            KeyPair::for_encoded_prime(&prime),
            Err(CohortError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn degenerate_public_key_is_rejected() {
        let pair = KeyPair::generate();
        let one = STANDARD.encode([1u8]);
        assert!(matches!(
            pair.agree(&one),
            Err(CohortError::HandshakeFailed(_))
        ));
        assert!(matches!(
            pair.agree("not base64!"),
            Err(CohortError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn secrets_match_only_when_equal() {
        assert!(secrets_match(b"s3cret", b"s3cret"));
        assert!(secrets_match(b"", b""));
        assert!(!secrets_match(b"s3cret", b"s3cre"));
        assert!(!secrets_match(b"s3cret", b"S3cret"));
        assert!(!secrets_match(b"", b"x"));
    }

    #[test]
    fn json_payloads_round_trip() {
        let (a, b) = agreed_pair();
        let sealed = a.seal_json(&vec![1, 2, 3]).unwrap();
        let opened: Vec<i32> = b.open_json(&sealed).unwrap();
        assert_eq!(opened, vec![1, 2, 3]);
    }
}
