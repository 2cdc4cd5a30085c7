//! Key management and the encrypted envelope layer.
//!
//! X25519 key pairs and symmetric keys live in the KeyChain (private halves
//! tagged by public key, symmetric keys tagged by topic). Envelopes are
//! ChaCha20-Poly1305 over the serialized payload:
//!
//! `[type:1][senderPublicKey:32, type 1 only][iv:12][ciphertext || tag]`
//!
//! base64-encoded. Type 0 assumes the key is already shared; type 1 carries
//! the sender's public key so the receiver can derive the shared key first.

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::constants::CRYPTO_CLIENT_SEED;
use crate::error::{Error, Result};
use crate::keychain::KeyChain;
use crate::relay_auth::ClientKeys;
use crate::storage::KeyValueStorage;
use crate::utils::{random_bytes32, sha256_hex};

pub const TYPE_0: u8 = 0;
pub const TYPE_1: u8 = 1;

const TYPE_LENGTH: usize = 1;
const KEY_LENGTH: usize = 32;
const IV_LENGTH: usize = 12;

#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    pub envelope_type: u8,
    pub sender_public_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Our public key, required to derive the shared key out of a type 1
    /// envelope.
    pub receiver_public_key: Option<String>,
}

pub struct Crypto {
    pub keychain: KeyChain,
    client_keys: RwLock<Option<ClientKeys>>,
}

impl Crypto {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            keychain: KeyChain::new(storage),
            client_keys: RwLock::new(None),
        }
    }

    /// Hydrates the keychain and loads (or creates) the ed25519 client seed.
    pub async fn init(&self) -> Result<()> {
        self.keychain.init().await?;

        let seed: [u8; 32] = match self.keychain.get(CRYPTO_CLIENT_SEED).await
        {
            Ok(hex_seed) => hex::decode(hex_seed)?
                .try_into()
                .map_err(|_| Error::MissingOrInvalid("client seed".into()))?,
            Err(Error::NoMatchingKey(_, _)) => {
                let seed = random_bytes32();
                self.keychain
                    .set(CRYPTO_CLIENT_SEED, &hex::encode(seed))
                    .await?;
                seed
            }
            Err(e) => return Err(e),
        };

        *self.client_keys.write().await = Some(ClientKeys::from_seed(seed));
        Ok(())
    }

    pub async fn get_client_id(&self) -> Result<String> {
        Ok(self.client_keys().await?.client_id())
    }

    pub async fn sign_jwt(&self, aud: &str) -> Result<String> {
        let sub = hex::encode(random_bytes32());
        Ok(self.client_keys().await?.sign_jwt(aud, &sub))
    }

    /// Generates a fresh X25519 key pair, stores the private half under the
    /// public key tag and returns the public key hex.
    pub async fn generate_key_pair(&self) -> Result<String> {
        let private_key = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public_key = x25519_dalek::PublicKey::from(&private_key);

        let public_hex = hex::encode(public_key.to_bytes());
        self.keychain
            .set(&public_hex, &hex::encode(private_key.to_bytes()))
            .await?;
        Ok(public_hex)
    }

    /// ECDH with our stored private key and the peer's public key, expanded
    /// through HKDF-SHA256 (empty salt and info) to the symmetric key. The
    /// key is stored under `override_topic` or the derived topic.
    pub async fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<String>,
    ) -> Result<String> {
        let private_hex = self.keychain.get(self_public_key).await?;
        let private_key: [u8; 32] = hex::decode(private_hex)?
            .try_into()
            .map_err(|_| Error::MissingOrInvalid("private key".into()))?;
        let peer_key: [u8; 32] = hex::decode(peer_public_key)?
            .try_into()
            .map_err(|_| Error::MissingOrInvalid("peer public key".into()))?;

        let sym_key = derive_sym_key(private_key, peer_key);
        self.set_sym_key(sym_key, override_topic).await
    }

    /// Stores a symmetric key and returns its topic (SHA-256 of the key when
    /// no topic is supplied).
    pub async fn set_sym_key(
        &self,
        sym_key: [u8; 32],
        override_topic: Option<String>,
    ) -> Result<String> {
        let topic = override_topic.unwrap_or_else(|| sha256_hex(sym_key));
        self.keychain.set(&topic, &hex::encode(sym_key)).await?;
        Ok(topic)
    }

    pub async fn has_keys(&self, tag: &str) -> Result<bool> {
        self.keychain.has(tag).await
    }

    pub async fn delete_key_pair(&self, public_key: &str) -> Result<()> {
        self.keychain.delete(public_key).await
    }

    pub async fn delete_sym_key(&self, topic: &str) -> Result<()> {
        self.keychain.delete(topic).await
    }

    /// Encrypts `plaintext` under the topic's symmetric key and frames it as
    /// an envelope. A type 1 envelope without a sender key is rejected.
    pub async fn encode(
        &self,
        topic: &str,
        plaintext: &str,
        opts: EncodeOptions,
    ) -> Result<String> {
        if opts.envelope_type == TYPE_1 && opts.sender_public_key.is_none() {
            return Err(Error::MissingOrInvalid(
                "missing sender public key for type 1 envelope".into(),
            ));
        }

        let sym_key = self.get_sym_key(topic).await?;

        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&sym_key));
        let sealed =
            cipher.encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())?;

        let sender_public_key = opts
            .sender_public_key
            .as_deref()
            .map(hex::decode)
            .transpose()?;

        Envelope {
            envelope_type: opts.envelope_type,
            sender_public_key,
            iv: iv.to_vec(),
            sealed,
        }
        .serialize()
    }

    /// Inverse of [`Crypto::encode`]. For type 1 envelopes the shared key is
    /// derived from the embedded sender key before decrypting, and the
    /// receiver public key must be supplied.
    pub async fn decode(
        &self,
        topic: &str,
        encoded: &str,
        opts: DecodeOptions,
    ) -> Result<String> {
        let envelope = Envelope::deserialize(encoded)?;

        let key_topic = match envelope.envelope_type {
            TYPE_0 => topic.to_string(),
            TYPE_1 => {
                let sender = envelope.sender_public_key.as_ref().ok_or_else(
                    || {
                        Error::MissingOrInvalid(
                            "type 1 envelope without sender public key".into(),
                        )
                    },
                )?;
                let receiver =
                    opts.receiver_public_key.as_ref().ok_or_else(|| {
                        Error::MissingOrInvalid(
                            "missing receiver public key for type 1 envelope"
                                .into(),
                        )
                    })?;
                self.generate_shared_key(
                    receiver,
                    &hex::encode(sender),
                    None,
                )
                .await?
            }
            other => {
                return Err(Error::MissingOrInvalid(format!(
                    "unknown envelope type {other}"
                )));
            }
        };

        let sym_key = self.get_sym_key(&key_topic).await?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&sym_key));
        let decrypted = cipher
            .decrypt(Nonce::from_slice(&envelope.iv), envelope.sealed.as_ref())?;
        Ok(String::from_utf8(decrypted)?)
    }

    async fn get_sym_key(&self, topic: &str) -> Result<[u8; 32]> {
        let hex_key = self.keychain.get(topic).await?;
        hex::decode(hex_key)?
            .try_into()
            .map_err(|_| Error::MissingOrInvalid("symmetric key".into()))
    }

    async fn client_keys(&self) -> Result<ClientKeys> {
        self.client_keys
            .read()
            .await
            .clone()
            .ok_or(Error::NotInitialized("crypto".to_string()))
    }
}

pub fn derive_sym_key(
    private_key: [u8; 32],
    peer_public_key: [u8; 32],
) -> [u8; 32] {
    let secret = x25519_dalek::StaticSecret::from(private_key);
    let shared =
        secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer_public_key));

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut sym_key = [0u8; 32];
    hk.expand(&[], &mut sym_key)
        .expect("32 bytes is a valid hkdf output length");
    sym_key
}

/// Binary envelope framing; see the module docs for the layout.
#[derive(Debug)]
struct Envelope {
    envelope_type: u8,
    sender_public_key: Option<Vec<u8>>,
    iv: Vec<u8>,
    sealed: Vec<u8>,
}

impl Envelope {
    fn serialize(&self) -> Result<String> {
        let mut bytes = vec![self.envelope_type];
        match self.envelope_type {
            TYPE_1 => {
                let sender =
                    self.sender_public_key.as_ref().ok_or_else(|| {
                        Error::MissingOrInvalid(
                            "type 1 envelope without sender public key".into(),
                        )
                    })?;
                bytes.extend_from_slice(sender);
                bytes.extend_from_slice(&self.iv);
                bytes.extend_from_slice(&self.sealed);
            }
            _ => {
                bytes.extend_from_slice(&self.iv);
                bytes.extend_from_slice(&self.sealed);
            }
        }
        Ok(Base64::encode_string(&bytes))
    }

    fn deserialize(encoded: &str) -> Result<Self> {
        let bytes = Base64::decode_vec(encoded)?;
        if bytes.is_empty() {
            return Err(Error::MissingOrInvalid("empty envelope".into()));
        }

        let envelope_type = bytes[0];
        match envelope_type {
            TYPE_1 => {
                let min = TYPE_LENGTH + KEY_LENGTH + IV_LENGTH;
                if bytes.len() < min {
                    return Err(Error::MissingOrInvalid(
                        "truncated type 1 envelope".into(),
                    ));
                }
                let key_end = TYPE_LENGTH + KEY_LENGTH;
                let iv_end = key_end + IV_LENGTH;
                Ok(Envelope {
                    envelope_type,
                    sender_public_key: Some(bytes[TYPE_LENGTH..key_end].to_vec()),
                    iv: bytes[key_end..iv_end].to_vec(),
                    sealed: bytes[iv_end..].to_vec(),
                })
            }
            TYPE_0 => {
                let min = TYPE_LENGTH + IV_LENGTH;
                if bytes.len() < min {
                    return Err(Error::MissingOrInvalid(
                        "truncated type 0 envelope".into(),
                    ));
                }
                let iv_end = TYPE_LENGTH + IV_LENGTH;
                Ok(Envelope {
                    envelope_type,
                    sender_public_key: None,
                    iv: bytes[TYPE_LENGTH..iv_end].to_vec(),
                    sealed: bytes[iv_end..].to_vec(),
                })
            }
            other => Err(Error::MissingOrInvalid(format!(
                "unknown envelope type {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    async fn crypto() -> Crypto {
        let crypto = Crypto::new(Arc::new(MemoryStorage::new()));
        crypto.init().await.unwrap();
        crypto
    }

    #[tokio::test]
    async fn operations_require_init() {
        let crypto = Crypto::new(Arc::new(MemoryStorage::new()));
        assert!(matches!(
            crypto.generate_key_pair().await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn sym_key_topic_is_hash_of_key() {
        let crypto = crypto().await;
        let sym_key = random_bytes32();
        let topic = crypto.set_sym_key(sym_key, None).await.unwrap();
        assert_eq!(topic, sha256_hex(sym_key));
        assert!(crypto.has_keys(&topic).await.unwrap());
    }

    #[tokio::test]
    async fn shared_key_is_symmetric() {
        let a = crypto().await;
        let b = crypto().await;

        let pub_a = a.generate_key_pair().await.unwrap();
        let pub_b = b.generate_key_pair().await.unwrap();

        let topic_a =
            a.generate_shared_key(&pub_a, &pub_b, None).await.unwrap();
        let topic_b =
            b.generate_shared_key(&pub_b, &pub_a, None).await.unwrap();

        // Same derived key implies the same derived topic.
        assert_eq!(topic_a, topic_b);
    }

    #[tokio::test]
    async fn type0_round_trip() {
        let crypto = crypto().await;
        let topic =
            crypto.set_sym_key(random_bytes32(), None).await.unwrap();

        let payload = r#"{"id":1,"jsonrpc":"2.0","method":"wc_sessionPing"}"#;
        let encoded = crypto
            .encode(&topic, payload, EncodeOptions::default())
            .await
            .unwrap();
        let decoded = crypto
            .decode(&topic, &encoded, DecodeOptions::default())
            .await
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn type1_round_trip_derives_shared_key() {
        let sender = crypto().await;
        let receiver = crypto().await;

        let sender_pub = sender.generate_key_pair().await.unwrap();
        let receiver_pub = receiver.generate_key_pair().await.unwrap();

        // Sender derives the shared topic and encrypts on it.
        let topic = sender
            .generate_shared_key(&sender_pub, &receiver_pub, None)
            .await
            .unwrap();
        let encoded = sender
            .encode(
                &topic,
                "hello",
                EncodeOptions {
                    envelope_type: TYPE_1,
                    sender_public_key: Some(sender_pub.clone()),
                },
            )
            .await
            .unwrap();

        // Receiver only needs its own key pair to decode.
        let decoded = receiver
            .decode(
                &topic,
                &encoded,
                DecodeOptions {
                    receiver_public_key: Some(receiver_pub),
                },
            )
            .await
            .unwrap();
        assert_eq!(decoded, "hello");
    }

    #[tokio::test]
    async fn type1_encode_without_sender_key_fails() {
        let crypto = crypto().await;
        let topic =
            crypto.set_sym_key(random_bytes32(), None).await.unwrap();
        let result = crypto
            .encode(
                &topic,
                "hello",
                EncodeOptions {
                    envelope_type: TYPE_1,
                    sender_public_key: None,
                },
            )
            .await;
        assert!(matches!(result, Err(Error::MissingOrInvalid(_))));
    }

    #[tokio::test]
    async fn corrupted_ciphertext_fails_decode() {
        let crypto = crypto().await;
        let topic =
            crypto.set_sym_key(random_bytes32(), None).await.unwrap();
        let encoded = crypto
            .encode(&topic, "payload", EncodeOptions::default())
            .await
            .unwrap();

        let mut bytes = Base64::decode_vec(&encoded).unwrap();
        // Flip one bit of the ciphertext/tag region.
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let corrupted = Base64::encode_string(&bytes);

        assert!(matches!(
            crypto
                .decode(&topic, &corrupted, DecodeOptions::default())
                .await,
            Err(Error::Aead(_))
        ));
    }

    #[tokio::test]
    async fn unknown_envelope_type_rejected() {
        let crypto = crypto().await;
        let topic =
            crypto.set_sym_key(random_bytes32(), None).await.unwrap();
        let mut bytes = vec![2u8];
        bytes.extend_from_slice(&[0u8; 40]);
        let encoded = Base64::encode_string(&bytes);
        assert!(matches!(
            crypto
                .decode(&topic, &encoded, DecodeOptions::default())
                .await,
            Err(Error::MissingOrInvalid(_))
        ));
    }
}
