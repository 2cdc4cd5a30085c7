//! Client identity towards the relay: an ed25519 seed kept in the KeyChain,
//! exposed as a `did:key` client id and used to sign the relay auth JWT.

use std::time::{SystemTime, UNIX_EPOCH};

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};

use crate::constants::CRYPTO_JWT_TTL;
use crate::utils::encode_iss;

#[derive(Debug, Clone)]
pub struct ClientKeys {
    seed: [u8; 32],
    public_key: [u8; 32],
}

impl ClientKeys {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        Self {
            seed,
            public_key: signing_key.verifying_key().to_bytes(),
        }
    }


    /// `did:key` identity announced to the relay; also the salt for
    /// deterministic subscription ids.
    pub fn client_id(&self) -> String {
        encode_iss(&self.public_key)
    }

    fn sign(&self, data: &[u8]) -> [u8; 64] {
        let signing_key = SigningKey::from_bytes(&self.seed);
        signing_key.sign(data).to_bytes()
    }

    /// EdDSA JWT the relay expects in the connection handshake. `sub` is a
    /// random per-session identifier, `aud` the relay URL.
    pub fn sign_jwt(&self, aud: &str, sub: &str) -> String {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let header = JwtHeader {
            alg: "EdDSA",
            typ: "JWT",
        };
        let payload = JwtPayload {
            iss: self.client_id(),
            sub: sub.to_string(),
            aud: aud.to_string(),
            iat,
            exp: iat + CRYPTO_JWT_TTL,
        };

        let head_payload = format!(
            "{}.{}",
            encode_segment(&header),
            encode_segment(&payload)
        );
        let signature = self.sign(head_payload.as_bytes());
        format!(
            "{head_payload}.{}",
            Base64UrlUnpadded::encode_string(&signature)
        )
    }
}

#[derive(Serialize, Deserialize)]
struct JwtHeader {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Serialize, Deserialize)]
struct JwtPayload {
    iss: String,
    sub: String,
    aud: String,
    iat: u64,
    exp: u64,
}

fn encode_segment<T: Serialize>(val: &T) -> String {
    Base64UrlUnpadded::encode_string(
        serde_json::to_string(val)
            .expect("jwt segments are plain structs")
            .as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_zero_seed() {
        let keys = ClientKeys::from_seed([0; 32]);
        assert_eq!(
            keys.client_id(),
            "did:key:z6MkiTBz1ymuepAQ4HEHYSF1H8quG5GLVVQR3djdX3mDooWp"
        );
    }

    #[test]
    fn client_id_fixed_seed() {
        let keys = ClientKeys::from_seed([
            23, 113, 199, 94, 246, 41, 119, 10, 250, 248, 253, 136, 173, 241,
            191, 149, 165, 249, 17, 42, 46, 189, 120, 175, 78, 88, 53, 83,
            254, 16, 32, 150,
        ]);
        assert_eq!(
            keys.client_id(),
            "did:key:z6MkriJMhx6cLMiwwfuJ3NCGw8C8UjB9KoVHB7QSBaBxMx3y"
        );
    }

    #[test]
    fn jwt_has_three_segments() {
        let keys = ClientKeys::from_seed([7; 32]);
        let jwt = keys.sign_jwt("https://relay.example.org", "abcd");
        assert_eq!(jwt.split('.').count(), 3);
    }
}
