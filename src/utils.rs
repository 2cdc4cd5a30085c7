use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use url::form_urlencoded;

use crate::constants::{
    DID_DELIMITER, DID_METHOD, DID_PREFIX, MULTICODEC_ED25519_BASE,
    MULTICODEC_ED25519_HEADER, URI_VERSION,
};
use crate::error::{Error, Result};
use crate::types::Relay;

/// Fields of a `wc:` pairing URI:
/// `wc:<topic>@<version>?symKey=<hex>&relay-protocol=<p>[&relay-data=<d>]`
#[derive(Debug, Clone, PartialEq)]
pub struct UriParameters {
    pub topic: String,
    pub version: u32,
    pub sym_key: [u8; 32],
    pub relay: Relay,
}

pub fn parse_uri(input: &str) -> Result<UriParameters> {
    let mut input = input.to_string();

    if input.contains("wc://") {
        input = input.replacen("wc://", "", 1);
    } else if input.contains("wc:") {
        input = input.replacen("wc:", "", 1);
    }

    let path_end = input.find('?').ok_or(Error::PathEndNotFound)?;
    let path = &input[..path_end];
    let query_string = &input[path_end + 1..];

    let required_values: Vec<&str> = path.split('@').collect();
    if required_values.len() != 2 {
        return Err(Error::InvalidUri);
    }

    let topic = parse_topic(required_values[0]);
    if topic.len() != 64 || !topic.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidUri);
    }

    let mut query_params: HashMap<String, String> = HashMap::new();
    for (key, value) in form_urlencoded::parse(query_string.as_bytes()) {
        query_params.insert(key.into(), value.into());
    }

    let sym_key_hex =
        query_params.get("symKey").ok_or(Error::SymKeyNotMentioned)?;
    let sym_key: [u8; 32] = hex::decode(sym_key_hex)?
        .try_into()
        .map_err(|_| Error::InvalidUri)?;

    Ok(UriParameters {
        topic,
        version: required_values[1].parse()?,
        sym_key,
        relay: parse_relay_params(&query_params)?,
    })
}

#[allow(clippy::manual_strip)]
fn parse_topic(topic: &str) -> String {
    if topic.starts_with("//") {
        topic[2..].to_string()
    } else {
        topic.to_string()
    }
}

fn parse_relay_params(params: &HashMap<String, String>) -> Result<Relay> {
    let protocol = params
        .get("relay-protocol")
        .ok_or(Error::RelayProtocolNotMentioned)?
        .clone();
    let data = params.get("relay-data").cloned();

    Ok(Relay { protocol, data })
}

/// Inverse of [`parse_uri`].
pub fn format_uri(topic: &str, sym_key: &[u8; 32], relay: &Relay) -> String {
    let mut uri = format!(
        "wc:{topic}@{URI_VERSION}?symKey={}&relay-protocol={}",
        hex::encode(sym_key),
        relay.protocol
    );
    if let Some(data) = &relay.data {
        uri.push_str(&format!("&relay-data={data}"));
    }
    uri
}

pub fn random_bytes32() -> [u8; 32] {
    let mut value = [0u8; 32];
    OsRng.fill_bytes(&mut value);
    value
}

pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    Sha256::digest(data.as_ref()).into()
}

pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(sha256(data))
}

pub fn unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn unix_timestamp_ms() -> Result<u128> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis())
}

/// `did:key` encoding of an ed25519 public key, used as the relay client id.
pub fn encode_iss(public_key: &[u8; 32]) -> String {
    let header = bs58::decode(MULTICODEC_ED25519_HEADER)
        .into_vec()
        .expect("static header is valid base58");

    let encoded =
        bs58::encode([header, public_key.to_vec()].concat()).into_string();
    let multicodec = format!("{MULTICODEC_ED25519_BASE}{encoded}");

    [DID_PREFIX, DID_METHOD, &multicodec].join(DID_DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_uri() {
        let result = parse_uri(
            "wc:b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee@2?relay-protocol=irn&symKey=761ab2f7f9deae2d5d18f887d2a8d812da0ec5fda0d0df8cc7ec1969832c0da2",
        )
        .unwrap();
        assert_eq!(
            result.topic,
            "b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee"
        );
        assert_eq!(result.version, 2);
        assert_eq!(
            hex::encode(result.sym_key),
            "761ab2f7f9deae2d5d18f887d2a8d812da0ec5fda0d0df8cc7ec1969832c0da2"
        );
        assert_eq!(result.relay.protocol, "irn");
        assert_eq!(result.relay.data, None);
    }

    #[test]
    fn parse_rejects_missing_sym_key() {
        let result = parse_uri(
            "wc:b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee@2?relay-protocol=irn",
        );
        assert!(matches!(result, Err(Error::SymKeyNotMentioned)));
    }

    #[test]
    fn parse_rejects_missing_relay_protocol() {
        let result = parse_uri(
            "wc:b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee@2?symKey=761ab2f7f9deae2d5d18f887d2a8d812da0ec5fda0d0df8cc7ec1969832c0da2",
        );
        assert!(matches!(result, Err(Error::RelayProtocolNotMentioned)));
    }

    #[test]
    fn parse_rejects_missing_version() {
        let result = parse_uri("wc:deadbeef?symKey=aa&relay-protocol=irn");
        assert!(matches!(result, Err(Error::InvalidUri)));
    }

    #[test]
    fn format_then_parse_round_trips() {
        let sym_key = random_bytes32();
        let topic = sha256_hex(sym_key);
        let relay = Relay {
            protocol: "irn".to_string(),
            data: None,
        };
        let uri = format_uri(&topic, &sym_key, &relay);
        let parsed = parse_uri(&uri).unwrap();
        assert_eq!(parsed.topic, topic);
        assert_eq!(parsed.sym_key, sym_key);
        assert_eq!(parsed.relay, relay);
    }

    #[test]
    fn encode_iss_known_vector() {
        // Matches the id derived by the reference client for a zero seed.
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[0u8; 32]);
        let client_id = encode_iss(&signing_key.verifying_key().to_bytes());
        assert_eq!(
            client_id,
            "did:key:z6MkiTBz1ymuepAQ4HEHYSF1H8quG5GLVVQR3djdX3mDooWp"
        );
    }
}
