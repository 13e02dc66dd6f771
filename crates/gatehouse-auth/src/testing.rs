//! Test keys and token helpers shared by unit tests.

use std::sync::LazyLock;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::RsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;

pub struct TestKey {
    pub encoding: EncodingKey,
    pub n: String,
    pub e: String,
}

impl TestKey {
    fn from_pem(pem: &str) -> Self {
        let private = RsaPrivateKey::from_pkcs8_pem(pem).unwrap();
        Self {
            encoding: EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap(),
            n: URL_SAFE_NO_PAD.encode(private.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(private.e().to_bytes_be()),
        }
    }
}

pub static IDP_KEY: LazyLock<TestKey> =
    LazyLock::new(|| TestKey::from_pem(include_str!("../tests/fixtures/idp_signing_key.pem")));

pub static ROGUE_KEY: LazyLock<TestKey> =
    LazyLock::new(|| TestKey::from_pem(include_str!("../tests/fixtures/rogue_signing_key.pem")));

/// JWKS document publishing the given keys as RS256 signing keys.
pub fn jwks_json(keys: &[(&TestKey, &str)]) -> serde_json::Value {
    let keys: Vec<_> = keys
        .iter()
        .map(|(key, kid)| {
            serde_json::json!({
                "kty": "RSA",
                "kid": kid,
                "use": "sig",
                "alg": "RS256",
                "n": key.n,
                "e": key.e,
            })
        })
        .collect();
    serde_json::json!({ "keys": keys })
}

/// Signs `claims` with RS256.
pub fn sign(key: &TestKey, kid: Option<&str>, claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = kid.map(str::to_string);
    jsonwebtoken::encode(&header, claims, &key.encoding).unwrap()
}

pub fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
