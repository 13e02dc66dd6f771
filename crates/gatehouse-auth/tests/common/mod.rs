//! Mock identity provider shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use gatehouse_auth::{AuthFlow, FlowOutcome, InMemorySessionStore, RelyingPartyConfig};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::RsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CLIENT_ID: &str = "web-portal";
pub const CLIENT_SECRET: &str = "s3cret";
pub const REDIRECT_URI: &str = "https://portal.example.com/auth/callback";
pub const KID: &str = "idp-1";

pub struct SigningKey {
    encoding: EncodingKey,
    n: String,
    e: String,
}

impl SigningKey {
    fn from_pem(pem: &str) -> Self {
        let private = RsaPrivateKey::from_pkcs8_pem(pem).unwrap();
        Self {
            encoding: EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap(),
            n: URL_SAFE_NO_PAD.encode(private.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(private.e().to_bytes_be()),
        }
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(KID.to_string());
        jsonwebtoken::encode(&header, claims, &self.encoding).unwrap()
    }
}

pub static IDP_KEY: LazyLock<SigningKey> =
    LazyLock::new(|| SigningKey::from_pem(include_str!("../fixtures/idp_signing_key.pem")));

pub static ROGUE_KEY: LazyLock<SigningKey> =
    LazyLock::new(|| SigningKey::from_pem(include_str!("../fixtures/rogue_signing_key.pem")));

pub fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Keycloak-style provider served by wiremock under `/realms/acme`.
pub struct MockIdp {
    pub server: MockServer,
}

impl MockIdp {
    /// Starts the provider and publishes the signing key.
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/realms/acme/protocol/openid-connect/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{
                    "kty": "RSA",
                    "kid": KID,
                    "use": "sig",
                    "alg": "RS256",
                    "n": IDP_KEY.n,
                    "e": IDP_KEY.e,
                }]
            })))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn issuer(&self) -> String {
        format!("{}/realms/acme", self.server.uri())
    }

    pub fn endpoint(&self, suffix: &str) -> String {
        format!("{}/protocol/openid-connect/{suffix}", self.issuer())
    }

    pub fn config(&self) -> RelyingPartyConfig {
        RelyingPartyConfig::new(self.server.uri(), CLIENT_ID, REDIRECT_URI)
            .with_realm("acme")
            .with_client_secret(CLIENT_SECRET)
            .with_allow_http(true)
    }

    /// Claims of a valid ID token for `nonce`.
    pub fn claims(&self, nonce: &str) -> Value {
        let now = now();
        json!({
            "iss": self.issuer(),
            "sub": "user-1",
            "aud": CLIENT_ID,
            "exp": now + 300,
            "iat": now,
            "nonce": nonce,
            "name": "Alice Example",
            "preferred_username": "alice",
        })
    }

    /// Serves a token response for `code`, expecting `calls` exchanges.
    pub async fn mount_token(&self, code: &str, id_token: &str, calls: u64) {
        Mock::given(method("POST"))
            .and(path("/realms/acme/protocol/openid-connect/token"))
            .and(body_string_contains(format!("code={code}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "token_type": "Bearer",
                "expires_in": 300,
                "refresh_token": "refresh-1",
                "id_token": id_token,
                "scope": "openid profile email",
            })))
            .expect(calls)
            .mount(&self.server)
            .await;
    }

    /// Fails the test if the token endpoint is called at all.
    pub async fn forbid_token_calls(&self) {
        Mock::given(method("POST"))
            .and(path("/realms/acme/protocol/openid-connect/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&self.server)
            .await;
    }

    pub async fn mount_userinfo(&self, body: Value) {
        Mock::given(method("GET"))
            .and(path("/realms/acme/protocol/openid-connect/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }
}

pub async fn build_flow(config: RelyingPartyConfig) -> (Arc<AuthFlow>, Arc<InMemorySessionStore>) {
    let sessions = Arc::new(InMemorySessionStore::new(config.session_ttl));
    let flow = AuthFlow::from_config(config, sessions.clone())
        .await
        .expect("provider should resolve");
    (Arc::new(flow), sessions)
}

/// A login attempt as seen by the browser.
pub struct IssuedAttempt {
    pub state: String,
    pub nonce: String,
    pub binding: String,
    pub query: HashMap<String, String>,
}

pub fn issued_attempt(outcome: FlowOutcome) -> IssuedAttempt {
    let FlowOutcome::Redirect {
        location,
        attempt_binding: Some(binding),
    } = outcome
    else {
        panic!("expected an authorization redirect, got {outcome:?}");
    };
    let query: HashMap<String, String> = Url::parse(&location)
        .unwrap()
        .query_pairs()
        .into_owned()
        .collect();
    IssuedAttempt {
        state: query["state"].clone(),
        nonce: query["nonce"].clone(),
        binding,
        query,
    }
}
