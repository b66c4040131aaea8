//! GA4GH passport/visa authorization
//!
//! Derives the set of datasets a caller may access from the bearer
//! credential. Credentials come in three shapes: a single visa token, a
//! passport token embedding visa tokens, or an opaque token that is
//! exchanged for visa tokens at the AAI userinfo endpoint. Every visa is
//! verified independently; one bad visa never fails the whole request.

mod visa;

use std::collections::HashSet;

use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

pub use visa::{
    PassportClaims, Visa, VisaClaims, VisaDocument, CONTROLLED_ACCESS_GRANTS, PASSPORT_CLAIM,
    VISA_CLAIM,
};

/// Errors raised during authorization
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no valid controlled-access visa in credential")]
    Unauthorized,
    #[error("malformed credential: {0}")]
    MalformedCredential(String),
    #[error("invalid trust material: {0}")]
    TrustMaterial(String),
    #[error("AAI endpoint error: {0}")]
    Endpoint(#[from] reqwest::Error),
}

/// Statically configured trust material and AAI endpoints
#[derive(Debug, Clone)]
pub struct TrustMaterial {
    /// PEM public key verifying passport tokens; dynamic discovery is the
    /// fallback when absent
    pub passport_pem: Option<String>,
    /// PEM public key verifying visa tokens; dynamic discovery is the
    /// fallback when absent
    pub visa_pem: Option<String>,
    /// Userinfo endpoint exchanging opaque tokens for visa tokens
    pub userinfo_endpoint: Url,
    /// OpenID configuration document used for signing-key discovery
    pub openid_configuration_url: Url,
}

/// A verification key plus the algorithms it can check
#[derive(Clone)]
struct TrustAnchor {
    key: DecodingKey,
    algorithms: Vec<Algorithm>,
}

impl TrustAnchor {
    fn from_pem(pem: &str) -> Result<Self, AuthError> {
        let bytes = pem.as_bytes();
        if let Ok(key) = DecodingKey::from_rsa_pem(bytes) {
            return Ok(Self {
                key,
                algorithms: vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512],
            });
        }
        if let Ok(key) = DecodingKey::from_ec_pem(bytes) {
            return Ok(Self {
                key,
                algorithms: vec![Algorithm::ES256, Algorithm::ES384],
            });
        }
        if let Ok(key) = DecodingKey::from_ed_pem(bytes) {
            return Ok(Self {
                key,
                algorithms: vec![Algorithm::EdDSA],
            });
        }
        Err(AuthError::TrustMaterial(
            "PEM is not an RSA, EC or Ed25519 public key".to_string(),
        ))
    }

    fn decode<C: DeserializeOwned>(&self, token: &str) -> Result<C, AuthError> {
        let mut validation = Validation::new(self.algorithms[0]);
        validation.algorithms = self.algorithms.clone();
        validation.validate_aud = false;
        decode::<C>(token, &self.key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::MalformedCredential(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct OpenIdConfiguration {
    jwks_uri: Url,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(rename = "ga4gh_passport_v1", default)]
    visa_tokens: Vec<String>,
}

/// Verifies credentials and yields the caller's authorized dataset set
#[derive(Clone)]
pub struct VisaAuthorizer {
    passport_anchor: Option<TrustAnchor>,
    visa_anchor: Option<TrustAnchor>,
    userinfo_endpoint: Url,
    openid_configuration_url: Url,
    http: reqwest::Client,
}

impl VisaAuthorizer {
    pub fn new(material: TrustMaterial) -> Result<Self, AuthError> {
        let passport_anchor = material
            .passport_pem
            .as_deref()
            .map(TrustAnchor::from_pem)
            .transpose()?;
        let visa_anchor = material
            .visa_pem
            .as_deref()
            .map(TrustAnchor::from_pem)
            .transpose()?;
        Ok(Self {
            passport_anchor,
            visa_anchor,
            userinfo_endpoint: material.userinfo_endpoint,
            openid_configuration_url: material.openid_configuration_url,
            http: reqwest::Client::new(),
        })
    }

    /// Authorize a bearer credential
    ///
    /// Returns the union of dataset ids asserted by the caller's verified
    /// controlled-access visas, or [`AuthError::Unauthorized`] when none
    /// survive verification.
    pub async fn authorize(&self, credential: &str) -> Result<HashSet<String>, AuthError> {
        let visas = self.collect_visas(credential).await?;
        let granted: Vec<&Visa> = visas.iter().filter(|v| v.is_controlled_access()).collect();
        if granted.is_empty() {
            tracing::info!("unauthorized access attempt: no valid controlled-access visas");
            return Err(AuthError::Unauthorized);
        }

        let subject = granted[0].subject.clone();
        let datasets: HashSet<String> = granted
            .iter()
            .map(|visa| visa.dataset_id().to_string())
            .collect();
        tracing::info!(
            subject = %subject,
            visas = granted.len(),
            ?datasets,
            "credential authorized"
        );
        Ok(datasets)
    }

    async fn collect_visas(&self, credential: &str) -> Result<Vec<Visa>, AuthError> {
        // exactly two separators: a compact signed token; otherwise opaque
        let tokens = if credential.matches('.').count() == 2 {
            let claims = peek_claims(credential)?;
            if claims.contains_key(VISA_CLAIM) {
                vec![credential.to_string()]
            } else {
                self.passport_visa_tokens(credential).await
            }
        } else {
            self.userinfo_visa_tokens(credential).await?
        };

        let mut visas = Vec::new();
        for token in tokens {
            match self.verify_visa(&token).await {
                Ok(claims) => visas.push(Visa::from_claims(claims)),
                Err(err) => {
                    tracing::warn!(error = %err, "dropping visa that failed verification")
                }
            }
        }
        Ok(visas)
    }

    /// Verify a passport and extract its embedded visa tokens; a passport
    /// that fails verification yields no visas rather than an error
    async fn passport_visa_tokens(&self, token: &str) -> Vec<String> {
        let decoded = match &self.passport_anchor {
            Some(anchor) => anchor.decode::<PassportClaims>(token),
            None => match self.discovered_anchor(token).await {
                Ok(anchor) => anchor.decode::<PassportClaims>(token),
                Err(err) => {
                    tracing::warn!(error = %err, "passport key discovery failed");
                    return Vec::new();
                }
            },
        };
        match decoded {
            Ok(claims) => claims.visa_tokens,
            Err(err) => {
                tracing::warn!(error = %err, "passport failed verification");
                Vec::new()
            }
        }
    }

    async fn verify_visa(&self, token: &str) -> Result<VisaClaims, AuthError> {
        match &self.visa_anchor {
            Some(anchor) => anchor.decode::<VisaClaims>(token),
            None => self.discovered_anchor(token).await?.decode::<VisaClaims>(token),
        }
    }

    /// Exchange an opaque token for visa tokens at the userinfo endpoint
    async fn userinfo_visa_tokens(&self, token: &str) -> Result<Vec<String>, AuthError> {
        let info: UserInfo = self
            .http
            .get(self.userinfo_endpoint.clone())
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(info.visa_tokens)
    }

    /// Fetch a verification key from the issuer's published JWKS
    async fn discovered_anchor(&self, token: &str) -> Result<TrustAnchor, AuthError> {
        let configuration: OpenIdConfiguration = self
            .http
            .get(self.openid_configuration_url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let jwks: jsonwebtoken::jwk::JwkSet = self
            .http
            .get(configuration.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let kid = decode_header(token).ok().and_then(|header| header.kid);
        let jwk = match &kid {
            Some(kid) => jwks.find(kid),
            None => jwks.keys.first(),
        }
        .ok_or_else(|| AuthError::MalformedCredential("no matching JWKS key".to_string()))?;

        let key = DecodingKey::from_jwk(jwk)
            .map_err(|e| AuthError::TrustMaterial(format!("unusable JWKS key: {}", e)))?;
        let algorithms = jwk
            .common
            .key_algorithm
            .and_then(|alg| alg.to_string().parse::<Algorithm>().ok())
            .map(|alg| vec![alg])
            .unwrap_or_else(|| vec![Algorithm::RS256, Algorithm::ES256]);
        Ok(TrustAnchor { key, algorithms })
    }
}

/// Decode a compact token's claims without verifying anything
///
/// Used for classification and for the export path's username, mirroring
/// what the queue listener needs before authorization runs.
pub fn peek_claims(
    token: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, AuthError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::MalformedCredential("not a compact token".to_string()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::MalformedCredential("claims are not base64url".to_string()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|_| AuthError::MalformedCredential("claims are not JSON".to_string()))?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| AuthError::MalformedCredential("claims are not an object".to_string()))
}

/// The unverified `sub` claim of a compact token
pub fn subject(token: &str) -> Result<String, AuthError> {
    peek_claims(token)?
        .get("sub")
        .and_then(|sub| sub.as_str())
        .map(str::to_string)
        .ok_or_else(|| AuthError::MalformedCredential("missing sub claim".to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    /// Deterministic Ed25519 test keypair as (PKCS#8 private, SPKI public) PEM
    fn test_keypair(seed: u8) -> (String, String) {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
        let verifying = signing.verifying_key();

        let mut pkcs8 = vec![
            0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04,
            0x22, 0x04, 0x20,
        ];
        pkcs8.extend_from_slice(&signing.to_bytes());
        let mut spki = vec![
            0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
        ];
        spki.extend_from_slice(verifying.to_bytes().as_ref());

        (
            pem::encode(&pem::Pem::new("PRIVATE KEY", pkcs8)),
            pem::encode(&pem::Pem::new("PUBLIC KEY", spki)),
        )
    }

    fn sign(private_pem: &str, claims: &serde_json::Value) -> String {
        let key = jsonwebtoken::EncodingKey::from_ed_pem(private_pem.as_bytes()).unwrap();
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::EdDSA),
            claims,
            &key,
        )
        .unwrap()
    }

    fn visa_token(private_pem: &str, visa_type: &str, value: &str) -> String {
        sign(
            private_pem,
            &serde_json::json!({
                "sub": "user@elixir.example.org",
                "iss": "https://aai.example.org",
                "exp": 4102444800u64,
                "ga4gh_visa_v1": {
                    "type": visa_type,
                    "value": value,
                    "source": "https://ega.example.org",
                    "by": "dac",
                    "asserted": 1700000000u64,
                }
            }),
        )
    }

    fn authorizer(passport_pem: Option<&str>, visa_pem: Option<&str>) -> VisaAuthorizer {
        VisaAuthorizer::new(TrustMaterial {
            passport_pem: passport_pem.map(str::to_string),
            visa_pem: visa_pem.map(str::to_string),
            // never contacted by these tests
            userinfo_endpoint: Url::parse("http://localhost:9/userinfo").unwrap(),
            openid_configuration_url: Url::parse(
                "http://localhost:9/.well-known/openid-configuration",
            )
            .unwrap(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_visa_token_grants_dataset() {
        let (private_pem, public_pem) = test_keypair(7);
        let token = visa_token(
            &private_pem,
            CONTROLLED_ACCESS_GRANTS,
            "https://ega.example.org/datasets/EGAD001/",
        );

        let datasets = authorizer(None, Some(&public_pem))
            .authorize(&token)
            .await
            .unwrap();
        assert_eq!(datasets, ["EGAD001".to_string()].into());
    }

    #[tokio::test]
    async fn test_wrong_visa_type_is_unauthorized() {
        let (private_pem, public_pem) = test_keypair(7);
        let token = visa_token(
            &private_pem,
            "AffiliationAndRole",
            "https://ega.example.org/datasets/EGAD001",
        );

        let err = authorizer(None, Some(&public_pem))
            .authorize(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn test_forged_visa_is_unauthorized() {
        let (forger_private, _) = test_keypair(13);
        let (_, trusted_public) = test_keypair(7);
        let token = visa_token(
            &forger_private,
            CONTROLLED_ACCESS_GRANTS,
            "https://ega.example.org/datasets/EGAD001",
        );

        let err = authorizer(None, Some(&trusted_public))
            .authorize(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn test_passport_with_mixed_visas() {
        let (private_pem, public_pem) = test_keypair(7);
        let (forger_private, _) = test_keypair(13);

        let good = visa_token(
            &private_pem,
            CONTROLLED_ACCESS_GRANTS,
            "https://ega.example.org/datasets/EGAD001",
        );
        let other_type = visa_token(
            &private_pem,
            "AcceptedTermsAndPolicies",
            "https://ega.example.org/policies/1",
        );
        let forged = visa_token(
            &forger_private,
            CONTROLLED_ACCESS_GRANTS,
            "https://ega.example.org/datasets/EGAD999",
        );

        let passport = sign(
            &private_pem,
            &serde_json::json!({
                "sub": "user@elixir.example.org",
                "exp": 4102444800u64,
                "ga4gh_passport_v1": [good, other_type, forged],
            }),
        );

        // the forged visa is dropped silently; the good one still grants
        let datasets = authorizer(Some(&public_pem), Some(&public_pem))
            .authorize(&passport)
            .await
            .unwrap();
        assert_eq!(datasets, ["EGAD001".to_string()].into());
    }

    #[tokio::test]
    async fn test_passport_with_no_visas_is_unauthorized() {
        let (private_pem, public_pem) = test_keypair(7);
        let passport = sign(
            &private_pem,
            &serde_json::json!({
                "sub": "user@elixir.example.org",
                "exp": 4102444800u64,
                "ga4gh_passport_v1": [],
            }),
        );

        let err = authorizer(Some(&public_pem), Some(&public_pem))
            .authorize(&passport)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
    }

    #[test]
    fn test_subject_peek() {
        let (private_pem, _) = test_keypair(7);
        let token = visa_token(
            &private_pem,
            CONTROLLED_ACCESS_GRANTS,
            "https://ega.example.org/datasets/EGAD001",
        );
        assert_eq!(subject(&token).unwrap(), "user@elixir.example.org");
        assert!(subject("opaque-token").is_err());
    }
}
