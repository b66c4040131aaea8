use serde::Deserialize;

/// The only visa type that confers dataset access
pub const CONTROLLED_ACCESS_GRANTS: &str = "ControlledAccessGrants";

/// Claim key marking a token as a single visa rather than a passport
pub const VISA_CLAIM: &str = "ga4gh_visa_v1";
/// Claim key carrying the embedded visa tokens of a passport
pub const PASSPORT_CLAIM: &str = "ga4gh_passport_v1";

/// The `ga4gh_visa_v1` claim document
#[derive(Debug, Clone, Deserialize)]
pub struct VisaDocument {
    #[serde(rename = "type")]
    pub visa_type: String,
    pub value: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub by: Option<String>,
    #[serde(default)]
    pub asserted: Option<i64>,
}

/// Claims of a visa token
#[derive(Debug, Clone, Deserialize)]
pub struct VisaClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(rename = "ga4gh_visa_v1")]
    pub visa: VisaDocument,
}

/// Claims of a passport token
#[derive(Debug, Clone, Deserialize)]
pub struct PassportClaims {
    #[serde(rename = "ga4gh_passport_v1", default)]
    pub visa_tokens: Vec<String>,
}

/// A verified authorization assertion, constructed per request and never
/// persisted
#[derive(Debug, Clone)]
pub struct Visa {
    pub subject: String,
    pub visa_type: String,
    pub value: String,
}

impl Visa {
    pub fn from_claims(claims: VisaClaims) -> Self {
        Self {
            subject: claims.sub.unwrap_or_default(),
            visa_type: claims.visa.visa_type,
            value: claims.visa.value,
        }
    }

    pub fn is_controlled_access(&self) -> bool {
        self.visa_type.eq_ignore_ascii_case(CONTROLLED_ACCESS_GRANTS)
    }

    /// The dataset identifier: the last path segment of the visa value,
    /// after stripping a trailing slash
    pub fn dataset_id(&self) -> &str {
        let value = self.value.trim_end_matches('/');
        value.rsplit('/').next().unwrap_or(value)
    }
}
