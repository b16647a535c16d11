use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 30 * 60;

/// Identity claim as issued by the account service: usually a string, but
/// older tokens carry a numeric `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum IdentityClaim {
    Text(String),
    Number(i64),
}

impl IdentityClaim {
    fn into_participant_id(self) -> Option<String> {
        match self {
            Self::Text(value) => Some(value).filter(|value| !value.trim().is_empty()),
            Self::Number(value) => Some(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParticipantClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<IdentityClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<IdentityClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// Stable identity resolved from a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub participant_id: String,
}

#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        // Expiry is checked with zero leeway when present; tokens without it are accepted.
        validation.leeway = 0;
        validation.required_spec_claims.clear();

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Issue a token for local tooling and tests. Production tokens come
    /// from the account service sharing the same secret.
    pub fn issue_participant_token(&self, participant_id: &str) -> anyhow::Result<String> {
        self.issue_participant_token_at(participant_id, current_unix_timestamp()?)
    }

    fn issue_participant_token_at(
        &self,
        participant_id: &str,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = ParticipantClaims {
            sub: Some(IdentityClaim::Text(participant_id.to_string())),
            id: None,
            iat: Some(issued_at),
            exp: Some(issued_at + ACCESS_TOKEN_TTL_SECONDS),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    /// Verify signature and expiry, then resolve the participant from `sub`,
    /// falling back to `id`.
    pub fn validate_participant_token(&self, token: &str) -> anyhow::Result<Principal> {
        let claims = decode::<ParticipantClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let participant_id = claims
            .sub
            .and_then(IdentityClaim::into_participant_id)
            .or_else(|| claims.id.and_then(IdentityClaim::into_participant_id))
            .ok_or_else(|| anyhow!("access token carries neither `sub` nor `id`"))?;

        Ok(Principal { participant_id })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, JwtAccessTokenService, ACCESS_TOKEN_TTL_SECONDS};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    const TEST_SECRET: &str = "voyage_test_secret_that_is_definitely_long_enough";

    fn sign(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode")
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(JwtAccessTokenService::new("too-short").is_err());
    }

    #[test]
    fn issues_and_validates_participant_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");

        let token = service.issue_participant_token("user-42").expect("token should be issued");
        let principal = service.validate_participant_token(&token).expect("token should validate");

        assert_eq!(principal.participant_id, "user-42");
    }

    #[test]
    fn falls_back_to_id_claim_when_sub_is_absent() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");

        let text_id = sign(json!({ "id": "legacy-user", "exp": now + 60 }));
        let numeric_id = sign(json!({ "id": 981, "exp": now + 60 }));

        assert_eq!(
            service.validate_participant_token(&text_id).expect("token").participant_id,
            "legacy-user"
        );
        assert_eq!(
            service.validate_participant_token(&numeric_id).expect("token").participant_id,
            "981"
        );
    }

    #[test]
    fn rejects_tokens_without_identity() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");

        let token = sign(json!({ "sub": "", "exp": now + 60 }));

        assert!(service.validate_participant_token(&token).is_err());
    }

    #[test]
    fn rejects_tampered_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let token = service.issue_participant_token("user-42").expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(service.validate_participant_token(&tampered).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token =
            service.issue_participant_token_at("user-42", issued_at).expect("token should be issued");

        assert!(service.validate_participant_token(&token).is_err());
    }

    #[test]
    fn accepts_tokens_without_expiry() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");

        let principal = service
            .validate_participant_token(&sign(json!({ "sub": "user-42" })))
            .expect("token without exp should validate");

        assert_eq!(principal.participant_id, "user-42");
    }

    #[test]
    fn expiry_has_no_leeway_when_present() {
        let service = JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");

        assert!(service.validate_participant_token(&sign(json!({ "sub": "user-42", "exp": now - 2 }))).is_err());
        assert!(service.validate_participant_token(&sign(json!({ "sub": "user-42", "exp": now + 60 }))).is_ok());
    }
}
