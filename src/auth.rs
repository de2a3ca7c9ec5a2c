// 鉴权辅助：JWT 签发校验、口令散列与凭证提取。
use anyhow::{anyhow, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

const INTERACTIVE_TOKEN_TTL_HOURS: i64 = 24;
const AGENT_TOKEN_TTL_DAYS: i64 = 90;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<bool>,
}

/// Process-wide HS256 signing keys, built once at startup. Falls back to a
/// random 32-byte key when no secret is configured, so unsigned restarts
/// invalidate outstanding tokens.
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        let secret = secret.trim();
        if !secret.is_empty() {
            return Self {
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
            };
        }
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self {
            encoding: EncodingKey::from_secret(&key),
            decoding: DecodingKey::from_secret(&key),
        }
    }

    /// 24-hour interactive token.
    pub fn mint(&self, user_id: &str, username: &str) -> Result<String> {
        self.mint_with(user_id, username, Duration::hours(INTERACTIVE_TOKEN_TTL_HOURS), None)
    }

    /// 90-day token for long-lived agent processes.
    pub fn mint_agent(&self, user_id: &str, username: &str) -> Result<String> {
        self.mint_with(
            user_id,
            username,
            Duration::days(AGENT_TOKEN_TTL_DAYS),
            Some(true),
        )
    }

    fn mint_with(
        &self,
        user_id: &str,
        username: &str,
        ttl: Duration,
        agent: Option<bool>,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            agent,
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|err| anyhow!(err))
    }

    pub fn parse(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|err| anyhow!(err))?;
        Ok(data.claims)
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    let trimmed = password.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("password is empty"));
    }
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(trimmed.as_bytes(), &salt)
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(hash.to_string())
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.trim().as_bytes(), &parsed)
        .is_ok()
}

/// 3-30 chars of letters, digits, underscore, dash.
pub fn valid_username(username: &str) -> bool {
    let len = username.chars().count();
    (3..=30).contains(&len)
        && username
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

/// Returns a rejection message, or `None` when the password is acceptable.
pub fn validate_password(password: &str) -> Option<&'static str> {
    if password.len() < 6 {
        return Some("password must be at least 6 characters");
    }
    if !password.chars().any(|ch| ch.is_uppercase()) {
        return Some("password must contain at least one uppercase letter");
    }
    if !password
        .chars()
        .any(|ch| !ch.is_alphanumeric())
    {
        return Some("password must contain at least one special character");
    }
    None
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?;
    let text = value.to_str().ok()?.trim();
    if let Some(prefix) = text.get(..7) {
        if prefix.eq_ignore_ascii_case("bearer ") {
            if let Some(raw) = text.get(7..) {
                let cleaned = raw.trim();
                if !cleaned.is_empty() {
                    return Some(cleaned.to_string());
                }
            }
        }
    }
    None
}

pub fn extract_api_key_header(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("x-api-key")?;
    let text = value.to_str().ok()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_round_trip() {
        let keys = JwtKeys::new("test-secret");
        let token = keys.mint("u1", "alice").expect("mint");
        let claims = keys.parse(&token).expect("parse");
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.agent, None);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn agent_token_carries_marker_and_long_ttl() {
        let keys = JwtKeys::new("test-secret");
        let token = keys.mint_agent("u1", "alice").expect("mint");
        let claims = keys.parse(&token).expect("parse");
        assert_eq!(claims.agent, Some(true));
        let ttl_days = (claims.exp - claims.iat) / 86_400;
        assert_eq!(ttl_days, 90);
    }

    #[test]
    fn foreign_signature_rejected() {
        let keys = JwtKeys::new("secret-a");
        let other = JwtKeys::new("secret-b");
        let token = keys.mint("u1", "alice").expect("mint");
        assert!(other.parse(&token).is_err());
    }

    #[test]
    fn random_key_when_unconfigured() {
        let keys = JwtKeys::new("");
        let other = JwtKeys::new("");
        let token = keys.mint("u1", "alice").expect("mint");
        assert!(keys.parse(&token).is_ok());
        assert!(other.parse(&token).is_err());
    }

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("Sup3r-secret").expect("hash");
        assert!(verify_password(&hash, "Sup3r-secret"));
        assert!(!verify_password(&hash, "wrong"));
        assert!(!verify_password("not-a-hash", "Sup3r-secret"));
    }

    #[test]
    fn username_rules() {
        assert!(valid_username("abc"));
        assert!(valid_username("user_name-42"));
        assert!(!valid_username("ab"));
        assert!(!valid_username(&"x".repeat(31)));
        assert!(!valid_username("has space"));
        assert!(!valid_username("héllo"));
    }

    #[test]
    fn password_rules() {
        assert!(validate_password("short").is_some());
        assert!(validate_password("lowercase-only1").is_some());
        assert!(validate_password("NoSpecial1").is_some());
        assert!(validate_password("Good-pass1").is_none());
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer_token(&headers), Some("abc123".to_string()));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(extract_bearer_token(&headers), Some("xyz".to_string()));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn api_key_header_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_api_key_header(&headers), None);
        headers.insert("x-api-key", HeaderValue::from_static("  key-1  "));
        assert_eq!(extract_api_key_header(&headers), Some("key-1".to_string()));
    }
}
