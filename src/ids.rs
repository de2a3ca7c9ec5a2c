// 标识符与令牌生成，统一使用随机 UUID。
use uuid::Uuid;

/// New entity identifier: canonical dashed UUIDv4.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// One-shot auth code handed from a browser login to a local agent process.
pub fn new_auth_code() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Opaque token carried by a `request_claude_session` task so a headless
/// worker can signal completion without proving its identity.
pub fn new_session_request_token() -> String {
    format!("asr_{}", Uuid::new_v4().simple())
}

/// Request correlation id, 24 hex chars.
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(24).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_canonical_uuid() {
        let id = new_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn session_request_token_shape() {
        let token = new_session_request_token();
        assert!(token.starts_with("asr_"));
        assert_eq!(token.len(), 4 + 32);
        assert!(token[4..].chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn request_id_is_24_hex() {
        let id = new_request_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
