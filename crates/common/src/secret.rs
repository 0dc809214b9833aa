//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for credentials in configuration
//! (the Redis URL may embed a password, TURN credentials are handed to
//! clients only on join). `Debug` output of these types is redacted, so
//! any struct deriving `Debug` stays safe to log.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let credential = SecretString::from("turn-password");
//! assert!(!format!("{credential:?}").contains("turn-password"));
//! assert_eq!(credential.expose_secret(), "turn-password");
//! ```

pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:hunter2@cache:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_ice_credentials_deserialize_redacted() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct TurnServer {
            urls: String,
            username: String,
            credential: SecretString,
        }

        let json = r#"{"urls": "turn:turn.example.com:3478", "username": "u", "credential": "pw-123"}"#;
        let server: TurnServer = serde_json::from_str(json).expect("deserialize");

        assert_eq!(server.credential.expose_secret(), "pw-123");
        let debug = format!("{server:?}");
        assert!(debug.contains("turn.example.com"));
        assert!(!debug.contains("pw-123"));
    }
}
