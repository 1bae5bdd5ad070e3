//! Coarse token approximation.
//!
//! Used only where the provider did not return a usage block: pre-call
//! rate-limit estimation and the streaming path. Deliberately crude so that
//! admission decisions are deterministic and reproducible.

use crate::types::Message;

/// `len(text) / 4`, floored. Byte length, not chars.
pub fn approximate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

/// Stable string rendition of a message list for pre-call estimation. Any
/// deterministic serialization works; JSON is what we have on hand.
pub fn serialize_messages(messages: &[Message]) -> String {
    serde_json::to_string(messages).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn four_bytes_per_token_floored() {
        assert_eq!(approximate_tokens(""), 0);
        assert_eq!(approximate_tokens("abc"), 0);
        assert_eq!(approximate_tokens("abcd"), 1);
        assert_eq!(approximate_tokens("hello world"), 2);
    }

    #[test]
    fn message_serialization_is_deterministic() {
        let messages = vec![
            Message::new(Role::System, "be brief"),
            Message::new(Role::User, "hi"),
        ];
        assert_eq!(
            serialize_messages(&messages),
            serialize_messages(&messages.clone())
        );
        assert!(approximate_tokens(&serialize_messages(&messages)) > 0);
    }
}
