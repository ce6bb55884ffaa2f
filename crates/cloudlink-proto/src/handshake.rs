//! One-line handshakes written on relay TLS connections
//!
//! Every outbound connection to the relay starts with a single
//! newline-terminated identity line. A callback answer carries the bare push
//! registration id; a standing pool slot carries `reverse:<registrationId>`.
//! The relay replies with one line when it claims the connection.

use thiserror::Error;

const REVERSE_PREFIX: &str = "reverse:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Empty handshake line")]
    Empty,

    #[error("Handshake line longer than {0} bytes")]
    TooLong(usize),

    #[error("Registration id must not contain line breaks")]
    InvalidRegistrationId,
}

/// Identity line sent by this server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Answer to a relay `callback` push message
    Callback { registration_id: String },
    /// Idle capacity offered to the relay
    Reverse { registration_id: String },
}

impl Handshake {
    pub fn callback(registration_id: impl Into<String>) -> Result<Self, HandshakeError> {
        let registration_id = validate_id(registration_id.into())?;
        Ok(Self::Callback { registration_id })
    }

    pub fn reverse(registration_id: impl Into<String>) -> Result<Self, HandshakeError> {
        let registration_id = validate_id(registration_id.into())?;
        Ok(Self::Reverse { registration_id })
    }

    pub fn registration_id(&self) -> &str {
        match self {
            Self::Callback { registration_id } | Self::Reverse { registration_id } => {
                registration_id
            }
        }
    }

    /// Wire form, including the trailing newline
    pub fn to_line(&self) -> String {
        match self {
            Self::Callback { registration_id } => format!("{}\n", registration_id),
            Self::Reverse { registration_id } => format!("{}{}\n", REVERSE_PREFIX, registration_id),
        }
    }

    /// Parse a handshake line as the relay sees it
    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let line = trim_line(line);
        if line.len() > crate::MAX_LINE_LENGTH {
            return Err(HandshakeError::TooLong(crate::MAX_LINE_LENGTH));
        }

        match line.strip_prefix(REVERSE_PREFIX) {
            Some(id) => Self::reverse(id),
            None => Self::callback(line),
        }
    }
}

/// Validate the relay's claim (or callback acknowledgement) line and return
/// its trimmed contents.
pub fn parse_claim(line: &str) -> Result<&str, HandshakeError> {
    if line.len() > crate::MAX_LINE_LENGTH {
        return Err(HandshakeError::TooLong(crate::MAX_LINE_LENGTH));
    }
    let claim = trim_line(line);
    if claim.is_empty() {
        return Err(HandshakeError::Empty);
    }
    Ok(claim)
}

fn trim_line(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn validate_id(id: String) -> Result<String, HandshakeError> {
    if id.is_empty() {
        return Err(HandshakeError::Empty);
    }
    if id.contains(['\r', '\n']) {
        return Err(HandshakeError::InvalidRegistrationId);
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_lines() {
        let callback = Handshake::callback("abc123").unwrap();
        assert_eq!(callback.to_line(), "abc123\n");

        let reverse = Handshake::reverse("abc123").unwrap();
        assert_eq!(reverse.to_line(), "reverse:abc123\n");
        assert_eq!(reverse.registration_id(), "abc123");
    }

    #[test]
    fn test_parse_keeps_colons_in_push_tokens() {
        let parsed = Handshake::parse("fcm:APA91bXyz\n").unwrap();
        assert_eq!(parsed, Handshake::callback("fcm:APA91bXyz").unwrap());

        let parsed = Handshake::parse("reverse:fcm:APA91bXyz\r\n").unwrap();
        assert_eq!(parsed, Handshake::reverse("fcm:APA91bXyz").unwrap());
    }

    #[test]
    fn test_invalid_registration_ids() {
        assert_eq!(Handshake::callback(""), Err(HandshakeError::Empty));
        assert_eq!(
            Handshake::reverse("a\nb"),
            Err(HandshakeError::InvalidRegistrationId)
        );
        assert_eq!(Handshake::parse("reverse:\n"), Err(HandshakeError::Empty));
    }

    #[test]
    fn test_parse_claim() {
        assert_eq!(parse_claim("ok\r\n").unwrap(), "ok");
        assert_eq!(parse_claim("\n"), Err(HandshakeError::Empty));
        let long = "x".repeat(crate::MAX_LINE_LENGTH + 1);
        assert!(matches!(parse_claim(&long), Err(HandshakeError::TooLong(_))));
    }
}
