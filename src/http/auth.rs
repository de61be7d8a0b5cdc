use crate::capabilities::CredentialVerifier;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// BasicAuthError is why a `Proxy-Authorization` header was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasicAuthError {
    Missing,
    Malformed,
    BadCredentials(String),
}

/// check_basic validates a `Proxy-Authorization: Basic ...` value and returns the user
pub fn check_basic(
    header: Option<&str>,
    verifier: &dyn CredentialVerifier,
) -> Result<String, BasicAuthError> {
    let header = header.ok_or(BasicAuthError::Missing)?.trim();

    let encoded = header
        .strip_prefix("Basic ")
        .ok_or(BasicAuthError::Malformed)?
        .trim();

    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| BasicAuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| BasicAuthError::Malformed)?;
    let (username, password) = decoded.split_once(':').ok_or(BasicAuthError::Malformed)?;

    if verifier.verify(username, password) {
        Ok(username.to_string())
    } else {
        Err(BasicAuthError::BadCredentials(username.to_string()))
    }
}
