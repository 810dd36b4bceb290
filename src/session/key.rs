use crate::env;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static E164: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^\+[1-9]\d{7,14}$").expect("valid E.164 pattern"));

static SEPARATORS: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"[\s\-().]").expect("valid separator pattern"));

/// Normalize a phone number to E.164.
///
/// Accepts pre-formatted input (`+1 (555) 000-1111`), the `00` international
/// prefix, and national numbers when a country calling code is supplied.
/// Input without a `+` and without a country code is assumed to already carry
/// its country code.
pub fn normalize_phone(raw: &str, country_code: Option<&str>) -> Result<String> {
    let stripped = SEPARATORS.replace_all(raw.trim(), "");
    if stripped.is_empty() {
        return Err(GatewayError::Validation("phone number is empty".to_string()));
    }

    let candidate = if let Some(rest) = stripped.strip_prefix('+') {
        format!("+{}", rest)
    } else if let Some(rest) = stripped.strip_prefix("00") {
        format!("+{}", rest)
    } else if let Some(code) = country_code {
        let code = code.trim().trim_start_matches('+');
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(GatewayError::Validation(format!(
                "invalid country code '{}'",
                code
            )));
        }
        format!("+{}{}", code, stripped.trim_start_matches('0'))
    } else {
        format!("+{}", stripped)
    };

    if E164.is_match(&candidate) {
        Ok(candidate)
    } else {
        Err(GatewayError::Validation(format!(
            "'{}' is not a valid phone number",
            raw
        )))
    }
}

/// Identity of one session: a user and one of their phone numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub phone_number: String,
}

impl SessionKey {
    /// Build a key, normalizing the phone number.
    pub fn new(user_id: &str, phone: &str, country_code: Option<&str>) -> Result<Self> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(GatewayError::Validation("user id is empty".to_string()));
        }
        if user_id.contains(['/', '\\', ':']) || user_id.contains("..") {
            return Err(GatewayError::Validation(format!(
                "user id '{}' contains reserved characters",
                user_id
            )));
        }
        Ok(Self {
            user_id: user_id.to_string(),
            phone_number: normalize_phone(phone, country_code)?,
        })
    }

    /// Parse a session directory name `user_id-phone_number`.
    ///
    /// Only the first separator is significant since phone numbers may contain
    /// dashes. The phone part is taken verbatim.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        let (user_id, phone_number) = name.split_once(env::session::DIR_SEPARATOR)?;
        if user_id.is_empty() || phone_number.is_empty() {
            return None;
        }
        Some(Self {
            user_id: user_id.to_string(),
            phone_number: phone_number.to_string(),
        })
    }

    pub fn dir_name(&self) -> String {
        format!(
            "{}{}{}",
            self.user_id,
            env::session::DIR_SEPARATOR,
            self.phone_number
        )
    }

    pub fn remote_prefix(&self) -> String {
        env::remote_session_prefix(&self.user_id, &self.phone_number)
    }

    pub fn remote_object_key(&self, file_name: &str) -> String {
        env::remote_object_key(&self.user_id, &self.phone_number, file_name)
    }

    pub fn metadata_id(&self) -> String {
        env::metadata_document_id(&self.user_id, &self.phone_number)
    }
}

/// Canonical form `user_id:phone_number`
impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.phone_number)
    }
}
