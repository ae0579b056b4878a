use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::UserError;

// ============================================================================
// User Value Objects
// ============================================================================

/// A syntactically plausible email address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn parse(email: impl Into<String>) -> Result<Self, UserError> {
        let email = email.into().trim().to_string();
        if email.is_empty() {
            return Err(UserError::EmptyEmail);
        }
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(Self(email)),
            _ => Err(UserError::InvalidEmail(email)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Active,
    Deactivated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_requires_local_and_domain_part() {
        assert_eq!(Email::parse(" a@b.co ").unwrap().as_str(), "a@b.co");
        assert!(matches!(Email::parse(""), Err(UserError::EmptyEmail)));
        assert!(matches!(Email::parse("nobody"), Err(UserError::InvalidEmail(_))));
        assert!(matches!(Email::parse("@b.co"), Err(UserError::InvalidEmail(_))));
    }
}
