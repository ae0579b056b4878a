use uuid::Uuid;

// ============================================================================
// User Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("User {0} already exists")]
    AlreadyExists(Uuid),

    #[error("User {0} does not exist")]
    NotFound(Uuid),

    #[error("User {0} is deactivated")]
    Deactivated(Uuid),

    #[error("Email cannot be empty")]
    EmptyEmail,

    #[error("Invalid email format: {0}")]
    InvalidEmail(String),

    #[error("Name cannot be empty")]
    EmptyName,

    #[error("Unsupported command for the User aggregate: {0}")]
    UnsupportedCommand(String),
}
