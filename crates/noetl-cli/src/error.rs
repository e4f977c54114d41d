//! CLI error taxonomy with exit codes.

/// CLI-facing errors. Exit codes: 1 user, 2 system, 3 validation.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Bad input: unknown path, malformed arguments, failed run.
    #[error("{0}")]
    User(String),

    /// Infrastructure problems: network, server 5xx, filesystem.
    #[error("{0}")]
    System(String),

    /// Playbook failed validation.
    #[error("{0}")]
    Validation(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::System(_) => 2,
            Self::Validation(_) => 3,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        Self::System(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::User("x".into()).exit_code(), 1);
        assert_eq!(CliError::System("x".into()).exit_code(), 2);
        assert_eq!(CliError::Validation("x".into()).exit_code(), 3);
    }
}
