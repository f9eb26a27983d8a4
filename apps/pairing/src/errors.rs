use thiserror::Error;

/// Outcome of a failed pairing operation.
///
/// Every variant except `Internal` is an expected per-request result; the
/// calling layer maps [`PairingError::code`] to its own response shape.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("A pairing code is required")]
    MissingCode,

    #[error("Pairing not found")]
    NotFound,

    #[error("Pairing belongs to another user")]
    Forbidden,

    #[error("Pairing has already been completed")]
    AlreadyPaired,

    #[error("Pairing has expired")]
    Expired,

    #[error("Pairing code is incorrect")]
    InvalidCode,

    #[error("Too many incorrect attempts")]
    TooManyAttempts,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PairingError {
    /// Stable machine-readable code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            PairingError::MissingCode => "missing_code",
            PairingError::NotFound => "pairing_not_found",
            PairingError::Forbidden => "forbidden",
            PairingError::AlreadyPaired => "already_paired",
            PairingError::Expired => "expired",
            PairingError::InvalidCode => "invalid_code",
            PairingError::TooManyAttempts => "too_many_attempts",
            PairingError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(PairingError::MissingCode.code(), "missing_code");
        assert_eq!(PairingError::NotFound.code(), "pairing_not_found");
        assert_eq!(PairingError::Forbidden.code(), "forbidden");
        assert_eq!(PairingError::AlreadyPaired.code(), "already_paired");
        assert_eq!(PairingError::Expired.code(), "expired");
        assert_eq!(PairingError::InvalidCode.code(), "invalid_code");
        assert_eq!(PairingError::TooManyAttempts.code(), "too_many_attempts");
    }

    #[test]
    fn test_internal_errors_hide_details_behind_code() {
        let err = PairingError::from(anyhow::anyhow!("connection refused"));
        assert_eq!(err.code(), "internal_error");
    }
}
