use crate::error::GenerationError;
use crate::logging::LogSink;
use crate::persistence::PersistenceGateway;

const COMPONENT: &str = "credential";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialVerdict {
    /// The service accepted the key.
    Verified,
    /// Validation failed but the key was kept; holds the failure message.
    SavedUnverified(String),
}

impl CredentialVerdict {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Decide what a validation result means for storing the key.
pub fn judge_credential(
    validation: Result<(), GenerationError>,
    allow_unverified: bool,
) -> Result<CredentialVerdict, GenerationError> {
    match validation {
        Ok(()) => Ok(CredentialVerdict::Verified),
        Err(err) if allow_unverified => Ok(CredentialVerdict::SavedUnverified(err.to_string())),
        Err(err) => Err(err),
    }
}

/// Judge `validation` for `secret` and persist the key when the verdict allows it.
pub fn store_credential(
    gateway: &dyn PersistenceGateway,
    sink: &dyn LogSink,
    secret: &str,
    validation: Result<(), GenerationError>,
    allow_unverified: bool,
) -> Result<CredentialVerdict, GenerationError> {
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(GenerationError::CredentialMissing);
    }

    let verdict = judge_credential(validation, allow_unverified).map_err(|err| {
        sink.error(COMPONENT, format!("API key rejected: {err}"));
        err
    })?;
    gateway.save_credential(secret)?;

    match &verdict {
        CredentialVerdict::Verified => sink.info(COMPONENT, "API key verified and saved".into()),
        CredentialVerdict::SavedUnverified(reason) => sink.warn(
            COMPONENT,
            format!("API key saved without verification: {reason}"),
        ),
    }
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogLevel, VecLogSink};
    use crate::persistence::MemoryGateway;

    #[test]
    fn accepted_key_is_verified_and_saved() {
        let gateway = MemoryGateway::new();
        let sink = VecLogSink::new();
        let verdict = store_credential(&gateway, &sink, " sk-live ", Ok(()), false).unwrap();
        assert_eq!(verdict, CredentialVerdict::Verified);
        assert_eq!(gateway.load_credential().unwrap().as_deref(), Some("sk-live"));
    }

    #[test]
    fn rejected_key_is_kept_when_unverified_keys_are_allowed() {
        let gateway = MemoryGateway::new();
        let sink = VecLogSink::new();
        let verdict = store_credential(
            &gateway,
            &sink,
            "sk-bad",
            Err(GenerationError::InvalidCredential("401".into())),
            true,
        )
        .unwrap();
        assert!(!verdict.is_verified());
        assert_eq!(gateway.load_credential().unwrap().as_deref(), Some("sk-bad"));
        assert_eq!(sink.messages_at(LogLevel::Warn).len(), 1);
    }

    #[test]
    fn rejected_key_is_discarded_otherwise() {
        let gateway = MemoryGateway::new();
        let sink = VecLogSink::new();
        let err = store_credential(
            &gateway,
            &sink,
            "sk-bad",
            Err(GenerationError::InvalidCredential("401".into())),
            false,
        )
        .unwrap_err();
        assert!(err.is_credential_problem());
        assert_eq!(gateway.load_credential().unwrap(), None);
    }

    #[test]
    fn blank_key_is_missing() {
        let gateway = MemoryGateway::new();
        let err = store_credential(&gateway, &VecLogSink::new(), "   ", Ok(()), true).unwrap_err();
        assert!(matches!(err, GenerationError::CredentialMissing));
    }
}
