//! The validated delivery request that drives one transfer task.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A delivery notice parsed and validated upstream.
///
/// Carries the credentials and remote path the transfer needs, plus the
/// delivery metadata the vendor quotes in its notification (kept verbatim
/// for display, never interpreted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    /// Remote data path, e.g. `oss://CP.../X101SC.../`.
    pub remote_path: String,
    /// Delivery account name.
    pub account: String,
    /// Delivery password.
    pub secret: String,
    /// Date the data was released.
    #[serde(default)]
    pub release_date: String,
    /// Date the delivery expires on the vendor side.
    #[serde(default)]
    pub expire_date: String,
    /// Total delivery size as quoted by the vendor.
    #[serde(default)]
    pub total_size: String,
    /// Number of samples in the delivery.
    #[serde(default)]
    pub sample_count: String,
    /// Comma-separated sample names.
    #[serde(default)]
    pub sample_names: String,
}

impl DeliveryRequest {
    /// Create a request from the three required fields.
    pub fn new(
        remote_path: impl Into<String>,
        account: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            remote_path: remote_path.into(),
            account: account.into(),
            secret: secret.into(),
            release_date: String::new(),
            expire_date: String::new(),
            total_size: String::new(),
            sample_count: String::new(),
            sample_names: String::new(),
        }
    }

    /// Structural validation of the required fields.
    pub fn validate(&self) -> Result<()> {
        if self.remote_path.trim().is_empty() {
            return Err(Error::validation("remote path is required"));
        }
        if self.account.trim().is_empty() {
            return Err(Error::validation("account is required"));
        }
        if self.secret.is_empty() {
            return Err(Error::validation("secret is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_complete_request() {
        let request = DeliveryRequest::new("oss://CP1/X1-Z01/", "X1-Z01-J1", "pw");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        assert!(DeliveryRequest::new("", "acct", "pw").validate().is_err());
        assert!(
            DeliveryRequest::new("oss://CP1/", " ", "pw")
                .validate()
                .is_err()
        );
        assert!(
            DeliveryRequest::new("oss://CP1/", "acct", "")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_deserialize_defaults_metadata() {
        let request: DeliveryRequest = serde_json::from_str(
            r#"{"remote_path": "oss://CP1/", "account": "acct", "secret": "pw"}"#,
        )
        .unwrap();
        assert!(request.release_date.is_empty());
        assert!(request.sample_names.is_empty());
    }
}
