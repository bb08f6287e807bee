//! Static access-key credentials for the AWS clients

use aws_credential_types::provider::{self, future, ProvideCredentials};
use aws_credential_types::Credentials;
use std::fmt;

const PROVIDER_NAME: &str = "ServiceConfig";

/// Capability to supply and refresh AWS credentials
pub trait CredentialSource: Send + Sync {
    fn credentials(&self) -> Credentials;

    /// Re-read the underlying secret material, if the source has any
    fn refresh(&self);
}

/// Fixed access/secret key pair read from the service configuration
#[derive(Clone)]
pub struct StaticCredentials {
    access_key: String,
    secret_key: String,
}

impl StaticCredentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

// Keep the secret out of logs.
impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"** redacted **")
            .finish()
    }
}

impl CredentialSource for StaticCredentials {
    fn credentials(&self) -> Credentials {
        Credentials::new(
            self.access_key.clone(),
            self.secret_key.clone(),
            None,
            None,
            PROVIDER_NAME,
        )
    }

    fn refresh(&self) {}
}

impl ProvideCredentials for StaticCredentials {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::ready(Ok::<_, provider::error::CredentialsError>(
            self.credentials(),
        ))
    }
}
