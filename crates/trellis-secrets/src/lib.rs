//! Secrets for trellis: generate-or-reuse credentials, the root CA, secret
//! publishing, the vault lifecycle driver and External Secrets wiring

#![deny(missing_docs)]

pub mod credentials;
pub mod error;
pub mod eso;
pub mod pki;
pub mod publish;
pub mod vault;

pub use credentials::{ensure_credential, Credential, CredentialStore, FileCredentialStore};
pub use error::{Error, Result};
pub use publish::{publish_credential, PublishMode, SecretTarget};
pub use vault::{KubeVaultApi, VaultApi, VaultDriver};
