//! Client identity presented to the TIDAL authorization server.
//!
//! The `client_id` is extracted from the official Android application and
//! acts as a static trust anchor. The `client_unique_key` identifies the
//! device. Neither is validated for authenticity here; they are only checked
//! to be present and well-formed.
//!
//! # Secrets File
//!
//! ```toml
//! client_id = "your_client_id"
//! # Optional: derived from the machine id when absent.
//! client_unique_key = "0123456789abcdef"
//! ```

use std::{fs, path::Path};

use serde::Deserialize;
use uuid::Uuid;
use veil::Redact;

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq, Hash, Redact)]
pub struct ClientIdentity {
    client_id: String,

    #[redact]
    client_unique_key: String,
}

/// On-disk form of the identity.
#[derive(Deserialize)]
struct Secrets {
    client_id: String,
    client_unique_key: Option<String>,
}

impl ClientIdentity {
    /// Prevent out-of-memory condition: secrets files should be small.
    const MAX_FILE_SIZE: u64 = 1024;

    /// Length of a derived `client_unique_key` in hex characters.
    const UNIQUE_KEY_LEN: usize = 16;

    /// Creates an identity from externally supplied strings.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if either field is empty or contains
    /// whitespace.
    pub fn new(client_id: impl Into<String>, client_unique_key: impl Into<String>) -> Result<Self> {
        let identity = Self {
            client_id: client_id.into(),
            client_unique_key: client_unique_key.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Creates an identity whose `client_unique_key` is derived from the
    /// machine id, so it stays the same across restarts.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `client_id` is malformed.
    pub fn with_machine_key(client_id: impl Into<String>) -> Result<Self> {
        Self::new(client_id, Self::machine_key())
    }

    /// Loads the identity from a TOML secrets file.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the file cannot be read, is too large, is
    /// not valid TOML, or contains a malformed identity.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let attributes = fs::metadata(path)?;
        if attributes.len() > Self::MAX_FILE_SIZE {
            return Err(Error::configuration(format!(
                "{} is too large",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let secrets: Secrets = toml::from_str(&contents)?;

        match secrets.client_unique_key {
            Some(key) => Self::new(secrets.client_id, key),
            None => Self::with_machine_key(secrets.client_id),
        }
    }

    /// Checks that both fields are usable as query and form parameters.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first malformed field.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("client_id", &self.client_id),
            ("client_unique_key", &self.client_unique_key),
        ] {
            if value.is_empty() {
                return Err(Error::configuration(format!("{name} is empty")));
            }
            if value.chars().any(char::is_whitespace) {
                return Err(Error::configuration(format!(
                    "{name} contains whitespace"
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn client_unique_key(&self) -> &str {
        &self.client_unique_key
    }

    fn machine_key() -> String {
        let uuid = match machine_uid::get() {
            Ok(machine_id) => {
                let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"tidal.com");
                Uuid::new_v5(&namespace, machine_id.as_bytes())
            }
            Err(e) => {
                warn!("could not get machine id, using random client unique key: {e}");
                Uuid::new_v4()
            }
        };

        let mut key = uuid.simple().to_string();
        key.truncate(Self::UNIQUE_KEY_LEN);
        key
    }
}
