//! S3 credentials to pbm configuration

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::backup::BackupError;
use crate::backup::pbm::PbmCli;
use crate::config::backup::PBM_CONFIG_FILE_PATH;
use crate::resources::workload::WorkloadError;

/// Credential field to pbm option key
pub const S3_PBM_OPTION_MAP: [(&str, &str); 7] = [
    ("region", "storage.s3.region"),
    ("bucket", "storage.s3.bucket"),
    ("path", "storage.s3.prefix"),
    ("access-key", "storage.s3.credentials.access-key-id"),
    ("secret-key", "storage.s3.credentials.secret-access-key"),
    ("endpoint", "storage.s3.endpointUrl"),
    ("storage-class", "storage.s3.storageClass"),
];

const CONFIG_FILE_CONTENT: &str =
    "# this file is to be left empty. Changes in this file will be ignored.\n";
const CONFIG_FILE_MODE: u32 = 0o400;

/// Resolved S3 connection info as published by the credentials provider
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Credentials {
    #[serde(flatten)]
    fields: BTreeMap<String, String>,
}

impl S3Credentials {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for S3Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Full pbm option set for the given credentials
///
/// Fields outside the translation table are ignored.
pub fn pbm_options(credentials: &S3Credentials) -> BTreeMap<String, String> {
    let mut options = BTreeMap::from([("storage.type".to_string(), "s3".to_string())]);
    for (field, key) in S3_PBM_OPTION_MAP {
        if let Some(value) = credentials.get(field) {
            options.insert(key.to_string(), value.to_string());
        }
    }
    options
}

/// Pushes credentials into pbm one option at a time
pub struct BackupConfigurator<'a> {
    pbm: &'a PbmCli,
}

impl<'a> BackupConfigurator<'a> {
    pub fn new(pbm: &'a PbmCli) -> Self {
        Self { pbm }
    }

    /// Apply every option, stopping at the first failure
    ///
    /// Options applied before a failure stay applied.
    pub async fn apply(&self, credentials: &S3Credentials) -> Result<(), BackupError> {
        self.set_config_file().await?;

        for (key, value) in pbm_options(credentials) {
            let assignment = format!("{}={}", key, value);
            if let Err(e) = self.pbm.run(&["config", "--set", &assignment]).await {
                error!("Failed to configure the PBM option: {} ({})", key, e);
                return Err(BackupError::Configuration { key });
            }
            debug!("PBM option {} set", key);
        }
        Ok(())
    }

    /// pbm requires a config file before accepting `--set`; its content is
    /// ignored.
    async fn set_config_file(&self) -> Result<(), BackupError> {
        self.pbm
            .workload()
            .push(PBM_CONFIG_FILE_PATH, CONFIG_FILE_CONTENT, CONFIG_FILE_MODE, None)
            .await?;
        match self.pbm.run(&["config", "--file", PBM_CONFIG_FILE_PATH]).await {
            Ok(_) => Ok(()),
            Err(WorkloadError::Exec { stdout, .. }) => {
                error!("Failed to set pbm config file: {}", stdout.trim());
                Err(BackupError::Configuration {
                    key: PBM_CONFIG_FILE_PATH.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
