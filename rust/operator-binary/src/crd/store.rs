//! Meta store and state store backends. Both are unions modeled as structs with optional
//! members, exactly one of which must be set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::schemars::{self, JsonSchema};
use strum::{Display, IntoStaticStr};

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdCredentials {
    pub secret_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_key_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_key_ref: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaStoreBackendEtcd {
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<EtcdCredentials>,

    /// Deprecated, use `credentials.secretName`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaStoreBackendSqlite {
    pub path: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCredentials {
    pub secret_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_key_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_key_ref: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaStoreBackendDatabase {
    pub credentials: DatabaseCredentials,
    pub host: String,
    pub port: u32,
    pub database: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaStoreBackend {
    /// Keep the metadata in the memory of the meta process. Only one meta replica is
    /// allowed with this backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<MetaStoreBackendEtcd>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<MetaStoreBackendSqlite>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<MetaStoreBackendDatabase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgresql: Option<MetaStoreBackendDatabase>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    Eq,
    IntoStaticStr,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum MetaStoreBackendType {
    Memory,
    Etcd,
    SQLite,
    MySQL,
    PostgreSQL,
    #[default]
    Unknown,
}

impl MetaStoreBackend {
    /// The backends that are set. A valid spec has exactly one.
    pub fn selected(&self) -> Vec<MetaStoreBackendType> {
        let mut selected = Vec::new();
        if self.memory.unwrap_or(false) {
            selected.push(MetaStoreBackendType::Memory);
        }
        if self.etcd.is_some() {
            selected.push(MetaStoreBackendType::Etcd);
        }
        if self.sqlite.is_some() {
            selected.push(MetaStoreBackendType::SQLite);
        }
        if self.mysql.is_some() {
            selected.push(MetaStoreBackendType::MySQL);
        }
        if self.postgresql.is_some() {
            selected.push(MetaStoreBackendType::PostgreSQL);
        }
        selected
    }

    pub fn backend_type(&self) -> MetaStoreBackendType {
        match self.selected().as_slice() {
            [single] => *single,
            _ => MetaStoreBackendType::Unknown,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.backend_type() == MetaStoreBackendType::Memory
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinioCredentials {
    pub secret_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_key_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_key_ref: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreBackendMinio {
    #[serde(default)]
    pub credentials: MinioCredentials,
    pub endpoint: String,
    pub bucket: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Credentials {
    /// Use the credentials of the pod's service account (IRSA) instead of a secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_service_account: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key_ref: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreBackendS3 {
    #[serde(default)]
    pub credentials: S3Credentials,
    pub bucket: String,

    #[serde(default)]
    pub region: String,

    /// Custom endpoint of an S3 compatible service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_workload_identity: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_credentials_key_ref: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreBackendGcs {
    #[serde(default)]
    pub credentials: GcsCredentials,
    pub bucket: String,

    #[serde(default)]
    pub root: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyCredentials {
    #[serde(default)]
    pub secret_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_secret_ref: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreBackendAliyunOss {
    #[serde(default)]
    pub credentials: SecretKeyCredentials,
    pub bucket: String,

    #[serde(default)]
    pub root: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default)]
    pub internal_endpoint: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureBlobCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_key_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_service_account: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreBackendAzureBlob {
    #[serde(default)]
    pub credentials: AzureBlobCredentials,
    pub container: String,

    #[serde(default)]
    pub root: String,
    pub endpoint: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreBackendHdfs {
    pub name_node: String,

    #[serde(default)]
    pub root: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreBackendLocalDisk {
    pub root: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreBackendHuaweiCloudObs {
    #[serde(default)]
    pub credentials: SecretKeyCredentials,
    pub bucket: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStoreBackend {
    /// Directory of the state store inside the bucket or root.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_directory: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_disk: Option<StateStoreBackendLocalDisk>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minio: Option<StateStoreBackendMinio>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<StateStoreBackendS3>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<StateStoreBackendGcs>,

    #[serde(default, rename = "aliyunOSS", skip_serializing_if = "Option::is_none")]
    pub aliyun_oss: Option<StateStoreBackendAliyunOss>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_blob: Option<StateStoreBackendAzureBlob>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdfs: Option<StateStoreBackendHdfs>,

    #[serde(default, rename = "webhdfs", skip_serializing_if = "Option::is_none")]
    pub web_hdfs: Option<StateStoreBackendHdfs>,

    #[serde(default, rename = "huaweiCloudOBS", skip_serializing_if = "Option::is_none")]
    pub huawei_cloud_obs: Option<StateStoreBackendHuaweiCloudObs>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    Eq,
    IntoStaticStr,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum StateStoreBackendType {
    Memory,
    LocalDisk,
    MinIO,
    S3,
    GCS,
    AliyunOSS,
    AzureBlob,
    HDFS,
    WebHDFS,
    HuaweiCloudOBS,
    #[default]
    Unknown,
}

impl StateStoreBackend {
    /// The backends that are set. A valid spec has exactly one.
    pub fn selected(&self) -> Vec<StateStoreBackendType> {
        let candidates = [
            (self.memory.unwrap_or(false), StateStoreBackendType::Memory),
            (self.local_disk.is_some(), StateStoreBackendType::LocalDisk),
            (self.minio.is_some(), StateStoreBackendType::MinIO),
            (self.s3.is_some(), StateStoreBackendType::S3),
            (self.gcs.is_some(), StateStoreBackendType::GCS),
            (self.aliyun_oss.is_some(), StateStoreBackendType::AliyunOSS),
            (self.azure_blob.is_some(), StateStoreBackendType::AzureBlob),
            (self.hdfs.is_some(), StateStoreBackendType::HDFS),
            (self.web_hdfs.is_some(), StateStoreBackendType::WebHDFS),
            (
                self.huawei_cloud_obs.is_some(),
                StateStoreBackendType::HuaweiCloudOBS,
            ),
        ];
        candidates
            .into_iter()
            .filter_map(|(set, backend)| set.then_some(backend))
            .collect()
    }

    pub fn backend_type(&self) -> StateStoreBackendType {
        match self.selected().as_slice() {
            [single] => *single,
            _ => StateStoreBackendType::Unknown,
        }
    }

    /// The root path inside the backend, for the backends that have one.
    pub fn root(&self) -> Option<&str> {
        let root = if let Some(gcs) = &self.gcs {
            &gcs.root
        } else if let Some(oss) = &self.aliyun_oss {
            &oss.root
        } else if let Some(azblob) = &self.azure_blob {
            &azblob.root
        } else if let Some(hdfs) = &self.hdfs {
            &hdfs.root
        } else if let Some(webhdfs) = &self.web_hdfs {
            &webhdfs.root
        } else if let Some(local) = &self.local_disk {
            &local.root
        } else {
            return None;
        };
        Some(root.as_str())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("memory: true", MetaStoreBackendType::Memory)]
    #[case("etcd:\n  endpoint: etcd:2388", MetaStoreBackendType::Etcd)]
    #[case("sqlite:\n  path: /data/meta.db", MetaStoreBackendType::SQLite)]
    #[case("memory: false", MetaStoreBackendType::Unknown)]
    #[case("{}", MetaStoreBackendType::Unknown)]
    fn test_meta_store_backend_type(#[case] input: &str, #[case] expected: MetaStoreBackendType) {
        let backend: MetaStoreBackend = serde_yaml::from_str(input).expect("illegal test input");
        assert_eq!(backend.backend_type(), expected);
    }

    #[test]
    fn test_meta_store_multiple_backends() {
        let backend: MetaStoreBackend = serde_yaml::from_str(indoc! {"
            memory: true
            etcd:
              endpoint: etcd:2388
        "})
        .expect("illegal test input");

        assert_eq!(backend.selected().len(), 2);
        assert_eq!(backend.backend_type(), MetaStoreBackendType::Unknown);
    }

    #[test]
    fn test_state_store_backend_and_root() {
        let backend: StateStoreBackend = serde_yaml::from_str(indoc! {"
            dataDirectory: hummock
            gcs:
              bucket: rw
              root: /rw-root
              credentials:
                useWorkloadIdentity: true
        "})
        .expect("illegal test input");

        assert_eq!(backend.backend_type(), StateStoreBackendType::GCS);
        assert_eq!(backend.root(), Some("/rw-root"));
    }

    #[test]
    fn test_state_store_without_root() {
        let backend: StateStoreBackend = serde_yaml::from_str(indoc! {"
            s3:
              bucket: rw
              region: us-east-1
              credentials:
                secretName: s3-credentials
        "})
        .expect("illegal test input");

        assert_eq!(backend.backend_type(), StateStoreBackendType::S3);
        assert_eq!(backend.root(), None);
    }

    #[test]
    fn test_state_store_field_names() {
        let backend: StateStoreBackend = serde_yaml::from_str(indoc! {"
            aliyunOSS:
              bucket: rw
            webhdfs:
              nameNode: namenode:9870
        "})
        .expect("illegal test input");

        assert_eq!(
            backend.selected(),
            vec![StateStoreBackendType::AliyunOSS, StateStoreBackendType::WebHDFS]
        );
    }
}
