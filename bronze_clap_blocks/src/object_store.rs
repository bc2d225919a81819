//! CLI handling for the lake object store (via CLI arguments and environment variables).

use std::{convert::Infallible, fs, num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};

use non_empty_string::NonEmptyString;
use object_store::{DynObjectStore, local::LocalFileSystem, memory::InMemory};
use observability_deps::tracing::{info, warn};
use snafu::{ResultExt, Snafu};
use url::Url;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ParseError {
    #[snafu(display("Unable to create lake directory {:?}: {}", path, source))]
    CreatingLakeDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to create local store {:?}: {}", path, source))]
    CreateLocalFileSystem {
        path: PathBuf,
        source: object_store::Error,
    },

    #[snafu(display(
        "Specified {:?} for the object store, required configuration missing for {}",
        object_store,
        missing
    ))]
    MissingObjectStoreConfig {
        object_store: ObjectStoreType,
        missing: String,
    },

    #[snafu(display("Error configuring Amazon S3: {}", source))]
    InvalidS3Config { source: object_store::Error },

    #[snafu(display("Error configuring Microsoft Azure: {}", source))]
    InvalidAzureConfig { source: object_store::Error },

    #[snafu(display("{} support not enabled, recompile with the {} feature", store, feature))]
    NotEnabled {
        store: &'static str,
        feature: &'static str,
    },
}

/// The AWS region to use for Amazon S3 based object storage if none is specified.
pub const FALLBACK_AWS_REGION: &str = "us-east-1";

/// A `clap` `value_parser` which returns `None` when given an empty string and
/// `Some(NonEmptyString)` otherwise.
fn parse_optional_string(s: &str) -> Result<Option<NonEmptyString>, Infallible> {
    Ok(NonEmptyString::new(s.to_string()).ok())
}

/// Endpoint for S3 & Co.
///
/// This is a [`Url`] without a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint(String);

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.0
    }
}

impl std::str::FromStr for Endpoint {
    type Err = Box<dyn std::error::Error + Send + Sync>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::parse(s)?;

        let s = s.strip_suffix("/").unwrap_or(s);

        Ok(Self(s.to_owned()))
    }
}

/// Object-store type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum ObjectStoreType {
    /// In-memory.
    Memory,

    /// Filesystem.
    File,

    /// AWS S3 and compatible stores.
    S3,

    /// Azure blob storage.
    Azure,
}

impl ObjectStoreType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::S3 => "s3",
            Self::Azure => "azure",
        }
    }
}

/// CLI config for the store holding lake objects, dead letters and checkpoints.
#[derive(Debug, Clone, clap::Parser)]
pub struct ObjectStoreConfig {
    /// Which object storage to use.
    ///
    /// Possible values (case insensitive):
    ///
    /// * memory: Effectively no object persistence. Useful for local testing.
    /// * file: Stores objects in the local filesystem. Must also set `--lake-dir`.
    /// * s3: Amazon S3. Must also set `--bucket`, `--aws-access-key-id`, `--aws-secret-access-key`, and
    ///   possibly `--aws-default-region`.
    /// * azure: Microsoft Azure blob storage. Must also set `--bucket`, `--azure-storage-account`,
    ///   and `--azure-storage-access-key`.
    #[clap(
        value_enum,
        long = "object-store",
        env = "BRONZE_OBJECT_STORE",
        ignore_case = true,
        default_value = "memory",
        action,
        verbatim_doc_comment
    )]
    pub object_store: ObjectStoreType,

    /// Name of the bucket (S3) or container (Azure) holding the lake.
    #[clap(long = "bucket", env = "BRONZE_BUCKET", action)]
    pub bucket: Option<String>,

    /// The directory the lake is written to when using the `file` object store.
    #[clap(long = "lake-dir", env = "BRONZE_LAKE_DIR", action)]
    pub lake_directory: Option<PathBuf>,

    /// When using Amazon S3, an access key with permission to read from and write to the bucket.
    ///
    /// An empty string value is equivalent to omitting the flag.
    /// Note: must refer to std::option::Option explicitly, see <https://github.com/clap-rs/clap/issues/4626>
    #[clap(
        long = "aws-access-key-id",
        env = "AWS_ACCESS_KEY_ID",
        value_parser = parse_optional_string,
        default_value = "",
        action
    )]
    pub aws_access_key_id: std::option::Option<NonEmptyString>,

    /// When using Amazon S3, the secret access key that goes with the access key ID.
    ///
    /// An empty string value is equivalent to omitting the flag.
    /// Note: must refer to std::option::Option explicitly, see <https://github.com/clap-rs/clap/issues/4626>
    #[clap(
        long = "aws-secret-access-key",
        env = "AWS_SECRET_ACCESS_KEY",
        value_parser = parse_optional_string,
        default_value = "",
        action
    )]
    pub aws_secret_access_key: std::option::Option<NonEmptyString>,

    /// When using Amazon S3, the region of the bucket.
    #[clap(
        long = "aws-default-region",
        env = "AWS_DEFAULT_REGION",
        default_value = FALLBACK_AWS_REGION,
        action
    )]
    pub aws_default_region: String,

    /// When using an S3 compatible storage service, its endpoint.
    #[clap(long = "aws-endpoint", env = "AWS_ENDPOINT", action)]
    pub aws_endpoint: Option<Endpoint>,

    /// When using Amazon S3, a session token for federated logins.
    #[clap(long = "aws-session-token", env = "AWS_SESSION_TOKEN", action)]
    pub aws_session_token: Option<String>,

    /// Allow unencrypted HTTP connection to AWS.
    #[clap(long = "aws-allow-http", env = "AWS_ALLOW_HTTP", action)]
    pub aws_allow_http: bool,

    /// When using Microsoft Azure, the storage account name.
    #[clap(long = "azure-storage-account", env = "AZURE_STORAGE_ACCOUNT", action)]
    pub azure_storage_account: Option<String>,

    /// When using Microsoft Azure, one of the storage account access keys.
    #[clap(
        long = "azure-storage-access-key",
        env = "AZURE_STORAGE_ACCESS_KEY",
        action
    )]
    pub azure_storage_access_key: Option<String>,

    /// When using Microsoft Azure, a custom endpoint such as an Azurite emulator.
    #[clap(long = "azure-endpoint", env = "AZURE_ENDPOINT", action)]
    pub azure_endpoint: Option<Endpoint>,

    /// Allow unencrypted HTTP connection to Azure.
    #[clap(long = "azure-allow-http", env = "AZURE_ALLOW_HTTP", action)]
    pub azure_allow_http: bool,

    /// When using a network-based object store, limit the number of connections to this value.
    #[clap(
        long = "object-store-connection-limit",
        env = "BRONZE_OBJECT_STORE_CONNECTION_LIMIT",
        default_value = "16",
        action
    )]
    pub object_store_connection_limit: NonZeroUsize,

    /// The maximum number of times the object store client retries a request.
    ///
    /// Set to 0 to disable client retries; the pipeline still applies its own backoff.
    #[clap(
        long = "object-store-max-retries",
        env = "BRONZE_OBJECT_STORE_MAX_RETRIES",
        action
    )]
    pub max_retries: Option<usize>,

    /// The maximum length of time from the initial request after which the client stops
    /// retrying.
    #[clap(
        long = "object-store-retry-timeout",
        env = "BRONZE_OBJECT_STORE_RETRY_TIMEOUT",
        value_parser = humantime::parse_duration,
        action
    )]
    pub retry_timeout: Option<Duration>,
}

impl ObjectStoreConfig {
    #[cfg(any(feature = "aws", feature = "azure"))]
    fn retry_config(&self) -> object_store::RetryConfig {
        let mut retry_config = object_store::RetryConfig::default();

        if let Some(max_retries) = self.max_retries {
            retry_config.max_retries = max_retries;
        }
        if let Some(retry_timeout) = self.retry_timeout {
            retry_config.retry_timeout = retry_timeout;
        }

        retry_config
    }

    #[cfg(feature = "aws")]
    fn new_s3(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        use object_store::{aws::AmazonS3Builder, aws::S3ConditionalPut, limit::LimitStore};

        info!(
            bucket=?self.bucket,
            endpoint=?self.aws_endpoint,
            object_store_type="S3",
            "Object Store"
        );

        let mut builder = AmazonS3Builder::from_env()
            .with_allow_http(self.aws_allow_http)
            .with_region(&self.aws_default_region)
            .with_retry(self.retry_config())
            // lake writes are create-if-absent puts
            .with_conditional_put(S3ConditionalPut::ETagMatch);

        if let Some(bucket) = &self.bucket {
            builder = builder.with_bucket_name(bucket);
        }
        if let Some(endpoint) = &self.aws_endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        if let Some(key_id) = &self.aws_access_key_id {
            builder = builder.with_access_key_id(key_id.get());
        }
        if let Some(token) = &self.aws_session_token {
            builder = builder.with_token(token);
        }
        if let Some(secret) = &self.aws_secret_access_key {
            builder = builder.with_secret_access_key(secret.get());
        }

        Ok(Arc::new(LimitStore::new(
            builder.build().context(InvalidS3ConfigSnafu)?,
            self.object_store_connection_limit.get(),
        )))
    }

    #[cfg(not(feature = "aws"))]
    fn new_s3(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        NotEnabledSnafu {
            store: "S3",
            feature: "aws",
        }
        .fail()
    }

    #[cfg(feature = "azure")]
    fn new_azure(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        use object_store::{azure::MicrosoftAzureBuilder, limit::LimitStore};

        info!(bucket=?self.bucket, account=?self.azure_storage_account,
              endpoint=?self.azure_endpoint, object_store_type="Azure", "Object Store");

        let mut builder = MicrosoftAzureBuilder::new()
            .with_allow_http(self.azure_allow_http)
            .with_retry(self.retry_config());

        if let Some(bucket) = &self.bucket {
            builder = builder.with_container_name(bucket);
        }
        if let Some(account) = &self.azure_storage_account {
            builder = builder.with_account(account);
        }
        if let Some(key) = &self.azure_storage_access_key {
            builder = builder.with_access_key(key);
        }
        if let Some(endpoint) = &self.azure_endpoint {
            builder = builder.with_endpoint(endpoint.to_string());
        }

        Ok(Arc::new(LimitStore::new(
            builder.build().context(InvalidAzureConfigSnafu)?,
            self.object_store_connection_limit.get(),
        )))
    }

    #[cfg(not(feature = "azure"))]
    fn new_azure(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        NotEnabledSnafu {
            store: "Azure blob storage",
            feature: "azure",
        }
        .fail()
    }

    /// Create config-dependant object store.
    pub fn make_object_store(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        if let Some(lake_dir) = &self.lake_directory {
            if !matches!(&self.object_store, ObjectStoreType::File) {
                warn!(?lake_dir, object_store_type=?self.object_store,
                      "--lake-dir / `BRONZE_LAKE_DIR` ignored. It only affects 'file' object stores");
            }
        }

        let object_store: Arc<DynObjectStore> = match &self.object_store {
            ObjectStoreType::Memory => {
                info!(object_store_type = "Memory", "Object Store");
                Arc::new(InMemory::new())
            }
            ObjectStoreType::S3 => {
                self.require_bucket(ObjectStoreType::S3)?;
                self.new_s3()?
            }
            ObjectStoreType::Azure => {
                self.require_bucket(ObjectStoreType::Azure)?;
                self.new_azure()?
            }
            ObjectStoreType::File => self.new_local_file_system()?,
        };

        Ok(object_store)
    }

    fn require_bucket(&self, object_store: ObjectStoreType) -> Result<(), ParseError> {
        match &self.bucket {
            Some(_) => Ok(()),
            None => MissingObjectStoreConfigSnafu {
                object_store,
                missing: "bucket",
            }
            .fail(),
        }
    }

    fn new_local_file_system(&self) -> Result<Arc<LocalFileSystem>, ParseError> {
        match self.lake_directory.as_ref() {
            Some(lake_dir) => {
                info!(?lake_dir, object_store_type = "Directory", "Object Store");
                fs::create_dir_all(lake_dir)
                    .context(CreatingLakeDirectorySnafu { path: lake_dir })?;

                let store = LocalFileSystem::new_with_prefix(lake_dir)
                    .context(CreateLocalFileSystemSnafu { path: lake_dir })?
                    .with_automatic_cleanup(true);
                Ok(Arc::new(store))
            }
            None => MissingObjectStoreConfigSnafu {
                object_store: ObjectStoreType::File,
                missing: "lake-dir",
            }
            .fail(),
        }
    }
}
