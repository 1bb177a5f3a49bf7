//! 影像对象存储
//!
//! 对象存储没有事务，写入一旦成功即持久。入库流程只依赖 [`BlobStore`]。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use derm_core::{DermError, Result};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use tracing::{debug, info, warn};

/// 写入成功的对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub size: usize,
    pub e_tag: Option<String>,
}

/// 对象存储接口
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 确保桶存在，可重复调用
    async fn ensure_bucket(&self) -> Result<()>;

    /// 写入对象，键由调用方生成且全局唯一
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<StoredBlob>;

    /// 生成限时读取链接
    async fn presigned_get(&self, key: &str, ttl: Duration) -> Result<String>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// S3 兼容存储（MinIO 等）的连接参数
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub bucket: String,
    pub secure: bool,
}

impl S3Settings {
    /// 补全协议前缀；已带协议的地址原样使用
    fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            self.endpoint.clone()
        } else if self.secure {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }
}

enum Backend {
    S3 {
        client: Arc<AmazonS3>,
        http: reqwest::Client,
    },
    Local {
        root: PathBuf,
    },
    Memory,
}

impl Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::S3 { .. } => "s3",
            Backend::Local { .. } => "local",
            Backend::Memory => "memory",
        }
    }
}

/// 基于 `object_store` 的 [`BlobStore`] 实现
pub struct ObjectBlobStore {
    store: Arc<dyn ObjectStore>,
    backend: Backend,
    bucket: String,
}

impl std::fmt::Debug for ObjectBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBlobStore")
            .field("backend", &self.backend.name())
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl ObjectBlobStore {
    /// S3 兼容存储，支持预签名
    pub fn s3(settings: &S3Settings) -> Result<Self> {
        let client = AmazonS3Builder::new()
            .with_endpoint(settings.endpoint_url())
            .with_access_key_id(&settings.access_key)
            .with_secret_access_key(&settings.secret_key)
            .with_region(&settings.region)
            .with_bucket_name(&settings.bucket)
            .with_allow_http(!settings.secure)
            .with_virtual_hosted_style_request(false)
            .build()
            .map_err(|e| DermError::Config(format!("invalid S3 settings: {}", e)))?;
        let client = Arc::new(client);

        Ok(Self {
            store: client.clone(),
            backend: Backend::S3 {
                client,
                http: reqwest::Client::new(),
            },
            bucket: settings.bucket.clone(),
        })
    }

    /// 本地目录，桶即根目录下的子目录
    pub async fn local(root: impl Into<PathBuf>, bucket: &str) -> Result<Self> {
        let root = root.into().join(bucket);
        tokio::fs::create_dir_all(&root).await?;
        let store = LocalFileSystem::new_with_prefix(&root)
            .map_err(|e| storage_error("open local store", e))?;

        Ok(Self {
            store: Arc::new(store),
            backend: Backend::Local { root },
            bucket: bucket.to_string(),
        })
    }

    /// 进程内存储，用于测试和演示
    pub fn memory(bucket: &str) -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            backend: Backend::Memory,
            bucket: bucket.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn put_options(&self, content_type: &str) -> PutOptions {
        // 本地文件系统不支持对象属性
        if matches!(self.backend, Backend::Local { .. }) || content_type.is_empty() {
            return PutOptions::default();
        }
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        PutOptions {
            attributes,
            ..Default::default()
        }
    }

    async fn create_s3_bucket(&self, client: &AmazonS3, http: &reqwest::Client) -> Result<()> {
        // 对桶根路径的 PUT 即 CreateBucket
        let url = client
            .signed_url(reqwest::Method::PUT, &Path::from(""), Duration::from_secs(60))
            .await
            .map_err(|e| storage_error("sign bucket creation", e))?;

        let response = http
            .put(url.as_str())
            .send()
            .await
            .map_err(|e| DermError::Storage(format!("create bucket {}: {}", self.bucket, e)))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            info!(bucket = %self.bucket, "Bucket is ready");
            Ok(())
        } else {
            Err(DermError::Storage(format!(
                "create bucket {} failed with status {}",
                self.bucket, status
            )))
        }
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn ensure_bucket(&self) -> Result<()> {
        match &self.backend {
            Backend::S3 { client, http } => {
                if self.store.list_with_delimiter(None).await.is_ok() {
                    debug!(bucket = %self.bucket, "Bucket exists");
                    return Ok(());
                }
                warn!(bucket = %self.bucket, "Bucket not reachable, creating it");
                self.create_s3_bucket(client, http).await
            }
            Backend::Local { root } => {
                tokio::fs::create_dir_all(root).await?;
                Ok(())
            }
            Backend::Memory => Ok(()),
        }
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<StoredBlob> {
        let path = object_path(key)?;
        let size = data.len();
        let result = self
            .store
            .put_opts(&path, PutPayload::from(data), self.put_options(content_type))
            .await
            .map_err(|e| storage_error("upload", e))?;

        debug!(key, size, "Object stored");
        Ok(StoredBlob {
            key: key.to_string(),
            size,
            e_tag: result.e_tag,
        })
    }

    async fn presigned_get(&self, key: &str, ttl: Duration) -> Result<String> {
        let path = object_path(key)?;
        match &self.backend {
            Backend::S3 { client, .. } => {
                let url = client
                    .signed_url(reqwest::Method::GET, &path, ttl)
                    .await
                    .map_err(|e| storage_error("presign", e))?;
                Ok(url.to_string())
            }
            _ => Err(DermError::Storage(format!(
                "{} backend cannot issue presigned URLs",
                self.backend.name()
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = object_path(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(storage_error("head", e)),
        }
    }
}

fn object_path(key: &str) -> Result<Path> {
    Path::parse(key).map_err(|e| DermError::Validation(format!("invalid object key {}: {}", key, e)))
}

fn storage_error(action: &str, err: object_store::Error) -> DermError {
    DermError::Storage(format!("{} failed: {}", action, err))
}
