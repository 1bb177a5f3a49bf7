//! 皮肤影像诊断服务主程序

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use derm_admin::config::{DatabaseConfig, PredictionConfig, StorageConfig};
use derm_admin::{init_tracing, DatabaseBackend, DermConfig, IngestionMonitor, StorageBackend};
use derm_core::{ExaminationMeta, NewDiagnosis, NewPatient, PredictionMode, Sex};
use derm_database::{DatabasePool, MemoryRecordStore, PgRecordStore, RecordStore};
use derm_integration::{PredictionClient, PredictionClientConfig};
use derm_storage::{BlobStore, ObjectBlobStore, S3Settings};
use derm_web::{AppState, WebServer};
use derm_workflow::{ImageUpload, IngestionEngine, IngestionRequest};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "derm-server")]
#[command(about = "皮肤影像采集与诊断服务")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true, env = "DERM_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动 HTTP 服务（默认）
    Serve,
    /// 用随机患者和目录中的影像填充数据
    Seed {
        /// 影像目录
        #[arg(long, default_value = "./images")]
        images_dir: PathBuf,
        /// 生成的检查数
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// 输出生效的配置
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DermConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            init_tracing(&config.logging)?;
            serve(config).await
        }
        Command::Seed { images_dir, count } => {
            init_tracing(&config.logging)?;
            seed(config, &images_dir, count).await
        }
        Command::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn serve(config: DermConfig) -> Result<()> {
    info!("启动皮肤影像服务...");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("无效的监听地址: {}", config.server.host))?;

    info!("服务配置:");
    info!("  监听地址: {}", addr);
    info!("  数据库后端: {:?}", config.database.backend);
    info!("  对象存储后端: {:?}", config.storage.backend);
    info!("  预测模式: {:?}", config.prediction.mode);

    let engine = build_engine(&config).await?;
    let server = WebServer::new(
        addr,
        AppState::new(Arc::new(engine)),
        config.server.max_upload_bytes,
    );

    if let Err(e) = server.run().await {
        error!("服务器运行失败: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// 按配置装配存储和引擎
async fn build_engine(config: &DermConfig) -> Result<IngestionEngine> {
    let records = build_record_store(&config.database).await?;
    let blobs = build_blob_store(&config.storage).await?;
    let monitor = IngestionMonitor::new()?;

    let engine = IngestionEngine::new(records, blobs, monitor)?
        .with_presign_ttl(config.storage.presign_ttl());

    Ok(match build_classifier(&config.prediction)? {
        Some(client) => engine.with_classifier(Arc::new(client)),
        None => engine.with_mode(PredictionMode::Simulated),
    })
}

async fn build_record_store(config: &DatabaseConfig) -> Result<Arc<dyn RecordStore>> {
    match config.backend {
        DatabaseBackend::Postgres => {
            let pool = DatabasePool::connect(
                &config.connection_string,
                config.max_connections,
                config.connect_timeout(),
            )
            .await
            .context("连接数据库失败")?;
            pool.create_tables().await.context("初始化数据库表失败")?;
            info!("数据库表已就绪");
            Ok(Arc::new(PgRecordStore::new(pool)))
        }
        DatabaseBackend::Memory => {
            warn!("使用内存数据库，重启后数据丢失");
            Ok(Arc::new(MemoryRecordStore::new()))
        }
    }
}

async fn build_blob_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    let store = match config.backend {
        StorageBackend::S3 => ObjectBlobStore::s3(&S3Settings {
            endpoint: config.endpoint.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            region: config.region.clone(),
            bucket: config.bucket.clone(),
            secure: config.secure,
        })?,
        StorageBackend::Local => ObjectBlobStore::local(&config.local_root, &config.bucket).await?,
        StorageBackend::Memory => {
            warn!("使用内存对象存储，重启后影像丢失");
            ObjectBlobStore::memory(&config.bucket)
        }
    };

    store
        .ensure_bucket()
        .await
        .with_context(|| format!("存储桶不可用: {}", config.bucket))?;
    info!("存储桶已就绪: {}", config.bucket);

    Ok(Arc::new(store))
}

fn build_classifier(config: &PredictionConfig) -> Result<Option<PredictionClient>> {
    if config.mode == PredictionMode::Simulated {
        return Ok(None);
    }

    let client = PredictionClient::new(PredictionClientConfig {
        endpoint: config.endpoint.clone(),
        connect_timeout: config.connect_timeout(),
        read_timeout: config.read_timeout(),
    })?;
    info!("分类服务地址: {}", config.endpoint);
    Ok(Some(client))
}

const GIVEN_NAMES: &[(&str, Sex)] = &[
    ("Ivan", Sex::Male),
    ("Dmitry", Sex::Male),
    ("Sergey", Sex::Male),
    ("Anna", Sex::Female),
    ("Olga", Sex::Female),
    ("Maria", Sex::Female),
];
const FAMILY_NAMES: &[&str] = &["Ivanov", "Petrov", "Smirnov", "Kuznetsov", "Popov", "Volkov"];
const LOCATIONS: &[&str] = &["AR", "LE", "BA", "CH"];
const DOCTORS: &[&str] = &["Dr. Morozov", "Dr. Lebedeva", "Dr. Sokolov"];
const DIAGNOSIS_RESULTS: &[&str] = &["B", "M", "U"];

/// 生成随机入库数据，影像从目录中随机选取
async fn seed(config: DermConfig, images_dir: &Path, count: usize) -> Result<()> {
    let images = list_images(images_dir).await?;
    if images.is_empty() {
        bail!("目录中没有影像文件: {}", images_dir.display());
    }
    if config.database.backend == DatabaseBackend::Memory {
        warn!("内存数据库不会保留填充的数据");
    }

    let engine = build_engine(&config).await?;
    let mut rng = StdRng::from_entropy();
    let mut created = 0;

    for _ in 0..count {
        let request = random_request(&mut rng, &images).await?;
        let family_name = request.patient.family_name.clone();
        let key = request.image.key.clone();

        match engine.ingest(request).await {
            Ok(receipt) => {
                created += 1;
                info!(
                    "已创建检查 {}: {} ({})",
                    receipt.examination.id, family_name, receipt.examination.prediction.label
                );
            }
            Err(e) => error!("填充失败: {} 文件 {}: {}", family_name, key, e),
        }
    }

    info!("填充完成: {}/{}", created, count);
    Ok(())
}

async fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("无法读取目录: {}", dir.display()))?;

    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && content_type_for(&path).is_some() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

async fn random_request(rng: &mut StdRng, images: &[PathBuf]) -> Result<IngestionRequest> {
    let path = images.choose(rng).context("没有可用的影像")?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image.jpg");
    let content_type = content_type_for(path).unwrap_or("application/octet-stream");
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("无法读取影像: {}", path.display()))?;

    let (given_name, sex) = GIVEN_NAMES.choose(rng).copied().unwrap_or(("Ivan", Sex::Male));
    let family_name = FAMILY_NAMES.choose(rng).copied().unwrap_or("Ivanov");
    let doctor = DOCTORS.choose(rng).copied().unwrap_or("Dr. Morozov");

    let patient = NewPatient {
        patient_id: format!(
            "{:03}-{:03}-{:03} {:02}",
            rng.gen_range(0..1000),
            rng.gen_range(0..1000),
            rng.gen_range(0..1000),
            rng.gen_range(0..100)
        ),
        given_name: given_name.to_string(),
        family_name: family_name_for(family_name, sex),
        middle_name: None,
        sex,
        age: rng.gen_range(18..=90),
    };

    let examination = ExaminationMeta {
        location: LOCATIONS.choose(rng).map(|loc| loc.to_string()),
        date: (Utc::now() - Duration::days(rng.gen_range(0..730))).date_naive(),
        doctor: doctor.to_string(),
    };

    let diagnosis = NewDiagnosis {
        result: DIAGNOSIS_RESULTS.choose(rng).copied().unwrap_or("U").to_string(),
        doctor: doctor.to_string(),
    };

    Ok(IngestionRequest {
        patient,
        examination,
        diagnosis,
        image: ImageUpload::new(filename, Bytes::from(data), content_type),
        prediction: None,
    })
}

fn family_name_for(base: &str, sex: Sex) -> String {
    match sex {
        Sex::Male => base.to_string(),
        Sex::Female => format!("{}a", base),
    }
}
