//! 数据库连接管理

use derm_core::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// 数据库连接池
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// 连接PostgreSQL
    pub async fn connect(
        connection_string: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(connection_string)
            .await?;

        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool();

        // 创建患者表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS patients (
                patient_id VARCHAR(50) PRIMARY KEY,
                given_name VARCHAR(40) NOT NULL,
                family_name VARCHAR(40) NOT NULL,
                middle_name VARCHAR(40),
                sex CHAR(1) NOT NULL,
                age INTEGER NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#).execute(pool).await?;

        // 创建影像表，只保存对象键
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS images (
                id BIGSERIAL PRIMARY KEY,
                object_key VARCHAR(255) UNIQUE NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#).execute(pool).await?;

        // 创建检查表，影像一对一
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS examinations (
                id BIGSERIAL PRIMARY KEY,
                prediction_label VARCHAR(50) NOT NULL,
                prediction_confidence DOUBLE PRECISION NOT NULL
                    CHECK (prediction_confidence >= 0 AND prediction_confidence <= 1),
                location VARCHAR(2),
                examination_date DATE NOT NULL,
                doctor VARCHAR(50) NOT NULL,
                image_id BIGINT NOT NULL UNIQUE REFERENCES images(id),
                patient_id VARCHAR(50) NOT NULL REFERENCES patients(patient_id)
            )
        "#).execute(pool).await?;

        // 创建诊断表，随检查级联删除
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS diagnoses (
                id BIGSERIAL PRIMARY KEY,
                examination_id BIGINT NOT NULL REFERENCES examinations(id) ON DELETE CASCADE,
                result VARCHAR(50) NOT NULL,
                doctor VARCHAR(50) NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await?;

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_examinations_patient_id ON examinations(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_examinations_date ON examinations(examination_date)",
            "CREATE INDEX IF NOT EXISTS idx_diagnoses_examination_id ON diagnoses(examination_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }
}
