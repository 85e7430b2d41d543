use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Aggregation error: {0}")]
    AggregationError(String),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于日志中的错误分类
    ///
    /// 返回稳定的错误类别字符串，便于按业务影响聚合错误日志
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // K线存储相关
            AppError::StoreError(_) => "kline_store_operation_failed",
            AppError::DatabaseError(_) => "kline_data_persistence_failed",
            AppError::SqliteError(_) => "kline_storage_operation_failed",
            AppError::PoolError(_) => "kline_storage_pool_exhausted",

            // K线数据处理相关
            AppError::JsonError(_) => "kline_record_parsing_failed",
            AppError::AggregationError(_) => "kline_aggregation_logic_failed",

            // 系统资源相关
            AppError::IoError(_) => "kline_file_operation_failed",
            AppError::JoinError(_) => "kline_background_task_failed",

            AppError::ConfigError(_) => "kline_service_configuration_invalid",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 实时聚合路径据此决定是否在下一次事件时重写脏K线
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::StoreError(_) | AppError::PoolError(_) => true,

            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            }
            // SQLite错误通常是锁争用或忙
            AppError::SqliteError(_) => true,

            AppError::IoError(_) | AppError::JoinError(_) => true,

            AppError::JsonError(_)
            | AppError::ConfigError(_)
            | AppError::AggregationError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
