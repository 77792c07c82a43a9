use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] datapack_core::ValidationError),

    #[error(transparent)]
    Config(#[from] datapack_core::ConfigError),

    #[error("collection failed: {0}")]
    Collect(#[from] datapack_core::CollectError),

    #[error(transparent)]
    Store(#[from] datapack_core::StoreError),

    #[error(transparent)]
    Warehouse(#[from] datapack_warehouse::WarehouseError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Config(_) => 2,
            Self::Collect(_) => 4,
            Self::Serialization(_) => 5,
            Self::Store(_) | Self::Warehouse(_) | Self::Io(_) => 10,
        }
    }
}
