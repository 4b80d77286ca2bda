use thiserror::Error;

/// Transport-level failures on the RS485 line.
#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("CRC checksum mismatch")]
    CrcError,

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("Modbus exception code 0x{0:02X}")]
    Exception(u8),

    #[error("Invalid device address: {0} (must be 1-247)")]
    InvalidDevice(u8),

    #[error("Lock acquisition failed")]
    LockError,

    #[error("Timeout occurred")]
    Timeout,
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            ModbusError::Timeout
        } else {
            ModbusError::CommunicationError(format!("IO error: {}", err))
        }
    }
}

/// A register spec was applied to the wrong number of words. Caller bug.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("register count mismatch: spec expects {expected} words, got {actual}")]
    RegisterCountMismatch { expected: u16, actual: usize },

    #[error("unsupported register width: {0} (supported 1-4)")]
    UnsupportedWidth(u16),
}

#[derive(Error, Debug)]
pub enum ReadFailure {
    #[error(transparent)]
    Transport(#[from] ModbusError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// One meter could not be read on one tick.
#[derive(Error, Debug)]
#[error("read failed for {device_id} (address {device_address}) on {field}: {cause}")]
pub struct ReadError {
    pub device_address: u8,
    pub device_id: String,
    pub field: &'static str,
    #[source]
    pub cause: ReadFailure,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when SQLite reported SQLITE_BUSY / SQLITE_LOCKED.
    pub fn is_contention(&self) -> bool {
        match self {
            StoreError::Busy { .. } => true,
            StoreError::Database(sqlx::Error::Database(db)) => {
                let code = db.code();
                let code = code.as_deref().unwrap_or("");
                // primary codes 5 and 6, plus their extended variants
                matches!(code.parse::<i32>().map(|c| c & 0xFF), Ok(5) | Ok(6))
                    || db.message().contains("database is locked")
            }
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Unknown device profile '{0}'")]
    UnknownProfile(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Start-up faults. Any of these prevents the scheduler from starting.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Transport could not be opened: {0}")]
    Transport(#[source] ModbusError),

    #[error("Store could not be opened: {0}")]
    Store(#[source] StoreError),

    #[error("Configuration rejected: {0}")]
    Config(#[source] ConfigError),
}
