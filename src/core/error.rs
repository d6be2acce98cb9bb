use thiserror::Error;

#[derive(Error, Debug)]
pub enum SheetError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown character '{0}'")]
    UnknownCharacter(String),

    #[error("Could not acquire store lock within {waited_ms} ms")]
    LockTimeout { waited_ms: u64 },

    #[error("Store is corrupt and could not be recovered: {0}")]
    Corrupt(String),

    #[error("Refusing to overwrite named characters with an empty document")]
    WipeRejected,

    #[error("Backup '{0}' not found")]
    BackupNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, SheetError>;

impl SheetError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<std::io::Error> for SheetError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SheetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_with_message() {
        let err: SheetError = std::io::Error::other("disk full").into();
        assert_eq!(err.to_string(), "I/O error: disk full");
    }
}
