use std::fmt;

#[derive(Debug)]
pub enum ApiError {
    /// Missing or invalid token; the client must log out.
    Unauthorized,
    /// The caller is authenticated but the permission bit is off.
    Forbidden,
    NotFound,
    /// `create_empty` target or destination entry already present.
    Exists,
    EmailTaken,
    /// Lock contention exceeded, or a unique constraint raced.
    Conflict,
    BadRequest(&'static str),
    /// Authentication of an encrypted record failed.
    BadMac,
    /// Encrypted input shorter than iv + one block + mac.
    ShortCiphertext,
    /// No master key is loaded; the process must not serve requests.
    NoKey,
    /// A record decrypted but its contents are not usable. Fatal for the
    /// record, not for the process.
    Corrupt(&'static str),
    Json(serde_json::Error),
    Bincode(bincode::Error),
    Argon(argon2::Error),
    IO(std::io::Error),
}

impl std::error::Error for ApiError {}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        ApiError::Json(error)
    }
}

impl From<bincode::Error> for ApiError {
    fn from(error: bincode::Error) -> Self {
        ApiError::Bincode(error)
    }
}

impl From<argon2::Error> for ApiError {
    fn from(error: argon2::Error) -> Self {
        ApiError::Argon(error)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(error: std::io::Error) -> Self {
        ApiError::IO(error)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
