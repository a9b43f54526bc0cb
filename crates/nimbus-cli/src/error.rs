use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Bad user input. Nothing has been mutated when this is returned.
    Validation(String),
    /// Control-plane or network failure.
    Remote(String),
    /// The storage backend answered the upload with a non-success status.
    Transfer(u16),
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn validation<M: Into<String>>(msg: M) -> Self {
        Self::Validation(msg.into())
    }

    pub fn remote<M: Into<String>>(msg: M) -> Self {
        Self::Remote(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(m) | Error::Remote(m) | Error::Msg(m) => write!(f, "{m}"),
            Error::Transfer(status) => write!(f, "upload responded with status {status}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::remote(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
