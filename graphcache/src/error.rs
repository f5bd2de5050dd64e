use serde_json_bytes::Value;

/// Create an internal error.
///
/// # Example
/// ```rust
/// use graphcache::internal_error;
/// use graphcache::error::CacheError;
/// # fn may_be_none() -> Option<()> { None }
///
/// let result: Result<(), CacheError> = may_be_none()
///     .ok_or_else(|| internal_error!("expected a value"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ( $( $arg:tt )+ ) => {
        $crate::error::CacheError::internal(format!( $( $arg )+ ))
    }
}

/// Break out of the current function, returning an internal error.
#[macro_export]
macro_rules! bail {
    ( $( $arg:tt )+ ) => {
        return Err($crate::internal_error!( $( $arg )+ ).into())
    }
}

/// A safe assertion: in debug mode, it panicks on failure, and in production, it returns an
/// internal error.
///
/// Treat this as an assertion. It must only be used for conditions that *should never happen*
/// in normal operation.
#[macro_export]
macro_rules! ensure {
    ( $expr:expr, $( $arg:tt )+ ) => {
        #[cfg(debug_assertions)]
        {
            if false {
                return Err($crate::error::CacheError::internal("ensure!() must be used in a function that returns a Result").into());
            }
            assert!($expr, $( $arg )+);
        }

        #[cfg(not(debug_assertions))]
        if !$expr {
            $crate::bail!( $( $arg )+ );
        }
    }
}

/// Errors surfaced by the cache core.
///
/// Every public operation returns at most one of these; errors never propagate past the
/// operation that triggered them. Transport failures during a fetch are not represented
/// here at all: they are attached to the waiting callers' responses and recorded on the
/// store instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("{message}")]
    Internal { message: String },
    #[error("cache is not configured: {message}")]
    InvalidConfiguration { message: String },
    #[error("{message}")]
    CallerContract { message: String },
    #[error("invalid GraphQL document: {message}")]
    InvalidDocument { message: String },
    #[error("unknown mutation \"{name}\"")]
    UnknownMutation { name: String },
    #[error("invalid patch path \"{path}\": {message}")]
    Patch { path: String, message: String },
}

impl CacheError {
    pub fn internal(message: impl Into<String>) -> Self {
        CacheError::Internal {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        CacheError::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        CacheError::CallerContract {
            message: message.into(),
        }
    }

    pub fn document(message: impl ToString) -> Self {
        CacheError::InvalidDocument {
            message: message.to_string(),
        }
    }

    pub fn patch(path: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Patch {
            path: path.into(),
            message: message.into(),
        }
    }

    /// The JSON shape recorded on the store and on caller responses when a fetch fails.
    pub(crate) fn error_value(message: &str) -> Value {
        let mut object = serde_json_bytes::Map::new();
        object.insert(
            serde_json_bytes::ByteString::from("message"),
            Value::String(serde_json_bytes::ByteString::from(message)),
        );
        Value::Object(object)
    }
}
