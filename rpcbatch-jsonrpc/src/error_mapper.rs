//! Mapping of wire error codes to [`TypedError`] values.
//!
//! An [`ErrorMapper`] is a pure function `(code, message, data) -> TypedError`.  Clients hold one
//! default mapper plus optional per-method overrides in an [`ErrorMappers`] registry, so that
//! refining the errors of one method never requires touching the scheduler or any other method.
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::TypedError;
use crate::types::{ErrorCode, Method};

/// Pure mapping from a JSON-RPC error (or a transport failure with a synthetic code) to a typed
/// error.
///
/// Implemented for any `Fn(i32, String, Option<JsonValue>) -> TypedError`, so a closure with a
/// `match` on the code is usually all that's needed.
pub trait ErrorMapper: Send + Sync + 'static {
    fn map_error(&self, code: i32, message: String, data: Option<JsonValue>) -> TypedError;
}

impl<F> ErrorMapper for F
where
    F: Fn(i32, String, Option<JsonValue>) -> TypedError + Send + Sync + 'static,
{
    fn map_error(&self, code: i32, message: String, data: Option<JsonValue>) -> TypedError {
        self(code, message, data)
    }
}

/// Maps every error to a generic [`TypedError`] named `UnknownError`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultErrorMapper;

impl ErrorMapper for DefaultErrorMapper {
    fn map_error(&self, code: i32, message: String, data: Option<JsonValue>) -> TypedError {
        TypedError::unknown(code, message, data)
    }
}

/// Names of the error codes reserved by JSON-RPC 2.0 itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr, strum::EnumIter)]
pub enum StandardError {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
}

impl StandardError {
    pub fn code(self) -> i32 {
        match self {
            StandardError::ParseError => ErrorCode::ParseError.code(),
            StandardError::InvalidRequest => ErrorCode::InvalidRequest.code(),
            StandardError::MethodNotFound => ErrorCode::MethodNotFound.code(),
            StandardError::InvalidParams => ErrorCode::InvalidParams.code(),
            StandardError::InternalError => ErrorCode::InternalError.code(),
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use strum::IntoEnumIterator;

        Self::iter().find(|e| e.code() == code)
    }
}

/// Names the codes reserved by JSON-RPC 2.0 (`ParseError`, `MethodNotFound`, ...) and falls back
/// to `UnknownError` for everything else.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardErrorMapper;

impl ErrorMapper for StandardErrorMapper {
    fn map_error(&self, code: i32, message: String, data: Option<JsonValue>) -> TypedError {
        match StandardError::from_code(code) {
            Some(standard) => TypedError::new(<&'static str>::from(standard), code, message, data),
            None => TypedError::unknown(code, message, data),
        }
    }
}

/// Table-driven mapper for application-specific codes.
///
/// Codes that are in the table get the corresponding name; anything else is handed to the
/// fallback mapper, which is [`DefaultErrorMapper`] unless specified otherwise.
#[derive(Clone)]
pub struct CodeTableMapper {
    names: HashMap<i32, String>,
    fallback: Arc<dyn ErrorMapper>,
}

impl Default for CodeTableMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeTableMapper {
    pub fn new() -> Self {
        Self {
            names: HashMap::new(),
            fallback: Arc::new(DefaultErrorMapper),
        }
    }

    pub fn with_code(mut self, code: i32, name: impl Into<String>) -> Self {
        self.names.insert(code, name.into());
        self
    }

    pub fn with_fallback(mut self, fallback: impl ErrorMapper) -> Self {
        self.fallback = Arc::new(fallback);
        self
    }
}

impl ErrorMapper for CodeTableMapper {
    fn map_error(&self, code: i32, message: String, data: Option<JsonValue>) -> TypedError {
        match self.names.get(&code) {
            Some(name) => TypedError::new(name.clone(), code, message, data),
            None => self.fallback.map_error(code, message, data),
        }
    }
}

/// Registry of the error mappers in effect for a client: one default, plus per-method overrides.
#[derive(Clone)]
pub struct ErrorMappers {
    default: Arc<dyn ErrorMapper>,
    by_method: HashMap<Method, Arc<dyn ErrorMapper>>,
}

impl Default for ErrorMappers {
    fn default() -> Self {
        Self {
            default: Arc::new(DefaultErrorMapper),
            by_method: HashMap::new(),
        }
    }
}

impl ErrorMappers {
    pub fn set_default(&mut self, mapper: impl ErrorMapper) {
        self.default = Arc::new(mapper);
    }

    pub fn set_for_method(&mut self, method: impl Into<Method>, mapper: impl ErrorMapper) {
        self.by_method.insert(method.into(), Arc::new(mapper));
    }

    /// The mapper to use for errors from `method`: its override if one was registered, otherwise
    /// the default.
    pub fn for_method(&self, method: &Method) -> Arc<dyn ErrorMapper> {
        self.by_method
            .get(method)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl std::fmt::Debug for ErrorMappers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorMappers")
            .field("overridden_methods", &self.by_method.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UNKNOWN_ERROR_NAME;
    use serde_json::json;

    #[test]
    fn default_mapper_is_unknown_error() {
        let error = DefaultErrorMapper.map_error(-32001, "boom".into(), Some(json!({"a": 1})));

        assert_eq!(error.name, UNKNOWN_ERROR_NAME);
        assert_eq!(error.code, -32001);
        assert_eq!(error.message, "boom");
        assert_eq!(error.data, Some(json!({"a": 1})));
    }

    #[test]
    fn standard_codes_are_named() {
        let error = StandardErrorMapper.map_error(-32601, "Method not found".into(), None);
        assert_eq!(error.name, "MethodNotFound");

        let error = StandardErrorMapper.map_error(-32700, "Parse error".into(), None);
        assert_eq!(error.name, "ParseError");

        let error = StandardErrorMapper.map_error(404, "Not Found".into(), None);
        assert_eq!(error.name, UNKNOWN_ERROR_NAME);
    }

    #[test]
    fn code_table_falls_back() {
        let mapper = CodeTableMapper::new()
            .with_code(1001, "UserNotFound")
            .with_fallback(StandardErrorMapper);

        assert_eq!(mapper.map_error(1001, "x".into(), None).name, "UserNotFound");
        assert_eq!(mapper.map_error(-32602, "x".into(), None).name, "InvalidParams");
        assert_eq!(mapper.map_error(7, "x".into(), None).name, UNKNOWN_ERROR_NAME);
    }

    #[test]
    fn closures_are_mappers() {
        let mapper = |code: i32, message: String, data: Option<JsonValue>| match code {
            -32001 => TypedError::new("Unauthorized", code, message, data),
            _ => TypedError::unknown(code, message, data),
        };

        assert_eq!(mapper.map_error(-32001, "x".into(), None).name, "Unauthorized");
        assert_eq!(mapper.map_error(-32002, "x".into(), None).name, UNKNOWN_ERROR_NAME);
    }

    #[test]
    fn per_method_overrides() {
        let mut mappers = ErrorMappers::default();
        mappers.set_for_method(
            "user.get",
            CodeTableMapper::new().with_code(1001, "UserNotFound"),
        );

        let user_get = mappers.for_method(&"user.get".into());
        let other = mappers.for_method(&"user.list".into());

        assert_eq!(user_get.map_error(1001, "x".into(), None).name, "UserNotFound");
        assert_eq!(other.map_error(1001, "x".into(), None).name, UNKNOWN_ERROR_NAME);
    }
}
