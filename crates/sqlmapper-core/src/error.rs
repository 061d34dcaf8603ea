//! Error types for SQLMapper operations.

use std::fmt;

/// The primary error type for all SQLMapper operations.
#[derive(Debug)]
pub enum Error {
    /// Configuration errors (unknown shape or statement id, discriminator
    /// cycles, ambiguous property typing, invalid cache setup)
    Configuration(ConfigurationError),
    /// Failures reported by the backing store during physical execution
    Execution(ExecutionError),
    /// Codec conversion failures for a specific column/property
    Mapping(MappingError),
    /// Value conversion errors
    Type(TypeError),
}

/// A fatal configuration error. Never retried.
#[derive(Debug)]
pub struct ConfigurationError {
    pub message: String,
}

#[derive(Debug)]
pub struct ExecutionError {
    /// Statement id, when known.
    pub statement: Option<String>,
    /// The SQL that was being executed, when known.
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// A mapping failure carrying the offending property/column identity.
#[derive(Debug)]
pub struct MappingError {
    pub property: Option<String>,
    pub column: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl Error {
    /// Create a configuration error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(ConfigurationError {
            message: message.into(),
        })
    }

    /// Create an execution error from a message.
    pub fn execution(message: impl Into<String>) -> Self {
        Error::Execution(ExecutionError {
            statement: None,
            sql: None,
            message: message.into(),
            source: None,
        })
    }

    /// Create an execution error tagged with the statement that failed.
    pub fn execution_in(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Execution(ExecutionError {
            statement: Some(statement.into()),
            sql: None,
            message: message.into(),
            source: None,
        })
    }

    /// Create a mapping error for a property.
    pub fn mapping(property: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            property: Some(property.into()),
            column: None,
            message: message.into(),
            source: None,
        })
    }

    /// Create a mapping error for a column read.
    pub fn mapping_column(column: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            property: None,
            column: Some(column.into()),
            message: message.into(),
            source: None,
        })
    }

    /// Is this a fatal configuration error?
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }

    /// Wrap this error with the property it occurred on, preserving the
    /// original as the source.
    pub fn for_property(self, property: &str) -> Self {
        match self {
            Error::Mapping(mut m) => {
                if m.property.is_none() {
                    m.property = Some(property.to_string());
                }
                Error::Mapping(m)
            }
            other => Error::Mapping(MappingError {
                property: Some(property.to_string()),
                column: None,
                message: format!("could not process result for '{property}'"),
                source: Some(Box::new(other)),
            }),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(e) => write!(f, "Configuration error: {}", e.message),
            Error::Execution(e) => match &e.statement {
                Some(id) => write!(f, "Execution error in '{}': {}", id, e.message),
                None => write!(f, "Execution error: {}", e.message),
            },
            Error::Mapping(e) => {
                write!(f, "Mapping error")?;
                if let Some(p) = &e.property {
                    write!(f, " for property '{p}'")?;
                }
                if let Some(c) = &e.column {
                    write!(f, " on column '{c}'")?;
                }
                write!(f, ": {}", e.message)
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Execution(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Mapping(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<ConfigurationError> for Error {
    fn from(err: ConfigurationError) -> Self {
        Error::Configuration(err)
    }
}

impl From<ExecutionError> for Error {
    fn from(err: ExecutionError) -> Self {
        Error::Execution(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

/// Result type alias for SQLMapper operations.
pub type Result<T> = std::result::Result<T, Error>;
