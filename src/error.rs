use thiserror::Error;

/// Main error type for the node toolkit
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    /// Shape-related errors with detailed suggestions
    #[error("Shape error: {0}")]
    ShapeError(String),

    /// Operation errors with context
    #[error("Operation error: {operation} - {message}")]
    OperationError {
        operation: String,
        message: String,
    },

    /// A name that is not part of the exported symbol set
    #[error("Unknown {kind} '{name}'")]
    UnknownSymbol {
        kind: String,
        name: String,
    },

    /// Hypergraph wiring errors (cycles, dangling nodes, bad mappings)
    #[error("Graph error: {0}")]
    GraphError(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Data-related errors
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Malformed or unsupported NIfTI volumes
    #[error("NIfTI error: {0}")]
    NiftiError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),
}

impl NodeError {
    /// Create a shape error with helpful suggestions
    pub fn shape_error(expected: &str, got: &str, suggestion: Option<&str>) -> Self {
        let message = if let Some(sugg) = suggestion {
            format!("Expected {}, got {}. Suggestion: {}", expected, got, sugg)
        } else {
            format!("Expected {}, got {}", expected, got)
        };
        NodeError::ShapeError(message)
    }

    /// Create an operation error with context
    pub fn operation_error(operation: &str, message: &str) -> Self {
        NodeError::OperationError {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    pub fn unknown_symbol(kind: &str, name: &str) -> Self {
        NodeError::UnknownSymbol {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for NodeError {
    fn from(err: bincode::Error) -> Self {
        NodeError::SerializationError(err.to_string())
    }
}

/// Result type for toolkit operations
pub type NodeResult<T> = Result<T, NodeError>;

/// Error context for providing additional debugging information
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub operation: String,
    pub tensor_shapes: Vec<String>,
    pub node: Option<String>,
    pub case_id: Option<String>,
    pub suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            tensor_shapes: Vec::new(),
            node: None,
            case_id: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: &str) -> Self {
        self.tensor_shapes.push(shape.to_string());
        self
    }

    pub fn with_node(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }

    pub fn with_case(mut self, case_id: &str) -> Self {
        self.case_id = Some(case_id.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestions.push(suggestion.to_string());
        self
    }

    pub fn to_error_message(&self) -> String {
        let mut message = format!("Operation: {}", self.operation);

        if !self.tensor_shapes.is_empty() {
            message.push_str(&format!("\nTensor shapes: {}", self.tensor_shapes.join(", ")));
        }

        if let Some(ref node) = self.node {
            message.push_str(&format!("\nNode: {}", node));
        }

        if let Some(ref case_id) = self.case_id {
            message.push_str(&format!("\nCase: {}", case_id));
        }

        if !self.suggestions.is_empty() {
            message.push_str("\nSuggestions:");
            for suggestion in &self.suggestions {
                message.push_str(&format!("\n  - {}", suggestion));
            }
        }

        message
    }
}

/// Helper trait for adding context to errors
pub trait WithContext<T> {
    fn with_context<F>(self, f: F) -> NodeResult<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> WithContext<T> for NodeResult<T> {
    fn with_context<F>(self, f: F) -> NodeResult<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| {
            let context = f();
            match e {
                NodeError::ShapeError(msg) => {
                    NodeError::ShapeError(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                NodeError::OperationError { operation, message } => NodeError::OperationError {
                    operation,
                    message: format!("{}\nContext: {}", message, context.to_error_message()),
                },
                NodeError::InvalidData(msg) => {
                    NodeError::InvalidData(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                NodeError::NiftiError(msg) => {
                    NodeError::NiftiError(format!("{}\nContext: {}", msg, context.to_error_message()))
                }
                _ => e,
            }
        })
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    InvalidOperation,
    SymbolNotFound,
    GraphInvalid,
    ConfigInvalid,
    DataInvalid,
    SerializationFailed,
    IoFailed,
}

impl ErrorCode {
    /// Process exit status reported by the command line tool.
    pub fn exit_status(self) -> u8 {
        match self {
            ErrorCode::InvalidOperation => 1,
            ErrorCode::ConfigInvalid | ErrorCode::SymbolNotFound => 2,
            ErrorCode::DataInvalid => 3,
            ErrorCode::IoFailed => 4,
            ErrorCode::ShapeMismatch | ErrorCode::GraphInvalid => 5,
            ErrorCode::SerializationFailed => 6,
        }
    }
}

impl NodeError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            NodeError::ShapeError(_) => ErrorCode::ShapeMismatch,
            NodeError::OperationError { .. } => ErrorCode::InvalidOperation,
            NodeError::UnknownSymbol { .. } => ErrorCode::SymbolNotFound,
            NodeError::GraphError(_) => ErrorCode::GraphInvalid,
            NodeError::InvalidConfig(_) => ErrorCode::ConfigInvalid,
            NodeError::InvalidData(_) => ErrorCode::DataInvalid,
            NodeError::NiftiError(_) => ErrorCode::DataInvalid,
            NodeError::SerializationError(_) => ErrorCode::SerializationFailed,
            NodeError::IoError(_) => ErrorCode::IoFailed,
        }
    }

    /// Check if this is a recoverable error, i.e. fixing files on disk and
    /// rerunning the same configuration can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.code(), ErrorCode::DataInvalid | ErrorCode::IoFailed)
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            NodeError::ShapeError(msg) => {
                format!("Shape Error: {}\n\nCheck node_configs against the volumes on disk and the channel counts of the hyperedge convolutions.", msg)
            }
            NodeError::UnknownSymbol { kind, name } => {
                format!("Unknown {} '{}'.\n\nRun `node-toolkit symbols` to list every exported name.", kind, name)
            }
            NodeError::GraphError(msg) => {
                format!("Graph Error: {}\n\nEvery node must be an input or be produced by a hyperedge, and hyperedges must not form a cycle.", msg)
            }
            NodeError::InvalidConfig(msg) => {
                format!("Configuration Error: {}\n\nFix the experiment file and run `node-toolkit check` again.", msg)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error() {
        let error = NodeError::shape_error("[1, 8, 8, 8]", "[2, 8, 8, 8]", Some("Check the node channel count"));
        assert!(error.to_string().contains("Expected [1, 8, 8, 8], got [2, 8, 8, 8]"));
        assert!(error.to_string().contains("Check the node channel count"));
    }

    #[test]
    fn test_error_context() {
        let context = ErrorContext::new("load_volume")
            .with_shape("[1, 64, 64, 64]")
            .with_node("n3")
            .with_case("0007")
            .with_suggestion("Check the file suffix");

        let message = context.to_error_message();
        assert!(message.contains("Operation: load_volume"));
        assert!(message.contains("Tensor shapes: [1, 64, 64, 64]"));
        assert!(message.contains("Node: n3"));
        assert!(message.contains("Case: 0007"));
        assert!(message.contains("Check the file suffix"));
    }

    #[test]
    fn test_with_context_decorates_data_errors() {
        let result: NodeResult<()> = Err(NodeError::InvalidData("bad csv".to_string()));
        let err = result
            .with_context(|| ErrorContext::new("read_csv").with_case("0001"))
            .unwrap_err();
        assert!(err.to_string().contains("Case: 0001"));

        let result: NodeResult<()> = Err(NodeError::unknown_symbol("loss", "x"));
        let err = result.with_context(|| ErrorContext::new("resolve")).unwrap_err();
        assert_eq!(err, NodeError::unknown_symbol("loss", "x"));
    }

    #[test]
    fn test_error_codes() {
        let shape_error = NodeError::ShapeError("test".to_string());
        assert_eq!(shape_error.code(), ErrorCode::ShapeMismatch);
        assert!(!shape_error.is_recoverable());

        let missing = NodeError::unknown_symbol("metric", "node_nope_metric");
        assert_eq!(missing.code(), ErrorCode::SymbolNotFound);
        assert!(missing.to_string().contains("node_nope_metric"));
        assert!(missing.user_message().contains("node-toolkit symbols"));
    }

    #[test]
    fn test_exit_status_by_code() {
        let config = NodeError::InvalidConfig("batch size".to_string());
        assert_eq!(config.code().exit_status(), 2);
        assert!(!config.is_recoverable());

        let io = NodeError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "case_000_0000.nii"));
        assert_eq!(io.code().exit_status(), 4);
        assert!(io.is_recoverable());

        let data = NodeError::NiftiError("truncated header".to_string());
        assert_eq!(data.code(), ErrorCode::DataInvalid);
        assert_eq!(data.code().exit_status(), 3);
        assert!(data.is_recoverable());

        assert_ne!(NodeError::GraphError("cycle".to_string()).code().exit_status(), 0);
    }
}
