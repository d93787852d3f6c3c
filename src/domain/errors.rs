use thiserror::Error;

/// Errors surfaced by the guided-trading backend client
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend returned {status} for {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },

    #[error("Backend transport failure: {reason}")]
    Transport { reason: String },

    #[error("Backend response decode failed for {path}: {reason}")]
    Decode { path: String, reason: String },
}

/// Errors surfaced by the LLM gateway client
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("LLM gateway returned an empty reply for model {model}")]
    EmptyReply { model: String },

    #[error("LLM transport failure: {reason}")]
    Transport { reason: String },
}

/// Errors surfaced by the MCP tool bridge
#[derive(Debug, Error)]
pub enum McpError {
    #[error("MCP tool {tool} failed in namespace {namespace}: {reason}")]
    ToolFailed {
        tool: String,
        namespace: String,
        reason: String,
    },

    #[error("MCP transport failure: {reason}")]
    Transport { reason: String },
}
