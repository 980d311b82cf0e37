//! Error taxonomy for the cluster runtime.
//!
//! Only two error classes are allowed to take the process down: a
//! [`ConfigError`] at startup, and a non-optional unassignable block
//! ([`PlacementError::Unassignable`]). Everything else is recovered locally
//! by the supervisor loop — transient I/O failures and consensus
//! not-ready conditions are logged and retried on the next tick, block
//! runtime failures clear ownership and trigger re-placement.

use thiserror::Error;

/// Fatal configuration problems: missing/malformed config files, unresolved
/// input wiring, unknown block or resource types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("block '{block}' has unknown type '{kind}'")]
    UnknownBlockType { block: String, kind: String },

    #[error("unknown resource type '{0}'")]
    UnknownResourceType(String),

    #[error("block '{block}' has a malformed require entry: {detail}")]
    BadRequire { block: String, detail: String },

    #[error("block '{block}' input '{port}' wires to unknown block '{wiring}'")]
    UnresolvedInput {
        block: String,
        port: String,
        wiring: String,
    },

    #[error("block '{block}' pushes to unknown target '{target}'")]
    UnresolvedTarget { block: String, target: String },

    #[error("block '{block}' pushes to '{target}' but that input slot is already wired")]
    InputSlotTaken { block: String, target: String },

    #[error("block '{block}' has a malformed parameter '{param}': {detail}")]
    BadParameter {
        block: String,
        param: String,
        detail: String,
    },

    #[error("node '{0}' is not listed in the nodes section")]
    UnknownNode(String),
}

/// Replicated-store failures. `NotReady` writes are dropped by the caller
/// and retried on the next supervisor tick; forwarding failures are
/// transient I/O.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("replicated store has no elected leader yet")]
    NotReady,

    #[error("consensus write failed: {0}")]
    Consensus(String),

    #[error("forwarding write to leader failed: {0}")]
    Forward(String),
}

/// Placement failures. `Unassignable` is fatal unless the block is marked
/// optional, in which case the supervisor logs a warning and blacklists the
/// block locally.
#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("no node satisfies the resource requirements of block '{0}'")]
    Unassignable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A resource probe failed outright. The evaluator records fitness 0 for
/// the probing node and carries on.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("HTTP probe failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("probe I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Runtime failure inside a block: `run()` returned an error or an input
/// handler rejected a value. Logged by the supervisor, never fatal.
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("block received a value it cannot interpret: {0}")]
    BadValue(String),

    #[error("block received input on undeclared port '{0}'")]
    UnknownPort(String),

    #[error("block runtime failure: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_messages_name_the_block() {
        let err = ConfigError::UnresolvedInput {
            block: "b2".into(),
            port: "value".into(),
            wiring: "nope".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("b2"));
        assert!(msg.contains("nope"));
    }

    #[test]
    fn placement_error_wraps_store_error() {
        let err = PlacementError::from(StoreError::NotReady);
        assert!(err.to_string().contains("no elected leader"));
    }

    #[test]
    fn unassignable_names_the_block() {
        let err = PlacementError::Unassignable("b3".into());
        assert!(err.to_string().contains("b3"));
    }
}
