use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The device was removed or reset. All device objects must be recreated.
    #[error("device lost")]
    DeviceLost,
    #[error("out of memory")]
    OutOfMemory,
    /// A fixed-capacity pool is exhausted.
    #[error("out of capacity: {0}")]
    OutOfCapacity(&'static str),
    #[error(transparent)]
    ShaderCompile(#[from] ShaderCompileError),
    #[error("failed to create pipeline: {0}")]
    PipelineCreate(String),
    /// The swapchain no longer matches the surface and must be recreated.
    #[error("swapchain out of date")]
    SwapchainOutOfDate,
    #[error("swapchain suboptimal")]
    Suboptimal,
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("no suitable adapter found")]
    NoSuitableAdapter,
    #[error("operation timed out")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// The renderer was shut down and renders no more frames.
    #[error("renderer is shut down")]
    Shutdown,
    /// Any other error reported by the backend API.
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Returns `true` if the error is resolved by recreating the swapchain.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate | Self::Suboptimal)
    }

    /// Returns `true` if the device and all its objects must be recreated.
    pub fn requires_device_restart(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("frame graph contains a cycle")]
    CyclicGraph,
    #[error("output {0:?} is produced by more than one pass")]
    DuplicateOutput(String),
    #[error("input {0:?} is not produced by any pass")]
    UnresolvedInput(String),
    #[error("pass {0:?} has no registered implementation")]
    UnregisteredPass(String),
    #[error("pass {0:?} appears more than once")]
    DuplicatePass(String),
}

#[derive(Clone, Debug, Error)]
#[error("failed to compile {file}:{entry}: {log}")]
pub struct ShaderCompileError {
    pub file: String,
    pub entry: String,
    /// Output of the compiler.
    pub log: String,
}

#[derive(Debug, Error)]
#[error("failed to load asset {path:?}: {kind}")]
pub struct AssetError {
    pub path: PathBuf,
    pub kind: AssetErrorKind,
}

#[derive(Debug, Error)]
pub enum AssetErrorKind {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::{Error, GraphError};

    #[test]
    fn error_classification() {
        assert!(Error::SwapchainOutOfDate.is_recoverable());
        assert!(Error::Suboptimal.is_recoverable());
        assert!(!Error::DeviceLost.is_recoverable());
        assert!(Error::DeviceLost.requires_device_restart());
        assert!(!Error::OutOfMemory.requires_device_restart());
        assert!(!Error::Shutdown.requires_device_restart());
        assert!(!Error::Shutdown.is_recoverable());
    }

    #[test]
    fn graph_error_converts() {
        let err: Error = GraphError::DuplicateOutput("albedo".to_owned()).into();
        assert!(matches!(
            err,
            Error::Graph(GraphError::DuplicateOutput(ref name)) if name == "albedo"
        ));
    }
}
