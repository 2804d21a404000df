use std::path::{Path, PathBuf};

use tokio::net::UnixStream;
use tracing::trace;

use super::{BoxFuture, BoxedStream, Connector};
use crate::error::Result;

/// Connects to a Unix domain socket path.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connector for UnixConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxedStream>> {
        Box::pin(async move {
            let stream = UnixStream::connect(&self.path).await?;
            trace!(path = %self.path.display(), "Unix stream opened");
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn peer(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}
