use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::signaling::SignalingHandler;

#[derive(Clone)]
pub struct AppState {
    signaling: Arc<SignalingHandler>,
    index_path: Arc<PathBuf>,
}

impl AppState {
    pub fn new(signaling: Arc<SignalingHandler>, index_path: impl Into<PathBuf>) -> Self {
        Self {
            signaling,
            index_path: Arc::new(index_path.into()),
        }
    }

    pub fn signaling(&self) -> &SignalingHandler {
        &self.signaling
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}
