use std::sync::Arc;

use crate::analyze::ImageAnalyzer;
use crate::config::Config;

pub struct AppState {
    pub config: Config,
    pub analyzer: Arc<dyn ImageAnalyzer>,
}

impl AppState {
    pub fn new(config: Config, analyzer: Arc<dyn ImageAnalyzer>) -> Self {
        Self { config, analyzer }
    }
}
