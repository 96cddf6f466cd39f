use std::{sync::Arc, time::Instant};

use chat_pipeline::ChatPipeline;
use common::utils::config::AppConfig;

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<ChatPipeline>,
    pub config: AppConfig,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(config: &AppConfig, pipeline: Arc<ChatPipeline>) -> Self {
        Self {
            pipeline,
            config: config.clone(),
            started_at: Instant::now(),
        }
    }
}
