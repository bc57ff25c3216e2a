use async_trait::async_trait;

use super::{PipelineStage, StageContext};
use crate::domain::stage::{PipelineArtifacts, StageError};

/// NoopStage: 成果物をそのまま次段へ渡すスタブ実装。
pub struct NoopStage {
    name: String,
}

impl NoopStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl PipelineStage for NoopStage {
    async fn run(
        &self,
        artifacts: PipelineArtifacts,
        _ctx: &StageContext,
    ) -> Result<PipelineArtifacts, StageError> {
        Ok(artifacts)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
