//! Pipeline stage trait and coordinator
//!
//! Defines the interface for pipeline stages and provides a coordinator
//! for managing stage lifecycle.

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info};

/// Trait for pipeline stages that process media data
#[async_trait]
pub trait PipelineStage: Send {
    /// Run the stage, processing data until its input closes
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &str;
}

/// Pipeline coordinator that runs a set of stages to completion
pub struct PipelineCoordinator {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl PipelineCoordinator {
    /// Create a new pipeline coordinator
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Add a stage to the pipeline
    pub fn add_stage(&mut self, stage: Box<dyn PipelineStage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in its own task and wait for all of them
    ///
    /// Returns the number of stages that ended with an error.
    pub async fn run(self) -> usize {
        let mut tasks = Vec::with_capacity(self.stages.len());
        for mut stage in self.stages {
            tasks.push(tokio::spawn(async move {
                let result = stage.run().await;
                (stage.name().to_string(), result)
            }));
        }

        let mut failures = 0;
        for task in tasks {
            match task.await {
                Ok((name, Ok(()))) => info!("{}: finished", name),
                Ok((name, Err(e))) => {
                    error!("{}: failed: {:#}", name, e);
                    failures += 1;
                }
                Err(e) => {
                    error!("stage task panicked: {}", e);
                    failures += 1;
                }
            }
        }
        failures
    }
}

impl Default for PipelineCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
