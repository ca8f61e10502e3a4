//! Wiring of the local pipeline: directory store, spool queues, workers

use crate::config::PipelineConfig;
use crate::consolidate::Consolidator;
use crate::error::Result;
use crate::export::Exporter;
use crate::queue::{MessageQueue, SpoolQueue};
use crate::reducer::FlowRecordReducer;
use crate::store::{FsStore, ObjectStore};
use crate::upload::Uploader;
use crate::worker::{ConsolidateProcessor, ShutdownState, SummarizeProcessor, Summarizer, Worker};
use std::sync::Arc;
use tracing::{error, info};

/// Every component of a pipeline, opened from one configuration
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    summarize_queue: Arc<dyn MessageQueue>,
    consolidate_queue: Arc<dyn MessageQueue>,
    shutdown: Arc<ShutdownState>,
}

impl Pipeline {
    /// Open the store and queues named by `config`
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        let store = FsStore::open(&config.store.root).await?;
        let summarize_queue = SpoolQueue::open(&config.queues.summarize).await?;
        let consolidate_queue = SpoolQueue::open(&config.queues.consolidate).await?;
        info!(
            store = %config.store.root.display(),
            summarize = %config.queues.summarize.display(),
            consolidate = %config.queues.consolidate.display(),
            "Pipeline opened"
        );
        Ok(Self::from_parts(
            config,
            Arc::new(store),
            Arc::new(summarize_queue),
            Arc::new(consolidate_queue),
        ))
    }

    /// Assemble a pipeline from already opened backends
    pub fn from_parts(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        summarize_queue: Arc<dyn MessageQueue>,
        consolidate_queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            config,
            store,
            summarize_queue,
            consolidate_queue,
            shutdown: Arc::new(ShutdownState::new()),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Object store
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Queue of upload notices
    pub fn summarize_queue(&self) -> Arc<dyn MessageQueue> {
        self.summarize_queue.clone()
    }

    /// Queue of summary notices
    pub fn consolidate_queue(&self) -> Arc<dyn MessageQueue> {
        self.consolidate_queue.clone()
    }

    /// Shutdown state shared by the workers of this pipeline
    pub fn shutdown_state(&self) -> Arc<ShutdownState> {
        self.shutdown.clone()
    }

    /// Raw file uploader
    pub fn uploader(&self) -> Uploader {
        Uploader::new(self.store(), self.summarize_queue())
    }

    /// Raw file summarizer
    pub fn summarizer(&self) -> Summarizer {
        Summarizer::new(
            self.store(),
            self.consolidate_queue(),
            FlowRecordReducer::new(self.config.reducer.clone()),
            self.config.layout.clone(),
        )
    }

    /// Consolidation engine
    pub fn consolidator(&self) -> Consolidator {
        Consolidator::new(self.store(), self.config.layout.clone(), self.config.retry.clone())
    }

    /// Pair exporter
    pub fn exporter(&self) -> Exporter {
        Exporter::new(self.store(), self.config.layout.clone())
    }

    /// Worker of the summarize queue
    pub fn summarize_worker(&self) -> Worker<SummarizeProcessor> {
        Worker::new(
            self.summarize_queue(),
            SummarizeProcessor::new(self.summarizer()),
            self.config.worker.clone(),
        )
        .with_shutdown(self.shutdown_state())
    }

    /// Worker of the consolidate queue
    pub fn consolidate_worker(&self) -> Worker<ConsolidateProcessor> {
        Worker::new(
            self.consolidate_queue(),
            ConsolidateProcessor::new(self.consolidator()),
            self.config.worker.clone(),
        )
        .with_shutdown(self.shutdown_state())
    }

    /// Run both workers until Ctrl-C or [`ShutdownState::begin_shutdown`]
    pub async fn run(&self) -> Result<()> {
        let summarize = self.summarize_worker();
        let consolidate = self.consolidate_worker();
        let shutdown = self.shutdown_state();

        let signal = async {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Could not listen for Ctrl-C: {}", e);
                        // Keep running until shut down programmatically
                        shutdown.wait_for_shutdown().await;
                    } else {
                        info!("Ctrl-C received, shutting down");
                    }
                }
                _ = shutdown.wait_for_shutdown() => {}
            }
            shutdown.begin_shutdown();
        };

        let (_, summarized, consolidated) = tokio::join!(signal, summarize.run(), consolidate.run());
        summarized?;
        consolidated?;
        Ok(())
    }
}
