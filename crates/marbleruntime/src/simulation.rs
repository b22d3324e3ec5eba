use crate::compiler::{CompiledPipeline, PipelineCompiler};
use crate::flow_manager::FlowManager;
use crate::model::SimulationModel;
use crate::registry::FactoryRegistry;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use marblecore::{EventBus, EventReceiver, GraphDocument, MarbleError, SimulationEvent};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runs graph documents against a set of operator factories.
pub struct Simulation {
    registry: Arc<FactoryRegistry>,
    config: SimulationConfig,
}

/// Configuration for the simulation runner
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    /// Stop a run after this long. A document's own setting takes precedence.
    pub max_duration_ms: Option<u64>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SimulationStatus {
    /// The root pipeline completed.
    Completed,
    /// An unhandled error reached the subscriber.
    Failed,
    /// The run was cancelled through its handle.
    Cancelled,
    /// The run hit its maximum duration.
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutcome {
    pub status: SimulationStatus,
    /// Items delivered to the subscriber, the final error included.
    pub delivered: usize,
    /// Paths still open when the run ended.
    pub open_paths: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A running simulation.
pub struct SimulationHandle {
    pub id: Uuid,
    pub events: EventReceiver,
    flow: FlowManager,
    cancellation: CancellationToken,
    task: JoinHandle<SimulationOutcome>,
}

impl Simulation {
    pub fn new(registry: Arc<FactoryRegistry>) -> Self {
        Self::with_config(registry, SimulationConfig::default())
    }

    pub fn with_config(registry: Arc<FactoryRegistry>, config: SimulationConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<FactoryRegistry> {
        &self.registry
    }

    /// Validate and compile `document` without running it.
    pub fn compile(
        &self,
        document: &GraphDocument,
    ) -> Result<(CompiledPipeline, EventReceiver), MarbleError> {
        let model = SimulationModel::from_document(document)?;
        let (bus, events) = EventBus::channel();
        let compiler = PipelineCompiler::new(self.registry.clone(), FlowManager::new(bus));
        let pipeline = compiler.compile(&model)?;
        Ok((pipeline, events))
    }

    /// Compile `document` and subscribe to it on a new task.
    pub fn start(&self, document: &GraphDocument) -> Result<SimulationHandle, MarbleError> {
        let (pipeline, events) = self.compile(document)?;
        let id = Uuid::new_v4();
        let max_duration_ms = pipeline
            .settings()
            .max_duration_ms
            .or(self.config.max_duration_ms);
        let cancellation = CancellationToken::new();
        let flow = pipeline.flow().clone();

        tracing::info!(
            simulation = %id,
            name = %document.name,
            root = %pipeline.root(),
            "starting simulation"
        );
        let task = tokio::spawn(run(id, pipeline, max_duration_ms, cancellation.clone()));

        Ok(SimulationHandle {
            id,
            events,
            flow,
            cancellation,
            task,
        })
    }
}

async fn run(
    id: Uuid,
    pipeline: CompiledPipeline,
    max_duration_ms: Option<u64>,
    cancellation: CancellationToken,
) -> SimulationOutcome {
    let started_at = Utc::now();
    let start = Instant::now();
    let deadline = max_duration_ms.map(|ms| start + Duration::from_millis(ms));
    let flow = pipeline.flow().clone();

    let mut stream = pipeline.subscribe();
    let mut delivered = 0;
    let status = loop {
        let timeout = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = cancellation.cancelled() => {
                flow.clear();
                break SimulationStatus::Cancelled;
            }
            _ = timeout => break SimulationStatus::TimedOut,
            item = stream.next() => match item {
                Some(item) => {
                    delivered += 1;
                    if item.is_error() {
                        break SimulationStatus::Failed;
                    }
                }
                None => break SimulationStatus::Completed,
            },
        }
    };
    drop(stream);

    let open_paths = flow.open_paths();
    flow.close();

    let duration_ms = start.elapsed().as_millis() as u64;
    tracing::info!(simulation = %id, ?status, delivered, duration_ms, "simulation finished");
    SimulationOutcome {
        status,
        delivered,
        open_paths,
        started_at,
        duration_ms,
    }
}

impl SimulationHandle {
    /// Stop the run. Pending nested pipelines are dropped with it.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// A token that cancels this run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Flow manager of this run; outlives the handle.
    pub fn flow(&self) -> &FlowManager {
        &self.flow
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> Result<SimulationOutcome, MarbleError> {
        self.task
            .await
            .map_err(|e| MarbleError::Execution(format!("simulation task failed: {e}")))
    }

    /// Wait for the run to end and gather every event it reported.
    pub async fn collect(self) -> Result<(SimulationOutcome, Vec<SimulationEvent>), MarbleError> {
        let mut events = self.events;
        let outcome = self
            .task
            .await
            .map_err(|e| MarbleError::Execution(format!("simulation task failed: {e}")))?;

        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
        Ok((outcome, collected))
    }
}
