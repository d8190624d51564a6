// Batch orchestration: state machine, progress events and the orchestrator

pub mod batch_orchestrator;
pub mod events;
pub mod state;

pub use batch_orchestrator::{
    AnalysisReport, BatchOrchestrator, BatchOutcome, BatchRequest, GenerateRequest,
};
pub use events::{BatchEvent, EventSink};
pub use state::BatchState;
