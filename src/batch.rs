use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointOptions};
use crate::chemistry::{ChemistryEngine, apply_structure};
use crate::client::SourceClient;
use crate::context::{CancellationToken, RunContext};
use crate::domain::{CompoundIdentifiers, CompoundQuery, RejectedIdentifier, SourceKind};
use crate::error::CollectorError;
use crate::merge::{Merger, SourceOutcome};
use crate::model::{Annotation, Compound};
use crate::stats::{ProcessingStats, StatsCollector};

pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub completed: usize,
    pub total: usize,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

/// Sink that drops every event.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// An input entry without a single valid identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedInput {
    pub index: usize,
    pub query: CompoundQuery,
    pub reasons: Vec<RejectedIdentifier>,
}

/// A compound whose lookups did not all finish before cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelledCompound {
    pub index: usize,
    pub identifiers: CompoundIdentifiers,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// One merged compound per valid input, in input order.
    pub dataset: Vec<Compound>,
    pub rejected: Vec<RejectedInput>,
    pub cancelled: Vec<CancelledCompound>,
    pub stats: ProcessingStats,
}

/// Fans a compound list out over every enabled source on a bounded pool of
/// worker threads and merges each compound once all of its sources answered.
pub struct BatchProcessor {
    ctx: RunContext,
    clients: Vec<SourceClient>,
    merger: Merger,
    chemistry: Option<Arc<dyn ChemistryEngine>>,
    checkpoint: Option<CheckpointOptions>,
    workers: usize,
}

impl BatchProcessor {
    pub fn new(ctx: RunContext, clients: Vec<SourceClient>) -> Self {
        Self {
            ctx,
            clients,
            merger: Merger::default(),
            chemistry: None,
            checkpoint: None,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_merger(mut self, merger: Merger) -> Self {
        self.merger = merger;
        self
    }

    pub fn with_chemistry(mut self, engine: Arc<dyn ChemistryEngine>) -> Self {
        self.chemistry = Some(engine);
        self
    }

    /// Persist every merged compound so an interrupted batch can resume.
    pub fn with_checkpoint(mut self, options: CheckpointOptions) -> Self {
        self.checkpoint = Some(options);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Handle that stops the next (or current) run cooperatively from another
    /// thread. A cancelled token is retired when its run ends.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Runs one batch. Statistics cover this call only; breaker state and
    /// cached responses carry over between calls.
    pub fn process(
        &mut self,
        queries: &[CompoundQuery],
        enabled: &[SourceKind],
        sink: &dyn ProgressSink,
    ) -> Result<BatchOutcome, CollectorError> {
        self.ctx.stats = StatsCollector::new();
        let checkpoint = self
            .checkpoint
            .as_ref()
            .map(|options| Checkpoint::open(&options.directory, queries, options.resume))
            .transpose()?;

        let outcome = self.run(queries, enabled, sink, checkpoint.as_ref());
        if self.ctx.cancel.is_cancelled() {
            debug!("retiring cancelled token");
            self.ctx.cancel = CancellationToken::new();
        }
        let outcome = outcome?;

        if let Some(checkpoint) = &checkpoint
            && outcome.cancelled.is_empty()
            && let Err(err) = checkpoint.discard()
        {
            warn!(path = %checkpoint.path(), error = %err, "failed to remove finished checkpoint");
        }
        Ok(outcome)
    }

    fn run(
        &self,
        queries: &[CompoundQuery],
        enabled: &[SourceKind],
        sink: &dyn ProgressSink,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<BatchOutcome, CollectorError> {
        let clients = self.select_clients(enabled)?;
        let started = Instant::now();

        let mut restored = checkpoint.map(Checkpoint::completed).unwrap_or_default();
        let mut resumed = Vec::new();
        let mut rejected = Vec::new();
        let mut plans = Vec::new();
        for (index, query) in queries.iter().enumerate() {
            if let Some(compound) = restored.remove(&index) {
                self.ctx.stats.record_compound(compound.is_resolved());
                resumed.push((index, compound));
                continue;
            }
            let (identifiers, invalid) = CompoundIdentifiers::from_query(query);
            if identifiers.is_empty() {
                warn!(index, "input entry has no valid identifier");
                self.ctx.stats.record_rejected();
                rejected.push(RejectedInput {
                    index,
                    query: query.clone(),
                    reasons: invalid,
                });
            } else {
                plans.push(Plan {
                    index,
                    identifiers,
                    invalid,
                });
            }
        }

        let mut tasks = Vec::new();
        let mut slots = Vec::with_capacity(plans.len());
        for (plan_idx, plan) in plans.iter().enumerate() {
            let mut outcomes = Vec::new();
            let mut remaining = 0;
            for (client_idx, client) in clients.iter().enumerate() {
                if client.accepts(&plan.identifiers) {
                    tasks.push(Task {
                        plan: plan_idx,
                        client: client_idx,
                    });
                    remaining += 1;
                } else {
                    outcomes.push(SourceOutcome::NotApplicable(client.kind()));
                }
            }
            slots.push(Mutex::new(Slot {
                outcomes,
                remaining,
            }));
        }

        info!(
            compounds = plans.len(),
            resumed = resumed.len(),
            rejected = rejected.len(),
            tasks = tasks.len(),
            sources = clients.len(),
            "starting batch"
        );

        let run = BatchRun {
            processor: self,
            clients,
            total: plans.len() + resumed.len(),
            plans,
            tasks,
            slots,
            next: AtomicUsize::new(0),
            completed: AtomicUsize::new(resumed.len()),
            results: Mutex::new(resumed),
            cancelled: Mutex::new(Vec::new()),
            checkpoint,
            sink,
            started,
        };

        for (plan_idx, slot) in run.slots.iter().enumerate() {
            let idle = {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                (slot.remaining == 0).then(|| std::mem::take(&mut slot.outcomes))
            };
            if let Some(outcomes) = idle {
                run.finish(plan_idx, outcomes);
            }
        }

        let width = self.workers.min(run.tasks.len());
        thread::scope(|scope| {
            for _ in 0..width {
                scope.spawn(|| run.work());
            }
        });

        Ok(run.into_outcome(rejected))
    }

    fn select_clients(&self, enabled: &[SourceKind]) -> Result<Vec<&SourceClient>, CollectorError> {
        if enabled.is_empty() {
            return Err(CollectorError::NoSourcesEnabled);
        }
        let mut selected: Vec<&SourceClient> = Vec::new();
        for kind in enabled {
            if selected.iter().any(|client| client.kind() == *kind) {
                continue;
            }
            let client = self
                .clients
                .iter()
                .find(|client| client.kind() == *kind)
                .ok_or_else(|| CollectorError::UnknownSource(kind.to_string()))?;
            selected.push(client);
        }
        Ok(selected)
    }
}

struct Plan {
    index: usize,
    identifiers: CompoundIdentifiers,
    invalid: Vec<RejectedIdentifier>,
}

struct Task {
    plan: usize,
    client: usize,
}

struct Slot {
    outcomes: Vec<SourceOutcome>,
    remaining: usize,
}

struct BatchRun<'a> {
    processor: &'a BatchProcessor,
    clients: Vec<&'a SourceClient>,
    total: usize,
    plans: Vec<Plan>,
    tasks: Vec<Task>,
    slots: Vec<Mutex<Slot>>,
    next: AtomicUsize,
    completed: AtomicUsize,
    results: Mutex<Vec<(usize, Compound)>>,
    cancelled: Mutex<Vec<usize>>,
    checkpoint: Option<&'a Checkpoint>,
    sink: &'a dyn ProgressSink,
    started: Instant,
}

impl BatchRun<'_> {
    fn work(&self) {
        let ctx = &self.processor.ctx;
        loop {
            if ctx.cancel.is_cancelled() {
                debug!("worker stopping on cancellation");
                return;
            }
            let task_idx = self.next.fetch_add(1, Ordering::SeqCst);
            let Some(task) = self.tasks.get(task_idx) else {
                return;
            };
            let plan = &self.plans[task.plan];
            let client = self.clients[task.client];
            let kind = client.kind();

            let outcome = match client.fetch_compound(ctx, &plan.identifiers) {
                Ok(Some(record)) => SourceOutcome::Record(record),
                Ok(None) => SourceOutcome::NotApplicable(kind),
                Err(err) => {
                    debug!(
                        source = %kind,
                        compound = %plan.identifiers.label(),
                        code = err.code(),
                        "source contributed nothing"
                    );
                    SourceOutcome::Failed(kind, err)
                }
            };

            let finished = {
                let mut slot = self.slots[task.plan]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                slot.outcomes.push(outcome);
                slot.remaining -= 1;
                (slot.remaining == 0).then(|| std::mem::take(&mut slot.outcomes))
            };
            if let Some(outcomes) = finished {
                self.finish(task.plan, outcomes);
            }
        }
    }

    fn finish(&self, plan_idx: usize, outcomes: Vec<SourceOutcome>) {
        let processor = self.processor;
        let ctx = &processor.ctx;
        let plan = &self.plans[plan_idx];

        // A lookup cut short by cancellation leaves the merge incomplete.
        if outcomes.iter().any(SourceOutcome::is_cancelled) {
            self.cancelled
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(plan_idx);
            return;
        }

        let mut compound = processor.merger.merge(&plan.identifiers, outcomes);
        let mut annotations = plan
            .invalid
            .iter()
            .cloned()
            .map(Annotation::from)
            .collect::<Vec<_>>();
        annotations.append(&mut compound.annotations);
        compound.annotations = annotations;
        if compound.is_resolved()
            && let Some(engine) = &processor.chemistry
        {
            apply_structure(&mut compound, engine.as_ref(), ctx);
        }

        let resolved = compound.is_resolved();
        ctx.stats.record_compound(resolved);
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.event(ProgressEvent {
            message: format!(
                "phase=Merge; compound={}; status={}",
                plan.identifiers.label(),
                if resolved { "resolved" } else { "unresolved" }
            ),
            completed,
            total: self.total,
            elapsed: Some(self.started.elapsed()),
        });

        if let Some(checkpoint) = self.checkpoint
            && let Err(err) = checkpoint.record(plan.index, &compound)
        {
            warn!(index = plan.index, error = %err, "failed to update checkpoint");
        }
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((plan.index, compound));
    }

    fn into_outcome(self, rejected: Vec<RejectedInput>) -> BatchOutcome {
        let processor = self.processor;
        let ctx = &processor.ctx;

        let mut cancelled_plans = self
            .cancelled
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        for (plan_idx, slot) in self.slots.into_iter().enumerate() {
            let slot = slot.into_inner().unwrap_or_else(PoisonError::into_inner);
            if slot.remaining > 0 {
                cancelled_plans.push(plan_idx);
            }
        }
        cancelled_plans.sort_unstable();
        let cancelled = cancelled_plans
            .into_iter()
            .map(|plan_idx| {
                ctx.stats.record_cancelled();
                let plan = &self.plans[plan_idx];
                CancelledCompound {
                    index: plan.index,
                    identifiers: plan.identifiers.clone(),
                }
            })
            .collect::<Vec<_>>();

        let mut results = self
            .results
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        results.sort_by_key(|(index, _)| *index);
        let dataset = results
            .into_iter()
            .map(|(_, compound)| compound)
            .collect::<Vec<_>>();

        let stats = ctx.stats.finalize(self.started.elapsed());
        info!(
            compounds = stats.total_compounds,
            resolved = stats.succeeded,
            unresolved = stats.failed,
            cancelled = cancelled.len(),
            elapsed_ms = stats.elapsed_ms,
            "batch finished"
        );

        BatchOutcome {
            dataset,
            rejected,
            cancelled,
            stats,
        }
    }
}
