//! One sync invocation over a catalog.
//!
//! Partitions are planned on a single control connection, then every
//! snapshot and cursor partition runs in its own task holding a semaphore
//! permit and a pooled connection. CDC streams that are (or just became)
//! streaming share one change session at the end, once no CDC snapshot is
//! left unfinished.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use checkpoint::{OpaqueStateValue, SyncManager};
use sync_core::{Catalog, FieldTypeRegistry, Stream, StreamId, SyncMode};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cdc::{
    activate_capture, check_prerequisites, list_capture_instances, run_cdc_session, CdcOutcome,
    CdcTracker, Lsn, TrackedStream,
};
use crate::checkpoint::MsSqlCdcCheckpoint;
use crate::connection::{ConnectionProvider, SourceConnection};
use crate::factory::PartitionFactory;
use crate::metadata::{load_table_metadata, TableMetadata};
use crate::partition::PartitionReadState;
use crate::reader::{PartitionOutcome, PartitionReader};
use crate::sink::{OutputSink, StateMessage};
use crate::{InvalidCdcPositionBehavior, ReplicationMethod, SyncOpts};

/// Everything partitions share during one invocation.
#[derive(Clone)]
pub struct SyncContext {
    pub provider: Arc<dyn ConnectionProvider>,
    pub registry: Arc<FieldTypeRegistry>,
    pub sink: Arc<dyn OutputSink>,
    pub opts: SyncOpts,
    /// Bounds how many partitions read at the same time
    pub permits: Arc<Semaphore>,
    pub cancel: CancellationToken,
}

impl SyncContext {
    pub fn new(provider: Arc<dyn ConnectionProvider>, sink: Arc<dyn OutputSink>, opts: SyncOpts) -> Self {
        let permits = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        Self {
            provider,
            registry: Arc::new(FieldTypeRegistry::default()),
            sink,
            opts,
            permits,
            cancel: CancellationToken::new(),
        }
    }
}

/// A stream that could not be synced. Sibling streams are unaffected.
#[derive(Debug)]
pub struct StreamFailure {
    pub stream: StreamId,
    pub error: anyhow::Error,
}

/// Result of a sync invocation.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub records: u64,
    pub failures: Vec<StreamFailure>,
    /// Global CDC position reached, in CDC mode
    pub cdc_position: Option<Lsn>,
}

impl SyncReport {
    fn fail(&mut self, stream: &StreamId, error: anyhow::Error) {
        error!("Stream {} failed: {:#}", stream, error);
        self.failures.push(StreamFailure {
            stream: stream.clone(),
            error,
        });
    }

    /// Error naming every failed stream, if any failed.
    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        let names = self
            .failures
            .iter()
            .map(|f| format!("{}: {:#}", f.stream, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        anyhow::bail!("{} stream(s) failed: {}", self.failures.len(), names)
    }
}

fn is_cdc_stream(opts: &SyncOpts, stream: &Stream) -> bool {
    opts.replication == ReplicationMethod::Cdc && stream.sync_mode == SyncMode::Incremental
}

// What the CDC setup decided for this invocation.
struct CdcPlan {
    position: Lsn,
    instances: BTreeMap<StreamId, String>,
}

async fn prepare_cdc(
    ctx: &SyncContext,
    conn: &mut dyn SourceConnection,
    manager: &SyncManager,
    streams: &[&Stream],
    states: &mut BTreeMap<StreamId, OpaqueStateValue>,
    report: &mut SyncReport,
) -> Result<Option<CdcPlan>> {
    check_prerequisites(conn).await;

    let ids: Vec<StreamId> = streams.iter().map(|s| s.id.clone()).collect();
    let mut instances = list_capture_instances(conn).await?;
    let enabled = activate_capture(conn, &ids, &instances, ctx.opts.cdc_activation_attempts).await;
    if !enabled.is_empty() {
        instances = list_capture_instances(conn).await?;
    }

    let mut tracked = Vec::new();
    for stream in streams {
        match instances.get(&stream.id) {
            Some(instance) => tracked.push(TrackedStream {
                stream: (*stream).clone(),
                instance: instance.name.clone(),
            }),
            None => report.fail(
                &stream.id,
                anyhow::anyhow!("No CDC capture instance for {}", stream.id),
            ),
        }
    }
    if tracked.is_empty() {
        return Ok(None);
    }

    let tracker = CdcTracker::new(Lsn::ZERO, tracked);
    let saved: Option<MsSqlCdcCheckpoint> = manager.read_checkpoint().await?;
    let saved = match saved {
        None => None,
        Some(saved) => {
            let valid = tracker.is_position_valid(conn, saved.lsn).await?;
            Some((saved.lsn, valid))
        }
    };
    let position = match saved {
        None => fresh_position(ctx, conn).await?,
        Some((lsn, true)) => {
            info!("Resuming CDC from saved position {}", lsn);
            lsn
        }
        Some((lsn, false)) => match ctx.opts.invalid_cdc_position {
            InvalidCdcPositionBehavior::FailSync => {
                for t in tracker.streams() {
                    report.fail(
                        &t.stream.id,
                        anyhow::anyhow!(
                            "Saved CDC position {} is no longer retained; re-sync the stream to recover",
                            lsn
                        ),
                    );
                }
                return Ok(None);
            }
            InvalidCdcPositionBehavior::ReSyncData => {
                warn!(
                    "Saved CDC position {} is no longer retained; re-syncing CDC streams",
                    lsn
                );
                for t in tracker.streams() {
                    states.remove(&t.stream.id);
                }
                fresh_position(ctx, conn).await?
            }
        },
    };

    Ok(Some(CdcPlan {
        position,
        instances: tracker
            .streams()
            .iter()
            .map(|t| (t.stream.id.clone(), t.instance.clone()))
            .collect(),
    }))
}

// Capture the current maximum LSN and record it before any snapshot starts,
// so snapshots and streaming agree on where changes begin.
async fn fresh_position(ctx: &SyncContext, conn: &mut dyn SourceConnection) -> Result<Lsn> {
    let position = CdcTracker::capture_position(conn).await?;
    info!("Captured CDC start position {}", position);
    ctx.sink
        .emit_state(StateMessage::Global {
            cdc: MsSqlCdcCheckpoint::new(position),
            streams: vec![],
        })
        .await?;
    Ok(position)
}

/// Sync every stream of `catalog`, resuming from the state `manager` holds.
///
/// Per-stream failures end up in the report; only failures that affect every
/// stream (no connection, unreadable checkpoint store) are returned as errors.
pub async fn run_sync(
    ctx: &SyncContext,
    catalog: &Catalog,
    manager: &SyncManager,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    let mut states = BTreeMap::new();
    for stream in &catalog.streams {
        if let Some(state) = manager.read_stream_state(&stream.id.key()).await? {
            states.insert(stream.id.clone(), state);
        }
    }

    let mut control = ctx
        .provider
        .acquire()
        .await
        .context("Failed to open the control connection")?;

    let mut planned: Vec<(&Stream, TableMetadata)> = Vec::new();
    for stream in &catalog.streams {
        match load_table_metadata(control.as_mut(), &stream.id).await {
            Ok(metadata) => planned.push((stream, metadata)),
            Err(e) => report.fail(&stream.id, e),
        }
    }

    let cdc_streams: Vec<&Stream> = planned
        .iter()
        .map(|(s, _)| *s)
        .filter(|s| is_cdc_stream(&ctx.opts, s))
        .collect();
    let cdc_plan = if cdc_streams.is_empty() {
        None
    } else {
        match prepare_cdc(ctx, control.as_mut(), manager, &cdc_streams, &mut states, &mut report)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                for stream in &cdc_streams {
                    report.fail(&stream.id, anyhow::anyhow!("CDC setup failed: {e:#}"));
                }
                None
            }
        }
    };
    let cdc_instances = cdc_plan.as_ref().map(|p| p.instances.clone()).unwrap_or_default();

    let factory = PartitionFactory::new(&ctx.registry, &ctx.opts, cdc_plan.as_ref().map(|p| p.position));
    let mut reads = Vec::new();
    let mut streaming: BTreeSet<StreamId> = BTreeSet::new();
    for (stream, metadata) in &planned {
        // CDC streams without a usable capture instance already failed
        if is_cdc_stream(&ctx.opts, stream) && !cdc_instances.contains_key(&stream.id) {
            continue;
        }
        match factory
            .create(control.as_mut(), stream, metadata, states.get(&stream.id))
            .await
        {
            Ok(Some(PartitionReadState::CdcStreaming { .. })) => {
                streaming.insert(stream.id.clone());
            }
            Ok(Some(state)) => reads.push(((*stream).clone(), state)),
            Ok(None) => {}
            Err(e) => report.fail(&stream.id, e),
        }
    }
    drop(control);

    info!(
        "Reading {} partitions with up to {} at a time",
        reads.len(),
        ctx.opts.concurrency
    );
    let mut tasks = JoinSet::new();
    let mut task_streams: HashMap<task::Id, StreamId> = HashMap::new();
    for (stream, state) in reads {
        let ctx = ctx.clone();
        let id = stream.id.clone();
        let handle = tasks.spawn(async move {
            let result: Result<PartitionOutcome> = async {
                let _permit = ctx.permits.clone().acquire_owned().await?;
                let mut conn = ctx.provider.acquire().await?;
                PartitionReader::new(&stream, &ctx.registry, ctx.sink.as_ref(), &ctx.opts, &ctx.cancel)
                    .run(conn.as_mut(), &state)
                    .await
            }
            .await;
            (stream.id, result)
        });
        task_streams.insert(handle.id(), id);
    }

    while let Some(joined) = tasks.join_next().await {
        let (id, result) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                // Only the panicking partition fails
                if let Some(id) = task_streams.get(&e.id()) {
                    report.fail(id, anyhow::anyhow!("Partition task panicked: {e}"));
                }
                continue;
            }
        };
        match result {
            Ok(PartitionOutcome::Completed { records }) => {
                report.records += records;
                if cdc_instances.contains_key(&id) {
                    streaming.insert(id);
                }
            }
            Ok(PartitionOutcome::Cancelled { records }) => report.records += records,
            Err(e) => report.fail(&id, e),
        }
    }

    if let Some(plan) = cdc_plan {
        report.cdc_position = Some(plan.position);
        // The shared position stays put while any CDC snapshot is unfinished
        let pending: Vec<&StreamId> = plan
            .instances
            .keys()
            .filter(|id| !streaming.contains(*id))
            .collect();
        let tracked: Vec<TrackedStream> = planned
            .iter()
            .filter(|(s, _)| streaming.contains(&s.id))
            .filter_map(|(s, _)| {
                plan.instances.get(&s.id).map(|instance| TrackedStream {
                    stream: (*s).clone(),
                    instance: instance.clone(),
                })
            })
            .collect();

        if !pending.is_empty() {
            warn!(
                "Holding CDC position {} until the snapshots of {} complete",
                plan.position,
                pending
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        } else if !tracked.is_empty() && !ctx.cancel.is_cancelled() {
            let ids: Vec<StreamId> = tracked.iter().map(|t| t.stream.id.clone()).collect();
            let mut tracker =
                CdcTracker::new(plan.position, tracked).with_page_size(ctx.opts.page_size);
            let session = async {
                let mut conn = ctx.provider.acquire().await?;
                run_cdc_session(
                    conn.as_mut(),
                    &mut tracker,
                    ctx.sink.as_ref(),
                    ctx.opts.checkpoint_interval,
                    &ctx.cancel,
                )
                .await
            }
            .await;

            match session {
                Ok(CdcOutcome::Completed { records, position }) => {
                    report.records += records;
                    report.cdc_position = Some(position);
                }
                Ok(CdcOutcome::Cancelled { records }) => report.records += records,
                Err(e) => {
                    for id in &ids {
                        report.fail(id, anyhow::anyhow!("CDC session failed: {e:#}"));
                    }
                }
            }
        }
    }

    info!(
        "Sync finished: {} records, {} failed streams",
        report.records,
        report.failures.len()
    );
    Ok(report)
}
