//! Batch processing: drain inbound packets through the game engine and
//! publish what it produces.
//!
//! One run may be active at a time across the hub. A run snapshots the
//! unconsumed inbound packets in scope, runs the engine once per league,
//! and commits produced packets, artifacts, nodelists and consumption
//! marks in a single transaction. Nothing is committed when the engine
//! fails, times out or is cancelled.

mod gate;
mod model;
mod scheduler;

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use gate::RunGate;
pub use gate::RunPermit;
pub use model::ArtifactKind;
pub use model::ArtifactSummary;
pub use model::ProcessingArtifact;
pub use model::ProcessingRun;
pub use model::RunId;
pub use model::RunScope;
pub use model::RunStatus;
pub use model::render_text;
pub use scheduler::run_scheduler;

use crate::config::HubConfig;
use crate::db::DbError;
use crate::engine::Engine;
use crate::engine::EngineError;
use crate::engine::EngineJob;
use crate::ledger::GapPolicy;
use crate::ledger::RouteKey;
use crate::ledger::RouteLocks;
use crate::mailbox::alert_event;
use crate::notify::HubEvent;
use crate::notify::Notifier;
use crate::packet;
use crate::packet::BbsIndex;
use crate::packet::LeagueId;
use crate::store::Direction;
use crate::store::HubStore;
use crate::store::NewPacket;
use crate::store::PendingPacket;
use crate::store::RunCommit;
use crate::store::RunCommitSummary;
use crate::store::StoredNodelist;

pub const DEFAULT_RUN_LIST_LIMIT: usize = 20;
pub const MAX_RUN_LIST_LIMIT: usize = 200;

/// Recorded as `uploaded_by` for engine-produced packets.
pub const HUB_ACTOR: &str = "hub";

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("processing run {active} is already active")]
    AlreadyRunning { active: RunId },

    #[error("league {0} is not configured")]
    UnknownLeague(LeagueId),

    #[error("processing run {0} not found")]
    NotFound(RunId),

    #[error("processing run {run_id} is not active ({status:?})")]
    NotActive { run_id: RunId, status: RunStatus },

    #[error("engine failed for league {league}: {source}")]
    Engine {
        league: LeagueId,
        #[source]
        source: EngineError,
    },

    #[error("engine exited with {code:?} for league {league}")]
    EngineExit { league: LeagueId, code: Option<i32> },

    #[error("work directory {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("engine produced malformed output {filename} for league {league}: {reason}")]
    Malformed {
        league: LeagueId,
        filename: String,
        reason: String,
    },

    #[error("processing run cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    #[error("processing task failed: {0}")]
    Task(String),
}

impl ProcessingError {
    pub fn status_code(&self) -> u16 {
        match self {
            ProcessingError::AlreadyRunning { .. } | ProcessingError::NotActive { .. } => 409,
            ProcessingError::UnknownLeague(_) => 422,
            ProcessingError::NotFound(_) => 404,
            _ => 500,
        }
    }
}

fn workspace_error(path: &Path) -> impl FnOnce(io::Error) -> ProcessingError + '_ {
    move |source| ProcessingError::Workspace {
        path: path.to_path_buf(),
        source,
    }
}

/// A configured league and the directory its engine runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeagueWorkspace {
    pub league: LeagueId,
    pub work_dir: PathBuf,
}

/// Returned by [`Orchestrator::trigger`]; the run continues in the
/// background whether or not the handle is awaited.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    task: JoinHandle<RunStatus>,
}

impl RunHandle {
    pub async fn wait(self) -> Result<RunStatus, ProcessingError> {
        self.task
            .await
            .map_err(|e| ProcessingError::Task(e.to_string()))
    }
}

pub struct Orchestrator {
    store: HubStore,
    engine: Arc<dyn Engine>,
    notifier: Arc<dyn Notifier>,
    locks: Arc<RouteLocks>,
    gate: Arc<RunGate>,
    leagues: Vec<LeagueWorkspace>,
    hub_index: BbsIndex,
    policy: GapPolicy,
    timeout: Duration,
}

/// What one league's pass contributes to the run commit.
#[derive(Default)]
struct LeagueYield {
    produced: Vec<NewPacket>,
    relays: Vec<PendingPacket>,
    consumed: Vec<i64>,
    artifacts: Vec<ProcessingArtifact>,
    nodelists: Vec<StoredNodelist>,
}

impl Orchestrator {
    pub fn new(
        store: HubStore,
        engine: Arc<dyn Engine>,
        notifier: Arc<dyn Notifier>,
        locks: Arc<RouteLocks>,
        leagues: Vec<LeagueWorkspace>,
        hub_index: BbsIndex,
        policy: GapPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            notifier,
            locks,
            gate: RunGate::new(),
            leagues,
            hub_index,
            policy,
            timeout,
        }
    }

    pub fn from_config(
        config: &HubConfig,
        store: HubStore,
        engine: Arc<dyn Engine>,
        notifier: Arc<dyn Notifier>,
        locks: Arc<RouteLocks>,
    ) -> Self {
        let leagues = config
            .leagues
            .iter()
            .map(|league| LeagueWorkspace {
                league: league.id,
                work_dir: config.league_work_dir(league),
            })
            .collect();
        Self::new(
            store,
            engine,
            notifier,
            locks,
            leagues,
            config.hub.bbs_index,
            config.gap_policy(),
            config.engine_timeout(),
        )
    }

    pub fn active_run(&self) -> Option<RunId> {
        self.gate.active()
    }

    pub fn leagues(&self) -> impl Iterator<Item = &LeagueId> {
        self.leagues.iter().map(|l| &l.league)
    }

    /// Start a run. Fails immediately with `AlreadyRunning` rather than
    /// queueing behind the active run.
    pub async fn trigger(
        self: &Arc<Self>,
        scope: RunScope,
        triggered_by: &str,
    ) -> Result<RunHandle, ProcessingError> {
        if let RunScope::League(league) = scope
            && !self.leagues.iter().any(|l| l.league == league)
        {
            return Err(ProcessingError::UnknownLeague(league));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let permit = self
            .gate
            .try_acquire(run_id.clone())
            .map_err(|active| ProcessingError::AlreadyRunning { active })?;

        // The storage index backs the gate across processes sharing a database.
        if !self
            .store
            .begin_run(run_id.clone(), scope, triggered_by.to_string(), Utc::now())
            .await?
        {
            return Err(ProcessingError::AlreadyRunning {
                active: "unknown".to_string(),
            });
        }

        tracing::info!(run_id = %run_id, %scope, triggered_by, "processing run started");
        self.notifier.publish(HubEvent::ProcessingStarted {
            run_id: run_id.clone(),
            scope,
        });

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_to_completion(permit, scope).await });
        Ok(RunHandle { run_id, task })
    }

    async fn run_to_completion(&self, permit: RunPermit, scope: RunScope) -> RunStatus {
        let run_id = permit.run_id().to_string();
        let mut logs = String::new();
        let outcome = self
            .execute(&run_id, scope, permit.cancellation(), &mut logs)
            .await;

        let status = match outcome {
            Ok(summary) => {
                tracing::info!(
                    run_id = %run_id,
                    consumed = summary.consumed,
                    deposited = summary.deposited.len(),
                    alerts = summary.alerts.len(),
                    "processing run completed"
                );
                self.publish_commit(&run_id, &summary);
                RunStatus::Completed
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, "processing run failed: {err}");
                let message = err.to_string();
                if let Err(db_err) = self
                    .store
                    .fail_run(run_id.clone(), message.clone(), logs, Utc::now())
                    .await
                {
                    tracing::error!(run_id = %run_id, "failed to record run failure: {db_err}");
                }
                self.notifier.publish(HubEvent::ProcessingComplete {
                    run_id: run_id.clone(),
                    status: RunStatus::Failed,
                    consumed: 0,
                    produced: 0,
                    error: Some(message),
                });
                RunStatus::Failed
            }
        };
        self.publish_stats().await;
        drop(permit);
        status
    }

    async fn execute(
        &self,
        run_id: &str,
        scope: RunScope,
        cancel: &CancellationToken,
        logs: &mut String,
    ) -> Result<RunCommitSummary, ProcessingError> {
        let pending = self.store.pending_inbound(scope).await?;
        let mut by_league: BTreeMap<LeagueId, Vec<PendingPacket>> = BTreeMap::new();
        for packet in pending {
            by_league
                .entry(packet.record.identity.league)
                .or_default()
                .push(packet);
        }

        let mut commit = RunCommit {
            run_id: run_id.to_string(),
            ..RunCommit::default()
        };
        for workspace in self.leagues.iter().filter(|l| scope.includes(&l.league)) {
            if cancel.is_cancelled() {
                return Err(ProcessingError::Cancelled);
            }
            let inbound = by_league.remove(&workspace.league).unwrap_or_default();
            let pass = self
                .process_league(run_id, workspace, inbound, cancel, logs)
                .await?;
            commit.produced.extend(pass.produced);
            commit.relays.extend(pass.relays);
            commit.consumed.extend(pass.consumed);
            commit.artifacts.extend(pass.artifacts);
            commit.nodelists.extend(pass.nodelists);
        }
        for (league, packets) in &by_league {
            tracing::warn!(
                %league,
                count = packets.len(),
                "inbound packets for unconfigured league left pending"
            );
        }

        if cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }

        let routes: Vec<RouteKey> = commit
            .produced
            .iter()
            .map(|p| RouteKey::from(&p.identity))
            .collect();
        let _route_guards = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ProcessingError::Cancelled),
            guards = self.locks.lock_many(routes) => guards,
        };
        // Last point at which a cancel can still discard the run.
        if cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }
        commit.logs = logs.clone();
        commit.completed_at = Utc::now();
        Ok(self.store.complete_run(commit, self.policy).await?)
    }

    async fn process_league(
        &self,
        run_id: &str,
        workspace: &LeagueWorkspace,
        inbound: Vec<PendingPacket>,
        cancel: &CancellationToken,
        logs: &mut String,
    ) -> Result<LeagueYield, ProcessingError> {
        let league = workspace.league;
        let job = EngineJob::new(league, workspace.work_dir.clone(), self.timeout);
        let mut pass = LeagueYield::default();
        self.adopt_leftovers(run_id, &job, &mut pass, logs).await?;
        prepare_workspace(&job).await?;

        let mut materialized = 0usize;
        for packet in inbound {
            pass.consumed.push(packet.record.id);
            if packet.record.identity.dest == self.hub_index {
                let path = job.inbound_dir.join(&packet.record.filename);
                tokio::fs::write(&path, &packet.payload)
                    .await
                    .map_err(workspace_error(&path))?;
                materialized += 1;
            } else {
                pass.relays.push(packet);
            }
        }

        let output = self
            .engine
            .run(&job, cancel)
            .await
            .map_err(|source| match source {
                EngineError::Cancelled => ProcessingError::Cancelled,
                source => ProcessingError::Engine { league, source },
            })?;

        logs.push_str(&format!(
            "[{league}] {materialized} inbound, {} relayed; engine exited with {:?} in {:.1}s\n",
            pass.relays.len(),
            output.exit_code,
            output.duration.as_secs_f64(),
        ));
        append_stream(logs, "stdout", &output.stdout);
        append_stream(logs, "stderr", &output.stderr);
        for warning in &output.warnings {
            logs.push_str(&format!("[{league}] warning: {warning}\n"));
        }
        if !output.succeeded() {
            return Err(ProcessingError::EngineExit {
                league,
                code: output.exit_code,
            });
        }

        self.collect_outbound(run_id, &job, &mut pass, logs).await?;
        self.collect_artifacts(run_id, &job, &mut pass).await?;
        // Whatever appears in outbound/ from here on is a leftover for the
        // next run to adopt.
        reset_dir(&job.outbound_dir).await?;
        Ok(pass)
    }

    async fn collect_outbound(
        &self,
        run_id: &str,
        job: &EngineJob,
        pass: &mut LeagueYield,
        logs: &mut String,
    ) -> Result<(), ProcessingError> {
        let league = job.league;
        let produced_at = Utc::now();
        for (filename, path) in list_files(&job.outbound_dir).await? {
            if let Some(nodelist_league) = packet::parse_nodelist_filename(&filename) {
                if nodelist_league != league {
                    return Err(ProcessingError::Malformed {
                        league,
                        filename,
                        reason: format!("nodelist belongs to league {nodelist_league}"),
                    });
                }
                let content = read_file(&path).await?;
                pass.nodelists.push(StoredNodelist {
                    league,
                    filename,
                    content,
                    updated_at: produced_at,
                    produced_by_run: Some(run_id.to_string()),
                });
                continue;
            }
            if ArtifactKind::classify(&filename).is_some() {
                continue;
            }

            let identity = packet::parse(&filename).map_err(|e| ProcessingError::Malformed {
                league,
                filename: filename.clone(),
                reason: e.to_string(),
            })?;
            if identity.league != league {
                return Err(ProcessingError::Malformed {
                    league,
                    filename,
                    reason: format!("packet belongs to league {}", identity.league),
                });
            }
            if identity.dest == self.hub_index {
                logs.push_str(&format!("[{league}] skipped {filename}: addressed to the hub\n"));
                continue;
            }
            let payload = read_file(&path).await?;
            if payload.is_empty() {
                return Err(ProcessingError::Malformed {
                    league,
                    filename,
                    reason: "empty packet".to_string(),
                });
            }
            pass.produced.push(NewPacket {
                identity,
                direction: Direction::Outbound,
                payload,
                uploaded_by: HUB_ACTOR.to_string(),
                uploaded_at: produced_at,
                produced_by_run: Some(run_id.to_string()),
            });
        }
        Ok(())
    }

    /// Packets left in `outbound/` since the previous run, by an engine
    /// run outside the hub or a sysop dropping files by hand, are queued
    /// with this run's output before the directory is cleared. Files that
    /// are not deliverable packets of this league are logged and dropped.
    async fn adopt_leftovers(
        &self,
        run_id: &str,
        job: &EngineJob,
        pass: &mut LeagueYield,
        logs: &mut String,
    ) -> Result<(), ProcessingError> {
        let league = job.league;
        if !tokio::fs::try_exists(&job.outbound_dir)
            .await
            .map_err(workspace_error(&job.outbound_dir))?
        {
            return Ok(());
        }
        let found_at = Utc::now();
        for (filename, path) in list_files(&job.outbound_dir).await? {
            let identity = match packet::parse(&filename) {
                Ok(identity) if identity.league == league && identity.dest != self.hub_index => {
                    identity
                }
                _ => {
                    tracing::warn!(%league, %filename, "dropping stray file from outbound");
                    logs.push_str(&format!("[{league}] dropped stray {filename}\n"));
                    continue;
                }
            };
            let payload = read_file(&path).await?;
            if payload.is_empty() {
                logs.push_str(&format!("[{league}] dropped empty {filename}\n"));
                continue;
            }
            tracing::info!(%league, %filename, "adopting leftover outbound packet");
            logs.push_str(&format!("[{league}] adopted leftover {filename}\n"));
            pass.produced.push(NewPacket {
                identity,
                direction: Direction::Outbound,
                payload,
                uploaded_by: HUB_ACTOR.to_string(),
                uploaded_at: found_at,
                produced_by_run: Some(run_id.to_string()),
            });
        }
        Ok(())
    }

    /// Reports may land in the work directory or beside the packets.
    async fn collect_artifacts(
        &self,
        run_id: &str,
        job: &EngineJob,
        pass: &mut LeagueYield,
    ) -> Result<(), ProcessingError> {
        for dir in [&job.work_dir, &job.outbound_dir] {
            for (filename, path) in list_files(dir).await? {
                let Some(kind) = ArtifactKind::classify(&filename) else {
                    continue;
                };
                let content = read_file(&path).await?;
                tracing::debug!(run_id, league = %job.league, %filename, ?kind, "artifact collected");
                pass.artifacts
                    .push(ProcessingArtifact::new(job.league, filename, kind, content));
            }
        }
        Ok(())
    }

    fn publish_commit(&self, run_id: &str, summary: &RunCommitSummary) {
        for record in &summary.deposited {
            self.notifier.publish(HubEvent::PacketAvailable {
                league: record.identity.league,
                filename: record.filename.clone(),
                dest: record.identity.dest,
            });
        }
        for alert in &summary.alerts {
            self.notifier.publish(alert_event(alert));
        }
        for nodelist in &summary.nodelists {
            self.notifier.publish(HubEvent::NodelistAvailable {
                league: nodelist.league,
                filename: nodelist.filename.clone(),
            });
        }
        self.notifier.publish(HubEvent::ProcessingComplete {
            run_id: run_id.to_string(),
            status: RunStatus::Completed,
            consumed: summary.consumed,
            produced: summary.deposited.len(),
            error: None,
        });
    }

    async fn publish_stats(&self) {
        match self.store.stats().await {
            Ok(stats) => self.notifier.publish(HubEvent::StatsUpdate { stats }),
            Err(err) => tracing::debug!("stats unavailable: {err}"),
        }
    }

    /// Ask the active run to stop. The engine is killed and the run is
    /// recorded as failed once the task unwinds.
    pub async fn cancel(&self, run_id: &str) -> Result<(), ProcessingError> {
        if self.gate.cancel(run_id) {
            tracing::info!(run_id, "processing run cancellation requested");
            return Ok(());
        }
        match self.store.get_run(run_id.to_string()).await? {
            None => Err(ProcessingError::NotFound(run_id.to_string())),
            Some(run) => Err(ProcessingError::NotActive {
                run_id: run.id,
                status: run.status,
            }),
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Result<ProcessingRun, ProcessingError> {
        self.store
            .get_run(run_id.to_string())
            .await?
            .ok_or_else(|| ProcessingError::NotFound(run_id.to_string()))
    }

    pub async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<ProcessingRun>, ProcessingError> {
        let limit = limit
            .unwrap_or(DEFAULT_RUN_LIST_LIMIT)
            .clamp(1, MAX_RUN_LIST_LIMIT);
        Ok(self.store.list_runs(limit).await?)
    }

    /// Mark runs left `running` by a previous process as failed. Only valid
    /// before this process has started a run of its own.
    pub async fn reconcile_stale_runs(&self) -> Result<Vec<RunId>, ProcessingError> {
        if self.gate.active().is_some() {
            return Ok(Vec::new());
        }
        let failed = self
            .store
            .fail_stale_runs("interrupted by hub restart".to_string(), Utc::now())
            .await?;
        for run_id in &failed {
            tracing::warn!(run_id = %run_id, "marked interrupted processing run as failed");
        }
        Ok(failed)
    }
}

fn append_stream(logs: &mut String, label: &str, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    logs.push_str(&format!("--- {label} ---\n{text}\n"));
}

/// Create the work directory and empty its `inbound/` and `outbound/`
/// subdirectories so files from an earlier run are never re-read.
async fn prepare_workspace(job: &EngineJob) -> Result<(), ProcessingError> {
    for dir in [&job.inbound_dir, &job.outbound_dir] {
        reset_dir(dir).await?;
    }
    Ok(())
}

async fn reset_dir(dir: &Path) -> Result<(), ProcessingError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(workspace_error(dir)(err)),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(workspace_error(dir))
}

/// Regular files directly under `dir`, sorted by name.
async fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, ProcessingError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(workspace_error(dir))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(workspace_error(dir))? {
        let file_type = entry.file_type().await.map_err(workspace_error(dir))?;
        if !file_type.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push((name.to_string(), entry.path()));
        } else {
            tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 file name");
        }
    }
    files.sort();
    Ok(files)
}

async fn read_file(path: &Path) -> Result<Vec<u8>, ProcessingError> {
    tokio::fs::read(path).await.map_err(workspace_error(path))
}
