use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use harvest_adapters::{
    deterministic_fixture_id, load_fixture_bundle, AdapterContext, FetchedRecord, FixtureAdapter,
    RepositoryAdapter,
};
use harvest_storage::{
    RepositoryContext, Session, StaleRecord, Store, StoredRepository, WriteOutcome,
};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    load_registry, next_due, stale_cutoff, RegistryEntry, RepositoryRunReport, RepositoryStatus,
    SyncConfig, SyncRunSummary,
};

pub struct HarvestPipeline {
    config: SyncConfig,
    store: Store,
}

/// Per-repository loop state shared by the listing and refresh passes.
struct Pass<'a> {
    ctx: &'a AdapterContext,
    adapter: &'a dyn RepositoryAdapter,
    repository: RepositoryContext,
    abort_after: usize,
    log_every: usize,
    processed: HashSet<String>,
    report: RepositoryRunReport,
}

impl Pass<'_> {
    fn should_abort(&self) -> bool {
        self.abort_after > 0 && self.report.errors >= self.abort_after
    }

    /// Harvest one identifier. Storage failures count against the error budget
    /// like adapter failures; the pass moves on to the next identifier.
    async fn process(&mut self, session: &mut Session, identifier: &str) {
        self.processed.insert(identifier.to_string());
        if let Err(err) = self.harvest_one(session, identifier).await {
            self.report.errors += 1;
            warn!(identifier, error = %format!("{err:#}"), "record failed; continuing");
        }

        let seen = self.processed.len();
        if self.log_every > 0 && seen % self.log_every == 0 {
            info!(processed = seen, "harvest progress");
        }
    }

    async fn harvest_one(&mut self, session: &mut Session, identifier: &str) -> Result<()> {
        let fetched = match self.adapter.fetch_record(self.ctx, identifier).await {
            Ok(fetched) => fetched,
            Err(err) => {
                self.report.errors += 1;
                warn!(identifier, error = %err, "fetch failed; record touched");
                let touched = match session
                    .find_record(identifier, self.repository.repository_id)
                    .await
                {
                    Ok(Some(stored)) => session.touch_record(stored.record_id).await.map(|_| ()),
                    Ok(None) => Ok(()),
                    Err(err) => Err(err),
                };
                if let Err(err) = touched {
                    warn!(identifier, error = %err, "touching record failed");
                }
                return Ok(());
            }
        };

        match fetched {
            FetchedRecord::Record(record) => {
                let outcome = session
                    .write_record(&record, &self.repository)
                    .await
                    .with_context(|| format!("writing record {identifier}"))?;
                match outcome {
                    WriteOutcome::Created(_) => self.report.created += 1,
                    WriteOutcome::Updated(report) if report.changed => self.report.updated += 1,
                    WriteOutcome::Updated(_) => self.report.unchanged += 1,
                    WriteOutcome::Rejected(reason) => {
                        self.report.rejected += 1;
                        warn!(identifier, %reason, "record rejected");
                    }
                }
            }
            FetchedRecord::Gone => {
                let stored = session
                    .find_record(identifier, self.repository.repository_id)
                    .await
                    .with_context(|| format!("looking up withdrawn record {identifier}"))?;
                if let Some(stored) = stored {
                    let deleted = session
                        .delete_record(stored.record_id)
                        .await
                        .with_context(|| format!("deleting record {identifier}"))?;
                    if deleted {
                        self.report.deleted += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

impl HarvestPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store = Store::open(&config.database_path)
            .await
            .with_context(|| format!("opening store {}", config.database_path.display()))?;
        Ok(Self { config, store })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Register every repository of the registry without crawling.
    pub async fn register_repositories(&self) -> Result<Vec<StoredRepository>> {
        let registry = load_registry(self.config.registry_path())?;
        let mut session = self.store.session().await?;
        for entry in &registry.repositories {
            session
                .upsert_repository(&entry.repository)
                .await
                .with_context(|| format!("registering repository {}", entry.id))?;
        }
        Ok(session.list_repositories().await?)
    }

    pub async fn purge_deleted(&self) -> Result<u64> {
        let mut session = self.store.session().await?;
        Ok(session.purge_deleted_records().await?)
    }

    /// Records each registered repository would refresh on its next pass.
    pub async fn stale_records(&self) -> Result<Vec<(StoredRepository, Vec<StaleRecord>)>> {
        let now = Utc::now().timestamp();
        let mut session = self.store.session().await?;
        let mut out = Vec::new();
        for stored in session.list_repositories().await? {
            let cutoff = stale_cutoff(stored.repository.record_refresh_days, now);
            let stale = session
                .get_stale_records(
                    cutoff,
                    stored.repository_id,
                    i64::from(stored.repository.max_records_updated_per_run),
                )
                .await?;
            out.push((stored, stale));
        }
        Ok(out)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = load_registry(self.config.registry_path())?;
        let ctx = AdapterContext { run_id, started_at };
        let mut session = self.store.session().await?;

        let mut repositories = Vec::with_capacity(registry.repositories.len());
        for entry in &registry.repositories {
            let span = info_span!("repository", id = %entry.id);
            let report = match self
                .run_repository(&mut session, &ctx, entry)
                .instrument(span)
                .await
            {
                Ok(report) => report,
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(id = %entry.id, error = %reason, "repository pass failed");
                    let repository_id = session
                        .repository_id(&entry.repository.url, &entry.repository.set)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    let mut report = RepositoryRunReport::new(&entry.id, repository_id);
                    report.status = RepositoryStatus::Failed(reason);
                    report
                }
            };
            repositories.push(report);
        }
        drop(session);

        let finished_at = Utc::now();
        let reports_dir = self.config.reports_dir(run_id);
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            repositories,
            reports_dir: reports_dir.display().to_string(),
        };
        self.write_summary(&summary).await?;
        info!(
            %run_id,
            harvested = summary.harvested(),
            created = summary.total(|r| r.created),
            updated = summary.total(|r| r.updated),
            deleted = summary.total(|r| r.deleted),
            "harvest run complete"
        );
        Ok(summary)
    }

    async fn run_repository(
        &self,
        session: &mut Session,
        ctx: &AdapterContext,
        entry: &RegistryEntry,
    ) -> Result<RepositoryRunReport> {
        let repository = &entry.repository;
        let repository_id = session
            .upsert_repository(repository)
            .await
            .with_context(|| format!("registering repository {}", entry.id))?;
        let mut report = RepositoryRunReport::new(&entry.id, repository_id);

        if !repository.enabled {
            report.status = RepositoryStatus::SkippedDisabled;
            return Ok(report);
        }
        let now = Utc::now().timestamp();
        let last_crawl = session.last_crawl(repository_id).await?.unwrap_or(0);
        if let Some(next_due) = next_due(last_crawl, repository.repo_refresh_days, now) {
            debug!(next_due, "repository not due");
            report.status = RepositoryStatus::SkippedNotDue { next_due };
            return Ok(report);
        }

        let bundle_path = self.config.bundle_path_for(entry);
        let adapter = match FixtureAdapter::for_repository(&bundle_path, &repository.repo_type) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(path = %bundle_path.display(), error = %err, "adapter unavailable");
                report.status = RepositoryStatus::Failed(err.to_string());
                return Ok(report);
            }
        };
        report.fixture_id = load_fixture_bundle(&bundle_path)
            .ok()
            .map(|bundle| deterministic_fixture_id(&bundle));

        let identifiers = match adapter.list_identifiers(ctx).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "listing failed");
                report.status = RepositoryStatus::Failed(err.to_string());
                return Ok(report);
            }
        };
        report.listed = identifiers.len();

        let item_url_pattern = repository.item_url_pattern.as_deref();
        for identifier in &identifiers {
            if session
                .write_header(identifier, item_url_pattern, repository_id)
                .await?
            {
                report.headers_added += 1;
            }
        }

        let mut pass = Pass {
            ctx,
            adapter: &adapter,
            repository: RepositoryContext {
                repository_id,
                item_url_pattern: repository.item_url_pattern.clone(),
            },
            abort_after: repository.abort_after_numerrors as usize,
            log_every: repository.update_log_after_numitems as usize,
            processed: HashSet::new(),
            report,
        };

        for identifier in &identifiers {
            if pass.should_abort() {
                break;
            }
            pass.process(session, identifier).await;
        }

        if !pass.should_abort() {
            let cutoff = stale_cutoff(repository.record_refresh_days, now);
            let stale = session
                .get_stale_records(
                    cutoff,
                    repository_id,
                    i64::from(repository.max_records_updated_per_run),
                )
                .await?;
            for record in stale {
                if pass.should_abort() {
                    break;
                }
                if pass.processed.contains(&record.local_identifier) {
                    continue;
                }
                pass.process(session, &record.local_identifier).await;
                pass.report.refreshed += 1;
            }
        }

        let aborted = pass.should_abort();
        let mut report = pass.report;
        if aborted {
            warn!(errors = report.errors, "too many errors; repository aborted");
            report.status = RepositoryStatus::Aborted;
        } else {
            session.update_last_crawl(repository_id).await?;
        }
        Ok(report)
    }

    async fn write_summary(&self, summary: &SyncRunSummary) -> Result<()> {
        let reports_dir = self.config.reports_dir(summary.run_id);
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        let path = reports_dir.join("summary.json");
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Cron job running the pipeline; `None` unless the scheduler is enabled.
pub async fn maybe_build_scheduler(pipeline: Arc<HarvestPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job_pipeline = Arc::clone(&pipeline);
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&job_pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled harvest complete"),
                Err(err) => warn!(error = %err, "scheduled harvest failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
