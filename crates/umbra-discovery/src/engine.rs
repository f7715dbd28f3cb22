//! Discovery engine
//!
//! A `DiscoveryRun` is the unit of work: load credentials, drive the
//! adapter stream, then persist each normalized automation together with
//! its risk assessment in one transaction before soft-expiring the unseen
//! and running the correlator and baseline update. At most one run is in
//! flight per connection; a second trigger conflicts and is coalesced into
//! one pending follow-up.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use umbra_connectors::{ConnectorError, DiscoveryContext};
use umbra_correlator::{correlate, profile_from};
use umbra_core::events::{EventKind, EventSink, RealtimeEvent};
use umbra_core::types::*;
use umbra_core::vendor::extract_vendor_name;
use umbra_core::{Result, UmbraConfig, UmbraError};
use umbra_detectors::validator::CostMeter;
use umbra_detectors::{assess_risk, BaselineEngine, DetectionWindow, DetectorSet, QualitativeValidator};
use umbra_store::{merge_normalized, AutomationFilter, CredentialChange, Store, UpsertOutcome};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::ConnectorRegistry;

/// Items between persisted progress updates
const PROGRESS_STRIDE: u64 = 50;
/// Activity events buffered before a batch insert
const ACTIVITY_FLUSH: usize = 100;
/// Detector history window
const DETECTOR_WINDOW_DAYS: i64 = 30;

struct RunLock {
    run_id: Uuid,
    cancel: CancellationToken,
    pending: AtomicBool,
}

pub struct DiscoveryEngine {
    store: Store,
    manager: Arc<ConnectionManager>,
    connectors: Arc<ConnectorRegistry>,
    detectors: DetectorSet,
    baseline_engine: BaselineEngine,
    validator: Option<Arc<QualitativeValidator>>,
    sink: Arc<dyn EventSink>,
    cfg: Arc<UmbraConfig>,
    locks: DashMap<Uuid, Arc<RunLock>>,
}

impl DiscoveryEngine {
    pub fn new(
        store: Store,
        manager: Arc<ConnectionManager>,
        connectors: Arc<ConnectorRegistry>,
        sink: Arc<dyn EventSink>,
        cfg: Arc<UmbraConfig>,
    ) -> Self {
        let validator = QualitativeValidator::from_config(&cfg.validator).map(Arc::new);
        Self {
            store,
            manager,
            connectors,
            detectors: DetectorSet::standard(),
            baseline_engine: BaselineEngine::new(cfg.baseline.clone()),
            validator,
            sink,
            cfg,
            locks: DashMap::new(),
        }
    }

    async fn emit(&self, kind: EventKind, organization_id: Uuid, payload: serde_json::Value) {
        self.sink
            .publish(RealtimeEvent::new(kind, organization_id, payload))
            .await;
    }

    /// Trigger a run for one connection. Returns the queued run, or
    /// `Conflict` carrying the running run's id; the conflicting trigger is
    /// coalesced into at most one follow-up run.
    pub fn trigger_run(
        self: Arc<Self>,
        organization_id: Uuid,
        connection_id: Uuid,
        trigger: RunTrigger,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<DiscoveryRun>> + Send>> {
        Box::pin(self.trigger_run_inner(organization_id, connection_id, trigger))
    }

    async fn trigger_run_inner(
        self: Arc<Self>,
        organization_id: Uuid,
        connection_id: Uuid,
        trigger: RunTrigger,
    ) -> Result<DiscoveryRun> {
        let conn = self
            .store
            .connections
            .get(organization_id, connection_id)
            .await?
            .ok_or_else(|| UmbraError::not_found(format!("connection {connection_id}")))?;

        match conn.status {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Expired => {
                return Err(UmbraError::Conflict {
                    reason: "connection expired; re-authorization required".to_string(),
                })
            }
            other => {
                return Err(UmbraError::Conflict {
                    reason: format!("connection is {other:?}, not connected"),
                })
            }
        }

        if let Some(lock) = self.locks.get(&connection_id) {
            lock.pending.store(true, Ordering::SeqCst);
            return Err(UmbraError::Conflict {
                reason: format!("run {} already in progress", lock.run_id),
            });
        }
        if let Some(active) = self.store.runs.active_for_connection(connection_id).await? {
            return Err(UmbraError::Conflict {
                reason: format!("run {} already in progress", active.id),
            });
        }

        let run = DiscoveryRun {
            id: Uuid::new_v4(),
            organization_id,
            connection_id,
            status: RunStatus::Queued,
            trigger,
            started_at: None,
            completed_at: None,
            progress: RunProgress::default(),
            warnings: Vec::new(),
            created_at: Utc::now(),
        };
        self.store.runs.insert(run.clone()).await?;

        let lock = Arc::new(RunLock {
            run_id: run.id,
            cancel: CancellationToken::new(),
            pending: AtomicBool::new(false),
        });
        self.locks.insert(connection_id, lock.clone());

        let engine = Arc::clone(&self);
        let spawned_run = run.clone();
        tokio::spawn(async move {
            engine.execute(spawned_run, conn, lock).await;
        });

        Ok(run)
    }

    /// Flag a running run for cancellation; it flushes partial results and
    /// lands in `partial`
    pub fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        for lock in self.locks.iter() {
            if lock.run_id == run_id {
                lock.cancel.cancel();
                return Ok(());
            }
        }
        Err(UmbraError::not_found(format!("running run {run_id}")))
    }

    async fn execute(self: Arc<Self>, mut run: DiscoveryRun, conn: PlatformConnection, lock: Arc<RunLock>) {
        let organization_id = run.organization_id;
        let connection_id = conn.id;
        let outcome = self.execute_inner(&mut run, &conn, &lock).await;

        let status = match outcome {
            Ok(status) => status,
            Err(err) => {
                tracing::error!(run = %run.id, error = %err, "discovery run failed");
                run.warnings.push(RunWarning {
                    stage: "run".to_string(),
                    message: format!("{}: {err}", err.kind()),
                    at: Utc::now(),
                });
                RunStatus::Failed
            }
        };

        run.status = status;
        run.completed_at = Some(Utc::now());
        if let Err(err) = self.store.runs.update(run.clone()).await {
            tracing::error!(run = %run.id, error = %err, "failed to persist terminal run state");
        }
        self.emit(
            EventKind::DiscoveryCompleted,
            organization_id,
            serde_json::json!({
                "runId": run.id,
                "status": run.status,
                "progress": run.progress,
                "warnings": run.warnings.iter().map(|w| w.message.clone()).collect::<Vec<_>>(),
            }),
        )
        .await;

        self.locks.remove(&connection_id);

        // One coalesced follow-up at most
        if lock.pending.load(Ordering::SeqCst) {
            tracing::info!(connection = %connection_id, "starting coalesced follow-up run");
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = engine
                    .trigger_run(organization_id, connection_id, RunTrigger::Scheduled)
                    .await
                {
                    tracing::warn!(error = %err, "coalesced follow-up not started");
                }
            });
        }
    }

    async fn execute_inner(
        &self,
        run: &mut DiscoveryRun,
        conn: &PlatformConnection,
        lock: &RunLock,
    ) -> Result<RunStatus> {
        let organization_id = run.organization_id;
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.store.runs.update(run.clone()).await?;
        self.emit(
            EventKind::DiscoveryStarted,
            organization_id,
            serde_json::json!({
                "runId": run.id,
                "connectionId": conn.id,
                "platform": conn.platform,
            }),
        )
        .await;

        // Step 2: usable credentials or bust
        let credentials = self.manager.ensure_fresh_credentials(conn).await?;

        let connector = self
            .connectors
            .get(conn.platform)
            .ok_or_else(|| UmbraError::not_found(format!("connector for {}", conn.platform)))?;
        let mut stream = connector
            .discover(DiscoveryContext {
                credentials,
                cursor: None,
            })
            .await
            .map_err(UmbraError::from)?;

        // Step 3: drive the stream under backpressure; the bounded channel
        // suspends the adapter when we fall behind. Automation records are
        // collected here and persisted in the detection pass, where each
        // upsert commits in one transaction with its risk assessment.
        let mut collected: Vec<NormalizedAutomation> = Vec::new();
        let mut collected_index: HashMap<String, usize> = HashMap::new();
        let mut activity_buffer: Vec<ActivityEvent> = Vec::new();
        let mut item_errors = false;
        let mut cancelled = false;
        let mut fatal: Option<UmbraError> = None;
        let mut items_since_progress = 0u64;

        loop {
            let item = tokio::select! {
                () = lock.cancel.cancelled() => {
                    stream.close();
                    cancelled = true;
                    break;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else { break };

            match item {
                Ok(DiscoveryItem::Automation(mut normalized)) => {
                    if normalized.vendor_name.is_none() {
                        normalized.vendor_name = extract_vendor_name(&normalized.name);
                    }
                    let slot = collected_index.get(&normalized.external_id).copied();
                    match slot {
                        // Re-observation within the run: the latest payload wins
                        Some(slot) => collected[slot] = normalized,
                        None => {
                            collected_index
                                .insert(normalized.external_id.clone(), collected.len());
                            collected.push(normalized);
                        }
                    }
                }
                Ok(DiscoveryItem::Activity(activity)) => {
                    run.progress.events_processed += 1;
                    activity_buffer.push(ActivityEvent {
                        id: Uuid::new_v4(),
                        organization_id,
                        connection_id: conn.id,
                        automation_external_id: activity.automation_external_id,
                        actor_id: activity.actor_id,
                        event_type: activity.event_type,
                        target: activity.target,
                        bytes: activity.bytes,
                        records: activity.records,
                        occurred_at: activity.occurred_at,
                    });
                    if activity_buffer.len() >= ACTIVITY_FLUSH {
                        self.store
                            .activity
                            .insert_batch(std::mem::take(&mut activity_buffer))
                            .await?;
                    }
                }
                Err(ConnectorError::InvalidGrant(reason)) => {
                    // Auth death aborts the run and expires the connection,
                    // through the same transactional unit as other
                    // transitions
                    let mut expired = conn.clone();
                    expired.status = ConnectionStatus::Expired;
                    expired.updated_at = Utc::now();
                    self.store
                        .transitions
                        .apply_transition(expired, CredentialChange::Keep)
                        .await?;
                    stream.close();
                    fatal = Some(UmbraError::InvalidGrant { reason });
                    break;
                }
                Err(err) => {
                    // Per-resource failure: record, skip, keep reading
                    item_errors = true;
                    run.warnings.push(RunWarning {
                        stage: "connector".to_string(),
                        message: err.to_string(),
                        at: Utc::now(),
                    });
                }
            }

            items_since_progress += 1;
            if items_since_progress >= PROGRESS_STRIDE {
                items_since_progress = 0;
                self.store.runs.update(run.clone()).await?;
                self.emit(
                    EventKind::DiscoveryProgress,
                    organization_id,
                    serde_json::json!({
                        "runId": run.id,
                        "progress": run.progress,
                    }),
                )
                .await;
            }
        }

        if !activity_buffer.is_empty() {
            self.store.activity.insert_batch(activity_buffer).await?;
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        // Steps 4-5 and 7: persist each collected automation atomically
        // with its risk assessment, running detectors in between
        let since = Utc::now() - Duration::days(DETECTOR_WINDOW_DAYS);
        let org_events = self.store.activity.window(organization_id, None, since).await?;
        let (affected, provider_tags) = self
            .persist_and_detect(run, conn, &collected, &org_events)
            .await?;

        // Step 6: soft-expire the unseen past the grace window; never on a
        // cancelled or degraded pass, which has not observed everything
        if !cancelled && !item_errors {
            let cutoff = Utc::now() - Duration::hours(self.cfg.discovery.grace_window_hours);
            run.progress.automations_deactivated =
                self.store.automations.deactivate_unseen(conn.id, run.id, cutoff).await?;
        }

        // Correlation and baseline refresh over the post-run state
        self.correlate_and_baseline(organization_id, &affected, &provider_tags, &org_events)
            .await?;

        self.store.runs.update(run.clone()).await?;
        Ok(if cancelled || item_errors {
            RunStatus::Partial
        } else {
            RunStatus::Succeeded
        })
    }

    /// Steps 4-5 and 7 of the run: for every collected record, run the
    /// detectors over a pre-persistence preview, then commit the upsert and
    /// its risk assessment in one transaction. Detector and validator work
    /// stays outside the transaction so it never holds a connection open.
    async fn persist_and_detect(
        &self,
        run: &mut DiscoveryRun,
        conn: &PlatformConnection,
        collected: &[NormalizedAutomation],
        org_events: &[ActivityEvent],
    ) -> Result<(Vec<Uuid>, HashMap<Uuid, String>)> {
        let organization_id = run.organization_id;
        let now = Utc::now();

        let thresholds = self.store.baselines.thresholds(organization_id).await?;
        let baseline = self.store.baselines.get(organization_id).await?;
        let risk_thresholds = self
            .store
            .organizations
            .get(organization_id)
            .await?
            .map(|org| org.settings.risk_thresholds)
            .unwrap_or_default();

        let meter = CostMeter::new(self.cfg.validator.max_cost_usd_per_run);
        let mut affected: Vec<Uuid> = Vec::new();
        let mut provider_tags: HashMap<Uuid, String> = HashMap::new();

        for normalized in collected {
            // The merged row as the upsert will persist it; detectors see
            // this preview, the escalation detector sees the pre-run scopes
            let existing = self
                .store
                .automations
                .find_by_external(conn.id, &normalized.external_id)
                .await?;
            let known: Vec<String> = existing
                .as_ref()
                .map(|a| a.permissions.clone())
                .unwrap_or_default();
            let preview = merge_normalized(
                existing.as_ref(),
                organization_id,
                conn.id,
                run.id,
                conn.platform,
                normalized,
                now,
            );

            let events: Vec<ActivityEvent> = org_events
                .iter()
                .filter(|e| {
                    e.connection_id == conn.id
                        && e.automation_external_id.as_deref() == Some(preview.external_id.as_str())
                })
                .cloned()
                .collect();

            let window = DetectionWindow {
                automation: &preview,
                events: &events,
                org_events,
                known_permissions: &known,
                now,
            };
            let (mut drafts, detector_warnings) = self.detectors.detect_all(
                &window,
                baseline.as_ref(),
                &thresholds,
                &self.cfg.detector,
            );
            for warning in detector_warnings {
                run.warnings.push(RunWarning {
                    stage: "detector".to_string(),
                    message: warning,
                    at: now,
                });
            }

            // Optional tenth detector: the qualitative validator
            if let Some(validator) = &self.validator {
                match validator.validate(&preview, &meter).await {
                    Ok(Some(draft)) => drafts.push(draft),
                    Ok(None) => {}
                    Err(message) => run.warnings.push(RunWarning {
                        stage: "validator".to_string(),
                        message,
                        at: now,
                    }),
                }
            }

            let previous_risk = match &existing {
                Some(prior) => {
                    self.store
                        .risks
                        .current_for_automation(organization_id, prior.id)
                        .await?
                }
                None => None,
            };

            // The refreshed row and its assessment commit together; the
            // repository rewrites the assessment's ids to the upserted row
            let assessment = assess_risk(&preview, &drafts, &risk_thresholds, now);
            let (risk_level, risk_score) = (assessment.risk_level, assessment.risk_score);
            let (automation, outcome) = self
                .store
                .automations
                .upsert_with_assessment(
                    organization_id,
                    conn.id,
                    run.id,
                    conn.platform,
                    normalized,
                    assessment,
                    now,
                )
                .await?;
            match outcome {
                UpsertOutcome::Inserted => run.progress.automations_discovered += 1,
                UpsertOutcome::Updated => run.progress.automations_updated += 1,
            }
            affected.push(automation.id);

            for draft in &drafts {
                if draft.pattern_type == PatternType::AiProvider {
                    if let Some(provider) = draft.evidence.get("provider").and_then(|v| v.as_str()) {
                        provider_tags.insert(automation.id, provider.to_string());
                    }
                }
            }

            // Append patterns in detection order; duplicates (same evidence
            // across reruns) are dropped at the repository
            for draft in &drafts {
                let pattern = draft.clone().into_pattern(organization_id, automation.id, now);
                let severity = pattern.severity;
                let pattern_type = pattern.pattern_type;
                let confidence = pattern.confidence;
                if self.store.detections.insert_if_new(pattern).await? {
                    self.emit(
                        EventKind::DetectionNew,
                        organization_id,
                        serde_json::json!({
                            "automationId": automation.id,
                            "patternType": pattern_type,
                            "severity": severity,
                            "confidence": confidence,
                        }),
                    )
                    .await;
                }
            }

            let level_changed = previous_risk
                .as_ref()
                .map(|r| r.risk_level != risk_level)
                .unwrap_or(risk_level > Severity::Low);
            if level_changed {
                self.emit(
                    EventKind::RiskChanged,
                    organization_id,
                    serde_json::json!({
                        "automationId": automation.id,
                        "riskLevel": risk_level,
                        "riskScore": risk_score,
                        "previousLevel": previous_risk.map(|r| r.risk_level),
                    }),
                )
                .await;
            }
        }

        Ok((affected, provider_tags))
    }

    /// Step 7 tail: correlation chains and the baseline/reinforcement pass
    async fn correlate_and_baseline(
        &self,
        organization_id: Uuid,
        affected: &[Uuid],
        provider_tags: &HashMap<Uuid, String>,
        org_events: &[ActivityEvent],
    ) -> Result<()> {
        let now = Utc::now();
        let active = self
            .store
            .automations
            .list(organization_id, &AutomationFilter::default())
            .await?;
        self.emit(
            EventKind::CorrelationStarted,
            organization_id,
            serde_json::json!({"automations": active.len()}),
        )
        .await;
        let profiles: Vec<_> = active
            .iter()
            .map(|a| {
                let provider = provider_tags.get(&a.id).cloned();
                profile_from(a.clone(), org_events, provider)
            })
            .collect();
        let chains = correlate(organization_id, &profiles, now);
        for chain in &chains {
            self.emit(
                EventKind::CorrelationChain,
                organization_id,
                serde_json::json!({
                    "chainId": chain.id,
                    "automationIds": chain.automation_ids,
                    "correlationType": chain.correlation_type,
                    "confidence": chain.confidence,
                    "crossPlatformChain": chain.cross_platform_chain,
                }),
            )
            .await;
        }
        self.store
            .chains
            .replace_touching(organization_id, affected, chains)
            .await?;

        // Baseline refresh with EMA, then the reinforcement loop
        let fresh = self
            .baseline_engine
            .build(organization_id, &active, org_events, now);
        let merged = match self.store.baselines.get(organization_id).await? {
            Some(existing) => self.baseline_engine.update(&existing, &fresh, now),
            None => fresh,
        };
        self.store.baselines.upsert(merged).await?;

        let pending = self.store.feedback.list_pending(organization_id).await?;
        if !pending.is_empty() {
            let thresholds = self.store.baselines.thresholds(organization_id).await?;
            let adjusted = self.baseline_engine.adjust_thresholds(&thresholds, &pending);
            self.store
                .baselines
                .put_thresholds(organization_id, adjusted)
                .await?;
            let ids: Vec<Uuid> = pending.iter().map(|f| f.id).collect();
            self.store.feedback.mark_applied(organization_id, &ids).await?;
        }

        Ok(())
    }
}
