//! Core domain model
//!
//! Every entity carries `organization_id`; nothing in this module may be
//! reachable across tenants. Wire forms (serde) are shared by the REST and
//! WebSocket surfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════
// Platforms & Organizations
// ═══════════════════════════════════════════════════════════════════════════

/// Connected SaaS platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Slack,
    Google,
    Microsoft,
    Chatgpt,
    Claude,
    Gemini,
}

impl Platform {
    /// Stable string form used in vendor groups and API paths
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Slack => "slack",
            Platform::Google => "google",
            Platform::Microsoft => "microsoft",
            Platform::Chatgpt => "chatgpt",
            Platform::Claude => "claude",
            Platform::Gemini => "gemini",
        }
    }

    /// Parse a platform from its path/wire form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "slack" => Some(Platform::Slack),
            "google" => Some(Platform::Google),
            "microsoft" => Some(Platform::Microsoft),
            "chatgpt" => Some(Platform::Chatgpt),
            "claude" => Some(Platform::Claude),
            "gemini" => Some(Platform::Gemini),
            _ => None,
        }
    }

    /// Stable dashboard color per platform
    pub fn brand_color(&self) -> &'static str {
        match self {
            Platform::Slack => "#4a154b",
            Platform::Google => "#4285f4",
            Platform::Microsoft => "#00a4ef",
            Platform::Chatgpt => "#10a37f",
            Platform::Claude => "#d97757",
            Platform::Gemini => "#886fbf",
        }
    }

    /// All known platforms, in display order
    pub fn all() -> &'static [Platform] {
        &[
            Platform::Slack,
            Platform::Google,
            Platform::Microsoft,
            Platform::Chatgpt,
            Platform::Claude,
            Platform::Gemini,
        ]
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription tier for an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgTier {
    Free,
    Pro,
    Enterprise,
}

/// Per-organization risk level thresholds over the [0,100] score range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: 40.0,
            high: 65.0,
            critical: 85.0,
        }
    }
}

impl RiskThresholds {
    /// Map a [0,100] risk score onto a level
    pub fn level_for(&self, score: f64) -> Severity {
        if score >= self.critical {
            Severity::Critical
        } else if score >= self.high {
            Severity::High
        } else if score >= self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Tenant-adjustable settings stored on the organization row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgSettings {
    pub risk_thresholds: RiskThresholds,
    /// Days discovered data is retained before archival
    pub retention_days: u32,
    pub enabled_platforms: Vec<Platform>,
    /// Hours between scheduled discovery runs
    pub discovery_frequency_hours: u32,
}

impl Default for OrgSettings {
    fn default() -> Self {
        Self {
            risk_thresholds: RiskThresholds::default(),
            retention_days: 365,
            enabled_platforms: Platform::all().to_vec(),
            discovery_frequency_hours: 24,
        }
    }
}

/// Tenant organization; never physically deleted while it owns data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub tier: OrgTier,
    pub settings: OrgSettings,
    pub created_at: DateTime<Utc>,
}

/// Dashboard user role; drives realtime subscription profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Ciso,
    SecurityAnalyst,
    Admin,
    Viewer,
}

impl UserRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ciso" => Some(UserRole::Ciso),
            "security_analyst" => Some(UserRole::SecurityAnalyst),
            "admin" => Some(UserRole::Admin),
            "viewer" => Some(UserRole::Viewer),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Platform Connections
// ═══════════════════════════════════════════════════════════════════════════

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Pending,
    Expired,
    Error,
    Disconnected,
}

/// Latest health-check snapshot for a connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub detail: Option<String>,
}

/// An authorized relationship between an organization and a platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConnection {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub platform: Platform,
    /// Platform-native identity of the authorizing user
    pub platform_user_id: String,
    pub display_name: Option<String>,
    pub status: ConnectionStatus,
    /// OAuth scopes granted at authorization time
    pub scopes: Vec<String>,
    pub health: ConnectionHealth,
    /// Workspace metadata as returned by the platform (opaque)
    pub workspace: serde_json::Value,
    /// Set after a DecryptionFailure until credentials are rotated
    pub credentials_blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decrypted OAuth credential payload. Never serialized into logs or audit
/// entries; the Debug impl redacts token material.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl OAuthCredentials {
    /// True when the access token expires within `within_secs` seconds
    pub fn expires_within(&self, now: DateTime<Utc>, within_secs: i64) -> bool {
        match self.expires_at {
            Some(at) => (at - now).num_seconds() <= within_secs,
            None => false,
        }
    }
}

/// Ciphertext record persisted for a connection's credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedCredentialRecord {
    pub connection_id: Uuid,
    pub organization_id: Uuid,
    /// AES-256-GCM ciphertext of the credential payload
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    /// Data key wrapped under the organization master key
    pub wrapped_data_key: Vec<u8>,
    pub wrap_nonce: Vec<u8>,
    pub key_version: u32,
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Discovery Runs & Automations
// ═══════════════════════════════════════════════════════════════════════════

/// Discovery run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl RunStatus {
    /// Terminal runs are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Partial | RunStatus::Failed)
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

/// Progress counters updated while a run executes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunProgress {
    pub automations_discovered: u64,
    pub automations_updated: u64,
    pub automations_deactivated: u64,
    pub events_processed: u64,
}

/// Non-fatal problem recorded against a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunWarning {
    pub stage: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A single end-to-end enumeration attempt over one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRun {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub connection_id: Uuid,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: RunProgress,
    pub warnings: Vec<RunWarning>,
    pub created_at: DateTime<Utc>,
}

/// Kind of non-human actor observed on a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationType {
    Bot,
    Webhook,
    Workflow,
    Script,
    ServiceAccount,
    OauthApp,
}

impl AutomationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationType::Bot => "bot",
            AutomationType::Webhook => "webhook",
            AutomationType::Workflow => "workflow",
            AutomationType::Script => "script",
            AutomationType::ServiceAccount => "service_account",
            AutomationType::OauthApp => "oauth_app",
        }
    }
}

/// A discovered automation, deduplicated by `(connection_id, external_id)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredAutomation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub connection_id: Uuid,
    pub discovery_run_id: Uuid,
    /// Platform-native identifier
    pub external_id: String,
    pub automation_type: AutomationType,
    pub name: String,
    pub platform: Platform,
    /// Opaque platform-specific payload; typed accessors live in connectors
    pub platform_metadata: serde_json::Value,
    pub permissions: Vec<String>,
    pub owner: Option<String>,
    pub vendor_name: Option<String>,
    pub vendor_group: Option<String>,
    /// Operator-set vendor override; sticky once present
    pub vendor_override: bool,
    pub is_active: bool,
    pub first_discovered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// An automation record as emitted by a connector, before persistence
/// identity is assigned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedAutomation {
    pub external_id: String,
    pub automation_type: AutomationType,
    pub name: String,
    pub platform_metadata: serde_json::Value,
    pub permissions: Vec<String>,
    pub owner: Option<String>,
    /// Set by the adapter when derivable from display text
    pub vendor_name: Option<String>,
}

/// An audit event as emitted by a connector, before tenant scoping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedActivity {
    pub automation_external_id: Option<String>,
    pub actor_id: String,
    pub event_type: String,
    pub target: Option<String>,
    pub bytes: Option<u64>,
    pub records: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

/// One element of a connector's discovery stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryItem {
    Automation(NormalizedAutomation),
    Activity(NormalizedActivity),
}

// ═══════════════════════════════════════════════════════════════════════════
// Detection & Risk
// ═══════════════════════════════════════════════════════════════════════════

/// Shared severity scale for detections and risk levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn all() -> &'static [Severity] {
        &[Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
    }
}

/// Label produced by a detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Velocity,
    BatchOperation,
    OffHours,
    TimingVariance,
    PermissionEscalation,
    DataVolume,
    AiProvider,
    MlBehavioral,
    CrossActorCoordination,
    QualitativeValidation,
}

/// A labeled observation emitted by a detector; append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionPattern {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub automation_id: Uuid,
    pub pattern_type: PatternType,
    /// Confidence in [0,100]
    pub confidence: f64,
    pub severity: Severity,
    pub evidence: serde_json::Value,
    /// sha256 over the canonical evidence JSON; dedupe key across runs
    pub evidence_hash: String,
    pub detected_at: DateTime<Utc>,
}

/// Weighted sub-scores feeding the overall risk score
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RiskSubScores {
    pub permission: f64,
    pub data_access: f64,
    pub activity: f64,
    pub ownership: f64,
}

/// Point-in-time risk assessment; the latest per automation is current
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub automation_id: Uuid,
    pub risk_level: Severity,
    /// Overall score in [0,100]
    pub risk_score: f64,
    pub sub_scores: RiskSubScores,
    pub assessed_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Feedback & Baselines
// ═══════════════════════════════════════════════════════════════════════════

/// Analyst verdict on a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    TruePositive,
    FalsePositive,
    FalseNegative,
    Uncertain,
}

/// Feedback processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    Pending,
    Applied,
}

/// Analyst feedback driving baseline and threshold updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationFeedback {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub automation_id: Uuid,
    pub user_id: String,
    pub feedback_type: FeedbackType,
    /// Snapshot of the detection state the analyst judged
    pub detection_snapshot: serde_json::Value,
    pub correction: Option<String>,
    /// Feature vector captured for the reinforcement loop
    pub features: Vec<f64>,
    pub status: FeedbackStatus,
    pub created_at: DateTime<Utc>,
}

/// Baseline learning state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineStatus {
    Learning,
    Established,
}

/// Weekly business window learned per organization (UTC hours)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusinessWindow {
    pub start_hour: u8,
    pub end_hour: u8,
    /// Monday = 0 .. Sunday = 6
    pub weekdays: [bool; 7],
}

impl Default for BusinessWindow {
    fn default() -> Self {
        Self {
            start_hour: 8,
            end_hour: 18,
            weekdays: [true, true, true, true, true, false, false],
        }
    }
}

impl BusinessWindow {
    /// True if the timestamp falls inside the window
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        use chrono::{Datelike, Timelike};
        let weekday = at.weekday().num_days_from_monday() as usize;
        let hour = at.hour() as u8;
        self.weekdays[weekday] && hour >= self.start_hour && hour < self.end_hour
    }
}

/// Learned per-organization behavioral summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralBaseline {
    pub organization_id: Uuid,
    /// Events per hour, mean and standard deviation
    pub velocity_mean: f64,
    pub velocity_std: f64,
    pub business_window: BusinessWindow,
    /// Scope name -> observed frequency in [0,1]
    pub common_permissions: HashMap<String, f64>,
    /// Automation type -> share of population in [0,1]
    pub type_distribution: HashMap<String, f64>,
    pub sample_size: u64,
    /// Confidence in [0,1]; monotone in sample size up to the ceiling
    pub confidence: f64,
    pub status: BaselineStatus,
    pub last_updated: DateTime<Utc>,
    pub next_update_due: DateTime<Utc>,
}

/// Per-organization detector thresholds tuned by the reinforcement loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorThresholds {
    pub velocity_z_score: f64,
    pub batch_min_size: u32,
    pub timing_variance_max_cv: f64,
    pub data_volume_factor: f64,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            velocity_z_score: 3.0,
            batch_min_size: 5,
            timing_variance_max_cv: 0.05,
            data_volume_factor: 3.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Correlation
// ═══════════════════════════════════════════════════════════════════════════

/// Property linking automations into a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationType {
    SameAiProvider,
    SimilarTiming,
    DataFlowChain,
    SharedCredentials,
    SimilarNaming,
}

/// One supporting signal behind a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationSignal {
    pub correlation_type: CorrelationType,
    /// Strength in [0,1]
    pub strength: f64,
}

/// A group of automations linked by shared properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationChain {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Member ids only; the correlator never owns automations
    pub automation_ids: Vec<Uuid>,
    pub correlation_type: CorrelationType,
    pub supporting: Vec<CorrelationSignal>,
    /// Confidence in [0,1]
    pub confidence: f64,
    pub cross_platform_chain: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Activity & Audit
// ═══════════════════════════════════════════════════════════════════════════

/// Normalized platform audit event consumed by detectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub connection_id: Uuid,
    /// External id of the automation that acted, when attributable
    pub automation_external_id: Option<String>,
    pub actor_id: String,
    pub event_type: String,
    pub target: Option<String>,
    pub bytes: Option<u64>,
    pub records: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

/// Audit log event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ConnectionCreated,
    ConnectionDisconnected,
    CredentialsRotated,
    DecryptionFailure,
    DiscoveryTriggered,
    FeedbackSubmitted,
    VendorOverridden,
}

/// Immutable append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub actor: String,
    pub resource: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Canonical evidence hash used to dedupe detection patterns across runs
pub fn evidence_hash(automation_id: Uuid, pattern_type: PatternType, evidence: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(automation_id.as_bytes());
    hasher.update(format!("{pattern_type:?}").as_bytes());
    hasher.update(evidence.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
