//! `runners_config.yaml` schema

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use crate::logs::LogLevel;
use crate::notify::events::EventKind;

/// Root of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullConfig {
    pub runners_defaults: RunnersDefaults,

    #[serde(default)]
    pub runners: Vec<RunnerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhooks: Option<WebhooksConfig>,

    #[serde(default)]
    pub manager: ManagerSettings,
}

/// Values shared by every runner group unless overridden
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnersDefaults {
    /// Base runner image, e.g. `ghcr.io/actions/actions-runner:2.328.0`
    pub base_image: String,

    /// Organization or repository URL runners register against
    pub org_url: String,

    /// Namespace of the images built from runner Dockerfiles
    #[serde(default = "default_image_namespace")]
    pub image_namespace: String,
}

fn default_image_namespace() -> String {
    "itroom".to_string()
}

/// One runner group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub id: String,
    pub name_prefix: String,

    #[serde(default)]
    pub labels: Vec<String>,

    /// Desired replica count
    pub nb: u32,

    /// Dockerfile used to build the runner image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub techno: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_version"
    )]
    pub techno_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_url: Option<String>,
}

/// Accept `8.3`, `20` and `"8.3"` alike
fn deserialize_version<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "techno_version must be a string or a number, got {:?}",
            other
        ))),
    }
}

/// Raw scheduler section, validated into a [`crate::config::schedule::ScheduleConfig`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    #[serde(default = "default_time_window")]
    pub time_window: String,

    #[serde(default = "default_days")]
    pub days: Vec<String>,

    #[serde(default)]
    pub actions: Vec<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_check_interval() -> String {
    "15s".to_string()
}

fn default_time_window() -> String {
    "00:00-23:59".to_string()
}

fn default_days() -> Vec<String> {
    ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: default_check_interval(),
            time_window: default_time_window(),
            days: default_days(),
            actions: Vec::new(),
            max_retries: default_max_retries(),
        }
    }
}

// ================================ WEBHOOKS ====================================== //

/// Global webhook section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout: u64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Delay between attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams: Option<TeamsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic: Option<GenericConfig>,
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: default_webhook_timeout(),
            retry_count: default_retry_count(),
            retry_delay: default_retry_delay(),
            slack: None,
            discord: None,
            teams: None,
            generic: None,
        }
    }
}

fn default_username() -> String {
    "GitHub Runner Manager".to_string()
}

/// Field rendered in Slack attachments and Discord embeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationField {
    pub name: String,
    pub value: String,

    /// Slack only
    #[serde(default = "default_true")]
    pub short: bool,

    /// Discord only
    #[serde(default = "default_true")]
    pub inline: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackTemplate {
    pub title: String,
    pub text: String,

    #[serde(default = "default_slack_color")]
    pub color: String,

    #[serde(default = "default_true")]
    pub use_attachment: bool,

    #[serde(default)]
    pub fields: Vec<NotificationField>,
}

fn default_slack_color() -> String {
    "#36a64f".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,

    #[serde(default)]
    pub channel: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub events: Vec<EventKind>,

    /// Keyed by event kind, or `default`
    #[serde(default)]
    pub templates: BTreeMap<String, SlackTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordTemplate {
    pub title: String,
    pub description: String,

    #[serde(default = "default_discord_color")]
    pub color: u32,

    #[serde(default)]
    pub fields: Vec<NotificationField>,
}

fn default_discord_color() -> u32 {
    3066993
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub events: Vec<EventKind>,

    #[serde(default)]
    pub templates: BTreeMap<String, DiscordTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamsFact {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamsSection {
    #[serde(rename = "activityTitle")]
    pub activity_title: String,

    #[serde(default)]
    pub facts: Vec<TeamsFact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamsTemplate {
    pub title: String,

    #[serde(rename = "themeColor", default = "default_theme_color")]
    pub theme_color: String,

    #[serde(default)]
    pub sections: Vec<TeamsSection>,
}

fn default_theme_color() -> String {
    "0076D7".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub events: Vec<EventKind>,

    #[serde(default)]
    pub templates: BTreeMap<String, TeamsTemplate>,
}

/// Plain JSON endpoint receiving `{event, timestamp, payload}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub events: Vec<EventKind>,

    /// Extra request headers, e.g. an `Authorization` value
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

// ================================ MANAGER ======================================= //

/// Settings of the manager process itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerSettings,

    /// Seconds between container liveness probes
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval: u64,

    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

fn default_liveness_interval() -> u64 {
    30
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            server: ServerSettings::default(),
            liveness_interval: default_liveness_interval(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

/// Status server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8090
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Per-call budgets for external collaborators, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_registry_timeout")]
    pub registry: u64,

    #[serde(default = "default_build_timeout")]
    pub build: u64,

    #[serde(default = "default_runtime_timeout")]
    pub runtime: u64,

    #[serde(default = "default_token_timeout")]
    pub token: u64,
}

fn default_registry_timeout() -> u64 {
    30
}

fn default_build_timeout() -> u64 {
    1800
}

fn default_runtime_timeout() -> u64 {
    120
}

fn default_token_timeout() -> u64 {
    30
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            registry: default_registry_timeout(),
            build: default_build_timeout(),
            runtime: default_runtime_timeout(),
            token: default_token_timeout(),
        }
    }
}
