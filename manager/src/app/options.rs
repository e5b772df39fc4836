//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::config::schedule::ScheduleConfig;
use crate::config::schema::ManagerSettings;
use crate::runtime::ExternalTimeouts;
use crate::workers::{liveness, scheduler};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Path of `runners_config.yaml`
    pub config_path: PathBuf,

    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Enable the local status server
    pub enable_server: bool,

    /// Enable the scheduler worker
    pub enable_scheduler: bool,

    /// Enable the liveness worker
    pub enable_liveness: bool,

    /// Server configuration
    pub server: ServerOptions,

    pub scheduler: scheduler::Options,

    pub liveness: liveness::Options,

    /// Budgets for external calls
    pub timeouts: ExternalTimeouts,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("runners_config.yaml"),
            lifecycle: LifecycleOptions::default(),
            enable_server: true,
            enable_scheduler: true,
            enable_liveness: true,
            server: ServerOptions::default(),
            scheduler: scheduler::Options::default(),
            liveness: liveness::Options::default(),
            timeouts: ExternalTimeouts::default(),
        }
    }
}

impl AppOptions {
    /// Options for the long-running scheduler process
    pub fn from_settings(
        config_path: PathBuf,
        settings: &ManagerSettings,
        schedule: &ScheduleConfig,
    ) -> Self {
        Self {
            config_path,
            lifecycle: LifecycleOptions::default(),
            enable_server: settings.server.enabled,
            enable_scheduler: schedule.enabled,
            enable_liveness: settings.liveness_interval > 0,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            scheduler: scheduler::Options {
                interval: schedule.check_interval,
            },
            liveness: liveness::Options {
                interval: Duration::from_secs(settings.liveness_interval.max(1)),
            },
            timeouts: ExternalTimeouts::from(&settings.timeouts),
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}
