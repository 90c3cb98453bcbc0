//! JSONL logging and audit trail output for Sealbox
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines format for log aggregation (default)
//! - **Principal Context**: Attach the acting user to every span in a scope
//! - **Audit Trail**: Integrity failures (`sealbox::audit` target) routed to
//!   a dedicated rolling file
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use sealbox_logging::{LogConfig, SealboxSubscriberBuilder};
//!
//! // JSONL to console
//! let _guards = SealboxSubscriberBuilder::new().init();
//!
//! // Rotating files plus audit trail
//! let _guards = SealboxSubscriberBuilder::new()
//!     .with_config(LogConfig::production("/var/log/sealbox".into()))
//!     .try_init()?;
//! ```
//!
//! The returned [`LogGuards`] flush the background writers when dropped, so
//! keep them alive for the lifetime of the program.

pub mod config;
pub mod context;
pub mod layers;

pub use config::{AuditConfig, ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use context::{PrincipalContextData, PrincipalContextGuard};
pub use layers::{PrincipalContextExtension, PrincipalContextLayer};
pub use sealbox_core::AUDIT_TARGET;

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};
use tracing_subscriber::util::TryInitError;

/// Errors from subscriber initialization
#[derive(Debug, Error)]
pub enum LogError {
    /// Log directory or file could not be created
    #[error("log file error: {0}")]
    Io(#[from] std::io::Error),

    /// Rolling appender could not be created
    #[error("log appender error: {0}")]
    Appender(#[from] InitError),

    /// A global subscriber is already installed
    #[error("subscriber already initialized: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Background writer guards
///
/// Dropping this flushes and stops the file writers.
#[derive(Debug, Default)]
#[must_use = "dropping LogGuards stops file output"]
pub struct LogGuards {
    guards: Vec<WorkerGuard>,
}

impl LogGuards {
    /// Number of background writers kept alive
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// True when no file output is configured
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// Builder for configuring and initializing the Sealbox logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output during development.
#[derive(Debug, Default)]
pub struct SealboxSubscriberBuilder {
    config: LogConfig,
}

impl SealboxSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Route audit records to their own file
    pub fn with_audit(mut self, config: AuditConfig) -> Self {
        self.config.audit = Some(config);
        self
    }

    /// Initialize the subscriber globally
    ///
    /// Failures are reported on stderr and leave logging disabled; use
    /// [`try_init`](Self::try_init) to handle them.
    pub fn init(self) -> LogGuards {
        match self.try_init() {
            Ok(guards) => guards,
            Err(e) => {
                eprintln!("Warning: Failed to initialize logging: {}", e);
                LogGuards::default()
            }
        }
    }

    /// Try to initialize the subscriber globally
    pub fn try_init(self) -> Result<LogGuards, LogError> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.default_level));
        let jsonl = &self.config.jsonl;
        let mut guards = Vec::new();

        let console = &self.config.console;
        let pretty_console = (console.enabled && console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
        });
        let jsonl_console = (console.enabled && !console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(jsonl.include_spans)
                .flatten_event(jsonl.flatten_events)
                .with_file(jsonl.include_location)
                .with_line_number(jsonl.include_location)
                .with_thread_ids(jsonl.include_thread_info)
                .with_thread_names(jsonl.include_thread_info)
        });

        let file_layer = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = file_writer(file_config)?;
                guards.push(guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(jsonl.include_spans)
                        .flatten_event(jsonl.flatten_events)
                        .with_file(jsonl.include_location)
                        .with_line_number(jsonl.include_location)
                        .with_thread_ids(jsonl.include_thread_info)
                        .with_thread_names(jsonl.include_thread_info)
                        .with_writer(writer),
                )
            }
            None => None,
        };

        let audit_layer = match &self.config.audit {
            Some(audit_config) => {
                let (writer, guard) = file_writer(&audit_config.as_file_config())?;
                guards.push(guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_current_span(false)
                        .with_span_list(false)
                        .with_writer(writer)
                        .with_filter(layers::audit_only()),
                )
            }
            None => None,
        };

        Registry::default()
            .with(env_filter)
            .with(PrincipalContextLayer::new())
            .with(pretty_console)
            .with(jsonl_console)
            .with(file_layer)
            .with(audit_layer)
            .try_init()?;

        Ok(LogGuards { guards })
    }
}

/// Open a non-blocking writer for one output file
///
/// `Never` truncates a single file, the other strategies append to rolling
/// files named `{prefix}.{date}.jsonl`.
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LogError> {
    fs::create_dir_all(&config.directory)?;
    let rotation = match config.rotation {
        RotationStrategy::Never => {
            let file = File::create(config.directory.join(format!("{}.jsonl", config.prefix)))?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.prefix)
        .filename_suffix("jsonl");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder.build(&config.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize logging with default settings (JSONL to console)
pub fn init_default() -> LogGuards {
    SealboxSubscriberBuilder::new().init()
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() -> LogGuards {
    SealboxSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Initialize logging for testing (minimal output)
///
/// Safe to call from every test: only the first call installs a subscriber.
pub fn init_testing() {
    let _ = SealboxSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}
