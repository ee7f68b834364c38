//! File-level orchestration.
//!
//! Discovery and schema loading are async; each validation run is CPU-bound
//! and goes to the blocking pool. A semaphore bounds how many files are in
//! flight, and every file that names the same schema shares one compiled
//! copy through the schema cache.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::CacheStats;
use crate::error::{Result, ValidationError};
use crate::file_discovery::FileDiscovery;
use crate::schema_loader::{SchemaLoader, SchemaReference};
use crate::validator::{ValidationEvent, ValidationOptions, Validator};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_validations: usize,
    /// Per-file limit covering schema loading and the validation run
    pub validation_timeout: Duration,
    /// Stop starting new files once one is invalid or fails
    pub fail_fast: bool,
    pub options: ValidationOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_validations: num_cpus::get(),
            validation_timeout: Duration::from_secs(60),
            fail_fast: false,
            options: ValidationOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Invalid { diagnostic_count: usize },
    Error { message: String },
    Skipped { reason: String },
}

impl ValidationStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationStatus::Valid)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationStatus::Invalid { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ValidationStatus::Error { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ValidationStatus::Skipped { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileValidationResult {
    pub path: PathBuf,
    #[serde(flatten)]
    pub status: ValidationStatus,
    /// Location of the schema the file was validated against
    pub schema: Option<String>,
    pub phase: Option<String>,
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
    pub events: Vec<ValidationEvent>,
}

fn as_millis<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_millis())
}

impl FileValidationResult {
    fn error(path: PathBuf, schema: Option<String>, error: &ValidationError, started: Instant) -> Self {
        Self {
            path,
            status: ValidationStatus::Error {
                message: error.to_string(),
            },
            schema,
            phase: None,
            duration: started.elapsed(),
            events: Vec::new(),
        }
    }

    fn skipped(path: PathBuf, reason: impl Into<String>, started: Instant) -> Self {
        Self {
            path,
            status: ValidationStatus::Skipped {
                reason: reason.into(),
            },
            schema: None,
            phase: None,
            duration: started.elapsed(),
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResults {
    pub total_files: usize,
    pub valid_files: usize,
    pub invalid_files: usize,
    pub error_files: usize,
    pub skipped_files: usize,
    pub total_diagnostics: usize,
    #[serde(serialize_with = "as_millis")]
    pub total_duration: Duration,
    pub schemas_used: Vec<String>,
    pub cache: CacheStats,
    pub file_results: Vec<FileValidationResult>,
}

impl ValidationResults {
    pub fn aggregate(file_results: Vec<FileValidationResult>, total_duration: Duration) -> Self {
        let mut results = Self {
            total_files: file_results.len(),
            valid_files: 0,
            invalid_files: 0,
            error_files: 0,
            skipped_files: 0,
            total_diagnostics: 0,
            total_duration,
            schemas_used: Vec::new(),
            cache: CacheStats::default(),
            file_results: Vec::new(),
        };

        let mut schemas = BTreeSet::new();
        for result in &file_results {
            match result.status {
                ValidationStatus::Valid => results.valid_files += 1,
                ValidationStatus::Invalid { diagnostic_count } => {
                    results.invalid_files += 1;
                    results.total_diagnostics += diagnostic_count;
                }
                ValidationStatus::Error { .. } => results.error_files += 1,
                ValidationStatus::Skipped { .. } => results.skipped_files += 1,
            }
            if let Some(schema) = &result.schema {
                schemas.insert(schema.clone());
            }
        }

        results.schemas_used = schemas.into_iter().collect();
        results.file_results = file_results;
        results
    }

    pub fn all_valid(&self) -> bool {
        self.total_files > 0 && self.valid_files == self.total_files
    }

    pub fn has_errors(&self) -> bool {
        self.error_files > 0
    }

    pub fn has_diagnostics(&self) -> bool {
        self.invalid_files > 0
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_files == 0 {
            0.0
        } else {
            self.valid_files as f64 / self.total_files as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Discovery,
    Validation,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ValidationProgress {
    pub current_file: Option<PathBuf>,
    pub completed: usize,
    pub total: usize,
    pub phase: EnginePhase,
}

pub type ProgressCallback = Arc<dyn Fn(ValidationProgress) + Send + Sync>;

/// Validates many instance files concurrently.
pub struct ValidationEngine {
    loader: Arc<SchemaLoader>,
    /// Applied to every file instead of its own xml-model reference
    schema: Option<SchemaReference>,
    config: EngineConfig,
}

impl ValidationEngine {
    pub fn new(loader: Arc<SchemaLoader>, config: EngineConfig) -> Self {
        Self {
            loader,
            schema: None,
            config,
        }
    }

    pub fn with_schema(mut self, reference: SchemaReference) -> Self {
        self.schema = Some(reference);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn validate_path(
        &self,
        path: &Path,
        discovery: &FileDiscovery,
        progress: Option<ProgressCallback>,
    ) -> Result<ValidationResults> {
        let started = Instant::now();
        report(&progress, None, 0, 0, EnginePhase::Discovery);

        let files = discovery.discover_files(path).await?;
        info!(count = files.len(), root = %path.display(), "validating files");

        let file_results = self.validate_files(files, progress.clone()).await?;
        let mut results = ValidationResults::aggregate(file_results, started.elapsed());
        results.cache = self.loader.cache().stats().await;

        report(
            &progress,
            None,
            results.total_files,
            results.total_files,
            EnginePhase::Complete,
        );
        Ok(results)
    }

    /// Validate `files`, returning one result per file in input order.
    pub async fn validate_files(
        &self,
        files: Vec<PathBuf>,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<FileValidationResult>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let total = files.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.max_concurrent_validations.max(1),
        ));

        let tasks: Vec<_> = files
            .into_iter()
            .map(|path| {
                let loader = Arc::clone(&self.loader);
                let explicit = self.schema.clone();
                let config = self.config.clone();
                let semaphore = Arc::clone(&semaphore);
                let completed = Arc::clone(&completed);
                let stop = Arc::clone(&stop);
                let progress = progress.clone();

                tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.map_err(|_| {
                        ValidationError::Concurrency {
                            details: "validation semaphore closed".to_string(),
                        }
                    })?;

                    let started = Instant::now();
                    let result = if stop.load(Ordering::SeqCst) {
                        FileValidationResult::skipped(path.clone(), "fail-fast", started)
                    } else {
                        Self::validate_with_timeout(&loader, explicit.as_ref(), &config, path.clone())
                            .await
                    };

                    if config.fail_fast && (result.status.is_invalid() || result.status.is_error()) {
                        stop.store(true, Ordering::SeqCst);
                    }

                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    report(&progress, Some(path), done, total, EnginePhase::Validation);
                    Ok::<_, ValidationError>(result)
                })
            })
            .collect();

        let joined = try_join_all(tasks)
            .await
            .map_err(|e| ValidationError::Concurrency {
                details: format!("task join error: {}", e),
            })?;
        joined.into_iter().collect()
    }

    async fn validate_with_timeout(
        loader: &SchemaLoader,
        explicit: Option<&SchemaReference>,
        config: &EngineConfig,
        path: PathBuf,
    ) -> FileValidationResult {
        let started = Instant::now();
        let cancel = Arc::new(AtomicBool::new(false));
        let options = ValidationOptions {
            cancel: Some(Arc::clone(&cancel)),
            ..config.options.clone()
        };

        let run = Self::validate_file(loader, explicit, options, path.clone());
        match tokio::time::timeout(config.validation_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                let error = ValidationError::Timeout {
                    url: path.display().to_string(),
                    timeout_seconds: config.validation_timeout.as_secs(),
                };
                FileValidationResult::error(path, None, &error, started)
            }
        }
    }

    /// Load the file's schema and validate it once.
    pub async fn validate_file(
        loader: &SchemaLoader,
        explicit: Option<&SchemaReference>,
        options: ValidationOptions,
        path: PathBuf,
    ) -> FileValidationResult {
        let started = Instant::now();

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                return FileValidationResult::error(path, None, &ValidationError::Io(e), started);
            }
        };

        let reference = match explicit {
            Some(reference) => reference.clone(),
            None => match loader.reference_for(&text, &path) {
                Ok(reference) => reference,
                Err(_) => {
                    return FileValidationResult::skipped(
                        path,
                        "no Schematron xml-model reference",
                        started,
                    );
                }
            },
        };
        let location = reference.href.clone();

        let cached = match loader.load(&reference).await {
            Ok(cached) => cached,
            Err(e) => return FileValidationResult::error(path, Some(location), &e, started),
        };

        let validator = Validator::with_options(Arc::clone(&cached.schema), options);
        let origin = path.clone();
        let outcome =
            tokio::task::spawn_blocking(move || validator.validate_named(&text, &origin)).await;

        let report = match outcome {
            Ok(Ok(report)) => report,
            Ok(Err(ValidationError::Cancelled)) => {
                return FileValidationResult::skipped(path, "cancelled", started);
            }
            Ok(Err(e)) => return FileValidationResult::error(path, Some(location), &e, started),
            Err(e) => {
                let error = ValidationError::Concurrency {
                    details: e.to_string(),
                };
                return FileValidationResult::error(path, Some(location), &error, started);
            }
        };

        debug!(
            file = %path.display(),
            phase = %report.phase,
            events = report.events.len(),
            "validated"
        );

        let status = if report.is_valid() {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Invalid {
                diagnostic_count: report.events.len(),
            }
        };
        FileValidationResult {
            path,
            status,
            schema: Some(location),
            phase: Some(report.phase),
            duration: started.elapsed(),
            events: report.events,
        }
    }
}

fn report(
    progress: &Option<ProgressCallback>,
    current_file: Option<PathBuf>,
    completed: usize,
    total: usize,
    phase: EnginePhase,
) {
    if let Some(callback) = progress {
        callback(ValidationProgress {
            current_file,
            completed,
            total,
            phase,
        });
    }
}
