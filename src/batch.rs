use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::ClientStats;
use crate::errors::{AppError, AppResult};
use crate::ingestion::{RecordWriter, StandardizedRecord};
use crate::resolver::{Resolution, Resolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailurePolicy {
    Continue,
    AbortCountry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_processed_index: usize,
    pub input_len: usize,
    pub updated_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn for_output(output: &Path) -> Self {
        let mut name = output
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "output".into());
        name.push(".checkpoint.json");
        Self {
            path: output.with_file_name(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> AppResult<Option<Checkpoint>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(checkpoint) => Ok(Some(checkpoint)),
                Err(err) => {
                    warn!(
                        target: "checkpoint",
                        path = %self.path.display(),
                        error = ?err,
                        "unreadable checkpoint; starting over"
                    );
                    Ok(None)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Io(err)),
        }
    }

    // Write-then-rename so a crash leaves either the old or the new index.
    pub fn save(&self, checkpoint: &Checkpoint) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_string_pretty(checkpoint)?)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    pub fn clear(&self) -> AppResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Io(err)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Exhausted {
        last_query: Option<String>,
        attempts: u32,
    },
    Transport {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedRecord {
    pub index: usize,
    pub code: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub country_code: String,
    pub success_count: usize,
    pub failure_count: usize,
    pub total_count: usize,
    pub skipped_count: usize,
    pub aborted: bool,
    pub failures: Vec<FailedRecord>,
    pub client: ClientStats,
}

impl BatchReport {
    fn new(country_code: &str, total_count: usize) -> Self {
        Self {
            country_code: country_code.to_string(),
            success_count: 0,
            failure_count: 0,
            total_count,
            skipped_count: 0,
            aborted: false,
            failures: Vec::new(),
            client: ClientStats::default(),
        }
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{}: {} resolved, {} failed, {} total",
            self.country_code, self.success_count, self.failure_count, self.total_count
        );
        if self.skipped_count > 0 {
            line.push_str(&format!(" ({} resumed from checkpoint)", self.skipped_count));
        }
        if self.aborted {
            line.push_str(" [aborted]");
        }
        line
    }

    pub fn failed_codes(&self, limit: usize) -> Vec<&str> {
        self.failures
            .iter()
            .take(limit)
            .map(|failure| failure.code.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failure_count == 0 && !self.aborted
    }
}

pub struct BatchDriver<'a> {
    resolver: &'a Resolver,
    policy: FailurePolicy,
}

impl<'a> BatchDriver<'a> {
    pub fn new(resolver: &'a Resolver, policy: FailurePolicy) -> Self {
        Self { resolver, policy }
    }

    pub async fn run(
        &self,
        records: &[StandardizedRecord],
        output: &Path,
    ) -> AppResult<BatchReport> {
        let country_code = self.resolver.target().code.clone();
        let store = CheckpointStore::for_output(output);
        let resume_from = self.resume_point(&store, records.len(), output)?;

        let mut writer = if resume_from == 0 {
            RecordWriter::create(output)?
        } else {
            RecordWriter::append(output)?
        };

        let mut report = BatchReport::new(&country_code, records.len());
        report.skipped_count = resume_from;
        if resume_from > 0 {
            info!(
                target: "batch",
                country = %country_code,
                resume_from,
                "resuming from checkpoint"
            );
        }

        for (index, record) in records.iter().enumerate().skip(resume_from) {
            let failure = match self.resolver.resolve(record).await {
                Ok(Resolution::Success { result, .. }) => {
                    writer.write(record, &result)?;
                    store.save(&Checkpoint {
                        last_processed_index: index,
                        input_len: records.len(),
                        updated_at: Utc::now(),
                    })?;
                    report.success_count += 1;
                    continue;
                }
                Ok(Resolution::Exhausted {
                    last_query,
                    attempts,
                }) => {
                    warn!(
                        code = %record.code,
                        attempts,
                        query = last_query.as_deref().unwrap_or("<no address>"),
                        "geocoding exhausted"
                    );
                    FailureReason::Exhausted {
                        last_query,
                        attempts,
                    }
                }
                Err(AppError::Transport(message)) => {
                    warn!(code = %record.code, %message, "geocoding transport failure");
                    FailureReason::Transport { message }
                }
                Err(err) => return Err(err),
            };

            report.failure_count += 1;
            report.failures.push(FailedRecord {
                index,
                code: record.code.clone(),
                reason: failure,
            });
            if self.policy == FailurePolicy::AbortCountry {
                warn!(
                    target: "batch",
                    country = %country_code,
                    code = %record.code,
                    "aborting country after failure"
                );
                report.aborted = true;
                break;
            }
        }

        if !report.aborted {
            store.clear()?;
        }
        report.client = self.resolver.client_stats();
        Ok(report)
    }

    // Index of the first record still to process. A checkpoint written for a
    // different input, or without its output file, is discarded.
    fn resume_point(
        &self,
        store: &CheckpointStore,
        input_len: usize,
        output: &Path,
    ) -> AppResult<usize> {
        let Some(checkpoint) = store.load()? else {
            return Ok(0);
        };
        if checkpoint.input_len == input_len
            && checkpoint.last_processed_index < input_len
            && output.exists()
        {
            return Ok(checkpoint.last_processed_index + 1);
        }
        warn!(
            target: "checkpoint",
            path = %store.path().display(),
            stored_index = checkpoint.last_processed_index,
            stored_len = checkpoint.input_len,
            input_len,
            "checkpoint does not match input; starting over"
        );
        store.clear()?;
        Ok(0)
    }
}
