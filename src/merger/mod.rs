//! Segment merging
//!
//! Concatenates the finished segments of one recording into a single file.
//! Segment `i` starts at the sum of the durations of the segments before it,
//! with its own audio and video kept together.

pub mod ffmpeg;
pub mod manifest;

pub use ffmpeg::FfmpegExporter;
pub use manifest::ManifestExporter;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Probe failed for {path}: {message}")]
    Probe { path: PathBuf, message: String },

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Segment not found: {0}")]
    SegmentNotFound(PathBuf),

    #[error("Merge task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MergeResult<T> = Result<T, MergeError>;

/// Export quality levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportQuality {
    Low,
    Medium,
    #[default]
    High,
    Lossless,
}

impl ExportQuality {
    /// CRF for H.264; lower is better
    pub fn crf(&self) -> u8 {
        match self {
            ExportQuality::Low => 28,
            ExportQuality::Medium => 23,
            ExportQuality::High => 18,
            // CRF 0 has compatibility issues with yuv420p
            ExportQuality::Lossless => 1,
        }
    }

    pub fn h264_preset(&self) -> &'static str {
        match self {
            ExportQuality::Low => "faster",
            ExportQuality::Medium => "medium",
            ExportQuality::High => "slow",
            ExportQuality::Lossless => "veryslow",
        }
    }
}

/// One segment placed on the merged timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEntry {
    pub path: PathBuf,
    pub duration: Duration,
    pub offset: Duration,
}

/// Ordered segments with their offsets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub entries: Vec<MergeEntry>,
}

impl MergePlan {
    /// Lay out `(path, duration)` pairs back to back
    pub fn new(segments: impl IntoIterator<Item = (PathBuf, Duration)>) -> Self {
        let mut offset = Duration::ZERO;
        let entries = segments
            .into_iter()
            .map(|(path, duration)| {
                let entry = MergeEntry {
                    path,
                    duration,
                    offset,
                };
                offset += duration;
                entry
            })
            .collect();
        Self { entries }
    }

    pub fn total_duration(&self) -> Duration {
        self.entries.iter().map(|e| e.duration).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Probes segment durations and writes the merged file
pub trait SegmentExporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Container duration of a finished segment
    fn probe_duration(&self, path: &Path) -> MergeResult<Duration>;

    /// Write `plan` as one file at `output`
    fn export(&self, plan: &MergePlan, output: &Path) -> MergeResult<()>;

    /// Extension of the files this exporter writes
    fn extension(&self) -> &'static str {
        "mp4"
    }
}

pub struct SegmentMerger {
    exporter: Arc<dyn SegmentExporter>,
    output_dir: PathBuf,
}

impl SegmentMerger {
    pub fn new(exporter: Arc<dyn SegmentExporter>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            exporter,
            output_dir: output_dir.into(),
        }
    }

    fn output_path(&self) -> PathBuf {
        self.output_dir.join(format!(
            "merged-{}.{}",
            Uuid::new_v4(),
            self.exporter.extension()
        ))
    }

    /// Merge `segments` into one file
    ///
    /// No segments gives `None` and a single segment is returned as is. With
    /// two or more, the sources are deleted once the merged file is written;
    /// on failure they are left in place and `None` is returned.
    pub async fn merge(&self, segments: &[PathBuf]) -> Option<PathBuf> {
        match self.try_merge(segments).await {
            Ok(path) => path,
            Err(e) => {
                tracing::error!("Failed to merge {} segments: {}", segments.len(), e);
                None
            }
        }
    }

    pub async fn try_merge(&self, segments: &[PathBuf]) -> MergeResult<Option<PathBuf>> {
        match segments {
            [] => return Ok(None),
            [single] => return Ok(Some(single.clone())),
            _ => {}
        }

        let exporter = self.exporter.clone();
        let segments = segments.to_vec();
        let output = self.output_path();

        tokio::task::spawn_blocking(move || merge_blocking(exporter.as_ref(), &segments, &output))
            .await
            .map_err(|e| MergeError::Task(e.to_string()))?
            .map(Some)
    }
}

fn merge_blocking(
    exporter: &dyn SegmentExporter,
    segments: &[PathBuf],
    output: &Path,
) -> MergeResult<PathBuf> {
    let mut probed = Vec::with_capacity(segments.len());
    for path in segments {
        if !path.exists() {
            return Err(MergeError::SegmentNotFound(path.clone()));
        }
        probed.push((path.clone(), exporter.probe_duration(path)?));
    }

    let plan = MergePlan::new(probed);
    for (i, entry) in plan.entries.iter().enumerate() {
        tracing::debug!(
            "Merge segment {}: {:?} duration={:?} offset={:?}",
            i,
            entry.path,
            entry.duration,
            entry.offset
        );
    }
    tracing::info!(
        "Merging {} segments ({:?} total) into {:?} with {} exporter",
        plan.len(),
        plan.total_duration(),
        output,
        exporter.name()
    );

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if let Err(e) = exporter.export(&plan, output) {
        if output.exists() {
            if let Err(rm) = std::fs::remove_file(output) {
                tracing::warn!("Failed to remove partial merge output {:?}: {}", output, rm);
            }
        }
        return Err(e);
    }

    match std::fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => {}
        _ => {
            return Err(MergeError::Export(format!(
                "merged output {:?} missing or empty",
                output
            )))
        }
    }

    for entry in &plan.entries {
        if let Err(e) = std::fs::remove_file(&entry.path) {
            tracing::warn!("Failed to delete merged segment {:?}: {}", entry.path, e);
        }
    }

    tracing::info!("Merged recording written to {:?}", output);
    Ok(output.to_path_buf())
}
