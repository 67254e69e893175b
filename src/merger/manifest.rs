//! Manifest segment exporter, the merge counterpart of the manifest muxer

use super::{MergeError, MergePlan, MergeResult, SegmentExporter};
use crate::encoder::RecordingManifest;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestExporter;

fn load(path: &Path) -> MergeResult<RecordingManifest> {
    RecordingManifest::load(path).map_err(|e| MergeError::Probe {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

impl SegmentExporter for ManifestExporter {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn probe_duration(&self, path: &Path) -> MergeResult<Duration> {
        Ok(load(path)?.duration())
    }

    fn export(&self, plan: &MergePlan, output: &Path) -> MergeResult<()> {
        let Some(first) = plan.entries.first() else {
            return Err(MergeError::Export("nothing to merge".to_string()));
        };
        let mut merged = load(&first.path)?;
        merged.video_frames = 0;
        merged.audio_frames = 0;
        merged.sources.clear();
        merged.source_offsets_ms.clear();

        for entry in &plan.entries {
            let segment = load(&entry.path)?;
            if (segment.width, segment.height) != (merged.width, merged.height) {
                return Err(MergeError::Export(format!(
                    "{:?} is {}x{}, expected {}x{}",
                    entry.path, segment.width, segment.height, merged.width, merged.height
                )));
            }
            merged.video_frames += segment.video_frames;
            // Audio is padded or cut to the segment duration
            merged.audio_frames +=
                (entry.duration.as_secs_f64() * merged.sample_rate as f64).round() as u64;
            merged.sources.push(entry.path.clone());
            merged.source_offsets_ms.push(entry.offset.as_millis() as u64);
        }
        merged.created_at = chrono::Utc::now();

        merged
            .save(output)
            .map_err(|e| MergeError::Export(e.to_string()))
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}
