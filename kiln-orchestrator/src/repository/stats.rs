//! Run statistics
//!
//! Durations come from the per-image stage timings. A stage missing either
//! timestamp contributes zero.

use std::time::Duration;

use kiln_core::{PipelineRun, Stage, StageTimings};

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageStatistics {
    pub name: String,
    pub build: Duration,
    pub upload: Duration,
    pub import: Duration,
    pub total: Duration,
    pub upload_mib: f64,
    /// MiB/s, zero when nothing was uploaded or the upload has no duration.
    pub upload_throughput: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatistics {
    pub run_id: String,
    pub total: Duration,
    pub build: Duration,
    pub upload: Duration,
    pub import: Duration,
    pub bytes_uploaded: u64,
    pub upload_throughput: f64,
    pub images: Vec<ImageStatistics>,
}

fn span(timings: &StageTimings, stage: Stage) -> Duration {
    timings.span(stage).to_std().unwrap_or_default()
}

impl PipelineStatistics {
    pub fn from_run(run: &PipelineRun) -> Self {
        let end = run.completed_at.unwrap_or(run.updated_at);
        let total = (end - run.started_at).to_std().unwrap_or_default();

        let mut stats = Self {
            run_id: run.run_id.clone(),
            total,
            build: Duration::ZERO,
            upload: Duration::ZERO,
            import: Duration::ZERO,
            bytes_uploaded: 0,
            upload_throughput: 0.0,
            images: Vec::with_capacity(run.images.len()),
        };

        for img in &run.images {
            let build = span(&img.timings, Stage::Build);
            let upload = span(&img.timings, Stage::Upload);
            let import = span(&img.timings, Stage::Import);
            stats.build += build;
            stats.upload += upload;
            stats.import += import;

            let bytes = img.metrics.upload_size_bytes;
            stats.bytes_uploaded += bytes;
            let upload_mib = bytes as f64 / MIB;
            let upload_throughput = if bytes > 0 && !upload.is_zero() {
                upload_mib / upload.as_secs_f64()
            } else {
                0.0
            };

            stats.images.push(ImageStatistics {
                name: img.name.clone(),
                build,
                upload,
                import,
                total: build + upload + import,
                upload_mib,
                upload_throughput,
            });
        }

        if stats.bytes_uploaded > 0 && !stats.upload.is_zero() {
            stats.upload_throughput =
                stats.bytes_uploaded as f64 / MIB / stats.upload.as_secs_f64();
        }
        stats
    }
}

/// Short human form: `0s`, `42s`, `3m12s`, `1h2m3s`. Rounds to the nearest second.
pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        return "0s".to_string();
    }
    let secs = (d.as_millis() + 500) / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}
