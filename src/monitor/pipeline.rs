use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Options;
use crate::error::MiicResult;
use crate::logging::init_tracing;
use crate::monitor::{load_corr_bulks, plot_dv, CorrBulk, ExtractMethod, NormType, DV};

//=====================================================================
// Velocity change monitoring of all correlation archives of a project.
//=====================================================================

pub struct Monitor {
    pub options: Options,
    /// Averaging windows of the estimates.
    pub starts: Vec<DateTime<Utc>>,
    pub ends: Vec<DateTime<Utc>>,
    pub indir: PathBuf,
    pub outdir: PathBuf,
    /// Correlation archives found in `indir`.
    pub infiles: Vec<PathBuf>,
}

impl Monitor {
    pub fn new(options: Options) -> Result<Self> {
        options.validate()?;
        init_tracing(options.debug, Some(options.log_dir().as_path()))?;

        let indir = options.corr_dir();
        let outdir = options.dv_dir();
        for dir in [&indir, &outdir] {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let mut infiles = Vec::new();
        for entry in WalkDir::new(&indir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("Failed to list {}", indir.display()))?;
            if entry.file_type().is_file() && entry.path().extension().is_some_and(|ext| ext == "miic") {
                infiles.push(entry.into_path());
            }
        }
        infiles.sort();

        let (starts, ends) = options.dv.windows();
        info!(
            "Monitoring {} correlation file(s) in {}, {} window(s) from {} to {}",
            infiles.len(), indir.display(), starts.len(), options.dv.start_date, options.dv.end_date
        );
        Ok(Self { options, starts, ends, indir, outdir, infiles })
    }

    /// Velocity change of one correlation matrix: normalise, average into
    /// the monitoring windows, filter, cut to the coda window and stretch
    /// against the mean trace.
    pub fn process(&self, mut bulk: CorrBulk) -> MiicResult<DV> {
        let dv = &self.options.dv;
        let lapse_end = dv.tw_start + dv.tw_len;

        bulk.normalize(NormType::Absmax, None, None);
        bulk.resample(&self.starts, Some(self.ends.as_slice()))?;
        bulk.filter(&[dv.freq_min, dv.freq_max])?;
        bulk.trim(-lapse_end, lapse_end)?;

        let sampling_rate = bulk.stats.sampling_rate;
        let first = (dv.tw_start * sampling_rate).round() as usize;
        let last = (lapse_end * sampling_rate).round() as usize;
        let tw: Vec<usize> = (first..last).collect();

        let reference = bulk.extract_trace(ExtractMethod::Mean)?;
        bulk.stretch(Some(reference.view()), &tw, &dv.stretch_params())
    }

    /// Process every channel combination in `corr_file`, or only `channel`.
    /// Returns the written velocity change archives.
    pub fn compute_velocity_change<P: AsRef<Path>>(&self, corr_file: P, channel: Option<&str>) -> Result<Vec<PathBuf>> {
        let corr_file = corr_file.as_ref();
        let bulks = load_corr_bulks(corr_file)?;
        let mut written = Vec::new();
        for bulk in bulks.into_iter().filter(|b| channel.is_none_or(|c| b.stats.channel == c)) {
            let id = bulk.stats.id();
            debug!("Estimating velocity change of {}", id);
            let dv = self.process(bulk).with_context(|| format!("Velocity change of {} failed", id))?;

            let path = self.outdir.join(format!("DV-{}.miic", id));
            dv.save(&path)?;
            plot_dv(&dv, path.with_extension("html"), self.options.dv.plot_style)?;
            info!("Saved velocity change of {} to {}", id, path.display());
            written.push(path);
        }
        Ok(written)
    }

    /// All correlation archives in parallel. Failing files are logged and
    /// skipped.
    pub fn compute_velocity_change_bulk(&self) -> Result<Vec<PathBuf>> {
        let written: Vec<PathBuf> = self
            .infiles
            .par_iter()
            .flat_map_iter(|file| match self.compute_velocity_change(file, None) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!("Skipping {}: {:#}", file.display(), e);
                    Vec::new()
                }
            })
            .collect();
        info!("Computed {} velocity change(s)", written.len());
        Ok(written)
    }
}
