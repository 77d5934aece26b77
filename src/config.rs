use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlate::CorrelationOptions;
use crate::error::{MiicError, MiicResult};
use crate::monitor::{PlotStyle, Sides, StretchParams};
use crate::trace_data::FieldAmplitudes;
use crate::utils::seconds_to_duration;

//=====================================================================
// Project options, read from a YAML file. Every field has a default so
// a file only needs to name what differs.
//=====================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub proj_dir: PathBuf,
    pub sds_root: PathBuf,
    /// Log files go to `proj_dir/log_subdir`.
    pub log_subdir: String,
    pub debug: bool,
    pub amp: FieldAmplitudes,
    pub co: CorrelationOptions,
    pub dv: DvOptions,
    pub preprocess: PreprocessOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            proj_dir: PathBuf::from("."),
            sds_root: PathBuf::from("sds"),
            log_subdir: "log".to_string(),
            debug: false,
            amp: FieldAmplitudes::default(),
            co: CorrelationOptions::default(),
            dv: DvOptions::default(),
            preprocess: PreprocessOptions::default(),
        }
    }
}

/// Velocity change monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DvOptions {
    /// Output folder below `proj_dir`.
    pub subdir: String,
    /// Folder of the correlation archives below `proj_dir`.
    pub corr_subdir: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Seconds between the starts of two estimates.
    pub date_inc: f64,
    /// Seconds of correlations averaged for one estimate.
    pub win_len: f64,
    pub freq_min: f64,
    pub freq_max: f64,
    /// Lapse time of the coda window in seconds.
    pub tw_start: f64,
    pub tw_len: f64,
    pub sides: Sides,
    pub stretch_range: f64,
    pub stretch_steps: usize,
    pub plot_style: PlotStyle,
}

impl Default for DvOptions {
    fn default() -> Self {
        // 2021-01-01 and 2021-02-01
        let start_date = DateTime::from_timestamp(1_609_459_200, 0).unwrap_or_default();
        let end_date = DateTime::from_timestamp(1_612_137_600, 0).unwrap_or_default();
        Self {
            subdir: "vel_change".to_string(),
            corr_subdir: "corr".to_string(),
            start_date,
            end_date,
            date_inc: 86400.0,
            win_len: 86400.0,
            freq_min: 0.1,
            freq_max: 0.5,
            tw_start: 20.0,
            tw_len: 60.0,
            sides: Sides::Both,
            stretch_range: 0.03,
            stretch_steps: 1000,
            plot_style: PlotStyle::Technical,
        }
    }
}

impl DvOptions {
    /// Start and end of every averaging window between `start_date` and
    /// `end_date`.
    pub fn windows(&self) -> (Vec<DateTime<Utc>>, Vec<DateTime<Utc>>) {
        let inc = seconds_to_duration(self.date_inc);
        let len = seconds_to_duration(self.win_len);
        let mut starts = Vec::new();
        let mut start = self.start_date;
        while start < self.end_date {
            starts.push(start);
            start += inc;
        }
        let ends = starts.iter().map(|t| *t + len).collect();
        (starts, ends)
    }

    pub fn stretch_params(&self) -> StretchParams {
        StretchParams {
            stretch_range: self.stretch_range,
            stretch_steps: self.stretch_steps,
            sides: self.sides,
            remove_nans: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    pub sampling_rate: f64,
    /// Output folder below `sds_root`.
    pub outfolder: String,
    pub chunk_len: f64,
    pub taper_len: f64,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self { sampling_rate: 25.0, outfolder: "preprocessed".to_string(), chunk_len: 3600.0, taper_len: 30.0 }
    }
}

impl Options {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let options: Options = serde_yaml::from_str(text).context("Invalid options")?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn validate(&self) -> MiicResult<()> {
        self.amp.validate()?;
        self.co.validate(self.preprocess.sampling_rate)?;

        let dv = &self.dv;
        if dv.freq_min <= 0.0 || dv.freq_min >= dv.freq_max {
            return Err(MiicError::Frequency(format!(
                "need 0 < freq_min < freq_max, got {} and {}",
                dv.freq_min, dv.freq_max
            )));
        }
        let nyquist = self.preprocess.sampling_rate / 2.0;
        if dv.freq_max >= nyquist {
            return Err(MiicError::Frequency(format!(
                "freq_max ({} Hz) must be below the Nyquist frequency ({} Hz)",
                dv.freq_max, nyquist
            )));
        }
        if dv.end_date <= dv.start_date {
            return Err(MiicError::invalid(format!("end_date {} is not after start_date {}", dv.end_date, dv.start_date)));
        }
        for (name, value) in [("date_inc", dv.date_inc), ("win_len", dv.win_len), ("tw_len", dv.tw_len)] {
            if value <= 0.0 {
                return Err(MiicError::invalid(format!("{} must be positive, got {}", name, value)));
            }
        }
        if dv.tw_start < 0.0 || dv.stretch_range <= 0.0 || dv.stretch_steps == 0 {
            return Err(MiicError::invalid("tw_start, stretch_range and stretch_steps are out of range"));
        }

        let pre = &self.preprocess;
        if pre.sampling_rate <= 0.0 || pre.chunk_len <= 0.0 || pre.taper_len < 0.0 {
            return Err(MiicError::invalid("preprocessing lengths and sampling rate must be positive"));
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.proj_dir.join(&self.log_subdir)
    }

    pub fn corr_dir(&self) -> PathBuf {
        self.proj_dir.join(&self.dv.corr_subdir)
    }

    pub fn dv_dir(&self) -> PathBuf {
        self.proj_dir.join(&self.dv.subdir)
    }
}
