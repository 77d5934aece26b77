use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::datatype::{self, Header, Matrix, Record, Scalar, Sequence, Unit, Vector};
use crate::error::{MiicError, MiicResult};
use crate::monitor::post_corr::{self, ExtractMethod, NormType, SmoothingWindow};
use crate::monitor::stretch::{multi_ref_vchange_and_align, time_stretch_estimate, StretchParams};
use crate::monitor::{DvMethod, ValueType, DV};
use crate::utils::{duration_to_seconds, seconds_to_duration};

//=====================================================================
// Correlation functions of one channel combination over time.
//=====================================================================

/// Position of the two stations of a combination, the first one is the
/// virtual source (`ev*`) and the second the receiver (`st*`). Distance in
/// km, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairGeometry {
    pub stla: f64,
    pub stlo: f64,
    pub stel: f64,
    pub evla: f64,
    pub evlo: f64,
    pub evel: f64,
    pub dist: f64,
    pub az: f64,
    pub baz: f64,
}

impl PairGeometry {
    fn to_array(self) -> Array1<f64> {
        Array1::from(vec![self.stla, self.stlo, self.stel, self.evla, self.evlo, self.evel, self.dist, self.az, self.baz])
    }

    fn from_slice(values: &[f64]) -> Option<Self> {
        match *values {
            [stla, stlo, stel, evla, evlo, evel, dist, az, baz] => {
                Some(Self { stla, stlo, stel, evla, evlo, evel, dist, az, baz })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrStats {
    pub network: String,
    pub station: String,
    /// Channel combination, e.g. `HHZ-HHE`.
    pub channel: String,
    /// Lag of the first sample in seconds.
    pub start_lag: f64,
    pub sampling_rate: f64,
    pub npts: usize,
    /// Start of the time window of every correlation function.
    pub corr_start: Vec<DateTime<Utc>>,
    pub corr_end: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub geometry: Option<PairGeometry>,
}

impl Default for CorrStats {
    fn default() -> Self {
        Self {
            network: String::new(),
            station: String::new(),
            channel: String::new(),
            start_lag: 0.0,
            sampling_rate: 1.0,
            npts: 0,
            corr_start: Vec::new(),
            corr_end: Vec::new(),
            geometry: None,
        }
    }
}

fn seconds() -> Unit {
    Unit::parse("s").unwrap_or_default()
}

fn get<'a>(records: &'a BTreeMap<String, Record>, key: &str) -> Result<&'a Record> {
    records.get(key).ok_or_else(|| anyhow!("missing record '{}'", key))
}

fn get_scalar(records: &BTreeMap<String, Record>, key: &str) -> Result<f64> {
    get(records, key)?
        .as_scalar()
        .map(|scalar| scalar.value)
        .ok_or_else(|| anyhow!("record '{}' is not a scalar", key))
}

impl CorrStats {
    pub fn end_lag(&self) -> f64 {
        self.start_lag + self.npts.saturating_sub(1) as f64 / self.sampling_rate
    }

    /// Sample index of `lag` seconds, may lie outside the trace.
    pub fn lag_index(&self, lag: f64) -> i64 {
        ((lag - self.start_lag) * self.sampling_rate).round() as i64
    }

    pub fn id(&self) -> String {
        format!("{}.{}.{}", self.network, self.station, self.channel)
    }

    /// Records `{prefix}corr_window`, `{prefix}start_lag`,
    /// `{prefix}sampling_rate`, `{prefix}npts` and, if known,
    /// `{prefix}geometry`.
    pub fn to_records(&self, prefix: &str) -> MiicResult<BTreeMap<String, Record>> {
        let lengths: Array1<f64> = self
            .corr_start
            .iter()
            .enumerate()
            .map(|(i, start)| self.corr_end.get(i).map_or(f64::NAN, |end| duration_to_seconds(*end - *start)))
            .collect();
        let window_meta = Header::new("window length", "T", seconds()).with_description(self.id());
        let windows = Sequence::new(window_meta, self.corr_start.clone(), lengths)?;

        let hertz = Unit::parse("Hz").unwrap_or_default();
        let mut records = BTreeMap::new();
        records.insert(format!("{}corr_window", prefix), windows.into());
        records.insert(format!("{}start_lag", prefix), Scalar::new(Header::new("start lag", "t0", seconds()), self.start_lag).into());
        records.insert(format!("{}sampling_rate", prefix), Scalar::new(Header::new("sampling rate", "fs", hertz), self.sampling_rate).into());
        records.insert(format!("{}npts", prefix), Scalar::new(Header::dimensionless("samples"), self.npts as f64).into());
        if let Some(geometry) = self.geometry {
            let meta = Header::dimensionless("stla stlo stel evla evlo evel dist az baz");
            records.insert(format!("{}geometry", prefix), Vector::new(meta, geometry.to_array()).into());
        }
        Ok(records)
    }

    pub fn from_records(records: &BTreeMap<String, Record>, prefix: &str) -> Result<Self> {
        let key = format!("{}corr_window", prefix);
        let windows = get(records, &key)?
            .as_sequence()
            .ok_or_else(|| anyhow!("record '{}' is not a sequence", key))?;
        let mut id = windows.meta.description.splitn(3, '.');
        let mut part = || id.next().unwrap_or_default().to_string();
        let (network, station, channel) = (part(), part(), part());

        let corr_end = if windows.data.iter().all(|v| v.is_nan()) {
            Vec::new()
        } else {
            windows.times.iter().zip(windows.data.iter()).map(|(t, len)| *t + seconds_to_duration(*len)).collect()
        };
        let key = format!("{}geometry", prefix);
        let geometry = match records.get(&key) {
            Some(record) => {
                let values = record.as_vector().ok_or_else(|| anyhow!("record '{}' is not a vector", key))?;
                let values = values.data.to_vec();
                Some(PairGeometry::from_slice(&values).ok_or_else(|| anyhow!("record '{}' needs 9 values", key))?)
            }
            None => None,
        };
        Ok(Self {
            network,
            station,
            channel,
            start_lag: get_scalar(records, &format!("{}start_lag", prefix))?,
            sampling_rate: get_scalar(records, &format!("{}sampling_rate", prefix))?,
            npts: get_scalar(records, &format!("{}npts", prefix))? as usize,
            corr_start: windows.times.clone(),
            corr_end,
            geometry,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrBulk {
    pub data: Array2<f64>,
    pub stats: CorrStats,
}

impl CorrBulk {
    pub fn new(data: Array2<f64>, mut stats: CorrStats) -> MiicResult<Self> {
        if stats.corr_start.len() != data.nrows() {
            return Err(MiicError::shape(&[data.nrows()], &[stats.corr_start.len()]));
        }
        if !stats.corr_end.is_empty() && stats.corr_end.len() != stats.corr_start.len() {
            return Err(MiicError::shape(&[stats.corr_start.len()], &[stats.corr_end.len()]));
        }
        if stats.sampling_rate <= 0.0 {
            return Err(MiicError::invalid(format!("sampling rate must be positive, got {}", stats.sampling_rate)));
        }
        stats.npts = data.ncols();
        Ok(Self { data, stats })
    }

    pub fn clip(&mut self, thres: f64, axis: Option<Axis>) -> MiicResult<()> {
        post_corr::corr_mat_clip(&mut self.data, thres, axis)
    }

    pub fn smooth(&mut self, window_len: usize, window: SmoothingWindow, axis: Axis) -> MiicResult<()> {
        self.data = post_corr::corr_mat_smooth(self.data.view(), window_len, window, axis)?;
        Ok(())
    }

    pub fn filter(&mut self, freqs: &[f64]) -> MiicResult<()> {
        self.data = post_corr::corr_mat_filter(self.data.view(), &self.stats, freqs)?;
        Ok(())
    }

    pub fn trim(&mut self, start: f64, end: f64) -> MiicResult<()> {
        (self.data, self.stats) = post_corr::corr_mat_trim(self.data.view(), &self.stats, start, end)?;
        Ok(())
    }

    pub fn resample(&mut self, starts: &[DateTime<Utc>], ends: Option<&[DateTime<Utc>]>) -> MiicResult<()> {
        (self.data, self.stats) = post_corr::corr_mat_resample(self.data.view(), &self.stats, starts, ends)?;
        Ok(())
    }

    pub fn normalize(&mut self, normtype: NormType, starttime: Option<f64>, endtime: Option<f64>) {
        self.data = post_corr::corr_mat_normalize(self.data.view(), &self.stats, normtype, starttime, endtime);
    }

    pub fn mirror(&mut self) {
        (self.data, self.stats) = post_corr::corr_mat_mirror(self.data.view(), &self.stats);
    }

    pub fn taper(&mut self, width: f64) -> MiicResult<()> {
        self.data = post_corr::corr_mat_taper(self.data.view(), &self.stats, width)?;
        Ok(())
    }

    pub fn taper_center(&mut self, width: f64, slope_frac: f64) -> MiicResult<()> {
        self.data = post_corr::corr_mat_taper_center(self.data.view(), &self.stats, width, slope_frac)?;
        Ok(())
    }

    pub fn decimate(&mut self, factor: usize) -> MiicResult<()> {
        (self.data, self.stats) = post_corr::corr_mat_decimate(self.data.view(), &self.stats, factor)?;
        Ok(())
    }

    pub fn resample_time(&mut self, freq: f64) -> MiicResult<()> {
        (self.data, self.stats) = post_corr::corr_mat_resample_time(self.data.view(), &self.stats, freq)?;
        Ok(())
    }

    pub fn extract_trace(&self, method: ExtractMethod) -> MiicResult<Array1<f64>> {
        post_corr::corr_mat_extract_trace(self.data.view(), method)
    }

    /// Single reference stretching inside the time window `tw`, sample
    /// indices counted from zero lag.
    pub fn stretch(&self, ref_trc: Option<ArrayView1<f64>>, tw: &[usize], params: &StretchParams) -> MiicResult<DV> {
        let windows = [tw.to_vec()];
        let estimate = time_stretch_estimate(self.data.view(), ref_trc, Some(&windows[..]), params)?;
        Ok(DV {
            corr: estimate.corr.column(0).to_owned(),
            value: estimate.value.column(0).to_owned(),
            sim_mat: estimate.sim_mat.index_axis(Axis(2), 0).to_owned(),
            second_axis: estimate.second_axis,
            stats: self.stats.clone(),
            value_type: ValueType::Stretch,
            method: DvMethod::SingleRef,
        })
    }

    /// Stretching against every row of `ref_trs`, with the estimates
    /// aligned to a common reference and averaged.
    pub fn stretch_multi_ref(&self, ref_trs: ArrayView2<f64>, tw: &[usize], params: &StretchParams) -> MiicResult<DV> {
        let windows = [tw.to_vec()];
        let estimate = multi_ref_vchange_and_align(self.data.view(), ref_trs, Some(&windows[..]), params)?;
        Ok(DV {
            corr: estimate.corr.column(0).to_owned(),
            value: estimate.value.column(0).to_owned(),
            sim_mat: estimate.sim_mat.index_axis(Axis(2), 0).to_owned(),
            second_axis: estimate.second_axis,
            stats: self.stats.clone(),
            value_type: ValueType::Stretch,
            method: if ref_trs.nrows() > 1 { DvMethod::MultiRef } else { DvMethod::SingleRef },
        })
    }

    pub fn to_records(&self) -> MiicResult<BTreeMap<String, Record>> {
        let prefix = format!("{}/", self.stats.channel);
        let meta = Header::dimensionless("correlation").with_description(self.stats.id());
        let axis0 = Header::new("time", "t", seconds());
        let axis1 = Header::new("lag time", "tau", seconds());
        let mut records = self.stats.to_records(&prefix)?;
        records.insert(format!("{}data", prefix), Matrix::new(meta, axis0, axis1, self.data.clone()).into());
        Ok(records)
    }

    pub fn from_records(records: &BTreeMap<String, Record>, channel: &str) -> Result<Self> {
        let prefix = format!("{}/", channel);
        let key = format!("{}data", prefix);
        let matrix = get(records, &key)?
            .as_matrix()
            .ok_or_else(|| anyhow!("record '{}' is not a matrix", key))?;
        let stats = CorrStats::from_records(records, &prefix)?;
        Ok(CorrBulk::new(matrix.data.clone(), stats)?)
    }
}

/// Channel combinations stored in an archive of correlation matrices.
pub fn corr_channels(records: &BTreeMap<String, Record>) -> Vec<String> {
    records.keys().filter_map(|key| key.strip_suffix("/data")).map(String::from).collect()
}

pub fn save_corr_bulks<P: AsRef<Path>>(path: P, bulks: &[CorrBulk]) -> Result<()> {
    let mut records = BTreeMap::new();
    for bulk in bulks {
        records.extend(bulk.to_records().with_context(|| format!("Cannot store {}", bulk.stats.id()))?);
    }
    datatype::save(path, &records)
}

pub fn load_corr_bulks<P: AsRef<Path>>(path: P) -> Result<Vec<CorrBulk>> {
    let path = path.as_ref();
    let records = datatype::load(path)?;
    let channels = corr_channels(&records);
    debug!("{} holds {} channel combination(s)", path.display(), channels.len());
    channels
        .iter()
        .map(|channel| {
            CorrBulk::from_records(&records, channel)
                .with_context(|| format!("Invalid correlations for {} in {}", channel, path.display()))
        })
        .collect()
}
