use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array1, Array2};
use plotly::common::{ColorBar, ColorScale, ColorScalePalette, Marker, Mode, Title};
use plotly::layout::Axis as PlotAxis;
use plotly::{HeatMap, Layout, Plot, Scatter};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::datatype::{self, Header, Matrix, Record, Sequence, Vector};
use crate::error::{MiicError, MiicResult};
use crate::monitor::CorrStats;

//=====================================================================
// Velocity change time series of one channel combination.
//=====================================================================

/// Quantity held in [`DV::value`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ValueType {
    #[default]
    Stretch,
    Shift,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DvMethod {
    #[default]
    SingleRef,
    MultiRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DV {
    /// Maximum similarity of every correlation function.
    pub corr: Array1<f64>,
    /// Stretch (or shift) of the best match.
    pub value: Array1<f64>,
    /// Similarity, shape (correlation functions, second axis).
    pub sim_mat: Array2<f64>,
    /// Tested stretches (or shifts).
    pub second_axis: Array1<f64>,
    pub stats: CorrStats,
    pub value_type: ValueType,
    pub method: DvMethod,
}

impl DV {
    /// Relative velocity change in percent. A positive stretch of the
    /// coda corresponds to a velocity decrease.
    pub fn dv_percent(&self) -> Array1<f64> {
        match self.value_type {
            ValueType::Stretch => self.value.mapv(|v| -v * 100.0),
            ValueType::Shift => self.value.clone(),
        }
    }

    pub fn to_records(&self) -> MiicResult<BTreeMap<String, Record>> {
        let rows = self.stats.corr_start.len();
        if self.corr.len() != rows || self.value.len() != rows || self.sim_mat.nrows() != rows {
            return Err(MiicError::shape(&[rows], &[self.corr.len(), self.value.len(), self.sim_mat.nrows()]));
        }
        let times = self.stats.corr_start.clone();
        let corr = Sequence::new(
            Header::dimensionless("correlation").with_description(self.stats.id()),
            times.clone(),
            self.corr.clone(),
        )?;
        let value = Sequence::new(
            Header::dimensionless(self.value_type.to_string()).with_description(self.method.to_string()),
            times,
            self.value.clone(),
        )?;
        let second_axis = Vector::new(Header::dimensionless(self.value_type.to_string()), self.second_axis.clone());
        let sim_mat = Matrix::new(
            Header::dimensionless("similarity"),
            Header::dimensionless("time"),
            Header::dimensionless(self.value_type.to_string()),
            self.sim_mat.clone(),
        );

        let mut records = self.stats.to_records("stats/")?;
        records.insert("corr".into(), corr.into());
        records.insert("value".into(), value.into());
        records.insert("second_axis".into(), second_axis.into());
        records.insert("sim_mat".into(), sim_mat.into());
        Ok(records)
    }

    pub fn from_records(records: &BTreeMap<String, Record>) -> Result<Self> {
        let sequence = |key: &str| {
            records
                .get(key)
                .and_then(Record::as_sequence)
                .ok_or_else(|| anyhow!("missing sequence '{}'", key))
        };
        let corr = sequence("corr")?;
        let value = sequence("value")?;
        let sim_mat = records
            .get("sim_mat")
            .and_then(Record::as_matrix)
            .ok_or_else(|| anyhow!("missing matrix 'sim_mat'"))?;
        let second_axis = records
            .get("second_axis")
            .and_then(Record::as_vector)
            .ok_or_else(|| anyhow!("missing vector 'second_axis'"))?;

        let value_type = value.meta.name.parse::<ValueType>().with_context(|| format!("Unknown value type '{}'", value.meta.name))?;
        let method = value.meta.description.parse::<DvMethod>().with_context(|| format!("Unknown method '{}'", value.meta.description))?;
        Ok(Self {
            corr: corr.data.clone(),
            value: value.data.clone(),
            sim_mat: sim_mat.data.clone(),
            second_axis: second_axis.data.clone(),
            stats: CorrStats::from_records(records, "stats/")?,
            value_type,
            method,
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let records = self.to_records().with_context(|| format!("Cannot store velocity change of {}", self.stats.id()))?;
        datatype::save(path, &records)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let records = datatype::load(path)?;
        Self::from_records(&records).with_context(|| format!("{} holds no velocity change", path.display()))
    }
}

/// Layout of [`plot_dv`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlotStyle {
    /// Velocity change, similarity matrix and correlation in three panels.
    #[default]
    Technical,
    /// Velocity change only, coloured by the correlation coefficient.
    #[strum(to_string = "fancy", serialize = "publication")]
    #[serde(alias = "publication")]
    Fancy,
}

/// Write an interactive html page of the velocity change in the given
/// `style`.
pub fn plot_dv<P: AsRef<Path>>(dv: &DV, path: P, style: PlotStyle) -> Result<()> {
    let plot = match style {
        PlotStyle::Technical => technical_plot(dv),
        PlotStyle::Fancy => fancy_plot(dv),
    };
    let path = path.as_ref();
    fs::write(path, plot.to_html()).with_context(|| format!("Cannot write plot to {}", path.display()))
}

fn y_title(dv: &DV) -> &'static str {
    match dv.value_type {
        ValueType::Stretch => "dv/v [%]",
        ValueType::Shift => "shift",
    }
}

fn technical_plot(dv: &DV) -> Plot {
    let times: Vec<String> = dv.stats.corr_start.iter().map(|t| t.to_rfc3339()).collect();
    let labels: Vec<String> = dv.corr.iter().map(|c| format!("corr = {:.3}", c)).collect();
    let dv_trace = Scatter::new(times.clone(), dv.dv_percent().to_vec())
        .mode(Mode::Markers)
        .name("dv/v")
        .text_array(labels);

    let second_axis = match dv.value_type {
        ValueType::Stretch => dv.second_axis.mapv(|v| -v * 100.0).to_vec(),
        ValueType::Shift => dv.second_axis.to_vec(),
    };
    // plotly expects z[y][x]
    let z: Vec<Vec<f64>> = dv.sim_mat.t().outer_iter().map(|row| row.to_vec()).collect();
    let heatmap = HeatMap::new(times.clone(), second_axis, z).x_axis("x2").y_axis("y2").name("similarity");

    let corr_trace = Scatter::new(times, dv.corr.to_vec())
        .mode(Mode::Markers)
        .name("correlation")
        .x_axis("x3")
        .y_axis("y3");

    let layout = Layout::new()
        .title(Title::with_text(&dv.stats.id()))
        .x_axis(PlotAxis::new().domain(&[0.0, 1.0]).anchor("y"))
        .y_axis(PlotAxis::new().domain(&[0.7, 1.0]).title(Title::with_text(y_title(dv))))
        .x_axis2(PlotAxis::new().domain(&[0.0, 1.0]).anchor("y2"))
        .y_axis2(PlotAxis::new().domain(&[0.3, 0.65]).title(Title::with_text(y_title(dv))))
        .x_axis3(PlotAxis::new().domain(&[0.0, 1.0]).anchor("y3"))
        .y_axis3(PlotAxis::new().domain(&[0.0, 0.25]).title(Title::with_text("correlation")));

    let mut plot = Plot::new();
    plot.add_trace(dv_trace);
    plot.add_trace(heatmap);
    plot.add_trace(corr_trace);
    plot.set_layout(layout);
    plot
}

// Estimates without a correlation value are left out
fn fancy_plot(dv: &DV) -> Plot {
    let percent = dv.dv_percent();
    let (mut times, mut values, mut corr) = (Vec::new(), Vec::new(), Vec::new());
    for ((start, value), c) in dv.stats.corr_start.iter().zip(percent.iter()).zip(dv.corr.iter()) {
        if c.is_nan() {
            continue;
        }
        times.push(start.to_rfc3339());
        values.push(*value);
        corr.push(*c);
    }

    let marker = Marker::new()
        .size(8)
        .color_array(corr)
        .color_scale(ColorScale::Palette(ColorScalePalette::Viridis))
        .color_bar(ColorBar::new().title(Title::with_text("Correlation coefficient")));
    let trace = Scatter::new(times, values).mode(Mode::Markers).name("dv/v").marker(marker);

    let layout = Layout::new()
        .title(Title::with_text(&dv.stats.id()))
        .show_legend(false)
        .x_axis(PlotAxis::new().tick_format("%d %b %y"))
        .y_axis(PlotAxis::new().show_grid(true).title(Title::with_text(y_title(dv))));

    let mut plot = Plot::new();
    plot.add_trace(trace);
    plot.set_layout(layout);
    plot
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, TimeZone, Utc};
    use ndarray::Array;
    use tempfile::tempdir;

    fn dv() -> DV {
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let corr_start: Vec<_> = (0..5).map(|i| start + Duration::days(i)).collect();
        let stats = CorrStats {
            network: "GR".into(),
            station: "GRA1".into(),
            channel: "HHZ-HHZ".into(),
            start_lag: 0.0,
            sampling_rate: 10.0,
            npts: 201,
            corr_end: corr_start.iter().map(|t| *t + Duration::days(1)).collect(),
            corr_start,
            geometry: None,
        };
        DV {
            corr: Array::linspace(0.9, 0.5, 5),
            value: Array::linspace(0.0, 0.02, 5),
            sim_mat: Array2::from_shape_fn((5, 11), |(i, j)| (i + j) as f64 / 20.0),
            second_axis: Array::linspace(-0.05, 0.05, 11),
            stats,
            value_type: ValueType::Stretch,
            method: DvMethod::SingleRef,
        }
    }

    #[test]
    fn test_dv_percent() {
        let dv = dv();
        let percent = dv.dv_percent();
        assert_eq!(percent[0], 0.0);
        approx::assert_abs_diff_eq!(percent[4], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("DV-GR.GRA1.HHZ-HHZ.miic");
        let dv = dv();
        dv.save(&path).unwrap();
        assert_eq!(DV::load(&path).unwrap(), dv);

        let mut records = dv.to_records().unwrap();
        records.remove("sim_mat");
        assert!(DV::from_records(&records).is_err());
    }

    #[test]
    fn test_plot_dv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dv.html");
        plot_dv(&dv(), &path, PlotStyle::Technical).unwrap();
        let html = fs::read_to_string(&path).unwrap();
        assert!(html.contains("GR.GRA1.HHZ-HHZ"));
        assert!(html.contains("heatmap"));
        assert!(html.contains("correlation"));
    }

    #[test]
    fn test_plot_dv_fancy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dv.html");
        let mut dv = dv();
        dv.corr[2] = f64::NAN;
        plot_dv(&dv, &path, PlotStyle::Fancy).unwrap();
        let html = fs::read_to_string(&path).unwrap();
        assert!(html.contains("GR.GRA1.HHZ-HHZ"));
        assert!(html.contains("Correlation coefficient"));
        assert!(!html.contains("heatmap"));
        assert!(!html.contains("2021-01-03T00:00:00"));

        assert_eq!("publication".parse::<PlotStyle>().unwrap(), PlotStyle::Fancy);
        assert_eq!(PlotStyle::Fancy.to_string(), "fancy");
        assert_eq!(PlotStyle::default(), PlotStyle::Technical);
        assert!("poster".parse::<PlotStyle>().is_err());
    }

    #[test]
    fn test_enum_names() {
        assert_eq!(ValueType::Stretch.to_string(), "stretch");
        assert_eq!("multi_ref".parse::<DvMethod>().unwrap(), DvMethod::MultiRef);
    }
}
