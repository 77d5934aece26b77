use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use ndarray::{s, Array1};
use serde::{Deserialize, Serialize};

use crate::datatype::{Header, Series};
use crate::error::MiicResult;
use crate::utils::{seconds_to_duration, timestamp, utc_from_timestamp, wildcard_match};

//=====================================================================
// Metadata of a continuous, equidistantly sampled waveform.
//=====================================================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub starttime: DateTime<Utc>,
    pub sampling_rate: f64,
}

impl Stats {
    pub fn new(network: &str, station: &str, location: &str, channel: &str, starttime: DateTime<Utc>, sampling_rate: f64) -> Self {
        Self {
            network: network.to_string(),
            station: station.to_string(),
            location: location.to_string(),
            channel: channel.to_string(),
            starttime,
            sampling_rate,
        }
    }

    pub fn id(&self) -> String {
        format!("{}.{}.{}.{}", self.network, self.station, self.location, self.channel)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub stats: Stats,
    pub data: Array1<f64>,
}

impl Trace {
    pub fn new(stats: Stats, data: Array1<f64>) -> Self {
        Self { stats, data }
    }

    pub fn id(&self) -> String {
        self.stats.id()
    }

    pub fn npts(&self) -> usize {
        self.data.len()
    }

    pub fn delta(&self) -> f64 {
        1.0 / self.stats.sampling_rate
    }

    /// Time of the last sample.
    pub fn endtime(&self) -> DateTime<Utc> {
        self.time_of(self.npts().saturating_sub(1))
    }

    pub fn time_of(&self, index: usize) -> DateTime<Utc> {
        self.stats.starttime + seconds_to_duration(index as f64 * self.delta())
    }

    pub fn times(&self) -> Vec<DateTime<Utc>> {
        (0..self.npts()).map(|i| self.time_of(i)).collect()
    }

    // Fractional sample index of `time`
    fn sample_position(&self, time: &DateTime<Utc>) -> f64 {
        (timestamp(time) - timestamp(&self.stats.starttime)) * self.stats.sampling_rate
    }

    /// Cut to the samples closest to `[start, end]`. Trimming outside the
    /// data leaves an empty trace.
    pub fn trim(&mut self, start: &DateTime<Utc>, end: &DateTime<Utc>) {
        let npts = self.npts() as i64;
        let first = (self.sample_position(start).round() as i64).max(0);
        let last = (self.sample_position(end).round() as i64).min(npts - 1);
        if npts == 0 || last < first {
            self.stats.starttime = *start;
            self.data = Array1::zeros(0);
            return;
        }
        self.stats.starttime = self.time_of(first as usize);
        self.data = self.data.slice(s![first as usize..=last as usize]).to_owned();
    }

    /// Contiguous pieces of the trace without NaN samples.
    pub fn split(&self) -> Vec<Trace> {
        let mut pieces = Vec::new();
        let mut run_start: Option<usize> = None;
        for (i, value) in self.data.iter().enumerate() {
            match (value.is_nan(), run_start) {
                (false, None) => run_start = Some(i),
                (true, Some(start)) => {
                    pieces.push(self.slice(start, i));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            pieces.push(self.slice(start, self.npts()));
        }
        pieces
    }

    pub(crate) fn slice(&self, start: usize, end: usize) -> Trace {
        let mut stats = self.stats.clone();
        stats.starttime = self.time_of(start);
        Trace { stats, data: self.data.slice(s![start..end]).to_owned() }
    }

    pub fn to_series(&self, meta: Header) -> MiicResult<Series> {
        Series::new(meta, self.stats.starttime, seconds_to_duration(self.delta()), self.data.clone())
    }
}

//=====================================================================
// Collection of traces, possibly from several channels.
//=====================================================================
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stream ( pub Vec<Trace> );

impl Deref for Stream {
    type Target = Vec<Trace>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Stream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Trace>> for Stream {
    fn from(traces: Vec<Trace>) -> Self {
        Self(traces)
    }
}

impl IntoIterator for Stream {
    type Item = Trace;
    type IntoIter = std::vec::IntoIter<Trace>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Trace> for Stream {
    fn from_iter<I: IntoIterator<Item = Trace>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Stream {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Traces matching the given codes, `*` and `?` act as wildcards.
    pub fn select(&self, network: &str, station: &str, location: &str, channel: &str) -> Stream {
        self.iter()
            .filter(|tr| {
                wildcard_match(network, &tr.stats.network)
                    && wildcard_match(station, &tr.stats.station)
                    && wildcard_match(location, &tr.stats.location)
                    && wildcard_match(channel, &tr.stats.channel)
            })
            .cloned()
            .collect()
    }

    /// Sort by id, then by start time.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.id().cmp(&b.id()).then(a.stats.starttime.cmp(&b.stats.starttime)));
    }

    /// Combine traces of the same id and sampling rate into one trace each.
    /// Overlapping samples keep the value of the earlier trace, gaps are NaN.
    pub fn merge(&mut self) {
        let mut groups: BTreeMap<(String, u64), Vec<Trace>> = BTreeMap::new();
        for trace in self.0.drain(..) {
            if trace.npts() == 0 {
                continue;
            }
            groups.entry((trace.id(), trace.stats.sampling_rate.to_bits())).or_default().push(trace);
        }

        self.0 = groups.into_values().map(merge_group).collect();
        self.sort();
    }

    /// Split every trace at its NaN gaps.
    pub fn split(&mut self) {
        self.0 = self.0.iter().flat_map(Trace::split).collect();
    }

    /// Trim all traces, dropping those left without samples.
    pub fn trim(&mut self, start: &DateTime<Utc>, end: &DateTime<Utc>) {
        for trace in self.0.iter_mut() {
            trace.trim(start, end);
        }
        self.0.retain(|tr| tr.npts() > 0);
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.iter().map(Trace::id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

fn merge_group(mut traces: Vec<Trace>) -> Trace {
    traces.sort_by(|a, b| a.stats.starttime.cmp(&b.stats.starttime));
    if traces.len() == 1 {
        return traces.remove(0);
    }
    let sampling_rate = traces[0].stats.sampling_rate;
    let start = timestamp(&traces[0].stats.starttime);
    let end = traces.iter().map(|tr| timestamp(&tr.endtime())).fold(f64::MIN, f64::max);
    let npts = ((end - start) * sampling_rate).round() as usize + 1;

    let mut data = Array1::from_elem(npts, f64::NAN);
    for trace in &traces {
        let offset = ((timestamp(&trace.stats.starttime) - start) * sampling_rate).round() as usize;
        for (i, &value) in trace.data.iter().enumerate() {
            if let Some(slot) = data.get_mut(offset + i) {
                if slot.is_nan() {
                    *slot = value;
                }
            }
        }
    }

    let mut stats = traces[0].stats.clone();
    stats.starttime = utc_from_timestamp(start);
    Trace { stats, data }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, TimeZone};
    use ndarray::array;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()
    }

    fn trace(channel: &str, start: DateTime<Utc>, data: Array1<f64>) -> Trace {
        Trace::new(Stats::new("GR", "GRA1", "", channel, start, 1.0), data)
    }

    #[test]
    fn test_trace_times() {
        let tr = trace("BHZ", t0(), array![1.0, 2.0, 3.0]);
        assert_eq!(tr.id(), "GR.GRA1..BHZ");
        assert_eq!(tr.endtime(), t0() + Duration::seconds(2));
        assert_eq!(tr.times()[1], t0() + Duration::seconds(1));
    }

    #[test]
    fn test_series_of_fractional_rate() {
        let mut tr = trace("BHZ", t0(), Array1::zeros(4));
        tr.stats.sampling_rate = 3.0;
        let series = tr.to_series(Header::default()).unwrap();
        assert_eq!(series.delta, Duration::nanoseconds(333_333_333));
        assert_eq!(tr.time_of(3), t0() + Duration::seconds(1));
    }

    #[test]
    fn test_trim() {
        let mut tr = trace("BHZ", t0(), Array1::from_iter((0..10).map(f64::from)));
        tr.trim(&(t0() + Duration::milliseconds(2400)), &(t0() + Duration::seconds(5)));
        assert_eq!(tr.data, array![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(tr.stats.starttime, t0() + Duration::seconds(2));

        let mut outside = trace("BHZ", t0(), array![1.0, 2.0]);
        outside.trim(&(t0() + Duration::seconds(10)), &(t0() + Duration::seconds(20)));
        assert_eq!(outside.npts(), 0);
    }

    #[test]
    fn test_select_with_wildcards() {
        let st = Stream::from(vec![
            trace("BHZ", t0(), array![1.0]),
            trace("BHN", t0(), array![1.0]),
            trace("HHZ", t0(), array![1.0]),
        ]);
        assert_eq!(st.select("GR", "*", "*", "BH?").len(), 2);
        assert_eq!(st.select("*", "*", "*", "?HZ").len(), 2);
        assert_eq!(st.select("XX", "*", "*", "*").len(), 0);
    }

    #[test]
    fn test_merge_fills_gaps_and_keeps_first_on_overlap() {
        let mut st = Stream::from(vec![
            trace("BHZ", t0() + Duration::seconds(5), array![50.0, 60.0]),
            trace("BHZ", t0(), array![0.0, 1.0, 2.0]),
            trace("BHZ", t0() + Duration::seconds(2), array![20.0, 3.0]),
            trace("BHN", t0(), array![7.0]),
        ]);
        st.merge();
        assert_eq!(st.len(), 2);
        let selected = st.select("*", "*", "*", "BHZ");
        let z = &selected[0];
        assert_eq!(z.stats.starttime, t0());
        assert_eq!(z.npts(), 7);
        assert_eq!(z.data.slice(s![..4]), array![0.0, 1.0, 2.0, 3.0]);
        assert!(z.data[4].is_nan());
        assert_eq!(z.data.slice(s![5..]), array![50.0, 60.0]);

        let mut parts = st.select("*", "*", "*", "BHZ");
        parts.split();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].stats.starttime, t0() + Duration::seconds(5));
    }

    #[test]
    fn test_stream_trim_drops_empty() {
        let mut st = Stream::from(vec![
            trace("BHZ", t0(), array![1.0, 2.0, 3.0]),
            trace("BHN", t0() + Duration::seconds(100), array![1.0]),
        ]);
        st.trim(&t0(), &(t0() + Duration::seconds(1)));
        assert_eq!(st.len(), 1);
        assert_eq!(st[0].data, array![1.0, 2.0]);
    }
}
