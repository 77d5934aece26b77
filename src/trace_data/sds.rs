use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{MiicError, MiicResult};
use crate::trace_data::mseed::{self, Encoding};
use crate::trace_data::{Stats, Stream, Trace};
use crate::utils::{has_wildcard, timestamp, wildcard_match};

//=====================================================================
// SeisComP Data Structure archives: one miniSEED file per channel and
// day, stored as
//     root/YYYY/NET/STA/CHA.D/NET.STA.LOC.CHA.D.YYYY.DDD
//=====================================================================

/// `NET.STA.LOC.CHA` code of a channel, every field may hold wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeedId {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl SeedId {
    pub fn new(network: &str, station: &str, location: &str, channel: &str) -> Self {
        Self {
            network: network.to_string(),
            station: station.to_string(),
            location: location.to_string(),
            channel: channel.to_string(),
        }
    }

    pub fn matches(&self, stats: &Stats) -> bool {
        wildcard_match(&self.network, &stats.network)
            && wildcard_match(&self.station, &stats.station)
            && wildcard_match(&self.location, &stats.location)
            && wildcard_match(&self.channel, &stats.channel)
    }
}

impl From<&Stats> for SeedId {
    fn from(stats: &Stats) -> Self {
        SeedId::new(&stats.network, &stats.station, &stats.location, &stats.channel)
    }
}

impl fmt::Display for SeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.network, self.station, self.location, self.channel)
    }
}

impl FromStr for SeedId {
    type Err = MiicError;

    fn from_str(s: &str) -> MiicResult<Self> {
        match s.split('.').collect::<Vec<_>>()[..] {
            [network, station, location, channel] => Ok(SeedId::new(network, station, location, channel)),
            _ => Err(MiicError::invalid(format!("'{}' is not a NET.STA.LOC.CHA code", s))),
        }
    }
}

/// How daily files are laid out below the archive root. A pattern uses
/// strftime fields for the day and `{net}`, `{sta}`, `{loc}`, `{cha}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileLayout {
    #[default]
    Sds,
    Pattern(String),
}

impl FileLayout {
    pub fn path(&self, root: &Path, id: &SeedId, day: NaiveDate) -> MiicResult<PathBuf> {
        match self {
            FileLayout::Sds => Ok(sds_path(root, &id.network, &id.station, &id.location, &id.channel, day)),
            FileLayout::Pattern(pattern) => {
                let filled = pattern
                    .replace("{net}", &id.network)
                    .replace("{sta}", &id.station)
                    .replace("{loc}", &id.location)
                    .replace("{cha}", &id.channel);
                let mut relative = String::new();
                write!(relative, "{}", day.format(&filled))
                    .map_err(|_| MiicError::invalid(format!("invalid file pattern '{}'", pattern)))?;
                Ok(root.join(relative))
            }
        }
    }
}

pub fn sds_path(root: &Path, network: &str, station: &str, location: &str, channel: &str, day: NaiveDate) -> PathBuf {
    root.join(format!("{:04}", day.year()))
        .join(network)
        .join(station)
        .join(format!("{}.D", channel))
        .join(format!("{}.{}.{}.{}.D.{:04}.{:03}", network, station, location, channel, day.year(), day.ordinal()))
}

// Channel and day of an SDS file name
pub(crate) fn parse_sds_filename(name: &str) -> Option<(SeedId, NaiveDate)> {
    match name.split('.').collect::<Vec<_>>()[..] {
        [network, station, location, channel, "D", year, day] => {
            let date = NaiveDate::from_yo_opt(year.parse().ok()?, day.parse().ok()?)?;
            Some((SeedId::new(network, station, location, channel), date))
        }
        _ => None,
    }
}

// Files matching a path whose components may contain wildcards
fn expand_wildcards(pattern: &Path) -> Vec<PathBuf> {
    let components: Vec<String> = pattern
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let fixed = components.iter().take_while(|c| !has_wildcard(c)).count();
    if fixed == components.len() {
        return if pattern.is_file() { vec![pattern.to_path_buf()] } else { Vec::new() };
    }
    let mut root: PathBuf = components[..fixed].iter().collect();
    if root.as_os_str().is_empty() {
        root = PathBuf::from(".");
    }
    let rest = &components[fixed..];

    WalkDir::new(&root)
        .min_depth(rest.len())
        .max_depth(rest.len())
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry.path().strip_prefix(&root).is_ok_and(|relative| {
                relative
                    .components()
                    .zip(rest)
                    .all(|(c, p)| wildcard_match(p, &c.as_os_str().to_string_lossy()))
            })
        })
        .map(|entry| entry.into_path())
        .collect()
}

// Whether the archive holds a file of `id` (wildcards allowed) on `day`
pub(crate) fn has_day_file(root: &Path, id: &SeedId, day: NaiveDate) -> bool {
    let path = sds_path(root, &id.network, &id.station, &id.location, &id.channel, day);
    if has_wildcard(&path.to_string_lossy()) {
        !expand_wildcards(&path).is_empty()
    } else {
        path.is_file()
    }
}

/// Read every channel matching `ids` between `start` and `end`. The day
/// before `start` is read as well because its file may hold records
/// reaching past midnight. Traces of one channel are merged, gaps are
/// NaN. An empty stream is returned when nothing was found.
pub fn read_from_filesystem(
    base_dir: &Path,
    ids: &[SeedId],
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
    layout: &FileLayout,
    trim: bool,
) -> Result<Stream> {
    if end < start {
        return Err(MiicError::invalid(format!("end {} before start {}", end, start)).into());
    }
    let first_day = start.date_naive().pred_opt().unwrap_or(start.date_naive());
    let last_day = end.date_naive();

    let mut paths = BTreeSet::new();
    for id in ids {
        for day in first_day.iter_days().take_while(|day| *day <= last_day) {
            let path = layout.path(base_dir, id, day)?;
            if has_wildcard(&path.to_string_lossy()) {
                paths.extend(expand_wildcards(&path));
            } else if path.is_file() {
                paths.insert(path);
            } else {
                debug!("No data file {}", path.display());
            }
        }
    }

    let streams: Vec<Stream> = paths
        .par_iter()
        .map(|path| {
            mseed::read_file(path).unwrap_or_else(|e| {
                warn!("Skipping unreadable file {}: {:#}", path.display(), e);
                Stream::new()
            })
        })
        .collect();

    let mut stream: Stream = streams
        .into_iter()
        .flatten()
        .filter(|tr| ids.iter().any(|id| id.matches(&tr.stats)))
        .collect();
    stream.merge();
    if trim {
        stream.trim(start, end);
    }
    debug!("Read {} traces from {} files below {}", stream.len(), paths.len(), base_dir.display());
    Ok(stream)
}

// Pieces of a trace falling onto each UTC day
fn day_pieces(trace: &Trace) -> Vec<(NaiveDate, Trace)> {
    let mut pieces = Vec::new();
    if trace.npts() == 0 {
        return pieces;
    }
    let start = timestamp(&trace.stats.starttime);
    let position = |time: &DateTime<Utc>| ((timestamp(time) - start) * trace.stats.sampling_rate - 1e-6).ceil();
    let npts = trace.npts() as f64;

    let mut day = trace.stats.starttime.date_naive();
    let last_day = trace.endtime().date_naive();
    while day <= last_day {
        let day_start = day.and_time(NaiveTime::MIN).and_utc();
        let first = position(&day_start).clamp(0.0, npts) as usize;
        let stop = position(&(day_start + Duration::days(1))).clamp(0.0, npts) as usize;
        if stop > first {
            pieces.push((day, trace.slice(first, stop)));
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    pieces
}

/// Write a stream into daily SDS files, merging with files already present.
pub fn write_to_sds(root: &Path, stream: &Stream, encoding: Encoding) -> Result<()> {
    let mut per_file: BTreeMap<PathBuf, Vec<Trace>> = BTreeMap::new();
    for trace in stream.iter() {
        for (day, piece) in day_pieces(trace) {
            let stats = &piece.stats;
            let path = sds_path(root, &stats.network, &stats.station, &stats.location, &stats.channel, day);
            per_file.entry(path).or_default().push(piece);
        }
    }

    per_file.into_par_iter().try_for_each(|(path, pieces)| -> Result<()> {
        let mut day_stream = Stream::from(pieces);
        if path.is_file() {
            let existing = mseed::read_file(&path)
                .with_context(|| format!("Failed to read existing SDS file {}", path.display()))?;
            day_stream.extend(existing);
        }
        day_stream.merge();
        mseed::write_file(&path, &day_stream, encoding)
    })
}

// Relative components of entries `depth` levels below `root`
fn entries_at_depth(root: &Path, depth: usize, files: bool) -> Vec<Vec<String>> {
    WalkDir::new(root)
        .min_depth(depth)
        .max_depth(depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() == files)
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(root).ok()?;
            Some(relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect())
        })
        .collect()
}

fn is_year(name: &str) -> bool {
    name.len() == 4 && name.chars().all(|c| c.is_ascii_digit())
}

/// `(network, station)` pairs with data in the archive.
pub fn available_stations(root: &Path, network: &str) -> Result<Vec<(String, String)>> {
    if !root.is_dir() {
        return Err(MiicError::NoData(format!("no SDS archive at {}", root.display()))).context("Listing stations");
    }
    let stations: BTreeSet<(String, String)> = entries_at_depth(root, 3, false)
        .into_iter()
        .filter_map(|parts| match &parts[..] {
            [year, net, sta] if is_year(year) && wildcard_match(network, net) => Some((net.clone(), sta.clone())),
            _ => None,
        })
        .collect();
    Ok(stations.into_iter().collect())
}

/// Start of the earliest and end of the latest day with data for a station.
pub fn available_times(root: &Path, network: &str, station: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let days: Vec<NaiveDate> = entries_at_depth(root, 5, true)
        .into_iter()
        .filter_map(|parts| match &parts[..] {
            [year, net, sta, _, file] if is_year(year) && net == network && sta == station => {
                parse_sds_filename(file).map(|(_, day)| day)
            }
            _ => None,
        })
        .collect();

    match (days.iter().min(), days.iter().max()) {
        (Some(first), Some(last)) => Ok((
            first.and_time(NaiveTime::MIN).and_utc(),
            last.and_time(NaiveTime::MIN).and_utc() + Duration::days(1),
        )),
        _ => Err(MiicError::NoData(format!("{}.{} in {}", network, station, root.display())).into()),
    }
}
