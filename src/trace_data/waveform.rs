use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info, warn};

use crate::trace_data::mseed::{read_bytes, Encoding};
use crate::trace_data::sds::{self, FileLayout, SeedId};
use crate::trace_data::{Inventory, Stream};

//=====================================================================
// Waveform access. `FsClient` reads local archives only, `StoreClient`
// adds a remote source whose data is cached in the local SDS tree.
//=====================================================================

#[derive(Debug, Clone)]
pub struct FsClient {
    pub base_dir: PathBuf,
    pub layout: FileLayout,
}

impl FsClient {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self { base_dir: base_dir.as_ref().to_path_buf(), layout: FileLayout::Sds }
    }

    pub fn with_layout(mut self, layout: FileLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn get_waveforms(
        &self,
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<Stream> {
        let ids = [SeedId::new(network, station, location, channel)];
        sds::read_from_filesystem(&self.base_dir, &ids, start, end, &self.layout, true)
    }
}

/// A source of waveforms and station metadata outside the local archive.
pub trait RemoteClient: Send + Sync {
    fn get_waveforms<'a>(&'a self, id: &'a SeedId, start: DateTime<Utc>, end: DateTime<Utc>) -> BoxFuture<'a, Result<Stream>>;
    fn get_stations<'a>(&'a self, network: &'a str, station: &'a str) -> BoxFuture<'a, Result<Inventory>>;
}

/// Client for FDSN web services (dataselect and station).
#[derive(Debug, Clone)]
pub struct FdsnClient {
    base_url: String,
    http: reqwest::Client,
}

impl FdsnClient {
    pub fn new(base_url: &str) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_string(), http: reqwest::Client::new() }
    }

    fn time_param(time: &DateTime<Utc>) -> String {
        time.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }
}

impl RemoteClient for FdsnClient {
    fn get_waveforms<'a>(&'a self, id: &'a SeedId, start: DateTime<Utc>, end: DateTime<Utc>) -> BoxFuture<'a, Result<Stream>> {
        async move {
            let url = format!("{}/fdsnws/dataselect/1/query", self.base_url);
            let location = if id.location.is_empty() { "--" } else { id.location.as_str() };
            let (start_param, end_param) = (Self::time_param(&start), Self::time_param(&end));
            let response = self
                .http
                .get(&url)
                .query(&[
                    ("net", id.network.as_str()),
                    ("sta", id.station.as_str()),
                    ("loc", location),
                    ("cha", id.channel.as_str()),
                    ("start", start_param.as_str()),
                    ("end", end_param.as_str()),
                ])
                .send()
                .await
                .with_context(|| format!("Request for {} to {} failed", id, url))?;
            if response.status() == reqwest::StatusCode::NO_CONTENT {
                debug!("No remote data for {} between {} and {}", id, start, end);
                return Ok(Stream::new());
            }
            let bytes = response
                .error_for_status()
                .with_context(|| format!("Service at {} refused request for {}", url, id))?
                .bytes()
                .await?;
            Ok(read_bytes(&bytes).with_context(|| format!("Invalid miniSEED for {} from {}", id, url))?)
        }
        .boxed()
    }

    fn get_stations<'a>(&'a self, network: &'a str, station: &'a str) -> BoxFuture<'a, Result<Inventory>> {
        async move {
            let url = format!("{}/fdsnws/station/1/query", self.base_url);
            let response = self
                .http
                .get(&url)
                .query(&[("net", network), ("sta", station), ("level", "station"), ("format", "text")])
                .send()
                .await
                .with_context(|| format!("Station request for {}.{} to {} failed", network, station, url))?;
            if response.status() == reqwest::StatusCode::NO_CONTENT {
                return Ok(Inventory::default());
            }
            let text = response.error_for_status()?.text().await?;
            Inventory::from_fdsn_text(&text)
        }
        .boxed()
    }
}

// Days in [start, end] without a local file for `id`
fn missing_days(sds_root: &Path, id: &SeedId, start: &DateTime<Utc>, end: &DateTime<Utc>) -> Vec<NaiveDate> {
    start
        .date_naive()
        .iter_days()
        .take_while(|day| *day <= end.date_naive())
        .filter(|day| !sds::has_day_file(sds_root, id, *day))
        .collect()
}

/// Local SDS archive with an optional remote fallback. Days without local
/// data are downloaded completely and, unless `read_only`, stored.
#[derive(Clone)]
pub struct StoreClient {
    pub sds_root: PathBuf,
    remote: Option<Arc<dyn RemoteClient>>,
    pub read_only: bool,
}

impl StoreClient {
    pub fn new<P: AsRef<Path>>(sds_root: P, remote: Option<Arc<dyn RemoteClient>>, read_only: bool) -> Self {
        Self { sds_root: sds_root.as_ref().to_path_buf(), remote, read_only }
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.sds_root.join("inventory").join("inventory.txt")
    }

    pub async fn get_waveforms(
        &self,
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<Stream> {
        let id = SeedId::new(network, station, location, channel);
        let (start, end) = (*start, *end);

        // Local reads and the missing day scan touch the disk
        let local = {
            let (root, id, with_remote) = (self.sds_root.clone(), id.clone(), self.remote.is_some());
            tokio::task::spawn_blocking(move || -> Result<(Stream, Vec<NaiveDate>)> {
                let stream = sds::read_from_filesystem(&root, &[id.clone()], &start, &end, &FileLayout::Sds, true)?;
                let missing = if with_remote { missing_days(&root, &id, &start, &end) } else { Vec::new() };
                Ok((stream, missing))
            })
        };
        let (mut stream, missing) = local.await.with_context(|| format!("Local read of {} panicked", id))??;
        let Some(remote) = &self.remote else {
            return Ok(stream);
        };
        if missing.is_empty() {
            return Ok(stream);
        }

        info!("Downloading {} day(s) of {} from remote", missing.len(), id);
        for day in missing {
            let day_start = day.and_time(NaiveTime::MIN).and_utc();
            let downloaded = remote
                .get_waveforms(&id, day_start, day_start + Duration::days(1))
                .await
                .with_context(|| format!("Failed to download {} for {}", id, day))?;
            if downloaded.is_empty() {
                debug!("Remote holds no data for {} on {}", id, day);
                continue;
            }
            if !self.read_only {
                let (root, to_store) = (self.sds_root.clone(), downloaded.clone());
                tokio::task::spawn_blocking(move || sds::write_to_sds(&root, &to_store, Encoding::Float64))
                    .await
                    .with_context(|| format!("Storing {} for {} panicked", id, day))??;
            }
            stream.extend(downloaded);
        }
        stream.merge();
        stream.trim(&start, &end);
        Ok(stream)
    }

    /// Fetch several channels with at most `concurrency` requests in
    /// flight. Failed requests are logged and left out.
    pub async fn get_waveforms_bulk(
        &self,
        requests: &[(SeedId, DateTime<Utc>, DateTime<Utc>)],
        concurrency: usize,
    ) -> Stream {
        let streams: Vec<Stream> = futures::stream::iter(requests)
            .map(|(id, start, end)| async move {
                self.get_waveforms(&id.network, &id.station, &id.location, &id.channel, start, end)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Skipping {}: {:#}", id, e);
                        Stream::new()
                    })
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        let mut stream: Stream = streams.into_iter().flatten().collect();
        stream.sort();
        stream
    }

    pub fn read_inventory(&self) -> Result<Inventory> {
        let path = self.inventory_path();
        if !path.is_file() {
            return Ok(Inventory::default());
        }
        Inventory::read_file(path)
    }

    /// Merge `inventory` into the stored one.
    pub fn write_inventory(&self, inventory: &Inventory) -> Result<()> {
        let mut stored = self.read_inventory()?;
        stored.merge(inventory.clone());
        stored.write_file(self.inventory_path())
    }

    /// Stations from the local inventory, the remote is asked when none match.
    pub async fn get_stations(&self, network: &str, station: &str) -> Result<Inventory> {
        let local = self.read_inventory()?.select(network, station);
        if !local.is_empty() {
            return Ok(local);
        }
        let Some(remote) = &self.remote else {
            return Ok(local);
        };
        let fetched = remote.get_stations(network, station).await?;
        if !self.read_only && !fetched.is_empty() {
            self.write_inventory(&fetched)?;
        }
        Ok(fetched)
    }

    pub fn available_stations(&self, network: &str) -> Result<Vec<(String, String)>> {
        sds::available_stations(&self.sds_root, network)
    }

    pub fn available_times(&self, network: &str, station: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        sds::available_times(&self.sds_root, network, station)
    }
}
