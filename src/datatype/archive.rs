use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use chrono::{DateTime, Duration, Utc};
use flate2::{read::DeflateDecoder, write::DeflateEncoder};
use memmap2::MmapOptions;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use tracing::debug;

use crate::datatype::{Field, Header, Matrix, Scalar, Sequence, Series, Vector};

//=====================================================================
// Archive format for named quantity containers. Metadata lives in a
// JSON index at the front of the file so that loading only needs to
// touch the payload bytes of the entries through a memory map.
//=====================================================================

// The format as follows (from start of file to end):
//    - Magic
//        - 8 ASCII bytes `MIICARC1`
//    - Index length
//        - u64, little endian, number of bytes of the JSON index
//    - Index
//        - JSON array, one object per entry holding the entry name, the
//          container kind, its header(s), the data shape, the time axis
//          for series and sequences, and the offset/length/compression of
//          its payload. Offsets are relative to the end of the index.
//    - Payloads
//        - Samples of every entry in row-major order, written as little
//          endian f64 and optionally deflate compressed. Entries follow
//          each other without padding.
const MAGIC: &[u8; 8] = b"MIICARC1";
const PREAMBLE_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter)]
pub enum Compression {
    None,
    #[default]
    Deflate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter)]
pub enum RecordKind {
    Scalar,
    Vector,
    Matrix,
    Series,
    Sequence,
    Field,
}

//=====================================================================
// Any container that can be stored in an archive.
//=====================================================================
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Scalar(Scalar),
    Vector(Vector),
    Matrix(Matrix),
    Series(Series),
    Sequence(Sequence),
    Field(Field),
}

macro_rules! record_accessors {
    ($($variant:ident => $as_fn:ident),* $(,)?) => {
        impl Record {
            $(
                pub fn $as_fn(&self) -> Option<&$variant> {
                    match self {
                        Record::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            )*
        }

        $(
            impl From<$variant> for Record {
                fn from(inner: $variant) -> Self {
                    Record::$variant(inner)
                }
            }
        )*
    };
}

record_accessors! {
    Scalar => as_scalar,
    Vector => as_vector,
    Matrix => as_matrix,
    Series => as_series,
    Sequence => as_sequence,
    Field => as_field,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Scalar(_) => RecordKind::Scalar,
            Record::Vector(_) => RecordKind::Vector,
            Record::Matrix(_) => RecordKind::Matrix,
            Record::Series(_) => RecordKind::Series,
            Record::Sequence(_) => RecordKind::Sequence,
            Record::Field(_) => RecordKind::Field,
        }
    }

    pub fn meta(&self) -> &Header {
        match self {
            Record::Scalar(s) => &s.meta,
            Record::Vector(v) => &v.meta,
            Record::Matrix(m) => &m.meta,
            Record::Series(s) => &s.meta,
            Record::Sequence(s) => &s.meta,
            Record::Field(f) => &f.meta,
        }
    }

    // Split into index metadata (offsets still unset) and flat samples
    fn to_entry(&self, name: &str, compression: Compression) -> (IndexEntry, Vec<f64>) {
        let mut entry = IndexEntry {
            name: name.to_string(),
            kind: self.kind(),
            meta: self.meta().clone(),
            axes: Vec::new(),
            shape: Vec::new(),
            start: None,
            delta_ns: None,
            times: None,
            offset: 0,
            length: 0,
            compression,
        };
        let samples = match self {
            Record::Scalar(s) => vec![s.value],
            Record::Vector(v) => {
                entry.shape = vec![v.data.len()];
                v.data.to_vec()
            }
            Record::Matrix(m) => {
                entry.axes = vec![m.axis0.clone(), m.axis1.clone()];
                entry.shape = m.data.shape().to_vec();
                m.data.iter().copied().collect()
            }
            Record::Series(s) => {
                entry.shape = vec![s.data.len()];
                entry.start = Some(s.start);
                entry.delta_ns = s.delta.num_nanoseconds();
                s.data.to_vec()
            }
            Record::Sequence(s) => {
                entry.shape = vec![s.data.len()];
                entry.times = Some(s.times.clone());
                s.data.to_vec()
            }
            Record::Field(f) => {
                entry.axes = f.axes.clone();
                entry.shape = f.data.shape().to_vec();
                f.data.iter().copied().collect()
            }
        };
        (entry, samples)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    name: String,
    kind: RecordKind,
    meta: Header,
    #[serde(default)]
    axes: Vec<Header>,
    #[serde(default)]
    shape: Vec<usize>,
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    delta_ns: Option<i64>,
    #[serde(default)]
    times: Option<Vec<DateTime<Utc>>>,
    offset: u64,
    length: u64,
    compression: Compression,
}

impl IndexEntry {
    fn into_record(self, samples: Vec<f64>) -> Result<Record> {
        let expected = self.shape.iter().try_fold(1usize, |n, &len| n.checked_mul(len))
            .ok_or_else(|| anyhow!("shape {:?} of entry '{}' is too large", self.shape, self.name))?;
        let rank = match self.kind {
            RecordKind::Scalar => Some(0),
            RecordKind::Matrix => Some(2),
            RecordKind::Field => None,
            _ => Some(1),
        };
        if let Some(rank) = rank {
            ensure!(
                self.shape.len() == rank,
                "{} entry '{}' needs {} dimension(s), its shape is {:?}",
                self.kind, self.name, rank, self.shape
            );
        }
        ensure!(
            samples.len() == expected,
            "entry '{}' holds {} samples but its shape {:?} needs {}",
            self.name, samples.len(), self.shape, expected
        );
        let record = match self.kind {
            RecordKind::Scalar => Record::Scalar(Scalar::new(self.meta, samples[0])),
            RecordKind::Vector => Record::Vector(Vector::new(self.meta, Array1::from(samples))),
            RecordKind::Matrix => {
                let [axis0, axis1]: [Header; 2] = self.axes.try_into()
                    .map_err(|_| anyhow!("matrix entry '{}' needs two axis headers", self.name))?;
                let data = Array2::from_shape_vec((self.shape[0], self.shape[1]), samples)?;
                Record::Matrix(Matrix::new(self.meta, axis0, axis1, data))
            }
            RecordKind::Series => {
                let start = self.start.ok_or_else(|| anyhow!("series entry '{}' has no start time", self.name))?;
                let delta = self.delta_ns
                    .map(Duration::nanoseconds)
                    .ok_or_else(|| anyhow!("series entry '{}' has no sampling interval", self.name))?;
                Record::Series(Series::new(self.meta, start, delta, Array1::from(samples))?)
            }
            RecordKind::Sequence => {
                let times = self.times.ok_or_else(|| anyhow!("sequence entry '{}' has no time stamps", self.name))?;
                Record::Sequence(Sequence::new(self.meta, times, Array1::from(samples))?)
            }
            RecordKind::Field => {
                let data = ArrayD::from_shape_vec(IxDyn(&self.shape), samples)?;
                Record::Field(Field::new(self.meta, self.axes, data)?)
            }
        };
        Ok(record)
    }
}

fn encode_samples(samples: &[f64], compression: Compression) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(samples.len() * 8);
    for value in samples {
        raw.extend_from_slice(&value.to_le_bytes());
    }
    match compression {
        Compression::None => Ok(raw),
        Compression::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&raw)?;
            Ok(encoder.finish()?)
        }
    }
}

fn decode_samples(bytes: &[u8], compression: Compression) -> Result<Vec<f64>> {
    let inflated;
    let raw = match compression {
        Compression::None => bytes,
        Compression::Deflate => {
            let mut buffer = Vec::new();
            DeflateDecoder::new(bytes).read_to_end(&mut buffer)?;
            inflated = buffer;
            &inflated[..]
        }
    };
    ensure!(raw.len() % 8 == 0, "payload of {} bytes is not a whole number of f64 values", raw.len());
    Ok(raw
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect())
}

/// Save records to `path` with deflate compressed payloads.
pub fn save<P: AsRef<Path>>(path: P, records: &BTreeMap<String, Record>) -> Result<()> {
    save_with(path, records, Compression::default())
}

pub fn save_with<P: AsRef<Path>>(path: P, records: &BTreeMap<String, Record>, compression: Compression) -> Result<()> {
    let path = path.as_ref();

    // Encode payloads in parallel, offsets are assigned afterwards in name order
    let encoded: Vec<(IndexEntry, Vec<u8>)> = records
        .par_iter()
        .map(|(name, record)| {
            let (entry, samples) = record.to_entry(name, compression);
            let bytes = encode_samples(&samples, compression)
                .with_context(|| format!("Failed to encode entry '{}' for {}", name, path.display()))?;
            Ok((entry, bytes))
        })
        .collect::<Result<_>>()?;

    let mut offset = 0u64;
    let mut index = Vec::with_capacity(encoded.len());
    let mut payloads = Vec::with_capacity(encoded.len());
    for (mut entry, bytes) in encoded {
        entry.offset = offset;
        entry.length = bytes.len() as u64;
        offset += entry.length;
        index.push(entry);
        payloads.push(bytes);
    }
    let index_bytes = serde_json::to_vec(&index)?;

    let file = File::create(path)
        .with_context(|| format!("Failed to create archive {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&(index_bytes.len() as u64).to_le_bytes())?;
    writer.write_all(&index_bytes)?;
    for payload in &payloads {
        writer.write_all(payload)?;
    }
    writer.flush()
        .with_context(|| format!("Failed to write archive {}", path.display()))?;

    debug!("Saved {} entries to {}", index.len(), path.display());
    Ok(())
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, Record>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open archive {}", path.display()))?;
    let mmap = unsafe { MmapOptions::new().map(&file) }
        .with_context(|| format!("Failed to memory map archive {}", path.display()))?;

    if mmap.len() < PREAMBLE_LEN || &mmap[..8] != MAGIC {
        bail!("{} is not a miic archive", path.display());
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&mmap[8..PREAMBLE_LEN]);
    let payload_start = usize::try_from(u64::from_le_bytes(len_bytes))
        .ok()
        .and_then(|index_len| index_len.checked_add(PREAMBLE_LEN))
        .filter(|end| *end <= mmap.len())
        .ok_or_else(|| anyhow!("archive {} has a truncated index", path.display()))?;

    let index: Vec<IndexEntry> = serde_json::from_slice(&mmap[PREAMBLE_LEN..payload_start])
        .with_context(|| format!("Failed to parse index of archive {}", path.display()))?;
    let payloads = &mmap[payload_start..];

    let records = index
        .into_par_iter()
        .map(|entry| {
            let name = entry.name.clone();
            let bytes = usize::try_from(entry.offset)
                .ok()
                .zip(usize::try_from(entry.length).ok())
                .and_then(|(start, length)| Some(start..start.checked_add(length)?))
                .and_then(|range| payloads.get(range))
                .ok_or_else(|| anyhow!("payload of entry '{}' in {} is truncated", name, path.display()))?;
            let samples = decode_samples(bytes, entry.compression)
                .with_context(|| format!("Failed to decode entry '{}' of {}", name, path.display()))?;
            let record = entry.into_record(samples)
                .with_context(|| format!("Invalid entry '{}' in {}", name, path.display()))?;
            Ok((name, record))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(records)
}
