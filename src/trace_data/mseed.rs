use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use memmap2::MmapOptions;
use ndarray::Array1;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use tracing::debug;

use crate::error::{MiicError, MiicResult};
use crate::trace_data::{Stats, Stream, Trace};
use crate::utils::{seconds_to_duration, timestamp};

//=====================================================================
// Reader and writer for miniSEED (SEED 2.4 data-only records).
//=====================================================================

// A record as follows (from start of record to end):
//    - Fixed section of the data header, 48 bytes
//        - Sequence number as 6 ASCII digits, quality indicator, reserved byte
//        - Station (5), location (2), channel (3) and network (2) codes as
//          space padded ASCII
//        - Start time (BTIME): year, day of year, hour, minute, second,
//          unused byte, 0.0001 s ticks
//        - Number of samples, sample rate factor and multiplier
//        - Activity, I/O and quality flags, number of blockettes
//        - Time correction in 0.0001 s, offset of the data, offset of the
//          first blockette
//    - Blockettes
//        - 1000 (required): encoding, word order and log2 of the record length
//        - 1001 (optional): microseconds added to the start time
//        - 100 (optional): actual sampling rate as a float
//    - Data, starting at the offset given in the fixed header
//
// The byte order of the header is detected from the year field. Records
// written here are always 4096 bytes long and big endian.
const FIXED_HEADER_LEN: usize = 48;
const RECORD_EXPONENT: u8 = 12;
const RECORD_LEN: usize = 1 << RECORD_EXPONENT;
const DATA_OFFSET: usize = 64;
const STEIM_FRAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive, Display, EnumIter, EnumString)]
#[repr(u8)]
#[strum(ascii_case_insensitive)]
pub enum Encoding {
    Ascii = 0,
    Int16 = 1,
    Int24 = 2,
    Int32 = 3,
    #[default]
    Float32 = 4,
    Float64 = 5,
    Steim1 = 10,
    Steim2 = 11,
}

impl Encoding {
    // Bytes per sample of the fixed size encodings
    fn sample_size(&self) -> Option<usize> {
        match self {
            Encoding::Int16 => Some(2),
            Encoding::Int32 | Encoding::Float32 => Some(4),
            Encoding::Float64 => Some(8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct RecordHeader {
    network: String,
    station: String,
    location: String,
    channel: String,
    starttime: DateTime<Utc>,
    nsamples: usize,
    sampling_rate: f64,
    encoding: Encoding,
    big_endian_data: bool,
    record_length: usize,
    data_offset: usize,
}

#[inline]
fn read_u16(bytes: &[u8], big: bool) -> u16 {
    let raw = [bytes[0], bytes[1]];
    if big { u16::from_be_bytes(raw) } else { u16::from_le_bytes(raw) }
}

#[inline]
fn read_u32(bytes: &[u8], big: bool) -> u32 {
    let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if big { u32::from_be_bytes(raw) } else { u32::from_le_bytes(raw) }
}

#[inline]
fn read_u64(bytes: &[u8], big: bool) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    if big { u64::from_be_bytes(raw) } else { u64::from_le_bytes(raw) }
}

// Sign extend the lowest `bits` bits of `value`
#[inline]
fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Sampling rate from the SEED factor and multiplier.
pub fn sampling_rate_from_factors(factor: i16, multiplier: i16) -> f64 {
    let (f, m) = (factor as f64, multiplier as f64);
    match (factor, multiplier) {
        (0, _) | (_, 0) => 0.0,
        (f_, m_) if f_ > 0 && m_ > 0 => f * m,
        (f_, _) if f_ > 0 => -f / m,
        (_, m_) if m_ > 0 => -m / f,
        _ => 1.0 / (f * m),
    }
}

/// Factor and multiplier representing `sampling_rate` as closely as the
/// 16 bit fields allow.
pub fn factors_from_sampling_rate(sampling_rate: f64) -> (i16, i16) {
    if sampling_rate <= 0.0 {
        return (0, 0);
    }
    if sampling_rate >= 1.0 {
        if sampling_rate.fract() == 0.0 && sampling_rate <= i16::MAX as f64 {
            return (sampling_rate as i16, 1);
        }
        // rate = -factor / multiplier
        let mut divisor = 10i32;
        while divisor < 10_000 && (sampling_rate * divisor as f64 * 10.0) <= i16::MAX as f64 {
            divisor *= 10;
        }
        return ((sampling_rate * divisor as f64).round() as i16, -(divisor as i16));
    }
    let period = 1.0 / sampling_rate;
    if period.fract().abs() < 1e-9 && period <= i16::MAX as f64 {
        return (-(period.round() as i16), 1);
    }
    // rate = -multiplier / factor
    let mut scale = 10i32;
    while scale < 10_000 && (period * scale as f64 * 10.0) <= i16::MAX as f64 {
        scale *= 10;
    }
    (-((period * scale as f64).round() as i16), scale as i16)
}

fn parse_record_header(bytes: &[u8]) -> MiicResult<RecordHeader> {
    if bytes.len() < FIXED_HEADER_LEN {
        return Err(MiicError::Mseed(format!("record header truncated to {} bytes", bytes.len())));
    }
    if !matches!(bytes[6], b'D' | b'R' | b'Q' | b'M') {
        return Err(MiicError::Mseed(format!("unknown data quality indicator '{}'", bytes[6] as char)));
    }

    // Byte order detection by a plausible year
    let big = (1900..=2100).contains(&read_u16(&bytes[20..], true));
    if !big && !(1900..=2100).contains(&read_u16(&bytes[20..], false)) {
        return Err(MiicError::Mseed("cannot determine byte order of record header".into()));
    }

    let year = read_u16(&bytes[20..], big) as i32;
    let day_of_year = read_u16(&bytes[22..], big) as u32;
    let (hour, minute, second) = (bytes[24] as u32, bytes[25] as u32, bytes[26] as u32);
    let ticks = read_u16(&bytes[28..], big) as i64;
    let mut starttime = NaiveDate::from_yo_opt(year, day_of_year)
        .and_then(|date| date.and_hms_opt(hour, minute, second.min(59)))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| MiicError::Mseed(format!("invalid start time {}-{:03} {}:{}:{}", year, day_of_year, hour, minute, second)))?;
    // Leap seconds are folded into the following second
    starttime += Duration::seconds(second.saturating_sub(59) as i64) + Duration::microseconds(ticks * 100);

    let nsamples = read_u16(&bytes[30..], big) as usize;
    let factor = read_u16(&bytes[32..], big) as i16;
    let multiplier = read_u16(&bytes[34..], big) as i16;
    let mut sampling_rate = sampling_rate_from_factors(factor, multiplier);
    let activity_flags = bytes[36];
    let blockette_count = bytes[39] as usize;
    let time_correction = read_u32(&bytes[40..], big) as i32;
    let data_offset = read_u16(&bytes[44..], big) as usize;
    let mut blockette_offset = read_u16(&bytes[46..], big) as usize;

    if activity_flags & 0x02 == 0 && time_correction != 0 {
        starttime += Duration::microseconds(time_correction as i64 * 100);
    }

    let mut b1000: Option<(Encoding, bool, usize)> = None;
    for _ in 0..blockette_count.max(1) {
        if blockette_offset == 0 || blockette_offset + 4 > bytes.len() {
            break;
        }
        let blockette = &bytes[blockette_offset..];
        let kind = read_u16(blockette, big);
        let next = read_u16(&blockette[2..], big) as usize;
        match kind {
            1000 if blockette.len() >= 8 => {
                let encoding = Encoding::try_from(blockette[4])
                    .map_err(|_| MiicError::Mseed(format!("unknown encoding {}", blockette[4])))?;
                let exponent = blockette[6];
                if !(7..=20).contains(&exponent) {
                    return Err(MiicError::Mseed(format!("invalid record length exponent {}", exponent)));
                }
                b1000 = Some((encoding, blockette[5] == 1, 1usize << exponent));
            }
            1001 if blockette.len() >= 8 => {
                starttime += Duration::microseconds(blockette[5] as i8 as i64);
            }
            100 if blockette.len() >= 8 => {
                let actual = f32::from_bits(read_u32(&blockette[4..], big)) as f64;
                if actual > 0.0 {
                    sampling_rate = actual;
                }
            }
            _ => {}
        }
        if next <= blockette_offset {
            break;
        }
        blockette_offset = next;
    }

    let (encoding, big_endian_data, record_length) =
        b1000.ok_or_else(|| MiicError::Mseed("record without blockette 1000".into()))?;

    Ok(RecordHeader {
        network: ascii_field(&bytes[18..20]),
        station: ascii_field(&bytes[8..13]),
        location: ascii_field(&bytes[13..15]),
        channel: ascii_field(&bytes[15..18]),
        starttime,
        nsamples,
        sampling_rate,
        encoding,
        big_endian_data,
        record_length,
        data_offset,
    })
}

fn decode_steim(data: &[u8], nsamples: usize, big: bool, version: u8) -> MiicResult<Vec<f64>> {
    let words: Vec<u32> = data.chunks_exact(4).map(|chunk| read_u32(chunk, big)).collect();
    let mut diffs: Vec<i32> = Vec::with_capacity(nsamples);
    let (mut first, mut last) = (0i32, 0i32);

    'frames: for (frame_idx, frame) in words.chunks_exact(STEIM_FRAME_LEN / 4).enumerate() {
        let nibbles = frame[0];
        for (w, &word) in frame.iter().enumerate().skip(1) {
            if diffs.len() >= nsamples {
                break 'frames;
            }
            if frame_idx == 0 && w == 1 {
                first = word as i32;
                continue;
            }
            if frame_idx == 0 && w == 2 {
                last = word as i32;
                continue;
            }
            let code = (nibbles >> (30 - 2 * w)) & 0b11;
            let dnib = word >> 30;
            match (version, code, dnib) {
                (_, 0, _) => {}
                (_, 1, _) => diffs.extend([24, 16, 8, 0].iter().map(|s| sign_extend((word >> s) & 0xff, 8))),
                (1, 2, _) => diffs.extend([16, 0].iter().map(|s| sign_extend((word >> s) & 0xffff, 16))),
                (1, 3, _) => diffs.push(word as i32),
                (2, 2, 1) => diffs.push(sign_extend(word & 0x3fff_ffff, 30)),
                (2, 2, 2) => diffs.extend([15, 0].iter().map(|s| sign_extend((word >> s) & 0x7fff, 15))),
                (2, 2, 3) => diffs.extend([20, 10, 0].iter().map(|s| sign_extend((word >> s) & 0x3ff, 10))),
                (2, 3, 0) => diffs.extend([24, 18, 12, 6, 0].iter().map(|s| sign_extend((word >> s) & 0x3f, 6))),
                (2, 3, 1) => diffs.extend([25, 20, 15, 10, 5, 0].iter().map(|s| sign_extend((word >> s) & 0x1f, 5))),
                (2, 3, 2) => diffs.extend([24, 20, 16, 12, 8, 4, 0].iter().map(|s| sign_extend((word >> s) & 0xf, 4))),
                _ => {
                    return Err(MiicError::Mseed(format!(
                        "invalid Steim{} code {} / {} in frame {}", version, code, dnib, frame_idx
                    )));
                }
            }
        }
    }

    if diffs.len() < nsamples {
        return Err(MiicError::Mseed(format!("Steim{} data holds {} of {} samples", version, diffs.len(), nsamples)));
    }
    let mut samples = Vec::with_capacity(nsamples);
    let mut current = first;
    samples.push(current as f64);
    for diff in diffs.iter().take(nsamples).skip(1) {
        current = current.wrapping_add(*diff);
        samples.push(current as f64);
    }
    if nsamples > 0 && current != last {
        debug!("Steim{} integration ended at {} but the record claims {}", version, current, last);
    }
    samples.truncate(nsamples);
    Ok(samples)
}

fn decode_samples(encoding: Encoding, data: &[u8], nsamples: usize, big: bool) -> MiicResult<Vec<f64>> {
    if let Some(size) = encoding.sample_size() {
        if data.len() < nsamples * size {
            return Err(MiicError::Mseed(format!(
                "{} samples of {} need {} bytes, record holds {}", nsamples, encoding, nsamples * size, data.len()
            )));
        }
    }
    let samples = match encoding {
        Encoding::Int16 => data.chunks_exact(2).take(nsamples).map(|c| read_u16(c, big) as i16 as f64).collect(),
        Encoding::Int32 => data.chunks_exact(4).take(nsamples).map(|c| read_u32(c, big) as i32 as f64).collect(),
        Encoding::Float32 => data.chunks_exact(4).take(nsamples).map(|c| f32::from_bits(read_u32(c, big)) as f64).collect(),
        Encoding::Float64 => data.chunks_exact(8).take(nsamples).map(|c| f64::from_bits(read_u64(c, big))).collect(),
        Encoding::Steim1 => decode_steim(data, nsamples, big, 1)?,
        Encoding::Steim2 => decode_steim(data, nsamples, big, 2)?,
        Encoding::Ascii | Encoding::Int24 => {
            return Err(MiicError::Mseed(format!("unsupported encoding {}", encoding)));
        }
    };
    Ok(samples)
}

// Samples of consecutive records are collected before building arrays
struct PendingTrace {
    stats: Stats,
    samples: Vec<f64>,
}

impl PendingTrace {
    fn next_sample_time(&self) -> f64 {
        timestamp(&self.stats.starttime) + self.samples.len() as f64 / self.stats.sampling_rate
    }
}

/// Decode all data records of a miniSEED byte buffer. Records that
/// continue the previous one of the same channel are joined.
pub fn read_bytes(bytes: &[u8]) -> MiicResult<Stream> {
    let mut pending: Vec<PendingTrace> = Vec::new();
    let mut offset = 0;
    while offset + FIXED_HEADER_LEN <= bytes.len() {
        let header = parse_record_header(&bytes[offset..])?;
        let end = offset + header.record_length;
        if end > bytes.len() || header.data_offset > header.record_length {
            return Err(MiicError::Mseed(format!("record at byte {} is truncated", offset)));
        }
        let record = &bytes[offset..end];
        offset = end;

        if header.encoding == Encoding::Ascii || header.nsamples == 0 || header.sampling_rate <= 0.0 {
            debug!("Skipping record without waveform samples for {}.{}", header.network, header.station);
            continue;
        }
        let samples = decode_samples(header.encoding, &record[header.data_offset..], header.nsamples, header.big_endian_data)?;

        let stats = Stats::new(&header.network, &header.station, &header.location, &header.channel, header.starttime, header.sampling_rate);
        let half_sample = 0.5 / header.sampling_rate;
        let continues = pending.iter_mut().rev().find(|p| {
            p.stats.id() == stats.id()
                && p.stats.sampling_rate == stats.sampling_rate
                && (p.next_sample_time() - timestamp(&stats.starttime)).abs() < half_sample
        });
        match continues {
            Some(trace) => trace.samples.extend(samples),
            None => pending.push(PendingTrace { stats, samples }),
        }
    }

    Ok(pending.into_iter().map(|p| Trace::new(p.stats, Array1::from(p.samples))).collect())
}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Stream> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open miniSEED file {}", path.display()))?;
    if file.metadata()?.len() == 0 {
        return Ok(Stream::new());
    }
    let mmap = unsafe { MmapOptions::new().map(&file) }
        .with_context(|| format!("Failed to memory map miniSEED file {}", path.display()))?;
    let stream = read_bytes(&mmap)
        .with_context(|| format!("Failed to decode miniSEED file {}", path.display()))?;
    Ok(stream)
}

fn padded_code(code: &str, width: usize, what: &str) -> MiicResult<Vec<u8>> {
    if code.len() > width || !code.is_ascii() {
        return Err(MiicError::Mseed(format!("{} code '{}' does not fit into {} ASCII characters", what, code, width)));
    }
    let mut field = code.as_bytes().to_vec();
    field.resize(width, b' ');
    Ok(field)
}

// Fixed header plus blockettes 1000 and 1001, big endian
pub(crate) fn write_record_header(
    buffer: &mut Vec<u8>,
    sequence: usize,
    stats: &Stats,
    starttime: &DateTime<Utc>,
    nsamples: usize,
    encoding: Encoding,
    record_exponent: u8,
) -> MiicResult<()> {
    buffer.extend_from_slice(format!("{:06}", sequence % 1_000_000).as_bytes());
    buffer.extend_from_slice(b"D ");
    buffer.extend(padded_code(&stats.station, 5, "station")?);
    buffer.extend(padded_code(&stats.location, 2, "location")?);
    buffer.extend(padded_code(&stats.channel, 3, "channel")?);
    buffer.extend(padded_code(&stats.network, 2, "network")?);

    let micros = starttime.timestamp_subsec_micros().min(999_999);
    buffer.extend_from_slice(&(starttime.year() as u16).to_be_bytes());
    buffer.extend_from_slice(&(starttime.ordinal() as u16).to_be_bytes());
    buffer.extend_from_slice(&[starttime.hour() as u8, starttime.minute() as u8, starttime.second() as u8, 0]);
    buffer.extend_from_slice(&((micros / 100) as u16).to_be_bytes());

    let (factor, multiplier) = factors_from_sampling_rate(stats.sampling_rate);
    buffer.extend_from_slice(&(nsamples as u16).to_be_bytes());
    buffer.extend_from_slice(&factor.to_be_bytes());
    buffer.extend_from_slice(&multiplier.to_be_bytes());
    // Activity, I/O and quality flags, two blockettes, no time correction
    buffer.extend_from_slice(&[0, 0, 0, 2]);
    buffer.extend_from_slice(&0i32.to_be_bytes());
    buffer.extend_from_slice(&(DATA_OFFSET as u16).to_be_bytes());
    buffer.extend_from_slice(&(FIXED_HEADER_LEN as u16).to_be_bytes());

    buffer.extend_from_slice(&1000u16.to_be_bytes());
    buffer.extend_from_slice(&56u16.to_be_bytes());
    buffer.extend_from_slice(&[u8::from(encoding), 1, record_exponent, 0]);

    buffer.extend_from_slice(&1001u16.to_be_bytes());
    buffer.extend_from_slice(&0u16.to_be_bytes());
    buffer.extend_from_slice(&[0, (micros % 100) as u8, 0, 0]);
    Ok(())
}

/// Encode a stream into 4096 byte records. Traces are split at NaN gaps.
pub fn write_bytes(stream: &Stream, encoding: Encoding) -> MiicResult<Vec<u8>> {
    let size = encoding.sample_size()
        .filter(|_| matches!(encoding, Encoding::Int32 | Encoding::Float32 | Encoding::Float64))
        .ok_or_else(|| MiicError::Mseed(format!("writing {} encoded data is not supported", encoding)))?;
    let per_record = (RECORD_LEN - DATA_OFFSET) / size;

    let mut buffer = Vec::new();
    let mut sequence = 1;
    for trace in stream.iter().flat_map(Trace::split) {
        for (chunk_idx, chunk) in trace.data.as_slice().unwrap_or(&trace.data.to_vec()).chunks(per_record).enumerate() {
            let start = trace.stats.starttime + seconds_to_duration((chunk_idx * per_record) as f64 * trace.delta());
            let record_start = buffer.len();
            write_record_header(&mut buffer, sequence, &trace.stats, &start, chunk.len(), encoding, RECORD_EXPONENT)?;
            for &value in chunk {
                match encoding {
                    Encoding::Int32 => buffer.extend_from_slice(&(value.round() as i32).to_be_bytes()),
                    Encoding::Float32 => buffer.extend_from_slice(&(value as f32).to_be_bytes()),
                    _ => buffer.extend_from_slice(&value.to_be_bytes()),
                }
            }
            buffer.resize(record_start + RECORD_LEN, 0);
            sequence += 1;
        }
    }
    Ok(buffer)
}

pub fn write_file<P: AsRef<Path>>(path: P, stream: &Stream, encoding: Encoding) -> Result<()> {
    let path = path.as_ref();
    let bytes = write_bytes(stream, encoding)
        .with_context(|| format!("Failed to encode miniSEED data for {}", path.display()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)
        .with_context(|| format!("Failed to write miniSEED file {}", path.display()))?;
    Ok(())
}
