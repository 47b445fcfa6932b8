//! Continuous raw data files.
//!
//! Each file starts with a [RawFileHeader] and is followed by blocks, each
//! made of a block index (`i64`), a start time in seconds (`f64`), and then
//! `block_length` little-endian `i16` samples for every channel in header
//! order. All integers and floats are little-endian, strings are an `i32`
//! length followed by UTF-8 bytes.
//!
//! A series may be split across several files, which are read in sorted
//! file name order.
use super::{BlockInfo, SeriesReader, SeriesSelection, WaveformBlock, WaveformSource};
use crate::error::{SourceError, SourceResult};
use detprocess_common::{FacilityId, Real, SampleRate, SeriesId};
use glob::glob;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Error, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub const RAW_FILE_VERSION: &str = "detprocess-raw-1";
pub const RAW_FILE_EXTENSION: &str = "bin";

#[derive(Debug, Clone, PartialEq)]
pub struct RawFileHeader {
    pub format_version: String,
    pub series_id: SeriesId,
    pub facility: FacilityId,
    pub channel_names: Vec<String>,
    pub volts_scale_factor: Vec<f64>,
    pub channel_offset_volts: Vec<f64>,
    pub sample_rate: SampleRate,
    pub block_length: usize,
    pub pretrigger_length: usize,
    pub series_start_time: f64,
}

impl RawFileHeader {
    pub(crate) fn load<R: Read>(file: &mut R) -> Result<Self, Error> {
        let format_version = load_string(file)?;
        if format_version != RAW_FILE_VERSION {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Unsupported format version \"{format_version}\""),
            ));
        }
        let series_id = load_string(file)?;
        let facility = load_i32(file)?;
        let number_of_channels = load_count(file)?;
        Ok(RawFileHeader {
            format_version,
            series_id,
            facility: u32::try_from(facility)
                .map_err(|e| Error::new(ErrorKind::InvalidData, e))?,
            channel_names: (0..number_of_channels)
                .map(|_| load_string(file))
                .collect::<Result<_, _>>()?,
            volts_scale_factor: load_f64_vec(file, number_of_channels)?,
            channel_offset_volts: load_f64_vec(file, number_of_channels)?,
            sample_rate: load_f64(file)?,
            block_length: load_count(file)?,
            pretrigger_length: load_count(file)?,
            series_start_time: load_f64(file)?,
        })
    }

    pub(crate) fn save<W: Write>(&self, file: &mut W) -> Result<(), Error> {
        save_string(file, &self.format_version)?;
        save_string(file, &self.series_id)?;
        save_count(file, self.facility as usize)?;
        save_count(file, self.channel_names.len())?;
        for name in &self.channel_names {
            save_string(file, name)?;
        }
        for value in self
            .volts_scale_factor
            .iter()
            .chain(self.channel_offset_volts.iter())
        {
            file.write_all(&value.to_le_bytes())?;
        }
        file.write_all(&self.sample_rate.to_le_bytes())?;
        save_count(file, self.block_length)?;
        save_count(file, self.pretrigger_length)?;
        file.write_all(&self.series_start_time.to_le_bytes())
    }

    fn num_channels(&self) -> usize {
        self.channel_names.len()
    }

    fn is_consistent_with(&self, other: &RawFileHeader) -> bool {
        self.channel_names == other.channel_names
            && self.sample_rate == other.sample_rate
            && self.facility == other.facility
    }
}

/// One block as stored on disk, before conversion to volts.
#[derive(Debug)]
struct RawBlock {
    block_index: i64,
    start_time: f64,
    raw_trace: Vec<Vec<i16>>,
}

impl RawBlock {
    fn load<R: Read>(file: &mut R, num_channels: usize, num_samples: usize) -> Result<Self, Error> {
        Ok(RawBlock {
            block_index: load_i64(file)?,
            start_time: load_f64(file)?,
            raw_trace: (0..num_channels)
                .map(|_| load_raw_trace(file, num_samples))
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Debug, Clone)]
struct SeriesFiles {
    series_id: SeriesId,
    files: Vec<PathBuf>,
}

/// A directory of raw data files.
#[derive(Debug)]
pub struct RawFileSource {
    header: RawFileHeader,
    series: Vec<SeriesFiles>,
}

impl RawFileSource {
    /// Scans `directory` for raw data files and groups them by series.
    ///
    /// # Error Modes
    /// - [SourceError::NoFiles] if the directory holds no raw data file.
    /// - [SourceError::Inconsistent] if files disagree on channels, sample rate or facility.
    #[tracing::instrument(skip_all, fields(directory = %directory.display(), num_files))]
    pub fn open(directory: &Path) -> SourceResult<Self> {
        let pattern = directory.join(format!("*.{RAW_FILE_EXTENSION}"));
        let mut paths = glob(&pattern.to_string_lossy())?.collect::<Result<Vec<_>, _>>()?;
        paths.sort();
        tracing::Span::current().record("num_files", paths.len());

        let mut header: Option<RawFileHeader> = None;
        let mut series: Vec<SeriesFiles> = Vec::new();
        for path in paths {
            let file_header = RawFileHeader::load(&mut BufReader::new(File::open(&path)?))
                .map_err(|e| SourceError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            debug!("Found {} for series {}", path.display(), file_header.series_id);

            match &header {
                Some(first) if !first.is_consistent_with(&file_header) => {
                    return Err(SourceError::Inconsistent(format!(
                        "{} does not match the channels, sample rate or facility of the other files",
                        path.display()
                    )));
                }
                Some(_) => {}
                None => header = Some(file_header.clone()),
            }
            match series
                .iter_mut()
                .find(|s| s.series_id == file_header.series_id)
            {
                Some(entry) => entry.files.push(path),
                None => series.push(SeriesFiles {
                    series_id: file_header.series_id,
                    files: vec![path],
                }),
            }
        }
        let header = header.ok_or_else(|| SourceError::NoFiles(directory.to_owned()))?;
        info!(
            "Found {} series with {} channel(s) at {} Hz",
            series.len(),
            header.num_channels(),
            header.sample_rate
        );
        Ok(Self { header, series })
    }
}

impl WaveformSource for RawFileSource {
    fn list_series(&self, selection: &SeriesSelection) -> SourceResult<Vec<SeriesId>> {
        selection.filter(self.series.iter().map(|s| s.series_id.clone()).collect())
    }

    fn available_channels(&self) -> SourceResult<Vec<String>> {
        Ok(self.header.channel_names.clone())
    }

    fn sample_rate(&self) -> SourceResult<SampleRate> {
        Ok(self.header.sample_rate)
    }

    fn facility(&self) -> SourceResult<FacilityId> {
        Ok(self.header.facility)
    }

    fn open_series(&self, series_id: &str) -> SourceResult<Box<dyn SeriesReader + '_>> {
        let entry = self
            .series
            .iter()
            .find(|s| s.series_id == series_id)
            .ok_or_else(|| SourceError::UnknownSeries(series_id.to_owned()))?;
        Ok(Box::new(RawSeriesReader {
            files: entry.files.clone().into_iter(),
            current: None,
        }))
    }
}

struct OpenFile {
    path: PathBuf,
    reader: BufReader<File>,
    header: RawFileHeader,
}

struct RawSeriesReader {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<OpenFile>,
}

impl RawSeriesReader {
    fn open_next_file(&mut self) -> SourceResult<bool> {
        let Some(path) = self.files.next() else {
            return Ok(false);
        };
        let mut reader = BufReader::new(File::open(&path)?);
        let header = RawFileHeader::load(&mut reader).map_err(|e| SourceError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        debug!("Reading {}", path.display());
        self.current = Some(OpenFile {
            path,
            reader,
            header,
        });
        Ok(true)
    }
}

impl SeriesReader for RawSeriesReader {
    fn next_block(&mut self, channels: &[String]) -> SourceResult<Option<WaveformBlock>> {
        loop {
            let Some(open) = self.current.as_mut() else {
                if self.open_next_file()? {
                    continue;
                }
                return Ok(None);
            };
            if open.reader.fill_buf()?.is_empty() {
                self.current = None;
                continue;
            }

            let header = &open.header;
            let block = RawBlock::load(&mut open.reader, header.num_channels(), header.block_length)
                .map_err(|e| SourceError::Corrupt {
                    path: open.path.clone(),
                    reason: format!("truncated block: {e}"),
                })?;

            let mut traces = BTreeMap::new();
            for channel in channels {
                let position = header
                    .channel_names
                    .iter()
                    .position(|name| name == channel)
                    .ok_or_else(|| SourceError::MissingChannel(channel.clone()))?;
                let (Some(raw), Some(scale), Some(offset)) = (
                    block.raw_trace.get(position),
                    header.volts_scale_factor.get(position),
                    header.channel_offset_volts.get(position),
                ) else {
                    return Err(SourceError::Corrupt {
                        path: open.path.clone(),
                        reason: format!("channel {channel} has no calibration"),
                    });
                };
                traces.insert(
                    channel.clone(),
                    raw.iter()
                        .map(|&value| value as Real * scale + offset)
                        .collect(),
                );
            }

            let info = BlockInfo {
                series_id: header.series_id.clone(),
                block_index: u64::try_from(block.block_index).map_err(|_| {
                    SourceError::Corrupt {
                        path: open.path.clone(),
                        reason: format!("negative block index {}", block.block_index),
                    }
                })?,
                facility: header.facility,
                sample_rate: header.sample_rate,
                pretrigger_samples: header.pretrigger_length,
                start_time: block.start_time,
                num_samples: header.block_length,
            };
            return Ok(Some(WaveformBlock::new(info, traces)));
        }
    }
}

/// Writes a raw data file block by block.
pub struct RawFileWriter {
    file: BufWriter<File>,
    header: RawFileHeader,
}

impl RawFileWriter {
    pub fn create(path: &Path, header: RawFileHeader) -> Result<Self, Error> {
        let mut file = BufWriter::new(File::create(path)?);
        header.save(&mut file)?;
        Ok(Self { file, header })
    }

    /// Writes one block, `traces` holding one trace in volts per channel in header order.
    pub fn write_block(
        &mut self,
        block_index: u64,
        start_time: f64,
        traces: &[Vec<Real>],
    ) -> Result<(), Error> {
        if traces.len() != self.header.num_channels()
            || traces
                .iter()
                .any(|trace| trace.len() != self.header.block_length)
        {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Expected {} trace(s) of {} samples",
                    self.header.num_channels(),
                    self.header.block_length
                ),
            ));
        }
        let block_index =
            i64::try_from(block_index).map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
        self.file.write_all(&block_index.to_le_bytes())?;
        self.file.write_all(&start_time.to_le_bytes())?;
        for ((trace, scale), offset) in traces
            .iter()
            .zip(&self.header.volts_scale_factor)
            .zip(&self.header.channel_offset_volts)
        {
            for value in trace {
                let raw = ((value - offset) / scale)
                    .round()
                    .clamp(i16::MIN as Real, i16::MAX as Real) as i16;
                self.file.write_all(&raw.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), Error> {
        self.file.flush()
    }
}

fn load_scalar<R: Read, const B: usize>(file: &mut R) -> Result<[u8; B], Error> {
    let mut bytes = [0; B];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn load_i32<R: Read>(file: &mut R) -> Result<i32, Error> {
    Ok(i32::from_le_bytes(load_scalar::<R, 4>(file)?))
}

fn load_i64<R: Read>(file: &mut R) -> Result<i64, Error> {
    Ok(i64::from_le_bytes(load_scalar::<R, 8>(file)?))
}

fn load_f64<R: Read>(file: &mut R) -> Result<f64, Error> {
    Ok(f64::from_le_bytes(load_scalar::<R, 8>(file)?))
}

fn load_count<R: Read>(file: &mut R) -> Result<usize, Error> {
    let value = load_i32(file)?;
    usize::try_from(value).map_err(|_| {
        Error::new(
            ErrorKind::InvalidData,
            format!("Negative count {value}"),
        )
    })
}

fn load_f64_vec<R: Read>(file: &mut R, size: usize) -> Result<Vec<f64>, Error> {
    (0..size).map(|_| load_f64(file)).collect()
}

fn load_string<R: Read>(file: &mut R) -> Result<String, Error> {
    let size = load_count(file)?;
    let mut string_bytes = vec![0; size];
    file.read_exact(&mut string_bytes)?;
    String::from_utf8(string_bytes).map_err(|e| Error::new(ErrorKind::InvalidData, e))
}

fn load_raw_trace<R: Read>(file: &mut R, size: usize) -> Result<Vec<i16>, Error> {
    let mut trace_bytes = vec![0; size * size_of::<i16>()];
    file.read_exact(&mut trace_bytes)?;
    Ok(trace_bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

fn save_count<W: Write>(file: &mut W, value: usize) -> Result<(), Error> {
    let value = i32::try_from(value).map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
    file.write_all(&value.to_le_bytes())
}

fn save_string<W: Write>(file: &mut W, value: &str) -> Result<(), Error> {
    save_count(file, value.len())?;
    file.write_all(value.as_bytes())
}
