use super::{FlushReceipt, OutputSink, SinkOutput};
use crate::{
    error::SinkError,
    event::TriggerRow,
    partition::{OutputPartition, TRIGGER_TABLE_COLUMNS},
};
use chrono::{DateTime, Local};
use detprocess_common::{
    AbsoluteSample, EventNumber, FacilityId, Real, SampleIndex, TIMESTAMP_FORMAT,
};
use serde::Serialize;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::info;

/// One line of the trigger table, fields in column order.
#[derive(Serialize)]
struct TriggerRecord<'a> {
    series_number: &'a str,
    event_number: EventNumber,
    trigger_time: Real,
    trigger_index: SampleIndex,
    trigger_sample: AbsoluteSample,
    trigger_amplitude: Real,
    trigger_channel: &'a str,
    reference: bool,
    ntriggers_in_event: usize,
    processing_id: Option<&'a str>,
}

trait SavablePoint {
    fn write_to_file<W: Write>(&self, writer: &mut csv::Writer<W>) -> Result<(), csv::Error>;
}

impl SavablePoint for TriggerRow<'_> {
    fn write_to_file<W: Write>(&self, writer: &mut csv::Writer<W>) -> Result<(), csv::Error> {
        writer.serialize(TriggerRecord {
            series_number: &self.event.series_id,
            event_number: self.event.event_number,
            trigger_time: self.event.trigger_time,
            trigger_index: self.trigger.sample_index,
            trigger_sample: self.trigger.absolute_sample,
            trigger_amplitude: self.trigger.amplitude,
            trigger_channel: &self.trigger.channel,
            reference: self.is_reference,
            ntriggers_in_event: self.event.num_coincident,
            processing_id: self.event.processing_id.as_deref(),
        })
    }
}

/// Creates `<base>/<prefix>_I<facility>_D<yyyymmdd>_T<hhmmss>` for the files of a run.
pub fn create_output_directory(
    base: &Path,
    processing_id: Option<&str>,
    facility: FacilityId,
    now: DateTime<Local>,
) -> Result<PathBuf, SinkError> {
    let prefix = match processing_id {
        Some(id) => format!("{id}_trigger"),
        None => "trigger".to_owned(),
    };
    let path = base.join(format!(
        "{prefix}_I{facility}_D{}",
        now.format(TIMESTAMP_FORMAT)
    ));
    fs::create_dir_all(&path).map_err(|source| SinkError::CreateDirectory {
        path: path.clone(),
        source,
    })?;
    info!("Writing triggers to {}", path.display());
    Ok(path)
}

/// Writes each partition to its own CSV file.
#[derive(Debug)]
pub struct FileSink {
    directory: PathBuf,
    files: Vec<PathBuf>,
}

impl FileSink {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            files: Vec::new(),
        }
    }

    fn file_name(partition: &OutputPartition) -> String {
        format!(
            "threshtrig_{}_F{:04}.csv",
            partition.series_id(),
            partition.dump_number()
        )
    }
}

impl OutputSink for FileSink {
    #[tracing::instrument(skip_all, fields(series_id = partition.series_id(), dump_number = partition.dump_number()))]
    fn flush(&mut self, partition: OutputPartition) -> Result<FlushReceipt, SinkError> {
        let path = self.directory.join(Self::file_name(&partition));
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(File::create(&path)?));
        writer.write_record(TRIGGER_TABLE_COLUMNS)?;
        for event in partition.events() {
            for row in event.rows() {
                row.write_to_file(&mut writer)?;
            }
        }
        writer.flush()?;
        self.files.push(path.clone());
        Ok(FlushReceipt::Written {
            path,
            rows: partition.num_rows(),
        })
    }

    fn into_output(self) -> SinkOutput {
        SinkOutput {
            events: Vec::new(),
            files: self.files,
        }
    }
}
