use csv::{ReaderBuilder, StringRecord, Trim};
use serde::de::DeserializeOwned;
use std::{
    fs::File,
    io::{self, Cursor, Read, Seek},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use zip::ZipArchive;

mod config;
pub mod models;
pub use config::*;
use models::*;

/// Failure to read a static bundle. Fatal to the load, never retried with
/// the same bytes.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Csv error in {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },
    #[error("Csv file {0} is missing header")]
    MissingHeader(String),
    #[error("Could not find file with name: {0}")]
    FileNotFound(String),
    #[error("Bundle has neither {0} nor {1}")]
    MissingCalendar(String, String),
    #[error("Invalid time {value:?} in {file} for trip {trip_id}")]
    InvalidTime {
        file: String,
        trip_id: String,
        value: String,
    },
    #[error("Invalid date {value:?} in {file} for service {service_id}")]
    InvalidDate {
        file: String,
        service_id: String,
        value: String,
    },
    #[error("Unknown time zone {0:?}")]
    InvalidTimezone(String),
}

#[derive(Default, Clone)]
pub enum StorageType {
    #[default]
    None,
    Zip(PathBuf),
    Memory(Arc<[u8]>),
}

/// Streams the tables of a GTFS bundle row by row.
#[derive(Default)]
pub struct Gtfs {
    config: Config,
    storage: StorageType,
}

impl Gtfs {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_config(mut self, config: self::Config) -> Self {
        self.config = config;
        self
    }

    pub fn from_zip<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.storage = StorageType::Zip(path.as_ref().to_path_buf());
        self
    }

    pub fn from_bytes<B: Into<Arc<[u8]>>>(mut self, bytes: B) -> Self {
        self.storage = StorageType::Memory(bytes.into());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn has_file(&self, name: &str) -> Result<bool, self::Error> {
        match &self.storage {
            StorageType::None => Ok(false),
            StorageType::Zip(path) => {
                let archive = ZipArchive::new(File::open(path)?)?;
                Ok(archive.index_for_name(name).is_some())
            }
            StorageType::Memory(bytes) => {
                let archive = ZipArchive::new(Cursor::new(bytes.clone()))?;
                Ok(archive.index_for_name(name).is_some())
            }
        }
    }

    pub fn stream_agencies<F>(&self, f: F) -> Result<(), self::Error>
    where
        F: FnMut((usize, GtfsAgency)),
    {
        self.stream(&self.config.agency_path, f)
    }

    pub fn stream_stops<F>(&self, f: F) -> Result<(), self::Error>
    where
        F: FnMut((usize, GtfsStop)),
    {
        self.stream(&self.config.stops_path, f)
    }

    pub fn stream_routes<F>(&self, f: F) -> Result<(), self::Error>
    where
        F: FnMut((usize, GtfsRoute)),
    {
        self.stream(&self.config.routes_path, f)
    }

    pub fn stream_trips<F>(&self, f: F) -> Result<(), self::Error>
    where
        F: FnMut((usize, GtfsTrip)),
    {
        self.stream(&self.config.trips_path, f)
    }

    pub fn stream_stop_times<F>(&self, f: F) -> Result<(), self::Error>
    where
        F: FnMut((usize, GtfsStopTime)) -> Result<(), self::Error>,
    {
        self.try_stream(&self.config.stop_times_path, f)
    }

    pub fn stream_calendar<F>(&self, f: F) -> Result<(), self::Error>
    where
        F: FnMut((usize, GtfsCalendar)) -> Result<(), self::Error>,
    {
        self.try_stream(&self.config.calendar_path, f)
    }

    pub fn stream_calendar_dates<F>(&self, f: F) -> Result<(), self::Error>
    where
        F: FnMut((usize, GtfsCalendarDate)) -> Result<(), self::Error>,
    {
        self.try_stream(&self.config.calendar_dates_path, f)
    }

    fn stream<T, F>(&self, file_name: &str, mut f: F) -> Result<(), self::Error>
    where
        T: DeserializeOwned,
        F: FnMut((usize, T)),
    {
        self.try_stream(file_name, |row| {
            f(row);
            Ok(())
        })
    }

    fn try_stream<T, F>(&self, file_name: &str, f: F) -> Result<(), self::Error>
    where
        T: DeserializeOwned,
        F: FnMut((usize, T)) -> Result<(), self::Error>,
    {
        match &self.storage {
            StorageType::None => Ok(()),
            StorageType::Zip(path) => {
                let archive = ZipArchive::new(File::open(path)?)?;
                stream_from_archive(archive, file_name, f)
            }
            StorageType::Memory(bytes) => {
                let archive = ZipArchive::new(Cursor::new(bytes.clone()))?;
                stream_from_archive(archive, file_name, f)
            }
        }
    }
}

fn stream_from_archive<R, T, F>(
    mut archive: ZipArchive<R>,
    file_name: &str,
    mut f: F,
) -> Result<(), self::Error>
where
    R: Read + Seek,
    T: DeserializeOwned,
    F: FnMut((usize, T)) -> Result<(), self::Error>,
{
    let index = archive
        .index_for_name(file_name)
        .ok_or(self::Error::FileNotFound(file_name.to_string()))?;
    let file = archive.by_index(index)?;
    let csv_error = |source| self::Error::Csv {
        file: file_name.to_string(),
        source,
    };

    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(file);
    let headers = reader.headers().map_err(csv_error)?.clone();
    if headers.is_empty() || headers.iter().all(str::is_empty) {
        return Err(self::Error::MissingHeader(file_name.to_string()));
    }
    // Exporters commonly prefix the first header with a UTF-8 BOM
    if headers.get(0).is_some_and(|h| h.starts_with('\u{feff}')) {
        let fixed: StringRecord = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}'))
            .collect();
        reader.set_headers(fixed);
    }

    for (i, row) in reader.deserialize().enumerate() {
        let row: T = row.map_err(csv_error)?;
        f((i, row))?;
    }
    Ok(())
}
