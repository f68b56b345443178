#![allow(dead_code)]

use bsds::{config::ScheduleConfig, gtfs::Gtfs, schedule::ScheduleIndex};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::{America::Chicago, Tz};
use std::io::{Cursor, Write};
use zip::{ZipWriter, write::SimpleFileOptions};

pub const TZ: Tz = Chicago;

const AGENCY: &str = "agency_id,agency_name,agency_url,agency_timezone
A1,Metro,https://metro.example,America/Chicago
";

const STOPS: &str = "stop_id,stop_name,stop_code
S1,Main St & 4th Ave,101
S2,Oak Ave,102
S3,Elm St,
";

const ROUTES: &str = "route_id,route_short_name,route_long_name,route_type,route_color
R1,1,Crosstown,3,FF0000
R2,2,,3,
";

const TRIPS: &str = "route_id,service_id,trip_id,trip_headsign
R1,WK,T1,Downtown
R2,WK,T2,Uptown
R1,WK,T3,Downtown
R1,WK,T4,Downtown
R1,WK,LATE,Night Owl
";

const STOP_TIMES: &str = "trip_id,arrival_time,departure_time,stop_id,stop_sequence
T1,07:55:00,07:55:00,S2,1
T1,08:00:00,08:00:00,S1,2
T1,08:05:00,08:05:00,S3,3
T2,08:10:00,08:10:00,S1,1
T3,09:00:00,09:00:00,S1,2
T4,08:10:00,08:10:00,S1,1
LATE,24:20:00,24:20:00,S1,1
";

const CALENDAR: &str = "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date
WK,1,1,1,1,1,1,1,20260101,20261231
";

/// In-memory GTFS bundle, zipped on demand.
#[derive(Clone)]
pub struct Bundle {
    files: Vec<(String, String)>,
}

impl Bundle {
    pub fn empty() -> Self {
        Self { files: Vec::new() }
    }

    /// One agency in Chicago, three stops and a daily service.
    pub fn sample() -> Self {
        Self::empty()
            .file("agency.txt", AGENCY)
            .file("stops.txt", STOPS)
            .file("routes.txt", ROUTES)
            .file("trips.txt", TRIPS)
            .file("stop_times.txt", STOP_TIMES)
            .file("calendar.txt", CALENDAR)
    }

    pub fn file(mut self, name: &str, contents: &str) -> Self {
        self.files.retain(|(file, _)| file != name);
        self.files.push((name.to_string(), contents.to_string()));
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.files.retain(|(file, _)| file != name);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in &self.files {
            writer
                .start_file(name.as_str(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    pub fn gtfs(&self) -> Gtfs {
        Gtfs::new().from_bytes(self.to_bytes())
    }

    pub fn index(&self) -> ScheduleIndex {
        ScheduleIndex::load(&self.gtfs(), ScheduleConfig::default()).unwrap()
    }
}

/// 2026-03-02, a Monday.
pub fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
}

/// Absolute instant of a Chicago wall-clock time.
pub fn local(date: NaiveDate, h: u32, m: u32) -> DateTime<Utc> {
    TZ.from_local_datetime(&date.and_hms_opt(h, m, 0).unwrap())
        .unwrap()
        .with_timezone(&Utc)
}

/// Serves `router` on an ephemeral local port and returns its base url.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("bsds-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
