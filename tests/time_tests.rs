use bsds::shared::{Time, local_date_time, parse_gtfs_date, service_instant};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::America::Chicago;

fn utc(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

#[test]
fn valid_time_test_1() {
    assert_eq!(Time::from_hms("00:00:00").unwrap().as_seconds(), 0);
}

#[test]
fn valid_time_test_2() {
    assert_eq!(Time::from_hms("01:01:30").unwrap().as_seconds(), 3690);
}

#[test]
fn valid_time_test_3() {
    let time = Time::from_hms("26:15:00").unwrap();
    assert_eq!(time.as_seconds(), 26 * 3600 + 15 * 60);
    assert!(time.is_past_midnight());
}

#[test]
fn invalid_time_test_1() {
    assert!(Time::from_hms("00:00:0a").is_none());
}

#[test]
fn invalid_time_test_2() {
    assert!(Time::from_hms("00:00").is_none());
}

#[test]
fn gtfs_dates() {
    assert_eq!(parse_gtfs_date("20260302"), NaiveDate::from_ymd_opt(2026, 3, 2));
    assert!(parse_gtfs_date("2026-03-02").is_none());
    assert!(parse_gtfs_date("20260230").is_none());
}

#[test]
fn service_day_on_spring_forward() {
    // 2026-03-08, clocks skip from 02:00 to 03:00 in Chicago
    let date = NaiveDate::from_ymd_opt(2026, 3, 8).unwrap();
    let instant = service_instant(date, Time::from_hms_parts(8, 0, 0), Chicago).unwrap();
    assert_eq!(instant, utc("2026-03-08T13:00:00Z"));
}

#[test]
fn service_day_on_fall_back() {
    // 2026-11-01, clocks repeat 01:00 to 02:00 in Chicago
    let date = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();
    let instant = service_instant(date, Time::from_hms_parts(8, 0, 0), Chicago).unwrap();
    assert_eq!(instant, utc("2026-11-01T14:00:00Z"));
}

#[test]
fn local_wall_clock() {
    let (date, time) = local_date_time(utc("2026-03-03T05:30:00Z"), Chicago);
    assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    assert_eq!(time, Time::from_hms_parts(23, 30, 0));
}
