// Timestamp handling for exFAT directory entries
// exFAT stores MS-DOS style date/time words plus a 10 ms increment field.
// The engine keeps times as Unix seconds (UTC).

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use log::warn;

/// First year a FAT date can hold.
const FAT_EPOCH_YEAR: i32 = 1980;
/// Last year a FAT date can hold (7-bit year field).
const FAT_LAST_YEAR: i32 = FAT_EPOCH_YEAR + 127;

/// Date, time and centiseconds as stored in a FILE record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExFatTimestamp {
    pub date: u16,
    pub time: u16,
    pub centiseconds: u8,
}

/// Convert exFAT date/time fields to Unix seconds.
/// FAT date: bits 15-9: year (0=1980), bits 8-5: month, bits 4-0: day
/// FAT time: bits 15-11: hours, bits 10-5: minutes, bits 4-0: seconds/2
///
/// Malformed fields are logged and yield 0.
pub fn exfat_to_unix(date: u16, time: u16, centiseconds: u8) -> i64 {
    let day = (date & 0x1f) as u32;
    let month = ((date >> 5) & 0x0f) as u32;
    let year = (date >> 9) as i32 + FAT_EPOCH_YEAR;

    let twosec = (time & 0x1f) as u32;
    let minute = ((time >> 5) & 0x3f) as u32;
    let hour = (time >> 11) as u32;

    if day == 0 || month == 0 || month > 12 {
        warn!("bad date {}-{:02}-{:02}", year, month, day);
        return 0;
    }
    if hour > 23 || minute > 59 || twosec > 29 {
        warn!("bad time {}:{:02}:{:02}", hour, minute, twosec * 2);
        return 0;
    }

    let datetime = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, twosec * 2));
    match datetime {
        Some(dt) => dt.and_utc().timestamp() + (centiseconds / 100) as i64,
        None => {
            warn!("bad date {}-{:02}-{:02}", year, month, day);
            0
        }
    }
}

/// Convert Unix seconds to exFAT fields, clamping to the representable range.
pub fn unix_to_exfat(unix_time: i64) -> ExFatTimestamp {
    let first = NaiveDate::from_ymd_opt(FAT_EPOCH_YEAR, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(315_532_800);
    let last = NaiveDate::from_ymd_opt(FAT_LAST_YEAR, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(4_354_819_199);
    let clamped = unix_time.clamp(first, last);

    let datetime = DateTime::<Utc>::from_timestamp(clamped, 0).unwrap_or_default();

    let year = (datetime.year() - FAT_EPOCH_YEAR) as u16;
    let date = (year << 9) | ((datetime.month() as u16) << 5) | datetime.day() as u16;
    let time = ((datetime.hour() as u16) << 11)
        | ((datetime.minute() as u16) << 5)
        | (datetime.second() / 2) as u16;

    ExFatTimestamp {
        date,
        time,
        centiseconds: ((clamped % 2) * 100) as u8,
    }
}

/// Current time as Unix seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}
