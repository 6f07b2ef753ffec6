use chrono::{NaiveDate, NaiveDateTime};

pub const RAW_PARTITION: &str = "raw";
pub const COMPRESSED_SUFFIX: &str = ".gz";

/// File name without any registry directory prefix (`error/postgresql.log.X`
/// becomes `postgresql.log.X`).
pub fn base_file_name(file_name: &str) -> &str {
    file_name.rsplit('/').next().unwrap_or(file_name)
}

/// Rotation stamp carried in the last dot-separated segment of a rotated log
/// file name, either `YYYY-MM-DD-HHMM` or `YYYY-MM-DD-HH`.
pub fn rotation_stamp(file_name: &str) -> Option<NaiveDateTime> {
    let suffix = base_file_name(file_name).rsplit('.').next()?;
    let parts = suffix.split('-').collect::<Vec<_>>();
    let [year, month, day, clock] = parts.as_slice() else {
        return None;
    };
    let (year, month, day, clock) = (*year, *month, *day, *clock);

    if year.len() != 4 || month.len() != 2 || day.len() != 2 || !clock.is_ascii() {
        return None;
    }
    let (hour, minute) = match clock.len() {
        4 => (&clock[..2], &clock[2..]),
        2 => (clock, "00"),
        _ => return None,
    };

    let numeric = |text: &str| -> Option<u32> {
        if text.bytes().all(|byte| byte.is_ascii_digit()) {
            text.parse().ok()
        } else {
            None
        }
    };

    let year = i32::try_from(numeric(year)?).ok()?;
    NaiveDate::from_ymd_opt(year, numeric(month)?, numeric(day)?)?.and_hms_opt(
        numeric(hour)?,
        numeric(minute)?,
        0,
    )
}

pub fn partition_prefix(cluster_identifier: &str, instance_identifier: &str) -> String {
    format!(
        "{}/{}/{RAW_PARTITION}",
        cluster_identifier.trim_matches('/'),
        instance_identifier.trim_matches('/'),
    )
}

/// Deterministic destination key for a rotated log file. Returns `None` when
/// the file name carries no rotation stamp.
pub fn log_object_key(
    cluster_identifier: &str,
    instance_identifier: &str,
    file_name: &str,
    compressed: bool,
) -> Option<String> {
    let stamp = rotation_stamp(file_name)?;
    let suffix = if compressed { COMPRESSED_SUFFIX } else { "" };
    Some(format!(
        "{}/{}/{}{suffix}",
        partition_prefix(cluster_identifier, instance_identifier),
        stamp.format("%Y/%m/%d/%H"),
        base_file_name(file_name),
    ))
}
