use std::os::fd::{AsFd, AsRawFd};

/// Formats a string like "/proc/self/fd/3" for the given fd.  This can be used to work with kernel
/// APIs that don't directly accept file descriptors.
///
/// This call never fails.
pub(crate) fn proc_self_fd(fd: impl AsFd) -> String {
    format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())
}

/// Formats a modification time the way listings show it: `YYYY-MM-DD HH:MM` in UTC.
pub fn format_mtime(secs: i64) -> String {
    let days = secs.div_euclid(86400);
    let rem = secs.rem_euclid(86400);

    // days since the epoch to a civil date (proleptic Gregorian)
    let z = days + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}",
        rem / 3600,
        rem % 3600 / 60
    )
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_proc_self_fd() {
        let file = tempfile::tempfile().unwrap();
        assert!(proc_self_fd(&file).starts_with("/proc/self/fd/"));
    }

    #[test]
    fn test_format_mtime() {
        assert_eq!(format_mtime(0), "1970-01-01 00:00");
        assert_eq!(format_mtime(951782400), "2000-02-29 00:00");
        assert_eq!(format_mtime(1700000000), "2023-11-14 22:13");
        assert_eq!(format_mtime(-60), "1969-12-31 23:59");
    }
}
