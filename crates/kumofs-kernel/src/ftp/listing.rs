//! `LIST` output parsing.
//!
//! Servers answer `LIST` with free-form text. Two shapes cover nearly every
//! server in the wild:
//!
//! ```text
//! drwxr-xr-x   2 ftp  ftp      4096 Mar 14 09:26 incoming
//! -rw-r--r--   1 ftp  ftp    182044 Nov  2  2023 README.txt
//! lrwxrwxrwx   1 ftp  ftp         7 Jan  5 12:00 latest -> v2.1
//! 03-14-24  09:26AM       <DIR>          incoming
//! 11-02-2023  04:10PM             182044 README.txt
//! ```
//!
//! Lines that match neither (including `total N`) are skipped. Timestamps
//! are read as UTC.

use std::time::SystemTime;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use kumofs_types::{EntryKind, RemoteEntry};

/// Parse a full listing, skipping unrecognised lines.
pub fn parse_listing(text: &str) -> Vec<RemoteEntry> {
    let now = Utc::now();
    text.lines()
        .filter_map(|line| parse_line_at(line, now))
        .collect()
}

/// Parse one listing line.
pub fn parse_line(line: &str) -> Option<RemoteEntry> {
    parse_line_at(line, Utc::now())
}

/// Parse one line, resolving year-less Unix timestamps relative to `now`.
pub fn parse_line_at(line: &str, now: DateTime<Utc>) -> Option<RemoteEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let first = line.chars().next()?;
    if line.starts_with("total ") {
        return None;
    }
    if first.is_ascii_digit() {
        parse_dos(line)
    } else {
        parse_unix(line, now)
    }
}

/// Whitespace-separated tokens with their byte offsets.
fn tokens(line: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                out.push((s, &line[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        out.push((s, &line[s..]));
    }
    out
}

fn parse_unix(line: &str, now: DateTime<Utc>) -> Option<RemoteEntry> {
    let toks = tokens(line);
    let perms = toks.first()?.1;
    if perms.len() < 10 {
        return None;
    }
    let kind = match perms.chars().next()? {
        'd' => EntryKind::Directory,
        'l' => EntryKind::Symlink,
        '-' | 'b' | 'c' | 'p' | 's' => EntryKind::File,
        _ => return None,
    };

    // Owner and group columns vary in count; anchor on "<size> <Mon> <day>".
    let month_at = (2..toks.len().saturating_sub(3)).find(|&i| {
        month_number(toks[i].1).is_some()
            && toks[i + 1].1.parse::<u32>().is_ok()
            && toks[i - 1].1.parse::<u64>().is_ok()
    })?;

    let size = toks[month_at - 1].1.parse::<u64>().ok()?;
    let month = month_number(toks[month_at].1)?;
    let day = toks[month_at + 1].1.parse::<u32>().ok()?;
    let modified = unix_timestamp(month, day, toks[month_at + 2].1, now);

    let raw_name = &line[toks[month_at + 3].0..];
    let (name, link_target) = match kind {
        EntryKind::Symlink => match raw_name.split_once(" -> ") {
            Some((name, target)) => (name, Some(target.to_string())),
            None => (raw_name, None),
        },
        _ => (raw_name, None),
    };

    Some(RemoteEntry {
        name: name.to_string(),
        kind,
        size,
        modified,
        link_target,
    })
}

fn parse_dos(line: &str) -> Option<RemoteEntry> {
    let toks = tokens(line);
    if toks.len() < 4 {
        return None;
    }

    let date_fmt = if toks[0].1.len() == 10 { "%m-%d-%Y" } else { "%m-%d-%y" };
    let date = NaiveDate::parse_from_str(toks[0].1, date_fmt).ok()?;
    let time = NaiveTime::parse_from_str(toks[1].1, "%I:%M%p")
        .or_else(|_| NaiveTime::parse_from_str(toks[1].1, "%H:%M"))
        .ok()?;

    let (kind, size) = if toks[2].1.eq_ignore_ascii_case("<DIR>") {
        (EntryKind::Directory, 0)
    } else {
        (EntryKind::File, toks[2].1.parse::<u64>().ok()?)
    };

    Some(RemoteEntry {
        name: line[toks[3].0..].to_string(),
        kind,
        size,
        modified: Some(SystemTime::from(date.and_time(time).and_utc())),
        link_target: None,
    })
}

fn month_number(token: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    MONTHS
        .iter()
        .position(|m| token.eq_ignore_ascii_case(m))
        .map(|i| i as u32 + 1)
}

/// `HH:MM` means "within the last year"; a bare year means midnight.
fn unix_timestamp(month: u32, day: u32, token: &str, now: DateTime<Utc>) -> Option<SystemTime> {
    let stamp = if token.contains(':') {
        let time = NaiveTime::parse_from_str(token, "%H:%M").ok()?;
        let this_year = NaiveDate::from_ymd_opt(now.year(), month, day)?
            .and_time(time)
            .and_utc();
        if this_year > now + Duration::days(1) {
            NaiveDate::from_ymd_opt(now.year() - 1, month, day)?
                .and_time(time)
                .and_utc()
        } else {
            this_year
        }
    } else {
        let year = token.parse::<i32>().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_opt(0, 0, 0)?
            .and_utc()
    };
    Some(SystemTime::from(stamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> SystemTime {
        SystemTime::from(Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_unix_directory_and_file() {
        let dir = parse_line_at("drwxr-xr-x   2 ftp  ftp      4096 Mar 14 09:26 incoming", now())
            .unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.name, "incoming");
        assert_eq!(dir.modified, Some(at(2024, 3, 14, 9, 26)));

        let file = parse_line_at("-rw-r--r--   1 ftp  ftp    182044 Nov  2  2023 READ ME.txt", now())
            .unwrap();
        assert!(file.is_file());
        assert_eq!(file.size, 182044);
        assert_eq!(file.name, "READ ME.txt");
        assert_eq!(file.modified, Some(at(2023, 11, 2, 0, 0)));
    }

    #[test]
    fn test_unix_future_date_is_last_year() {
        let entry = parse_line_at("-rw-r--r-- 1 ftp ftp 10 Dec 24 18:00 gift", now()).unwrap();
        assert_eq!(entry.modified, Some(at(2023, 12, 24, 18, 0)));
    }

    #[test]
    fn test_unix_symlink_and_missing_group() {
        let link = parse_line_at("lrwxrwxrwx 1 ftp 7 Jan  5 12:00 latest -> v2.1", now()).unwrap();
        assert!(link.is_symlink());
        assert_eq!(link.name, "latest");
        assert_eq!(link.link_target.as_deref(), Some("v2.1"));
    }

    #[test]
    fn test_dos_lines() {
        let dir = parse_line("03-14-24  09:26AM       <DIR>          incoming").unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.name, "incoming");
        assert_eq!(dir.modified, Some(at(2024, 3, 14, 9, 26)));

        let file = parse_line("11-02-2023  04:10PM             182044 README.txt").unwrap();
        assert_eq!(file.size, 182044);
        assert_eq!(file.modified, Some(at(2023, 11, 2, 16, 10)));
    }

    #[test]
    fn test_listing_skips_noise() {
        let text = "total 8\r\n\
                    drwxr-xr-x 2 ftp ftp 4096 Mar 14 09:26 .\r\n\
                    garbage line\r\n\
                    -rw-r--r-- 1 ftp ftp 3 Mar 14 09:26 a.txt\r\n";
        let entries = parse_listing(text);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "a.txt"]);
    }
}
