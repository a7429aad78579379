//! Decoders for the two text formats the remote agent prints.
//!
//! General metrics, one line of 16 comma-separated fields:
//!
//! ```text
//! arch,os,pcpu,vcpu,ramUsed/ramTotal,ramPct,diskUsed/diskTotal,diskPct%,load1,load5,load15,lastBoot,tcp,users,vnc,ssh
//! ```
//!
//! Top users, one whitespace-separated `user cpu mem disk` row per line, where
//! `disk` may be the literal token `nan`.
//!
//! Both decoders are pure and all-or-nothing.

use std::str::FromStr;

use crate::error::ParseError;
use crate::types::{MetricsRecord, TopUserEntry, UsageRatio};

pub const METRICS_FIELD_COUNT: usize = 16;
pub const TOP_USERS_FIELD_COUNT: usize = 4;

/// Only the top-users disk column gets this fallback.
const DISK_NAN_TOKEN: &str = "nan";

pub fn decode_metrics_record(line: &str) -> Result<MetricsRecord, ParseError> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(',').collect();
    if fields.len() != METRICS_FIELD_COUNT {
        return Err(ParseError::FieldCountMismatch {
            expected: METRICS_FIELD_COUNT,
            found: fields.len(),
            line: 1,
        });
    }

    let disk_pct = fields[7].trim();
    let disk_pct = disk_pct.strip_suffix('%').unwrap_or(disk_pct);

    Ok(MetricsRecord {
        architecture: fields[0].to_string(),
        operating_system: fields[1].to_string(),
        physical_cpus: parse_count("physical_cpus", fields[2])?,
        virtual_cpus: parse_count("virtual_cpus", fields[3])?,
        ram: parse_ratio("ram", fields[4])?,
        ram_percentage: parse_percentage("ram_percentage", fields[5])?,
        disk: parse_ratio("disk", fields[6])?,
        disk_percentage: parse_percentage("disk_percentage", disk_pct)?,
        load_1min: parse_decimal("load_1min", fields[8])?,
        load_5min: parse_decimal("load_5min", fields[9])?,
        load_15min: parse_decimal("load_15min", fields[10])?,
        last_boot: fields[11].to_string(),
        tcp_connections: parse_count("tcp_connections", fields[12])?,
        logged_users: parse_count("logged_users", fields[13])?,
        active_vnc_users: parse_count("active_vnc_users", fields[14])?,
        active_ssh_users: parse_count("active_ssh_users", fields[15])?,
    })
}

/// Inverse of [`decode_metrics_record`].
pub fn encode_metrics_record(m: &MetricsRecord) -> String {
    format!(
        "{},{},{},{},{}/{},{},{}/{},{}%,{},{},{},{},{},{},{},{}",
        m.architecture,
        m.operating_system,
        m.physical_cpus,
        m.virtual_cpus,
        m.ram.used,
        m.ram.total,
        m.ram_percentage,
        m.disk.used,
        m.disk.total,
        m.disk_percentage,
        m.load_1min,
        m.load_5min,
        m.load_15min,
        m.last_boot,
        m.tcp_connections,
        m.logged_users,
        m.active_vnc_users,
        m.active_ssh_users,
    )
}

/// Blank lines are skipped. Any malformed row fails the whole table.
pub fn decode_top_users_table(text: &str) -> Result<Vec<TopUserEntry>, ParseError> {
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [user, cpu, mem, disk] = tokens[..] else {
            return Err(ParseError::FieldCountMismatch {
                expected: TOP_USERS_FIELD_COUNT,
                found: tokens.len(),
                line: idx + 1,
            });
        };
        let disk = if disk == DISK_NAN_TOKEN {
            0.0
        } else {
            parse_decimal("disk", disk)?
        };
        entries.push(TopUserEntry {
            user: user.to_string(),
            cpu: parse_decimal("cpu", cpu)?,
            mem: parse_decimal("mem", mem)?,
            disk,
        });
    }
    Ok(entries)
}

fn parse_ratio(field: &'static str, raw: &str) -> Result<UsageRatio, ParseError> {
    let mut parts = raw.split('/');
    let (Some(used), Some(total), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ParseError::MalformedRatio {
            field,
            value: raw.to_string(),
        });
    };
    Ok(UsageRatio {
        used: used.to_string(),
        total: total.to_string(),
    })
}

fn parse_number<T: FromStr>(field: &'static str, raw: &str) -> Result<T, ParseError> {
    raw.trim().parse::<T>().map_err(|_| ParseError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

fn parse_count(field: &'static str, raw: &str) -> Result<u32, ParseError> {
    parse_number(field, raw)
}

// Out-of-range values are rejected, never clamped.
fn parse_percentage(field: &'static str, raw: &str) -> Result<u8, ParseError> {
    let value: i64 = parse_number(field, raw)?;
    u8::try_from(value)
        .ok()
        .filter(|v| *v <= 100)
        .ok_or(ParseError::OutOfRange { field, value })
}

// `f64::from_str` accepts "nan" and "inf"; those are not numbers here.
fn parse_decimal(field: &'static str, raw: &str) -> Result<f64, ParseError> {
    let value: f64 = parse_number(field, raw)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ParseError::InvalidNumber {
            field,
            value: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "x86_64,Linux,2,4,1G/2G,50,10G/20G,50%,0.1,0.2,0.3,boot,5,1,0,0";

    #[test]
    fn decodes_well_formed_line() {
        let m = decode_metrics_record(SAMPLE).unwrap();
        assert_eq!(m.architecture, "x86_64");
        assert_eq!(m.operating_system, "Linux");
        assert_eq!((m.physical_cpus, m.virtual_cpus), (2, 4));
        assert_eq!(m.ram.used, "1G");
        assert_eq!(m.ram.total, "2G");
        assert_eq!(m.ram_percentage, 50);
        assert_eq!(m.disk.used, "10G");
        assert_eq!(m.disk.total, "20G");
        assert_eq!(m.disk_percentage, 50);
        assert_eq!((m.load_1min, m.load_5min, m.load_15min), (0.1, 0.2, 0.3));
        assert_eq!(m.last_boot, "boot");
        assert_eq!(m.tcp_connections, 5);
        assert_eq!(m.logged_users, 1);
        assert_eq!((m.active_vnc_users, m.active_ssh_users), (0, 0));
    }

    #[test]
    fn last_boot_is_kept_verbatim() {
        let line = "aarch64,Ubuntu 22.04.4 LTS,1,8,3.1Gi/15Gi,20,40G/100G,40%,1.50,1.20,0.90,2024-05-01 07:13,42,3,1,2";
        let m = decode_metrics_record(line).unwrap();
        assert_eq!(m.last_boot, "2024-05-01 07:13");
        assert_eq!(m.operating_system, "Ubuntu 22.04.4 LTS");
        assert_eq!(m.ram.total, "15Gi");
    }

    #[test]
    fn field_count_mismatch() {
        let short = SAMPLE.rsplit_once(',').unwrap().0;
        assert!(matches!(
            decode_metrics_record(short),
            Err(ParseError::FieldCountMismatch { expected: 16, found: 15, .. })
        ));
        let long = format!("{SAMPLE},extra");
        assert!(matches!(
            decode_metrics_record(&long),
            Err(ParseError::FieldCountMismatch { found: 17, .. })
        ));
        assert!(matches!(
            decode_metrics_record(""),
            Err(ParseError::FieldCountMismatch { found: 1, .. })
        ));
    }

    #[test]
    fn ratio_without_slash_is_rejected() {
        let line = SAMPLE.replace("1G/2G", "1G-2G");
        assert_eq!(
            decode_metrics_record(&line),
            Err(ParseError::MalformedRatio {
                field: "ram",
                value: "1G-2G".into()
            })
        );
    }

    #[test]
    fn ratio_with_extra_slash_is_rejected() {
        let line = SAMPLE.replace("1G/2G", "1G/2G/3G");
        assert_eq!(
            decode_metrics_record(&line),
            Err(ParseError::MalformedRatio {
                field: "ram",
                value: "1G/2G/3G".into()
            })
        );
        let line = SAMPLE.replace("10G/20G", "10G/20G/30G");
        assert_eq!(
            decode_metrics_record(&line),
            Err(ParseError::MalformedRatio {
                field: "disk",
                value: "10G/20G/30G".into()
            })
        );
    }

    #[test]
    fn non_numeric_count_names_the_field() {
        let line = SAMPLE.replace(",boot,5,", ",boot,many,");
        assert_eq!(
            decode_metrics_record(&line),
            Err(ParseError::InvalidNumber {
                field: "tcp_connections",
                value: "many".into()
            })
        );
    }

    #[test]
    fn load_average_must_be_finite() {
        let line = SAMPLE.replace("0.1,0.2", "nan,0.2");
        assert!(matches!(
            decode_metrics_record(&line),
            Err(ParseError::InvalidNumber { field: "load_1min", .. })
        ));
    }

    #[test]
    fn percentages_out_of_range_are_rejected() {
        let line = SAMPLE.replace("1G/2G,50,", "1G/2G,101,");
        assert_eq!(
            decode_metrics_record(&line),
            Err(ParseError::OutOfRange {
                field: "ram_percentage",
                value: 101
            })
        );
        let line = SAMPLE.replace("50%", "-1%");
        assert_eq!(
            decode_metrics_record(&line),
            Err(ParseError::OutOfRange {
                field: "disk_percentage",
                value: -1
            })
        );
        let line = SAMPLE.replace("1G/2G,50,10G/20G,50%", "1G/2G,0,10G/20G,100%");
        let m = decode_metrics_record(&line).unwrap();
        assert_eq!((m.ram_percentage, m.disk_percentage), (0, 100));
    }

    #[test]
    fn nan_is_not_tolerated_in_metrics_disk_percentage() {
        let line = SAMPLE.replace("50%", "nan%");
        assert!(matches!(
            decode_metrics_record(&line),
            Err(ParseError::InvalidNumber { field: "disk_percentage", .. })
        ));
    }

    #[test]
    fn encode_round_trips_ratios_and_percentages() {
        let lines = [
            SAMPLE,
            "x86_64,Linux,2,4,1G/2G,50,10G/20G,50,0.1,0.2,0.3,boot,5,1,0,0",
            "x86_64,Linux,1,1,0/2G,0,0/20G,0%,0,0,0,boot,0,0,0,0",
            "x86_64,Linux,1,1,2G/2G,100,20G/20G,100%,9.99,8.5,7,boot,1,1,1,1",
            "aarch64,Ubuntu 22.04.4 LTS,1,8,3.1Gi/15Gi,20,512M/1.5G,33%,1.50,1.20,0.90,2024-05-01 07:13,42,3,1,2",
            "x86_64,Red Hat Enterprise Linux 9,128,256,1.2T/2T,61,9.8T/12T,82%,64.25,60,58.75,up 400 days,4294967295,1000,250,4000",
        ];
        for original in lines {
            let m = decode_metrics_record(original).unwrap();
            let again = decode_metrics_record(&encode_metrics_record(&m)).unwrap();
            assert_eq!(again.ram, m.ram, "{original}");
            assert_eq!(again.disk, m.disk, "{original}");
            assert_eq!(again.ram_percentage, m.ram_percentage, "{original}");
            assert_eq!(again.disk_percentage, m.disk_percentage, "{original}");
            assert_eq!(again, m, "{original}");
        }
    }

    #[test]
    fn top_users_with_nan_disk() {
        let rows = decode_top_users_table("alice 10.5 20.1 nan\nbob 5.0 3.2 1.1\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user, "alice");
        assert_eq!(rows[0].cpu, 10.5);
        assert_eq!(rows[0].mem, 20.1);
        assert_eq!(rows[0].disk, 0.0);
        assert_eq!(rows[1].user, "bob");
        assert_eq!(rows[1].disk, 1.1);
    }

    #[test]
    fn top_users_skips_blank_lines() {
        let rows = decode_top_users_table("\n  \nalice 1 2 3\n\t\nbob 4 5 6").unwrap();
        let users: Vec<_> = rows.iter().map(|r| r.user.as_str()).collect();
        assert_eq!(users, ["alice", "bob"]);
        assert!(decode_top_users_table("").unwrap().is_empty());
    }

    #[test]
    fn top_users_malformed_line_fails_whole_table() {
        let text = "alice 10.5 20.1 nan\nbob 5.0 3.2 1.1\ncarl 1.0 2.0\n";
        assert_eq!(
            decode_top_users_table(text),
            Err(ParseError::FieldCountMismatch {
                expected: 4,
                found: 3,
                line: 3
            })
        );
    }

    #[test]
    fn top_users_nan_only_allowed_for_disk() {
        assert!(matches!(
            decode_top_users_table("alice nan 1.0 1.0"),
            Err(ParseError::InvalidNumber { field: "cpu", .. })
        ));
        assert!(matches!(
            decode_top_users_table("alice 1.0 1.0 NaN"),
            Err(ParseError::InvalidNumber { field: "disk", .. })
        ));
        assert!(matches!(
            decode_top_users_table("alice 1.0 x 1.0"),
            Err(ParseError::InvalidNumber { field: "mem", .. })
        ));
    }
}
