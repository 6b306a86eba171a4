//! The memory-map reader.
//!
//! Parses `/proc/<pid>/maps` once at session start and picks out the single
//! executable mapping that belongs to this crate's own compiled shared
//! object. That range is what gets handed to the kernel's syscall
//! user-dispatch filter as the "always exempt" region.

use std::fs;

use regex::Regex;
use sysfail_shared::errors::{SysfailError, SysfailResult};

/// One line out of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrRange {
    pub start: usize,
    pub length: usize,
    pub permissions: String,
    pub path: String,
}

impl AddrRange {
    pub fn executable(&self) -> bool {
        self.permissions.contains('x')
    }

    /// vDSO and similar kernel-injected pseudo-mappings show up as
    /// `[bracketed names]` rather than a filesystem path.
    pub fn is_vdso_like(&self) -> bool {
        self.path.starts_with('[') && self.path.ends_with(']')
    }

    /// True for the mapping of this crate's own `libsysfail*.so`, optional
    /// version segments and trailing suffix included (e.g.
    /// `libsysfail.so`, `libsysfail.so.1`, `libsysfail-1.2.3.so`).
    pub fn is_self_text(&self) -> bool {
        self_text_pattern().is_match(&self.path)
    }
}

fn self_text_pattern() -> Regex {
    Regex::new(r"^.*/libsysfail[.0-9]*\.so[.0-9]*$").expect("static regex is valid")
}

/// A parsed memory map, in file order.
#[derive(Debug, Default)]
pub struct Mapping {
    pub ranges: Vec<AddrRange>,
}

impl Mapping {
    /// Return the one executable range identifying this crate's own shared
    /// object. Fails with `MapNotFound` unless exactly one such mapping
    /// exists.
    pub fn self_text(&self) -> SysfailResult<AddrRange> {
        let mut matches = self
            .ranges
            .iter()
            .filter(|r| r.executable() && r.is_self_text());

        let first = matches
            .next()
            .ok_or_else(|| SysfailError::MapNotFound("no libsysfail.so executable mapping found".into()))?
            .clone();

        if matches.next().is_some() {
            return Err(SysfailError::MapNotFound(
                "more than one libsysfail.so executable mapping found".into(),
            ));
        }

        Ok(first)
    }

    /// The vDSO's executable range(s), for diagnostics only — this crate
    /// makes no attempt to arm the filter against them; calls made from
    /// inside the vDSO remain unintercepted, deliberately left unhandled.
    pub fn vdso_ranges(&self) -> Vec<&AddrRange> {
        self.ranges
            .iter()
            .filter(|r| r.executable() && r.is_vdso_like())
            .collect()
    }
}

/// Read and parse `/proc/<pid>/maps`.
pub fn get_mmap(pid: libc::pid_t) -> SysfailResult<Mapping> {
    let path = format!("/proc/{pid}/maps");
    let contents = fs::read_to_string(&path)?;
    Ok(parse_maps(&contents))
}

fn parse_maps(contents: &str) -> Mapping {
    let mut ranges = Vec::new();
    for line in contents.lines() {
        if let Some(range) = parse_line(line) {
            ranges.push(range);
        }
    }
    Mapping { ranges }
}

fn parse_line(line: &str) -> Option<AddrRange> {
    // Format: "start-end perms offset dev inode [pathname]"
    let mut fields = line.splitn(6, char::is_whitespace).filter(|f| !f.is_empty());
    let addr_field = fields.next()?;
    let permissions = fields.next()?.to_string();
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = line
        .splitn(6, char::is_whitespace)
        .nth(5)
        .map(|p| p.trim_start().to_string())
        .unwrap_or_default();

    let (start_str, end_str) = addr_field.split_once('-')?;
    let start = usize::from_str_radix(start_str, 16).ok()?;
    let end = usize::from_str_radix(end_str, 16).ok()?;

    Some(AddrRange {
        start,
        length: end.saturating_sub(start),
        permissions,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55a1b2c00000-55a1b2c01000 r-xp 00000000 08:01 131074                     /usr/bin/cat
7f1234500000-7f1234700000 r-xp 00000000 08:01 262150                     /usr/lib/x86_64-linux-gnu/libsysfail.so.1
7f1234900000-7f1234901000 r--p 00000000 08:01 262151                     /usr/lib/x86_64-linux-gnu/libc.so.6
7ffee0000000-7ffee0001000 r-xp 00000000 00:00 0                          [vdso]
";

    #[test]
    fn parses_every_line() {
        let mapping = parse_maps(SAMPLE);
        assert_eq!(mapping.ranges.len(), 4);
        assert_eq!(mapping.ranges[0].start, 0x55a1b2c00000);
        assert_eq!(mapping.ranges[0].length, 0x1000);
    }

    #[test]
    fn self_text_picks_the_unique_libsysfail_mapping() {
        let mapping = parse_maps(SAMPLE);
        let self_text = mapping.self_text().unwrap();
        assert!(self_text.path.ends_with("libsysfail.so.1"));
    }

    #[test]
    fn self_text_fails_when_absent() {
        let mapping = parse_maps("55a1b2c00000-55a1b2c01000 r-xp 00000000 08:01 131074 /usr/bin/cat\n");
        assert!(mapping.self_text().is_err());
    }

    #[test]
    fn self_text_fails_on_ambiguity() {
        let doubled = format!("{SAMPLE}{}", SAMPLE.lines().nth(1).unwrap());
        let mapping = parse_maps(&doubled);
        assert!(mapping.self_text().is_err());
    }

    #[test]
    fn vdso_range_is_recognised_but_excluded_from_self_text() {
        let mapping = parse_maps(SAMPLE);
        assert_eq!(mapping.vdso_ranges().len(), 1);
    }
}
