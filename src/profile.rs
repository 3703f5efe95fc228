//! Mount profiles
//!
//! A profile is an ordered sequence of mount entries in fstab syntax:
//! six whitespace-separated fields, `#` comments and blank lines
//! permitted. Serialization round-trips byte-for-byte for every
//! engine-produced entry.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::entry::{unescape, MountEntry};
use crate::error::{Error, Result};

/// An ordered sequence of mount entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountProfile {
    pub entries: Vec<MountEntry>,
}

impl MountProfile {
    pub fn new(entries: Vec<MountEntry>) -> Self {
        MountProfile { entries }
    }

    /// Parse a profile from fstab text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            entries.push(parse_entry(line)?);
        }
        Ok(MountProfile { entries })
    }

    /// Parse a profile from a reader.
    pub fn read(mut reader: impl Read) -> Result<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| Error::ParseProfile(e.to_string()))?;
        Self::parse(&text)
    }

    /// Load a profile from a file; a missing file is an empty profile.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        match fs::read_to_string(path.as_ref()) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::ParseProfile(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))),
        }
    }

    /// Write the profile to a writer, one entry per line.
    pub fn write(&self, mut writer: impl Write) -> io::Result<()> {
        for entry in &self.entries {
            writeln!(writer, "{entry}")?;
        }
        Ok(())
    }

    /// Save the profile to a file, replacing any previous content.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        fs::write(path, buf)
    }
}

impl fmt::Display for MountProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

fn parse_entry(line: &str) -> Result<MountEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 3 || fields.len() > 6 {
        return Err(Error::ParseProfile(format!(
            "expected between 3 and 6 fields, found {}: {:?}",
            fields.len(),
            line
        )));
    }
    let options = match fields.get(3) {
        None => Vec::new(),
        Some(&"defaults") => Vec::new(),
        Some(opts) => opts.split(',').map(|o| o.to_string()).collect(),
    };
    let parse_num = |field: Option<&&str>| -> Result<u32> {
        match field {
            None => Ok(0),
            Some(v) => v
                .parse()
                .map_err(|_| Error::ParseProfile(format!("cannot parse number {v:?}"))),
        }
    };
    Ok(MountEntry {
        name: unescape(fields[0]),
        dir: unescape(fields[1]),
        fs_type: fields[2].to_string(),
        options,
        dump_frequency: parse_num(fields.get(4))?,
        check_pass: parse_num(fields.get(5))?,
    })
}
