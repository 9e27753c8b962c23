//! Newtypes that format in a useful way with `Debug`, `Display` or
//! `Valuable`, typically as a human-readable string.
//!
//! They also keep byte counts, rates and hashes from being mixed up with
//! plain integers and strings.

use anyhow::{bail, Context};
use crate::Result;
use sha1::{Digest, Sha1};
use std::{
    fmt::{Debug, Display, Write},
    result::Result as StdResult,
    time::Duration as StdDuration,
};
use valuable::{Fields, NamedField, NamedValues, Structable, StructDef, Valuable, Value, Visit};

/// A SHA1 hash stored as 20 bytes, formatted as a lower case hex string.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Sha1Hash(pub [u8; 20]);

/// A number of bytes, formatted with `Display` like "12.53 MiB".
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub struct Bytes(pub u64);

/// Bytes per second, formatted with `Display` like "12.53 MiB/s".
#[derive(Clone, Copy)]
pub struct ByteRate(pub f64);

/// A `std::time::Duration` formatted like "1h 2m 1s 10ms".
#[derive(Clone, Copy)]
pub struct Duration(pub StdDuration);

#[derive(Clone, Debug, Valuable)]
pub struct TransferStats {
    /// Bytes transferred.
    pub len: Bytes,

    pub duration: Duration,

    pub rate: ByteRate,
}

#[allow(dead_code)] // Used in tests.
const MS:     StdDuration = StdDuration::from_millis(1);
#[allow(dead_code)] // Used in tests.
const SECOND: StdDuration = StdDuration::from_secs(1);
const MINUTE: StdDuration = StdDuration::from_secs(60);
const HOUR:   StdDuration = StdDuration::from_secs(60 * 60);

impl Sha1Hash {
    /// Parse a hex string as found in dump status files. Case insensitive.
    pub fn from_hex(s: &str) -> Result<Sha1Hash> {
        if s.len() != 40 {
            bail!("SHA1 hex string must be 40 characters long len={len} s='{s}'",
                  len = s.len());
        }
        let mut bytes = [0_u8; 20];
        hex::decode_to_slice(s, &mut bytes)
            .with_context(|| format!("while decoding SHA1 hex string s='{s}'"))?;
        Ok(Sha1Hash(bytes))
    }

    pub fn calculate_from_bytes(s: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(s);
        Sha1Hash(hasher.finalize().into())
    }
}

impl Debug for Sha1Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Sha1Hash({self})")
    }
}

impl Display for Sha1Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&*hex::encode(self.0))
    }
}

impl serde::Serialize for Sha1Hash {
    fn serialize<S>(&self, serializer: S) -> StdResult<S::Ok, S::Error>
        where S: serde::Serializer
    {
        serializer.collect_str(self)
    }
}

impl Debug for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Bytes({num} = {pretty})", num = self.0, pretty = bytes(self.0))
    }
}

impl Display for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.pad(&*bytes(self.0))
    }
}

impl Bytes {
    const FIELDS: &'static [NamedField<'static>] = &[
        NamedField::new("int"),
        NamedField::new("str"),
    ];
}

impl Valuable for Bytes {
    fn as_value(&self) -> Value<'_> {
        Value::Structable(self)
    }

    fn visit(&self, visit: &mut dyn Visit) {
        let s = bytes(self.0);
        visit.visit_named_fields(
            &NamedValues::new(Self::FIELDS, &[Value::U64(self.0), Value::String(&*s)]))
    }
}

impl Structable for Bytes {
    fn definition(&self) -> StructDef<'_> {
        StructDef::new_static("Bytes", Fields::Named(Self::FIELDS))
    }
}

impl serde::Serialize for Bytes {
    fn serialize<S>(&self, serializer: S) -> StdResult<S::Ok, S::Error>
        where S: serde::Serializer
    {
        valuable_serde::Serializable::new(self).serialize(serializer)
    }
}

impl ByteRate {
    const FIELDS: &'static [NamedField<'static>] = &[
        NamedField::new("float"),
        NamedField::new("str"),
    ];

    pub fn new(len: Bytes, duration: StdDuration) -> ByteRate {
        let secs = duration.as_secs_f64();
        if secs.abs() < f64::EPSILON {
            ByteRate(0.)
        } else {
            ByteRate((len.0 as f64) / secs)
        }
    }
}

impl Debug for ByteRate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ByteRate({num:.0} = {pretty})", num = self.0, pretty = bytes_per_second(self.0))
    }
}

impl Display for ByteRate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.pad(&*bytes_per_second(self.0))
    }
}

impl Valuable for ByteRate {
    fn as_value(&self) -> Value<'_> {
        Value::Structable(self)
    }

    fn visit(&self, visit: &mut dyn Visit) {
        let s = bytes_per_second(self.0);
        visit.visit_named_fields(
            &NamedValues::new(Self::FIELDS, &[Value::F64(self.0), Value::String(&*s)]))
    }
}

impl Structable for ByteRate {
    fn definition(&self) -> StructDef<'_> {
        StructDef::new_static("ByteRate", Fields::Named(Self::FIELDS))
    }
}

impl TransferStats {
    pub fn new(len: Bytes, duration: StdDuration) -> TransferStats {
        TransferStats {
            len,
            duration: Duration(duration),
            rate: ByteRate::new(len, duration),
        }
    }
}

impl Display for TransferStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{len} in {duration} ({rate})",
               len = self.len, duration = self.duration, rate = self.rate)
    }
}

impl serde::Serialize for TransferStats {
    fn serialize<S>(&self, serializer: S) -> StdResult<S::Ok, S::Error>
        where S: serde::Serializer
    {
        valuable_serde::Serializable::new(self).serialize(serializer)
    }
}

impl Debug for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let dur: StdDuration = self.0;
        let mut secs = dur.as_secs();
        let mut out = String::new();

        if secs >= HOUR.as_secs() {
            write!(out, "{}h", secs / HOUR.as_secs())?;
            secs %= HOUR.as_secs();
        }

        if secs >= MINUTE.as_secs() {
            write!(out, " {}m", secs / MINUTE.as_secs())?;
            secs %= MINUTE.as_secs();
        }

        if secs > 0 {
            write!(out, " {secs}s")?;
        }

        let ms = dur.subsec_millis();
        if ms > 0 || out.is_empty() {
            write!(out, " {ms}ms")?;
        }

        f.pad(out.trim_start())
    }
}

impl Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Duration {
    const FIELDS: &'static [NamedField<'static>] = &[
        NamedField::new("secs"),
        NamedField::new("nanos"),
        NamedField::new("str"),
    ];
}

impl Valuable for Duration {
    fn as_value(&self) -> Value<'_> {
        Value::Structable(self)
    }

    fn visit(&self, visit: &mut dyn Visit) {
        let s = self.to_string();
        visit.visit_named_fields(
            &NamedValues::new(
                Self::FIELDS,
                &[Value::U64(self.0.as_secs()),
                  Value::U32(self.0.subsec_nanos()),
                  Value::String(&*s)]))
    }
}

impl Structable for Duration {
    fn definition(&self) -> StructDef<'_> {
        StructDef::new_static("Duration", Fields::Named(Self::FIELDS))
    }
}

pub fn bytes(len: u64) -> String {
    human_format::Formatter::new()
        .with_scales(human_format::Scales::Binary())
        .with_decimals(2)
        .with_units("B")
        .format(len as f64)
}

pub fn bytes_per_second(rate: f64) -> String {
    human_format::Formatter::new()
        .with_scales(human_format::Scales::Binary())
        .with_decimals(2)
        .with_units("B/s")
        .format(rate)
}

#[cfg(test)]
mod tests {
    use super::{Bytes, Duration, Sha1Hash, TransferStats, MS, SECOND, MINUTE, HOUR};

    #[test]
    fn duration_formatting() {
        let cases = &[
            (SECOND * 3,                                   "3s"           ),
            (MS * 333,                                     "333ms"        ),
            (SECOND + MS * 333,                            "1s 333ms"     ),
            (MINUTE * 2 + SECOND,                          "2m 1s"        ),
            (HOUR + MINUTE * 2 + SECOND + MS * 10,         "1h 2m 1s 10ms"),
            (std::time::Duration::ZERO,                    "0ms"          ),
        ];

        for (input, expected) in cases.iter() {
            assert_eq!(&*Duration(*input).to_string(), *expected, "input={input:?}");
        }
    }

    #[test]
    fn duration_padding() {
        let dur = Duration(SECOND * 2);
        assert_eq!(&*format!("{dur:>6}"), "    2s");
    }

    #[test]
    fn sha1_from_hex() {
        let hash = Sha1Hash::calculate_from_bytes(b"abc");
        let hex = "a9993e364706816aba3e25717850c26c9cd0d89d";
        assert_eq!(hash.to_string(), hex);
        assert_eq!(Sha1Hash::from_hex(hex).unwrap(), hash);
        assert_eq!(Sha1Hash::from_hex(&*hex.to_uppercase()).unwrap(), hash);

        assert!(Sha1Hash::from_hex("a999").is_err());
        assert!(Sha1Hash::from_hex(&*"zz".repeat(20)).is_err());
    }

    #[test]
    fn bytes_json() {
        let json = serde_json::to_value(Bytes(2048)).unwrap();
        assert_eq!(json["int"], 2048);
        assert!(json["str"].as_str().unwrap().contains("KiB"));

        let stats = serde_json::to_value(TransferStats::new(Bytes(10), SECOND)).unwrap();
        assert_eq!(stats["len"]["int"], 10);
    }
}
