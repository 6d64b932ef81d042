//! Data mapper
//!
//! Projects backend values into the embedded engine's five storage classes
//! and back:
//!
//! | Backend family | Storage class |
//! |---|---|
//! | integers of any width, booleans | INTEGER |
//! | floats, decimals declared within the text threshold | REAL |
//! | wider or unconstrained decimals, character types, temporal types, UUID, JSON, unknown types | TEXT |
//! | binary types | BLOB |
//!
//! Temporal values travel as canonical UTC text. Naive backend timestamps are
//! interpreted in the configured backend zone; [`DataMapper::display`] renders
//! in the display zone only at the boundary.

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use encoding_rs::{Encoding, UTF_8};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::security::{validate_sql_identifier, validate_sql_type_name};
use crate::types::{ColumnMetadata, TableMetadata, Value};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIMESTAMP_MICROS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Storage class of an embedded value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    /// NULL
    Null,
    /// 64-bit signed integer
    Integer,
    /// 64-bit float
    Real,
    /// UTF-8 text
    Text,
    /// Bytes, stored exactly as given
    Blob,
}

impl StorageClass {
    /// Declared type that gives a column this class as its affinity
    pub const fn declared_type(self) -> &'static str {
        match self {
            Self::Null | Self::Blob => "BLOB",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            other => write!(f, "{}", other.declared_type()),
        }
    }
}

/// A value as the embedded engine sees it
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL
    Null,
    /// INTEGER
    Integer(i64),
    /// REAL
    Real(f64),
    /// TEXT
    Text(String),
    /// BLOB
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Storage class of the value
    pub const fn storage_class(&self) -> StorageClass {
        match self {
            Self::Null => StorageClass::Null,
            Self::Integer(_) => StorageClass::Integer,
            Self::Real(_) => StorageClass::Real,
            Self::Text(_) => StorageClass::Text,
            Self::Blob(_) => StorageClass::Blob,
        }
    }

    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer payload
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Text payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Family of a backend column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeFamily {
    /// BOOLEAN, BIT, TINYINT(1)
    Boolean,
    /// Integers of any width
    Integer,
    /// Binary floating point
    Float,
    /// Fixed-point NUMERIC/DECIMAL/MONEY
    Decimal,
    /// Character data
    Character,
    /// Binary data
    Binary,
    /// DATE
    Date,
    /// TIME
    Time,
    /// Timestamp without zone
    Timestamp,
    /// Timestamp with zone
    TimestampTz,
    /// UUID / UNIQUEIDENTIFIER
    Uuid,
    /// JSON / JSONB
    Json,
    /// Anything else, surfaced as text
    Unknown,
}

/// A normalized backend column type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderType {
    /// Lowercase base type name, e.g. `character varying`
    pub name: String,
    /// Type family
    pub family: TypeFamily,
    /// Declared length of character/binary types
    pub length: Option<u32>,
    /// Declared precision of numeric types
    pub precision: Option<u32>,
    /// Declared scale of numeric types
    pub scale: Option<u32>,
    /// UNSIGNED modifier
    pub unsigned: bool,
    /// Storage width of integer and float types in bytes
    pub width: Option<u8>,
    /// Character set of character types
    pub charset: Option<String>,
}

impl ProviderType {
    /// Normalize a backend type name such as `DECIMAL(10,2) UNSIGNED`,
    /// `varchar(40) CHARACTER SET latin1` or `timestamp with time zone`
    pub fn parse(type_name: &str) -> Self {
        let lower = type_name.trim().to_ascii_lowercase();

        let (mut rest, charset) = match lower
            .find(" character set ")
            .map(|at| (at, " character set ".len()))
            .or_else(|| lower.find(" charset ").map(|at| (at, " charset ".len())))
        {
            Some((at, len)) => {
                let charset = lower[at + len..]
                    .split_whitespace()
                    .next()
                    .map(str::to_string);
                (lower[..at].to_string(), charset)
            }
            None => (lower.clone(), None),
        };

        let args = match (rest.find('('), rest.rfind(')')) {
            (Some(open), Some(close)) if close > open => {
                let args: Vec<String> = rest[open + 1..close]
                    .split(',')
                    .map(|a| a.trim().to_string())
                    .collect();
                rest = format!("{} {}", &rest[..open], &rest[close + 1..]);
                args
            }
            _ => Vec::new(),
        };

        let mut unsigned = false;
        let words: Vec<&str> = rest
            .split_whitespace()
            .filter(|w| match *w {
                "unsigned" => {
                    unsigned = true;
                    false
                }
                "signed" | "zerofill" | "identity" => false,
                _ => true,
            })
            .collect();
        let name = words.join(" ");
        let first_arg = args.first().and_then(|a| a.parse::<u32>().ok());
        let second_arg = args.get(1).and_then(|a| a.parse::<u32>().ok());

        let (family, width) = classify(&name, first_arg);
        let mut ty = Self {
            name,
            family,
            length: None,
            precision: None,
            scale: None,
            unsigned,
            width,
            charset,
        };
        match family {
            TypeFamily::Decimal => {
                ty.precision = first_arg;
                ty.scale = second_arg.or(first_arg.map(|_| 0));
            }
            TypeFamily::Character | TypeFamily::Binary => ty.length = first_arg,
            _ => {}
        }
        ty
    }

    /// Build from introspection metadata, which may carry precision, scale,
    /// length and charset separately from the type name
    pub fn from_column(column: &ColumnMetadata) -> Self {
        let mut ty = Self::parse(&column.type_name);
        match ty.family {
            TypeFamily::Decimal => {
                ty.precision = ty.precision.or(column.precision);
                ty.scale = ty.scale.or(column.scale);
            }
            TypeFamily::Character | TypeFamily::Binary => {
                ty.length = ty.length.or(column.max_length);
            }
            _ => {}
        }
        if ty.charset.is_none() {
            ty.charset = column.charset.clone();
        }
        ty
    }

    /// Storage class values of this type surface as
    pub fn storage_class(&self, decimal_text_threshold: u32) -> StorageClass {
        match self.family {
            TypeFamily::Boolean | TypeFamily::Integer => StorageClass::Integer,
            TypeFamily::Float => StorageClass::Real,
            // Unconstrained decimals may carry any number of digits
            TypeFamily::Decimal => match self.precision {
                Some(p) if p <= decimal_text_threshold => StorageClass::Real,
                _ => StorageClass::Text,
            },
            TypeFamily::Binary => StorageClass::Blob,
            TypeFamily::Character
            | TypeFamily::Date
            | TypeFamily::Time
            | TypeFamily::Timestamp
            | TypeFamily::TimestampTz
            | TypeFamily::Uuid
            | TypeFamily::Json
            | TypeFamily::Unknown => StorageClass::Text,
        }
    }
}

fn classify(name: &str, first_arg: Option<u32>) -> (TypeFamily, Option<u8>) {
    use TypeFamily::*;
    match name {
        "bool" | "boolean" => (Boolean, Some(1)),
        "bit" if first_arg.map_or(true, |n| n == 1) => (Boolean, Some(1)),
        "tinyint" if first_arg == Some(1) => (Boolean, Some(1)),
        "tinyint" | "int1" => (Integer, Some(1)),
        "smallint" | "int2" | "smallserial" | "serial2" => (Integer, Some(2)),
        "mediumint" | "int" | "integer" | "int4" | "serial" | "serial4" | "int3" => {
            (Integer, Some(4))
        }
        "bigint" | "int8" | "bigserial" | "serial8" | "oid" => (Integer, Some(8)),
        "year" => (Integer, Some(2)),
        "real" | "float4" => (Float, Some(4)),
        "float" => match first_arg {
            Some(p) if p <= 24 => (Float, Some(4)),
            _ => (Float, Some(8)),
        },
        "double" | "double precision" | "float8" => (Float, Some(8)),
        "numeric" | "decimal" | "dec" | "fixed" | "money" | "smallmoney" | "number" => {
            (Decimal, None)
        }
        "char" | "character" | "varchar" | "character varying" | "nchar" | "nvarchar"
        | "national character" | "national character varying" | "bpchar" | "text"
        | "tinytext" | "mediumtext" | "longtext" | "ntext" | "citext" | "name" | "enum"
        | "set" | "xml" | "sysname" => (Character, None),
        "bytea" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary"
        | "image" | "rowversion" => (Binary, None),
        "date" => (Date, None),
        "time" | "time without time zone" | "timetz" | "time with time zone" => (Time, None),
        "timestamp" | "timestamp without time zone" | "datetime" | "datetime2"
        | "smalldatetime" => (Timestamp, None),
        "timestamptz" | "timestamp with time zone" | "datetimeoffset" => (TimestampTz, None),
        "uuid" | "uniqueidentifier" => (Uuid, None),
        "json" | "jsonb" => (Json, None),
        _ => (Unknown, None),
    }
}

/// Resolve a backend character set name to an encoder/decoder
pub fn encoding_for(charset: &str) -> Result<&'static Encoding> {
    let lower = charset.trim().to_ascii_lowercase();
    let label = match lower.as_str() {
        "utf8" | "utf8mb3" | "utf8mb4" | "utf-8" | "unicode" | "sql_ascii" | "ascii" => {
            return Ok(UTF_8)
        }
        "latin1" | "cp1252" => "windows-1252",
        "latin2" => "iso-8859-2",
        "latin5" => "iso-8859-9",
        "latin7" => "iso-8859-13",
        "greek" => "iso-8859-7",
        "hebrew" => "iso-8859-8",
        "koi8r" => "koi8-r",
        "koi8u" => "koi8-u",
        "sjis" | "cp932" => "shift_jis",
        "ujis" | "eucjpms" | "euc_jp" => "euc-jp",
        "euckr" | "euc_kr" => "euc-kr",
        "gb2312" | "gbk" => "gbk",
        "gb18030" => "gb18030",
        "big5" => "big5",
        win if win.starts_with("win") && win.len() == 7 => {
            return Encoding::for_label(format!("windows-{}", &win[3..]).as_bytes())
                .ok_or_else(|| unknown_charset(charset));
        }
        other if other.starts_with("cp125") => {
            return Encoding::for_label(format!("windows-{}", &other[2..]).as_bytes())
                .ok_or_else(|| unknown_charset(charset));
        }
        other => other,
    };
    match Encoding::for_label(label.as_bytes()) {
        // encoding_rs encodes UTF-16 as UTF-8, which would corrupt writes
        Some(enc) if enc.output_encoding() != enc => Err(unknown_charset(charset)),
        Some(enc) => Ok(enc),
        None => Err(unknown_charset(charset)),
    }
}

fn unknown_charset(charset: &str) -> Error {
    Error::type_conversion(format!("unsupported character set '{}'", charset))
}

fn decode_text(bytes: &[u8], charset: Option<&str>) -> Result<String> {
    let encoding = charset.map_or(Ok(UTF_8), encoding_for)?;
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|s| s.into_owned())
        .ok_or_else(|| {
            Error::type_conversion(format!("text is not valid {}", encoding.name()))
        })
}

fn encode_text(text: &str, charset: Option<&str>) -> Result<Value> {
    let encoding = charset.map_or(Ok(UTF_8), encoding_for)?;
    if encoding == UTF_8 {
        return Ok(Value::String(text.to_string()));
    }
    let (bytes, _, unmappable) = encoding.encode(text);
    if unmappable {
        return Err(Error::type_conversion(format!(
            "text contains characters not representable in {}",
            encoding.name()
        )));
    }
    Ok(Value::Bytes(bytes.into_owned()))
}

/// Canonical text of a timestamp, microseconds only when present
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    if ts.nanosecond() == 0 {
        ts.format(TIMESTAMP_FORMAT).to_string()
    } else {
        ts.format(TIMESTAMP_MICROS_FORMAT).to_string()
    }
}

fn format_time(t: &NaiveTime) -> String {
    if t.nanosecond() == 0 {
        t.format("%H:%M:%S").to_string()
    } else {
        t.format("%H:%M:%S%.6f").to_string()
    }
}

/// Parse timestamp text, returning the naive part and its explicit offset
fn parse_timestamp(text: &str) -> Option<(NaiveDateTime, Option<FixedOffset>)> {
    let text = text.trim();
    if let Some(utc) = text.strip_suffix(['Z', 'z']) {
        return parse_naive_timestamp(utc).map(|ts| (ts, FixedOffset::east_opt(0)));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some((ts.naive_local(), Some(*ts.offset())));
        }
    }
    parse_naive_timestamp(text).map(|ts| (ts, None))
}

fn parse_naive_timestamp(text: &str) -> Option<NaiveDateTime> {
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .ok()
}

fn conversion_error(value: &impl fmt::Debug, ty: &ProviderType) -> Error {
    Error::type_conversion(format!("cannot convert {:?} to {}", value, ty.name))
}

fn integer_from_value(value: &Value) -> Result<i64> {
    match value {
        Value::UInt64(n) => i64::try_from(*n).map_err(|_| {
            Error::type_conversion(format!("{} does not fit a 64-bit signed integer", n))
        }),
        Value::Float32(_) | Value::Float64(_) => {
            let f = value.as_f64().unwrap_or(f64::NAN);
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                Ok(f as i64)
            } else {
                Err(Error::type_conversion(format!("{} is not an integer", f)))
            }
        }
        other => other
            .as_i64()
            .ok_or_else(|| Error::type_conversion(format!("{:?} is not an integer", other))),
    }
}

fn decimal_from_text(text: &str) -> Option<Decimal> {
    let text = text.trim();
    text.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(text).ok())
}

/// Shortest decimal that reads back as `f`
fn decimal_from_f64(f: f64) -> Option<Decimal> {
    if !f.is_finite() {
        return None;
    }
    decimal_from_text(&f.to_string()).or_else(|| Decimal::from_f64_retain(f))
}

fn significant_digits(d: &Decimal) -> u32 {
    let mantissa = d.mantissa().unsigned_abs();
    if mantissa == 0 {
        1
    } else {
        mantissa.ilog10() + 1
    }
}

/// Converts between backend values and storage classes
#[derive(Debug, Clone)]
pub struct DataMapper {
    backend_zone: Tz,
    display_zone: Option<Tz>,
    decimal_text_threshold: u32,
}

impl Default for DataMapper {
    fn default() -> Self {
        Self {
            backend_zone: Tz::UTC,
            display_zone: None,
            decimal_text_threshold: 15,
        }
    }
}

impl DataMapper {
    /// Create a mapper from bridge configuration
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        Ok(Self {
            backend_zone: config.backend_zone()?,
            display_zone: config.display_zone()?,
            decimal_text_threshold: config.decimal_text_threshold,
        })
    }

    /// Set the zone naive backend timestamps are stored in
    pub fn with_backend_zone(mut self, zone: Tz) -> Self {
        self.backend_zone = zone;
        self
    }

    /// Set the zone used by [`display`](Self::display)
    pub fn with_display_zone(mut self, zone: Option<Tz>) -> Self {
        self.display_zone = zone;
        self
    }

    /// Set the decimal precision above which decimals surface as text
    pub fn with_decimal_text_threshold(mut self, digits: u32) -> Self {
        self.decimal_text_threshold = digits;
        self
    }

    /// Decimal precision above which decimals surface as text
    pub fn decimal_text_threshold(&self) -> u32 {
        self.decimal_text_threshold
    }

    /// Storage class of a backend type
    pub fn storage_class(&self, ty: &ProviderType) -> StorageClass {
        ty.storage_class(self.decimal_text_threshold)
    }

    /// Storage class an untyped backend value surfaces as
    pub fn value_storage_class(value: &Value) -> StorageClass {
        match value {
            Value::Null => StorageClass::Null,
            Value::Bool(_)
            | Value::Int8(_)
            | Value::Int16(_)
            | Value::Int32(_)
            | Value::Int64(_)
            | Value::UInt64(_) => StorageClass::Integer,
            Value::Float32(_) | Value::Float64(_) | Value::Decimal(_) => StorageClass::Real,
            Value::Bytes(_) => StorageClass::Blob,
            Value::String(_)
            | Value::Date(_)
            | Value::Time(_)
            | Value::DateTime(_)
            | Value::DateTimeTz(_)
            | Value::Uuid(_)
            | Value::Json(_) => StorageClass::Text,
        }
    }

    /// Map a value of an ad-hoc result column, which has no declared type
    pub fn map_untyped(&self, value: Value) -> Result<SqlValue> {
        Ok(match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(b)),
            Value::Float32(f) => SqlValue::Real(f64::from(f)),
            Value::Float64(f) => SqlValue::Real(f),
            Value::Decimal(d) if significant_digits(&d) > self.decimal_text_threshold => {
                SqlValue::Text(d.to_string())
            }
            Value::Decimal(d) => SqlValue::Real(d.to_f64().unwrap_or(f64::NAN)),
            Value::String(s) => SqlValue::Text(s),
            Value::Bytes(b) => SqlValue::Blob(b),
            Value::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
            Value::Time(t) => SqlValue::Text(format_time(&t)),
            Value::DateTime(ts) => SqlValue::Text(format_timestamp(&self.naive_to_utc(ts)?)),
            Value::DateTimeTz(ts) => SqlValue::Text(format_timestamp(&ts.naive_utc())),
            Value::Uuid(u) => SqlValue::Text(u.to_string()),
            Value::Json(j) => SqlValue::Text(j.to_string()),
            other => SqlValue::Integer(integer_from_value(&other)?),
        })
    }

    /// Map an embedded value to a parameter for a column of unknown type
    pub fn untyped_param(value: &SqlValue) -> Value {
        match value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(n) => Value::Int64(*n),
            SqlValue::Real(f) => Value::Float64(*f),
            SqlValue::Text(s) => Value::String(s.clone()),
            SqlValue::Blob(b) => Value::Bytes(b.clone()),
        }
    }

    /// Project a backend value of a declared type into its storage class
    pub fn to_storage_class(&self, ty: &ProviderType, value: Value) -> Result<SqlValue> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }

        match ty.family {
            TypeFamily::Boolean => value
                .as_bool()
                .map(|b| SqlValue::Integer(i64::from(b)))
                .ok_or_else(|| conversion_error(&value, ty)),
            TypeFamily::Integer => integer_from_value(&value).map(SqlValue::Integer),
            TypeFamily::Float => value
                .as_f64()
                .map(SqlValue::Real)
                .ok_or_else(|| conversion_error(&value, ty)),
            TypeFamily::Decimal => {
                let decimal = match &value {
                    Value::Decimal(d) => Some(*d),
                    Value::String(s) => decimal_from_text(s),
                    Value::Float32(_) | Value::Float64(_) => {
                        value.as_f64().and_then(decimal_from_f64)
                    }
                    other => other.as_i64().map(Decimal::from),
                }
                .ok_or_else(|| conversion_error(&value, ty))?;
                match self.storage_class(ty) {
                    StorageClass::Text => Ok(SqlValue::Text(decimal.to_string())),
                    _ => decimal
                        .to_f64()
                        .map(SqlValue::Real)
                        .ok_or_else(|| conversion_error(&value, ty)),
                }
            }
            TypeFamily::Character | TypeFamily::Unknown => match value {
                Value::String(s) => Ok(SqlValue::Text(s)),
                Value::Bytes(b) => decode_text(&b, ty.charset.as_deref()).map(SqlValue::Text),
                other => match self.map_untyped(other)? {
                    SqlValue::Integer(n) => Ok(SqlValue::Text(n.to_string())),
                    SqlValue::Real(f) => Ok(SqlValue::Text(f.to_string())),
                    text => Ok(text),
                },
            },
            TypeFamily::Binary => match value {
                Value::Bytes(b) => Ok(SqlValue::Blob(b)),
                Value::String(s) => Ok(SqlValue::Blob(s.into_bytes())),
                Value::Uuid(u) => Ok(SqlValue::Blob(u.as_bytes().to_vec())),
                other => Err(conversion_error(&other, ty)),
            },
            TypeFamily::Date => match value {
                Value::Date(d) => Ok(SqlValue::Text(d.format(DATE_FORMAT).to_string())),
                Value::DateTime(ts) => {
                    Ok(SqlValue::Text(ts.date().format(DATE_FORMAT).to_string()))
                }
                Value::String(s) => Ok(SqlValue::Text(s)),
                other => Err(conversion_error(&other, ty)),
            },
            TypeFamily::Time => match value {
                Value::Time(t) => Ok(SqlValue::Text(format_time(&t))),
                Value::String(s) => Ok(SqlValue::Text(s)),
                other => Err(conversion_error(&other, ty)),
            },
            TypeFamily::Timestamp | TypeFamily::TimestampTz => match value {
                Value::DateTime(ts) => Ok(SqlValue::Text(format_timestamp(&self.naive_to_utc(ts)?))),
                Value::DateTimeTz(ts) => Ok(SqlValue::Text(format_timestamp(&ts.naive_utc()))),
                Value::Date(d) => Ok(SqlValue::Text(format!("{} 00:00:00", d.format(DATE_FORMAT)))),
                Value::String(s) => match parse_timestamp(&s) {
                    Some((ts, Some(offset))) => {
                        Ok(SqlValue::Text(format_timestamp(&(ts - offset))))
                    }
                    Some((ts, None)) => Ok(SqlValue::Text(format_timestamp(&self.naive_to_utc(ts)?))),
                    None => Ok(SqlValue::Text(s)),
                },
                other => Err(conversion_error(&other, ty)),
            },
            TypeFamily::Uuid => match value {
                Value::Uuid(u) => Ok(SqlValue::Text(u.to_string())),
                Value::String(s) => Ok(SqlValue::Text(s.to_ascii_lowercase())),
                Value::Bytes(b) => Uuid::from_slice(&b)
                    .map(|u| SqlValue::Text(u.to_string()))
                    .map_err(|_| Error::type_conversion("UUID must be 16 bytes")),
                other => Err(conversion_error(&other, ty)),
            },
            TypeFamily::Json => match value {
                Value::Json(j) => Ok(SqlValue::Text(j.to_string())),
                Value::String(s) => Ok(SqlValue::Text(s)),
                Value::Bytes(b) => decode_text(&b, None).map(SqlValue::Text),
                other => Err(conversion_error(&other, ty)),
            },
        }
    }

    /// Convert an embedded value into a parameter for a column of `ty`
    pub fn to_provider_param(&self, value: &SqlValue, ty: &ProviderType) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match ty.family {
            TypeFamily::Boolean => match value {
                SqlValue::Integer(n) => Ok(Value::Bool(*n != 0)),
                SqlValue::Real(f) => Ok(Value::Bool(*f != 0.0)),
                SqlValue::Text(s) => Value::String(s.clone())
                    .as_bool()
                    .map(Value::Bool)
                    .ok_or_else(|| conversion_error(value, ty)),
                SqlValue::Blob(_) | SqlValue::Null => Err(conversion_error(value, ty)),
            },
            TypeFamily::Integer => {
                let n = match value {
                    SqlValue::Integer(n) => *n,
                    SqlValue::Real(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => *f as i64,
                    SqlValue::Text(s) => s
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| conversion_error(value, ty))?,
                    _ => return Err(conversion_error(value, ty)),
                };
                sized_integer(n, ty)
            }
            TypeFamily::Float => {
                let f = match value {
                    SqlValue::Integer(n) => *n as f64,
                    SqlValue::Real(f) => *f,
                    SqlValue::Text(s) => s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| conversion_error(value, ty))?,
                    _ => return Err(conversion_error(value, ty)),
                };
                Ok(match ty.width {
                    Some(4) => Value::Float32(f as f32),
                    _ => Value::Float64(f),
                })
            }
            TypeFamily::Decimal => {
                let d = match value {
                    SqlValue::Integer(n) => Decimal::from(*n),
                    SqlValue::Real(f) => {
                        decimal_from_f64(*f).ok_or_else(|| conversion_error(value, ty))?
                    }
                    SqlValue::Text(s) => {
                        decimal_from_text(s).ok_or_else(|| conversion_error(value, ty))?
                    }
                    _ => return Err(conversion_error(value, ty)),
                };
                let d = match ty.scale {
                    Some(scale) => d.round_dp(scale),
                    None => d.normalize(),
                };
                Ok(Value::Decimal(d))
            }
            TypeFamily::Character => match value {
                SqlValue::Text(s) => encode_text(s, ty.charset.as_deref()),
                SqlValue::Integer(n) => Ok(Value::String(n.to_string())),
                SqlValue::Real(f) => Ok(Value::String(f.to_string())),
                SqlValue::Blob(b) => {
                    let text = decode_text(b, None)?;
                    encode_text(&text, ty.charset.as_deref())
                }
                SqlValue::Null => Ok(Value::Null),
            },
            TypeFamily::Binary => match value {
                SqlValue::Blob(b) => Ok(Value::Bytes(b.clone())),
                SqlValue::Text(s) => Ok(Value::Bytes(s.as_bytes().to_vec())),
                _ => Err(conversion_error(value, ty)),
            },
            TypeFamily::Date => {
                let text = value.as_str().ok_or_else(|| conversion_error(value, ty))?;
                NaiveDate::parse_from_str(text.trim(), DATE_FORMAT)
                    .ok()
                    .or_else(|| parse_timestamp(text).map(|(ts, _)| ts.date()))
                    .map(Value::Date)
                    .ok_or_else(|| conversion_error(value, ty))
            }
            TypeFamily::Time => {
                let text = value.as_str().ok_or_else(|| conversion_error(value, ty))?;
                parse_time(text)
                    .map(Value::Time)
                    .ok_or_else(|| conversion_error(value, ty))
            }
            TypeFamily::Timestamp | TypeFamily::TimestampTz => {
                let utc = match value {
                    SqlValue::Text(s) => match parse_timestamp(s) {
                        Some((ts, Some(offset))) => ts - offset,
                        Some((ts, None)) => ts,
                        None => return Err(conversion_error(value, ty)),
                    },
                    SqlValue::Integer(secs) => DateTime::from_timestamp(*secs, 0)
                        .map(|ts| ts.naive_utc())
                        .ok_or_else(|| conversion_error(value, ty))?,
                    _ => return Err(conversion_error(value, ty)),
                };
                Ok(if ty.family == TypeFamily::TimestampTz {
                    Value::DateTimeTz(Utc.from_utc_datetime(&utc))
                } else {
                    Value::DateTime(self.utc_to_naive(utc))
                })
            }
            TypeFamily::Uuid => match value {
                SqlValue::Text(s) => Uuid::parse_str(s.trim())
                    .map(Value::Uuid)
                    .map_err(|e| Error::type_conversion(format!("invalid UUID '{}': {}", s, e))),
                SqlValue::Blob(b) => Uuid::from_slice(b)
                    .map(Value::Uuid)
                    .map_err(|_| Error::type_conversion("UUID must be 16 bytes")),
                _ => Err(conversion_error(value, ty)),
            },
            TypeFamily::Json => match value {
                SqlValue::Text(s) => serde_json::from_str(s)
                    .map(Value::Json)
                    .map_err(|e| Error::type_conversion(format!("invalid JSON: {}", e))),
                SqlValue::Integer(n) => Ok(Value::Json(serde_json::Value::from(*n))),
                SqlValue::Real(f) => Ok(Value::Json(serde_json::Value::from(*f))),
                _ => Err(conversion_error(value, ty)),
            },
            TypeFamily::Unknown => Ok(Self::untyped_param(value)),
        }
    }

    /// Reject NULL for a non-nullable column
    pub fn check_not_null(column: &ColumnDeclaration, value: &SqlValue) -> Result<()> {
        if value.is_null() && !column.nullable {
            return Err(Error::constraint(
                format!("{}_not_null", column.name),
                format!("NOT NULL constraint failed: {}", column.name),
            ));
        }
        Ok(())
    }

    /// Render a value for people, temporal values in the display zone
    pub fn display(&self, value: &SqlValue, ty: &ProviderType) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(n) => n.to_string(),
            SqlValue::Real(f) => f.to_string(),
            SqlValue::Blob(b) => {
                let hex: String = b.iter().map(|byte| format!("{:02X}", byte)).collect();
                format!("X'{}'", hex)
            }
            SqlValue::Text(s) => {
                let temporal = matches!(ty.family, TypeFamily::Timestamp | TypeFamily::TimestampTz);
                match (temporal, self.display_zone, parse_naive_timestamp(s)) {
                    (true, Some(zone), Some(utc)) => {
                        let local = Utc.from_utc_datetime(&utc).with_timezone(&zone);
                        format!(
                            "{}{}",
                            format_timestamp(&local.naive_local()),
                            local.format("%:z")
                        )
                    }
                    _ => s.clone(),
                }
            }
        }
    }

    /// Interpret a naive backend timestamp in the backend zone.
    ///
    /// Ambiguous local times resolve to the earlier instant.
    fn naive_to_utc(&self, ts: NaiveDateTime) -> Result<NaiveDateTime> {
        self.backend_zone
            .from_local_datetime(&ts)
            .earliest()
            .map(|local| local.naive_utc())
            .ok_or_else(|| {
                Error::type_conversion(format!(
                    "{} does not exist in time zone {}",
                    ts,
                    self.backend_zone.name()
                ))
            })
    }

    fn utc_to_naive(&self, utc: NaiveDateTime) -> NaiveDateTime {
        Utc.from_utc_datetime(&utc)
            .with_timezone(&self.backend_zone)
            .naive_local()
    }

    /// Derive a table schema from backend introspection
    pub fn schema_from_metadata(&self, name: &str, table: &TableMetadata) -> Result<TableSchema> {
        if table.columns.is_empty() {
            return Err(Error::TableNotFound {
                table: table.qualified_name(),
            });
        }
        let columns = table
            .columns
            .iter()
            .map(|column| {
                let provider_type = ProviderType::from_column(column);
                ColumnDeclaration {
                    name: column.name.clone(),
                    source_type: column.type_name.clone(),
                    storage_class: self.storage_class(&provider_type),
                    provider_type,
                    nullable: column.nullable,
                    primary_key: column.is_primary_key(),
                    auto_increment: column.auto_increment,
                }
            })
            .collect();
        TableSchema::new(
            name,
            RemoteTable {
                schema: table.schema.clone(),
                name: table.name.clone(),
            },
            columns,
        )
    }

    /// Derive a table schema from an explicit column list
    pub fn schema_from_specs(
        &self,
        name: &str,
        remote: RemoteTable,
        specs: &[ColumnSpec],
    ) -> Result<TableSchema> {
        let columns = specs
            .iter()
            .map(|spec| {
                validate_sql_type_name(&spec.type_name)?;
                let provider_type = ProviderType::parse(&spec.type_name);
                Ok(ColumnDeclaration {
                    name: spec.name.clone(),
                    source_type: spec.type_name.clone(),
                    storage_class: self.storage_class(&provider_type),
                    provider_type,
                    nullable: spec.nullable && !spec.primary_key,
                    primary_key: spec.primary_key,
                    auto_increment: spec.auto_increment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        TableSchema::new(name, remote, columns)
    }
}

fn sized_integer(n: i64, ty: &ProviderType) -> Result<Value> {
    let out_of_range = || {
        Error::type_conversion(format!(
            "{} is out of range for {}{}",
            n,
            ty.name,
            if ty.unsigned { " unsigned" } else { "" }
        ))
    };
    if ty.unsigned && n < 0 {
        return Err(out_of_range());
    }
    Ok(match (ty.width, ty.unsigned) {
        (Some(1), false) => Value::Int8(i8::try_from(n).map_err(|_| out_of_range())?),
        (Some(1), true) => Value::Int16(
            i16::try_from(n)
                .ok()
                .filter(|v| *v <= 255)
                .ok_or_else(out_of_range)?,
        ),
        (Some(2), false) => Value::Int16(i16::try_from(n).map_err(|_| out_of_range())?),
        (Some(2), true) => Value::Int32(
            i32::try_from(n)
                .ok()
                .filter(|v| *v <= 65535)
                .ok_or_else(out_of_range)?,
        ),
        (Some(4), false) => Value::Int32(i32::try_from(n).map_err(|_| out_of_range())?),
        (Some(4), true) => {
            if n > i64::from(u32::MAX) {
                return Err(out_of_range());
            }
            Value::Int64(n)
        }
        (_, true) => Value::UInt64(n as u64),
        _ => Value::Int64(n),
    })
}

/// Backend table a virtual table stands for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTable {
    /// Schema, or database on MySQL; `None` means the connection default
    #[serde(default)]
    pub schema: Option<String>,
    /// Table name
    pub name: String,
}

impl RemoteTable {
    /// Table in the default schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// Table in an explicit schema
    pub fn in_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Parse `table` or `schema.table`
    pub fn parse(qualified: &str) -> Result<Self> {
        let table = match qualified.split_once('.') {
            Some((schema, name)) => Self::in_schema(schema.trim(), name.trim()),
            None => Self::new(qualified.trim()),
        };
        if let Some(schema) = &table.schema {
            validate_sql_identifier(schema)?;
        }
        validate_sql_identifier(&table.name)?;
        Ok(table)
    }
}

impl fmt::Display for RemoteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(s) => write!(f, "{}.{}", s, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Explicit column declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name
    pub name: String,
    /// Backend type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Whether NULL is accepted (default: true)
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Part of the primary key (default: false)
    #[serde(default)]
    pub primary_key: bool,
    /// Backend generates the value (default: false)
    #[serde(default)]
    pub auto_increment: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    /// Nullable, non-key column
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
            primary_key: false,
            auto_increment: false,
        }
    }

    /// Mark as NOT NULL (builder pattern)
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as primary key (builder pattern)
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Mark as backend-generated (builder pattern)
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}

/// One column of a virtual table
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDeclaration {
    /// Column name
    pub name: String,
    /// Backend type as declared or introspected
    pub source_type: String,
    /// Normalized backend type
    pub provider_type: ProviderType,
    /// Storage class values surface as
    pub storage_class: StorageClass,
    /// Whether NULL is accepted
    pub nullable: bool,
    /// Part of the primary key
    pub primary_key: bool,
    /// Backend generates the value
    pub auto_increment: bool,
}

/// Declared shape of a virtual table
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    name: String,
    remote: RemoteTable,
    columns: Vec<ColumnDeclaration>,
    rowid_column: Option<usize>,
}

impl TableSchema {
    /// Create a schema, rejecting empty or duplicate column lists
    pub fn new(
        name: impl Into<String>,
        remote: RemoteTable,
        columns: Vec<ColumnDeclaration>,
    ) -> Result<Self> {
        let name = name.into();
        if columns.is_empty() {
            return Err(Error::schema(format!("table '{}' declares no columns", name)));
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if column.name.is_empty() {
                return Err(Error::schema(format!("table '{}' has an unnamed column", name)));
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(Error::schema(format!(
                    "table '{}' declares column '{}' twice",
                    name, column.name
                )));
            }
        }

        let keys: Vec<usize> = (0..columns.len())
            .filter(|&i| columns[i].primary_key)
            .collect();
        let rowid_column = match keys.as_slice() {
            [single] if columns[*single].storage_class == StorageClass::Integer => Some(*single),
            _ => None,
        };

        Ok(Self {
            name,
            remote,
            columns,
            rowid_column,
        })
    }

    /// Virtual table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend table
    pub fn remote(&self) -> &RemoteTable {
        &self.remote
    }

    /// Columns in declaration order
    pub fn columns(&self) -> &[ColumnDeclaration] {
        &self.columns
    }

    /// Column by index
    pub fn column(&self, idx: usize) -> Option<&ColumnDeclaration> {
        self.columns.get(idx)
    }

    /// Index of a column by name (case-insensitive)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Indexes of the primary key columns
    pub fn primary_key(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|&i| self.columns[i].primary_key)
            .collect()
    }

    /// The single INTEGER primary key column, which doubles as rowid
    pub fn rowid_column(&self) -> Option<usize> {
        self.rowid_column
    }

    /// `CREATE TABLE` statement the embedded engine declares the table with
    pub fn declaration_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!(
                    "\"{}\" {}",
                    c.name.replace('"', "\"\""),
                    c.storage_class.declared_type()
                );
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();
        format!(
            "CREATE TABLE \"{}\"({})",
            self.name.replace('"', "\"\""),
            columns.join(", ")
        )
    }
}
