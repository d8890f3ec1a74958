//! Raw column block codec
//!
//! A block is laid out as:
//!
//! ```text
//! version:i32 length:i32 rows:i32 cols:i32 flag:i32 group_id:u64
//! cols × (type:i8 bytes:i32)
//! cols × data_length:i32
//! cols × column data
//! ```
//!
//! Fixed-width column data is a null bitmap of `(rows + 7) / 8` bytes (most
//! significant bit first, set bit = NULL) followed by `rows × width` bytes.
//! Variable-width column data is `rows × i32` offsets into a payload region,
//! where an offset of `-1` marks NULL and each entry carries a length prefix.

use crate::error::{Error, Result};
use crate::types::{DataType, Field, Precision, Timestamp, Value};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const BLOCK_VERSION: i32 = 1;
pub const BLOCK_HEADER_LEN: usize = 28;
const COLUMN_INFO_LEN: usize = 5;

/// Parsed fixed header of a raw block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub length: i32,
    pub rows: usize,
    pub group_id: u64,
    /// Type and declared byte length per column
    pub columns: Vec<(DataType, i32)>,
}

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(buf),
        }
    }

    fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    fn short(&self, what: &str) -> Error {
        Error::decode(format!(
            "block truncated reading {} at byte {}",
            what,
            self.position()
        ))
    }

    fn i8(&mut self, what: &str) -> Result<i8> {
        self.cursor.read_i8().map_err(|_| self.short(what))
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        self.cursor
            .read_i32::<LittleEndian>()
            .map_err(|_| self.short(what))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| self.short(what))
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(self.short(what));
        }
        let buf: &'a [u8] = *self.cursor.get_ref();
        let start = self.position();
        self.cursor.set_position((start + len) as u64);
        Ok(&buf[start..start + len])
    }
}

fn non_negative(v: i32, what: &str) -> Result<usize> {
    usize::try_from(v).map_err(|_| Error::decode(format!("negative {} ({})", what, v)))
}

/// Parse the header and per-column info of a raw block
pub fn parse_header(block: &[u8]) -> Result<BlockHeader> {
    let mut r = Reader::new(block);
    let (header, _) = read_header(&mut r)?;
    Ok(header)
}

fn read_header(r: &mut Reader<'_>) -> Result<(BlockHeader, Vec<usize>)> {
    let version = r.i32("version")?;
    let length = r.i32("length")?;
    let rows = non_negative(r.i32("row count")?, "row count")?;
    let cols = non_negative(r.i32("column count")?, "column count")?;
    let _flag = r.i32("flag segment")?;
    let group_id = r.u64("group id")?;

    if non_negative(length, "block length")? > r.cursor.get_ref().len() {
        return Err(Error::decode(format!(
            "block declares {} bytes but only {} were received",
            length,
            r.cursor.get_ref().len()
        )));
    }
    if cols.saturating_mul(COLUMN_INFO_LEN + 4) > r.remaining() {
        return Err(r.short("column info"));
    }

    let mut columns = Vec::with_capacity(cols);
    for idx in 0..cols {
        let tag = r.i8("column type")?;
        let data_type = DataType::from_tag(tag).ok_or_else(|| {
            Error::decode(format!("unknown type tag {} for column {}", tag, idx))
        })?;
        let bytes = r.i32("column bytes")?;
        columns.push((data_type, bytes));
    }

    let mut lengths = Vec::with_capacity(cols);
    for _ in 0..cols {
        lengths.push(non_negative(r.i32("column length")?, "column length")?);
    }

    check_row_count(r, rows, &columns, &lengths)?;

    Ok((
        BlockHeader {
            version,
            length,
            rows,
            group_id,
            columns,
        },
        lengths,
    ))
}

/// Reject a row count the remaining bytes cannot hold, before anything is sized by it
fn check_row_count(
    r: &Reader<'_>,
    rows: usize,
    columns: &[(DataType, i32)],
    lengths: &[usize],
) -> Result<()> {
    if columns.is_empty() && rows > 0 {
        return Err(Error::decode(format!("block declares {} rows but no columns", rows)));
    }

    let overflow = || Error::decode(format!("row count {} overflows the block size", rows));
    let mut needed = 0usize;
    for ((data_type, _), length) in columns.iter().zip(lengths) {
        let column = match data_type.fixed_width() {
            Some(width) => rows
                .checked_mul(width)
                .and_then(|n| n.checked_add(rows.div_ceil(8))),
            None => rows.checked_mul(4).and_then(|n| n.checked_add(*length)),
        };
        needed = column
            .and_then(|c| needed.checked_add(c))
            .ok_or_else(overflow)?;
    }

    if needed > r.remaining() {
        return Err(Error::decode(format!(
            "block of {} rows needs at least {} column bytes but {} remain",
            rows,
            needed,
            r.remaining()
        )));
    }
    Ok(())
}

/// Decode a raw block into rows using the field metadata from the fetch response
///
/// Fails when the block's column count or types disagree with `fields`.
pub fn decode_block(block: &[u8], fields: &[Field], precision: Precision) -> Result<Vec<Vec<Value>>> {
    let mut r = Reader::new(block);
    let (header, lengths) = read_header(&mut r)?;

    if header.columns.len() != fields.len() {
        return Err(Error::decode(format!(
            "field count mismatch: block has {} columns, expected {}",
            header.columns.len(),
            fields.len()
        )));
    }

    let rows = header.rows;
    let mut columns: Vec<Vec<Value>> = Vec::with_capacity(fields.len());
    for (idx, field) in fields.iter().enumerate() {
        let (block_type, _) = header.columns[idx];
        if block_type != field.data_type {
            return Err(Error::decode(format!(
                "column {} ({}) is {} in the block but {} in the schema",
                idx, field.name, block_type, field.data_type
            )));
        }
        let column = match field.data_type.fixed_width() {
            Some(width) => decode_fixed(&mut r, field, rows, width, lengths[idx], precision)?,
            None => decode_var(&mut r, field, rows, lengths[idx])?,
        };
        columns.push(column);
    }

    Ok(transpose(columns, rows))
}

/// Derive field metadata from the block header alone, naming columns by position
pub fn fields_from_header(header: &BlockHeader) -> Vec<Field> {
    header
        .columns
        .iter()
        .enumerate()
        .map(|(idx, (data_type, bytes))| Field {
            name: format!("c{}", idx),
            data_type: *data_type,
            length: *bytes as i64,
            scale: 0,
        })
        .collect()
}

fn transpose(columns: Vec<Vec<Value>>, rows: usize) -> Vec<Vec<Value>> {
    let mut out: Vec<Vec<Value>> = (0..rows).map(|_| Vec::with_capacity(columns.len())).collect();
    for column in columns {
        for (row, value) in out.iter_mut().zip(column) {
            row.push(value);
        }
    }
    out
}

fn is_null(bitmap: &[u8], row: usize) -> bool {
    bitmap[row >> 3] & (1u8 << (7 - (row & 7))) != 0
}

fn decode_fixed(
    r: &mut Reader<'_>,
    field: &Field,
    rows: usize,
    width: usize,
    length: usize,
    precision: Precision,
) -> Result<Vec<Value>> {
    let bitmap = r.take(rows.div_ceil(8), "null bitmap")?;
    let needed = rows * width;
    if length < needed {
        return Err(Error::decode(format!(
            "column {} declares {} bytes, {} rows of {} need {}",
            field.name, length, rows, field.data_type, needed
        )));
    }
    let data = r.take(length, "fixed column data")?;

    let mut values = Vec::with_capacity(rows);
    let mut cell = Cursor::new(&data[..needed]);
    for row in 0..rows {
        if is_null(bitmap, row) {
            cell.set_position(((row + 1) * width) as u64);
            values.push(Value::Null);
            continue;
        }
        values.push(read_fixed(&mut cell, field, precision)?);
    }
    Ok(values)
}

fn read_fixed(cell: &mut Cursor<&[u8]>, field: &Field, precision: Precision) -> Result<Value> {
    let short = |_| Error::decode(format!("short read in column {}", field.name));
    let value = match field.data_type {
        DataType::Bool => Value::Bool(cell.read_i8().map_err(short)? != 0),
        DataType::TinyInt => Value::TinyInt(cell.read_i8().map_err(short)?),
        DataType::SmallInt => Value::SmallInt(cell.read_i16::<LittleEndian>().map_err(short)?),
        DataType::Int => Value::Int(cell.read_i32::<LittleEndian>().map_err(short)?),
        DataType::BigInt => Value::BigInt(cell.read_i64::<LittleEndian>().map_err(short)?),
        DataType::UTinyInt => Value::UTinyInt(cell.read_u8().map_err(short)?),
        DataType::USmallInt => Value::USmallInt(cell.read_u16::<LittleEndian>().map_err(short)?),
        DataType::UInt => Value::UInt(cell.read_u32::<LittleEndian>().map_err(short)?),
        DataType::UBigInt => Value::UBigInt(cell.read_u64::<LittleEndian>().map_err(short)?),
        DataType::Float => Value::Float(cell.read_f32::<LittleEndian>().map_err(short)?),
        DataType::Double => Value::Double(cell.read_f64::<LittleEndian>().map_err(short)?),
        DataType::Timestamp => Value::Timestamp(Timestamp::new(
            cell.read_i64::<LittleEndian>().map_err(short)?,
            precision,
        )),
        DataType::Decimal64 => {
            let mantissa = cell.read_i64::<LittleEndian>().map_err(short)?;
            Value::Decimal(format_decimal(mantissa as i128, field.scale))
        }
        DataType::Decimal => {
            let mantissa = cell.read_i128::<LittleEndian>().map_err(short)?;
            Value::Decimal(format_decimal(mantissa, field.scale))
        }
        other => {
            return Err(Error::decode(format!("{} is not a fixed-width type", other)));
        }
    };
    Ok(value)
}

fn decode_var(r: &mut Reader<'_>, field: &Field, rows: usize, length: usize) -> Result<Vec<Value>> {
    let mut offsets = Vec::with_capacity(rows);
    for _ in 0..rows {
        offsets.push(r.i32("variable-width offsets")?);
    }
    let payload = r.take(length, "variable-width payload")?;

    let long_prefix = matches!(field.data_type, DataType::Blob | DataType::MediumBlob);
    offsets
        .into_iter()
        .map(|offset| {
            if offset < 0 {
                return Ok(Value::Null);
            }
            let bytes = read_var_entry(payload, offset as usize, long_prefix, &field.name)?;
            var_value(field, bytes)
        })
        .collect()
}

fn read_var_entry<'a>(payload: &'a [u8], offset: usize, long_prefix: bool, column: &str) -> Result<&'a [u8]> {
    let mut cursor = Cursor::new(payload);
    cursor.set_position(offset as u64);
    let len = if long_prefix {
        cursor.read_u32::<LittleEndian>().map(|l| l as usize)
    } else {
        cursor.read_u16::<LittleEndian>().map(|l| l as usize)
    }
    .map_err(|_| {
        Error::decode(format!(
            "offset {} in column {} is outside its {}-byte payload",
            offset,
            column,
            payload.len()
        ))
    })?;
    let start = cursor.position() as usize;
    payload.get(start..start + len).ok_or_else(|| {
        Error::decode(format!(
            "entry of {} bytes at offset {} overruns column {}",
            len, offset, column
        ))
    })
}

fn var_value(field: &Field, bytes: &[u8]) -> Result<Value> {
    let utf8 = |bytes: &[u8]| {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::decode(format!("invalid UTF-8 in column {}: {}", field.name, e)))
    };
    let value = match field.data_type {
        DataType::VarChar => Value::VarChar(utf8(bytes)?),
        DataType::Json => Value::Json(utf8(bytes)?),
        DataType::NChar => Value::NChar(decode_ucs4(bytes, &field.name)?),
        DataType::VarBinary => Value::VarBinary(bytes.to_vec()),
        DataType::Geometry => Value::Geometry(bytes.to_vec()),
        DataType::Blob | DataType::MediumBlob => Value::Blob(bytes.to_vec()),
        DataType::Null => Value::Null,
        other => return Err(Error::decode(format!("{} is not a variable-width type", other))),
    };
    Ok(value)
}

fn decode_ucs4(bytes: &[u8], column: &str) -> Result<String> {
    if bytes.len() % 4 != 0 {
        return Err(Error::decode(format!(
            "NCHAR entry of {} bytes in column {} is not UCS-4",
            bytes.len(),
            column
        )));
    }
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let code = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            char::from_u32(code).ok_or_else(|| {
                Error::decode(format!("invalid code point {:#x} in column {}", code, column))
            })
        })
        .collect()
}

/// Render a decimal mantissa with `scale` implied fractional digits
pub fn format_decimal(mantissa: i128, scale: u8) -> String {
    let sign = if mantissa < 0 { "-" } else { "" };
    let digits = mantissa.unsigned_abs().to_string();
    let scale = scale as usize;
    if scale == 0 {
        return format!("{}{}", sign, digits);
    }
    let digits = if digits.len() <= scale {
        format!("{}{}", "0".repeat(scale + 1 - digits.len()), digits)
    } else {
        digits
    };
    let (int_part, frac_part) = digits.split_at(digits.len() - scale);
    format!("{}{}.{}", sign, int_part, frac_part)
}

/// Parse a decimal string back into a mantissa at the given scale
pub fn parse_decimal(s: &str, scale: u8) -> Result<i128> {
    let bad = || Error::decode(format!("'{}' is not a decimal with scale {}", s, scale));
    let (negative, unsigned) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if frac_part.len() > scale as usize || int_part.is_empty() {
        return Err(bad());
    }
    let padded = format!("{}{}{}", int_part, frac_part, "0".repeat(scale as usize - frac_part.len()));
    if !padded.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let magnitude: i128 = padded.parse().map_err(|_| bad())?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// Builds raw blocks in the server layout
///
/// Used by test servers and benchmarks that need to produce the frames a
/// real server would send.
#[derive(Debug, Default)]
pub struct BlockWriter {
    rows: usize,
    columns: Vec<(Field, Vec<Value>)>,
}

impl BlockWriter {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            columns: Vec::new(),
        }
    }

    /// Append a column; `values` must hold one value per row
    pub fn column(mut self, field: Field, values: Vec<Value>) -> Self {
        self.columns.push((field, values));
        self
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut lengths = Vec::with_capacity(self.columns.len());

        for (field, values) in &self.columns {
            if values.len() != self.rows {
                return Err(Error::decode(format!(
                    "column {} has {} values for {} rows",
                    field.name,
                    values.len(),
                    self.rows
                )));
            }
            let length = match field.data_type.fixed_width() {
                Some(width) => write_fixed(&mut data, field, values, width)?,
                None => write_var(&mut data, field, values)?,
            };
            lengths.push(length as i32);
        }

        let cols = self.columns.len();
        let total = BLOCK_HEADER_LEN + cols * (COLUMN_INFO_LEN + 4) + data.len();
        let mut out = Vec::with_capacity(total);
        let io = |e: std::io::Error| Error::decode(e.to_string());
        out.write_i32::<LittleEndian>(BLOCK_VERSION).map_err(io)?;
        out.write_i32::<LittleEndian>(total as i32).map_err(io)?;
        out.write_i32::<LittleEndian>(self.rows as i32).map_err(io)?;
        out.write_i32::<LittleEndian>(cols as i32).map_err(io)?;
        out.write_i32::<LittleEndian>(0).map_err(io)?;
        out.write_u64::<LittleEndian>(0).map_err(io)?;
        for (field, _) in &self.columns {
            out.write_i8(field.data_type.tag()).map_err(io)?;
            out.write_i32::<LittleEndian>(field.length as i32).map_err(io)?;
        }
        for length in lengths {
            out.write_i32::<LittleEndian>(length).map_err(io)?;
        }
        out.extend_from_slice(&data);
        Ok(out)
    }
}

fn mismatch(field: &Field, value: &Value) -> Error {
    Error::decode(format!(
        "value {:?} does not fit column {} of type {}",
        value, field.name, field.data_type
    ))
}

/// Writes bitmap + values, returns the data length (excluding the bitmap)
fn write_fixed(out: &mut Vec<u8>, field: &Field, values: &[Value], width: usize) -> Result<usize> {
    let mut bitmap = vec![0u8; values.len().div_ceil(8)];
    let mut body = Vec::with_capacity(values.len() * width);
    let io = |e: std::io::Error| Error::decode(e.to_string());

    for (row, value) in values.iter().enumerate() {
        match (field.data_type, value) {
            (_, Value::Null) => {
                bitmap[row >> 3] |= 1u8 << (7 - (row & 7));
                body.extend(std::iter::repeat(0u8).take(width));
            }
            (DataType::Bool, Value::Bool(v)) => body.push(*v as u8),
            (DataType::TinyInt, Value::TinyInt(v)) => body.write_i8(*v).map_err(io)?,
            (DataType::SmallInt, Value::SmallInt(v)) => body.write_i16::<LittleEndian>(*v).map_err(io)?,
            (DataType::Int, Value::Int(v)) => body.write_i32::<LittleEndian>(*v).map_err(io)?,
            (DataType::BigInt, Value::BigInt(v)) => body.write_i64::<LittleEndian>(*v).map_err(io)?,
            (DataType::UTinyInt, Value::UTinyInt(v)) => body.push(*v),
            (DataType::USmallInt, Value::USmallInt(v)) => body.write_u16::<LittleEndian>(*v).map_err(io)?,
            (DataType::UInt, Value::UInt(v)) => body.write_u32::<LittleEndian>(*v).map_err(io)?,
            (DataType::UBigInt, Value::UBigInt(v)) => body.write_u64::<LittleEndian>(*v).map_err(io)?,
            (DataType::Float, Value::Float(v)) => body.write_f32::<LittleEndian>(*v).map_err(io)?,
            (DataType::Double, Value::Double(v)) => body.write_f64::<LittleEndian>(*v).map_err(io)?,
            (DataType::Timestamp, Value::Timestamp(ts)) => {
                body.write_i64::<LittleEndian>(ts.raw()).map_err(io)?
            }
            (DataType::Decimal64, Value::Decimal(s)) => {
                let mantissa = i64::try_from(parse_decimal(s, field.scale)?)
                    .map_err(|_| mismatch(field, value))?;
                body.write_i64::<LittleEndian>(mantissa).map_err(io)?
            }
            (DataType::Decimal, Value::Decimal(s)) => body
                .write_i128::<LittleEndian>(parse_decimal(s, field.scale)?)
                .map_err(io)?,
            _ => return Err(mismatch(field, value)),
        }
    }

    out.extend_from_slice(&bitmap);
    out.extend_from_slice(&body);
    Ok(body.len())
}

/// Writes offsets + payload, returns the payload length
fn write_var(out: &mut Vec<u8>, field: &Field, values: &[Value]) -> Result<usize> {
    let long_prefix = matches!(field.data_type, DataType::Blob | DataType::MediumBlob);
    let mut offsets = Vec::with_capacity(values.len() * 4);
    let mut payload = Vec::new();
    let io = |e: std::io::Error| Error::decode(e.to_string());

    for value in values {
        let bytes: Vec<u8> = match (field.data_type, value) {
            (_, Value::Null) => {
                offsets.write_i32::<LittleEndian>(-1).map_err(io)?;
                continue;
            }
            (DataType::VarChar, Value::VarChar(s)) | (DataType::Json, Value::Json(s)) => {
                s.as_bytes().to_vec()
            }
            (DataType::NChar, Value::NChar(s)) => {
                s.chars().flat_map(|c| (c as u32).to_le_bytes()).collect()
            }
            (DataType::VarBinary, Value::VarBinary(b))
            | (DataType::Geometry, Value::Geometry(b))
            | (DataType::Blob, Value::Blob(b))
            | (DataType::MediumBlob, Value::Blob(b)) => b.clone(),
            _ => return Err(mismatch(field, value)),
        };
        offsets.write_i32::<LittleEndian>(payload.len() as i32).map_err(io)?;
        if long_prefix {
            payload.write_u32::<LittleEndian>(bytes.len() as u32).map_err(io)?;
        } else {
            let len = u16::try_from(bytes.len()).map_err(|_| mismatch(field, value))?;
            payload.write_u16::<LittleEndian>(len).map_err(io)?;
        }
        payload.extend_from_slice(&bytes);
    }

    out.extend_from_slice(&offsets);
    out.extend_from_slice(&payload);
    Ok(payload.len())
}
