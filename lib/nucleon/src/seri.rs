use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io;
use std::io::Read;

const TYPE_NIL: u8 = 0;
const TYPE_BOOLEAN: u8 = 1;
const TYPE_NUMBER: u8 = 2;
const TYPE_POINTER: u8 = 3;
const TYPE_SHORT_STRING: u8 = 4;
const TYPE_LONG_STRING: u8 = 5;
const TYPE_TABLE: u8 = 6;

const NUMBER_ZERO: u8 = 0;
const NUMBER_BYTE: u8 = 1;
const NUMBER_WORD: u8 = 2;
const NUMBER_DWORD: u8 = 4;
const NUMBER_QWORD: u8 = 6;
const NUMBER_REAL: u8 = 8;

const MAX_COOKIE: u8 = 32;
const MAX_DEPTH: usize = 32;
const BLOCK_SIZE: usize = 128;

#[inline]
fn combine(kind: u8, cookie: u8) -> u8 {
    kind | cookie << 3
}

/// A self-describing value. Inter-service payloads are sequences of these;
/// the wire form is the tagged little-endian format of [`pack`]/[`unpack`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    /// Opaque in-process handle, exchanged between trusted services only.
    Pointer(u64),
    Str(Vec<u8>),
    Table(Table),
}

/// A sequence part plus keyed part, mirroring the array/hash split of the
/// wire format. The array fast path covers `array`; `hash` pairs follow,
/// terminated on the wire by a NIL key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub array: Vec<Value>,
    pub hash: Vec<(Value, Value)>,
}

impl Value {
    #[inline]
    pub fn str(s: &str) -> Value {
        Value::Str(s.as_bytes().to_vec())
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum EncodeError {
    /// Nesting exceeded the depth cap of 32.
    TooDeep,
    /// A keyed pair used NIL as its key, which is the wire terminator.
    NilKey,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncodeError::TooDeep => write!(f, "value nests deeper than {}", MAX_DEPTH),
            EncodeError::NilKey => write!(f, "nil is not a valid map key"),
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Eq, PartialEq)]
pub struct DecodeError {
    /// Byte offset at which decoding failed.
    pub position: usize,
    pub kind: DecodeErrorKind,
}

#[derive(Debug, Eq, PartialEq)]
pub enum DecodeErrorKind {
    InvalidStream,
    TooDeep,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            DecodeErrorKind::InvalidStream => {
                write!(f, "invalid serialize stream at byte {}", self.position)
            }
            DecodeErrorKind::TooDeep => {
                write!(f, "stream nests deeper than {} at byte {}", MAX_DEPTH, self.position)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// Encoded output grows through a chain of fixed blocks so deep values never
// trigger large reallocations; finalize copies the chain into one buffer.
struct WriteBlock {
    blocks: Vec<[u8; BLOCK_SIZE]>,
    ptr: usize,
    len: usize,
}

impl WriteBlock {
    fn new() -> WriteBlock {
        WriteBlock {
            blocks: vec![[0; BLOCK_SIZE]],
            ptr: 0,
            len: 0,
        }
    }

    fn push(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.ptr == BLOCK_SIZE {
                self.blocks.push([0; BLOCK_SIZE]);
                self.ptr = 0;
            }
            let free = BLOCK_SIZE - self.ptr;
            let take = free.min(data.len());
            let block = self.blocks.last_mut().unwrap();
            block[self.ptr..self.ptr + take].copy_from_slice(&data[..take]);
            self.ptr += take;
            self.len += take;
            data = &data[take..];
        }
    }

    fn finalize(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        let mut remaining = self.len;
        for block in &self.blocks {
            let take = remaining.min(BLOCK_SIZE);
            out.extend_from_slice(&block[..take]);
            remaining -= take;
        }
        out
    }
}

impl io::Write for WriteBlock {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Encode a sequence of root values into one contiguous buffer.
pub fn pack(values: &[Value]) -> Result<Vec<u8>, EncodeError> {
    let mut wb = WriteBlock::new();
    for value in values {
        encode_one(&mut wb, value, 0)?;
    }
    Ok(wb.finalize())
}

fn encode_one(wb: &mut WriteBlock, value: &Value, depth: usize) -> Result<(), EncodeError> {
    if depth > MAX_DEPTH {
        return Err(EncodeError::TooDeep);
    }
    match value {
        Value::Nil => wb.push(&[TYPE_NIL]),
        Value::Bool(b) => wb.push(&[combine(TYPE_BOOLEAN, *b as u8)]),
        Value::Int(v) => encode_integer(wb, *v),
        Value::Real(v) => {
            wb.push(&[combine(TYPE_NUMBER, NUMBER_REAL)]);
            wb.write_f64::<LittleEndian>(*v).unwrap();
        }
        Value::Pointer(p) => {
            wb.push(&[TYPE_POINTER]);
            wb.write_u64::<LittleEndian>(*p).unwrap();
        }
        Value::Str(s) => encode_string(wb, s),
        Value::Table(t) => encode_table(wb, t, depth)?,
    }
    Ok(())
}

fn encode_integer(wb: &mut WriteBlock, v: i64) {
    if v == 0 {
        wb.push(&[combine(TYPE_NUMBER, NUMBER_ZERO)]);
    } else if v != i64::from(v as i32) {
        wb.push(&[combine(TYPE_NUMBER, NUMBER_QWORD)]);
        wb.write_i64::<LittleEndian>(v).unwrap();
    } else if v < 0 {
        wb.push(&[combine(TYPE_NUMBER, NUMBER_DWORD)]);
        wb.write_i32::<LittleEndian>(v as i32).unwrap();
    } else if v < 0x100 {
        wb.push(&[combine(TYPE_NUMBER, NUMBER_BYTE)]);
        wb.push(&[v as u8]);
    } else if v < 0x10000 {
        wb.push(&[combine(TYPE_NUMBER, NUMBER_WORD)]);
        wb.write_u16::<LittleEndian>(v as u16).unwrap();
    } else {
        wb.push(&[combine(TYPE_NUMBER, NUMBER_DWORD)]);
        wb.write_i32::<LittleEndian>(v as i32).unwrap();
    }
}

fn encode_string(wb: &mut WriteBlock, s: &[u8]) {
    let len = s.len();
    if len < MAX_COOKIE as usize {
        wb.push(&[combine(TYPE_SHORT_STRING, len as u8)]);
    } else if len < 0x10000 {
        wb.push(&[combine(TYPE_LONG_STRING, 2)]);
        wb.write_u16::<LittleEndian>(len as u16).unwrap();
    } else {
        wb.push(&[combine(TYPE_LONG_STRING, 4)]);
        wb.write_u32::<LittleEndian>(len as u32).unwrap();
    }
    wb.push(s);
}

fn encode_table(wb: &mut WriteBlock, t: &Table, depth: usize) -> Result<(), EncodeError> {
    let array_size = t.array.len();
    if array_size >= MAX_COOKIE as usize - 1 {
        wb.push(&[combine(TYPE_TABLE, MAX_COOKIE - 1)]);
        encode_integer(wb, array_size as i64);
    } else {
        wb.push(&[combine(TYPE_TABLE, array_size as u8)]);
    }
    for item in &t.array {
        encode_one(wb, item, depth + 1)?;
    }
    for (key, value) in &t.hash {
        if *key == Value::Nil {
            return Err(EncodeError::NilKey);
        }
        encode_one(wb, key, depth + 1)?;
        encode_one(wb, value, depth + 1)?;
    }
    wb.push(&[TYPE_NIL]);
    Ok(())
}

struct ReadBlock<'a> {
    cursor: io::Cursor<&'a [u8]>,
}

impl<'a> ReadBlock<'a> {
    #[inline]
    fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    #[inline]
    fn invalid(&self) -> DecodeError {
        DecodeError {
            position: self.position(),
            kind: DecodeErrorKind::InvalidStream,
        }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.position()
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        if self.remaining() < len {
            return Err(self.invalid());
        }
        let mut out = vec![0; len];
        self.cursor.read_exact(&mut out).map_err(|_| self.invalid())?;
        Ok(out)
    }
}

macro_rules! read_scalar {
    ($rb:expr, $call:ident) => {{
        let rb: &mut ReadBlock = $rb;
        match rb.cursor.$call::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => return Err(rb.invalid()),
        }
    }};
}

/// Decode a buffer produced by [`pack`] back into its root values. The whole
/// buffer must be consumed; trailing or truncated bytes are an invalid
/// stream, reported with the offending position.
pub fn unpack(data: &[u8]) -> Result<Vec<Value>, DecodeError> {
    let mut rb = ReadBlock {
        cursor: io::Cursor::new(data),
    };
    let mut values = Vec::new();
    while rb.remaining() > 0 {
        values.push(decode_one(&mut rb, 0)?);
    }
    Ok(values)
}

fn decode_one(rb: &mut ReadBlock, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError {
            position: rb.position(),
            kind: DecodeErrorKind::TooDeep,
        });
    }
    let tag = match rb.cursor.read_u8() {
        Ok(tag) => tag,
        Err(_) => return Err(rb.invalid()),
    };
    let kind = tag & 0x7;
    let cookie = tag >> 3;
    match kind {
        TYPE_NIL => Ok(Value::Nil),
        TYPE_BOOLEAN => Ok(Value::Bool(cookie != 0)),
        TYPE_NUMBER => decode_number(rb, cookie),
        TYPE_POINTER => Ok(Value::Pointer(read_scalar!(rb, read_u64))),
        TYPE_SHORT_STRING => Ok(Value::Str(rb.bytes(cookie as usize)?)),
        TYPE_LONG_STRING => {
            let len = match cookie {
                2 => usize::from(read_scalar!(rb, read_u16)),
                4 => read_scalar!(rb, read_u32) as usize,
                _ => return Err(rb.invalid()),
            };
            Ok(Value::Str(rb.bytes(len)?))
        }
        TYPE_TABLE => decode_table(rb, cookie, depth),
        _ => Err(rb.invalid()),
    }
}

fn decode_number(rb: &mut ReadBlock, cookie: u8) -> Result<Value, DecodeError> {
    let value = match cookie {
        NUMBER_ZERO => Value::Int(0),
        NUMBER_BYTE => match rb.cursor.read_u8() {
            Ok(v) => Value::Int(i64::from(v)),
            Err(_) => return Err(rb.invalid()),
        },
        NUMBER_WORD => Value::Int(i64::from(read_scalar!(rb, read_u16))),
        NUMBER_DWORD => Value::Int(i64::from(read_scalar!(rb, read_i32))),
        NUMBER_QWORD => Value::Int(read_scalar!(rb, read_i64)),
        NUMBER_REAL => Value::Real(read_scalar!(rb, read_f64)),
        _ => return Err(rb.invalid()),
    };
    Ok(value)
}

fn decode_table(rb: &mut ReadBlock, cookie: u8, depth: usize) -> Result<Value, DecodeError> {
    let array_size = if cookie == MAX_COOKIE - 1 {
        match decode_one(rb, depth + 1)? {
            Value::Int(n) if n >= 0 => n as usize,
            _ => return Err(rb.invalid()),
        }
    } else {
        cookie as usize
    };

    let mut table = Table::default();
    for _ in 0..array_size {
        table.array.push(decode_one(rb, depth + 1)?);
    }
    loop {
        let key = decode_one(rb, depth + 1)?;
        if key == Value::Nil {
            break;
        }
        let value = decode_one(rb, depth + 1)?;
        table.hash.push((key, value));
    }
    Ok(Value::Table(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = pack(std::slice::from_ref(&value)).unwrap();
        let decoded = unpack(&encoded).unwrap();
        assert_eq!(decoded, vec![value]);
    }

    #[test]
    fn test_scalars() {
        roundtrip(Value::Nil);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(1));
        roundtrip(Value::Int(255));
        roundtrip(Value::Int(256));
        roundtrip(Value::Int(65535));
        roundtrip(Value::Int(65536));
        roundtrip(Value::Int(-1));
        roundtrip(Value::Int(i64::from(i32::MAX)));
        roundtrip(Value::Int(i64::from(i32::MIN)));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Real(1.5));
        roundtrip(Value::Real(-0.25));
        roundtrip(Value::Pointer(0xdead_beef));
    }

    #[test]
    fn test_integer_width_selection() {
        // The encoder picks the narrowest sub-kind; check a few wire sizes.
        assert_eq!(pack(&[Value::Int(0)]).unwrap().len(), 1);
        assert_eq!(pack(&[Value::Int(7)]).unwrap().len(), 2);
        assert_eq!(pack(&[Value::Int(300)]).unwrap().len(), 3);
        assert_eq!(pack(&[Value::Int(70000)]).unwrap().len(), 5);
        assert_eq!(pack(&[Value::Int(-5)]).unwrap().len(), 5);
        assert_eq!(pack(&[Value::Int(1 << 40)]).unwrap().len(), 9);
    }

    #[test]
    fn test_strings() {
        roundtrip(Value::str(""));
        roundtrip(Value::str("short"));
        roundtrip(Value::Str(vec![0xff; 31]));
        roundtrip(Value::Str(vec![0xab; 32]));
        roundtrip(Value::Str(vec![7; 65535]));
        roundtrip(Value::Str(vec![9; 70000]));
    }

    #[test]
    fn test_table_mixed() {
        // {3 array items; "a" -> [1,2,3], "b" -> nil, "c" -> 1.5}
        let value = Value::Table(Table {
            array: vec![Value::Int(10), Value::Int(20), Value::Int(30)],
            hash: vec![
                (
                    Value::str("a"),
                    Value::Table(Table {
                        array: vec![Value::Int(1), Value::Int(2), Value::Int(3)],
                        hash: vec![],
                    }),
                ),
                (Value::str("b"), Value::Nil),
                (Value::str("c"), Value::Real(1.5)),
            ],
        });
        let encoded = pack(std::slice::from_ref(&value)).unwrap();
        let decoded = unpack(&encoded).unwrap();
        assert_eq!(decoded, vec![value]);
    }

    #[test]
    fn test_long_array_cookie() {
        let array: Vec<Value> = (0..40).map(Value::Int).collect();
        roundtrip(Value::Table(Table {
            array,
            hash: vec![],
        }));
    }

    #[test]
    fn test_multiple_roots() {
        let values = vec![Value::Int(1), Value::str("two"), Value::Bool(true)];
        let encoded = pack(&values).unwrap();
        assert_eq!(unpack(&encoded).unwrap(), values);
    }

    #[test]
    fn test_depth_limit() {
        let mut value = Value::Table(Table::default());
        for _ in 0..MAX_DEPTH + 1 {
            value = Value::Table(Table {
                array: vec![value],
                hash: vec![],
            });
        }
        assert_eq!(pack(&[value]).unwrap_err(), EncodeError::TooDeep);
    }

    #[test]
    fn test_depth_under_limit() {
        let mut value = Value::Int(1);
        for _ in 0..MAX_DEPTH - 1 {
            value = Value::Table(Table {
                array: vec![value],
                hash: vec![],
            });
        }
        roundtrip(value);
    }

    #[test]
    fn test_nil_key_refused() {
        let value = Value::Table(Table {
            array: vec![],
            hash: vec![(Value::Nil, Value::Int(1))],
        });
        assert_eq!(pack(&[value]).unwrap_err(), EncodeError::NilKey);
    }

    #[test]
    fn test_truncated_stream() {
        let encoded = pack(&[Value::Str(vec![1; 100])]).unwrap();
        let err = unpack(&encoded[..50]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::InvalidStream);
        assert!(err.position <= 50);
    }

    #[test]
    fn test_unterminated_table() {
        // TABLE tag with 0 array items but no NIL terminator.
        let err = unpack(&[combine(TYPE_TABLE, 0)]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::InvalidStream);
    }

    #[test]
    fn test_bad_cookie() {
        let err = unpack(&[combine(TYPE_NUMBER, 3)]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::InvalidStream);
        let err = unpack(&[combine(TYPE_LONG_STRING, 1)]).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::InvalidStream);
    }

    #[test]
    fn test_byte_exact_consumption() {
        let value = Value::Table(Table {
            array: vec![Value::str("x")],
            hash: vec![(Value::Int(5), Value::Bool(false))],
        });
        let encoded = pack(std::slice::from_ref(&value)).unwrap();
        // Appending garbage makes the stream invalid rather than ignored.
        let mut tail = encoded.clone();
        tail.push(0x07);
        assert!(unpack(&tail).is_err());
        assert_eq!(unpack(&encoded).unwrap(), vec![value]);
    }
}
