//! FlatBuffers-compatible table layout
//!
//! Buffers are written front to back: a root offset, then each table's
//! vtable followed by the table itself, then its out-of-line children
//! (strings, byte vectors, sub-tables, table vectors). Every offset points
//! forward, which is what any FlatBuffers reader expects. All scalars are
//! little-endian.

use bytes::{Buf, BufMut};
use std::cmp::Reverse;
use thiserror::Error;

/// Size of a `uoffset_t` / `soffset_t`
const OFFSET_SIZE: usize = 4;

/// Errors raised while laying out a buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{0} exceeds the 32-bit offset range")]
    TooLarge(&'static str),

    #[error("table has too many fields")]
    TooManyFields,
}

/// Errors raised while reading a buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("out of bounds: need {needed} bytes at offset {offset}, buffer is {len} bytes")]
    OutOfBounds {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("invalid vtable for table at offset {0}")]
    InvalidVTable(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown {kind} value: {value}")]
    UnknownEnum { kind: &'static str, value: u8 },

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// A field stored inside the table body
#[derive(Debug, Clone)]
enum Field {
    Inline { bytes: Vec<u8>, align: usize },
    Child(Child),
}

/// A field stored out of line and referenced by a forward offset
#[derive(Debug, Clone)]
enum Child {
    String(String),
    Bytes(Vec<u8>),
    Table(TableBuilder),
    Tables(Vec<TableBuilder>),
}

impl Field {
    fn align(&self) -> usize {
        match self {
            Field::Inline { align, .. } => *align,
            Field::Child(_) => OFFSET_SIZE,
        }
    }

    fn size(&self) -> usize {
        match self {
            Field::Inline { bytes, .. } => bytes.len(),
            Field::Child(_) => OFFSET_SIZE,
        }
    }
}

/// Describes one table before it is laid out
#[derive(Debug, Clone, Default)]
pub struct TableBuilder {
    fields: Vec<(u16, Field)>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn inline(mut self, slot: u16, bytes: Vec<u8>, align: usize) -> Self {
        self.fields.push((slot, Field::Inline { bytes, align }));
        self
    }

    fn child(mut self, slot: u16, child: Child) -> Self {
        self.fields.push((slot, Field::Child(child)));
        self
    }

    pub fn u8(self, slot: u16, value: u8) -> Self {
        self.inline(slot, vec![value], 1)
    }

    pub fn bool(self, slot: u16, value: bool) -> Self {
        self.u8(slot, u8::from(value))
    }

    pub fn u16(self, slot: u16, value: u16) -> Self {
        self.inline(slot, value.to_le_bytes().to_vec(), 2)
    }

    pub fn u32(self, slot: u16, value: u32) -> Self {
        self.inline(slot, value.to_le_bytes().to_vec(), 4)
    }

    pub fn u64(self, slot: u16, value: u64) -> Self {
        self.inline(slot, value.to_le_bytes().to_vec(), 8)
    }

    pub fn f32(self, slot: u16, value: f32) -> Self {
        self.inline(slot, value.to_le_bytes().to_vec(), 4)
    }

    /// Inline struct made of consecutive floats (Vec3, Vec4)
    pub fn f32s(self, slot: u16, values: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.put_f32_le(*value);
        }
        self.inline(slot, bytes, 4)
    }

    pub fn string(self, slot: u16, value: &str) -> Self {
        self.child(slot, Child::String(value.to_owned()))
    }

    pub fn bytes(self, slot: u16, value: Vec<u8>) -> Self {
        self.child(slot, Child::Bytes(value))
    }

    pub fn table(self, slot: u16, value: TableBuilder) -> Self {
        self.child(slot, Child::Table(value))
    }

    pub fn tables(self, slot: u16, value: Vec<TableBuilder>) -> Self {
        self.child(slot, Child::Tables(value))
    }

    /// Lay the table out as the root of a new buffer
    pub fn finish(&self) -> Result<Vec<u8>, EncodeError> {
        let mut writer = Writer {
            buf: Vec::with_capacity(128),
        };
        writer.buf.put_u32_le(0);
        let root = writer.write_table(self)?;
        writer.patch_offset(0, root)?;
        Ok(writer.buf)
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn pad_to(&mut self, align: usize) {
        while self.buf.len() % align != 0 {
            self.buf.put_u8(0);
        }
    }

    fn write_table(&mut self, table: &TableBuilder) -> Result<usize, EncodeError> {
        // Widest fields first keeps padding inside the table small
        let mut order: Vec<&(u16, Field)> = table.fields.iter().collect();
        order.sort_by_key(|(_, field)| Reverse(field.align()));

        let mut layout = Vec::with_capacity(order.len());
        let mut cursor = OFFSET_SIZE;
        let mut max_align = OFFSET_SIZE;
        for (slot, field) in order {
            let align = field.align();
            cursor = cursor.next_multiple_of(align);
            layout.push((*slot, cursor, field));
            cursor += field.size();
            max_align = max_align.max(align);
        }
        let table_size = u16::try_from(cursor).map_err(|_| EncodeError::TooManyFields)?;

        let slot_count = table
            .fields
            .iter()
            .map(|(slot, _)| usize::from(*slot) + 1)
            .max()
            .unwrap_or(0);
        let mut entries = vec![0u16; slot_count];
        for (slot, offset, _) in &layout {
            // Bounded by table_size, which fits in u16
            entries[usize::from(*slot)] = *offset as u16;
        }
        let vtable_len =
            u16::try_from(4 + 2 * slot_count).map_err(|_| EncodeError::TooManyFields)?;

        self.pad_to(2);
        let vtable_pos = self.buf.len();
        self.buf.put_u16_le(vtable_len);
        self.buf.put_u16_le(table_size);
        for entry in entries {
            self.buf.put_u16_le(entry);
        }

        self.pad_to(max_align);
        let table_pos = self.buf.len();
        let soffset =
            i32::try_from(table_pos - vtable_pos).map_err(|_| EncodeError::TooLarge("vtable"))?;
        self.buf.put_i32_le(soffset);
        self.buf.resize(table_pos + usize::from(table_size), 0);

        let mut children = Vec::new();
        for (_, offset, field) in layout {
            let at = table_pos + offset;
            match field {
                Field::Inline { bytes, .. } => {
                    self.buf[at..at + bytes.len()].copy_from_slice(bytes);
                }
                Field::Child(child) => children.push((at, child)),
            }
        }

        for (at, child) in children {
            let target = self.write_child(child)?;
            self.patch_offset(at, target)?;
        }

        Ok(table_pos)
    }

    fn write_child(&mut self, child: &Child) -> Result<usize, EncodeError> {
        match child {
            Child::String(value) => {
                let pos = self.write_length(value.len(), "string")?;
                self.buf.put_slice(value.as_bytes());
                self.buf.put_u8(0);
                Ok(pos)
            }
            Child::Bytes(value) => {
                let pos = self.write_length(value.len(), "byte vector")?;
                self.buf.put_slice(value);
                Ok(pos)
            }
            Child::Table(table) => self.write_table(table),
            Child::Tables(tables) => {
                let pos = self.write_length(tables.len(), "table vector")?;
                let first = self.buf.len();
                self.buf.resize(first + tables.len() * OFFSET_SIZE, 0);
                for (i, table) in tables.iter().enumerate() {
                    let target = self.write_table(table)?;
                    self.patch_offset(first + i * OFFSET_SIZE, target)?;
                }
                Ok(pos)
            }
        }
    }

    fn write_length(&mut self, len: usize, what: &'static str) -> Result<usize, EncodeError> {
        let len = u32::try_from(len).map_err(|_| EncodeError::TooLarge(what))?;
        self.pad_to(OFFSET_SIZE);
        let pos = self.buf.len();
        self.buf.put_u32_le(len);
        Ok(pos)
    }

    fn patch_offset(&mut self, at: usize, target: usize) -> Result<(), EncodeError> {
        let relative = u32::try_from(target - at).map_err(|_| EncodeError::TooLarge("buffer"))?;
        self.buf[at..at + OFFSET_SIZE].copy_from_slice(&relative.to_le_bytes());
        Ok(())
    }
}

fn slice(buf: &[u8], offset: usize, needed: usize) -> Result<&[u8], DecodeError> {
    offset
        .checked_add(needed)
        .and_then(|end| buf.get(offset..end))
        .ok_or(DecodeError::OutOfBounds {
            offset,
            needed,
            len: buf.len(),
        })
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, DecodeError> {
    Ok(slice(buf, at, 2)?.get_u16_le())
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, DecodeError> {
    Ok(slice(buf, at, 4)?.get_u32_le())
}

/// Follows a forward `uoffset_t` stored at `at`
fn follow(buf: &[u8], at: usize) -> Result<usize, DecodeError> {
    let relative = read_u32(buf, at)? as usize;
    at.checked_add(relative).ok_or(DecodeError::OutOfBounds {
        offset: at,
        needed: relative,
        len: buf.len(),
    })
}

/// Read-only view of one table inside a buffer
#[derive(Debug, Clone, Copy)]
pub struct TableRef<'a> {
    buf: &'a [u8],
    pos: usize,
    vtable: usize,
    vtable_len: usize,
}

/// Open the root table of a buffer
pub fn root(buf: &[u8]) -> Result<TableRef<'_>, DecodeError> {
    let pos = follow(buf, 0)?;
    TableRef::at(buf, pos)
}

impl<'a> TableRef<'a> {
    fn at(buf: &'a [u8], pos: usize) -> Result<Self, DecodeError> {
        let soffset = slice(buf, pos, 4)?.get_i32_le();
        let vtable = i64::try_from(pos)
            .ok()
            .and_then(|p| usize::try_from(p - i64::from(soffset)).ok())
            .ok_or(DecodeError::InvalidVTable(pos))?;
        let vtable_len = usize::from(read_u16(buf, vtable)?);
        if vtable_len < 4 || vtable_len % 2 != 0 {
            return Err(DecodeError::InvalidVTable(pos));
        }
        slice(buf, vtable, vtable_len)?;
        Ok(Self {
            buf,
            pos,
            vtable,
            vtable_len,
        })
    }

    /// Absolute position of a field, or `None` when absent
    fn field(&self, slot: u16) -> Result<Option<usize>, DecodeError> {
        let entry = 4 + 2 * usize::from(slot);
        if entry + 2 > self.vtable_len {
            return Ok(None);
        }
        let offset = read_u16(self.buf, self.vtable + entry)?;
        Ok((offset != 0).then(|| self.pos + usize::from(offset)))
    }

    fn scalar(&self, slot: u16, width: usize) -> Result<Option<&'a [u8]>, DecodeError> {
        match self.field(slot)? {
            Some(at) => slice(self.buf, at, width).map(Some),
            None => Ok(None),
        }
    }

    pub fn u8(&self, slot: u16, default: u8) -> Result<u8, DecodeError> {
        Ok(self.scalar(slot, 1)?.map_or(default, |mut b| b.get_u8()))
    }

    pub fn bool(&self, slot: u16, default: bool) -> Result<bool, DecodeError> {
        Ok(self.u8(slot, u8::from(default))? != 0)
    }

    pub fn u16(&self, slot: u16, default: u16) -> Result<u16, DecodeError> {
        Ok(self.scalar(slot, 2)?.map_or(default, |mut b| b.get_u16_le()))
    }

    pub fn u32(&self, slot: u16, default: u32) -> Result<u32, DecodeError> {
        Ok(self.scalar(slot, 4)?.map_or(default, |mut b| b.get_u32_le()))
    }

    pub fn u64(&self, slot: u16, default: u64) -> Result<u64, DecodeError> {
        Ok(self.scalar(slot, 8)?.map_or(default, |mut b| b.get_u64_le()))
    }

    pub fn f32(&self, slot: u16, default: f32) -> Result<f32, DecodeError> {
        Ok(self.scalar(slot, 4)?.map_or(default, |mut b| b.get_f32_le()))
    }

    /// Inline struct made of `N` consecutive floats
    pub fn f32s<const N: usize>(&self, slot: u16) -> Result<Option<[f32; N]>, DecodeError> {
        let Some(mut bytes) = self.scalar(slot, N * 4)? else {
            return Ok(None);
        };
        let mut values = [0.0f32; N];
        for value in &mut values {
            *value = bytes.get_f32_le();
        }
        Ok(Some(values))
    }

    fn indirect(&self, slot: u16) -> Result<Option<usize>, DecodeError> {
        match self.field(slot)? {
            Some(at) => follow(self.buf, at).map(Some),
            None => Ok(None),
        }
    }

    fn vector(&self, slot: u16, element: usize) -> Result<Option<(usize, usize)>, DecodeError> {
        let Some(pos) = self.indirect(slot)? else {
            return Ok(None);
        };
        let len = read_u32(self.buf, pos)? as usize;
        let needed = len.checked_mul(element).ok_or(DecodeError::OutOfBounds {
            offset: pos,
            needed: usize::MAX,
            len: self.buf.len(),
        })?;
        slice(self.buf, pos + 4, needed)?;
        Ok(Some((pos + 4, len)))
    }

    pub fn bytes(&self, slot: u16) -> Result<Option<&'a [u8]>, DecodeError> {
        match self.vector(slot, 1)? {
            Some((start, len)) => Ok(Some(&self.buf[start..start + len])),
            None => Ok(None),
        }
    }

    pub fn str(&self, slot: u16) -> Result<Option<&'a str>, DecodeError> {
        match self.bytes(slot)? {
            Some(raw) => std::str::from_utf8(raw)
                .map(Some)
                .map_err(|_| DecodeError::InvalidUtf8),
            None => Ok(None),
        }
    }

    pub fn table(&self, slot: u16) -> Result<Option<TableRef<'a>>, DecodeError> {
        match self.indirect(slot)? {
            Some(pos) => TableRef::at(self.buf, pos).map(Some),
            None => Ok(None),
        }
    }

    pub fn tables(&self, slot: u16) -> Result<Vec<TableRef<'a>>, DecodeError> {
        let Some((start, len)) = self.vector(slot, OFFSET_SIZE)? else {
            return Ok(Vec::new());
        };
        (0..len)
            .map(|i| {
                let pos = follow(self.buf, start + i * OFFSET_SIZE)?;
                TableRef::at(self.buf, pos)
            })
            .collect()
    }
}
