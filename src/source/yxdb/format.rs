//! File layout of the fixed-schema binary database format: header,
//! field metadata, and per-field value encodings.

use crate::core::{ConvertError, Result, SemanticType, StorageType, Value};
use encoding_rs::WINDOWS_1252;
use regex::Regex;

pub const HEADER_LEN: usize = 512;
const MAGIC: &[u8] = b"Alteryx";
const META_CHARS_OFFSET: usize = 80;
const RECORD_COUNT_OFFSET: usize = 104;
/// Largest declared width accepted for a fixed-size field. A fixed field wider
/// than one decompressed block cannot come from a well-formed file.
pub const MAX_FIELD_SIZE: usize = 0x40000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Byte,
    Int16,
    Int32,
    Int64,
    FixedDecimal,
    Float,
    Double,
    String,
    WString,
    VString,
    VWString,
    Date,
    DateTime,
    Time,
    Blob,
    SpatialObj,
}

impl FieldType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "Bool" => FieldType::Bool,
            "Byte" => FieldType::Byte,
            "Int16" => FieldType::Int16,
            "Int32" => FieldType::Int32,
            "Int64" => FieldType::Int64,
            "FixedDecimal" => FieldType::FixedDecimal,
            "Float" => FieldType::Float,
            "Double" => FieldType::Double,
            "String" => FieldType::String,
            "WString" => FieldType::WString,
            "V_String" => FieldType::VString,
            "V_WString" => FieldType::VWString,
            "Date" => FieldType::Date,
            "DateTime" => FieldType::DateTime,
            "Time" => FieldType::Time,
            "Blob" => FieldType::Blob,
            "SpatialObj" => FieldType::SpatialObj,
            _ => return None,
        })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            FieldType::Bool => "Bool",
            FieldType::Byte => "Byte",
            FieldType::Int16 => "Int16",
            FieldType::Int32 => "Int32",
            FieldType::Int64 => "Int64",
            FieldType::FixedDecimal => "FixedDecimal",
            FieldType::Float => "Float",
            FieldType::Double => "Double",
            FieldType::String => "String",
            FieldType::WString => "WString",
            FieldType::VString => "V_String",
            FieldType::VWString => "V_WString",
            FieldType::Date => "Date",
            FieldType::DateTime => "DateTime",
            FieldType::Time => "Time",
            FieldType::Blob => "Blob",
            FieldType::SpatialObj => "SpatialObj",
        }
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            FieldType::Bool
            | FieldType::Byte
            | FieldType::Int16
            | FieldType::Int32
            | FieldType::Int64 => StorageType::Integer,
            FieldType::FixedDecimal | FieldType::Float | FieldType::Double => StorageType::Real,
            FieldType::Blob => StorageType::Blob,
            _ => StorageType::Text,
        }
    }

    pub fn semantic_type(&self) -> SemanticType {
        match self {
            FieldType::Bool => SemanticType::Boolean,
            FieldType::Byte | FieldType::Int16 | FieldType::Int32 | FieldType::Int64 => {
                SemanticType::Integer
            }
            FieldType::FixedDecimal | FieldType::Float | FieldType::Double => SemanticType::Float,
            FieldType::Blob => SemanticType::Binary,
            FieldType::SpatialObj => SemanticType::Json,
            _ => SemanticType::Text,
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(
            self,
            FieldType::VString | FieldType::VWString | FieldType::Blob | FieldType::SpatialObj
        )
    }

    /// Bytes the field occupies in the fixed part of a record, null flag included.
    /// `None` when the declared size does not fit in memory arithmetic.
    pub fn fixed_width(&self, size: usize) -> Option<usize> {
        match self {
            FieldType::Bool => Some(1),
            FieldType::Byte => Some(2),
            FieldType::Int16 => Some(3),
            FieldType::Int32 | FieldType::Float => Some(5),
            FieldType::Int64 | FieldType::Double => Some(9),
            FieldType::FixedDecimal | FieldType::String => size.checked_add(1),
            FieldType::WString => size.checked_mul(2)?.checked_add(1),
            FieldType::Date => Some(11),
            FieldType::DateTime => Some(20),
            FieldType::Time => Some(9),
            FieldType::VString | FieldType::VWString | FieldType::Blob | FieldType::SpatialObj => {
                Some(4)
            }
        }
    }

    /// Whether the declared `size` attribute sets this field's width.
    fn is_sized(&self) -> bool {
        matches!(
            self,
            FieldType::FixedDecimal | FieldType::String | FieldType::WString
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub meta_chars: usize,
    pub record_count: u64,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || !bytes.starts_with(MAGIC) {
            return Err(ConvertError::malformed("not a yxdb file (bad header)"));
        }
        let meta_chars = i32::from_le_bytes(read_array(bytes, META_CHARS_OFFSET)?);
        let record_count = i64::from_le_bytes(read_array(bytes, RECORD_COUNT_OFFSET)?);
        if meta_chars <= 0 || record_count < 0 {
            return Err(ConvertError::malformed("yxdb header has invalid lengths"));
        }
        Ok(Self {
            meta_chars: meta_chars as usize,
            record_count: record_count as u64,
        })
    }

    /// Offset of the first record block.
    pub fn data_offset(&self) -> u64 {
        (HEADER_LEN + self.meta_chars * 2) as u64
    }
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    bytes
        .get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ConvertError::malformed("truncated yxdb header"))
}

/// Parses the `RecordInfo` XML that declares the field list.
pub fn parse_metadata(xml: &str) -> Result<Vec<FieldInfo>> {
    let field_re = Regex::new(r"<Field\s([^>]*)>").map_err(pattern_error)?;
    let attr_re = Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#).map_err(pattern_error)?;

    let mut fields = Vec::new();
    for element in field_re.captures_iter(xml) {
        let mut name = None;
        let mut tag = None;
        let mut declared_size = None;
        for attr in attr_re.captures_iter(&element[1]) {
            let value = unescape_xml(&attr[2]);
            match &attr[1] {
                "name" => name = Some(value),
                "type" => tag = Some(value),
                "size" => declared_size = Some(value),
                _ => {}
            }
        }

        let name = name.ok_or_else(|| ConvertError::malformed("yxdb field without a name"))?;
        let tag = tag.unwrap_or_default();
        let field_type = FieldType::from_tag(&tag).ok_or_else(|| {
            ConvertError::malformed(format!("field '{name}' has unknown type '{tag}'"))
        })?;
        let size = match declared_size {
            Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
                ConvertError::malformed(format!("field '{name}' has invalid size '{raw}'"))
            })?,
            None => 0,
        };
        if field_type.is_sized() && size > MAX_FIELD_SIZE {
            return Err(ConvertError::malformed(format!(
                "field '{name}' declares size {size}, above the limit of {MAX_FIELD_SIZE}"
            )));
        }
        fields.push(FieldInfo {
            name,
            field_type,
            size,
        });
    }

    if fields.is_empty() {
        return Err(ConvertError::malformed("yxdb metadata declares no fields"));
    }
    Ok(fields)
}

fn pattern_error(e: regex::Error) -> ConvertError {
    ConvertError::Conversion(format!("metadata pattern: {e}"))
}

fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn decode_latin1(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    WINDOWS_1252.decode_without_bom_handling(&bytes[..end]).0.into_owned()
}

/// A field that could not be read from its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldUnreadable;

type FieldResult<T> = std::result::Result<T, FieldUnreadable>;

fn bytes_at(record: &[u8], start: usize, len: usize) -> FieldResult<&[u8]> {
    record.get(start..start + len).ok_or(FieldUnreadable)
}

fn null_flag(record: &[u8], at: usize) -> FieldResult<bool> {
    record.get(at).map(|b| *b == 1).ok_or(FieldUnreadable)
}

fn fixed<const N: usize>(record: &[u8], start: usize) -> FieldResult<Option<[u8; N]>> {
    if null_flag(record, start + N)? {
        return Ok(None);
    }
    let bytes = bytes_at(record, start, N)?;
    bytes.try_into().map(Some).map_err(|_| FieldUnreadable)
}

/// Decodes one field that starts at `start` in `record`.
///
/// `record` holds the fixed part followed by the variable-data area, so
/// variable-width pointers resolve inside the same slice.
pub fn decode_field(field: &FieldInfo, record: &[u8], start: usize) -> FieldResult<Value> {
    let value = match field.field_type {
        FieldType::Bool => match *record.get(start).ok_or(FieldUnreadable)? {
            2 => Value::Null,
            b => Value::Boolean(b == 1),
        },
        FieldType::Byte => fixed::<1>(record, start)?
            .map(|b| Value::Integer(i64::from(b[0])))
            .unwrap_or(Value::Null),
        FieldType::Int16 => fixed::<2>(record, start)?
            .map(|b| Value::Integer(i64::from(i16::from_le_bytes(b))))
            .unwrap_or(Value::Null),
        FieldType::Int32 => fixed::<4>(record, start)?
            .map(|b| Value::Integer(i64::from(i32::from_le_bytes(b))))
            .unwrap_or(Value::Null),
        FieldType::Int64 => fixed::<8>(record, start)?
            .map(|b| Value::Integer(i64::from_le_bytes(b)))
            .unwrap_or(Value::Null),
        FieldType::Float => fixed::<4>(record, start)?
            .map(|b| Value::Float(f64::from(f32::from_le_bytes(b))))
            .unwrap_or(Value::Null),
        FieldType::Double => fixed::<8>(record, start)?
            .map(|b| Value::Float(f64::from_le_bytes(b)))
            .unwrap_or(Value::Null),
        FieldType::FixedDecimal => {
            if null_flag(record, start + field.size)? {
                Value::Null
            } else {
                let text = decode_latin1(bytes_at(record, start, field.size)?);
                match text.trim().parse::<f64>() {
                    Ok(f) => Value::Float(f),
                    Err(_) => Value::Text(text),
                }
            }
        }
        FieldType::String => text_field(record, start, field.size, decode_latin1)?,
        FieldType::WString => text_field(record, start, field.size * 2, decode_utf16le)?,
        FieldType::Date => text_field(record, start, 10, decode_latin1)?,
        FieldType::DateTime => text_field(record, start, 19, decode_latin1)?,
        FieldType::Time => text_field(record, start, 8, decode_latin1)?,
        FieldType::VString => blob(record, start)?
            .map(|b| Value::Text(decode_latin1(b)))
            .unwrap_or(Value::Null),
        FieldType::VWString => blob(record, start)?
            .map(|b| Value::Text(decode_utf16le(b)))
            .unwrap_or(Value::Null),
        FieldType::Blob => blob(record, start)?
            .map(|b| Value::Blob(b.to_vec()))
            .unwrap_or(Value::Null),
        FieldType::SpatialObj => blob(record, start)?.map(spatial_value).unwrap_or(Value::Null),
    };
    Ok(value)
}

fn text_field(
    record: &[u8],
    start: usize,
    len: usize,
    decode: fn(&[u8]) -> String,
) -> FieldResult<Value> {
    if null_flag(record, start + len)? {
        return Ok(Value::Null);
    }
    Ok(Value::Text(decode(bytes_at(record, start, len)?)))
}

/// Resolves a variable-width pointer. `None` is a null value.
fn blob(record: &[u8], start: usize) -> FieldResult<Option<&[u8]>> {
    let fixed_portion = u32::from_le_bytes(
        bytes_at(record, start, 4)?
            .try_into()
            .map_err(|_| FieldUnreadable)?,
    );
    match fixed_portion {
        0 => return Ok(Some(&[])),
        1 => return Ok(None),
        _ => {}
    }

    // Up to three bytes can live inline, with the length in bits 28-29.
    if fixed_portion & 0x8000_0000 == 0 && fixed_portion & 0x3000_0000 != 0 {
        let len = (fixed_portion >> 28) as usize;
        return bytes_at(record, start, len).map(Some);
    }

    let block_start = start + (fixed_portion & 0x7fff_ffff) as usize;
    let first = *record.get(block_start).ok_or(FieldUnreadable)?;
    if first & 1 == 1 {
        let len = (first >> 1) as usize;
        bytes_at(record, block_start + 1, len).map(Some)
    } else {
        let raw = u32::from_le_bytes(
            bytes_at(record, block_start, 4)?
                .try_into()
                .map_err(|_| FieldUnreadable)?,
        );
        bytes_at(record, block_start + 4, (raw / 2) as usize).map(Some)
    }
}

/// Renders point geometries as GeoJSON; other shapes fall back to hex.
fn spatial_value(bytes: &[u8]) -> Value {
    const POINT: i32 = 1;
    let shape = bytes
        .get(0..4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_le_bytes);
    let coord = |offset: usize| {
        bytes
            .get(offset..offset + 8)
            .and_then(|b| b.try_into().ok())
            .map(f64::from_le_bytes)
    };

    if let (Some(POINT), Some(x), Some(y)) = (shape, coord(4), coord(12)) {
        let geometry = serde_json::json!({ "type": "Point", "coordinates": [x, y] });
        return Value::Json(geometry.to_string());
    }
    Value::Text(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(field_type: FieldType, size: usize) -> FieldInfo {
        FieldInfo {
            name: "f".to_string(),
            field_type,
            size,
        }
    }

    #[test]
    fn parses_field_metadata() {
        let xml = r#"<RecordInfo>
            <Field name="id" source="x" type="Int32"/>
            <Field name="R&amp;D" size="20" type="V_WString">
              <Description>notes</Description>
            </Field>
        </RecordInfo>"#;
        let fields = parse_metadata(xml).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field_type, FieldType::Int32);
        assert_eq!(fields[1].name, "R&D");
        assert_eq!(fields[1].size, 20);
    }

    #[test]
    fn unknown_type_is_malformed() {
        let xml = r#"<RecordInfo><Field name="a" type="Quaternion"/></RecordInfo>"#;
        assert!(parse_metadata(xml).is_err());
    }

    #[test]
    fn field_sizes_are_bounded() {
        let too_wide = format!(
            r#"<RecordInfo><Field name="w" size="{}" type="WString"/></RecordInfo>"#,
            MAX_FIELD_SIZE + 1
        );
        assert!(matches!(
            parse_metadata(&too_wide),
            Err(ConvertError::MalformedSource(_))
        ));
        let garbage = r#"<RecordInfo><Field name="s" size="-3" type="String"/></RecordInfo>"#;
        assert!(parse_metadata(garbage).is_err());

        assert_eq!(FieldType::WString.fixed_width(10), Some(21));
        assert_eq!(FieldType::WString.fixed_width(usize::MAX), None);
        assert_eq!(FieldType::String.fixed_width(usize::MAX), None);
    }

    #[test]
    fn type_tags_map_to_storage() {
        assert_eq!(FieldType::Int16.storage_type(), StorageType::Integer);
        assert_eq!(FieldType::Bool.storage_type(), StorageType::Integer);
        assert_eq!(FieldType::FixedDecimal.storage_type(), StorageType::Real);
        assert_eq!(FieldType::VWString.storage_type(), StorageType::Text);
        assert_eq!(FieldType::DateTime.storage_type(), StorageType::Text);
        assert_eq!(FieldType::SpatialObj.storage_type(), StorageType::Text);
        assert_eq!(FieldType::Blob.storage_type(), StorageType::Blob);
    }

    #[test]
    fn decodes_fixed_fields_and_null_flags() {
        let record = [7, 0, 0, 0, 0];
        assert_eq!(
            decode_field(&field(FieldType::Int32, 4), &record, 0),
            Ok(Value::Integer(7))
        );
        let null = [7, 0, 0, 0, 1];
        assert_eq!(
            decode_field(&field(FieldType::Int32, 4), &null, 0),
            Ok(Value::Null)
        );
        assert_eq!(
            decode_field(&field(FieldType::Bool, 1), &[2], 0),
            Ok(Value::Null)
        );
        assert_eq!(
            decode_field(&field(FieldType::String, 4), b"ab\0\0\0", 0),
            Ok(Value::Text("ab".to_string()))
        );
    }

    #[test]
    fn truncated_field_is_unreadable() {
        assert_eq!(
            decode_field(&field(FieldType::Int64, 8), &[1, 2, 3], 0),
            Err(FieldUnreadable)
        );
    }

    #[test]
    fn resolves_variable_width_encodings() {
        let vstring = field(FieldType::VString, 0);
        // Small block: pointer 4 bytes ahead, length byte (3 << 1) | 1.
        let small = [4, 0, 0, 0, 7, b'x', b'y', b'z'];
        assert_eq!(decode_field(&vstring, &small, 0), Ok(Value::Text("xyz".to_string())));
        // Tiny value stored inline.
        let tiny = [b'h', b'i', 0, 0x20];
        assert_eq!(decode_field(&vstring, &tiny, 0), Ok(Value::Text("hi".to_string())));
        // Normal block: length word holds twice the byte length.
        let normal = [4, 0, 0, 0, 4, 0, 0, 0, b'o', b'k'];
        assert_eq!(decode_field(&vstring, &normal, 0), Ok(Value::Text("ok".to_string())));
        assert_eq!(decode_field(&vstring, &[1, 0, 0, 0], 0), Ok(Value::Null));
        assert_eq!(decode_field(&vstring, &[0, 0, 0, 0], 0), Ok(Value::Text(String::new())));
    }

    #[test]
    fn point_geometry_becomes_geojson() {
        let mut bytes = 1i32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1.5f64.to_le_bytes());
        bytes.extend_from_slice(&(-2.0f64).to_le_bytes());
        assert_eq!(
            spatial_value(&bytes),
            Value::Json(r#"{"coordinates":[1.5,-2.0],"type":"Point"}"#.to_string())
        );
        assert_eq!(spatial_value(&[9, 9]), Value::Text("0909".to_string()));
    }
}
