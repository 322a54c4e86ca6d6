//! The cross-dtype coercion engine used on every read/write whose requested
//! dtype differs from the channel's native dtype.

use crate::dbr::{DbrValue, EpicsString, NativeType};
use crate::support::{CaResult, ConvertError};

/// Encoding applied at every string ↔ bytes boundary. The default is latin-1.
/// This is a plain value threaded through call sites, not process state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StringEncoding {
    Latin1,
    Utf8,
}

impl Default for StringEncoding {
    #[inline]
    fn default() -> StringEncoding {
        StringEncoding::Latin1
    }
}

impl StringEncoding {
    pub fn decode(self, bytes: &[u8]) -> CaResult<String> {
        match self {
            StringEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
            StringEncoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|_| ConvertError::BadString.into()),
        }
    }

    pub fn encode(self, text: &str) -> CaResult<Vec<u8>> {
        match self {
            StringEncoding::Latin1 => {
                let mut bytes = Vec::with_capacity(text.len());
                for ch in text.chars() {
                    let code = ch as u32;
                    if code > 0xff {
                        return Err(ConvertError::Unencodable.into());
                    }
                    bytes.push(code as u8);
                }
                Ok(bytes)
            }
            StringEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
        }
    }
}

/// Per-channel context consulted during conversion.
#[derive(Debug, Copy, Clone)]
pub struct ConvertCtx<'a> {
    pub encoding: StringEncoding,
    pub enum_strings: &'a [String],
    /// Maximum element count for char-array targets.
    pub max_length: Option<usize>,
}

impl<'a> ConvertCtx<'a> {
    #[inline]
    pub fn new() -> ConvertCtx<'a> {
        ConvertCtx { encoding: StringEncoding::default(), enum_strings: &[], max_length: None }
    }
}

fn collect_numeric(to: NativeType, source: impl Iterator<Item = f64>) -> DbrValue {
    // Casts through the host double saturate at the target range and
    // truncate toward zero for integer targets.
    match to {
        NativeType::Int => DbrValue::Int(source.map(|v| v as i16).collect()),
        NativeType::Float => DbrValue::Float(source.map(|v| v as f32).collect()),
        NativeType::Enum => DbrValue::Enum(source.map(|v| v as u16).collect()),
        NativeType::Char => DbrValue::Char(source.map(|v| v as u8).collect()),
        NativeType::Long => DbrValue::Long(source.map(|v| v as i32).collect()),
        NativeType::Double => DbrValue::Double(source.collect()),
        NativeType::String => unreachable!("string targets handled by the caller"),
    }
}

fn numeric_elements(values: &DbrValue) -> Option<Vec<f64>> {
    Some(match values {
        DbrValue::String(_) => return None,
        DbrValue::Int(v) => v.iter().map(|&x| f64::from(x)).collect(),
        DbrValue::Float(v) => v.iter().map(|&x| f64::from(x)).collect(),
        DbrValue::Enum(v) => v.iter().map(|&x| f64::from(x)).collect(),
        DbrValue::Char(v) => v.iter().map(|&x| f64::from(x)).collect(),
        DbrValue::Long(v) => v.iter().map(|&x| f64::from(x)).collect(),
        DbrValue::Double(v) => v.clone(),
    })
}

fn format_numeric(values: &DbrValue, ctx: &ConvertCtx) -> CaResult<DbrValue> {
    let mut cells = Vec::with_capacity(values.len());

    match values {
        DbrValue::Int(v) => {
            for x in v {
                cells.push(EpicsString::from_bytes(&ctx.encoding.encode(&x.to_string())?)?);
            }
        }
        DbrValue::Float(v) => {
            for x in v {
                cells.push(EpicsString::from_bytes(&ctx.encoding.encode(&x.to_string())?)?);
            }
        }
        DbrValue::Long(v) => {
            for x in v {
                cells.push(EpicsString::from_bytes(&ctx.encoding.encode(&x.to_string())?)?);
            }
        }
        DbrValue::Double(v) => {
            for x in v {
                cells.push(EpicsString::from_bytes(&ctx.encoding.encode(&x.to_string())?)?);
            }
        }
        _ => unreachable!("caller dispatches only plain numerics here"),
    }

    Ok(DbrValue::String(cells))
}

fn parse_string_cells(cells: &[EpicsString], ctx: &ConvertCtx) -> CaResult<Vec<f64>> {
    let mut parsed = Vec::with_capacity(cells.len());

    for cell in cells {
        let text = ctx.encoding.decode(cell.as_bytes())?;
        let value = text.trim().parse::<f64>().map_err(|_| ConvertError::BadString)?;
        parsed.push(value);
    }

    Ok(parsed)
}

fn string_to_enum(cells: &[EpicsString], ctx: &ConvertCtx) -> CaResult<DbrValue> {
    let mut indexes = Vec::with_capacity(cells.len());

    for cell in cells {
        let decoded = ctx.encoding.decode(cell.as_bytes())?;

        let index = ctx.enum_strings.iter().position(|s| {
            s.as_bytes() == cell.as_bytes() || *s == decoded
        });

        match index {
            Some(index) => indexes.push(index as u16),
            None => return Err(ConvertError::NoSuchEnumString.into()),
        }
    }

    Ok(DbrValue::Enum(indexes))
}

fn enum_to_string(indexes: &[u16], ctx: &ConvertCtx) -> CaResult<DbrValue> {
    let mut cells = Vec::with_capacity(indexes.len());

    for &index in indexes {
        // Out-of-range indexes render as the empty string.
        let cell = match ctx.enum_strings.get(index as usize) {
            Some(s) => EpicsString::from_bytes(&ctx.encoding.encode(s)?)?,
            None => EpicsString::default(),
        };
        cells.push(cell);
    }

    Ok(DbrValue::String(cells))
}

fn char_to_string(bytes: &[u8], ctx: &ConvertCtx) -> CaResult<DbrValue> {
    // The byte array is one NUL-terminated text, not per-element strings.
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let text = ctx.encoding.decode(&bytes[..end])?;

    Ok(DbrValue::String(vec![EpicsString::from_bytes(&ctx.encoding.encode(&text)?)?]))
}

fn string_to_char(cells: &[EpicsString], ctx: &ConvertCtx) -> CaResult<DbrValue> {
    let cell = cells.first().cloned().unwrap_or_default();
    let mut bytes = ctx.encoding.encode(&ctx.encoding.decode(cell.as_bytes())?)?;
    bytes.push(0);

    if let Some(max_length) = ctx.max_length {
        if bytes.len() > max_length {
            return Err(ConvertError::TooLong.into());
        }
    }

    Ok(DbrValue::Char(bytes))
}

/// Converts `values` into the requested native type, consulting the channel
/// context for encodings, enum strings and char-array capacity.
pub fn convert_values(values: &DbrValue, to: NativeType, ctx: &ConvertCtx) -> CaResult<DbrValue> {
    let from = values.native();

    if from == to {
        return Ok(values.clone());
    }

    match (values, to) {
        // Enum sources: strings via the state names, numerics via the index.
        (DbrValue::Enum(v), NativeType::String) => enum_to_string(v, ctx),

        // Char arrays are text when a string is requested.
        (DbrValue::Char(v), NativeType::String) => char_to_string(v, ctx),

        // String sources.
        (DbrValue::String(cells), NativeType::Enum) => string_to_enum(cells, ctx),
        (DbrValue::String(cells), NativeType::Char) => string_to_char(cells, ctx),
        (DbrValue::String(cells), _) => Ok(collect_numeric(to, parse_string_cells(cells, ctx)?.into_iter())),

        // Plain numerics to string.
        (_, NativeType::String) => format_numeric(values, ctx),

        // Everything numeric-ish goes through the host double.
        _ => {
            let elements = numeric_elements(values).ok_or(ConvertError::BadString)?;
            Ok(collect_numeric(to, elements.into_iter()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enum_ctx(strings: &[String]) -> ConvertCtx {
        ConvertCtx { encoding: StringEncoding::Latin1, enum_strings: strings, max_length: None }
    }

    fn state_strings() -> Vec<String> {
        vec!["Stop".to_string(), "Start".to_string(), "Pause".to_string(), "Resume".to_string()]
    }

    #[test]
    fn test_identity() {
        let values = DbrValue::Double(vec![1.5]);
        assert_eq!(convert_values(&values, NativeType::Double, &ConvertCtx::new()).unwrap(), values);
    }

    #[test]
    fn test_numeric_widening_and_narrowing() {
        let values = DbrValue::Long(vec![0, 1, 3999]);
        let ctx = ConvertCtx::new();

        assert_eq!(
            convert_values(&values, NativeType::Double, &ctx).unwrap(),
            DbrValue::Double(vec![0.0, 1.0, 3999.0])
        );

        // Narrowing saturates at the target range.
        let wide = DbrValue::Long(vec![40_000, -40_000]);
        assert_eq!(convert_values(&wide, NativeType::Int, &ctx).unwrap(), DbrValue::Int(vec![32_767, -32_768]));
    }

    #[test]
    fn test_float_to_int_truncates() {
        let values = DbrValue::Double(vec![1.9, -1.9]);
        assert_eq!(
            convert_values(&values, NativeType::Long, &ConvertCtx::new()).unwrap(),
            DbrValue::Long(vec![1, -1])
        );
    }

    #[test]
    fn test_string_to_numeric() {
        let values = DbrValue::String(vec![EpicsString::from_bytes(b"1.25").unwrap()]);
        assert_eq!(
            convert_values(&values, NativeType::Double, &ConvertCtx::new()).unwrap(),
            DbrValue::Double(vec![1.25])
        );
    }

    #[test]
    fn test_string_to_numeric_err_bad_literal() {
        let values = DbrValue::String(vec![EpicsString::from_bytes(b"bogus").unwrap()]);
        assert_eq!(
            convert_values(&values, NativeType::Long, &ConvertCtx::new()),
            Err(ConvertError::BadString.into())
        );
    }

    #[test]
    fn test_numeric_to_string() {
        let values = DbrValue::Long(vec![42]);
        let converted = convert_values(&values, NativeType::String, &ConvertCtx::new()).unwrap();

        match converted {
            DbrValue::String(cells) => assert_eq!(cells[0].as_bytes(), b"42"),
            other => panic!("Unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_string_to_enum() {
        let strings = state_strings();
        let values = DbrValue::String(vec![EpicsString::from_bytes(b"Start").unwrap()]);

        assert_eq!(
            convert_values(&values, NativeType::Enum, &enum_ctx(&strings)).unwrap(),
            DbrValue::Enum(vec![1])
        );
    }

    #[test]
    fn test_string_to_enum_err_absent() {
        let strings = state_strings();
        let values = DbrValue::String(vec![EpicsString::from_bytes(b"bogus").unwrap()]);

        assert_eq!(
            convert_values(&values, NativeType::Enum, &enum_ctx(&strings)),
            Err(ConvertError::NoSuchEnumString.into())
        );
    }

    #[test]
    fn test_string_to_enum_err_no_states() {
        let values = DbrValue::String(vec![EpicsString::from_bytes(b"Start").unwrap()]);
        assert_eq!(
            convert_values(&values, NativeType::Enum, &ConvertCtx::new()),
            Err(ConvertError::NoSuchEnumString.into())
        );
    }

    #[test]
    fn test_enum_to_string() {
        let strings = state_strings();
        let values = DbrValue::Enum(vec![1, 9]);
        let converted = convert_values(&values, NativeType::String, &enum_ctx(&strings)).unwrap();

        match converted {
            DbrValue::String(cells) => {
                assert_eq!(cells[0].as_bytes(), b"Start");
                // Out-of-range index renders empty.
                assert_eq!(cells[1].as_bytes(), b"");
            }
            other => panic!("Unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_char_array_to_string() {
        let values = DbrValue::Char(b"hello\0junk".to_vec());
        let converted = convert_values(&values, NativeType::String, &ConvertCtx::new()).unwrap();

        match converted {
            DbrValue::String(cells) => {
                assert_eq!(cells.len(), 1);
                assert_eq!(cells[0].as_bytes(), b"hello");
            }
            other => panic!("Unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_string_to_char_appends_nul() {
        let values = DbrValue::String(vec![EpicsString::from_bytes(b"abc").unwrap()]);
        assert_eq!(
            convert_values(&values, NativeType::Char, &ConvertCtx::new()).unwrap(),
            DbrValue::Char(b"abc\0".to_vec())
        );
    }

    #[test]
    fn test_string_to_char_err_exceeds_max_length() {
        let ctx = ConvertCtx { max_length: Some(3), ..ConvertCtx::new() };
        let values = DbrValue::String(vec![EpicsString::from_bytes(b"abc").unwrap()]);

        assert_eq!(convert_values(&values, NativeType::Char, &ctx), Err(ConvertError::TooLong.into()));
    }

    #[test]
    fn test_latin1_roundtrip() {
        let encoding = StringEncoding::Latin1;
        let bytes = [0x61, 0xe9, 0xff];
        let text = encoding.decode(&bytes).unwrap();
        assert_eq!(encoding.encode(&text).unwrap(), bytes.to_vec());
    }

    #[test]
    fn test_latin1_err_unencodable() {
        assert_eq!(
            StringEncoding::Latin1.encode("\u{2603}"),
            Err(ConvertError::Unencodable.into())
        );
    }
}
