//! Arrow record batches to plain row records.

use arrow_array::cast::AsArray;
use arrow_array::types::{
    ArrowDictionaryKeyType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{Array, RecordBatch};
use arrow_cast::display::{ArrayFormatter, FormatOptions};
use arrow_schema::{ArrowError, DataType};
use serde_json::{Map, Number, Value};

/// One result row: column name to scalar value, in column order.
pub type Row = Map<String, Value>;

/// Flatten `batches` into rows, preserving batch and row order.
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>, ArrowError> {
    let total: usize = batches.iter().map(|b| b.num_rows()).sum();
    let mut rows = Vec::with_capacity(total);
    for batch in batches {
        let schema = batch.schema();
        for row_idx in 0..batch.num_rows() {
            let mut row = Map::with_capacity(batch.num_columns());
            for (field, column) in schema.fields().iter().zip(batch.columns()) {
                row.insert(
                    field.name().clone(),
                    array_value_to_json(column.as_ref(), row_idx)?,
                );
            }
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Convert a single Arrow value to JSON.
///
/// Numbers, booleans, strings, lists and structs map onto their JSON
/// counterparts. Temporal, binary and other types use Arrow's display form.
pub fn array_value_to_json(column: &dyn Array, row_idx: usize) -> Result<Value, ArrowError> {
    if column.is_null(row_idx) {
        return Ok(Value::Null);
    }

    let value = match column.data_type() {
        DataType::Null => Value::Null,
        DataType::Boolean => Value::Bool(column.as_boolean().value(row_idx)),
        DataType::Int8 => column.as_primitive::<Int8Type>().value(row_idx).into(),
        DataType::Int16 => column.as_primitive::<Int16Type>().value(row_idx).into(),
        DataType::Int32 => column.as_primitive::<Int32Type>().value(row_idx).into(),
        DataType::Int64 => column.as_primitive::<Int64Type>().value(row_idx).into(),
        DataType::UInt8 => column.as_primitive::<UInt8Type>().value(row_idx).into(),
        DataType::UInt16 => column.as_primitive::<UInt16Type>().value(row_idx).into(),
        DataType::UInt32 => column.as_primitive::<UInt32Type>().value(row_idx).into(),
        DataType::UInt64 => column.as_primitive::<UInt64Type>().value(row_idx).into(),
        DataType::Float32 => {
            float_to_json(column.as_primitive::<Float32Type>().value(row_idx) as f64)
        }
        DataType::Float64 => float_to_json(column.as_primitive::<Float64Type>().value(row_idx)),
        DataType::Utf8 => Value::String(column.as_string::<i32>().value(row_idx).to_string()),
        DataType::LargeUtf8 => Value::String(column.as_string::<i64>().value(row_idx).to_string()),
        DataType::Utf8View => Value::String(column.as_string_view().value(row_idx).to_string()),
        DataType::Decimal128(_, scale) | DataType::Decimal256(_, scale) => {
            decimal_to_json(&display_value(column, row_idx)?, *scale)
        }
        DataType::List(_) => {
            let values = column.as_list::<i32>().value(row_idx);
            list_to_json(values.as_ref())?
        }
        DataType::LargeList(_) => {
            let values = column.as_list::<i64>().value(row_idx);
            list_to_json(values.as_ref())?
        }
        DataType::FixedSizeList(_, _) => {
            let values = column.as_fixed_size_list().value(row_idx);
            list_to_json(values.as_ref())?
        }
        DataType::Struct(fields) => {
            let strct = column.as_struct();
            let mut object = Map::with_capacity(fields.len());
            for (field, child) in fields.iter().zip(strct.columns()) {
                object.insert(
                    field.name().clone(),
                    array_value_to_json(child.as_ref(), row_idx)?,
                );
            }
            Value::Object(object)
        }
        DataType::Dictionary(key_type, _) => match key_type.as_ref() {
            DataType::Int8 => dictionary_entry::<Int8Type>(column, row_idx)?,
            DataType::Int16 => dictionary_entry::<Int16Type>(column, row_idx)?,
            DataType::Int32 => dictionary_entry::<Int32Type>(column, row_idx)?,
            DataType::Int64 => dictionary_entry::<Int64Type>(column, row_idx)?,
            DataType::UInt8 => dictionary_entry::<UInt8Type>(column, row_idx)?,
            DataType::UInt16 => dictionary_entry::<UInt16Type>(column, row_idx)?,
            DataType::UInt32 => dictionary_entry::<UInt32Type>(column, row_idx)?,
            DataType::UInt64 => dictionary_entry::<UInt64Type>(column, row_idx)?,
            _ => Value::String(display_value(column, row_idx)?),
        },
        _ => Value::String(display_value(column, row_idx)?),
    };
    Ok(value)
}

/// Look up one dictionary-encoded value through its key, without
/// materializing the whole key column.
fn dictionary_entry<K>(column: &dyn Array, row_idx: usize) -> Result<Value, ArrowError>
where
    K: ArrowDictionaryKeyType,
    usize: TryFrom<K::Native>,
{
    let dict = column.as_dictionary::<K>();
    let key = usize::try_from(dict.keys().value(row_idx)).map_err(|_| {
        ArrowError::InvalidArgumentError(format!("invalid dictionary key at row {row_idx}"))
    })?;
    array_value_to_json(dict.values().as_ref(), key)
}

fn list_to_json(values: &dyn Array) -> Result<Value, ArrowError> {
    (0..values.len())
        .map(|idx| array_value_to_json(values, idx))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn float_to_json(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn decimal_to_json(formatted: &str, scale: i8) -> Value {
    if scale <= 0 {
        if let Ok(int) = formatted.parse::<i64>() {
            return int.into();
        }
    }
    match formatted.parse::<f64>() {
        Ok(float) => float_to_json(float),
        Err(_) => Value::String(formatted.to_string()),
    }
}

fn display_value(column: &dyn Array, row_idx: usize) -> Result<String, ArrowError> {
    let options = FormatOptions::default();
    let formatter = ArrayFormatter::try_new(column, &options)?;
    Ok(formatter.value(row_idx).to_string())
}
