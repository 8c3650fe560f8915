use sqlx::postgres::{PgRow, Postgres};
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

use super::types::{ResultCell, ResultRow};

pub(crate) fn convert_row(row: &PgRow) -> ResultRow {
    let cells = row
        .columns()
        .iter()
        .map(|column| {
            let index = column.ordinal();
            let type_name = column.type_info().name().to_string();
            let is_null = row
                .try_get_raw(index)
                .map(|raw| raw.is_null())
                .unwrap_or(true);
            let value = if is_null {
                "NULL".to_string()
            } else {
                cell_text(row, &type_name, index).unwrap_or_else(|| format!("<{}>", type_name))
            };

            ResultCell {
                column: column.name().to_string(),
                type_name,
                value,
                is_null,
            }
        })
        .collect();

    ResultRow { cells }
}

fn cell_text(row: &PgRow, type_name: &str, index: usize) -> Option<String> {
    match type_name {
        "BOOL" => decode_as::<bool>(row, index),
        "INT2" => decode_as::<i16>(row, index),
        "INT4" => decode_as::<i32>(row, index),
        "INT8" => decode_as::<i64>(row, index),
        "FLOAT4" => decode_as::<f32>(row, index),
        "FLOAT8" => decode_as::<f64>(row, index),
        "NUMERIC" => decode_as::<rust_decimal::Decimal>(row, index),
        // Text-like types
        _ => decode_as::<String>(row, index),
    }
}

fn decode_as<'r, T>(row: &'r PgRow, index: usize) -> Option<String>
where
    T: Decode<'r, Postgres> + Type<Postgres> + ToString,
{
    row.try_get::<T, _>(index).ok().map(|v| v.to_string())
}
