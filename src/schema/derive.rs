use tracing::{debug, warn};

use super::{Column, ColumnType};
use crate::error::{Error, Result};

/// For each column, look at the sampled rows:
///  - Ignore null cells
///  - Classify each value as integer, real or text
///  - Integer and real mix to real; anything mixed with text is text
///  - A column with no samples defaults to text
pub fn derive_types(
    table_name: &str,
    header_names: &[String],
    sample_rows: &[Vec<Option<String>>],
) -> Result<Vec<Column>> {
    if header_names.is_empty() {
        return Err(Error::Validation(format!(
            "derive_types: `{}` has no headers",
            table_name
        )));
    }

    if sample_rows.iter().any(|r| r.len() > header_names.len()) {
        warn!(
            "derive_types: some rows in `{}` have more cells than headers ({} headers)",
            table_name,
            header_names.len()
        );
    }

    let mut cols = Vec::with_capacity(header_names.len());

    for (idx, name) in header_names.iter().enumerate() {
        let mut ty: Option<ColumnType> = None;

        for row in sample_rows {
            let Some(cell) = row.get(idx).and_then(|c| c.as_deref()) else {
                continue;
            };
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }
            let inferred = infer_type(cell);
            ty = Some(match ty {
                None => inferred,
                Some(prev) => prev.widen(inferred),
            });
            if ty == Some(ColumnType::Text) {
                break;
            }
        }

        let ty = ty.unwrap_or_else(|| {
            debug!(
                "derive_types: no samples for `{}` in `{}`, defaulting to text",
                name, table_name
            );
            ColumnType::Text
        });

        cols.push(Column {
            name: name.clone(),
            ty,
        });
    }

    Ok(cols)
}

fn infer_type(v: &str) -> ColumnType {
    // Leading zeros are identifiers, not numbers.
    let digits = v.strip_prefix('-').unwrap_or(v);
    if digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.") {
        return ColumnType::Text;
    }
    if v.parse::<i64>().is_ok() {
        return ColumnType::Integer;
    }
    match v.parse::<f64>() {
        Ok(f) if f.is_finite() => ColumnType::Real,
        _ => ColumnType::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(data: &[&[&str]]) -> Vec<Vec<Option<String>>> {
        data.iter()
            .map(|r| {
                r.iter()
                    .map(|c| (!c.is_empty()).then(|| c.to_string()))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn infers_and_widens() {
        let headers: Vec<String> = ["name", "age", "bodyweight_kg", "place", "tested"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let sample = rows(&[
            &["Alice", "23", "59.4", "1", ""],
            &["Bob", "", "82", "DQ", ""],
            &["Carol", "31", "71.25", "2", ""],
        ]);
        let cols = derive_types("openpowerlifting", &headers, &sample).unwrap();
        let types: Vec<_> = cols.iter().map(|c| c.ty).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::Text,
                ColumnType::Integer,
                ColumnType::Real,
                ColumnType::Text,
                ColumnType::Text,
            ]
        );
    }

    #[test]
    fn leading_zeros_stay_text() {
        assert_eq!(infer_type("007"), ColumnType::Text);
        assert_eq!(infer_type("0"), ColumnType::Integer);
        assert_eq!(infer_type("0.5"), ColumnType::Real);
        assert_eq!(infer_type("-12.5"), ColumnType::Real);
        assert_eq!(infer_type("NaN"), ColumnType::Text);
    }

    #[test]
    fn no_headers_is_an_error() {
        assert!(derive_types("t", &[], &[]).is_err());
    }
}
