//! Defensive extraction of numeric fields from untrusted JSON payloads

use serde_json::Value;

/// Numeric JSON value as f64; anything else (bool, string, null, missing) is None
pub fn num(v: Option<&Value>) -> Option<f64> {
    v.and_then(Value::as_f64)
}

/// Integral JSON value; floats are truncated like the devices' firmware expects
pub fn int(v: Option<&Value>) -> Option<i64> {
    match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

/// Rows of `mat` that are at least `ch` wide, coerced to length-`ch` float
/// rows. Malformed rows are skipped, never raised on.
pub fn rows_as_float(mat: Option<&Value>, ch: usize) -> Vec<Vec<f32>> {
    let mut rows = Vec::new();
    let Some(Value::Array(outer)) = mat else {
        return rows;
    };
    if ch == 0 {
        return rows;
    }
    for row in outer {
        let Value::Array(cells) = row else { continue };
        if cells.len() < ch {
            continue;
        }
        let vec: Vec<f32> = cells[..ch]
            .iter()
            .filter_map(Value::as_f64)
            .map(|x| x as f32)
            .collect();
        if vec.len() == ch {
            rows.push(vec);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn num_accepts_only_numbers() {
        assert_eq!(num(Some(&json!(42))), Some(42.0));
        assert_eq!(num(Some(&json!(1.5))), Some(1.5));
        assert_eq!(num(Some(&json!("1.5"))), None);
        assert_eq!(num(Some(&json!(true))), None);
        assert_eq!(num(Some(&json!(null))), None);
        assert_eq!(num(None), None);
    }

    #[test]
    fn rows_skip_malformed() {
        let mat = json!([[1, 2, 3], [4, 5], ["x", 6, 7], [8, 9, 10, 11]]);
        let rows = rows_as_float(Some(&mat), 3);
        assert_eq!(rows, vec![vec![1.0, 2.0, 3.0], vec![8.0, 9.0, 10.0]]);
    }

    #[test]
    fn rows_reject_non_matrix() {
        assert!(rows_as_float(Some(&json!("nope")), 3).is_empty());
        assert!(rows_as_float(Some(&json!([[1.0]])), 0).is_empty());
        assert!(rows_as_float(None, 3).is_empty());
    }
}
