//! `$p<N>` token → native placeholder translation.

use super::connection::PlaceholderStyle;
use crate::compiler::ParameterMap;
use crate::error::{QueryError, Result};
use crate::value::Value;

/// Rewrite the compiler's `$p<N>` tokens into `style` and return the values in
/// bind order.
///
/// Tokens inside single-quoted literals or double-quoted identifiers are left
/// untouched. A token naming a parameter that does not exist is rejected.
pub fn bind(
    sql: &str,
    params: &ParameterMap,
    style: PlaceholderStyle,
) -> Result<(String, Vec<Value>)> {
    let mut out = String::with_capacity(sql.len());
    let mut ordered = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices();

    while let Some((pos, c)) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
                continue;
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
                continue;
            }
            None => {}
        }

        if c == '$' && sql[pos + 1..].starts_with('p') {
            let digits: String = sql[pos + 2..]
                .chars()
                .take_while(|d| d.is_ascii_digit())
                .collect();
            if !digits.is_empty() {
                let index: usize = digits.parse().map_err(|_| unknown_token(&digits))?;
                let value = params
                    .get_index(index)
                    .ok_or_else(|| unknown_token(&digits))?;
                match style {
                    PlaceholderStyle::Dollar => out.push_str(&format!("${}", index + 1)),
                    PlaceholderStyle::Question => {
                        out.push('?');
                        ordered.push(value.clone());
                    }
                }
                // skip 'p' and the digits
                for _ in 0..digits.len() + 1 {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }

    let values = match style {
        PlaceholderStyle::Dollar => params.values().to_vec(),
        PlaceholderStyle::Question => ordered,
    };
    Ok((out, values))
}

fn unknown_token(digits: &str) -> QueryError {
    QueryError::validation(format!("Unknown parameter $p{}", digits))
        .with_context("field", format!("p{}", digits))
}
