//! Statement text inspection and rewriting shared by the backend handlers.

use super::schema::Table;
use super::value::SqlValue;

fn leading_keyword(statement: &str) -> String {
    statement
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

pub fn returns_rows(statement: &str) -> bool {
    matches!(
        leading_keyword(statement).as_str(),
        "SELECT" | "WITH" | "VALUES" | "PRAGMA" | "SHOW"
    ) || statement
        .split_whitespace()
        .any(|word| word.eq_ignore_ascii_case("RETURNING"))
}

pub fn is_data_change(statement: &str) -> bool {
    matches!(
        leading_keyword(statement).as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE"
    )
}

/// The table a data-changing statement writes to, if it is one we know.
pub fn touched_table(statement: &str) -> Option<Table> {
    let words: Vec<&str> = statement.split_whitespace().collect();
    let keyword = words.first()?.to_ascii_uppercase();

    let name = match keyword.as_str() {
        "INSERT" | "REPLACE" if words.get(1)?.eq_ignore_ascii_case("INTO") => words.get(2)?,
        "DELETE" if words.get(1)?.eq_ignore_ascii_case("FROM") => words.get(2)?,
        "UPDATE" => words.get(1)?,
        _ => return None,
    };

    let name = name.split('(').next()?.trim_matches('"').to_ascii_lowercase();
    Table::from_name(&name)
}

/// Byte offsets of `?` placeholders, skipping single-quoted literals and
/// double-quoted identifiers.
fn placeholder_offsets(statement: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut in_literal = false;
    let mut in_identifier = false;

    for (offset, c) in statement.char_indices() {
        match c {
            '\'' if !in_identifier => in_literal = !in_literal,
            '"' if !in_literal => in_identifier = !in_identifier,
            '?' if !in_literal && !in_identifier => offsets.push(offset),
            _ => {}
        }
    }

    offsets
}

pub fn count_placeholders(statement: &str) -> usize {
    placeholder_offsets(statement).len()
}

/// Rewrites `?` placeholders to PostgreSQL's numbered `$n` form.
pub fn numbered_placeholders(statement: &str) -> String {
    rewrite_placeholders(statement, |_| true)
}

/// Like [`numbered_placeholders`], but null parameters are written inline as
/// `NULL` so the server never has to infer a type for an untyped bind.
/// Returns the rewritten text together with the parameters left to bind.
pub fn inline_nulls<'a>(statement: &str, params: &'a [SqlValue]) -> (String, Vec<&'a SqlValue>) {
    let bound: Vec<&SqlValue> = params
        .iter()
        .filter(|value| !matches!(value, SqlValue::Null))
        .collect();
    if bound.len() == params.len() {
        return (numbered_placeholders(statement), bound);
    }

    let text = rewrite_placeholders(statement, |index| {
        !matches!(params.get(index), Some(SqlValue::Null))
    });
    (text, bound)
}

fn rewrite_placeholders(statement: &str, keep: impl Fn(usize) -> bool) -> String {
    let mut out = String::with_capacity(statement.len() + 8);
    let mut last = 0;
    let mut next = 1;

    for (index, offset) in placeholder_offsets(statement).into_iter().enumerate() {
        out.push_str(&statement[last..offset]);
        if keep(index) {
            out.push('$');
            out.push_str(&next.to_string());
            next += 1;
        } else {
            out.push_str("NULL");
        }
        last = offset + 1;
    }

    out.push_str(&statement[last..]);
    out
}
