use std::fmt::Display;

#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxReport {
    pub total: usize,
    pub valid: usize,
    pub valid_ratio: f64,
    pub errors: Vec<String>,
}

/// Share of statements that parse. `None` for an empty batch.
pub fn validate_batch<S, F, T, E>(statements: &[S], mut parse: F) -> Option<SyntaxReport>
where
    S: AsRef<str>,
    F: FnMut(&str) -> Result<T, E>,
    E: Display,
{
    if statements.is_empty() {
        return None;
    }

    let mut valid = 0;
    let mut errors = Vec::new();
    for (index, statement) in statements.iter().enumerate() {
        match parse(statement.as_ref()) {
            Ok(_) => valid += 1,
            Err(err) => errors.push(format!("statement {}: {err}", index + 1)),
        }
    }

    Some(SyntaxReport {
        total: statements.len(),
        valid,
        valid_ratio: valid as f64 / statements.len() as f64,
        errors,
    })
}
