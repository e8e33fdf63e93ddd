use crate::errors::TracecapError;

/// Split a free-form option string into arguments the way a POSIX shell
/// would, without expansion: whitespace separates, single quotes are fully
/// literal, double quotes group and honour backslash escapes, a backslash
/// outside quotes escapes the next character.
pub fn tokenize(input: &str) -> Result<Vec<String>, TracecapError> {
    let mut tokens = Vec::new();
    let mut current: Option<String> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if let Some(token) = current.take() {
                    tokens.push(token);
                }
            }
            '\'' => {
                let token = current.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => token.push(inner),
                        None => return Err(unterminated(input, '\'')),
                    }
                }
            }
            '"' => {
                let token = current.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => token.push(escaped),
                            None => return Err(unterminated(input, '"')),
                        },
                        Some(inner) => token.push(inner),
                        None => return Err(unterminated(input, '"')),
                    }
                }
            }
            '\\' => match chars.next() {
                Some(escaped) => current.get_or_insert_with(String::new).push(escaped),
                None => {
                    return Err(TracecapError::Validation(format!(
                        "dangling escape at end of '{input}'"
                    )))
                }
            },
            c => current.get_or_insert_with(String::new).push(c),
        }
    }

    if let Some(token) = current {
        tokens.push(token);
    }
    Ok(tokens)
}

fn unterminated(input: &str, quote: char) -> TracecapError {
    TracecapError::Validation(format!("unterminated {quote} quote in '{input}'"))
}
