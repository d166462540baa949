//! Definitions-file parser: `KEY=VALUE` lines with `#` comments. A value
//! beginning with `"` is decoded as one JSON string; unquoted values are
//! taken verbatim with any trailing comment stripped.

use std::collections::HashMap;
use std::io::BufRead;

use regex::Regex;

use crate::error::BuildError;

/// Parse a definitions file. `name` is used in error messages only.
pub fn parse<R: BufRead>(reader: R, name: &str) -> Result<HashMap<String, String>, BuildError> {
    // blank line or comment
    let comment = Regex::new(r"^\s*(?:#.*)?$").expect("comment regex");
    // KEY = VALUE, where VALUE is a quoted rest-of-line or an unquoted
    // value with an optional trailing comment
    let assign = Regex::new(r#"^\s*(\w+)\s*=\s*(?:(".*)|(.*?)\s*(?:#.*)?)$"#).expect("assign regex");

    let mut out = HashMap::new();
    for (lineno, line) in reader.lines().enumerate() {
        let lineno = lineno + 1;
        let line = line?;
        let line = line.trim();
        if comment.is_match(line) {
            continue;
        }
        let caps = assign.captures(line).ok_or_else(|| {
            BuildError::Config(format!("invalid syntax: {name}, line {lineno}"))
        })?;
        let key = caps.get(1).map_or("", |m| m.as_str());
        let value = if let Some(quoted) = caps.get(2) {
            // one JSON string, followed by nothing but whitespace/comment
            let mut stream =
                serde_json::Deserializer::from_str(quoted.as_str()).into_iter::<String>();
            let value = match stream.next() {
                Some(Ok(v)) => v,
                _ => {
                    return Err(BuildError::Config(format!(
                        "invalid syntax: {name}, line {lineno}"
                    )))
                }
            };
            let rest = &quoted.as_str()[stream.byte_offset()..];
            if !comment.is_match(rest) {
                return Err(BuildError::Config(format!(
                    "invalid syntax: {name}, line {lineno}"
                )));
            }
            value
        } else {
            caps.get(3).map_or("", |m| m.as_str()).to_string()
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}
