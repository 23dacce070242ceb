// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Text substitution over the kernel program sources. `{{name}}`
//! placeholders are replaced from the probe's template variables; a
//! placeholder without a value is a configuration error, not a silent
//! passthrough.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("unresolved template placeholder {{{{{0}}}}}")]
    Unresolved(String),
    #[error("unterminated template placeholder at offset {0}")]
    Unterminated(usize),
}

pub fn render(template: &str, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[(start + 2)..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(template.len() - rest.len() + start))?;
        let name = after[..end].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| TemplateError::Unresolved(name.to_string()))?;
        out.push_str(value);
        rest = &after[(end + 2)..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use super::{render, TemplateError};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_placeholders() {
        let rendered = render(
            "#define MAX {{max}}\nint x = {{ max }};",
            &vars(&[("max", "512")]),
        );
        assert_eq!(rendered.unwrap(), "#define MAX 512\nint x = 512;");
    }

    #[test]
    fn missing_variable_is_an_error() {
        assert_eq!(
            render("{{nope}}", &vars(&[])),
            Err(TemplateError::Unresolved("nope".to_string())),
        );
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        assert!(matches!(
            render("int {{broken", &vars(&[])),
            Err(TemplateError::Unterminated(_)),
        ));
    }
}
