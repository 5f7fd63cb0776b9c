//! Minimal template expansion for configuration strings. Templates are
//! plain text with `{{ func "arg" … }}` substitution expressions drawn
//! from a fixed, per-context function namespace: request bodies can use
//! `env` and `hostname`, file templates can use `secret`.

use crate::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, PartialEq, Eq)]
enum Node {
    Text(String),
    Call { func: String, args: Vec<String> },
}

/// A parsed template, ready to be rendered against a function resolver.
#[derive(Debug)]
pub struct Template {
    nodes: Vec<Node>,
}

/// Parse a template, accepting only the given function names. Any other
/// function invocation is a parse error.
pub fn parse(input: &str, functions: &[&str]) -> Result<Template, Error> {
    let mut nodes = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            nodes.push(Node::Text(rest[..start].to_string()));
        }
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open
            .find(CLOSE)
            .ok_or_else(|| Error::TemplateSyntax("unterminated expression".to_string()))?;

        let (func, args) = parse_call(&after_open[..end])?;
        if !functions.contains(&func.as_str()) {
            return Err(Error::UnknownFunction(func));
        }
        nodes.push(Node::Call { func, args });

        rest = &after_open[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        nodes.push(Node::Text(rest.to_string()));
    }

    Ok(Template { nodes })
}

fn parse_call(expression: &str) -> Result<(String, Vec<String>), Error> {
    let mut chars = expression.char_indices().peekable();
    let mut func = None;
    let mut args = Vec::new();

    while let Some((i, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => (),
            '"' => {
                if func.is_none() {
                    return Err(Error::TemplateSyntax(format!(
                        "expected a function name in '{expression}'"
                    )));
                }
                let start = i + 1;
                let mut end = None;
                for (j, c) in chars.by_ref() {
                    if c == '"' {
                        end = Some(j);
                        break;
                    }
                }
                let end = end.ok_or_else(|| {
                    Error::TemplateSyntax(format!("unterminated string in '{expression}'"))
                })?;
                args.push(expression[start..end].to_string());
            }
            c if c.is_alphanumeric() || c == '_' => {
                if func.is_some() {
                    return Err(Error::TemplateSyntax(format!(
                        "unexpected token in '{expression}'"
                    )));
                }
                let mut end = expression.len();
                while let Some(&(j, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        chars.next();
                    } else {
                        end = j;
                        break;
                    }
                }
                func = Some(expression[i..end].to_string());
            }
            _ => {
                return Err(Error::TemplateSyntax(format!(
                    "unexpected character '{c}' in '{expression}'"
                )))
            }
        }
    }

    let func = func
        .ok_or_else(|| Error::TemplateSyntax(format!("empty expression in '{expression}'")))?;
    Ok((func, args))
}

impl Template {
    /// Expand the template, resolving each function invocation through
    /// the given resolver.
    pub fn render<F>(&self, mut call: F) -> Result<String, Error>
    where
        F: FnMut(&str, &[String]) -> Result<String, Error>,
    {
        let mut out = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Call { func, args } => out.push_str(&call(func, args)?),
            }
        }
        Ok(out)
    }
}

/// Expand a request-data value: `env "NAME"` resolves to the environment
/// variable (empty when unset), `hostname` to the host's name.
pub fn render_request_value(input: &str) -> Result<String, Error> {
    let template = parse(input, &["env", "hostname"])?;
    template.render(|func, args| match func {
        "env" => {
            let [name] = args else {
                return Err(Error::WrongArgumentCount("env".to_string()));
            };
            Ok(std::env::var(name).unwrap_or_default())
        }
        "hostname" => {
            if !args.is_empty() {
                return Err(Error::WrongArgumentCount("hostname".to_string()));
            }
            Ok(hostname::get()
                .map_err(Error::Io)?
                .to_string_lossy()
                .into_owned())
        }
        _ => Err(Error::UnknownFunction(func.to_string())),
    })
}
