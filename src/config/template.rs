use anyhow::{bail, Context};
use std::collections::BTreeMap;

pub type Vars = BTreeMap<String, String>;

/// Renders a command template by replacing every `{name}` placeholder with the value of the
/// first scope that defines `name`. Values are rendered recursively so variables can be built
/// out of other variables. `{{` and `}}` produce literal braces.
///
/// # Arguments
///
/// * template - The template string
/// * scopes - Variable scopes, highest priority first
///
/// # Returns
///
/// The rendered string or an error if a placeholder is malformed, undefined or cyclic.
pub fn render(template: &str, scopes: &[&Vars]) -> anyhow::Result<String> {
    let mut stack = vec![];
    expand(template, scopes, &mut stack)
}

fn expand(text: &str, scopes: &[&Vars], stack: &mut Vec<String>) -> anyhow::Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
        } else {
            let end = tail
                .find('}')
                .context(format!("Unterminated placeholder in `{}`", text))?;
            let key = &tail[1..end];
            out.push_str(&lookup(key, scopes, stack)?);
            rest = &tail[end + 1..];
        }
    }
    out.push_str(rest);

    Ok(out)
}

fn lookup(key: &str, scopes: &[&Vars], stack: &mut Vec<String>) -> anyhow::Result<String> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("Invalid placeholder `{{{}}}`", key);
    }

    if stack.iter().any(|k| k == key) {
        stack.push(key.to_string());
        bail!("Variable cycle: {}", stack.join(" -> "));
    }

    let value = scopes
        .iter()
        .find_map(|scope| scope.get(key))
        .context(format!("Undefined variable `{}`", key))?;

    stack.push(key.to_string());
    let rendered = expand(value, scopes, stack)?;
    stack.pop();

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_nested_variables() -> anyhow::Result<()> {
        let globals = vars(&[("root", "/impl"), ("jar", "{root}/server.jar")]);
        let locals = vars(&[("name", "service-one")]);

        let cmd = render("java -jar {jar} --log=./{name}.log", &[&locals, &globals])?;
        assert_eq!(cmd, "java -jar /impl/server.jar --log=./service-one.log");

        Ok(())
    }

    #[test]
    fn earlier_scopes_win() -> anyhow::Result<()> {
        let globals = vars(&[("seed", "1")]);
        let locals = vars(&[("seed", "2")]);

        assert_eq!(render("-s {seed}", &[&locals, &globals])?, "-s 2");
        Ok(())
    }

    #[test]
    fn double_braces_are_literal() -> anyhow::Result<()> {
        let globals = vars(&[("x", "1")]);
        assert_eq!(render("awk '{{print $1}}' {x}", &[&globals])?, "awk '{print $1}' 1");
        Ok(())
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let err = render("run {missing}", &[]).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn cycles_are_detected() {
        let globals = vars(&[("a", "{b}"), ("b", "{a}")]);
        let err = render("{a}", &[&globals]).unwrap_err();
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn malformed_placeholders_are_rejected() {
        assert!(render("run {unterminated", &[]).is_err());
        assert!(render("run {not a name}", &[]).is_err());
    }
}
