use std::borrow::Cow;
use std::collections::HashMap;

/// Resolves `$(NAME{key}|default)` references.
///
/// Implemented by [`crate::EventContext`] for real requests, and by any
/// `Fn(&str, Option<&str>, &str) -> String` closure.
pub trait VariableLookup {
    fn lookup(&self, name: &str, key: Option<&str>, default: &str) -> String;
}

impl<F> VariableLookup for F
where
    F: Fn(&str, Option<&str>, &str) -> String,
{
    fn lookup(&self, name: &str, key: Option<&str>, default: &str) -> String {
        self(name, key, default)
    }
}

/// A value injected by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomVariable {
    Text(String),
    Dictionary(HashMap<String, String>),
}

impl CustomVariable {
    pub fn resolve(&self, key: Option<&str>) -> Option<&str> {
        match (self, key) {
            (Self::Text(text), None) => Some(text.as_str()),
            (Self::Dictionary(map), Some(key)) => map.get(key).map(String::as_str),
            _ => None,
        }
    }
}

impl From<&str> for CustomVariable {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CustomVariable {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<HashMap<String, String>> for CustomVariable {
    fn from(value: HashMap<String, String>) -> Self {
        Self::Dictionary(value)
    }
}

/// Named values that extend the built-in request variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomVariables {
    map: HashMap<String, CustomVariable>,
}

impl CustomVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<CustomVariable>) {
        self.map.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&CustomVariable> {
        self.map.get(name)
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for CustomVariables
where
    K: Into<String>,
    V: Into<CustomVariable>,
{
    fn from(data: [(K, V); N]) -> Self {
        let mut vars = Self::new();
        for (name, value) in data {
            vars.insert(name, value);
        }
        vars
    }
}

/// One parsed `$(...)` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable<'a> {
    /// Written with the `RAW_` prefix.
    pub raw: bool,
    pub name: &'a str,
    pub key: Option<&'a str>,
    pub default: &'a str,
}

/// Turns a resolved variable into replacement text.
pub type RenderStrategy = fn(&Variable<'_>, &dyn VariableLookup) -> String;

/// Replaces every well-formed `$(...)` reference in `input` using `render`.
/// References that do not parse are left as they are.
pub fn replace_vars(input: &str, lookup: &dyn VariableLookup, render: RenderStrategy) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find("$(") {
        out.push_str(&rest[..idx]);
        let candidate = &rest[idx..];
        match parse_variable(candidate) {
            Some((variable, consumed)) => {
                out.push_str(&render(&variable, lookup));
                rest = &candidate[consumed..];
            }
            None => {
                out.push('$');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Plain substitution. `<` and `>` are escaped unless the `RAW_` form is used; values that
/// carry ESI markup are escaped regardless.
pub fn render_escaped(variable: &Variable<'_>, lookup: &dyn VariableLookup) -> String {
    let value = lookup.lookup(variable.name, variable.key, variable.default);
    if variable.raw && !contains_esi_markup(&value) {
        value
    } else {
        escape_markup(&value).into_owned()
    }
}

/// Substitution inside a `test` expression: numbers stay bare, everything else becomes a
/// quoted string literal.
pub fn render_condition_literal(variable: &Variable<'_>, lookup: &dyn VariableLookup) -> String {
    let value = render_escaped(variable, lookup);
    if is_number(&value) {
        return value;
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

pub(crate) fn escape_markup(value: &str) -> Cow<'_, str> {
    if !value.contains(['<', '>']) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(value.replace('<', "&lt;").replace('>', "&gt;"))
}

fn contains_esi_markup(value: &str) -> bool {
    value.contains("<esi") || value.contains("<!--esi")
}

pub(crate) fn is_number(value: &str) -> bool {
    let (int, frac) = match value.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (value, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(int) && frac.map_or(true, digits)
}

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'~' | b'_' | b'%')
}

// Parses a reference at the start of `input`, returning it with the number of bytes used.
fn parse_variable(input: &str) -> Option<(Variable<'_>, usize)> {
    let bytes = input.as_bytes();
    if !input.starts_with("$(") {
        return None;
    }
    let mut pos = 2;

    let name_start = pos;
    while pos < bytes.len() && (bytes[pos].is_ascii_uppercase() || bytes[pos] == b'_') {
        pos += 1;
    }
    if pos == name_start {
        return None;
    }
    let full_name = &input[name_start..pos];
    let (raw, name) = match full_name.strip_prefix("RAW_") {
        Some(name) if !name.is_empty() => (true, name),
        _ => (false, full_name),
    };

    let mut key = None;
    if bytes.get(pos) == Some(&b'{') {
        pos += 1;
        let key_start = pos;
        while pos < bytes.len() && is_key_byte(bytes[pos]) {
            pos += 1;
        }
        if bytes.get(pos) != Some(&b'}') {
            return None;
        }
        key = Some(&input[key_start..pos]).filter(|k| !k.is_empty());
        pos += 1;
    }

    let mut default = "";
    if bytes.get(pos) == Some(&b'|') {
        pos += 1;
        if bytes.get(pos) == Some(&b'\'') {
            pos += 1;
            let start = pos;
            while pos < bytes.len() && bytes[pos] != b'\'' && bytes[pos] != b')' {
                pos += 1;
            }
            if bytes.get(pos) != Some(&b'\'') {
                return None;
            }
            default = &input[start..pos];
            pos += 1;
        } else {
            let start = pos;
            while pos < bytes.len()
                && !(bytes[pos].is_ascii_whitespace() || bytes[pos] == b')' || bytes[pos] == b'\'')
            {
                pos += 1;
            }
            if pos == start {
                return None;
            }
            default = &input[start..pos];
        }
    }

    if bytes.get(pos) != Some(&b')') {
        return None;
    }
    Some((
        Variable {
            raw,
            name,
            key,
            default,
        },
        pos + 1,
    ))
}
