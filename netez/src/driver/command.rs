//! Typed command builder.
//!
//! Reconcilers never interpolate caller input into command text directly.
//! Every value goes through a [`Value`] constructor that either accepts a
//! restricted bare word or produces a quoted, escaped string from text that
//! passed a strict character policy. A [`Command`] keeps two renderings:
//! the line sent to the device, and a redacted line for logs and errors.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ValidationError;

/// Characters never accepted in caller-supplied text, quoted or not.
const FORBIDDEN: &[char] = &['"', '\\', '$', ';', '[', ']', '{', '}', '?', '`'];

/// Maximum length of a bare word.
const MAX_WORD: usize = 128;

/// One argument value.
#[derive(Clone)]
pub struct Value(ValueRepr);

#[derive(Clone)]
enum ValueRepr {
    Word(String),
    Quoted(String),
    Secret(SecretString),
}

impl Value {
    /// A bare word: letters, digits and `._:/*@+-`.
    pub fn word(field: &'static str, value: &str) -> Result<Self, ValidationError> {
        if value.is_empty() {
            return Err(ValidationError::Empty { field });
        }
        if value.len() > MAX_WORD {
            return Err(ValidationError::Length {
                field,
                min: 1,
                max: MAX_WORD,
            });
        }
        if !value.chars().all(is_word_char) {
            return Err(ValidationError::IllegalCharacters {
                field,
                value: value.to_string(),
            });
        }
        Ok(Value(ValueRepr::Word(value.to_string())))
    }

    /// Free text, emitted quoted. Length is counted in bytes.
    pub fn text(
        field: &'static str,
        value: &str,
        min: usize,
        max: usize,
    ) -> Result<Self, ValidationError> {
        check_length(field, value, min, max)?;
        if !is_safe_text(value) {
            return Err(ValidationError::IllegalCharacters {
                field,
                value: value.to_string(),
            });
        }
        Ok(Value(ValueRepr::Quoted(value.to_string())))
    }

    /// Secret text, emitted quoted, shown as `***` everywhere but on the wire.
    pub fn secret(
        field: &'static str,
        value: &SecretString,
        min: usize,
        max: usize,
    ) -> Result<Self, ValidationError> {
        let exposed = value.expose_secret();
        check_length(field, exposed, min, max)?;
        if !is_safe_text(exposed) || !exposed.is_ascii() {
            return Err(ValidationError::IllegalSecret { field });
        }
        Ok(Value(ValueRepr::Secret(value.clone())))
    }

    /// An integer.
    pub fn number(value: u64) -> Self {
        Value(ValueRepr::Word(value.to_string()))
    }

    /// A literal the crate itself controls (`yes`, `forward`, `drop`...).
    pub(crate) fn keyword(value: &'static str) -> Self {
        Value(ValueRepr::Word(value.to_string()))
    }

    /// Quoted text built by the crate from already validated parts
    /// (e.g. an escaped regex). Only escaping is applied.
    pub(crate) fn quoted(value: impl Into<String>) -> Self {
        Value(ValueRepr::Quoted(value.into()))
    }

    fn render(&self) -> String {
        match &self.0 {
            ValueRepr::Word(w) => w.clone(),
            ValueRepr::Quoted(q) => quote(q),
            ValueRepr::Secret(s) => quote(s.expose_secret()),
        }
    }

    fn render_redacted(&self) -> String {
        match &self.0 {
            ValueRepr::Secret(_) => "***".to_string(),
            _ => self.render(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_redacted())
    }
}

/// A device item id as printed by `show-ids` (`*1A`) or an item number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemId(String);

impl ItemId {
    /// Parse an item id.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let digits = value.strip_prefix('*').unwrap_or(value);
        let valid = !digits.is_empty()
            && if value.starts_with('*') {
                digits.chars().all(|c| c.is_ascii_hexdigit())
            } else {
                digits.chars().all(|c| c.is_ascii_digit())
            };
        if !valid {
            return Err(ValidationError::Malformed {
                field: "item id",
                value: value.to_string(),
            });
        }
        Ok(Self(value.to_string()))
    }

    /// The id text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A command ready to send.
#[derive(Clone)]
pub struct Command {
    line: String,
    redacted: String,
}

impl Command {
    /// Start building a structured command (`/ip address`, `add`).
    pub fn builder(menu: &'static str, verb: &'static str) -> CommandBuilder {
        CommandBuilder {
            line: format!("{menu} {verb}"),
            redacted: format!("{menu} {verb}"),
            capture_id: false,
        }
    }

    /// Wrap caller-provided command text. Must be a single non-empty line.
    pub fn raw(text: &str) -> Result<Self, ValidationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::Empty { field: "command" });
        }
        if text.contains(['\n', '\r']) {
            return Err(ValidationError::IllegalCharacters {
                field: "command",
                value: text.to_string(),
            });
        }
        Ok(Self {
            line: text.to_string(),
            redacted: text.to_string(),
        })
    }

    /// The exact line sent to the device.
    pub fn line(&self) -> &str {
        &self.line
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Command").field(&self.redacted).finish()
    }
}

/// Builder for [`Command`].
#[derive(Debug)]
pub struct CommandBuilder {
    line: String,
    redacted: String,
    capture_id: bool,
}

impl CommandBuilder {
    /// Address one item by id: `numbers=*1A`.
    pub fn item(self, id: &ItemId) -> Self {
        self.push(format!("numbers={id}"), format!("numbers={id}"))
    }

    /// Address items matching `key=value`: `[find key="value"]`.
    pub fn find(self, key: &'static str, value: &Value) -> Self {
        let line = format!("[find {key}={}]", value.render());
        let redacted = format!("[find {key}={}]", value.render_redacted());
        self.push(line, redacted)
    }

    /// Address the default item: `[find default=yes]`.
    pub fn find_default(self) -> Self {
        self.push("[find default=yes]".into(), "[find default=yes]".into())
    }

    /// Append `key=value`.
    pub fn arg(self, key: &'static str, value: &Value) -> Self {
        let line = format!("{key}={}", value.render());
        let redacted = format!("{key}={}", value.render_redacted());
        self.push(line, redacted)
    }

    /// Append a bare flag (`terse`, `show-ids`).
    pub fn flag(self, flag: &'static str) -> Self {
        self.push(flag.to_string(), flag.to_string())
    }

    /// Print the id of the item the command creates: `:put [ ... ]`.
    pub fn capture_id(mut self) -> Self {
        self.capture_id = true;
        self
    }

    /// Finish the command.
    pub fn build(self) -> Command {
        if self.capture_id {
            Command {
                line: format!(":put [{}]", self.line),
                redacted: format!(":put [{}]", self.redacted),
            }
        } else {
            Command {
                line: self.line,
                redacted: self.redacted,
            }
        }
    }

    fn push(mut self, line: String, redacted: String) -> Self {
        self.line.push(' ');
        self.line.push_str(&line);
        self.redacted.push(' ');
        self.redacted.push_str(&redacted);
        self
    }
}

/// Quote a string for the RouterOS console.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '*' | '@' | '+' | '-')
}

fn is_safe_text(value: &str) -> bool {
    value
        .chars()
        .all(|c| !c.is_control() && !FORBIDDEN.contains(&c))
}

fn check_length(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    if value.is_empty() && min > 0 {
        return Err(ValidationError::Empty { field });
    }
    if value.len() < min || value.len() > max {
        return Err(ValidationError::Length { field, min, max });
    }
    Ok(())
}
