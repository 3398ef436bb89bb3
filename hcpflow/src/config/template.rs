//! Named-placeholder templates for command lines and output paths.
//!
//! Templates use `{name}` placeholders, with `{{` and `}}` as literal braces.
//! Values come either from the [`ToolEnvironment`] (tool locations) or from
//! the [`TemplateParams`] of a session, where absent values render as `NONE`.

use crate::errors::TemplateError;
use std::collections::BTreeMap;
use std::fmt;

/// Token rendered for absent parameter values.
pub const NONE_TOKEN: &str = "NONE";

/// Renders `template`, resolving each placeholder through `lookup`.
pub fn render_with<F>(template: &str, mut lookup: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(TemplateError::Unterminated {
                                template: template.to_string(),
                            })
                        }
                    }
                }
                let value = lookup(&name).ok_or_else(|| TemplateError::UnknownPlaceholder {
                    name: name.clone(),
                    template: template.to_string(),
                })?;
                out.push_str(&value);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Environment-style settings: pipeline roots and tool locations.
///
/// Captured once at start-up; nothing reads the process environment later.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolEnvironment {
    vars: BTreeMap<String, String>,
}

impl ToolEnvironment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current process environment.
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Sets a variable.
    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Returns a variable.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Expands `{VAR}` placeholders.
    pub fn expand(&self, template: &str) -> Result<String, TemplateError> {
        render_with(template, |name| self.get(name).map(str::to_string))
    }
}

/// Flat named-parameter view of a session configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateParams {
    values: BTreeMap<String, Option<String>>,
}

impl TemplateParams {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), Some(value.into()));
    }

    /// Sets an optional value; `None` renders as `NONE`.
    pub fn set_opt(&mut self, key: impl Into<String>, value: Option<impl Into<String>>) {
        self.values.insert(key.into(), value.map(Into::into));
    }

    /// Sets a value, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets an optional value, builder style.
    #[must_use]
    pub fn with_opt(mut self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.set_opt(key, value);
        self
    }

    /// Returns the raw value; the outer `None` means the key is unknown.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.values.get(key).map(Option::as_deref)
    }

    /// Returns true if the key is known.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Renders a template against these parameters.
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        render_with(template, |name| {
            self.get(name)
                .map(|value| value.unwrap_or(NONE_TOKEN).to_string())
        })
    }
}

/// A script plus its ordered `--flag={placeholder}` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    flags: Vec<(String, String)>,
}

impl CommandTemplate {
    /// Creates a template for `program`, itself expanded against the environment.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            flags: Vec::new(),
        }
    }

    /// Appends a `flag=value` argument.
    #[must_use]
    pub fn flag(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.push((flag.into(), value.into()));
        self
    }

    /// Returns the unexpanded program template.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Renders the command line.
    pub fn render(
        &self,
        env: &ToolEnvironment,
        params: &TemplateParams,
    ) -> Result<CommandLine, TemplateError> {
        let program = env.expand(&self.program)?;
        let args = self
            .flags
            .iter()
            .map(|(flag, value)| Ok(format!("{flag}={}", params.render(value)?)))
            .collect::<Result<Vec<_>, TemplateError>>()?;
        Ok(CommandLine { program, args })
    }
}

/// A fully rendered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Program path.
    pub program: String,
    /// Arguments, one per flag.
    pub args: Vec<String>,
}

impl CommandLine {
    /// Appends a literal argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Renders one argument per line for operator display.
    #[must_use]
    pub fn pretty(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" \\\n    ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
