use std::borrow::Cow;
use std::collections::HashMap;

/// A template for AI prompts that supports variable substitution.
#[derive(Debug, Clone)]
pub struct PromptTemplate<'t> {
    template: Cow<'t, str>,
}

impl<'t> PromptTemplate<'t> {
    pub fn new(template: impl Into<Cow<'t, str>>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Render the template by replacing `{{key}}` with the corresponding value.
    ///
    /// Substitution is a single pass: placeholders that appear inside substituted values are
    /// left alone, and unknown placeholders are kept verbatim.
    pub fn render(&self, vars: &HashMap<&str, &str>) -> String {
        let mut output = String::with_capacity(self.template.len());
        let mut rest: &str = &self.template;
        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                output.push_str(&rest[start..]);
                return output;
            };
            let key = &after_open[..end];
            match vars.get(key) {
                Some(value) => output.push_str(value),
                None => output.push_str(&rest[start..start + 2 + end + 2]),
            }
            rest = &after_open[end + 2..];
        }
        output.push_str(rest);
        output
    }
}
