use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tlm_core::{Event, Value};

pub mod test_utils;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%\{(?P<path>.+?)\}").expect("can't create template replacer"));

/// Renders `template`, replacing every `%{/pointer}` with the field the
/// pointer addresses in the event. Strings are inserted as is, numbers and
/// booleans in their JSON form; anything else fails the substitution.
pub fn substitute_with_event(template: &str, event: &Event) -> Result<String, String> {
    let mut fail_reason = None;
    let rendered = PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let path = &caps["path"];
            match event.lookup(path).as_deref() {
                Some(Value::String(value)) => value.to_string(),
                Some(value @ (Value::Number(_) | Value::Bool(_))) => value.to_string(),
                _ => {
                    fail_reason.get_or_insert_with(|| {
                        format!(
                            "no {path} field or {path} is not a scalar, event {}",
                            event.id()
                        )
                    });
                    String::new()
                }
            }
        })
        .to_string();
    if let Some(reason) = fail_reason {
        Err(reason)
    } else {
        Ok(rendered)
    }
}

/// Whether a string contains any `%{..}` placeholder.
pub fn is_template(s: &str) -> bool {
    PLACEHOLDER.is_match(s)
}

/// Renders a template, or borrows the input when it holds no placeholder.
pub fn render<'a>(template: &'a str, event: &Event) -> Result<Cow<'a, str>, String> {
    if is_template(template) {
        substitute_with_event(template, event).map(Cow::Owned)
    } else {
        Ok(Cow::Borrowed(template))
    }
}
