//! Default replace-rule engine.
//!
//! A rule with an XPath is scoped to the text inside every element whose
//! local name equals the last XPath step; namespace prefixes and positional
//! predicates are ignored. Rules without an XPath apply to the whole body.

use crate::integrations::ReplaceApplier;
use crate::models::{Direction, ReplaceRule};
use regex::{Captures, Regex};
use std::borrow::Cow;

#[derive(Debug, Default, Clone, Copy)]
pub struct XmlReplaceApplier;

impl ReplaceApplier for XmlReplaceApplier {
    fn apply(&self, content: &str, rules: &[ReplaceRule], direction: Direction) -> String {
        let mut current = content.to_string();
        if current.is_empty() {
            return current;
        }
        for rule in applicable_rules(rules, direction) {
            let updated = match apply_rule(&current, rule) {
                Ok(Cow::Owned(updated)) => Some(updated),
                Ok(Cow::Borrowed(_)) => None,
                Err(err) => {
                    tracing::warn!("Replace rule {} skipped: {}", rule.label(), err);
                    None
                }
            };
            if let Some(updated) = updated {
                current = updated;
            }
        }
        current
    }
}

/// Enabled rules scoped to `direction`, in order.
pub fn applicable_rules(
    rules: &[ReplaceRule],
    direction: Direction,
) -> impl Iterator<Item = &ReplaceRule> {
    rules
        .iter()
        .filter(move |rule| rule.enabled && rule.target.applies_to(direction))
}

/// Element local name targeted by an XPath like `//soap:Body/m:Item[2]`.
pub fn target_element(xpath: &str) -> Option<&str> {
    let last = xpath.split('/').filter(|s| !s.is_empty()).last()?;
    let local = match last.find(':') {
        Some(idx) if idx > 0 => &last[idx + 1..],
        _ => last,
    };
    let local = match local.find('[') {
        Some(idx) if idx > 0 => &local[..idx],
        _ => local,
    };
    if local.is_empty() {
        None
    } else {
        Some(local)
    }
}

fn apply_rule<'a>(content: &'a str, rule: &ReplaceRule) -> anyhow::Result<Cow<'a, str>> {
    if rule.match_text.is_empty() {
        return Ok(Cow::Borrowed(content));
    }
    let replacer = TextReplacer::new(rule)?;

    let Some(element) = target_element(&rule.xpath) else {
        return Ok(replacer.replace(content));
    };

    let name = regex::escape(element);
    let scope = Regex::new(&format!(
        r"(<(?:[a-zA-Z0-9_-]+:)?{name}(?:\s[^>]*)?>)([\s\S]*?)(</(?:[a-zA-Z0-9_-]+:)?{name}>)"
    ))?;
    Ok(scope.replace_all(content, |caps: &Captures<'_>| {
        format!("{}{}{}", &caps[1], replacer.replace(&caps[2]), &caps[3])
    }))
}

enum TextReplacer<'r> {
    Literal { find: &'r str, with: &'r str },
    Pattern { re: Regex, with: &'r str },
}

impl<'r> TextReplacer<'r> {
    fn new(rule: &'r ReplaceRule) -> anyhow::Result<Self> {
        if rule.is_regex {
            Ok(TextReplacer::Pattern {
                re: Regex::new(&rule.match_text)?,
                with: &rule.replace_with,
            })
        } else {
            Ok(TextReplacer::Literal {
                find: &rule.match_text,
                with: &rule.replace_with,
            })
        }
    }

    fn replace<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match self {
            TextReplacer::Literal { find, with } => {
                if text.contains(find) {
                    Cow::Owned(text.replace(find, with))
                } else {
                    Cow::Borrowed(text)
                }
            }
            TextReplacer::Pattern { re, with } => re.replace_all(text, *with),
        }
    }
}
