//! Classification labels attached to a photo.

use serde::{Deserialize, Serialize};

/// Uncertainty (percent) above which a label is not trusted as a title.
const MAX_TITLE_UNCERTAINTY: i32 = 60;

/// Uncertainty above which a neutral-priority label is not used as a title.
const MAX_NEUTRAL_UNCERTAINTY: i32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    /// 0 (certain) to 100.
    pub uncertainty: i32,
    pub priority: i32,
}

impl Label {
    pub fn new(name: impl Into<String>, uncertainty: i32, priority: i32) -> Self {
        Self {
            name: name.into(),
            uncertainty,
            priority,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(pub Vec<Label>);

impl Labels {
    /// Best label name to use as a title, or `fallback`.
    ///
    /// A fallback with fewer than 2 or more than 25 characters, or with
    /// digits, is replaced by an empty string.
    pub fn title(&self, fallback: &str) -> String {
        let chars = fallback.chars().count();
        let fallback = if (2..=25).contains(&chars) && !fallback.chars().any(|c| c.is_ascii_digit()) {
            fallback
        } else {
            ""
        };

        let mut sorted: Vec<&Label> = self.0.iter().collect();
        sorted.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.uncertainty.cmp(&b.uncertainty))
        });

        let Some(mut label) = sorted.first().copied() else {
            return fallback.to_string();
        };

        if label.uncertainty > MAX_TITLE_UNCERTAINTY {
            if let Some(next) = sorted.get(1).copied() {
                if next.uncertainty <= MAX_TITLE_UNCERTAINTY {
                    label = next;
                }
            }
        }

        if label.priority < 0 || (label.priority == 0 && label.uncertainty > MAX_NEUTRAL_UNCERTAINTY) {
            return fallback.to_string();
        }

        if label.uncertainty <= MAX_TITLE_UNCERTAINTY {
            label.name.clone()
        } else {
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_prefers_priority() {
        let labels = Labels(vec![Label::new("dog", 10, 4), Label::new("cat", 59, 5)]);
        assert_eq!(labels.title("fallback"), "cat");
    }

    #[test]
    fn test_title_skips_uncertain_top_label() {
        let labels = Labels(vec![Label::new("cat", 61, 5), Label::new("dog", 10, 4)]);
        assert_eq!(labels.title("fallback"), "dog");
    }

    #[test]
    fn test_title_fallback() {
        assert_eq!(Labels::default().title("fallback"), "fallback");
        assert_eq!(Labels(vec![Label::new("cat", 61, 5)]).title("fallback"), "fallback");
        assert_eq!(Labels(vec![Label::new("cat", 10, -1)]).title("fallback"), "fallback");
        assert_eq!(Labels(vec![Label::new("cat", 55, 0)]).title("fallback"), "fallback");
        assert_eq!(Labels(vec![Label::new("cat", 45, 0)]).title("fallback"), "cat");
    }

    #[test]
    fn test_title_rejects_invalid_fallback() {
        assert_eq!(Labels::default().title("x"), "");
        assert_eq!(Labels::default().title("IMG 1234"), "");
        assert_eq!(Labels::default().title("a very long fallback title indeed"), "");
    }
}
