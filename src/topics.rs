//! Topic paths under the per-device prefix.
//!
//! * `<prefix>/status`
//! * `<prefix>/mode/<flag>` and `<prefix>/mode/<flag>/set`
//! * `<prefix>/readings/<name>`
//! * `<prefix>/settings/<name>` and `<prefix>/settings/<name>/set`

use crate::catalog::Category;

const COMMAND_SUFFIX: &str = "/set";

/// A write target, as in `settings/awayVentilationLevel` or `mode/away`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Target<'a> {
    pub category: Category,
    pub name: &'a str,
}

impl<'a> Target<'a> {
    pub fn parse(path: &'a str) -> Option<Self> {
        let (segment, name) = path.split_once('/')?;
        let category = [Category::Reading, Category::Setting, Category::Flag]
            .into_iter()
            .find(|c| c.topic_segment() == segment)?;
        if name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self { category, name })
    }
}

impl std::fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}/{}", self.category.topic_segment(), self.name))
    }
}

#[derive(Clone, Debug)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: prefix.trim_end_matches('/').to_string() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn state(&self, category: Category, name: &str) -> String {
        format!("{}/{}/{name}", self.prefix, category.topic_segment())
    }

    pub fn command(&self, category: Category, name: &str) -> String {
        self.state(category, name) + COMMAND_SUFFIX
    }

    /// Subscription filters matching every command topic.
    pub fn command_filters(&self) -> [String; 2] {
        [Category::Setting, Category::Flag].map(|c| self.command(c, "+"))
    }

    /// The write target of a command topic, if `topic` is one of ours.
    pub fn parse_command<'a>(&self, topic: &'a str) -> Option<Target<'a>> {
        let path = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        Target::parse(path.strip_suffix(COMMAND_SUFFIX)?)
    }
}
