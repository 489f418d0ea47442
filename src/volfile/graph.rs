//! Translator graph text rendering
//!
//! A volfile is a list of translator blocks, leaves first, each naming the
//! blocks it stacks on via `subvolumes`.

use std::collections::BTreeMap;
use std::fmt::Write;

/// One translator block of a volfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translator {
    pub name: String,
    pub xlator_type: &'static str,
    /// Short kind used to match volume options (`<kind>.<option>`)
    pub kind: &'static str,
    pub options: Vec<(String, String)>,
    pub subvolumes: Vec<String>,
}

impl Translator {
    pub fn new(name: impl Into<String>, kind: &'static str, xlator_type: &'static str) -> Self {
        Self {
            name: name.into(),
            xlator_type,
            kind,
            options: Vec::new(),
            subvolumes: Vec::new(),
        }
    }

    pub fn option(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.options.push((key.into(), value.to_string()));
        self
    }

    pub fn subvolume(mut self, name: impl Into<String>) -> Self {
        self.subvolumes.push(name.into());
        self
    }

    pub fn subvolumes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subvolumes.extend(names.into_iter().map(Into::into));
        self
    }

    /// Apply `<kind>.<option>` volume options; overrides keep their position
    pub fn with_volume_options(mut self, options: &BTreeMap<String, String>) -> Self {
        let prefix = format!("{}.", self.kind);
        for (key, value) in options {
            let Some(opt) = key.strip_prefix(&prefix) else {
                continue;
            };
            if opt.is_empty() {
                continue;
            }
            match self.options.iter_mut().find(|(k, _)| k == opt) {
                Some(existing) => existing.1 = value.clone(),
                None => self.options.push((opt.to_string(), value.clone())),
            }
        }
        self
    }

    fn render_into(&self, out: &mut String) {
        let _ = writeln!(out, "volume {}", self.name);
        let _ = writeln!(out, "    type {}", self.xlator_type);
        for (key, value) in &self.options {
            let _ = writeln!(out, "    option {} {}", key, value);
        }
        if !self.subvolumes.is_empty() {
            let _ = writeln!(out, "    subvolumes {}", self.subvolumes.join(" "));
        }
        out.push_str("end-volume\n");
    }
}

/// Render translators in order, separated by blank lines
pub fn render(translators: &[Translator]) -> String {
    let mut out = String::new();
    for (i, xl) in translators.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        xl.render_into(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_block() {
        let text = render(&[
            Translator::new("a", "posix", "storage/posix").option("directory", "/x"),
            Translator::new("b", "locks", "features/locks").subvolume("a"),
        ]);
        assert_eq!(
            text,
            "volume a\n    type storage/posix\n    option directory /x\nend-volume\n\n\
             volume b\n    type features/locks\n    subvolumes a\nend-volume\n"
        );
    }

    #[test]
    fn test_volume_options_override_in_place() {
        let mut options = BTreeMap::new();
        options.insert("io-threads.thread-count".to_string(), "64".to_string());
        options.insert("io-threads.idle-time".to_string(), "120".to_string());
        options.insert("locks.trace".to_string(), "on".to_string());

        let xl = Translator::new("t", "io-threads", "performance/io-threads")
            .option("thread-count", 16)
            .with_volume_options(&options);
        assert_eq!(
            xl.options,
            vec![
                ("thread-count".to_string(), "64".to_string()),
                ("idle-time".to_string(), "120".to_string()),
            ]
        );
    }
}
