use crate::input::{ConfItem, Input};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// On-disk format of a rendered configuration.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigFormat {
    /// Hadoop-style `<configuration><property>` XML.
    #[default]
    Xml,
    /// One `key=value` line per item.
    Properties,
}

/// Writes configurations in the target's native format.
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    format: ConfigFormat,
    pinned: Vec<ConfItem>,
}

impl ConfigRenderer {
    pub fn new(format: ConfigFormat, pinned: Vec<ConfItem>) -> Self {
        Self { format, pinned }
    }

    pub fn format(&self) -> ConfigFormat {
        self.format
    }

    /// Renders pinned items followed by the items of `input`. Pinned entries
    /// shadowed by an input item of the same name are skipped.
    pub fn render_to_string<I: Input>(&self, input: &I) -> String {
        let items: Vec<&ConfItem> = self
            .pinned
            .iter()
            .filter(|pinned| input.find(&pinned.name).is_none())
            .chain(input.items())
            .collect();
        match self.format {
            ConfigFormat::Xml => render_xml(&items),
            ConfigFormat::Properties => render_properties(&items),
        }
    }

    /// Writes the rendered configuration to `path` and syncs it before
    /// returning, creating parent directories as needed.
    pub fn write<I: Input>(&self, input: &I, path: &Path) -> std::io::Result<PathBuf> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(self.render_to_string(input).as_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(path.to_path_buf())
    }
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn render_xml(items: &[&ConfItem]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<configuration>\n");
    for item in items {
        out.push_str("  <property>\n");
        out.push_str(&format!("    <name>{}</name>\n", escape_xml(&item.name)));
        out.push_str(&format!("    <value>{}</value>\n", escape_xml(&item.value)));
        out.push_str("  </property>\n");
    }
    out.push_str("</configuration>\n");
    out
}

fn render_properties(items: &[&ConfItem]) -> String {
    items
        .iter()
        .map(|item| format!("{}={}\n", item.name, item.value.replace('\n', "\\n")))
        .collect()
}
