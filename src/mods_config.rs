use crate::{compile::major_minor, rimworld};
use anyhow::{Context, Result};
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Reader, Writer,
};
use std::{fs, io::Cursor, path::Path};

/// The game's active mod list (`ModsConfig.xml`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModsConfig {
    pub version: String,
    pub active_mods: Vec<String>,
    pub known_expansions: Vec<String>,
}

impl ModsConfig {
    /// Base game only.
    pub fn default_for(game_version: Option<&str>) -> Self {
        let version = game_version
            .and_then(major_minor)
            .unwrap_or_default();
        Self {
            version,
            active_mods: vec![rimworld::BASE_GAME_PACKAGE_ID.to_string()],
            known_expansions: Vec::new(),
        }
    }
}

pub fn parse_mods_config(bytes: &[u8]) -> Result<ModsConfig> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut config = ModsConfig::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase());
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().context("decode ModsConfig text")?.trim().to_string();
                if text.is_empty() {
                    buf.clear();
                    continue;
                }
                let parent = stack.len().checked_sub(2).and_then(|index| stack.get(index));
                match (parent.map(String::as_str), stack.last().map(String::as_str)) {
                    (Some("activemods"), Some("li")) => config.active_mods.push(text.to_lowercase()),
                    (Some("knownexpansions"), Some("li")) => {
                        config.known_expansions.push(text.to_lowercase())
                    }
                    (_, Some("version")) => config.version = text,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(err).context("parse ModsConfig.xml"),
            _ => {}
        }
        buf.clear();
    }
    Ok(config)
}

pub fn read_mods_config(path: &Path) -> Result<ModsConfig> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    parse_mods_config(&bytes).with_context(|| format!("parse {}", path.display()))
}

fn write_list(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, items: &[String]) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    for item in items {
        writer.write_event(Event::Start(BytesStart::new("li")))?;
        writer.write_event(Event::Text(BytesText::new(item)))?;
        writer.write_event(Event::End(BytesEnd::new("li")))?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

pub fn render_mods_config(config: &ModsConfig) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("ModsConfigData")))?;
    writer.write_event(Event::Start(BytesStart::new("version")))?;
    writer.write_event(Event::Text(BytesText::new(&config.version)))?;
    writer.write_event(Event::End(BytesEnd::new("version")))?;
    write_list(&mut writer, "activeMods", &config.active_mods)?;
    write_list(&mut writer, "knownExpansions", &config.known_expansions)?;
    writer.write_event(Event::End(BytesEnd::new("ModsConfigData")))?;
    Ok(writer.into_inner().into_inner())
}

pub fn write_mods_config(path: &Path, config: &ModsConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create ModsConfig dir")?;
    }
    let bytes = render_mods_config(config).context("render ModsConfig.xml")?;
    fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<ModsConfigData>
  <version>1.5.4104 rev435</version>
  <activeMods>
    <li>brrainz.harmony</li>
    <li>ludeon.rimworld</li>
    <li>Some.Mod_steam</li>
  </activeMods>
  <knownExpansions>
    <li>ludeon.rimworld.royalty</li>
  </knownExpansions>
</ModsConfigData>"#;

    #[test]
    fn reads_active_and_known_lists() {
        let config = parse_mods_config(SAMPLE.as_bytes()).expect("parse");
        assert_eq!(config.version, "1.5.4104 rev435");
        assert_eq!(
            config.active_mods,
            vec!["brrainz.harmony", "ludeon.rimworld", "some.mod_steam"]
        );
        assert_eq!(config.known_expansions, vec!["ludeon.rimworld.royalty"]);
    }

    #[test]
    fn written_file_reads_back() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("Config").join("ModsConfig.xml");
        let config = ModsConfig {
            version: "1.5".to_string(),
            active_mods: vec!["ludeon.rimworld".to_string(), "a&b.mod".to_string()],
            known_expansions: vec![],
        };
        write_mods_config(&path, &config).expect("write");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("<li>a&amp;b.mod</li>"));
        assert_eq!(read_mods_config(&path).expect("reread"), config);
    }

    #[test]
    fn default_list_holds_base_game() {
        let config = ModsConfig::default_for(Some("1.4.3901 rev1"));
        assert_eq!(config.version, "1.4");
        assert_eq!(config.active_mods, vec![rimworld::BASE_GAME_PACKAGE_ID]);
    }
}
