use crate::{
    error::ParseError,
    library::{RawDescriptor, RawRelations, VersionedList},
};
use quick_xml::{events::Event, Reader};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub const ABOUT_DIR: &str = "About";
pub const ABOUT_FILE: &str = "About.xml";
pub const PUBLISHED_FILE_ID_FILE: &str = "PublishedFileId.txt";

/// Turns a mod directory into a raw descriptor. Implementations must be
/// callable from the refresh worker pool.
pub trait DescriptorParser: Send + Sync {
    /// Where this parser looks for the descriptor of `directory`.
    fn descriptor_path(&self, directory: &Path) -> PathBuf;

    fn parse(&self, directory: &Path) -> Result<RawDescriptor, ParseError>;
}

/// Reads `About/About.xml` (and `About/PublishedFileId.txt` when present).
#[derive(Debug, Default, Clone, Copy)]
pub struct AboutXmlParser;

impl DescriptorParser for AboutXmlParser {
    fn descriptor_path(&self, directory: &Path) -> PathBuf {
        find_about_file(directory).unwrap_or_else(|| directory.join(ABOUT_DIR).join(ABOUT_FILE))
    }

    fn parse(&self, directory: &Path) -> Result<RawDescriptor, ParseError> {
        let path = find_about_file(directory)
            .ok_or_else(|| ParseError::MissingDescriptor(directory.to_path_buf()))?;
        let bytes = fs::read(&path).map_err(|source| ParseError::Io {
            path: path.clone(),
            source,
        })?;
        let mut descriptor = parse_about_xml(&bytes).map_err(|reason| ParseError::Malformed {
            path: path.clone(),
            reason,
        })?;
        if descriptor.published_file_id.is_none() {
            descriptor.published_file_id = path
                .parent()
                .and_then(|about| read_published_file_id(about));
        }
        Ok(descriptor)
    }
}

fn find_child_ignore_case(dir: &Path, wanted: &str) -> Option<PathBuf> {
    let exact = dir.join(wanted);
    if exact.exists() {
        return Some(exact);
    }
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .find(|entry| entry.file_name().to_string_lossy().eq_ignore_ascii_case(wanted))
        .map(|entry| entry.path())
}

fn find_about_file(directory: &Path) -> Option<PathBuf> {
    let about = find_child_ignore_case(directory, ABOUT_DIR)?;
    let file = find_child_ignore_case(&about, ABOUT_FILE)?;
    file.is_file().then_some(file)
}

fn read_published_file_id(about_dir: &Path) -> Option<String> {
    let path = find_child_ignore_case(about_dir, PUBLISHED_FILE_ID_FILE)?;
    let raw = fs::read_to_string(path).ok()?;
    let trimmed = raw.trim().trim_start_matches('\u{feff}');
    (!trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit())).then(|| trimmed.to_string())
}

/// Element tree with lowercased tag names; About.xml tag casing varies wildly
/// between mods.
#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.name == name)
    }

    fn text_of(&self, name: &str) -> Option<String> {
        self.child(name)
            .map(|child| child.text.trim().to_string())
            .filter(|text| !text.is_empty())
    }

    fn list_items(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|child| child.name == "li")
            .map(|child| child.text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect()
    }

    /// `<modDependencies><li><packageId>..</packageId></li></modDependencies>`
    fn dependency_items(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|child| child.name == "li")
            .filter_map(|child| child.text_of("packageid"))
            .collect()
    }
}

fn build_tree(bytes: &[u8]) -> Result<Node, String> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<Node> = vec![Node::default()];

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                stack.push(Node {
                    name,
                    ..Node::default()
                });
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node {
                        name,
                        ..Node::default()
                    });
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|err| err.to_string())?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8_lossy(&e.into_inner()).to_string();
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() < 2 {
                    return Err("unbalanced closing tag".to_string());
                }
                if let Some(node) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(format!(
                    "xml error at byte {}: {err}",
                    reader.buffer_position()
                ))
            }
            _ => {}
        }
        buf.clear();
    }

    if stack.len() != 1 {
        return Err("unexpected end of document".to_string());
    }
    stack.pop().ok_or_else(|| "empty document".to_string())
}

fn versioned(root: &Node, tag: &str, by_version_tag: &str, dependency_shape: bool) -> VersionedList {
    let items = |node: &Node| {
        if dependency_shape {
            node.dependency_items()
        } else {
            node.list_items()
        }
    };
    let all = root.child(tag).map(items).unwrap_or_default();
    let mut by_version = BTreeMap::new();
    if let Some(versions) = root.child(by_version_tag) {
        for version in &versions.children {
            let list = items(version);
            if !list.is_empty() {
                by_version
                    .entry(version.name.clone())
                    .or_insert_with(Vec::new)
                    .extend(list);
            }
        }
    }
    VersionedList { all, by_version }
}

pub fn parse_about_xml(bytes: &[u8]) -> Result<RawDescriptor, String> {
    let document = build_tree(bytes)?;
    let root = document
        .child("modmetadata")
        .ok_or_else(|| "missing ModMetaData root".to_string())?;
    let package_id = root
        .text_of("packageid")
        .ok_or_else(|| "missing packageId".to_string())?;

    let mut authors = root.child("authors").map(Node::list_items).unwrap_or_default();
    if let Some(author) = root.text_of("author") {
        authors.insert(0, author);
    }
    let supported_versions = root
        .child("supportedversions")
        .map(Node::list_items)
        .unwrap_or_default();

    Ok(RawDescriptor {
        package_id,
        name: root.text_of("name"),
        authors,
        description: root.text_of("description"),
        supported_versions,
        published_file_id: None,
        relations: RawRelations {
            dependencies: versioned(root, "moddependencies", "moddependenciesbyversion", true),
            incompatible_with: versioned(root, "incompatiblewith", "incompatiblewithbyversion", false),
            load_after: versioned(root, "loadafter", "loadafterbyversion", false),
            force_load_after: versioned(root, "forceloadafter", "forceloadafterbyversion", false),
            load_before: versioned(root, "loadbefore", "loadbeforebyversion", false),
            force_load_before: versioned(root, "forceloadbefore", "forceloadbeforebyversion", false),
        },
    })
}
