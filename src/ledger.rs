//! Reader and writer for Steam's brace-nested key/value files
//! (`appworkshop_294100.acf`, `libraryfolders.vdf`).

use crate::dbmerge::{merge_into, MergePolicy};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

pub type Ledger = Map<String, Value>;

pub const WORKSHOP_ROOT: &str = "AppWorkshop";
pub const ITEMS_INSTALLED: &str = "WorkshopItemsInstalled";
pub const ITEM_DETAILS: &str = "WorkshopItemDetails";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text(String),
    Open,
    Close,
}

fn tokenize(raw: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => tokens.push(Token::Open),
            '}' => tokens.push(Token::Close),
            '"' => {
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => text.push(other),
                    }
                }
                if !closed {
                    bail!("unterminated string");
                }
                tokens.push(Token::Text(text));
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => {}
            other => {
                let mut text = String::from(other);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || next == '{' || next == '}' || next == '"' {
                        break;
                    }
                    text.push(next);
                    chars.next();
                }
                tokens.push(Token::Text(text));
            }
        }
    }
    Ok(tokens)
}

fn parse_block<I>(tokens: &mut I, nested: bool) -> Result<Ledger>
where
    I: Iterator<Item = Token>,
{
    let mut block = Map::new();
    loop {
        let key = match tokens.next() {
            Some(Token::Text(key)) => key,
            Some(Token::Close) if nested => return Ok(block),
            Some(Token::Close) => bail!("unexpected closing brace"),
            Some(Token::Open) => bail!("block without a key"),
            None if nested => bail!("unexpected end of input inside a block"),
            None => return Ok(block),
        };
        let value = match tokens.next() {
            Some(Token::Text(value)) => Value::String(value),
            Some(Token::Open) => Value::Object(parse_block(tokens, true)?),
            _ => bail!("key {key:?} has no value"),
        };
        block.insert(key, value);
    }
}

pub fn parse_ledger(raw: &str) -> Result<Ledger> {
    let mut tokens = tokenize(raw)?.into_iter();
    parse_block(&mut tokens, false)
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn render_block(block: &Ledger, depth: usize, out: &mut String) {
    let indent = "\t".repeat(depth);
    for (key, value) in block {
        match value {
            Value::Object(children) => {
                out.push_str(&format!("{indent}{}\n{indent}{{\n", quote(key)));
                render_block(children, depth + 1, out);
                out.push_str(&format!("{indent}}}\n"));
            }
            Value::String(text) => {
                out.push_str(&format!("{indent}{}\t\t{}\n", quote(key), quote(text)));
            }
            Value::Null => {
                out.push_str(&format!("{indent}{}\t\t\"\"\n", quote(key)));
            }
            other => {
                out.push_str(&format!("{indent}{}\t\t{}\n", quote(key), quote(&other.to_string())));
            }
        }
    }
}

pub fn render_ledger(ledger: &Ledger) -> String {
    let mut out = String::new();
    render_block(ledger, 0, &mut out);
    out
}

pub fn read_ledger(path: &Path) -> Result<Ledger> {
    let raw = fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
    parse_ledger(&raw).with_context(|| format!("parse ledger {}", path.display()))
}

pub fn write_ledger(path: &Path, ledger: &Ledger) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create ledger dir")?;
    }
    fs::write(path, render_ledger(ledger)).with_context(|| format!("write ledger {}", path.display()))
}

fn section<'a>(ledger: &'a Ledger, name: &str) -> Option<&'a Map<String, Value>> {
    ledger.get(WORKSHOP_ROOT)?.get(name)?.as_object()
}

fn section_mut<'a>(ledger: &'a mut Ledger, name: &str) -> Option<&'a mut Map<String, Value>> {
    ledger.get_mut(WORKSHOP_ROOT)?.get_mut(name)?.as_object_mut()
}

fn section_len(ledger: &Ledger, name: &str) -> usize {
    section(ledger, name).map(Map::len).unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub installed_before: usize,
    pub installed_after: usize,
    pub details_before: usize,
    pub details_after: usize,
}

/// Folds the installed-item sections of `source` into `target` and writes
/// the target back.
pub fn import_ledger(target: &Path, source: &Path) -> Result<ImportSummary> {
    let mut target_ledger = read_ledger(target)?;
    let source_ledger = read_ledger(source)?;
    let mut summary = ImportSummary {
        installed_before: section_len(&target_ledger, ITEMS_INSTALLED),
        details_before: section_len(&target_ledger, ITEM_DETAILS),
        ..ImportSummary::default()
    };

    let root = target_ledger
        .entry(WORKSHOP_ROOT.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(root) = root.as_object_mut() else {
        bail!("{} has a malformed {WORKSHOP_ROOT} block", target.display());
    };
    for name in [ITEMS_INSTALLED, ITEM_DETAILS] {
        let Some(incoming) = section(&source_ledger, name) else {
            debug!("{} has no {name} section", source.display());
            continue;
        };
        let existing = root
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match existing.as_object_mut() {
            Some(existing) => merge_into(existing, incoming.clone(), &MergePolicy::plain()),
            None => *existing = Value::Object(incoming.clone()),
        }
    }

    summary.installed_after = section_len(&target_ledger, ITEMS_INSTALLED);
    summary.details_after = section_len(&target_ledger, ITEM_DETAILS);
    write_ledger(target, &target_ledger)?;
    info!(
        "Imported ledger {} into {}: {} -> {} installed items",
        source.display(),
        target.display(),
        summary.installed_before,
        summary.installed_after
    );
    Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub removed_items: Vec<String>,
    pub removed_manifests: Vec<PathBuf>,
}

/// Drops `ids` from both installed-item sections and deletes their depot
/// manifests (`<appid>_<manifest>.manifest`).
pub fn purge_ledger_items(ledger_path: &Path, depotcache: &Path, ids: &[String], app_id: u32) -> Result<PurgeSummary> {
    let mut ledger = read_ledger(ledger_path)?;
    let mut summary = PurgeSummary::default();
    let mut manifests = Vec::new();

    for name in [ITEMS_INSTALLED, ITEM_DETAILS] {
        let Some(items) = section_mut(&mut ledger, name) else {
            continue;
        };
        for id in ids {
            if let Some(entry) = items.remove(id) {
                if let Some(manifest) = entry.get("manifest").and_then(Value::as_str) {
                    manifests.push(manifest.to_string());
                }
                if !summary.removed_items.contains(id) {
                    summary.removed_items.push(id.clone());
                }
            }
        }
    }
    write_ledger(ledger_path, &ledger)?;

    manifests.sort();
    manifests.dedup();
    for manifest in manifests {
        let path = depotcache.join(format!("{app_id}_{manifest}.manifest"));
        if !path.exists() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => summary.removed_manifests.push(path),
            Err(err) => warn!("Failed to remove depot manifest {}: {err}", path.display()),
        }
    }
    info!(
        "Purged {} items and {} manifests from {}",
        summary.removed_items.len(),
        summary.removed_manifests.len(),
        ledger_path.display()
    );
    Ok(summary)
}
