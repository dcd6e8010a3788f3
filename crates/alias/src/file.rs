//! Loading aliases from a sendmail-style aliases file.
//!
//! ```text
//! # comment
//! name: address, other@example.com, |/usr/bin/program arg, /var/log/file
//!     continued@example.com
//! team: :/etc/tern/team-members
//! ```
use crate::{AliasMap, AliasNode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AliasFileError {
    #[error("failed to read alias file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn load_alias_file(path: &Path) -> Result<AliasMap, AliasFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| AliasFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_aliases(&text, &path.display().to_string()))
}

/// Parse the contents of an aliases file. `origin` names the source
/// in diagnostics.
pub fn parse_aliases(text: &str, origin: &str) -> AliasMap {
    let mut items: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, line) in text.lines().enumerate() {
        let line_number = idx + 1;
        let line = line.trim_end();
        if line.trim_start().starts_with('#') {
            continue;
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, entry)) = pending.as_mut() {
                entry.push_str(line);
            }
            continue;
        }
        if let Some((number, entry)) = pending.take() {
            handle_entry(&mut items, &entry, origin, number);
        }
        pending = Some((line_number, line.to_string()));
    }
    if let Some((number, entry)) = pending.take() {
        handle_entry(&mut items, &entry, origin, number);
    }

    items
        .into_iter()
        .map(|(name, items)| {
            let members = items
                .iter()
                .filter_map(|item| parse_item(item, origin, true))
                .flatten()
                .collect();
            (name, AliasNode::Group(members))
        })
        .collect()
}

fn handle_entry(items: &mut BTreeMap<String, Vec<String>>, entry: &str, origin: &str, line: usize) {
    if entry.trim().is_empty() {
        return;
    }
    let Some((name, rest)) = entry.split_once(':') else {
        tracing::warn!("{origin}:{line}: invalid alias entry, expected 'name: targets'");
        return;
    };
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        tracing::warn!("{origin}:{line}: alias entry has no name");
        return;
    }
    let targets = items.entry(name).or_default();
    targets.extend(
        rest.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string),
    );
}

/// Turn one target into alias nodes. Includes expand to several nodes;
/// an include found inside an included file is skipped.
fn parse_item(item: &str, origin: &str, allow_include: bool) -> Option<Vec<AliasNode>> {
    if let Some(include) = item.strip_prefix(':') {
        if !allow_include {
            tracing::warn!("{origin}: nested include of {include} ignored");
            return None;
        }
        let text = match std::fs::read_to_string(include) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!("{origin}: unable to include {include}: {err:#}");
                return None;
            }
        };
        let nodes = text
            .split([',', '\n'])
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .filter_map(|item| parse_item(item, include, false))
            .flatten()
            .collect();
        return Some(nodes);
    }

    if let Some(command) = item.strip_prefix('|') {
        let mut words = command.split_whitespace();
        let Some(program) = words.next() else {
            tracing::warn!("{origin}: empty program alias");
            return None;
        };
        return Some(vec![AliasNode::Process {
            program: program.to_string(),
            args: words.map(str::to_string).collect(),
        }]);
    }

    if item.starts_with('/') {
        let path = PathBuf::from(item);
        if path.is_dir() {
            tracing::warn!("{origin}: directory delivery to {item} is not supported");
            return None;
        }
        return Some(vec![AliasNode::File(path)]);
    }

    Some(vec![AliasNode::Address(item.to_string())])
}
