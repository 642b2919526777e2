//! Line-oriented compose rewriting
//!
//! Named-volume references in `services.<name>.volumes` are rewritten into
//! host bind mounts without parsing the document into a tree, so comments,
//! quoting and key order written by the user survive untouched. Lines the
//! rewriter cannot classify with certainty are left as they are.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::AppError;
use crate::models::stack::StorageMappingStrategy;
use crate::utils::is_safe_path_segment;

/// Where and how named volumes are mapped onto the host
#[derive(Debug, Clone, Copy)]
pub struct StorageContext<'a> {
    pub app_id: &'a str,
    pub app_data_root: &'a Path,
    pub strategy: StorageMappingStrategy,
}

/// Result of a storage-mapping rewrite
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutput {
    /// Rewritten compose text
    pub content: String,

    /// Host directories that must exist before compose runs
    pub bind_dirs: Vec<PathBuf>,

    /// Named volumes that were turned into bind mounts
    pub converted_volumes: Vec<String>,
}

/// Turns named-volume references of a compose definition into bind mounts
pub trait ComposeRewriter: Send + Sync {
    fn rewrite(&self, compose: &str, ctx: &StorageContext<'_>) -> Result<RewriteOutput, AppError>;
}

/// [`ComposeRewriter`] working line by line on the original text
#[derive(Debug, Clone, Copy, Default)]
pub struct LineRewriter;

// ============================== LINE CLASSIFICATION ============================== //

/// A source line split from its terminator
#[derive(Debug, Clone)]
struct Line<'a> {
    body: &'a str,
    eol: &'a str,
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    text.split_inclusive('\n')
        .map(|raw| {
            let body = raw
                .strip_suffix("\r\n")
                .or_else(|| raw.strip_suffix('\n'))
                .unwrap_or(raw);
            Line {
                body,
                eol: &raw[body.len()..],
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LineKind {
    /// Blank or comment-only line
    Blank,
    /// `key:` or `key: value`
    Key {
        indent: usize,
        key: String,
        value: String,
    },
    /// `- value`; `value_start` is the byte offset of the value in the line
    Item { indent: usize, value_start: usize },
    Other { indent: usize },
}

fn key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^("[^"]*"|'[^']*'|[^\s#'"\-][^:#]*?|-[^\s:#][^:#]*?)\s*:(?:\s+(.*))?$"#)
            .expect("valid key regex")
    })
}

fn classify(line: &str) -> LineKind {
    let trimmed = line.trim_start();
    let indent = line.len() - trimmed.len();

    if trimmed.is_empty() || trimmed.starts_with('#') {
        return LineKind::Blank;
    }

    if trimmed == "-" || trimmed.starts_with("- ") || trimmed.starts_with("-\t") {
        let rest = trimmed[1..].trim_start();
        return LineKind::Item {
            indent,
            value_start: line.len() - rest.len(),
        };
    }

    if let Some(caps) = key_regex().captures(trimmed) {
        let key = caps[1].trim_matches(|c| c == '"' || c == '\'').to_string();
        let value = caps
            .get(2)
            .map(|m| split_comment(m.as_str()).0.trim().to_string())
            .unwrap_or_default();
        return LineKind::Key { indent, key, value };
    }

    LineKind::Other { indent }
}

/// Stack of enclosing mapping keys, maintained by indentation
#[derive(Debug, Default)]
struct KeyPath {
    stack: Vec<(usize, String)>,
}

impl KeyPath {
    /// Update the path for a classified line
    fn observe(&mut self, kind: &LineKind) {
        match kind {
            LineKind::Blank => {}
            LineKind::Key { indent, key, .. } => {
                while self.stack.last().is_some_and(|(i, _)| *i >= *indent) {
                    self.stack.pop();
                }
                self.stack.push((*indent, key.clone()));
            }
            // Sequence items may sit at the same indent as their parent key
            LineKind::Item { indent, .. } => {
                while self.stack.last().is_some_and(|(i, _)| *i > *indent) {
                    self.stack.pop();
                }
            }
            LineKind::Other { indent } => {
                while self.stack.last().is_some_and(|(i, _)| *i >= *indent) {
                    self.stack.pop();
                }
            }
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.stack.iter().map(|(_, k)| k.as_str()).collect()
    }

    fn top_level(&self) -> bool {
        self.stack.first().is_some_and(|(indent, _)| *indent == 0)
    }

    /// Inside `services.<name>.<section>` exactly
    fn is_service_list(&self, section: &str) -> bool {
        let keys = self.keys();
        self.top_level() && keys.len() == 3 && keys[0] == "services" && keys[2] == section
    }

    /// Anywhere below a `services.<name>.volumes` entry
    fn is_below_service_volumes(&self) -> bool {
        let keys = self.keys();
        self.top_level() && keys.len() > 3 && keys[0] == "services" && keys[2] == "volumes"
    }
}

/// Split `value # comment` into the value and everything from the comment marker
fn split_comment(text: &str) -> (&str, &str) {
    let mut quote: Option<char> = None;
    let mut prev_ws = true;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '#' && prev_ws => return (&text[..i], &text[i..]),
            None => {}
        }
        prev_ws = c.is_whitespace();
    }
    (text, "")
}

/// The scalar of a sequence item, with its quoting and trailing text
#[derive(Debug, Clone, PartialEq, Eq)]
struct ItemScalar<'a> {
    /// Unquoted value
    value: &'a str,
    quote: Option<char>,
    /// Whitespace and comment following the value
    suffix: &'a str,
}

fn item_scalar(item: &str) -> Option<ItemScalar<'_>> {
    let (value_part, _) = split_comment(item);
    let raw = value_part.trim_end();
    let suffix = &item[raw.len()..];

    let first = raw.chars().next()?;
    if first == '"' || first == '\'' {
        if raw.len() < 2 || !raw.ends_with(first) {
            return None;
        }
        return Some(ItemScalar {
            value: &raw[1..raw.len() - 1],
            quote: Some(first),
            suffix,
        });
    }

    Some(ItemScalar {
        value: raw,
        quote: None,
        suffix,
    })
}

// ================================ VOLUME ENTRIES ================================= //

/// A short-syntax volume entry `source:target[:mode]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub source: String,
    pub target: String,
    pub mode: Option<String>,
}

/// How the source of a volume entry is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSource {
    /// Host path mapped directly
    Bind,
    /// Reference to a named volume
    Named,
    /// Neither with certainty; never rewritten
    Ambiguous,
}

fn named_volume_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid volume name regex"))
}

/// Classify the source part of a volume entry
pub fn classify_source(source: &str) -> VolumeSource {
    if source.starts_with('/')
        || source.starts_with("./")
        || source.starts_with("../")
        || source.starts_with('~')
        || source.starts_with('$')
        || source == "."
        || source == ".."
        || source.contains('/')
    {
        VolumeSource::Bind
    } else if named_volume_regex().is_match(source) {
        VolumeSource::Named
    } else {
        VolumeSource::Ambiguous
    }
}

/// Parse a short-syntax volume entry; `None` for anything else
pub fn parse_volume_entry(spec: &str) -> Option<VolumeEntry> {
    if spec.contains(": ") || spec.starts_with('{') {
        return None;
    }

    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 || parts.iter().any(|p| p.trim().is_empty()) {
        return None;
    }

    Some(VolumeEntry {
        source: parts[0].to_string(),
        target: parts[1].to_string(),
        mode: parts.get(2).map(|m| m.to_string()),
    })
}

/// Host bind path for a named volume under `ctx`
pub fn bind_path_for(source: &str, target: &str, ctx: &StorageContext<'_>) -> Result<PathBuf, AppError> {
    match ctx.strategy {
        StorageMappingStrategy::LegacyNamedSource => Ok(ctx.app_data_root.join(source)),
        StorageMappingStrategy::AppTargetPath => {
            let app_root = ctx.app_data_root.join(ctx.app_id);

            let mut segments: Vec<&str> = Vec::new();
            for segment in target.split('/') {
                match segment {
                    "" | "." => {}
                    ".." => {
                        if segments.pop().is_none() {
                            return Err(AppError::MaterializeError(format!(
                                "Volume target '{}' escapes the data directory of {}",
                                target, ctx.app_id
                            )));
                        }
                    }
                    other => segments.push(other),
                }
            }

            if segments.is_empty() {
                return Err(AppError::MaterializeError(format!(
                    "Volume '{}' targets the container root and cannot be mapped under {}",
                    source,
                    app_root.display()
                )));
            }

            let path = segments.iter().fold(app_root.clone(), |p, s| p.join(s));
            if !path.starts_with(&app_root) {
                return Err(AppError::MaterializeError(format!(
                    "Volume target '{}' resolves outside {}",
                    target,
                    app_root.display()
                )));
            }
            Ok(path)
        }
    }
}

/// Every short-syntax volume entry declared by a service
pub fn service_volume_entries(compose: &str) -> Vec<VolumeEntry> {
    let mut path = KeyPath::default();
    let mut entries = Vec::new();

    for line in split_lines(compose) {
        let kind = classify(line.body);
        path.observe(&kind);
        if let LineKind::Item { value_start, .. } = kind {
            if path.is_service_list("volumes") {
                if let Some(entry) =
                    item_scalar(&line.body[value_start..]).and_then(|s| parse_volume_entry(s.value))
                {
                    entries.push(entry);
                }
            }
        }
    }
    entries
}

/// Names declared under the top-level `volumes` key
pub fn top_level_volume_names(compose: &str) -> Vec<String> {
    let mut path = KeyPath::default();
    let mut names = Vec::new();

    for line in split_lines(compose) {
        let kind = classify(line.body);
        path.observe(&kind);
        if let LineKind::Key { key, .. } = &kind {
            let keys = path.keys();
            if path.top_level() && keys.len() == 2 && keys[0] == "volumes" {
                names.push(key.clone());
            }
        }
    }
    names
}

// ================================== REWRITING =================================== //

/// A top-level named-volume definition and the lines it spans
#[derive(Debug)]
struct VolumeDefinition {
    name: String,
    start: usize,
    indent: usize,
}

impl ComposeRewriter for LineRewriter {
    fn rewrite(&self, compose: &str, ctx: &StorageContext<'_>) -> Result<RewriteOutput, AppError> {
        if !is_safe_path_segment(ctx.app_id) {
            return Err(AppError::MaterializeError(format!(
                "App id '{}' cannot be used as a directory name",
                ctx.app_id
            )));
        }

        let lines = split_lines(compose);
        let mut output: Vec<Option<String>> = Vec::with_capacity(lines.len());
        let mut path = KeyPath::default();

        let mut converted: BTreeSet<String> = BTreeSet::new();
        let mut still_referenced: BTreeSet<String> = BTreeSet::new();
        let mut bind_dirs: Vec<PathBuf> = Vec::new();

        let mut volumes_header: Option<usize> = None;
        let mut definitions: Vec<VolumeDefinition> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            let kind = classify(line.body);
            path.observe(&kind);

            match &kind {
                LineKind::Key { indent, key, value } => {
                    let keys = path.keys();
                    if path.top_level() && keys == ["volumes"] {
                        volumes_header = Some(idx);
                    } else if path.top_level() && keys.len() == 2 && keys[0] == "volumes" {
                        definitions.push(VolumeDefinition {
                            name: key.clone(),
                            start: idx,
                            indent: *indent,
                        });
                    } else if path.is_below_service_volumes() && key == "source" {
                        // Long syntax keeps referring to the named volume
                        still_referenced.insert(value.trim_matches(|c| c == '"' || c == '\'').to_string());
                    }
                }
                LineKind::Item { value_start, .. } if path.is_service_list("volumes") => {
                    if let Some(rewritten) = rewrite_volume_item(
                        line.body,
                        *value_start,
                        ctx,
                        &mut converted,
                        &mut still_referenced,
                        &mut bind_dirs,
                    )? {
                        output.push(Some(format!("{}{}", rewritten, line.eol)));
                        continue;
                    }
                }
                _ => {}
            }

            output.push(Some(format!("{}{}", line.body, line.eol)));
        }

        remove_definitions(
            &lines,
            &mut output,
            volumes_header,
            &definitions,
            &converted,
            &still_referenced,
        );

        bind_dirs.sort();
        bind_dirs.dedup();

        Ok(RewriteOutput {
            content: output.into_iter().flatten().collect(),
            bind_dirs,
            converted_volumes: converted.into_iter().collect(),
        })
    }
}

/// Rewrite one `services.<name>.volumes` item, `None` when left untouched
fn rewrite_volume_item(
    line: &str,
    value_start: usize,
    ctx: &StorageContext<'_>,
    converted: &mut BTreeSet<String>,
    still_referenced: &mut BTreeSet<String>,
    bind_dirs: &mut Vec<PathBuf>,
) -> Result<Option<String>, AppError> {
    let item = &line[value_start..];
    let Some(scalar) = item_scalar(item) else {
        return Ok(None);
    };

    // `- source: data` opens a long-syntax mapping
    if let Some(named) = scalar.value.strip_prefix("source: ") {
        still_referenced.insert(named.trim().trim_matches(|c| c == '"' || c == '\'').to_string());
        return Ok(None);
    }

    let Some(entry) = parse_volume_entry(scalar.value) else {
        return Ok(None);
    };
    if classify_source(&entry.source) != VolumeSource::Named || !entry.target.starts_with('/') {
        return Ok(None);
    }

    let bind = bind_path_for(&entry.source, &entry.target, ctx)?;
    let bind_str = bind.to_string_lossy();
    if bind_str.contains(':') {
        return Err(AppError::MaterializeError(format!(
            "Bind path {} cannot be expressed in a volume entry",
            bind_str
        )));
    }

    let quote = scalar.quote.map(String::from).unwrap_or_default();
    let mode = entry.mode.as_deref().map(|m| format!(":{}", m)).unwrap_or_default();
    let rewritten = format!(
        "{}{}{}:{}{}{}{}",
        &line[..value_start],
        quote,
        bind_str,
        entry.target,
        mode,
        quote,
        scalar.suffix
    );

    converted.insert(entry.source.clone());
    bind_dirs.push(bind);
    Ok(Some(rewritten))
}

/// Drop top-level definitions of converted volumes, and the whole section once empty
fn remove_definitions(
    lines: &[Line<'_>],
    output: &mut [Option<String>],
    header: Option<usize>,
    definitions: &[VolumeDefinition],
    converted: &BTreeSet<String>,
    still_referenced: &BTreeSet<String>,
) {
    let Some(header) = header else {
        return;
    };
    if definitions.is_empty() {
        return;
    }

    let removable = |def: &VolumeDefinition| {
        converted.contains(&def.name) && !still_referenced.contains(&def.name)
    };

    if definitions.iter().all(removable) {
        let end = block_end(lines, header, 0);
        for slot in &mut output[header..end] {
            *slot = None;
        }
        return;
    }

    for def in definitions.iter().filter(|d| removable(d)) {
        let end = block_end(lines, def.start, def.indent);
        for slot in &mut output[def.start..end] {
            *slot = None;
        }
    }
}

/// End (exclusive) of the block opened at `start`, not counting trailing blank lines
fn block_end(lines: &[Line<'_>], start: usize, indent: usize) -> usize {
    let mut end = start + 1;
    let mut last_content = start + 1;
    while end < lines.len() {
        match classify(lines[end].body) {
            LineKind::Blank => {}
            LineKind::Key { indent: i, .. }
            | LineKind::Item { indent: i, .. }
            | LineKind::Other { indent: i } => {
                if i <= indent {
                    break;
                }
                last_content = end + 1;
            }
        }
        end += 1;
    }
    last_content
}

// ================================ PORT OVERRIDE ================================= //

fn published_port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^((?:\d{1,3}(?:\.\d{1,3}){3}|\[[0-9A-Fa-f:]+\]):)?(\d+):(\d+)((?:/(?:tcp|udp))?)$")
            .expect("valid port regex")
    })
}

/// A `host:container` mapping found in a service's `ports` list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedPort {
    pub host: u16,
    pub container: u16,
}

/// Every short-syntax published port mapping, in document order
pub fn published_ports(compose: &str) -> Vec<PublishedPort> {
    let mut path = KeyPath::default();
    let mut ports = Vec::new();

    for line in split_lines(compose) {
        let kind = classify(line.body);
        path.observe(&kind);
        if let LineKind::Item { value_start, .. } = kind {
            if !path.is_service_list("ports") {
                continue;
            }
            let Some(scalar) = item_scalar(&line.body[value_start..]) else {
                continue;
            };
            if let Some(caps) = published_port_regex().captures(scalar.value) {
                if let (Ok(host), Ok(container)) = (caps[2].parse(), caps[3].parse()) {
                    ports.push(PublishedPort { host, container });
                }
            }
        }
    }
    ports
}

/// Replace the host side of the first published port mapping.
///
/// With `container_port` set, only a mapping onto that container port
/// qualifies. Fails when no mapping qualifies.
pub fn override_published_port(
    compose: &str,
    host_port: u16,
    container_port: Option<u16>,
) -> Result<String, AppError> {
    let lines = split_lines(compose);
    let mut path = KeyPath::default();
    let mut out = String::with_capacity(compose.len());
    let mut replaced = false;

    for line in &lines {
        let kind = classify(line.body);
        path.observe(&kind);

        if !replaced {
            if let LineKind::Item { value_start, .. } = kind {
                if path.is_service_list("ports") {
                    if let Some(rewritten) =
                        rewrite_port_item(line.body, value_start, host_port, container_port)
                    {
                        out.push_str(&rewritten);
                        out.push_str(line.eol);
                        replaced = true;
                        continue;
                    }
                }
            }
        }

        out.push_str(line.body);
        out.push_str(line.eol);
    }

    if !replaced {
        return Err(AppError::MaterializeError(match container_port {
            Some(port) => format!("No published port mapping to container port {} to override", port),
            None => "No published port mapping to override".to_string(),
        }));
    }
    Ok(out)
}

fn rewrite_port_item(
    line: &str,
    value_start: usize,
    host_port: u16,
    container_port: Option<u16>,
) -> Option<String> {
    let scalar = item_scalar(&line[value_start..])?;
    let caps = published_port_regex().captures(scalar.value)?;
    let container = &caps[3];
    if let Some(expected) = container_port {
        if container.parse::<u16>().ok()? != expected {
            return None;
        }
    }

    let quote = scalar.quote.map(String::from).unwrap_or_default();
    Some(format!(
        "{}{}{}{}:{}{}{}{}",
        &line[..value_start],
        quote,
        caps.get(1).map(|m| m.as_str()).unwrap_or(""),
        host_port,
        container,
        &caps[4],
        quote,
        scalar.suffix
    ))
}
