//! XML flavors: the legacy file-list rendering and the `/ping` share
//! manifest. Both are small fixed vocabularies written and read with
//! event-based XML, no DOM.

use xml::reader::{EventReader, XmlEvent as ReadEvent};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as WriteEvent};

use crate::protocol::error::Fs2Error;
use crate::protocol::types::{FileHash, ShareType};
use crate::wire::filelist::{FileList, Item};

/// One row of a peer's share manifest, as served from `/ping`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestShare {
    pub name: String,
    pub revision: u32,
    pub share_type: ShareType,
}

fn writer_for(buf: &mut Vec<u8>) -> EventWriter<&mut Vec<u8>> {
    EmitterConfig::new()
        .perform_indent(true)
        .create_writer(buf)
}

fn finish(buf: Vec<u8>) -> String {
    // The emitter only produces valid UTF-8.
    String::from_utf8(buf).unwrap_or_default()
}

/// Render a share manifest.
pub fn manifest_to_xml(shares: &[ManifestShare]) -> String {
    let mut buf = Vec::new();
    {
        let mut w = writer_for(&mut buf);
        let _ = w.write(WriteEvent::start_element("shares"));
        for share in shares {
            let revision = share.revision.to_string();
            let type_name = match share.share_type {
                ShareType::FileList => "FileList",
                ShareType::Xml => "xml",
            };
            let _ = w.write(
                WriteEvent::start_element("share")
                    .attr("name", &share.name)
                    .attr("revision", &revision)
                    .attr("type", type_name),
            );
            let _ = w.write(WriteEvent::end_element());
        }
        let _ = w.write(WriteEvent::end_element());
    }
    finish(buf)
}

/// Parse a share manifest. Share elements missing a name or revision are
/// skipped rather than failing the whole manifest.
pub fn manifest_from_xml(s: &str) -> Result<Vec<ManifestShare>, Fs2Error> {
    let mut shares = Vec::new();
    let reader = EventReader::new(s.as_bytes());
    for event in reader {
        let event = event.map_err(|e| Fs2Error::Parse(format!("manifest xml: {}", e)))?;
        if let ReadEvent::StartElement {
            name, attributes, ..
        } = event
        {
            if name.local_name != "share" {
                continue;
            }
            let mut share_name = None;
            let mut revision = None;
            let mut share_type = ShareType::Xml;
            for attr in attributes {
                match attr.name.local_name.as_str() {
                    "name" => share_name = Some(attr.value),
                    "revision" => revision = attr.value.parse::<u32>().ok(),
                    "type" => share_type = ShareType::from_manifest(&attr.value),
                    _ => {}
                }
            }
            if let (Some(name), Some(revision)) = (share_name, revision) {
                shares.push(ManifestShare {
                    name,
                    revision,
                    share_type,
                });
            }
        }
    }
    Ok(shares)
}

/// Render a file list in the legacy XML flavor.
pub fn filelist_to_xml(list: &FileList) -> String {
    let mut buf = Vec::new();
    {
        let mut w = writer_for(&mut buf);
        let revision = list.revision.to_string();
        let refreshed = list.last_refreshed.to_string();
        let _ = w.write(
            WriteEvent::start_element("filelist")
                .attr("name", &list.root.name)
                .attr("revision", &revision)
                .attr("last-refreshed", &refreshed),
        );
        if let Some(children) = &list.root.children {
            for child in children.values() {
                write_item(&mut w, child);
            }
        }
        let _ = w.write(WriteEvent::end_element());
    }
    finish(buf)
}

fn write_item(w: &mut EventWriter<&mut Vec<u8>>, item: &Item) {
    match &item.hash {
        None => {
            let _ = w.write(WriteEvent::start_element("directory").attr("name", &item.name));
            if let Some(children) = &item.children {
                for child in children.values() {
                    write_item(w, child);
                }
            }
            let _ = w.write(WriteEvent::end_element());
        }
        Some(hash) => {
            let size = item.size.to_string();
            let modified = item.last_modified.to_string();
            let version = item.hash_version.to_string();
            let hash = hash.to_hex();
            let _ = w.write(
                WriteEvent::start_element("file")
                    .attr("name", &item.name)
                    .attr("size", &size)
                    .attr("last-modified", &modified)
                    .attr("hash-version", &version)
                    .attr("hash", &hash),
            );
            let _ = w.write(WriteEvent::end_element());
        }
    }
}

/// Parse the legacy XML flavor back into a file list. Files with an
/// unparsable digest are dropped silently, matching import behavior for
/// corrupt entries; structural errors fail the parse.
pub fn filelist_from_xml(s: &str) -> Result<FileList, Fs2Error> {
    let mut list: Option<FileList> = None;
    // Stack of directories currently open; the root directory is index 0.
    let mut stack: Vec<Item> = Vec::new();

    let reader = EventReader::new(s.as_bytes());
    for event in reader {
        let event = event.map_err(|e| Fs2Error::Parse(format!("filelist xml: {}", e)))?;
        match event {
            ReadEvent::StartElement {
                name, attributes, ..
            } => match name.local_name.as_str() {
                "filelist" => {
                    let mut root_name = String::new();
                    let mut revision = 0u32;
                    let mut refreshed = 0u64;
                    for attr in attributes {
                        match attr.name.local_name.as_str() {
                            "name" => root_name = attr.value,
                            "revision" => {
                                revision = attr.value.parse().map_err(|_| {
                                    Fs2Error::Parse("bad filelist revision".to_string())
                                })?
                            }
                            "last-refreshed" => refreshed = attr.value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    list = Some(FileList {
                        revision,
                        last_refreshed: refreshed,
                        root: Item::new_directory(String::new()),
                    });
                    stack.push(Item::new_directory(root_name));
                }
                "directory" => {
                    if stack.is_empty() {
                        return Err(Fs2Error::Parse("directory outside filelist".to_string()));
                    }
                    let mut dir_name = String::new();
                    for attr in attributes {
                        if attr.name.local_name == "name" {
                            dir_name = attr.value;
                        }
                    }
                    stack.push(Item::new_directory(dir_name));
                }
                "file" => {
                    let parent = stack
                        .last_mut()
                        .ok_or_else(|| Fs2Error::Parse("file outside filelist".to_string()))?;
                    if let Some(file) = file_from_attrs(attributes) {
                        parent.insert_child(file);
                    }
                }
                _ => {}
            },
            ReadEvent::EndElement { name } => match name.local_name.as_str() {
                "directory" => {
                    let done = stack
                        .pop()
                        .ok_or_else(|| Fs2Error::Parse("unbalanced directory".to_string()))?;
                    let parent = stack
                        .last_mut()
                        .ok_or_else(|| Fs2Error::Parse("unbalanced directory".to_string()))?;
                    parent.insert_child(done);
                }
                "filelist" => {
                    let root = stack
                        .pop()
                        .ok_or_else(|| Fs2Error::Parse("unbalanced filelist".to_string()))?;
                    if let Some(list) = &mut list {
                        list.root = root;
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    let mut list = list.ok_or_else(|| Fs2Error::Parse("no filelist element".to_string()))?;
    list.root.recompute_aggregates();
    Ok(list)
}

fn file_from_attrs(attributes: Vec<xml::attribute::OwnedAttribute>) -> Option<Item> {
    let mut name = None;
    let mut size = 0u64;
    let mut modified = 0u64;
    let mut version = 0u8;
    let mut hash = None;
    for attr in attributes {
        match attr.name.local_name.as_str() {
            "name" => name = Some(attr.value),
            "size" => size = attr.value.parse().ok()?,
            "last-modified" => modified = attr.value.parse().unwrap_or(0),
            "hash-version" => version = attr.value.parse().unwrap_or(0),
            "hash" => hash = FileHash::from_hex(&attr.value),
            _ => {}
        }
    }
    Some(Item::new_file(name?, size, modified, version, hash?))
}

/// One source row from an indexnode's alternatives document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternativeSource {
    pub alias: String,
    pub url: String,
    pub name: String,
    pub size: u64,
}

/// Parse an `/alternatives/{hash}` response body. Rows missing an alias
/// or URL are skipped.
pub fn alternatives_from_xml(s: &str) -> Result<Vec<AlternativeSource>, Fs2Error> {
    let mut out = Vec::new();
    let reader = EventReader::new(s.as_bytes());
    for event in reader {
        let event = event.map_err(|e| Fs2Error::Parse(format!("alternatives xml: {}", e)))?;
        if let ReadEvent::StartElement {
            name, attributes, ..
        } = event
        {
            if name.local_name != "entry" {
                continue;
            }
            let mut alias = None;
            let mut url = None;
            let mut file_name = String::new();
            let mut size = 0u64;
            for attr in attributes {
                match attr.name.local_name.as_str() {
                    "fs2-clientalias" => alias = Some(attr.value),
                    "url" => url = Some(attr.value),
                    "name" => file_name = attr.value,
                    "fs2-size" => size = attr.value.parse().unwrap_or(0),
                    _ => {}
                }
            }
            if let (Some(alias), Some(url)) = (alias, url) {
                out.push(AlternativeSource {
                    alias,
                    url,
                    name: file_name,
                    size,
                });
            }
        }
    }
    Ok(out)
}

/// Total files across a decoded child map. Used by tests; real decode
/// paths call `Item::recompute_aggregates`.
#[cfg(test)]
fn total_files(children: &std::collections::BTreeMap<String, Item>) -> u64 {
    children.values().map(|c| c.file_count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::FILE_DIGEST_BYTES;

    fn hash(seed: u8) -> FileHash {
        FileHash([seed; FILE_DIGEST_BYTES])
    }

    fn sample_list() -> FileList {
        let mut music = Item::new_directory("music");
        music.insert_child(Item::new_file("song.ogg", 1000, 160, 1, hash(1)));
        music.insert_child(Item::new_file("b side.ogg", 2000, 161, 1, hash(2)));
        let mut root = Item::new_directory("my share");
        root.insert_child(music);
        root.insert_child(Item::new_file("readme & notes.txt", 5, 150, 1, hash(3)));
        root.recompute_aggregates();
        FileList {
            revision: 3,
            last_refreshed: 1234,
            root,
        }
    }

    #[test]
    fn filelist_xml_round_trip() {
        let list = sample_list();
        let xml = filelist_to_xml(&list);
        let decoded = filelist_from_xml(&xml).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn filelist_xml_escapes_names() {
        let xml = filelist_to_xml(&sample_list());
        assert!(xml.contains("readme &amp; notes.txt"));
    }

    #[test]
    fn filelist_xml_drops_bad_hashes() {
        let xml = format!(
            "<filelist name=\"s\" revision=\"1\" last-refreshed=\"0\">\
             <file name=\"ok\" size=\"5\" last-modified=\"0\" hash-version=\"1\" hash=\"{}\"/>\
             <file name=\"bad\" size=\"5\" last-modified=\"0\" hash-version=\"1\" hash=\"abcd\"/>\
             </filelist>",
            hash(9).to_hex()
        );
        let list = filelist_from_xml(&xml).unwrap();
        let children = list.root.children.as_ref().unwrap();
        assert!(children.contains_key("ok"));
        assert!(!children.contains_key("bad"));
        assert_eq!(total_files(children), 1);
    }

    #[test]
    fn filelist_xml_rejects_garbage() {
        assert!(filelist_from_xml("not xml at all <").is_err());
        assert!(filelist_from_xml("<other/>").is_err());
    }

    #[test]
    fn manifest_round_trip() {
        let shares = vec![
            ManifestShare {
                name: "music".to_string(),
                revision: 4,
                share_type: ShareType::FileList,
            },
            ManifestShare {
                name: "docs & things".to_string(),
                revision: 0,
                share_type: ShareType::Xml,
            },
        ];
        let xml = manifest_to_xml(&shares);
        assert_eq!(manifest_from_xml(&xml).unwrap(), shares);
    }

    #[test]
    fn manifest_skips_incomplete_rows() {
        let xml = "<shares><share name=\"a\"/><share name=\"b\" revision=\"2\" \
                   type=\"FileList\"/></shares>";
        let shares = manifest_from_xml(xml).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].name, "b");
        assert_eq!(shares[0].revision, 2);
    }

    #[test]
    fn empty_manifest() {
        assert_eq!(manifest_from_xml("<shares/>").unwrap(), Vec::new());
        assert!(manifest_to_xml(&[]).contains("shares"));
    }

    #[test]
    fn alternatives_parse() {
        let xml = "<fs2-alternatives fs2-hash=\"ab\">\
                   <entry name=\"song.ogg\" fs2-size=\"9\" fs2-clientalias=\"bob\" \
                   url=\"http://10.0.0.1:41000/shares/music/song.ogg\"/>\
                   <entry name=\"incomplete-row\"/>\
                   </fs2-alternatives>";
        let sources = alternatives_from_xml(xml).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].alias, "bob");
        assert_eq!(sources[0].size, 9);
        assert!(sources[0].url.ends_with("song.ogg"));
    }
}
