//! Media server XML documents to model types.

use std::io::Read;

use xmltree::{Element, XMLNode};

use crate::errors::{CompanionError, Result};
use crate::model::{MediaDescriptor, MediaStream, RemoteQueue, StreamType};

fn attr(elem: &Element, name: &str) -> Option<String> {
    elem.attributes
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn attr_flag(elem: &Element, name: &str) -> bool {
    matches!(elem.attributes.get(name).map(String::as_str), Some("1") | Some("true"))
}

fn child_elements<'a>(elem: &'a Element) -> impl Iterator<Item = &'a Element> {
    elem.children.iter().filter_map(|node| match node {
        XMLNode::Element(child) => Some(child),
        _ => None,
    })
}

fn parse_container<R: Read>(reader: R) -> Result<Element> {
    let root = Element::parse(reader)?;
    if root.name != "MediaContainer" {
        return Err(CompanionError::xml(format!(
            "expected MediaContainer, found {}",
            root.name
        )));
    }
    Ok(root)
}

fn parse_stream(elem: &Element) -> Option<MediaStream> {
    let stream_type = attr(elem, "streamType")
        .and_then(|t| t.parse::<u32>().ok())
        .and_then(StreamType::from_code)?;
    Some(MediaStream {
        id: attr(elem, "id")?,
        stream_type,
        // external subtitles are served under their own key
        external: elem.attributes.contains_key("key"),
        selected: attr_flag(elem, "selected"),
        language: attr(elem, "languageCode").or_else(|| attr(elem, "language")),
    })
}

/// Reads one metadata element (`Video`, `Track`, `Directory`, `Photo`).
pub fn parse_descriptor(elem: &Element) -> Option<MediaDescriptor> {
    let plex_id = attr(elem, "ratingKey")?;
    let mut descriptor = MediaDescriptor {
        key: attr(elem, "key").unwrap_or_else(|| format!("/library/metadata/{}", plex_id)),
        plex_id,
        plex_type: attr(elem, "type").unwrap_or_default(),
        title: attr(elem, "title").unwrap_or_default(),
        duration_ms: attr(elem, "duration").and_then(|d| d.parse().ok()),
        play_queue_item_id: attr(elem, "playQueueItemID"),
        ..MediaDescriptor::default()
    };

    // first Media / first Part is the one the player opens
    let part = child_elements(elem)
        .find(|c| c.name == "Media")
        .and_then(|media| child_elements(media).find(|c| c.name == "Part"));
    if let Some(part) = part {
        descriptor.file = attr(part, "file");
        descriptor.streams = child_elements(part)
            .filter(|c| c.name == "Stream")
            .filter_map(parse_stream)
            .collect();
    }
    Some(descriptor)
}

/// All metadata entries of a `MediaContainer` document.
pub fn parse_metadata_list<R: Read>(reader: R) -> Result<Vec<MediaDescriptor>> {
    let root = parse_container(reader)?;
    Ok(child_elements(&root).filter_map(parse_descriptor).collect())
}

/// A `/playQueues/{id}` document.
pub fn parse_play_queue<R: Read>(reader: R) -> Result<RemoteQueue> {
    let root = parse_container(reader)?;
    let id = attr(&root, "playQueueID")
        .ok_or_else(|| CompanionError::xml("MediaContainer without playQueueID"))?;
    Ok(RemoteQueue {
        id,
        version: attr(&root, "playQueueVersion").and_then(|v| v.parse().ok()),
        selected_item_id: attr(&root, "playQueueSelectedItemID"),
        source_uri: attr(&root, "playQueueSourceURI"),
        shuffled: attr_flag(&root, "playQueueShuffled"),
        items: child_elements(&root).filter_map(parse_descriptor).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MOVIE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MediaContainer size="1">
  <Video ratingKey="12" key="/library/metadata/12" type="movie" title="Heat" duration="10200000">
    <Media id="1">
      <Part id="7" file="/srv/movies/heat.mkv">
        <Stream id="100" streamType="1"/>
        <Stream id="101" streamType="2" selected="1" languageCode="eng"/>
        <Stream id="102" streamType="2" languageCode="fra"/>
        <Stream id="103" streamType="3" languageCode="eng"/>
        <Stream id="104" streamType="3" key="/library/streams/104" languageCode="ger"/>
      </Part>
    </Media>
  </Video>
</MediaContainer>"#;

    const QUEUE: &str = r#"<MediaContainer playQueueID="6669" playQueueVersion="3"
        playQueueSelectedItemID="21" playQueueShuffled="0"
        playQueueSourceURI="library://abc/item/%2Flibrary%2Fmetadata%2F300">
  <Track ratingKey="301" type="track" title="One" playQueueItemID="20"/>
  <Track ratingKey="302" type="track" title="Two" playQueueItemID="21"/>
</MediaContainer>"#;

    #[test]
    fn test_parse_movie_with_streams() {
        let items = parse_metadata_list(Cursor::new(MOVIE)).unwrap();
        assert_eq!(items.len(), 1);
        let movie = &items[0];
        assert_eq!(movie.plex_id, "12");
        assert_eq!(movie.plex_type, "movie");
        assert_eq!(movie.duration_ms, Some(10_200_000));
        assert_eq!(movie.file.as_deref(), Some("/srv/movies/heat.mkv"));
        assert_eq!(movie.streams.len(), 5);
        assert!(movie.streams[1].selected);
        assert!(!movie.streams[3].external);
        assert!(movie.streams[4].external);
        assert_eq!(movie.streams[4].language.as_deref(), Some("ger"));
    }

    #[test]
    fn test_parse_play_queue() {
        let queue = parse_play_queue(Cursor::new(QUEUE)).unwrap();
        assert_eq!(queue.id, "6669");
        assert_eq!(queue.version, Some(3));
        assert_eq!(queue.selected_item_id.as_deref(), Some("21"));
        assert!(!queue.shuffled);
        assert_eq!(queue.items.len(), 2);
        assert_eq!(queue.items[1].play_queue_item_id.as_deref(), Some("21"));
        assert_eq!(queue.items[0].key, "/library/metadata/301");
    }

    #[test]
    fn test_empty_queue() {
        let queue =
            parse_play_queue(Cursor::new(r#"<MediaContainer playQueueID="5" playQueueVersion="9"/>"#))
                .unwrap();
        assert!(queue.items.is_empty());
        assert_eq!(queue.version, Some(9));
    }

    #[test]
    fn test_rejects_foreign_document() {
        assert!(parse_metadata_list(Cursor::new("<html/>")).is_err());
        assert!(parse_play_queue(Cursor::new("<MediaContainer/>")).is_err());
        assert!(parse_metadata_list(Cursor::new("not xml")).is_err());
    }
}
