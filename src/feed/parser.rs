use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use super::date::{parse_pub_date, DateParseError};
use super::sanitize::sanitize_html;
use crate::util::join_text_runs;

/// Nesting limit for feed documents; real feeds stay in single digits.
const MAX_DEPTH: usize = 64;

// ============================================================================
// Errors
// ============================================================================

/// The document as a whole could not be decoded. Retrying the same bytes
/// gives the same error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed XML at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    #[error("Invalid text at byte {position}: {message}")]
    Text { position: u64, message: String },

    #[error("Root element is <{0}>, expected <rss>")]
    NotRss(String),

    #[error("Document ends inside an open element")]
    Truncated,

    #[error("Document has no root element")]
    Empty,

    #[error("Document nesting exceeds {0} levels")]
    TooDeep(usize),
}

/// Why a single item was left out. Other items of the same document are
/// unaffected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ItemError {
    #[error("item has no link")]
    MissingLink,

    #[error(transparent)]
    Date(#[from] DateParseError),

    /// Text inside one of the item's fields could not be decoded, e.g. an
    /// entity XML does not predefine such as `&nbsp;`.
    #[error("item has undecodable text: {0}")]
    Malformed(String),
}

// ============================================================================
// Parsed output
// ============================================================================

/// A decoded and normalized `<channel>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    pub title: String,
    pub link: String,
    /// Sanitized HTML
    pub description: String,
    /// Accepted items in document order
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub title: String,
    pub link: String,
    /// Sanitized HTML
    pub description: String,
    /// Absent when the item has no `pubDate`
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedItem {
    /// Zero-based position among the channel's `<item>` elements
    pub position: usize,
    /// Normalized link, empty if the item had none
    pub link: String,
    pub error: ItemError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub channel: Channel,
    pub rejected: Vec<RejectedItem>,
}

// ============================================================================
// Tag → field mapping
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelField {
    Title,
    Link,
    Description,
}

impl ChannelField {
    const TAGS: [(&'static [u8], Self); 3] = [
        (b"title", Self::Title),
        (b"link", Self::Link),
        (b"description", Self::Description),
    ];

    fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::TAGS.iter().find(|(t, _)| *t == tag).map(|(_, f)| *f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemField {
    Title,
    Link,
    Description,
    PubDate,
}

impl ItemField {
    const TAGS: [(&'static [u8], Self); 4] = [
        (b"title", Self::Title),
        (b"link", Self::Link),
        (b"description", Self::Description),
        (b"pubDate", Self::PubDate),
    ];

    fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::TAGS.iter().find(|(t, _)| *t == tag).map(|(_, f)| *f)
    }
}

/// Text runs per field; `None` until the field's element is seen.
type Runs = Option<Vec<String>>;

#[derive(Debug, Default)]
struct RawChannel {
    title: Runs,
    link: Runs,
    description: Runs,
    items: Vec<RawItem>,
}

impl RawChannel {
    fn slot(&mut self, field: ChannelField) -> &mut Runs {
        match field {
            ChannelField::Title => &mut self.title,
            ChannelField::Link => &mut self.link,
            ChannelField::Description => &mut self.description,
        }
    }
}

#[derive(Debug, Default)]
struct RawItem {
    title: Runs,
    link: Runs,
    description: Runs,
    pub_date: Runs,
    /// First text decoding failure inside the item
    malformed: Option<String>,
}

impl RawItem {
    fn slot(&mut self, field: ItemField) -> &mut Runs {
        match field {
            ItemField::Title => &mut self.title,
            ItemField::Link => &mut self.link,
            ItemField::Description => &mut self.description,
            ItemField::PubDate => &mut self.pub_date,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Channel(ChannelField),
    Item(ItemField),
}

/// Field element currently collecting text, and the depth it was opened at.
#[derive(Debug, Clone, Copy)]
struct Capture {
    target: Target,
    depth: usize,
}

/// Walks the event stream and fills raw records. Only structure is
/// interpreted here; no text is trimmed or validated.
#[derive(Debug, Default)]
struct Decoder {
    depth: usize,
    root_seen: bool,
    channel: Option<RawChannel>,
    in_channel: bool,
    item: Option<RawItem>,
    capture: Option<Capture>,
}

impl Decoder {
    fn open(&mut self, name: &[u8]) -> Result<(), DecodeError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep(MAX_DEPTH));
        }

        match self.depth {
            1 => {
                if name != b"rss" {
                    return Err(DecodeError::NotRss(
                        String::from_utf8_lossy(name).into_owned(),
                    ));
                }
                self.root_seen = true;
            }
            // Only the first channel is read
            2 if name == b"channel" && self.channel.is_none() => {
                self.channel = Some(RawChannel::default());
                self.in_channel = true;
            }
            3 if self.in_channel => {
                if name == b"item" {
                    self.item = Some(RawItem::default());
                } else if let Some(field) = ChannelField::from_tag(name) {
                    self.begin_capture(Target::Channel(field));
                }
            }
            4 if self.item.is_some() => {
                if let Some(field) = ItemField::from_tag(name) {
                    self.begin_capture(Target::Item(field));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self) {
        if matches!(self.capture, Some(c) if c.depth == self.depth) {
            self.capture = None;
        }

        match self.depth {
            2 => self.in_channel = false,
            3 => {
                if let (Some(item), Some(channel)) = (self.item.take(), self.channel.as_mut()) {
                    channel.items.push(item);
                }
            }
            _ => {}
        }
        self.depth = self.depth.saturating_sub(1);
    }

    /// A repeated field element is ignored; the first occurrence wins.
    fn begin_capture(&mut self, target: Target) {
        let depth = self.depth;
        if let Some(slot) = self.slot(target) {
            if slot.is_none() {
                *slot = Some(Vec::new());
                self.capture = Some(Capture { target, depth });
            }
        }
    }

    fn slot(&mut self, target: Target) -> Option<&mut Runs> {
        match target {
            Target::Channel(field) => self.channel.as_mut().map(|c| c.slot(field)),
            Target::Item(field) => self.item.as_mut().map(|i| i.slot(field)),
        }
    }

    /// Undecodable text rejects the item it belongs to; anywhere else it
    /// fails the document.
    fn text_error(&mut self, position: u64, message: String) -> Result<(), DecodeError> {
        match (self.capture, self.item.as_mut()) {
            (
                Some(Capture {
                    target: Target::Item(_),
                    ..
                }),
                Some(item),
            ) => {
                item.malformed
                    .get_or_insert_with(|| format!("byte {}: {}", position, message));
                Ok(())
            }
            _ => Err(DecodeError::Text { position, message }),
        }
    }

    fn push_text(&mut self, text: String) {
        let Some(capture) = self.capture else {
            return;
        };
        if let Some(Some(runs)) = self.slot(capture.target) {
            runs.push(text);
        }
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Decodes an RSS 2.0 document and normalizes its first channel.
///
/// Returns `Ok(None)` for a well-formed `<rss>` document without a channel.
/// Items that fail normalization (no link, unparseable `pubDate`, text that
/// does not decode) are listed in [`ParsedFeed::rejected`]; the rest are
/// returned in document order.
///
/// Element names are matched exactly, so namespaced siblings such as
/// `<atom:link>` do not stand in for `<link>`.
pub fn parse_document(bytes: &[u8]) -> Result<Option<ParsedFeed>, DecodeError> {
    // quick-xml 0.37 never expands DOCTYPE entity declarations; `unescape()`
    // resolves only the predefined XML entities and fails on anything else.
    let mut reader = Reader::from_reader(bytes);
    let mut decoder = Decoder::default();
    let mut buf = Vec::new();

    loop {
        let position = reader.buffer_position() as u64;
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => decoder.open(e.name().as_ref())?,
            Ok(Event::Empty(e)) => {
                decoder.open(e.name().as_ref())?;
                decoder.close();
            }
            Ok(Event::End(_)) => decoder.close(),
            Ok(Event::Text(e)) => {
                if decoder.capture.is_some() {
                    match e.unescape() {
                        Ok(text) => decoder.push_text(text.into_owned()),
                        Err(err) => decoder.text_error(position, err.to_string())?,
                    }
                }
            }
            Ok(Event::CData(e)) => {
                if decoder.capture.is_some() {
                    match std::str::from_utf8(&e) {
                        Ok(text) => decoder.push_text(text.to_string()),
                        Err(err) => decoder.text_error(position, err.to_string())?,
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(source) => return Err(DecodeError::Xml { position, source }),
            _ => {}
        }
        buf.clear();
    }

    if decoder.depth > 0 {
        return Err(DecodeError::Truncated);
    }
    if !decoder.root_seen {
        return Err(DecodeError::Empty);
    }

    Ok(decoder.channel.map(normalize))
}

// ============================================================================
// Normalization
// ============================================================================

fn text(runs: Runs) -> String {
    runs.map(|r| join_text_runs(&r)).unwrap_or_default()
}

fn html(runs: Runs) -> String {
    runs.map(|r| sanitize_html(&r.concat()).trim().to_string())
        .unwrap_or_default()
}

fn normalize(raw: RawChannel) -> ParsedFeed {
    let mut channel = Channel {
        title: text(raw.title),
        link: text(raw.link),
        description: html(raw.description),
        items: Vec::with_capacity(raw.items.len()),
    };
    let mut rejected = Vec::new();

    for (position, raw_item) in raw.items.into_iter().enumerate() {
        match normalize_item(raw_item) {
            Ok(item) => channel.items.push(item),
            Err((link, error)) => rejected.push(RejectedItem {
                position,
                link,
                error,
            }),
        }
    }

    ParsedFeed { channel, rejected }
}

fn normalize_item(raw: RawItem) -> Result<Item, (String, ItemError)> {
    let link = text(raw.link);
    if let Some(message) = raw.malformed {
        return Err((link, ItemError::Malformed(message)));
    }
    if link.is_empty() {
        return Err((link, ItemError::MissingLink));
    }

    // An empty <pubDate/> counts as absent
    let published = match raw.pub_date.map(|r| r.concat()) {
        Some(date) if !date.trim().is_empty() => match parse_pub_date(&date) {
            Ok(at) => Some(at),
            Err(e) => return Err((link, e.into())),
        },
        _ => None,
    };

    Ok(Item {
        title: text(raw.title),
        link,
        description: html(raw.description),
        published,
    })
}
