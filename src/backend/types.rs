//! Backend request and response types
//!
//! Preview request identity, image formats, and the subset of the
//! recorded program listing the client understands, including the
//! conversion of legacy channel records and program categories.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Extra query parameters for a preview request.
///
/// `serde_json::Map` keeps keys sorted, so the JSON form used for cache
/// identity does not depend on insertion order.
pub type PreviewParams = Map<String, Value>;

/// Image format of a preview frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewFormat {
    Jpeg,
    Png,
}

impl PreviewFormat {
    /// Select the format for a free-form format string.
    ///
    /// Anything ending in `jpg` or `jpeg` is JPEG, everything else PNG.
    pub fn from_format_str(format: &str) -> Self {
        if format.ends_with("jpg") || format.ends_with("jpeg") {
            PreviewFormat::Jpeg
        } else {
            PreviewFormat::Png
        }
    }

    /// File extension used in the preview API path
    pub fn extension(&self) -> &'static str {
        match self {
            PreviewFormat::Jpeg => ".jpg",
            PreviewFormat::Png => ".png",
        }
    }

    /// MIME type of the image
    pub fn mime(&self) -> &'static str {
        match self {
            PreviewFormat::Jpeg => "image/jpeg",
            PreviewFormat::Png => "image/png",
        }
    }
}

/// A request for the preview image of one recording
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewRequest {
    /// Recorded program ID
    pub id: String,
    /// Format string as given by the caller ("jpeg", "png", ...)
    pub format: String,
    /// Extra query parameters (e.g. `pos`, `width`, `height`)
    pub params: PreviewParams,
}

impl PreviewRequest {
    pub fn new(id: impl Into<String>, format: impl Into<String>, params: PreviewParams) -> Self {
        Self {
            id: id.into(),
            format: format.into(),
            params,
        }
    }

    pub fn image_format(&self) -> PreviewFormat {
        PreviewFormat::from_format_str(&self.format)
    }

    /// JSON form of the params, the third component of the cache identity
    pub fn params_json(&self) -> String {
        Value::Object(self.params.clone()).to_string()
    }

    /// API path of the preview image
    pub fn path(&self) -> String {
        format!(
            "/api/recorded/{}/preview{}",
            urlencoding::encode(&self.id),
            self.image_format().extension()
        )
    }

    /// Params flattened into query string pairs.
    ///
    /// Strings are sent verbatim, other scalars in their JSON form, arrays
    /// as repeated keys, objects as JSON. Nulls are skipped.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (key, value) in &self.params {
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        if let Some(rendered) = render_query_value(item) {
                            pairs.push((key.clone(), rendered));
                        }
                    }
                }
                other => {
                    if let Some(rendered) = render_query_value(other) {
                        pairs.push((key.clone(), rendered));
                    }
                }
            }
        }
        pairs
    }
}

fn render_query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// API path of the full recording as an MPEG-TS stream
pub fn stream_path(id: &str) -> String {
    format!("/api/recorded/{}/watch.m2ts", urlencoding::encode(id))
}

/// Raw preview image body returned by the backend
#[derive(Debug, Clone)]
pub struct PreviewImage {
    /// MIME type of the body
    pub mime: String,
    /// Image bytes (never empty)
    pub bytes: Vec<u8>,
}

/// Program category.
///
/// Categories arrive either as an index into this table or by name; any
/// unknown value falls back to `Etc`, the last entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Category {
    Anime,
    Information,
    News,
    Sports,
    Variety,
    Documentary,
    Drama,
    Music,
    Cinema,
    Theater,
    Hobby,
    Welfare,
    #[default]
    Etc,
}

impl Category {
    /// Category table, in index order
    pub const ALL: [Category; 13] = [
        Category::Anime,
        Category::Information,
        Category::News,
        Category::Sports,
        Category::Variety,
        Category::Documentary,
        Category::Drama,
        Category::Music,
        Category::Cinema,
        Category::Theater,
        Category::Hobby,
        Category::Welfare,
        Category::Etc,
    ];

    /// Name used by the recording server
    pub fn name(&self) -> &'static str {
        match self {
            Category::Anime => "anime",
            Category::Information => "information",
            Category::News => "news",
            Category::Sports => "sports",
            Category::Variety => "variety",
            Category::Documentary => "documentary",
            Category::Drama => "drama",
            Category::Music => "music",
            Category::Cinema => "cinema",
            Category::Theater => "theater",
            Category::Hobby => "hobby",
            Category::Welfare => "welfare",
            Category::Etc => "etc",
        }
    }

    /// Display name
    pub fn locale_name(&self) -> &'static str {
        match self {
            Category::Anime => "アニメ/特撮",
            Category::Information => "情報/ワイドショー",
            Category::News => "ニュース/報道",
            Category::Sports => "スポーツ",
            Category::Variety => "バラエティ",
            Category::Documentary => "ドキュメンタリー/教養",
            Category::Drama => "ドラマ",
            Category::Music => "音楽",
            Category::Cinema => "映画",
            Category::Theater => "劇場/公演",
            Category::Hobby => "趣味/教育",
            Category::Welfare => "福祉",
            Category::Etc => "その他",
        }
    }

    /// Convert an index or a (display) name into a category
    pub fn convert(value: &Value) -> Self {
        let matched = match value {
            Value::Number(n) => n
                .as_u64()
                .and_then(|index| Self::ALL.get(usize::try_from(index).ok()?).copied()),
            Value::String(name) => Self::ALL
                .into_iter()
                .find(|c| c.name() == name.as_str() || c.locale_name() == name.as_str()),
            _ => None,
        };
        matched.unwrap_or(Category::Etc)
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(|value| Category::convert(&value))
    }
}

/// Accept a JSON string or number as a string (`sid` comes as either)
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Leading decimal digits of `value` as a number, ignoring leading
/// whitespace and any trailing text
fn parse_leading_int(value: &str) -> Option<u64> {
    let trimmed = value.trim_start();
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

/// Channel record in the legacy flat form attached to recorded programs
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LegacyChannel {
    /// Broadcast type ("GR", "BS", "CS", ...)
    #[serde(rename = "type")]
    pub channel_type: String,
    /// Physical channel
    pub channel: String,
    /// Service ID, as sent by the server
    #[serde(deserialize_with = "string_or_number")]
    pub sid: String,
    pub name: String,
    /// Server-side service identifier
    pub id: String,
}

impl LegacyChannel {
    /// Numeric service ID, when `sid` starts with digits
    pub fn service_id(&self) -> Option<u64> {
        parse_leading_int(&self.sid)
    }
}

/// A broadcast service on a channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    pub service_id: Option<u64>,
}

/// A physical channel and its services
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Channel {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub channel: String,
    pub name: String,
    pub services: Vec<Service>,
}

/// Resolve a legacy channel record against known channels.
///
/// Returns the known channel with the same type and physical channel, or
/// one built from the legacy record with a single service.
pub fn channel_from_legacy(legacy: &LegacyChannel, channels: &[Channel]) -> Channel {
    channels
        .iter()
        .find(|c| c.channel_type == legacy.channel_type && c.channel == legacy.channel)
        .cloned()
        .unwrap_or_else(|| Channel {
            channel_type: legacy.channel_type.clone(),
            channel: legacy.channel.clone(),
            name: legacy.name.clone(),
            services: vec![Service {
                id: legacy.id.clone(),
                name: legacy.name.clone(),
                service_id: legacy.service_id(),
            }],
        })
}

/// Find the service a legacy channel record refers to.
///
/// `None` when the record has no numeric service ID or the resolved
/// channel carries no service with that ID.
pub fn service_from_legacy(legacy: &LegacyChannel, channels: &[Channel]) -> Option<Service> {
    let service_id = legacy.service_id()?;
    channel_from_legacy(legacy, channels)
        .services
        .into_iter()
        .find(|service| service.service_id == Some(service_id))
}

/// Recorded program entry from `/api/recorded.json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedProgram {
    /// Program ID (used for preview requests)
    pub id: String,
    /// Program title
    #[serde(default)]
    pub title: String,
    /// Start time in milliseconds since epoch
    #[serde(default)]
    pub start: u64,
    /// End time in milliseconds since epoch
    #[serde(default)]
    pub end: u64,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub channel: LegacyChannel,
}

impl RecordedProgram {
    /// Duration in whole minutes
    pub fn minutes(&self) -> u64 {
        self.end.saturating_sub(self.start) / 60_000
    }
}
