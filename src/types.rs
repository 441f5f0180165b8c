use serde_json::Value;

/// One platform update, dispatched by kind. Parsing keeps the raw payload
/// alongside the extracted routing fields so the queue can store it opaquely.
#[derive(Debug, Clone)]
pub enum Update {
    Message(IncomingMessage),
    EditedMessage { chat_id: i64, message_id: i64 },
    Callback { callback_id: String, from_user_id: i64, data: Option<String> },
    Unknown,
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub from_user_id: i64,
    pub sender_name: Option<String>,
    /// Message text, or the caption when the message carries media.
    pub text: Option<String>,
    pub media_group_id: Option<String>,
    pub reply_to: Option<ReplyRef>,
    pub raw: Value,
}

/// Reference to the message an incoming message replies to.
#[derive(Debug, Clone, Copy)]
pub struct ReplyRef {
    pub message_id: i64,
    pub from_user_id: i64,
}

pub fn parse_update(update: &Value) -> Update {
    if let Some(cb) = update.get("callback_query") {
        let callback_id = cb
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let from_user_id = cb
            .get("from")
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let data = cb
            .get("data")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        return Update::Callback {
            callback_id,
            from_user_id,
            data,
        };
    }

    if let Some(msg) = update.get("edited_message") {
        let chat_id = msg
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let message_id = msg
            .get("message_id")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        return Update::EditedMessage {
            chat_id,
            message_id,
        };
    }

    if let Some(msg) = update.get("message") {
        if let Some(parsed) = parse_message(msg) {
            return Update::Message(parsed);
        }
    }

    Update::Unknown
}

pub fn parse_message(msg: &Value) -> Option<IncomingMessage> {
    let chat_id = msg.get("chat")?.get("id")?.as_i64()?;
    let message_id = msg.get("message_id")?.as_i64()?;
    let from = msg.get("from")?;
    let from_user_id = from.get("id")?.as_i64()?;

    let sender_name = from
        .get("first_name")
        .and_then(|v| v.as_str())
        .or_else(|| from.get("username").and_then(|v| v.as_str()))
        .map(|s| s.to_string());

    let text = msg
        .get("text")
        .or_else(|| msg.get("caption"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let media_group_id = msg
        .get("media_group_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let reply_to = msg.get("reply_to_message").and_then(|reply| {
        let message_id = reply.get("message_id")?.as_i64()?;
        let from_user_id = reply.get("from")?.get("id")?.as_i64()?;
        Some(ReplyRef {
            message_id,
            from_user_id,
        })
    });

    Some(IncomingMessage {
        chat_id,
        message_id,
        from_user_id,
        sender_name,
        text,
        media_group_id,
        reply_to,
        raw: msg.clone(),
    })
}

/// A downloadable media entry extracted from a message payload.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub file_id: String,
    pub unique_id: Option<String>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub has_dimensions: bool,
    pub has_duration: bool,
    pub field: &'static str,
}

const MEDIA_FIELDS: [&str; 5] = ["video", "audio", "voice", "video_note", "document"];

/// Collect the media entries of a message. For photos only the largest
/// variant is taken; the platform sends the size ladder smallest-first.
pub fn extract_media(msg: &Value) -> Vec<MediaItem> {
    let mut items = Vec::new();

    if let Some(photo) = msg
        .get("photo")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.last())
    {
        if let Some(item) = media_item_from(photo, "photo") {
            items.push(item);
        }
    }

    for field in MEDIA_FIELDS {
        if let Some(obj) = msg.get(field) {
            if let Some(item) = media_item_from(obj, field) {
                items.push(item);
            }
        }
    }

    items
}

fn media_item_from(obj: &Value, field: &'static str) -> Option<MediaItem> {
    let file_id = obj.get("file_id")?.as_str()?.to_string();
    Some(MediaItem {
        file_id,
        unique_id: obj
            .get("file_unique_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        filename: obj
            .get("file_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        mime_type: obj
            .get("mime_type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        has_dimensions: obj.get("width").is_some() && obj.get("height").is_some(),
        has_duration: obj.get("duration").is_some(),
        field,
    })
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let ext = match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/mp4" => "m4a",
        "audio/x-wav" | "audio/wav" => "wav",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "text/plain" => "txt",
        _ => return None,
    };
    Some(ext)
}

/// Pick a filename for a downloaded file. Preference order: the name the
/// platform supplied, then the declared MIME type, then structural hints
/// (dimensions mean image or video, bare duration means audio), then a
/// generic binary extension.
pub fn infer_filename(item: &MediaItem) -> String {
    if let Some(name) = item.filename.as_ref() {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }

    let stem = item
        .unique_id
        .clone()
        .unwrap_or_else(|| item.file_id.clone());

    let ext = item
        .mime_type
        .as_deref()
        .and_then(extension_for_mime)
        .unwrap_or_else(|| {
            if item.has_dimensions {
                if item.has_duration {
                    "mp4"
                } else {
                    "jpg"
                }
            } else if item.has_duration {
                "ogg"
            } else {
                "bin"
            }
        });

    format!("{}-{}.{}", item.field, stem, ext)
}

/// Bucketed media kind used when fanning a comment's attachments back out to
/// the platform. Photo and video may share a grouped send; audio and
/// documents each go alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_input_type(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }
}

pub fn media_kind(mime_type: Option<&str>, filename: &str) -> MediaKind {
    if let Some(mime) = mime_type {
        if mime.starts_with("image/") {
            return MediaKind::Photo;
        }
        if mime.starts_with("video/") {
            return MediaKind::Video;
        }
        if mime.starts_with("audio/") {
            return MediaKind::Audio;
        }
        return MediaKind::Document;
    }

    let ext = filename.rsplit('.').next().unwrap_or_default().to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" => MediaKind::Photo,
        "mp4" | "mov" | "webm" | "mkv" => MediaKind::Video,
        "mp3" | "ogg" | "m4a" | "wav" | "flac" => MediaKind::Audio,
        _ => MediaKind::Document,
    }
}
