//! Transport topic resolution.
//!
//! Devices publish on `tenants/<tenant>/devices/<device>/<channel>`, optionally embedding an ingest
//! credential as `tenants/<tenant>/devices/<device>/ingestKey/<key>/<channel>`.

pub const TENANTS_SEGMENT: &str = "tenants";
pub const DEVICES_SEGMENT: &str = "devices";
pub const INGEST_KEY_SEGMENT: &str = "ingestKey";

const MIN_SEGMENTS: usize = 5;
const CHANNEL_INDEX: usize = 4;

/// Subscription filter covering every tenant, device and channel.
pub fn subscription_filter() -> String {
    format!("{TENANTS_SEGMENT}/+/{DEVICES_SEGMENT}/#")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Telemetry,
    State,
    Other(String),
}

impl Channel {
    fn from_segment(segment: &str) -> Self {
        match segment {
            "telemetry" => Channel::Telemetry,
            "state" => Channel::State,
            other => Channel::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    pub tenant_slug: String,
    pub device_id: String,
    pub channel: Channel,
    pub ingest_key: Option<String>,
}

/// Returns `None` when the topic does not follow the tenant/device layout.
pub fn resolve(topic: &str) -> Option<TopicRoute> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < MIN_SEGMENTS
        || parts[0] != TENANTS_SEGMENT
        || parts[2] != DEVICES_SEGMENT
    {
        return None;
    }

    let tenant_slug = non_empty(parts[1])?;
    let device_id = non_empty(parts[3])?;

    let marker = parts
        .iter()
        .skip(CHANNEL_INDEX)
        .position(|segment| *segment == INGEST_KEY_SEGMENT)
        .map(|offset| offset + CHANNEL_INDEX);

    let (channel, ingest_key) = match marker {
        Some(index) => {
            let key = non_empty(parts.get(index + 1)?)?;
            let channel = non_empty(parts.get(index + 2)?)?;
            (channel, Some(key.to_string()))
        }
        None => (non_empty(parts[CHANNEL_INDEX])?, None),
    };

    Some(TopicRoute {
        tenant_slug: tenant_slug.to_string(),
        device_id: device_id.to_string(),
        channel: Channel::from_segment(channel),
        ingest_key,
    })
}

fn non_empty(segment: &str) -> Option<&str> {
    if segment.is_empty() {
        None
    } else {
        Some(segment)
    }
}
