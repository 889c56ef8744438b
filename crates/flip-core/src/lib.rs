pub mod events;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub use events::{
    decode_frame, encode_frame, EventError, EventFrame, FrameError, SyncEvent,
    DEFAULT_MAX_FRAME_BYTES, EVENT_CONNECT, EVENT_DISCONNECT, EVENT_NEW_ITEM_DISCOVERED,
    EVENT_TASKS_UPDATED, EVENT_TASK_STATUS_CHANGED,
};

/// A monitoring task as returned by the task list endpoint.
///
/// Only `id` and `is_running` take part in synchronization; the remaining
/// fields are carried for display and any unknown keys survive in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(deserialize_with = "deserialize_task_id")]
    pub id: i64,
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "deserialize_price")]
    pub min_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_price")]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl Task {
    pub fn new(id: i64, task_name: impl Into<String>, is_running: bool) -> Self {
        Self {
            id,
            task_name: task_name.into(),
            keyword: String::new(),
            description: String::new(),
            is_running,
            enabled: true,
            min_price: None,
            max_price: None,
            cron: None,
            extra: HashMap::new(),
        }
    }
}

/// Payload of `task_status_changed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStatusChanged {
    #[serde(deserialize_with = "deserialize_task_id")]
    pub id: i64,
    pub is_running: bool,
}

/// Payload of `new_item_discovered`: one listing the crawler just matched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredItem {
    #[serde(deserialize_with = "deserialize_item_id")]
    pub item_id: String,
    pub title: String,
    #[serde(default, deserialize_with = "deserialize_price")]
    pub price: Option<f64>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub item_link: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub is_recommended: Option<bool>,
    #[serde(default)]
    pub ai_reason: Option<String>,
    #[serde(default)]
    pub instant_notify: bool,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl DiscoveredItem {
    pub fn new(item_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            title: title.into(),
            price: None,
            image_url: None,
            item_link: None,
            seller_name: None,
            is_recommended: None,
            ai_reason: None,
            instant_notify: false,
            task_name: None,
            extra: HashMap::new(),
        }
    }
}

/// Deserialize a task id that can be either a number or a numeric string.
fn deserialize_task_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("task id out of range")),
        Value::String(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom("expected integer for task id")),
    }
}

/// Deserialize an item id that can be either a string or a number into a String
fn deserialize_item_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) if !s.trim().is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom(
            "expected non-empty string or number for item_id",
        )),
    }
}

// Marketplace prices arrive as numbers, numeric strings ("1,299" or "¥80"),
// or null when the listing hides them.
fn deserialize_price<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|ch| ch.is_ascii_digit() || *ch == '.' || *ch == '-')
                .collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
        _ => Err(serde::de::Error::custom("expected number or string for price")),
    }
}
